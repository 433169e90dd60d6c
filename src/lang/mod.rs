//! The command expression language: a small, parseable, evaluable expression
//! syntax the engine treats as opaque. The engine core only relies on the
//! parser producing a syntax tree and the evaluator running a command in a
//! prepared scope.

pub mod ast;
pub mod deparse;
pub mod eval;
pub mod parser;
pub mod value;

pub use ast::{Arg, BinaryOp, Expr, UnaryOp};
pub use eval::{is_builtin as eval_builtin_exists, Scope};
pub use value::{Function, Value};
