//! Standardized deparse: renders an expression back to canonical source text.
//!
//! The canonical form has single spaces around binary operators, all string
//! literals double-quoted, no trailing trivia, and `ignore(...)` hunks erased
//! to `ignore()` so that edits inside an ignored block never change the
//! command hash.

use super::ast::{Arg, Expr, UnaryOp};
use crate::analyze::IGNORE;

pub fn standardized(expr: &Expr) -> String {
    let mut out = String::new();
    write_expr(expr, &mut out);
    out
}

fn write_expr(expr: &Expr, out: &mut String) {
    match expr {
        Expr::Int(n) => out.push_str(&n.to_string()),
        Expr::Float(f) => {
            let text = format!("{}", f);
            out.push_str(&text);
            if !text.contains('.') && !text.contains('e') && !text.contains("inf") {
                out.push_str(".0");
            }
        }
        Expr::Str(s) => write_string(s, out),
        Expr::Ident(name) => out.push_str(name),
        Expr::Unary {
            op: UnaryOp::Neg,
            operand,
        } => {
            out.push('-');
            write_operand(operand, out);
        }
        Expr::Binary { op, lhs, rhs } => {
            write_operand(lhs, out);
            out.push(' ');
            out.push_str(op.symbol());
            out.push(' ');
            write_operand(rhs, out);
        }
        Expr::Call { head, args } => {
            write_expr(head, out);
            out.push('(');
            if expr.call_head() != Some(IGNORE) {
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    write_arg(arg, out);
                }
            }
            out.push(')');
        }
        Expr::List(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                write_expr(item, out);
            }
            out.push(']');
        }
        Expr::Function { params, body } => {
            out.push_str("fn(");
            for (i, param) in params.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                out.push_str(param);
            }
            out.push_str(") ");
            write_expr(body, out);
        }
    }
}

// Compound sub-expressions are parenthesized; the canonical text re-parses
// to the same tree regardless of the precedence the author relied on.
fn write_operand(expr: &Expr, out: &mut String) {
    let needs_parens = matches!(expr, Expr::Binary { .. } | Expr::Function { .. });
    if needs_parens {
        out.push('(');
        write_expr(expr, out);
        out.push(')');
    } else {
        write_expr(expr, out);
    }
}

fn write_arg(arg: &Arg, out: &mut String) {
    if let Some(name) = &arg.name {
        out.push_str(name);
        out.push_str(" = ");
    }
    write_expr(&arg.value, out);
}

fn write_string(s: &str, out: &mut String) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            other => out.push(other),
        }
    }
    out.push('"');
}
