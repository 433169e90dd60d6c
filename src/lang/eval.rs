//! Tree-walking evaluator. A command runs in a prepared [`Scope`] holding the
//! values of everything it depends on plus the deterministic per-target seed.

use std::collections::HashMap;
use std::path::PathBuf;

use crate::analyze::{FILE_IN, FILE_OUT, IGNORE, LOAD, READ, SUBDOC_IN, VECTORIZE};
use crate::error::{EngineError, Result};

use super::ast::{Arg, BinaryOp, Expr, UnaryOp};
use super::value::{Function, Value};

const MAX_CALL_DEPTH: u32 = 256;

/// Names the evaluator resolves without a scope binding. Namespaced calls
/// are resolved separately.
pub fn is_builtin(name: &str) -> bool {
    matches!(
        name,
        "read_file" | "write_file" | "lines" | "length" | "sum" | "concat" | "seed"
    )
}

#[derive(Debug, Clone)]
pub struct Scope {
    /// Target the evaluation is running on behalf of; reported in errors.
    pub owner: String,
    pub vars: HashMap<String, Value>,
    pub seed: u64,
    pub workdir: PathBuf,
    depth: u32,
}

impl Scope {
    pub fn new(owner: impl Into<String>) -> Self {
        Scope {
            owner: owner.into(),
            vars: HashMap::new(),
            seed: 0,
            workdir: PathBuf::from("."),
            depth: 0,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_workdir(mut self, workdir: impl Into<PathBuf>) -> Self {
        self.workdir = workdir.into();
        self
    }

    pub fn bind(&mut self, name: impl Into<String>, value: Value) {
        self.vars.insert(name.into(), value);
    }

    fn error(&self, message: impl std::fmt::Display) -> EngineError {
        EngineError::EvalError {
            target: self.owner.clone(),
            message: message.to_string(),
        }
    }
}

/// Evaluate an expression in a scope.
pub fn eval(expr: &Expr, scope: &Scope) -> Result<Value> {
    match expr {
        Expr::Int(n) => Ok(Value::Int(*n)),
        Expr::Float(f) => Ok(Value::Float(*f)),
        Expr::Str(s) => Ok(Value::Str(s.clone())),
        Expr::Ident(name) => scope
            .vars
            .get(name)
            .cloned()
            .ok_or_else(|| scope.error(format!("unknown identifier '{}'", name))),
        Expr::Unary {
            op: UnaryOp::Neg,
            operand,
        } => match eval(operand, scope)? {
            Value::Int(n) => Ok(Value::Int(-n)),
            Value::Float(f) => Ok(Value::Float(-f)),
            other => Err(scope.error(format!("cannot negate {}", other.type_name()))),
        },
        Expr::Binary { op, lhs, rhs } => {
            let lhs = eval(lhs, scope)?;
            let rhs = eval(rhs, scope)?;
            binary_op(*op, lhs, rhs, scope)
        }
        Expr::List(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(eval(item, scope)?);
            }
            Ok(Value::List(out))
        }
        Expr::Function { params, body } => Ok(Value::Function(Function {
            params: params.clone(),
            body: (**body).clone(),
            inner: None,
        })),
        Expr::Call { head, args } => eval_call(head, args, scope),
    }
}

fn binary_op(op: BinaryOp, lhs: Value, rhs: Value, scope: &Scope) -> Result<Value> {
    use Value::*;
    match (op, lhs, rhs) {
        (BinaryOp::Add, Str(a), Str(b)) => Ok(Str(a + &b)),
        (BinaryOp::Add, List(mut a), List(b)) => {
            a.extend(b);
            Ok(List(a))
        }
        (op, Int(a), Int(b)) => match op {
            BinaryOp::Add => Ok(Int(a.wrapping_add(b))),
            BinaryOp::Sub => Ok(Int(a.wrapping_sub(b))),
            BinaryOp::Mul => Ok(Int(a.wrapping_mul(b))),
            BinaryOp::Div => {
                if b == 0 {
                    Err(scope.error("division by zero"))
                } else {
                    Ok(Int(a / b))
                }
            }
        },
        (op, a, b) => {
            let (x, y) = match (as_float(&a), as_float(&b)) {
                (Some(x), Some(y)) => (x, y),
                _ => {
                    return Err(scope.error(format!(
                        "cannot apply '{}' to {} and {}",
                        op.symbol(),
                        a.type_name(),
                        b.type_name()
                    )))
                }
            };
            match op {
                BinaryOp::Add => Ok(Float(x + y)),
                BinaryOp::Sub => Ok(Float(x - y)),
                BinaryOp::Mul => Ok(Float(x * y)),
                BinaryOp::Div => {
                    if y == 0.0 {
                        Err(scope.error("division by zero"))
                    } else {
                        Ok(Float(x / y))
                    }
                }
            }
        }
    }
}

fn as_float(value: &Value) -> Option<f64> {
    match value {
        Value::Int(n) => Some(*n as f64),
        Value::Float(f) => Some(*f),
        _ => None,
    }
}

fn eval_call(head: &Expr, args: &[Arg], scope: &Scope) -> Result<Value> {
    if let Expr::Ident(name) = head {
        match name.as_str() {
            LOAD => return eval_load(args, scope),
            READ => return eval_load(args, scope),
            FILE_IN | FILE_OUT | SUBDOC_IN => return eval_path_marker(name, args, scope),
            IGNORE => {
                return match args.first() {
                    Some(arg) => eval(&arg.value, scope),
                    None => Ok(Value::Null),
                }
            }
            VECTORIZE => return eval_vectorize(args, scope),
            _ => {}
        }

        if let Some(value) = scope.vars.get(name) {
            return match value {
                Value::Function(fun) => {
                    let fun = fun.clone();
                    apply(&fun, args, scope)
                }
                other => Err(scope.error(format!(
                    "'{}' is a {} and cannot be called",
                    name,
                    other.type_name()
                ))),
            };
        }

        if let Some(result) = eval_builtin(name, args, scope)? {
            return Ok(result);
        }

        return Err(scope.error(format!("unknown function '{}'", name)));
    }

    // Computed head: anything that evaluates to a function is callable.
    match eval(head, scope)? {
        Value::Function(fun) => apply(&fun, args, scope),
        other => Err(scope.error(format!("{} is not callable", other.type_name()))),
    }
}

/// `load(a, b)` / `read(a)`: dependency names evaluate to the bound values.
/// Names come from identifier or string arguments, plus any `list = [...]`
/// argument.
fn eval_load(args: &[Arg], scope: &Scope) -> Result<Value> {
    let mut values = Vec::new();
    for name in literal_load_names(args) {
        let value = scope
            .vars
            .get(&name)
            .cloned()
            .ok_or_else(|| scope.error(format!("'{}' is not loaded in this scope", name)))?;
        values.push(value);
    }
    match values.len() {
        0 => Ok(Value::Null),
        1 => Ok(values.into_iter().next().unwrap()),
        _ => Ok(Value::List(values)),
    }
}

/// Literal names mentioned by a `load`/`read` call, in argument order.
pub fn literal_load_names(args: &[Arg]) -> Vec<String> {
    let mut names = Vec::new();
    for arg in args {
        match &arg.name {
            None => match &arg.value {
                Expr::Ident(name) => names.push(name.clone()),
                Expr::Str(name) => names.push(name.clone()),
                _ => {}
            },
            Some(key) if key == "list" => {
                if let Expr::List(items) = &arg.value {
                    for item in items {
                        match item {
                            Expr::Ident(name) => names.push(name.clone()),
                            Expr::Str(name) => names.push(name.clone()),
                            _ => {}
                        }
                    }
                }
            }
            Some(_) => {}
        }
    }
    names
}

/// `file_in` / `file_out` / `subdoc_in` evaluate to their path argument(s).
fn eval_path_marker(name: &str, args: &[Arg], scope: &Scope) -> Result<Value> {
    let mut paths = Vec::new();
    for arg in args {
        match eval(&arg.value, scope)? {
            Value::Str(path) => paths.push(Value::Str(path)),
            other => {
                return Err(scope.error(format!(
                    "{} expects string paths, got {}",
                    name,
                    other.type_name()
                )))
            }
        }
    }
    match paths.len() {
        0 => Err(scope.error(format!("{} expects at least one path", name))),
        1 => Ok(paths.into_iter().next().unwrap()),
        _ => Ok(Value::List(paths)),
    }
}

fn eval_vectorize(args: &[Arg], scope: &Scope) -> Result<Value> {
    let arg = args
        .first()
        .ok_or_else(|| scope.error("vectorize expects a function argument"))?;
    match eval(&arg.value, scope)? {
        Value::Function(inner) => Ok(Value::Function(Function {
            params: inner.params.clone(),
            body: inner.body.clone(),
            inner: Some(Box::new(inner)),
        })),
        other => Err(scope.error(format!("vectorize expects a function, got {}", other.type_name()))),
    }
}

fn apply(fun: &Function, args: &[Arg], scope: &Scope) -> Result<Value> {
    if scope.depth >= MAX_CALL_DEPTH {
        return Err(scope.error("call depth limit exceeded"));
    }

    let mut evaled: Vec<(Option<&str>, Value)> = Vec::with_capacity(args.len());
    for arg in args {
        evaled.push((arg.name.as_deref(), eval(&arg.value, scope)?));
    }

    if let Some(inner) = &fun.inner {
        return apply_vectorized(inner, &evaled, scope);
    }
    apply_values(fun, &evaled, scope)
}

fn apply_values(fun: &Function, args: &[(Option<&str>, Value)], scope: &Scope) -> Result<Value> {
    let mut bindings: HashMap<String, Value> = HashMap::new();
    let mut positional = fun.params.iter();
    for (name, value) in args {
        match name {
            Some(name) => {
                if !fun.params.iter().any(|p| p == name) {
                    return Err(scope.error(format!("unknown argument '{}'", name)));
                }
                bindings.insert((*name).to_string(), value.clone());
            }
            None => loop {
                match positional.next() {
                    Some(param) => {
                        if bindings.contains_key(param) {
                            continue;
                        }
                        bindings.insert(param.clone(), value.clone());
                        break;
                    }
                    None => return Err(scope.error("too many arguments")),
                }
            },
        }
    }
    for param in &fun.params {
        if !bindings.contains_key(param) {
            return Err(scope.error(format!("missing argument '{}'", param)));
        }
    }

    let mut inner_scope = scope.clone();
    inner_scope.depth += 1;
    for (param, value) in bindings {
        inner_scope.vars.insert(param, value);
    }
    eval(&fun.body, &inner_scope)
}

/// Vectorized application: list arguments are mapped element-wise over the
/// inner function, scalars broadcast.
fn apply_vectorized(
    inner: &Function,
    args: &[(Option<&str>, Value)],
    scope: &Scope,
) -> Result<Value> {
    let width = args
        .iter()
        .filter_map(|(_, v)| match v {
            Value::List(items) => Some(items.len()),
            _ => None,
        })
        .max();

    let width = match width {
        None => return apply_values(inner, args, scope),
        Some(n) => n,
    };

    let mut out = Vec::with_capacity(width);
    for i in 0..width {
        let element_args: Vec<(Option<&str>, Value)> = args
            .iter()
            .map(|(name, value)| {
                let element = match value {
                    Value::List(items) => items
                        .get(i)
                        .cloned()
                        .ok_or_else(|| scope.error("vectorized arguments have unequal lengths")),
                    scalar => Ok(scalar.clone()),
                };
                element.map(|v| (*name, v))
            })
            .collect::<Result<_>>()?;
        out.push(apply_values(inner, &element_args, scope)?);
    }
    Ok(Value::List(out))
}

fn eval_builtin(name: &str, args: &[Arg], scope: &Scope) -> Result<Option<Value>> {
    let value = match name {
        "read_file" => {
            let path = single_string_arg(name, args, scope)?;
            let full = scope.workdir.join(&path);
            let content = std::fs::read_to_string(&full).map_err(|e| {
                scope.error(format!("cannot read file '{}': {}", full.display(), e))
            })?;
            Value::Str(content)
        }
        "write_file" => {
            let path = match args.first() {
                Some(arg) => match eval(&arg.value, scope)? {
                    Value::Str(p) => p,
                    other => {
                        return Err(
                            scope.error(format!("write_file expects a path, got {}", other.type_name()))
                        )
                    }
                },
                None => return Err(scope.error("write_file expects a path and a value")),
            };
            let content = match args.get(1) {
                Some(arg) => eval(&arg.value, scope)?,
                None => return Err(scope.error("write_file expects a value to write")),
            };
            let full = scope.workdir.join(&path);
            if let Some(parent) = full.parent() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    scope.error(format!("cannot create '{}': {}", parent.display(), e))
                })?;
            }
            std::fs::write(&full, content.to_string()).map_err(|e| {
                scope.error(format!("cannot write file '{}': {}", full.display(), e))
            })?;
            Value::Str(path)
        }
        "lines" => {
            let text = single_string_arg(name, args, scope)?;
            Value::List(text.lines().map(|l| Value::Str(l.to_string())).collect())
        }
        "length" => match eval_single(name, args, scope)? {
            Value::List(items) => Value::Int(items.len() as i64),
            Value::Str(s) => Value::Int(s.chars().count() as i64),
            other => return Err(scope.error(format!("length of {} is undefined", other.type_name()))),
        },
        "sum" => numeric_fold(name, args, scope, 0.0, |acc, x| acc + x)?,
        "concat" => {
            let mut out = String::new();
            for arg in args {
                out.push_str(&eval(&arg.value, scope)?.to_string());
            }
            Value::Str(out)
        }
        "seed" => Value::Int(scope.seed as i64),
        _ if super::ast::is_namespaced(name) => match eval_namespaced(name, args, scope)? {
            Some(v) => v,
            None => return Ok(None),
        },
        _ => return Ok(None),
    };
    Ok(Some(value))
}

fn eval_namespaced(name: &str, args: &[Arg], scope: &Scope) -> Result<Option<Value>> {
    let value = match name {
        "str::upper" => Value::Str(single_string_arg(name, args, scope)?.to_uppercase()),
        "str::lower" => Value::Str(single_string_arg(name, args, scope)?.to_lowercase()),
        "str::trim" => Value::Str(single_string_arg(name, args, scope)?.trim().to_string()),
        "str::join" => {
            let list = match eval_single(name, args, scope)? {
                Value::List(items) => items,
                other => {
                    return Err(scope.error(format!("str::join expects a list, got {}", other.type_name())))
                }
            };
            let sep = match args.get(1) {
                Some(arg) => match eval(&arg.value, scope)? {
                    Value::Str(s) => s,
                    other => {
                        return Err(scope
                            .error(format!("str::join separator must be a string, got {}", other.type_name())))
                    }
                },
                None => String::new(),
            };
            let parts: Vec<String> = list.iter().map(|v| v.to_string()).collect();
            Value::Str(parts.join(&sep))
        }
        "math::sum" => numeric_fold(name, args, scope, 0.0, |acc, x| acc + x)?,
        "math::min" => numeric_extreme(name, args, scope, f64::min)?,
        "math::max" => numeric_extreme(name, args, scope, f64::max)?,
        "math::abs" => match eval_single(name, args, scope)? {
            Value::Int(n) => Value::Int(n.abs()),
            Value::Float(f) => Value::Float(f.abs()),
            other => return Err(scope.error(format!("math::abs of {} is undefined", other.type_name()))),
        },
        _ => return Ok(None),
    };
    Ok(Some(value))
}

fn eval_single(name: &str, args: &[Arg], scope: &Scope) -> Result<Value> {
    match args.first() {
        Some(arg) => eval(&arg.value, scope),
        None => Err(scope.error(format!("{} expects an argument", name))),
    }
}

fn single_string_arg(name: &str, args: &[Arg], scope: &Scope) -> Result<String> {
    match eval_single(name, args, scope)? {
        Value::Str(s) => Ok(s),
        other => Err(scope.error(format!("{} expects a string, got {}", name, other.type_name()))),
    }
}

fn numeric_fold(
    name: &str,
    args: &[Arg],
    scope: &Scope,
    init: f64,
    fold: fn(f64, f64) -> f64,
) -> Result<Value> {
    let mut acc = init;
    let mut all_int = true;
    for arg in args {
        for value in flatten_numeric(name, eval(&arg.value, scope)?, scope)? {
            match value {
                Value::Int(n) => acc = fold(acc, n as f64),
                Value::Float(f) => {
                    all_int = false;
                    acc = fold(acc, f);
                }
                _ => unreachable!(),
            }
        }
    }
    if all_int {
        Ok(Value::Int(acc as i64))
    } else {
        Ok(Value::Float(acc))
    }
}

fn numeric_extreme(
    name: &str,
    args: &[Arg],
    scope: &Scope,
    pick: fn(f64, f64) -> f64,
) -> Result<Value> {
    let mut acc: Option<f64> = None;
    let mut all_int = true;
    for arg in args {
        for value in flatten_numeric(name, eval(&arg.value, scope)?, scope)? {
            let x = match value {
                Value::Int(n) => n as f64,
                Value::Float(f) => {
                    all_int = false;
                    f
                }
                _ => unreachable!(),
            };
            acc = Some(match acc {
                None => x,
                Some(a) => pick(a, x),
            });
        }
    }
    let acc = acc.ok_or_else(|| scope.error(format!("{} expects at least one number", name)))?;
    if all_int {
        Ok(Value::Int(acc as i64))
    } else {
        Ok(Value::Float(acc))
    }
}

fn flatten_numeric(name: &str, value: Value, scope: &Scope) -> Result<Vec<Value>> {
    match value {
        Value::Int(_) | Value::Float(_) => Ok(vec![value]),
        Value::List(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.extend(flatten_numeric(name, item, scope)?);
            }
            Ok(out)
        }
        other => Err(scope.error(format!("{} expects numbers, got {}", name, other.type_name()))),
    }
}
