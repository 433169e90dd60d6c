//! The caller's environment: named values, functions, and files that targets
//! may depend on, plus the scanner that computes their dependency sets.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use rayon::prelude::*;
use serde::Deserialize;

use crate::error::{EngineError, Result};
use crate::lang::ast::Expr;
use crate::lang::{parser, value, Value};

use super::{Analyzer, DepSet, VECTORIZE};

/// One binding in the environment.
#[derive(Debug, Clone)]
pub enum Import {
    /// A function (or any expression evaluating to one); analyzed over its
    /// syntax, identified by its standardized source.
    Function { source: String, expr: Expr },
    /// A plain value; identity is its content hash.
    Value(Value),
    /// A file; identity is its content fingerprint.
    File(PathBuf),
}

#[derive(Debug, Clone, Default)]
pub struct Env {
    imports: BTreeMap<String, Import>,
}

#[derive(Debug, Deserialize)]
struct RawEnv {
    #[serde(default)]
    import: Vec<RawImport>,
}

#[derive(Debug, Deserialize)]
struct RawImport {
    name: String,
    #[serde(default)]
    function: Option<String>,
    #[serde(default)]
    value: Option<toml::Value>,
    #[serde(default)]
    file: Option<PathBuf>,
}

impl Env {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            EngineError::ConfigError(format!(
                "failed to read environment {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let raw: RawEnv = toml::from_str(content)?;
        let mut env = Env::default();
        for row in raw.import {
            match (row.function, row.value, row.file) {
                (Some(source), None, None) => env.insert_function(&row.name, &source)?,
                (None, Some(v), None) => env.insert_value(&row.name, value::from_toml(&v)),
                (None, None, Some(path)) => env.insert_file(&row.name, path),
                _ => {
                    return Err(EngineError::ConfigError(format!(
                        "import '{}' must set exactly one of function, value, file",
                        row.name
                    )))
                }
            }
        }
        Ok(env)
    }

    pub fn insert_function(&mut self, name: &str, source: &str) -> Result<()> {
        let expr = parser::parse(source)
            .map_err(|e| EngineError::ParseError(format!("in import '{}': {}", name, e)))?;
        self.imports.insert(
            name.to_string(),
            Import::Function {
                source: source.to_string(),
                expr,
            },
        );
        Ok(())
    }

    pub fn insert_value(&mut self, name: &str, value: Value) {
        self.imports.insert(name.to_string(), Import::Value(value));
    }

    pub fn insert_file(&mut self, name: &str, path: impl Into<PathBuf>) {
        self.imports
            .insert(name.to_string(), Import::File(path.into()));
    }

    pub fn get(&self, name: &str) -> Option<&Import> {
        self.imports.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.imports.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Import)> {
        self.imports.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.imports.keys()
    }

    pub fn len(&self) -> usize {
        self.imports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.imports.is_empty()
    }
}

/// Compute the dependency set of every binding in the environment.
///
/// Function imports are analyzed over their syntax; values and files have no
/// dependencies of their own. Globals that resolve to other bindings become
/// edges when the graph is built.
pub fn scan(env: &Env, analyzer: &Analyzer<'_>) -> BTreeMap<String, DepSet> {
    env.imports
        .par_iter()
        .map(|(name, import)| (name.clone(), scan_one(import, analyzer)))
        .collect::<Vec<_>>()
        .into_iter()
        .collect()
}

fn scan_one(import: &Import, analyzer: &Analyzer<'_>) -> DepSet {
    match import {
        Import::Value(_) | Import::File(_) => DepSet::default(),
        Import::Function { expr, .. } => {
            let mut deps = match expr {
                Expr::Function { params, body } => analyzer.analyze_function(&crate::lang::Function {
                    params: params.clone(),
                    body: (**body).clone(),
                    inner: None,
                }),
                // Standard wrapper shape: unwrap `vectorize(f)` and analyze
                // the inner function instead of the wrapper scaffolding.
                Expr::Call { head: _, args } if expr.call_head() == Some(VECTORIZE) => {
                    match args.first().map(|a| &a.value) {
                        Some(Expr::Function { params, body }) => {
                            analyzer.analyze_function(&crate::lang::Function {
                                params: params.clone(),
                                body: (**body).clone(),
                                inner: None,
                            })
                        }
                        Some(other) => analyzer.analyze(other),
                        None => DepSet::default(),
                    }
                }
                other => analyzer.analyze(other),
            };
            deps.writes.clear();
            deps.subdocs.clear();
            deps
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_env_from_toml() {
        let env = Env::from_toml(
            r#"
            [[import]]
            name = "f"
            function = "fn(x) x + offset"

            [[import]]
            name = "offset"
            value = 10

            [[import]]
            name = "raw"
            file = "data/raw.csv"
            "#,
        )
        .unwrap();
        assert_eq!(env.len(), 3);
        assert_matches!(env.get("f"), Some(Import::Function { .. }));
        assert_matches!(env.get("offset"), Some(Import::Value(Value::Int(10))));
        assert_matches!(env.get("raw"), Some(Import::File(_)));
    }

    #[test]
    fn test_env_rejects_ambiguous_import() {
        let result = Env::from_toml(
            r#"
            [[import]]
            name = "x"
            value = 1
            file = "x.txt"
            "#,
        );
        assert_matches!(result, Err(EngineError::ConfigError(_)));
    }

    #[test]
    fn test_scan_links_function_to_other_imports() {
        let mut env = Env::default();
        env.insert_function("f", "fn(x) x + offset").unwrap();
        env.insert_value("offset", Value::Int(1));

        let workdir = PathBuf::from(".");
        let analyzer = Analyzer::new(&workdir);
        let scanned = scan(&env, &analyzer);
        assert!(scanned["f"].globals.contains("offset"));
        assert!(scanned["offset"].is_empty());
    }

    #[test]
    fn test_scan_vectorized_import_unwraps() {
        let mut env = Env::default();
        env.insert_function("g", "vectorize(fn(x) x * scale)").unwrap();

        let workdir = PathBuf::from(".");
        let analyzer = Analyzer::new(&workdir);
        let scanned = scan(&env, &analyzer);
        assert!(scanned["g"].globals.contains("scale"));
        assert!(!scanned["g"].globals.contains("vectorize"));
    }
}
