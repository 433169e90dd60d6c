//! Static dependency analysis of command expressions.
//!
//! The analyzer walks a parsed command and classifies every reference it
//! finds: other targets (`load`/`read` markers or free identifiers), files
//! read (`file_in`), files written (`file_out`), sub-documents (`subdoc_in`),
//! namespaced calls, and ignored hunks (`ignore`). The result is a pure
//! function of the command's syntax.

pub mod imports;
pub mod subdoc;

use std::collections::BTreeSet;
use std::path::Path;

use tracing::warn;

use crate::lang::ast::{is_namespaced, Arg, Expr};
use crate::lang::eval::literal_load_names;
use crate::lang::Function;

pub use imports::{scan, Env, Import};
pub use subdoc::{MarkdownExtractor, SubdocExtractor};

pub const LOAD: &str = "load";
pub const READ: &str = "read";
pub const FILE_IN: &str = "file_in";
pub const FILE_OUT: &str = "file_out";
pub const SUBDOC_IN: &str = "subdoc_in";
pub const IGNORE: &str = "ignore";
pub const VECTORIZE: &str = "vectorize";

/// Identifiers with analyzer-level meaning; never reported as globals.
pub const MARKER_NAMES: &[&str] = &[LOAD, READ, FILE_IN, FILE_OUT, SUBDOC_IN, IGNORE, VECTORIZE];

/// The classified dependency set of one expression.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DepSet {
    /// Free identifiers that may resolve to targets or imports.
    pub globals: BTreeSet<String>,
    /// Target names mentioned by `load`/`read` markers (and sub-documents).
    pub loads: BTreeSet<String>,
    /// Files read via `file_in`.
    pub reads: BTreeSet<String>,
    /// Files written via `file_out`.
    pub writes: BTreeSet<String>,
    /// Sub-documents referenced via `subdoc_in`.
    pub subdocs: BTreeSet<String>,
    /// Namespace-qualified calls (`pkg::fn`).
    pub namespaced: BTreeSet<String>,
    /// Number of `ignore(...)` hunks that were skipped.
    pub ignored: usize,
}

impl DepSet {
    pub fn is_empty(&self) -> bool {
        self.globals.is_empty()
            && self.loads.is_empty()
            && self.reads.is_empty()
            && self.writes.is_empty()
            && self.subdocs.is_empty()
            && self.namespaced.is_empty()
    }

    /// Names that may resolve to graph nodes (targets or imports).
    pub fn linkable_names(&self) -> impl Iterator<Item = &String> {
        self.globals.iter().chain(self.loads.iter())
    }
}

pub struct Analyzer<'a> {
    pub workdir: &'a Path,
    pub extractor: Option<&'a dyn SubdocExtractor>,
}

impl<'a> Analyzer<'a> {
    pub fn new(workdir: &'a Path) -> Self {
        Analyzer {
            workdir,
            extractor: None,
        }
    }

    pub fn with_extractor(mut self, extractor: &'a dyn SubdocExtractor) -> Self {
        self.extractor = Some(extractor);
        self
    }

    /// Analyze one expression into its dependency set.
    pub fn analyze(&self, expr: &Expr) -> DepSet {
        let mut out = DepSet::default();
        self.walk(expr, &mut out);

        // Keep only identifiers a generic free-variable pass agrees are free;
        // this strips function formals and shadowed names.
        let mut free = BTreeSet::new();
        free_vars(expr, &mut Vec::new(), &mut free);
        out.globals.retain(|g| free.contains(g));
        out.globals.retain(|g| !MARKER_NAMES.contains(&g.as_str()));
        out
    }

    /// Analyze the command of a named target; self-references are dropped.
    pub fn analyze_target(&self, name: &str, expr: &Expr) -> DepSet {
        let mut out = self.analyze(expr);
        out.globals.remove(name);
        out.loads.remove(name);
        out
    }

    /// Analyze an imported function. Vectorized wrappers are unwrapped to the
    /// inner function; imports keep their file reads but cannot declare
    /// outputs or sub-documents.
    pub fn analyze_function(&self, fun: &Function) -> DepSet {
        if let Some(inner) = &fun.inner {
            return self.analyze_function(inner);
        }
        let as_expr = Expr::Function {
            params: fun.params.clone(),
            body: Box::new(fun.body.clone()),
        };
        let mut out = self.analyze(&as_expr);
        out.writes.clear();
        out.subdocs.clear();
        out
    }

    fn walk(&self, expr: &Expr, out: &mut DepSet) {
        match expr {
            Expr::Int(_) | Expr::Float(_) | Expr::Str(_) => {}
            Expr::Ident(name) => {
                if is_namespaced(name) {
                    out.namespaced.insert(name.clone());
                } else {
                    out.globals.insert(name.clone());
                }
            }
            Expr::Unary { operand, .. } => self.walk(operand, out),
            Expr::Binary { lhs, rhs, .. } => {
                self.walk(lhs, out);
                self.walk(rhs, out);
            }
            Expr::List(items) => {
                for item in items {
                    self.walk(item, out);
                }
            }
            Expr::Function { body, .. } => self.walk(body, out),
            Expr::Call { head, args } => self.walk_call(head, args, out),
        }
    }

    fn walk_call(&self, head: &Expr, args: &[Arg], out: &mut DepSet) {
        let head_name = match head {
            Expr::Ident(name) => Some(name.as_str()),
            _ => None,
        };

        match head_name {
            Some(LOAD) | Some(READ) => {
                for name in literal_load_names(args) {
                    out.loads.insert(name);
                }
                // Variable-sourced names are globals of the surrounding
                // expression.
                for arg in args {
                    if arg.name.is_none() && !matches!(arg.value, Expr::Ident(_) | Expr::Str(_)) {
                        self.walk(&arg.value, out);
                    }
                }
            }
            Some(FILE_IN) => self.walk_path_marker(args, out, |out, p| {
                out.reads.insert(p);
            }),
            Some(FILE_OUT) => self.walk_path_marker(args, out, |out, p| {
                out.writes.insert(p);
            }),
            Some(SUBDOC_IN) => {
                let mut paths = Vec::new();
                for arg in args {
                    match &arg.value {
                        Expr::Str(path) => paths.push(normalize_path(path)),
                        other => self.walk(other, out),
                    }
                }
                for path in paths {
                    out.subdocs.insert(path.clone());
                    for name in self.extract_subdoc(&path) {
                        out.loads.insert(name);
                    }
                }
            }
            Some(IGNORE) => {
                out.ignored += 1;
            }
            Some(name) if is_namespaced(name) => {
                out.namespaced.insert(name.to_string());
                for arg in args {
                    self.walk(&arg.value, out);
                }
            }
            Some(name) => {
                if !MARKER_NAMES.contains(&name) {
                    out.globals.insert(name.to_string());
                }
                for arg in args {
                    self.walk(&arg.value, out);
                }
            }
            None => {
                self.walk(head, out);
                for arg in args {
                    self.walk(&arg.value, out);
                }
            }
        }
    }

    fn walk_path_marker(
        &self,
        args: &[Arg],
        out: &mut DepSet,
        mut record: impl FnMut(&mut DepSet, String),
    ) {
        for arg in args {
            match &arg.value {
                Expr::Str(path) => record(out, normalize_path(path)),
                other => self.walk(other, out),
            }
        }
    }

    fn extract_subdoc(&self, path: &str) -> Vec<String> {
        let extractor = match self.extractor {
            Some(e) => e,
            None => return Vec::new(),
        };
        let full = self.workdir.join(path);
        match extractor.extract(&full) {
            Ok(names) => names,
            Err(e) => {
                warn!(subdoc = %path, error = %e, "failed to scan sub-document, skipping");
                Vec::new()
            }
        }
    }
}

/// Quoted-path normalization: forward slashes, no leading `./`.
pub fn normalize_path(path: &str) -> String {
    let normalized = path.trim().replace('\\', "/");
    normalized
        .strip_prefix("./")
        .map(|s| s.to_string())
        .unwrap_or(normalized)
}

/// Generic free-variable pass: identifiers not bound by an enclosing
/// function's formals.
fn free_vars(expr: &Expr, bound: &mut Vec<String>, out: &mut BTreeSet<String>) {
    match expr {
        Expr::Int(_) | Expr::Float(_) | Expr::Str(_) => {}
        Expr::Ident(name) => {
            if !is_namespaced(name) && !bound.iter().any(|b| b == name) {
                out.insert(name.clone());
            }
        }
        Expr::Unary { operand, .. } => free_vars(operand, bound, out),
        Expr::Binary { lhs, rhs, .. } => {
            free_vars(lhs, bound, out);
            free_vars(rhs, bound, out);
        }
        Expr::List(items) => {
            for item in items {
                free_vars(item, bound, out);
            }
        }
        Expr::Function { params, body } => {
            let depth = bound.len();
            bound.extend(params.iter().cloned());
            free_vars(body, bound, out);
            bound.truncate(depth);
        }
        Expr::Call { head, args } => {
            free_vars(head, bound, out);
            for arg in args {
                free_vars(&arg.value, bound, out);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lang::parser::parse;
    use std::path::PathBuf;

    fn analyze(src: &str) -> DepSet {
        let workdir = PathBuf::from(".");
        Analyzer::new(&workdir).analyze(&parse(src).unwrap())
    }

    fn set(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_analyze_bare_identifiers_are_globals() {
        let deps = analyze("a + b * 2");
        assert_eq!(deps.globals, set(&["a", "b"]));
    }

    #[test]
    fn test_analyze_call_head_is_global() {
        let deps = analyze("f(3)");
        assert_eq!(deps.globals, set(&["f"]));
    }

    #[test]
    fn test_analyze_load_markers() {
        let deps = analyze("load(a, 'b', list = [c, 'd'])");
        assert_eq!(deps.loads, set(&["a", "b", "c", "d"]));
        assert!(deps.globals.is_empty());
    }

    #[test]
    fn test_analyze_load_with_computed_name_contributes_globals() {
        let deps = analyze("load(x + y)");
        assert!(deps.loads.is_empty());
        assert_eq!(deps.globals, set(&["x", "y"]));
    }

    #[test]
    fn test_analyze_file_markers() {
        let deps = analyze("read_file(file_in('./in.txt')) + file_out('out\\\\dir.txt')");
        assert_eq!(deps.reads, set(&["in.txt"]));
        assert_eq!(deps.writes, set(&["out/dir.txt"]));
        assert_eq!(deps.globals, set(&["read_file"]));
    }

    #[test]
    fn test_analyze_file_marker_with_variable_path() {
        let deps = analyze("file_in(p)");
        assert!(deps.reads.is_empty());
        assert_eq!(deps.globals, set(&["p"]));
    }

    #[test]
    fn test_analyze_ignore_contributes_nothing() {
        let deps = analyze("ignore(secret + file_in('x'))");
        assert!(deps.is_empty());
        assert_eq!(deps.ignored, 1);
    }

    #[test]
    fn test_analyze_namespaced_call() {
        let deps = analyze("str::upper(x)");
        assert_eq!(deps.namespaced, set(&["str::upper"]));
        assert_eq!(deps.globals, set(&["x"]));
    }

    #[test]
    fn test_analyze_function_formals_not_free() {
        let deps = analyze("fn(x) x + offset");
        assert_eq!(deps.globals, set(&["offset"]));
    }

    #[test]
    fn test_analyze_target_drops_self_reference() {
        let workdir = PathBuf::from(".");
        let analyzer = Analyzer::new(&workdir);
        let deps = analyzer.analyze_target("f", &parse("f(x) + load(f)").unwrap());
        assert!(!deps.globals.contains("f"));
        assert!(!deps.loads.contains("f"));
        assert_eq!(deps.globals, set(&["x"]));
    }

    #[test]
    fn test_analyze_function_import_drops_writes_keeps_reads() {
        let workdir = PathBuf::from(".");
        let analyzer = Analyzer::new(&workdir);
        let fun = crate::lang::Function {
            params: vec!["x".into()],
            body: parse("x + read_file(file_in('data.csv')) + file_out('o.txt')").unwrap(),
            inner: None,
        };
        let deps = analyzer.analyze_function(&fun);
        assert_eq!(deps.reads, set(&["data.csv"]));
        assert!(deps.writes.is_empty());
    }

    #[test]
    fn test_analyze_vectorized_wrapper_unwraps() {
        let workdir = PathBuf::from(".");
        let analyzer = Analyzer::new(&workdir);
        let inner = crate::lang::Function {
            params: vec!["x".into()],
            body: parse("x * scale").unwrap(),
            inner: None,
        };
        let wrapper = crate::lang::Function {
            params: vec!["x".into()],
            body: parse("0").unwrap(),
            inner: Some(Box::new(inner)),
        };
        let deps = analyzer.analyze_function(&wrapper);
        assert_eq!(deps.globals, set(&["scale"]));
    }

    #[test]
    fn test_analyze_agrees_with_standardized_round_trip() {
        let workdir = PathBuf::from(".");
        let analyzer = Analyzer::new(&workdir);
        for src in [
            "a + b",
            "load(a, list = ['b']) + file_in('f.txt')",
            "ignore(x + y) + z",
            "str::upper(s) + fn(q) q + w",
        ] {
            let expr = parse(src).unwrap();
            let canonical = crate::lang::deparse::standardized(&expr);
            let reparsed = parse(&canonical).unwrap();
            assert_eq!(
                analyzer.analyze(&reparsed),
                analyzer.analyze(&expr),
                "source: {}",
                src
            );
        }
    }
}
