//! taskwright — declarative, cached, parallel target build engine.
//!
//! A plan declares named targets with command expressions; the engine works
//! out what each command depends on (other targets, imported values and
//! functions, files read and written, sub-documents), builds the dependency
//! graph, and evaluates only the targets whose command or transitive inputs
//! changed since the last run. Independent targets run in parallel across
//! pluggable dispatch backends.

pub mod analyze;
pub mod cache;
pub mod config;
pub mod driver;
pub mod error;
pub mod graph;
pub mod lang;
pub mod oracle;
pub mod plan;
pub mod query;
pub mod scheduler;
pub mod worker;

pub use config::Config;
pub use driver::{build, BuildSummary};
pub use error::{EngineError, Result};
