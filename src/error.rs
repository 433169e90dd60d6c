#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("parse error: {0}")]
    ParseError(String),

    #[error("name collision: {0}")]
    NameCollision(String),

    #[error("cyclic plan: {}", .0.join(" -> "))]
    CyclicPlan(Vec<String>),

    #[error("missing dependency: '{name}' referenced by '{referrer}' is not a target, import, or builtin")]
    MissingDependency { referrer: String, name: String },

    #[error("evaluation of '{target}' failed: {message}")]
    EvalError { target: String, message: String },

    #[error("cache error: {0}")]
    CacheError(String),

    #[error("backend error: {0}")]
    BackendError(String),

    #[error("target '{target}' timed out after {secs}s")]
    TargetTimeout { target: String, secs: u64 },

    #[error("cancelled")]
    Cancelled,

    #[error("config error: {0}")]
    ConfigError(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML deserialization error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

impl EngineError {
    /// Fatal errors abort the whole run; everything else is scoped to one target.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::ParseError(_)
                | EngineError::NameCollision(_)
                | EngineError::CyclicPlan(_)
                | EngineError::CacheError(_)
                | EngineError::ConfigError(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
