//! Plan loading: the user-declared list of `(target, command)` rows.

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::path::Path;

use serde::Deserialize;

use crate::error::{EngineError, Result};
use crate::lang::{parser, Expr};

/// Per-target rebuild policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trigger {
    /// Rebuild on any change (command, dependencies, or output files).
    #[default]
    Any,
    /// Rebuild only when the cached value is missing.
    Missing,
    /// Rebuild on every run.
    Always,
    /// Rebuild only when the command changed.
    Command,
    /// Rebuild only when a dependency changed.
    Depends,
    /// Rebuild only when an output file changed or went missing.
    FileChange,
}

impl std::str::FromStr for Trigger {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "any" => Ok(Trigger::Any),
            "missing" => Ok(Trigger::Missing),
            "always" => Ok(Trigger::Always),
            "command" => Ok(Trigger::Command),
            "depends" => Ok(Trigger::Depends),
            "filechange" | "file_change" | "file-change" => Ok(Trigger::FileChange),
            other => Err(EngineError::ConfigError(format!(
                "unknown trigger '{}'",
                other
            ))),
        }
    }
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Trigger::Any => "any",
            Trigger::Missing => "missing",
            Trigger::Always => "always",
            Trigger::Command => "command",
            Trigger::Depends => "depends",
            Trigger::FileChange => "filechange",
        };
        write!(f, "{}", s)
    }
}

/// One declared target.
#[derive(Debug, Clone)]
pub struct PlanRow {
    pub name: String,
    pub command_text: String,
    pub command: Expr,
    pub trigger: Option<Trigger>,
    /// Backend registry name overriding the run-wide default for this target.
    pub evaluator: Option<String>,
    /// Unknown columns, preserved and passed through to backends.
    pub extra: BTreeMap<String, toml::Value>,
}

#[derive(Debug, Clone, Default)]
pub struct Plan {
    rows: Vec<PlanRow>,
}

#[derive(Debug, Deserialize)]
struct RawPlan {
    #[serde(default)]
    target: Vec<RawRow>,
}

#[derive(Debug, Deserialize)]
struct RawRow {
    name: String,
    command: String,
    #[serde(default)]
    trigger: Option<String>,
    #[serde(default)]
    evaluator: Option<String>,
    #[serde(flatten)]
    extra: BTreeMap<String, toml::Value>,
}

impl Plan {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            EngineError::ConfigError(format!("failed to read plan {}: {}", path.display(), e))
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let raw: RawPlan = toml::from_str(content)?;
        let mut rows = Vec::with_capacity(raw.target.len());
        for row in raw.target {
            let trigger = match &row.trigger {
                Some(s) => Some(s.parse()?),
                None => None,
            };
            rows.push(Self::parse_row(
                row.name,
                row.command,
                trigger,
                row.evaluator,
                row.extra,
            )?);
        }
        Self::from_parsed_rows(rows)
    }

    /// Build a plan programmatically from `(name, command)` pairs.
    pub fn from_rows<I, S, C>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (S, C)>,
        S: Into<String>,
        C: Into<String>,
    {
        let mut rows = Vec::new();
        for (name, command) in pairs {
            rows.push(Self::parse_row(
                name.into(),
                command.into(),
                None,
                None,
                BTreeMap::new(),
            )?);
        }
        Self::from_parsed_rows(rows)
    }

    fn parse_row(
        name: String,
        command_text: String,
        trigger: Option<Trigger>,
        evaluator: Option<String>,
        extra: BTreeMap<String, toml::Value>,
    ) -> Result<PlanRow> {
        if name.is_empty() {
            return Err(EngineError::ParseError("empty target name".to_string()));
        }
        let command = parser::parse(&command_text).map_err(|e| {
            EngineError::ParseError(format!("in command for target '{}': {}", name, e))
        })?;
        Ok(PlanRow {
            name,
            command_text,
            command,
            trigger,
            evaluator,
            extra,
        })
    }

    fn from_parsed_rows(rows: Vec<PlanRow>) -> Result<Self> {
        let mut seen = HashSet::new();
        for row in &rows {
            if !seen.insert(row.name.clone()) {
                return Err(EngineError::NameCollision(format!(
                    "target '{}' is declared more than once",
                    row.name
                )));
            }
        }
        Ok(Plan { rows })
    }

    pub fn rows(&self) -> &[PlanRow] {
        &self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&PlanRow> {
        self.rows.iter().find(|r| r.name == name)
    }
}
