//! Pluggable sub-document dependency extraction.
//!
//! Literate reports reference targets from embedded code; the engine only
//! needs the referenced identifiers, so the parser is a trait object the
//! driver can swap out.

use std::path::Path;

use regex::Regex;

/// Extracts the target identifiers a sub-document references.
pub trait SubdocExtractor: Sync {
    fn extract(&self, path: &Path) -> std::io::Result<Vec<String>>;
}

/// Default extractor: scans fenced code blocks of a Markdown (or plain text)
/// document for `load(...)` / `read(...)` marker calls.
pub struct MarkdownExtractor {
    marker: Regex,
}

impl Default for MarkdownExtractor {
    fn default() -> Self {
        MarkdownExtractor {
            marker: Regex::new(r"\b(?:load|read)\(([^)]*)\)").unwrap(),
        }
    }
}

impl MarkdownExtractor {
    fn names_in(&self, code: &str, out: &mut Vec<String>) {
        for captures in self.marker.captures_iter(code) {
            for raw in captures[1].split(',') {
                let name = raw
                    .trim()
                    .trim_matches(|c| c == '"' || c == '\'')
                    .to_string();
                if !name.is_empty()
                    && name
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
                    && !out.contains(&name)
                {
                    out.push(name);
                }
            }
        }
    }
}

impl SubdocExtractor for MarkdownExtractor {
    fn extract(&self, path: &Path) -> std::io::Result<Vec<String>> {
        let content = std::fs::read_to_string(path)?;
        let mut names = Vec::new();
        let mut in_fence = false;
        let mut saw_fence = false;
        for line in content.lines() {
            if line.trim_start().starts_with("```") {
                in_fence = !in_fence;
                saw_fence = true;
                continue;
            }
            if in_fence {
                self.names_in(line, &mut names);
            }
        }
        // Plain text documents without fences are scanned whole.
        if !saw_fence {
            self.names_in(&content, &mut names);
        }
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_extract_from_fenced_blocks_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.md");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "# Report").unwrap();
        writeln!(file, "Mentions read(not_this) in prose.").unwrap();
        writeln!(file, "```").unwrap();
        writeln!(file, "x = read(alpha) + load(beta, 'gamma')").unwrap();
        writeln!(file, "```").unwrap();
        drop(file);

        let names = MarkdownExtractor::default().extract(&path).unwrap();
        assert_eq!(names, vec!["alpha", "beta", "gamma"]);
    }

    #[test]
    fn test_extract_missing_file_is_io_error() {
        let result = MarkdownExtractor::default().extract(Path::new("no-such-file.md"));
        assert!(result.is_err());
    }
}
