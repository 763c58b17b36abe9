//! Classification of node responses into generated artifacts.
//!
//! Report steps (plan, validate, quality, review) yield one markdown file.
//! File steps (scaffold, build) yield one artifact per embedded file block,
//! or a single synthetic file holding the whole response when no block is
//! found.
//!
//! A file block is a fenced code block whose path is given either in the
//! fence info string (```` ```rust src/main.rs ```` or
//! ```` ```rust:src/main.rs ````) or on the line right before the fence
//! (`File: src/main.rs`, `### src/main.rs`, `**src/main.rs**`).

use serde::{Deserialize, Serialize};

use super::graph::StepType;

/// A generated file or document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedArtifact {
    /// Relative path.
    pub path: String,
    /// File content.
    pub content: String,
    /// Step type that produced it.
    pub purpose: StepType,
    /// Id of the producing node.
    pub producing_node_id: String,
}

/// A file extracted from a response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileBlock {
    /// Relative path.
    pub path: String,
    /// Block body without the fences.
    pub content: String,
}

/// Classified output of one successful node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum StepOutput {
    /// Implementation plan.
    Plan {
        /// Markdown report.
        report: String,
    },
    /// Project skeleton.
    Scaffold {
        /// Files extracted from the response.
        files: Vec<FileBlock>,
    },
    /// Implementation.
    Build {
        /// Files extracted from the response.
        files: Vec<FileBlock>,
    },
    /// Validation findings.
    Validate {
        /// Markdown report.
        report: String,
    },
    /// Quality assessment.
    Quality {
        /// Markdown report.
        report: String,
    },
    /// Final review.
    Review {
        /// Markdown report.
        report: String,
    },
}

impl StepOutput {
    /// Classify `response` according to `step_type`.
    ///
    /// File steps with no recognisable block fall back to one synthetic file
    /// at `{generated_dir}/{node_id}.txt`.
    pub fn classify(
        step_type: StepType,
        node_id: &str,
        response: &str,
        generated_dir: &str,
    ) -> Self {
        let files = || {
            let mut files = parse_file_blocks(response);
            if files.is_empty() {
                files.push(FileBlock {
                    path: format!("{}/{node_id}.txt", generated_dir.trim_end_matches('/')),
                    content: response.to_string(),
                });
            }
            files
        };
        let report = || response.to_string();

        match step_type {
            StepType::Plan => StepOutput::Plan { report: report() },
            StepType::Scaffold => StepOutput::Scaffold { files: files() },
            StepType::Build => StepOutput::Build { files: files() },
            StepType::Validate => StepOutput::Validate { report: report() },
            StepType::Quality => StepOutput::Quality { report: report() },
            StepType::Review => StepOutput::Review { report: report() },
        }
    }

    /// Step type this output belongs to.
    pub fn step_type(&self) -> StepType {
        match self {
            StepOutput::Plan { .. } => StepType::Plan,
            StepOutput::Scaffold { .. } => StepType::Scaffold,
            StepOutput::Build { .. } => StepType::Build,
            StepOutput::Validate { .. } => StepType::Validate,
            StepOutput::Quality { .. } => StepType::Quality,
            StepOutput::Review { .. } => StepType::Review,
        }
    }

    /// Turn the output into artifacts. Reports land at
    /// `{report_dir}/{node_id}.md`.
    pub fn into_artifacts(self, node_id: &str, report_dir: &str) -> Vec<GeneratedArtifact> {
        let purpose = self.step_type();
        let artifact = |path: String, content: String| GeneratedArtifact {
            path,
            content,
            purpose,
            producing_node_id: node_id.to_string(),
        };

        match self {
            StepOutput::Plan { report }
            | StepOutput::Validate { report }
            | StepOutput::Quality { report }
            | StepOutput::Review { report } => vec![artifact(
                format!("{}/{node_id}.md", report_dir.trim_end_matches('/')),
                report,
            )],
            StepOutput::Scaffold { files } | StepOutput::Build { files } => files
                .into_iter()
                .map(|f| artifact(f.path, f.content))
                .collect(),
        }
    }
}

/// Extract every file block from a markdown response.
///
/// Blocks without a usable path are ignored. Absolute paths and paths with
/// `..` components are rejected.
pub fn parse_file_blocks(response: &str) -> Vec<FileBlock> {
    let lines: Vec<&str> = response.lines().collect();
    let mut blocks = Vec::new();
    let mut i = 0;

    while i < lines.len() {
        let line = lines[i].trim_start();
        let Some(info) = line.strip_prefix("```") else {
            i += 1;
            continue;
        };

        let path = path_from_info(info).or_else(|| {
            i.checked_sub(1)
                .and_then(|prev| path_from_heading(lines[prev]))
        });

        let body_start = i + 1;
        let mut end = body_start;
        while end < lines.len() && !lines[end].trim_start().starts_with("```") {
            end += 1;
        }

        if let Some(path) = path.and_then(|p| sanitize_path(&p)) {
            let mut content = lines[body_start..end.min(lines.len())].join("\n");
            content.push('\n');
            blocks.push(FileBlock { path, content });
        }
        i = end + 1;
    }

    blocks
}

fn looks_like_path(candidate: &str) -> bool {
    !candidate.is_empty()
        && !candidate.contains(char::is_whitespace)
        && (candidate.contains('/') || candidate.contains('.'))
}

fn path_from_info(info: &str) -> Option<String> {
    let info = info.trim();
    if let Some((_, path)) = info.split_once(':') {
        let path = path.trim();
        return looks_like_path(path).then(|| path.to_string());
    }
    let mut parts = info.split_whitespace();
    let first = parts.next()?;
    match parts.next() {
        Some(second) if looks_like_path(second) => Some(second.to_string()),
        None if first.contains('/') => Some(first.to_string()),
        _ => None,
    }
}

fn path_from_heading(line: &str) -> Option<String> {
    let line = line.trim();
    let stripped = ["File:", "file:", "Path:", "path:", "//", "#"]
        .iter()
        .find_map(|prefix| line.strip_prefix(prefix))
        .map(|rest| rest.trim_start_matches('#').trim())
        .unwrap_or(line);
    let candidate = stripped.trim_matches(|c| c == '*' || c == '`').trim();
    looks_like_path(candidate).then(|| candidate.to_string())
}

fn sanitize_path(path: &str) -> Option<String> {
    let path = path.trim().trim_start_matches("./");
    if path.is_empty() || path.starts_with('/') || path.split('/').any(|c| c == "..") {
        return None;
    }
    Some(path.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_path_from_fence_info() {
        let response = "Here you go:\n```rust src/main.rs\nfn main() {}\n```\n\
                        ```toml:Cargo.toml\n[package]\n```\n";
        let files = parse_file_blocks(response);
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].path, "src/main.rs");
        assert_eq!(files[0].content, "fn main() {}\n");
        assert_eq!(files[1].path, "Cargo.toml");
    }

    #[test]
    fn test_parses_path_from_preceding_line() {
        let response =
            "### src/lib.rs\n```rust\npub fn a() {}\n```\n\n**README.md**\n```\nhello\n```";
        let files = parse_file_blocks(response);
        let paths: Vec<_> = files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["src/lib.rs", "README.md"]);
    }

    #[test]
    fn test_block_without_path_is_ignored() {
        let response = "Example:\n```rust\nlet x = 1;\n```";
        assert!(parse_file_blocks(response).is_empty());
    }

    #[test]
    fn test_rejects_escaping_paths() {
        let response = "```rust ../evil.rs\nx\n```\n```sh /etc/passwd\ny\n```";
        assert!(parse_file_blocks(response).is_empty());
    }

    #[test]
    fn test_build_without_blocks_falls_back_to_synthetic_file() {
        let out = StepOutput::classify(StepType::Build, "build", "just prose", "generated");
        let artifacts = out.into_artifacts("build", "docs");
        assert_eq!(artifacts.len(), 1);
        assert_eq!(artifacts[0].path, "generated/build.txt");
        assert_eq!(artifacts[0].content, "just prose");
        assert_eq!(artifacts[0].purpose, StepType::Build);
    }

    #[test]
    fn test_report_steps_yield_one_markdown_artifact() {
        let out = StepOutput::classify(
            StepType::Review,
            "review",
            "```rust a/b.rs\nx\n```",
            "generated",
        );
        let artifacts = out.into_artifacts("review", "docs/");
        assert_eq!(artifacts.len(), 1);
        assert_eq!(artifacts[0].path, "docs/review.md");
        assert_eq!(artifacts[0].producing_node_id, "review");
    }
}
