//! Prompt rendering for workflow nodes.

use serde::{Deserialize, Serialize};

/// Placeholder replaced with the latest successful step's raw response.
pub const PREV_RESPONSE: &str = "{{PREV_RESPONSE}}";

/// Placeholder replaced with the user's original request.
pub const USER_PROMPT: &str = "{{USER_PROMPT}}";

/// Accumulated run context appended to every rendered prompt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptContext {
    /// Functional requirements.
    pub requirements: Vec<String>,
    /// Constraints on the solution.
    pub constraints: Vec<String>,
    /// Paths of artifacts generated so far.
    pub artifact_paths: Vec<String>,
}

impl PromptContext {
    fn is_empty(&self) -> bool {
        self.requirements.is_empty()
            && self.constraints.is_empty()
            && self.artifact_paths.is_empty()
    }

    /// Markdown block listing the context, or an empty string when there is
    /// nothing to list.
    pub fn render(&self) -> String {
        if self.is_empty() {
            return String::new();
        }
        let mut out = String::from("\n\n## Context");
        for (title, items) in [
            ("Requirements", &self.requirements),
            ("Constraints", &self.constraints),
            ("Generated files", &self.artifact_paths),
        ] {
            if items.is_empty() {
                continue;
            }
            out.push_str("\n\n### ");
            out.push_str(title);
            for item in items {
                out.push_str("\n- ");
                out.push_str(item);
            }
        }
        out
    }
}

/// Substitute placeholders in `template` and append the context block.
///
/// Substitution is a single pass over the template, so placeholder text
/// inside a substituted value is kept literally. With no earlier successful
/// step, `{{PREV_RESPONSE}}` becomes the user prompt.
pub fn render_prompt(
    template: &str,
    user_prompt: &str,
    prev_response: Option<&str>,
    context: &PromptContext,
) -> String {
    let prev = prev_response.unwrap_or(user_prompt);
    let mut rendered = String::with_capacity(template.len() + user_prompt.len() + prev.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        rendered.push_str(&rest[..start]);
        let tail = &rest[start..];
        if let Some(after) = tail.strip_prefix(PREV_RESPONSE) {
            rendered.push_str(prev);
            rest = after;
        } else if let Some(after) = tail.strip_prefix(USER_PROMPT) {
            rendered.push_str(user_prompt);
            rest = after;
        } else {
            rendered.push_str("{{");
            rest = &tail[2..];
        }
    }
    rendered.push_str(rest);
    rendered.push_str(&context.render());
    rendered
}
