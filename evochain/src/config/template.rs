//! Synthesis prompt templates.

use serde::{Deserialize, Serialize};

/// Placeholder replaced by the analysis description.
pub const DESCRIPTION_PLACEHOLDER: &str = "[DESCRIPTION]";

/// A synthesis prompt template.
///
/// Accepts either a single string or a list of lines in configuration
/// files; lines are joined with `\n` when rendered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PromptTemplate {
    /// The whole template as one string.
    Text(String),
    /// The template split into lines.
    Lines(Vec<String>),
}

impl Default for PromptTemplate {
    fn default() -> Self {
        Self::Lines(vec![
            "Create a colorful crayon drawing based on this description:".to_string(),
            DESCRIPTION_PLACEHOLDER.to_string(),
            String::new(),
            "Keep the main subject recognisable and the background simple.".to_string(),
        ])
    }
}

impl PromptTemplate {
    /// Creates a single-string template.
    #[must_use]
    pub fn text(template: impl Into<String>) -> Self {
        Self::Text(template.into())
    }

    /// Returns the template as one string.
    #[must_use]
    pub fn source(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Lines(lines) => lines.join("\n"),
        }
    }

    /// Returns true if the template mentions the description placeholder.
    #[must_use]
    pub fn has_placeholder(&self) -> bool {
        self.source().contains(DESCRIPTION_PLACEHOLDER)
    }

    /// Substitutes `description` for every placeholder occurrence.
    #[must_use]
    pub fn render(&self, description: &str) -> String {
        self.source().replace(DESCRIPTION_PLACEHOLDER, description)
    }
}

impl From<&str> for PromptTemplate {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_render_text_template() {
        let template = PromptTemplate::text("Draw this: [DESCRIPTION].");
        assert_eq!(template.render("a red apple"), "Draw this: a red apple.");
    }

    #[test]
    fn test_render_lines_template() {
        let template = PromptTemplate::Lines(vec![
            "Line one".to_string(),
            "[DESCRIPTION]".to_string(),
            "Line three".to_string(),
        ]);
        assert_eq!(template.render("middle"), "Line one\nmiddle\nLine three");
    }

    #[test]
    fn test_deserialize_string_or_lines() {
        let text: PromptTemplate = serde_json::from_str(r#""just [DESCRIPTION]""#).unwrap();
        assert_eq!(text, PromptTemplate::text("just [DESCRIPTION]"));

        let lines: PromptTemplate = serde_json::from_str(r#"["a", "[DESCRIPTION]"]"#).unwrap();
        assert_eq!(lines.source(), "a\n[DESCRIPTION]");
    }

    #[test]
    fn test_placeholder_detection() {
        assert!(PromptTemplate::default().has_placeholder());
        assert!(!PromptTemplate::text("no placeholder").has_placeholder());
    }
}
