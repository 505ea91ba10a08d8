use crate::parser::error::TemplateError;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Delimiter and whitespace configuration shared by the lexer, annotator and dumper.
///
/// Two environments with different delimiters lex the same text differently, so
/// nothing derived from a template is ever cached without its environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Environment {
    pub block_start_string: String,
    pub block_end_string: String,
    pub variable_start_string: String,
    pub variable_end_string: String,
    pub comment_start_string: String,
    pub comment_end_string: String,
    pub line_statement_prefix: Option<String>,
    pub line_comment_prefix: Option<String>,
    pub trim_blocks: bool,
    pub lstrip_blocks: bool,
    pub keep_trailing_newline: bool,
}

impl Environment {
    pub fn new() -> Self {
        Self {
            block_start_string: "{%".to_string(),
            block_end_string: "%}".to_string(),
            variable_start_string: "{{".to_string(),
            variable_end_string: "}}".to_string(),
            comment_start_string: "{#".to_string(),
            comment_end_string: "#}".to_string(),
            line_statement_prefix: None,
            line_comment_prefix: None,
            trim_blocks: false,
            lstrip_blocks: false,
            keep_trailing_newline: false,
        }
    }

    /// Lexer settings used by the spacing check: every byte of the input must
    /// survive tokenization, so nothing is trimmed or stripped.
    pub fn for_spacing_check() -> Self {
        Self::new()
            .with_keep_trailing_newline(true)
            .with_lstrip_blocks(false)
            .with_trim_blocks(false)
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self, TemplateError> {
        let content = std::fs::read_to_string(path)?;
        let env: Environment = serde_yaml::from_str(&content)?;
        env.validate()?;
        Ok(env)
    }

    pub fn with_block_strings(mut self, start: &str, end: &str) -> Self {
        self.block_start_string = start.to_string();
        self.block_end_string = end.to_string();
        self
    }

    pub fn with_variable_strings(mut self, start: &str, end: &str) -> Self {
        self.variable_start_string = start.to_string();
        self.variable_end_string = end.to_string();
        self
    }

    pub fn with_comment_strings(mut self, start: &str, end: &str) -> Self {
        self.comment_start_string = start.to_string();
        self.comment_end_string = end.to_string();
        self
    }

    pub fn with_line_statement_prefix(mut self, prefix: &str) -> Self {
        self.line_statement_prefix = Some(prefix.to_string());
        self
    }

    pub fn with_line_comment_prefix(mut self, prefix: &str) -> Self {
        self.line_comment_prefix = Some(prefix.to_string());
        self
    }

    pub fn with_trim_blocks(mut self, trim_blocks: bool) -> Self {
        self.trim_blocks = trim_blocks;
        self
    }

    pub fn with_lstrip_blocks(mut self, lstrip_blocks: bool) -> Self {
        self.lstrip_blocks = lstrip_blocks;
        self
    }

    pub fn with_keep_trailing_newline(mut self, keep: bool) -> Self {
        self.keep_trailing_newline = keep;
        self
    }

    /// True when every delimiter is the stock Jinja2 one.
    pub fn has_default_delimiters(&self) -> bool {
        let defaults = Self::new();
        self.block_start_string == defaults.block_start_string
            && self.block_end_string == defaults.block_end_string
            && self.variable_start_string == defaults.variable_start_string
            && self.variable_end_string == defaults.variable_end_string
            && self.comment_start_string == defaults.comment_start_string
            && self.comment_end_string == defaults.comment_end_string
            && self.line_statement_prefix.is_none()
            && self.line_comment_prefix.is_none()
    }

    pub fn validate(&self) -> Result<(), TemplateError> {
        let delimiters = [
            ("block_start_string", &self.block_start_string),
            ("block_end_string", &self.block_end_string),
            ("variable_start_string", &self.variable_start_string),
            ("variable_end_string", &self.variable_end_string),
            ("comment_start_string", &self.comment_start_string),
            ("comment_end_string", &self.comment_end_string),
        ];
        for (field, value) in delimiters {
            if value.is_empty() {
                return Err(TemplateError::Unsupported {
                    construct: format!("empty {field}"),
                });
            }
        }
        let starts = [
            &self.block_start_string,
            &self.variable_start_string,
            &self.comment_start_string,
        ];
        for (i, a) in starts.iter().enumerate() {
            for b in starts.iter().skip(i + 1) {
                if a == b {
                    return Err(TemplateError::Unsupported {
                        construct: format!("duplicate start delimiter {a:?}"),
                    });
                }
            }
        }
        Ok(())
    }
}

impl Default for Environment {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::helpers::write_temp_file;

    #[test]
    fn test_default_delimiters() {
        let env = Environment::default();
        assert_eq!(env.block_start_string, "{%");
        assert_eq!(env.variable_end_string, "}}");
        assert!(!env.trim_blocks);
        assert!(env.has_default_delimiters());
    }

    #[test]
    fn test_spacing_check_environment() {
        let env = Environment::for_spacing_check();
        assert!(env.keep_trailing_newline);
        assert!(!env.lstrip_blocks);
        assert!(!env.trim_blocks);
    }

    #[test]
    fn test_custom_delimiters_are_not_default() {
        let env = Environment::new().with_variable_strings("[[", "]]");
        assert!(!env.has_default_delimiters());
        assert!(env.validate().is_ok());
    }

    #[test]
    fn test_duplicate_start_delimiters_rejected() {
        let env = Environment::new().with_block_strings("{{", "%}");
        assert!(env.validate().is_err());
    }

    #[test]
    fn test_from_yaml_file_partial() {
        let file =
            write_temp_file("trim_blocks: true\nline_statement_prefix: '#'\n", ".yml").unwrap();
        let env = Environment::from_yaml_file(file.path()).unwrap();
        assert!(env.trim_blocks);
        assert_eq!(env.line_statement_prefix.as_deref(), Some("#"));
        assert_eq!(env.block_start_string, "{%");
    }

    #[test]
    fn test_from_yaml_file_missing() {
        let result = Environment::from_yaml_file(Path::new("/nonexistent/env.yml"));
        assert!(matches!(result, Err(TemplateError::Io(_))));
    }
}
