use thiserror::Error;

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("Template syntax error in {name} at line {lineno}: {message}")]
    Syntax {
        name: String,
        lineno: usize,
        message: String,
    },

    #[error("Token {value:?} ({kind}) of {name} not found after offset {offset}")]
    OffsetNotFound {
        name: String,
        kind: String,
        value: String,
        offset: usize,
    },

    #[error("Annotation of {name} diverged from the grammar: expected {expected}, found {found} (last matched token: {last_matched})")]
    Seek {
        name: String,
        expected: String,
        found: String,
        last_matched: String,
    },

    #[error("Template nests more than {limit} levels deep")]
    TooDeep { limit: usize },

    #[error("Unsupported construct: {construct}")]
    Unsupported { construct: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Template rendering error: {0}")]
    Render(#[from] minijinja::Error),
}

impl TemplateError {
    pub(crate) fn syntax(name: Option<&str>, lineno: usize, message: impl Into<String>) -> Self {
        TemplateError::Syntax {
            name: name.unwrap_or("<template>").to_string(),
            lineno,
            message: message.into(),
        }
    }

    /// The bare message of a syntax error, as reported by lint findings.
    pub fn message(&self) -> String {
        match self {
            TemplateError::Syntax { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }

    /// Internal consistency failures point at a bug in the annotator, not in the template.
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            TemplateError::OffsetNotFound { .. } | TemplateError::Seek { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_syntax_error_display() {
        let err = TemplateError::syntax(Some("task.yml"), 3, "unexpected char '&' at 3");
        assert_eq!(
            err.to_string(),
            "Template syntax error in task.yml at line 3: unexpected char '&' at 3"
        );
        assert_eq!(err.message(), "unexpected char '&' at 3");
        assert!(!err.is_internal());
    }

    #[test]
    fn test_unnamed_template() {
        let err = TemplateError::syntax(None, 1, "boom");
        assert!(err.to_string().contains("<template>"));
    }

    #[test]
    fn test_seek_error_is_internal() {
        let err = TemplateError::Seek {
            name: "<template>".to_string(),
            expected: "name 'endif'".to_string(),
            found: "block_end '%}'".to_string(),
            last_matched: "#3 name 'if'".to_string(),
        };
        assert!(err.is_internal());
        assert!(err.to_string().contains("last matched token: #3 name 'if'"));
    }
}
