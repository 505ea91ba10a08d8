use crate::parser::environment::Environment;
use crate::parser::error::TemplateError;
use minijinja::syntax::SyntaxConfig;
use minijinja::Value;
use std::collections::HashMap;
use tracing::debug;

/// Renders templates with minijinja to confirm that reformatting kept their meaning.
pub struct TemplateEngine {
    env: minijinja::Environment<'static>,
}

impl TemplateEngine {
    pub fn new(config: &Environment) -> Result<Self, TemplateError> {
        if config.line_statement_prefix.is_some() || config.line_comment_prefix.is_some() {
            return Err(TemplateError::Unsupported {
                construct: "rendering with line statement or line comment prefixes".to_string(),
            });
        }
        let mut env = minijinja::Environment::new();
        if !config.has_default_delimiters() {
            let syntax = SyntaxConfig::builder()
                .block_delimiters(
                    config.block_start_string.clone(),
                    config.block_end_string.clone(),
                )
                .variable_delimiters(
                    config.variable_start_string.clone(),
                    config.variable_end_string.clone(),
                )
                .comment_delimiters(
                    config.comment_start_string.clone(),
                    config.comment_end_string.clone(),
                )
                .build()?;
            env.set_syntax(syntax);
        }
        env.set_trim_blocks(config.trim_blocks);
        env.set_lstrip_blocks(config.lstrip_blocks);
        env.set_keep_trailing_newline(config.keep_trailing_newline);

        // Ansible filters that minijinja does not ship
        env.add_filter("mandatory", filters::mandatory_filter);
        env.add_filter("regex_replace", filters::regex_replace_filter);

        Ok(Self { env })
    }

    pub fn render_string(
        &self,
        source: &str,
        vars: &HashMap<String, serde_json::Value>,
    ) -> Result<String, TemplateError> {
        let template = self.env.template_from_str(source)?;
        let context: HashMap<String, Value> = vars
            .iter()
            .map(|(k, v)| (k.clone(), Value::from_serialize(v)))
            .collect();
        Ok(template.render(&context)?)
    }

    /// Whether two templates produce the same output for `vars`.
    pub fn renders_equivalent(
        &self,
        original: &str,
        reformatted: &str,
        vars: &HashMap<String, serde_json::Value>,
    ) -> Result<bool, TemplateError> {
        let before = self.render_string(original, vars)?;
        let after = self.render_string(reformatted, vars)?;
        if before != after {
            debug!(%before, %after, "rendered output differs");
        }
        Ok(before == after)
    }
}

mod filters {
    use minijinja::{Error, ErrorKind, Value};

    pub fn mandatory_filter(value: Value, message: Option<Value>) -> Result<Value, Error> {
        if value.is_undefined() || value.is_none() {
            let msg = message
                .and_then(|v| v.as_str().map(|s| s.to_string()))
                .unwrap_or_else(|| "Mandatory variable not defined".to_string());
            Err(Error::new(ErrorKind::UndefinedError, msg))
        } else {
            Ok(value)
        }
    }

    pub fn regex_replace_filter(
        value: Value,
        pattern: Value,
        replacement: Value,
    ) -> Result<Value, Error> {
        let (Some(string), Some(pattern), Some(replacement)) =
            (value.as_str(), pattern.as_str(), replacement.as_str())
        else {
            return Err(Error::new(
                ErrorKind::InvalidOperation,
                "regex_replace takes string arguments",
            ));
        };
        let regex = regex::Regex::new(pattern)
            .map_err(|e| Error::new(ErrorKind::InvalidOperation, format!("Invalid regex: {e}")))?;
        Ok(Value::from(regex.replace_all(string, replacement).to_string()))
    }
}
