use crate::lint::{SpacingReport, SpacingTag};
use crate::parser::error::TemplateError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
    Yaml,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            "yaml" => Ok(OutputFormat::Yaml),
            _ => Err(format!("Unknown output format: {s}")),
        }
    }
}

/// A spacing problem found in one template file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Finding {
    pub path: String,
    pub tag: SpacingTag,
    pub details: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reformatted: Option<String>,
}

impl Finding {
    /// Builds a finding from a spacing report, or `None` when the text is clean.
    pub fn from_report(path: &str, text: &str, report: SpacingReport) -> Option<Self> {
        if report.is_clean(text) {
            return None;
        }
        let reformatted = (report.tag == SpacingTag::Spacing).then_some(report.reformatted);
        Some(Self {
            path: path.to_string(),
            tag: report.tag,
            details: report.details,
            reformatted,
        })
    }
}

pub fn render_findings(findings: &[Finding], format: OutputFormat) -> Result<String, TemplateError> {
    match format {
        OutputFormat::Text => Ok(findings
            .iter()
            .map(|f| format!("{}: jinja[{}]: {}\n", f.path, f.tag, f.details))
            .collect()),
        OutputFormat::Json => Ok(serde_json::to_string_pretty(findings)? + "\n"),
        OutputFormat::Yaml => Ok(serde_yaml::to_string(findings)?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lint::check_whitespace;

    #[test]
    fn test_output_format_default() {
        assert_eq!(OutputFormat::default(), OutputFormat::Text);
    }

    #[test]
    fn test_output_format_from_str() {
        assert_eq!("json".parse::<OutputFormat>().unwrap(), OutputFormat::Json);
        assert_eq!("YAML".parse::<OutputFormat>().unwrap(), OutputFormat::Yaml);
        assert_eq!("Text".parse::<OutputFormat>().unwrap(), OutputFormat::Text);
        let result = "binary".parse::<OutputFormat>();
        assert!(result.unwrap_err().contains("Unknown output format: binary"));
    }

    #[test]
    fn test_clean_text_has_no_finding() {
        let text = "{{ x }}";
        assert!(Finding::from_report("a.j2", text, check_whitespace(text)).is_none());
    }

    #[test]
    fn test_findings_render() {
        let text = "{{x}}";
        let finding = Finding::from_report("a.j2", text, check_whitespace(text)).unwrap();
        assert_eq!(finding.reformatted.as_deref(), Some("{{ x }}"));

        let rendered = render_findings(&[finding.clone()], OutputFormat::Text).unwrap();
        assert_eq!(
            rendered,
            "a.j2: jinja[spacing]: Jinja2 spacing could be improved: {{x}} -> {{ x }}\n"
        );

        let json: serde_json::Value =
            serde_json::from_str(&render_findings(&[finding], OutputFormat::Json).unwrap())
                .unwrap();
        assert_eq!(json[0]["tag"], "spacing");
        assert_eq!(json[0]["path"], "a.j2");
    }

    #[test]
    fn test_invalid_finding_has_no_reformatted_text() {
        let text = "{{ & }}";
        let finding = Finding::from_report("b.j2", text, check_whitespace(text)).unwrap();
        assert_eq!(finding.tag, SpacingTag::Invalid);
        assert!(finding.reformatted.is_none());
    }
}
