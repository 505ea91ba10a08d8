pub mod lint;
pub mod parser;
pub mod transform;
pub mod types;

#[cfg(test)]
pub mod testing;

pub use lint::{check_whitespace, SpacingReport, SpacingTag};
pub use parser::{
    annotate, dump, parse, parse_annotated, reformat, Environment, TemplateEngine, TemplateError,
    Tokens,
};
pub use transform::{NodeAnnotator, TemplateDumper};
pub use types::ast::Template;
pub use types::output::{Finding, OutputFormat};
