pub mod environment;
pub mod error;
pub mod grammar;
pub mod lexer;
pub mod template;
pub mod tokens;

pub use environment::Environment;
pub use error::TemplateError;
pub use grammar::Parser;
pub use lexer::{Lexeme, Lexer, RawToken, TokenKind};
pub use template::TemplateEngine;
pub use tokens::{Chomp, Token, Tokens};

use crate::transform::{NodeAnnotator, TemplateDumper};
use crate::types::ast::Template;
use std::io::Write;
use tracing::debug;

/// Parses template source into an unannotated tree.
pub fn parse(
    source: &str,
    env: &Environment,
    name: Option<&str>,
) -> Result<Template, TemplateError> {
    let tokens = Tokens::build(source, name, env)?;
    Parser::new(tokens.lexemes(), name).parse()
}

/// Attaches token spans and delimiter pairs from `source` to a tree parsed
/// from the same source, returning the token stream it was matched against.
pub fn annotate(
    template: &mut Template,
    env: &Environment,
    source: &str,
) -> Result<Tokens, TemplateError> {
    let tokens = Tokens::build(source, None, env)?;
    let mut annotator = NodeAnnotator::new(tokens);
    annotator.annotate(template)?;
    Ok(annotator.into_tokens())
}

/// Parses and annotates in one go, tokenizing the source once.
pub fn parse_annotated(
    source: &str,
    env: &Environment,
    name: Option<&str>,
) -> Result<(Template, Tokens), TemplateError> {
    let tokens = Tokens::build(source, name, env)?;
    let mut template = Parser::new(tokens.lexemes(), name).parse()?;
    let mut annotator = NodeAnnotator::new(tokens);
    annotator.annotate(&mut template)?;
    debug!(name = name.unwrap_or("<template>"), "annotated template");
    Ok((template, annotator.into_tokens()))
}

/// Writes `template` as source text, into `stream` when given.
pub fn dump(
    template: &Template,
    env: &Environment,
    stream: Option<&mut dyn Write>,
) -> Result<Option<String>, TemplateError> {
    TemplateDumper::new(env).dump(template, stream)
}

/// Parses, annotates and dumps `source` again.
pub fn reformat(source: &str, env: &Environment) -> Result<String, TemplateError> {
    let (template, _) = parse_annotated(source, env, None)?;
    Ok(dump(&template, env, None)?.unwrap_or_default())
}
