use crate::parser::environment::Environment;
use crate::parser::lexer::{normalize_newlines, Lexer, TokenKind, TWO_CHAR_OPERATORS};
use serde::Serialize;
use std::fmt;
use tracing::debug;

/// Names that act as operators, so a sign after them is unary.
const OPERATOR_KEYWORDS: [&str; 8] = ["and", "or", "not", "in", "is", "if", "else", "elif"];

/// Statement keywords that may be followed by a bracketed expression.
const STATEMENT_KEYWORDS: [&str; 17] = [
    "for", "set", "with", "do", "print", "include", "extends", "import", "from", "as",
    "return", "block", "filter", "macro", "call", "autoescape", "recursive",
];

const SPACED_OPERATORS: [&str; 15] = [
    "+", "-", "*", "/", "//", "%", "**", "~", "==", "!=", "<", ">", "<=", ">=", "|",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SpacingTag {
    Spacing,
    Invalid,
}

impl SpacingTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpacingTag::Spacing => "spacing",
            SpacingTag::Invalid => "invalid",
        }
    }
}

impl fmt::Display for SpacingTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of [`check_whitespace`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SpacingReport {
    /// Reformatted text; empty when the template does not lex.
    pub reformatted: String,
    /// Human readable finding, empty when nothing needs to change.
    pub details: String,
    pub tag: SpacingTag,
}

impl SpacingReport {
    /// True when `text` already has the preferred spacing.
    pub fn is_clean(&self, text: &str) -> bool {
        self.tag == SpacingTag::Spacing && self.reformatted == text
    }
}

/// A token of the spacing pass. Only kind and text matter here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpacingToken {
    pub kind: TokenKind,
    pub value: String,
}

impl SpacingToken {
    fn space() -> Self {
        Self {
            kind: TokenKind::Whitespace,
            value: " ".to_string(),
        }
    }

    fn is_operator(&self, ops: &[&str]) -> bool {
        self.kind == TokenKind::Operator && ops.contains(&self.value.as_str())
    }

    /// Whether the token ends an operand.
    fn is_value(&self) -> bool {
        match self.kind {
            TokenKind::Name => !OPERATOR_KEYWORDS.contains(&self.value.as_str()),
            TokenKind::String | TokenKind::Integer | TokenKind::Float => true,
            TokenKind::Operator => matches!(self.value.as_str(), ")" | "]" | "}"),
            _ => false,
        }
    }

    /// Whether a following `(` or `[` is a call or subscript of this token.
    fn is_callee(&self) -> bool {
        self.is_value()
            && !(self.kind == TokenKind::Name
                && STATEMENT_KEYWORDS.contains(&self.value.as_str()))
    }

    fn is_single_line_space(&self) -> bool {
        self.kind == TokenKind::Whitespace && !self.value.contains('\n')
    }
}

fn is_tag_open(kind: TokenKind) -> bool {
    matches!(
        kind,
        TokenKind::BlockBegin | TokenKind::VariableBegin | TokenKind::CommentBegin
    )
}

fn is_tag_close(kind: TokenKind) -> bool {
    matches!(
        kind,
        TokenKind::BlockEnd | TokenKind::VariableEnd | TokenKind::CommentEnd
    )
}

/// The innermost bracket left open in the current tag, if any.
pub fn in_expression(tokens: &[SpacingToken]) -> Option<char> {
    let mut depth = 0usize;
    for token in tokens.iter().rev() {
        if is_tag_open(token.kind) {
            return None;
        }
        if token.kind != TokenKind::Operator {
            continue;
        }
        match token.value.as_str() {
            ")" | "]" | "}" => depth += 1,
            "(" | "[" | "{" if depth == 0 => return token.value.chars().next(),
            "(" | "[" | "{" => depth -= 1,
            _ => {}
        }
    }
    None
}

fn prev_significant(tokens: &[SpacingToken]) -> Option<&SpacingToken> {
    tokens.iter().rev().find(|t| t.kind != TokenKind::Whitespace)
}

/// A sign or star is unary unless an operand comes right before it.
fn is_unary(op: &str, before: &[SpacingToken]) -> bool {
    matches!(op, "-" | "+" | "*" | "**") && !prev_significant(before).is_some_and(|t| t.is_value())
}

fn is_spaced(op: &str, context: Option<char>) -> bool {
    match op {
        "=" => context != Some('('),
        op => SPACED_OPERATORS.contains(&op),
    }
}

fn pad_comment(value: &str) -> String {
    let words: Vec<&str> = value.split_whitespace().collect();
    if words.is_empty() {
        " ".to_string()
    } else {
        format!(" {} ", words.join(" "))
    }
}

/// Checks the spacing inside a Jinja2 template string.
///
/// Returns the text with the preferred spacing applied. A template that does
/// not lex is reported with [`SpacingTag::Invalid`] and the lexer's message.
pub fn check_whitespace(text: &str) -> SpacingReport {
    let env = Environment::for_spacing_check();
    let source = normalize_newlines(text);
    let raw = match Lexer::new(&env).tokeniter(&source, None) {
        Ok(raw) => raw,
        Err(err) => {
            debug!(error = %err, "template does not lex");
            return SpacingReport {
                reformatted: String::new(),
                details: err.message(),
                tag: SpacingTag::Invalid,
            };
        }
    };
    let tokens = raw
        .into_iter()
        .map(|t| SpacingToken {
            kind: t.kind,
            value: t.value,
        })
        .collect();

    let tokens = remove_whitespace(insert_whitespace(tokens));
    let reformatted: String = tokens.iter().map(|t| t.value.as_str()).collect();
    let details = if reformatted == text {
        String::new()
    } else {
        format!("Jinja2 spacing could be improved: {text} -> {reformatted}")
    };
    SpacingReport {
        reformatted,
        details,
        tag: SpacingTag::Spacing,
    }
}

/// First pass: adds the spaces the style asks for and collapses runs of
/// spaces inside tags.
fn insert_whitespace(tokens: Vec<SpacingToken>) -> Vec<SpacingToken> {
    let mut out: Vec<SpacingToken> = Vec::with_capacity(tokens.len() * 2);
    let mut inside = false;
    let mut space_after = false;

    for mut token in tokens {
        let kind = token.kind;
        if inside && token.is_single_line_space() {
            token.value = " ".to_string();
        }
        if kind == TokenKind::Comment && !token.value.contains('\n') {
            token.value = pad_comment(&token.value);
        }

        let prev = out.last().map(|t| t.kind);
        let insignificant = matches!(kind, TokenKind::Whitespace | TokenKind::Comment);
        let after_open = prev.is_some_and(is_tag_open) && !insignificant;
        let before_close = is_tag_close(kind)
            && !matches!(prev, Some(TokenKind::Whitespace | TokenKind::Comment));
        let pending = space_after
            && kind != TokenKind::Whitespace
            && !token.is_operator(&[")", "]", "}"]);
        if after_open || before_close || pending {
            out.push(SpacingToken::space());
        }
        space_after = false;

        if kind == TokenKind::Operator {
            let context = in_expression(&out);
            let op = token.value.as_str();
            if is_spaced(op, context) && !is_unary(op, &out) {
                let spaced_before = out
                    .last()
                    .is_some_and(|t| t.kind == TokenKind::Whitespace || is_tag_open(t.kind));
                if !spaced_before {
                    out.push(SpacingToken::space());
                }
                space_after = true;
            } else if op == "," || (op == ":" && context == Some('{')) {
                space_after = true;
            }
        }

        if is_tag_open(kind) {
            inside = true;
        } else if is_tag_close(kind) {
            inside = false;
        }
        out.push(token);
    }
    out
}

/// Second pass: drops spaces next to brackets, dots, separators, keyword
/// argument `=` and unary signs.
fn remove_whitespace(tokens: Vec<SpacingToken>) -> Vec<SpacingToken> {
    let mut out: Vec<SpacingToken> = Vec::with_capacity(tokens.len());

    for (i, token) in tokens.iter().enumerate() {
        if token.is_single_line_space() {
            if let (Some(prev), Some(next)) = (out.last(), tokens.get(i + 1)) {
                if is_undesirable(prev, next, &out) {
                    continue;
                }
            }
        }
        out.push(token.clone());
    }
    out
}

fn is_undesirable(prev: &SpacingToken, next: &SpacingToken, out: &[SpacingToken]) -> bool {
    if is_tag_open(prev.kind) || is_tag_close(next.kind) {
        return false;
    }
    if prev.kind != TokenKind::Operator && next.kind != TokenKind::Operator {
        return false;
    }
    // joining the two would lex as a different operator
    let boundary: String = prev
        .value
        .chars()
        .last()
        .into_iter()
        .chain(next.value.chars().next())
        .collect();
    if prev.kind == next.kind && TWO_CHAR_OPERATORS.contains(&boundary.as_str()) {
        return false;
    }
    let context = in_expression(out);

    if prev.is_operator(&["(", "[", "{", "."]) || next.is_operator(&[")", "]", "}", ",", "."]) {
        return true;
    }
    if next.is_operator(&[":"]) && matches!(context, Some('[' | '{')) {
        return true;
    }
    if prev.is_operator(&[":"]) && context == Some('[') {
        return true;
    }
    if (prev.is_operator(&["="]) || next.is_operator(&["="])) && context == Some('(') {
        return true;
    }
    if next.is_operator(&["(", "["]) && prev.is_callee() {
        return true;
    }
    if prev.kind == TokenKind::Operator {
        let before = &out[..out.len() - 1];
        return is_unary(&prev.value, before);
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn reformat(text: &str) -> String {
        check_whitespace(text).reformatted
    }

    #[test]
    fn test_delimiters_get_spaces() {
        let report = check_whitespace("{{-x}}{#a#}{%1%}");
        assert_eq!(report.reformatted, "{{- x }}{# a #}{% 1 %}");
        assert_eq!(report.tag, SpacingTag::Spacing);
        assert_eq!(
            report.details,
            "Jinja2 spacing could be improved: {{-x}}{#a#}{%1%} -> {{- x }}{# a #}{% 1 %}"
        );
    }

    #[test]
    fn test_call_and_subscript() {
        assert_eq!(reformat("{{foo(123)}}"), "{{ foo(123) }}");
        assert_eq!(reformat("{{ foo[2: 4] }}"), "{{ foo[2:4] }}");
        assert_eq!(reformat("{{ foo ( 1 ) }}"), "{{ foo(1) }}");
    }

    #[test]
    fn test_negative_index_unchanged() {
        let report = check_whitespace("{{ foo[-1] }}");
        assert_eq!(report.reformatted, "{{ foo[-1] }}");
        assert!(report.details.is_empty());
        assert!(report.is_clean("{{ foo[-1] }}"));
    }

    #[test]
    fn test_invalid_template() {
        let report = check_whitespace("{{ & }}");
        assert_eq!(report.tag, SpacingTag::Invalid);
        assert!(report.reformatted.is_empty());
        assert!(!report.details.is_empty());
    }

    #[test]
    fn test_operators() {
        assert_eq!(reformat("{{ a+b }}"), "{{ a + b }}");
        assert_eq!(reformat("{{ x|default('y') }}"), "{{ x | default('y') }}");
        assert_eq!(reformat("{{ a + -1 }}"), "{{ a + -1 }}");
        assert_eq!(reformat("{{ - 1 }}"), "{{ -1 }}");
        assert_eq!(reformat("{% set x=1 %}"), "{% set x = 1 %}");
        assert_eq!(reformat("{{ f(a = 1, *args) }}"), "{{ f(a=1, *args) }}");
    }

    #[test]
    fn test_separators() {
        assert_eq!(reformat("{{ [1,2 , 3] }}"), "{{ [1, 2, 3] }}");
        assert_eq!(reformat("{{ {'a' :1} }}"), "{{ {'a': 1} }}");
        assert_eq!(reformat("{{ x . y }}"), "{{ x.y }}");
    }

    #[test]
    fn test_keywords_keep_space_before_brackets() {
        assert_eq!(reformat("{% for x in [1] %}"), "{% for x in [1] %}");
        assert_eq!(reformat("{% if (a) %}"), "{% if (a) %}");
        assert_eq!(reformat("{{ not -x }}"), "{{ not -x }}");
    }

    #[test]
    fn test_multiline_whitespace_kept() {
        let text = "{{ foo(\n    1,\n    2\n) }}\n";
        assert_eq!(reformat(text), text);
    }

    #[test]
    fn test_idempotent() {
        for text in [
            "{{-x}}{#a#}{%1%}",
            "{{ a+b*c }}",
            "{{ x|f(1,2)|g }}",
            "{% if a==b %}{{ c[1 :2] }}{% endif %}",
            "{{ f(- 1, k = 2) }}",
            "{##}",
            "{{ f(a = = b) }}",
            "{{ f(x = == y) }}",
            "{{ - - x }}",
        ] {
            let once = reformat(text);
            assert_eq!(reformat(&once), once, "not idempotent for {text}");
        }
    }

    #[test]
    fn test_in_expression() {
        let tokens = |values: &[(TokenKind, &str)]| -> Vec<SpacingToken> {
            values
                .iter()
                .map(|(kind, value)| SpacingToken {
                    kind: *kind,
                    value: value.to_string(),
                })
                .collect()
        };
        let open = tokens(&[
            (TokenKind::VariableBegin, "{{"),
            (TokenKind::Name, "x"),
            (TokenKind::Operator, "["),
            (TokenKind::Operator, "("),
            (TokenKind::Operator, ")"),
        ]);
        assert_eq!(in_expression(&open), Some('['));
        assert_eq!(in_expression(&open[..2]), None);
    }
}
