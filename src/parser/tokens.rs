use crate::parser::environment::Environment;
use crate::parser::error::TemplateError;
use crate::parser::lexer::{normalize_newlines, Lexeme, Lexer, TokenKind};
use serde::Serialize;
use std::ops::{Index, Range};
use std::slice::SliceIndex;
use tracing::trace;

/// Whitespace-control modifier attached to a delimiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum Chomp {
    #[default]
    #[serde(rename = "")]
    None,
    #[serde(rename = "-")]
    Strip,
    #[serde(rename = "+")]
    Keep,
}

impl Chomp {
    fn from_char(c: Option<char>) -> Self {
        match c {
            Some('-') => Chomp::Strip,
            Some('+') => Chomp::Keep,
            _ => Chomp::None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Chomp::None => "",
            Chomp::Strip => "-",
            Chomp::Keep => "+",
        }
    }
}

/// One token with its exact location in the normalized source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Token {
    pub index: usize,
    pub start_pos: usize,
    pub end_pos: usize,
    pub lineno: usize,
    pub kind: TokenKind,
    pub value_str: String,
    /// The token as the parser saw it; `None` when the wrapping step drops it.
    pub jinja: Option<Lexeme>,
    /// Index of the matching bracket or delimiter.
    pub pair: Option<usize>,
    pub chomp: Chomp,
}

impl Token {
    pub fn is_significant(&self) -> bool {
        self.jinja.is_some()
    }

    pub fn describe(&self) -> String {
        format!("#{} {} {:?}", self.index, self.kind, self.value_str)
    }

    fn is_open_bracket(&self) -> bool {
        self.kind == TokenKind::Operator && matches!(self.value_str.as_str(), "(" | "[" | "{")
    }

    fn closes(&self, opener: &Token) -> bool {
        if self.kind == TokenKind::Operator {
            return opener.kind == TokenKind::Operator
                && matches!(
                    (opener.value_str.as_str(), self.value_str.as_str()),
                    ("(", ")") | ("[", "]") | ("{", "}")
                );
        }
        opener.kind.closing_kind() == Some(self.kind)
    }
}

/// The full token sequence of one template, with a movable read cursor.
#[derive(Debug, Clone)]
pub struct Tokens {
    name: Option<String>,
    source: String,
    tokens: Vec<Token>,
    index: usize,
    last_matched: Option<usize>,
}

impl Tokens {
    pub fn build(
        source: &str,
        name: Option<&str>,
        env: &Environment,
    ) -> Result<Self, TemplateError> {
        let source = normalize_newlines(source);
        let lexer = Lexer::new(env);
        let raw_tokens = lexer.tokeniter(&source, name)?;

        let mut tokens = Vec::with_capacity(raw_tokens.len() + 2);
        tokens.push(Token {
            index: 0,
            start_pos: 0,
            end_pos: 0,
            lineno: 1,
            kind: TokenKind::Initial,
            value_str: String::new(),
            jinja: None,
            pair: None,
            chomp: Chomp::None,
        });

        let mut cursor = 0;
        let mut stack: Vec<usize> = Vec::new();
        for raw in &raw_tokens {
            let offset = source[cursor..].find(raw.value.as_str()).ok_or_else(|| {
                TemplateError::OffsetNotFound {
                    name: name.unwrap_or("<template>").to_string(),
                    kind: raw.kind.to_string(),
                    value: raw.value.clone(),
                    offset: cursor,
                }
            })?;
            let start_pos = cursor + offset;
            let end_pos = start_pos + raw.value.len();
            cursor = end_pos;

            let index = tokens.len();
            let mut token = Token {
                index,
                start_pos,
                end_pos,
                lineno: raw.lineno,
                kind: raw.kind,
                value_str: raw.value.clone(),
                jinja: lexer.wrap(raw, name)?,
                pair: None,
                chomp: detect_chomp(raw.kind, &raw.value, env),
            };

            if token.kind.is_begin() || token.is_open_bracket() {
                stack.push(index);
            } else if token.kind.is_end()
                || (token.kind == TokenKind::Operator
                    && matches!(token.value_str.as_str(), ")" | "]" | "}"))
            {
                match stack.last().copied() {
                    Some(open) if token.closes(&tokens[open]) => {
                        stack.pop();
                        token.pair = Some(open);
                        tokens[open].pair = Some(index);
                    }
                    _ => trace!(token = %token.describe(), "unpaired closing token"),
                }
            }
            tokens.push(token);
        }

        let index = tokens.len();
        let lineno = tokens.last().map_or(1, |t| t.lineno + t.value_str.matches('\n').count());
        tokens.push(Token {
            index,
            start_pos: cursor,
            end_pos: source.len(),
            lineno,
            kind: TokenKind::Eof,
            value_str: source[cursor..].to_string(),
            jinja: Some(Lexeme {
                lineno,
                kind: TokenKind::Eof,
                value: String::new(),
            }),
            pair: None,
            chomp: Chomp::None,
        });

        trace!(count = tokens.len(), "built token sequence");
        Ok(Self {
            name: name.map(str::to_string),
            source,
            tokens,
            index: 1,
            last_matched: None,
        })
    }

    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or("<template>")
    }

    /// The newline-normalized source the offsets refer to.
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Token> {
        self.tokens.iter()
    }

    /// The parser's view of the sequence, ending with the EOF lexeme.
    pub fn lexemes(&self) -> Vec<Lexeme> {
        self.tokens.iter().filter_map(|t| t.jinja.clone()).collect()
    }

    /// Index of the next token to be read.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn set_index(&mut self, index: usize) {
        self.index = index.min(self.tokens.len());
    }

    pub fn last_matched(&self) -> Option<usize> {
        self.last_matched
    }

    /// Index of the next significant token without consuming anything.
    pub fn peek_index(&self) -> Option<usize> {
        self.nth_significant(0)
    }

    pub fn peek(&self) -> Option<&Token> {
        self.peek_index().map(|i| &self.tokens[i])
    }

    /// The significant token `n` positions past the next one.
    pub fn peek_nth(&self, n: usize) -> Option<&Token> {
        self.nth_significant(n).map(|i| &self.tokens[i])
    }

    fn nth_significant(&self, n: usize) -> Option<usize> {
        self.tokens[self.index.min(self.tokens.len())..]
            .iter()
            .filter(|t| t.is_significant())
            .nth(n)
            .map(|t| t.index)
    }

    /// Nearest significant token strictly before `index`.
    pub fn prev_significant(&self, index: usize) -> Option<usize> {
        self.tokens[..index.min(self.tokens.len())]
            .iter()
            .rev()
            .find(|t| t.is_significant())
            .map(|t| t.index)
    }

    /// Advances past insignificant tokens until a token of `kind` is found,
    /// consuming one token per expected value (or a single token when none are
    /// given). Returns the skipped tokens and the final match.
    pub fn seek(
        &mut self,
        kind: TokenKind,
        expected: &[&str],
    ) -> Result<(Vec<usize>, usize), TemplateError> {
        let mut skipped = Vec::new();
        let rounds = expected.len().max(1);
        let mut matched = 0;
        for round in 0..rounds {
            loop {
                let Some(token) = self.tokens.get(self.index) else {
                    return Err(self.seek_error(kind, expected.get(round), "end of tokens"));
                };
                if token.is_significant() {
                    break;
                }
                skipped.push(self.index);
                self.index += 1;
            }
            let token = &self.tokens[self.index];
            let Some(jinja) = &token.jinja else {
                unreachable!("significant tokens carry a lexeme");
            };
            let value_ok = expected.get(round).map_or(true, |value| jinja.value == *value);
            if jinja.kind != kind || !value_ok {
                return Err(self.seek_error(kind, expected.get(round), &token.describe()));
            }
            matched = self.index;
            self.last_matched = Some(matched);
            self.index += 1;
        }
        Ok((skipped, matched))
    }

    /// Consumes the next significant token whatever it is.
    pub fn advance(&mut self) -> Result<(Vec<usize>, usize), TemplateError> {
        match self.peek() {
            Some(token) => {
                let kind = token.jinja.as_ref().map_or(token.kind, |j| j.kind);
                self.seek(kind, &[])
            }
            None => Err(self.seek_error(TokenKind::Eof, None, "end of tokens")),
        }
    }

    /// Consumes insignificant tokens that satisfy `keep`, stopping at the first
    /// significant or rejected one. Returns the consumed indices.
    pub fn take_insignificant(&mut self, keep: impl Fn(&Token) -> bool) -> Vec<usize> {
        let mut taken = Vec::new();
        while let Some(token) = self.tokens.get(self.index) {
            if token.is_significant() || !keep(token) {
                break;
            }
            taken.push(self.index);
            self.index += 1;
        }
        taken
    }

    /// Raw source text covered by a token range.
    pub fn text(&self, range: Range<usize>) -> String {
        self.tokens[range].iter().map(|t| t.value_str.as_str()).collect()
    }

    fn seek_error(&self, kind: TokenKind, value: Option<&&str>, found: &str) -> TemplateError {
        let expected = match value {
            Some(value) => format!("{kind} '{value}'"),
            None => kind.to_string(),
        };
        TemplateError::Seek {
            name: self.name().to_string(),
            expected,
            found: found.to_string(),
            last_matched: self
                .last_matched
                .map_or_else(|| "none".to_string(), |i| self.tokens[i].describe()),
        }
    }
}

impl<I: SliceIndex<[Token]>> Index<I> for Tokens {
    type Output = I::Output;

    fn index(&self, index: I) -> &Self::Output {
        &self.tokens[index]
    }
}

fn detect_chomp(kind: TokenKind, value: &str, env: &Environment) -> Chomp {
    let after = |start: &str| value.strip_prefix(start).and_then(|rest| rest.chars().next());
    let before = |end: &str| {
        value
            .strip_suffix(end)
            .and_then(|rest| rest.chars().next_back())
    };
    let c = match kind {
        TokenKind::BlockBegin | TokenKind::RawBegin => after(&env.block_start_string),
        TokenKind::VariableBegin => after(&env.variable_start_string),
        TokenKind::CommentBegin => after(&env.comment_start_string),
        TokenKind::BlockEnd | TokenKind::RawEnd => before(&env.block_end_string),
        TokenKind::VariableEnd => before(&env.variable_end_string),
        TokenKind::CommentEnd => before(&env.comment_end_string),
        _ => None,
    };
    Chomp::from_char(c)
}
