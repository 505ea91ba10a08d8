use crate::parser::environment::Environment;
use crate::parser::error::TemplateError;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::fmt;

static STRING_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^(?s:'([^'\\]*(?:\\.[^'\\]*)*)'|"([^"\\]*(?:\\.[^"\\]*)*)")"#)
        .expect("Invalid string regex")
});

static FLOAT_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?i)(?:\d+_)*\d+(?:(?:\.(?:\d+_)*\d+)?e[+\-]?(?:\d+_)*\d+|\.(?:\d+_)*\d+)")
        .expect("Invalid float regex")
});

static INTEGER_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?i)(?:0b(?:_?[01])+|0o(?:_?[0-7])+|0x(?:_?[\da-f])+|[1-9](?:_?\d)*|0(?:_?0)*)")
        .expect("Invalid integer regex")
});

static NAME_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[\p{L}_][\p{L}\p{N}_]*").expect("Invalid name regex"));

pub(crate) const TWO_CHAR_OPERATORS: [&str; 6] = ["//", "**", "==", "!=", ">=", "<="];
const ONE_CHAR_OPERATORS: &str = "+-/*%~[](){}=.:|,;<>";

/// Lexical category of a token, named after Jinja2's token types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    Initial,
    Eof,
    Data,
    BlockBegin,
    BlockEnd,
    VariableBegin,
    VariableEnd,
    CommentBegin,
    Comment,
    CommentEnd,
    RawBegin,
    RawEnd,
    LinestatementBegin,
    LinestatementEnd,
    LinecommentBegin,
    Linecomment,
    LinecommentEnd,
    Whitespace,
    Name,
    Operator,
    String,
    Integer,
    Float,
}

impl TokenKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenKind::Initial => "initial",
            TokenKind::Eof => "eof",
            TokenKind::Data => "data",
            TokenKind::BlockBegin => "block_begin",
            TokenKind::BlockEnd => "block_end",
            TokenKind::VariableBegin => "variable_begin",
            TokenKind::VariableEnd => "variable_end",
            TokenKind::CommentBegin => "comment_begin",
            TokenKind::Comment => "comment",
            TokenKind::CommentEnd => "comment_end",
            TokenKind::RawBegin => "raw_begin",
            TokenKind::RawEnd => "raw_end",
            TokenKind::LinestatementBegin => "linestatement_begin",
            TokenKind::LinestatementEnd => "linestatement_end",
            TokenKind::LinecommentBegin => "linecomment_begin",
            TokenKind::Linecomment => "linecomment",
            TokenKind::LinecommentEnd => "linecomment_end",
            TokenKind::Whitespace => "whitespace",
            TokenKind::Name => "name",
            TokenKind::Operator => "operator",
            TokenKind::String => "string",
            TokenKind::Integer => "integer",
            TokenKind::Float => "float",
        }
    }

    /// The closing kind for a begin delimiter.
    pub fn closing_kind(&self) -> Option<TokenKind> {
        match self {
            TokenKind::BlockBegin => Some(TokenKind::BlockEnd),
            TokenKind::VariableBegin => Some(TokenKind::VariableEnd),
            TokenKind::CommentBegin => Some(TokenKind::CommentEnd),
            TokenKind::RawBegin => Some(TokenKind::RawEnd),
            TokenKind::LinestatementBegin => Some(TokenKind::LinestatementEnd),
            TokenKind::LinecommentBegin => Some(TokenKind::LinecommentEnd),
            _ => None,
        }
    }

    pub fn is_begin(&self) -> bool {
        self.closing_kind().is_some()
    }

    pub fn is_end(&self) -> bool {
        matches!(
            self,
            TokenKind::BlockEnd
                | TokenKind::VariableEnd
                | TokenKind::CommentEnd
                | TokenKind::RawEnd
                | TokenKind::LinestatementEnd
                | TokenKind::LinecommentEnd
        )
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unfiltered token straight from the scanner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawToken {
    pub lineno: usize,
    pub kind: TokenKind,
    pub value: String,
}

/// A token as the parser sees it, after the wrapping step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Lexeme {
    pub lineno: usize,
    pub kind: TokenKind,
    pub value: String,
}

impl Lexeme {
    pub fn is_name(&self, name: &str) -> bool {
        self.kind == TokenKind::Name && self.value == name
    }

    pub fn is_operator(&self, op: &str) -> bool {
        self.kind == TokenKind::Operator && self.value == op
    }

    /// Human readable description used in error messages.
    pub fn describe(&self) -> String {
        match self.kind {
            TokenKind::Eof => "end of template".to_string(),
            TokenKind::BlockEnd => "end of statement block".to_string(),
            TokenKind::VariableEnd => "end of print statement".to_string(),
            TokenKind::Name | TokenKind::Operator => format!("'{}'", self.value),
            kind => kind.to_string(),
        }
    }
}

pub fn normalize_newlines(source: &str) -> String {
    source.replace("\r\n", "\n").replace('\r', "\n")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MarkerKind {
    Block,
    Variable,
    Comment,
    LineStatement,
    LineComment,
}

#[derive(Debug, Clone, Copy)]
struct Marker {
    start: usize,
    kind: MarkerKind,
    len: usize,
}

/// Scans template source into raw tokens for one [`Environment`].
pub struct Lexer<'e> {
    env: &'e Environment,
}

impl<'e> Lexer<'e> {
    pub fn new(env: &'e Environment) -> Self {
        Self { env }
    }

    /// Produces every raw token of `source`, including whitespace, comments and
    /// raw markers. `source` must already be newline-normalized.
    pub fn tokeniter(
        &self,
        source: &str,
        name: Option<&str>,
    ) -> Result<Vec<RawToken>, TemplateError> {
        let mut src = source;
        if !self.env.keep_trailing_newline {
            src = src.strip_suffix('\n').unwrap_or(src);
        }
        let mut scanner = Scanner {
            env: self.env,
            src,
            pos: 0,
            lineno: 1,
            tokens: Vec::new(),
            balance: Vec::new(),
            name,
        };
        scanner.run()?;
        Ok(scanner.tokens)
    }

    /// Interprets a raw token, or drops it when the parser never sees it.
    pub fn wrap(
        &self,
        raw: &RawToken,
        name: Option<&str>,
    ) -> Result<Option<Lexeme>, TemplateError> {
        let (kind, value) = match raw.kind {
            TokenKind::Initial
            | TokenKind::Whitespace
            | TokenKind::CommentBegin
            | TokenKind::Comment
            | TokenKind::CommentEnd
            | TokenKind::LinecommentBegin
            | TokenKind::Linecomment
            | TokenKind::LinecommentEnd
            | TokenKind::RawBegin
            | TokenKind::RawEnd => return Ok(None),
            TokenKind::LinestatementBegin => (TokenKind::BlockBegin, raw.value.clone()),
            TokenKind::LinestatementEnd => (TokenKind::BlockEnd, raw.value.clone()),
            TokenKind::String => (TokenKind::String, unescape(&raw.value, raw.lineno, name)?),
            TokenKind::Integer | TokenKind::Float => (raw.kind, raw.value.replace('_', "")),
            kind => (kind, raw.value.clone()),
        };
        Ok(Some(Lexeme {
            lineno: raw.lineno,
            kind,
            value,
        }))
    }
}

struct Scanner<'s> {
    env: &'s Environment,
    src: &'s str,
    pos: usize,
    lineno: usize,
    tokens: Vec<RawToken>,
    balance: Vec<char>,
    name: Option<&'s str>,
}

impl<'s> Scanner<'s> {
    fn rest(&self) -> &'s str {
        &self.src[self.pos..]
    }

    fn push(&mut self, kind: TokenKind, len: usize) {
        let value = &self.src[self.pos..self.pos + len];
        self.tokens.push(RawToken {
            lineno: self.lineno,
            kind,
            value: value.to_string(),
        });
        self.lineno += value.matches('\n').count();
        self.pos += len;
    }

    fn error(&self, message: impl Into<String>) -> TemplateError {
        TemplateError::syntax(self.name, self.lineno, message)
    }

    fn run(&mut self) -> Result<(), TemplateError> {
        while self.pos < self.src.len() {
            let Some(marker) = self.find_marker() else {
                let len = self.src.len() - self.pos;
                self.push(TokenKind::Data, len);
                break;
            };
            self.emit_data_before(marker);
            match marker.kind {
                MarkerKind::Block => self.lex_block_begin(marker)?,
                MarkerKind::Variable => {
                    let len = marker.len + self.chomp_len(marker);
                    self.push(TokenKind::VariableBegin, len);
                    self.lex_tag(Some(TokenKind::VariableEnd))?;
                }
                MarkerKind::Comment => self.lex_comment(marker)?,
                MarkerKind::LineStatement => {
                    self.push(TokenKind::LinestatementBegin, marker.len);
                    self.lex_tag(None)?;
                }
                MarkerKind::LineComment => self.lex_line_comment(marker),
            }
        }
        Ok(())
    }

    fn chomp_at(&self, offset: usize) -> Option<char> {
        match self.src.as_bytes().get(offset) {
            Some(b'-') => Some('-'),
            Some(b'+') => Some('+'),
            _ => None,
        }
    }

    fn chomp_len(&self, marker: Marker) -> usize {
        usize::from(self.chomp_at(marker.start + marker.len).is_some())
    }

    fn find_marker(&self) -> Option<Marker> {
        let rest = self.rest();
        let mut best: Option<Marker> = None;
        fn consider(best: &mut Option<Marker>, candidate: Marker) {
            match best {
                Some(b) if b.start < candidate.start => {}
                Some(b) if b.start == candidate.start && b.len >= candidate.len => {}
                _ => *best = Some(candidate),
            }
        }

        let delimiters = [
            (MarkerKind::Block, &self.env.block_start_string),
            (MarkerKind::Variable, &self.env.variable_start_string),
            (MarkerKind::Comment, &self.env.comment_start_string),
        ];
        for (kind, delimiter) in delimiters {
            if let Some(idx) = rest.find(delimiter.as_str()) {
                consider(&mut best, Marker {
                    start: self.pos + idx,
                    kind,
                    len: delimiter.len(),
                });
            }
        }

        if let Some(prefix) = &self.env.line_comment_prefix {
            if let Some(idx) = rest.find(prefix.as_str()) {
                let head = &rest[..idx];
                let indent = head.len() - head.trim_end_matches([' ', '\t']).len();
                consider(&mut best, Marker {
                    start: self.pos + idx - indent,
                    kind: MarkerKind::LineComment,
                    len: indent + prefix.len(),
                });
            }
        }

        if let Some(prefix) = &self.env.line_statement_prefix {
            let at_line_start = self.pos == 0 || self.src.as_bytes()[self.pos - 1] == b'\n';
            let line_starts = at_line_start
                .then_some(0)
                .into_iter()
                .chain(rest.match_indices('\n').map(|(i, _)| i + 1));
            for line_start in line_starts {
                if best.is_some_and(|b| b.start < self.pos + line_start) {
                    break;
                }
                let line = &rest[line_start..];
                let indent = line.len() - line.trim_start_matches([' ', '\t']).len();
                if line[indent..].starts_with(prefix.as_str()) {
                    consider(&mut best, Marker {
                        start: self.pos + line_start,
                        kind: MarkerKind::LineStatement,
                        len: indent + prefix.len(),
                    });
                    break;
                }
            }
        }
        best
    }

    /// Emits the data preceding a marker, splitting off whitespace that a `-`
    /// chomp or `lstrip_blocks` removes from the rendered output.
    fn emit_data_before(&mut self, marker: Marker) {
        let data = &self.src[self.pos..marker.start];
        if data.is_empty() {
            return;
        }
        let chomp = match marker.kind {
            MarkerKind::Block | MarkerKind::Variable | MarkerKind::Comment => {
                self.chomp_at(marker.start + marker.len)
            }
            _ => None,
        };
        let kept = if chomp == Some('-') {
            data.trim_end().len()
        } else if self.env.lstrip_blocks
            && chomp != Some('+')
            && matches!(marker.kind, MarkerKind::Block | MarkerKind::Comment)
        {
            let trimmed = data.trim_end_matches([' ', '\t']);
            let line_start = if trimmed.is_empty() {
                self.pos == 0 || self.src.as_bytes()[self.pos - 1] == b'\n'
            } else {
                trimmed.ends_with('\n')
            };
            if line_start {
                trimmed.len()
            } else {
                data.len()
            }
        } else {
            data.len()
        };
        if kept > 0 {
            self.push(TokenKind::Data, kept);
        }
        if data.len() > kept {
            self.push(TokenKind::Whitespace, data.len() - kept);
        }
    }

    /// Whitespace removed after a closing delimiter.
    fn emit_tail_whitespace(&mut self, chomp: Option<char>, trims: bool) {
        let rest = self.rest();
        let len = match chomp {
            Some('-') => rest.len() - rest.trim_start().len(),
            Some(_) => 0,
            None if trims && self.env.trim_blocks && rest.starts_with('\n') => 1,
            None => 0,
        };
        if len > 0 {
            self.push(TokenKind::Whitespace, len);
        }
    }

    /// Length of a `{% name %}` tag starting at the current position, with the
    /// chomp found before its block end.
    fn match_basic_tag(&self, at: usize, name: &str) -> Option<(usize, Option<char>)> {
        let start = self.env.block_start_string.as_str();
        let end = self.env.block_end_string.as_str();
        let tag = &self.src[at..];
        let mut ptr = tag.strip_prefix(start)?;
        if let Some(rest) = ptr.strip_prefix(['-', '+']) {
            ptr = rest;
        }
        ptr = ptr.trim_start().strip_prefix(name)?;
        ptr = ptr.trim_start();
        let chomp = match ptr.chars().next() {
            Some(c @ ('-' | '+')) if ptr[1..].starts_with(end) => {
                ptr = &ptr[1..];
                Some(c)
            }
            _ => None,
        };
        let ptr = ptr.strip_prefix(end)?;
        Some((tag.len() - ptr.len(), chomp))
    }

    fn lex_block_begin(&mut self, marker: Marker) -> Result<(), TemplateError> {
        let Some((len, end_chomp)) = self.match_basic_tag(marker.start, "raw") else {
            let len = marker.len + self.chomp_len(marker);
            self.push(TokenKind::BlockBegin, len);
            return self.lex_tag(Some(TokenKind::BlockEnd));
        };
        self.push(TokenKind::RawBegin, len);
        self.emit_tail_whitespace(end_chomp, true);

        let block_start = self.env.block_start_string.clone();
        let mut search = self.pos;
        loop {
            let Some(idx) = self.src[search..].find(block_start.as_str()) else {
                return Err(self.error("missing end of raw directive"));
            };
            let at = search + idx;
            if let Some((end_len, end_chomp)) = self.match_basic_tag(at, "endraw") {
                let marker = Marker {
                    start: at,
                    kind: MarkerKind::Block,
                    len: block_start.len(),
                };
                self.emit_data_before(marker);
                self.push(TokenKind::RawEnd, end_len);
                self.emit_tail_whitespace(end_chomp, true);
                return Ok(());
            }
            search = at + block_start.len();
        }
    }

    fn lex_comment(&mut self, marker: Marker) -> Result<(), TemplateError> {
        let begin_len = marker.len + self.chomp_len(marker);
        self.push(TokenKind::CommentBegin, begin_len);
        let end = self.env.comment_end_string.clone();
        let Some(idx) = self.rest().find(end.as_str()) else {
            return Err(self.error("missing end of comment tag"));
        };
        let chomp = if idx > 0 {
            self.chomp_at(self.pos + idx - 1)
        } else {
            None
        };
        let content = idx - usize::from(chomp.is_some());
        if content > 0 {
            self.push(TokenKind::Comment, content);
        }
        self.push(TokenKind::CommentEnd, idx - content + end.len());
        self.emit_tail_whitespace(chomp, true);
        Ok(())
    }

    fn lex_line_comment(&mut self, marker: Marker) {
        self.push(TokenKind::LinecommentBegin, marker.len);
        let line = self.rest().find('\n').unwrap_or(self.rest().len());
        if line > 0 {
            self.push(TokenKind::Linecomment, line);
        }
        let end = usize::from(self.pos < self.src.len());
        self.push(TokenKind::LinecommentEnd, end);
    }

    /// Lexes the inside of a tag up to and including its end delimiter. A
    /// `None` end kind means a line statement terminated by a newline.
    fn lex_tag(&mut self, end_kind: Option<TokenKind>) -> Result<(), TemplateError> {
        let end = match end_kind {
            Some(TokenKind::BlockEnd) => Some(self.env.block_end_string.clone()),
            Some(_) => Some(self.env.variable_end_string.clone()),
            None => None,
        };
        loop {
            let rest = self.rest();
            if rest.is_empty() {
                if end.is_none() && self.balance.is_empty() {
                    self.push(TokenKind::LinestatementEnd, 0);
                    return Ok(());
                }
                return Err(self.error("unexpected end of template"));
            }

            let line_mode = end.is_none() && self.balance.is_empty();
            let ws = rest
                .char_indices()
                .find(|&(_, c)| !c.is_whitespace() || (line_mode && c == '\n'))
                .map_or(rest.len(), |(i, _)| i);
            if ws > 0 {
                self.push(TokenKind::Whitespace, ws);
                continue;
            }
            if line_mode && rest.starts_with('\n') {
                self.push(TokenKind::LinestatementEnd, 1);
                return Ok(());
            }

            if let (Some(end), Some(kind)) = (&end, end_kind) {
                if self.balance.is_empty() {
                    let chomp = rest
                        .chars()
                        .next()
                        .filter(|&c| matches!(c, '-' | '+') && rest[1..].starts_with(end.as_str()));
                    if chomp.is_some() || rest.starts_with(end.as_str()) {
                        let len = end.len() + usize::from(chomp.is_some());
                        self.push(kind, len);
                        self.emit_tail_whitespace(chomp, kind == TokenKind::BlockEnd);
                        return Ok(());
                    }
                }
            }

            self.lex_expression_token()?;
        }
    }

    fn lex_expression_token(&mut self) -> Result<(), TemplateError> {
        let rest = self.rest();
        let Some(first) = rest.chars().next() else {
            return Err(self.error("unexpected end of template"));
        };

        if first.is_ascii_digit() {
            let after_dot = self.pos > 0 && self.src.as_bytes()[self.pos - 1] == b'.';
            if !after_dot {
                if let Some(m) = FLOAT_PATTERN.find(rest) {
                    self.push(TokenKind::Float, m.end());
                    return Ok(());
                }
            }
            if let Some(m) = INTEGER_PATTERN.find(rest) {
                self.push(TokenKind::Integer, m.end());
                return Ok(());
            }
        }
        if let Some(m) = NAME_PATTERN.find(rest) {
            self.push(TokenKind::Name, m.end());
            return Ok(());
        }
        if first == '\'' || first == '"' {
            if let Some(m) = STRING_PATTERN.find(rest) {
                self.push(TokenKind::String, m.end());
                return Ok(());
            }
        }
        if let Some(op) = TWO_CHAR_OPERATORS.iter().find(|op| rest.starts_with(**op)) {
            self.push(TokenKind::Operator, op.len());
            return Ok(());
        }
        if ONE_CHAR_OPERATORS.contains(first) {
            match first {
                '(' => self.balance.push(')'),
                '[' => self.balance.push(']'),
                '{' => self.balance.push('}'),
                ')' | ']' | '}' => match self.balance.pop() {
                    None => return Err(self.error(format!("unexpected '{first}'"))),
                    Some(expected) if expected != first => {
                        return Err(self.error(format!(
                            "unexpected '{first}', expected '{expected}'"
                        )))
                    }
                    Some(_) => {}
                },
                _ => {}
            }
            self.push(TokenKind::Operator, 1);
            return Ok(());
        }
        Err(self.error(format!("unexpected char '{first}' at {}", self.pos)))
    }
}

/// Resolves backslash escapes inside a quoted string literal.
fn unescape(literal: &str, lineno: usize, name: Option<&str>) -> Result<String, TemplateError> {
    let inner = &literal[1..literal.len() - 1];
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        let Some(esc) = chars.next() else {
            out.push('\\');
            break;
        };
        match esc {
            'n' => out.push('\n'),
            't' => out.push('\t'),
            'r' => out.push('\r'),
            'a' => out.push('\x07'),
            'b' => out.push('\x08'),
            'f' => out.push('\x0c'),
            'v' => out.push('\x0b'),
            '0' => out.push('\0'),
            '\\' | '\'' | '"' => out.push(esc),
            '\n' => {}
            'x' | 'u' | 'U' => {
                let width = match esc {
                    'x' => 2,
                    'u' => 4,
                    _ => 8,
                };
                let digits: String = chars.by_ref().take(width).collect();
                let decoded = u32::from_str_radix(&digits, 16)
                    .ok()
                    .filter(|_| digits.len() == width)
                    .and_then(char::from_u32)
                    .ok_or_else(|| {
                        TemplateError::syntax(name, lineno, format!("invalid escape '\\{esc}{digits}'"))
                    })?;
                out.push(decoded);
            }
            other => {
                out.push('\\');
                out.push(other);
            }
        }
    }
    Ok(out)
}
