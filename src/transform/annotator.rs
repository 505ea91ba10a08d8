use crate::parser::error::TemplateError;
use crate::parser::lexer::TokenKind;
use crate::parser::tokens::{Token, Tokens};
use crate::types::ast::*;
use std::collections::HashSet;
use tracing::debug;

/// Tokens consumed so far by one expression node.
#[derive(Debug, Default, Clone, Copy)]
struct Span {
    /// First token, including grouping parentheses.
    start: Option<usize>,
    /// First token of the node's own syntax or of a child.
    inner: Option<usize>,
    end: usize,
}

impl Span {
    fn take(&mut self, index: usize) {
        self.take_outer(index);
        self.inner = Some(self.inner.map_or(index, |i| i.min(index)));
    }

    fn take_outer(&mut self, index: usize) {
        self.start = Some(self.start.map_or(index, |s| s.min(index)));
        self.end = self.end.max(index + 1);
    }

    fn child(&mut self, (start, end): (usize, usize)) {
        self.start = Some(self.start.map_or(start, |s| s.min(start)));
        self.inner = Some(self.inner.map_or(start, |i| i.min(start)));
        self.end = self.end.max(end);
    }
}

/// A begin delimiter that has been consumed but not yet closed.
struct OpenTag {
    start: usize,
    open: usize,
    keyword: String,
    before: String,
}

/// Attaches token spans and delimiter pairs to a parsed template.
///
/// The visitor consumes tokens in exactly the order the parser did, so any
/// mismatch is reported as [`TemplateError::Seek`]. Trees nested deeper than
/// [`MAX_NESTING`] are refused with [`TemplateError::TooDeep`].
pub struct NodeAnnotator {
    tokens: Tokens,
    grouping: HashSet<usize>,
    depth: usize,
}

impl NodeAnnotator {
    pub fn new(tokens: Tokens) -> Self {
        Self {
            tokens,
            grouping: HashSet::new(),
            depth: 0,
        }
    }

    pub fn tokens(&self) -> &Tokens {
        &self.tokens
    }

    pub fn into_tokens(self) -> Tokens {
        self.tokens
    }

    pub fn annotate(&mut self, template: &mut Template) -> Result<(), TemplateError> {
        self.tokens.set_index(1);
        self.grouping.clear();
        self.depth = 0;
        self.visit_body(&mut template.body)?;
        let (skipped, eof) = self.tokens.seek(TokenKind::Eof, &[])?;
        let mut trailing = self.text_of(&skipped);
        trailing.push_str(&self.tokens[eof].value_str);
        template.meta.trailing = trailing;
        template.meta.token_pairs.clear();
        template.meta.tokens = Some((0, self.tokens.len()));
        debug!(
            name = self.tokens.name(),
            tokens = self.tokens.len(),
            "annotated template"
        );
        Ok(())
    }

    fn text_of(&self, indices: &[usize]) -> String {
        indices
            .iter()
            .map(|&i| self.tokens[i].value_str.as_str())
            .collect()
    }

    fn peek_is(&self, kind: TokenKind, value: Option<&str>) -> bool {
        self.peek_nth_is(0, kind, value)
    }

    fn peek_nth_is(&self, n: usize, kind: TokenKind, value: Option<&str>) -> bool {
        self.tokens
            .peek_nth(n)
            .and_then(|t| t.jinja.as_ref())
            .is_some_and(|j| j.kind == kind && value.map_or(true, |v| j.value == v))
    }

    fn expect(&mut self, kind: TokenKind, value: Option<&str>) -> Result<usize, TemplateError> {
        let values: Vec<&str> = value.into_iter().collect();
        let (_, matched) = self.tokens.seek(kind, &values)?;
        Ok(matched)
    }

    fn consume(
        &mut self,
        kind: TokenKind,
        value: Option<&str>,
        span: &mut Span,
    ) -> Result<usize, TemplateError> {
        let matched = self.expect(kind, value)?;
        span.take(matched);
        Ok(matched)
    }

    fn consume_op(&mut self, op: &str, span: &mut Span) -> Result<usize, TemplateError> {
        self.consume(TokenKind::Operator, Some(op), span)
    }

    fn consume_name(&mut self, name: &str, span: &mut Span) -> Result<usize, TemplateError> {
        self.consume(TokenKind::Name, Some(name), span)
    }

    fn skip_comma(&mut self, span: &mut Span) -> Result<(), TemplateError> {
        if self.peek_is(TokenKind::Operator, Some(",")) {
            self.consume_op(",", span)?;
        }
        Ok(())
    }

    fn consume_dotted(&mut self, name: &str, span: &mut Span) -> Result<(), TemplateError> {
        for (i, part) in name.split('.').enumerate() {
            if i > 0 {
                self.consume_op(".", span)?;
            }
            self.consume_name(part, span)?;
        }
        Ok(())
    }

    fn pair_of(&self, open: usize, close: usize) -> TokenPair {
        TokenPair {
            open: self.tokens[open].clone(),
            close: self.tokens[close].clone(),
            keyword: String::new(),
            colon: false,
            before: String::new(),
            after: String::new(),
        }
    }

    fn open_tag(&mut self, kind: TokenKind) -> Result<OpenTag, TemplateError> {
        let (skipped, open) = self.tokens.seek(kind, &[])?;
        Ok(OpenTag {
            start: skipped.first().copied().unwrap_or(open),
            open,
            keyword: String::new(),
            before: self.text_of(&skipped),
        })
    }

    fn close_tag(&mut self, tag: OpenTag, kind: TokenKind) -> Result<TokenPair, TemplateError> {
        let colon = kind == TokenKind::BlockEnd && self.peek_is(TokenKind::Operator, Some(":"));
        if colon {
            self.expect(TokenKind::Operator, Some(":"))?;
        }
        let (_, close) = self.tokens.seek(kind, &[])?;
        let after = self
            .tokens
            .take_insignificant(|t: &Token| t.kind == TokenKind::Whitespace);
        Ok(TokenPair {
            open: self.tokens[tag.open].clone(),
            close: self.tokens[close].clone(),
            keyword: tag.keyword,
            colon,
            before: tag.before,
            after: self.text_of(&after),
        })
    }

    /// Consumes `{%` and the statement keyword.
    fn block_tag(&mut self, keyword: &str) -> Result<OpenTag, TemplateError> {
        let mut tag = self.open_tag(TokenKind::BlockBegin)?;
        self.expect(TokenKind::Name, Some(keyword))?;
        tag.keyword = keyword.to_string();
        Ok(tag)
    }

    fn close_block(&mut self, tag: OpenTag) -> Result<TokenPair, TemplateError> {
        self.close_tag(tag, TokenKind::BlockEnd)
    }

    fn end_tag(&mut self, keyword: &str) -> Result<TokenPair, TemplateError> {
        let tag = self.block_tag(keyword)?;
        self.close_block(tag)
    }

    fn peek_tag(&self, keyword: &str) -> bool {
        self.peek_is(TokenKind::BlockBegin, None)
            && self.peek_nth_is(1, TokenKind::Name, Some(keyword))
    }

    /// Runs `visit` one nesting level deeper.
    fn nested<T>(
        &mut self,
        visit: impl FnOnce(&mut Self) -> Result<T, TemplateError>,
    ) -> Result<T, TemplateError> {
        if self.depth >= MAX_NESTING {
            return Err(TemplateError::TooDeep { limit: MAX_NESTING });
        }
        self.depth += 1;
        let result = visit(self);
        self.depth -= 1;
        result
    }

    fn visit_body(&mut self, body: &mut [Stmt]) -> Result<(), TemplateError> {
        for stmt in body {
            self.nested(|this| this.visit_stmt(stmt))?;
        }
        Ok(())
    }

    fn visit_stmt(&mut self, stmt: &mut Stmt) -> Result<(), TemplateError> {
        let (start, pairs) = match stmt {
            Stmt::Output(node) => return self.visit_output(node),
            Stmt::If(node) => return self.visit_if(node),
            Stmt::Scope(node) => return self.visit_scope(node),
            Stmt::Print(node) => self.visit_print(node)?,
            Stmt::Extends(node) => self.visit_extends(node)?,
            Stmt::Block(node) => self.visit_block(node)?,
            Stmt::Include(node) => self.visit_include(node)?,
            Stmt::Import(node) => self.visit_import(node)?,
            Stmt::FromImport(node) => self.visit_from_import(node)?,
            Stmt::For(node) => self.visit_for(node)?,
            Stmt::With(node) => self.visit_with(node)?,
            Stmt::ExprStmt(node) => self.visit_simple("do", &mut node.node)?,
            Stmt::Assign(node) => self.visit_assign(node)?,
            Stmt::AssignBlock(node) => self.visit_assign_block(node)?,
            Stmt::FilterBlock(node) => self.visit_filter_block(node)?,
            Stmt::Macro(node) => self.visit_macro(node)?,
            Stmt::CallBlock(node) => self.visit_call_block(node)?,
            Stmt::Continue(_) => self.keyword_tag("continue")?,
            Stmt::Break(_) => self.keyword_tag("break")?,
            Stmt::ScopedEvalContextModifier(node) => self.visit_autoescape(node)?,
        };
        let meta = stmt.meta_mut();
        meta.tokens = Some((start, self.tokens.index()));
        meta.token_pairs = pairs;
        Ok(())
    }

    /// Injected by autoescape; it has no tokens of its own.
    fn visit_scope(&mut self, node: &mut Scope) -> Result<(), TemplateError> {
        let entry = self.tokens.index();
        self.visit_body(&mut node.body)?;
        let start = node
            .body
            .first()
            .and_then(|s| s.meta().tokens)
            .map_or(entry, |(s, _)| s);
        node.meta.tokens = Some((start, self.tokens.index()));
        Ok(())
    }

    fn keyword_tag(&mut self, keyword: &str) -> Result<(usize, Vec<TokenPair>), TemplateError> {
        let tag = self.block_tag(keyword)?;
        let start = tag.start;
        Ok((start, vec![self.close_block(tag)?]))
    }

    /// A single tag holding one expression, such as `do` or `extends`.
    fn visit_simple(
        &mut self,
        keyword: &str,
        expr: &mut Expr,
    ) -> Result<(usize, Vec<TokenPair>), TemplateError> {
        let tag = self.block_tag(keyword)?;
        let start = tag.start;
        self.visit_expr(expr)?;
        Ok((start, vec![self.close_block(tag)?]))
    }

    /// Closes the opening tag, visits the body and consumes the end tag.
    fn visit_tag_body(
        &mut self,
        tag: OpenTag,
        body: &mut [Stmt],
        end: &str,
    ) -> Result<(usize, Vec<TokenPair>), TemplateError> {
        let start = tag.start;
        let mut pairs = vec![self.close_block(tag)?];
        self.visit_body(body)?;
        pairs.push(self.end_tag(end)?);
        Ok((start, pairs))
    }

    fn visit_print(&mut self, node: &mut Print) -> Result<(usize, Vec<TokenPair>), TemplateError> {
        let tag = self.block_tag("print")?;
        let start = tag.start;
        let mut span = Span::default();
        for expr in &mut node.nodes {
            self.visit_expr(expr)?;
            self.skip_comma(&mut span)?;
        }
        Ok((start, vec![self.close_block(tag)?]))
    }

    fn visit_extends(
        &mut self,
        node: &mut Extends,
    ) -> Result<(usize, Vec<TokenPair>), TemplateError> {
        self.visit_simple("extends", &mut node.template)
    }

    fn visit_block(&mut self, node: &mut Block) -> Result<(usize, Vec<TokenPair>), TemplateError> {
        let tag = self.block_tag("block")?;
        let start = tag.start;
        self.expect(TokenKind::Name, Some(&node.name))?;
        if node.scoped {
            self.expect(TokenKind::Name, Some("scoped"))?;
        }
        if node.required {
            self.expect(TokenKind::Name, Some("required"))?;
        }
        let mut pairs = vec![self.close_block(tag)?];
        self.visit_body(&mut node.body)?;
        let tag = self.block_tag("endblock")?;
        if node.end_name {
            self.expect(TokenKind::Name, Some(&node.name))?;
        }
        pairs.push(self.close_block(tag)?);
        Ok((start, pairs))
    }

    fn visit_include(
        &mut self,
        node: &mut Include,
    ) -> Result<(usize, Vec<TokenPair>), TemplateError> {
        let tag = self.block_tag("include")?;
        let start = tag.start;
        self.visit_expr(&mut node.template)?;
        if node.ignore_missing {
            self.expect(TokenKind::Name, Some("ignore"))?;
            self.expect(TokenKind::Name, Some("missing"))?;
        }
        self.visit_context(node.with_context)?;
        Ok((start, vec![self.close_block(tag)?]))
    }

    fn visit_import(&mut self, node: &mut Import) -> Result<(usize, Vec<TokenPair>), TemplateError> {
        let tag = self.block_tag("import")?;
        let start = tag.start;
        self.visit_expr(&mut node.template)?;
        self.expect(TokenKind::Name, Some("as"))?;
        self.expect(TokenKind::Name, Some(&node.target))?;
        self.visit_context(node.with_context)?;
        Ok((start, vec![self.close_block(tag)?]))
    }

    fn visit_from_import(
        &mut self,
        node: &mut FromImport,
    ) -> Result<(usize, Vec<TokenPair>), TemplateError> {
        let tag = self.block_tag("from")?;
        let start = tag.start;
        self.visit_expr(&mut node.template)?;
        self.expect(TokenKind::Name, Some("import"))?;
        let mut span = Span::default();
        for name in &node.names {
            self.consume_name(&name.name, &mut span)?;
            if let Some(alias) = &name.alias {
                self.consume_name("as", &mut span)?;
                self.consume_name(alias, &mut span)?;
            }
            self.skip_comma(&mut span)?;
        }
        self.visit_context(node.with_context)?;
        Ok((start, vec![self.close_block(tag)?]))
    }

    fn visit_for(&mut self, node: &mut For) -> Result<(usize, Vec<TokenPair>), TemplateError> {
        let tag = self.block_tag("for")?;
        let start = tag.start;
        self.visit_expr(&mut node.target)?;
        self.expect(TokenKind::Name, Some("in"))?;
        self.visit_expr(&mut node.iter)?;
        if let Some(test) = &mut node.test {
            self.expect(TokenKind::Name, Some("if"))?;
            self.visit_expr(test)?;
        }
        if node.recursive {
            self.expect(TokenKind::Name, Some("recursive"))?;
        }
        let mut pairs = vec![self.close_block(tag)?];
        self.visit_body(&mut node.body)?;
        if !node.else_.is_empty() || self.peek_tag("else") {
            pairs.push(self.end_tag("else")?);
            self.visit_body(&mut node.else_)?;
        }
        pairs.push(self.end_tag("endfor")?);
        Ok((start, pairs))
    }

    fn visit_with(&mut self, node: &mut With) -> Result<(usize, Vec<TokenPair>), TemplateError> {
        let tag = self.block_tag("with")?;
        let mut span = Span::default();
        for (target, value) in node.targets.iter_mut().zip(node.values.iter_mut()) {
            self.visit_expr(target)?;
            self.consume_op("=", &mut span)?;
            self.visit_expr(value)?;
            self.skip_comma(&mut span)?;
        }
        self.visit_tag_body(tag, &mut node.body, "endwith")
    }

    fn visit_assign(&mut self, node: &mut Assign) -> Result<(usize, Vec<TokenPair>), TemplateError> {
        let tag = self.block_tag("set")?;
        let start = tag.start;
        self.visit_expr(&mut node.target)?;
        self.expect(TokenKind::Operator, Some("="))?;
        self.visit_expr(&mut node.node)?;
        Ok((start, vec![self.close_block(tag)?]))
    }

    fn visit_assign_block(
        &mut self,
        node: &mut AssignBlock,
    ) -> Result<(usize, Vec<TokenPair>), TemplateError> {
        let tag = self.block_tag("set")?;
        self.visit_expr(&mut node.target)?;
        if let Some(filter) = &mut node.filter {
            self.visit_expr(filter)?;
        }
        self.visit_tag_body(tag, &mut node.body, "endset")
    }

    fn visit_filter_block(
        &mut self,
        node: &mut FilterBlock,
    ) -> Result<(usize, Vec<TokenPair>), TemplateError> {
        let tag = self.block_tag("filter")?;
        self.visit_expr(&mut node.filter)?;
        self.visit_tag_body(tag, &mut node.body, "endfilter")
    }

    fn visit_macro(&mut self, node: &mut Macro) -> Result<(usize, Vec<TokenPair>), TemplateError> {
        let tag = self.block_tag("macro")?;
        self.expect(TokenKind::Name, Some(&node.name))?;
        self.visit_signature(&mut node.args, &mut node.defaults)?;
        self.visit_tag_body(tag, &mut node.body, "endmacro")
    }

    fn visit_call_block(
        &mut self,
        node: &mut CallBlock,
    ) -> Result<(usize, Vec<TokenPair>), TemplateError> {
        let tag = self.block_tag("call")?;
        if self.peek_is(TokenKind::Operator, Some("(")) {
            self.visit_signature(&mut node.args, &mut node.defaults)?;
        }
        self.visit_expr(&mut node.call)?;
        self.visit_tag_body(tag, &mut node.body, "endcall")
    }

    fn visit_autoescape(
        &mut self,
        node: &mut EvalContextModifier,
    ) -> Result<(usize, Vec<TokenPair>), TemplateError> {
        let tag = self.block_tag("autoescape")?;
        for option in &mut node.options {
            let span = self.visit_expr(&mut option.value)?;
            option.meta.tokens = Some(span);
        }
        self.visit_tag_body(tag, &mut node.body, "endautoescape")
    }

    fn visit_context(&mut self, with_context: Option<bool>) -> Result<(), TemplateError> {
        if let Some(with) = with_context {
            let keyword = if with { "with" } else { "without" };
            self.expect(TokenKind::Name, Some(keyword))?;
            self.expect(TokenKind::Name, Some("context"))?;
        }
        Ok(())
    }

    fn visit_signature(
        &mut self,
        args: &mut [Expr],
        defaults: &mut [Expr],
    ) -> Result<(), TemplateError> {
        let mut span = Span::default();
        self.consume_op("(", &mut span)?;
        let offset = args.len().saturating_sub(defaults.len());
        for (i, arg) in args.iter_mut().enumerate() {
            self.visit_expr(arg)?;
            if i >= offset {
                self.consume_op("=", &mut span)?;
                self.visit_expr(&mut defaults[i - offset])?;
            }
            self.skip_comma(&mut span)?;
        }
        self.consume_op(")", &mut span)?;
        Ok(())
    }

    fn visit_output(&mut self, node: &mut Output) -> Result<(), TemplateError> {
        let entry = self.tokens.index();
        let mut start = None;
        node.meta.token_pairs.clear();
        for child in &mut node.nodes {
            if let Expr::TemplateData(data) = child {
                let (skipped, matched) = self.tokens.seek(TokenKind::Data, &[])?;
                let data_start = skipped.first().copied().unwrap_or(matched);
                data.meta.leading = self.text_of(&skipped);
                data.meta.tokens = Some((data_start, matched + 1));
                start.get_or_insert(data_start);
                continue;
            }
            let tag = self.open_tag(TokenKind::VariableBegin)?;
            start.get_or_insert(tag.start);
            self.visit_expr(child)?;
            let pair = self.close_tag(tag, TokenKind::VariableEnd)?;
            node.meta.token_pairs.push(pair);
        }
        node.meta.tokens = Some((start.unwrap_or(entry), self.tokens.index()));
        Ok(())
    }

    /// Records one pair for the `if`, one per `elif`, one for an `else` and one
    /// for the `endif`. Each `elif` also keeps its own pair.
    fn visit_if(&mut self, node: &mut If) -> Result<(), TemplateError> {
        let tag = self.block_tag("if")?;
        let start = tag.start;
        self.visit_expr(&mut node.test)?;
        let mut pairs = vec![self.close_block(tag)?];
        self.visit_body(&mut node.body)?;
        for elif in &mut node.elif_ {
            let tag = self.block_tag("elif")?;
            let elif_start = tag.start;
            self.visit_expr(&mut elif.test)?;
            let pair = self.close_block(tag)?;
            pairs.push(pair.clone());
            elif.meta.token_pairs = vec![pair];
            self.visit_body(&mut elif.body)?;
            elif.meta.tokens = Some((elif_start, self.tokens.index()));
        }
        if !node.else_.is_empty() || self.peek_tag("else") {
            pairs.push(self.end_tag("else")?);
            self.visit_body(&mut node.else_)?;
        }
        pairs.push(self.end_tag("endif")?);
        node.meta.tokens = Some((start, self.tokens.index()));
        node.meta.token_pairs = pairs;
        Ok(())
    }

    /// Visits an expression and returns its span. Leading `(` tokens are taken
    /// as grouping parentheses; each closing `)` is claimed by the innermost
    /// node whose first token directly follows the matching `(`.
    fn visit_expr(&mut self, expr: &mut Expr) -> Result<(usize, usize), TemplateError> {
        self.nested(|this| this.visit_grouped(expr))
    }

    fn visit_grouped(&mut self, expr: &mut Expr) -> Result<(usize, usize), TemplateError> {
        let mut span = Span::default();
        expr.meta_mut().token_pairs.clear();
        while self.peek_is(TokenKind::Operator, Some("(")) {
            let open = self.expect(TokenKind::Operator, Some("("))?;
            self.grouping.insert(open);
            span.take_outer(open);
        }

        self.visit_expr_inner(expr, &mut span)?;

        let innermost = self.close_groups(&mut span)?;
        let is_tuple = matches!(expr, Expr::Tuple(_));
        if let Some((open, close)) = innermost.filter(|_| is_tuple) {
            let pair = self.pair_of(open, close);
            expr.meta_mut().token_pairs.push(pair);
        }
        Ok(self.finish(expr.meta_mut(), span))
    }

    /// Claims the closing parentheses that group the node covering `span` and
    /// returns the innermost pair claimed.
    fn close_groups(&mut self, span: &mut Span) -> Result<Option<(usize, usize)>, TemplateError> {
        let mut innermost = None;
        loop {
            let Some(next) = self.tokens.peek() else {
                break;
            };
            let is_close = next
                .jinja
                .as_ref()
                .is_some_and(|j| j.is_operator(")"));
            let Some(open) = next.pair.filter(|open| is_close && self.grouping.contains(open))
            else {
                break;
            };
            let inner = span.inner.unwrap_or(next.index);
            if self.tokens.prev_significant(inner) != Some(open) {
                break;
            }
            let close = self.expect(TokenKind::Operator, Some(")"))?;
            self.grouping.remove(&open);
            span.take_outer(open);
            span.end = span.end.max(close + 1);
            span.inner = Some(open);
            innermost.get_or_insert((open, close));
        }
        Ok(innermost)
    }

    fn finish(&self, meta: &mut Meta, span: Span) -> (usize, usize) {
        let start = span.start.unwrap_or_else(|| self.tokens.index());
        let result = (start, span.end.max(start));
        meta.tokens = Some(result);
        result
    }

    fn child(&mut self, expr: &mut Expr, span: &mut Span) -> Result<(), TemplateError> {
        let child = self.visit_expr(expr)?;
        span.child(child);
        Ok(())
    }

    /// Dispatches on the node kind. Every arm is a single call so the frame
    /// stays small on deep trees.
    fn visit_expr_inner(&mut self, expr: &mut Expr, span: &mut Span) -> Result<(), TemplateError> {
        match expr {
            Expr::Name(node) => self.consume_name(&node.name, span).map(drop),
            Expr::NSRef(node) => self.visit_nsref(node, span),
            Expr::Const(node) => self.visit_const(node, span),
            Expr::TemplateData(node) => self.visit_data(node, span),
            Expr::Tuple(node) => self.visit_items(&mut node.items, span),
            Expr::List(node) => self.visit_list(node, span),
            Expr::Dict(node) => self.visit_dict(node, span),
            Expr::CondExpr(node) => self.visit_condexpr(node, span),
            Expr::BinExpr(node) => self.visit_binary(node, span),
            Expr::UnaryExpr(node) => self.visit_unary(node, span),
            Expr::Concat(node) => self.visit_concat(node, span),
            Expr::Compare(node) => self.visit_compare(node, span),
            Expr::Getattr(node) => self.visit_getattr(node, span),
            Expr::Getitem(node) => self.visit_getitem(node, span),
            Expr::Slice(node) => self.visit_slice(node, span),
            Expr::Filter(node) => self.visit_filter(node, span),
            Expr::Test(node) => self.visit_test(node, span),
            Expr::Call(node) => self.visit_call(node, span),
        }
    }

    fn visit_nsref(&mut self, node: &NSRef, span: &mut Span) -> Result<(), TemplateError> {
        self.consume_name(&node.name, span)?;
        self.consume_op(".", span)?;
        self.consume_name(&node.attr, span)?;
        Ok(())
    }

    fn visit_const(&mut self, node: &Const, span: &mut Span) -> Result<(), TemplateError> {
        match node.value {
            ConstValue::Str(_) => {
                self.consume(TokenKind::String, None, span)?;
                // adjacent literals concatenate
                while self.peek_is(TokenKind::String, None) {
                    self.consume(TokenKind::String, None, span)?;
                }
            }
            ConstValue::Int(_) => {
                self.consume(TokenKind::Integer, None, span)?;
            }
            ConstValue::Float(_) => {
                self.consume(TokenKind::Float, None, span)?;
            }
            ConstValue::Bool(_) | ConstValue::None => {
                self.consume(TokenKind::Name, None, span)?;
            }
        }
        Ok(())
    }

    fn visit_data(&mut self, node: &mut TemplateData, span: &mut Span) -> Result<(), TemplateError> {
        let (skipped, matched) = self.tokens.seek(TokenKind::Data, &[])?;
        node.meta.leading = self.text_of(&skipped);
        span.take(matched);
        Ok(())
    }

    fn visit_items(&mut self, items: &mut [Expr], span: &mut Span) -> Result<(), TemplateError> {
        for item in items {
            self.child(item, span)?;
            self.skip_comma(span)?;
        }
        Ok(())
    }

    fn visit_list(&mut self, node: &mut List, span: &mut Span) -> Result<(), TemplateError> {
        self.consume_op("[", span)?;
        self.visit_items(&mut node.items, span)?;
        self.consume_op("]", span)?;
        Ok(())
    }

    fn visit_dict(&mut self, node: &mut Dict, span: &mut Span) -> Result<(), TemplateError> {
        self.consume_op("{", span)?;
        for pair in &mut node.items {
            let mut pair_span = Span::default();
            self.child(&mut pair.key, &mut pair_span)?;
            self.consume_op(":", &mut pair_span)?;
            self.child(&mut pair.value, &mut pair_span)?;
            let tokens = (pair_span.start.unwrap_or(pair_span.end), pair_span.end);
            pair.meta.tokens = Some(tokens);
            span.child(tokens);
            self.skip_comma(span)?;
        }
        self.consume_op("}", span)?;
        Ok(())
    }

    fn visit_condexpr(&mut self, node: &mut CondExpr, span: &mut Span) -> Result<(), TemplateError> {
        self.child(&mut node.expr1, span)?;
        self.consume_name("if", span)?;
        self.child(&mut node.test, span)?;
        if let Some(expr2) = &mut node.expr2 {
            self.consume_name("else", span)?;
            self.child(expr2, span)?;
        }
        Ok(())
    }

    fn visit_unary(&mut self, node: &mut UnaryExpr, span: &mut Span) -> Result<(), TemplateError> {
        match node.op {
            UnaryOp::Not if node.inline => {}
            UnaryOp::Not => {
                self.consume_name("not", span)?;
            }
            UnaryOp::Neg | UnaryOp::Pos => {
                self.consume_op(node.op.symbol(), span)?;
            }
        }
        self.child(&mut node.node, span)
    }

    fn visit_concat(&mut self, node: &mut Concat, span: &mut Span) -> Result<(), TemplateError> {
        for (i, item) in node.nodes.iter_mut().enumerate() {
            if i > 0 {
                self.consume_op("~", span)?;
            }
            self.child(item, span)?;
        }
        Ok(())
    }

    fn visit_compare(&mut self, node: &mut Compare, span: &mut Span) -> Result<(), TemplateError> {
        self.child(&mut node.expr, span)?;
        for operand in &mut node.ops {
            let mut operand_span = Span::default();
            match operand.op {
                CmpOp::In => {
                    self.consume_name("in", &mut operand_span)?;
                }
                CmpOp::NotIn => {
                    self.consume_name("not", &mut operand_span)?;
                    self.consume_name("in", &mut operand_span)?;
                }
                op => {
                    self.consume_op(op.symbol(), &mut operand_span)?;
                }
            }
            self.child(&mut operand.expr, &mut operand_span)?;
            let tokens = (
                operand_span.start.unwrap_or(operand_span.end),
                operand_span.end,
            );
            operand.meta.tokens = Some(tokens);
            span.child(tokens);
        }
        Ok(())
    }

    fn visit_getattr(&mut self, node: &mut Getattr, span: &mut Span) -> Result<(), TemplateError> {
        self.child(&mut node.node, span)?;
        self.consume_op(".", span)?;
        self.consume_name(&node.attr, span)?;
        Ok(())
    }

    fn visit_getitem(&mut self, node: &mut Getitem, span: &mut Span) -> Result<(), TemplateError> {
        self.child(&mut node.node, span)?;
        if node.dotted {
            self.consume_op(".", span)?;
            self.child(&mut node.arg, span)
        } else {
            self.consume_op("[", span)?;
            self.child(&mut node.arg, span)?;
            self.consume_op("]", span)?;
            Ok(())
        }
    }

    fn visit_slice(&mut self, node: &mut Slice, span: &mut Span) -> Result<(), TemplateError> {
        if let Some(start) = &mut node.start {
            self.child(start, span)?;
        }
        self.consume_op(":", span)?;
        if let Some(stop) = &mut node.stop {
            self.child(stop, span)?;
        }
        if self.peek_is(TokenKind::Operator, Some(":")) {
            self.consume_op(":", span)?;
        }
        if let Some(step) = &mut node.step {
            self.child(step, span)?;
        }
        Ok(())
    }

    fn visit_filter(&mut self, node: &mut Filter, span: &mut Span) -> Result<(), TemplateError> {
        match &mut node.node {
            Some(inner) => {
                self.child(inner, span)?;
                self.consume_op("|", span)?;
            }
            None => {
                if self.peek_is(TokenKind::Operator, Some("|")) {
                    self.consume_op("|", span)?;
                }
            }
        }
        self.consume_dotted(&node.name, span)?;
        if self.peek_is(TokenKind::Operator, Some("(")) {
            let pair = self.visit_call_args(&mut node.args, span)?;
            node.meta.token_pairs.push(pair);
        }
        Ok(())
    }

    fn visit_test(&mut self, node: &mut Test, span: &mut Span) -> Result<(), TemplateError> {
        self.child(&mut node.node, span)?;
        self.consume_name("is", span)?;
        if self.peek_is(TokenKind::Name, Some("not")) {
            self.consume_name("not", span)?;
        }
        self.consume_dotted(&node.name, span)?;
        if self.peek_is(TokenKind::Operator, Some("(")) {
            let pair = self.visit_call_args(&mut node.args, span)?;
            node.meta.token_pairs.push(pair);
        } else if let Some(arg) = node.args.args.first_mut() {
            self.child(arg, span)?;
        }
        Ok(())
    }

    fn visit_call(&mut self, node: &mut Call, span: &mut Span) -> Result<(), TemplateError> {
        self.child(&mut node.node, span)?;
        let pair = self.visit_call_args(&mut node.args, span)?;
        node.meta.token_pairs.push(pair);
        Ok(())
    }

    /// Visits a chain of binary operators. The left operands are detached and
    /// walked with a loop, so a long sum does not count towards the nesting
    /// limit.
    fn visit_binary(&mut self, node: &mut BinExpr, span: &mut Span) -> Result<(), TemplateError> {
        let detached = || Box::new(Expr::constant(ConstValue::None));
        let mut spine = Vec::new();
        let mut leaf = std::mem::replace(&mut node.left, detached());
        loop {
            match *leaf {
                Expr::BinExpr(mut inner) => {
                    leaf = std::mem::replace(&mut inner.left, detached());
                    spine.push(inner);
                }
                other => {
                    leaf = Box::new(other);
                    break;
                }
            }
        }

        let result = self.visit_spine(&mut leaf, &mut spine, node, span);

        let mut left = leaf;
        while let Some(mut inner) = spine.pop() {
            inner.left = left;
            left = Box::new(Expr::BinExpr(inner));
        }
        node.left = left;
        result
    }

    /// `spine` holds the left operands of `node`, outermost first.
    fn visit_spine(
        &mut self,
        leaf: &mut Expr,
        spine: &mut [BinExpr],
        node: &mut BinExpr,
        span: &mut Span,
    ) -> Result<(), TemplateError> {
        let mut left = self.visit_expr(leaf)?;
        for inner in spine.iter_mut().rev() {
            inner.meta.token_pairs.clear();
            let mut inner_span = Span::default();
            inner_span.child(left);
            self.visit_operator(inner, &mut inner_span)?;
            self.close_groups(&mut inner_span)?;
            left = self.finish(&mut inner.meta, inner_span);
        }
        span.child(left);
        self.visit_operator(node, span)
    }

    fn visit_operator(&mut self, node: &mut BinExpr, span: &mut Span) -> Result<(), TemplateError> {
        if node.op.is_keyword() {
            self.consume_name(node.op.symbol(), span)?;
        } else {
            self.consume_op(node.op.symbol(), span)?;
        }
        self.child(&mut node.right, span)
    }

    /// Consumes `( ... )` with the arguments in source order and returns the
    /// parenthesis pair.
    fn visit_call_args(
        &mut self,
        args: &mut CallArgs,
        span: &mut Span,
    ) -> Result<TokenPair, TemplateError> {
        let open = self.consume_op("(", span)?;
        for arg in &mut args.args {
            self.child(arg, span)?;
            self.skip_comma(span)?;
        }

        // keyword arguments and `*args` may be interleaved
        let mut kwargs = args.kwargs.iter_mut();
        let mut dyn_args = args.dyn_args.as_deref_mut();
        loop {
            match dyn_args.take() {
                Some(node) if self.peek_is(TokenKind::Operator, Some("*")) => {
                    self.consume_op("*", span)?;
                    self.child(node, span)?;
                }
                pending => {
                    dyn_args = pending;
                    let Some(keyword) = kwargs.next() else {
                        break;
                    };
                    let mut keyword_span = Span::default();
                    self.consume_name(&keyword.key, &mut keyword_span)?;
                    self.consume_op("=", &mut keyword_span)?;
                    self.child(&mut keyword.value, &mut keyword_span)?;
                    let tokens = (
                        keyword_span.start.unwrap_or(keyword_span.end),
                        keyword_span.end,
                    );
                    keyword.meta.tokens = Some(tokens);
                    span.child(tokens);
                }
            }
            self.skip_comma(span)?;
        }
        if let Some(node) = dyn_args {
            self.consume_op("*", span)?;
            self.child(node, span)?;
            self.skip_comma(span)?;
        }
        if let Some(node) = &mut args.dyn_kwargs {
            self.consume_op("**", span)?;
            self.child(node, span)?;
            self.skip_comma(span)?;
        }
        let close = self.consume_op(")", span)?;
        Ok(self.pair_of(open, close))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::environment::Environment;
    use crate::parser::grammar::Parser;
    use pretty_assertions::assert_eq;

    fn annotate(source: &str) -> (Template, Tokens) {
        let tokens = Tokens::build(source, Some("test"), &Environment::new()).unwrap();
        let mut template = Parser::new(tokens.lexemes(), Some("test")).parse().unwrap();
        let mut annotator = NodeAnnotator::new(tokens);
        annotator.annotate(&mut template).unwrap();
        (template, annotator.into_tokens())
    }

    fn first_output(template: &Template) -> &Output {
        match &template.body[0] {
            Stmt::Output(output) => output,
            other => panic!("expected output, got {}", other.kind_name()),
        }
    }

    #[test]
    fn test_root_covers_all_tokens() {
        let (template, tokens) = annotate("a {{ b }} c\n");
        assert_eq!(template.meta.tokens, Some((0, tokens.len())));
        assert_eq!(template.meta.trailing, "\n");
    }

    #[test]
    fn test_variable_pair_and_span() {
        let (template, tokens) = annotate("x{{ name }}y");
        let output = first_output(&template);
        assert_eq!(output.meta.token_pairs.len(), 1);
        let pair = &output.meta.token_pairs[0];
        assert_eq!(pair.open.value_str, "{{");
        assert_eq!(pair.close.value_str, "}}");
        let (start, end) = output.nodes[1].meta().tokens.unwrap();
        assert_eq!(tokens.text(start..end), "name");
    }

    #[test]
    fn test_grouping_parentheses_belong_to_inner_node() {
        let (template, tokens) = annotate("{{ (a + b) * c }}");
        let Expr::BinExpr(mul) = &first_output(&template).nodes[0] else {
            panic!("expected binary expression");
        };
        let (start, end) = mul.left.meta().tokens.unwrap();
        assert_eq!(tokens.text(start..end), "(a + b)");
        let (start, end) = mul.meta.tokens.unwrap();
        assert_eq!(tokens.text(start..end), "(a + b) * c");
    }

    #[test]
    fn test_call_parentheses_are_not_grouping() {
        let (template, tokens) = annotate("{{ f((a), b) }}");
        let Expr::Call(call) = &first_output(&template).nodes[0] else {
            panic!("expected call");
        };
        let (start, end) = call.args.args[0].meta().tokens.unwrap();
        assert_eq!(tokens.text(start..end), "(a)");
        assert_eq!(call.meta.token_pairs.len(), 1);
    }

    #[test]
    fn test_tuple_records_its_parentheses() {
        let (template, _) = annotate("{{ (1, 2) }}{% for a, b in x %}{% endfor %}");
        let Expr::Tuple(tuple) = &first_output(&template).nodes[0] else {
            panic!("expected tuple");
        };
        assert_eq!(tuple.meta.token_pairs.len(), 1);
        let Stmt::For(node) = &template.body[1] else {
            panic!("expected for");
        };
        assert!(node.target.meta().token_pairs.is_empty());
    }

    #[test]
    fn test_if_pairs_keep_chomp_independently() {
        let (template, _) = annotate("{%- if x %}a{% else -%} b {% endif -%}");
        let Stmt::If(node) = &template.body[0] else {
            panic!("expected if");
        };
        let chomps: Vec<_> = node
            .meta
            .token_pairs
            .iter()
            .map(|p| (p.open.chomp.as_str(), p.close.chomp.as_str()))
            .collect();
        assert_eq!(chomps, vec![("-", ""), ("", "-"), ("", "-")]);
        assert_eq!(node.meta.token_pairs[1].after, " ");
    }

    #[test]
    fn test_empty_else_is_recorded() {
        let (template, _) = annotate("{% for i in x %}{% else %}{% endfor %}");
        assert_eq!(template.body[0].meta().token_pairs.len(), 3);
    }

    #[test]
    fn test_comments_are_kept_as_surrounding_text() {
        let (template, _) = annotate("a{# one #}b{# two #}{% if x %}{% endif %}{# three #}");
        let output = first_output(&template);
        assert_eq!(output.nodes[1].meta().leading, "{# one #}");
        assert_eq!(template.body[1].meta().token_pairs[0].before, "{# two #}");
        assert_eq!(template.meta.trailing, "{# three #}");
    }

    #[test]
    fn test_is_not_and_not_in() {
        let (template, tokens) = annotate("{{ a is not b and c not in d }}");
        let Expr::BinExpr(and) = &first_output(&template).nodes[0] else {
            panic!("expected and");
        };
        let (start, end) = and.left.meta().tokens.unwrap();
        assert_eq!(tokens.text(start..end), "a is not b");
        let (start, end) = and.right.meta().tokens.unwrap();
        assert_eq!(tokens.text(start..end), "c not in d");
    }

    #[test]
    fn test_kwargs_and_dyn_args_in_source_order() {
        let (template, tokens) = annotate("{{ f(1, *a, k=2, **kw) }}");
        let Expr::Call(call) = &first_output(&template).nodes[0] else {
            panic!("expected call");
        };
        let (start, end) = call.args.kwargs[0].meta.tokens.unwrap();
        assert_eq!(tokens.text(start..end), "k=2");
        let dyn_args = call.args.dyn_args.as_ref().unwrap().meta().tokens.unwrap();
        assert!(dyn_args.0 < start);
    }

    #[test]
    fn test_seek_mismatch_is_internal_error() {
        let tokens = Tokens::build("{{ a }}", None, &Environment::new()).unwrap();
        let mut template = Parser::new(tokens.lexemes(), None).parse().unwrap();
        if let Stmt::Output(output) = &mut template.body[0] {
            output.nodes[0] = Expr::name("b");
        }
        let err = NodeAnnotator::new(tokens)
            .annotate(&mut template)
            .unwrap_err();
        assert!(err.is_internal());
    }
}
