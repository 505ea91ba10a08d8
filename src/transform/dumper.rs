use crate::parser::environment::Environment;
use crate::parser::error::TemplateError;
use crate::parser::lexer::TokenKind;
use crate::types::ast::*;
use std::io::Write;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tag {
    Block,
    Variable,
}

// Binding strength, loosest first. A child written where a tighter level is
// required gets parentheses.
const COND: u8 = 1;
const OR: u8 = 2;
const AND: u8 = 3;
const NOT: u8 = 4;
const COMPARE: u8 = 5;
const ADD: u8 = 6;
const CONCAT: u8 = 7;
const MUL: u8 = 8;
const POW: u8 = 9;
const FILTER: u8 = 10;
const UNARY: u8 = 11;
const ATOM: u8 = 12;

/// Writes Jinja2 source for a template tree.
///
/// Delimiters recorded by the annotator are reused verbatim, including chomp
/// markers and the text around them. Nodes without annotations are written
/// with the environment's delimiters and canonical spacing.
pub struct TemplateDumper<'e> {
    env: &'e Environment,
    out: String,
    pending_newline: bool,
    depth: usize,
    too_deep: bool,
}

impl<'e> TemplateDumper<'e> {
    pub fn new(env: &'e Environment) -> Self {
        Self {
            env,
            out: String::new(),
            pending_newline: false,
            depth: 0,
            too_deep: false,
        }
    }

    /// Dumps `template` into `stream`, or returns the text when no stream is given.
    ///
    /// Trees nested deeper than [`MAX_NESTING`] are refused with
    /// [`TemplateError::TooDeep`] and nothing is written.
    pub fn dump(
        &mut self,
        template: &Template,
        stream: Option<&mut dyn Write>,
    ) -> Result<Option<String>, TemplateError> {
        self.out.clear();
        self.pending_newline = false;
        self.depth = 0;
        self.too_deep = false;
        self.body(&template.body);
        self.write(&template.meta.trailing);
        self.pending_newline = false;
        let text = std::mem::take(&mut self.out);
        if self.too_deep {
            return Err(TemplateError::TooDeep { limit: MAX_NESTING });
        }
        debug!(bytes = text.len(), "dumped template");
        match stream {
            Some(stream) => {
                stream.write_all(text.as_bytes())?;
                Ok(None)
            }
            None => Ok(Some(text)),
        }
    }

    /// Runs `write` one nesting level deeper. Past the limit nothing more is
    /// written and `dump` fails.
    fn nested(&mut self, write: impl FnOnce(&mut Self)) {
        if self.too_deep || self.depth >= MAX_NESTING {
            self.too_deep = true;
            return;
        }
        self.depth += 1;
        write(self);
        self.depth -= 1;
    }

    fn write(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        if self.pending_newline {
            if !text.starts_with('\n') {
                self.out.push('\n');
            }
            self.pending_newline = false;
        }
        self.out.push_str(text);
    }

    /// Writes a single space unless one was just written.
    fn space(&mut self) {
        if !self.out.is_empty() && !self.out.ends_with(' ') {
            self.write(" ");
        }
    }

    fn at_line_start(&self) -> bool {
        self.pending_newline || self.out.is_empty() || self.out.ends_with('\n')
    }

    fn open(&mut self, pair: Option<&TokenPair>, tag: Tag) {
        match pair {
            Some(pair) => {
                self.write(&pair.before);
                self.write(&pair.open.value_str);
            }
            None => {
                let start = match tag {
                    Tag::Block => self.env.block_start_string.clone(),
                    Tag::Variable => self.env.variable_start_string.clone(),
                };
                self.write(&start);
            }
        }
        self.space();
    }

    fn close(&mut self, pair: Option<&TokenPair>, tag: Tag) {
        if pair.is_some_and(|p| p.colon) {
            self.write(":");
        }
        match pair {
            Some(pair) if pair.close.kind == TokenKind::LinestatementEnd => {
                self.write(&pair.close.value_str);
            }
            Some(pair) => {
                self.space();
                self.write(&pair.close.value_str);
            }
            None => {
                self.space();
                let end = match tag {
                    Tag::Block => self.env.block_end_string.clone(),
                    Tag::Variable => self.env.variable_end_string.clone(),
                };
                self.write(&end);
            }
        }
        if let Some(pair) = pair {
            self.write(&pair.after);
        }
    }

    fn tag(&mut self, pair: Option<&TokenPair>, keyword: &str) {
        self.open(pair, Tag::Block);
        self.write(keyword);
    }

    fn end(&mut self, pair: Option<&TokenPair>) {
        self.close(pair, Tag::Block);
    }

    fn simple_tag(&mut self, pair: Option<&TokenPair>, keyword: &str) {
        self.tag(pair, keyword);
        self.end(pair);
    }

    fn body(&mut self, body: &[Stmt]) {
        for stmt in body {
            self.nested(|this| this.visit_stmt(stmt));
        }
    }

    fn visit_stmt(&mut self, stmt: &Stmt) {
        let fresh = !stmt.meta().is_annotated()
            && !matches!(stmt, Stmt::Output(_) | Stmt::Scope(_));
        let starts_line = fresh && self.at_line_start();
        let mark = self.out.len();

        self.write_stmt(stmt);

        // keep a fresh tag that opened a line from running into what follows
        if starts_line && !self.out[mark..].contains('\n') {
            self.pending_newline = true;
        }
    }

    fn write_stmt(&mut self, stmt: &Stmt) {
        let pairs = stmt.meta().token_pairs.as_slice();
        match stmt {
            Stmt::Output(node) => self.write_output(node),
            Stmt::Print(node) => self.write_print(node, pairs),
            Stmt::Extends(node) => self.write_simple(pairs, "extends", &node.template),
            Stmt::Block(node) => self.write_block(node, pairs),
            Stmt::Include(node) => self.write_include(node, pairs),
            Stmt::Import(node) => self.write_import(node, pairs),
            Stmt::FromImport(node) => self.write_from_import(node, pairs),
            Stmt::For(node) => self.write_for(node, pairs),
            Stmt::If(node) => self.write_if(node),
            Stmt::With(node) => self.write_with(node, pairs),
            Stmt::ExprStmt(node) => self.write_simple(pairs, "do", &node.node),
            Stmt::Assign(node) => self.write_assign(node, pairs),
            Stmt::AssignBlock(node) => self.write_assign_block(node, pairs),
            Stmt::FilterBlock(node) => {
                self.tag(pairs.first(), "filter");
                self.space();
                self.write_expr(&node.filter, FILTER);
                self.end(pairs.first());
                self.write_tail(pairs, &node.body, "endfilter");
            }
            Stmt::Macro(node) => {
                self.tag(pairs.first(), "macro");
                self.write(" ");
                self.write(&node.name);
                self.write_signature(&node.args, &node.defaults);
                self.end(pairs.first());
                self.write_tail(pairs, &node.body, "endmacro");
            }
            Stmt::CallBlock(node) => self.write_call_block(node, pairs),
            Stmt::Continue(_) => self.simple_tag(pairs.first(), "continue"),
            Stmt::Break(_) => self.simple_tag(pairs.first(), "break"),
            // no syntax of its own
            Stmt::Scope(node) => self.body(&node.body),
            Stmt::ScopedEvalContextModifier(node) => self.write_autoescape(node, pairs),
        }
    }

    /// Writes a body followed by its closing tag, the second stored pair.
    fn write_tail(&mut self, pairs: &[TokenPair], body: &[Stmt], end: &str) {
        self.body(body);
        self.simple_tag(pairs.get(1), end);
    }

    fn write_simple(&mut self, pairs: &[TokenPair], keyword: &str, expr: &Expr) {
        self.tag(pairs.first(), keyword);
        self.space();
        self.write_tuple_or(expr, COND);
        self.end(pairs.first());
    }

    fn write_print(&mut self, node: &Print, pairs: &[TokenPair]) {
        self.tag(pairs.first(), "print");
        self.space();
        self.write_list(&node.nodes, COND);
        self.end(pairs.first());
    }

    fn write_block(&mut self, node: &Block, pairs: &[TokenPair]) {
        let end_pair = pairs.get(1);
        self.tag(pairs.first(), "block");
        self.write(" ");
        self.write(&node.name);
        if node.scoped {
            self.write(" scoped");
        }
        if node.required {
            self.write(" required");
        }
        self.end(pairs.first());
        self.body(&node.body);
        self.tag(end_pair, "endblock");
        if node.end_name {
            self.write(" ");
            self.write(&node.name);
        }
        self.end(end_pair);
    }

    fn write_include(&mut self, node: &Include, pairs: &[TokenPair]) {
        self.tag(pairs.first(), "include");
        self.space();
        self.write_expr(&node.template, COND);
        if node.ignore_missing {
            self.write(" ignore missing");
        }
        self.write_context(node.with_context);
        self.end(pairs.first());
    }

    fn write_import(&mut self, node: &Import, pairs: &[TokenPair]) {
        self.tag(pairs.first(), "import");
        self.space();
        self.write_expr(&node.template, COND);
        self.write(" as ");
        self.write(&node.target);
        self.write_context(node.with_context);
        self.end(pairs.first());
    }

    fn write_from_import(&mut self, node: &FromImport, pairs: &[TokenPair]) {
        self.tag(pairs.first(), "from");
        self.space();
        self.write_expr(&node.template, COND);
        self.write(" import ");
        let names = node
            .names
            .iter()
            .map(|n| match &n.alias {
                Some(alias) => format!("{} as {alias}", n.name),
                None => n.name.clone(),
            })
            .collect::<Vec<_>>()
            .join(", ");
        self.write(&names);
        self.write_context(node.with_context);
        self.end(pairs.first());
    }

    fn write_for(&mut self, node: &For, pairs: &[TokenPair]) {
        let else_pair = find_pair(pairs, "else");
        self.tag(find_pair(pairs, "for"), "for");
        self.space();
        self.write_tuple_or(&node.target, COND);
        self.write(" in ");
        self.write_tuple_or(&node.iter, OR);
        if let Some(test) = &node.test {
            self.write(" if ");
            self.write_expr(test, COND);
        }
        if node.recursive {
            self.write(" recursive");
        }
        self.end(find_pair(pairs, "for"));
        self.body(&node.body);
        if else_pair.is_some() || !node.else_.is_empty() {
            self.simple_tag(else_pair, "else");
            self.body(&node.else_);
        }
        self.simple_tag(find_pair(pairs, "endfor"), "endfor");
    }

    fn write_with(&mut self, node: &With, pairs: &[TokenPair]) {
        self.tag(pairs.first(), "with");
        self.space();
        for (i, (target, value)) in node.targets.iter().zip(&node.values).enumerate() {
            if i > 0 {
                self.write(", ");
            }
            self.write_tuple_or(target, COND);
            self.write(" = ");
            self.write_expr(value, COND);
        }
        self.end(pairs.first());
        self.write_tail(pairs, &node.body, "endwith");
    }

    fn write_assign(&mut self, node: &Assign, pairs: &[TokenPair]) {
        self.tag(pairs.first(), "set");
        self.space();
        self.write_tuple_or(&node.target, COND);
        self.write(" = ");
        self.write_tuple_or(&node.node, COND);
        self.end(pairs.first());
    }

    fn write_assign_block(&mut self, node: &AssignBlock, pairs: &[TokenPair]) {
        self.tag(pairs.first(), "set");
        self.space();
        self.write_tuple_or(&node.target, COND);
        if let Some(filter) = &node.filter {
            self.write(" | ");
            self.write_expr(filter, FILTER);
        }
        self.end(pairs.first());
        self.write_tail(pairs, &node.body, "endset");
    }

    fn write_call_block(&mut self, node: &CallBlock, pairs: &[TokenPair]) {
        self.tag(pairs.first(), "call");
        if !node.args.is_empty() {
            self.write_signature(&node.args, &node.defaults);
        }
        self.write(" ");
        self.write_expr(&node.call, COND);
        self.end(pairs.first());
        self.write_tail(pairs, &node.body, "endcall");
    }

    fn write_autoescape(&mut self, node: &EvalContextModifier, pairs: &[TokenPair]) {
        self.tag(pairs.first(), "autoescape");
        self.space();
        for option in &node.options {
            self.write_expr(&option.value, COND);
        }
        self.end(pairs.first());
        self.write_tail(pairs, &node.body, "endautoescape");
    }

    /// An annotated expression keeps the pair that enclosed it in the source.
    /// A fresh one takes the pair at its position while the count is unchanged.
    fn write_output(&mut self, node: &Output) {
        let expressions = node
            .nodes
            .iter()
            .filter(|n| !matches!(n, Expr::TemplateData(_)))
            .count();
        let pairs = node.meta.token_pairs.as_slice();
        let positional = pairs.len() == expressions;
        let mut index = 0;
        for child in &node.nodes {
            if let Expr::TemplateData(data) = child {
                self.write_data(data);
                continue;
            }
            let pair = match child.meta().tokens {
                Some((start, end)) => pairs
                    .iter()
                    .find(|p| p.open.index < start && p.close.index >= end),
                None if positional => pairs.get(index),
                None => None,
            };
            index += 1;
            self.open(pair, Tag::Variable);
            self.write_tuple_or(child, COND);
            self.close(pair, Tag::Variable);
        }
    }

    fn write_data(&mut self, data: &TemplateData) {
        self.write(&data.meta.leading);
        let needs_raw = !data.meta.is_annotated()
            && [
                &self.env.block_start_string,
                &self.env.variable_start_string,
                &self.env.comment_start_string,
            ]
            .iter()
            .any(|delimiter| data.data.contains(delimiter.as_str()));
        if needs_raw {
            let (start, end) = (
                self.env.block_start_string.clone(),
                self.env.block_end_string.clone(),
            );
            self.write(&format!("{start} raw {end}"));
            self.write(&data.data);
            self.write(&format!("{start} endraw {end}"));
        } else {
            self.write(&data.data);
        }
    }

    /// Tags are looked up by keyword, and each `elif` writes its own pair, so
    /// adding or removing branches leaves the other tags as they were.
    fn write_if(&mut self, node: &If) {
        let pairs = node.meta.token_pairs.as_slice();
        let else_pair = find_pair(pairs, "else");

        self.tag(find_pair(pairs, "if"), "if");
        self.space();
        self.write_tuple_or(&node.test, OR);
        self.end(find_pair(pairs, "if"));
        self.body(&node.body);
        for elif in &node.elif_ {
            let pair = elif.meta.pair(0);
            self.tag(pair, "elif");
            self.space();
            self.write_tuple_or(&elif.test, OR);
            self.end(pair);
            self.body(&elif.body);
        }
        if else_pair.is_some() || !node.else_.is_empty() {
            self.simple_tag(else_pair, "else");
            self.body(&node.else_);
        }
        self.simple_tag(find_pair(pairs, "endif"), "endif");
    }

    fn write_context(&mut self, with_context: Option<bool>) {
        match with_context {
            Some(true) => self.write(" with context"),
            Some(false) => self.write(" without context"),
            None => {}
        }
    }

    fn write_signature(&mut self, args: &[Expr], defaults: &[Expr]) {
        let offset = args.len().saturating_sub(defaults.len());
        self.write("(");
        for (i, arg) in args.iter().enumerate() {
            if i > 0 {
                self.write(", ");
            }
            self.write_expr(arg, COND);
            if i >= offset {
                self.write("=");
                self.write_expr(&defaults[i - offset], COND);
            }
        }
        self.write(")");
    }

    fn write_list(&mut self, items: &[Expr], min: u8) {
        for (i, item) in items.iter().enumerate() {
            if i > 0 {
                self.write(", ");
            }
            self.write_expr(item, min);
        }
    }

    /// Writes an expression where the grammar accepts a tuple without
    /// parentheses.
    fn write_tuple_or(&mut self, expr: &Expr, min: u8) {
        match expr {
            Expr::Tuple(tuple) if is_bare(tuple) && !tuple.items.is_empty() => {
                self.write_list(&tuple.items, min);
                if tuple.items.len() == 1 {
                    self.write(",");
                }
            }
            _ => self.write_expr(expr, min),
        }
    }

    fn write_expr(&mut self, expr: &Expr, min: u8) {
        self.nested(|this| this.write_expr_at(expr, min));
    }

    fn write_expr_at(&mut self, expr: &Expr, min: u8) {
        let wrap = precedence(expr) < min;
        if wrap {
            self.write("(");
        }
        match expr {
            Expr::Name(node) => self.write(&node.name),
            Expr::NSRef(node) => {
                self.write(&node.name);
                self.write(".");
                self.write(&node.attr);
            }
            Expr::Const(node) => self.write(&format_const(&node.value)),
            Expr::TemplateData(node) => self.write(&node.data),
            Expr::Tuple(node) => {
                self.write("(");
                self.write_list(&node.items, COND);
                if node.items.len() == 1 {
                    self.write(",");
                }
                self.write(")");
            }
            Expr::List(node) => {
                self.write("[");
                self.write_list(&node.items, COND);
                self.write("]");
            }
            Expr::Dict(node) => {
                self.write("{");
                for (i, pair) in node.items.iter().enumerate() {
                    if i > 0 {
                        self.write(", ");
                    }
                    self.write_expr(&pair.key, COND);
                    self.write(": ");
                    self.write_expr(&pair.value, COND);
                }
                self.write("}");
            }
            Expr::CondExpr(node) => {
                self.write_expr(&node.expr1, OR);
                self.write(" if ");
                self.write_expr(&node.test, OR);
                if let Some(expr2) = &node.expr2 {
                    self.write(" else ");
                    self.write_expr(expr2, COND);
                }
            }
            Expr::BinExpr(node) => self.write_binary(node),
            Expr::UnaryExpr(node) => match (node.op, node.node.as_ref()) {
                (UnaryOp::Not, Expr::Test(test)) if node.inline => self.write_test(test, true),
                (UnaryOp::Not, operand) => {
                    self.write("not ");
                    self.write_expr(operand, NOT);
                }
                (op, operand) => {
                    self.write(op.symbol());
                    self.write_expr(operand, UNARY);
                }
            },
            Expr::Concat(node) => {
                for (i, item) in node.nodes.iter().enumerate() {
                    if i > 0 {
                        self.write(" ~ ");
                    }
                    self.write_expr(item, MUL);
                }
            }
            Expr::Compare(node) => {
                self.write_expr(&node.expr, ADD);
                for operand in &node.ops {
                    self.write(" ");
                    self.write(operand.op.symbol());
                    self.write(" ");
                    self.write_expr(&operand.expr, ADD);
                }
            }
            Expr::Getattr(node) => {
                self.write_expr(&node.node, ATOM);
                self.write(".");
                self.write(&node.attr);
            }
            Expr::Getitem(node) => {
                self.write_expr(&node.node, ATOM);
                match node.arg.as_ref() {
                    Expr::Const(Const {
                        value: ConstValue::Int(index),
                        ..
                    }) if node.dotted && *index >= 0 => {
                        self.write(".");
                        self.write(&index.to_string());
                    }
                    arg => {
                        self.write("[");
                        self.write_tuple_or(arg, COND);
                        self.write("]");
                    }
                }
            }
            Expr::Slice(node) => {
                if let Some(start) = &node.start {
                    self.write_expr(start, COND);
                }
                self.write(":");
                if let Some(stop) = &node.stop {
                    self.write_expr(stop, COND);
                }
                if let Some(step) = &node.step {
                    self.write(":");
                    self.write_expr(step, COND);
                }
            }
            Expr::Filter(node) => {
                if let Some(inner) = &node.node {
                    self.write_expr(inner, FILTER);
                    self.write(" | ");
                }
                self.write(&node.name);
                if !node.args.is_empty() || !node.meta.token_pairs.is_empty() {
                    self.write_call_args(&node.args);
                }
            }
            Expr::Test(node) => self.write_test(node, false),
            Expr::Call(node) => {
                self.write_expr(&node.node, ATOM);
                self.write_call_args(&node.args);
            }
        }
        if wrap {
            self.write(")");
        }
    }

    /// Writes a chain of binary operators. The left operands are walked with a
    /// loop, so a long sum does not count towards the nesting limit.
    fn write_binary(&mut self, node: &BinExpr) {
        let mut spine = vec![node];
        let mut leaf = node.left.as_ref();
        while let Expr::BinExpr(inner) = leaf {
            spine.push(inner);
            leaf = inner.left.as_ref();
        }
        // wrapped[i] holds whether spine[i + 1] needs parentheses
        let wrapped: Vec<bool> = spine
            .windows(2)
            .map(|w| binary_precedence(w[1].op) < binary_precedence(w[0].op))
            .collect();
        for &wrap in &wrapped {
            if wrap {
                self.write("(");
            }
        }
        let innermost = spine[spine.len() - 1];
        self.write_expr(leaf, binary_precedence(innermost.op));
        for (i, node) in spine.iter().enumerate().rev() {
            let level = binary_precedence(node.op);
            self.write(" ");
            self.write(node.op.symbol());
            self.write(" ");
            // left-associative: an equal level on the right needs parentheses
            self.write_expr(&node.right, level + 1);
            if i > 0 && wrapped[i - 1] {
                self.write(")");
            }
        }
    }

    fn write_test(&mut self, node: &Test, negated: bool) {
        self.write_expr(&node.node, FILTER);
        self.write(if negated { " is not " } else { " is " });
        self.write(&node.name);
        let args = &node.args;
        let single = args.args.len() == 1
            && args.kwargs.is_empty()
            && args.dyn_args.is_none()
            && args.dyn_kwargs.is_none();
        let parenthesized = !node.meta.token_pairs.is_empty();
        match args.args.first() {
            Some(arg) if single && !parenthesized && precedence(arg) >= ATOM => {
                self.write(" ");
                self.write_expr(arg, ATOM);
            }
            _ if args.is_empty() && !parenthesized => {}
            _ => self.write_call_args(args),
        }
    }

    fn write_call_args(&mut self, args: &CallArgs) {
        // `*args` goes before the first keyword argument that followed it in the source
        let dyn_position = match args.dyn_args.as_deref().and_then(|d| d.meta().tokens) {
            Some((start, _)) => args
                .kwargs
                .iter()
                .position(|k| k.meta.tokens.is_some_and(|(s, _)| s > start))
                .unwrap_or(args.kwargs.len()),
            None => 0,
        };
        let mut first = true;
        let mut separator = |dumper: &mut Self| {
            if !first {
                dumper.write(", ");
            }
            first = false;
        };

        self.write("(");
        for arg in &args.args {
            separator(self);
            self.write_expr(arg, COND);
        }
        for (i, keyword) in args.kwargs.iter().enumerate() {
            if i == dyn_position {
                if let Some(dyn_args) = &args.dyn_args {
                    separator(self);
                    self.write("*");
                    self.write_expr(dyn_args, COND);
                }
            }
            separator(self);
            self.write(&keyword.key);
            self.write("=");
            self.write_expr(&keyword.value, COND);
        }
        if dyn_position >= args.kwargs.len() {
            if let Some(dyn_args) = &args.dyn_args {
                separator(self);
                self.write("*");
                self.write_expr(dyn_args, COND);
            }
        }
        if let Some(dyn_kwargs) = &args.dyn_kwargs {
            separator(self);
            self.write("**");
            self.write_expr(dyn_kwargs, COND);
        }
        self.write(")");
    }
}

fn find_pair<'p>(pairs: &'p [TokenPair], keyword: &str) -> Option<&'p TokenPair> {
    pairs.iter().find(|p| p.keyword == keyword)
}

/// Whether a tuple is written without parentheses where the grammar allows it.
fn is_bare(tuple: &Tuple) -> bool {
    if tuple.meta.is_annotated() {
        tuple.meta.token_pairs.is_empty()
    } else {
        tuple.ctx != Ctx::Load
    }
}

fn binary_precedence(op: BinOp) -> u8 {
    match op {
        BinOp::Or => OR,
        BinOp::And => AND,
        BinOp::Add | BinOp::Sub => ADD,
        BinOp::Mul | BinOp::Div | BinOp::FloorDiv | BinOp::Mod => MUL,
        BinOp::Pow => POW,
    }
}

fn precedence(expr: &Expr) -> u8 {
    match expr {
        Expr::CondExpr(_) => COND,
        Expr::BinExpr(node) => binary_precedence(node.op),
        Expr::UnaryExpr(node) => match node.op {
            UnaryOp::Not if node.inline && matches!(node.node.as_ref(), Expr::Test(_)) => FILTER,
            UnaryOp::Not => NOT,
            UnaryOp::Neg | UnaryOp::Pos => UNARY,
        },
        Expr::Compare(_) => COMPARE,
        Expr::Concat(_) => CONCAT,
        Expr::Filter(_) | Expr::Test(_) => FILTER,
        Expr::Const(Const {
            value: ConstValue::Int(i),
            ..
        }) if *i < 0 => UNARY,
        Expr::Const(Const {
            value: ConstValue::Float(f),
            ..
        }) if f.is_sign_negative() => UNARY,
        _ => ATOM,
    }
}

pub(crate) fn format_const(value: &ConstValue) -> String {
    match value {
        ConstValue::None => "none".to_string(),
        ConstValue::Bool(true) => "true".to_string(),
        ConstValue::Bool(false) => "false".to_string(),
        ConstValue::Int(i) => i.to_string(),
        // literals past f64 range parse as infinity
        ConstValue::Float(f) if f.is_nan() => "(1e999 * 0)".to_string(),
        ConstValue::Float(f) if f.is_infinite() && *f > 0.0 => "1e999".to_string(),
        ConstValue::Float(f) if f.is_infinite() => "-1e999".to_string(),
        ConstValue::Float(f) => format!("{f:?}"),
        ConstValue::Str(s) => quote_string(s),
    }
}

/// Quotes a string the way Python's `repr` does: single quotes unless the
/// text contains a single quote and no double quote.
pub(crate) fn quote_string(value: &str) -> String {
    let quote = if value.contains('\'') && !value.contains('"') {
        '"'
    } else {
        '\''
    };
    let mut out = String::with_capacity(value.len() + 2);
    out.push(quote);
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c == quote => {
                out.push('\\');
                out.push(c);
            }
            c if c.is_control() && (c as u32) < 0x100 => {
                out.push_str(&format!("\\x{:02x}", c as u32));
            }
            c if c.is_control() => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }
    out.push(quote);
    out
}
