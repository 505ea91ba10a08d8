//! Typed Jinja2 syntax tree.
//!
//! Every node carries a [`Meta`] that the annotator fills in. Nodes built by a
//! transform keep the default (empty) metadata and are rendered by the dumper
//! with canonical formatting.

use crate::parser::tokens::Token;

/// Deepest nesting of statements and expressions that the parser, annotator
/// and dumper accept. Each of them recurses once per level.
pub const MAX_NESTING: usize = 128;

/// A delimiter pair (`{% ... %}`, `{{ ... }}`) owned by a node, together with
/// the filtered source text that belongs to it.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenPair {
    pub open: Token,
    pub close: Token,
    /// Statement keyword after a block opener, empty for other pairs.
    pub keyword: String,
    /// Whether the tag ended in the optional `:` before its closer.
    pub colon: bool,
    /// Comments and chomped whitespace skipped before the opener.
    pub before: String,
    /// Whitespace removed by a `-` chomp or `trim_blocks` after the closer.
    pub after: String,
}

/// Source annotations attached to a node.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Meta {
    pub lineno: usize,
    /// Half-open token span `(start, end)`.
    pub tokens: Option<(usize, usize)>,
    pub token_pairs: Vec<TokenPair>,
    /// Filtered text owned by the node that precedes its first token.
    pub leading: String,
    /// Filtered text owned by the node that follows its last token.
    pub trailing: String,
}

impl Meta {
    pub fn at(lineno: usize) -> Self {
        Self {
            lineno,
            ..Self::default()
        }
    }

    pub fn is_annotated(&self) -> bool {
        self.tokens.is_some()
    }

    pub fn pair(&self, index: usize) -> Option<&TokenPair> {
        self.token_pairs.get(index)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    pub body: Vec<Stmt>,
    pub meta: Meta,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Output(Output),
    Print(Print),
    Extends(Extends),
    Block(Block),
    Include(Include),
    Import(Import),
    FromImport(FromImport),
    For(For),
    If(If),
    With(With),
    ExprStmt(ExprStmt),
    Assign(Assign),
    AssignBlock(AssignBlock),
    FilterBlock(FilterBlock),
    Macro(Macro),
    CallBlock(CallBlock),
    Continue(LoopControl),
    Break(LoopControl),
    /// Wrapper the parser injects around `{% autoescape %}`; it has no syntax of its own.
    Scope(Scope),
    ScopedEvalContextModifier(EvalContextModifier),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Output {
    pub nodes: Vec<Expr>,
    pub meta: Meta,
}

/// `{% print a, b %}`
#[derive(Debug, Clone, PartialEq)]
pub struct Print {
    pub nodes: Vec<Expr>,
    pub meta: Meta,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Extends {
    pub template: Expr,
    pub meta: Meta,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub name: String,
    pub body: Vec<Stmt>,
    pub scoped: bool,
    pub required: bool,
    /// Whether `{% endblock name %}` repeats the block name.
    pub end_name: bool,
    pub meta: Meta,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Include {
    pub template: Expr,
    pub ignore_missing: bool,
    /// `None` when no `with context`/`without context` clause was written.
    pub with_context: Option<bool>,
    pub meta: Meta,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Import {
    pub template: Expr,
    pub target: String,
    pub with_context: Option<bool>,
    pub meta: Meta,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImportName {
    pub name: String,
    pub alias: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FromImport {
    pub template: Expr,
    pub names: Vec<ImportName>,
    pub with_context: Option<bool>,
    pub meta: Meta,
}

#[derive(Debug, Clone, PartialEq)]
pub struct For {
    pub target: Expr,
    pub iter: Expr,
    pub body: Vec<Stmt>,
    pub else_: Vec<Stmt>,
    pub test: Option<Expr>,
    pub recursive: bool,
    pub meta: Meta,
}

/// `elif` branches are stored flat on the outermost `If`. The outer node's
/// pairs list every tag in source order, and each `elif` also keeps its own.
#[derive(Debug, Clone, PartialEq)]
pub struct If {
    pub test: Expr,
    pub body: Vec<Stmt>,
    pub elif_: Vec<If>,
    pub else_: Vec<Stmt>,
    pub meta: Meta,
}

#[derive(Debug, Clone, PartialEq)]
pub struct With {
    pub targets: Vec<Expr>,
    pub values: Vec<Expr>,
    pub body: Vec<Stmt>,
    pub meta: Meta,
}

/// `{% do expr %}`
#[derive(Debug, Clone, PartialEq)]
pub struct ExprStmt {
    pub node: Expr,
    pub meta: Meta,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Assign {
    pub target: Expr,
    pub node: Expr,
    pub meta: Meta,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AssignBlock {
    pub target: Expr,
    /// A `Filter` chain whose innermost node is `None`.
    pub filter: Option<Expr>,
    pub body: Vec<Stmt>,
    pub meta: Meta,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FilterBlock {
    pub filter: Expr,
    pub body: Vec<Stmt>,
    pub meta: Meta,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Macro {
    pub name: String,
    pub args: Vec<Expr>,
    pub defaults: Vec<Expr>,
    pub body: Vec<Stmt>,
    pub meta: Meta,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CallBlock {
    pub call: Expr,
    pub args: Vec<Expr>,
    pub defaults: Vec<Expr>,
    pub body: Vec<Stmt>,
    pub meta: Meta,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoopControl {
    pub meta: Meta,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Scope {
    pub body: Vec<Stmt>,
    pub meta: Meta,
}

/// `{% autoescape expr %}`
#[derive(Debug, Clone, PartialEq)]
pub struct EvalContextModifier {
    pub options: Vec<Keyword>,
    pub body: Vec<Stmt>,
    pub meta: Meta,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ctx {
    Load,
    Store,
    Param,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Pow,
    And,
    Or,
}

impl BinOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::FloorDiv => "//",
            BinOp::Mod => "%",
            BinOp::Pow => "**",
            BinOp::And => "and",
            BinOp::Or => "or",
        }
    }

    /// Whether the operator is spelled as a keyword rather than punctuation.
    pub fn is_keyword(&self) -> bool {
        matches!(self, BinOp::And | BinOp::Or)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
    Pos,
}

impl UnaryOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            UnaryOp::Not => "not",
            UnaryOp::Neg => "-",
            UnaryOp::Pos => "+",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Gt,
    Gteq,
    Lt,
    Lteq,
    In,
    NotIn,
}

impl CmpOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            CmpOp::Eq => "==",
            CmpOp::Ne => "!=",
            CmpOp::Gt => ">",
            CmpOp::Gteq => ">=",
            CmpOp::Lt => "<",
            CmpOp::Lteq => "<=",
            CmpOp::In => "in",
            CmpOp::NotIn => "not in",
        }
    }

    pub fn from_operator(op: &str) -> Option<Self> {
        match op {
            "==" => Some(CmpOp::Eq),
            "!=" => Some(CmpOp::Ne),
            ">" => Some(CmpOp::Gt),
            ">=" => Some(CmpOp::Gteq),
            "<" => Some(CmpOp::Lt),
            "<=" => Some(CmpOp::Lteq),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConstValue {
    None,
    Bool(bool),
    Int(i128),
    Float(f64),
    Str(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Name(Name),
    NSRef(NSRef),
    Const(Const),
    TemplateData(TemplateData),
    Tuple(Tuple),
    List(List),
    Dict(Dict),
    CondExpr(CondExpr),
    BinExpr(BinExpr),
    UnaryExpr(UnaryExpr),
    Concat(Concat),
    Compare(Compare),
    Getattr(Getattr),
    Getitem(Getitem),
    Slice(Slice),
    Filter(Filter),
    Test(Test),
    Call(Call),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Name {
    pub name: String,
    pub ctx: Ctx,
    pub meta: Meta,
}

/// `ns.attr` as an assignment target.
#[derive(Debug, Clone, PartialEq)]
pub struct NSRef {
    pub name: String,
    pub attr: String,
    pub meta: Meta,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Const {
    pub value: ConstValue,
    pub meta: Meta,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TemplateData {
    pub data: String,
    pub meta: Meta,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Tuple {
    pub items: Vec<Expr>,
    pub ctx: Ctx,
    pub meta: Meta,
}

#[derive(Debug, Clone, PartialEq)]
pub struct List {
    pub items: Vec<Expr>,
    pub meta: Meta,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Dict {
    pub items: Vec<Pair>,
    pub meta: Meta,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Pair {
    pub key: Expr,
    pub value: Expr,
    pub meta: Meta,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Keyword {
    pub key: String,
    pub value: Expr,
    pub meta: Meta,
}

/// `expr1 if test else expr2`
#[derive(Debug, Clone, PartialEq)]
pub struct CondExpr {
    pub test: Box<Expr>,
    pub expr1: Box<Expr>,
    pub expr2: Option<Box<Expr>>,
    pub meta: Meta,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BinExpr {
    pub op: BinOp,
    pub left: Box<Expr>,
    pub right: Box<Expr>,
    pub meta: Meta,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UnaryExpr {
    pub op: UnaryOp,
    pub node: Box<Expr>,
    /// `not` written inside a test (`x is not defined`) instead of as a prefix.
    pub inline: bool,
    pub meta: Meta,
}

/// `a ~ b ~ c`
#[derive(Debug, Clone, PartialEq)]
pub struct Concat {
    pub nodes: Vec<Expr>,
    pub meta: Meta,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Compare {
    pub expr: Box<Expr>,
    pub ops: Vec<Operand>,
    pub meta: Meta,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Operand {
    pub op: CmpOp,
    pub expr: Expr,
    pub meta: Meta,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Getattr {
    pub node: Box<Expr>,
    pub attr: String,
    pub meta: Meta,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Getitem {
    pub node: Box<Expr>,
    pub arg: Box<Expr>,
    /// `foo.0` rather than `foo[0]`.
    pub dotted: bool,
    pub meta: Meta,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Slice {
    pub start: Option<Box<Expr>>,
    pub stop: Option<Box<Expr>>,
    pub step: Option<Box<Expr>>,
    pub meta: Meta,
}

/// Arguments shared by calls, filters and tests.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallArgs {
    pub args: Vec<Expr>,
    pub kwargs: Vec<Keyword>,
    pub dyn_args: Option<Box<Expr>>,
    pub dyn_kwargs: Option<Box<Expr>>,
}

impl CallArgs {
    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
            && self.kwargs.is_empty()
            && self.dyn_args.is_none()
            && self.dyn_kwargs.is_none()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    /// `None` inside `{% filter %}` and `{% set x | f %}`.
    pub node: Option<Box<Expr>>,
    pub name: String,
    pub args: CallArgs,
    pub meta: Meta,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Test {
    pub node: Box<Expr>,
    pub name: String,
    pub args: CallArgs,
    pub meta: Meta,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub node: Box<Expr>,
    pub args: CallArgs,
    pub meta: Meta,
}

impl Expr {
    pub fn meta(&self) -> &Meta {
        match self {
            Expr::Name(n) => &n.meta,
            Expr::NSRef(n) => &n.meta,
            Expr::Const(n) => &n.meta,
            Expr::TemplateData(n) => &n.meta,
            Expr::Tuple(n) => &n.meta,
            Expr::List(n) => &n.meta,
            Expr::Dict(n) => &n.meta,
            Expr::CondExpr(n) => &n.meta,
            Expr::BinExpr(n) => &n.meta,
            Expr::UnaryExpr(n) => &n.meta,
            Expr::Concat(n) => &n.meta,
            Expr::Compare(n) => &n.meta,
            Expr::Getattr(n) => &n.meta,
            Expr::Getitem(n) => &n.meta,
            Expr::Slice(n) => &n.meta,
            Expr::Filter(n) => &n.meta,
            Expr::Test(n) => &n.meta,
            Expr::Call(n) => &n.meta,
        }
    }

    pub fn meta_mut(&mut self) -> &mut Meta {
        match self {
            Expr::Name(n) => &mut n.meta,
            Expr::NSRef(n) => &mut n.meta,
            Expr::Const(n) => &mut n.meta,
            Expr::TemplateData(n) => &mut n.meta,
            Expr::Tuple(n) => &mut n.meta,
            Expr::List(n) => &mut n.meta,
            Expr::Dict(n) => &mut n.meta,
            Expr::CondExpr(n) => &mut n.meta,
            Expr::BinExpr(n) => &mut n.meta,
            Expr::UnaryExpr(n) => &mut n.meta,
            Expr::Concat(n) => &mut n.meta,
            Expr::Compare(n) => &mut n.meta,
            Expr::Getattr(n) => &mut n.meta,
            Expr::Getitem(n) => &mut n.meta,
            Expr::Slice(n) => &mut n.meta,
            Expr::Filter(n) => &mut n.meta,
            Expr::Test(n) => &mut n.meta,
            Expr::Call(n) => &mut n.meta,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Expr::Name(_) => "Name",
            Expr::NSRef(_) => "NSRef",
            Expr::Const(_) => "Const",
            Expr::TemplateData(_) => "TemplateData",
            Expr::Tuple(_) => "Tuple",
            Expr::List(_) => "List",
            Expr::Dict(_) => "Dict",
            Expr::CondExpr(_) => "CondExpr",
            Expr::BinExpr(_) => "BinExpr",
            Expr::UnaryExpr(_) => "UnaryExpr",
            Expr::Concat(_) => "Concat",
            Expr::Compare(_) => "Compare",
            Expr::Getattr(_) => "Getattr",
            Expr::Getitem(_) => "Getitem",
            Expr::Slice(_) => "Slice",
            Expr::Filter(_) => "Filter",
            Expr::Test(_) => "Test",
            Expr::Call(_) => "Call",
        }
    }

    /// Whether the node may appear on the left of `=`.
    pub fn can_assign(&self) -> bool {
        match self {
            Expr::Name(n) => !matches!(n.name.as_str(), "true" | "false" | "none" | "True" | "False" | "None"),
            Expr::NSRef(_) => true,
            Expr::Tuple(t) => t.items.iter().all(Expr::can_assign),
            _ => false,
        }
    }

    /// Switches a load target into store or parameter context.
    pub fn set_ctx(&mut self, ctx: Ctx) {
        match self {
            Expr::Name(n) => n.ctx = ctx,
            Expr::Tuple(t) => {
                t.ctx = ctx;
                for item in &mut t.items {
                    item.set_ctx(ctx);
                }
            }
            _ => {}
        }
    }

    pub fn name(name: &str) -> Self {
        Expr::Name(Name {
            name: name.to_string(),
            ctx: Ctx::Load,
            meta: Meta::default(),
        })
    }

    pub fn constant(value: ConstValue) -> Self {
        Expr::Const(Const {
            value,
            meta: Meta::default(),
        })
    }

    pub fn string(value: &str) -> Self {
        Self::constant(ConstValue::Str(value.to_string()))
    }

    pub fn filter(node: Expr, name: &str, args: Vec<Expr>) -> Self {
        Expr::Filter(Filter {
            node: Some(Box::new(node)),
            name: name.to_string(),
            args: CallArgs {
                args,
                ..CallArgs::default()
            },
            meta: Meta::default(),
        })
    }

    /// Negates `node`, using the `is not` spelling when it is a test.
    pub fn not(node: Expr) -> Self {
        let inline = matches!(node, Expr::Test(_));
        Expr::UnaryExpr(UnaryExpr {
            op: UnaryOp::Not,
            node: Box::new(node),
            inline,
            meta: Meta::default(),
        })
    }

    pub fn binary(op: BinOp, left: Expr, right: Expr) -> Self {
        Expr::BinExpr(BinExpr {
            op,
            left: Box::new(left),
            right: Box::new(right),
            meta: Meta::default(),
        })
    }
}

impl Stmt {
    pub fn meta(&self) -> &Meta {
        match self {
            Stmt::Output(n) => &n.meta,
            Stmt::Print(n) => &n.meta,
            Stmt::Extends(n) => &n.meta,
            Stmt::Block(n) => &n.meta,
            Stmt::Include(n) => &n.meta,
            Stmt::Import(n) => &n.meta,
            Stmt::FromImport(n) => &n.meta,
            Stmt::For(n) => &n.meta,
            Stmt::If(n) => &n.meta,
            Stmt::With(n) => &n.meta,
            Stmt::ExprStmt(n) => &n.meta,
            Stmt::Assign(n) => &n.meta,
            Stmt::AssignBlock(n) => &n.meta,
            Stmt::FilterBlock(n) => &n.meta,
            Stmt::Macro(n) => &n.meta,
            Stmt::CallBlock(n) => &n.meta,
            Stmt::Continue(n) | Stmt::Break(n) => &n.meta,
            Stmt::Scope(n) => &n.meta,
            Stmt::ScopedEvalContextModifier(n) => &n.meta,
        }
    }

    pub fn meta_mut(&mut self) -> &mut Meta {
        match self {
            Stmt::Output(n) => &mut n.meta,
            Stmt::Print(n) => &mut n.meta,
            Stmt::Extends(n) => &mut n.meta,
            Stmt::Block(n) => &mut n.meta,
            Stmt::Include(n) => &mut n.meta,
            Stmt::Import(n) => &mut n.meta,
            Stmt::FromImport(n) => &mut n.meta,
            Stmt::For(n) => &mut n.meta,
            Stmt::If(n) => &mut n.meta,
            Stmt::With(n) => &mut n.meta,
            Stmt::ExprStmt(n) => &mut n.meta,
            Stmt::Assign(n) => &mut n.meta,
            Stmt::AssignBlock(n) => &mut n.meta,
            Stmt::FilterBlock(n) => &mut n.meta,
            Stmt::Macro(n) => &mut n.meta,
            Stmt::CallBlock(n) => &mut n.meta,
            Stmt::Continue(n) | Stmt::Break(n) => &mut n.meta,
            Stmt::Scope(n) => &mut n.meta,
            Stmt::ScopedEvalContextModifier(n) => &mut n.meta,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Stmt::Output(_) => "Output",
            Stmt::Print(_) => "Print",
            Stmt::Extends(_) => "Extends",
            Stmt::Block(_) => "Block",
            Stmt::Include(_) => "Include",
            Stmt::Import(_) => "Import",
            Stmt::FromImport(_) => "FromImport",
            Stmt::For(_) => "For",
            Stmt::If(_) => "If",
            Stmt::With(_) => "With",
            Stmt::ExprStmt(_) => "ExprStmt",
            Stmt::Assign(_) => "Assign",
            Stmt::AssignBlock(_) => "AssignBlock",
            Stmt::FilterBlock(_) => "FilterBlock",
            Stmt::Macro(_) => "Macro",
            Stmt::CallBlock(_) => "CallBlock",
            Stmt::Continue(_) => "Continue",
            Stmt::Break(_) => "Break",
            Stmt::Scope(_) => "Scope",
            Stmt::ScopedEvalContextModifier(_) => "ScopedEvalContextModifier",
        }
    }
}

/// Borrowed view of any node, for generic traversal.
#[derive(Debug, Clone, Copy)]
pub enum NodeRef<'a> {
    Template(&'a Template),
    Stmt(&'a Stmt),
    Elif(&'a If),
    Expr(&'a Expr),
    Pair(&'a Pair),
    Keyword(&'a Keyword),
    Operand(&'a Operand),
}

impl<'a> NodeRef<'a> {
    pub fn meta(&self) -> &'a Meta {
        match *self {
            NodeRef::Template(n) => &n.meta,
            NodeRef::Stmt(n) => n.meta(),
            NodeRef::Elif(n) => &n.meta,
            NodeRef::Expr(n) => n.meta(),
            NodeRef::Pair(n) => &n.meta,
            NodeRef::Keyword(n) => &n.meta,
            NodeRef::Operand(n) => &n.meta,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match *self {
            NodeRef::Template(_) => "Template",
            NodeRef::Stmt(n) => n.kind_name(),
            NodeRef::Elif(_) => "If",
            NodeRef::Expr(n) => n.kind_name(),
            NodeRef::Pair(_) => "Pair",
            NodeRef::Keyword(_) => "Keyword",
            NodeRef::Operand(_) => "Operand",
        }
    }

    /// Direct children in source order.
    pub fn children(&self) -> Vec<NodeRef<'a>> {
        let mut out = Vec::new();
        match *self {
            NodeRef::Template(t) => stmts(&mut out, &t.body),
            NodeRef::Stmt(s) => stmt_children(&mut out, s),
            NodeRef::Elif(n) => {
                out.push(NodeRef::Expr(&n.test));
                stmts(&mut out, &n.body);
            }
            NodeRef::Expr(e) => expr_children(&mut out, e),
            NodeRef::Pair(p) => {
                out.push(NodeRef::Expr(&p.key));
                out.push(NodeRef::Expr(&p.value));
            }
            NodeRef::Keyword(k) => out.push(NodeRef::Expr(&k.value)),
            NodeRef::Operand(o) => out.push(NodeRef::Expr(&o.expr)),
        }
        out
    }
}

fn stmts<'a>(out: &mut Vec<NodeRef<'a>>, body: &'a [Stmt]) {
    out.extend(body.iter().map(NodeRef::Stmt));
}

fn exprs<'a>(out: &mut Vec<NodeRef<'a>>, items: &'a [Expr]) {
    out.extend(items.iter().map(NodeRef::Expr));
}

fn call_args<'a>(out: &mut Vec<NodeRef<'a>>, args: &'a CallArgs) {
    exprs(out, &args.args);
    out.extend(args.kwargs.iter().map(NodeRef::Keyword));
    if let Some(d) = &args.dyn_args {
        out.push(NodeRef::Expr(d));
    }
    if let Some(d) = &args.dyn_kwargs {
        out.push(NodeRef::Expr(d));
    }
}

fn signature<'a>(out: &mut Vec<NodeRef<'a>>, args: &'a [Expr], defaults: &'a [Expr]) {
    // defaults belong to the trailing arguments
    let offset = args.len().saturating_sub(defaults.len());
    for (i, arg) in args.iter().enumerate() {
        out.push(NodeRef::Expr(arg));
        if i >= offset {
            out.push(NodeRef::Expr(&defaults[i - offset]));
        }
    }
}

fn stmt_children<'a>(out: &mut Vec<NodeRef<'a>>, stmt: &'a Stmt) {
    match stmt {
        Stmt::Output(n) => exprs(out, &n.nodes),
        Stmt::Print(n) => exprs(out, &n.nodes),
        Stmt::Extends(n) => out.push(NodeRef::Expr(&n.template)),
        Stmt::Block(n) => stmts(out, &n.body),
        Stmt::Include(n) => out.push(NodeRef::Expr(&n.template)),
        Stmt::Import(n) => out.push(NodeRef::Expr(&n.template)),
        Stmt::FromImport(n) => out.push(NodeRef::Expr(&n.template)),
        Stmt::For(n) => {
            out.push(NodeRef::Expr(&n.target));
            out.push(NodeRef::Expr(&n.iter));
            if let Some(test) = &n.test {
                out.push(NodeRef::Expr(test));
            }
            stmts(out, &n.body);
            stmts(out, &n.else_);
        }
        Stmt::If(n) => {
            out.push(NodeRef::Expr(&n.test));
            stmts(out, &n.body);
            out.extend(n.elif_.iter().map(NodeRef::Elif));
            stmts(out, &n.else_);
        }
        Stmt::With(n) => {
            for (target, value) in n.targets.iter().zip(&n.values) {
                out.push(NodeRef::Expr(target));
                out.push(NodeRef::Expr(value));
            }
            stmts(out, &n.body);
        }
        Stmt::ExprStmt(n) => out.push(NodeRef::Expr(&n.node)),
        Stmt::Assign(n) => {
            out.push(NodeRef::Expr(&n.target));
            out.push(NodeRef::Expr(&n.node));
        }
        Stmt::AssignBlock(n) => {
            out.push(NodeRef::Expr(&n.target));
            if let Some(filter) = &n.filter {
                out.push(NodeRef::Expr(filter));
            }
            stmts(out, &n.body);
        }
        Stmt::FilterBlock(n) => {
            out.push(NodeRef::Expr(&n.filter));
            stmts(out, &n.body);
        }
        Stmt::Macro(n) => {
            signature(out, &n.args, &n.defaults);
            stmts(out, &n.body);
        }
        Stmt::CallBlock(n) => {
            signature(out, &n.args, &n.defaults);
            out.push(NodeRef::Expr(&n.call));
            stmts(out, &n.body);
        }
        Stmt::Continue(_) | Stmt::Break(_) => {}
        Stmt::Scope(n) => stmts(out, &n.body),
        Stmt::ScopedEvalContextModifier(n) => {
            out.extend(n.options.iter().map(NodeRef::Keyword));
            stmts(out, &n.body);
        }
    }
}

fn expr_children<'a>(out: &mut Vec<NodeRef<'a>>, expr: &'a Expr) {
    match expr {
        Expr::Name(_) | Expr::NSRef(_) | Expr::Const(_) | Expr::TemplateData(_) => {}
        Expr::Tuple(n) => exprs(out, &n.items),
        Expr::List(n) => exprs(out, &n.items),
        Expr::Dict(n) => out.extend(n.items.iter().map(NodeRef::Pair)),
        Expr::CondExpr(n) => {
            out.push(NodeRef::Expr(&n.expr1));
            out.push(NodeRef::Expr(&n.test));
            if let Some(e) = &n.expr2 {
                out.push(NodeRef::Expr(e));
            }
        }
        Expr::BinExpr(n) => {
            out.push(NodeRef::Expr(&n.left));
            out.push(NodeRef::Expr(&n.right));
        }
        Expr::UnaryExpr(n) => out.push(NodeRef::Expr(&n.node)),
        Expr::Concat(n) => exprs(out, &n.nodes),
        Expr::Compare(n) => {
            out.push(NodeRef::Expr(&n.expr));
            out.extend(n.ops.iter().map(NodeRef::Operand));
        }
        Expr::Getattr(n) => out.push(NodeRef::Expr(&n.node)),
        Expr::Getitem(n) => {
            out.push(NodeRef::Expr(&n.node));
            out.push(NodeRef::Expr(&n.arg));
        }
        Expr::Slice(n) => {
            for part in [&n.start, &n.stop, &n.step].into_iter().flatten() {
                out.push(NodeRef::Expr(part));
            }
        }
        Expr::Filter(n) => {
            if let Some(node) = &n.node {
                out.push(NodeRef::Expr(node));
            }
            call_args(out, &n.args);
        }
        Expr::Test(n) => {
            out.push(NodeRef::Expr(&n.node));
            call_args(out, &n.args);
        }
        Expr::Call(n) => {
            out.push(NodeRef::Expr(&n.node));
            call_args(out, &n.args);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_nodes_are_unannotated() {
        let expr = Expr::filter(Expr::name("x"), "default", vec![Expr::string("a")]);
        assert!(!expr.meta().is_annotated());
        assert_eq!(expr.kind_name(), "Filter");
        assert_eq!(NodeRef::Expr(&expr).children().len(), 2);
    }

    #[test]
    fn test_set_ctx_on_tuple() {
        let mut target = Expr::Tuple(Tuple {
            items: vec![Expr::name("a"), Expr::name("b")],
            ctx: Ctx::Load,
            meta: Meta::default(),
        });
        target.set_ctx(Ctx::Store);
        let Expr::Tuple(t) = &target else {
            panic!("expected tuple");
        };
        assert_eq!(t.ctx, Ctx::Store);
        assert!(t.items.iter().all(|i| matches!(i, Expr::Name(n) if n.ctx == Ctx::Store)));
        assert!(target.can_assign());
    }

    #[test]
    fn test_constants_cannot_be_assigned() {
        assert!(!Expr::name("true").can_assign());
        assert!(!Expr::string("x").can_assign());
        assert!(Expr::name("x").can_assign());
    }

    #[test]
    fn test_signature_children_interleave_defaults() {
        let stmt = Stmt::Macro(Macro {
            name: "m".to_string(),
            args: vec![Expr::name("a"), Expr::name("b")],
            defaults: vec![Expr::string("x")],
            body: vec![],
            meta: Meta::default(),
        });
        let names: Vec<_> = NodeRef::Stmt(&stmt)
            .children()
            .iter()
            .map(|c| c.kind_name())
            .collect();
        assert_eq!(names, vec!["Name", "Name", "Const"]);
    }

    #[test]
    fn test_operator_symbols() {
        assert_eq!(BinOp::FloorDiv.symbol(), "//");
        assert!(BinOp::And.is_keyword());
        assert_eq!(CmpOp::NotIn.symbol(), "not in");
        assert_eq!(CmpOp::from_operator(">="), Some(CmpOp::Gteq));
        assert_eq!(UnaryOp::Neg.symbol(), "-");
    }
}
