use crate::parser::error::TemplateError;
use crate::parser::lexer::{Lexeme, TokenKind};
use crate::types::ast::*;
use tracing::debug;

const COMPARE_OPERATORS: [&str; 6] = ["==", "!=", ">", ">=", "<", "<="];

/// Recursive descent parser over the interpreted token stream.
///
/// Precedence, from loosest to tightest: conditional expression, `or`, `and`,
/// `not`, comparison, `+`/`-`, `~`, `*`/`/`/`//`/`%`, `**`, filters and tests,
/// unary sign, postfix (`.`, `[]`, calls).
pub struct Parser<'a> {
    lexemes: Vec<Lexeme>,
    pos: usize,
    name: Option<&'a str>,
    depth: usize,
}

impl<'a> Parser<'a> {
    /// `lexemes` must end with an EOF lexeme.
    pub fn new(mut lexemes: Vec<Lexeme>, name: Option<&'a str>) -> Self {
        if lexemes.last().map_or(true, |l| l.kind != TokenKind::Eof) {
            let lineno = lexemes.last().map_or(1, |l| l.lineno);
            lexemes.push(Lexeme {
                lineno,
                kind: TokenKind::Eof,
                value: String::new(),
            });
        }
        Self {
            lexemes,
            pos: 0,
            name,
            depth: 0,
        }
    }

    pub fn parse(mut self) -> Result<Template, TemplateError> {
        let body = self.subparse(None)?;
        debug!(statements = body.len(), "parsed template");
        Ok(Template {
            body,
            meta: Meta::at(1),
        })
    }

    fn current(&self) -> &Lexeme {
        &self.lexemes[self.pos.min(self.lexemes.len() - 1)]
    }

    fn look(&self) -> &Lexeme {
        &self.lexemes[(self.pos + 1).min(self.lexemes.len() - 1)]
    }

    fn next(&mut self) -> Lexeme {
        let token = self.current().clone();
        if token.kind != TokenKind::Eof {
            self.pos += 1;
        }
        token
    }

    fn lineno(&self) -> usize {
        self.current().lineno
    }

    fn fail(&self, lineno: usize, message: impl Into<String>) -> TemplateError {
        TemplateError::syntax(self.name, lineno, message)
    }

    /// Runs `parse` one nesting level deeper.
    fn nested<T>(
        &mut self,
        parse: impl FnOnce(&mut Self) -> Result<T, TemplateError>,
    ) -> Result<T, TemplateError> {
        if self.depth >= MAX_NESTING {
            return Err(self.fail(
                self.lineno(),
                format!("template nesting exceeds {MAX_NESTING} levels"),
            ));
        }
        self.depth += 1;
        let result = parse(self);
        self.depth -= 1;
        result
    }

    fn is_kind(&self, kind: TokenKind) -> bool {
        self.current().kind == kind
    }

    fn is_op(&self, op: &str) -> bool {
        self.current().is_operator(op)
    }

    fn is_name(&self, name: &str) -> bool {
        self.current().is_name(name)
    }

    fn skip_op(&mut self, op: &str) -> bool {
        let found = self.is_op(op);
        if found {
            self.next();
        }
        found
    }

    fn skip_name(&mut self, name: &str) -> bool {
        let found = self.is_name(name);
        if found {
            self.next();
        }
        found
    }

    fn unexpected(&self, expected: &str) -> TemplateError {
        let current = self.current();
        if current.kind == TokenKind::Eof {
            return self.fail(
                current.lineno,
                format!("unexpected end of template, expected {expected}"),
            );
        }
        self.fail(
            current.lineno,
            format!("expected token {expected}, got {}", current.describe()),
        )
    }

    fn expect_kind(&mut self, kind: TokenKind) -> Result<Lexeme, TemplateError> {
        if self.is_kind(kind) {
            return Ok(self.next());
        }
        let expected = Lexeme {
            lineno: 0,
            kind,
            value: String::new(),
        }
        .describe();
        Err(self.unexpected(&format!("'{expected}'")))
    }

    fn expect_op(&mut self, op: &str) -> Result<Lexeme, TemplateError> {
        if self.is_op(op) {
            return Ok(self.next());
        }
        Err(self.unexpected(&format!("'{op}'")))
    }

    fn expect_keyword(&mut self, name: &str) -> Result<Lexeme, TemplateError> {
        if self.is_name(name) {
            return Ok(self.next());
        }
        Err(self.unexpected(&format!("'{name}'")))
    }

    fn expect_name(&mut self) -> Result<Lexeme, TemplateError> {
        if self.is_kind(TokenKind::Name) {
            return Ok(self.next());
        }
        Err(self.unexpected("'name'"))
    }

    fn subparse(&mut self, end_tokens: Option<&[&str]>) -> Result<Vec<Stmt>, TemplateError> {
        let mut body = Vec::new();
        let mut buffer: Vec<Expr> = Vec::new();
        let mut buffer_lineno = 0;

        fn flush(body: &mut Vec<Stmt>, buffer: &mut Vec<Expr>, lineno: usize) {
            if !buffer.is_empty() {
                body.push(Stmt::Output(Output {
                    nodes: std::mem::take(buffer),
                    meta: Meta::at(lineno),
                }));
            }
        }

        loop {
            let token = self.current().clone();
            match token.kind {
                TokenKind::Data => {
                    if buffer.is_empty() {
                        buffer_lineno = token.lineno;
                    }
                    buffer.push(Expr::TemplateData(TemplateData {
                        data: token.value.clone(),
                        meta: Meta::at(token.lineno),
                    }));
                    self.next();
                }
                TokenKind::VariableBegin => {
                    if buffer.is_empty() {
                        buffer_lineno = token.lineno;
                    }
                    self.next();
                    buffer.push(self.parse_tuple(false, true, &[], false)?);
                    self.expect_kind(TokenKind::VariableEnd)?;
                }
                TokenKind::BlockBegin => {
                    flush(&mut body, &mut buffer, buffer_lineno);
                    self.next();
                    if let Some(end_tokens) = end_tokens {
                        if end_tokens.iter().any(|t| self.is_name(t)) {
                            return Ok(body);
                        }
                    }
                    let stmt = self.nested(Self::parse_statement)?;
                    body.push(stmt);
                    self.expect_kind(TokenKind::BlockEnd)?;
                }
                TokenKind::Eof => break,
                _ => {
                    return Err(self.fail(
                        token.lineno,
                        format!("unexpected {}", token.describe()),
                    ))
                }
            }
        }
        flush(&mut body, &mut buffer, buffer_lineno);
        Ok(body)
    }

    fn parse_statement(&mut self) -> Result<Stmt, TemplateError> {
        let token = self.current().clone();
        if token.kind != TokenKind::Name {
            return Err(self.fail(token.lineno, "tag name expected"));
        }
        match token.value.as_str() {
            "for" => self.parse_for(),
            "if" => self.parse_if(),
            "block" => self.parse_block(),
            "extends" => self.parse_extends(),
            "print" => self.parse_print(),
            "macro" => self.parse_macro(),
            "include" => self.parse_include(),
            "from" => self.parse_from(),
            "import" => self.parse_import(),
            "set" => self.parse_set(),
            "with" => self.parse_with(),
            "autoescape" => self.parse_autoescape(),
            "call" => self.parse_call_block(),
            "filter" => self.parse_filter_block(),
            "do" => {
                self.next();
                let node = self.parse_tuple(false, true, &[], false)?;
                Ok(Stmt::ExprStmt(ExprStmt {
                    node,
                    meta: Meta::at(token.lineno),
                }))
            }
            "continue" | "break" => {
                self.next();
                let control = LoopControl {
                    meta: Meta::at(token.lineno),
                };
                Ok(if token.value == "continue" {
                    Stmt::Continue(control)
                } else {
                    Stmt::Break(control)
                })
            }
            other => Err(self.fail(
                token.lineno,
                format!("Encountered unknown tag '{other}'."),
            )),
        }
    }

    /// Parses a statement body up to one of `end_tokens`, leaving the cursor on
    /// the end tag name unless `drop_needle` is set.
    fn parse_statements(
        &mut self,
        end_tokens: &[&str],
        drop_needle: bool,
    ) -> Result<Vec<Stmt>, TemplateError> {
        self.skip_op(":");
        self.expect_kind(TokenKind::BlockEnd)?;
        let body = self.subparse(Some(end_tokens))?;
        if self.is_kind(TokenKind::Eof) {
            let expected = end_tokens
                .iter()
                .map(|t| format!("'{t}'"))
                .collect::<Vec<_>>()
                .join(" or ");
            return Err(self.fail(
                self.lineno(),
                format!(
                    "Unexpected end of template. Jinja was looking for the following tags: {expected}."
                ),
            ));
        }
        if drop_needle {
            self.next();
        }
        Ok(body)
    }

    fn parse_for(&mut self) -> Result<Stmt, TemplateError> {
        let lineno = self.expect_keyword("for")?.lineno;
        let target = self.parse_assign_target(true, false, &["in"], false)?;
        self.expect_keyword("in")?;
        let iter = self.parse_tuple(false, false, &["recursive"], false)?;
        let test = if self.skip_name("if") {
            Some(self.parse_expression(true)?)
        } else {
            None
        };
        let recursive = self.skip_name("recursive");
        let body = self.parse_statements(&["endfor", "else"], false)?;
        let else_ = if self.next().value == "endfor" {
            Vec::new()
        } else {
            self.parse_statements(&["endfor"], true)?
        };
        Ok(Stmt::For(For {
            target,
            iter,
            body,
            else_,
            test,
            recursive,
            meta: Meta::at(lineno),
        }))
    }

    fn parse_if(&mut self) -> Result<Stmt, TemplateError> {
        let lineno = self.expect_keyword("if")?.lineno;
        let test = self.parse_tuple(false, false, &[], false)?;
        let body = self.parse_statements(&["elif", "else", "endif"], false)?;
        let mut root = If {
            test,
            body,
            elif_: Vec::new(),
            else_: Vec::new(),
            meta: Meta::at(lineno),
        };
        loop {
            let token = self.next();
            if token.is_name("elif") {
                let test = self.parse_tuple(false, false, &[], false)?;
                let body = self.parse_statements(&["elif", "else", "endif"], false)?;
                root.elif_.push(If {
                    test,
                    body,
                    elif_: Vec::new(),
                    else_: Vec::new(),
                    meta: Meta::at(token.lineno),
                });
                continue;
            }
            if token.is_name("else") {
                root.else_ = self.parse_statements(&["endif"], true)?;
            }
            break;
        }
        Ok(Stmt::If(root))
    }

    fn parse_with(&mut self) -> Result<Stmt, TemplateError> {
        let lineno = self.expect_keyword("with")?.lineno;
        let mut targets = Vec::new();
        let mut values = Vec::new();
        while !self.is_kind(TokenKind::BlockEnd) {
            if !targets.is_empty() {
                self.expect_op(",")?;
            }
            let mut target = self.parse_assign_target(true, false, &[], false)?;
            target.set_ctx(Ctx::Param);
            targets.push(target);
            self.expect_op("=")?;
            values.push(self.parse_expression(true)?);
        }
        let body = self.parse_statements(&["endwith"], true)?;
        Ok(Stmt::With(With {
            targets,
            values,
            body,
            meta: Meta::at(lineno),
        }))
    }

    fn parse_autoescape(&mut self) -> Result<Stmt, TemplateError> {
        let lineno = self.next().lineno;
        let value = self.parse_expression(true)?;
        let options = vec![Keyword {
            key: "autoescape".to_string(),
            value,
            meta: Meta::at(lineno),
        }];
        let body = self.parse_statements(&["endautoescape"], true)?;
        Ok(Stmt::Scope(Scope {
            body: vec![Stmt::ScopedEvalContextModifier(EvalContextModifier {
                options,
                body,
                meta: Meta::at(lineno),
            })],
            meta: Meta::at(lineno),
        }))
    }

    fn parse_block(&mut self) -> Result<Stmt, TemplateError> {
        let lineno = self.next().lineno;
        let name = self.expect_name()?.value;
        let scoped = self.skip_name("scoped");
        let required = self.skip_name("required");
        if self.is_op("-") {
            return Err(self.fail(
                self.lineno(),
                "Block names in Jinja have to be valid Python identifiers and may not contain hyphens, use an underscore instead.",
            ));
        }
        let body = self.parse_statements(&["endblock"], true)?;
        let end_name = self.skip_name(&name);
        Ok(Stmt::Block(Block {
            name,
            body,
            scoped,
            required,
            end_name,
            meta: Meta::at(lineno),
        }))
    }

    fn parse_extends(&mut self) -> Result<Stmt, TemplateError> {
        let lineno = self.next().lineno;
        let template = self.parse_expression(true)?;
        Ok(Stmt::Extends(Extends {
            template,
            meta: Meta::at(lineno),
        }))
    }

    fn parse_import_context(&mut self) -> Option<bool> {
        if (self.is_name("with") || self.is_name("without")) && self.look().is_name("context") {
            let with = self.next().value == "with";
            self.next();
            Some(with)
        } else {
            None
        }
    }

    fn parse_include(&mut self) -> Result<Stmt, TemplateError> {
        let lineno = self.next().lineno;
        let template = self.parse_expression(true)?;
        let ignore_missing = self.is_name("ignore") && self.look().is_name("missing");
        if ignore_missing {
            self.next();
            self.next();
        }
        let with_context = self.parse_import_context();
        Ok(Stmt::Include(Include {
            template,
            ignore_missing,
            with_context,
            meta: Meta::at(lineno),
        }))
    }

    fn parse_import(&mut self) -> Result<Stmt, TemplateError> {
        let lineno = self.next().lineno;
        let template = self.parse_expression(true)?;
        self.expect_keyword("as")?;
        let target = self.expect_name()?.value;
        let with_context = self.parse_import_context();
        Ok(Stmt::Import(Import {
            template,
            target,
            with_context,
            meta: Meta::at(lineno),
        }))
    }

    fn parse_from(&mut self) -> Result<Stmt, TemplateError> {
        let lineno = self.next().lineno;
        let template = self.parse_expression(true)?;
        self.expect_keyword("import")?;
        let mut names = Vec::new();
        let mut with_context;
        loop {
            if !names.is_empty() {
                self.expect_op(",")?;
            }
            if !self.is_kind(TokenKind::Name) {
                return Err(self.unexpected("'name'"));
            }
            with_context = self.parse_import_context();
            if with_context.is_some() {
                break;
            }
            let target = self.next();
            if target.value.starts_with('_') {
                return Err(self.fail(
                    target.lineno,
                    "names starting with an underline can not be imported",
                ));
            }
            let alias = if self.skip_name("as") {
                Some(self.expect_name()?.value)
            } else {
                None
            };
            names.push(ImportName {
                name: target.value,
                alias,
            });
            with_context = self.parse_import_context();
            if with_context.is_some() || !self.is_op(",") {
                break;
            }
        }
        Ok(Stmt::FromImport(FromImport {
            template,
            names,
            with_context,
            meta: Meta::at(lineno),
        }))
    }

    fn parse_signature(&mut self) -> Result<(Vec<Expr>, Vec<Expr>), TemplateError> {
        let mut args = Vec::new();
        let mut defaults = Vec::new();
        self.expect_op("(")?;
        while !self.is_op(")") {
            if !args.is_empty() {
                self.expect_op(",")?;
            }
            let mut arg = self.parse_assign_target(true, true, &[], false)?;
            arg.set_ctx(Ctx::Param);
            if self.skip_op("=") {
                defaults.push(self.parse_expression(true)?);
            } else if !defaults.is_empty() {
                return Err(self.fail(
                    self.lineno(),
                    "non-default argument follows default argument",
                ));
            }
            args.push(arg);
        }
        self.expect_op(")")?;
        Ok((args, defaults))
    }

    fn parse_call_block(&mut self) -> Result<Stmt, TemplateError> {
        let lineno = self.next().lineno;
        let (args, defaults) = if self.is_op("(") {
            self.parse_signature()?
        } else {
            (Vec::new(), Vec::new())
        };
        let call = self.parse_expression(true)?;
        if !matches!(call, Expr::Call(_)) {
            return Err(self.fail(lineno, "expected call"));
        }
        let body = self.parse_statements(&["endcall"], true)?;
        Ok(Stmt::CallBlock(CallBlock {
            call,
            args,
            defaults,
            body,
            meta: Meta::at(lineno),
        }))
    }

    fn parse_filter_block(&mut self) -> Result<Stmt, TemplateError> {
        let lineno = self.next().lineno;
        let filter = self.parse_filter(None, true)?;
        let Some(filter) = filter else {
            return Err(self.unexpected("'name'"));
        };
        let body = self.parse_statements(&["endfilter"], true)?;
        Ok(Stmt::FilterBlock(FilterBlock {
            filter,
            body,
            meta: Meta::at(lineno),
        }))
    }

    fn parse_macro(&mut self) -> Result<Stmt, TemplateError> {
        let lineno = self.next().lineno;
        let name = self.expect_name()?.value;
        let (args, defaults) = self.parse_signature()?;
        let body = self.parse_statements(&["endmacro"], true)?;
        Ok(Stmt::Macro(Macro {
            name,
            args,
            defaults,
            body,
            meta: Meta::at(lineno),
        }))
    }

    fn parse_print(&mut self) -> Result<Stmt, TemplateError> {
        let lineno = self.next().lineno;
        let mut nodes = Vec::new();
        while !self.is_kind(TokenKind::BlockEnd) {
            if !nodes.is_empty() {
                self.expect_op(",")?;
            }
            nodes.push(self.parse_expression(true)?);
        }
        Ok(Stmt::Print(Print {
            nodes,
            meta: Meta::at(lineno),
        }))
    }

    fn parse_set(&mut self) -> Result<Stmt, TemplateError> {
        let lineno = self.next().lineno;
        let target = self.parse_assign_target(true, false, &[], true)?;
        if self.skip_op("=") {
            let node = self.parse_tuple(false, true, &[], false)?;
            return Ok(Stmt::Assign(Assign {
                target,
                node,
                meta: Meta::at(lineno),
            }));
        }
        let filter = self.parse_filter(None, false)?;
        let body = self.parse_statements(&["endset"], true)?;
        Ok(Stmt::AssignBlock(AssignBlock {
            target,
            filter,
            body,
            meta: Meta::at(lineno),
        }))
    }

    fn parse_assign_target(
        &mut self,
        with_tuple: bool,
        name_only: bool,
        extra_end_rules: &[&str],
        with_namespace: bool,
    ) -> Result<Expr, TemplateError> {
        let lineno = self.lineno();
        let target = if name_only {
            let token = self.expect_name()?;
            Expr::Name(Name {
                name: token.value,
                ctx: Ctx::Store,
                meta: Meta::at(token.lineno),
            })
        } else if with_namespace && self.look().is_operator(".") {
            let token = self.expect_name()?;
            self.next();
            let attr = self.expect_name()?;
            Expr::NSRef(NSRef {
                name: token.value,
                attr: attr.value,
                meta: Meta::at(token.lineno),
            })
        } else {
            let mut target = if with_tuple {
                self.parse_tuple(true, true, extra_end_rules, false)?
            } else {
                self.parse_primary()?
            };
            target.set_ctx(Ctx::Store);
            target
        };
        if !target.can_assign() {
            return Err(self.fail(
                lineno,
                format!("can't assign to {}", target.kind_name().to_lowercase()),
            ));
        }
        Ok(target)
    }

    fn parse_expression(&mut self, with_condexpr: bool) -> Result<Expr, TemplateError> {
        self.nested(|parser| {
            if with_condexpr {
                parser.parse_condexpr()
            } else {
                parser.parse_or()
            }
        })
    }

    fn parse_condexpr(&mut self) -> Result<Expr, TemplateError> {
        let lineno = self.lineno();
        let mut expr1 = self.parse_or()?;
        while self.skip_name("if") {
            let test = self.parse_or()?;
            let expr2 = if self.skip_name("else") {
                Some(Box::new(self.nested(Self::parse_condexpr)?))
            } else {
                None
            };
            expr1 = Expr::CondExpr(CondExpr {
                test: Box::new(test),
                expr1: Box::new(expr1),
                expr2,
                meta: Meta::at(lineno),
            });
        }
        Ok(expr1)
    }

    fn binary(op: BinOp, left: Expr, right: Expr, lineno: usize) -> Expr {
        Expr::BinExpr(BinExpr {
            op,
            left: Box::new(left),
            right: Box::new(right),
            meta: Meta::at(lineno),
        })
    }

    fn parse_or(&mut self) -> Result<Expr, TemplateError> {
        let lineno = self.lineno();
        let mut left = self.parse_and()?;
        while self.skip_name("or") {
            let right = self.parse_and()?;
            left = Self::binary(BinOp::Or, left, right, lineno);
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, TemplateError> {
        let lineno = self.lineno();
        let mut left = self.parse_not()?;
        while self.skip_name("and") {
            let right = self.parse_not()?;
            left = Self::binary(BinOp::And, left, right, lineno);
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr, TemplateError> {
        if self.is_name("not") {
            let lineno = self.next().lineno;
            let node = self.nested(Self::parse_not)?;
            return Ok(Expr::UnaryExpr(UnaryExpr {
                op: UnaryOp::Not,
                node: Box::new(node),
                inline: false,
                meta: Meta::at(lineno),
            }));
        }
        self.parse_compare()
    }

    fn parse_compare(&mut self) -> Result<Expr, TemplateError> {
        let lineno = self.lineno();
        let expr = self.parse_math1()?;
        let mut ops = Vec::new();
        loop {
            let current = self.current().clone();
            let op = if current.kind == TokenKind::Operator
                && COMPARE_OPERATORS.contains(&current.value.as_str())
            {
                self.next();
                CmpOp::from_operator(&current.value)
            } else if self.skip_name("in") {
                Some(CmpOp::In)
            } else if self.is_name("not") && self.look().is_name("in") {
                self.next();
                self.next();
                Some(CmpOp::NotIn)
            } else {
                None
            };
            let Some(op) = op else { break };
            ops.push(Operand {
                op,
                expr: self.parse_math1()?,
                meta: Meta::at(current.lineno),
            });
        }
        if ops.is_empty() {
            return Ok(expr);
        }
        Ok(Expr::Compare(Compare {
            expr: Box::new(expr),
            ops,
            meta: Meta::at(lineno),
        }))
    }

    fn parse_math1(&mut self) -> Result<Expr, TemplateError> {
        let lineno = self.lineno();
        let mut left = self.parse_concat()?;
        loop {
            let op = if self.skip_op("+") {
                BinOp::Add
            } else if self.skip_op("-") {
                BinOp::Sub
            } else {
                break;
            };
            let right = self.parse_concat()?;
            left = Self::binary(op, left, right, lineno);
        }
        Ok(left)
    }

    fn parse_concat(&mut self) -> Result<Expr, TemplateError> {
        let lineno = self.lineno();
        let mut nodes = vec![self.parse_math2()?];
        while self.skip_op("~") {
            nodes.push(self.parse_math2()?);
        }
        if nodes.len() == 1 {
            return Ok(nodes.remove(0));
        }
        Ok(Expr::Concat(Concat {
            nodes,
            meta: Meta::at(lineno),
        }))
    }

    fn parse_math2(&mut self) -> Result<Expr, TemplateError> {
        let lineno = self.lineno();
        let mut left = self.parse_pow()?;
        loop {
            let op = match self.current().value.as_str() {
                "*" => BinOp::Mul,
                "/" => BinOp::Div,
                "//" => BinOp::FloorDiv,
                "%" => BinOp::Mod,
                _ => break,
            };
            if !self.is_kind(TokenKind::Operator) {
                break;
            }
            self.next();
            let right = self.parse_pow()?;
            left = Self::binary(op, left, right, lineno);
        }
        Ok(left)
    }

    fn parse_pow(&mut self) -> Result<Expr, TemplateError> {
        let lineno = self.lineno();
        let mut left = self.parse_unary(true)?;
        while self.skip_op("**") {
            let right = self.parse_unary(true)?;
            left = Self::binary(BinOp::Pow, left, right, lineno);
        }
        Ok(left)
    }

    fn parse_unary(&mut self, with_filter: bool) -> Result<Expr, TemplateError> {
        let lineno = self.lineno();
        let op = if self.skip_op("-") {
            Some(UnaryOp::Neg)
        } else if self.skip_op("+") {
            Some(UnaryOp::Pos)
        } else {
            None
        };
        let node = match op {
            Some(op) => Expr::UnaryExpr(UnaryExpr {
                op,
                node: Box::new(self.nested(|parser| parser.parse_unary(false))?),
                inline: false,
                meta: Meta::at(lineno),
            }),
            None => self.parse_primary()?,
        };
        let node = self.parse_postfix(node)?;
        if with_filter {
            return self.parse_filter_expr(node);
        }
        Ok(node)
    }

    fn parse_primary(&mut self) -> Result<Expr, TemplateError> {
        let token = self.current().clone();
        let meta = Meta::at(token.lineno);
        match token.kind {
            TokenKind::Name => {
                self.next();
                let value = match token.value.as_str() {
                    "true" | "True" => Some(ConstValue::Bool(true)),
                    "false" | "False" => Some(ConstValue::Bool(false)),
                    "none" | "None" => Some(ConstValue::None),
                    _ => None,
                };
                Ok(match value {
                    Some(value) => Expr::Const(Const { value, meta }),
                    None => Expr::Name(Name {
                        name: token.value,
                        ctx: Ctx::Load,
                        meta,
                    }),
                })
            }
            TokenKind::String => {
                self.next();
                let mut value = token.value;
                while self.is_kind(TokenKind::String) {
                    value.push_str(&self.next().value);
                }
                Ok(Expr::Const(Const {
                    value: ConstValue::Str(value),
                    meta,
                }))
            }
            TokenKind::Integer => {
                self.next();
                let value = parse_integer(&token.value)
                    .ok_or_else(|| self.fail(token.lineno, "integer literal out of range"))?;
                Ok(Expr::Const(Const {
                    value: ConstValue::Int(value),
                    meta,
                }))
            }
            TokenKind::Float => {
                self.next();
                let value: f64 = token
                    .value
                    .parse()
                    .map_err(|_| self.fail(token.lineno, "invalid float literal"))?;
                Ok(Expr::Const(Const {
                    value: ConstValue::Float(value),
                    meta,
                }))
            }
            TokenKind::Operator if token.value == "(" => {
                self.next();
                let node = self.parse_tuple(false, true, &[], true)?;
                self.expect_op(")")?;
                Ok(node)
            }
            TokenKind::Operator if token.value == "[" => self.parse_list(),
            TokenKind::Operator if token.value == "{" => self.parse_dict(),
            _ => Err(self.fail(token.lineno, format!("unexpected {}", token.describe()))),
        }
    }

    /// Parses comma separated expressions, producing a `Tuple` when there is
    /// more than one or a trailing comma.
    fn parse_tuple(
        &mut self,
        simplified: bool,
        with_condexpr: bool,
        extra_end_rules: &[&str],
        explicit_parentheses: bool,
    ) -> Result<Expr, TemplateError> {
        let lineno = self.lineno();
        let mut items = Vec::new();
        let mut is_tuple = false;
        loop {
            if !items.is_empty() {
                self.expect_op(",")?;
            }
            if self.is_tuple_end(extra_end_rules) {
                break;
            }
            let item = if simplified {
                self.parse_primary()?
            } else {
                self.parse_expression(with_condexpr)?
            };
            items.push(item);
            if self.is_op(",") {
                is_tuple = true;
            } else {
                break;
            }
        }
        if !is_tuple {
            if let Some(item) = items.pop() {
                return Ok(item);
            }
            if !explicit_parentheses {
                return Err(self.fail(
                    self.lineno(),
                    format!("Expected an expression, got {}", self.current().describe()),
                ));
            }
        }
        Ok(Expr::Tuple(Tuple {
            items,
            ctx: Ctx::Load,
            meta: Meta::at(lineno),
        }))
    }

    fn is_tuple_end(&self, extra_end_rules: &[&str]) -> bool {
        matches!(
            self.current().kind,
            TokenKind::VariableEnd | TokenKind::BlockEnd
        ) || self.is_op(")")
            || extra_end_rules.iter().any(|rule| self.is_name(rule))
    }

    fn parse_list(&mut self) -> Result<Expr, TemplateError> {
        let lineno = self.expect_op("[")?.lineno;
        let mut items = Vec::new();
        while !self.is_op("]") {
            if !items.is_empty() {
                self.expect_op(",")?;
            }
            if self.is_op("]") {
                break;
            }
            items.push(self.parse_expression(true)?);
        }
        self.expect_op("]")?;
        Ok(Expr::List(List {
            items,
            meta: Meta::at(lineno),
        }))
    }

    fn parse_dict(&mut self) -> Result<Expr, TemplateError> {
        let lineno = self.expect_op("{")?.lineno;
        let mut items = Vec::new();
        while !self.is_op("}") {
            if !items.is_empty() {
                self.expect_op(",")?;
            }
            if self.is_op("}") {
                break;
            }
            let key_lineno = self.lineno();
            let key = self.parse_expression(true)?;
            self.expect_op(":")?;
            let value = self.parse_expression(true)?;
            items.push(Pair {
                key,
                value,
                meta: Meta::at(key_lineno),
            });
        }
        self.expect_op("}")?;
        Ok(Expr::Dict(Dict {
            items,
            meta: Meta::at(lineno),
        }))
    }

    fn parse_postfix(&mut self, mut node: Expr) -> Result<Expr, TemplateError> {
        loop {
            if self.is_op(".") || self.is_op("[") {
                node = self.parse_subscript(node)?;
            } else if self.is_op("(") {
                node = self.parse_call(node)?;
            } else {
                return Ok(node);
            }
        }
    }

    fn parse_filter_expr(&mut self, mut node: Expr) -> Result<Expr, TemplateError> {
        loop {
            if self.is_op("|") {
                node = match self.parse_filter(Some(node), false)? {
                    Some(filtered) => filtered,
                    None => unreachable!("a pipe always yields a filter"),
                };
            } else if self.is_name("is") {
                node = self.parse_test(node)?;
            } else if self.is_op("(") {
                node = self.parse_call(node)?;
            } else {
                return Ok(node);
            }
        }
    }

    fn parse_subscript(&mut self, node: Expr) -> Result<Expr, TemplateError> {
        let token = self.next();
        let meta = Meta::at(token.lineno);
        if token.is_operator(".") {
            let attr = self.next();
            return match attr.kind {
                TokenKind::Name => Ok(Expr::Getattr(Getattr {
                    node: Box::new(node),
                    attr: attr.value,
                    meta,
                })),
                TokenKind::Integer => {
                    let value = parse_integer(&attr.value)
                        .ok_or_else(|| self.fail(attr.lineno, "integer literal out of range"))?;
                    Ok(Expr::Getitem(Getitem {
                        node: Box::new(node),
                        arg: Box::new(Expr::Const(Const {
                            value: ConstValue::Int(value),
                            meta: Meta::at(attr.lineno),
                        })),
                        dotted: true,
                        meta,
                    }))
                }
                _ => Err(self.fail(attr.lineno, "expected name or number")),
            };
        }
        let mut args = Vec::new();
        while !self.is_op("]") {
            if !args.is_empty() {
                self.expect_op(",")?;
            }
            args.push(self.parse_subscribed()?);
        }
        self.expect_op("]")?;
        let arg = if args.len() == 1 {
            args.remove(0)
        } else {
            Expr::Tuple(Tuple {
                items: args,
                ctx: Ctx::Load,
                meta: Meta::at(token.lineno),
            })
        };
        Ok(Expr::Getitem(Getitem {
            node: Box::new(node),
            arg: Box::new(arg),
            dotted: false,
            meta,
        }))
    }

    fn parse_subscribed(&mut self) -> Result<Expr, TemplateError> {
        let lineno = self.lineno();
        let start = if self.skip_op(":") {
            None
        } else {
            let node = self.parse_expression(true)?;
            if !self.skip_op(":") {
                return Ok(node);
            }
            Some(Box::new(node))
        };
        let bound_end = |p: &Self| p.is_op("]") || p.is_op(",") || p.is_op(":");
        let stop = if bound_end(self) {
            None
        } else {
            Some(Box::new(self.parse_expression(true)?))
        };
        let step = if self.skip_op(":") && !(self.is_op("]") || self.is_op(",")) {
            Some(Box::new(self.parse_expression(true)?))
        } else {
            None
        };
        Ok(Expr::Slice(Slice {
            start,
            stop,
            step,
            meta: Meta::at(lineno),
        }))
    }

    fn parse_call_args(&mut self) -> Result<CallArgs, TemplateError> {
        let lineno = self.expect_op("(")?.lineno;
        let mut args = CallArgs::default();
        let mut require_comma = false;
        let invalid = |p: &Self| p.fail(lineno, "invalid syntax for function call expression");
        while !self.is_op(")") {
            if require_comma {
                self.expect_op(",")?;
                if self.is_op(")") {
                    break;
                }
            }
            if self.skip_op("*") {
                if args.dyn_args.is_some() || args.dyn_kwargs.is_some() {
                    return Err(invalid(self));
                }
                args.dyn_args = Some(Box::new(self.parse_expression(true)?));
            } else if self.skip_op("**") {
                if args.dyn_kwargs.is_some() {
                    return Err(invalid(self));
                }
                args.dyn_kwargs = Some(Box::new(self.parse_expression(true)?));
            } else if self.is_kind(TokenKind::Name) && self.look().is_operator("=") {
                if args.dyn_kwargs.is_some() {
                    return Err(invalid(self));
                }
                let key = self.next();
                self.next();
                let value = self.parse_expression(true)?;
                args.kwargs.push(Keyword {
                    key: key.value,
                    value,
                    meta: Meta::at(key.lineno),
                });
            } else {
                if args.dyn_args.is_some() || args.dyn_kwargs.is_some() || !args.kwargs.is_empty() {
                    return Err(invalid(self));
                }
                args.args.push(self.parse_expression(true)?);
            }
            require_comma = true;
        }
        self.expect_op(")")?;
        Ok(args)
    }

    fn parse_call(&mut self, node: Expr) -> Result<Expr, TemplateError> {
        let lineno = self.lineno();
        let args = self.parse_call_args()?;
        Ok(Expr::Call(Call {
            node: Box::new(node),
            args,
            meta: Meta::at(lineno),
        }))
    }

    fn parse_dotted_name(&mut self) -> Result<String, TemplateError> {
        let mut name = self.expect_name()?.value;
        while self.skip_op(".") {
            name.push('.');
            name.push_str(&self.expect_name()?.value);
        }
        Ok(name)
    }

    /// Applies a chain of filters. `start_inline` parses the first filter name
    /// without a leading pipe, as in `{% filter upper %}`.
    fn parse_filter(
        &mut self,
        mut node: Option<Expr>,
        mut start_inline: bool,
    ) -> Result<Option<Expr>, TemplateError> {
        while self.is_op("|") || start_inline {
            if !start_inline {
                self.next();
            }
            let lineno = self.lineno();
            let name = self.parse_dotted_name()?;
            let args = if self.is_op("(") {
                self.parse_call_args()?
            } else {
                CallArgs::default()
            };
            node = Some(Expr::Filter(Filter {
                node: node.map(Box::new),
                name,
                args,
                meta: Meta::at(lineno),
            }));
            start_inline = false;
        }
        Ok(node)
    }

    fn parse_test(&mut self, node: Expr) -> Result<Expr, TemplateError> {
        let lineno = self.expect_keyword("is")?.lineno;
        let negated = self.skip_name("not");
        let name = self.parse_dotted_name()?;
        let current = self.current().clone();
        let args = if self.is_op("(") {
            self.parse_call_args()?
        } else if takes_bare_argument(&current) {
            if current.is_name("is") {
                return Err(self.fail(current.lineno, "You cannot chain multiple tests with is"));
            }
            let arg = self.parse_primary()?;
            let arg = self.parse_postfix(arg)?;
            CallArgs {
                args: vec![arg],
                ..CallArgs::default()
            }
        } else {
            CallArgs::default()
        };
        let test = Expr::Test(Test {
            node: Box::new(node),
            name,
            args,
            meta: Meta::at(lineno),
        });
        if negated {
            return Ok(Expr::UnaryExpr(UnaryExpr {
                op: UnaryOp::Not,
                node: Box::new(test),
                inline: true,
                meta: Meta::at(lineno),
            }));
        }
        Ok(test)
    }
}

/// Whether a test is followed by a single argument without parentheses, as in
/// `x is divisibleby 3`.
fn takes_bare_argument(current: &Lexeme) -> bool {
    match current.kind {
        TokenKind::Name => !matches!(current.value.as_str(), "else" | "or" | "and" | "if"),
        TokenKind::String | TokenKind::Integer | TokenKind::Float => true,
        TokenKind::Operator => matches!(current.value.as_str(), "[" | "{"),
        _ => false,
    }
}

/// Parses an integer literal with optional `0b`/`0o`/`0x` prefix. Underscores
/// are already removed by the lexer.
pub(crate) fn parse_integer(literal: &str) -> Option<i128> {
    let lower = literal.to_ascii_lowercase();
    let (digits, radix) = match lower.get(..2) {
        Some("0b") => (&lower[2..], 2),
        Some("0o") => (&lower[2..], 8),
        Some("0x") => (&lower[2..], 16),
        _ => (lower.as_str(), 10),
    };
    i128::from_str_radix(digits, radix).ok()
}
