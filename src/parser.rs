use std::collections::HashSet;
use std::mem::discriminant;

use anyhow::{Result, bail};

use crate::parser::ast::{
    AssignTarget, BinaryOperator, BoolOperator, CallArg, DictItem, ExceptHandler, ExprKind,
    Expression, FunctionDef, PackSlot, Parameter, Program, Statement, StmtKind, UnaryOperator,
};
use crate::token::{Span, Token, TokenKind};

pub mod ast;

pub struct Parser<'a> {
    tokens: Vec<Token<'a>>,
    pos: usize,
    hidden_counter: usize,
}

impl<'a> Parser<'a> {
    pub fn new(mut tokens: Vec<Token<'a>>) -> Self {
        if tokens.is_empty() {
            tokens.push(Token::new(TokenKind::EOF, Span::default()));
        }
        Self {
            tokens,
            pos: 0,
            hidden_counter: 0,
        }
    }

    pub fn parse_program(mut self) -> Result<Program> {
        let mut statements = Vec::new();
        while !matches!(self.current_kind(), TokenKind::EOF) {
            if self.consume_newlines() {
                continue;
            }
            self.parse_statement_into(&mut statements)?;
        }
        let mut program = Program { statements };
        analyze_program(&mut program)?;
        Ok(program)
    }

    fn parse_expression_only(mut self) -> Result<Expression> {
        self.consume_newlines();
        let expr = self.parse_expression()?;
        self.consume_newlines();
        if !matches!(self.current_kind(), TokenKind::EOF) {
            bail!(
                "Unexpected {} after expression on line {}",
                describe(self.current_kind()),
                self.line()
            );
        }
        Ok(expr)
    }

    // ----- token plumbing -----

    fn current(&self) -> &Token<'a> {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn current_kind(&self) -> &TokenKind<'a> {
        &self.current().kind
    }

    fn current_span(&self) -> Span {
        self.current().span
    }

    fn line(&self) -> usize {
        self.current().span.line + 1
    }

    fn peek_kind(&self) -> &TokenKind<'a> {
        let index = (self.pos + 1).min(self.tokens.len() - 1);
        &self.tokens[index].kind
    }

    fn advance(&mut self) -> Token<'a> {
        let token = self.current().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn at(&self, kind: &TokenKind<'_>) -> bool {
        discriminant(self.current_kind()) == discriminant(kind)
    }

    fn eat(&mut self, kind: &TokenKind<'_>) -> bool {
        if self.at(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: &TokenKind<'_>, expected: &str) -> Result<Token<'a>> {
        if self.at(kind) {
            Ok(self.advance())
        } else {
            bail!(
                "Expected {expected} but found {} on line {}",
                describe(self.current_kind()),
                self.line()
            )
        }
    }

    fn expect_identifier(&mut self, expected: &str) -> Result<String> {
        match self.current_kind() {
            TokenKind::Identifier(name) => {
                let name = (*name).to_string();
                self.advance();
                Ok(name)
            }
            other => bail!(
                "Expected {expected} but found {} on line {}",
                describe(other),
                self.line()
            ),
        }
    }

    fn consume_newlines(&mut self) -> bool {
        let mut consumed = false;
        while matches!(self.current_kind(), TokenKind::Newline) {
            self.advance();
            consumed = true;
        }
        consumed
    }

    fn expect_statement_end(&mut self) -> Result<()> {
        match self.current_kind() {
            TokenKind::Newline => {
                self.advance();
                Ok(())
            }
            // A dedent or EOF also terminates the statement; the block
            // parser consumes them.
            TokenKind::Dedent | TokenKind::EOF => Ok(()),
            other => bail!(
                "Expected end of statement but found {} on line {}",
                describe(other),
                self.line()
            ),
        }
    }

    fn hidden_name(&mut self, prefix: &str) -> String {
        let name = format!("__{prefix}{}", self.hidden_counter);
        self.hidden_counter += 1;
        name
    }

    // ----- statements -----

    fn parse_block(&mut self) -> Result<Vec<Statement>> {
        self.expect(&TokenKind::Colon, "':'")?;
        self.expect(&TokenKind::Newline, "newline")?;
        self.expect(&TokenKind::Indent, "indented block")?;

        let mut body = Vec::new();
        while !matches!(self.current_kind(), TokenKind::Dedent | TokenKind::EOF) {
            if self.consume_newlines() {
                continue;
            }
            self.parse_statement_into(&mut body)?;
        }
        self.eat(&TokenKind::Dedent);
        Ok(body)
    }

    fn parse_statement_into(&mut self, out: &mut Vec<Statement>) -> Result<()> {
        let span = self.current_span();
        match self.current_kind() {
            TokenKind::Def => {
                let def = self.parse_function_def()?;
                out.push(Statement::new(StmtKind::FunctionDef(def), span));
            }
            TokenKind::Class => out.push(self.parse_class(span)?),
            TokenKind::If => out.push(self.parse_if(span)?),
            TokenKind::While => out.push(self.parse_while(span)?),
            TokenKind::For => self.parse_for_into(span, out)?,
            TokenKind::Try => out.push(self.parse_try(span)?),
            TokenKind::Return => {
                self.advance();
                let value = if matches!(
                    self.current_kind(),
                    TokenKind::Newline | TokenKind::Dedent | TokenKind::EOF
                ) {
                    None
                } else {
                    Some(self.parse_expression_list()?)
                };
                self.expect_statement_end()?;
                out.push(Statement::new(StmtKind::Return(value), span));
            }
            TokenKind::Raise => {
                self.advance();
                let value = if matches!(
                    self.current_kind(),
                    TokenKind::Newline | TokenKind::Dedent | TokenKind::EOF
                ) {
                    None
                } else {
                    Some(self.parse_expression()?)
                };
                self.expect_statement_end()?;
                out.push(Statement::new(StmtKind::Raise(value), span));
            }
            TokenKind::Break => {
                self.advance();
                self.expect_statement_end()?;
                out.push(Statement::new(
                    StmtKind::Break {
                        exit_for_loop_normally: false,
                    },
                    span,
                ));
            }
            TokenKind::Continue => {
                self.advance();
                self.expect_statement_end()?;
                out.push(Statement::new(StmtKind::Continue, span));
            }
            TokenKind::Pass => {
                self.advance();
                self.expect_statement_end()?;
                out.push(Statement::new(StmtKind::Pass, span));
            }
            TokenKind::Import => {
                self.advance();
                let module = self.expect_identifier("module name")?;
                let alias = if self.eat(&TokenKind::As) {
                    Some(self.expect_identifier("import alias")?)
                } else {
                    None
                };
                self.expect_statement_end()?;
                out.push(Statement::new(StmtKind::Import { module, alias }, span));
            }
            TokenKind::From => out.push(self.parse_import_from(span)?),
            TokenKind::Global => {
                self.advance();
                let names = self.parse_name_list()?;
                self.expect_statement_end()?;
                out.push(Statement::new(StmtKind::Global(names), span));
            }
            TokenKind::Nonlocal => {
                self.advance();
                let names = self.parse_name_list()?;
                self.expect_statement_end()?;
                out.push(Statement::new(StmtKind::Nonlocal(names), span));
            }
            _ => self.parse_expression_statement_into(span, out)?,
        }
        Ok(())
    }

    fn parse_name_list(&mut self) -> Result<Vec<String>> {
        let mut names = vec![self.expect_identifier("name")?];
        while self.eat(&TokenKind::Comma) {
            names.push(self.expect_identifier("name")?);
        }
        Ok(names)
    }

    fn parse_import_from(&mut self, span: Span) -> Result<Statement> {
        self.advance();
        let module = self.expect_identifier("module name")?;
        self.expect(&TokenKind::Import, "'import'")?;

        if self.eat(&TokenKind::Star) {
            self.expect_statement_end()?;
            return Ok(Statement::new(
                StmtKind::ImportFrom {
                    module,
                    names: Vec::new(),
                    star: true,
                },
                span,
            ));
        }

        let mut names = Vec::new();
        loop {
            let name = self.expect_identifier("imported name")?;
            let alias = if self.eat(&TokenKind::As) {
                Some(self.expect_identifier("import alias")?)
            } else {
                None
            };
            names.push((name, alias));
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        self.expect_statement_end()?;
        Ok(Statement::new(
            StmtKind::ImportFrom {
                module,
                names,
                star: false,
            },
            span,
        ))
    }

    fn parse_if(&mut self, span: Span) -> Result<Statement> {
        self.advance();
        let condition = self.parse_expression()?;
        let then_body = self.parse_block()?;

        let else_body = if matches!(self.current_kind(), TokenKind::Elif) {
            // An elif chain is a nested if statement in the else branch;
            // parse_if consumes the leading keyword either way.
            let elif_span = self.current_span();
            vec![self.parse_if(elif_span)?]
        } else if self.eat(&TokenKind::Else) {
            self.parse_block()?
        } else {
            Vec::new()
        };

        Ok(Statement::new(
            StmtKind::If {
                condition,
                then_body,
                else_body,
            },
            span,
        ))
    }

    fn parse_while(&mut self, span: Span) -> Result<Statement> {
        self.advance();
        let condition = self.parse_expression()?;
        let body = self.parse_block()?;
        let else_body = if self.eat(&TokenKind::Else) {
            self.parse_block()?
        } else {
            Vec::new()
        };
        Ok(Statement::new(
            StmtKind::While {
                condition,
                body,
                else_body,
            },
            span,
        ))
    }

    // `for` is desugared into the iterator protocol: fetch `__iter__` once,
    // then loop pulling `__next__` until StopIteration ends the loop through
    // the dedicated normal-exit break so a trailing `else` still runs.
    fn parse_for_into(&mut self, span: Span, out: &mut Vec<Statement>) -> Result<()> {
        self.advance();
        let target_expr = self.parse_expression_list()?;
        let target = to_assign_target(target_expr)?;
        self.expect(&TokenKind::In, "'in'")?;
        let iterable = self.parse_expression_list()?;
        let body = self.parse_block()?;
        let else_body = if self.eat(&TokenKind::Else) {
            self.parse_block()?
        } else {
            Vec::new()
        };

        out.extend(self.desugar_for(target, iterable, body, else_body, span));
        Ok(())
    }

    fn desugar_for(
        &mut self,
        target: AssignTarget,
        iterable: Expression,
        body: Vec<Statement>,
        else_body: Vec<Statement>,
        span: Span,
    ) -> Vec<Statement> {
        let iter_name = self.hidden_name("for");

        let make_method_call = |object: Expression, method: &str| {
            Expression::new(
                ExprKind::Call {
                    callee: Box::new(Expression::new(
                        ExprKind::Attribute {
                            object: Box::new(object),
                            name: method.to_string(),
                        },
                        span,
                    )),
                    args: Vec::new(),
                },
                span,
            )
        };

        let iter_assign = Statement::new(
            StmtKind::Assign {
                target: AssignTarget::Name(iter_name.clone()),
                value: make_method_call(iterable, "__iter__"),
            },
            span,
        );

        let next_assign = Statement::new(
            StmtKind::Assign {
                target,
                value: make_method_call(
                    Expression::new(ExprKind::Identifier(iter_name), span),
                    "__next__",
                ),
            },
            span,
        );

        let stop_handler = ExceptHandler {
            exception_type: Some(Expression::new(
                ExprKind::Identifier("StopIteration".to_string()),
                span,
            )),
            variable: None,
            body: vec![Statement::new(
                StmtKind::Break {
                    exit_for_loop_normally: true,
                },
                span,
            )],
            span,
        };

        let pull_next = Statement::new(
            StmtKind::Try {
                body: vec![next_assign],
                handlers: vec![stop_handler],
                finally_body: Vec::new(),
            },
            span,
        );

        let mut while_body = vec![pull_next];
        while_body.extend(body);

        vec![
            iter_assign,
            Statement::new(
                StmtKind::While {
                    condition: Expression::new(ExprKind::Boolean(true), span),
                    body: while_body,
                    else_body,
                },
                span,
            ),
        ]
    }

    fn parse_try(&mut self, span: Span) -> Result<Statement> {
        self.advance();
        let body = self.parse_block()?;

        let mut handlers = Vec::new();
        while matches!(self.current_kind(), TokenKind::Except) {
            let handler_span = self.current_span();
            self.advance();
            let (exception_type, variable) = if matches!(self.current_kind(), TokenKind::Colon) {
                (None, None)
            } else {
                let exception_type = self.parse_expression()?;
                let variable = if self.eat(&TokenKind::As) {
                    Some(self.expect_identifier("exception variable")?)
                } else {
                    None
                };
                (Some(exception_type), variable)
            };
            let handler_body = self.parse_block()?;
            handlers.push(ExceptHandler {
                exception_type,
                variable,
                body: handler_body,
                span: handler_span,
            });
        }

        let finally_body = if self.eat(&TokenKind::Finally) {
            self.parse_block()?
        } else {
            Vec::new()
        };

        if handlers.is_empty() && finally_body.is_empty() {
            bail!(
                "Try statement must have at least one except or finally clause on line {}",
                span.line + 1
            );
        }

        Ok(Statement::new(
            StmtKind::Try {
                body,
                handlers,
                finally_body,
            },
            span,
        ))
    }

    fn parse_function_def(&mut self) -> Result<FunctionDef> {
        let span = self.current_span();
        self.advance();
        let name = self.expect_identifier("function name")?;
        let (parameters, list_args, kwargs) = self.parse_parameters()?;
        let body = self.parse_block()?;

        Ok(FunctionDef {
            name,
            parameters,
            list_args,
            kwargs,
            body,
            span,
            variables: Vec::new(),
            local_captures: Vec::new(),
            global_captures: Vec::new(),
        })
    }

    fn parse_parameters(&mut self) -> Result<(Vec<Parameter>, Option<String>, Option<String>)> {
        self.expect(&TokenKind::LParen, "'('")?;
        let mut parameters: Vec<Parameter> = Vec::new();
        let mut list_args = None;
        let mut kwargs = None;

        while !matches!(self.current_kind(), TokenKind::RParen) {
            if self.eat(&TokenKind::Star) {
                if list_args.is_some() || kwargs.is_some() {
                    bail!("Invalid parameter order on line {}", self.line());
                }
                list_args = Some(self.expect_identifier("parameter name")?);
            } else if self.eat(&TokenKind::DoubleStar) {
                if kwargs.is_some() {
                    bail!("Duplicate **kwargs parameter on line {}", self.line());
                }
                kwargs = Some(self.expect_identifier("parameter name")?);
            } else {
                if list_args.is_some() || kwargs.is_some() {
                    bail!("Invalid parameter order on line {}", self.line());
                }
                let name = self.expect_identifier("parameter name")?;
                if parameters.iter().any(|param| param.name == name) {
                    bail!("Duplicate parameter '{name}' on line {}", self.line());
                }
                let default = if self.eat(&TokenKind::Equal) {
                    Some(self.parse_expression()?)
                } else {
                    if parameters.iter().any(|param| param.default.is_some()) {
                        bail!(
                            "Parameter without default follows parameter with default on line {}",
                            self.line()
                        );
                    }
                    None
                };
                parameters.push(Parameter { name, default });
            }

            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        self.expect(&TokenKind::RParen, "')'")?;
        Ok((parameters, list_args, kwargs))
    }

    fn parse_class(&mut self, span: Span) -> Result<Statement> {
        self.advance();
        let name = self.expect_identifier("class name")?;

        let mut bases = Vec::new();
        if self.eat(&TokenKind::LParen) {
            while !matches!(self.current_kind(), TokenKind::RParen) {
                bases.push(self.parse_expression()?);
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
            self.expect(&TokenKind::RParen, "')'")?;
        }

        self.expect(&TokenKind::Colon, "':'")?;
        self.expect(&TokenKind::Newline, "newline")?;
        self.expect(&TokenKind::Indent, "indented block")?;

        let mut methods = Vec::new();
        while !matches!(self.current_kind(), TokenKind::Dedent | TokenKind::EOF) {
            if self.consume_newlines() {
                continue;
            }
            match self.current_kind() {
                TokenKind::Def => methods.push(self.parse_function_def()?),
                TokenKind::Pass => {
                    self.advance();
                    self.expect_statement_end()?;
                }
                other => bail!(
                    "Only method definitions and pass are allowed in class '{name}', found {} on line {}",
                    describe(other),
                    self.line()
                ),
            }
        }
        self.eat(&TokenKind::Dedent);

        Ok(Statement::new(
            StmtKind::ClassDef {
                name,
                bases,
                methods,
            },
            span,
        ))
    }

    fn parse_expression_statement_into(
        &mut self,
        span: Span,
        out: &mut Vec<Statement>,
    ) -> Result<()> {
        let expr = self.parse_expression_list()?;

        if self.eat(&TokenKind::Equal) {
            let target = to_assign_target(expr)?;
            let value = self.parse_expression_list()?;
            self.expect_statement_end()?;
            out.push(Statement::new(StmtKind::Assign { target, value }, span));
            return Ok(());
        }

        if let Some(op) = compound_operator(self.current_kind()) {
            self.advance();
            let value = self.parse_expression_list()?;
            self.expect_statement_end()?;
            self.desugar_compound_assign(expr, op, value, span, out)?;
            return Ok(());
        }

        self.expect_statement_end()?;
        out.push(Statement::new(StmtKind::Expr(expr), span));
        Ok(())
    }

    // Compound assignment evaluates its target expression exactly once: the
    // object (and index) are stashed in hidden temporaries before the
    // read-modify-write.
    fn desugar_compound_assign(
        &mut self,
        target_expr: Expression,
        op: BinaryOperator,
        value: Expression,
        span: Span,
        out: &mut Vec<Statement>,
    ) -> Result<()> {
        let in_place = |left: Expression, right: Expression| {
            Expression::new(
                ExprKind::InPlaceBinary {
                    left: Box::new(left),
                    op,
                    right: Box::new(right),
                },
                span,
            )
        };

        match to_assign_target(target_expr)? {
            AssignTarget::Name(name) => {
                let read = Expression::new(ExprKind::Identifier(name.clone()), span);
                out.push(Statement::new(
                    StmtKind::Assign {
                        target: AssignTarget::Name(name),
                        value: in_place(read, value),
                    },
                    span,
                ));
            }
            AssignTarget::Member { object, name } => {
                let tmp = self.hidden_name("aug");
                out.push(Statement::new(
                    StmtKind::Assign {
                        target: AssignTarget::Name(tmp.clone()),
                        value: object,
                    },
                    span,
                ));
                let tmp_expr = || Expression::new(ExprKind::Identifier(tmp.clone()), span);
                let read = Expression::new(
                    ExprKind::Attribute {
                        object: Box::new(tmp_expr()),
                        name: name.clone(),
                    },
                    span,
                );
                out.push(Statement::new(
                    StmtKind::Assign {
                        target: AssignTarget::Member {
                            object: tmp_expr(),
                            name,
                        },
                        value: in_place(read, value),
                    },
                    span,
                ));
            }
            AssignTarget::Index { object, index } => {
                let tmp_obj = self.hidden_name("aug");
                let tmp_index = self.hidden_name("aug");
                out.push(Statement::new(
                    StmtKind::Assign {
                        target: AssignTarget::Name(tmp_obj.clone()),
                        value: object,
                    },
                    span,
                ));
                out.push(Statement::new(
                    StmtKind::Assign {
                        target: AssignTarget::Name(tmp_index.clone()),
                        value: index,
                    },
                    span,
                ));
                let obj_expr = || Expression::new(ExprKind::Identifier(tmp_obj.clone()), span);
                let index_expr = || Expression::new(ExprKind::Identifier(tmp_index.clone()), span);
                let read = Expression::new(
                    ExprKind::Index {
                        object: Box::new(obj_expr()),
                        index: Box::new(index_expr()),
                    },
                    span,
                );
                out.push(Statement::new(
                    StmtKind::Assign {
                        target: AssignTarget::Index {
                            object: obj_expr(),
                            index: index_expr(),
                        },
                        value: in_place(read, value),
                    },
                    span,
                ));
            }
            AssignTarget::Pack(_) => {
                bail!(
                    "Compound assignment target cannot be a tuple on line {}",
                    span.line + 1
                );
            }
        }
        Ok(())
    }

    // ----- expressions -----

    // An expression list is one or more comma-separated expressions; two or
    // more form a tuple (`a, b = 1, 2`, `return x, y`).
    fn parse_expression_list(&mut self) -> Result<Expression> {
        let span = self.current_span();
        let first = self.parse_expression()?;
        if !matches!(self.current_kind(), TokenKind::Comma) {
            return Ok(first);
        }

        let mut items = vec![first];
        while self.eat(&TokenKind::Comma) {
            if expression_list_ends(self.current_kind()) {
                break;
            }
            items.push(self.parse_expression()?);
        }
        Ok(Expression::new(ExprKind::Tuple(items), span))
    }

    pub fn parse_expression(&mut self) -> Result<Expression> {
        if matches!(self.current_kind(), TokenKind::Lambda) {
            return self.parse_lambda();
        }
        self.parse_conditional()
    }

    fn parse_lambda(&mut self) -> Result<Expression> {
        let span = self.current_span();
        self.advance();

        let mut parameters: Vec<Parameter> = Vec::new();
        let mut list_args = None;
        let mut kwargs = None;
        while !matches!(self.current_kind(), TokenKind::Colon) {
            if self.eat(&TokenKind::Star) {
                list_args = Some(self.expect_identifier("parameter name")?);
            } else if self.eat(&TokenKind::DoubleStar) {
                kwargs = Some(self.expect_identifier("parameter name")?);
            } else {
                let name = self.expect_identifier("parameter name")?;
                let default = if self.eat(&TokenKind::Equal) {
                    Some(self.parse_expression()?)
                } else {
                    None
                };
                parameters.push(Parameter { name, default });
            }
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        self.expect(&TokenKind::Colon, "':'")?;
        let body_expr = self.parse_expression()?;

        let def = FunctionDef {
            name: "<lambda>".to_string(),
            parameters,
            list_args,
            kwargs,
            body: vec![Statement::new(StmtKind::Return(Some(body_expr)), span)],
            span,
            variables: Vec::new(),
            local_captures: Vec::new(),
            global_captures: Vec::new(),
        };
        Ok(Expression::new(ExprKind::Lambda(Box::new(def)), span))
    }

    fn parse_conditional(&mut self) -> Result<Expression> {
        let span = self.current_span();
        let then = self.parse_or()?;
        if !self.eat(&TokenKind::If) {
            return Ok(then);
        }
        let condition = self.parse_or()?;
        self.expect(&TokenKind::Else, "'else'")?;
        let otherwise = self.parse_expression()?;
        Ok(Expression::new(
            ExprKind::Conditional {
                condition: Box::new(condition),
                then: Box::new(then),
                otherwise: Box::new(otherwise),
            },
            span,
        ))
    }

    fn parse_or(&mut self) -> Result<Expression> {
        let span = self.current_span();
        let mut left = self.parse_and()?;
        while self.eat(&TokenKind::Or) {
            let right = self.parse_and()?;
            left = Expression::new(
                ExprKind::BoolOp {
                    op: BoolOperator::Or,
                    left: Box::new(left),
                    right: Box::new(right),
                },
                span,
            );
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expression> {
        let span = self.current_span();
        let mut left = self.parse_not()?;
        while self.eat(&TokenKind::And) {
            let right = self.parse_not()?;
            left = Expression::new(
                ExprKind::BoolOp {
                    op: BoolOperator::And,
                    left: Box::new(left),
                    right: Box::new(right),
                },
                span,
            );
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expression> {
        let span = self.current_span();
        if self.eat(&TokenKind::Not) {
            let operand = self.parse_not()?;
            return Ok(Expression::new(ExprKind::Not(Box::new(operand)), span));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expression> {
        let span = self.current_span();
        let mut left = self.parse_bit_or()?;

        loop {
            let kind = match self.current_kind() {
                TokenKind::EqEq => Some(BinaryOperator::Eq),
                TokenKind::NotEq => Some(BinaryOperator::NotEq),
                TokenKind::Less => Some(BinaryOperator::Lt),
                TokenKind::LessEq => Some(BinaryOperator::LtEq),
                TokenKind::Greater => Some(BinaryOperator::Gt),
                TokenKind::GreaterEq => Some(BinaryOperator::GtEq),
                _ => None,
            };

            if let Some(op) = kind {
                self.advance();
                let right = self.parse_bit_or()?;
                left = Expression::new(
                    ExprKind::Binary {
                        left: Box::new(left),
                        op,
                        right: Box::new(right),
                    },
                    span,
                );
                continue;
            }

            if matches!(self.current_kind(), TokenKind::In) {
                self.advance();
                let right = self.parse_bit_or()?;
                left = Expression::new(
                    ExprKind::Contains {
                        item: Box::new(left),
                        container: Box::new(right),
                        negated: false,
                    },
                    span,
                );
                continue;
            }

            if matches!(self.current_kind(), TokenKind::Not)
                && matches!(self.peek_kind(), TokenKind::In)
            {
                self.advance();
                self.advance();
                let right = self.parse_bit_or()?;
                left = Expression::new(
                    ExprKind::Contains {
                        item: Box::new(left),
                        container: Box::new(right),
                        negated: true,
                    },
                    span,
                );
                continue;
            }

            if matches!(self.current_kind(), TokenKind::Is) {
                self.advance();
                let negated = self.eat(&TokenKind::Not);
                let right = self.parse_bit_or()?;
                left = Expression::new(
                    ExprKind::Is {
                        left: Box::new(left),
                        right: Box::new(right),
                        negated,
                    },
                    span,
                );
                continue;
            }

            return Ok(left);
        }
    }

    fn parse_bit_or(&mut self) -> Result<Expression> {
        self.parse_left_assoc(Self::parse_bit_xor, |kind| match kind {
            TokenKind::Pipe => Some(BinaryOperator::BitOr),
            _ => None,
        })
    }

    fn parse_bit_xor(&mut self) -> Result<Expression> {
        self.parse_left_assoc(Self::parse_bit_and, |kind| match kind {
            TokenKind::Caret => Some(BinaryOperator::BitXor),
            _ => None,
        })
    }

    fn parse_bit_and(&mut self) -> Result<Expression> {
        self.parse_left_assoc(Self::parse_shift, |kind| match kind {
            TokenKind::Ampersand => Some(BinaryOperator::BitAnd),
            _ => None,
        })
    }

    fn parse_shift(&mut self) -> Result<Expression> {
        self.parse_left_assoc(Self::parse_arith, |kind| match kind {
            TokenKind::ShiftLeft => Some(BinaryOperator::ShiftLeft),
            TokenKind::ShiftRight => Some(BinaryOperator::ShiftRight),
            _ => None,
        })
    }

    fn parse_arith(&mut self) -> Result<Expression> {
        self.parse_left_assoc(Self::parse_term, |kind| match kind {
            TokenKind::Plus => Some(BinaryOperator::Add),
            TokenKind::Minus => Some(BinaryOperator::Sub),
            _ => None,
        })
    }

    fn parse_term(&mut self) -> Result<Expression> {
        self.parse_left_assoc(Self::parse_unary, |kind| match kind {
            TokenKind::Star => Some(BinaryOperator::Mul),
            TokenKind::Slash => Some(BinaryOperator::TrueDiv),
            TokenKind::DoubleSlash => Some(BinaryOperator::FloorDiv),
            TokenKind::Percent => Some(BinaryOperator::Mod),
            _ => None,
        })
    }

    fn parse_left_assoc(
        &mut self,
        next: fn(&mut Self) -> Result<Expression>,
        classify: fn(&TokenKind<'_>) -> Option<BinaryOperator>,
    ) -> Result<Expression> {
        let span = self.current_span();
        let mut left = next(self)?;
        while let Some(op) = classify(self.current_kind()) {
            self.advance();
            let right = next(self)?;
            left = Expression::new(
                ExprKind::Binary {
                    left: Box::new(left),
                    op,
                    right: Box::new(right),
                },
                span,
            );
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expression> {
        let span = self.current_span();
        let op = match self.current_kind() {
            TokenKind::Plus => Some(UnaryOperator::Pos),
            TokenKind::Minus => Some(UnaryOperator::Neg),
            TokenKind::Tilde => Some(UnaryOperator::Invert),
            _ => None,
        };
        if let Some(op) = op {
            self.advance();
            let operand = self.parse_unary()?;
            return Ok(Expression::new(
                ExprKind::Unary {
                    op,
                    operand: Box::new(operand),
                },
                span,
            ));
        }
        self.parse_power()
    }

    fn parse_power(&mut self) -> Result<Expression> {
        let span = self.current_span();
        let base = self.parse_postfix()?;
        if self.eat(&TokenKind::DoubleStar) {
            // Exponentiation is right-associative and binds looser than a
            // unary operator on its right.
            let exponent = self.parse_unary()?;
            return Ok(Expression::new(
                ExprKind::Binary {
                    left: Box::new(base),
                    op: BinaryOperator::Pow,
                    right: Box::new(exponent),
                },
                span,
            ));
        }
        Ok(base)
    }

    fn parse_postfix(&mut self) -> Result<Expression> {
        let mut expr = self.parse_atom()?;

        loop {
            let span = self.current_span();
            match self.current_kind() {
                TokenKind::LParen => {
                    self.advance();
                    let args = self.parse_call_args()?;
                    expr = Expression::new(
                        ExprKind::Call {
                            callee: Box::new(expr),
                            args,
                        },
                        span,
                    );
                }
                TokenKind::Dot => {
                    self.advance();
                    let name = self.expect_identifier("attribute name")?;
                    expr = Expression::new(
                        ExprKind::Attribute {
                            object: Box::new(expr),
                            name,
                        },
                        span,
                    );
                }
                TokenKind::LBracket => {
                    self.advance();
                    expr = self.parse_subscript(expr, span)?;
                }
                _ => return Ok(expr),
            }
        }
    }

    fn parse_subscript(&mut self, object: Expression, span: Span) -> Result<Expression> {
        let mut parts: [Option<Box<Expression>>; 3] = [None, None, None];
        let mut colons = 0;

        loop {
            match self.current_kind() {
                TokenKind::RBracket => break,
                TokenKind::Colon => {
                    self.advance();
                    colons += 1;
                    if colons > 2 {
                        bail!("Too many colons in slice on line {}", self.line());
                    }
                }
                _ => {
                    let expr = self.parse_expression()?;
                    if parts[colons].is_some() {
                        bail!("Invalid slice on line {}", self.line());
                    }
                    parts[colons] = Some(Box::new(expr));
                }
            }
        }
        self.expect(&TokenKind::RBracket, "']'")?;

        let [start, stop, step] = parts;
        if colons == 0 {
            let index = start
                .ok_or_else(|| anyhow::anyhow!("Empty subscript on line {}", span.line + 1))?;
            return Ok(Expression::new(
                ExprKind::Index {
                    object: Box::new(object),
                    index,
                },
                span,
            ));
        }
        Ok(Expression::new(
            ExprKind::Slice {
                object: Box::new(object),
                start,
                stop,
                step,
            },
            span,
        ))
    }

    fn parse_call_args(&mut self) -> Result<Vec<CallArg>> {
        let mut args = Vec::new();
        while !matches!(self.current_kind(), TokenKind::RParen) {
            if self.eat(&TokenKind::Star) {
                args.push(CallArg::Star(self.parse_expression()?));
            } else if self.eat(&TokenKind::DoubleStar) {
                args.push(CallArg::DoubleStar(self.parse_expression()?));
            } else if matches!(self.current_kind(), TokenKind::Identifier(_))
                && matches!(self.peek_kind(), TokenKind::Equal)
            {
                let name = self.expect_identifier("keyword argument name")?;
                self.advance(); // '='
                args.push(CallArg::Keyword(name, self.parse_expression()?));
            } else {
                args.push(CallArg::Positional(self.parse_expression()?));
            }
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        self.expect(&TokenKind::RParen, "')'")?;
        Ok(args)
    }

    fn parse_atom(&mut self) -> Result<Expression> {
        let span = self.current_span();
        let expr = match self.current_kind().clone() {
            TokenKind::Integer(value) => {
                self.advance();
                Expression::new(ExprKind::Integer(value), span)
            }
            TokenKind::Float(value) => {
                self.advance();
                Expression::new(ExprKind::Float(value), span)
            }
            TokenKind::String(value) => {
                self.advance();
                Expression::new(ExprKind::Str(value), span)
            }
            TokenKind::True => {
                self.advance();
                Expression::new(ExprKind::Boolean(true), span)
            }
            TokenKind::False => {
                self.advance();
                Expression::new(ExprKind::Boolean(false), span)
            }
            TokenKind::None => {
                self.advance();
                Expression::new(ExprKind::NoneLiteral, span)
            }
            TokenKind::Identifier(name) => {
                self.advance();
                Expression::new(ExprKind::Identifier(name.to_string()), span)
            }
            TokenKind::LParen => {
                self.advance();
                self.parse_paren_group(span)?
            }
            TokenKind::LBracket => {
                self.advance();
                self.parse_list_literal(span)?
            }
            TokenKind::LBrace => {
                self.advance();
                self.parse_brace_literal(span)?
            }
            TokenKind::Star => {
                self.advance();
                let operand = self.parse_expression()?;
                Expression::new(ExprKind::Unpack(Box::new(operand)), span)
            }
            other => bail!(
                "Expected expression but found {} on line {}",
                describe(&other),
                self.line()
            ),
        };
        Ok(expr)
    }

    fn parse_paren_group(&mut self, span: Span) -> Result<Expression> {
        if self.eat(&TokenKind::RParen) {
            return Ok(Expression::new(ExprKind::Tuple(Vec::new()), span));
        }

        let first = self.parse_expression()?;
        if !matches!(self.current_kind(), TokenKind::Comma) {
            self.expect(&TokenKind::RParen, "')'")?;
            return Ok(first);
        }

        let mut items = vec![first];
        while self.eat(&TokenKind::Comma) {
            if matches!(self.current_kind(), TokenKind::RParen) {
                break;
            }
            items.push(self.parse_expression()?);
        }
        self.expect(&TokenKind::RParen, "')'")?;
        Ok(Expression::new(ExprKind::Tuple(items), span))
    }

    fn parse_list_literal(&mut self, span: Span) -> Result<Expression> {
        if self.eat(&TokenKind::RBracket) {
            return Ok(Expression::new(ExprKind::List(Vec::new()), span));
        }

        let first = if self.eat(&TokenKind::Star) {
            Expression::new(
                ExprKind::Unpack(Box::new(self.parse_expression()?)),
                span,
            )
        } else {
            self.parse_expression()?
        };

        if matches!(self.current_kind(), TokenKind::For) {
            let body = self.parse_comprehension_clauses(first)?;
            self.expect(&TokenKind::RBracket, "']'")?;
            let accumulator = self.hidden_name("comp");
            return Ok(Expression::new(
                ExprKind::ListComp {
                    accumulator: accumulator.clone(),
                    body: self.finish_comprehension(accumulator, body, span)?,
                },
                span,
            ));
        }

        let mut items = vec![first];
        while self.eat(&TokenKind::Comma) {
            if matches!(self.current_kind(), TokenKind::RBracket) {
                break;
            }
            if self.eat(&TokenKind::Star) {
                items.push(Expression::new(
                    ExprKind::Unpack(Box::new(self.parse_expression()?)),
                    span,
                ));
            } else {
                items.push(self.parse_expression()?);
            }
        }
        self.expect(&TokenKind::RBracket, "']'")?;
        Ok(Expression::new(ExprKind::List(items), span))
    }

    // Parses the `for t in xs [if cond]` clause chain of a comprehension and
    // returns the element expression wrapped in the loop/condition shell,
    // minus the final append (added by finish_comprehension).
    fn parse_comprehension_clauses(&mut self, element: Expression) -> Result<CompShell> {
        let mut clauses = Vec::new();
        while matches!(self.current_kind(), TokenKind::For) {
            let span = self.current_span();
            self.advance();
            let target = to_assign_target(self.parse_expression_list()?)?;
            self.expect(&TokenKind::In, "'in'")?;
            let iterable = self.parse_or()?;
            let condition = if self.eat(&TokenKind::If) {
                Some(self.parse_or()?)
            } else {
                None
            };
            clauses.push((target, iterable, condition, span));
        }
        Ok(CompShell { element, clauses })
    }

    fn finish_comprehension(
        &mut self,
        accumulator: String,
        shell: CompShell,
        span: Span,
    ) -> Result<Vec<Statement>> {
        let append = Statement::new(
            StmtKind::Expr(Expression::new(
                ExprKind::Call {
                    callee: Box::new(Expression::new(
                        ExprKind::Attribute {
                            object: Box::new(Expression::new(
                                ExprKind::Identifier(accumulator),
                                span,
                            )),
                            name: "append".to_string(),
                        },
                        span,
                    )),
                    args: vec![CallArg::Positional(shell.element)],
                },
                span,
            )),
            span,
        );

        let mut body = vec![append];
        for (target, iterable, condition, clause_span) in shell.clauses.into_iter().rev() {
            if let Some(condition) = condition {
                body = vec![Statement::new(
                    StmtKind::If {
                        condition,
                        then_body: body,
                        else_body: Vec::new(),
                    },
                    clause_span,
                )];
            }
            body = self.desugar_for(target, iterable, body, Vec::new(), clause_span);
        }
        Ok(body)
    }

    fn parse_brace_literal(&mut self, span: Span) -> Result<Expression> {
        if self.eat(&TokenKind::RBrace) {
            return Ok(Expression::new(ExprKind::Dict(Vec::new()), span));
        }

        // `**x` forces a dict literal.
        if self.eat(&TokenKind::DoubleStar) {
            let mut items = vec![DictItem::Unpack(self.parse_expression()?)];
            while self.eat(&TokenKind::Comma) {
                if matches!(self.current_kind(), TokenKind::RBrace) {
                    break;
                }
                items.push(self.parse_dict_item()?);
            }
            self.expect(&TokenKind::RBrace, "'}'")?;
            return Ok(Expression::new(ExprKind::Dict(items), span));
        }

        let first = self.parse_expression()?;
        if matches!(self.current_kind(), TokenKind::Colon) {
            self.advance();
            let value = self.parse_expression()?;
            let mut items = vec![DictItem::Pair(first, value)];
            while self.eat(&TokenKind::Comma) {
                if matches!(self.current_kind(), TokenKind::RBrace) {
                    break;
                }
                items.push(self.parse_dict_item()?);
            }
            self.expect(&TokenKind::RBrace, "'}'")?;
            return Ok(Expression::new(ExprKind::Dict(items), span));
        }

        let mut items = vec![first];
        while self.eat(&TokenKind::Comma) {
            if matches!(self.current_kind(), TokenKind::RBrace) {
                break;
            }
            items.push(self.parse_expression()?);
        }
        self.expect(&TokenKind::RBrace, "'}'")?;
        Ok(Expression::new(ExprKind::Set(items), span))
    }

    fn parse_dict_item(&mut self) -> Result<DictItem> {
        if self.eat(&TokenKind::DoubleStar) {
            return Ok(DictItem::Unpack(self.parse_expression()?));
        }
        let key = self.parse_expression()?;
        self.expect(&TokenKind::Colon, "':'")?;
        let value = self.parse_expression()?;
        Ok(DictItem::Pair(key, value))
    }
}

struct CompShell {
    element: Expression,
    clauses: Vec<(AssignTarget, Expression, Option<Expression>, Span)>,
}

fn expression_list_ends(kind: &TokenKind<'_>) -> bool {
    matches!(
        kind,
        TokenKind::Newline
            | TokenKind::Dedent
            | TokenKind::EOF
            | TokenKind::Equal
            | TokenKind::In
            | TokenKind::RParen
            | TokenKind::RBracket
            | TokenKind::RBrace
            | TokenKind::Colon
    )
}

fn compound_operator(kind: &TokenKind<'_>) -> Option<BinaryOperator> {
    let op = match kind {
        TokenKind::PlusEq => BinaryOperator::Add,
        TokenKind::MinusEq => BinaryOperator::Sub,
        TokenKind::StarEq => BinaryOperator::Mul,
        TokenKind::SlashEq => BinaryOperator::TrueDiv,
        TokenKind::DoubleSlashEq => BinaryOperator::FloorDiv,
        TokenKind::PercentEq => BinaryOperator::Mod,
        TokenKind::DoubleStarEq => BinaryOperator::Pow,
        TokenKind::AmpersandEq => BinaryOperator::BitAnd,
        TokenKind::PipeEq => BinaryOperator::BitOr,
        TokenKind::CaretEq => BinaryOperator::BitXor,
        TokenKind::ShiftLeftEq => BinaryOperator::ShiftLeft,
        TokenKind::ShiftRightEq => BinaryOperator::ShiftRight,
        _ => return None,
    };
    Some(op)
}

fn to_assign_target(expr: Expression) -> Result<AssignTarget> {
    let line = expr.span.line + 1;
    match expr.kind {
        ExprKind::Identifier(name) => Ok(AssignTarget::Name(name)),
        ExprKind::Attribute { object, name } => Ok(AssignTarget::Member {
            object: *object,
            name,
        }),
        ExprKind::Index { object, index } => Ok(AssignTarget::Index {
            object: *object,
            index: *index,
        }),
        ExprKind::Tuple(items) | ExprKind::List(items) => {
            let mut slots = Vec::new();
            let mut starred_seen = false;
            for item in items {
                if let ExprKind::Unpack(inner) = item.kind {
                    if starred_seen {
                        bail!("Multiple starred targets in assignment on line {line}");
                    }
                    starred_seen = true;
                    match inner.kind {
                        ExprKind::Identifier(name) => slots.push(PackSlot::Starred(name)),
                        _ => bail!("Starred assignment target must be a name on line {line}"),
                    }
                } else {
                    slots.push(PackSlot::Target(to_assign_target(item)?));
                }
            }
            Ok(AssignTarget::Pack(slots))
        }
        _ => bail!("Invalid assignment target on line {line}"),
    }
}

fn describe(kind: &TokenKind<'_>) -> String {
    match kind {
        TokenKind::Identifier(name) => format!("identifier '{name}'"),
        TokenKind::Integer(value) => format!("integer {value}"),
        TokenKind::Float(value) => format!("float {value}"),
        TokenKind::String(_) => "string literal".to_string(),
        TokenKind::Newline => "newline".to_string(),
        TokenKind::Indent => "indent".to_string(),
        TokenKind::Dedent => "dedent".to_string(),
        TokenKind::EOF => "end of input".to_string(),
        other => format!("{other:?}"),
    }
}

pub fn parse_tokens(tokens: Vec<Token<'_>>) -> Result<Program> {
    Parser::new(tokens).parse_program()
}

pub fn parse_expression_tokens(tokens: Vec<Token<'_>>) -> Result<Expression> {
    Parser::new(tokens).parse_expression_only()
}

// ----- scope analysis -----

#[derive(Default)]
struct ScopeInfo {
    assigned: HashSet<String>,
    used: HashSet<String>,
    globals: HashSet<String>,
    nonlocals: HashSet<String>,
}

fn analyze_program(program: &mut Program) -> Result<()> {
    let mut chain: Vec<HashSet<String>> = Vec::new();
    analyze_nested_functions(&mut program.statements, &mut chain)?;
    Ok(())
}

// Computes `variables`, `local_captures`, and `global_captures` for a
// function, recursing into nested functions so transitive captures are
// threaded through intermediate frames.
fn analyze_function(
    def: &mut FunctionDef,
    chain: &mut Vec<HashSet<String>>,
) -> Result<HashSet<String>> {
    let mut info = ScopeInfo::default();
    collect_body(&def.body, &mut info);

    let mut params: HashSet<String> = def
        .parameters
        .iter()
        .map(|param| param.name.clone())
        .collect();
    params.extend(def.list_args.iter().cloned());
    params.extend(def.kwargs.iter().cloned());

    let assigned: HashSet<String> = info
        .assigned
        .difference(&info.globals)
        .filter(|name| !info.nonlocals.contains(*name))
        .cloned()
        .collect();

    let mut variables: Vec<String> = assigned.difference(&params).cloned().collect();
    variables.sort();
    def.variables = variables;

    let bound_here: HashSet<String> = params.union(&assigned).cloned().collect();

    let mut needed: HashSet<String> = info
        .used
        .iter()
        .filter(|name| {
            !bound_here.contains(*name) && !info.globals.contains(*name)
        })
        .cloned()
        .collect();
    needed.extend(info.nonlocals.iter().cloned());

    chain.push(bound_here.clone());
    let nested_needed = analyze_nested_functions(&mut def.body, chain)?;
    chain.pop();

    needed.extend(
        nested_needed
            .into_iter()
            .filter(|name| !bound_here.contains(name)),
    );

    let mut local_captures = Vec::new();
    for name in &needed {
        let bound_in_enclosing_function = chain.iter().any(|frame| frame.contains(name));
        if bound_in_enclosing_function {
            local_captures.push(name.clone());
        } else if info.nonlocals.contains(name) {
            bail!(
                "No binding for nonlocal '{name}' declared on line {}",
                def.span.line + 1
            );
        }
        // Anything else resolves dynamically against module globals and
        // builtins at run time.
    }
    local_captures.sort();

    let mut global_captures: Vec<String> = info.globals.into_iter().collect();
    global_captures.sort();

    def.local_captures = local_captures.clone();
    def.global_captures = global_captures;

    Ok(local_captures.into_iter().collect())
}

// Visits every function defined directly inside `statements` (def
// statements, lambdas, class methods), analyzes each, and returns the union
// of their capture sets.
fn analyze_nested_functions(
    statements: &mut [Statement],
    chain: &mut Vec<HashSet<String>>,
) -> Result<HashSet<String>> {
    let mut captures = HashSet::new();
    for statement in statements {
        analyze_functions_in_statement(statement, chain, &mut captures)?;
    }
    Ok(captures)
}

fn analyze_functions_in_statement(
    statement: &mut Statement,
    chain: &mut Vec<HashSet<String>>,
    captures: &mut HashSet<String>,
) -> Result<()> {
    match &mut statement.kind {
        StmtKind::FunctionDef(def) => {
            captures.extend(analyze_function(def, chain)?);
        }
        StmtKind::ClassDef { methods, bases, .. } => {
            for base in bases {
                analyze_functions_in_expression(base, chain, captures)?;
            }
            for method in methods {
                captures.extend(analyze_function(method, chain)?);
            }
        }
        StmtKind::Expr(expr) | StmtKind::Raise(Some(expr)) | StmtKind::Return(Some(expr)) => {
            analyze_functions_in_expression(expr, chain, captures)?;
        }
        StmtKind::Assign { target, value } => {
            analyze_functions_in_target(target, chain, captures)?;
            analyze_functions_in_expression(value, chain, captures)?;
        }
        StmtKind::If {
            condition,
            then_body,
            else_body,
        } => {
            analyze_functions_in_expression(condition, chain, captures)?;
            for body in [then_body, else_body] {
                for statement in body {
                    analyze_functions_in_statement(statement, chain, captures)?;
                }
            }
        }
        StmtKind::While {
            condition,
            body,
            else_body,
        } => {
            analyze_functions_in_expression(condition, chain, captures)?;
            for body in [body, else_body] {
                for statement in body {
                    analyze_functions_in_statement(statement, chain, captures)?;
                }
            }
        }
        StmtKind::Try {
            body,
            handlers,
            finally_body,
        } => {
            for statement in body.iter_mut().chain(finally_body.iter_mut()) {
                analyze_functions_in_statement(statement, chain, captures)?;
            }
            for handler in handlers {
                if let Some(exception_type) = &mut handler.exception_type {
                    analyze_functions_in_expression(exception_type, chain, captures)?;
                }
                for statement in &mut handler.body {
                    analyze_functions_in_statement(statement, chain, captures)?;
                }
            }
        }
        StmtKind::Raise(None)
        | StmtKind::Return(None)
        | StmtKind::Break { .. }
        | StmtKind::Continue
        | StmtKind::Import { .. }
        | StmtKind::ImportFrom { .. }
        | StmtKind::Global(_)
        | StmtKind::Nonlocal(_)
        | StmtKind::Pass => {}
    }
    Ok(())
}

fn analyze_functions_in_target(
    target: &mut AssignTarget,
    chain: &mut Vec<HashSet<String>>,
    captures: &mut HashSet<String>,
) -> Result<()> {
    match target {
        AssignTarget::Name(_) => Ok(()),
        AssignTarget::Pack(slots) => {
            for slot in slots {
                if let PackSlot::Target(target) = slot {
                    analyze_functions_in_target(target, chain, captures)?;
                }
            }
            Ok(())
        }
        AssignTarget::Index { object, index } => {
            analyze_functions_in_expression(object, chain, captures)?;
            analyze_functions_in_expression(index, chain, captures)
        }
        AssignTarget::Member { object, .. } => {
            analyze_functions_in_expression(object, chain, captures)
        }
    }
}

fn analyze_functions_in_expression(
    expr: &mut Expression,
    chain: &mut Vec<HashSet<String>>,
    captures: &mut HashSet<String>,
) -> Result<()> {
    match &mut expr.kind {
        ExprKind::Lambda(def) => {
            captures.extend(analyze_function(def, chain)?);
            Ok(())
        }
        ExprKind::ListComp { body, .. } => {
            for statement in body {
                analyze_functions_in_statement(statement, chain, captures)?;
            }
            Ok(())
        }
        ExprKind::Tuple(items) | ExprKind::List(items) | ExprKind::Set(items) => {
            for item in items {
                analyze_functions_in_expression(item, chain, captures)?;
            }
            Ok(())
        }
        ExprKind::Dict(items) => {
            for item in items {
                match item {
                    DictItem::Pair(key, value) => {
                        analyze_functions_in_expression(key, chain, captures)?;
                        analyze_functions_in_expression(value, chain, captures)?;
                    }
                    DictItem::Unpack(expr) => {
                        analyze_functions_in_expression(expr, chain, captures)?;
                    }
                }
            }
            Ok(())
        }
        ExprKind::Attribute { object, .. } => {
            analyze_functions_in_expression(object, chain, captures)
        }
        ExprKind::Index { object, index } => {
            analyze_functions_in_expression(object, chain, captures)?;
            analyze_functions_in_expression(index, chain, captures)
        }
        ExprKind::Slice {
            object,
            start,
            stop,
            step,
        } => {
            analyze_functions_in_expression(object, chain, captures)?;
            for part in [start, stop, step].into_iter().flatten() {
                analyze_functions_in_expression(part, chain, captures)?;
            }
            Ok(())
        }
        ExprKind::Call { callee, args } => {
            analyze_functions_in_expression(callee, chain, captures)?;
            for arg in args {
                match arg {
                    CallArg::Positional(expr)
                    | CallArg::Keyword(_, expr)
                    | CallArg::Star(expr)
                    | CallArg::DoubleStar(expr) => {
                        analyze_functions_in_expression(expr, chain, captures)?;
                    }
                }
            }
            Ok(())
        }
        ExprKind::Unary { operand, .. } => {
            analyze_functions_in_expression(operand, chain, captures)
        }
        ExprKind::Binary { left, right, .. }
        | ExprKind::InPlaceBinary { left, right, .. }
        | ExprKind::BoolOp { left, right, .. }
        | ExprKind::Is { left, right, .. } => {
            analyze_functions_in_expression(left, chain, captures)?;
            analyze_functions_in_expression(right, chain, captures)
        }
        ExprKind::Contains {
            item, container, ..
        } => {
            analyze_functions_in_expression(item, chain, captures)?;
            analyze_functions_in_expression(container, chain, captures)
        }
        ExprKind::Conditional {
            condition,
            then,
            otherwise,
        } => {
            analyze_functions_in_expression(condition, chain, captures)?;
            analyze_functions_in_expression(then, chain, captures)?;
            analyze_functions_in_expression(otherwise, chain, captures)
        }
        ExprKind::Not(inner) | ExprKind::Unpack(inner) | ExprKind::UnpackMap(inner) => {
            analyze_functions_in_expression(inner, chain, captures)
        }
        ExprKind::Integer(_)
        | ExprKind::Float(_)
        | ExprKind::Str(_)
        | ExprKind::Boolean(_)
        | ExprKind::NoneLiteral
        | ExprKind::Identifier(_) => Ok(()),
    }
}

// Records names assigned, used, and declared global/nonlocal directly inside
// a function body. Does not descend into nested function bodies; those
// contribute through their own capture sets.
fn collect_body(statements: &[Statement], info: &mut ScopeInfo) {
    for statement in statements {
        collect_statement(statement, info);
    }
}

fn collect_statement(statement: &Statement, info: &mut ScopeInfo) {
    match &statement.kind {
        StmtKind::Expr(expr) => collect_expression(expr, info),
        StmtKind::Assign { target, value } => {
            collect_target(target, info);
            collect_expression(value, info);
        }
        StmtKind::If {
            condition,
            then_body,
            else_body,
        } => {
            collect_expression(condition, info);
            collect_body(then_body, info);
            collect_body(else_body, info);
        }
        StmtKind::While {
            condition,
            body,
            else_body,
        } => {
            collect_expression(condition, info);
            collect_body(body, info);
            collect_body(else_body, info);
        }
        StmtKind::Return(value) | StmtKind::Raise(value) => {
            if let Some(value) = value {
                collect_expression(value, info);
            }
        }
        StmtKind::FunctionDef(def) => {
            info.assigned.insert(def.name.clone());
            // Defaults are evaluated in the enclosing scope.
            for parameter in &def.parameters {
                if let Some(default) = &parameter.default {
                    collect_expression(default, info);
                }
            }
        }
        StmtKind::ClassDef {
            name,
            bases,
            methods,
        } => {
            info.assigned.insert(name.clone());
            for base in bases {
                collect_expression(base, info);
            }
            // Method default values evaluate in the enclosing scope.
            for method in methods {
                for parameter in &method.parameters {
                    if let Some(default) = &parameter.default {
                        collect_expression(default, info);
                    }
                }
            }
        }
        StmtKind::Try {
            body,
            handlers,
            finally_body,
        } => {
            collect_body(body, info);
            for handler in handlers {
                if let Some(exception_type) = &handler.exception_type {
                    collect_expression(exception_type, info);
                }
                if let Some(variable) = &handler.variable {
                    info.assigned.insert(variable.clone());
                }
                collect_body(&handler.body, info);
            }
            collect_body(finally_body, info);
        }
        StmtKind::Import { module, alias } => {
            info.assigned
                .insert(alias.clone().unwrap_or_else(|| module.clone()));
        }
        StmtKind::ImportFrom { names, .. } => {
            for (name, alias) in names {
                info.assigned
                    .insert(alias.clone().unwrap_or_else(|| name.clone()));
            }
        }
        StmtKind::Global(names) => info.globals.extend(names.iter().cloned()),
        StmtKind::Nonlocal(names) => info.nonlocals.extend(names.iter().cloned()),
        StmtKind::Break { .. } | StmtKind::Continue | StmtKind::Pass => {}
    }
}

fn collect_target(target: &AssignTarget, info: &mut ScopeInfo) {
    match target {
        AssignTarget::Name(name) => {
            info.assigned.insert(name.clone());
        }
        AssignTarget::Pack(slots) => {
            for slot in slots {
                match slot {
                    PackSlot::Target(target) => collect_target(target, info),
                    PackSlot::Starred(name) => {
                        info.assigned.insert(name.clone());
                    }
                }
            }
        }
        AssignTarget::Index { object, index } => {
            collect_expression(object, info);
            collect_expression(index, info);
        }
        AssignTarget::Member { object, .. } => collect_expression(object, info),
    }
}

fn collect_expression(expr: &Expression, info: &mut ScopeInfo) {
    match &expr.kind {
        ExprKind::Identifier(name) => {
            info.used.insert(name.clone());
        }
        ExprKind::Lambda(def) => {
            for parameter in &def.parameters {
                if let Some(default) = &parameter.default {
                    collect_expression(default, info);
                }
            }
        }
        ExprKind::ListComp { body, .. } => collect_body(body, info),
        ExprKind::Tuple(items) | ExprKind::List(items) | ExprKind::Set(items) => {
            for item in items {
                collect_expression(item, info);
            }
        }
        ExprKind::Dict(items) => {
            for item in items {
                match item {
                    DictItem::Pair(key, value) => {
                        collect_expression(key, info);
                        collect_expression(value, info);
                    }
                    DictItem::Unpack(expr) => collect_expression(expr, info),
                }
            }
        }
        ExprKind::Attribute { object, .. } => collect_expression(object, info),
        ExprKind::Index { object, index } => {
            collect_expression(object, info);
            collect_expression(index, info);
        }
        ExprKind::Slice {
            object,
            start,
            stop,
            step,
        } => {
            collect_expression(object, info);
            for part in [start, stop, step].iter().filter_map(|p| p.as_deref()) {
                collect_expression(part, info);
            }
        }
        ExprKind::Call { callee, args } => {
            collect_expression(callee, info);
            for arg in args {
                match arg {
                    CallArg::Positional(expr)
                    | CallArg::Keyword(_, expr)
                    | CallArg::Star(expr)
                    | CallArg::DoubleStar(expr) => collect_expression(expr, info),
                }
            }
        }
        ExprKind::Unary { operand, .. } => collect_expression(operand, info),
        ExprKind::Binary { left, right, .. }
        | ExprKind::InPlaceBinary { left, right, .. }
        | ExprKind::BoolOp { left, right, .. }
        | ExprKind::Is { left, right, .. } => {
            collect_expression(left, info);
            collect_expression(right, info);
        }
        ExprKind::Contains {
            item, container, ..
        } => {
            collect_expression(item, info);
            collect_expression(container, info);
        }
        ExprKind::Conditional {
            condition,
            then,
            otherwise,
        } => {
            collect_expression(condition, info);
            collect_expression(then, info);
            collect_expression(otherwise, info);
        }
        ExprKind::Not(inner) | ExprKind::Unpack(inner) | ExprKind::UnpackMap(inner) => {
            collect_expression(inner, info);
        }
        ExprKind::Integer(_)
        | ExprKind::Float(_)
        | ExprKind::Str(_)
        | ExprKind::Boolean(_)
        | ExprKind::NoneLiteral => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::tokenize;
    use indoc::indoc;

    fn parse(input: &str) -> Program {
        let tokens = tokenize(input).expect("tokenize should succeed");
        parse_tokens(tokens).expect("parse should succeed")
    }

    fn parse_err(input: &str) -> String {
        let tokens = tokenize(input).expect("tokenize should succeed");
        parse_tokens(tokens)
            .expect_err("parse should fail")
            .to_string()
    }

    fn function<'p>(program: &'p Program, name: &str) -> &'p FunctionDef {
        program
            .statements
            .iter()
            .find_map(|statement| match &statement.kind {
                StmtKind::FunctionDef(def) if def.name == name => Some(def),
                _ => None,
            })
            .expect("expected function definition")
    }

    #[test]
    fn parses_assignment_and_expression_statement() {
        let program = parse("x = 1 + 2\nprint(x)\n");
        assert_eq!(program.statements.len(), 2);
        assert!(matches!(
            &program.statements[0].kind,
            StmtKind::Assign {
                target: AssignTarget::Name(name),
                ..
            } if name == "x"
        ));
        assert!(matches!(&program.statements[1].kind, StmtKind::Expr(_)));
    }

    #[test]
    fn parses_tuple_assignment() {
        let program = parse("a, b = 1, 2\n");
        let StmtKind::Assign { target, value } = &program.statements[0].kind else {
            panic!("expected assignment");
        };
        assert!(matches!(target, AssignTarget::Pack(slots) if slots.len() == 2));
        assert!(matches!(&value.kind, ExprKind::Tuple(items) if items.len() == 2));
    }

    #[test]
    fn parses_starred_pack_target() {
        let program = parse("a, *rest = values\n");
        let StmtKind::Assign { target, .. } = &program.statements[0].kind else {
            panic!("expected assignment");
        };
        let AssignTarget::Pack(slots) = target else {
            panic!("expected pack target");
        };
        assert!(matches!(&slots[1], PackSlot::Starred(name) if name == "rest"));
    }

    #[test]
    fn desugars_for_loop_into_iterator_protocol() {
        let program = parse(indoc! {"
            for i in items:
                print(i)
        "});
        // iterator assignment followed by the while loop
        assert_eq!(program.statements.len(), 2);
        assert!(matches!(
            &program.statements[0].kind,
            StmtKind::Assign { .. }
        ));
        let StmtKind::While {
            condition, body, ..
        } = &program.statements[1].kind
        else {
            panic!("expected while loop");
        };
        assert_eq!(condition.kind, ExprKind::Boolean(true));
        let StmtKind::Try { handlers, .. } = &body[0].kind else {
            panic!("expected try pulling __next__");
        };
        assert!(matches!(
            &handlers[0].body[0].kind,
            StmtKind::Break {
                exit_for_loop_normally: true
            }
        ));
    }

    #[test]
    fn desugars_compound_index_assignment_with_temporaries() {
        let program = parse("xs[i] += 1\n");
        // object temp, index temp, then the read-modify-write
        assert_eq!(program.statements.len(), 3);
        let StmtKind::Assign { value, .. } = &program.statements[2].kind else {
            panic!("expected assignment");
        };
        assert!(matches!(&value.kind, ExprKind::InPlaceBinary { .. }));
    }

    #[test]
    fn desugars_list_comprehension() {
        let program = parse("squares = [x * x for x in range(10) if x > 1]\n");
        let StmtKind::Assign { value, .. } = &program.statements[0].kind else {
            panic!("expected assignment");
        };
        let ExprKind::ListComp { body, .. } = &value.kind else {
            panic!("expected comprehension");
        };
        assert!(matches!(&body[1].kind, StmtKind::While { .. }));
    }

    #[test]
    fn parses_conditional_expression() {
        let program = parse("x = 1 if flag else 2\n");
        let StmtKind::Assign { value, .. } = &program.statements[0].kind else {
            panic!("expected assignment");
        };
        assert!(matches!(&value.kind, ExprKind::Conditional { .. }));
    }

    #[test]
    fn parses_try_except_finally() {
        let program = parse(indoc! {"
            try:
                risky()
            except ValueError as e:
                print(e)
            except:
                pass
            finally:
                done()
        "});
        let StmtKind::Try {
            handlers,
            finally_body,
            ..
        } = &program.statements[0].kind
        else {
            panic!("expected try statement");
        };
        assert_eq!(handlers.len(), 2);
        assert_eq!(handlers[0].variable.as_deref(), Some("e"));
        assert!(handlers[1].exception_type.is_none());
        assert_eq!(finally_body.len(), 1);
    }

    #[test]
    fn parses_class_with_bases_and_methods() {
        let program = parse(indoc! {"
            class B(A):
                def f(self):
                    return 1
        "});
        let StmtKind::ClassDef {
            name,
            bases,
            methods,
        } = &program.statements[0].kind
        else {
            panic!("expected class definition");
        };
        assert_eq!(name, "B");
        assert_eq!(bases.len(), 1);
        assert_eq!(methods.len(), 1);
        assert_eq!(methods[0].name, "f");
    }

    #[test]
    fn parses_keyword_and_unpack_call_arguments() {
        let program = parse("f(1, *xs, key=2, **opts)\n");
        let StmtKind::Expr(expr) = &program.statements[0].kind else {
            panic!("expected expression statement");
        };
        let ExprKind::Call { args, .. } = &expr.kind else {
            panic!("expected call");
        };
        assert!(matches!(&args[0], CallArg::Positional(_)));
        assert!(matches!(&args[1], CallArg::Star(_)));
        assert!(matches!(&args[2], CallArg::Keyword(name, _) if name == "key"));
        assert!(matches!(&args[3], CallArg::DoubleStar(_)));
    }

    #[test]
    fn analyzes_closure_captures() {
        let program = parse(indoc! {"
            def make():
                x = 0
                def inc():
                    nonlocal x
                    x = x + 1
                    return x
                return inc
        "});
        let make = function(&program, "make");
        assert!(make.variables.contains(&"inc".to_string()));
        assert!(make.variables.contains(&"x".to_string()));
        assert!(make.local_captures.is_empty());

        let StmtKind::FunctionDef(inc) = &make.body[1].kind else {
            panic!("expected nested def");
        };
        assert_eq!(inc.local_captures, vec!["x".to_string()]);
        assert!(inc.variables.is_empty());
    }

    #[test]
    fn analyzes_transitive_captures_through_intermediate_frames() {
        let program = parse(indoc! {"
            def outer():
                x = 1
                def middle():
                    def inner():
                        return x
                    return inner
                return middle
        "});
        let outer = function(&program, "outer");
        let StmtKind::FunctionDef(middle) = &outer.body[1].kind else {
            panic!("expected middle def");
        };
        // middle itself never reads x but must thread the cell through.
        assert_eq!(middle.local_captures, vec!["x".to_string()]);
    }

    #[test]
    fn analyzes_global_declaration() {
        let program = parse(indoc! {"
            def bump():
                global count
                count = count + 1
        "});
        let bump = function(&program, "bump");
        assert_eq!(bump.global_captures, vec!["count".to_string()]);
        assert!(bump.variables.is_empty());
        assert!(bump.local_captures.is_empty());
    }

    #[test]
    fn errors_on_nonlocal_without_binding() {
        let err = parse_err(indoc! {"
            def f():
                nonlocal missing
                missing = 1
        "});
        assert!(err.contains("No binding for nonlocal 'missing'"));
    }

    #[test]
    fn errors_on_invalid_assignment_target() {
        let err = parse_err("1 + 2 = 3\n");
        assert!(err.contains("Invalid assignment target"));
    }

    #[test]
    fn errors_on_parameter_order() {
        let err = parse_err(indoc! {"
            def f(a=1, b):
                pass
        "});
        assert!(err.contains("Parameter without default"));
    }

    #[test]
    fn errors_on_try_without_clauses() {
        let err = parse_err(indoc! {"
            try:
                pass
        "});
        assert!(err.contains("at least one except or finally"));
    }

    #[test]
    fn parses_elif_chain_as_nested_if() {
        let program = parse(indoc! {"
            if a:
                pass
            elif b:
                pass
            else:
                pass
        "});
        let StmtKind::If { else_body, .. } = &program.statements[0].kind else {
            panic!("expected if statement");
        };
        assert!(matches!(&else_body[0].kind, StmtKind::If { .. }));
    }

    #[test]
    fn parses_slices_and_indexing() {
        let program = parse("a = xs[1]\nb = xs[1:5:2]\nc = xs[:3]\n");
        let kinds: Vec<_> = program
            .statements
            .iter()
            .map(|statement| match &statement.kind {
                StmtKind::Assign { value, .. } => &value.kind,
                _ => panic!("expected assignment"),
            })
            .collect();
        assert!(matches!(kinds[0], ExprKind::Index { .. }));
        assert!(matches!(
            kinds[1],
            ExprKind::Slice {
                start: Some(_),
                stop: Some(_),
                step: Some(_),
                ..
            }
        ));
        assert!(matches!(
            kinds[2],
            ExprKind::Slice {
                start: None,
                stop: Some(_),
                step: None,
                ..
            }
        ));
    }
}
