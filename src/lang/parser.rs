use crate::lang::ast::{BinOp, Expr, ExprKind, Program, Stmt, StmtKind, UnaryOp};
use crate::lang::lexer::{lex, line_of, Span, Token, TokenKind};

/// Parsing recurses per nesting level, so depth is bounded to keep a
/// pathological candidate from exhausting the host stack.
const MAX_NESTING_DEPTH: usize = 256;

/// Parse a candidate script. Errors are plain messages with a line number,
/// written to be useful inside a correction prompt.
pub fn parse(source: &str) -> Result<Program, String> {
    Parser::new(source).parse_program()
}

struct Parser<'a> {
    source: &'a str,
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl<'a> Parser<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            source,
            tokens: lex(source),
            pos: 0,
            depth: 0,
        }
    }

    // ------------------------------------------------------------------
    // Token helpers
    // ------------------------------------------------------------------

    fn peek(&self) -> &Token {
        &self.tokens[self.pos]
    }

    fn peek_ahead(&self, n: usize) -> &Token {
        let idx = (self.pos + n).min(self.tokens.len() - 1);
        &self.tokens[idx]
    }

    fn advance(&mut self) -> Token {
        let token = self.tokens[self.pos].clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.peek().kind == kind
    }

    fn eat(&mut self, kind: TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind) -> Result<Token, String> {
        if self.check(kind) {
            Ok(self.advance())
        } else {
            Err(self.error_here(format!("expected '{}', found '{}'", kind, self.describe_peek())))
        }
    }

    fn describe_peek(&self) -> String {
        let token = self.peek();
        if token.text.is_empty() {
            token.kind.to_string()
        } else {
            token.text.clone()
        }
    }

    fn error_here(&self, msg: String) -> String {
        self.error_at(self.peek().span, msg)
    }

    fn error_at(&self, span: Span, msg: String) -> String {
        format!("line {}: {}", line_of(self.source, span.start), msg)
    }

    fn enter(&mut self) -> Result<(), String> {
        self.depth += 1;
        if self.depth > MAX_NESTING_DEPTH {
            return Err(self.error_here(format!(
                "code nested deeper than {} levels",
                MAX_NESTING_DEPTH
            )));
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth -= 1;
    }

    fn is_terminator(&self) -> bool {
        matches!(self.peek().kind, TokenKind::Newline | TokenKind::Semicolon)
    }

    fn skip_terminators(&mut self) {
        while self.is_terminator() {
            self.advance();
        }
    }

    /// Newlines are insignificant inside parens, brackets and argument lists.
    fn skip_newlines(&mut self) {
        while self.check(TokenKind::Newline) {
            self.advance();
        }
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    fn parse_program(&mut self) -> Result<Program, String> {
        let mut stmts = Vec::new();
        loop {
            self.skip_terminators();
            if self.check(TokenKind::Eof) {
                break;
            }
            stmts.push(self.parse_stmt()?);
            if !self.check(TokenKind::Eof) && !self.is_terminator() {
                return Err(self.error_here(format!(
                    "expected end of statement, found '{}'",
                    self.describe_peek()
                )));
            }
        }
        Ok(Program { stmts })
    }

    fn parse_stmt(&mut self) -> Result<Stmt, String> {
        self.enter()?;
        let stmt = match self.peek().kind {
            TokenKind::Import => self.parse_import(),
            TokenKind::Let => self.parse_let(),
            TokenKind::If => self.parse_if(),
            TokenKind::For => self.parse_for(),
            TokenKind::Break => {
                let token = self.advance();
                Ok(Stmt {
                    kind: StmtKind::Break,
                    span: token.span,
                })
            }
            TokenKind::Continue => {
                let token = self.advance();
                Ok(Stmt {
                    kind: StmtKind::Continue,
                    span: token.span,
                })
            }
            TokenKind::Ident if self.peek_ahead(1).kind == TokenKind::Eq => self.parse_assign(),
            _ => self.parse_expr().map(|expr| {
                let span = expr.span;
                Stmt {
                    kind: StmtKind::Expr(expr),
                    span,
                }
            }),
        };
        self.leave();
        stmt
    }

    fn parse_import(&mut self) -> Result<Stmt, String> {
        let start = self.expect(TokenKind::Import)?;
        let name = self.expect(TokenKind::Ident)?;
        let mut module = name.text.clone();
        let mut end = name.span;
        while self.eat(TokenKind::Dot) {
            let part = self.expect(TokenKind::Ident)?;
            module.push('.');
            module.push_str(&part.text);
            end = part.span;
        }
        Ok(Stmt {
            kind: StmtKind::Import { module },
            span: start.span.merge(end),
        })
    }

    fn parse_let(&mut self) -> Result<Stmt, String> {
        let start = self.expect(TokenKind::Let)?;
        let name = self.expect(TokenKind::Ident)?;
        self.expect(TokenKind::Eq)?;
        self.skip_newlines();
        let value = self.parse_expr()?;
        let span = start.span.merge(value.span);
        Ok(Stmt {
            kind: StmtKind::Let {
                name: name.text,
                value,
            },
            span,
        })
    }

    fn parse_assign(&mut self) -> Result<Stmt, String> {
        let name = self.expect(TokenKind::Ident)?;
        self.expect(TokenKind::Eq)?;
        self.skip_newlines();
        let value = self.parse_expr()?;
        let span = name.span.merge(value.span);
        Ok(Stmt {
            kind: StmtKind::Assign {
                name: name.text,
                value,
            },
            span,
        })
    }

    fn parse_if(&mut self) -> Result<Stmt, String> {
        let start = self.expect(TokenKind::If)?;
        let cond = self.parse_expr()?;
        let then_body = self.parse_block()?;
        let mut span = start.span;
        let else_body = if self.eat(TokenKind::Else) {
            if self.check(TokenKind::If) {
                self.enter()?;
                let nested = self.parse_if();
                self.leave();
                let nested = nested?;
                span = span.merge(nested.span);
                Some(vec![nested])
            } else {
                let body = self.parse_block()?;
                Some(body)
            }
        } else {
            None
        };
        Ok(Stmt {
            kind: StmtKind::If {
                cond,
                then_body,
                else_body,
            },
            span,
        })
    }

    fn parse_for(&mut self) -> Result<Stmt, String> {
        let start = self.expect(TokenKind::For)?;
        let var = self.expect(TokenKind::Ident)?;
        self.expect(TokenKind::In)?;
        let iterable = self.parse_expr()?;
        let body = self.parse_block()?;
        Ok(Stmt {
            kind: StmtKind::For {
                var: var.text,
                iterable,
                body,
            },
            span: start.span,
        })
    }

    fn parse_block(&mut self) -> Result<Vec<Stmt>, String> {
        self.skip_newlines();
        let open = self.expect(TokenKind::LBrace)?;
        let mut stmts = Vec::new();
        loop {
            self.skip_terminators();
            if self.check(TokenKind::RBrace) {
                break;
            }
            if self.check(TokenKind::Eof) {
                return Err(self.error_at(open.span, "unclosed '{'".to_string()));
            }
            stmts.push(self.parse_stmt()?);
            if !self.check(TokenKind::RBrace) && !self.is_terminator() {
                return Err(self.error_here(format!(
                    "expected end of statement, found '{}'",
                    self.describe_peek()
                )));
            }
        }
        self.expect(TokenKind::RBrace)?;
        Ok(stmts)
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    fn parse_expr(&mut self) -> Result<Expr, String> {
        self.enter()?;
        let expr = self.parse_binary(1);
        self.leave();
        expr
    }

    fn parse_binary(&mut self, min_prec: u8) -> Result<Expr, String> {
        let mut lhs = self.parse_unary()?;
        while let Some(op) = binop_of(self.peek().kind) {
            let prec = op.precedence();
            if prec < min_prec {
                break;
            }
            self.advance();
            self.skip_newlines();
            let rhs = self.parse_binary(prec + 1)?;
            let span = lhs.span.merge(rhs.span);
            lhs = Expr {
                kind: ExprKind::Binary {
                    op,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
                span,
            };
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr, String> {
        let op = match self.peek().kind {
            TokenKind::Minus => Some(UnaryOp::Neg),
            TokenKind::Bang => Some(UnaryOp::Not),
            _ => None,
        };
        if let Some(op) = op {
            let token = self.advance();
            self.enter()?;
            let operand = self.parse_unary();
            self.leave();
            let operand = operand?;
            let span = token.span.merge(operand.span);
            return Ok(Expr {
                kind: ExprKind::Unary {
                    op,
                    operand: Box::new(operand),
                },
                span,
            });
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Result<Expr, String> {
        let mut expr = self.parse_primary()?;
        loop {
            match self.peek().kind {
                TokenKind::LParen => {
                    let callee = match &expr.kind {
                        ExprKind::Ident(name) => name.clone(),
                        _ => {
                            return Err(self.error_at(
                                expr.span,
                                "only named functions can be called".to_string(),
                            ))
                        }
                    };
                    let (args, end) = self.parse_args(TokenKind::LParen, TokenKind::RParen)?;
                    let span = expr.span.merge(end);
                    expr = Expr {
                        kind: ExprKind::Call { callee, args },
                        span,
                    };
                }
                TokenKind::Dot => {
                    self.advance();
                    let name = self.expect(TokenKind::Ident)?;
                    let (args, end) = self.parse_args(TokenKind::LParen, TokenKind::RParen)?;
                    let span = expr.span.merge(end);
                    expr = Expr {
                        kind: ExprKind::Method {
                            receiver: Box::new(expr),
                            name: name.text,
                            args,
                        },
                        span,
                    };
                }
                TokenKind::LBracket => {
                    self.advance();
                    self.skip_newlines();
                    let index = self.parse_expr()?;
                    self.skip_newlines();
                    let close = self.expect(TokenKind::RBracket)?;
                    let span = expr.span.merge(close.span);
                    expr = Expr {
                        kind: ExprKind::Index {
                            target: Box::new(expr),
                            index: Box::new(index),
                        },
                        span,
                    };
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn parse_args(
        &mut self,
        open: TokenKind,
        close: TokenKind,
    ) -> Result<(Vec<Expr>, Span), String> {
        self.expect(open)?;
        let mut args = Vec::new();
        self.skip_newlines();
        if !self.check(close) {
            loop {
                args.push(self.parse_expr()?);
                self.skip_newlines();
                if !self.eat(TokenKind::Comma) {
                    break;
                }
                self.skip_newlines();
                // Trailing comma before the closer
                if self.check(close) {
                    break;
                }
            }
        }
        let end = self.expect(close)?;
        Ok((args, end.span))
    }

    fn parse_primary(&mut self) -> Result<Expr, String> {
        let token = self.peek().clone();
        match token.kind {
            TokenKind::IntLiteral => {
                self.advance();
                let digits = token.text.replace('_', "");
                let value = digits.parse::<i64>().map_err(|_| {
                    self.error_at(token.span, format!("integer literal '{}' too large", token.text))
                })?;
                Ok(Expr {
                    kind: ExprKind::Int(value),
                    span: token.span,
                })
            }
            TokenKind::FloatLiteral => {
                self.advance();
                let digits = token.text.replace('_', "");
                let value = digits.parse::<f64>().map_err(|_| {
                    self.error_at(token.span, format!("bad float literal '{}'", token.text))
                })?;
                Ok(Expr {
                    kind: ExprKind::Float(value),
                    span: token.span,
                })
            }
            TokenKind::StringLiteral => {
                self.advance();
                Ok(Expr {
                    kind: ExprKind::Str(unescape(&token.text)),
                    span: token.span,
                })
            }
            TokenKind::True => {
                self.advance();
                Ok(Expr {
                    kind: ExprKind::Bool(true),
                    span: token.span,
                })
            }
            TokenKind::False => {
                self.advance();
                Ok(Expr {
                    kind: ExprKind::Bool(false),
                    span: token.span,
                })
            }
            TokenKind::Ident => {
                self.advance();
                Ok(Expr {
                    kind: ExprKind::Ident(token.text),
                    span: token.span,
                })
            }
            TokenKind::LParen => {
                self.advance();
                self.skip_newlines();
                let inner = self.parse_expr()?;
                self.skip_newlines();
                self.expect(TokenKind::RParen)?;
                Ok(inner)
            }
            TokenKind::LBracket => {
                let (items, end) = self.parse_args(TokenKind::LBracket, TokenKind::RBracket)?;
                Ok(Expr {
                    kind: ExprKind::Array(items),
                    span: token.span.merge(end),
                })
            }
            TokenKind::Error => Err(self.error_at(
                token.span,
                format!("invalid character '{}'", token.text),
            )),
            _ => Err(self.error_here(format!(
                "expected an expression, found '{}'",
                self.describe_peek()
            ))),
        }
    }
}

fn binop_of(kind: TokenKind) -> Option<BinOp> {
    match kind {
        TokenKind::Plus => Some(BinOp::Add),
        TokenKind::Minus => Some(BinOp::Sub),
        TokenKind::Star => Some(BinOp::Mul),
        TokenKind::Slash => Some(BinOp::Div),
        TokenKind::Percent => Some(BinOp::Mod),
        TokenKind::EqEq => Some(BinOp::Eq),
        TokenKind::BangEq => Some(BinOp::Ne),
        TokenKind::Lt => Some(BinOp::Lt),
        TokenKind::LessEq => Some(BinOp::Le),
        TokenKind::Gt => Some(BinOp::Gt),
        TokenKind::GreaterEq => Some(BinOp::Ge),
        TokenKind::AmpAmp => Some(BinOp::And),
        TokenKind::PipePipe => Some(BinOp::Or),
        _ => None,
    }
}

/// Strip quotes and process escapes of a string literal token.
fn unescape(text: &str) -> String {
    let inner = &text[1..text.len() - 1];
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('"') => out.push('"'),
            Some('\\') => out.push('\\'),
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_one(source: &str) -> Stmt {
        let program = parse(source).unwrap();
        assert_eq!(program.stmts.len(), 1, "expected one statement");
        program.stmts.into_iter().next().unwrap()
    }

    #[test]
    fn precedence_binds_mul_tighter_than_add() {
        let stmt = parse_one("1 + 2 * 3");
        let StmtKind::Expr(expr) = stmt.kind else {
            panic!("expected expression statement");
        };
        let ExprKind::Binary { op, rhs, .. } = expr.kind else {
            panic!("expected binary expression");
        };
        assert_eq!(op, BinOp::Add);
        assert!(matches!(
            rhs.kind,
            ExprKind::Binary { op: BinOp::Mul, .. }
        ));
    }

    #[test]
    fn method_sugar_parses_to_method_nodes() {
        let stmt = parse_one("table(\"sales\").select(\"amount\").mean()");
        let StmtKind::Expr(expr) = stmt.kind else {
            panic!("expected expression statement");
        };
        let ExprKind::Method { receiver, name, args } = expr.kind else {
            panic!("expected method call");
        };
        assert_eq!(name, "mean");
        assert!(args.is_empty());
        assert!(matches!(
            receiver.kind,
            ExprKind::Method { ref name, .. } if name == "select"
        ));
    }

    #[test]
    fn assignment_is_distinguished_from_equality() {
        let stmt = parse_one("x = 1");
        assert!(matches!(stmt.kind, StmtKind::Assign { ref name, .. } if name == "x"));

        let stmt = parse_one("x == 1");
        assert!(matches!(stmt.kind, StmtKind::Expr(_)));
    }

    #[test]
    fn if_else_if_chains_nest() {
        let stmt = parse_one("if a { show(1) } else if b { show(2) } else { show(3) }");
        let StmtKind::If { else_body, .. } = stmt.kind else {
            panic!("expected if");
        };
        let else_body = else_body.unwrap();
        assert_eq!(else_body.len(), 1);
        assert!(matches!(else_body[0].kind, StmtKind::If { .. }));
    }

    #[test]
    fn newlines_are_insignificant_inside_calls() {
        let source = "group_by(\n  table(\"sales\"),\n  \"region\",\n  \"sum\",\n  \"amount\",\n)";
        let stmt = parse_one(source);
        let StmtKind::Expr(expr) = stmt.kind else {
            panic!("expected expression statement");
        };
        let ExprKind::Call { callee, args } = expr.kind else {
            panic!("expected call");
        };
        assert_eq!(callee, "group_by");
        assert_eq!(args.len(), 4);
    }

    #[test]
    fn statements_split_on_newlines_and_semicolons() {
        let program = parse("let a = 1; let b = 2\nshow(a + b)").unwrap();
        assert_eq!(program.stmts.len(), 3);
    }

    #[test]
    fn import_keeps_dotted_path() {
        let stmt = parse_one("import charts.bars");
        assert!(matches!(
            stmt.kind,
            StmtKind::Import { ref module } if module == "charts.bars"
        ));
    }

    #[test]
    fn errors_carry_line_numbers() {
        let err = parse("let a = 1\nlet b = (2 + \n").unwrap_err();
        assert!(err.starts_with("line 3:"), "got: {}", err);

        let err = parse("let x = $").unwrap_err();
        assert!(err.contains("invalid character '$'"));
    }

    #[test]
    fn calling_a_non_identifier_is_rejected() {
        let err = parse("(1 + 2)(3)").unwrap_err();
        assert!(err.contains("only named functions"));
    }

    #[test]
    fn string_escapes_are_processed() {
        let stmt = parse_one("show(\"a\\nb\\\"c\\\"\")");
        let StmtKind::Expr(expr) = stmt.kind else {
            panic!("expected expression statement");
        };
        let ExprKind::Call { args, .. } = expr.kind else {
            panic!("expected call");
        };
        assert!(matches!(
            args[0].kind,
            ExprKind::Str(ref s) if s == "a\nb\"c\""
        ));
    }

    #[test]
    fn nesting_depth_is_bounded() {
        let fine = format!("show({}1{})", "(".repeat(50), ")".repeat(50));
        assert!(parse(&fine).is_ok());

        let deep_parens = format!("show({}1{})", "(".repeat(5_000), ")".repeat(5_000));
        let err = parse(&deep_parens).unwrap_err();
        assert!(err.contains("nested deeper"), "got: {}", err);

        let deep_minus = format!("show({}1)", "-".repeat(5_000));
        assert!(parse(&deep_minus).unwrap_err().contains("nested deeper"));

        let deep_blocks = "if true {\n".repeat(5_000);
        assert!(parse(&deep_blocks).unwrap_err().contains("nested deeper"));
    }

    #[test]
    fn for_loops_parse_with_blocks() {
        let stmt = parse_one("for x in range(3) {\n  show(x)\n}");
        let StmtKind::For { var, body, .. } = stmt.kind else {
            panic!("expected for");
        };
        assert_eq!(var, "x");
        assert_eq!(body.len(), 1);
    }
}
