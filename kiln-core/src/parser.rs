//! Recursive-descent parser for Kiln.
//!
//! Errors never abort the unit: a failed item is skipped up to the next
//! plausible item start, and a failed statement up to the next `;` or
//! closing brace, so one pass reports as many syntax errors as it can.

use crate::ast::*;
use crate::diagnostic::Diagnostic;
use crate::lexer::{Token, TokenKind, lex};
use crate::span::{Span, UnitId};

#[derive(Debug, Clone, Copy, Default)]
pub struct ParseOptions {
    /// A line break may stand in for `;`.
    pub optional_semicolons: bool,
}

#[derive(Debug)]
pub struct ParseResult {
    pub module: Module,
    /// Lexer and parser diagnostics, in source order.
    pub diagnostics: Vec<Diagnostic>,
}

pub fn parse(unit: UnitId, source: &str, options: ParseOptions) -> ParseResult {
    let lexed = lex(unit, source);
    let mut parser = Parser {
        source,
        tokens: lexed.tokens,
        position: 0,
        diagnostics: lexed.diagnostics,
        optional_semicolons: options.optional_semicolons,
        depth: 0,
    };
    let module = parser.parse_module();
    ParseResult {
        module,
        diagnostics: parser.diagnostics,
    }
}

type ParseOutcome<T> = Result<T, Diagnostic>;

/// Deepest allowed nesting of blocks, `if` chains and expressions.
/// Later passes walk the tree recursively, so this bounds their stack use too.
pub const MAX_NESTING: usize = 512;

struct Parser<'src> {
    source: &'src str,
    tokens: Vec<Token>,
    position: usize,
    diagnostics: Vec<Diagnostic>,
    optional_semicolons: bool,
    depth: usize,
}

impl<'src> Parser<'src> {
    // -----------------------------------------------------------------
    // Items
    // -----------------------------------------------------------------

    fn parse_module(&mut self) -> Module {
        let mut items = Vec::new();
        while !self.at(TokenKind::Eof) {
            match self.parse_item() {
                Ok(item) => items.push(item),
                Err(diagnostic) => {
                    self.diagnostics.push(diagnostic);
                    self.recover_to_item();
                }
            }
        }
        Module { items }
    }

    fn parse_item(&mut self) -> ParseOutcome<Item> {
        match self.peek().kind {
            TokenKind::Directive => self.parse_directive_item(),
            TokenKind::Ident => self.parse_binding(),
            _ => Err(self.error_here("expected a declaration or directive", "E0104")),
        }
    }

    fn parse_directive_item(&mut self) -> ParseOutcome<Item> {
        let directive = self.advance();
        let name = directive.text(self.source);
        let load_kind = match name {
            "#load" => Some(LoadKind::File),
            "#load_all" => Some(LoadKind::All),
            "#load_all_recursive" => Some(LoadKind::AllRecursive),
            _ => None,
        };

        if let Some(kind) = load_kind {
            let (target, target_span) = self.expect_string()?;
            self.expect_terminator()?;
            return Ok(Item::Load(LoadDirective {
                kind,
                target,
                span: directive.span.to(target_span),
            }));
        }

        match name {
            "#export" => {
                let (name, _) = self.expect_string()?;
                let target = self.expect_ident()?;
                self.expect_terminator()?;
                let span = directive.span.to(target.span);
                Ok(Item::Export { name, target, span })
            }
            "#extension" => {
                let (name, name_span) = self.expect_string()?;
                self.expect_terminator()?;
                Ok(Item::Extension {
                    name,
                    span: directive.span.to(name_span),
                })
            }
            other => Err(Diagnostic::error(
                format!("unknown directive `{other}`"),
                directive.span,
            )
            .with_code("E0105")),
        }
    }

    fn parse_binding(&mut self) -> ParseOutcome<Item> {
        let name = self.expect_ident()?;
        let tok = self.advance();
        match tok.kind {
            TokenKind::DoubleColon => {
                if self.at(TokenKind::LParen) && self.looks_like_signature() {
                    let sig = self.parse_signature()?;
                    if self.at_directive("#foreign") {
                        self.advance();
                        let (module, _) = self.expect_string()?;
                        let (field, _) = self.expect_string()?;
                        self.expect_terminator()?;
                        return Ok(Item::Foreign(ForeignDecl {
                            name,
                            sig,
                            module,
                            field,
                        }));
                    }
                    let body = self.parse_block()?;
                    return Ok(Item::Function(FunctionDecl { name, sig, body }));
                }
                let init = self.parse_expr()?;
                self.expect_terminator()?;
                Ok(Item::Global(GlobalDecl {
                    name,
                    ty: None,
                    init,
                    mutable: false,
                }))
            }
            TokenKind::ColonEqual => {
                let init = self.parse_expr()?;
                self.expect_terminator()?;
                Ok(Item::Global(GlobalDecl {
                    name,
                    ty: None,
                    init,
                    mutable: true,
                }))
            }
            TokenKind::Colon => {
                let ty = self.parse_type()?;
                self.expect(TokenKind::Equal, "`=`")?;
                let init = self.parse_expr()?;
                self.expect_terminator()?;
                Ok(Item::Global(GlobalDecl {
                    name,
                    ty: Some(ty),
                    init,
                    mutable: true,
                }))
            }
            _ => Err(Diagnostic::error(
                format!("expected `::`, `:=` or `:` after `{}`", name.name),
                tok.span,
            )
            .with_code("E0101")),
        }
    }

    /// `(` followed by `)` or by `name :` starts a parameter list rather
    /// than a parenthesized expression.
    fn looks_like_signature(&self) -> bool {
        match self.peek_at(1).kind {
            TokenKind::RParen => true,
            TokenKind::Ident => self.peek_at(2).kind == TokenKind::Colon,
            _ => false,
        }
    }

    fn parse_signature(&mut self) -> ParseOutcome<Signature> {
        self.expect(TokenKind::LParen, "`(`")?;
        let mut params = Vec::new();
        while !self.at(TokenKind::RParen) {
            let name = self.expect_ident()?;
            self.expect(TokenKind::Colon, "`:`")?;
            let ty = self.parse_type()?;
            params.push(Param { name, ty });
            if !self.eat(TokenKind::Comma) {
                break;
            }
        }
        self.expect(TokenKind::RParen, "`)`")?;

        let result = if self.eat(TokenKind::Arrow) {
            Some(self.parse_type()?)
        } else {
            None
        };
        Ok(Signature { params, result })
    }

    fn parse_type(&mut self) -> ParseOutcome<TypeExpr> {
        let ident = self.expect_ident()?;
        Ok(TypeExpr {
            name: ident.name,
            span: ident.span,
        })
    }

    // -----------------------------------------------------------------
    // Statements
    // -----------------------------------------------------------------

    fn parse_block(&mut self) -> ParseOutcome<Block> {
        self.nested(Self::parse_block_body)
    }

    fn parse_block_body(&mut self) -> ParseOutcome<Block> {
        let open = self.expect(TokenKind::LBrace, "`{`")?;
        let mut stmts = Vec::new();
        loop {
            if self.at(TokenKind::RBrace) {
                let close = self.advance();
                return Ok(Block {
                    stmts,
                    span: open.span.to(close.span),
                });
            }
            if self.at(TokenKind::Eof) {
                return Err(Diagnostic::error("expected `}` to close this block", open.span)
                    .with_code("E0101"));
            }
            match self.parse_stmt() {
                Ok(stmt) => stmts.push(stmt),
                Err(diagnostic) => {
                    self.diagnostics.push(diagnostic);
                    self.recover_in_block();
                }
            }
        }
    }

    fn parse_stmt(&mut self) -> ParseOutcome<Stmt> {
        let start = self.peek().span;
        match self.peek().kind {
            TokenKind::Return => {
                self.advance();
                let value = if self.at_terminator() {
                    None
                } else {
                    Some(self.parse_expr()?)
                };
                let end = self.previous_span();
                self.expect_terminator()?;
                Ok(Stmt {
                    kind: StmtKind::Return(value),
                    span: start.to(end),
                })
            }
            TokenKind::Break | TokenKind::Continue => {
                let tok = self.advance();
                self.expect_terminator()?;
                let kind = if tok.kind == TokenKind::Break {
                    StmtKind::Break
                } else {
                    StmtKind::Continue
                };
                Ok(Stmt {
                    kind,
                    span: tok.span,
                })
            }
            TokenKind::If => self.parse_if(),
            TokenKind::While => {
                self.advance();
                let cond = self.parse_expr()?;
                let body = self.parse_block()?;
                let span = start.to(body.span);
                Ok(Stmt {
                    kind: StmtKind::While { cond, body },
                    span,
                })
            }
            TokenKind::LBrace => {
                let block = self.parse_block()?;
                let span = block.span;
                Ok(Stmt {
                    kind: StmtKind::Block(block),
                    span,
                })
            }
            TokenKind::Ident => match self.peek_at(1).kind {
                TokenKind::ColonEqual => {
                    let name = self.expect_ident()?;
                    self.advance();
                    let init = self.parse_expr()?;
                    let span = start.to(init.span);
                    self.expect_terminator()?;
                    Ok(Stmt {
                        kind: StmtKind::Local {
                            name,
                            ty: None,
                            init: Some(init),
                        },
                        span,
                    })
                }
                TokenKind::Colon => {
                    let name = self.expect_ident()?;
                    self.advance();
                    let ty = self.parse_type()?;
                    let init = if self.eat(TokenKind::Equal) {
                        Some(self.parse_expr()?)
                    } else {
                        None
                    };
                    let span = start.to(self.previous_span());
                    self.expect_terminator()?;
                    Ok(Stmt {
                        kind: StmtKind::Local {
                            name,
                            ty: Some(ty),
                            init,
                        },
                        span,
                    })
                }
                kind if assign_op(kind).is_some() => {
                    let target = self.expect_ident()?;
                    let op = assign_op(self.advance().kind).flatten();
                    let value = self.parse_expr()?;
                    let span = start.to(value.span);
                    self.expect_terminator()?;
                    Ok(Stmt {
                        kind: StmtKind::Assign { target, op, value },
                        span,
                    })
                }
                _ => self.parse_expr_stmt(),
            },
            _ => self.parse_expr_stmt(),
        }
    }

    fn parse_expr_stmt(&mut self) -> ParseOutcome<Stmt> {
        let expr = self.parse_expr()?;
        let span = expr.span;
        self.expect_terminator()?;
        Ok(Stmt {
            kind: StmtKind::Expr(expr),
            span,
        })
    }

    fn parse_if(&mut self) -> ParseOutcome<Stmt> {
        self.nested(Self::parse_if_body)
    }

    fn parse_if_body(&mut self) -> ParseOutcome<Stmt> {
        let start = self.expect(TokenKind::If, "`if`")?.span;
        let cond = self.parse_expr()?;
        let then_block = self.parse_block()?;
        let mut span = start.to(then_block.span);

        let else_branch = if self.eat(TokenKind::Else) {
            let branch = if self.at(TokenKind::If) {
                self.parse_if()?
            } else {
                let block = self.parse_block()?;
                let span = block.span;
                Stmt {
                    kind: StmtKind::Block(block),
                    span,
                }
            };
            span = span.to(branch.span);
            Some(Box::new(branch))
        } else {
            None
        };

        Ok(Stmt {
            kind: StmtKind::If {
                cond,
                then_block,
                else_branch,
            },
            span,
        })
    }

    // -----------------------------------------------------------------
    // Expressions
    // -----------------------------------------------------------------

    fn parse_expr(&mut self) -> ParseOutcome<Expr> {
        self.parse_binary(0)
    }

    fn parse_binary(&mut self, min_prec: u8) -> ParseOutcome<Expr> {
        let outer = self.depth;
        let result = self.parse_binary_chain(min_prec);
        self.depth = outer;
        result
    }

    /// Each folded operator deepens the tree by one level.
    fn parse_binary_chain(&mut self, min_prec: u8) -> ParseOutcome<Expr> {
        let mut lhs = self.parse_unary()?;
        loop {
            let tok = self.peek();
            if self.optional_semicolons && tok.newline_before {
                break;
            }
            let Some((op, prec)) = binary_op(tok.kind) else {
                break;
            };
            if prec < min_prec {
                break;
            }
            self.advance();
            self.enter()?;
            let rhs = self.parse_binary(prec + 1)?;
            let span = lhs.span.to(rhs.span);
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

    fn parse_unary(&mut self) -> ParseOutcome<Expr> {
        self.nested(Self::parse_prefixed)
    }

    fn parse_prefixed(&mut self) -> ParseOutcome<Expr> {
        let op = match self.peek().kind {
            TokenKind::Minus => Some(UnaryOp::Neg),
            TokenKind::Bang => Some(UnaryOp::Not),
            TokenKind::Tilde => Some(UnaryOp::BitNot),
            _ => None,
        };
        if let Some(op) = op {
            let tok = self.advance();
            let operand = self.parse_unary()?;
            let span = tok.span.to(operand.span);
            return Ok(Expr {
                kind: ExprKind::Unary {
                    op,
                    operand: Box::new(operand),
                },
                span,
            });
        }

        if self.at(TokenKind::Cast) {
            let tok = self.advance();
            self.expect(TokenKind::LParen, "`(`")?;
            let ty = self.parse_type()?;
            self.expect(TokenKind::RParen, "`)`")?;
            let operand = self.parse_unary()?;
            let span = tok.span.to(operand.span);
            return Ok(Expr {
                kind: ExprKind::Cast {
                    ty,
                    operand: Box::new(operand),
                },
                span,
            });
        }

        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> ParseOutcome<Expr> {
        let primary = self.parse_primary()?;
        let ExprKind::Name(callee) = &primary.kind else {
            return Ok(primary);
        };
        let open = self.peek();
        if open.kind != TokenKind::LParen || (self.optional_semicolons && open.newline_before) {
            return Ok(primary);
        }

        let callee = callee.clone();
        self.advance();
        let mut args = Vec::new();
        while !self.at(TokenKind::RParen) {
            args.push(self.parse_expr()?);
            if !self.eat(TokenKind::Comma) {
                break;
            }
        }
        let close = self.expect(TokenKind::RParen, "`)`")?;
        Ok(Expr {
            span: primary.span.to(close.span),
            kind: ExprKind::Call { callee, args },
        })
    }

    fn parse_primary(&mut self) -> ParseOutcome<Expr> {
        let tok = self.peek().clone();
        let text = tok.text(self.source);
        let kind = match tok.kind {
            TokenKind::IntLiteral => {
                let digits: String = text.chars().filter(|c| *c != '_').collect();
                let value = digits.parse::<u64>().map_err(|_| {
                    Diagnostic::error("integer literal is too large", tok.span).with_code("E0103")
                })?;
                ExprKind::Int(value)
            }
            TokenKind::FloatLiteral => {
                let digits: String = text.chars().filter(|c| *c != '_').collect();
                let value = digits.parse::<f64>().map_err(|_| {
                    Diagnostic::error("malformed float literal", tok.span).with_code("E0103")
                })?;
                ExprKind::Float(value)
            }
            TokenKind::BoolLiteral => ExprKind::Bool(text == "true"),
            TokenKind::Ident => ExprKind::Name(Ident {
                name: text.to_string(),
                span: tok.span,
            }),
            TokenKind::LParen => {
                self.advance();
                let inner = self.parse_expr()?;
                let close = self.expect(TokenKind::RParen, "`)`")?;
                return Ok(Expr {
                    kind: inner.kind,
                    span: tok.span.to(close.span),
                });
            }
            TokenKind::Directive if text == "#file_contents" => {
                self.advance();
                let (path, path_span) = self.expect_string()?;
                return Ok(Expr {
                    kind: ExprKind::FileContents(path),
                    span: tok.span.to(path_span),
                });
            }
            _ => return Err(self.error_here("expected an expression", "E0102")),
        };
        self.advance();
        Ok(Expr {
            kind,
            span: tok.span,
        })
    }

    // -----------------------------------------------------------------
    // Nesting
    // -----------------------------------------------------------------

    fn enter(&mut self) -> ParseOutcome<()> {
        if self.depth >= MAX_NESTING {
            return Err(self.error_here("nesting is too deep", "E0107"));
        }
        self.depth += 1;
        Ok(())
    }

    fn nested<T>(&mut self, parse: impl FnOnce(&mut Self) -> ParseOutcome<T>) -> ParseOutcome<T> {
        let outer = self.depth;
        self.enter()?;
        let result = parse(self);
        self.depth = outer;
        result
    }

    // -----------------------------------------------------------------
    // Token helpers
    // -----------------------------------------------------------------

    fn peek(&self) -> &Token {
        self.peek_at(0)
    }

    fn peek_at(&self, offset: usize) -> &Token {
        let last = self.tokens.len() - 1;
        &self.tokens[(self.position + offset).min(last)]
    }

    fn at(&self, kind: TokenKind) -> bool {
        self.peek().kind == kind
    }

    fn at_directive(&self, name: &str) -> bool {
        self.at(TokenKind::Directive) && self.peek().text(self.source) == name
    }

    fn advance(&mut self) -> Token {
        let tok = self.peek().clone();
        if tok.kind != TokenKind::Eof {
            self.position += 1;
        }
        tok
    }

    fn eat(&mut self, kind: TokenKind) -> bool {
        if self.at(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn previous_span(&self) -> Span {
        if self.position == 0 {
            return self.peek().span;
        }
        self.tokens[self.position - 1].span
    }

    fn expect(&mut self, kind: TokenKind, what: &str) -> ParseOutcome<Token> {
        if self.at(kind) {
            return Ok(self.advance());
        }
        Err(self.error_here(&format!("expected {what}"), "E0101"))
    }

    fn expect_ident(&mut self) -> ParseOutcome<Ident> {
        let tok = self.expect(TokenKind::Ident, "an identifier")?;
        Ok(Ident {
            name: tok.text(self.source).to_string(),
            span: tok.span,
        })
    }

    fn expect_string(&mut self) -> ParseOutcome<(String, Span)> {
        let tok = self.expect(TokenKind::StringLiteral, "a string literal")?;
        Ok((unescape(tok.text(self.source)), tok.span))
    }

    fn at_terminator(&self) -> bool {
        let tok = self.peek();
        match tok.kind {
            TokenKind::Semi | TokenKind::RBrace | TokenKind::Eof => true,
            _ => self.optional_semicolons && tok.newline_before,
        }
    }

    fn expect_terminator(&mut self) -> ParseOutcome<()> {
        if self.eat(TokenKind::Semi) {
            return Ok(());
        }
        if self.optional_semicolons && self.at_terminator() {
            return Ok(());
        }
        let end = self.previous_span();
        let span = Span::new(end.unit, end.end, end.end);
        Err(Diagnostic::error("expected `;`", span).with_code("E0106"))
    }

    fn error_here(&self, message: &str, code: &'static str) -> Diagnostic {
        let tok = self.peek();
        let found = match tok.kind {
            TokenKind::Eof => "end of input".to_string(),
            _ => format!("`{}`", &self.source[tok.span.start as usize..tok.span.end as usize]),
        };
        Diagnostic::error(format!("{message}, found {found}"), tok.span).with_code(code)
    }

    /// Skip to the next token that can begin a top-level item.
    fn recover_to_item(&mut self) {
        let mut depth = 0usize;
        self.advance();
        loop {
            let tok = self.peek();
            match tok.kind {
                TokenKind::Eof => return,
                TokenKind::LBrace => depth += 1,
                TokenKind::RBrace => depth = depth.saturating_sub(1),
                TokenKind::Directive if depth == 0 && tok.newline_before => return,
                TokenKind::Ident if depth == 0 && tok.newline_before => {
                    if matches!(
                        self.peek_at(1).kind,
                        TokenKind::DoubleColon | TokenKind::ColonEqual | TokenKind::Colon
                    ) {
                        return;
                    }
                }
                _ => {}
            }
            self.advance();
        }
    }

    /// Skip past the next `;`, or up to the `}` closing the current block.
    fn recover_in_block(&mut self) {
        let mut depth = 0usize;
        loop {
            match self.peek().kind {
                TokenKind::Eof => return,
                TokenKind::Semi if depth == 0 => {
                    self.advance();
                    return;
                }
                TokenKind::RBrace if depth == 0 => return,
                TokenKind::RBrace => depth -= 1,
                TokenKind::LBrace => depth += 1,
                _ => {}
            }
            self.advance();
        }
    }
}

/// Maps an assignment token to its compound operator.
/// `Some(None)` is plain `=`.
fn assign_op(kind: TokenKind) -> Option<Option<BinaryOp>> {
    match kind {
        TokenKind::Equal => Some(None),
        TokenKind::PlusEqual => Some(Some(BinaryOp::Add)),
        TokenKind::MinusEqual => Some(Some(BinaryOp::Sub)),
        TokenKind::StarEqual => Some(Some(BinaryOp::Mul)),
        TokenKind::SlashEqual => Some(Some(BinaryOp::Div)),
        _ => None,
    }
}

fn binary_op(kind: TokenKind) -> Option<(BinaryOp, u8)> {
    let entry = match kind {
        TokenKind::PipePipe => (BinaryOp::Or, 1),
        TokenKind::AmpAmp => (BinaryOp::And, 2),
        TokenKind::EqualEqual => (BinaryOp::Eq, 3),
        TokenKind::BangEqual => (BinaryOp::Ne, 3),
        TokenKind::Less => (BinaryOp::Lt, 4),
        TokenKind::LessEqual => (BinaryOp::Le, 4),
        TokenKind::Greater => (BinaryOp::Gt, 4),
        TokenKind::GreaterEqual => (BinaryOp::Ge, 4),
        TokenKind::Pipe => (BinaryOp::BitOr, 5),
        TokenKind::Caret => (BinaryOp::BitXor, 6),
        TokenKind::Amp => (BinaryOp::BitAnd, 7),
        TokenKind::Shl => (BinaryOp::Shl, 8),
        TokenKind::Shr => (BinaryOp::Shr, 8),
        TokenKind::Plus => (BinaryOp::Add, 9),
        TokenKind::Minus => (BinaryOp::Sub, 9),
        TokenKind::Star => (BinaryOp::Mul, 10),
        TokenKind::Slash => (BinaryOp::Div, 10),
        TokenKind::Percent => (BinaryOp::Rem, 10),
        _ => return None,
    };
    Some(entry)
}

fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('0') => out.push('\0'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}
