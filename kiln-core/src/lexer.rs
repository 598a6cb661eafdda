//! Lexer for Kiln source units.

use crate::diagnostic::Diagnostic;
use crate::span::{Span, UnitId};

/// Kind of a token produced by the lexer.
///
/// The lexer recognizes keywords, literals and directives (`#load`,
/// `#foreign`, ...); it attaches no further meaning to identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    // Special
    Eof,

    // Identifiers and literals
    Ident,
    IntLiteral,
    FloatLiteral,
    StringLiteral,
    BoolLiteral, // true / false
    Directive,   // #name

    // Punctuation
    LParen,      // (
    RParen,      // )
    LBrace,      // {
    RBrace,      // }
    Comma,       // ,
    Semi,        // ;
    Colon,       // :
    DoubleColon, // ::
    ColonEqual,  // :=
    Arrow,       // ->

    // Operators
    Plus,         // +
    Minus,        // -
    Star,         // *
    Slash,        // /
    Percent,      // %
    Equal,        // =
    EqualEqual,   // ==
    Bang,         // !
    BangEqual,    // !=
    Less,         // <
    LessEqual,    // <=
    Greater,      // >
    GreaterEqual, // >=
    AmpAmp,       // &&
    PipePipe,     // ||
    Amp,          // &
    Pipe,         // |
    Caret,        // ^
    Tilde,        // ~
    Shl,          // <<
    Shr,          // >>
    PlusEqual,    // +=
    MinusEqual,   // -=
    StarEqual,    // *=
    SlashEqual,   // /=

    // Keywords
    If,
    Else,
    While,
    Return,
    Break,
    Continue,
    Cast,
}

/// A single token with its kind and span.
///
/// `text_start` / `text_end` are byte offsets of the token's text. For
/// string literals they exclude the quotes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
    pub text_start: u32,
    pub text_end: u32,
    /// A line break separates this token from the previous one.
    pub newline_before: bool,
}

impl Token {
    pub fn text<'src>(&self, source: &'src str) -> &'src str {
        &source[self.text_start as usize..self.text_end as usize]
    }
}

/// Result of lexing a source unit.
#[derive(Debug)]
pub struct LexResult {
    pub tokens: Vec<Token>,
    pub diagnostics: Vec<Diagnostic>,
}

/// Lex a source string into tokens. The last token is always `Eof`.
pub fn lex(unit: UnitId, source: &str) -> LexResult {
    let mut lexer = Lexer {
        unit,
        source,
        bytes: source.as_bytes(),
        index: 0,
        newline_pending: false,
        diagnostics: Vec::new(),
    };
    lexer.run()
}

struct Lexer<'src> {
    unit: UnitId,
    source: &'src str,
    bytes: &'src [u8],
    index: usize,
    newline_pending: bool,
    diagnostics: Vec<Diagnostic>,
}

impl<'src> Lexer<'src> {
    fn run(&mut self) -> LexResult {
        let mut tokens = Vec::new();

        loop {
            self.skip_trivia();
            let Some(ch) = self.peek() else { break };
            let start = self.index as u32;

            let kind = match ch {
                b'(' => self.single(TokenKind::LParen),
                b')' => self.single(TokenKind::RParen),
                b'{' => self.single(TokenKind::LBrace),
                b'}' => self.single(TokenKind::RBrace),
                b',' => self.single(TokenKind::Comma),
                b';' => self.single(TokenKind::Semi),
                b'~' => self.single(TokenKind::Tilde),
                b'^' => self.single(TokenKind::Caret),
                b'%' => self.single(TokenKind::Percent),
                b':' => self.pick(
                    &[(b':', TokenKind::DoubleColon), (b'=', TokenKind::ColonEqual)],
                    TokenKind::Colon,
                ),
                b'-' => self.pick(
                    &[(b'>', TokenKind::Arrow), (b'=', TokenKind::MinusEqual)],
                    TokenKind::Minus,
                ),
                b'+' => self.pick(&[(b'=', TokenKind::PlusEqual)], TokenKind::Plus),
                b'*' => self.pick(&[(b'=', TokenKind::StarEqual)], TokenKind::Star),
                b'/' => self.pick(&[(b'=', TokenKind::SlashEqual)], TokenKind::Slash),
                b'=' => self.pick(&[(b'=', TokenKind::EqualEqual)], TokenKind::Equal),
                b'!' => self.pick(&[(b'=', TokenKind::BangEqual)], TokenKind::Bang),
                b'<' => self.pick(
                    &[(b'=', TokenKind::LessEqual), (b'<', TokenKind::Shl)],
                    TokenKind::Less,
                ),
                b'>' => self.pick(
                    &[(b'=', TokenKind::GreaterEqual), (b'>', TokenKind::Shr)],
                    TokenKind::Greater,
                ),
                b'&' => self.pick(&[(b'&', TokenKind::AmpAmp)], TokenKind::Amp),
                b'|' => self.pick(&[(b'|', TokenKind::PipePipe)], TokenKind::Pipe),
                b'"' => {
                    if let Some(token) = self.lex_string(start) {
                        tokens.push(token);
                    }
                    continue;
                }
                b'#' => match self.lex_directive(start) {
                    Some(kind) => kind,
                    None => continue,
                },
                b'0'..=b'9' => self.lex_number(),
                _ if is_ident_start(ch) => self.lex_ident_or_keyword(start),
                _ => {
                    self.unexpected_char(start);
                    continue;
                }
            };

            tokens.push(self.token(kind, start, self.index as u32));
        }

        let end = self.source.len() as u32;
        tokens.push(Token {
            kind: TokenKind::Eof,
            span: Span::new(self.unit, end, end),
            text_start: end,
            text_end: end,
            newline_before: true,
        });

        LexResult {
            tokens,
            diagnostics: std::mem::take(&mut self.diagnostics),
        }
    }

    fn token(&mut self, kind: TokenKind, text_start: u32, text_end: u32) -> Token {
        let newline_before = std::mem::take(&mut self.newline_pending);
        Token {
            kind,
            span: Span::new(self.unit, text_start, text_end),
            text_start,
            text_end,
            newline_before,
        }
    }

    fn single(&mut self, kind: TokenKind) -> TokenKind {
        self.index += 1;
        kind
    }

    /// Consume one character, then one more if it matches one of `pairs`.
    fn pick(&mut self, pairs: &[(u8, TokenKind)], fallback: TokenKind) -> TokenKind {
        self.index += 1;
        if let Some(next) = self.peek() {
            for (expected, kind) in pairs {
                if *expected == next {
                    self.index += 1;
                    return *kind;
                }
            }
        }
        fallback
    }

    fn skip_trivia(&mut self) {
        while let Some(ch) = self.peek() {
            match ch {
                b'\n' => {
                    self.newline_pending = true;
                    self.index += 1;
                }
                b' ' | b'\t' | b'\r' => self.index += 1,
                b'/' if self.peek_next() == Some(b'/') => {
                    while let Some(ch) = self.peek() {
                        if ch == b'\n' {
                            break;
                        }
                        self.index += 1;
                    }
                }
                b'/' if self.peek_next() == Some(b'*') => self.skip_block_comment(),
                _ => break,
            }
        }
    }

    fn skip_block_comment(&mut self) {
        let start = self.index as u32;
        self.index += 2;
        while self.index < self.bytes.len() {
            if self.bytes[self.index] == b'*' && self.peek_next() == Some(b'/') {
                self.index += 2;
                return;
            }
            if self.bytes[self.index] == b'\n' {
                self.newline_pending = true;
            }
            self.index += 1;
        }
        let span = Span::new(self.unit, start, self.index as u32);
        self.diagnostics
            .push(Diagnostic::error("unterminated block comment", span).with_code("E0003"));
    }

    fn unexpected_char(&mut self, start: u32) {
        // Step over the whole character so later slicing stays on a boundary.
        let width = self.source[self.index..]
            .chars()
            .next()
            .map_or(1, char::len_utf8);
        self.index += width;
        let span = Span::new(self.unit, start, self.index as u32);
        self.diagnostics
            .push(Diagnostic::error("unexpected character", span).with_code("E0001"));
    }

    fn lex_string(&mut self, start: u32) -> Option<Token> {
        self.index += 1; // opening quote

        let content_start = self.index;
        while let Some(ch) = self.peek() {
            match ch {
                b'"' => {
                    let content_end = self.index;
                    self.index += 1; // closing quote
                    let mut token = self.token(TokenKind::StringLiteral, start, self.index as u32);
                    token.text_start = content_start as u32;
                    token.text_end = content_end as u32;
                    return Some(token);
                }
                b'\n' => break,
                b'\\' => {
                    self.index += 1;
                    if self.peek().is_some_and(|c| c != b'\n') {
                        self.index += 1;
                    }
                }
                _ => self.index += 1,
            }
        }

        let span = Span::new(self.unit, start, self.index as u32);
        self.diagnostics
            .push(Diagnostic::error("unterminated string literal", span).with_code("E0002"));
        None
    }

    fn lex_directive(&mut self, start: u32) -> Option<TokenKind> {
        self.index += 1; // '#'
        if !self.peek().is_some_and(is_ident_start) {
            let span = Span::new(self.unit, start, self.index as u32);
            self.diagnostics.push(
                Diagnostic::error("expected a directive name after `#`", span).with_code("E0004"),
            );
            return None;
        }
        while self.peek().is_some_and(is_ident_continue) {
            self.index += 1;
        }
        Some(TokenKind::Directive)
    }

    fn lex_number(&mut self) -> TokenKind {
        // integer or float: digits [ '.' digits ]?
        self.eat_digits();
        if self.peek() == Some(b'.') && self.peek_next().is_some_and(|c| c.is_ascii_digit()) {
            self.index += 1; // '.'
            self.eat_digits();
            return TokenKind::FloatLiteral;
        }
        TokenKind::IntLiteral
    }

    fn eat_digits(&mut self) {
        while self.peek().is_some_and(|c| c.is_ascii_digit() || c == b'_') {
            self.index += 1;
        }
    }

    fn lex_ident_or_keyword(&mut self, start: u32) -> TokenKind {
        while self.peek().is_some_and(is_ident_continue) {
            self.index += 1;
        }

        match &self.source[start as usize..self.index] {
            "if" => TokenKind::If,
            "else" => TokenKind::Else,
            "while" => TokenKind::While,
            "return" => TokenKind::Return,
            "break" => TokenKind::Break,
            "continue" => TokenKind::Continue,
            "cast" => TokenKind::Cast,
            "true" | "false" => TokenKind::BoolLiteral,
            _ => TokenKind::Ident,
        }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.index).copied()
    }

    fn peek_next(&self) -> Option<u8> {
        self.bytes.get(self.index + 1).copied()
    }
}

fn is_ident_start(ch: u8) -> bool {
    ch.is_ascii_alphabetic() || ch == b'_'
}

fn is_ident_continue(ch: u8) -> bool {
    is_ident_start(ch) || ch.is_ascii_digit()
}
