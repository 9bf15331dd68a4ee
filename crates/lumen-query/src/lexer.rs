//! A small Postgres-flavoured tokenizer.
//!
//! It only knows enough SQL to tell literal text apart from everything else:
//! string constants, quoted identifiers, comments, positional markers and
//! `${name}` placeholders. Whitespace and comments are dropped; every token
//! keeps its byte span so callers can rewrite the original text in place.

use std::ops::Range;

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TokenKind {
    /// Keyword or bare identifier.
    Word,
    QuotedIdent,
    /// Any string constant, including `E'..'` and dollar-quoted bodies.
    String,
    Number,
    /// `$1`, `$2`, ...
    Positional,
    /// `${name}`
    Placeholder,
    Semicolon,
    LParen,
    RParen,
    Dot,
    Punct,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Token<'a> {
    pub kind: TokenKind,
    pub text: &'a str,
    pub span: Range<usize>,
}

impl Token<'_> {
    pub fn is_keyword(&self, keyword: &str) -> bool {
        self.kind == TokenKind::Word && self.text.eq_ignore_ascii_case(keyword)
    }

    /// Name inside a `${name}` placeholder.
    pub fn placeholder_name(&self) -> Option<&str> {
        match self.kind {
            TokenKind::Placeholder => Some(&self.text[2..self.text.len() - 1]),
            _ => None,
        }
    }

    /// Unquoted identifier text, for both bare and double-quoted names.
    pub fn identifier(&self) -> Option<String> {
        match self.kind {
            TokenKind::Word => Some(self.text.to_ascii_lowercase()),
            TokenKind::QuotedIdent => Some(self.text[1..self.text.len() - 1].replace("\"\"", "\"")),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LexError {
    #[error("unterminated string literal starting at offset {0}")]
    UnterminatedString(usize),
    #[error("unterminated quoted identifier starting at offset {0}")]
    UnterminatedIdentifier(usize),
    #[error("unterminated block comment starting at offset {0}")]
    UnterminatedComment(usize),
    #[error("unterminated dollar-quoted string starting at offset {0}")]
    UnterminatedDollarQuote(usize),
    #[error("unterminated placeholder starting at offset {0}")]
    UnterminatedPlaceholder(usize),
    #[error("invalid placeholder `{0}`: names must match [A-Za-z_][A-Za-z0-9_]*")]
    InvalidPlaceholder(String),
}

pub(crate) fn tokenize(sql: &str) -> Result<Vec<Token<'_>>, LexError> {
    Lexer { sql, bytes: sql.as_bytes(), pos: 0 }.run()
}

pub(crate) fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first == '_' || first.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|ch| ch == '_' || ch.is_ascii_alphanumeric())
}

struct Lexer<'a> {
    sql: &'a str,
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Lexer<'a> {
    fn run(mut self) -> Result<Vec<Token<'a>>, LexError> {
        let mut tokens = Vec::new();
        while let Some(byte) = self.peek(0) {
            let start = self.pos;
            let kind = match byte {
                b if b.is_ascii_whitespace() => {
                    self.pos += 1;
                    continue;
                }
                b'-' if self.peek(1) == Some(b'-') => {
                    self.skip_line_comment();
                    continue;
                }
                b'/' if self.peek(1) == Some(b'*') => {
                    self.skip_block_comment()?;
                    continue;
                }
                b'\'' => {
                    self.pos += 1;
                    self.quoted(b'\'', false, start)?;
                    TokenKind::String
                }
                b'"' => {
                    self.pos += 1;
                    self.quoted(b'"', false, start)
                        .map_err(|_| LexError::UnterminatedIdentifier(start))?;
                    TokenKind::QuotedIdent
                }
                b'$' => self.dollar(start)?,
                b if b.is_ascii_digit() => {
                    self.number();
                    TokenKind::Number
                }
                b'.' if self.peek(1).is_some_and(|b| b.is_ascii_digit()) => {
                    self.number();
                    TokenKind::Number
                }
                b if is_word_start(b) => self.word(start)?,
                b';' => self.single(TokenKind::Semicolon),
                b'(' => self.single(TokenKind::LParen),
                b')' => self.single(TokenKind::RParen),
                b'.' => self.single(TokenKind::Dot),
                _ => {
                    // Advance by a whole character so spans stay on UTF-8 boundaries.
                    let width = self.sql[start..].chars().next().map_or(1, char::len_utf8);
                    self.pos += width;
                    TokenKind::Punct
                }
            };
            tokens.push(Token {
                kind,
                text: &self.sql[start..self.pos],
                span: start..self.pos,
            });
        }
        Ok(tokens)
    }

    fn peek(&self, ahead: usize) -> Option<u8> {
        self.bytes.get(self.pos + ahead).copied()
    }

    fn single(&mut self, kind: TokenKind) -> TokenKind {
        self.pos += 1;
        kind
    }

    fn skip_line_comment(&mut self) {
        while let Some(byte) = self.peek(0) {
            self.pos += 1;
            if byte == b'\n' {
                break;
            }
        }
    }

    fn skip_block_comment(&mut self) -> Result<(), LexError> {
        let start = self.pos;
        let mut depth = 0usize;
        while self.pos < self.bytes.len() {
            match (self.peek(0), self.peek(1)) {
                (Some(b'/'), Some(b'*')) => {
                    depth += 1;
                    self.pos += 2;
                }
                (Some(b'*'), Some(b'/')) => {
                    depth -= 1;
                    self.pos += 2;
                    if depth == 0 {
                        return Ok(());
                    }
                }
                _ => self.pos += 1,
            }
        }
        Err(LexError::UnterminatedComment(start))
    }

    /// Consumes up to and including the closing `quote`. A doubled quote is
    /// an escaped quote; with `backslash` set, `\x` escapes any byte.
    fn quoted(&mut self, quote: u8, backslash: bool, start: usize) -> Result<(), LexError> {
        while let Some(byte) = self.peek(0) {
            if backslash && byte == b'\\' {
                self.pos += 2;
                continue;
            }
            self.pos += 1;
            if byte == quote {
                if self.peek(0) == Some(quote) {
                    self.pos += 1;
                    continue;
                }
                return Ok(());
            }
        }
        Err(LexError::UnterminatedString(start))
    }

    fn dollar(&mut self, start: usize) -> Result<TokenKind, LexError> {
        match self.peek(1) {
            Some(b'{') => {
                let Some(close) = self.sql[start..].find('}') else {
                    return Err(LexError::UnterminatedPlaceholder(start));
                };
                let end = start + close + 1;
                let name = &self.sql[start + 2..end - 1];
                if !is_identifier(name) {
                    return Err(LexError::InvalidPlaceholder(self.sql[start..end].to_string()));
                }
                self.pos = end;
                Ok(TokenKind::Placeholder)
            }
            Some(b) if b.is_ascii_digit() => {
                self.pos += 1;
                while self.peek(0).is_some_and(|b| b.is_ascii_digit()) {
                    self.pos += 1;
                }
                Ok(TokenKind::Positional)
            }
            Some(b'$') => self.dollar_quoted(start, start + 2),
            Some(b) if is_word_start(b) => {
                let mut end = start + 1;
                while self.bytes.get(end).is_some_and(|b| is_word_part(*b) && *b != b'$') {
                    end += 1;
                }
                if self.bytes.get(end) == Some(&b'$') {
                    self.dollar_quoted(start, end + 1)
                } else {
                    self.pos += 1;
                    Ok(TokenKind::Punct)
                }
            }
            _ => {
                self.pos += 1;
                Ok(TokenKind::Punct)
            }
        }
    }

    /// `open_end` is the offset just past the opening `$tag$`.
    fn dollar_quoted(&mut self, start: usize, open_end: usize) -> Result<TokenKind, LexError> {
        let tag = &self.sql[start..open_end];
        match self.sql[open_end..].find(tag) {
            Some(offset) => {
                self.pos = open_end + offset + tag.len();
                Ok(TokenKind::String)
            }
            None => Err(LexError::UnterminatedDollarQuote(start)),
        }
    }

    fn number(&mut self) {
        while let Some(byte) = self.peek(0) {
            let exponent_sign = (byte == b'+' || byte == b'-')
                && matches!(self.bytes.get(self.pos.wrapping_sub(1)), Some(b'e' | b'E'));
            if byte.is_ascii_alphanumeric() || byte == b'.' || byte == b'_' || exponent_sign {
                self.pos += 1;
            } else {
                break;
            }
        }
    }

    fn word(&mut self, start: usize) -> Result<TokenKind, LexError> {
        while self.peek(0).is_some_and(is_word_part) {
            self.pos += 1;
        }
        if self.peek(0) == Some(b'\'') && self.pos - start == 1 {
            // E'..', B'..', X'..' and N'..' string prefixes.
            match self.bytes[start] {
                b'e' | b'E' => {
                    self.pos += 1;
                    self.quoted(b'\'', true, start)?;
                    return Ok(TokenKind::String);
                }
                b'b' | b'B' | b'x' | b'X' | b'n' | b'N' => {
                    self.pos += 1;
                    self.quoted(b'\'', false, start)?;
                    return Ok(TokenKind::String);
                }
                _ => {}
            }
        }
        Ok(TokenKind::Word)
    }
}

fn is_word_start(byte: u8) -> bool {
    byte == b'_' || byte.is_ascii_alphabetic() || byte >= 0x80
}

fn is_word_part(byte: u8) -> bool {
    is_word_start(byte) || byte.is_ascii_digit() || byte == b'$'
}
