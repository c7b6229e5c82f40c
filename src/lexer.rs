use crate::diag::Diagnostics;
use crate::token::{Token, TokenKind};

/// Size of each of the two input buffers.
pub const BUFFER_SIZE: usize = 4096;

/// End-of-buffer marker. A zero byte inside the buffer proper also reads as
/// end of input, matching the classic sentinel scheme.
const SENTINEL: u8 = 0;

/// Byte length of a UTF-8 sequence from its first byte.
fn utf8_char_len(b: u8) -> usize {
    if b & 0x80 == 0 {
        1
    } else if b & 0xE0 == 0xC0 {
        2
    } else if b & 0xF0 == 0xE0 {
        3
    } else if b & 0xF8 == 0xF0 {
        4
    } else {
        1
    }
}

fn keyword_kind(word: &str) -> Option<TokenKind> {
    // Case-sensitive; an editor may fold case but the lexer does not.
    Some(match word {
        "program" => TokenKind::Program,
        "const" => TokenKind::Const,
        "var" => TokenKind::Var,
        "procedure" => TokenKind::Procedure,
        "begin" => TokenKind::Begin,
        "end" => TokenKind::End,
        "if" => TokenKind::If,
        "then" => TokenKind::Then,
        "else" => TokenKind::Else,
        "while" => TokenKind::While,
        "do" => TokenKind::Do,
        "for" => TokenKind::For,
        "to" => TokenKind::To,
        "downto" => TokenKind::Downto,
        "call" => TokenKind::Call,
        "read" => TokenKind::Read,
        "write" => TokenKind::Write,
        "odd" => TokenKind::Odd,
        "mod" => TokenKind::Mod,
        "new" => TokenKind::New,
        "delete" => TokenKind::Delete,
        _ => return None,
    })
}

/// The scanner. Input is consumed through a pair of 4 KiB buffers with a
/// sentinel byte at the end of the active one: the inner loop only compares
/// against the sentinel, and a refill happens when the scan cursor reaches
/// the physical end of a buffer. A lexeme that crosses the boundary has its
/// head saved into `partial` before the switch.
pub struct Lexer<'a> {
    source: &'a str,
    src_pos: usize,

    buffers: [[u8; BUFFER_SIZE + 1]; 2],
    current: usize,
    forward: usize,
    lexeme_begin: usize,
    partial: Vec<u8>,

    line: usize,
    column: usize,
    tok_line: usize,
    tok_column: usize,

    buffered: Option<Token>,
}

impl<'a> Lexer<'a> {
    pub fn new(source: &'a str) -> Self {
        let mut lexer = Self {
            source,
            src_pos: 0,
            buffers: [[SENTINEL; BUFFER_SIZE + 1]; 2],
            current: 1, // first load switches to buffer 0
            forward: BUFFER_SIZE,
            lexeme_begin: 0,
            partial: Vec::new(),
            line: 1,
            column: 1,
            tok_line: 1,
            tok_column: 1,
            buffered: None,
        };
        lexer.load_next_buffer();
        lexer.mark_lexeme_start();
        lexer
    }

    /// Rewind to the beginning of the source.
    pub fn reset(&mut self) {
        self.src_pos = 0;
        self.current = 1;
        self.forward = BUFFER_SIZE;
        self.lexeme_begin = 0;
        self.partial.clear();
        self.line = 1;
        self.column = 1;
        self.buffered = None;
        self.load_next_buffer();
        self.mark_lexeme_start();
    }

    // ── Double buffering ───────────────────────────────────────────

    fn load_next_buffer(&mut self) {
        // Save the head of an in-flight lexeme before switching.
        if self.lexeme_begin < self.forward && self.forward <= BUFFER_SIZE {
            let head = &self.buffers[self.current][self.lexeme_begin..self.forward];
            self.partial.extend_from_slice(head);
        }

        self.current = 1 - self.current;
        let remaining = self.source.len() - self.src_pos;
        let to_read = remaining.min(BUFFER_SIZE);
        self.buffers[self.current][..to_read]
            .copy_from_slice(&self.source.as_bytes()[self.src_pos..self.src_pos + to_read]);
        self.src_pos += to_read;
        self.buffers[self.current][to_read] = SENTINEL;

        self.forward = 0;
        self.lexeme_begin = 0;
    }

    /// Current byte without advancing; 0 at end of input.
    fn peek(&mut self) -> u8 {
        loop {
            let c = self.buffers[self.current][self.forward];
            if c != SENTINEL {
                return c;
            }
            if self.forward == BUFFER_SIZE {
                self.load_next_buffer();
                continue;
            }
            return 0;
        }
    }

    /// One byte of lookahead. When it would fall past the active buffer the
    /// byte is read straight from the pending source instead of forcing a
    /// refill.
    fn peek_next(&mut self) -> u8 {
        // Normalize so `forward` points inside the active buffer.
        let _ = self.peek();
        let idx = self.forward + 1;
        if idx >= BUFFER_SIZE {
            return self.source.as_bytes().get(self.src_pos).copied().unwrap_or(0);
        }
        self.buffers[self.current][idx]
    }

    fn advance(&mut self) -> u8 {
        let c = self.peek();
        if c == 0 {
            return 0;
        }
        self.forward += 1;

        if c == b'\n' {
            self.line += 1;
            self.column = 1;
        } else if c & 0xC0 != 0x80 {
            // Count one column per code point, not per byte.
            self.column += 1;
        }
        c
    }

    fn is_at_end(&mut self) -> bool {
        self.peek() == 0
    }

    fn mark_lexeme_start(&mut self) {
        self.lexeme_begin = self.forward;
        self.partial.clear();
        self.tok_line = self.line;
        self.tok_column = self.column;
    }

    fn lexeme(&self) -> String {
        let mut bytes = self.partial.clone();
        if self.forward > self.lexeme_begin {
            bytes.extend_from_slice(&self.buffers[self.current][self.lexeme_begin..self.forward]);
        }
        String::from_utf8_lossy(&bytes).into_owned()
    }

    // ── Whitespace and comments ────────────────────────────────────

    fn skip_whitespace(&mut self) {
        while matches!(self.peek(), b' ' | b'\t' | b'\r' | b'\n') {
            self.advance();
        }
    }

    fn skip_whitespace_and_comments(&mut self, diag: &mut Diagnostics) {
        loop {
            self.skip_whitespace();
            if self.peek() == b'/' && self.peek_next() == b'/' {
                self.skip_line_comment();
            } else if self.peek() == b'/' && self.peek_next() == b'*' {
                self.skip_block_comment(diag);
            } else if self.peek() == b'{' {
                self.skip_pascal_comment(diag);
            } else {
                break;
            }
        }
    }

    fn skip_line_comment(&mut self) {
        self.advance();
        self.advance();
        while !self.is_at_end() && self.peek() != b'\n' {
            self.advance();
        }
    }

    fn skip_block_comment(&mut self, diag: &mut Diagnostics) {
        let start_line = self.line;
        let start_col = self.column;
        self.advance();
        self.advance();

        while !self.is_at_end() {
            if self.peek() == b'*' && self.peek_next() == b'/' {
                self.advance();
                self.advance();
                return;
            }
            self.advance();
        }
        diag.error("unclosed block comment", start_line, start_col, 2);
    }

    fn skip_pascal_comment(&mut self, diag: &mut Diagnostics) {
        let start_line = self.line;
        let start_col = self.column;
        self.advance();

        while !self.is_at_end() && self.peek() != b'}' {
            self.advance();
        }
        if self.is_at_end() {
            diag.error("unclosed comment", start_line, start_col, 1);
            return;
        }
        self.advance();
    }

    fn is_valid_punct_start(c: u8) -> bool {
        matches!(
            c,
            b'+' | b'-'
                | b'*'
                | b'/'
                | b'='
                | b'<'
                | b'>'
                | b':'
                | b'('
                | b')'
                | b'['
                | b']'
                | b','
                | b';'
                | b'.'
                | b'&'
        )
    }

    // ── Token creation ─────────────────────────────────────────────

    fn make_token(&self, kind: TokenKind) -> Token {
        let lexeme = self.lexeme();
        let len = lexeme.chars().count();
        Token::new(kind, lexeme, self.tok_line, self.tok_column, len)
    }

    fn make_literal_token(&self, kind: TokenKind, literal: &str) -> Token {
        let len = literal.chars().count();
        Token::new(kind, literal.to_string(), self.tok_line, self.tok_column, len)
    }

    // ── Scanners ───────────────────────────────────────────────────

    fn scan_identifier_or_keyword(&mut self) -> Token {
        self.mark_lexeme_start();
        self.advance(); // first character verified as a letter

        while !self.is_at_end() && self.peek().is_ascii_alphanumeric() {
            self.advance();
        }

        let lexeme = self.lexeme();
        match keyword_kind(&lexeme) {
            Some(kind) => self.make_token(kind),
            None => self.make_token(TokenKind::Ident),
        }
    }

    fn scan_number(&mut self, diag: &mut Diagnostics) -> Token {
        self.mark_lexeme_start();

        while !self.is_at_end() && self.peek().is_ascii_digit() {
            self.advance();
        }

        let lexeme = self.lexeme();
        let value = match lexeme.parse::<i64>() {
            Ok(v) if v > i64::from(i32::MAX) => {
                diag.error("integer literal overflow", self.tok_line, self.tok_column, lexeme.len());
                0
            }
            Ok(v) => v,
            Err(_) => {
                diag.error("invalid integer literal", self.tok_line, self.tok_column, lexeme.len());
                0
            }
        };

        let mut tok = self.make_token(TokenKind::Number);
        tok.value = value;
        tok
    }

    fn scan_operator_or_delimiter(&mut self) -> Token {
        self.mark_lexeme_start();

        let c = self.advance();
        match c {
            b'+' => self.make_token(TokenKind::Plus),
            b'-' => self.make_token(TokenKind::Minus),
            b'*' => self.make_token(TokenKind::Star),
            b'/' => self.make_token(TokenKind::Slash),
            b'=' => self.make_token(TokenKind::Eq),
            b'<' => {
                if self.peek() == b'=' {
                    self.advance();
                    self.make_token(TokenKind::Le)
                } else if self.peek() == b'>' {
                    self.advance();
                    self.make_token(TokenKind::Ne)
                } else {
                    self.make_token(TokenKind::Lt)
                }
            }
            b'>' => {
                if self.peek() == b'=' {
                    self.advance();
                    self.make_token(TokenKind::Ge)
                } else {
                    self.make_token(TokenKind::Gt)
                }
            }
            b':' => {
                if self.peek() == b'=' {
                    self.advance();
                    self.make_token(TokenKind::Assign)
                } else {
                    self.make_token(TokenKind::Colon)
                }
            }
            b'&' => self.make_token(TokenKind::Amp),
            b'(' => self.make_token(TokenKind::LParen),
            b')' => self.make_token(TokenKind::RParen),
            b'[' => self.make_token(TokenKind::LBracket),
            b']' => self.make_token(TokenKind::RBracket),
            b',' => self.make_token(TokenKind::Comma),
            b';' => self.make_token(TokenKind::Semicolon),
            b'.' => self.make_token(TokenKind::Period),
            _ => self.make_token(TokenKind::Unknown),
        }
    }

    /// Gather a greedy run of characters that fit no token class into a
    /// single `Unknown` token and report one diagnostic for the whole run.
    /// Multi-byte UTF-8 sequences are consumed whole.
    fn scan_unknown(&mut self, diag: &mut Diagnostics) -> Token {
        self.mark_lexeme_start();

        let mut unknown = Vec::new();
        while !self.is_at_end() {
            let c = self.peek();
            if c.is_ascii_alphanumeric() || c.is_ascii_whitespace() {
                break;
            }
            if c.is_ascii_punctuation() && Self::is_valid_punct_start(c) {
                break;
            }
            let len = utf8_char_len(c);
            for _ in 0..len {
                if self.is_at_end() {
                    break;
                }
                unknown.push(self.advance());
            }
        }

        let text = String::from_utf8_lossy(&unknown).into_owned();
        let char_len = text.chars().count();
        diag.error(
            format!("illegal character sequence: '{text}'"),
            self.tok_line,
            self.tok_column,
            char_len,
        );

        self.make_literal_token(TokenKind::Unknown, &text)
    }

    // ── Public scanning interface ──────────────────────────────────

    pub fn next_token(&mut self, diag: &mut Diagnostics) -> Token {
        if let Some(tok) = self.buffered.take() {
            return tok;
        }

        self.skip_whitespace_and_comments(diag);

        if self.is_at_end() {
            self.mark_lexeme_start();
            return self.make_literal_token(TokenKind::Eof, "");
        }

        self.mark_lexeme_start();
        let c = self.peek();

        if c.is_ascii_alphabetic() {
            return self.scan_identifier_or_keyword();
        }
        if c.is_ascii_digit() {
            return self.scan_number(diag);
        }
        if Self::is_valid_punct_start(c) {
            return self.scan_operator_or_delimiter();
        }
        self.scan_unknown(diag)
    }

    /// One-token lookahead without consuming.
    pub fn peek_token(&mut self, diag: &mut Diagnostics) -> Token {
        if self.buffered.is_none() {
            let tok = self.next_token(diag);
            self.buffered = Some(tok);
        }
        self.buffered.clone().unwrap_or_default()
    }

    /// Rescan the whole source and collect every token through `Eof`.
    pub fn tokenize(&mut self, diag: &mut Diagnostics) -> Vec<Token> {
        self.reset();

        let mut tokens = Vec::new();
        loop {
            let tok = self.next_token(diag);
            let done = tok.kind == TokenKind::Eof;
            tokens.push(tok);
            if done {
                break;
            }
        }
        tokens
    }
}
