use std::iter::FusedIterator;
use thiserror::Error;
use unicode_segmentation::UnicodeSegmentation;

pub type ScanResult<A> = Result<A, ScanError>;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TokenContents<'a> {
    // One-character tokens
    LeftParen,
    RightParen,
    LeftBrace,
    RightBrace,
    LeftBracket,
    RightBracket,
    Comma,
    Dot,
    Semicolon,
    Slash,
    Percent,
    Caret,
    Pipe,
    Ampersand,
    // One- or two-character tokens
    Minus,
    MinusEqual,
    Plus,
    PlusEqual,
    Asterisk,
    AsteriskAsterisk,
    Bang,
    BangEqual,
    Equal,
    EqualEqual,
    Greater,
    GreaterEqual,
    GreaterGreater,
    Less,
    LessEqual,
    LessLess,
    // Literals
    Identifier(&'a str),
    String(&'a str),
    Number(&'a str),
    // Keywords
    And,
    Def,
    Else,
    False,
    For,
    If,
    Let,
    Null,
    Or,
    Return,
    True,
    Type,
    While,
    /// Never produced by the scanner; the parser synthesizes it once the
    /// token stream runs dry.
    Eof,
}

#[derive(Debug, PartialEq, Clone, Copy)]
pub struct Token<'a> {
    pub contents: TokenContents<'a>,
    pub lexeme: &'a str,
    pub line: usize,
}

impl<'a> Token<'a> {
    pub fn new(contents: TokenContents<'a>, lexeme: &'a str, line: usize) -> Self {
        Self {
            contents,
            lexeme,
            line,
        }
    }

    pub fn eof(line: usize) -> Self {
        Self::new(TokenContents::Eof, "", line)
    }
}

pub struct Scanner<'a> {
    source: &'a str,
}

impl<'a> Scanner<'a> {
    pub fn new(source: &'a str) -> Self {
        Self { source }
    }

    pub fn iter(&self) -> SourceIterator<'a> {
        SourceIterator::new(self.source)
    }
}

pub struct SourceIterator<'a> {
    source: &'a str,
    graphemes: Vec<(usize, &'a str)>,
    start: usize,
    current: usize,
    line: usize,
}

impl<'a> SourceIterator<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            source,
            graphemes: source.grapheme_indices(true).collect(),
            start: 0,
            current: 0,
            line: 1,
        }
    }

    /// The line the scanner has reached.
    pub fn line(&self) -> usize {
        self.line
    }

    fn is_at_end(&self) -> bool {
        self.current >= self.graphemes.len()
    }

    fn advance(&mut self) -> Option<&'a str> {
        let (_, res) = *self.graphemes.get(self.current)?;
        self.current += 1;
        Some(res)
    }

    fn peek(&self) -> Option<&'a str> {
        self.graphemes.get(self.current).map(|(_, g)| *g)
    }

    fn peek_next(&self) -> Option<&'a str> {
        self.graphemes.get(self.current + 1).map(|(_, g)| *g)
    }

    fn advance_if_matches(&mut self, c: &str) -> bool {
        if self.peek() == Some(c) {
            self.current += 1;
            true
        } else {
            false
        }
    }

    fn byte_offset(&self, grapheme: usize) -> usize {
        self.graphemes
            .get(grapheme)
            .map(|(offset, _)| *offset)
            .unwrap_or(self.source.len())
    }

    fn lexeme(&self) -> &'a str {
        &self.source[self.byte_offset(self.start)..self.byte_offset(self.current)]
    }

    fn skip_whitespace(&mut self) {
        while let Some(c) = self.peek() {
            match c {
                " " | "\t" | "\r" => {
                    self.current += 1;
                }
                "\n" | "\r\n" => {
                    self.current += 1;
                    self.line += 1;
                }
                "/" => match self.peek_next() {
                    Some("/") => {
                        while let Some(c) = self.peek() {
                            if is_newline(c) {
                                break;
                            }
                            self.current += 1;
                        }
                    }
                    Some("*") => self.block_comment(),
                    _ => break,
                },
                _ => break,
            }
        }
    }

    // Block comments do not nest; an unterminated one swallows the rest of
    // the input.
    fn block_comment(&mut self) {
        self.current += 2;
        while let Some(c) = self.peek() {
            if c == "*" && self.peek_next() == Some("/") {
                self.current += 2;
                return;
            }
            if is_newline(c) {
                self.line += 1;
            }
            self.current += 1;
        }
    }

    fn make_token(&self, contents: TokenContents<'a>) -> Token<'a> {
        Token::new(contents, self.lexeme(), self.line)
    }

    fn string(&mut self, quote: &str) -> ScanResult<Token<'a>> {
        let starting_line = self.line;
        while let Some(c) = self.peek() {
            if c == quote {
                break;
            }
            if is_newline(c) {
                self.line += 1;
            }
            self.current += 1;
        }

        if self.is_at_end() {
            return Err(ScanError::UnterminatedString(
                self.lexeme().to_string(),
                self.line,
            ));
        }

        // Closing quote
        self.current += 1;
        let lexeme = self.lexeme();
        // Both quote characters are a single byte wide.
        let contents = TokenContents::String(&lexeme[1..lexeme.len() - 1]);
        Ok(Token::new(contents, lexeme, starting_line))
    }

    fn number(&mut self) -> Token<'a> {
        while self.peek().map_or(false, is_digit) {
            self.current += 1;
        }
        if self.peek() == Some(".") && self.peek_next().map_or(false, is_digit) {
            // Consume .
            self.current += 1;
            while self.peek().map_or(false, is_digit) {
                self.current += 1;
            }
        }

        let num = self.lexeme();
        self.make_token(TokenContents::Number(num))
    }

    fn identifier(&mut self) -> Token<'a> {
        while self
            .peek()
            .map_or(false, |c| is_letter_or_underscore(c) || is_digit(c))
        {
            self.current += 1;
        }

        let identifier = self.lexeme();
        use TokenContents::*;
        self.make_token(match identifier {
            "and" => And,
            "def" => Def,
            "else" => Else,
            "false" => False,
            "for" => For,
            "if" => If,
            "let" => Let,
            "null" => Null,
            "or" => Or,
            "return" => Return,
            "true" => True,
            "type" => Type,
            "while" => While,
            identifier => Identifier(identifier),
        })
    }

    fn match_token(&mut self, c: &'a str) -> Option<ScanResult<Token<'a>>> {
        use TokenContents::*;
        let contents = match c {
            "(" => LeftParen,
            ")" => RightParen,
            "{" => LeftBrace,
            "}" => RightBrace,
            "[" => LeftBracket,
            "]" => RightBracket,
            ";" => Semicolon,
            "," => Comma,
            "." => Dot,
            "/" => Slash,
            "%" => Percent,
            "^" => Caret,
            "|" => Pipe,
            "&" => Ampersand,
            "-" => {
                if self.advance_if_matches("=") {
                    MinusEqual
                } else {
                    Minus
                }
            }
            "+" => {
                if self.advance_if_matches("=") {
                    PlusEqual
                } else {
                    Plus
                }
            }
            "*" => {
                if self.advance_if_matches("*") {
                    AsteriskAsterisk
                } else {
                    Asterisk
                }
            }
            "!" => {
                if self.advance_if_matches("=") {
                    BangEqual
                } else {
                    Bang
                }
            }
            "=" => {
                if self.advance_if_matches("=") {
                    EqualEqual
                } else {
                    Equal
                }
            }
            "<" => {
                if self.advance_if_matches("=") {
                    LessEqual
                } else if self.advance_if_matches("<") {
                    LessLess
                } else {
                    Less
                }
            }
            ">" => {
                if self.advance_if_matches("=") {
                    GreaterEqual
                } else if self.advance_if_matches(">") {
                    GreaterGreater
                } else {
                    Greater
                }
            }
            "\"" | "'" => return Some(self.string(c)),
            _ => {
                return if is_digit(c) {
                    Some(Ok(self.number()))
                } else if is_letter_or_underscore(c) {
                    Some(Ok(self.identifier()))
                } else {
                    None
                };
            }
        };
        Some(Ok(self.make_token(contents)))
    }
}

fn is_newline(c: &str) -> bool {
    matches!(c, "\n" | "\r\n")
}

fn is_digit(c: &str) -> bool {
    matches!(c.as_bytes(), [b] if b.is_ascii_digit())
}

fn is_letter_or_underscore(c: &str) -> bool {
    matches!(c.as_bytes(), [b] if b.is_ascii_alphabetic() || *b == b'_')
}

impl<'a> Iterator for SourceIterator<'a> {
    type Item = ScanResult<Token<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.skip_whitespace();
        self.start = self.current;
        let line = self.line;
        let c = self.advance()?;
        let res = self
            .match_token(c)
            .unwrap_or_else(|| Err(ScanError::UnknownToken(c.to_string(), line)));
        Some(res)
    }
}

impl<'a> FusedIterator for SourceIterator<'a> {}

#[derive(Error, Debug, PartialEq, Clone)]
pub enum ScanError {
    #[error("Unexpected character.")]
    UnknownToken(String, usize),
    #[error("Unterminated string.")]
    UnterminatedString(String, usize),
}

impl ScanError {
    pub fn line(&self) -> usize {
        match self {
            ScanError::UnknownToken(_, line) | ScanError::UnterminatedString(_, line) => *line,
        }
    }
}
