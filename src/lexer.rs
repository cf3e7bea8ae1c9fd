use thiserror::Error;

use crate::token::{Token, TokenKind};

#[derive(Debug, Clone, Error)]
#[error("tokenize error at line {line}: {message}")]
pub struct LexerError {
    pub message: String,
    pub line: usize,
}

impl LexerError {
    fn new(message: impl Into<String>, line: usize) -> Self {
        LexerError {
            message: message.into(),
            line,
        }
    }
}

/// On-demand tokenizer with exactly one token of lookahead.
///
/// `peek` returns the next token without consuming it, `next` consumes it.
/// Line numbers start at 1. Indentation is measured whenever a newline is
/// read: the count of leading spaces/tabs of the following line sticks to
/// every token until the next newline.
pub struct Lexer {
    code: Vec<char>,
    pos: usize,
    line: usize,
    indent: usize,
    lookahead: Option<Token>,
}

impl Lexer {
    pub fn new(code: &str) -> Self {
        Lexer {
            code: code.chars().collect(),
            pos: 0,
            line: 1,
            indent: 0,
            lookahead: None,
        }
    }

    pub fn peek(&mut self) -> Result<&Token, LexerError> {
        let token = match self.lookahead.take() {
            Some(token) => token,
            None => self.read_token()?,
        };
        Ok(self.lookahead.insert(token))
    }

    pub fn next(&mut self) -> Result<Token, LexerError> {
        match self.lookahead.take() {
            Some(token) => Ok(token),
            None => self.read_token(),
        }
    }

    fn current(&self) -> Option<char> {
        self.code.get(self.pos).copied()
    }

    /// Consume a trailing character of a two-character operator if it matches.
    fn accept(&mut self, follow: char) -> bool {
        if self.current() == Some(follow) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn read_token(&mut self) -> Result<Token, LexerError> {
        while matches!(self.current(), Some(' ') | Some('\t')) {
            self.pos += 1;
        }
        let line = self.line;
        let indent = self.indent;

        // A synthetic end-of-line is produced once when the input runs out, so
        // the compiler only ever sees statements terminated by end-of-line and
        // end-of-file arriving at a statement boundary.
        if self.pos == self.code.len() {
            self.pos += 1;
            return Ok(Token::simple(TokenKind::EndOfLine, line, indent));
        }
        if self.pos > self.code.len() {
            return Ok(Token::simple(TokenKind::EndOfFile, line, indent));
        }

        let c = self.code[self.pos];
        self.pos += 1;

        if c.is_ascii_alphabetic() || c == '_' {
            let mut text = String::new();
            text.push(c.to_ascii_lowercase());
            while let Some(c) = self.current() {
                if c.is_ascii_alphanumeric() || c == '_' {
                    text.push(c.to_ascii_lowercase());
                    self.pos += 1;
                } else {
                    break;
                }
            }
            return Ok(Token::new(TokenKind::Name, text, line, indent));
        }

        if c == '\n' {
            self.line += 1;
            self.indent = 0;
            while matches!(
                self.code.get(self.pos + self.indent),
                Some(' ') | Some('\t')
            ) {
                self.indent += 1;
            }
            return Ok(Token::simple(TokenKind::EndOfLine, line, indent));
        }

        if c.is_ascii_digit() {
            let mut text = String::new();
            text.push(c);
            while let Some(c) = self.current() {
                if c.is_ascii_digit() || c == '.' {
                    text.push(c);
                    self.pos += 1;
                } else {
                    break;
                }
            }
            return Ok(Token::new(TokenKind::Number, text, line, indent));
        }

        if c == '"' {
            return self.read_string(line, indent);
        }

        let kind = match c {
            '(' => TokenKind::LeftParen,
            ')' => TokenKind::RightParen,
            '[' => TokenKind::LeftBracket,
            ']' => TokenKind::RightBracket,
            '{' => TokenKind::LeftBrace,
            '}' => TokenKind::RightBrace,
            ':' => TokenKind::Colon,
            ',' => TokenKind::Comma,
            ';' => TokenKind::Semicolon,
            '.' => TokenKind::Dot,
            '@' => TokenKind::At,
            '+' => {
                if self.accept('=') {
                    TokenKind::PlusAssign
                } else {
                    TokenKind::Plus
                }
            }
            '-' => {
                if self.accept('=') {
                    TokenKind::MinusAssign
                } else {
                    TokenKind::Minus
                }
            }
            '*' => {
                if self.accept('=') {
                    TokenKind::StarAssign
                } else {
                    TokenKind::Star
                }
            }
            '%' => {
                if self.accept('=') {
                    TokenKind::PercentAssign
                } else {
                    TokenKind::Percent
                }
            }
            '/' => {
                if self.accept('=') {
                    TokenKind::SlashAssign
                } else if self.accept('/') {
                    self.skip_comment();
                    return self.read_token();
                } else {
                    TokenKind::Slash
                }
            }
            '#' => {
                self.skip_comment();
                return self.read_token();
            }
            '&' => {
                if self.accept('=') {
                    TokenKind::AmpersandAssign
                } else if self.accept('&') {
                    TokenKind::LogicalAnd
                } else {
                    TokenKind::Ampersand
                }
            }
            '|' => {
                if self.accept('=') {
                    TokenKind::PipeAssign
                } else if self.accept('|') {
                    TokenKind::LogicalOr
                } else {
                    TokenKind::Pipe
                }
            }
            '!' => {
                if self.accept('=') {
                    TokenKind::NotEqual
                } else {
                    TokenKind::Bang
                }
            }
            '=' => {
                if self.accept('=') {
                    TokenKind::EqualEqual
                } else {
                    TokenKind::Assign
                }
            }
            '^' => {
                if self.accept('=') {
                    TokenKind::CaretAssign
                } else {
                    TokenKind::Caret
                }
            }
            '<' => {
                if self.accept('=') {
                    TokenKind::LessEqual
                } else if self.accept('<') {
                    if self.accept('=') {
                        TokenKind::ShiftLeftAssign
                    } else {
                        TokenKind::ShiftLeft
                    }
                } else {
                    TokenKind::Less
                }
            }
            '>' => {
                if self.accept('=') {
                    TokenKind::GreaterEqual
                } else if self.accept('>') {
                    if self.accept('=') {
                        TokenKind::ShiftRightAssign
                    } else {
                        TokenKind::ShiftRight
                    }
                } else {
                    TokenKind::Greater
                }
            }
            other => {
                return Err(LexerError::new(
                    format!("unknown token '{}'", other),
                    line,
                ));
            }
        };
        Ok(Token::simple(kind, line, indent))
    }

    /// A string literal runs to the next unescaped quote. A backslash passes
    /// itself and the following character through uninterpreted; escape
    /// decoding is not the tokenizer's concern.
    fn read_string(&mut self, line: usize, indent: usize) -> Result<Token, LexerError> {
        let mut text = String::new();
        loop {
            match self.current() {
                None => {
                    return Err(LexerError::new("unterminated string constant", line));
                }
                Some('"') => {
                    self.pos += 1;
                    return Ok(Token::new(TokenKind::Str, text, line, indent));
                }
                Some('\n') => {
                    return Err(LexerError::new("unterminated string constant", line));
                }
                Some('\\') => {
                    text.push('\\');
                    self.pos += 1;
                    match self.current() {
                        None | Some('\n') => {
                            return Err(LexerError::new("unterminated string constant", line));
                        }
                        Some(c) => {
                            text.push(c);
                            self.pos += 1;
                        }
                    }
                }
                Some(c) => {
                    text.push(c);
                    self.pos += 1;
                }
            }
        }
    }

    fn skip_comment(&mut self) {
        while let Some(c) = self.current() {
            if c == '\n' {
                break;
            }
            self.pos += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn all_tokens(source: &str) -> Vec<Token> {
        let mut lexer = Lexer::new(source);
        let mut tokens = Vec::new();
        loop {
            let token = lexer.next().unwrap();
            let done = token.kind == TokenKind::EndOfFile;
            tokens.push(token);
            if done {
                break;
            }
        }
        tokens
    }

    fn kinds(source: &str) -> Vec<TokenKind> {
        all_tokens(source).into_iter().map(|t| t.kind).collect()
    }

    // --------------------
    // Basics
    // --------------------

    #[test]
    fn test_names_numbers_strings() {
        let tokens = all_tokens("foo 12 3.5 \"bar\"");
        assert_eq!(tokens[0].kind, TokenKind::Name);
        assert_eq!(tokens[0].text, "foo");
        assert_eq!(tokens[1].kind, TokenKind::Number);
        assert_eq!(tokens[1].text, "12");
        assert_eq!(tokens[2].kind, TokenKind::Number);
        assert_eq!(tokens[2].text, "3.5");
        assert_eq!(tokens[3].kind, TokenKind::Str);
        assert_eq!(tokens[3].text, "bar");
    }

    #[test]
    fn test_names_are_case_folded() {
        let tokens = all_tokens("Foo BAR_9");
        assert_eq!(tokens[0].text, "foo");
        assert_eq!(tokens[1].text, "bar_9");
    }

    #[test]
    fn test_peek_does_not_consume() {
        let mut lexer = Lexer::new("a b");
        assert_eq!(lexer.peek().unwrap().text, "a");
        assert_eq!(lexer.peek().unwrap().text, "a");
        assert_eq!(lexer.next().unwrap().text, "a");
        assert_eq!(lexer.next().unwrap().text, "b");
    }

    #[test]
    fn test_synthetic_eol_before_eof() {
        assert_eq!(
            kinds("1"),
            vec![TokenKind::Number, TokenKind::EndOfLine, TokenKind::EndOfFile]
        );
        // An empty input still ends in EOL then EOF.
        assert_eq!(kinds(""), vec![TokenKind::EndOfLine, TokenKind::EndOfFile]);
    }

    #[test]
    fn test_line_numbers() {
        let tokens = all_tokens("a\nb\nc");
        assert_eq!(tokens[0].line, 1); // a
        assert_eq!(tokens[1].line, 1); // EOL
        assert_eq!(tokens[2].line, 2); // b
        assert_eq!(tokens[4].line, 3); // c
    }

    // --------------------
    // Indentation
    // --------------------

    #[test]
    fn test_indent_attaches_to_next_line() {
        let tokens = all_tokens("a\n  b\n\tc");
        assert_eq!(tokens[0].indent, 0); // a
        assert_eq!(tokens[2].indent, 2); // b
        assert_eq!(tokens[4].indent, 1); // c, one tab counts 1
    }

    #[test]
    fn test_first_line_indent_is_zero() {
        // Indentation is only measured after a newline; a leading indent on
        // the very first line is invisible.
        let tokens = all_tokens("   a");
        assert_eq!(tokens[0].indent, 0);
    }

    #[test]
    fn test_indent_persists_within_line() {
        let tokens = all_tokens("x\n  a b");
        assert_eq!(tokens[2].indent, 2); // a
        assert_eq!(tokens[3].indent, 2); // b
    }

    // --------------------
    // Operators
    // --------------------

    #[test]
    fn test_two_char_operators_are_greedy() {
        assert_eq!(
            kinds("== != <= >= && || << >>"),
            vec![
                TokenKind::EqualEqual,
                TokenKind::NotEqual,
                TokenKind::LessEqual,
                TokenKind::GreaterEqual,
                TokenKind::LogicalAnd,
                TokenKind::LogicalOr,
                TokenKind::ShiftLeft,
                TokenKind::ShiftRight,
                TokenKind::EndOfLine,
                TokenKind::EndOfFile,
            ]
        );
    }

    #[test]
    fn test_compound_assignment_operators() {
        assert_eq!(
            kinds("+= -= *= /= %= &= |= ^= <<= >>="),
            vec![
                TokenKind::PlusAssign,
                TokenKind::MinusAssign,
                TokenKind::StarAssign,
                TokenKind::SlashAssign,
                TokenKind::PercentAssign,
                TokenKind::AmpersandAssign,
                TokenKind::PipeAssign,
                TokenKind::CaretAssign,
                TokenKind::ShiftLeftAssign,
                TokenKind::ShiftRightAssign,
                TokenKind::EndOfLine,
                TokenKind::EndOfFile,
            ]
        );
    }

    #[test]
    fn test_single_char_operators() {
        assert_eq!(
            kinds("( ) [ ] { } : , ; . @ ! ^ = < >"),
            vec![
                TokenKind::LeftParen,
                TokenKind::RightParen,
                TokenKind::LeftBracket,
                TokenKind::RightBracket,
                TokenKind::LeftBrace,
                TokenKind::RightBrace,
                TokenKind::Colon,
                TokenKind::Comma,
                TokenKind::Semicolon,
                TokenKind::Dot,
                TokenKind::At,
                TokenKind::Bang,
                TokenKind::Caret,
                TokenKind::Assign,
                TokenKind::Less,
                TokenKind::Greater,
                TokenKind::EndOfLine,
                TokenKind::EndOfFile,
            ]
        );
    }

    // --------------------
    // Comments
    // --------------------

    #[test]
    fn test_comments_resolve_to_next_token() {
        assert_eq!(
            kinds("1 // comment\n2"),
            vec![
                TokenKind::Number,
                TokenKind::EndOfLine,
                TokenKind::Number,
                TokenKind::EndOfLine,
                TokenKind::EndOfFile,
            ]
        );
        assert_eq!(
            kinds("# whole line\nx"),
            vec![
                TokenKind::EndOfLine,
                TokenKind::Name,
                TokenKind::EndOfLine,
                TokenKind::EndOfFile,
            ]
        );
    }

    // --------------------
    // Strings
    // --------------------

    #[test]
    fn test_backslash_passes_through() {
        let tokens = all_tokens(r#""a\"b\\c""#);
        assert_eq!(tokens[0].text, "a\\\"b\\\\c");
    }

    #[test]
    fn test_unterminated_string_at_eof() {
        let mut lexer = Lexer::new("\"abc");
        let err = lexer.next().unwrap_err();
        assert!(err.message.contains("unterminated string"));
        assert_eq!(err.line, 1);
    }

    #[test]
    fn test_unterminated_string_at_newline() {
        let mut lexer = Lexer::new("x\n\"abc\ndef\"");
        lexer.next().unwrap(); // x
        lexer.next().unwrap(); // EOL
        let err = lexer.next().unwrap_err();
        assert!(err.message.contains("unterminated string"));
        assert_eq!(err.line, 2);
    }

    #[test]
    fn test_unknown_character() {
        let mut lexer = Lexer::new("a\n$");
        lexer.next().unwrap();
        lexer.next().unwrap();
        let err = lexer.next().unwrap_err();
        assert!(err.message.contains("unknown token"));
        assert_eq!(err.line, 2);
    }

    // --------------------
    // Properties
    // --------------------

    proptest! {
        #[test]
        fn lexing_terminates_without_panic(source in r"[ -~\t\n]{0,256}") {
            let mut lexer = Lexer::new(&source);
            for _ in 0..source.len() + 4 {
                match lexer.next() {
                    Ok(token) if token.kind == TokenKind::EndOfFile => break,
                    Ok(_) => {}
                    Err(_) => break,
                }
            }
        }

        #[test]
        fn lexing_is_deterministic(source in r"[a-z0-9 ().,+*\n]{0,128}") {
            let mut first = Lexer::new(&source);
            let mut second = Lexer::new(&source);
            loop {
                let a = first.next();
                let b = second.next();
                match (a, b) {
                    (Ok(a), Ok(b)) => {
                        prop_assert_eq!(&a, &b);
                        if a.kind == TokenKind::EndOfFile {
                            break;
                        }
                    }
                    (Err(_), Err(_)) => break,
                    (a, b) => prop_assert!(false, "diverged: {:?} vs {:?}", a, b),
                }
            }
        }
    }
}
