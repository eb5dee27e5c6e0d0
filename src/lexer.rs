use thiserror::Error;

use crate::token::{Span, Token, TokenKind, keyword_kind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LexerState {
    LineBegin,
    TokenStart,
}

enum StepOutcome<'a> {
    Emit(Token<'a>),
    Continue,
}

#[derive(Debug, Error, PartialEq)]
pub enum LexError {
    #[error("Invalid dedent to {indent_level} spaces on line {line}")]
    InvalidDedent { indent_level: usize, line: usize },
    #[error("Unexpected character '{character}' on line {line}")]
    UnexpectedCharacter { character: char, line: usize },
    #[error("Tabs are not supported for indentation on line {line}")]
    TabIndentation { line: usize },
    #[error("Invalid number literal '{literal}' on line {line}")]
    InvalidNumberLiteral { literal: String, line: usize },
    #[error("Unterminated string literal on line {line}")]
    UnterminatedString { line: usize },
    #[error("Invalid escape sequence '\\{escape}' on line {line}")]
    InvalidEscape { escape: char, line: usize },
    #[error("Lexer invariant violated: {message}")]
    InvariantViolation { message: &'static str },
}

pub type LexResult<T> = Result<T, LexError>;

pub struct Lexer<'a> {
    input: &'a str,
    pos: usize,
    line: usize,
    line_start: usize,
    indent_stack: Vec<usize>,
    pending_tokens: Vec<Token<'a>>,
    bracket_depth: usize,
    state: LexerState,
}

impl<'a> Lexer<'a> {
    pub fn new(input: &'a str) -> Self {
        Self {
            input,
            pos: 0,
            line: 0,
            line_start: 0,
            indent_stack: vec![0],
            pending_tokens: Vec::new(),
            bracket_depth: 0,
            state: LexerState::LineBegin,
        }
    }

    pub fn next_token(&mut self) -> LexResult<Token<'a>> {
        loop {
            if let Some(token) = self.pending_tokens.pop() {
                return Ok(token);
            }

            match self.step_state()? {
                StepOutcome::Emit(token) => return Ok(token),
                StepOutcome::Continue => continue,
            }
        }
    }

    fn step_state(&mut self) -> LexResult<StepOutcome<'a>> {
        match self.state {
            LexerState::LineBegin => {
                // Compute indentation delta and produce Indent/Dedent tokens as needed.
                let indent_level = self.count_indentation()?;
                let current_indent = self.current_indent()?;
                let span = self.here();

                if indent_level > current_indent {
                    self.indent_stack.push(indent_level);
                    self.state = LexerState::TokenStart;
                    return Ok(StepOutcome::Emit(Token::new(TokenKind::Indent, span)));
                }

                if indent_level < current_indent {
                    while let Some(&top) = self.indent_stack.last() {
                        if top > indent_level {
                            self.indent_stack.pop();
                            self.pending_tokens.push(Token::new(TokenKind::Dedent, span));
                        } else {
                            break;
                        }
                    }
                    if self.current_indent()? != indent_level {
                        return Err(LexError::InvalidDedent {
                            indent_level,
                            line: self.line + 1,
                        });
                    }
                    self.state = LexerState::TokenStart;
                    return Ok(StepOutcome::Continue);
                }

                self.state = LexerState::TokenStart;
                Ok(StepOutcome::Continue)
            }
            LexerState::TokenStart => {
                self.skip_whitespace();

                if self.peek_char() == Some('#') {
                    self.consume_while(|c| c != '\n');
                    return Ok(StepOutcome::Continue);
                }

                if self.peek_char().is_none() {
                    return self.handle_eof();
                }

                Ok(StepOutcome::Emit(self.read_token_from_current_position()?))
            }
        }
    }

    fn handle_eof(&mut self) -> LexResult<StepOutcome<'a>> {
        // At physical EOF, all pending Dedent tokens come before EOF.
        self.flush_eof_dedents();
        if !self.pending_tokens.is_empty() {
            return Ok(StepOutcome::Continue);
        }

        Ok(StepOutcome::Emit(Token::new(TokenKind::EOF, self.here())))
    }

    fn count_indentation(&mut self) -> LexResult<usize> {
        let indentation = self.consume_while(|c| c == ' ');
        match self.peek_char() {
            Some('\t') => {
                return Err(LexError::TabIndentation { line: self.line + 1 });
            }
            // Blank and comment-only lines do not change indentation depth.
            Some('\n') | Some('#') => {
                return self.current_indent();
            }
            _ => {}
        }
        Ok(indentation)
    }

    fn skip_whitespace(&mut self) {
        self.consume_while(|c| c == ' ' || c == '\t' || c == '\r');
    }

    fn read_token_from_current_position(&mut self) -> LexResult<Token<'a>> {
        let start = self.here();
        let ch = self.peek_char().ok_or(LexError::InvariantViolation {
            message: "read_token_from_current_position called at EOF",
        })?;

        let token = match ch {
            '\n' => {
                self.consume_char();
                let span = self.span_from(start);
                self.line += 1;
                self.line_start = self.pos;
                if self.bracket_depth > 0 {
                    // A newline inside brackets is plain whitespace.
                    return self.next_token();
                }
                self.state = LexerState::LineBegin;
                Token::new(TokenKind::Newline, span)
            }
            '"' | '\'' => self.read_string(start, ch)?,
            c if c.is_alphabetic() || c == '_' => self.read_identifier(start),
            c if c.is_ascii_digit() => self.read_number(start)?,
            _ => self.read_operator(start, ch)?,
        };

        Ok(token)
    }

    fn read_operator(&mut self, start: Span, ch: char) -> LexResult<Token<'a>> {
        let next = self.char_at(self.pos + 1);
        let next2 = self.char_at(self.pos + 2);
        let followed_by_eq = next == Some('=');

        let (kind, len) = match ch {
            '(' | '[' | '{' => {
                self.bracket_depth += 1;
                let kind = match ch {
                    '(' => TokenKind::LParen,
                    '[' => TokenKind::LBracket,
                    _ => TokenKind::LBrace,
                };
                (kind, 1)
            }
            ')' | ']' | '}' => {
                self.bracket_depth = self.bracket_depth.saturating_sub(1);
                let kind = match ch {
                    ')' => TokenKind::RParen,
                    ']' => TokenKind::RBracket,
                    _ => TokenKind::RBrace,
                };
                (kind, 1)
            }
            ':' => (TokenKind::Colon, 1),
            ',' => (TokenKind::Comma, 1),
            '.' => (TokenKind::Dot, 1),
            '~' => (TokenKind::Tilde, 1),
            '=' if followed_by_eq => (TokenKind::EqEq, 2),
            '=' => (TokenKind::Equal, 1),
            '!' if followed_by_eq => (TokenKind::NotEq, 2),
            '+' if followed_by_eq => (TokenKind::PlusEq, 2),
            '+' => (TokenKind::Plus, 1),
            '-' if followed_by_eq => (TokenKind::MinusEq, 2),
            '-' => (TokenKind::Minus, 1),
            '%' if followed_by_eq => (TokenKind::PercentEq, 2),
            '%' => (TokenKind::Percent, 1),
            '&' if followed_by_eq => (TokenKind::AmpersandEq, 2),
            '&' => (TokenKind::Ampersand, 1),
            '|' if followed_by_eq => (TokenKind::PipeEq, 2),
            '|' => (TokenKind::Pipe, 1),
            '^' if followed_by_eq => (TokenKind::CaretEq, 2),
            '^' => (TokenKind::Caret, 1),
            '*' => match (next, next2) {
                (Some('*'), Some('=')) => (TokenKind::DoubleStarEq, 3),
                (Some('*'), _) => (TokenKind::DoubleStar, 2),
                (Some('='), _) => (TokenKind::StarEq, 2),
                _ => (TokenKind::Star, 1),
            },
            '/' => match (next, next2) {
                (Some('/'), Some('=')) => (TokenKind::DoubleSlashEq, 3),
                (Some('/'), _) => (TokenKind::DoubleSlash, 2),
                (Some('='), _) => (TokenKind::SlashEq, 2),
                _ => (TokenKind::Slash, 1),
            },
            '<' => match (next, next2) {
                (Some('<'), Some('=')) => (TokenKind::ShiftLeftEq, 3),
                (Some('<'), _) => (TokenKind::ShiftLeft, 2),
                (Some('='), _) => (TokenKind::LessEq, 2),
                _ => (TokenKind::Less, 1),
            },
            '>' => match (next, next2) {
                (Some('>'), Some('=')) => (TokenKind::ShiftRightEq, 3),
                (Some('>'), _) => (TokenKind::ShiftRight, 2),
                (Some('='), _) => (TokenKind::GreaterEq, 2),
                _ => (TokenKind::Greater, 1),
            },
            _ => {
                return Err(LexError::UnexpectedCharacter {
                    character: ch,
                    line: self.line + 1,
                });
            }
        };

        for _ in 0..len {
            self.consume_char();
        }
        Ok(Token::new(kind, self.span_from(start)))
    }

    fn read_identifier(&mut self, start: Span) -> Token<'a> {
        self.consume_while(|c| c.is_alphanumeric() || c == '_');
        let ident = &self.input[start.start..self.pos];
        let kind = keyword_kind(ident).unwrap_or(TokenKind::Identifier(ident));
        Token::new(kind, self.span_from(start))
    }

    fn read_number(&mut self, start: Span) -> LexResult<Token<'a>> {
        let base = match (self.peek_char(), self.char_at(self.pos + 1)) {
            (Some('0'), Some('b' | 'B')) => {
                self.consume_char();
                self.consume_char();
                2
            }
            (Some('0'), Some('o' | 'O')) => {
                self.consume_char();
                self.consume_char();
                8
            }
            (Some('0'), Some('x' | 'X')) => {
                self.consume_char();
                self.consume_char();
                16
            }
            (Some('0'), Some(c)) if c.is_ascii_digit() => {
                self.consume_char();
                8
            }
            _ => 10,
        };

        let digits_start = self.pos;
        self.consume_while(|c| c.is_ascii_alphanumeric());
        let int_end = self.pos;

        let mut fraction = digits_start..digits_start;
        if self.peek_char() == Some('.')
            && self
                .char_at(self.pos + 1)
                .is_some_and(|c| c.is_ascii_alphanumeric())
        {
            self.consume_char();
            let fraction_start = self.pos;
            self.consume_while(|c| c.is_ascii_alphanumeric());
            fraction = fraction_start..self.pos;
        }

        let int_digits = &self.input[digits_start..int_end];
        let fraction_digits = &self.input[fraction];

        let invalid = |lexer: &Self| LexError::InvalidNumberLiteral {
            literal: lexer.input[start.start..lexer.pos].to_string(),
            line: lexer.line + 1,
        };

        if int_digits.is_empty() && fraction_digits.is_empty() {
            return Err(invalid(self));
        }

        let mut integer: i64 = 0;
        for c in int_digits.chars() {
            let digit = c.to_digit(base).ok_or_else(|| invalid(self))?;
            integer = integer
                .checked_mul(i64::from(base))
                .and_then(|value| value.checked_add(i64::from(digit)))
                .ok_or_else(|| invalid(self))?;
        }

        let kind = if fraction_digits.is_empty() {
            TokenKind::Integer(integer)
        } else {
            // Fractional digits are interpreted in the same base as the
            // integer part.
            let mut value = integer as f64;
            let mut scale = 1.0 / f64::from(base);
            for c in fraction_digits.chars() {
                let digit = c.to_digit(base).ok_or_else(|| invalid(self))?;
                value += f64::from(digit) * scale;
                scale /= f64::from(base);
            }
            TokenKind::Float(value)
        };

        Ok(Token::new(kind, self.span_from(start)))
    }

    fn read_string(&mut self, start: Span, quote: char) -> LexResult<Token<'a>> {
        self.consume_char(); // opening quote
        let mut content = String::new();

        loop {
            match self.peek_char() {
                Some(c) if c == quote => {
                    self.consume_char();
                    return Ok(Token::new(
                        TokenKind::String(content),
                        self.span_from(start),
                    ));
                }
                Some('\n') | None => {
                    return Err(LexError::UnterminatedString {
                        line: self.line + 1,
                    });
                }
                Some('\\') => {
                    self.consume_char();
                    let escape = self.consume_char().ok_or(LexError::UnterminatedString {
                        line: self.line + 1,
                    })?;
                    let resolved = match escape {
                        'n' => '\n',
                        't' => '\t',
                        'r' => '\r',
                        '0' => '\0',
                        '\\' => '\\',
                        '\'' => '\'',
                        '"' => '"',
                        other => {
                            return Err(LexError::InvalidEscape {
                                escape: other,
                                line: self.line + 1,
                            });
                        }
                    };
                    content.push(resolved);
                }
                Some(c) => {
                    self.consume_char();
                    content.push(c);
                }
            }
        }
    }

    fn consume_while<P>(&mut self, keep_predicate: P) -> usize
    where
        P: Fn(char) -> bool,
    {
        let start = self.pos;
        while let Some(c) = self.peek_char() {
            if !keep_predicate(c) {
                break;
            }
            self.consume_char();
        }
        self.pos - start
    }

    fn char_at(&self, index: usize) -> Option<char> {
        if index >= self.input.len() {
            None
        } else {
            self.input[index..].chars().next()
        }
    }

    fn peek_char(&self) -> Option<char> {
        self.char_at(self.pos)
    }

    fn consume_char(&mut self) -> Option<char> {
        let c = self.peek_char()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn here(&self) -> Span {
        Span {
            start: self.pos,
            end: self.pos,
            line: self.line,
            column: self.pos.saturating_sub(self.line_start),
        }
    }

    fn span_from(&self, start: Span) -> Span {
        Span {
            start: start.start,
            end: self.pos,
            line: start.line,
            column: start.column,
        }
    }

    fn current_indent(&self) -> LexResult<usize> {
        self.indent_stack
            .last()
            .copied()
            .ok_or(LexError::InvariantViolation {
                message: "indent stack is empty",
            })
    }

    fn flush_eof_dedents(&mut self) {
        while self.indent_stack.len() > 1 {
            self.indent_stack.pop();
            let span = self.here();
            self.pending_tokens.push(Token::new(TokenKind::Dedent, span));
        }
    }
}

impl<'a> Iterator for Lexer<'a> {
    type Item = LexResult<Token<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_token() {
            Ok(token) => Some(Ok(token)),
            Err(e) => Some(Err(e)),
        }
    }
}

pub fn tokenize(input: &str) -> LexResult<Vec<Token<'_>>> {
    let mut lexer = Lexer::new(input);
    let mut tokens = Vec::new();
    loop {
        let token = lexer.next_token()?;
        let is_eof = matches!(token.kind, TokenKind::EOF);
        tokens.push(token);
        if is_eof {
            break;
        }
    }
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    fn kinds(input: &str) -> Vec<TokenKind<'_>> {
        tokenize(input)
            .expect("tokenize should succeed")
            .into_iter()
            .map(|token| token.kind)
            .collect()
    }

    #[test]
    fn lexes_simple_program() {
        let input = indoc! {"
            def fn():
                n = 4 + 4
                print(n)
            fn()
        "};
        let expected = vec![
            TokenKind::Def,
            TokenKind::Identifier("fn"),
            TokenKind::LParen,
            TokenKind::RParen,
            TokenKind::Colon,
            TokenKind::Newline,
            TokenKind::Indent,
            TokenKind::Identifier("n"),
            TokenKind::Equal,
            TokenKind::Integer(4),
            TokenKind::Plus,
            TokenKind::Integer(4),
            TokenKind::Newline,
            TokenKind::Identifier("print"),
            TokenKind::LParen,
            TokenKind::Identifier("n"),
            TokenKind::RParen,
            TokenKind::Newline,
            TokenKind::Dedent,
            TokenKind::Identifier("fn"),
            TokenKind::LParen,
            TokenKind::RParen,
            TokenKind::Newline,
            TokenKind::EOF,
        ];
        assert_eq!(kinds(input), expected);
    }

    #[test]
    fn lexes_multi_character_operators() {
        assert_eq!(
            kinds("a **= b << c != d\n"),
            vec![
                TokenKind::Identifier("a"),
                TokenKind::DoubleStarEq,
                TokenKind::Identifier("b"),
                TokenKind::ShiftLeft,
                TokenKind::Identifier("c"),
                TokenKind::NotEq,
                TokenKind::Identifier("d"),
                TokenKind::Newline,
                TokenKind::EOF,
            ]
        );
    }

    #[test]
    fn lexes_number_bases() {
        assert_eq!(
            kinds("x = 0b101 + 0o17 + 017 + 0xff + 12\n"),
            vec![
                TokenKind::Identifier("x"),
                TokenKind::Equal,
                TokenKind::Integer(5),
                TokenKind::Plus,
                TokenKind::Integer(15),
                TokenKind::Plus,
                TokenKind::Integer(15),
                TokenKind::Plus,
                TokenKind::Integer(255),
                TokenKind::Plus,
                TokenKind::Integer(12),
                TokenKind::Newline,
                TokenKind::EOF,
            ]
        );
    }

    #[test]
    fn lexes_floats_with_base_fractions() {
        assert_eq!(
            kinds("1.5\n"),
            vec![TokenKind::Float(1.5), TokenKind::Newline, TokenKind::EOF]
        );
        assert_eq!(
            kinds("0x1.8\n"),
            vec![TokenKind::Float(1.5), TokenKind::Newline, TokenKind::EOF]
        );
    }

    #[test]
    fn lexes_string_escapes() {
        assert_eq!(
            kinds("s = 'a\\n\\'b'"),
            vec![
                TokenKind::Identifier("s"),
                TokenKind::Equal,
                TokenKind::String("a\n'b".to_string()),
                TokenKind::EOF,
            ]
        );
    }

    #[test]
    fn newlines_inside_brackets_are_ignored() {
        let input = indoc! {"
            x = [1,
                 2]
        "};
        assert_eq!(
            kinds(input),
            vec![
                TokenKind::Identifier("x"),
                TokenKind::Equal,
                TokenKind::LBracket,
                TokenKind::Integer(1),
                TokenKind::Comma,
                TokenKind::Integer(2),
                TokenKind::RBracket,
                TokenKind::Newline,
                TokenKind::EOF,
            ]
        );
    }

    #[test]
    fn comment_only_line_does_not_change_indentation() {
        let input = indoc! {"
            if True:
                x = 1
            # comment at column zero
                y = 2
        "};
        let streamed = kinds(input);
        assert_eq!(
            streamed
                .iter()
                .filter(|kind| matches!(kind, TokenKind::Indent))
                .count(),
            1
        );
        assert_eq!(
            streamed
                .iter()
                .filter(|kind| matches!(kind, TokenKind::Dedent))
                .count(),
            1
        );
    }

    #[test]
    fn errors_on_invalid_character() {
        let err = tokenize("x = 1 ? 2\n").expect_err("expected lexing failure");
        assert!(err.to_string().contains("Unexpected character '?'"));
    }

    #[test]
    fn errors_on_integer_overflow() {
        let err = tokenize("n = 99999999999999999999999999\n").expect_err("expected overflow");
        assert!(err.to_string().contains("Invalid number literal"));
    }

    #[test]
    fn errors_on_tab_indentation() {
        let err = tokenize("\tx = 1\n").expect_err("expected tab indentation failure");
        assert_eq!(err, LexError::TabIndentation { line: 1 });
    }

    #[test]
    fn errors_on_inconsistent_dedent() {
        let input = indoc! {"
            if True:
                x = 1
              y = 2
        "};
        let err = tokenize(input).expect_err("expected inconsistent dedent failure");
        assert_eq!(
            err,
            LexError::InvalidDedent {
                indent_level: 2,
                line: 3
            }
        );
    }

    #[test]
    fn emits_dedent_before_eof() {
        let input = "if True:\n    x = 1";
        assert_eq!(
            kinds(input),
            vec![
                TokenKind::If,
                TokenKind::True,
                TokenKind::Colon,
                TokenKind::Newline,
                TokenKind::Indent,
                TokenKind::Identifier("x"),
                TokenKind::Equal,
                TokenKind::Integer(1),
                TokenKind::Dedent,
                TokenKind::EOF,
            ]
        );
    }

    #[test]
    fn errors_on_unterminated_string() {
        let err = tokenize("x = \"abc\n").expect_err("expected unterminated string failure");
        assert_eq!(err, LexError::UnterminatedString { line: 1 });
    }

    #[test]
    fn tracks_line_and_column() {
        let tokens = tokenize("x = 1\ny = 2\n").expect("tokenize should succeed");
        let y = tokens
            .iter()
            .find(|token| token.kind == TokenKind::Identifier("y"))
            .expect("expected token for y");
        assert_eq!(y.span.line, 1);
        assert_eq!(y.span.column, 0);
    }
}
