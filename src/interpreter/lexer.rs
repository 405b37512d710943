//! Tokenizer for the expression language.
//!
//! Two entry points: [`tokenize`] for a bare expression (`var.a + 1`) and
//! [`tokenize_template`] for template text as it appears in attribute
//! values (`web-${var.env}`). Interpolations inside quoted strings and
//! templates are tokenized recursively, so a `StrPart::Interp` already
//! carries the tokens of its expression.

use thiserror::Error;

use crate::graph::Value;

/// A parse or tokenize failure, with the byte offset it was detected at.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} at offset {offset}")]
pub struct SyntaxError {
    pub message: String,
    pub offset: usize,
}

impl SyntaxError {
    pub fn new<M: Into<String>>(message: M, offset: usize) -> Self {
        Self {
            message: message.into(),
            offset,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Ident(String),
    Number(Value),
    /// A quoted string, split into literal and interpolated parts.
    Str(Vec<StrPart>),
    Punct(&'static str),
}

#[derive(Debug, Clone, PartialEq)]
pub enum StrPart {
    Lit(String),
    /// `${…}`: the expression's tokens plus its source text.
    Interp { tokens: Vec<Spanned>, text: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    pub token: Token,
    pub offset: usize,
}

/// Longest first, so `==` wins over `=`.
const PUNCTUATION: &[&str] = &[
    "...", "==", "!=", "<=", ">=", "&&", "||", "=>", ".", ",", "[", "]", "(", ")", "{", "}", ":",
    "?", "+", "-", "*", "/", "%", "<", ">", "!", "=",
];

pub fn tokenize(src: &str) -> Result<Vec<Spanned>, SyntaxError> {
    let mut lexer = Lexer { src, pos: 0 };
    lexer.tokens(false)
}

pub fn tokenize_template(src: &str) -> Result<Vec<StrPart>, SyntaxError> {
    let mut lexer = Lexer { src, pos: 0 };
    lexer.string_parts(None)
}

struct Lexer<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> Lexer<'a> {
    fn peek(&self) -> Option<char> {
        self.src[self.pos..].chars().next()
    }

    fn rest(&self) -> &'a str {
        &self.src[self.pos..]
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    /// Read tokens to the end of input, or, when `closing` is set, up to
    /// and including the `}` that ends an interpolation.
    fn tokens(&mut self, closing: bool) -> Result<Vec<Spanned>, SyntaxError> {
        let mut out = Vec::new();
        let mut depth = 0usize;
        loop {
            self.skip_trivia()?;
            let offset = self.pos;
            let Some(c) = self.peek() else {
                if closing {
                    return Err(SyntaxError::new("unterminated interpolation", offset));
                }
                return Ok(out);
            };

            let token = if c == '"' {
                self.bump();
                Token::Str(self.string_parts(Some('"'))?)
            } else if c.is_ascii_digit() {
                self.number()?
            } else if c.is_alphabetic() || c == '_' {
                self.ident()
            } else if let Some(p) = PUNCTUATION.iter().find(|p| self.rest().starts_with(**p)) {
                self.pos += p.len();
                match *p {
                    "{" | "[" | "(" => depth += 1,
                    "}" | "]" | ")" if depth > 0 => depth -= 1,
                    "}" if closing => return Ok(out),
                    _ => {}
                }
                Token::Punct(p)
            } else {
                return Err(SyntaxError::new(format!("unexpected character '{}'", c), offset));
            };
            out.push(Spanned { token, offset });
        }
    }

    fn skip_trivia(&mut self) -> Result<(), SyntaxError> {
        loop {
            let rest = self.rest();
            if let Some(c) = self.peek().filter(|c| c.is_whitespace()) {
                self.pos += c.len_utf8();
            } else if rest.starts_with('#') || rest.starts_with("//") {
                self.pos += rest.find('\n').unwrap_or(rest.len());
            } else if rest.starts_with("/*") {
                match rest[2..].find("*/") {
                    Some(end) => self.pos += end + 4,
                    None => return Err(SyntaxError::new("unterminated comment", self.pos)),
                }
            } else {
                return Ok(());
            }
        }
    }

    fn number(&mut self) -> Result<Token, SyntaxError> {
        let start = self.pos;
        let mut is_float = false;
        self.digits();
        let rest = self.rest();
        if rest.starts_with('.') && rest[1..].starts_with(|c: char| c.is_ascii_digit()) {
            is_float = true;
            self.pos += 1;
            self.digits();
        }
        if self.rest().starts_with(&['e', 'E'][..]) {
            let save = self.pos;
            self.pos += 1;
            if self.rest().starts_with(&['+', '-'][..]) {
                self.pos += 1;
            }
            if self.rest().starts_with(|c: char| c.is_ascii_digit()) {
                is_float = true;
                self.digits();
            } else {
                self.pos = save;
            }
        }
        let text = &self.src[start..self.pos];
        let value = if is_float {
            text.parse::<f64>().map(Value::Float).ok()
        } else {
            text.parse::<i64>()
                .map(Value::Int)
                .or_else(|_| text.parse::<f64>().map(Value::Float))
                .ok()
        };
        value
            .map(Token::Number)
            .ok_or_else(|| SyntaxError::new(format!("invalid number '{}'", text), start))
    }

    fn digits(&mut self) {
        while self.peek().is_some_and(|c| c.is_ascii_digit()) {
            self.pos += 1;
        }
    }

    fn ident(&mut self) -> Token {
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|c| c.is_alphanumeric() || c == '_' || c == '-')
        {
            self.bump();
        }
        Token::Ident(self.src[start..self.pos].to_string())
    }

    /// Read string content up to `terminator` (consumed), or to the end of
    /// input for raw template text. Escapes are only processed inside
    /// quoted strings.
    fn string_parts(&mut self, terminator: Option<char>) -> Result<Vec<StrPart>, SyntaxError> {
        let start = self.pos;
        let mut parts = Vec::new();
        let mut lit = String::new();
        loop {
            let rest = self.rest();
            if rest.starts_with("$${") {
                lit.push_str("${");
                self.pos += 3;
                continue;
            }
            if rest.starts_with("${") {
                self.pos += 2;
                let text_start = self.pos;
                let tokens = self.tokens(true)?;
                let text = self.src[text_start..self.pos - 1].trim().to_string();
                if !lit.is_empty() {
                    parts.push(StrPart::Lit(std::mem::take(&mut lit)));
                }
                parts.push(StrPart::Interp { tokens, text });
                continue;
            }
            match (self.bump(), terminator) {
                (None, None) => break,
                (None, Some(_)) => {
                    return Err(SyntaxError::new("unterminated string", start.saturating_sub(1)))
                }
                (Some(c), Some(t)) if c == t => break,
                (Some('\\'), Some(_)) => lit.push(self.escape()?),
                (Some(c), _) => lit.push(c),
            }
        }
        if !lit.is_empty() || parts.is_empty() {
            parts.push(StrPart::Lit(lit));
        }
        Ok(parts)
    }

    fn escape(&mut self) -> Result<char, SyntaxError> {
        let offset = self.pos;
        match self.bump() {
            Some('n') => Ok('\n'),
            Some('t') => Ok('\t'),
            Some('r') => Ok('\r'),
            Some('"') => Ok('"'),
            Some('\\') => Ok('\\'),
            Some('u') => {
                let hex: String = self.rest().chars().take(4).collect();
                let code = u32::from_str_radix(&hex, 16)
                    .ok()
                    .filter(|_| hex.len() == 4)
                    .and_then(char::from_u32)
                    .ok_or_else(|| SyntaxError::new("invalid unicode escape", offset))?;
                self.pos += 4;
                Ok(code)
            }
            _ => Err(SyntaxError::new("invalid escape sequence", offset)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<Token> {
        tokenize(src).unwrap().into_iter().map(|s| s.token).collect()
    }

    #[test]
    fn test_tokenize_reference_and_operators() {
        assert_eq!(
            kinds("var.count >= 2 && !local.off"),
            vec![
                Token::Ident("var".into()),
                Token::Punct("."),
                Token::Ident("count".into()),
                Token::Punct(">="),
                Token::Number(Value::Int(2)),
                Token::Punct("&&"),
                Token::Punct("!"),
                Token::Ident("local".into()),
                Token::Punct("."),
                Token::Ident("off".into()),
            ]
        );
    }

    #[test]
    fn test_numbers() {
        assert_eq!(kinds("1.5"), vec![Token::Number(Value::Float(1.5))]);
        assert_eq!(kinds("2e3"), vec![Token::Number(Value::Float(2000.0))]);
        // `list.0` keeps the dot as a traversal.
        assert_eq!(kinds("a.0").len(), 3);
    }

    #[test]
    fn test_quoted_string_with_interpolation() {
        let tokens = kinds(r#""web-${var.env}\n""#);
        let Token::Str(parts) = &tokens[0] else {
            panic!("expected string");
        };
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], StrPart::Lit("web-".into()));
        match &parts[1] {
            StrPart::Interp { tokens, text } => {
                assert_eq!(text, "var.env");
                assert_eq!(tokens.len(), 3);
            }
            other => panic!("unexpected part {:?}", other),
        }
        assert_eq!(parts[2], StrPart::Lit("\n".into()));
    }

    #[test]
    fn test_template_escape_and_nested_braces() {
        let parts = tokenize_template("$${literal} ${ {a = 1}[\"a\"] }").unwrap();
        assert_eq!(parts[0], StrPart::Lit("${literal} ".into()));
        assert!(matches!(&parts[1], StrPart::Interp { text, .. } if text == "{a = 1}[\"a\"]"));
    }

    #[test]
    fn test_plain_template_is_one_literal() {
        assert_eq!(
            tokenize_template("plain text").unwrap(),
            vec![StrPart::Lit("plain text".into())]
        );
        assert_eq!(tokenize_template("").unwrap(), vec![StrPart::Lit(String::new())]);
    }

    #[test]
    fn test_errors_carry_offsets() {
        let err = tokenize_template("abc ${var.x").unwrap_err();
        assert_eq!(err.message, "unterminated interpolation");
        let err = tokenize("a @ b").unwrap_err();
        assert_eq!(err.offset, 2);
    }

    #[test]
    fn test_comments_skipped() {
        assert_eq!(kinds("1 # one\n + /* two */ 2").len(), 3);
    }
}
