//! Tokenizer for the subset of InfluxQL found in dashboard targets.

use crate::error::{ConvertError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    /// Bare word. Keywords are not distinguished from identifiers here.
    Ident(String),
    /// `"double quoted"` identifier, quotes removed and quote escapes resolved.
    QuotedIdent(String),
    /// `'single quoted'` string, quotes removed and quote escapes resolved.
    Str(String),
    /// `/regex/` literal, slashes removed, escapes kept verbatim.
    Regex(String),
    Number(String),
    /// Number immediately followed by a unit, such as `5m` or `1h`.
    Duration(String),
    /// Grafana variable: `$name`, `${name}` or `[[name]]`.
    Param(String),
    LParen,
    RParen,
    Comma,
    Dot,
    DoubleColon,
    Semicolon,
    Star,
    Slash,
    Plus,
    Minus,
    Eq,
    NotEq,
    LtGt,
    Lt,
    Gt,
    LtEq,
    GtEq,
    RegexMatch,
    RegexNotMatch,
}

impl Token {
    pub fn is_keyword(&self, keyword: &str) -> bool {
        matches!(self, Token::Ident(word) if word.eq_ignore_ascii_case(keyword))
    }
}

pub fn tokenize(input: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut pos = 0;

    while pos < chars.len() {
        let ch = chars[pos];

        if ch.is_whitespace() {
            pos += 1;
            continue;
        }

        match ch {
            '"' | '\'' => {
                let (raw, next) = read_delimited(&chars, pos + 1, ch)?;
                let body = unescape_quoted(&raw);
                tokens.push(if ch == '"' {
                    Token::QuotedIdent(body)
                } else {
                    Token::Str(body)
                });
                pos = next;
            }
            '/' if starts_regex(tokens.last()) => {
                let (body, next) = read_delimited(&chars, pos + 1, '/')?;
                tokens.push(Token::Regex(body));
                pos = next;
            }
            '$' => {
                let (param, next) = read_param(&chars, pos)?;
                tokens.push(Token::Param(param));
                pos = next;
            }
            '[' if chars.get(pos + 1) == Some(&'[') => {
                let start = pos;
                let mut end = pos + 2;
                while end + 1 < chars.len() && !(chars[end] == ']' && chars[end + 1] == ']') {
                    end += 1;
                }
                if end + 1 >= chars.len() {
                    return Err(ConvertError::shape("unterminated [[variable]]"));
                }
                tokens.push(Token::Param(chars[start..end + 2].iter().collect()));
                pos = end + 2;
            }
            c if c.is_ascii_digit() => {
                let start = pos;
                while pos < chars.len() && (chars[pos].is_ascii_digit() || chars[pos] == '.') {
                    pos += 1;
                }
                let number_end = pos;
                while pos < chars.len() && chars[pos].is_ascii_alphabetic() {
                    pos += 1;
                }
                let text: String = chars[start..pos].iter().collect();
                tokens.push(if pos > number_end {
                    Token::Duration(text)
                } else {
                    Token::Number(text)
                });
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = pos;
                while pos < chars.len() && (chars[pos].is_alphanumeric() || chars[pos] == '_') {
                    pos += 1;
                }
                tokens.push(Token::Ident(chars[start..pos].iter().collect()));
            }
            _ => {
                let next = chars.get(pos + 1).copied();
                let (token, width) = match (ch, next) {
                    ('=', Some('~')) => (Token::RegexMatch, 2),
                    ('!', Some('~')) => (Token::RegexNotMatch, 2),
                    ('!', Some('=')) => (Token::NotEq, 2),
                    ('<', Some('>')) => (Token::LtGt, 2),
                    ('<', Some('=')) => (Token::LtEq, 2),
                    ('>', Some('=')) => (Token::GtEq, 2),
                    (':', Some(':')) => (Token::DoubleColon, 2),
                    ('=', _) => (Token::Eq, 1),
                    ('<', _) => (Token::Lt, 1),
                    ('>', _) => (Token::Gt, 1),
                    ('(', _) => (Token::LParen, 1),
                    (')', _) => (Token::RParen, 1),
                    (',', _) => (Token::Comma, 1),
                    ('.', _) => (Token::Dot, 1),
                    (';', _) => (Token::Semicolon, 1),
                    ('*', _) => (Token::Star, 1),
                    ('/', _) => (Token::Slash, 1),
                    ('+', _) => (Token::Plus, 1),
                    ('-', _) => (Token::Minus, 1),
                    _ => {
                        return Err(ConvertError::shape(format!(
                            "unexpected character {ch:?} at offset {pos}"
                        )))
                    }
                };
                tokens.push(token);
                pos += width;
            }
        }
    }

    Ok(tokens)
}

/// A slash opens a regex literal after a match operator or a `FROM` keyword;
/// anywhere else it is division.
fn starts_regex(previous: Option<&Token>) -> bool {
    match previous {
        Some(Token::RegexMatch | Token::RegexNotMatch) => true,
        Some(token) => token.is_keyword("FROM"),
        None => false,
    }
}

/// Reads up to the closing `delimiter`, honoring backslash escapes. Returns
/// the raw body and the position after the delimiter.
fn read_delimited(chars: &[char], start: usize, delimiter: char) -> Result<(String, usize)> {
    let mut body = String::new();
    let mut pos = start;
    while pos < chars.len() {
        let ch = chars[pos];
        if ch == '\\' {
            body.push(ch);
            if let Some(escaped) = chars.get(pos + 1) {
                body.push(*escaped);
            }
            pos += 2;
            continue;
        }
        if ch == delimiter {
            return Ok((body, pos + 1));
        }
        body.push(ch);
        pos += 1;
    }
    Err(ConvertError::shape(format!("unterminated {delimiter} literal")))
}

/// Resolves `\\`, `\'` and `\"`. Any other escape, such as `\.`, is part of
/// the value and kept.
fn unescape_quoted(raw: &str) -> String {
    let mut body = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            body.push(ch);
            continue;
        }
        match chars.next() {
            Some(escaped @ ('\\' | '\'' | '"')) => body.push(escaped),
            Some(other) => {
                body.push('\\');
                body.push(other);
            }
            None => body.push('\\'),
        }
    }
    body
}

fn read_param(chars: &[char], start: usize) -> Result<(String, usize)> {
    let mut pos = start + 1;
    if chars.get(pos) == Some(&'{') {
        while pos < chars.len() && chars[pos] != '}' {
            pos += 1;
        }
        if pos >= chars.len() {
            return Err(ConvertError::shape("unterminated ${variable}"));
        }
        pos += 1;
    } else {
        while pos < chars.len() && (chars[pos].is_alphanumeric() || chars[pos] == '_') {
            pos += 1;
        }
    }
    if pos == start + 1 {
        return Err(ConvertError::shape("dangling $ in query"));
    }
    Ok((chars[start..pos].iter().collect(), pos))
}
