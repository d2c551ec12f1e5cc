use crate::error::ScriptError;

use super::var::{self, VarRef};

#[derive(Debug, Clone)]
pub enum Token {
    Number(String),
    Str(String),
    Ident(String),
    Var(VarRef),
    Op(&'static str),
    LParen,
    RParen,
    Eof,
}

/// Longest spelling first so `<=` wins over `<`.
const OPERATORS: [&str; 23] = [
    "&&", "||", "<=", ">=", "==", "!=", "+=", "-=", "*=", "/=", "%=", "++", "--", "+", "-", "*",
    "/", "%", "!", "<", ">", "=", ";",
];

pub fn tokenize(src: &str) -> Result<Vec<Token>, ScriptError> {
    let mut tokens = Vec::new();
    let bytes = src.as_bytes();
    let mut pos = 0;

    while pos < src.len() {
        let c = src[pos..].chars().next().unwrap_or(' ');
        if c.is_whitespace() {
            pos += c.len_utf8();
            continue;
        }

        match c {
            '$' => {
                let (reference, end) = var::scan(src, pos)?;
                tokens.push(Token::Var(reference));
                pos = end;
            }
            '(' => {
                tokens.push(Token::LParen);
                pos += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                pos += 1;
            }
            '\'' => {
                let (text, end) = scan_string(src, pos)?;
                tokens.push(Token::Str(text));
                pos = end;
            }
            c if c.is_ascii_digit()
                || (c == '.' && bytes.get(pos + 1).is_some_and(u8::is_ascii_digit)) =>
            {
                let end = scan_number(bytes, pos);
                tokens.push(Token::Number(src[pos..end].to_string()));
                pos = end;
            }
            c if c.is_alphabetic() || c == '_' => {
                let end = src[pos..]
                    .char_indices()
                    .find(|(_, ch)| !(ch.is_alphanumeric() || *ch == '_'))
                    .map(|(offset, _)| pos + offset)
                    .unwrap_or(src.len());
                tokens.push(Token::Ident(src[pos..end].to_string()));
                pos = end;
            }
            _ => {
                let op = OPERATORS
                    .iter()
                    .find(|op| src[pos..].starts_with(**op))
                    .ok_or_else(|| {
                        ScriptError::compile(src, format!("unexpected character `{c}`"))
                    })?;
                tokens.push(Token::Op(*op));
                pos += op.len();
            }
        }
    }

    tokens.push(Token::Eof);
    Ok(tokens)
}

fn scan_number(bytes: &[u8], start: usize) -> usize {
    let mut end = start;
    while end < bytes.len() && bytes[end].is_ascii_digit() {
        end += 1;
    }
    if end < bytes.len() && bytes[end] == b'.' {
        end += 1;
        while end < bytes.len() && bytes[end].is_ascii_digit() {
            end += 1;
        }
    }
    if end < bytes.len() && matches!(bytes[end], b'e' | b'E') {
        let mut exp = end + 1;
        if exp < bytes.len() && matches!(bytes[exp], b'+' | b'-') {
            exp += 1;
        }
        if exp < bytes.len() && bytes[exp].is_ascii_digit() {
            end = exp;
            while end < bytes.len() && bytes[end].is_ascii_digit() {
                end += 1;
            }
        }
    }
    end
}

/// Single-quoted literal; `\'` and `\\` are the only escapes.
fn scan_string(src: &str, start: usize) -> Result<(String, usize), ScriptError> {
    let mut text = String::new();
    let mut chars = src[start + 1..].char_indices();
    while let Some((offset, c)) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some((_, escaped @ ('\'' | '\\'))) => text.push(escaped),
                Some((_, other)) => {
                    text.push('\\');
                    text.push(other);
                }
                None => text.push('\\'),
            },
            '\'' => return Ok((text, start + 1 + offset + 1)),
            other => text.push(other),
        }
    }
    Err(ScriptError::compile(&src[start..], "unterminated string literal"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ops(src: &str) -> Vec<String> {
        tokenize(src)
            .unwrap()
            .into_iter()
            .map(|token| match token {
                Token::Number(n) => format!("n:{n}"),
                Token::Str(s) => format!("s:{s}"),
                Token::Ident(i) => format!("i:{i}"),
                Token::Var(_) => "var".to_string(),
                Token::Op(op) => op.to_string(),
                Token::LParen => "(".to_string(),
                Token::RParen => ")".to_string(),
                Token::Eof => "eof".to_string(),
            })
            .collect()
    }

    #[test]
    fn splits_operators_longest_first() {
        assert_eq!(
            ops("a<=1&&b!=2"),
            vec!["i:a", "<=", "n:1", "&&", "i:b", "!=", "n:2", "eof"]
        );
        assert_eq!(ops("--$(a)--"), vec!["--", "var", "--", "eof"]);
    }

    #[test]
    fn reads_numbers_and_strings() {
        assert_eq!(ops("1.5e3 'it\\'s'"), vec!["n:1.5e3", "s:it's", "eof"]);
        assert_eq!(ops(".5"), vec!["n:.5", "eof"]);
    }

    #[test]
    fn rejects_unknown_characters() {
        assert!(tokenize("a # b").is_err());
        assert!(tokenize("'open").is_err());
    }
}
