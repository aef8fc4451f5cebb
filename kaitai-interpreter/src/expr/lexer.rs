//! Tokenizer for the expression sub-language.
//!
//! Identifiers are `[A-Za-z_][A-Za-z0-9_]*`; integer literals come in
//! decimal, `0x`, `0o` and `0b` forms with optional `_` separators and
//! overflow into big integers; strings are double-quoted with standard
//! escapes or single-quoted verbatim. Comments are not supported.

use crate::errors::{Error, Result};
use num_bigint::BigInt;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Int(i64),
    BigInt(BigInt),
    Float(f64),
    Str(String),
    Ident(String),
    DoubleColon,
    Dot,
    Comma,
    Question,
    Colon,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Lt,
    Le,
    Gt,
    Ge,
    EqEq,
    NotEq,
    Amp,
    Pipe,
    Caret,
    Shl,
    Shr,
}

pub fn tokenize(src: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\r' | '\n' => i += 1,
            '0'..='9' => {
                let (tok, next) = lex_number(&chars, i)?;
                tokens.push(tok);
                i = next;
            }
            'a'..='z' | 'A'..='Z' | '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            '"' => {
                let (s, next) = lex_quoted(&chars, i)?;
                tokens.push(Token::Str(s));
                i = next;
            }
            '\'' => {
                let start = i + 1;
                let close = chars[start..]
                    .iter()
                    .position(|c| *c == '\'')
                    .ok_or_else(|| Error::parse("unterminated single-quoted string"))?;
                tokens.push(Token::Str(chars[start..start + close].iter().collect()));
                i = start + close + 1;
            }
            ':' if chars.get(i + 1) == Some(&':') => {
                tokens.push(Token::DoubleColon);
                i += 2;
            }
            ':' => {
                tokens.push(Token::Colon);
                i += 1;
            }
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '?' => {
                tokens.push(Token::Question);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '[' => {
                tokens.push(Token::LBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                i += 1;
            }
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '/' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            '%' => {
                tokens.push(Token::Percent);
                i += 1;
            }
            '&' => {
                tokens.push(Token::Amp);
                i += 1;
            }
            '|' => {
                tokens.push(Token::Pipe);
                i += 1;
            }
            '^' => {
                tokens.push(Token::Caret);
                i += 1;
            }
            '<' => match chars.get(i + 1) {
                Some('=') => {
                    tokens.push(Token::Le);
                    i += 2;
                }
                Some('<') => {
                    tokens.push(Token::Shl);
                    i += 2;
                }
                _ => {
                    tokens.push(Token::Lt);
                    i += 1;
                }
            },
            '>' => match chars.get(i + 1) {
                Some('=') => {
                    tokens.push(Token::Ge);
                    i += 2;
                }
                Some('>') => {
                    tokens.push(Token::Shr);
                    i += 2;
                }
                _ => {
                    tokens.push(Token::Gt);
                    i += 1;
                }
            },
            '=' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::EqEq);
                i += 2;
            }
            '!' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::NotEq);
                i += 2;
            }
            other => {
                return Err(Error::parse(format!(
                    "unexpected character {other:?} at column {i} in expression"
                )))
            }
        }
    }
    Ok(tokens)
}

fn lex_number(chars: &[char], start: usize) -> Result<(Token, usize)> {
    let mut i = start;

    // Radix-prefixed integers.
    if chars[i] == '0' {
        let radix = match chars.get(i + 1) {
            Some('x') | Some('X') => Some(16),
            Some('b') | Some('B') => Some(2),
            Some('o') | Some('O') => Some(8),
            _ => None,
        };
        if let Some(radix) = radix {
            i += 2;
            let digits_start = i;
            while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            let digits: String = chars[digits_start..i].iter().filter(|c| **c != '_').collect();
            if digits.is_empty() {
                return Err(Error::parse("integer literal with empty digits"));
            }
            return Ok((int_token(&digits, radix)?, i));
        }
    }

    while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '_') {
        i += 1;
    }

    // `1.5` is a float, `1.to_i` is a member access on an integer.
    let mut is_float = false;
    if i < chars.len() && chars[i] == '.' && chars.get(i + 1).is_some_and(|c| c.is_ascii_digit()) {
        is_float = true;
        i += 1;
        while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '_') {
            i += 1;
        }
    }
    if i < chars.len() && (chars[i] == 'e' || chars[i] == 'E') {
        let mut j = i + 1;
        if matches!(chars.get(j), Some('+') | Some('-')) {
            j += 1;
        }
        if chars.get(j).is_some_and(|c| c.is_ascii_digit()) {
            is_float = true;
            i = j;
            while i < chars.len() && chars[i].is_ascii_digit() {
                i += 1;
            }
        }
    }

    let text: String = chars[start..i].iter().filter(|c| **c != '_').collect();
    if is_float {
        let v: f64 = text
            .parse()
            .map_err(|_| Error::parse(format!("malformed float literal {text:?}")))?;
        Ok((Token::Float(v), i))
    } else {
        Ok((int_token(&text, 10)?, i))
    }
}

fn int_token(digits: &str, radix: u32) -> Result<Token> {
    match i64::from_str_radix(digits, radix) {
        Ok(v) => Ok(Token::Int(v)),
        Err(_) => BigInt::parse_bytes(digits.as_bytes(), radix)
            .map(Token::BigInt)
            .ok_or_else(|| Error::parse(format!("malformed integer literal {digits:?}"))),
    }
}

fn lex_quoted(chars: &[char], start: usize) -> Result<(String, usize)> {
    let mut out = String::new();
    let mut i = start + 1;
    while i < chars.len() {
        match chars[i] {
            '"' => return Ok((out, i + 1)),
            '\\' => {
                let esc = chars
                    .get(i + 1)
                    .ok_or_else(|| Error::parse("dangling escape in string literal"))?;
                match esc {
                    'n' => out.push('\n'),
                    'r' => out.push('\r'),
                    't' => out.push('\t'),
                    '0' => out.push('\0'),
                    '\\' => out.push('\\'),
                    '"' => out.push('"'),
                    '\'' => out.push('\''),
                    'u' => {
                        let hex: String = chars
                            .get(i + 2..i + 6)
                            .ok_or_else(|| Error::parse("truncated \\u escape"))?
                            .iter()
                            .collect();
                        let cp = u32::from_str_radix(&hex, 16)
                            .map_err(|_| Error::parse(format!("bad \\u escape {hex:?}")))?;
                        out.push(
                            char::from_u32(cp)
                                .ok_or_else(|| Error::parse(format!("invalid codepoint {cp:#x}")))?,
                        );
                        i += 6;
                        continue;
                    }
                    other => {
                        return Err(Error::parse(format!("unknown escape \\{other}")));
                    }
                }
                i += 2;
            }
            c => {
                out.push(c);
                i += 1;
            }
        }
    }
    Err(Error::parse("unterminated string literal"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn idents(src: &str) -> Vec<Token> {
        tokenize(src).unwrap()
    }

    #[test]
    fn integer_radixes() {
        assert_eq!(idents("255 0xff 0b1111_1111 0o377"), vec![
            Token::Int(255),
            Token::Int(255),
            Token::Int(255),
            Token::Int(255),
        ]);
    }

    #[test]
    fn huge_literal_becomes_bigint() {
        let toks = idents("0xffff_ffff_ffff_ffff");
        assert!(matches!(&toks[0], Token::BigInt(b) if *b == BigInt::from(u64::MAX)));
    }

    #[test]
    fn float_vs_member_access() {
        assert_eq!(idents("1.5")[0], Token::Float(1.5));
        assert_eq!(
            idents("1.to_i"),
            vec![Token::Int(1), Token::Dot, Token::Ident("to_i".into())]
        );
        assert_eq!(idents("2e3")[0], Token::Float(2000.0));
    }

    #[test]
    fn string_escapes() {
        assert_eq!(idents(r#""a\nbA""#)[0], Token::Str("a\nbA".into()));
        assert_eq!(idents(r#"'no\escape'"#)[0], Token::Str(r"no\escape".into()));
    }

    #[test]
    fn operators_and_punctuation() {
        assert_eq!(
            idents("a::b <= c >> 2"),
            vec![
                Token::Ident("a".into()),
                Token::DoubleColon,
                Token::Ident("b".into()),
                Token::Le,
                Token::Ident("c".into()),
                Token::Shr,
                Token::Int(2),
            ]
        );
    }

    #[test]
    fn rejects_stray_characters() {
        assert!(tokenize("a # b").is_err());
        assert!(tokenize("\"open").is_err());
    }
}
