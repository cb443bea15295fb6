//! S-expression parser for the filter language.
//!
//! Quoted strings run from one `"` to the next with no escape
//! processing. Bare tokens that parse as integers become [`Expr::Int`],
//! everything else becomes [`Expr::Atom`]. Whitespace is insignificant.

use super::FilterError;

/// A parsed filter expression node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    Atom(String),
    Str(String),
    Int(i64),
    List(Vec<Expr>),
}

#[derive(Debug, PartialEq)]
enum Token {
    Open,
    Close,
    Atom(String),
    Str(String),
    Int(i64),
}

fn tokenize(src: &str) -> Result<Vec<Token>, FilterError> {
    let mut tokens = Vec::new();
    let bytes = src.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'(' => {
                tokens.push(Token::Open);
                i += 1;
            }
            b')' => {
                tokens.push(Token::Close);
                i += 1;
            }
            b'"' => {
                let Some(close) = src[i + 1..].find('"') else {
                    return Err(FilterError::MismatchedQuote);
                };
                tokens.push(Token::Str(src[i + 1..i + 1 + close].to_string()));
                i += close + 2;
            }
            c if c.is_ascii_whitespace() => i += 1,
            _ => {
                let start = i;
                while i < bytes.len()
                    && !matches!(bytes[i], b'(' | b')' | b'"')
                    && !bytes[i].is_ascii_whitespace()
                {
                    i += 1;
                }
                let word = &src[start..i];
                match word.parse::<i64>() {
                    Ok(n) => tokens.push(Token::Int(n)),
                    Err(_) => tokens.push(Token::Atom(word.to_string())),
                }
            }
        }
    }
    Ok(tokens)
}

/// Parse one complete expression out of the source. Leftover tokens
/// after the expression are an error; chain filters with any/all
/// instead.
pub fn parse(src: &str) -> Result<Expr, FilterError> {
    let tokens = tokenize(src)?;
    let mut pos = 0;
    let expr = parse_expr(&tokens, &mut pos)?;
    if pos != tokens.len() {
        return Err(FilterError::ExtraTokens);
    }
    Ok(expr)
}

fn parse_expr(tokens: &[Token], pos: &mut usize) -> Result<Expr, FilterError> {
    let Some(token) = tokens.get(*pos) else {
        return Err(FilterError::MismatchedParen);
    };
    *pos += 1;
    match token {
        Token::Atom(s) => Ok(Expr::Atom(s.clone())),
        Token::Str(s) => Ok(Expr::Str(s.clone())),
        Token::Int(n) => Ok(Expr::Int(*n)),
        Token::Close => Err(FilterError::MismatchedParen),
        Token::Open => {
            let mut items = Vec::new();
            loop {
                match tokens.get(*pos) {
                    None => return Err(FilterError::MismatchedParen),
                    Some(Token::Close) => {
                        *pos += 1;
                        return Ok(Expr::List(items));
                    }
                    Some(_) => items.push(parse_expr(tokens, pos)?),
                }
            }
        }
    }
}
