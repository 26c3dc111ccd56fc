//! Tokenizer. Uses `logos` for the mechanical token classes (numbers,
//! identifiers, punctuation) and a small hand-written pass on top for the
//! two context-sensitive rules the source language's scenarios require:
//! a leading `-` immediately before a numeric literal lexes as a signed
//! literal only when it cannot be a binary minus, and string literals
//! decode `\xHH` escapes through [`crate::unicode`] so an ill-formed escape
//! sequence surfaces as a single `Invalid` token instead of panicking.

use logos::Logos;

use crate::ast::Pos;
use crate::unicode;

#[derive(Logos, Debug, Clone, PartialEq)]
enum Raw {
    #[regex(r"[0-9]+\.[0-9]+", |lex| lex.slice().parse::<f64>().ok())]
    Float(f64),

    #[regex(r"0[xX][0-9a-fA-F]+", |lex| i64::from_str_radix(&lex.slice()[2..], 16).ok())]
    HexInt(i64),

    #[regex(r"0[bB][01]+", |lex| i64::from_str_radix(&lex.slice()[2..], 2).ok())]
    BinInt(i64),

    #[regex(r"[0-9]+", |lex| lex.slice().parse::<i64>().ok())]
    Int(i64),

    #[regex(r#""([^"\\]|\\.)*""#, |lex| lex.slice().to_string())]
    Str(String),

    #[regex(r"[A-Za-z_][A-Za-z0-9_]*", |lex| lex.slice().to_string())]
    Ident(String),

    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Star,
    #[token("/")]
    Slash,
    #[token("%")]
    Percent,
    #[token("==")]
    EqEq,
    #[token("!=")]
    NotEq,
    #[token("<=")]
    LtEq,
    #[token(">=")]
    GtEq,
    #[token("<")]
    Lt,
    #[token(">")]
    Gt,
    #[token("=")]
    Eq,
    #[token(".")]
    Dot,
    #[token(",")]
    Comma,
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("{")]
    LBrace,
    #[token("}")]
    RBrace,
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,

    #[regex(r"[ \t\r\n]+", logos::skip)]
    #[regex(r"#[^\n]*", logos::skip)]
    Skip,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Float(f64),
    Int(i64),
    Str(String),
    Ident(String),
    Keyword(Keyword),
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    EqEq,
    NotEq,
    LtEq,
    GtEq,
    Lt,
    Gt,
    Eq,
    Dot,
    Comma,
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Invalid,
    Eof,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keyword {
    Func,
    Class,
    Import,
    For,
    In,
    Var,
    Const,
    Return,
    If,
    Else,
    While,
    Self_,
    Base,
    True,
    False,
    None,
    And,
    Or,
    Not,
}

fn keyword(ident: &str) -> Option<Keyword> {
    Some(match ident {
        "func" => Keyword::Func,
        "class" => Keyword::Class,
        "import" => Keyword::Import,
        "for" => Keyword::For,
        "in" => Keyword::In,
        "var" => Keyword::Var,
        "const" => Keyword::Const,
        "return" => Keyword::Return,
        "if" => Keyword::If,
        "else" => Keyword::Else,
        "while" => Keyword::While,
        "self" => Keyword::Self_,
        "base" => Keyword::Base,
        "true" => Keyword::True,
        "false" => Keyword::False,
        "none" => Keyword::None,
        "and" => Keyword::And,
        "or" => Keyword::Or,
        "not" => Keyword::Not,
        _ => return Option::None,
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    pub token: Token,
    pub pos: Pos,
}

/// Decode a quoted string slice (including the surrounding `"`) into its
/// text, or `None` if an escape produces ill-formed UTF-8 once decoded
/// through [`unicode::utf32_to_utf8`] without the surrogate-escape rule.
fn decode_string_literal(raw: &str) -> Option<String> {
    let inner = &raw[1..raw.len() - 1];
    let mut bytes = Vec::with_capacity(inner.len());
    let mut chars = inner.char_indices().peekable();
    while let Some((_, c)) = chars.next() {
        if c != '\\' {
            let mut buf = [0u8; 4];
            bytes.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            continue;
        }
        match chars.next() {
            Some((_, 'n')) => bytes.push(b'\n'),
            Some((_, 't')) => bytes.push(b'\t'),
            Some((_, '"')) => bytes.push(b'"'),
            Some((_, '\\')) => bytes.push(b'\\'),
            Some((_, 'x')) => {
                let hi = chars.next()?.1.to_digit(16)?;
                let lo = chars.next()?.1.to_digit(16)?;
                bytes.push(((hi << 4) | lo) as u8);
            }
            _ => return None,
        }
    }
    // surrogate_replace = false here: a malformed escape sequence must
    // surface as a single Invalid token, per scenario 3.
    match unicode::utf8_to_utf32(&bytes, false) {
        Ok(codepoints) => {
            let reencoded = unicode::utf32_to_utf8(&codepoints);
            String::from_utf8(reencoded).ok()
        }
        Err(_) => None,
    }
}

/// Tokenize `source`, applying the signed-literal contextual merge: a
/// `Minus` immediately followed by `Int`/`Float` is folded into a negated
/// literal unless the previous emitted token could end an expression
/// (making the `-` a binary operator instead).
pub fn tokenize(source: &str) -> Vec<Spanned> {
    let mut out: Vec<Spanned> = Vec::new();
    let mut lex = Raw::lexer(source);
    let mut line: u32 = 1;
    let mut line_start: usize = 0;

    while let Some(result) = lex.next() {
        let span = lex.span();
        let column = (span.start - line_start) as u32 + 1;
        let pos = Pos { line, column };
        let consumed_newlines = source[span.start..span.end].matches('\n').count() as u32;

        let token = match result {
            Err(()) => Token::Invalid,
            Ok(Raw::Skip) => unreachable!("skip patterns never produce a token"),
            Ok(Raw::Float(f)) => Token::Float(f),
            Ok(Raw::HexInt(i)) | Ok(Raw::BinInt(i)) | Ok(Raw::Int(i)) => Token::Int(i),
            Ok(Raw::Str(s)) => match decode_string_literal(&s) {
                Some(text) => Token::Str(text),
                Option::None => Token::Invalid,
            },
            Ok(Raw::Ident(name)) => match keyword(&name) {
                Some(kw) => Token::Keyword(kw),
                Option::None => Token::Ident(name),
            },
            Ok(Raw::Plus) => Token::Plus,
            Ok(Raw::Minus) => Token::Minus,
            Ok(Raw::Star) => Token::Star,
            Ok(Raw::Slash) => Token::Slash,
            Ok(Raw::Percent) => Token::Percent,
            Ok(Raw::EqEq) => Token::EqEq,
            Ok(Raw::NotEq) => Token::NotEq,
            Ok(Raw::LtEq) => Token::LtEq,
            Ok(Raw::GtEq) => Token::GtEq,
            Ok(Raw::Lt) => Token::Lt,
            Ok(Raw::Gt) => Token::Gt,
            Ok(Raw::Eq) => Token::Eq,
            Ok(Raw::Dot) => Token::Dot,
            Ok(Raw::Comma) => Token::Comma,
            Ok(Raw::LParen) => Token::LParen,
            Ok(Raw::RParen) => Token::RParen,
            Ok(Raw::LBrace) => Token::LBrace,
            Ok(Raw::RBrace) => Token::RBrace,
            Ok(Raw::LBracket) => Token::LBracket,
            Ok(Raw::RBracket) => Token::RBracket,
        };

        if matches!(token, Token::Minus) {
            out.push(Spanned { token, pos });
        } else if let (Token::Int(_), Some(prev)) = (&token, out.last()) {
            if prev.token == Token::Minus && !precedes_unary_context(&out, out.len() - 1) {
                let last = out.pop().unwrap();
                if let Token::Int(v) = token {
                    out.push(Spanned { token: Token::Int(-v), pos: last.pos });
                }
            } else {
                out.push(Spanned { token, pos });
            }
        } else if let (Token::Float(_), Some(prev)) = (&token, out.last()) {
            if prev.token == Token::Minus && !precedes_unary_context(&out, out.len() - 1) {
                let last = out.pop().unwrap();
                if let Token::Float(v) = token {
                    out.push(Spanned { token: Token::Float(-v), pos: last.pos });
                }
            } else {
                out.push(Spanned { token, pos });
            }
        } else {
            out.push(Spanned { token, pos });
        }

        line += consumed_newlines;
        if consumed_newlines > 0 {
            if let Some(idx) = source[..span.end].rfind('\n') {
                line_start = idx + 1;
            }
        }
    }

    out.push(Spanned { token: Token::Eof, pos: Pos { line, column: 1 } });
    out
}

/// True if the `Minus` token at `minus_idx` is preceded by a token that can
/// end an expression, meaning this `-` must be a binary operator rather
/// than part of a signed literal.
fn precedes_unary_context(tokens: &[Spanned], minus_idx: usize) -> bool {
    if minus_idx == 0 {
        return false;
    }
    matches!(
        tokens[minus_idx - 1].token,
        Token::Int(_) | Token::Float(_) | Token::Str(_) | Token::Ident(_) | Token::RParen | Token::RBracket
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toks(src: &str) -> Vec<Token> {
        tokenize(src).into_iter().map(|s| s.token).collect()
    }

    #[test]
    fn scenario_1_mixed_numeric_literals() {
        let t = toks("1.5 + 0xA + 0b10");
        assert_eq!(t, vec![
            Token::Float(1.5), Token::Plus, Token::Int(10), Token::Plus, Token::Int(2), Token::Eof,
        ]);
        assert_eq!(t.len(), 6); // five real tokens + Eof
    }

    #[test]
    fn scenario_2_leading_minus_is_signed_literal() {
        assert_eq!(toks("-10"), vec![Token::Int(-10), Token::Eof]);
        assert_eq!(toks("1-10"), vec![Token::Int(1), Token::Minus, Token::Int(10), Token::Eof]);
    }

    #[test]
    fn scenario_3_string_literal_and_invalid_escape() {
        assert_eq!(toks(r#""\xc3\xb6""#), vec![Token::Str("\u{f6}".to_string()), Token::Eof]);
        assert_eq!(toks(r#""\xc3\xc3""#), vec![Token::Invalid, Token::Eof]);
    }
}
