//! Pratt parser producing the expression AST.
//!
//! Precedence, loosest to tightest: ternary `?:` (right-associative),
//! `or`, `and`, prefix `not`, comparisons, `|`, `^`, `&`, shifts, `+`/`-`,
//! `*`/`/`/`%`, unary `-`, then member access / indexing / method calls.
//! The generic cast form `.as<...>` is parsed and erased.

use crate::errors::{Error, Result};
use crate::expr::lexer::{tokenize, Token};
use num_bigint::BigInt;

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Int(i64),
    BigInt(BigInt),
    Float(f64),
    Str(String),
    Bool(bool),
    Array(Vec<Expr>),
    Ident(String),
    /// `segment::segment::member`; at least two segments.
    EnumRef(Vec<String>),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Ternary {
        cond: Box<Expr>,
        then: Box<Expr>,
        otherwise: Box<Expr>,
    },
    Member(Box<Expr>, String),
    Call(Box<Expr>, String, Vec<Expr>),
    Index(Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
}

/// Parses a complete expression; trailing tokens are an error.
pub fn parse_expr(src: &str) -> Result<Expr> {
    let mut p = Parser::new(src)?;
    let expr = p.parse_bp(0)?;
    p.expect_end()?;
    Ok(expr)
}

/// Parses a comma-separated list of expressions (type/process arguments).
pub fn parse_arg_list(src: &str) -> Result<Vec<Expr>> {
    let mut p = Parser::new(src)?;
    let mut args = Vec::new();
    if p.peek().is_none() {
        return Ok(args);
    }
    loop {
        args.push(p.parse_bp(0)?);
        match p.next() {
            Some(Token::Comma) => continue,
            None => return Ok(args),
            Some(tok) => return Err(Error::parse(format!("unexpected token {tok:?} in argument list"))),
        }
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn new(src: &str) -> Result<Parser> {
        Ok(Parser {
            tokens: tokenize(src)?,
            pos: 0,
        })
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn expect(&mut self, want: &Token) -> Result<()> {
        match self.next() {
            Some(ref tok) if tok == want => Ok(()),
            other => Err(Error::parse(format!("expected {want:?}, found {other:?}"))),
        }
    }

    fn expect_end(&mut self) -> Result<()> {
        match self.peek() {
            None => Ok(()),
            Some(tok) => Err(Error::parse(format!(
                "trailing tokens in expression, starting at {tok:?}"
            ))),
        }
    }

    fn expect_ident(&mut self) -> Result<String> {
        match self.next() {
            Some(Token::Ident(name)) => Ok(name),
            other => Err(Error::parse(format!("expected identifier, found {other:?}"))),
        }
    }

    fn parse_bp(&mut self, min_bp: u8) -> Result<Expr> {
        let mut lhs = self.parse_prefix()?;

        loop {
            lhs = match self.peek() {
                Some(Token::Dot) if POSTFIX_BP >= min_bp => {
                    self.next();
                    self.parse_postfix_member(lhs)?
                }
                Some(Token::LBracket) if POSTFIX_BP >= min_bp => {
                    self.next();
                    let idx = self.parse_bp(0)?;
                    self.expect(&Token::RBracket)?;
                    Expr::Index(Box::new(lhs), Box::new(idx))
                }
                Some(Token::Question) if TERNARY_BP >= min_bp => {
                    self.next();
                    let then = self.parse_bp(0)?;
                    self.expect(&Token::Colon)?;
                    // Right-associative: the else branch may itself be a ternary.
                    let otherwise = self.parse_bp(TERNARY_BP - 1)?;
                    Expr::Ternary {
                        cond: Box::new(lhs),
                        then: Box::new(then),
                        otherwise: Box::new(otherwise),
                    }
                }
                Some(tok) => {
                    let Some((op, lbp)) = binary_op(tok) else {
                        break;
                    };
                    if lbp < min_bp {
                        break;
                    }
                    self.next();
                    let rhs = self.parse_bp(lbp + 1)?;
                    Expr::Binary(op, Box::new(lhs), Box::new(rhs))
                }
                None => break,
            };
        }
        Ok(lhs)
    }

    fn parse_prefix(&mut self) -> Result<Expr> {
        match self.next() {
            Some(Token::Int(v)) => Ok(Expr::Int(v)),
            Some(Token::BigInt(v)) => Ok(Expr::BigInt(v)),
            Some(Token::Float(v)) => Ok(Expr::Float(v)),
            Some(Token::Str(s)) => Ok(Expr::Str(s)),
            Some(Token::Minus) => {
                let operand = self.parse_bp(NEG_BP)?;
                Ok(Expr::Unary(UnaryOp::Neg, Box::new(operand)))
            }
            Some(Token::Ident(name)) if name == "not" => {
                let operand = self.parse_bp(NOT_BP)?;
                Ok(Expr::Unary(UnaryOp::Not, Box::new(operand)))
            }
            Some(Token::Ident(name)) if name == "true" => Ok(Expr::Bool(true)),
            Some(Token::Ident(name)) if name == "false" => Ok(Expr::Bool(false)),
            Some(Token::Ident(name)) => {
                if self.peek() == Some(&Token::DoubleColon) {
                    let mut path = vec![name];
                    while self.peek() == Some(&Token::DoubleColon) {
                        self.next();
                        path.push(self.expect_ident()?);
                    }
                    Ok(Expr::EnumRef(path))
                } else {
                    Ok(Expr::Ident(name))
                }
            }
            Some(Token::LParen) => {
                let inner = self.parse_bp(0)?;
                self.expect(&Token::RParen)?;
                Ok(inner)
            }
            Some(Token::LBracket) => {
                let mut items = Vec::new();
                if self.peek() == Some(&Token::RBracket) {
                    self.next();
                    return Ok(Expr::Array(items));
                }
                loop {
                    items.push(self.parse_bp(0)?);
                    match self.next() {
                        Some(Token::Comma) => continue,
                        Some(Token::RBracket) => break,
                        other => {
                            return Err(Error::parse(format!(
                                "expected `,` or `]` in array literal, found {other:?}"
                            )))
                        }
                    }
                }
                Ok(Expr::Array(items))
            }
            other => Err(Error::parse(format!(
                "expected expression, found {other:?}"
            ))),
        }
    }

    fn parse_postfix_member(&mut self, recv: Expr) -> Result<Expr> {
        let name = self.expect_ident()?;

        // `.as<...>` is a type ascription with no runtime meaning: skip the
        // angle-bracketed payload and yield the receiver untouched.
        if name == "as" && self.peek() == Some(&Token::Lt) {
            self.next();
            let mut depth = 1usize;
            while depth > 0 {
                match self.next() {
                    Some(Token::Lt) => depth += 1,
                    Some(Token::Gt) => depth -= 1,
                    Some(_) => {}
                    None => return Err(Error::parse("unterminated `.as<...>` cast")),
                }
            }
            return Ok(recv);
        }

        if self.peek() == Some(&Token::LParen) {
            self.next();
            let mut args = Vec::new();
            if self.peek() == Some(&Token::RParen) {
                self.next();
                return Ok(Expr::Call(Box::new(recv), name, args));
            }
            loop {
                args.push(self.parse_bp(0)?);
                match self.next() {
                    Some(Token::Comma) => continue,
                    Some(Token::RParen) => break,
                    other => {
                        return Err(Error::parse(format!(
                            "expected `,` or `)` in call, found {other:?}"
                        )))
                    }
                }
            }
            return Ok(Expr::Call(Box::new(recv), name, args));
        }

        Ok(Expr::Member(Box::new(recv), name))
    }
}

const TERNARY_BP: u8 = 2;
const NOT_BP: u8 = 8;
const NEG_BP: u8 = 24;
const POSTFIX_BP: u8 = 26;

fn binary_op(tok: &Token) -> Option<(BinaryOp, u8)> {
    Some(match tok {
        Token::Ident(name) if name == "or" => (BinaryOp::Or, 4),
        Token::Ident(name) if name == "and" => (BinaryOp::And, 6),
        Token::EqEq => (BinaryOp::Eq, 10),
        Token::NotEq => (BinaryOp::Ne, 10),
        Token::Lt => (BinaryOp::Lt, 10),
        Token::Le => (BinaryOp::Le, 10),
        Token::Gt => (BinaryOp::Gt, 10),
        Token::Ge => (BinaryOp::Ge, 10),
        Token::Pipe => (BinaryOp::BitOr, 12),
        Token::Caret => (BinaryOp::BitXor, 14),
        Token::Amp => (BinaryOp::BitAnd, 16),
        Token::Shl => (BinaryOp::Shl, 18),
        Token::Shr => (BinaryOp::Shr, 18),
        Token::Plus => (BinaryOp::Add, 20),
        Token::Minus => (BinaryOp::Sub, 20),
        Token::Star => (BinaryOp::Mul, 22),
        Token::Slash => (BinaryOp::Div, 22),
        Token::Percent => (BinaryOp::Mod, 22),
        _ => return None,
    })
}
