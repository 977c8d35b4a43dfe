//! Recursive-descent parser for the condition DSL.
//!
//! Precedence, loosest to tightest: `or`, `and`, `not`, comparisons.
//! `not` therefore negates a whole comparison (`not a == b` is `!(a == b)`)
//! while still binding tighter than `and` and `or`.

use crate::lexer::Token;
use crate::value::Value;

/// Comparison operator between two operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    /// `==`
    Eq,
    /// `!=`
    Ne,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
    /// `in`
    In,
    /// `not in`
    NotIn,
    /// `contains`
    Contains,
    /// `startswith`
    StartsWith,
    /// `endswith`
    EndsWith,
    /// `matches`
    Matches,
}

/// Parsed expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Literal value.
    Literal(Value),
    /// Identifier resolved against the context at evaluation time.
    Ident(String),
    /// Bracketed list of operands.
    List(Vec<Expr>),
    /// Logical negation.
    Not(Box<Expr>),
    /// Short-circuit conjunction.
    And(Box<Expr>, Box<Expr>),
    /// Short-circuit disjunction.
    Or(Box<Expr>, Box<Expr>),
    /// Binary comparison.
    Compare {
        /// Operator.
        op: CmpOp,
        /// Left operand.
        lhs: Box<Expr>,
        /// Right operand.
        rhs: Box<Expr>,
    },
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
}

/// Parse a token stream into an expression. Errors are plain messages; the
/// caller attaches the offending expression.
pub fn parse(tokens: &[Token]) -> Result<Expr, String> {
    if tokens.is_empty() {
        return Err("Empty expression".to_string());
    }
    let mut p = Parser { tokens, pos: 0 };
    let expr = p.or_expr()?;
    match p.peek() {
        None => Ok(expr),
        Some(Token::RParen) => Err("Unbalanced parentheses".to_string()),
        Some(tok) => Err(format!("Unexpected trailing {}", describe(tok))),
    }
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&'a Token> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<&'a Token> {
        let tok = self.tokens.get(self.pos);
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn or_expr(&mut self) -> Result<Expr, String> {
        let mut lhs = self.and_expr()?;
        while self.peek() == Some(&Token::Or) {
            self.bump();
            let rhs = self.and_expr()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and_expr(&mut self) -> Result<Expr, String> {
        let mut lhs = self.not_expr()?;
        while self.peek() == Some(&Token::And) {
            self.bump();
            let rhs = self.not_expr()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn not_expr(&mut self) -> Result<Expr, String> {
        if self.peek() == Some(&Token::Not) {
            self.bump();
            let inner = self.not_expr()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr, String> {
        let lhs = self.operand()?;
        let op = match self.peek() {
            Some(Token::Eq) => CmpOp::Eq,
            Some(Token::Ne) => CmpOp::Ne,
            Some(Token::Lt) => CmpOp::Lt,
            Some(Token::Le) => CmpOp::Le,
            Some(Token::Gt) => CmpOp::Gt,
            Some(Token::Ge) => CmpOp::Ge,
            Some(Token::In) => CmpOp::In,
            Some(Token::Contains) => CmpOp::Contains,
            Some(Token::StartsWith) => CmpOp::StartsWith,
            Some(Token::EndsWith) => CmpOp::EndsWith,
            Some(Token::Matches) => CmpOp::Matches,
            Some(Token::Not) if self.tokens.get(self.pos + 1) == Some(&Token::In) => {
                self.bump();
                CmpOp::NotIn
            }
            _ => return Ok(lhs),
        };
        self.bump();
        let rhs = self.operand()?;
        Ok(Expr::Compare { op, lhs: Box::new(lhs), rhs: Box::new(rhs) })
    }

    fn operand(&mut self) -> Result<Expr, String> {
        match self.bump() {
            Some(Token::Int(n)) => Ok(Expr::Literal(Value::Int(*n))),
            Some(Token::Float(f)) => Ok(Expr::Literal(Value::Float(*f))),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::Str(s.clone()))),
            Some(Token::True) => Ok(Expr::Literal(Value::Bool(true))),
            Some(Token::False) => Ok(Expr::Literal(Value::Bool(false))),
            Some(Token::Null) => Ok(Expr::Literal(Value::Null)),
            Some(Token::Ident(name)) => Ok(Expr::Ident(name.clone())),
            Some(Token::LBracket) => self.list_tail(),
            Some(Token::LParen) => {
                let inner = self.or_expr()?;
                match self.bump() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err("Unbalanced parentheses".to_string()),
                }
            }
            Some(tok) => Err(format!("Expected operand, found {}", describe(tok))),
            None => Err("Expected operand, found end of expression".to_string()),
        }
    }

    fn list_tail(&mut self) -> Result<Expr, String> {
        let mut items = Vec::new();
        if self.peek() == Some(&Token::RBracket) {
            self.bump();
            return Ok(Expr::List(items));
        }
        loop {
            items.push(self.operand()?);
            match self.bump() {
                Some(Token::Comma) => continue,
                Some(Token::RBracket) => return Ok(Expr::List(items)),
                Some(tok) => return Err(format!("Expected ',' or ']', found {}", describe(tok))),
                None => return Err("Unterminated list".to_string()),
            }
        }
    }
}

fn describe(tok: &Token) -> String {
    match tok {
        Token::Ident(name) => format!("identifier '{name}'"),
        Token::Str(s) => format!("string '{s}'"),
        Token::Int(n) => format!("number {n}"),
        Token::Float(f) => format!("number {f}"),
        Token::True => "'true'".to_string(),
        Token::False => "'false'".to_string(),
        Token::Null => "'null'".to_string(),
        Token::And => "'and'".to_string(),
        Token::Or => "'or'".to_string(),
        Token::Not => "'not'".to_string(),
        Token::In => "'in'".to_string(),
        Token::Contains => "'contains'".to_string(),
        Token::StartsWith => "'startswith'".to_string(),
        Token::EndsWith => "'endswith'".to_string(),
        Token::Matches => "'matches'".to_string(),
        Token::Eq => "'=='".to_string(),
        Token::Ne => "'!='".to_string(),
        Token::Lt => "'<'".to_string(),
        Token::Le => "'<='".to_string(),
        Token::Gt => "'>'".to_string(),
        Token::Ge => "'>='".to_string(),
        Token::LParen => "'('".to_string(),
        Token::RParen => "')'".to_string(),
        Token::LBracket => "'['".to_string(),
        Token::RBracket => "']'".to_string(),
        Token::Comma => "','".to_string(),
    }
}
