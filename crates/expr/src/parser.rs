use serde_json::Value;

use crate::lexer::{Spanned, Token, tokenize};
use crate::{ERR_EXPR_PARSE, ExpressionError};

// Guards the recursive descent against pathological nesting in config documents.
const MAX_DEPTH: usize = 128;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Expr {
    Literal(Value),
    Root,
    This,
    Ident(String),
    Property {
        target: Box<Expr>,
        name: String,
        safe: bool,
    },
    Index {
        target: Box<Expr>,
        index: Box<Expr>,
    },
    Method {
        target: Box<Expr>,
        name: String,
        args: Vec<Expr>,
        safe: bool,
    },
    Static {
        type_name: String,
        method: String,
        args: Vec<Expr>,
    },
    Projection {
        target: Box<Expr>,
        expr: Box<Expr>,
    },
    Selection {
        target: Box<Expr>,
        predicate: Box<Expr>,
    },
    List(Vec<Expr>),
    Map(Vec<(String, Expr)>),
    Not(Box<Expr>),
    Neg(Box<Expr>),
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Ternary {
        cond: Box<Expr>,
        then: Box<Expr>,
        otherwise: Box<Expr>,
    },
    Elvis {
        value: Box<Expr>,
        fallback: Box<Expr>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BinaryOp {
    Or,
    And,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

pub(crate) fn parse(source: &str) -> Result<Expr, ExpressionError> {
    let tokens = tokenize(source)?;
    let mut parser = Parser {
        source,
        tokens,
        pos: 0,
        depth: 0,
    };
    if parser.tokens.is_empty() {
        return Err(parser.error("expression is empty"));
    }
    let expr = parser.expression()?;
    if parser.pos != parser.tokens.len() {
        return Err(parser.unexpected());
    }
    Ok(expr)
}

struct Parser<'a> {
    source: &'a str,
    tokens: Vec<Spanned>,
    pos: usize,
    depth: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.pos + offset).map(|(t, _)| t)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(t, _)| t.clone());
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: Token, what: &str) -> Result<(), ExpressionError> {
        if self.eat(&expected) {
            Ok(())
        } else {
            Err(self.error(format!("expected {}", what)))
        }
    }

    fn error(&self, message: impl Into<String>) -> ExpressionError {
        let offset = self
            .tokens
            .get(self.pos)
            .map(|(_, span)| span.start)
            .unwrap_or(self.source.len());
        ExpressionError::new(
            ERR_EXPR_PARSE,
            format!(
                "{} at offset {} in `{}`",
                message.into(),
                offset,
                self.source
            ),
        )
    }

    fn unexpected(&self) -> ExpressionError {
        match self.tokens.get(self.pos) {
            Some((_, span)) => self.error(format!("unexpected `{}`", &self.source[span.clone()])),
            None => self.error("unexpected end of expression"),
        }
    }

    fn enter(&mut self) -> Result<(), ExpressionError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(self.error("expression nested too deeply"));
        }
        Ok(())
    }

    fn expression(&mut self) -> Result<Expr, ExpressionError> {
        self.enter()?;
        let expr = self.ternary();
        self.depth -= 1;
        expr
    }

    fn ternary(&mut self) -> Result<Expr, ExpressionError> {
        let cond = self.or()?;
        if self.eat(&Token::Question) {
            let then = self.expression()?;
            self.expect(Token::Colon, "`:` in ternary expression")?;
            let otherwise = self.expression()?;
            return Ok(Expr::Ternary {
                cond: Box::new(cond),
                then: Box::new(then),
                otherwise: Box::new(otherwise),
            });
        }
        if self.eat(&Token::Elvis) {
            let fallback = self.expression()?;
            return Ok(Expr::Elvis {
                value: Box::new(cond),
                fallback: Box::new(fallback),
            });
        }
        Ok(cond)
    }

    fn or(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.and()?;
        while self.eat(&Token::Or) {
            let right = self.and()?;
            left = binary(BinaryOp::Or, left, right);
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.equality()?;
        while self.eat(&Token::And) {
            let right = self.equality()?;
            left = binary(BinaryOp::And, left, right);
        }
        Ok(left)
    }

    fn equality(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.relational()?;
        loop {
            let op = match self.peek() {
                Some(Token::Eq) => BinaryOp::Eq,
                Some(Token::Ne) => BinaryOp::Ne,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.relational()?;
            left = binary(op, left, right);
        }
    }

    fn relational(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.additive()?;
        loop {
            let op = match self.peek() {
                Some(Token::Lt) => BinaryOp::Lt,
                Some(Token::Le) => BinaryOp::Le,
                Some(Token::Gt) => BinaryOp::Gt,
                Some(Token::Ge) => BinaryOp::Ge,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.additive()?;
            left = binary(op, left, right);
        }
    }

    fn additive(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.multiplicative()?;
            left = binary(op, left, right);
        }
    }

    fn multiplicative(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                Some(Token::Percent) => BinaryOp::Rem,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.unary()?;
            left = binary(op, left, right);
        }
    }

    fn unary(&mut self) -> Result<Expr, ExpressionError> {
        if self.eat(&Token::Not) {
            self.enter()?;
            let inner = self.unary();
            self.depth -= 1;
            return Ok(Expr::Not(Box::new(inner?)));
        }
        if self.eat(&Token::Minus) {
            self.enter()?;
            let inner = self.unary();
            self.depth -= 1;
            return Ok(Expr::Neg(Box::new(inner?)));
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Result<Expr, ExpressionError> {
        let mut expr = self.primary()?;
        loop {
            match self.peek() {
                Some(Token::Dot) | Some(Token::SafeDot) => {
                    let safe = self.peek() == Some(&Token::SafeDot);
                    self.pos += 1;
                    let Some(Token::Ident(name)) = self.advance() else {
                        self.pos -= 1;
                        return Err(self.error("expected property or method name"));
                    };
                    if self.eat(&Token::LParen) {
                        let args = self.arguments()?;
                        expr = Expr::Method {
                            target: Box::new(expr),
                            name,
                            args,
                            safe,
                        };
                    } else {
                        expr = Expr::Property {
                            target: Box::new(expr),
                            name,
                            safe,
                        };
                    }
                }
                Some(Token::LBracket) => {
                    self.pos += 1;
                    let index = self.expression()?;
                    self.expect(Token::RBracket, "`]`")?;
                    expr = Expr::Index {
                        target: Box::new(expr),
                        index: Box::new(index),
                    };
                }
                Some(Token::ProjectOpen) => {
                    self.pos += 1;
                    let inner = self.expression()?;
                    self.expect(Token::RBracket, "`]` closing projection")?;
                    expr = Expr::Projection {
                        target: Box::new(expr),
                        expr: Box::new(inner),
                    };
                }
                Some(Token::SelectOpen) => {
                    self.pos += 1;
                    let predicate = self.expression()?;
                    self.expect(Token::RBracket, "`]` closing selection")?;
                    expr = Expr::Selection {
                        target: Box::new(expr),
                        predicate: Box::new(predicate),
                    };
                }
                _ => return Ok(expr),
            }
        }
    }

    // Called after the opening `(` has been consumed.
    fn arguments(&mut self) -> Result<Vec<Expr>, ExpressionError> {
        let mut args = Vec::new();
        if self.eat(&Token::RParen) {
            return Ok(args);
        }
        loop {
            args.push(self.expression()?);
            if self.eat(&Token::RParen) {
                return Ok(args);
            }
            self.expect(Token::Comma, "`,` or `)` in argument list")?;
        }
    }

    fn primary(&mut self) -> Result<Expr, ExpressionError> {
        let Some(token) = self.advance() else {
            return Err(self.error("unexpected end of expression"));
        };
        match token {
            Token::True => Ok(Expr::Literal(Value::Bool(true))),
            Token::False => Ok(Expr::Literal(Value::Bool(false))),
            Token::Null => Ok(Expr::Literal(Value::Null)),
            Token::Int(v) => Ok(Expr::Literal(Value::from(v))),
            Token::Float(v) => Ok(Expr::Literal(Value::from(v))),
            Token::Str(v) => Ok(Expr::Literal(Value::String(v))),
            Token::Var(name) => match name.as_str() {
                "root" => Ok(Expr::Root),
                "this" => Ok(Expr::This),
                _ => {
                    self.pos -= 1;
                    Err(self.error(format!("unknown variable `#{}`", name)))
                }
            },
            Token::Ident(name) if name == "T" && self.peek() == Some(&Token::LParen) => {
                self.static_call()
            }
            Token::Ident(name) => Ok(Expr::Ident(name)),
            Token::LParen => {
                let inner = self.expression()?;
                self.expect(Token::RParen, "`)`")?;
                Ok(inner)
            }
            Token::LBrace => self.inline_collection(),
            _ => {
                self.pos -= 1;
                Err(self.unexpected())
            }
        }
    }

    // `T(Type).method(args)`; only the last segment of a dotted type name matters.
    fn static_call(&mut self) -> Result<Expr, ExpressionError> {
        self.expect(Token::LParen, "`(` after `T`")?;
        let mut type_name = String::new();
        loop {
            let Some(Token::Ident(segment)) = self.advance() else {
                self.pos -= 1;
                return Err(self.error("expected type name"));
            };
            type_name = segment;
            if !self.eat(&Token::Dot) {
                break;
            }
        }
        self.expect(Token::RParen, "`)` closing type reference")?;
        self.expect(Token::Dot, "`.` after type reference")?;
        let Some(Token::Ident(method)) = self.advance() else {
            self.pos -= 1;
            return Err(self.error("expected static method name"));
        };
        self.expect(Token::LParen, "`(` after static method name")?;
        let args = self.arguments()?;
        Ok(Expr::Static {
            type_name,
            method,
            args,
        })
    }

    // Called after `{`. `{}` is an empty list, `{:}` an empty map.
    fn inline_collection(&mut self) -> Result<Expr, ExpressionError> {
        if self.eat(&Token::RBrace) {
            return Ok(Expr::List(Vec::new()));
        }
        if self.peek() == Some(&Token::Colon) && self.peek_at(1) == Some(&Token::RBrace) {
            self.pos += 2;
            return Ok(Expr::Map(Vec::new()));
        }

        let first = self.expression()?;
        if self.eat(&Token::Colon) {
            let mut entries = Vec::new();
            let key = self.map_key(first)?;
            entries.push((key, self.expression()?));
            while self.eat(&Token::Comma) {
                let key_expr = self.expression()?;
                let key = self.map_key(key_expr)?;
                self.expect(Token::Colon, "`:` in inline map")?;
                entries.push((key, self.expression()?));
            }
            self.expect(Token::RBrace, "`}` closing inline map")?;
            return Ok(Expr::Map(entries));
        }

        let mut items = vec![first];
        while self.eat(&Token::Comma) {
            items.push(self.expression()?);
        }
        self.expect(Token::RBrace, "`}` closing inline list")?;
        Ok(Expr::List(items))
    }

    fn map_key(&self, key: Expr) -> Result<String, ExpressionError> {
        match key {
            Expr::Ident(name) => Ok(name),
            Expr::Literal(Value::String(s)) => Ok(s),
            Expr::Literal(Value::Number(n)) => Ok(n.to_string()),
            Expr::Literal(Value::Bool(b)) => Ok(b.to_string()),
            _ => Err(self.error("inline map keys must be names or literals")),
        }
    }
}

fn binary(op: BinaryOp, left: Expr, right: Expr) -> Expr {
    Expr::Binary {
        op,
        left: Box::new(left),
        right: Box::new(right),
    }
}
