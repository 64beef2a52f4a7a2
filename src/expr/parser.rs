//! Recursive-descent parser for the predicate and template expression
//! language.
//!
//! Grammar, loosest binding first:
//!
//! ```text
//! expr       := or
//! or         := and ("||" and)*
//! and        := cmp ("&&" cmp)*
//! cmp        := term (("==" | "!=" | "<" | "<=" | ">" | ">=" | "in") term)?
//! unary      := "!" unary | postfix
//! postfix    := primary ("." ident [ "(" args ")" ] | "[" expr "]")*
//! primary    := literal | ident | "(" expr ")" | "[" args "]" | ident "(" args ")"
//! ```

use super::ExprError;

/// Parsed expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(super::Value),
    Variable(String),
    List(Vec<Expr>),
    Member(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    /// Free function call, e.g. `split(resourceId, '/')`.
    Call(String, Vec<Expr>),
    /// Method call on a receiver, e.g. `user.name.startsWith('system:')`.
    Method(Box<Expr>, String, Vec<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(f64),
    Punct(&'static str),
}

struct Lexer<'a> {
    src: &'a str,
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src,
            bytes: src.as_bytes(),
            pos: 0,
        }
    }

    fn error(&self, message: impl Into<String>) -> ExprError {
        ExprError::Parse {
            offset: self.pos,
            message: message.into(),
        }
    }

    fn tokens(mut self) -> Result<Vec<(usize, Token)>, ExprError> {
        let mut out = Vec::new();
        while self.pos < self.bytes.len() {
            let start = self.pos;
            let c = self.bytes[self.pos];
            match c {
                b' ' | b'\t' | b'\r' | b'\n' => {
                    self.pos += 1;
                }
                b'\'' | b'"' => {
                    let quote = c;
                    self.pos += 1;
                    let mut value = String::new();
                    loop {
                        match self.bytes.get(self.pos) {
                            None => return Err(self.error("unterminated string literal")),
                            Some(&b) if b == quote => {
                                self.pos += 1;
                                break;
                            }
                            Some(b'\\') => {
                                self.pos += 1;
                                match self.bytes.get(self.pos) {
                                    Some(b'n') => value.push('\n'),
                                    Some(b't') => value.push('\t'),
                                    Some(&b) => value.push(b as char),
                                    None => return Err(self.error("unterminated escape")),
                                }
                                self.pos += 1;
                            }
                            Some(_) => {
                                let ch = self.src[self.pos..].chars().next().unwrap();
                                value.push(ch);
                                self.pos += ch.len_utf8();
                            }
                        }
                    }
                    out.push((start, Token::Str(value)));
                }
                b'0'..=b'9' => {
                    while self
                        .bytes
                        .get(self.pos)
                        .is_some_and(|b| b.is_ascii_digit() || *b == b'.')
                    {
                        self.pos += 1;
                    }
                    let text = &self.src[start..self.pos];
                    let num = text
                        .parse::<f64>()
                        .map_err(|_| self.error(format!("invalid number {text:?}")))?;
                    out.push((start, Token::Num(num)));
                }
                b'a'..=b'z' | b'A'..=b'Z' | b'_' => {
                    while self
                        .bytes
                        .get(self.pos)
                        .is_some_and(|b| b.is_ascii_alphanumeric() || *b == b'_')
                    {
                        self.pos += 1;
                    }
                    out.push((start, Token::Ident(self.src[start..self.pos].to_string())));
                }
                _ => {
                    let two = self.src.get(self.pos..self.pos + 2);
                    let punct = match two {
                        Some(p @ ("==" | "!=" | "<=" | ">=" | "&&" | "||")) => {
                            self.pos += 2;
                            match p {
                                "==" => "==",
                                "!=" => "!=",
                                "<=" => "<=",
                                ">=" => ">=",
                                "&&" => "&&",
                                _ => "||",
                            }
                        }
                        _ => {
                            self.pos += 1;
                            match c {
                                b'(' => "(",
                                b')' => ")",
                                b'[' => "[",
                                b']' => "]",
                                b',' => ",",
                                b'.' => ".",
                                b'!' => "!",
                                b'<' => "<",
                                b'>' => ">",
                                _ => return Err(self.error(format!("unexpected character {:?}", c as char))),
                            }
                        }
                    };
                    out.push((start, Token::Punct(punct)));
                }
            }
        }
        Ok(out)
    }
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(_, t)| t.clone());
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn offset(&self) -> usize {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map(|(o, _)| *o)
            .unwrap_or(0)
    }

    fn error(&self, message: impl Into<String>) -> ExprError {
        ExprError::Parse {
            offset: self.offset(),
            message: message.into(),
        }
    }

    fn expect_punct(&mut self, punct: &'static str) -> Result<(), ExprError> {
        match self.next() {
            Some(Token::Punct(p)) if p == punct => Ok(()),
            other => Err(self.error(format!("expected {punct:?}, found {other:?}"))),
        }
    }

    fn expr(&mut self) -> Result<Expr, ExprError> {
        self.or_expr()
    }

    fn or_expr(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.and_expr()?;
        while self.check_punct("||") {
            self.pos += 1;
            let right = self.and_expr()?;
            left = Expr::Binary(BinaryOp::Or, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.cmp_expr()?;
        while self.check_punct("&&") {
            self.pos += 1;
            let right = self.cmp_expr()?;
            left = Expr::Binary(BinaryOp::And, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn check_punct(&self, punct: &str) -> bool {
        matches!(self.peek(), Some(Token::Punct(p)) if *p == punct)
    }

    fn check_ident(&self, ident: &str) -> bool {
        matches!(self.peek(), Some(Token::Ident(i)) if i == ident)
    }

    fn cmp_expr(&mut self) -> Result<Expr, ExprError> {
        let left = self.unary_expr()?;
        let op = if self.check_punct("==") {
            BinaryOp::Eq
        } else if self.check_punct("!=") {
            BinaryOp::Ne
        } else if self.check_punct("<=") {
            BinaryOp::Le
        } else if self.check_punct(">=") {
            BinaryOp::Ge
        } else if self.check_punct("<") {
            BinaryOp::Lt
        } else if self.check_punct(">") {
            BinaryOp::Gt
        } else if self.check_ident("in") {
            BinaryOp::In
        } else {
            return Ok(left);
        };
        self.pos += 1;
        let right = self.unary_expr()?;
        Ok(Expr::Binary(op, Box::new(left), Box::new(right)))
    }

    fn unary_expr(&mut self) -> Result<Expr, ExprError> {
        if self.check_punct("!") {
            self.pos += 1;
            let inner = self.unary_expr()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.postfix_expr()
    }

    fn postfix_expr(&mut self) -> Result<Expr, ExprError> {
        let mut expr = self.primary_expr()?;
        loop {
            if self.check_punct(".") {
                self.pos += 1;
                let name = match self.next() {
                    Some(Token::Ident(name)) => name,
                    other => return Err(self.error(format!("expected field name, found {other:?}"))),
                };
                if self.check_punct("(") {
                    self.pos += 1;
                    let args = self.arg_list(")")?;
                    expr = Expr::Method(Box::new(expr), name, args);
                } else {
                    expr = Expr::Member(Box::new(expr), name);
                }
            } else if self.check_punct("[") {
                self.pos += 1;
                let index = self.expr()?;
                self.expect_punct("]")?;
                expr = Expr::Index(Box::new(expr), Box::new(index));
            } else {
                return Ok(expr);
            }
        }
    }

    fn arg_list(&mut self, close: &'static str) -> Result<Vec<Expr>, ExprError> {
        let mut args = Vec::new();
        if self.check_punct(close) {
            self.pos += 1;
            return Ok(args);
        }
        loop {
            args.push(self.expr()?);
            if self.check_punct(",") {
                self.pos += 1;
                continue;
            }
            self.expect_punct(close)?;
            return Ok(args);
        }
    }

    fn primary_expr(&mut self) -> Result<Expr, ExprError> {
        match self.next() {
            Some(Token::Str(s)) => Ok(Expr::Literal(super::Value::String(s))),
            Some(Token::Num(n)) => Ok(Expr::Literal(serde_json::json!(n))),
            Some(Token::Ident(ident)) => match ident.as_str() {
                "true" => Ok(Expr::Literal(super::Value::Bool(true))),
                "false" => Ok(Expr::Literal(super::Value::Bool(false))),
                "null" => Ok(Expr::Literal(super::Value::Null)),
                _ => {
                    if self.check_punct("(") {
                        self.pos += 1;
                        let args = self.arg_list(")")?;
                        Ok(Expr::Call(ident, args))
                    } else {
                        Ok(Expr::Variable(ident))
                    }
                }
            },
            Some(Token::Punct("(")) => {
                let inner = self.expr()?;
                self.expect_punct(")")?;
                Ok(inner)
            }
            Some(Token::Punct("[")) => {
                let items = self.arg_list("]")?;
                Ok(Expr::List(items))
            }
            other => Err(self.error(format!("expected expression, found {other:?}"))),
        }
    }
}

/// Parse an expression source string into an AST.
pub fn parse(source: &str) -> Result<Expr, ExprError> {
    let tokens = Lexer::new(source).tokens()?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.expr()?;
    if parser.pos != parser.tokens.len() {
        return Err(parser.error("trailing input after expression"));
    }
    Ok(expr)
}
