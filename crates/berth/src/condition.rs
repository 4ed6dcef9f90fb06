//! The action condition language.
//!
//! Conditions gate template actions at runtime. The language is deliberately
//! tiny — four predicates combined with `AND`/`OR`/`NOT` and parentheses —
//! so there is no expression evaluator to escape from and the semantics stay
//! auditable:
//!
//! ```text
//! file_exists('~/.ssh/id_ed25519') OR NOT env_var_set('CI')
//! ```
//!
//! Predicate arguments go through variable substitution before they touch
//! the filesystem. A malformed expression is reported as an error; the
//! executor logs it and defaults to running the action.

use std::fmt;

use anyhow::{Result, bail};

use crate::subst::Substitutions;

/// Parsed condition expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Predicate(Predicate),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Literal(bool),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    FileExists(String),
    DirectoryExists(String),
    CommandExists(String),
    EnvVarSet(String),
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::FileExists(p) => write!(f, "file_exists('{p}')"),
            Predicate::DirectoryExists(p) => write!(f, "directory_exists('{p}')"),
            Predicate::CommandExists(c) => write!(f, "command_exists('{c}')"),
            Predicate::EnvVarSet(v) => write!(f, "env_var_set('{v}')"),
        }
    }
}

/// Parses an expression, or fails with a description of the first problem.
pub fn parse(input: &str) -> Result<Expr> {
    let tokens = tokenize(input)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.expr()?;
    if parser.pos != parser.tokens.len() {
        bail!("unexpected trailing input in condition: {input:?}");
    }
    Ok(expr)
}

/// Parses and evaluates in one step.
pub fn evaluate(input: &str, subst: &Substitutions) -> Result<bool> {
    Ok(eval(&parse(input)?, subst))
}

/// Evaluates a parsed expression. Predicates observe the live system.
pub fn eval(expr: &Expr, subst: &Substitutions) -> bool {
    match expr {
        Expr::Literal(b) => *b,
        Expr::Not(inner) => !eval(inner, subst),
        Expr::And(a, b) => eval(a, subst) && eval(b, subst),
        Expr::Or(a, b) => eval(a, subst) || eval(b, subst),
        Expr::Predicate(p) => eval_predicate(p, subst),
    }
}

fn eval_predicate(predicate: &Predicate, subst: &Substitutions) -> bool {
    match predicate {
        Predicate::FileExists(path) => {
            let path = subst.apply_str(path);
            std::path::Path::new(&path).is_file()
        }
        Predicate::DirectoryExists(path) => {
            let path = subst.apply_str(path);
            std::path::Path::new(&path).is_dir()
        }
        Predicate::CommandExists(cmd) => which::which(subst.apply_str(cmd)).is_ok(),
        Predicate::EnvVarSet(var) => std::env::var_os(subst.apply_str(var)).is_some(),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' | '\n' | '\r' => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '\'' | '"' => {
                let quote = c;
                chars.next();
                let mut s = String::new();
                loop {
                    match chars.next() {
                        Some(ch) if ch == quote => break,
                        Some(ch) => s.push(ch),
                        None => bail!("unterminated string in condition"),
                    }
                }
                tokens.push(Token::Str(s));
            }
            c if c.is_ascii_alphanumeric() || "_-./~${}".contains(c) => {
                let mut s = String::new();
                while let Some(&ch) = chars.peek() {
                    if ch.is_ascii_alphanumeric() || "_-./~${}".contains(ch) {
                        s.push(ch);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(s));
            }
            other => bail!("unexpected character in condition: {other:?}"),
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
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

    fn keyword(&self, kw: &str) -> bool {
        matches!(self.peek(), Some(Token::Ident(s)) if s.eq_ignore_ascii_case(kw))
    }

    fn expr(&mut self) -> Result<Expr> {
        let mut left = self.term()?;
        while self.keyword("or") {
            self.next();
            let right = self.term()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn term(&mut self) -> Result<Expr> {
        let mut left = self.factor()?;
        while self.keyword("and") {
            self.next();
            let right = self.factor()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn factor(&mut self) -> Result<Expr> {
        if self.keyword("not") {
            self.next();
            return Ok(Expr::Not(Box::new(self.factor()?)));
        }
        if matches!(self.peek(), Some(Token::LParen)) {
            self.next();
            let inner = self.expr()?;
            match self.next() {
                Some(Token::RParen) => return Ok(inner),
                _ => bail!("missing closing parenthesis in condition"),
            }
        }
        self.predicate()
    }

    fn predicate(&mut self) -> Result<Expr> {
        let name = match self.next() {
            Some(Token::Ident(s)) => s,
            other => bail!("expected predicate, found {other:?}"),
        };

        if name.eq_ignore_ascii_case("true") {
            return Ok(Expr::Literal(true));
        }
        if name.eq_ignore_ascii_case("false") {
            return Ok(Expr::Literal(false));
        }

        match self.next() {
            Some(Token::LParen) => {}
            other => bail!("expected '(' after {name}, found {other:?}"),
        }
        let arg = match self.next() {
            Some(Token::Str(s)) | Some(Token::Ident(s)) => s,
            other => bail!("expected argument for {name}, found {other:?}"),
        };
        match self.next() {
            Some(Token::RParen) => {}
            other => bail!("expected ')' after {name} argument, found {other:?}"),
        }

        let predicate = match name.as_str() {
            "file_exists" => Predicate::FileExists(arg),
            "directory_exists" => Predicate::DirectoryExists(arg),
            "command_exists" => Predicate::CommandExists(arg),
            "env_var_set" => Predicate::EnvVarSet(arg),
            other => bail!("unknown predicate: {other}"),
        };
        Ok(Expr::Predicate(predicate))
    }
}
