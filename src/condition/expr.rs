//! Expression conditions.
//!
//! A small, side-effect free expression language evaluated against frame
//! bindings:
//!
//! ```text
//! expr    := or
//! or      := and ( ("||" | "or") and )*
//! and     := unary ( ("&&" | "and") unary )*
//! unary   := ("!" | "not") unary | cmp
//! cmp     := operand ( ("==" | "!=" | "<" | "<=" | ">" | ">=") operand
//!                    | "=~" string )?
//! operand := int | float | string | true | false | null | ident | "(" expr ")"
//! ```
//!
//! `_retval` and `_exception` read the return value on exit events and the
//! exception payload on raise events. A bare operand is a truthiness test.
//! Expressions are parsed once, at registration; regexes are compiled then.

use std::collections::HashMap;
use std::sync::{OnceLock, PoisonError, RwLock};

use regex::Regex;

use crate::context::ExecutionContext;
use crate::error::{EvalError, RegistrationError};
use crate::value::Value;

const REGEX_CACHE_MAX: usize = 256;
/// Deepest `(` / `!` nesting the parser accepts.
const MAX_NESTING: usize = 128;
/// Longest expression, in tokens. Bounds the height of `&&`/`||` chains.
const MAX_TOKENS: usize = 1024;

static REGEX_CACHE: OnceLock<RwLock<HashMap<String, Regex>>> = OnceLock::new();

fn cached_regex(pattern: &str) -> Result<Regex, String> {
    let cache = REGEX_CACHE.get_or_init(|| RwLock::new(HashMap::new()));

    if let Some(re) = cache
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .get(pattern)
    {
        return Ok(re.clone());
    }

    let compiled = Regex::new(pattern).map_err(|e| format!("invalid regex '{pattern}': {e}"))?;

    let mut guard = cache.write().unwrap_or_else(PoisonError::into_inner);
    if guard.len() >= REGEX_CACHE_MAX {
        guard.clear();
    }
    // Another thread may have inserted it while we compiled.
    Ok(guard
        .entry(pattern.to_string())
        .or_insert(compiled)
        .clone())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone)]
enum Node {
    Lit(Value),
    Var(String),
    Not(Box<Node>),
    And(Box<Node>, Box<Node>),
    Or(Box<Node>, Box<Node>),
    Cmp(CmpOp, Box<Node>, Box<Node>),
    Match(Box<Node>, Regex),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Int(i64),
    Float(f64),
    Str(String),
    True,
    False,
    Null,
    And,
    Or,
    Not,
    Cmp(CmpOp),
    Match,
    LParen,
    RParen,
}

impl Token {
    const fn is_operand_end(&self) -> bool {
        matches!(
            self,
            Self::Ident(_)
                | Self::Int(_)
                | Self::Float(_)
                | Self::Str(_)
                | Self::True
                | Self::False
                | Self::Null
                | Self::RParen
        )
    }
}

fn tokenize(src: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = src.chars().collect();
    let mut out: Vec<Token> = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match (c, next) {
            (c, _) if c.is_whitespace() => i += 1,
            ('(', _) => {
                out.push(Token::LParen);
                i += 1;
            }
            (')', _) => {
                out.push(Token::RParen);
                i += 1;
            }
            ('&', Some('&')) => {
                out.push(Token::And);
                i += 2;
            }
            ('|', Some('|')) => {
                out.push(Token::Or);
                i += 2;
            }
            ('=', Some('=')) => {
                out.push(Token::Cmp(CmpOp::Eq));
                i += 2;
            }
            ('=', Some('~')) => {
                out.push(Token::Match);
                i += 2;
            }
            ('!', Some('=')) => {
                out.push(Token::Cmp(CmpOp::Ne));
                i += 2;
            }
            ('!', _) => {
                out.push(Token::Not);
                i += 1;
            }
            ('<', Some('=')) => {
                out.push(Token::Cmp(CmpOp::Le));
                i += 2;
            }
            ('<', _) => {
                out.push(Token::Cmp(CmpOp::Lt));
                i += 1;
            }
            ('>', Some('=')) => {
                out.push(Token::Cmp(CmpOp::Ge));
                i += 2;
            }
            ('>', _) => {
                out.push(Token::Cmp(CmpOp::Gt));
                i += 1;
            }
            ('"' | '\'', _) => {
                let (text, end) = scan_string(&chars, i)?;
                out.push(Token::Str(text));
                i = end;
            }
            (c, n)
                if c.is_ascii_digit()
                    || (c == '-'
                        && n.is_some_and(|d| d.is_ascii_digit())
                        && !out.last().is_some_and(Token::is_operand_end)) =>
            {
                let start = i;
                i += 1;
                let mut is_float = false;
                while let Some(&d) = chars.get(i) {
                    if d.is_ascii_digit() {
                        i += 1;
                    } else if d == '.' && !is_float {
                        is_float = true;
                        i += 1;
                    } else {
                        break;
                    }
                }
                let text: String = chars[start..i].iter().collect();
                let token = if is_float {
                    text.parse().map(Token::Float).map_err(|e| format!("bad number '{text}': {e}"))?
                } else {
                    text.parse().map(Token::Int).map_err(|e| format!("bad number '{text}': {e}"))?
                };
                out.push(token);
            }
            (c, _) if c.is_alphabetic() || c == '_' => {
                let start = i;
                while chars.get(i).is_some_and(|d| d.is_alphanumeric() || *d == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                out.push(match word.as_str() {
                    "true" | "True" => Token::True,
                    "false" | "False" => Token::False,
                    "null" | "None" => Token::Null,
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    _ => Token::Ident(word),
                });
            }
            (other, _) => return Err(format!("unexpected character '{other}' at offset {i}")),
        }
    }
    Ok(out)
}

fn scan_string(chars: &[char], start: usize) -> Result<(String, usize), String> {
    let quote = chars[start];
    let mut text = String::new();
    let mut i = start + 1;
    while let Some(&c) = chars.get(i) {
        match c {
            '\\' => {
                let escaped = chars.get(i + 1).ok_or("unterminated escape")?;
                text.push(match escaped {
                    'n' => '\n',
                    't' => '\t',
                    other => *other,
                });
                i += 2;
            }
            c if c == quote => return Ok((text, i + 1)),
            c => {
                text.push(c);
                i += 1;
            }
        }
    }
    Err("unterminated string literal".to_string())
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn parse_or(&mut self) -> Result<Node, String> {
        let mut lhs = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let rhs = self.parse_and()?;
            lhs = Node::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Node, String> {
        let mut lhs = self.parse_unary()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let rhs = self.parse_unary()?;
            lhs = Node::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn descend(&mut self) -> Result<(), String> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return Err("expression nested too deeply".to_string());
        }
        Ok(())
    }

    fn parse_unary(&mut self) -> Result<Node, String> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            self.descend()?;
            let inner = self.parse_unary()?;
            self.depth -= 1;
            return Ok(Node::Not(Box::new(inner)));
        }
        self.parse_cmp()
    }

    fn parse_cmp(&mut self) -> Result<Node, String> {
        let lhs = self.parse_operand()?;
        match self.peek() {
            Some(Token::Cmp(op)) => {
                let op = *op;
                self.pos += 1;
                let rhs = self.parse_operand()?;
                Ok(Node::Cmp(op, Box::new(lhs), Box::new(rhs)))
            }
            Some(Token::Match) => {
                self.pos += 1;
                match self.bump() {
                    Some(Token::Str(pattern)) => Ok(Node::Match(Box::new(lhs), cached_regex(&pattern)?)),
                    _ => Err("'=~' must be followed by a string pattern".to_string()),
                }
            }
            _ => Ok(lhs),
        }
    }

    fn parse_operand(&mut self) -> Result<Node, String> {
        match self.bump() {
            Some(Token::Int(v)) => Ok(Node::Lit(Value::Int(v))),
            Some(Token::Float(v)) => Ok(Node::Lit(Value::Float(v))),
            Some(Token::Str(v)) => Ok(Node::Lit(Value::String(v))),
            Some(Token::True) => Ok(Node::Lit(Value::Bool(true))),
            Some(Token::False) => Ok(Node::Lit(Value::Bool(false))),
            Some(Token::Null) => Ok(Node::Lit(Value::Null)),
            Some(Token::Ident(name)) => Ok(Node::Var(name)),
            Some(Token::LParen) => {
                self.descend()?;
                let inner = self.parse_or()?;
                self.depth -= 1;
                match self.bump() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err("missing ')'".to_string()),
                }
            }
            Some(other) => Err(format!("expected an operand, found {other:?}")),
            None => Err("unexpected end of expression".to_string()),
        }
    }
}

/// A parsed condition expression.
#[derive(Debug, Clone)]
pub struct Expr {
    source: String,
    root: Node,
}

impl Expr {
    /// Parse `source`; syntax errors surface as `InvalidCondition`.
    pub fn parse(source: &str) -> Result<Self, RegistrationError> {
        let invalid = |reason: String| RegistrationError::InvalidCondition {
            expression: source.to_string(),
            reason,
        };
        let tokens = tokenize(source).map_err(invalid)?;
        if tokens.is_empty() {
            return Err(invalid("empty expression".to_string()));
        }
        if tokens.len() > MAX_TOKENS {
            return Err(invalid(format!("expression longer than {MAX_TOKENS} tokens")));
        }
        let mut parser = Parser {
            tokens,
            pos: 0,
            depth: 0,
        };
        let root = parser.parse_or().map_err(invalid)?;
        if let Some(extra) = parser.peek() {
            return Err(invalid(format!("unexpected trailing {extra:?}")));
        }
        Ok(Self {
            source: source.to_string(),
            root,
        })
    }

    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Names of the frame bindings the expression reads.
    #[must_use]
    pub fn bindings(&self) -> Vec<&str> {
        let mut names = Vec::new();
        collect_vars(&self.root, &mut names);
        names.sort_unstable();
        names.dedup();
        names
    }

    pub fn evaluate(&self, ctx: &ExecutionContext<'_>) -> Result<bool, EvalError> {
        truth(&self.root, ctx)
    }
}

fn collect_vars<'a>(node: &'a Node, out: &mut Vec<&'a str>) {
    match node {
        Node::Lit(_) => {}
        Node::Var(name) => out.push(name),
        Node::Not(inner) | Node::Match(inner, _) => collect_vars(inner, out),
        Node::And(a, b) | Node::Or(a, b) | Node::Cmp(_, a, b) => {
            collect_vars(a, out);
            collect_vars(b, out);
        }
    }
}

fn value(node: &Node, ctx: &ExecutionContext<'_>) -> Result<Value, EvalError> {
    match node {
        Node::Lit(v) => Ok(v.clone()),
        Node::Var(name) => match name.as_str() {
            "_retval" => ctx.return_value().cloned(),
            "_exception" => ctx.exception().cloned(),
            _ => ctx.get(name),
        },
        other => truth(other, ctx).map(Value::Bool),
    }
}

fn truth(node: &Node, ctx: &ExecutionContext<'_>) -> Result<bool, EvalError> {
    match node {
        Node::Not(inner) => Ok(!truth(inner, ctx)?),
        Node::And(a, b) => Ok(truth(a, ctx)? && truth(b, ctx)?),
        Node::Or(a, b) => Ok(truth(a, ctx)? || truth(b, ctx)?),
        Node::Cmp(op, a, b) => {
            let lhs = value(a, ctx)?;
            let rhs = value(b, ctx)?;
            match op {
                CmpOp::Eq => Ok(lhs.loose_eq(&rhs)),
                CmpOp::Ne => Ok(!lhs.loose_eq(&rhs)),
                _ => {
                    let ord = lhs.compare(&rhs).ok_or_else(|| {
                        EvalError::failed(format!(
                            "cannot order {} against {}",
                            lhs.type_name(),
                            rhs.type_name()
                        ))
                    })?;
                    Ok(match op {
                        CmpOp::Lt => ord.is_lt(),
                        CmpOp::Le => ord.is_le(),
                        CmpOp::Gt => ord.is_gt(),
                        _ => ord.is_ge(),
                    })
                }
            }
        }
        Node::Match(inner, re) => {
            let v = value(inner, ctx)?;
            match v.as_string() {
                Some(s) => Ok(re.is_match(s)),
                None => Err(EvalError::TypeMismatch {
                    name: match inner.as_ref() {
                        Node::Var(name) => name.clone(),
                        _ => "=~ operand".to_string(),
                    },
                    expected: "string",
                    actual: v.type_name(),
                }),
            }
        }
        Node::Lit(_) | Node::Var(_) => Ok(value(node, ctx)?.is_truthy()),
    }
}
