//! Build nodes and label expressions.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::Error;

/// Name of the node that runs on the controller itself.
pub const BUILT_IN_NODE: &str = "built-in";

/// A build agent definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub labels: BTreeSet<String>,
    /// Number of executor slots.
    pub num_executors: usize,
    /// Directory under which job workspaces are created.
    pub workspace_root: PathBuf,
    /// Variables contributed by the node. Lowest precedence in a build environment.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl Node {
    pub fn new(name: impl Into<String>, workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            labels: BTreeSet::new(),
            num_executors: 1,
            workspace_root: workspace_root.into(),
            env: BTreeMap::new(),
        }
    }

    pub fn with_labels<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.labels.extend(labels.into_iter().map(Into::into));
        self
    }

    pub fn with_executors(mut self, n: usize) -> Self {
        self.num_executors = n;
        self
    }

    /// Labels including the implicit self label.
    pub fn has_label(&self, label: &str) -> bool {
        self.name == label || self.labels.contains(label)
    }

    /// True if this node can run work restricted by `expr` (None = any node).
    pub fn satisfies(&self, expr: Option<&LabelExpr>) -> bool {
        expr.is_none_or(|e| e.matches(&|l| self.has_label(l)))
    }

    /// Default workspace for a job on this node.
    pub fn workspace_for(&self, job: &str) -> PathBuf {
        self.workspace_root.join(job)
    }
}

/// Boolean expression over node labels: `linux && (docker || podman) && !arm`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LabelExpr {
    Atom(String),
    Not(Box<LabelExpr>),
    And(Box<LabelExpr>, Box<LabelExpr>),
    Or(Box<LabelExpr>, Box<LabelExpr>),
}

impl LabelExpr {
    pub fn matches(&self, has: &dyn Fn(&str) -> bool) -> bool {
        match self {
            LabelExpr::Atom(l) => has(l),
            LabelExpr::Not(e) => !e.matches(has),
            LabelExpr::And(a, b) => a.matches(has) && b.matches(has),
            LabelExpr::Or(a, b) => a.matches(has) || b.matches(has),
        }
    }
}

impl fmt::Display for LabelExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LabelExpr::Atom(l) => f.write_str(l),
            LabelExpr::Not(e) => write!(f, "!{}", e),
            LabelExpr::And(a, b) => write!(f, "({} && {})", a, b),
            LabelExpr::Or(a, b) => write!(f, "({} || {})", a, b),
        }
    }
}

impl FromStr for LabelExpr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let tokens = tokenize(s)?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.or()?;
        if parser.pos != parser.tokens.len() {
            return Err(Error::InvalidInput(format!(
                "unexpected trailing input in label expression '{}'",
                s
            )));
        }
        Ok(expr)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Atom(String),
    And,
    Or,
    Not,
    Open,
    Close,
}

fn tokenize(s: &str) -> Result<Vec<Token>, Error> {
    let mut tokens = Vec::new();
    let mut chars = s.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::Open);
            }
            ')' => {
                chars.next();
                tokens.push(Token::Close);
            }
            '!' => {
                chars.next();
                tokens.push(Token::Not);
            }
            '&' | '|' => {
                chars.next();
                if chars.next() != Some(c) {
                    return Err(Error::InvalidInput(format!(
                        "expected '{}{}' in label expression '{}'",
                        c, c, s
                    )));
                }
                tokens.push(if c == '&' { Token::And } else { Token::Or });
            }
            _ => {
                let mut atom = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_whitespace() || "()!&|".contains(c) {
                        break;
                    }
                    atom.push(c);
                    chars.next();
                }
                tokens.push(Token::Atom(atom));
            }
        }
    }
    if tokens.is_empty() {
        return Err(Error::InvalidInput("empty label expression".to_string()));
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

    fn or(&mut self) -> Result<LabelExpr, Error> {
        let mut left = self.and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let right = self.and()?;
            left = LabelExpr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<LabelExpr, Error> {
        let mut left = self.unary()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let right = self.unary()?;
            left = LabelExpr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<LabelExpr, Error> {
        match self.tokens.get(self.pos).cloned() {
            Some(Token::Not) => {
                self.pos += 1;
                Ok(LabelExpr::Not(Box::new(self.unary()?)))
            }
            Some(Token::Open) => {
                self.pos += 1;
                let inner = self.or()?;
                if self.peek() != Some(&Token::Close) {
                    return Err(Error::InvalidInput("unbalanced parentheses".to_string()));
                }
                self.pos += 1;
                Ok(inner)
            }
            Some(Token::Atom(a)) => {
                self.pos += 1;
                Ok(LabelExpr::Atom(a))
            }
            other => Err(Error::InvalidInput(format!(
                "unexpected token {:?} in label expression",
                other
            ))),
        }
    }
}
