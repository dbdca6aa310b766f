// ============================================================================
// SECTION 11: DERIVE EXPRESSIONS
// ============================================================================
// A whitelisted arithmetic language for derived columns:
//
//   assignment := [ident '='] expr
//   expr       := term (('+' | '-') term)*
//   term       := unary (('*' | '/' | '%') unary)*
//   unary      := '-' unary | atom
//   atom       := number | ident | '(' expr ')'
//
// Nothing else is accepted: no calls, no attribute access, no comparisons.
// ============================================================================

use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{ExpressionError, ExpressionResult};
use crate::ingest::Row;
use crate::value::Value;

/// Column written when the expression has no `name =` prefix
pub const DEFAULT_TARGET: &str = "result";

static SPECIAL_CHARS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[:\-./\s]").expect("valid special chars pattern"));
static UNDERSCORE_RUNS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"_+").expect("valid underscore pattern"));

/// Identifier-safe form of a metric or column name
/// (`cluster:pod_memory:active` → `cluster_pod_memory_active`).
pub fn sanitize_name(name: &str) -> String {
    let replaced = SPECIAL_CHARS_RE.replace_all(name, "_");
    let collapsed = UNDERSCORE_RUNS_RE.replace_all(&replaced, "_");
    collapsed.trim_matches('_').to_string()
}

/// Rewrite an expression written with original names to sanitised names,
/// longest names first so prefixes never clobber longer matches.
pub fn rewrite_expression(source: &str, names: &[String]) -> String {
    let mut ordered: Vec<&String> = names.iter().collect();
    ordered.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
    let mut result = source.to_string();
    for original in ordered {
        let sanitized = sanitize_name(original);
        if *original != sanitized && !original.is_empty() {
            result = result.replace(original.as_str(), &sanitized);
        }
    }
    result
}

// ----------------------------------------------------------------------------
// 11.1 Syntax Tree
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

impl BinaryOp {
    fn apply(self, a: f64, b: f64) -> Option<f64> {
        let out = match self {
            BinaryOp::Add => a + b,
            BinaryOp::Sub => a - b,
            BinaryOp::Mul => a * b,
            BinaryOp::Div if b == 0.0 => return None,
            BinaryOp::Div => a / b,
            BinaryOp::Rem if b == 0.0 => return None,
            BinaryOp::Rem => a % b,
        };
        out.is_finite().then_some(out)
    }

    fn symbol(self) -> char {
        match self {
            BinaryOp::Add => '+',
            BinaryOp::Sub => '-',
            BinaryOp::Mul => '*',
            BinaryOp::Div => '/',
            BinaryOp::Rem => '%',
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Column(String),
    Neg(Box<Expr>),
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
}

impl Expr {
    /// `None` when an operand is missing or the result is undefined.
    pub fn eval(&self, row: &Row) -> Option<f64> {
        match self {
            Expr::Number(n) => Some(*n),
            Expr::Column(c) => row.get(c).and_then(Value::as_f64).filter(|v| v.is_finite()),
            Expr::Neg(inner) => inner.eval(row).map(|v| -v),
            Expr::Binary { op, lhs, rhs } => op.apply(lhs.eval(row)?, rhs.eval(row)?),
        }
    }

    fn collect_columns<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Expr::Number(_) => {}
            Expr::Column(c) => {
                if !out.contains(&c.as_str()) {
                    out.push(c);
                }
            }
            Expr::Neg(inner) => inner.collect_columns(out),
            Expr::Binary { lhs, rhs, .. } => {
                lhs.collect_columns(out);
                rhs.collect_columns(out);
            }
        }
    }
}

impl Display for Expr {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Number(n) => write!(f, "{}", n),
            Expr::Column(c) => write!(f, "{}", c),
            Expr::Neg(inner) => write!(f, "-({})", inner),
            Expr::Binary { op, lhs, rhs } => write!(f, "({} {} {})", lhs, op.symbol(), rhs),
        }
    }
}

// ----------------------------------------------------------------------------
// 11.2 Lexer
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Op(char),
    LParen,
    RParen,
    Assign,
}

fn tokenize(source: &str) -> ExpressionResult<Vec<(usize, Token)>> {
    let chars: Vec<(usize, char)> = source.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let (pos, c) = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '+' | '-' | '*' | '/' | '%' => {
                tokens.push((pos, Token::Op(c)));
                i += 1;
            }
            '(' => {
                tokens.push((pos, Token::LParen));
                i += 1;
            }
            ')' => {
                tokens.push((pos, Token::RParen));
                i += 1;
            }
            '=' => {
                tokens.push((pos, Token::Assign));
                i += 1;
            }
            c if c.is_ascii_digit() || c == '.' => {
                let start = i;
                while i < chars.len() && (chars[i].1.is_ascii_digit() || chars[i].1 == '.') {
                    i += 1;
                }
                // Exponent part: 1e-3
                if i < chars.len() && (chars[i].1 == 'e' || chars[i].1 == 'E') {
                    let mut j = i + 1;
                    if j < chars.len() && (chars[j].1 == '+' || chars[j].1 == '-') {
                        j += 1;
                    }
                    if j < chars.len() && chars[j].1.is_ascii_digit() {
                        i = j;
                        while i < chars.len() && chars[i].1.is_ascii_digit() {
                            i += 1;
                        }
                    }
                }
                let text: String = chars[start..i].iter().map(|(_, ch)| ch).collect();
                let n = text.parse::<f64>().map_err(|_| ExpressionError::Parse {
                    expr: source.to_string(),
                    position: pos,
                    message: format!("invalid number '{}'", text),
                })?;
                tokens.push((pos, Token::Number(n)));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].1.is_alphanumeric() || chars[i].1 == '_') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().map(|(_, ch)| ch).collect();
                tokens.push((pos, Token::Ident(text)));
            }
            other => {
                return Err(ExpressionError::Parse {
                    expr: source.to_string(),
                    position: pos,
                    message: format!("unexpected character '{}'", other),
                })
            }
        }
    }
    Ok(tokens)
}

// ----------------------------------------------------------------------------
// 11.3 Parser
// ----------------------------------------------------------------------------

struct Parser<'a> {
    source: &'a str,
    tokens: Vec<(usize, Token)>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn offset(&self) -> usize {
        self.tokens.get(self.pos).map_or(self.source.len(), |(p, _)| *p)
    }

    fn error(&self, message: impl Into<String>) -> ExpressionError {
        ExpressionError::Parse {
            expr: self.source.to_string(),
            position: self.offset(),
            message: message.into(),
        }
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).map(|(_, t)| t.clone());
        self.pos += 1;
        t
    }

    fn expr(&mut self) -> ExpressionResult<Expr> {
        let mut lhs = self.term()?;
        while let Some(Token::Op(c @ ('+' | '-'))) = self.peek() {
            let op = if *c == '+' { BinaryOp::Add } else { BinaryOp::Sub };
            self.pos += 1;
            let rhs = self.term()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn term(&mut self) -> ExpressionResult<Expr> {
        let mut lhs = self.unary()?;
        while let Some(Token::Op(c @ ('*' | '/' | '%'))) = self.peek() {
            let op = match c {
                '*' => BinaryOp::Mul,
                '/' => BinaryOp::Div,
                _ => BinaryOp::Rem,
            };
            self.pos += 1;
            let rhs = self.unary()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> ExpressionResult<Expr> {
        if let Some(Token::Op('-')) = self.peek() {
            self.pos += 1;
            return Ok(Expr::Neg(Box::new(self.unary()?)));
        }
        self.atom()
    }

    fn atom(&mut self) -> ExpressionResult<Expr> {
        match self.next() {
            Some(Token::Number(n)) => Ok(Expr::Number(n)),
            Some(Token::Ident(name)) => {
                if let Some(Token::LParen) = self.peek() {
                    return Err(self.error(format!("function calls are not allowed ('{}')", name)));
                }
                Ok(Expr::Column(name))
            }
            Some(Token::LParen) => {
                let inner = self.expr()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => {
                        self.pos = self.pos.saturating_sub(1);
                        Err(self.error("expected ')'"))
                    }
                }
            }
            _ => {
                self.pos = self.pos.saturating_sub(1);
                Err(self.error("expected a number, column or '('"))
            }
        }
    }
}

// ----------------------------------------------------------------------------
// 11.4 Compiled Derive Expression
// ----------------------------------------------------------------------------

/// A derive expression compiled once per query against a known column set.
#[derive(Debug, Clone, PartialEq)]
pub struct DeriveExpr {
    pub source: String,
    pub target: String,
    pub expr: Expr,
}

impl DeriveExpr {
    /// Compile `source` against `columns`. Names with special characters
    /// may be written as-is or in sanitised form.
    pub fn compile(source: &str, columns: &[String]) -> ExpressionResult<Self> {
        let rewritten = rewrite_expression(source, columns);
        let tokens = tokenize(&rewritten)?;

        let (target, body) = match tokens.as_slice() {
            [(_, Token::Ident(name)), (_, Token::Assign), rest @ ..] => (sanitize_name(name), rest.to_vec()),
            _ => (DEFAULT_TARGET.to_string(), tokens),
        };
        if target.is_empty() {
            return Err(ExpressionError::Parse {
                expr: source.to_string(),
                position: 0,
                message: "empty assignment target".into(),
            });
        }

        let mut parser = Parser {
            source: &rewritten,
            tokens: body,
            pos: 0,
        };
        let expr = parser.expr()?;
        if parser.peek().is_some() {
            return Err(parser.error("unexpected trailing input"));
        }

        let by_sanitized: BTreeMap<String, &String> = columns.iter().map(|c| (sanitize_name(c), c)).collect();
        let expr = resolve_columns(expr, columns, &by_sanitized)?;

        Ok(Self {
            source: source.to_string(),
            target,
            expr,
        })
    }

    /// Columns the expression reads.
    pub fn columns(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.expr.collect_columns(&mut out);
        out
    }

    pub fn eval(&self, row: &Row) -> Option<f64> {
        self.expr.eval(row)
    }

    /// Write the result (or null) into the target column.
    pub fn apply(&self, row: &mut Row) {
        let value = self.eval(row).map_or(Value::Null, Value::Number);
        row.insert(self.target.clone(), value);
    }
}

fn resolve_columns(expr: Expr, columns: &[String], by_sanitized: &BTreeMap<String, &String>) -> ExpressionResult<Expr> {
    Ok(match expr {
        Expr::Column(name) => {
            if columns.iter().any(|c| *c == name) {
                Expr::Column(name)
            } else if let Some(original) = by_sanitized.get(&name) {
                Expr::Column((*original).clone())
            } else {
                return Err(ExpressionError::UnknownColumn {
                    name,
                    available: by_sanitized.keys().cloned().collect(),
                });
            }
        }
        Expr::Neg(inner) => Expr::Neg(Box::new(resolve_columns(*inner, columns, by_sanitized)?)),
        Expr::Binary { op, lhs, rhs } => Expr::Binary {
            op,
            lhs: Box::new(resolve_columns(*lhs, columns, by_sanitized)?),
            rhs: Box::new(resolve_columns(*rhs, columns, by_sanitized)?),
        },
        other => other,
    })
}

#[cfg(test)]
mod expr_tests {
    use super::*;
    use test_case::test_case;

    fn cols(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn row(pairs: &[(&str, f64)]) -> Row {
        pairs.iter().map(|(k, v)| (k.to_string(), Value::Number(*v))).collect()
    }

    #[test_case("cluster:namespace:pod_memory:active", "cluster_namespace_pod_memory_active")]
    #[test_case("http.server.duration", "http_server_duration")]
    #[test_case("-a--b-", "a_b")]
    #[test_case("plain", "plain")]
    fn test_sanitize_name(raw: &str, expected: &str) {
        assert_eq!(sanitize_name(raw), expected);
    }

    #[test]
    fn test_precedence_and_assignment() {
        let e = DeriveExpr::compile("pct = a / b * 100 - -1", &cols(&["a", "b"])).unwrap();
        assert_eq!(e.target, "pct");
        let v = e.eval(&row(&[("a", 1.0), ("b", 4.0)])).unwrap();
        assert!((v - 26.0).abs() < 1e-9);
    }

    #[test]
    fn test_default_target_and_parens() {
        let e = DeriveExpr::compile("(a + b) % 3", &cols(&["a", "b"])).unwrap();
        assert_eq!(e.target, DEFAULT_TARGET);
        assert_eq!(e.eval(&row(&[("a", 4.0), ("b", 3.0)])), Some(1.0));
    }

    #[test]
    fn test_division_by_zero_and_missing_operand_are_null() {
        let e = DeriveExpr::compile("r = a / b", &cols(&["a", "b"])).unwrap();
        assert_eq!(e.eval(&row(&[("a", 1.0), ("b", 0.0)])), None);
        assert_eq!(e.eval(&row(&[("a", 1.0)])), None);
        let mut r = row(&[("a", 1.0), ("b", 0.0)]);
        e.apply(&mut r);
        assert_eq!(r["r"], Value::Null);
    }

    #[test]
    fn test_original_names_are_rewritten() {
        let columns = cols(&["container:cpu:throttled", "container:cpu:total"]);
        let e = DeriveExpr::compile(
            "throttle_pct = container:cpu:throttled / container:cpu:total * 100",
            &columns,
        )
        .unwrap();
        assert_eq!(e.columns(), vec!["container:cpu:throttled", "container:cpu:total"]);
        let mut r = Row::new();
        r.insert("container:cpu:throttled".into(), Value::from("5"));
        r.insert("container:cpu:total".into(), Value::Number(20.0));
        assert_eq!(e.eval(&r), Some(25.0));
    }

    #[test]
    fn test_rejects_non_whitelisted_syntax() {
        let c = cols(&["a"]);
        assert!(matches!(DeriveExpr::compile("__import__('os')", &c), Err(ExpressionError::Parse { .. })));
        assert!(matches!(DeriveExpr::compile("a ** 2", &c), Err(ExpressionError::Parse { .. })));
        assert!(matches!(DeriveExpr::compile("a.b", &c), Err(ExpressionError::UnknownColumn { .. }) | Err(ExpressionError::Parse { .. })));
        assert!(matches!(DeriveExpr::compile("(a + 1", &c), Err(ExpressionError::Parse { .. })));
        assert!(matches!(DeriveExpr::compile("a > 1", &c), Err(ExpressionError::Parse { .. })));
    }

    #[test]
    fn test_unknown_column_lists_available() {
        let err = DeriveExpr::compile("x = missing + 1", &cols(&["a:b"])).unwrap_err();
        match err {
            ExpressionError::UnknownColumn { name, available } => {
                assert_eq!(name, "missing");
                assert_eq!(available, vec!["a_b".to_string()]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_scientific_literal() {
        let e = DeriveExpr::compile("a * 1e3", &cols(&["a"])).unwrap();
        assert_eq!(e.eval(&row(&[("a", 2.0)])), Some(2000.0));
    }
}
