//! Calculated-field expression language
//!
//! A small SQL-flavoured language used by `calculated` transform steps:
//!
//! ```text
//! CASE WHEN IS_BLANK(monthly_income) THEN annual_income / 12
//!      ELSE monthly_income END
//! ```
//!
//! Supported syntax: numeric and `'quoted'` literals, `NULL`, `TRUE`, `FALSE`,
//! arithmetic (`+ - * / %`), concatenation (`||`), comparisons
//! (`= == != <> < <= > >=`), `AND`, `OR`, `NOT`, `IS [NOT] NULL`,
//! `[NOT] IN (...)`, `CASE WHEN ... THEN ... [ELSE ...] END` and the functions
//! listed in [`Function`]. Keywords and function names are case-insensitive.
//!
//! Expressions are parsed once when the contract loads; evaluation happens per
//! row against a [`Scope`] that resolves identifiers. Null propagates through
//! arithmetic and comparison the way SQL does.

use bigdecimal::{BigDecimal, RoundingMode, ToPrimitive, Zero};
use std::cmp::Ordering;
use std::str::FromStr;
use thiserror::Error;

use crate::value::{Value, MAX_DECIMAL_EXPONENT};

/// Parse or evaluation failure
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExprError {
    #[error("unexpected character '{0}' at offset {1}")]
    UnexpectedChar(char, usize),

    #[error("unterminated string literal")]
    UnterminatedString,

    #[error("unexpected token {found}, expected {expected}")]
    UnexpectedToken { found: String, expected: String },

    #[error("unknown function {0}")]
    UnknownFunction(String),

    #[error("{function} expects {expected} argument(s), got {got}")]
    Arity {
        function: &'static str,
        expected: &'static str,
        got: usize,
    },

    #[error("cannot apply {op} to {left} and {right}")]
    TypeMismatch {
        op: String,
        left: String,
        right: String,
    },

    #[error("division by zero")]
    DivisionByZero,

    #[error("invalid argument to {function}: {detail}")]
    InvalidArgument {
        function: &'static str,
        detail: String,
    },
}

/// Resolves identifiers and `field()` lookups during evaluation
pub trait Scope {
    fn lookup(&self, name: &str) -> Option<Value>;

    fn field(&self, path: &str, attribute: Option<&str>) -> Option<Value>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Concat,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    And,
    Or,
}

impl BinaryOp {
    fn symbol(&self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Rem => "%",
            BinaryOp::Concat => "||",
            BinaryOp::Eq => "=",
            BinaryOp::NotEq => "<>",
            BinaryOp::Lt => "<",
            BinaryOp::LtEq => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::GtEq => ">=",
            BinaryOp::And => "AND",
            BinaryOp::Or => "OR",
        }
    }
}

/// Built-in functions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Function {
    Trim,
    Upper,
    Lower,
    Len,
    Substr,
    Left,
    Right,
    Replace,
    Concat,
    Coalesce,
    NullIf,
    IsBlank,
    Round,
    Abs,
    Field,
    DaysBetween,
}

impl Function {
    fn from_name(name: &str) -> Option<Self> {
        let function = match name.to_ascii_uppercase().as_str() {
            "TRIM" => Function::Trim,
            "UPPER" => Function::Upper,
            "LOWER" => Function::Lower,
            "LEN" | "LENGTH" => Function::Len,
            "SUBSTR" | "SUBSTRING" => Function::Substr,
            "LEFT" => Function::Left,
            "RIGHT" => Function::Right,
            "REPLACE" => Function::Replace,
            "CONCAT" => Function::Concat,
            "COALESCE" => Function::Coalesce,
            "NULLIF" => Function::NullIf,
            "IS_BLANK" | "ISBLANK" => Function::IsBlank,
            "ROUND" => Function::Round,
            "ABS" => Function::Abs,
            "FIELD" => Function::Field,
            "DAYS_BETWEEN" => Function::DaysBetween,
            _ => return None,
        };
        Some(function)
    }

    fn name(&self) -> &'static str {
        match self {
            Function::Trim => "TRIM",
            Function::Upper => "UPPER",
            Function::Lower => "LOWER",
            Function::Len => "LEN",
            Function::Substr => "SUBSTR",
            Function::Left => "LEFT",
            Function::Right => "RIGHT",
            Function::Replace => "REPLACE",
            Function::Concat => "CONCAT",
            Function::Coalesce => "COALESCE",
            Function::NullIf => "NULLIF",
            Function::IsBlank => "IS_BLANK",
            Function::Round => "ROUND",
            Function::Abs => "ABS",
            Function::Field => "FIELD",
            Function::DaysBetween => "DAYS_BETWEEN",
        }
    }

    /// Accepted argument counts as (min, max, description)
    fn arity(&self) -> (usize, usize, &'static str) {
        match self {
            Function::Trim
            | Function::Upper
            | Function::Lower
            | Function::Len
            | Function::IsBlank
            | Function::Abs => (1, 1, "1"),
            Function::Substr => (2, 3, "2 or 3"),
            Function::Left | Function::Right | Function::NullIf | Function::DaysBetween => {
                (2, 2, "2")
            }
            Function::Replace => (3, 3, "3"),
            Function::Round => (1, 2, "1 or 2"),
            Function::Field => (1, 2, "1 or 2"),
            Function::Concat | Function::Coalesce => (1, usize::MAX, "at least 1"),
        }
    }
}

/// Parsed expression tree
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Option<Value>),
    Ident(String),
    Negate(Box<Expr>),
    Not(Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    IsNull {
        expr: Box<Expr>,
        negated: bool,
    },
    InList {
        expr: Box<Expr>,
        list: Vec<Expr>,
        negated: bool,
    },
    Case {
        branches: Vec<(Expr, Expr)>,
        otherwise: Option<Box<Expr>>,
    },
    Call(Function, Vec<Expr>),
}

impl Expr {
    pub fn parse(source: &str) -> Result<Expr, ExprError> {
        let tokens = tokenize(source)?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.expression(0)?;
        match parser.peek() {
            Token::Eof => Ok(expr),
            other => Err(ExprError::UnexpectedToken {
                found: other.describe(),
                expected: "end of expression".to_string(),
            }),
        }
    }

    /// Identifiers referenced anywhere in the expression
    pub fn identifiers(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_identifiers(&mut out);
        out
    }

    fn collect_identifiers<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Expr::Ident(name) => out.push(name),
            Expr::Literal(_) => {}
            Expr::Negate(e) | Expr::Not(e) | Expr::IsNull { expr: e, .. } => {
                e.collect_identifiers(out)
            }
            Expr::Binary(_, l, r) => {
                l.collect_identifiers(out);
                r.collect_identifiers(out);
            }
            Expr::InList { expr, list, .. } => {
                expr.collect_identifiers(out);
                list.iter().for_each(|e| e.collect_identifiers(out));
            }
            Expr::Case {
                branches,
                otherwise,
            } => {
                for (cond, result) in branches {
                    cond.collect_identifiers(out);
                    result.collect_identifiers(out);
                }
                if let Some(e) = otherwise {
                    e.collect_identifiers(out);
                }
            }
            Expr::Call(_, args) => args.iter().for_each(|e| e.collect_identifiers(out)),
        }
    }

    pub fn evaluate(&self, scope: &dyn Scope) -> Result<Option<Value>, ExprError> {
        match self {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Ident(name) => Ok(scope.lookup(name)),
            Expr::Negate(inner) => match inner.evaluate(scope)? {
                None => Ok(None),
                Some(Value::Int(i)) => Ok(Some(
                    i.checked_neg()
                        .map(Value::Int)
                        .unwrap_or_else(|| Value::Decimal(-BigDecimal::from(i))),
                )),
                Some(other) => match other.to_decimal() {
                    Some(d) => Ok(Some(Value::Decimal(-d))),
                    None => Err(ExprError::TypeMismatch {
                        op: "-".to_string(),
                        left: other.type_name().to_string(),
                        right: "nothing".to_string(),
                    }),
                },
            },
            Expr::Not(inner) => Ok(inner
                .evaluate(scope)?
                .map(|v| Value::Bool(!v.is_truthy()))),
            Expr::IsNull { expr, negated } => {
                let is_null = expr.evaluate(scope)?.is_none();
                Ok(Some(Value::Bool(is_null != *negated)))
            }
            Expr::InList {
                expr,
                list,
                negated,
            } => {
                let Some(needle) = expr.evaluate(scope)? else {
                    return Ok(None);
                };
                for candidate in list {
                    if let Some(candidate) = candidate.evaluate(scope)? {
                        if compare(&needle, &candidate) == Some(Ordering::Equal) {
                            return Ok(Some(Value::Bool(!negated)));
                        }
                    }
                }
                Ok(Some(Value::Bool(*negated)))
            }
            Expr::Case {
                branches,
                otherwise,
            } => {
                for (condition, result) in branches {
                    if condition
                        .evaluate(scope)?
                        .is_some_and(|v| v.is_truthy())
                    {
                        return result.evaluate(scope);
                    }
                }
                match otherwise {
                    Some(e) => e.evaluate(scope),
                    None => Ok(None),
                }
            }
            Expr::Binary(op, left, right) => evaluate_binary(*op, left, right, scope),
            Expr::Call(function, args) => call(*function, args, scope),
        }
    }
}

// ============================================================================
// Tokenizer
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(String),
    Str(String),
    Ident(String),
    Symbol(&'static str),
    LParen,
    RParen,
    Comma,
    Eof,
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::Number(n) => format!("number {n}"),
            Token::Str(s) => format!("string '{s}'"),
            Token::Ident(i) => format!("identifier {i}"),
            Token::Symbol(s) => format!("'{s}'"),
            Token::LParen => "'('".to_string(),
            Token::RParen => "')'".to_string(),
            Token::Comma => "','".to_string(),
            Token::Eof => "end of expression".to_string(),
        }
    }

    fn is_keyword(&self, keyword: &str) -> bool {
        matches!(self, Token::Ident(i) if i.eq_ignore_ascii_case(keyword))
    }
}

fn tokenize(source: &str) -> Result<Vec<Token>, ExprError> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }

        if c.is_ascii_digit() || (c == '.' && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit()))
        {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            tokens.push(Token::Number(chars[start..i].iter().collect()));
            continue;
        }

        if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.')
            {
                i += 1;
            }
            tokens.push(Token::Ident(chars[start..i].iter().collect()));
            continue;
        }

        if c == '\'' {
            let mut literal = String::new();
            i += 1;
            loop {
                match chars.get(i) {
                    None => return Err(ExprError::UnterminatedString),
                    // '' inside a literal is an escaped quote
                    Some('\'') if chars.get(i + 1) == Some(&'\'') => {
                        literal.push('\'');
                        i += 2;
                    }
                    Some('\'') => {
                        i += 1;
                        break;
                    }
                    Some(ch) => {
                        literal.push(*ch);
                        i += 1;
                    }
                }
            }
            tokens.push(Token::Str(literal));
            continue;
        }

        let next = chars.get(i + 1).copied();
        let (token, width) = match (c, next) {
            ('(', _) => (Token::LParen, 1),
            (')', _) => (Token::RParen, 1),
            (',', _) => (Token::Comma, 1),
            ('|', Some('|')) => (Token::Symbol("||"), 2),
            ('<', Some('=')) => (Token::Symbol("<="), 2),
            ('<', Some('>')) => (Token::Symbol("<>"), 2),
            ('>', Some('=')) => (Token::Symbol(">="), 2),
            ('!', Some('=')) => (Token::Symbol("<>"), 2),
            ('=', Some('=')) => (Token::Symbol("="), 2),
            ('<', _) => (Token::Symbol("<"), 1),
            ('>', _) => (Token::Symbol(">"), 1),
            ('=', _) => (Token::Symbol("="), 1),
            ('+', _) => (Token::Symbol("+"), 1),
            ('-', _) => (Token::Symbol("-"), 1),
            ('*', _) => (Token::Symbol("*"), 1),
            ('/', _) => (Token::Symbol("/"), 1),
            ('%', _) => (Token::Symbol("%"), 1),
            _ => return Err(ExprError::UnexpectedChar(c, i)),
        };
        tokens.push(token);
        i += width;
    }

    tokens.push(Token::Eof);
    Ok(tokens)
}

// ============================================================================
// Parser
// ============================================================================

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

const PREC_OR: u8 = 1;
const PREC_AND: u8 = 2;
const PREC_NOT: u8 = 3;
const PREC_CMP: u8 = 4;
const PREC_ADD: u8 = 5;
const PREC_MUL: u8 = 6;
const PREC_UNARY: u8 = 7;

impl Parser {
    fn peek(&self) -> &Token {
        self.tokens.get(self.pos).unwrap_or(&Token::Eof)
    }

    fn peek_at(&self, offset: usize) -> &Token {
        self.tokens.get(self.pos + offset).unwrap_or(&Token::Eof)
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn expect_keyword(&mut self, keyword: &str) -> Result<(), ExprError> {
        if self.peek().is_keyword(keyword) {
            self.advance();
            Ok(())
        } else {
            Err(ExprError::UnexpectedToken {
                found: self.peek().describe(),
                expected: keyword.to_string(),
            })
        }
    }

    fn expect(&mut self, expected: Token) -> Result<(), ExprError> {
        if *self.peek() == expected {
            self.advance();
            Ok(())
        } else {
            Err(ExprError::UnexpectedToken {
                found: self.peek().describe(),
                expected: expected.describe(),
            })
        }
    }

    /// Binary operator at the cursor with its precedence
    fn infix(&self) -> Option<(BinaryOp, u8)> {
        match self.peek() {
            Token::Symbol(s) => {
                let op = match *s {
                    "+" => (BinaryOp::Add, PREC_ADD),
                    "-" => (BinaryOp::Sub, PREC_ADD),
                    "||" => (BinaryOp::Concat, PREC_ADD),
                    "*" => (BinaryOp::Mul, PREC_MUL),
                    "/" => (BinaryOp::Div, PREC_MUL),
                    "%" => (BinaryOp::Rem, PREC_MUL),
                    "=" => (BinaryOp::Eq, PREC_CMP),
                    "<>" => (BinaryOp::NotEq, PREC_CMP),
                    "<" => (BinaryOp::Lt, PREC_CMP),
                    "<=" => (BinaryOp::LtEq, PREC_CMP),
                    ">" => (BinaryOp::Gt, PREC_CMP),
                    ">=" => (BinaryOp::GtEq, PREC_CMP),
                    _ => return None,
                };
                Some(op)
            }
            t if t.is_keyword("AND") => Some((BinaryOp::And, PREC_AND)),
            t if t.is_keyword("OR") => Some((BinaryOp::Or, PREC_OR)),
            _ => None,
        }
    }

    fn expression(&mut self, min_prec: u8) -> Result<Expr, ExprError> {
        let mut left = self.prefix()?;

        loop {
            // Postfix predicates bind at comparison level
            if min_prec <= PREC_CMP {
                if self.peek().is_keyword("IS") {
                    self.advance();
                    let negated = if self.peek().is_keyword("NOT") {
                        self.advance();
                        true
                    } else {
                        false
                    };
                    self.expect_keyword("NULL")?;
                    left = Expr::IsNull {
                        expr: Box::new(left),
                        negated,
                    };
                    continue;
                }
                let not_in = self.peek().is_keyword("NOT") && self.peek_at(1).is_keyword("IN");
                if self.peek().is_keyword("IN") || not_in {
                    if not_in {
                        self.advance();
                    }
                    self.advance();
                    let list = self.argument_list()?;
                    left = Expr::InList {
                        expr: Box::new(left),
                        list,
                        negated: not_in,
                    };
                    continue;
                }
            }

            let Some((op, prec)) = self.infix() else {
                break;
            };
            if prec < min_prec {
                break;
            }
            self.advance();
            let right = self.expression(prec + 1)?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }

        Ok(left)
    }

    fn prefix(&mut self) -> Result<Expr, ExprError> {
        match self.advance() {
            Token::Number(raw) => {
                let value = match raw.parse::<i64>() {
                    Ok(i) => Value::Int(i),
                    Err(_) => Value::Decimal(BigDecimal::from_str(&raw).map_err(|_| {
                        ExprError::UnexpectedToken {
                            found: format!("number {raw}"),
                            expected: "a valid number".to_string(),
                        }
                    })?),
                };
                Ok(Expr::Literal(Some(value)))
            }
            Token::Str(s) => Ok(Expr::Literal(Some(Value::Text(s)))),
            Token::Symbol("-") => Ok(Expr::Negate(Box::new(self.expression(PREC_UNARY)?))),
            Token::Symbol("+") => self.expression(PREC_UNARY),
            Token::LParen => {
                let inner = self.expression(0)?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Token::Ident(name) => self.identifier(name),
            other => Err(ExprError::UnexpectedToken {
                found: other.describe(),
                expected: "an operand".to_string(),
            }),
        }
    }

    fn identifier(&mut self, name: String) -> Result<Expr, ExprError> {
        match name.to_ascii_uppercase().as_str() {
            "NULL" => return Ok(Expr::Literal(None)),
            "TRUE" => return Ok(Expr::Literal(Some(Value::Bool(true)))),
            "FALSE" => return Ok(Expr::Literal(Some(Value::Bool(false)))),
            "NOT" => return Ok(Expr::Not(Box::new(self.expression(PREC_NOT)?))),
            "CASE" => return self.case(),
            _ => {}
        }

        if *self.peek() == Token::LParen {
            let function =
                Function::from_name(&name).ok_or_else(|| ExprError::UnknownFunction(name.clone()))?;
            self.advance();
            let args = if *self.peek() == Token::RParen {
                self.advance();
                Vec::new()
            } else {
                self.arguments_until_close()?
            };
            let (min, max, expected) = function.arity();
            if args.len() < min || args.len() > max {
                return Err(ExprError::Arity {
                    function: function.name(),
                    expected,
                    got: args.len(),
                });
            }
            return Ok(Expr::Call(function, args));
        }

        Ok(Expr::Ident(name))
    }

    fn case(&mut self) -> Result<Expr, ExprError> {
        let mut branches = Vec::new();
        while self.peek().is_keyword("WHEN") {
            self.advance();
            let condition = self.expression(0)?;
            self.expect_keyword("THEN")?;
            let result = self.expression(0)?;
            branches.push((condition, result));
        }
        if branches.is_empty() {
            return Err(ExprError::UnexpectedToken {
                found: self.peek().describe(),
                expected: "WHEN".to_string(),
            });
        }
        let otherwise = if self.peek().is_keyword("ELSE") {
            self.advance();
            Some(Box::new(self.expression(0)?))
        } else {
            None
        };
        self.expect_keyword("END")?;
        Ok(Expr::Case {
            branches,
            otherwise,
        })
    }

    fn argument_list(&mut self) -> Result<Vec<Expr>, ExprError> {
        self.expect(Token::LParen)?;
        self.arguments_until_close()
    }

    fn arguments_until_close(&mut self) -> Result<Vec<Expr>, ExprError> {
        let mut args = vec![self.expression(0)?];
        loop {
            match self.advance() {
                Token::Comma => args.push(self.expression(0)?),
                Token::RParen => return Ok(args),
                other => {
                    return Err(ExprError::UnexpectedToken {
                        found: other.describe(),
                        expected: "',' or ')'".to_string(),
                    })
                }
            }
        }
    }
}

// ============================================================================
// Evaluation
// ============================================================================

fn evaluate_binary(
    op: BinaryOp,
    left: &Expr,
    right: &Expr,
    scope: &dyn Scope,
) -> Result<Option<Value>, ExprError> {
    // Three-valued logic; the right side is skipped when the left decides
    match op {
        BinaryOp::And => {
            let l = left.evaluate(scope)?.map(|v| v.is_truthy());
            if l == Some(false) {
                return Ok(Some(Value::Bool(false)));
            }
            let r = right.evaluate(scope)?.map(|v| v.is_truthy());
            return Ok(match (l, r) {
                (_, Some(false)) => Some(Value::Bool(false)),
                (Some(true), Some(true)) => Some(Value::Bool(true)),
                _ => None,
            });
        }
        BinaryOp::Or => {
            let l = left.evaluate(scope)?.map(|v| v.is_truthy());
            if l == Some(true) {
                return Ok(Some(Value::Bool(true)));
            }
            let r = right.evaluate(scope)?.map(|v| v.is_truthy());
            return Ok(match (l, r) {
                (_, Some(true)) => Some(Value::Bool(true)),
                (Some(false), Some(false)) => Some(Value::Bool(false)),
                _ => None,
            });
        }
        _ => {}
    }

    let (Some(l), Some(r)) = (left.evaluate(scope)?, right.evaluate(scope)?) else {
        return Ok(None);
    };

    match op {
        BinaryOp::Concat => Ok(Some(Value::Text(format!("{l}{r}")))),
        BinaryOp::Eq
        | BinaryOp::NotEq
        | BinaryOp::Lt
        | BinaryOp::LtEq
        | BinaryOp::Gt
        | BinaryOp::GtEq => {
            let ordering = compare(&l, &r).ok_or_else(|| mismatch(op, &l, &r))?;
            let result = match op {
                BinaryOp::Eq => ordering == Ordering::Equal,
                BinaryOp::NotEq => ordering != Ordering::Equal,
                BinaryOp::Lt => ordering == Ordering::Less,
                BinaryOp::LtEq => ordering != Ordering::Greater,
                BinaryOp::Gt => ordering == Ordering::Greater,
                _ => ordering != Ordering::Less,
            };
            Ok(Some(Value::Bool(result)))
        }
        _ => arithmetic(op, &l, &r).map(Some),
    }
}

fn mismatch(op: BinaryOp, l: &Value, r: &Value) -> ExprError {
    ExprError::TypeMismatch {
        op: op.symbol().to_string(),
        left: l.type_name().to_string(),
        right: r.type_name().to_string(),
    }
}

fn arithmetic(op: BinaryOp, l: &Value, r: &Value) -> Result<Value, ExprError> {
    if let (Value::Int(a), Value::Int(b)) = (l, r) {
        let checked = match op {
            BinaryOp::Add => a.checked_add(*b),
            BinaryOp::Sub => a.checked_sub(*b),
            BinaryOp::Mul => a.checked_mul(*b),
            BinaryOp::Rem if *b == 0 => return Err(ExprError::DivisionByZero),
            BinaryOp::Rem => a.checked_rem(*b),
            // Division falls through to decimal arithmetic
            _ => None,
        };
        if let Some(result) = checked {
            return Ok(Value::Int(result));
        }
    }

    let a = l.to_decimal().ok_or_else(|| mismatch(op, l, r))?;
    let b = r.to_decimal().ok_or_else(|| mismatch(op, l, r))?;
    let result = match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Div | BinaryOp::Rem if b.is_zero() => return Err(ExprError::DivisionByZero),
        BinaryOp::Div => a / b,
        BinaryOp::Rem => a % b,
        _ => return Err(mismatch(op, l, r)),
    };
    Ok(Value::Decimal(result))
}

/// Ordering between two values: numeric when both sides are numeric, date-wise
/// for dates, text otherwise
fn compare(l: &Value, r: &Value) -> Option<Ordering> {
    match (l, r) {
        (Value::Date(a), Value::Date(b)) => Some(a.cmp(b)),
        (Value::DateTime(a), Value::DateTime(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        (Value::Text(a), Value::Text(b)) => Some(a.cmp(b)),
        _ => match (l.to_decimal(), r.to_decimal()) {
            (Some(a), Some(b)) => a.partial_cmp(&b),
            _ => Some(l.to_string().cmp(&r.to_string())),
        },
    }
}

fn text_arg(args: &[Expr], index: usize, scope: &dyn Scope) -> Result<Option<String>, ExprError> {
    Ok(args[index].evaluate(scope)?.map(|v| v.to_string()))
}

fn int_arg(
    function: Function,
    args: &[Expr],
    index: usize,
    scope: &dyn Scope,
) -> Result<Option<i64>, ExprError> {
    match args[index].evaluate(scope)? {
        None => Ok(None),
        Some(v) => v
            .to_i64()
            .map(Some)
            .ok_or_else(|| ExprError::InvalidArgument {
                function: function.name(),
                detail: format!("expected an integer, got {}", v.type_name()),
            }),
    }
}

fn call(function: Function, args: &[Expr], scope: &dyn Scope) -> Result<Option<Value>, ExprError> {
    let value = match function {
        Function::Trim => text_arg(args, 0, scope)?.map(|s| Value::Text(s.trim().to_string())),
        Function::Upper => text_arg(args, 0, scope)?.map(|s| Value::Text(s.to_uppercase())),
        Function::Lower => text_arg(args, 0, scope)?.map(|s| Value::Text(s.to_lowercase())),
        Function::Len => text_arg(args, 0, scope)?
            .map(|s| Value::Int(i64::try_from(s.chars().count()).unwrap_or(i64::MAX))),
        Function::IsBlank => {
            let blank = args[0]
                .evaluate(scope)?
                .map_or(true, |v| v.is_blank());
            Some(Value::Bool(blank))
        }
        Function::Substr => {
            let Some(text) = text_arg(args, 0, scope)? else {
                return Ok(None);
            };
            let Some(start) = int_arg(function, args, 1, scope)? else {
                return Ok(None);
            };
            let skip = usize::try_from(start.max(1) - 1).unwrap_or(0);
            let taken: String = match args.get(2) {
                Some(_) => {
                    let Some(len) = int_arg(function, args, 2, scope)? else {
                        return Ok(None);
                    };
                    let len = usize::try_from(len.max(0)).unwrap_or(0);
                    text.chars().skip(skip).take(len).collect()
                }
                None => text.chars().skip(skip).collect(),
            };
            Some(Value::Text(taken))
        }
        Function::Left | Function::Right => {
            let Some(text) = text_arg(args, 0, scope)? else {
                return Ok(None);
            };
            let Some(n) = int_arg(function, args, 1, scope)? else {
                return Ok(None);
            };
            let n = usize::try_from(n.max(0)).unwrap_or(0);
            let count = text.chars().count();
            let taken: String = if function == Function::Left {
                text.chars().take(n).collect()
            } else {
                text.chars().skip(count.saturating_sub(n)).collect()
            };
            Some(Value::Text(taken))
        }
        Function::Replace => {
            let (Some(text), Some(from), Some(to)) = (
                text_arg(args, 0, scope)?,
                text_arg(args, 1, scope)?,
                text_arg(args, 2, scope)?,
            ) else {
                return Ok(None);
            };
            if from.is_empty() {
                Some(Value::Text(text))
            } else {
                Some(Value::Text(text.replace(&from, &to)))
            }
        }
        Function::Concat => {
            let mut out = String::new();
            for arg in args {
                if let Some(v) = arg.evaluate(scope)? {
                    out.push_str(&v.to_string());
                }
            }
            Some(Value::Text(out))
        }
        Function::Coalesce => {
            for arg in args {
                if let Some(v) = arg.evaluate(scope)? {
                    return Ok(Some(v));
                }
            }
            None
        }
        Function::NullIf => {
            let Some(a) = args[0].evaluate(scope)? else {
                return Ok(None);
            };
            match args[1].evaluate(scope)? {
                Some(b) if compare(&a, &b) == Some(Ordering::Equal) => None,
                _ => Some(a),
            }
        }
        Function::Round => {
            let Some(v) = args[0].evaluate(scope)? else {
                return Ok(None);
            };
            let digits = match args.get(1) {
                Some(_) => int_arg(function, args, 1, scope)?
                    .unwrap_or(0)
                    .clamp(-MAX_DECIMAL_EXPONENT, MAX_DECIMAL_EXPONENT),
                None => 0,
            };
            let d = v.to_decimal().ok_or_else(|| ExprError::InvalidArgument {
                function: function.name(),
                detail: format!("expected a number, got {}", v.type_name()),
            })?;
            let rounded = d.with_scale_round(digits, RoundingMode::HalfUp);
            if digits <= 0 {
                match rounded.to_i64() {
                    Some(i) => Some(Value::Int(i)),
                    None => Some(Value::Decimal(rounded)),
                }
            } else {
                Some(Value::Decimal(rounded))
            }
        }
        Function::Abs => match args[0].evaluate(scope)? {
            None => None,
            Some(Value::Int(i)) => Some(Value::Int(i.saturating_abs())),
            Some(v) => Some(Value::Decimal(
                v.to_decimal()
                    .ok_or_else(|| ExprError::InvalidArgument {
                        function: function.name(),
                        detail: format!("expected a number, got {}", v.type_name()),
                    })?
                    .abs(),
            )),
        },
        Function::Field => {
            let Some(path) = text_arg(args, 0, scope)? else {
                return Ok(None);
            };
            let attribute = match args.get(1) {
                Some(_) => text_arg(args, 1, scope)?,
                None => None,
            };
            scope.field(&path, attribute.as_deref())
        }
        Function::DaysBetween => {
            let (Some(a), Some(b)) = (args[0].evaluate(scope)?, args[1].evaluate(scope)?) else {
                return Ok(None);
            };
            let as_date = |v: &Value| match v {
                Value::Date(d) => Some(*d),
                Value::DateTime(dt) => Some(dt.date()),
                Value::Text(s) => chrono::NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").ok(),
                _ => None,
            };
            match (as_date(&a), as_date(&b)) {
                (Some(from), Some(to)) => Some(Value::Int((to - from).num_days())),
                _ => {
                    return Err(ExprError::InvalidArgument {
                        function: function.name(),
                        detail: "expected two dates".to_string(),
                    })
                }
            }
        }
    };
    Ok(value)
}
