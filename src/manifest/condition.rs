//! Predicate language for conditional manifest items.
//!
//! Conditions are small boolean expressions over an evaluation context:
//! `vpn_connected == true && network_location != 'office'`. Comparisons,
//! `&&`, `||`, `!` and parentheses are supported, plus the helper
//! predicates `is_business_hours()` and `is_weekday()` which expand into
//! plain expressions at parse time.

use std::collections::HashMap;

use chrono::{Datelike, Local, NaiveDate, NaiveTime, Timelike};
use thiserror::Error;

use crate::error::DnshieldError;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConditionError {
    #[error("unexpected character '{0}'")]
    UnexpectedChar(char),
    #[error("unexpected token '{0}'")]
    UnexpectedToken(String),
    #[error("unexpected end of condition")]
    UnexpectedEnd,
    #[error("unknown variable '{0}'")]
    UnknownVariable(String),
    #[error("unknown function '{0}'")]
    UnknownFunction(String),
    #[error("type mismatch: {0}")]
    TypeMismatch(String),
    #[error("invalid time literal '{0}'")]
    InvalidTime(String),
}

impl From<ConditionError> for DnshieldError {
    fn from(err: ConditionError) -> Self {
        DnshieldError::Condition(err.to_string())
    }
}

/// A typed value produced by the context or a literal.
#[derive(Debug, Clone, PartialEq)]
pub enum CondValue {
    Str(String),
    Num(f64),
    Bool(bool),
    Time(NaiveTime),
}

/// The variables conditions are evaluated against.
///
/// Host integrations fill in what they know; everything defaults to empty
/// or false so a partially-populated context still evaluates.
#[derive(Debug, Clone)]
pub struct EvaluationContext {
    pub time_of_day: NaiveTime,
    /// Lowercase English day name.
    pub day_of_week: String,
    pub is_weekend: bool,
    /// ISO `YYYY-MM-DD`.
    pub current_date: String,
    pub os_version: String,
    pub device_type: String,
    pub device_model: String,
    pub network_location: String,
    pub network_ssid: String,
    pub vpn_connected: bool,
    pub vpn_identifier: String,
    pub user_group: String,
    pub device_identifier: String,
    pub security_score: f64,
    pub custom: HashMap<String, CondValue>,
}

impl Default for EvaluationContext {
    fn default() -> Self {
        Self {
            time_of_day: NaiveTime::from_hms_opt(0, 0, 0).expect("midnight is valid"),
            day_of_week: String::new(),
            is_weekend: false,
            current_date: String::new(),
            os_version: String::new(),
            device_type: String::new(),
            device_model: String::new(),
            network_location: String::new(),
            network_ssid: String::new(),
            vpn_connected: false,
            vpn_identifier: String::new(),
            user_group: String::new(),
            device_identifier: String::new(),
            security_score: 0.0,
            custom: HashMap::new(),
        }
    }
}

impl EvaluationContext {
    /// A context stamped with the local wall clock.
    pub fn now() -> Self {
        let now = Local::now();
        let date = NaiveDate::from_ymd_opt(now.year(), now.month(), now.day())
            .expect("current date is valid");
        let weekday = now.weekday();
        let day_name = match weekday {
            chrono::Weekday::Mon => "monday",
            chrono::Weekday::Tue => "tuesday",
            chrono::Weekday::Wed => "wednesday",
            chrono::Weekday::Thu => "thursday",
            chrono::Weekday::Fri => "friday",
            chrono::Weekday::Sat => "saturday",
            chrono::Weekday::Sun => "sunday",
        };
        Self {
            time_of_day: NaiveTime::from_hms_opt(now.hour(), now.minute(), now.second())
                .expect("current time is valid"),
            day_of_week: day_name.to_string(),
            is_weekend: matches!(weekday, chrono::Weekday::Sat | chrono::Weekday::Sun),
            current_date: date.format("%Y-%m-%d").to_string(),
            ..Default::default()
        }
    }

    fn get(&self, name: &str) -> Option<CondValue> {
        match name {
            "time_of_day" => Some(CondValue::Time(self.time_of_day)),
            "day_of_week" => Some(CondValue::Str(self.day_of_week.clone())),
            "is_weekend" => Some(CondValue::Bool(self.is_weekend)),
            "current_date" => Some(CondValue::Str(self.current_date.clone())),
            "os_version" => Some(CondValue::Str(self.os_version.clone())),
            "device_type" => Some(CondValue::Str(self.device_type.clone())),
            "device_model" => Some(CondValue::Str(self.device_model.clone())),
            "network_location" => Some(CondValue::Str(self.network_location.clone())),
            "network_ssid" => Some(CondValue::Str(self.network_ssid.clone())),
            "vpn_connected" => Some(CondValue::Bool(self.vpn_connected)),
            "vpn_identifier" => Some(CondValue::Str(self.vpn_identifier.clone())),
            "user_group" => Some(CondValue::Str(self.user_group.clone())),
            "device_identifier" => Some(CondValue::Str(self.device_identifier.clone())),
            "security_score" => Some(CondValue::Num(self.security_score)),
            custom => self.custom.get(custom).cloned(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(f64),
    True,
    False,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Not,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<Token>, ConditionError> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
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
                        None => return Err(ConditionError::UnexpectedEnd),
                    }
                }
                tokens.push(Token::Str(s));
            }
            '&' => {
                chars.next();
                if chars.next() != Some('&') {
                    return Err(ConditionError::UnexpectedChar('&'));
                }
                tokens.push(Token::And);
            }
            '|' => {
                chars.next();
                if chars.next() != Some('|') {
                    return Err(ConditionError::UnexpectedChar('|'));
                }
                tokens.push(Token::Or);
            }
            '=' => {
                chars.next();
                if chars.next() != Some('=') {
                    return Err(ConditionError::UnexpectedChar('='));
                }
                tokens.push(Token::Eq);
            }
            '!' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Ne);
                } else {
                    tokens.push(Token::Not);
                }
            }
            '<' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Le);
                } else {
                    tokens.push(Token::Lt);
                }
            }
            '>' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Ge);
                } else {
                    tokens.push(Token::Gt);
                }
            }
            c if c.is_ascii_digit() => {
                let mut s = String::new();
                while let Some(&ch) = chars.peek() {
                    if ch.is_ascii_digit() || ch == '.' || ch == ':' {
                        s.push(ch);
                        chars.next();
                    } else {
                        break;
                    }
                }
                if s.contains(':') {
                    // Bare HH:MM literal
                    tokens.push(Token::Str(s));
                } else {
                    let num = s
                        .parse::<f64>()
                        .map_err(|_| ConditionError::UnexpectedToken(s))?;
                    tokens.push(Token::Num(num));
                }
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut s = String::new();
                while let Some(&ch) = chars.peek() {
                    if ch.is_ascii_alphanumeric() || ch == '_' {
                        s.push(ch);
                        chars.next();
                    } else {
                        break;
                    }
                }
                match s.as_str() {
                    "true" => tokens.push(Token::True),
                    "false" => tokens.push(Token::False),
                    _ => tokens.push(Token::Ident(s)),
                }
            }
            other => return Err(ConditionError::UnexpectedChar(other)),
        }
    }

    Ok(tokens)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Var(String),
    Str(String),
    Num(f64),
    Bool(bool),
}

/// A parsed condition, ready for repeated evaluation.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Literal(bool),
    Var(String),
    Not(Box<Predicate>),
    And(Box<Predicate>, Box<Predicate>),
    Or(Box<Predicate>, Box<Predicate>),
    Cmp(Operand, CmpOp, Operand),
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
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, token: Token) -> Result<(), ConditionError> {
        match self.next() {
            Some(t) if t == token => Ok(()),
            Some(t) => Err(ConditionError::UnexpectedToken(format!("{:?}", t))),
            None => Err(ConditionError::UnexpectedEnd),
        }
    }

    fn parse_or(&mut self) -> Result<Predicate, ConditionError> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.next();
            let right = self.parse_and()?;
            left = Predicate::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Predicate, ConditionError> {
        let mut left = self.parse_unary()?;
        while self.peek() == Some(&Token::And) {
            self.next();
            let right = self.parse_unary()?;
            left = Predicate::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Predicate, ConditionError> {
        if self.peek() == Some(&Token::Not) {
            self.next();
            return Ok(Predicate::Not(Box::new(self.parse_unary()?)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Predicate, ConditionError> {
        match self.next().ok_or(ConditionError::UnexpectedEnd)? {
            Token::LParen => {
                let inner = self.parse_or()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Token::True => Ok(Predicate::Literal(true)),
            Token::False => Ok(Predicate::Literal(false)),
            Token::Ident(name) => {
                // Helper call?
                if self.peek() == Some(&Token::LParen) {
                    self.next();
                    self.expect(Token::RParen)?;
                    return expand_helper(&name);
                }
                self.maybe_comparison(Operand::Var(name))
            }
            Token::Str(s) => self.maybe_comparison(Operand::Str(s)),
            Token::Num(n) => self.maybe_comparison(Operand::Num(n)),
            other => Err(ConditionError::UnexpectedToken(format!("{:?}", other))),
        }
    }

    fn maybe_comparison(&mut self, left: Operand) -> Result<Predicate, ConditionError> {
        let op = match self.peek() {
            Some(Token::Eq) => CmpOp::Eq,
            Some(Token::Ne) => CmpOp::Ne,
            Some(Token::Lt) => CmpOp::Lt,
            Some(Token::Le) => CmpOp::Le,
            Some(Token::Gt) => CmpOp::Gt,
            Some(Token::Ge) => CmpOp::Ge,
            _ => {
                // No operator: a bare variable is a truthiness test
                return match left {
                    Operand::Var(name) => Ok(Predicate::Var(name)),
                    Operand::Bool(b) => Ok(Predicate::Literal(b)),
                    other => Err(ConditionError::UnexpectedToken(format!("{:?}", other))),
                };
            }
        };
        self.next();

        let right = match self.next().ok_or(ConditionError::UnexpectedEnd)? {
            Token::Ident(name) => Operand::Var(name),
            Token::Str(s) => Operand::Str(s),
            Token::Num(n) => Operand::Num(n),
            Token::True => Operand::Bool(true),
            Token::False => Operand::Bool(false),
            other => return Err(ConditionError::UnexpectedToken(format!("{:?}", other))),
        };
        Ok(Predicate::Cmp(left, op, right))
    }

}

fn expand_helper(name: &str) -> Result<Predicate, ConditionError> {
    match name {
        // Business hours: 09:00..=17:00 on a weekday
        "is_business_hours" => Ok(Predicate::And(
            Box::new(Predicate::And(
                Box::new(Predicate::Cmp(
                    Operand::Var("time_of_day".into()),
                    CmpOp::Ge,
                    Operand::Str("09:00".into()),
                )),
                Box::new(Predicate::Cmp(
                    Operand::Var("time_of_day".into()),
                    CmpOp::Le,
                    Operand::Str("17:00".into()),
                )),
            )),
            Box::new(Predicate::Not(Box::new(Predicate::Var(
                "is_weekend".into(),
            )))),
        )),
        "is_weekday" => Ok(Predicate::Not(Box::new(Predicate::Var(
            "is_weekend".into(),
        )))),
        other => Err(ConditionError::UnknownFunction(other.to_string())),
    }
}

impl Predicate {
    pub fn parse(input: &str) -> Result<Self, ConditionError> {
        let tokens = tokenize(input)?;
        let mut parser = Parser { tokens, pos: 0 };
        let predicate = parser.parse_or()?;
        if parser.peek().is_some() {
            return Err(ConditionError::UnexpectedToken(format!(
                "{:?}",
                parser.peek()
            )));
        }
        Ok(predicate)
    }

    pub fn evaluate(&self, ctx: &EvaluationContext) -> Result<bool, ConditionError> {
        match self {
            Predicate::Literal(b) => Ok(*b),
            Predicate::Var(name) => match ctx
                .get(name)
                .ok_or_else(|| ConditionError::UnknownVariable(name.clone()))?
            {
                CondValue::Bool(b) => Ok(b),
                CondValue::Str(s) => Ok(!s.is_empty()),
                CondValue::Num(n) => Ok(n != 0.0),
                CondValue::Time(_) => Err(ConditionError::TypeMismatch(format!(
                    "'{}' is not boolean",
                    name
                ))),
            },
            Predicate::Not(inner) => Ok(!inner.evaluate(ctx)?),
            Predicate::And(a, b) => Ok(a.evaluate(ctx)? && b.evaluate(ctx)?),
            Predicate::Or(a, b) => Ok(a.evaluate(ctx)? || b.evaluate(ctx)?),
            Predicate::Cmp(left, op, right) => {
                let left = resolve(left, ctx)?;
                let right = resolve(right, ctx)?;
                compare(&left, *op, &right)
            }
        }
    }
}

/// Parse and evaluate a condition in one step.
pub fn evaluate(condition: &str, ctx: &EvaluationContext) -> Result<bool, ConditionError> {
    Predicate::parse(condition)?.evaluate(ctx)
}

fn resolve(operand: &Operand, ctx: &EvaluationContext) -> Result<CondValue, ConditionError> {
    match operand {
        Operand::Var(name) => ctx
            .get(name)
            .ok_or_else(|| ConditionError::UnknownVariable(name.clone())),
        Operand::Str(s) => Ok(CondValue::Str(s.clone())),
        Operand::Num(n) => Ok(CondValue::Num(*n)),
        Operand::Bool(b) => Ok(CondValue::Bool(*b)),
    }
}

fn parse_time(s: &str) -> Result<NaiveTime, ConditionError> {
    NaiveTime::parse_from_str(s, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M:%S"))
        .map_err(|_| ConditionError::InvalidTime(s.to_string()))
}

fn compare(left: &CondValue, op: CmpOp, right: &CondValue) -> Result<bool, ConditionError> {
    use std::cmp::Ordering;

    let ordering: Ordering = match (left, right) {
        (CondValue::Num(a), CondValue::Num(b)) => a
            .partial_cmp(b)
            .ok_or_else(|| ConditionError::TypeMismatch("NaN comparison".into()))?,
        (CondValue::Time(a), CondValue::Time(b)) => a.cmp(b),
        (CondValue::Time(a), CondValue::Str(b)) => a.cmp(&parse_time(b)?),
        (CondValue::Str(a), CondValue::Time(b)) => parse_time(a)?.cmp(b),
        (CondValue::Bool(a), CondValue::Bool(b)) => {
            return match op {
                CmpOp::Eq => Ok(a == b),
                CmpOp::Ne => Ok(a != b),
                _ => Err(ConditionError::TypeMismatch("ordering on booleans".into())),
            };
        }
        (CondValue::Bool(a), CondValue::Str(b)) | (CondValue::Str(b), CondValue::Bool(a)) => {
            let b = matches!(b.as_str(), "true" | "1" | "yes");
            return match op {
                CmpOp::Eq => Ok(*a == b),
                CmpOp::Ne => Ok(*a != b),
                _ => Err(ConditionError::TypeMismatch("ordering on booleans".into())),
            };
        }
        (CondValue::Str(a), CondValue::Num(b)) => match a.parse::<f64>() {
            Ok(a) => a
                .partial_cmp(b)
                .ok_or_else(|| ConditionError::TypeMismatch("NaN comparison".into()))?,
            Err(_) => {
                return Err(ConditionError::TypeMismatch(format!(
                    "'{}' is not numeric",
                    a
                )));
            }
        },
        (CondValue::Num(a), CondValue::Str(b)) => match b.parse::<f64>() {
            Ok(b) => a
                .partial_cmp(&b)
                .ok_or_else(|| ConditionError::TypeMismatch("NaN comparison".into()))?,
            Err(_) => {
                return Err(ConditionError::TypeMismatch(format!(
                    "'{}' is not numeric",
                    b
                )));
            }
        },
        (CondValue::Str(a), CondValue::Str(b)) => a.cmp(b),
        (a, b) => {
            return Err(ConditionError::TypeMismatch(format!(
                "cannot compare {:?} with {:?}",
                a, b
            )));
        }
    };

    Ok(match op {
        CmpOp::Eq => ordering == Ordering::Equal,
        CmpOp::Ne => ordering != Ordering::Equal,
        CmpOp::Lt => ordering == Ordering::Less,
        CmpOp::Le => ordering != Ordering::Greater,
        CmpOp::Gt => ordering == Ordering::Greater,
        CmpOp::Ge => ordering != Ordering::Less,
    })
}
