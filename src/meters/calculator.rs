use chrono::{DateTime, Months, Utc};
use log::debug;
use thiserror::Error;

use crate::units::{SiExp, Unit};

#[derive(Error, Debug, PartialEq)]
pub enum FormulaError {
    #[error("unexpected token \"{0}\" in formula")]
    UnexpectedToken(String),
    #[error("unknown unit \"{0}\" in formula")]
    UnknownUnit(String),
    #[error("unknown field \"{0}\" in formula")]
    UnknownField(String),
    #[error("incompatible dimensions for {0}")]
    IncompatibleDimensions(&'static str),
    #[error("formula ended unexpectedly")]
    UnexpectedEnd,
}

/// A value inside a formula: a magnitude in base units plus its exponent
/// vector. Timestamps carry the unix_timestamp dimension.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalcValue {
    pub v: f64,
    pub exp: SiExp,
}

impl CalcValue {
    pub fn number(v: f64) -> CalcValue {
        CalcValue { v, exp: SiExp::new() }
    }

    pub fn with_unit(v: f64, unit: Unit) -> CalcValue {
        CalcValue { v: v * unit.scale(), exp: unit.exp() }
    }

    /// Express this value in the given display unit, when dimensions agree.
    pub fn in_unit(&self, unit: Unit) -> Option<f64> {
        if self.exp != unit.exp() {
            return None;
        }
        Some(self.v / unit.scale())
    }
}

fn is_timestamp(e: &SiExp) -> bool {
    *e == SiExp::new().unix_timestamp(1)
}

fn is_months(e: &SiExp) -> bool {
    *e == SiExp::new().month(1)
}

fn is_seconds(e: &SiExp) -> bool {
    *e == SiExp::new().s(1)
}

fn add_months(ts: f64, months: f64) -> Option<f64> {
    let dt = DateTime::<Utc>::from_timestamp(ts as i64, 0)?;
    let n = months.round().abs() as u32;
    let shifted = if months >= 0.0 {
        dt.checked_add_months(Months::new(n))?
    } else {
        dt.checked_sub_months(Months::new(n))?
    };
    Some(shifted.timestamp() as f64)
}

/// Addition and subtraction require compatible exponents, with the special
/// timestamp rules: ts +- duration stays a ts (calendar aware for months)
/// and ts - ts is a duration in seconds. ts + ts is rejected.
fn apply_additive(op: char, a: CalcValue, b: CalcValue) -> Result<CalcValue, FormulaError> {
    let sign = if op == '+' { 1.0 } else { -1.0 };

    if is_timestamp(&a.exp) {
        if is_months(&b.exp) {
            let v = add_months(a.v, sign * b.v)
                .ok_or(FormulaError::IncompatibleDimensions("timestamp month shift"))?;
            return Ok(CalcValue { v, exp: a.exp });
        }
        if is_seconds(&b.exp) {
            return Ok(CalcValue { v: a.v + sign * b.v, exp: a.exp });
        }
        if is_timestamp(&b.exp) {
            if op == '-' {
                return Ok(CalcValue { v: a.v - b.v, exp: SiExp::new().s(1) });
            }
            return Err(FormulaError::IncompatibleDimensions("timestamp + timestamp"));
        }
        return Err(FormulaError::IncompatibleDimensions("timestamp arithmetic"));
    }

    if a.exp != b.exp {
        return Err(FormulaError::IncompatibleDimensions("addition"));
    }
    Ok(CalcValue { v: a.v + sign * b.v, exp: a.exp })
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Op(char),
    LParen,
    RParen,
}

fn tokenize(s: &str) -> Result<Vec<Token>, FormulaError> {
    let mut out = Vec::new();
    let mut chars = s.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' => {
                chars.next();
            }
            '+' | '-' | '*' | '/' => {
                out.push(Token::Op(c));
                chars.next();
            }
            '(' => {
                out.push(Token::LParen);
                chars.next();
            }
            ')' => {
                out.push(Token::RParen);
                chars.next();
            }
            '0'..='9' | '.' => {
                let mut num = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_digit() || d == '.' {
                        num.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let v: f64 = num
                    .parse()
                    .map_err(|_| FormulaError::UnexpectedToken(num.clone()))?;
                out.push(Token::Number(v));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut ident = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_alphanumeric() || d == '_' {
                        ident.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                out.push(Token::Ident(ident));
            }
            other => return Err(FormulaError::UnexpectedToken(other.to_string())),
        }
    }
    Ok(out)
}

fn unit_from_word(word: &str) -> Option<Unit> {
    let singular = word.strip_suffix('s').unwrap_or(word);
    match singular {
        "second" | "sec" => return Some(Unit::Second),
        "minute" => return Some(Unit::Minute),
        "hour" => return Some(Unit::Hour),
        "day" => return Some(Unit::Day),
        "month" => return Some(Unit::Month),
        "year" => return Some(Unit::Year),
        _ => {}
    }
    Unit::from_suffix(word).ok().or_else(|| Unit::from_suffix(singular).ok())
}

/// Resolver for identifiers: counters bound from the matched entry and
/// the meter's already extracted numeric fields.
pub trait FieldResolver {
    fn resolve(&self, name: &str) -> Option<CalcValue>;
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    resolver: &'a dyn FieldResolver,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn expr(&mut self) -> Result<CalcValue, FormulaError> {
        let mut acc = self.term()?;
        while let Some(Token::Op(op @ ('+' | '-'))) = self.peek().cloned() {
            self.next();
            let rhs = self.term()?;
            acc = apply_additive(op, acc, rhs)?;
        }
        Ok(acc)
    }

    fn term(&mut self) -> Result<CalcValue, FormulaError> {
        let mut acc = self.factor()?;
        while let Some(Token::Op(op @ ('*' | '/'))) = self.peek().cloned() {
            self.next();
            let rhs = self.factor()?;
            acc = match op {
                '*' => CalcValue { v: acc.v * rhs.v, exp: acc.exp.mul(&rhs.exp) },
                _ => CalcValue { v: acc.v / rhs.v, exp: acc.exp.div(&rhs.exp) },
            };
        }
        Ok(acc)
    }

    fn factor(&mut self) -> Result<CalcValue, FormulaError> {
        match self.next().ok_or(FormulaError::UnexpectedEnd)? {
            Token::Number(v) => {
                /* A unit word may follow a literal, eg "1 month". */
                if let Some(Token::Ident(word)) = self.peek().cloned() {
                    if let Some(unit) = unit_from_word(&word) {
                        self.next();
                        return Ok(CalcValue::with_unit(v, unit));
                    }
                }
                Ok(CalcValue::number(v))
            }
            Token::Ident(name) if name == "sqrt" => {
                match self.next() {
                    Some(Token::LParen) => {}
                    _ => return Err(FormulaError::UnexpectedToken("sqrt".into())),
                }
                let inner = self.expr()?;
                match self.next() {
                    Some(Token::RParen) => {}
                    _ => return Err(FormulaError::UnexpectedEnd),
                }
                let exp = inner
                    .exp
                    .sqrt()
                    .ok_or(FormulaError::IncompatibleDimensions("sqrt"))?;
                Ok(CalcValue { v: inner.v.sqrt(), exp })
            }
            Token::Ident(name) => self
                .resolver
                .resolve(&name)
                .ok_or(FormulaError::UnknownField(name)),
            Token::Op('-') => {
                let v = self.factor()?;
                Ok(CalcValue { v: -v.v, exp: v.exp })
            }
            Token::LParen => {
                let v = self.expr()?;
                match self.next() {
                    Some(Token::RParen) => Ok(v),
                    _ => Err(FormulaError::UnexpectedEnd),
                }
            }
            t => Err(FormulaError::UnexpectedToken(format!("{t:?}"))),
        }
    }
}

/// Evaluate a formula against the resolver. The caller converts the
/// resulting base value into the field's display unit.
pub fn evaluate(formula: &str, resolver: &dyn FieldResolver) -> Result<CalcValue, FormulaError> {
    let tokens = tokenize(formula)?;
    let mut p = Parser { tokens, pos: 0, resolver };
    let v = p.expr()?;
    if p.pos != p.tokens.len() {
        debug!("formula \"{formula}\" has trailing tokens");
        return Err(FormulaError::UnexpectedToken("trailing input".into()));
    }
    Ok(v)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct MapResolver(HashMap<String, CalcValue>);

    impl FieldResolver for MapResolver {
        fn resolve(&self, name: &str) -> Option<CalcValue> {
            self.0.get(name).copied()
        }
    }

    fn resolver() -> MapResolver {
        let mut m = HashMap::new();
        /* 2022-09-23 14:59:00 utc */
        m.insert("meter_datetime".to_string(), CalcValue {
            v: 1663945140.0,
            exp: SiExp::new().unix_timestamp(1),
        });
        m.insert("storage_counter".to_string(), CalcValue::number(9.0));
        m.insert("total_energy".to_string(), CalcValue::with_unit(15.0, Unit::Kwh));
        m.insert("on_time".to_string(), CalcValue::with_unit(2.0, Unit::Hour));
        MapResolver(m)
    }

    #[test]
    fn plain_arithmetic_with_units() {
        let v = evaluate("total_energy / on_time", &resolver()).unwrap();
        assert_eq!(v.exp, Unit::Kw.exp());
        assert!((v.in_unit(Unit::Kw).unwrap() - 7.5).abs() < 1e-9);
    }

    #[test]
    fn month_arithmetic_is_calendar_aware() {
        let v = evaluate("meter_datetime - ((storage_counter - 1 counter) * 1 month)", &resolver())
            .unwrap();
        assert!(is_timestamp(&v.exp));
        let dt = DateTime::<Utc>::from_timestamp(v.v as i64, 0).unwrap();
        /* Eight months before 2022-09-23. */
        assert_eq!(dt.format("%Y-%m-%d").to_string(), "2022-01-23");
    }

    #[test]
    fn timestamp_plus_seconds() {
        let v = evaluate("meter_datetime + 3600 s", &resolver()).unwrap();
        assert!(is_timestamp(&v.exp));
        assert_eq!(v.v, 1663945140.0 + 3600.0);
    }

    #[test]
    fn timestamp_plus_timestamp_is_rejected() {
        let r = evaluate("meter_datetime + meter_datetime", &resolver());
        assert!(matches!(r, Err(FormulaError::IncompatibleDimensions(_))));
    }

    #[test]
    fn timestamp_difference_is_seconds() {
        let v = evaluate("meter_datetime - meter_datetime", &resolver()).unwrap();
        assert!(is_seconds(&v.exp));
        assert_eq!(v.v, 0.0);
    }

    #[test]
    fn mismatched_addition_is_rejected() {
        let r = evaluate("total_energy + on_time", &resolver());
        assert!(matches!(r, Err(FormulaError::IncompatibleDimensions(_))));
    }

    #[test]
    fn sqrt_halves_dimension() {
        let mut m = HashMap::new();
        m.insert("area".to_string(), CalcValue { v: 9.0, exp: SiExp::new().m(2) });
        let v = evaluate("sqrt(area)", &MapResolver(m)).unwrap();
        assert_eq!(v.exp, SiExp::new().m(1));
        assert_eq!(v.v, 3.0);
    }

    #[test]
    fn unknown_field_is_an_error() {
        assert_eq!(
            evaluate("does_not_exist * 2", &resolver()),
            Err(FormulaError::UnknownField("does_not_exist".to_string()))
        );
    }
}
