//! Symbolic algebra used by component and property constraints.
//!
//! An [`Expression`] is a small tree over named [`Symbol`]s and floating point
//! constants. Expressions are built either programmatically (through the
//! arithmetic operator impls) or parsed from text with [`Expression::parse`].

use nom::{
    IResult,
    branch::alt,
    bytes::complete::tag,
    character::complete::{alpha1, alphanumeric1, char, multispace0, one_of},
    combinator::{all_consuming, map, recognize},
    multi::many0,
    number::complete::double,
    sequence::{delimited, pair, preceded},
};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::ops::{Add, Div, Mul, Neg, Sub};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ExpressionError {
    #[error("No value supplied for symbol '{0}'")]
    MissingSymbol(Symbol),
    #[error("Failed to parse expression '{input}': {message}")]
    Parse { input: String, message: String },
    #[error("Expression '{expression}' evaluated to {value}")]
    NonFinite { expression: String, value: f64 },
}

/// A named quantity, such as a system component (`lambda`) or a geometric term (`r`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Symbol(String);

impl Symbol {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Symbol {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A set of symbol values used to evaluate expressions.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Values(BTreeMap<Symbol, f64>);

impl Values {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, symbol: Symbol, value: f64) {
        self.0.insert(symbol, value);
    }

    pub fn with(mut self, symbol: impl Into<Symbol>, value: f64) -> Self {
        self.set(symbol.into(), value);
        self
    }

    pub fn get(&self, symbol: &Symbol) -> Option<f64> {
        self.0.get(symbol).copied()
    }

    pub fn contains(&self, symbol: &Symbol) -> bool {
        self.0.contains_key(symbol)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Symbol, f64)> {
        self.0.iter().map(|(s, v)| (s, *v))
    }

    /// Copies every value of `other` into `self`, overwriting existing entries.
    pub fn extend_from(&mut self, other: &Values) {
        for (symbol, value) in other.iter() {
            self.set(symbol.clone(), value);
        }
    }
}

impl FromIterator<(Symbol, f64)> for Values {
    fn from_iter<I: IntoIterator<Item = (Symbol, f64)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
}

impl BinaryOp {
    fn precedence(self) -> u8 {
        match self {
            BinaryOp::Add | BinaryOp::Sub => 1,
            BinaryOp::Mul | BinaryOp::Div => 2,
            BinaryOp::Pow => 3,
        }
    }

    fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Pow => "^",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Function {
    Sqrt,
    Exp,
    Ln,
    Abs,
    Sin,
    Cos,
}

impl Function {
    fn name(self) -> &'static str {
        match self {
            Function::Sqrt => "sqrt",
            Function::Exp => "exp",
            Function::Ln => "ln",
            Function::Abs => "abs",
            Function::Sin => "sin",
            Function::Cos => "cos",
        }
    }

    fn call(self, x: f64) -> f64 {
        match self {
            Function::Sqrt => x.sqrt(),
            Function::Exp => x.exp(),
            Function::Ln => x.ln(),
            Function::Abs => x.abs(),
            Function::Sin => x.sin(),
            Function::Cos => x.cos(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    Constant(f64),
    Symbol(Symbol),
    Negate(Box<Expression>),
    Binary {
        op: BinaryOp,
        lhs: Box<Expression>,
        rhs: Box<Expression>,
    },
    Call {
        function: Function,
        arg: Box<Expression>,
    },
}

impl Expression {
    pub fn constant(value: f64) -> Self {
        Expression::Constant(value)
    }

    pub fn symbol(name: impl Into<Symbol>) -> Self {
        Expression::Symbol(name.into())
    }

    pub fn pow(self, exponent: impl Into<Expression>) -> Self {
        Self::binary(BinaryOp::Pow, self, exponent.into())
    }

    pub fn call(function: Function, arg: Expression) -> Self {
        Expression::Call {
            function,
            arg: Box::new(arg),
        }
    }

    fn binary(op: BinaryOp, lhs: Expression, rhs: Expression) -> Self {
        Expression::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    /// Parses an expression such as `2 * lambda + sqrt(r^2 + 1)`.
    pub fn parse(input: &str) -> Result<Self, ExpressionError> {
        all_consuming(delimited(multispace0, expression, multispace0))(input)
            .map(|(_, expr)| expr)
            .map_err(|e| ExpressionError::Parse {
                input: input.to_string(),
                message: e.to_string(),
            })
    }

    /// Evaluates the expression, rejecting infinite and NaN results.
    pub fn evaluate(&self, values: &Values) -> Result<f64, ExpressionError> {
        let value = self.evaluate_raw(values)?;
        if !value.is_finite() {
            return Err(ExpressionError::NonFinite {
                expression: self.to_string(),
                value,
            });
        }
        Ok(value)
    }

    fn evaluate_raw(&self, values: &Values) -> Result<f64, ExpressionError> {
        match self {
            Expression::Constant(c) => Ok(*c),
            Expression::Symbol(s) => values
                .get(s)
                .ok_or_else(|| ExpressionError::MissingSymbol(s.clone())),
            Expression::Negate(inner) => Ok(-inner.evaluate_raw(values)?),
            Expression::Binary { op, lhs, rhs } => {
                let a = lhs.evaluate_raw(values)?;
                let b = rhs.evaluate_raw(values)?;
                Ok(match op {
                    BinaryOp::Add => a + b,
                    BinaryOp::Sub => a - b,
                    BinaryOp::Mul => a * b,
                    BinaryOp::Div => a / b,
                    BinaryOp::Pow => a.powf(b),
                })
            }
            Expression::Call { function, arg } => Ok(function.call(arg.evaluate_raw(values)?)),
        }
    }

    /// All symbols this expression reads.
    pub fn symbols(&self) -> BTreeSet<Symbol> {
        let mut symbols = BTreeSet::new();
        self.collect_symbols(&mut symbols);
        symbols
    }

    pub fn depends_on(&self, symbol: &Symbol) -> bool {
        match self {
            Expression::Constant(_) => false,
            Expression::Symbol(s) => s == symbol,
            Expression::Negate(inner) => inner.depends_on(symbol),
            Expression::Binary { lhs, rhs, .. } => lhs.depends_on(symbol) || rhs.depends_on(symbol),
            Expression::Call { arg, .. } => arg.depends_on(symbol),
        }
    }

    fn collect_symbols(&self, out: &mut BTreeSet<Symbol>) {
        match self {
            Expression::Constant(_) => {}
            Expression::Symbol(s) => {
                out.insert(s.clone());
            }
            Expression::Negate(inner) => inner.collect_symbols(out),
            Expression::Binary { lhs, rhs, .. } => {
                lhs.collect_symbols(out);
                rhs.collect_symbols(out);
            }
            Expression::Call { arg, .. } => arg.collect_symbols(out),
        }
    }

    fn precedence(&self) -> u8 {
        match self {
            Expression::Binary { op, .. } => op.precedence(),
            Expression::Negate(_) => 4,
            Expression::Constant(c) if c.is_sign_negative() => 4,
            _ => 5,
        }
    }

    fn fmt_child(&self, f: &mut fmt::Formatter<'_>, parenthesize: bool) -> fmt::Result {
        if parenthesize {
            write!(f, "({})", self)
        } else {
            write!(f, "{}", self)
        }
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expression::Constant(c) => write!(f, "{}", c),
            Expression::Symbol(s) => write!(f, "{}", s),
            Expression::Negate(inner) => {
                f.write_str("-")?;
                inner.fmt_child(f, inner.precedence() < 4)
            }
            Expression::Binary { op, lhs, rhs } => {
                let p = op.precedence();
                // `^` is right associative, everything else is left associative.
                let (left_paren, right_paren) = if *op == BinaryOp::Pow {
                    (lhs.precedence() <= p, rhs.precedence() < p)
                } else {
                    (lhs.precedence() < p, rhs.precedence() <= p)
                };
                lhs.fmt_child(f, left_paren)?;
                write!(f, " {} ", op.symbol())?;
                rhs.fmt_child(f, right_paren)
            }
            Expression::Call { function, arg } => write!(f, "{}({})", function.name(), arg),
        }
    }
}

impl FromStr for Expression {
    type Err = ExpressionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Expression::parse(s)
    }
}

impl From<f64> for Expression {
    fn from(value: f64) -> Self {
        Expression::Constant(value)
    }
}

impl From<Symbol> for Expression {
    fn from(symbol: Symbol) -> Self {
        Expression::Symbol(symbol)
    }
}

macro_rules! impl_binary_op {
    ($trait:ident, $method:ident, $op:expr) => {
        impl<T: Into<Expression>> $trait<T> for Expression {
            type Output = Expression;

            fn $method(self, rhs: T) -> Expression {
                Expression::binary($op, self, rhs.into())
            }
        }
    };
}

impl_binary_op!(Add, add, BinaryOp::Add);
impl_binary_op!(Sub, sub, BinaryOp::Sub);
impl_binary_op!(Mul, mul, BinaryOp::Mul);
impl_binary_op!(Div, div, BinaryOp::Div);

impl Neg for Expression {
    type Output = Expression;

    fn neg(self) -> Expression {
        Expression::Negate(Box::new(self))
    }
}

fn ws<'a, O>(
    inner: impl FnMut(&'a str) -> IResult<&'a str, O>,
) -> impl FnMut(&'a str) -> IResult<&'a str, O> {
    delimited(multispace0, inner, multispace0)
}

fn fold_binary(first: Expression, rest: Vec<(char, Expression)>) -> Expression {
    rest.into_iter().fold(first, |acc, (op, rhs)| {
        let op = match op {
            '+' => BinaryOp::Add,
            '-' => BinaryOp::Sub,
            '*' => BinaryOp::Mul,
            _ => BinaryOp::Div,
        };
        Expression::binary(op, acc, rhs)
    })
}

/// expression = term , { ( "+" | "-" ) , term } ;
fn expression(i: &str) -> IResult<&str, Expression> {
    map(pair(term, many0(pair(ws(one_of("+-")), term))), |(first, rest)| {
        fold_binary(first, rest)
    })(i)
}

/// term = unary , { ( "*" | "/" ) , unary } ;
fn term(i: &str) -> IResult<&str, Expression> {
    map(pair(unary, many0(pair(ws(one_of("*/")), unary))), |(first, rest)| {
        fold_binary(first, rest)
    })(i)
}

/// unary = "-" , unary | power ;
fn unary(i: &str) -> IResult<&str, Expression> {
    alt((
        map(preceded(ws(char('-')), unary), |e| Expression::Negate(Box::new(e))),
        power,
    ))(i)
}

/// power = atom , [ "^" , unary ] ;
fn power(i: &str) -> IResult<&str, Expression> {
    let (i, base) = atom(i)?;
    match preceded(ws(char('^')), unary)(i) {
        Ok((i, exponent)) => Ok((i, Expression::binary(BinaryOp::Pow, base, exponent))),
        Err(nom::Err::Error(_)) => Ok((i, base)),
        Err(e) => Err(e),
    }
}

/// atom = call | symbol | number | "(" , expression , ")" ;
fn atom(i: &str) -> IResult<&str, Expression> {
    ws(alt((
        call,
        map(identifier, |name| Expression::Symbol(Symbol::new(name))),
        map(double, Expression::Constant),
        delimited(char('('), expression, char(')')),
    )))(i)
}

/// call = function , "(" , expression , ")" ;
/// function = "sqrt" | "exp" | "ln" | "abs" | "sin" | "cos" ;
fn call(i: &str) -> IResult<&str, Expression> {
    let function = alt((
        map(tag("sqrt"), |_| Function::Sqrt),
        map(tag("exp"), |_| Function::Exp),
        map(tag("ln"), |_| Function::Ln),
        map(tag("abs"), |_| Function::Abs),
        map(tag("sin"), |_| Function::Sin),
        map(tag("cos"), |_| Function::Cos),
    ));
    map(
        pair(function, delimited(ws(char('(')), expression, char(')'))),
        |(function, arg)| Expression::call(function, arg),
    )(i)
}

/// identifier = ( letter | "_" ) , { letter | digit | "_" } ;
fn identifier(i: &str) -> IResult<&str, &str> {
    recognize(pair(
        alt((alpha1, tag("_"))),
        many0(alt((alphanumeric1, tag("_")))),
    ))(i)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values() -> Values {
        Values::new().with("lambda", 0.25).with("r", 3.0)
    }

    #[test]
    fn builds_and_evaluates_expression_with_operators() {
        let expr = Expression::symbol("lambda") * 2.0 + 1.0;
        assert_eq!(expr.evaluate(&values()).unwrap(), 1.5);
    }

    #[test]
    fn missing_symbol_is_reported() {
        let expr = Expression::symbol("mu") + 1.0;
        let err = expr.evaluate(&values()).unwrap_err();
        assert_eq!(err, ExpressionError::MissingSymbol(Symbol::new("mu")));
    }

    #[test]
    fn non_finite_results_are_rejected() {
        let values = Values::new().with("x", -1.0).with("zero", 0.0);
        let err = Expression::parse("sqrt(x)").unwrap().evaluate(&values).unwrap_err();
        assert!(matches!(
            err,
            ExpressionError::NonFinite { ref expression, value } if expression == "sqrt(x)" && value.is_nan()
        ));
        let err = Expression::parse("1 / zero").unwrap().evaluate(&values).unwrap_err();
        assert!(matches!(err, ExpressionError::NonFinite { value, .. } if value.is_infinite()));
    }

    #[test]
    fn infinite_intermediates_may_still_give_a_finite_result() {
        let values = Values::new().with("zero", 0.0);
        let expr = Expression::parse("1 / (1 / zero)").unwrap();
        assert_eq!(expr.evaluate(&values).unwrap(), 0.0);
    }

    #[test]
    fn symbols_are_collected_without_duplicates() {
        let expr = Expression::parse("r * r + lambda - r").unwrap();
        let symbols: Vec<_> = expr.symbols().into_iter().collect();
        assert_eq!(symbols, vec![Symbol::new("lambda"), Symbol::new("r")]);
        assert!(expr.depends_on(&Symbol::new("r")));
        assert!(!expr.depends_on(&Symbol::new("x")));
    }

    #[test]
    fn parser_respects_precedence_and_associativity() {
        let v = values();
        assert_eq!(Expression::parse("1 + 2 * 3").unwrap().evaluate(&v).unwrap(), 7.0);
        assert_eq!(Expression::parse("10 - 4 - 3").unwrap().evaluate(&v).unwrap(), 3.0);
        assert_eq!(Expression::parse("2 ^ 3 ^ 2").unwrap().evaluate(&v).unwrap(), 512.0);
        assert_eq!(Expression::parse("-r^2").unwrap().evaluate(&v).unwrap(), -9.0);
        assert_eq!(Expression::parse("(1 + 2) * 3").unwrap().evaluate(&v).unwrap(), 9.0);
    }

    #[test]
    fn parser_handles_functions_and_identifiers() {
        let v = values();
        let expr = Expression::parse("sqrt(r * r + 16) + abs(-lambda)").unwrap();
        assert_eq!(expr.evaluate(&v).unwrap(), 5.25);

        let expr = Expression::parse("exp_scale_2").unwrap();
        assert_eq!(expr, Expression::symbol("exp_scale_2"));
    }

    #[test]
    fn parser_rejects_trailing_garbage() {
        assert!(matches!(
            Expression::parse("1 + * 2"),
            Err(ExpressionError::Parse { .. })
        ));
        assert!(Expression::parse("(1 + 2").is_err());
    }

    #[test]
    fn display_output_parses_back_to_same_value() {
        let text = "(1 - lambda) * 2 + r / (r - 1) - -lambda";
        let expr = Expression::parse(text).unwrap();
        let reparsed = Expression::parse(&expr.to_string()).unwrap();
        assert_eq!(
            expr.evaluate(&values()).unwrap(),
            reparsed.evaluate(&values()).unwrap()
        );
    }
}
