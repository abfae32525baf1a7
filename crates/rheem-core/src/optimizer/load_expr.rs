//! Load expression language
//!
//! Configuration values like `rheem.basic.map.load` describe per-resource
//! load as an arithmetic expression over input/output cardinalities:
//!
//! ```text
//! 700 * in0 + 0.5 * out0 + ${init}
//! ```
//!
//! Operators `+ - * /`, functions `round`, `log`, `max`, `min`, symbols
//! `in0..inK` / `out0..outK`, named variables `${name}`. Expressions are
//! parsed once into an AST and evaluated with a binding context; `Display`
//! emits a canonical form that re-parses to an equal AST.

use std::collections::BTreeSet;

use rheem_common::{Result, RheemError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl BinaryOp {
    fn symbol(&self) -> char {
        match self {
            BinaryOp::Add => '+',
            BinaryOp::Sub => '-',
            BinaryOp::Mul => '*',
            BinaryOp::Div => '/',
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Function {
    Round,
    Log,
    Max,
    Min,
}

impl Function {
    fn name(&self) -> &'static str {
        match self {
            Function::Round => "round",
            Function::Log => "log",
            Function::Max => "max",
            Function::Min => "min",
        }
    }

    fn arity(&self) -> usize {
        match self {
            Function::Round | Function::Log => 1,
            Function::Max | Function::Min => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LoadExpr {
    Number(f64),
    /// `inK`: cardinality of input slot K.
    Input(usize),
    /// `outK`: cardinality of output slot K.
    Output(usize),
    /// `${name}`: named variable, resolved at evaluation time.
    Variable(String),
    Neg(Box<LoadExpr>),
    Binary(BinaryOp, Box<LoadExpr>, Box<LoadExpr>),
    Call(Function, Vec<LoadExpr>),
}

impl LoadExpr {
    pub fn parse(input: &str) -> Result<LoadExpr> {
        Parser::new(input)?.parse()
    }

    /// Evaluate against cardinalities and a variable resolver. Unresolved
    /// variables evaluate to 0.
    pub fn evaluate(
        &self,
        inputs: &[u64],
        outputs: &[u64],
        resolve: &dyn Fn(&str) -> Option<f64>,
    ) -> f64 {
        match self {
            LoadExpr::Number(value) => *value,
            LoadExpr::Input(index) => inputs.get(*index).copied().unwrap_or(0) as f64,
            LoadExpr::Output(index) => outputs.get(*index).copied().unwrap_or(0) as f64,
            LoadExpr::Variable(name) => resolve(name).unwrap_or(0.0),
            LoadExpr::Neg(inner) => -inner.evaluate(inputs, outputs, resolve),
            LoadExpr::Binary(op, lhs, rhs) => {
                let l = lhs.evaluate(inputs, outputs, resolve);
                let r = rhs.evaluate(inputs, outputs, resolve);
                match op {
                    BinaryOp::Add => l + r,
                    BinaryOp::Sub => l - r,
                    BinaryOp::Mul => l * r,
                    BinaryOp::Div => {
                        if r == 0.0 {
                            0.0
                        } else {
                            l / r
                        }
                    }
                }
            }
            LoadExpr::Call(function, args) => {
                let values: Vec<f64> = args
                    .iter()
                    .map(|a| a.evaluate(inputs, outputs, resolve))
                    .collect();
                match function {
                    Function::Round => values[0].round(),
                    Function::Log => values[0].max(1e-9).ln(),
                    Function::Max => values[0].max(values[1]),
                    Function::Min => values[0].min(values[1]),
                }
            }
        }
    }

    /// Collect the names of all `${...}` variables.
    pub fn collect_variables(&self, into: &mut BTreeSet<String>) {
        match self {
            LoadExpr::Variable(name) => {
                into.insert(name.clone());
            }
            LoadExpr::Neg(inner) => inner.collect_variables(into),
            LoadExpr::Binary(_, lhs, rhs) => {
                lhs.collect_variables(into);
                rhs.collect_variables(into);
            }
            LoadExpr::Call(_, args) => {
                for arg in args {
                    arg.collect_variables(into);
                }
            }
            _ => {}
        }
    }

    fn precedence(&self) -> u8 {
        match self {
            LoadExpr::Binary(BinaryOp::Add | BinaryOp::Sub, _, _) => 1,
            LoadExpr::Binary(BinaryOp::Mul | BinaryOp::Div, _, _) => 2,
            _ => 3,
        }
    }
}

impl std::fmt::Display for LoadExpr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadExpr::Number(value) => {
                if value.fract() == 0.0 && value.abs() < 1e15 {
                    write!(f, "{}", *value as i64)
                } else {
                    write!(f, "{value}")
                }
            }
            LoadExpr::Input(index) => write!(f, "in{index}"),
            LoadExpr::Output(index) => write!(f, "out{index}"),
            LoadExpr::Variable(name) => write!(f, "${{{name}}}"),
            LoadExpr::Neg(inner) => {
                if inner.precedence() < 3 {
                    write!(f, "-({inner})")
                } else {
                    write!(f, "-{inner}")
                }
            }
            LoadExpr::Binary(op, lhs, rhs) => {
                let own = self.precedence();
                if lhs.precedence() < own {
                    write!(f, "({lhs})")?;
                } else {
                    write!(f, "{lhs}")?;
                }
                write!(f, " {} ", op.symbol())?;
                // Right side needs parentheses on equal precedence too,
                // since - and / are left-associative.
                if rhs.precedence() <= own {
                    write!(f, "({rhs})")
                } else {
                    write!(f, "{rhs}")
                }
            }
            LoadExpr::Call(function, args) => {
                write!(f, "{}(", function.name())?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{arg}")?;
                }
                write!(f, ")")
            }
        }
    }
}

// ============================================================================
// Tokenizer + recursive descent parser
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Identifier(String),
    Variable(String),
    Plus,
    Minus,
    Star,
    Slash,
    LeftParen,
    RightParen,
    Comma,
}

struct Parser {
    tokens: Vec<Token>,
    position: usize,
}

impl Parser {
    fn new(input: &str) -> Result<Self> {
        Ok(Self {
            tokens: tokenize(input)?,
            position: 0,
        })
    }

    fn parse(mut self) -> Result<LoadExpr> {
        let expr = self.expression()?;
        if self.position != self.tokens.len() {
            return Err(RheemError::Configuration(format!(
                "trailing tokens in load expression after `{expr}`"
            )));
        }
        Ok(expr)
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.position)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.position).cloned();
        if token.is_some() {
            self.position += 1;
        }
        token
    }

    fn expect(&mut self, expected: Token) -> Result<()> {
        match self.advance() {
            Some(token) if token == expected => Ok(()),
            other => Err(RheemError::Configuration(format!(
                "expected {expected:?} in load expression, found {other:?}"
            ))),
        }
    }

    fn expression(&mut self) -> Result<LoadExpr> {
        let mut lhs = self.term()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => break,
            };
            self.advance();
            let rhs = self.term()?;
            lhs = LoadExpr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn term(&mut self) -> Result<LoadExpr> {
        let mut lhs = self.factor()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                _ => break,
            };
            self.advance();
            let rhs = self.factor()?;
            lhs = LoadExpr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn factor(&mut self) -> Result<LoadExpr> {
        match self.advance() {
            Some(Token::Number(value)) => Ok(LoadExpr::Number(value)),
            Some(Token::Variable(name)) => Ok(LoadExpr::Variable(name)),
            Some(Token::Minus) => Ok(LoadExpr::Neg(Box::new(self.factor()?))),
            Some(Token::LeftParen) => {
                let expr = self.expression()?;
                self.expect(Token::RightParen)?;
                Ok(expr)
            }
            Some(Token::Identifier(name)) => self.identifier(name),
            other => Err(RheemError::Configuration(format!(
                "unexpected token {other:?} in load expression"
            ))),
        }
    }

    fn identifier(&mut self, name: String) -> Result<LoadExpr> {
        if let Some(index) = name.strip_prefix("in").and_then(|s| s.parse().ok()) {
            return Ok(LoadExpr::Input(index));
        }
        if let Some(index) = name.strip_prefix("out").and_then(|s| s.parse().ok()) {
            return Ok(LoadExpr::Output(index));
        }
        let function = match name.as_str() {
            "round" => Function::Round,
            "log" => Function::Log,
            "max" => Function::Max,
            "min" => Function::Min,
            other => {
                return Err(RheemError::Configuration(format!(
                    "unknown symbol `{other}` in load expression"
                )))
            }
        };
        self.expect(Token::LeftParen)?;
        let mut args = vec![self.expression()?];
        while self.peek() == Some(&Token::Comma) {
            self.advance();
            args.push(self.expression()?);
        }
        self.expect(Token::RightParen)?;
        if args.len() != function.arity() {
            return Err(RheemError::Configuration(format!(
                "{} takes {} argument(s), got {}",
                function.name(),
                function.arity(),
                args.len()
            )));
        }
        Ok(LoadExpr::Call(function, args))
    }
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '/' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LeftParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RightParen);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '$' => {
                if chars.get(i + 1) != Some(&'{') {
                    return Err(RheemError::Configuration(
                        "expected `{` after `$` in load expression".to_string(),
                    ));
                }
                let start = i + 2;
                let mut end = start;
                while end < chars.len() && chars[end] != '}' {
                    end += 1;
                }
                if end == chars.len() {
                    return Err(RheemError::Configuration(
                        "unterminated variable in load expression".to_string(),
                    ));
                }
                tokens.push(Token::Variable(chars[start..end].iter().collect()));
                i = end + 1;
            }
            c if c.is_ascii_digit() || c == '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.' || chars[i] == 'e' || chars[i] == 'E') {
                    i += 1;
                }
                let literal: String = chars[start..i].iter().collect();
                let value = literal.parse().map_err(|_| {
                    RheemError::Configuration(format!("invalid number `{literal}` in load expression"))
                })?;
                tokens.push(Token::Number(value));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_ascii_alphanumeric() || chars[i] == '_' || chars[i] == '.')
                {
                    i += 1;
                }
                tokens.push(Token::Identifier(chars[start..i].iter().collect()));
            }
            other => {
                return Err(RheemError::Configuration(format!(
                    "unexpected character `{other}` in load expression"
                )))
            }
        }
    }
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_vars(_: &str) -> Option<f64> {
        None
    }

    #[test]
    fn test_parse_and_evaluate_linear() {
        let expr = LoadExpr::parse("700 * in0 + 0.5 * out0 + 100").unwrap();
        let value = expr.evaluate(&[10], &[4], &no_vars);
        assert!((value - 7102.0).abs() < 1e-9);
    }

    #[test]
    fn test_precedence_and_parentheses() {
        let expr = LoadExpr::parse("(in0 + in1) * 2").unwrap();
        assert_eq!(expr.evaluate(&[3, 4], &[], &no_vars), 14.0);
        let expr = LoadExpr::parse("in0 + in1 * 2").unwrap();
        assert_eq!(expr.evaluate(&[3, 4], &[], &no_vars), 11.0);
    }

    #[test]
    fn test_functions() {
        let expr = LoadExpr::parse("max(in0, out0) + min(in0, out0) + round(0.6)").unwrap();
        assert_eq!(expr.evaluate(&[10], &[20], &no_vars), 41.0);
        let expr = LoadExpr::parse("log(in0)").unwrap();
        assert!((expr.evaluate(&[100], &[], &no_vars) - 100f64.ln()).abs() < 1e-9);
    }

    #[test]
    fn test_variables() {
        let expr = LoadExpr::parse("${a} * in0 + ${b}").unwrap();
        let mut vars = BTreeSet::new();
        expr.collect_variables(&mut vars);
        assert_eq!(vars.into_iter().collect::<Vec<_>>(), vec!["a", "b"]);

        let resolve = |name: &str| match name {
            "a" => Some(100.0),
            "b" => Some(5000.0),
            _ => None,
        };
        assert_eq!(expr.evaluate(&[10], &[], &resolve), 6000.0);
    }

    #[test]
    fn test_canonical_roundtrip() {
        for source in [
            "700 * in0 + 0.5 * out0",
            "(in0 + in1) * 2 - max(in0, 100)",
            "${a} * in0 + ${b}",
            "-in0 + 3",
            "in0 / (in1 + 1)",
        ] {
            let expr = LoadExpr::parse(source).unwrap();
            let printed = expr.to_string();
            let reparsed = LoadExpr::parse(&printed).unwrap();
            assert_eq!(expr, reparsed, "roundtrip failed for `{source}` -> `{printed}`");
        }
    }

    #[test]
    fn test_parse_errors() {
        assert!(LoadExpr::parse("in0 +").is_err());
        assert!(LoadExpr::parse("frobnicate(in0)").is_err());
        assert!(LoadExpr::parse("${unterminated").is_err());
        assert!(LoadExpr::parse("max(in0)").is_err());
    }

    #[test]
    fn test_division_by_zero_is_zero() {
        let expr = LoadExpr::parse("in0 / out0").unwrap();
        assert_eq!(expr.evaluate(&[10], &[0], &no_vars), 0.0);
    }
}
