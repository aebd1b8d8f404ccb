//! Restricted arithmetic evaluator for `calculate` requests.
//!
//! Accepts numeric literals, `+ - * /`, unary sign, and parentheses. Nothing
//! else is recognised, so a `calculate` request can never execute code.
//! Integer operands stay integers except under `/`, which always produces a
//! float.

use std::fmt;

use serde_json::Value;

/// Deepest parenthesis / unary nesting accepted.
const MAX_DEPTH: usize = 64;

/// Numeric result of an evaluation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Number {
    /// Exact integer.
    Int(i64),
    /// Floating-point value.
    Float(f64),
}

impl Number {
    /// JSON form of the number.
    ///
    /// Non-finite floats are rejected during evaluation, so this never
    /// yields `null`.
    #[must_use]
    pub fn to_json(self) -> Value {
        match self {
            Self::Int(i) => Value::from(i),
            Self::Float(f) => Value::from(f),
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn as_f64(self) -> f64 {
        match self {
            Self::Int(i) => i as f64,
            Self::Float(f) => f,
        }
    }
}

impl fmt::Display for Number {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
        }
    }
}

/// Why an expression could not be evaluated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArithmeticError {
    /// The expression is empty.
    Empty,
    /// A character outside the accepted grammar.
    UnexpectedChar(char, usize),
    /// A valid token where the grammar does not allow one.
    UnexpectedToken(String, usize),
    /// The expression ended where an operand was expected.
    UnexpectedEnd,
    /// A `(` without its `)`, or a stray `)`.
    UnbalancedParens,
    /// A literal that is not a valid number.
    InvalidNumber(String),
    /// Division by zero.
    DivisionByZero,
    /// The result does not fit the numeric range.
    Overflow,
    /// Nesting exceeded the accepted depth.
    TooDeep,
}

impl fmt::Display for ArithmeticError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("empty expression"),
            Self::UnexpectedChar(c, pos) => write!(f, "unexpected character '{c}' at {pos}"),
            Self::UnexpectedToken(text, pos) => write!(f, "unexpected token '{text}' at {pos}"),
            Self::UnexpectedEnd => f.write_str("unexpected end of expression"),
            Self::UnbalancedParens => f.write_str("unbalanced parentheses"),
            Self::InvalidNumber(lit) => write!(f, "invalid number '{lit}'"),
            Self::DivisionByZero => f.write_str("division by zero"),
            Self::Overflow => f.write_str("numeric overflow"),
            Self::TooDeep => write!(f, "expression nested deeper than {MAX_DEPTH}"),
        }
    }
}

impl std::error::Error for ArithmeticError {}

/// Evaluate `expression`.
///
/// # Errors
///
/// Returns an [`ArithmeticError`] for syntax errors, division by zero,
/// overflow, or excessive nesting.
pub fn evaluate(expression: &str) -> Result<Number, ArithmeticError> {
    let lexemes = tokenize(expression)?;
    if lexemes.is_empty() {
        return Err(ArithmeticError::Empty);
    }

    let mut parser = Parser { lexemes, pos: 0 };
    let value = parser.expr(0)?;
    match parser.peek() {
        None => Ok(value),
        Some(Token::Close) => Err(ArithmeticError::UnbalancedParens),
        Some(_) => Err(parser.unexpected(parser.pos)),
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Token {
    Num(Number),
    Plus,
    Minus,
    Star,
    Slash,
    Open,
    Close,
}

/// A token with its source text and character offset.
#[derive(Debug, Clone)]
struct Lexeme {
    token: Token,
    text: String,
    pos: usize,
}

fn tokenize(input: &str) -> Result<Vec<Lexeme>, ArithmeticError> {
    let mut lexemes = Vec::new();
    let mut chars = input.char_indices().peekable();

    while let Some(&(pos, c)) = chars.peek() {
        let token = match c {
            c if c.is_whitespace() => {
                chars.next();
                continue;
            }
            '0'..='9' | '.' => {
                let mut literal = String::new();
                while let Some(&(_, d)) = chars.peek() {
                    if d.is_ascii_digit() || d == '.' {
                        literal.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                lexemes.push(Lexeme {
                    token: Token::Num(parse_number(&literal)?),
                    text: literal,
                    pos,
                });
                continue;
            }
            '+' => Token::Plus,
            '-' => Token::Minus,
            '*' => Token::Star,
            '/' => Token::Slash,
            '(' => Token::Open,
            ')' => Token::Close,
            other => return Err(ArithmeticError::UnexpectedChar(other, pos)),
        };
        lexemes.push(Lexeme {
            token,
            text: c.to_string(),
            pos,
        });
        chars.next();
    }

    Ok(lexemes)
}

fn parse_number(literal: &str) -> Result<Number, ArithmeticError> {
    let invalid = || ArithmeticError::InvalidNumber(literal.to_owned());

    if literal.contains('.') {
        if literal == "." || literal.matches('.').count() > 1 {
            return Err(invalid());
        }
        literal.parse::<f64>().map(Number::Float).map_err(|_| invalid())
    } else {
        literal
            .parse::<i64>()
            .map(Number::Int)
            .map_err(|_| ArithmeticError::Overflow)
    }
}

struct Parser {
    lexemes: Vec<Lexeme>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<Token> {
        self.lexemes.get(self.pos).map(|lexeme| lexeme.token)
    }

    fn unexpected(&self, index: usize) -> ArithmeticError {
        match self.lexemes.get(index) {
            Some(lexeme) => ArithmeticError::UnexpectedToken(lexeme.text.clone(), lexeme.pos),
            None => ArithmeticError::UnexpectedEnd,
        }
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.peek();
        self.pos += 1;
        token
    }

    fn expr(&mut self, depth: usize) -> Result<Number, ArithmeticError> {
        let mut acc = self.term(depth)?;
        while let Some(op @ (Token::Plus | Token::Minus)) = self.peek() {
            self.pos += 1;
            let rhs = self.term(depth)?;
            acc = apply(op, acc, rhs)?;
        }
        Ok(acc)
    }

    fn term(&mut self, depth: usize) -> Result<Number, ArithmeticError> {
        let mut acc = self.unary(depth)?;
        while let Some(op @ (Token::Star | Token::Slash)) = self.peek() {
            self.pos += 1;
            let rhs = self.unary(depth)?;
            acc = apply(op, acc, rhs)?;
        }
        Ok(acc)
    }

    fn unary(&mut self, depth: usize) -> Result<Number, ArithmeticError> {
        if depth > MAX_DEPTH {
            return Err(ArithmeticError::TooDeep);
        }
        match self.peek() {
            Some(Token::Plus) => {
                self.pos += 1;
                self.unary(depth + 1)
            }
            Some(Token::Minus) => {
                self.pos += 1;
                match self.unary(depth + 1)? {
                    Number::Int(i) => i.checked_neg().map(Number::Int).ok_or(ArithmeticError::Overflow),
                    Number::Float(f) => Ok(Number::Float(-f)),
                }
            }
            _ => self.primary(depth),
        }
    }

    fn primary(&mut self, depth: usize) -> Result<Number, ArithmeticError> {
        match self.advance() {
            Some(Token::Num(n)) => Ok(n),
            Some(Token::Open) => {
                let inner = self.expr(depth + 1)?;
                match self.advance() {
                    Some(Token::Close) => Ok(inner),
                    _ => Err(ArithmeticError::UnbalancedParens),
                }
            }
            Some(Token::Close) => Err(ArithmeticError::UnbalancedParens),
            Some(_) => Err(self.unexpected(self.pos - 1)),
            None => Err(ArithmeticError::UnexpectedEnd),
        }
    }
}

#[allow(clippy::float_cmp)]
fn apply(op: Token, lhs: Number, rhs: Number) -> Result<Number, ArithmeticError> {
    if op == Token::Slash {
        let divisor = rhs.as_f64();
        if divisor == 0.0 {
            return Err(ArithmeticError::DivisionByZero);
        }
        return finite(lhs.as_f64() / divisor);
    }

    match (lhs, rhs) {
        (Number::Int(a), Number::Int(b)) => {
            let result = match op {
                Token::Plus => a.checked_add(b),
                Token::Minus => a.checked_sub(b),
                _ => a.checked_mul(b),
            };
            result.map(Number::Int).ok_or(ArithmeticError::Overflow)
        }
        _ => {
            let (a, b) = (lhs.as_f64(), rhs.as_f64());
            finite(match op {
                Token::Plus => a + b,
                Token::Minus => a - b,
                _ => a * b,
            })
        }
    }
}

fn finite(value: f64) -> Result<Number, ArithmeticError> {
    if value.is_finite() {
        Ok(Number::Float(value))
    } else {
        Err(ArithmeticError::Overflow)
    }
}
