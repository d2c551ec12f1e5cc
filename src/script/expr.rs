//! Infix expression grammar and evaluator.
//!
//! Precedence, lowest first: `;`, assignment (right associative), `||`,
//! `&&`, `== !=`, `< <= > >=`, `+ -`, `* / %`, prefix `! - + ++ --`,
//! postfix `++ --`.

use std::cmp::Ordering;

use crate::background::Background;
use crate::error::ScriptError;

use super::lexer::{tokenize, Token};
use super::value::{
    bool_text, compare_numbers, format_number, parse_bool, parse_number, values_equal,
};
use super::var::VarRef;
use super::Composable;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
    Plus,
}

#[derive(Debug, Clone)]
pub enum Expr {
    Literal(String),
    Ident(String),
    Var(VarRef),
    Unary(UnaryOp, Box<Expr>),
    Step {
        delta: f64,
        prefix: bool,
        target: Box<Expr>,
    },
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Assign {
        op: Option<BinaryOp>,
        name: String,
        value: Box<Expr>,
    },
    Sequence(Box<Expr>, Box<Expr>),
}

impl Expr {
    /// Local variable written by assignment or `++`/`--`.
    fn target_name(&self) -> Option<&str> {
        match self {
            Expr::Ident(name) => Some(name),
            Expr::Var(reference) => reference.local_name(),
            Expr::Step { target, .. } => target.target_name(),
            _ => None,
        }
    }

    pub fn eval(&self, bg: &mut Background) -> Result<String, ScriptError> {
        match self {
            Expr::Literal(text) | Expr::Ident(text) => Ok(text.clone()),
            Expr::Var(reference) => reference.read(bg),
            Expr::Unary(op, operand) => {
                let value = operand.eval(bg)?;
                match op {
                    UnaryOp::Not => {
                        let flag = parse_bool(&value).ok_or_else(|| {
                            ScriptError::runtime(format!("`!` expects a boolean, got `{value}`"))
                        })?;
                        Ok(bool_text(!flag).to_string())
                    }
                    UnaryOp::Neg => Ok(format_number(-number(&value)?)),
                    UnaryOp::Plus => Ok(format_number(number(&value)?)),
                }
            }
            Expr::Step {
                delta,
                prefix,
                target,
            } => {
                if let Expr::Step { .. } = target.as_ref() {
                    target.eval(bg)?;
                }
                let name = target
                    .target_name()
                    .ok_or_else(|| ScriptError::runtime("`++`/`--` needs a local variable"))?;
                let old = counter(&bg.get_local(name))?;
                let new = old + delta;
                bg.set_local(name.to_string(), format_number(new));
                Ok(format_number(if *prefix { new } else { old }))
            }
            Expr::Binary(op, left, right) => {
                let left = left.eval(bg)?;
                let right = right.eval(bg)?;
                binary(*op, &left, &right)
            }
            Expr::And(left, right) => {
                if !boolean(&left.eval(bg)?)? {
                    return Ok(bool_text(false).to_string());
                }
                Ok(bool_text(boolean(&right.eval(bg)?)?).to_string())
            }
            Expr::Or(left, right) => {
                if boolean(&left.eval(bg)?)? {
                    return Ok(bool_text(true).to_string());
                }
                Ok(bool_text(boolean(&right.eval(bg)?)?).to_string())
            }
            Expr::Assign { op, name, value } => {
                let value = value.eval(bg)?;
                let result = match op {
                    None => value,
                    Some(op) => {
                        let current = bg.get_local(name);
                        let current = if current.is_empty() {
                            "0".to_string()
                        } else {
                            current
                        };
                        binary(*op, &current, &value)?
                    }
                };
                bg.set_local(name.clone(), result.clone());
                Ok(result)
            }
            Expr::Sequence(left, right) => {
                left.eval(bg)?;
                right.eval(bg)
            }
        }
    }
}

fn number(text: &str) -> Result<f64, ScriptError> {
    parse_number(text).ok_or_else(|| ScriptError::runtime(format!("not a number: `{text}`")))
}

fn counter(text: &str) -> Result<f64, ScriptError> {
    if text.is_empty() {
        return Ok(0.0);
    }
    number(text)
}

fn boolean(text: &str) -> Result<bool, ScriptError> {
    parse_bool(text).ok_or_else(|| ScriptError::runtime(format!("not a boolean: `{text}`")))
}

fn binary(op: BinaryOp, left: &str, right: &str) -> Result<String, ScriptError> {
    match op {
        BinaryOp::Eq => Ok(bool_text(values_equal(left, right)).to_string()),
        BinaryOp::Ne => Ok(bool_text(!values_equal(left, right)).to_string()),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let ordering = match (parse_number(left), parse_number(right)) {
                (Some(l), Some(r)) => compare_numbers(l, r),
                _ => {
                    return Err(ScriptError::runtime(format!(
                        "cannot order `{left}` and `{right}`"
                    )))
                }
            };
            let result = match op {
                BinaryOp::Lt => ordering == Ordering::Less,
                BinaryOp::Le => ordering != Ordering::Greater,
                BinaryOp::Gt => ordering == Ordering::Greater,
                _ => ordering != Ordering::Less,
            };
            Ok(bool_text(result).to_string())
        }
        _ => {
            let (l, r) = (number(left)?, number(right)?);
            let result = match op {
                BinaryOp::Add => l + r,
                BinaryOp::Sub => l - r,
                BinaryOp::Mul => l * r,
                BinaryOp::Div | BinaryOp::Rem if r == 0.0 => {
                    return Err(ScriptError::runtime(format!(
                        "division by zero: `{left}` / `{right}`"
                    )))
                }
                BinaryOp::Div => l / r,
                _ => l % r,
            };
            Ok(format_number(result))
        }
    }
}

/// A compiled expression program.
#[derive(Debug, Clone)]
pub struct Expression {
    source: String,
    root: Expr,
}

impl Expression {
    pub fn compile(source: &str) -> Result<Self, ScriptError> {
        let tokens = tokenize(source)?;
        let mut parser = Parser {
            source,
            tokens,
            pos: 0,
        };
        let root = parser.expression(0)?;
        if !matches!(parser.peek(), Token::Eof) {
            return Err(ScriptError::compile(source, "unexpected trailing input"));
        }
        Ok(Self {
            source: source.to_string(),
            root,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn eval(&self, bg: &mut Background) -> Result<String, ScriptError> {
        self.root.eval(bg)
    }
}

impl Composable for Expression {
    fn compose(&self, bg: &mut Background) -> Result<String, ScriptError> {
        self.eval(bg)
    }
}

struct Parser<'a> {
    source: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

const PREFIX_BP: u8 = 17;
const POSTFIX_BP: u8 = 19;

fn infix_binding_power(op: &str) -> Option<(u8, u8)> {
    let power = match op {
        ";" => (1, 2),
        "=" | "+=" | "-=" | "*=" | "/=" | "%=" => (4, 3),
        "||" => (5, 6),
        "&&" => (7, 8),
        "==" | "!=" => (9, 10),
        "<" | "<=" | ">" | ">=" => (11, 12),
        "+" | "-" => (13, 14),
        "*" | "/" | "%" => (15, 16),
        _ => return None,
    };
    Some(power)
}

fn binary_op(op: &str) -> Option<BinaryOp> {
    Some(match op {
        "+" | "+=" => BinaryOp::Add,
        "-" | "-=" => BinaryOp::Sub,
        "*" | "*=" => BinaryOp::Mul,
        "/" | "/=" => BinaryOp::Div,
        "%" | "%=" => BinaryOp::Rem,
        "<" => BinaryOp::Lt,
        "<=" => BinaryOp::Le,
        ">" => BinaryOp::Gt,
        ">=" => BinaryOp::Ge,
        "==" => BinaryOp::Eq,
        "!=" => BinaryOp::Ne,
        _ => return None,
    })
}

impl Parser<'_> {
    fn peek(&self) -> &Token {
        self.tokens.get(self.pos).unwrap_or(&Token::Eof)
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn error(&self, reason: impl Into<String>) -> ScriptError {
        ScriptError::compile(self.source, reason)
    }

    fn expression(&mut self, min_bp: u8) -> Result<Expr, ScriptError> {
        let mut lhs = self.prefix()?;

        loop {
            let op = match self.peek() {
                Token::Op(op) => *op,
                _ => break,
            };

            if matches!(op, "++" | "--") {
                if POSTFIX_BP < min_bp {
                    break;
                }
                if lhs.target_name().is_none() {
                    return Err(self.error(format!("`{op}` needs a local variable")));
                }
                self.advance();
                lhs = Expr::Step {
                    delta: if op == "++" { 1.0 } else { -1.0 },
                    prefix: false,
                    target: Box::new(lhs),
                };
                continue;
            }

            let Some((l_bp, r_bp)) = infix_binding_power(op) else {
                return Err(self.error(format!("unexpected `{op}`")));
            };
            if l_bp < min_bp {
                break;
            }
            self.advance();

            if op == ";" {
                // a trailing `;` keeps the left value
                if matches!(self.peek(), Token::Eof | Token::RParen) {
                    continue;
                }
                let rhs = self.expression(r_bp)?;
                lhs = Expr::Sequence(Box::new(lhs), Box::new(rhs));
                continue;
            }

            let rhs = self.expression(r_bp)?;
            lhs = match op {
                "&&" => Expr::And(Box::new(lhs), Box::new(rhs)),
                "||" => Expr::Or(Box::new(lhs), Box::new(rhs)),
                "=" | "+=" | "-=" | "*=" | "/=" | "%=" => {
                    let name = match &lhs {
                        Expr::Ident(name) => name.clone(),
                        Expr::Var(reference) => reference
                            .local_name()
                            .ok_or_else(|| self.error("only local variables are assignable"))?
                            .to_string(),
                        _ => return Err(self.error("left side of assignment is not assignable")),
                    };
                    Expr::Assign {
                        op: if op == "=" { None } else { binary_op(op) },
                        name,
                        value: Box::new(rhs),
                    }
                }
                _ => {
                    let binary = binary_op(op).ok_or_else(|| self.error(format!("unknown `{op}`")))?;
                    Expr::Binary(binary, Box::new(lhs), Box::new(rhs))
                }
            };
        }

        Ok(lhs)
    }

    fn prefix(&mut self) -> Result<Expr, ScriptError> {
        match self.advance() {
            Token::Number(text) => Ok(Expr::Literal(text)),
            Token::Str(text) => Ok(Expr::Literal(text)),
            Token::Ident(name) => Ok(Expr::Ident(name)),
            Token::Var(reference) => Ok(Expr::Var(reference)),
            Token::LParen => {
                let inner = self.expression(0)?;
                match self.advance() {
                    Token::RParen => Ok(inner),
                    _ => Err(self.error("missing `)`")),
                }
            }
            Token::Op(op @ ("++" | "--")) => {
                let target = self.expression(PREFIX_BP)?;
                if target.target_name().is_none() {
                    return Err(self.error(format!("`{op}` needs a local variable")));
                }
                Ok(Expr::Step {
                    delta: if op == "++" { 1.0 } else { -1.0 },
                    prefix: true,
                    target: Box::new(target),
                })
            }
            Token::Op("!") => Ok(Expr::Unary(UnaryOp::Not, Box::new(self.expression(PREFIX_BP)?))),
            Token::Op("-") => Ok(Expr::Unary(UnaryOp::Neg, Box::new(self.expression(PREFIX_BP)?))),
            Token::Op("+") => Ok(Expr::Unary(UnaryOp::Plus, Box::new(self.expression(PREFIX_BP)?))),
            Token::Op(op) => Err(self.error(format!("unexpected `{op}`"))),
            Token::RParen => Err(self.error("unexpected `)`")),
            Token::Eof => Err(self.error("unexpected end of expression")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn run(source: &str) -> Result<String, ScriptError> {
        let mut bg = Background::new("expr");
        Expression::compile(source)?.eval(&mut bg)
    }

    #[test]
    fn logic_over_assigned_locals() {
        let program = "V=3; VAR=43; ($(VAR) < 33 && $(V) < 1) || ($(VAR) > 40 && $(V) > 1)";
        assert_eq!(run(program).unwrap(), "TRUE");
    }

    #[test]
    fn prefix_and_postfix_decrement() {
        assert_eq!(run("a=1; --$(a)--").unwrap(), "-1");

        let mut bg = Background::new("expr");
        assert_eq!(Expression::compile("a=5; $(a)++").unwrap().eval(&mut bg).unwrap(), "5");
        assert_eq!(bg.get_local("a"), "6");
        assert_eq!(Expression::compile("++a").unwrap().eval(&mut bg).unwrap(), "7");
    }

    #[test]
    fn arithmetic_precedence() {
        assert_eq!(run("1 + 2 * 3").unwrap(), "7");
        assert_eq!(run("(1 + 2) * 3").unwrap(), "9");
        assert_eq!(run("7 % 4 - -1").unwrap(), "4");
        assert_eq!(run("1 / 4").unwrap(), "0.25");
    }

    #[test]
    fn compound_assignment_reads_local_slot() {
        let mut bg = Background::new("expr");
        bg.set_local("n", "10");
        let result = Expression::compile("n += 5; $(n) *= 2").unwrap().eval(&mut bg);
        assert_eq!(result.unwrap(), "30");
        assert_eq!(bg.get_local("n"), "30");
    }

    #[test]
    fn assignment_is_right_associative() {
        let mut bg = Background::new("expr");
        Expression::compile("a = b = 4").unwrap().eval(&mut bg).unwrap();
        assert_eq!(bg.get_local("a"), "4");
        assert_eq!(bg.get_local("b"), "4");
    }

    #[test]
    fn equality_rules() {
        assert_eq!(run("1.00000001 == 1").unwrap(), "TRUE");
        assert_eq!(run("'abc' == abc").unwrap(), "TRUE");
        assert_eq!(run("TRUE == true").unwrap(), "TRUE");
        assert_eq!(run("'a' != 'b'").unwrap(), "TRUE");
    }

    #[test]
    fn json_frame_value() {
        let mut bg = Background::new("expr");
        bg.push_json_env("int1", json!(2));
        let check = Expression::compile("$ > 1 && $ < 9").unwrap();
        assert_eq!(check.eval(&mut bg).unwrap(), "TRUE");
        assert_eq!(Expression::compile("$<key> == int1").unwrap().eval(&mut bg).unwrap(), "TRUE");
    }

    #[test]
    fn runtime_failures() {
        assert!(run("1 / 0").is_err());
        assert!(run("!abc").is_err());
        assert!(run("'x' < 1").is_err());
        assert!(run("TRUE && 'maybe'").is_err());
    }

    #[test]
    fn short_circuit_skips_right_side() {
        assert_eq!(run("FALSE && 1 / 0 == 1").unwrap(), "FALSE");
        assert_eq!(run("TRUE || 1 / 0 == 1").unwrap(), "TRUE");
    }

    #[test]
    fn compile_failures() {
        assert!(Expression::compile("1 +").is_err());
        assert!(Expression::compile("(1").is_err());
        assert!(Expression::compile("1 = 2").is_err());
        assert!(Expression::compile("${G} = 2").is_err());
        assert!(Expression::compile("3++").is_err());
    }

    #[test]
    fn trailing_semicolon_keeps_left_value() {
        assert_eq!(run("x = 2;").unwrap(), "2");
    }
}
