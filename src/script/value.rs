//! Coercion rules for the string-valued script universe.

/// Absolute tolerance used by every numeric comparison.
pub const TOLERANCE: f64 = 1e-7;

pub const TRUE: &str = "TRUE";
pub const FALSE: &str = "FALSE";

/// A script value classified by its most specific reading.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Number(f64),
    Text(String),
}

impl Value {
    /// Integers win over floats and numbers win over booleans, so `1` and
    /// `0` classify as integers.
    pub fn classify(text: &str) -> Self {
        if let Some(int) = parse_int(text) {
            return Value::Int(int);
        }
        if let Some(number) = parse_number(text) {
            return Value::Number(number);
        }
        if let Some(flag) = parse_bool(text) {
            return Value::Bool(flag);
        }
        Value::Text(text.to_string())
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Int(int) => Some(*int as f64),
            Value::Number(number) => Some(*number),
            _ => None,
        }
    }

    /// `1` and `0` double as booleans.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(flag) => Some(*flag),
            Value::Int(int @ (0 | 1)) => Some(*int == 1),
            _ => None,
        }
    }
}

pub fn parse_number(text: &str) -> Option<f64> {
    let trimmed = text.trim();
    let first = trimmed.chars().next()?;
    if !(first.is_ascii_digit() || matches!(first, '-' | '+' | '.')) {
        return None;
    }
    trimmed.parse::<f64>().ok().filter(|value| value.is_finite())
}

pub fn parse_int(text: &str) -> Option<i64> {
    text.trim().parse::<i64>().ok()
}

/// Recognised spellings: any case of `true`/`false`, plus `1` and `0`.
pub fn parse_bool(text: &str) -> Option<bool> {
    let trimmed = text.trim();
    if trimmed.eq_ignore_ascii_case("true") || trimmed == "1" {
        Some(true)
    } else if trimmed.eq_ignore_ascii_case("false") || trimmed == "0" {
        Some(false)
    } else {
        None
    }
}

pub fn bool_text(flag: bool) -> &'static str {
    if flag {
        TRUE
    } else {
        FALSE
    }
}

/// Integral values print without a fractional part.
pub fn format_number(number: f64) -> String {
    if number.is_finite() && number.fract() == 0.0 && number.abs() < 9.007_199_254_740_992e15 {
        format!("{}", number as i64)
    } else {
        format!("{number}")
    }
}

pub fn numbers_equal(left: f64, right: f64) -> bool {
    (left - right).abs() < TOLERANCE
}

/// `==` semantics: exact for two integers, tolerant for other numbers,
/// then boolean, then plain string equality.
pub fn values_equal(left: &str, right: &str) -> bool {
    let (l, r) = (Value::classify(left), Value::classify(right));
    match (&l, &r) {
        (Value::Int(a), Value::Int(b)) => return a == b,
        (Value::Text(a), Value::Text(b)) => return a == b,
        _ => {}
    }
    if let (Some(a), Some(b)) = (l.as_number(), r.as_number()) {
        return numbers_equal(a, b);
    }
    if let (Some(a), Some(b)) = (l.as_bool(), r.as_bool()) {
        return a == b;
    }
    left == right
}

/// Ordering with tolerance; values within `TOLERANCE` compare equal.
pub fn compare_numbers(left: f64, right: f64) -> std::cmp::Ordering {
    if numbers_equal(left, right) {
        std::cmp::Ordering::Equal
    } else if left < right {
        std::cmp::Ordering::Less
    } else {
        std::cmp::Ordering::Greater
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_prefers_numbers() {
        assert_eq!(Value::classify("1"), Value::Int(1));
        assert_eq!(Value::classify("1.5"), Value::Number(1.5));
        assert_eq!(Value::classify("True"), Value::Bool(true));
        assert_eq!(Value::classify("abc"), Value::Text("abc".into()));
        assert_eq!(Value::classify("inf"), Value::Text("inf".into()));
    }

    #[test]
    fn numbers_format_without_trailing_zero() {
        assert_eq!(format_number(-1.0), "-1");
        assert_eq!(format_number(2.5), "2.5");
        assert_eq!(format_number(1e20), "100000000000000000000");
    }

    #[test]
    fn equality_tolerates_small_differences() {
        assert!(values_equal("1.00000001", "1"));
        assert!(!values_equal("1.00001", "1"));
        assert!(values_equal("TRUE", "true"));
        assert!(values_equal("abc", "abc"));
        assert!(!values_equal("abc", "abd"));
    }

    #[test]
    fn integer_equality_is_exact_beyond_f64_precision() {
        assert!(values_equal("9007199254740993", "9007199254740993"));
        assert!(!values_equal("9007199254740993", "9007199254740992"));
        assert!(values_equal("2", "2.00000001"));
        assert!(values_equal("1", "true"));
        assert!(!values_equal("x", "1"));
    }

    #[test]
    fn bool_parsing_accepts_io_spellings() {
        assert_eq!(parse_bool("1"), Some(true));
        assert_eq!(parse_bool("FALSE"), Some(false));
        assert_eq!(parse_bool("yes"), None);
    }
}
