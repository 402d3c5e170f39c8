//! Row model and value coercion helpers.
//!
//! Rows flow through the pipeline as JSON objects; sources and sinks
//! agree on this shape so transforms and quality rules stay pure.

use serde_json::{Map, Value};

use crate::error::CoreError;

/// A single record moving through a pipeline.
pub type Row = Map<String, Value>;

/// Target type of a cast step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CastType {
    String,
    Integer,
    Float,
    Boolean,
}

/// Render a value the way filters and dedup keys compare it.
///
/// `Null` renders as the empty string so `is_null`-style checks treat
/// missing and null columns alike.
pub fn display_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Coerce a value to f64 for numeric comparison and aggregation.
/// Non-numeric values coerce to 0.0, matching SQL-ish loose semantics.
pub fn to_f64(value: &Value) -> f64 {
    match value {
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        Value::String(s) => s.trim().parse().unwrap_or(0.0),
        Value::Bool(true) => 1.0,
        _ => 0.0,
    }
}

/// Cast a value to the target type.
///
/// Nulls pass through unchanged. Unparsable inputs return a
/// [`CoreError::Validation`]; the caller decides whether that is fatal
/// (strict mode) or means the row is skipped (lenient mode).
pub fn cast_value(value: &Value, target: CastType) -> Result<Value, CoreError> {
    if value.is_null() {
        return Ok(Value::Null);
    }
    match target {
        CastType::String => Ok(Value::String(display_value(value))),
        CastType::Integer => {
            let f = parse_number(value)?;
            Ok(Value::from(f.trunc() as i64))
        }
        CastType::Float => {
            let f = parse_number(value)?;
            serde_json::Number::from_f64(f)
                .map(Value::Number)
                .ok_or_else(|| CoreError::Validation(format!("cannot represent {f} as a number")))
        }
        CastType::Boolean => {
            let truthy = match value {
                Value::Bool(b) => *b,
                Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
                Value::String(s) => {
                    matches!(s.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes")
                }
                _ => {
                    return Err(CoreError::Validation(format!(
                        "cannot cast {value} to boolean"
                    )))
                }
            };
            Ok(Value::Bool(truthy))
        }
    }
}

fn parse_number(value: &Value) -> Result<f64, CoreError> {
    match value {
        Value::Number(n) => Ok(n.as_f64().unwrap_or(0.0)),
        Value::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
        Value::String(s) => s
            .trim()
            .parse()
            .map_err(|_| CoreError::Validation(format!("'{s}' is not numeric"))),
        other => Err(CoreError::Validation(format!(
            "cannot cast {other} to a number"
        ))),
    }
}

/// Key equality used by deduplicate and upsert: values compare by their
/// rendered form after cast, so `1` and `1.0` written as strings match.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    if a == b {
        return true;
    }
    display_value(a) == display_value(b)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    // -- to_f64 --------------------------------------------------------------

    #[test]
    fn numbers_and_numeric_strings_coerce() {
        assert_eq!(to_f64(&json!(3.5)), 3.5);
        assert_eq!(to_f64(&json!("42")), 42.0);
        assert_eq!(to_f64(&json!(" 7 ")), 7.0);
    }

    #[test]
    fn non_numeric_coerces_to_zero() {
        assert_eq!(to_f64(&json!("abc")), 0.0);
        assert_eq!(to_f64(&Value::Null), 0.0);
    }

    // -- cast_value ----------------------------------------------------------

    #[test]
    fn cast_to_integer_truncates() {
        assert_eq!(cast_value(&json!("3.9"), CastType::Integer).unwrap(), json!(3));
        assert_eq!(cast_value(&json!(5.2), CastType::Integer).unwrap(), json!(5));
    }

    #[test]
    fn cast_to_string_renders_value() {
        assert_eq!(
            cast_value(&json!(12), CastType::String).unwrap(),
            json!("12")
        );
    }

    #[test]
    fn cast_to_boolean_recognizes_truthy_strings() {
        for s in ["true", "1", "yes", "YES"] {
            assert_eq!(
                cast_value(&json!(s), CastType::Boolean).unwrap(),
                json!(true),
                "{s} should be truthy"
            );
        }
        assert_eq!(
            cast_value(&json!("no"), CastType::Boolean).unwrap(),
            json!(false)
        );
    }

    #[test]
    fn null_passes_through_any_cast() {
        assert_eq!(cast_value(&Value::Null, CastType::Integer).unwrap(), Value::Null);
    }

    #[test]
    fn unparsable_numeric_cast_errors() {
        assert!(cast_value(&json!("abc"), CastType::Integer).is_err());
        assert!(cast_value(&json!("abc"), CastType::Float).is_err());
    }

    // -- values_equal --------------------------------------------------------

    #[test]
    fn equal_after_render() {
        assert!(values_equal(&json!(1), &json!("1")));
        assert!(values_equal(&json!("x"), &json!("x")));
        assert!(!values_equal(&json!(1), &json!(2)));
    }
}
