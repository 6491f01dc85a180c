//! Filter expressions over JSON documents.

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

/// A predicate over the fields of a JSON document.
///
/// Fields are dot paths (`"address.city"`); a numeric segment also indexes
/// into arrays. A comparison against a missing field, or between values of
/// different types, is false.
///
/// In JSON, expressions are externally tagged:
///
/// ```json
/// {"and": [{"gt": {"field": "age", "value": 30}}, {"exists": {"field": "email"}}]}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expression {
    /// Field equals value. Numbers compare by value, so `1` equals `1.0`.
    Eq {
        /// Dot path.
        field: String,
        /// Operand.
        value: Value,
    },
    /// Field is present and differs from value.
    Ne {
        /// Dot path.
        field: String,
        /// Operand.
        value: Value,
    },
    /// Field is less than value.
    Lt {
        /// Dot path.
        field: String,
        /// Operand.
        value: Value,
    },
    /// Field is less than or equal to value.
    Le {
        /// Dot path.
        field: String,
        /// Operand.
        value: Value,
    },
    /// Field is greater than value.
    Gt {
        /// Dot path.
        field: String,
        /// Operand.
        value: Value,
    },
    /// Field is greater than or equal to value.
    Ge {
        /// Dot path.
        field: String,
        /// Operand.
        value: Value,
    },
    /// Field is present, possibly `null`.
    Exists {
        /// Dot path.
        field: String,
    },
    /// Every operand holds. Empty is true.
    And(Vec<Expression>),
    /// Some operand holds. Empty is false.
    Or(Vec<Expression>),
    /// The operand does not hold.
    Not(Box<Expression>),
}

impl Expression {
    /// `field == value`.
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Eq {
            field: field.into(),
            value: value.into(),
        }
    }

    /// `field != value`.
    pub fn ne(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Ne {
            field: field.into(),
            value: value.into(),
        }
    }

    /// `field < value`.
    pub fn lt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Lt {
            field: field.into(),
            value: value.into(),
        }
    }

    /// `field <= value`.
    pub fn le(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Le {
            field: field.into(),
            value: value.into(),
        }
    }

    /// `field > value`.
    pub fn gt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Gt {
            field: field.into(),
            value: value.into(),
        }
    }

    /// `field >= value`.
    pub fn ge(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Ge {
            field: field.into(),
            value: value.into(),
        }
    }

    /// `field` is present.
    pub fn exists(field: impl Into<String>) -> Self {
        Self::Exists {
            field: field.into(),
        }
    }

    /// Checks that every field path is well formed.
    pub fn validate(&self) -> CoreResult<()> {
        match self {
            Self::Eq { field, .. }
            | Self::Ne { field, .. }
            | Self::Lt { field, .. }
            | Self::Le { field, .. }
            | Self::Gt { field, .. }
            | Self::Ge { field, .. }
            | Self::Exists { field } => validate_path(field),
            Self::And(operands) | Self::Or(operands) => {
                operands.iter().try_for_each(Self::validate)
            }
            Self::Not(operand) => operand.validate(),
        }
    }

    /// Evaluates against a parsed document; `None` is a document with no
    /// fields.
    #[must_use]
    pub fn matches(&self, doc: Option<&Value>) -> bool {
        let field_of = |path: &str| doc.and_then(|doc| lookup(doc, path));
        match self {
            Self::Eq { field, value } => field_of(field).is_some_and(|v| values_equal(v, value)),
            Self::Ne { field, value } => field_of(field).is_some_and(|v| !values_equal(v, value)),
            Self::Lt { field, value } => compares(field_of(field), value, Ordering::is_lt),
            Self::Le { field, value } => compares(field_of(field), value, Ordering::is_le),
            Self::Gt { field, value } => compares(field_of(field), value, Ordering::is_gt),
            Self::Ge { field, value } => compares(field_of(field), value, Ordering::is_ge),
            Self::Exists { field } => field_of(field).is_some(),
            Self::And(operands) => operands.iter().all(|e| e.matches(doc)),
            Self::Or(operands) => operands.iter().any(|e| e.matches(doc)),
            Self::Not(operand) => !operand.matches(doc),
        }
    }

    /// Evaluates against a raw payload. Payloads that are not JSON have no
    /// fields.
    #[must_use]
    pub fn matches_payload(&self, payload: &[u8]) -> bool {
        let doc = serde_json::from_slice::<Value>(payload).ok();
        self.matches(doc.as_ref())
    }
}

pub(crate) fn validate_path(path: &str) -> CoreResult<()> {
    if path.is_empty() || path.split('.').any(str::is_empty) {
        return Err(CoreError::invalid_argument(format!(
            "invalid field path {path:?}"
        )));
    }
    Ok(())
}

/// Resolves a dot path inside a document.
#[must_use]
pub fn lookup<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(doc, |value, segment| match value {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

/// Orders two scalars of the same type; `None` for mixed or composite types.
pub(crate) fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => None,
    }
}

fn compares(field: Option<&Value>, value: &Value, accept: fn(Ordering) -> bool) -> bool {
    field
        .and_then(|field| compare_values(field, value))
        .is_some_and(accept)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc() -> Value {
        json!({
            "name": "ada",
            "age": 36,
            "score": 9.5,
            "admin": true,
            "nickname": null,
            "address": {"city": "London", "zip": "N1"},
            "tags": ["math", "engines"]
        })
    }

    #[test]
    fn comparisons() {
        let d = doc();
        let d = Some(&d);
        assert!(Expression::eq("age", 36).matches(d));
        assert!(Expression::eq("age", 36.0).matches(d));
        assert!(Expression::lt("age", 40).matches(d));
        assert!(Expression::le("age", 36).matches(d));
        assert!(!Expression::gt("age", 36).matches(d));
        assert!(Expression::ge("score", 9.5).matches(d));
        assert!(Expression::gt("name", "ab").matches(d));
        assert!(Expression::eq("admin", true).matches(d));
    }

    #[test]
    fn missing_and_mixed_types_are_false() {
        let d = doc();
        let d = Some(&d);
        assert!(!Expression::eq("missing", 1).matches(d));
        assert!(!Expression::ne("missing", 1).matches(d));
        assert!(!Expression::lt("name", 5).matches(d));
        assert!(!Expression::ge("name", 5).matches(d));
        assert!(Expression::ne("name", 5).matches(d));
        assert!(!Expression::eq("age", 1).matches(None));
    }

    #[test]
    fn paths_and_exists() {
        let d = doc();
        let d = Some(&d);
        assert!(Expression::eq("address.city", "London").matches(d));
        assert!(Expression::eq("tags.1", "engines").matches(d));
        assert!(!Expression::exists("tags.7").matches(d));
        assert!(Expression::exists("nickname").matches(d));
        assert!(!Expression::exists("address.city.x").matches(d));
    }

    #[test]
    fn boolean_connectives() {
        let d = doc();
        let d = Some(&d);
        let adult_admin = Expression::And(vec![
            Expression::ge("age", 18),
            Expression::eq("admin", true),
        ]);
        assert!(adult_admin.matches(d));
        assert!(Expression::Or(vec![Expression::eq("age", 1), Expression::exists("name")]).matches(d));
        assert!(Expression::Not(Box::new(Expression::eq("missing", 1))).matches(d));
        assert!(Expression::And(Vec::new()).matches(d));
        assert!(!Expression::Or(Vec::new()).matches(d));
    }

    #[test]
    fn non_json_payload_has_no_fields() {
        assert!(!Expression::exists("a").matches_payload(b"\xff\x00raw"));
        assert!(Expression::Not(Box::new(Expression::exists("a"))).matches_payload(b"raw"));
        assert!(Expression::eq("a", 1).matches_payload(br#"{"a": 1}"#));
    }

    #[test]
    fn parses_from_json() {
        let expr: Expression = serde_json::from_value(json!({
            "and": [
                {"gt": {"field": "age", "value": 30}},
                {"not": {"exists": {"field": "banned"}}}
            ]
        }))
        .unwrap();
        assert_eq!(
            expr,
            Expression::And(vec![
                Expression::gt("age", 30),
                Expression::Not(Box::new(Expression::exists("banned"))),
            ])
        );
    }

    #[test]
    fn path_validation() {
        assert!(Expression::eq("a.b", 1).validate().is_ok());
        assert!(Expression::eq("", 1).validate().is_err());
        assert!(Expression::Not(Box::new(Expression::exists("a..b"))).validate().is_err());
    }
}
