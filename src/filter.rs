//! Filter condition grammar.
//!
//! A condition is `<field> <op> <value>`, for example `score >= 20` or
//! `name == 'Ada'`. Conditions are parsed and checked here, before any SQL is
//! built; the dialect strategies only ever see resolved [`Predicate`]s.
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};
use crate::model::{validate_field_name, ID_COLUMN, TIMESTAMP_COLUMN};

/// Comparison operators, in longest-first match order.
const OPERATORS: [(&str, CompareOp); 6] = [
    ("==", CompareOp::Eq),
    ("!=", CompareOp::NotEq),
    (">=", CompareOp::GtEq),
    ("<=", CompareOp::LtEq),
    (">", CompareOp::Gt),
    ("<", CompareOp::Lt),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    NotEq,
    Gt,
    GtEq,
    Lt,
    LtEq,
}

impl CompareOp {
    /// SQL spelling, identical for every supported dialect.
    pub fn sql(&self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::NotEq => "<>",
            CompareOp::Gt => ">",
            CompareOp::GtEq => ">=",
            CompareOp::Lt => "<",
            CompareOp::LtEq => "<=",
        }
    }

    pub fn is_equality(&self) -> bool {
        matches!(self, CompareOp::Eq | CompareOp::NotEq)
    }
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let token = OPERATORS
            .iter()
            .find(|(_, op)| op == self)
            .map(|(token, _)| *token)
            .unwrap_or("?");
        write!(f, "{}", token)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
}

impl Literal {
    fn parse(raw: &str) -> Literal {
        let raw = raw.trim();
        if let Some(unquoted) = strip_quotes(raw) {
            return Literal::Text(unquoted.to_string());
        }
        match raw {
            "null" | "NULL" => return Literal::Null,
            "true" => return Literal::Bool(true),
            "false" => return Literal::Bool(false),
            _ => {}
        }
        match raw.parse::<f64>() {
            Ok(n) if n.is_finite() => Literal::Number(n),
            _ => Literal::Text(raw.to_string()),
        }
    }

    /// The literal as the text the backend's JSON-to-text extraction yields.
    pub fn as_text(&self) -> String {
        match self {
            Literal::Null => "null".to_string(),
            Literal::Bool(b) => b.to_string(),
            Literal::Number(n) => n.to_string(),
            Literal::Text(s) => s.clone(),
        }
    }
}

fn strip_quotes(raw: &str) -> Option<&str> {
    for quote in ['\'', '"'] {
        if raw.len() >= 2 && raw.starts_with(quote) && raw.ends_with(quote) {
            return Some(&raw[1..raw.len() - 1]);
        }
    }
    None
}

/// A syntactically valid condition, not yet checked against a collection.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub field: String,
    pub op: CompareOp,
    pub value: Literal,
}

/// Parse one `<field> <op> <value>` condition.
pub fn parse_condition(input: &str) -> Result<Condition> {
    let text = input.trim();
    let field_end = text
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .unwrap_or(text.len());
    let field = &text[..field_end];
    if field.is_empty() {
        return Err(StoreError::Syntax(format!(
            "condition {:?} does not start with a field name",
            input
        )));
    }
    validate_field_name(field).map_err(|_| {
        StoreError::Syntax(format!("invalid field name {:?} in {:?}", field, input))
    })?;

    let rest = text[field_end..].trim_start();
    let (token, op) = OPERATORS
        .iter()
        .find(|(token, _)| rest.starts_with(token))
        .ok_or_else(|| {
            StoreError::Syntax(format!(
                "condition {:?} has no comparison operator (expected one of ==, !=, >=, <=, >, <)",
                input
            ))
        })?;

    let raw_value = rest[token.len()..].trim();
    if raw_value.is_empty() {
        return Err(StoreError::Syntax(format!(
            "condition {:?} has no value",
            input
        )));
    }
    // "a >== 1" and "a <> 1" are typos, not comparisons against "= 1" or "> 1".
    if raw_value.starts_with(&['=', '<', '>', '!'][..]) {
        return Err(StoreError::Syntax(format!(
            "condition {:?} has an unrecognized operator",
            input
        )));
    }

    let value = Literal::parse(raw_value);
    if value == Literal::Null && !op.is_equality() {
        return Err(StoreError::Syntax(format!(
            "null can only be compared with == or != in {:?}",
            input
        )));
    }

    Ok(Condition {
        field: field.to_string(),
        op: *op,
        value,
    })
}

/// What a predicate reads from a row.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterTarget {
    /// The primary-key column.
    Id,
    /// The creation timestamp column.
    Timestamp,
    /// An indexed field inside the JSON payload.
    Field(String),
}

/// A condition resolved against a collection's known fields.
#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    pub target: FilterTarget,
    pub op: CompareOp,
    pub value: Literal,
}

/// Parse every condition and resolve its field against `indexed_fields`.
///
/// Fields other than the primary key, the timestamp and the collection's
/// indexed fields have no backing column and are rejected.
pub fn resolve_conditions<S: AsRef<str>>(
    conditions: &[S],
    indexed_fields: &[String],
) -> Result<Vec<Predicate>> {
    conditions
        .iter()
        .map(|raw| {
            let cond = parse_condition(raw.as_ref())?;
            let target = if cond.field == ID_COLUMN {
                FilterTarget::Id
            } else if cond.field == TIMESTAMP_COLUMN {
                if !matches!(cond.value, Literal::Number(_)) {
                    return Err(StoreError::Syntax(format!(
                        "{} must be compared with a number in {:?}",
                        TIMESTAMP_COLUMN,
                        raw.as_ref()
                    )));
                }
                FilterTarget::Timestamp
            } else if indexed_fields.iter().any(|f| f == &cond.field) {
                FilterTarget::Field(cond.field.clone())
            } else {
                return Err(StoreError::Syntax(format!(
                    "field {:?} has no matching column",
                    cond.field
                )));
            };
            Ok(Predicate {
                target,
                op: cond.op,
                value: cond.value,
            })
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

impl SortOrder {
    pub fn sql(&self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }
}

impl FromStr for SortOrder {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "asc" => Ok(SortOrder::Asc),
            "desc" => Ok(SortOrder::Desc),
            other => Err(StoreError::Syntax(format!(
                "sort order must be 'asc' or 'desc', got {:?}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_parse_numeric_condition() {
        let cond = parse_condition("score >= 20").unwrap();
        assert_eq!(cond.field, "score");
        assert_eq!(cond.op, CompareOp::GtEq);
        assert_eq!(cond.value, Literal::Number(20.0));
    }

    #[test]
    fn test_parse_without_spaces() {
        let cond = parse_condition("age<30").unwrap();
        assert_eq!(cond.op, CompareOp::Lt);
        assert_eq!(cond.value, Literal::Number(30.0));

        let cond = parse_condition("age!=30").unwrap();
        assert_eq!(cond.op, CompareOp::NotEq);
    }

    #[test]
    fn test_parse_string_literals() {
        let cond = parse_condition("name == 'Ada Lovelace'").unwrap();
        assert_eq!(cond.value, Literal::Text("Ada Lovelace".into()));

        let cond = parse_condition(r#"name == "Grace""#).unwrap();
        assert_eq!(cond.value, Literal::Text("Grace".into()));

        let cond = parse_condition("status == active").unwrap();
        assert_eq!(cond.value, Literal::Text("active".into()));

        let cond = parse_condition("code == '42'").unwrap();
        assert_eq!(cond.value, Literal::Text("42".into()));
    }

    #[test]
    fn test_parse_bool_and_null() {
        assert_eq!(
            parse_condition("done == true").unwrap().value,
            Literal::Bool(true)
        );
        assert_eq!(
            parse_condition("deleted != null").unwrap().value,
            Literal::Null
        );
    }

    #[test]
    fn test_invalid_syntax_is_rejected() {
        for bad in [
            "invalid syntax",
            "",
            "   ",
            ">= 3",
            "score >=",
            "score => 3",
            "score >== 3",
            "score <> 3",
            "score = 3",
            "a.b == 1",
            "1abc == 1",
            "score > null",
        ] {
            let err = parse_condition(bad).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Syntax, "expected syntax error for {:?}", bad);
        }
    }

    #[test]
    fn test_resolve_known_fields() {
        let indexed = vec!["score".to_string()];
        let preds = resolve_conditions(
            &["score > 1", "id == 'a'", "__timestamp < 100"],
            &indexed,
        )
        .unwrap();
        assert_eq!(preds[0].target, FilterTarget::Field("score".into()));
        assert_eq!(preds[1].target, FilterTarget::Id);
        assert_eq!(preds[2].target, FilterTarget::Timestamp);
    }

    #[test]
    fn test_resolve_unknown_field_is_syntax_error() {
        let err = resolve_conditions(&["color == 'red'"], &["score".to_string()]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Syntax);
        assert!(err.to_string().contains("color"));
    }

    #[test]
    fn test_resolve_timestamp_needs_number() {
        let err = resolve_conditions(&["__timestamp > 'yesterday'"], &[]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Syntax);
    }

    #[test]
    fn test_resolve_empty_is_ok() {
        let none: [&str; 0] = [];
        assert!(resolve_conditions(&none, &[]).unwrap().is_empty());
    }

    #[test]
    fn test_sort_order_parse() {
        assert_eq!("asc".parse::<SortOrder>().unwrap(), SortOrder::Asc);
        assert_eq!(" DESC ".parse::<SortOrder>().unwrap(), SortOrder::Desc);
        assert_eq!(
            "sideways".parse::<SortOrder>().unwrap_err().kind(),
            ErrorKind::Syntax
        );
        assert_eq!(SortOrder::default(), SortOrder::Asc);
    }

    #[test]
    fn test_operator_display() {
        assert_eq!(CompareOp::GtEq.to_string(), ">=");
        assert_eq!(CompareOp::NotEq.to_string(), "!=");
        assert_eq!(CompareOp::NotEq.sql(), "<>");
    }
}
