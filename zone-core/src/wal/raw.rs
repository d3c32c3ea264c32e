//! The normalized shape every decoded WAL message collapses to (spec §4.1).
//!
//! `pgoutput` ships every column as text (or omits it for a TOAST column
//! that didn't change, or nulls it). Rather than push individual column
//! type handling into the decoder, every row is first collapsed into a
//! `RawRow` — a plain map of column name to optional text — and only
//! [`crate::hooks`] converts that into a typed entity. This mirrors the
//! WAL consumer's contract literally: "emits a normalized `(lsn, op,
//! table, old_row, new_row)` per write".

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

/// One column's text value, or `None` for SQL NULL.
pub type RawRow = HashMap<String, Option<String>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawOp {
    Insert,
    Update,
    Delete,
}

/// A single decoded write, already resolved to a table name via the
/// relation registry and tagged with the LSN it was observed at.
#[derive(Debug, Clone)]
pub struct RawChange {
    pub lsn: u64,
    pub op: RawOp,
    pub table: String,
    pub old: Option<RawRow>,
    pub new: Option<RawRow>,
    /// JSON payload carried by a `LogicalMessage` with prefix `subject`
    /// emitted earlier in the same transaction, if any (spec §4.1).
    pub txn_subject: Option<Value>,
}

/// Errors converting a [`RawRow`] column into a typed value. Distinct from
/// [`crate::error::Error`] because these are almost always a bug in the
/// schema/decoder pairing rather than something callers branch on.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RowParseError {
    #[error("missing required column: {0}")]
    MissingColumn(&'static str),
    #[error("column {column} is null but is required to be non-null")]
    UnexpectedNull { column: &'static str },
    #[error("column {column} could not be parsed as {expected}: {value}")]
    Malformed {
        column: &'static str,
        expected: &'static str,
        value: String,
    },
    /// The WAL consumer's contract (spec §4.1) guarantees `old_row` for
    /// `update`/`delete` and `new_row` for `insert`/`update`; seeing neither
    /// for a given op means that contract broke upstream, not a column typo.
    #[error("{op} on {table} carried no {side} row")]
    MissingRow {
        table: &'static str,
        op: &'static str,
        side: &'static str,
    },
}

/// The `old` row of a `change`, or a [`RowParseError::MissingRow`] if the
/// WAL consumer's contract was violated for this op.
pub fn old_row<'a>(change: &'a RawChange, table: &'static str) -> Result<&'a RawRow, RowParseError> {
    change.old.as_ref().ok_or(RowParseError::MissingRow {
        table,
        op: op_name(change.op),
        side: "old",
    })
}

/// The `new` row of a `change`, or a [`RowParseError::MissingRow`] if the
/// WAL consumer's contract was violated for this op.
pub fn new_row<'a>(change: &'a RawChange, table: &'static str) -> Result<&'a RawRow, RowParseError> {
    change.new.as_ref().ok_or(RowParseError::MissingRow {
        table,
        op: op_name(change.op),
        side: "new",
    })
}

fn op_name(op: RawOp) -> &'static str {
    match op {
        RawOp::Insert => "insert",
        RawOp::Update => "update",
        RawOp::Delete => "delete",
    }
}

/// Fetch a column, distinguishing "absent" from "present but null".
pub fn column<'a>(row: &'a RawRow, name: &'static str) -> Result<Option<&'a str>, RowParseError> {
    match row.get(name) {
        None => Err(RowParseError::MissingColumn(name)),
        Some(None) => Ok(None),
        Some(Some(v)) => Ok(Some(v.as_str())),
    }
}

/// A required, non-null text column.
pub fn required_str<'a>(row: &'a RawRow, name: &'static str) -> Result<&'a str, RowParseError> {
    column(row, name)?.ok_or(RowParseError::UnexpectedNull { column: name })
}

/// An optional text column (present-and-null or present-and-set both ok;
/// missing is still an error, since it indicates a relation/column mismatch).
pub fn optional_str<'a>(row: &'a RawRow, name: &'static str) -> Result<Option<&'a str>, RowParseError> {
    column(row, name)
}

pub fn required_uuid(row: &RawRow, name: &'static str) -> Result<Uuid, RowParseError> {
    let raw = required_str(row, name)?;
    Uuid::parse_str(raw).map_err(|_| RowParseError::Malformed {
        column: name,
        expected: "uuid",
        value: raw.to_string(),
    })
}

pub fn optional_uuid(row: &RawRow, name: &'static str) -> Result<Option<Uuid>, RowParseError> {
    match optional_str(row, name)? {
        None => Ok(None),
        Some(raw) => Uuid::parse_str(raw)
            .map(Some)
            .map_err(|_| RowParseError::Malformed {
                column: name,
                expected: "uuid",
                value: raw.to_string(),
            }),
    }
}

pub fn required_timestamp(row: &RawRow, name: &'static str) -> Result<DateTime<Utc>, RowParseError> {
    let raw = required_str(row, name)?;
    parse_timestamp(name, raw)
}

pub fn optional_timestamp(
    row: &RawRow,
    name: &'static str,
) -> Result<Option<DateTime<Utc>>, RowParseError> {
    match optional_str(row, name)? {
        None => Ok(None),
        Some(raw) => parse_timestamp(name, raw).map(Some),
    }
}

fn parse_timestamp(name: &'static str, raw: &str) -> Result<DateTime<Utc>, RowParseError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| RowParseError::Malformed {
            column: name,
            expected: "rfc3339 timestamp",
            value: raw.to_string(),
        })
}

pub fn required_bool(row: &RawRow, name: &'static str) -> Result<bool, RowParseError> {
    let raw = required_str(row, name)?;
    parse_bool(name, raw)
}

fn parse_bool(name: &'static str, raw: &str) -> Result<bool, RowParseError> {
    match raw {
        "t" | "true" | "1" => Ok(true),
        "f" | "false" | "0" => Ok(false),
        other => Err(RowParseError::Malformed {
            column: name,
            expected: "bool",
            value: other.to_string(),
        }),
    }
}

/// Postgres emits `text[]` columns as `{a,b,c}`; good enough for the
/// `features`/`ports` columns, neither of which contains commas or braces.
pub fn required_text_array(row: &RawRow, name: &'static str) -> Result<Vec<String>, RowParseError> {
    let raw = required_str(row, name)?;
    let inner = raw
        .strip_prefix('{')
        .and_then(|s| s.strip_suffix('}'))
        .ok_or_else(|| RowParseError::Malformed {
            column: name,
            expected: "postgres array literal",
            value: raw.to_string(),
        })?;
    if inner.is_empty() {
        return Ok(vec![]);
    }
    Ok(inner.split(',').map(|s| s.trim_matches('"').to_string()).collect())
}

/// A JSONB column holding an array of `{property, operator, values}`
/// objects (policy conditions); stored as JSON text over the wire.
pub fn required_json(row: &RawRow, name: &'static str) -> Result<Value, RowParseError> {
    let raw = required_str(row, name)?;
    serde_json::from_str(raw).map_err(|_| RowParseError::Malformed {
        column: name,
        expected: "json",
        value: raw.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(pairs: &[(&str, Option<&str>)]) -> RawRow {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.map(|s| s.to_string())))
            .collect()
    }

    #[test]
    fn missing_column_is_distinct_from_null() {
        let r = row(&[("a", None)]);
        assert_eq!(column(&r, "a"), Ok(None));
        assert_eq!(column(&r, "b"), Err(RowParseError::MissingColumn("b")));
    }

    #[test]
    fn old_row_and_new_row_report_missing_row_instead_of_panicking() {
        let change = RawChange {
            lsn: 1,
            op: RawOp::Insert,
            table: "policies".to_string(),
            old: None,
            new: Some(row(&[("id", Some("x"))])),
            txn_subject: None,
        };
        assert_eq!(
            old_row(&change, "policies"),
            Err(RowParseError::MissingRow {
                table: "policies",
                op: "insert",
                side: "old",
            })
        );
        assert!(new_row(&change, "policies").is_ok());
    }

    #[test]
    fn parses_postgres_text_array() {
        let r = row(&[("features", Some("{alpha,beta}"))]);
        assert_eq!(
            required_text_array(&r, "features").unwrap(),
            vec!["alpha".to_string(), "beta".to_string()]
        );
    }

    #[test]
    fn parses_empty_text_array() {
        let r = row(&[("features", Some("{}"))]);
        assert_eq!(required_text_array(&r, "features").unwrap(), Vec::<String>::new());
    }

    #[test]
    fn parses_bool_variants() {
        assert_eq!(parse_bool("x", "t"), Ok(true));
        assert_eq!(parse_bool("x", "f"), Ok(false));
        assert!(parse_bool("x", "maybe").is_err());
    }
}
