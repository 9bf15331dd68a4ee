//! Driver-neutral result rows.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};

/// One decoded value. Integers narrower than 64 bits land in `Int`; `int8`
/// lands in `BigInt` so later stages can render it losslessly.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Null,
    Bool(bool),
    Int(i64),
    BigInt(i64),
    Float(f64),
    /// Exact decimal text of a `numeric` value.
    Numeric(String),
    Text(String),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
    Json(serde_json::Value),
}

impl Cell {
    /// Integer view used for `COUNT(*)` results.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(value) | Self::BigInt(value) => Some(*value),
            Self::Numeric(text) | Self::Text(text) => text.parse().ok(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawColumn {
    pub name: String,
    /// Wire-level type identifier (a Postgres OID).
    pub type_oid: u32,
}

/// Columns and rows of one statement, rows aligned with `columns`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowSet {
    pub columns: Vec<RawColumn>,
    pub rows: Vec<Vec<Cell>>,
}

impl RowSet {
    /// First cell of the first row, as an integer.
    pub fn scalar_i64(&self) -> Option<i64> {
        self.rows.first()?.first()?.as_i64()
    }
}
