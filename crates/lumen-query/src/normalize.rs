//! Decoded rows to caller-facing JSON values.
//!
//! 64-bit integers and `numeric` values become decimal strings so they
//! survive consumers that parse JSON numbers as doubles. Temporal values are
//! rendered as text, optionally in a caller-selected zone.

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Timelike, Utc};
use chrono_tz::Tz;
use lumen_db::{Cell, RowSet};
use serde_json::{Number, Value};
use tracing::debug;

use crate::catalog::SemanticType;
use crate::request::ColumnDescriptor;

const ZONED_DATE: &str = "%Y-%m-%d";
const ZONED_TIMESTAMP: &str = "%Y-%m-%d %H:%M:%S";

/// How temporal columns are rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeRendering {
    /// ISO 8601 as returned by the server; `timestamptz` in UTC. Only used
    /// when a request asks for it.
    Iso,
    /// Fixed `YYYY-MM-DD` / `YYYY-MM-DD HH:MM:SS` in the given zone.
    Zoned(Tz),
}

impl TimeRendering {
    /// Fixed formats in `zone`, or in UTC when the zone is unset or unknown.
    pub fn for_zone(zone: Option<&str>) -> Self {
        let Some(zone) = zone else {
            return Self::Zoned(Tz::UTC);
        };
        match zone.trim().parse::<Tz>() {
            Ok(tz) => Self::Zoned(tz),
            Err(_) => {
                debug!(zone, "unknown time zone, rendering in UTC");
                Self::Zoned(Tz::UTC)
            }
        }
    }
}

pub fn normalize(rowset: RowSet, rendering: TimeRendering) -> (Vec<ColumnDescriptor>, Vec<Vec<Value>>) {
    let columns = rowset
        .columns
        .into_iter()
        .map(|column| ColumnDescriptor {
            name: column.name,
            semantic_type: SemanticType::from_oid(column.type_oid),
        })
        .collect();
    let rows = rowset
        .rows
        .into_iter()
        .map(|row| {
            row.into_iter()
                .map(|cell| normalize_cell(cell, rendering))
                .collect()
        })
        .collect();
    (columns, rows)
}

pub fn normalize_cell(cell: Cell, rendering: TimeRendering) -> Value {
    match cell {
        Cell::Null => Value::Null,
        Cell::Bool(flag) => Value::Bool(flag),
        Cell::Int(value) => Value::from(value),
        Cell::BigInt(value) => Value::String(value.to_string()),
        Cell::Float(value) => match Number::from_f64(value) {
            Some(number) => Value::Number(number),
            None => Value::String(non_finite(value).to_string()),
        },
        Cell::Numeric(text) | Cell::Text(text) => Value::String(text),
        Cell::Json(value) => value,
        Cell::Date(date) => Value::String(render_date(date)),
        Cell::Timestamp(naive) => Value::String(render_timestamp(naive, rendering)),
        Cell::TimestampTz(instant) => Value::String(render_timestamptz(instant, rendering)),
    }
}

fn non_finite(value: f64) -> &'static str {
    if value.is_nan() {
        "NaN"
    } else if value.is_sign_positive() {
        "Infinity"
    } else {
        "-Infinity"
    }
}

// Calendar dates carry no instant, so a zone never shifts them.
fn render_date(date: NaiveDate) -> String {
    date.format(ZONED_DATE).to_string()
}

fn render_timestamp(naive: NaiveDateTime, rendering: TimeRendering) -> String {
    match rendering {
        TimeRendering::Iso if naive.nanosecond() == 0 => naive.format("%Y-%m-%dT%H:%M:%S").to_string(),
        TimeRendering::Iso => naive.format("%Y-%m-%dT%H:%M:%S%.6f").to_string(),
        TimeRendering::Zoned(tz) => naive
            .and_utc()
            .with_timezone(&tz)
            .format(ZONED_TIMESTAMP)
            .to_string(),
    }
}

fn render_timestamptz(instant: DateTime<Utc>, rendering: TimeRendering) -> String {
    match rendering {
        TimeRendering::Iso => instant.to_rfc3339_opts(SecondsFormat::AutoSi, true),
        TimeRendering::Zoned(tz) => instant.with_timezone(&tz).format(ZONED_TIMESTAMP).to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use lumen_db::RawColumn;
    use serde_json::json;

    fn naive(text: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f").expect("timestamp")
    }

    #[test]
    fn large_integers_become_strings() {
        assert_eq!(
            normalize_cell(Cell::BigInt(i64::MAX), TimeRendering::Iso),
            json!("9223372036854775807")
        );
        assert_eq!(normalize_cell(Cell::Int(42), TimeRendering::Iso), json!(42));
        assert_eq!(
            normalize_cell(Cell::Numeric("12345678901234567890.01".into()), TimeRendering::Iso),
            json!("12345678901234567890.01")
        );
    }

    #[test]
    fn floats_pass_through_unless_non_finite() {
        assert_eq!(normalize_cell(Cell::Float(1.5), TimeRendering::Iso), json!(1.5));
        assert_eq!(normalize_cell(Cell::Float(f64::NAN), TimeRendering::Iso), json!("NaN"));
        assert_eq!(
            normalize_cell(Cell::Float(f64::NEG_INFINITY), TimeRendering::Iso),
            json!("-Infinity")
        );
    }

    #[test]
    fn iso_rendering_on_request() {
        let date = NaiveDate::from_ymd_opt(2024, 2, 29).expect("date");
        assert_eq!(normalize_cell(Cell::Date(date), TimeRendering::Iso), json!("2024-02-29"));
        assert_eq!(
            normalize_cell(Cell::Timestamp(naive("2024-02-29 23:15:00")), TimeRendering::Iso),
            json!("2024-02-29T23:15:00")
        );
        assert_eq!(
            normalize_cell(Cell::Timestamp(naive("2024-02-29 23:15:00.25")), TimeRendering::Iso),
            json!("2024-02-29T23:15:00.250000")
        );
        let instant = Utc.with_ymd_and_hms(2024, 2, 29, 23, 15, 0).single().expect("instant");
        assert_eq!(
            normalize_cell(Cell::TimestampTz(instant), TimeRendering::Iso),
            json!("2024-02-29T23:15:00Z")
        );
    }

    #[test]
    fn zoned_rendering_shifts_instants_but_not_dates() {
        let tokyo = TimeRendering::for_zone(Some("Asia/Tokyo"));
        let instant = Utc.with_ymd_and_hms(2024, 2, 29, 23, 15, 0).single().expect("instant");
        assert_eq!(
            normalize_cell(Cell::TimestampTz(instant), tokyo),
            json!("2024-03-01 08:15:00")
        );
        assert_eq!(
            normalize_cell(Cell::Timestamp(naive("2024-02-29 23:15:00")), tokyo),
            json!("2024-03-01 08:15:00")
        );
        let date = NaiveDate::from_ymd_opt(2024, 2, 29).expect("date");
        assert_eq!(normalize_cell(Cell::Date(date), tokyo), json!("2024-02-29"));
    }

    #[test]
    fn unknown_zones_fall_back_to_utc() {
        assert_eq!(TimeRendering::for_zone(Some("Mars/Olympus")), TimeRendering::Zoned(Tz::UTC));
        assert_eq!(TimeRendering::for_zone(None), TimeRendering::Zoned(Tz::UTC));
        let instant = Utc.with_ymd_and_hms(2024, 7, 1, 12, 0, 0).single().expect("instant");
        assert_eq!(
            normalize_cell(Cell::TimestampTz(instant), TimeRendering::for_zone(Some(""))),
            json!("2024-07-01 12:00:00")
        );
    }

    #[test]
    fn unset_zone_renders_fixed_formats_in_utc() {
        let utc = TimeRendering::for_zone(None);
        let instant = Utc.with_ymd_and_hms(2024, 2, 29, 23, 15, 0).single().expect("instant");
        assert_eq!(normalize_cell(Cell::TimestampTz(instant), utc), json!("2024-02-29 23:15:00"));
        assert_eq!(
            normalize_cell(Cell::Timestamp(naive("2024-02-29 23:15:00.25")), utc),
            json!("2024-02-29 23:15:00")
        );
        let date = NaiveDate::from_ymd_opt(2024, 2, 29).expect("date");
        assert_eq!(normalize_cell(Cell::Date(date), utc), json!("2024-02-29"));
    }

    #[test]
    fn rows_stay_aligned_with_columns() {
        let rowset = RowSet {
            columns: vec![
                RawColumn {
                    name: "id".into(),
                    type_oid: 20,
                },
                RawColumn {
                    name: "tags".into(),
                    type_oid: 3802,
                },
            ],
            rows: vec![vec![Cell::BigInt(7), Cell::Json(json!(["a"]))]],
        };
        let (columns, rows) = normalize(rowset, TimeRendering::Iso);
        assert_eq!(columns[0].semantic_type, SemanticType::BigInt);
        assert_eq!(columns[1].semantic_type.name(), "type(3802)");
        assert_eq!(rows, vec![vec![json!("7"), json!(["a"])]]);
    }
}
