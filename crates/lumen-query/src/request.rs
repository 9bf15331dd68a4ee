//! Caller-facing request and result shapes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::binder::Params;
use crate::catalog::SemanticType;

/// The statement a caller wants to run.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SqlSource {
    /// Raw SQL with no placeholders.
    Sql(String),
    /// SQL with `${name}` placeholders filled from `params`.
    Template(String),
}

impl SqlSource {
    pub fn text(&self) -> &str {
        match self {
            Self::Sql(text) | Self::Template(text) => text,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageRequest {
    pub page: i64,
    pub page_size: i64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequest {
    #[serde(flatten)]
    pub source: SqlSource,
    #[serde(default)]
    pub params: Params,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub max_rows: Option<usize>,
    #[serde(default)]
    pub pagination: Option<PageRequest>,
    /// IANA zone temporal columns are rendered in. UTC when unset.
    #[serde(default)]
    pub time_zone: Option<String>,
    /// Render temporal columns as ISO 8601 instead of the fixed zoned
    /// formats. `time_zone` is ignored when set.
    #[serde(default)]
    pub iso_temporal: bool,
}

impl QueryRequest {
    pub fn sql(sql: impl Into<String>) -> Self {
        Self::new(SqlSource::Sql(sql.into()))
    }

    pub fn template(template: impl Into<String>) -> Self {
        Self::new(SqlSource::Template(template.into()))
    }

    fn new(source: SqlSource) -> Self {
        Self {
            source,
            params: Params::new(),
            timeout_ms: None,
            max_rows: None,
            pagination: None,
            time_zone: None,
            iso_temporal: false,
        }
    }

    pub fn param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    pub fn paginate(mut self, page: i64, page_size: i64) -> Self {
        self.pagination = Some(PageRequest { page, page_size });
        self
    }

    pub fn max_rows(mut self, max_rows: usize) -> Self {
        self.max_rows = Some(max_rows);
        self
    }

    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn time_zone(mut self, zone: impl Into<String>) -> Self {
        self.time_zone = Some(zone.into());
        self
    }

    pub fn iso_temporal(mut self) -> Self {
        self.iso_temporal = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnDescriptor {
    pub name: String,
    pub semantic_type: SemanticType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PageInfo {
    pub page: u64,
    pub page_size: u64,
    pub total: u64,
    pub total_pages: u64,
}

impl PageInfo {
    pub(crate) fn new(page: u64, page_size: u64, total: u64) -> Self {
        let total_pages = if page_size == 0 {
            0
        } else {
            total.div_ceil(page_size)
        };
        Self {
            page,
            page_size,
            total,
            total_pages,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    pub columns: Vec<ColumnDescriptor>,
    /// Each row is aligned with `columns`.
    pub rows: Vec<Vec<Value>>,
    pub row_count: usize,
    pub elapsed_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pagination: Option<PageInfo>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn deserializes_template_requests() {
        let request: QueryRequest = serde_json::from_value(json!({
            "template": "SELECT * FROM t WHERE a = ${a}",
            "params": {"a": 1},
            "pagination": {"page": 2, "pageSize": 50},
            "timeZone": "Europe/Berlin"
        }))
        .expect("request");
        assert_eq!(
            request,
            QueryRequest::template("SELECT * FROM t WHERE a = ${a}")
                .param("a", 1)
                .paginate(2, 50)
                .time_zone("Europe/Berlin")
        );
    }

    #[test]
    fn deserializes_raw_requests() {
        let request: QueryRequest =
            serde_json::from_value(json!({"sql": "SELECT 1", "maxRows": 10, "timeoutMs": 500}))
                .expect("request");
        assert_eq!(request.source, SqlSource::Sql("SELECT 1".to_string()));
        assert_eq!(request.max_rows, Some(10));
        assert_eq!(request.timeout_ms, Some(500));
        assert!(!request.iso_temporal);

        let request: QueryRequest =
            serde_json::from_value(json!({"sql": "SELECT now()", "isoTemporal": true}))
                .expect("request");
        assert_eq!(request, QueryRequest::sql("SELECT now()").iso_temporal());
    }

    #[test]
    fn total_pages_rounds_up() {
        assert_eq!(PageInfo::new(1, 2, 5).total_pages, 3);
        assert_eq!(PageInfo::new(1, 25, 0).total_pages, 0);
        assert_eq!(PageInfo::new(1, 0, 7).total_pages, 0);
    }

    #[test]
    fn results_serialize_camel_case() {
        let result = QueryResult {
            columns: vec![ColumnDescriptor {
                name: "id".to_string(),
                semantic_type: SemanticType::BigInt,
            }],
            rows: vec![vec![json!("9223372036854775807")]],
            row_count: 1,
            elapsed_ms: 3,
            pagination: Some(PageInfo::new(1, 10, 1)),
        };
        assert_eq!(
            serde_json::to_value(&result).expect("serialize"),
            json!({
                "columns": [{"name": "id", "semanticType": "bigint"}],
                "rows": [["9223372036854775807"]],
                "rowCount": 1,
                "elapsedMs": 3,
                "pagination": {"page": 1, "pageSize": 10, "total": 1, "totalPages": 1}
            })
        );
    }
}
