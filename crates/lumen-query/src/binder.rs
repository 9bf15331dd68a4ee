//! Named-placeholder binding.
//!
//! A [`BoundStatement`] can only be built from SQL that has already passed
//! the guard, and [`bind`] re-validates the substituted text before handing
//! one out, so the executor never sees unvalidated SQL.

use serde_json::{Map, Value};

use crate::guard::{GuardError, ValidatedSql, ValidatedTemplate, assert_safe_select, rewrite_placeholders};
use crate::lexer::tokenize;

/// Template parameters keyed by placeholder name.
pub type Params = Map<String, Value>;

/// Positional SQL plus the values for `$1..$n`, in order.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundStatement {
    sql: ValidatedSql,
    values: Vec<Value>,
}

impl BoundStatement {
    /// A statement with no parameters.
    pub fn from_validated(sql: ValidatedSql) -> Self {
        Self {
            sql,
            values: Vec::new(),
        }
    }

    pub fn sql(&self) -> &ValidatedSql {
        &self.sql
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn used_param_count(&self) -> usize {
        self.values.len()
    }
}

/// Substitutes every placeholder that has a value in `params` with a
/// positional marker, numbered by first occurrence.
///
/// Parameters the template never mentions are dropped. Placeholders with no
/// value are left in place, so the re-validation below rejects them.
pub fn bind(template: &ValidatedTemplate, params: &Params) -> Result<BoundStatement, GuardError> {
    let used: Vec<&str> = template
        .placeholders()
        .iter()
        .map(String::as_str)
        .filter(|name| params.contains_key(*name))
        .collect();

    let text = template.as_str();
    let tokens = tokenize(text)?;
    let rewritten = rewrite_placeholders(text, &tokens, |name| {
        used.iter()
            .position(|candidate| *candidate == name)
            .map(|idx| format!("${}", idx + 1))
    });

    let sql = assert_safe_select(&rewritten)?;
    let values = used
        .iter()
        .filter_map(|name| params.get(*name).cloned())
        .collect();
    Ok(BoundStatement { sql, values })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guard::assert_safe_template;
    use proptest::prelude::*;
    use serde_json::json;

    fn params(value: Value) -> Params {
        match value {
            Value::Object(map) => map,
            other => panic!("expected an object, got {other}"),
        }
    }

    #[test]
    fn drops_unused_params() {
        let template = assert_safe_template("SELECT * FROM t WHERE a = ${x}").expect("template");
        let bound = bind(&template, &params(json!({"x": 1, "y": 2}))).expect("bind");
        assert_eq!(bound.sql().as_str(), "SELECT * FROM t WHERE a = $1");
        assert_eq!(bound.values(), [json!(1)]);
        assert_eq!(bound.used_param_count(), 1);
    }

    #[test]
    fn numbers_by_first_occurrence_and_reuses_markers() {
        let template = assert_safe_template(
            "SELECT * FROM sales WHERE day >= ${from} AND day < ${to} AND (${region} IS NULL OR region = ${region})",
        )
        .expect("template");
        let bound = bind(
            &template,
            &params(json!({"region": "emea", "to": "2024-02-01", "from": "2024-01-01"})),
        )
        .expect("bind");
        assert_eq!(
            bound.sql().as_str(),
            "SELECT * FROM sales WHERE day >= $1 AND day < $2 AND ($3 IS NULL OR region = $3)"
        );
        assert_eq!(
            bound.values(),
            [json!("2024-01-01"), json!("2024-02-01"), json!("emea")]
        );
    }

    #[test]
    fn missing_params_fail_revalidation() {
        let template = assert_safe_template("SELECT * FROM t WHERE a = ${x}").expect("template");
        assert_eq!(
            bind(&template, &Params::new()),
            Err(GuardError::UnboundPlaceholder("x".to_string()))
        );
    }

    #[test]
    fn skips_a_missing_param_without_consuming_a_position() {
        let template =
            assert_safe_template("SELECT * FROM t WHERE a = ${a} AND b = ${b}").expect("template");
        assert_eq!(
            bind(&template, &params(json!({"b": true}))),
            Err(GuardError::UnboundPlaceholder("a".to_string()))
        );
    }

    #[test]
    fn values_never_reach_the_sql_text() {
        let template = assert_safe_template("SELECT * FROM users WHERE name = ${name}").expect("template");
        let hostile = "x'; DROP TABLE users; --";
        let bound = bind(&template, &params(json!({"name": hostile}))).expect("bind");
        assert!(!bound.sql().as_str().contains("DROP"));
        assert_eq!(bound.values(), [json!(hostile)]);
    }

    #[test]
    fn templates_without_placeholders_bind_to_no_values() {
        let template = assert_safe_template("SELECT 1").expect("template");
        let bound = bind(&template, &params(json!({"unused": 1}))).expect("bind");
        assert_eq!(bound.used_param_count(), 0);
    }

    proptest! {
        #[test]
        fn value_count_matches_used_placeholders(
            referenced in prop::collection::btree_set("[a-z]{1,6}", 1..5),
            supplied in prop::collection::btree_map("[a-z]{1,6}", any::<i64>(), 0..8),
        ) {
            let conditions: Vec<String> = referenced
                .iter()
                .map(|name| format!("col_{name} = ${{{name}}}"))
                .collect();
            let sql = format!("SELECT * FROM t WHERE {}", conditions.join(" AND "));
            let template = assert_safe_template(&sql).expect("template");
            let params: Params = supplied
                .iter()
                .map(|(name, value)| (name.clone(), json!(value)))
                .collect();

            match bind(&template, &params) {
                Ok(bound) => {
                    prop_assert!(referenced.iter().all(|name| params.contains_key(name)));
                    prop_assert_eq!(bound.used_param_count(), referenced.len());
                    prop_assert!(bound.used_param_count() <= params.len());
                }
                Err(err) => {
                    prop_assert!(matches!(err, GuardError::UnboundPlaceholder(_)));
                    prop_assert!(referenced.iter().any(|name| !params.contains_key(name)));
                }
            }
        }
    }
}
