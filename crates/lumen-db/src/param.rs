//! Bound parameter encoding.
//!
//! Values are sent in text format with the parameter type left to the server,
//! so `'2024-01-31'` bound against a `date` column is parsed as a date and `7`
//! bound against `numeric` stays exact.

use std::error::Error;

use bytes::BytesMut;
use serde_json::Value;
use tokio_postgres::types::{Format, IsNull, ToSql, Type};

#[derive(Debug)]
pub(crate) struct TextParam<'a>(pub(crate) &'a Value);

impl TextParam<'_> {
    fn render(&self) -> Option<String> {
        match self.0 {
            Value::Null => None,
            Value::String(text) => Some(text.clone()),
            Value::Bool(flag) => Some(flag.to_string()),
            Value::Number(number) => Some(number.to_string()),
            other => Some(other.to_string()),
        }
    }
}

impl ToSql for TextParam<'_> {
    fn to_sql(&self, _ty: &Type, out: &mut BytesMut) -> Result<IsNull, Box<dyn Error + Sync + Send>> {
        match self.render() {
            None => Ok(IsNull::Yes),
            Some(text) => {
                out.extend_from_slice(text.as_bytes());
                Ok(IsNull::No)
            }
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    fn to_sql_checked(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> Result<IsNull, Box<dyn Error + Sync + Send>> {
        self.to_sql(ty, out)
    }

    fn encode_format(&self, _ty: &Type) -> Format {
        Format::Text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn encode(value: &Value) -> Option<String> {
        let mut out = BytesMut::new();
        match TextParam(value).to_sql(&Type::TEXT, &mut out).expect("encode") {
            IsNull::Yes => None,
            IsNull::No => Some(String::from_utf8(out.to_vec()).expect("utf8")),
        }
    }

    #[test]
    fn renders_scalars_as_text() {
        assert_eq!(encode(&json!(null)), None);
        assert_eq!(encode(&json!("O'Brien")).as_deref(), Some("O'Brien"));
        assert_eq!(encode(&json!(true)).as_deref(), Some("true"));
        assert_eq!(encode(&json!(9007199254740993_i64)).as_deref(), Some("9007199254740993"));
        assert_eq!(encode(&json!(1.5)).as_deref(), Some("1.5"));
        assert_eq!(encode(&json!({"a": [1, 2]})).as_deref(), Some(r#"{"a":[1,2]}"#));
    }

    #[test]
    fn always_text_format() {
        let value = json!(1);
        assert!(matches!(TextParam(&value).encode_format(&Type::INT4), Format::Text));
        assert!(<TextParam<'_> as ToSql>::accepts(&Type::DATE));
    }
}
