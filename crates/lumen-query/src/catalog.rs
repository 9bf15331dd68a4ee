//! Wire type identifiers to stable column type names.

use std::borrow::Cow;
use std::fmt;

use serde::{Serialize, Serializer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SemanticType {
    Boolean,
    SmallInt,
    Integer,
    BigInt,
    Real,
    DoublePrecision,
    Numeric,
    Text,
    Varchar,
    Date,
    Timestamp,
    TimestampTz,
    Uuid,
    /// Anything outside the vocabulary, keyed by its raw identifier.
    Other(u32),
}

impl SemanticType {
    pub fn from_oid(oid: u32) -> Self {
        match oid {
            16 => Self::Boolean,
            21 => Self::SmallInt,
            23 => Self::Integer,
            20 => Self::BigInt,
            700 => Self::Real,
            701 => Self::DoublePrecision,
            1700 => Self::Numeric,
            25 => Self::Text,
            1043 => Self::Varchar,
            1082 => Self::Date,
            1114 => Self::Timestamp,
            1184 => Self::TimestampTz,
            2950 => Self::Uuid,
            other => Self::Other(other),
        }
    }

    pub fn name(&self) -> Cow<'static, str> {
        let name = match self {
            Self::Boolean => "boolean",
            Self::SmallInt => "smallint",
            Self::Integer => "integer",
            Self::BigInt => "bigint",
            Self::Real => "real",
            Self::DoublePrecision => "double precision",
            Self::Numeric => "numeric",
            Self::Text => "text",
            Self::Varchar => "varchar",
            Self::Date => "date",
            Self::Timestamp => "timestamp",
            Self::TimestampTz => "timestamptz",
            Self::Uuid => "uuid",
            Self::Other(oid) => return Cow::Owned(format!("type({oid})")),
        };
        Cow::Borrowed(name)
    }
}

impl fmt::Display for SemanticType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

impl Serialize for SemanticType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_types_have_stable_names() {
        let names: Vec<_> = [16, 21, 23, 20, 700, 701, 1700, 25, 1043, 1082, 1114, 1184, 2950]
            .into_iter()
            .map(|oid| SemanticType::from_oid(oid).to_string())
            .collect();
        assert_eq!(
            names,
            [
                "boolean",
                "smallint",
                "integer",
                "bigint",
                "real",
                "double precision",
                "numeric",
                "text",
                "varchar",
                "date",
                "timestamp",
                "timestamptz",
                "uuid"
            ]
        );
    }

    #[test]
    fn unknown_types_fall_back_to_identifier() {
        assert_eq!(SemanticType::from_oid(3802).name(), "type(3802)");
        assert_eq!(
            serde_json::to_value(SemanticType::from_oid(114)).expect("serialize"),
            serde_json::json!("type(114)")
        );
    }
}
