//! Core schema types: formats, roles, subjects, and registered schemas.

use serde::{Deserialize, Serialize};

/// Schema format supported by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SchemaFormat {
    Avro,
    Protobuf,
    Json,
}

impl SchemaFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchemaFormat::Avro => "AVRO",
            SchemaFormat::Protobuf => "PROTOBUF",
            SchemaFormat::Json => "JSON",
        }
    }
}

/// Whether a schema describes the message key or the message value.
///
/// Key and value subjects are registered independently; a cache entry
/// exists per `(entity, role)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaRole {
    Key,
    Value,
}

impl SchemaRole {
    fn suffix(&self) -> &'static str {
        match self {
            SchemaRole::Key => "key",
            SchemaRole::Value => "value",
        }
    }
}

/// Build the registry subject name for an entity and role.
///
/// Follows the `<name>-key` / `<name>-value` convention, so the same
/// entity has two independent subjects.
///
/// # Examples
///
/// ```
/// use fluxline_schema::types::{subject_for, SchemaRole};
///
/// assert_eq!(subject_for("orders", SchemaRole::Value), "orders-value");
/// assert_eq!(subject_for("orders", SchemaRole::Key), "orders-key");
/// ```
pub fn subject_for(entity: &str, role: SchemaRole) -> String {
    format!("{}-{}", entity, role.suffix())
}

/// A schema as stored by the registry: id, subject, version, and text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisteredSchema {
    /// Registry-assigned schema id, embedded in every wire payload.
    pub id: i32,

    /// Subject the schema was registered under.
    pub subject: String,

    /// Version within the subject (starts at 1).
    pub version: i32,

    /// Schema definition text (JSON for Avro).
    pub schema: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_format_as_str() {
        assert_eq!(SchemaFormat::Avro.as_str(), "AVRO");
        assert_eq!(SchemaFormat::Protobuf.as_str(), "PROTOBUF");
        assert_eq!(SchemaFormat::Json.as_str(), "JSON");
    }

    #[test]
    fn test_subject_for_roles() {
        assert_eq!(subject_for("orders", SchemaRole::Key), "orders-key");
        assert_eq!(subject_for("orders", SchemaRole::Value), "orders-value");
    }

    #[test]
    fn test_role_equality_and_hash() {
        use std::collections::HashSet;
        let mut set = HashSet::new();
        set.insert(SchemaRole::Key);
        set.insert(SchemaRole::Value);
        set.insert(SchemaRole::Key);
        assert_eq!(set.len(), 2);
    }
}
