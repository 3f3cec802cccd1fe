//! Entity shape descriptors and wire schema derivation.
//!
//! The model-building layer (out of scope here) describes each entity as
//! an ordered field list plus the subset of fields forming the key. That
//! shape is resolved once at registration time through the
//! [`EntityShapeDescriptor`] trait and turned into Avro record schemas:
//! one schema over all fields for the value subject, one over the key
//! fields for the key subject.

use crate::error::{Result, SchemaError};
use bytes::Bytes;
use std::collections::HashMap;

/// Primitive wire type of an entity field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Boolean,
    Int,
    Long,
    Float,
    Double,
    String,
    Bytes,
}

impl FieldKind {
    fn avro_type(&self) -> &'static str {
        match self {
            FieldKind::Boolean => "boolean",
            FieldKind::Int => "int",
            FieldKind::Long => "long",
            FieldKind::Float => "float",
            FieldKind::Double => "double",
            FieldKind::String => "string",
            FieldKind::Bytes => "bytes",
        }
    }
}

/// One field of an entity shape.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldShape {
    pub name: String,
    pub kind: FieldKind,

    /// Optional fields are encoded as a `["null", T]` union.
    pub optional: bool,
}

impl FieldShape {
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            optional: false,
        }
    }

    pub fn optional(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            optional: true,
        }
    }
}

/// Runtime value of an entity field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Null,
    Boolean(bool),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    String(String),
    Bytes(Bytes),
}

/// An entity instance as a field-name to value map.
pub type EntityRecord = HashMap<String, FieldValue>;

/// Shape of an entity type, supplied by the model-building collaborator.
///
/// Resolved once when the entity's serializers are first requested and
/// cached alongside them; never re-derived per message.
pub trait EntityShapeDescriptor: Send + Sync {
    /// Entity name; doubles as the subject base and the Avro record name.
    fn entity_name(&self) -> &str;

    /// Ordered field list. Order is significant: it fixes the Avro record
    /// field order, so concurrent schema derivations produce identical
    /// schema text.
    fn fields(&self) -> &[FieldShape];

    /// Names of the fields forming the message key. Empty means the
    /// entity has no key subject.
    fn key_fields(&self) -> &[String];
}

/// A plain-struct descriptor for callers that build shapes at runtime.
#[derive(Debug, Clone)]
pub struct StaticEntityShape {
    name: String,
    fields: Vec<FieldShape>,
    key_fields: Vec<String>,
}

impl StaticEntityShape {
    /// Build a descriptor, validating that every key field exists in the
    /// field list.
    pub fn new(
        name: impl Into<String>,
        fields: Vec<FieldShape>,
        key_fields: Vec<String>,
    ) -> Result<Self> {
        let name = name.into();
        for key in &key_fields {
            if !fields.iter().any(|f| &f.name == key) {
                return Err(SchemaError::InvalidSchema(format!(
                    "key field '{}' is not a field of entity '{}'",
                    key, name
                )));
            }
        }
        Ok(Self {
            name,
            fields,
            key_fields,
        })
    }
}

impl EntityShapeDescriptor for StaticEntityShape {
    fn entity_name(&self) -> &str {
        &self.name
    }

    fn fields(&self) -> &[FieldShape] {
        &self.fields
    }

    fn key_fields(&self) -> &[String] {
        &self.key_fields
    }
}

fn field_schema_json(field: &FieldShape) -> serde_json::Value {
    let base = serde_json::Value::String(field.kind.avro_type().to_string());
    let field_type = if field.optional {
        serde_json::json!(["null", base])
    } else {
        base
    };
    serde_json::json!({ "name": field.name, "type": field_type })
}

fn record_schema_json(name: &str, fields: &[&FieldShape]) -> String {
    let field_json: Vec<serde_json::Value> =
        fields.iter().map(|f| field_schema_json(f)).collect();
    serde_json::json!({
        "type": "record",
        "name": name,
        "fields": field_json,
    })
    .to_string()
}

/// Derive the Avro schema text for an entity's value subject (all fields).
pub fn derive_value_schema(descriptor: &dyn EntityShapeDescriptor) -> Result<String> {
    let fields = descriptor.fields();
    if fields.is_empty() {
        return Err(SchemaError::InvalidSchema(format!(
            "entity '{}' has no fields",
            descriptor.entity_name()
        )));
    }
    let refs: Vec<&FieldShape> = fields.iter().collect();
    Ok(record_schema_json(descriptor.entity_name(), &refs))
}

/// Derive the Avro schema text for an entity's key subject (key fields
/// only), or `None` if the entity has no key fields.
pub fn derive_key_schema(descriptor: &dyn EntityShapeDescriptor) -> Result<Option<String>> {
    let key_names = descriptor.key_fields();
    if key_names.is_empty() {
        return Ok(None);
    }

    let mut key_fields = Vec::with_capacity(key_names.len());
    for name in key_names {
        let field = descriptor
            .fields()
            .iter()
            .find(|f| &f.name == name)
            .ok_or_else(|| {
                SchemaError::InvalidSchema(format!(
                    "key field '{}' is not a field of entity '{}'",
                    name,
                    descriptor.entity_name()
                ))
            })?;
        key_fields.push(field);
    }

    let record_name = format!("{}Key", descriptor.entity_name());
    Ok(Some(record_schema_json(&record_name, &key_fields)))
}
