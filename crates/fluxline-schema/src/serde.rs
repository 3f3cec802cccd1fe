//! Schema-aware wire serialization.
//!
//! Messages are framed Confluent-style so consumers can recover the schema
//! id without out-of-band coordination:
//!
//! ```text
//! [magic_byte(1) = 0x00][schema_id(4, big-endian)][avro datum(N)]
//! ```
//!
//! [`EntitySerializer`] and [`EntityDeserializer`] bind a parsed Avro
//! schema and its registry id to an entity shape; both are built once per
//! `(entity, role)` by the cache and shared behind `Arc`.

use crate::error::{Result, SchemaError};
use crate::shape::{EntityRecord, FieldKind, FieldShape, FieldValue};
use apache_avro::types::Value as AvroValue;
use apache_avro::Schema as AvroSchema;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::warn;

/// Magic byte marking a framed payload.
const MAGIC_BYTE: u8 = 0x00;

/// Frame an encoded datum with its schema id.
pub fn encode_framed(schema_id: i32, datum: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(1 + 4 + datum.len());
    buf.put_u8(MAGIC_BYTE);
    buf.put_i32(schema_id); // big-endian
    buf.put_slice(datum);
    buf.freeze()
}

/// Split a framed payload into its schema id and datum bytes.
pub fn decode_framed(data: &[u8]) -> Result<(i32, &[u8])> {
    if data.len() < 5 {
        return Err(SchemaError::Deserialization(
            "payload too short to contain schema id".to_string(),
        ));
    }

    if data[0] != MAGIC_BYTE {
        return Err(SchemaError::Deserialization(format!(
            "invalid magic byte: expected 0x00, got 0x{:02x}",
            data[0]
        )));
    }

    let mut id_bytes = &data[1..5];
    let schema_id = id_bytes.get_i32();

    Ok((schema_id, &data[5..]))
}

fn field_to_avro(field: &FieldShape, value: &FieldValue) -> Result<AvroValue> {
    let plain = match (field.kind, value) {
        (FieldKind::Boolean, FieldValue::Boolean(v)) => AvroValue::Boolean(*v),
        (FieldKind::Int, FieldValue::Int(v)) => AvroValue::Int(*v),
        (FieldKind::Long, FieldValue::Long(v)) => AvroValue::Long(*v),
        (FieldKind::Float, FieldValue::Float(v)) => AvroValue::Float(*v),
        (FieldKind::Double, FieldValue::Double(v)) => AvroValue::Double(*v),
        (FieldKind::String, FieldValue::String(v)) => AvroValue::String(v.clone()),
        (FieldKind::Bytes, FieldValue::Bytes(v)) => AvroValue::Bytes(v.to_vec()),
        (_, FieldValue::Null) => {
            if field.optional {
                return Ok(AvroValue::Union(0, Box::new(AvroValue::Null)));
            }
            return Err(SchemaError::Serialization(format!(
                "field '{}' is required but was null",
                field.name
            )));
        }
        (kind, other) => {
            return Err(SchemaError::Serialization(format!(
                "field '{}' expects {:?}, got {:?}",
                field.name, kind, other
            )));
        }
    };

    if field.optional {
        Ok(AvroValue::Union(1, Box::new(plain)))
    } else {
        Ok(plain)
    }
}

fn avro_to_field(name: &str, value: AvroValue) -> Result<FieldValue> {
    match value {
        AvroValue::Union(_, inner) => avro_to_field(name, *inner),
        AvroValue::Null => Ok(FieldValue::Null),
        AvroValue::Boolean(v) => Ok(FieldValue::Boolean(v)),
        AvroValue::Int(v) => Ok(FieldValue::Int(v)),
        AvroValue::Long(v) => Ok(FieldValue::Long(v)),
        AvroValue::Float(v) => Ok(FieldValue::Float(v)),
        AvroValue::Double(v) => Ok(FieldValue::Double(v)),
        AvroValue::String(v) => Ok(FieldValue::String(v)),
        AvroValue::Bytes(v) => Ok(FieldValue::Bytes(Bytes::from(v))),
        other => Err(SchemaError::Deserialization(format!(
            "field '{}' has unsupported Avro value {:?}",
            name, other
        ))),
    }
}

/// Serializer for one entity subject, bound to a registered schema id.
pub struct EntitySerializer {
    schema: AvroSchema,
    schema_id: i32,
    fields: Vec<FieldShape>,
}

impl EntitySerializer {
    pub fn new(schema_text: &str, schema_id: i32, fields: Vec<FieldShape>) -> Result<Self> {
        let schema = AvroSchema::parse_str(schema_text)
            .map_err(|e| SchemaError::InvalidSchema(e.to_string()))?;
        Ok(Self {
            schema,
            schema_id,
            fields,
        })
    }

    pub fn schema_id(&self) -> i32 {
        self.schema_id
    }

    /// Encode an entity record to framed wire bytes.
    ///
    /// Fields are emitted in shape order. Required fields missing from the
    /// record are an error; optional missing fields encode as null.
    pub fn serialize(&self, record: &EntityRecord) -> Result<Bytes> {
        let mut avro_fields = Vec::with_capacity(self.fields.len());
        for field in &self.fields {
            let value = record.get(&field.name).unwrap_or(&FieldValue::Null);
            avro_fields.push((field.name.clone(), field_to_avro(field, value)?));
        }

        let datum = apache_avro::to_avro_datum(&self.schema, AvroValue::Record(avro_fields))
            .map_err(|e| SchemaError::Serialization(e.to_string()))?;

        Ok(encode_framed(self.schema_id, &datum))
    }
}

/// Deserializer for one entity subject.
pub struct EntityDeserializer {
    schema: AvroSchema,
    schema_id: i32,
}

impl EntityDeserializer {
    pub fn new(schema_text: &str, schema_id: i32) -> Result<Self> {
        let schema = AvroSchema::parse_str(schema_text)
            .map_err(|e| SchemaError::InvalidSchema(e.to_string()))?;
        Ok(Self { schema, schema_id })
    }

    pub fn schema_id(&self) -> i32 {
        self.schema_id
    }

    /// Decode framed wire bytes back into an entity record.
    pub fn deserialize(&self, data: &[u8]) -> Result<EntityRecord> {
        let (schema_id, datum) = decode_framed(data)?;
        if schema_id != self.schema_id {
            // Decoding proceeds with the cached reader schema; a registry
            // change shows up here before anything breaks.
            warn!(
                payload_schema_id = schema_id,
                cached_schema_id = self.schema_id,
                "Payload schema id differs from cached schema id"
            );
        }

        let value = apache_avro::from_avro_datum(&self.schema, &mut &datum[..], None)
            .map_err(|e| SchemaError::Deserialization(e.to_string()))?;

        let fields = match value {
            AvroValue::Record(fields) => fields,
            other => {
                return Err(SchemaError::Deserialization(format!(
                    "expected Avro record, got {:?}",
                    other
                )));
            }
        };

        let mut record = EntityRecord::with_capacity(fields.len());
        for (name, value) in fields {
            let converted = avro_to_field(&name, value)?;
            record.insert(name, converted);
        }
        Ok(record)
    }
}
