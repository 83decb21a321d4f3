//! Payload deserializer: Avro -> VOEvent-JSON -> generic-JSON -> VOEvent-XML.
//!
//! Each trial that fails with a "wrong format" indicator falls through to
//! the next; a structural error inside a matched format propagates
//! immediately rather than being swallowed and retried as a different
//! format.

use serde_json::Value as JsonValue;

use super::voevent::{self, VoEventDoc};

#[derive(Debug, thiserror::Error)]
pub enum DeserializeError {
    #[error("malformed XML: {0}")]
    Xml(String),
    #[error("duplicate param {name:?} in scope {scope:?}")]
    DuplicateParam { scope: String, name: String },
    #[error("no known format (Avro, JSON or XML) matched the payload")]
    InvalidPayload,
}

/// The deserialized shape of an ingested payload, before variant
/// classification. Avro and VOEvent-JSON both normalize into a
/// [`VoEventDoc`]; a payload that is valid JSON but not VOEvent-shaped is
/// kept as a raw [`JsonValue`] for the classifier to pick apart itself (this
/// is how the newer Kafka GW notice format, which is not VOEvent-shaped,
/// reaches the classifier).
#[derive(Debug, Clone)]
pub enum DeserializedPayload {
    VoEvent(VoEventDoc),
    Json(JsonValue),
}

/// Try Avro, then VOEvent-JSON, then generic JSON, then VOEvent-XML.
pub fn deserialize(raw: &[u8]) -> Result<DeserializedPayload, DeserializeError> {
    if let Some(doc) = try_avro(raw)? {
        return Ok(DeserializedPayload::VoEvent(doc));
    }
    if let Some(value) = try_json(raw)? {
        if looks_like_voevent(&value) {
            let doc = voevent::parse_voevent_json(&value)?;
            return Ok(DeserializedPayload::VoEvent(doc));
        }
        return Ok(DeserializedPayload::Json(value));
    }
    if looks_like_xml(raw) {
        let doc = voevent::parse_xml(raw)?;
        return Ok(DeserializedPayload::VoEvent(doc));
    }
    Err(DeserializeError::InvalidPayload)
}

/// Returns `Ok(Some(_))` when the bytes are valid Avro containing a
/// VOEvent-shaped record, `Ok(None)` when the bytes are simply not Avro
/// ("wrong format", fall through), and `Err` for a structural error once the
/// Avro container itself has been recognized (a genuinely corrupt Avro
/// container should not silently fall through to JSON/XML).
fn try_avro(raw: &[u8]) -> Result<Option<VoEventDoc>, DeserializeError> {
    // Avro Object Container Files always begin with the 4-byte magic
    // `Obj\x01`; anything else is simply not Avro, so we fall through
    // instead of invoking the (comparatively expensive) reader.
    if raw.len() < 4 || &raw[0..4] != b"Obj\x01" {
        return Ok(None);
    }
    let reader = apache_avro::Reader::new(raw)
        .map_err(|e| DeserializeError::Xml(format!("corrupt avro container: {e}")))?;
    for value in reader {
        let value = value.map_err(|e| DeserializeError::Xml(format!("corrupt avro record: {e}")))?;
        let json = avro_value_to_json(&value);
        if looks_like_voevent(&json) {
            return Ok(Some(voevent::parse_voevent_json(&json)?));
        }
        return Ok(Some(VoEventDoc {
            ivorn: json.get("ivorn").and_then(JsonValue::as_str).map(String::from),
            role: json.get("role").and_then(JsonValue::as_str).map(String::from),
            ..VoEventDoc::default()
        }));
    }
    Ok(None)
}

fn avro_value_to_json(value: &apache_avro::types::Value) -> JsonValue {
    use apache_avro::types::Value as AvroValue;
    match value {
        AvroValue::Null => JsonValue::Null,
        AvroValue::Boolean(b) => JsonValue::Bool(*b),
        AvroValue::Int(i) => JsonValue::from(*i),
        AvroValue::Long(i) => JsonValue::from(*i),
        AvroValue::Float(f) => serde_json::Number::from_f64(f64::from(*f))
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null),
        AvroValue::Double(f) => serde_json::Number::from_f64(*f)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null),
        AvroValue::String(s) | AvroValue::Enum(_, s) => JsonValue::String(s.clone()),
        AvroValue::Bytes(b) => JsonValue::String(String::from_utf8_lossy(b).to_string()),
        AvroValue::Array(items) => JsonValue::Array(items.iter().map(avro_value_to_json).collect()),
        AvroValue::Map(map) => {
            let mut obj = serde_json::Map::new();
            for (k, v) in map {
                obj.insert(k.clone(), avro_value_to_json(v));
            }
            JsonValue::Object(obj)
        }
        AvroValue::Record(fields) => {
            let mut obj = serde_json::Map::new();
            for (k, v) in fields {
                obj.insert(k.clone(), avro_value_to_json(v));
            }
            JsonValue::Object(obj)
        }
        AvroValue::Union(_, inner) => avro_value_to_json(inner),
        other => JsonValue::String(format!("{other:?}")),
    }
}

fn try_json(raw: &[u8]) -> Result<Option<JsonValue>, DeserializeError> {
    let trimmed = {
        let mut i = 0;
        while i < raw.len() && raw[i].is_ascii_whitespace() {
            i += 1;
        }
        &raw[i..]
    };
    if trimmed.first() != Some(&b'{') && trimmed.first() != Some(&b'[') {
        return Ok(None);
    }
    match serde_json::from_slice(raw) {
        Ok(value) => Ok(Some(value)),
        Err(_) => Ok(None),
    }
}

fn looks_like_voevent(value: &JsonValue) -> bool {
    value.get("What").is_some() || value.get("ivorn").is_some()
}

fn looks_like_xml(raw: &[u8]) -> bool {
    let trimmed = {
        let mut i = 0;
        while i < raw.len() && raw[i].is_ascii_whitespace() {
            i += 1;
        }
        &raw[i..]
    };
    trimmed.starts_with(b"<?xml") || trimmed.starts_with(b"<")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unrecognized_payload() {
        let err = deserialize(b"not a known format").unwrap_err();
        assert!(matches!(err, DeserializeError::InvalidPayload));
    }

    #[test]
    fn parses_generic_json_without_what_block() {
        let raw = br#"{"superevent_id": "S230518h", "alert_type": "PRELIMINARY"}"#;
        let result = deserialize(raw).expect("parse");
        assert!(matches!(result, DeserializedPayload::Json(_)));
    }

    #[test]
    fn parses_voevent_shaped_json() {
        let raw = br#"{"ivorn": "ivo://test/x#1", "role": "observation", "What": {"Param": []}}"#;
        let result = deserialize(raw).expect("parse");
        match result {
            DeserializedPayload::VoEvent(doc) => {
                assert_eq!(doc.ivorn.as_deref(), Some("ivo://test/x#1"));
            }
            DeserializedPayload::Json(_) => panic!("expected VoEvent variant"),
        }
    }

    #[test]
    fn falls_through_to_xml() {
        let raw = br#"<?xml version="1.0"?><voe:VOEvent xmlns:voe="x" ivorn="ivo://test/y#1" role="test"><What/></voe:VOEvent>"#;
        let result = deserialize(raw).expect("parse");
        match result {
            DeserializedPayload::VoEvent(doc) => {
                assert_eq!(doc.ivorn.as_deref(), Some("ivo://test/y#1"));
            }
            DeserializedPayload::Json(_) => panic!("expected VoEvent variant"),
        }
    }
}
