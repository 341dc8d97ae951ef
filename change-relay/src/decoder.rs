//! Strict decoding of change event documents, and the legacy reformatting pass
//! used when strict decoding fails.
//!
//! Documents travel as relaxed Extended JSON. Strict decoding accepts a
//! document only when `bson` can rebuild it as a native BSON document, which
//! is exactly what the history store does on insert.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use bson::Bson;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::error::DecodeError;

pub trait DocumentDecoder: Send + Sync {
    fn decode(&self, text: &str) -> Result<Map<String, Value>, DecodeError>;
}

/// Generic decoder used for every collection without a registered model.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExtendedJsonDecoder;

impl DocumentDecoder for ExtendedJsonDecoder {
    fn decode(&self, text: &str) -> Result<Map<String, Value>, DecodeError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| DecodeError::Syntax(e.to_string()))?;
        let Value::Object(document) = value else {
            return Err(DecodeError::NotADocument(kind_of(&value)));
        };
        match Bson::try_from(Value::Object(document.clone())) {
            Ok(Bson::Document(_)) => Ok(document),
            Ok(other) => Err(DecodeError::Invalid(format!(
                "document decoded as {:?}",
                other.element_type()
            ))),
            Err(e) => Err(DecodeError::Invalid(e.to_string())),
        }
    }
}

/// Decoder for collections with a registered model type. The document must pass
/// the generic checks and deserialize into `T`; the untyped document is returned.
///
/// Update diffs only carry the changed fields, so models should keep their fields optional.
pub struct TypedDecoder<T> {
    model: PhantomData<fn() -> T>,
}

impl<T> TypedDecoder<T> {
    pub fn new() -> Self {
        Self { model: PhantomData }
    }
}

impl<T> Default for TypedDecoder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: DeserializeOwned> DocumentDecoder for TypedDecoder<T> {
    fn decode(&self, text: &str) -> Result<Map<String, Value>, DecodeError> {
        let document = ExtendedJsonDecoder.decode(text)?;
        serde_json::from_value::<T>(Value::Object(document.clone()))
            .map_err(|e| DecodeError::Model(e.to_string()))?;
        Ok(document)
    }
}

/// Collection name to decoder mapping, built once at startup.
/// Lookups are case-insensitive and never fail: unknown collections get the generic decoder.
#[derive(Clone)]
pub struct DecoderRegistry {
    decoders: HashMap<String, Arc<dyn DocumentDecoder>>,
    fallback: Arc<dyn DocumentDecoder>,
}

impl Default for DecoderRegistry {
    fn default() -> Self {
        Self {
            decoders: HashMap::new(),
            fallback: Arc::new(ExtendedJsonDecoder),
        }
    }
}

impl DecoderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, collection: &str, decoder: Arc<dyn DocumentDecoder>) -> Self {
        self.decoders.insert(collection.to_lowercase(), decoder);
        self
    }

    pub fn for_collection(&self, collection: &str) -> Arc<dyn DocumentDecoder> {
        self.decoders
            .get(&collection.to_lowercase())
            .cloned()
            .unwrap_or_else(|| self.fallback.clone())
    }

    pub fn generic(&self) -> Arc<dyn DocumentDecoder> {
        self.fallback.clone()
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "a document",
    }
}

const NUMERIC_WRAPPERS: [&str; 4] = ["$numberLong", "$numberInt", "$numberDouble", "$numberDecimal"];

/// Best-effort rewrite of legacy Extended JSON shapes into canonical ones:
///
/// - `{"$date": 1597043200000}` and `{"$date": "1597043200000"}` become
///   `{"$date": {"$numberLong": "1597043200000"}}`
/// - numeric wrappers holding bare numbers get their value stringified
///
/// Anything else is left untouched, so the result may still fail strict decoding.
pub fn reformat_legacy(text: &str) -> Result<String, DecodeError> {
    let value: Value = serde_json::from_str(text).map_err(|e| DecodeError::Syntax(e.to_string()))?;
    Ok(coerce(value).to_string())
}

fn coerce(value: Value) -> Value {
    match value {
        Value::Array(items) => Value::Array(items.into_iter().map(coerce).collect()),
        Value::Object(document) => coerce_document(document),
        other => other,
    }
}

fn millis_literal(value: &Value) -> Option<String> {
    match value {
        Value::Number(n) => n.as_i64().map(|n| n.to_string()),
        Value::String(s) if s.parse::<i64>().is_ok() => Some(s.clone()),
        _ => None,
    }
}

fn coerce_document(document: Map<String, Value>) -> Value {
    if document.len() == 1 {
        if let Some((key, value)) = document.iter().next() {
            if key == "$date" {
                if let Some(millis) = millis_literal(value) {
                    let mut long = Map::new();
                    long.insert("$numberLong".to_string(), Value::String(millis));
                    let mut date = Map::new();
                    date.insert("$date".to_string(), Value::Object(long));
                    return Value::Object(date);
                }
            }
            if NUMERIC_WRAPPERS.contains(&key.as_str()) {
                if let Value::Number(n) = value {
                    let mut wrapper = Map::new();
                    wrapper.insert(key.clone(), Value::String(n.to_string()));
                    return Value::Object(wrapper);
                }
            }
        }
    }

    Value::Object(
        document
            .into_iter()
            .map(|(key, value)| (key, coerce(value)))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    fn decode(value: Value) -> Result<Map<String, Value>, DecodeError> {
        ExtendedJsonDecoder.decode(&value.to_string())
    }

    #[test]
    fn accepts_relaxed_extended_json() {
        let document = json!({
            "_id": {"$oid": "5f2f6c3e9b1d4c0012345678"},
            "modifiedDateTime": {"$date": "2020-08-10T07:06:40Z"},
            "oldDate": {"$date": {"$numberLong": "-1000"}},
            "account": {"$ref": "accounts", "$id": 4},
            "x": {"$where": "1"},
            "tags": [{"$numberLong": "9007199254740993"}, "plain"],
            "nested": {"depth": 2.5, "ok": true},
        });
        assert_eq!(decode(document.clone()).unwrap(), *document.as_object().unwrap());
    }

    #[test]
    fn rejects_malformed_wrappers() {
        for broken in [
            json!({"d": {"$date": "1597043200000"}}),
            json!({"n": {"$numberLong": 12}}),
            json!({"n": {"$numberLong": "twelve"}}),
            json!({"b": {"$binary": {"base64": "!!!", "subType": "zz"}}}),
            json!({"p": {"$numberDecimal": "abc"}}),
            json!({"t": {"$timestamp": {"t": 99999999999_i64, "i": 1}}}),
        ] {
            assert!(
                matches!(decode(broken.clone()), Err(DecodeError::Invalid(_))),
                "{} should be rejected",
                broken
            );
        }
        assert_eq!(decode(json!([1, 2])), Err(DecodeError::NotADocument("an array")));
        assert!(matches!(
            ExtendedJsonDecoder.decode("{\"a\": "),
            Err(DecodeError::Syntax(_))
        ));
    }

    #[test]
    fn reformat_coerces_legacy_shapes() {
        let legacy = json!({
            "modifiedDateTime": {"$date": "1597043200000"},
            "created": {"$date": 1597043200000_i64},
            "count": {"$numberLong": 12},
            "nested": {"inner": {"$numberInt": 3}},
            "account": {"$ref": "accounts", "$id": 4},
        })
        .to_string();

        let reformatted: Value = serde_json::from_str(&reformat_legacy(&legacy).unwrap()).unwrap();
        assert_eq!(
            reformatted,
            json!({
                "modifiedDateTime": {"$date": {"$numberLong": "1597043200000"}},
                "created": {"$date": {"$numberLong": "1597043200000"}},
                "count": {"$numberLong": "12"},
                "nested": {"inner": {"$numberInt": "3"}},
                "account": {"$ref": "accounts", "$id": 4},
            })
        );
        assert!(decode(reformatted).is_ok());
    }

    #[test]
    fn reformat_leaves_unfixable_shapes() {
        let broken = json!({"d": {"$date": "next tuesday"}}).to_string();
        let reformatted = reformat_legacy(&broken).unwrap();
        assert!(ExtendedJsonDecoder.decode(&reformatted).is_err());
    }

    #[derive(Deserialize)]
    #[allow(dead_code)]
    struct Brand {
        name: Option<String>,
        rank: Option<i64>,
    }

    #[test]
    fn registry_falls_back_to_the_generic_decoder() {
        let registry =
            DecoderRegistry::new().register("Brand", Arc::new(TypedDecoder::<Brand>::new()));

        let typed = registry.for_collection("brand");
        assert!(typed.decode(r#"{"name": "acme"}"#).is_ok());
        assert!(matches!(
            typed.decode(r#"{"rank": "first"}"#),
            Err(DecodeError::Model(_))
        ));

        let generic = registry.for_collection("vendor");
        assert!(generic.decode(r#"{"rank": "first"}"#).is_ok());
    }
}
