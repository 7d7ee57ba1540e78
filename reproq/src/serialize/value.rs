//! Tagged-sum representation of enqueue-spec arguments (§4.1, §9).
//!
//! Producer payloads are plain JSON on the wire, but three shapes need to
//! round-trip losslessly through that JSON: decimals, durations, and
//! references to external entities. Each is wrapped in an object carrying a
//! reserved `__type__` key; producer payloads must not use that key
//! themselves. [`Value`] is the in-memory form; [`Value::from_json`] and
//! [`Value::to_json`] convert to and from the plain `serde_json::Value`
//! that actually gets canonicalized and fingerprinted.

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use std::str::FromStr;

use crate::error::ReproqError;

/// Reserved key marking a tagged wrapper. Producer payloads colliding with
/// this key at the top level of a mapping are rejected by the caller before
/// they ever reach [`Value::from_json`] (see `producer::reserved_key_check`).
pub const TYPE_TAG_KEY: &str = "__type__";

const KIND_DURATION: &str = "duration";
const KIND_DECIMAL: &str = "decimal";
const KIND_ENTITY_REF: &str = "entity_ref";

/// A fully general JSON value, plus the three recognized tagged shapes.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Sequence(Vec<Value>),
    Mapping(BTreeMap<String, Value>),
    /// `{duration, decimal, entity_ref}` — any other kind fails to parse.
    Tagged { kind: String, fields: BTreeMap<String, Value> },
}

impl Value {
    pub fn duration(days: i64, seconds: i64, microseconds: i64) -> Self {
        let mut fields = BTreeMap::new();
        fields.insert("days".to_string(), Value::Int(days));
        fields.insert("seconds".to_string(), Value::Int(seconds));
        fields.insert("microseconds".to_string(), Value::Int(microseconds));
        Value::Tagged { kind: KIND_DURATION.to_string(), fields }
    }

    pub fn decimal(value: Decimal) -> Self {
        let mut fields = BTreeMap::new();
        fields.insert("value".to_string(), Value::String(value.to_string()));
        Value::Tagged { kind: KIND_DECIMAL.to_string(), fields }
    }

    pub fn entity_ref(entity_class: impl Into<String>, pk: impl Into<String>) -> Self {
        let mut fields = BTreeMap::new();
        fields.insert("entity_class".to_string(), Value::String(entity_class.into()));
        fields.insert("pk".to_string(), Value::String(pk.into()));
        Value::Tagged { kind: KIND_ENTITY_REF.to_string(), fields }
    }

    pub fn as_decimal(&self) -> Option<Decimal> {
        match self {
            Value::Tagged { kind, fields } if kind == KIND_DECIMAL => match fields.get("value") {
                Some(Value::String(s)) => Decimal::from_str(s).ok(),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn as_entity_ref(&self) -> Option<(&str, &str)> {
        match self {
            Value::Tagged { kind, fields } if kind == KIND_ENTITY_REF => {
                match (fields.get("entity_class"), fields.get("pk")) {
                    (Some(Value::String(class)), Some(Value::String(pk))) => {
                        Some((class.as_str(), pk.as_str()))
                    }
                    _ => None,
                }
            }
            _ => None,
        }
    }

    /// Parse a plain JSON value into [`Value`], recognizing tagged
    /// wrappers. An object carrying `__type__` with an unrecognized kind
    /// fails with [`ReproqError::DeserializationFailed`].
    pub fn from_json(json: &serde_json::Value) -> Result<Self, ReproqError> {
        match json {
            serde_json::Value::Null => Ok(Value::Null),
            serde_json::Value::Bool(b) => Ok(Value::Bool(*b)),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(Value::Int(i))
                } else if let Some(f) = n.as_f64() {
                    Ok(Value::Float(f))
                } else {
                    Err(ReproqError::DeserializationFailed(format!(
                        "number out of range: {n}"
                    )))
                }
            }
            serde_json::Value::String(s) => Ok(Value::String(s.clone())),
            serde_json::Value::Array(items) => {
                let values = items
                    .iter()
                    .map(Value::from_json)
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Value::Sequence(values))
            }
            serde_json::Value::Object(map) => {
                if let Some(kind) = map.get(TYPE_TAG_KEY).and_then(|v| v.as_str()) {
                    if !matches!(kind, KIND_DURATION | KIND_DECIMAL | KIND_ENTITY_REF) {
                        return Err(ReproqError::DeserializationFailed(format!(
                            "unknown tagged kind: {kind}"
                        )));
                    }
                    let mut fields = BTreeMap::new();
                    for (key, value) in map {
                        if key == TYPE_TAG_KEY {
                            continue;
                        }
                        fields.insert(key.clone(), Value::from_json(value)?);
                    }
                    Ok(Value::Tagged { kind: kind.to_string(), fields })
                } else {
                    let mut mapping = BTreeMap::new();
                    for (key, value) in map {
                        mapping.insert(key.clone(), Value::from_json(value)?);
                    }
                    Ok(Value::Mapping(mapping))
                }
            }
        }
    }

    /// Lower back to plain JSON, re-inserting the `__type__` marker for
    /// tagged variants.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::Number((*i).into()),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Sequence(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Mapping(map) => {
                let object = map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect();
                serde_json::Value::Object(object)
            }
            Value::Tagged { kind, fields } => {
                let mut object = serde_json::Map::new();
                object.insert(TYPE_TAG_KEY.to_string(), serde_json::Value::String(kind.clone()));
                for (k, v) in fields {
                    object.insert(k.clone(), v.to_json());
                }
                serde_json::Value::Object(object)
            }
        }
    }
}
