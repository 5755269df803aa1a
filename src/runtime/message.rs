//! Structured clone wire format shared by every message channel.
//!
//! Values cross a context boundary as JSON text of the form
//! `{"data": <value>, "transfer": [[bytes..], ..]}`. Plain JSON values pass through
//! unchanged; everything JSON cannot express is wrapped in an object tagged with the
//! `$spindle` key. The JavaScript half of the codec lives in `js/prelude.js` and
//! must stay in step with [`encode_value`] and [`decode_value`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value, json};
use thiserror::Error;

/// Key marking a tagged value
pub const TAG: &str = "$spindle";

/// Errors from encoding or decoding a message
#[derive(Error, Debug)]
pub enum MessageError {
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("unknown value tag `{0}`")]
    UnknownTag(String),

    #[error("invalid `{tag}` value: {reason}")]
    InvalidTagged { tag: String, reason: String },
}

/// A value that can cross a context boundary
#[derive(Debug, Clone, PartialEq)]
pub enum StructuredValue {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    /// Decimal digits of a `BigInt`
    BigInt(String),
    String(String),
    Array(Vec<StructuredValue>),
    Object(Vec<(String, StructuredValue)>),
    /// Milliseconds since the epoch
    Date(f64),
    RegExp { source: String, flags: String },
    Map(Vec<(StructuredValue, StructuredValue)>),
    Set(Vec<StructuredValue>),
    /// An `ArrayBuffer` (kind `"ArrayBuffer"`) or a view such as `"Uint8Array"`
    Bytes { kind: String, data: Vec<u8> },
    /// Index into the transfer list of the enclosing message
    Transferred(usize),
    Error {
        name: String,
        message: String,
        stack: Option<String>,
    },
}

impl StructuredValue {
    pub fn is_error(&self) -> bool {
        matches!(self, StructuredValue::Error { .. })
    }

    /// Look up a property of an object value
    pub fn get(&self, key: &str) -> Option<&StructuredValue> {
        match self {
            StructuredValue::Object(entries) => {
                entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
            }
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            StructuredValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            StructuredValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Human readable summary used for error event messages
    pub fn describe(&self) -> String {
        match self {
            StructuredValue::Error { name, message, .. } if message.is_empty() => name.clone(),
            StructuredValue::Error { name, message, .. } => format!("{name}: {message}"),
            StructuredValue::String(s) => s.clone(),
            StructuredValue::Undefined => "undefined".to_string(),
            other => encode_value(other).to_string(),
        }
    }
}

impl From<Value> for StructuredValue {
    /// Plain JSON is always a valid structured value
    fn from(value: Value) -> Self {
        match value {
            Value::Null => StructuredValue::Null,
            Value::Bool(b) => StructuredValue::Bool(b),
            Value::Number(n) => StructuredValue::Number(n.as_f64().unwrap_or(f64::NAN)),
            Value::String(s) => StructuredValue::String(s),
            Value::Array(items) => {
                StructuredValue::Array(items.into_iter().map(StructuredValue::from).collect())
            }
            Value::Object(map) => StructuredValue::Object(
                map.into_iter()
                    .map(|(k, v)| (k, StructuredValue::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<&str> for StructuredValue {
    fn from(value: &str) -> Self {
        StructuredValue::String(value.to_string())
    }
}

impl From<f64> for StructuredValue {
    fn from(value: f64) -> Self {
        StructuredValue::Number(value)
    }
}

fn tagged(tag: &str, fields: Value) -> Value {
    let mut map = Map::new();
    map.insert(TAG.to_string(), Value::String(tag.to_string()));
    if let Value::Object(extra) = fields {
        map.extend(extra);
    }
    Value::Object(map)
}

fn encode_number(n: f64) -> Value {
    if n.is_nan() {
        tagged("number", json!({ "value": "NaN" }))
    } else if n.is_infinite() {
        let value = if n > 0.0 { "Infinity" } else { "-Infinity" };
        tagged("number", json!({ "value": value }))
    } else if n == 0.0 && n.is_sign_negative() {
        tagged("number", json!({ "value": "-0" }))
    } else if n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 {
        Value::Number(Number::from(n as i64))
    } else {
        Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
    }
}

/// Encode a value into its wire representation
pub fn encode_value(value: &StructuredValue) -> Value {
    match value {
        StructuredValue::Undefined => tagged("undefined", Value::Null),
        StructuredValue::Null => Value::Null,
        StructuredValue::Bool(b) => Value::Bool(*b),
        StructuredValue::Number(n) => encode_number(*n),
        StructuredValue::BigInt(digits) => tagged("bigint", json!({ "value": digits })),
        StructuredValue::String(s) => Value::String(s.clone()),
        StructuredValue::Array(items) => Value::Array(items.iter().map(encode_value).collect()),
        StructuredValue::Object(entries) => {
            let map: Map<String, Value> = entries
                .iter()
                .map(|(k, v)| (k.clone(), encode_value(v)))
                .collect();
            if map.contains_key(TAG) {
                tagged("object", json!({ "value": Value::Object(map) }))
            } else {
                Value::Object(map)
            }
        }
        StructuredValue::Date(ms) => tagged("date", json!({ "value": ms })),
        StructuredValue::RegExp { source, flags } => {
            tagged("regexp", json!({ "source": source, "flags": flags }))
        }
        StructuredValue::Map(entries) => {
            let entries: Vec<Value> = entries
                .iter()
                .map(|(k, v)| Value::Array(vec![encode_value(k), encode_value(v)]))
                .collect();
            tagged("map", json!({ "entries": entries }))
        }
        StructuredValue::Set(items) => {
            let items: Vec<Value> = items.iter().map(encode_value).collect();
            tagged("set", json!({ "values": items }))
        }
        StructuredValue::Bytes { kind, data } => {
            tagged("bytes", json!({ "kind": kind, "data": data }))
        }
        StructuredValue::Transferred(index) => tagged("transfer", json!({ "index": index })),
        StructuredValue::Error {
            name,
            message,
            stack,
        } => tagged(
            "error",
            json!({ "name": name, "message": message, "stack": stack }),
        ),
    }
}

fn field<'a>(map: &'a Map<String, Value>, tag: &str, key: &str) -> Result<&'a Value, MessageError> {
    map.get(key).ok_or_else(|| MessageError::InvalidTagged {
        tag: tag.to_string(),
        reason: format!("missing `{key}`"),
    })
}

fn string_field(map: &Map<String, Value>, tag: &str, key: &str) -> Result<String, MessageError> {
    field(map, tag, key)?
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| MessageError::InvalidTagged {
            tag: tag.to_string(),
            reason: format!("`{key}` is not a string"),
        })
}

fn decode_tagged(tag: &str, map: &Map<String, Value>) -> Result<StructuredValue, MessageError> {
    let invalid = |reason: &str| MessageError::InvalidTagged {
        tag: tag.to_string(),
        reason: reason.to_string(),
    };
    let value = match tag {
        "undefined" => StructuredValue::Undefined,
        "number" => match string_field(map, tag, "value")?.as_str() {
            "NaN" => StructuredValue::Number(f64::NAN),
            "Infinity" => StructuredValue::Number(f64::INFINITY),
            "-Infinity" => StructuredValue::Number(f64::NEG_INFINITY),
            "-0" => StructuredValue::Number(-0.0),
            other => return Err(invalid(&format!("unexpected number `{other}`"))),
        },
        "bigint" => StructuredValue::BigInt(string_field(map, tag, "value")?),
        "date" => StructuredValue::Date(
            field(map, tag, "value")?
                .as_f64()
                .ok_or_else(|| invalid("`value` is not a number"))?,
        ),
        "regexp" => StructuredValue::RegExp {
            source: string_field(map, tag, "source")?,
            flags: string_field(map, tag, "flags")?,
        },
        "map" => {
            let entries = field(map, tag, "entries")?
                .as_array()
                .ok_or_else(|| invalid("`entries` is not an array"))?;
            let mut decoded = Vec::with_capacity(entries.len());
            for entry in entries {
                match entry.as_array().map(Vec::as_slice) {
                    Some([k, v]) => decoded.push((decode_value(k)?, decode_value(v)?)),
                    _ => return Err(invalid("entry is not a pair")),
                }
            }
            StructuredValue::Map(decoded)
        }
        "set" => {
            let values = field(map, tag, "values")?
                .as_array()
                .ok_or_else(|| invalid("`values` is not an array"))?;
            StructuredValue::Set(values.iter().map(decode_value).collect::<Result<_, _>>()?)
        }
        "bytes" => {
            let data: Vec<u8> = serde_json::from_value(field(map, tag, "data")?.clone())?;
            StructuredValue::Bytes {
                kind: string_field(map, tag, "kind")?,
                data,
            }
        }
        "transfer" => StructuredValue::Transferred(
            field(map, tag, "index")?
                .as_u64()
                .ok_or_else(|| invalid("`index` is not an integer"))? as usize,
        ),
        "error" => StructuredValue::Error {
            name: string_field(map, tag, "name")?,
            message: string_field(map, tag, "message")?,
            stack: map.get("stack").and_then(Value::as_str).map(str::to_string),
        },
        "object" => match field(map, tag, "value")? {
            Value::Object(inner) => StructuredValue::Object(
                inner
                    .iter()
                    .map(|(k, v)| Ok((k.clone(), decode_value(v)?)))
                    .collect::<Result<_, MessageError>>()?,
            ),
            _ => return Err(invalid("`value` is not an object")),
        },
        other => return Err(MessageError::UnknownTag(other.to_string())),
    };
    Ok(value)
}

/// Decode a wire value
pub fn decode_value(value: &Value) -> Result<StructuredValue, MessageError> {
    match value {
        Value::Array(items) => Ok(StructuredValue::Array(
            items.iter().map(decode_value).collect::<Result<_, _>>()?,
        )),
        Value::Object(map) => match map.get(TAG).and_then(Value::as_str) {
            Some(tag) => decode_tagged(tag, map),
            None => Ok(StructuredValue::Object(
                map.iter()
                    .map(|(k, v)| Ok((k.clone(), decode_value(v)?)))
                    .collect::<Result<_, MessageError>>()?,
            )),
        },
        plain => Ok(StructuredValue::from(plain.clone())),
    }
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    data: Value,
    #[serde(default)]
    transfer: Vec<Vec<u8>>,
}

/// One encoded message as it sits in a channel queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerializedMessage(String);

impl SerializedMessage {
    /// Wrap text produced by the JavaScript encoder
    pub fn from_wire(text: String) -> Self {
        Self(text)
    }

    pub fn encode(data: &StructuredValue, transfer: Vec<Vec<u8>>) -> Self {
        let envelope = json!({ "data": encode_value(data), "transfer": transfer });
        Self(envelope.to_string())
    }

    /// Decode into the value and its transferred buffers
    pub fn decode(&self) -> Result<(StructuredValue, Vec<Vec<u8>>), MessageError> {
        let envelope: Envelope = serde_json::from_str(&self.0)?;
        Ok((decode_value(&envelope.data)?, envelope.transfer))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}
