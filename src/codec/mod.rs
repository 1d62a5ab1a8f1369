//! Object codec: bytestring <-> structured value, with a proxy table for
//! objects that cannot be serialised directly (spec §4.2).
//!
//! Wire values are MessagePack (`rmpv::Value`/`rmp-serde`, the format the
//! teacher's own `exfiltrate_internal` crate already depends on) extended
//! with two custom `Ext` tags:
//!
//! - tag 4, named proxy: payload is a UTF-8 name.
//! - tag 5, constructed object: payload is the concatenation of three
//!   encoded values: class name, positional args, state mapping.

pub mod proxy;

pub use proxy::{Proxied, ProxyClass, ProxyTable};

use std::sync::Arc;

/// Ext type tag for a named proxy reference.
pub const TAG_PROXY: i8 = 4;
/// Ext type tag for a constructed (class + args + state) object.
pub const TAG_CONSTRUCTED: i8 = 5;
/// Reserved proxy name for the `NotGiven` sentinel.
pub const NOT_GIVEN_NAME: &str = "-";

/// Errors raised by the codec layer.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("malformed ext payload for tag {tag}")]
    MalformedExt { tag: i8 },
    #[error("unknown proxied class: {0}")]
    UnknownClass(String),
    #[error("failed to construct {class}: {detail}")]
    ConstructFailed { class: String, detail: String },
    #[error(transparent)]
    MsgPackEncode(#[from] rmp_serde::encode::Error),
    #[error(transparent)]
    MsgPackDecode(#[from] rmp_serde::decode::Error),
    #[error("unsupported value shape for encoding")]
    Unencodable,
}

/// A structured value as it moves through the codec and the layers above
/// it.
///
/// This is the decoded counterpart of `rmpv::Value`: primitives map
/// one-to-one, and the two proxy `Ext` tags are resolved into `Proxy`/
/// `NotGiven` (or re-encoded from them) rather than exposed as raw bytes
/// to callers.
#[derive(Debug, Clone)]
pub enum Value {
    Nil,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    Array(Vec<Value>),
    Map(Vec<(Value, Value)>),
    /// A reference to a proxied object, identified by a table entry.
    Proxy(Arc<dyn Proxied>),
    /// The reserved `NotGiven` sentinel (spec §4.2, §9 `original_source`
    /// supplement: used to distinguish "no value supplied" from `null`).
    NotGiven,
}

impl Value {
    pub fn str(s: impl Into<String>) -> Value {
        Value::Str(s.into())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::UInt(u) => i64::try_from(*u).ok(),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&[(Value, Value)]> {
        match self {
            Value::Map(m) => Some(m.as_slice()),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(a) => Some(a.as_slice()),
            _ => None,
        }
    }

    pub fn map_get(&self, key: &str) -> Option<&Value> {
        self.as_map()?.iter().find_map(|(k, v)| {
            if k.as_str() == Some(key) { Some(v) } else { None }
        })
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::UInt(a), Value::UInt(b)) => a == b,
            (Value::Int(a), Value::UInt(b)) | (Value::UInt(b), Value::Int(a)) => {
                i64::try_from(*b).map(|b| *a == b).unwrap_or(false)
            }
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            (Value::NotGiven, Value::NotGiven) => true,
            (Value::Proxy(a), Value::Proxy(b)) => proxy::same_identity(a, b),
            _ => false,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}
impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}
impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}
impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

/// Encodes a `Value` tree into its wire-level `rmpv::Value` form,
/// applying the tag-4/tag-5 encoding policy from spec §4.2 to any
/// `Value::Proxy` it encounters. Mutates `table` when an unnamed object
/// needs an auto-allocated name.
pub fn encode(value: &Value, table: &mut ProxyTable) -> Result<rmpv::Value, Error> {
    Ok(match value {
        Value::Nil => rmpv::Value::Nil,
        Value::Bool(b) => rmpv::Value::Boolean(*b),
        Value::Int(i) => rmpv::Value::from(*i),
        Value::UInt(u) => rmpv::Value::from(*u),
        Value::Float(f) => rmpv::Value::F64(*f),
        Value::Str(s) => rmpv::Value::String(s.clone().into()),
        Value::Bytes(b) => rmpv::Value::Binary(b.clone()),
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(encode(item, table)?);
            }
            rmpv::Value::Array(out)
        }
        Value::Map(entries) => {
            let mut out = Vec::with_capacity(entries.len());
            for (k, v) in entries {
                out.push((encode(k, table)?, encode(v, table)?));
            }
            rmpv::Value::Map(out)
        }
        Value::NotGiven => rmpv::Value::Ext(TAG_PROXY, NOT_GIVEN_NAME.as_bytes().to_vec()),
        Value::Proxy(obj) => encode_proxy(obj, table)?,
    })
}

fn encode_proxy(obj: &Arc<dyn Proxied>, table: &mut ProxyTable) -> Result<rmpv::Value, Error> {
    if let Some(name) = table.name_of(obj) {
        return Ok(rmpv::Value::Ext(TAG_PROXY, name.into_bytes()));
    }
    if let Some(class) = table.class_of(obj.class_name()) {
        let args: Vec<Value> = obj.positional_args();
        let state = obj.state();
        let mut payload = Vec::new();
        payload.extend(rmp_serde::to_vec(&class.name())?);
        payload.extend(rmp_serde::to_vec(&encode(&Value::Array(args), table)?)?);
        payload.extend(rmp_serde::to_vec(&encode(&state, table)?)?);
        return Ok(rmpv::Value::Ext(TAG_CONSTRUCTED, payload));
    }
    let name = table.register_auto(obj.clone());
    Ok(rmpv::Value::Ext(TAG_PROXY, name.into_bytes()))
}

/// Decodes a wire-level `rmpv::Value` into a `Value` tree, resolving
/// tag-4/tag-5 `Ext` payloads against `table` per spec §4.2.
pub fn decode(value: &rmpv::Value, table: &mut ProxyTable) -> Result<Value, Error> {
    Ok(match value {
        rmpv::Value::Nil => Value::Nil,
        rmpv::Value::Boolean(b) => Value::Bool(*b),
        rmpv::Value::Integer(i) => {
            if let Some(i) = i.as_i64() {
                Value::Int(i)
            } else if let Some(u) = i.as_u64() {
                Value::UInt(u)
            } else {
                return Err(Error::Unencodable);
            }
        }
        rmpv::Value::F32(f) => Value::Float(*f as f64),
        rmpv::Value::F64(f) => Value::Float(*f),
        rmpv::Value::String(s) => Value::Str(s.as_str().unwrap_or_default().to_string()),
        rmpv::Value::Binary(b) => Value::Bytes(b.clone()),
        rmpv::Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(decode(item, table)?);
            }
            Value::Array(out)
        }
        rmpv::Value::Map(entries) => {
            let mut out = Vec::with_capacity(entries.len());
            for (k, v) in entries {
                out.push((decode(k, table)?, decode(v, table)?));
            }
            Value::Map(out)
        }
        rmpv::Value::Ext(TAG_PROXY, payload) => {
            let name = std::str::from_utf8(payload)
                .map_err(|_| Error::MalformedExt { tag: TAG_PROXY })?;
            if name == NOT_GIVEN_NAME {
                Value::NotGiven
            } else {
                Value::Proxy(table.resolve(name))
            }
        }
        rmpv::Value::Ext(TAG_CONSTRUCTED, payload) => decode_constructed(payload, table)?,
        rmpv::Value::Ext(tag, _) => return Err(Error::MalformedExt { tag: *tag }),
        _ => return Err(Error::Unencodable),
    })
}

fn decode_constructed(payload: &[u8], table: &mut ProxyTable) -> Result<Value, Error> {
    let mut de = rmp_serde::Deserializer::new(payload);
    let class_name: String = serde::Deserialize::deserialize(&mut de)
        .map_err(|_| Error::MalformedExt { tag: TAG_CONSTRUCTED })?;
    let args_raw: rmpv::Value = serde::Deserialize::deserialize(&mut de)
        .map_err(|_| Error::MalformedExt { tag: TAG_CONSTRUCTED })?;
    let state_raw: rmpv::Value = serde::Deserialize::deserialize(&mut de)
        .map_err(|_| Error::MalformedExt { tag: TAG_CONSTRUCTED })?;
    let args = match decode(&args_raw, table)? {
        Value::Array(a) => a,
        _ => Vec::new(),
    };
    let state = match decode(&state_raw, table)? {
        Value::Map(m) => m,
        _ => Vec::new(),
    };
    let class = table
        .class_of(&class_name)
        .ok_or_else(|| Error::UnknownClass(class_name.clone()))?;
    let obj = class
        .construct_with_state(&args, &state)
        .map_err(|detail| Error::ConstructFailed { class: class_name.clone(), detail })?;
    Ok(Value::Proxy(obj))
}

/// Serialises a `Value` to bytes using the wire codec, after applying the
/// proxy-encoding policy.
pub fn encode_bytes(value: &Value, table: &mut ProxyTable) -> Result<Vec<u8>, Error> {
    let wire = encode(value, table)?;
    let mut buf = Vec::new();
    rmpv::encode::write_value(&mut buf, &wire).map_err(|_| Error::Unencodable)?;
    Ok(buf)
}

/// Deserialises bytes produced by `encode_bytes`.
pub fn decode_bytes(bytes: &[u8], table: &mut ProxyTable) -> Result<Value, Error> {
    let mut cursor = std::io::Cursor::new(bytes);
    let wire = rmpv::decode::read_value(&mut cursor).map_err(|_| Error::Unencodable)?;
    decode(&wire, table)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitive_round_trip() {
        let mut table = ProxyTable::new();
        let v = Value::Map(vec![
            (Value::str("a"), Value::Int(42)),
            (Value::str("b"), Value::Array(vec![Value::Bool(true), Value::Nil])),
        ]);
        let bytes = encode_bytes(&v, &mut table).unwrap();
        let back = decode_bytes(&bytes, &mut table).unwrap();
        assert_eq!(v, back);
    }

    #[test]
    fn not_given_round_trips_as_reserved_name() {
        let mut table = ProxyTable::new();
        let bytes = encode_bytes(&Value::NotGiven, &mut table).unwrap();
        let back = decode_bytes(&bytes, &mut table).unwrap();
        assert_eq!(back, Value::NotGiven);
        assert_eq!(table.len(), 1); // only the reserved "-" entry
    }
}
