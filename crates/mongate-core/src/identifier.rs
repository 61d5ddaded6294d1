//! Identifier normalization.
//!
//! Documents reference tenants, users and processes through two encodings:
//! 12-byte binary ids (written as 24 hex characters) and opaque strings such
//! as UUIDs. Values arrive from the generator, from the authorization source
//! and from configuration in either form, so every comparison goes through
//! [`Identifier::normalize`].
//!
//! Inside JSON documents a binary id is carried as the extended-JSON object
//! `{"$oid": "<hex>"}`; an opaque id is a plain string.

use serde_json::{Map, Value};
use std::fmt;
use std::hash::{Hash, Hasher};

/// Key of the extended-JSON wrapper carrying a binary id.
pub const OID_KEY: &str = "$oid";

/// Length of the hex form of a binary id.
const OID_HEX_LEN: usize = 24;

/// A normalized identifier.
///
/// Two identifiers are equal iff their canonical forms match, regardless of
/// how they were constructed.
#[derive(Debug, Clone)]
pub enum Identifier {
    /// 12-byte binary id.
    ObjectId([u8; 12]),
    /// Any other identifier, kept verbatim.
    Opaque(String),
}

impl Identifier {
    /// Normalize a raw JSON value into an identifier.
    ///
    /// - `{"$oid": "<24 hex>"}` passes through as a binary id
    /// - a 24-hex-char string becomes a binary id
    /// - any other string becomes an opaque id
    /// - any other value becomes an opaque id of its compact JSON text
    ///
    /// This never fails.
    pub fn normalize(raw: &Value) -> Self {
        match raw {
            Value::String(s) => Self::parse(s),
            Value::Object(map) => match oid_bytes(map) {
                Some(bytes) => Self::ObjectId(bytes),
                None => Self::Opaque(raw.to_string()),
            },
            other => Self::Opaque(other.to_string()),
        }
    }

    /// Normalize a string identifier.
    pub fn parse(raw: &str) -> Self {
        match decode_oid(raw) {
            Some(bytes) => Self::ObjectId(bytes),
            None => Self::Opaque(raw.to_string()),
        }
    }

    /// Whether this is a binary id.
    pub fn is_object_id(&self) -> bool {
        matches!(self, Self::ObjectId(_))
    }

    /// The raw bytes of a binary id.
    pub fn as_bytes(&self) -> Option<&[u8; 12]> {
        match self {
            Self::ObjectId(bytes) => Some(bytes),
            Self::Opaque(_) => None,
        }
    }

    /// Canonical text form: lowercase hex for binary ids, the string itself
    /// otherwise.
    pub fn canonical(&self) -> String {
        match self {
            Self::ObjectId(bytes) => hex::encode(bytes),
            Self::Opaque(s) => s.clone(),
        }
    }

    /// JSON form used inside filter documents.
    pub fn to_value(&self) -> Value {
        match self {
            Self::ObjectId(bytes) => {
                let mut map = Map::with_capacity(1);
                map.insert(OID_KEY.to_string(), Value::String(hex::encode(bytes)));
                Value::Object(map)
            }
            Self::Opaque(s) => Value::String(s.clone()),
        }
    }
}

impl PartialEq for Identifier {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::ObjectId(a), Self::ObjectId(b)) => a == b,
            _ => self.canonical() == other.canonical(),
        }
    }
}

impl Eq for Identifier {}

impl Hash for Identifier {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.canonical().hash(state);
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.canonical())
    }
}

impl From<&str> for Identifier {
    fn from(raw: &str) -> Self {
        Self::parse(raw)
    }
}

impl From<String> for Identifier {
    fn from(raw: String) -> Self {
        Self::parse(&raw)
    }
}

impl From<[u8; 12]> for Identifier {
    fn from(bytes: [u8; 12]) -> Self {
        Self::ObjectId(bytes)
    }
}

impl From<&Identifier> for Value {
    fn from(id: &Identifier) -> Self {
        id.to_value()
    }
}

/// Whether a JSON object is an extended-JSON binary id wrapper.
pub fn is_oid_wrapper(map: &Map<String, Value>) -> bool {
    map.len() == 1 && map.contains_key(OID_KEY)
}

fn oid_bytes(map: &Map<String, Value>) -> Option<[u8; 12]> {
    if !is_oid_wrapper(map) {
        return None;
    }
    map.get(OID_KEY).and_then(Value::as_str).and_then(decode_oid)
}

fn decode_oid(raw: &str) -> Option<[u8; 12]> {
    if raw.len() != OID_HEX_LEN {
        return None;
    }
    let mut bytes = [0u8; 12];
    hex::decode_to_slice(raw, &mut bytes).ok()?;
    Some(bytes)
}
