//! Flat string-hash encoding for domain records.
//!
//! Every value in the store is a string. Booleans are the literals
//! `"true"`/`"false"`, lists are JSON array text, timestamps are RFC 3339.
//! Writes always go through [`ToField`], so only the canonical form is ever
//! persisted; reads go through [`Fields`], which tolerates older shapes and
//! fails soft on anything it cannot parse.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};

use crate::error::{Result, StoreError};
use crate::kv::WriteOp;

pub type FieldMap = BTreeMap<String, String>;

/// Gallery fields that must always hold the same array.
pub const MIRRORED_PHOTO_FIELDS: [&str; 2] = ["photos", "profilePhotos"];

/// A domain record persisted as one hash.
pub trait HashRecord: Sized {
    fn id(&self) -> &str;

    fn encode(&self) -> FieldMap;

    fn decode(id: &str, fields: &Fields<'_>) -> Result<Self>;
}

/// Canonical string form of a field value.
pub trait ToField {
    fn to_field(&self) -> String;
}

impl ToField for str {
    fn to_field(&self) -> String {
        self.to_string()
    }
}

impl ToField for String {
    fn to_field(&self) -> String {
        self.clone()
    }
}

impl ToField for bool {
    fn to_field(&self) -> String {
        encode_bool(*self)
    }
}

macro_rules! numeric_to_field {
    ($($t:ty),*) => {
        $(impl ToField for $t {
            fn to_field(&self) -> String {
                self.to_string()
            }
        })*
    };
}

numeric_to_field!(u8, u16, u32, u64, i32, i64, f32, f64);

impl ToField for [String] {
    fn to_field(&self) -> String {
        encode_list(self)
    }
}

impl ToField for Vec<String> {
    fn to_field(&self) -> String {
        encode_list(self)
    }
}

impl ToField for DateTime<Utc> {
    fn to_field(&self) -> String {
        encode_timestamp(*self)
    }
}

impl ToField for serde_json::Value {
    fn to_field(&self) -> String {
        self.to_string()
    }
}

impl<T: ToField + ?Sized> ToField for &T {
    fn to_field(&self) -> String {
        (**self).to_field()
    }
}

pub fn encode_bool(value: bool) -> String {
    let literal = if value { "true" } else { "false" };
    literal.to_string()
}

/// Only the exact literal `"true"` is truthy.
pub fn decode_bool(raw: Option<&str>) -> bool {
    raw == Some("true")
}

pub fn encode_list(items: &[String]) -> String {
    serde_json::to_string(items).unwrap_or_else(|_| "[]".to_string())
}

/// Decode a list field from any shape it has been stored in.
///
/// Accepts a JSON array, a JSON string holding a JSON array (double-encoded
/// writes), or nothing. Anything else decodes to an empty list with a warning.
/// Items keep their order; empty strings are kept and `null` items dropped.
pub fn decode_list(raw: Option<&str>) -> Vec<String> {
    let Some(raw) = raw.map(str::trim).filter(|r| !r.is_empty()) else {
        return Vec::new();
    };

    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(value) => list_from_json(value, 1).unwrap_or_else(|| {
            tracing::warn!(raw, "list field is not a JSON array, treating as empty");
            Vec::new()
        }),
        Err(err) => {
            tracing::warn!(raw, error = %err, "unparsable list field, treating as empty");
            Vec::new()
        }
    }
}

fn list_from_json(value: serde_json::Value, depth: u8) -> Option<Vec<String>> {
    match value {
        serde_json::Value::Array(items) => Some(
            items
                .into_iter()
                .filter_map(|item| match item {
                    serde_json::Value::String(s) => Some(s),
                    serde_json::Value::Null => None,
                    other => Some(other.to_string()),
                })
                .collect(),
        ),
        serde_json::Value::String(inner) if depth > 0 => {
            let nested = serde_json::from_str(&inner).ok()?;
            list_from_json(nested, depth - 1)
        }
        serde_json::Value::Null => Some(Vec::new()),
        _ => None,
    }
}

pub fn encode_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parses RFC 3339, or a bare integer as epoch millis.
pub fn decode_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    raw.parse::<i64>()
        .ok()
        .and_then(|millis| Utc.timestamp_millis_opt(millis).single())
}

/// Read-side view of one hash record.
pub struct Fields<'a> {
    key: &'a str,
    map: &'a HashMap<String, String>,
}

impl<'a> Fields<'a> {
    pub fn new(key: &'a str, map: &'a HashMap<String, String>) -> Self {
        Self { key, map }
    }

    pub fn key(&self) -> &str {
        self.key
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn raw(&self, name: &str) -> Option<&'a str> {
        self.map.get(name).map(String::as_str)
    }

    /// Non-empty string value. An empty field reads as absent, so a record
    /// written with `Some("")` decodes with `None`.
    pub fn text(&self, name: &str) -> Option<String> {
        self.raw(name)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    }

    pub fn required(&self, name: &str) -> Result<String> {
        self.text(name)
            .ok_or_else(|| StoreError::corrupt(self.key, format!("missing field `{}`", name)))
    }

    pub fn flag(&self, name: &str) -> bool {
        decode_bool(self.raw(name))
    }

    pub fn number<T: FromStr>(&self, name: &str) -> Option<T> {
        let raw = self.raw(name).filter(|v| !v.is_empty())?;
        match raw.trim().parse() {
            Ok(n) => Some(n),
            Err(_) => {
                tracing::warn!(key = self.key, field = name, raw, "unparsable numeric field");
                None
            }
        }
    }

    pub fn timestamp(&self, name: &str) -> Option<DateTime<Utc>> {
        let raw = self.raw(name).filter(|v| !v.is_empty())?;
        let parsed = decode_timestamp(raw);
        if parsed.is_none() {
            tracing::warn!(key = self.key, field = name, raw, "unparsable timestamp field");
        }
        parsed
    }

    pub fn list(&self, name: &str) -> Vec<String> {
        decode_list(self.raw(name))
    }

    /// JSON object/value field; `Null` when absent or unparsable.
    pub fn json(&self, name: &str) -> serde_json::Value {
        match self.raw(name).filter(|v| !v.is_empty()) {
            None => serde_json::Value::Null,
            Some(raw) => serde_json::from_str(raw).unwrap_or_else(|err| {
                tracing::warn!(key = self.key, field = name, error = %err, "unparsable json field");
                serde_json::Value::Null
            }),
        }
    }

    /// Fields not named in `known`, for round-tripping schemaless extras.
    pub fn rest(&self, known: &[&str]) -> BTreeMap<String, String> {
        self.map
            .iter()
            .filter(|(k, _)| !known.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// A partial update. The only way callers mutate stored hash fields.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Patch {
    fields: FieldMap,
    removals: BTreeSet<String>,
}

impl Patch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a field. List fields are canonicalized; photo fields are mirrored.
    pub fn set<V: ToField + ?Sized>(mut self, field: &str, value: &V) -> Self {
        let mut encoded = value.to_field();
        if MIRRORED_PHOTO_FIELDS.contains(&field) {
            encoded = encode_list(&decode_list(Some(&encoded)));
            for name in MIRRORED_PHOTO_FIELDS {
                self.removals.remove(name);
                self.fields.insert(name.to_string(), encoded.clone());
            }
            return self;
        }
        self.removals.remove(field);
        self.fields.insert(field.to_string(), encoded);
        self
    }

    /// Set a field only when a value is present.
    pub fn set_opt<V: ToField>(self, field: &str, value: Option<&V>) -> Self {
        match value {
            Some(v) => self.set(field, v),
            None => self,
        }
    }

    /// Delete a field from the stored hash.
    pub fn remove(mut self, field: &str) -> Self {
        let names: Vec<&str> = if MIRRORED_PHOTO_FIELDS.contains(&field) {
            MIRRORED_PHOTO_FIELDS.to_vec()
        } else {
            vec![field]
        };
        for name in names {
            self.fields.remove(name);
            self.removals.insert(name.to_string());
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty() && self.removals.is_empty()
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.fields.get(field).map(String::as_str)
    }

    pub fn removes(&self, field: &str) -> bool {
        self.removals.contains(field)
    }

    pub fn fields(&self) -> &FieldMap {
        &self.fields
    }

    pub(crate) fn into_ops(self, key: &str) -> Vec<WriteOp> {
        let mut ops = Vec::with_capacity(2);
        if !self.fields.is_empty() {
            ops.push(WriteOp::HSet {
                key: key.to_string(),
                fields: self.fields.into_iter().collect(),
            });
        }
        if !self.removals.is_empty() {
            ops.push(WriteOp::HDel {
                key: key.to_string(),
                fields: self.removals.into_iter().collect(),
            });
        }
        ops
    }
}

impl From<FieldMap> for Patch {
    fn from(map: FieldMap) -> Self {
        map.into_iter()
            .fold(Patch::new(), |patch, (k, v)| patch.set(&k, &v))
    }
}
