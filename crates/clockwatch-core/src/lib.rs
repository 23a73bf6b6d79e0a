//! Core record model for clockwatch samples.

use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

pub const CRATE_NAME: &str = "clockwatch-core";

/// Name of the capture-time field attached to every record after parsing.
pub const TIMESTAMP_FIELD: &str = "Timestamp";

/// Name of the single field carrying the parsed rows of a client listing.
pub const CLIENTS_FIELD: &str = "Clients";

/// Maximum number of records retained per category.
pub const CATEGORY_CAPACITY: usize = 10;

/// Identifier handed back by a recorder after a successful insert.
pub type RecordId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordCategory {
    Tracking,
    Client,
    Time,
}

impl RecordCategory {
    pub const ALL: [RecordCategory; 3] = [
        RecordCategory::Tracking,
        RecordCategory::Client,
        RecordCategory::Time,
    ];

    pub fn collection_name(self) -> &'static str {
        match self {
            RecordCategory::Tracking => "tracking",
            RecordCategory::Client => "client",
            RecordCategory::Time => "time",
        }
    }
}

impl fmt::Display for RecordCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.collection_name())
    }
}

impl FromStr for RecordCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RecordCategory::ALL
            .into_iter()
            .find(|c| c.collection_name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| {
                format!("unknown record category `{s}` (expected tracking, client or time)")
            })
    }
}

/// Typed value of one record field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Timestamp(DateTime<Utc>),
    Integer(i64),
    Decimal(f64),
    Text(String),
    Rows(Vec<ClientRow>),
}

impl FieldValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            FieldValue::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_decimal(&self) -> Option<f64> {
        match self {
            FieldValue::Decimal(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            FieldValue::Timestamp(ts) => Some(*ts),
            _ => None,
        }
    }

    pub fn as_rows(&self) -> Option<&[ClientRow]> {
        match self {
            FieldValue::Rows(rows) => Some(rows),
            _ => None,
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Integer(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Decimal(value)
    }
}

impl From<DateTime<Utc>> for FieldValue {
    fn from(value: DateTime<Utc>) -> Self {
        FieldValue::Timestamp(value)
    }
}

/// Insertion-ordered name/value mapping.
///
/// Inserting a name that is already present replaces its value in place, so
/// the first position of a name is kept and the last write wins.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderedMap<V> {
    entries: Vec<(String, V)>,
}

impl<V> Default for OrderedMap<V> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<V> OrderedMap<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: V) -> Option<V> {
        let name = name.into();
        match self.entries.iter_mut().find(|(k, _)| *k == name) {
            Some((_, slot)) => Some(std::mem::replace(slot, value)),
            None => {
                self.entries.push((name, value));
                None
            }
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<V> {
        let idx = self.entries.iter().position(|(k, _)| k == name)?;
        Some(self.entries.remove(idx).1)
    }

    pub fn get(&self, name: &str) -> Option<&V> {
        self.entries
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v)
    }

    pub fn contains_key(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &V)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl<K: Into<String>, V> FromIterator<(K, V)> for OrderedMap<V> {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut map = OrderedMap::new();
        for (k, v) in iter {
            map.insert(k, v);
        }
        map
    }
}

impl<V: Serialize> Serialize for OrderedMap<V> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (k, v) in &self.entries {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

struct OrderedMapVisitor<V>(PhantomData<V>);

impl<'de, V: Deserialize<'de>> Visitor<'de> for OrderedMapVisitor<V> {
    type Value = OrderedMap<V>;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a map of field names to values")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
        let mut map = OrderedMap::new();
        while let Some((k, v)) = access.next_entry::<String, V>()? {
            map.insert(k, v);
        }
        Ok(map)
    }
}

impl<'de, V: Deserialize<'de>> Deserialize<'de> for OrderedMap<V> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_map(OrderedMapVisitor(PhantomData))
    }
}

/// Parsed fields of one report, in source order.
pub type FieldMap = OrderedMap<FieldValue>;

/// One line of a client listing, column name to raw token.
pub type ClientRow = OrderedMap<String>;

/// A parsed sample of one category, ready for a recorder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub category: RecordCategory,
    pub fields: FieldMap,
}

impl Record {
    pub fn new(category: RecordCategory, fields: FieldMap) -> Self {
        Self { category, fields }
    }

    pub fn stamped(category: RecordCategory, fields: FieldMap, captured_at: DateTime<Utc>) -> Self {
        let mut record = Self::new(category, fields);
        record.stamp(captured_at);
        record
    }

    /// Attach the capture time as the last field, replacing any parsed field of the same name.
    pub fn stamp(&mut self, captured_at: DateTime<Utc>) {
        self.fields.remove(TIMESTAMP_FIELD);
        self.fields
            .insert(TIMESTAMP_FIELD, FieldValue::Timestamp(captured_at));
    }

    pub fn captured_at(&self) -> Option<DateTime<Utc>> {
        self.fields.get(TIMESTAMP_FIELD).and_then(FieldValue::as_timestamp)
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }
}

/// Field name for a source label: trimmed, inner spaces joined with `_`.
pub fn normalize_label(label: &str) -> String {
    label.trim().replace(' ', "_")
}
