//! Property sets: the flat record format exchanged between resident objects and the store.
//!
//! A set has three tiers. `main` holds the fields every record of its kind carries,
//! `unusual` holds optional fields that are only present when they differ from the
//! object's type default, and `custom` holds free-form string properties assigned at
//! runtime. The tiers are ordered by name so binding and dumps are deterministic.

use std::collections::BTreeMap;

use rusqlite::types::{ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

use crate::store::serial::Serial;

pub const SERIAL_COLUMN: &str = "Serial";
pub const NAME_COLUMN: &str = "Name";
pub const CONTAINER_COLUMN: &str = "Container";
pub const AREA_COLUMN: &str = "AreaId";

/// A typed field value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Integer view. Text is parsed as decimal or `0x` hex, since values read back from
    /// the prop table are always text.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(v) => Some(*v),
            Value::Real(v) => Some(*v as i64),
            Value::Text(s) => parse_integer(s),
            Value::Null => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(v) => Some(*v as f64),
            Value::Real(v) => Some(*v),
            Value::Text(s) => s.trim().parse().ok(),
            Value::Null => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        self.as_i64().map(|v| v != 0)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Text form, as stored in a prop row's `PropValue`.
    pub fn to_text(&self) -> Option<String> {
        match self {
            Value::Null => None,
            Value::Integer(v) => Some(v.to_string()),
            Value::Real(v) => Some(v.to_string()),
            Value::Text(s) => Some(s.clone()),
        }
    }

    pub fn from_sql_ref(value: ValueRef<'_>) -> Value {
        match value {
            ValueRef::Null => Value::Null,
            ValueRef::Integer(v) => Value::Integer(v),
            ValueRef::Real(v) => Value::Real(v),
            ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
                Value::Text(String::from_utf8_lossy(bytes).into_owned())
            }
        }
    }
}

pub(crate) fn parse_integer(text: &str) -> Option<i64> {
    let trimmed = text.trim();
    if let Some(hex) = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
    {
        return i64::from_str_radix(hex, 16).ok();
    }
    trimmed.parse().ok()
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::Owned(rusqlite::types::Value::Null),
            Value::Integer(v) => ToSqlOutput::Owned(rusqlite::types::Value::Integer(*v)),
            Value::Real(v) => ToSqlOutput::Owned(rusqlite::types::Value::Real(*v)),
            Value::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
        })
    }
}

macro_rules! value_from_int {
    ($($t:ty),*) => {
        $(impl From<$t> for Value {
            fn from(v: $t) -> Self {
                Value::Integer(i64::from(v))
            }
        })*
    };
}

value_from_int!(i8, i16, i32, i64, u8, u16, u32);

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Integer(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Real(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Serial> for Value {
    fn from(v: Serial) -> Self {
        Value::Integer(i64::from(v.raw()))
    }
}

/// Bookkeeping flags carried alongside a record. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordFlags {
    pub dirty: bool,
    pub save_on_exit: bool,
    pub orphan: bool,
}

impl Default for RecordFlags {
    fn default() -> Self {
        Self {
            dirty: false,
            save_on_exit: true,
            orphan: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PropertySet {
    #[serde(default)]
    pub main: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub unusual: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub custom: BTreeMap<String, String>,
    #[serde(skip)]
    pub flags: RecordFlags,
}

impl PropertySet {
    pub fn new(serial: Serial) -> Self {
        let mut set = Self::default();
        set.set_main(SERIAL_COLUMN, serial);
        set
    }

    pub fn serial(&self) -> Serial {
        self.get(SERIAL_COLUMN)
            .and_then(Value::as_i64)
            .and_then(Serial::from_db)
            .unwrap_or(Serial::NONE)
    }

    pub fn name(&self) -> Option<&str> {
        self.get(NAME_COLUMN).and_then(Value::as_str)
    }

    /// Declared container, if any. Zero and NULL both mean "none".
    pub fn container(&self) -> Option<Serial> {
        self.get(CONTAINER_COLUMN)
            .and_then(Value::as_i64)
            .and_then(Serial::from_db)
    }

    pub fn set_main(&mut self, name: &str, value: impl Into<Value>) {
        self.main.insert(name.to_string(), value.into());
    }

    /// Set an unusual field. NULL removes it.
    pub fn set_unusual(&mut self, name: &str, value: impl Into<Value>) {
        let value = value.into();
        if value.is_null() {
            self.unusual.remove(name);
        } else {
            self.unusual.insert(name.to_string(), value);
        }
    }

    pub fn set_custom(&mut self, name: &str, value: impl Into<String>) {
        self.custom.insert(name.to_string(), value.into());
    }

    /// Look a field up in the main tier, then the unusual tier. Names are matched
    /// exactly first, then ignoring ASCII case (column names are case-insensitive).
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.main
            .get(name)
            .or_else(|| self.unusual.get(name))
            .or_else(|| {
                self.main
                    .iter()
                    .chain(self.unusual.iter())
                    .find(|(key, _)| key.eq_ignore_ascii_case(name))
                    .map(|(_, value)| value)
            })
    }

    pub fn get_i64(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(Value::as_i64)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(Value::as_str)
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.main.remove(name).or_else(|| self.unusual.remove(name))
    }

    pub fn custom(&self, name: &str) -> Option<&str> {
        self.custom.get(name).map(String::as_str)
    }

    /// Tier-wise equality ignoring bookkeeping flags and which tier a field landed in.
    pub fn same_fields(&self, other: &PropertySet) -> bool {
        let mine: BTreeMap<&String, &Value> = self.main.iter().chain(self.unusual.iter()).collect();
        let theirs: BTreeMap<&String, &Value> =
            other.main.iter().chain(other.unusual.iter()).collect();
        mine == theirs && self.custom == other.custom
    }
}
