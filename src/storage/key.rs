//! Keys, key ranges and key paths.
//!
//! These mirror the value model of the browser's transactional store:
//! - `Key`: a primary or index key (number, string, or array of keys)
//! - `KeyRange`: a bounded or unbounded interval over keys
//! - `KeyPath`: where a key is read from inside a document
//!
//! ## Ordering
//!
//! Keys order by type first (numbers < strings < arrays) and then by value.
//! Arrays compare element by element, a shorter prefix sorting first.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::fmt;

/// A primary or index key.
#[derive(Debug, Clone)]
pub enum Key {
    Number(f64),
    String(String),
    Array(Vec<Key>),
}

impl Key {
    /// Converts a JSON value into a key.
    ///
    /// Returns `None` for values that are not valid keys (null, booleans,
    /// objects, or arrays holding any of those).
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_f64().map(Key::Number),
            Value::String(s) => Some(Key::String(s.clone())),
            Value::Array(items) => items
                .iter()
                .map(Key::from_value)
                .collect::<Option<Vec<_>>>()
                .map(Key::Array),
            _ => None,
        }
    }

    /// Converts the key back into a JSON value.
    ///
    /// Integral numbers come back as JSON integers so ids round-trip as `1`,
    /// not `1.0`.
    pub fn to_value(&self) -> Value {
        match self {
            Key::Number(n) => {
                if n.fract() == 0.0 && n.abs() < 9.0e15 {
                    Value::from(*n as i64)
                } else {
                    serde_json::Number::from_f64(*n)
                        .map(Value::Number)
                        .unwrap_or(Value::Null)
                }
            }
            Key::String(s) => Value::String(s.clone()),
            Key::Array(items) => Value::Array(items.iter().map(Key::to_value).collect()),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Key::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Key::String(s) => Some(s),
            _ => None,
        }
    }

    fn type_rank(&self) -> u8 {
        match self {
            Key::Number(_) => 0,
            Key::String(_) => 1,
            Key::Array(_) => 2,
        }
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Key {}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Key::Number(a), Key::Number(b)) => a.total_cmp(b),
            (Key::String(a), Key::String(b)) => a.cmp(b),
            (Key::Array(a), Key::Array(b)) => a.cmp(b),
            _ => self.type_rank().cmp(&other.type_rank()),
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_value())
    }
}

/// Keys serialize as their JSON value.
impl Serialize for Key {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Key {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Key::from_value(&value).ok_or_else(|| D::Error::custom(format!("invalid key: {}", value)))
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key::String(s.to_string())
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Key::String(s)
    }
}

impl From<i64> for Key {
    fn from(n: i64) -> Self {
        Key::Number(n as f64)
    }
}

impl From<i32> for Key {
    fn from(n: i32) -> Self {
        Key::Number(n as f64)
    }
}

impl From<u32> for Key {
    fn from(n: u32) -> Self {
        Key::Number(n as f64)
    }
}

impl From<f64> for Key {
    fn from(n: f64) -> Self {
        Key::Number(n)
    }
}

impl From<Vec<Key>> for Key {
    fn from(items: Vec<Key>) -> Self {
        Key::Array(items)
    }
}

/// An interval over keys.
///
/// `None` bounds are unbounded; `*_open` excludes the bound itself.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct KeyRange {
    pub lower: Option<Key>,
    pub upper: Option<Key>,
    pub lower_open: bool,
    pub upper_open: bool,
}

impl KeyRange {
    /// Matches exactly one key.
    pub fn only(key: impl Into<Key>) -> Self {
        let key = key.into();
        Self {
            lower: Some(key.clone()),
            upper: Some(key),
            lower_open: false,
            upper_open: false,
        }
    }

    /// All keys `>= key` (or `> key` when `open`).
    pub fn lower_bound(key: impl Into<Key>, open: bool) -> Self {
        Self {
            lower: Some(key.into()),
            lower_open: open,
            ..Self::default()
        }
    }

    /// All keys `<= key` (or `< key` when `open`).
    pub fn upper_bound(key: impl Into<Key>, open: bool) -> Self {
        Self {
            upper: Some(key.into()),
            upper_open: open,
            ..Self::default()
        }
    }

    /// Keys between `lower` and `upper`.
    pub fn bound(
        lower: impl Into<Key>,
        upper: impl Into<Key>,
        lower_open: bool,
        upper_open: bool,
    ) -> Self {
        Self {
            lower: Some(lower.into()),
            upper: Some(upper.into()),
            lower_open,
            upper_open,
        }
    }

    /// Returns true if `key` falls inside the range.
    pub fn contains(&self, key: &Key) -> bool {
        if let Some(lower) = &self.lower {
            match key.cmp(lower) {
                Ordering::Less => return false,
                Ordering::Equal if self.lower_open => return false,
                _ => {}
            }
        }
        if let Some(upper) = &self.upper {
            match key.cmp(upper) {
                Ordering::Greater => return false,
                Ordering::Equal if self.upper_open => return false,
                _ => {}
            }
        }
        true
    }
}

impl From<Key> for KeyRange {
    fn from(key: Key) -> Self {
        KeyRange::only(key)
    }
}

/// Location of a key inside a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyPath {
    /// A property name, possibly dot-joined for nested properties.
    Single(String),
    /// Several paths whose values form an array key.
    Compound(Vec<String>),
}

impl KeyPath {
    /// Parses a field path: `"a,b"` is compound, `"a.b"` is a nested path.
    pub fn parse(field_path: &str) -> Self {
        if field_path.contains(',') {
            KeyPath::Compound(field_path.split(',').map(|p| p.trim().to_string()).collect())
        } else {
            KeyPath::Single(field_path.trim().to_string())
        }
    }

    pub fn is_compound(&self) -> bool {
        matches!(self, KeyPath::Compound(_))
    }

    /// Paths this key path reads from.
    pub fn parts(&self) -> Vec<&str> {
        match self {
            KeyPath::Single(path) => vec![path.as_str()],
            KeyPath::Compound(paths) => paths.iter().map(String::as_str).collect(),
        }
    }

    /// Extracts the key from a document, if every component is a valid key.
    pub fn extract(&self, doc: &Value) -> Option<Key> {
        match self {
            KeyPath::Single(path) => resolve_path(doc, path).and_then(Key::from_value),
            KeyPath::Compound(paths) => paths
                .iter()
                .map(|p| resolve_path(doc, p).and_then(Key::from_value))
                .collect::<Option<Vec<_>>>()
                .map(Key::Array),
        }
    }

    /// Keys under which `doc` appears in an index with this key path.
    ///
    /// Multi-entry indices over an array value yield one key per valid,
    /// distinct element; invalid elements are skipped.
    pub fn index_keys(&self, doc: &Value, multi_entry: bool) -> Vec<Key> {
        if multi_entry {
            if let KeyPath::Single(path) = self {
                if let Some(Value::Array(items)) = resolve_path(doc, path) {
                    let mut keys: Vec<Key> = items.iter().filter_map(Key::from_value).collect();
                    keys.sort();
                    keys.dedup();
                    return keys;
                }
            }
        }
        self.extract(doc).into_iter().collect()
    }

    /// Writes `key` at this path, creating intermediate objects.
    ///
    /// Only single paths can receive generated keys.
    pub fn inject(&self, doc: &mut Value, key: &Key) -> bool {
        let KeyPath::Single(path) = self else {
            return false;
        };
        let parts: Vec<&str> = path.split('.').collect();
        let Some((last, parents)) = parts.split_last() else {
            return false;
        };
        let mut current = doc;
        for part in parents {
            current = match current {
                Value::Object(map) => map
                    .entry(part.to_string())
                    .or_insert_with(|| Value::Object(Map::new())),
                _ => return false,
            };
        }
        match current {
            Value::Object(map) => {
                map.insert(last.to_string(), key.to_value());
                true
            }
            _ => false,
        }
    }
}

impl fmt::Display for KeyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyPath::Single(path) => write!(f, "{}", path),
            KeyPath::Compound(paths) => write!(f, "{}", paths.join(",")),
        }
    }
}

/// Follows a dot-joined property path. An empty path is the value itself.
pub fn resolve_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(value);
    }
    path.split('.').try_fold(value, |current, part| match current {
        Value::Object(map) => map.get(part),
        _ => None,
    })
}
