//! Tagged values stored in the state tree
//!
//! Mappings are plain key-ordered maps. Opaque values are ordered
//! association lists owned by a subsystem (e.g. absorbed targets) and
//! survive a JSON round trip as `{"__map__": [[key, value], ...]}`.

use std::collections::BTreeMap;

use serde_json::Value as Json;

use crate::error::PathError;

/// JSON key marking a serialized association list
pub const OPAQUE_TAG: &str = "__map__";

/// Shared stand-in for an absent value
pub static NULL: Value = Value::Null;

/// A node of the state tree
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Number(f64),
    String(String),
    Bool(bool),
    Map(BTreeMap<String, Value>),
    Seq(Vec<Value>),
    Opaque(AssocList),
}

impl Value {
    /// Empty mapping
    pub fn map() -> Self {
        Value::Map(BTreeMap::new())
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_seq(&self) -> Option<&[Value]> {
        match self {
            Value::Seq(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_opaque(&self) -> Option<&AssocList> {
        match self {
            Value::Opaque(list) => Some(list),
            _ => None,
        }
    }

    /// Child lookup for a single path segment.
    ///
    /// Mappings and opaque lists are keyed by name; sequences by decimal
    /// index. Anything else is a leaf.
    pub fn child(&self, segment: &str) -> Option<&Value> {
        match self {
            Value::Map(m) => m.get(segment),
            Value::Opaque(list) => list.get(segment),
            Value::Seq(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        }
    }

    pub fn child_mut(&mut self, segment: &str) -> Option<&mut Value> {
        match self {
            Value::Map(m) => m.get_mut(segment),
            Value::Opaque(list) => list.get_mut(segment),
            Value::Seq(items) => segment
                .parse::<usize>()
                .ok()
                .and_then(move |i| items.get_mut(i)),
            _ => None,
        }
    }

    /// Check that a write at `segments` only descends through containers.
    ///
    /// Missing and null nodes are fine (they become mappings). Existing
    /// sequences must hold the index; scalars cannot take children.
    pub fn check_writable(&self, segments: &[&str]) -> Result<(), PathError> {
        let mut node = self;
        for seg in segments {
            let next = match node {
                Value::Null => return Ok(()),
                Value::Map(m) => m.get(*seg),
                Value::Opaque(list) => list.get(seg),
                Value::Seq(items) => items.get(seq_index(items.len(), seg)?),
                leaf => return Err(not_traversable(seg, leaf)),
            };
            match next {
                Some(next) => node = next,
                None => return Ok(()),
            }
        }
        Ok(())
    }

    /// Write `value` at `segments`, creating mappings for missing or null
    /// nodes on the way. Existing containers are written into, never
    /// replaced.
    ///
    /// Returns the previous value at the target, if any.
    pub fn write_path(&mut self, segments: &[&str], value: Value) -> Result<Option<Value>, PathError> {
        let (last, parents) = segments.split_last().ok_or(PathError::Empty)?;
        let mut node = self;
        for seg in parents {
            node = node.slot(seg)?;
        }
        node.put(last, value)
    }

    fn slot(&mut self, seg: &str) -> Result<&mut Value, PathError> {
        if matches!(self, Value::Null) {
            *self = Value::map();
        }
        match self {
            Value::Map(m) => Ok(m.entry(seg.to_string()).or_insert_with(Value::map)),
            Value::Opaque(list) => Ok(list.get_or_insert_with(seg, Value::map)),
            Value::Seq(items) => {
                let len = items.len();
                items.get_mut(seq_index(len, seg)?).ok_or_else(|| out_of_range(seg, len))
            }
            leaf => Err(not_traversable(seg, leaf)),
        }
    }

    fn put(&mut self, seg: &str, value: Value) -> Result<Option<Value>, PathError> {
        if matches!(self, Value::Null) {
            *self = Value::map();
        }
        match self {
            Value::Map(m) => Ok(m.insert(seg.to_string(), value)),
            Value::Opaque(list) => Ok(list.insert(seg.to_string(), value)),
            Value::Seq(items) => {
                let len = items.len();
                let slot = items
                    .get_mut(seq_index(len, seg)?)
                    .ok_or_else(|| out_of_range(seg, len))?;
                Ok(Some(std::mem::replace(slot, value)))
            }
            leaf => Err(not_traversable(seg, leaf)),
        }
    }

    /// True if every number in this subtree is finite
    pub fn is_finite(&self) -> bool {
        match self {
            Value::Number(n) => n.is_finite(),
            Value::Map(m) => m.values().all(Value::is_finite),
            Value::Seq(items) => items.iter().all(Value::is_finite),
            Value::Opaque(list) => list.iter().all(|(_, v)| v.is_finite()),
            Value::Null | Value::String(_) | Value::Bool(_) => true,
        }
    }

    /// Short type name for diagnostics
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Bool(_) => "bool",
            Value::Map(_) => "map",
            Value::Seq(_) => "seq",
            Value::Opaque(_) => "opaque",
        }
    }

    /// Convert to JSON. Opaque lists become tagged pair arrays.
    ///
    /// JSON has no NaN or infinity; such numbers come out as `null`. The
    /// store refuses to hold them, so a saved tree never carries one.
    pub fn to_json(&self) -> Json {
        match self {
            Value::Null => Json::Null,
            Value::Number(n) => serde_json::Number::from_f64(*n)
                .map(Json::Number)
                .unwrap_or(Json::Null),
            Value::String(s) => Json::String(s.clone()),
            Value::Bool(b) => Json::Bool(*b),
            Value::Map(m) => Json::Object(m.iter().map(|(k, v)| (k.clone(), v.to_json())).collect()),
            Value::Seq(items) => Json::Array(items.iter().map(Value::to_json).collect()),
            Value::Opaque(list) => {
                let pairs = list
                    .iter()
                    .map(|(k, v)| Json::Array(vec![Json::String(k.clone()), v.to_json()]))
                    .collect();
                let mut obj = serde_json::Map::new();
                obj.insert(OPAQUE_TAG.to_string(), Json::Array(pairs));
                Json::Object(obj)
            }
        }
    }

    /// Inverse of [`Value::to_json`]
    pub fn from_json(json: &Json) -> Self {
        match json {
            Json::Null => Value::Null,
            Json::Bool(b) => Value::Bool(*b),
            Json::Number(n) => Value::Number(n.as_f64().unwrap_or(0.0)),
            Json::String(s) => Value::String(s.clone()),
            Json::Array(items) => Value::Seq(items.iter().map(Value::from_json).collect()),
            Json::Object(obj) => {
                if let Some(list) = opaque_from_json(obj) {
                    return Value::Opaque(list);
                }
                Value::Map(
                    obj.iter()
                        .map(|(k, v)| (k.clone(), Value::from_json(v)))
                        .collect(),
                )
            }
        }
    }
}

/// Index of `seg` within a sequence of `len` items
fn seq_index(len: usize, seg: &str) -> Result<usize, PathError> {
    seg.parse::<usize>()
        .ok()
        .filter(|i| *i < len)
        .ok_or_else(|| out_of_range(seg, len))
}

fn out_of_range(seg: &str, len: usize) -> PathError {
    PathError::IndexOutOfRange {
        segment: seg.to_string(),
        len,
    }
}

fn not_traversable(seg: &str, node: &Value) -> PathError {
    PathError::NotTraversable {
        segment: seg.to_string(),
        kind: node.kind(),
    }
}

/// Recognize `{"__map__": [[k, v], ...]}`
fn opaque_from_json(obj: &serde_json::Map<String, Json>) -> Option<AssocList> {
    if obj.len() != 1 {
        return None;
    }
    let pairs = obj.get(OPAQUE_TAG)?.as_array()?;
    let mut list = AssocList::new();
    for pair in pairs {
        match pair.as_array().map(Vec::as_slice) {
            Some([Json::String(k), v]) => list.insert(k.clone(), Value::from_json(v)),
            _ => return None,
        };
    }
    Some(list)
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(f64::from(n))
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Value::Number(f64::from(n))
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Seq(items)
    }
}

impl From<AssocList> for Value {
    fn from(list: AssocList) -> Self {
        Value::Opaque(list)
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Value {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Value::Map(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// Insertion-ordered key/value list with unique keys
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AssocList {
    entries: Vec<(String, Value)>,
}

impl AssocList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Value> {
        self.entries.iter_mut().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Existing value for `key`, or a new one from `make` appended at the end
    pub fn get_or_insert_with(&mut self, key: &str, make: impl FnOnce() -> Value) -> &mut Value {
        let pos = match self.entries.iter().position(|(k, _)| k == key) {
            Some(pos) => pos,
            None => {
                self.entries.push((key.to_string(), make()));
                self.entries.len() - 1
            }
        };
        &mut self.entries[pos].1
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Insert or replace. Replacing keeps the original position.
    /// Returns the previous value.
    pub fn insert(&mut self, key: String, value: Value) -> Option<Value> {
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, slot)) => Some(std::mem::replace(slot, value)),
            None => {
                self.entries.push((key, value));
                None
            }
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let pos = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(pos).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.entries.iter().map(|(k, v)| (k, v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for AssocList {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut list = AssocList::new();
        for (k, v) in iter {
            list.insert(k.into(), v.into());
        }
        list
    }
}

/// Recursively merge `loaded` over `base`.
///
/// Mappings merge key by key so that keys only present in `base`
/// survive; every other combination takes the loaded value.
pub fn deep_merge(base: &Value, loaded: &Value) -> Value {
    match (base, loaded) {
        (Value::Map(base_map), Value::Map(loaded_map)) => {
            let mut merged = base_map.clone();
            for (key, value) in loaded_map {
                let next = match base_map.get(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => value.clone(),
                };
                merged.insert(key.clone(), next);
            }
            Value::Map(merged)
        }
        _ => loaded.clone(),
    }
}
