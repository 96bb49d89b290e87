//! Value graphs stored in the cache
//!
//! Lists and maps are shared handles, so one node can appear several times in
//! a graph and can contain itself. Equality, debug output and the codec all
//! track node identity instead of recursing blindly.

use crate::error::CacheError;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// A cacheable value
#[derive(Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    List(List),
    Map(Map),
}

/// Shared, mutable sequence node.
///
/// Clones share the same node. A list that (directly or indirectly) contains
/// itself is never freed, like any reference cycle of `Arc`s.
#[derive(Clone, Default)]
pub struct List(Arc<RwLock<Vec<Value>>>);

/// Shared, mutable string-keyed node with sorted keys
#[derive(Clone, Default)]
pub struct Map(Arc<RwLock<BTreeMap<String, Value>>>);

impl List {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, value: impl Into<Value>) {
        self.0.write().push(value.into());
    }

    pub fn extend(&self, values: impl IntoIterator<Item = Value>) {
        self.0.write().extend(values);
    }

    pub fn get(&self, index: usize) -> Option<Value> {
        self.0.read().get(index).cloned()
    }

    pub fn len(&self) -> usize {
        self.0.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.read().is_empty()
    }

    /// Snapshot of the current items
    pub fn to_vec(&self) -> Vec<Value> {
        self.0.read().clone()
    }

    /// Whether both handles point at the same node
    pub fn ptr_eq(&self, other: &List) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn identity(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }
}

impl Map {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.write().insert(key.into(), value.into())
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.0.read().get(key).cloned()
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.0.write().remove(key)
    }

    pub fn len(&self) -> usize {
        self.0.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.read().is_empty()
    }

    pub fn keys(&self) -> Vec<String> {
        self.0.read().keys().cloned().collect()
    }

    /// Snapshot of the current entries in key order
    pub fn entries(&self) -> Vec<(String, Value)> {
        self.0
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn ptr_eq(&self, other: &Map) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn identity(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }
}

// Dropping the last handle of a long chain would otherwise recurse once per
// level. Nested nodes that become unreachable are emptied on a heap stack.
impl Drop for List {
    fn drop(&mut self) {
        if let Some(items) = Arc::get_mut(&mut self.0) {
            release(std::mem::take(items.get_mut()));
        }
    }
}

impl Drop for Map {
    fn drop(&mut self) {
        if let Some(entries) = Arc::get_mut(&mut self.0) {
            release(std::mem::take(entries.get_mut()).into_values().collect());
        }
    }
}

fn release(mut pending: Vec<Value>) {
    while let Some(value) = pending.pop() {
        match value {
            Value::List(mut list) => {
                if let Some(items) = Arc::get_mut(&mut list.0) {
                    pending.append(items.get_mut());
                }
            }
            Value::Map(mut map) => {
                if let Some(entries) = Arc::get_mut(&mut map.0) {
                    pending.extend(std::mem::take(entries.get_mut()).into_values());
                }
            }
            _ => {}
        }
    }
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
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

    pub fn as_list(&self) -> Option<&List> {
        match self {
            Value::List(list) => Some(list),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&Map> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Convert to plain JSON, or `None` if the graph contains a cycle.
    /// Repeated (acyclic) references are duplicated.
    pub fn to_json(&self) -> Option<serde_json::Value> {
        to_json_inner(self, &mut Vec::new())
    }
}

fn to_json_inner(value: &Value, path: &mut Vec<usize>) -> Option<serde_json::Value> {
    let json = match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Number(n) => serde_json::Number::from_f64(*n)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Value::String(s) => serde_json::Value::String(s.clone()),
        Value::List(list) => {
            if path.contains(&list.identity()) {
                return None;
            }
            path.push(list.identity());
            let items = list
                .to_vec()
                .iter()
                .map(|item| to_json_inner(item, path))
                .collect::<Option<Vec<_>>>();
            path.pop();
            serde_json::Value::Array(items?)
        }
        Value::Map(map) => {
            if path.contains(&map.identity()) {
                return None;
            }
            path.push(map.identity());
            let entries = map
                .entries()
                .into_iter()
                .map(|(k, v)| to_json_inner(&v, path).map(|json| (k, json)))
                .collect::<Option<serde_json::Map<_, _>>>();
            path.pop();
            serde_json::Value::Object(entries?)
        }
    };
    Some(json)
}

/// Structural equality over possibly cyclic graphs.
///
/// Node pairs already under comparison are assumed equal, so two graphs are
/// equal when no finite walk from the roots can tell them apart.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        graph_eq(self, other)
    }
}

fn graph_eq(a: &Value, b: &Value) -> bool {
    let mut seen: HashSet<(usize, usize)> = HashSet::new();
    let mut pending = vec![(a.clone(), b.clone())];

    while let Some(pair) = pending.pop() {
        match pair {
            (Value::Null, Value::Null) => {}
            (Value::Bool(x), Value::Bool(y)) if x == y => {}
            (Value::Number(x), Value::Number(y)) if x == y => {}
            (Value::String(x), Value::String(y)) if x == y => {}
            (Value::List(x), Value::List(y)) => {
                if !seen.insert((x.identity(), y.identity())) {
                    continue;
                }
                let (xs, ys) = (x.to_vec(), y.to_vec());
                if xs.len() != ys.len() {
                    return false;
                }
                pending.extend(xs.into_iter().zip(ys));
            }
            (Value::Map(x), Value::Map(y)) => {
                if !seen.insert((x.identity(), y.identity())) {
                    continue;
                }
                let (xs, ys) = (x.entries(), y.entries());
                if xs.len() != ys.len() {
                    return false;
                }
                for ((ka, va), (kb, vb)) in xs.into_iter().zip(ys) {
                    if ka != kb {
                        return false;
                    }
                    pending.push((va, vb));
                }
            }
            _ => return false,
        }
    }
    true
}

impl PartialEq for List {
    fn eq(&self, other: &Self) -> bool {
        Value::List(self.clone()) == Value::List(other.clone())
    }
}

impl PartialEq for Map {
    fn eq(&self, other: &Self) -> bool {
        Value::Map(self.clone()) == Value::Map(other.clone())
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        debug_value(self, f, &mut Vec::new())
    }
}

impl fmt::Debug for List {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        debug_value(&Value::List(self.clone()), f, &mut Vec::new())
    }
}

impl fmt::Debug for Map {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        debug_value(&Value::Map(self.clone()), f, &mut Vec::new())
    }
}

fn debug_value(value: &Value, f: &mut fmt::Formatter<'_>, path: &mut Vec<usize>) -> fmt::Result {
    match value {
        Value::Null => write!(f, "null"),
        Value::Bool(b) => write!(f, "{}", b),
        Value::Number(n) => write!(f, "{}", n),
        Value::String(s) => write!(f, "{:?}", s),
        Value::List(list) => {
            if path.contains(&list.identity()) {
                return write!(f, "[Circular]");
            }
            path.push(list.identity());
            write!(f, "[")?;
            for (i, item) in list.to_vec().iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                debug_value(item, f, path)?;
            }
            path.pop();
            write!(f, "]")
        }
        Value::Map(map) => {
            if path.contains(&map.identity()) {
                return write!(f, "[Circular]");
            }
            path.push(map.identity());
            write!(f, "{{")?;
            for (i, (key, item)) in map.entries().iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{:?}: ", key)?;
                debug_value(item, f, path)?;
            }
            path.pop();
            write!(f, "}}")
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(n.into())
    }
}

/// Largest integer magnitude an `f64` holds exactly
pub const MAX_SAFE_INTEGER: i64 = 1 << 53;

impl TryFrom<i64> for Value {
    type Error = CacheError;

    fn try_from(n: i64) -> Result<Self, Self::Error> {
        if n.unsigned_abs() > MAX_SAFE_INTEGER as u64 {
            return Err(CacheError::Serialization(format!(
                "integer {} cannot be stored without losing precision",
                n
            )));
        }
        Ok(Value::Number(n as f64))
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Value::Number(n.into())
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

impl From<List> for Value {
    fn from(list: List) -> Self {
        Value::List(list)
    }
}

impl From<Map> for Value {
    fn from(map: Map) -> Self {
        Value::Map(map)
    }
}

impl From<Vec<Value>> for Value {
    fn from(values: Vec<Value>) -> Self {
        Value::List(List(Arc::new(RwLock::new(values))))
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => n.as_f64().map(Value::Number).unwrap_or(Value::Null),
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::from(items.into_iter().map(Value::from).collect::<Vec<_>>())
            }
            serde_json::Value::Object(entries) => {
                let map = Map::new();
                for (k, v) in entries {
                    map.insert(k, Value::from(v));
                }
                Value::Map(map)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// `{number: 1, arr: [self, self, arr], obj: self}`
    fn self_referencing_map() -> Map {
        let object = Map::new();
        object.insert("number", 1);
        let arr = List::new();
        arr.push(object.clone());
        arr.push(object.clone());
        arr.push(arr.clone());
        object.insert("arr", arr);
        object.insert("obj", object.clone());
        object
    }

    #[test]
    fn test_shared_handles_alias() {
        let list = List::new();
        let alias = list.clone();
        alias.push("a");
        assert_eq!(list.len(), 1);
        assert!(list.ptr_eq(&alias));
        assert!(!list.ptr_eq(&List::new()));
    }

    #[test]
    fn test_equality_on_cyclic_graphs_terminates() {
        let a = Value::Map(self_referencing_map());
        let b = Value::Map(self_referencing_map());
        assert_eq!(a, b);

        let c = self_referencing_map();
        c.insert("number", 2);
        assert_ne!(a, Value::Map(c));
    }

    #[test]
    fn test_debug_marks_cycles() {
        let list = List::new();
        list.push(1);
        list.push(list.clone());
        assert_eq!(format!("{:?}", list), "[1, [Circular]]");
    }

    #[test]
    fn test_debug_allows_repeated_acyclic_refs() {
        let shared = List::new();
        shared.push("x");
        let outer = List::new();
        outer.push(shared.clone());
        outer.push(shared);
        assert_eq!(format!("{:?}", outer), r#"[["x"], ["x"]]"#);
    }

    #[test]
    fn test_json_conversion() {
        let value = Value::from(json!({"a": [1, "two", null], "b": true}));
        let map = value.as_map().unwrap();
        assert_eq!(map.keys(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(map.get("b").and_then(|v| v.as_bool()), Some(true));
        assert_eq!(
            value.to_json(),
            Some(json!({"a": [1.0, "two", null], "b": true}))
        );
    }

    #[test]
    fn test_to_json_rejects_cycles() {
        assert!(Value::Map(self_referencing_map()).to_json().is_none());
    }

    fn nested_lists(depth: usize) -> List {
        let root = List::new();
        let mut tail = root.clone();
        for _ in 0..depth {
            let next = List::new();
            tail.push(next.clone());
            tail = next;
        }
        root
    }

    #[test]
    fn test_deep_chains_compare_and_drop() {
        let a = Value::List(nested_lists(100_000));
        let b = Value::List(nested_lists(100_000));
        assert!(a == b);
        assert!(a != Value::List(nested_lists(99_999)));

        let map = Map::new();
        map.insert("next", a);
        drop(b);
        drop(map);
    }

    #[test]
    fn test_integers_beyond_f64_precision_are_rejected() {
        assert_eq!(
            Value::try_from(MAX_SAFE_INTEGER).unwrap().as_f64(),
            Some(9_007_199_254_740_992.0)
        );
        assert!(Value::try_from(-MAX_SAFE_INTEGER).is_ok());
        assert!(matches!(
            Value::try_from(MAX_SAFE_INTEGER + 1),
            Err(CacheError::Serialization(_))
        ));
        assert!(Value::try_from(i64::MIN).is_err());
    }

    #[test]
    fn test_accessors() {
        assert_eq!(Value::from("s").as_str(), Some("s"));
        assert_eq!(Value::from(3).as_f64(), Some(3.0));
        assert!(Value::Null.is_null());
        assert!(Value::from(true).as_list().is_none());
    }
}
