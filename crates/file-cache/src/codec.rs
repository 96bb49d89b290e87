//! On-disk entry format
//!
//! An entry file is a JSON record carrying the key, write and expiry
//! timestamps, and the value as a node table. Every list and map in the value
//! is written once and referenced by index, so shared and cyclic references
//! survive a round trip.

use crate::error::{CacheError, Result};
use crate::value::{List, Map, Value};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// A decoded cache entry
#[derive(Debug, Clone)]
pub struct Entry {
    /// Logical key, kept for debugging only
    pub key: String,
    /// Write time in milliseconds since the epoch
    pub retrieved_at: i64,
    /// Expiry time in milliseconds since the epoch
    pub expires_at: i64,
    pub value: Value,
}

impl Entry {
    pub fn is_valid_at(&self, now_ms: i64) -> bool {
        self.expires_at > now_ms
    }
}

/// Stored bytes could not be turned back into an entry
#[derive(Debug)]
pub enum DecodeError {
    Malformed(serde_json::Error),
    DanglingReference(usize),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::Malformed(err) => write!(f, "Malformed entry: {}", err),
            DecodeError::DanglingReference(id) => {
                write!(f, "Entry references missing node {}", id)
            }
        }
    }
}

impl std::error::Error for DecodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DecodeError::Malformed(err) => Some(err),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for DecodeError {
    fn from(err: serde_json::Error) -> Self {
        DecodeError::Malformed(err)
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum Slot {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Ref(usize),
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum Node {
    List(Vec<Slot>),
    Map(BTreeMap<String, Slot>),
}

#[derive(Debug, Serialize, Deserialize)]
struct Graph {
    root: Slot,
    nodes: Vec<Node>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct Record {
    key: String,
    retrieved_at: i64,
    expires_at: i64,
    value: Graph,
}

pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Serialize `value` as an entry written at `now_ms` that lives `ttl_secs`
pub fn encode(key: &str, ttl_secs: u64, value: &Value, now_ms: i64) -> Result<Vec<u8>> {
    let ttl_ms = i64::try_from(ttl_secs)
        .unwrap_or(i64::MAX)
        .saturating_mul(1000);
    let record = Record {
        key: key.to_string(),
        retrieved_at: now_ms,
        expires_at: now_ms.saturating_add(ttl_ms),
        value: GraphWriter::default().finish(value)?,
    };
    serde_json::to_vec(&record).map_err(|e| CacheError::Serialization(e.to_string()))
}

pub fn decode(bytes: &[u8]) -> std::result::Result<Entry, DecodeError> {
    let record: Record = serde_json::from_slice(bytes)?;
    Ok(Entry {
        key: record.key,
        retrieved_at: record.retrieved_at,
        expires_at: record.expires_at,
        value: record.value.into_value()?,
    })
}

/// A list or map that has an id but whose children are not written yet
enum Open {
    List(usize, List),
    Map(usize, Map),
}

/// Assigns node ids by handle identity while walking the graph.
///
/// The walk uses an explicit work list, so nesting depth is bounded by the
/// heap rather than the call stack.
#[derive(Default)]
struct GraphWriter {
    ids: HashMap<usize, usize>,
    nodes: Vec<Option<Node>>,
    open: Vec<Open>,
}

impl GraphWriter {
    fn finish(mut self, value: &Value) -> Result<Graph> {
        let root = self.slot(value)?;

        while let Some(open) = self.open.pop() {
            let (id, node) = match open {
                Open::List(id, list) => {
                    let items = list
                        .to_vec()
                        .iter()
                        .map(|item| self.slot(item))
                        .collect::<Result<Vec<_>>>()?;
                    (id, Node::List(items))
                }
                Open::Map(id, map) => {
                    let mut entries = BTreeMap::new();
                    for (key, item) in map.entries() {
                        entries.insert(key, self.slot(&item)?);
                    }
                    (id, Node::Map(entries))
                }
            };
            self.nodes[id] = Some(node);
        }

        // Every reserved node is filled once the work list drains.
        let nodes = self.nodes.into_iter().flatten().collect();
        Ok(Graph { root, nodes })
    }

    /// Id for a handle, reserving one the first time it is seen
    fn node_id(&mut self, identity: usize) -> (usize, bool) {
        if let Some(&id) = self.ids.get(&identity) {
            return (id, false);
        }
        let id = self.nodes.len();
        self.nodes.push(None);
        self.ids.insert(identity, id);
        (id, true)
    }

    fn slot(&mut self, value: &Value) -> Result<Slot> {
        let slot = match value {
            Value::Null => Slot::Null,
            Value::Bool(b) => Slot::Bool(*b),
            Value::Number(n) if n.is_finite() => Slot::Number(*n),
            Value::Number(n) => {
                return Err(CacheError::Serialization(format!(
                    "cannot store non-finite number {}",
                    n
                )))
            }
            Value::String(s) => Slot::String(s.clone()),
            Value::List(list) => {
                let (id, new) = self.node_id(list.identity());
                if new {
                    self.open.push(Open::List(id, list.clone()));
                }
                Slot::Ref(id)
            }
            Value::Map(map) => {
                let (id, new) = self.node_id(map.identity());
                if new {
                    self.open.push(Open::Map(id, map.clone()));
                }
                Slot::Ref(id)
            }
        };
        Ok(slot)
    }
}

impl Graph {
    /// Rebuild the value, allocating every node up front so references can
    /// point forwards, backwards, or at the node being filled.
    fn into_value(self) -> std::result::Result<Value, DecodeError> {
        let shells: Vec<Value> = self
            .nodes
            .iter()
            .map(|node| match node {
                Node::List(_) => Value::List(List::new()),
                Node::Map(_) => Value::Map(Map::new()),
            })
            .collect();

        let resolve = |slot: Slot| -> std::result::Result<Value, DecodeError> {
            Ok(match slot {
                Slot::Null => Value::Null,
                Slot::Bool(b) => Value::Bool(b),
                Slot::Number(n) => Value::Number(n),
                Slot::String(s) => Value::String(s),
                Slot::Ref(id) => shells
                    .get(id)
                    .cloned()
                    .ok_or(DecodeError::DanglingReference(id))?,
            })
        };

        for (node, shell) in self.nodes.into_iter().zip(&shells) {
            match (node, shell) {
                (Node::List(slots), Value::List(list)) => {
                    let items = slots
                        .into_iter()
                        .map(&resolve)
                        .collect::<std::result::Result<Vec<_>, _>>()?;
                    list.extend(items);
                }
                (Node::Map(slots), Value::Map(map)) => {
                    for (key, slot) in slots {
                        map.insert(key, resolve(slot)?);
                    }
                }
                _ => {}
            }
        }

        resolve(self.root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_700_000_000_000;

    #[test]
    fn test_encode_sets_timestamps() {
        let bytes = encode("k", 60, &Value::from("v"), NOW).unwrap();
        let entry = decode(&bytes).unwrap();

        assert_eq!(entry.key, "k");
        assert_eq!(entry.retrieved_at, NOW);
        assert_eq!(entry.expires_at, NOW + 60_000);
        assert_eq!(entry.value, Value::from("v"));
    }

    #[test]
    fn test_validity_window() {
        let entry = decode(&encode("k", 1, &Value::Null, NOW).unwrap()).unwrap();
        assert!(entry.is_valid_at(NOW));
        assert!(entry.is_valid_at(NOW + 999));
        assert!(!entry.is_valid_at(NOW + 1000));
    }

    #[test]
    fn test_huge_ttl_saturates() {
        let entry = decode(&encode("k", u64::MAX, &Value::Null, NOW).unwrap()).unwrap();
        assert_eq!(entry.expires_at, i64::MAX);
    }

    #[test]
    fn test_cycles_and_shared_refs_are_rebuilt() {
        let object = Map::new();
        object.insert("number", 1);
        let arr = List::new();
        arr.push(object.clone());
        arr.push(object.clone());
        arr.push(arr.clone());
        object.insert("arr", arr);
        object.insert("obj", object.clone());

        let original = Value::Map(object);
        let entry = decode(&encode("k", 60, &original, NOW).unwrap()).unwrap();
        assert_eq!(entry.value, original);

        let root = entry.value.as_map().unwrap();
        let obj = root.get("obj").unwrap();
        assert!(obj.as_map().unwrap().ptr_eq(root));

        let arr = root.get("arr").unwrap();
        let arr = arr.as_list().unwrap();
        assert!(arr.get(0).unwrap().as_map().unwrap().ptr_eq(root));
        assert!(arr.get(2).unwrap().as_list().unwrap().ptr_eq(arr));
    }

    #[test]
    fn test_shared_node_written_once() {
        let shared = List::new();
        shared.push("x");
        let outer = List::new();
        outer.push(shared.clone());
        outer.push(shared);

        let bytes = encode("k", 60, &Value::List(outer), NOW).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["value"]["nodes"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_deeply_nested_lists_round_trip() {
        const DEPTH: usize = 100_000;

        let root = List::new();
        let mut tail = root.clone();
        for _ in 0..DEPTH {
            let next = List::new();
            tail.push(next.clone());
            tail = next;
        }
        tail.push("bottom");

        let original = Value::List(root);
        let bytes = encode("k", 60, &original, NOW).unwrap();
        let entry = decode(&bytes).unwrap();
        assert_eq!(entry.value, original);

        let mut current = entry.value;
        for _ in 0..DEPTH {
            current = current.as_list().unwrap().get(0).unwrap();
        }
        let bottom = current.as_list().unwrap().get(0).unwrap();
        assert_eq!(bottom.as_str(), Some("bottom"));
    }

    #[test]
    fn test_newlines_round_trip() {
        let entry = decode(&encode("k", 60, &Value::from("foo\nbar"), NOW).unwrap()).unwrap();
        assert_eq!(entry.value.as_str(), Some("foo\nbar"));
    }

    #[test]
    fn test_non_finite_number_is_serialization_error() {
        let list = List::new();
        list.push(f64::NAN);
        let result = encode("k", 60, &Value::List(list), NOW);
        assert!(matches!(result, Err(CacheError::Serialization(_))));
    }

    #[test]
    fn test_corrupt_bytes_are_decode_errors() {
        assert!(matches!(decode(b"corrupt"), Err(DecodeError::Malformed(_))));
        assert!(decode(b"").is_err());

        let bytes = encode("k", 60, &Value::from("v"), NOW).unwrap();
        assert!(decode(&bytes[..bytes.len() / 2]).is_err());
    }

    #[test]
    fn test_dangling_reference_is_decode_error() {
        let bytes = br#"{"key":"k","retrieved_at":0,"expires_at":1,"value":{"root":{"ref":3},"nodes":[]}}"#;
        assert!(matches!(
            decode(bytes),
            Err(DecodeError::DanglingReference(3))
        ));
    }
}
