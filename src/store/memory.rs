//! In-process document store
//!
//! A JSON tree behind a `tokio` lock with broadcast change notification. Used
//! by tests and by `safecare-admin` to operate on exported store snapshots.
//!
//! Null values and empty objects are never stored: writing one deletes the
//! node, and removing the last child of an object removes the object too.
//! Writing below an array turns it into an object keyed by index.

use super::{ChangeKind, DocumentStore, FieldUpdates, StoreEvent, Subscription};
use crate::error::{StoreError, StoreResult};
use crate::model::EntryId;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::path::Path;
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

const EVENT_CAPACITY: usize = 256;

pub struct MemoryStore {
    root: RwLock<Value>,
    events: broadcast::Sender<StoreEvent>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::from_snapshot(Value::Object(Map::new()))
    }

    /// Create a store holding `snapshot` as its root
    pub fn from_snapshot(snapshot: Value) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let root = normalize(snapshot).unwrap_or_else(|| Value::Object(Map::new()));
        Self {
            root: RwLock::new(root),
            events,
        }
    }

    /// Copy of the whole tree
    pub async fn snapshot(&self) -> Value {
        self.root.read().await.clone()
    }

    /// Load a JSON snapshot file
    pub async fn load_snapshot(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| StoreError::Unavailable(format!("{}: {}", path.display(), e)))?;
        let value: Value = serde_json::from_slice(&bytes)?;
        debug!(path = %path.display(), "Snapshot loaded");
        Ok(Self::from_snapshot(value))
    }

    /// Write the tree to a JSON snapshot file
    pub async fn save_snapshot(&self, path: impl AsRef<Path>) -> StoreResult<()> {
        let path = path.as_ref();
        let bytes = serde_json::to_vec_pretty(&*self.root.read().await)?;
        tokio::fs::write(path, bytes)
            .await
            .map_err(|e| StoreError::Unavailable(format!("{}: {}", path.display(), e)))?;
        debug!(path = %path.display(), "Snapshot saved");
        Ok(())
    }

    fn notify(&self, path: &str, kind: ChangeKind) {
        // No receivers is not an error
        let _ = self.events.send(StoreEvent {
            path: path.to_string(),
            kind,
        });
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, path: &str) -> StoreResult<Option<Value>> {
        let segs = segments(path)?;
        let root = self.root.read().await;
        Ok(lookup(&root, &segs).cloned())
    }

    async fn set(&self, path: &str, value: Value) -> StoreResult<()> {
        let segs = segments(path)?;
        {
            let mut root = self.root.write().await;
            write_at(&mut root, &segs, value, path)?;
        }
        self.notify(path, ChangeKind::Set);
        Ok(())
    }

    async fn update(&self, path: &str, patch: FieldUpdates) -> StoreResult<()> {
        let base = segments(path)?;
        let mut targets = Vec::with_capacity(patch.len());
        for (key, value) in patch {
            let mut segs: Vec<String> = base.iter().map(|s| s.to_string()).collect();
            segs.extend(segments(&key)?.into_iter().map(str::to_string));
            if segs.len() == base.len() {
                return Err(StoreError::InvalidPath(format!("{path}: empty patch key")));
            }
            targets.push((segs, value));
        }
        {
            let mut root = self.root.write().await;
            for (segs, _) in &targets {
                let segs: Vec<&str> = segs.iter().map(String::as_str).collect();
                check_writable(&root, &segs, path)?;
            }
            for (segs, value) in targets {
                let segs: Vec<&str> = segs.iter().map(String::as_str).collect();
                write_at(&mut root, &segs, value, path)?;
            }
        }
        self.notify(path, ChangeKind::Updated);
        Ok(())
    }

    async fn set_if_absent(&self, path: &str, value: Value) -> StoreResult<bool> {
        let segs = segments(path)?;
        {
            let mut root = self.root.write().await;
            if lookup(&root, &segs).is_some() {
                return Ok(false);
            }
            write_at(&mut root, &segs, value, path)?;
        }
        self.notify(path, ChangeKind::Set);
        Ok(true)
    }

    async fn push(&self, path: &str, value: Value) -> StoreResult<String> {
        let key = EntryId::generate().into_inner();
        let full = super::join(path, &key);
        self.set(&full, value).await?;
        Ok(key)
    }

    async fn remove(&self, path: &str) -> StoreResult<()> {
        let segs = segments(path)?;
        {
            let mut root = self.root.write().await;
            remove_at(&mut root, &segs);
            if root.is_null() {
                *root = Value::Object(Map::new());
            }
        }
        self.notify(path, ChangeKind::Removed);
        Ok(())
    }

    async fn child_keys(&self, path: &str) -> StoreResult<Vec<String>> {
        let segs = segments(path)?;
        let root = self.root.read().await;
        let mut keys: Vec<String> = match lookup(&root, &segs) {
            Some(Value::Object(map)) => map.keys().cloned().collect(),
            Some(Value::Array(items)) => items
                .iter()
                .enumerate()
                .filter(|(_, v)| !v.is_null())
                .map(|(i, _)| i.to_string())
                .collect(),
            _ => Vec::new(),
        };
        keys.sort();
        Ok(keys)
    }

    fn subscribe(&self, path: &str) -> StoreResult<Subscription> {
        segments(path)?;
        Ok(Subscription::new(path, self.events.subscribe()))
    }
}

/// Split a key path. The empty path addresses the root; empty segments are rejected.
fn segments(path: &str) -> StoreResult<Vec<&str>> {
    if path.is_empty() {
        return Ok(Vec::new());
    }
    let segs: Vec<&str> = path.split('/').collect();
    if segs.iter().any(|s| s.trim().is_empty()) {
        return Err(StoreError::InvalidPath(path.to_string()));
    }
    Ok(segs)
}

fn lookup<'a>(node: &'a Value, segs: &[&str]) -> Option<&'a Value> {
    let mut cur = node;
    for seg in segs {
        cur = match cur {
            Value::Object(map) => map.get(*seg)?,
            Value::Array(items) => items.get(seg.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    if cur.is_null() {
        None
    } else {
        Some(cur)
    }
}

/// Existing scalar intermediates cannot be written through
fn check_writable(node: &Value, segs: &[&str], full: &str) -> StoreResult<()> {
    let Some((_, parents)) = segs.split_last() else {
        return Ok(());
    };
    let mut cur = node;
    for seg in parents {
        let next = match cur {
            Value::Object(map) => map.get(*seg),
            Value::Array(items) => seg.parse::<usize>().ok().and_then(|i| items.get(i)),
            Value::Null => return Ok(()),
            _ => return Err(StoreError::Conflict(full.to_string())),
        };
        match next {
            Some(next) => cur = next,
            None => return Ok(()),
        }
    }
    match cur {
        Value::Object(_) | Value::Array(_) | Value::Null => Ok(()),
        _ => Err(StoreError::Conflict(full.to_string())),
    }
}

fn write_at(root: &mut Value, segs: &[&str], value: Value, full: &str) -> StoreResult<()> {
    let Some(value) = normalize(value) else {
        remove_at(root, segs);
        if root.is_null() {
            *root = Value::Object(Map::new());
        }
        return Ok(());
    };
    check_writable(root, segs, full)?;
    let Some((last, parents)) = segs.split_last() else {
        *root = value;
        return Ok(());
    };
    let mut cur = root;
    for seg in parents {
        key_by_index(cur);
        cur = cur
            .as_object_mut()
            .ok_or_else(|| StoreError::Conflict(full.to_string()))?
            .entry(seg.to_string())
            .or_insert(Value::Null);
    }
    key_by_index(cur);
    cur.as_object_mut()
        .ok_or_else(|| StoreError::Conflict(full.to_string()))?
        .insert(last.to_string(), value);
    Ok(())
}

/// Make `node` an object: null becomes empty, an array is keyed by index
fn key_by_index(node: &mut Value) {
    match node {
        Value::Null => *node = Value::Object(Map::new()),
        Value::Array(items) => {
            let keyed: Map<String, Value> = std::mem::take(items)
                .into_iter()
                .enumerate()
                .filter(|(_, item)| !item.is_null())
                .map(|(index, item)| (index.to_string(), item))
                .collect();
            *node = Value::Object(keyed);
        }
        _ => {}
    }
}

/// Remove the node at `segs`, pruning ancestors left empty. Returns whether a node was removed.
fn remove_at(node: &mut Value, segs: &[&str]) -> bool {
    match segs {
        [] => {
            let existed = !node.is_null();
            *node = Value::Null;
            existed
        }
        [last] => {
            if node.is_array() {
                key_by_index(node);
            }
            node.as_object_mut()
                .map(|map| map.remove(*last).is_some())
                .unwrap_or(false)
        }
        [first, rest @ ..] => {
            if node.is_array() {
                key_by_index(node);
            }
            let Some(map) = node.as_object_mut() else {
                return false;
            };
            let Some(child) = map.get_mut(*first) else {
                return false;
            };
            let removed = remove_at(child, rest);
            let now_empty = child.is_null() || child.as_object().map_or(false, Map::is_empty);
            if now_empty {
                map.remove(*first);
            }
            removed
        }
    }
}

/// Drop nulls and empty objects. `None` when nothing storable remains.
fn normalize(value: Value) -> Option<Value> {
    match value {
        Value::Null => None,
        Value::Object(map) => {
            let cleaned: Map<String, Value> = map
                .into_iter()
                .filter_map(|(k, v)| normalize(v).map(|v| (k, v)))
                .collect();
            if cleaned.is_empty() {
                None
            } else {
                Some(Value::Object(cleaned))
            }
        }
        other => Some(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_set_get_remove() {
        let store = MemoryStore::new();
        store.set("a/b/c", json!(1)).await.unwrap();
        assert_eq!(store.get("a/b/c").await.unwrap(), Some(json!(1)));
        assert_eq!(store.get("a").await.unwrap(), Some(json!({"b": {"c": 1}})));

        store.remove("a/b/c").await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), None);
        assert_eq!(store.snapshot().await, json!({}));

        // removing a missing path succeeds
        store.remove("nope/nothing").await.unwrap();
    }

    #[tokio::test]
    async fn test_update_is_partial() {
        let store = MemoryStore::new();
        store
            .set("p/1", json!({"name": "Old", "phone": "555", "glucose": {"m1": {"value": 90}}}))
            .await
            .unwrap();

        let mut patch = FieldUpdates::new();
        patch.insert("name".into(), json!("New"));
        patch.insert("phone".into(), Value::Null);
        patch.insert("glucose/m1/value".into(), json!(100));
        store.update("p/1", patch).await.unwrap();

        assert_eq!(
            store.get("p/1").await.unwrap(),
            Some(json!({"name": "New", "glucose": {"m1": {"value": 100}}}))
        );
    }

    #[tokio::test]
    async fn test_push_generates_distinct_keys() {
        let store = MemoryStore::new();
        let k1 = store.push("list", json!({"v": 1})).await.unwrap();
        let k2 = store.push("list", json!({"v": 2})).await.unwrap();
        assert_ne!(k1, k2);
        let mut expected = vec![k1, k2];
        expected.sort();
        assert_eq!(store.child_keys("list").await.unwrap(), expected);
    }

    #[tokio::test]
    async fn test_set_if_absent_keeps_first_value() {
        let store = MemoryStore::new();
        assert!(store.set_if_absent("claims/42", json!("p1")).await.unwrap());
        assert!(!store.set_if_absent("claims/42", json!("p2")).await.unwrap());
        assert_eq!(store.get("claims/42").await.unwrap(), Some(json!("p1")));
    }

    #[tokio::test]
    async fn test_write_through_scalar_conflicts() {
        let store = MemoryStore::new();
        store.set("idx/a/p", json!(true)).await.unwrap();
        let err = store.set("idx/a/p/x", json!(1)).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        assert!(matches!(store.get("a//b").await, Err(StoreError::InvalidPath(_))));
    }

    #[tokio::test]
    async fn test_write_below_array_keys_it_by_index() {
        let store = MemoryStore::new();
        store.set("p/meds", json!([{"n": "A"}, null, {"n": "C"}])).await.unwrap();
        assert_eq!(store.get("p/meds/2/n").await.unwrap(), Some(json!("C")));

        let mut patch = FieldUpdates::new();
        patch.insert("new".into(), json!({"n": "D"}));
        store.update("p/meds", patch).await.unwrap();
        assert_eq!(
            store.get("p/meds").await.unwrap(),
            Some(json!({"0": {"n": "A"}, "2": {"n": "C"}, "new": {"n": "D"}}))
        );

        store.set("p/list", json!(["x", "y"])).await.unwrap();
        store.remove("p/list/0").await.unwrap();
        assert_eq!(store.get("p/list").await.unwrap(), Some(json!({"1": "y"})));
    }

    #[tokio::test]
    async fn test_subscription_sees_nested_changes() {
        let store = MemoryStore::new();
        let mut sub = store.subscribe("patientsGlobal/p1").unwrap();
        store.set("patientsGlobal/p2/name", json!("other")).await.unwrap();
        store.set("patientsGlobal/p1/name", json!("mine")).await.unwrap();

        let event = sub.next().await.unwrap();
        assert_eq!(event.path, "patientsGlobal/p1/name");
        assert_eq!(event.kind, ChangeKind::Set);
    }

    #[tokio::test]
    async fn test_snapshot_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("store.json");

        let store = MemoryStore::new();
        store.set("accessIndex/a/p", json!(true)).await.unwrap();
        store.save_snapshot(&file).await.unwrap();

        let loaded = MemoryStore::load_snapshot(&file).await.unwrap();
        assert_eq!(loaded.get("accessIndex/a/p").await.unwrap(), Some(json!(true)));
    }
}
