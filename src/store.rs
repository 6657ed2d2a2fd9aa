//! Path-addressed JSON store shared by every device of every household.
//!
//! The store is last-writer-wins per path: there is no compare-and-swap, and
//! callers that need an invariant re-read right before they write. Paths are
//! `/`-separated; writing `null` removes a node and prunes empty parents, and
//! reading a parent returns the assembled subtree.

use serde_json::{Map, Value};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use thiserror::Error;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("store offline")]
    Offline,

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("store lock poisoned")]
    Poisoned,

    #[error("store io: {0}")]
    Io(String),
}

pub fn meta_path(code: &str) -> String {
    format!("households/{}/meta", code)
}

pub fn members_path(code: &str) -> String {
    format!("households/{}/members", code)
}

pub fn member_path(code: &str, member_id: &str) -> String {
    format!("households/{}/members/{}", code, member_id)
}

pub fn status_path(code: &str) -> String {
    format!("households/{}/status", code)
}

pub fn reminders_path(code: &str) -> String {
    format!("households/{}/reminders", code)
}

pub fn reminder_path(code: &str, reminder_id: &str) -> String {
    format!("households/{}/reminders/{}", code, reminder_id)
}

pub fn contacts_path(code: &str) -> String {
    format!("households/{}/contacts", code)
}

pub fn contact_path(code: &str, contact_id: &str) -> String {
    format!("households/{}/contacts/{}", code, contact_id)
}

pub fn phone_index_path(phone: &str) -> String {
    format!("phoneIndex/{}", phone)
}

pub const HOUSEHOLDS_ROOT: &str = "households";

/// Live subscription to one path. Every write touching the path delivers the
/// value found there afterwards (`None` once removed).
pub struct StoreSubscription {
    pub id: u64,
    pub path: String,
    rx: UnboundedReceiver<Option<Value>>,
}

impl StoreSubscription {
    pub async fn recv(&mut self) -> Option<Option<Value>> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Option<Value>> {
        self.rx.try_recv().ok()
    }
}

pub trait SharedStore: Send + Sync + 'static {
    fn get(&self, path: &str) -> Result<Option<Value>, StoreError>;

    fn set(&self, path: &str, value: Value) -> Result<(), StoreError>;

    fn remove(&self, path: &str) -> Result<(), StoreError> {
        self.set(path, Value::Null)
    }

    /// Keys directly under `path`, sorted.
    fn children(&self, path: &str) -> Result<Vec<String>, StoreError>;

    /// Subscribes and immediately delivers the current value.
    fn subscribe(&self, path: &str) -> Result<StoreSubscription, StoreError>;

    fn unsubscribe(&self, id: u64);
}

struct Watcher {
    id: u64,
    segments: Vec<String>,
    tx: UnboundedSender<Option<Value>>,
}

struct StoreInner {
    root: Value,
    watchers: Vec<Watcher>,
}

/// In-process implementation of [`SharedStore`], with offline injection.
pub struct MemoryStore {
    inner: Mutex<StoreInner>,
    offline: AtomicBool,
    next_watcher_id: AtomicU64,
    write_count: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_root(Value::Object(Map::new()))
    }

    fn with_root(root: Value) -> Self {
        MemoryStore {
            inner: Mutex::new(StoreInner {
                root,
                watchers: Vec::new(),
            }),
            offline: AtomicBool::new(false),
            next_watcher_id: AtomicU64::new(1),
            write_count: AtomicU64::new(0),
        }
    }

    /// Simulates a network partition: every call fails until cleared.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn is_offline(&self) -> bool {
        self.offline.load(Ordering::SeqCst)
    }

    /// Successful writes since creation.
    pub fn write_count(&self) -> u64 {
        self.write_count.load(Ordering::SeqCst)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), StoreError> {
        let inner = self.inner.lock().map_err(|_| StoreError::Poisoned)?;
        let json =
            serde_json::to_string_pretty(&inner.root).map_err(|e| StoreError::Io(e.to_string()))?;
        fs::write(path, json).map_err(|e| StoreError::Io(e.to_string()))?;
        Ok(())
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let text = fs::read_to_string(path).map_err(|e| StoreError::Io(e.to_string()))?;
        let root: Value = serde_json::from_str(&text).map_err(|e| StoreError::Io(e.to_string()))?;
        if !root.is_object() {
            return Err(StoreError::Io("store root must be an object".to_string()));
        }
        Ok(Self::with_root(root))
    }

    fn check_online(&self) -> Result<(), StoreError> {
        if self.is_offline() {
            Err(StoreError::Offline)
        } else {
            Ok(())
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn split_path(path: &str) -> Result<Vec<String>, StoreError> {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        return Err(StoreError::InvalidPath(path.to_string()));
    }
    let segments: Vec<String> = trimmed.split('/').map(str::to_string).collect();
    if segments.iter().any(|s| s.is_empty()) {
        return Err(StoreError::InvalidPath(path.to_string()));
    }
    Ok(segments)
}

fn lookup<'a>(root: &'a Value, segments: &[String]) -> Option<&'a Value> {
    let mut node = root;
    for segment in segments {
        node = node.as_object()?.get(segment)?;
    }
    Some(node)
}

fn is_empty_node(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

fn insert(root: &mut Value, segments: &[String], value: Value) {
    let mut node = root;
    for segment in &segments[..segments.len() - 1] {
        if !node.is_object() {
            *node = Value::Object(Map::new());
        }
        node = match node {
            Value::Object(map) => map
                .entry(segment.clone())
                .or_insert_with(|| Value::Object(Map::new())),
            _ => return,
        };
    }
    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    if let (Value::Object(map), Some(last)) = (node, segments.last()) {
        map.insert(last.clone(), value);
    }
}

/// Removes the node at `segments` and prunes parents left empty.
fn delete(node: &mut Value, segments: &[String]) {
    let Some((first, rest)) = segments.split_first() else {
        return;
    };
    let Value::Object(map) = node else { return };
    if rest.is_empty() {
        map.remove(first);
        return;
    }
    let prune = match map.get_mut(first) {
        Some(child) => {
            delete(child, rest);
            is_empty_node(child)
        }
        None => false,
    };
    if prune {
        map.remove(first);
    }
}

fn related(a: &[String], b: &[String]) -> bool {
    let n = a.len().min(b.len());
    a[..n] == b[..n]
}

impl SharedStore for MemoryStore {
    fn get(&self, path: &str) -> Result<Option<Value>, StoreError> {
        self.check_online()?;
        let segments = split_path(path)?;
        let inner = self.inner.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(lookup(&inner.root, &segments).cloned())
    }

    fn set(&self, path: &str, value: Value) -> Result<(), StoreError> {
        self.check_online()?;
        let segments = split_path(path)?;
        let mut inner = self.inner.lock().map_err(|_| StoreError::Poisoned)?;

        if is_empty_node(&value) {
            delete(&mut inner.root, &segments);
        } else {
            insert(&mut inner.root, &segments, value);
        }
        self.write_count.fetch_add(1, Ordering::SeqCst);

        let StoreInner { root, watchers } = &mut *inner;
        watchers.retain(|watcher| {
            if !related(&watcher.segments, &segments) {
                return true;
            }
            let current = lookup(root, &watcher.segments).cloned();
            watcher.tx.send(current).is_ok()
        });
        Ok(())
    }

    fn children(&self, path: &str) -> Result<Vec<String>, StoreError> {
        self.check_online()?;
        let segments = split_path(path)?;
        let inner = self.inner.lock().map_err(|_| StoreError::Poisoned)?;
        let mut keys: Vec<String> = lookup(&inner.root, &segments)
            .and_then(Value::as_object)
            .map(|map| map.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        Ok(keys)
    }

    fn subscribe(&self, path: &str) -> Result<StoreSubscription, StoreError> {
        self.check_online()?;
        let segments = split_path(path)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_watcher_id.fetch_add(1, Ordering::SeqCst);

        let mut inner = self.inner.lock().map_err(|_| StoreError::Poisoned)?;
        let current = lookup(&inner.root, &segments).cloned();
        // Receiver is still held below, so this cannot fail.
        let _ = tx.send(current);
        inner.watchers.push(Watcher {
            id,
            segments,
            tx,
        });

        Ok(StoreSubscription {
            id,
            path: path.to_string(),
            rx,
        })
    }

    fn unsubscribe(&self, id: u64) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.watchers.retain(|w| w.id != id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_set_get_nested() {
        let store = MemoryStore::new();
        store
            .set("households/HOME1/members/u1", json!({"name": "Alice"}))
            .unwrap();

        let member = store.get("households/HOME1/members/u1").unwrap().unwrap();
        assert_eq!(member["name"], "Alice");

        let members = store.get("households/HOME1/members").unwrap().unwrap();
        assert!(members.get("u1").is_some());
        assert_eq!(store.children("households").unwrap(), vec!["HOME1"]);
        assert!(store.get("households/NOPE").unwrap().is_none());
    }

    #[test]
    fn test_null_removes_and_prunes() {
        let store = MemoryStore::new();
        store.set("phoneIndex/5551234567", json!("HOME1")).unwrap();
        store.remove("phoneIndex/5551234567").unwrap();
        assert!(store.get("phoneIndex/5551234567").unwrap().is_none());
        assert!(store.get("phoneIndex").unwrap().is_none());
    }

    #[test]
    fn test_offline_rejects_calls() {
        let store = MemoryStore::new();
        store.set_offline(true);
        assert_eq!(store.set("a/b", json!(1)), Err(StoreError::Offline));
        assert_eq!(store.get("a/b"), Err(StoreError::Offline));

        store.set_offline(false);
        store.set("a/b", json!(1)).unwrap();
        assert_eq!(store.write_count(), 1);
    }

    #[test]
    fn test_invalid_path() {
        let store = MemoryStore::new();
        assert!(matches!(store.get(""), Err(StoreError::InvalidPath(_))));
        assert!(matches!(store.get("a//b"), Err(StoreError::InvalidPath(_))));
    }

    #[test]
    fn test_subscription_sees_related_writes_only() {
        let store = MemoryStore::new();
        let mut sub = store.subscribe("households/HOME1/status").unwrap();
        assert_eq!(sub.try_recv(), Some(None));

        store
            .set("households/HOME1/status", json!({"status": "Normal"}))
            .unwrap();
        store.set("households/OTHER/status", json!({"status": "Normal"})).unwrap();
        store
            .set("households/HOME1/status/status", json!("FallDetected"))
            .unwrap();

        let first = sub.try_recv().unwrap().unwrap();
        assert_eq!(first["status"], "Normal");
        let second = sub.try_recv().unwrap().unwrap();
        assert_eq!(second["status"], "FallDetected");
        assert!(sub.try_recv().is_none());

        store.unsubscribe(sub.id);
        store.set("households/HOME1/status", json!({"status": "Normal"})).unwrap();
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn test_save_and_load_roundtrip_file() {
        let store = MemoryStore::new();
        store.set("households/HOME1/meta/role", json!("SENIOR")).unwrap();

        let path = std::env::temp_dir().join(format!("safenest_store_{}.json", std::process::id()));
        store.save_to_file(&path).unwrap();
        let loaded = MemoryStore::load_from_file(&path).unwrap();
        let _ = std::fs::remove_file(&path);

        assert_eq!(
            loaded.get("households/HOME1/meta/role").unwrap(),
            Some(json!("SENIOR"))
        );
    }
}
