//! In-memory address space for exercising discovery and synchronization.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use serde_json::Value;

use super::AddressSpace;
use super::ChangeHandler;
use super::OpcUaError;
use super::TypedValue;

#[derive(Default)]
pub struct MockAddressSpace {
    values: Mutex<HashMap<String, Value>>,
    children: Mutex<HashMap<String, Vec<String>>>,
    rejected_writes: Mutex<HashSet<String>>,
    writes: Mutex<Vec<(String, TypedValue)>>,
    reads: Mutex<Vec<String>>,
    subscriptions: Mutex<HashMap<String, Vec<ChangeHandler>>>,
    connected: AtomicBool,
}

impl MockAddressSpace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_value(&self, path: &str, value: Value) {
        self.values.lock().unwrap().insert(path.to_string(), value);
    }

    pub fn set_children(&self, path: &str, children: &[&str]) {
        self.children.lock().unwrap().insert(
            path.to_string(),
            children.iter().map(|c| c.to_string()).collect(),
        );
    }

    /// Writes to `path` report a bad status
    pub fn reject_writes(&self, path: &str) {
        self.rejected_writes.lock().unwrap().insert(path.to_string());
    }

    pub fn writes(&self) -> Vec<(String, TypedValue)> {
        self.writes.lock().unwrap().clone()
    }

    pub fn reads(&self) -> Vec<String> {
        self.reads.lock().unwrap().clone()
    }

    pub fn subscribed_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.subscriptions.lock().unwrap().keys().cloned().collect();
        paths.sort();
        paths
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Deliver a change notification to every handler subscribed to `path`
    pub async fn notify(&self, path: &str, value: Value) {
        let handlers = self
            .subscriptions
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .unwrap_or_default();
        for handler in handlers {
            handler(value.clone()).await;
        }
    }
}

#[async_trait]
impl AddressSpace for MockAddressSpace {
    async fn connect(&self) -> Result<(), OpcUaError> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), OpcUaError> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn browse_children(&self, path: &str) -> Result<Vec<String>, OpcUaError> {
        Ok(self
            .children
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .unwrap_or_default())
    }

    async fn read_value(&self, path: &str) -> Option<Value> {
        self.reads.lock().unwrap().push(path.to_string());
        self.values.lock().unwrap().get(path).cloned()
    }

    async fn write_value(&self, path: &str, value: TypedValue) -> bool {
        if self.rejected_writes.lock().unwrap().contains(path) {
            return false;
        }
        self.writes.lock().unwrap().push((path.to_string(), value));
        let stored = match value {
            TypedValue::Boolean(v) => Value::Bool(v),
            TypedValue::Int16(v) => Value::from(v),
        };
        self.set_value(path, stored);
        true
    }

    async fn subscribe_to_changes(
        &self,
        path: &str,
        on_change: ChangeHandler,
    ) -> Result<(), OpcUaError> {
        self.subscriptions
            .lock()
            .unwrap()
            .entry(path.to_string())
            .or_default()
            .push(on_change);
        Ok(())
    }
}
