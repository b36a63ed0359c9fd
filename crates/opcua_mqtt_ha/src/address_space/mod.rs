//! Narrow interface to the OPC UA address space.
//!
//! Discovery and synchronization only see this trait; [`OpcUaClient`] is the
//! production implementation on top of the `opcua` crate.

mod client;
#[cfg(test)]
pub(crate) mod mock;

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;

pub use client::OpcUaClient;

/// Callback fired for every change notification of a subscribed node
pub type ChangeHandler = Arc<dyn Fn(Value) -> BoxFuture<'static, ()> + Send + Sync>;

/// A value written to a data point, carrying its wire type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypedValue {
    Boolean(bool),
    Int16(i16),
}

#[derive(Debug, thiserror::Error)]
pub enum OpcUaError {
    #[error("Failed to build OPC UA client")]
    ClientBuild,

    #[error("Failed to connect to OPC UA server at {url}: {status}")]
    Connect { url: String, status: String },

    #[error("Not connected to an OPC UA server. Call connect() first.")]
    NotConnected,

    #[error("Invalid node id '{0}'")]
    InvalidNodeId(String),

    #[error("Browse of {path} failed: {status}")]
    Browse { path: String, status: String },

    #[error("Subscription failed: {0}")]
    Subscription(String),

    #[error("OPC UA worker task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Operations the bridge needs from an address-space connection.
///
/// Reads and writes report a non-good status as `None`/`false` after logging
/// it; only connection-level problems surface as errors.
#[async_trait]
pub trait AddressSpace: Send + Sync {
    async fn connect(&self) -> Result<(), OpcUaError>;

    async fn disconnect(&self) -> Result<(), OpcUaError>;

    /// Browse names of the direct children of `path`, in server order
    async fn browse_children(&self, path: &str) -> Result<Vec<String>, OpcUaError>;

    async fn read_value(&self, path: &str) -> Option<Value>;

    async fn write_value(&self, path: &str, value: TypedValue) -> bool;

    /// Deliver every change below `path` to `on_change`.
    ///
    /// A structured node reports a JSON object of its children's latest
    /// values keyed by browse name; a leaf node reports its scalar value.
    async fn subscribe_to_changes(
        &self,
        path: &str,
        on_change: ChangeHandler,
    ) -> Result<(), OpcUaError>;

    async fn read_string(&self, path: &str) -> Option<String> {
        match self.read_value(path).await? {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    async fn read_bool(&self, path: &str) -> Option<bool> {
        self.read_value(path).await?.as_bool()
    }
}
