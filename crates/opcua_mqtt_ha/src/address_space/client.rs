use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use opcua::client::prelude::*;
use opcua::sync::RwLock as OpcUaRwLock;
use serde_json::Value;
use tokio::sync::OnceCell;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tracing::debug;
use tracing::info;
use tracing::trace;
use tracing::warn;

use super::AddressSpace;
use super::ChangeHandler;
use super::OpcUaError;
use super::TypedValue;
use crate::config::OpcUaConfig;

type SharedSession = Arc<OpcUaRwLock<Session>>;

/// Monitored nodes keyed by node id string, shared with the data change callback
type WatchMap = Arc<Mutex<HashMap<String, Watch>>>;

/// One `subscribe_to_changes` call. Children of a structured node share a group
/// so every notification can carry the whole latest snapshot.
struct WatchGroup {
    snapshot: Mutex<serde_json::Map<String, Value>>,
    changes: mpsc::UnboundedSender<Value>,
}

impl WatchGroup {
    /// Start a task that hands every change to `on_change`, one at a time and
    /// in notification order. The task ends once the group is dropped.
    fn spawn(on_change: ChangeHandler) -> Arc<Self> {
        let (changes, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(value) = rx.recv().await {
                on_change(value).await;
            }
        });
        Arc::new(Self {
            snapshot: Mutex::new(serde_json::Map::new()),
            changes,
        })
    }

    /// Record a new value and queue the resulting snapshot for delivery.
    /// Without a field the value is delivered as is.
    fn notify(&self, field: Option<&str>, value: Value) {
        // Queued under the lock so snapshots leave in the order they were built
        let mut snapshot = self.snapshot.lock().unwrap_or_else(|e| e.into_inner());
        let payload = match field {
            Some(field) => {
                snapshot.insert(field.to_string(), value);
                Value::Object(snapshot.clone())
            }
            None => value,
        };
        if self.changes.send(payload).is_err() {
            trace!("Change handler has stopped");
        }
    }
}

#[derive(Clone)]
struct Watch {
    group: Arc<WatchGroup>,
    field: Option<String>,
}

/// Watches inserted for one subscription attempt. Unless kept, dropping this
/// takes them out of the map again and restores any watch they replaced.
struct PendingWatches<'a> {
    watches: &'a WatchMap,
    inserted: Vec<(String, Option<Watch>)>,
    kept: bool,
}

impl<'a> PendingWatches<'a> {
    fn register(
        watches: &'a WatchMap,
        targets: &[(NodeId, Option<String>)],
        group: &Arc<WatchGroup>,
    ) -> Self {
        let mut map = watches.lock().unwrap_or_else(|e| e.into_inner());
        let inserted = targets
            .iter()
            .map(|(node_id, field)| {
                let key = node_id.to_string();
                let previous = map.insert(
                    key.clone(),
                    Watch {
                        group: Arc::clone(group),
                        field: field.clone(),
                    },
                );
                (key, previous)
            })
            .collect();

        Self {
            watches,
            inserted,
            kept: false,
        }
    }

    fn keep(mut self) {
        self.kept = true;
    }
}

impl Drop for PendingWatches<'_> {
    fn drop(&mut self) {
        if self.kept {
            return;
        }
        let mut map = self.watches.lock().unwrap_or_else(|e| e.into_inner());
        for (key, previous) in self.inserted.drain(..) {
            match previous {
                Some(watch) => {
                    map.insert(key, watch);
                }
                None => {
                    map.remove(&key);
                }
            }
        }
    }
}

/// Address space connection backed by the `opcua` crate.
///
/// The crate's session API is blocking, so every call runs on the blocking
/// pool. The session and the single shared subscription are created lazily
/// and at most once, even under concurrent callers.
pub struct OpcUaClient {
    config: OpcUaConfig,
    session: OnceCell<SharedSession>,
    // Keeps the client (and its certificate store) alive with the session
    client: Mutex<Option<Client>>,
    session_task: Mutex<Option<oneshot::Sender<SessionCommand>>>,
    subscription_id: OnceCell<u32>,
    watches: WatchMap,
}

impl OpcUaClient {
    pub fn new(config: OpcUaConfig) -> Self {
        Self {
            config,
            session: OnceCell::new(),
            client: Mutex::new(None),
            session_task: Mutex::new(None),
            subscription_id: OnceCell::new(),
            watches: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    async fn session(&self) -> Result<SharedSession, OpcUaError> {
        self.session
            .get_or_try_init(|| self.establish_session())
            .await
            .cloned()
    }

    async fn establish_session(&self) -> Result<SharedSession, OpcUaError> {
        let attempts = self.config.connect_retries + 1;
        let delay = Duration::from_millis(self.config.connect_retry_delay_ms);

        let mut attempt = 1;
        loop {
            match self.connect_once().await {
                Ok(session) => return Ok(session),
                Err(e) if attempt < attempts => {
                    warn!(
                        "Connection attempt {}/{} to {} failed: {}",
                        attempt, attempts, self.config.url, e
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn connect_once(&self) -> Result<SharedSession, OpcUaError> {
        let config = self.config.clone();

        let (client, session) = tokio::task::spawn_blocking(move || {
            let mut client = ClientBuilder::new()
                .application_name(&config.application_name)
                .application_uri(&format!("urn:{}", config.application_name))
                .create_sample_keypair(true)
                .trust_server_certs(true)
                .session_retry_limit(0)
                .client()
                .ok_or(OpcUaError::ClientBuild)?;

            let connect_error = |e: StatusCode| OpcUaError::Connect {
                url: config.url.clone(),
                status: e.to_string(),
            };

            let endpoints = client
                .get_server_endpoints_from_url(&config.url)
                .map_err(connect_error)?;

            let endpoint = endpoints
                .iter()
                .find(|e| {
                    e.security_policy_uri.as_ref() == SecurityPolicy::None.to_uri()
                        && e.security_mode == MessageSecurityMode::None
                })
                .cloned()
                .ok_or_else(|| OpcUaError::Connect {
                    url: config.url.clone(),
                    status: "no unsecured endpoint offered".to_string(),
                })?;

            let session = client
                .connect_to_endpoint(endpoint, IdentityToken::Anonymous)
                .map_err(connect_error)?;

            Ok::<_, OpcUaError>((client, session))
        })
        .await??;

        let session_task = Session::run_async(session.clone());
        *self.client.lock().unwrap_or_else(|e| e.into_inner()) = Some(client);
        *self.session_task.lock().unwrap_or_else(|e| e.into_inner()) = Some(session_task);

        info!("Connected to OPC UA server at {}", self.config.url);
        Ok(session)
    }

    async fn subscription(&self) -> Result<u32, OpcUaError> {
        self.subscription_id
            .get_or_try_init(|| self.create_subscription())
            .await
            .copied()
    }

    async fn create_subscription(&self) -> Result<u32, OpcUaError> {
        let session = self.session().await?;
        let publishing_interval = self.config.publishing_interval_ms as f64;
        let watches = Arc::clone(&self.watches);

        let callback = DataChangeCallback::new(move |items| {
            for item in items.iter() {
                let key = item.item_to_monitor().node_id.to_string();
                let data_value = item.last_value();

                if let Some(status) = data_value.status {
                    if !status.is_good() {
                        warn!("Change notification for {} with status {}", key, status);
                        continue;
                    }
                }
                let Some(variant) = data_value.value.as_ref() else {
                    continue;
                };

                let watch = watches
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .get(&key)
                    .cloned();
                let Some(watch) = watch else {
                    trace!("No watch registered for {}", key);
                    continue;
                };

                watch
                    .group
                    .notify(watch.field.as_deref(), variant_to_json(variant));
            }
        });

        let subscription_id = tokio::task::spawn_blocking(move || {
            session
                .read()
                .create_subscription(publishing_interval, 30, 10, 0, 0, true, callback)
                .map_err(|e| OpcUaError::Subscription(e.to_string()))
        })
        .await??;

        debug!("Created subscription {}", subscription_id);
        Ok(subscription_id)
    }

    /// Hierarchical children of `path` as (browse name, node id)
    async fn browse(&self, path: &str) -> Result<Vec<(String, NodeId)>, OpcUaError> {
        let session = self.session().await?;
        let description = BrowseDescription {
            node_id: parse_node_id(path)?,
            browse_direction: BrowseDirection::Forward,
            reference_type_id: ReferenceTypeId::HierarchicalReferences.into(),
            include_subtypes: true,
            node_class_mask: NodeClass::Object as u32 | NodeClass::Variable as u32,
            result_mask: BrowseDescriptionResultMask::all().bits(),
        };

        let browse_error = |status: String| OpcUaError::Browse {
            path: path.to_string(),
            status,
        };

        let results = tokio::task::spawn_blocking(move || session.read().browse(&[description]))
            .await?
            .map_err(|e| browse_error(e.to_string()))?
            .ok_or_else(|| browse_error("no browse results returned".to_string()))?;

        let Some(result) = results.into_iter().next() else {
            return Ok(Vec::new());
        };
        if !result.status_code.is_good() {
            return Err(browse_error(result.status_code.to_string()));
        }

        Ok(result
            .references
            .unwrap_or_default()
            .into_iter()
            .map(|r| (r.browse_name.name.as_ref().to_string(), r.node_id.node_id))
            .collect())
    }
}

#[async_trait]
impl AddressSpace for OpcUaClient {
    async fn connect(&self) -> Result<(), OpcUaError> {
        info!("Connecting to OPC UA server at {}", self.config.url);
        self.session().await.map(|_| ())
    }

    async fn disconnect(&self) -> Result<(), OpcUaError> {
        let Some(session) = self.session.get().cloned() else {
            return Ok(());
        };

        tokio::task::spawn_blocking(move || session.read().disconnect()).await?;

        if let Some(task) = self.session_task.lock().unwrap_or_else(|e| e.into_inner()).take() {
            // Already stopped if the receiver is gone
            let _ = task.send(SessionCommand::Stop);
        }
        self.client.lock().unwrap_or_else(|e| e.into_inner()).take();

        info!("Disconnected from OPC UA server");
        Ok(())
    }

    async fn browse_children(&self, path: &str) -> Result<Vec<String>, OpcUaError> {
        Ok(self
            .browse(path)
            .await?
            .into_iter()
            .map(|(name, _)| name)
            .collect())
    }

    async fn read_value(&self, path: &str) -> Option<Value> {
        let node_id = match parse_node_id(path) {
            Ok(node_id) => node_id,
            Err(e) => {
                warn!("{}", e);
                return None;
            }
        };
        let session = match self.session().await {
            Ok(session) => session,
            Err(e) => {
                warn!("Cannot read {}: {}", path, e);
                return None;
            }
        };

        let read_value_id = ReadValueId {
            node_id,
            attribute_id: AttributeId::Value as u32,
            index_range: UAString::null(),
            data_encoding: QualifiedName::null(),
        };

        let result = tokio::task::spawn_blocking(move || {
            session
                .read()
                .read(&[read_value_id], TimestampsToReturn::Both, 0.0)
        })
        .await;

        let data_value = match result {
            Ok(Ok(values)) => values.into_iter().next()?,
            Ok(Err(status)) => {
                warn!("Read of {} failed: {}", path, status);
                return None;
            }
            Err(e) => {
                warn!("Read of {} failed: {}", path, e);
                return None;
            }
        };

        if let Some(status) = data_value.status {
            if !status.is_good() {
                warn!("Read of {} returned status {}", path, status);
                return None;
            }
        }

        trace!("Read {} = {:?}", path, data_value.value);
        data_value.value.as_ref().map(variant_to_json)
    }

    async fn write_value(&self, path: &str, value: TypedValue) -> bool {
        let node_id = match parse_node_id(path) {
            Ok(node_id) => node_id,
            Err(e) => {
                warn!("{}", e);
                return false;
            }
        };
        let session = match self.session().await {
            Ok(session) => session,
            Err(e) => {
                warn!("Cannot write {}: {}", path, e);
                return false;
            }
        };

        let variant = match value {
            TypedValue::Boolean(v) => Variant::Boolean(v),
            TypedValue::Int16(v) => Variant::Int16(v),
        };
        // S7 controllers reject writes that carry timestamps
        let write_value = WriteValue {
            node_id,
            attribute_id: AttributeId::Value as u32,
            index_range: UAString::null(),
            value: DataValue::value_only(variant),
        };

        let result =
            tokio::task::spawn_blocking(move || session.read().write(&[write_value])).await;

        match result {
            Ok(Ok(statuses)) => match statuses.first() {
                Some(status) if status.is_good() => {
                    debug!("Wrote {:?} to {}", value, path);
                    true
                }
                Some(status) => {
                    warn!("Write of {:?} to {} returned status {}", value, path, status);
                    false
                }
                None => {
                    warn!("Write of {:?} to {} returned no status", value, path);
                    false
                }
            },
            Ok(Err(status)) => {
                warn!("Write of {:?} to {} failed: {}", value, path, status);
                false
            }
            Err(e) => {
                warn!("Write of {:?} to {} failed: {}", value, path, e);
                false
            }
        }
    }

    async fn subscribe_to_changes(
        &self,
        path: &str,
        on_change: ChangeHandler,
    ) -> Result<(), OpcUaError> {
        let subscription_id = self.subscription().await?;
        let children = self.browse(path).await?;

        let targets: Vec<(NodeId, Option<String>)> = if children.is_empty() {
            vec![(parse_node_id(path)?, None)]
        } else {
            children
                .into_iter()
                .map(|(name, node_id)| (node_id, Some(name)))
                .collect()
        };

        // Register before creating the items so the initial values are not missed
        let group = WatchGroup::spawn(on_change);
        let pending = PendingWatches::register(&self.watches, &targets, &group);

        let requests: Vec<MonitoredItemCreateRequest> = targets
            .iter()
            .map(|(node_id, _)| MonitoredItemCreateRequest {
                item_to_monitor: ReadValueId {
                    node_id: node_id.clone(),
                    attribute_id: AttributeId::Value as u32,
                    index_range: UAString::null(),
                    data_encoding: QualifiedName::null(),
                },
                monitoring_mode: MonitoringMode::Reporting,
                requested_parameters: MonitoringParameters {
                    sampling_interval: self.config.publishing_interval_ms as f64,
                    filter: ExtensionObject::null(),
                    queue_size: 10,
                    discard_oldest: true,
                    client_handle: 0,
                },
            })
            .collect();

        let session = self.session().await?;
        let results = tokio::task::spawn_blocking(move || {
            session.read().create_monitored_items(
                subscription_id,
                TimestampsToReturn::Both,
                &requests,
            )
        })
        .await?
        .map_err(|e| OpcUaError::Subscription(format!("{}: {}", path, e)))?;

        let mut monitored = 0;
        for ((node_id, _), result) in targets.iter().zip(results.iter()) {
            if result.status_code.is_good() {
                monitored += 1;
            } else {
                warn!("Cannot monitor {}: {}", node_id, result.status_code);
            }
        }
        if monitored == 0 {
            return Err(OpcUaError::Subscription(format!(
                "no monitored item could be created for {}",
                path
            )));
        }

        pending.keep();
        debug!("Monitoring {} node(s) below {}", monitored, path);
        Ok(())
    }
}

fn parse_node_id(path: &str) -> Result<NodeId, OpcUaError> {
    NodeId::from_str(path).map_err(|_| OpcUaError::InvalidNodeId(path.to_string()))
}

fn variant_to_json(variant: &Variant) -> Value {
    match variant {
        Variant::Empty => Value::Null,
        Variant::Boolean(v) => Value::Bool(*v),
        Variant::SByte(v) => Value::from(*v),
        Variant::Byte(v) => Value::from(*v),
        Variant::Int16(v) => Value::from(*v),
        Variant::UInt16(v) => Value::from(*v),
        Variant::Int32(v) => Value::from(*v),
        Variant::UInt32(v) => Value::from(*v),
        Variant::Int64(v) => Value::from(*v),
        Variant::UInt64(v) => Value::from(*v),
        Variant::Float(v) => Value::from(*v as f64),
        Variant::Double(v) => Value::from(*v),
        Variant::String(v) => Value::String(v.as_ref().to_string()),
        Variant::Array(array) => Value::Array(array.values.iter().map(variant_to_json).collect()),
        other => Value::String(format!("{:?}", other)),
    }
}
