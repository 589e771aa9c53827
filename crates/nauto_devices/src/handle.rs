use nauto_model::{CapabilitySet, ConfigState, ConnState, Device, DeviceId, SchemaCatalogEntry, XmlTree};
use nauto_schema::SchemaSetHandle;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};

/// Everything the state machine mutates for one device (spec.md §4.2).
/// The controller owns handles exclusively; `DeviceStateMachine` is the
/// sole mutator of the state-machine fields.
pub struct DeviceHandle {
    pub device: Device,
    pub conn_state: ConnState,
    pub config_state: ConfigState,
    pub capabilities: CapabilitySet,
    pub schema_catalog: Vec<SchemaCatalogEntry>,
    pub schema_set: Option<SchemaSetHandle>,
    pub synced_xml: Option<XmlTree>,
    pub log_msg: Option<String>,
    /// The `message-id` most recently sent; replies must echo it exactly
    /// (spec.md §5 ordering guarantee).
    pub last_sent_msg_id: Option<u64>,
    pub abort_requested: bool,
    /// Indices into `schema_catalog` still awaiting a `get-schema` fetch,
    /// consumed front-to-back while in `SchemaOne` (spec.md §4.3).
    pub pending_modules: std::collections::VecDeque<usize>,
    /// Set for the lifetime of a push (`PUSH_EDIT`..`PUSH_COMMIT`),
    /// carrying how far the push should go (spec.md §6
    /// `controller-commit{push}`).
    pub push_level: Option<crate::state_machine::PushLevel>,
    /// The edit script being pushed, held so `drive` can re-render it at
    /// each push stage without re-computing the diff.
    pub pending_script: Option<nauto_model::EditScript>,
    msg_id: AtomicU64,
    timeout_notify: Arc<Notify>,
    timer_handle: Option<tokio::task::JoinHandle<()>>,
}

impl DeviceHandle {
    pub fn new(device: Device) -> Self {
        DeviceHandle {
            device,
            conn_state: ConnState::Closed,
            config_state: ConfigState::default(),
            capabilities: CapabilitySet::default(),
            schema_catalog: Vec::new(),
            schema_set: None,
            synced_xml: None,
            log_msg: None,
            last_sent_msg_id: None,
            abort_requested: false,
            pending_modules: std::collections::VecDeque::new(),
            push_level: None,
            pending_script: None,
            msg_id: AtomicU64::new(0),
            timeout_notify: Arc::new(Notify::new()),
            timer_handle: None,
        }
    }

    /// Atomic increment starting at 1 after CONNECTING (spec.md §8
    /// property 2); 0 is never issued.
    pub fn next_msg_id(&self) -> u64 {
        self.msg_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn reset_msg_id(&self) {
        self.msg_id.store(0, Ordering::SeqCst);
    }

    /// Cancels any previous timer and arms a fresh one that notifies the
    /// driving loop's `wait_for_timeout` after `duration` (spec.md §5:
    /// "on entry to a transient state any previous timer is cancelled
    /// and a fresh one registered; on exit, it is cancelled").
    pub fn set_timer(&mut self, duration: std::time::Duration) {
        self.cancel_timer();
        let notify = self.timeout_notify.clone();
        self.timer_handle = Some(tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            notify.notify_one();
        }));
    }

    pub fn cancel_timer(&mut self) {
        if let Some(handle) = self.timer_handle.take() {
            handle.abort();
        }
    }

    /// Resolves once the armed timer fires. Never resolves if no timer
    /// is armed and none fires, so callers select! it against other
    /// readiness sources.
    pub async fn wait_for_timeout(&self) {
        self.timeout_notify.notified().await;
    }

    pub fn request_abort(&mut self) {
        self.abort_requested = true;
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DeviceRegistryError {
    #[error("device '{0}' already registered")]
    AlreadyExists(String),
    #[error("device '{0}' not found")]
    NotFound(String),
}

/// The controller's sole owner of device handles (spec.md §4.2), one
/// `tokio::sync::Mutex` per handle so concurrent true-parallel drivers
/// still respect the "per-device lock around handle mutation" rule of
/// §5.
#[derive(Default)]
pub struct DeviceRegistry {
    handles: Mutex<HashMap<DeviceId, Arc<Mutex<DeviceHandle>>>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create(&self, device: Device) -> Result<Arc<Mutex<DeviceHandle>>, DeviceRegistryError> {
        let mut handles = self.handles.lock().await;
        if handles.contains_key(&device.name) {
            return Err(DeviceRegistryError::AlreadyExists(device.name));
        }
        let handle = Arc::new(Mutex::new(DeviceHandle::new(device.clone())));
        handles.insert(device.name.clone(), handle.clone());
        Ok(handle)
    }

    pub async fn find(&self, name: &str) -> Option<Arc<Mutex<DeviceHandle>>> {
        self.handles.lock().await.get(name).cloned()
    }

    pub async fn free(&self, name: &str) -> Result<(), DeviceRegistryError> {
        self.handles
            .lock()
            .await
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| DeviceRegistryError::NotFound(name.to_string()))
    }

    pub async fn names(&self) -> Vec<DeviceId> {
        self.handles.lock().await.keys().cloned().collect()
    }
}
