//! Cross-device transaction coordination (spec.md §4.4/§8): a thin,
//! single-writer ledger of which devices participate in which
//! transaction, their reported outcomes, and the exactly-once terminal
//! notification that follows.

mod glob;

pub use glob::matches as glob_match;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use nauto_devices::DeviceRegistry;
use nauto_model::{
    ConnState, DeviceId, Transaction, TransactionId, TransactionNotification, TransactionOutcome,
    TransactionState,
};
use tokio::sync::{broadcast, Mutex, Semaphore};
use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("transaction {0} not found")]
    NotFound(TransactionId),
    #[error("device '{device}' is not open")]
    DeviceClosed { device: String },
    #[error("device '{device}' is already attached to transaction {existing}")]
    AlreadyAttached { device: String, existing: TransactionId },
    #[error("transaction {0} is not cancellable")]
    NotCancellable(TransactionId),
    #[error("no device matched pattern '{0}'")]
    NoMatch(String),
}

/// Sink for the single terminal notification a transaction ever emits
/// (spec.md §8 property 7: "exactly one notification per transaction").
pub trait NotificationSink: Send + Sync {
    fn notify(&self, notification: TransactionNotification);
}

/// In-memory broadcast sink; each northbound watcher (CLI `status
/// --follow`, a future RPC surface) gets its own receiver.
pub struct BroadcastNotificationSink {
    sender: broadcast::Sender<TransactionNotification>,
}

impl BroadcastNotificationSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        BroadcastNotificationSink { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransactionNotification> {
        self.sender.subscribe()
    }
}

impl NotificationSink for BroadcastNotificationSink {
    fn notify(&self, notification: TransactionNotification) {
        // Nobody watching is a legitimate state; the send error only
        // means that.
        let _ = self.sender.send(notification);
    }
}

/// Single writer of transaction state (spec.md §4.4): every mutation
/// takes the one `tokio::sync::Mutex`-guarded map, so aggregation and
/// exactly-once notification need no extra synchronization beyond it.
pub struct TransactionRegistry {
    next_id: AtomicU64,
    transactions: Mutex<HashMap<TransactionId, Transaction>>,
    sink: Arc<dyn NotificationSink>,
}

impl TransactionRegistry {
    pub fn new(sink: Arc<dyn NotificationSink>) -> Self {
        TransactionRegistry {
            next_id: AtomicU64::new(1),
            transactions: Mutex::new(HashMap::new()),
            sink,
        }
    }

    pub async fn begin(&self, origin: impl Into<String>) -> TransactionId {
        let tid = TransactionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let txn = Transaction::new(tid, origin);
        self.transactions.lock().await.insert(tid, txn);
        tid
    }

    /// Expands `pattern` (`*`/`?` globbing) against `devices`' registered
    /// names and attaches every match. Fails the whole call if the
    /// pattern matches nothing or any match cannot be attached.
    pub async fn attach_pattern(
        &self,
        tid: TransactionId,
        pattern: &str,
        devices: &DeviceRegistry,
    ) -> Result<Vec<DeviceId>, CoordinatorError> {
        let mut matched: Vec<DeviceId> = devices
            .names()
            .await
            .into_iter()
            .filter(|n| glob::matches(pattern, n))
            .collect();
        matched.sort();
        if matched.is_empty() {
            return Err(CoordinatorError::NoMatch(pattern.to_string()));
        }
        for name in &matched {
            self.attach(tid, name, devices).await?;
        }
        Ok(matched)
    }

    /// Attaches one device, rejecting a device that is not `OPEN` or is
    /// already attached to a different still-running transaction
    /// (spec.md §4.4).
    pub async fn attach(
        &self,
        tid: TransactionId,
        device: &str,
        devices: &DeviceRegistry,
    ) -> Result<(), CoordinatorError> {
        let handle = devices
            .find(device)
            .await
            .ok_or_else(|| CoordinatorError::DeviceClosed { device: device.to_string() })?;
        {
            let handle = handle.lock().await;
            if handle.conn_state != ConnState::Open {
                return Err(CoordinatorError::DeviceClosed { device: device.to_string() });
            }
        }

        let mut transactions = self.transactions.lock().await;
        for (other_tid, txn) in transactions.iter() {
            if *other_tid != tid && !txn.state.is_terminal() && txn.participants.contains_key(device) {
                return Err(CoordinatorError::AlreadyAttached {
                    device: device.to_string(),
                    existing: *other_tid,
                });
            }
        }
        let txn = transactions.get_mut(&tid).ok_or(CoordinatorError::NotFound(tid))?;
        txn.participants.insert(device.to_string(), None);
        Ok(())
    }

    pub async fn start(&self, tid: TransactionId) -> Result<(), CoordinatorError> {
        let mut transactions = self.transactions.lock().await;
        let txn = transactions.get_mut(&tid).ok_or(CoordinatorError::NotFound(tid))?;
        txn.state = TransactionState::Running;
        Ok(())
    }

    /// Cancels a still-running transaction with `reason`. A cancel that
    /// loses the race to the last `report` (which already made the
    /// transaction non-cancellable and terminal) is a no-op, not an
    /// error — the caller asked to stop something that already finished.
    pub async fn cancel(
        &self,
        tid: TransactionId,
        reason: impl Into<String>,
    ) -> Result<(), CoordinatorError> {
        let mut transactions = self.transactions.lock().await;
        let txn = transactions.get_mut(&tid).ok_or(CoordinatorError::NotFound(tid))?;
        if txn.state.is_terminal() {
            return Ok(());
        }
        if !txn.cancellable {
            return Err(CoordinatorError::NotCancellable(tid));
        }
        txn.state = TransactionState::Failed;
        txn.reason = Some(reason.into());
        Self::finish_locked(txn, &self.sink);
        Ok(())
    }

    /// Records `device`'s terminal outcome. The report that completes
    /// the last missing participant performs aggregation and the single
    /// terminal notification (spec.md §4.4, §8 property 7); reports
    /// arriving after the transaction is already terminal are dropped.
    pub async fn report(
        &self,
        tid: TransactionId,
        device: &str,
        outcome: TransactionOutcome,
    ) -> Result<(), CoordinatorError> {
        let mut transactions = self.transactions.lock().await;
        let txn = transactions.get_mut(&tid).ok_or(CoordinatorError::NotFound(tid))?;
        if txn.state.is_terminal() {
            return Ok(());
        }
        // Once any participant has reported, a racing cancel can no
        // longer pre-empt the aggregation already under way.
        txn.cancellable = false;
        txn.participants.insert(device.to_string(), Some(outcome));
        if txn.all_reported() {
            let (state, reason) = txn.aggregate();
            txn.state = state;
            txn.reason = reason;
            Self::finish_locked(txn, &self.sink);
        }
        Ok(())
    }

    fn finish_locked(txn: &mut Transaction, sink: &Arc<dyn NotificationSink>) {
        if txn.notified {
            return;
        }
        txn.notified = true;
        sink.notify(TransactionNotification {
            tid: txn.tid,
            result: txn.state,
            reason: txn.reason.clone(),
        });
    }

    pub async fn get(&self, tid: TransactionId) -> Option<Transaction> {
        self.transactions.lock().await.get(&tid).cloned()
    }

    pub async fn list(&self) -> Vec<Transaction> {
        self.transactions.lock().await.values().cloned().collect()
    }
}

/// One device's share of a fan-out push: resolves to its reported
/// outcome once the push against that device has concluded.
pub type DevicePushJob = Pin<Box<dyn Future<Output = (DeviceId, TransactionOutcome)> + Send>>;

/// Runs `jobs` with bounded concurrency and reports each outcome to
/// `registry` as it lands, mirroring the teacher's job-engine pattern of
/// a `FuturesUnordered` pool gated by a `Semaphore` (spec.md §5:
/// "participants execute concurrently, bounded by a worker limit").
pub async fn run_fanout(
    registry: &TransactionRegistry,
    tid: TransactionId,
    concurrency: usize,
    jobs: Vec<DevicePushJob>,
) {
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut pending = FuturesUnordered::new();
    for job in jobs {
        let permit = semaphore.clone();
        pending.push(async move {
            let _permit = permit.acquire_owned().await.expect("semaphore never closed");
            job.await
        });
    }

    while let Some((device, outcome)) = pending.next().await {
        if let Err(err) = registry.report(tid, &device, outcome).await {
            warn!(%device, %tid, %err, "failed to record push outcome");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nauto_datastore::InMemoryDatastore;
    use nauto_devices::{run_push, run_until_open, Connection, DriveContext, MockDeviceTransport, PushLevel};
    use nauto_model::{
        ChangeValue, ConnectionType, CredentialRef, Device, EditChange, EditScript, PathStep,
        TransportParams,
    };
    use nauto_schema::InMemorySchemaService;
    use nauto_transport::{FrameMode, FramedReader, FramedWriter};
    use std::time::Duration;
    use tempfile::tempdir;

    fn test_device(name: &str) -> Device {
        Device {
            name: name.to_string(),
            transport: TransportParams {
                address: "10.0.0.1".to_string(),
                username: Some("admin".to_string()),
                connection_type: ConnectionType::NetconfSsh,
                port: Some(830),
            },
            enabled: true,
            credential: CredentialRef { name: name.to_string() },
        }
    }

    async fn open_registry_with(names: &[&str]) -> DeviceRegistry {
        let registry = DeviceRegistry::new();
        for name in names {
            let handle = registry.create(test_device(name)).await.unwrap();
            handle.lock().await.conn_state = ConnState::Open;
        }
        registry
    }

    #[tokio::test]
    async fn aggregation_picks_error_over_failed_over_success() {
        let sink = Arc::new(BroadcastNotificationSink::new(8));
        let mut rx = sink.subscribe();
        let registry = TransactionRegistry::new(sink);
        let devices = open_registry_with(&["r1", "r2", "r3"]).await;

        let tid = registry.begin("test").await;
        registry.attach(tid, "r1", &devices).await.unwrap();
        registry.attach(tid, "r2", &devices).await.unwrap();
        registry.attach(tid, "r3", &devices).await.unwrap();
        registry.start(tid).await.unwrap();

        registry.report(tid, "r1", TransactionOutcome::Success).await.unwrap();
        registry
            .report(tid, "r2", TransactionOutcome::Failed { reason: "validate rejected".to_string() })
            .await
            .unwrap();
        registry
            .report(tid, "r3", TransactionOutcome::Error { reason: "transport lost".to_string() })
            .await
            .unwrap();

        let txn = registry.get(tid).await.unwrap();
        assert_eq!(txn.state, TransactionState::Error);
        assert_eq!(txn.reason.as_deref(), Some("transport lost"));
        assert!(txn.notified);

        let notification = rx.try_recv().unwrap();
        assert_eq!(notification.tid, tid);
        assert_eq!(notification.result, TransactionState::Error);
        assert!(rx.try_recv().is_err(), "exactly one notification should be emitted");
    }

    #[tokio::test]
    async fn all_success_aggregates_to_success_with_no_reason() {
        let sink = Arc::new(BroadcastNotificationSink::new(8));
        let registry = TransactionRegistry::new(sink);
        let devices = open_registry_with(&["r1", "r2"]).await;

        let tid = registry.begin("test").await;
        registry.attach_pattern(tid, "r*", &devices).await.unwrap();
        registry.start(tid).await.unwrap();
        registry.report(tid, "r1", TransactionOutcome::Success).await.unwrap();
        registry.report(tid, "r2", TransactionOutcome::Success).await.unwrap();

        let txn = registry.get(tid).await.unwrap();
        assert_eq!(txn.state, TransactionState::Success);
        assert!(txn.reason.is_none());
    }

    #[tokio::test]
    async fn attaching_a_closed_device_is_rejected() {
        let sink = Arc::new(BroadcastNotificationSink::new(8));
        let registry = TransactionRegistry::new(sink);
        let devices = DeviceRegistry::new();
        devices.create(test_device("r1")).await.unwrap();

        let tid = registry.begin("test").await;
        let err = registry.attach(tid, "r1", &devices).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::DeviceClosed { .. }));
    }

    #[tokio::test]
    async fn attaching_to_a_second_transaction_is_rejected() {
        let sink = Arc::new(BroadcastNotificationSink::new(8));
        let registry = TransactionRegistry::new(sink);
        let devices = open_registry_with(&["r1"]).await;

        let first = registry.begin("a").await;
        registry.attach(first, "r1", &devices).await.unwrap();

        let second = registry.begin("b").await;
        let err = registry.attach(second, "r1", &devices).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::AlreadyAttached { .. }));
    }

    /// A cancel racing the final `report` either lands first (FAILED
    /// with the cancel reason) or loses (the aggregated result stands);
    /// either way only one notification is ever emitted.
    #[tokio::test]
    async fn cancel_racing_final_report_yields_exactly_one_notification() {
        let sink = Arc::new(BroadcastNotificationSink::new(8));
        let mut rx = sink.subscribe();
        let registry = Arc::new(TransactionRegistry::new(sink));
        let devices = open_registry_with(&["r1", "r2"]).await;

        let tid = registry.begin("test").await;
        registry.attach(tid, "r1", &devices).await.unwrap();
        registry.attach(tid, "r2", &devices).await.unwrap();
        registry.start(tid).await.unwrap();
        registry.report(tid, "r1", TransactionOutcome::Success).await.unwrap();

        let report_registry = registry.clone();
        let cancel_registry = registry.clone();
        let reporter = tokio::spawn(async move {
            let _ = report_registry.report(tid, "r2", TransactionOutcome::Success).await;
        });
        let canceller = tokio::spawn(async move {
            let _ = cancel_registry.cancel(tid, "operator abort").await;
        });
        reporter.await.unwrap();
        canceller.await.unwrap();

        let txn = registry.get(tid).await.unwrap();
        assert!(txn.state.is_terminal());
        assert!(txn.notified);
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err(), "exactly one notification should be emitted");
    }

    fn sample_script() -> EditScript {
        let mut script = EditScript::default();
        script.changes.push(EditChange {
            path: vec![PathStep { name: "hostname".to_string(), key: None }],
            value: ChangeValue::Scalar { value: "new-hostname".to_string() },
            subtree: None,
        });
        script
    }

    /// Scenario S6 (spec.md §8): a two-device push where one device's
    /// candidate validates cleanly and commits, and the other's
    /// validate is rejected by the peer. The transaction must aggregate
    /// to FAILED, carrying the rejected device's reason, with the
    /// succeeding device's work left in place (push is per-device, not
    /// all-or-nothing across the fleet).
    #[tokio::test]
    async fn scenario_s6_one_device_fails_validate() {
        let sink = Arc::new(BroadcastNotificationSink::new(8));
        let mut rx = sink.subscribe();
        let registry = TransactionRegistry::new(sink);
        let devices = open_registry_with(&["r1", "r2"]).await;

        let tid = registry.begin("test").await;
        registry.attach(tid, "r1", &devices).await.unwrap();
        registry.attach(tid, "r2", &devices).await.unwrap();
        registry.start(tid).await.unwrap();

        let schema = InMemorySchemaService::new();
        let datastore = InMemoryDatastore::new();
        let cache_dir = tempdir().unwrap();

        let mode = FrameMode::Sentinel;

        // r1: edit -> validate -> commit, all accepted.
        let (r1_controller_io, r1_peer_io) = MockDeviceTransport::pair();
        let mut r1_conn = Connection::from_io(r1_controller_io, mode, None);
        let (r1_peer_read, r1_peer_write) = tokio::io::split(r1_peer_io);

        // r2: edit accepted, validate rejected.
        let (r2_controller_io, r2_peer_io) = MockDeviceTransport::pair();
        let mut r2_conn = Connection::from_io(r2_controller_io, mode, None);
        let (r2_peer_read, r2_peer_write) = tokio::io::split(r2_peer_io);

        let ctx_r1 = DriveContext {
            schema_service: &schema,
            datastore: &datastore,
            cache_dir: cache_dir.path(),
            mount_point: "/devices/r1".to_string(),
            device_timeout: Duration::from_secs(60),
            local_base_1_1: false,
        };
        let ctx_r2 = DriveContext {
            schema_service: &schema,
            datastore: &datastore,
            cache_dir: cache_dir.path(),
            mount_point: "/devices/r2".to_string(),
            device_timeout: Duration::from_secs(60),
            local_base_1_1: false,
        };

        let mut r1_handle = nauto_devices::DeviceHandle::new(test_device("r1"));
        let mut r2_handle = nauto_devices::DeviceHandle::new(test_device("r2"));

        let r1_peer = tokio::spawn(run_peer(r1_peer_read, r1_peer_write, mode, true));
        let r2_peer = tokio::spawn(run_peer(r2_peer_read, r2_peer_write, mode, false));

        run_until_open(&mut r1_handle, &mut r1_conn, &ctx_r1).await.unwrap();
        run_until_open(&mut r2_handle, &mut r2_conn, &ctx_r2).await.unwrap();

        run_push(&mut r1_handle, &mut r1_conn, &ctx_r1, sample_script(), PushLevel::Commit)
            .await
            .unwrap();
        run_push(&mut r2_handle, &mut r2_conn, &ctx_r2, sample_script(), PushLevel::Commit)
            .await
            .unwrap();

        r1_peer.await.unwrap();
        r2_peer.await.unwrap();

        assert_eq!(r1_handle.conn_state, ConnState::Open);
        assert!(r1_handle.log_msg.is_none());
        assert_eq!(r2_handle.conn_state, ConnState::Open);
        assert_eq!(r2_handle.log_msg.as_deref(), Some("candidate rejected: mtu out of range"));

        registry.report(tid, "r1", TransactionOutcome::Success).await.unwrap();
        registry
            .report(
                tid,
                "r2",
                TransactionOutcome::Failed { reason: r2_handle.log_msg.clone().unwrap() },
            )
            .await
            .unwrap();

        let txn = registry.get(tid).await.unwrap();
        assert_eq!(txn.state, TransactionState::Failed);
        assert_eq!(txn.reason.as_deref(), Some("candidate rejected: mtu out of range"));

        let notification = rx.try_recv().unwrap();
        assert_eq!(notification.result, TransactionState::Failed);
    }

    /// Scripts one device's peer side through hello/schema/sync and then
    /// a push: `commit_ok` decides whether validate (and the subsequent
    /// commit) succeeds or is rejected with an `rpc-error`.
    async fn run_peer(
        read: tokio::io::ReadHalf<Box<dyn nauto_devices::NetconfIo>>,
        write: tokio::io::WriteHalf<Box<dyn nauto_devices::NetconfIo>>,
        mode: FrameMode,
        commit_ok: bool,
    ) {
        let mut reader = FramedReader::new(read, mode);
        let mut writer = FramedWriter::new(write, mode);

        writer
            .write_frame(b"<hello xmlns=\"urn:ietf:params:xml:ns:netconf:base:1.0\"><capabilities><capability>urn:ietf:params:netconf:base:1.0</capability><capability>urn:ietf:params:xml:ns:yang:ietf-netconf-monitoring</capability></capabilities></hello>")
            .await
            .unwrap();
        let _our_hello = reader.read_frame().await.unwrap();
        let _list_req = reader.read_frame().await.unwrap();
        writer
            .write_frame(b"<rpc-reply message-id=\"1\"><schemas></schemas></rpc-reply>")
            .await
            .unwrap();
        let _sync_req = reader.read_frame().await.unwrap();
        writer
            .write_frame(b"<rpc-reply message-id=\"2\"><data></data></rpc-reply>")
            .await
            .unwrap();

        let _edit_req = reader.read_frame().await.unwrap();
        writer.write_frame(b"<rpc-reply message-id=\"3\"/>").await.unwrap();

        let _validate_req = reader.read_frame().await.unwrap();
        if commit_ok {
            writer.write_frame(b"<rpc-reply message-id=\"4\"/>").await.unwrap();
            let _commit_req = reader.read_frame().await.unwrap();
            writer.write_frame(b"<rpc-reply message-id=\"5\"/>").await.unwrap();
        } else {
            writer
                .write_frame(b"<rpc-reply message-id=\"4\"><rpc-error><error-message>candidate rejected: mtu out of range</error-message></rpc-error></rpc-reply>")
                .await
                .unwrap();
        }
    }
}
