use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use nauto_coordinator::{glob_match, run_fanout, BroadcastNotificationSink, DevicePushJob, TransactionRegistry};
use nauto_datastore::{DatastoreClient, InMemoryDatastore};
use nauto_devices::{
    connect_ssh, run_push, run_until_open, Connection, DeviceHandle, DeviceRegistry, DriveContext, PushLevel,
};
use nauto_model::{
    ChangeValue, ConnState, Device, DeviceId, EditChange, EditScript, PathStep, TransactionId, TransactionOutcome,
    TransactionState, XmlTree,
};
use nauto_schema::{InMemorySchemaService, SchemaService};
use nauto_security::KeyringStore;
use nauto_transport::FrameMode;
use tokio::sync::Mutex;
use tracing::info;

use crate::config;

/// Which tree a `commit`/`diff` call treats as the push target, or as
/// one side of a comparison (spec.md §6 `controller-commit{source}` /
/// `datastore-diff{config-type1,config-type2}`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSource {
    Running,
    Candidate,
}

impl std::str::FromStr for ConfigSource {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "running" => Ok(ConfigSource::Running),
            "candidate" => Ok(ConfigSource::Candidate),
            other => bail!("unknown source '{other}' (expected running|candidate)"),
        }
    }
}

pub struct DeviceStatus {
    pub name: DeviceId,
    pub conn_state: String,
    pub log_msg: Option<String>,
}

pub struct TransactionStatus {
    pub tid: TransactionId,
    pub origin: String,
    pub state: String,
    pub reason: Option<String>,
}

pub struct CommitOutcome {
    pub tid: TransactionId,
    pub state: TransactionState,
    pub reason: Option<String>,
}

/// Everything the CLI commands need, wired the way `nauto_engine::JobEngine`
/// wires its own collaborators: one registry per concern, a single
/// transaction ledger, and the credential store underneath it all.
pub struct Controller {
    pub devices: DeviceRegistry,
    connections: Mutex<HashMap<DeviceId, Arc<Mutex<Connection>>>>,
    pub transactions: TransactionRegistry,
    schema: InMemorySchemaService,
    datastore: InMemoryDatastore,
    creds: KeyringStore,
    cache_dir: PathBuf,
    device_timeout: Duration,
    parallelism: usize,
    local_base_1_1: bool,
}

impl Controller {
    pub fn new(creds: KeyringStore) -> Result<Self> {
        let cache_dir = config::schema_mount_dir();
        std::fs::create_dir_all(&cache_dir).with_context(|| format!("creating schema cache dir {cache_dir:?}"))?;
        Ok(Controller {
            devices: DeviceRegistry::new(),
            connections: Mutex::new(HashMap::new()),
            transactions: TransactionRegistry::new(Arc::new(BroadcastNotificationSink::new(64))),
            schema: InMemorySchemaService::new(),
            datastore: InMemoryDatastore::new(),
            creds,
            cache_dir,
            device_timeout: config::device_timeout(),
            parallelism: config::default_parallelism(),
            local_base_1_1: true,
        })
    }

    pub async fn load_inventory(&self, devices: Vec<Device>) -> Result<()> {
        for device in devices {
            let name = device.name.clone();
            self.devices
                .create(device)
                .await
                .with_context(|| format!("registering device '{name}'"))?;
        }
        Ok(())
    }

    fn mount_point(name: &str) -> String {
        format!("/devices/{name}")
    }

    fn drive_ctx(&self, mount_point: String) -> DriveContext<'_> {
        DriveContext {
            schema_service: &self.schema,
            datastore: &self.datastore,
            cache_dir: &self.cache_dir,
            mount_point,
            device_timeout: self.device_timeout,
            local_base_1_1: self.local_base_1_1,
        }
    }

    async fn matching_devices(&self, pattern: &str) -> Result<Vec<DeviceId>> {
        let mut names: Vec<DeviceId> = self
            .devices
            .names()
            .await
            .into_iter()
            .filter(|n| glob_match(pattern, n))
            .collect();
        names.sort();
        if names.is_empty() {
            bail!("no device matched pattern '{pattern}'");
        }
        Ok(names)
    }

    async fn open_handle(&self, name: &str) -> Result<Arc<Mutex<DeviceHandle>>> {
        self.devices
            .find(name)
            .await
            .ok_or_else(|| anyhow!("device '{name}' not found"))
    }

    /// `connect --device <name>` (spec.md §6 `connection-change{open}`).
    pub async fn connect(&self, name: &str) -> Result<()> {
        let handle_arc = self.open_handle(name).await?;
        let device = {
            let handle = handle_arc.lock().await;
            if handle.conn_state != ConnState::Closed {
                bail!("device '{name}' is not CLOSED (currently {})", handle.conn_state);
            }
            handle.device.clone()
        };

        let mut conn = connect_ssh(&device, &self.creds, FrameMode::Sentinel)
            .await
            .with_context(|| format!("connecting to '{name}'"))?;

        let opened = {
            let mut handle = handle_arc.lock().await;
            let ctx = self.drive_ctx(Self::mount_point(name));
            run_until_open(&mut handle, &mut conn, &ctx)
                .await
                .with_context(|| format!("opening session to '{name}'"))?;
            handle.conn_state == ConnState::Open
        };

        if !opened {
            let reason = handle_arc.lock().await.log_msg.clone().unwrap_or_default();
            bail!("connection to '{name}' closed during setup: {reason}");
        }

        self.connections.lock().await.insert(name.to_string(), Arc::new(Mutex::new(conn)));
        info!(device = name, "connection-change: open");
        Ok(())
    }

    /// `disconnect --device <name>` (spec.md §6 `connection-change{close}`).
    /// Unmounts the device's schema set so a later `connect`/`reconnect`
    /// can remount fresh at the same mount point instead of hitting
    /// `SchemaError::MountConflict`.
    pub async fn disconnect(&self, name: &str) -> Result<()> {
        let handle_arc = self.open_handle(name).await?;
        self.connections.lock().await.remove(name);
        self.schema.unmount(&Self::mount_point(name));
        let mut handle = handle_arc.lock().await;
        handle.cancel_timer();
        handle.conn_state = ConnState::Closed;
        handle.log_msg = None;
        handle.schema_set = None;
        info!(device = name, "connection-change: close");
        Ok(())
    }

    /// `reconnect --device <name>` (spec.md §6 `connection-change{reconnect}`).
    pub async fn reconnect(&self, name: &str) -> Result<()> {
        let _ = self.disconnect(name).await;
        self.connect(name).await
    }

    /// `pull --device <glob> [--transient]` (spec.md §6 `config-pull`).
    ///
    /// The state machine only drives `DEVICE_SYNC` as part of the initial
    /// connect sequence; re-entering it on demand against an already-`OPEN`
    /// peer would need a new `Trigger` variant the state machine doesn't
    /// have. This surfaces the most recently synced tree (populated at
    /// connect time, spec.md §3's `synced_xml`) into a fresh candidate
    /// instead of re-issuing `get-config` — see DESIGN.md.
    pub async fn pull(&self, pattern: &str, transient: bool) -> Result<Vec<DeviceId>> {
        let names = self.matching_devices(pattern).await?;
        for name in &names {
            self.pull_one(name, transient).await?;
        }
        Ok(names)
    }

    async fn pull_one(&self, name: &str, transient: bool) -> Result<()> {
        let handle_arc = self.open_handle(name).await?;
        let xml = {
            let handle = handle_arc.lock().await;
            if handle.conn_state != ConnState::Open {
                bail!("device '{name}' is not OPEN");
            }
            handle
                .synced_xml
                .clone()
                .ok_or_else(|| anyhow!("device '{name}' has no synced configuration yet"))?
        };

        if transient {
            info!(device = name, "config-pull: transient, candidate left untouched");
        } else {
            self.datastore
                .write_candidate_replace(&Self::mount_point(name), xml)
                .await
                .with_context(|| format!("seeding candidate for '{name}'"))?;
        }
        Ok(())
    }

    /// `diff --device <name> --type1 <t> --type2 <t>` (spec.md §6
    /// `datastore-diff`), a human-readable side channel (spec.md §4.5 /
    /// §7: the structural `EditScript` stays primary; this is a text diff
    /// for audit logging and this CLI command only).
    pub async fn diff(&self, name: &str, type1: &str, type2: &str) -> Result<String> {
        let handle_arc = self.open_handle(name).await?;
        let mount_point = Self::mount_point(name);
        let tree1 = self.resolve_config_type(&handle_arc, &mount_point, type1).await?;
        let tree2 = self.resolve_config_type(&handle_arc, &mount_point, type2).await?;
        Ok(render_text_diff(&tree1, &tree2))
    }

    async fn resolve_config_type(
        &self,
        handle_arc: &Arc<Mutex<DeviceHandle>>,
        mount_point: &str,
        kind: &str,
    ) -> Result<XmlTree> {
        match kind {
            "running" | "synced" => {
                let handle = handle_arc.lock().await;
                handle
                    .synced_xml
                    .clone()
                    .ok_or_else(|| anyhow!("no synced configuration available"))
            }
            "candidate" => self
                .datastore
                .candidate_snapshot(mount_point)
                .ok_or_else(|| anyhow!("no candidate configuration available")),
            other => bail!("unknown config type '{other}' (expected running|candidate)"),
        }
    }

    /// `apply-template --device <glob> --template <name> --var k=v...`
    /// (spec.md §6 `device-template-apply`). No templating language is in
    /// scope (spec.md names the RPC without defining one); each `--var`
    /// becomes a scalar edit against a top-level leaf named by its key,
    /// seeding the candidate from the synced tree if none is open yet.
    pub async fn apply_template(
        &self,
        pattern: &str,
        template: &str,
        vars: &[(String, String)],
    ) -> Result<Vec<DeviceId>> {
        let names = self.matching_devices(pattern).await?;
        for name in &names {
            self.apply_template_one(name, template, vars).await?;
        }
        Ok(names)
    }

    async fn apply_template_one(&self, name: &str, template: &str, vars: &[(String, String)]) -> Result<()> {
        let mount_point = Self::mount_point(name);
        if self.datastore.candidate_snapshot(&mount_point).is_none() {
            let handle_arc = self.open_handle(name).await?;
            let base = {
                let handle = handle_arc.lock().await;
                handle
                    .synced_xml
                    .clone()
                    .ok_or_else(|| anyhow!("device '{name}' has no synced configuration yet"))?
            };
            self.datastore.write_candidate_replace(&mount_point, base).await?;
        }

        let mut script = EditScript::default();
        for (key, value) in vars {
            script.changes.push(EditChange {
                path: vec![PathStep { name: key.clone(), key: None }],
                value: ChangeValue::Scalar { value: value.clone() },
                subtree: None,
            });
        }
        self.datastore
            .edit_candidate(&mount_point, &script)
            .await
            .with_context(|| format!("applying template '{template}' to '{name}'"))?;
        info!(device = name, template, "device-template-apply: candidate updated");
        Ok(())
    }

    /// `commit --device <glob> --source running|candidate --push
    /// none|validate|commit [--force]` (spec.md §6 `controller-commit`).
    /// Fans a push out to every matched, `OPEN` device concurrently
    /// through the transaction coordinator (spec.md §4.4/§5).
    pub async fn commit(
        self: &Arc<Self>,
        pattern: &str,
        source: ConfigSource,
        push: PushLevel,
        force: bool,
        origin: &str,
    ) -> Result<CommitOutcome> {
        let names = self.matching_devices(pattern).await?;
        let tid = self.transactions.begin(origin.to_string()).await;
        for name in &names {
            self.transactions
                .attach(tid, name, &self.devices)
                .await
                .with_context(|| format!("attaching '{name}' to transaction {tid}"))?;
        }
        self.transactions.start(tid).await?;

        let jobs: Vec<DevicePushJob> = names
            .iter()
            .cloned()
            .map(|name| {
                let controller = self.clone();
                Box::pin(async move { Self::push_one(controller, name, source, push, force).await }) as DevicePushJob
            })
            .collect();

        run_fanout(&self.transactions, tid, self.parallelism, jobs).await;

        let txn = self
            .transactions
            .get(tid)
            .await
            .ok_or_else(|| anyhow!("transaction {tid} vanished"))?;
        Ok(CommitOutcome { tid, state: txn.state, reason: txn.reason })
    }

    async fn push_one(
        controller: Arc<Controller>,
        name: DeviceId,
        source: ConfigSource,
        push: PushLevel,
        force: bool,
    ) -> (DeviceId, TransactionOutcome) {
        let outcome = controller
            .try_push_one(&name, source, push, force)
            .await
            .unwrap_or_else(|err| TransactionOutcome::Error { reason: err.to_string() });
        (name, outcome)
    }

    async fn try_push_one(
        &self,
        name: &str,
        source: ConfigSource,
        push: PushLevel,
        force: bool,
    ) -> Result<TransactionOutcome> {
        let handle_arc = self.open_handle(name).await?;
        let mount_point = Self::mount_point(name);

        let script = {
            let handle = handle_arc.lock().await;
            if handle.conn_state != ConnState::Open {
                bail!("device '{name}' is not OPEN");
            }
            let prev = handle
                .synced_xml
                .clone()
                .ok_or_else(|| anyhow!("device '{name}' has no synced configuration"))?;
            let schema_set = handle
                .schema_set
                .clone()
                .ok_or_else(|| anyhow!("device '{name}' has no bound schema set"))?;
            drop(handle);

            let next = match source {
                ConfigSource::Running => prev.clone(),
                ConfigSource::Candidate => self.datastore.candidate_snapshot(&mount_point).unwrap_or_else(|| prev.clone()),
            };
            nauto_diff::diff(&prev, &next, &schema_set)
        };

        if push == PushLevel::None && !script.is_empty() && !force {
            bail!(
                "device '{name}' has a pending diff but --push none was requested without --force; \
                 pass --force to push=none anyway (no edit-config is ever sent at that level)"
            );
        }

        let conn_arc = {
            let connections = self.connections.lock().await;
            connections
                .get(name)
                .cloned()
                .ok_or_else(|| anyhow!("device '{name}' has no active connection"))?
        };
        let mut conn = conn_arc.lock().await;
        let ctx = self.drive_ctx(mount_point);
        let mut handle = handle_arc.lock().await;
        run_push(&mut handle, &mut conn, &ctx, script, push)
            .await
            .with_context(|| format!("pushing to '{name}'"))?;

        Ok(match (handle.conn_state, handle.log_msg.clone()) {
            (ConnState::Open, None) => TransactionOutcome::Success,
            (ConnState::Open, Some(reason)) => TransactionOutcome::Failed { reason },
            (ConnState::Closed, reason) => {
                TransactionOutcome::Error { reason: reason.unwrap_or_else(|| "session closed during push".to_string()) }
            }
            (other, _) => TransactionOutcome::Error { reason: format!("unexpected state {other} after push") },
        })
    }

    /// `transactions new --origin <s>` (spec.md §6 `transaction-new`).
    pub async fn transaction_new(&self, origin: &str) -> TransactionId {
        self.transactions.begin(origin.to_string()).await
    }

    /// `transactions cancel --tid <n> --reason <s>` (spec.md §6
    /// `transaction-error`).
    pub async fn transaction_cancel(&self, tid: TransactionId, reason: &str) -> Result<()> {
        self.transactions.cancel(tid, reason.to_string()).await.map_err(Into::into)
    }

    /// `status`: every known device's `ConnState`/`log_msg`, plus the
    /// transaction ledger (spec.md §6, scoped down to this controller's
    /// own state since there is no metrics system in scope).
    pub async fn status(&self) -> Result<(Vec<DeviceStatus>, Vec<TransactionStatus>)> {
        let mut devices = Vec::new();
        for name in self.devices.names().await {
            if let Some(handle_arc) = self.devices.find(&name).await {
                let handle = handle_arc.lock().await;
                devices.push(DeviceStatus {
                    name: name.clone(),
                    conn_state: handle.conn_state.to_string(),
                    log_msg: handle.log_msg.clone(),
                });
            }
        }
        devices.sort_by(|a, b| a.name.cmp(&b.name));

        let mut transactions: Vec<TransactionStatus> = self
            .transactions
            .list()
            .await
            .into_iter()
            .map(|t| TransactionStatus {
                tid: t.tid,
                origin: t.origin,
                state: format!("{:?}", t.state),
                reason: t.reason,
            })
            .collect();
        transactions.sort_by_key(|t| t.tid);

        Ok((devices, transactions))
    }
}

fn render_text_diff(prev: &XmlTree, next: &XmlTree) -> String {
    let prev_text = prev.to_xml_string();
    let next_text = next.to_xml_string();
    let diff = similar::TextDiff::from_lines(&prev_text, &next_text);
    let mut out = String::new();
    for change in diff.iter_all_changes() {
        let sign = match change.tag() {
            similar::ChangeTag::Delete => "-",
            similar::ChangeTag::Insert => "+",
            similar::ChangeTag::Equal => " ",
        };
        out.push_str(sign);
        out.push_str(&change);
    }
    out
}
