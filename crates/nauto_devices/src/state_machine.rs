use std::path::{Path, PathBuf};
use std::time::Duration;

use nauto_datastore::DatastoreClient;
use nauto_model::{
    CapabilitySet, ConnState, EditScript, SchemaCatalogEntry, SchemaLocation, XmlTree,
};
use nauto_schema::SchemaService;

use crate::handle::DeviceHandle;

pub const DEFAULT_DEVICE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushLevel {
    None,
    Validate,
    Commit,
}

/// What drove this call to `drive` (spec.md §4.3: "each triggered by a
/// received frame unless noted").
pub enum Trigger {
    Connect,
    Frame(XmlTree),
    Timeout,
    Abort,
    PushRequested { script: EditScript, level: PushLevel },
}

/// What the caller's I/O loop must do as a result of a `drive` call.
pub enum Effect {
    /// Write this already-framed RPC/hello body to the peer.
    Send(String),
    /// Nothing to do besides the state change already applied.
    None,
}

#[derive(Debug, thiserror::Error)]
pub enum StateMachineError {
    #[error("unexpected message '{message}' in state {state}")]
    UnexpectedMessage { message: String, state: ConnState },
    #[error("message-id mismatch: expected {expected}, got {got}")]
    MessageIdMismatch { expected: u64, got: u64 },
    #[error("rpc-reply missing required message-id (expected {expected})")]
    MissingMessageId { expected: u64 },
    #[error("peer does not advertise a usable NETCONF base capability")]
    UnsupportedBaseCapability,
    #[error("no method to get schemas (peer lacks monitoring capability)")]
    NoSchemaListMethod,
    #[error("YANG parse error: {0}")]
    SchemaParse(String),
    #[error("datastore error: {0}")]
    Datastore(#[from] nauto_datastore::DatastoreError),
    #[error("malformed rpc-reply: {0}")]
    Malformed(String),
}

/// Context shared by every `drive` call: the collaborators that live
/// outside the state machine's own fields (spec.md §6 external
/// interfaces).
pub struct DriveContext<'a> {
    pub schema_service: &'a dyn SchemaService,
    pub datastore: &'a dyn DatastoreClient,
    pub cache_dir: &'a Path,
    pub mount_point: String,
    pub device_timeout: Duration,
    pub local_base_1_1: bool,
}

const NETCONF_BASE_1_0: &str = "urn:ietf:params:netconf:base:1.0";
const NETCONF_BASE_1_1: &str = "urn:ietf:params:netconf:base:1.1";
const NETCONF_MONITORING: &str = "urn:ietf:params:xml:ns:yang:ietf-netconf-monitoring";

fn hello_body(local_base_1_1: bool) -> String {
    let base_1_1 = if local_base_1_1 {
        format!("<capability>{NETCONF_BASE_1_1}</capability>")
    } else {
        String::new()
    };
    format!(
        "<hello xmlns=\"{NETCONF_BASE_1_0}\"><capabilities><capability>{NETCONF_BASE_1_0}</capability>{base_1_1}<capability>{NETCONF_MONITORING}</capability></capabilities></hello>"
    )
}

fn rpc_body(msg_id: u64, inner: &str) -> String {
    format!("<rpc message-id=\"{msg_id}\" xmlns=\"{NETCONF_BASE_1_0}\">{inner}</rpc>")
}

fn top_level_name(frame: &XmlTree) -> Option<String> {
    let children = frame.children(frame.root());
    children.first().map(|&id| frame.node(id).name.clone())
}

fn echoed_msg_id(frame: &XmlTree) -> Option<u64> {
    let top = *frame.children(frame.root()).first()?;
    frame
        .node(top)
        .attributes
        .iter()
        .find(|(k, _)| k == "message-id")
        .and_then(|(_, v)| v.parse().ok())
}

fn is_rpc_error(frame: &XmlTree) -> Option<String> {
    let top = *frame.children(frame.root()).first()?;
    let error_tag = frame.find_child(top, "rpc-error", None)?;
    let reason = frame
        .find_child(error_tag, "error-message", None)
        .and_then(|id| frame.node(id).text.clone())
        .unwrap_or_else(|| "rpc-error".to_string());
    Some(reason)
}

fn require_echo(handle: &DeviceHandle, frame: &XmlTree) -> Result<(), StateMachineError> {
    let Some(expected) = handle.last_sent_msg_id else {
        return Ok(());
    };
    let Some(got) = echoed_msg_id(frame) else {
        return Err(StateMachineError::MissingMessageId { expected });
    };
    if got != expected {
        return Err(StateMachineError::MessageIdMismatch { expected, got });
    }
    Ok(())
}

fn close(handle: &mut DeviceHandle, reason: impl Into<String>) {
    handle.conn_state = ConnState::Closed;
    handle.log_msg = Some(reason.into());
    handle.cancel_timer();
    handle.push_level = None;
    handle.pending_script = None;
    handle.pending_modules.clear();
}

fn enter_transient(handle: &mut DeviceHandle, state: ConnState, ctx: &DriveContext<'_>) {
    handle.conn_state = state;
    handle.set_timer(ctx.device_timeout);
}

/// Applies one `Trigger` to `handle`, returning the side-effecting
/// `Effect`s the caller's I/O loop must perform (spec.md §4.3, verbatim).
pub async fn drive(
    handle: &mut DeviceHandle,
    trigger: Trigger,
    ctx: &DriveContext<'_>,
) -> Result<Vec<Effect>, StateMachineError> {
    if handle.abort_requested && !matches!(trigger, Trigger::Abort) {
        handle.abort_requested = false;
        if handle.conn_state.is_transient() {
            close(handle, "Aborted by user");
        }
        return Ok(vec![]);
    }

    match trigger {
        Trigger::Abort => {
            if handle.conn_state.is_transient() {
                close(handle, "Aborted by user");
            }
            Ok(vec![])
        }
        Trigger::Timeout => {
            if handle.conn_state.is_transient() {
                close(handle, "Timeout waiting for remote peer");
            }
            Ok(vec![])
        }
        Trigger::Connect => {
            if handle.conn_state != ConnState::Closed {
                return Err(StateMachineError::UnexpectedMessage {
                    message: "connect".to_string(),
                    state: handle.conn_state,
                });
            }
            handle.reset_msg_id();
            enter_transient(handle, ConnState::Connecting, ctx);
            Ok(vec![])
        }
        Trigger::PushRequested { script, level } => {
            if handle.conn_state != ConnState::Open {
                return Err(StateMachineError::UnexpectedMessage {
                    message: "push-requested".to_string(),
                    state: handle.conn_state,
                });
            }
            if script.is_empty() {
                // Idempotence short-circuit (spec.md §4.5): no edit to
                // send, stay OPEN.
                return Ok(vec![]);
            }
            let payload = nauto_diff::render_edit_config(&script);
            let msg_id = handle.next_msg_id();
            handle.last_sent_msg_id = Some(msg_id);
            handle.push_level = Some(level);
            handle.pending_script = Some(script);
            enter_transient(handle, ConnState::PushEdit, ctx);
            let inner = format!(
                "<edit-config><target><candidate/></target><config>{}</config></edit-config>",
                payload.to_xml_string()
            );
            Ok(vec![Effect::Send(rpc_body(msg_id, &inner))])
        }
        Trigger::Frame(frame) => drive_frame(handle, frame, ctx).await,
    }
}

async fn drive_frame(
    handle: &mut DeviceHandle,
    frame: XmlTree,
    ctx: &DriveContext<'_>,
) -> Result<Vec<Effect>, StateMachineError> {
    let name = top_level_name(&frame).unwrap_or_default();

    match handle.conn_state {
        ConnState::Connecting => {
            if name != "hello" {
                let msg = format!("Unexpected msg {name} in state CONNECTING");
                close(handle, msg.clone());
                return Err(StateMachineError::UnexpectedMessage {
                    message: name,
                    state: ConnState::Connecting,
                });
            }
            let caps = parse_capabilities(&frame);
            handle.capabilities = caps.clone();
            if !caps.supports_base_netconf() {
                close(handle, "Unsupported NETCONF base capability");
                return Err(StateMachineError::UnsupportedBaseCapability);
            }
            if !caps.supports_monitoring() {
                close(handle, "No method to get schemas");
                return Err(StateMachineError::NoSchemaListMethod);
            }
            let hello = hello_body(ctx.local_base_1_1);
            let msg_id = handle.next_msg_id();
            handle.last_sent_msg_id = Some(msg_id);
            enter_transient(handle, ConnState::SchemaList, ctx);
            let list = rpc_body(msg_id, "<get-schema-list/>");
            Ok(vec![Effect::Send(hello), Effect::Send(list)])
        }

        ConnState::SchemaList => {
            if name != "rpc-reply" {
                let msg = format!("Unexpected msg {name} in state SCHEMA_LIST");
                close(handle, msg.clone());
                return Err(StateMachineError::UnexpectedMessage {
                    message: name,
                    state: ConnState::SchemaList,
                });
            }
            require_echo(handle, &frame)?;
            handle.schema_catalog = parse_schema_catalog(&frame);
            handle.pending_modules = handle
                .schema_catalog
                .iter()
                .enumerate()
                .filter(|(_, entry)| {
                    entry.location == SchemaLocation::NetconfReachable && !is_cached(ctx.cache_dir, entry)
                })
                .map(|(i, _)| i)
                .collect();

            match handle.pending_modules.pop_front() {
                Some(idx) => {
                    let entry = handle.schema_catalog[idx].clone();
                    let msg_id = handle.next_msg_id();
                    handle.last_sent_msg_id = Some(msg_id);
                    enter_transient(handle, ConnState::SchemaOne(idx as u32), ctx);
                    let inner = get_schema_request(&entry);
                    Ok(vec![Effect::Send(rpc_body(msg_id, &inner))])
                }
                None => request_device_sync(handle, ctx).await,
            }
        }

        ConnState::SchemaOne(idx) => {
            if name != "rpc-reply" {
                let msg = format!("Unexpected msg {name} in state SCHEMA_ONE({idx})");
                close(handle, msg.clone());
                return Err(StateMachineError::UnexpectedMessage {
                    message: name,
                    state: ConnState::SchemaOne(idx),
                });
            }
            require_echo(handle, &frame)?;
            let entry = handle.schema_catalog[idx as usize].clone();
            let body = extract_schema_body(&frame)
                .ok_or_else(|| StateMachineError::Malformed("missing schema body".to_string()))?;
            write_schema_cache(ctx.cache_dir, &entry, &body)
                .map_err(|e| StateMachineError::Malformed(e.to_string()))?;

            match handle.pending_modules.pop_front() {
                Some(next_idx) => {
                    let next_entry = handle.schema_catalog[next_idx].clone();
                    let msg_id = handle.next_msg_id();
                    handle.last_sent_msg_id = Some(msg_id);
                    enter_transient(handle, ConnState::SchemaOne(next_idx as u32), ctx);
                    let inner = get_schema_request(&next_entry);
                    Ok(vec![Effect::Send(rpc_body(msg_id, &inner))])
                }
                None => {
                    let modules: Vec<(String, Option<String>)> = handle
                        .schema_catalog
                        .iter()
                        .map(|e| (e.module.clone(), e.revision.clone()))
                        .collect();
                    let set = ctx
                        .schema_service
                        .parse(&modules, ctx.cache_dir)
                        .await
                        .map_err(|e| StateMachineError::SchemaParse(e.to_string()))?;
                    ctx.schema_service
                        .mount(&set, &ctx.mount_point)
                        .map_err(|e| StateMachineError::SchemaParse(e.to_string()))?;
                    handle.schema_set = Some(set);
                    request_device_sync(handle, ctx).await
                }
            }
        }

        ConnState::DeviceSync => {
            if name != "rpc-reply" {
                let msg = format!("Unexpected msg {name} in state DEVICE_SYNC");
                close(handle, msg.clone());
                return Err(StateMachineError::UnexpectedMessage {
                    message: name,
                    state: ConnState::DeviceSync,
                });
            }
            require_echo(handle, &frame)?;
            let data = extract_data(&frame);
            ctx.datastore
                .write_candidate_replace(&ctx.mount_point, data.clone())
                .await?;
            let commit_result = ctx.datastore.commit(&ctx.mount_point, handle.config_state).await;
            match commit_result {
                Ok(()) => {
                    handle.synced_xml = Some(data);
                    handle.log_msg = None;
                    handle.conn_state = ConnState::Open;
                    handle.cancel_timer();
                    Ok(vec![])
                }
                Err(err) => {
                    let _ = ctx.datastore.discard_candidate(&ctx.mount_point).await;
                    ctx.schema_service.unmount(&ctx.mount_point);
                    close(handle, "Failed to commit");
                    Err(StateMachineError::Datastore(err))
                }
            }
        }

        ConnState::PushEdit => {
            if name == "rpc-reply" && is_rpc_error(&frame).is_none() {
                require_echo(handle, &frame)?;
                match handle.push_level {
                    Some(PushLevel::None) | None => {
                        handle.conn_state = ConnState::Open;
                        handle.cancel_timer();
                        handle.push_level = None;
                        handle.pending_script = None;
                        Ok(vec![])
                    }
                    Some(level) => {
                        let msg_id = handle.next_msg_id();
                        handle.last_sent_msg_id = Some(msg_id);
                        enter_transient(handle, ConnState::PushValidate, ctx);
                        let _ = level;
                        Ok(vec![Effect::Send(rpc_body(msg_id, "<validate><source><candidate/></source></validate>"))])
                    }
                }
            } else if let Some(reason) = is_rpc_error(&frame) {
                handle.conn_state = ConnState::Open;
                handle.cancel_timer();
                handle.push_level = None;
                handle.pending_script = None;
                handle.log_msg = Some(reason);
                Ok(vec![])
            } else {
                let msg = format!("Unexpected msg {name} in state PUSH_EDIT");
                close(handle, msg.clone());
                Err(StateMachineError::UnexpectedMessage { message: name, state: ConnState::PushEdit })
            }
        }

        ConnState::PushValidate => {
            if name == "rpc-reply" && is_rpc_error(&frame).is_none() {
                require_echo(handle, &frame)?;
                if handle.push_level == Some(PushLevel::Commit) {
                    let msg_id = handle.next_msg_id();
                    handle.last_sent_msg_id = Some(msg_id);
                    enter_transient(handle, ConnState::PushCommit, ctx);
                    Ok(vec![Effect::Send(rpc_body(msg_id, "<commit/>"))])
                } else {
                    handle.conn_state = ConnState::Open;
                    handle.cancel_timer();
                    handle.push_level = None;
                    handle.pending_script = None;
                    Ok(vec![])
                }
            } else if let Some(reason) = is_rpc_error(&frame) {
                handle.conn_state = ConnState::Open;
                handle.cancel_timer();
                handle.push_level = None;
                handle.pending_script = None;
                handle.log_msg = Some(reason);
                Ok(vec![])
            } else {
                let msg = format!("Unexpected msg {name} in state PUSH_VALIDATE");
                close(handle, msg.clone());
                Err(StateMachineError::UnexpectedMessage { message: name, state: ConnState::PushValidate })
            }
        }

        ConnState::PushCommit => {
            if name == "rpc-reply" && is_rpc_error(&frame).is_none() {
                require_echo(handle, &frame)?;
                if let Some(script) = handle.pending_script.take() {
                    if let Some(synced) = &handle.synced_xml {
                        handle.synced_xml = Some(nauto_diff::apply_edit_script(synced, &script));
                    }
                }
                handle.conn_state = ConnState::Open;
                handle.cancel_timer();
                handle.push_level = None;
                Ok(vec![])
            } else if let Some(reason) = is_rpc_error(&frame) {
                handle.conn_state = ConnState::Open;
                handle.cancel_timer();
                handle.push_level = None;
                handle.pending_script = None;
                handle.log_msg = Some(reason);
                Ok(vec![])
            } else {
                let msg = format!("Unexpected msg {name} in state PUSH_COMMIT");
                close(handle, msg.clone());
                Err(StateMachineError::UnexpectedMessage { message: name, state: ConnState::PushCommit })
            }
        }

        ConnState::Wresp => {
            if name == "rpc-reply" {
                handle.conn_state = ConnState::Open;
                handle.cancel_timer();
                Ok(vec![])
            } else {
                let msg = format!("Unexpected msg {name} in state WRESP");
                close(handle, msg.clone());
                Err(StateMachineError::UnexpectedMessage { message: name, state: ConnState::Wresp })
            }
        }

        ConnState::Open | ConnState::Closed => {
            let msg = format!("Unexpected msg {name} in state {}", handle.conn_state);
            close(handle, msg.clone());
            Err(StateMachineError::UnexpectedMessage { message: name, state: handle.conn_state })
        }
    }
}

async fn request_device_sync(
    handle: &mut DeviceHandle,
    ctx: &DriveContext<'_>,
) -> Result<Vec<Effect>, StateMachineError> {
    let msg_id = handle.next_msg_id();
    handle.last_sent_msg_id = Some(msg_id);
    enter_transient(handle, ConnState::DeviceSync, ctx);
    let inner = "<get-config><source><running/></source></get-config>";
    Ok(vec![Effect::Send(rpc_body(msg_id, inner))])
}

fn parse_capabilities(frame: &XmlTree) -> CapabilitySet {
    let mut set = std::collections::BTreeSet::new();
    let Some(&hello) = frame.children(frame.root()).first() else {
        return CapabilitySet(set);
    };
    if let Some(caps) = frame.find_child(hello, "capabilities", None) {
        for cap in frame.children(caps) {
            if let Some(text) = &frame.node(cap).text {
                set.insert(text.clone());
            }
        }
    }
    CapabilitySet(set)
}

fn parse_schema_catalog(frame: &XmlTree) -> Vec<SchemaCatalogEntry> {
    let mut out = Vec::new();
    let Some(&reply) = frame.children(frame.root()).first() else {
        return out;
    };
    let Some(schemas) = frame.find_child(reply, "schemas", None) else {
        return out;
    };
    for schema in frame.children(schemas) {
        let module = frame
            .find_child(schema, "identifier", None)
            .and_then(|id| frame.node(id).text.clone())
            .unwrap_or_default();
        let revision = frame
            .find_child(schema, "version", None)
            .and_then(|id| frame.node(id).text.clone())
            .filter(|v| !v.is_empty());
        let namespace = frame
            .find_child(schema, "namespace", None)
            .and_then(|id| frame.node(id).text.clone())
            .unwrap_or_default();
        let location_text = frame
            .find_child(schema, "location", None)
            .and_then(|id| frame.node(id).text.clone())
            .unwrap_or_default();
        let location = if location_text == "NETCONF" {
            SchemaLocation::NetconfReachable
        } else {
            SchemaLocation::Unknown
        };
        out.push(SchemaCatalogEntry {
            module,
            revision,
            namespace,
            location,
            locally_available: false,
        });
    }
    out
}

fn is_cached(cache_dir: &Path, entry: &SchemaCatalogEntry) -> bool {
    cache_dir.join(entry.cache_file_name()).exists()
}

fn get_schema_request(entry: &SchemaCatalogEntry) -> String {
    match &entry.revision {
        Some(rev) => format!(
            "<get-schema><identifier>{}</identifier><version>{rev}</version><format>yang</format></get-schema>",
            entry.module
        ),
        None => format!(
            "<get-schema><identifier>{}</identifier><format>yang</format></get-schema>",
            entry.module
        ),
    }
}

fn extract_schema_body(frame: &XmlTree) -> Option<String> {
    let reply = *frame.children(frame.root()).first()?;
    let data = frame.find_child(reply, "data", None)?;
    frame.node(data).text.clone()
}

fn write_schema_cache(
    cache_dir: &Path,
    entry: &SchemaCatalogEntry,
    body: &str,
) -> std::io::Result<()> {
    std::fs::create_dir_all(cache_dir)?;
    let path: PathBuf = cache_dir.join(entry.cache_file_name());
    std::fs::write(path, body)
}

fn extract_data(frame: &XmlTree) -> XmlTree {
    let Some(&reply) = frame.children(frame.root()).first() else {
        return XmlTree::empty();
    };
    let Some(data) = frame.find_child(reply, "data", None) else {
        return XmlTree::empty();
    };
    let mut tree = XmlTree::empty();
    for child in frame.children(data) {
        tree.graft(tree.root(), frame, child);
    }
    tree
}
