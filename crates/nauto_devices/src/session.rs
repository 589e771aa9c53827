use nauto_model::XmlTree;
use nauto_transport::FrameMode;

use crate::handle::DeviceHandle;
use crate::state_machine::{drive, DriveContext, Effect, StateMachineError, Trigger};
use crate::transport::Connection;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    StateMachine(#[from] StateMachineError),
    #[error(transparent)]
    Transport(#[from] nauto_transport::TransportError),
    #[error("malformed xml frame: {0}")]
    Xml(#[from] nauto_model::ModelError),
}

/// Drives one connected device to `OPEN` (or to `CLOSED` on failure),
/// pumping frames through `drive` and writing back whatever `Effect`s it
/// produces. This is the event loop spec.md §5 describes: suspension is
/// only permitted on frame read, frame write, and the timer.
pub async fn run_until_open(
    handle: &mut DeviceHandle,
    conn: &mut Connection,
    ctx: &DriveContext<'_>,
) -> Result<(), SessionError> {
    let effects = drive(handle, Trigger::Connect, ctx).await?;
    send_all(conn, effects).await?;

    loop {
        if matches!(handle.conn_state, nauto_model::ConnState::Open | nauto_model::ConnState::Closed) {
            return Ok(());
        }

        let was_connecting = matches!(handle.conn_state, nauto_model::ConnState::Connecting);
        let trigger = tokio::select! {
            frame = conn.reader.read_frame() => {
                let bytes = frame?;
                let text = String::from_utf8_lossy(&bytes).to_string();
                Trigger::Frame(XmlTree::parse(&text)?)
            }
            _ = handle.wait_for_timeout() => Trigger::Timeout,
        };

        let effects = drive(handle, trigger, ctx).await?;
        if was_connecting && !matches!(handle.conn_state, nauto_model::ConnState::Connecting) {
            let mode = FrameMode::negotiate(ctx.local_base_1_1, handle.capabilities.supports_base_1_1());
            conn.reader.set_mode(mode);
            conn.writer.set_mode(mode);
        }
        send_all(conn, effects).await?;
    }
}

/// Drives a single push (edit/validate/commit) to completion, returning
/// once the device is back in `OPEN` (success or semantic rejection) or
/// `CLOSED` (protocol/transport failure).
pub async fn run_push(
    handle: &mut DeviceHandle,
    conn: &mut Connection,
    ctx: &DriveContext<'_>,
    script: nauto_model::EditScript,
    level: crate::state_machine::PushLevel,
) -> Result<(), SessionError> {
    let effects = drive(handle, Trigger::PushRequested { script, level }, ctx).await?;
    send_all(conn, effects).await?;

    loop {
        if matches!(handle.conn_state, nauto_model::ConnState::Open | nauto_model::ConnState::Closed) {
            return Ok(());
        }
        let trigger = tokio::select! {
            frame = conn.reader.read_frame() => {
                let bytes = frame?;
                let text = String::from_utf8_lossy(&bytes).to_string();
                Trigger::Frame(XmlTree::parse(&text)?)
            }
            _ = handle.wait_for_timeout() => Trigger::Timeout,
        };
        let effects = drive(handle, trigger, ctx).await?;
        send_all(conn, effects).await?;
    }
}

async fn send_all(conn: &mut Connection, effects: Vec<Effect>) -> Result<(), SessionError> {
    for effect in effects {
        match effect {
            Effect::Send(body) => conn.writer.write_frame(body.as_bytes()).await?,
            Effect::None => {}
        }
    }
    Ok(())
}
