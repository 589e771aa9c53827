//! Device handles, the NETCONF connection state machine, and the
//! NETCONF-over-SSH transport (spec.md §4.2/§4.3), combined into one
//! crate because the state machine is the sole mutator of handle state
//! and the two cannot be meaningfully separated.

mod handle;
mod session;
mod state_machine;
mod transport;

pub use handle::{DeviceHandle, DeviceRegistry, DeviceRegistryError};
pub use session::{run_push, run_until_open, SessionError};
pub use state_machine::{
    drive, DriveContext, Effect, PushLevel, StateMachineError, Trigger, DEFAULT_DEVICE_TIMEOUT,
};
pub use transport::{connect_ssh, Connection, MockDeviceTransport, NetconfIo, DEFAULT_NETCONF_PORT};
