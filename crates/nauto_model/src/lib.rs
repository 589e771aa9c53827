mod credential;
mod device;
mod edit;
mod transaction;
mod xmltree;

pub use credential::{Credential, CredentialRef};
pub use device::{
    CapabilitySet, ConfigState, ConnState, ConnectionType, Device, DeviceId, SchemaCatalogEntry,
    SchemaLocation, TransportParams,
};
pub use edit::{path_to_string, ChangeValue, EditAdd, EditChange, EditScript};
pub use transaction::{
    Transaction, TransactionId, TransactionNotification, TransactionOutcome, TransactionState,
};
pub use xmltree::{EditPath, NodeId, PathStep, XmlNode, XmlTree};

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("malformed xml: {0}")]
    Xml(String),
}
