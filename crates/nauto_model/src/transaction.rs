use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::DeviceId;

/// Never zero; allocation is serialized by the transaction coordinator
/// (spec.md §3).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransactionId(pub u64);

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionState {
    Init,
    Running,
    Success,
    Failed,
    Error,
}

impl TransactionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionState::Success | TransactionState::Failed | TransactionState::Error
        )
    }
}

/// Per-participant terminal outcome reported to the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransactionOutcome {
    Success,
    Failed { reason: String },
    Error { reason: String },
}

impl TransactionOutcome {
    pub fn reason(&self) -> Option<&str> {
        match self {
            TransactionOutcome::Success => None,
            TransactionOutcome::Failed { reason } | TransactionOutcome::Error { reason } => {
                Some(reason)
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub tid: TransactionId,
    pub origin: String,
    pub state: TransactionState,
    pub participants: BTreeMap<DeviceId, Option<TransactionOutcome>>,
    pub reason: Option<String>,
    pub cancellable: bool,
    /// Set the instant the terminal notification is emitted, so a second
    /// terminal transition (natural completion racing a cancel) can
    /// never emit a second one (spec.md §8 property 7).
    #[serde(default)]
    pub notified: bool,
}

impl Transaction {
    pub fn new(tid: TransactionId, origin: impl Into<String>) -> Self {
        Transaction {
            tid,
            origin: origin.into(),
            state: TransactionState::Init,
            participants: BTreeMap::new(),
            reason: None,
            cancellable: true,
            notified: false,
        }
    }

    pub fn all_reported(&self) -> bool {
        self.participants.values().all(|o| o.is_some())
    }

    /// Aggregation rule from spec.md §4.4: ERROR beats FAILED beats
    /// SUCCESS; `reason` is the first participant's reason, in
    /// participant-name order (participants are a `BTreeMap`, so this is
    /// deterministic), whose outcome matches the aggregate severity.
    pub fn aggregate(&self) -> (TransactionState, Option<String>) {
        let outcomes: Vec<&TransactionOutcome> = self.participants.values().flatten().collect();
        let state = if outcomes
            .iter()
            .any(|o| matches!(o, TransactionOutcome::Error { .. }))
        {
            TransactionState::Error
        } else if outcomes
            .iter()
            .any(|o| matches!(o, TransactionOutcome::Failed { .. }))
        {
            TransactionState::Failed
        } else {
            TransactionState::Success
        };
        let reason = outcomes.into_iter().find_map(|outcome| match (state, outcome) {
            (TransactionState::Error, TransactionOutcome::Error { reason }) => Some(reason.clone()),
            (TransactionState::Failed, TransactionOutcome::Failed { reason }) => {
                Some(reason.clone())
            }
            _ => None,
        });
        (state, reason)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionNotification {
    pub tid: TransactionId,
    pub result: TransactionState,
    pub reason: Option<String>,
}
