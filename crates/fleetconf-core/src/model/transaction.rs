// ── Transaction domain types ──

use serde::{Deserialize, Serialize};

/// What a transaction is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxKind {
    Pull,
    Push,
    ControllerCommit,
    Reconnect,
    TemplateApply,
    /// Allocated by `transaction-new` for an external coordinator; has
    /// no device set of its own.
    External,
}

/// Aggregate result of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxResult {
    /// Created, not yet terminated.
    Init,
    /// All participating devices completed.
    Success,
    /// At least one device failed, or the user aborted.
    Failed,
    /// Internal fault; never masked.
    Error,
}

impl TxResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "INIT",
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
            Self::Error => "ERROR",
        }
    }
}

impl std::fmt::Display for TxResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-device progress within a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxDeviceState {
    Waiting,
    InProgress,
    Done,
    Failed,
}

/// Whether and how far a controller-commit pushes to devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PushType {
    None,
    Validate,
    Commit,
}

impl PushType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "NONE" => Some(Self::None),
            "VALIDATE" => Some(Self::Validate),
            "COMMIT" => Some(Self::Commit),
            _ => None,
        }
    }
}

/// Whether service-action processes transform intent before a push.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionsType {
    None,
    Change,
    Force,
}

impl ActionsType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "NONE" => Some(Self::None),
            "CHANGE" => Some(Self::Change),
            "FORCE" => Some(Self::Force),
            _ => None,
        }
    }
}

/// Step a device is at within a controller-commit push sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushPhase {
    Lock,
    Edit,
    Validate,
    Commit,
    Discard,
    Unlock,
}

/// Terminal transaction notification, published on the broadcast
/// stream. Delivery is best-effort, at-most-once.
#[derive(Debug, Clone, Serialize)]
pub struct TransactionEnd {
    pub tid: u64,
    pub result: TxResult,
    pub origin: Option<String>,
    pub reason: Option<String>,
}
