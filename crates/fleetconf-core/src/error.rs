use thiserror::Error;

use fleetconf_netconf::ProtoError;

/// Unified error type for the core crate.
///
/// Device-level failures (timeouts, framing errors, binding failures)
/// are normally recovered by closing the affected device and recording
/// a diagnostic on its handle; these variants surface when an operation
/// cannot even be started, or when a transaction must report why it
/// ended in FAILED/ERROR.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("device '{name}' not found")]
    DeviceNotFound { name: String },

    #[error("device busy: {name}")]
    DeviceBusy { name: String },

    #[error("device '{name}' is not open")]
    DeviceNotOpen { name: String },

    #[error("transaction {tid} not found")]
    TransactionNotFound { tid: u64 },

    #[error("invalid device pattern '{pattern}'")]
    InvalidPattern { pattern: String },

    #[error("validation failed for device '{device}': {message}")]
    ValidateFailed { device: String, message: String },

    #[error("commit failed: {message}")]
    CommitFailed { message: String },

    #[error("lock is already held: {message}")]
    RemoteLocked { message: String },

    #[error("schema fetch failed for '{module}': {message}")]
    SchemaFetch { module: String, message: String },

    #[error("service action failed: {message}")]
    ActionFailed { message: String },

    #[error("no service action command configured")]
    ActionUnconfigured,

    #[error("timeout waiting for remote peer")]
    Timeout,

    #[error("controller is shutting down")]
    Shutdown,

    #[error(transparent)]
    Proto(#[from] ProtoError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("internal fault: {0}")]
    Internal(String),
}

impl CoreError {
    /// Taxonomy code used as the `error-app-tag` in rpc-error replies.
    pub fn app_tag(&self) -> &'static str {
        match self {
            Self::DeviceNotFound { .. } => "device-not-found",
            Self::DeviceBusy { .. } => "device-busy",
            Self::DeviceNotOpen { .. } => "device-not-open",
            Self::TransactionNotFound { .. } => "transaction-not-found",
            Self::InvalidPattern { .. } => "invalid-pattern",
            Self::ValidateFailed { .. } => "validate-failed",
            Self::CommitFailed { .. } => "commit-failed",
            Self::RemoteLocked { .. } => "remote-locked",
            Self::SchemaFetch { .. } => "schema-fetch-failed",
            Self::ActionFailed { .. } | Self::ActionUnconfigured => "action-failed",
            Self::Timeout => "timeout",
            Self::Proto(_) => "framing-error",
            Self::Io(_) => "io-error",
            Self::Shutdown | Self::Internal(_) => "internal-fault",
        }
    }
}
