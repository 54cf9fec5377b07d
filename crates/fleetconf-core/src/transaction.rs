// ── Transaction table ──
//
// A transaction spans a set of devices matched by a glob pattern and
// terminates exactly once with an aggregate result published on the
// notification stream. Devices and transactions reference each other
// by id (handle.tid / per-device entries here), never by ownership.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::datastore::Ds;
use crate::model::transaction::{
    ActionsType, PushPhase, PushType, TxDeviceState, TxKind, TxResult,
};

/// Per-device progress record within a transaction.
#[derive(Debug, Clone)]
pub struct TxDevice {
    pub state: TxDeviceState,
    /// Current step of a controller-commit push sequence.
    pub phase: Option<PushPhase>,
    /// Remote commit completed; one-way at the protocol level, so this
    /// device is never rolled back.
    pub committed: bool,
    pub failure: Option<String>,
}

impl TxDevice {
    pub fn in_progress() -> Self {
        Self {
            state: TxDeviceState::InProgress,
            phase: None,
            committed: false,
            failure: None,
        }
    }

    pub fn done() -> Self {
        Self {
            state: TxDeviceState::Done,
            phase: None,
            committed: false,
            failure: None,
        }
    }

    pub fn settled(&self) -> bool {
        matches!(self.state, TxDeviceState::Done | TxDeviceState::Failed)
    }
}

#[derive(Debug)]
pub struct Transaction {
    pub id: u64,
    pub origin: Option<String>,
    pub kind: TxKind,
    pub pattern: String,
    pub devices: BTreeMap<String, TxDevice>,
    pub result: TxResult,
    pub reason: Option<String>,
    pub push: PushType,
    pub actions: ActionsType,
    pub source: Ds,
    /// An action subprocess is running; devices engage when it lands.
    pub actions_pending: bool,
    /// User abort or cascading failure: in-flight devices unwind
    /// instead of advancing.
    pub aborting: bool,
    pub created_at: DateTime<Utc>,
}

impl Transaction {
    pub fn new(id: u64, kind: TxKind, pattern: impl Into<String>) -> Self {
        Self {
            id,
            origin: None,
            kind,
            pattern: pattern.into(),
            devices: BTreeMap::new(),
            result: TxResult::Init,
            reason: None,
            push: PushType::None,
            actions: ActionsType::None,
            source: Ds::Candidate,
            actions_pending: false,
            aborting: false,
            created_at: Utc::now(),
        }
    }

    pub fn all_settled(&self) -> bool {
        !self.actions_pending && self.devices.values().all(TxDevice::settled)
    }

    pub fn any_failed(&self) -> bool {
        self.devices
            .values()
            .any(|d| d.state == TxDeviceState::Failed)
    }

    /// First recorded per-device failure, used as the aggregate reason
    /// when the user supplied none.
    pub fn first_failure(&self) -> Option<String> {
        self.devices.values().find_map(|d| d.failure.clone())
    }
}

/// Registry of in-flight transactions with monotonic id allocation.
#[derive(Debug, Default)]
pub struct TransactionTable {
    next_id: u64,
    pub active: BTreeMap<u64, Transaction>,
}

impl TransactionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    pub fn insert(&mut self, tx: Transaction) {
        self.active.insert(tx.id, tx);
    }

    pub fn get_mut(&mut self, tid: u64) -> Option<&mut Transaction> {
        self.active.get_mut(&tid)
    }

    pub fn remove(&mut self, tid: u64) -> Option<Transaction> {
        self.active.remove(&tid)
    }
}

/// Expand `${var}` placeholders in a configuration template. The
/// implicit `${DEVICE}` variable carries the device name.
pub fn expand_template(
    template: &str,
    variables: &BTreeMap<String, String>,
    device: &str,
) -> String {
    let mut out = template.to_string();
    out = out.replace("${DEVICE}", device);
    for (name, value) in variables {
        out = out.replace(&format!("${{{name}}}"), value);
    }
    out
}
