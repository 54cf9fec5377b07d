// ── Device handle ──
//
// The per-device runtime record. Owned exclusively by the reactor, so
// no interior locking; the transport writer and the frame parser state
// live here between events.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use fleetconf_netconf::transport::TransportWriter;
use fleetconf_netconf::{Capabilities, FrameReader, FramingMode, XmlNode};

use crate::model::device::{ConnState, DeviceConfig, DeviceSummary};
use crate::schema::{ModuleInfo, MountedSchema};

pub struct DeviceHandle {
    pub config: DeviceConfig,
    pub conn_state: ConnState,
    pub state_since: DateTime<Utc>,

    /// Next outbound message id (monotonic over the handle's lifetime).
    msg_id: u64,
    /// Message id of the one outstanding request, if any.
    pub pending_msg_id: Option<u64>,

    pub frame: FrameReader,
    pub capabilities: Option<Capabilities>,

    /// Module set acquired from the device's schema list.
    pub module_set: Vec<ModuleInfo>,
    /// Next module-set index to examine during schema fetch.
    pub fetch_cursor: usize,
    /// Module currently being fetched.
    pub fetching: Option<ModuleInfo>,
    /// Compiled schema set once mounted; survives a close.
    pub mounted: Option<Arc<MountedSchema>>,

    /// Device subtree as of the last successful sync; diff baseline.
    pub last_synced: Option<XmlNode>,

    /// Owning transaction id; 0 when idle.
    pub tid: u64,

    /// Bumped on every connect; events from readers of earlier
    /// connections are ignored by generation.
    pub conn_generation: u64,

    /// Per-state timer bookkeeping: stale firings are ignored by
    /// generation, disarming cancels the sleep task.
    pub timer_generation: u64,
    pub timer_cancel: Option<CancellationToken>,

    /// Replies to swallow after an abort left requests in flight.
    pub discard_replies: u32,

    /// Last diagnostic recorded at close.
    pub logmsg: Option<String>,

    /// Write half of the transport; present iff not CLOSED.
    pub writer: Option<TransportWriter>,

    /// Pull options applying to the next DEVICE_SYNC completion.
    pub pull_merge: bool,
    pub pull_transient: bool,
}

impl DeviceHandle {
    pub fn new(config: DeviceConfig, framing: FramingMode) -> Self {
        Self {
            config,
            conn_state: ConnState::Closed,
            state_since: Utc::now(),
            msg_id: 0,
            pending_msg_id: None,
            frame: FrameReader::new(framing),
            capabilities: None,
            module_set: Vec::new(),
            fetch_cursor: 0,
            fetching: None,
            mounted: None,
            last_synced: None,
            tid: 0,
            conn_generation: 0,
            timer_generation: 0,
            timer_cancel: None,
            discard_replies: 0,
            logmsg: None,
            writer: None,
            pull_merge: false,
            pull_transient: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Allocate the next outbound message id and record it as pending.
    pub fn next_msg_id(&mut self) -> u64 {
        self.msg_id += 1;
        self.pending_msg_id = Some(self.msg_id);
        self.msg_id
    }

    pub fn set_state(&mut self, state: ConnState) {
        if self.conn_state != state {
            debug!(device = %self.config.name, from = %self.conn_state, to = %state,
                   "connection state change");
            self.conn_state = state;
            self.state_since = Utc::now();
        }
    }

    /// Close the connection: drop the transport (reaping any ssh
    /// subprocess), cancel the timer, reset the frame parser, and
    /// record the diagnostic. Mounted schemas and the last-synced
    /// snapshot survive, so diagnostics and diffs stay observable.
    pub fn close(&mut self, diagnostic: impl Into<Option<String>>) {
        if let Some(cancel) = self.timer_cancel.take() {
            cancel.cancel();
        }
        self.writer = None;
        self.frame.reset();
        self.pending_msg_id = None;
        self.capabilities = None;
        self.fetching = None;
        self.discard_replies = 0;
        self.set_state(ConnState::Closed);
        if let Some(msg) = diagnostic.into() {
            debug!(device = %self.config.name, diagnostic = %msg, "closing connection");
            self.logmsg = Some(msg);
        }
    }

    pub fn summary(&self) -> DeviceSummary {
        DeviceSummary {
            name: self.config.name.clone(),
            state: self.conn_state,
            since: self.state_since,
            logmsg: self.logmsg.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn msg_ids_are_strictly_increasing() {
        let mut h = DeviceHandle::new(DeviceConfig::new("r1", "10.0.0.1"), FramingMode::Eom);
        let a = h.next_msg_id();
        let b = h.next_msg_id();
        assert!(b > a);
        assert_eq!(h.pending_msg_id, Some(b));
    }

    #[test]
    fn close_restores_closed_invariants() {
        let mut h = DeviceHandle::new(DeviceConfig::new("r1", "10.0.0.1"), FramingMode::Eom);
        h.set_state(ConnState::SchemaList);
        h.next_msg_id();
        h.frame.feed(b"partial").unwrap();
        h.close(Some("Timeout waiting for remote peer".to_string()));
        assert!(h.conn_state.is_closed());
        assert!(h.writer.is_none());
        assert!(h.timer_cancel.is_none());
        assert!(h.pending_msg_id.is_none());
        assert!(h.frame.is_empty());
        assert_eq!(h.logmsg.as_deref(), Some("Timeout waiting for remote peer"));
    }
}
