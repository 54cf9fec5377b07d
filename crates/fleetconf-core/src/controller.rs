// ── Controller reactor ──
//
// One task owns every device handle, the transaction table, and the
// datastore. Everything reaches it as an event: raw bytes and EOF from
// per-device reader tasks, timer expirations, service-action results,
// and commands from RPC front-ends (carrying a oneshot reply sender).
// State transitions run to completion on this task, so the components
// need no locking between them.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use fleetconf_netconf::transport::Transport;
use fleetconf_netconf::{rpc, FrameWriter, FramingMode, ProtoError, XmlNode};

use crate::actions::ActionRunner;
use crate::config::ControllerConfig;
use crate::datastore::{edit_tree, format_diff, merge_node, Datastore, Ds, PutOp, ValidateLevel};
use crate::device::handle::DeviceHandle;
use crate::device::registry::DeviceRegistry;
use crate::device::state::{on_message, Effect, StateCtx};
use crate::error::CoreError;
use crate::model::device::{ConnState, DeviceConfig, DeviceSummary};
use crate::model::transaction::{
    ActionsType, PushPhase, PushType, TransactionEnd, TxDeviceState, TxKind, TxResult,
};
use crate::schema::{SchemaCache, SchemaPolicy};
use crate::transaction::{expand_template, Transaction, TransactionTable, TxDevice};

const EVENT_CHANNEL_SIZE: usize = 256;
const NOTIFY_CHANNEL_SIZE: usize = 64;

// ── Commands ─────────────────────────────────────────────────────────

/// Operation requested on matching device connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnOp {
    Close,
    Open,
    Reconnect,
}

/// Intent handed to the reactor by RPC front-ends.
#[derive(Debug, Clone)]
pub enum Command {
    ConnectionChange {
        pattern: String,
        op: ConnOp,
    },
    ConfigPull {
        pattern: String,
        merge: bool,
        transient: bool,
    },
    ConfigPush {
        pattern: String,
    },
    ControllerCommit {
        pattern: String,
        push: PushType,
        actions: ActionsType,
        source: Ds,
        service_instance: Option<String>,
    },
    TemplateApply {
        pattern: String,
        template: String,
        variables: BTreeMap<String, String>,
    },
    TransactionNew {
        origin: Option<String>,
    },
    TransactionError {
        tid: u64,
        origin: Option<String>,
        reason: String,
    },
    DatastoreDiff {
        pattern: String,
        source1: Ds,
        source2: Ds,
    },
    GetDeviceSyncConfig {
        devname: String,
    },
    DeviceStatus,
}

#[derive(Debug)]
pub enum CommandResult {
    Ok,
    Tid(u64),
    Diff(String),
    Config(Option<String>),
    Devices(Vec<DeviceSummary>),
}

pub struct CommandEnvelope {
    command: Command,
    reply: oneshot::Sender<Result<CommandResult, CoreError>>,
}

// ── Transport injection ──────────────────────────────────────────────

/// Opens transports for devices. Injected at construction so tests can
/// substitute scripted in-memory peers for the ssh subprocess.
pub trait Connector: Send + Sync + 'static {
    fn connect<'a>(
        &'a self,
        device: &'a DeviceConfig,
    ) -> Pin<Box<dyn Future<Output = Result<Transport, ProtoError>> + Send + 'a>>;
}

/// Production connector: `ssh -s <addr> netconf`.
pub struct SshConnector;

impl Connector for SshConnector {
    fn connect<'a>(
        &'a self,
        device: &'a DeviceConfig,
    ) -> Pin<Box<dyn Future<Output = Result<Transport, ProtoError>> + Send + 'a>> {
        Box::pin(async move { Transport::ssh(&device.addr, device.user.as_deref()) })
    }
}

// ── Events ───────────────────────────────────────────────────────────

pub(crate) enum Event {
    Data {
        device: String,
        generation: u64,
        bytes: Bytes,
    },
    Eof {
        device: String,
        generation: u64,
    },
    Timeout {
        device: String,
        generation: u64,
    },
    ActionDone {
        tid: u64,
        result: Result<String, CoreError>,
    },
    Command(CommandEnvelope),
}

// ── Public facade ────────────────────────────────────────────────────

struct ControllerInner {
    event_tx: mpsc::Sender<Event>,
    notify_tx: broadcast::Sender<TransactionEnd>,
    state_tx: watch::Sender<Arc<Vec<DeviceSummary>>>,
    cancel: CancellationToken,
}

/// Handle to a running controller reactor. Cheaply cloneable.
#[derive(Clone)]
pub struct Controller {
    inner: Arc<ControllerInner>,
}

impl Controller {
    /// Start the reactor over the given inventory. Devices are
    /// registered but not connected; issue a
    /// `ConnectionChange { op: Open }` to bring them up.
    pub fn spawn(
        config: ControllerConfig,
        inventory: Vec<DeviceConfig>,
        connector: Arc<dyn Connector>,
        store: Box<dyn Datastore>,
        policy: SchemaPolicy,
    ) -> (Controller, JoinHandle<()>) {
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
        let (notify_tx, _) = broadcast::channel(NOTIFY_CHANNEL_SIZE);
        let (state_tx, _) = watch::channel(Arc::new(Vec::new()));
        let inner = Arc::new(ControllerInner {
            event_tx: event_tx.clone(),
            notify_tx,
            state_tx,
            cancel: CancellationToken::new(),
        });

        let cache = SchemaCache::new(config.schema_dir.clone());
        let mut registry = DeviceRegistry::new();
        let mut devices = BTreeMap::new();
        for dev in inventory {
            let handle = registry.ensure(&dev, config.framing);
            if !dev.enabled {
                handle.logmsg = Some("Configured down".to_string());
            }
            devices.insert(dev.name.clone(), dev);
        }

        let reactor = Reactor {
            cfg: config,
            inventory: devices,
            registry,
            txs: TransactionTable::new(),
            store,
            cache,
            policy,
            connector,
            inner: inner.clone(),
            event_tx,
        };
        let task = tokio::spawn(reactor.run(event_rx));
        (Controller { inner }, task)
    }

    /// Execute a command on the reactor and await its result.
    pub async fn execute(&self, command: Command) -> Result<CommandResult, CoreError> {
        let (reply, rx) = oneshot::channel();
        self.inner
            .event_tx
            .send(Event::Command(CommandEnvelope { command, reply }))
            .await
            .map_err(|_| CoreError::Shutdown)?;
        rx.await.map_err(|_| CoreError::Shutdown)?
    }

    /// Subscribe to terminal transaction notifications.
    pub fn notifications(&self) -> broadcast::Receiver<TransactionEnd> {
        self.inner.notify_tx.subscribe()
    }

    /// Subscribe to device state summaries.
    pub fn device_states(&self) -> watch::Receiver<Arc<Vec<DeviceSummary>>> {
        self.inner.state_tx.subscribe()
    }

    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
    }
}

// ── Reactor ──────────────────────────────────────────────────────────

struct Reactor {
    cfg: ControllerConfig,
    inventory: BTreeMap<String, DeviceConfig>,
    registry: DeviceRegistry,
    txs: TransactionTable,
    store: Box<dyn Datastore>,
    cache: SchemaCache,
    policy: SchemaPolicy,
    connector: Arc<dyn Connector>,
    inner: Arc<ControllerInner>,
    event_tx: mpsc::Sender<Event>,
}

enum Participants {
    Open(Vec<String>),
    Busy(String),
}

impl Reactor {
    async fn run(mut self, mut event_rx: mpsc::Receiver<Event>) {
        self.publish_states();
        info!(devices = self.inventory.len(), "controller reactor started");
        loop {
            tokio::select! {
                biased;
                _ = self.inner.cancel.cancelled() => break,
                event = event_rx.recv() => {
                    let Some(event) = event else { break };
                    self.on_event(event).await;
                }
            }
        }
        for name in self.registry.matching("*").unwrap_or_default() {
            if let Some(h) = self.registry.get_mut(&name) {
                if !h.conn_state.is_closed() {
                    h.close(None);
                }
            }
        }
        debug!("controller reactor stopped");
    }

    async fn on_event(&mut self, event: Event) {
        match event {
            Event::Data {
                device,
                generation,
                bytes,
            } => self.on_data(&device, generation, bytes).await,
            Event::Eof { device, generation } => self.on_eof(&device, generation).await,
            Event::Timeout { device, generation } => self.on_timeout(&device, generation).await,
            Event::ActionDone { tid, result } => self.on_action_done(tid, result).await,
            Event::Command(envelope) => {
                let result = self.route_command(envelope.command).await;
                let _ = envelope.reply.send(result);
            }
        }
    }

    // ── Inbound device traffic ───────────────────────────────────────

    async fn on_data(&mut self, device: &str, generation: u64, bytes: Bytes) {
        let Some(h) = self.registry.get_mut(device) else {
            return;
        };
        if h.conn_generation != generation || h.conn_state.is_closed() {
            // Drained bytes of a connection we already tore down.
            return;
        }
        let frames = match h.frame.feed(&bytes) {
            Ok(frames) => frames,
            Err(e) => {
                h.close(Some(format!("Invalid frame: {e}")));
                self.after_close(device).await;
                return;
            }
        };
        for frame in frames {
            let text = match std::str::from_utf8(&frame) {
                Ok(text) => text,
                Err(_) => {
                    if let Some(h) = self.registry.get_mut(device) {
                        h.close(Some("Invalid frame".to_string()));
                    }
                    self.after_close(device).await;
                    return;
                }
            };
            let msg = match XmlNode::parse(text) {
                Ok(msg) => msg,
                Err(e) => {
                    if let Some(h) = self.registry.get_mut(device) {
                        h.close(Some(format!("Invalid frame: {e}")));
                    }
                    self.after_close(device).await;
                    return;
                }
            };
            self.dispatch_message(device, msg).await;
            if self
                .registry
                .get(device)
                .map_or(true, |h| h.conn_state.is_closed())
            {
                return;
            }
        }
    }

    async fn dispatch_message(&mut self, device: &str, msg: XmlNode) {
        let Some(h) = self.registry.get_mut(device) else {
            return;
        };
        // The session is strictly sequential, so a mismatched
        // message-id is logged but the reply is still processed.
        if let (Some(pending), Some(got)) =
            (h.pending_msg_id, fleetconf_netconf::message::message_id(&msg))
        {
            if pending != got {
                debug!(device, pending, got, "reply message-id does not match outstanding request");
            }
        }
        let mut ctx = StateCtx {
            store: self.store.as_mut(),
            cache: &self.cache,
            policy: &self.policy,
            pin_framing: self.cfg.pin_framing,
        };
        let effects = on_message(h, &mut ctx, &msg);
        self.apply_effects(device, effects).await;
    }

    async fn apply_effects(&mut self, device: &str, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Send { payload, mode } => {
                    if !self.send_framed(device, &payload, mode).await {
                        return;
                    }
                }
                Effect::SetFraming(mode) => {
                    if let Some(h) = self.registry.get_mut(device) {
                        h.frame.set_mode(mode);
                    }
                }
                Effect::RearmTimer => {
                    if let Some(h) = self.registry.get_mut(device) {
                        arm_timer(h, &self.event_tx, self.cfg.device_timeout);
                    }
                }
                Effect::DisarmTimer => {
                    if let Some(h) = self.registry.get_mut(device) {
                        if let Some(cancel) = h.timer_cancel.take() {
                            cancel.cancel();
                        }
                    }
                }
                Effect::SyncCommitted => {
                    self.publish_states();
                    self.on_device_synced(device).await;
                }
                Effect::PushReply { ok, detail } => {
                    self.on_push_reply(device, ok, detail).await;
                }
                Effect::Closed => {
                    self.after_close(device).await;
                    return;
                }
            }
        }
    }

    /// Frame and send one payload; on write failure close the device.
    /// Returns false when the device is gone.
    async fn send_framed(&mut self, device: &str, payload: &str, mode: Option<FramingMode>) -> bool {
        let Some(h) = self.registry.get_mut(device) else {
            return false;
        };
        let mode = mode.unwrap_or_else(|| h.frame.mode());
        let frame = FrameWriter::encode(payload.as_bytes(), mode);
        let Some(writer) = h.writer.as_mut() else {
            return false;
        };
        if let Err(e) = writer.send(&frame).await {
            h.close(Some(format!("Remote socket endpoint closed: {e}")));
            self.after_close(device).await;
            return false;
        }
        true
    }

    async fn on_eof(&mut self, device: &str, generation: u64) {
        let Some(h) = self.registry.get_mut(device) else {
            return;
        };
        if h.conn_generation != generation || h.conn_state.is_closed() {
            return;
        }
        h.close(Some("Remote socket endpoint closed".to_string()));
        self.after_close(device).await;
    }

    async fn on_timeout(&mut self, device: &str, generation: u64) {
        let Some(h) = self.registry.get_mut(device) else {
            return;
        };
        if h.timer_generation != generation || !h.conn_state.is_transient() {
            return;
        }
        h.close(Some("Timeout waiting for remote peer".to_string()));
        self.after_close(device).await;
    }

    /// Common tail after a handle transitioned to CLOSED.
    async fn after_close(&mut self, device: &str) {
        self.publish_states();
        self.on_device_closed(device).await;
    }

    fn publish_states(&self) {
        let _ = self
            .inner
            .state_tx
            .send_replace(Arc::new(self.registry.summaries()));
    }

    // ── Command routing ──────────────────────────────────────────────

    async fn route_command(&mut self, command: Command) -> Result<CommandResult, CoreError> {
        match command {
            Command::ConnectionChange { pattern, op } => {
                self.cmd_connection_change(&pattern, op).await
            }
            Command::ConfigPull {
                pattern,
                merge,
                transient,
            } => self.cmd_config_pull(&pattern, merge, transient).await,
            Command::ConfigPush { pattern } => self.cmd_config_push(&pattern).await,
            Command::ControllerCommit {
                pattern,
                push,
                actions,
                source,
                service_instance,
            } => {
                self.cmd_controller_commit(&pattern, push, actions, source, service_instance)
                    .await
            }
            Command::TemplateApply {
                pattern,
                template,
                variables,
            } => self.cmd_template_apply(&pattern, &template, &variables).await,
            Command::TransactionNew { origin } => {
                let tid = self.txs.next_id();
                let mut tx = Transaction::new(tid, TxKind::External, "*");
                tx.origin = origin;
                self.txs.insert(tx);
                Ok(CommandResult::Tid(tid))
            }
            Command::TransactionError {
                tid,
                origin,
                reason,
            } => self.cmd_transaction_error(tid, origin, reason).await,
            Command::DatastoreDiff {
                pattern,
                source1,
                source2,
            } => self.cmd_datastore_diff(&pattern, source1, source2),
            Command::GetDeviceSyncConfig { devname } => {
                let config = self
                    .registry
                    .get(&devname)
                    .ok_or_else(|| CoreError::DeviceNotFound {
                        name: devname.clone(),
                    })?
                    .last_synced
                    .as_ref()
                    .map(XmlNode::to_xml);
                Ok(CommandResult::Config(config))
            }
            Command::DeviceStatus => Ok(CommandResult::Devices(self.registry.summaries())),
        }
    }

    /// Matching OPEN devices, or the name of a busy one. A device owned
    /// by another transaction fails the new one regardless of its
    /// connection state; devices that are merely not OPEN are skipped.
    fn open_participants(&self, pattern: &str) -> Result<Participants, CoreError> {
        let mut open = Vec::new();
        for name in self.registry.matching(pattern)? {
            let h = self.registry.get(&name).expect("matched handle exists");
            if h.tid != 0 {
                return Ok(Participants::Busy(name));
            }
            if !h.conn_state.is_open() {
                continue;
            }
            open.push(name);
        }
        Ok(Participants::Open(open))
    }

    /// Terminate a transaction immediately with the given result.
    fn finish_now(&mut self, mut tx: Transaction, result: TxResult, reason: Option<String>) -> u64 {
        tx.result = result;
        tx.reason = reason;
        let tid = tx.id;
        self.notify_end(&tx);
        tid
    }

    fn notify_end(&self, tx: &Transaction) {
        info!(tid = tx.id, kind = ?tx.kind, result = %tx.result,
              reason = tx.reason.as_deref().unwrap_or(""),
              "transaction terminated");
        let _ = self.inner.notify_tx.send(TransactionEnd {
            tid: tx.id,
            result: tx.result,
            origin: tx.origin.clone(),
            reason: tx.reason.clone(),
        });
    }

    /// If every participant settled, compute the aggregate result,
    /// remove the transaction, and publish the notification.
    fn finish_if_settled(&mut self, tid: u64) {
        let Some(tx) = self.txs.get_mut(tid) else {
            return;
        };
        if !tx.all_settled() {
            return;
        }
        let mut tx = self.txs.remove(tid).expect("transaction present");
        if tx.result == TxResult::Init {
            tx.result = if tx.any_failed() || tx.aborting {
                TxResult::Failed
            } else {
                TxResult::Success
            };
        }
        if tx.reason.is_none() {
            tx.reason = tx.first_failure();
        }
        self.notify_end(&tx);
    }

    // ── connection-change ────────────────────────────────────────────

    async fn cmd_connection_change(
        &mut self,
        pattern: &str,
        op: ConnOp,
    ) -> Result<CommandResult, CoreError> {
        let names = self.registry.matching(pattern)?;
        if op == ConnOp::Close || op == ConnOp::Reconnect {
            for name in &names {
                let Some(h) = self.registry.get_mut(name) else {
                    continue;
                };
                if !h.conn_state.is_closed() {
                    h.close(Some("Closed by user".to_string()));
                    self.after_close(name).await;
                }
            }
            if op == ConnOp::Close {
                self.publish_states();
                return Ok(CommandResult::Ok);
            }
        }
        // Open / Reconnect: connect enabled, currently closed devices.
        let tid = self.txs.next_id();
        let mut tx = Transaction::new(tid, TxKind::Reconnect, pattern);
        for name in &names {
            let enabled = self
                .inventory
                .get(name)
                .map(|d| d.enabled)
                .unwrap_or(false);
            let closed = self
                .registry
                .get(name)
                .map(|h| h.conn_state.is_closed())
                .unwrap_or(false);
            if !enabled || !closed {
                continue;
            }
            if self.connect_device(name).await {
                tx.devices.insert(name.clone(), TxDevice::in_progress());
                if let Some(h) = self.registry.get_mut(name) {
                    h.tid = tid;
                }
            } else {
                let failure = self
                    .registry
                    .get(name)
                    .and_then(|h| h.logmsg.clone());
                let mut dev = TxDevice::in_progress();
                dev.state = TxDeviceState::Failed;
                dev.failure = failure;
                tx.devices.insert(name.clone(), dev);
            }
        }
        self.publish_states();
        if tx.all_settled() {
            let reason = tx.first_failure();
            let result = if tx.any_failed() {
                TxResult::Failed
            } else {
                TxResult::Success
            };
            self.finish_now(tx, result, reason);
        } else {
            self.txs.insert(tx);
        }
        Ok(CommandResult::Tid(tid))
    }

    /// Open the transport for one device and start its reader task.
    /// Returns false (with a diagnostic on the handle) on failure.
    async fn connect_device(&mut self, name: &str) -> bool {
        let Some(config) = self.inventory.get(name).cloned() else {
            return false;
        };
        let transport = match self.connector.connect(&config).await {
            Ok(t) => t,
            Err(e) => {
                if let Some(h) = self.registry.get_mut(name) {
                    h.close(Some(format!("Failed to connect: {e}")));
                }
                return false;
            }
        };
        let (mut reader, writer) = transport.split();
        let h = self.registry.ensure(&config, self.cfg.framing);
        h.conn_generation += 1;
        let generation = h.conn_generation;
        h.writer = Some(writer);
        h.frame.reset();
        h.frame.set_mode(self.cfg.framing);
        h.logmsg = None;
        h.set_state(ConnState::Connecting);
        arm_timer(h, &self.event_tx, self.cfg.device_timeout);

        let device = name.to_string();
        let event_tx = self.event_tx.clone();
        let cancel = self.inner.cancel.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 8192];
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    read = reader.read(&mut buf) => {
                        match read {
                            Ok(0) | Err(_) => {
                                let _ = event_tx
                                    .send(Event::Eof { device: device.clone(), generation })
                                    .await;
                                break;
                            }
                            Ok(n) => {
                                let bytes = Bytes::copy_from_slice(&buf[..n]);
                                let event = Event::Data { device: device.clone(), generation, bytes };
                                if event_tx.send(event).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                }
            }
        });
        true
    }

    // ── config-pull ──────────────────────────────────────────────────

    async fn cmd_config_pull(
        &mut self,
        pattern: &str,
        merge: bool,
        transient: bool,
    ) -> Result<CommandResult, CoreError> {
        let devices = match self.open_participants(pattern)? {
            Participants::Open(devices) => devices,
            Participants::Busy(name) => {
                let tid = self.txs.next_id();
                let tx = Transaction::new(tid, TxKind::Pull, pattern);
                self.finish_now(tx, TxResult::Failed, Some(format!("device busy: {name}")));
                return Ok(CommandResult::Tid(tid));
            }
        };
        let tid = self.txs.next_id();
        let mut tx = Transaction::new(tid, TxKind::Pull, pattern);
        if devices.is_empty() {
            self.finish_now(tx, TxResult::Success, None);
            return Ok(CommandResult::Tid(tid));
        }
        for name in &devices {
            tx.devices.insert(name.clone(), TxDevice::in_progress());
        }
        self.txs.insert(tx);
        for name in devices {
            let h = self.registry.get_mut(&name).expect("participant exists");
            h.tid = tid;
            h.pull_merge = merge;
            h.pull_transient = transient;
            let payload = rpc::get_config(h.next_msg_id(), "running");
            h.set_state(ConnState::DeviceSync);
            arm_timer(h, &self.event_tx, self.cfg.device_timeout);
            self.send_framed(&name, &payload, None).await;
        }
        self.publish_states();
        self.finish_if_settled(tid);
        Ok(CommandResult::Tid(tid))
    }

    // ── config-push (diff-based edit) ────────────────────────────────

    async fn cmd_config_push(&mut self, pattern: &str) -> Result<CommandResult, CoreError> {
        let devices = match self.open_participants(pattern)? {
            Participants::Open(devices) => devices,
            Participants::Busy(name) => {
                let tid = self.txs.next_id();
                let tx = Transaction::new(tid, TxKind::Push, pattern);
                self.finish_now(tx, TxResult::Failed, Some(format!("device busy: {name}")));
                return Ok(CommandResult::Tid(tid));
            }
        };
        let tid = self.txs.next_id();
        let mut tx = Transaction::new(tid, TxKind::Push, pattern);
        let mut engaged = Vec::new();
        for name in devices {
            let h = self.registry.get(&name).expect("participant exists");
            let Some(baseline) = h.last_synced.clone() else {
                let mut dev = TxDevice::in_progress();
                dev.state = TxDeviceState::Failed;
                dev.failure = Some(format!("No synced device tree for {name}"));
                tx.devices.insert(name, dev);
                continue;
            };
            let current = self
                .store
                .device_root(Ds::Running, &name)
                .unwrap_or_else(crate::datastore::empty_root);
            match edit_tree(&baseline, &current) {
                None => {
                    tx.devices.insert(name, TxDevice::done());
                }
                Some(edit) => {
                    tx.devices.insert(name.clone(), TxDevice::in_progress());
                    engaged.push((name, edit));
                }
            }
        }
        self.txs.insert(tx);
        for (name, edit) in engaged {
            let h = self.registry.get_mut(&name).expect("participant exists");
            h.tid = tid;
            let payload = rpc::edit_config(h.next_msg_id(), "candidate", &edit_body(&edit));
            h.set_state(ConnState::PushEdit);
            arm_timer(h, &self.event_tx, self.cfg.device_timeout);
            self.send_framed(&name, &payload, None).await;
        }
        self.publish_states();
        self.finish_if_settled(tid);
        Ok(CommandResult::Tid(tid))
    }

    // ── device-template-apply ────────────────────────────────────────

    async fn cmd_template_apply(
        &mut self,
        pattern: &str,
        template: &str,
        variables: &BTreeMap<String, String>,
    ) -> Result<CommandResult, CoreError> {
        let devices = match self.open_participants(pattern)? {
            Participants::Open(devices) => devices,
            Participants::Busy(name) => {
                let tid = self.txs.next_id();
                let tx = Transaction::new(tid, TxKind::TemplateApply, pattern);
                self.finish_now(tx, TxResult::Failed, Some(format!("device busy: {name}")));
                return Ok(CommandResult::Tid(tid));
            }
        };
        // Expand into the candidate mounts, then commit locally so the
        // diff-based push picks the change up against last-synced.
        for name in &devices {
            let expanded = expand_template(template, variables, name);
            let subtree =
                XmlNode::parse(&expanded).map_err(|e| CoreError::ValidateFailed {
                    device: name.clone(),
                    message: format!("template does not parse: {e}"),
                })?;
            let mut root = self
                .store
                .device_root(Ds::Candidate, name)
                .unwrap_or_else(crate::datastore::empty_root);
            merge_node(&mut root, XmlNode {
                children: vec![subtree],
                ..crate::datastore::empty_root()
            });
            self.store
                .put_device_root(Ds::Candidate, name, PutOp::Replace, root);
        }
        if let Err(e) = self.store.commit(ValidateLevel::Full) {
            self.store.discard();
            return Err(e);
        }
        let tid = self.txs.next_id();
        let mut tx = Transaction::new(tid, TxKind::TemplateApply, pattern);
        let mut engaged = Vec::new();
        for name in devices {
            let h = self.registry.get(&name).expect("participant exists");
            let baseline = h
                .last_synced
                .clone()
                .unwrap_or_else(crate::datastore::empty_root);
            let current = self
                .store
                .device_root(Ds::Running, &name)
                .unwrap_or_else(crate::datastore::empty_root);
            match edit_tree(&baseline, &current) {
                None => {
                    tx.devices.insert(name, TxDevice::done());
                }
                Some(edit) => {
                    tx.devices.insert(name.clone(), TxDevice::in_progress());
                    engaged.push((name, edit));
                }
            }
        }
        self.txs.insert(tx);
        for (name, edit) in engaged {
            let h = self.registry.get_mut(&name).expect("participant exists");
            h.tid = tid;
            let payload = rpc::edit_config(h.next_msg_id(), "candidate", &edit_body(&edit));
            h.set_state(ConnState::PushEdit);
            arm_timer(h, &self.event_tx, self.cfg.device_timeout);
            self.send_framed(&name, &payload, None).await;
        }
        self.publish_states();
        self.finish_if_settled(tid);
        Ok(CommandResult::Tid(tid))
    }

    // ── controller-commit ────────────────────────────────────────────

    async fn cmd_controller_commit(
        &mut self,
        pattern: &str,
        push: PushType,
        actions: ActionsType,
        source: Ds,
        service_instance: Option<String>,
    ) -> Result<CommandResult, CoreError> {
        if actions != ActionsType::None && self.cfg.action_command.is_empty() {
            return Err(CoreError::ActionUnconfigured);
        }
        let devices = match self.open_participants(pattern)? {
            Participants::Open(devices) => devices,
            Participants::Busy(name) => {
                let tid = self.txs.next_id();
                let tx = Transaction::new(tid, TxKind::ControllerCommit, pattern);
                self.finish_now(tx, TxResult::Failed, Some(format!("device busy: {name}")));
                return Ok(CommandResult::Tid(tid));
            }
        };
        let tid = self.txs.next_id();
        let mut tx = Transaction::new(tid, TxKind::ControllerCommit, pattern);
        tx.push = push;
        tx.actions = actions;
        tx.source = source;

        // Nothing to transform and nothing to push: a no-op.
        if actions == ActionsType::None && push == PushType::None {
            self.finish_now(tx, TxResult::Success, None);
            return Ok(CommandResult::Tid(tid));
        }

        if actions != ActionsType::None {
            tx.actions_pending = true;
            for name in devices {
                tx.devices.insert(
                    name,
                    TxDevice {
                        state: TxDeviceState::Waiting,
                        phase: None,
                        committed: false,
                        failure: None,
                    },
                );
            }
            self.txs.insert(tx);
            let mut command = self.cfg.action_command.clone();
            if let Some(instance) = service_instance {
                command.push(instance);
            }
            let runner = ActionRunner::new(command, self.cfg.device_timeout)?;
            let input = self.store.devices_tree(source).to_xml();
            let event_tx = self.event_tx.clone();
            tokio::spawn(async move {
                let result = runner.run(input).await;
                let _ = event_tx.send(Event::ActionDone { tid, result }).await;
            });
            return Ok(CommandResult::Tid(tid));
        }

        for name in devices {
            tx.devices.insert(name.clone(), TxDevice::in_progress());
        }
        self.txs.insert(tx);
        self.start_push_phase(tid).await;
        Ok(CommandResult::Tid(tid))
    }

    async fn on_action_done(&mut self, tid: u64, result: Result<String, CoreError>) {
        let Some(tx) = self.txs.get_mut(tid) else {
            // Transaction aborted while the action ran.
            return;
        };
        tx.actions_pending = false;
        let output = match result {
            Ok(output) => output,
            Err(e) => {
                self.finish_with(tid, TxResult::Error, Some(e.to_string()));
                return;
            }
        };
        let applied = XmlNode::parse(&output)
            .map_err(CoreError::from)
            .and_then(|tree| self.store.apply_devices_tree(Ds::Candidate, &tree));
        if let Err(e) = applied {
            self.finish_with(tid, TxResult::Error, Some(format!("service action output: {e}")));
            return;
        }
        let tx = self.txs.get_mut(tid).expect("transaction present");
        if tx.aborting {
            self.finish_with(tid, TxResult::Failed, None);
            return;
        }
        if tx.push == PushType::None {
            for dev in tx.devices.values_mut() {
                dev.state = TxDeviceState::Done;
            }
            self.finish_if_settled(tid);
            return;
        }
        for dev in tx.devices.values_mut() {
            dev.state = TxDeviceState::InProgress;
        }
        self.start_push_phase(tid).await;
    }

    /// Validate the source trees locally, then engage every device
    /// with a candidate lock. Devices with an empty diff settle
    /// immediately and emit no messages.
    async fn start_push_phase(&mut self, tid: u64) {
        let Some(tx) = self.txs.get_mut(tid) else {
            return;
        };
        let source = tx.source;
        let names: Vec<String> = tx.devices.keys().cloned().collect();

        for name in &names {
            let root = self.store.device_root(source, name);
            let Some(schema) = self.store.mounted(name) else {
                self.finish_with(tid, TxResult::Failed, Some(format!("no schema mounted for {name}")));
                return;
            };
            if let Some(root) = &root {
                if let Err(message) = schema.binds(root) {
                    self.finish_with(
                        tid,
                        TxResult::Failed,
                        Some(format!("validation failed for {name}: {message}")),
                    );
                    return;
                }
            }
        }

        let mut engage = Vec::new();
        for name in &names {
            let Some(h) = self.registry.get(name) else {
                continue;
            };
            let baseline = h
                .last_synced
                .clone()
                .unwrap_or_else(crate::datastore::empty_root);
            let current = self
                .store
                .device_root(source, name)
                .unwrap_or_else(crate::datastore::empty_root);
            let has_diff = edit_tree(&baseline, &current).is_some();
            let tx = self.txs.get_mut(tid).expect("transaction present");
            let dev = tx.devices.get_mut(name).expect("device recorded");
            if has_diff {
                dev.phase = Some(PushPhase::Lock);
                engage.push(name.clone());
            } else {
                dev.state = TxDeviceState::Done;
            }
        }

        for name in engage {
            let h = self.registry.get_mut(&name).expect("participant exists");
            h.tid = tid;
            let payload = rpc::lock(h.next_msg_id(), "candidate");
            h.set_state(ConnState::PushLock);
            arm_timer(h, &self.event_tx, self.cfg.device_timeout);
            self.send_framed(&name, &payload, None).await;
        }
        self.publish_states();
        self.finish_if_settled(tid);
    }

    // ── Push replies ─────────────────────────────────────────────────

    async fn on_push_reply(&mut self, device: &str, ok: bool, detail: Option<String>) {
        let Some(h) = self.registry.get_mut(device) else {
            return;
        };
        let tid = h.tid;
        if tid == 0 || self.txs.get_mut(tid).is_none() {
            // Orphaned reply; the owning transaction is gone.
            h.tid = 0;
            if let Some(cancel) = h.timer_cancel.take() {
                cancel.cancel();
            }
            h.set_state(ConnState::Open);
            self.publish_states();
            return;
        }
        let kind = self.txs.get_mut(tid).expect("checked above").kind;
        match kind {
            TxKind::Push | TxKind::TemplateApply => {
                self.settle_edit_only(tid, device, ok, detail);
            }
            TxKind::ControllerCommit => {
                self.advance_commit(tid, device, ok, detail).await;
            }
            _ => {}
        }
        self.publish_states();
        self.finish_if_settled(tid);
    }

    /// Plain push: a single edit-config per device, then back to OPEN.
    fn settle_edit_only(&mut self, tid: u64, device: &str, ok: bool, detail: Option<String>) {
        let tx = self.txs.get_mut(tid).expect("transaction present");
        let dev = tx.devices.get_mut(device).expect("device recorded");
        if ok {
            dev.state = TxDeviceState::Done;
        } else {
            dev.state = TxDeviceState::Failed;
            dev.failure = Some(format!(
                "edit-config failed on {device}: {}",
                detail.unwrap_or_else(|| "rpc-error".to_string())
            ));
        }
        let h = self.registry.get_mut(device).expect("handle exists");
        h.tid = 0;
        if let Some(cancel) = h.timer_cancel.take() {
            cancel.cancel();
        }
        h.set_state(ConnState::Open);
    }

    /// Controller-commit per-device sequence:
    /// lock → edit → (validate | commit) → (discard) → unlock → OPEN.
    async fn advance_commit(&mut self, tid: u64, device: &str, ok: bool, detail: Option<String>) {
        let tx = self.txs.get_mut(tid).expect("transaction present");
        let aborting = tx.aborting;
        let push = tx.push;
        let source = tx.source;
        let phase = tx
            .devices
            .get(device)
            .and_then(|d| d.phase)
            .unwrap_or(PushPhase::Lock);
        let detail = detail.unwrap_or_else(|| "rpc-error".to_string());

        enum Step {
            Send(PushPhase, ConnState, String),
            Settle,
            FailSettle(String),
            FailRollback(String, PushPhase, ConnState, String),
        }

        let step = {
            let h = self.registry.get_mut(device).expect("handle exists");
            match (phase, ok) {
                (PushPhase::Lock, false) => Step::FailSettle(format!(
                    "lock is already held in state PUSH_LOCK of device {device}"
                )),
                (PushPhase::Lock, true) if aborting => Step::Send(
                    PushPhase::Unlock,
                    ConnState::PushUnlock,
                    rpc::unlock(h.next_msg_id(), "candidate"),
                ),
                (PushPhase::Lock, true) => {
                    let baseline = h
                        .last_synced
                        .clone()
                        .unwrap_or_else(crate::datastore::empty_root);
                    let current = self
                        .store
                        .device_root(source, device)
                        .unwrap_or_else(crate::datastore::empty_root);
                    match edit_tree(&baseline, &current) {
                        Some(edit) => Step::Send(
                            PushPhase::Edit,
                            ConnState::PushEdit,
                            rpc::edit_config(h.next_msg_id(), "candidate", &edit_body(&edit)),
                        ),
                        None => Step::Send(
                            PushPhase::Unlock,
                            ConnState::PushUnlock,
                            rpc::unlock(h.next_msg_id(), "candidate"),
                        ),
                    }
                }
                (PushPhase::Edit, true) if aborting => Step::Send(
                    PushPhase::Discard,
                    ConnState::PushDiscard,
                    rpc::discard_changes(h.next_msg_id()),
                ),
                (PushPhase::Edit, true) => match push {
                    PushType::Validate => Step::Send(
                        PushPhase::Validate,
                        ConnState::PushValidate,
                        rpc::validate(h.next_msg_id(), "candidate"),
                    ),
                    _ => Step::Send(
                        PushPhase::Commit,
                        ConnState::PushCommit,
                        rpc::commit(h.next_msg_id()),
                    ),
                },
                (PushPhase::Edit, false) => Step::FailRollback(
                    format!("edit-config failed on {device}: {detail}"),
                    PushPhase::Discard,
                    ConnState::PushDiscard,
                    rpc::discard_changes(h.next_msg_id()),
                ),
                (PushPhase::Validate, true) => Step::Send(
                    PushPhase::Discard,
                    ConnState::PushDiscard,
                    rpc::discard_changes(h.next_msg_id()),
                ),
                (PushPhase::Validate, false) => Step::FailRollback(
                    format!("validate failed on {device}: {detail}"),
                    PushPhase::Discard,
                    ConnState::PushDiscard,
                    rpc::discard_changes(h.next_msg_id()),
                ),
                (PushPhase::Commit, true) => Step::Send(
                    PushPhase::Unlock,
                    ConnState::PushUnlock,
                    rpc::unlock(h.next_msg_id(), "candidate"),
                ),
                (PushPhase::Commit, false) => Step::FailRollback(
                    format!("commit failed on {device}: {detail}"),
                    PushPhase::Discard,
                    ConnState::PushDiscard,
                    rpc::discard_changes(h.next_msg_id()),
                ),
                (PushPhase::Discard, _) => Step::Send(
                    PushPhase::Unlock,
                    ConnState::PushUnlock,
                    rpc::unlock(h.next_msg_id(), "candidate"),
                ),
                (PushPhase::Unlock, _) => Step::Settle,
            }
        };

        match step {
            Step::Send(next_phase, state, payload) => {
                // A positive commit reply is the point of no return;
                // this device is never rolled back afterwards.
                let committed = matches!(phase, PushPhase::Commit) && ok;
                {
                    let tx = self.txs.get_mut(tid).expect("transaction present");
                    if let Some(dev) = tx.devices.get_mut(device) {
                        dev.phase = Some(next_phase);
                        if committed {
                            dev.committed = true;
                        }
                    }
                    let h = self.registry.get_mut(device).expect("handle exists");
                    h.set_state(state);
                    arm_timer(h, &self.event_tx, self.cfg.device_timeout);
                }
                self.send_framed(device, &payload, None).await;
            }
            Step::Settle => {
                self.settle_commit_device(tid, device, None);
            }
            Step::FailSettle(reason) => {
                self.settle_commit_device(tid, device, Some(reason));
                self.cascade_abort(tid);
            }
            Step::FailRollback(reason, next_phase, state, payload) => {
                {
                    let tx = self.txs.get_mut(tid).expect("transaction present");
                    if let Some(dev) = tx.devices.get_mut(device) {
                        dev.failure = Some(reason);
                        dev.phase = Some(next_phase);
                    }
                    let h = self.registry.get_mut(device).expect("handle exists");
                    h.set_state(state);
                    arm_timer(h, &self.event_tx, self.cfg.device_timeout);
                }
                self.send_framed(device, &payload, None).await;
                self.cascade_abort(tid);
            }
        }
    }

    /// Final settlement of one device within a controller-commit.
    fn settle_commit_device(&mut self, tid: u64, device: &str, failure: Option<String>) {
        let tx = self.txs.get_mut(tid).expect("transaction present");
        let aborting = tx.aborting;
        if let Some(dev) = tx.devices.get_mut(device) {
            if let Some(failure) = failure {
                dev.failure = Some(failure);
            }
            dev.state = if dev.failure.is_some() || (aborting && !dev.committed) {
                TxDeviceState::Failed
            } else {
                TxDeviceState::Done
            };
        }
        let h = self.registry.get_mut(device).expect("handle exists");
        h.tid = 0;
        if let Some(cancel) = h.timer_cancel.take() {
            cancel.cancel();
        }
        h.set_state(ConnState::Open);
    }

    /// One device failed: flip the transaction into aborting so every
    /// other in-flight device unwinds at its next reply.
    fn cascade_abort(&mut self, tid: u64) {
        if let Some(tx) = self.txs.get_mut(tid) {
            tx.aborting = true;
        }
    }

    // ── transaction-error (user abort) ───────────────────────────────

    async fn cmd_transaction_error(
        &mut self,
        tid: u64,
        origin: Option<String>,
        reason: String,
    ) -> Result<CommandResult, CoreError> {
        if self.txs.get_mut(tid).is_none() {
            return Err(CoreError::TransactionNotFound { tid });
        }
        let reason_text = reason.clone();
        {
            let tx = self.txs.get_mut(tid).expect("transaction present");
            tx.aborting = true;
            tx.reason = Some(reason);
            if origin.is_some() {
                tx.origin = origin;
            }
            tx.actions_pending = false;
        }

        // Unwind in-flight devices: discard whatever an edit placed in
        // their candidate, release locks, and swallow the late replies.
        // A device whose remote commit already completed stays
        // committed; commit is one-way at the protocol level. A device
        // still mid-handshake has no OPEN to return to and is closed.
        let names: Vec<String> = {
            let tx = self.txs.get_mut(tid).expect("transaction present");
            tx.devices.keys().cloned().collect()
        };
        for name in names {
            let (state, phase, committed, kind) = {
                let tx = self.txs.get_mut(tid).expect("transaction present");
                let dev = tx.devices.get(&name).expect("device recorded");
                (dev.state, dev.phase, dev.committed, tx.kind)
            };
            match state {
                TxDeviceState::Waiting => {
                    let tx = self.txs.get_mut(tid).expect("transaction present");
                    let dev = tx.devices.get_mut(&name).expect("device recorded");
                    dev.state = TxDeviceState::Failed;
                }
                TxDeviceState::InProgress => {
                    let mut sends = Vec::new();
                    let resumed = {
                        let h = self.registry.get_mut(&name).expect("handle exists");
                        let resumable = matches!(
                            h.conn_state,
                            ConnState::DeviceSync
                                | ConnState::PushLock
                                | ConnState::PushEdit
                                | ConnState::PushValidate
                                | ConnState::PushCommit
                                | ConnState::PushDiscard
                                | ConnState::PushUnlock
                        );
                        if resumable {
                            // outstanding reply plus each unwind request
                            let mut stray = u32::from(h.pending_msg_id.is_some());
                            match kind {
                                TxKind::Push | TxKind::TemplateApply => {
                                    sends.push(rpc::discard_changes(h.next_msg_id()));
                                    stray += 1;
                                }
                                TxKind::ControllerCommit => {
                                    sends.push(rpc::discard_changes(h.next_msg_id()));
                                    stray += 1;
                                    if phase.is_some() {
                                        sends.push(rpc::unlock(h.next_msg_id(), "candidate"));
                                        stray += 1;
                                    }
                                }
                                _ => {}
                            }
                            h.discard_replies = stray;
                            h.tid = 0;
                            if let Some(cancel) = h.timer_cancel.take() {
                                cancel.cancel();
                            }
                            h.set_state(ConnState::Open);
                        } else {
                            h.tid = 0;
                            h.close(Some(reason_text.clone()));
                        }
                        resumable
                    };
                    for payload in sends {
                        self.send_framed(&name, &payload, None).await;
                    }
                    if !resumed {
                        self.publish_states();
                    }
                    let tx = self.txs.get_mut(tid).expect("transaction present");
                    let dev = tx.devices.get_mut(&name).expect("device recorded");
                    dev.state = if committed {
                        TxDeviceState::Done
                    } else {
                        TxDeviceState::Failed
                    };
                }
                TxDeviceState::Done | TxDeviceState::Failed => {}
            }
        }
        self.publish_states();
        self.finish_with(tid, TxResult::Failed, None);
        Ok(CommandResult::Ok)
    }

    /// Force-terminate a transaction, keeping any reason already set.
    fn finish_with(&mut self, tid: u64, result: TxResult, reason: Option<String>) {
        let Some(mut tx) = self.txs.remove(tid) else {
            return;
        };
        tx.result = result;
        if reason.is_some() {
            tx.reason = reason;
        }
        if tx.reason.is_none() {
            tx.reason = tx.first_failure();
        }
        self.notify_end(&tx);
    }

    // ── Transaction observers ────────────────────────────────────────

    /// A device completed DEVICE_SYNC (initial sync, pull, reconnect).
    async fn on_device_synced(&mut self, device: &str) {
        let Some(h) = self.registry.get_mut(device) else {
            return;
        };
        let tid = h.tid;
        if tid == 0 {
            return;
        }
        h.tid = 0;
        if let Some(tx) = self.txs.get_mut(tid) {
            if let Some(dev) = tx.devices.get_mut(device) {
                dev.state = TxDeviceState::Done;
            }
        }
        self.finish_if_settled(tid);
    }

    /// A device closed; its owning transaction records the failure.
    async fn on_device_closed(&mut self, device: &str) {
        let Some(h) = self.registry.get_mut(device) else {
            return;
        };
        let tid = h.tid;
        if tid == 0 {
            return;
        }
        let failure = h.logmsg.clone();
        h.tid = 0;
        let Some(tx) = self.txs.get_mut(tid) else {
            return;
        };
        if let Some(dev) = tx.devices.get_mut(device) {
            dev.state = TxDeviceState::Failed;
            dev.failure = failure.or_else(|| Some("connection closed".to_string()));
        }
        if tx.kind == TxKind::ControllerCommit {
            tx.aborting = true;
        }
        self.finish_if_settled(tid);
    }

    // ── Read-only commands ───────────────────────────────────────────

    fn cmd_datastore_diff(
        &mut self,
        pattern: &str,
        source1: Ds,
        source2: Ds,
    ) -> Result<CommandResult, CoreError> {
        let mut out = String::new();
        for name in self.registry.matching(pattern)? {
            let a = self.store.device_root(source1, &name);
            let b = self.store.device_root(source2, &name);
            let diff = format_diff(a.as_ref(), b.as_ref());
            if !diff.is_empty() {
                out.push_str(&format!("{name}:\n{diff}"));
            }
        }
        Ok(CommandResult::Diff(out))
    }
}

/// Serialise a diff tree for `<edit-config>`: the outer mount-point
/// element is the controller's own skeleton and never reaches the
/// device, only its children do.
fn edit_body(edit: &XmlNode) -> String {
    edit.children.iter().map(XmlNode::to_xml).collect()
}

/// Arm the single per-handle timer; the previous one is cancelled and
/// a stale firing is ignored by generation.
fn arm_timer(h: &mut DeviceHandle, event_tx: &mpsc::Sender<Event>, timeout: Duration) {
    if let Some(cancel) = h.timer_cancel.take() {
        cancel.cancel();
    }
    h.timer_generation += 1;
    let generation = h.timer_generation;
    let token = CancellationToken::new();
    h.timer_cancel = Some(token.clone());
    let device = h.name().to_string();
    let event_tx = event_tx.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = token.cancelled() => {}
            _ = tokio::time::sleep(timeout) => {
                if event_tx.send(Event::Timeout { device, generation }).await.is_err() {
                    warn!("timer fired after reactor shutdown");
                }
            }
        }
    });
}
