// Shared harness for controller integration tests: a connector that
// hands out pre-scripted in-memory transports, and a fake device peer
// driven inline by each test.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast;

use fleetconf_core::{
    Command, CommandResult, ConnOp, Connector, Controller, ControllerConfig, CoreError,
    DeviceConfig, DeviceSummary, MemDatastore, SchemaPolicy, TransactionEnd,
};
use fleetconf_netconf::transport::{Transport, TransportReader, TransportWriter};
use fleetconf_netconf::{
    message, rpc, FrameReader, FrameWriter, FramingMode, ProtoError, XmlNode, CAP_MONITORING,
    MONITORING_NAMESPACE,
};

pub const M1_NS: &str = "urn:test:m1";

// ── Scripted connector ───────────────────────────────────────────────

/// Hands out queued transports per device name; connect fails when the
/// queue is empty.
#[derive(Default)]
pub struct TestConnector {
    transports: Mutex<HashMap<String, VecDeque<Transport>>>,
}

impl TestConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add(&self, name: &str, transport: Transport) {
        self.transports
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_default()
            .push_back(transport);
    }
}

impl Connector for TestConnector {
    fn connect<'a>(
        &'a self,
        device: &'a DeviceConfig,
    ) -> Pin<Box<dyn Future<Output = Result<Transport, ProtoError>> + Send + 'a>> {
        Box::pin(async move {
            self.transports
                .lock()
                .unwrap()
                .get_mut(&device.name)
                .and_then(VecDeque::pop_front)
                .ok_or_else(|| ProtoError::Spawn(format!("no transport scripted for {}", device.name)))
        })
    }
}

// ── Fake device peer ─────────────────────────────────────────────────

pub struct FakePeer {
    reader: TransportReader,
    writer: TransportWriter,
    frames: FrameReader,
    queue: VecDeque<XmlNode>,
}

impl FakePeer {
    pub fn new(transport: Transport) -> Self {
        let (reader, writer) = transport.split();
        Self {
            reader,
            writer,
            frames: FrameReader::new(FramingMode::Eom),
            queue: VecDeque::new(),
        }
    }

    pub async fn send(&mut self, payload: &str) {
        let frame = FrameWriter::encode(payload.as_bytes(), FramingMode::Eom);
        self.writer.send(&frame).await.expect("peer write");
    }

    pub async fn send_hello(&mut self, extra_caps: &[&str]) {
        self.send(&rpc::hello_server(1, extra_caps)).await;
    }

    /// Next message from the controller, failing the test after 5s.
    pub async fn recv(&mut self) -> XmlNode {
        tokio::time::timeout(Duration::from_secs(5), self.recv_inner())
            .await
            .expect("timed out waiting for controller message")
    }

    async fn recv_inner(&mut self) -> XmlNode {
        loop {
            if let Some(msg) = self.queue.pop_front() {
                return msg;
            }
            let mut buf = [0u8; 8192];
            let n = self.reader.read(&mut buf).await.expect("peer read");
            assert!(n > 0, "controller closed the connection");
            for frame in self.frames.feed(&buf[..n]).expect("peer framing") {
                let text = std::str::from_utf8(&frame).expect("utf8 frame");
                self.queue.push_back(XmlNode::parse(text).expect("frame xml"));
            }
        }
    }

    /// Assert no message arrives within the window.
    pub async fn expect_silence(&mut self, window: Duration) {
        assert!(self.queue.is_empty(), "queued message during silence window");
        let mut buf = [0u8; 8192];
        match tokio::time::timeout(window, self.reader.read(&mut buf)).await {
            Err(_) => {}
            Ok(Ok(0)) => {}
            Ok(read) => panic!("unexpected traffic during silence window: {read:?}"),
        }
    }

    /// Receive an rpc and assert its operation element name.
    pub async fn expect_rpc(&mut self, op: &str) -> (u64, XmlNode) {
        let msg = self.recv().await;
        assert_eq!(msg.name, "rpc", "expected rpc, got {}", msg.name);
        let id = message::message_id(&msg).expect("rpc without message-id");
        assert!(
            msg.child(op).is_some(),
            "expected <{op}>, got {}",
            msg.to_xml()
        );
        (id, msg)
    }
}

// ── Reply builders ───────────────────────────────────────────────────

/// RFC 6022 schema list reply: (identifier, revision, namespace).
pub fn schema_list_reply(msg_id: u64, modules: &[(&str, &str, &str)]) -> String {
    let mut entries = String::new();
    for (name, rev, ns) in modules {
        entries.push_str(&format!(
            "<schema><identifier>{name}</identifier><version>{rev}</version>\
             <format>yang</format><namespace>{ns}</namespace>\
             <location>NETCONF</location></schema>"
        ));
    }
    rpc::reply_body(
        Some(msg_id),
        &format!(
            "<data><netconf-state xmlns=\"{MONITORING_NAMESPACE}\">\
             <schemas>{entries}</schemas></netconf-state></data>"
        ),
    )
}

pub fn schema_reply(msg_id: u64, yang: &str) -> String {
    rpc::reply_body(Some(msg_id), &format!("<data>{yang}</data>"))
}

pub fn config_reply(msg_id: u64, inner: &str) -> String {
    rpc::reply_body(Some(msg_id), &format!("<data>{inner}</data>"))
}

pub fn interfaces(entries: &str) -> String {
    format!("<interfaces xmlns=\"{M1_NS}\">{entries}</interfaces>")
}

// ── Controller test bed ──────────────────────────────────────────────

pub struct TestBed {
    pub controller: Controller,
    pub connector: Arc<TestConnector>,
    pub schema_dir: tempfile::TempDir,
}

pub fn start(devices: &[&str], tweak: impl FnOnce(&mut ControllerConfig)) -> TestBed {
    let schema_dir = tempfile::tempdir().expect("tempdir");
    let mut config = ControllerConfig {
        schema_dir: schema_dir.path().to_path_buf(),
        device_timeout: Duration::from_secs(5),
        ..ControllerConfig::default()
    };
    tweak(&mut config);
    let inventory = devices
        .iter()
        .map(|name| DeviceConfig::new(*name, format!("198.51.100.1:{name}")))
        .collect();
    let connector = TestConnector::new();
    let (controller, _task) = Controller::spawn(
        config,
        inventory,
        connector.clone(),
        Box::new(MemDatastore::new()),
        SchemaPolicy::default(),
    );
    TestBed {
        controller,
        connector,
        schema_dir,
    }
}

/// Open the named device and return its scripted peer. The caller
/// drives the handshake.
pub async fn open_device(bed: &TestBed, name: &str) -> FakePeer {
    let (local, remote) = Transport::pair();
    bed.connector.add(name, local);
    bed.controller
        .execute(Command::ConnectionChange {
            pattern: name.to_string(),
            op: ConnOp::Open,
        })
        .await
        .expect("connection-change");
    FakePeer::new(remote)
}

/// Standard handshake: hello, schema list with one module `m1`, a
/// get-schema fetch when `m1` is not already cached, then the initial
/// sync with the given config.
pub async fn drive_to_open(peer: &mut FakePeer, config: &str) {
    peer.send_hello(&[CAP_MONITORING]).await;
    let hello = peer.recv().await;
    assert_eq!(hello.name, "hello");
    let (id, _) = peer.expect_rpc("get").await;
    peer.send(&schema_list_reply(id, &[("m1", "2023-01-01", M1_NS)]))
        .await;
    let mut msg = peer.recv().await;
    if msg.child("get-schema").is_some() {
        let id = message::message_id(&msg).expect("rpc without message-id");
        peer.send(&schema_reply(id, "module m1 { namespace \"urn:test:m1\"; }"))
            .await;
        msg = peer.recv().await;
    }
    assert!(msg.child("get-config").is_some(), "expected sync, got {}", msg.to_xml());
    let id = message::message_id(&msg).expect("rpc without message-id");
    peer.send(&config_reply(id, config)).await;
}

// ── Observation helpers ──────────────────────────────────────────────

pub async fn wait_for_device<F>(controller: &Controller, name: &str, pred: F) -> DeviceSummary
where
    F: Fn(&DeviceSummary) -> bool,
{
    let mut rx = controller.device_states();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            {
                let snapshot = rx.borrow().clone();
                if let Some(dev) = snapshot.iter().find(|d| d.name == name) {
                    if pred(dev) {
                        return dev.clone();
                    }
                }
            }
            rx.changed().await.expect("state channel closed");
        }
    })
    .await
    .expect("timed out waiting for device state")
}

pub async fn next_notification(rx: &mut broadcast::Receiver<TransactionEnd>) -> TransactionEnd {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for notification")
        .expect("notification stream closed")
}

pub fn tid_of(result: CommandResult) -> u64 {
    match result {
        CommandResult::Tid(tid) => tid,
        other => panic!("expected tid, got {other:?}"),
    }
}

pub async fn execute(controller: &Controller, command: Command) -> Result<CommandResult, CoreError> {
    controller.execute(command).await
}
