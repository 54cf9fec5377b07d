// Connection state machine scenarios, driven end-to-end through a
// scripted fake device.

mod common;

use std::time::Duration;

use common::*;
use fleetconf_core::{Command, CommandResult, ConnOp, Ds};
use fleetconf_netconf::CAP_MONITORING;

#[tokio::test]
async fn fresh_connect_fetches_schemas_and_opens() {
    let bed = start(&["r1"], |_| {});
    let mut peer = open_device(&bed, "r1").await;

    // Device advertises monitoring plus two modules, neither cached.
    peer.send_hello(&[CAP_MONITORING]).await;
    let hello = peer.recv().await;
    assert_eq!(hello.name, "hello");

    let (id, _) = peer.expect_rpc("get").await;
    peer.send(&schema_list_reply(
        id,
        &[("m1", "2023-01-01", M1_NS), ("m2", "2023-01-01", "urn:test:m2")],
    ))
    .await;

    let (id, msg) = peer.expect_rpc("get-schema").await;
    assert_eq!(
        msg.child("get-schema").unwrap().child_body("identifier"),
        Some("m1")
    );
    peer.send(&schema_reply(id, "module m1 { }")).await;

    let (id, msg) = peer.expect_rpc("get-schema").await;
    assert_eq!(
        msg.child("get-schema").unwrap().child_body("identifier"),
        Some("m2")
    );
    peer.send(&schema_reply(id, "module m2 { }")).await;

    let (id, msg) = peer.expect_rpc("get-config").await;
    assert!(msg
        .child("get-config")
        .unwrap()
        .find(&["source", "running"])
        .is_some());
    peer.send(&config_reply(
        id,
        &interfaces("<interface><name>eth0</name><mtu>1500</mtu></interface>"),
    ))
    .await;

    let dev = wait_for_device(&bed.controller, "r1", |d| d.state.is_open()).await;
    assert!(dev.logmsg.is_none());

    // Both fetched modules landed in the schema cache.
    assert!(bed.schema_dir.path().join("m1@2023-01-01.yang").exists());
    assert!(bed.schema_dir.path().join("m2@2023-01-01.yang").exists());

    // The synced snapshot is exposed over the RPC surface.
    let config = execute(
        &bed.controller,
        Command::GetDeviceSyncConfig {
            devname: "r1".into(),
        },
    )
    .await
    .unwrap();
    match config {
        CommandResult::Config(Some(xml)) => assert!(xml.contains("eth0")),
        other => panic!("expected synced config, got {other:?}"),
    }
}

#[tokio::test]
async fn missing_monitoring_capability_closes() {
    let bed = start(&["r1"], |_| {});
    let mut peer = open_device(&bed, "r1").await;

    peer.send_hello(&[]).await;
    // The controller still sends its own hello before giving up.
    let hello = peer.recv().await;
    assert_eq!(hello.name, "hello");

    let dev = wait_for_device(&bed.controller, "r1", |d| d.state.is_closed()).await;
    assert_eq!(dev.logmsg.as_deref(), Some("No method to get schemas"));
}

#[tokio::test]
async fn binding_failure_resets_candidate_and_closes() {
    let bed = start(&["r1"], |_| {});
    let mut peer = open_device(&bed, "r1").await;

    peer.send_hello(&[CAP_MONITORING]).await;
    let _hello = peer.recv().await;
    let (id, _) = peer.expect_rpc("get").await;
    peer.send(&schema_list_reply(id, &[("m1", "2023-01-01", M1_NS)]))
        .await;
    let (id, _) = peer.expect_rpc("get-schema").await;
    peer.send(&schema_reply(id, "module m1 { }")).await;
    let (id, _) = peer.expect_rpc("get-config").await;
    // A subtree in a namespace no mounted module declares.
    peer.send(&config_reply(id, "<rogue xmlns=\"urn:test:unknown\"/>"))
        .await;

    let dev = wait_for_device(&bed.controller, "r1", |d| d.state.is_closed()).await;
    assert!(dev
        .logmsg
        .as_deref()
        .unwrap()
        .starts_with("YANG binding failed at mountpoint:"));

    // Candidate was reset from running: no residue, no diff.
    let diff = execute(
        &bed.controller,
        Command::DatastoreDiff {
            pattern: "*".into(),
            source1: Ds::Candidate,
            source2: Ds::Running,
        },
    )
    .await
    .unwrap();
    match diff {
        CommandResult::Diff(text) => assert!(text.is_empty(), "unexpected diff: {text}"),
        other => panic!("expected diff, got {other:?}"),
    }

    // Never reached OPEN, so no synced snapshot exists.
    let config = execute(
        &bed.controller,
        Command::GetDeviceSyncConfig {
            devname: "r1".into(),
        },
    )
    .await
    .unwrap();
    assert!(matches!(config, CommandResult::Config(None)));
}

#[tokio::test]
async fn transient_state_times_out_with_diagnostic() {
    let bed = start(&["r1"], |cfg| {
        cfg.device_timeout = Duration::from_millis(100);
    });
    let mut peer = open_device(&bed, "r1").await;

    // Say nothing: the CONNECTING timer must fire.
    let dev = wait_for_device(&bed.controller, "r1", |d| d.state.is_closed()).await;
    assert_eq!(dev.logmsg.as_deref(), Some("Timeout waiting for remote peer"));
    drop(peer);

    // A reconnect drives CLOSED back through CONNECTING to OPEN.
    let (local, remote) = fleetconf_netconf::transport::Transport::pair();
    bed.connector.add("r1", local);
    execute(
        &bed.controller,
        Command::ConnectionChange {
            pattern: "r1".into(),
            op: ConnOp::Reconnect,
        },
    )
    .await
    .unwrap();
    peer = FakePeer::new(remote);
    drive_to_open(&mut peer, &interfaces("")).await;
    wait_for_device(&bed.controller, "r1", |d| d.state.is_open()).await;
}

#[tokio::test]
async fn cached_schemas_skip_fetch_entirely() {
    let bed = start(&["r1"], |_| {});
    std::fs::write(
        bed.schema_dir.path().join("m1@2023-01-01.yang"),
        "module m1 { }",
    )
    .unwrap();

    let mut peer = open_device(&bed, "r1").await;
    peer.send_hello(&[CAP_MONITORING]).await;
    let _hello = peer.recv().await;
    let (id, _) = peer.expect_rpc("get").await;
    peer.send(&schema_list_reply(id, &[("m1", "2023-01-01", M1_NS)]))
        .await;

    // No get-schema: the next request is the sync directly.
    let (id, _) = peer.expect_rpc("get-config").await;
    peer.send(&config_reply(id, &interfaces(""))).await;
    wait_for_device(&bed.controller, "r1", |d| d.state.is_open()).await;
}

#[tokio::test]
async fn peer_eof_during_schema_fetch_closes() {
    let bed = start(&["r1"], |_| {});
    let mut peer = open_device(&bed, "r1").await;

    peer.send_hello(&[CAP_MONITORING]).await;
    let _hello = peer.recv().await;
    let (id, _) = peer.expect_rpc("get").await;
    peer.send(&schema_list_reply(id, &[("m1", "2023-01-01", M1_NS)]))
        .await;
    let _ = peer.expect_rpc("get-schema").await;
    drop(peer);

    let dev = wait_for_device(&bed.controller, "r1", |d| d.state.is_closed()).await;
    assert!(dev
        .logmsg
        .as_deref()
        .unwrap()
        .starts_with("Remote socket endpoint closed"));
}

#[tokio::test]
async fn disabled_device_is_never_connected() {
    let schema_dir = tempfile::tempdir().unwrap();
    let config = fleetconf_core::ControllerConfig {
        schema_dir: schema_dir.path().to_path_buf(),
        ..Default::default()
    };
    let mut dev = fleetconf_core::DeviceConfig::new("lab", "192.0.2.1");
    dev.enabled = false;
    let connector = TestConnector::new();
    let (controller, _task) = fleetconf_core::Controller::spawn(
        config,
        vec![dev],
        connector,
        Box::new(fleetconf_core::MemDatastore::new()),
        fleetconf_core::SchemaPolicy::default(),
    );

    execute(
        &controller,
        Command::ConnectionChange {
            pattern: "*".into(),
            op: ConnOp::Open,
        },
    )
    .await
    .unwrap();

    let dev = wait_for_device(&controller, "lab", |d| d.state.is_closed()).await;
    assert_eq!(dev.logmsg.as_deref(), Some("Configured down"));
}
