// ── Device connection state machine ──
//
//  CLOSED ──connect──▶ CONNECTING ──recv hello──▶ SCHEMA_LIST
//  SCHEMA_LIST ──schemas; none missing──▶ DEVICE_SYNC
//  SCHEMA_LIST ──schemas; n missing────▶ SCHEMA_ONE(0)
//  SCHEMA_ONE(k) ──schema k; more──▶ SCHEMA_ONE(k+1)
//  SCHEMA_ONE(k) ──schema k; done──▶ DEVICE_SYNC
//  DEVICE_SYNC ──config; commit ok──▶ OPEN
//  OPEN ──push begin──▶ PUSH_* ──reply──▶ OPEN
//  any transient ──timeout / protocol error / eof──▶ CLOSED
//
// Handlers interpret one inbound message against the current state,
// mutate the handle, and return the side effects for the reactor to
// execute. No retry lives here: every failure closes the connection
// with a diagnostic and the owning transaction observes the change.

use tracing::debug;

use fleetconf_netconf::{message, rpc, FramingMode, XmlNode, CAP_MONITORING};

use crate::datastore::{Datastore, Ds, PutOp, ValidateLevel};
use crate::device::handle::DeviceHandle;
use crate::model::device::{ConnState, YangConfig};
use crate::schema::{module_set_from_schema_list, MountedSchema, SchemaCache, SchemaPolicy};

/// Side effects of a state transition, executed by the reactor.
#[derive(Debug)]
pub enum Effect {
    /// Send one message, framed in the session's current mode unless
    /// overridden (hello is always EOM-framed).
    Send {
        payload: String,
        mode: Option<FramingMode>,
    },
    /// Switch the session framing mode (post-hello negotiation).
    SetFraming(FramingMode),
    RearmTimer,
    DisarmTimer,
    /// Device completed DEVICE_SYNC and reached OPEN.
    SyncCommitted,
    /// Reply received in a PUSH_* state; the transaction engine owns
    /// what happens next.
    PushReply { ok: bool, detail: Option<String> },
    /// Handle is now CLOSED with a diagnostic recorded.
    Closed,
}

/// Reactor-owned collaborators the handlers need.
pub struct StateCtx<'a> {
    pub store: &'a mut dyn Datastore,
    pub cache: &'a SchemaCache,
    pub policy: &'a SchemaPolicy,
    /// Pin framing to the configured mode, skipping negotiation.
    pub pin_framing: bool,
}

/// Dispatch one inbound message against the handle's current state.
pub fn on_message(h: &mut DeviceHandle, ctx: &mut StateCtx<'_>, msg: &XmlNode) -> Vec<Effect> {
    // Late replies to an aborted transaction are drained, not dispatched.
    if h.conn_state.is_open() && h.discard_replies > 0 {
        h.discard_replies -= 1;
        debug!(device = %h.name(), msg = %msg.name, remaining = h.discard_replies,
               "discarding stale reply of aborted transaction");
        return Vec::new();
    }
    h.pending_msg_id = None;
    match h.conn_state {
        ConnState::Connecting => recv_hello(h, ctx, msg),
        ConnState::SchemaList => recv_schema_list(h, ctx, msg),
        ConnState::SchemaOne(_) => recv_get_schema(h, ctx, msg),
        ConnState::DeviceSync => recv_config(h, ctx, msg),
        ConnState::PushLock
        | ConnState::PushEdit
        | ConnState::PushValidate
        | ConnState::PushCommit
        | ConnState::PushDiscard
        | ConnState::PushUnlock => recv_push_reply(h, msg),
        ConnState::Closed | ConnState::Open | ConnState::Wresp => close(
            h,
            format!("Unexpected msg {} in state {}", msg.name, h.conn_state),
        ),
    }
}

fn close(h: &mut DeviceHandle, diagnostic: String) -> Vec<Effect> {
    h.close(Some(diagnostic));
    vec![Effect::Closed]
}

/// Reply envelope checks shared by every post-hello state.
fn check_rpc_reply(h: &mut DeviceHandle, msg: &XmlNode) -> Result<(), Vec<Effect>> {
    if msg.name != "rpc-reply" {
        return Err(close(
            h,
            format!("Unexpected msg {} in state {}", msg.name, h.conn_state),
        ));
    }
    if !message::in_base_namespace(msg) {
        return Err(close(
            h,
            format!(
                "No appropriate namespace associated with {}",
                msg.namespace.as_deref().unwrap_or("(none)")
            ),
        ));
    }
    Ok(())
}

// ── CONNECTING ────────────────────────────────────────────────────────

fn recv_hello(h: &mut DeviceHandle, ctx: &StateCtx<'_>, msg: &XmlNode) -> Vec<Effect> {
    if msg.name != "hello" {
        return close(
            h,
            format!("Unexpected msg {} in state {}", msg.name, h.conn_state),
        );
    }
    if !message::in_base_namespace(msg) {
        return close(
            h,
            format!(
                "No appropriate namespace associated with {}",
                msg.namespace.as_deref().unwrap_or("(none)")
            ),
        );
    }
    let caps = match message::Capabilities::from_hello(msg) {
        Ok(caps) => caps,
        Err(_) => return close(h, "No capabilities found".to_string()),
    };
    if !caps.base_10() && !caps.base_11() {
        return close(h, "No base netconf capability found".to_string());
    }
    let negotiated = if caps.base_11() && !ctx.pin_framing {
        FramingMode::Chunked
    } else {
        FramingMode::Eom
    };
    debug!(device = %h.name(), framing = %negotiated, "hello received");
    let has_monitoring = caps.has(CAP_MONITORING);
    h.capabilities = Some(caps);

    // Our hello goes out before any close, and always EOM-framed.
    let mut effects = vec![Effect::Send {
        payload: rpc::hello(),
        mode: Some(FramingMode::Eom),
    }];
    if !has_monitoring {
        h.close(Some("No method to get schemas".to_string()));
        effects.push(Effect::Closed);
        return effects;
    }
    effects.push(Effect::SetFraming(negotiated));
    effects.push(Effect::Send {
        payload: rpc::get_schema_list(h.next_msg_id()),
        mode: None,
    });
    h.set_state(ConnState::SchemaList);
    effects.push(Effect::RearmTimer);
    effects
}

// ── SCHEMA_LIST ───────────────────────────────────────────────────────

fn recv_schema_list(h: &mut DeviceHandle, ctx: &mut StateCtx<'_>, msg: &XmlNode) -> Vec<Effect> {
    if let Err(effects) = check_rpc_reply(h, msg) {
        return effects;
    }
    let Some(schemas) = msg.find(&["data", "netconf-state", "schemas"]) else {
        return close(h, "No schemas returned".to_string());
    };
    h.module_set = module_set_from_schema_list(schemas, ctx.policy);
    h.fetch_cursor = 0;
    debug!(device = %h.name(), modules = h.module_set.len(), "schema list received");
    proceed_with_schemas(h, ctx)
}

// ── SCHEMA_ONE(k) ─────────────────────────────────────────────────────

fn recv_get_schema(h: &mut DeviceHandle, ctx: &mut StateCtx<'_>, msg: &XmlNode) -> Vec<Effect> {
    if let Err(effects) = check_rpc_reply(h, msg) {
        return effects;
    }
    let Some(module) = h.fetching.take() else {
        return close(h, "Unexpected get-schema reply".to_string());
    };
    let Some(text) = msg.child_body("data") else {
        return close(h, "Invalid get-schema, no YANG body".to_string());
    };
    let text = (ctx.policy.postprocess)(&module, text.to_string());
    if let Err(err) = ctx
        .cache
        .store(&module.name, module.revision.as_deref(), &text)
    {
        return close(h, format!("Failed to write schema {}: {err}", module.name));
    }
    proceed_with_schemas(h, ctx)
}

/// Fetch the next missing module, or mount the set and start the sync.
fn proceed_with_schemas(h: &mut DeviceHandle, ctx: &mut StateCtx<'_>) -> Vec<Effect> {
    while h.fetch_cursor < h.module_set.len() {
        let module = h.module_set[h.fetch_cursor].clone();
        let index = h.fetch_cursor;
        h.fetch_cursor += 1;
        let compiled = h
            .mounted
            .as_ref()
            .is_some_and(|m| m.contains(&module.name, module.revision.as_deref()));
        if compiled || ctx.cache.contains(&module.name, module.revision.as_deref()) {
            continue;
        }
        let payload = rpc::get_schema(h.next_msg_id(), &module.name, module.revision.as_deref());
        h.fetching = Some(module);
        h.set_state(ConnState::SchemaOne(index));
        return vec![
            Effect::Send {
                payload,
                mode: None,
            },
            Effect::RearmTimer,
        ];
    }
    // All schemas present: compile, mount, and sync the device config.
    let mounted = std::sync::Arc::new(MountedSchema::compile(h.module_set.clone()));
    h.mounted = Some(mounted.clone());
    ctx.store.mount(h.name(), mounted);
    let payload = rpc::get_config(h.next_msg_id(), "running");
    h.set_state(ConnState::DeviceSync);
    vec![
        Effect::Send {
            payload,
            mode: None,
        },
        Effect::RearmTimer,
    ]
}

// ── DEVICE_SYNC ───────────────────────────────────────────────────────

fn recv_config(h: &mut DeviceHandle, ctx: &mut StateCtx<'_>, msg: &XmlNode) -> Vec<Effect> {
    if let Err(effects) = check_rpc_reply(h, msg) {
        return effects;
    }
    let Some(data) = msg.child("data") else {
        let detail = message::rpc_error_detail(msg).unwrap_or_else(|| "no data".to_string());
        return close(h, format!("Invalid get-config reply: {detail}"));
    };

    let mut root = crate::datastore::empty_root();
    root.children = data.children.clone();
    root.sort_recurse();

    let Some(mounted) = h.mounted.clone() else {
        return close(h, "No YANGs available".to_string());
    };
    if let Err(detail) = mounted.binds(&root) {
        ctx.store.discard();
        return close(h, format!("YANG binding failed at mountpoint: {detail}"));
    }

    let transient = h.pull_transient;
    let merge = h.pull_merge;
    h.pull_transient = false;
    h.pull_merge = false;

    if !transient {
        ctx.store
            .put_device_root(Ds::Candidate, h.name(), PutOp::Replace, root.clone());
        let level = match h.config.yang_config {
            YangConfig::Validate => ValidateLevel::Full,
            YangConfig::Bind => ValidateLevel::None,
        };
        if ctx.store.commit(level).is_err() {
            ctx.store.discard();
            return close(h, "Failed to commit".to_string());
        }
    }

    match (&mut h.last_synced, merge) {
        (Some(existing), true) => crate::datastore::merge_node(existing, root),
        (slot, _) => *slot = Some(root),
    }
    h.set_state(ConnState::Open);
    vec![Effect::DisarmTimer, Effect::SyncCommitted]
}

// ── PUSH_* ────────────────────────────────────────────────────────────

fn recv_push_reply(h: &mut DeviceHandle, msg: &XmlNode) -> Vec<Effect> {
    if let Err(effects) = check_rpc_reply(h, msg) {
        return effects;
    }
    let detail = message::rpc_error_detail(msg);
    vec![Effect::PushReply {
        ok: detail.is_none(),
        detail,
    }]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::MemDatastore;
    use crate::model::device::DeviceConfig;
    use crate::schema::SchemaCache;
    use fleetconf_netconf::BASE_NAMESPACE;

    fn handle_in(state: ConnState) -> DeviceHandle {
        let mut h = DeviceHandle::new(DeviceConfig::new("r1", "10.0.0.1"), FramingMode::Eom);
        h.set_state(state);
        h
    }

    fn ctx_parts() -> (MemDatastore, SchemaCache, SchemaPolicy) {
        (
            MemDatastore::new(),
            SchemaCache::new(std::env::temp_dir().join("fleetconf-state-tests")),
            SchemaPolicy::default(),
        )
    }

    fn device_hello(caps: &[&str]) -> XmlNode {
        let caps_xml: String = caps
            .iter()
            .map(|c| format!("<capability>{c}</capability>"))
            .collect();
        XmlNode::parse(&format!(
            "<hello xmlns=\"{BASE_NAMESPACE}\"><capabilities>{caps_xml}</capabilities></hello>"
        ))
        .unwrap()
    }

    #[test]
    fn hello_without_monitoring_closes_after_sending_hello() {
        let (mut store, cache, policy) = ctx_parts();
        let mut ctx = StateCtx {
            store: &mut store,
            cache: &cache,
            policy: &policy,
            pin_framing: false,
        };
        let mut h = handle_in(ConnState::Connecting);
        let effects = on_message(
            &mut h,
            &mut ctx,
            &device_hello(&["urn:ietf:params:netconf:base:1.0"]),
        );
        assert!(matches!(effects[0], Effect::Send { .. }));
        assert!(matches!(effects.last(), Some(Effect::Closed)));
        assert!(h.conn_state.is_closed());
        assert_eq!(h.logmsg.as_deref(), Some("No method to get schemas"));
    }

    #[test]
    fn hello_negotiates_chunked_unless_pinned() {
        for (pin, expected) in [(false, FramingMode::Chunked), (true, FramingMode::Eom)] {
            let (mut store, cache, policy) = ctx_parts();
            let mut ctx = StateCtx {
                store: &mut store,
                cache: &cache,
                policy: &policy,
                pin_framing: pin,
            };
            let mut h = handle_in(ConnState::Connecting);
            let effects = on_message(
                &mut h,
                &mut ctx,
                &device_hello(&[
                    "urn:ietf:params:netconf:base:1.1",
                    CAP_MONITORING,
                ]),
            );
            let framing = effects.iter().find_map(|e| match e {
                Effect::SetFraming(m) => Some(*m),
                _ => None,
            });
            assert_eq!(framing, Some(expected), "pin={pin}");
            assert_eq!(h.conn_state, ConnState::SchemaList);
        }
    }

    #[test]
    fn unexpected_message_in_open_closes() {
        let (mut store, cache, policy) = ctx_parts();
        let mut ctx = StateCtx {
            store: &mut store,
            cache: &cache,
            policy: &policy,
            pin_framing: false,
        };
        let mut h = handle_in(ConnState::Open);
        let msg = XmlNode::parse(&format!("<rpc-reply xmlns=\"{BASE_NAMESPACE}\"><ok/></rpc-reply>"))
            .unwrap();
        let effects = on_message(&mut h, &mut ctx, &msg);
        assert!(matches!(effects[0], Effect::Closed));
        assert_eq!(
            h.logmsg.as_deref(),
            Some("Unexpected msg rpc-reply in state OPEN")
        );
    }

    #[test]
    fn stale_replies_are_discarded_in_open() {
        let (mut store, cache, policy) = ctx_parts();
        let mut ctx = StateCtx {
            store: &mut store,
            cache: &cache,
            policy: &policy,
            pin_framing: false,
        };
        let mut h = handle_in(ConnState::Open);
        h.discard_replies = 2;
        let msg = XmlNode::parse(&format!("<rpc-reply xmlns=\"{BASE_NAMESPACE}\"><ok/></rpc-reply>"))
            .unwrap();
        assert!(on_message(&mut h, &mut ctx, &msg).is_empty());
        assert_eq!(h.discard_replies, 1);
        assert!(h.conn_state.is_open());
    }

    #[test]
    fn push_reply_reports_rpc_error_detail() {
        let (mut store, cache, policy) = ctx_parts();
        let mut ctx = StateCtx {
            store: &mut store,
            cache: &cache,
            policy: &policy,
            pin_framing: false,
        };
        let mut h = handle_in(ConnState::PushLock);
        let msg = XmlNode::parse(&format!(
            "<rpc-reply xmlns=\"{BASE_NAMESPACE}\"><rpc-error>\
             <error-tag>lock-denied</error-tag></rpc-error></rpc-reply>"
        ))
        .unwrap();
        let effects = on_message(&mut h, &mut ctx, &msg);
        assert!(matches!(
            &effects[0],
            Effect::PushReply { ok: false, detail: Some(d) } if d.contains("lock-denied")
        ));
    }
}
