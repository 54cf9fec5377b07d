// ── Outbound message builders ──
//
// NETCONF requests are small and fixed-shape, so they are built by
// string assembly (attributes and bodies are escaped; embedded config
// payloads arrive already serialised from [`XmlNode::to_xml`]).

use crate::xml::XmlNode;
use crate::{BASE_NAMESPACE, CAP_BASE_10, CAP_BASE_11, MONITORING_NAMESPACE};

fn rpc_open(message_id: u64) -> String {
    format!("<rpc xmlns=\"{BASE_NAMESPACE}\" message-id=\"{message_id}\">")
}

/// Client `<hello>` advertising both base versions.
pub fn hello() -> String {
    format!(
        "<hello xmlns=\"{BASE_NAMESPACE}\"><capabilities>\
         <capability>{CAP_BASE_10}</capability>\
         <capability>{CAP_BASE_11}</capability>\
         </capabilities></hello>"
    )
}

/// Server `<hello>` with a session id and arbitrary extra capabilities.
pub fn hello_server(session_id: u32, extra_caps: &[&str]) -> String {
    let mut caps = format!("<capability>{CAP_BASE_10}</capability>");
    for cap in extra_caps {
        caps.push_str(&format!("<capability>{}</capability>", escape(cap)));
    }
    format!(
        "<hello xmlns=\"{BASE_NAMESPACE}\"><capabilities>{caps}</capabilities>\
         <session-id>{session_id}</session-id></hello>"
    )
}

/// Filtered `<get>` for the RFC 6022 `schemas` container.
pub fn get_schema_list(message_id: u64) -> String {
    format!(
        "{}<get><filter type=\"subtree\">\
         <netconf-state xmlns=\"{MONITORING_NAMESPACE}\"><schemas/></netconf-state>\
         </filter></get></rpc>",
        rpc_open(message_id)
    )
}

/// `<get-config>` from the named source datastore.
pub fn get_config(message_id: u64, source: &str) -> String {
    format!(
        "{}<get-config><source><{source}/></source></get-config></rpc>",
        rpc_open(message_id)
    )
}

/// RFC 6022 `<get-schema>` for one module.
pub fn get_schema(message_id: u64, identifier: &str, version: Option<&str>) -> String {
    let mut body = format!(
        "<get-schema xmlns=\"{MONITORING_NAMESPACE}\">\
         <identifier>{}</identifier>",
        escape(identifier)
    );
    if let Some(version) = version {
        body.push_str(&format!("<version>{}</version>", escape(version)));
    }
    body.push_str("<format>yang</format></get-schema>");
    format!("{}{body}</rpc>", rpc_open(message_id))
}

/// `<edit-config>` carrying already-serialised config XML.
pub fn edit_config(message_id: u64, target: &str, config: &str) -> String {
    format!(
        "{}<edit-config><target><{target}/></target>\
         <default-operation>none</default-operation>\
         <config xmlns:nc=\"{BASE_NAMESPACE}\">{config}</config></edit-config></rpc>",
        rpc_open(message_id)
    )
}

pub fn lock(message_id: u64, target: &str) -> String {
    format!(
        "{}<lock><target><{target}/></target></lock></rpc>",
        rpc_open(message_id)
    )
}

pub fn unlock(message_id: u64, target: &str) -> String {
    format!(
        "{}<unlock><target><{target}/></target></unlock></rpc>",
        rpc_open(message_id)
    )
}

pub fn validate(message_id: u64, source: &str) -> String {
    format!(
        "{}<validate><source><{source}/></source></validate></rpc>",
        rpc_open(message_id)
    )
}

pub fn commit(message_id: u64) -> String {
    format!("{}<commit/></rpc>", rpc_open(message_id))
}

pub fn discard_changes(message_id: u64) -> String {
    format!("{}<discard-changes/></rpc>", rpc_open(message_id))
}

// ── Reply builders (RPC surface and test fakes) ──────────────────────

pub fn reply_ok(message_id: Option<u64>) -> String {
    match message_id {
        Some(id) => format!(
            "<rpc-reply xmlns=\"{BASE_NAMESPACE}\" message-id=\"{id}\"><ok/></rpc-reply>"
        ),
        None => format!("<rpc-reply xmlns=\"{BASE_NAMESPACE}\"><ok/></rpc-reply>"),
    }
}

/// `<rpc-reply>` wrapping already-serialised body XML.
pub fn reply_body(message_id: Option<u64>, body: &str) -> String {
    match message_id {
        Some(id) => format!(
            "<rpc-reply xmlns=\"{BASE_NAMESPACE}\" message-id=\"{id}\">{body}</rpc-reply>"
        ),
        None => format!("<rpc-reply xmlns=\"{BASE_NAMESPACE}\">{body}</rpc-reply>"),
    }
}

/// `<rpc-error>` reply with the taxonomy code in `error-app-tag`.
pub fn reply_error(tag: &str, app_tag: &str, message: &str) -> String {
    format!(
        "<rpc-reply xmlns=\"{BASE_NAMESPACE}\"><rpc-error>\
         <error-type>application</error-type>\
         <error-tag>{}</error-tag>\
         <error-app-tag>{}</error-app-tag>\
         <error-severity>error</error-severity>\
         <error-message>{}</error-message>\
         </rpc-error></rpc-reply>",
        escape(tag),
        escape(app_tag),
        escape(message)
    )
}

/// `<notification>` wrapping already-serialised body XML.
pub fn notification(event_time: &str, body: &str) -> String {
    format!(
        "<notification xmlns=\"urn:ietf:params:xml:ns:netconf:notification:1.0\">\
         <eventTime>{event_time}</eventTime>{body}</notification>"
    )
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(ch),
        }
    }
    out
}
