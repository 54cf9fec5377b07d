// ── Inbound message classification ──

use std::collections::BTreeSet;

use crate::error::ProtoError;
use crate::xml::XmlNode;
use crate::{BASE_NAMESPACE, CAP_BASE_10, CAP_BASE_11};

/// Coarse classification of an inbound message by its root element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgKind {
    Hello,
    RpcReply,
    Notification,
    Other,
}

pub fn classify(msg: &XmlNode) -> MsgKind {
    match msg.name.as_str() {
        "hello" => MsgKind::Hello,
        "rpc-reply" => MsgKind::RpcReply,
        "notification" => MsgKind::Notification,
        _ => MsgKind::Other,
    }
}

/// True when the root element resolves to the NETCONF base namespace.
pub fn in_base_namespace(msg: &XmlNode) -> bool {
    msg.namespace.as_deref() == Some(BASE_NAMESPACE)
}

/// The `message-id` attribute, if present and numeric.
pub fn message_id(msg: &XmlNode) -> Option<u64> {
    msg.attr("message-id").and_then(|v| v.parse().ok())
}

/// True for a positive `<rpc-reply>` carrying `<ok/>`.
pub fn is_ok(reply: &XmlNode) -> bool {
    reply.child("ok").is_some()
}

/// Extract a one-line description of an embedded `<rpc-error>`.
pub fn rpc_error_detail(reply: &XmlNode) -> Option<String> {
    let err = reply.child("rpc-error")?;
    let tag = err.child_body("error-tag").unwrap_or("unknown");
    match err.child_body("error-message") {
        Some(msg) => Some(format!("{tag}: {msg}")),
        None => Some(tag.to_string()),
    }
}

/// The capability set advertised by a peer in its hello.
///
/// Lookup matches on the URI up to any `?` query part, since devices
/// commonly append `?module=…&revision=…` to capability URIs.
#[derive(Debug, Clone, Default)]
pub struct Capabilities(BTreeSet<String>);

impl Capabilities {
    pub fn from_hello(hello: &XmlNode) -> Result<Self, ProtoError> {
        let caps = hello.child("capabilities").ok_or_else(|| ProtoError::Message {
            element: "hello".into(),
            reason: "no capabilities found".into(),
        })?;
        let set = caps
            .children_named("capability")
            .filter_map(|c| c.body())
            .map(str::to_string)
            .collect::<BTreeSet<_>>();
        if set.is_empty() {
            return Err(ProtoError::Message {
                element: "hello".into(),
                reason: "empty capability list".into(),
            });
        }
        Ok(Self(set))
    }

    pub fn has(&self, uri: &str) -> bool {
        self.0
            .iter()
            .any(|cap| cap.split('?').next() == Some(uri))
    }

    pub fn base_11(&self) -> bool {
        self.has(CAP_BASE_11)
    }

    pub fn base_10(&self) -> bool {
        self.has(CAP_BASE_10)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}
