//! Translation between controller-namespace RPC XML and core commands.

use std::collections::BTreeMap;

use fleetconf_core::{
    ActionsType, Command, CommandResult, ConnOp, CoreError, Ds, PushType, TransactionEnd,
};
use fleetconf_netconf::{XmlNode, CONTROLLER_NAMESPACE};

/// A request that could not be served; rendered as `<rpc-error>`.
#[derive(Debug)]
pub struct RpcFailure {
    pub tag: String,
    pub app_tag: String,
    pub message: String,
}

impl RpcFailure {
    fn malformed(message: impl Into<String>) -> Self {
        Self {
            tag: "malformed-message".into(),
            app_tag: "malformed-message".into(),
            message: message.into(),
        }
    }

    pub fn from_core(err: CoreError) -> Self {
        Self {
            tag: "operation-failed".into(),
            app_tag: err.app_tag().into(),
            message: err.to_string(),
        }
    }
}

fn pattern_of(op: &XmlNode) -> String {
    op.child_body("devname")
        .or_else(|| op.child_body("device"))
        .unwrap_or("*")
        .to_string()
}

fn bool_child(op: &XmlNode, name: &str) -> bool {
    op.child_body(name) == Some("true")
}

/// Parse one operation element into a core command.
pub fn parse_request(op: &XmlNode) -> Result<Command, RpcFailure> {
    if op.namespace.as_deref() != Some(CONTROLLER_NAMESPACE) {
        return Err(RpcFailure::malformed(format!(
            "unknown namespace {}",
            op.namespace.as_deref().unwrap_or("(none)")
        )));
    }
    match op.name.as_str() {
        // Deprecated aliases for the basic pull/push.
        "sync-pull" => Ok(Command::ConfigPull {
            pattern: pattern_of(op),
            merge: false,
            transient: false,
        }),
        "sync-push" => Ok(Command::ConfigPush {
            pattern: pattern_of(op),
        }),

        "config-pull" => Ok(Command::ConfigPull {
            pattern: pattern_of(op),
            merge: bool_child(op, "merge"),
            transient: bool_child(op, "transient"),
        }),

        "controller-commit" => {
            let push = op
                .child_body("push")
                .map(|s| {
                    PushType::parse(s)
                        .ok_or_else(|| RpcFailure::malformed(format!("bad push type {s}")))
                })
                .transpose()?
                .unwrap_or(PushType::None);
            let actions = op
                .child_body("actions")
                .map(|s| {
                    ActionsType::parse(s)
                        .ok_or_else(|| RpcFailure::malformed(format!("bad actions type {s}")))
                })
                .transpose()?
                .unwrap_or(ActionsType::None);
            let source = op
                .child_body("source")
                .map(|s| {
                    Ds::parse(s).ok_or_else(|| RpcFailure::malformed(format!("bad source {s}")))
                })
                .transpose()?
                .unwrap_or(Ds::Candidate);
            Ok(Command::ControllerCommit {
                pattern: pattern_of(op),
                push,
                actions,
                source,
                service_instance: op.child_body("service-instance").map(str::to_string),
            })
        }

        "datastore-diff" => {
            let parse_ds = |name: &str| -> Result<Ds, RpcFailure> {
                let body = op
                    .child_body(name)
                    .ok_or_else(|| RpcFailure::malformed(format!("missing {name}")))?;
                Ds::parse(body).ok_or_else(|| RpcFailure::malformed(format!("bad {name}: {body}")))
            };
            Ok(Command::DatastoreDiff {
                pattern: pattern_of(op),
                source1: parse_ds("config-type1")?,
                source2: parse_ds("config-type2")?,
            })
        }

        "connection-change" => {
            let operation = match op.child_body("operation") {
                Some("CLOSE") => ConnOp::Close,
                Some("OPEN") => ConnOp::Open,
                Some("RECONNECT") => ConnOp::Reconnect,
                other => {
                    return Err(RpcFailure::malformed(format!(
                        "bad operation {}",
                        other.unwrap_or("(none)")
                    )))
                }
            };
            Ok(Command::ConnectionChange {
                pattern: pattern_of(op),
                op: operation,
            })
        }

        "get-device-sync-config" => {
            let devname = op
                .child_body("devname")
                .ok_or_else(|| RpcFailure::malformed("missing devname"))?;
            Ok(Command::GetDeviceSyncConfig {
                devname: devname.to_string(),
            })
        }

        "transaction-new" => Ok(Command::TransactionNew {
            origin: op.child_body("origin").map(str::to_string),
        }),

        "transaction-error" => {
            let tid = op
                .child_body("tid")
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| RpcFailure::malformed("missing or bad tid"))?;
            Ok(Command::TransactionError {
                tid,
                origin: op.child_body("origin").map(str::to_string),
                reason: op
                    .child_body("reason")
                    .unwrap_or("Aborted by user")
                    .to_string(),
            })
        }

        "device-template-apply" => {
            let template = op
                .child("template")
                .and_then(|t| t.children.first())
                .map(XmlNode::to_xml)
                .ok_or_else(|| RpcFailure::malformed("missing template body"))?;
            let mut variables = BTreeMap::new();
            if let Some(vars) = op.child("variables") {
                for var in vars.children_named("variable") {
                    if let (Some(name), Some(value)) =
                        (var.child_body("name"), var.child_body("value"))
                    {
                        variables.insert(name.to_string(), value.to_string());
                    }
                }
            }
            Ok(Command::TemplateApply {
                pattern: pattern_of(op),
                template,
                variables,
            })
        }

        "get-devices" => Ok(Command::DeviceStatus),

        other => Err(RpcFailure::malformed(format!("unknown operation {other}"))),
    }
}

/// Render a command result as an rpc-reply body.
pub fn render_result(result: CommandResult) -> String {
    match result {
        CommandResult::Ok => "<ok/>".to_string(),
        CommandResult::Tid(tid) => {
            format!("<tid xmlns=\"{CONTROLLER_NAMESPACE}\">{tid}</tid>")
        }
        CommandResult::Diff(diff) => {
            format!(
                "<diff xmlns=\"{CONTROLLER_NAMESPACE}\">{}</diff>",
                escape(&diff)
            )
        }
        CommandResult::Config(config) => format!(
            "<config xmlns=\"{CONTROLLER_NAMESPACE}\">{}</config>",
            config.unwrap_or_default()
        ),
        CommandResult::Devices(devices) => {
            let mut out = format!("<devices xmlns=\"{CONTROLLER_NAMESPACE}\">");
            for dev in devices {
                out.push_str(&format!(
                    "<device><name>{}</name><state>{}</state>",
                    escape(&dev.name),
                    dev.state.as_str()
                ));
                out.push_str(&format!(
                    "<state-timestamp>{}</state-timestamp>",
                    dev.since.to_rfc3339()
                ));
                if let Some(logmsg) = &dev.logmsg {
                    out.push_str(&format!("<logmsg>{}</logmsg>", escape(logmsg)));
                }
                out.push_str("</device>");
            }
            out.push_str("</devices>");
            out
        }
    }
}

/// Render a terminal transaction notification body.
pub fn render_notification(end: &TransactionEnd) -> String {
    let mut out = format!(
        "<controller-transaction xmlns=\"{CONTROLLER_NAMESPACE}\">\
         <tid>{}</tid><result>{}</result>",
        end.tid,
        end.result.as_str()
    );
    if let Some(origin) = &end.origin {
        out.push_str(&format!("<origin>{}</origin>", escape(origin)));
    }
    if let Some(reason) = &end.reason {
        out.push_str(&format!("<reason>{}</reason>", escape(reason)));
    }
    out.push_str("</controller-transaction>");
    out
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

#[cfg(test)]
mod tests {
    use super::*;

    fn op(xml: &str) -> XmlNode {
        XmlNode::parse(xml).unwrap()
    }

    #[test]
    fn parse_config_pull() {
        let cmd = parse_request(&op(&format!(
            "<config-pull xmlns=\"{CONTROLLER_NAMESPACE}\">\
             <devname>dev*</devname><merge>true</merge></config-pull>"
        )))
        .unwrap();
        match cmd {
            Command::ConfigPull {
                pattern,
                merge,
                transient,
            } => {
                assert_eq!(pattern, "dev*");
                assert!(merge);
                assert!(!transient);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn parse_controller_commit() {
        let cmd = parse_request(&op(&format!(
            "<controller-commit xmlns=\"{CONTROLLER_NAMESPACE}\">\
             <device>r1</device><push>COMMIT</push><actions>NONE</actions>\
             <source>ds:running</source></controller-commit>"
        )))
        .unwrap();
        match cmd {
            Command::ControllerCommit {
                pattern,
                push,
                actions,
                source,
                service_instance,
            } => {
                assert_eq!(pattern, "r1");
                assert_eq!(push, PushType::Commit);
                assert_eq!(actions, ActionsType::None);
                assert_eq!(source, Ds::Running);
                assert!(service_instance.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn parse_template_apply_with_variables() {
        let cmd = parse_request(&op(&format!(
            "<device-template-apply xmlns=\"{CONTROLLER_NAMESPACE}\">\
             <devname>r*</devname>\
             <template><interfaces xmlns=\"urn:m1\"><mtu>${{mtu}}</mtu></interfaces></template>\
             <variables><variable><name>mtu</name><value>9000</value></variable></variables>\
             </device-template-apply>"
        )))
        .unwrap();
        match cmd {
            Command::TemplateApply {
                pattern,
                template,
                variables,
            } => {
                assert_eq!(pattern, "r*");
                assert!(template.contains("${mtu}"));
                assert_eq!(variables.get("mtu").map(String::as_str), Some("9000"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn wrong_namespace_is_rejected() {
        let err = parse_request(&op("<config-pull xmlns=\"urn:other\"/>")).unwrap_err();
        assert_eq!(err.tag, "malformed-message");
    }

    #[test]
    fn unknown_operation_is_rejected() {
        let err = parse_request(&op(&format!(
            "<frobnicate xmlns=\"{CONTROLLER_NAMESPACE}\"/>"
        )))
        .unwrap_err();
        assert!(err.message.contains("frobnicate"));
    }

    #[test]
    fn render_tid_and_notification() {
        let body = render_result(CommandResult::Tid(42));
        assert!(body.contains(">42</tid>"));

        let end = TransactionEnd {
            tid: 42,
            result: fleetconf_core::TxResult::Failed,
            origin: Some("cli".into()),
            reason: Some("Aborted by user".into()),
        };
        let notif = render_notification(&end);
        assert!(notif.contains("<tid>42</tid>"));
        assert!(notif.contains("<result>FAILED</result>"));
        assert!(notif.contains("<reason>Aborted by user</reason>"));
    }
}
