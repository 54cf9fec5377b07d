//! Unix-socket RPC listener.
//!
//! Each client speaks NETCONF-framed XML (EOM mode). A request is one
//! `<rpc>` whose first child is a controller-namespace operation; the
//! reply is `<rpc-reply>` with either a result body or an `<rpc-error>`
//! carrying the taxonomy code. `create-subscription` switches the
//! connection into a one-way notification stream.

use std::path::PathBuf;

use chrono::Utc;
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use fleetconf_core::Controller;
use fleetconf_netconf::{message, rpc, FrameReader, FrameWriter, FramingMode, XmlNode};

use super::handlers::{parse_request, render_notification, render_result, RpcFailure};

pub struct RpcServer {
    controller: Controller,
    socket: PathBuf,
    cancel: CancellationToken,
}

impl RpcServer {
    pub fn new(controller: Controller, socket: PathBuf, cancel: CancellationToken) -> Self {
        Self {
            controller,
            socket,
            cancel,
        }
    }

    pub async fn run(self) -> std::io::Result<()> {
        if let Some(parent) = self.socket.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let _ = std::fs::remove_file(&self.socket);
        let listener = UnixListener::bind(&self.socket)?;
        info!(socket = %self.socket.display(), "rpc listener started");
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                accepted = listener.accept() => {
                    let (stream, _) = accepted?;
                    let controller = self.controller.clone();
                    let cancel = self.cancel.clone();
                    tokio::spawn(async move {
                        if let Err(e) = serve_client(stream, controller, cancel).await {
                            debug!(error = %e, "rpc client connection ended");
                        }
                    });
                }
            }
        }
        let _ = std::fs::remove_file(&self.socket);
        Ok(())
    }
}

async fn serve_client(
    stream: UnixStream,
    controller: Controller,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    let (mut reader, mut writer) = stream.into_split();
    let mut frames = FrameReader::new(FramingMode::Eom);
    let mut buf = vec![0u8; 8192];
    loop {
        let n = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            read = tokio::io::AsyncReadExt::read(&mut reader, &mut buf) => read?,
        };
        if n == 0 {
            return Ok(());
        }
        let messages = match frames.feed(&buf[..n]) {
            Ok(messages) => messages,
            Err(e) => {
                send_reply(
                    &mut writer,
                    &rpc::reply_error("malformed-message", "framing-error", &e.to_string()),
                )
                .await?;
                return Ok(());
            }
        };
        for frame in messages {
            let request = std::str::from_utf8(&frame)
                .ok()
                .and_then(|text| XmlNode::parse(text).ok());
            let Some(request) = request else {
                send_reply(
                    &mut writer,
                    &rpc::reply_error("malformed-message", "malformed-message", "unparsable rpc"),
                )
                .await?;
                continue;
            };
            if request.name == "hello" {
                // netconf-style clients greet first; nothing to do.
                continue;
            }
            if request.name != "rpc" {
                send_reply(
                    &mut writer,
                    &rpc::reply_error(
                        "malformed-message",
                        "malformed-message",
                        &format!("expected rpc, got {}", request.name),
                    ),
                )
                .await?;
                continue;
            }
            let msg_id = message::message_id(&request);
            let Some(op) = request.children.first() else {
                send_reply(
                    &mut writer,
                    &rpc::reply_error("malformed-message", "malformed-message", "empty rpc"),
                )
                .await?;
                continue;
            };

            // A subscription turns this connection into a one-way
            // notification stream until the client disconnects.
            if op.name == "create-subscription" {
                send_reply(&mut writer, &rpc::reply_ok(msg_id)).await?;
                return serve_subscription(writer, controller, cancel).await;
            }

            let reply = match parse_request(op) {
                Err(failure) => render_failure(&failure),
                Ok(command) => match controller.execute(command).await {
                    Ok(result) => rpc::reply_body(msg_id, &render_result(result)),
                    Err(err) => render_failure(&RpcFailure::from_core(err)),
                },
            };
            send_reply(&mut writer, &reply).await?;
        }
    }
}

async fn serve_subscription(
    mut writer: tokio::net::unix::OwnedWriteHalf,
    controller: Controller,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    let mut notifications = controller.notifications();
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            end = notifications.recv() => {
                match end {
                    Ok(end) => {
                        let body = render_notification(&end);
                        let xml = rpc::notification(&Utc::now().to_rfc3339(), &body);
                        send_reply(&mut writer, &xml).await?;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        // Best-effort, at-most-once delivery.
                        warn!(missed, "notification subscriber lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return Ok(()),
                }
            }
        }
    }
}

fn render_failure(failure: &RpcFailure) -> String {
    rpc::reply_error(&failure.tag, &failure.app_tag, &failure.message)
}

async fn send_reply(
    writer: &mut tokio::net::unix::OwnedWriteHalf,
    payload: &str,
) -> std::io::Result<()> {
    use tokio::io::AsyncWriteExt;
    let frame = FrameWriter::encode(payload.as_bytes(), FramingMode::Eom);
    writer.write_all(&frame).await?;
    writer.flush().await
}
