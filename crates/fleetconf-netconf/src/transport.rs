// ── Byte-channel transport ──
//
// The controller treats a device connection as an opaque bidirectional
// byte channel with a subprocess lifecycle behind it. The production
// channel is an `ssh -s … netconf` subprocess speaking over its stdio;
// tests use an in-memory duplex pair with the same surface.

use std::process::Stdio;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, Command};

use crate::error::ProtoError;

/// An open byte channel to a peer.
pub struct Transport {
    reader: Box<dyn AsyncRead + Send + Unpin>,
    writer: Box<dyn AsyncWrite + Send + Unpin>,
    child: Option<Child>,
}

impl Transport {
    /// Spawn `ssh -s <target> netconf` and wire its stdio up as the
    /// channel. The subprocess is killed when the write half drops.
    pub fn ssh(addr: &str, user: Option<&str>) -> Result<Self, ProtoError> {
        let target = match user {
            Some(user) => format!("{user}@{addr}"),
            None => addr.to_string(),
        };
        let mut child = Command::new("ssh")
            .arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg("StrictHostKeyChecking=accept-new")
            .arg("-s")
            .arg(&target)
            .arg("netconf")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ProtoError::Spawn(format!("ssh {target}: {e}")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ProtoError::Spawn("ssh stdout not captured".into()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ProtoError::Spawn("ssh stdin not captured".into()))?;
        Ok(Self {
            reader: Box::new(stdout),
            writer: Box::new(stdin),
            child: Some(child),
        })
    }

    /// In-memory connected pair, used by tests and fake devices.
    pub fn pair() -> (Transport, Transport) {
        let (a, b) = tokio::io::duplex(256 * 1024);
        let (ar, aw) = tokio::io::split(a);
        let (br, bw) = tokio::io::split(b);
        (
            Transport {
                reader: Box::new(ar),
                writer: Box::new(aw),
                child: None,
            },
            Transport {
                reader: Box::new(br),
                writer: Box::new(bw),
                child: None,
            },
        )
    }

    /// Split into independently owned halves. The subprocess handle
    /// rides with the writer so dropping it tears the session down.
    pub fn split(self) -> (TransportReader, TransportWriter) {
        (
            TransportReader {
                inner: self.reader,
            },
            TransportWriter {
                inner: self.writer,
                _child: self.child,
            },
        )
    }
}

/// Read half of a transport.
pub struct TransportReader {
    inner: Box<dyn AsyncRead + Send + Unpin>,
}

impl TransportReader {
    /// Read available bytes; `Ok(0)` means the peer closed.
    pub async fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.inner.read(buf).await
    }
}

/// Write half of a transport, owning the subprocess if any.
pub struct TransportWriter {
    inner: Box<dyn AsyncWrite + Send + Unpin>,
    _child: Option<Child>,
}

impl TransportWriter {
    /// Write one already-framed message and flush it.
    pub async fn send(&mut self, frame: &[u8]) -> std::io::Result<()> {
        self.inner.write_all(frame).await?;
        self.inner.flush().await
    }
}
