// ── RFC 6242 message framing ──
//
// Two modes: end-of-message (a `]]>]]>` sentinel, NETCONF 1.0) and
// chunked (`\n#<len>\n` size-prefixed chunks ended by `\n##\n`,
// NETCONF 1.1). The reader is incremental: bytes arrive in arbitrary
// slices and parser state persists across calls, so it can live inside
// a device handle between socket reads.

use bytes::{Bytes, BytesMut};

use crate::error::ProtoError;

/// Hard ceiling on a single assembled message.
pub const MAX_FRAME: usize = 32 * 1024 * 1024;

const EOM_SENTINEL: &[u8] = b"]]>]]>";

/// Wire framing mode, selected once per session after hello exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramingMode {
    /// NETCONF 1.0 `]]>]]>` delimiter.
    Eom,
    /// NETCONF 1.1 chunked framing.
    Chunked,
}

impl std::fmt::Display for FramingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Eom => write!(f, "eom"),
            Self::Chunked => write!(f, "chunked"),
        }
    }
}

/// Incremental frame parser.
#[derive(Debug)]
pub struct FrameReader {
    mode: FramingMode,
    buf: BytesMut,
    /// Assembled payload of the in-progress chunked message.
    msg: BytesMut,
    /// Bytes still expected for the current chunk body.
    chunk_remaining: usize,
}

impl FrameReader {
    pub fn new(mode: FramingMode) -> Self {
        Self {
            mode,
            buf: BytesMut::new(),
            msg: BytesMut::new(),
            chunk_remaining: 0,
        }
    }

    pub fn mode(&self) -> FramingMode {
        self.mode
    }

    /// Switch framing mode. Only valid between messages.
    pub fn set_mode(&mut self, mode: FramingMode) {
        self.mode = mode;
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty() && self.msg.is_empty()
    }

    /// Discard any partially assembled state.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.msg.clear();
        self.chunk_remaining = 0;
    }

    /// Feed received bytes, returning every message completed by them.
    ///
    /// An empty vec means more bytes are needed. EOF is not the
    /// framer's concern: the transport reports it out-of-band.
    pub fn feed(&mut self, data: &[u8]) -> Result<Vec<Bytes>, ProtoError> {
        self.buf.extend_from_slice(data);
        let mut out = Vec::new();
        loop {
            let msg = match self.mode {
                FramingMode::Eom => self.next_eom()?,
                FramingMode::Chunked => self.next_chunked()?,
            };
            match msg {
                Some(m) => out.push(m),
                None => break,
            }
        }
        Ok(out)
    }

    fn next_eom(&mut self) -> Result<Option<Bytes>, ProtoError> {
        if let Some(pos) = find(&self.buf, EOM_SENTINEL) {
            let payload = self.buf.split_to(pos).freeze();
            let _ = self.buf.split_to(EOM_SENTINEL.len());
            return Ok(Some(payload));
        }
        if self.buf.len() > MAX_FRAME {
            return Err(ProtoError::FrameTooLarge {
                size: self.buf.len(),
                max: MAX_FRAME,
            });
        }
        Ok(None)
    }

    fn next_chunked(&mut self) -> Result<Option<Bytes>, ProtoError> {
        loop {
            // Drain the current chunk body first.
            if self.chunk_remaining > 0 {
                let take = self.chunk_remaining.min(self.buf.len());
                self.msg.extend_from_slice(&self.buf.split_to(take));
                self.chunk_remaining -= take;
                if self.chunk_remaining > 0 {
                    return Ok(None);
                }
            }
            // Need at least `\n##\n` or `\n#<digit>` to decide.
            if self.buf.len() < 3 {
                return Ok(None);
            }
            if self.buf[0] != b'\n' || self.buf[1] != b'#' {
                return Err(ProtoError::Framing(format!(
                    "expected chunk header, got 0x{:02x}{:02x}",
                    self.buf[0], self.buf[1]
                )));
            }
            if self.buf[2] == b'#' {
                if self.buf.len() < 4 {
                    return Ok(None);
                }
                if self.buf[3] != b'\n' {
                    return Err(ProtoError::Framing("malformed end-of-chunks".into()));
                }
                let _ = self.buf.split_to(4);
                return Ok(Some(self.msg.split().freeze()));
            }
            // Chunk size: 1..10 decimal digits followed by LF.
            let Some(nl) = self.buf[2..].iter().position(|b| *b == b'\n') else {
                if self.buf.len() > 2 + 10 {
                    return Err(ProtoError::Framing("chunk size too long".into()));
                }
                return Ok(None);
            };
            let digits = &self.buf[2..2 + nl];
            if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
                return Err(ProtoError::Framing("invalid chunk size".into()));
            }
            let size: usize = std::str::from_utf8(digits)
                .expect("digits are ascii")
                .parse()
                .map_err(|_| ProtoError::Framing("chunk size overflow".into()))?;
            if size == 0 {
                return Err(ProtoError::Framing("zero-length chunk".into()));
            }
            if self.msg.len() + size > MAX_FRAME {
                return Err(ProtoError::FrameTooLarge {
                    size: self.msg.len() + size,
                    max: MAX_FRAME,
                });
            }
            let _ = self.buf.split_to(2 + nl + 1);
            self.chunk_remaining = size;
        }
    }
}

/// Outbound frame encoder, mirror of [`FrameReader`].
pub struct FrameWriter;

impl FrameWriter {
    /// Encapsulate one message payload for the wire.
    pub fn encode(payload: &[u8], mode: FramingMode) -> Bytes {
        match mode {
            FramingMode::Eom => {
                let mut out = BytesMut::with_capacity(payload.len() + EOM_SENTINEL.len());
                out.extend_from_slice(payload);
                out.extend_from_slice(EOM_SENTINEL);
                out.freeze()
            }
            FramingMode::Chunked => {
                let header = format!("\n#{}\n", payload.len());
                let mut out = BytesMut::with_capacity(header.len() + payload.len() + 4);
                out.extend_from_slice(header.as_bytes());
                out.extend_from_slice(payload);
                out.extend_from_slice(b"\n##\n");
                out.freeze()
            }
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eom_single_message() {
        let mut r = FrameReader::new(FramingMode::Eom);
        let msgs = r.feed(b"<hello/>]]>]]>").unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(&msgs[0][..], b"<hello/>");
        assert!(r.is_empty());
    }

    #[test]
    fn eom_partial_reads() {
        let mut r = FrameReader::new(FramingMode::Eom);
        assert!(r.feed(b"<rpc-reply>").unwrap().is_empty());
        assert!(r.feed(b"<ok/></rpc-reply>]]").unwrap().is_empty());
        let msgs = r.feed(b">]]>").unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(&msgs[0][..], b"<rpc-reply><ok/></rpc-reply>");
    }

    #[test]
    fn eom_two_messages_in_one_read() {
        let mut r = FrameReader::new(FramingMode::Eom);
        let msgs = r.feed(b"<a/>]]>]]><b/>]]>]]>").unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(&msgs[0][..], b"<a/>");
        assert_eq!(&msgs[1][..], b"<b/>");
    }

    #[test]
    fn chunked_single_chunk() {
        let mut r = FrameReader::new(FramingMode::Chunked);
        let msgs = r.feed(b"\n#8\n<hello/>\n##\n").unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(&msgs[0][..], b"<hello/>");
    }

    #[test]
    fn chunked_multiple_chunks_split_arbitrarily() {
        let mut r = FrameReader::new(FramingMode::Chunked);
        let wire = b"\n#4\n<rpc\n#8\n-reply/>\n##\n";
        let mut msgs = Vec::new();
        // one byte at a time
        for b in wire.iter() {
            msgs.extend(r.feed(std::slice::from_ref(b)).unwrap());
        }
        assert_eq!(msgs.len(), 1);
        assert_eq!(&msgs[0][..], b"<rpc-reply/>");
    }

    #[test]
    fn chunked_malformed_header_is_protocol_error() {
        let mut r = FrameReader::new(FramingMode::Chunked);
        assert!(matches!(
            r.feed(b"xx#4\nabcd"),
            Err(ProtoError::Framing(_))
        ));
    }

    #[test]
    fn chunked_zero_size_rejected() {
        let mut r = FrameReader::new(FramingMode::Chunked);
        assert!(matches!(r.feed(b"\n#0\n"), Err(ProtoError::Framing(_))));
    }

    #[test]
    fn chunked_oversize_rejected() {
        let mut r = FrameReader::new(FramingMode::Chunked);
        let header = format!("\n#{}\n", MAX_FRAME + 1);
        assert!(matches!(
            r.feed(header.as_bytes()),
            Err(ProtoError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn encode_roundtrip_both_modes() {
        for mode in [FramingMode::Eom, FramingMode::Chunked] {
            let wire = FrameWriter::encode(b"<rpc><get/></rpc>", mode);
            let mut r = FrameReader::new(mode);
            let msgs = r.feed(&wire).unwrap();
            assert_eq!(msgs.len(), 1, "mode {mode}");
            assert_eq!(&msgs[0][..], b"<rpc><get/></rpc>");
        }
    }
}
