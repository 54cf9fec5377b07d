use thiserror::Error;

/// Errors raised by the protocol layer.
#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("framing error: {0}")]
    Framing(String),

    #[error("frame of {size} bytes exceeds maximum of {max}")]
    FrameTooLarge { size: usize, max: usize },

    #[error("malformed XML: {0}")]
    Xml(String),

    #[error("malformed {element} message: {reason}")]
    Message {
        element: String,
        reason: String,
    },

    #[error("transport spawn failed: {0}")]
    Spawn(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<roxmltree::Error> for ProtoError {
    fn from(err: roxmltree::Error) -> Self {
        Self::Xml(err.to_string())
    }
}
