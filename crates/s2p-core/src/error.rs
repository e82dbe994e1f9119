//! Centralized error types for Speech2Prompt.
//!
//! Uses `thiserror` for ergonomic error definitions. One enum covers the
//! whole stack so every layer can propagate with `?` and callers can match
//! on the failure class without chasing per-crate error types.

/// Core error type used across all Speech2Prompt crates.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    // === Wire / protocol errors ===
    #[error("Protocol violation: {message}")]
    Protocol { message: String },

    #[error("Checksum verification failed")]
    Integrity,

    #[error("Decryption failed: {message}")]
    Decrypt { message: String },

    #[error("Frame exceeds reassembly cap: {size} > {cap} bytes")]
    FrameTooLarge { size: usize, cap: usize },

    #[error("MTU {mtu} too small to carry a payload")]
    InvalidMtu { mtu: u16 },

    #[error("Key must be exactly 32 bytes, got {actual}")]
    InvalidKeyLength { actual: usize },

    // === Link errors ===
    #[error("Link error: {message}")]
    Link { message: String },

    #[error("Peer does not expose service {uuid}")]
    ServiceMissing { uuid: String },

    #[error("Connection attempt timed out")]
    ConnectTimeout,

    #[error("No acknowledgement within the ack window")]
    AckTimeout,

    #[error("Outbound queue overflowed")]
    QueueOverflow,

    // === Session errors ===
    #[error("Pairing failed: {message}")]
    Pairing { message: String },

    #[error("Session is closed")]
    SessionClosed,

    #[error("Operation cancelled")]
    Cancelled,

    // === Speech errors ===
    #[error("Recognizer error: {code}")]
    Recognizer { code: String, transient: bool },

    // === Storage errors ===
    #[error("Keystore error: {message}")]
    Keystore { message: String },
}

impl BridgeError {
    /// Error code string for programmatic handling by upper layers.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Protocol { .. } => "PROTOCOL_ERROR",
            Self::Integrity => "INTEGRITY_ERROR",
            Self::Decrypt { .. } => "DECRYPT_ERROR",
            Self::FrameTooLarge { .. } => "FRAME_TOO_LARGE",
            Self::InvalidMtu { .. } => "INVALID_MTU",
            Self::InvalidKeyLength { .. } => "INVALID_KEY_LENGTH",
            Self::Link { .. } => "LINK_ERROR",
            Self::ServiceMissing { .. } => "SERVICE_MISSING",
            Self::ConnectTimeout => "CONNECT_TIMEOUT",
            Self::AckTimeout => "ACK_TIMEOUT",
            Self::QueueOverflow => "QUEUE_OVERFLOW",
            Self::Pairing { .. } => "PAIRING_ERROR",
            Self::SessionClosed => "SESSION_CLOSED",
            Self::Cancelled => "CANCELLED",
            Self::Recognizer { .. } => "RECOGNIZER_ERROR",
            Self::Keystore { .. } => "KEYSTORE_ERROR",
        }
    }

    /// Whether the error should be retried quietly instead of surfaced.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Recognizer { transient, .. } => *transient,
            // A single bad frame is not fatal; the connection stays up.
            Self::Integrity => true,
            _ => false,
        }
    }

    /// Shorthand for a protocol violation.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol { message: message.into() }
    }

    /// Shorthand for a link-layer failure.
    pub fn link(message: impl Into<String>) -> Self {
        Self::Link { message: message.into() }
    }

    /// Shorthand for a pairing failure.
    pub fn pairing(message: impl Into<String>) -> Self {
        Self::Pairing { message: message.into() }
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(e: serde_json::Error) -> Self {
        Self::Protocol { message: e.to_string() }
    }
}

/// Convenience type alias for Results using BridgeError.
pub type BridgeResult<T> = Result<T, BridgeError>;
