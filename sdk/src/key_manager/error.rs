use {
    crate::{
        crypto::{double_ratchet::RatchetError, session::ProtocolError, x3dh::X3dhError},
        key_store::KeyStoreError,
    },
    std::fmt,
    thiserror::Error,
};

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Why establishing or using a session failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SessionFailure {
    /// The peer presented an identity key other than the pinned one.
    #[error("identity mismatch (possible impersonation)")]
    IdentityMismatch,
    /// The signed prekey signature did not verify.
    #[error("invalid signature (possible tampering)")]
    InvalidSignature,
    #[error("invalid peer identifier")]
    InvalidPeer,
    #[error("handshake failed")]
    Handshake,
    #[error("key store failure")]
    Storage,
    /// The key directory could not provide a bundle.
    #[error("key directory unavailable")]
    Directory,
    /// The local account has no keys yet.
    #[error("local keys not initialized")]
    NotInitialized,
}

/// Why an encryption failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EncryptionFailure {
    #[error("no session")]
    NoSession,
    #[error("sending chain failure")]
    Chain,
    #[error("key store failure")]
    Storage,
}

/// Why a decryption failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecryptionFailure {
    /// Follow-up message without a session for the sender.
    #[error("no session for sender")]
    NoSession,
    /// Re-delivery of an already accepted message.
    #[error("duplicate message")]
    Duplicate,
    /// Authentication tag did not verify (tampering).
    #[error("authentication failure")]
    Authentication,
    #[error("unknown message type")]
    UnknownMessageType,
    /// Envelope or message bytes could not be parsed.
    #[error("malformed message")]
    Malformed,
    #[error("plaintext is not valid UTF-8")]
    InvalidUtf8,
    #[error("key store failure")]
    Storage,
}

/// Machine-readable classification of an [`E2eeError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    KeyGeneration,
    PreKeyBundle,
    Session(SessionFailure),
    Encryption(EncryptionFailure),
    Decryption(DecryptionFailure),
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::KeyGeneration => f.write_str("key generation error"),
            Self::PreKeyBundle => f.write_str("prekey bundle error"),
            Self::Session(why) => write!(f, "session error ({why})"),
            Self::Encryption(why) => write!(f, "encryption error ({why})"),
            Self::Decryption(why) => write!(f, "decryption error ({why})"),
        }
    }
}

/// The single error type surfaced by [`super::KeyManager`].
#[derive(Debug, Error)]
#[error("{kind}: {message}")]
pub struct E2eeError {
    kind: ErrorKind,
    message: String,
    #[source]
    source: Option<BoxError>,
}

impl E2eeError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(mut self, source: impl Into<BoxError>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn key_generation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::KeyGeneration, message)
    }

    pub fn bundle(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::PreKeyBundle, message)
    }

    pub fn session(why: SessionFailure, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Session(why), message)
    }

    pub fn encryption(why: EncryptionFailure, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Encryption(why), message)
    }

    pub fn decryption(why: DecryptionFailure, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Decryption(why), message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Stable string code per top-level kind.
    pub fn code(&self) -> &'static str {
        match self.kind {
            ErrorKind::KeyGeneration => "KEY_GENERATION_ERROR",
            ErrorKind::PreKeyBundle => "PREKEY_BUNDLE_ERROR",
            ErrorKind::Session(_) => "SESSION_ERROR",
            ErrorKind::Encryption(_) => "ENCRYPTION_ERROR",
            ErrorKind::Decryption(_) => "DECRYPTION_ERROR",
        }
    }

    /// Only a missing session on decrypt can be repaired automatically,
    /// through [`super::KeyManager::ensure_session_from_prekey_message`] or a
    /// fresh handshake.
    pub fn is_recoverable(&self) -> bool {
        self.kind == ErrorKind::Decryption(DecryptionFailure::NoSession)
    }

    /// True when the root cause is a storage failure worth retrying.
    pub fn is_transient(&self) -> bool {
        self.source
            .as_deref()
            .and_then(|e| e.downcast_ref::<KeyStoreError>())
            .is_some_and(KeyStoreError::is_transient)
    }
}

// === Classification of lower-layer failures ===

impl From<RatchetError> for DecryptionFailure {
    fn from(e: RatchetError) -> Self {
        match e {
            RatchetError::Duplicate => Self::Duplicate,
            RatchetError::Malformed => Self::Malformed,
            RatchetError::AuthenticationFailed
            | RatchetError::MaxSkipExceeded
            | RatchetError::InvalidPublicKey
            | RatchetError::MissingReceivingChain
            | RatchetError::MissingSendingChain
            | RatchetError::CryptoError => Self::Authentication,
        }
    }
}

impl From<&ProtocolError> for DecryptionFailure {
    fn from(e: &ProtocolError) -> Self {
        match e {
            ProtocolError::Ratchet(r) => (*r).into(),
            ProtocolError::Malformed(_) => Self::Malformed,
            ProtocolError::HandshakeMismatch => Self::Authentication,
            ProtocolError::X3dh(_) => Self::Authentication,
        }
    }
}
