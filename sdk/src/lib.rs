//! End-to-end encryption sessions for chat clients: identity and prekey
//! management, asynchronous session establishment from published prekey
//! bundles, and forward-secret message encryption with a double ratchet.
//!
//! Applications talk to [`key_manager::KeyManager`]; everything else is the
//! machinery behind it.

/// Base64 helpers and the big-endian framing used by the wire formats.
pub mod codec;

/// X3DH, the Double Ratchet and the per-peer session state machine.
pub mod crypto;

/// Durable storage of identity keys, prekeys, sessions and trusted
/// identities on top of any [`key_store::KeyValueStore`].
pub mod key_store;

/// Key lifecycle, session establishment, encryption and decryption, with a
/// single classified error type.
pub mod key_manager;

/// The remote directory where key material is published and fetched. Enable
/// the `http` feature for a REST client.
pub mod directory;

pub use {
    directory::{DirectoryError, KeyDirectory},
    key_manager::{CiphertextEnvelope, E2eeError, ErrorKind, KeyManager, KeyManagerConfig},
    key_store::{FileStore, KeyStore, KeyValueStore, MemoryStore},
};
