//! Session Protocol Core and the primitives it is built from.
//!
//! - [`x3dh`] derives a shared secret from a peer's published prekey bundle.
//! - [`double_ratchet`] turns that secret into per-message keys.
//! - [`session`] binds both into a persistable per-peer [`session::SessionRecord`].

pub mod double_ratchet;
pub mod secret_bytes;
pub mod session;
pub mod x3dh;
