//! Network collaborators of the key manager: the directory that stores
//! published key material.
//!
//! - [`KeyDirectory::fetch_bundle`] retrieves a peer's prekey bundle before
//!   first contact.
//! - [`KeyDirectory::register`] publishes local public keys after
//!   initialization.
//!
//! With the `http` feature, [`HttpKeyDirectory`] talks to a REST backend
//! exposing `GET keys/bundle/{peer}` and `POST keys/register`.

#[cfg(feature = "http")]
mod http;

#[cfg(feature = "http")]
pub use http::*;
use {
    crate::key_manager::{KeysForServer, PreKeyBundleDto},
    async_trait::async_trait,
    thiserror::Error,
};

/// Errors raised by a [`KeyDirectory`].
#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("no bundle published for {0:?}")]
    NotFound(String),
    #[error("directory rejected the request ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[cfg(feature = "http")]
    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{0}")]
    Other(String),
}

/// Remote store of published key material.
#[async_trait]
pub trait KeyDirectory: Send + Sync {
    /// Fetch the current prekey bundle published by `peer`.
    async fn fetch_bundle(&self, peer: &str) -> Result<PreKeyBundleDto, DirectoryError>;

    /// Publish freshly generated public key material.
    async fn register(&self, keys: &KeysForServer) -> Result<(), DirectoryError>;
}
