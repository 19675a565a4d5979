//! Durable storage of all cryptographic material.
//!
//! The raw [`KeyValueStore`] trait is the only thing a host application has
//! to provide: byte values under string keys, plus prefix enumeration.
//! [`KeyStore`] layers typed accessors on top of it, one namespace per
//! logical table:
//!
//! | Key                       | Value                    |
//! |---------------------------|--------------------------|
//! | `identityKeyPair`         | [`IdentityKey`]          |
//! | `registrationId`          | `u32`                    |
//! | `preKey:{id}`             | [`PreKeyRecord`]         |
//! | `signedPreKey:{id}`       | [`SignedPreKeyRecord`]   |
//! | `sessionRecord:{address}` | [`SessionRecord`]        |
//! | `identityKey:{peer}`      | trusted peer identity    |
//!
//! The store holds no cryptographic logic. Absence is always `Ok(None)`.

mod file;
mod memory;

pub use {file::FileStore, memory::MemoryStore};
use {
    crate::crypto::{
        secret_bytes::static_secret_serde,
        session::SessionRecord,
        x3dh::{self, IdentityKey},
    },
    async_trait::async_trait,
    serde::{de::DeserializeOwned, Deserialize, Serialize},
    std::sync::Arc,
    thiserror::Error,
    x25519_dalek::{PublicKey, StaticSecret},
};

const IDENTITY_KEY_PAIR: &str = "identityKeyPair";
const REGISTRATION_ID: &str = "registrationId";
const PRE_KEY_PREFIX: &str = "preKey:";
const SIGNED_PRE_KEY_PREFIX: &str = "signedPreKey:";
const SESSION_PREFIX: &str = "sessionRecord:";
const TRUSTED_IDENTITY_PREFIX: &str = "identityKey:";

// === Raw key-value layer ===

/// Errors raised by a [`KeyValueStore`] backend.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum KvError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store lock poisoned")]
    Poisoned,
    #[error("invalid key {0:?}")]
    InvalidKey(String),
    #[error("no platform data directory available")]
    NoDataDir,
    /// Stored bytes do not belong to the requested key.
    #[error("corrupt entry for key {0:?}")]
    Corrupt(String),
    /// Backend-specific failure; `transient` marks it as worth retrying.
    #[error("backend failure: {message}")]
    Backend { message: String, transient: bool },
}

impl KvError {
    /// True when the same call may succeed if repeated shortly.
    pub fn is_transient(&self) -> bool {
        use std::io::ErrorKind;
        match self {
            Self::Io(e) => matches!(
                e.kind(),
                ErrorKind::Interrupted | ErrorKind::WouldBlock | ErrorKind::TimedOut
            ),
            Self::Backend { transient, .. } => *transient,
            _ => false,
        }
    }
}

/// Persistent key-value storage consumed by [`KeyStore`].
///
/// Implementations must make every mutation durable before returning.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read the value under `key`, `None` if absent.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError>;

    /// Insert or replace the value under `key`.
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), KvError>;

    /// Remove `key`. Removing an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<(), KvError>;

    /// All keys starting with `prefix`, in ascending order.
    async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>, KvError>;
}

#[async_trait]
impl<T: KeyValueStore + ?Sized> KeyValueStore for Arc<T> {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        (**self).get(key).await
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), KvError> {
        (**self).put(key, value).await
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        (**self).delete(key).await
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>, KvError> {
        (**self).list_prefix(prefix).await
    }
}

// === Typed layer ===

/// Errors raised by [`KeyStore`].
#[derive(Debug, Error)]
pub enum KeyStoreError {
    #[error("storage backend error: {0}")]
    Backend(#[from] KvError),
    #[error("record codec error: {0}")]
    Codec(#[from] bincode::Error),
    #[error("corrupt record under {0:?}")]
    Corrupt(String),
}

impl KeyStoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Backend(e) if e.is_transient())
    }
}

/// A one-time prekey and its id.
#[derive(Serialize, Deserialize)]
pub struct PreKeyRecord {
    pub id: u32,
    #[serde(with = "static_secret_serde")]
    pub secret: StaticSecret,
}

impl PreKeyRecord {
    pub fn generate(id: u32) -> Self {
        Self {
            id,
            secret: StaticSecret::random_from_rng(rand::rngs::OsRng),
        }
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey::from(&self.secret)
    }
}

/// A signed prekey, its identity signature and creation time (UNIX seconds).
#[derive(Serialize, Deserialize)]
pub struct SignedPreKeyRecord {
    pub id: u32,
    #[serde(with = "static_secret_serde")]
    pub secret: StaticSecret,
    #[serde(with = "serde_big_array::BigArray")]
    pub signature: [u8; 64],
    pub created_at: i64,
}

impl SignedPreKeyRecord {
    /// Generate a prekey and sign it with `identity`.
    pub fn generate(id: u32, identity: &IdentityKey) -> Self {
        let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let signature = identity.sign_prekey(&PublicKey::from(&secret));
        Self {
            id,
            secret,
            signature,
            created_at: chrono::Utc::now().timestamp(),
        }
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey::from(&self.secret)
    }
}

/// Record counts, mainly for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyStats {
    pub has_identity_key: bool,
    pub has_registration_id: bool,
    pub pre_key_count: usize,
    pub signed_pre_key_count: usize,
    pub session_count: usize,
}

/// Typed accessors over a [`KeyValueStore`].
pub struct KeyStore<S> {
    kv: S,
}

impl<S: KeyValueStore> KeyStore<S> {
    pub fn new(kv: S) -> Self {
        Self { kv }
    }

    /// The underlying raw store.
    pub fn backend(&self) -> &S {
        &self.kv
    }

    async fn get_record<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, KeyStoreError> {
        match self.kv.get(key).await? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn put_record<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
    ) -> Result<(), KeyStoreError> {
        self.kv.put(key, bincode::serialize(value)?).await?;
        Ok(())
    }

    async fn ids_under(&self, prefix: &str) -> Result<Vec<u32>, KeyStoreError> {
        let mut ids = self
            .kv
            .list_prefix(prefix)
            .await?
            .iter()
            .map(|key| {
                key[prefix.len()..]
                    .parse::<u32>()
                    .map_err(|_| KeyStoreError::Corrupt(key.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        ids.sort_unstable();
        Ok(ids)
    }

    // === Identity ===

    pub async fn get_identity_key_pair(&self) -> Result<Option<IdentityKey>, KeyStoreError> {
        self.get_record(IDENTITY_KEY_PAIR).await
    }

    pub async fn put_identity_key_pair(&self, identity: &IdentityKey) -> Result<(), KeyStoreError> {
        self.put_record(IDENTITY_KEY_PAIR, identity).await
    }

    pub async fn get_local_registration_id(&self) -> Result<Option<u32>, KeyStoreError> {
        self.get_record(REGISTRATION_ID).await
    }

    pub async fn put_local_registration_id(&self, id: u32) -> Result<(), KeyStoreError> {
        self.put_record(REGISTRATION_ID, &id).await
    }

    // === One-time prekeys ===

    pub async fn load_pre_key(&self, id: u32) -> Result<Option<PreKeyRecord>, KeyStoreError> {
        self.get_record(&format!("{PRE_KEY_PREFIX}{id}")).await
    }

    pub async fn store_pre_key(&self, record: &PreKeyRecord) -> Result<(), KeyStoreError> {
        self.put_record(&format!("{PRE_KEY_PREFIX}{}", record.id), record)
            .await
    }

    pub async fn remove_pre_key(&self, id: u32) -> Result<(), KeyStoreError> {
        self.kv.delete(&format!("{PRE_KEY_PREFIX}{id}")).await?;
        Ok(())
    }

    pub async fn pre_key_ids(&self) -> Result<Vec<u32>, KeyStoreError> {
        self.ids_under(PRE_KEY_PREFIX).await
    }

    // === Signed prekeys ===

    pub async fn load_signed_pre_key(
        &self,
        id: u32,
    ) -> Result<Option<SignedPreKeyRecord>, KeyStoreError> {
        self.get_record(&format!("{SIGNED_PRE_KEY_PREFIX}{id}"))
            .await
    }

    pub async fn store_signed_pre_key(
        &self,
        record: &SignedPreKeyRecord,
    ) -> Result<(), KeyStoreError> {
        self.put_record(&format!("{SIGNED_PRE_KEY_PREFIX}{}", record.id), record)
            .await
    }

    pub async fn remove_signed_pre_key(&self, id: u32) -> Result<(), KeyStoreError> {
        self.kv
            .delete(&format!("{SIGNED_PRE_KEY_PREFIX}{id}"))
            .await?;
        Ok(())
    }

    pub async fn signed_pre_key_ids(&self) -> Result<Vec<u32>, KeyStoreError> {
        self.ids_under(SIGNED_PRE_KEY_PREFIX).await
    }

    // === Sessions ===

    pub async fn contains_session(&self, address: &str) -> Result<bool, KeyStoreError> {
        Ok(self
            .kv
            .get(&format!("{SESSION_PREFIX}{address}"))
            .await?
            .is_some())
    }

    pub async fn load_session(&self, address: &str) -> Result<Option<SessionRecord>, KeyStoreError> {
        self.get_record(&format!("{SESSION_PREFIX}{address}")).await
    }

    pub async fn store_session(
        &self,
        address: &str,
        record: &SessionRecord,
    ) -> Result<(), KeyStoreError> {
        self.put_record(&format!("{SESSION_PREFIX}{address}"), record)
            .await
    }

    pub async fn remove_session(&self, address: &str) -> Result<(), KeyStoreError> {
        self.kv.delete(&format!("{SESSION_PREFIX}{address}")).await?;
        Ok(())
    }

    /// Addresses with a stored session.
    pub async fn session_addresses(&self) -> Result<Vec<String>, KeyStoreError> {
        Ok(self
            .kv
            .list_prefix(SESSION_PREFIX)
            .await?
            .into_iter()
            .map(|key| key[SESSION_PREFIX.len()..].to_owned())
            .collect())
    }

    // === Trusted identities ===

    pub async fn load_identity(&self, peer: &str) -> Result<Option<PublicKey>, KeyStoreError> {
        let key = format!("{TRUSTED_IDENTITY_PREFIX}{peer}");
        let Some(bytes) = self.kv.get(&key).await? else {
            return Ok(None);
        };
        let raw: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| KeyStoreError::Corrupt(key))?;
        Ok(Some(PublicKey::from(raw)))
    }

    /// Trust on first use: unknown peers are trusted, known peers must
    /// present the pinned key.
    pub async fn is_trusted_identity(
        &self,
        peer: &str,
        candidate: &PublicKey,
    ) -> Result<bool, KeyStoreError> {
        Ok(match self.load_identity(peer).await? {
            Some(pinned) => x3dh::same_key(&pinned, candidate),
            None => true,
        })
    }

    /// Pin `key` for `peer`. Returns true when a different key was replaced.
    pub async fn save_identity(&self, peer: &str, key: &PublicKey) -> Result<bool, KeyStoreError> {
        let previous = self.load_identity(peer).await?;
        if matches!(&previous, Some(pinned) if x3dh::same_key(pinned, key)) {
            return Ok(false);
        }
        self.kv
            .put(
                &format!("{TRUSTED_IDENTITY_PREFIX}{peer}"),
                key.as_bytes().to_vec(),
            )
            .await?;
        Ok(previous.is_some())
    }

    pub async fn remove_identity(&self, peer: &str) -> Result<(), KeyStoreError> {
        self.kv
            .delete(&format!("{TRUSTED_IDENTITY_PREFIX}{peer}"))
            .await?;
        Ok(())
    }

    // === Maintenance ===

    pub async fn stats(&self) -> Result<KeyStats, KeyStoreError> {
        Ok(KeyStats {
            has_identity_key: self.kv.get(IDENTITY_KEY_PAIR).await?.is_some(),
            has_registration_id: self.kv.get(REGISTRATION_ID).await?.is_some(),
            pre_key_count: self.kv.list_prefix(PRE_KEY_PREFIX).await?.len(),
            signed_pre_key_count: self.kv.list_prefix(SIGNED_PRE_KEY_PREFIX).await?.len(),
            session_count: self.kv.list_prefix(SESSION_PREFIX).await?.len(),
        })
    }

    /// Remove every prekey and signed prekey, leaving identity and sessions.
    pub async fn clear_prekeys(&self) -> Result<(), KeyStoreError> {
        for prefix in [PRE_KEY_PREFIX, SIGNED_PRE_KEY_PREFIX] {
            for key in self.kv.list_prefix(prefix).await? {
                self.kv.delete(&key).await?;
            }
        }
        Ok(())
    }

    /// Delete everything this store manages.
    pub async fn wipe(&self) -> Result<(), KeyStoreError> {
        for prefix in [
            PRE_KEY_PREFIX,
            SIGNED_PRE_KEY_PREFIX,
            SESSION_PREFIX,
            TRUSTED_IDENTITY_PREFIX,
        ] {
            for key in self.kv.list_prefix(prefix).await? {
                self.kv.delete(&key).await?;
            }
        }
        self.kv.delete(REGISTRATION_ID).await?;
        self.kv.delete(IDENTITY_KEY_PAIR).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use {super::*, assert_matches::assert_matches};

    fn store() -> KeyStore<MemoryStore> {
        KeyStore::new(MemoryStore::new())
    }

    #[tokio::test]
    async fn test_absence_is_not_an_error() {
        let store = store();
        assert!(store.get_identity_key_pair().await.unwrap().is_none());
        assert!(store.get_local_registration_id().await.unwrap().is_none());
        assert!(store.load_pre_key(1).await.unwrap().is_none());
        assert!(store.load_signed_pre_key(1).await.unwrap().is_none());
        assert!(!store.contains_session("bob.1").await.unwrap());
        assert!(store.load_session("bob.1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_identity_and_registration_round_trip() {
        let store = store();
        let identity = IdentityKey::generate();
        store.put_identity_key_pair(&identity).await.unwrap();
        store.put_local_registration_id(1234).await.unwrap();

        let loaded = store.get_identity_key_pair().await.unwrap().unwrap();
        assert!(x3dh::same_key(&loaded.dh_public, &identity.dh_public));
        assert_eq!(store.get_local_registration_id().await.unwrap(), Some(1234));
    }

    #[tokio::test]
    async fn test_pre_keys_are_enumerable_and_removable() {
        let store = store();
        for id in [30, 4, 200] {
            store.store_pre_key(&PreKeyRecord::generate(id)).await.unwrap();
        }
        assert_eq!(store.pre_key_ids().await.unwrap(), vec![4, 30, 200]);

        let record = store.load_pre_key(30).await.unwrap().unwrap();
        assert_eq!(record.id, 30);

        store.remove_pre_key(30).await.unwrap();
        assert_eq!(store.pre_key_ids().await.unwrap(), vec![4, 200]);
    }

    #[tokio::test]
    async fn test_signed_pre_key_keeps_verifiable_signature() {
        let store = store();
        let identity = IdentityKey::generate();
        store
            .store_signed_pre_key(&SignedPreKeyRecord::generate(9, &identity))
            .await
            .unwrap();

        let record = store.load_signed_pre_key(9).await.unwrap().unwrap();
        assert!(x3dh::verify_prekey_signature(
            &identity.dh_public,
            &record.public_key(),
            &record.signature
        )
        .is_ok());
        assert_eq!(store.signed_pre_key_ids().await.unwrap(), vec![9]);
    }

    #[tokio::test]
    async fn test_trust_on_first_use() {
        let store = store();
        let first = IdentityKey::generate().dh_public;
        let second = IdentityKey::generate().dh_public;

        assert!(store.is_trusted_identity("bob", &first).await.unwrap());
        assert!(!store.save_identity("bob", &first).await.unwrap());
        assert!(store.is_trusted_identity("bob", &first).await.unwrap());
        assert!(!store.is_trusted_identity("bob", &second).await.unwrap());

        // Saving the same key again is not a change; a new key is.
        assert!(!store.save_identity("bob", &first).await.unwrap());
        assert!(store.save_identity("bob", &second).await.unwrap());
        assert!(store.is_trusted_identity("bob", &second).await.unwrap());
    }

    #[tokio::test]
    async fn test_corrupt_identity_record_is_reported() {
        let store = store();
        store
            .backend()
            .put("identityKey:bob", vec![1, 2, 3])
            .await
            .unwrap();
        assert_matches!(
            store.load_identity("bob").await,
            Err(KeyStoreError::Corrupt(_))
        );
    }

    #[tokio::test]
    async fn test_wipe_removes_everything() {
        let store = store();
        let identity = IdentityKey::generate();
        store.put_identity_key_pair(&identity).await.unwrap();
        store.put_local_registration_id(7).await.unwrap();
        store.store_pre_key(&PreKeyRecord::generate(1)).await.unwrap();
        store
            .store_signed_pre_key(&SignedPreKeyRecord::generate(2, &identity))
            .await
            .unwrap();
        store.save_identity("bob", &identity.dh_public).await.unwrap();

        let stats = store.stats().await.unwrap();
        assert!(stats.has_identity_key && stats.has_registration_id);
        assert_eq!(stats.pre_key_count, 1);
        assert_eq!(stats.signed_pre_key_count, 1);

        store.wipe().await.unwrap();
        assert!(store.backend().is_empty());
    }

    #[test]
    fn test_transient_classification() {
        let transient = KvError::Io(std::io::Error::from(std::io::ErrorKind::TimedOut));
        let permanent = KvError::Io(std::io::Error::from(std::io::ErrorKind::PermissionDenied));
        assert!(KeyStoreError::from(transient).is_transient());
        assert!(!KeyStoreError::from(permanent).is_transient());
        assert!(!KeyStoreError::Corrupt("x".into()).is_transient());
    }
}
