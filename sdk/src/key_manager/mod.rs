//! # Key Manager
//!
//! The only component exposed to the rest of an application. It owns the key
//! lifecycle (generation, publishing payload, replenishment, wipe), session
//! establishment from fetched bundles or inbound prekey messages, and message
//! encryption and decryption.
//!
//! Operations touching one peer's session are serialized by a per-address
//! async mutex. Operations on different peers run in parallel.
//!
//! ## Example
//!
//! ```
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! use parley_sdk::{key_manager::KeyManager, key_store::MemoryStore};
//!
//! let alice = KeyManager::new(MemoryStore::new());
//! let bob = KeyManager::new(MemoryStore::new());
//! alice.initialize_user_keys_if_needed().await.unwrap();
//! bob.initialize_user_keys_if_needed().await.unwrap();
//!
//! let bundle = bob.issue_pre_key_bundle().await.unwrap();
//! alice.process_pre_key_bundle("bob", &bundle).await.unwrap();
//!
//! let envelope = alice.encrypt_message("bob", "hello").await.unwrap();
//! assert_eq!(bob.decrypt_message("alice", &envelope).await.unwrap(), "hello");
//! # }
//! ```

mod config;
mod error;
mod types;

pub use {config::*, error::*, types::*};
use {
    crate::{
        codec,
        crypto::{
            session::{CiphertextMessage, MessageType, PreKeyMessage, ProtocolError, SessionPhase, SessionRecord},
            x3dh::{IdentityKey, PreKeyBundle, X3dhError},
        },
        directory::KeyDirectory,
        key_store::{KeyStats, KeyStore, KeyStoreError, KeyValueStore, PreKeyRecord, SignedPreKeyRecord},
    },
    log::{debug, info, warn},
    rand::{rngs::OsRng, Rng},
    std::{
        collections::{BTreeSet, HashMap},
        sync::{Arc, Mutex as StdMutex, PoisonError},
    },
    tokio::sync::Mutex,
    tokio_retry::{strategy::FixedInterval, RetryIf},
    zeroize::Zeroizing,
};

/// Registration ids are drawn from `1..=MAX_REGISTRATION_ID`.
pub const MAX_REGISTRATION_ID: u32 = 16_380;
/// Prekey ids stay below this bound.
pub const MAX_PREKEY_ID: u32 = 0xFF_FFFF;

type PeerLocks = StdMutex<HashMap<String, Arc<Mutex<()>>>>;

/// Orchestrates keys and sessions on top of a [`KeyValueStore`].
pub struct KeyManager<S> {
    store: KeyStore<S>,
    config: KeyManagerConfig,
    peer_locks: PeerLocks,
    /// Serializes changes to the local key set.
    maintenance: Mutex<()>,
}

impl<S: KeyValueStore> KeyManager<S> {
    pub fn new(kv: S) -> Self {
        Self::with_config(kv, KeyManagerConfig::default())
    }

    pub fn with_config(kv: S, config: KeyManagerConfig) -> Self {
        Self {
            store: KeyStore::new(kv),
            config,
            peer_locks: StdMutex::new(HashMap::new()),
            maintenance: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &KeyManagerConfig {
        &self.config
    }

    /// Typed view of the underlying store.
    pub fn store(&self) -> &KeyStore<S> {
        &self.store
    }

    /// Canonical session address `"{peer}.{device_id}"`.
    pub fn address(&self, peer: &str) -> Result<String, E2eeError> {
        let peer = peer.trim();
        if peer.is_empty() {
            return Err(E2eeError::session(
                SessionFailure::InvalidPeer,
                "peer identifier is empty",
            ));
        }
        Ok(format!("{peer}.{}", self.config.device_id))
    }

    fn peer_lock(&self, address: &str) -> Arc<Mutex<()>> {
        let mut locks = self.peer_locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(address.to_owned()).or_default().clone()
    }

    /// Drop the lock entry for `address` unless another task still holds it.
    fn prune_peer_lock(&self, address: &str) {
        let mut locks = self.peer_locks.lock().unwrap_or_else(PoisonError::into_inner);
        if locks
            .get(address)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(address);
        }
    }

    // === Key lifecycle ===

    /// Return the existing identity, or generate and persist a complete key
    /// set and return its public half for publishing.
    ///
    /// On failure nothing usable is left behind and the call can be retried.
    pub async fn initialize_user_keys_if_needed(&self) -> Result<KeyInitialization, E2eeError> {
        let _guard = self.maintenance.lock().await;

        let identity = self
            .store
            .get_identity_key_pair()
            .await
            .map_err(keygen_storage)?;
        let registration_id = self
            .store
            .get_local_registration_id()
            .await
            .map_err(keygen_storage)?;

        if let (Some(identity), Some(registration_id)) = (identity, registration_id) {
            debug!("[KeyManager] Keys already initialized (registration id {registration_id})");
            return Ok(KeyInitialization::Existing {
                identity_public_key: encode_public_key(&identity.dh_public),
                registration_id,
            });
        }

        info!("[KeyManager] Generating a new identity key set");
        match self.generate_key_set().await {
            Ok(keys_for_server) => {
                info!(
                    "[KeyManager] Generated identity with {} one-time prekeys",
                    keys_for_server.one_time_pre_keys.len()
                );
                Ok(KeyInitialization::Created { keys_for_server })
            }
            Err(e) => {
                if let Err(cleanup) = self.store.clear_prekeys().await {
                    warn!("[KeyManager] Could not roll back partial key set: {cleanup}");
                }
                Err(E2eeError::key_generation("failed to persist generated keys").with_source(e))
            }
        }
    }

    /// Identity and registration id are written last, so a partially written
    /// set is never mistaken for an initialized account.
    async fn generate_key_set(&self) -> Result<KeysForServer, KeyStoreError> {
        self.store.clear_prekeys().await?;

        let identity = IdentityKey::generate();
        let registration_id = OsRng.gen_range(1..=MAX_REGISTRATION_ID);
        let signed = SignedPreKeyRecord::generate(signed_prekey_id(), &identity);
        let one_time_pre_keys = self
            .generate_one_time_prekeys(
                self.config.one_time_prekey_count,
                &BTreeSet::new(),
                OsRng.gen_range(1..MAX_PREKEY_ID),
            )
            .await?;

        self.store.store_signed_pre_key(&signed).await?;
        self.store.put_identity_key_pair(&identity).await?;
        self.store.put_local_registration_id(registration_id).await?;

        Ok(KeysForServer {
            identity_public_key: encode_public_key(&identity.dh_public),
            registration_id,
            signed_pre_key_id: signed.id,
            signed_pre_key: encode_public_key(&signed.public_key()),
            pre_key_signature: codec::to_base64(signed.signature),
            one_time_pre_keys,
        })
    }

    async fn generate_one_time_prekeys(
        &self,
        count: u32,
        taken: &BTreeSet<u32>,
        mut next_id: u32,
    ) -> Result<Vec<OneTimePreKeyPublic>, KeyStoreError> {
        let mut published = Vec::with_capacity(count as usize);
        while published.len() < count as usize {
            if !taken.contains(&next_id) {
                let record = PreKeyRecord::generate(next_id);
                self.store.store_pre_key(&record).await?;
                published.push(OneTimePreKeyPublic {
                    key_id: record.id,
                    public_key: encode_public_key(&record.public_key()),
                });
            }
            next_id = following_prekey_id(next_id);
        }
        Ok(published)
    }

    /// Top the one-time prekey pool back up to the configured size once it
    /// drops below the low watermark. Returns the new keys to publish.
    pub async fn replenish_one_time_prekeys(&self) -> Result<Vec<OneTimePreKeyPublic>, E2eeError> {
        let _guard = self.maintenance.lock().await;

        if self
            .store
            .get_identity_key_pair()
            .await
            .map_err(keygen_storage)?
            .is_none()
        {
            return Err(E2eeError::key_generation("local keys not initialized"));
        }

        let taken: BTreeSet<u32> = self
            .store
            .pre_key_ids()
            .await
            .map_err(keygen_storage)?
            .into_iter()
            .collect();
        let available = taken.len() as u32;
        if available >= self.config.prekey_low_watermark {
            return Ok(Vec::new());
        }

        let start = taken
            .last()
            .map(|id| following_prekey_id(*id))
            .unwrap_or_else(|| OsRng.gen_range(1..MAX_PREKEY_ID));
        let fresh = self
            .generate_one_time_prekeys(
                self.config.one_time_prekey_count.saturating_sub(available),
                &taken,
                start,
            )
            .await
            .map_err(keygen_storage)?;

        info!(
            "[KeyManager] Replenished {} one-time prekeys ({available} were left)",
            fresh.len()
        );
        Ok(fresh)
    }

    /// Public identity key (base64), if initialized.
    pub async fn identity_public_key(&self) -> Result<Option<String>, E2eeError> {
        Ok(self
            .store
            .get_identity_key_pair()
            .await
            .map_err(session_storage)?
            .map(|identity| encode_public_key(&identity.dh_public)))
    }

    pub async fn registration_id(&self) -> Result<Option<u32>, E2eeError> {
        self.store
            .get_local_registration_id()
            .await
            .map_err(session_storage)
    }

    pub async fn key_stats(&self) -> Result<KeyStats, E2eeError> {
        self.store.stats().await.map_err(session_storage)
    }

    /// Build a bundle from local keys, consuming nothing. The one-time prekey
    /// offered is the lowest id still available.
    pub async fn issue_pre_key_bundle(&self) -> Result<PreKeyBundleDto, E2eeError> {
        let (identity, registration_id) = self.local_keys().await?;
        let not_ready = || E2eeError::session(SessionFailure::NotInitialized, "no signed prekey");

        let spk_id = *self
            .store
            .signed_pre_key_ids()
            .await
            .map_err(session_storage)?
            .last()
            .ok_or_else(not_ready)?;
        let signed = self
            .store
            .load_signed_pre_key(spk_id)
            .await
            .map_err(session_storage)?
            .ok_or_else(not_ready)?;

        let one_time = match self
            .store
            .pre_key_ids()
            .await
            .map_err(session_storage)?
            .first()
        {
            Some(id) => self.store.load_pre_key(*id).await.map_err(session_storage)?,
            None => None,
        };

        let bundle = PreKeyBundle::new(
            &identity,
            registration_id,
            signed.id,
            &signed.secret,
            one_time.as_ref().map(|r| (r.id, &r.secret)),
        );
        Ok(PreKeyBundleDto::from(&bundle))
    }

    /// Explicitly pin `identity_key` (base64) for `peer`, replacing a
    /// mismatching key. Never done automatically.
    pub async fn trust_identity(&self, peer: &str, identity_key: &str) -> Result<(), E2eeError> {
        self.address(peer)?;
        let key = decode_public_key(identity_key)
            .ok_or_else(|| E2eeError::bundle("identity key is not a valid public key"))?;
        let changed = self
            .store
            .save_identity(peer.trim(), &key)
            .await
            .map_err(session_storage)?;
        if changed {
            warn!("[KeyManager] Identity for {peer} was re-pinned by explicit override");
        }
        Ok(())
    }

    /// Remove every key, session and trust record (logout).
    pub async fn wipe_all_keys(&self) -> Result<(), E2eeError> {
        let _guard = self.maintenance.lock().await;
        self.store.wipe().await.map_err(session_storage)?;
        self.peer_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        info!("[KeyManager] All local keys wiped");
        Ok(())
    }

    async fn local_keys(&self) -> Result<(IdentityKey, u32), E2eeError> {
        let identity = self
            .store
            .get_identity_key_pair()
            .await
            .map_err(session_storage)?;
        let registration_id = self
            .store
            .get_local_registration_id()
            .await
            .map_err(session_storage)?;
        match (identity, registration_id) {
            (Some(identity), Some(registration_id)) => Ok((identity, registration_id)),
            _ => Err(E2eeError::session(
                SessionFailure::NotInitialized,
                "local keys not initialized",
            )),
        }
    }

    // === Session establishment ===

    /// Validate a fetched bundle and build a fresh outbound session for
    /// `peer`, replacing any existing one.
    pub async fn process_pre_key_bundle(
        &self,
        peer: &str,
        bundle: &PreKeyBundleDto,
    ) -> Result<(), E2eeError> {
        let address = self.address(peer)?;
        let peer = peer.trim();

        let bundle = bundle
            .validate()
            .map_err(|e| E2eeError::bundle(format!("invalid bundle for {peer}")).with_source(e))?;
        bundle.verify_spk().map_err(|e| {
            warn!("[KeyManager] Signed prekey signature from {peer} does not verify");
            E2eeError::session(
                SessionFailure::InvalidSignature,
                format!("signed prekey of {peer} failed verification"),
            )
            .with_source(e)
        })?;

        let lock = self.peer_lock(&address);
        let _guard = lock.lock().await;

        let (identity, _) = self.local_keys().await?;
        self.check_trust(peer, &bundle.identity_pk).await?;

        let strategy =
            FixedInterval::new(self.config.retry_delay()).take(self.config.establish_retries);
        RetryIf::spawn(
            strategy,
            || self.establish_outbound(&address, &identity, &bundle),
            |e: &E2eeError| {
                let retry = e.is_transient();
                if retry {
                    warn!("[KeyManager] Session setup for {address} hit a transient error, retrying: {e}");
                }
                retry
            },
        )
        .await?;

        self.store
            .save_identity(peer, &bundle.identity_pk)
            .await
            .map_err(session_storage)?;
        info!("[KeyManager] Session established with {address}");
        Ok(())
    }

    /// One establishment attempt. Any session left by an earlier attempt is
    /// removed before a new one is built.
    async fn establish_outbound(
        &self,
        address: &str,
        identity: &IdentityKey,
        bundle: &PreKeyBundle,
    ) -> Result<(), E2eeError> {
        if self
            .store
            .contains_session(address)
            .await
            .map_err(session_storage)?
        {
            debug!("[KeyManager] Removing existing session for {address}");
            self.store
                .remove_session(address)
                .await
                .map_err(session_storage)?;
        }

        let record = SessionRecord::initiate(identity, bundle).map_err(handshake_error)?;
        self.store
            .store_session(address, &record)
            .await
            .map_err(session_storage)?;

        if !self
            .store
            .contains_session(address)
            .await
            .map_err(session_storage)?
        {
            return Err(E2eeError::session(
                SessionFailure::Storage,
                format!("session for {address} missing after store"),
            ));
        }
        Ok(())
    }

    /// Trust on first use. A pinned key that differs is never accepted here.
    async fn check_trust(&self, peer: &str, candidate: &x25519_dalek::PublicKey) -> Result<(), E2eeError> {
        let trusted = self
            .store
            .is_trusted_identity(peer, candidate)
            .await
            .map_err(session_storage)?;
        if !trusted {
            warn!("[KeyManager] Identity key of {peer} changed; refusing to proceed");
            return Err(E2eeError::session(
                SessionFailure::IdentityMismatch,
                format!("identity key of {peer} does not match the pinned key"),
            ));
        }
        Ok(())
    }

    /// Fetch `peer`'s bundle and establish a session unless one exists.
    /// With `force` any existing session is replaced. Returns true when a new
    /// session was built.
    pub async fn ensure_session<D>(&self, peer: &str, directory: &D, force: bool) -> Result<bool, E2eeError>
    where
        D: KeyDirectory + ?Sized,
    {
        if !force && self.has_session(peer).await? {
            return Ok(false);
        }

        let bundle = directory.fetch_bundle(peer.trim()).await.map_err(|e| {
            E2eeError::session(
                SessionFailure::Directory,
                format!("could not fetch bundle for {}", peer.trim()),
            )
            .with_source(e)
        })?;
        self.process_pre_key_bundle(peer, &bundle).await?;
        Ok(true)
    }

    /// Initialize keys and publish them when they are new. If publishing
    /// fails the fresh keys are wiped so the next attempt starts clean.
    pub async fn initialize_and_publish<D>(&self, directory: &D) -> Result<KeyInitialization, E2eeError>
    where
        D: KeyDirectory + ?Sized,
    {
        let init = self.initialize_user_keys_if_needed().await?;
        let Some(keys) = init.keys_for_server() else {
            return Ok(init);
        };

        if let Err(e) = directory.register(keys).await {
            warn!("[KeyManager] Publishing keys failed, discarding them: {e}");
            if let Err(cleanup) = self.wipe_all_keys().await {
                warn!("[KeyManager] Could not discard unpublished keys: {cleanup}");
            }
            return Err(E2eeError::key_generation("failed to publish keys").with_source(e));
        }
        info!("[KeyManager] Published new keys");
        Ok(init)
    }

    // === Session queries ===

    pub async fn has_session(&self, peer: &str) -> Result<bool, E2eeError> {
        let address = self.address(peer)?;
        self.store
            .contains_session(&address)
            .await
            .map_err(session_storage)
    }

    /// Drop the session with `peer`, forcing a new handshake. Pending
    /// handshake material lives in the session and goes with it.
    pub async fn remove_session(&self, peer: &str) -> Result<(), E2eeError> {
        let address = self.address(peer)?;
        let lock = self.peer_lock(&address);
        let guard = lock.lock().await;
        let removed = self.store.remove_session(&address).await;
        drop(guard);
        drop(lock);
        self.prune_peer_lock(&address);

        removed.map_err(session_storage)?;
        info!("[KeyManager] Session with {address} removed");
        Ok(())
    }

    pub async fn session_phase(&self, peer: &str) -> Result<Option<SessionPhase>, E2eeError> {
        let address = self.address(peer)?;
        Ok(self
            .store
            .load_session(&address)
            .await
            .map_err(session_storage)?
            .map(|record| record.phase()))
    }

    // === Messaging ===

    /// Encrypt `plaintext` for `peer`. A session must already exist.
    ///
    /// The advanced session is persisted before the envelope is returned; if
    /// that fails no envelope is produced.
    pub async fn encrypt_message(
        &self,
        peer: &str,
        plaintext: &str,
    ) -> Result<CiphertextEnvelope, E2eeError> {
        let address = self.address(peer)?;
        let lock = self.peer_lock(&address);
        let _guard = lock.lock().await;

        let encryption_storage = |e: KeyStoreError| {
            E2eeError::encryption(EncryptionFailure::Storage, "key store failure").with_source(e)
        };

        let mut record = self
            .store
            .load_session(&address)
            .await
            .map_err(encryption_storage)?
            .ok_or_else(|| {
                E2eeError::encryption(EncryptionFailure::NoSession, format!("no session with {address}"))
            })?;
        let registration_id = self
            .store
            .get_local_registration_id()
            .await
            .map_err(encryption_storage)?
            .ok_or_else(|| {
                E2eeError::encryption(EncryptionFailure::Storage, "local registration id missing")
            })?;

        let message = record
            .encrypt(plaintext.as_bytes(), registration_id)
            .map_err(|e| {
                E2eeError::encryption(EncryptionFailure::Chain, format!("encryption for {address} failed"))
                    .with_source(e)
            })?;

        self.store
            .store_session(&address, &record)
            .await
            .map_err(encryption_storage)?;

        Ok(CiphertextEnvelope {
            message_type: message.message_type() as u8,
            encrypted_content: codec::to_base64(message.to_bytes()),
            registration_id,
        })
    }

    /// Decrypt an envelope from `peer`, establishing a session from a prekey
    /// message when needed.
    pub async fn decrypt_message(
        &self,
        peer: &str,
        envelope: &CiphertextEnvelope,
    ) -> Result<String, E2eeError> {
        let address = self.address(peer)?;
        let message = parse_envelope(envelope)?;

        let lock = self.peer_lock(&address);
        let _guard = lock.lock().await;

        let plaintext = match message {
            CiphertextMessage::Whisper(message) => {
                let mut record = self
                    .store
                    .load_session(&address)
                    .await
                    .map_err(decryption_storage)?
                    .ok_or_else(|| {
                        E2eeError::decryption(
                            DecryptionFailure::NoSession,
                            format!("no session with {address}"),
                        )
                    })?;
                let plaintext = record
                    .decrypt(&message)
                    .map_err(|e| decryption_error(&address, e))?;
                self.store
                    .store_session(&address, &record)
                    .await
                    .map_err(decryption_storage)?;
                plaintext
            }
            CiphertextMessage::PreKey(message) => {
                let inbound = self
                    .inbound_session(peer.trim(), &address, &message)
                    .await?;
                let mut record = inbound.record;
                let plaintext = record
                    .decrypt_prekey(&message)
                    .map_err(|e| decryption_error(&address, e))?;
                self.commit_inbound(peer.trim(), &address, &record, inbound.consumed_prekey)
                    .await?;
                plaintext
            }
        };

        utf8(plaintext)
    }

    /// Make sure a session exists for the handshake carried by an inbound
    /// prekey envelope, without consuming the message.
    ///
    /// The session is built, authenticated against the embedded message on a
    /// copy, and persisted in its pre-message state so a following
    /// [`Self::decrypt_message`] of the same envelope succeeds. Returns true
    /// when a new session was created.
    pub async fn ensure_session_from_prekey_message(
        &self,
        peer: &str,
        envelope: &CiphertextEnvelope,
    ) -> Result<bool, E2eeError> {
        let address = self.address(peer)?;
        let CiphertextMessage::PreKey(message) = parse_envelope(envelope)? else {
            return Err(E2eeError::decryption(
                DecryptionFailure::UnknownMessageType,
                "not a prekey message",
            ));
        };

        let lock = self.peer_lock(&address);
        let _guard = lock.lock().await;

        let inbound = self
            .inbound_session(peer.trim(), &address, &message)
            .await?;
        if !inbound.is_new {
            return Ok(false);
        }

        let mut trial = inbound.record.clone();
        trial
            .decrypt_prekey(&message)
            .map_err(|e| decryption_error(&address, e))?;

        self.commit_inbound(peer.trim(), &address, &inbound.record, inbound.consumed_prekey)
            .await?;
        Ok(true)
    }

    /// The session an inbound prekey message belongs to: the stored one when
    /// the handshake matches, otherwise a fresh responder session.
    async fn inbound_session(
        &self,
        peer: &str,
        address: &str,
        message: &PreKeyMessage,
    ) -> Result<InboundSession, E2eeError> {
        if let Some(record) = self
            .store
            .load_session(address)
            .await
            .map_err(decryption_storage)?
        {
            if record.matches_handshake(&message.handshake) {
                return Ok(InboundSession {
                    record,
                    consumed_prekey: None,
                    is_new: false,
                });
            }
            info!("[KeyManager] New handshake from {address} replaces the existing session");
        }

        self.check_trust(peer, &message.handshake.identity_pk).await?;
        let (identity, _) = self.local_keys().await?;

        // Looked up before the tag can be checked, so an unknown id counts as tampering.
        let unknown = |what: String| {
            warn!("[KeyManager] Prekey message from {address} rejected: {what}");
            E2eeError::decryption(DecryptionFailure::Authentication, what)
        };
        let signed = self
            .store
            .load_signed_pre_key(message.handshake.spk_id)
            .await
            .map_err(decryption_storage)?
            .ok_or_else(|| unknown(format!("unknown signed prekey {}", message.handshake.spk_id)))?;
        let one_time = match message.handshake.otpk_id {
            Some(id) => Some(
                self.store
                    .load_pre_key(id)
                    .await
                    .map_err(decryption_storage)?
                    .ok_or_else(|| unknown(format!("unknown one-time prekey {id}")))?,
            ),
            None => None,
        };

        let record = SessionRecord::respond(
            &identity,
            &signed.secret,
            one_time.as_ref().map(|r| &r.secret),
            message,
        )
        .map_err(|e| decryption_error(address, e))?;

        debug!("[KeyManager] Built responder session for {address}");
        Ok(InboundSession {
            record,
            consumed_prekey: message.handshake.otpk_id,
            is_new: true,
        })
    }

    /// Pin the sender, persist the inbound session and retire the one-time
    /// prekey it used.
    ///
    /// The session is written last: once it is stored the message counts as
    /// consumed, so every earlier step must already have succeeded.
    async fn commit_inbound(
        &self,
        peer: &str,
        address: &str,
        record: &SessionRecord,
        consumed_prekey: Option<u32>,
    ) -> Result<(), E2eeError> {
        self.store
            .save_identity(peer, record.remote_identity())
            .await
            .map_err(decryption_storage)?;
        self.store
            .store_session(address, record)
            .await
            .map_err(decryption_storage)?;

        if let Some(id) = consumed_prekey {
            if let Err(e) = self.store.remove_pre_key(id).await {
                warn!("[KeyManager] Could not delete used one-time prekey {id}: {e}");
            } else {
                debug!("[KeyManager] Consumed one-time prekey {id}");
            }
        }
        Ok(())
    }
}

struct InboundSession {
    record: SessionRecord,
    consumed_prekey: Option<u32>,
    is_new: bool,
}

// === Helpers ===

/// Signed prekey ids follow wall-clock seconds, kept inside the id range.
fn signed_prekey_id() -> u32 {
    (chrono::Utc::now().timestamp().rem_euclid(i64::from(MAX_PREKEY_ID - 1)) + 1) as u32
}

fn following_prekey_id(id: u32) -> u32 {
    if id + 1 >= MAX_PREKEY_ID {
        1
    } else {
        id + 1
    }
}

fn parse_envelope(envelope: &CiphertextEnvelope) -> Result<CiphertextMessage, E2eeError> {
    let message_type = MessageType::try_from(envelope.message_type).map_err(|t| {
        E2eeError::decryption(
            DecryptionFailure::UnknownMessageType,
            format!("unknown message type {t}"),
        )
    })?;
    let bytes = codec::from_base64(&envelope.encrypted_content).map_err(|e| {
        E2eeError::decryption(DecryptionFailure::Malformed, "ciphertext is not base64").with_source(e)
    })?;
    CiphertextMessage::from_bytes(message_type, &bytes).map_err(|e| {
        E2eeError::decryption(DecryptionFailure::from(&e), "could not parse message").with_source(e)
    })
}

fn utf8(plaintext: Zeroizing<Vec<u8>>) -> Result<String, E2eeError> {
    std::str::from_utf8(&plaintext)
        .map(str::to_owned)
        .map_err(|e| {
            E2eeError::decryption(DecryptionFailure::InvalidUtf8, "plaintext is not UTF-8").with_source(e)
        })
}

fn decryption_error(address: &str, e: ProtocolError) -> E2eeError {
    let why = DecryptionFailure::from(&e);
    match why {
        DecryptionFailure::Duplicate => {
            warn!("[KeyManager] Rejected duplicate message from {address}")
        }
        DecryptionFailure::Authentication => {
            warn!("[KeyManager] Message from {address} failed authentication")
        }
        _ => debug!("[KeyManager] Decryption for {address} failed: {e}"),
    }
    E2eeError::decryption(why, format!("message from {address} could not be decrypted")).with_source(e)
}

fn handshake_error(e: ProtocolError) -> E2eeError {
    let why = match &e {
        ProtocolError::X3dh(X3dhError::SigVerifyFailed) => SessionFailure::InvalidSignature,
        _ => SessionFailure::Handshake,
    };
    E2eeError::session(why, "handshake failed").with_source(e)
}

fn session_storage(e: KeyStoreError) -> E2eeError {
    E2eeError::session(SessionFailure::Storage, "key store failure").with_source(e)
}

fn decryption_storage(e: KeyStoreError) -> E2eeError {
    E2eeError::decryption(DecryptionFailure::Storage, "key store failure").with_source(e)
}

fn keygen_storage(e: KeyStoreError) -> E2eeError {
    E2eeError::key_generation("key store failure").with_source(e)
}
