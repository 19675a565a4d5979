//! # Session Module: X3DH + Double Ratchet
//!
//! Glues the X3DH agreement and the Double Ratchet into a per-peer session
//! record that can be persisted after every operation.
//!
//! The initiator keeps wrapping its ratchet messages in a [`PreKeyMessage`]
//! until the first reply from the peer authenticates; only then does it switch
//! to bare follow-up messages. The responder builds its session from the
//! handshake material embedded in the first [`PreKeyMessage`] it receives.
//!
//! ## Example
//!
//! ```
//! use parley_sdk::crypto::session::{CiphertextMessage, SessionRecord};
//! use parley_sdk::crypto::x3dh::{IdentityKey, PreKeyBundle};
//! use rand::rngs::OsRng;
//! use x25519_dalek::StaticSecret;
//!
//! let alice_id = IdentityKey::generate();
//! let bob_id = IdentityKey::generate();
//! let spk = StaticSecret::random_from_rng(OsRng);
//! let bundle = PreKeyBundle::new(&bob_id, 2, 1, &spk, None);
//!
//! let mut alice = SessionRecord::initiate(&alice_id, &bundle).unwrap();
//! let CiphertextMessage::PreKey(first) = alice.encrypt(b"hi Bob", 1).unwrap() else {
//!     unreachable!("unconfirmed sessions send prekey messages");
//! };
//!
//! let mut bob = SessionRecord::respond(&bob_id, &spk, None, &first).unwrap();
//! assert_eq!(&*bob.decrypt_prekey(&first).unwrap(), b"hi Bob");
//! assert_eq!(alice.id(), bob.id());
//! ```

use {
    super::{
        double_ratchet::{RatchetError, RatchetMessage, RatchetState},
        x3dh::{self, x25519_serde, HandshakeInit, IdentityKey, PreKeyBundle, X3dhError},
    },
    crate::codec::{ByteReader, ByteWriter, CodecError},
    serde::{Deserialize, Serialize},
    sha2::{Digest, Sha256},
    std::fmt,
    thiserror::Error,
    x25519_dalek::{PublicKey, StaticSecret},
    zeroize::{Zeroize, Zeroizing},
};

/// Errors raised by the session layer.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("X3DH error: {0}")]
    X3dh(#[from] X3dhError),
    #[error("ratchet error: {0}")]
    Ratchet(#[from] RatchetError),
    #[error("malformed message: {0}")]
    Malformed(#[from] CodecError),
    /// A prekey message does not belong to the handshake this session was built from.
    #[error("prekey message does not match this session's handshake")]
    HandshakeMismatch,
}

// === Wire messages ===

/// Envelope type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// Established-session follow-up message.
    Whisper = 1,
    /// Initiating message carrying handshake material.
    PreKey = 3,
}

impl TryFrom<u8> for MessageType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Whisper),
            3 => Ok(Self::PreKey),
            other => Err(other),
        }
    }
}

/// Initiating message: handshake material plus the first ratchet message.
///
/// Layout: `registration_id u32 | spk_id u32 | has_otpk u8 | [otpk_id u32] |
/// identity_key[32] | base_key[32] | ratchet message`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreKeyMessage {
    /// Sender's registration id.
    pub registration_id: u32,
    pub handshake: HandshakeInit,
    pub message: RatchetMessage,
}

impl PreKeyMessage {
    /// Everything before the embedded ratchet message. Also bound into the
    /// ratchet message's associated data.
    fn prefix(registration_id: u32, handshake: &HandshakeInit) -> Vec<u8> {
        let mut w = ByteWriter::with_capacity(77);
        w.put_u32(registration_id).put_u32(handshake.spk_id);
        match handshake.otpk_id {
            Some(id) => w.put_u8(1).put_u32(id),
            None => w.put_u8(0),
        };
        w.put_bytes(handshake.identity_pk.as_bytes())
            .put_bytes(handshake.base_key.as_bytes());
        w.into_inner()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Self::prefix(self.registration_id, &self.handshake);
        out.extend_from_slice(&self.message.to_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = ByteReader::new(bytes);
        let registration_id = r.u32()?;
        let spk_id = r.u32()?;
        let otpk_id = if r.flag()? { Some(r.u32()?) } else { None };
        let identity_pk = PublicKey::from(r.take_array::<32>()?);
        let base_key = PublicKey::from(r.take_array::<32>()?);
        let message = RatchetMessage::from_bytes(r.rest())?;
        Ok(Self {
            registration_id,
            handshake: HandshakeInit {
                identity_pk,
                base_key,
                spk_id,
                otpk_id,
            },
            message,
        })
    }
}

/// Any message produced by [`SessionRecord::encrypt`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CiphertextMessage {
    PreKey(PreKeyMessage),
    Whisper(RatchetMessage),
}

impl CiphertextMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::PreKey(_) => MessageType::PreKey,
            Self::Whisper(_) => MessageType::Whisper,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Self::PreKey(m) => m.to_bytes(),
            Self::Whisper(m) => m.to_bytes(),
        }
    }

    pub fn from_bytes(message_type: MessageType, bytes: &[u8]) -> Result<Self, ProtocolError> {
        Ok(match message_type {
            MessageType::PreKey => Self::PreKey(PreKeyMessage::from_bytes(bytes)?),
            MessageType::Whisper => Self::Whisper(RatchetMessage::from_bytes(bytes)?),
        })
    }
}

// === Session record ===

/// Lifecycle of a session as seen by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionPhase {
    /// Built locally from a bundle; the peer has not answered yet.
    Establishing,
    /// Built from a peer's prekey message that has not been authenticated yet.
    Responding,
    /// Handshake confirmed in both directions.
    Established,
    /// Traffic has flowed after confirmation.
    Active,
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Establishing => "establishing",
            Self::Responding => "responding",
            Self::Established => "established",
            Self::Active => "active",
        };
        f.write_str(name)
    }
}

/// Handshake material the initiator re-sends until the peer confirms.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PendingPreKey {
    spk_id: u32,
    otpk_id: Option<u32>,
}

/// Persistent per-(peer, device) session state.
#[derive(Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    session_id: [u8; 32],
    ratchet: RatchetState,
    #[serde(with = "x25519_serde")]
    local_identity: PublicKey,
    #[serde(with = "x25519_serde")]
    remote_identity: PublicKey,
    remote_registration_id: u32,
    /// Initiator's ephemeral key; identifies the handshake.
    #[serde(with = "x25519_serde")]
    base_key: PublicKey,
    pending: Option<PendingPreKey>,
    phase: SessionPhase,
}

impl SessionRecord {
    /// `SHA-256("session-id" || sk)`.
    pub fn calculate_session_id(shared_secret: &[u8; 32]) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(b"session-id");
        hasher.update(shared_secret);
        hasher.finalize().into()
    }

    /// `min(IK_A, IK_B) || max(IK_A, IK_B)`, identical for both roles.
    fn associated_data(&self) -> Vec<u8> {
        let (first, second) = if self.local_identity.as_bytes() < self.remote_identity.as_bytes() {
            (&self.local_identity, &self.remote_identity)
        } else {
            (&self.remote_identity, &self.local_identity)
        };
        let mut ad = Vec::with_capacity(64);
        ad.extend_from_slice(first.as_bytes());
        ad.extend_from_slice(second.as_bytes());
        ad
    }

    // === Establishment ===

    /// Initiator side: verify the bundle, run X3DH and seed the ratchet
    /// against the peer's signed prekey.
    pub fn initiate(identity: &IdentityKey, bundle: &PreKeyBundle) -> Result<Self, ProtocolError> {
        let (init, sk) = x3dh::initiate(identity, bundle)?;
        let ratchet = RatchetState::init_sender(&sk, bundle.spk_pub)?;

        Ok(Self {
            session_id: Self::calculate_session_id(&sk),
            ratchet,
            local_identity: identity.dh_public,
            remote_identity: bundle.identity_pk,
            remote_registration_id: bundle.registration_id,
            base_key: init.base_key,
            pending: Some(PendingPreKey {
                spk_id: init.spk_id,
                otpk_id: init.otpk_id,
            }),
            phase: SessionPhase::Establishing,
        })
    }

    /// Responder side: derive the session from an inbound prekey message.
    /// The embedded ratchet message is not decrypted here.
    pub fn respond(
        identity: &IdentityKey,
        spk_secret: &StaticSecret,
        otpk_secret: Option<&StaticSecret>,
        msg: &PreKeyMessage,
    ) -> Result<Self, ProtocolError> {
        let sk = x3dh::respond(identity, spk_secret, otpk_secret, &msg.handshake)?;
        let ratchet =
            RatchetState::init_receiver(&sk, (spk_secret.clone(), PublicKey::from(spk_secret)));

        Ok(Self {
            session_id: Self::calculate_session_id(&sk),
            ratchet,
            local_identity: identity.dh_public,
            remote_identity: msg.handshake.identity_pk,
            remote_registration_id: msg.registration_id,
            base_key: msg.handshake.base_key,
            pending: None,
            phase: SessionPhase::Responding,
        })
    }

    // === Messaging ===

    /// Encrypt and advance the sending chain.
    ///
    /// Returns a [`CiphertextMessage::PreKey`] until the handshake has been
    /// confirmed by the peer.
    pub fn encrypt(
        &mut self,
        plaintext: &[u8],
        local_registration_id: u32,
    ) -> Result<CiphertextMessage, ProtocolError> {
        let mut ad = self.associated_data();
        let handshake = self.pending.as_ref().map(|pending| HandshakeInit {
            identity_pk: self.local_identity,
            base_key: self.base_key,
            spk_id: pending.spk_id,
            otpk_id: pending.otpk_id,
        });
        if let Some(handshake) = &handshake {
            ad.extend(PreKeyMessage::prefix(local_registration_id, handshake));
        }
        let message = self.ratchet.encrypt(plaintext, &ad)?;

        if self.phase == SessionPhase::Established {
            self.phase = SessionPhase::Active;
        }

        Ok(match handshake {
            Some(handshake) => CiphertextMessage::PreKey(PreKeyMessage {
                registration_id: local_registration_id,
                handshake,
                message,
            }),
            None => CiphertextMessage::Whisper(message),
        })
    }

    /// Decrypt a follow-up message. On success the handshake counts as
    /// confirmed.
    pub fn decrypt(&mut self, message: &RatchetMessage) -> Result<Zeroizing<Vec<u8>>, ProtocolError> {
        let ad = self.associated_data();
        self.open(message, &ad)
    }

    fn open(&mut self, message: &RatchetMessage, ad: &[u8]) -> Result<Zeroizing<Vec<u8>>, ProtocolError> {
        let plaintext = Zeroizing::new(self.ratchet.decrypt(message, ad)?);

        self.pending = None;
        self.phase = match self.phase {
            SessionPhase::Establishing | SessionPhase::Responding => SessionPhase::Established,
            SessionPhase::Established | SessionPhase::Active => SessionPhase::Active,
        };
        Ok(plaintext)
    }

    /// Decrypt a prekey message that belongs to this session's handshake.
    pub fn decrypt_prekey(
        &mut self,
        message: &PreKeyMessage,
    ) -> Result<Zeroizing<Vec<u8>>, ProtocolError> {
        if !self.matches_handshake(&message.handshake) {
            return Err(ProtocolError::HandshakeMismatch);
        }
        let mut ad = self.associated_data();
        ad.extend(PreKeyMessage::prefix(message.registration_id, &message.handshake));
        self.open(&message.message, &ad)
    }

    /// True when `handshake` is the one this session was built from.
    pub fn matches_handshake(&self, handshake: &HandshakeInit) -> bool {
        x3dh::same_key(&self.base_key, &handshake.base_key)
            && x3dh::same_key(&self.remote_identity, &handshake.identity_pk)
    }

    // === Accessors ===

    pub fn id(&self) -> &[u8; 32] {
        &self.session_id
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// True once the peer has proven it holds the session.
    pub fn is_confirmed(&self) -> bool {
        self.pending.is_none()
    }

    pub fn remote_identity(&self) -> &PublicKey {
        &self.remote_identity
    }

    pub fn remote_registration_id(&self) -> u32 {
        self.remote_registration_id
    }

    pub fn base_key(&self) -> &PublicKey {
        &self.base_key
    }
}

impl Drop for SessionRecord {
    fn drop(&mut self) {
        self.session_id.zeroize();
    }
}

#[cfg(test)]
mod tests {
    use {super::*, assert_matches::assert_matches, rand::rngs::OsRng};

    struct Responder {
        identity: IdentityKey,
        spk: StaticSecret,
        otpk: StaticSecret,
    }

    impl Responder {
        fn new() -> Self {
            Self {
                identity: IdentityKey::generate(),
                spk: StaticSecret::random_from_rng(OsRng),
                otpk: StaticSecret::random_from_rng(OsRng),
            }
        }

        fn bundle(&self) -> PreKeyBundle {
            PreKeyBundle::new(&self.identity, 77, 1, &self.spk, Some((500, &self.otpk)))
        }
    }

    fn expect_prekey(msg: CiphertextMessage) -> PreKeyMessage {
        match msg {
            CiphertextMessage::PreKey(m) => m,
            other => panic!("expected prekey message, got {other:?}"),
        }
    }

    fn expect_whisper(msg: CiphertextMessage) -> RatchetMessage {
        match msg {
            CiphertextMessage::Whisper(m) => m,
            other => panic!("expected follow-up message, got {other:?}"),
        }
    }

    #[test]
    fn test_handshake_and_conversation() {
        let alice_id = IdentityKey::generate();
        let bob = Responder::new();

        let mut alice = SessionRecord::initiate(&alice_id, &bob.bundle()).unwrap();
        assert_eq!(alice.phase(), SessionPhase::Establishing);
        assert_eq!(alice.remote_registration_id(), 77);

        let first = expect_prekey(alice.encrypt(b"hello", 11).unwrap());
        assert_eq!(first.registration_id, 11);
        assert_eq!(first.handshake.otpk_id, Some(500));

        let mut bob_session =
            SessionRecord::respond(&bob.identity, &bob.spk, Some(&bob.otpk), &first).unwrap();
        assert_eq!(bob_session.phase(), SessionPhase::Responding);
        assert_eq!(&*bob_session.decrypt_prekey(&first).unwrap(), b"hello");
        assert_eq!(bob_session.phase(), SessionPhase::Established);
        assert_eq!(alice.id(), bob_session.id());

        let reply = expect_whisper(bob_session.encrypt(b"hi", 77).unwrap());
        assert_eq!(bob_session.phase(), SessionPhase::Active);
        assert_eq!(&*alice.decrypt(&reply).unwrap(), b"hi");
        assert!(alice.is_confirmed());
        assert_eq!(alice.phase(), SessionPhase::Established);

        let next = expect_whisper(alice.encrypt(b"now light", 11).unwrap());
        assert_eq!(&*bob_session.decrypt(&next).unwrap(), b"now light");
    }

    #[test]
    fn test_initiator_repeats_prekey_messages_until_confirmed() {
        let alice_id = IdentityKey::generate();
        let bob = Responder::new();
        let mut alice = SessionRecord::initiate(&alice_id, &bob.bundle()).unwrap();

        let m1 = expect_prekey(alice.encrypt(b"one", 1).unwrap());
        let m2 = expect_prekey(alice.encrypt(b"two", 1).unwrap());
        assert_eq!(m1.handshake, m2.handshake);

        let mut bob_session =
            SessionRecord::respond(&bob.identity, &bob.spk, Some(&bob.otpk), &m1).unwrap();
        assert_eq!(&*bob_session.decrypt_prekey(&m1).unwrap(), b"one");
        assert!(bob_session.matches_handshake(&m2.handshake));
        assert_eq!(&*bob_session.decrypt_prekey(&m2).unwrap(), b"two");
    }

    #[test]
    fn test_prekey_message_from_other_handshake_is_rejected() {
        let alice_id = IdentityKey::generate();
        let bob = Responder::new();
        let mut first_try = SessionRecord::initiate(&alice_id, &bob.bundle()).unwrap();
        let mut second_try = SessionRecord::initiate(&alice_id, &bob.bundle()).unwrap();

        let m1 = expect_prekey(first_try.encrypt(b"a", 1).unwrap());
        let m2 = expect_prekey(second_try.encrypt(b"b", 1).unwrap());

        let mut bob_session =
            SessionRecord::respond(&bob.identity, &bob.spk, Some(&bob.otpk), &m1).unwrap();
        assert_matches!(
            bob_session.decrypt_prekey(&m2),
            Err(ProtocolError::HandshakeMismatch)
        );
    }

    #[test]
    fn test_wrong_signed_prekey_fails_authentication() {
        let alice_id = IdentityKey::generate();
        let bob = Responder::new();
        let mut alice = SessionRecord::initiate(&alice_id, &bob.bundle()).unwrap();
        let first = expect_prekey(alice.encrypt(b"secret", 1).unwrap());

        let wrong_spk = StaticSecret::random_from_rng(OsRng);
        let mut bob_session =
            SessionRecord::respond(&bob.identity, &wrong_spk, Some(&bob.otpk), &first).unwrap();
        assert_matches!(
            bob_session.decrypt_prekey(&first),
            Err(ProtocolError::Ratchet(RatchetError::AuthenticationFailed))
        );
        assert_eq!(bob_session.phase(), SessionPhase::Responding);
    }

    #[test]
    fn test_prekey_envelope_fields_are_authenticated() {
        let alice_id = IdentityKey::generate();
        let bob = Responder::new();
        let mut alice = SessionRecord::initiate(&alice_id, &bob.bundle()).unwrap();
        let first = expect_prekey(alice.encrypt(b"hello", 11).unwrap());

        let mut forged = first.clone();
        forged.registration_id = 12;
        let mut bob_session =
            SessionRecord::respond(&bob.identity, &bob.spk, Some(&bob.otpk), &forged).unwrap();
        assert_matches!(
            bob_session.decrypt_prekey(&forged),
            Err(ProtocolError::Ratchet(RatchetError::AuthenticationFailed))
        );
        // The inner message alone is bound to its envelope too.
        assert_matches!(
            bob_session.decrypt(&first.message),
            Err(ProtocolError::Ratchet(RatchetError::AuthenticationFailed))
        );
        assert_eq!(&*bob_session.decrypt_prekey(&first).unwrap(), b"hello");
    }

    #[test]
    fn test_prekey_message_bytes_parse_back() {
        let alice_id = IdentityKey::generate();
        let bob = Responder::new();
        let mut alice = SessionRecord::initiate(&alice_id, &bob.bundle()).unwrap();
        let msg = alice.encrypt(b"wire", 9).unwrap();

        let bytes = msg.to_bytes();
        let parsed = CiphertextMessage::from_bytes(MessageType::PreKey, &bytes).unwrap();
        assert_eq!(parsed, msg);

        assert_matches!(
            CiphertextMessage::from_bytes(MessageType::PreKey, &bytes[..10]),
            Err(ProtocolError::Malformed(_))
        );
    }

    #[test]
    fn test_message_type_tags() {
        assert_eq!(MessageType::try_from(3), Ok(MessageType::PreKey));
        assert_eq!(MessageType::try_from(1), Ok(MessageType::Whisper));
        assert_eq!(MessageType::try_from(2), Err(2));
        assert_eq!(MessageType::PreKey as u8, 3);
    }

    #[test]
    fn test_record_survives_bincode_round_trip() {
        let alice_id = IdentityKey::generate();
        let bob = Responder::new();
        let mut alice = SessionRecord::initiate(&alice_id, &bob.bundle()).unwrap();
        let first = expect_prekey(alice.encrypt(b"one", 1).unwrap());

        let bytes = bincode::serialize(&alice).unwrap();
        let mut restored: SessionRecord = bincode::deserialize(&bytes).unwrap();
        assert_eq!(restored.phase(), SessionPhase::Establishing);
        assert!(!restored.is_confirmed());
        assert_eq!(restored.id(), alice.id());

        let second = expect_prekey(restored.encrypt(b"two", 1).unwrap());
        let mut bob_session =
            SessionRecord::respond(&bob.identity, &bob.spk, Some(&bob.otpk), &first).unwrap();
        assert_eq!(&*bob_session.decrypt_prekey(&first).unwrap(), b"one");
        assert_eq!(&*bob_session.decrypt_prekey(&second).unwrap(), b"two");
    }
}
