#![forbid(unsafe_code)]
//! # X3DH: Extended Triple Diffie-Hellman key agreement
//!
//! Lets an initiator derive a shared root secret with a peer that may be
//! offline, using the peer's published [`PreKeyBundle`]. The secret seeds the
//! Double Ratchet in [`super::double_ratchet`].
//!
//! ```text
//! Initiator                                  Responder (may be offline)
//! ──────────────────────────────────────────────────────────────────────
//!                                     ├─► publish PreKeyBundle ──┐
//! ┌─(1) fetch bundle ◄────────────────┘                          │
//! │  (2) initiate() ─► HandshakeInit + SharedSecret           (server)
//! └─► HandshakeInit travels inside the first prekey message ─────┤
//!                                     └─► (3) respond() ═════════┘
//! ```
//!
//! Unlike the bare protocol description, no payload is encrypted here: the
//! first application message is already a ratchet message.
//!
//! ```
//! use parley_sdk::crypto::x3dh::{initiate, respond, IdentityKey, PreKeyBundle};
//! use rand::rngs::OsRng;
//! use x25519_dalek::StaticSecret;
//!
//! let alice = IdentityKey::generate();
//! let bob = IdentityKey::generate();
//! let spk = StaticSecret::random_from_rng(OsRng);
//! let bundle = PreKeyBundle::new(&bob, 7, 1, &spk, None);
//!
//! let (init, alice_sk) = initiate(&alice, &bundle).unwrap();
//! let bob_sk = respond(&bob, &spk, None, &init).unwrap();
//! assert_eq!(*alice_sk, *bob_sk);
//! ```

use {
    super::secret_bytes::SecretBytes,
    hkdf::Hkdf,
    rand::rngs::OsRng,
    serde::{Deserialize, Deserializer, Serialize, Serializer},
    sha2::Sha256,
    subtle::ConstantTimeEq,
    thiserror::Error,
    x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret},
    xeddsa::{
        xed25519::{PrivateKey as XEdPrivate, PublicKey as XEdPublic},
        Sign,
        Verify,
    },
    zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing},
};

/// Curve identifier prefixed to encoded public keys.
pub const CURVE_ID_X25519: u8 = 0x05;
/// Length of an encoded public key (`curve_id || u`).
pub const ENCODED_KEY_LEN: usize = 33;
/// HKDF `info` label for the root secret.
const HKDF_INFO: &[u8] = b"X3DH";

/// Shared secret produced by X3DH, wiped on drop.
pub type SharedSecret = Zeroizing<[u8; 32]>;

/// Errors raised while running X3DH.
#[derive(Debug, Error)]
pub enum X3dhError {
    /// XEdDSA signature over the signed prekey did not verify.
    #[error("signed prekey signature verification failed")]
    SigVerifyFailed,
    /// The handshake references a one-time prekey that the caller did not supply.
    #[error("one-time prekey secret missing")]
    MissingOneTimeSecret,
    /// A one-time prekey secret was supplied for a handshake that used none.
    #[error("unexpected one-time prekey secret")]
    UnexpectedOneTimeSecret,
    /// A Diffie-Hellman output was all zeroes (small-order point).
    #[error("non-contributory Diffie-Hellman output")]
    NonContributory,
    /// Public key bytes had the wrong length or curve prefix.
    #[error("malformed public key")]
    MalformedKey,
    /// Internal HKDF error; unreachable with a 32-byte output.
    #[error("HKDF output length is wrong")]
    HkdfInvalidLength,
}

impl From<hkdf::InvalidLength> for X3dhError {
    fn from(_: hkdf::InvalidLength) -> Self {
        Self::HkdfInvalidLength
    }
}

// === Key encoding ===

/// Encode a Curve25519 public key as `curve_id || u_coordinate` (33 bytes).
#[inline]
pub fn encode_pk(pk: &X25519PublicKey) -> [u8; ENCODED_KEY_LEN] {
    let mut out = [0u8; ENCODED_KEY_LEN];
    out[0] = CURVE_ID_X25519;
    out[1..].copy_from_slice(pk.as_bytes());
    out
}

/// Decode a public key from either the 33-byte prefixed form or raw 32 bytes.
pub fn decode_pk(bytes: &[u8]) -> Result<X25519PublicKey, X3dhError> {
    let raw: [u8; 32] = match bytes.len() {
        ENCODED_KEY_LEN if bytes[0] == CURVE_ID_X25519 => bytes[1..]
            .try_into()
            .map_err(|_| X3dhError::MalformedKey)?,
        32 => bytes.try_into().map_err(|_| X3dhError::MalformedKey)?,
        _ => return Err(X3dhError::MalformedKey),
    };
    Ok(X25519PublicKey::from(raw))
}

/// HKDF-SHA-256 over `0xff * 32 || dh1 || .. || dhN` with a zero salt.
fn kdf(dhs: &[&[u8]], info: &[u8]) -> Result<SharedSecret, X3dhError> {
    let mut ikm = Zeroizing::new(Vec::with_capacity(32 + 32 * dhs.len()));
    ikm.extend([0xffu8; 32]);
    for dh in dhs {
        ikm.extend_from_slice(dh);
    }
    let salt = [0u8; 32];
    let hk = Hkdf::<Sha256>::new(Some(&salt), &ikm);
    let mut okm = Zeroizing::new([0u8; 32]);
    hk.expand(info, &mut okm[..])?;
    Ok(okm)
}

/// X25519 with a contributory-output check.
fn dh(secret: &StaticSecret, public: &X25519PublicKey) -> Result<Zeroizing<[u8; 32]>, X3dhError> {
    let shared = secret.diffie_hellman(public);
    if !shared.was_contributory() {
        return Err(X3dhError::NonContributory);
    }
    Ok(Zeroizing::new(shared.to_bytes()))
}

// === Long-term identity keys ===

/// Combined Diffie-Hellman and XEdDSA identity key pair.
///
/// One 32-byte scalar serves both roles: Montgomery form for X25519 and
/// Edwards form for XEdDSA signatures over prekeys.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct IdentityKey {
    secret: StaticSecret,
    #[zeroize(skip)]
    pub dh_public: X25519PublicKey,
    signing: XEdPrivate,
}

impl IdentityKey {
    /// Generate a fresh identity key pair.
    pub fn generate() -> Self {
        Self::from_secret(StaticSecret::random_from_rng(OsRng))
    }

    /// Rebuild an identity from its stored scalar.
    pub fn from_secret(secret: StaticSecret) -> Self {
        let dh_public = X25519PublicKey::from(&secret);
        let signing = XEdPrivate::from(&secret);
        Self {
            secret,
            dh_public,
            signing,
        }
    }

    pub fn secret(&self) -> &StaticSecret {
        &self.secret
    }

    /// Sign `Encode(spk_pub)` with the identity key.
    pub fn sign_prekey(&self, spk_pub: &X25519PublicKey) -> [u8; 64] {
        self.signing.sign(&encode_pk(spk_pub), OsRng)
    }
}

impl Serialize for IdentityKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        SecretBytes::from(&self.secret).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for IdentityKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secret_bytes = SecretBytes::deserialize(deserializer)?;
        Ok(IdentityKey::from_secret(secret_bytes.into()))
    }
}

/// Verify an XEdDSA signature over `Encode(spk_pub)` made by `identity`.
pub fn verify_prekey_signature(
    identity: &X25519PublicKey,
    spk_pub: &X25519PublicKey,
    signature: &[u8; 64],
) -> Result<(), X3dhError> {
    XEdPublic::from(identity)
        .verify(&encode_pk(spk_pub), signature)
        .map_err(|_| X3dhError::SigVerifyFailed)
}

// === Published material ===

/// Validated, decoded form of a peer's published bundle.
#[derive(Clone, Debug)]
pub struct PreKeyBundle {
    pub registration_id: u32,
    /// DH form of the peer's identity key.
    pub identity_pk: X25519PublicKey,
    pub spk_id: u32,
    pub spk_pub: X25519PublicKey,
    /// XEdDSA signature over `Encode(spk_pub)`.
    pub spk_sig: [u8; 64],
    /// At most one one-time prekey; absent once the pool is exhausted.
    pub otpk: Option<(u32, X25519PublicKey)>,
}

impl PreKeyBundle {
    /// Assemble a bundle from local secrets, signing the SPK.
    pub fn new(
        identity: &IdentityKey,
        registration_id: u32,
        spk_id: u32,
        spk_secret: &StaticSecret,
        otpk: Option<(u32, &StaticSecret)>,
    ) -> Self {
        let spk_pub = X25519PublicKey::from(spk_secret);
        Self {
            registration_id,
            identity_pk: identity.dh_public,
            spk_id,
            spk_pub,
            spk_sig: identity.sign_prekey(&spk_pub),
            otpk: otpk.map(|(id, sk)| (id, X25519PublicKey::from(sk))),
        }
    }

    pub fn verify_spk(&self) -> Result<(), X3dhError> {
        verify_prekey_signature(&self.identity_pk, &self.spk_pub, &self.spk_sig)
    }
}

/// Public handshake material the responder needs to derive the same secret.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HandshakeInit {
    /// Initiator identity key (DH form).
    pub identity_pk: X25519PublicKey,
    /// Initiator ephemeral key; also identifies the handshake.
    pub base_key: X25519PublicKey,
    pub spk_id: u32,
    pub otpk_id: Option<u32>,
}

// === Initiator ===

/// Verify the bundle and derive the shared secret on the initiating side.
///
/// # Errors
/// * [`X3dhError::SigVerifyFailed`] when the SPK signature is invalid.
/// * [`X3dhError::NonContributory`] when a bundle key is a small-order point.
pub fn initiate(
    initiator: &IdentityKey,
    bundle: &PreKeyBundle,
) -> Result<(HandshakeInit, SharedSecret), X3dhError> {
    bundle.verify_spk()?;

    let ek_secret = StaticSecret::random_from_rng(OsRng);
    let base_key = X25519PublicKey::from(&ek_secret);

    let dh1 = dh(&initiator.secret, &bundle.spk_pub)?;
    let dh2 = dh(&ek_secret, &bundle.identity_pk)?;
    let dh3 = dh(&ek_secret, &bundle.spk_pub)?;
    let dh4 = bundle
        .otpk
        .as_ref()
        .map(|(_, otpk)| dh(&ek_secret, otpk))
        .transpose()?;

    let mut parts: Vec<&[u8]> = vec![dh1.as_slice(), dh2.as_slice(), dh3.as_slice()];
    if let Some(d4) = &dh4 {
        parts.push(d4.as_slice());
    }
    let sk = kdf(&parts, HKDF_INFO)?;

    let init = HandshakeInit {
        identity_pk: initiator.dh_public,
        base_key,
        spk_id: bundle.spk_id,
        otpk_id: bundle.otpk.as_ref().map(|(id, _)| *id),
    };
    Ok((init, sk))
}

// === Responder ===

/// Derive the shared secret on the responding side.
///
/// The caller resolves `init.spk_id` and `init.otpk_id` against its key store
/// and passes the matching secrets.
pub fn respond(
    responder: &IdentityKey,
    spk_secret: &StaticSecret,
    otpk_secret: Option<&StaticSecret>,
    init: &HandshakeInit,
) -> Result<SharedSecret, X3dhError> {
    match (init.otpk_id, otpk_secret) {
        (Some(_), None) => return Err(X3dhError::MissingOneTimeSecret),
        (None, Some(_)) => return Err(X3dhError::UnexpectedOneTimeSecret),
        _ => {}
    }

    let dh1 = dh(spk_secret, &init.identity_pk)?;
    let dh2 = dh(&responder.secret, &init.base_key)?;
    let dh3 = dh(spk_secret, &init.base_key)?;
    let dh4 = otpk_secret.map(|sk| dh(sk, &init.base_key)).transpose()?;

    let mut parts: Vec<&[u8]> = vec![dh1.as_slice(), dh2.as_slice(), dh3.as_slice()];
    if let Some(d4) = &dh4 {
        parts.push(d4.as_slice());
    }
    kdf(&parts, HKDF_INFO)
}

/// Returns true when both keys encode the same point, in constant time.
pub fn same_key(a: &X25519PublicKey, b: &X25519PublicKey) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// Serde (de)serialization for `x25519_dalek::PublicKey` as 32 raw bytes.
pub mod x25519_serde {
    use {
        super::X25519PublicKey,
        serde::{Deserialize, Deserializer, Serializer},
    };

    pub fn serialize<S>(key: &X25519PublicKey, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(key.as_bytes())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<X25519PublicKey, D::Error>
    where
        D: Deserializer<'de>,
    {
        let bytes: serde_bytes::ByteBuf = Deserialize::deserialize(deserializer)?;
        let raw: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
            serde::de::Error::custom(format!("expected 32 bytes, got {}", bytes.len()))
        })?;
        Ok(X25519PublicKey::from(raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bundle_with_otpk(
        responder: &IdentityKey,
    ) -> (PreKeyBundle, StaticSecret, StaticSecret) {
        let spk = StaticSecret::random_from_rng(OsRng);
        let otpk = StaticSecret::random_from_rng(OsRng);
        let bundle = PreKeyBundle::new(responder, 42, 1, &spk, Some((100, &otpk)));
        (bundle, spk, otpk)
    }

    #[test]
    fn both_sides_derive_the_same_secret_with_one_time_prekey() {
        let alice = IdentityKey::generate();
        let bob = IdentityKey::generate();
        let (bundle, spk, otpk) = bundle_with_otpk(&bob);

        let (init, alice_sk) = initiate(&alice, &bundle).unwrap();
        assert_eq!(init.otpk_id, Some(100));
        assert_eq!(init.spk_id, 1);
        assert!(same_key(&init.identity_pk, &alice.dh_public));

        let bob_sk = respond(&bob, &spk, Some(&otpk), &init).unwrap();
        assert_eq!(*alice_sk, *bob_sk);
    }

    #[test]
    fn signed_prekey_alone_is_enough() {
        let alice = IdentityKey::generate();
        let bob = IdentityKey::generate();
        let spk = StaticSecret::random_from_rng(OsRng);
        let bundle = PreKeyBundle::new(&bob, 42, 9, &spk, None);

        let (init, alice_sk) = initiate(&alice, &bundle).unwrap();
        assert_eq!(init.otpk_id, None);
        let bob_sk = respond(&bob, &spk, None, &init).unwrap();
        assert_eq!(*alice_sk, *bob_sk);
    }

    #[test]
    fn fresh_ephemeral_per_handshake() {
        let alice = IdentityKey::generate();
        let bob = IdentityKey::generate();
        let (bundle, _, _) = bundle_with_otpk(&bob);

        let (a, sk_a) = initiate(&alice, &bundle).unwrap();
        let (b, sk_b) = initiate(&alice, &bundle).unwrap();
        assert!(!same_key(&a.base_key, &b.base_key));
        assert_ne!(*sk_a, *sk_b);
    }

    #[test]
    fn tampered_signature_is_rejected() {
        let alice = IdentityKey::generate();
        let bob = IdentityKey::generate();
        let (mut bundle, _, _) = bundle_with_otpk(&bob);
        bundle.spk_sig[10] ^= 0x01;

        assert!(matches!(
            initiate(&alice, &bundle),
            Err(X3dhError::SigVerifyFailed)
        ));
    }

    #[test]
    fn substituted_identity_is_rejected() {
        let alice = IdentityKey::generate();
        let bob = IdentityKey::generate();
        let mallory = IdentityKey::generate();
        let (mut bundle, _, _) = bundle_with_otpk(&bob);
        bundle.identity_pk = mallory.dh_public;

        assert!(matches!(bundle.verify_spk(), Err(X3dhError::SigVerifyFailed)));
        assert!(initiate(&alice, &bundle).is_err());
    }

    #[test]
    fn missing_one_time_secret_is_reported() {
        let alice = IdentityKey::generate();
        let bob = IdentityKey::generate();
        let (bundle, spk, _) = bundle_with_otpk(&bob);
        let (init, _) = initiate(&alice, &bundle).unwrap();

        assert!(matches!(
            respond(&bob, &spk, None, &init),
            Err(X3dhError::MissingOneTimeSecret)
        ));
    }

    #[test]
    fn wrong_one_time_secret_yields_different_secret() {
        let alice = IdentityKey::generate();
        let bob = IdentityKey::generate();
        let (bundle, spk, _) = bundle_with_otpk(&bob);
        let (init, alice_sk) = initiate(&alice, &bundle).unwrap();

        let wrong = StaticSecret::random_from_rng(OsRng);
        let bob_sk = respond(&bob, &spk, Some(&wrong), &init).unwrap();
        assert_ne!(*alice_sk, *bob_sk);
    }

    #[test]
    fn small_order_base_key_is_rejected() {
        let bob = IdentityKey::generate();
        let alice = IdentityKey::generate();
        let spk = StaticSecret::random_from_rng(OsRng);
        let init = HandshakeInit {
            identity_pk: alice.dh_public,
            base_key: X25519PublicKey::from([0u8; 32]),
            spk_id: 1,
            otpk_id: None,
        };
        assert!(matches!(
            respond(&bob, &spk, None, &init),
            Err(X3dhError::NonContributory)
        ));
    }

    #[test]
    fn key_encoding_accepts_prefixed_and_raw_forms() {
        let id = IdentityKey::generate();
        let encoded = encode_pk(&id.dh_public);
        assert_eq!(encoded[0], CURVE_ID_X25519);
        assert!(same_key(&decode_pk(&encoded).unwrap(), &id.dh_public));
        assert!(same_key(&decode_pk(&encoded[1..]).unwrap(), &id.dh_public));

        let mut wrong_prefix = encoded;
        wrong_prefix[0] = 0x07;
        assert!(matches!(decode_pk(&wrong_prefix), Err(X3dhError::MalformedKey)));
        assert!(matches!(decode_pk(&encoded[..20]), Err(X3dhError::MalformedKey)));
    }

    #[test]
    fn identity_key_survives_bincode_round_trip() {
        let id = IdentityKey::generate();
        let bytes = bincode::serialize(&id).unwrap();
        let restored: IdentityKey = bincode::deserialize(&bytes).unwrap();
        assert!(same_key(&id.dh_public, &restored.dh_public));

        // The restored key can still sign verifiable prekeys.
        let spk = X25519PublicKey::from(&StaticSecret::random_from_rng(OsRng));
        let sig = restored.sign_prekey(&spk);
        assert!(verify_prekey_signature(&id.dh_public, &spk, &sig).is_ok());
    }
}
