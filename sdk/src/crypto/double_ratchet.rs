//! Double Ratchet
//!
//! Follows the public Signal Double Ratchet specification
//! <https://signal.org/docs/specifications/doubleratchet/>. Headers travel in
//! the clear but are authenticated as associated data of the AES-SIV payload.
//!
//! Decryption is transactional: all chain updates happen on a scratch copy of
//! the state that only replaces `self` once the payload authenticates. A
//! rejected message therefore never desynchronises the receiving chain.
//!
//! ```rust
//! use parley_sdk::crypto::double_ratchet::RatchetState;
//!
//! let root = [7u8; 32]; // from X3DH
//! let bob_kp = RatchetState::generate_dh();
//!
//! let mut alice = RatchetState::init_sender(&root, bob_kp.1).unwrap();
//! let mut bob = RatchetState::init_receiver(&root, bob_kp);
//!
//! let msg = alice.encrypt(b"hello Bob!", b"ad").unwrap();
//! assert_eq!(bob.decrypt(&msg, b"ad").unwrap(), b"hello Bob!");
//!
//! let reply = bob.encrypt(b"hi Alice", b"ad").unwrap();
//! assert_eq!(alice.decrypt(&reply, b"ad").unwrap(), b"hi Alice");
//! ```

use {
    super::{secret_bytes::static_secret_serde, x3dh::x25519_serde},
    crate::codec::{ByteReader, ByteWriter},
    aes_siv::{
        aead::{Aead, KeyInit, Payload},
        Aes128SivAead,
        Nonce,
    },
    hkdf::Hkdf,
    hmac::{Hmac, Mac},
    rand::{rngs::OsRng, RngCore},
    serde::{Deserialize, Serialize},
    sha2::Sha256,
    std::collections::{HashMap, VecDeque},
    subtle::ConstantTimeEq,
    thiserror::Error,
    x25519_dalek::{PublicKey, StaticSecret},
    zeroize::{Zeroize, Zeroizing},
};

/// Maximum number of message keys skipped within one receiving chain.
pub const MAX_SKIP_PER_CHAIN: u32 = 1_000;
/// Upper bound on stored skipped keys across all chains.
const MAX_SKIP_GLOBAL: usize = 2 * MAX_SKIP_PER_CHAIN as usize;
/// Retired remote ratchet keys remembered for replay classification.
const MAX_RETIRED_CHAINS: usize = 8;

/// AES-SIV nonce length.
pub const NONCE_LEN: usize = 16;
/// AES-SIV synthetic IV (tag) length.
const TAG_LEN: usize = 16;
/// `dh || pn || n`.
pub const HEADER_LEN: usize = 32 + 4 + 4;

const ROOT_INFO: &[u8] = b"DR-Root";

type HkdfSha256 = Hkdf<Sha256>;
type HmacSha256 = Hmac<Sha256>;

/// Failures returned by [`RatchetState`] operations.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum RatchetError {
    #[error("missing sending chain")]
    MissingSendingChain,
    #[error("missing receiving chain")]
    MissingReceivingChain,
    #[error("message authentication failed")]
    AuthenticationFailed,
    /// Index already consumed on its chain, or a chain already ratcheted past.
    #[error("duplicate message")]
    Duplicate,
    #[error("max skip exceeded")]
    MaxSkipExceeded,
    #[error("invalid public key")]
    InvalidPublicKey,
    #[error("malformed message")]
    Malformed,
    /// Key derivation or cipher setup failed; unreachable with fixed sizes.
    #[error("crypto backend error")]
    CryptoError,
}

// === Wire structures ===

/// Ratchet header: sender's current ratchet key and chain counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub dh: PublicKey,
    /// Length of the sender's previous sending chain.
    pub pn: u32,
    /// Index within the current sending chain.
    pub n: u32,
}

impl Header {
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[..32].copy_from_slice(self.dh.as_bytes());
        out[32..36].copy_from_slice(&self.pn.to_be_bytes());
        out[36..].copy_from_slice(&self.n.to_be_bytes());
        out
    }

    fn read(reader: &mut ByteReader<'_>) -> Result<Self, RatchetError> {
        let dh: [u8; 32] = reader.take_array().map_err(|_| RatchetError::Malformed)?;
        let pn = reader.u32().map_err(|_| RatchetError::Malformed)?;
        let n = reader.u32().map_err(|_| RatchetError::Malformed)?;
        Ok(Self {
            dh: PublicKey::from(dh),
            pn,
            n,
        })
    }
}

/// A follow-up message: `header || nonce || ciphertext`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RatchetMessage {
    pub header: Header,
    pub nonce: [u8; NONCE_LEN],
    pub ciphertext: Vec<u8>,
}

impl RatchetMessage {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = ByteWriter::with_capacity(HEADER_LEN + NONCE_LEN + self.ciphertext.len());
        w.put_bytes(&self.header.to_bytes())
            .put_bytes(&self.nonce)
            .put_bytes(&self.ciphertext);
        w.into_inner()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, RatchetError> {
        let mut reader = ByteReader::new(bytes);
        let header = Header::read(&mut reader)?;
        let nonce = reader.take_array().map_err(|_| RatchetError::Malformed)?;
        if reader.remaining() < TAG_LEN {
            return Err(RatchetError::Malformed);
        }
        Ok(Self {
            header,
            nonce,
            ciphertext: reader.rest().to_vec(),
        })
    }
}

// === Ratchet state ===

/// Per-session Double Ratchet state. Serializable so it can be persisted
/// after every operation.
#[derive(Clone, Serialize, Deserialize)]
pub struct RatchetState {
    /// Own ratchet private key.
    #[serde(with = "static_secret_serde")]
    dhs: StaticSecret,
    #[serde(with = "x25519_serde")]
    dhs_pub: PublicKey,
    /// Remote ratchet public key.
    dhr: Option<[u8; 32]>,
    /// Root key.
    rk: [u8; 32],
    /// Sending chain key.
    cks: Option<[u8; 32]>,
    /// Receiving chain key.
    ckr: Option<[u8; 32]>,
    ns: u32,
    nr: u32,
    pn: u32,
    /// `(remote ratchet key, n)` → message key.
    mkskipped: HashMap<([u8; 32], u32), [u8; 32]>,
    /// Previous remote ratchet keys, oldest first.
    retired: VecDeque<[u8; 32]>,
}

impl Zeroize for RatchetState {
    fn zeroize(&mut self) {
        self.rk.zeroize();
        if let Some(ref mut k) = self.cks {
            k.zeroize();
        }
        if let Some(ref mut k) = self.ckr {
            k.zeroize();
        }
        for mk in self.mkskipped.values_mut() {
            mk.zeroize();
        }
        self.mkskipped.clear();
    }
}

impl Drop for RatchetState {
    fn drop(&mut self) {
        self.zeroize();
    }
}

impl RatchetState {
    // === Key utilities ===

    /// Generate a fresh X25519 key pair.
    pub fn generate_dh() -> (StaticSecret, PublicKey) {
        let sk = StaticSecret::random_from_rng(OsRng);
        let pk = PublicKey::from(&sk);
        (sk, pk)
    }

    /// Reject the identity point.
    fn validate_pk(pk: &PublicKey) -> Result<(), RatchetError> {
        if pk.as_bytes().ct_eq(&[0u8; 32]).into() {
            return Err(RatchetError::InvalidPublicKey);
        }
        Ok(())
    }

    fn dh(sk: &StaticSecret, pk: &PublicKey) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(sk.diffie_hellman(pk).to_bytes())
    }

    /// Root KDF: `(rk, dh_out)` → `(new_rk, chain_key)`.
    fn kdf_rk(rk: &[u8; 32], dh_out: &[u8; 32]) -> Result<([u8; 32], [u8; 32]), RatchetError> {
        let hk = HkdfSha256::new(Some(rk), dh_out);
        let mut okm = Zeroizing::new([0u8; 64]);
        hk.expand(ROOT_INFO, &mut okm[..])
            .map_err(|_| RatchetError::CryptoError)?;
        let mut new_rk = [0u8; 32];
        new_rk.copy_from_slice(&okm[..32]);
        let mut ck = [0u8; 32];
        ck.copy_from_slice(&okm[32..]);
        Ok((new_rk, ck))
    }

    /// Chain KDF: HMAC with `0x01` for the next chain key, `0x02` for the
    /// message key.
    fn kdf_ck(ck: &[u8; 32]) -> Result<([u8; 32], Zeroizing<[u8; 32]>), RatchetError> {
        let step = |label: u8| -> Result<[u8; 32], RatchetError> {
            let mut mac = <HmacSha256 as Mac>::new_from_slice(ck)
                .map_err(|_| RatchetError::CryptoError)?;
            mac.update(&[label]);
            let mut out = [0u8; 32];
            out.copy_from_slice(&mac.finalize().into_bytes());
            Ok(out)
        };
        Ok((step(0x01)?, Zeroizing::new(step(0x02)?)))
    }

    fn seal(
        mk: &[u8; 32],
        header: &Header,
        plaintext: &[u8],
        ad: &[u8],
    ) -> Result<([u8; NONCE_LEN], Vec<u8>), RatchetError> {
        let cipher = Aes128SivAead::new_from_slice(mk).map_err(|_| RatchetError::CryptoError)?;
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let mut aad = ad.to_vec();
        aad.extend_from_slice(&header.to_bytes());
        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: &aad,
                },
            )
            .map_err(|_| RatchetError::CryptoError)?;
        Ok((nonce, ciphertext))
    }

    fn open(mk: &[u8; 32], msg: &RatchetMessage, ad: &[u8]) -> Result<Vec<u8>, RatchetError> {
        let cipher = Aes128SivAead::new_from_slice(mk).map_err(|_| RatchetError::CryptoError)?;
        let mut aad = ad.to_vec();
        aad.extend_from_slice(&msg.header.to_bytes());
        cipher
            .decrypt(
                Nonce::from_slice(&msg.nonce),
                Payload {
                    msg: &msg.ciphertext,
                    aad: &aad,
                },
            )
            .map_err(|_| RatchetError::AuthenticationFailed)
    }

    // === Constructors ===

    fn blank(dhs: StaticSecret, dhs_pub: PublicKey, rk: [u8; 32]) -> Self {
        Self {
            dhs,
            dhs_pub,
            dhr: None,
            rk,
            cks: None,
            ckr: None,
            ns: 0,
            nr: 0,
            pn: 0,
            mkskipped: HashMap::new(),
            retired: VecDeque::new(),
        }
    }

    /// Initiator side: performs the first DH step against the responder's
    /// signed prekey so the initiator can send immediately.
    pub fn init_sender(sk: &[u8; 32], receiver_pub: PublicKey) -> Result<Self, RatchetError> {
        Self::validate_pk(&receiver_pub)?;
        let (dhs, dhs_pub) = Self::generate_dh();
        let (rk, cks) = Self::kdf_rk(sk, &Self::dh(&dhs, &receiver_pub))?;

        let mut state = Self::blank(dhs, dhs_pub, rk);
        state.dhr = Some(*receiver_pub.as_bytes());
        state.cks = Some(cks);
        Ok(state)
    }

    /// Responder side: waits for the initiator's first ratchet key.
    pub fn init_receiver(sk: &[u8; 32], receiver_kp: (StaticSecret, PublicKey)) -> Self {
        let (dhs, dhs_pub) = receiver_kp;
        Self::blank(dhs, dhs_pub, *sk)
    }

    /// Current local ratchet public key.
    pub fn ratchet_public(&self) -> PublicKey {
        self.dhs_pub
    }

    /// Number of stored skipped message keys.
    pub fn skipped_len(&self) -> usize {
        self.mkskipped.len()
    }

    pub fn can_send(&self) -> bool {
        self.cks.is_some()
    }

    // === Send / receive ===

    /// Encrypt `plaintext`, advancing the sending chain.
    pub fn encrypt(&mut self, plaintext: &[u8], ad: &[u8]) -> Result<RatchetMessage, RatchetError> {
        let cks = self.cks.ok_or(RatchetError::MissingSendingChain)?;
        let (new_cks, mk) = Self::kdf_ck(&cks)?;
        let header = Header {
            dh: self.dhs_pub,
            pn: self.pn,
            n: self.ns,
        };
        let (nonce, ciphertext) = Self::seal(&mk, &header, plaintext, ad)?;

        self.cks = Some(new_cks);
        self.ns = self.ns.wrapping_add(1);
        Ok(RatchetMessage {
            header,
            nonce,
            ciphertext,
        })
    }

    /// Decrypt an incoming message. State is only updated on success.
    pub fn decrypt(&mut self, msg: &RatchetMessage, ad: &[u8]) -> Result<Vec<u8>, RatchetError> {
        let remote = *msg.header.dh.as_bytes();

        if let Some(mk) = self.mkskipped.get(&(remote, msg.header.n)).copied() {
            let mk = Zeroizing::new(mk);
            let plaintext = Self::open(&mk, msg, ad)?;
            self.mkskipped.remove(&(remote, msg.header.n));
            return Ok(plaintext);
        }

        let mut next = self.clone();
        let on_current_chain = next
            .dhr
            .map_or(false, |dhr| bool::from(dhr.ct_eq(&remote)));

        if on_current_chain {
            if msg.header.n < next.nr {
                // Consumed index with no skipped key left.
                return Err(RatchetError::Duplicate);
            }
        } else {
            if next.retired.contains(&remote) {
                return Err(RatchetError::Duplicate);
            }
            next.skip_message_keys(msg.header.pn)?;
            next.dh_ratchet(&msg.header.dh)?;
        }
        next.skip_message_keys(msg.header.n)?;

        let ckr = next.ckr.ok_or(RatchetError::MissingReceivingChain)?;
        let (new_ckr, mk) = Self::kdf_ck(&ckr)?;
        let plaintext = Self::open(&mk, msg, ad)?;

        next.ckr = Some(new_ckr);
        next.nr = next.nr.wrapping_add(1);
        *self = next;
        Ok(plaintext)
    }

    // === Internal helpers ===

    /// Derive and store message keys of the current receiving chain up to `until`.
    fn skip_message_keys(&mut self, until: u32) -> Result<(), RatchetError> {
        let (Some(mut ck), Some(dhr)) = (self.ckr, self.dhr) else {
            return Ok(());
        };
        if until > self.nr.saturating_add(MAX_SKIP_PER_CHAIN) {
            return Err(RatchetError::MaxSkipExceeded);
        }
        while self.nr < until {
            let (next_ck, mk) = Self::kdf_ck(&ck)?;
            ck = next_ck;
            self.mkskipped.insert((dhr, self.nr), *mk);
            if self.mkskipped.len() > MAX_SKIP_GLOBAL {
                return Err(RatchetError::MaxSkipExceeded);
            }
            self.nr += 1;
        }
        self.ckr = Some(ck);
        Ok(())
    }

    /// DH ratchet step on a new remote ratchet key.
    fn dh_ratchet(&mut self, remote: &PublicKey) -> Result<(), RatchetError> {
        Self::validate_pk(remote)?;

        if let Some(old) = self.dhr.take() {
            self.retired.push_back(old);
            if self.retired.len() > MAX_RETIRED_CHAINS {
                if let Some(dropped) = self.retired.pop_front() {
                    self.mkskipped.retain(|(chain, _), _| *chain != dropped);
                }
            }
        }

        self.pn = self.ns;
        self.ns = 0;
        self.nr = 0;
        self.dhr = Some(*remote.as_bytes());

        let (rk, ckr) = Self::kdf_rk(&self.rk, &Self::dh(&self.dhs, remote))?;
        self.rk = rk;
        self.ckr = Some(ckr);

        let (dhs, dhs_pub) = Self::generate_dh();
        self.dhs = dhs;
        self.dhs_pub = dhs_pub;

        let (rk, cks) = Self::kdf_rk(&self.rk, &Self::dh(&self.dhs, remote))?;
        self.rk = rk;
        self.cks = Some(cks);
        Ok(())
    }
}
