//! Zeroizing carrier for 32-byte X25519 scalars crossing a serde boundary.

use {
    serde::{Deserialize, Deserializer, Serialize, Serializer},
    x25519_dalek::StaticSecret,
    zeroize::{Zeroize, ZeroizeOnDrop},
};

/// Raw secret scalar, wiped on drop. Serialized as a byte string.
#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct SecretBytes(#[serde(with = "serde_bytes")] pub [u8; 32]);

impl From<&StaticSecret> for SecretBytes {
    fn from(sk: &StaticSecret) -> Self {
        Self(sk.to_bytes())
    }
}

impl From<SecretBytes> for StaticSecret {
    fn from(raw: SecretBytes) -> Self {
        StaticSecret::from(raw.0)
    }
}

/// `#[serde(with = "...")]` adapter for [`StaticSecret`] fields.
pub mod static_secret_serde {
    use super::*;

    pub fn serialize<S>(secret: &StaticSecret, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        SecretBytes::from(secret).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<StaticSecret, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(SecretBytes::deserialize(deserializer)?.into())
    }
}

#[cfg(test)]
mod tests {
    use {super::*, rand::rngs::OsRng, x25519_dalek::PublicKey};

    #[derive(Serialize, Deserialize)]
    struct Holder {
        #[serde(with = "static_secret_serde")]
        secret: StaticSecret,
    }

    #[test]
    fn static_secret_round_trips_through_bincode() {
        let holder = Holder {
            secret: StaticSecret::random_from_rng(OsRng),
        };
        let bytes = bincode::serialize(&holder).unwrap();
        let back: Holder = bincode::deserialize(&bytes).unwrap();
        assert_eq!(
            PublicKey::from(&holder.secret).as_bytes(),
            PublicKey::from(&back.secret).as_bytes()
        );
    }
}
