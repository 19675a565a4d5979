//! JSON-facing shapes exchanged with the key directory and the messaging
//! transport.

use {
    crate::{
        codec,
        crypto::x3dh::{self, PreKeyBundle},
    },
    serde::{Deserialize, Serialize},
    thiserror::Error,
    x25519_dalek::PublicKey,
};

/// Encode a public key the way it is published: base64 of `0x05 || u`.
pub fn encode_public_key(key: &PublicKey) -> String {
    codec::to_base64(x3dh::encode_pk(key))
}

/// Decode a published public key, accepting the prefixed or raw form.
pub fn decode_public_key(text: &str) -> Option<PublicKey> {
    let bytes = codec::from_base64(text).ok()?;
    x3dh::decode_pk(&bytes).ok()
}

// === Publishing ===

/// A one-time prekey as published to the directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OneTimePreKeyPublic {
    pub key_id: u32,
    pub public_key: String,
}

/// Public key material uploaded once after key initialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeysForServer {
    pub identity_public_key: String,
    pub registration_id: u32,
    pub signed_pre_key_id: u32,
    pub signed_pre_key: String,
    pub pre_key_signature: String,
    pub one_time_pre_keys: Vec<OneTimePreKeyPublic>,
}

/// Outcome of [`super::KeyManager::initialize_user_keys_if_needed`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyInitialization {
    /// Keys were already present; nothing was generated.
    Existing {
        identity_public_key: String,
        registration_id: u32,
    },
    /// Fresh keys were generated and persisted; publish `keys_for_server`.
    Created { keys_for_server: KeysForServer },
}

impl KeyInitialization {
    pub fn is_new(&self) -> bool {
        matches!(self, Self::Created { .. })
    }

    pub fn identity_public_key(&self) -> &str {
        match self {
            Self::Existing {
                identity_public_key,
                ..
            } => identity_public_key,
            Self::Created { keys_for_server } => &keys_for_server.identity_public_key,
        }
    }

    pub fn registration_id(&self) -> u32 {
        match self {
            Self::Existing {
                registration_id, ..
            } => *registration_id,
            Self::Created { keys_for_server } => keys_for_server.registration_id,
        }
    }

    /// Material to publish, present only for freshly created keys.
    pub fn keys_for_server(&self) -> Option<&KeysForServer> {
        match self {
            Self::Existing { .. } => None,
            Self::Created { keys_for_server } => Some(keys_for_server),
        }
    }
}

// === Fetched bundles ===

/// Signed prekey part of a fetched bundle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedPreKeyDto {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_id: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

/// A peer's bundle as returned by the directory. Every field is optional on
/// the wire; [`PreKeyBundleDto::validate`] enforces presence.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreKeyBundleDto {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity_public_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registration_id: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signed_pre_key: Option<SignedPreKeyDto>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub one_time_pre_key: Option<OneTimePreKeyPublic>,
}

/// Structural problems with a [`PreKeyBundleDto`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BundleFieldError {
    #[error("missing field `{0}`")]
    Missing(&'static str),
    #[error("field `{0}` is not valid base64 or has the wrong length")]
    Invalid(&'static str),
}

impl PreKeyBundleDto {
    /// Check presence and encoding of every field and decode the bundle.
    ///
    /// The signature itself is not verified here.
    pub fn validate(&self) -> Result<PreKeyBundle, BundleFieldError> {
        let identity_pk = required_key("identityPublicKey", self.identity_public_key.as_deref())?;
        let registration_id = self
            .registration_id
            .ok_or(BundleFieldError::Missing("registrationId"))?;
        let spk = self
            .signed_pre_key
            .as_ref()
            .ok_or(BundleFieldError::Missing("signedPreKey"))?;
        let spk_id = spk
            .key_id
            .ok_or(BundleFieldError::Missing("signedPreKey.keyId"))?;
        let spk_pub = required_key("signedPreKey.publicKey", spk.public_key.as_deref())?;
        let signature = spk
            .signature
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .ok_or(BundleFieldError::Missing("signedPreKey.signature"))?;
        let spk_sig = codec::from_base64_array::<64>(signature)
            .map_err(|_| BundleFieldError::Invalid("signedPreKey.signature"))?;
        let otpk = self
            .one_time_pre_key
            .as_ref()
            .map(|otpk| {
                decode_public_key(&otpk.public_key)
                    .map(|pk| (otpk.key_id, pk))
                    .ok_or(BundleFieldError::Invalid("oneTimePreKey.publicKey"))
            })
            .transpose()?;

        Ok(PreKeyBundle {
            registration_id,
            identity_pk,
            spk_id,
            spk_pub,
            spk_sig,
            otpk,
        })
    }
}

impl From<&PreKeyBundle> for PreKeyBundleDto {
    fn from(bundle: &PreKeyBundle) -> Self {
        Self {
            identity_public_key: Some(encode_public_key(&bundle.identity_pk)),
            registration_id: Some(bundle.registration_id),
            signed_pre_key: Some(SignedPreKeyDto {
                key_id: Some(bundle.spk_id),
                public_key: Some(encode_public_key(&bundle.spk_pub)),
                signature: Some(codec::to_base64(bundle.spk_sig)),
            }),
            one_time_pre_key: bundle.otpk.map(|(key_id, pk)| OneTimePreKeyPublic {
                key_id,
                public_key: encode_public_key(&pk),
            }),
        }
    }
}

fn required_key(field: &'static str, value: Option<&str>) -> Result<PublicKey, BundleFieldError> {
    let text = value
        .filter(|s| !s.trim().is_empty())
        .ok_or(BundleFieldError::Missing(field))?;
    decode_public_key(text).ok_or(BundleFieldError::Invalid(field))
}

// === Messages ===

/// Wire envelope for one encrypted chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CiphertextEnvelope {
    /// `3` for prekey (initiating) messages, `1` for follow-up messages.
    #[serde(rename = "type")]
    pub message_type: u8,
    /// Base64 of the serialized message.
    pub encrypted_content: String,
    /// Sender's registration id.
    pub registration_id: u32,
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::crypto::x3dh::IdentityKey,
        assert_matches::assert_matches,
        rand::rngs::OsRng,
        x25519_dalek::StaticSecret,
    };

    fn bundle_dto() -> PreKeyBundleDto {
        let identity = IdentityKey::generate();
        let spk = StaticSecret::random_from_rng(OsRng);
        let otpk = StaticSecret::random_from_rng(OsRng);
        PreKeyBundleDto::from(&PreKeyBundle::new(&identity, 77, 5, &spk, Some((9, &otpk))))
    }

    #[test]
    fn test_valid_bundle_decodes() {
        let bundle = bundle_dto().validate().unwrap();
        assert_eq!(bundle.registration_id, 77);
        assert_eq!(bundle.spk_id, 5);
        assert_eq!(bundle.otpk.map(|(id, _)| id), Some(9));
        assert!(bundle.verify_spk().is_ok());
    }

    #[test]
    fn test_missing_fields_are_named() {
        let mut dto = bundle_dto();
        dto.registration_id = None;
        assert_matches!(dto.validate(), Err(BundleFieldError::Missing("registrationId")));

        let mut dto = bundle_dto();
        dto.signed_pre_key = None;
        assert_matches!(dto.validate(), Err(BundleFieldError::Missing("signedPreKey")));

        let mut dto = bundle_dto();
        dto.identity_public_key = Some("  ".into());
        assert_matches!(
            dto.validate(),
            Err(BundleFieldError::Missing("identityPublicKey"))
        );

        let mut dto = bundle_dto();
        if let Some(spk) = dto.signed_pre_key.as_mut() {
            spk.signature = None;
        }
        assert_matches!(
            dto.validate(),
            Err(BundleFieldError::Missing("signedPreKey.signature"))
        );
    }

    #[test]
    fn test_bad_encodings_are_invalid() {
        let mut dto = bundle_dto();
        if let Some(spk) = dto.signed_pre_key.as_mut() {
            spk.public_key = Some(codec::to_base64([1u8; 20]));
        }
        assert_matches!(
            dto.validate(),
            Err(BundleFieldError::Invalid("signedPreKey.publicKey"))
        );

        let mut dto = bundle_dto();
        dto.identity_public_key = Some("%%%not base64%%%".into());
        assert_matches!(
            dto.validate(),
            Err(BundleFieldError::Invalid("identityPublicKey"))
        );
    }

    #[test]
    fn test_bundle_json_uses_camel_case() {
        let json = serde_json::to_value(bundle_dto()).unwrap();
        assert!(json["identityPublicKey"].is_string());
        assert!(json["signedPreKey"]["keyId"].is_number());
        assert!(json["oneTimePreKey"]["publicKey"].is_string());

        let sparse: PreKeyBundleDto =
            serde_json::from_str(r#"{"registrationId": 4}"#).unwrap();
        assert_eq!(sparse.registration_id, Some(4));
        assert!(sparse.signed_pre_key.is_none());
    }

    #[test]
    fn test_envelope_type_field_is_named_type() {
        let envelope = CiphertextEnvelope {
            message_type: 3,
            encrypted_content: "AAEC".into(),
            registration_id: 12,
        };
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"type": 3, "encryptedContent": "AAEC", "registrationId": 12})
        );
    }

    #[test]
    fn test_published_keys_carry_curve_prefix() {
        let pk = IdentityKey::generate().dh_public;
        let encoded = encode_public_key(&pk);
        assert_eq!(codec::from_base64(&encoded).unwrap()[0], x3dh::CURVE_ID_X25519);
        let raw = codec::to_base64(pk.as_bytes());
        assert!(x3dh::same_key(&decode_public_key(&raw).unwrap(), &pk));
    }
}
