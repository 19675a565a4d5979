use {
    anyhow::{Context, Result as AnyResult},
    serde::{Deserialize, Serialize},
    std::{path::Path, time::Duration},
};

/// Tunables for [`super::KeyManager`].
///
/// Every field has a default, so a partial TOML file is valid:
///
/// ```toml
/// one_time_prekey_count = 50
/// device_id = 2
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyManagerConfig {
    /// Size of the one-time prekey pool generated at initialization.
    pub one_time_prekey_count: u32,
    /// Device id used to build peer addresses.
    pub device_id: u32,
    /// Extra session establishment attempts after the first one.
    pub establish_retries: usize,
    pub retry_delay_ms: u64,
    /// Pool size below which [`super::KeyManager::replenish_one_time_prekeys`]
    /// generates new keys.
    pub prekey_low_watermark: u32,
}

impl Default for KeyManagerConfig {
    fn default() -> Self {
        Self {
            one_time_prekey_count: 100,
            device_id: 1,
            establish_retries: 2,
            retry_delay_ms: 50,
            prekey_low_watermark: 10,
        }
    }
}

impl KeyManagerConfig {
    pub fn from_toml_str(text: &str) -> AnyResult<Self> {
        Ok(toml::from_str(text)?)
    }

    pub async fn load(path: impl AsRef<Path>) -> AnyResult<Self> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read key manager config: {}", path.display()))?;

        Self::from_toml_str(&text)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let conf = KeyManagerConfig::from_toml_str("device_id = 3\nretry_delay_ms = 5\n").unwrap();
        assert_eq!(conf.device_id, 3);
        assert_eq!(conf.retry_delay(), Duration::from_millis(5));
        assert_eq!(conf.one_time_prekey_count, 100);
        assert_eq!(conf.establish_retries, 2);
    }

    #[test]
    fn test_unknown_types_are_rejected() {
        assert!(KeyManagerConfig::from_toml_str("device_id = \"one\"").is_err());
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.toml");
        tokio::fs::write(&path, "one_time_prekey_count = 7\n")
            .await
            .unwrap();

        let conf = KeyManagerConfig::load(&path).await.unwrap();
        assert_eq!(conf.one_time_prekey_count, 7);
        assert_eq!(conf.prekey_low_watermark, 10);

        assert!(KeyManagerConfig::load(dir.path().join("missing.toml"))
            .await
            .is_err());
    }
}
