use {
    super::{KeyValueStore, KvError},
    crate::codec::{ByteReader, ByteWriter},
    async_trait::async_trait,
    sha2::{Digest, Sha256},
    std::path::{Path, PathBuf},
    tokio::{fs, io::AsyncWriteExt},
};

const TMP_SUFFIX: &str = ".tmp";
/// Longest key stored under its hex name; 200 hex chars plus the temp suffix
/// stay below the usual 255-byte file name limit.
const MAX_PLAIN_KEY_LEN: usize = 100;
/// File name marker for keys stored under their SHA-256.
const HASHED_MARKER: &str = "~";

/// Directory-backed store: one file per key.
///
/// Keys up to 100 bytes are stored under their hex encoding. Longer keys are
/// stored under `~<hex sha256(key)>` and the file body starts with
/// `u32 key_len || key` so listings can recover them.
///
/// Writes go to a temporary file that is synced and then renamed over the
/// target, so a crash never leaves a half-written record behind and every
/// `put` is durable when it returns.
#[derive(Clone, Debug)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub async fn open(root: impl AsRef<Path>) -> Result<Self, KvError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    /// Open the store under the platform's local data directory, e.g.
    /// `~/.local/share/<app>/keys` on Linux.
    pub async fn open_default(app: &str) -> Result<Self, KvError> {
        let base = dirs::data_local_dir().ok_or(KvError::NoDataDir)?;
        Self::open(base.join(app).join("keys")).await
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, KvError> {
        if key.is_empty() {
            return Err(KvError::InvalidKey(key.to_owned()));
        }
        let name = if is_hashed(key) {
            format!("{HASHED_MARKER}{}", hex::encode(Sha256::digest(key)))
        } else {
            hex::encode(key)
        };
        Ok(self.root.join(name))
    }

    /// Key stored in `name`, reading the file body for hashed names.
    async fn key_of(&self, name: &str) -> Result<Option<String>, KvError> {
        if name.ends_with(TMP_SUFFIX) {
            return Ok(None);
        }
        if name.starts_with(HASHED_MARKER) {
            let bytes = match fs::read(self.root.join(name)).await {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
                Err(e) => return Err(e.into()),
            };
            return Ok(split_framed(&bytes).map(|(key, _)| key));
        }
        let Ok(raw) = hex::decode(name) else {
            return Ok(None);
        };
        Ok(String::from_utf8(raw).ok())
    }
}

fn is_hashed(key: &str) -> bool {
    key.len() > MAX_PLAIN_KEY_LEN
}

fn frame(key: &str, value: &[u8]) -> Vec<u8> {
    let mut w = ByteWriter::with_capacity(4 + key.len() + value.len());
    w.put_u32(key.len() as u32)
        .put_bytes(key.as_bytes())
        .put_bytes(value);
    w.into_inner()
}

fn split_framed(bytes: &[u8]) -> Option<(String, Vec<u8>)> {
    let mut reader = ByteReader::new(bytes);
    let len = reader.u32().ok()? as usize;
    let key = std::str::from_utf8(reader.take(len).ok()?).ok()?.to_owned();
    Some((key, reader.rest().to_vec()))
}

#[async_trait]
impl KeyValueStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        let bytes = match fs::read(self.path_for(key)?).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if !is_hashed(key) {
            return Ok(Some(bytes));
        }
        match split_framed(&bytes) {
            Some((stored, value)) if stored == key => Ok(Some(value)),
            _ => Err(KvError::Corrupt(key.to_owned())),
        }
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), KvError> {
        let path = self.path_for(key)?;
        let mut tmp = path.clone().into_os_string();
        tmp.push(TMP_SUFFIX);
        let tmp = PathBuf::from(tmp);

        let body = if is_hashed(key) { frame(key, &value) } else { value };
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(&body).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        match fs::remove_file(self.path_for(key)?).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>, KvError> {
        let mut dir = fs::read_dir(&self.root).await?;
        let mut keys = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            match self.key_of(name).await? {
                Some(key) if key.starts_with(prefix) => keys.push(key),
                _ => {}
            }
        }
        keys.sort();
        Ok(keys)
    }
}
