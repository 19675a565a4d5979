use {
    anyhow::Result,
    parley_sdk::{
        crypto::session::SessionPhase,
        key_manager::{KeyManager, KeyManagerConfig},
        key_store::FileStore,
    },
    std::path::Path,
    tempfile::tempdir,
};

fn config() -> KeyManagerConfig {
    KeyManagerConfig {
        one_time_prekey_count: 3,
        ..KeyManagerConfig::default()
    }
}

async fn open(root: &Path) -> Result<KeyManager<FileStore>> {
    Ok(KeyManager::with_config(FileStore::open(root).await?, config()))
}

#[tokio::test]
async fn test_keys_and_sessions_survive_reopen() -> Result<()> {
    let alice_dir = tempdir()?;
    let bob_dir = tempdir()?;

    let alice = open(alice_dir.path()).await?;
    let bob = open(bob_dir.path()).await?;
    let bob_init = bob.initialize_user_keys_if_needed().await?;
    assert!(bob_init.is_new());
    alice.initialize_user_keys_if_needed().await?;

    alice
        .process_pre_key_bundle("bob", &bob.issue_pre_key_bundle().await?)
        .await?;
    let hello = alice.encrypt_message("bob", "hello").await?;
    assert_eq!(bob.decrypt_message("alice", &hello).await?, "hello");
    drop(bob);

    // A fresh process over the same directory picks up where we left off.
    let bob = open(bob_dir.path()).await?;
    let again = bob.initialize_user_keys_if_needed().await?;
    assert!(!again.is_new());
    assert_eq!(again.identity_public_key(), bob_init.identity_public_key());
    assert_eq!(
        bob.session_phase("alice").await?,
        Some(SessionPhase::Established)
    );

    let reply = bob.encrypt_message("alice", "welcome back").await?;
    assert_eq!(alice.decrypt_message("bob", &reply).await?, "welcome back");

    let next = alice.encrypt_message("bob", "thanks").await?;
    assert_eq!(bob.decrypt_message("alice", &next).await?, "thanks");

    let stats = bob.key_stats().await?;
    assert_eq!(stats.pre_key_count, 2);
    assert_eq!(stats.session_count, 1);
    Ok(())
}

#[tokio::test]
async fn test_wipe_removes_everything_on_disk() -> Result<()> {
    let dir = tempdir()?;
    let manager = open(dir.path()).await?;
    manager.initialize_user_keys_if_needed().await?;
    manager.wipe_all_keys().await?;
    drop(manager);

    let manager = open(dir.path()).await?;
    let stats = manager.key_stats().await?;
    assert!(!stats.has_identity_key);
    assert_eq!(stats.pre_key_count, 0);
    assert!(manager.initialize_user_keys_if_needed().await?.is_new());
    Ok(())
}
