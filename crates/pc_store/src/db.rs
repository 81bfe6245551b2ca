//! SQLite-backed record store via sqlx.
//!
//! Every record list is stored as one row. The JSON list is sealed with the
//! vault key before it is written, so nothing readable lands on disk.

use std::path::Path;

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool};

use crate::{
    error::StoreError,
    records::{Record, RecordStore},
    vault::{new_vault_salt, Vault},
};

const STORE_AAD: &[u8] = b"pc-store-v1";

/// Central store handle.  Cheap to clone (Arc internally).
#[derive(Clone)]
pub struct SqliteRecordStore {
    pool: SqlitePool,
    vault: Vault,
}

impl SqliteRecordStore {
    /// Open (or create) the SQLite database at `db_path`.
    /// Runs all pending migrations automatically.
    ///
    /// WAL journal mode is configured at connection time, not inside a
    /// migration: SQLite forbids changing `journal_mode` inside a transaction
    /// and sqlx wraps every migration in one.
    pub async fn open(db_path: &Path, vault: Vault) -> Result<Self, StoreError> {
        let opts = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePool::connect_with(opts).await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| StoreError::Migration(e.to_string()))?;

        tracing::debug!(target: "pc_store", event = "store_opened", path = %db_path.display());
        Ok(Self { pool, vault })
    }

    pub fn vault(&self) -> &Vault {
        &self.vault
    }

    /// The salt used to derive the vault key from the user's password.
    /// Created on first call and persisted in the `meta` table.
    pub async fn vault_salt(&self) -> Result<[u8; 16], StoreError> {
        let existing: Option<String> =
            sqlx::query_scalar("SELECT value FROM meta WHERE key = 'vault_salt'")
                .fetch_optional(&self.pool)
                .await?;

        if let Some(hex_salt) = existing {
            let bytes = hex::decode(&hex_salt).map_err(pc_crypto::CryptoError::from)?;
            return bytes.try_into().map_err(|_| {
                StoreError::Crypto(pc_crypto::CryptoError::InvalidKey(
                    "stored vault salt must be 16 bytes".into(),
                ))
            });
        }

        let salt = new_vault_salt();
        sqlx::query("INSERT INTO meta (key, value) VALUES ('vault_salt', ?)")
            .bind(hex::encode(salt))
            .execute(&self.pool)
            .await?;
        Ok(salt)
    }

    /// Derive the vault key from `password` using the stored salt and unlock.
    pub async fn unlock(&self, password: &[u8]) -> Result<(), StoreError> {
        let salt = self.vault_salt().await?;
        self.vault.unlock(password, &salt).await
    }

    // ── Helpers ──────────────────────────────────────────────────────────────

    /// Encrypt a plaintext value with the vault key.
    async fn encrypt_value(&self, plaintext: &[u8]) -> Result<String, StoreError> {
        self.vault
            .with_key(|key| {
                let ct = pc_crypto::aead::encrypt(key, plaintext, STORE_AAD)?;
                Ok(URL_SAFE_NO_PAD.encode(ct))
            })
            .await
    }

    /// Decrypt a vault-encrypted value.
    async fn decrypt_value(&self, b64: &str) -> Result<Vec<u8>, StoreError> {
        let ct = URL_SAFE_NO_PAD
            .decode(b64)
            .map_err(pc_crypto::CryptoError::from)?;

        self.vault
            .with_key(|key| {
                let pt = pc_crypto::aead::decrypt(key, &ct, STORE_AAD)?;
                Ok(pt.to_vec())
            })
            .await
    }
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn get_list(&self, key: &str) -> Result<Vec<Record>, StoreError> {
        let row: Option<String> = sqlx::query_scalar("SELECT value_enc FROM records WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(enc) => {
                let json = self.decrypt_value(&enc).await?;
                Ok(serde_json::from_slice(&json)?)
            }
            None => Ok(Vec::new()),
        }
    }

    async fn set_list(&self, key: &str, records: Vec<Record>) -> Result<(), StoreError> {
        let json = serde_json::to_vec(&records)?;
        let enc = self.encrypt_value(&json).await?;
        sqlx::query(
            "INSERT INTO records (key, value_enc, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(key) DO UPDATE SET value_enc = excluded.value_enc, updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(enc)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM records WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM records").execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn open_unlocked(dir: &tempfile::TempDir) -> SqliteRecordStore {
        let store = SqliteRecordStore::open(&dir.path().join("chat.db"), Vault::new())
            .await
            .expect("open store");
        store.unlock(b"correct horse").await.expect("unlock");
        store
    }

    #[tokio::test]
    async fn lists_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = open_unlocked(&dir).await;
            store
                .set_list("messages", vec![json!({"id": "m1"}), json!({"id": "m2"})])
                .await
                .unwrap();
            store.pool.close().await;
        }
        let store = open_unlocked(&dir).await;
        let list = store.get_list("messages").await.unwrap();
        assert_eq!(list, vec![json!({"id": "m1"}), json!({"id": "m2"})]);
    }

    #[tokio::test]
    async fn values_are_sealed_at_rest() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_unlocked(&dir).await;
        store
            .set_list("messages", vec![json!({"content": "very secret text"})])
            .await
            .unwrap();

        let raw: String = sqlx::query_scalar("SELECT value_enc FROM records WHERE key = 'messages'")
            .fetch_one(&store.pool)
            .await
            .unwrap();
        assert!(!raw.contains("very secret text"));
    }

    #[tokio::test]
    async fn locked_vault_blocks_reads_and_writes() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_unlocked(&dir).await;
        store.set_list("chats", vec![json!({"id": "c1"})]).await.unwrap();
        store.vault().lock().await;

        assert!(matches!(store.get_list("chats").await, Err(StoreError::VaultLocked)));
        assert!(matches!(
            store.set_list("chats", vec![]).await,
            Err(StoreError::VaultLocked)
        ));
    }

    #[tokio::test]
    async fn wrong_password_cannot_open_records() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_unlocked(&dir).await;
        store.set_list("chats", vec![json!({"id": "c1"})]).await.unwrap();

        store.vault().lock().await;
        store.unlock(b"wrong password").await.unwrap();
        assert!(matches!(store.get_list("chats").await, Err(StoreError::Crypto(_))));
    }

    #[tokio::test]
    async fn remove_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_unlocked(&dir).await;
        store.set_list("a", vec![json!(1)]).await.unwrap();
        store.set_list("b", vec![json!(2)]).await.unwrap();

        store.remove("a").await.unwrap();
        assert!(store.get_list("a").await.unwrap().is_empty());
        assert_eq!(store.get_list("b").await.unwrap().len(), 1);

        store.clear().await.unwrap();
        assert!(store.get_list("b").await.unwrap().is_empty());
    }
}
