//! Vault: in-memory key material unlocked by user password.
//!
//! The vault holds the 32-byte record-sealing key in memory. Locking
//! zeroizes it; every store access then fails with `VaultLocked` until
//! the vault is unlocked again.

use std::sync::Arc;
use tokio::sync::RwLock;
use zeroize::ZeroizeOnDrop;

use pc_crypto::kdf::{generate_salt, vault_key_from_password};

use crate::error::StoreError;

#[derive(ZeroizeOnDrop)]
struct VaultKeyMaterial([u8; 32]);

/// Thread-safe vault handle.  Clone to share between the store and the app.
#[derive(Clone, Default)]
pub struct Vault {
    inner: Arc<RwLock<Option<VaultKeyMaterial>>>,
}

impl Vault {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unlock the vault with the given password and salt.
    pub async fn unlock(&self, password: &[u8], salt: &[u8; 16]) -> Result<(), StoreError> {
        let vault_key = vault_key_from_password(password, salt)?;
        *self.inner.write().await = Some(VaultKeyMaterial(vault_key.0));
        Ok(())
    }

    /// Unlock with an existing key (e.g. from the platform keystore).
    pub async fn unlock_with_key(&self, key: [u8; 32]) {
        *self.inner.write().await = Some(VaultKeyMaterial(key));
    }

    /// Lock the vault; zeroizes the key.
    pub async fn lock(&self) {
        *self.inner.write().await = None;
    }

    pub async fn is_locked(&self) -> bool {
        self.inner.read().await.is_none()
    }

    /// Access the raw key for an encrypt/decrypt operation.
    pub async fn with_key<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&[u8; 32]) -> Result<R, StoreError>,
    {
        let guard = self.inner.read().await;
        match guard.as_ref() {
            Some(material) => f(&material.0),
            None => Err(StoreError::VaultLocked),
        }
    }
}

/// Generate a fresh salt for a new store.  Persist it next to the records (not secret).
pub fn new_vault_salt() -> [u8; 16] {
    generate_salt()
}
