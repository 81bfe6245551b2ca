//! Identity and peer key store.
//!
//! The local identity is an Ed25519 key pair; peers are known by their
//! session id, which embeds their X25519 public key. Shared keys are derived
//! on first use and cached per peer.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::broadcast;

use pc_crypto::{
    aead,
    agreement::{self, StaticSecret},
    hash, IdentityKeyPair, SessionId, SharedKey, X25519Public,
};

use crate::error::KeyError;

/// Canonical form of a peer id as the key store and conversations index it.
/// Ids that do not parse as session ids are returned unchanged.
pub fn normalize_peer_id(peer_id: &str) -> String {
    SessionId::parse(peer_id).map_or_else(|_| peer_id.to_owned(), |sid| sid.as_str().to_owned())
}

#[async_trait]
pub trait KeyStore: Send + Sync {
    fn current_session_id(&self) -> &SessionId;

    /// Long-term identity, used to sign receipts.
    fn identity(&self) -> &IdentityKeyPair;

    /// A miss may trigger an out-of-band key-exchange request.
    async fn public_key_of(&self, peer_id: &str) -> Result<X25519Public, KeyError>;

    async fn shared_key(&self, peer_id: &str) -> Result<SharedKey, KeyError>;

    /// Seal `plaintext` for `peer_id`. `KeyError::NotFound` means: keep it
    /// local, do not transmit.
    async fn seal_for(&self, peer_id: &str, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, KeyError> {
        let key = self.shared_key(peer_id).await?;
        Ok(aead::encrypt(key.as_bytes(), plaintext, aad)?)
    }
}

pub struct LocalKeyStore {
    identity: IdentityKeyPair,
    x25519_secret: StaticSecret,
    session_id: SessionId,
    contacts: RwLock<HashMap<String, X25519Public>>,
    shared: RwLock<HashMap<String, SharedKey>>,
    requested: RwLock<HashSet<String>>,
    key_requests: broadcast::Sender<String>,
}

impl LocalKeyStore {
    pub fn new(identity: IdentityKeyPair) -> Result<Self, KeyError> {
        let session_id = identity.session_id()?;
        let (key_requests, _) = broadcast::channel(32);
        Ok(Self {
            x25519_secret: identity.x25519_secret(),
            identity,
            session_id,
            contacts: RwLock::new(HashMap::new()),
            shared: RwLock::new(HashMap::new()),
            requested: RwLock::new(HashSet::new()),
            key_requests,
        })
    }

    /// Register a peer from its session id (what a QR scan hands over).
    pub fn add_contact(&self, session_id: &str) -> Result<SessionId, KeyError> {
        let sid = SessionId::parse(session_id)
            .map_err(|e| KeyError::InvalidSessionId(e.to_string()))?;
        let public = sid.x25519_public()?;
        self.contacts.write().insert(sid.to_string(), public);
        self.shared.write().remove(sid.as_str());
        self.requested.write().remove(sid.as_str());
        tracing::info!(target: "pc_client", event = "contact_added", peer_id = %sid);
        Ok(sid)
    }

    pub fn remove_contact(&self, peer_id: &str) {
        let peer_id: &str = &normalize_peer_id(peer_id);
        self.contacts.write().remove(peer_id);
        self.shared.write().remove(peer_id);
    }

    pub fn has_contact(&self, peer_id: &str) -> bool {
        let peer_id: &str = &normalize_peer_id(peer_id);
        self.contacts.read().contains_key(peer_id)
    }

    pub fn fingerprint(&self) -> String {
        self.session_id.fingerprint()
    }

    /// Peer ids for which a key exchange is needed. One request per peer
    /// until its key is added.
    pub fn subscribe_key_requests(&self) -> broadcast::Receiver<String> {
        self.key_requests.subscribe()
    }

    fn request_key(&self, peer_id: &str) {
        if self.requested.write().insert(peer_id.to_owned()) {
            tracing::info!(target: "pc_client", event = "key_exchange_requested", peer_id = %peer_id);
            let _ = self.key_requests.send(peer_id.to_owned());
        }
    }
}

#[async_trait]
impl KeyStore for LocalKeyStore {
    fn current_session_id(&self) -> &SessionId {
        &self.session_id
    }

    fn identity(&self) -> &IdentityKeyPair {
        &self.identity
    }

    async fn public_key_of(&self, peer_id: &str) -> Result<X25519Public, KeyError> {
        let peer_id: &str = &normalize_peer_id(peer_id);
        let found = self.contacts.read().get(peer_id).copied();
        match found {
            Some(public) => Ok(public),
            None => {
                self.request_key(peer_id);
                Err(KeyError::NotFound(peer_id.to_owned()))
            }
        }
    }

    async fn shared_key(&self, peer_id: &str) -> Result<SharedKey, KeyError> {
        let peer_id: &str = &normalize_peer_id(peer_id);
        let cached = self.shared.read().get(peer_id).cloned();
        if let Some(key) = cached {
            return Ok(key);
        }
        let public = self.public_key_of(peer_id).await?;
        let conversation_id = hash::conversation_id(self.session_id.as_str(), peer_id);
        let key = agreement::derive_shared_key(&self.x25519_secret, &public, &conversation_id)?;
        self.shared.write().insert(peer_id.to_owned(), key.clone());
        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (LocalKeyStore, LocalKeyStore) {
        let a = LocalKeyStore::new(IdentityKeyPair::generate()).unwrap();
        let b = LocalKeyStore::new(IdentityKeyPair::generate()).unwrap();
        a.add_contact(b.current_session_id().as_str()).unwrap();
        b.add_contact(a.current_session_id().as_str()).unwrap();
        (a, b)
    }

    #[tokio::test]
    async fn both_sides_agree_on_the_shared_key() {
        let (a, b) = pair();
        let ka = a.shared_key(b.current_session_id().as_str()).await.unwrap();
        let kb = b.shared_key(a.current_session_id().as_str()).await.unwrap();
        assert_eq!(ka.as_bytes(), kb.as_bytes());
    }

    #[tokio::test]
    async fn sealed_blob_opens_on_the_other_side() {
        let (a, b) = pair();
        let blob = a
            .seal_for(b.current_session_id().as_str(), b"hi", b"aad")
            .await
            .unwrap();
        let key = b.shared_key(a.current_session_id().as_str()).await.unwrap();
        let opened = aead::decrypt(key.as_bytes(), &blob, b"aad").unwrap();
        assert_eq!(opened.as_slice(), b"hi");
    }

    #[tokio::test]
    async fn mixed_case_peer_id_finds_the_same_key() {
        let (a, b) = pair();
        let peer = b.current_session_id().to_string();
        let shouted = peer.to_ascii_uppercase();
        assert!(a.has_contact(&shouted));
        let lower = a.shared_key(&peer).await.unwrap();
        let upper = a.shared_key(&shouted).await.unwrap();
        assert_eq!(lower.as_bytes(), upper.as_bytes());
    }

    #[tokio::test]
    async fn removed_contact_has_no_key() {
        let (a, b) = pair();
        let peer = b.current_session_id().to_string();
        assert!(a.has_contact(&peer));
        a.remove_contact(&peer);
        assert!(!a.has_contact(&peer));
        assert!(matches!(a.public_key_of(&peer).await, Err(KeyError::NotFound(_))));
    }

    #[tokio::test]
    async fn unknown_peer_requests_key_exchange_once() {
        let store = LocalKeyStore::new(IdentityKeyPair::generate()).unwrap();
        let mut requests = store.subscribe_key_requests();
        let stranger = LocalKeyStore::new(IdentityKeyPair::generate()).unwrap();
        let peer = stranger.current_session_id().to_string();

        assert!(matches!(store.public_key_of(&peer).await, Err(KeyError::NotFound(_))));
        assert!(matches!(store.seal_for(&peer, b"x", b"").await, Err(KeyError::NotFound(_))));
        assert_eq!(requests.recv().await.unwrap(), peer);
        assert!(requests.try_recv().is_err());

        store.add_contact(&peer).unwrap();
        assert!(store.public_key_of(&peer).await.is_ok());
    }

    #[test]
    fn invalid_session_id_is_rejected() {
        let store = LocalKeyStore::new(IdentityKeyPair::generate()).unwrap();
        assert!(matches!(store.add_contact("not-a-session"), Err(KeyError::InvalidSessionId(_))));
    }
}
