use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use ed25519_dalek::{Signer, SigningKey};
use rand::{rngs::OsRng, Rng, RngCore};
use serde::{Deserialize, Serialize};
use shared::domain::TenantId;
use storage::{now_ms, Storage};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};
use x25519_dalek::{x25519, X25519_BASEPOINT_BYTES};
use zeroize::Zeroize;

use crate::cipher::{Cipher, CipherError};

mod b64 {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPair {
    #[serde(with = "b64")]
    pub public: Vec<u8>,
    #[serde(with = "b64")]
    pub private: Vec<u8>,
}

impl KeyPair {
    pub fn generate() -> Self {
        let mut private = [0u8; 32];
        OsRng.fill_bytes(&mut private);
        let public = x25519(private, X25519_BASEPOINT_BYTES);
        let pair = Self {
            public: public.to_vec(),
            private: private.to_vec(),
        };
        private.zeroize();
        pair
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_len", &self.public.len())
            .finish_non_exhaustive()
    }
}

impl Drop for KeyPair {
    fn drop(&mut self) {
        self.private.zeroize();
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedPreKey {
    pub key_id: u32,
    pub key_pair: KeyPair,
    #[serde(with = "b64")]
    pub signature: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountIdentity {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Identity material the messaging network needs to resume a paired session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub noise_key: KeyPair,
    pub signed_identity_key: KeyPair,
    pub signed_pre_key: SignedPreKey,
    pub registration_id: u16,
    #[serde(with = "b64")]
    pub adv_secret_key: Vec<u8>,
    pub next_pre_key_id: u32,
    pub first_unuploaded_pre_key_id: u32,
    #[serde(default)]
    pub server_has_pre_keys: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub me: Option<AccountIdentity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
}

impl Credentials {
    pub fn generate() -> Self {
        let noise_key = KeyPair::generate();
        let signed_identity_key = KeyPair::generate();
        let pre_key = KeyPair::generate();

        let mut identity_secret = [0u8; 32];
        identity_secret.copy_from_slice(&signed_identity_key.private);
        let signing_key = SigningKey::from_bytes(&identity_secret);
        identity_secret.zeroize();
        let signature = signing_key.sign(&pre_key.public).to_bytes().to_vec();

        let mut adv_secret_key = vec![0u8; 32];
        OsRng.fill_bytes(&mut adv_secret_key);

        Self {
            noise_key,
            signed_identity_key,
            signed_pre_key: SignedPreKey {
                key_id: 1,
                key_pair: pre_key,
                signature,
            },
            registration_id: OsRng.gen::<u16>() & 0x3fff,
            adv_secret_key,
            next_pre_key_id: 1,
            first_unuploaded_pre_key_id: 1,
            server_has_pre_keys: false,
            me: None,
            platform: None,
        }
    }

    pub fn is_paired(&self) -> bool {
        self.me.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeyCategory {
    PreKey,
    Session,
    SenderKey,
    SenderKeyMemory,
    AppStateSyncKey,
    AppStateSyncVersion,
}

impl KeyCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PreKey => "pre-key",
            Self::Session => "session",
            Self::SenderKey => "sender-key",
            Self::SenderKeyMemory => "sender-key-memory",
            Self::AppStateSyncKey => "app-state-sync-key",
            Self::AppStateSyncVersion => "app-state-sync-version",
        }
    }

    fn storage_key(self, id: &str) -> String {
        format!("{}-{id}", self.as_str())
    }
}

/// Category -> id -> new value; `None` deletes the entry.
pub type KeyUpdate = HashMap<KeyCategory, HashMap<String, Option<Vec<u8>>>>;

/// Flat `"{category}-{id}"` map of protocol key material.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyStore {
    entries: BTreeMap<String, KeyEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
struct KeyEntry(#[serde(with = "b64")] Vec<u8>);

impl KeyStore {
    pub fn get(&self, category: KeyCategory, ids: &[&str]) -> HashMap<String, Vec<u8>> {
        ids.iter()
            .filter_map(|id| {
                self.entries
                    .get(&category.storage_key(id))
                    .map(|entry| ((*id).to_string(), entry.0.clone()))
            })
            .collect()
    }

    pub fn apply(&mut self, update: KeyUpdate) {
        for (category, values) in update {
            for (id, value) in values {
                let key = category.storage_key(&id);
                match value {
                    Some(bytes) => {
                        self.entries.insert(key, KeyEntry(bytes));
                    }
                    None => {
                        self.entries.remove(&key);
                    }
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("credential blob could not be decrypted: {0}")]
    Decrypt(#[from] CipherError),
    #[error("credential blob could not be parsed: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Encrypted per-tenant credential persistence in the shared store.
#[derive(Clone)]
pub struct CredentialStore {
    storage: Storage,
    cipher: Arc<dyn Cipher>,
    ttl: Duration,
}

impl CredentialStore {
    pub fn new(storage: Storage, cipher: Arc<dyn Cipher>, ttl: Duration) -> Self {
        Self {
            storage,
            cipher,
            ttl,
        }
    }

    /// Loads stored credentials, or a fresh identity when nothing usable is
    /// stored. Only backing-store failures are returned as errors.
    pub async fn load(&self, tenant_id: &TenantId) -> Result<(Credentials, KeyStore)> {
        let Some(blobs) = self
            .storage
            .load_credential_blobs(tenant_id, now_ms())
            .await?
        else {
            info!(tenant_id = %tenant_id, "credentials: none stored, generating fresh identity");
            return Ok((Credentials::generate(), KeyStore::default()));
        };

        let cipher = Arc::clone(&self.cipher);
        let decoded = tokio::task::spawn_blocking(move || decode(&*cipher, &blobs.creds, &blobs.keys))
            .await
            .context("credential decode task failed")?;
        match decoded {
            Ok(loaded) => {
                debug!(
                    tenant_id = %tenant_id,
                    keys = loaded.1.len(),
                    "credentials: loaded stored identity"
                );
                Ok(loaded)
            }
            Err(err) => {
                warn!(
                    tenant_id = %tenant_id,
                    error = %err,
                    "credentials: stored blob unusable, generating fresh identity"
                );
                Ok((Credentials::generate(), KeyStore::default()))
            }
        }
    }

    pub async fn save(
        &self,
        tenant_id: &TenantId,
        creds: &Credentials,
        keys: &KeyStore,
    ) -> Result<()> {
        let creds_json = serde_json::to_vec(creds)?;
        let keys_json = serde_json::to_vec(keys)?;
        let cipher = Arc::clone(&self.cipher);
        let (creds_blob, keys_blob) = tokio::task::spawn_blocking(move || -> Result<_> {
            let creds_blob = cipher
                .seal(&creds_json)
                .context("failed to seal credentials")?;
            let keys_blob = cipher.seal(&keys_json).context("failed to seal key store")?;
            Ok((creds_blob, keys_blob))
        })
        .await
        .context("credential sealing task failed")??;
        let now = now_ms();
        let ttl_ms = i64::try_from(self.ttl.as_millis()).unwrap_or(i64::MAX);
        self.storage
            .save_credential_blobs(
                tenant_id,
                &creds_blob,
                &keys_blob,
                now.saturating_add(ttl_ms),
                now,
            )
            .await
    }

    pub async fn clear(&self, tenant_id: &TenantId) -> Result<u64> {
        let removed = self.storage.clear_credential_blobs(tenant_id).await?;
        info!(tenant_id = %tenant_id, removed, "credentials: cleared stored identity");
        Ok(removed)
    }

    pub async fn load_auth_state(&self, tenant_id: &TenantId) -> Result<Arc<AuthState>> {
        let (creds, keys) = self.load(tenant_id).await?;
        Ok(Arc::new(AuthState::new(
            tenant_id.clone(),
            creds,
            keys,
            self.clone(),
        )))
    }
}

/// PBKDF2 dominates the cost of opening a blob, so callers run this on the
/// blocking pool.
fn decode(
    cipher: &dyn Cipher,
    creds_blob: &[u8],
    keys_blob: &[u8],
) -> Result<(Credentials, KeyStore), CredentialError> {
    let creds = serde_json::from_slice(&cipher.open(creds_blob)?)?;
    let keys = serde_json::from_slice(&cipher.open(keys_blob)?)?;
    Ok((creds, keys))
}

/// In-memory credentials and key store for one tenant, mirrored to the
/// shared store on every change.
pub struct AuthState {
    tenant_id: TenantId,
    creds: RwLock<Credentials>,
    keys: RwLock<KeyStore>,
    store: CredentialStore,
    save_lock: Mutex<()>,
}

impl AuthState {
    pub fn new(
        tenant_id: TenantId,
        creds: Credentials,
        keys: KeyStore,
        store: CredentialStore,
    ) -> Self {
        Self {
            tenant_id,
            creds: RwLock::new(creds),
            keys: RwLock::new(keys),
            store,
            save_lock: Mutex::new(()),
        }
    }

    pub fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }

    pub async fn credentials(&self) -> Credentials {
        self.creds.read().await.clone()
    }

    pub async fn get_keys(&self, category: KeyCategory, ids: &[&str]) -> HashMap<String, Vec<u8>> {
        self.keys.read().await.get(category, ids)
    }

    /// Merges `update` and persists in the background; save failures are
    /// logged only.
    pub async fn set_keys(self: &Arc<Self>, update: KeyUpdate) {
        self.keys.write().await.apply(update);
        let auth = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = auth.persist().await {
                error!(
                    tenant_id = %auth.tenant_id,
                    error = %err,
                    "credentials: background key store save failed"
                );
            }
        });
    }

    /// Replaces the credentials and writes both blobs before returning.
    pub async fn replace_credentials(&self, creds: Credentials) -> Result<()> {
        *self.creds.write().await = creds;
        self.persist().await
    }

    pub async fn persist(&self) -> Result<()> {
        let _guard = self.save_lock.lock().await;
        let creds = self.creds.read().await.clone();
        let keys = self.keys.read().await.clone();
        self.store.save(&self.tenant_id, &creds, &keys).await
    }
}

#[cfg(test)]
#[path = "tests/credentials_tests.rs"]
mod tests;
