//! Encrypted file vault back-end
//!
//! AES-256-GCM over a serialized credential map, key derived from a master
//! password with scrypt (N=16384, r=8, p=1). Authenticated decryption means
//! a wrong password fails cleanly instead of yielding garbage. The file is
//! replaced atomically (temp + rename) on every flush.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, OsRng};
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::domain::credential::Credential;
use crate::infrastructure::vault::{CredentialVault, VaultError};
use crate::utils::SharedClock;

/// On-disk envelope format version.
const VAULT_FILE_VERSION: u32 = 1;
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const KEY_LEN: usize = 32;

/// scrypt cost parameters: N = 2^14 = 16384, r = 8, p = 1.
const SCRYPT_LOG_N: u8 = 14;
const SCRYPT_R: u32 = 8;
const SCRYPT_P: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct KdfParams {
    name: String,
    log_n: u8,
    r: u32,
    p: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            name: "scrypt".to_string(),
            log_n: SCRYPT_LOG_N,
            r: SCRYPT_R,
            p: SCRYPT_P,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct VaultEnvelope {
    version: u32,
    algorithm: String,
    kdf: KdfParams,
    salt: String,
    iv: String,
    auth_tag: String,
    ciphertext: String,
}

#[derive(Debug)]
struct VaultState {
    credentials: HashMap<String, Credential>,
    key: [u8; KEY_LEN],
    salt: [u8; SALT_LEN],
    dirty: bool,
}

/// File-backed vault encrypted with a master password.
#[derive(Debug)]
pub struct EncryptedFileVault {
    path: PathBuf,
    auto_save: bool,
    clock: SharedClock,
    state: RwLock<VaultState>,
}

fn derive_key(password: &str, salt: &[u8], params: &KdfParams) -> Result<[u8; KEY_LEN], VaultError> {
    let scrypt_params = scrypt::Params::new(params.log_n, params.r, params.p, KEY_LEN)
        .map_err(|e| VaultError::Crypto(format!("invalid scrypt parameters: {e}")))?;
    let mut key = [0u8; KEY_LEN];
    scrypt::scrypt(password.as_bytes(), salt, &scrypt_params, &mut key)
        .map_err(|e| VaultError::Crypto(format!("key derivation failed: {e}")))?;
    Ok(key)
}

fn decrypt_envelope(
    envelope: &VaultEnvelope,
    key: &[u8; KEY_LEN],
) -> Result<HashMap<String, Credential>, VaultError> {
    let iv = BASE64
        .decode(&envelope.iv)
        .map_err(|e| VaultError::Crypto(format!("bad iv encoding: {e}")))?;
    let tag = BASE64
        .decode(&envelope.auth_tag)
        .map_err(|e| VaultError::Crypto(format!("bad tag encoding: {e}")))?;
    let mut ciphertext = BASE64
        .decode(&envelope.ciphertext)
        .map_err(|e| VaultError::Crypto(format!("bad ciphertext encoding: {e}")))?;
    if iv.len() != NONCE_LEN || tag.len() != TAG_LEN {
        return Err(VaultError::Crypto("malformed envelope".to_string()));
    }
    ciphertext.extend_from_slice(&tag);

    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| VaultError::Crypto(format!("cipher init failed: {e}")))?;
    let plaintext = cipher
        .decrypt(Nonce::from_slice(&iv), ciphertext.as_ref())
        .map_err(|_| VaultError::Authentication)?;

    Ok(serde_json::from_slice(&plaintext)?)
}

fn encrypt_credentials(
    credentials: &HashMap<String, Credential>,
    key: &[u8; KEY_LEN],
    salt: &[u8; SALT_LEN],
) -> Result<VaultEnvelope, VaultError> {
    let plaintext = serde_json::to_vec(credentials)?;
    let mut iv = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut iv);

    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| VaultError::Crypto(format!("cipher init failed: {e}")))?;
    let mut sealed = cipher
        .encrypt(Nonce::from_slice(&iv), plaintext.as_ref())
        .map_err(|e| VaultError::Crypto(format!("encryption failed: {e}")))?;
    let tag = sealed.split_off(sealed.len() - TAG_LEN);

    Ok(VaultEnvelope {
        version: VAULT_FILE_VERSION,
        algorithm: "aes-256-gcm".to_string(),
        kdf: KdfParams::default(),
        salt: BASE64.encode(salt),
        iv: BASE64.encode(iv),
        auth_tag: BASE64.encode(&tag),
        ciphertext: BASE64.encode(&sealed),
    })
}

fn write_envelope_atomic(path: &Path, envelope: &VaultEnvelope) -> Result<(), VaultError> {
    let payload = serde_json::to_vec_pretty(envelope)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
    {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(&payload)?;
        file.sync_all()?;
    }
    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

impl EncryptedFileVault {
    /// Open an existing vault file or initialize an empty one.
    ///
    /// Key derivation is deliberately slow; it runs on the blocking pool.
    pub async fn open(
        path: impl Into<PathBuf>,
        master_password: &str,
        auto_save: bool,
        clock: SharedClock,
    ) -> Result<Self, VaultError> {
        let path = path.into();
        let password = master_password.to_string();

        let state = if path.exists() {
            let envelope: VaultEnvelope =
                serde_json::from_slice(&std::fs::read(&path)?)?;
            if envelope.version > VAULT_FILE_VERSION {
                return Err(VaultError::Crypto(format!(
                    "vault file version {} is newer than supported {}",
                    envelope.version, VAULT_FILE_VERSION
                )));
            }
            let salt_vec = BASE64
                .decode(&envelope.salt)
                .map_err(|e| VaultError::Crypto(format!("bad salt encoding: {e}")))?;
            let salt: [u8; SALT_LEN] = salt_vec
                .try_into()
                .map_err(|_| VaultError::Crypto("malformed salt".to_string()))?;

            let kdf = KdfParams {
                name: envelope.kdf.name.clone(),
                log_n: envelope.kdf.log_n,
                r: envelope.kdf.r,
                p: envelope.kdf.p,
            };
            let key = tokio::task::spawn_blocking(move || derive_key(&password, &salt, &kdf))
                .await
                .map_err(|join| VaultError::Io(std::io::Error::other(join)))??;
            let credentials = decrypt_envelope(&envelope, &key)?;
            info!(path = %path.display(), count = credentials.len(), "credential vault unlocked");
            VaultState {
                credentials,
                key,
                salt,
                dirty: false,
            }
        } else {
            let mut salt = [0u8; SALT_LEN];
            OsRng.fill_bytes(&mut salt);
            let kdf = KdfParams::default();
            let key = tokio::task::spawn_blocking(move || derive_key(&password, &salt, &kdf))
                .await
                .map_err(|join| VaultError::Io(std::io::Error::other(join)))??;
            debug!(path = %path.display(), "initializing empty credential vault");
            VaultState {
                credentials: HashMap::new(),
                key,
                salt,
                dirty: true,
            }
        };

        let vault = Self {
            path,
            auto_save,
            clock,
            state: RwLock::new(state),
        };
        if vault.auto_save {
            vault.flush().await?;
        }
        Ok(vault)
    }

    /// Persist the current credential set.
    pub async fn flush(&self) -> Result<(), VaultError> {
        let mut state = self.state.write().await;
        let envelope = encrypt_credentials(&state.credentials, &state.key, &state.salt)?;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_envelope_atomic(&path, &envelope))
            .await
            .map_err(|join| VaultError::Io(std::io::Error::other(join)))??;
        state.dirty = false;
        Ok(())
    }

    /// Discard in-memory state and re-read the file with the held key.
    pub async fn reload(&self) -> Result<(), VaultError> {
        let mut state = self.state.write().await;
        let envelope: VaultEnvelope = serde_json::from_slice(&std::fs::read(&self.path)?)?;
        let credentials = decrypt_envelope(&envelope, &state.key)?;
        state.credentials = credentials;
        state.dirty = false;
        Ok(())
    }

    /// Check a password against the vault without exposing the key.
    pub async fn verify_password(&self, password: &str) -> Result<bool, VaultError> {
        let (salt, key) = {
            let state = self.state.read().await;
            (state.salt, state.key)
        };
        let password = password.to_string();
        let candidate =
            tokio::task::spawn_blocking(move || derive_key(&password, &salt, &KdfParams::default()))
                .await
                .map_err(|join| VaultError::Io(std::io::Error::other(join)))??;
        Ok(candidate == key)
    }

    /// Re-encrypt under a new password (fresh salt) and persist immediately.
    pub async fn change_password(&self, new_password: &str) -> Result<(), VaultError> {
        {
            let mut state = self.state.write().await;
            let mut salt = [0u8; SALT_LEN];
            OsRng.fill_bytes(&mut salt);
            let password = new_password.to_string();
            let key =
                tokio::task::spawn_blocking(move || derive_key(&password, &salt, &KdfParams::default()))
                    .await
                    .map_err(|join| VaultError::Io(std::io::Error::other(join)))??;
            state.salt = salt;
            state.key = key;
            state.dirty = true;
        }
        self.flush().await
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn after_mutation(&self) -> Result<(), VaultError> {
        if self.auto_save {
            self.flush().await?;
        }
        Ok(())
    }
}

#[async_trait]
impl CredentialVault for EncryptedFileVault {
    async fn store(&self, credential: Credential) -> Result<(), VaultError> {
        {
            let mut state = self.state.write().await;
            let id = credential.id().to_string();
            if state.credentials.contains_key(&id) {
                return Err(VaultError::AlreadyExists(id));
            }
            state.credentials.insert(id, credential);
            state.dirty = true;
        }
        self.after_mutation().await
    }

    async fn update(&self, credential: Credential) -> Result<(), VaultError> {
        {
            let mut state = self.state.write().await;
            let id = credential.id().to_string();
            if !state.credentials.contains_key(&id) {
                return Err(VaultError::NotFound(id));
            }
            state.credentials.insert(id, credential);
            state.dirty = true;
        }
        self.after_mutation().await
    }

    async fn delete(&self, credential_id: &str) -> Result<bool, VaultError> {
        let removed = {
            let mut state = self.state.write().await;
            let removed = state.credentials.remove(credential_id).is_some();
            if removed {
                state.dirty = true;
            }
            removed
        };
        if removed {
            self.after_mutation().await?;
        }
        Ok(removed)
    }

    async fn get(&self, credential_id: &str) -> Result<Option<Credential>, VaultError> {
        Ok(self.state.read().await.credentials.get(credential_id).cloned())
    }

    async fn list(&self) -> Result<Vec<Credential>, VaultError> {
        let mut all: Vec<Credential> = self
            .state
            .read()
            .await
            .credentials
            .values()
            .cloned()
            .collect();
        all.sort_by(|a, b| a.base().created_at.cmp(&b.base().created_at).then_with(|| a.id().cmp(b.id())));
        Ok(all)
    }

    async fn get_active_by_surface(&self, surface_id: &str) -> Result<Vec<Credential>, VaultError> {
        let now = self.clock.now();
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|c| c.surface_id() == surface_id && c.is_active_at(now))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::system_clock;
    use chrono::Utc;

    #[tokio::test]
    async fn round_trip_store_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vault.json");

        let credential = Credential::api_key("openai-api", "sk-secret", Utc::now());
        let id = credential.id().to_string();
        {
            let vault = EncryptedFileVault::open(&path, "correct horse", true, system_clock())
                .await
                .unwrap();
            vault.store(credential).await.unwrap();
        }

        let reopened = EncryptedFileVault::open(&path, "correct horse", true, system_clock())
            .await
            .unwrap();
        let fetched = reopened.get(&id).await.unwrap().unwrap();
        assert_eq!(fetched.surface_id(), "openai-api");
    }

    #[tokio::test]
    async fn wrong_password_fails_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vault.json");
        {
            let vault = EncryptedFileVault::open(&path, "right", true, system_clock())
                .await
                .unwrap();
            vault
                .store(Credential::api_key("s", "k", Utc::now()))
                .await
                .unwrap();
        }

        let err = EncryptedFileVault::open(&path, "wrong", true, system_clock())
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::Authentication));
    }

    #[tokio::test]
    async fn ciphertext_never_contains_plaintext_secret() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vault.json");
        let vault = EncryptedFileVault::open(&path, "pw", true, system_clock())
            .await
            .unwrap();
        vault
            .store(Credential::api_key("openai-api", "sk-very-secret-value", Utc::now()))
            .await
            .unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(!raw.contains("sk-very-secret-value"));
        assert!(raw.contains("aes-256-gcm"));
        assert!(raw.contains("scrypt"));
    }

    #[tokio::test]
    async fn verify_and_change_password() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vault.json");
        let vault = EncryptedFileVault::open(&path, "first", true, system_clock())
            .await
            .unwrap();
        vault
            .store(Credential::api_key("s", "k", Utc::now()))
            .await
            .unwrap();

        assert!(vault.verify_password("first").await.unwrap());
        assert!(!vault.verify_password("second").await.unwrap());

        vault.change_password("second").await.unwrap();
        assert!(vault.verify_password("second").await.unwrap());

        // Old password no longer opens the file.
        drop(vault);
        assert!(matches!(
            EncryptedFileVault::open(&path, "first", true, system_clock()).await,
            Err(VaultError::Authentication)
        ));
        let reopened = EncryptedFileVault::open(&path, "second", true, system_clock())
            .await
            .unwrap();
        assert_eq!(reopened.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn manual_save_mode_defers_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vault.json");
        let vault = EncryptedFileVault::open(&path, "pw", false, system_clock())
            .await
            .unwrap();
        vault
            .store(Credential::api_key("s", "k", Utc::now()))
            .await
            .unwrap();
        assert!(!path.exists());

        vault.flush().await.unwrap();
        assert!(path.exists());
    }
}
