//! Pluggable token persistence.
//!
//! Three tiers: the OS keychain, an encrypted file under
//! `$HOME/.config/httpcraft/tokens/`, and process memory. Selection honors
//! an explicit `tokenStorage` hint, otherwise the first available tier
//! wins. Read and write failures fall through silently — a broken store
//! behaves like an empty one.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use aes::cipher::{block_padding::Pkcs7, BlockModeDecrypt, BlockModeEncrypt, KeyIvInit};
use async_trait::async_trait;
use rand::RngCore;
use scrypt::Params;
use serde::{Deserialize, Serialize};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Keychain service name under which tokens are filed.
const KEYCHAIN_SERVICE: &str = "httpcraft-oauth2";

/// Fixed inputs for the file-store key derivation. The encryption protects
/// tokens at rest from casual reads, not from an attacker with the binary.
const KEY_LABEL: &[u8] = b"httpcraft-token-store";
const KEY_SALT: &[u8] = b"httpcraft-token-salt";

/// A stored token with its expiry (safety margin already applied).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRecord {
    pub access_token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    /// Unix milliseconds after which the token is considered expired
    pub expires_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audience: Option<String>,
}

impl TokenRecord {
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.expires_at
    }
}

#[async_trait]
pub trait TokenStore: Send + Sync {
    fn kind(&self) -> &'static str;
    async fn get(&self, key: &str) -> Option<TokenRecord>;
    async fn set(&self, key: &str, record: &TokenRecord);
    async fn delete(&self, key: &str);
}

/// OS keychain tier, backed by the platform credential service.
pub struct KeychainTokenStore;

impl KeychainTokenStore {
    /// Probe the platform service with a throwaway entry.
    pub fn available() -> bool {
        let Ok(entry) = keyring::Entry::new(KEYCHAIN_SERVICE, "availability-probe") else {
            return false;
        };
        if entry.set_password("probe").is_err() {
            return false;
        }
        let _ = entry.delete_password();
        true
    }
}

#[async_trait]
impl TokenStore for KeychainTokenStore {
    fn kind(&self) -> &'static str {
        "keychain"
    }

    async fn get(&self, key: &str) -> Option<TokenRecord> {
        let entry = keyring::Entry::new(KEYCHAIN_SERVICE, key).ok()?;
        let payload = entry.get_password().ok()?;
        serde_json::from_str(&payload).ok()
    }

    async fn set(&self, key: &str, record: &TokenRecord) {
        let Ok(entry) = keyring::Entry::new(KEYCHAIN_SERVICE, key) else {
            return;
        };
        let Ok(payload) = serde_json::to_string(record) else {
            return;
        };
        if let Err(e) = entry.set_password(&payload) {
            log::debug!("keychain write failed: {e}");
        }
    }

    async fn delete(&self, key: &str) {
        if let Ok(entry) = keyring::Entry::new(KEYCHAIN_SERVICE, key) {
            let _ = entry.delete_password();
        }
    }
}

/// Encrypted-file tier: one file per cache key, AES-256-CBC with an
/// scrypt-derived key, serialized as `hex(iv):hex(ciphertext)`.
pub struct FileTokenStore {
    dir: PathBuf,
}

impl FileTokenStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn default_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".config")
            .join("httpcraft")
            .join("tokens")
    }

    fn derive_key() -> Option<[u8; 32]> {
        let params = Params::new(14, 8, 1, 32).ok()?;
        let mut key = [0u8; 32];
        scrypt::scrypt(KEY_LABEL, KEY_SALT, &params, &mut key).ok()?;
        Some(key)
    }

    fn file_path(&self, key: &str) -> PathBuf {
        let safe: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{safe}.json"))
    }

    fn encrypt(plaintext: &[u8]) -> Option<String> {
        let key = Self::derive_key()?;
        let mut iv = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut iv);
        let cipher = Aes256CbcEnc::new_from_slices(&key, &iv).ok()?;
        let ciphertext = cipher.encrypt_padded_vec::<Pkcs7>(plaintext);
        Some(format!("{}:{}", hex::encode(iv), hex::encode(ciphertext)))
    }

    fn decrypt(payload: &str) -> Option<Vec<u8>> {
        let (iv_hex, ct_hex) = payload.trim().split_once(':')?;
        let iv = hex::decode(iv_hex).ok()?;
        let ciphertext = hex::decode(ct_hex).ok()?;
        let key = Self::derive_key()?;
        let cipher = Aes256CbcDec::new_from_slices(&key, &iv).ok()?;
        cipher.decrypt_padded_vec::<Pkcs7>(&ciphertext).ok()
    }

    #[cfg(unix)]
    fn restrict_permissions(path: &std::path::Path, mode: u32) {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode));
    }

    #[cfg(not(unix))]
    fn restrict_permissions(_path: &std::path::Path, _mode: u32) {}
}

#[async_trait]
impl TokenStore for FileTokenStore {
    fn kind(&self) -> &'static str {
        "file"
    }

    async fn get(&self, key: &str) -> Option<TokenRecord> {
        let payload = tokio::fs::read_to_string(self.file_path(key)).await.ok()?;
        let plaintext = Self::decrypt(&payload)?;
        serde_json::from_slice(&plaintext).ok()
    }

    async fn set(&self, key: &str, record: &TokenRecord) {
        let Ok(plaintext) = serde_json::to_vec(record) else {
            return;
        };
        let Some(payload) = Self::encrypt(&plaintext) else {
            return;
        };
        if tokio::fs::create_dir_all(&self.dir).await.is_err() {
            return;
        }
        Self::restrict_permissions(&self.dir, 0o700);
        let path = self.file_path(key);
        if let Err(e) = tokio::fs::write(&path, payload).await {
            log::debug!("token file write failed: {e}");
            return;
        }
        Self::restrict_permissions(&path, 0o600);
    }

    async fn delete(&self, key: &str) {
        let _ = tokio::fs::remove_file(self.file_path(key)).await;
    }
}

/// Always-available in-memory tier.
#[derive(Default)]
pub struct MemoryTokenStore {
    tokens: Mutex<HashMap<String, TokenRecord>>,
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Option<TokenRecord> {
        self.tokens.lock().unwrap().get(key).cloned()
    }

    async fn set(&self, key: &str, record: &TokenRecord) {
        self.tokens
            .lock()
            .unwrap()
            .insert(key.to_string(), record.clone());
    }

    async fn delete(&self, key: &str) {
        self.tokens.lock().unwrap().remove(key);
    }
}

/// Pick a store: explicit hint first, else keychain → file → memory.
pub fn select_store(hint: Option<&str>) -> Box<dyn TokenStore> {
    match hint {
        Some("keychain") => return Box::new(KeychainTokenStore),
        Some("file") => return Box::new(FileTokenStore::new(FileTokenStore::default_dir())),
        Some("memory") => return Box::new(MemoryTokenStore::default()),
        Some(other) => {
            log::warn!("unknown tokenStorage '{other}'; falling back to auto-selection");
        }
        None => {}
    }

    if KeychainTokenStore::available() {
        Box::new(KeychainTokenStore)
    } else if std::fs::create_dir_all(FileTokenStore::default_dir()).is_ok() {
        Box::new(FileTokenStore::new(FileTokenStore::default_dir()))
    } else {
        Box::new(MemoryTokenStore::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(access: &str) -> TokenRecord {
        TokenRecord {
            access_token: access.to_string(),
            refresh_token: Some("refresh-1".to_string()),
            id_token: None,
            expires_at: 2_000_000_000_000,
            token_type: Some("Bearer".to_string()),
            scope: Some("read".to_string()),
            audience: None,
        }
    }

    #[test]
    fn encryption_roundtrip_preserves_payload() {
        let payload = br#"{"accessToken":"secret-token"}"#;
        let encrypted = FileTokenStore::encrypt(payload).unwrap();
        // hex(iv):hex(ciphertext), never the plaintext
        let (iv_hex, ct_hex) = encrypted.split_once(':').unwrap();
        assert_eq!(iv_hex.len(), 32);
        assert!(ct_hex.len() % 32 == 0);
        assert!(!encrypted.contains("secret-token"));

        let decrypted = FileTokenStore::decrypt(&encrypted).unwrap();
        assert_eq!(decrypted, payload);
    }

    #[test]
    fn decrypt_rejects_garbage() {
        assert!(FileTokenStore::decrypt("no-separator").is_none());
        assert!(FileTokenStore::decrypt("abcd:not-hex!").is_none());
        assert!(FileTokenStore::decrypt("00112233445566778899aabbccddeeff:00").is_none());
    }

    #[tokio::test]
    async fn file_store_roundtrip_and_delete() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileTokenStore::new(tmp.path().join("tokens"));

        store.set("abc123", &record("tok-1")).await;
        let loaded = store.get("abc123").await.unwrap();
        assert_eq!(loaded.access_token, "tok-1");
        assert_eq!(loaded.refresh_token.as_deref(), Some("refresh-1"));

        // The on-disk payload is opaque.
        let raw = std::fs::read_to_string(tmp.path().join("tokens/abc123.json")).unwrap();
        assert!(!raw.contains("tok-1"));
        assert!(raw.contains(':'));

        store.delete("abc123").await;
        assert!(store.get("abc123").await.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn token_files_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let tmp = tempfile::tempdir().unwrap();
        let store = FileTokenStore::new(tmp.path().join("tokens"));
        store.set("perm-check", &record("t")).await;

        let dir_mode = std::fs::metadata(tmp.path().join("tokens"))
            .unwrap()
            .permissions()
            .mode();
        let file_mode = std::fs::metadata(tmp.path().join("tokens/perm-check.json"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(dir_mode & 0o777, 0o700);
        assert_eq!(file_mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn memory_store_roundtrip() {
        let store = MemoryTokenStore::default();
        assert!(store.get("k").await.is_none());
        store.set("k", &record("t")).await;
        assert_eq!(store.get("k").await.unwrap().access_token, "t");
        store.delete("k").await;
        assert!(store.get("k").await.is_none());
    }

    #[test]
    fn expiry_check_uses_stored_deadline() {
        let mut r = record("t");
        r.expires_at = 1_000;
        assert!(r.is_expired(1_000));
        assert!(r.is_expired(5_000));
        assert!(!r.is_expired(999));
    }
}
