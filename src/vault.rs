//! vault.rs - 机器绑定的凭据加密
//!
//! 密钥从机器指纹经 PBKDF2-SHA256 派生, 密文用 AES-256-GCM 封装, nonce 前置。
//! 解密前先比对配置里的 machine_hash 和本机指纹标签, 对不上直接拒绝,
//! 不做任何密钥派生。

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine as _;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::warn;
use zeroize::Zeroize;

use crate::config::SplunkConfig;
use crate::error::{Result, SplunkMcpError};
use crate::machine::MachineIdentity;

const PBKDF2_ROUNDS: u32 = 100_000;
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;

/// What lands in the YAML config after provisioning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedSecret {
    pub password_encrypted: String,
    pub password_salt: String,
    pub machine_hash: String,
}

pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Drop for Credentials {
    fn drop(&mut self) {
        self.password.zeroize();
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

pub struct CredentialVault {
    identity: MachineIdentity,
}

impl CredentialVault {
    pub fn new() -> Self {
        Self { identity: MachineIdentity::current() }
    }

    pub fn with_identity(identity: MachineIdentity) -> Self {
        Self { identity }
    }

    pub fn identity(&self) -> &MachineIdentity {
        &self.identity
    }

    pub fn encrypt(&self, secret: &str) -> Result<EncryptedSecret> {
        let mut salt = [0u8; SALT_LEN];
        rand::thread_rng().fill_bytes(&mut salt);
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);

        let mut key = self.derive_key(&salt);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
        let sealed = cipher.encrypt(Nonce::from_slice(&nonce_bytes), secret.as_bytes());
        key.zeroize();
        let sealed = sealed.map_err(|_| SplunkMcpError::Internal("AEAD seal failed".into()))?;

        // 密文布局: nonce(12) || ciphertext+tag, 整体 url-safe base64。
        let mut blob = Vec::with_capacity(NONCE_LEN + sealed.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&sealed);

        Ok(EncryptedSecret {
            password_encrypted: URL_SAFE.encode(&blob),
            password_salt: URL_SAFE.encode(salt),
            machine_hash: self.identity.tag().to_string(),
        })
    }

    pub fn decrypt(&self, secret: &EncryptedSecret) -> Result<String> {
        if secret.machine_hash != self.identity.tag() {
            return Err(SplunkMcpError::MachineMismatch(
                "stored machine_hash does not match this machine, re-run encrypt_password here"
                    .into(),
            ));
        }

        let salt = URL_SAFE
            .decode(&secret.password_salt)
            .map_err(|e| SplunkMcpError::DecryptFailed(format!("bad salt encoding: {e}")))?;
        let blob = URL_SAFE
            .decode(&secret.password_encrypted)
            .map_err(|e| SplunkMcpError::DecryptFailed(format!("bad ciphertext encoding: {e}")))?;
        if blob.len() <= NONCE_LEN {
            return Err(SplunkMcpError::DecryptFailed("ciphertext too short".into()));
        }
        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);

        let mut key = self.derive_key(&salt);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
        let opened = cipher.decrypt(Nonce::from_slice(nonce_bytes), ciphertext);
        key.zeroize();
        let opened = opened
            .map_err(|_| SplunkMcpError::DecryptFailed("authentication tag mismatch".into()))?;

        String::from_utf8(opened)
            .map_err(|e| SplunkMcpError::DecryptFailed(format!("plaintext is not UTF-8: {e}")))
    }

    /// Resolve the password for the configured account. The encrypted triple
    /// always wins over a plaintext `password`; plaintext still works but
    /// logs a warning every time it is used.
    pub fn get_credentials(&self, splunk: &SplunkConfig) -> Result<Credentials> {
        let username = splunk.username.clone();

        if let Some(encrypted) = &splunk.password_encrypted {
            let salt = splunk.password_salt.as_ref().ok_or_else(|| {
                SplunkMcpError::ConfigInvalid(
                    "splunk.password_encrypted requires splunk.password_salt".into(),
                )
            })?;
            let machine_hash = splunk.machine_hash.as_ref().ok_or_else(|| {
                SplunkMcpError::ConfigInvalid(
                    "splunk.password_encrypted requires splunk.machine_hash".into(),
                )
            })?;
            let password = self.decrypt(&EncryptedSecret {
                password_encrypted: encrypted.clone(),
                password_salt: salt.clone(),
                machine_hash: machine_hash.clone(),
            })?;
            return Ok(Credentials { username, password });
        }

        if let Some(password) = &splunk.password {
            warn!("splunk.password is stored in plaintext, run encrypt_password to protect it");
            return Ok(Credentials { username, password: password.clone() });
        }

        Err(SplunkMcpError::ConfigMissing(
            "neither splunk.password nor splunk.password_encrypted is set".into(),
        ))
    }

    fn derive_key(&self, salt: &[u8]) -> [u8; 32] {
        let mut key = [0u8; 32];
        pbkdf2::pbkdf2_hmac::<Sha256>(
            self.identity.digest().as_bytes(),
            salt,
            PBKDF2_ROUNDS,
            &mut key,
        );
        key
    }
}

impl Default for CredentialVault {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_vault(seed: char) -> CredentialVault {
        CredentialVault::with_identity(MachineIdentity::from_digest(seed.to_string().repeat(64)))
    }

    fn bare_config() -> SplunkConfig {
        SplunkConfig {
            host: "splunk.example.com".to_string(),
            port: 8089,
            username: "svc_search".to_string(),
            scheme: "https".to_string(),
            password: None,
            password_encrypted: None,
            password_salt: None,
            machine_hash: None,
            timeout: 30,
            verify_ssl: false,
            retry_count: 3,
            retry_backoff_ms: 1000,
        }
    }

    #[test]
    fn roundtrip_recovers_secret() {
        let vault = test_vault('a');
        let sealed = vault.encrypt("s3cret!пароль密码").unwrap();
        assert_eq!(sealed.machine_hash.len(), crate::machine::IDENTITY_TAG_LEN);
        assert_eq!(vault.decrypt(&sealed).unwrap(), "s3cret!пароль密码");
    }

    #[test]
    fn each_encryption_uses_fresh_salt_and_nonce() {
        let vault = test_vault('a');
        let first = vault.encrypt("same secret").unwrap();
        let second = vault.encrypt("same secret").unwrap();
        assert_ne!(first.password_salt, second.password_salt);
        assert_ne!(first.password_encrypted, second.password_encrypted);
    }

    #[test]
    fn foreign_machine_is_rejected_before_decryption() {
        let sealed = test_vault('a').encrypt("secret").unwrap();
        let err = test_vault('b').decrypt(&sealed).unwrap_err();
        assert!(matches!(err, SplunkMcpError::MachineMismatch(_)));
    }

    #[test]
    fn tampered_ciphertext_fails_authentication() {
        let vault = test_vault('a');
        let mut sealed = vault.encrypt("secret").unwrap();
        let mut blob = URL_SAFE.decode(&sealed.password_encrypted).unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0x01;
        sealed.password_encrypted = URL_SAFE.encode(&blob);
        let err = vault.decrypt(&sealed).unwrap_err();
        assert!(matches!(err, SplunkMcpError::DecryptFailed(_)));
    }

    #[test]
    fn truncated_ciphertext_is_rejected() {
        let vault = test_vault('a');
        let mut sealed = vault.encrypt("secret").unwrap();
        sealed.password_encrypted = URL_SAFE.encode(b"short");
        let err = vault.decrypt(&sealed).unwrap_err();
        assert!(matches!(err, SplunkMcpError::DecryptFailed(_)));
    }

    #[test]
    fn encrypted_credentials_win_over_plaintext() {
        let vault = test_vault('a');
        let sealed = vault.encrypt("from-vault").unwrap();
        let mut config = bare_config();
        config.password = Some("from-plaintext".to_string());
        config.password_encrypted = Some(sealed.password_encrypted);
        config.password_salt = Some(sealed.password_salt);
        config.machine_hash = Some(sealed.machine_hash);

        let creds = vault.get_credentials(&config).unwrap();
        assert_eq!(creds.username, "svc_search");
        assert_eq!(creds.password, "from-vault");
    }

    #[test]
    fn plaintext_password_still_works() {
        let mut config = bare_config();
        config.password = Some("plain".to_string());
        let creds = test_vault('a').get_credentials(&config).unwrap();
        assert_eq!(creds.password, "plain");
    }

    #[test]
    fn missing_credentials_is_config_error() {
        let err = test_vault('a').get_credentials(&bare_config()).unwrap_err();
        assert!(matches!(err, SplunkMcpError::ConfigMissing(_)));
    }

    #[test]
    fn debug_output_never_contains_password() {
        let creds = Credentials {
            username: "svc_search".to_string(),
            password: "super-secret".to_string(),
        };
        let rendered = format!("{creds:?}");
        assert!(!rendered.contains("super-secret"));
        assert!(rendered.contains("svc_search"));
    }
}
