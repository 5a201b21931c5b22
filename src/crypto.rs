//! Module encryption: Argon2id key derivation + AES-256-GCM.
//!
//! The primary header carries the file-wide parameters (`EncryptionParams`);
//! every encrypted module additionally carries its own salt, IV and auth
//! tag in header TLVs (`ModuleCrypto`). The module key is
//! `Argon2id(password, base_salt ‖ module_salt)` → 32 bytes, so two
//! modules in one file never share a key.

use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::AeadInPlace;
use aes_gcm::{Aes256Gcm, KeyInit};
use argon2::{Algorithm, Argon2, Params, Version};
use rand::RngCore;

use crate::error::{Result, UmdfError};
use crate::format::types::{
    EncryptionKind, AUTH_TAG_LEN, DEFAULT_MEMORY_COST, DEFAULT_PARALLELISM, DEFAULT_TIME_COST,
    IV_LEN, SALT_LEN,
};

/// Derived AES key length in bytes.
pub const KEY_LEN: usize = 32;

// ── File-wide parameters ───────────────────────────────────────────

/// Encryption parameters stored in the primary header. `password` is
/// session state only and never touches the wire.
#[derive(Debug, Clone, Default)]
pub struct EncryptionParams {
    pub kind: EncryptionKindState,
    pub base_salt: Vec<u8>,
    /// Argon2id memory cost in KiB.
    pub memory_cost: u64,
    pub time_cost: u32,
    pub parallelism: u32,
    pub password: Option<String>,
}

/// Whether the file is encrypted. Defaults to plaintext.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EncryptionKindState {
    #[default]
    None,
    Aes256Gcm,
}

impl EncryptionParams {
    /// Plaintext file.
    pub fn none() -> Self {
        Self::default()
    }

    /// Fresh parameters for a new encrypted file.
    pub fn generate(password: &str) -> Self {
        Self {
            kind: EncryptionKindState::Aes256Gcm,
            base_salt: generate_salt(),
            memory_cost: DEFAULT_MEMORY_COST,
            time_cost: DEFAULT_TIME_COST,
            parallelism: DEFAULT_PARALLELISM,
            password: Some(password.to_owned()),
        }
    }

    pub fn is_encrypted(&self) -> bool {
        self.kind == EncryptionKindState::Aes256Gcm
    }

    pub fn wire_kind(&self) -> EncryptionKind {
        match self.kind {
            EncryptionKindState::None => EncryptionKind::None,
            EncryptionKindState::Aes256Gcm => EncryptionKind::Aes256Gcm,
        }
    }

    /// Derive the 32-byte module key from the session password and the
    /// concatenated base+module salts.
    pub fn derive_key(&self, module_salt: &[u8]) -> Result<[u8; KEY_LEN]> {
        let password = self
            .password
            .as_deref()
            .ok_or_else(|| UmdfError::Crypto("File is encrypted but no password provided".into()))?;

        let m_cost = u32::try_from(self.memory_cost)
            .map_err(|_| UmdfError::Crypto("Argon2 memory cost out of range".into()))?;
        let params = Params::new(m_cost, self.time_cost, self.parallelism, Some(KEY_LEN))
            .map_err(|e| UmdfError::Crypto(format!("Invalid Argon2 parameters: {e}")))?;
        let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

        let mut salt = Vec::with_capacity(self.base_salt.len() + module_salt.len());
        salt.extend_from_slice(&self.base_salt);
        salt.extend_from_slice(module_salt);

        let mut key = [0u8; KEY_LEN];
        argon
            .hash_password_into(password.as_bytes(), &salt, &mut key)
            .map_err(|e| UmdfError::Crypto(format!("Key derivation failed: {e}")))?;
        Ok(key)
    }
}

// ── Per-module material ────────────────────────────────────────────

/// Crypto material carried in an encrypted module's header TLVs.
#[derive(Debug, Clone, Default)]
pub struct ModuleCrypto {
    pub module_salt: Vec<u8>,
    pub iv: Vec<u8>,
    pub auth_tag: Vec<u8>,
}

impl ModuleCrypto {
    /// Fresh salt and IV for a module about to be written. The tag is
    /// filled in by `seal`.
    pub fn generate() -> Self {
        let mut iv = vec![0u8; IV_LEN];
        rand::thread_rng().fill_bytes(&mut iv);
        Self {
            module_salt: generate_salt(),
            iv,
            auth_tag: Vec::new(),
        }
    }

    fn check_lengths(&self) -> Result<()> {
        if self.module_salt.len() < SALT_LEN {
            return Err(UmdfError::Crypto(format!(
                "Module salt must be at least {SALT_LEN} bytes, got {}",
                self.module_salt.len()
            )));
        }
        if self.iv.len() != IV_LEN {
            return Err(UmdfError::Crypto(format!(
                "IV must be {IV_LEN} bytes, got {}",
                self.iv.len()
            )));
        }
        Ok(())
    }
}

/// Encrypt `plaintext` in place, storing the detached tag in `crypto`.
/// Returns the ciphertext (same length as the plaintext).
pub fn seal(
    params: &EncryptionParams,
    crypto: &mut ModuleCrypto,
    mut plaintext: Vec<u8>,
) -> Result<Vec<u8>> {
    crypto.check_lengths()?;
    let key = params.derive_key(&crypto.module_salt)?;
    let cipher = Aes256Gcm::new(GenericArray::from_slice(&key));
    let nonce = GenericArray::from_slice(&crypto.iv);
    let tag = cipher
        .encrypt_in_place_detached(nonce, &[], &mut plaintext)
        .map_err(|_| UmdfError::Crypto("AES-GCM encryption failed".into()))?;
    crypto.auth_tag = tag.to_vec();
    Ok(plaintext)
}

/// Decrypt `ciphertext` in place, verifying the detached tag. Tag
/// mismatch (wrong password or tampered bytes) is a crypto error.
pub fn open(
    params: &EncryptionParams,
    crypto: &ModuleCrypto,
    mut ciphertext: Vec<u8>,
) -> Result<Vec<u8>> {
    crypto.check_lengths()?;
    if crypto.auth_tag.len() != AUTH_TAG_LEN {
        return Err(UmdfError::Crypto(format!(
            "Auth tag must be {AUTH_TAG_LEN} bytes, got {}",
            crypto.auth_tag.len()
        )));
    }
    let key = params.derive_key(&crypto.module_salt)?;
    let cipher = Aes256Gcm::new(GenericArray::from_slice(&key));
    let nonce = GenericArray::from_slice(&crypto.iv);
    let tag = GenericArray::from_slice(&crypto.auth_tag);
    cipher
        .decrypt_in_place_detached(nonce, &[], &mut ciphertext, tag)
        .map_err(|_| {
            UmdfError::Crypto("Decryption failed: wrong password or corrupted module".into())
        })?;
    Ok(ciphertext)
}

fn generate_salt() -> Vec<u8> {
    let mut salt = vec![0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Cheap parameters so tests do not pay the full KDF cost.
    fn test_params(password: &str) -> EncryptionParams {
        EncryptionParams {
            kind: EncryptionKindState::Aes256Gcm,
            base_salt: vec![7u8; SALT_LEN],
            memory_cost: 64,
            time_cost: 1,
            parallelism: 1,
            password: Some(password.to_owned()),
        }
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let params = test_params("pw");
        let mut crypto = ModuleCrypto::generate();
        let plaintext = b"string buffer + metadata + data".to_vec();

        let ciphertext = seal(&params, &mut crypto, plaintext.clone()).unwrap();
        assert_eq!(ciphertext.len(), plaintext.len());
        assert_ne!(ciphertext, plaintext);
        assert_eq!(crypto.auth_tag.len(), AUTH_TAG_LEN);

        let opened = open(&params, &crypto, ciphertext).unwrap();
        assert_eq!(opened, plaintext);
    }

    #[test]
    fn test_wrong_password_fails_tag_check() {
        let params = test_params("pw");
        let mut crypto = ModuleCrypto::generate();
        let ciphertext = seal(&params, &mut crypto, b"secret".to_vec()).unwrap();

        let wrong = test_params("not-pw");
        let err = open(&wrong, &crypto, ciphertext).unwrap_err();
        assert!(matches!(err, UmdfError::Crypto(_)));
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let params = test_params("pw");
        let mut crypto = ModuleCrypto::generate();
        let mut ciphertext = seal(&params, &mut crypto, b"secret bytes".to_vec()).unwrap();
        ciphertext[0] ^= 0x01;

        let err = open(&params, &crypto, ciphertext).unwrap_err();
        assert!(matches!(err, UmdfError::Crypto(_)));
    }

    #[test]
    fn test_missing_password() {
        let mut params = test_params("pw");
        params.password = None;
        let err = params.derive_key(&[0u8; SALT_LEN]).unwrap_err();
        assert!(err.to_string().contains("no password"));
    }

    #[test]
    fn test_module_salts_diversify_keys() {
        let params = test_params("pw");
        let key_a = params.derive_key(&[1u8; SALT_LEN]).unwrap();
        let key_b = params.derive_key(&[2u8; SALT_LEN]).unwrap();
        assert_ne!(key_a, key_b);
    }

    #[test]
    fn test_kdf_params_validated() {
        let mut params = test_params("pw");
        params.memory_cost = 1; // below Argon2 minimum
        let err = params.derive_key(&[0u8; SALT_LEN]).unwrap_err();
        assert!(matches!(err, UmdfError::Crypto(_)));
    }

    #[test]
    fn test_generate_material_lengths() {
        let crypto = ModuleCrypto::generate();
        assert_eq!(crypto.module_salt.len(), SALT_LEN);
        assert_eq!(crypto.iv.len(), IV_LEN);
        assert!(crypto.auth_tag.is_empty());
    }
}
