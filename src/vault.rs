//! Field-level encryption for SSN and DOB.
//!
//! Tokens are `base64(nonce || tag || ciphertext)` under AES-256-GCM with a
//! fresh 96-bit nonce per call. The vault holds no mutable state; the key is
//! read once at start-up. The vault never logs and never audits: callers that
//! reveal plaintext go through `LeadService::decrypt_lead_field` or
//! `RetryQueueManager::materialize`, which record an audit entry first.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::errors::AppError;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Decodes base64 or hex key material, returning the key only if it is
/// exactly 32 bytes long.
pub fn decode_key_material(raw: &str) -> Option<Vec<u8>> {
    let trimmed = raw.trim();
    let decoded = if trimmed.len() == KEY_LEN * 2 && trimmed.chars().all(|c| c.is_ascii_hexdigit())
    {
        hex::decode(trimmed).ok()
    } else {
        BASE64.decode(trimmed.as_bytes()).ok()
    }?;
    (decoded.len() == KEY_LEN).then_some(decoded)
}

#[derive(Clone)]
pub struct PiiVault {
    cipher: Option<Aes256Gcm>,
    fingerprint_key: Option<Vec<u8>>,
    key_error: Option<String>,
}

impl std::fmt::Debug for PiiVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PiiVault")
            .field("configured", &self.cipher.is_some())
            .finish()
    }
}

impl PiiVault {
    /// Builds a vault from raw key material. An absent or malformed key does
    /// not fail here; every encrypt/decrypt call fails with
    /// `AppError::Configuration` instead, and `ensure_configured` lets the
    /// server refuse to start.
    pub fn from_key_material(raw: Option<&str>) -> Self {
        let Some(raw) = raw.filter(|r| !r.trim().is_empty()) else {
            return Self::unconfigured("encryption key is not set");
        };
        match decode_key_material(raw) {
            Some(key) => Self::from_key_bytes(&key),
            None => Self::unconfigured("encryption key must decode to exactly 32 bytes"),
        }
    }

    pub fn from_key_bytes(key: &[u8]) -> Self {
        if key.len() != KEY_LEN {
            return Self::unconfigured("encryption key must be exactly 32 bytes");
        }
        match Aes256Gcm::new_from_slice(key) {
            Ok(cipher) => Self {
                cipher: Some(cipher),
                fingerprint_key: Some(derive_fingerprint_key(key)),
                key_error: None,
            },
            Err(_) => Self::unconfigured("encryption key rejected by cipher"),
        }
    }

    fn unconfigured(reason: &str) -> Self {
        Self {
            cipher: None,
            fingerprint_key: None,
            key_error: Some(reason.to_string()),
        }
    }

    pub fn ensure_configured(&self) -> Result<(), AppError> {
        self.cipher().map(|_| ())
    }

    fn cipher(&self) -> Result<&Aes256Gcm, AppError> {
        self.cipher.as_ref().ok_or_else(|| {
            AppError::Configuration(
                self.key_error
                    .clone()
                    .unwrap_or_else(|| "encryption key unavailable".to_string()),
            )
        })
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, AppError> {
        let cipher = self.cipher()?;
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let sealed = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_bytes())
            .map_err(|_| AppError::InternalError("field encryption failed".to_string()))?;

        // aes-gcm appends the tag; the token stores it ahead of the ciphertext.
        let (ciphertext, tag) = sealed.split_at(sealed.len() - TAG_LEN);
        let mut token = Vec::with_capacity(NONCE_LEN + sealed.len());
        token.extend_from_slice(&nonce_bytes);
        token.extend_from_slice(tag);
        token.extend_from_slice(ciphertext);
        Ok(BASE64.encode(token))
    }

    pub fn decrypt(&self, token: &str) -> Result<String, AppError> {
        let cipher = self.cipher()?;
        let raw = BASE64
            .decode(token.trim().as_bytes())
            .map_err(|_| AppError::Integrity("ciphertext token is not valid base64".to_string()))?;
        if raw.len() < NONCE_LEN + TAG_LEN {
            return Err(AppError::Integrity(
                "ciphertext token is truncated".to_string(),
            ));
        }
        let (nonce, rest) = raw.split_at(NONCE_LEN);
        let (tag, ciphertext) = rest.split_at(TAG_LEN);
        let mut sealed = Vec::with_capacity(rest.len());
        sealed.extend_from_slice(ciphertext);
        sealed.extend_from_slice(tag);

        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce), sealed.as_ref())
            .map_err(|_| AppError::Integrity("authentication tag mismatch".to_string()))?;
        String::from_utf8(plaintext)
            .map_err(|_| AppError::Integrity("decrypted value is not UTF-8".to_string()))
    }

    /// Keyed SHA-256 of the normalized SSN digits, used as a blind index so
    /// full-SSN search never requires decryption.
    pub fn ssn_fingerprint(&self, ssn: &str) -> Result<String, AppError> {
        let key = self.fingerprint_key.as_ref().ok_or_else(|| {
            AppError::Configuration("encryption key unavailable".to_string())
        })?;
        let digits: String = ssn.chars().filter(|c| c.is_ascii_digit()).collect();
        let mut hasher = Sha256::new();
        hasher.update(key);
        hasher.update(digits.as_bytes());
        Ok(hex::encode(hasher.finalize()))
    }
}

fn derive_fingerprint_key(key: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(b"prescreen-ssn-fingerprint:");
    hasher.update(key);
    hasher.finalize().to_vec()
}

/// Last four digits of an SSN, if it has at least four digits.
pub fn ssn_last_four(ssn: &str) -> Option<String> {
    let digits: Vec<char> = ssn.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() < 4 {
        return None;
    }
    Some(digits[digits.len() - 4..].iter().collect())
}

/// `***-**-1234` from a plaintext SSN.
pub fn mask_ssn(ssn: &str) -> String {
    match ssn_last_four(ssn) {
        Some(last) => format!("***-**-{}", last),
        None => "***-**-****".to_string(),
    }
}

/// Same mask built from a stored last-four value.
pub fn mask_ssn_last_four(last_four: Option<&str>) -> String {
    match last_four {
        Some(last) if last.len() == 4 => format!("***-**-{}", last),
        _ => "***-**-****".to_string(),
    }
}

/// `**/**/1985` from an ISO (`1985-07-21`) or US (`07/21/1985`) date.
pub fn mask_dob(dob: &str) -> String {
    let trimmed = dob.trim();
    let leading = trimmed
        .get(..4)
        .filter(|y| y.chars().all(|c| c.is_ascii_digit()));
    let year = if leading.is_some() {
        leading
    } else {
        trimmed
            .rsplit('/')
            .next()
            .filter(|y| y.len() == 4 && y.chars().all(|c| c.is_ascii_digit()))
    };
    match year {
        Some(y) => format!("**/**/{}", y),
        None => "**/**/****".to_string(),
    }
}
