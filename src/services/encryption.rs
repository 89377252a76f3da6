// Token Encryption Service
// At-rest encryption for platform token blobs using AES-256-GCM

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rand::Rng;
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, Zeroizing};

use crate::models::TokenBlob;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const KEY_LEN: usize = 32;

/// Symmetric cipher for stored token blobs.
///
/// The key is derived exactly once at process start by hashing the
/// configured secret; the serialized form is base64(nonce || tag ||
/// ciphertext), matching the blobs already present in the store.
pub struct TokenCipher {
    key: Zeroizing<[u8; KEY_LEN]>,
}

impl TokenCipher {
    pub fn new(secret: &str) -> Self {
        let digest = Sha256::digest(secret.as_bytes());
        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        key.copy_from_slice(&digest);
        Self { key }
    }

    /// Encrypt a token blob for storage.
    pub fn encrypt_blob(&self, blob: &TokenBlob) -> Result<String, String> {
        let plaintext = serde_json::to_vec(blob)
            .map_err(|e| format!("Failed to serialize token blob: {e}"))?;

        let mut rng = rand::thread_rng();
        let nonce_bytes: [u8; NONCE_LEN] = rng.gen();

        let cipher = Aes256Gcm::new_from_slice(&*self.key)
            .map_err(|e| format!("Failed to create cipher: {e}"))?;
        let nonce = Nonce::from_slice(&nonce_bytes);

        // aes-gcm appends the tag to the ciphertext; the stored layout keeps
        // the tag between the nonce and the ciphertext.
        let sealed = cipher
            .encrypt(nonce, plaintext.as_slice())
            .map_err(|e| format!("Token encryption failed: {e}"))?;
        let (ciphertext, tag) = sealed.split_at(sealed.len() - TAG_LEN);

        let mut combined = Vec::with_capacity(NONCE_LEN + TAG_LEN + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(tag);
        combined.extend_from_slice(ciphertext);

        Ok(BASE64.encode(combined))
    }

    /// Decrypt a stored token blob.
    ///
    /// Returns `None` for any malformed, truncated, or tampered input;
    /// callers must handle the missing-blob case explicitly.
    pub fn decrypt_blob(&self, serialized: &str) -> Option<TokenBlob> {
        let mut combined = BASE64.decode(serialized).ok()?;
        if combined.len() < NONCE_LEN + TAG_LEN {
            combined.zeroize();
            return None;
        }

        let nonce_bytes = &combined[..NONCE_LEN];
        let tag = &combined[NONCE_LEN..NONCE_LEN + TAG_LEN];
        let ciphertext = &combined[NONCE_LEN + TAG_LEN..];

        let mut sealed = Vec::with_capacity(ciphertext.len() + TAG_LEN);
        sealed.extend_from_slice(ciphertext);
        sealed.extend_from_slice(tag);

        let cipher = Aes256Gcm::new_from_slice(&*self.key).ok()?;
        let nonce = Nonce::from_slice(nonce_bytes);

        let result = match cipher.decrypt(nonce, sealed.as_slice()) {
            Ok(mut plaintext) => {
                let blob = serde_json::from_slice(&plaintext).ok();
                plaintext.zeroize();
                blob
            }
            Err(_) => None,
        };

        sealed.zeroize();
        combined.zeroize();
        result
    }
}
