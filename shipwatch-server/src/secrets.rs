//! Encryption at rest for per-repository webhook secrets.
//!
//! Secrets are sealed with ChaCha20-Poly1305 under a process-wide key and
//! stored as hex-encoded (nonce, ciphertext) pairs. A fresh random nonce
//! is drawn for every seal, so sealing the same secret twice yields
//! different ciphertexts.

use anyhow::{anyhow, Context, Result};
use chacha20poly1305::aead::Aead;
use chacha20poly1305::{ChaCha20Poly1305, KeyInit, Nonce};
use rand::RngCore;

const NONCE_LEN: usize = 12;

/// A sealed secret ready for storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedSecret {
    pub nonce: String,
    pub ciphertext: String,
}

#[derive(Clone)]
pub struct SecretCipher {
    cipher: ChaCha20Poly1305,
}

impl SecretCipher {
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(key.into()),
        }
    }

    /// Encrypt a webhook secret for storage.
    pub fn seal(&self, plaintext: &str) -> Result<SealedSecret> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| anyhow!("failed to encrypt secret"))?;

        Ok(SealedSecret {
            nonce: hex::encode(nonce_bytes),
            ciphertext: hex::encode(ciphertext),
        })
    }

    /// Decrypt a stored webhook secret.
    ///
    /// Fails on malformed hex, a wrong-length nonce, or an authentication
    /// failure (tampered ciphertext or wrong key). Callers on the webhook
    /// path must collapse any of these into a signature-verification
    /// failure rather than surfacing the distinction.
    pub fn open(&self, nonce_hex: &str, ciphertext_hex: &str) -> Result<String> {
        let nonce_bytes = hex::decode(nonce_hex).context("secret nonce is not valid hex")?;
        if nonce_bytes.len() != NONCE_LEN {
            return Err(anyhow!("secret nonce has wrong length"));
        }
        let ciphertext = hex::decode(ciphertext_hex).context("secret ciphertext is not valid hex")?;

        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_slice())
            .map_err(|_| anyhow!("failed to decrypt secret"))?;

        String::from_utf8(plaintext).context("decrypted secret is not valid UTF-8")
    }
}
