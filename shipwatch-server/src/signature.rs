//! Webhook signature verification.
//!
//! GitHub signs each delivery with HMAC-SHA256 over the exact raw request
//! body and sends the digest in `x-hub-signature-256` as `sha256=<hex>`.
//! Verification must run over the raw bytes as received; re-serializing
//! the parsed payload can change whitespace and silently break the check.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::warn;

use crate::db::RepositoryRecord;
use crate::secrets::SecretCipher;

type HmacSha256 = Hmac<Sha256>;

/// Verify a webhook signature against a known secret.
///
/// Returns `false` for every failure mode (missing prefix, malformed hex,
/// digest mismatch) so callers cannot distinguish why verification failed.
pub fn verify(payload: &[u8], signature_header: &str, secret: &str) -> bool {
    let Some(signature_hex) = signature_header.strip_prefix("sha256=") else {
        return false;
    };

    let signature_bytes = match hex::decode(signature_hex) {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };

    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return false,
    };

    mac.update(payload);

    // Constant-time comparison.
    mac.verify_slice(&signature_bytes).is_ok()
}

/// Verify a delivery against a repository's stored (encrypted) secret.
///
/// Secret decryption failure is deliberately indistinguishable from a bad
/// signature: the caller sees `false` either way, and the detail stays in
/// the server log.
pub fn verify_for_repository(
    cipher: &SecretCipher,
    repository: &RepositoryRecord,
    payload: &[u8],
    signature_header: &str,
) -> bool {
    let secret = match cipher.open(&repository.secret_nonce, &repository.secret_ciphertext) {
        Ok(secret) => secret,
        Err(e) => {
            warn!(
                "Failed to decrypt webhook secret for repository {}: {}",
                repository.full_name, e
            );
            return false;
        }
    };

    verify(payload, signature_header, &secret)
}

/// Compute the signature header value for a body, as GitHub would.
/// Used by tests and by webhook registration tooling.
pub fn sign(payload: &[u8], secret: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts keys of any length");
    mac.update(payload);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "test-webhook-secret";

    #[test]
    fn test_valid_signature_accepted() {
        let body = br#"{"action":"created"}"#;
        let header = sign(body, SECRET);
        assert!(verify(body, &header, SECRET));
    }

    #[test]
    fn test_flipped_body_byte_rejected() {
        let body = br#"{"action":"created"}"#.to_vec();
        let header = sign(&body, SECRET);

        let mut tampered = body.clone();
        tampered[3] ^= 0x01;
        assert!(!verify(&tampered, &header, SECRET));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let body = b"payload";
        let header = sign(body, "secret-one");
        assert!(!verify(body, &header, "secret-two"));
    }

    #[test]
    fn test_missing_prefix_rejected() {
        let body = b"payload";
        let header = sign(body, SECRET);
        let bare = header.strip_prefix("sha256=").unwrap();
        assert!(!verify(body, bare, SECRET));
    }

    #[test]
    fn test_malformed_hex_rejected() {
        assert!(!verify(b"payload", "sha256=not-hex-at-all", SECRET));
    }

    #[test]
    fn test_verify_for_repository_bad_ciphertext_is_false() {
        let cipher = SecretCipher::new(&[1u8; 32]);
        let repo = RepositoryRecord {
            id: "repo-1".into(),
            workspace_slug: "acme".into(),
            full_name: "acme/api".into(),
            html_url: "https://github.com/acme/api".into(),
            webhook_id: "00000000-0000-0000-0000-000000000000".into(),
            installation_id: 1,
            secret_nonce: "00".repeat(12),
            secret_ciphertext: "deadbeef".into(),
        };

        let body = b"payload";
        let header = sign(body, SECRET);
        assert!(!verify_for_repository(&cipher, &repo, body, &header));
    }
}
