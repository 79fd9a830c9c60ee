//! Keyed primitives derived from the configured secret key: signed OAuth
//! `state` values and authenticated encryption of tokens at rest.

use crate::error::{ExpenseError, Result};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::fmt;

type HmacSha256 = Hmac<Sha256>;

const STATE_KEY_LABEL: &[u8] = b"expense-mcp/oauth-state";
const TOKEN_KEY_LABEL: &[u8] = b"expense-mcp/token-at-rest";
const NONCE_LEN: usize = 12;

/// Root secret from which purpose-specific keys are derived.
#[derive(Clone)]
pub struct SecretKey {
    material: Vec<u8>,
}

impl SecretKey {
    pub fn new(secret: &str) -> Result<Self> {
        if secret.trim().is_empty() {
            return Err(ExpenseError::Configuration(
                "secret key must not be empty".to_string(),
            ));
        }
        Ok(Self {
            material: secret.as_bytes().to_vec(),
        })
    }

    fn derive(&self, label: &[u8]) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(label);
        hasher.update([0u8]);
        hasher.update(&self.material);
        hasher.finalize().into()
    }

    pub fn state_signer(&self) -> StateSigner {
        StateSigner {
            key: self.derive(STATE_KEY_LABEL),
        }
    }

    pub fn token_cipher(&self) -> TokenCipher {
        TokenCipher {
            key: self.derive(TOKEN_KEY_LABEL),
        }
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey(<redacted>)")
    }
}

fn random_bytes<const N: usize>() -> [u8; N] {
    let mut buf = [0u8; N];
    OsRng.fill_bytes(&mut buf);
    buf
}

/// Issues and verifies `state` values of the form `<nonce>.<hmac>`.
///
/// A state that fails verification was not issued by this process (or the
/// secret key changed) and is rejected before any pending-login lookup.
#[derive(Clone)]
pub struct StateSigner {
    key: [u8; 32],
}

impl StateSigner {
    fn mac(&self) -> Result<HmacSha256> {
        <HmacSha256 as Mac>::new_from_slice(&self.key)
            .map_err(|e| ExpenseError::Internal(format!("invalid HMAC key: {e}")))
    }

    /// Fresh random state carrying its own signature
    pub fn issue(&self) -> Result<String> {
        let nonce = URL_SAFE_NO_PAD.encode(random_bytes::<24>());
        let mut mac = self.mac()?;
        mac.update(nonce.as_bytes());
        let tag = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
        Ok(format!("{nonce}.{tag}"))
    }

    pub fn verify(&self, state: &str) -> bool {
        let Some((nonce, tag)) = state.split_once('.') else {
            return false;
        };
        let Ok(tag) = URL_SAFE_NO_PAD.decode(tag) else {
            return false;
        };
        let Ok(mut mac) = self.mac() else {
            return false;
        };
        mac.update(nonce.as_bytes());
        mac.verify_slice(&tag).is_ok()
    }
}

impl fmt::Debug for StateSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StateSigner(<redacted>)")
    }
}

/// AES-256-GCM sealing for access and refresh tokens stored on disk.
///
/// Output is base64 of `nonce || ciphertext`, with a fresh 96-bit nonce per
/// value.
#[derive(Clone)]
pub struct TokenCipher {
    key: [u8; 32],
}

impl TokenCipher {
    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key))
    }

    pub fn seal(&self, plaintext: &str) -> Result<String> {
        let nonce_bytes = random_bytes::<NONCE_LEN>();
        let ciphertext = self
            .cipher()
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_bytes())
            .map_err(|_| ExpenseError::Storage("token encryption failed".to_string()))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(sealed))
    }

    pub fn open(&self, sealed: &str) -> Result<String> {
        let raw = STANDARD
            .decode(sealed)
            .map_err(|_| ExpenseError::Storage("stored token is not valid base64".to_string()))?;
        if raw.len() <= NONCE_LEN {
            return Err(ExpenseError::Storage("stored token is truncated".to_string()));
        }
        let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
        let plaintext = self
            .cipher()
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| {
                ExpenseError::Storage("stored token failed authentication".to_string())
            })?;
        String::from_utf8(plaintext)
            .map_err(|_| ExpenseError::Storage("stored token is not UTF-8".to_string()))
    }
}

impl fmt::Debug for TokenCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TokenCipher(<redacted>)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_secret_rejected() {
        assert!(matches!(
            SecretKey::new("  "),
            Err(ExpenseError::Configuration(_))
        ));
    }

    #[test]
    fn test_state_round_trip_and_tamper() {
        let signer = SecretKey::new("s3cret").unwrap().state_signer();
        let state = signer.issue().unwrap();
        assert!(signer.verify(&state));

        let (nonce, tag) = state.split_once('.').unwrap();
        assert!(!signer.verify(&format!("{nonce}x.{tag}")));
        assert!(!signer.verify(nonce));
        assert!(!signer.verify("abc"));

        let other = SecretKey::new("different").unwrap().state_signer();
        assert!(!other.verify(&state));
    }

    #[test]
    fn test_states_are_unique() {
        let signer = SecretKey::new("s3cret").unwrap().state_signer();
        assert_ne!(signer.issue().unwrap(), signer.issue().unwrap());
    }

    #[test]
    fn test_token_cipher_hides_plaintext() {
        let cipher = SecretKey::new("s3cret").unwrap().token_cipher();
        let sealed = cipher.seal("refresh-token-value").unwrap();
        assert!(!sealed.contains("refresh-token-value"));
        assert_eq!(cipher.open(&sealed).unwrap(), "refresh-token-value");

        // Same plaintext, different nonce
        assert_ne!(sealed, cipher.seal("refresh-token-value").unwrap());
    }

    #[test]
    fn test_token_cipher_rejects_foreign_key_and_garbage() {
        let sealed = SecretKey::new("one").unwrap().token_cipher().seal("x").unwrap();
        let other = SecretKey::new("two").unwrap().token_cipher();
        assert!(other.open(&sealed).is_err());
        assert!(other.open("not base64!").is_err());
        assert!(other.open("AAAA").is_err());
    }

    #[test]
    fn test_debug_is_redacted() {
        let key = SecretKey::new("hunter2").unwrap();
        assert!(!format!("{key:?}").contains("hunter2"));
    }
}
