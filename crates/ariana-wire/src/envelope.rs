//! Sealed JSON envelope for controller↔worker traffic.
//!
//! Every endpoint accepts `{"encrypted": "<b64>"}` and replies with the same
//! shape. The AEAD key is derived from the agent-specific secret established
//! at provisioning; a random 12-byte nonce is prepended to the ciphertext
//! before base64 encoding. Envelope-level failures (decrypt, decode) surface
//! as plaintext `{"error": ...}` with a 4xx status.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rand::{rngs::OsRng, Rng};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// AES-GCM nonce length in bytes.
const NONCE_LEN: usize = 12;

/// The sealed transport shape of every request and response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// base64(nonce || ciphertext).
    pub encrypted: String,
}

/// Plaintext error reply permitted for envelope-level failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvelopeErrorBody {
    /// Human-readable failure detail.
    pub error: String,
}

/// Failures sealing or opening an envelope.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    /// AEAD rejected the payload (wrong key or tampering).
    #[error("decryption failed")]
    Crypto,
    /// The transport string was not valid base64 or too short.
    #[error("invalid envelope encoding: {0}")]
    Encoding(String),
    /// The plaintext was not the expected JSON shape.
    #[error("invalid payload: {0}")]
    Json(#[from] serde_json::Error),
}

/// Per-agent symmetric cipher.
///
/// Cheap to clone; both ends construct it from the same provisioning secret.
#[derive(Clone)]
pub struct AgentCipher {
    cipher: Aes256Gcm,
}

impl AgentCipher {
    /// Derive the AEAD key from the agent secret.
    pub fn from_secret(secret: &str) -> Self {
        let digest = Sha256::digest(secret.as_bytes());
        let key = Key::<Aes256Gcm>::from_slice(&digest);
        Self {
            cipher: Aes256Gcm::new(key),
        }
    }

    /// Serialize and seal a value into a transport envelope.
    pub fn seal<T: Serialize>(&self, value: &T) -> Result<Envelope, EnvelopeError> {
        let plaintext = serde_json::to_vec(value)?;
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_ref())
            .map_err(|_| EnvelopeError::Crypto)?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(Envelope {
            encrypted: BASE64.encode(sealed),
        })
    }

    /// Open a transport envelope and deserialize its payload.
    pub fn open<T: DeserializeOwned>(&self, envelope: &Envelope) -> Result<T, EnvelopeError> {
        let sealed = BASE64
            .decode(&envelope.encrypted)
            .map_err(|e| EnvelopeError::Encoding(e.to_string()))?;
        if sealed.len() < NONCE_LEN {
            return Err(EnvelopeError::Encoding("envelope too short".to_string()));
        }
        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| EnvelopeError::Crypto)?;
        Ok(serde_json::from_slice(&plaintext)?)
    }
}
