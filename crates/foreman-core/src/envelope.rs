use chrono::Utc;
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::EnvelopeError;

type HmacSha256 = Hmac<Sha256>;

/// Default freshness window for signed prompts, in seconds.
pub const DEFAULT_MAX_AGE_SECS: i64 = 3600;

/// A prompt wrapped with an integrity signature for transit over the
/// message bus. Workers run outside the PM trust boundary; the signature
/// prevents a compromised broker from injecting crafted instructions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedPrompt {
    pub prompt: String,
    pub nonce: String,
    pub timestamp: i64,
    pub signature: String,
}

/// HMAC-SHA-256 prompt signer/verifier.
#[derive(Clone)]
pub struct PromptSigner {
    secret: Vec<u8>,
    max_age_secs: i64,
}

impl PromptSigner {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
            max_age_secs: DEFAULT_MAX_AGE_SECS,
        }
    }

    pub fn with_max_age(mut self, max_age_secs: i64) -> Self {
        self.max_age_secs = max_age_secs;
        self
    }

    /// Sign a prompt with a fresh 128-bit nonce and the current unix time.
    pub fn sign(&self, prompt: &str) -> SignedPrompt {
        let mut nonce_bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = hex::encode(nonce_bytes);
        let timestamp = Utc::now().timestamp();
        let signature = self.compute_mac(prompt, &nonce, timestamp);
        SignedPrompt {
            prompt: prompt.to_string(),
            nonce,
            timestamp,
            signature,
        }
    }

    /// Verify field integrity and freshness.
    pub fn verify(&self, signed: &SignedPrompt) -> Result<(), EnvelopeError> {
        let age = Utc::now().timestamp() - signed.timestamp;
        if age > self.max_age_secs || age < 0 {
            return Err(EnvelopeError::Expired);
        }

        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|_| EnvelopeError::SignatureMismatch)?;
        mac.update(canonical_payload(&signed.prompt, &signed.nonce, signed.timestamp).as_bytes());
        let provided = hex::decode(&signed.signature).map_err(|_| EnvelopeError::SignatureMismatch)?;
        mac.verify_slice(&provided)
            .map_err(|_| EnvelopeError::SignatureMismatch)
    }

    /// Verify and return the prompt, or nothing.
    pub fn extract(&self, signed: &SignedPrompt) -> Option<String> {
        self.verify(signed).ok().map(|()| signed.prompt.clone())
    }

    /// Parse a wire-format envelope (the JSON string carried in a stream
    /// field), verify it and return the prompt.
    pub fn extract_from_wire(&self, raw: &str) -> Result<String, EnvelopeError> {
        let signed: SignedPrompt =
            serde_json::from_str(raw).map_err(|_| EnvelopeError::Malformed)?;
        self.verify(&signed)?;
        Ok(signed.prompt)
    }

    fn compute_mac(&self, prompt: &str, nonce: &str, timestamp: i64) -> String {
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("hmac accepts any key length");
        mac.update(canonical_payload(prompt, nonce, timestamp).as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }
}

/// Canonical JSON of the signed fields. serde_json maps are ordered by key,
/// so serializing this object yields a stable byte string.
fn canonical_payload(prompt: &str, nonce: &str, timestamp: i64) -> String {
    serde_json::json!({
        "nonce": nonce,
        "prompt": prompt,
        "timestamp": timestamp,
    })
    .to_string()
}
