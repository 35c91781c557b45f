use crate::service::ServiceAddress;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use std::fmt;
use veilport_common::VeilPortError;

/// Identity key of a hidden service
#[derive(Clone)]
pub struct ServiceKey {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl ServiceKey {
    /// Generate a new random key
    pub fn generate() -> Self {
        let mut secret_bytes = [0u8; 32];
        OsRng.fill_bytes(&mut secret_bytes);
        Self::from_secret_bytes(&secret_bytes)
    }

    /// Create a key from its 32 byte secret
    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(bytes);
        let verifying_key = signing_key.verifying_key();

        Self {
            signing_key,
            verifying_key,
        }
    }

    /// Create a key from a hex encoded secret
    pub fn from_secret_hex(secret: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(secret.trim()).map_err(|_| KeyError::InvalidSecretKey)?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| KeyError::InvalidSecretKey)?;
        Ok(Self::from_secret_bytes(&bytes))
    }

    /// Get the secret key bytes
    pub fn secret_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn secret_hex(&self) -> String {
        hex::encode(self.secret_bytes())
    }

    /// Get the public key bytes
    pub fn public_bytes(&self) -> [u8; 32] {
        self.verifying_key.to_bytes()
    }

    /// Address under which this key publishes
    pub fn address(&self) -> ServiceAddress {
        ServiceAddress::from_public_bytes(&self.public_bytes())
    }

    /// Sign a message
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing_key.sign(message).to_bytes()
    }

    /// Verify a signature on a message
    pub fn verify(&self, message: &[u8], signature: &[u8; 64]) -> bool {
        self.verifying_key
            .verify(message, &Signature::from_bytes(signature))
            .is_ok()
    }
}

impl fmt::Debug for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceKey")
            .field("address", &self.address().to_hostname())
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

/// Errors related to service keys
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("Invalid secret key")]
    InvalidSecretKey,

    #[error("Invalid vanity prefix {prefix:?}: {reason}")]
    InvalidPrefix { prefix: String, reason: String },
}

impl From<KeyError> for VeilPortError {
    fn from(err: KeyError) -> Self {
        VeilPortError::Validation(err.to_string())
    }
}
