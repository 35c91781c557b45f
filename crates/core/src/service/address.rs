/// `.veil` hostnames
///
/// The 32 address bytes are a domain separated BLAKE3 digest of the service's
/// ed25519 public key. The hostname label is their lowercase unpadded base32
/// form, always 52 characters, followed by the `.veil` suffix. Parsing
/// accepts the label with or without the suffix and in any letter case.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use veilport_common::config::service::ADDRESS_SUFFIX;

const ADDRESS_DOMAIN: &[u8] = b"VEILPORT-SERVICE-V1";

/// Characters in the base32 label
pub const LABEL_LEN: usize = 52;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ServiceAddress([u8; 32]);

impl ServiceAddress {
    pub fn from_public_bytes(public_key: &[u8; 32]) -> Self {
        let digest = blake3::Hasher::new()
            .update(ADDRESS_DOMAIN)
            .update(public_key)
            .finalize();
        Self(*digest.as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Label without the suffix
    pub fn to_base32(&self) -> String {
        data_encoding::BASE32_NOPAD.encode(&self.0).to_ascii_lowercase()
    }

    pub fn to_hostname(&self) -> String {
        let mut hostname = self.to_base32();
        hostname.push_str(ADDRESS_SUFFIX);
        hostname
    }

    pub fn from_hostname(hostname: &str) -> Result<Self, ServiceAddressError> {
        let hostname = hostname.trim().to_ascii_uppercase();
        let label = hostname
            .strip_suffix(&ADDRESS_SUFFIX.to_ascii_uppercase())
            .unwrap_or(&hostname);
        if label.len() != LABEL_LEN {
            return Err(ServiceAddressError::LabelLength(label.len()));
        }

        let mut bytes = [0u8; 32];
        let decoded = data_encoding::BASE32_NOPAD
            .decode_mut(label.as_bytes(), &mut bytes)
            .map_err(|_| ServiceAddressError::NotBase32)?;
        if decoded != bytes.len() {
            return Err(ServiceAddressError::LabelLength(label.len()));
        }
        Ok(Self(bytes))
    }

    /// Whether `hostname` ends in `.veil`, ignoring case; the label is not checked
    pub fn is_veil_address(hostname: &str) -> bool {
        let hostname = hostname.trim();
        hostname.len() >= ADDRESS_SUFFIX.len()
            && hostname
                .get(hostname.len() - ADDRESS_SUFFIX.len()..)
                .is_some_and(|tail| tail.eq_ignore_ascii_case(ADDRESS_SUFFIX))
    }

    /// True when `public_key` hashes to this address
    pub fn belongs_to(&self, public_key: &[u8; 32]) -> bool {
        Self::from_public_bytes(public_key) == *self
    }
}

impl fmt::Display for ServiceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hostname())
    }
}

impl FromStr for ServiceAddress {
    type Err = ServiceAddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hostname(s)
    }
}

impl TryFrom<String> for ServiceAddress {
    type Error = ServiceAddressError;

    fn try_from(hostname: String) -> Result<Self, Self::Error> {
        Self::from_hostname(&hostname)
    }
}

impl From<ServiceAddress> for String {
    fn from(address: ServiceAddress) -> Self {
        address.to_hostname()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceAddressError {
    #[error("address label is not base32")]
    NotBase32,

    #[error("address label has {0} characters, expected 52")]
    LabelLength(usize),
}
