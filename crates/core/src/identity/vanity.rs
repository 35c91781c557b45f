/// Vanity address search
///
/// Keys are drawn until the base32 form of their address starts with the
/// requested prefix. The search is CPU bound, so it yields to the scheduler
/// every `yield_every` attempts.

use super::{KeyError, ServiceKey};
use tracing::debug;

const BASE32_ALPHABET: &str = "abcdefghijklmnopqrstuvwxyz234567";

/// Length of an address in base32 characters
const ADDRESS_CHARS: usize = 52;

/// Check that `prefix` can appear at the start of an address
pub fn validate_prefix(prefix: &str) -> Result<String, KeyError> {
    let prefix = prefix.to_ascii_lowercase();

    if prefix.len() > ADDRESS_CHARS {
        return Err(KeyError::InvalidPrefix {
            prefix,
            reason: format!("longer than {} characters", ADDRESS_CHARS),
        });
    }
    if let Some(c) = prefix.chars().find(|c| !BASE32_ALPHABET.contains(*c)) {
        return Err(KeyError::InvalidPrefix {
            reason: format!("{:?} is not a base32 character", c),
            prefix,
        });
    }

    Ok(prefix)
}

/// Search for a key whose address starts with `prefix`
pub async fn generate_vanity(prefix: &str, yield_every: u64) -> Result<ServiceKey, KeyError> {
    let prefix = validate_prefix(prefix)?;
    let mut attempts: u64 = 0;

    loop {
        let key = ServiceKey::generate();
        attempts += 1;

        if key.address().to_base32().starts_with(&prefix) {
            debug!(attempts, "found vanity address {}", key.address());
            return Ok(key);
        }

        if yield_every > 0 && attempts % yield_every == 0 {
            tokio::task::yield_now().await;
        }
    }
}
