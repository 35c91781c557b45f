/// Proxy credentials
///
/// A credential pair is an opaque `(user, pass)` couple checked by exact
/// match. Missing fields are filled from the OS random source.

use crate::config::proxy::{GENERATED_PASS_LEN, GENERATED_USER_LEN};
use data_encoding::BASE64URL_NOPAD;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Username/password pair accepted by the local proxy
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Credentials {
    pub user: String,
    pub pass: String,
}

impl Credentials {
    pub fn new(user: impl Into<String>, pass: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            pass: pass.into(),
        }
    }

    /// Generate a fully random pair
    pub fn random() -> Self {
        Self::create(None, None)
    }

    /// Use the supplied fields, generating whichever is missing
    pub fn create(user: Option<String>, pass: Option<String>) -> Self {
        Self {
            user: user.unwrap_or_else(|| generate_token(GENERATED_USER_LEN)),
            pass: pass.unwrap_or_else(|| generate_token(GENERATED_PASS_LEN)),
        }
    }

    /// Exact match on both fields
    pub fn matches(&self, user: &str, pass: &str) -> bool {
        self.user == user && self.pass == pass
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("pass", &"<redacted>")
            .finish()
    }
}

/// Linear scan for a pair matching `user` and `pass`
pub fn find_matching<'a>(
    auths: &'a [Credentials],
    user: &str,
    pass: &str,
) -> Option<&'a Credentials> {
    auths.iter().find(|auth| auth.matches(user, pass))
}

/// Random token of exactly `len` alphanumeric characters
///
/// Random bytes are encoded as URL-safe base64 and every non-alphanumeric
/// character is dropped; the source is drawn again until enough characters
/// remain.
pub fn generate_token(len: usize) -> String {
    let mut rng = OsRng;
    let mut token = String::with_capacity(len);

    while token.len() < len {
        let mut bytes = vec![0u8; len.max(16)];
        rng.fill_bytes(&mut bytes);
        token.extend(
            BASE64URL_NOPAD
                .encode(&bytes)
                .chars()
                .filter(|c| c.is_ascii_alphanumeric()),
        );
    }

    token.truncate(len);
    token
}
