mod keypair;
mod vanity;

pub use keypair::{KeyError, ServiceKey};
pub use vanity::{generate_vanity, validate_prefix};
