//! Credential material for client-control-mode activation.

use md5::{Digest, Md5};
use rand::distributions::Alphanumeric;
use rand::Rng;

/// Account name the engine creates for the activated administrator.
pub const ADMIN_USER: &str = "admin";

const PASSWORD_PREFIX: &str = "P@0s";
const GENERATED_PASSWORD_LEN: usize = 23;

#[derive(Clone, PartialEq, Eq)]
pub struct AdminCredential {
    pub username: String,
    pub password: String,
}

impl AdminCredential {
    pub fn admin(password: impl Into<String>) -> Self {
        Self {
            username: ADMIN_USER.to_string(),
            password: password.into(),
        }
    }
}

impl std::fmt::Debug for AdminCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdminCredential")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Host-based setup digest: hex MD5 of `user:realm:password`, user lowercased,
/// limited to 32 hex characters.
pub fn activation_digest(username: &str, digest_realm: &str, password: &str) -> String {
    let input = format!("{}:{}:{}", username.to_lowercase(), digest_realm, password);
    let mut out = hex::encode(Md5::digest(input.as_bytes()));
    out.truncate(32);
    out
}

/// Random password meeting the engine's complexity rule (upper, lower,
/// digit and symbol are all guaranteed by the prefix).
pub fn generate_admin_password() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(GENERATED_PASSWORD_LEN)
        .map(char::from)
        .collect();
    format!("{}{}", PASSWORD_PREFIX, suffix)
}
