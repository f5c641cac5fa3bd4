//! Credential record model
//!
//! A [`CredentialRecord`] is built by the record loader on every successful
//! parse and never mutated afterwards. The secret is never rendered by
//! `Debug`, and the username is only ever shown masked.

use chrono::{DateTime, Utc};
use rand::Rng;
use std::fmt;

/// Number of leading username characters left visible by [`mask_username`]
const VISIBLE_PREFIX: usize = 3;

/// Credentials for the managed service account
#[derive(Clone, PartialEq, Eq)]
pub struct CredentialRecord {
    username: String,
    secret: String,
    observed_at: DateTime<Utc>,
}

impl CredentialRecord {
    /// Create a record observed at the given storage modification time
    pub fn new(
        username: impl Into<String>,
        secret: impl Into<String>,
        observed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            username: username.into(),
            secret: secret.into(),
            observed_at,
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// The raw secret. Only targets applying the credentials should read this.
    pub fn secret(&self) -> &str {
        &self.secret
    }

    /// Storage-reported modification time of the record this value was parsed from
    pub fn observed_at(&self) -> DateTime<Utc> {
        self.observed_at
    }

    /// Username safe for logs and error messages
    pub fn masked_username(&self) -> String {
        mask_username(&self.username)
    }
}

impl fmt::Debug for CredentialRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialRecord")
            .field("username", &self.masked_username())
            .field("secret", &"<redacted>")
            .field("observed_at", &self.observed_at)
            .finish()
    }
}

/// Mask a username for display.
///
/// Keeps the first three characters and replaces the rest with `*`.
/// Usernames of three characters or fewer are fully masked as `***`.
pub fn mask_username(username: &str) -> String {
    let len = username.chars().count();
    if len <= VISIBLE_PREFIX {
        return "***".to_string();
    }

    let prefix: String = username.chars().take(VISIBLE_PREFIX).collect();
    format!("{}{}", prefix, "*".repeat(len - VISIBLE_PREFIX))
}

/// Generate a random secret
pub fn generate_secret(length: usize) -> String {
    const CHARSET: &[u8] =
        b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789!@#$%^&*";
    let mut rng = rand::thread_rng();
    (0..length)
        .map(|_| {
            let idx = rng.gen_range(0..CHARSET.len());
            CHARSET[idx] as char
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_short_usernames() {
        assert_eq!(mask_username(""), "***");
        assert_eq!(mask_username("a"), "***");
        assert_eq!(mask_username("ab"), "***");
        assert_eq!(mask_username("abc"), "***");
    }

    #[test]
    fn test_mask_long_usernames() {
        assert_eq!(mask_username("abcd"), "abc*");
        assert_eq!(mask_username("alice"), "ali**");
        assert_eq!(mask_username("serviceaccount"), "ser***********");
    }

    #[test]
    fn test_mask_counts_characters_not_bytes() {
        assert_eq!(mask_username("ñandú"), "ñan**");
        assert_eq!(mask_username("über"), "übe*");
    }

    #[test]
    fn test_debug_redacts_secret() {
        let record = CredentialRecord::new("alice", "hunter2-very-secret", Utc::now());
        let rendered = format!("{:?}", record);

        assert!(rendered.contains("ali**"));
        assert!(rendered.contains("<redacted>"));
        assert!(!rendered.contains("hunter2"));
        assert!(!rendered.contains("alice"));
    }

    #[test]
    fn test_generate_secret() {
        let secret = generate_secret(32);
        assert_eq!(secret.len(), 32);

        let secret2 = generate_secret(32);
        assert_ne!(secret, secret2);
    }
}
