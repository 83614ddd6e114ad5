//! Bearer-token auth store.
//!
//! The daemon issues a single long-lived token, persisted in the config
//! table. Validation is a constant-time compare so the handshake leaks
//! nothing about the stored value.

use anyhow::Result;
use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::db::Database;

const TOKEN_KEY: &str = "auth_token";
const TOKEN_LEN: usize = 32;

/// Issues and validates the daemon's bearer token.
#[derive(Clone)]
pub struct AuthStore {
    db: Database,
}

impl AuthStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// The current token, generating and persisting one on first use.
    pub async fn token(&self) -> Result<String> {
        if let Some(token) = self.db.get_config(TOKEN_KEY).await? {
            return Ok(token);
        }
        let token = generate_token();
        self.db.set_config(TOKEN_KEY, &token).await?;
        Ok(token)
    }

    /// Replace the token, invalidating all existing clients.
    pub async fn rotate(&self) -> Result<String> {
        let token = generate_token();
        self.db.set_config(TOKEN_KEY, &token).await?;
        Ok(token)
    }

    /// Validate a presented token.
    pub async fn verify(&self, presented: &str) -> Result<bool> {
        let stored = self.token().await?;
        Ok(constant_time_eq(stored.as_bytes(), presented.as_bytes()))
    }
}

fn generate_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_LEN)
        .map(char::from)
        .collect()
}

/// Compare two byte strings without an early exit on mismatch.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_eq_basics() {
        assert!(constant_time_eq(b"secret", b"secret"));
        assert!(!constant_time_eq(b"secret", b"secre7"));
        assert!(!constant_time_eq(b"secret", b"secretx"));
        assert!(!constant_time_eq(b"secret", b""));
        assert!(constant_time_eq(b"", b""));
    }

    #[tokio::test]
    async fn token_is_stable_until_rotated() {
        let db = Database::in_memory().await.unwrap();
        let auth = AuthStore::new(db);

        let first = auth.token().await.unwrap();
        assert_eq!(first.len(), TOKEN_LEN);
        assert_eq!(auth.token().await.unwrap(), first);
        assert!(auth.verify(&first).await.unwrap());
        assert!(!auth.verify("nope").await.unwrap());

        let second = auth.rotate().await.unwrap();
        assert_ne!(first, second);
        assert!(!auth.verify(&first).await.unwrap());
        assert!(auth.verify(&second).await.unwrap());
    }
}
