//! Session token minting.

use chrono::Utc;
use common::jwt::UserClaims;
use common::secret::SecretString;
use jsonwebtoken::{encode, EncodingKey, Header};
use std::time::Duration;

/// Secret shared by [`TestTokens`] and harness authenticators.
pub const TEST_JWT_SECRET: &str = "rendezvous-test-secret-0123456789abcdef";

/// Mints HS256 session tokens.
#[derive(Debug, Clone)]
pub struct TestTokens {
    secret: String,
}

impl Default for TestTokens {
    fn default() -> Self {
        Self::new(TEST_JWT_SECRET)
    }
}

impl TestTokens {
    #[must_use]
    pub fn new(secret: &str) -> Self {
        Self {
            secret: secret.to_string(),
        }
    }

    /// The secret as the service would load it.
    #[must_use]
    pub fn secret(&self) -> SecretString {
        SecretString::from(self.secret.clone())
    }

    /// A token for `username`, valid for an hour.
    #[must_use]
    pub fn mint(&self, username: &str) -> String {
        self.sign(&UserClaims::new(
            username,
            Utc::now().timestamp(),
            Duration::from_secs(3600),
        ))
    }

    /// A token for `username` that expired an hour ago.
    #[must_use]
    pub fn expired(&self, username: &str) -> String {
        let now = Utc::now().timestamp();
        self.sign(&UserClaims {
            sub: username.to_string(),
            exp: now - 3600,
            iat: now - 7200,
        })
    }

    /// Sign arbitrary claims.
    #[must_use]
    pub fn sign(&self, claims: &UserClaims) -> String {
        encode(
            &Header::default(),
            claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .expect("HS256 encoding never fails for valid claims")
    }
}
