//! Token verification for inbound connections.
//!
//! The dispatcher only needs `verify(token) -> identity`. Issuance lives with
//! the HTTP layer that owns login.

use common::jwt::{verify_hs256, DEFAULT_CLOCK_SKEW};
use common::secret::{ExposeSecret, SecretString};
use std::fmt;
use std::time::Duration;
use tracing::debug;

/// Who a valid token says the caller is.
#[derive(Clone, PartialEq, Eq)]
pub struct Identity {
    pub username: String,
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("username", &"[REDACTED]")
            .finish()
    }
}

/// Verifies a bearer token.
pub trait Authenticator: Send + Sync {
    /// Returns `None` for any invalid token. Callers never learn why.
    fn verify(&self, token: &str) -> Option<Identity>;
}

/// HS256 JWT verification with `sub` = username.
pub struct JwtAuthenticator {
    secret: SecretString,
    clock_skew: Duration,
}

impl JwtAuthenticator {
    #[must_use]
    pub fn new(secret: SecretString) -> Self {
        Self {
            secret,
            clock_skew: DEFAULT_CLOCK_SKEW,
        }
    }

    #[must_use]
    pub fn with_clock_skew(mut self, clock_skew: Duration) -> Self {
        self.clock_skew = clock_skew;
        self
    }
}

impl fmt::Debug for JwtAuthenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JwtAuthenticator")
            .field("secret", &"[REDACTED]")
            .field("clock_skew", &self.clock_skew)
            .finish()
    }
}

impl Authenticator for JwtAuthenticator {
    fn verify(&self, token: &str) -> Option<Identity> {
        match verify_hs256(
            token,
            self.secret.expose_secret().as_bytes(),
            self.clock_skew,
        ) {
            Ok(claims) if !claims.sub.is_empty() => Some(Identity {
                username: claims.sub,
            }),
            Ok(_) => {
                debug!(target: "rv.auth", "Token rejected: empty subject");
                None
            }
            Err(e) => {
                debug!(target: "rv.auth", error = %e, "Token rejected");
                None
            }
        }
    }
}
