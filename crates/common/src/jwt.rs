//! JWT utilities shared across Rendezvous components.
//!
//! Client sessions present an HS256 token whose `sub` claim is the account
//! username. This module owns:
//! - Size limits for DoS prevention
//! - Clock skew constants for iat validation
//! - The user claims structure
//! - HS256 verification
//!
//! # Security
//!
//! - Tokens are size-checked BEFORE parsing (DoS prevention)
//! - Only HS256 is accepted
//! - Generic error messages prevent information leakage
//! - The `sub` field in claims is redacted in Debug output
//!
//! # Usage
//!
//! ```rust,ignore
//! use common::jwt::{verify_hs256, DEFAULT_CLOCK_SKEW};
//!
//! let claims = verify_hs256(token, secret.expose_secret().as_bytes(), DEFAULT_CLOCK_SKEW)?;
//! let username = claims.sub;
//! ```

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

// =============================================================================
// Constants
// =============================================================================

/// Maximum allowed JWT size in bytes (8KB).
///
/// Tokens larger than this are rejected before any decoding or signature
/// work. Typical user tokens are well under 500 bytes.
pub const MAX_JWT_SIZE_BYTES: usize = 8192; // 8KB

/// Default JWT clock skew tolerance (5 minutes).
///
/// Tokens with `iat` more than this far in the future are rejected, and
/// `exp` is checked with the same leeway.
pub const DEFAULT_CLOCK_SKEW: Duration = Duration::from_secs(300);

/// Maximum allowed JWT clock skew tolerance (10 minutes).
pub const MAX_CLOCK_SKEW: Duration = Duration::from_secs(600);

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur during JWT validation.
///
/// Every variant renders the same message so callers cannot tell a bad
/// signature from an expired token. Details are logged at debug level.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JwtValidationError {
    /// Token size exceeds maximum allowed.
    #[error("The access token is invalid or expired")]
    TokenTooLarge,

    /// Token format is invalid (not a valid JWT structure).
    #[error("The access token is invalid or expired")]
    MalformedToken,

    /// Signature, algorithm, or expiry check failed.
    #[error("The access token is invalid or expired")]
    VerificationFailed,

    /// Token `iat` claim is too far in the future.
    #[error("The access token is invalid or expired")]
    IatTooFarInFuture,
}

// =============================================================================
// Claims Types
// =============================================================================

/// Claims carried by a client session token.
///
/// - `sub`: account username
/// - `exp`: expiration timestamp (Unix epoch seconds)
/// - `iat`: issued-at timestamp (Unix epoch seconds)
#[derive(Clone, Serialize, Deserialize)]
pub struct UserClaims {
    /// Subject (username) - redacted in Debug output.
    pub sub: String,

    /// Expiration timestamp (Unix epoch seconds).
    pub exp: i64,

    /// Issued-at timestamp (Unix epoch seconds).
    #[serde(default)]
    pub iat: i64,
}

impl fmt::Debug for UserClaims {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserClaims")
            .field("sub", &"[REDACTED]")
            .field("exp", &self.exp)
            .field("iat", &self.iat)
            .finish()
    }
}

impl UserClaims {
    /// Creates claims for `sub` valid for `ttl` from `now` (Unix seconds).
    #[must_use]
    pub fn new(sub: impl Into<String>, now: i64, ttl: Duration) -> Self {
        // ttl is bounded by token issuance policy (hours), well within i64
        #[allow(clippy::cast_possible_wrap)]
        let ttl_secs = ttl.as_secs() as i64;
        Self {
            sub: sub.into(),
            exp: now + ttl_secs,
            iat: now,
        }
    }
}

// =============================================================================
// Functions
// =============================================================================

/// Verify an HS256 token and return its claims.
///
/// Checks, in order: size, signature and `exp` (with `clock_skew` leeway),
/// then `iat`.
///
/// # Errors
///
/// - `TokenTooLarge` - token exceeds `MAX_JWT_SIZE_BYTES`
/// - `MalformedToken` - not a three-part JWT
/// - `VerificationFailed` - bad signature, wrong algorithm, or expired
/// - `IatTooFarInFuture` - issued in the future beyond `clock_skew`
pub fn verify_hs256(
    token: &str,
    secret: &[u8],
    clock_skew: Duration,
) -> Result<UserClaims, JwtValidationError> {
    if token.len() > MAX_JWT_SIZE_BYTES {
        tracing::debug!(
            target: "common.jwt",
            token_size = token.len(),
            max_size = MAX_JWT_SIZE_BYTES,
            "Token rejected: size exceeds maximum allowed"
        );
        return Err(JwtValidationError::TokenTooLarge);
    }

    if token.split('.').count() != 3 {
        tracing::debug!(target: "common.jwt", "Token rejected: invalid JWT format");
        return Err(JwtValidationError::MalformedToken);
    }

    let clock_skew = clock_skew.min(MAX_CLOCK_SKEW);
    let mut validation = Validation::new(Algorithm::HS256);
    validation.leeway = clock_skew.as_secs();
    validation.set_required_spec_claims(&["exp", "sub"]);

    let data = decode::<UserClaims>(token, &DecodingKey::from_secret(secret), &validation)
        .map_err(|e| {
            tracing::debug!(target: "common.jwt", error = %e, "Token rejected: verification failed");
            JwtValidationError::VerificationFailed
        })?;

    validate_iat(data.claims.iat, clock_skew)?;

    Ok(data.claims)
}

/// Validate the `iat` (issued-at) claim with clock skew tolerance.
///
/// # Errors
///
/// Returns `JwtValidationError::IatTooFarInFuture` if the iat timestamp is more than
/// `clock_skew` in the future.
pub fn validate_iat(iat: i64, clock_skew: Duration) -> Result<(), JwtValidationError> {
    let now = chrono::Utc::now().timestamp();
    validate_iat_at(iat, clock_skew, now)
}

/// Deterministic `iat` validation against an explicit `now` timestamp.
pub(crate) fn validate_iat_at(
    iat: i64,
    clock_skew: Duration,
    now: i64,
) -> Result<(), JwtValidationError> {
    // Safe cast: clock_skew is bounded to MAX_CLOCK_SKEW (600 seconds), well within i64 range
    #[allow(clippy::cast_possible_wrap)]
    let clock_skew_secs = clock_skew.as_secs() as i64;
    let max_iat = now + clock_skew_secs;

    if iat > max_iat {
        tracing::debug!(
            target: "common.jwt",
            iat = iat,
            now = now,
            max_allowed = max_iat,
            "Token rejected: iat too far in the future"
        );
        return Err(JwtValidationError::IatTooFarInFuture);
    }

    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
