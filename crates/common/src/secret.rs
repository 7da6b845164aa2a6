//! Secret types for protecting sensitive values from accidental logging.
//!
//! Re-exports the [`secrecy`] types used for the JWT signing secret and for
//! raw client tokens while they are being verified.
//!
//! `SecretString` implements `Debug` with redaction, so a struct that derives
//! `Debug` and holds one is safe to log with `{:?}` or through tracing. The
//! value is reachable only through an explicit `expose_secret()` call and is
//! zeroized on drop.
//!
//! # Example
//!
//! ```rust
//! use common::secret::{ExposeSecret, SecretString};
//!
//! #[derive(Debug)]
//! struct AuthSettings {
//!     issuer: String,
//!     signing_secret: SecretString,
//! }
//!
//! let settings = AuthSettings {
//!     issuer: "rendezvous".to_string(),
//!     signing_secret: SecretString::from("change-me"),
//! };
//!
//! assert!(!format!("{settings:?}").contains("change-me"));
//! assert_eq!(settings.signing_secret.expose_secret(), "change-me");
//! ```

pub use secrecy::{ExposeSecret, SecretBox, SecretString};
