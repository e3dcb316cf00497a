//! Authentication and session management.
//!
//! Provides:
//! - Identity storage (human users and external systems) with Argon2id hashes
//! - HS256 bearer tokens carrying a pseudonymous subject and a session id
//! - A SQLite session registry that makes every token revocable
//! - A request-time gate combining token validation, session liveness and role
//!
//! ## Design Decisions
//! - No external JWT dependency: tokens are signed and verified with the
//!   existing `hmac` + `sha2` crates.
//! - A token is only honoured while its session row exists. Logout, password
//!   change, rename and delete all act by deleting session rows.
//! - Session ids are SHA-256 hashed for storage, like any other bearer secret.

pub mod error;
pub mod guard;
pub mod role;
pub mod secrets;
pub mod service;
pub mod store;
pub mod token;
pub mod traits;

pub use error::{AuthError, ErrorClass, StoreError};
pub use guard::{parse_authorization, AuthContext, AuthGuard};
pub use role::Role;
pub use secrets::{HashParams, SecretProvider};
pub use service::{AuthService, TokenPolicy};
pub use store::SqliteAuthStore;
pub use token::{derive_subject, Claims, IssuedToken, SigningKey, TokenError, TokenIssuer};
pub use traits::{CredentialStore, Identity, Session, SessionRegistry};
