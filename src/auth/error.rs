//! Error taxonomy for the auth subsystem.
//!
//! Credential and session faults surface to callers as "unauthorized" or
//! "forbidden"; store and entropy faults surface as a generic server fault.
//! [`AuthError::public_message`] is the only text that should ever reach an
//! HTTP client.

use super::secrets::SecretError;
use super::token::TokenError;

/// Failures reported by a [`CredentialStore`](super::CredentialStore) or
/// [`SessionRegistry`](super::SessionRegistry).
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("record not found")]
    NotFound,
    #[error("record already exists: {0}")]
    Conflict(String),
    #[error("session limit of {0} reached for subject")]
    SessionLimitReached(u32),
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("identity not found")]
    IdentityNotFound,
    #[error("credential mismatch")]
    CredentialMismatch,
    #[error("identity already exists: {0}")]
    IdentityExists(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("password hashing failed: {0}")]
    HashingFailure(String),
    #[error("secure random source unavailable")]
    EntropyUnavailable,
    #[error("missing credential")]
    MissingCredential,
    #[error("malformed credential")]
    MalformedCredential,
    #[error("invalid token: {0}")]
    InvalidToken(#[from] TokenError),
    #[error("session revoked or expired")]
    SessionRevoked,
    #[error("session limit reached")]
    SessionLimitReached,
    #[error("forbidden")]
    Forbidden,
    #[error("store persistence error: {0}")]
    StorePersistence(#[source] StoreError),
    #[error("background task failed: {0}")]
    Internal(String),
}

/// How a failure should be presented at the service boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    BadRequest,
    Unauthorized,
    Forbidden,
    Conflict,
    ServerFault,
}

impl AuthError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::InvalidInput(_) => ErrorClass::BadRequest,
            Self::IdentityNotFound
            | Self::CredentialMismatch
            | Self::MissingCredential
            | Self::MalformedCredential
            | Self::InvalidToken(_)
            | Self::SessionRevoked => ErrorClass::Unauthorized,
            Self::Forbidden => ErrorClass::Forbidden,
            Self::IdentityExists(_) | Self::SessionLimitReached => ErrorClass::Conflict,
            Self::HashingFailure(_)
            | Self::EntropyUnavailable
            | Self::StorePersistence(_)
            | Self::Internal(_) => ErrorClass::ServerFault,
        }
    }

    pub fn status_code(&self) -> u16 {
        match self.class() {
            ErrorClass::BadRequest => 400,
            ErrorClass::Unauthorized => 401,
            ErrorClass::Forbidden => 403,
            ErrorClass::Conflict => 409,
            ErrorClass::ServerFault => 500,
        }
    }

    /// Client-facing message. "Not found" and "wrong password" are
    /// deliberately identical; server faults never leak internals.
    pub fn public_message(&self) -> String {
        match self {
            Self::IdentityNotFound | Self::CredentialMismatch => "Wrong credentials".into(),
            Self::IdentityExists(name) => format!("Identity '{name}' already exists"),
            Self::InvalidInput(msg) => msg.clone(),
            Self::MissingCredential => "Missing Authorization header".into(),
            Self::MalformedCredential => "Token Error".into(),
            Self::InvalidToken(_) | Self::SessionRevoked => "Unauthorized".into(),
            Self::SessionLimitReached => "Too many active sessions".into(),
            Self::Forbidden => "Forbidden".into(),
            Self::HashingFailure(_)
            | Self::EntropyUnavailable
            | Self::StorePersistence(_)
            | Self::Internal(_) => "Internal Server Error".into(),
        }
    }
}

impl From<StoreError> for AuthError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::SessionLimitReached(_) => Self::SessionLimitReached,
            StoreError::Conflict(name) => Self::IdentityExists(name),
            other => Self::StorePersistence(other),
        }
    }
}

impl From<SecretError> for AuthError {
    fn from(err: SecretError) -> Self {
        match err {
            SecretError::EntropyUnavailable(_) => Self::EntropyUnavailable,
            SecretError::Hashing(msg) => Self::HashingFailure(msg),
        }
    }
}
