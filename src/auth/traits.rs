//! Storage contracts for the auth subsystem.
//!
//! Both contracts are blocking calls; the service treats them as its only
//! suspension points. Implementations must give per-row atomicity and
//! read-after-write consistency for a single subject's rows.

use super::error::StoreError;
use super::role::Role;

/// A stored principal: a human user or an external system.
#[derive(Clone, PartialEq, Eq)]
pub struct Identity {
    pub id: i64,
    pub username: String,
    pub password_hash: String,
    pub role: Role,
    pub created_at: i64,
    pub updated_at: i64,
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("id", &self.id)
            .field("username", &self.username)
            .field("password_hash", &"[redacted]")
            .field("role", &self.role)
            .field("created_at", &self.created_at)
            .field("updated_at", &self.updated_at)
            .finish()
    }
}

/// One server-side session, created per successful login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub session_id: String,
    pub subject: String,
    /// Unix seconds. The session is live while `expires_at > now`.
    pub expires_at: i64,
}

/// Persistence for identities. "Not found" is `Ok(None)` or
/// [`StoreError::NotFound`], never a generic fault.
pub trait CredentialStore: Send + Sync {
    fn find_by_username(&self, username: &str) -> Result<Option<Identity>, StoreError>;

    fn find_by_role(&self, role: Role) -> Result<Vec<Identity>, StoreError>;

    /// Fails with [`StoreError::Conflict`] when the username is taken.
    fn insert(&self, username: &str, password_hash: &str, role: Role)
        -> Result<Identity, StoreError>;

    fn update_hash(&self, id: i64, password_hash: &str) -> Result<(), StoreError>;

    fn update_username(&self, old: &str, new: &str) -> Result<(), StoreError>;

    /// Returns whether a row was removed.
    fn delete_by_username(&self, username: &str) -> Result<bool, StoreError>;
}

/// Authoritative record of live sessions.
pub trait SessionRegistry: Send + Sync {
    fn create_session(&self, session: &Session) -> Result<(), StoreError>;

    /// True iff a row for `(session_id, subject)` exists and has not expired.
    /// Expired rows found here are deleted on the spot.
    fn is_session_valid(&self, session_id: &str, subject: &str) -> Result<bool, StoreError>;

    /// Idempotent; returns whether a row was removed.
    fn delete_session_by_id(&self, session_id: &str) -> Result<bool, StoreError>;

    /// Idempotent; returns the number of rows removed.
    fn delete_all_sessions_by_subject(&self, subject: &str) -> Result<u64, StoreError>;

    fn count_live_sessions(&self, subject: &str) -> Result<u64, StoreError>;

    fn cleanup_expired_sessions(&self) -> Result<u64, StoreError>;
}
