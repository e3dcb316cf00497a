//! SQLite-backed credential store and session registry.
//!
//! Tables:
//! - `identities`: id, username, password_hash, role, created_at, updated_at
//! - `sessions`: session_hash, subject, created_at, expires_at
//!
//! Session ids are never stored in the clear; rows are keyed by their
//! SHA-256 digest.

use super::error::StoreError;
use super::role::Role;
use super::traits::{CredentialStore, Identity, Session, SessionRegistry};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::time::Duration;

/// SQLite implementation of both storage contracts.
pub struct SqliteAuthStore {
    conn: Mutex<rusqlite::Connection>,
    /// Live-session cap per subject; `0` means unlimited.
    max_sessions_per_subject: u32,
}

impl SqliteAuthStore {
    /// Open (or create) the auth database at the given path.
    pub fn open(
        db_path: &Path,
        busy_timeout_ms: u64,
        max_sessions_per_subject: u32,
    ) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::Corrupt(format!("cannot create {}: {e}", parent.display()))
                })?;
            }
        }
        let conn = rusqlite::Connection::open(db_path)?;
        // WAL mode for concurrent reads + crash safety
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )?;
        Self::init(conn, busy_timeout_ms, max_sessions_per_subject)
    }

    /// Private in-memory database, used by tests and throwaway tooling.
    pub fn open_in_memory(max_sessions_per_subject: u32) -> Result<Self, StoreError> {
        let conn = rusqlite::Connection::open_in_memory()?;
        Self::init(conn, 0, max_sessions_per_subject)
    }

    fn init(
        conn: rusqlite::Connection,
        busy_timeout_ms: u64,
        max_sessions_per_subject: u32,
    ) -> Result<Self, StoreError> {
        if busy_timeout_ms > 0 {
            conn.busy_timeout(Duration::from_millis(busy_timeout_ms))?;
        }
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS identities (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                username TEXT NOT NULL UNIQUE,
                password_hash TEXT NOT NULL,
                role TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_identities_role ON identities(role);

            CREATE TABLE IF NOT EXISTS sessions (
                session_hash TEXT PRIMARY KEY,
                subject TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_sessions_subject ON sessions(subject);
            CREATE INDEX IF NOT EXISTS idx_sessions_expires ON sessions(expires_at);",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
            max_sessions_per_subject,
        })
    }

    pub fn max_sessions_per_subject(&self) -> u32 {
        self.max_sessions_per_subject
    }

    /// Count all identities, regardless of role.
    pub fn identity_count(&self) -> Result<u64, StoreError> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM identities", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}

type IdentityRow = (i64, String, String, String, i64, i64);

const IDENTITY_COLUMNS: &str = "id, username, password_hash, role, created_at, updated_at";

fn read_identity_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<IdentityRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn into_identity(raw: IdentityRow) -> Result<Identity, StoreError> {
    let (id, username, password_hash, role, created_at, updated_at) = raw;
    let role = role
        .parse::<Role>()
        .map_err(|e| StoreError::Corrupt(format!("identity {id}: {e}")))?;
    Ok(Identity {
        id,
        username,
        password_hash,
        role,
        created_at,
        updated_at,
    })
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

impl CredentialStore for SqliteAuthStore {
    fn find_by_username(&self, username: &str) -> Result<Option<Identity>, StoreError> {
        let conn = self.conn.lock();
        let row = conn.query_row(
            &format!("SELECT {IDENTITY_COLUMNS} FROM identities WHERE username = ?1"),
            rusqlite::params![username],
            read_identity_row,
        );

        match row {
            Ok(raw) => into_identity(raw).map(Some),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn find_by_role(&self, role: Role) -> Result<Vec<Identity>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {IDENTITY_COLUMNS} FROM identities WHERE role = ?1 ORDER BY username"
        ))?;
        let rows = stmt
            .query_map(rusqlite::params![role.as_str()], read_identity_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(into_identity).collect()
    }

    fn insert(
        &self,
        username: &str,
        password_hash: &str,
        role: Role,
    ) -> Result<Identity, StoreError> {
        let now = epoch_secs();
        let conn = self.conn.lock();
        let result = conn.execute(
            "INSERT INTO identities (username, password_hash, role, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)",
            rusqlite::params![username, password_hash, role.as_str(), now],
        );

        match result {
            Ok(_) => Ok(Identity {
                id: conn.last_insert_rowid(),
                username: username.to_string(),
                password_hash: password_hash.to_string(),
                role,
                created_at: now,
                updated_at: now,
            }),
            Err(e) if is_constraint_violation(&e) => Err(StoreError::Conflict(username.into())),
            Err(e) => Err(e.into()),
        }
    }

    fn update_hash(&self, id: i64, password_hash: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE identities SET password_hash = ?1, updated_at = ?2 WHERE id = ?3",
            rusqlite::params![password_hash, epoch_secs(), id],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    fn update_username(&self, old: &str, new: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        let result = conn.execute(
            "UPDATE identities SET username = ?1, updated_at = ?2 WHERE username = ?3",
            rusqlite::params![new, epoch_secs(), old],
        );
        match result {
            Ok(0) => Err(StoreError::NotFound),
            Ok(_) => Ok(()),
            Err(e) if is_constraint_violation(&e) => Err(StoreError::Conflict(new.into())),
            Err(e) => Err(e.into()),
        }
    }

    fn delete_by_username(&self, username: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM identities WHERE username = ?1",
            rusqlite::params![username],
        )?;
        Ok(deleted > 0)
    }
}

impl SessionRegistry for SqliteAuthStore {
    fn create_session(&self, session: &Session) -> Result<(), StoreError> {
        let session_hash = hash_session_id(&session.session_id);
        let now = epoch_secs();

        let mut conn = self.conn.lock();
        // Count and insert under one transaction so concurrent logins
        // cannot both slip under the cap.
        let tx = conn.transaction()?;
        if self.max_sessions_per_subject > 0 {
            let live: i64 = tx.query_row(
                "SELECT COUNT(*) FROM sessions WHERE subject = ?1 AND expires_at > ?2",
                rusqlite::params![session.subject, now],
                |row| row.get(0),
            )?;
            if live >= i64::from(self.max_sessions_per_subject) {
                return Err(StoreError::SessionLimitReached(self.max_sessions_per_subject));
            }
        }
        let result = tx.execute(
            "INSERT INTO sessions (session_hash, subject, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![session_hash, session.subject, now, session.expires_at],
        );
        match result {
            Ok(_) => {}
            Err(e) if is_constraint_violation(&e) => {
                return Err(StoreError::Conflict("session id".into()))
            }
            Err(e) => return Err(e.into()),
        }
        tx.commit()?;
        Ok(())
    }

    fn is_session_valid(&self, session_id: &str, subject: &str) -> Result<bool, StoreError> {
        let session_hash = hash_session_id(session_id);
        let conn = self.conn.lock();
        let row = conn.query_row(
            "SELECT expires_at FROM sessions WHERE session_hash = ?1 AND subject = ?2",
            rusqlite::params![session_hash, subject],
            |row| row.get::<_, i64>(0),
        );

        let expires_at = match row {
            Ok(expires_at) => expires_at,
            Err(rusqlite::Error::QueryReturnedNoRows) => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        if expires_at > epoch_secs() {
            return Ok(true);
        }
        conn.execute(
            "DELETE FROM sessions WHERE session_hash = ?1",
            rusqlite::params![session_hash],
        )?;
        Ok(false)
    }

    fn delete_session_by_id(&self, session_id: &str) -> Result<bool, StoreError> {
        let session_hash = hash_session_id(session_id);
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM sessions WHERE session_hash = ?1",
            rusqlite::params![session_hash],
        )?;
        Ok(deleted > 0)
    }

    fn delete_all_sessions_by_subject(&self, subject: &str) -> Result<u64, StoreError> {
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM sessions WHERE subject = ?1",
            rusqlite::params![subject],
        )?;
        Ok(deleted as u64)
    }

    fn count_live_sessions(&self, subject: &str) -> Result<u64, StoreError> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sessions WHERE subject = ?1 AND expires_at > ?2",
            rusqlite::params![subject, epoch_secs()],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn cleanup_expired_sessions(&self) -> Result<u64, StoreError> {
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM sessions WHERE expires_at <= ?1",
            rusqlite::params![epoch_secs()],
        )?;
        Ok(deleted as u64)
    }
}

/// SHA-256 of a session id. Single pass; ids are already high-entropy.
fn hash_session_id(session_id: &str) -> String {
    hex::encode(Sha256::digest(session_id.as_bytes()))
}

/// Current Unix epoch in seconds.
fn epoch_secs() -> i64 {
    chrono::Utc::now().timestamp()
}
