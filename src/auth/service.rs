//! Authentication orchestration: login, logout, credential change, and
//! management of external-system identities.
//!
//! Every method here is blocking (store I/O plus Argon2 work). Async callers
//! run them through `tokio::task::spawn_blocking`.

use super::error::{AuthError, StoreError};
use super::role::Role;
use super::secrets::SecretProvider;
use super::token::{derive_subject, Claims, IssuedToken, TokenIssuer};
use super::traits::{CredentialStore, Identity, Session, SessionRegistry};
use std::sync::Arc;

/// Random bytes per session id (256 bits).
const SESSION_ID_BYTES: usize = 32;

/// Random bytes per external-system access key.
const ACCESS_KEY_BYTES: usize = 32;

const MAX_USERNAME_CHARS: usize = 64;
const MIN_PASSWORD_CHARS: usize = 8;
const SYSTEM_NAME_CHARS: std::ops::RangeInclusive<usize> = 4..=32;

/// Token lifetimes per kind of principal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenPolicy {
    pub user_ttl_minutes: i64,
    pub ext_sys_ttl_minutes: i64,
}

impl Default for TokenPolicy {
    fn default() -> Self {
        Self {
            user_ttl_minutes: 60,
            ext_sys_ttl_minutes: 36_000,
        }
    }
}

impl TokenPolicy {
    pub fn ttl_for(&self, role: Role) -> i64 {
        match role {
            Role::ExtSys => self.ext_sys_ttl_minutes,
            Role::Admin | Role::User => self.user_ttl_minutes,
        }
    }
}

/// Shorten a subject for log output.
pub(crate) fn log_subject(subject: &str) -> &str {
    subject.get(..12).unwrap_or(subject)
}

pub struct AuthService {
    credentials: Arc<dyn CredentialStore>,
    sessions: Arc<dyn SessionRegistry>,
    issuer: Arc<TokenIssuer>,
    secrets: Arc<SecretProvider>,
    policy: TokenPolicy,
}

impl AuthService {
    pub fn new(
        credentials: Arc<dyn CredentialStore>,
        sessions: Arc<dyn SessionRegistry>,
        issuer: Arc<TokenIssuer>,
        secrets: Arc<SecretProvider>,
        policy: TokenPolicy,
    ) -> Self {
        Self {
            credentials,
            sessions,
            issuer,
            secrets,
            policy,
        }
    }

    pub fn issuer(&self) -> &Arc<TokenIssuer> {
        &self.issuer
    }

    pub fn sessions(&self) -> &Arc<dyn SessionRegistry> {
        &self.sessions
    }

    pub fn policy(&self) -> TokenPolicy {
        self.policy
    }

    // ── Login / logout ──────────────────────────────────────────────

    /// Check `username`/`password` and mint a session-backed token.
    ///
    /// `Ok(None)` means the password did not match. A missing identity is
    /// `Err(IdentityNotFound)`; the HTTP layer reports both the same way.
    pub fn authenticate(
        &self,
        username: &str,
        password: &str,
        ttl_minutes: i64,
    ) -> Result<Option<IssuedToken>, AuthError> {
        let Some(identity) = self.credentials.find_by_username(username)? else {
            self.secrets.dummy_verify(password);
            return Err(AuthError::IdentityNotFound);
        };
        if !self.secrets.verify_password(password, &identity.password_hash)? {
            tracing::info!(identity_id = identity.id, "Login rejected: credential mismatch");
            return Ok(None);
        }
        self.open_session(&identity, ttl_minutes).map(Some)
    }

    /// Login for external systems. Only `ext_sys` identities qualify; any
    /// other role is reported as a mismatch.
    pub fn authenticate_external_system(
        &self,
        system_name: &str,
        access_key: &str,
    ) -> Result<Option<IssuedToken>, AuthError> {
        let Some(identity) = self.credentials.find_by_username(system_name)? else {
            self.secrets.dummy_verify(access_key);
            return Err(AuthError::IdentityNotFound);
        };
        let key_matches = self.secrets.verify_password(access_key, &identity.password_hash)?;
        if identity.role != Role::ExtSys || !key_matches {
            tracing::info!(identity_id = identity.id, "External system login rejected");
            return Ok(None);
        }
        self.open_session(&identity, self.policy.ext_sys_ttl_minutes)
            .map(Some)
    }

    /// Mint a token and persist its session. If persistence fails the
    /// token is dropped; it would never pass the liveness check.
    fn open_session(&self, identity: &Identity, ttl_minutes: i64) -> Result<IssuedToken, AuthError> {
        let session_id = self.secrets.generate_random_token(SESSION_ID_BYTES)?;
        let subject = derive_subject(&identity.username, identity.id);
        let issued = self.issuer.issue_token(
            &identity.username,
            &subject,
            identity.role,
            &session_id,
            ttl_minutes,
        )
        .map_err(|e| AuthError::Internal(format!("token issuance failed: {e}")))?;
        let session = Session {
            session_id,
            subject,
            expires_at: issued.claims.exp,
        };
        if let Err(e) = self.sessions.create_session(&session) {
            tracing::warn!(
                subject = log_subject(&session.subject),
                "Session not persisted, discarding token: {e}"
            );
            return Err(e.into());
        }
        self.confirm_identity_unchanged(identity, &session)?;
        tracing::info!(
            subject = log_subject(&session.subject),
            role = %identity.role,
            "Session opened"
        );
        Ok(issued)
    }

    /// Re-read the identity after its session row exists. A credential
    /// change, rename or delete that finished while the password was being
    /// verified has already run its revocation, so the new row is removed
    /// here instead.
    fn confirm_identity_unchanged(
        &self,
        verified: &Identity,
        session: &Session,
    ) -> Result<(), AuthError> {
        let current = self.credentials.find_by_username(&verified.username);
        let unchanged = matches!(
            &current,
            Ok(Some(now)) if now.id == verified.id && now.password_hash == verified.password_hash
        );
        if unchanged {
            return Ok(());
        }
        if let Err(e) = self.sessions.delete_session_by_id(&session.session_id) {
            tracing::error!(
                subject = log_subject(&session.subject),
                "Failed to drop session opened against a changed identity: {e}"
            );
            return Err(AuthError::StorePersistence(e));
        }
        current?;
        tracing::info!(
            subject = log_subject(&session.subject),
            "Identity changed during login, session dropped"
        );
        Err(AuthError::CredentialMismatch)
    }

    /// Single-session logout for the presented token.
    pub fn revoke_session(&self, token: &str) -> Result<bool, AuthError> {
        let claims = self.issuer.validate_token(token)?;
        let removed = self.sessions.delete_session_by_id(&claims.session_id)?;
        tracing::info!(subject = log_subject(&claims.sub), "Session revoked");
        Ok(removed)
    }

    /// Logout everywhere for the subject of the presented token.
    pub fn revoke_all_sessions(&self, token: &str) -> Result<u64, AuthError> {
        let claims = self.issuer.validate_token(token)?;
        let removed = self.sessions.delete_all_sessions_by_subject(&claims.sub)?;
        tracing::info!(subject = log_subject(&claims.sub), removed, "All sessions revoked");
        Ok(removed)
    }

    pub fn revoke_all_sessions_by_identity(&self, username: &str) -> Result<u64, AuthError> {
        let identity = self
            .credentials
            .find_by_username(username)?
            .ok_or(AuthError::IdentityNotFound)?;
        let subject = derive_subject(&identity.username, identity.id);
        Ok(self.sessions.delete_all_sessions_by_subject(&subject)?)
    }

    pub fn is_session_valid(&self, claims: &Claims) -> Result<bool, AuthError> {
        Ok(self
            .sessions
            .is_session_valid(&claims.session_id, &claims.sub)?)
    }

    // ── Credential change ───────────────────────────────────────────

    /// Replace `username`'s password and return a fresh token.
    ///
    /// Order: verify old password, hash, persist hash, revoke every session
    /// of the subject, then log in with the new password. Once the hash is
    /// persisted, failing to revoke the old sessions is fatal for the call.
    pub fn change_password(
        &self,
        username: &str,
        old_password: &str,
        new_password: &str,
        presenting: &Claims,
    ) -> Result<IssuedToken, AuthError> {
        if presenting.data.username != username {
            tracing::warn!(
                subject = log_subject(&presenting.sub),
                "Credential change attempted for another identity"
            );
            return Err(AuthError::Forbidden);
        }
        validate_password(new_password)?;

        let Some(identity) = self.credentials.find_by_username(username)? else {
            self.secrets.dummy_verify(old_password);
            return Err(AuthError::IdentityNotFound);
        };
        if !self.secrets.verify_password(old_password, &identity.password_hash)? {
            return Err(AuthError::CredentialMismatch);
        }

        let new_hash = self.secrets.hash_password(new_password)?;
        self.credentials
            .update_hash(identity.id, &new_hash)
            .map_err(missing_as_not_found)?;

        let subject = derive_subject(&identity.username, identity.id);
        self.revoke_subject_after_credential_change(&subject)?;

        match self.authenticate(username, new_password, self.policy.ttl_for(identity.role))? {
            Some(issued) => Ok(issued),
            None => Err(AuthError::Internal(
                "new credential did not verify after update".into(),
            )),
        }
    }

    fn revoke_subject_after_credential_change(&self, subject: &str) -> Result<u64, AuthError> {
        match self.sessions.delete_all_sessions_by_subject(subject) {
            Ok(removed) => Ok(removed),
            Err(first) => {
                tracing::warn!(
                    subject = log_subject(subject),
                    "Revoking sessions after credential change failed, retrying: {first}"
                );
                self.sessions
                    .delete_all_sessions_by_subject(subject)
                    .map_err(|e| {
                        tracing::error!(
                            subject = log_subject(subject),
                            "Stale sessions survived a credential change: {e}"
                        );
                        AuthError::StorePersistence(e)
                    })
            }
        }
    }

    // ── Identity management ─────────────────────────────────────────

    pub fn create_identity(
        &self,
        username: &str,
        password: &str,
        role: Role,
    ) -> Result<Identity, AuthError> {
        let username = username.trim();
        if username.is_empty() {
            return Err(AuthError::InvalidInput("Username cannot be empty".into()));
        }
        if username.chars().count() > MAX_USERNAME_CHARS {
            return Err(AuthError::InvalidInput(format!(
                "Username too long (max {MAX_USERNAME_CHARS} characters)"
            )));
        }
        validate_password(password)?;

        let hash = self.secrets.hash_password(password)?;
        let identity = self.credentials.insert(username, &hash, role)?;
        tracing::info!(identity_id = identity.id, role = %role, "Identity created");
        Ok(identity)
    }

    /// Create the bootstrap admin if it does not exist yet. Returns whether
    /// a new identity was created.
    pub fn ensure_default_admin(&self, username: &str, password: &str) -> Result<bool, AuthError> {
        if self.credentials.find_by_username(username.trim())?.is_some() {
            tracing::debug!("Default admin already present");
            return Ok(false);
        }
        match self.create_identity(username, password, Role::Admin) {
            Ok(_) => Ok(true),
            // Lost a race with a concurrent bootstrap.
            Err(AuthError::IdentityExists(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Register an external system and return its access key. The key is
    /// only ever available here; the store keeps its hash.
    pub fn register_external_system(&self, system_name: &str) -> Result<String, AuthError> {
        validate_system_name(system_name)?;
        let access_key = self.secrets.generate_random_token(ACCESS_KEY_BYTES)?;
        let hash = self.secrets.hash_password(&access_key)?;
        let identity = self.credentials.insert(system_name, &hash, Role::ExtSys)?;
        tracing::info!(identity_id = identity.id, "External system registered");
        Ok(access_key)
    }

    pub fn list_external_systems(&self) -> Result<Vec<Identity>, AuthError> {
        Ok(self.credentials.find_by_role(Role::ExtSys)?)
    }

    /// Rename an external system and purge the sessions held under its old
    /// subject.
    pub fn rename_external_system(&self, old_name: &str, new_name: &str) -> Result<(), AuthError> {
        validate_system_name(new_name)?;
        let identity = self.find_external_system(old_name)?;
        self.credentials
            .update_username(old_name, new_name)
            .map_err(missing_as_not_found)?;

        let old_subject = derive_subject(&identity.username, identity.id);
        let removed = self.revoke_subject_after_credential_change(&old_subject)?;
        tracing::info!(identity_id = identity.id, removed, "External system renamed");
        Ok(())
    }

    pub fn delete_external_system(&self, system_name: &str) -> Result<(), AuthError> {
        let identity = self.find_external_system(system_name)?;
        let subject = derive_subject(&identity.username, identity.id);
        let removed = self.sessions.delete_all_sessions_by_subject(&subject)?;
        if !self.credentials.delete_by_username(system_name)? {
            return Err(AuthError::IdentityNotFound);
        }
        tracing::info!(identity_id = identity.id, removed, "External system deleted");
        Ok(())
    }

    fn find_external_system(&self, system_name: &str) -> Result<Identity, AuthError> {
        match self.credentials.find_by_username(system_name)? {
            Some(identity) if identity.role == Role::ExtSys => Ok(identity),
            _ => Err(AuthError::IdentityNotFound),
        }
    }

    pub fn cleanup_expired_sessions(&self) -> Result<u64, AuthError> {
        Ok(self.sessions.cleanup_expired_sessions()?)
    }
}

fn missing_as_not_found(err: StoreError) -> AuthError {
    match err {
        StoreError::NotFound => AuthError::IdentityNotFound,
        other => other.into(),
    }
}

fn validate_password(password: &str) -> Result<(), AuthError> {
    if password.chars().count() < MIN_PASSWORD_CHARS {
        return Err(AuthError::InvalidInput(format!(
            "Password must be at least {MIN_PASSWORD_CHARS} characters"
        )));
    }
    Ok(())
}

fn validate_system_name(name: &str) -> Result<(), AuthError> {
    if name.trim() != name || !SYSTEM_NAME_CHARS.contains(&name.chars().count()) {
        return Err(AuthError::InvalidInput(format!(
            "System name must be {}-{} characters without surrounding whitespace",
            SYSTEM_NAME_CHARS.start(),
            SYSTEM_NAME_CHARS.end()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::secrets::fast_params;
    use crate::auth::store::SqliteAuthStore;
    use crate::auth::token::SigningKey;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn issuer() -> Arc<TokenIssuer> {
        Arc::new(TokenIssuer::new(SigningKey::new(vec![7u8; 32]).unwrap()))
    }

    fn service_with(
        store: Arc<SqliteAuthStore>,
        sessions: Arc<dyn SessionRegistry>,
    ) -> AuthService {
        AuthService::new(
            store,
            sessions,
            issuer(),
            Arc::new(SecretProvider::new(fast_params())),
            TokenPolicy::default(),
        )
    }

    fn service() -> (Arc<SqliteAuthStore>, AuthService) {
        let store = Arc::new(SqliteAuthStore::open_in_memory(0).unwrap());
        let svc = service_with(store.clone(), store.clone());
        (store, svc)
    }

    fn with_alice() -> (Arc<SqliteAuthStore>, AuthService) {
        let (store, svc) = service();
        svc.create_identity("alice", "secret123", Role::Admin).unwrap();
        (store, svc)
    }

    fn login(svc: &AuthService, user: &str, pass: &str) -> IssuedToken {
        svc.authenticate(user, pass, 60).unwrap().unwrap()
    }

    fn live(svc: &AuthService, issued: &IssuedToken) -> bool {
        let claims = svc.issuer().validate_token(&issued.token).unwrap();
        svc.is_session_valid(&claims).unwrap()
    }

    /// Session registry that fails bulk revocation a set number of times.
    struct FlakyRevocation {
        inner: Arc<SqliteAuthStore>,
        failures_left: AtomicU32,
    }

    impl SessionRegistry for FlakyRevocation {
        fn create_session(&self, s: &Session) -> Result<(), StoreError> {
            self.inner.create_session(s)
        }
        fn is_session_valid(&self, id: &str, subject: &str) -> Result<bool, StoreError> {
            self.inner.is_session_valid(id, subject)
        }
        fn delete_session_by_id(&self, id: &str) -> Result<bool, StoreError> {
            self.inner.delete_session_by_id(id)
        }
        fn delete_all_sessions_by_subject(&self, subject: &str) -> Result<u64, StoreError> {
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(StoreError::Corrupt("injected".into()));
            }
            self.inner.delete_all_sessions_by_subject(subject)
        }
        fn count_live_sessions(&self, subject: &str) -> Result<u64, StoreError> {
            self.inner.count_live_sessions(subject)
        }
        fn cleanup_expired_sessions(&self) -> Result<u64, StoreError> {
            self.inner.cleanup_expired_sessions()
        }
    }

    fn flaky_service(failures: u32) -> (Arc<SqliteAuthStore>, AuthService) {
        let store = Arc::new(SqliteAuthStore::open_in_memory(0).unwrap());
        let sessions = Arc::new(FlakyRevocation {
            inner: store.clone(),
            failures_left: AtomicU32::new(failures),
        });
        let svc = service_with(store.clone(), sessions);
        svc.create_identity("alice", "secret123", Role::Admin).unwrap();
        (store, svc)
    }

    type Hook = Box<dyn FnOnce() + Send>;

    /// Session registry that runs a hook just before the first session
    /// insert, standing in for a request that lands mid-login.
    struct InterleavedLogin {
        inner: Arc<SqliteAuthStore>,
        before_create: parking_lot::Mutex<Option<Hook>>,
    }

    impl SessionRegistry for InterleavedLogin {
        fn create_session(&self, s: &Session) -> Result<(), StoreError> {
            let hook = self.before_create.lock().take();
            if let Some(hook) = hook {
                hook();
            }
            self.inner.create_session(s)
        }
        fn is_session_valid(&self, id: &str, subject: &str) -> Result<bool, StoreError> {
            self.inner.is_session_valid(id, subject)
        }
        fn delete_session_by_id(&self, id: &str) -> Result<bool, StoreError> {
            self.inner.delete_session_by_id(id)
        }
        fn delete_all_sessions_by_subject(&self, subject: &str) -> Result<u64, StoreError> {
            self.inner.delete_all_sessions_by_subject(subject)
        }
        fn count_live_sessions(&self, subject: &str) -> Result<u64, StoreError> {
            self.inner.count_live_sessions(subject)
        }
        fn cleanup_expired_sessions(&self) -> Result<u64, StoreError> {
            self.inner.cleanup_expired_sessions()
        }
    }

    /// Service over `store` whose first session insert is preceded by `hook`.
    fn interleaved(store: &Arc<SqliteAuthStore>, hook: Hook) -> AuthService {
        let sessions = Arc::new(InterleavedLogin {
            inner: store.clone(),
            before_create: parking_lot::Mutex::new(Some(hook)),
        });
        service_with(store.clone(), sessions)
    }

    #[test]
    fn login_in_flight_does_not_outlive_password_change() {
        let store = Arc::new(SqliteAuthStore::open_in_memory(0).unwrap());
        let direct = service_with(store.clone(), store.clone());
        direct.create_identity("alice", "secret123", Role::Admin).unwrap();
        let presenting = login(&direct, "alice", "secret123").claims;
        let alice_id = store.find_by_username("alice").unwrap().unwrap().id;

        let racing = interleaved(
            &store,
            Box::new(move || {
                direct
                    .change_password("alice", "secret123", "newpass456", &presenting)
                    .unwrap();
            }),
        );

        assert!(matches!(
            racing.authenticate("alice", "secret123", 60),
            Err(AuthError::CredentialMismatch)
        ));
        // Only the token handed out by the password change is left.
        let subject = derive_subject("alice", alice_id);
        assert_eq!(store.count_live_sessions(&subject).unwrap(), 1);
    }

    #[test]
    fn system_login_in_flight_does_not_outlive_rename_or_delete() {
        let store = Arc::new(SqliteAuthStore::open_in_memory(0).unwrap());
        let direct = Arc::new(service_with(store.clone(), store.clone()));
        let key = direct.register_external_system("scanner").unwrap();
        let scanner_id = store.find_by_username("scanner").unwrap().unwrap().id;

        let renamer = direct.clone();
        let racing = interleaved(
            &store,
            Box::new(move || renamer.rename_external_system("scanner", "scanner-2").unwrap()),
        );
        assert!(matches!(
            racing.authenticate_external_system("scanner", &key),
            Err(AuthError::CredentialMismatch)
        ));
        let old_subject = derive_subject("scanner", scanner_id);
        assert_eq!(store.count_live_sessions(&old_subject).unwrap(), 0);

        let deleter = direct.clone();
        let racing = interleaved(
            &store,
            Box::new(move || deleter.delete_external_system("scanner-2").unwrap()),
        );
        assert!(matches!(
            racing.authenticate_external_system("scanner-2", &key),
            Err(AuthError::CredentialMismatch)
        ));
        let new_subject = derive_subject("scanner-2", scanner_id);
        assert_eq!(store.count_live_sessions(&new_subject).unwrap(), 0);
    }

    #[test]
    fn rename_retries_revocation_once() {
        let (_store, svc) = flaky_service(1);
        let key = svc.register_external_system("scanner").unwrap();
        let issued = svc
            .authenticate_external_system("scanner", &key)
            .unwrap()
            .unwrap();

        svc.rename_external_system("scanner", "scanner-2").unwrap();
        assert!(!live(&svc, &issued));
    }

    #[test]
    fn rename_fails_loudly_when_revocation_keeps_failing() {
        let (_store, svc) = flaky_service(2);
        svc.register_external_system("scanner").unwrap();

        let err = svc
            .rename_external_system("scanner", "scanner-2")
            .unwrap_err();
        assert!(matches!(err, AuthError::StorePersistence(_)));
        assert_eq!(err.status_code(), 500);
    }

    #[test]
    fn authenticate_issues_live_token_with_matching_claims() {
        let (store, svc) = with_alice();
        let issued = login(&svc, "alice", "secret123");

        let claims = svc.issuer().validate_token(&issued.token).unwrap();
        let identity = store.find_by_username("alice").unwrap().unwrap();
        assert_eq!(claims.sub, derive_subject("alice", identity.id));
        assert_eq!(claims.data.role, Role::Admin);
        assert_eq!(claims.data.username, "alice");
        assert_eq!(claims.session_id.len(), SESSION_ID_BYTES * 2);
        assert!(live(&svc, &issued));
    }

    #[test]
    fn wrong_password_is_empty_result_not_error() {
        let (store, svc) = with_alice();
        assert!(svc.authenticate("alice", "wrong-pass", 60).unwrap().is_none());
        let identity = store.find_by_username("alice").unwrap().unwrap();
        let subject = derive_subject("alice", identity.id);
        assert_eq!(store.count_live_sessions(&subject).unwrap(), 0);
    }

    #[test]
    fn unknown_identity_is_not_found() {
        let (_store, svc) = with_alice();
        assert!(matches!(
            svc.authenticate("mallory", "secret123", 60),
            Err(AuthError::IdentityNotFound)
        ));
    }

    #[test]
    fn failed_session_persistence_discards_token() {
        let store = Arc::new(SqliteAuthStore::open_in_memory(1).unwrap());
        let svc = service_with(store.clone(), store.clone());
        svc.create_identity("alice", "secret123", Role::Admin).unwrap();

        login(&svc, "alice", "secret123");
        assert!(matches!(
            svc.authenticate("alice", "secret123", 60),
            Err(AuthError::SessionLimitReached)
        ));
    }

    #[test]
    fn revoke_session_isolates_other_sessions() {
        let (_store, svc) = with_alice();
        let first = login(&svc, "alice", "secret123");
        let second = login(&svc, "alice", "secret123");

        assert!(svc.revoke_session(&first.token).unwrap());
        assert!(!live(&svc, &first));
        assert!(live(&svc, &second));
        // Idempotent.
        assert!(!svc.revoke_session(&first.token).unwrap());
    }

    #[test]
    fn revoke_all_sessions_kills_every_login() {
        let (_store, svc) = with_alice();
        let tokens: Vec<_> = (0..3).map(|_| login(&svc, "alice", "secret123")).collect();

        assert_eq!(svc.revoke_all_sessions(&tokens[1].token).unwrap(), 3);
        for t in &tokens {
            assert!(!live(&svc, t));
        }
    }

    #[test]
    fn revoke_with_garbage_token_is_invalid_token() {
        let (_store, svc) = with_alice();
        assert!(matches!(
            svc.revoke_session("not.a.token"),
            Err(AuthError::InvalidToken(_))
        ));
    }

    #[test]
    fn change_password_scenario() {
        let (_store, svc) = with_alice();
        let token_a = login(&svc, "alice", "secret123");
        assert!(live(&svc, &token_a));

        let token_b = svc
            .change_password("alice", "secret123", "newpass456", &token_a.claims)
            .unwrap();
        assert!(!live(&svc, &token_a));
        assert!(live(&svc, &token_b));

        assert!(svc.authenticate("alice", "secret123", 60).unwrap().is_none());
        assert!(svc.authenticate("alice", "newpass456", 60).unwrap().is_some());
    }

    #[test]
    fn change_password_with_wrong_old_password_changes_nothing() {
        let (store, svc) = with_alice();
        let token_a = login(&svc, "alice", "secret123");
        let hash_before = store.find_by_username("alice").unwrap().unwrap().password_hash;

        let err = svc
            .change_password("alice", "not-it-123", "newpass456", &token_a.claims)
            .unwrap_err();
        assert!(matches!(err, AuthError::CredentialMismatch));

        assert!(live(&svc, &token_a));
        let hash_after = store.find_by_username("alice").unwrap().unwrap().password_hash;
        assert_eq!(hash_before, hash_after);
    }

    #[test]
    fn change_password_for_other_identity_is_forbidden() {
        let (_store, svc) = with_alice();
        svc.create_identity("bob", "bobpass123", Role::Admin).unwrap();
        let bob = login(&svc, "bob", "bobpass123");

        let err = svc
            .change_password("alice", "secret123", "newpass456", &bob.claims)
            .unwrap_err();
        assert!(matches!(err, AuthError::Forbidden));
        assert!(svc.authenticate("alice", "secret123", 60).unwrap().is_some());
    }

    #[test]
    fn change_password_rejects_short_new_password() {
        let (_store, svc) = with_alice();
        let token = login(&svc, "alice", "secret123");
        assert!(matches!(
            svc.change_password("alice", "secret123", "short", &token.claims),
            Err(AuthError::InvalidInput(_))
        ));
        assert!(live(&svc, &token));
    }

    #[test]
    fn change_password_retries_revocation_once() {
        let (_store, svc) = flaky_service(1);
        let token_a = login(&svc, "alice", "secret123");

        let token_b = svc
            .change_password("alice", "secret123", "newpass456", &token_a.claims)
            .unwrap();
        assert!(!live(&svc, &token_a));
        assert!(live(&svc, &token_b));
    }

    #[test]
    fn change_password_fails_loudly_when_revocation_keeps_failing() {
        let (_store, svc) = flaky_service(2);
        let token_a = login(&svc, "alice", "secret123");

        let err = svc
            .change_password("alice", "secret123", "newpass456", &token_a.claims)
            .unwrap_err();
        assert!(matches!(err, AuthError::StorePersistence(_)));
        assert_eq!(err.status_code(), 500);
    }

    #[test]
    fn create_identity_validates_input() {
        let (_store, svc) = service();
        assert!(matches!(
            svc.create_identity("   ", "password123", Role::User),
            Err(AuthError::InvalidInput(_))
        ));
        assert!(matches!(
            svc.create_identity(&"x".repeat(65), "password123", Role::User),
            Err(AuthError::InvalidInput(_))
        ));
        assert!(matches!(
            svc.create_identity("carol", "short", Role::User),
            Err(AuthError::InvalidInput(_))
        ));
        let carol = svc.create_identity("  carol  ", "password123", Role::User).unwrap();
        assert_eq!(carol.username, "carol");
        assert!(matches!(
            svc.create_identity("carol", "password123", Role::User),
            Err(AuthError::IdentityExists(_))
        ));
    }

    #[test]
    fn ensure_default_admin_is_idempotent() {
        let (store, svc) = service();
        assert!(svc.ensure_default_admin("admin", "adminpass1").unwrap());
        assert!(!svc.ensure_default_admin("admin", "different1").unwrap());
        let admin = store.find_by_username("admin").unwrap().unwrap();
        assert_eq!(admin.role, Role::Admin);
        assert!(svc.authenticate("admin", "adminpass1", 60).unwrap().is_some());
    }

    #[test]
    fn external_system_lifecycle() {
        let (_store, svc) = service();
        let key = svc.register_external_system("billing").unwrap();
        assert_eq!(key.len(), ACCESS_KEY_BYTES * 2);

        let issued = svc
            .authenticate_external_system("billing", &key)
            .unwrap()
            .unwrap();
        assert_eq!(issued.claims.data.role, Role::ExtSys);
        assert_eq!(issued.claims.exp - issued.claims.iat, 36_000 * 60);
        assert!(live(&svc, &issued));

        assert!(svc
            .authenticate_external_system("billing", "wrong-key")
            .unwrap()
            .is_none());

        let names: Vec<_> = svc
            .list_external_systems()
            .unwrap()
            .into_iter()
            .map(|i| i.username)
            .collect();
        assert_eq!(names, vec!["billing"]);
    }

    #[test]
    fn external_login_refuses_non_ext_sys_identity() {
        let (_store, svc) = with_alice();
        assert!(svc
            .authenticate_external_system("alice", "secret123")
            .unwrap()
            .is_none());
    }

    #[test]
    fn register_external_system_validates_name() {
        let (_store, svc) = service();
        let too_long = "n".repeat(33);
        for bad in ["abc", too_long.as_str(), " padded "] {
            assert!(matches!(
                svc.register_external_system(bad),
                Err(AuthError::InvalidInput(_))
            ));
        }
        svc.register_external_system("abcd").unwrap();
        assert!(matches!(
            svc.register_external_system("abcd"),
            Err(AuthError::IdentityExists(_))
        ));
    }

    #[test]
    fn rename_external_system_purges_old_sessions() {
        let (_store, svc) = service();
        let key = svc.register_external_system("crawler").unwrap();
        let issued = svc
            .authenticate_external_system("crawler", &key)
            .unwrap()
            .unwrap();

        svc.rename_external_system("crawler", "crawler-v2").unwrap();
        assert!(!live(&svc, &issued));
        assert!(matches!(
            svc.authenticate_external_system("crawler", &key),
            Err(AuthError::IdentityNotFound)
        ));
        assert!(svc
            .authenticate_external_system("crawler-v2", &key)
            .unwrap()
            .is_some());
    }

    #[test]
    fn rename_or_delete_missing_system_is_not_found() {
        let (_store, svc) = with_alice();
        assert!(matches!(
            svc.rename_external_system("ghost-sys", "other-sys"),
            Err(AuthError::IdentityNotFound)
        ));
        // Admin identities are not external systems.
        assert!(matches!(
            svc.delete_external_system("alice"),
            Err(AuthError::IdentityNotFound)
        ));
    }

    #[test]
    fn delete_external_system_revokes_and_removes() {
        let (store, svc) = service();
        let key = svc.register_external_system("reporter").unwrap();
        let issued = svc
            .authenticate_external_system("reporter", &key)
            .unwrap()
            .unwrap();

        svc.delete_external_system("reporter").unwrap();
        assert!(!live(&svc, &issued));
        assert!(store.find_by_username("reporter").unwrap().is_none());
    }

    #[test]
    fn revoke_all_by_identity() {
        let (_store, svc) = with_alice();
        let t1 = login(&svc, "alice", "secret123");
        let t2 = login(&svc, "alice", "secret123");
        assert_eq!(svc.revoke_all_sessions_by_identity("alice").unwrap(), 2);
        assert!(!live(&svc, &t1));
        assert!(!live(&svc, &t2));
        assert!(matches!(
            svc.revoke_all_sessions_by_identity("nobody"),
            Err(AuthError::IdentityNotFound)
        ));
    }

    #[test]
    fn log_subject_truncates() {
        assert_eq!(log_subject("0123456789abcdef"), "0123456789ab");
        assert_eq!(log_subject("short"), "short");
    }
}
