//! Request-time authorization gate.

use super::error::AuthError;
use super::role::Role;
use super::service::log_subject;
use super::token::{Claims, TokenIssuer};
use super::traits::SessionRegistry;
use std::sync::Arc;

/// Identity context attached to an authorized request.
#[derive(Clone)]
pub struct AuthContext {
    pub claims: Claims,
    /// The raw bearer value, kept for logout flows that act on the token.
    pub token: String,
}

impl AuthContext {
    pub fn role(&self) -> Role {
        self.claims.data.role
    }

    pub fn username(&self) -> &str {
        &self.claims.data.username
    }
}

impl std::fmt::Debug for AuthContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthContext")
            .field("claims", &self.claims)
            .field("token", &"[redacted]")
            .finish()
    }
}

/// Split an `Authorization` header value into its bearer token.
///
/// The value must be exactly `"<scheme> <token>"` with a `Bearer` scheme
/// (case-insensitive).
pub fn parse_authorization(header: Option<&str>) -> Result<&str, AuthError> {
    let header = header.ok_or(AuthError::MissingCredential)?;
    let mut parts = header.split(' ');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(scheme), Some(token), None)
            if scheme.eq_ignore_ascii_case("Bearer") && !token.is_empty() =>
        {
            Ok(token)
        }
        _ => Err(AuthError::MalformedCredential),
    }
}

/// Validates the token, confirms its session is live, then checks the role.
#[derive(Clone)]
pub struct AuthGuard {
    issuer: Arc<TokenIssuer>,
    sessions: Arc<dyn SessionRegistry>,
}

impl AuthGuard {
    pub fn new(issuer: Arc<TokenIssuer>, sessions: Arc<dyn SessionRegistry>) -> Self {
        Self { issuer, sessions }
    }

    /// Blocking: performs one session lookup.
    ///
    /// An empty `required` set admits any authenticated role.
    pub fn authorize(
        &self,
        authorization: Option<&str>,
        required: &[Role],
    ) -> Result<AuthContext, AuthError> {
        let token = parse_authorization(authorization)?;
        let claims = self.issuer.validate_token(token)?;

        if !self
            .sessions
            .is_session_valid(&claims.session_id, &claims.sub)?
        {
            tracing::debug!(subject = log_subject(&claims.sub), "Rejected token for dead session");
            return Err(AuthError::SessionRevoked);
        }

        if !claims.data.role.is_member_of(required) {
            tracing::info!(
                subject = log_subject(&claims.sub),
                role = %claims.data.role,
                "Role not permitted for resource"
            );
            return Err(AuthError::Forbidden);
        }

        Ok(AuthContext {
            claims,
            token: token.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::store::SqliteAuthStore;
    use crate::auth::token::{derive_subject, SigningKey, TokenError};
    use crate::auth::traits::Session;

    fn setup() -> (Arc<SqliteAuthStore>, Arc<TokenIssuer>, AuthGuard) {
        let store = Arc::new(SqliteAuthStore::open_in_memory(0).unwrap());
        let issuer = Arc::new(TokenIssuer::new(SigningKey::new(vec![3u8; 32]).unwrap()));
        let guard = AuthGuard::new(issuer.clone(), store.clone());
        (store, issuer, guard)
    }

    fn live_token(store: &SqliteAuthStore, issuer: &TokenIssuer, role: Role) -> String {
        let subject = derive_subject("alice", 1);
        let issued = issuer
            .issue_token("alice", &subject, role, "sid-1", 60)
            .unwrap();
        store
            .create_session(&Session {
                session_id: "sid-1".into(),
                subject,
                expires_at: issued.claims.exp,
            })
            .unwrap();
        issued.token
    }

    #[test]
    fn parse_authorization_shapes() {
        assert!(matches!(
            parse_authorization(None),
            Err(AuthError::MissingCredential)
        ));
        assert_eq!(parse_authorization(Some("Bearer abc")).unwrap(), "abc");
        assert_eq!(parse_authorization(Some("bearer abc")).unwrap(), "abc");
        for bad in ["Bearer", "Bearer ", "Basic abc", "Bearer a b", "abc"] {
            assert!(
                matches!(
                    parse_authorization(Some(bad)),
                    Err(AuthError::MalformedCredential)
                ),
                "{bad}"
            );
        }
    }

    #[test]
    fn live_token_with_allowed_role_passes() {
        let (store, issuer, guard) = setup();
        let token = live_token(&store, &issuer, Role::Admin);
        let header = format!("Bearer {token}");

        let ctx = guard.authorize(Some(&header), &[Role::Admin]).unwrap();
        assert_eq!(ctx.username(), "alice");
        assert_eq!(ctx.role(), Role::Admin);
        assert_eq!(ctx.token, token);
    }

    #[test]
    fn empty_role_set_admits_any_role() {
        let (store, issuer, guard) = setup();
        let token = live_token(&store, &issuer, Role::ExtSys);
        assert!(guard.authorize(Some(&format!("Bearer {token}")), &[]).is_ok());
    }

    #[test]
    fn wrong_role_is_forbidden() {
        let (store, issuer, guard) = setup();
        let token = live_token(&store, &issuer, Role::ExtSys);
        let err = guard
            .authorize(Some(&format!("Bearer {token}")), &[Role::Admin, Role::User])
            .unwrap_err();
        assert!(matches!(err, AuthError::Forbidden));
    }

    #[test]
    fn revoked_session_is_rejected_despite_valid_signature() {
        let (store, issuer, guard) = setup();
        let token = live_token(&store, &issuer, Role::Admin);
        store.delete_session_by_id("sid-1").unwrap();

        assert!(issuer.validate_token(&token).is_ok());
        let err = guard
            .authorize(Some(&format!("Bearer {token}")), &[])
            .unwrap_err();
        assert!(matches!(err, AuthError::SessionRevoked));
        assert_eq!(err.status_code(), 401);
    }

    #[test]
    fn session_check_precedes_role_check() {
        let (store, issuer, guard) = setup();
        let token = live_token(&store, &issuer, Role::ExtSys);
        store.delete_all_sessions_by_subject(&derive_subject("alice", 1)).unwrap();

        let err = guard
            .authorize(Some(&format!("Bearer {token}")), &[Role::Admin])
            .unwrap_err();
        assert!(matches!(err, AuthError::SessionRevoked));
    }

    #[test]
    fn invalid_token_is_rejected() {
        let (_store, _issuer, guard) = setup();
        let err = guard.authorize(Some("Bearer x.y.z"), &[]).unwrap_err();
        assert!(matches!(err, AuthError::InvalidToken(_)));

        let foreign = TokenIssuer::new(SigningKey::new(vec![9u8; 32]).unwrap())
            .issue_token("alice", "subj", Role::Admin, "sid", 60)
            .unwrap();
        let err = guard
            .authorize(Some(&format!("Bearer {}", foreign.token)), &[])
            .unwrap_err();
        assert!(matches!(
            err,
            AuthError::InvalidToken(TokenError::InvalidSignature)
        ));
    }

    #[test]
    fn context_debug_redacts_token() {
        let (store, issuer, guard) = setup();
        let token = live_token(&store, &issuer, Role::Admin);
        let ctx = guard.authorize(Some(&format!("Bearer {token}")), &[]).unwrap();
        assert!(!format!("{ctx:?}").contains(&token));
    }
}
