//! Axum-based HTTP gateway for the auth subsystem.
//!
//! - Request body size limits (64KB max)
//! - Request timeouts (configurable, 408 on expiry)
//! - Per-client login throttling
//! - One log line per request (method, path, client, status)
//! - Background sweep of expired sessions
//!
//! Every store or Argon2 call is pushed onto the blocking pool.

pub mod external;
pub mod throttle;

use crate::auth::{
    AuthContext, AuthError, AuthGuard, AuthService, ErrorClass, Role, SecretProvider, SigningKey,
    SqliteAuthStore, TokenIssuer, TokenPolicy,
};
use crate::config::Config;
use anyhow::{Context, Result};
use axum::{
    extract::{ConnectInfo, Query, Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{Json, Response},
    routing::{delete, get, post, put},
    Router,
};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

pub use throttle::{client_key_from_headers, LoginThrottle};

/// Maximum request body size (64KB).
pub const MAX_BODY_SIZE: usize = 65_536;
/// Random bytes for a per-process signing key.
const GENERATED_KEY_BYTES: usize = 32;

const ADMIN_ONLY: &[Role] = &[Role::Admin];
pub(crate) const OPERATORS: &[Role] = &[Role::Admin, Role::User];
pub(crate) const SYSTEM_LOGOUT_ROLES: &[Role] = &[Role::User, Role::ExtSys];
const ANY_ROLE: &[Role] = &[];

/// Shared state for all axum handlers
#[derive(Clone)]
pub struct AppState {
    pub auth: Arc<AuthService>,
    pub guard: AuthGuard,
    pub login_throttle: Arc<LoginThrottle>,
    /// Keep `X-Forwarded-For`/`X-Real-IP` as sent by the caller.
    pub trust_proxy_headers: bool,
}

impl AppState {
    pub fn new(auth: Arc<AuthService>, login_per_minute: u32) -> Self {
        let guard = AuthGuard::new(auth.issuer().clone(), auth.sessions().clone());
        Self {
            auth,
            guard,
            login_throttle: Arc::new(LoginThrottle::per_minute(login_per_minute)),
            trust_proxy_headers: false,
        }
    }

    pub fn trusting_proxy_headers(mut self, trust: bool) -> Self {
        self.trust_proxy_headers = trust;
        self
    }
}

/// The configured signing key, or a fresh random one for this process.
pub fn signing_key(config: &Config, secrets: &SecretProvider) -> Result<SigningKey> {
    if let Some(secret) = &config.auth.signing_secret {
        return SigningKey::from_hex(secret).context("auth.signing_secret is not a usable key");
    }
    tracing::warn!(
        "No signing secret configured; generated one for this process. \
         Tokens will not survive a restart."
    );
    let bytes = secrets
        .random_bytes(GENERATED_KEY_BYTES)
        .context("Failed to generate signing key")?;
    Ok(SigningKey::new(bytes)?)
}

/// Open the store and assemble the auth service. Blocking.
pub fn build_auth_service(config: &Config) -> Result<Arc<AuthService>> {
    let db_path = config.database.resolved_path();
    let store = Arc::new(
        SqliteAuthStore::open(
            &db_path,
            config.database.busy_timeout_ms,
            config.auth.max_sessions_per_subject,
        )
        .with_context(|| format!("Failed to open auth database {}", db_path.display()))?,
    );
    tracing::info!("Auth store initialized at {}", db_path.display());

    let secrets = Arc::new(SecretProvider::default());
    let issuer = Arc::new(TokenIssuer::new(signing_key(config, &secrets)?));
    let policy = TokenPolicy {
        user_ttl_minutes: config.auth.user_token_ttl_minutes,
        ext_sys_ttl_minutes: config.auth.ext_sys_token_ttl_minutes,
    };
    let service = AuthService::new(store.clone(), store, issuer, secrets, policy);

    if let Some((username, password)) = config.default_admin() {
        if service
            .ensure_default_admin(username, password)
            .context("Failed to create default admin")?
        {
            tracing::info!(username, "Default admin created");
        }
    }
    Ok(Arc::new(service))
}

/// Build the router with middleware applied.
pub fn router(state: AppState, request_timeout: Duration) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            axum::http::Method::GET,
            axum::http::Method::POST,
            axum::http::Method::PUT,
            axum::http::Method::DELETE,
            axum::http::Method::OPTIONS,
        ])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
        .max_age(Duration::from_secs(3600));

    Router::new()
        .route("/health", get(handle_health))
        .route("/api/user/auth/login", post(handle_login))
        .route("/api/user/auth/logout", put(handle_logout))
        .route(
            "/api/user/auth/credentials/change",
            post(handle_change_credentials),
        )
        .route("/api/user/auth/me", get(handle_me))
        .route("/api/system/external", get(external::handle_list))
        .route("/api/system/external/auth", post(external::handle_auth))
        .route("/api/system/external/register", post(external::handle_register))
        .route("/api/system/external/rename", put(external::handle_rename))
        .route("/api/system/external/logout", put(external::handle_logout))
        .route("/api/system/external/{name}", delete(external::handle_delete))
        .with_state(state.clone())
        .layer(cors)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_SIZE))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            request_timeout,
        ))
        .layer(middleware::from_fn_with_state(state, track_requests))
}

/// Outermost layer: settle the client identity, then log one line per
/// request once the response (including 408/413 from inner layers) is known.
async fn track_requests(State(state): State<AppState>, mut req: Request, next: Next) -> Response {
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    throttle::normalize_client_headers(req.headers_mut(), peer, state.trust_proxy_headers);

    let method = req.method().clone();
    let path = req.uri().path().to_owned();
    let client = client_key_from_headers(req.headers());
    let started = Instant::now();

    let resp = next.run(req).await;
    tracing::info!(
        method = %method,
        path = %path,
        client = %client,
        status = resp.status().as_u16(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Request handled"
    );
    resp
}

/// Run the HTTP gateway until Ctrl-C.
pub async fn run_gateway(config: Config) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.gateway.host, config.gateway.port)
        .parse()
        .context("Invalid gateway bind address")?;

    let build_config = config.clone();
    let auth = tokio::task::spawn_blocking(move || build_auth_service(&build_config))
        .await
        .context("Auth bootstrap task panicked")??;

    let sweep = spawn_session_sweep(
        auth.clone(),
        Duration::from_secs(config.gateway.session_sweep_interval_secs),
    );

    let state = AppState::new(auth, config.gateway.login_rate_limit_per_minute)
        .trusting_proxy_headers(config.gateway.trust_proxy_headers);
    let app = router(
        state,
        Duration::from_secs(config.gateway.request_timeout_secs),
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Gateway listening on {}", listener.local_addr()?);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    sweep.abort();
    tracing::info!("Gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
}

/// Periodically delete expired sessions. The first sweep runs one full
/// interval after startup.
pub fn spawn_session_sweep(
    auth: Arc<AuthService>,
    every: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let auth = auth.clone();
            match run_blocking(move || auth.cleanup_expired_sessions()).await {
                Ok(0) => {}
                Ok(removed) => tracing::info!(removed, "Swept expired sessions"),
                Err(e) => tracing::warn!("Session sweep failed: {e}"),
            }
        }
    })
}

// ══════════════════════════════════════════════════════════════════════════════
// SHARED HANDLER PLUMBING
// ══════════════════════════════════════════════════════════════════════════════

/// Concrete return type for auth handlers (avoids `impl IntoResponse` inference issues).
pub(crate) type AuthResponse = (StatusCode, Json<serde_json::Value>);

pub(crate) fn json_error(status: StatusCode, message: impl Into<String>) -> AuthResponse {
    (
        status,
        Json(serde_json::json!({
            "status": status.canonical_reason().unwrap_or("Error"),
            "error": message.into(),
        })),
    )
}

pub(crate) fn error_response(err: &AuthError) -> AuthResponse {
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if err.class() == ErrorClass::ServerFault {
        tracing::error!("Auth request failed: {err}");
    }
    json_error(status, err.public_message())
}

pub(crate) fn bad_body(rejection: &axum::extract::rejection::JsonRejection) -> AuthResponse {
    json_error(StatusCode::BAD_REQUEST, format!("Invalid request: {rejection}"))
}

pub(crate) fn too_many_attempts() -> AuthResponse {
    json_error(
        StatusCode::TOO_MANY_REQUESTS,
        "Too many login attempts. Please retry later.",
    )
}

/// Run blocking auth work on the blocking pool.
pub(crate) async fn run_blocking<T, F>(work: F) -> Result<T, AuthError>
where
    F: FnOnce() -> Result<T, AuthError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| AuthError::Internal(e.to_string()))?
}

/// Gate a request: bearer token, live session, role in `required`.
pub(crate) async fn require_auth(
    state: &AppState,
    headers: &HeaderMap,
    required: &'static [Role],
) -> Result<AuthContext, AuthResponse> {
    let authorization = match headers.get(header::AUTHORIZATION) {
        None => None,
        Some(value) => match value.to_str() {
            Ok(v) => Some(v.to_owned()),
            Err(_) => return Err(error_response(&AuthError::MalformedCredential)),
        },
    };
    let guard = state.guard.clone();
    run_blocking(move || guard.authorize(authorization.as_deref(), required))
        .await
        .map_err(|e| error_response(&e))
}

/// Turn a login outcome into a response. A wrong password and an unknown
/// identity produce the same 401.
pub(crate) fn login_response(
    outcome: Result<Option<crate::auth::IssuedToken>, AuthError>,
) -> AuthResponse {
    match outcome {
        Ok(Some(issued)) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "Success",
                "access_token": issued.token,
            })),
        ),
        Ok(None) => error_response(&AuthError::CredentialMismatch),
        Err(e) => error_response(&e),
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// USER AUTH HANDLERS
// ══════════════════════════════════════════════════════════════════════════════

#[derive(Deserialize)]
struct LoginBody {
    username: String,
    password: String,
}

#[derive(Deserialize, Default)]
struct LogoutQuery {
    #[serde(default)]
    all: bool,
}

#[derive(Deserialize)]
struct ChangeCredentialsBody {
    username: String,
    old_password: String,
    new_password: String,
}

/// GET /health: liveness check.
async fn handle_health() -> AuthResponse {
    (StatusCode::OK, Json(serde_json::json!({"status": "ok"})))
}

/// POST /api/user/auth/login: username/password login.
async fn handle_login(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<LoginBody>, axum::extract::rejection::JsonRejection>,
) -> AuthResponse {
    let client = client_key_from_headers(&headers);
    if !state.login_throttle.allow_login(&client) {
        tracing::warn!(client = %client, "Login throttled");
        return too_many_attempts();
    }
    let Json(body) = match body {
        Ok(b) => b,
        Err(e) => return bad_body(&e),
    };

    let auth = state.auth.clone();
    let ttl = auth.policy().user_ttl_minutes;
    login_response(
        run_blocking(move || auth.authenticate(&body.username, &body.password, ttl)).await,
    )
}

/// PUT /api/user/auth/logout[?all=true]: end this session or all of them.
async fn handle_logout(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<LogoutQuery>,
) -> AuthResponse {
    let ctx = match require_auth(&state, &headers, ADMIN_ONLY).await {
        Ok(ctx) => ctx,
        Err(resp) => return resp,
    };

    let auth = state.auth.clone();
    let token = ctx.token;
    let outcome = if query.all {
        run_blocking(move || auth.revoke_all_sessions(&token)).await
    } else {
        run_blocking(move || auth.revoke_session(&token).map(u64::from)).await
    };
    match outcome {
        Ok(revoked) => (
            StatusCode::OK,
            Json(serde_json::json!({"status": "Success", "revoked": revoked})),
        ),
        Err(e) => error_response(&e),
    }
}

/// POST /api/user/auth/credentials/change: rotate the caller's password.
async fn handle_change_credentials(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<ChangeCredentialsBody>, axum::extract::rejection::JsonRejection>,
) -> AuthResponse {
    let ctx = match require_auth(&state, &headers, ADMIN_ONLY).await {
        Ok(ctx) => ctx,
        Err(resp) => return resp,
    };
    let Json(body) = match body {
        Ok(b) => b,
        Err(e) => return bad_body(&e),
    };

    let auth = state.auth.clone();
    let outcome = run_blocking(move || {
        auth.change_password(
            &body.username,
            &body.old_password,
            &body.new_password,
            &ctx.claims,
        )
    })
    .await;
    login_response(outcome.map(Some))
}

/// GET /api/user/auth/me: the validated identity behind the token.
async fn handle_me(State(state): State<AppState>, headers: HeaderMap) -> AuthResponse {
    let ctx = match require_auth(&state, &headers, ANY_ROLE).await {
        Ok(ctx) => ctx,
        Err(resp) => return resp,
    };
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "Success",
            "username": ctx.username(),
            "role": ctx.role(),
            "subject": ctx.claims.sub,
            "expires_at": ctx.claims.exp,
        })),
    )
}
