//! External-system endpoints: key-based login, registration and
//! lifecycle management of `ext_sys` identities.

use super::{
    bad_body, client_key_from_headers, error_response, json_error, login_response,
    require_auth, run_blocking, too_many_attempts, AppState, AuthResponse, OPERATORS,
    SYSTEM_LOGOUT_ROLES,
};
use crate::auth::AuthError;
use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{HeaderMap, StatusCode},
    response::Json,
};
use serde::Deserialize;

#[derive(Deserialize)]
pub(crate) struct SystemAuthBody {
    system_name: String,
    access_key: String,
}

#[derive(Deserialize)]
pub(crate) struct RegisterBody {
    system_name: String,
}

#[derive(Deserialize)]
pub(crate) struct RenameBody {
    old_system_name: String,
    new_system_name: String,
}

/// Management endpoints answer 404 for a missing system; only the login
/// path hides it behind "Wrong credentials".
fn management_error(err: &AuthError) -> AuthResponse {
    match err {
        AuthError::IdentityNotFound => json_error(StatusCode::NOT_FOUND, "External system not found"),
        other => error_response(other),
    }
}

/// POST /api/system/external/auth: access-key login.
pub(crate) async fn handle_auth(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<SystemAuthBody>, JsonRejection>,
) -> AuthResponse {
    let client = client_key_from_headers(&headers);
    if !state.login_throttle.allow_login(&client) {
        tracing::warn!(client = %client, "External system login throttled");
        return too_many_attempts();
    }
    let Json(body) = match body {
        Ok(b) => b,
        Err(e) => return bad_body(&e),
    };

    let auth = state.auth.clone();
    login_response(
        run_blocking(move || {
            auth.authenticate_external_system(&body.system_name, &body.access_key)
        })
        .await,
    )
}

/// POST /api/system/external/register: the access key is shown only here.
pub(crate) async fn handle_register(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<RegisterBody>, JsonRejection>,
) -> AuthResponse {
    if let Err(resp) = require_auth(&state, &headers, OPERATORS).await {
        return resp;
    }
    let Json(body) = match body {
        Ok(b) => b,
        Err(e) => return bad_body(&e),
    };

    let auth = state.auth.clone();
    let name = body.system_name.clone();
    match run_blocking(move || auth.register_external_system(&body.system_name)).await {
        Ok(access_key) => (
            StatusCode::CREATED,
            Json(serde_json::json!({
                "status": "Created",
                "system_name": name,
                "access_key": access_key,
            })),
        ),
        Err(e) => error_response(&e),
    }
}

/// GET /api/system/external: registered systems, without credentials.
pub(crate) async fn handle_list(State(state): State<AppState>, headers: HeaderMap) -> AuthResponse {
    if let Err(resp) = require_auth(&state, &headers, OPERATORS).await {
        return resp;
    }

    let auth = state.auth.clone();
    match run_blocking(move || auth.list_external_systems()).await {
        Ok(systems) => {
            let systems: Vec<_> = systems
                .iter()
                .map(|s| {
                    serde_json::json!({
                        "system_name": s.username,
                        "created_at": s.created_at,
                        "updated_at": s.updated_at,
                    })
                })
                .collect();
            (
                StatusCode::OK,
                Json(serde_json::json!({"status": "Success", "systems": systems})),
            )
        }
        Err(e) => error_response(&e),
    }
}

/// PUT /api/system/external/rename
pub(crate) async fn handle_rename(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<RenameBody>, JsonRejection>,
) -> AuthResponse {
    if let Err(resp) = require_auth(&state, &headers, OPERATORS).await {
        return resp;
    }
    let Json(body) = match body {
        Ok(b) => b,
        Err(e) => return bad_body(&e),
    };

    let auth = state.auth.clone();
    match run_blocking(move || {
        auth.rename_external_system(&body.old_system_name, &body.new_system_name)
    })
    .await
    {
        Ok(()) => (StatusCode::OK, Json(serde_json::json!({"status": "Success"}))),
        Err(e) => management_error(&e),
    }
}

/// DELETE /api/system/external/{name}
pub(crate) async fn handle_delete(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> AuthResponse {
    if let Err(resp) = require_auth(&state, &headers, OPERATORS).await {
        return resp;
    }

    let auth = state.auth.clone();
    match run_blocking(move || auth.delete_external_system(&name)).await {
        Ok(()) => (StatusCode::OK, Json(serde_json::json!({"status": "Success"}))),
        Err(e) => management_error(&e),
    }
}

/// PUT /api/system/external/logout: end the presenting session.
pub(crate) async fn handle_logout(State(state): State<AppState>, headers: HeaderMap) -> AuthResponse {
    let ctx = match require_auth(&state, &headers, SYSTEM_LOGOUT_ROLES).await {
        Ok(ctx) => ctx,
        Err(resp) => return resp,
    };

    let auth = state.auth.clone();
    let token = ctx.token;
    match run_blocking(move || auth.revoke_session(&token)).await {
        Ok(_) => (StatusCode::OK, Json(serde_json::json!({"status": "Success"}))),
        Err(e) => error_response(&e),
    }
}
