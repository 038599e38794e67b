use axum::{
    extract::{rejection::JsonRejection, FromRef, State},
    routing::{get, post},
    Json, Router,
};
use tracing::{error, info, instrument, warn};

use super::{extractors::AuthUser, jwt::JwtKeys};
use crate::{
    state::AppState,
    users::{
        dto::{AuthResponse, LoginRequest, RefreshRequest, UserResponse},
        error::{UserError, UserResult},
        handlers::{json_body, normalize_email},
    },
};

pub fn auth_routes() -> Router<AppState> {
    Router::new()
        .route("/auth/login", post(login))
        .route("/auth/refresh", post(refresh))
}

pub fn me_routes() -> Router<AppState> {
    Router::new().route("/me", get(get_me))
}

fn issue_tokens(keys: &JwtKeys, user: UserResponse) -> UserResult<AuthResponse> {
    let sign_err = |e: anyhow::Error| {
        error!(error = %e, "jwt signing failed");
        UserError::Internal(e.to_string())
    };
    let access_token = keys.sign_access(user.id).map_err(sign_err)?;
    let refresh_token = keys.sign_refresh(user.id).map_err(sign_err)?;
    Ok(AuthResponse {
        access_token,
        refresh_token,
        user,
    })
}

#[instrument(skip(state, payload))]
pub async fn login(
    State(state): State<AppState>,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> UserResult<Json<AuthResponse>> {
    let payload = json_body(payload)?;
    let email = normalize_email(&payload.email);

    let user = state.users.authenticate_user(&email, &payload.password).await?;

    let keys = JwtKeys::from_ref(&state);
    let response = issue_tokens(&keys, user)?;
    info!(user_id = response.user.id, "user logged in");
    Ok(Json(response))
}

#[instrument(skip(state, payload))]
pub async fn refresh(
    State(state): State<AppState>,
    payload: Result<Json<RefreshRequest>, JsonRejection>,
) -> UserResult<Json<AuthResponse>> {
    let payload = json_body(payload)?;
    let keys = JwtKeys::from_ref(&state);
    let claims = keys.verify_refresh(&payload.refresh_token).map_err(|e| {
        warn!(error = %e, "refresh rejected");
        UserError::Unauthorized
    })?;

    let user = match state.users.get_user(claims.sub).await {
        Ok(u) => u,
        Err(UserError::NotFound) => {
            warn!(user_id = claims.sub, "refresh for missing user");
            return Err(UserError::Unauthorized);
        }
        Err(e) => return Err(e),
    };

    Ok(Json(issue_tokens(&keys, user)?))
}

#[instrument(skip(state))]
pub async fn get_me(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> UserResult<Json<UserResponse>> {
    match state.users.get_user(user_id).await {
        Ok(user) => Ok(Json(user)),
        Err(UserError::NotFound) => {
            warn!(user_id, "token subject no longer exists");
            Err(UserError::Unauthorized)
        }
        Err(e) => Err(e),
    }
}
