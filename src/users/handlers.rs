use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection, QueryRejection},
        Path, Query, State,
    },
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use lazy_static::lazy_static;
use regex::Regex;
use tracing::{instrument, warn};

use super::dto::{
    CreateUserRequest, ListUsersResponse, Pagination, UpdateUserRequest, UserResponse,
};
use super::error::{UserError, UserResult};
use crate::{auth::extractors::AuthUser, state::AppState};

const MIN_PASSWORD_LEN: usize = 8;
// column widths in migrations/0001_create_users.sql
const MAX_USERNAME_LEN: usize = 50;
const MAX_EMAIL_LEN: usize = 100;
const MAX_NAME_LEN: usize = 50;

pub fn user_routes() -> Router<AppState> {
    Router::new()
        .route("/users", post(create_user).get(list_users))
        .route(
            "/users/:id",
            get(get_user).put(update_user).delete(delete_user),
        )
}

pub(crate) fn is_valid_email(email: &str) -> bool {
    lazy_static! {
        static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
    }
    EMAIL_RE.is_match(email)
}

pub(crate) fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

pub(crate) fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> UserResult<T> {
    payload.map(|Json(body)| body).map_err(|rej| {
        warn!(error = %rej.body_text(), "rejected request body");
        UserError::Validation("Invalid request payload".into())
    })
}

fn pagination(query: Result<Query<Pagination>, QueryRejection>) -> UserResult<Pagination> {
    query.map(|Query(q)| q).map_err(|rej| {
        warn!(error = %rej.body_text(), "rejected query string");
        UserError::Validation("Invalid query string".into())
    })
}

fn user_id(path: Result<Path<i64>, PathRejection>) -> UserResult<i64> {
    path.map(|Path(id)| id)
        .map_err(|_| UserError::Validation("Invalid user ID".into()))
}

/// Accounts may only be modified by their owner.
fn ensure_owner(caller: i64, id: i64) -> UserResult<()> {
    if caller != id {
        warn!(caller, target = id, "attempt to modify another user");
        return Err(UserError::Forbidden);
    }
    Ok(())
}

fn check_len(field: &str, value: &str, max: usize) -> UserResult<()> {
    if value.chars().count() > max {
        return Err(UserError::Validation(format!(
            "{field} must be at most {max} characters"
        )));
    }
    Ok(())
}

fn check_names(first_name: &str, last_name: &str) -> UserResult<()> {
    check_len("first_name", first_name, MAX_NAME_LEN)?;
    check_len("last_name", last_name, MAX_NAME_LEN)
}

fn check_password(password: &str) -> UserResult<()> {
    if password.len() < MIN_PASSWORD_LEN {
        warn!("password too short");
        return Err(UserError::Validation("Password too short".into()));
    }
    Ok(())
}

#[instrument(skip(state, payload))]
pub async fn create_user(
    State(state): State<AppState>,
    payload: Result<Json<CreateUserRequest>, JsonRejection>,
) -> UserResult<(StatusCode, Json<UserResponse>)> {
    let mut payload = json_body(payload)?;
    payload.email = normalize_email(&payload.email);
    payload.username = payload.username.trim().to_string();

    if !is_valid_email(&payload.email) {
        warn!(email = %payload.email, "invalid email");
        return Err(UserError::Validation("Invalid email".into()));
    }
    if payload.username.is_empty() {
        return Err(UserError::Validation("Username is required".into()));
    }
    check_len("username", &payload.username, MAX_USERNAME_LEN)?;
    check_len("email", &payload.email, MAX_EMAIL_LEN)?;
    check_names(&payload.first_name, &payload.last_name)?;
    check_password(&payload.password)?;

    let user = state.users.create_user(payload).await?;
    Ok((StatusCode::CREATED, Json(user)))
}

#[instrument(skip(state, query))]
pub async fn list_users(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    query: Result<Query<Pagination>, QueryRejection>,
) -> UserResult<Json<ListUsersResponse>> {
    let query = pagination(query)?;
    let page = query.page();
    let page_size = query.page_size();
    let (users, total) = state.users.list_users(page, page_size).await?;
    Ok(Json(ListUsersResponse::new(users, total, page, page_size)))
}

#[instrument(skip(state, path))]
pub async fn get_user(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    path: Result<Path<i64>, PathRejection>,
) -> UserResult<Json<UserResponse>> {
    let id = user_id(path)?;
    Ok(Json(state.users.get_user(id).await?))
}

#[instrument(skip(state, path, payload))]
pub async fn update_user(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    path: Result<Path<i64>, PathRejection>,
    payload: Result<Json<UpdateUserRequest>, JsonRejection>,
) -> UserResult<Json<UserResponse>> {
    let id = user_id(path)?;
    ensure_owner(caller, id)?;
    let payload = json_body(payload)?;
    check_names(&payload.first_name, &payload.last_name)?;
    if let Some(password) = payload.password.as_deref().filter(|p| !p.is_empty()) {
        check_password(password)?;
    }
    Ok(Json(state.users.update_user(id, payload).await?))
}

#[instrument(skip(state, path))]
pub async fn delete_user(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    path: Result<Path<i64>, PathRejection>,
) -> UserResult<StatusCode> {
    let id = user_id(path)?;
    ensure_owner(caller, id)?;
    state.users.delete_user(id).await?;
    Ok(StatusCode::NO_CONTENT)
}
