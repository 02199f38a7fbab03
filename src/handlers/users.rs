//! User registration, login, password reset, and the user list with live
//! presence merged in. Thin identity glue around the store; the realtime
//! core only cares about the `users:changed` broadcast on registration.

use argon2::password_hash::{rand_core::OsRng, SaltString};
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{encode, EncodingKey, Header};
use serde::{Deserialize, Serialize};

use crate::handlers::store_error_response;
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct MessageReply {
    message: &'static str,
}

#[derive(Deserialize)]
pub struct CredentialsBody {
    username: Option<String>,
    password: Option<String>,
}

fn hash_password(password: &str) -> Result<String, (StatusCode, &'static str)> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| {
            tracing::error!("hash password: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, "Server error")
        })
}

/// POST /api/users — register a new user and announce the changed list.
pub async fn register_user(
    State(state): State<AppState>,
    Json(body): Json<CredentialsBody>,
) -> Result<(StatusCode, Json<MessageReply>), (StatusCode, &'static str)> {
    let (Some(username), Some(password)) = (body.username, body.password) else {
        return Err((StatusCode::BAD_REQUEST, "Username and password are required"));
    };
    let username = username.trim();
    if username.is_empty() || password.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "Username and password are required"));
    }

    let hash = hash_password(&password)?;
    state
        .store
        .create_user(username, &hash)
        .await
        .map_err(store_error_response)?;

    state.realtime.broadcast_users_changed();

    Ok((
        StatusCode::CREATED,
        Json(MessageReply { message: "User registered successfully" }),
    ))
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    message: &'static str,
    token: String,
    username: String,
}

#[derive(Serialize)]
struct Claims {
    sub: String,
    exp: i64,
}

/// PUT /api/users — verify credentials and issue a one-day token.
pub async fn login_user(
    State(state): State<AppState>,
    Json(body): Json<CredentialsBody>,
) -> Result<Json<LoginResponse>, (StatusCode, &'static str)> {
    let (Some(username), Some(password)) = (body.username.as_deref(), body.password.as_deref())
    else {
        return Err((StatusCode::BAD_REQUEST, "Username and password are required"));
    };

    let hash = state
        .store
        .credentials(username)
        .await
        .map_err(store_error_response)?
        .ok_or((StatusCode::NOT_FOUND, "User not found"))?;

    let parsed = PasswordHash::new(&hash).map_err(|e| {
        tracing::error!("parse stored password hash: {e}");
        (StatusCode::INTERNAL_SERVER_ERROR, "Server error")
    })?;
    if Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_err()
    {
        return Err((StatusCode::UNAUTHORIZED, "Invalid credentials"));
    }

    let claims = Claims {
        sub: username.to_string(),
        exp: (Utc::now() + Duration::days(1)).timestamp(),
    };
    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(state.jwt_secret.as_bytes()),
    )
    .map_err(|e| {
        tracing::error!("sign token: {e}");
        (StatusCode::INTERNAL_SERVER_ERROR, "Server error")
    })?;

    Ok(Json(LoginResponse {
        message: "Login successful",
        token,
        username: username.to_string(),
    }))
}

#[derive(Deserialize)]
pub struct ResetPasswordBody {
    username: Option<String>,
    #[serde(rename = "newPassword")]
    new_password: Option<String>,
}

/// PATCH /api/users — reset a password.
pub async fn reset_password(
    State(state): State<AppState>,
    Json(body): Json<ResetPasswordBody>,
) -> Result<Json<MessageReply>, (StatusCode, &'static str)> {
    let (Some(username), Some(new_password)) = (body.username.as_deref(), body.new_password)
    else {
        return Err((StatusCode::BAD_REQUEST, "Username and new password are required"));
    };

    let hash = hash_password(&new_password)?;
    let updated = state
        .store
        .update_password(username, &hash)
        .await
        .map_err(store_error_response)?;
    if !updated {
        return Err((StatusCode::NOT_FOUND, "User not found"));
    }

    Ok(Json(MessageReply { message: "Password updated successfully" }))
}

#[derive(Deserialize)]
pub struct ListUsersQuery {
    q: Option<String>,
}

/// A durable user record merged with the live presence snapshot. `online`
/// and `connId` come from the registry, not the store, so they are exact at
/// read time even while a presence write is still in flight.
#[derive(Serialize)]
pub struct UserWithPresence {
    pub username: String,
    pub online: bool,
    #[serde(rename = "connId")]
    pub conn_id: Option<u64>,
    #[serde(rename = "lastSeen")]
    pub last_seen: Option<DateTime<Utc>>,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
}

/// GET /api/users — list users, optionally filtered, with live presence.
pub async fn list_users(
    State(state): State<AppState>,
    Query(q): Query<ListUsersQuery>,
) -> Result<Json<Vec<UserWithPresence>>, (StatusCode, &'static str)> {
    let users = state
        .store
        .list_users(q.q.as_deref())
        .await
        .map_err(store_error_response)?;
    let presence = state.realtime.online_snapshot();

    Ok(Json(
        users
            .into_iter()
            .map(|u| {
                let conn_id = presence.get(&u.username).copied();
                UserWithPresence {
                    online: conn_id.is_some(),
                    conn_id,
                    username: u.username,
                    last_seen: u.last_seen,
                    created_at: u.created_at,
                }
            })
            .collect(),
    ))
}
