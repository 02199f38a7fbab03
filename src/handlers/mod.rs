pub mod messages;
pub mod users;
pub mod ws;

use axum::http::StatusCode;

use crate::store::StoreError;

/// Map store errors onto the HTTP surface: 404 for unresolved identities,
/// 400 for uniqueness conflicts, 500 only when a durable write failed.
pub(crate) fn store_error_response(e: StoreError) -> (StatusCode, &'static str) {
    match e {
        StoreError::NotFound(_) => (StatusCode::NOT_FOUND, "User not found"),
        StoreError::Conflict(_) => (StatusCode::BAD_REQUEST, "Username already exists"),
        StoreError::Unavailable(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Server error"),
    }
}
