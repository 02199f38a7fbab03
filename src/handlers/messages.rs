//! Message ingest, pair history / recent partners fetch, and mark-seen.
//!
//! Ingest persists first, then pushes to the receiver's connection; the
//! push outcome never affects the HTTP result. The sender relies on the
//! 201 response alone — there is no delivery acknowledgment channel.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::handlers::store_error_response;
use crate::store::MessageRecord;
use crate::AppState;

#[derive(Deserialize)]
pub struct SubmitMessageBody {
    #[serde(rename = "senderUsername")]
    sender_username: Option<String>,
    #[serde(rename = "receiverUsername")]
    receiver_username: Option<String>,
    text: Option<String>,
}

/// POST /api/messages — persist a message and push it live to the receiver.
pub async fn submit_message(
    State(state): State<AppState>,
    Json(body): Json<SubmitMessageBody>,
) -> Result<(StatusCode, Json<MessageRecord>), (StatusCode, &'static str)> {
    let (Some(sender), Some(receiver), Some(text)) =
        (body.sender_username, body.receiver_username, body.text)
    else {
        return Err((StatusCode::BAD_REQUEST, "Missing required fields"));
    };
    let (sender, receiver, text) = (sender.trim(), receiver.trim(), text.trim());
    if sender.is_empty() || receiver.is_empty() || text.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "Missing required fields"));
    }

    let message = state
        .store
        .create_message(sender, receiver, text)
        .await
        .map_err(store_error_response)?;

    // Receiver only; the sender already has the message from this response.
    state.realtime.push_message(&message);

    Ok((StatusCode::CREATED, Json(message)))
}

#[derive(Deserialize)]
pub struct FetchMessagesQuery {
    user1: Option<String>,
    user2: Option<String>,
    #[serde(default)]
    recent: bool,
}

/// GET /api/messages — pair history (`user1` + `user2`, implicitly marking
/// unseen partner messages as seen) or recent partners (`user1` +
/// `recent=true`, with unseen counts).
pub async fn fetch_messages(
    State(state): State<AppState>,
    Query(q): Query<FetchMessagesQuery>,
) -> Result<Response, (StatusCode, &'static str)> {
    if q.recent {
        let Some(user1) = q.user1.as_deref() else {
            return Err((StatusCode::BAD_REQUEST, "Missing user parameters"));
        };
        let partners = state
            .store
            .recent_partners(user1)
            .await
            .map_err(store_error_response)?;
        return Ok(Json(partners).into_response());
    }

    let (Some(user1), Some(user2)) = (q.user1.as_deref(), q.user2.as_deref()) else {
        return Err((StatusCode::BAD_REQUEST, "Missing user parameters"));
    };
    let history = state
        .store
        .pair_history(user1, user2)
        .await
        .map_err(store_error_response)?;
    Ok(Json(history).into_response())
}

#[derive(Deserialize)]
pub struct MarkSeenBody {
    user1: Option<String>,
    user2: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct MarkSeenResponse {
    message: &'static str,
    #[serde(rename = "modifiedCount")]
    modified_count: usize,
}

/// POST /api/messages/mark-seen — bulk-mark messages from `user2` to
/// `user1` as seen, then notify `user2`'s connection if anything changed.
pub async fn mark_seen(
    State(state): State<AppState>,
    Json(body): Json<MarkSeenBody>,
) -> Result<Json<MarkSeenResponse>, (StatusCode, &'static str)> {
    let (Some(viewer), Some(partner)) = (body.user1.as_deref(), body.user2.as_deref()) else {
        return Err((StatusCode::BAD_REQUEST, "Both usernames are required"));
    };

    let modified = state
        .store
        .mark_seen(viewer, partner)
        .await
        .map_err(store_error_response)?;

    // Nothing changed means nothing to announce; re-invocations stay silent.
    if modified > 0 {
        state.realtime.push_seen(viewer, partner);
    }

    Ok(Json(MarkSeenResponse {
        message: "Messages marked as seen",
        modified_count: modified,
    }))
}
