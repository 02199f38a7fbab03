use crate::schema;
use chrono::{DateTime, Utc};
use diesel::prelude::*;

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = schema::users)]
pub struct User {
    pub id: i32,
    pub username: String,
    pub password_hash: String,
    pub online: bool,
    pub conn_ref: Option<i64>,
    pub last_seen: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// For inserting a user. `id` is assigned by the database.
#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = schema::users)]
pub struct NewUser {
    pub username: String,
    pub password_hash: String,
    pub online: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = schema::messages)]
pub struct Message {
    pub id: i64,
    pub sender_id: i32,
    pub receiver_id: i32,
    pub text: String,
    pub created_at: DateTime<Utc>,
    pub seen: bool,
}

/// For inserting a message. `id` comes from the bigserial sequence;
/// set `created_at` to `Utc::now()` so the server owns the timestamp.
#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = schema::messages)]
pub struct NewMessage {
    pub sender_id: i32,
    pub receiver_id: i32,
    pub text: String,
    pub created_at: DateTime<Utc>,
    pub seen: bool,
}
