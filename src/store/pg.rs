//! Diesel/Postgres implementation of [`ChatStore`]. Queries run on the
//! blocking pool; the r2d2 pool is cheap to clone into each task.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool, PooledConnection};
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use std::collections::HashMap;

use crate::models::{Message, NewMessage, NewUser, User};
use crate::schema::{messages, users};
use crate::store::{ChatStore, MessageRecord, PartnerSummary, StoreError, UserRecord};

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

type PgPool = Pool<ConnectionManager<PgConnection>>;
type PgConn = PooledConnection<ConnectionManager<PgConnection>>;

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

fn db_err(context: &'static str, e: DieselError) -> StoreError {
    tracing::error!("{context}: {e:?}");
    StoreError::Unavailable(e.to_string())
}

fn user_by_name(conn: &mut PgConn, username: &str) -> Result<Option<User>, DieselError> {
    use crate::schema::users::dsl;
    users::table
        .filter(dsl::username.eq(username))
        .select(User::as_select())
        .first(conn)
        .optional()
}

fn require_user(conn: &mut PgConn, username: &str) -> Result<User, StoreError> {
    user_by_name(conn, username)
        .map_err(|e| db_err("find user", e))?
        .ok_or(StoreError::NotFound("User"))
}

fn user_record(u: &User) -> UserRecord {
    UserRecord {
        username: u.username.clone(),
        online: u.online,
        last_seen: u.last_seen,
        created_at: u.created_at,
    }
}

impl PgStore {
    pub fn connect(database_url: &str) -> Result<Self, StoreError> {
        let manager = ConnectionManager::<PgConnection>::new(database_url);
        let pool = Pool::builder()
            .build(manager)
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(Self { pool })
    }

    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        self.blocking(|conn| {
            conn.run_pending_migrations(MIGRATIONS)
                .map(|_| ())
                .map_err(|e| {
                    tracing::error!("run migrations: {e}");
                    StoreError::Unavailable(e.to_string())
                })
        })
        .await
    }

    /// Run a closure against a pooled connection on the blocking pool.
    async fn blocking<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut PgConn) -> Result<T, StoreError> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool
                .get()
                .map_err(|e| StoreError::Unavailable(format!("database connection failed: {e}")))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("blocking task failed: {e}")))?
    }
}

#[async_trait]
impl ChatStore for PgStore {
    async fn create_user(
        &self,
        username: &str,
        password_hash: &str,
    ) -> Result<UserRecord, StoreError> {
        let new_user = NewUser {
            username: username.to_string(),
            password_hash: password_hash.to_string(),
            online: false,
            created_at: Utc::now(),
        };
        self.blocking(move |conn| {
            let user: User = diesel::insert_into(users::table)
                .values(&new_user)
                .get_result(conn)
                .map_err(|e| match e {
                    DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _) => {
                        StoreError::Conflict("Username already exists")
                    }
                    e => db_err("insert user", e),
                })?;
            Ok(user_record(&user))
        })
        .await
    }

    async fn find_user(&self, username: &str) -> Result<Option<UserRecord>, StoreError> {
        let username = username.to_string();
        self.blocking(move |conn| {
            Ok(user_by_name(conn, &username)
                .map_err(|e| db_err("find user", e))?
                .map(|u| user_record(&u)))
        })
        .await
    }

    async fn credentials(&self, username: &str) -> Result<Option<String>, StoreError> {
        let username = username.to_string();
        self.blocking(move |conn| {
            Ok(user_by_name(conn, &username)
                .map_err(|e| db_err("find credentials", e))?
                .map(|u| u.password_hash))
        })
        .await
    }

    async fn update_password(
        &self,
        username: &str,
        password_hash: &str,
    ) -> Result<bool, StoreError> {
        use crate::schema::users::dsl;
        let username = username.to_string();
        let password_hash = password_hash.to_string();
        self.blocking(move |conn| {
            let updated = diesel::update(users::table.filter(dsl::username.eq(&username)))
                .set(dsl::password_hash.eq(&password_hash))
                .execute(conn)
                .map_err(|e| db_err("update password", e))?;
            Ok(updated > 0)
        })
        .await
    }

    async fn list_users(&self, filter: Option<&str>) -> Result<Vec<UserRecord>, StoreError> {
        use crate::schema::users::dsl;
        let filter = filter.map(|s| s.to_string());
        self.blocking(move |conn| {
            let rows: Vec<User> = match filter {
                Some(q) => users::table
                    .filter(dsl::username.ilike(format!("%{q}%")))
                    .order(dsl::username.asc())
                    .select(User::as_select())
                    .load(conn),
                None => users::table
                    .order(dsl::username.asc())
                    .select(User::as_select())
                    .load(conn),
            }
            .map_err(|e| db_err("list users", e))?;
            Ok(rows.iter().map(user_record).collect())
        })
        .await
    }

    async fn set_user_online(&self, username: &str, conn_ref: i64) -> Result<(), StoreError> {
        use crate::schema::users::dsl;
        let username = username.to_string();
        self.blocking(move |conn| {
            diesel::update(users::table.filter(dsl::username.eq(&username)))
                .set((dsl::online.eq(true), dsl::conn_ref.eq(Some(conn_ref))))
                .execute(conn)
                .map_err(|e| db_err("set user online", e))?;
            Ok(())
        })
        .await
    }

    async fn set_user_offline(
        &self,
        username: &str,
        last_seen: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        use crate::schema::users::dsl;
        let username = username.to_string();
        self.blocking(move |conn| {
            diesel::update(users::table.filter(dsl::username.eq(&username)))
                .set((
                    dsl::online.eq(false),
                    dsl::conn_ref.eq(None::<i64>),
                    dsl::last_seen.eq(Some(last_seen)),
                ))
                .execute(conn)
                .map_err(|e| db_err("set user offline", e))?;
            Ok(())
        })
        .await
    }

    async fn create_message(
        &self,
        sender: &str,
        receiver: &str,
        text: &str,
    ) -> Result<MessageRecord, StoreError> {
        let sender = sender.to_string();
        let receiver = receiver.to_string();
        let text = text.to_string();
        self.blocking(move |conn| {
            let sender_row = require_user(conn, &sender)?;
            let receiver_row = require_user(conn, &receiver)?;

            let new_msg = NewMessage {
                sender_id: sender_row.id,
                receiver_id: receiver_row.id,
                text,
                created_at: Utc::now(),
                seen: false,
            };
            let msg: Message = diesel::insert_into(messages::table)
                .values(&new_msg)
                .get_result(conn)
                .map_err(|e| db_err("insert message", e))?;

            Ok(MessageRecord {
                id: msg.id,
                sender: sender_row.username,
                receiver: receiver_row.username,
                text: msg.text,
                created_at: msg.created_at,
                seen: msg.seen,
            })
        })
        .await
    }

    async fn pair_history(
        &self,
        user1: &str,
        user2: &str,
    ) -> Result<Vec<MessageRecord>, StoreError> {
        use crate::schema::messages::dsl;
        let user1 = user1.to_string();
        let user2 = user2.to_string();
        self.blocking(move |conn| {
            let a = require_user(conn, &user1)?;
            let b = require_user(conn, &user2)?;

            let rows: Vec<Message> = messages::table
                .filter(
                    dsl::sender_id
                        .eq(a.id)
                        .and(dsl::receiver_id.eq(b.id))
                        .or(dsl::sender_id.eq(b.id).and(dsl::receiver_id.eq(a.id))),
                )
                .order((dsl::created_at.asc(), dsl::id.asc()))
                .select(Message::as_select())
                .load(conn)
                .map_err(|e| db_err("pair history", e))?;

            // History view implies read: flip unseen partner -> viewer rows.
            diesel::update(
                messages::table.filter(
                    dsl::sender_id
                        .eq(b.id)
                        .and(dsl::receiver_id.eq(a.id))
                        .and(dsl::seen.eq(false)),
                ),
            )
            .set(dsl::seen.eq(true))
            .execute(conn)
            .map_err(|e| db_err("mark history seen", e))?;

            let name_of = |id: i32| {
                if id == a.id {
                    a.username.clone()
                } else {
                    b.username.clone()
                }
            };
            Ok(rows
                .into_iter()
                .map(|m| MessageRecord {
                    id: m.id,
                    sender: name_of(m.sender_id),
                    receiver: name_of(m.receiver_id),
                    text: m.text,
                    created_at: m.created_at,
                    seen: m.seen,
                })
                .collect())
        })
        .await
    }

    async fn recent_partners(&self, username: &str) -> Result<Vec<PartnerSummary>, StoreError> {
        use crate::schema::messages::dsl;
        use crate::schema::users::dsl as users_dsl;
        let username = username.to_string();
        self.blocking(move |conn| {
            let user = require_user(conn, &username)?;

            let rows: Vec<Message> = messages::table
                .filter(dsl::sender_id.eq(user.id).or(dsl::receiver_id.eq(user.id)))
                .order((dsl::created_at.desc(), dsl::id.desc()))
                .select(Message::as_select())
                .load(conn)
                .map_err(|e| db_err("recent partners", e))?;

            // Distinct partner ids, most recent interaction first.
            let mut partner_ids: Vec<i32> = Vec::new();
            let mut unseen: HashMap<i32, i64> = HashMap::new();
            for m in &rows {
                let partner = if m.sender_id == user.id { m.receiver_id } else { m.sender_id };
                if !partner_ids.contains(&partner) {
                    partner_ids.push(partner);
                }
                if m.sender_id == partner && m.receiver_id == user.id && !m.seen {
                    *unseen.entry(partner).or_default() += 1;
                }
            }

            let partner_rows: Vec<User> = users::table
                .filter(users_dsl::id.eq_any(&partner_ids))
                .select(User::as_select())
                .load(conn)
                .map_err(|e| db_err("load partners", e))?;
            let names: HashMap<i32, String> = partner_rows
                .into_iter()
                .map(|u| (u.id, u.username))
                .collect();

            Ok(partner_ids
                .into_iter()
                .filter_map(|id| {
                    names.get(&id).map(|name| PartnerSummary {
                        username: name.clone(),
                        unseen: unseen.get(&id).copied().unwrap_or(0),
                    })
                })
                .collect())
        })
        .await
    }

    async fn mark_seen(&self, viewer: &str, partner: &str) -> Result<usize, StoreError> {
        use crate::schema::messages::dsl;
        let viewer = viewer.to_string();
        let partner = partner.to_string();
        self.blocking(move |conn| {
            let viewer_row = require_user(conn, &viewer)?;
            let partner_row = require_user(conn, &partner)?;

            diesel::update(
                messages::table.filter(
                    dsl::sender_id
                        .eq(partner_row.id)
                        .and(dsl::receiver_id.eq(viewer_row.id))
                        .and(dsl::seen.eq(false)),
                ),
            )
            .set(dsl::seen.eq(true))
            .execute(conn)
            .map_err(|e| db_err("mark seen", e))
        })
        .await
    }
}
