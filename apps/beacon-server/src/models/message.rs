use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::Serialize;

use crate::db::schema::messages;

/// A persisted broadcast message, as returned by a message log.
#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Serialize)]
#[diesel(table_name = messages)]
#[diesel(check_for_backend(diesel::pg::Pg))]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: i64,
    pub sender_id: String,
    pub sender_username: String,
    pub content: String,
    pub room_id: String,
    #[serde(rename = "timestamp")]
    pub created_at: DateTime<Utc>,
    pub is_deleted: bool,
}

/// What the hub hands to a message log on `append`.
///
/// `created_at` is stamped by the hub when the broadcast is triggered, not
/// by the log when it gets around to writing.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub sender_id: String,
    pub sender_username: String,
    pub content: String,
    pub room_id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = messages)]
pub struct MessageRow<'a> {
    pub id: i64,
    pub sender_id: &'a str,
    pub sender_username: &'a str,
    pub content: &'a str,
    pub room_id: &'a str,
    pub created_at: DateTime<Utc>,
    pub is_deleted: bool,
}
