use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::Result;

pub type UserId = i64;

pub const PARTICIPANT_CONNECTION_LIMIT: i64 = 2;
pub const JUDGE_CONNECTION_LIMIT: i64 = 5;

pub const PARTICIPANT_MESSAGE_MAX_CHARS: usize = 2500;
pub const JUDGE_MESSAGE_MAX_CHARS: usize = 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: UserId,
    pub username: String,
}

#[derive(Debug, Clone)]
pub struct Question {
    pub id: Uuid,
    pub title: String,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct Room {
    pub id: Uuid,
    pub question_id: Uuid,
    pub is_open: bool,
    pub created_at: OffsetDateTime,
    pub activated_at: Option<OffsetDateTime>,
    pub termination_at: Option<OffsetDateTime>,

    // the matchmaking token of the participant who opened the room
    pub initial_connection_id: String,
}

impl Room {
    pub fn is_matched(&self) -> bool {
        self.activated_at.is_some()
    }

    pub fn is_terminated(&self) -> bool {
        self.termination_at.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct ParticipantConnection {
    pub id: Uuid,
    pub user_id: UserId,
    pub room_id: Uuid,
    pub is_current_speaker: bool,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct JudgeConnection {
    pub id: Uuid,
    pub user_id: UserId,
    pub room_id: Uuid,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct WaitingJudge {
    pub id: Uuid,
    pub user_id: UserId,
    pub group_name: String,
    pub created_at: OffsetDateTime,
}

/// A participant or judge message joined with its author.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub author: User,
    pub body: String,
    pub created_at: OffsetDateTime,
}

// Timestamps are stored as unix nanoseconds so ORDER BY is numeric.
pub(crate) fn to_nanos(at: OffsetDateTime) -> i64 {
    at.unix_timestamp_nanos() as i64
}

pub(crate) fn from_nanos(nanos: i64) -> Result<OffsetDateTime> {
    Ok(OffsetDateTime::from_unix_timestamp_nanos(nanos as i128)?)
}

pub(crate) fn from_optional_nanos(nanos: Option<i64>) -> Result<Option<OffsetDateTime>> {
    nanos.map(from_nanos).transpose()
}
