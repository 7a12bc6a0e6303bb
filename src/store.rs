use std::{str::FromStr, time::Duration};

use rand::seq::IndexedRandom;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow},
    Row, Sqlite, SqlitePool,
};
use time::OffsetDateTime;
use tracing::info;
use uuid::Uuid;

use crate::{
    db::{
        from_nanos, from_optional_nanos, to_nanos, ChatMessage, JudgeConnection, ParticipantConnection, Question, Room,
        User, UserId, WaitingJudge, JUDGE_CONNECTION_LIMIT, PARTICIPANT_CONNECTION_LIMIT,
    },
    error::{Error, Result},
    res::SCHEMA,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaleSearches {
    pub rooms: u64,
    pub judges: u64,
}

/// Outcome of one speaker rotation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flip {
    Flipped,
    Terminated,
}

/// Durable record of rooms, questions, connections and messages.
///
/// Every capacity or duplicate check is folded into the statement that writes,
/// so concurrent callers can never push a room past its limits.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn connect(url: &str) -> Result<Store> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(16)
            .connect_with(options)
            .await?;

        Ok(Store { pool })
    }

    /// A private, migrated database living as long as the store.
    pub async fn in_memory() -> Result<Store> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None::<Duration>)
            .max_lifetime(None::<Duration>)
            .connect_with(options)
            .await?;

        let store = Store { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn upsert_user(&self, user: &User) -> Result<()> {
        sqlx::query("INSERT INTO app_user (id,username) VALUES (?,?) ON CONFLICT(id) DO UPDATE SET username=excluded.username")
            .bind(user.id)
            .bind(&user.username)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn add_question(&self, title: &str) -> Result<Question> {
        let question = Question {
            id: Uuid::now_v7(),
            title: title.to_owned(),
            created_at: OffsetDateTime::now_utc(),
        };

        sqlx::query("INSERT INTO question (id,title,created_at) VALUES (?,?,?)")
            .bind(question.id)
            .bind(&question.title)
            .bind(to_nanos(question.created_at))
            .execute(&self.pool)
            .await?;

        Ok(question)
    }

    /// Inserts `titles` only when no question exists yet. Returns how many were added.
    pub async fn seed_questions<'a>(&self, titles: impl IntoIterator<Item = &'a str>) -> Result<usize> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM question")
            .fetch_one(&self.pool)
            .await?;
        if count > 0 {
            return Ok(0);
        }

        let mut added = 0;
        for title in titles.into_iter().map(str::trim).filter(|title| !title.is_empty()) {
            self.add_question(title).await?;
            added += 1;
        }

        info!(added, "seeded questions");
        Ok(added)
    }

    pub async fn question(&self, question_id: Uuid) -> Result<Question> {
        sqlx::query("SELECT * FROM question WHERE id=?")
            .bind(question_id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(question_from_row)
            .ok_or(Error::NotFound("question"))?
    }

    pub async fn random_question(&self) -> Result<Question> {
        let rows = sqlx::query("SELECT * FROM question")
            .fetch_all(&self.pool)
            .await?;

        let row = rows.choose(&mut rand::rng()).ok_or(Error::NoQuestions)?;
        question_from_row(row)
    }

    /// Creates an open room with `opener` as its first participant and current speaker.
    pub async fn open_room(&self, initial_connection_id: &str, question: &Question, opener: UserId) -> Result<Room> {
        let room = Room {
            id: Uuid::now_v7(),
            question_id: question.id,
            is_open: true,
            created_at: OffsetDateTime::now_utc(),
            activated_at: None,
            termination_at: None,
            initial_connection_id: initial_connection_id.to_owned(),
        };

        let mut tx = self.pool.begin().await?;
        sqlx::query("INSERT INTO room (id,question_id,is_open,created_at,initial_connection_id) VALUES (?,?,1,?,?)")
            .bind(room.id)
            .bind(room.question_id)
            .bind(to_nanos(room.created_at))
            .bind(&room.initial_connection_id)
            .execute(&mut *tx)
            .await?;
        insert_participant(&mut *tx, room.id, opener, true).await?;
        tx.commit().await?;

        Ok(room)
    }

    pub async fn room(&self, room_id: Uuid) -> Result<Room> {
        sqlx::query("SELECT * FROM room WHERE id=?")
            .bind(room_id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(room_from_row)
            .ok_or(Error::NotFound("room"))?
    }

    pub async fn oldest_open_room(&self) -> Result<Option<Room>> {
        sqlx::query("SELECT * FROM room WHERE is_open=1 ORDER BY created_at, rowid LIMIT 1")
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(room_from_row)
            .transpose()
    }

    /// Rooms a judge may join: matched, not terminated, and holding no connection of `user`.
    pub async fn judgeable_rooms(&self, user: UserId) -> Result<Vec<Room>> {
        sqlx::query(
            "SELECT r.* FROM room r
            WHERE r.is_open=0 AND r.activated_at IS NOT NULL AND r.termination_at IS NULL
            AND NOT EXISTS (SELECT 1 FROM judge_connection j WHERE j.room_id=r.id AND j.user_id=?)
            AND NOT EXISTS (SELECT 1 FROM participant_connection p WHERE p.room_id=r.id AND p.user_id=?)
            ORDER BY r.activated_at, r.rowid",
        )
        .bind(user)
        .bind(user)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(room_from_row)
        .collect()
    }

    /// Atomically moves an open room to matched with `user` as its second participant.
    ///
    /// Returns `false` when another caller already claimed the room, or when the
    /// participant save is rejected; the room is then left untouched.
    pub async fn claim_room(&self, room_id: Uuid, user: UserId) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let claimed = sqlx::query("UPDATE room SET is_open=0, activated_at=? WHERE id=? AND is_open=1")
            .bind(to_nanos(OffsetDateTime::now_utc()))
            .bind(room_id)
            .execute(&mut *tx)
            .await?
            .rows_affected()
            == 1;
        if !claimed {
            tx.rollback().await?;
            return Ok(false);
        }

        if !insert_participant(&mut *tx, room_id, user, false).await? {
            tx.rollback().await?;
            return Ok(false);
        }

        tx.commit().await?;
        Ok(true)
    }

    /// Sets the termination time once. Returns `true` only for the call that set it.
    pub async fn terminate_room(&self, room_id: Uuid) -> Result<bool> {
        let terminated = sqlx::query("UPDATE room SET termination_at=? WHERE id=? AND termination_at IS NULL")
            .bind(to_nanos(OffsetDateTime::now_utc()))
            .bind(room_id)
            .execute(&self.pool)
            .await?
            .rows_affected()
            == 1;
        if !terminated {
            self.room(room_id).await?;
        }
        Ok(terminated)
    }

    /// Deletes rooms opened under `initial_connection_id` that never matched.
    pub async fn remove_unactivated_rooms(&self, initial_connection_id: &str) -> Result<Vec<Uuid>> {
        let removed: Vec<(Uuid,)> =
            sqlx::query_as("DELETE FROM room WHERE initial_connection_id=? AND activated_at IS NULL RETURNING id")
                .bind(initial_connection_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(removed.into_iter().map(|(id,)| id).collect())
    }

    /// Drops the searches of sessions that did not survive a restart: every room
    /// still waiting for its second participant and every queued judge.
    pub async fn sweep_stale_searches(&self) -> Result<StaleSearches> {
        let mut tx = self.pool.begin().await?;
        let rooms = sqlx::query("DELETE FROM room WHERE activated_at IS NULL")
            .execute(&mut *tx)
            .await?
            .rows_affected();
        let judges = sqlx::query("DELETE FROM waiting_judge")
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        Ok(StaleSearches { rooms, judges })
    }

    /// Silently refuses a third participant or a second save of the same user.
    pub async fn save_participant(&self, room_id: Uuid, user: UserId, is_current_speaker: bool) -> Result<bool> {
        insert_participant(&self.pool, room_id, user, is_current_speaker).await
    }

    pub async fn has_participant(&self, room_id: Uuid, user: UserId) -> Result<bool> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM participant_connection WHERE room_id=? AND user_id=?")
            .bind(room_id)
            .bind(user)
            .fetch_one(&self.pool)
            .await?;
        Ok(count > 0)
    }

    pub async fn participant_connection(&self, room_id: Uuid, user: UserId) -> Result<ParticipantConnection> {
        sqlx::query("SELECT * FROM participant_connection WHERE room_id=? AND user_id=?")
            .bind(room_id)
            .bind(user)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(participant_from_row)
            .ok_or(Error::NotFound("participant connection"))?
    }

    pub async fn participant_connections(&self, room_id: Uuid) -> Result<Vec<ParticipantConnection>> {
        sqlx::query("SELECT * FROM participant_connection WHERE room_id=? ORDER BY created_at, rowid")
            .bind(room_id)
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(participant_from_row)
            .collect()
    }

    /// Swaps the speaker flag of both participants, unless the room is terminated.
    ///
    /// The termination check and the write are one statement, so a flip can never
    /// land after a concurrent termination.
    pub async fn flip_speakers(&self, room_id: Uuid) -> Result<Flip> {
        let flipped = sqlx::query(
            "UPDATE participant_connection SET is_current_speaker = NOT is_current_speaker
            WHERE room_id=?
            AND (SELECT COUNT(*) FROM participant_connection WHERE room_id=?)=?
            AND EXISTS (SELECT 1 FROM room WHERE id=? AND termination_at IS NULL)",
        )
        .bind(room_id)
        .bind(room_id)
        .bind(PARTICIPANT_CONNECTION_LIMIT)
        .bind(room_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if flipped as i64 == PARTICIPANT_CONNECTION_LIMIT {
            return Ok(Flip::Flipped);
        }

        if self.room(room_id).await?.is_terminated() {
            Ok(Flip::Terminated)
        } else {
            Err(Error::NotFound("participant connection"))
        }
    }

    /// Returns `false` when the room is full, the judge is already connected,
    /// or the judge is a participant of the room.
    pub async fn save_judge(&self, room_id: Uuid, user: UserId) -> Result<bool> {
        let saved = sqlx::query(
            "INSERT INTO judge_connection (id,user_id,room_id,created_at)
            SELECT ?,?,?,?
            WHERE EXISTS (SELECT 1 FROM room WHERE id=?)
            AND (SELECT COUNT(*) FROM judge_connection WHERE room_id=?) < ?
            AND NOT EXISTS (SELECT 1 FROM judge_connection WHERE room_id=? AND user_id=?)
            AND NOT EXISTS (SELECT 1 FROM participant_connection WHERE room_id=? AND user_id=?)",
        )
        .bind(Uuid::now_v7())
        .bind(user)
        .bind(room_id)
        .bind(to_nanos(OffsetDateTime::now_utc()))
        .bind(room_id)
        .bind(room_id)
        .bind(JUDGE_CONNECTION_LIMIT)
        .bind(room_id)
        .bind(user)
        .bind(room_id)
        .bind(user)
        .execute(&self.pool)
        .await?
        .rows_affected()
            == 1;
        Ok(saved)
    }

    pub async fn judge_connection(&self, room_id: Uuid, user: UserId) -> Result<JudgeConnection> {
        sqlx::query("SELECT * FROM judge_connection WHERE room_id=? AND user_id=?")
            .bind(room_id)
            .bind(user)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(judge_from_row)
            .ok_or(Error::NotFound("judge connection"))?
    }

    pub async fn judge_connections(&self, room_id: Uuid) -> Result<Vec<JudgeConnection>> {
        sqlx::query("SELECT * FROM judge_connection WHERE room_id=? ORDER BY created_at, rowid")
            .bind(room_id)
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(judge_from_row)
            .collect()
    }

    /// Queues a judge. Returns `false` when the user already has an entry.
    pub async fn enqueue_judge(&self, user: UserId, group_name: &str) -> Result<bool> {
        let queued = sqlx::query(
            "INSERT INTO waiting_judge (id,user_id,group_name,created_at) VALUES (?,?,?,?)
            ON CONFLICT(user_id) DO NOTHING",
        )
        .bind(Uuid::now_v7())
        .bind(user)
        .bind(group_name)
        .bind(to_nanos(OffsetDateTime::now_utc()))
        .execute(&self.pool)
        .await?
        .rows_affected()
            == 1;
        Ok(queued)
    }

    pub async fn is_judge_waiting(&self, user: UserId) -> Result<bool> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM waiting_judge WHERE user_id=?")
            .bind(user)
            .fetch_one(&self.pool)
            .await?;
        Ok(count > 0)
    }

    /// Queued judges, oldest first.
    pub async fn waiting_judges(&self) -> Result<Vec<WaitingJudge>> {
        sqlx::query("SELECT * FROM waiting_judge ORDER BY created_at, rowid")
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(waiting_judge_from_row)
            .collect()
    }

    pub async fn remove_waiting_judge(&self, waiting_judge_id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM waiting_judge WHERE id=?")
            .bind(waiting_judge_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Drops the queue entry `user` created from the session owning `group_name`.
    pub async fn dequeue_judge(&self, user: UserId, group_name: &str) -> Result<bool> {
        let removed = sqlx::query("DELETE FROM waiting_judge WHERE user_id=? AND group_name=?")
            .bind(user)
            .bind(group_name)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(removed > 0)
    }

    pub async fn add_participant_message(&self, connection_id: Uuid, body: &str) -> Result<()> {
        sqlx::query("INSERT INTO participant_message (id,connection_id,body,created_at) VALUES (?,?,?,?)")
            .bind(Uuid::now_v7())
            .bind(connection_id)
            .bind(body)
            .bind(to_nanos(OffsetDateTime::now_utc()))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn add_judge_message(&self, connection_id: Uuid, body: &str) -> Result<()> {
        sqlx::query("INSERT INTO judge_message (id,connection_id,body,created_at) VALUES (?,?,?,?)")
            .bind(Uuid::now_v7())
            .bind(connection_id)
            .bind(body)
            .bind(to_nanos(OffsetDateTime::now_utc()))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Participant messages of a room, oldest first.
    pub async fn participant_messages(&self, room_id: Uuid) -> Result<Vec<ChatMessage>> {
        sqlx::query(
            "SELECT u.id AS user_id, u.username, m.body, m.created_at FROM participant_message m
            JOIN participant_connection c ON c.id=m.connection_id
            JOIN app_user u ON u.id=c.user_id
            WHERE c.room_id=?
            ORDER BY m.created_at, m.rowid",
        )
        .bind(room_id)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(message_from_row)
        .collect()
    }

    /// Judge messages of a room, oldest first.
    pub async fn judge_messages(&self, room_id: Uuid) -> Result<Vec<ChatMessage>> {
        sqlx::query(
            "SELECT u.id AS user_id, u.username, m.body, m.created_at FROM judge_message m
            JOIN judge_connection c ON c.id=m.connection_id
            JOIN app_user u ON u.id=c.user_id
            WHERE c.room_id=?
            ORDER BY m.created_at, m.rowid",
        )
        .bind(room_id)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(message_from_row)
        .collect()
    }
}

async fn insert_participant<'e, E>(executor: E, room_id: Uuid, user: UserId, is_current_speaker: bool) -> Result<bool>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let saved = sqlx::query(
        "INSERT INTO participant_connection (id,user_id,room_id,is_current_speaker,created_at)
        SELECT ?,?,?,?,?
        WHERE EXISTS (SELECT 1 FROM room WHERE id=?)
        AND (SELECT COUNT(*) FROM participant_connection WHERE room_id=?) < ?
        AND NOT EXISTS (SELECT 1 FROM participant_connection WHERE room_id=? AND user_id=?)",
    )
    .bind(Uuid::now_v7())
    .bind(user)
    .bind(room_id)
    .bind(is_current_speaker)
    .bind(to_nanos(OffsetDateTime::now_utc()))
    .bind(room_id)
    .bind(room_id)
    .bind(PARTICIPANT_CONNECTION_LIMIT)
    .bind(room_id)
    .bind(user)
    .execute(executor)
    .await?
    .rows_affected()
        == 1;
    Ok(saved)
}

fn question_from_row(row: &SqliteRow) -> Result<Question> {
    Ok(Question {
        id: row.try_get("id")?,
        title: row.try_get("title")?,
        created_at: from_nanos(row.try_get("created_at")?)?,
    })
}

fn room_from_row(row: &SqliteRow) -> Result<Room> {
    Ok(Room {
        id: row.try_get("id")?,
        question_id: row.try_get("question_id")?,
        is_open: row.try_get("is_open")?,
        created_at: from_nanos(row.try_get("created_at")?)?,
        activated_at: from_optional_nanos(row.try_get("activated_at")?)?,
        termination_at: from_optional_nanos(row.try_get("termination_at")?)?,
        initial_connection_id: row.try_get("initial_connection_id")?,
    })
}

fn participant_from_row(row: &SqliteRow) -> Result<ParticipantConnection> {
    Ok(ParticipantConnection {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        room_id: row.try_get("room_id")?,
        is_current_speaker: row.try_get("is_current_speaker")?,
        created_at: from_nanos(row.try_get("created_at")?)?,
    })
}

fn judge_from_row(row: &SqliteRow) -> Result<JudgeConnection> {
    Ok(JudgeConnection {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        room_id: row.try_get("room_id")?,
        created_at: from_nanos(row.try_get("created_at")?)?,
    })
}

fn waiting_judge_from_row(row: &SqliteRow) -> Result<WaitingJudge> {
    Ok(WaitingJudge {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        group_name: row.try_get("group_name")?,
        created_at: from_nanos(row.try_get("created_at")?)?,
    })
}

fn message_from_row(row: &SqliteRow) -> Result<ChatMessage> {
    Ok(ChatMessage {
        author: User {
            id: row.try_get("user_id")?,
            username: row.try_get("username")?,
        },
        body: row.try_get("body")?,
        created_at: from_nanos(row.try_get("created_at")?)?,
    })
}
