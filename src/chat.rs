use std::sync::{Arc, Weak};

use dashmap::DashMap;
use time::OffsetDateTime;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    db::{User, JUDGE_MESSAGE_MAX_CHARS, PARTICIPANT_MESSAGE_MAX_CHARS},
    error::{Error, Result},
    fanout::{Group, Hub, Outbound},
    store::Store,
    turns::TurnScheduler,
};

/// Persists room chat and fans the resulting history out to the room's groups.
///
/// Persist-then-broadcast runs under a per-room lock so every subscriber sees
/// a room's broadcasts in the order the messages were stored.
#[derive(Clone)]
pub struct Chat {
    store: Store,
    hub: Arc<Hub>,
    turns: TurnScheduler,
    locks: Arc<RoomLocks>,
}

impl Chat {
    pub fn new(store: Store, hub: Arc<Hub>, turns: TurnScheduler) -> Chat {
        Chat {
            store,
            hub,
            turns,
            locks: Arc::default(),
        }
    }

    /// Stores a participant message and sends the full participant history to
    /// participants and judges alike.
    pub async fn publish_participant_message(&self, room_id: Uuid, user: &User, body: &str) -> Result<()> {
        check_length(body, PARTICIPANT_MESSAGE_MAX_CHARS)?;

        let lock = self.locks.get(room_id);
        let _guard = lock.lock().await;

        let connection = self.store.participant_connection(room_id, user.id).await?;
        self.store.add_participant_message(connection.id, body).await?;
        let history = self.store.participant_messages(room_id).await?;

        let event = Outbound::participant_history(history);
        let token = room_id.to_string();
        self.hub.publish_to(&Group::ParticipantChat(token.clone()), event.clone());
        self.hub.publish_to(&Group::JudgeChat(token), event);
        debug!(room = %room_id, user = user.id, "participant message published");
        Ok(())
    }

    /// Stores a judge message; only judges see the judge history.
    pub async fn publish_judge_message(&self, room_id: Uuid, user: &User, body: &str) -> Result<()> {
        check_length(body, JUDGE_MESSAGE_MAX_CHARS)?;

        let lock = self.locks.get(room_id);
        let _guard = lock.lock().await;

        let connection = self.store.judge_connection(room_id, user.id).await?;
        self.store.add_judge_message(connection.id, body).await?;
        let history = self.store.judge_messages(room_id).await?;

        self.hub
            .publish_to(&Group::JudgeChat(room_id.to_string()), Outbound::judge_history(history));
        debug!(room = %room_id, user = user.id, "judge message published");
        Ok(())
    }

    /// Room history without broadcasting. Judge history is included only for judges.
    pub async fn fetch_history(&self, room_id: Uuid, with_judge_messages: bool) -> Result<Outbound> {
        let participant = self.store.participant_messages(room_id).await?;
        let judge = match with_judge_messages {
            true => Some(self.store.judge_messages(room_id).await?),
            false => None,
        };
        Ok(Outbound::fetched(participant, judge))
    }

    /// Marks the room terminated, stops its turn rotation and tells both groups who ended it.
    ///
    /// Repeated calls re-broadcast but never move the termination time.
    pub async fn publish_termination(&self, room_id: Uuid, user: &User) -> Result<bool> {
        let lock = self.locks.get(room_id);
        let _guard = lock.lock().await;

        let terminated = self.store.terminate_room(room_id).await?;
        self.turns.cancel(room_id);

        let event = Outbound::termination(user, OffsetDateTime::now_utc());
        let token = room_id.to_string();
        self.hub.publish_to(&Group::ParticipantChat(token.clone()), event.clone());
        self.hub.publish_to(&Group::JudgeChat(token), event);

        if terminated {
            info!(room = %room_id, user = user.id, "room terminated");
        }
        Ok(terminated)
    }
}

fn check_length(body: &str, max_chars: usize) -> Result<()> {
    let chars = body.chars().count();
    if chars > max_chars {
        return Err(Error::Malformed(format!("message of {chars} characters exceeds {max_chars}")));
    }
    Ok(())
}

#[derive(Default)]
struct RoomLocks {
    locks: DashMap<Uuid, Weak<tokio::sync::Mutex<()>>>,
}

impl RoomLocks {
    fn get(&self, room_id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        let mut slot = self.locks.entry(room_id).or_default();
        if let Some(lock) = slot.upgrade() {
            return lock;
        }

        let lock = Arc::new(tokio::sync::Mutex::new(()));
        *slot = Arc::downgrade(&lock);
        drop(slot);

        // `retain` write-locks every shard, so the entry guard has to be released first.
        self.locks.retain(|_, lock| lock.strong_count() > 0);
        lock
    }
}
