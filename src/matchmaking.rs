use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    db::{User, UserId},
    error::Result,
    fanout::{Group, Hub, Outbound},
    store::Store,
    turns::TurnScheduler,
};

/// How often a caller that lost a pairing race looks for a fresh open room.
const PAIRING_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParticipantMatch {
    /// A new room was opened; the caller waits for a second participant.
    Waiting { room_id: Uuid },
    Matched { room_id: Uuid },
    /// The oldest open room already holds the caller.
    Rejected { room_id: Uuid },
    /// Every attempt lost a race for the room it found.
    Contended,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JudgeMatch {
    AlreadyQueued,
    Assigned { room_id: Uuid },
    Queued,
}

/// Pairs participants into rooms and places judges into matched rooms.
#[derive(Clone)]
pub struct Matchmaker {
    store: Store,
    hub: Arc<Hub>,
    turns: TurnScheduler,

    // judge queueing and draining never interleave
    judge_queue: Arc<Mutex<()>>,
}

impl Matchmaker {
    pub fn new(store: Store, hub: Arc<Hub>, turns: TurnScheduler) -> Matchmaker {
        Matchmaker {
            store,
            hub,
            turns,
            judge_queue: Arc::default(),
        }
    }

    /// Opens a room for `user` or pairs them into the oldest open room.
    ///
    /// `token` names the caller's matchmaking session; it becomes the room's
    /// initial connection id when a room is opened.
    pub async fn find_participant_match(&self, token: &str, user: &User) -> Result<ParticipantMatch> {
        for _ in 0..PAIRING_ATTEMPTS {
            let Some(room) = self.store.oldest_open_room().await? else {
                let question = self.store.random_question().await?;
                let room = self.store.open_room(token, &question, user.id).await?;
                info!(room = %room.id, user = user.id, "room opened");
                return Ok(ParticipantMatch::Waiting { room_id: room.id });
            };

            if self.store.has_participant(room.id, user.id).await? {
                debug!(room = %room.id, user = user.id, "refusing to pair a participant with themselves");
                return Ok(ParticipantMatch::Rejected { room_id: room.id });
            }

            if !self.store.claim_room(room.id, user.id).await? {
                debug!(room = %room.id, user = user.id, "lost pairing race, retrying");
                continue;
            }

            info!(room = %room.id, user = user.id, "room matched");
            self.turns.start(room.id);

            let event = Outbound::RoomId { room_id: room.id };
            self.hub
                .publish_to(&Group::ParticipantSearching(token.to_owned()), event.clone());
            self.hub
                .publish_to(&Group::ParticipantSearching(room.initial_connection_id.clone()), event);

            self.assign_queued_judges(room.id).await?;
            return Ok(ParticipantMatch::Matched { room_id: room.id });
        }

        warn!(user = user.id, "gave up pairing after {PAIRING_ATTEMPTS} attempts");
        Ok(ParticipantMatch::Contended)
    }

    /// Moves queued judges into `room_id`, oldest first, until saves start failing.
    ///
    /// A judge whose save fails stays queued for the next matched room.
    pub async fn assign_queued_judges(&self, room_id: Uuid) -> Result<Vec<UserId>> {
        let _queue = self.judge_queue.lock().await;

        let mut assigned = Vec::new();
        for judge in self.store.waiting_judges().await? {
            if !self.store.save_judge(room_id, judge.user_id).await? {
                warn!(room = %room_id, user = judge.user_id, "queued judge skipped");
                continue;
            }

            self.hub.publish(&judge.group_name, Outbound::RoomId { room_id });
            self.store.remove_waiting_judge(judge.id).await?;
            info!(room = %room_id, user = judge.user_id, "queued judge assigned");
            assigned.push(judge.user_id);
        }

        Ok(assigned)
    }

    /// Places a judge into the first matched room that will take them, or queues them.
    pub async fn find_judge_match(&self, token: &str, user: &User) -> Result<JudgeMatch> {
        let _queue = self.judge_queue.lock().await;

        if self.store.is_judge_waiting(user.id).await? {
            return Ok(JudgeMatch::AlreadyQueued);
        }

        let group = Group::Judging(token.to_owned());
        for room in self.store.judgeable_rooms(user.id).await? {
            if self.store.save_judge(room.id, user.id).await? {
                info!(room = %room.id, user = user.id, "judge assigned");
                self.hub.publish_to(&group, Outbound::RoomId { room_id: room.id });
                return Ok(JudgeMatch::Assigned { room_id: room.id });
            }
        }

        self.store.enqueue_judge(user.id, &group.to_string()).await?;
        info!(user = user.id, "judge queued");
        Ok(JudgeMatch::Queued)
    }

    /// Removes rooms the participant session `token` opened but never saw matched.
    pub async fn abandon_participant_search(&self, token: &str) -> Result<Vec<Uuid>> {
        let removed = self.store.remove_unactivated_rooms(token).await?;
        for room_id in &removed {
            info!(room = %room_id, "abandoned room removed");
        }
        Ok(removed)
    }

    /// Drops the queue entry the judge session `token` created.
    pub async fn abandon_judge_search(&self, token: &str, user: &User) -> Result<bool> {
        let _queue = self.judge_queue.lock().await;
        let removed = self
            .store
            .dequeue_judge(user.id, &Group::Judging(token.to_owned()).to_string())
            .await?;
        if removed {
            info!(user = user.id, "queued judge left");
        }
        Ok(removed)
    }
}
