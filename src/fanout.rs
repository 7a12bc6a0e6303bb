//! Per-room broadcast groups and the events they carry.
//!
//! Each group is a `tokio::sync::broadcast` channel created on first subscribe
//! and dropped with its last subscriber. Publishing never blocks; a group with
//! no subscribers swallows the event.

use std::{fmt, sync::Arc};

use dashmap::DashMap;
use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tracing::warn;
use uuid::Uuid;

use crate::db::{ChatMessage, User, UserId};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Group {
    ParticipantChat(String),
    JudgeChat(String),
    ParticipantSearching(String),
    Judging(String),
}

impl fmt::Display for Group {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use Group::*;
        match self {
            ParticipantChat(token) => write!(f, "participant_chat_{token}"),
            JudgeChat(token) => write!(f, "judge_chat_{token}"),
            ParticipantSearching(token) => write!(f, "participant_searching_{token}"),
            Judging(token) => write!(f, "judging_{token}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    FetchedMessages,
    NewMessage,
    TerminationNotification,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WireMessage {
    pub username: String,
    pub content: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub userid: UserId,
}

impl From<ChatMessage> for WireMessage {
    fn from(message: ChatMessage) -> Self {
        WireMessage {
            username: message.author.username,
            content: message.body,
            timestamp: message.created_at,
            userid: message.author.id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub content_type: ContentType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub participant_messages: Option<Vec<WireMessage>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub judge_messages: Option<Vec<WireMessage>>,
}

/// Everything a session can push down its socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Outbound {
    Chat(Envelope),
    RoomId { room_id: Uuid },
}

impl Outbound {
    pub fn fetched(participant: Vec<ChatMessage>, judge: Option<Vec<ChatMessage>>) -> Outbound {
        Outbound::Chat(Envelope {
            content_type: ContentType::FetchedMessages,
            participant_messages: Some(wire(participant)),
            judge_messages: judge.map(wire),
        })
    }

    pub fn participant_history(messages: Vec<ChatMessage>) -> Outbound {
        Outbound::Chat(Envelope {
            content_type: ContentType::NewMessage,
            participant_messages: Some(wire(messages)),
            judge_messages: None,
        })
    }

    pub fn judge_history(messages: Vec<ChatMessage>) -> Outbound {
        Outbound::Chat(Envelope {
            content_type: ContentType::NewMessage,
            participant_messages: None,
            judge_messages: Some(wire(messages)),
        })
    }

    pub fn termination(by: &User, at: OffsetDateTime) -> Outbound {
        Outbound::Chat(Envelope {
            content_type: ContentType::TerminationNotification,
            participant_messages: Some(vec![WireMessage {
                username: by.username.clone(),
                content: by.id.to_string(),
                timestamp: at,
                userid: by.id,
            }]),
            judge_messages: None,
        })
    }

    pub fn room_id(&self) -> Option<Uuid> {
        match self {
            Outbound::RoomId { room_id } => Some(*room_id),
            Outbound::Chat(_) => None,
        }
    }
}

fn wire(messages: Vec<ChatMessage>) -> Vec<WireMessage> {
    messages.into_iter().map(WireMessage::from).collect()
}

pub type Event = Arc<Outbound>;

pub struct Hub {
    groups: DashMap<String, broadcast::Sender<Event>>,
    capacity: usize,
}

impl Hub {
    pub fn new(capacity: usize) -> Arc<Hub> {
        Arc::new(Hub {
            groups: DashMap::new(),
            capacity: capacity.max(1),
        })
    }

    pub fn subscribe(self: &Arc<Self>, group: &Group) -> Subscription {
        let name = group.to_string();
        let rx = self
            .groups
            .entry(name.clone())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();

        Subscription {
            hub: self.clone(),
            group: name,
            rx: Some(rx),
        }
    }

    /// Sends to every current subscriber of `group`. Returns how many received it.
    pub fn publish(&self, group: &str, event: Outbound) -> usize {
        self.groups
            .get(group)
            .and_then(|tx| tx.send(Arc::new(event)).ok())
            .unwrap_or(0)
    }

    pub fn publish_to(&self, group: &Group, event: Outbound) -> usize {
        self.publish(&group.to_string(), event)
    }

    pub fn subscriber_count(&self, group: &Group) -> usize {
        self.groups
            .get(&group.to_string())
            .map_or(0, |tx| tx.receiver_count())
    }

    fn prune(&self, group: &str) {
        self.groups.remove_if(group, |_, tx| tx.receiver_count() == 0);
    }
}

/// Membership of one fan-out group. Dropping it leaves the group.
pub struct Subscription {
    hub: Arc<Hub>,
    group: String,
    rx: Option<broadcast::Receiver<Event>>,
}

impl Subscription {
    pub fn group(&self) -> &str {
        &self.group
    }

    /// Next event for this member, or `None` once the group is gone.
    pub async fn recv(&mut self) -> Option<Event> {
        let rx = self.rx.as_mut()?;
        loop {
            match rx.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(group = %self.group, skipped, "subscriber lagged, events dropped");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    pub fn try_recv(&mut self) -> Option<Event> {
        let rx = self.rx.as_mut()?;
        loop {
            match rx.try_recv() {
                Ok(event) => return Some(event),
                Err(TryRecvError::Lagged(_)) => continue,
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        drop(self.rx.take());
        self.hub.prune(&self.group);
    }
}
