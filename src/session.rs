//! Per-connection state: who is connected, which group they listen on, and
//! what must be undone when they leave.
//!
//! A session without a resolvable user never subscribes and ignores every
//! frame. Closing consumes the session, so cleanup runs once.

use std::future::Future;

use serde::Deserialize;
use tokio_util::{
    sync::{CancellationToken, WaitForCancellationFuture},
    task::{task_tracker::TrackedFuture, TaskTracker},
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    db::User,
    error::Result,
    fanout::{Event, Group, Outbound, Subscription},
    matchmaking::{JudgeMatch, ParticipantMatch},
    AppState,
};

/// Every live socket session, so shutdown can wait for each one's cleanup.
///
/// Upgraded sockets outlive the HTTP server's graceful shutdown; without this
/// the runtime would drop them before `Session::close` runs.
#[derive(Clone, Default)]
pub struct Sessions {
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl Sessions {
    pub fn track<F: Future>(&self, session: F) -> TrackedFuture<F> {
        self.tracker.track_future(session)
    }

    /// Resolves once shutdown has begun; sessions should then close.
    pub fn shutdown_requested(&self) -> WaitForCancellationFuture<'_> {
        self.shutdown.cancelled()
    }

    pub fn live(&self) -> usize {
        self.tracker.len()
    }

    /// Asks every session to close and waits until their cleanup has run.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tracker.close();
        info!(sessions = self.tracker.len(), "closing sessions");
        self.tracker.wait().await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    ParticipantChat,
    ParticipantMatch,
    JudgeChat,
    JudgeMatch,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ParticipantChatCommand {
    FetchMessages { room: Uuid },
    NewMessages { room: Uuid, messages: String },
    TerminateMatch { room: Uuid },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum JudgeChatCommand {
    FetchMessages { room: Uuid },
    NewMessages { room: Uuid, messages: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum MatchCommand {
    FindMatch,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    ParticipantChat(ParticipantChatCommand),
    JudgeChat(JudgeChatCommand),
    FindParticipantMatch,
    FindJudgeMatch,
}

impl SessionKind {
    pub fn group(self, token: &str) -> Group {
        let token = token.to_owned();
        match self {
            SessionKind::ParticipantChat => Group::ParticipantChat(token),
            SessionKind::ParticipantMatch => Group::ParticipantSearching(token),
            SessionKind::JudgeChat => Group::JudgeChat(token),
            SessionKind::JudgeMatch => Group::Judging(token),
        }
    }

    /// Decodes a frame into one of the commands this kind of session accepts.
    pub fn decode(self, text: &str) -> Result<Command> {
        Ok(match self {
            SessionKind::ParticipantChat => Command::ParticipantChat(serde_json::from_str(text)?),
            SessionKind::JudgeChat => Command::JudgeChat(serde_json::from_str(text)?),
            SessionKind::ParticipantMatch => {
                let MatchCommand::FindMatch = serde_json::from_str::<MatchCommand>(text)?;
                Command::FindParticipantMatch
            }
            SessionKind::JudgeMatch => {
                let MatchCommand::FindMatch = serde_json::from_str::<MatchCommand>(text)?;
                Command::FindJudgeMatch
            }
        })
    }
}

struct Member {
    user: User,
    subscription: Subscription,
    matched: bool,
    queued: bool,
}

pub struct Session {
    state: AppState,
    kind: SessionKind,
    token: String,
    member: Option<Member>,
}

impl Session {
    /// Connects a session, subscribing it to its group when `user` is known.
    pub async fn open(state: AppState, kind: SessionKind, token: String, user: Option<User>) -> Result<Session> {
        let member = match user {
            Some(user) => {
                state.store.upsert_user(&user).await?;
                let subscription = state.hub.subscribe(&kind.group(&token));
                debug!(user = user.id, group = subscription.group(), "session subscribed");
                Some(Member {
                    user,
                    subscription,
                    matched: false,
                    queued: false,
                })
            }
            None => {
                debug!(?kind, %token, "anonymous session left idle");
                None
            }
        };

        Ok(Session {
            state,
            kind,
            token,
            member,
        })
    }

    pub fn user(&self) -> Option<&User> {
        self.member.as_ref().map(|member| &member.user)
    }

    pub fn is_subscribed(&self) -> bool {
        self.member.is_some()
    }

    /// Handles one inbound frame. Returns the direct reply, if the command has one.
    ///
    /// Failures are logged and scoped to the frame.
    pub async fn handle(&mut self, text: &str) -> Option<Outbound> {
        let member = self.member.as_mut()?;

        let command = match self.kind.decode(text) {
            Ok(command) => command,
            Err(err) => {
                warn!(user = member.user.id, kind = ?self.kind, "dropping frame: {err}");
                return None;
            }
        };

        match dispatch(&self.state, &self.token, member, command).await {
            Ok(reply) => reply,
            Err(err) => {
                warn!(user = member.user.id, kind = ?self.kind, "command failed: {err}");
                None
            }
        }
    }

    /// Waits for the next group event. Never resolves for an idle session.
    pub async fn next_event(&mut self) -> Option<Event> {
        let Some(member) = self.member.as_mut() else {
            return std::future::pending().await;
        };

        let event = member.subscription.recv().await?;
        if event.room_id().is_some() {
            member.matched = true;
        }
        Some(event)
    }

    /// Leaves the group and undoes any search this session left unfinished.
    pub async fn close(self) {
        let Some(member) = self.member else {
            return;
        };

        let cleanup = match self.kind {
            SessionKind::ParticipantMatch if !member.matched => self
                .state
                .matchmaker
                .abandon_participant_search(&self.token)
                .await
                .map(drop),
            SessionKind::JudgeMatch if member.queued && !member.matched => self
                .state
                .matchmaker
                .abandon_judge_search(&self.token, &member.user)
                .await
                .map(drop),
            _ => Ok(()),
        };

        if let Err(err) = cleanup {
            warn!(user = member.user.id, kind = ?self.kind, "session cleanup failed: {err}");
        }
        debug!(user = member.user.id, group = member.subscription.group(), "session closed");
    }
}

async fn dispatch(state: &AppState, token: &str, member: &mut Member, command: Command) -> Result<Option<Outbound>> {
    use Command::*;
    match command {
        ParticipantChat(ParticipantChatCommand::FetchMessages { room }) => {
            Ok(Some(state.chat.fetch_history(room, false).await?))
        }
        ParticipantChat(ParticipantChatCommand::NewMessages { room, messages }) => {
            state.chat.publish_participant_message(room, &member.user, &messages).await?;
            Ok(None)
        }
        ParticipantChat(ParticipantChatCommand::TerminateMatch { room }) => {
            state.chat.publish_termination(room, &member.user).await?;
            Ok(None)
        }
        JudgeChat(JudgeChatCommand::FetchMessages { room }) => Ok(Some(state.chat.fetch_history(room, true).await?)),
        JudgeChat(JudgeChatCommand::NewMessages { room, messages }) => {
            state.chat.publish_judge_message(room, &member.user, &messages).await?;
            Ok(None)
        }
        FindParticipantMatch => {
            let outcome = state.matchmaker.find_participant_match(token, &member.user).await?;
            debug!(user = member.user.id, ?outcome, "participant match attempted");
            if let ParticipantMatch::Matched { .. } = outcome {
                member.matched = true;
            }
            Ok(None)
        }
        FindJudgeMatch => {
            let outcome = state.matchmaker.find_judge_match(token, &member.user).await?;
            debug!(user = member.user.id, ?outcome, "judge match attempted");
            match outcome {
                JudgeMatch::Assigned { .. } => member.matched = true,
                JudgeMatch::Queued => member.queued = true,
                JudgeMatch::AlreadyQueued => {}
            }
            Ok(None)
        }
    }
}
