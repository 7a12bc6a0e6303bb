//! Shared setup for the integration tests.
#![allow(dead_code)]

use std::{path::Path, time::Duration};

use sparring::{
    auth::Identity,
    db::User,
    fanout::{Envelope, Event, Outbound},
    store::Store,
    turns::TurnSettings,
    AppState,
};
use uuid::Uuid;

pub const SECRET: &str = "test-secret-for-integration-tests";

pub fn user(id: i64) -> User {
    User {
        id,
        username: format!("user{id}"),
    }
}

pub fn fast_turns(limit: u32) -> TurnSettings {
    TurnSettings {
        interval: Duration::from_millis(5),
        limit,
    }
}

pub async fn state() -> AppState {
    state_with(TurnSettings::default()).await
}

pub async fn state_with(turns: TurnSettings) -> AppState {
    let store = Store::in_memory().await.unwrap();
    store
        .seed_questions(["Is a hot dog a sandwich?", "Should homework be banned?"])
        .await
        .unwrap();
    AppState::new(store, Identity::new(SECRET), turns, 16)
}

/// State over a database file with a pooled connection per caller, for races.
pub async fn file_state(dir: &Path) -> AppState {
    let store = file_store(dir).await;
    store
        .seed_questions(["Is a hot dog a sandwich?", "Should homework be banned?"])
        .await
        .unwrap();
    AppState::new(store, Identity::new(SECRET), TurnSettings::default(), 16)
}

pub async fn file_store(dir: &Path) -> Store {
    let url = format!("sqlite://{}", dir.join("sparring.db").display());
    let store = Store::connect(&url).await.unwrap();
    store.migrate().await.unwrap();
    store
}

/// Inserts users so connections can reference them.
pub async fn register(state: &AppState, ids: impl IntoIterator<Item = i64>) -> Vec<User> {
    let mut users = Vec::new();
    for id in ids {
        let user = user(id);
        state.store.upsert_user(&user).await.unwrap();
        users.push(user);
    }
    users
}

/// A matched room between `a` and `b`, built through the store so no rotation starts.
pub async fn matched_room(state: &AppState, a: &User, b: &User) -> Uuid {
    let question = state.store.random_question().await.unwrap();
    let room = state.store.open_room(&format!("open-{}", a.id), &question, a.id).await.unwrap();
    assert!(state.store.claim_room(room.id, b.id).await.unwrap());
    room.id
}

pub fn envelope(event: &Outbound) -> &Envelope {
    match event {
        Outbound::Chat(envelope) => envelope,
        other => panic!("expected a chat envelope, got {other:?}"),
    }
}

pub fn contents(event: &Event, judge: bool) -> Vec<String> {
    let envelope = envelope(event);
    let messages = if judge {
        envelope.judge_messages.as_ref()
    } else {
        envelope.participant_messages.as_ref()
    };
    messages
        .expect("message list present")
        .iter()
        .map(|message| message.content.clone())
        .collect()
}
