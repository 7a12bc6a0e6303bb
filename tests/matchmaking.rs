use std::collections::HashSet;

use sparring::{
    error::Error,
    fanout::Group,
    matchmaking::{JudgeMatch, ParticipantMatch},
    store::{StaleSearches, Store},
    AppState,
};

mod common;
use common::{file_state, file_store, matched_room, register, state, user};

#[tokio::test]
async fn second_participant_is_paired_into_open_room() {
    let state = state().await;
    let [a, b] = <[_; 2]>::try_from(register(&state, [1, 2]).await).unwrap();

    let mut a_search = state.hub.subscribe(&Group::ParticipantSearching("abc".into()));
    let mut b_search = state.hub.subscribe(&Group::ParticipantSearching("xyz".into()));

    let ParticipantMatch::Waiting { room_id } = state.matchmaker.find_participant_match("abc", &a).await.unwrap() else {
        panic!("first participant should open a room");
    };

    let room = state.store.room(room_id).await.unwrap();
    assert!(room.is_open);
    assert!(!room.is_matched());
    assert_eq!(room.initial_connection_id, "abc");
    let connections = state.store.participant_connections(room_id).await.unwrap();
    assert_eq!(connections.len(), 1);
    assert_eq!(connections[0].user_id, a.id);
    assert!(connections[0].is_current_speaker);
    assert!(a_search.try_recv().is_none());

    assert_eq!(
        state.matchmaker.find_participant_match("xyz", &b).await.unwrap(),
        ParticipantMatch::Matched { room_id }
    );

    let room = state.store.room(room_id).await.unwrap();
    assert!(!room.is_open);
    assert!(room.activated_at.is_some());
    assert!(room.termination_at.is_none());
    assert_eq!(a_search.try_recv().unwrap().room_id(), Some(room_id));
    assert_eq!(b_search.try_recv().unwrap().room_id(), Some(room_id));
    assert!(state.turns.is_running(room_id));

    let speakers: Vec<(i64, bool)> = state
        .store
        .participant_connections(room_id)
        .await
        .unwrap()
        .iter()
        .map(|c| (c.user_id, c.is_current_speaker))
        .collect();
    assert_eq!(speakers, vec![(a.id, true), (b.id, false)]);
}

#[tokio::test]
async fn participant_is_never_paired_with_themselves() {
    let state = state().await;
    let a = register(&state, [1]).await.remove(0);

    let ParticipantMatch::Waiting { room_id } = state.matchmaker.find_participant_match("abc", &a).await.unwrap() else {
        panic!("first participant should open a room");
    };
    assert_eq!(
        state.matchmaker.find_participant_match("def", &a).await.unwrap(),
        ParticipantMatch::Rejected { room_id }
    );

    let room = state.store.room(room_id).await.unwrap();
    assert!(room.is_open);
    assert_eq!(state.store.participant_connections(room_id).await.unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_pairing_has_a_single_winner() {
    for _ in 0..5 {
        let dir = tempfile::tempdir().unwrap();
        race_for_an_open_room(&file_state(dir.path()).await).await;
    }
}

async fn race_for_an_open_room(state: &AppState) {
    let users = register(state, 1..=11).await;

    let ParticipantMatch::Waiting { room_id: first } =
        state.matchmaker.find_participant_match("opener", &users[0]).await.unwrap()
    else {
        panic!("first participant should open a room");
    };

    let mut tasks = Vec::new();
    for user in users[1..].iter().cloned() {
        let matchmaker = state.matchmaker.clone();
        tasks.push(tokio::spawn(async move {
            matchmaker.find_participant_match(&format!("token-{}", user.id), &user).await
        }));
    }

    let mut outcomes = Vec::new();
    for task in tasks {
        outcomes.push(task.await.unwrap().unwrap());
    }

    let winners = outcomes
        .iter()
        .filter(|outcome| **outcome == ParticipantMatch::Matched { room_id: first })
        .count();
    assert_eq!(winners, 1);
    assert_eq!(state.store.participant_connections(first).await.unwrap().len(), 2);

    let mut rooms = HashSet::from([first]);
    for outcome in &outcomes {
        match outcome {
            ParticipantMatch::Waiting { room_id }
            | ParticipantMatch::Matched { room_id }
            | ParticipantMatch::Rejected { room_id } => {
                rooms.insert(*room_id);
            }
            ParticipantMatch::Contended => {}
        }
    }

    for room_id in rooms {
        let room = state.store.room(room_id).await.unwrap();
        let participants = state.store.participant_connections(room_id).await.unwrap().len();
        assert!(participants <= 2);
        if room.is_matched() {
            assert!(!room.is_open);
            assert_eq!(participants, 2);
        } else {
            assert!(room.is_open);
            assert_eq!(participants, 1);
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_judges_never_exceed_five() {
    let dir = tempfile::tempdir().unwrap();
    let state = file_state(dir.path()).await;
    let [a, b] = <[_; 2]>::try_from(register(&state, [1, 2]).await).unwrap();
    let room_id = matched_room(&state, &a, &b).await;
    let judges = register(&state, 100..128).await;

    let mut tasks = Vec::new();
    for judge in judges {
        let store = state.store.clone();
        tasks.push(tokio::spawn(async move { store.save_judge(room_id, judge.id).await }));
    }

    let mut saved = 0;
    for task in tasks {
        if task.await.unwrap().unwrap() {
            saved += 1;
        }
    }
    assert_eq!(saved, 5);
    assert_eq!(state.store.judge_connections(room_id).await.unwrap().len(), 5);
}

#[tokio::test]
async fn queued_judge_is_assigned_when_a_room_matches() {
    let state = state().await;
    let [a, b, j] = <[_; 3]>::try_from(register(&state, [1, 2, 10]).await).unwrap();
    let mut judging = state.hub.subscribe(&Group::Judging("j-token".into()));

    assert_eq!(state.matchmaker.find_judge_match("j-token", &j).await.unwrap(), JudgeMatch::Queued);
    assert!(state.store.is_judge_waiting(j.id).await.unwrap());
    assert_eq!(
        state.matchmaker.find_judge_match("j-token", &j).await.unwrap(),
        JudgeMatch::AlreadyQueued
    );

    state.matchmaker.find_participant_match("abc", &a).await.unwrap();
    let ParticipantMatch::Matched { room_id } = state.matchmaker.find_participant_match("xyz", &b).await.unwrap() else {
        panic!("second participant should be paired");
    };

    assert_eq!(judging.try_recv().unwrap().room_id(), Some(room_id));
    assert!(!state.store.is_judge_waiting(j.id).await.unwrap());
    let judges = state.store.judge_connections(room_id).await.unwrap();
    assert_eq!(judges.len(), 1);
    assert_eq!(judges[0].user_id, j.id);
}

#[tokio::test]
async fn judge_joins_existing_matched_room() {
    let state = state().await;
    let [a, b, j] = <[_; 3]>::try_from(register(&state, [1, 2, 10]).await).unwrap();
    let room_id = matched_room(&state, &a, &b).await;
    let mut judging = state.hub.subscribe(&Group::Judging("j-token".into()));

    assert_eq!(
        state.matchmaker.find_judge_match("j-token", &j).await.unwrap(),
        JudgeMatch::Assigned { room_id }
    );
    assert_eq!(judging.try_recv().unwrap().room_id(), Some(room_id));
    assert!(!state.store.is_judge_waiting(j.id).await.unwrap());
}

#[tokio::test]
async fn participant_cannot_judge_their_own_room() {
    let state = state().await;
    let [a, b] = <[_; 2]>::try_from(register(&state, [1, 2]).await).unwrap();
    let room_id = matched_room(&state, &a, &b).await;

    assert_eq!(state.matchmaker.find_judge_match("a-judging", &a).await.unwrap(), JudgeMatch::Queued);
    assert!(state.store.judge_connections(room_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn sixth_judge_stays_unmatched() {
    let state = state().await;
    let users = register(&state, [1, 2, 10, 11, 12, 13, 14, 15]).await;
    let room_id = matched_room(&state, &users[0], &users[1]).await;

    for judge in &users[2..7] {
        assert_eq!(
            state.matchmaker.find_judge_match(&format!("j{}", judge.id), judge).await.unwrap(),
            JudgeMatch::Assigned { room_id }
        );
    }

    let sixth = &users[7];
    let mut judging = state.hub.subscribe(&Group::Judging("j15".into()));
    assert_eq!(state.matchmaker.find_judge_match("j15", sixth).await.unwrap(), JudgeMatch::Queued);
    assert!(judging.try_recv().is_none());
    assert_eq!(state.store.judge_connections(room_id).await.unwrap().len(), 5);
}

#[tokio::test]
async fn judge_queue_drains_oldest_first() {
    let state = state().await;
    let users = register(&state, [1, 2, 10, 11, 12, 13, 14, 15, 16]).await;
    for judge in &users[2..] {
        assert_eq!(
            state.matchmaker.find_judge_match(&format!("j{}", judge.id), judge).await.unwrap(),
            JudgeMatch::Queued
        );
    }

    state.matchmaker.find_participant_match("abc", &users[0]).await.unwrap();
    let ParticipantMatch::Matched { room_id } = state.matchmaker.find_participant_match("xyz", &users[1]).await.unwrap()
    else {
        panic!("second participant should be paired");
    };

    let assigned: Vec<i64> = state
        .store
        .judge_connections(room_id)
        .await
        .unwrap()
        .iter()
        .map(|c| c.user_id)
        .collect();
    assert_eq!(assigned, vec![10, 11, 12, 13, 14]);

    let still_waiting: Vec<i64> = state
        .store
        .waiting_judges()
        .await
        .unwrap()
        .iter()
        .map(|w| w.user_id)
        .collect();
    assert_eq!(still_waiting, vec![15, 16]);
}

#[tokio::test]
async fn abandoned_searches_are_cleaned_up() {
    let state = state().await;
    let [a, j] = <[_; 2]>::try_from(register(&state, [1, 10]).await).unwrap();

    let ParticipantMatch::Waiting { room_id } = state.matchmaker.find_participant_match("abc", &a).await.unwrap() else {
        panic!("first participant should open a room");
    };
    assert_eq!(state.matchmaker.abandon_participant_search("abc").await.unwrap(), vec![room_id]);
    assert!(matches!(state.store.room(room_id).await, Err(Error::NotFound("room"))));
    assert!(state.store.oldest_open_room().await.unwrap().is_none());

    state.matchmaker.find_judge_match("j-token", &j).await.unwrap();
    assert!(!state.matchmaker.abandon_judge_search("other-token", &j).await.unwrap());
    assert!(state.matchmaker.abandon_judge_search("j-token", &j).await.unwrap());
    assert!(!state.store.is_judge_waiting(j.id).await.unwrap());
}

#[tokio::test]
async fn searches_left_by_a_dead_process_are_swept_on_restart() {
    let dir = tempfile::tempdir().unwrap();
    let state = file_state(dir.path()).await;
    let [a, b, c, j] = <[_; 4]>::try_from(register(&state, [1, 2, 3, 10]).await).unwrap();
    let kept = matched_room(&state, &a, &b).await;
    assert!(state.store.save_judge(kept, j.id).await.unwrap());

    let ParticipantMatch::Waiting { room_id: stale } = state.matchmaker.find_participant_match("abc", &c).await.unwrap()
    else {
        panic!("lone participant should open a room");
    };
    assert_eq!(state.matchmaker.find_judge_match("a-judging", &a).await.unwrap(), JudgeMatch::Queued);

    // Neither session gets to close; the process just goes away.
    state.store.pool().close().await;
    drop(state);

    let store = file_store(dir.path()).await;
    assert_eq!(store.sweep_stale_searches().await.unwrap(), StaleSearches { rooms: 1, judges: 1 });
    assert!(matches!(store.room(stale).await, Err(Error::NotFound("room"))));
    assert!(store.oldest_open_room().await.unwrap().is_none());
    assert!(!store.is_judge_waiting(a.id).await.unwrap());

    assert!(store.room(kept).await.unwrap().is_matched());
    assert_eq!(store.participant_connections(kept).await.unwrap().len(), 2);
    assert_eq!(store.judge_connections(kept).await.unwrap().len(), 1);
    assert_eq!(store.sweep_stale_searches().await.unwrap(), StaleSearches { rooms: 0, judges: 0 });
}

#[tokio::test]
async fn opening_a_room_needs_a_question() {
    let store = Store::in_memory().await.unwrap();
    let state = sparring::AppState::new(
        store,
        sparring::auth::Identity::new(common::SECRET),
        Default::default(),
        16,
    );
    let a = user(1);
    state.store.upsert_user(&a).await.unwrap();

    assert!(matches!(
        state.matchmaker.find_participant_match("abc", &a).await,
        Err(Error::NoQuestions)
    ));
}

#[tokio::test]
async fn rooms_persist_in_a_database_file() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("rooms.db").display());

    let store = Store::connect(&url).await.unwrap();
    store.migrate().await.unwrap();
    store.seed_questions(["Should juries be abolished?"]).await.unwrap();
    store.upsert_user(&user(1)).await.unwrap();
    let question = store.random_question().await.unwrap();
    let room = store.open_room("abc", &question, 1).await.unwrap();
    store.pool().close().await;

    let store = Store::connect(&url).await.unwrap();
    store.migrate().await.unwrap();
    assert_eq!(store.seed_questions(["ignored"]).await.unwrap(), 0);
    let reopened = store.oldest_open_room().await.unwrap().unwrap();
    assert_eq!(reopened.id, room.id);
    assert_eq!(reopened.question_id, question.id);
}
