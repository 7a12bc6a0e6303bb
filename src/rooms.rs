mod ws;

use axum::{routing::get, Router};

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/participant-chat/{room_name}/", get(ws::participant_chat))
        .route("/participant-match/{room_name}/", get(ws::participant_match))
        .route("/judge-chat/{room_name}/", get(ws::judge_chat))
        .route("/judge-match/{room_name}/", get(ws::judge_match))
}
