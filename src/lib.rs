pub mod auth;
pub mod chat;
pub mod config;
pub mod db;
pub mod error;
pub mod fanout;
pub mod matchmaking;
pub mod res;
pub mod rooms;
pub mod session;
pub mod store;
pub mod turns;

use std::sync::Arc;

use axum::{
    debug_handler,
    extract::{FromRef, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::{json, Value};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::{
    auth::Identity,
    chat::Chat,
    fanout::Hub,
    matchmaking::Matchmaker,
    session::Sessions,
    store::Store,
    turns::{TurnScheduler, TurnSettings},
};

#[derive(Clone, FromRef)]
pub struct AppState {
    pub store: Store,
    pub hub: Arc<Hub>,
    pub turns: TurnScheduler,
    pub matchmaker: Matchmaker,
    pub chat: Chat,
    pub identity: Identity,
    pub sessions: Sessions,
}

impl AppState {
    pub fn new(
        store: Store,
        identity: Identity,
        turns: TurnSettings,
        group_capacity: usize,
    ) -> AppState {
        let hub = Hub::new(group_capacity);
        let turns = TurnScheduler::new(store.clone(), turns);
        AppState {
            matchmaker: Matchmaker::new(store.clone(), hub.clone(), turns.clone()),
            chat: Chat::new(store.clone(), hub.clone(), turns.clone()),
            store,
            hub,
            turns,
            identity,
            sessions: Sessions::default(),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .nest("/ws", rooms::router())
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

#[debug_handler(state = AppState)]
async fn health(State(store): State<Store>) -> AppResult<Json<Value>> {
    store.ping().await?;
    Ok(Json(json!({ "status": "ok" })))
}

pub type AppResult<T> = Result<T, AppError>;
#[derive(Debug)]
pub struct AppError(pub anyhow::Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("{:#}", self.0),
        )
            .into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}
