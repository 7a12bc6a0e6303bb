use axum::{
    debug_handler,
    extract::{
        ws::{Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use serde::Deserialize;
use tracing::warn;

use crate::{
    db::User,
    fanout::Outbound,
    session::{Session, SessionKind},
    AppState,
};

#[derive(Deserialize)]
pub(crate) struct TokenQuery {
    token: Option<String>,
}

#[debug_handler]
pub(crate) async fn participant_chat(
    Path(room_name): Path<String>,
    Query(query): Query<TokenQuery>,
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> Response {
    upgrade(ws, state, SessionKind::ParticipantChat, room_name, query)
}

#[debug_handler]
pub(crate) async fn participant_match(
    Path(room_name): Path<String>,
    Query(query): Query<TokenQuery>,
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> Response {
    upgrade(ws, state, SessionKind::ParticipantMatch, room_name, query)
}

#[debug_handler]
pub(crate) async fn judge_chat(
    Path(room_name): Path<String>,
    Query(query): Query<TokenQuery>,
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> Response {
    upgrade(ws, state, SessionKind::JudgeChat, room_name, query)
}

#[debug_handler]
pub(crate) async fn judge_match(
    Path(room_name): Path<String>,
    Query(query): Query<TokenQuery>,
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> Response {
    upgrade(ws, state, SessionKind::JudgeMatch, room_name, query)
}

// Anonymous connections are accepted too; their session just never subscribes.
fn upgrade(
    ws: WebSocketUpgrade,
    state: AppState,
    kind: SessionKind,
    room_name: String,
    query: TokenQuery,
) -> Response {
    let user = state.identity.resolve(query.token.as_deref());
    let sessions = state.sessions.clone();
    ws.on_upgrade(move |socket| sessions.track(serve(socket, state, kind, room_name, user)))
}

async fn serve(
    socket: WebSocket,
    state: AppState,
    kind: SessionKind,
    room_name: String,
    user: Option<User>,
) {
    let sessions = state.sessions.clone();
    let mut session = match Session::open(state, kind, room_name, user).await {
        Ok(session) => session,
        Err(err) => {
            warn!(?kind, "could not open session: {err}");
            return;
        }
    };

    let (mut sender, mut receiver) = socket.split();
    loop {
        tokio::select! {
            inbound = receiver.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    if let Some(reply) = session.handle(text.as_str()).await {
                        if send(&mut sender, &reply).await.is_err() {
                            break;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => continue,
            },
            Some(event) = session.next_event() => {
                if send(&mut sender, &event).await.is_err() {
                    break;
                }
            }
            _ = sessions.shutdown_requested() => {
                let _ = sender.send(Message::Close(None)).await;
                break;
            }
        }
    }

    session.close().await;
}

async fn send(sender: &mut SplitSink<WebSocket, Message>, event: &Outbound) -> anyhow::Result<()> {
    let text = serde_json::to_string(event)?;
    sender.send(Message::Text(text.into())).await?;
    Ok(())
}
