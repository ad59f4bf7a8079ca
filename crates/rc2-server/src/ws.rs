//! The realtime client endpoint: one WebSocket per client, attached to the
//! session of the workspace named in the path.

use std::sync::Arc;

use anyhow::Result;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use axum::response::IntoResponse;
use bytes::Bytes;
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use librc2::socket::{decode_command, encode_response};
use librc2::{Admission, ClientSocket, Session};
use rc2_protocol::model::UserId;
use rc2_protocol::{ErrorData, SessionError, SessionResponse};

use crate::auth::{TokenSigner, bearer_token};
use crate::server::AppState;

const PONG_QUEUE_LEN: usize = 8;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    token: Option<String>,
}

pub async fn ws_session(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(wspace_id): Path<String>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let user_id = authenticate(&state.signer, &headers, query.token.as_deref());
    ws.on_upgrade(move |socket| ws_session_task(socket, state, user_id, wspace_id))
}

/// The user a request's login token names, if it carries a valid one. The
/// `Authorization` header wins over the `token` query parameter.
pub fn authenticate(
    signer: &TokenSigner,
    headers: &HeaderMap,
    query_token: Option<&str>,
) -> Option<UserId> {
    let header_token = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(bearer_token);
    let token = header_token.or(query_token)?;
    match signer.verify(token) {
        Ok(login) => Some(login.user_id),
        Err(e) => {
            debug!(error = %e, "rejecting login token");
            None
        }
    }
}

async fn ws_session_task(
    socket: WebSocket,
    state: Arc<AppState>,
    user_id: Option<UserId>,
    wspace_id: String,
) {
    let Admission {
        session,
        socket: client,
        outbound,
    } = match state.registry.admit(user_id, &wspace_id).await {
        Ok(admission) => admission,
        Err(error) => {
            info!(?user_id, %wspace_id, %error, "websocket rejected");
            reject(socket, error).await;
            return;
        }
    };

    debug!(socket_id = client.id(), wspace_id = client.wspace_id(), "websocket open");
    if let Err(err) = ws_session_inner(socket, session.clone(), client.clone(), outbound).await {
        warn!(socket_id = client.id(), "websocket closed with error: {err}");
    }
    let remaining = session.remove_client(client.id()).await;
    debug!(socket_id = client.id(), remaining, "websocket closed");
}

/// Writes outbound responses while a separate task reads and handles
/// commands, so a slow command never stalls delivery to this client.
async fn ws_session_inner(
    socket: WebSocket,
    session: Arc<Session>,
    client: Arc<ClientSocket>,
    mut outbound: mpsc::Receiver<Bytes>,
) -> Result<()> {
    let (mut ws_tx, ws_rx) = socket.split();
    let (pong_tx, mut pongs) = mpsc::channel::<Bytes>(PONG_QUEUE_LEN);
    let stop = CancellationToken::new();
    let mut reader = tokio::spawn(read_commands(
        ws_rx,
        session,
        client.clone(),
        pong_tx,
        stop.clone(),
    ));

    let result: Result<()> = loop {
        tokio::select! {
            biased;

            payload = outbound.recv() => {
                let Some(payload) = payload else {
                    break Ok(());
                };
                if let Err(e) = ws_tx.send(Message::Binary(payload)).await {
                    break Err(e.into());
                }
            }
            Some(ping) = pongs.recv() => {
                if let Err(e) = ws_tx.send(Message::Pong(ping)).await {
                    break Err(e.into());
                }
            }
            _ = client.closed() => {
                debug!(socket_id = client.id(), "session closed the client");
                let _ = ws_tx.send(Message::Close(None)).await;
                break Ok(());
            }
            read = &mut reader => {
                return read?;
            }
        }
    };
    // let a command in progress finish
    stop.cancel();
    reader.await??;
    result
}

/// Handle commands from the client in arrival order until it goes away or
/// `stop` fires.
async fn read_commands(
    mut ws_rx: SplitStream<WebSocket>,
    session: Arc<Session>,
    client: Arc<ClientSocket>,
    pongs: mpsc::Sender<Bytes>,
    stop: CancellationToken,
) -> Result<()> {
    loop {
        let msg = tokio::select! {
            _ = stop.cancelled() => return Ok(()),
            msg = ws_rx.next() => msg,
        };
        let Some(msg) = msg else {
            return Ok(());
        };
        match msg? {
            Message::Binary(bytes) => dispatch(&session, &client, &bytes).await,
            Message::Text(text) => dispatch(&session, &client, text.as_str().as_bytes()).await,
            Message::Close(_) => return Ok(()),
            Message::Ping(v) => {
                let _ = pongs.try_send(v);
            }
            Message::Pong(_) => {}
        }
    }
}

async fn dispatch(session: &Session, client: &ClientSocket, data: &[u8]) {
    match decode_command(data) {
        Ok(command) => session.handle(command, client).await,
        Err(error) => {
            client.send_response(&SessionResponse::Error(ErrorData {
                transaction_id: None,
                error,
            }));
        }
    }
}

/// Send one error payload, then close.
async fn reject(mut socket: WebSocket, error: SessionError) {
    let response = SessionResponse::Error(ErrorData {
        transaction_id: None,
        error,
    });
    match encode_response(&response) {
        Ok(payload) => {
            let _ = socket.send(Message::Binary(payload)).await;
        }
        Err(e) => warn!(error = %e, "failed to encode rejection"),
    }
    let _ = socket.send(Message::Close(None)).await;
}
