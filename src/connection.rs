//! Per-connection dispatcher: join handshake, relay loop, cleanup.

use std::sync::Arc;

use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::protocol::{self, ClientMessage, ServerMessage};
use crate::server::ServerState;
use crate::session::{
    RecvOutcome, Session, SessionReader, HANDSHAKE_TIMEOUT, POLL_TIMEOUT,
};

/// Drive one accepted connection from handshake to cleanup. All failures
/// stay inside this task; the accept loop never hears about them.
pub async fn handle_connection(stream: TcpStream, state: Arc<ServerState>) {
    let (session, mut reader) = Session::from_stream(stream);
    let peer = session.peer();

    if let Some(username) = handshake(&session, &mut reader, &state).await {
        info!(?peer, username, "client joined");
        run_session(&session, &mut reader, &username, &state).await;
    }

    // Every path ends here, so a dead session's name is always freed.
    close_session(&session, &state).await;
}

/// Wait for a `join` and negotiate the name with the registry. Returns the
/// accepted name, or `None` after a best-effort `error` reply.
async fn handshake(
    session: &Arc<Session>,
    reader: &mut SessionReader,
    state: &ServerState,
) -> Option<String> {
    let first = match reader.recv::<ClientMessage>(HANDSHAKE_TIMEOUT).await {
        Ok(RecvOutcome::Frame(message)) => message,
        Ok(RecvOutcome::Timeout) => {
            reject(session, "join timed out").await;
            return None;
        }
        Ok(RecvOutcome::Closed) => return None,
        Err(err) => {
            debug!(peer = ?session.peer(), %err, "handshake read failed");
            reject(session, "malformed join message").await;
            return None;
        }
    };

    let username = match first {
        ClientMessage::Join { username } => username.trim().to_string(),
        _ => {
            reject(session, "expected a join message").await;
            return None;
        }
    };

    if let Err(err) = state.registry.try_join(Arc::clone(session), &username) {
        debug!(peer = ?session.peer(), username, %err, "join rejected");
        reject(session, &err.to_string()).await;
        return None;
    }

    // The mapping is updated before anything is sent, so a racing join for
    // the same name already sees it taken. The snapshot includes ourselves.
    let welcome = ServerMessage::Welcome {
        message: format!("Welcome to the chat, {username}!"),
        users: state.registry.snapshot(),
        timestamp: protocol::now_timestamp(),
    };
    if session.send(&welcome).await.is_err() {
        state.registry.remove(session.id());
        return None;
    }

    let notice = ServerMessage::UserJoined {
        message: format!("{username} joined the chat"),
        username: username.clone(),
        timestamp: protocol::now_timestamp(),
    };
    state.broadcaster.broadcast(&notice, Some(session.id())).await;

    Some(username)
}

async fn reject(session: &Arc<Session>, reason: &str) {
    let _ = session
        .send(&ServerMessage::Error {
            message: reason.to_string(),
        })
        .await;
}

/// The active relay loop. A short poll keeps the task responsive to the
/// shutdown flag; a timeout is a normal outcome and simply re-polls.
async fn run_session(
    session: &Arc<Session>,
    reader: &mut SessionReader,
    username: &str,
    state: &ServerState,
) {
    while !state.is_shutting_down() {
        match reader.recv::<ClientMessage>(POLL_TIMEOUT).await {
            Ok(RecvOutcome::Timeout) => continue,
            Ok(RecvOutcome::Closed) => break,
            Ok(RecvOutcome::Frame(message)) => {
                if !handle_message(session, username, message, state).await {
                    break;
                }
            }
            Err(err) => {
                debug!(username, %err, "dropping session");
                break;
            }
        }
    }
}

/// Returns false when the session should close.
async fn handle_message(
    session: &Arc<Session>,
    username: &str,
    message: ClientMessage,
    state: &ServerState,
) -> bool {
    match message {
        ClientMessage::Chat { message } => {
            let content = message.trim();
            if content.is_empty() {
                // Whitespace-only lines are dropped, not relayed.
                return true;
            }
            info!(username, message = content, "chat");
            let outgoing = ServerMessage::Chat {
                username: username.to_string(),
                message: content.to_string(),
                timestamp: protocol::now_timestamp(),
            };
            state.broadcaster.broadcast(&outgoing, None).await;
            true
        }
        ClientMessage::Ping => session.send(&ServerMessage::Pong).await.is_ok(),
        // A repeat join or an unrecognized type is ignored, not an error.
        ClientMessage::Join { .. } | ClientMessage::Unknown => true,
    }
}

async fn close_session(session: &Arc<Session>, state: &ServerState) {
    if let Some(username) = state.registry.remove(session.id()) {
        info!(username, "client disconnected");
        let notice = ServerMessage::UserLeft {
            message: format!("{username} left the chat"),
            username,
            timestamp: protocol::now_timestamp(),
        };
        state.broadcaster.broadcast(&notice, None).await;
    }
    session.shutdown().await;
}
