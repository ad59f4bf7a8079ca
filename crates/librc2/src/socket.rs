//! One client's realtime connection as seen by a session.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use rc2_protocol::{SessionCommand, SessionError, SessionResponse, User, WorkspaceId};

/// Outbound messages buffered per client before new ones are dropped.
pub const OUTBOUND_QUEUE_LEN: usize = 256;

pub type SocketId = u64;

static NEXT_SOCKET_ID: AtomicU64 = AtomicU64::new(1);

/// A connected client. The transport (WebSocket) side drains the receiver
/// returned by [`ClientSocket::new`] and disconnects once [`ClientSocket::closed`]
/// resolves.
#[derive(Debug)]
pub struct ClientSocket {
    id: SocketId,
    user: User,
    wspace_id: WorkspaceId,
    watching_variables: AtomicBool,
    outbound: mpsc::Sender<Bytes>,
    close: CancellationToken,
}

impl ClientSocket {
    pub fn new(user: User, wspace_id: WorkspaceId) -> (Arc<ClientSocket>, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_LEN);
        let socket = ClientSocket {
            id: NEXT_SOCKET_ID.fetch_add(1, Ordering::Relaxed),
            user,
            wspace_id,
            watching_variables: AtomicBool::new(false),
            outbound: tx,
            close: CancellationToken::new(),
        };
        (Arc::new(socket), rx)
    }

    pub fn id(&self) -> SocketId {
        self.id
    }

    pub fn user(&self) -> &User {
        &self.user
    }

    /// The workspace whose session this socket belongs to.
    pub fn wspace_id(&self) -> WorkspaceId {
        self.wspace_id
    }

    pub fn watching_variables(&self) -> bool {
        self.watching_variables.load(Ordering::Acquire)
    }

    pub fn set_watching_variables(&self, watching: bool) {
        self.watching_variables.store(watching, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.close.is_cancelled() || self.outbound.is_closed()
    }

    /// Ask the transport side to disconnect this client.
    pub fn close(&self) {
        self.close.cancel();
    }

    pub async fn closed(&self) {
        self.close.cancelled().await
    }

    /// Queue an already encoded message. Returns false if it was dropped.
    pub fn send(&self, payload: Bytes) -> bool {
        match self.outbound.try_send(payload) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(socket_id = self.id, "client outbound queue full, dropping message");
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(socket_id = self.id, "client connection already closed");
                false
            }
        }
    }

    pub fn send_response(&self, response: &SessionResponse) -> bool {
        match encode_response(response) {
            Ok(payload) => self.send(payload),
            Err(e) => {
                warn!(socket_id = self.id, error = %e, "failed to encode response");
                false
            }
        }
    }
}

/// Parse one inbound client frame.
pub fn decode_command(data: &[u8]) -> Result<SessionCommand, SessionError> {
    serde_json::from_slice(data).map_err(|e| {
        debug!(error = %e, "undecodable client command");
        SessionError::InvalidRequest
    })
}

pub fn encode_response(response: &SessionResponse) -> Result<Bytes, serde_json::Error> {
    serde_json::to_vec(response).map(Bytes::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rc2_protocol::{ErrorData, ExecuteParams};

    fn user() -> User {
        serde_json::from_str(r#"{"id": 1, "version": 1, "login": "alice", "email": "a@rc2.io"}"#)
            .unwrap()
    }

    #[test]
    fn ids_are_unique() {
        let (a, _rx_a) = ClientSocket::new(user(), 1);
        let (b, _rx_b) = ClientSocket::new(user(), 1);
        assert_ne!(a.id(), b.id());
    }

    #[tokio::test]
    async fn send_delivers_in_order() {
        let (socket, mut rx) = ClientSocket::new(user(), 1);
        assert!(socket.send(Bytes::from_static(b"one")));
        assert!(socket.send(Bytes::from_static(b"two")));
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"one"));
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"two"));
    }

    #[tokio::test]
    async fn full_queue_drops() {
        let (socket, mut rx) = ClientSocket::new(user(), 1);
        for _ in 0..OUTBOUND_QUEUE_LEN {
            assert!(socket.send(Bytes::from_static(b"x")));
        }
        assert!(!socket.send(Bytes::from_static(b"overflow")));
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"x"));
    }

    #[test]
    fn closed_receiver_drops() {
        let (socket, rx) = ClientSocket::new(user(), 1);
        drop(rx);
        assert!(socket.is_closed());
        assert!(!socket.send(Bytes::from_static(b"x")));
    }

    #[tokio::test]
    async fn close_wakes_transport() {
        let (socket, _rx) = ClientSocket::new(user(), 1);
        let waiter = {
            let socket = socket.clone();
            tokio::spawn(async move { socket.closed().await })
        };
        socket.close();
        waiter.await.unwrap();
        assert!(socket.is_closed());
    }

    #[tokio::test]
    async fn send_response_encodes_json() {
        let (socket, mut rx) = ClientSocket::new(user(), 1);
        socket.send_response(&SessionResponse::Error(ErrorData {
            transaction_id: None,
            error: SessionError::PermissionDenied,
        }));
        let bytes = rx.recv().await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["error"], "permissionDenied");
    }

    #[test]
    fn decode_commands() {
        let cmd = decode_command(br#"{"cmd": "execute", "transactionId": "t1", "source": "1+1"}"#)
            .unwrap();
        assert_eq!(
            cmd,
            SessionCommand::Execute(ExecuteParams {
                transaction_id: "t1".to_string(),
                source: "1+1".to_string(),
                is_user_initiated: true,
                context_id: None,
            })
        );
        assert_eq!(
            decode_command(br#"{"cmd": "bogus"}"#),
            Err(SessionError::InvalidRequest)
        );
        assert_eq!(decode_command(b"not json"), Err(SessionError::InvalidRequest));
    }
}
