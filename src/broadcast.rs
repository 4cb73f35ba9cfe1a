use std::sync::Arc;

use tracing::debug;

use crate::protocol::{self, ServerMessage};
use crate::registry::Registry;
use crate::session::{Session, SessionId};

/// Fans messages out to the current membership.
///
/// Delivery is best-effort per recipient: one dead peer never aborts
/// delivery to the rest. Each session's writer mutex serializes writes, so
/// two broadcasts issued in sequence arrive in that order on any recipient
/// that gets both; no ordering is promised across recipients.
#[derive(Clone)]
pub struct Broadcaster {
    registry: Arc<Registry>,
}

impl Broadcaster {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    /// Deliver `message` to every registered session except `exclude`.
    /// Recipients whose send fails are evicted from the registry, and the
    /// survivors get one `user_left` notice per evicted peer in a single
    /// cleanup pass. A peer that dies during that pass is evicted too but
    /// not announced again.
    pub async fn broadcast(&self, message: &ServerMessage, exclude: Option<SessionId>) {
        let failed = self.deliver(message, exclude).await;
        if failed.is_empty() {
            return;
        }

        let mut departed = Vec::new();
        for session in failed {
            if let Some(username) = self.registry.remove(session.id()) {
                debug!(session = %session.id(), username, "evicted unreachable session");
                departed.push(username);
            }
        }

        for username in departed {
            let notice = ServerMessage::UserLeft {
                message: format!("{username} left the chat"),
                username,
                timestamp: protocol::now_timestamp(),
            };
            for session in self.deliver(&notice, None).await {
                if let Some(username) = self.registry.remove(session.id()) {
                    debug!(username, "evicted while delivering departure notice");
                }
            }
        }
    }

    /// One fan-out pass; returns the sessions whose send failed.
    async fn deliver(
        &self,
        message: &ServerMessage,
        exclude: Option<SessionId>,
    ) -> Vec<Arc<Session>> {
        let mut failed = Vec::new();
        for session in self.registry.peers(exclude) {
            if let Err(err) = session.send(message).await {
                debug!(session = %session.id(), %err, "send failed during fan-out");
                failed.push(session);
            }
        }
        failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::decode;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, DuplexStream};

    struct Peer {
        id: SessionId,
        transport: DuplexStream,
    }

    fn join_peer(registry: &Arc<Registry>, name: &str) -> Peer {
        let (ours, theirs) = tokio::io::duplex(4096);
        let session = Arc::new(Session::new(None, ours));
        let id = session.id();
        registry.try_join(session, name).expect("join");
        Peer {
            id,
            transport: theirs,
        }
    }

    /// Join a peer and immediately drop its transport so every send fails.
    fn join_dead_peer(registry: &Arc<Registry>, name: &str) -> SessionId {
        let peer = join_peer(registry, name);
        peer.id
    }

    async fn read_frames(transport: &mut DuplexStream) -> Vec<ServerMessage> {
        let mut buffer = crate::protocol::FrameBuffer::new();
        let mut chunk = [0u8; 4096];
        let mut frames = Vec::new();
        loop {
            match tokio::time::timeout(Duration::from_millis(50), transport.read(&mut chunk)).await
            {
                Ok(Ok(0)) | Err(_) => break,
                Ok(Ok(count)) => buffer.extend(&chunk[..count]),
                Ok(Err(err)) => panic!("read failed: {err}"),
            }
        }
        while let Some(frame) = buffer.next_frame() {
            frames.push(decode(&frame).expect("decode"));
        }
        frames
    }

    fn chat(text: &str) -> ServerMessage {
        ServerMessage::Chat {
            username: "alice".into(),
            message: text.into(),
            timestamp: 0.0,
        }
    }

    #[tokio::test]
    async fn delivers_to_everyone_but_the_excluded_sender() {
        let registry = Arc::new(Registry::new());
        let broadcaster = Broadcaster::new(Arc::clone(&registry));

        let mut alice = join_peer(&registry, "alice");
        let mut bob = join_peer(&registry, "bob");

        broadcaster.broadcast(&chat("hi"), Some(alice.id)).await;

        assert!(read_frames(&mut alice.transport).await.is_empty());
        assert_eq!(read_frames(&mut bob.transport).await, vec![chat("hi")]);
    }

    #[tokio::test]
    async fn failed_recipient_is_evicted_and_announced_once() {
        let registry = Arc::new(Registry::new());
        let broadcaster = Broadcaster::new(Arc::clone(&registry));

        let mut alice = join_peer(&registry, "alice");
        let mut bob = join_peer(&registry, "bob");
        let dead_id = join_dead_peer(&registry, "carol");
        assert_eq!(registry.len(), 3);

        broadcaster.broadcast(&chat("anyone there?"), None).await;

        // Carol is gone and her name is free again.
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.remove(dead_id), None);
        assert_eq!(registry.snapshot(), vec!["alice".to_string(), "bob".to_string()]);

        // Both survivors got the chat and exactly one departure notice.
        for peer in [&mut alice, &mut bob] {
            let frames = read_frames(&mut peer.transport).await;
            assert_eq!(frames.len(), 2);
            assert_eq!(frames[0], chat("anyone there?"));
            match &frames[1] {
                ServerMessage::UserLeft { username, .. } => assert_eq!(username, "carol"),
                other => panic!("expected user_left, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn per_recipient_order_follows_broadcast_order() {
        let registry = Arc::new(Registry::new());
        let broadcaster = Broadcaster::new(Arc::clone(&registry));
        let mut bob = join_peer(&registry, "bob");

        broadcaster.broadcast(&chat("first"), None).await;
        broadcaster.broadcast(&chat("second"), None).await;

        let frames = read_frames(&mut bob.transport).await;
        assert_eq!(frames, vec![chat("first"), chat("second")]);
    }
}
