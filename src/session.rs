use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{de::DeserializeOwned, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time;

use crate::error::SessionError;
use crate::protocol::{self, FrameBuffer};

/// How long a client gets to send its `join` message.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Poll granularity once a session is active. Bounds how long a dispatcher
/// loop can go without checking the shutdown flag.
pub const POLL_TIMEOUT: Duration = Duration::from_secs(1);

const READ_CHUNK: usize = 1024;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Stable identity of one accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl SessionId {
    fn next() -> Self {
        Self(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// The write side of one connected peer.
///
/// The dispatcher task that accepted the connection owns the read side; the
/// registry hands out `Arc<Session>` clones so broadcasts from other
/// connections' tasks can write too. The writer mutex keeps those frames
/// from interleaving mid-frame.
pub struct Session {
    id: SessionId,
    peer: Option<SocketAddr>,
    writer: Mutex<BoxedWriter>,
    alive: AtomicBool,
}

impl Session {
    pub fn new(peer: Option<SocketAddr>, writer: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        Self {
            id: SessionId::next(),
            peer,
            writer: Mutex::new(Box::new(writer)),
            alive: AtomicBool::new(true),
        }
    }

    /// Split a TCP stream into the shared session handle and the reader the
    /// dispatcher keeps for itself.
    pub fn from_stream(stream: TcpStream) -> (Arc<Session>, SessionReader) {
        let peer = stream.peer_addr().ok();
        let (read_half, write_half) = stream.into_split();
        let session = Arc::new(Session::new(peer, write_half));
        (session, SessionReader::new(read_half))
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Write one frame. A failure marks the session dead and surfaces as
    /// `SendFailed`; callers must treat the session as gone.
    pub async fn send<M: Serialize>(&self, message: &M) -> Result<(), SessionError> {
        let encoded = protocol::encode(message)?;
        let mut writer = self.writer.lock().await;
        if let Err(err) = write_frame(&mut writer, &encoded).await {
            self.alive.store(false, Ordering::Release);
            return Err(SessionError::SendFailed(err));
        }
        Ok(())
    }

    /// Best-effort half-close of the write side.
    pub async fn shutdown(&self) {
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }
}

async fn write_frame(writer: &mut BoxedWriter, encoded: &[u8]) -> io::Result<()> {
    writer.write_all(encoded).await?;
    writer.flush().await
}

/// Outcome of one `recv` poll. A timeout is a normal result, not a fault;
/// so is the peer closing the transport.
#[derive(Debug)]
pub enum RecvOutcome<M> {
    Frame(M),
    Timeout,
    Closed,
}

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// The read side of a connection plus its persistent frame buffer.
pub struct SessionReader {
    reader: BoxedReader,
    buffer: FrameBuffer,
}

impl SessionReader {
    pub fn new(reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        Self {
            reader: Box::new(reader),
            buffer: FrameBuffer::new(),
        }
    }

    /// Wait up to `wait` for one complete frame. Frames already buffered from
    /// an earlier read are served before the socket is touched, so nothing
    /// received after a previous frame's terminator is ever lost.
    pub async fn recv<M: DeserializeOwned>(
        &mut self,
        wait: Duration,
    ) -> Result<RecvOutcome<M>, SessionError> {
        let deadline = time::Instant::now() + wait;
        loop {
            while let Some(frame) = self.buffer.next_frame() {
                if frame.is_empty() {
                    // Blank lines between frames are tolerated.
                    continue;
                }
                return Ok(RecvOutcome::Frame(protocol::decode(&frame)?));
            }

            let mut chunk = [0u8; READ_CHUNK];
            let read = match time::timeout_at(deadline, self.reader.read(&mut chunk)).await {
                Ok(read) => read,
                Err(_elapsed) => return Ok(RecvOutcome::Timeout),
            };
            match read {
                Ok(0) => return Ok(RecvOutcome::Closed),
                Ok(count) => self.buffer.extend(&chunk[..count]),
                Err(err) if is_disconnect(&err) => return Ok(RecvOutcome::Closed),
                Err(err) => return Err(SessionError::Io(err)),
            }
        }
    }
}

fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ClientMessage, ServerMessage};
    use tokio::io::AsyncBufReadExt;

    #[tokio::test]
    async fn send_writes_one_terminated_frame() {
        let (ours, theirs) = tokio::io::duplex(256);
        let session = Session::new(None, ours);

        session.send(&ServerMessage::Pong).await.expect("send");

        let mut lines = tokio::io::BufReader::new(theirs).lines();
        let line = lines.next_line().await.expect("read").expect("line");
        assert_eq!(line, r#"{"type":"pong"}"#);
        assert!(session.is_alive());
    }

    #[tokio::test]
    async fn failed_send_marks_session_dead() {
        let (ours, theirs) = tokio::io::duplex(256);
        drop(theirs);
        let session = Session::new(None, ours);

        let result = session.send(&ServerMessage::Pong).await;
        assert!(matches!(result, Err(SessionError::SendFailed(_))));
        assert!(!session.is_alive());
    }

    #[tokio::test]
    async fn recv_times_out_without_data() {
        let (_ours, theirs) = tokio::io::duplex(256);
        let mut reader = SessionReader::new(theirs);

        let outcome = reader
            .recv::<ClientMessage>(Duration::from_millis(20))
            .await
            .expect("recv");
        assert!(matches!(outcome, RecvOutcome::Timeout));
    }

    #[tokio::test]
    async fn recv_reports_peer_close() {
        let (ours, theirs) = tokio::io::duplex(256);
        drop(ours);
        let mut reader = SessionReader::new(theirs);

        let outcome = reader
            .recv::<ClientMessage>(Duration::from_millis(20))
            .await
            .expect("recv");
        assert!(matches!(outcome, RecvOutcome::Closed));
    }

    #[tokio::test]
    async fn recv_retains_bytes_after_first_terminator() {
        let (mut ours, theirs) = tokio::io::duplex(256);
        let mut reader = SessionReader::new(theirs);

        // Two frames and the start of a third arrive in a single write.
        ours.write_all(b"{\"type\":\"ping\"}\n{\"type\":\"chat\",\"message\":\"hi\"}\n{\"type\":\"ch")
            .await
            .expect("write");

        let first = reader
            .recv::<ClientMessage>(Duration::from_millis(100))
            .await
            .expect("recv");
        assert!(matches!(first, RecvOutcome::Frame(ClientMessage::Ping)));

        let second = reader
            .recv::<ClientMessage>(Duration::from_millis(100))
            .await
            .expect("recv");
        match second {
            RecvOutcome::Frame(ClientMessage::Chat { message }) => assert_eq!(message, "hi"),
            other => panic!("unexpected outcome: {other:?}"),
        }

        // The partial third frame completes on a later write.
        ours.write_all(b"at\",\"message\":\"again\"}\n")
            .await
            .expect("write");
        let third = reader
            .recv::<ClientMessage>(Duration::from_millis(100))
            .await
            .expect("recv");
        match third {
            RecvOutcome::Frame(ClientMessage::Chat { message }) => assert_eq!(message, "again"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn recv_surfaces_malformed_frames() {
        let (mut ours, theirs) = tokio::io::duplex(256);
        let mut reader = SessionReader::new(theirs);

        ours.write_all(b"this is not json\n").await.expect("write");
        let result = reader
            .recv::<ClientMessage>(Duration::from_millis(100))
            .await;
        assert!(matches!(result, Err(SessionError::Malformed(_))));
    }
}
