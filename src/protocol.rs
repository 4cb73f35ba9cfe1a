//! JSON line protocol: one message object per newline-terminated frame.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::SessionError;

/// Messages a client sends to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Join { username: String },
    Chat { message: String },
    Ping,
    /// Catch-all for unrecognized `type` tags; the server ignores these
    /// instead of dropping the connection.
    #[serde(other)]
    Unknown,
}

/// Messages the server sends to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Welcome {
        message: String,
        users: Vec<String>,
        timestamp: f64,
    },
    Chat {
        username: String,
        message: String,
        timestamp: f64,
    },
    Pong,
    UserJoined {
        username: String,
        message: String,
        timestamp: f64,
    },
    UserLeft {
        username: String,
        message: String,
        timestamp: f64,
    },
    Error {
        message: String,
    },
}

/// Serialize one message as a self-delimited frame. JSON escapes any newline
/// inside string fields, so the terminator appended here is the only
/// unescaped `\n` in the unit.
pub fn encode<M: Serialize>(message: &M) -> Result<Vec<u8>, SessionError> {
    let mut encoded = serde_json::to_vec(message)?;
    encoded.push(b'\n');
    Ok(encoded)
}

/// Parse one frame (terminator already stripped) into a tagged message.
pub fn decode<M: DeserializeOwned>(frame: &[u8]) -> Result<M, SessionError> {
    Ok(serde_json::from_slice(frame)?)
}

/// Current time as Unix epoch seconds, the wire representation used in every
/// timestamped message.
pub fn now_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs_f64())
        .unwrap_or_default()
}

/// Accumulates raw bytes from a transport and splits them into frames.
///
/// Bytes after the first terminator stay buffered for the next call, so
/// frames that arrive coalesced in one read are all delivered. A buffer with
/// no terminator yet is not an error, just "need more data".
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Split off the first complete frame, without its terminator. A trailing
    /// `\r` is stripped so netcat-style clients work.
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        let terminator = self.buf.iter().position(|&byte| byte == b'\n')?;
        let mut frame: Vec<u8> = self.buf.drain(..=terminator).collect();
        frame.pop();
        if frame.last() == Some(&b'\r') {
            frame.pop();
        }
        Some(frame)
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}
