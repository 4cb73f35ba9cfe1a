//! Authoritative membership table mapping sessions to display names.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::JoinError;
use crate::session::{Session, SessionId};

/// Longest display name the server accepts.
pub const MAX_NAME_LEN: usize = 20;

struct Member {
    name: String,
    session: Arc<Session>,
}

/// The one piece of state shared across connection tasks. The lock covers a
/// single map operation at a time and is never held across I/O, so a slow
/// peer cannot stall joins, departures, or fan-out for everyone else.
#[derive(Default)]
pub struct Registry {
    members: Mutex<HashMap<SessionId, Member>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `name` for `session`. Validation, the uniqueness check, and the
    /// insert happen under one lock acquisition: of two racing joins with the
    /// same name, exactly one wins and the loser sees `NameTaken`.
    pub fn try_join(&self, session: Arc<Session>, name: &str) -> Result<(), JoinError> {
        if !is_valid_name(name) {
            return Err(JoinError::InvalidName);
        }
        let mut members = self.members.lock();
        if members.values().any(|member| member.name == name) {
            return Err(JoinError::NameTaken);
        }
        members.insert(
            session.id(),
            Member {
                name: name.to_string(),
                session,
            },
        );
        Ok(())
    }

    /// Drop the mapping for `id`, returning the name it frees. Calling this
    /// again after the entry is gone is a no-op.
    pub fn remove(&self, id: SessionId) -> Option<String> {
        self.members.lock().remove(&id).map(|member| member.name)
    }

    /// Current display names, captured in one lock acquisition and sorted
    /// for stable presentation.
    pub fn snapshot(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .members
            .lock()
            .values()
            .map(|member| member.name.clone())
            .collect();
        names.sort();
        names
    }

    /// The fan-out set: every registered session except `exclude`. The list
    /// is captured under the lock; callers write to the sessions afterwards.
    pub fn peers(&self, exclude: Option<SessionId>) -> Vec<Arc<Session>> {
        self.members
            .lock()
            .values()
            .filter(|member| Some(member.session.id()) != exclude)
            .map(|member| Arc::clone(&member.session))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.members.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.members.lock().clear();
    }
}

/// 1-20 characters, letters, digits, hyphen, underscore. Case-sensitive
/// comparison elsewhere means "Alice" and "alice" can coexist.
fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}
