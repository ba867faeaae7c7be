//! Presence registry: which user is reachable on which live session.
//!
//! Keyed by user with a reverse session index, so both `lookup` and
//! `unregister` are O(1). A user holds at most one session (the most recent
//! registration wins), and a session represents at most one user.
//!
//! The registry is process-local. Callers hold it behind a mutex in
//! [`SharedState`](crate::server::SharedState) and perform the matching
//! online-flag write while still holding the lock, so presence writes for a
//! user reach the store in the same order the registry saw them.

use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct PresenceRegistry {
    /// user_id -> session_id
    sessions: HashMap<String, String>,
    /// session_id -> user_id
    users: HashMap<String, String>,
}

/// What a registration displaced.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Registration {
    /// The user's previous session, now detached (last connection wins).
    pub replaced_session: Option<String>,
    /// A different user this session was bound to before, now offline.
    pub released_user: Option<String>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `user_id` to `session_id`, overwriting any earlier binding on
    /// either side. Idempotent for repeated identical calls.
    pub fn register(&mut self, user_id: &str, session_id: &str) -> Registration {
        let released_user = match self.users.insert(session_id.to_string(), user_id.to_string()) {
            Some(previous) if previous != user_id => {
                if self.sessions.get(&previous).is_some_and(|s| s == session_id) {
                    self.sessions.remove(&previous);
                }
                Some(previous)
            }
            _ => None,
        };

        let replaced_session = self
            .sessions
            .insert(user_id.to_string(), session_id.to_string())
            .filter(|old| old != session_id);
        if let Some(ref old) = replaced_session {
            self.users.remove(old);
        }

        Registration {
            replaced_session,
            released_user,
        }
    }

    pub fn lookup(&self, user_id: &str) -> Option<&str> {
        self.sessions.get(user_id).map(String::as_str)
    }

    /// The user a session is registered as, if any.
    pub fn user_of(&self, session_id: &str) -> Option<&str> {
        self.users.get(session_id).map(String::as_str)
    }

    /// Drop the binding held by `session_id`. Returns the user that went
    /// offline, or `None` if the session was never registered or had already
    /// been replaced.
    pub fn unregister(&mut self, session_id: &str) -> Option<String> {
        let user_id = self.users.remove(session_id)?;
        if self.sessions.get(&user_id).is_some_and(|s| s == session_id) {
            self.sessions.remove(&user_id);
        }
        Some(user_id)
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.sessions.contains_key(user_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
