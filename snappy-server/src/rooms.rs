//! Group broadcast rooms: which sessions receive a group's fan-out.
//!
//! Rooms are created by the first join and disappear with their last
//! member. A session's memberships are indexed so disconnect cleanup is
//! a single call.

use std::collections::{HashMap, HashSet};

#[derive(Debug, Default)]
pub struct RoomMembership {
    /// room_id -> session ids
    rooms: HashMap<String, HashSet<String>>,
    /// session_id -> room ids
    joined: HashMap<String, HashSet<String>>,
}

impl RoomMembership {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `session_id` to `room_id`. Returns false if it was already there.
    pub fn join(&mut self, session_id: &str, room_id: &str) -> bool {
        let added = self
            .rooms
            .entry(room_id.to_string())
            .or_default()
            .insert(session_id.to_string());
        if added {
            self.joined
                .entry(session_id.to_string())
                .or_default()
                .insert(room_id.to_string());
        }
        added
    }

    /// Remove `session_id` from every room. Returns the rooms it left.
    pub fn leave_all(&mut self, session_id: &str) -> Vec<String> {
        let Some(rooms) = self.joined.remove(session_id) else {
            return Vec::new();
        };
        for room in &rooms {
            if let Some(members) = self.rooms.get_mut(room) {
                members.remove(session_id);
                if members.is_empty() {
                    self.rooms.remove(room);
                }
            }
        }
        rooms.into_iter().collect()
    }

    pub fn members(&self, room_id: &str) -> impl Iterator<Item = &str> {
        self.rooms
            .get(room_id)
            .into_iter()
            .flat_map(|members| members.iter().map(String::as_str))
    }

    pub fn contains(&self, room_id: &str, session_id: &str) -> bool {
        self.rooms
            .get(room_id)
            .is_some_and(|members| members.contains(session_id))
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_is_idempotent() {
        let mut rooms = RoomMembership::new();
        assert!(rooms.join("s1", "g"));
        assert!(!rooms.join("s1", "g"));
        assert_eq!(rooms.members("g").count(), 1);
    }

    #[test]
    fn members_of_unknown_room_is_empty() {
        let rooms = RoomMembership::new();
        assert_eq!(rooms.members("nowhere").count(), 0);
    }

    #[test]
    fn leave_all_prunes_every_room() {
        let mut rooms = RoomMembership::new();
        rooms.join("s1", "g1");
        rooms.join("s1", "g2");
        rooms.join("s2", "g1");

        let mut left = rooms.leave_all("s1");
        left.sort();
        assert_eq!(left, vec!["g1".to_string(), "g2".to_string()]);
        assert!(!rooms.contains("g1", "s1"));
        assert!(rooms.contains("g1", "s2"));
        assert_eq!(rooms.room_count(), 1, "empty room g2 should be dropped");
        assert!(rooms.leave_all("s1").is_empty());
    }
}
