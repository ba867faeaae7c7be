//! Real-time chat server.
//!
//! Users connect over a persistent line-oriented channel (plain TCP or a
//! WebSocket bridged onto the same handler), register their identity, and
//! exchange direct and group events. The interesting state lives in three
//! places that must stay consistent:
//!
//! - [`presence::PresenceRegistry`]: which user is reachable on which session
//! - [`rooms::RoomMembership`]: which sessions receive a group's fan-out
//! - [`store::MessageStore`]: durable messages and their delivery status
//!
//! [`connection`] routes every inbound [`event::ClientEvent`] against that
//! state; [`delivery`] owns the `sent -> delivered -> read` lifecycle.

pub mod config;
pub mod connection;
pub mod db;
pub mod delivery;
pub mod error;
pub mod event;
pub mod msgid;
pub mod presence;
pub mod rooms;
pub mod server;
pub mod store;
pub mod web;
