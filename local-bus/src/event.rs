//! Types the engine reports to the application.

use std::fmt;

use bytes::Bytes;

use crate::query::QueryId;

/// This process's position on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Holds the endpoint and relays between spokes.
    Hub,
    /// Connected to the hub.
    Spoke,
    /// Between elections, waiting for a retry.
    Electing,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::Hub => "hub",
            Role::Spoke => "spoke",
            Role::Electing => "electing",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    /// A plain broadcast frame, or a query frame when query messages are on.
    MessageReceived { payload: Bytes },
    /// First sighting of a query id, or any response to a query we sent
    /// (`dispatched` is then true).
    ///
    /// Known race: queries and responses share one wire shape, so the asker
    /// cannot tell a second answer from a fresh question. Every response to
    /// one of our own ids raises this event with `dispatched: true`, including
    /// extra answers and answers that arrive after the caller timed out. Only
    /// the first one resolves the pending call. Other members raise the event
    /// once per id.
    QueryReceived {
        id: QueryId,
        payload: Bytes,
        dispatched: bool,
    },
    RoleChanged { role: Role },
}

/// Point-in-time view of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusStatus {
    pub role: Role,
    /// Live links: connected spokes for a hub, 1 for a spoke.
    pub peers: usize,
}
