//! Self-organizing message bus for processes on one host.
//!
//! Processes that board the same bus name form a star over Unix domain
//! sockets. Whoever claims the bus endpoint first becomes the hub and relays
//! every frame to all other members; everyone else connects as a spoke. When
//! the hub goes away, the survivors elect a new one and reconnect.
//!
//! - [`config`] holds [`BusConfig`] and the choice of [`ElectionGate`].
//! - [`runtime`] runs the engine task behind a cloneable [`BusHandle`].
//! - `election` decides hub or spoke from an OS-level exclusive lock or
//!   bind.
//! - [`frame`] is the newline-delimited wire framing.
//! - [`query`] encodes the `"<uuid> <payload>"` shape shared by queries and
//!   responses.
//!
//! The `local_bus` binary in this crate is a small terminal front end; see
//! `README.md`.

pub mod cli;
pub mod client;
pub mod config;
mod correlation;
mod election;
pub mod error;
pub mod event;
pub mod frame;
mod link;
pub mod name;
pub mod query;
mod registry;
pub mod runtime;

pub use config::{BusConfig, ElectionGate};
pub use error::BusError;
pub use event::{BusEvent, BusStatus, Role};
pub use name::BusName;
pub use query::QueryId;
pub use runtime::{Bus, BusChannels, BusHandle};
