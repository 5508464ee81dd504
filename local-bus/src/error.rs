use std::time::Duration;

use crate::query::QueryId;

/// Errors surfaced by the bus to calling code.
///
/// Transport failures (refused connects, broken links, bind conflicts) never
/// show up here: the engine absorbs them into election retries.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("invalid bus name {name:?}: {reason}")]
    InvalidName { name: String, reason: &'static str },

    #[error("payload contains the frame delimiter")]
    EmbeddedDelimiter,

    #[error("query {id} got no response within {timeout:?}")]
    QueryTimeout { id: QueryId, timeout: Duration },

    #[error("bus engine has shut down")]
    Closed,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
