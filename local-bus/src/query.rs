//! Query identifiers and the `"<QueryID> <payload>"` wire shape shared by
//! queries and their responses.

use std::fmt;
use std::str::FromStr;

use bytes::{BufMut, Bytes, BytesMut};
use uuid::Uuid;

const HYPHENATED_LEN: usize = 36;
const BRACED_LEN: usize = HYPHENATED_LEN + 2;

/// Globally unique identifier correlating a query with its response.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueryId(Uuid);

impl QueryId {
    /// A fresh random (v4) identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for QueryId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for QueryId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl fmt::Debug for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "QueryId({})", self.0.hyphenated())
    }
}

impl FromStr for QueryId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Build the wire frame (without delimiter) for a query or a response.
pub fn encode(id: QueryId, payload: &[u8]) -> Bytes {
    let mut text = Uuid::encode_buffer();
    let token = id.0.hyphenated().encode_lower(&mut text);

    let mut frame = BytesMut::with_capacity(token.len() + 1 + payload.len());
    frame.put_slice(token.as_bytes());
    frame.put_u8(b' ');
    frame.put_slice(payload);
    frame.freeze()
}

/// Split a frame into `(QueryId, payload)` if it carries a leading UUID token.
///
/// Accepts the hyphenated form and the braced `{...}` form. The token must be
/// followed by exactly one space; the payload is the rest of the frame and may
/// be empty. Returns `None` for plain messages.
pub fn decode(frame: &Bytes) -> Option<(QueryId, Bytes)> {
    let braced = frame.first() == Some(&b'{');
    let token_len = if braced { BRACED_LEN } else { HYPHENATED_LEN };

    if frame.len() <= token_len || frame[token_len] != b' ' {
        return None;
    }

    let token = if braced {
        if frame[token_len - 1] != b'}' {
            return None;
        }
        &frame[1..token_len - 1]
    } else {
        &frame[..token_len]
    };

    let uuid = Uuid::try_parse_ascii(token).ok()?;
    Some((QueryId(uuid), frame.slice(token_len + 1..)))
}
