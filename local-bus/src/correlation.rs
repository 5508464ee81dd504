//! Recognition, dedup and resolution of query traffic.
//!
//! Queries and responses share one wire shape, so the only thing separating
//! "someone wants an answer" from "here is the answer to my question" is local
//! state: ids we dispatched ourselves, and ids we have already seen once.

use std::collections::{HashMap, HashSet};

use bytes::Bytes;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::event::BusEvent;
use crate::query::{self, QueryId};

#[derive(Debug, Default)]
pub(crate) struct Correlator {
    dispatched: HashSet<QueryId>,
    serviced: HashSet<QueryId>,
    pending: HashMap<QueryId, oneshot::Sender<Bytes>>,
    last_frame: Option<Bytes>,
    last_query: Option<(QueryId, Bytes)>,
    query_messages: bool,
}

impl Correlator {
    pub(crate) fn new(query_messages: bool) -> Self {
        Self {
            query_messages,
            ..Self::default()
        }
    }

    pub(crate) fn set_query_messages(&mut self, enabled: bool) {
        self.query_messages = enabled;
    }

    /// Register an outgoing query and build its frame. `reply` fires with the
    /// first response that comes back.
    pub(crate) fn dispatch(
        &mut self,
        id: QueryId,
        payload: &[u8],
        reply: oneshot::Sender<Bytes>,
    ) -> Bytes {
        self.forget_abandoned();
        self.dispatched.insert(id);
        self.pending.insert(id, reply);
        query::encode(id, payload)
    }

    /// Forget a pending query whose caller stopped waiting.
    pub(crate) fn expire(&mut self, id: QueryId) -> bool {
        let expired = self.pending.remove(&id).is_some();
        if expired {
            debug!(%id, "query expired");
        }
        expired
    }

    /// Drop pending queries whose caller is no longer waiting.
    pub(crate) fn forget_abandoned(&mut self) -> usize {
        let before = self.pending.len();
        self.pending.retain(|_, reply| !reply.is_closed());
        let forgotten = before - self.pending.len();
        if forgotten > 0 {
            debug!(forgotten, "abandoned queries forgotten");
        }
        forgotten
    }

    /// Run one incoming frame through local processing.
    pub(crate) fn process(&mut self, frame: Bytes) -> Vec<BusEvent> {
        self.last_frame = Some(frame.clone());

        let Some((id, payload)) = query::decode(&frame) else {
            return vec![BusEvent::MessageReceived { payload: frame }];
        };

        let dispatched = self.dispatched.contains(&id);
        let mut events = Vec::with_capacity(2);

        if !dispatched && self.serviced.contains(&id) {
            trace!(%id, "duplicate query frame discarded");
            if self.query_messages {
                events.push(BusEvent::MessageReceived { payload: frame });
            }
            return events;
        }

        self.serviced.insert(id);
        self.last_query = Some((id, payload.clone()));

        if let Some(reply) = self.pending.remove(&id) {
            debug!(%id, "query resolved");
            // The caller may have given up between the timeout and this frame.
            let _ = reply.send(payload.clone());
        }

        events.push(BusEvent::QueryReceived {
            id,
            payload,
            dispatched,
        });
        if self.query_messages {
            events.push(BusEvent::MessageReceived { payload: frame });
        }
        events
    }

    pub(crate) fn last_frame(&self) -> Option<Bytes> {
        self.last_frame.clone()
    }

    pub(crate) fn last_query(&self) -> Option<(QueryId, Bytes)> {
        self.last_query.clone()
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query_frame(id: QueryId, payload: &str) -> Bytes {
        query::encode(id, payload.as_bytes())
    }

    #[test]
    fn plain_frames_become_messages() {
        let mut correlator = Correlator::new(false);
        let events = correlator.process(Bytes::from_static(b"hello"));
        assert_eq!(
            events,
            vec![BusEvent::MessageReceived {
                payload: Bytes::from_static(b"hello")
            }]
        );
        assert_eq!(correlator.last_frame(), Some(Bytes::from_static(b"hello")));
        assert!(correlator.last_query().is_none());
    }

    #[test]
    fn foreign_query_is_reported_once() {
        let mut correlator = Correlator::new(false);
        let id = QueryId::new();

        let first = correlator.process(query_frame(id, "ping"));
        assert_eq!(
            first,
            vec![BusEvent::QueryReceived {
                id,
                payload: Bytes::from_static(b"ping"),
                dispatched: false,
            }]
        );

        // Someone else's answer to the same id is a duplicate here.
        let second = correlator.process(query_frame(id, "pong"));
        assert!(second.is_empty());
        assert_eq!(
            correlator.last_query(),
            Some((id, Bytes::from_static(b"ping")))
        );
        assert_eq!(correlator.last_frame(), Some(query_frame(id, "pong")));
    }

    #[test]
    fn discarded_duplicate_still_shows_as_message_when_enabled() {
        let mut correlator = Correlator::new(true);
        let id = QueryId::new();

        let first = correlator.process(query_frame(id, "ping"));
        assert_eq!(first.len(), 2);
        assert!(matches!(first[0], BusEvent::QueryReceived { .. }));
        assert_eq!(
            first[1],
            BusEvent::MessageReceived {
                payload: query_frame(id, "ping")
            }
        );

        let second = correlator.process(query_frame(id, "pong"));
        assert_eq!(
            second,
            vec![BusEvent::MessageReceived {
                payload: query_frame(id, "pong")
            }]
        );
    }

    #[tokio::test]
    async fn first_response_resolves_pending_query() {
        let mut correlator = Correlator::new(false);
        let id = QueryId::new();
        let (tx, rx) = oneshot::channel();

        let frame = correlator.dispatch(id, b"ping", tx);
        assert_eq!(frame, query_frame(id, "ping"));
        assert_eq!(correlator.pending_len(), 1);

        let events = correlator.process(query_frame(id, "pong"));
        assert_eq!(
            events,
            vec![BusEvent::QueryReceived {
                id,
                payload: Bytes::from_static(b"pong"),
                dispatched: true,
            }]
        );
        assert_eq!(rx.await.unwrap(), Bytes::from_static(b"pong"));
        assert_eq!(correlator.pending_len(), 0);

        // A second responder still reaches the asker as an event, but nothing
        // is waiting for it any more.
        let late = correlator.process(query_frame(id, "pong again"));
        assert!(matches!(
            late.as_slice(),
            [BusEvent::QueryReceived { dispatched: true, .. }]
        ));
    }

    #[tokio::test]
    async fn expired_query_drops_late_response() {
        let mut correlator = Correlator::new(false);
        let id = QueryId::new();
        let (tx, rx) = oneshot::channel();
        correlator.dispatch(id, b"ping", tx);

        assert!(correlator.expire(id));
        assert!(!correlator.expire(id));
        assert!(rx.await.is_err());

        correlator.process(query_frame(id, "late"));
        assert_eq!(correlator.pending_len(), 0);
    }

    #[test]
    fn abandoned_queries_are_swept() {
        let mut correlator = Correlator::new(false);

        let (reply, response) = oneshot::channel();
        correlator.dispatch(QueryId::new(), b"first", reply);
        drop(response);
        assert_eq!(correlator.pending_len(), 1);

        let (reply, response) = oneshot::channel();
        correlator.dispatch(QueryId::new(), b"second", reply);
        assert_eq!(correlator.pending_len(), 1);

        drop(response);
        assert_eq!(correlator.forget_abandoned(), 1);
        assert_eq!(correlator.pending_len(), 0);
    }

    #[test]
    fn toggling_query_messages_applies_to_next_frame() {
        let mut correlator = Correlator::new(false);
        correlator.set_query_messages(true);
        let events = correlator.process(query_frame(QueryId::new(), "x"));
        assert_eq!(events.len(), 2);
    }
}
