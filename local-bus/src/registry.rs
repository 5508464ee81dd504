use std::time::Duration;

use bytes::Bytes;
use tracing::warn;

use crate::link::{LinkId, PeerLink, SendFailure};

/// Live links owned by this process, in connection order.
///
/// Sends wait for room in each link's queue. A link whose writer is gone, or
/// whose queue stays full past the stall limit, is reported back so the
/// engine can tear it down.
#[derive(Debug, Default)]
pub(crate) struct PeerRegistry {
    links: Vec<PeerLink>,
}

impl PeerRegistry {
    pub(crate) fn insert(&mut self, link: PeerLink) {
        self.links.push(link);
    }

    pub(crate) fn remove(&mut self, id: LinkId) -> Option<PeerLink> {
        let index = self.links.iter().position(|link| link.id() == id)?;
        Some(self.links.remove(index))
    }

    pub(crate) fn contains(&self, id: LinkId) -> bool {
        self.links.iter().any(|link| link.id() == id)
    }

    pub(crate) fn clear(&mut self) {
        self.links.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.links.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Send to every link. Returns links that could not take the frame.
    pub(crate) async fn send_all(&self, frame: &Bytes, stall: Option<Duration>) -> Vec<LinkId> {
        self.fan_out(None, frame, stall).await
    }

    /// Send to every link except `from`. Returns links that could not take the
    /// frame.
    pub(crate) async fn relay(
        &self,
        from: LinkId,
        frame: &Bytes,
        stall: Option<Duration>,
    ) -> Vec<LinkId> {
        self.fan_out(Some(from), frame, stall).await
    }

    async fn fan_out(
        &self,
        skip: Option<LinkId>,
        frame: &Bytes,
        stall: Option<Duration>,
    ) -> Vec<LinkId> {
        let mut failed = Vec::new();
        for link in self.links.iter().filter(|link| Some(link.id()) != skip) {
            match link.send(frame.clone(), stall).await {
                Ok(()) => {}
                Err(SendFailure::Stalled) => {
                    warn!(id = %link.id(), ?stall, "link stalled; dropping it");
                    failed.push(link.id());
                }
                Err(SendFailure::Closed) => failed.push(link.id()),
            }
        }
        failed
    }
}
