//! One live connection to another bus member.
//!
//! Each link runs a reader task and a writer task. Neither touches bus state:
//! the reader forwards frames to the engine, the writer drains a bounded queue
//! of outgoing frames. Dropping the [`PeerLink`] aborts both and closes the
//! socket.
//!
//! Readers never wait on the engine. Only outgoing queues are bounded, so two
//! members flooding each other cannot end up each waiting on the other.

use std::fmt;
use std::io;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::frame::{read_frame, write_frame};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct LinkId(u64);

impl LinkId {
    pub(crate) fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link-{}", self.0)
    }
}

/// Reports from link and accept tasks to the engine.
#[derive(Debug)]
pub(crate) enum LinkEvent {
    /// A spoke connected to the listener of hub term `generation`.
    Accepted { generation: u64, stream: UnixStream },
    Frame { id: LinkId, frame: Bytes },
    Closed { id: LinkId, error: Option<io::Error> },
    /// The accept loop of hub term `generation` stopped.
    ListenerClosed { generation: u64, error: io::Error },
}

/// Why a frame did not make it into a link's queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SendFailure {
    /// The queue stayed full for the whole stall limit.
    Stalled,
    /// The writer is gone.
    Closed,
}

pub(crate) struct PeerLink {
    id: LinkId,
    outbound: mpsc::Sender<Bytes>,
    tasks: Vec<JoinHandle<()>>,
}

impl PeerLink {
    /// Split `stream` and start its reader and writer tasks.
    pub(crate) fn spawn(
        id: LinkId,
        stream: UnixStream,
        events: mpsc::UnboundedSender<LinkEvent>,
        max_frame_len: usize,
        buffer: usize,
    ) -> Self {
        let (reader, writer) = stream.into_split();
        let (outbound, inbound) = mpsc::channel(buffer);

        let read_task = tokio::spawn(read_loop(
            id,
            BufReader::new(reader),
            events.clone(),
            max_frame_len,
        ));
        let write_task = tokio::spawn(write_loop(id, writer, inbound, events));

        Self {
            id,
            outbound,
            tasks: vec![read_task, write_task],
        }
    }

    pub(crate) fn id(&self) -> LinkId {
        self.id
    }

    /// Queue `frame`, waiting while the writer is `buffer` frames behind.
    ///
    /// With `stall` set, gives up once the queue has stayed full that long.
    pub(crate) async fn send(
        &self,
        frame: Bytes,
        stall: Option<Duration>,
    ) -> Result<(), SendFailure> {
        let Some(limit) = stall else {
            return self
                .outbound
                .send(frame)
                .await
                .map_err(|_| SendFailure::Closed);
        };
        match self.outbound.send_timeout(frame, limit).await {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => Err(SendFailure::Stalled),
            Err(SendTimeoutError::Closed(_)) => Err(SendFailure::Closed),
        }
    }

    #[cfg(test)]
    pub(crate) fn detached(id: LinkId, outbound: mpsc::Sender<Bytes>) -> Self {
        Self {
            id,
            outbound,
            tasks: Vec::new(),
        }
    }
}

impl fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerLink").field("id", &self.id).finish()
    }
}

impl Drop for PeerLink {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn read_loop<R>(
    id: LinkId,
    mut reader: BufReader<R>,
    events: mpsc::UnboundedSender<LinkEvent>,
    max_frame_len: usize,
) where
    R: tokio::io::AsyncRead + Unpin,
{
    let error = loop {
        match read_frame(&mut reader, max_frame_len).await {
            Ok(Some(frame)) => {
                trace!(%id, len = frame.len(), "frame read");
                if events.send(LinkEvent::Frame { id, frame }).is_err() {
                    return;
                }
            }
            Ok(None) => break None,
            Err(err) => break Some(err),
        }
    };

    debug!(%id, ?error, "link reader finished");
    let _ = events.send(LinkEvent::Closed { id, error });
}

async fn write_loop<W>(
    id: LinkId,
    mut writer: W,
    mut inbound: mpsc::Receiver<Bytes>,
    events: mpsc::UnboundedSender<LinkEvent>,
) where
    W: tokio::io::AsyncWrite + Unpin,
{
    while let Some(frame) = inbound.recv().await {
        if let Err(err) = write_frame(&mut writer, &frame).await {
            debug!(%id, error = ?err, "link writer failed");
            let _ = events.send(LinkEvent::Closed {
                id,
                error: Some(err),
            });
            return;
        }
    }

    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncBufReadExt;

    #[tokio::test]
    async fn link_moves_frames_both_ways() {
        let (ours, theirs) = UnixStream::pair().expect("socket pair");
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let link = PeerLink::spawn(LinkId::new(7), ours, events_tx, 1024, 8);

        link.send(Bytes::from_static(b"outbound"), None).await.unwrap();

        let (their_reader, mut their_writer) = theirs.into_split();
        let mut their_reader = BufReader::new(their_reader);
        let mut line = String::new();
        their_reader.read_line(&mut line).await.unwrap();
        assert_eq!(line, "outbound\n");

        their_writer.write_all(b"inbound\n").await.unwrap();
        match events_rx.recv().await {
            Some(LinkEvent::Frame { id, frame }) => {
                assert_eq!(id, LinkId::new(7));
                assert_eq!(frame, Bytes::from_static(b"inbound"));
            }
            other => panic!("unexpected event: {other:?}"),
        }

        drop(their_writer);
        drop(their_reader);
        match events_rx.recv().await {
            Some(LinkEvent::Closed { id, .. }) => assert_eq!(id, LinkId::new(7)),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn dropping_link_closes_socket() {
        let (ours, theirs) = UnixStream::pair().expect("socket pair");
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let link = PeerLink::spawn(LinkId::new(1), ours, events_tx, 1024, 8);
        drop(link);

        let mut reader = BufReader::new(theirs);
        let mut line = String::new();
        let read = reader.read_line(&mut line).await.unwrap();
        assert_eq!(read, 0);
    }

    #[tokio::test]
    async fn full_queue_waits_for_the_writer() {
        let (tx, mut rx) = mpsc::channel(1);
        let link = PeerLink::detached(LinkId::new(3), tx);
        link.send(Bytes::from_static(b"first"), None).await.unwrap();

        let drain = tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Some(frame) = rx.recv().await {
                seen.push(frame);
            }
            seen
        });
        link.send(Bytes::from_static(b"second"), None).await.unwrap();
        drop(link);

        let seen = drain.await.unwrap();
        assert_eq!(
            seen,
            vec![Bytes::from_static(b"first"), Bytes::from_static(b"second")]
        );
    }

    #[tokio::test]
    async fn stall_limit_gives_up_on_a_full_queue() {
        let (tx, _rx) = mpsc::channel(1);
        let link = PeerLink::detached(LinkId::new(4), tx);
        let limit = Some(Duration::from_millis(20));

        assert_eq!(link.send(Bytes::from_static(b"fits"), limit).await, Ok(()));
        assert_eq!(
            link.send(Bytes::from_static(b"stuck"), limit).await,
            Err(SendFailure::Stalled)
        );
    }

    #[tokio::test]
    async fn closed_writer_is_reported() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let link = PeerLink::detached(LinkId::new(5), tx);

        assert_eq!(
            link.send(Bytes::from_static(b"lost"), None).await,
            Err(SendFailure::Closed)
        );
    }
}
