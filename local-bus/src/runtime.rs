//! The bus engine and the handle applications talk to it through.
//!
//! One task owns every piece of bus state: role, peer registry, hub endpoint
//! and the query tables. Everything else reaches it by message:
//!
//! - [`BusHandle`] sends [`BusCommand`]s and awaits one-shot replies.
//! - Link reader/writer tasks and the accept task send [`LinkEvent`]s over an
//!   unbounded channel, so a reader never waits on the engine.
//! - Subscribers receive [`BusEvent`]s over a `broadcast` channel.
//!
//! Because the engine never waits on a caller, a caller blocked in
//! [`BusHandle::send_query`] cannot stall relaying or re-election.

use std::future::pending;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use tokio::runtime::Handle;
use tokio::select;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{self, Sleep};
use tracing::{Instrument, debug, info, info_span, warn};

use crate::config::BusConfig;
use crate::correlation::Correlator;
use crate::election::{Elector, HubEndpoint, Outcome};
use crate::error::BusError;
use crate::event::{BusEvent, BusStatus, Role};
use crate::frame::is_single_line;
use crate::link::{LinkEvent, LinkId, PeerLink};
use crate::query::{self, QueryId};
use crate::registry::PeerRegistry;

const COMMAND_BUFFER: usize = 64;

/// Entry point for joining a bus.
pub struct Bus;

/// What [`Bus::board`] hands back: a handle for sending and the first event
/// receiver.
pub struct BusChannels {
    pub handle: BusHandle,
    pub events: broadcast::Receiver<BusEvent>,
}

impl Bus {
    /// Join the bus described by `config`.
    ///
    /// Creates the socket directory and runs the first election before
    /// returning, so the process is already hub or spoke (or electing with a
    /// retry armed). The engine then runs as a background task until
    /// [`BusHandle::shutdown`] or until every handle is dropped.
    pub async fn board(config: BusConfig) -> Result<BusChannels, BusError> {
        tokio::fs::create_dir_all(config.dir()).await?;
        let elector = Elector::new(&config)?;

        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);
        let (links_tx, links_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = broadcast::channel(config.event_buffer);

        let span = info_span!("bus", name = %config.name);
        let mut engine = Engine::new(config, elector, events_tx.clone(), links_tx);
        let first = engine.reinit().instrument(span.clone()).await;
        tokio::spawn(run(engine, commands_rx, links_rx, first).instrument(span));

        Ok(BusChannels {
            handle: BusHandle {
                commands: commands_tx,
                events: events_tx,
                runtime: Handle::current(),
            },
            events: events_rx,
        })
    }
}

/// Requests sent from a [`BusHandle`] to the engine.
#[derive(Debug)]
enum BusCommand {
    Send {
        frame: Bytes,
        queued: oneshot::Sender<()>,
    },
    Query {
        id: QueryId,
        payload: Bytes,
        reply: oneshot::Sender<Bytes>,
    },
    ExpireQuery {
        id: QueryId,
    },
    LastMessage {
        respond_to: oneshot::Sender<Option<Bytes>>,
    },
    LastQuery {
        respond_to: oneshot::Sender<Option<(QueryId, Bytes)>>,
    },
    Status {
        respond_to: oneshot::Sender<BusStatus>,
    },
    SetQueryMessages {
        enabled: bool,
    },
    Shutdown {
        respond_to: oneshot::Sender<()>,
    },
}

/// Cloneable handle to a running bus engine.
///
/// Dropping the last handle makes the engine leave the bus.
#[derive(Clone)]
pub struct BusHandle {
    commands: mpsc::Sender<BusCommand>,
    events: broadcast::Sender<BusEvent>,
    runtime: Handle,
}

impl BusHandle {
    /// Broadcast `payload` to every other member.
    ///
    /// Returns once the frame is queued on every link, waiting for room if a
    /// link is backed up.
    pub async fn send_message(&self, payload: impl Into<Bytes>) -> Result<(), BusError> {
        let frame = single_line(payload.into())?;
        self.send_frame(frame).await
    }

    /// Broadcast `payload` as a query and wait for the first response.
    ///
    /// Fails with [`BusError::QueryTimeout`] if nothing answers within
    /// `timeout`. A response arriving later is dropped.
    pub async fn send_query(
        &self,
        payload: impl Into<Bytes>,
        timeout: Duration,
    ) -> Result<Bytes, BusError> {
        let payload = single_line(payload.into())?;
        let id = QueryId::new();
        let (reply, response) = oneshot::channel();
        self.request(BusCommand::Query { id, payload, reply }).await?;
        let mut guard = ExpireOnDrop::new(id, &self.commands);

        match time::timeout(timeout, response).await {
            Ok(Ok(answer)) => {
                guard.disarm();
                Ok(answer)
            }
            Ok(Err(_)) => Err(BusError::Closed),
            Err(_) => Err(BusError::QueryTimeout { id, timeout }),
        }
    }

    /// Thread-blocking form of [`send_query`](Self::send_query) for code
    /// running outside the runtime.
    ///
    /// Needs a multi-thread runtime. Panics if called from async context.
    pub fn send_query_blocking(
        &self,
        payload: impl Into<Bytes>,
        timeout: Duration,
    ) -> Result<Bytes, BusError> {
        self.runtime.block_on(self.send_query(payload, timeout))
    }

    /// Answer query `id`. On the wire this looks just like the query did.
    pub async fn send_query_response(
        &self,
        id: QueryId,
        payload: impl Into<Bytes>,
    ) -> Result<(), BusError> {
        let payload = single_line(payload.into())?;
        self.send_frame(query::encode(id, &payload)).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.events.subscribe()
    }

    /// The last raw frame processed locally.
    pub async fn last_message(&self) -> Result<Option<Bytes>, BusError> {
        let (respond_to, rx) = oneshot::channel();
        self.request(BusCommand::LastMessage { respond_to }).await?;
        rx.await.map_err(|_| BusError::Closed)
    }

    /// The last query or response recorded, with its id.
    pub async fn last_query(&self) -> Result<Option<(QueryId, Bytes)>, BusError> {
        let (respond_to, rx) = oneshot::channel();
        self.request(BusCommand::LastQuery { respond_to }).await?;
        rx.await.map_err(|_| BusError::Closed)
    }

    pub async fn status(&self) -> Result<BusStatus, BusError> {
        let (respond_to, rx) = oneshot::channel();
        self.request(BusCommand::Status { respond_to }).await?;
        rx.await.map_err(|_| BusError::Closed)
    }

    /// Also surface query traffic, duplicates included, as
    /// [`BusEvent::MessageReceived`].
    pub async fn set_query_messages(&self, enabled: bool) -> Result<(), BusError> {
        self.request(BusCommand::SetQueryMessages { enabled }).await
    }

    /// Leave the bus: close every link, stop listening and give up the
    /// endpoint. Returns once the engine has let go. Calling it again is a
    /// no-op.
    pub async fn shutdown(&self) -> Result<(), BusError> {
        let (respond_to, rx) = oneshot::channel();
        if self
            .commands
            .send(BusCommand::Shutdown { respond_to })
            .await
            .is_err()
        {
            return Ok(());
        }
        let _ = rx.await;
        Ok(())
    }

    async fn send_frame(&self, frame: Bytes) -> Result<(), BusError> {
        let (queued, done) = oneshot::channel();
        self.request(BusCommand::Send { frame, queued }).await?;
        done.await.map_err(|_| BusError::Closed)
    }

    async fn request(&self, command: BusCommand) -> Result<(), BusError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| BusError::Closed)
    }
}

/// Tells the engine to forget a pending query unless it was answered.
///
/// Covers callers that time out as well as callers whose future is dropped
/// mid-wait. If the command queue is full the engine still sweeps the entry
/// on its next dispatch.
struct ExpireOnDrop<'a> {
    id: QueryId,
    commands: &'a mpsc::Sender<BusCommand>,
    armed: bool,
}

impl<'a> ExpireOnDrop<'a> {
    fn new(id: QueryId, commands: &'a mpsc::Sender<BusCommand>) -> Self {
        Self {
            id,
            commands,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ExpireOnDrop<'_> {
    fn drop(&mut self) {
        if self.armed {
            let _ = self.commands.try_send(BusCommand::ExpireQuery { id: self.id });
        }
    }
}

fn single_line(payload: Bytes) -> Result<Bytes, BusError> {
    if is_single_line(&payload) {
        Ok(payload)
    } else {
        Err(BusError::EmbeddedDelimiter)
    }
}

/// Result of an election from the engine loop's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Election {
    Settled,
    RetryAfter(Duration),
}

enum Step {
    Continue,
    Reelected(Election),
    Stop,
    /// Stop, then tell the caller once the engine has let go of the bus.
    Shutdown(oneshot::Sender<()>),
}

struct Engine {
    config: BusConfig,
    elector: Elector,
    role: Role,
    hub: Option<HubEndpoint>,
    /// Bumped on every election so stale accept-loop reports can be told apart.
    generation: u64,
    next_link: u64,
    registry: PeerRegistry,
    correlator: Correlator,
    events: broadcast::Sender<BusEvent>,
    links: mpsc::UnboundedSender<LinkEvent>,
}

async fn run(
    mut engine: Engine,
    mut commands: mpsc::Receiver<BusCommand>,
    mut links: mpsc::UnboundedReceiver<LinkEvent>,
    first: Election,
) {
    let mut retry = arm(first);

    let ack = loop {
        let step = select! {
            command = commands.recv() => match command {
                Some(command) => engine.handle_command(command).await,
                None => Step::Stop,
            },
            Some(event) = links.recv() => engine.handle_link_event(event).await,
            () = retry_elapsed(&mut retry) => {
                retry = None;
                Step::Reelected(engine.reinit().await)
            }
        };

        match step {
            Step::Continue => {}
            Step::Reelected(election) => retry = arm(election),
            Step::Stop => break None,
            Step::Shutdown(ack) => break Some(ack),
        }
    };

    // Refuse further commands before reporting that we are gone.
    drop(commands);
    engine.leave();
    if let Some(ack) = ack {
        let _ = ack.send(());
    }
}

/// A fresh election supersedes any retry that was pending.
fn arm(election: Election) -> Option<Pin<Box<Sleep>>> {
    match election {
        Election::Settled => None,
        Election::RetryAfter(backoff) => Some(Box::pin(time::sleep(backoff))),
    }
}

async fn retry_elapsed(retry: &mut Option<Pin<Box<Sleep>>>) {
    match retry {
        Some(sleep) => sleep.as_mut().await,
        None => pending().await,
    }
}

impl Engine {
    fn new(
        config: BusConfig,
        elector: Elector,
        events: broadcast::Sender<BusEvent>,
        links: mpsc::UnboundedSender<LinkEvent>,
    ) -> Self {
        let correlator = Correlator::new(config.query_messages);
        Self {
            config,
            elector,
            role: Role::Electing,
            hub: None,
            generation: 0,
            next_link: 0,
            registry: PeerRegistry::default(),
            correlator,
            events,
            links,
        }
    }

    /// Find our place on the bus: hub if we can claim the endpoint, spoke
    /// otherwise. A hub that is still listening stays put.
    async fn reinit(&mut self) -> Election {
        if self.hub.is_some() {
            return Election::Settled;
        }

        self.registry.clear();
        self.generation += 1;

        match self.elector.elect().await {
            Outcome::Hub(mut endpoint) => {
                endpoint.start_accepting(self.generation, self.links.clone());
                self.hub = Some(endpoint);
                self.set_role(Role::Hub);
                Election::Settled
            }
            Outcome::Spoke(stream) => {
                let link = self.spawn_link(stream);
                self.registry.insert(link);
                self.set_role(Role::Spoke);
                Election::Settled
            }
            Outcome::Retry => {
                self.set_role(Role::Electing);
                Election::RetryAfter(self.config.retry_backoff)
            }
        }
    }

    async fn handle_command(&mut self, command: BusCommand) -> Step {
        match command {
            BusCommand::Send { frame, queued } => {
                let step = self.broadcast(&frame).await;
                let _ = queued.send(());
                step
            }
            BusCommand::Query { id, payload, reply } => {
                let frame = self.correlator.dispatch(id, &payload, reply);
                debug!(%id, "query dispatched");
                self.broadcast(&frame).await
            }
            BusCommand::ExpireQuery { id } => {
                self.correlator.expire(id);
                self.correlator.forget_abandoned();
                Step::Continue
            }
            BusCommand::LastMessage { respond_to } => {
                let _ = respond_to.send(self.correlator.last_frame());
                Step::Continue
            }
            BusCommand::LastQuery { respond_to } => {
                let _ = respond_to.send(self.correlator.last_query());
                Step::Continue
            }
            BusCommand::Status { respond_to } => {
                let _ = respond_to.send(BusStatus {
                    role: self.role,
                    peers: self.registry.len(),
                });
                Step::Continue
            }
            BusCommand::SetQueryMessages { enabled } => {
                self.correlator.set_query_messages(enabled);
                Step::Continue
            }
            BusCommand::Shutdown { respond_to } => Step::Shutdown(respond_to),
        }
    }

    async fn handle_link_event(&mut self, event: LinkEvent) -> Step {
        match event {
            LinkEvent::Accepted { generation, stream } => {
                if self.role == Role::Hub && generation == self.generation {
                    let link = self.spawn_link(stream);
                    info!(id = %link.id(), peers = self.registry.len() + 1, "spoke joined");
                    self.registry.insert(link);
                } else {
                    debug!("dropping connection from a retired listener");
                }
                Step::Continue
            }
            LinkEvent::Frame { id, frame } => {
                if !self.registry.contains(id) {
                    return Step::Continue;
                }
                let failed = self.registry.relay(id, &frame, self.stall_limit()).await;
                for event in self.correlator.process(frame) {
                    self.emit(event);
                }
                self.drop_links(failed).await
            }
            LinkEvent::Closed { id, error } => {
                if let Some(error) = &error {
                    debug!(%id, %error, "link failed");
                }
                self.drop_links(vec![id]).await
            }
            LinkEvent::ListenerClosed { generation, error } => {
                if generation != self.generation || self.hub.is_none() {
                    return Step::Continue;
                }
                warn!(%error, "listener stopped; re-electing");
                self.hub = None;
                self.registry.clear();
                Step::Reelected(self.reinit().await)
            }
        }
    }

    async fn broadcast(&mut self, frame: &Bytes) -> Step {
        if self.registry.is_empty() {
            debug!(role = %self.role, "no peers; frame not sent");
        }
        let failed = self.registry.send_all(frame, self.stall_limit()).await;
        self.drop_links(failed).await
    }

    /// A hub cuts off a spoke that stops reading. A spoke waits on its hub.
    fn stall_limit(&self) -> Option<Duration> {
        (self.role == Role::Hub).then_some(self.config.stall_timeout)
    }

    /// Remove broken links. A spoke that loses its hub link goes back to
    /// election.
    async fn drop_links(&mut self, ids: Vec<LinkId>) -> Step {
        let mut removed = false;
        for id in ids {
            if self.registry.remove(id).is_some() {
                removed = true;
                debug!(%id, peers = self.registry.len(), "link dropped");
            }
        }

        if removed && self.role == Role::Spoke && self.registry.is_empty() {
            info!("lost the hub; re-electing");
            return Step::Reelected(self.reinit().await);
        }
        Step::Continue
    }

    fn spawn_link(&mut self, stream: tokio::net::UnixStream) -> PeerLink {
        self.next_link += 1;
        PeerLink::spawn(
            LinkId::new(self.next_link),
            stream,
            self.links.clone(),
            self.config.max_frame_len,
            self.config.link_buffer,
        )
    }

    fn set_role(&mut self, role: Role) {
        if self.role != role {
            info!(from = %self.role, to = %role, "role changed");
            self.role = role;
            self.emit(BusEvent::RoleChanged { role });
        }
    }

    fn emit(&self, event: BusEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn leave(&mut self) {
        if self.hub.is_none() && self.registry.is_empty() {
            return;
        }
        self.registry.clear();
        self.hub = None;
        info!("left the bus");
    }
}
