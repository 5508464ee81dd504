//! Deciding who is hub.
//!
//! There is no election message on the wire. Exclusivity comes from the OS:
//! either an advisory lock on `<name>.lock` ([`ElectionGate::LockFile`]) or the
//! listening bind itself ([`ElectionGate::Endpoint`]). Everyone who loses
//! connects to the winner's socket.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{BusConfig, ElectionGate};
use crate::error::BusError;
use crate::link::LinkEvent;

/// Result of one election attempt.
#[derive(Debug)]
pub(crate) enum Outcome {
    Hub(HubEndpoint),
    Spoke(UnixStream),
    /// Nobody reachable right now; try again after the backoff.
    Retry,
}

#[derive(Debug)]
pub(crate) struct Elector {
    gate: ElectionGate,
    socket_path: PathBuf,
    lock_path: PathBuf,
}

impl Elector {
    pub(crate) fn new(config: &BusConfig) -> Result<Self, BusError> {
        Ok(Self {
            gate: config.gate,
            socket_path: config.socket_path()?,
            lock_path: config.lock_path(),
        })
    }

    /// Run one election. Never fails: anything unexpected is logged and turned
    /// into [`Outcome::Retry`].
    pub(crate) async fn elect(&self) -> Outcome {
        match self.gate {
            ElectionGate::LockFile => self.elect_by_lock().await,
            ElectionGate::Endpoint => self.elect_by_bind().await,
        }
    }

    async fn elect_by_lock(&self) -> Outcome {
        let lock = match ElectionLock::try_acquire(&self.lock_path) {
            Ok(Some(lock)) => lock,
            Ok(None) => return self.connect(false).await,
            Err(err) => {
                warn!(path = %self.lock_path.display(), error = %err, "cannot open election lock");
                return Outcome::Retry;
            }
        };

        // Holding the lock means any socket file left here belongs to a dead hub.
        remove_socket_file(&self.socket_path);

        match HubEndpoint::bind(&self.socket_path, Some(lock)) {
            Ok(endpoint) => Outcome::Hub(endpoint),
            Err(err) => {
                warn!(path = %self.socket_path.display(), error = %err, "bind failed while holding the election lock");
                Outcome::Retry
            }
        }
    }

    async fn elect_by_bind(&self) -> Outcome {
        match HubEndpoint::bind(&self.socket_path, None) {
            Ok(endpoint) => Outcome::Hub(endpoint),
            Err(err) if err.kind() == io::ErrorKind::AddrInUse => self.connect(true).await,
            Err(err) => {
                warn!(path = %self.socket_path.display(), error = %err, "bind failed");
                Outcome::Retry
            }
        }
    }

    async fn connect(&self, remove_stale: bool) -> Outcome {
        match UnixStream::connect(&self.socket_path).await {
            Ok(stream) => Outcome::Spoke(stream),
            Err(err) if err.kind() == io::ErrorKind::ConnectionRefused => {
                if remove_stale {
                    info!(path = %self.socket_path.display(), "removing stale bus socket");
                    remove_socket_file(&self.socket_path);
                } else {
                    debug!("hub not listening yet");
                }
                Outcome::Retry
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!("hub socket vanished before connect");
                Outcome::Retry
            }
            Err(err) => {
                warn!(path = %self.socket_path.display(), error = %err, "connect failed");
                Outcome::Retry
            }
        }
    }
}

/// Held exclusive lock on the election file. Released on drop, or by the OS
/// when the process dies.
#[derive(Debug)]
pub(crate) struct ElectionLock {
    file: File,
}

impl ElectionLock {
    /// `Ok(None)` if another holder has it.
    pub(crate) fn try_acquire(path: &Path) -> io::Result<Option<Self>> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)?;

        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self { file })),
            Err(err) if is_contended(&err) => Ok(None),
            Err(err) => Err(err),
        }
    }
}

impl Drop for ElectionLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

/// The hub's listening side: the bound socket, its accept task and, under the
/// lock gate, the election lock.
///
/// Dropping it stops accepting, removes the socket file if it is still ours,
/// then releases the lock.
#[derive(Debug)]
pub(crate) struct HubEndpoint {
    path: PathBuf,
    identity: Option<(u64, u64)>,
    listener: Option<UnixListener>,
    accept_task: Option<JoinHandle<()>>,
    _lock: Option<ElectionLock>,
}

impl HubEndpoint {
    fn bind(path: &Path, lock: Option<ElectionLock>) -> io::Result<Self> {
        let listener = UnixListener::bind(path)?;
        let identity = socket_identity(path).ok();
        Ok(Self {
            path: path.to_owned(),
            identity,
            listener: Some(listener),
            accept_task: None,
            _lock: lock,
        })
    }

    /// Start forwarding accepted streams to the engine, tagged with
    /// `generation`.
    pub(crate) fn start_accepting(
        &mut self,
        generation: u64,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) {
        if let Some(listener) = self.listener.take() {
            self.accept_task = Some(tokio::spawn(accept_loop(listener, generation, events)));
        }
    }
}

impl Drop for HubEndpoint {
    fn drop(&mut self) {
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
        self.listener.take();

        if self.identity.is_some() && socket_identity(&self.path).ok() == self.identity {
            debug!(path = %self.path.display(), "removing bus socket");
            remove_socket_file(&self.path);
        }
    }
}

async fn accept_loop(
    listener: UnixListener,
    generation: u64,
    events: mpsc::UnboundedSender<LinkEvent>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let event = LinkEvent::Accepted { generation, stream };
                if events.send(event).is_err() {
                    return;
                }
            }
            Err(error) => {
                let _ = events.send(LinkEvent::ListenerClosed { generation, error });
                return;
            }
        }
    }
}

fn socket_identity(path: &Path) -> io::Result<(u64, u64)> {
    let meta = fs::symlink_metadata(path)?;
    Ok((meta.dev(), meta.ino()))
}

fn remove_socket_file(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => warn!(path = %path.display(), error = %err, "failed to remove socket file"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(dir: &Path, name: &str, gate: ElectionGate) -> BusConfig {
        BusConfig::new(name).unwrap().socket_dir(dir).gate(gate)
    }

    #[test]
    fn lock_is_exclusive_until_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bus.lock");

        let first = ElectionLock::try_acquire(&path).unwrap();
        assert!(first.is_some());
        assert!(ElectionLock::try_acquire(&path).unwrap().is_none());

        drop(first);
        assert!(ElectionLock::try_acquire(&path).unwrap().is_some());
    }

    #[tokio::test]
    async fn first_elector_is_hub_second_is_spoke() {
        for gate in [ElectionGate::LockFile, ElectionGate::Endpoint] {
            let dir = tempfile::tempdir().unwrap();
            let a = Elector::new(&config(dir.path(), "pair", gate)).unwrap();
            let b = Elector::new(&config(dir.path(), "pair", gate)).unwrap();

            let hub = a.elect().await;
            assert!(matches!(hub, Outcome::Hub(_)), "{gate:?}");
            assert!(matches!(b.elect().await, Outcome::Spoke(_)), "{gate:?}");
            drop(hub);
        }
    }

    #[tokio::test]
    async fn endpoint_gate_clears_stale_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stale");
        drop(std::os::unix::net::UnixListener::bind(&path).unwrap());
        assert!(path.exists());

        let elector = Elector::new(&config(dir.path(), "stale", ElectionGate::Endpoint)).unwrap();
        assert!(matches!(elector.elect().await, Outcome::Retry));
        assert!(!path.exists());
        assert!(matches!(elector.elect().await, Outcome::Hub(_)));
    }

    #[tokio::test]
    async fn lock_winner_replaces_stale_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("crashed");
        drop(std::os::unix::net::UnixListener::bind(&path).unwrap());

        let elector = Elector::new(&config(dir.path(), "crashed", ElectionGate::LockFile)).unwrap();
        assert!(matches!(elector.elect().await, Outcome::Hub(_)));
    }

    #[tokio::test]
    async fn lock_loser_retries_without_deleting() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path(), "held", ElectionGate::LockFile);
        let _held = ElectionLock::try_acquire(&cfg.lock_path()).unwrap().unwrap();

        let socket = cfg.socket_path().unwrap();
        drop(std::os::unix::net::UnixListener::bind(&socket).unwrap());

        let elector = Elector::new(&cfg).unwrap();
        assert!(matches!(elector.elect().await, Outcome::Retry));
        assert!(socket.exists());
    }

    #[tokio::test]
    async fn dropping_hub_removes_only_its_own_socket() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path(), "own", ElectionGate::Endpoint);
        let socket = cfg.socket_path().unwrap();

        let Outcome::Hub(endpoint) = Elector::new(&cfg).unwrap().elect().await else {
            panic!("expected hub");
        };
        assert!(socket.exists());
        drop(endpoint);
        assert!(!socket.exists());

        let Outcome::Hub(endpoint) = Elector::new(&cfg).unwrap().elect().await else {
            panic!("expected hub");
        };
        // Someone replaced the file behind our back.
        fs::rename(&socket, dir.path().join("moved")).unwrap();
        drop(std::os::unix::net::UnixListener::bind(&socket).unwrap());
        drop(endpoint);
        assert!(socket.exists());
    }
}
