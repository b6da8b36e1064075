pub mod client;
pub mod socket;
pub mod wire;

use crate::collectors::Pid;
use crate::gpu::MAX_GPUS;
use crate::metrics::Metrics;
use crate::state::SharedSnapshot;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::unix::AsyncFd;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, trace, warn};
use wire::{WireMessage, MAX_CORES};

pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum IpcError {
    #[error("cannot resolve socket path: neither GPUSTATD_SOCKET nor XDG_RUNTIME_DIR is set")]
    NoSocketPath,
    #[error("failed to {op} socket: {source}")]
    Socket {
        op: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("{found} {what} found, the wire format holds at most {max}")]
    Capacity {
        what: &'static str,
        found: usize,
        max: usize,
    },
}

pub fn check_capacity(gpus: usize, cores: usize) -> Result<(), IpcError> {
    if gpus > MAX_GPUS {
        return Err(IpcError::Capacity {
            what: "gpus",
            found: gpus,
            max: MAX_GPUS,
        });
    }
    if cores > MAX_CORES {
        return Err(IpcError::Capacity {
            what: "cpu cores",
            found: cores,
            max: MAX_CORES,
        });
    }
    Ok(())
}

pub struct IpcServer {
    listener: AsyncFd<OwnedFd>,
    path: PathBuf,
}

impl IpcServer {
    /// Must be called from within a tokio runtime.
    pub fn bind(path: &Path) -> Result<Self, IpcError> {
        let fd = socket::bind_listener(path)?;
        let listener = socket::register(fd).map_err(|source| IpcError::Socket {
            op: "register",
            source,
        })?;
        info!(path = %path.display(), "ipc socket listening");
        Ok(Self {
            listener,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn accept(&self) -> io::Result<AsyncFd<OwnedFd>> {
        loop {
            let mut guard = self.listener.readable().await?;
            let accepted = guard.try_io(|inner| {
                nix::sys::socket::accept4(
                    inner.get_ref().as_raw_fd(),
                    nix::sys::socket::SockFlag::SOCK_NONBLOCK
                        | nix::sys::socket::SockFlag::SOCK_CLOEXEC,
                )
                .map_err(io::Error::from)
            });
            match accepted {
                Ok(Ok(raw)) => {
                    // SAFETY: accept4 returned a fresh descriptor nobody else owns.
                    let fd = unsafe { OwnedFd::from_raw_fd(raw) };
                    if let Err(err) = socket::enable_credentials(&fd) {
                        warn!(error = %err, "failed to enable credentials on connection");
                    }
                    return socket::register(fd);
                }
                Ok(Err(err)) => return Err(err),
                Err(_would_block) => continue,
            }
        }
    }

    pub async fn run(
        self,
        shared: SharedSnapshot,
        new_pids: mpsc::UnboundedSender<Pid>,
        metrics: Option<Arc<Metrics>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!(path = %self.path().display(), "ipc server received shutdown signal");
                    break;
                }
                accepted = self.accept() => match accepted {
                    Ok(conn) => {
                        trace!(fd = conn.get_ref().as_raw_fd(), "accepted ipc connection");
                        connections.spawn(serve_connection(
                            conn,
                            shared.clone(),
                            new_pids.clone(),
                            metrics.clone(),
                        ));
                    }
                    Err(err) => warn!(error = %err, "failed to accept ipc connection"),
                },
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(err) = joined {
                        error!(error = %err, "ipc connection task failed");
                    }
                }
            }
        }

        while let Some(joined) = connections.join_next().await {
            if let Err(err) = joined {
                error!(error = %err, "ipc connection task failed");
            }
        }
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "removed socket file"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!(path = %self.path.display(), error = %err, "failed to remove socket file"),
        }
    }
}

enum Request {
    HungUp,
    Anonymous,
    From(Pid),
}

async fn read_request(conn: &AsyncFd<OwnedFd>) -> io::Result<Request> {
    let mut buf = [0_u8; socket::REQUEST_BUF_LEN];
    loop {
        let mut guard = conn.readable().await?;
        match guard.try_io(|inner| socket::recv_with_credentials(inner.get_ref().as_raw_fd(), &mut buf)) {
            Ok(Ok((0, _))) => return Ok(Request::HungUp),
            Ok(Ok((_, Some(pid)))) => return Ok(Request::From(pid)),
            Ok(Ok((_, None))) => return Ok(Request::Anonymous),
            Ok(Err(err)) => return Err(err),
            Err(_would_block) => continue,
        }
    }
}

pub(crate) async fn send_message(conn: &AsyncFd<OwnedFd>, payload: &[u8]) -> io::Result<usize> {
    loop {
        let mut guard = conn.writable().await?;
        match guard.try_io(|inner| socket::send_datagram(inner.get_ref().as_raw_fd(), payload)) {
            Ok(result) => return result,
            Err(_would_block) => continue,
        }
    }
}

async fn serve_connection(
    conn: AsyncFd<OwnedFd>,
    shared: SharedSnapshot,
    new_pids: mpsc::UnboundedSender<Pid>,
    metrics: Option<Arc<Metrics>>,
) {
    let pid = match tokio::time::timeout(REQUEST_TIMEOUT, read_request(&conn)).await {
        Err(_) => {
            debug!("ipc client sent no request in time");
            return;
        }
        Ok(Err(err)) => {
            warn!(error = %err, "failed to receive ipc request");
            return;
        }
        Ok(Ok(Request::HungUp)) => {
            trace!("ipc client hung up");
            return;
        }
        Ok(Ok(Request::Anonymous)) => None,
        Ok(Ok(Request::From(pid))) => Some(pid),
    };
    reply(&conn, pid, &shared, &new_pids, metrics.as_deref()).await;
}

/// Sends the caller's view, or nothing at all when the request carried no
/// usable credentials.
async fn reply(
    conn: &AsyncFd<OwnedFd>,
    pid: Option<Pid>,
    shared: &SharedSnapshot,
    new_pids: &mpsc::UnboundedSender<Pid>,
    metrics: Option<&Metrics>,
) {
    let Some(pid) = pid else {
        debug!("dropping ipc request without valid credentials");
        if let Some(metrics) = metrics {
            metrics.inc_ipc_rejected();
        }
        return;
    };

    let snapshot = shared.load().await;
    if snapshot.process(pid).is_none() && new_pids.send(pid).is_err() {
        debug!(pid, "aggregator gone, pid not registered");
    }

    let message = WireMessage::for_process(&snapshot, pid).encode();
    match send_message(conn, &message).await {
        Ok(sent) if sent == message.len() => {
            trace!(pid, "sent ipc reply");
            if let Some(metrics) = metrics {
                metrics.inc_ipc_replies();
            }
        }
        Ok(sent) => warn!(pid, sent, expected = message.len(), "short ipc reply"),
        Err(err) => warn!(pid, error = %err, "failed to send ipc reply"),
    }
}
