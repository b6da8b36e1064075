use crate::ipc::socket::{self, recv_datagram};
use crate::ipc::wire::{WireError, WireMessage, WIRE_MESSAGE_SIZE};
use crate::ipc::{send_message, IpcError};
use nix::sys::socket::UnixAddr;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tokio::io::unix::AsyncFd;

pub const REQUEST: &[u8] = b"gpustatd";

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Ipc(#[from] IpcError),
    #[error("failed to {op}: {source}")]
    Io {
        op: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("no reply from server within {0:?}")]
    Timeout(Duration),
    #[error("server closed the connection without replying")]
    Closed,
    #[error("malformed reply: {0}")]
    Wire(#[from] WireError),
}

pub fn connect(path: &Path) -> Result<OwnedFd, ClientError> {
    let fd = socket::seqpacket_socket()?;
    socket::enable_credentials(&fd).map_err(|source| ClientError::Io {
        op: "enable credentials",
        source,
    })?;
    let addr = UnixAddr::new(path).map_err(|source| ClientError::Io {
        op: "build socket address",
        source: source.into(),
    })?;
    nix::sys::socket::connect(fd.as_raw_fd(), &addr).map_err(|source| ClientError::Io {
        op: "connect to server",
        source: source.into(),
    })?;
    Ok(fd)
}

pub async fn query(path: &Path, timeout: Duration) -> Result<WireMessage, ClientError> {
    let conn = socket::register(connect(path)?).map_err(|source| ClientError::Io {
        op: "register socket",
        source,
    })?;
    tokio::time::timeout(timeout, exchange(&conn))
        .await
        .map_err(|_| ClientError::Timeout(timeout))?
}

async fn exchange(conn: &AsyncFd<OwnedFd>) -> Result<WireMessage, ClientError> {
    send_message(conn, REQUEST)
        .await
        .map_err(|source| ClientError::Io {
            op: "send request",
            source,
        })?;

    // one spare byte so an oversized reply shows up as a length error
    let mut buf = vec![0_u8; WIRE_MESSAGE_SIZE + 1];
    let received = loop {
        let mut guard = conn.readable().await.map_err(|source| ClientError::Io {
            op: "wait for reply",
            source,
        })?;
        match guard.try_io(|inner| recv_datagram(inner.get_ref().as_raw_fd(), &mut buf)) {
            Ok(result) => {
                break result.map_err(|source| ClientError::Io {
                    op: "receive reply",
                    source,
                })?
            }
            Err(_would_block) => continue,
        }
    };

    if received == 0 {
        return Err(ClientError::Closed);
    }
    Ok(WireMessage::decode(&buf[..received])?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_server_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = query(&dir.path().join("absent.sock"), Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Io { op: "connect to server", .. }));
    }
}
