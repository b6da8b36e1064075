use crate::collectors::Pid;
use crate::ipc::IpcError;
use nix::sys::socket::{
    self, setsockopt, sockopt, AddressFamily, Backlog, MsgFlags, SockFlag, SockType, UnixAddr,
};
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::ptr;
use tokio::io::unix::AsyncFd;
use tracing::{debug, trace};

pub const SOCKET_ENV: &str = "GPUSTATD_SOCKET";
pub const RUNTIME_DIR_ENV: &str = "XDG_RUNTIME_DIR";
pub const SOCKET_FILE: &str = "gpustatd.sock";

/// Upper bound on a client request; the payload itself is ignored.
pub const REQUEST_BUF_LEN: usize = 4096;

/// Enough room for one `SCM_CREDENTIALS` record, aligned like a `cmsghdr`.
#[repr(C, align(8))]
struct ControlBuf([u8; 64]);

pub fn resolve_socket_path(
    env_override: Option<String>,
    configured: Option<&Path>,
    runtime_dir: Option<String>,
) -> Result<PathBuf, IpcError> {
    if let Some(path) = env_override.filter(|p| !p.is_empty()) {
        return Ok(PathBuf::from(path));
    }
    if let Some(path) = configured {
        return Ok(path.to_path_buf());
    }
    match runtime_dir.filter(|d| !d.is_empty()) {
        Some(dir) => Ok(PathBuf::from(dir).join(SOCKET_FILE)),
        None => Err(IpcError::NoSocketPath),
    }
}

pub fn socket_path_from_env(configured: Option<&Path>) -> Result<PathBuf, IpcError> {
    resolve_socket_path(
        std::env::var(SOCKET_ENV).ok(),
        configured,
        std::env::var(RUNTIME_DIR_ENV).ok(),
    )
}

pub fn seqpacket_socket() -> Result<OwnedFd, IpcError> {
    socket::socket(
        AddressFamily::Unix,
        SockType::SeqPacket,
        SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
        None,
    )
    .map_err(|source| IpcError::Socket {
        op: "create",
        source: source.into(),
    })
}

/// Creates, binds and starts listening on a credential-passing socket at
/// `path`. A stale socket file left behind by a previous run is removed.
pub fn bind_listener(path: &Path) -> Result<OwnedFd, IpcError> {
    if path.exists() {
        debug!(path = %path.display(), "removing stale socket file");
        std::fs::remove_file(path).map_err(|source| IpcError::Socket { op: "unlink", source })?;
    }

    let fd = seqpacket_socket()?;
    let addr = UnixAddr::new(path).map_err(|source| IpcError::Socket {
        op: "address",
        source: source.into(),
    })?;
    socket::bind(fd.as_raw_fd(), &addr).map_err(|source| IpcError::Socket {
        op: "bind",
        source: source.into(),
    })?;
    setsockopt(&fd, sockopt::PassCred, &true).map_err(|source| IpcError::Socket {
        op: "enable credentials on",
        source: source.into(),
    })?;
    socket::listen(&fd, Backlog::MAXCONN).map_err(|source| IpcError::Socket {
        op: "listen on",
        source: source.into(),
    })?;

    if nix::unistd::getuid().is_root() {
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o666)).map_err(
            |source| IpcError::Socket {
                op: "open up permissions of",
                source,
            },
        )?;
    }

    Ok(fd)
}

pub fn enable_credentials(fd: &OwnedFd) -> io::Result<()> {
    setsockopt(fd, sockopt::PassCred, &true).map_err(io::Error::from)
}

pub fn send_datagram(fd: RawFd, payload: &[u8]) -> io::Result<usize> {
    socket::send(fd, payload, MsgFlags::MSG_NOSIGNAL).map_err(io::Error::from)
}

pub fn recv_datagram(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    socket::recv(fd, buf, MsgFlags::empty()).map_err(io::Error::from)
}

fn cmsg_align(len: usize) -> usize {
    let align = mem::size_of::<usize>();
    (len + align - 1) & !(align - 1)
}

fn cmsg_len(payload: usize) -> usize {
    cmsg_align(mem::size_of::<libc::cmsghdr>()) + payload
}

fn cmsg_space(payload: usize) -> usize {
    cmsg_align(mem::size_of::<libc::cmsghdr>()) + cmsg_align(payload)
}

/// Hands a socket to the tokio reactor. Must be called within a runtime.
pub fn register(fd: OwnedFd) -> io::Result<AsyncFd<OwnedFd>> {
    // SAFETY: the OwnedFd moves into the AsyncFd and stays open until it is dropped.
    unsafe { AsyncFd::register(fd) }.map_err(io::Error::from)
}

pub fn recv_with_credentials(fd: RawFd, buf: &mut [u8]) -> io::Result<(usize, Option<Pid>)> {
    let mut control = ControlBuf([0; 64]);
    let control_space = cmsg_space(mem::size_of::<libc::ucred>()).min(control.0.len());

    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr().cast(),
        iov_len: buf.len(),
    };
    // SAFETY: msghdr is plain old data; every pointer set below outlives the call.
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.0.as_mut_ptr().cast();
    msg.msg_controllen = control_space as _;

    // SAFETY: fd is a valid socket and msg points at live buffers.
    let received = unsafe { libc::recvmsg(fd, &mut msg, libc::MSG_DONTWAIT) };
    if received < 0 {
        return Err(io::Error::last_os_error());
    }
    if msg.msg_flags & libc::MSG_CTRUNC != 0 {
        debug!("credential record truncated");
        return Ok((received as usize, None));
    }

    let control_len = (msg.msg_controllen as usize).min(control.0.len());
    Ok((received as usize, peer_pid(&control.0[..control_len])))
}

/// Extracts the pid from a control buffer holding exactly one
/// `SOL_SOCKET`/`SCM_CREDENTIALS` record. Anything else yields `None`.
pub fn peer_pid(control: &[u8]) -> Option<Pid> {
    let header_len = mem::size_of::<libc::cmsghdr>();
    if control.len() < header_len {
        trace!(len = control.len(), "no control message");
        return None;
    }
    // SAFETY: length checked above; cmsghdr is plain old data.
    let header: libc::cmsghdr = unsafe { ptr::read_unaligned(control.as_ptr().cast()) };

    let ucred_len = mem::size_of::<libc::ucred>();
    let expected_len = cmsg_len(ucred_len);
    if header.cmsg_len as usize != expected_len {
        debug!(len = header.cmsg_len as usize, expected_len, "bad cmsg header length");
        return None;
    }
    if header.cmsg_level != libc::SOL_SOCKET {
        debug!(level = header.cmsg_level, "cmsg_level is not SOL_SOCKET");
        return None;
    }
    if header.cmsg_type != libc::SCM_CREDENTIALS {
        debug!(kind = header.cmsg_type, "cmsg_type is not SCM_CREDENTIALS");
        return None;
    }

    let data_offset = cmsg_len(0);
    if control.len() < data_offset + ucred_len {
        return None;
    }
    // SAFETY: bounds checked above; ucred is plain old data.
    let cred: libc::ucred = unsafe { ptr::read_unaligned(control[data_offset..].as_ptr().cast()) };
    trace!(pid = cred.pid, uid = cred.uid, gid = cred.gid, "received credentials");
    if cred.pid <= 0 {
        debug!(pid = cred.pid, "credential record without a sender pid");
        return None;
    }
    Some(cred.pid)
}
