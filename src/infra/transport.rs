//! Listener binding and stream plumbing for both supported transports.
//!
//! A listener is bound once with the standard library types so its
//! descriptor can be handed to worker processes, then converted into a
//! tokio listener inside whichever process accepts on it.

use std::{
    fs, io,
    net::TcpListener as StdTcpListener,
    os::{
        fd::{AsRawFd, FromRawFd, RawFd},
        unix::{fs::PermissionsExt, net::UnixListener as StdUnixListener},
    },
    path::Path,
};

use nix::fcntl::{FcntlArg, FdFlag, fcntl};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpListener, TcpStream, UnixListener, UnixStream},
};
use tracing::{debug, info, warn};

use crate::config::ListenAddress;

use super::error::InfraError;

/// Any bidirectional byte stream a session can run over.
pub trait Connection: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> Connection for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

pub type BoxedConnection = Box<dyn Connection>;

/// A bound listener that has not been registered with a runtime yet.
#[derive(Debug)]
pub enum BoundListener {
    Unix(StdUnixListener),
    Tcp(StdTcpListener),
}

/// Bind the configured address. For Unix sockets a stale file at the path is
/// removed first and the socket is chmod'ed to `socket_mode` after binding.
pub fn bind_std(address: &ListenAddress, socket_mode: u32) -> Result<BoundListener, InfraError> {
    match address {
        ListenAddress::Unix(path) => {
            remove_stale_socket(path).map_err(|err| InfraError::bind(address.to_string(), err))?;
            let listener = StdUnixListener::bind(path)
                .map_err(|err| InfraError::bind(address.to_string(), err))?;
            fs::set_permissions(path, fs::Permissions::from_mode(socket_mode))
                .map_err(|err| InfraError::bind(address.to_string(), err))?;
            info!(
                target = "markdownd::transport",
                path = %path.display(),
                mode = %format!("{socket_mode:o}"),
                "listening on unix socket"
            );
            Ok(BoundListener::Unix(listener))
        }
        ListenAddress::Tcp(addr) => {
            let listener = StdTcpListener::bind(addr)
                .map_err(|err| InfraError::bind(address.to_string(), err))?;
            info!(
                target = "markdownd::transport",
                addr = %listener.local_addr().unwrap_or(*addr),
                "listening on tcp"
            );
            Ok(BoundListener::Tcp(listener))
        }
    }
}

fn remove_stale_socket(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => {
            debug!(
                target = "markdownd::transport",
                path = %path.display(),
                "removed stale socket file"
            );
            Ok(())
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

/// Remove the socket file of a Unix transport; TCP needs no cleanup.
pub fn remove_socket_file(address: &ListenAddress) {
    let ListenAddress::Unix(path) = address else {
        return;
    };
    if let Err(err) = remove_stale_socket(path) {
        warn!(
            target = "markdownd::transport",
            path = %path.display(),
            error = %err,
            "failed to remove socket file"
        );
    }
}

impl BoundListener {
    pub fn raw_fd(&self) -> RawFd {
        match self {
            BoundListener::Unix(listener) => listener.as_raw_fd(),
            BoundListener::Tcp(listener) => listener.as_raw_fd(),
        }
    }

    /// Clear close-on-exec so re-executed workers inherit the descriptor.
    pub fn share_with_children(&self) -> Result<RawFd, InfraError> {
        let fd = self.raw_fd();
        let flags = fcntl(fd, FcntlArg::F_GETFD).map_err(|err| InfraError::Io(err.into()))?;
        let mut flags = FdFlag::from_bits_truncate(flags);
        flags.remove(FdFlag::FD_CLOEXEC);
        fcntl(fd, FcntlArg::F_SETFD(flags)).map_err(|err| InfraError::Io(err.into()))?;
        Ok(fd)
    }

    /// Adopt a listener descriptor inherited from the supervisor.
    ///
    /// The descriptor must be open and of the kind `address` names. Setting
    /// close-on-exec again doubles as the check that it is open.
    pub fn from_inherited_fd(fd: RawFd, address: &ListenAddress) -> Result<Self, InfraError> {
        fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)).map_err(|err| {
            InfraError::configuration(format!("inherited listener fd {fd} is unusable: {err}"))
        })?;

        // SAFETY: the fd is open (checked above) and was handed to this
        // process only to listen on; nothing else here owns it.
        let listener = match address {
            ListenAddress::Unix(_) => BoundListener::Unix(unsafe { StdUnixListener::from_raw_fd(fd) }),
            ListenAddress::Tcp(_) => BoundListener::Tcp(unsafe { StdTcpListener::from_raw_fd(fd) }),
        };
        Ok(listener)
    }

    /// Register with the current tokio runtime.
    pub fn into_async(self) -> Result<Listener, InfraError> {
        match self {
            BoundListener::Unix(listener) => {
                listener.set_nonblocking(true)?;
                Ok(Listener::Unix(UnixListener::from_std(listener)?))
            }
            BoundListener::Tcp(listener) => {
                listener.set_nonblocking(true)?;
                Ok(Listener::Tcp(TcpListener::from_std(listener)?))
            }
        }
    }
}

#[derive(Debug)]
pub enum Listener {
    Unix(UnixListener),
    Tcp(TcpListener),
}

impl Listener {
    /// Accept one connection, returning it with a peer label for logs.
    pub async fn accept(&self) -> io::Result<(BoxedConnection, String)> {
        match self {
            Listener::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok((Box::new(stream), "unix".to_string()))
            }
            Listener::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                Ok((Box::new(stream), peer.to_string()))
            }
        }
    }

    /// The bound address, with the port resolved for TCP listeners bound to port 0.
    pub fn local_address(&self) -> io::Result<ListenAddress> {
        match self {
            Listener::Unix(listener) => {
                let addr = listener.local_addr()?;
                let path = addr.as_pathname().ok_or_else(|| {
                    io::Error::new(io::ErrorKind::InvalidInput, "unix listener has no path")
                })?;
                Ok(ListenAddress::Unix(path.to_path_buf()))
            }
            Listener::Tcp(listener) => Ok(ListenAddress::Tcp(listener.local_addr()?)),
        }
    }
}

/// Open a client connection to a running daemon.
pub async fn connect(address: &ListenAddress) -> io::Result<BoxedConnection> {
    match address {
        ListenAddress::Unix(path) => Ok(Box::new(UnixStream::connect(path).await?)),
        ListenAddress::Tcp(addr) => Ok(Box::new(TcpStream::connect(addr).await?)),
    }
}
