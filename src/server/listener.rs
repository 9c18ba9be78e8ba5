// Listener socket module
// One bound endpoint whose accept queue is shared by every worker

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::error::ServerError;

/// Why `accept` returned without a connection
#[derive(Debug)]
pub enum AcceptError {
    /// `close()` was called; no further connections will be handed out
    Closed,
    Io(io::Error),
}

/// Shared listener.
///
/// Workers call [`Listener::accept`] concurrently through an `Arc`; the
/// kernel accept queue hands each connection to exactly one caller.
#[derive(Debug)]
pub struct Listener {
    /// Taken by `close()`; pending accepts hold a clone until they wake
    inner: Mutex<Option<Arc<TcpListener>>>,
    local_addr: SocketAddr,
    closed: CancellationToken,
}

impl Listener {
    /// Bind `addr` with `SO_REUSEADDR` and the given backlog.
    ///
    /// `SO_REUSEPORT` is left off so that a port already held by another
    /// process is reported as a bind failure instead of being silently shared.
    /// Must be called from within a Tokio runtime.
    pub fn bind(addr: SocketAddr, backlog: u32) -> Result<Self, ServerError> {
        let bind_err = |source: io::Error| ServerError::Bind { addr, source };

        let domain = if addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP)).map_err(bind_err)?;

        // Allows rebinding a port still in TIME_WAIT after a restart
        socket.set_reuse_address(true).map_err(bind_err)?;
        socket.set_nonblocking(true).map_err(bind_err)?;
        socket.bind(&addr.into()).map_err(bind_err)?;
        socket
            .listen(i32::try_from(backlog).unwrap_or(i32::MAX))
            .map_err(bind_err)?;

        let std_listener: std::net::TcpListener = socket.into();
        let inner = TcpListener::from_std(std_listener).map_err(bind_err)?;
        let local_addr = inner.local_addr().map_err(bind_err)?;

        Ok(Self {
            inner: Mutex::new(Some(Arc::new(inner))),
            local_addr,
            closed: CancellationToken::new(),
        })
    }

    /// Wait for the next connection, or for `close()`.
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr), AcceptError> {
        let Some(inner) = self.inner.lock().clone() else {
            return Err(AcceptError::Closed);
        };
        tokio::select! {
            biased;
            () = self.closed.cancelled() => Err(AcceptError::Closed),
            accepted = inner.accept() => accepted.map_err(AcceptError::Io),
        }
    }

    /// Stop handing out connections and release the socket.
    ///
    /// Every pending `accept` wakes with [`AcceptError::Closed`] and drops
    /// its handle, after which the port refuses new connections.
    /// Connections still queued in the backlog are reset.
    pub fn close(&self) {
        self.closed.cancel();
        drop(self.inner.lock().take());
    }

    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}
