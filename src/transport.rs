use axum::extract::connect_info::Connected;
use axum::serve::{IncomingStream, Listener};
use axum::http::StatusCode;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tracing::warn;

// Opaque identity of one transport connection
pub type ConnectionId = u64;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

type CloseObserver = Box<dyn FnOnce() + Send>;
type CompletionObserver = Box<dyn FnOnce(StatusCode) + Send>;

// Observer state is only ever touched for a few instructions at a time,
// so a poisoned lock still holds consistent data
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

enum CloseState {
    Open(Vec<CloseObserver>),
    Closed,
}

struct ConnectionInner {
    id: ConnectionId,
    peer: Option<SocketAddr>,
    state: Mutex<CloseState>,
}

/// Handle to one transport connection.
///
/// Every request served over the same connection carries a clone of the
/// same handle. Observers registered with [`ConnectionHandle::on_close`] run
/// exactly once, when the connection goes away.
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<ConnectionInner>,
}

impl ConnectionHandle {
    pub fn new(peer: SocketAddr) -> Self {
        Self::with_peer(Some(peer))
    }

    /// A connection whose remote address is not known, e.g. a request
    /// routed without connect info. Its requests resolve to
    /// [`AddressKey::Unknown`](crate::AddressKey::Unknown) unless a proxy
    /// header names the client.
    pub fn unattributed() -> Self {
        Self::with_peer(None)
    }

    fn with_peer(peer: Option<SocketAddr>) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
                peer,
                state: Mutex::new(CloseState::Open(Vec::new())),
            }),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.peer
    }

    pub fn is_closed(&self) -> bool {
        matches!(*lock(&self.inner.state), CloseState::Closed)
    }

    /// Runs `observer` once the connection closes, or right away if it
    /// already has.
    pub fn on_close<F>(&self, observer: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut state = lock(&self.inner.state);
            if let CloseState::Open(observers) = &mut *state {
                observers.push(Box::new(observer));
                return;
            }
        }
        observer();
    }

    /// Marks the connection closed and notifies observers. Later calls are no-ops.
    pub fn close(&self) {
        let previous = std::mem::replace(&mut *lock(&self.inner.state), CloseState::Closed);
        // observers run without the lock held, they may register more
        if let CloseState::Open(observers) = previous {
            for observer in observers {
                observer();
            }
        }
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.inner.id)
            .field("peer", &self.inner.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}

enum Completion {
    Pending(Vec<CompletionObserver>),
    Done(StatusCode),
}

/// Completion event of one response, carrying its final status.
pub struct ResponseHandle {
    state: Mutex<Completion>,
}

impl ResponseHandle {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(Completion::Pending(Vec::new())),
        }
    }

    // runs once with the final status; immediately if already complete
    pub fn on_complete<F>(&self, observer: F)
    where
        F: FnOnce(StatusCode) + Send + 'static,
    {
        let status = {
            let mut state = lock(&self.state);
            match &mut *state {
                Completion::Pending(observers) => {
                    observers.push(Box::new(observer));
                    return;
                }
                Completion::Done(status) => *status,
            }
        };
        observer(status);
    }

    pub fn complete(&self, status: StatusCode) {
        let previous = {
            let mut state = lock(&self.state);
            if matches!(*state, Completion::Done(_)) {
                return;
            }
            std::mem::replace(&mut *state, Completion::Done(status))
        };
        if let Completion::Pending(observers) = previous {
            for observer in observers {
                observer(status);
            }
        }
    }

    pub fn status(&self) -> Option<StatusCode> {
        match *lock(&self.state) {
            Completion::Done(status) => Some(status),
            Completion::Pending(_) => None,
        }
    }
}

impl Default for ResponseHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Connect info attached to every request served by a [`TrackedListener`].
#[derive(Clone, Debug)]
pub struct PeerConnection {
    pub addr: SocketAddr,
    pub connection: ConnectionHandle,
}

impl PeerConnection {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            connection: ConnectionHandle::new(addr),
        }
    }
}

impl Connected<IncomingStream<'_, TrackedListener>> for PeerConnection {
    fn connect_info(stream: IncomingStream<'_, TrackedListener>) -> Self {
        stream.remote_addr().clone()
    }
}

/// TCP listener that gives each accepted connection a [`ConnectionHandle`]
/// and closes it when the server drops the connection's stream.
pub struct TrackedListener {
    inner: TcpListener,
}

impl TrackedListener {
    pub async fn bind<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        Ok(Self {
            inner: TcpListener::bind(addr).await?,
        })
    }

    pub fn from_tcp(inner: TcpListener) -> Self {
        Self { inner }
    }

    pub fn bound_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}

impl Listener for TrackedListener {
    type Io = TrackedStream;
    type Addr = PeerConnection;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        loop {
            match self.inner.accept().await {
                Ok((stream, addr)) => {
                    let peer = PeerConnection::new(addr);
                    let stream = TrackedStream {
                        stream,
                        connection: peer.connection.clone(),
                    };
                    return (stream, peer);
                }
                Err(e) => {
                    // per-connection errors are transient, anything else
                    // (fd exhaustion) needs a moment to clear up
                    if !is_connection_error(&e) {
                        warn!(error = %e, "accept failed");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        self.inner.local_addr().map(PeerConnection::new)
    }
}

fn is_connection_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
    )
}

/// Accepted TCP stream; dropping it closes its connection handle.
pub struct TrackedStream {
    stream: TcpStream,
    connection: ConnectionHandle,
}

impl Drop for TrackedStream {
    fn drop(&mut self) {
        self.connection.close();
    }
}

impl AsyncRead for TrackedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for TrackedStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.stream.is_write_vectored()
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn peer() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    #[test]
    fn test_close_runs_observers_once() {
        let conn = ConnectionHandle::new(peer());
        let calls = Arc::new(AtomicUsize::new(0));

        let c = calls.clone();
        conn.on_close(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert!(!conn.is_closed());

        conn.close();
        conn.close();
        assert!(conn.is_closed());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_observer_after_close_runs_immediately() {
        let conn = ConnectionHandle::new(peer());
        conn.close();

        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        conn.on_close(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_connection_ids_are_unique() {
        let a = ConnectionHandle::new(peer());
        let b = ConnectionHandle::new(peer());
        assert_ne!(a.id(), b.id());
        assert_eq!(a.clone().id(), a.id());
    }

    #[test]
    fn test_unattributed_connection_has_no_peer() {
        let conn = ConnectionHandle::unattributed();
        assert_eq!(conn.peer_addr(), None);
        assert_eq!(ConnectionHandle::new(peer()).peer_addr(), Some(peer()));
    }

    #[test]
    fn test_response_completion_carries_status() {
        let response = ResponseHandle::new();
        let seen = Arc::new(Mutex::new(None));

        let s = seen.clone();
        response.on_complete(move |status| {
            *s.lock().unwrap() = Some(status);
        });
        assert_eq!(response.status(), None);

        response.complete(StatusCode::NOT_FOUND);
        // a second completion is ignored
        response.complete(StatusCode::OK);

        assert_eq!(*seen.lock().unwrap(), Some(StatusCode::NOT_FOUND));
        assert_eq!(response.status(), Some(StatusCode::NOT_FOUND));
    }
}
