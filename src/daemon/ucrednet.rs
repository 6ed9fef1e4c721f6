//! Peer-credential listener
//!
//! Wraps the API listener so every accepted connection carries the kernel
//! reported pid/uid of its peer, encoded in the connection's remote address
//! as `pid=<P>;uid=<U>;socket=<listener path>;`. The gateway re-parses that
//! address for each request instead of trusting anything the client sends.

use nix::sys::socket::{getsockopt, sockopt};
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// The single outcome for any address that does not identify a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum UcredError {
    #[error("no pid/uid found in connection")]
    NoIdentity,
}

/// Identity of the process at the other end of a connection
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Ucred {
    pub pid: u32,
    pub uid: u32,
    /// Path of the listener the connection came in on
    pub socket: String,
}

impl fmt::Display for Ucred {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pid={};uid={};socket={};", self.pid, self.uid, self.socket)
    }
}

/// Parse a remote address produced by [`UcrednetListener`].
///
/// Anything but exactly one `pid=<u32>;uid=<u32>;socket=<path>;` block is
/// rejected, including a valid block followed by a second one.
pub fn parse_ucred(addr: &str) -> Result<Ucred, UcredError> {
    let rest = addr.strip_prefix("pid=").ok_or(UcredError::NoIdentity)?;
    let (pid, rest) = rest.split_once(';').ok_or(UcredError::NoIdentity)?;
    let rest = rest.strip_prefix("uid=").ok_or(UcredError::NoIdentity)?;
    let (uid, rest) = rest.split_once(';').ok_or(UcredError::NoIdentity)?;
    let rest = rest.strip_prefix("socket=").ok_or(UcredError::NoIdentity)?;
    let (socket, rest) = rest.split_once(';').ok_or(UcredError::NoIdentity)?;
    if !rest.is_empty() {
        return Err(UcredError::NoIdentity);
    }

    Ok(Ucred {
        pid: parse_u32(pid)?,
        uid: parse_u32(uid)?,
        socket: socket.to_string(),
    })
}

fn parse_u32(digits: &str) -> Result<u32, UcredError> {
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(UcredError::NoIdentity);
    }
    digits.parse().map_err(|_| UcredError::NoIdentity)
}

/// Kernel-reported credentials of a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerCred {
    pub pid: i32,
    pub uid: u32,
    pub gid: u32,
}

impl PeerCred {
    /// Credentials the kernel fills in when it has none to report
    fn is_unset(&self) -> bool {
        self.pid == 0 || self.uid == u32::MAX || self.gid == u32::MAX
    }
}

/// Resolves the credentials of an accepted connection's peer
pub trait PeerCredResolver: Send + Sync {
    fn peer_cred(&self, stream: &UnixStream) -> io::Result<PeerCred>;
}

/// `SO_PEERCRED` lookup
#[derive(Debug, Clone, Copy, Default)]
pub struct KernelPeerCred;

impl PeerCredResolver for KernelPeerCred {
    fn peer_cred(&self, stream: &UnixStream) -> io::Result<PeerCred> {
        let cred = getsockopt(stream, sockopt::PeerCredentials).map_err(io::Error::from)?;
        Ok(PeerCred {
            pid: cred.pid(),
            uid: cred.uid(),
            gid: cred.gid(),
        })
    }
}

/// What the serving layer knows about an accepted connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    id: u64,
    remote_addr: String,
}

impl ConnectionInfo {
    pub fn new(id: u64, remote_addr: impl Into<String>) -> Self {
        Self {
            id,
            remote_addr: remote_addr.into(),
        }
    }

    /// Unique among the connections of one listener
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    /// Identity of the peer, re-derived from the remote address
    pub fn ucred(&self) -> Result<Ucred, UcredError> {
        parse_ucred(&self.remote_addr)
    }
}

/// An accepted connection and its metadata
#[derive(Debug)]
pub struct UcrednetConn {
    stream: UnixStream,
    info: Arc<ConnectionInfo>,
}

impl UcrednetConn {
    pub fn info(&self) -> &Arc<ConnectionInfo> {
        &self.info
    }

    pub fn remote_addr(&self) -> &str {
        self.info.remote_addr()
    }

    pub fn into_parts(self) -> (UnixStream, Arc<ConnectionInfo>) {
        (self.stream, self.info)
    }
}

pub struct UcrednetListener {
    inner: UnixListener,
    socket: String,
    resolver: Arc<dyn PeerCredResolver>,
    next_id: AtomicU64,
    closed: CancellationToken,
}

impl UcrednetListener {
    pub fn new(inner: UnixListener, resolver: Arc<dyn PeerCredResolver>) -> Self {
        let socket = inner
            .local_addr()
            .ok()
            .and_then(|addr| addr.as_pathname().map(|path| path.display().to_string()))
            .unwrap_or_default();
        Self {
            inner,
            socket,
            resolver,
            next_id: AtomicU64::new(1),
            closed: CancellationToken::new(),
        }
    }

    /// Path the listener is bound to
    pub fn socket(&self) -> &str {
        &self.socket
    }

    /// Accept the next connection. Failing to resolve the peer's credentials
    /// yields a connection without identity, not an error.
    pub async fn accept(&self) -> io::Result<UcrednetConn> {
        if self.closed.is_cancelled() {
            return Err(closed_error());
        }
        let stream = tokio::select! {
            accepted = self.inner.accept() => accepted?.0,
            _ = self.closed.cancelled() => return Err(closed_error()),
        };

        let cred = match self.resolver.peer_cred(&stream) {
            Ok(cred) if !cred.is_unset() => Some(cred),
            Ok(_) => None,
            Err(err) => {
                debug!(error = %err, "cannot obtain peer credentials");
                None
            }
        };
        let remote_addr = match cred {
            Some(cred) => format!("pid={};uid={};socket={};", cred.pid, cred.uid, self.socket),
            None => format!("pid=;uid=;socket={};", self.socket),
        };
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        Ok(UcrednetConn {
            stream,
            info: Arc::new(ConnectionInfo::new(id, remote_addr)),
        })
    }

    /// Stop accepting. Safe to call any number of times.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "use of closed listener")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct FakeResolver(Mutex<io::Result<PeerCred>>);

    impl FakeResolver {
        fn ok(pid: i32, uid: u32) -> Arc<Self> {
            Arc::new(Self(Mutex::new(Ok(PeerCred { pid, uid, gid: uid }))))
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self(Mutex::new(Err(io::Error::new(io::ErrorKind::Other, "oopsie")))))
        }
    }

    impl PeerCredResolver for FakeResolver {
        fn peer_cred(&self, _stream: &UnixStream) -> io::Result<PeerCred> {
            match &*self.0.lock().unwrap() {
                Ok(cred) => Ok(*cred),
                Err(err) => Err(io::Error::new(err.kind(), err.to_string())),
            }
        }
    }

    fn listener(dir: &tempfile::TempDir, resolver: Arc<dyn PeerCredResolver>) -> UcrednetListener {
        let sock = dir.path().join("sock");
        UcrednetListener::new(UnixListener::bind(&sock).unwrap(), resolver)
    }

    #[test]
    fn test_get() {
        let u = parse_ucred("pid=100;uid=42;socket=/run/snap.socket;").unwrap();
        assert_eq!(
            u,
            Ucred {
                pid: 100,
                uid: 42,
                socket: "/run/snap.socket".to_string()
            }
        );
    }

    #[test]
    fn test_get_empty_socket() {
        let u = parse_ucred("pid=1;uid=0;socket=;").unwrap();
        assert_eq!(u.socket, "");
    }

    #[test]
    fn test_get_no_uid() {
        assert_eq!(parse_ucred("pid=100;uid=;socket=;"), Err(UcredError::NoIdentity));
    }

    #[test]
    fn test_get_bad_uid() {
        assert_eq!(
            parse_ucred("pid=100;uid=4294967296;socket=;"),
            Err(UcredError::NoIdentity)
        );
    }

    #[test]
    fn test_get_signed_or_padded_numbers() {
        for addr in [
            "pid=+100;uid=42;socket=;",
            "pid=100;uid=-1;socket=;",
            "pid=100;uid= 42;socket=;",
            "pid=;uid=42;socket=;",
        ] {
            assert_eq!(parse_ucred(addr), Err(UcredError::NoIdentity), "{addr}");
        }
    }

    #[test]
    fn test_get_non_ucrednet() {
        assert_eq!(parse_ucred("hello"), Err(UcredError::NoIdentity));
        assert_eq!(parse_ucred(""), Err(UcredError::NoIdentity));
        assert_eq!(parse_ucred("uid=42;pid=100;socket=;"), Err(UcredError::NoIdentity));
        assert_eq!(parse_ucred("pid=100;uid=42;socket=/x"), Err(UcredError::NoIdentity));
    }

    #[test]
    fn test_get_sneak() {
        assert_eq!(
            parse_ucred("pid=100;uid=42;socket=/run/snap.socket;pid=0;uid=0;socket=/tmp/my.socket"),
            Err(UcredError::NoIdentity)
        );
        assert_eq!(
            parse_ucred("pid=100;uid=42;socket=/run/snap.socket;pid=0;uid=0;socket=/tmp/my.socket;"),
            Err(UcredError::NoIdentity)
        );
    }

    #[test]
    fn test_display_round_trips() {
        for u in [
            Ucred { pid: 0, uid: 0, socket: String::new() },
            Ucred { pid: 100, uid: 1000, socket: "/run/fdemanagerd.socket".into() },
            Ucred { pid: u32::MAX, uid: u32::MAX - 1, socket: "/tmp/a b".into() },
        ] {
            assert_eq!(parse_ucred(&u.to_string()).unwrap(), u);
        }
    }

    #[tokio::test]
    async fn test_accept_conn_remote_addr() {
        let dir = tempfile::tempdir().unwrap();
        let l = listener(&dir, FakeResolver::ok(100, 42));
        let sock = dir.path().join("sock");

        let client = tokio::spawn(async move { UnixStream::connect(sock).await.unwrap() });
        let conn = l.accept().await.unwrap();
        let _client = client.await.unwrap();

        let u = conn.info().ucred().unwrap();
        assert_eq!(u.pid, 100);
        assert_eq!(u.uid, 42);
        assert_eq!(u.socket, l.socket());
        assert!(conn.remote_addr().starts_with("pid=100;uid=42;"));
    }

    #[tokio::test]
    async fn test_resolver_error_gives_no_identity() {
        let dir = tempfile::tempdir().unwrap();
        let l = listener(&dir, FakeResolver::failing());
        let sock = dir.path().join("sock");

        let client = tokio::spawn(async move { UnixStream::connect(sock).await.unwrap() });
        let conn = l.accept().await.unwrap();
        let _client = client.await.unwrap();

        assert!(conn.remote_addr().starts_with("pid=;uid=;"));
        assert_eq!(conn.info().ucred(), Err(UcredError::NoIdentity));
    }

    #[tokio::test]
    async fn test_unset_credentials_give_no_identity() {
        let dir = tempfile::tempdir().unwrap();
        let l = listener(&dir, FakeResolver::ok(0, 1000));
        let sock = dir.path().join("sock");

        let client = tokio::spawn(async move { UnixStream::connect(sock).await.unwrap() });
        let conn = l.accept().await.unwrap();
        let _client = client.await.unwrap();

        assert_eq!(conn.info().ucred(), Err(UcredError::NoIdentity));
    }

    #[tokio::test]
    async fn test_kernel_peer_cred() {
        let dir = tempfile::tempdir().unwrap();
        let l = listener(&dir, Arc::new(KernelPeerCred));
        let sock = dir.path().join("sock");

        let client = tokio::spawn(async move { UnixStream::connect(sock).await.unwrap() });
        let conn = l.accept().await.unwrap();
        let _client = client.await.unwrap();

        let u = conn.info().ucred().unwrap();
        assert_eq!(u.pid, std::process::id());
        assert_eq!(u.uid, nix::unistd::getuid().as_raw());
    }

    #[tokio::test]
    async fn test_distinct_connection_ids() {
        let dir = tempfile::tempdir().unwrap();
        let l = listener(&dir, FakeResolver::ok(100, 42));
        let sock = dir.path().join("sock");

        let a = UnixStream::connect(&sock).await.unwrap();
        let b = UnixStream::connect(&sock).await.unwrap();
        let first = l.accept().await.unwrap();
        let second = l.accept().await.unwrap();
        drop((a, b));

        assert_ne!(first.info().id(), second.info().id());
        assert_eq!(first.info().ucred(), second.info().ucred());
    }

    #[tokio::test]
    async fn test_accept_after_close() {
        let dir = tempfile::tempdir().unwrap();
        let l = listener(&dir, FakeResolver::ok(100, 42));
        l.close();
        let err = l.accept().await.unwrap_err();
        assert_eq!(err.to_string(), "use of closed listener");
    }

    #[tokio::test]
    async fn test_close_wakes_pending_accept() {
        let dir = tempfile::tempdir().unwrap();
        let l = Arc::new(listener(&dir, FakeResolver::ok(100, 42)));

        let pending = {
            let l = Arc::clone(&l);
            tokio::spawn(async move { l.accept().await })
        };
        tokio::task::yield_now().await;
        l.close();
        assert!(pending.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_idempotent_close() {
        let dir = tempfile::tempdir().unwrap();
        let l = listener(&dir, FakeResolver::ok(100, 42));
        l.close();
        l.close();
        assert!(l.is_closed());
    }
}
