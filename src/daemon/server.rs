//! HTTP/1.1 serving over the peer-credential listener
//!
//! One task per connection, handlers on the blocking pool. Connections are
//! tracked while they are new or busy so the daemon knows when it is idle.

use crate::daemon::command::Request;
use crate::daemon::response::{ApiError, Response};
use crate::daemon::ucrednet::{ConnectionInfo, UcrednetListener};
use crate::daemon::Daemon;
use crate::overlord::StandbyOpinion;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::collections::HashSet;
use std::convert::Infallible;
use std::io;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tokio::net::UnixStream;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

// ============================================================================
// Connection tracking
// ============================================================================

/// Lifecycle of a served connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    New,
    Active,
    Idle,
    Hijacked,
    Closed,
}

/// Connections that are new or serving a request
#[derive(Debug, Default)]
pub struct ConnTracker {
    conns: Mutex<HashSet<u64>>,
}

impl ConnTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&self, id: u64, state: ConnState) {
        let mut conns = self.conns.lock().unwrap_or_else(PoisonError::into_inner);
        match state {
            ConnState::New | ConnState::Active => {
                conns.insert(id);
            }
            ConnState::Idle | ConnState::Hijacked | ConnState::Closed => {
                conns.remove(&id);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.conns.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl StandbyOpinion for ConnTracker {
    fn can_standby(&self) -> bool {
        self.is_empty()
    }
}

// ============================================================================
// Accept loop
// ============================================================================

/// Serve connections until the listener is closed, then wait for `shutdown`
/// and for the remaining connections to finish.
///
/// A failing accept puts the daemon into the dying state and is returned.
pub async fn accept_loop(
    daemon: Daemon,
    listener: Arc<UcrednetListener>,
    shutdown: CancellationToken,
) -> io::Result<()> {
    let mut conns = JoinSet::new();

    let result = loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(conn) => {
                    let (stream, info) = conn.into_parts();
                    conns.spawn(serve_connection(daemon.clone(), stream, info, shutdown.clone()));
                }
                Err(_) if listener.is_closed() => break Ok(()),
                Err(err) => {
                    error!(error = %err, "cannot accept connection");
                    daemon.mark_dying();
                    break Err(err);
                }
            },
            Some(_) = conns.join_next(), if !conns.is_empty() => {}
        }
    };

    shutdown.cancelled().await;
    while conns.join_next().await.is_some() {}
    result
}

async fn serve_connection(
    daemon: Daemon,
    stream: UnixStream,
    info: Arc<ConnectionInfo>,
    shutdown: CancellationToken,
) {
    let tracker = Arc::clone(daemon.connections());
    tracker.track(info.id(), ConnState::New);

    let service = {
        let daemon = daemon.clone();
        let info = Arc::clone(&info);
        service_fn(move |req: hyper::Request<Incoming>| {
            let daemon = daemon.clone();
            let info = Arc::clone(&info);
            async move { Ok::<_, Infallible>(handle_request(daemon, info, req).await) }
        })
    };
    let conn = http1::Builder::new().serve_connection(TokioIo::new(stream), service);
    tokio::pin!(conn);

    let result = tokio::select! {
        res = conn.as_mut() => res,
        _ = shutdown.cancelled() => {
            conn.as_mut().graceful_shutdown();
            conn.await
        }
    };
    if let Err(err) = result {
        debug!(remote = info.remote_addr(), error = %err, "connection ended with error");
    }

    tracker.track(info.id(), ConnState::Closed);
}

// ============================================================================
// Requests
// ============================================================================

async fn handle_request(
    daemon: Daemon,
    info: Arc<ConnectionInfo>,
    req: hyper::Request<Incoming>,
) -> hyper::Response<Full<Bytes>> {
    let tracker = Arc::clone(daemon.connections());
    tracker.track(info.id(), ConnState::Active);
    let started = Instant::now();

    let (parts, body) = req.into_parts();
    let url = parts.uri.to_string();
    let method = parts.method.clone();

    let resp = match body.collect().await {
        Ok(body) => {
            let request = Request {
                method: parts.method,
                path: parts.uri.path().to_string(),
                query: parts.uri.query().map(str::to_string),
                headers: parts.headers,
                body: body.to_bytes(),
                connection: Some(Arc::clone(&info)),
            };
            dispatch(daemon, request).await
        }
        Err(err) => ApiError::bad_request(format!("cannot read request body: {err}")).into(),
    };

    if !url.contains("/changes/") {
        debug!(
            remote = info.remote_addr(),
            method = %method,
            url = %url,
            elapsed = ?started.elapsed(),
            status = resp.status.as_u16(),
            "request"
        );
    }

    tracker.track(info.id(), ConnState::Idle);
    resp.into_http()
}

/// Run the first command matching the request's path
pub(crate) async fn dispatch(daemon: Daemon, request: Request) -> Response {
    let Some(cmd) = daemon.command_for(&request.path) else {
        return ApiError::not_found("not found").into();
    };
    match tokio::task::spawn_blocking(move || cmd.run(&daemon, &request)).await {
        Ok(resp) => resp,
        Err(err) => {
            error!(error = %err, "request handler failed");
            ApiError::internal("internal error").into()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracker_states() {
        let tracker = ConnTracker::new();
        tracker.track(1, ConnState::New);
        tracker.track(2, ConnState::Active);
        assert_eq!(tracker.len(), 2);
        assert!(!tracker.can_standby());

        tracker.track(1, ConnState::Idle);
        tracker.track(2, ConnState::Hijacked);
        assert!(tracker.is_empty());
        assert!(tracker.can_standby());
    }

    #[test]
    fn test_tracker_closed_twice() {
        let tracker = ConnTracker::new();
        tracker.track(7, ConnState::Active);
        tracker.track(7, ConnState::Closed);
        tracker.track(7, ConnState::Closed);
        assert!(tracker.is_empty());
    }
}
