//! The daemon: API socket, request gateway and lifecycle around the overlord
//!
//! - `ucrednet`: listener stamping peer credentials on every connection
//! - `activation`: socket handoff from the service manager, or a fresh bind
//! - `command`, `access`, `response`: routing, access checks and the JSON envelope
//! - `server`: HTTP/1.1 serving and connection tracking
//! - `client`: thin client for the socket

pub mod access;
pub mod activation;
pub mod api;
pub mod client;
pub mod command;
pub mod config;
pub mod response;
pub mod server;
pub mod ucrednet;

pub use access::{AccessPolicy, OpenAccess, PolicyFn, RootAccess};
pub use activation::Activation;
pub use client::DaemonClient;
pub use command::{Command, Request, Route, ALLOW_INTERACTION_HEADER};
pub use config::DaemonConfig;
pub use response::{async_response, sync_response, ApiError, Response, ResponseType};
pub use server::{ConnState, ConnTracker};
pub use ucrednet::{
    parse_ucred, ConnectionInfo, KernelPeerCred, PeerCred, PeerCredResolver, Ucred, UcredError,
};

use crate::overlord::{
    Overlord, OverlordError, RestartHandler, RestartKind, StandbyOpinion, StandbyOpinions,
};
use crate::paths::Paths;
use crate::state::State;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use ucrednet::UcrednetListener;

/// Exit status telling the service manager the daemon stopped to wait for
/// socket activation
pub const SOCKET_RESTART_EXIT_CODE: i32 = 42;

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error(transparent)]
    Overlord(#[from] OverlordError),

    #[error("cannot listen on {path:?}: {source}")]
    Listen {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("daemon already started")]
    AlreadyStarted,

    #[error("cannot serve API: {0}")]
    Serve(#[source] io::Error),

    #[error("daemon stop requested to wait for socket activation")]
    RestartSocket,
}

/// Restart requests and the dying state
#[derive(Debug, Default)]
struct LifecycleSignal {
    restart_socket: AtomicBool,
    socket_activated: AtomicBool,
    dying: CancellationToken,
}

impl RestartHandler for LifecycleSignal {
    fn handle_restart(&self, kind: RestartKind) {
        if kind != RestartKind::Socket {
            panic!("unexpected restart type: {kind}");
        }
        self.restart_socket.store(true, Ordering::SeqCst);
        self.dying.cancel();
    }
}

impl StandbyOpinion for LifecycleSignal {
    fn can_standby(&self) -> bool {
        self.socket_activated.load(Ordering::SeqCst)
    }
}

struct Serving {
    listener: Arc<UcrednetListener>,
    shutdown: CancellationToken,
    accept: JoinHandle<io::Result<()>>,
    standby: Arc<StandbyOpinions>,
}

struct Inner {
    config: DaemonConfig,
    paths: Paths,
    overlord: Arc<Overlord>,
    commands: Vec<Arc<Command>>,
    signal: Arc<LifecycleSignal>,
    tracker: Arc<ConnTracker>,
    serving: Mutex<Option<Serving>>,
}

#[derive(Clone)]
pub struct Daemon {
    inner: Arc<Inner>,
}

impl Daemon {
    /// Daemon serving the default routes
    pub fn new(config: DaemonConfig) -> Result<Self, DaemonError> {
        Self::with_commands(config, api::default_commands())
    }

    /// Daemon serving exactly `commands`, matched in order
    pub fn with_commands(
        config: DaemonConfig,
        commands: Vec<Command>,
    ) -> Result<Self, DaemonError> {
        let paths = config.paths();
        let signal = Arc::new(LifecycleSignal::default());
        let handler: Arc<dyn RestartHandler> = signal.clone();
        let overlord = Overlord::new(&paths, config.timings, Some(handler))?;

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                paths,
                overlord: Arc::new(overlord),
                commands: commands.into_iter().map(Arc::new).collect(),
                signal,
                tracker: Arc::new(ConnTracker::new()),
                serving: Mutex::new(None),
            }),
        })
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.inner.config
    }

    pub fn paths(&self) -> &Paths {
        &self.inner.paths
    }

    pub fn overlord(&self) -> &Arc<Overlord> {
        &self.inner.overlord
    }

    pub fn state(&self) -> &State {
        self.inner.overlord.state()
    }

    /// Connections currently new or serving a request
    pub fn connections(&self) -> &Arc<ConnTracker> {
        &self.inner.tracker
    }

    pub(crate) fn command_for(&self, path: &str) -> Option<Arc<Command>> {
        self.inner.commands.iter().find(|cmd| cmd.matches(path)).cloned()
    }

    /// Whether the daemon itself is fine with standing by: only when the
    /// service manager can start it again through the socket
    pub fn can_standby(&self) -> bool {
        self.inner.signal.can_standby()
    }

    /// Start serving on the socket handed over by the service manager, or a
    /// freshly bound one. Must be called from within a tokio runtime.
    pub fn start(&self) -> Result<(), DaemonError> {
        self.start_with(Activation::from_env(), Arc::new(KernelPeerCred))
    }

    pub fn start_with(
        &self,
        activation: Activation,
        resolver: Arc<dyn PeerCredResolver>,
    ) -> Result<(), DaemonError> {
        let mut serving = self.inner.serving.lock().unwrap_or_else(PoisonError::into_inner);
        if serving.is_some() {
            return Err(DaemonError::AlreadyStarted);
        }

        let socket = &self.inner.paths.socket;
        let listen_err = |source| DaemonError::Listen {
            path: socket.clone(),
            source,
        };
        let (listener, activated) = activation.listen(socket).map_err(listen_err)?;
        listener.set_nonblocking(true).map_err(listen_err)?;
        let listener = tokio::net::UnixListener::from_std(listener).map_err(listen_err)?;
        self.inner.signal.socket_activated.store(activated, Ordering::SeqCst);
        let listener = Arc::new(UcrednetListener::new(listener, resolver));

        let overlord = &self.inner.overlord;
        let mut standby = StandbyOpinions::new(
            overlord.state().clone(),
            Arc::clone(overlord.restart_manager()),
            self.inner.config.standby_wait,
            self.inner.config.standby_max_wait,
        );
        standby.add_opinion(self.inner.tracker.clone());
        standby.add_opinion(overlord.clone());
        standby.add_opinion(self.inner.signal.clone());
        let standby = Arc::new(standby);
        standby.start();

        if let Err(err) = overlord.run_loop() {
            standby.stop();
            listener.close();
            return Err(err.into());
        }

        let shutdown = CancellationToken::new();
        let accept = tokio::spawn(server::accept_loop(
            self.clone(),
            Arc::clone(&listener),
            shutdown.clone(),
        ));
        info!(socket = %socket.display(), activated, "Started daemon");

        *serving = Some(Serving {
            listener,
            shutdown,
            accept,
            standby,
        });
        Ok(())
    }

    /// Resolves once something asked the daemon to stop
    pub async fn dying(&self) {
        self.inner.signal.dying.cancelled().await
    }

    pub fn is_dying(&self) -> bool {
        self.inner.signal.dying.is_cancelled()
    }

    pub(crate) fn mark_dying(&self) {
        self.inner.signal.dying.cancel();
    }

    /// Stop serving and stop the overlord.
    ///
    /// Returns [`DaemonError::RestartSocket`] when the daemon stopped to wait
    /// for socket activation.
    pub async fn stop(&self) -> Result<(), DaemonError> {
        self.mark_dying();
        let serving = self
            .inner
            .serving
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let mut serve_err = None;
        if let Some(Serving {
            listener,
            shutdown,
            mut accept,
            standby,
        }) = serving
        {
            listener.close();
            let coordinator = Arc::clone(&standby);
            if tokio::task::spawn_blocking(move || coordinator.stop()).await.is_err() {
                warn!("standby coordinator did not stop cleanly");
            }
            shutdown.cancel();

            let timeout = self.inner.config.shutdown_timeout;
            match tokio::time::timeout(timeout, &mut accept).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(err))) => serve_err = Some(err),
                Ok(Err(err)) => error!(error = %err, "API server task failed"),
                Err(_) => {
                    warn!(
                        ?timeout,
                        "cannot gracefully shut down the API server, closing connections"
                    );
                    accept.abort();
                }
            }

            if self.inner.signal.restart_socket.load(Ordering::SeqCst) && !standby.can_standby() {
                info!("Standby no longer possible, stopping normally");
                self.inner.signal.restart_socket.store(false, Ordering::SeqCst);
                self.inner.overlord.restart_manager().clear();
            }
        }

        let overlord = Arc::clone(&self.inner.overlord);
        let mut restart_socket = false;
        match tokio::task::spawn_blocking(move || overlord.stop()).await {
            Ok(Ok(())) => {}
            Ok(Err(OverlordError::RestartSocket)) => restart_socket = true,
            Ok(Err(err)) => return Err(err.into()),
            Err(err) => error!(error = %err, "overlord stop failed"),
        }

        if let Some(err) = serve_err {
            return Err(DaemonError::Serve(err));
        }
        if restart_socket {
            return Err(DaemonError::RestartSocket);
        }
        Ok(())
    }
}

impl fmt::Debug for Daemon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Daemon")
            .field("socket", &self.inner.paths.socket)
            .field("commands", &self.inner.commands.len())
            .finish_non_exhaustive()
    }
}
