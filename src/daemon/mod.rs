//! Privileged side: listener, admission and per-connection sessions.
//!
//! `Daemon::serve` accepts connections, hands each one to its own task that
//! first runs the admission pipeline and, if admitted, a session. Rejected
//! connections are dropped without a reply. Cancellation is a
//! `watch::Receiver<bool>`: flipping it to `true` stops accepting and makes
//! every live session close its socket.

pub mod admission;
pub mod audit;
pub mod auth_cache;
pub mod identity;
pub mod policy;
pub mod rate_limit;
pub mod session;
pub mod socket;

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::UnixListener;
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::config::{ConfigError, DaemonConfig};

use self::admission::AdmissionPipeline;
use self::session::{run_session, SessionResources};
use self::socket::BoundSocket;

/// Pause after a failed `accept` so a persistent error cannot spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// How long shutdown waits for sessions to close before aborting them.
const SESSION_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Identity of an admitted peer. Only the admission pipeline creates one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionIdentity {
    pub uid: u32,
    pub pid: i32,
}

impl fmt::Display for ConnectionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "uid={} pid={}", self.uid, self.pid)
    }
}

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("could not bind {}: {source}", path.display())]
    Bind {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

pub struct Daemon {
    config: DaemonConfig,
    pipeline: Arc<AdmissionPipeline>,
    resources: SessionResources,
}

impl Daemon {
    pub fn new(config: DaemonConfig, pipeline: AdmissionPipeline, resources: SessionResources) -> Self {
        Self {
            config,
            pipeline: Arc::new(pipeline),
            resources,
        }
    }

    /// Wires up the production collaborators: `SO_PEERCRED` identity,
    /// `pkcheck`, evdev capture and a uinput device.
    #[cfg(target_os = "linux")]
    pub fn from_config(config: DaemonConfig) -> Result<Self, DaemonError> {
        use crate::clock::{Clock, SystemClock};
        use crate::platform::linux;

        use self::audit::{AuditSink, LogAuditSink};
        use self::auth_cache::AuthorizationCache;
        use self::identity::SystemIdentityProvider;
        use self::policy::PkcheckPolicyClient;
        use self::rate_limit::RateLimiter;
        use self::session::CaptureLease;

        config.validate()?;

        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let audit: Arc<dyn AuditSink> = Arc::new(LogAuditSink);

        let pipeline = AdmissionPipeline::new(
            Arc::new(SystemIdentityProvider),
            Arc::new(PkcheckPolicyClient::new(config.security.polkit_action.clone())),
            Arc::new(RateLimiter::new(&config.rate_limit, clock.clone())),
            Arc::new(AuthorizationCache::new(config.security.auth_cache_ttl(), clock)),
            audit.clone(),
            config.security.group.clone(),
            config.security.policy_timeout(),
        );

        let resources = SessionResources {
            device: linux::create_device_sink(
                config.session.default_width,
                config.session.default_height,
            ),
            capture_factory: linux::create_capture_factory(),
            capture_lease: Arc::new(CaptureLease::new()),
            audit,
            config: config.session.clone(),
        };

        Ok(Self::new(config, pipeline, resources))
    }

    /// Binds the configured socket and serves until `shutdown` fires. The
    /// socket file is removed on return.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<(), DaemonError> {
        let socket = BoundSocket::bind(&self.config.socket, &self.config.security.group)?;
        log::info!("daemon: ready on {}", socket.path().display());
        self.serve(socket.listener(), shutdown).await
    }

    /// Accept loop over an already bound listener.
    pub async fn serve(
        &self,
        listener: &UnixListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), DaemonError> {
        let mut sessions = JoinSet::new();
        let mut next_id: u64 = 0;

        if *shutdown.borrow_and_update() {
            return Ok(());
        }

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, _addr)) => {
                        self.pipeline.rate_limiter().prune();
                        next_id += 1;
                        let id = next_id;
                        let pipeline = Arc::clone(&self.pipeline);
                        let resources = self.resources.clone();
                        let session_shutdown = shutdown.clone();
                        sessions.spawn(async move {
                            match pipeline.admit(&stream).await {
                                Ok(identity) => {
                                    run_session(id, identity, stream, resources, session_shutdown).await;
                                }
                                Err(reason) => {
                                    log::info!("listener: connection {id} rejected ({reason})");
                                }
                            }
                        });
                    }
                    Err(e) => {
                        log::warn!("listener: accept failed: {e}");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
                Some(finished) = sessions.join_next(), if !sessions.is_empty() => {
                    log_task_result(finished);
                }
            }
        }

        log::info!(
            "listener: stopped accepting, waiting for {} connection(s)",
            sessions.len()
        );
        let drain = async {
            while let Some(finished) = sessions.join_next().await {
                log_task_result(finished);
            }
        };
        if tokio::time::timeout(SESSION_DRAIN_TIMEOUT, drain).await.is_err() {
            log::warn!(
                "listener: {} connection(s) still open after {:?}, aborting",
                sessions.len(),
                SESSION_DRAIN_TIMEOUT
            );
            sessions.shutdown().await;
        }
        log::info!("listener: all connections closed");
        Ok(())
    }
}

fn log_task_result(result: Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        if e.is_panic() {
            log::error!("listener: connection task panicked: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ClientEvent, ClientError, ClientOptions, ConnectionState, InputClient};
    use crate::clock::ManualClock;
    use crate::config::SessionConfig;
    use crate::daemon::auth_cache::AuthorizationCache;
    use crate::daemon::rate_limit::RateLimiter;
    use crate::daemon::session::CaptureLease;
    use crate::platform::RawInputEvent;
    use crate::protocol::InputEvent;
    use crate::testing::{
        wait_until, AuditEvent, CaptureHub, PolicyBehavior, RecordingAuditSink, RecordingDevice,
        ScriptedPolicy, StaticIdentity,
    };
    use std::path::Path;
    use std::time::UNIX_EPOCH;
    use tempfile::TempDir;

    struct Running {
        _dir: TempDir,
        path: PathBuf,
        hub: Arc<CaptureHub>,
        audit: Arc<RecordingAuditSink>,
        shutdown_tx: watch::Sender<bool>,
        task: tokio::task::JoinHandle<Result<(), DaemonError>>,
    }

    fn start_daemon(identity: StaticIdentity) -> Running {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("inputbridge.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let clock = Arc::new(ManualClock::new());
        let audit = Arc::new(RecordingAuditSink::default());
        let hub = Arc::new(CaptureHub::default());
        let config = DaemonConfig::default();

        let pipeline = AdmissionPipeline::new(
            Arc::new(identity),
            Arc::new(ScriptedPolicy::new(PolicyBehavior::Allow)),
            Arc::new(RateLimiter::new(&config.rate_limit, clock.clone())),
            Arc::new(AuthorizationCache::new(Duration::from_secs(30), clock)),
            audit.clone(),
            "inputbridge",
            Duration::from_secs(1),
        );
        let resources = SessionResources {
            device: Arc::new(RecordingDevice::default()),
            capture_factory: hub.factory(),
            capture_lease: Arc::new(CaptureLease::new()),
            audit: audit.clone(),
            config: SessionConfig::default(),
        };
        let daemon = Daemon::new(config, pipeline, resources);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(async move { daemon.serve(&listener, shutdown_rx).await });

        Running {
            _dir: dir,
            path,
            hub,
            audit,
            shutdown_tx,
            task,
        }
    }

    fn options(path: &Path) -> ClientOptions {
        ClientOptions {
            socket_paths: vec![path.to_path_buf()],
            auto_reconnect: false,
            ..ClientOptions::default()
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn captured_event_reaches_client() {
        let daemon = start_daemon(StaticIdentity::user(1000, 4242));
        let opts = options(&daemon.path);

        let (client, events) = tokio::task::spawn_blocking(move || {
            let (client, events) = InputClient::new(opts);
            client.connect().unwrap();
            client.start_capture("recorder", true, true).unwrap();
            (client, events)
        })
        .await
        .unwrap();
        assert_eq!(client.state(), ConnectionState::Connected);

        let hub = daemon.hub.clone();
        assert!(wait_until(|| hub.is_running()).await);
        hub.emit(RawInputEvent {
            event_type: 2,
            code: 0,
            value: -7,
            timestamp: UNIX_EPOCH + Duration::from_millis(42),
        });

        let received = tokio::task::spawn_blocking(move || loop {
            match events.recv_timeout(Duration::from_secs(2)) {
                Ok(ClientEvent::Input(ev)) => break Some(ev),
                Ok(_) => continue,
                Err(_) => break None,
            }
        })
        .await
        .unwrap();
        assert_eq!(
            received,
            Some(InputEvent {
                event_type: 2,
                code: 0,
                value: -7,
                timestamp_ms: 42,
            })
        );

        tokio::task::spawn_blocking(move || drop(client)).await.unwrap();
        let audit = daemon.audit.clone();
        assert!(wait_until(|| audit.count(|e| matches!(e, AuditEvent::Disconnect { .. })) == 1).await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn rejected_peer_sees_handshake_failure() {
        let daemon = start_daemon(StaticIdentity::user(0, 1));
        let opts = options(&daemon.path);

        let result = tokio::task::spawn_blocking(move || {
            let (client, _events) = InputClient::new(opts);
            client.connect()
        })
        .await
        .unwrap();
        assert!(matches!(result, Err(ClientError::HandshakeFailed(_))));
        assert!(daemon
            .audit
            .has_violation(crate::daemon::audit::RejectReason::RootRejected));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shutdown_stops_listener_and_closes_sessions() {
        let daemon = start_daemon(StaticIdentity::user(1000, 4242));
        let opts = options(&daemon.path);

        let (client, _events) = tokio::task::spawn_blocking(move || {
            let (client, events) = InputClient::new(opts);
            client.connect().unwrap();
            (client, events)
        })
        .await
        .unwrap();

        daemon.shutdown_tx.send(true).unwrap();
        let served = tokio::time::timeout(Duration::from_secs(3), daemon.task)
            .await
            .expect("listener did not stop")
            .unwrap();
        assert!(served.is_ok());
        assert_eq!(
            daemon
                .audit
                .count(|e| matches!(e, AuditEvent::Disconnect { .. })),
            1
        );

        let client_state = wait_for_state(client).await;
        assert_eq!(client_state, ConnectionState::Disconnected);
    }

    async fn wait_for_state(client: InputClient) -> ConnectionState {
        tokio::task::spawn_blocking(move || {
            for _ in 0..100 {
                if client.state() == ConnectionState::Disconnected {
                    break;
                }
                std::thread::sleep(Duration::from_millis(10));
            }
            client.state()
        })
        .await
        .unwrap()
    }

    #[test]
    fn identity_display() {
        let id = ConnectionIdentity { uid: 1000, pid: 7 };
        assert_eq!(id.to_string(), "uid=1000 pid=7");
    }
}
