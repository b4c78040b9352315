//! Unprivileged client transport.
//!
//! `InputClient` connects to the daemon socket, performs the version
//! handshake and then exposes synchronous capture and injection commands.
//! A background reader thread decodes incoming frames and forwards them as
//! `ClientEvent`s over a bounded std mpsc channel. The reader never waits on
//! that channel; events that do not fit are dropped.
//!
//! Capture requests are routed through a `SubscriptionCoordinator`, so each
//! feature can subscribe independently while the socket only carries changes
//! of the aggregate capture mode. The intent is recorded even when the
//! daemon is unreachable; every successful (re)connect replays the last
//! resolution and the current aggregate.
//!
//! State machine: `Disconnected -> Connecting -> Handshaking -> Connected`.
//! Any I/O failure while connected drops back to `Disconnected`; with
//! `auto_reconnect` the reader thread then retries with exponential backoff.

mod error;
mod subscription;

pub use error::ClientError;
pub use subscription::{CaptureCommand, CaptureCommandKind, SubscriptionCoordinator};

use std::io::{self, ErrorKind, Read, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use crate::config::{DEFAULT_FALLBACK_SOCKET, DEFAULT_PRIMARY_SOCKET};
use crate::protocol::{FrameBuffer, InputEvent, Message, PROTOCOL_VERSION};

const READ_CHUNK: usize = 4096;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Transport settings.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Socket paths tried in order (primary first, then fallback).
    pub socket_paths: Vec<PathBuf>,
    /// Reconnect and replay automatically after an unexpected disconnect.
    pub auto_reconnect: bool,
    pub handshake_timeout: Duration,
    pub reconnect_initial_delay: Duration,
    pub reconnect_max_delay: Duration,
    /// Capacity of the `ClientEvent` channel.
    pub event_queue: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            socket_paths: vec![
                PathBuf::from(DEFAULT_PRIMARY_SOCKET),
                PathBuf::from(DEFAULT_FALLBACK_SOCKET),
            ],
            auto_reconnect: true,
            handshake_timeout: Duration::from_secs(5),
            reconnect_initial_delay: Duration::from_millis(250),
            reconnect_max_delay: Duration::from_secs(10),
            event_queue: 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Handshaking,
    Connected,
}

/// Notifications delivered by the reader thread.
///
/// Reconnects are reported only through `StateChanged`; `Error` carries
/// daemon error frames and terminal connection loss.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Input(InputEvent),
    Error(String),
    StateChanged(ConnectionState),
}

/// One synthetic kernel event for `simulate_events`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimulatedEvent {
    pub event_type: u16,
    pub code: u16,
    pub value: i32,
}

/// Returns `true` if any of `paths` exists as a filesystem entry.
pub fn is_daemon_available<P: AsRef<Path>>(paths: &[P]) -> bool {
    paths.iter().any(|p| p.as_ref().exists())
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Synchronous handle to the privileged input daemon.
pub struct InputClient {
    shared: Arc<Shared>,
}

struct Shared {
    options: ClientOptions,
    coordinator: Mutex<SubscriptionCoordinator>,
    resolution: Mutex<Option<(i32, i32)>>,
    link: Mutex<Link>,
    events: mpsc::SyncSender<ClientEvent>,
    /// Bumped by `disconnect()`; reconnect loops from older epochs give up.
    epoch: AtomicU64,
}

struct Link {
    state: ConnectionState,
    stream: Option<UnixStream>,
    /// Identifies the reader thread that owns the current stream.
    generation: u64,
}

impl InputClient {
    /// Creates a disconnected client and the receiver for its events.
    pub fn new(options: ClientOptions) -> (Self, mpsc::Receiver<ClientEvent>) {
        let (events, rx) = mpsc::sync_channel(options.event_queue.max(1));
        let shared = Arc::new(Shared {
            options,
            coordinator: Mutex::new(SubscriptionCoordinator::new()),
            resolution: Mutex::new(None),
            link: Mutex::new(Link {
                state: ConnectionState::Disconnected,
                stream: None,
                generation: 0,
            }),
            events,
            epoch: AtomicU64::new(0),
        });
        (Self { shared }, rx)
    }

    /// Connects and handshakes, then replays recorded intent.
    ///
    /// Returns immediately if already connected.
    pub fn connect(&self) -> Result<(), ClientError> {
        if self.state() == ConnectionState::Connected {
            return Ok(());
        }
        let (stream, buffer) = self.shared.establish()?;
        Shared::install(&self.shared, stream, buffer)
    }

    /// Closes the connection and cancels any pending reconnect.
    pub fn disconnect(&self) {
        self.shared.epoch.fetch_add(1, Ordering::SeqCst);
        let was_connected = {
            let mut link = lock(&self.shared.link);
            link.generation += 1;
            let had_stream = link.stream.take().map(|s| s.shutdown(Shutdown::Both)).is_some();
            link.state = ConnectionState::Disconnected;
            had_stream
        };
        if was_connected {
            log::info!("client: disconnected");
            self.shared
                .notify(ClientEvent::StateChanged(ConnectionState::Disconnected));
        }
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.shared.link).state
    }

    /// Registers capture intent for `name` and sends the resulting
    /// transition, if any.
    pub fn start_capture(&self, name: &str, mouse: bool, keyboard: bool) -> Result<(), ClientError> {
        let mut coordinator = lock(&self.shared.coordinator);
        let command = coordinator.set_subscription(name, mouse, keyboard);
        log::debug!("client: subscription {name:?} mouse={mouse} keyboard={keyboard} -> {command:?}");
        self.shared.send(&capture_frames(command))
    }

    /// Withdraws the capture intent registered under `name`.
    pub fn stop_capture(&self, name: &str) -> Result<(), ClientError> {
        let mut coordinator = lock(&self.shared.coordinator);
        let command = coordinator.remove_subscription(name);
        log::debug!("client: unsubscribe {name:?} -> {command:?}");
        self.shared.send(&capture_frames(command))
    }

    /// Sets the virtual pointer geometry. Remembered for replay.
    pub fn configure_resolution(&self, width: i32, height: i32) -> Result<(), ClientError> {
        let mut resolution = lock(&self.shared.resolution);
        *resolution = Some((width, height));
        self.shared
            .send(&Message::ConfigureResolution { width, height }.to_bytes())
    }

    pub fn simulate_event(&self, event_type: u16, code: u16, value: i32) -> Result<(), ClientError> {
        self.simulate_events(&[SimulatedEvent {
            event_type,
            code,
            value,
        }])
    }

    /// Sends all events in a single write so no other frame lands in between.
    pub fn simulate_events(&self, events: &[SimulatedEvent]) -> Result<(), ClientError> {
        let mut frames = Vec::with_capacity(events.len() * 9);
        for ev in events {
            Message::SimulateEvent {
                event_type: ev.event_type,
                code: ev.code,
                value: ev.value,
            }
            .encode_into(&mut frames);
        }
        self.shared.send(&frames)
    }

    /// Current aggregate capture intent, if any feature is subscribed.
    pub fn capture_intent(&self) -> Option<(bool, bool)> {
        lock(&self.shared.coordinator).aggregate_wants()
    }
}

impl Drop for InputClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}

// ---------------------------------------------------------------------------
// Connection management
// ---------------------------------------------------------------------------

impl Shared {
    fn notify(&self, event: ClientEvent) {
        match self.events.try_send(event) {
            Ok(()) | Err(mpsc::TrySendError::Disconnected(_)) => {}
            Err(mpsc::TrySendError::Full(event)) => {
                log::debug!("client: event queue full, dropping {event:?}");
            }
        }
    }

    fn set_state(&self, state: ConnectionState) {
        lock(&self.link).state = state;
        self.notify(ClientEvent::StateChanged(state));
    }

    /// Opens a socket and completes the handshake.
    fn establish(&self) -> Result<(UnixStream, FrameBuffer), ClientError> {
        self.set_state(ConnectionState::Connecting);
        let result = self.open_socket().and_then(|stream| {
            self.set_state(ConnectionState::Handshaking);
            self.handshake(stream)
        });
        if result.is_err() {
            self.set_state(ConnectionState::Disconnected);
        }
        result
    }

    fn open_socket(&self) -> Result<UnixStream, ClientError> {
        let mut last_error = String::from("no socket paths configured");
        for path in &self.options.socket_paths {
            match UnixStream::connect(path) {
                Ok(stream) => {
                    log::debug!("client: connected to {}", path.display());
                    return Ok(stream);
                }
                Err(e) => {
                    log::debug!("client: {} unavailable: {e}", path.display());
                    last_error = format!("{}: {e}", path.display());
                }
            }
        }
        Err(ClientError::ConnectFailed(last_error))
    }

    fn handshake(&self, mut stream: UnixStream) -> Result<(UnixStream, FrameBuffer), ClientError> {
        stream.set_read_timeout(Some(self.options.handshake_timeout))?;
        stream
            .write_all(&Message::Handshake {
                version: PROTOCOL_VERSION,
            }.to_bytes())
            .map_err(|e| ClientError::HandshakeFailed(format!("send failed: {e}")))?;

        let mut buffer = FrameBuffer::new();
        let mut chunk = [0u8; READ_CHUNK];
        let reply = loop {
            if let Some(message) = buffer.next_message()? {
                break message;
            }
            match stream.read(&mut chunk) {
                Ok(0) => {
                    return Err(ClientError::HandshakeFailed(
                        "daemon closed the connection".into(),
                    ))
                }
                Ok(n) => buffer.extend(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    return Err(ClientError::Timeout)
                }
                Err(e) => return Err(ClientError::HandshakeFailed(e.to_string())),
            }
        };

        match reply {
            Message::Handshake { version } if version == PROTOCOL_VERSION => {}
            Message::Handshake { version } => {
                return Err(ClientError::ProtocolMismatch(format!(
                    "client speaks version {PROTOCOL_VERSION}, daemon speaks {version}"
                )))
            }
            Message::Error { message } => return Err(ClientError::ProtocolMismatch(message)),
            other => {
                return Err(ClientError::HandshakeFailed(format!(
                    "unexpected {:?} frame",
                    other.opcode()
                )))
            }
        }

        stream.set_read_timeout(None)?;
        log::info!("client: handshake complete (protocol v{PROTOCOL_VERSION})");
        Ok((stream, buffer))
    }

    /// Publishes a handshaken stream, replays intent and starts the reader.
    fn install(this: &Arc<Self>, stream: UnixStream, buffer: FrameBuffer) -> Result<(), ClientError> {
        let mut coordinator = lock(&this.coordinator);
        let resolution = *lock(&this.resolution);
        let mut link = lock(&this.link);

        if link.state == ConnectionState::Connected {
            // Lost a race with another connect; keep the existing link.
            let _ = stream.shutdown(Shutdown::Both);
            return Ok(());
        }

        let mut replay = Vec::new();
        if let Some((width, height)) = resolution {
            Message::ConfigureResolution { width, height }.encode_into(&mut replay);
        }
        let command = coordinator.reset_transport_state_and_get_command();
        replay.extend_from_slice(&capture_frames(command));

        let reader = stream.try_clone()?;
        let mut writer = stream;
        if !replay.is_empty() {
            if let Err(e) = writer.write_all(&replay) {
                link.state = ConnectionState::Disconnected;
                drop(link);
                this.notify(ClientEvent::StateChanged(ConnectionState::Disconnected));
                return Err(ClientError::Io(e));
            }
            log::debug!(
                "client: replayed resolution={resolution:?} capture={command:?}"
            );
        }

        link.generation += 1;
        link.stream = Some(writer);
        link.state = ConnectionState::Connected;
        let generation = link.generation;
        drop(link);
        drop(coordinator);

        this.notify(ClientEvent::StateChanged(ConnectionState::Connected));

        let shared = Arc::clone(this);
        thread::Builder::new()
            .name("inputbridge-reader".into())
            .spawn(move || read_loop(shared, reader, buffer, generation))?;
        Ok(())
    }

    /// Writes pre-encoded frames under the writer lock.
    fn send(&self, frames: &[u8]) -> Result<(), ClientError> {
        let mut link = lock(&self.link);
        if link.state != ConnectionState::Connected {
            return Err(ClientError::ConnectFailed("not connected to daemon".into()));
        }
        let Some(stream) = link.stream.as_mut() else {
            return Err(ClientError::ConnectFailed("not connected to daemon".into()));
        };
        if frames.is_empty() {
            return Ok(());
        }
        if let Err(e) = stream.write_all(frames) {
            log::warn!("client: write failed: {e}");
            // Wake the reader so it runs the disconnect path.
            let _ = stream.shutdown(Shutdown::Both);
            return Err(ClientError::Io(e));
        }
        Ok(())
    }

    fn dispatch(&self, message: Message) {
        match message {
            Message::InputEvent(ev) => self.notify(ClientEvent::Input(ev)),
            Message::Error { message } => {
                log::warn!("client: daemon error: {message}");
                self.notify(ClientEvent::Error(message));
            }
            other => log::debug!("client: ignoring {:?} frame", other.opcode()),
        }
    }

    fn connection_lost(this: &Arc<Self>, generation: u64, reason: &str) {
        {
            let mut link = lock(&this.link);
            if link.generation != generation {
                // Superseded by disconnect() or a newer connection.
                return;
            }
            link.stream = None;
            link.state = ConnectionState::Disconnected;
        }
        this.notify(ClientEvent::StateChanged(ConnectionState::Disconnected));

        if this.options.auto_reconnect {
            log::info!("client: connection lost ({reason}), reconnecting");
            Self::reconnect_loop(this);
        } else {
            log::warn!("client: connection lost ({reason})");
            this.notify(ClientEvent::Error(format!("connection to daemon lost: {reason}")));
        }
    }

    fn reconnect_loop(this: &Arc<Self>) {
        let epoch = this.epoch.load(Ordering::SeqCst);
        let mut delay = this.options.reconnect_initial_delay;
        let mut attempt: u32 = 0;

        while this.epoch.load(Ordering::SeqCst) == epoch {
            thread::sleep(delay);
            if this.epoch.load(Ordering::SeqCst) != epoch {
                break;
            }
            if lock(&this.link).state == ConnectionState::Connected {
                // Someone called connect() in the meantime.
                return;
            }
            attempt += 1;
            match this.establish() {
                Ok((stream, buffer)) => match Self::install(this, stream, buffer) {
                    Ok(()) => {
                        log::info!("client: reconnected after {attempt} attempt(s)");
                        return;
                    }
                    Err(e) => log::warn!("client: replay after reconnect failed: {e}"),
                },
                Err(e) => log::debug!("client: reconnect attempt {attempt} failed: {e}"),
            }
            delay = (delay * 2).min(this.options.reconnect_max_delay);
        }
        log::debug!("client: reconnect cancelled");
    }
}

fn read_loop(shared: Arc<Shared>, mut stream: UnixStream, mut buffer: FrameBuffer, generation: u64) {
    let mut chunk = [0u8; READ_CHUNK];
    let reason = loop {
        loop {
            match buffer.next_message() {
                Ok(Some(message)) => shared.dispatch(message),
                Ok(None) => break,
                Err(e) => {
                    let _ = stream.shutdown(Shutdown::Both);
                    Shared::connection_lost(&shared, generation, &e.to_string());
                    return;
                }
            }
        }
        match stream.read(&mut chunk) {
            Ok(0) => break "daemon closed the connection".to_owned(),
            Ok(n) => buffer.extend(&chunk[..n]),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => break e.to_string(),
        }
    };
    Shared::connection_lost(&shared, generation, &reason);
}

fn capture_frames(command: CaptureCommand) -> Vec<u8> {
    match command.kind {
        CaptureCommandKind::None => Vec::new(),
        CaptureCommandKind::Start => Message::StartCapture {
            mouse: command.mouse,
            keyboard: command.keyboard,
        }
        .to_bytes(),
        CaptureCommandKind::Stop => Message::StopCapture.to_bytes(),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
