//! Per-connection protocol state machine.
//!
//! A `Session` only exists for a connection the admission pipeline accepted.
//! It moves `AwaitingHandshake -> Active -> Closed`:
//!
//! - `AwaitingHandshake`: the first frame must be `Handshake` with the
//!   daemon's protocol version. Anything else gets an `Error` frame and the
//!   session closes without looking at further input.
//! - `Active`: commands are processed strictly in arrival order.
//! - `Closed`: reachable from any state; `close()` is idempotent.
//!
//! All outbound frames (command replies and captured input events) go through
//! one bounded queue drained by a dedicated writer task, so every frame is
//! written whole and never interleaves with another. Nothing on the read
//! path waits on that queue: a reply that does not fit closes the session.

use std::ops::ControlFlow;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, watch};

use super::audit::AuditSink;
use super::ConnectionIdentity;
use crate::config::SessionConfig;
use crate::platform::{
    CaptureFactory, CaptureFilter, CaptureSource, DeviceSink, EventCallback, RawInputEvent,
};
use crate::protocol::{FrameBuffer, InputEvent, Message, PROTOCOL_VERSION};

/// How long a closing session waits for queued frames to reach the socket.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

const READ_CHUNK: usize = 4096;

// ---------------------------------------------------------------------------
// Shared resources
// ---------------------------------------------------------------------------

/// Records which session currently owns live capture. At most one session
/// captures at a time; the owner may restart capture with new flags.
#[derive(Debug, Default)]
pub struct CaptureLease {
    owner: Mutex<Option<u64>>,
}

impl CaptureLease {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the lease for `session`, or keeps it if already held by it.
    pub fn try_acquire(&self, session: u64) -> bool {
        let mut owner = self.owner.lock().unwrap_or_else(PoisonError::into_inner);
        match *owner {
            Some(current) if current != session => false,
            _ => {
                *owner = Some(session);
                true
            }
        }
    }

    /// Releases the lease if `session` holds it.
    pub fn release(&self, session: u64) {
        let mut owner = self.owner.lock().unwrap_or_else(PoisonError::into_inner);
        if *owner == Some(session) {
            *owner = None;
        }
    }

    pub fn owner(&self) -> Option<u64> {
        *self.owner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Collaborators every session of one daemon shares.
#[derive(Clone)]
pub struct SessionResources {
    pub device: Arc<dyn DeviceSink>,
    pub capture_factory: Arc<dyn CaptureFactory>,
    pub capture_lease: Arc<CaptureLease>,
    pub audit: Arc<dyn AuditSink>,
    pub config: SessionConfig,
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingHandshake,
    Active,
    Closed,
}

pub struct Session {
    id: u64,
    identity: ConnectionIdentity,
    resources: SessionResources,
    state: SessionState,
    capture: Option<Box<dyn CaptureSource>>,
    outbound: mpsc::Sender<Vec<u8>>,
    opened_at: Instant,
}

impl Session {
    fn new(
        id: u64,
        identity: ConnectionIdentity,
        resources: SessionResources,
        outbound: mpsc::Sender<Vec<u8>>,
    ) -> Self {
        Self {
            id,
            identity,
            resources,
            state: SessionState::AwaitingHandshake,
            capture: None,
            outbound,
            opened_at: Instant::now(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Reads and dispatches frames until the peer leaves, a protocol error
    /// occurs, the handshake deadline passes or `shutdown` fires.
    async fn serve(&mut self, mut reader: OwnedReadHalf, mut shutdown: watch::Receiver<bool>) {
        if *shutdown.borrow_and_update() {
            return;
        }

        let deadline = tokio::time::sleep(self.resources.config.handshake_timeout());
        tokio::pin!(deadline);

        let mut frames = FrameBuffer::new();
        let mut chunk = vec![0u8; READ_CHUNK];

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        log::debug!("session {}: daemon shutting down", self.id);
                        return;
                    }
                }
                _ = &mut deadline, if self.state == SessionState::AwaitingHandshake => {
                    log::warn!("session {}: no handshake from {}, closing", self.id, self.identity);
                    return;
                }
                read = reader.read(&mut chunk) => {
                    let n = match read {
                        Ok(0) => {
                            log::debug!("session {}: peer closed connection", self.id);
                            return;
                        }
                        Ok(n) => n,
                        Err(e) => {
                            log::debug!("session {}: read error: {e}", self.id);
                            return;
                        }
                    };
                    frames.extend(&chunk[..n]);
                    loop {
                        match frames.next_message() {
                            Ok(Some(message)) => {
                                if self.handle(message).is_break() {
                                    return;
                                }
                            }
                            Ok(None) => break,
                            Err(e) => {
                                log::warn!("session {}: protocol error from {}: {e}", self.id, self.identity);
                                return;
                            }
                        }
                    }
                }
            }
        }
    }

    fn handle(&mut self, message: Message) -> ControlFlow<()> {
        match self.state {
            SessionState::AwaitingHandshake => self.handle_handshake(message),
            SessionState::Active => self.handle_command(message),
            SessionState::Closed => ControlFlow::Break(()),
        }
    }

    fn handle_handshake(&mut self, message: Message) -> ControlFlow<()> {
        match message {
            Message::Handshake { version } if version == PROTOCOL_VERSION => {
                self.state = SessionState::Active;
                log::debug!("session {}: handshake complete", self.id);
                self.reply(Message::Handshake {
                    version: PROTOCOL_VERSION,
                })
            }
            Message::Handshake { version } => {
                log::warn!(
                    "session {}: protocol version mismatch (client {version}, daemon {PROTOCOL_VERSION})",
                    self.id
                );
                let _ = self.reply(Message::error(format!(
                    "protocol version mismatch: client {version}, daemon {PROTOCOL_VERSION}"
                )));
                ControlFlow::Break(())
            }
            other => {
                log::warn!(
                    "session {}: expected handshake, got {:?}",
                    self.id,
                    other.opcode()
                );
                let _ = self.reply(Message::error("expected handshake"));
                ControlFlow::Break(())
            }
        }
    }

    fn handle_command(&mut self, message: Message) -> ControlFlow<()> {
        match message {
            Message::StartCapture { mouse, keyboard } => {
                self.start_capture(CaptureFilter { mouse, keyboard })
            }
            Message::StopCapture => {
                self.stop_capture();
                ControlFlow::Continue(())
            }
            Message::ConfigureResolution { width, height } => {
                match self.resources.device.configure(width, height) {
                    Ok(()) => ControlFlow::Continue(()),
                    Err(e) => {
                        log::warn!("session {}: configure {width}x{height} failed: {e}", self.id);
                        self.reply(Message::error(format!("configure failed: {e}")))
                    }
                }
            }
            Message::SimulateEvent {
                event_type,
                code,
                value,
            } => {
                match self.resources.device.send_event(event_type, code, value) {
                    Ok(()) => ControlFlow::Continue(()),
                    Err(e) => {
                        log::warn!("session {}: simulate event failed: {e}", self.id);
                        self.reply(Message::error(format!("simulate failed: {e}")))
                    }
                }
            }
            other => {
                log::warn!(
                    "session {}: unexpected {:?} from {}, closing",
                    self.id,
                    other.opcode(),
                    self.identity
                );
                ControlFlow::Break(())
            }
        }
    }

    fn start_capture(&mut self, filter: CaptureFilter) -> ControlFlow<()> {
        if filter.is_empty() {
            self.stop_capture();
            return ControlFlow::Continue(());
        }
        if !self.resources.capture_lease.try_acquire(self.id) {
            log::warn!(
                "session {}: capture refused for {}, owned by session {:?}",
                self.id,
                self.identity,
                self.resources.capture_lease.owner()
            );
            return self.reply(Message::error("capture is owned by another session"));
        }

        let (width, height) = (
            self.resources.config.default_width,
            self.resources.config.default_height,
        );
        if let Err(e) = self.resources.device.configure(width, height) {
            log::warn!("session {}: configure {width}x{height} failed: {e}", self.id);
        }

        let capture = match self.capture.take() {
            Some(existing) => Ok(existing),
            None => self.resources.capture_factory.create(),
        };
        let result = match capture {
            Ok(mut capture) => {
                let callback = self.event_sink();
                let started = capture.start(filter, callback);
                self.capture = Some(capture);
                started
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                log::info!(
                    "session {}: capture started (mouse={} keyboard={})",
                    self.id,
                    filter.mouse,
                    filter.keyboard
                );
                self.resources
                    .audit
                    .log_capture_start(&self.identity, filter.mouse, filter.keyboard);
                ControlFlow::Continue(())
            }
            Err(e) => {
                log::error!("session {}: capture start failed: {e}", self.id);
                self.capture = None;
                self.resources.capture_lease.release(self.id);
                self.reply(Message::error(format!("capture failed: {e}")))
            }
        }
    }

    fn stop_capture(&mut self) {
        let Some(mut capture) = self.capture.take() else {
            return;
        };
        let was_running = capture.is_running();
        if let Err(e) = capture.stop() {
            log::warn!("session {}: capture stop failed: {e}", self.id);
        }
        self.resources.capture_lease.release(self.id);
        if was_running {
            log::info!("session {}: capture stopped", self.id);
            self.resources.audit.log_capture_stop(&self.identity);
        }
    }

    /// Callback run on the capture thread. Frames are queued without
    /// blocking; a full queue drops the event.
    fn event_sink(&self) -> EventCallback {
        let outbound = self.outbound.clone();
        let id = self.id;
        Box::new(move |raw: RawInputEvent| {
            let Ok(event_type) = u8::try_from(raw.event_type) else {
                return;
            };
            let frame = Message::InputEvent(InputEvent {
                event_type,
                code: i32::from(raw.code),
                value: raw.value,
                timestamp_ms: raw.timestamp_ms(),
            })
            .to_bytes();
            if let Err(mpsc::error::TrySendError::Full(_)) = outbound.try_send(frame) {
                log::debug!("session {id}: outbound queue full, dropping input event");
            }
        })
    }

    /// Queues a reply without waiting. A full queue means the client has
    /// stopped reading; the session is closed rather than stalled.
    fn reply(&mut self, message: Message) -> ControlFlow<()> {
        match self.outbound.try_send(message.to_bytes()) {
            Ok(()) => ControlFlow::Continue(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                log::warn!(
                    "session {}: {} is not reading replies, closing",
                    self.id,
                    self.identity
                );
                ControlFlow::Break(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                log::debug!("session {}: writer gone, reply dropped", self.id);
                ControlFlow::Break(())
            }
        }
    }

    /// Stops capture, resets the device and records the disconnect. Safe to
    /// call repeatedly and from any state.
    pub fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.state = SessionState::Closed;
        self.stop_capture();
        if let Err(e) = self.resources.device.reset() {
            log::warn!("session {}: device reset failed: {e}", self.id);
        }
        let duration = self.opened_at.elapsed();
        log::info!(
            "session {}: closed {} after {:?}",
            self.id,
            self.identity,
            duration
        );
        self.resources.audit.log_disconnect(&self.identity, duration);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Services one admitted connection until it ends, then tears it down.
pub async fn run_session(
    id: u64,
    identity: ConnectionIdentity,
    stream: UnixStream,
    resources: SessionResources,
    shutdown: watch::Receiver<bool>,
) {
    let (reader, writer) = stream.into_split();
    let (outbound_tx, outbound_rx) = mpsc::channel(resources.config.outbound_queue.max(1));
    let writer_task = tokio::spawn(write_loop(id, writer, outbound_rx));
    let writer_abort = writer_task.abort_handle();

    log::info!("session {id}: opened for {identity}");
    let mut session = Session::new(id, identity, resources, outbound_tx);
    session.serve(reader, shutdown).await;
    session.close();
    drop(session);

    // The writer ends once every sender (ours and the capture callback's)
    // is gone and the queue is drained.
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer_task)
        .await
        .is_err()
    {
        log::debug!("session {id}: writer did not drain in time, aborting");
        writer_abort.abort();
    }
}

async fn write_loop(id: u64, mut writer: OwnedWriteHalf, mut frames: mpsc::Receiver<Vec<u8>>) {
    while let Some(frame) = frames.recv().await {
        if let Err(e) = writer.write_all(&frame).await {
            log::debug!("session {id}: write failed: {e}");
            return;
        }
    }
    let _ = writer.shutdown().await;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
