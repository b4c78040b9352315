//! Mouse and keyboard capture via the Linux evdev interface (/dev/input/event*).
//!
//! `EvdevCapture` implements the `CaptureSource` trait. `start()` enumerates
//! the devices matching the requested filter, then spawns a background thread
//! with a single-threaded tokio runtime. The runtime drives an async event
//! loop that reads from all devices concurrently via
//! `futures::stream::SelectAll` and hands each raw event to the callback.
//!
//! The daemon runs as root, so no group membership is needed to open the
//! device nodes. Devices are read without grabbing them; the desktop keeps
//! receiving the same events.

use std::thread;
use std::thread::JoinHandle;

use evdev::{Device, EventType, Key, RelativeAxisType};
use futures::stream::SelectAll;
use futures::StreamExt;
use tokio::sync::oneshot;

use crate::platform::linux::VIRTUAL_DEVICE_NAME;
use crate::platform::{CaptureFilter, CaptureSource, EventCallback, PlatformError, RawInputEvent};

// ---------------------------------------------------------------------------
// Public struct
// ---------------------------------------------------------------------------

/// Linux capture backend using the evdev input subsystem.
pub struct EvdevCapture {
    stop_tx: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl EvdevCapture {
    pub fn new() -> Self {
        Self {
            stop_tx: None,
            thread: None,
        }
    }
}

impl Default for EvdevCapture {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureSource for EvdevCapture {
    fn start(&mut self, filter: CaptureFilter, callback: EventCallback) -> Result<(), PlatformError> {
        // Restarting with a new filter replaces the running reader.
        self.stop()?;

        // Enumerate and open devices in the calling thread so errors surface
        // immediately rather than silently dying in the background.
        let devices = find_devices(filter)?;
        log::info!(
            "capture: found {} device(s) for mouse={} keyboard={}",
            devices.len(),
            filter.mouse,
            filter.keyboard
        );
        for dev in &devices {
            log::debug!("capture: monitoring {:?}", dev.name().unwrap_or("unnamed"));
        }

        let (stop_tx, stop_rx) = oneshot::channel();

        let thread = thread::Builder::new()
            .name("inputbridge-capture".into())
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        log::error!("capture: failed to build tokio runtime: {e}");
                        return;
                    }
                };

                if let Err(e) = rt.block_on(capture_loop(devices, callback, stop_rx)) {
                    log::error!("capture: fatal error: {e}");
                }
            })?;

        self.stop_tx = Some(stop_tx);
        self.thread = Some(thread);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), PlatformError> {
        if let Some(tx) = self.stop_tx.take() {
            // Ignore send error: the thread may have already exited.
            let _ = tx.send(());
        }
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.thread.is_some()
    }
}

impl Drop for EvdevCapture {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

// ---------------------------------------------------------------------------
// Device enumeration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DeviceClass {
    keyboard: bool,
    mouse: bool,
}

/// A device is a keyboard if it reports `KEY_A`; a pointer if it reports
/// relative X motion or a left button.
fn classify(device: &Device) -> DeviceClass {
    let keys = device.supported_keys();
    let keyboard = keys.is_some_and(|k| k.contains(Key::KEY_A));
    let button = keys.is_some_and(|k| k.contains(Key::BTN_LEFT));
    let rel = device
        .supported_relative_axes()
        .is_some_and(|axes| axes.contains(RelativeAxisType::REL_X));
    DeviceClass {
        keyboard,
        mouse: rel || button,
    }
}

fn wanted(class: DeviceClass, filter: CaptureFilter) -> bool {
    (filter.keyboard && class.keyboard) || (filter.mouse && class.mouse)
}

/// Opens every device matching `filter`, skipping our own virtual device so
/// injected events are never captured back.
fn find_devices(filter: CaptureFilter) -> Result<Vec<Device>, PlatformError> {
    if filter.is_empty() {
        return Err(PlatformError::Other(
            "capture requested with neither mouse nor keyboard".into(),
        ));
    }

    let devices: Vec<Device> = evdev::enumerate()
        .filter_map(|(_, dev)| {
            if dev.name() == Some(VIRTUAL_DEVICE_NAME) {
                return None;
            }
            if wanted(classify(&dev), filter) {
                Some(dev)
            } else {
                None
            }
        })
        .collect();

    if devices.is_empty() {
        Err(PlatformError::Unavailable(
            "No matching input devices found in /dev/input/.".into(),
        ))
    } else {
        Ok(devices)
    }
}

// ---------------------------------------------------------------------------
// Async event loop
// ---------------------------------------------------------------------------

/// Reads events from all opened devices concurrently until stopped.
async fn capture_loop(
    devices: Vec<Device>,
    callback: EventCallback,
    stop_rx: oneshot::Receiver<()>,
) -> Result<(), Box<dyn std::error::Error>> {
    // Convert each Device into a non-blocking async EventStream.
    let mut all_streams: SelectAll<evdev::EventStream> = SelectAll::new();
    for device in devices {
        all_streams.push(device.into_event_stream()?);
    }

    log::info!("capture: evdev capture active");

    tokio::select! {
        _ = stop_rx => {
            log::info!("capture: stop signal received");
        }
        _ = async {
            while let Some(Ok(event)) = all_streams.next().await {
                if let Some(raw) = translate(event) {
                    callback(raw);
                }
            }
            log::info!("capture: all evdev streams ended");
        } => {}
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Event filter
// ---------------------------------------------------------------------------

/// Keeps key, relative and absolute events. Key auto-repeat (value 2) is
/// dropped; clients see only press and release.
fn translate(event: evdev::InputEvent) -> Option<RawInputEvent> {
    let event_type = event.event_type();
    let keep = match event_type {
        EventType::KEY => event.value() != 2,
        EventType::RELATIVE | EventType::ABSOLUTE => true,
        _ => false,
    };
    keep.then(|| RawInputEvent {
        event_type: event_type.0,
        code: event.code(),
        value: event.value(),
        timestamp: event.timestamp(),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
