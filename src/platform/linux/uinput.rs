//! Synthetic input injection via a uinput virtual device.
//!
//! `UinputDevice` implements `DeviceSink`. The virtual device exposes a full
//! keyboard, mouse buttons, relative motion and an absolute pointer whose
//! range matches the configured screen geometry. It is created lazily,
//! re-created on `configure()` and destroyed on `reset()`.
//!
//! Events are buffered until the caller sends `EV_SYN/SYN_REPORT`; the buffer
//! is then emitted as one report (evdev terminates every `emit` with its own
//! `SYN_REPORT`). A report longer than `MAX_PENDING_EVENTS` is discarded
//! and the offending event is rejected.

use std::sync::{Mutex, MutexGuard};

use evdev::uinput::{VirtualDevice, VirtualDeviceBuilder};
use evdev::{
    AbsInfo, AbsoluteAxisType, AttributeSet, EventType, InputEvent, Key, RelativeAxisType,
    UinputAbsSetup,
};

use crate::platform::linux::VIRTUAL_DEVICE_NAME;
use crate::platform::{DeviceSink, PlatformError};

/// Highest keyboard keycode advertised (`KEY_MICMUTE`).
const MAX_KEYBOARD_CODE: u16 = 248;
/// `BTN_LEFT` through `BTN_TASK`.
const MOUSE_BUTTONS: std::ops::RangeInclusive<u16> = 0x110..=0x117;
const SYN_REPORT: u16 = 0;
/// Longest report accepted before `SYN_REPORT`.
const MAX_PENDING_EVENTS: usize = 1024;

/// Process-wide virtual input device.
pub struct UinputDevice {
    inner: Mutex<Inner>,
}

struct Inner {
    device: Option<VirtualDevice>,
    pending: EventBatch,
    width: i32,
    height: i32,
}

impl UinputDevice {
    /// No device node exists until the first `configure` or `send_event`.
    pub fn new(default_width: i32, default_height: i32) -> Self {
        Self {
            inner: Mutex::new(Inner {
                device: None,
                pending: EventBatch::default(),
                width: default_width,
                height: default_height,
            }),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, PlatformError> {
        self.inner
            .lock()
            .map_err(|_| PlatformError::Other("uinput device mutex poisoned".into()))
    }
}

impl DeviceSink for UinputDevice {
    fn configure(&self, width: i32, height: i32) -> Result<(), PlatformError> {
        if width <= 0 || height <= 0 {
            return Err(PlatformError::Other(format!(
                "invalid geometry {width}x{height}"
            )));
        }
        let mut inner = self.lock()?;
        // Drop the old node before creating the replacement.
        inner.device = None;
        inner.pending.clear();
        inner.device = Some(build_device(width, height)?);
        inner.width = width;
        inner.height = height;
        log::info!("device: virtual device configured for {width}x{height}");
        Ok(())
    }

    fn send_event(&self, event_type: u16, code: u16, value: i32) -> Result<(), PlatformError> {
        let mut inner = self.lock()?;
        if inner.device.is_none() {
            let (w, h) = (inner.width, inner.height);
            inner.device = Some(build_device(w, h)?);
            log::debug!("device: created virtual device on first event ({w}x{h})");
        }

        let event_type = EventType(event_type);
        if event_type == EventType::SYNCHRONIZATION && code == SYN_REPORT {
            let batch = inner.pending.take();
            if let Some(device) = inner.device.as_mut() {
                device.emit(&batch)?;
            }
            return Ok(());
        }

        inner.pending.push(InputEvent::new(event_type, code, value))
    }

    fn reset(&self) -> Result<(), PlatformError> {
        let mut inner = self.lock()?;
        inner.pending.clear();
        if inner.device.take().is_some() {
            log::info!("device: virtual device destroyed");
        }
        Ok(())
    }
}

/// Events of one report, waiting for `SYN_REPORT`.
#[derive(Default)]
struct EventBatch {
    events: Vec<InputEvent>,
}

impl EventBatch {
    /// Appends `event`. Past the cap the whole report is dropped.
    fn push(&mut self, event: InputEvent) -> Result<(), PlatformError> {
        if self.events.len() >= MAX_PENDING_EVENTS {
            self.events = Vec::new();
            log::warn!("device: {MAX_PENDING_EVENTS} events without SYN_REPORT, report dropped");
            return Err(PlatformError::Other(format!(
                "more than {MAX_PENDING_EVENTS} events without SYN_REPORT"
            )));
        }
        self.events.push(event);
        Ok(())
    }

    fn take(&mut self) -> Vec<InputEvent> {
        std::mem::take(&mut self.events)
    }

    fn clear(&mut self) {
        self.events.clear();
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.events.len()
    }
}

fn build_device(width: i32, height: i32) -> Result<VirtualDevice, PlatformError> {
    let mut keys = AttributeSet::<Key>::new();
    for code in 1..=MAX_KEYBOARD_CODE {
        keys.insert(Key::new(code));
    }
    for code in MOUSE_BUTTONS {
        keys.insert(Key::new(code));
    }

    let mut rel = AttributeSet::<RelativeAxisType>::new();
    for axis in [
        RelativeAxisType::REL_X,
        RelativeAxisType::REL_Y,
        RelativeAxisType::REL_WHEEL,
        RelativeAxisType::REL_HWHEEL,
    ] {
        rel.insert(axis);
    }

    let abs_x = UinputAbsSetup::new(AbsoluteAxisType::ABS_X, AbsInfo::new(0, 0, width - 1, 0, 0, 0));
    let abs_y = UinputAbsSetup::new(AbsoluteAxisType::ABS_Y, AbsInfo::new(0, 0, height - 1, 0, 0, 0));

    let device = VirtualDeviceBuilder::new()
        .map_err(map_open_error)?
        .name(VIRTUAL_DEVICE_NAME)
        .with_keys(&keys)?
        .with_relative_axes(&rel)?
        .with_absolute_axis(&abs_x)?
        .with_absolute_axis(&abs_y)?
        .build()?;
    Ok(device)
}

fn map_open_error(e: std::io::Error) -> PlatformError {
    if e.kind() == std::io::ErrorKind::PermissionDenied {
        PlatformError::PermissionDenied("cannot open /dev/uinput".into())
    } else {
        PlatformError::Unavailable(format!("/dev/uinput: {e}"))
    }
}
