//! Multi-tenant capture subscriptions.
//!
//! Several independent features (hotkeys, the macro recorder, ...) each
//! register a named subscription describing whether they need mouse and/or
//! keyboard capture. The coordinator folds them into one aggregate intent and
//! reports only transitions of that aggregate, so the socket never carries a
//! redundant `StartCapture` for a mode that is already active.
//!
//! The coordinator does no I/O and reads no clock: its output depends only on
//! the sequence of calls made against it.

use std::collections::BTreeMap;

// ---------------------------------------------------------------------------
// Output type
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureCommandKind {
    None,
    Start,
    Stop,
}

/// What the transport has to send after a subscription change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureCommand {
    pub kind: CaptureCommandKind,
    pub mouse: bool,
    pub keyboard: bool,
}

impl CaptureCommand {
    pub const NONE: Self = Self {
        kind: CaptureCommandKind::None,
        mouse: false,
        keyboard: false,
    };

    pub const STOP: Self = Self {
        kind: CaptureCommandKind::Stop,
        mouse: false,
        keyboard: false,
    };

    pub fn start(mouse: bool, keyboard: bool) -> Self {
        Self {
            kind: CaptureCommandKind::Start,
            mouse,
            keyboard,
        }
    }

    pub fn is_none(&self) -> bool {
        self.kind == CaptureCommandKind::None
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Wants {
    mouse: bool,
    keyboard: bool,
}

/// Ref-counts named capture subscriptions into one aggregate.
#[derive(Debug, Default)]
pub struct SubscriptionCoordinator {
    entries: BTreeMap<String, Wants>,
    /// Aggregate most recently emitted as `Start`; `None` once stopped.
    emitted: Option<Wants>,
}

impl SubscriptionCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces the subscription called `name`.
    ///
    /// Returns `Start{aggregate}` when the aggregate differs from what was
    /// last emitted (always the case for the first subscriber).
    pub fn set_subscription(&mut self, name: &str, mouse: bool, keyboard: bool) -> CaptureCommand {
        self.entries
            .insert(name.to_owned(), Wants { mouse, keyboard });
        self.emit_if_changed()
    }

    /// Drops the subscription called `name`.
    ///
    /// Removing the last subscriber yields `Stop`. Removing a name that is not
    /// registered changes nothing and yields `None`.
    pub fn remove_subscription(&mut self, name: &str) -> CaptureCommand {
        if self.entries.remove(name).is_none() {
            return CaptureCommand::NONE;
        }
        if self.entries.is_empty() {
            self.emitted = None;
            return CaptureCommand::STOP;
        }
        self.emit_if_changed()
    }

    /// Re-arms the coordinator for a freshly established connection.
    ///
    /// The new daemon session has no capture running, so the current
    /// aggregate is re-emitted as `Start` whenever any subscriber exists.
    /// Never returns `Stop`.
    pub fn reset_transport_state_and_get_command(&mut self) -> CaptureCommand {
        match self.aggregate() {
            Some(wants) => {
                self.emitted = Some(wants);
                CaptureCommand::start(wants.mouse, wants.keyboard)
            }
            None => {
                self.emitted = None;
                CaptureCommand::NONE
            }
        }
    }

    /// Logical OR of all live subscriptions, or `None` when there are none.
    pub fn aggregate_wants(&self) -> Option<(bool, bool)> {
        self.aggregate().map(|w| (w.mouse, w.keyboard))
    }

    #[cfg(test)]
    fn is_subscribed(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    fn aggregate(&self) -> Option<Wants> {
        if self.entries.is_empty() {
            return None;
        }
        Some(self.entries.values().fold(
            Wants {
                mouse: false,
                keyboard: false,
            },
            |acc, w| Wants {
                mouse: acc.mouse || w.mouse,
                keyboard: acc.keyboard || w.keyboard,
            },
        ))
    }

    fn emit_if_changed(&mut self) -> CaptureCommand {
        let Some(current) = self.aggregate() else {
            return CaptureCommand::NONE;
        };
        if self.emitted == Some(current) {
            return CaptureCommand::NONE;
        }
        self.emitted = Some(current);
        CaptureCommand::start(current.mouse, current.keyboard)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
