//! Status boundary towards the presentation layer.
//!
//! The workers only ever push events out through an mpsc channel; nothing is
//! read back. Whoever owns the receiving end (the CLI presenter, a future
//! tray UI) decides how to render them.

use tokio::sync::mpsc;
use tracing::debug;

use crate::input::MAX_PADS;

/// Four-level status classification surfaced with every message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Severity {
    #[default]
    None,
    Bad,
    Pending,
    Good,
}

/// One update on one of the three independent status channels, or a one-shot
/// icon change.
#[derive(Debug, Clone)]
pub enum StatusEvent {
    Resolve { severity: Severity, message: String },
    Input { severity: Severity, message: String },
    Connection { severity: Severity, message: String },
    Icon(Severity),
}

/// Write side of the status boundary.
///
/// Deduplicates the icon (emitted only on change) and the input-slot message
/// (re-emitted only when the connectivity mask changes), so a 500 Hz poll
/// loop does not flood the channel with identical updates.
pub struct StatusReporter {
    events: mpsc::Sender<StatusEvent>,
    prev_icon: Option<Severity>,
    prev_mask: Option<u8>,
}

impl StatusReporter {
    pub fn new(events: mpsc::Sender<StatusEvent>) -> Self {
        Self {
            events,
            prev_icon: None,
            prev_mask: None,
        }
    }

    fn send(&self, event: StatusEvent) {
        // The presentation side may be gone or slow; status is best-effort.
        if let Err(e) = self.events.try_send(event) {
            debug!("Status event dropped: {}", e);
        }
    }

    pub fn resolve(&mut self, severity: Severity, message: impl Into<String>) {
        self.send(StatusEvent::Resolve {
            severity,
            message: message.into(),
        });
    }

    pub fn empty_resolve(&mut self) {
        self.resolve(
            Severity::None,
            "Enter the address of a target machine to connect to",
        );
    }

    pub fn connection(&mut self, severity: Severity, message: impl Into<String>) {
        self.send(StatusEvent::Connection {
            severity,
            message: message.into(),
        });
    }

    pub fn empty_connection(&mut self) {
        self.connection(Severity::Bad, "Not connected");
    }

    /// Free-form input status, used when the controller backend itself is
    /// unavailable. Pins the mask at "empty" so the regular per-cycle
    /// [`input_connected`](Self::input_connected) call does not overwrite it.
    pub fn input(&mut self, severity: Severity, message: impl Into<String>) {
        self.prev_mask = Some(0);
        self.send(StatusEvent::Input {
            severity,
            message: message.into(),
        });
    }

    /// Reports which physical slots feed the combined controller. Quiet
    /// unless the connectivity mask actually changed.
    pub fn input_connected(&mut self, mask: u8) {
        if self.prev_mask == Some(mask) {
            return;
        }
        self.prev_mask = Some(mask);

        let used: Vec<String> = (0..MAX_PADS)
            .filter(|i| mask & (1 << i) != 0)
            .map(|i| (i + 1).to_string())
            .collect();

        if used.is_empty() {
            self.send(StatusEvent::Input {
                severity: Severity::Bad,
                message: "No gamepads found".to_string(),
            });
        } else if used.len() == 1 {
            self.send(StatusEvent::Input {
                severity: Severity::Good,
                message: format!("Slot {}", used[0]),
            });
        } else {
            self.send(StatusEvent::Input {
                severity: Severity::Good,
                message: format!("Combining slots {}", used.join("+")),
            });
        }
    }

    /// One-shot icon update, emitted only when the severity changes.
    pub fn icon(&mut self, severity: Severity) {
        if self.prev_icon == Some(severity) {
            return;
        }
        self.prev_icon = Some(severity);
        self.send(StatusEvent::Icon(severity));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reporter() -> (StatusReporter, mpsc::Receiver<StatusEvent>) {
        let (tx, rx) = mpsc::channel(16);
        (StatusReporter::new(tx), rx)
    }

    #[test]
    fn icon_deduplicates() {
        let (mut reporter, mut rx) = reporter();

        reporter.icon(Severity::Bad);
        reporter.icon(Severity::Bad);
        reporter.icon(Severity::Good);

        assert!(matches!(rx.try_recv(), Ok(StatusEvent::Icon(Severity::Bad))));
        assert!(matches!(rx.try_recv(), Ok(StatusEvent::Icon(Severity::Good))));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn input_message_follows_mask_changes() {
        let (mut reporter, mut rx) = reporter();

        reporter.input_connected(0b0001);
        reporter.input_connected(0b0001);
        reporter.input_connected(0b0101);
        reporter.input_connected(0b0000);

        match rx.try_recv() {
            Ok(StatusEvent::Input { severity, message }) => {
                assert_eq!(severity, Severity::Good);
                assert_eq!(message, "Slot 1");
            }
            other => panic!("unexpected event: {other:?}"),
        }
        match rx.try_recv() {
            Ok(StatusEvent::Input { message, .. }) => {
                assert_eq!(message, "Combining slots 1+3");
            }
            other => panic!("unexpected event: {other:?}"),
        }
        match rx.try_recv() {
            Ok(StatusEvent::Input { severity, message }) => {
                assert_eq!(severity, Severity::Bad);
                assert_eq!(message, "No gamepads found");
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(rx.try_recv().is_err());
    }
}
