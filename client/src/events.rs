//! Call Events
//!
//! Notifications for the UI. The capture thread and engine callbacks never
//! touch UI state directly; they push events into a bounded channel and move
//! on. A full or closed channel drops the event.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::warn;

use crate::audio::DeviceKind;
use crate::call::PeerSlot;

/// Events surfaced to the user interface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CallEvent {
    IncomingCall {
        peer: PeerSlot,
        audio: bool,
        video: bool,
    },
    Ringing {
        peer: PeerSlot,
    },
    CallStarted {
        peer: PeerSlot,
    },
    CallCancelled {
        peer: PeerSlot,
    },
    CallEnded {
        peer: PeerSlot,
    },
    BitRateChanged {
        peer: PeerSlot,
        bit_rate: u32,
    },
    DeviceSwitched {
        kind: DeviceKind,
        selection: usize,
    },
    /// One-line status message for a recoverable call error
    CallError {
        peer: PeerSlot,
        message: String,
    },
    /// The audio device layer failed outside any single call
    DeviceError {
        message: String,
    },
}

/// Non-blocking sending half of the event channel.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::Sender<CallEvent>,
}

impl EventSender {
    /// Create a bounded event channel.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<CallEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    pub fn emit(&self, event: CallEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                warn!(?event, "Event channel full, dropping event");
            }
            Err(TrySendError::Closed(_)) => {
                warn!("Event channel closed");
            }
        }
    }
}
