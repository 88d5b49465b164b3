//! Call State Machine
//!
//! `None -> Pending -> Active -> None`, with `Pending -> None` for calls that
//! are rejected or cancelled before they start.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::engine::CallStateFlags;
use super::PeerSlot;
use crate::audio::{DeviceHandle, FrameFormat};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    #[default]
    None,
    Pending,
    Active,
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("idle"),
            Self::Pending => f.write_str("pending"),
            Self::Active => f.write_str("active"),
        }
    }
}

/// Who placed a pending call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Incoming,
    Outgoing,
}

/// Media directions offered when a call rang
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OfferedMedia {
    pub audio: bool,
    pub video: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Ring,
    Cancel,
    Start,
    Stop,
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ring => f.write_str("ring"),
            Self::Cancel => f.write_str("cancel"),
            Self::Start => f.write_str("start"),
            Self::Stop => f.write_str("stop"),
        }
    }
}

/// Errors for call state transitions
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallStateError {
    #[error("Cannot {transition} a call that is {state}")]
    InvalidTransition {
        state: CallStatus,
        transition: Transition,
    },
    #[error("No incoming call")]
    NotIncoming,
    #[error("No call")]
    NoCall,
    #[error("No active call")]
    NotActive,
    #[error("Peer {0} is out of range")]
    InvalidPeer(PeerSlot),
}

impl CallStatus {
    /// Next status after `transition`, or the reason it is not allowed.
    pub fn apply(self, transition: Transition) -> Result<Self, CallStateError> {
        match (self, transition) {
            (Self::None, Transition::Ring) => Ok(Self::Pending),
            // cancelling an idle call is a no-op
            (Self::None | Self::Pending, Transition::Cancel) => Ok(Self::None),
            (Self::Pending, Transition::Start) => Ok(Self::Active),
            (Self::Active, Transition::Stop) => Ok(Self::None),
            (state, transition) => Err(CallStateError::InvalidTransition { state, transition }),
        }
    }
}

/// Per-peer call record.
///
/// An idle call never holds device handles.
#[derive(Debug, Clone)]
pub struct Call {
    pub(super) status: CallStatus,
    pub(super) direction: Option<Direction>,
    pub(super) offered: Option<OfferedMedia>,
    pub(super) protocol_state: CallStateFlags,
    pub(super) input: Option<DeviceHandle>,
    pub(super) output: Option<DeviceHandle>,
    pub(super) audio_bit_rate: u32,
    pub(super) format: FrameFormat,
    pub(super) started_at: Option<DateTime<Utc>>,
}

impl Call {
    pub(super) const fn new(audio_bit_rate: u32, format: FrameFormat) -> Self {
        Self {
            status: CallStatus::None,
            direction: None,
            offered: None,
            protocol_state: CallStateFlags::empty(),
            input: None,
            output: None,
            audio_bit_rate,
            format,
            started_at: None,
        }
    }

    pub const fn status(&self) -> CallStatus {
        self.status
    }

    pub const fn direction(&self) -> Option<Direction> {
        self.direction
    }

    pub const fn offered(&self) -> Option<OfferedMedia> {
        self.offered
    }

    pub const fn audio_bit_rate(&self) -> u32 {
        self.audio_bit_rate
    }

    pub const fn protocol_state(&self) -> CallStateFlags {
        self.protocol_state
    }

    pub const fn format(&self) -> FrameFormat {
        self.format
    }

    pub const fn input(&self) -> Option<DeviceHandle> {
        self.input
    }

    pub const fn output(&self) -> Option<DeviceHandle> {
        self.output
    }

    pub const fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    /// Seconds since the call started, while it is active.
    pub fn duration_secs(&self) -> Option<i64> {
        self.started_at
            .map(|started| Utc::now().signed_duration_since(started).num_seconds())
    }

    pub(super) fn transition(&mut self, transition: Transition) -> Result<(), CallStateError> {
        self.status = self.status.apply(transition)?;
        if self.status == CallStatus::None {
            self.direction = None;
            self.offered = None;
            self.protocol_state = CallStateFlags::empty();
            self.started_at = None;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_lifecycle() {
        let status = CallStatus::None
            .apply(Transition::Ring)
            .and_then(|s| s.apply(Transition::Start))
            .and_then(|s| s.apply(Transition::Stop))
            .unwrap();
        assert_eq!(status, CallStatus::None);
    }

    #[test]
    fn test_ring_requires_idle_call() {
        for state in [CallStatus::Pending, CallStatus::Active] {
            assert_eq!(
                state.apply(Transition::Ring),
                Err(CallStateError::InvalidTransition {
                    state,
                    transition: Transition::Ring,
                })
            );
        }
    }

    #[test]
    fn test_cancel_is_idempotent() {
        assert_eq!(CallStatus::Pending.apply(Transition::Cancel), Ok(CallStatus::None));
        assert_eq!(CallStatus::None.apply(Transition::Cancel), Ok(CallStatus::None));
        assert!(CallStatus::Active.apply(Transition::Cancel).is_err());
    }

    #[test]
    fn test_start_and_stop_need_matching_state() {
        assert!(CallStatus::None.apply(Transition::Start).is_err());
        assert!(CallStatus::Active.apply(Transition::Start).is_err());
        assert!(CallStatus::Pending.apply(Transition::Stop).is_err());
        assert!(CallStatus::None.apply(Transition::Stop).is_err());
    }

    #[test]
    fn test_ending_a_call_clears_session_fields() {
        let mut call = Call::new(64, FrameFormat::default());
        call.transition(Transition::Ring).unwrap();
        call.direction = Some(Direction::Incoming);
        call.transition(Transition::Start).unwrap();
        call.protocol_state = CallStateFlags::SENDING_AUDIO;
        call.started_at = Some(Utc::now());
        assert_eq!(call.duration_secs(), Some(0));

        call.transition(Transition::Stop).unwrap();
        assert_eq!(call.status(), CallStatus::None);
        assert_eq!(call.direction(), None);
        assert!(call.protocol_state().is_empty());
        assert_eq!(call.duration_secs(), None);
        assert_eq!(call.audio_bit_rate(), 64);
    }

    #[test]
    fn test_error_messages() {
        let err = CallStatus::None.apply(Transition::Stop).unwrap_err();
        assert_eq!(err.to_string(), "Cannot stop a call that is idle");
    }
}
