//! Protocol engine boundary.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::PeerSlot;
use crate::audio::FrameFormat;

bitflags! {
    /// Session state reported by the engine for an ongoing call.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct CallStateFlags: u32 {
        const ERROR = 1;
        const FINISHED = 2;
        const SENDING_AUDIO = 4;
        const SENDING_VIDEO = 8;
        const ACCEPTING_AUDIO = 16;
        const ACCEPTING_VIDEO = 32;
    }
}

impl CallStateFlags {
    /// The session is over, cleanly or not.
    pub const fn is_terminal(self) -> bool {
        self.intersects(Self::ERROR.union(Self::FINISHED))
    }
}

/// Engine failures, worded for the status line.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("Audio calls are not supported")]
    Unavailable,
    #[error("Friend not found")]
    FriendNotFound,
    #[error("Friend is offline")]
    FriendNotConnected,
    #[error("Already in a call")]
    FriendAlreadyInCall,
    #[error("No call with this friend")]
    FriendNotInCall,
    #[error("Invalid bit rate")]
    InvalidBitRate,
    #[error("Cannot do that in the current call state")]
    InvalidState,
    #[error("Failed to send audio frame")]
    SendFailed,
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Outbound operations on the peer-to-peer call engine.
///
/// Implementations must not invoke the call manager's inbound callbacks from
/// inside these methods.
pub trait CallEngine: Send + Sync {
    /// Ring `peer`, offering audio at `audio_bit_rate` kbit/s.
    fn call(&self, peer: PeerSlot, audio_bit_rate: u32) -> Result<(), EngineError>;

    fn answer(&self, peer: PeerSlot, audio_bit_rate: u32) -> Result<(), EngineError>;

    /// Reject, cancel, or hang up the session with `peer`.
    fn cancel(&self, peer: PeerSlot) -> Result<(), EngineError>;

    fn set_audio_bit_rate(&self, peer: PeerSlot, bit_rate: u32) -> Result<(), EngineError>;

    /// Called from the capture thread for every delivered frame.
    fn send_audio_frame(
        &self,
        peer: PeerSlot,
        samples: &[i16],
        format: FrameFormat,
    ) -> Result<(), EngineError>;
}
