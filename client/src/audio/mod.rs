//! Audio Input/Output
//!
//! Multiplexes any number of per-call virtual capture and playback devices
//! onto at most one physical capture and one physical playback backend.
//!
//! - [`VirtualDeviceTable`] owns the slots and the shared physical handles
//! - [`CaptureScheduler`] polls the physical capture device on a background
//!   thread and fans frames out to every open input device
//! - [`playback`] keeps a bounded ring of backend buffers per output device

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod backend;
mod capture;
mod playback;
mod slots;
mod system;
mod table;
mod vad;

pub use backend::{
    AudioBackend, BackendError, BufferId, CaptureStream, MockBackend, PlaybackDevice,
    PlaybackSource,
};
pub use capture::CaptureScheduler;
pub use slots::DeviceHandle;
pub use system::AudioSystem;
pub use table::{FrameHandler, VirtualDeviceTable, DEFAULT_VAD_HOLD_MS};
pub use vad::frame_volume;

/// Virtual device slots available per device kind
pub const MAX_DEVICES: usize = 32;

/// Capture buffer capacity in `i16` samples (all channels)
pub const MAX_FRAME_SAMPLES: usize = 16_000;

/// Silent buffers queued on a freshly created playback source
pub const PRIMED_BUFFERS: usize = 5;

/// Ceiling on buffers queued on one playback source before writes report `Busy`
pub const MAX_QUEUED_BUFFERS: usize = 16;

/// Default call audio configuration
pub const DEFAULT_SAMPLE_RATE: u32 = 48000;
pub const DEFAULT_FRAME_DURATION_MS: u32 = 20;
pub const DEFAULT_CHANNELS: u8 = 2;

/// Device-layer errors
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceError {
    #[error("Internal audio error")]
    InternalError,
    #[error("Invalid device selection")]
    InvalidSelection,
    #[error("Failed to start audio device")]
    FailedStart,
    #[error("Playback queue is full")]
    Busy,
    #[error("All devices are busy")]
    AllDevicesBusy,
    #[error("Device is not active")]
    DeviceNotActive,
    #[error("Unsupported audio mode")]
    UnsupportedMode,
}

/// Direction of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Capture,
    Playback,
}

impl std::fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Capture => f.write_str("capture"),
            Self::Playback => f.write_str("playback"),
        }
    }
}

/// Sample rate, frame duration and channel count of a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameFormat {
    pub sample_rate: u32,
    pub frame_duration_ms: u32,
    pub channels: u8,
}

impl FrameFormat {
    pub const fn new(sample_rate: u32, frame_duration_ms: u32, channels: u8) -> Self {
        Self {
            sample_rate,
            frame_duration_ms,
            channels,
        }
    }

    /// Samples per channel in one frame
    pub const fn samples_per_channel(&self) -> usize {
        (self.sample_rate as usize * self.frame_duration_ms as usize) / 1000
    }

    /// Interleaved `i16` samples in one frame
    pub const fn frame_len(&self) -> usize {
        self.samples_per_channel() * self.channels as usize
    }

    /// Reject channel layouts and frame sizes the capture path cannot carry.
    pub fn validate(&self) -> Result<(), DeviceError> {
        if self.channels != 1 && self.channels != 2 {
            return Err(DeviceError::UnsupportedMode);
        }
        let len = self.frame_len();
        if len == 0 || len > MAX_FRAME_SAMPLES {
            return Err(DeviceError::UnsupportedMode);
        }
        Ok(())
    }
}

impl Default for FrameFormat {
    fn default() -> Self {
        Self::new(DEFAULT_SAMPLE_RATE, DEFAULT_FRAME_DURATION_MS, DEFAULT_CHANNELS)
    }
}

/// Physical device as presented to the command layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub index: usize,
    pub name: String,
    pub is_default: bool,
    pub is_primary: bool,
}
