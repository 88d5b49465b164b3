//! Audio Backend Adapter
//!
//! Boundary to the platform audio API. The device table only ever talks to
//! these traits; [`mock::MockBackend`] backs tests and headless runs, and the
//! `cpal` feature adds a real backend.

use thiserror::Error;

use super::{DeviceKind, FrameFormat};

#[cfg(feature = "cpal")]
pub mod cpal;
pub mod mock;

#[cfg(feature = "cpal")]
pub use self::cpal::CpalBackend;
pub use mock::MockBackend;

/// Errors reported by a backend implementation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),
    #[error("Failed to open device: {0}")]
    OpenFailed(String),
    #[error("Unknown buffer {0}")]
    UnknownBuffer(u32),
    #[error("Stream error: {0}")]
    Stream(String),
}

/// Opaque backend buffer name
pub type BufferId = u32;

/// Platform audio API.
pub trait AudioBackend: Send + Sync {
    /// Names of the physical devices of `kind`, in selection order.
    fn device_names(&self, kind: DeviceKind) -> Result<Vec<String>, BackendError>;

    /// Name of the platform default device of `kind`, if any.
    fn default_device(&self, kind: DeviceKind) -> Option<String>;

    /// Open a capture device. The stream must be capturing when returned.
    fn open_capture(
        &self,
        device: &str,
        format: FrameFormat,
    ) -> Result<Box<dyn CaptureStream>, BackendError>;

    /// Open a playback device. Sources are created on it per output stream.
    fn open_playback(&self, device: &str) -> Result<Box<dyn PlaybackDevice>, BackendError>;
}

/// An open physical capture device. Dropping it closes the device.
pub trait CaptureStream: Send {
    /// Captured sample frames (samples per channel) ready to be read.
    fn available(&mut self) -> Result<usize, BackendError>;

    /// Fill `out` completely with interleaved samples.
    fn read(&mut self, out: &mut [i16]) -> Result<(), BackendError>;
}

/// An open physical playback device. Dropping it closes the device.
pub trait PlaybackDevice: Send {
    fn create_source(&mut self) -> Result<Box<dyn PlaybackSource>, BackendError>;
}

/// A playback voice with its own buffer queue. Dropping it deletes the source
/// and every buffer it owns.
pub trait PlaybackSource: Send {
    /// Queued buffers the device has finished playing.
    fn processed(&mut self) -> usize;

    /// All buffers currently on the queue, processed ones included.
    fn queued(&mut self) -> usize;

    /// Remove up to `count` processed buffers from the queue, oldest first.
    fn unqueue_processed(&mut self, count: usize) -> Vec<BufferId>;

    fn gen_buffer(&mut self) -> Result<BufferId, BackendError>;

    fn delete_buffers(&mut self, ids: &[BufferId]);

    fn buffer_data(
        &mut self,
        id: BufferId,
        samples: &[i16],
        channels: u8,
        sample_rate: u32,
    ) -> Result<(), BackendError>;

    fn queue_buffer(&mut self, id: BufferId) -> Result<(), BackendError>;

    fn is_playing(&mut self) -> bool;

    fn play(&mut self) -> Result<(), BackendError>;
}
