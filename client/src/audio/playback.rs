//! Playback Queue
//!
//! Each virtual output device owns one backend source. Writes recycle a
//! buffer the source has finished playing, allocate a fresh one while the
//! queue is short, and report `Busy` once it is saturated. Writes never block.

use tracing::{trace, warn};

use super::backend::{BackendError, BufferId, PlaybackDevice, PlaybackSource};
use super::{DeviceError, FrameFormat, MAX_QUEUED_BUFFERS, PRIMED_BUFFERS};

pub(super) struct PlaybackQueue {
    source: Option<Box<dyn PlaybackSource>>,
    format: FrameFormat,
}

impl PlaybackQueue {
    /// Create a source on `device` and start it on a few frames of silence.
    pub(super) fn open(
        device: &mut dyn PlaybackDevice,
        format: FrameFormat,
    ) -> Result<Self, BackendError> {
        let source = Self::primed_source(device, format)?;
        Ok(Self {
            source: Some(source),
            format,
        })
    }

    fn primed_source(
        device: &mut dyn PlaybackDevice,
        format: FrameFormat,
    ) -> Result<Box<dyn PlaybackSource>, BackendError> {
        let mut source = device.create_source()?;
        let silence = vec![0i16; format.frame_len()];
        for _ in 0..PRIMED_BUFFERS {
            let id = source.gen_buffer()?;
            source.buffer_data(id, &silence, format.channels, format.sample_rate)?;
            source.queue_buffer(id)?;
        }
        source.play()?;
        Ok(source)
    }

    pub(super) const fn format(&self) -> FrameFormat {
        self.format
    }

    pub(super) const fn source_open(&self) -> bool {
        self.source.is_some()
    }

    /// Delete the source and all of its buffers.
    pub(super) fn close_source(&mut self) {
        self.source = None;
    }

    /// Replace the source with a fresh primed one on `device`.
    pub(super) fn reopen(&mut self, device: &mut dyn PlaybackDevice) -> Result<(), BackendError> {
        self.source = None;
        self.source = Some(Self::primed_source(device, self.format)?);
        Ok(())
    }

    /// Queue one buffer of interleaved samples.
    pub(super) fn write(
        &mut self,
        samples: &[i16],
        channels: u8,
        sample_rate: u32,
    ) -> Result<(), DeviceError> {
        if channels != 1 && channels != 2 {
            return Err(DeviceError::UnsupportedMode);
        }
        let source = self.source.as_mut().ok_or(DeviceError::DeviceNotActive)?;

        let id = Self::next_buffer(source.as_mut())?;

        let queued = source
            .buffer_data(id, samples, channels, sample_rate)
            .and_then(|()| source.queue_buffer(id));
        if let Err(e) = queued {
            warn!(buffer = id, error = %e, "Failed to queue playback buffer");
            source.delete_buffers(&[id]);
            return Err(DeviceError::InternalError);
        }

        // the source stops by itself on underrun
        if !source.is_playing() {
            trace!("Restarting stalled playback source");
            source.play().map_err(|e| {
                warn!(error = %e, "Failed to restart playback source");
                DeviceError::InternalError
            })?;
        }
        Ok(())
    }

    fn next_buffer(source: &mut dyn PlaybackSource) -> Result<BufferId, DeviceError> {
        let processed = source.processed();
        if processed > 0 {
            let mut done = source.unqueue_processed(processed);
            if !done.is_empty() {
                let reuse = done.swap_remove(0);
                if !done.is_empty() {
                    source.delete_buffers(&done);
                }
                return Ok(reuse);
            }
        }

        if source.queued() < MAX_QUEUED_BUFFERS {
            return source.gen_buffer().map_err(|e| {
                warn!(error = %e, "Failed to allocate playback buffer");
                DeviceError::InternalError
            });
        }

        Err(DeviceError::Busy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::backend::{AudioBackend, MockBackend};

    fn open_queue(backend: &MockBackend) -> (Box<dyn PlaybackDevice>, PlaybackQueue) {
        let mut device = backend.open_playback("Mock Speaker").unwrap();
        let queue = PlaybackQueue::open(device.as_mut(), FrameFormat::new(8000, 20, 1)).unwrap();
        (device, queue)
    }

    #[test]
    fn test_new_source_is_primed_and_playing() {
        let backend = MockBackend::new();
        let (_device, queue) = open_queue(&backend);

        let stats = &backend.source_stats()[0];
        assert_eq!(stats.queued, PRIMED_BUFFERS);
        assert!(stats.playing);
        assert_eq!(stats.last_written.as_deref(), Some(&[0i16; 160][..]));
        assert!(queue.source_open());
    }

    #[test]
    fn test_busy_when_queue_saturated() {
        let backend = MockBackend::new();
        let (_device, mut queue) = open_queue(&backend);

        for _ in PRIMED_BUFFERS..MAX_QUEUED_BUFFERS {
            queue.write(&[1; 160], 1, 8000).unwrap();
        }
        assert_eq!(backend.source_stats()[0].queued, MAX_QUEUED_BUFFERS);
        assert_eq!(queue.write(&[1; 160], 1, 8000), Err(DeviceError::Busy));
        assert_eq!(backend.source_stats()[0].queued, MAX_QUEUED_BUFFERS);
    }

    #[test]
    fn test_processed_buffers_are_recycled() {
        let backend = MockBackend::new();
        let (_device, mut queue) = open_queue(&backend);

        backend.consume_playback(3);
        queue.write(&[9; 160], 1, 8000).unwrap();

        let stats = &backend.source_stats()[0];
        // three unqueued, one reused, two deleted
        assert_eq!(stats.queued, PRIMED_BUFFERS - 3 + 1);
        assert_eq!(stats.allocated_buffers, PRIMED_BUFFERS - 2);
        assert_eq!(stats.processed, 0);
        assert_eq!(stats.last_written.as_deref(), Some(&[9i16; 160][..]));
    }

    #[test]
    fn test_recycling_frees_a_saturated_queue() {
        let backend = MockBackend::new();
        let (_device, mut queue) = open_queue(&backend);
        for _ in PRIMED_BUFFERS..MAX_QUEUED_BUFFERS {
            queue.write(&[1; 160], 1, 8000).unwrap();
        }
        assert_eq!(queue.write(&[1; 160], 1, 8000), Err(DeviceError::Busy));

        backend.consume_playback(1);
        assert!(queue.write(&[1; 160], 1, 8000).is_ok());
    }

    #[test]
    fn test_underrun_restarts_playback() {
        let backend = MockBackend::new();
        let (_device, mut queue) = open_queue(&backend);

        backend.consume_playback(PRIMED_BUFFERS);
        assert!(!backend.source_stats()[0].playing);

        queue.write(&[5; 160], 1, 8000).unwrap();
        assert!(backend.source_stats()[0].playing);
    }

    #[test]
    fn test_write_rejects_bad_channels() {
        let backend = MockBackend::new();
        let (_device, mut queue) = open_queue(&backend);
        assert_eq!(
            queue.write(&[0; 160], 4, 8000),
            Err(DeviceError::UnsupportedMode)
        );
    }

    #[test]
    fn test_closed_source_is_not_active() {
        let backend = MockBackend::new();
        let (mut device, mut queue) = open_queue(&backend);

        queue.close_source();
        assert!(backend.source_stats().is_empty());
        assert_eq!(
            queue.write(&[0; 160], 1, 8000),
            Err(DeviceError::DeviceNotActive)
        );

        queue.reopen(device.as_mut()).unwrap();
        assert_eq!(backend.source_stats()[0].queued, PRIMED_BUFFERS);
        assert!(queue.write(&[0; 160], 1, 8000).is_ok());
    }
}
