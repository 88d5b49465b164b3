//! cpal Backend
//!
//! `cpal::Stream` is not `Send`, so every physical device runs its stream on
//! a dedicated thread that owns it until the control channel closes. Capture
//! callbacks fill a shared sample ring; playback callbacks mix every playing
//! source's buffer queue into the output.

use std::collections::{HashMap, VecDeque};
use std::sync::{mpsc as std_mpsc, Arc, Mutex, MutexGuard, PoisonError};
use std::thread;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, Device, Host, SampleRate, StreamConfig};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use super::{
    AudioBackend, BackendError, BufferId, CaptureStream, PlaybackDevice, PlaybackSource,
};
use crate::audio::{DeviceKind, FrameFormat, DEFAULT_CHANNELS, DEFAULT_SAMPLE_RATE};

/// Seconds of captured audio kept before the oldest samples are discarded
const CAPTURE_RING_SECONDS: usize = 2;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Audio backend over the platform's default cpal host
pub struct CpalBackend {
    host: Host,
}

impl CpalBackend {
    pub fn new() -> Self {
        Self {
            host: cpal::default_host(),
        }
    }

    fn find_device(&self, kind: DeviceKind, name: &str) -> Result<Device, BackendError> {
        let mut devices = match kind {
            DeviceKind::Capture => self.host.input_devices(),
            DeviceKind::Playback => self.host.output_devices(),
        }
        .map_err(|e| BackendError::OpenFailed(e.to_string()))?;

        devices
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
            .ok_or_else(|| BackendError::DeviceNotFound(name.to_string()))
    }
}

impl Default for CpalBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// Run a stream on its own thread until the returned sender is dropped.
fn spawn_stream<F>(name: &str, build: F) -> Result<mpsc::Sender<()>, BackendError>
where
    F: FnOnce() -> Result<cpal::Stream, BackendError> + Send + 'static,
{
    let (ready_tx, ready_rx) = std_mpsc::sync_channel::<Result<(), BackendError>>(1);
    let (stop_tx, mut stop_rx) = mpsc::channel::<()>(1);

    let thread_name = name.to_string();
    thread::Builder::new()
        .name(thread_name.clone())
        .spawn(move || {
            let stream = match build().and_then(|stream| {
                stream
                    .play()
                    .map(|()| stream)
                    .map_err(|e| BackendError::Stream(e.to_string()))
            }) {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(()));
                    stream
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };

            // Block until every control sender is gone
            while stop_rx.blocking_recv().is_some() {}

            drop(stream);
            debug!(thread = %thread_name, "Stream thread stopped");
        })
        .map_err(|e| BackendError::OpenFailed(e.to_string()))?;

    ready_rx
        .recv()
        .map_err(|_| BackendError::OpenFailed("stream thread exited".into()))??;
    Ok(stop_tx)
}

impl AudioBackend for CpalBackend {
    fn device_names(&self, kind: DeviceKind) -> Result<Vec<String>, BackendError> {
        let devices = match kind {
            DeviceKind::Capture => self.host.input_devices(),
            DeviceKind::Playback => self.host.output_devices(),
        }
        .map_err(|e| BackendError::Stream(e.to_string()))?;
        Ok(devices.filter_map(|d| d.name().ok()).collect())
    }

    fn default_device(&self, kind: DeviceKind) -> Option<String> {
        match kind {
            DeviceKind::Capture => self.host.default_input_device(),
            DeviceKind::Playback => self.host.default_output_device(),
        }
        .and_then(|d| d.name().ok())
    }

    fn open_capture(
        &self,
        device: &str,
        format: FrameFormat,
    ) -> Result<Box<dyn CaptureStream>, BackendError> {
        let handle = self.find_device(DeviceKind::Capture, device)?;
        let config = StreamConfig {
            channels: u16::from(format.channels),
            sample_rate: SampleRate(format.sample_rate),
            buffer_size: BufferSize::Default,
        };

        let capacity = format.sample_rate as usize * usize::from(format.channels) * CAPTURE_RING_SECONDS;
        let ring = Arc::new(Mutex::new(VecDeque::with_capacity(capacity)));
        let sink = Arc::clone(&ring);

        let control = spawn_stream("vc-cpal-capture", move || {
            handle
                .build_input_stream(
                    &config,
                    move |data: &[f32], _| {
                        let mut ring = lock(&sink);
                        ring.extend(
                            data.iter()
                                .map(|&s| (s * 32767.0).clamp(-32768.0, 32767.0) as i16),
                        );
                        let excess = ring.len().saturating_sub(capacity);
                        ring.drain(..excess);
                    },
                    |err| error!("Audio capture stream error: {}", err),
                    None,
                )
                .map_err(|e| BackendError::OpenFailed(e.to_string()))
        })?;

        info!(device = %device, ?format, "cpal capture stream started");
        Ok(Box::new(CpalCapture {
            ring,
            channels: usize::from(format.channels),
            _control: control,
        }))
    }

    fn open_playback(&self, device: &str) -> Result<Box<dyn PlaybackDevice>, BackendError> {
        let handle = self.find_device(DeviceKind::Playback, device)?;
        let config = StreamConfig {
            channels: u16::from(DEFAULT_CHANNELS),
            sample_rate: SampleRate(DEFAULT_SAMPLE_RATE),
            buffer_size: BufferSize::Default,
        };

        let mixer = Arc::new(Mutex::new(Mixer::new(DEFAULT_SAMPLE_RATE)));
        let output = Arc::clone(&mixer);
        let out_channels = usize::from(DEFAULT_CHANNELS);

        let control = spawn_stream("vc-cpal-playback", move || {
            handle
                .build_output_stream(
                    &config,
                    move |data: &mut [f32], _| lock(&output).render(data, out_channels),
                    |err| error!("Audio playback stream error: {}", err),
                    None,
                )
                .map_err(|e| BackendError::OpenFailed(e.to_string()))
        })?;

        info!(device = %device, "cpal playback stream started");
        Ok(Box::new(CpalPlayback {
            mixer,
            _control: control,
        }))
    }
}

struct CpalCapture {
    ring: Arc<Mutex<VecDeque<i16>>>,
    channels: usize,
    _control: mpsc::Sender<()>,
}

impl CaptureStream for CpalCapture {
    fn available(&mut self) -> Result<usize, BackendError> {
        Ok(lock(&self.ring).len() / self.channels.max(1))
    }

    fn read(&mut self, out: &mut [i16]) -> Result<(), BackendError> {
        let mut ring = lock(&self.ring);
        if ring.len() < out.len() {
            return Err(BackendError::Stream("capture underrun".into()));
        }
        let n = out.len();
        for (slot, sample) in out.iter_mut().zip(ring.drain(..n)) {
            *slot = sample;
        }
        Ok(())
    }
}

struct QueuedBuffer {
    samples: Vec<i16>,
    channels: usize,
    sample_rate: u32,
}

#[derive(Default)]
struct SourceQueue {
    queue: VecDeque<BufferId>,
    processed: usize,
    /// Frame position within the current buffer, in buffer frames
    position: f64,
    buffers: HashMap<BufferId, QueuedBuffer>,
    playing: bool,
}

impl SourceQueue {
    /// Next stereo frame at `device_rate`, advancing across finished buffers.
    ///
    /// Buffers at other rates are stepped through at `rate / device_rate`
    /// frames per output frame, holding the nearest earlier sample.
    fn next_frame(&mut self, device_rate: u32) -> Option<(f32, f32)> {
        if !self.playing {
            return None;
        }
        loop {
            let Some(buffer) = self
                .queue
                .get(self.processed)
                .and_then(|id| self.buffers.get(id))
            else {
                self.playing = false;
                return None;
            };
            let channels = buffer.channels.max(1);
            let frames = buffer.samples.len() / channels;
            let index = self.position as usize;
            if index < frames {
                let base = index * channels;
                let left = f32::from(buffer.samples[base]) / 32768.0;
                let right = if channels > 1 {
                    f32::from(buffer.samples[base + 1]) / 32768.0
                } else {
                    left
                };
                self.position += f64::from(buffer.sample_rate) / f64::from(device_rate.max(1));
                return Some((left, right));
            }
            self.processed += 1;
            self.position -= frames as f64;
        }
    }
}

struct Mixer {
    device_rate: u32,
    sources: HashMap<u32, SourceQueue>,
    next_source: u32,
    next_buffer: BufferId,
}

impl Mixer {
    fn new(device_rate: u32) -> Self {
        Self {
            device_rate,
            sources: HashMap::new(),
            next_source: 0,
            next_buffer: 1,
        }
    }

    fn render(&mut self, data: &mut [f32], channels: usize) {
        let device_rate = self.device_rate;
        for frame in data.chunks_mut(channels.max(1)) {
            let (mut left, mut right) = (0.0f32, 0.0f32);
            for source in self.sources.values_mut() {
                if let Some((l, r)) = source.next_frame(device_rate) {
                    left += l;
                    right += r;
                }
            }
            match frame {
                [mono] => *mono = ((left + right) / 2.0).clamp(-1.0, 1.0),
                [l, r, rest @ ..] => {
                    *l = left.clamp(-1.0, 1.0);
                    *r = right.clamp(-1.0, 1.0);
                    rest.fill(0.0);
                }
                [] => {}
            }
        }
    }
}

struct CpalPlayback {
    mixer: Arc<Mutex<Mixer>>,
    _control: mpsc::Sender<()>,
}

impl PlaybackDevice for CpalPlayback {
    fn create_source(&mut self) -> Result<Box<dyn PlaybackSource>, BackendError> {
        let mut mixer = lock(&self.mixer);
        let id = mixer.next_source;
        mixer.next_source = mixer.next_source.wrapping_add(1);
        mixer.sources.insert(id, SourceQueue::default());
        Ok(Box::new(CpalSource {
            mixer: Arc::clone(&self.mixer),
            id,
        }))
    }
}

struct CpalSource {
    mixer: Arc<Mutex<Mixer>>,
    id: u32,
}

impl CpalSource {
    fn with<R>(&self, f: impl FnOnce(&mut SourceQueue) -> R) -> Option<R> {
        lock(&self.mixer).sources.get_mut(&self.id).map(f)
    }
}

impl PlaybackSource for CpalSource {
    fn processed(&mut self) -> usize {
        self.with(|s| s.processed).unwrap_or(0)
    }

    fn queued(&mut self) -> usize {
        self.with(|s| s.queue.len()).unwrap_or(0)
    }

    fn unqueue_processed(&mut self, count: usize) -> Vec<BufferId> {
        self.with(|s| {
            let n = count.min(s.processed);
            s.processed -= n;
            s.queue.drain(..n).collect()
        })
        .unwrap_or_default()
    }

    fn gen_buffer(&mut self) -> Result<BufferId, BackendError> {
        let mut mixer = lock(&self.mixer);
        let id = mixer.next_buffer;
        mixer.next_buffer = mixer.next_buffer.wrapping_add(1);
        let source = mixer
            .sources
            .get_mut(&self.id)
            .ok_or_else(|| BackendError::Stream("source deleted".into()))?;
        source.buffers.insert(
            id,
            QueuedBuffer {
                samples: Vec::new(),
                channels: 1,
                sample_rate: DEFAULT_SAMPLE_RATE,
            },
        );
        Ok(id)
    }

    fn delete_buffers(&mut self, ids: &[BufferId]) {
        self.with(|s| {
            for id in ids {
                s.buffers.remove(id);
            }
        });
    }

    fn buffer_data(
        &mut self,
        id: BufferId,
        samples: &[i16],
        channels: u8,
        sample_rate: u32,
    ) -> Result<(), BackendError> {
        if sample_rate == 0 {
            return Err(BackendError::Stream("zero sample rate".into()));
        }
        self.with(|s| {
            let buffer = s
                .buffers
                .get_mut(&id)
                .ok_or(BackendError::UnknownBuffer(id))?;
            buffer.samples.clear();
            buffer.samples.extend_from_slice(samples);
            buffer.channels = usize::from(channels);
            buffer.sample_rate = sample_rate;
            Ok(())
        })
        .unwrap_or(Err(BackendError::UnknownBuffer(id)))
    }

    fn queue_buffer(&mut self, id: BufferId) -> Result<(), BackendError> {
        self.with(|s| {
            if !s.buffers.contains_key(&id) {
                return Err(BackendError::UnknownBuffer(id));
            }
            s.queue.push_back(id);
            Ok(())
        })
        .unwrap_or(Err(BackendError::UnknownBuffer(id)))
    }

    fn is_playing(&mut self) -> bool {
        self.with(|s| s.playing).unwrap_or(false)
    }

    fn play(&mut self) -> Result<(), BackendError> {
        self.with(|s| s.playing = true)
            .ok_or_else(|| BackendError::Stream("source deleted".into()))
    }
}

impl Drop for CpalSource {
    fn drop(&mut self) {
        lock(&self.mixer).sources.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mixer_marks_finished_buffers_processed() {
        let mut source = SourceQueue::default();
        source.buffers.insert(
            1,
            QueuedBuffer {
                samples: vec![16384, -16384],
                channels: 2,
                sample_rate: 48000,
            },
        );
        source.buffers.insert(
            2,
            QueuedBuffer {
                samples: vec![8192],
                channels: 1,
                sample_rate: 48000,
            },
        );
        source.queue.extend([1, 2]);
        source.playing = true;

        let mut mixer = Mixer::new(48000);
        mixer.sources.insert(0, source);

        let mut out = [0.0f32; 6];
        mixer.render(&mut out, 2);
        assert_eq!(out, [0.5, -0.5, 0.25, 0.25, 0.0, 0.0]);

        let source = &mixer.sources[&0];
        assert_eq!(source.processed, 2);
        assert!(!source.playing);
    }

    #[test]
    fn test_lower_rate_buffer_is_stretched_to_device_rate() {
        let mut source = SourceQueue::default();
        source.buffers.insert(
            1,
            QueuedBuffer {
                samples: vec![16384, 8192],
                channels: 1,
                sample_rate: 24000,
            },
        );
        source.queue.push_back(1);
        source.playing = true;

        let mut mixer = Mixer::new(48000);
        mixer.sources.insert(0, source);

        let mut out = [0.0f32; 5];
        mixer.render(&mut out, 1);
        assert_eq!(out, [0.5, 0.5, 0.25, 0.25, 0.0]);
        assert_eq!(mixer.sources[&0].processed, 1);
    }
}
