//! In-memory audio backend
//!
//! Captured samples are injected with [`MockBackend::push_capture`] and
//! playback buffers are consumed on demand with
//! [`MockBackend::consume_playback`]. Every handle shares one state so tests
//! can observe how many physical devices are open at any time.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{
    AudioBackend, BackendError, BufferId, CaptureStream, PlaybackDevice, PlaybackSource,
};
use crate::audio::{DeviceKind, FrameFormat};

#[derive(Default)]
struct SourceState {
    queue: VecDeque<BufferId>,
    processed: usize,
    buffers: HashMap<BufferId, Vec<i16>>,
    playing: bool,
    last_written: Option<Vec<i16>>,
}

#[derive(Default)]
struct MockState {
    capture_names: Vec<String>,
    playback_names: Vec<String>,
    fail_capture_open: bool,
    fail_playback_open: bool,
    broken: HashSet<String>,
    capture_samples: VecDeque<i16>,
    open_captures: usize,
    open_playbacks: usize,
    capture_opens: usize,
    playback_opens: usize,
    capture_device: Option<(String, FrameFormat)>,
    playback_device: Option<String>,
    sources: HashMap<usize, SourceState>,
    next_source: usize,
    next_buffer: BufferId,
}

/// Snapshot of one live playback source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceStats {
    pub queued: usize,
    pub processed: usize,
    pub playing: bool,
    pub allocated_buffers: usize,
    pub last_written: Option<Vec<i16>>,
}

/// Audio backend that never touches hardware
#[derive(Clone)]
pub struct MockBackend {
    state: Arc<Mutex<MockState>>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    /// One capture and one playback device.
    pub fn new() -> Self {
        Self::with_devices(&["Mock Microphone"], &["Mock Speaker"])
    }

    pub fn with_devices(capture: &[&str], playback: &[&str]) -> Self {
        let state = MockState {
            capture_names: capture.iter().map(|s| (*s).to_string()).collect(),
            playback_names: playback.iter().map(|s| (*s).to_string()).collect(),
            next_buffer: 1,
            ..MockState::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make subsequent opens of `kind` fail.
    pub fn set_fail_open(&self, kind: DeviceKind, fail: bool) {
        let mut state = self.lock();
        match kind {
            DeviceKind::Capture => state.fail_capture_open = fail,
            DeviceKind::Playback => state.fail_playback_open = fail,
        }
    }

    /// Make opens of the named device fail while the others keep working.
    pub fn set_broken(&self, device: &str, broken: bool) {
        let mut state = self.lock();
        if broken {
            state.broken.insert(device.to_string());
        } else {
            state.broken.remove(device);
        }
    }

    /// Append interleaved samples to the capture device's input.
    pub fn push_capture(&self, samples: &[i16]) {
        self.lock().capture_samples.extend(samples.iter().copied());
    }

    /// Samples not yet read by the capture side.
    pub fn pending_capture(&self) -> usize {
        self.lock().capture_samples.len()
    }

    /// Physical handles of `kind` currently open.
    pub fn open_count(&self, kind: DeviceKind) -> usize {
        let state = self.lock();
        match kind {
            DeviceKind::Capture => state.open_captures,
            DeviceKind::Playback => state.open_playbacks,
        }
    }

    /// Physical opens of `kind` since creation.
    pub fn total_opens(&self, kind: DeviceKind) -> usize {
        let state = self.lock();
        match kind {
            DeviceKind::Capture => state.capture_opens,
            DeviceKind::Playback => state.playback_opens,
        }
    }

    /// Name and format of the most recently opened capture device.
    pub fn capture_device(&self) -> Option<(String, FrameFormat)> {
        self.lock().capture_device.clone()
    }

    /// Name of the most recently opened playback device.
    pub fn playback_device(&self) -> Option<String> {
        self.lock().playback_device.clone()
    }

    /// Mark up to `count` queued buffers of every source as played.
    /// A source whose queue drains completely stops playing.
    pub fn consume_playback(&self, count: usize) {
        let mut state = self.lock();
        for source in state.sources.values_mut() {
            source.processed = (source.processed + count).min(source.queue.len());
            if source.processed == source.queue.len() {
                source.playing = false;
            }
        }
    }

    pub fn source_stats(&self) -> Vec<SourceStats> {
        let state = self.lock();
        let mut ids: Vec<_> = state.sources.keys().copied().collect();
        ids.sort_unstable();
        ids.into_iter()
            .filter_map(|id| state.sources.get(&id))
            .map(|s| SourceStats {
                queued: s.queue.len(),
                processed: s.processed,
                playing: s.playing,
                allocated_buffers: s.buffers.len(),
                last_written: s.last_written.clone(),
            })
            .collect()
    }
}

impl AudioBackend for MockBackend {
    fn device_names(&self, kind: DeviceKind) -> Result<Vec<String>, BackendError> {
        let state = self.lock();
        Ok(match kind {
            DeviceKind::Capture => state.capture_names.clone(),
            DeviceKind::Playback => state.playback_names.clone(),
        })
    }

    fn default_device(&self, kind: DeviceKind) -> Option<String> {
        let state = self.lock();
        match kind {
            DeviceKind::Capture => state.capture_names.first().cloned(),
            DeviceKind::Playback => state.playback_names.first().cloned(),
        }
    }

    fn open_capture(
        &self,
        device: &str,
        format: FrameFormat,
    ) -> Result<Box<dyn CaptureStream>, BackendError> {
        let mut state = self.lock();
        if !state.capture_names.iter().any(|n| n == device) {
            return Err(BackendError::DeviceNotFound(device.to_string()));
        }
        if state.fail_capture_open || state.broken.contains(device) {
            return Err(BackendError::OpenFailed(device.to_string()));
        }
        state.open_captures += 1;
        state.capture_opens += 1;
        state.capture_device = Some((device.to_string(), format));
        Ok(Box::new(MockCaptureStream {
            state: self.state.clone(),
            channels: usize::from(format.channels.max(1)),
        }))
    }

    fn open_playback(&self, device: &str) -> Result<Box<dyn PlaybackDevice>, BackendError> {
        let mut state = self.lock();
        if !state.playback_names.iter().any(|n| n == device) {
            return Err(BackendError::DeviceNotFound(device.to_string()));
        }
        if state.fail_playback_open || state.broken.contains(device) {
            return Err(BackendError::OpenFailed(device.to_string()));
        }
        state.open_playbacks += 1;
        state.playback_opens += 1;
        state.playback_device = Some(device.to_string());
        Ok(Box::new(MockPlaybackDevice {
            state: self.state.clone(),
        }))
    }
}

struct MockCaptureStream {
    state: Arc<Mutex<MockState>>,
    channels: usize,
}

impl MockCaptureStream {
    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl CaptureStream for MockCaptureStream {
    fn available(&mut self) -> Result<usize, BackendError> {
        Ok(self.lock().capture_samples.len() / self.channels)
    }

    fn read(&mut self, out: &mut [i16]) -> Result<(), BackendError> {
        let mut state = self.lock();
        if state.capture_samples.len() < out.len() {
            return Err(BackendError::Stream("capture underrun".into()));
        }
        let n = out.len();
        for (slot, sample) in out.iter_mut().zip(state.capture_samples.drain(..n)) {
            *slot = sample;
        }
        Ok(())
    }
}

impl Drop for MockCaptureStream {
    fn drop(&mut self) {
        let mut state = self.lock();
        state.open_captures = state.open_captures.saturating_sub(1);
    }
}

struct MockPlaybackDevice {
    state: Arc<Mutex<MockState>>,
}

impl PlaybackDevice for MockPlaybackDevice {
    fn create_source(&mut self) -> Result<Box<dyn PlaybackSource>, BackendError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let id = state.next_source;
        state.next_source += 1;
        state.sources.insert(id, SourceState::default());
        Ok(Box::new(MockSource {
            state: self.state.clone(),
            id,
        }))
    }
}

impl Drop for MockPlaybackDevice {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.open_playbacks = state.open_playbacks.saturating_sub(1);
    }
}

struct MockSource {
    state: Arc<Mutex<MockState>>,
    id: usize,
}

impl MockSource {
    fn with<R>(&self, f: impl FnOnce(&mut SourceState, &mut BufferId) -> R) -> Option<R> {
        let mut guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let state = &mut *guard;
        state
            .sources
            .get_mut(&self.id)
            .map(|source| f(source, &mut state.next_buffer))
    }
}

impl PlaybackSource for MockSource {
    fn processed(&mut self) -> usize {
        self.with(|s, _| s.processed).unwrap_or(0)
    }

    fn queued(&mut self) -> usize {
        self.with(|s, _| s.queue.len()).unwrap_or(0)
    }

    fn unqueue_processed(&mut self, count: usize) -> Vec<BufferId> {
        self.with(|s, _| {
            let n = count.min(s.processed);
            s.processed -= n;
            s.queue.drain(..n).collect()
        })
        .unwrap_or_default()
    }

    fn gen_buffer(&mut self) -> Result<BufferId, BackendError> {
        self.with(|s, next| {
            let id = *next;
            *next += 1;
            s.buffers.insert(id, Vec::new());
            id
        })
        .ok_or_else(|| BackendError::Stream("source deleted".into()))
    }

    fn delete_buffers(&mut self, ids: &[BufferId]) {
        self.with(|s, _| {
            for id in ids {
                s.buffers.remove(id);
            }
        });
    }

    fn buffer_data(
        &mut self,
        id: BufferId,
        samples: &[i16],
        _channels: u8,
        _sample_rate: u32,
    ) -> Result<(), BackendError> {
        self.with(|s, _| match s.buffers.get_mut(&id) {
            Some(data) => {
                data.clear();
                data.extend_from_slice(samples);
                Ok(())
            }
            None => Err(BackendError::UnknownBuffer(id)),
        })
        .unwrap_or(Err(BackendError::UnknownBuffer(id)))
    }

    fn queue_buffer(&mut self, id: BufferId) -> Result<(), BackendError> {
        self.with(|s, _| {
            let Some(data) = s.buffers.get(&id) else {
                return Err(BackendError::UnknownBuffer(id));
            };
            s.last_written = Some(data.clone());
            s.queue.push_back(id);
            Ok(())
        })
        .unwrap_or(Err(BackendError::UnknownBuffer(id)))
    }

    fn is_playing(&mut self) -> bool {
        self.with(|s, _| s.playing).unwrap_or(false)
    }

    fn play(&mut self) -> Result<(), BackendError> {
        self.with(|s, _| s.playing = true)
            .ok_or_else(|| BackendError::Stream("source deleted".into()))
    }
}

impl Drop for MockSource {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.sources.remove(&self.id);
    }
}
