//! Shared fixtures for call integration tests.
//!
//! [`RecordingEngine`] stands in for the protocol engine and keeps every
//! outbound request; [`Harness`] wires it to a call manager over a
//! [`MockBackend`].
#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tokio::sync::mpsc::Receiver;
use vc_call::audio::MockBackend;
use vc_call::call::{CallEngine, EngineError, PeerSlot};
use vc_call::{AudioSettings, CallEvent, CallManager, EventSender, FrameFormat, VirtualDeviceTable};

/// Outbound engine request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    Call { peer: PeerSlot, bit_rate: u32 },
    Answer { peer: PeerSlot, bit_rate: u32 },
    Cancel { peer: PeerSlot },
    SetBitRate { peer: PeerSlot, bit_rate: u32 },
}

#[derive(Default)]
pub struct RecordingEngine {
    calls: Mutex<Vec<EngineCall>>,
    frames: Mutex<Vec<(PeerSlot, usize, FrameFormat)>>,
    fail_next: Mutex<Option<EngineError>>,
}

impl RecordingEngine {
    pub fn requests(&self) -> Vec<EngineCall> {
        self.calls.lock().unwrap().clone()
    }

    /// `(peer, samples, format)` of every frame sent.
    pub fn frames(&self) -> Vec<(PeerSlot, usize, FrameFormat)> {
        self.frames.lock().unwrap().clone()
    }

    /// Make the next call/answer/cancel/bit-rate request fail.
    pub fn fail_next(&self, error: EngineError) {
        *self.fail_next.lock().unwrap() = Some(error);
    }

    fn record(&self, call: EngineCall) -> Result<(), EngineError> {
        if let Some(e) = self.fail_next.lock().unwrap().take() {
            return Err(e);
        }
        self.calls.lock().unwrap().push(call);
        Ok(())
    }
}

impl CallEngine for RecordingEngine {
    fn call(&self, peer: PeerSlot, bit_rate: u32) -> Result<(), EngineError> {
        self.record(EngineCall::Call { peer, bit_rate })
    }

    fn answer(&self, peer: PeerSlot, bit_rate: u32) -> Result<(), EngineError> {
        self.record(EngineCall::Answer { peer, bit_rate })
    }

    fn cancel(&self, peer: PeerSlot) -> Result<(), EngineError> {
        self.record(EngineCall::Cancel { peer })
    }

    fn set_audio_bit_rate(&self, peer: PeerSlot, bit_rate: u32) -> Result<(), EngineError> {
        self.record(EngineCall::SetBitRate { peer, bit_rate })
    }

    fn send_audio_frame(
        &self,
        peer: PeerSlot,
        samples: &[i16],
        format: FrameFormat,
    ) -> Result<(), EngineError> {
        self.frames
            .lock()
            .unwrap()
            .push((peer, samples.len(), format));
        Ok(())
    }
}

pub struct Harness {
    pub manager: CallManager,
    pub backend: MockBackend,
    pub engine: Arc<RecordingEngine>,
    pub events: Receiver<CallEvent>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_backend(MockBackend::new())
    }

    pub fn with_backend(backend: MockBackend) -> Self {
        let devices = Arc::new(VirtualDeviceTable::new(Arc::new(backend.clone())));
        Self::with_devices(backend, devices, &AudioSettings::default())
    }

    pub fn with_devices(
        backend: MockBackend,
        devices: Arc<VirtualDeviceTable>,
        settings: &AudioSettings,
    ) -> Self {
        let engine = Arc::new(RecordingEngine::default());
        let (sender, events) = EventSender::channel(256);
        let manager = CallManager::new(engine.clone(), devices, sender, settings);
        Self {
            manager,
            backend,
            engine,
            events,
        }
    }

    /// Every event emitted so far.
    pub fn drain_events(&mut self) -> Vec<CallEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }
}

/// Poll `check` until it holds or about two seconds pass.
pub fn wait_for(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..400 {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    check()
}
