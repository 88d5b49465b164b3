//! Call Manager
//!
//! Drives each peer's call through its state machine from user commands and
//! engine callbacks, opening the call's audio devices when it starts and
//! closing them when it ends.
//!
//! Lock order: the registry lock is taken before any device table lock and
//! never the other way round. Capture handlers only talk to the engine.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

use super::engine::{CallEngine, CallStateFlags, EngineError};
use super::registry::CallRegistry;
use super::state::{Call, CallStateError, CallStatus, Direction, OfferedMedia, Transition};
use super::PeerSlot;
use crate::audio::{
    DeviceError, DeviceHandle, DeviceInfo, DeviceKind, FrameFormat, FrameHandler,
    VirtualDeviceTable,
};
use crate::config::{AudioSettings, MAX_AUDIO_BIT_RATE, MIN_AUDIO_BIT_RATE};
use crate::events::{CallEvent, EventSender};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    #[error(transparent)]
    State(#[from] CallStateError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("Audio device error: {0}")]
    Device(#[from] DeviceError),
    #[error("Call registry lock poisoned")]
    Poisoned,
}

/// Snapshot of one peer's call for the UI
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallInfo {
    pub peer: PeerSlot,
    pub status: CallStatus,
    pub direction: Option<Direction>,
    pub offered: Option<OfferedMedia>,
    pub input: Option<DeviceHandle>,
    pub output: Option<DeviceHandle>,
    pub input_muted: bool,
    pub output_muted: bool,
    /// Last captured frame volume (0-100)
    pub input_volume: f32,
    pub vad_threshold: Option<f32>,
    pub audio_bit_rate: u32,
    pub duration_secs: Option<i64>,
}

pub struct CallManager {
    engine: Arc<dyn CallEngine>,
    devices: Arc<VirtualDeviceTable>,
    events: EventSender,
    vad_threshold: f32,
    calls: Mutex<CallRegistry>,
}

impl CallManager {
    pub fn new(
        engine: Arc<dyn CallEngine>,
        devices: Arc<VirtualDeviceTable>,
        events: EventSender,
        settings: &AudioSettings,
    ) -> Self {
        Self {
            engine,
            devices,
            events,
            vad_threshold: settings.vad_threshold,
            calls: Mutex::new(CallRegistry::new(
                settings.audio_bit_rate,
                settings.frame_format(),
            )),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, CallRegistry>, CallError> {
        self.calls.lock().map_err(|_| {
            error!("Call registry lock poisoned");
            CallError::Poisoned
        })
    }

    pub const fn devices(&self) -> &Arc<VirtualDeviceTable> {
        &self.devices
    }

    pub fn status(&self, peer: PeerSlot) -> CallStatus {
        self.lock()
            .ok()
            .and_then(|calls| calls.get(peer).map(Call::status))
            .unwrap_or_default()
    }

    pub fn call_info(&self, peer: PeerSlot) -> Option<CallInfo> {
        let calls = self.lock().ok()?;
        let call = calls.get(peer)?;
        let muted = |handle| self.devices.is_muted(handle).unwrap_or(false);

        Some(CallInfo {
            peer,
            status: call.status(),
            direction: call.direction(),
            offered: call.offered(),
            input: call.input(),
            output: call.output(),
            input_muted: call.input().is_some_and(muted),
            output_muted: call.output().is_some_and(muted),
            input_volume: if call.status() == CallStatus::Active {
                self.devices.input_volume()
            } else {
                0.0
            },
            vad_threshold: call
                .input()
                .and_then(|h| self.devices.vad_threshold(h).ok()),
            audio_bit_rate: call.audio_bit_rate(),
            duration_secs: call.duration_secs(),
        })
    }

    // ========================================================================
    // Commands
    // ========================================================================

    /// Ring `peer`.
    pub fn place_call(&self, peer: PeerSlot) -> Result<(), CallError> {
        let mut calls = self.lock()?;
        let call = calls.get_or_create(peer)?;
        call.status().apply(Transition::Ring)?;

        self.engine.call(peer, call.audio_bit_rate())?;

        call.transition(Transition::Ring)?;
        call.direction = Some(Direction::Outgoing);
        call.offered = Some(OfferedMedia {
            audio: true,
            video: false,
        });
        info!(peer, bit_rate = call.audio_bit_rate(), "Calling");
        self.events.emit(CallEvent::Ringing { peer });
        Ok(())
    }

    /// Accept an incoming call and start it.
    pub fn answer(&self, peer: PeerSlot) -> Result<(), CallError> {
        let mut calls = self.lock()?;
        let call = calls.get_mut(peer).ok_or(CallStateError::NotIncoming)?;
        if call.status() != CallStatus::Pending || call.direction() != Some(Direction::Incoming) {
            return Err(CallStateError::NotIncoming.into());
        }

        self.engine.answer(peer, call.audio_bit_rate())?;
        self.start(peer, call)
    }

    /// Turn down a pending call. Does nothing when there is no call.
    pub fn reject(&self, peer: PeerSlot) -> Result<(), CallError> {
        self.cancel_pending(peer)
    }

    /// Withdraw a pending call. Does nothing when there is no call.
    pub fn cancel(&self, peer: PeerSlot) -> Result<(), CallError> {
        self.cancel_pending(peer)
    }

    fn cancel_pending(&self, peer: PeerSlot) -> Result<(), CallError> {
        let mut calls = self.lock()?;
        let Some(call) = calls.get_mut(peer) else {
            return Ok(());
        };
        match call.status() {
            CallStatus::None => Ok(()),
            CallStatus::Pending => self.cancel_call(peer, call, true),
            state => Err(CallStateError::InvalidTransition {
                state,
                transition: Transition::Cancel,
            }
            .into()),
        }
    }

    /// End the call with `peer`, whether it has started or is still ringing.
    pub fn hangup(&self, peer: PeerSlot) -> Result<(), CallError> {
        let mut calls = self.lock()?;
        let call = calls.get_mut(peer).ok_or(CallStateError::NoCall)?;
        match call.status() {
            CallStatus::Active => self.stop(peer, call, true),
            CallStatus::Pending => self.cancel_call(peer, call, true),
            CallStatus::None => Err(CallStateError::InvalidTransition {
                state: CallStatus::None,
                transition: Transition::Stop,
            }
            .into()),
        }
    }

    /// Toggle the call's microphone; returns the new mute state.
    pub fn mute_input(&self, peer: PeerSlot) -> Result<bool, CallError> {
        let handle = self.active_device(peer, DeviceKind::Capture)?;
        let muted = self.devices.mute(handle)?;
        info!(peer, muted, "Input mute toggled");
        Ok(muted)
    }

    /// Toggle the call's speaker; returns the new mute state.
    pub fn mute_output(&self, peer: PeerSlot) -> Result<bool, CallError> {
        let handle = self.active_device(peer, DeviceKind::Playback)?;
        let muted = self.devices.mute(handle)?;
        info!(peer, muted, "Output mute toggled");
        Ok(muted)
    }

    /// Set the VAD sensitivity of the call's microphone (0 disables VAD).
    pub fn set_vad_threshold(&self, peer: PeerSlot, value: f32) -> Result<(), CallError> {
        let handle = self.active_device(peer, DeviceKind::Capture)?;
        self.devices.set_vad_threshold(handle, value)?;
        Ok(())
    }

    fn active_device(&self, peer: PeerSlot, kind: DeviceKind) -> Result<DeviceHandle, CallError> {
        let calls = self.lock()?;
        let call = calls
            .get(peer)
            .filter(|c| c.status() == CallStatus::Active)
            .ok_or(CallStateError::NotActive)?;
        let handle = match kind {
            DeviceKind::Capture => call.input(),
            DeviceKind::Playback => call.output(),
        };
        Ok(handle.ok_or(DeviceError::DeviceNotActive)?)
    }

    pub fn audio_bit_rate(&self, peer: PeerSlot) -> Result<u32, CallError> {
        let calls = self.lock()?;
        Ok(calls
            .get(peer)
            .map_or(calls.default_bit_rate(), Call::audio_bit_rate))
    }

    /// Change the audio bit rate (kbit/s); the engine is told when a call is active.
    pub fn set_audio_bit_rate(&self, peer: PeerSlot, bit_rate: u32) -> Result<(), CallError> {
        if !(MIN_AUDIO_BIT_RATE..=MAX_AUDIO_BIT_RATE).contains(&bit_rate) {
            return Err(EngineError::InvalidBitRate.into());
        }
        let mut calls = self.lock()?;
        let call = calls.get_or_create(peer)?;
        if call.status() == CallStatus::Active {
            self.engine.set_audio_bit_rate(peer, bit_rate)?;
        }
        call.audio_bit_rate = bit_rate;
        info!(peer, bit_rate, "Audio bit rate set");
        self.events.emit(CallEvent::BitRateChanged { peer, bit_rate });
        Ok(())
    }

    pub fn list_devices(&self, kind: DeviceKind) -> Result<Vec<DeviceInfo>, CallError> {
        Ok(self.devices.list_devices(kind)?)
    }

    /// Move every call's devices of `kind` onto physical device `selection`.
    pub fn switch_device(&self, kind: DeviceKind, selection: usize) -> Result<(), CallError> {
        self.devices.switch_backend(kind, selection)?;
        self.events.emit(CallEvent::DeviceSwitched { kind, selection });
        Ok(())
    }

    /// End any call with `peer` and forget the peer.
    pub fn remove_peer(&self, peer: PeerSlot) -> Result<(), CallError> {
        let mut calls = self.lock()?;
        if let Some(call) = calls.get_mut(peer) {
            match call.status() {
                CallStatus::Active => self.stop(peer, call, true)?,
                CallStatus::Pending => self.cancel_call(peer, call, true)?,
                CallStatus::None => {}
            }
        }
        calls.remove(peer);
        debug!(peer, "Peer removed from call registry");
        Ok(())
    }

    /// End every active or pending call.
    pub fn end_all(&self) -> Result<(), CallError> {
        let mut calls = self.lock()?;
        let peers: Vec<PeerSlot> = calls
            .iter()
            .filter(|(_, call)| call.status() != CallStatus::None)
            .map(|(peer, _)| peer)
            .collect();

        for peer in peers {
            let Some(call) = calls.get_mut(peer) else { continue };
            let result = match call.status() {
                CallStatus::Active => self.stop(peer, call, true),
                _ => self.cancel_call(peer, call, true),
            };
            if let Err(e) = result {
                warn!(peer, error = %e, "Failed to end call");
            }
        }
        Ok(())
    }

    // ========================================================================
    // Engine callbacks
    // ========================================================================

    /// Inbound call notification.
    pub fn on_call(&self, peer: PeerSlot, audio: bool, video: bool) -> Result<(), CallError> {
        let mut calls = self.lock()?;
        let call = calls.get_or_create(peer)?;
        if let Err(e) = call.transition(Transition::Ring) {
            warn!(peer, error = %e, "Ignoring call from peer already in a call");
            return Err(e.into());
        }
        call.direction = Some(Direction::Incoming);
        call.offered = Some(OfferedMedia { audio, video });
        info!(peer, audio, video, "Incoming call");
        self.events.emit(CallEvent::IncomingCall { peer, audio, video });
        Ok(())
    }

    /// Engine session state change.
    ///
    /// A terminal state ends the call. Any other state starts a pending call;
    /// if its devices fail to open it stays pending.
    pub fn on_call_state(&self, peer: PeerSlot, state: CallStateFlags) -> Result<(), CallError> {
        let mut calls = self.lock()?;
        let not_pending = CallStateError::InvalidTransition {
            state: CallStatus::None,
            transition: Transition::Start,
        };

        if state.is_terminal() {
            if state.contains(CallStateFlags::ERROR) {
                warn!(peer, ?state, "Call ended with an error");
                self.events.emit(CallEvent::CallError {
                    peer,
                    message: "Call error".into(),
                });
            }
            let Some(call) = calls.get_mut(peer) else {
                debug!(peer, ?state, "Terminal state for unknown call");
                return Ok(());
            };
            return match call.status() {
                CallStatus::Active => self.stop(peer, call, false),
                CallStatus::Pending => self.cancel_call(peer, call, false),
                CallStatus::None => Ok(()),
            };
        }

        let Some(call) = calls.get_mut(peer) else {
            return Err(not_pending.into());
        };
        match call.status() {
            CallStatus::Pending => {
                self.start(peer, call)?;
                call.protocol_state = state;
                Ok(())
            }
            CallStatus::Active => {
                debug!(peer, ?state, "Call state changed");
                call.protocol_state = state;
                Ok(())
            }
            CallStatus::None => Err(not_pending.into()),
        }
    }

    /// Decoded audio from `peer`.
    ///
    /// Frames for a call that is not active, or whose speaker is muted, are
    /// discarded. A full playback queue returns [`DeviceError::Busy`] and the
    /// frame is dropped.
    pub fn on_audio_receive_frame(
        &self,
        peer: PeerSlot,
        samples: &[i16],
        channels: u8,
        sample_rate: u32,
    ) -> Result<(), CallError> {
        let output = {
            let calls = self.lock()?;
            calls
                .get(peer)
                .filter(|c| c.status() == CallStatus::Active)
                .and_then(Call::output)
        };
        let Some(output) = output else {
            trace!(peer, "Discarding frame for inactive call");
            return Ok(());
        };

        match self.devices.write(output, samples, channels, sample_rate) {
            Ok(()) | Err(DeviceError::DeviceNotActive) => Ok(()),
            Err(DeviceError::Busy) => {
                trace!(peer, "Playback queue full, dropping frame");
                Err(DeviceError::Busy.into())
            }
            Err(e) => {
                debug!(peer, error = %e, "Failed to play received frame");
                Err(e.into())
            }
        }
    }

    /// The engine changed the bit rate; store it and acknowledge.
    pub fn on_audio_bit_rate(&self, peer: PeerSlot, bit_rate: u32) -> Result<(), CallError> {
        let mut calls = self.lock()?;
        calls.get_or_create(peer)?.audio_bit_rate = bit_rate;
        debug!(peer, bit_rate, "Peer audio bit rate changed");
        self.events.emit(CallEvent::BitRateChanged { peer, bit_rate });

        self.engine.set_audio_bit_rate(peer, bit_rate).map_err(|e| {
            warn!(peer, bit_rate, error = %e, "Failed to acknowledge bit rate");
            CallError::from(e)
        })
    }

    // ========================================================================
    // Transitions with side effects
    // ========================================================================

    fn start(&self, peer: PeerSlot, call: &mut Call) -> Result<(), CallError> {
        call.status().apply(Transition::Start)?;

        let engine = Arc::clone(&self.engine);
        let handler: FrameHandler = Arc::new(move |samples: &[i16], format: FrameFormat| {
            if let Err(e) = engine.send_audio_frame(peer, samples, format) {
                trace!(peer, error = %e, "Failed to send audio frame");
            }
        });

        let input = self
            .devices
            .open_input(call.format(), Some(self.vad_threshold), Some(handler))
            .map_err(|e| self.start_failed(peer, e))?;

        let output = match self.devices.open_output(call.format()) {
            Ok(handle) => handle,
            Err(e) => {
                if let Err(close) = self.devices.close(input) {
                    warn!(peer, error = %close, "Failed to close input device");
                }
                return Err(self.start_failed(peer, e));
            }
        };

        call.transition(Transition::Start)?;
        call.input = Some(input);
        call.output = Some(output);
        call.started_at = Some(Utc::now());

        info!(peer, bit_rate = call.audio_bit_rate(), "Call started");
        self.events.emit(CallEvent::CallStarted { peer });
        Ok(())
    }

    fn start_failed(&self, peer: PeerSlot, e: DeviceError) -> CallError {
        warn!(peer, error = %e, "Failed to open call audio devices");
        self.events.emit(CallEvent::CallError {
            peer,
            message: format!("Failed to start audio: {e}"),
        });
        CallError::Device(e)
    }

    /// `Active -> None`. The engine is told to cancel when the session is
    /// still live on its side.
    fn stop(&self, peer: PeerSlot, call: &mut Call, notify_engine: bool) -> Result<(), CallError> {
        call.transition(Transition::Stop)?;

        for handle in [call.input.take(), call.output.take()].into_iter().flatten() {
            if let Err(e) = self.devices.close(handle) {
                warn!(peer, kind = %handle.kind(), error = %e, "Failed to close call device");
            }
        }

        if notify_engine {
            if let Err(e) = self.engine.cancel(peer) {
                warn!(peer, error = %e, "Engine failed to end call");
            }
        }

        info!(peer, "Call ended");
        self.events.emit(CallEvent::CallEnded { peer });
        Ok(())
    }

    /// `Pending -> None`.
    fn cancel_call(
        &self,
        peer: PeerSlot,
        call: &mut Call,
        notify_engine: bool,
    ) -> Result<(), CallError> {
        call.transition(Transition::Cancel)?;

        if notify_engine {
            if let Err(e) = self.engine.cancel(peer) {
                warn!(peer, error = %e, "Engine failed to cancel call");
            }
        }

        info!(peer, "Call cancelled");
        self.events.emit(CallEvent::CallCancelled { peer });
        Ok(())
    }
}
