//! Virtual Device Table
//!
//! Every call opens its own capture and playback device here. Devices of one
//! kind share a single physical backend handle that is opened with the first
//! virtual device and closed with the last one. Each kind is guarded by its
//! own mutex, which is never held while calling a frame handler.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info, warn};

use super::backend::{AudioBackend, CaptureStream, PlaybackDevice};
use super::playback::PlaybackQueue;
use super::slots::{DeviceHandle, SlotArena};
use super::vad::VoiceActivity;
use super::{DeviceError, DeviceInfo, DeviceKind, FrameFormat, MAX_DEVICES};

/// Receives every captured frame delivered to a virtual input device.
pub type FrameHandler = Arc<dyn Fn(&[i16], FrameFormat) + Send + Sync>;

/// Default VAD hold window in milliseconds
pub const DEFAULT_VAD_HOLD_MS: u32 = 250;

/// A physical handle shared by one or more virtual devices.
///
/// The user count lives inside the handle's `Option`, so a handle exists
/// exactly while at least one virtual device uses it.
pub(super) struct SharedPhysical<H> {
    pub(super) handle: H,
    users: NonZeroUsize,
}

impl<H> SharedPhysical<H> {
    const fn new(handle: H) -> Self {
        Self {
            handle,
            users: NonZeroUsize::MIN,
        }
    }

    fn acquire(&mut self) {
        self.users = self.users.saturating_add(1);
    }

    /// Drop one user. Hands the physical handle back when it was the last.
    fn release(slot: &mut Option<Self>) -> Option<H> {
        let shared = slot.as_mut()?;
        match NonZeroUsize::new(shared.users.get() - 1) {
            Some(users) => {
                shared.users = users;
                None
            }
            None => slot.take().map(|s| s.handle),
        }
    }

    const fn users(&self) -> usize {
        self.users.get()
    }
}

/// Open physical capture device and the format every input device shares
pub(super) struct CapturePhysical {
    /// `None` only after a failed backend switch left no usable device.
    pub(super) stream: Option<Box<dyn CaptureStream>>,
    pub(super) format: FrameFormat,
}

pub(super) struct InputDevice {
    pub(super) muted: bool,
    pub(super) vad: VoiceActivity,
    pub(super) handler: Option<FrameHandler>,
}

struct PlaybackPhysical {
    /// `None` only after a failed backend switch left no usable device.
    device: Option<Box<dyn PlaybackDevice>>,
}

struct OutputDevice {
    muted: bool,
    queue: PlaybackQueue,
}

/// Enumerated device names and the selection physical opens use
struct Selection {
    names: Vec<String>,
    default: Option<usize>,
    primary: usize,
}

impl Selection {
    fn enumerate(backend: &dyn AudioBackend, kind: DeviceKind) -> Self {
        let names = backend.device_names(kind).unwrap_or_else(|e| {
            warn!(%kind, error = %e, "Failed to enumerate audio devices");
            Vec::new()
        });
        let default = backend
            .default_device(kind)
            .and_then(|d| names.iter().position(|n| *n == d));
        debug!(%kind, count = names.len(), ?default, "Enumerated audio devices");
        Self {
            names,
            default,
            primary: default.unwrap_or(0),
        }
    }

    fn check(&self, selection: usize) -> Result<(), DeviceError> {
        if selection < self.names.len() {
            Ok(())
        } else {
            Err(DeviceError::InvalidSelection)
        }
    }

    fn primary_name(&self) -> Option<&str> {
        self.names.get(self.primary).map(String::as_str)
    }

    fn infos(&self) -> Vec<DeviceInfo> {
        self.names
            .iter()
            .enumerate()
            .map(|(index, name)| DeviceInfo {
                index,
                name: name.clone(),
                is_default: self.default == Some(index),
                is_primary: self.primary == index,
            })
            .collect()
    }
}

pub(super) struct CaptureTable {
    pub(super) devices: SlotArena<InputDevice>,
    pub(super) physical: Option<SharedPhysical<CapturePhysical>>,
    pub(super) last_volume: f32,
    selection: Selection,
}

struct PlaybackTable {
    devices: SlotArena<OutputDevice>,
    physical: Option<SharedPhysical<PlaybackPhysical>>,
    selection: Selection,
}

/// Per-kind virtual device slots over one shared physical device each
pub struct VirtualDeviceTable {
    backend: Arc<dyn AudioBackend>,
    vad_hold_ms: u32,
    capture: Mutex<CaptureTable>,
    playback: Mutex<PlaybackTable>,
}

impl VirtualDeviceTable {
    /// Enumerate physical devices and create empty tables.
    pub fn new(backend: Arc<dyn AudioBackend>) -> Self {
        let capture = Selection::enumerate(backend.as_ref(), DeviceKind::Capture);
        let playback = Selection::enumerate(backend.as_ref(), DeviceKind::Playback);

        Self {
            backend,
            vad_hold_ms: DEFAULT_VAD_HOLD_MS,
            capture: Mutex::new(CaptureTable {
                devices: SlotArena::new(DeviceKind::Capture, MAX_DEVICES),
                physical: None,
                last_volume: 0.0,
                selection: capture,
            }),
            playback: Mutex::new(PlaybackTable {
                devices: SlotArena::new(DeviceKind::Playback, MAX_DEVICES),
                physical: None,
                selection: playback,
            }),
        }
    }

    /// Set how long VAD keeps reporting voice after the last loud frame.
    #[must_use]
    pub const fn with_vad_hold(mut self, hold_ms: u32) -> Self {
        self.vad_hold_ms = hold_ms;
        self
    }

    pub(super) fn lock_capture(&self) -> Result<MutexGuard<'_, CaptureTable>, DeviceError> {
        self.capture.lock().map_err(|_| {
            warn!("Capture table lock poisoned");
            DeviceError::InternalError
        })
    }

    fn lock_playback(&self) -> Result<MutexGuard<'_, PlaybackTable>, DeviceError> {
        self.playback.lock().map_err(|_| {
            warn!("Playback table lock poisoned");
            DeviceError::InternalError
        })
    }

    /// Physical devices of `kind` in selection order
    pub fn list_devices(&self, kind: DeviceKind) -> Result<Vec<DeviceInfo>, DeviceError> {
        Ok(match kind {
            DeviceKind::Capture => self.lock_capture()?.selection.infos(),
            DeviceKind::Playback => self.lock_playback()?.selection.infos(),
        })
    }

    pub fn selection_valid(&self, kind: DeviceKind, selection: usize) -> Result<(), DeviceError> {
        match kind {
            DeviceKind::Capture => self.lock_capture()?.selection.check(selection),
            DeviceKind::Playback => self.lock_playback()?.selection.check(selection),
        }
    }

    /// Choose the device used the next time the physical backend is opened.
    pub fn set_primary(&self, kind: DeviceKind, selection: usize) -> Result<(), DeviceError> {
        match kind {
            DeviceKind::Capture => {
                let mut table = self.lock_capture()?;
                table.selection.check(selection)?;
                table.selection.primary = selection;
            }
            DeviceKind::Playback => {
                let mut table = self.lock_playback()?;
                table.selection.check(selection)?;
                table.selection.primary = selection;
            }
        }
        debug!(%kind, selection, "Primary audio device set");
        Ok(())
    }

    pub fn primary(&self, kind: DeviceKind) -> Result<usize, DeviceError> {
        Ok(match kind {
            DeviceKind::Capture => self.lock_capture()?.selection.primary,
            DeviceKind::Playback => self.lock_playback()?.selection.primary,
        })
    }

    /// Open a virtual device of either kind.
    ///
    /// `vad_threshold` and `handler` only apply to capture devices.
    pub fn open(
        &self,
        kind: DeviceKind,
        format: FrameFormat,
        vad_threshold: Option<f32>,
        handler: Option<FrameHandler>,
    ) -> Result<DeviceHandle, DeviceError> {
        match kind {
            DeviceKind::Capture => self.open_input(format, vad_threshold, handler),
            DeviceKind::Playback => self.open_output(format),
        }
    }

    /// Open a virtual capture device.
    ///
    /// When the physical capture device is already open, its format replaces
    /// `format`; use [`Self::frame_format`] to learn the format in effect.
    pub fn open_input(
        &self,
        format: FrameFormat,
        vad_threshold: Option<f32>,
        handler: Option<FrameHandler>,
    ) -> Result<DeviceHandle, DeviceError> {
        format.validate()?;

        let mut guard = self.lock_capture()?;
        let table = &mut *guard;
        if !table.devices.has_free() {
            return Err(DeviceError::AllDevicesBusy);
        }

        let format = match table.physical.as_mut() {
            Some(shared) => {
                shared.acquire();
                if shared.handle.format != format {
                    debug!(
                        requested = ?format,
                        negotiated = ?shared.handle.format,
                        "Capture format overridden by open physical device"
                    );
                }
                shared.handle.format
            }
            None => {
                let name = table
                    .selection
                    .primary_name()
                    .ok_or(DeviceError::FailedStart)?;
                let stream = self.backend.open_capture(name, format).map_err(|e| {
                    warn!(device = %name, error = %e, "Failed to open capture device");
                    DeviceError::FailedStart
                })?;
                info!(device = %name, ?format, "Physical capture device opened");
                table.physical = Some(SharedPhysical::new(CapturePhysical {
                    stream: Some(stream),
                    format,
                }));
                format
            }
        };

        let hold_samples = (format.sample_rate as usize * self.vad_hold_ms as usize) / 1000;
        let device = InputDevice {
            muted: false,
            vad: VoiceActivity::new(vad_threshold.unwrap_or(0.0), hold_samples),
            handler,
        };

        match table.devices.insert(device) {
            Ok(handle) => {
                debug!(slot = handle.index(), "Virtual capture device opened");
                Ok(handle)
            }
            Err(_) => {
                Self::release_capture(table);
                Err(DeviceError::AllDevicesBusy)
            }
        }
    }

    /// Open a virtual playback device with its own primed buffer queue.
    pub fn open_output(&self, format: FrameFormat) -> Result<DeviceHandle, DeviceError> {
        format.validate()?;

        let mut guard = self.lock_playback()?;
        let table = &mut *guard;
        if !table.devices.has_free() {
            return Err(DeviceError::AllDevicesBusy);
        }

        match table.physical.as_mut() {
            Some(shared) => shared.acquire(),
            None => {
                let name = table
                    .selection
                    .primary_name()
                    .ok_or(DeviceError::FailedStart)?;
                let device = self.backend.open_playback(name).map_err(|e| {
                    warn!(device = %name, error = %e, "Failed to open playback device");
                    DeviceError::FailedStart
                })?;
                info!(device = %name, "Physical playback device opened");
                table.physical = Some(SharedPhysical::new(PlaybackPhysical {
                    device: Some(device),
                }));
            }
        }

        let queue = table
            .physical
            .as_mut()
            .and_then(|shared| shared.handle.device.as_mut())
            .ok_or(DeviceError::FailedStart)
            .and_then(|device| {
                PlaybackQueue::open(device.as_mut(), format).map_err(|e| {
                    warn!(error = %e, "Failed to create playback source");
                    DeviceError::FailedStart
                })
            });

        let queue = match queue {
            Ok(queue) => queue,
            Err(e) => {
                Self::release_playback(table);
                return Err(e);
            }
        };

        match table.devices.insert(OutputDevice {
            muted: false,
            queue,
        }) {
            Ok(handle) => {
                debug!(slot = handle.index(), "Virtual playback device opened");
                Ok(handle)
            }
            Err(device) => {
                drop(device);
                Self::release_playback(table);
                Err(DeviceError::AllDevicesBusy)
            }
        }
    }

    fn release_capture(table: &mut CaptureTable) {
        if let Some(physical) = SharedPhysical::release(&mut table.physical) {
            drop(physical);
            table.last_volume = 0.0;
            info!("Physical capture device closed");
        }
    }

    fn release_playback(table: &mut PlaybackTable) {
        if let Some(physical) = SharedPhysical::release(&mut table.physical) {
            drop(physical);
            info!("Physical playback device closed");
        }
    }

    /// Close a virtual device; the physical device closes with the last user.
    pub fn close(&self, handle: DeviceHandle) -> Result<(), DeviceError> {
        match handle.kind() {
            DeviceKind::Capture => {
                let mut guard = self.lock_capture()?;
                let table = &mut *guard;
                let device = table
                    .devices
                    .remove(handle)
                    .ok_or(DeviceError::DeviceNotActive)?;
                drop(device);
                Self::release_capture(table);
            }
            DeviceKind::Playback => {
                let mut guard = self.lock_playback()?;
                let table = &mut *guard;
                let device = table
                    .devices
                    .remove(handle)
                    .ok_or(DeviceError::DeviceNotActive)?;
                // the source must go before the device it was created on
                drop(device);
                Self::release_playback(table);
            }
        }
        debug!(kind = %handle.kind(), slot = handle.index(), "Virtual device closed");
        Ok(())
    }

    /// Toggle mute; returns the new state.
    pub fn mute(&self, handle: DeviceHandle) -> Result<bool, DeviceError> {
        let muted = match handle.kind() {
            DeviceKind::Capture => {
                let mut table = self.lock_capture()?;
                let device = table
                    .devices
                    .get_mut(handle)
                    .ok_or(DeviceError::DeviceNotActive)?;
                device.muted = !device.muted;
                device.muted
            }
            DeviceKind::Playback => {
                let mut table = self.lock_playback()?;
                let device = table
                    .devices
                    .get_mut(handle)
                    .ok_or(DeviceError::DeviceNotActive)?;
                device.muted = !device.muted;
                device.muted
            }
        };
        debug!(kind = %handle.kind(), slot = handle.index(), muted, "Device mute toggled");
        Ok(muted)
    }

    pub fn is_muted(&self, handle: DeviceHandle) -> Result<bool, DeviceError> {
        match handle.kind() {
            DeviceKind::Capture => self
                .lock_capture()?
                .devices
                .get(handle)
                .map(|d| d.muted)
                .ok_or(DeviceError::DeviceNotActive),
            DeviceKind::Playback => self
                .lock_playback()?
                .devices
                .get(handle)
                .map(|d| d.muted)
                .ok_or(DeviceError::DeviceNotActive),
        }
    }

    /// Set the VAD threshold of a capture device. Negative values disable VAD.
    pub fn set_vad_threshold(&self, handle: DeviceHandle, value: f32) -> Result<(), DeviceError> {
        if handle.kind() != DeviceKind::Capture {
            return Err(DeviceError::InvalidSelection);
        }
        let mut table = self.lock_capture()?;
        let device = table
            .devices
            .get_mut(handle)
            .ok_or(DeviceError::DeviceNotActive)?;
        device.vad.set_threshold(value);
        debug!(slot = handle.index(), threshold = device.vad.threshold(), "VAD threshold set");
        Ok(())
    }

    pub fn vad_threshold(&self, handle: DeviceHandle) -> Result<f32, DeviceError> {
        if handle.kind() != DeviceKind::Capture {
            return Err(DeviceError::InvalidSelection);
        }
        self.lock_capture()?
            .devices
            .get(handle)
            .map(|d| d.vad.threshold())
            .ok_or(DeviceError::DeviceNotActive)
    }

    /// Format in effect for an open device.
    pub fn frame_format(&self, handle: DeviceHandle) -> Result<FrameFormat, DeviceError> {
        match handle.kind() {
            DeviceKind::Capture => {
                let table = self.lock_capture()?;
                table
                    .devices
                    .get(handle)
                    .ok_or(DeviceError::DeviceNotActive)?;
                table
                    .physical
                    .as_ref()
                    .map(|p| p.handle.format)
                    .ok_or(DeviceError::InternalError)
            }
            DeviceKind::Playback => self
                .lock_playback()?
                .devices
                .get(handle)
                .map(|d| d.queue.format())
                .ok_or(DeviceError::DeviceNotActive),
        }
    }

    /// Volume of the most recent captured frame (0-100).
    pub fn input_volume(&self) -> f32 {
        self.lock_capture().map(|t| t.last_volume).unwrap_or(0.0)
    }

    /// Virtual devices of `kind` currently open.
    pub fn open_count(&self, kind: DeviceKind) -> usize {
        match kind {
            DeviceKind::Capture => self.lock_capture().map(|t| t.devices.len()),
            DeviceKind::Playback => self.lock_playback().map(|t| t.devices.len()),
        }
        .unwrap_or(0)
    }

    /// Virtual devices sharing the physical device of `kind` (0 when closed).
    pub fn physical_users(&self, kind: DeviceKind) -> usize {
        match kind {
            DeviceKind::Capture => self
                .lock_capture()
                .map(|t| t.physical.as_ref().map_or(0, SharedPhysical::users)),
            DeviceKind::Playback => self
                .lock_playback()
                .map(|t| t.physical.as_ref().map_or(0, SharedPhysical::users)),
        }
        .unwrap_or(0)
    }

    /// Write decoded samples to a playback device.
    ///
    /// Returns [`DeviceError::Busy`] instead of blocking when the device's
    /// queue is saturated; the caller should drop the frame.
    pub fn write(
        &self,
        handle: DeviceHandle,
        samples: &[i16],
        channels: u8,
        sample_rate: u32,
    ) -> Result<(), DeviceError> {
        if handle.kind() != DeviceKind::Playback {
            return Err(DeviceError::InvalidSelection);
        }
        let mut table = self.lock_playback()?;
        let device = table
            .devices
            .get_mut(handle)
            .ok_or(DeviceError::DeviceNotActive)?;
        if device.muted {
            return Err(DeviceError::DeviceNotActive);
        }
        device.queue.write(samples, channels, sample_rate)
    }

    /// Move every open device of `kind` onto another physical device.
    ///
    /// Virtual devices keep their slots, mute state, and formats. When no
    /// device of `kind` is open this only changes the primary selection.
    /// If the new device cannot be opened the previous one is restored and
    /// [`DeviceError::FailedStart`] is returned.
    pub fn switch_backend(&self, kind: DeviceKind, selection: usize) -> Result<(), DeviceError> {
        match kind {
            DeviceKind::Capture => self.switch_capture(selection),
            DeviceKind::Playback => self.switch_playback(selection),
        }
    }

    fn switch_capture(&self, selection: usize) -> Result<(), DeviceError> {
        let mut guard = self.lock_capture()?;
        let table = &mut *guard;
        table.selection.check(selection)?;
        let previous = table.selection.primary;

        let Some(shared) = table.physical.as_mut() else {
            table.selection.primary = selection;
            info!(selection, "Capture device selected");
            return Ok(());
        };

        let format = shared.handle.format;
        // close first so only one physical capture handle ever exists
        drop(shared.handle.stream.take());

        let name = &table.selection.names[selection];
        match self.backend.open_capture(name, format) {
            Ok(stream) => {
                shared.handle.stream = Some(stream);
                table.selection.primary = selection;
                info!(device = %name, ?format, "Capture device switched");
                Ok(())
            }
            Err(e) => {
                warn!(device = %name, error = %e, "Failed to switch capture device");
                let old = &table.selection.names[previous];
                match self.backend.open_capture(old, format) {
                    Ok(stream) => shared.handle.stream = Some(stream),
                    Err(e) => {
                        warn!(device = %old, error = %e, "Failed to restore capture device");
                    }
                }
                Err(DeviceError::FailedStart)
            }
        }
    }

    fn switch_playback(&self, selection: usize) -> Result<(), DeviceError> {
        let mut guard = self.lock_playback()?;
        let table = &mut *guard;
        table.selection.check(selection)?;
        let previous = table.selection.primary;

        let Some(shared) = table.physical.as_mut() else {
            table.selection.primary = selection;
            info!(selection, "Playback device selected");
            return Ok(());
        };

        // sources belong to the old device and must go first
        for device in table.devices.values_mut() {
            device.queue.close_source();
        }
        drop(shared.handle.device.take());

        let name = &table.selection.names[selection];
        let result = match self.backend.open_playback(name) {
            Ok(device) => {
                shared.handle.device = Some(device);
                table.selection.primary = selection;
                info!(device = %name, "Playback device switched");
                Ok(())
            }
            Err(e) => {
                warn!(device = %name, error = %e, "Failed to switch playback device");
                let old = &table.selection.names[previous];
                match self.backend.open_playback(old) {
                    Ok(device) => shared.handle.device = Some(device),
                    Err(e) => {
                        warn!(device = %old, error = %e, "Failed to restore playback device");
                    }
                }
                Err(DeviceError::FailedStart)
            }
        };

        if let Some(physical) = shared.handle.device.as_mut() {
            for device in table.devices.values_mut() {
                if let Err(e) = device.queue.reopen(physical.as_mut()) {
                    warn!(error = %e, "Failed to recreate playback source");
                }
            }
        }

        result
    }
}
