//! Audio system lifecycle: device table plus capture thread.

use std::sync::Arc;

use tracing::{info, warn};

use super::backend::AudioBackend;
use super::capture::CaptureScheduler;
use super::table::VirtualDeviceTable;
use super::{DeviceError, DeviceKind};
use crate::config::AudioSettings;
use crate::events::EventSender;

pub struct AudioSystem {
    devices: Arc<VirtualDeviceTable>,
    scheduler: CaptureScheduler,
}

impl AudioSystem {
    /// Enumerate devices, apply the configured selections and start capturing.
    ///
    /// An invalid configured selection falls back to the platform default.
    pub fn init(
        backend: Arc<dyn AudioBackend>,
        settings: &AudioSettings,
        events: EventSender,
    ) -> Result<Self, DeviceError> {
        let devices = VirtualDeviceTable::new(backend).with_vad_hold(settings.vad_hold_ms);

        for (kind, selection) in [
            (DeviceKind::Capture, settings.input_device),
            (DeviceKind::Playback, settings.output_device),
        ] {
            let Some(selection) = selection else { continue };
            if let Err(e) = devices.set_primary(kind, selection) {
                warn!(%kind, selection, error = %e, "Configured audio device unavailable, using default");
            }
        }

        let devices = Arc::new(devices);
        let scheduler = CaptureScheduler::spawn(
            Arc::clone(&devices),
            settings.capture_poll_interval(),
            events,
        )?;

        info!("Audio system initialized");
        Ok(Self { devices, scheduler })
    }

    pub const fn devices(&self) -> &Arc<VirtualDeviceTable> {
        &self.devices
    }

    pub fn is_running(&self) -> bool {
        self.scheduler.is_running()
    }

    /// Stop the capture thread. Open devices close as their owners drop them.
    pub fn terminate(self) {
        self.scheduler.stop();
        info!("Audio system terminated");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::backend::MockBackend;

    #[test]
    fn test_init_applies_configured_selection() {
        let backend = MockBackend::with_devices(&["a", "b"], &["x", "y"]);
        let settings = AudioSettings {
            input_device: Some(1),
            output_device: Some(9),
            ..AudioSettings::default()
        };
        let (events, _rx) = EventSender::channel(4);

        let system = AudioSystem::init(Arc::new(backend), &settings, events).unwrap();
        assert_eq!(system.devices().primary(DeviceKind::Capture).unwrap(), 1);
        assert_eq!(system.devices().primary(DeviceKind::Playback).unwrap(), 0);
        assert!(system.is_running());
        system.terminate();
    }
}
