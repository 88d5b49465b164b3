//! Capture Scheduler
//!
//! A background thread polls the physical capture device, computes the
//! frame volume once and hands the frame to every unmuted input device whose
//! VAD lets it through. Handlers run after the capture lock is released.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, info, trace, warn};

use super::table::{FrameHandler, VirtualDeviceTable};
use super::vad::frame_volume;
use super::{DeviceError, MAX_FRAME_SAMPLES};
use crate::events::{CallEvent, EventSender};

/// Outcome of one scheduler pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Tick {
    /// No physical capture device is open.
    Paused,
    /// Less than one frame has been captured so far.
    Waiting,
    /// A frame was read and handed to this many devices.
    Delivered(usize),
}

/// Run one scheduler pass over `table` using `frame` as scratch space.
pub(crate) fn poll_once(
    table: &VirtualDeviceTable,
    frame: &mut [i16],
) -> Result<Tick, DeviceError> {
    let (format, len, handlers) = {
        let mut guard = table.lock_capture()?;
        let capture = &mut *guard;

        let Some(shared) = capture.physical.as_mut() else {
            return Ok(Tick::Paused);
        };
        let format = shared.handle.format;
        let Some(stream) = shared.handle.stream.as_mut() else {
            return Ok(Tick::Paused);
        };

        let spc = format.samples_per_channel();
        let available = stream.available().map_err(|e| {
            warn!(error = %e, "Failed to query captured samples");
            DeviceError::InternalError
        })?;
        if available < spc {
            return Ok(Tick::Waiting);
        }

        let len = format.frame_len();
        let buf = frame.get_mut(..len).ok_or(DeviceError::UnsupportedMode)?;
        stream.read(buf).map_err(|e| {
            warn!(error = %e, "Failed to read captured frame");
            DeviceError::InternalError
        })?;

        let volume = frame_volume(buf);
        capture.last_volume = volume;

        let mut handlers: Vec<FrameHandler> = Vec::new();
        for device in capture.devices.values_mut() {
            let voice = device.vad.observe(volume, spc);
            if voice && !device.muted {
                if let Some(handler) = &device.handler {
                    handlers.push(Arc::clone(handler));
                }
            }
        }
        trace!(volume, receivers = handlers.len(), "Captured frame");
        (format, len, handlers)
    };

    let samples = &frame[..len];
    for handler in &handlers {
        handler(samples, format);
    }
    Ok(Tick::Delivered(handlers.len()))
}

/// Background capture polling thread
pub struct CaptureScheduler {
    running: Arc<AtomicBool>,
    interval: Duration,
}

impl CaptureScheduler {
    /// Start polling `table` every `interval`.
    pub fn spawn(
        table: Arc<VirtualDeviceTable>,
        interval: Duration,
        events: EventSender,
    ) -> Result<Self, DeviceError> {
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);

        thread::Builder::new()
            .name("vc-capture".into())
            .spawn(move || run(&table, &flag, interval, &events))
            .map_err(|e| {
                warn!(error = %e, "Failed to spawn capture thread");
                DeviceError::InternalError
            })?;

        Ok(Self { running, interval })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Signal the thread to stop and give it two ticks to wind down.
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            thread::sleep(self.interval * 2);
            debug!("Capture scheduler stopped");
        }
    }
}

impl Drop for CaptureScheduler {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

fn run(table: &VirtualDeviceTable, running: &AtomicBool, interval: Duration, events: &EventSender) {
    info!(interval_ms = interval.as_millis(), "Capture thread started");
    let mut frame = vec![0i16; MAX_FRAME_SAMPLES];
    let mut failing = false;

    while running.load(Ordering::Acquire) {
        match poll_once(table, &mut frame) {
            // drain any backlog before sleeping
            Ok(Tick::Delivered(_)) => {
                failing = false;
                continue;
            }
            Ok(Tick::Paused | Tick::Waiting) => failing = false,
            Err(e) => {
                if !failing {
                    events.emit(CallEvent::DeviceError {
                        message: e.to_string(),
                    });
                }
                failing = true;
            }
        }
        thread::sleep(interval);
    }

    info!("Capture thread stopped");
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::audio::backend::MockBackend;
    use crate::audio::FrameFormat;

    type Received = Arc<Mutex<Vec<(Vec<i16>, FrameFormat)>>>;

    fn recorder() -> (FrameHandler, Received) {
        let received: Received = Arc::default();
        let sink = Arc::clone(&received);
        let handler: FrameHandler = Arc::new(move |samples: &[i16], format: FrameFormat| {
            sink.lock().unwrap().push((samples.to_vec(), format));
        });
        (handler, received)
    }

    fn scratch() -> Vec<i16> {
        vec![0; MAX_FRAME_SAMPLES]
    }

    const FORMAT: FrameFormat = FrameFormat::new(8000, 10, 1);

    #[test]
    fn test_paused_without_devices() {
        let table = VirtualDeviceTable::new(Arc::new(MockBackend::new()));
        assert_eq!(poll_once(&table, &mut scratch()), Ok(Tick::Paused));
    }

    #[test]
    fn test_waits_for_a_full_frame() {
        let backend = MockBackend::new();
        let table = VirtualDeviceTable::new(Arc::new(backend.clone()));
        table.open_input(FORMAT, None, None).unwrap();

        backend.push_capture(&[1; 79]);
        assert_eq!(poll_once(&table, &mut scratch()), Ok(Tick::Waiting));
        assert_eq!(backend.pending_capture(), 79);
    }

    #[test]
    fn test_frame_fans_out_to_every_device() {
        let backend = MockBackend::new();
        let table = VirtualDeviceTable::new(Arc::new(backend.clone()));
        let (first, first_rx) = recorder();
        let (second, second_rx) = recorder();
        table.open_input(FORMAT, None, Some(first)).unwrap();
        table.open_input(FORMAT, None, Some(second)).unwrap();

        let samples: Vec<i16> = (0..80).collect();
        backend.push_capture(&samples);
        assert_eq!(poll_once(&table, &mut scratch()), Ok(Tick::Delivered(2)));

        for rx in [first_rx, second_rx] {
            let got = rx.lock().unwrap();
            assert_eq!(got.len(), 1);
            assert_eq!(got[0], (samples.clone(), FORMAT));
        }
    }

    #[test]
    fn test_vad_is_evaluated_per_device() {
        let backend = MockBackend::new();
        let table = VirtualDeviceTable::new(Arc::new(backend.clone())).with_vad_hold(0);
        let (open, open_rx) = recorder();
        let (gated, gated_rx) = recorder();
        table.open_input(FORMAT, None, Some(open)).unwrap();
        table.open_input(FORMAT, Some(50.0), Some(gated)).unwrap();

        // a square wave at a quarter of full scale reads about 35
        backend.push_capture(&[8192, -8192].repeat(40));
        assert_eq!(poll_once(&table, &mut scratch()), Ok(Tick::Delivered(1)));
        assert!((table.input_volume() - 35.36).abs() < 0.1);

        backend.push_capture(&[i16::MAX, -i16::MAX].repeat(40));
        assert_eq!(poll_once(&table, &mut scratch()), Ok(Tick::Delivered(2)));

        assert_eq!(open_rx.lock().unwrap().len(), 2);
        assert_eq!(gated_rx.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_muted_device_receives_nothing() {
        let backend = MockBackend::new();
        let table = VirtualDeviceTable::new(Arc::new(backend.clone()));
        let (handler, rx) = recorder();
        let handle = table.open_input(FORMAT, None, Some(handler)).unwrap();
        table.mute(handle).unwrap();

        backend.push_capture(&[100; 80]);
        assert_eq!(poll_once(&table, &mut scratch()), Ok(Tick::Delivered(0)));
        assert!(rx.lock().unwrap().is_empty());
        // the frame is still consumed and metered
        assert_eq!(backend.pending_capture(), 0);
        assert!(table.input_volume() > 0.0);
    }

    #[test]
    fn test_handler_may_reenter_the_table() {
        let backend = MockBackend::new();
        let table = Arc::new(VirtualDeviceTable::new(Arc::new(backend.clone())));
        let seen = Arc::new(AtomicBool::new(false));

        let weak = Arc::downgrade(&table);
        let flag = Arc::clone(&seen);
        let handler: FrameHandler = Arc::new(move |_: &[i16], _: FrameFormat| {
            if let Some(table) = weak.upgrade() {
                table.input_volume();
                flag.store(true, Ordering::SeqCst);
            }
        });
        table.open_input(FORMAT, None, Some(handler)).unwrap();

        backend.push_capture(&[1; 80]);
        poll_once(&table, &mut scratch()).unwrap();
        assert!(seen.load(Ordering::SeqCst));
    }

    #[test]
    fn test_scheduler_thread_delivers_and_stops() {
        let backend = MockBackend::new();
        let table = Arc::new(VirtualDeviceTable::new(Arc::new(backend.clone())));
        let (handler, rx) = recorder();
        table.open_input(FORMAT, None, Some(handler)).unwrap();

        let (events, _receiver) = EventSender::channel(8);
        let scheduler =
            CaptureScheduler::spawn(Arc::clone(&table), Duration::from_millis(2), events).unwrap();
        backend.push_capture(&[3; 160]);

        for _ in 0..500 {
            if rx.lock().unwrap().len() == 2 {
                break;
            }
            thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(rx.lock().unwrap().len(), 2);

        scheduler.stop();
        assert!(!scheduler.is_running());
    }
}
