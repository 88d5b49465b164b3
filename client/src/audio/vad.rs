//! Volume metering and voice activity detection.

use std::f64::consts::SQRT_2;

/// Normalized RMS volume of a frame on a 0-100 scale.
///
/// A full-amplitude sine wave reads 100; louder (clipped) signals are capped.
pub fn frame_volume(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples
        .iter()
        .map(|&s| {
            let v = f64::from(s);
            v * v
        })
        .sum();
    let rms = (sum / samples.len() as f64).sqrt();
    let normalized = (rms * SQRT_2 / 32768.0).min(1.0);
    (normalized * 100.0) as f32
}

pub(crate) fn clamp_threshold(value: f32) -> f32 {
    if value.is_nan() {
        return 0.0;
    }
    value.clamp(0.0, 100.0)
}

/// Per-device VAD state.
///
/// A frame at or above the threshold re-arms a hold countdown measured in
/// samples per channel; quiet frames keep counting as voice until it runs out.
#[derive(Debug, Clone, Copy)]
pub(crate) struct VoiceActivity {
    threshold: f32,
    hold_samples: usize,
    remaining: usize,
}

impl VoiceActivity {
    pub(crate) fn new(threshold: f32, hold_samples: usize) -> Self {
        Self {
            threshold: clamp_threshold(threshold),
            hold_samples,
            remaining: 0,
        }
    }

    pub(crate) const fn threshold(&self) -> f32 {
        self.threshold
    }

    pub(crate) fn set_threshold(&mut self, value: f32) {
        self.threshold = clamp_threshold(value);
        if self.threshold == 0.0 {
            self.remaining = 0;
        }
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.threshold > 0.0
    }

    /// Feed one frame's volume; returns whether the frame should be delivered.
    pub(crate) fn observe(&mut self, volume: f32, frame_samples: usize) -> bool {
        if !self.is_enabled() {
            return true;
        }
        if volume >= self.threshold {
            self.remaining = self.hold_samples;
            return true;
        }
        if self.remaining >= frame_samples {
            self.remaining -= frame_samples;
            return true;
        }
        self.remaining = 0;
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(amplitude: f64, len: usize) -> Vec<i16> {
        (0..len)
            .map(|i| {
                let phase = i as f64 * 2.0 * std::f64::consts::PI / 48.0;
                (amplitude * phase.sin()) as i16
            })
            .collect()
    }

    #[test]
    fn test_silence_reads_zero() {
        assert_eq!(frame_volume(&[0; 960]), 0.0);
        assert_eq!(frame_volume(&[]), 0.0);
    }

    #[test]
    fn test_full_scale_sine_reads_hundred() {
        let volume = frame_volume(&sine(32767.0, 960));
        assert!(volume > 99.0 && volume <= 100.0, "volume = {volume}");
    }

    #[test]
    fn test_volume_is_capped() {
        assert_eq!(frame_volume(&[i16::MIN; 64]), 100.0);
    }

    #[test]
    fn test_half_scale_sine_reads_about_fifty() {
        let volume = frame_volume(&sine(16384.0, 960));
        assert!((volume - 50.0).abs() < 1.0, "volume = {volume}");
    }

    #[test]
    fn test_negative_threshold_clamps_to_disabled() {
        let mut vad = VoiceActivity::new(-3.0, 100);
        assert_eq!(vad.threshold(), 0.0);
        assert!(vad.observe(0.0, 10));

        vad.set_threshold(250.0);
        assert_eq!(vad.threshold(), 100.0);
        vad.set_threshold(f32::NAN);
        assert!(!vad.is_enabled());
    }

    #[test]
    fn test_quiet_frames_suppressed_without_prior_voice() {
        let mut vad = VoiceActivity::new(10.0, 1000);
        assert!(!vad.observe(5.0, 100));
    }

    #[test]
    fn test_hold_window_keeps_trailing_frames() {
        // hold of 1000 samples, frames of 300 samples: 3 quiet frames fit
        let mut vad = VoiceActivity::new(10.0, 1000);
        assert!(vad.observe(40.0, 300));
        for _ in 0..3 {
            assert!(vad.observe(1.0, 300));
        }
        assert!(!vad.observe(1.0, 300));

        // a loud frame re-arms the window
        assert!(vad.observe(10.0, 300));
        assert!(vad.observe(1.0, 300));
    }

    #[test]
    fn test_frame_past_hold_window_is_suppressed() {
        let mut vad = VoiceActivity::new(10.0, 1000);
        let delivered: Vec<bool> = std::iter::once(50.0)
            .chain([1.0; 5])
            .map(|volume| vad.observe(volume, 300))
            .collect();
        assert_eq!(delivered, [true, true, true, true, false, false]);
    }

    #[test]
    fn test_hold_shorter_than_frame_keeps_nothing() {
        let mut vad = VoiceActivity::new(10.0, 100);
        assert!(vad.observe(20.0, 960));
        assert!(!vad.observe(0.0, 960));
    }
}
