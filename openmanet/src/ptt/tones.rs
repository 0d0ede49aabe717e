//! Feedback tone synthesis for transmit start and stop.

use super::{FRAME_SIZE, SAMPLE_RATE};

/// Amplitude of the feedback tones, well below full scale so they never clip.
const TONE_AMPLITUDE: f32 = 0.2;

/// Synthesize one frame of a sine tone at the given frequency.
pub fn tone_frame(frequency: f32) -> Vec<f32> {
    (0..FRAME_SIZE)
        .map(|i| {
            let phase = 2.0 * std::f32::consts::PI * frequency * i as f32 / SAMPLE_RATE as f32;
            phase.sin() * TONE_AMPLITUDE
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tone_fills_one_frame() {
        assert_eq!(tone_frame(1000.0).len(), FRAME_SIZE);
    }

    #[test]
    fn tone_starts_at_zero_crossing() {
        let frame = tone_frame(600.0);
        assert_eq!(frame[0], 0.0);
    }

    #[test]
    fn tone_stays_within_amplitude() {
        for sample in tone_frame(1000.0) {
            assert!(sample.abs() <= TONE_AMPLITUDE + f32::EPSILON);
        }
    }

    #[test]
    fn tone_actually_oscillates() {
        let frame = tone_frame(1000.0);
        let peak = frame.iter().fold(0.0f32, |acc, s| acc.max(s.abs()));
        assert!(peak > TONE_AMPLITUDE * 0.9);
    }
}
