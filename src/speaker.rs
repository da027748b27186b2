//! # Speaker Identification
//!
//! Pluggable labeling of who is talking on the binary audio path. The
//! server only surfaces *changes* — `{"type":"speaker",...}` notifications —
//! and makes no promises about labeling quality; the default implementation
//! is an energy gate that distinguishes "someone is speaking" from silence.

/// Assigns a speaker label to an audio frame.
///
/// Implementations must be cheap: they run inline on the ingest path for
/// every binary frame. Return `"unknown"` when no confident label exists;
/// the session suppresses notifications for it.
pub trait SpeakerIdentifier: Send + Sync {
    fn identify(&self, samples: &[f32], sample_rate: u32) -> String;
}

/// Default identifier: RMS energy above a threshold maps to a single fixed
/// label. Enough to drive the notification plumbing without a real
/// voiceprint model behind it.
pub struct EnergyGateIdentifier {
    threshold: f32,
    label: String,
}

impl EnergyGateIdentifier {
    pub fn new(threshold: f32) -> Self {
        Self {
            threshold: threshold.clamp(0.0, 1.0),
            label: "speaker_1".to_string(),
        }
    }

    fn rms(samples: &[f32]) -> f32 {
        if samples.is_empty() {
            return 0.0;
        }
        let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
        (sum_squares / samples.len() as f32).sqrt()
    }
}

impl Default for EnergyGateIdentifier {
    fn default() -> Self {
        Self::new(0.01)
    }
}

impl SpeakerIdentifier for EnergyGateIdentifier {
    fn identify(&self, samples: &[f32], _sample_rate: u32) -> String {
        if Self::rms(samples) >= self.threshold {
            self.label.clone()
        } else {
            "unknown".to_string()
        }
    }
}
