//! # Recognition Engine
//!
//! The decoder adapter boundary. The pipeline only ever sees
//! [`SpeechDecoder`]: a blocking call from f32 PCM to a list of segments
//! whose tokens carry millisecond timestamps relative to the start of the
//! snapshot. The concrete Whisper implementation lives in
//! `transcription::model`; tests substitute scripted decoders.

use anyhow::Result;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// One decoded token with its time span, milliseconds from snapshot start.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub text: String,
    pub t_begin_ms: f32,
    pub t_end_ms: f32,
}

/// A contiguous decoded region: the joined text plus its tokens.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Segment {
    pub text: String,
    pub tokens: Vec<Token>,
}

/// Everything the decoder produced for one snapshot.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DecodeResult {
    pub segments: Vec<Segment>,
}

impl DecodeResult {
    pub fn token_count(&self) -> usize {
        self.segments.iter().map(|s| s.tokens.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}

/// Options the core fixes for its decoder.
#[derive(Debug, Clone)]
pub struct DecoderOptions {
    /// ISO 639-1 language code; recognition only, never translation.
    pub language: String,

    /// Hard cap on generated tokens per snapshot.
    pub max_tokens: usize,
}

impl Default for DecoderOptions {
    fn default() -> Self {
        Self {
            language: "zh".to_string(),
            max_tokens: 128,
        }
    }
}

/// Blocking acoustic decoder. Implementations decode greedily and carry no
/// context between calls; each snapshot stands alone.
pub trait SpeechDecoder: Send + Sync {
    fn decode(&self, samples: &[f32], sample_rate: u32) -> Result<DecodeResult>;

    /// Human-readable description for the health surface.
    fn descriptor(&self) -> String {
        "speech decoder".to_string()
    }
}

/// Thin wrapper binding a decoder to the deployment sample rate and adding
/// per-call latency logging. The scheduler owns one of these.
pub struct RecognitionEngine {
    decoder: Arc<dyn SpeechDecoder>,
    sample_rate: u32,
}

impl RecognitionEngine {
    pub fn new(decoder: Arc<dyn SpeechDecoder>, sample_rate: u32) -> Self {
        Self {
            decoder,
            sample_rate,
        }
    }

    pub fn decode(&self, samples: &[f32]) -> Result<DecodeResult> {
        let started = Instant::now();
        let result = self.decoder.decode(samples, self.sample_rate);
        let elapsed_ms = started.elapsed().as_millis();

        match &result {
            Ok(decoded) => debug!(
                audio_secs = samples.len() as f64 / self.sample_rate as f64,
                segments = decoded.segments.len(),
                tokens = decoded.token_count(),
                elapsed_ms,
                "decode complete"
            ),
            Err(err) => debug!(elapsed_ms, error = %err, "decode failed"),
        }

        result
    }

    pub fn descriptor(&self) -> String {
        self.decoder.descriptor()
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}
