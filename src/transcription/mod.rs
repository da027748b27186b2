//! # Transcription
//!
//! The decoder adapter boundary: contract types and the `SpeechDecoder`
//! trait in `engine`, the candle-backed Whisper implementation in `model`.

pub mod engine;
pub mod model;

pub use engine::{DecodeResult, DecoderOptions, RecognitionEngine, Segment, SpeechDecoder, Token};
pub use model::WhisperDecoder;
