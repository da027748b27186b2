//! # Whisper Decoder
//!
//! Candle-backed implementation of [`SpeechDecoder`]. The model directory
//! (passed on the command line) must contain `config.json`,
//! `tokenizer.json` and `model.safetensors`.
//!
//! Decoding is greedy and context-free: every snapshot is decoded from
//! scratch with timestamp tokens enabled, and the timestamp tokens are used
//! to slice the output into segments. Per-token times interpolate linearly
//! inside a segment window; downstream only the terminator token's end time
//! matters.
//!
//! The whisper model carries mutable key/value caches, so the decoder runs
//! single-flight behind a mutex; the worker pool above it queues calls.

use crate::transcription::engine::{DecodeResult, DecoderOptions, Segment, SpeechDecoder, Token};
use anyhow::{anyhow, Result};
use candle_core::{Device, IndexOp, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::whisper::{self as m, Config};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokenizers::Tokenizer;
use tracing::{debug, info, warn};

/// Frequency bins of the 400-point STFT whisper models expect.
const N_FREQS: usize = 201;

/// One whisper timestamp token step, in milliseconds.
const TIMESTAMP_STEP_MS: f32 = 20.0;

/// Fallback special-token ids for tokenizers that don't expose them.
const FALLBACK_SOT: u32 = 50258;
const FALLBACK_EOT: u32 = 50257;
const FALLBACK_TRANSCRIBE: u32 = 50359;
const FALLBACK_TIMESTAMP_BEGIN: u32 = 50364;

struct WhisperInner {
    model: m::model::Whisper,
    tokenizer: Tokenizer,
    config: Config,
    device: Device,
    mel_filters: Vec<f32>,
    sot_token: u32,
    eot_token: u32,
    transcribe_token: u32,
    timestamp_begin: u32,
    language_token: Option<u32>,
}

pub struct WhisperDecoder {
    inner: Mutex<WhisperInner>,
    options: DecoderOptions,
    descriptor: String,
}

impl WhisperDecoder {
    /// Load the model from a local directory.
    pub fn load(model_dir: &Path, device_preference: &str, options: DecoderOptions) -> Result<Self> {
        let started = std::time::Instant::now();
        let device = select_device(device_preference);
        info!(path = %model_dir.display(), device = device_label(&device), "loading whisper model");

        let config_path = required_file(model_dir, "config.json")?;
        let tokenizer_path = required_file(model_dir, "tokenizer.json")?;
        let weights_path = required_file(model_dir, "model.safetensors")?;

        let config: Config = serde_json::from_reader(std::fs::File::open(config_path)?)?;
        let tokenizer = Tokenizer::from_file(tokenizer_path)
            .map_err(|e| anyhow!("failed to load tokenizer: {}", e))?;

        let vb =
            unsafe { VarBuilder::from_mmaped_safetensors(&[weights_path], m::DTYPE, &device)? };
        let model = m::model::Whisper::load(&vb, config.clone())?;

        let mel_filters = mel_filter_bank(config.num_mel_bins as usize);

        let sot_token = special_token(&tokenizer, "<|startoftranscript|>", FALLBACK_SOT);
        let eot_token = special_token(&tokenizer, "<|endoftext|>", FALLBACK_EOT);
        let transcribe_token = special_token(&tokenizer, "<|transcribe|>", FALLBACK_TRANSCRIBE);
        // Timestamp tokens follow <|notimestamps|>; <|0.00|> is the base.
        let timestamp_begin = special_token(&tokenizer, "<|0.00|>", FALLBACK_TIMESTAMP_BEGIN);

        let language_marker = format!("<|{}|>", options.language);
        let language_token = tokenizer.token_to_id(&language_marker);
        if language_token.is_none() {
            warn!(
                language = %options.language,
                "tokenizer has no token for the configured language, decoding without a hint"
            );
        }

        let descriptor = format!(
            "whisper[{}] on {}",
            model_dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| model_dir.display().to_string()),
            device_label(&device),
        );

        let decoder = Self {
            inner: Mutex::new(WhisperInner {
                model,
                tokenizer,
                config,
                device,
                mel_filters,
                sot_token,
                eot_token,
                transcribe_token,
                timestamp_begin,
                language_token,
            }),
            options,
            descriptor,
        };

        decoder.validate()?;
        info!(
            elapsed_secs = started.elapsed().as_secs_f64(),
            "whisper model loaded"
        );
        Ok(decoder)
    }

    /// Decode one second of silence to prove the weights and tokenizer fit
    /// together before the server starts accepting clients.
    fn validate(&self) -> Result<()> {
        let silence = vec![0.0f32; 16_000];
        let result = self.decode(&silence, 16_000)?;
        debug!(
            segments = result.segments.len(),
            "model validation decode complete"
        );
        Ok(())
    }
}

impl SpeechDecoder for WhisperDecoder {
    fn decode(&self, samples: &[f32], sample_rate: u32) -> Result<DecodeResult> {
        if samples.is_empty() {
            return Ok(DecodeResult::default());
        }
        let audio_len_ms = samples.len() as f32 / sample_rate as f32 * 1000.0;

        let mut inner = self.inner.lock().unwrap();

        let mel = m::audio::pcm_to_mel(&inner.config, samples, &inner.mel_filters);
        let mel_len = mel.len();
        let n_mels = inner.config.num_mel_bins as usize;
        let mel = Tensor::from_vec(mel, (1, n_mels, mel_len / n_mels), &inner.device)?;

        let audio_features = inner.model.encoder.forward(&mel, true)?;

        let mut tokens = vec![inner.sot_token];
        if let Some(language_token) = inner.language_token {
            tokens.push(language_token);
        }
        tokens.push(inner.transcribe_token);
        let prompt_len = tokens.len();

        for i in 0..self.options.max_tokens {
            let input = Tensor::new(tokens.as_slice(), &inner.device)?.unsqueeze(0)?;
            let ys = inner
                .model
                .decoder
                .forward(&input, &audio_features, i == 0)?;
            let logits = inner
                .model
                .decoder
                .final_linear(&ys.i((..1, tokens.len() - 1..))?)?
                .i(0)?
                .i(0)?;
            let next_token = logits
                .argmax(candle_core::D::Minus1)?
                .to_scalar::<u32>()?;

            if next_token == inner.eot_token {
                break;
            }
            if is_repetitive(&tokens[prompt_len..], next_token) {
                debug!("repetition detected, stopping decode");
                break;
            }
            tokens.push(next_token);
        }

        let generated = &tokens[prompt_len..];
        let segments = assemble_segments(
            generated,
            |id| token_text(&inner.tokenizer, id),
            inner.eot_token,
            inner.timestamp_begin,
            audio_len_ms,
        );

        Ok(DecodeResult { segments })
    }

    fn descriptor(&self) -> String {
        self.descriptor.clone()
    }
}

fn required_file(dir: &Path, name: &str) -> Result<PathBuf> {
    let path = dir.join(name);
    if !path.exists() {
        return Err(anyhow!("model file missing: {}", path.display()));
    }
    Ok(path)
}

fn special_token(tokenizer: &Tokenizer, marker: &str, fallback: u32) -> u32 {
    tokenizer.token_to_id(marker).unwrap_or(fallback)
}

fn token_text(tokenizer: &Tokenizer, id: u32) -> Option<String> {
    let text = tokenizer.decode(&[id], true).ok()?;
    if text.is_empty() {
        return None;
    }
    Some(text)
}

/// Pick the compute device. GPU failures degrade to CPU; a server without a
/// GPU still runs, just slower.
fn select_device(preference: &str) -> Device {
    match preference.to_lowercase().as_str() {
        "cpu" => Device::Cpu,
        "cuda" | "gpu" => Device::new_cuda(0).unwrap_or(Device::Cpu),
        "metal" => Device::new_metal(0).unwrap_or(Device::Cpu),
        _ => {
            if let Ok(device) = Device::new_cuda(0) {
                return device;
            }
            if let Ok(device) = Device::new_metal(0) {
                return device;
            }
            Device::Cpu
        }
    }
}

fn device_label(device: &Device) -> &'static str {
    match device {
        Device::Cpu => "cpu",
        Device::Cuda(_) => "cuda",
        Device::Metal(_) => "metal",
    }
}

/// Triangular mel filter bank over the STFT frequency bins.
fn mel_filter_bank(n_mels: usize) -> Vec<f32> {
    let mut filters = vec![0.0f32; n_mels * N_FREQS];
    for mel_bin in 0..n_mels {
        let center = (mel_bin + 1) * N_FREQS / (n_mels + 1);
        let width = (N_FREQS / (n_mels + 1)).max(1);
        for freq in center.saturating_sub(width)..(center + width).min(N_FREQS) {
            let distance = (freq as i64 - center as i64).unsigned_abs() as f32;
            filters[mel_bin * N_FREQS + freq] = (1.0 - distance / width as f32).max(0.0);
        }
    }
    filters
}

/// Stop when the tail repeats: three identical tokens in a row, or the last
/// three-token pattern occurring twice back to back.
fn is_repetitive(tokens: &[u32], next_token: u32) -> bool {
    if tokens.len() >= 2 {
        let n = tokens.len();
        if tokens[n - 1] == next_token && tokens[n - 2] == next_token {
            return true;
        }
    }
    if tokens.len() >= 6 {
        let n = tokens.len();
        if tokens[n - 3..] == tokens[n - 6..n - 3] {
            return true;
        }
    }
    false
}

/// Slice a generated token stream into timestamped segments.
///
/// Timestamp tokens (`id >= timestamp_begin`) open and close segment
/// windows; text tokens (`id < eot`) fill them. A window left open by the
/// end of generation closes at the end of the audio. Token times
/// interpolate linearly across their window.
fn assemble_segments(
    ids: &[u32],
    token_text: impl Fn(u32) -> Option<String>,
    eot: u32,
    timestamp_begin: u32,
    audio_len_ms: f32,
) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut window_start_ms = 0.0f32;
    let mut pending: Vec<String> = Vec::new();

    let mut close_window = |start: f32, end: f32, texts: &mut Vec<String>, out: &mut Vec<Segment>| {
        if texts.is_empty() {
            return;
        }
        let n = texts.len();
        let span = (end - start).max(0.0);
        let tokens: Vec<Token> = texts
            .drain(..)
            .enumerate()
            .map(|(k, text)| Token {
                text,
                t_begin_ms: start + span * k as f32 / n as f32,
                t_end_ms: start + span * (k + 1) as f32 / n as f32,
            })
            .collect();
        let text = tokens.iter().map(|t| t.text.as_str()).collect::<String>();
        out.push(Segment { text, tokens });
    };

    for &id in ids {
        if id >= timestamp_begin {
            let ts_ms = (id - timestamp_begin) as f32 * TIMESTAMP_STEP_MS;
            close_window(window_start_ms, ts_ms, &mut pending, &mut segments);
            window_start_ms = ts_ms;
            continue;
        }
        if id >= eot {
            // Other special tokens carry no text.
            continue;
        }
        if let Some(text) = token_text(id) {
            pending.push(text);
        }
    }
    close_window(window_start_ms, audio_len_ms, &mut pending, &mut segments);

    segments
}
