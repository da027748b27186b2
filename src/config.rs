//! # Configuration Management
//!
//! Loads and validates server configuration from layered sources:
//! built-in defaults, an optional `config.toml`, environment variables with
//! an `APP_` prefix, and finally the command line (applied in `main`).
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Command-line flags (`--port`, `--model`, `--workers`, ...)
//! 2. Environment variables (`APP_SERVER_PORT`, `APP_MODEL_PATH`, ...)
//! 3. Configuration file (`config.toml`)
//! 4. Default values (defined in the `Default` impl)

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub model: ModelConfig,
    pub audio: AudioConfig,
    pub recognition: RecognitionConfig,
}

/// Network listener settings.
///
/// The server speaks plain WebSocket over TCP; TLS is expected to terminate
/// at a reverse proxy in front of it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Acoustic model settings consumed by the decoder adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Directory holding `config.json`, `tokenizer.json` and
    /// `model.safetensors`.
    pub path: String,

    /// Recognition language passed to the decoder. Fixed per deployment.
    pub language: String,

    /// Compute device preference: "auto", "cpu", "cuda" or "metal".
    pub device: String,
}

/// Audio format and buffering limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Input sample rate. Clients must capture at this rate.
    pub sample_rate: u32,

    /// Ceiling for a session's rolling buffer, in seconds of audio.
    pub max_buffer_secs: f64,

    /// Minimum buffered audio before a snapshot is worth decoding.
    pub min_decode_secs: f64,
}

/// Scheduler and pipeline tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecognitionConfig {
    /// Scheduler pass interval in milliseconds.
    pub tick_ms: u64,

    /// Number of unchanged-buffer ticks before a pending live partial is
    /// flushed as a commit.
    pub stall_ticks: u32,

    /// Maximum concurrent decodes. 0 selects `min(4, hardware parallelism)`.
    pub workers: usize,

    /// Largest WebSocket frame the server will accept.
    pub max_frame_bytes: usize,

    /// A sentence terminator within the first N tokens of its segment is
    /// ignored (hallucinated leading punctuation).
    pub lead_guard_tokens: usize,

    /// A terminator only commits when at least N tokens follow its segment
    /// in the decode result, or the segment is the last one.
    pub lookahead_tokens: usize,

    /// How often the registry reaper sweeps out closed sessions, seconds.
    pub reaper_interval_secs: u64,

    /// Heartbeat ping interval for connected clients, seconds.
    pub heartbeat_interval_secs: u64,

    /// A client that stays silent past this window is disconnected, seconds.
    pub client_timeout_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 3000,
            },
            model: ModelConfig {
                path: "models/whisper-small".to_string(),
                language: "zh".to_string(),
                device: "auto".to_string(),
            },
            audio: AudioConfig {
                sample_rate: 16_000,
                max_buffer_secs: 20.0,
                min_decode_secs: 1.0,
            },
            recognition: RecognitionConfig {
                tick_ms: 10,
                stall_ticks: 100,
                workers: 0,
                max_frame_bytes: 1024 * 1024,
                lead_guard_tokens: 3,
                lookahead_tokens: 10,
                reaper_interval_secs: 5,
                heartbeat_interval_secs: 30,
                client_timeout_secs: 60,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, `config.toml` and the environment.
    ///
    /// `HOST` and `PORT` (without the `APP_` prefix) are honored as well so
    /// that common deployment platforms work unchanged.
    pub fn load() -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("_"))
            .build()?;

        let mut config: AppConfig = settings.try_deserialize()?;

        if let Ok(host) = env::var("HOST") {
            config.server.host = host;
        }
        if let Ok(port) = env::var("PORT") {
            if let Ok(port) = port.parse::<u16>() {
                config.server.port = port;
            }
        }

        Ok(config)
    }

    /// Sanity-check the loaded values before the server starts.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            anyhow::bail!("Server port must be greater than 0");
        }
        if self.audio.sample_rate == 0 {
            anyhow::bail!("Sample rate must be greater than 0");
        }
        if self.audio.max_buffer_secs <= self.audio.min_decode_secs {
            anyhow::bail!(
                "max_buffer_secs ({}) must exceed min_decode_secs ({})",
                self.audio.max_buffer_secs,
                self.audio.min_decode_secs
            );
        }
        if self.recognition.tick_ms == 0 {
            anyhow::bail!("Scheduler tick must be at least 1ms");
        }
        if self.recognition.max_frame_bytes == 0 {
            anyhow::bail!("max_frame_bytes must be greater than 0");
        }
        if self.model.path.is_empty() {
            anyhow::bail!("Model path must not be empty");
        }
        Ok(())
    }

    /// Rolling-buffer ceiling in samples.
    pub fn max_buffer_samples(&self) -> usize {
        (self.audio.max_buffer_secs * self.audio.sample_rate as f64) as usize
    }

    /// Decode readiness threshold in samples.
    pub fn min_decode_samples(&self) -> usize {
        (self.audio.min_decode_secs * self.audio.sample_rate as f64) as usize
    }

    /// Worker-pool size with the 0 = auto rule applied.
    pub fn effective_workers(&self) -> usize {
        if self.recognition.workers > 0 {
            return self.recognition.workers;
        }
        let parallelism = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        parallelism.min(4).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.audio.sample_rate, 16_000);
    }

    #[test]
    fn test_sample_arithmetic() {
        let config = AppConfig::default();
        assert_eq!(config.max_buffer_samples(), 320_000);
        assert_eq!(config.min_decode_samples(), 16_000);
    }

    #[test]
    fn test_validation_rejects_inverted_buffer_limits() {
        let mut config = AppConfig::default();
        config.audio.max_buffer_secs = 0.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_effective_workers_bounded() {
        let mut config = AppConfig::default();
        config.recognition.workers = 0;
        let auto = config.effective_workers();
        assert!(auto >= 1 && auto <= 4);

        config.recognition.workers = 7;
        assert_eq!(config.effective_workers(), 7);
    }
}
