//! # Ingest Router
//!
//! Decodes the inbound message envelope and routes it to the owning
//! session. Two audio paths exist by contract with the clients:
//!
//! - TEXT frames carrying `{"type":"audio_data","data":[f32…]}`
//! - BINARY frames carrying packed little-endian f32 samples (length must
//!   be a multiple of 4)
//!
//! Malformed input earns an `error_response` reply; it never closes the
//! session. Protocol-level failures are the transport's business, not ours.

use crate::audio::ClientSession;
use crate::dispatch::{self, FlushKind};
use crate::speaker::SpeakerIdentifier;
use crate::state::AppState;
use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Messages a client may send.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// PCM samples at the deployment sample rate, range [-1, 1].
    #[serde(rename = "audio_data")]
    AudioData { data: Vec<f32> },

    /// Application-level liveness check.
    #[serde(rename = "ping")]
    Ping,
}

/// Messages the server sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// Recognition output; `data` starts with `L:` (live) or `T:` (commit).
    #[serde(rename = "text_result")]
    TextResult { data: String },

    /// Reply for anything we could not understand.
    #[serde(rename = "error_response")]
    ErrorResponse { message: String },

    /// Ack for an application-level ping.
    #[serde(rename = "pong")]
    Pong,

    /// The identified speaker on the binary audio path changed.
    #[serde(rename = "speaker")]
    Speaker { speaker: String },
}

/// Handle one TEXT frame.
pub fn handle_text(state: &AppState, session: &ClientSession, payload: &str) {
    let value: serde_json::Value = match serde_json::from_str(payload) {
        Ok(value) => value,
        Err(err) => {
            debug!(session_id = %session.id, error = %err, "unparseable message");
            reply_error(session, "invalid message payload");
            return;
        }
    };

    match serde_json::from_value::<ClientMessage>(value.clone()) {
        Ok(ClientMessage::AudioData { data }) => append_samples(state, session, &data),
        Ok(ClientMessage::Ping) => {
            session.send(ServerMessage::Pong);
        }
        Err(_) => {
            let kind = value
                .get("type")
                .and_then(|t| t.as_str())
                .unwrap_or("<missing>");
            warn!(session_id = %session.id, kind, "unsupported message type");
            reply_error(session, &format!("unsupported message type: {}", kind));
        }
    }
}

/// Handle one BINARY frame: packed little-endian f32 samples.
pub fn handle_binary(
    state: &AppState,
    session: &ClientSession,
    speaker: &dyn SpeakerIdentifier,
    payload: &[u8],
) {
    if payload.is_empty() || payload.len() % 4 != 0 {
        debug!(
            session_id = %session.id,
            len = payload.len(),
            "binary frame is not a whole number of f32 samples"
        );
        reply_error(session, "binary audio length must be a multiple of 4");
        return;
    }

    let mut samples = vec![0.0f32; payload.len() / 4];
    LittleEndian::read_f32_into(payload, &mut samples);

    let sample_rate = state.get_config().audio.sample_rate;
    let label = speaker.identify(&samples, sample_rate);
    if session.update_speaker(&label) {
        session.send(ServerMessage::Speaker { speaker: label });
    }

    append_samples(state, session, &samples);
}

fn append_samples(state: &AppState, session: &ClientSession, samples: &[f32]) {
    if samples.is_empty() {
        return;
    }
    state.record_audio(samples.len());

    if let Some(flush_text) = session.append_audio(samples) {
        dispatch::emit_flush_commit(state, session, &flush_text, FlushKind::Overflow);
    }
}

fn reply_error(session: &ClientSession, reason: &str) {
    session.send(ServerMessage::ErrorResponse {
        message: reason.to_string(),
    });
}
