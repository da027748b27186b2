//! # Result Dispatcher
//!
//! Formats recognition output for the wire and pushes it into the owning
//! session's outbox. The `L:` / `T:` prefixes ride inside the `data` string
//! of the `text_result` envelope; existing clients key on them.
//!
//! A failed push means the WebSocket actor is gone; the session transitions
//! to `Closing` inside `ClientSession::send` and the result is dropped.

use crate::audio::ClientSession;
use crate::ingest::ServerMessage;
use crate::state::AppState;
use tracing::debug;

/// Why a commit was synthesized rather than decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushKind {
    /// Live text sat unchanged past the stall window.
    Stall,
    /// The rolling buffer hit its ceiling.
    Overflow,
}

/// Send a live partial (`L:` prefix).
pub fn emit_live(state: &AppState, session: &ClientSession, text: &str) {
    let message = ServerMessage::TextResult {
        data: format!("L:{}", text),
    };
    if session.send(message) {
        state.record_live_emit();
        debug!(session_id = %session.id, text, "live partial sent");
    }
}

/// Send a committed sentence (`T:` prefix).
pub fn emit_commit(state: &AppState, session: &ClientSession, text: &str) {
    let message = ServerMessage::TextResult {
        data: format!("T:{}", text),
    };
    if session.send(message) {
        state.record_commit_emit();
        debug!(session_id = %session.id, text, "commit sent");
    }
}

/// Send a synthesized flush commit, tagging the cause in the metrics.
pub fn emit_flush_commit(state: &AppState, session: &ClientSession, text: &str, kind: FlushKind) {
    emit_commit(state, session, text);
    match kind {
        FlushKind::Stall => state.record_stall_flush(),
        FlushKind::Overflow => state.record_overflow_flush(),
    }
}
