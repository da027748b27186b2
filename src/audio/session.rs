//! # Client Session Management
//!
//! One [`ClientSession`] per connected WebSocket client: the rolling audio
//! buffer, the live/commit text memos used for deduplication, the idle-tick
//! counter behind stall detection, and the scheduler's change cursor.
//!
//! The [`SessionRegistry`] maps session ids to sessions and is swept by a
//! background reaper that removes closed sessions once no decode is in
//! flight for them.
//!
//! ## Session Lifecycle:
//! 1. **Open**: created on a successful WebSocket upgrade
//! 2. **Closing**: transport error or write failure; no further emissions
//! 3. **Closed**: socket gone; the reaper frees the session

use crate::audio::buffer::{AppendResult, BufferCursor, RollingBuffer};
use crate::ingest::ServerMessage;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Monotonic connection sequence, used only for fair scheduler ordering.
static NEXT_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open,
    Closing,
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Open => "open",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        }
    }
}

#[derive(Debug, Default)]
struct TextMemo {
    last_live: String,
    last_commit: String,
}

/// Per-client state record.
pub struct ClientSession {
    /// Opaque short id, unique while the session lives. Reconnecting
    /// clients always get a fresh id.
    pub id: String,

    /// Connection order for round-robin-ish scheduling.
    pub seq: u64,

    pub buffer: RollingBuffer,

    pub connected_at: DateTime<Utc>,

    text: Mutex<TextMemo>,

    /// Ticks the scheduler has seen this buffer unchanged.
    idle_ticks: AtomicU32,

    /// Set while a snapshot of this session is queued or being decoded.
    in_flight: AtomicBool,

    state: RwLock<SessionState>,

    /// Last buffer position the scheduler consumed.
    cursor: Mutex<BufferCursor>,

    /// Last speaker label announced on the binary audio path.
    speaker: Mutex<String>,

    /// Outbound messages, drained by the WebSocket actor.
    outbox: mpsc::UnboundedSender<ServerMessage>,
}

impl ClientSession {
    pub fn new(
        id: String,
        max_buffer_samples: usize,
        outbox: mpsc::UnboundedSender<ServerMessage>,
    ) -> Self {
        Self {
            id,
            seq: NEXT_SEQ.fetch_add(1, Ordering::Relaxed),
            buffer: RollingBuffer::new(max_buffer_samples),
            connected_at: Utc::now(),
            text: Mutex::new(TextMemo::default()),
            idle_ticks: AtomicU32::new(0),
            in_flight: AtomicBool::new(false),
            state: RwLock::new(SessionState::Open),
            cursor: Mutex::new(BufferCursor::default()),
            speaker: Mutex::new("unknown".to_string()),
            outbox,
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.read().unwrap()
    }

    pub fn set_state(&self, state: SessionState) {
        *self.state.write().unwrap() = state;
    }

    pub fn is_open(&self) -> bool {
        self.state() == SessionState::Open
    }

    pub fn mark_closed(&self) {
        self.set_state(SessionState::Closed);
    }

    /// Queue a message for the client. A closed outbox means the socket is
    /// gone; the session transitions to `Closing` and the send is dropped.
    pub fn send(&self, message: ServerMessage) -> bool {
        if self.outbox.send(message).is_err() {
            if self.is_open() {
                debug!(session_id = %self.id, "outbox closed, marking session closing");
                self.set_state(SessionState::Closing);
            }
            return false;
        }
        true
    }

    /// Append audio from the ingest router. Returns the synthesized flush
    /// commit text when the append overflowed the rolling buffer and a live
    /// partial was pending.
    pub fn append_audio(&self, samples: &[f32]) -> Option<String> {
        self.idle_ticks.store(0, Ordering::Relaxed);
        match self.buffer.append(samples) {
            AppendResult::Appended { .. } => None,
            AppendResult::Overflowed { dropped } => {
                warn!(
                    session_id = %self.id,
                    dropped,
                    "rolling buffer ceiling reached, audio dropped"
                );
                self.take_flush_text()
            }
        }
    }

    /// Synthesize a flush commit from the pending live partial: the trailing
    /// `...` (the live rendering of a sentence-final pause) becomes `。`.
    /// Clears the live memo. Returns `None` when nothing is pending or the
    /// synthesized text would repeat the previous commit.
    pub fn take_flush_text(&self) -> Option<String> {
        let mut memo = self.text.lock().unwrap();
        if memo.last_live.is_empty() {
            return None;
        }
        let text = crate::postprocess::rewrite_flush_text(&memo.last_live);
        memo.last_live.clear();
        if text == memo.last_commit {
            return None;
        }
        memo.last_commit = text.clone();
        Some(text)
    }

    /// Record a live partial. Returns true when it differs from the last
    /// one sent and should therefore be emitted.
    pub fn update_live(&self, text: &str) -> bool {
        let mut memo = self.text.lock().unwrap();
        if memo.last_live == text {
            return false;
        }
        memo.last_live = text.to_string();
        true
    }

    /// Record a commit. Returns true when it differs from the last commit.
    pub fn update_commit(&self, text: &str) -> bool {
        let mut memo = self.text.lock().unwrap();
        if memo.last_commit == text {
            return false;
        }
        memo.last_commit = text.to_string();
        true
    }

    pub fn clear_live(&self) {
        self.text.lock().unwrap().last_live.clear();
    }

    pub fn last_live(&self) -> String {
        self.text.lock().unwrap().last_live.clone()
    }

    pub fn last_commit(&self) -> String {
        self.text.lock().unwrap().last_commit.clone()
    }

    /// Increment the idle counter, returning the new value.
    pub fn bump_idle(&self) -> u32 {
        self.idle_ticks.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn reset_idle(&self) {
        self.idle_ticks.store(0, Ordering::Relaxed);
    }

    /// True when the buffer has not moved since the scheduler's last pass.
    pub fn cursor_matches(&self, current: BufferCursor) -> bool {
        *self.cursor.lock().unwrap() == current
    }

    /// Record the position consumed by an enqueued snapshot.
    pub fn commit_cursor(&self, cursor: BufferCursor) {
        *self.cursor.lock().unwrap() = cursor;
    }

    /// Claim the single decode slot. Returns false when a decode for this
    /// session is already queued or running.
    pub fn try_begin_decode(&self) -> bool {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn finish_decode(&self) {
        self.in_flight.store(false, Ordering::Release);
    }

    pub fn decoding(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Record the identified speaker. Returns true when the label changed
    /// (and a notification is due). "unknown" never counts as a change.
    pub fn update_speaker(&self, label: &str) -> bool {
        if label == "unknown" {
            return false;
        }
        let mut speaker = self.speaker.lock().unwrap();
        if *speaker == label {
            return false;
        }
        *speaker = label.to_string();
        true
    }
}

/// Registry of live sessions, keyed by session id.
///
/// Reads (scheduler passes, lookups) vastly outnumber writes (connect,
/// disconnect), hence the reader-preferred `RwLock`.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<ClientSession>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn insert(&self, session: Arc<ClientSession>) {
        let mut sessions = self.sessions.write().unwrap();
        sessions.insert(session.id.clone(), session);
        info!(active = sessions.len(), "session registered");
    }

    pub fn get(&self, id: &str) -> Option<Arc<ClientSession>> {
        self.sessions.read().unwrap().get(id).cloned()
    }

    pub fn remove(&self, id: &str) -> Option<Arc<ClientSession>> {
        self.sessions.write().unwrap().remove(id)
    }

    pub fn len(&self) -> usize {
        self.sessions.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All sessions in connection order. The scheduler walks this every
    /// tick; connection order keeps service approximately round-robin.
    pub fn sessions_ordered(&self) -> Vec<Arc<ClientSession>> {
        let sessions = self.sessions.read().unwrap();
        let mut ordered: Vec<_> = sessions.values().cloned().collect();
        ordered.sort_by_key(|s| s.seq);
        ordered
    }

    /// Drop closed sessions that are no longer being decoded. Returns how
    /// many were removed.
    pub fn reap(&self) -> usize {
        let mut sessions = self.sessions.write().unwrap();
        let before = sessions.len();
        sessions.retain(|id, session| {
            let keep = session.state() != SessionState::Closed || session.decoding();
            if !keep {
                debug!(session_id = %id, "reaping closed session");
            }
            keep
        });
        before - sessions.len()
    }

    /// Spawn the periodic reaper sweep.
    pub fn spawn_reaper(self: &Arc<Self>, interval: std::time::Duration) {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let removed = registry.reap();
                if removed > 0 {
                    info!(removed, active = registry.len(), "reaper pass complete");
                }
            }
        });
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_session(id: &str) -> (Arc<ClientSession>, mpsc::UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(ClientSession::new(id.to_string(), 64_000, tx)), rx)
    }

    #[test]
    fn test_overflow_append_synthesizes_flush() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let session = ClientSession::new("s1".to_string(), 8, tx);
        session.update_live("你好...");

        let flush = session.append_audio(&[0.0; 10]);
        assert_eq!(flush.as_deref(), Some("你好。"));
        assert!(session.buffer.is_empty());
        assert_eq!(session.last_live(), "");
    }

    #[test]
    fn test_overflow_without_live_text_flushes_nothing() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let session = ClientSession::new("s1".to_string(), 8, tx);
        assert_eq!(session.append_audio(&[0.0; 10]), None);
        assert!(session.buffer.is_empty());
    }

    #[test]
    fn test_flush_text_deduplicates_against_last_commit() {
        let (session, _rx) = test_session("s1");
        session.update_commit("你好。");
        session.update_live("你好...");
        assert_eq!(session.take_flush_text(), None);
        // Live memo is consumed either way.
        assert_eq!(session.last_live(), "");
    }

    #[test]
    fn test_live_and_commit_dedup() {
        let (session, _rx) = test_session("s1");
        assert!(session.update_live("abc"));
        assert!(!session.update_live("abc"));
        assert!(session.update_live("abcd"));

        assert!(session.update_commit("done."));
        assert!(!session.update_commit("done."));
        assert_eq!(session.last_commit(), "done.");
    }

    #[test]
    fn test_decode_slot_is_exclusive() {
        let (session, _rx) = test_session("s1");
        assert!(session.try_begin_decode());
        assert!(!session.try_begin_decode());
        session.finish_decode();
        assert!(session.try_begin_decode());
    }

    #[test]
    fn test_cursor_tracking() {
        let (session, _rx) = test_session("s1");
        let cursor = session.buffer.cursor();
        assert!(session.cursor_matches(cursor));

        session.buffer.append(&[0.0; 4]);
        let moved = session.buffer.cursor();
        assert!(!session.cursor_matches(moved));

        session.commit_cursor(moved);
        assert!(session.cursor_matches(moved));
    }

    #[test]
    fn test_send_failure_marks_closing() {
        let (session, rx) = test_session("s1");
        drop(rx);
        assert!(!session.send(ServerMessage::Pong));
        assert_eq!(session.state(), SessionState::Closing);
    }

    #[test]
    fn test_speaker_change_detection() {
        let (session, _rx) = test_session("s1");
        assert!(!session.update_speaker("unknown"));
        assert!(session.update_speaker("speaker_1"));
        assert!(!session.update_speaker("speaker_1"));
        assert!(session.update_speaker("speaker_2"));
    }

    #[test]
    fn test_registry_reap_spares_decoding_sessions() {
        let registry = SessionRegistry::new();
        let (open, _rx1) = test_session("open");
        let (closed, _rx2) = test_session("closed");
        let (busy, _rx3) = test_session("busy");

        closed.mark_closed();
        busy.mark_closed();
        assert!(busy.try_begin_decode());

        registry.insert(open.clone());
        registry.insert(closed);
        registry.insert(busy.clone());

        assert_eq!(registry.reap(), 1);
        assert!(registry.get("closed").is_none());
        assert!(registry.get("busy").is_some());

        busy.finish_decode();
        assert_eq!(registry.reap(), 1);
        assert_eq!(registry.len(), 1);
        assert!(!registry.is_empty());
    }

    #[test]
    fn test_registry_order_follows_connection_order() {
        let registry = SessionRegistry::new();
        let (a, _rx1) = test_session("a");
        let (b, _rx2) = test_session("b");
        let (c, _rx3) = test_session("c");
        registry.insert(b.clone());
        registry.insert(c.clone());
        registry.insert(a.clone());

        let ordered = registry.sessions_ordered();
        let seqs: Vec<u64> = ordered.iter().map(|s| s.seq).collect();
        let mut sorted = seqs.clone();
        sorted.sort_unstable();
        assert_eq!(seqs, sorted);
    }
}
