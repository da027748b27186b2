//! # Recognition Scheduler
//!
//! Decides which session to decode next and keeps the decoder saturated
//! without letting any client monopolize it.
//!
//! A tick loop (default 10ms) walks every open session in connection
//! order. Sessions whose buffers grew since the last pass get snapshotted
//! and queued; sessions whose buffers sat still accumulate idle ticks until
//! the stall window expires and any pending live partial is flushed as a
//! commit. The queue is bounded by the worker count: when it is full the
//! session is simply skipped this tick and retried on the next one.
//!
//! ## Concurrency guarantees:
//! - at most one outstanding decode per session (`in_flight` flag — a
//!   queued or running session is never re-queued)
//! - at most `workers` decodes in flight overall (semaphore)
//! - every pass considers every session, so none can starve another

use crate::audio::{ClientSession, SessionRegistry};
use crate::dispatch::{self, FlushKind};
use crate::postprocess::PostProcessor;
use crate::state::AppState;
use crate::transcription::engine::RecognitionEngine;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tracing::{error, info, warn};

/// One unit of decode work: an owned snapshot plus a weak handle back to
/// the session. The session may die while the task waits; the worker just
/// drops the work in that case.
pub struct DecodeTask {
    session: Weak<ClientSession>,
    snapshot: Vec<f32>,
}

pub struct Scheduler {
    state: AppState,
    registry: Arc<SessionRegistry>,
    engine: Arc<RecognitionEngine>,
    post: Arc<PostProcessor>,
    tick: Duration,
    min_decode_samples: usize,
    stall_ticks: u32,
    workers: usize,
}

impl Scheduler {
    pub fn new(
        state: AppState,
        registry: Arc<SessionRegistry>,
        engine: Arc<RecognitionEngine>,
    ) -> Self {
        let config = state.get_config();
        let post = Arc::new(PostProcessor::new(
            config.audio.sample_rate,
            config.recognition.lead_guard_tokens,
            config.recognition.lookahead_tokens,
        ));
        Self {
            state,
            registry,
            engine,
            post,
            tick: Duration::from_millis(config.recognition.tick_ms),
            min_decode_samples: config.min_decode_samples(),
            stall_ticks: config.recognition.stall_ticks,
            workers: config.effective_workers().max(1),
        }
    }

    /// Start the tick loop and the worker pool.
    pub fn spawn(self: Arc<Self>) {
        let (queue_tx, queue_rx) = mpsc::channel::<DecodeTask>(self.workers);

        info!(
            workers = self.workers,
            tick_ms = self.tick.as_millis() as u64,
            stall_ticks = self.stall_ticks,
            "recognition scheduler starting"
        );

        let workers = Arc::clone(&self);
        tokio::spawn(async move {
            workers.run_workers(queue_rx).await;
        });

        let ticker = Arc::clone(&self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(ticker.tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                ticker.pass(&queue_tx);
            }
        });
    }

    /// One scheduling pass over the registry.
    pub(crate) fn pass(&self, queue: &mpsc::Sender<DecodeTask>) {
        for session in self.registry.sessions_ordered() {
            if !session.is_open() || session.decoding() {
                continue;
            }

            let cursor = session.buffer.cursor();
            if cursor.len < self.min_decode_samples {
                continue;
            }

            if session.cursor_matches(cursor) {
                // Nothing new arrived. Count toward the stall window; once
                // it expires, a pending live partial is promoted to a
                // commit (the user may simply be between sentences, so the
                // audio buffer is left alone).
                let idle = session.bump_idle();
                if idle > self.stall_ticks {
                    session.reset_idle();
                    if let Some(text) = session.take_flush_text() {
                        info!(session_id = %session.id, "stall window expired, flushing live text");
                        dispatch::emit_flush_commit(&self.state, &session, &text, FlushKind::Stall);
                    }
                }
                continue;
            }

            if !session.try_begin_decode() {
                continue;
            }
            let task = DecodeTask {
                session: Arc::downgrade(&session),
                snapshot: session.buffer.snapshot(),
            };
            match queue.try_send(task) {
                Ok(()) => {
                    session.commit_cursor(cursor);
                    session.reset_idle();
                }
                Err(_) => {
                    // Queue full: back-pressure. Release the slot and let a
                    // later tick pick the session up again; its cursor was
                    // not consumed so the new-data check still fires.
                    session.finish_decode();
                }
            }
        }
    }

    async fn run_workers(self: Arc<Self>, mut queue: mpsc::Receiver<DecodeTask>) {
        let semaphore = Arc::new(Semaphore::new(self.workers));
        while let Some(task) = queue.recv().await {
            let permit = match Arc::clone(&semaphore).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let state = self.state.clone();
            let engine = Arc::clone(&self.engine);
            let post = Arc::clone(&self.post);
            tokio::spawn(async move {
                let _permit = permit;
                Self::run_task(state, engine, post, task).await;
            });
        }
    }

    /// Decode one snapshot and hand the result to the post-processor.
    pub(crate) async fn run_task(
        state: AppState,
        engine: Arc<RecognitionEngine>,
        post: Arc<PostProcessor>,
        task: DecodeTask,
    ) {
        let Some(session) = task.session.upgrade() else {
            return;
        };
        let snapshot = task.snapshot;

        let engine_call = Arc::clone(&engine);
        let joined = tokio::task::spawn_blocking(move || engine_call.decode(&snapshot)).await;

        match joined {
            Ok(Ok(result)) => {
                state.record_decode(true);
                session.reset_idle();
                if session.is_open() {
                    let emission = post.process(&session, &result);
                    if let Some(live) = emission.live {
                        dispatch::emit_live(&state, &session, &live);
                    }
                    if let Some(commit) = emission.commit {
                        dispatch::emit_commit(&state, &session, &commit);
                    }
                }
                // A result for a closing session is discarded: the socket
                // is gone and nobody is listening.
            }
            Ok(Err(err)) => {
                // Skip this snapshot without touching session state; the
                // next tick retries with whatever audio is buffered then.
                state.record_decode(false);
                warn!(session_id = %session.id, error = %err, "decode failed, snapshot skipped");
            }
            Err(err) => {
                state.record_decode(false);
                error!(session_id = %session.id, error = %err, "decode task aborted");
            }
        }

        session.finish_decode();
    }

    #[cfg(test)]
    pub(crate) fn queue_capacity(&self) -> usize {
        self.workers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::ingest::ServerMessage;
    use crate::transcription::engine::{DecodeResult, Segment, SpeechDecoder, Token};
    use anyhow::anyhow;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Decoder that replays a script of canned results.
    struct ScriptedDecoder {
        script: Mutex<VecDeque<anyhow::Result<DecodeResult>>>,
    }

    impl ScriptedDecoder {
        fn new(script: Vec<anyhow::Result<DecodeResult>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
            }
        }
    }

    impl SpeechDecoder for ScriptedDecoder {
        fn decode(&self, _samples: &[f32], _sample_rate: u32) -> anyhow::Result<DecodeResult> {
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(DecodeResult::default()))
        }
    }

    fn segment(texts: &[&str], step_ms: f32) -> DecodeResult {
        let tokens: Vec<Token> = texts
            .iter()
            .enumerate()
            .map(|(i, t)| Token {
                text: t.to_string(),
                t_begin_ms: i as f32 * step_ms,
                t_end_ms: (i + 1) as f32 * step_ms,
            })
            .collect();
        DecodeResult {
            segments: vec![Segment {
                text: texts.concat(),
                tokens,
            }],
        }
    }

    fn test_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.recognition.stall_ticks = 3;
        config.recognition.workers = 2;
        config
    }

    fn scheduler_with(
        config: AppConfig,
        script: Vec<anyhow::Result<DecodeResult>>,
    ) -> (Arc<Scheduler>, AppState, Arc<SessionRegistry>) {
        let state = AppState::new(config.clone());
        let registry = Arc::new(SessionRegistry::new());
        let engine = Arc::new(RecognitionEngine::new(
            Arc::new(ScriptedDecoder::new(script)),
            config.audio.sample_rate,
        ));
        let scheduler = Arc::new(Scheduler::new(state.clone(), Arc::clone(&registry), engine));
        (scheduler, state, registry)
    }

    fn open_session(
        registry: &SessionRegistry,
        id: &str,
        samples: usize,
    ) -> (
        Arc<ClientSession>,
        mpsc::UnboundedReceiver<ServerMessage>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Arc::new(ClientSession::new(id.to_string(), 320_000, tx));
        session.buffer.append(&vec![0.0; samples]);
        registry.insert(Arc::clone(&session));
        (session, rx)
    }

    #[tokio::test]
    async fn test_short_buffers_are_skipped() {
        let (scheduler, _state, registry) = scheduler_with(test_config(), vec![]);
        let (session, _rx) = open_session(&registry, "s1", 100);

        let (tx, mut rx) = mpsc::channel(scheduler.queue_capacity());
        scheduler.pass(&tx);

        assert!(rx.try_recv().is_err());
        assert!(!session.decoding());
    }

    #[tokio::test]
    async fn test_ready_session_is_queued_once() {
        let (scheduler, _state, registry) = scheduler_with(test_config(), vec![]);
        let (session, _rx) = open_session(&registry, "s1", 16_000);

        let (tx, mut rx) = mpsc::channel(scheduler.queue_capacity());
        scheduler.pass(&tx);
        scheduler.pass(&tx);

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
        assert!(session.decoding());
    }

    #[tokio::test]
    async fn test_queue_full_applies_backpressure() {
        let (scheduler, _state, registry) = scheduler_with(test_config(), vec![]);
        let (_s1, _rx1) = open_session(&registry, "s1", 16_000);
        let (s2, _rx2) = open_session(&registry, "s2", 16_000);

        let (tx, mut rx) = mpsc::channel(1);
        scheduler.pass(&tx);

        // Only one slot: the second session must not be marked in-flight.
        assert!(!s2.decoding());

        // Drain and try again: the skipped session gets its turn.
        let _ = rx.try_recv().unwrap();
        scheduler.pass(&tx);
        assert!(s2.decoding());
    }

    #[tokio::test]
    async fn test_closed_sessions_are_ignored() {
        let (scheduler, _state, registry) = scheduler_with(test_config(), vec![]);
        let (session, _rx) = open_session(&registry, "s1", 16_000);
        session.mark_closed();

        let (tx, mut rx) = mpsc::channel(scheduler.queue_capacity());
        scheduler.pass(&tx);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stall_window_flushes_live_text() {
        let (scheduler, _state, registry) = scheduler_with(test_config(), vec![]);
        let (session, mut rx) = open_session(&registry, "s1", 16_000);
        session.update_live("还在想...");
        // Pretend the snapshot was already consumed: cursor is current.
        session.commit_cursor(session.buffer.cursor());

        let (tx, _queue_rx) = mpsc::channel(scheduler.queue_capacity());
        // stall_ticks = 3: the fourth unchanged pass flushes.
        for _ in 0..4 {
            scheduler.pass(&tx);
        }

        assert_eq!(
            rx.try_recv().unwrap(),
            ServerMessage::TextResult {
                data: "T:还在想。".to_string()
            }
        );
        // Buffer is untouched by a stall flush.
        assert_eq!(session.buffer.len(), 16_000);
    }

    #[tokio::test]
    async fn test_stall_without_live_text_is_quiet() {
        let (scheduler, _state, registry) = scheduler_with(test_config(), vec![]);
        let (session, mut rx) = open_session(&registry, "s1", 16_000);
        session.commit_cursor(session.buffer.cursor());

        let (tx, _queue_rx) = mpsc::channel(scheduler.queue_capacity());
        for _ in 0..10 {
            scheduler.pass(&tx);
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_live_then_commit_over_two_decodes() {
        let config = test_config();
        let live_result = segment(&["你", "好", "世", "界"], 100.0);
        let commit_result = segment(&["你", "好", "世", "界", "。"], 500.0);
        let (scheduler, state, registry) =
            scheduler_with(config, vec![Ok(live_result), Ok(commit_result)]);
        let (session, mut rx) = open_session(&registry, "s1", 40_000);

        let engine = Arc::clone(&scheduler.engine);
        let post = Arc::clone(&scheduler.post);

        for _ in 0..2 {
            assert!(session.try_begin_decode() || session.decoding());
            let task = DecodeTask {
                session: Arc::downgrade(&session),
                snapshot: session.buffer.snapshot(),
            };
            Scheduler::run_task(state.clone(), Arc::clone(&engine), Arc::clone(&post), task).await;
        }

        assert_eq!(
            rx.try_recv().unwrap(),
            ServerMessage::TextResult {
                data: "L:你好世界".to_string()
            }
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            ServerMessage::TextResult {
                data: "T:你好世界".to_string()
            }
        );
        // The committed span (2500ms) was dropped from the buffer.
        assert_eq!(session.buffer.len(), 0);
        assert!(!session.decoding());
    }

    #[tokio::test]
    async fn test_decode_error_skips_snapshot() {
        let (scheduler, state, registry) =
            scheduler_with(test_config(), vec![Err(anyhow!("model exploded"))]);
        let (session, mut rx) = open_session(&registry, "s1", 16_000);

        assert!(session.try_begin_decode());
        let task = DecodeTask {
            session: Arc::downgrade(&session),
            snapshot: session.buffer.snapshot(),
        };
        Scheduler::run_task(
            state.clone(),
            Arc::clone(&scheduler.engine),
            Arc::clone(&scheduler.post),
            task,
        )
        .await;

        assert!(rx.try_recv().is_err());
        assert_eq!(session.buffer.len(), 16_000);
        assert!(!session.decoding());
        assert_eq!(state.get_metrics_snapshot().decode_errors, 1);
    }

    #[tokio::test]
    async fn test_result_for_closing_session_is_discarded() {
        let commit_result = segment(&["你", "好", "世", "界", "。"], 500.0);
        let (scheduler, state, registry) = scheduler_with(test_config(), vec![Ok(commit_result)]);
        let (session, mut rx) = open_session(&registry, "s1", 40_000);

        assert!(session.try_begin_decode());
        let task = DecodeTask {
            session: Arc::downgrade(&session),
            snapshot: session.buffer.snapshot(),
        };
        session.set_state(crate::audio::SessionState::Closing);

        Scheduler::run_task(
            state.clone(),
            Arc::clone(&scheduler.engine),
            Arc::clone(&scheduler.post),
            task,
        )
        .await;

        assert!(rx.try_recv().is_err());
        assert!(!session.decoding());
    }

    #[tokio::test]
    async fn test_dead_session_drops_work() {
        let (scheduler, state, _registry) = scheduler_with(test_config(), vec![]);
        let (tx, _rx) = mpsc::unbounded_channel();
        let session = Arc::new(ClientSession::new("gone".to_string(), 320_000, tx));
        let task = DecodeTask {
            session: Arc::downgrade(&session),
            snapshot: vec![0.0; 16_000],
        };
        drop(session);

        Scheduler::run_task(
            state.clone(),
            Arc::clone(&scheduler.engine),
            Arc::clone(&scheduler.post),
            task,
        )
        .await;
        // Nothing decoded for a dead session.
        assert_eq!(state.get_metrics_snapshot().decode_count, 0);
    }
}
