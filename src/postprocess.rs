//! # Token Post-Processor
//!
//! Turns one decode result into at most one live partial or one commit for
//! the originating session.
//!
//! A sentence commits when a terminator token is found past the guard
//! positions; the committed audio span is then dropped from the front of
//! the session's rolling buffer using the terminator token's end timestamp.
//! Anything short of a commit becomes a live partial, deduplicated against
//! the last one sent.
//!
//! ## Normalization:
//! - live text: a trailing run of `。` renders as `...` (the sentence may
//!   still grow), leading `,`/`，` is stripped, and a bare `.` is noise.
//! - commit text: leading `,`/`，` stripped, trailing `。` run dropped.
//! - flush text: the live `...` tail is rewritten back to `。`.

use crate::audio::ClientSession;
use crate::transcription::engine::DecodeResult;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

/// Token texts that end a sentence on their own.
const TERMINATOR_TOKENS: [&str; 6] = [".", "!", "?", "。", "！", "？"];

static LEADING_COMMA: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[,，]+").unwrap());
static TRAILING_PERIOD_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"。+$").unwrap());
static TRAILING_ELLIPSIS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\.\.\.$").unwrap());

/// What a post-processing pass decided to emit.
#[derive(Debug, Default, PartialEq)]
pub struct Emission {
    pub live: Option<String>,
    pub commit: Option<String>,
}

/// Location of the sentence boundary within a decode result.
#[derive(Debug, Clone, Copy)]
struct Boundary {
    segment_idx: usize,
    token_idx: usize,
    end_ms: f32,
}

pub struct PostProcessor {
    sample_rate: u32,
    /// Terminators within the first N tokens of their segment are treated
    /// as hallucinated leading punctuation.
    lead_guard_tokens: usize,
    /// Minimum tokens after the boundary's segment for a mid-result commit.
    lookahead_tokens: usize,
}

impl PostProcessor {
    pub fn new(sample_rate: u32, lead_guard_tokens: usize, lookahead_tokens: usize) -> Self {
        Self {
            sample_rate,
            lead_guard_tokens,
            lookahead_tokens,
        }
    }

    /// Classify one decode result for `session`, updating its memos and
    /// truncating its buffer on commit.
    pub fn process(&self, session: &ClientSession, result: &DecodeResult) -> Emission {
        if let Some(boundary) = self.find_boundary(result) {
            let text = self.compose_commit_text(result, boundary);
            if !text.is_empty() {
                return self.commit(session, result, boundary, text);
            }
            // A boundary that reduces to punctuation alone is not a
            // sentence; fall through to the live path.
        }
        self.live(session, result)
    }

    /// First terminator token that survives both guards.
    fn find_boundary(&self, result: &DecodeResult) -> Option<Boundary> {
        let last_segment = result.segments.len().saturating_sub(1);

        for (segment_idx, segment) in result.segments.iter().enumerate() {
            let mut accumulated = String::new();
            for (token_idx, token) in segment.tokens.iter().enumerate() {
                accumulated.push_str(&token.text);

                let is_terminator = TERMINATOR_TOKENS.contains(&token.text.as_str())
                    || accumulated.ends_with('。')
                    || accumulated.ends_with('？');
                if !is_terminator {
                    continue;
                }

                // The boundary is the FIRST terminator in the result; if it
                // fails the guards nothing later in the result may commit
                // either, so the whole result stays live.
                if token_idx < self.lead_guard_tokens {
                    return None;
                }
                let tokens_after_segment: usize = result.segments[segment_idx + 1..]
                    .iter()
                    .map(|s| s.tokens.len())
                    .sum();
                if segment_idx != last_segment && tokens_after_segment < self.lookahead_tokens {
                    return None;
                }

                return Some(Boundary {
                    segment_idx,
                    token_idx,
                    end_ms: token.t_end_ms,
                });
            }
        }
        None
    }

    /// Token texts from the start of the result through the boundary token,
    /// normalized for commit.
    fn compose_commit_text(&self, result: &DecodeResult, boundary: Boundary) -> String {
        let mut text = String::new();
        for segment in &result.segments[..boundary.segment_idx] {
            for token in &segment.tokens {
                text.push_str(&token.text);
            }
        }
        for token in &result.segments[boundary.segment_idx].tokens[..=boundary.token_idx] {
            text.push_str(&token.text);
        }

        let text = LEADING_COMMA.replace(&text, "");
        TRAILING_PERIOD_RUN.replace(&text, "").into_owned()
    }

    fn commit(
        &self,
        session: &ClientSession,
        _result: &DecodeResult,
        boundary: Boundary,
        text: String,
    ) -> Emission {
        let samples_to_drop =
            (boundary.end_ms as f64 / 1000.0 * self.sample_rate as f64).floor() as usize;
        let dropped = session.buffer.truncate_prefix(samples_to_drop);
        session.clear_live();

        debug!(
            session_id = %session.id,
            end_ms = boundary.end_ms,
            dropped,
            "sentence committed"
        );

        let commit = if session.update_commit(&text) {
            Some(text)
        } else {
            None
        };
        Emission {
            live: None,
            commit,
        }
    }

    fn live(&self, session: &ClientSession, result: &DecodeResult) -> Emission {
        let mut text = String::new();
        for segment in &result.segments {
            text.push_str(&segment.text);
        }

        let text = TRAILING_PERIOD_RUN.replace(&text, "...");
        let text = LEADING_COMMA.replace(&text, "").into_owned();

        if text.is_empty() || text == "." {
            return Emission::default();
        }

        let live = if session.update_live(&text) {
            Some(text)
        } else {
            None
        };
        Emission { live, commit: None }
    }
}

/// Turn a pending live partial into flush-commit text: the `...` tail that
/// stood in for an unconfirmed sentence end becomes a full stop.
pub fn rewrite_flush_text(live_text: &str) -> String {
    TRAILING_ELLIPSIS.replace(live_text, "。").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::ServerMessage;
    use crate::transcription::engine::{DecodeResult, Segment, Token};
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn session_with_samples(
        samples: usize,
    ) -> (Arc<ClientSession>, mpsc::UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Arc::new(ClientSession::new("s1".to_string(), 320_000, tx));
        session.buffer.append(&vec![0.0; samples]);
        (session, rx)
    }

    fn processor() -> PostProcessor {
        PostProcessor::new(16_000, 3, 10)
    }

    fn tokens(texts: &[&str], step_ms: f32) -> Vec<Token> {
        texts
            .iter()
            .enumerate()
            .map(|(i, t)| Token {
                text: t.to_string(),
                t_begin_ms: i as f32 * step_ms,
                t_end_ms: (i + 1) as f32 * step_ms,
            })
            .collect()
    }

    fn single_segment(texts: &[&str], step_ms: f32) -> DecodeResult {
        let tokens = tokens(texts, step_ms);
        DecodeResult {
            segments: vec![Segment {
                text: texts.concat(),
                tokens,
            }],
        }
    }

    #[test]
    fn test_terminated_sentence_commits_and_truncates() {
        let (session, _rx) = session_with_samples(40_000);
        // Last token ends at 2500ms: six tokens spanning ~417ms each.
        let result = single_segment(&["你", "好", "，", "世", "界", "。"], 2500.0 / 6.0);

        let emission = processor().process(&session, &result);
        assert_eq!(emission.commit.as_deref(), Some("你好，世界"));
        assert_eq!(emission.live, None);
        // floor(2500 / 1000 * 16000) = 40000 samples dropped.
        assert_eq!(session.buffer.len(), 0);
        assert_eq!(session.last_live(), "");
    }

    #[test]
    fn test_commit_truncation_clamps_to_buffer() {
        let (session, _rx) = session_with_samples(10_000);
        let result = single_segment(&["你", "好", "，", "世", "界", "。"], 2500.0 / 6.0);

        processor().process(&session, &result);
        assert!(session.buffer.is_empty());
    }

    #[test]
    fn test_live_partial_renders_pending_period_as_ellipsis() {
        let (session, _rx) = session_with_samples(16_000);
        let result = DecodeResult {
            segments: vec![Segment {
                text: "你好。。".to_string(),
                tokens: tokens(&["你", "好"], 100.0),
            }],
        };

        let emission = processor().process(&session, &result);
        assert_eq!(emission.live.as_deref(), Some("你好..."));
        assert_eq!(emission.commit, None);
    }

    #[test]
    fn test_live_dedup_suppresses_repeat() {
        let (session, _rx) = session_with_samples(16_000);
        let result = DecodeResult {
            segments: vec![Segment {
                text: "正在说".to_string(),
                tokens: tokens(&["正", "在", "说"], 100.0),
            }],
        };

        let first = processor().process(&session, &result);
        assert_eq!(first.live.as_deref(), Some("正在说"));

        let second = processor().process(&session, &result);
        assert_eq!(second, Emission::default());
    }

    #[test]
    fn test_leading_comma_stripped_from_live() {
        let (session, _rx) = session_with_samples(16_000);
        let result = DecodeResult {
            segments: vec![Segment {
                text: "，你好".to_string(),
                tokens: tokens(&["，", "你", "好"], 100.0),
            }],
        };

        let emission = processor().process(&session, &result);
        assert_eq!(emission.live.as_deref(), Some("你好"));
    }

    #[test]
    fn test_early_terminator_never_commits() {
        let (session, _rx) = session_with_samples(16_000);
        let result = single_segment(&[".", "好", "的", "。"], 100.0);

        let emission = processor().process(&session, &result);
        assert_eq!(emission.commit, None);
        assert!(emission.live.is_some());
        // The buffer is untouched without a commit.
        assert_eq!(session.buffer.len(), 16_000);
    }

    #[test]
    fn test_mid_result_commit_requires_lookahead() {
        let (session, _rx) = session_with_samples(32_000);
        let trailing = Segment {
            text: "然后".to_string(),
            tokens: tokens(&["然", "后"], 100.0),
        };
        let result = DecodeResult {
            segments: vec![
                single_segment(&["你", "好", "世", "界", "。"], 100.0).segments[0].clone(),
                trailing,
            ],
        };

        // Only 2 tokens follow the terminated segment: stay live.
        let emission = processor().process(&session, &result);
        assert_eq!(emission.commit, None);
        assert!(emission.live.is_some());
    }

    #[test]
    fn test_mid_result_commit_with_enough_lookahead() {
        let (session, _rx) = session_with_samples(64_000);
        let trailing = Segment {
            text: "后续的很长的一句话还在继续".to_string(),
            tokens: tokens(
                &["后", "续", "的", "很", "长", "的", "一", "句", "话", "还", "在"],
                100.0,
            ),
        };
        let result = DecodeResult {
            segments: vec![
                single_segment(&["你", "好", "世", "界", "。"], 100.0).segments[0].clone(),
                trailing,
            ],
        };

        let emission = processor().process(&session, &result);
        assert_eq!(emission.commit.as_deref(), Some("你好世界"));
    }

    #[test]
    fn test_commit_dedup_still_truncates() {
        let (session, _rx) = session_with_samples(40_000);
        session.update_commit("你好世界");
        let result = single_segment(&["你", "好", "世", "界", "。"], 500.0);

        let emission = processor().process(&session, &result);
        assert_eq!(emission.commit, None);
        // floor(2500/1000*16000) dropped even though the text repeated.
        assert_eq!(session.buffer.len(), 0);
    }

    #[test]
    fn test_punctuation_only_boundary_stays_live() {
        let (session, _rx) = session_with_samples(16_000);
        let result = single_segment(&["，", "，", "，", "。"], 100.0);

        let emission = processor().process(&session, &result);
        assert_eq!(emission.commit, None);
        assert_eq!(emission.live.as_deref(), Some("..."));
    }

    #[test]
    fn test_bare_period_live_is_noise() {
        let (session, _rx) = session_with_samples(16_000);
        let result = DecodeResult {
            segments: vec![Segment {
                text: ".".to_string(),
                tokens: tokens(&["."], 100.0),
            }],
        };

        let emission = processor().process(&session, &result);
        assert_eq!(emission, Emission::default());
    }

    #[test]
    fn test_empty_result_emits_nothing() {
        let (session, _rx) = session_with_samples(16_000);
        let emission = processor().process(&session, &DecodeResult::default());
        assert_eq!(emission, Emission::default());
    }

    #[test]
    fn test_accumulated_tail_terminator() {
        let (session, _rx) = session_with_samples(40_000);
        // No single token matches a terminator, but the accumulated text
        // ends with a full-width question mark.
        let result = single_segment(&["你", "去", "哪", "儿", "了？"], 500.0);

        let emission = processor().process(&session, &result);
        assert_eq!(emission.commit.as_deref(), Some("你去哪儿了？"));
    }

    #[test]
    fn test_rewrite_flush_text() {
        assert_eq!(rewrite_flush_text("你好..."), "你好。");
        assert_eq!(rewrite_flush_text("你好"), "你好");
        assert_eq!(rewrite_flush_text("..."), "。");
    }
}
