//! # Rolling Audio Buffer
//!
//! Per-session rolling buffer of f32 PCM samples. Audio is appended by the
//! ingest router, snapshotted by the recognition scheduler, and
//! prefix-truncated by the token post-processor when a sentence commits.
//!
//! ## Invariants:
//! - `len() <= max_samples` at every observable moment. An append that
//!   would exceed the ceiling wipes the buffer and reports the overflow so
//!   the session can synthesize a flush commit.
//! - All access serializes through the internal mutex; the lock is held for
//!   O(1) bookkeeping or the O(N) snapshot copy, never across a decode.

use std::collections::VecDeque;
use std::sync::Mutex;

/// Position marker for change detection: `(head_offset, len)` moves on
/// every append, truncate or clear, so the scheduler can tell "no new data
/// since my last pass" without diffing samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferCursor {
    pub head_offset: u64,
    pub len: usize,
}

/// Result of an append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendResult {
    /// Samples stored; `len` is the new buffer length.
    Appended { len: usize },
    /// The ceiling was hit; the buffer was wiped after storing, dropping
    /// `dropped` samples. The caller decides whether a flush commit is due.
    Overflowed { dropped: usize },
}

#[derive(Debug, Default)]
struct BufferInner {
    samples: VecDeque<f32>,
    /// Count of samples ever removed from the front. Part of the cursor.
    head_offset: u64,
}

/// Rolling sample store with a hard ceiling.
pub struct RollingBuffer {
    inner: Mutex<BufferInner>,
    max_samples: usize,
}

impl RollingBuffer {
    pub fn new(max_samples: usize) -> Self {
        Self {
            inner: Mutex::new(BufferInner::default()),
            max_samples,
        }
    }

    /// Append samples, enforcing the ceiling.
    pub fn append(&self, samples: &[f32]) -> AppendResult {
        let mut inner = self.inner.lock().unwrap();
        inner.samples.extend(samples.iter().copied());

        let len = inner.samples.len();
        if len > self.max_samples {
            inner.samples.clear();
            inner.head_offset += len as u64;
            return AppendResult::Overflowed { dropped: len };
        }
        AppendResult::Appended { len }
    }

    /// Owned copy of the current contents for the decoder.
    pub fn snapshot(&self) -> Vec<f32> {
        let inner = self.inner.lock().unwrap();
        inner.samples.iter().copied().collect()
    }

    /// Drop `count` samples from the front, clamped to the current length.
    /// Returns how many were actually dropped.
    pub fn truncate_prefix(&self, count: usize) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let dropped = count.min(inner.samples.len());
        inner.samples.drain(..dropped);
        inner.head_offset += dropped as u64;
        dropped
    }

    /// Wipe everything.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        let len = inner.samples.len();
        inner.samples.clear();
        inner.head_offset += len as u64;
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn cursor(&self) -> BufferCursor {
        let inner = self.inner.lock().unwrap();
        BufferCursor {
            head_offset: inner.head_offset,
            len: inner.samples.len(),
        }
    }

    pub fn duration_seconds(&self, sample_rate: u32) -> f64 {
        self.len() as f64 / sample_rate as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_snapshot() {
        let buffer = RollingBuffer::new(10);
        assert_eq!(buffer.append(&[0.1, 0.2, 0.3]), AppendResult::Appended { len: 3 });
        assert_eq!(buffer.snapshot(), vec![0.1, 0.2, 0.3]);
    }

    #[test]
    fn test_ceiling_wipes_buffer() {
        let buffer = RollingBuffer::new(4);
        buffer.append(&[0.0; 3]);
        let result = buffer.append(&[0.0; 3]);
        assert_eq!(result, AppendResult::Overflowed { dropped: 6 });
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_len_never_exceeds_ceiling() {
        let buffer = RollingBuffer::new(8);
        for _ in 0..20 {
            buffer.append(&[0.0; 3]);
            assert!(buffer.len() <= 8);
        }
    }

    #[test]
    fn test_truncate_prefix_clamps() {
        let buffer = RollingBuffer::new(10);
        buffer.append(&[1.0, 2.0, 3.0]);
        assert_eq!(buffer.truncate_prefix(2), 2);
        assert_eq!(buffer.snapshot(), vec![3.0]);
        assert_eq!(buffer.truncate_prefix(100), 1);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_cursor_moves_on_every_mutation() {
        let buffer = RollingBuffer::new(100);
        let initial = buffer.cursor();

        buffer.append(&[0.0; 5]);
        let after_append = buffer.cursor();
        assert_ne!(initial, after_append);

        buffer.truncate_prefix(2);
        let after_truncate = buffer.cursor();
        assert_ne!(after_append, after_truncate);

        buffer.clear();
        assert_ne!(after_truncate, buffer.cursor());

        // No mutation, no movement.
        assert_eq!(buffer.cursor(), buffer.cursor());
    }

    #[test]
    fn test_clear_advances_head_offset() {
        let buffer = RollingBuffer::new(100);
        buffer.append(&[0.0; 5]);
        buffer.clear();
        assert_eq!(buffer.cursor().head_offset, 5);
        // An append after clear is distinguishable from the pre-clear state.
        buffer.append(&[0.0; 5]);
        assert_eq!(
            buffer.cursor(),
            BufferCursor {
                head_offset: 5,
                len: 5
            }
        );
    }
}
