//! # Audio State
//!
//! Per-client audio state: the rolling sample buffer and the session record
//! that owns it, plus the registry the rest of the pipeline looks sessions
//! up in.

pub mod buffer;
pub mod session;

pub use buffer::{AppendResult, BufferCursor, RollingBuffer};
pub use session::{ClientSession, SessionRegistry, SessionState};
