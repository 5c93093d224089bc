//! Append-only per-room game log.
//!
//! Every state delta, player setup record, LLM trace, and fault gets
//! one JSON entry in `logs/<room>.json`. The file is the sole source of
//! truth for replay reconstruction, so writes are serialized behind a
//! single writer task per room and the record shapes are locked by
//! tests.

mod diff;
mod error;
mod record;
mod writer;

pub use diff::{find_differences, state_changes};
pub use error::LogError;
pub use record::{LogRecord, now_iso};
pub use writer::GameLog;
