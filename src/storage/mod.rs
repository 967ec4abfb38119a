//! Persistent storage for Stratum.
//!
//! Layer 1 (raw outcomes) lives behind the [`OutcomeStore`] trait with
//! file-based and in-memory backends. Layers 2 through 4 live in the
//! [`LayerStore`], which commits derived records and cursors atomically.

pub mod file;
pub mod layers;
pub mod memory;
pub mod retention;
pub mod traits;

pub use file::FileOutcomeStore;
pub use layers::{Cursor, DeadLetter, LayerState, LayerStore, Transition};
pub use memory::MemoryOutcomeStore;
pub use retention::{weekly_rollups, DailyRollup, RetentionReport, WeeklyRollup};
pub use traits::{AppendAck, OutcomeStore};
