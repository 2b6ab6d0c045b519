pub mod ring;
pub mod schema;
pub mod store;

pub use ring::RingBuffer;
pub use schema::{HighWaterMarks, Snapshot, SCHEMA_VERSION};
pub use store::{HistoryEntry, Loaded, StateStore};
