pub mod daemon;

pub use daemon::{Heartbeat, Tick, TickStream};
