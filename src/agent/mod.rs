pub mod evolution;
pub mod loop_;
pub mod prompt;
pub mod sampler;
pub mod selector;

pub use loop_::{Orchestrator, RunSummary, TickReport};
pub use sampler::{FixedSampler, RngSampler, Sampler};
