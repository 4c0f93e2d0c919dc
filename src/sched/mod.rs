//! Worker pool and stream fan-out.

pub(crate) mod pool;
pub mod scheduler;

pub use scheduler::StreamScheduler;
