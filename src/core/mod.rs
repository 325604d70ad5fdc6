// Core build engine: plan partitioning, task assignment and the per-sandbox
// execution loop

pub mod executor;
pub mod partitioner;
pub mod scheduler;

pub use executor::*;
pub use partitioner::*;
pub use scheduler::*;
