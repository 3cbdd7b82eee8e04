pub mod batch;
pub mod intake;
pub mod manager;
pub mod reaper;
pub mod runner;
pub mod types;

#[cfg(test)]
mod tests;

pub use manager::{JobManager, NewBatch, NewJob};
pub use types::{Batch, Job};
