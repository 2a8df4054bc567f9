//! Batched branch mirroring.
//!
//! [`orchestrator::SyncOrchestrator`] drives the run; the other modules are
//! its collaborators, leaves first: [`graph`] reads history, [`planner`] cuts
//! it into batches, [`lfs`] prefetches large objects, [`push`] moves the
//! destination and [`verify`] checks the result.

pub mod confirm;
pub mod graph;
pub mod lfs;
pub mod model;
pub mod orchestrator;
pub mod planner;
pub mod push;
pub mod verify;

#[cfg(test)]
pub mod testing;

pub use confirm::{AutoApprove, Confirm, ConsoleConfirm};
pub use orchestrator::{SyncOrchestrator, SyncReport};
