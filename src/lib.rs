//! # planq
//!
//! Concurrent task dispatcher with provenance tracking.
//!
//! Workers consume tasks and publish derived tasks. Every task carries the
//! chain of (worker, id) pairs that produced it; the dispatcher reference
//! counts each prefix of that chain so a worker can watch a prefix and be
//! notified once all work descending from it has finished. Failed tasks are
//! retried up to a per-worker limit, and bounded histories of completed and
//! failed work are kept for a debug dashboard.

pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod model;
pub mod telemetry;
pub mod worker;

pub use engine::Dispatcher;
pub use model::{ProvenanceChain, ProvenanceEntry, Task};
pub use worker::{WorkContext, Worker};
