//! Scheduling engine: provenance counting, join watchers, and the dispatcher.

pub mod dispatcher;
pub mod history;
pub mod provenance;
pub mod snapshot;
pub mod watch;

pub use dispatcher::Dispatcher;
pub use history::{FailedRecord, History, TaskRecord, WorkSubject};
pub use provenance::ProvenanceTracker;
pub use snapshot::{DispatcherStats, TaskInfo};
pub use watch::WatchRegistry;
