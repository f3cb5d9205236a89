//! Job lifecycle: records, polling and failure classification

pub mod classify;
pub mod model;
pub mod poller;

pub use classify::{classify, FailureClass};
pub use model::{BatchId, JobRecord, JobStatus, MediaKind, ToolId, VendorId};
pub use poller::{NoopObserver, PollConfig, PollObserver, Poller};
