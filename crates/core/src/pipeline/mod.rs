pub mod controller;
pub mod ledger;
pub mod schedule;

pub use controller::{PipelineController, RetryPolicy};
pub use ledger::{MemoryRunLedger, RunLedger, RunRecord};
pub use schedule::Trigger;
