//! Domain model (IDs, task state machine, records, errors).

pub mod batch;
pub mod errors;
pub mod ids;
pub mod lesson;
pub mod retry;
pub mod state;
pub mod task;

pub use batch::{BatchRecord, BatchState, BatchStatusSummary};
pub use errors::{BatchError, ErrorKind, InvalidTransition, ScrapeError, ScrapeStage, StoreError};
pub use ids::{BatchId, LocationCode, ParseIdError, TaskKey};
pub use lesson::{LessonRecord, LessonScope, LessonStats, LocationRef};
pub use retry::RetryPolicy;
pub use state::TaskStatus;
pub use task::TaskRecord;
