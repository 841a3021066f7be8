pub use self::candidate::{Candidate, CandidateKind, DomainProxy};
pub use self::cost::{CostModel, TaskCost};
pub use self::source::TaskSources;
pub use self::task::{Assignment, EntryToken, SourceId, TaskBatch, TaskId, TaskRequest};
pub use self::worker::{DomainId, Grouping, GroupingId, WorkerDomain, WorkerId, WorkerPool};

mod candidate;
mod cost;
mod source;
mod task;
mod worker;
