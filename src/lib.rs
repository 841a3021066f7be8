//! Repeated minimum-cost matching of worker groupings to task requests.
//!
//! Each [`Auction`] solves one task batch against one snapshot of the
//! worker pool with the Hungarian method. When a confirmed outcome is
//! later invalidated by constraints outside the matching itself, the same
//! auction produces the next-best *distinct* assignment set on demand
//! instead of recomputing from scratch, and the [`AuctionHouse`]
//! backtracks across whole sequences of such matchings by rolling
//! commitments back in LIFO order.
//!
//! The domain model stays outside: cost functions come in through
//! [`CostModel`], commitments flow out through [`TaskSources`], and the
//! only shared mutable state is the [`WorkerPool`] availability, touched
//! exclusively by the house's commit and rollback paths. Everything is
//! single-threaded and synchronous; long searches are bounded by the
//! caller undoing auctions, not by any internal timeout.

pub use crate::auction::{Auction, AuctionState};
pub use crate::combinatorial::SubsetEnumerator;
pub use crate::house::AuctionHouse;
pub use crate::matrix::CostMatrix;
pub use crate::model::{
    Assignment, Candidate, CandidateKind, CostModel, DomainId, DomainProxy, EntryToken, Grouping,
    GroupingId, SourceId, TaskBatch, TaskCost, TaskId, TaskRequest, TaskSources, WorkerDomain,
    WorkerId, WorkerPool,
};
pub use crate::solver::{AssignmentSolver, Edge, Viability};

pub mod auction;
pub mod combinatorial;
pub mod house;
pub mod matrix;
pub mod model;
pub mod solver;
