use std::collections::BTreeSet;

use crate::model::task::{SourceId, TaskId};
use crate::model::worker::{DomainId, GroupingId};

/// Task-source collaborator. Sources mint the task requests, learn which
/// grouping won each of them, and give commitments back when an auction is
/// undone. All calls are keyed by the opaque [`SourceId`] carried on the
/// request.
pub trait TaskSources {
    /// Commit a concrete grouping to the given task.
    fn receive_grouping(&mut self, source: SourceId, task: TaskId, grouping: GroupingId);

    /// Revoke a previously committed grouping. Exact inverse of
    /// [`receive_grouping`](Self::receive_grouping).
    fn recall_grouping(&mut self, source: SourceId, task: TaskId, grouping: GroupingId);

    /// Domains the source has not yet been allocated into; proxy pools are
    /// restricted to these.
    fn unused_domains(&self, source: SourceId) -> BTreeSet<DomainId>;

    fn total_bandwidth(&self, source: SourceId) -> u32;

    fn max_bandwidth(&self, source: SourceId) -> u32;
}
