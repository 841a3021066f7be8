use std::collections::HashMap;

use crate::model::cost::{CostModel, TaskCost};
use crate::model::task::{TaskId, TaskRequest};
use crate::model::worker::{DomainId, GroupingId};

/// One assignable matrix column: either a concrete grouping, or a proxy
/// standing in for "any grouping of this domain", resolved to a concrete
/// grouping only on confirmation.
#[derive(Clone, Debug)]
pub struct Candidate {
    size: usize,
    kind: CandidateKind,
}

#[derive(Clone, Debug)]
pub enum CandidateKind {
    Concrete(GroupingId),
    Proxy(DomainProxy),
}

impl Candidate {
    pub fn concrete(grouping: GroupingId, size: usize) -> Self {
        Candidate {
            size,
            kind: CandidateKind::Concrete(grouping),
        }
    }

    pub fn proxy(domain: DomainId, members: Vec<GroupingId>, size: usize) -> Self {
        Candidate {
            size,
            kind: CandidateKind::Proxy(DomainProxy {
                domain,
                members,
                chosen: HashMap::new(),
            }),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn kind(&self) -> &CandidateKind {
        &self.kind
    }

    /// Price this column for one task. A proxy answers with its cheapest
    /// member and remembers the choice for resolution.
    pub(crate) fn tender(&mut self, task: &TaskRequest, model: &dyn CostModel) -> TaskCost {
        match &mut self.kind {
            CandidateKind::Concrete(grouping) => model.calculate_cost(*grouping, task),
            CandidateKind::Proxy(proxy) => proxy.tender(task, model),
        }
    }

    /// The concrete grouping this column stands for once the given task is
    /// confirmed. `None` for a proxy that never priced the task.
    pub fn resolve(&self, task: TaskId) -> Option<GroupingId> {
        match &self.kind {
            CandidateKind::Concrete(grouping) => Some(*grouping),
            CandidateKind::Proxy(proxy) => proxy.chosen_for(task),
        }
    }
}

/// Facade over the concrete groupings of one domain. Each task sees the
/// best member cost; the winning member is memoized per task.
#[derive(Clone, Debug)]
pub struct DomainProxy {
    domain: DomainId,
    members: Vec<GroupingId>,
    chosen: HashMap<TaskId, (GroupingId, TaskCost)>,
}

impl DomainProxy {
    pub fn domain(&self) -> DomainId {
        self.domain
    }

    pub fn members(&self) -> &[GroupingId] {
        &self.members
    }

    fn tender(&mut self, task: &TaskRequest, model: &dyn CostModel) -> TaskCost {
        if let Some((_, cost)) = self.chosen.get(&task.id()) {
            return *cost;
        }
        let mut best: Option<(GroupingId, TaskCost)> = None;
        for &member in &self.members {
            let cost = model.calculate_cost(member, task);
            match best {
                Some((_, incumbent)) if cost.final_value() >= incumbent.final_value() => {}
                _ => best = Some((member, cost)),
            }
        }
        match best {
            Some(choice) => {
                self.chosen.insert(task.id(), choice);
                choice.1
            }
            None => TaskCost::INFEASIBLE,
        }
    }

    fn chosen_for(&self, task: TaskId) -> Option<GroupingId> {
        self.chosen.get(&task).map(|(grouping, _)| *grouping)
    }
}
