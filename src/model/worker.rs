use std::collections::{BTreeMap, BTreeSet};

use tracing::trace;

/// An atomic capability unit. The pool only tracks availability; what a
/// worker can do is the cost collaborator's business.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct WorkerId(pub usize);

/// A set of workers treated as one assignable column.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct GroupingId(pub usize);

/// A named subset of the pool used to bound how deep allocation may go
/// into one dimension (a day, a site, a shift).
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct DomainId(pub usize);

#[derive(Clone, Debug)]
pub struct Grouping {
    pub id: GroupingId,
    pub workers: Vec<WorkerId>,
}

impl Grouping {
    pub fn size(&self) -> usize {
        self.workers.len()
    }
}

#[derive(Clone, Debug)]
pub struct WorkerDomain {
    pub id: DomainId,
    workers: BTreeSet<WorkerId>,
    groupings: Vec<GroupingId>,
}

impl WorkerDomain {
    pub fn workers(&self) -> &BTreeSet<WorkerId> {
        &self.workers
    }

    pub fn groupings(&self) -> &[GroupingId] {
        &self.groupings
    }
}

/// The shared availability state: every worker is either available or
/// assigned. Only [`assign_all`](WorkerPool::assign_all) and
/// [`reset_availability`](WorkerPool::reset_availability) move workers
/// between the two sets, and the two are exact inverses.
#[derive(Clone, Debug)]
pub struct WorkerPool {
    available: BTreeSet<WorkerId>,
    assigned: BTreeSet<WorkerId>,
    groupings: Vec<Grouping>,
    domains: Vec<WorkerDomain>,
}

impl WorkerPool {
    pub fn new(workers: impl IntoIterator<Item = WorkerId>) -> Self {
        WorkerPool {
            available: workers.into_iter().collect(),
            assigned: BTreeSet::new(),
            groupings: Vec::new(),
            domains: Vec::new(),
        }
    }

    /// Register a grouping over workers already known to the pool.
    pub fn register_grouping(&mut self, workers: Vec<WorkerId>) -> GroupingId {
        for worker in &workers {
            assert!(
                self.available.contains(worker) || self.assigned.contains(worker),
                "cannot group {worker:?} - not a member of this pool"
            );
        }
        let id = GroupingId(self.groupings.len());
        self.groupings.push(Grouping { id, workers });
        id
    }

    pub fn register_domain(&mut self, workers: impl IntoIterator<Item = WorkerId>) -> DomainId {
        let id = DomainId(self.domains.len());
        self.domains.push(WorkerDomain {
            id,
            workers: workers.into_iter().collect(),
            groupings: Vec::new(),
        });
        id
    }

    /// Attach a grouping to a domain. Refused (returning false) unless the
    /// grouping's members all belong to the domain.
    pub fn add_grouping_to_domain(&mut self, domain: DomainId, grouping: GroupingId) -> bool {
        let members = self.groupings[grouping.0].workers.clone();
        let domain = &mut self.domains[domain.0];
        if members.iter().all(|w| domain.workers.contains(w)) {
            domain.groupings.push(grouping);
            true
        } else {
            false
        }
    }

    pub fn grouping(&self, id: GroupingId) -> &Grouping {
        &self.groupings[id.0]
    }

    pub fn domain(&self, id: DomainId) -> &WorkerDomain {
        &self.domains[id.0]
    }

    pub fn count_available_workers(&self) -> usize {
        self.available.len()
    }

    fn grouping_is_available(&self, grouping: &Grouping) -> bool {
        grouping.workers.iter().all(|w| self.available.contains(w))
    }

    /// Groupings of the given size whose members are all still available.
    pub fn available_groupings(&self, size: usize) -> Vec<GroupingId> {
        self.groupings
            .iter()
            .filter(|g| g.size() == size && self.grouping_is_available(g))
            .map(|g| g.id)
            .collect()
    }

    pub fn count_available_groupings(&self, size: usize) -> usize {
        self.available_groupings(size).len()
    }

    /// Available groupings of the given size, bucketed by domain and
    /// selected in whole tiers of descending availability until at least
    /// `min_domains` domains are in. `None` when availability runs out
    /// before enough domains are found.
    pub fn available_by_domain(
        &self,
        size: usize,
        min_domains: usize,
        feasible: &BTreeSet<DomainId>,
    ) -> Option<BTreeMap<DomainId, Vec<GroupingId>>> {
        let available: BTreeSet<GroupingId> = self.available_groupings(size).into_iter().collect();
        let mut per_domain: BTreeMap<DomainId, Vec<GroupingId>> = self
            .domains
            .iter()
            .filter(|d| feasible.contains(&d.id))
            .map(|d| {
                let groupings = d
                    .groupings
                    .iter()
                    .copied()
                    .filter(|g| available.contains(g))
                    .collect();
                (d.id, groupings)
            })
            .collect();

        let mut selected = BTreeMap::new();
        while selected.len() < min_domains {
            let most = per_domain.values().map(Vec::len).max().unwrap_or(0);
            if most == 0 {
                return None;
            }
            let tier: Vec<DomainId> = per_domain
                .iter()
                .filter(|(_, groupings)| groupings.len() == most)
                .map(|(&id, _)| id)
                .collect();
            for id in tier {
                let groupings = per_domain.remove(&id).unwrap();
                selected.insert(id, groupings);
            }
        }
        Some(selected)
    }

    /// Mark every worker of the given groupings assigned. Assigning a
    /// worker that is not available is a caller error.
    pub fn assign_all(&mut self, groupings: &[GroupingId]) {
        for &grouping in groupings {
            for worker in self.groupings[grouping.0].workers.clone() {
                assert!(
                    self.available.remove(&worker),
                    "cannot assign {worker:?} - wasn't available"
                );
                self.assigned.insert(worker);
            }
        }
        trace!(available = %self.available.len(), "workers assigned");
    }

    /// Exact inverse of [`assign_all`](Self::assign_all): return every
    /// worker of the given groupings to the available set.
    pub fn reset_availability(&mut self, groupings: &[GroupingId]) {
        for &grouping in groupings {
            for worker in self.groupings[grouping.0].workers.clone() {
                assert!(
                    self.assigned.remove(&worker),
                    "cannot release {worker:?} - wasn't assigned"
                );
                self.available.insert(worker);
            }
        }
        trace!(available = %self.available.len(), "workers released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_of(n: usize) -> WorkerPool {
        WorkerPool::new((0..n).map(WorkerId))
    }

    #[test]
    fn availability_filters_by_size_and_members() {
        let mut pool = pool_of(4);
        let pair = pool.register_grouping(vec![WorkerId(0), WorkerId(1)]);
        let other_pair = pool.register_grouping(vec![WorkerId(1), WorkerId(2)]);
        let single = pool.register_grouping(vec![WorkerId(3)]);

        assert_eq!(pool.grouping(pair).workers, vec![WorkerId(0), WorkerId(1)]);
        assert_eq!(pool.available_groupings(2), vec![pair, other_pair]);
        assert_eq!(pool.available_groupings(1), vec![single]);

        pool.assign_all(&[pair]);
        // Worker 1 is taken, so the overlapping pair vanishes too.
        assert_eq!(pool.available_groupings(2), Vec::new());

        pool.reset_availability(&[pair]);
        assert_eq!(pool.available_groupings(2), vec![pair, other_pair]);
    }

    #[test]
    fn assign_and_reset_are_exact_inverses() {
        let mut pool = pool_of(3);
        let grouping = pool.register_grouping(vec![WorkerId(0), WorkerId(2)]);
        let before = pool.clone();
        pool.assign_all(&[grouping]);
        assert_eq!(pool.count_available_workers(), 1);
        pool.reset_availability(&[grouping]);
        assert_eq!(pool.available, before.available);
        assert_eq!(pool.assigned, before.assigned);
    }

    #[test]
    #[should_panic(expected = "wasn't available")]
    fn double_assignment_is_a_caller_error() {
        let mut pool = pool_of(2);
        let a = pool.register_grouping(vec![WorkerId(0)]);
        let b = pool.register_grouping(vec![WorkerId(0), WorkerId(1)]);
        pool.assign_all(&[a]);
        pool.assign_all(&[b]);
    }

    #[test]
    fn domain_refuses_foreign_groupings() {
        let mut pool = pool_of(4);
        let inside = pool.register_grouping(vec![WorkerId(0), WorkerId(1)]);
        let outside = pool.register_grouping(vec![WorkerId(2), WorkerId(3)]);
        let domain = pool.register_domain([WorkerId(0), WorkerId(1)]);
        assert!(pool.add_grouping_to_domain(domain, inside));
        assert!(!pool.add_grouping_to_domain(domain, outside));
        assert_eq!(pool.domain(domain).groupings(), &[inside]);
        assert!(pool.domain(domain).workers().contains(&WorkerId(1)));
    }

    #[test]
    fn domain_tiers_fill_until_minimum_is_met() {
        let mut pool = pool_of(6);
        let d0 = pool.register_domain([WorkerId(0), WorkerId(1)]);
        let d1 = pool.register_domain([WorkerId(2), WorkerId(3)]);
        let d2 = pool.register_domain([WorkerId(4), WorkerId(5)]);
        for (domain, workers) in [
            (d0, vec![vec![WorkerId(0)], vec![WorkerId(1)]]),
            (d1, vec![vec![WorkerId(2)]]),
            (d2, vec![vec![WorkerId(4)], vec![WorkerId(5)]]),
        ] {
            for members in workers {
                let g = pool.register_grouping(members);
                assert!(pool.add_grouping_to_domain(domain, g));
            }
        }
        let feasible: BTreeSet<DomainId> = [d0, d1, d2].into_iter().collect();

        // The top tier alone (two groupings each) satisfies two domains.
        let selected = pool.available_by_domain(1, 2, &feasible).unwrap();
        assert_eq!(selected.len(), 2);
        assert!(selected.contains_key(&d0) && selected.contains_key(&d2));

        // Asking for three pulls in the next tier as well.
        let selected = pool.available_by_domain(1, 3, &feasible).unwrap();
        assert_eq!(selected.len(), 3);

        // More domains than have any availability at all.
        assert!(pool.available_by_domain(1, 4, &feasible).is_none());
    }
}
