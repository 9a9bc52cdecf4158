use std::collections::BTreeMap;

/// Reorder buffer between the workers and the single committer.
///
/// Workers finish jobs in any order; the committer may only persist them in
/// assignment order. Results park here until every earlier job id has
/// committed. `take_ready` hands back the next-in-line result without
/// advancing, so a failed commit can push the job back and retry under the
/// same id while everything later stays parked.
#[derive(Debug)]
pub(crate) struct CommitQueue<T> {
    next: u64,
    parked: BTreeMap<u64, T>,
}

impl<T> CommitQueue<T> {
    pub(crate) fn new(first_id: u64) -> Self {
        Self { next: first_id, parked: BTreeMap::new() }
    }

    pub(crate) fn push(&mut self, id: u64, item: T) {
        debug_assert!(id >= self.next, "job {id} was already committed");
        self.parked.insert(id, item);
    }

    /// The next-in-line result, if it has arrived.
    pub(crate) fn take_ready(&mut self) -> Option<(u64, T)> {
        self.parked.remove(&self.next).map(|item| (self.next, item))
    }

    /// Marks the current head id committed.
    pub(crate) fn advance(&mut self) {
        self.next += 1;
    }

    pub(crate) fn next_id(&self) -> u64 {
        self.next
    }

    pub(crate) fn parked_len(&self) -> usize {
        self.parked.len()
    }
}
