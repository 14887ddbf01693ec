//! Tagged per-item results.

use crate::config::ErrorStrategy;
use crate::errors::TaskFailure;

/// The outcome of one item: its value, or why it has none.
pub type Outcome<T> = Result<T, TaskFailure>;

/// Results of one engine invocation, in input order.
///
/// Under `raise` and `skip` every entry is `Ok`; under `collect` there is one
/// entry per input item, failures included.
#[derive(Debug, PartialEq)]
pub struct Ordered<T> {
    outcomes: Vec<Outcome<T>>,
    strategy: ErrorStrategy,
}

impl<T> Ordered<T> {
    pub(crate) fn new(outcomes: Vec<Outcome<T>>, strategy: ErrorStrategy) -> Self {
        Self { outcomes, strategy }
    }

    /// Creates an empty result set.
    #[must_use]
    pub fn empty(strategy: ErrorStrategy) -> Self {
        Self::new(Vec::new(), strategy)
    }

    /// The strategy that produced these results.
    #[must_use]
    pub fn strategy(&self) -> ErrorStrategy {
        self.strategy
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    /// Returns true if there are no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    /// Iterates over the entries in input order.
    pub fn iter(&self) -> std::slice::Iter<'_, Outcome<T>> {
        self.outcomes.iter()
    }

    /// Returns the failures, in input order.
    pub fn failures(&self) -> impl Iterator<Item = &TaskFailure> {
        self.outcomes.iter().filter_map(|o| o.as_ref().err())
    }

    /// Returns true if any entry is a failure.
    #[must_use]
    pub fn has_failures(&self) -> bool {
        self.outcomes.iter().any(Result::is_err)
    }

    /// Consumes the results and returns the tagged entries.
    #[must_use]
    pub fn into_outcomes(self) -> Vec<Outcome<T>> {
        self.outcomes
    }

    /// Consumes the results and returns the successful values.
    ///
    /// Lossless under `raise` and `skip`. Under `collect` the failures are
    /// dropped; use [`into_outcomes`](Self::into_outcomes) to keep them.
    #[must_use]
    pub fn into_values(self) -> Vec<T> {
        self.outcomes.into_iter().filter_map(Result::ok).collect()
    }
}

impl<T> IntoIterator for Ordered<T> {
    type Item = Outcome<T>;
    type IntoIter = std::vec::IntoIter<Outcome<T>>;

    fn into_iter(self) -> Self::IntoIter {
        self.outcomes.into_iter()
    }
}

impl<'a, T> IntoIterator for &'a Ordered<T> {
    type Item = &'a Outcome<T>;
    type IntoIter = std::slice::Iter<'a, Outcome<T>>;

    fn into_iter(self) -> Self::IntoIter {
        self.outcomes.iter()
    }
}

/// Restores input order from `(position, outcome)` pairs settled in any order.
pub(crate) fn restore_order<T>(mut settled: Vec<(usize, Outcome<T>)>) -> Vec<Outcome<T>> {
    settled.sort_by_key(|(index, _)| *index);
    settled.into_iter().map(|(_, outcome)| outcome).collect()
}

/// Picks the failure `raise` reports: the one at the lowest position.
///
/// A failure is only final once every earlier position has settled, since
/// one of them may still fail.
#[derive(Debug)]
pub(crate) struct EarliestFailure {
    settled: Vec<bool>,
    frontier: usize,
    failure: Option<TaskFailure>,
}

impl EarliestFailure {
    pub(crate) fn new(total: usize) -> Self {
        Self {
            settled: vec![false; total],
            frontier: 0,
            failure: None,
        }
    }

    /// Records that `index` settled successfully.
    pub(crate) fn succeeded(&mut self, index: usize) {
        if let Some(slot) = self.settled.get_mut(index) {
            *slot = true;
        }
        while self.settled.get(self.frontier).copied().unwrap_or(false) {
            self.frontier += 1;
        }
    }

    /// Records a failure, keeping it if it is the earliest seen so far.
    pub(crate) fn failed(&mut self, failure: TaskFailure) {
        self.succeeded(failure.index());
        let earlier = self
            .failure
            .as_ref()
            .map_or(true, |kept| failure.index() < kept.index());
        if earlier {
            self.failure = Some(failure);
        }
    }

    /// Returns the failure once no earlier position can still fail.
    pub(crate) fn decided(&mut self) -> Option<TaskFailure> {
        match &self.failure {
            Some(failure) if self.frontier >= failure.index() => self.failure.take(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_restore_order() {
        let settled = vec![
            (2, Ok("c")),
            (0, Ok("a")),
            (1, Err(TaskFailure::cancelled(1))),
        ];
        let ordered = restore_order(settled);
        assert_eq!(ordered, vec![Ok("a"), Err(TaskFailure::cancelled(1)), Ok("c")]);
    }

    #[test]
    fn test_earliest_failure_waits_for_earlier_positions() {
        let mut earliest = EarliestFailure::new(4);
        earliest.failed(TaskFailure::cancelled(2));
        assert!(earliest.decided().is_none());

        earliest.succeeded(3);
        earliest.succeeded(1);
        assert!(earliest.decided().is_none());

        earliest.failed(TaskFailure::worker_lost(0, "gone"));
        let failure = earliest.decided().unwrap();
        assert_eq!(failure.index(), 0);
        assert_eq!(failure.kind(), "worker_lost");
        assert!(earliest.decided().is_none());
    }

    #[test]
    fn test_earliest_failure_at_front_is_immediate() {
        let mut earliest = EarliestFailure::new(3);
        assert!(earliest.decided().is_none());
        earliest.failed(TaskFailure::cancelled(0));
        assert_eq!(earliest.decided().map(|f| f.index()), Some(0));
    }

    #[test]
    fn test_into_values_drops_failures() {
        let ordered = Ordered::new(
            vec![Ok(1), Err(TaskFailure::cancelled(1)), Ok(3)],
            ErrorStrategy::Collect,
        );
        assert_eq!(ordered.len(), 3);
        assert!(ordered.has_failures());
        assert_eq!(ordered.failures().count(), 1);
        assert_eq!(ordered.into_values(), vec![1, 3]);
    }

    #[test]
    fn test_empty() {
        let ordered: Ordered<u8> = Ordered::empty(ErrorStrategy::Raise);
        assert!(ordered.is_empty());
        assert_eq!(ordered.strategy(), ErrorStrategy::Raise);
        assert!(ordered.into_outcomes().is_empty());
    }
}
