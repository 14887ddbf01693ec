//! The step log behind a pipeline.
//!
//! Each pipeline value points at the last node of a chain that ends in a
//! [`Source`]. Appending a step allocates a new [`Stage`] whose parent is
//! the previous node, so pipelines built from the same prefix share it.

use crate::engine::Engine;
use crate::errors::ParlaneError;
use std::fmt;
use std::sync::Arc;

/// The kind of a recorded step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepKind {
    /// One output per item.
    Map,
    /// A remote task applied to every item.
    MapRemote(&'static str),
    /// Items whose predicate holds.
    Filter,
    /// Zero or more outputs per item, concatenated.
    FlatMap,
    /// Contiguous groups of a fixed size.
    Batch(usize),
    /// One tagged outcome per item.
    MapOutcomes,
}

impl StepKind {
    /// Returns the step name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Map => "map",
            Self::MapRemote(_) => "map_remote",
            Self::Filter => "filter",
            Self::FlatMap => "flat_map",
            Self::Batch(_) => "batch",
            Self::MapOutcomes => "map_outcomes",
        }
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MapRemote(task) => write!(f, "map_remote({task})"),
            Self::Batch(size) => write!(f, "batch({size})"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// A node that materializes a sequence.
pub(crate) trait Node<T>: Send + Sync {
    /// Materializes the sequence, running every step up to this one.
    fn run(&self, engine: &Engine) -> Result<Vec<T>, ParlaneError>;

    /// Appends the kinds of every step up to this one, oldest first.
    fn steps(&self, out: &mut Vec<StepKind>);
}

/// The start of a chain.
pub(crate) struct Source<T> {
    items: Arc<[T]>,
}

impl<T> Source<T> {
    pub(crate) fn new(items: Vec<T>) -> Self {
        Self {
            items: items.into(),
        }
    }
}

impl<T> Node<T> for Source<T>
where
    T: Clone + Send + Sync,
{
    fn run(&self, _engine: &Engine) -> Result<Vec<T>, ParlaneError> {
        Ok(self.items.to_vec())
    }

    fn steps(&self, _out: &mut Vec<StepKind>) {}
}

type Apply<T, U> = Box<dyn Fn(&Engine, Vec<T>) -> Result<Vec<U>, ParlaneError> + Send + Sync>;

/// A step applied to its parent's output.
pub(crate) struct Stage<T, U> {
    parent: Arc<dyn Node<T>>,
    kind: StepKind,
    apply: Apply<T, U>,
}

impl<T, U> Stage<T, U> {
    pub(crate) fn new(parent: Arc<dyn Node<T>>, kind: StepKind, apply: Apply<T, U>) -> Self {
        Self {
            parent,
            kind,
            apply,
        }
    }
}

impl<T, U> Node<U> for Stage<T, U>
where
    T: 'static,
    U: 'static,
{
    fn run(&self, engine: &Engine) -> Result<Vec<U>, ParlaneError> {
        let input = self.parent.run(engine)?;
        if input.is_empty() {
            return Ok(Vec::new());
        }
        (self.apply)(engine, input)
    }

    fn steps(&self, out: &mut Vec<StepKind>) {
        self.parent.steps(out);
        out.push(self.kind);
    }
}

/// Splits `items` into contiguous groups of `size`; the last may be shorter.
pub(crate) fn into_batches<T>(items: Vec<T>, size: usize) -> Vec<Vec<T>> {
    let mut batches = Vec::with_capacity(items.len().div_ceil(size));
    let mut current = Vec::with_capacity(size);
    for item in items {
        current.push(item);
        if current.len() == size {
            batches.push(std::mem::replace(&mut current, Vec::with_capacity(size)));
        }
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_into_batches() {
        assert_eq!(
            into_batches((0..5).collect(), 2),
            vec![vec![0, 1], vec![2, 3], vec![4]]
        );
        assert_eq!(into_batches((0..6).collect(), 3).len(), 2);
        assert_eq!(into_batches(vec![1], 10), vec![vec![1]]);
        assert!(into_batches(Vec::<i32>::new(), 4).is_empty());
    }

    #[test]
    fn test_step_kind_display() {
        assert_eq!(StepKind::Map.to_string(), "map");
        assert_eq!(StepKind::FlatMap.to_string(), "flat_map");
        assert_eq!(StepKind::Batch(3).to_string(), "batch(3)");
        assert_eq!(StepKind::MapRemote("square").to_string(), "map_remote(square)");
        assert_eq!(StepKind::MapRemote("square").as_str(), "map_remote");
    }
}
