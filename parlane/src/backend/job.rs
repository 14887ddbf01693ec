//! The unit of work handed to a backend.

use crate::core::Outcome;
use crate::errors::TaskFailure;
use crate::worker::RemoteTask;
use serde_json::Value;
use std::sync::Arc;

/// Runs one item in-process. Receives the item's position for failure
/// reporting.
pub type Invoke<T, R> = Arc<dyn Fn(usize, T) -> Outcome<R> + Send + Sync>;

/// What an isolated-memory pool needs to run a [`RemoteTask`].
pub struct RemoteSpec<T, R> {
    pub(crate) name: &'static str,
    pub(crate) encode: fn(T) -> serde_json::Result<Value>,
    pub(crate) decode: fn(Value) -> serde_json::Result<R>,
}

impl<T, R> Clone for RemoteSpec<T, R> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T, R> Copy for RemoteSpec<T, R> {}

impl<T, R> RemoteSpec<T, R> {
    /// Registered task name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }
}

fn encode<K: RemoteTask>(input: K::Input) -> serde_json::Result<Value> {
    serde_json::to_value(input)
}

fn decode<K: RemoteTask>(value: Value) -> serde_json::Result<K::Output> {
    serde_json::from_value(value)
}

/// A function to apply to every item.
///
/// Closures only run in shared memory. Jobs built from a [`RemoteTask`] can
/// run in either pool.
pub struct Job<T, R> {
    local: Invoke<T, R>,
    remote: Option<RemoteSpec<T, R>>,
}

impl<T, R> Clone for Job<T, R> {
    fn clone(&self) -> Self {
        Self {
            local: Arc::clone(&self.local),
            remote: self.remote,
        }
    }
}

impl<T, R> Job<T, R>
where
    T: 'static,
    R: 'static,
{
    /// Wraps a closure.
    pub fn local<F, E>(f: F) -> Self
    where
        F: Fn(T) -> Result<R, E> + Send + Sync + 'static,
        E: Into<anyhow::Error>,
    {
        Self {
            local: Arc::new(move |index, item| f(item).map_err(|e| TaskFailure::failed(index, e))),
            remote: None,
        }
    }

    /// Wraps a [`RemoteTask`].
    #[must_use]
    pub fn remote<K>() -> Self
    where
        K: RemoteTask<Input = T, Output = R>,
    {
        Self {
            local: Arc::new(|index, item| K::call(item).map_err(|e| TaskFailure::failed(index, e))),
            remote: Some(RemoteSpec {
                name: K::NAME,
                encode: encode::<K>,
                decode: decode::<K>,
            }),
        }
    }

    /// The in-process entry point.
    #[must_use]
    pub fn invoke(&self) -> Invoke<T, R> {
        Arc::clone(&self.local)
    }

    /// The remote description, if the job can leave the process.
    #[must_use]
    pub fn remote_spec(&self) -> Option<RemoteSpec<T, R>> {
        self.remote
    }

    /// Returns whether the job can run in an isolated-memory pool.
    #[must_use]
    pub fn is_transferable(&self) -> bool {
        self.remote.is_some()
    }
}

impl<T, R> std::fmt::Debug for Job<T, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("remote", &self.remote.map(|spec| spec.name))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Double;

    impl RemoteTask for Double {
        const NAME: &'static str = "double";
        type Input = u32;
        type Output = u32;
        type Error = std::convert::Infallible;

        fn call(input: u32) -> Result<u32, Self::Error> {
            Ok(input * 2)
        }
    }

    #[test]
    fn test_local_job_is_not_transferable() {
        let job = Job::local(|x: u32| Ok::<_, std::io::Error>(x + 1));
        assert!(!job.is_transferable());
        assert_eq!((job.invoke())(0, 1).unwrap(), 2);
    }

    #[test]
    fn test_local_job_failure_carries_index() {
        let job = Job::local(|_: u32| Err::<u32, _>(std::io::Error::other("nope")));
        let failure = (job.invoke())(7, 1).unwrap_err();
        assert_eq!(failure.index(), 7);
        assert!(failure.kind().contains("io"));
    }

    #[test]
    fn test_remote_job() {
        let job = Job::remote::<Double>();
        assert!(job.is_transferable());
        let spec = job.remote_spec().unwrap();
        assert_eq!(spec.name(), "double");
        assert_eq!((spec.encode)(3).unwrap(), serde_json::json!(3));
        assert_eq!((spec.decode)(serde_json::json!(8)).unwrap(), 8);
        assert_eq!((job.invoke())(0, 4).unwrap(), 8);
    }
}
