//! Worker-process side of the isolated-memory pool.
//!
//! Closures cannot leave the process that created them, so work meant for
//! isolated-memory workers is written as a [`RemoteTask`]: a named, stateless
//! function over serde types. The parent pool re-executes a worker program
//! (by default the current executable) with `PARLANE_WORKER=1`; that program
//! must hand control to [`serve_if_worker`] first thing in `main`:
//!
//! ```no_run
//! use parlane::worker::{serve_if_worker, RemoteTask, TaskRegistry};
//!
//! struct Square;
//!
//! impl RemoteTask for Square {
//!     const NAME: &'static str = "square";
//!     type Input = u64;
//!     type Output = u64;
//!     type Error = std::convert::Infallible;
//!
//!     fn call(input: u64) -> Result<u64, Self::Error> {
//!         Ok(input * input)
//!     }
//! }
//!
//! fn main() {
//!     serve_if_worker(&TaskRegistry::new().with::<Square>());
//!     // ... normal program
//! }
//! ```
//!
//! Stdout belongs to the protocol while serving; tasks must not print to it.

use crate::backend::wire::{Request, Response, WireFailure, WireOutcome};
use crate::errors::TaskFailure;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::io::{self, BufRead, Write};
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::{debug, error};

/// Environment variable that switches a program into worker mode.
pub const WORKER_ENV: &str = "PARLANE_WORKER";

/// A named function that can run in a worker process.
pub trait RemoteTask: 'static {
    /// Name used to find the task in the worker's [`TaskRegistry`].
    const NAME: &'static str;
    /// Argument type.
    type Input: Serialize + DeserializeOwned + Send + 'static;
    /// Return type.
    type Output: Serialize + DeserializeOwned + Send + 'static;
    /// Error type.
    type Error: Into<anyhow::Error>;

    /// Runs the task on one input.
    fn call(input: Self::Input) -> Result<Self::Output, Self::Error>;
}

/// Type-erased task entry point.
pub type TaskEntry = fn(Value) -> Result<Value, WireFailure>;

fn entry<K: RemoteTask>(input: Value) -> Result<Value, WireFailure> {
    let input: K::Input = serde_json::from_value(input).map_err(WireFailure::from_error)?;
    let output = K::call(input).map_err(WireFailure::from_error)?;
    serde_json::to_value(output).map_err(WireFailure::from_error)
}

/// The tasks a worker process can run.
#[derive(Default)]
pub struct TaskRegistry {
    entries: RwLock<HashMap<&'static str, TaskEntry>>,
}

impl TaskRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a task.
    pub fn register<K: RemoteTask>(&self) {
        self.entries.write().insert(K::NAME, entry::<K>);
    }

    /// Registers a task, builder style.
    #[must_use]
    pub fn with<K: RemoteTask>(self) -> Self {
        self.register::<K>();
        self
    }

    /// Looks up a task by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<TaskEntry> {
        self.entries.read().get(name).copied()
    }

    /// Returns whether a task is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.entries.read().contains_key(name)
    }

    /// Registered task names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.entries.read().keys().copied().collect();
        names.sort_unstable();
        names
    }

    fn run(&self, request: Request) -> Response {
        let task = self.get(&request.task);
        let outcomes = request
            .inputs
            .into_iter()
            .map(|input| {
                let Some(task) = task else {
                    return WireOutcome::Err(WireFailure::new(
                        "unknown_task",
                        format!("task {:?} is not registered in the worker", request.task),
                    ));
                };
                match catch_unwind(AssertUnwindSafe(|| task(input))) {
                    Ok(Ok(value)) => WireOutcome::Ok(value),
                    Ok(Err(failure)) => WireOutcome::Err(failure),
                    Err(payload) => WireOutcome::Err(WireFailure::new(
                        "panic",
                        TaskFailure::panicked(0, payload.as_ref()).message(),
                    )),
                }
            })
            .collect();

        Response {
            id: request.id,
            outcomes,
        }
    }
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("tasks", &self.names())
            .finish()
    }
}

/// Returns whether this process was started as a worker.
#[must_use]
pub fn is_worker() -> bool {
    std::env::var(WORKER_ENV).is_ok_and(|v| v == "1")
}

/// Serves requests from `reader` until end of input.
///
/// Fails on IO errors and on lines that are not valid requests; the parent
/// treats either as a lost worker.
pub fn serve<R, W>(registry: &TaskRegistry, reader: R, mut writer: W) -> io::Result<()>
where
    R: BufRead,
    W: Write,
{
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let request: Request = serde_json::from_str(&line)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        debug!(id = request.id, task = %request.task, items = request.inputs.len(), "Serving request");

        let response = registry.run(request);
        serde_json::to_writer(&mut writer, &response)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
    }
    Ok(())
}

/// Serves worker requests and exits if this process is a worker; returns
/// immediately otherwise.
pub fn serve_if_worker(registry: &TaskRegistry) {
    if !is_worker() {
        return;
    }
    let stdin = io::stdin();
    let stdout = io::stdout();
    let code = match serve(registry, stdin.lock(), stdout.lock()) {
        Ok(()) => 0,
        Err(e) => {
            error!(error = %e, "Worker stopped");
            1
        }
    };
    std::process::exit(code);
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::io::Cursor;

    struct Square;

    impl RemoteTask for Square {
        const NAME: &'static str = "square";
        type Input = i64;
        type Output = i64;
        type Error = std::convert::Infallible;

        fn call(input: i64) -> Result<i64, Self::Error> {
            Ok(input * input)
        }
    }

    #[derive(Debug, thiserror::Error)]
    #[error("odd input {0}")]
    struct OddInput(i64);

    struct EvenOnly;

    impl RemoteTask for EvenOnly {
        const NAME: &'static str = "even_only";
        type Input = i64;
        type Output = i64;
        type Error = OddInput;

        fn call(input: i64) -> Result<i64, OddInput> {
            if input % 2 == 0 {
                Ok(input)
            } else {
                Err(OddInput(input))
            }
        }
    }

    struct Explode;

    impl RemoteTask for Explode {
        const NAME: &'static str = "explode";
        type Input = ();
        type Output = ();
        type Error = std::convert::Infallible;

        fn call((): ()) -> Result<(), Self::Error> {
            panic!("kaboom")
        }
    }

    fn registry() -> TaskRegistry {
        TaskRegistry::new()
            .with::<Square>()
            .with::<EvenOnly>()
            .with::<Explode>()
    }

    fn round_trip(lines: &str) -> Vec<Response> {
        let mut out = Vec::new();
        serve(&registry(), Cursor::new(lines.to_string()), &mut out).unwrap();
        String::from_utf8(out)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn test_registry_names() {
        let registry = registry();
        assert_eq!(registry.names(), vec!["even_only", "explode", "square"]);
        assert!(registry.contains("square"));
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn test_serve_answers_each_request() {
        let responses = round_trip(
            "{\"id\":1,\"task\":\"square\",\"inputs\":[2,3]}\n\n{\"id\":2,\"task\":\"square\",\"inputs\":[]}\n",
        );
        assert_eq!(
            responses,
            vec![
                Response {
                    id: 1,
                    outcomes: vec![WireOutcome::Ok(json!(4)), WireOutcome::Ok(json!(9))],
                },
                Response {
                    id: 2,
                    outcomes: vec![],
                },
            ]
        );
    }

    #[test]
    fn test_errors_are_per_item() {
        let responses = round_trip("{\"id\":5,\"task\":\"even_only\",\"inputs\":[2,3,\"x\"]}\n");
        let outcomes = &responses[0].outcomes;

        assert_eq!(outcomes[0], WireOutcome::Ok(json!(2)));
        let WireOutcome::Err(odd) = &outcomes[1] else {
            panic!("expected failure");
        };
        assert!(odd.kind.ends_with("OddInput"));
        assert_eq!(odd.message, "odd input 3");
        let WireOutcome::Err(bad) = &outcomes[2] else {
            panic!("expected failure");
        };
        assert!(bad.kind.contains("serde_json"));
    }

    #[test]
    fn test_panics_are_reported() {
        let responses = round_trip("{\"id\":1,\"task\":\"explode\",\"inputs\":[null]}\n");
        assert_eq!(
            responses[0].outcomes,
            vec![WireOutcome::Err(WireFailure::new("panic", "kaboom"))]
        );
    }

    #[test]
    fn test_unknown_task() {
        let responses = round_trip("{\"id\":1,\"task\":\"nope\",\"inputs\":[1]}\n");
        let WireOutcome::Err(failure) = &responses[0].outcomes[0] else {
            panic!("expected failure");
        };
        assert_eq!(failure.kind, "unknown_task");
    }

    #[test]
    fn test_garbage_line_stops_serving() {
        let mut out = Vec::new();
        let err = serve(&registry(), Cursor::new("not json\n"), &mut out).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(out.is_empty());
    }
}
