//! Newline-delimited JSON messages exchanged with worker processes.
//!
//! One request carries one chunk:
//!
//! ```text
//! -> {"id":3,"task":"square","inputs":[1,2]}
//! <- {"id":3,"outcomes":[{"ok":1},{"err":{"kind":"...","message":"..."}}]}
//! ```

use crate::errors::TaskFailure;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A chunk of work for one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Correlates the response.
    pub id: u64,
    /// Registered task name.
    pub task: String,
    /// Encoded inputs, in order.
    pub inputs: Vec<Value>,
}

/// The outcomes of one request, in input order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// The request id.
    pub id: u64,
    /// One outcome per input.
    pub outcomes: Vec<WireOutcome>,
}

/// One item's outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireOutcome {
    /// Encoded return value.
    Ok(Value),
    /// The item failed.
    Err(WireFailure),
}

/// A failure as reported by a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireFailure {
    /// Error type name, or `panic`.
    pub kind: String,
    /// Error message.
    pub message: String,
}

impl WireFailure {
    /// Creates a wire failure.
    #[must_use]
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Describes a failure of the task function.
    pub fn from_error<E>(error: E) -> Self
    where
        E: Into<anyhow::Error>,
    {
        let kind = std::any::type_name::<E>();
        Self::new(kind, format!("{:#}", error.into()))
    }

    /// Converts into a [`TaskFailure`] at `index`.
    #[must_use]
    pub fn into_failure(self, index: usize) -> TaskFailure {
        TaskFailure::remote(index, self.kind, self.message)
    }
}
