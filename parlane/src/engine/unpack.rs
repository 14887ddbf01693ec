//! Argument unpacking for `starmap`.
//!
//! Positional items are tuples whose fields become the function's
//! arguments. Keyword items are [`Kwargs`], a JSON object the function reads
//! by name.

use crate::errors::ArgumentError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

/// Calls `F` with `self` spread into its arguments.
pub trait Unpack<F, R> {
    /// Performs the call.
    fn unpack_into(self, f: &F) -> R;
}

macro_rules! impl_unpack {
    ($($arg:ident),*) => {
        impl<Func, Ret, $($arg),*> Unpack<Func, Ret> for ($($arg,)*)
        where
            Func: Fn($($arg),*) -> Ret,
        {
            #[allow(non_snake_case)]
            fn unpack_into(self, f: &Func) -> Ret {
                let ($($arg,)*) = self;
                f($($arg),*)
            }
        }
    };
}

impl_unpack!();
impl_unpack!(A);
impl_unpack!(A, B);
impl_unpack!(A, B, C);
impl_unpack!(A, B, C, D);
impl_unpack!(A, B, C, D, E);
impl_unpack!(A, B, C, D, E, G);

/// Named arguments.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Kwargs(Map<String, Value>);

impl Kwargs {
    /// Creates an empty set of arguments.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an argument, builder style.
    ///
    /// A value that cannot be represented as JSON is stored as `null`.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Serialize) -> Self {
        self.insert(name, value);
        self
    }

    /// Sets an argument. A value that cannot be represented as JSON is
    /// logged and stored as `null`; use [`try_insert`](Self::try_insert) to
    /// see the error instead.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Serialize) {
        let name = name.into();
        if let Err(e) = self.try_insert(name.clone(), value) {
            warn!(error = %e, "Storing argument as null");
            self.0.insert(name, Value::Null);
        }
    }

    /// Sets an argument, failing if the value cannot be represented as JSON.
    pub fn try_insert(
        &mut self,
        name: impl Into<String>,
        value: impl Serialize,
    ) -> Result<(), ArgumentError> {
        let name = name.into();
        match serde_json::to_value(value) {
            Ok(value) => {
                self.0.insert(name, value);
                Ok(())
            }
            Err(e) => Err(ArgumentError::Invalid {
                name,
                reason: e.to_string(),
            }),
        }
    }

    /// Reads and decodes an argument.
    pub fn get<T: DeserializeOwned>(&self, name: &str) -> Result<T, ArgumentError> {
        let value = self.0.get(name).ok_or_else(|| ArgumentError::Missing {
            name: name.to_string(),
        })?;
        T::deserialize(value).map_err(|e| ArgumentError::Invalid {
            name: name.to_string(),
            reason: e.to_string(),
        })
    }

    /// Reads an argument, falling back to `default` when it is absent.
    pub fn get_or<T: DeserializeOwned>(&self, name: &str, default: T) -> Result<T, ArgumentError> {
        match self.get(name) {
            Err(ArgumentError::Missing { .. }) => Ok(default),
            other => other,
        }
    }

    /// Returns whether the argument is present.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    /// Number of arguments.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if there are no arguments.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Map<String, Value>> for Kwargs {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl TryFrom<Value> for Kwargs {
    type Error = ArgumentError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(ArgumentError::Invalid {
                name: "*".to_string(),
                reason: format!("expected an object, got {other}"),
            }),
        }
    }
}

impl<F, R> Unpack<F, R> for Kwargs
where
    F: Fn(Self) -> R,
{
    fn unpack_into(self, f: &F) -> R {
        f(self)
    }
}
