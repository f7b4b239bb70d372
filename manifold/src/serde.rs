//! Serialization of typed domain events into the opaque payloads
//! persisted by the engine.

use std::marker::PhantomData;

use serde::{Deserialize, Serialize};

/// A [Serde] can be used to serialize into and deserialize from a given
/// type into a wire format, such as JSON.
pub trait Serde<T>: Send + Sync {
    /// The error returned by the [Serde::deserialize] method.
    type Error: Send + Sync;

    /// Serializes the given value into the wire format supported by this [Serde].
    fn serialize(&self, value: &T) -> String;

    /// Deserializes the given value from a message encoded in the wire format
    /// supported by this [Serde].
    fn deserialize(&self, data: &str) -> Result<T, Self::Error>;
}

/// [Serde] implementation using the [serde_json] crate.
#[derive(Debug, Clone, Copy)]
pub struct Json<T>(PhantomData<T>)
where
    T: Serialize + Send + Sync,
    for<'d> T: Deserialize<'d>;

impl<T> Default for Json<T>
where
    T: Serialize + Send + Sync,
    for<'d> T: Deserialize<'d>,
{
    fn default() -> Self {
        Self(PhantomData)
    }
}

impl<T> Serde<T> for Json<T>
where
    T: Serialize + Send + Sync,
    for<'d> T: Deserialize<'d>,
{
    type Error = serde_json::Error;

    fn serialize(&self, value: &T) -> String {
        serde_json::to_string(value).expect("json serialization should not fail")
    }

    fn deserialize(&self, data: &str) -> Result<T, Self::Error> {
        serde_json::from_str(data)
    }
}
