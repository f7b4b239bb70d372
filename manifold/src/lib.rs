//! `manifold` is an event-sourcing storage engine: it persists ordered,
//! immutable event streams per logical object, tracks each object
//! through a manifest (the object-document), rebuilds in-memory
//! aggregates by folding those events, and supports live migration
//! between storage layouts.
//!
//! The write path goes through a [leased session][session::LeasedSession]:
//! events are buffered in memory, validated by pre-append actions, then
//! committed events-first — append to the [data store][store::DataStore],
//! publish the [manifest][document::ObjectDocument] under its ETag, run
//! post-commit actions. Failures between the append and the manifest
//! write remove the tentatively written events again, so readers only
//! ever observe what a manifest references.
//!
//! The crate ships an [in-memory backend][store::memory::InMemoryBackend];
//! the `manifold-fs` crate provides a filesystem blob backend with the
//! same contracts.

#![deny(unsafe_code, unused_qualifications, trivial_casts)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]

pub mod aggregate;
pub mod backup;
pub mod document;
pub mod error;
pub mod event;
pub mod factory;
pub mod lifecycle;
pub mod lock;
pub mod projection;
pub mod serde;
pub mod session;
pub mod snapshot;
pub mod store;
pub mod stream;
pub mod version;
