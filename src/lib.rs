#![deny(
    trivial_numeric_casts,
    missing_docs,
    unsafe_code,
    unstable_features,
    unused_import_braces,
    unused_qualifications,
    unused_extern_crates,
    unused_results
)]
#![warn(rust_2021_compatibility, unreachable_pub)]

//! A single-threaded, dependency-gated component lifecycle engine for a
//! modular-service runtime, in the spirit of OSGi/Celix's dependency manager.
//!
//! A process hosts **components**: user implementations with a lifecycle
//! (`init`/`start`/`stop`/`deinit`) gated by the resolution of their declared
//! **service dependencies**, and publishing **provided interfaces** only while
//! active. Every state mutation is serialized through a single dedicated
//! **event loop** thread; a **dependency manager** owns components by stable
//! id and exposes the add/remove/introspection surface a framework layer
//! drives.
//!
//! This crate is a thin facade over the engine's crates, re-exported here so
//! a consumer depends on one crate rather than wiring up the workspace by
//! hand:
//!
//! - [`dm_event_loop`] — the single-threaded FIFO executor.
//! - [`dm_dependency`] — tracks one named service on behalf of a component.
//! - [`dm_component`] — the component state machine and suspend/resume
//!   protocol.
//! - [`dm_manager`] — the per-framework arena of components, plus the
//!   declarative [`dm_manager::ComponentDescriptor`].
//! - [`dm_registry`] — the consumed `ServiceRegistry` collaborator, plus an
//!   in-memory reference implementation for tests.
//! - [`dm_properties`] — the typed property map shared by provided
//!   interfaces and service dependencies.
//!
//! The engine does not implement a service registry, a bundle loader, or an
//! admin layer that discovers endpoints and calls into the manager — those
//! are external collaborators the engine only consumes.

pub use dm_component as component;
pub use dm_dependency as dependency;
pub use dm_event_loop as event_loop;
pub use dm_manager as manager;
pub use dm_properties as properties;
pub use dm_registry as registry;
