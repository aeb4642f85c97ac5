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

//! The `ServiceRegistry` trait is the Rust shape of the external collaborator
//! the dependency manager consumes but does not implement: register/
//! unregister a service, and open/close a tracker that delivers ADD/REMOVE/SET
//! events for services matching a name and an optional filter.
//!
//! [`mock::InMemoryRegistry`] is a small, fully working reference
//! implementation used by this workspace's own tests, per the Design Notes:
//! the registry is modeled as an injected collaborator to keep tests
//! deterministic rather than reaching for a process-wide singleton.

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use dm_properties::Properties;

pub mod mock;

/// All the errors a `ServiceRegistry` implementation can report.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Registration failed; the service was not assigned an id.
    #[error("service registration failed (service: {service})")]
    RegistrationFailed {
        /// The name of the service that failed to register.
        service: String,
    },

    /// Unregistration of an already-unknown service id was attempted.
    #[error("unknown service id {0}")]
    UnknownServiceId(ServiceId),

    /// The supplied filter could not be parsed.
    #[error("invalid filter (reason: {0})")]
    InvalidFilter(String),
}

/// A registry-assigned identifier for a registered service.
pub type ServiceId = u64;

/// A handle to an open tracker; opaque to the caller beyond `close_tracker`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TrackerHandle(pub u64);

/// A service instance as seen by the registry: an opaque, shareable pointer
/// plus the properties it was registered with.
#[derive(Clone)]
pub struct BoundService {
    /// The service instance.
    pub instance: Arc<dyn std::any::Any + Send + Sync>,
    /// The properties it was registered with (includes `service.id`,
    /// `service.ranking`, `objectClass`, ...).
    pub properties: Properties,
}

impl fmt::Debug for BoundService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundService").field("properties", &self.properties).finish()
    }
}

/// An event delivered by an open tracker.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum TrackerEvent {
    /// A new matching service appeared.
    Add(BoundService),
    /// A previously-bound matching service disappeared.
    Remove(BoundService),
    /// The highest-ranked matching service changed. `None` means no matching
    /// service remains bound.
    Set(Option<BoundService>),
}

/// A service to register, as supplied by a provided interface.
pub struct ServiceRegistration {
    /// The interface name under which the service is registered
    /// (`objectClass`).
    pub service_name: String,
    /// The service instance.
    pub instance: Arc<dyn std::any::Any + Send + Sync>,
    /// Registration properties.
    pub properties: Properties,
}

/// The registry collaborator consumed by the dependency manager. All
/// mutating operations are async with respect to the event loop, per the
/// framework's external-interface contract.
#[async_trait]
pub trait ServiceRegistry: Send + Sync {
    /// Registers a service for the given bundle, returning its assigned id.
    async fn register_service_async(&self, bundle_id: i64, registration: ServiceRegistration) -> Result<ServiceId, Error>;

    /// Unregisters a previously registered service.
    async fn unregister_service(&self, service_id: ServiceId) -> Result<(), Error>;

    /// Opens a tracker for services matching `service_name` and an optional
    /// filter expression, delivering events on the returned channel.
    fn open_tracker(
        &self,
        bundle_id: i64,
        service_name: &str,
        filter: Option<&str>,
    ) -> Result<(TrackerHandle, flume::Receiver<TrackerEvent>), Error>;

    /// Closes a previously opened tracker. Closure is asynchronous: the
    /// tracker may still deliver a final few in-flight events before its
    /// channel closes.
    fn close_tracker(&self, handle: TrackerHandle);
}
