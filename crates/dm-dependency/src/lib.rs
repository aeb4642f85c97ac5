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

//! A `ServiceDependency` tracks one named service on behalf of its owning
//! component: target name, optional filter, required/optional, a suspend
//! strategy, and up to three user callbacks.
//!
//! Built on the `flume`-channel idiom the teacher's `signal` crate uses for
//! its own receive loop: `enable` opens a tracker via
//! [`dm_registry::ServiceRegistry::open_tracker`], which hands back a
//! `flume::Receiver<TrackerEvent>`. The dependency spawns a forwarding task on
//! the event loop's runtime that turns each tracker event into a freshly
//! enqueued [`EventLoopTask`], so the owning component always observes
//! dependency events serialized through the loop's normal FIFO queue rather
//! than from the forwarder's own concurrent context.
//!
//! The dependency never invokes its own callbacks: Design Notes §9 treats
//! callbacks as a capability record the engine only invokes, and the suspend
//! protocol in `dm-component` needs to interleave `stop`/`start` around the
//! call, so invocation is exposed as [`ServiceDependency::invoke_add`] /
//! [`invoke_remove`](ServiceDependency::invoke_remove) /
//! [`invoke_set`](ServiceDependency::invoke_set) for the owning component to
//! drive explicitly.

use std::sync::{
    atomic::{AtomicBool, AtomicI64, Ordering},
    Arc, Mutex,
};

use async_trait::async_trait;
use dm_event_loop::{EventLoopHandle, EventLoopTask};
use dm_registry::{BoundService, ServiceRegistry, TrackerEvent, TrackerHandle};
use tracing::{trace, warn};

/// All the errors a `ServiceDependency` can report.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Configuration (`set_required`, `set_strategy`, `set_callbacks`) was
    /// attempted after the dependency had already been enabled.
    #[error("service dependency already enabled; configuration is frozen")]
    AlreadyEnabled,

    /// The registry could not open or close the tracker.
    #[error(transparent)]
    Registry(#[from] dm_registry::Error),
}

/// Identifies a dependency within its owning component.
pub type DependencyId = u64;

/// Whether the engine withdraws the component's provided services around a
/// binding mutation on this dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Unregister services, call `stop`, run the callback, call `start`,
    /// re-register, for every ADD/REMOVE/SET on this dependency.
    Suspend,
    /// Invoke the callback without touching the component's services or
    /// lifecycle.
    Locking,
}

/// The capability record of user callbacks for one dependency. The engine
/// only invokes these; it never introspects them.
#[derive(Default)]
pub struct Callbacks {
    /// Invoked when a new matching service is bound.
    pub on_add: Option<Box<dyn Fn(&BoundService) + Send + Sync>>,
    /// Invoked when a previously bound matching service is unbound.
    pub on_remove: Option<Box<dyn Fn(&BoundService) + Send + Sync>>,
    /// Invoked when the highest-ranked matching service changes.
    pub on_set: Option<Box<dyn Fn(Option<&BoundService>) + Send + Sync>>,
}

/// Receives dependency events and tracker-closed notifications on behalf of
/// the owning component. Implemented by `dm-component`; kept as a trait here
/// so this crate never depends on it (Design Notes §9's arena-by-id pattern).
pub trait DependencyEventSink: Send + Sync {
    /// A tracker event arrived for `dependency_id`. Called on the event loop
    /// thread; this dependency's own state (`is_available`) already reflects
    /// the event by the time this is invoked.
    fn on_dependency_event(&self, dependency_id: DependencyId, event: TrackerEvent);

    /// The tracker for `dependency_id` has fully closed following `disable`.
    /// Called on the event loop thread, at most once.
    fn on_dependency_closed(&self, dependency_id: DependencyId);
}

/// Starts the background forwarding loop for one dependency. Executed as a
/// regular [`EventLoopTask`] (so `enable` stays callable from any thread),
/// but its own body only spawns a task and returns immediately: the actual
/// `recv_async().await` must never run *inline* as a queued task, since the
/// loop processes queued tasks strictly one at a time and a task parked on a
/// channel recv would stall every other component on the loop until this one
/// dependency's next event arrived. The spawned task instead runs
/// concurrently on the loop's own single-threaded Tokio runtime and turns
/// each tracker event into a freshly queued [`DeliverEvent`]/[`DeliverClosed`],
/// so delivery to the owning component is still fully serialized through the
/// loop's normal FIFO queue.
struct StartForwarder {
    dependency: Arc<Shared>,
    sink: Arc<dyn DependencyEventSink>,
    receiver: flume::Receiver<TrackerEvent>,
    event_loop: EventLoopHandle,
    bundle_id: i64,
}

#[async_trait]
impl EventLoopTask for StartForwarder {
    async fn run(self: Box<Self>) {
        let StartForwarder { dependency, sink, receiver, event_loop, bundle_id } = *self;
        let dependency_id = dependency.id;
        let _join = tokio::spawn(async move {
            loop {
                match receiver.recv_async().await {
                    Ok(event) => {
                        dependency.apply(&event);
                        let deliver = DeliverEvent { sink: sink.clone(), dependency_id, event };
                        if event_loop.fire_generic(bundle_id, "dependency-deliver", Box::new(deliver)).is_err() {
                            warn!(dependency_id, "event loop closed while delivering dependency event");
                            break;
                        }
                    }
                    Err(_) => {
                        dependency.disabled.store(true, Ordering::Release);
                        trace!(dependency_id, "tracker closed");
                        let closed = DeliverClosed { sink: sink.clone(), dependency_id };
                        let _ = event_loop.fire_generic(bundle_id, "dependency-closed", Box::new(closed));
                        break;
                    }
                }
            }
        });
    }
}

struct DeliverEvent {
    sink: Arc<dyn DependencyEventSink>,
    dependency_id: DependencyId,
    event: TrackerEvent,
}

#[async_trait]
impl EventLoopTask for DeliverEvent {
    async fn run(self: Box<Self>) {
        self.sink.on_dependency_event(self.dependency_id, self.event);
    }
}

struct DeliverClosed {
    sink: Arc<dyn DependencyEventSink>,
    dependency_id: DependencyId,
}

#[async_trait]
impl EventLoopTask for DeliverClosed {
    async fn run(self: Box<Self>) {
        self.sink.on_dependency_closed(self.dependency_id);
    }
}

struct Shared {
    id: DependencyId,
    bound_count: AtomicI64,
    tracker_open: AtomicBool,
    disabled: AtomicBool,
}

impl Shared {
    fn apply(&self, event: &TrackerEvent) {
        match event {
            TrackerEvent::Add(_) => {
                let _ = self.bound_count.fetch_add(1, Ordering::AcqRel);
            }
            TrackerEvent::Remove(_) => {
                let _ = self.bound_count.fetch_sub(1, Ordering::AcqRel);
            }
            TrackerEvent::Set(_) => {}
        }
    }
}

/// A single tracked service dependency belonging to a component.
pub struct ServiceDependency {
    id: DependencyId,
    service_name: String,
    filter: Option<String>,
    required: AtomicBool,
    strategy: Mutex<Strategy>,
    callbacks: Mutex<Callbacks>,
    registry: Arc<dyn ServiceRegistry>,
    event_loop: EventLoopHandle,
    bundle_id: i64,
    shared: Arc<Shared>,
    tracker_handle: Mutex<Option<TrackerHandle>>,
}

impl ServiceDependency {
    /// Creates a new, not-yet-enabled dependency on `service_name`.
    pub fn new(
        id: DependencyId,
        bundle_id: i64,
        service_name: impl Into<String>,
        filter: Option<String>,
        registry: Arc<dyn ServiceRegistry>,
        event_loop: EventLoopHandle,
    ) -> Self {
        ServiceDependency {
            id,
            service_name: service_name.into(),
            filter,
            required: AtomicBool::new(true),
            strategy: Mutex::new(Strategy::Suspend),
            callbacks: Mutex::new(Callbacks::default()),
            registry,
            event_loop,
            bundle_id,
            shared: Arc::new(Shared {
                id,
                bound_count: AtomicI64::new(0),
                tracker_open: AtomicBool::new(false),
                disabled: AtomicBool::new(false),
            }),
            tracker_handle: Mutex::new(None),
        }
    }

    /// This dependency's id within its owning component.
    pub fn id(&self) -> DependencyId {
        self.id
    }

    /// The target service name this dependency tracks.
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Configures whether this dependency is required for the component to
    /// reach `TRACKING_OPTIONAL`. Only valid before `enable`.
    pub fn set_required(&self, required: bool) -> Result<(), Error> {
        self.guard_configuration()?;
        self.required.store(required, Ordering::Release);
        Ok(())
    }

    /// Returns `true` if this dependency must be available for the owning
    /// component to activate.
    pub fn is_required(&self) -> bool {
        self.required.load(Ordering::Acquire)
    }

    /// Sets the suspend strategy. Only valid before `enable`.
    pub fn set_strategy(&self, strategy: Strategy) -> Result<(), Error> {
        self.guard_configuration()?;
        *self.strategy.lock().expect("strategy lock poisoned") = strategy;
        Ok(())
    }

    /// The configured suspend strategy.
    pub fn strategy(&self) -> Strategy {
        *self.strategy.lock().expect("strategy lock poisoned")
    }

    /// Replaces the callback capability record. Only valid before `enable`.
    pub fn set_callbacks(&self, callbacks: Callbacks) -> Result<(), Error> {
        self.guard_configuration()?;
        *self.callbacks.lock().expect("callbacks lock poisoned") = callbacks;
        Ok(())
    }

    /// `true` if a `set` callback is configured.
    pub fn is_set_callback_configured(&self) -> bool {
        self.callbacks.lock().expect("callbacks lock poisoned").on_set.is_some()
    }

    /// `true` if an `add` or `remove` callback is configured.
    pub fn is_add_rem_callbacks_configured(&self) -> bool {
        let callbacks = self.callbacks.lock().expect("callbacks lock poisoned");
        callbacks.on_add.is_some() || callbacks.on_remove.is_some()
    }

    /// Invokes the configured `add` callback, if any.
    pub fn invoke_add(&self, service: &BoundService) {
        if let Some(callback) = &self.callbacks.lock().expect("callbacks lock poisoned").on_add {
            callback(service);
        }
    }

    /// Invokes the configured `remove` callback, if any.
    pub fn invoke_remove(&self, service: &BoundService) {
        if let Some(callback) = &self.callbacks.lock().expect("callbacks lock poisoned").on_remove {
            callback(service);
        }
    }

    /// Invokes the configured `set` callback, if any.
    pub fn invoke_set(&self, service: Option<&BoundService>) {
        if let Some(callback) = &self.callbacks.lock().expect("callbacks lock poisoned").on_set {
            callback(service);
        }
    }

    /// `true` iff at least one matching service is currently bound.
    pub fn is_available(&self) -> bool {
        self.shared.bound_count.load(Ordering::Acquire) > 0
    }

    /// `true` once the tracker has been opened by `enable`.
    pub fn is_tracker_open(&self) -> bool {
        self.shared.tracker_open.load(Ordering::Acquire)
    }

    /// `true` once `disable` has run to completion: the tracker has fully
    /// closed and no further events will arrive. Terminal.
    pub fn is_disabled(&self) -> bool {
        self.shared.disabled.load(Ordering::Acquire)
    }

    /// Opens the underlying service tracker and starts forwarding tracker
    /// events to `sink` through the event loop. Must be called on the event
    /// loop thread (the loop posts registrations there in practice, since it
    /// spawns the forwarding task on its own runtime).
    pub fn enable(&self, sink: Arc<dyn DependencyEventSink>) -> Result<(), Error> {
        let (handle, receiver) = self.registry.open_tracker(self.bundle_id, &self.service_name, self.filter.as_deref())?;
        *self.tracker_handle.lock().expect("tracker handle lock poisoned") = Some(handle);
        self.shared.tracker_open.store(true, Ordering::Release);

        let forward = StartForwarder {
            dependency: self.shared.clone(),
            sink,
            receiver,
            event_loop: self.event_loop.clone(),
            bundle_id: self.bundle_id,
        };
        if self.event_loop.fire_generic(self.bundle_id, "dependency-forward", Box::new(forward)).is_err() {
            warn!(dependency_id = self.id, "event loop closed before dependency forwarder could start");
        }
        trace!(dependency_id = self.id, service = %self.service_name, "dependency enabled");
        Ok(())
    }

    /// Closes the underlying tracker. `is_disabled` becomes `true`
    /// asymptotically, once the forwarder observes channel closure and
    /// notifies the sink via `on_dependency_closed`.
    pub fn disable(&self) {
        let handle = self.tracker_handle.lock().expect("tracker handle lock poisoned").take();
        if let Some(handle) = handle {
            self.registry.close_tracker(handle);
        }
        self.shared.tracker_open.store(false, Ordering::Release);
        trace!(dependency_id = self.id, "dependency disable requested");
    }

    fn guard_configuration(&self) -> Result<(), Error> {
        if self.shared.tracker_open.load(Ordering::Acquire) {
            return Err(Error::AlreadyEnabled);
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use dm_event_loop::EventLoop;
    use dm_registry::{mock::InMemoryRegistry, ServiceRegistration};

    use super::*;

    struct RecordingSink {
        events: Mutex<Vec<String>>,
        closed: Mutex<bool>,
        done: flume::Sender<()>,
    }

    impl DependencyEventSink for RecordingSink {
        fn on_dependency_event(&self, _dependency_id: DependencyId, event: TrackerEvent) {
            let label = match event {
                TrackerEvent::Add(_) => "add",
                TrackerEvent::Remove(_) => "remove",
                TrackerEvent::Set(_) => "set",
            };
            self.events.lock().expect("events lock poisoned").push(label.to_string());
            let _ = self.done.send(());
        }

        fn on_dependency_closed(&self, _dependency_id: DependencyId) {
            *self.closed.lock().expect("closed lock poisoned") = true;
            let _ = self.done.send(());
        }
    }

    #[test]
    fn enable_delivers_add_and_set_for_a_pre_existing_service() {
        let event_loop = EventLoop::start();
        let handle = event_loop.handle();
        let registry: Arc<dyn ServiceRegistry> = Arc::new(InMemoryRegistry::new());

        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(registry.register_service_async(
            1,
            ServiceRegistration { service_name: "Foo".into(), instance: Arc::new(7u32), properties: dm_properties::Properties::new() },
        ))
        .unwrap();

        let dependency = ServiceDependency::new(0, 1, "Foo", None, registry, handle.clone());
        let (done_tx, done_rx) = flume::unbounded();
        let sink = Arc::new(RecordingSink { events: Mutex::new(Vec::new()), closed: Mutex::new(false), done: done_tx });

        dependency.enable(sink.clone()).unwrap();
        let _ = done_rx.recv_timeout(Duration::from_secs(1)).unwrap();
        let _ = done_rx.recv_timeout(Duration::from_secs(1)).unwrap();

        handle.wait_for_empty_queue();
        assert!(dependency.is_available());
        assert_eq!(*sink.events.lock().unwrap(), vec!["add".to_string(), "set".to_string()]);
    }

    #[test]
    fn disable_eventually_notifies_closed() {
        let event_loop = EventLoop::start();
        let handle = event_loop.handle();
        let registry: Arc<dyn ServiceRegistry> = Arc::new(InMemoryRegistry::new());

        let dependency = ServiceDependency::new(0, 1, "Foo", None, registry, handle.clone());
        let (done_tx, done_rx) = flume::unbounded();
        let sink = Arc::new(RecordingSink { events: Mutex::new(Vec::new()), closed: Mutex::new(false), done: done_tx });

        dependency.enable(sink.clone()).unwrap();
        dependency.disable();
        let _ = done_rx.recv_timeout(Duration::from_secs(1)).unwrap();
        handle.wait_for_empty_queue();

        assert!(*sink.closed.lock().unwrap());
        assert!(dependency.is_disabled());
    }

    #[test]
    fn set_required_after_enable_is_rejected() {
        let event_loop = EventLoop::start();
        let handle = event_loop.handle();
        let registry: Arc<dyn ServiceRegistry> = Arc::new(InMemoryRegistry::new());
        let dependency = ServiceDependency::new(0, 1, "Foo", None, registry, handle);
        let (done_tx, _done_rx) = flume::unbounded();
        let sink = Arc::new(RecordingSink { events: Mutex::new(Vec::new()), closed: Mutex::new(false), done: done_tx });

        dependency.enable(sink).unwrap();
        assert!(matches!(dependency.set_required(false), Err(Error::AlreadyEnabled)));
    }
}
