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

//! The `Component` state machine: drives a component through `INACTIVE` ->
//! `WAITING_FOR_REQUIRED` -> `INSTANTIATED_AND_WAITING_FOR_REQUIRED` ->
//! `TRACKING_OPTIONAL`, gated by the resolution of its declared
//! [`ServiceDependency`]s, and registers its [`ProvidedInterface`]s with the
//! registry only while `TRACKING_OPTIONAL`.
//!
//! Every mutation of a component's state is serialized through the
//! [`dm_event_loop::EventLoop`]: public methods that can be called from any
//! thread (`enable`, `disable`, `add_dependency`, `remove_dependency`)
//! enqueue a task rather than mutate directly, and the dependency forwarder
//! in `dm-dependency` already calls back into this crate from the loop
//! thread. Cyclic ownership between a `Component` and its dependencies
//! (Design Notes §9) is broken the same way the teacher's engine crate avoids
//! cycles in its controllers: the component holds a `Weak` self-reference
//! (`Arc::new_cyclic`) so dependency callbacks can hand a fresh `Arc` back to
//! the async task that actually performs the transition.

use std::{
    fmt,
    sync::{Arc, Mutex, Weak},
};

use async_trait::async_trait;
use dm_dependency::{DependencyEventSink, DependencyId, ServiceDependency, Strategy};
use dm_event_loop::{EventLoopHandle, EventLoopTask};
use dm_properties::{keys, Properties};
use dm_registry::{ServiceId, ServiceRegistration, ServiceRegistry};
use tracing::{error, trace, warn};
use uuid::Uuid;

/// The stable identifier of a component.
pub type ComponentId = Uuid;

/// The identifier of one of a component's provided interfaces.
pub type ProvidedInterfaceId = u64;

/// All the errors that can occur when configuring a [`Component`].
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The supplied string is not a valid UUID.
    #[error("invalid component uuid: {0}")]
    InvalidUuid(String),

    /// A provided interface with the same service name and properties is
    /// already registered on this component.
    #[error("duplicate provided interface (service: {service_name})")]
    DuplicateProvidedInterface {
        /// The service name that was already provided.
        service_name: String,
    },

    /// Configuration was attempted after the component had already been
    /// enabled once.
    #[error("component configuration is frozen once enabled")]
    AlreadyEnabled,
}

/// The error returned by a failing lifecycle callback (`init`/`start`/
/// `stop`/`deinit`). Fatal for the owning component: `spec.md` §4.3/§7.
#[derive(thiserror::Error, Debug, Clone)]
#[error("{0}")]
pub struct LifecycleError(pub String);

impl LifecycleError {
    /// Builds a `LifecycleError` from any displayable reason.
    pub fn new(reason: impl fmt::Display) -> Self {
        LifecycleError(reason.to_string())
    }
}

/// User-supplied lifecycle hooks for a component. Each method is called at
/// most once per state entry and never runs concurrently with another
/// callback of the same component (`spec.md` §5, invariant 3). The
/// "opaque implementation pointer" of the source model becomes, in Rust,
/// simply the trait object itself: there is no separate user-data pointer to
/// carry around.
pub trait ComponentLifecycle: Send {
    /// Called once on entry into `INSTANTIATED_AND_WAITING_FOR_REQUIRED`.
    fn init(&mut self) -> Result<(), LifecycleError> {
        Ok(())
    }

    /// Called once on entry into `TRACKING_OPTIONAL`, before the component's
    /// provided interfaces are (re-)registered.
    fn start(&mut self) -> Result<(), LifecycleError> {
        Ok(())
    }

    /// Called once on exit from `TRACKING_OPTIONAL`, after the component's
    /// provided interfaces have been unregistered.
    fn stop(&mut self) -> Result<(), LifecycleError> {
        Ok(())
    }

    /// Called once on exit from `INSTANTIATED_AND_WAITING_FOR_REQUIRED`.
    fn deinit(&mut self) -> Result<(), LifecycleError> {
        Ok(())
    }
}

/// The four states of the component state machine (`spec.md` §4.3). The
/// `Display` strings below are part of the debug/introspection contract
/// (`spec.md` §6) and must never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Not enabled, or fully torn down.
    Inactive,
    /// Enabled, but not every dependency has resolved yet.
    WaitingForRequired,
    /// Every dependency has resolved; `init` has run but `start` has not.
    Instantiated,
    /// Fully active: `start` has run and provided interfaces are registered.
    TrackingOptional,
}

impl State {
    /// The stable, wire-compatible name of this state. The original's fifth
    /// string, `UNKNOWN`, covers an out-of-range state value read back from
    /// an untyped integer; `State` has no such representation; every value
    /// of this enum is one of the four variants below, so `UNKNOWN` has no
    /// case to return it from and is not reachable here.
    pub fn as_str(self) -> &'static str {
        match self {
            State::Inactive => "INACTIVE",
            State::WaitingForRequired => "WAITING_FOR_REQUIRED",
            State::Instantiated => "INSTANTIATED_AND_WAITING_FOR_REQUIRED",
            State::TrackingOptional => "TRACKING_OPTIONAL",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn compute_next_state(state: State, enabled: bool, all_required_resolved: bool) -> State {
    match state {
        State::Inactive => {
            if enabled {
                State::WaitingForRequired
            } else {
                State::Inactive
            }
        }
        State::WaitingForRequired => {
            if !enabled {
                State::Inactive
            } else if all_required_resolved {
                State::Instantiated
            } else {
                State::WaitingForRequired
            }
        }
        State::Instantiated => {
            if !enabled {
                State::WaitingForRequired
            } else if all_required_resolved {
                State::TrackingOptional
            } else {
                State::Instantiated
            }
        }
        State::TrackingOptional => {
            if !enabled || !all_required_resolved {
                State::Instantiated
            } else {
                State::TrackingOptional
            }
        }
    }
}

/// A service the component publishes while `TRACKING_OPTIONAL`. Owned by the
/// component: it is unregistered (if still registered) when the component is
/// destroyed.
struct ProvidedInterface {
    id: ProvidedInterfaceId,
    service_name: String,
    instance: Arc<dyn std::any::Any + Send + Sync>,
    properties: Properties,
    /// `-1` means not currently registered with the registry.
    svc_id: i64,
}

/// A read-only snapshot of one provided interface, for introspection.
#[derive(Debug, Clone)]
pub struct ProvidedInterfaceInfo {
    /// This interface's id within its owning component.
    pub id: ProvidedInterfaceId,
    /// The interface name it is registered under.
    pub service_name: String,
    /// The registry-assigned id, or `-1` if not currently registered.
    pub svc_id: i64,
}

/// A read-only snapshot of one service dependency, for introspection.
#[derive(Debug, Clone)]
pub struct DependencyInfo {
    /// This dependency's id within its owning component.
    pub id: DependencyId,
    /// The target service name.
    pub service_name: String,
    /// Whether this dependency is required for activation.
    pub required: bool,
    /// Whether at least one matching service is currently bound.
    pub available: bool,
    /// Whether the underlying tracker is currently open.
    pub tracker_open: bool,
}

/// A full introspection snapshot of a component, taken under its mutex
/// (`spec.md` §5: "Introspection takes the mutex, copies, releases").
#[derive(Debug, Clone)]
pub struct ComponentInfo {
    /// The component's stable identifier.
    pub id: ComponentId,
    /// The component's human name.
    pub name: String,
    /// The bundle that owns this component.
    pub bundle_id: i64,
    /// The current state.
    pub state: State,
    /// Whether the component is currently enabled.
    pub enabled: bool,
    /// How many times this component has reached `TRACKING_OPTIONAL` from
    /// `INSTANTIATED_AND_WAITING_FOR_REQUIRED`.
    pub times_started: u64,
    /// How many times the suspend/resume protocol has run to completion.
    pub times_resumed: u64,
    /// Snapshots of the component's provided interfaces.
    pub provided_interfaces: Vec<ProvidedInterfaceInfo>,
    /// Snapshots of the component's currently active dependencies.
    pub dependencies: Vec<DependencyInfo>,
}

#[derive(Default)]
struct Inner {
    state_enabled: bool,
    state: StateHolder,
    provided: Vec<ProvidedInterface>,
    dependencies: Vec<Arc<ServiceDependency>>,
    removed_dependencies: Vec<Arc<ServiceDependency>>,
    next_provided_id: ProvidedInterfaceId,
    next_dependency_id: DependencyId,
    times_started: u64,
    times_resumed: u64,
}

/// `State` has no meaningful default but `Inner` needs one for
/// `#[derive(Default)]`; this tiny newtype supplies `INACTIVE`.
struct StateHolder(State);
impl Default for StateHolder {
    fn default() -> Self {
        StateHolder(State::Inactive)
    }
}

/// A managed component: holds the user implementation's lifecycle hooks, the
/// services it provides, and the dependencies gating its activation.
pub struct Component {
    id: ComponentId,
    name: String,
    bundle_id: i64,
    event_loop: EventLoopHandle,
    registry: Arc<dyn ServiceRegistry>,
    lifecycle: Mutex<Box<dyn ComponentLifecycle>>,
    self_ref: Weak<Component>,
    inner: Mutex<Inner>,
}

/// Builds a [`Component`] before it is registered with a
/// [`dm_manager::DependencyManager`] (external crate, to avoid a cycle).
pub struct ComponentBuilder {
    id: Option<ComponentId>,
    name: String,
    bundle_id: i64,
    lifecycle: Box<dyn ComponentLifecycle>,
    registry: Arc<dyn ServiceRegistry>,
    event_loop: EventLoopHandle,
}

impl ComponentBuilder {
    /// Creates a new builder. `lifecycle` is invoked exclusively on the
    /// event loop thread from this point on.
    pub fn new(
        name: impl Into<String>,
        bundle_id: i64,
        lifecycle: Box<dyn ComponentLifecycle>,
        registry: Arc<dyn ServiceRegistry>,
        event_loop: EventLoopHandle,
    ) -> Self {
        ComponentBuilder { id: None, name: name.into(), bundle_id, lifecycle, registry, event_loop }
    }

    /// Pins the component's UUID instead of generating a random one.
    pub fn with_uuid(mut self, uuid: &str) -> Result<Self, Error> {
        self.id = Some(Uuid::parse_str(uuid).map_err(|_| Error::InvalidUuid(uuid.to_string()))?);
        Ok(self)
    }

    /// Finalizes the component. The returned `Arc` is not yet enabled: call
    /// [`Component::enable`] (directly, or via `dm_manager::DependencyManager::add`)
    /// once its provided interfaces and dependencies are configured.
    pub fn build(self) -> Arc<Component> {
        Arc::new_cyclic(|weak| Component {
            id: self.id.unwrap_or_else(Uuid::new_v4),
            name: self.name,
            bundle_id: self.bundle_id,
            event_loop: self.event_loop,
            registry: self.registry,
            lifecycle: Mutex::new(self.lifecycle),
            self_ref: weak.clone(),
            inner: Mutex::new(Inner::default()),
        })
    }
}

enum EventKind {
    Add,
    Remove,
    SetSome,
    SetNone,
}

impl EventKind {
    fn of(event: &dm_registry::TrackerEvent) -> Self {
        match event {
            dm_registry::TrackerEvent::Add(_) => EventKind::Add,
            dm_registry::TrackerEvent::Remove(_) => EventKind::Remove,
            dm_registry::TrackerEvent::Set(Some(_)) => EventKind::SetSome,
            dm_registry::TrackerEvent::Set(None) => EventKind::SetNone,
        }
    }

    /// `true` if, per `spec.md` §4.4, the callback for this event kind fires
    /// before `handle_change` re-evaluates state.
    fn callback_before_handle_change(&self) -> bool {
        matches!(self, EventKind::Add | EventKind::SetSome)
    }
}

impl Component {
    /// This component's stable identifier.
    pub fn id(&self) -> ComponentId {
        self.id
    }

    /// This component's human name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The bundle that owns this component.
    pub fn bundle_id(&self) -> i64 {
        self.bundle_id
    }

    /// The current state.
    pub fn state(&self) -> State {
        self.inner.lock().expect("component lock poisoned").state.0
    }

    /// `true` if the component is currently enabled (may still be
    /// `WAITING_FOR_REQUIRED` or `INSTANTIATED_AND_WAITING_FOR_REQUIRED`).
    pub fn is_enabled(&self) -> bool {
        self.inner.lock().expect("component lock poisoned").state_enabled
    }

    /// `true` iff `state() == TRACKING_OPTIONAL` (invariant 1).
    pub fn is_active(&self) -> bool {
        self.state() == State::TrackingOptional
    }

    /// How many times this component has reached `TRACKING_OPTIONAL`.
    pub fn times_started(&self) -> u64 {
        self.inner.lock().expect("component lock poisoned").times_started
    }

    /// How many times the suspend/resume protocol has completed.
    pub fn times_resumed(&self) -> u64 {
        self.inner.lock().expect("component lock poisoned").times_resumed
    }

    /// `true` once destroyable: disabled, `INACTIVE`, and every current and
    /// removed dependency has fully closed its tracker (invariant 4).
    pub fn is_destroyable(&self) -> bool {
        let inner = self.inner.lock().expect("component lock poisoned");
        !inner.state_enabled
            && inner.state.0 == State::Inactive
            && inner.dependencies.is_empty()
            && inner.removed_dependencies.iter().all(|d| d.is_disabled())
    }

    /// Takes a consistent snapshot of this component for introspection.
    /// Locks the mutex, copies, releases — never while a callback is in
    /// flight, since callbacks only run on the loop thread while holding no
    /// lock across `.await` points.
    pub fn create_info(&self) -> ComponentInfo {
        let inner = self.inner.lock().expect("component lock poisoned");
        ComponentInfo {
            id: self.id,
            name: self.name.clone(),
            bundle_id: self.bundle_id,
            state: inner.state.0,
            enabled: inner.state_enabled,
            times_started: inner.times_started,
            times_resumed: inner.times_resumed,
            provided_interfaces: inner
                .provided
                .iter()
                .map(|p| ProvidedInterfaceInfo { id: p.id, service_name: p.service_name.clone(), svc_id: p.svc_id })
                .collect(),
            dependencies: inner
                .dependencies
                .iter()
                .map(|d| DependencyInfo {
                    id: d.id(),
                    service_name: d.service_name().to_string(),
                    required: d.is_required(),
                    available: d.is_available(),
                    tracker_open: d.is_tracker_open(),
                })
                .collect(),
        }
    }

    /// Registers a service this component publishes while `TRACKING_OPTIONAL`.
    /// Only valid before the component is first enabled, mirroring
    /// `ServiceDependency`'s own configuration freeze.
    pub fn add_provided_interface(
        &self,
        service_name: impl Into<String>,
        instance: Arc<dyn std::any::Any + Send + Sync>,
        properties: Properties,
    ) -> Result<ProvidedInterfaceId, Error> {
        let service_name = service_name.into();
        let mut inner = self.inner.lock().expect("component lock poisoned");
        if inner.state_enabled {
            return Err(Error::AlreadyEnabled);
        }
        if inner.provided.iter().any(|p| p.service_name == service_name && p.properties == properties) {
            return Err(Error::DuplicateProvidedInterface { service_name });
        }
        let id = inner.next_provided_id;
        inner.next_provided_id += 1;
        inner.provided.push(ProvidedInterface { id, service_name, instance, properties, svc_id: -1 });
        Ok(id)
    }

    /// Allocates a new, not-yet-configured [`ServiceDependency`] owned by
    /// this component's bundle and registry. The caller should configure it
    /// (`set_required`/`set_strategy`/`set_callbacks`) before passing it to
    /// [`Component::add_dependency`].
    pub fn new_dependency(self: &Arc<Self>, service_name: impl Into<String>, filter: Option<String>) -> Arc<ServiceDependency> {
        let id = {
            let mut inner = self.inner.lock().expect("component lock poisoned");
            let id = inner.next_dependency_id;
            inner.next_dependency_id += 1;
            id
        };
        Arc::new(ServiceDependency::new(id, self.bundle_id, service_name, filter, self.registry.clone(), self.event_loop.clone()))
    }

    /// Attaches `dependency` to this component. If the component is already
    /// enabled, the dependency is opened immediately and its resolution may
    /// re-evaluate the component's state (`spec.md` §1: dynamic add/remove
    /// of dependencies during lifecycle). Always processed on the event
    /// loop thread.
    pub fn add_dependency(self: &Arc<Self>, dependency: Arc<ServiceDependency>) {
        let component = self.clone();
        self.post("component-add-dependency", AddDependencyTask { component, dependency });
    }

    /// Detaches the dependency identified by `dependency_id`, closing its
    /// tracker asynchronously and re-evaluating the component's state. Per
    /// the Open Question in `spec.md` §9, this is processed strictly after
    /// any event already queued for that dependency, since both run on the
    /// single event loop thread.
    pub fn remove_dependency(self: &Arc<Self>, dependency_id: DependencyId) {
        let component = self.clone();
        self.post("component-remove-dependency", RemoveDependencyTask { component, dependency_id });
    }

    /// Enables the component: starts driving it from `INACTIVE` toward
    /// `TRACKING_OPTIONAL` as its dependencies resolve. Always processed on
    /// the event loop thread, regardless of the calling thread.
    pub fn enable(self: &Arc<Self>) {
        let component = self.clone();
        self.post("component-enable", SetEnabledTask { component, enabled: true });
    }

    /// Disables the component: drives it back to `INACTIVE`, unregistering
    /// its provided interfaces and disabling its dependencies along the way.
    pub fn disable(self: &Arc<Self>) {
        let component = self.clone();
        self.post("component-disable", SetEnabledTask { component, enabled: false });
    }

    fn post(&self, label: &'static str, task: impl EventLoopTask + 'static) {
        if self.event_loop.fire_generic(self.bundle_id, label, Box::new(task)).is_err() {
            warn!(component = %self.name, "event loop closed; dropping component task {label}");
        }
    }

    fn all_required_resolved(inner: &Inner) -> bool {
        inner.dependencies.iter().all(|d| d.is_tracker_open() && (!d.is_required() || d.is_available()))
    }

    /// Runs the fixpoint loop of `spec.md` §4.3 until the state is stable.
    async fn handle_change(component: &Arc<Component>) {
        loop {
            let (prev, next) = {
                let inner = component.inner.lock().expect("component lock poisoned");
                let next = compute_next_state(inner.state.0, inner.state_enabled, Component::all_required_resolved(&inner));
                (inner.state.0, next)
            };
            if prev == next {
                break;
            }
            trace!(component = %component.name, %prev, %next, "component transition");
            let fatal = Component::perform_transition(component, prev, next).await;
            if fatal {
                break;
            }
        }
    }

    async fn perform_transition(component: &Arc<Component>, prev: State, next: State) -> bool {
        match (prev, next) {
            (State::Inactive, State::WaitingForRequired) => {
                Component::enable_all_dependencies(component);
                Component::set_state(component, State::WaitingForRequired);
                false
            }
            (State::WaitingForRequired, State::Inactive) => {
                Component::disable_all_dependencies(component);
                Component::set_state(component, State::Inactive);
                false
            }
            (State::WaitingForRequired, State::Instantiated) => {
                let result = component.lifecycle.lock().expect("lifecycle lock poisoned").init();
                match result {
                    Ok(()) => {
                        Component::set_state(component, State::Instantiated);
                        false
                    }
                    Err(err) => {
                        error!(component = %component.name, error = %err, "init failed; forcing component to INACTIVE");
                        Component::force_inactive(component).await;
                        true
                    }
                }
            }
            (State::Instantiated, State::WaitingForRequired) => {
                let result = component.lifecycle.lock().expect("lifecycle lock poisoned").deinit();
                match result {
                    Ok(()) => {
                        Component::set_state(component, State::WaitingForRequired);
                        false
                    }
                    Err(err) => {
                        error!(component = %component.name, error = %err, "deinit failed; forcing component to INACTIVE");
                        Component::force_inactive(component).await;
                        true
                    }
                }
            }
            (State::Instantiated, State::TrackingOptional) => {
                let result = component.lifecycle.lock().expect("lifecycle lock poisoned").start();
                match result {
                    Ok(()) => {
                        Component::register_provided_interfaces(component).await;
                        {
                            let mut inner = component.inner.lock().expect("component lock poisoned");
                            inner.times_started += 1;
                        }
                        Component::set_state(component, State::TrackingOptional);
                        false
                    }
                    Err(err) => {
                        error!(component = %component.name, error = %err, "start failed; forcing component to INACTIVE");
                        Component::force_inactive(component).await;
                        true
                    }
                }
            }
            (State::TrackingOptional, State::Instantiated) => {
                Component::unregister_provided_interfaces(component).await;
                let result = component.lifecycle.lock().expect("lifecycle lock poisoned").stop();
                match result {
                    Ok(()) => {
                        Component::set_state(component, State::Instantiated);
                        false
                    }
                    Err(err) => {
                        error!(component = %component.name, error = %err, "stop failed; forcing component to INACTIVE");
                        Component::force_inactive(component).await;
                        true
                    }
                }
            }
            (from, to) => {
                warn!(component = %component.name, %from, %to, "unexpected component state transition; ignoring");
                false
            }
        }
    }

    fn set_state(component: &Arc<Component>, state: State) {
        component.inner.lock().expect("component lock poisoned").state.0 = state;
    }

    /// Forces the component directly to `INACTIVE` after a fatal lifecycle
    /// callback failure: services are unregistered, dependencies disabled,
    /// `enabled` cleared, no further transitions attempted (`spec.md` §4.3).
    async fn force_inactive(component: &Arc<Component>) {
        Component::unregister_provided_interfaces(component).await;
        Component::disable_all_dependencies(component);
        let mut inner = component.inner.lock().expect("component lock poisoned");
        inner.state.0 = State::Inactive;
        inner.state_enabled = false;
    }

    fn enable_all_dependencies(component: &Arc<Component>) {
        let deps: Vec<Arc<ServiceDependency>> = component.inner.lock().expect("component lock poisoned").dependencies.clone();
        for dep in deps {
            if !dep.is_tracker_open() {
                let sink: Arc<dyn DependencyEventSink> = component.clone();
                if let Err(err) = dep.enable(sink) {
                    error!(component = %component.name, dependency = dep.service_name(), error = %err, "failed to enable dependency");
                }
            }
        }
    }

    fn disable_all_dependencies(component: &Arc<Component>) {
        let mut inner = component.inner.lock().expect("component lock poisoned");
        let deps: Vec<Arc<ServiceDependency>> = inner.dependencies.drain(..).collect();
        for dep in deps {
            dep.disable();
            inner.removed_dependencies.push(dep);
        }
    }

    fn build_registration(component: &Arc<Component>, provided: &ProvidedInterface) -> ServiceRegistration {
        let mut properties = provided.properties.clone();
        let _ = properties.set(keys::COMPONENT_UUID, component.id.to_string());
        ServiceRegistration { service_name: provided.service_name.clone(), instance: provided.instance.clone(), properties }
    }

    async fn register_provided_interfaces(component: &Arc<Component>) {
        let to_register: Vec<(ProvidedInterfaceId, ServiceRegistration)> = {
            let inner = component.inner.lock().expect("component lock poisoned");
            inner.provided.iter().filter(|p| p.svc_id < 0).map(|p| (p.id, Component::build_registration(component, p))).collect()
        };
        for (id, registration) in to_register {
            let service_name = registration.service_name.clone();
            match component.registry.register_service_async(component.bundle_id, registration).await {
                Ok(svc_id) => {
                    let mut inner = component.inner.lock().expect("component lock poisoned");
                    if let Some(p) = inner.provided.iter_mut().find(|p| p.id == id) {
                        p.svc_id = svc_id as i64;
                    }
                    trace!(component = %component.name, service = %service_name, svc_id, "provided interface registered");
                }
                Err(err) => {
                    error!(component = %component.name, service = %service_name, error = %err, "failed to register provided interface; will retry on next activation");
                }
            }
        }
    }

    async fn unregister_provided_interfaces(component: &Arc<Component>) {
        let to_unregister: Vec<(ProvidedInterfaceId, ServiceId)> = {
            let inner = component.inner.lock().expect("component lock poisoned");
            inner.provided.iter().filter(|p| p.svc_id >= 0).map(|p| (p.id, p.svc_id as ServiceId)).collect()
        };
        for (id, svc_id) in to_unregister {
            match component.registry.unregister_service(svc_id).await {
                Ok(()) => {
                    let mut inner = component.inner.lock().expect("component lock poisoned");
                    if let Some(p) = inner.provided.iter_mut().find(|p| p.id == id) {
                        p.svc_id = -1;
                    }
                }
                Err(err) => {
                    error!(component = %component.name, svc_id, error = %err, "failed to unregister provided interface");
                }
            }
        }
    }

    /// `true` iff (a) the component is `TRACKING_OPTIONAL`, (b) `dependency`'s
    /// strategy is `Suspend`, and (c) the callback about to fire for `kind`
    /// is actually configured (`spec.md` §4.4).
    fn needs_suspend(state: State, dependency: &ServiceDependency, kind: &EventKind) -> bool {
        if state != State::TrackingOptional || dependency.strategy() != Strategy::Suspend {
            return false;
        }
        match kind {
            EventKind::SetSome | EventKind::SetNone => dependency.is_set_callback_configured(),
            EventKind::Add | EventKind::Remove => dependency.is_add_rem_callbacks_configured(),
        }
    }

    fn invoke_callback(dependency: &ServiceDependency, event: &dm_registry::TrackerEvent) {
        match event {
            dm_registry::TrackerEvent::Add(bound) => dependency.invoke_add(bound),
            dm_registry::TrackerEvent::Remove(bound) => dependency.invoke_remove(bound),
            dm_registry::TrackerEvent::Set(bound) => dependency.invoke_set(bound.as_ref()),
        }
    }

    /// Unregisters services, calls `stop`, runs `callback`, calls `start`,
    /// re-registers services, and bumps `times_resumed`. A failing `stop` or
    /// `start` forces the component to `INACTIVE` instead (`spec.md` §4.4).
    async fn suspend_around(component: &Arc<Component>, callback: impl FnOnce()) {
        Component::unregister_provided_interfaces(component).await;
        let stop_result = component.lifecycle.lock().expect("lifecycle lock poisoned").stop();
        if let Err(err) = stop_result {
            error!(component = %component.name, error = %err, "stop failed during suspend; forcing component to INACTIVE");
            Component::force_inactive(component).await;
            return;
        }

        callback();

        let start_result = component.lifecycle.lock().expect("lifecycle lock poisoned").start();
        if let Err(err) = start_result {
            error!(component = %component.name, error = %err, "start failed during resume; forcing component to INACTIVE");
            Component::force_inactive(component).await;
            return;
        }
        Component::register_provided_interfaces(component).await;
        let mut inner = component.inner.lock().expect("component lock poisoned");
        inner.times_resumed += 1;
    }

    async fn process_dependency_event(component: &Arc<Component>, dependency_id: DependencyId, event: dm_registry::TrackerEvent) {
        let dependency = {
            let inner = component.inner.lock().expect("component lock poisoned");
            inner.dependencies.iter().find(|d| d.id() == dependency_id).cloned()
        };
        let Some(dependency) = dependency else {
            trace!(component = %component.name, dependency_id, "dependency event for a dependency no longer attached; ignoring");
            return;
        };

        let kind = EventKind::of(&event);
        if kind.callback_before_handle_change() {
            let state = component.state();
            if Component::needs_suspend(state, &dependency, &kind) {
                let dep = dependency.clone();
                let evt = event.clone();
                Component::suspend_around(component, move || Component::invoke_callback(&dep, &evt)).await;
            } else {
                Component::invoke_callback(&dependency, &event);
            }
            Component::handle_change(component).await;
        } else {
            Component::handle_change(component).await;
            let state = component.state();
            if Component::needs_suspend(state, &dependency, &kind) {
                let dep = dependency.clone();
                let evt = event.clone();
                Component::suspend_around(component, move || Component::invoke_callback(&dep, &evt)).await;
            } else {
                Component::invoke_callback(&dependency, &event);
            }
        }
    }

    fn process_dependency_closed(component: &Arc<Component>, dependency_id: DependencyId) {
        let mut inner = component.inner.lock().expect("component lock poisoned");
        inner.removed_dependencies.retain(|d| d.id() != dependency_id || !d.is_disabled());
        trace!(component = %component.name, dependency_id, "dependency tracker fully closed");
    }
}

impl DependencyEventSink for Component {
    fn on_dependency_event(&self, dependency_id: DependencyId, event: dm_registry::TrackerEvent) {
        let Some(component) = self.self_ref.upgrade() else {
            return;
        };
        self.post("component-dependency-event", DependencyEventTask { component, dependency_id, event });
    }

    fn on_dependency_closed(&self, dependency_id: DependencyId) {
        let Some(component) = self.self_ref.upgrade() else {
            return;
        };
        self.post("component-dependency-closed", DependencyClosedTask { component, dependency_id });
    }
}

struct SetEnabledTask {
    component: Arc<Component>,
    enabled: bool,
}

#[async_trait]
impl EventLoopTask for SetEnabledTask {
    async fn run(self: Box<Self>) {
        {
            let mut inner = self.component.inner.lock().expect("component lock poisoned");
            inner.state_enabled = self.enabled;
        }
        Component::handle_change(&self.component).await;
    }
}

struct AddDependencyTask {
    component: Arc<Component>,
    dependency: Arc<ServiceDependency>,
}

#[async_trait]
impl EventLoopTask for AddDependencyTask {
    async fn run(self: Box<Self>) {
        let should_enable = {
            let mut inner = self.component.inner.lock().expect("component lock poisoned");
            inner.dependencies.push(self.dependency.clone());
            inner.state_enabled
        };
        if should_enable {
            let sink: Arc<dyn DependencyEventSink> = self.component.clone();
            if let Err(err) = self.dependency.enable(sink) {
                error!(component = %self.component.name, error = %err, "failed to enable newly added dependency");
            }
        }
        Component::handle_change(&self.component).await;
    }
}

struct RemoveDependencyTask {
    component: Arc<Component>,
    dependency_id: DependencyId,
}

#[async_trait]
impl EventLoopTask for RemoveDependencyTask {
    async fn run(self: Box<Self>) {
        let removed = {
            let mut inner = self.component.inner.lock().expect("component lock poisoned");
            let position = inner.dependencies.iter().position(|d| d.id() == self.dependency_id);
            position.map(|index| inner.dependencies.remove(index))
        };
        if let Some(dependency) = removed {
            dependency.disable();
            let mut inner = self.component.inner.lock().expect("component lock poisoned");
            inner.removed_dependencies.push(dependency);
        }
        Component::handle_change(&self.component).await;
    }
}

struct DependencyEventTask {
    component: Arc<Component>,
    dependency_id: DependencyId,
    event: dm_registry::TrackerEvent,
}

#[async_trait]
impl EventLoopTask for DependencyEventTask {
    async fn run(self: Box<Self>) {
        Component::process_dependency_event(&self.component, self.dependency_id, self.event).await;
    }
}

struct DependencyClosedTask {
    component: Arc<Component>,
    dependency_id: DependencyId,
}

#[async_trait]
impl EventLoopTask for DependencyClosedTask {
    async fn run(self: Box<Self>) {
        Component::process_dependency_closed(&self.component, self.dependency_id);
    }
}

#[cfg(test)]
mod test {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use dm_dependency::{Callbacks, Strategy};
    use dm_event_loop::EventLoop;
    use dm_registry::{mock::InMemoryRegistry, ServiceRegistration};

    use super::*;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<&'static str>>,
    }

    impl Recorder {
        fn push(&self, label: &'static str) {
            self.calls.lock().unwrap().push(label);
        }

        fn snapshot(&self) -> Vec<&'static str> {
            self.calls.lock().unwrap().clone()
        }
    }

    struct RecordingLifecycle {
        recorder: Arc<Recorder>,
        fail_start: bool,
    }

    impl ComponentLifecycle for RecordingLifecycle {
        fn init(&mut self) -> Result<(), LifecycleError> {
            self.recorder.push("init");
            Ok(())
        }

        fn start(&mut self) -> Result<(), LifecycleError> {
            self.recorder.push("start");
            if self.fail_start {
                return Err(LifecycleError::new("boom"));
            }
            Ok(())
        }

        fn stop(&mut self) -> Result<(), LifecycleError> {
            self.recorder.push("stop");
            Ok(())
        }

        fn deinit(&mut self) -> Result<(), LifecycleError> {
            self.recorder.push("deinit");
            Ok(())
        }
    }

    fn dummy_service() -> Arc<dyn std::any::Any + Send + Sync> {
        Arc::new(7u32)
    }

    async fn wait_for<F: Fn() -> bool>(predicate: F) {
        for _ in 0..200 {
            if predicate() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition never became true");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn s1_happy_path_required_dependency_then_provided_service() {
        let event_loop = EventLoop::start();
        let handle = event_loop.handle();
        let registry: Arc<dyn ServiceRegistry> = Arc::new(InMemoryRegistry::new());
        let recorder = Arc::new(Recorder::default());

        let component = ComponentBuilder::new(
            "Comp",
            1,
            Box::new(RecordingLifecycle { recorder: recorder.clone(), fail_start: false }),
            registry.clone(),
            handle.clone(),
        )
        .build();

        let _ = component.add_provided_interface("Bar", dummy_service(), Properties::new()).unwrap();
        let dependency = component.new_dependency("Foo", None);
        dependency.set_required(true).unwrap();
        component.add_dependency(dependency);

        component.enable();
        handle.wait_for_empty_queue();
        assert_eq!(component.state(), State::WaitingForRequired);

        registry
            .register_service_async(1, ServiceRegistration { service_name: "Foo".into(), instance: dummy_service(), properties: Properties::new() })
            .await
            .unwrap();

        wait_for(|| component.state() == State::TrackingOptional).await;
        handle.wait_for_empty_queue();

        assert_eq!(recorder.snapshot(), vec!["init", "start"]);
        assert_eq!(component.times_started(), 1);
        let info = component.create_info();
        assert_eq!(info.provided_interfaces.len(), 1);
        assert!(info.provided_interfaces[0].svc_id >= 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn s3_suspend_around_set_for_suspend_strategy() {
        let event_loop = EventLoop::start();
        let handle = event_loop.handle();
        let registry: Arc<dyn ServiceRegistry> = Arc::new(InMemoryRegistry::new());
        let recorder = Arc::new(Recorder::default());

        let component = ComponentBuilder::new(
            "Comp",
            1,
            Box::new(RecordingLifecycle { recorder: recorder.clone(), fail_start: false }),
            registry.clone(),
            handle.clone(),
        )
        .build();
        let _ = component.add_provided_interface("Bar", dummy_service(), Properties::new()).unwrap();

        let set_calls = Arc::new(AtomicUsize::new(0));
        let set_calls_cb = set_calls.clone();
        let dependency = component.new_dependency("Foo", None);
        dependency.set_required(true).unwrap();
        dependency.set_strategy(Strategy::Suspend).unwrap();
        dependency
            .set_callbacks(Callbacks { on_add: None, on_remove: None, on_set: Some(Box::new(move |_| { let _ = set_calls_cb.fetch_add(1, Ordering::SeqCst); })) })
            .unwrap();
        component.add_dependency(dependency);

        component.enable();
        registry
            .register_service_async(1, ServiceRegistration { service_name: "Foo".into(), instance: dummy_service(), properties: Properties::new() })
            .await
            .unwrap();
        wait_for(|| component.state() == State::TrackingOptional).await;
        handle.wait_for_empty_queue();
        assert_eq!(recorder.snapshot(), vec!["init", "start"]);

        let mut higher = Properties::new();
        let _ = higher.set(dm_properties::keys::SERVICE_RANKING, 10i64);
        registry
            .register_service_async(1, ServiceRegistration { service_name: "Foo".into(), instance: dummy_service(), properties: higher })
            .await
            .unwrap();

        wait_for(|| component.times_resumed() == 1).await;
        handle.wait_for_empty_queue();

        assert_eq!(recorder.snapshot(), vec!["init", "start", "stop", "start"]);
        assert_eq!(component.times_started(), 1);
        assert_eq!(set_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn s4_locking_strategy_never_suspends() {
        let event_loop = EventLoop::start();
        let handle = event_loop.handle();
        let registry: Arc<dyn ServiceRegistry> = Arc::new(InMemoryRegistry::new());
        let recorder = Arc::new(Recorder::default());

        let component = ComponentBuilder::new(
            "Comp",
            1,
            Box::new(RecordingLifecycle { recorder: recorder.clone(), fail_start: false }),
            registry.clone(),
            handle.clone(),
        )
        .build();
        let _ = component.add_provided_interface("Bar", dummy_service(), Properties::new()).unwrap();

        let set_calls = Arc::new(AtomicUsize::new(0));
        let set_calls_cb = set_calls.clone();
        let dependency = component.new_dependency("Foo", None);
        dependency.set_required(true).unwrap();
        dependency.set_strategy(Strategy::Locking).unwrap();
        dependency
            .set_callbacks(Callbacks { on_add: None, on_remove: None, on_set: Some(Box::new(move |_| { let _ = set_calls_cb.fetch_add(1, Ordering::SeqCst); })) })
            .unwrap();
        component.add_dependency(dependency);

        component.enable();
        registry
            .register_service_async(1, ServiceRegistration { service_name: "Foo".into(), instance: dummy_service(), properties: Properties::new() })
            .await
            .unwrap();
        wait_for(|| component.state() == State::TrackingOptional).await;
        handle.wait_for_empty_queue();

        let mut higher = Properties::new();
        let _ = higher.set(dm_properties::keys::SERVICE_RANKING, 10i64);
        registry
            .register_service_async(1, ServiceRegistration { service_name: "Foo".into(), instance: dummy_service(), properties: higher })
            .await
            .unwrap();

        wait_for(|| set_calls.load(Ordering::SeqCst) == 1).await;
        handle.wait_for_empty_queue();

        assert_eq!(recorder.snapshot(), vec!["init", "start"]);
        assert_eq!(component.times_resumed(), 0);
        assert!(component.is_active());
        let info = component.create_info();
        assert!(info.provided_interfaces[0].svc_id >= 0, "Bar must remain registered throughout a locking update");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn s5_required_dependency_removed_stops_before_remove_callback() {
        let event_loop = EventLoop::start();
        let handle = event_loop.handle();
        let registry: Arc<dyn ServiceRegistry> = Arc::new(InMemoryRegistry::new());
        let recorder = Arc::new(Recorder::default());

        let component = ComponentBuilder::new(
            "Comp",
            1,
            Box::new(RecordingLifecycle { recorder: recorder.clone(), fail_start: false }),
            registry.clone(),
            handle.clone(),
        )
        .build();
        let _ = component.add_provided_interface("Bar", dummy_service(), Properties::new()).unwrap();

        let order = Arc::new(Mutex::new(Vec::<&'static str>::new()));
        let order_cb = order.clone();
        let dependency = component.new_dependency("Foo", None);
        dependency.set_required(true).unwrap();
        dependency.set_strategy(Strategy::Locking).unwrap();
        dependency
            .set_callbacks(Callbacks {
                on_add: None,
                on_remove: Some(Box::new(move |_| order_cb.lock().unwrap().push("remove-callback"))),
                on_set: None,
            })
            .unwrap();
        component.add_dependency(dependency);

        component.enable();
        let id = registry
            .register_service_async(1, ServiceRegistration { service_name: "Foo".into(), instance: dummy_service(), properties: Properties::new() })
            .await
            .unwrap();
        wait_for(|| component.state() == State::TrackingOptional).await;
        handle.wait_for_empty_queue();

        registry.unregister_service(id).await.unwrap();
        wait_for(|| order.lock().unwrap().contains(&"remove-callback")).await;
        handle.wait_for_empty_queue();

        assert_eq!(recorder.snapshot(), vec!["init", "start", "stop"]);
        assert_eq!(component.state(), State::Instantiated);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn s6_failing_start_lands_component_in_inactive() {
        let event_loop = EventLoop::start();
        let handle = event_loop.handle();
        let registry: Arc<dyn ServiceRegistry> = Arc::new(InMemoryRegistry::new());
        let recorder = Arc::new(Recorder::default());

        let component = ComponentBuilder::new(
            "Comp",
            1,
            Box::new(RecordingLifecycle { recorder: recorder.clone(), fail_start: true }),
            registry.clone(),
            handle.clone(),
        )
        .build();
        let provided_id = component.add_provided_interface("Bar", dummy_service(), Properties::new()).unwrap();

        let dependency = component.new_dependency("Foo", None);
        dependency.set_required(true).unwrap();
        component.add_dependency(dependency);

        component.enable();
        registry
            .register_service_async(1, ServiceRegistration { service_name: "Foo".into(), instance: dummy_service(), properties: Properties::new() })
            .await
            .unwrap();

        wait_for(|| component.state() == State::Inactive && !component.is_enabled()).await;
        handle.wait_for_empty_queue();

        assert_eq!(recorder.snapshot(), vec!["init", "start"]);
        let info = component.create_info();
        let provided = info.provided_interfaces.iter().find(|p| p.id == provided_id).unwrap();
        assert_eq!(provided.svc_id, -1, "Bar must never have been registered");
        assert!(!component.is_enabled());
    }
}
