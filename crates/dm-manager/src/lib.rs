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

//! The Dependency Manager: owns components by stable id (Design Notes §9's
//! arena pattern, avoiding the cyclic ownership a component and its own
//! dependencies would otherwise need), and exposes `add`/`remove` (sync and
//! async), bulk removal, aggregate queries, and introspection snapshots.
//!
//! Destruction never blocks on tracker callbacks: `remove`/`remove_async`
//! disable the component, then re-enqueue a destroy-check task on the event
//! loop until every dependency has fully closed its tracker — exactly
//! `celix_dmComponent_cleanupRemovedDependencies`'s repeated-pass shape,
//! generalized into an explicit loop-driven task here instead of a condvar.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use async_trait::async_trait;
use dm_component::{Component, ComponentBuilder, ComponentId, ComponentInfo, ComponentLifecycle};
use dm_dependency::Strategy;
use dm_event_loop::{EventLoopHandle, EventLoopTask};
use dm_registry::ServiceRegistry;
use serde::Deserialize;
use tracing::{error, trace, warn};
use validator::Validate;

/// All the errors a [`DependencyManager`] can report.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// No component with this id is currently managed.
    #[error("no component with id {0}")]
    UnknownComponent(ComponentId),

    /// A component with this id is already managed; ids must be unique.
    #[error("a component with id {0} is already managed")]
    DuplicateComponent(ComponentId),

    /// A [`ComponentDescriptor`] failed validation.
    #[error("component descriptor is invalid: {0}")]
    InvalidDescriptor(#[from] validator::ValidationErrors),

    /// Building the component itself failed (e.g. an invalid pinned uuid).
    #[error(transparent)]
    Component(#[from] dm_component::Error),

    /// Configuring a dependency from a descriptor failed.
    #[error(transparent)]
    Dependency(#[from] dm_dependency::Error),
}

/// Declares one of a component's service dependencies from data, mirroring
/// the teacher's `config` crate's declarative receiver/exporter sets. Plain
/// data in, `dm_dependency::Strategy` out; `dm-manager` never constructs a
/// `ServiceDependency` purely from a descriptor without an owning component.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct DependencyDescriptor {
    /// The target service name.
    #[validate(length(min = 1))]
    pub service_name: String,
    /// An optional registry filter expression.
    #[serde(default)]
    pub filter: Option<String>,
    /// Whether this dependency is required for activation. Defaults to `true`.
    #[serde(default = "default_required")]
    pub required: bool,
    /// The suspend strategy. Defaults to `suspend`.
    #[serde(default)]
    pub strategy: StrategyConfig,
}

fn default_required() -> bool {
    true
}

/// The serde-facing mirror of [`dm_dependency::Strategy`].
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyConfig {
    /// See [`Strategy::Suspend`].
    #[default]
    Suspend,
    /// See [`Strategy::Locking`].
    Locking,
}

impl From<StrategyConfig> for Strategy {
    fn from(config: StrategyConfig) -> Self {
        match config {
            StrategyConfig::Suspend => Strategy::Suspend,
            StrategyConfig::Locking => Strategy::Locking,
        }
    }
}

/// Declares a component's name, bundle, optional pinned uuid, and dependency
/// list from data (YAML via `serde_yaml`, or any other `serde` format). Does
/// not describe provided interfaces: those carry a live service instance,
/// which has no data representation, so they are always added with
/// [`Component::add_provided_interface`] after building.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct ComponentDescriptor {
    /// The component's human name.
    #[validate(length(min = 1))]
    pub name: String,
    /// The bundle that owns this component.
    pub bundle_id: i64,
    /// An optional pinned uuid; a random one is generated if absent.
    #[serde(default)]
    pub uuid: Option<String>,
    /// The component's declared service dependencies.
    #[serde(default)]
    #[validate(nested)]
    pub dependencies: Vec<DependencyDescriptor>,
}

struct CallbackTask(Box<dyn FnOnce() + Send>);

#[async_trait]
impl EventLoopTask for CallbackTask {
    async fn run(self: Box<Self>) {
        (self.0)();
    }
}

/// Re-enqueues itself on the event loop until the component it guards is
/// destroyable (disabled, `INACTIVE`, every dependency's tracker fully
/// closed), then removes it from the arena and fires `on_done` exactly once.
/// Each re-enqueue interleaves with the tracker-shutdown events already
/// queued for this component, so the loop always makes progress without a
/// fixed timeout or a condvar (Design Notes §9).
struct DestroyCheckTask {
    component: Arc<Component>,
    components: Arc<Mutex<HashMap<ComponentId, Arc<Component>>>>,
    event_loop: EventLoopHandle,
    on_done: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

#[async_trait]
impl EventLoopTask for DestroyCheckTask {
    async fn run(self: Box<Self>) {
        if self.component.is_destroyable() {
            let _ = self.components.lock().expect("dependency manager lock poisoned").remove(&self.component.id());
            trace!(component = %self.component.name(), "component destroyed");
            if let Some(on_done) = self.on_done.lock().expect("on_done lock poisoned").take() {
                on_done();
            }
            return;
        }

        let bundle_id = self.component.bundle_id();
        let next = DestroyCheckTask {
            component: self.component.clone(),
            components: self.components.clone(),
            event_loop: self.event_loop.clone(),
            on_done: Mutex::new(self.on_done.lock().expect("on_done lock poisoned").take()),
        };
        if self.event_loop.fire_generic(bundle_id, "manager-destroy-check", Box::new(next)).is_err() {
            warn!(component = %self.component.name(), "event loop closed while waiting for component to become destroyable");
        }
    }
}

/// Owns every managed component by stable id and fans bundle-scoped queries
/// out over that arena. One `DependencyManager` per framework instance is
/// the usual shape; nothing here prevents more than one.
pub struct DependencyManager {
    registry: Arc<dyn ServiceRegistry>,
    event_loop: EventLoopHandle,
    components: Arc<Mutex<HashMap<ComponentId, Arc<Component>>>>,
}

impl DependencyManager {
    /// Creates an empty manager bound to `registry` and `event_loop`.
    pub fn new(registry: Arc<dyn ServiceRegistry>, event_loop: EventLoopHandle) -> Self {
        DependencyManager { registry, event_loop, components: Arc::new(Mutex::new(HashMap::new())) }
    }

    /// The registry this manager's components publish to.
    pub fn registry(&self) -> Arc<dyn ServiceRegistry> {
        self.registry.clone()
    }

    /// The event loop every managed component is driven on.
    pub fn event_loop(&self) -> EventLoopHandle {
        self.event_loop.clone()
    }

    /// Starts building a new component bound to this manager's registry and
    /// event loop. The returned builder is not yet managed: configure
    /// provided interfaces and dependencies, call `build()`, then [`add`](Self::add)
    /// or [`add_async`](Self::add_async).
    pub fn new_component(&self, name: impl Into<String>, bundle_id: i64, lifecycle: Box<dyn ComponentLifecycle>) -> ComponentBuilder {
        ComponentBuilder::new(name, bundle_id, lifecycle, self.registry.clone(), self.event_loop.clone())
    }

    /// Builds a component from a validated [`ComponentDescriptor`], wiring up
    /// its declared dependencies. The component is not yet enabled or
    /// managed.
    pub fn build_from_descriptor(&self, descriptor: &ComponentDescriptor, lifecycle: Box<dyn ComponentLifecycle>) -> Result<Arc<Component>, Error> {
        descriptor.validate()?;

        let mut builder = ComponentBuilder::new(descriptor.name.clone(), descriptor.bundle_id, lifecycle, self.registry.clone(), self.event_loop.clone());
        if let Some(uuid) = &descriptor.uuid {
            builder = builder.with_uuid(uuid)?;
        }
        let component = builder.build();

        for dep in &descriptor.dependencies {
            let dependency = component.new_dependency(dep.service_name.clone(), dep.filter.clone());
            dependency.set_required(dep.required)?;
            dependency.set_strategy(dep.strategy.into())?;
            component.add_dependency(dependency);
        }

        Ok(component)
    }

    fn insert(&self, component: Arc<Component>) -> Result<(), Error> {
        let mut components = self.components.lock().expect("dependency manager lock poisoned");
        if components.contains_key(&component.id()) {
            return Err(Error::DuplicateComponent(component.id()));
        }
        let _ = components.insert(component.id(), component);
        Ok(())
    }

    /// Registers `component` and enables it, blocking the caller until the
    /// enable operation has drained from the event loop. Calling this from
    /// the event loop thread itself is a misuse (`spec.md` §7): it is
    /// logged at `ERROR` and degrades to the async path rather than
    /// deadlocking, since [`dm_event_loop::EventLoopHandle::wait_for_empty_queue`]
    /// already refuses to block in that case.
    pub fn add(&self, component: Arc<Component>) -> Result<(), Error> {
        self.insert(component.clone())?;
        if self.event_loop.is_current_thread_event_loop() {
            error!(component = %component.name(), "add() called synchronously from the event loop thread; degrading to the async path");
        }
        component.enable();
        self.event_loop.wait_for_empty_queue();
        Ok(())
    }

    /// Registers `component`, enables it, and returns immediately. `on_done`,
    /// if given, is posted to the loop once the enable operation itself has
    /// been processed (not once the component has necessarily reached
    /// `TRACKING_OPTIONAL`, which depends on dependency resolution that may
    /// still be pending).
    pub fn add_async(&self, component: Arc<Component>, on_done: Option<Box<dyn FnOnce() + Send>>) -> Result<(), Error> {
        self.insert(component.clone())?;
        let bundle_id = component.bundle_id();
        component.enable();
        if let Some(on_done) = on_done {
            if self.event_loop.fire_generic(bundle_id, "manager-add-done", Box::new(CallbackTask(on_done))).is_err() {
                warn!(component = %component.name(), "event loop closed before add's on_done could fire");
            }
        }
        Ok(())
    }

    /// Disables and destroys the component identified by `component_id`,
    /// blocking the caller until destruction has completed (invariant 4:
    /// `enabled=false ∧ state=INACTIVE ∧` every dependency `disabled`).
    /// Misuse from the event loop thread degrades to the async path without
    /// blocking, per `spec.md` §7.
    pub fn remove(&self, component_id: ComponentId) -> Result<(), Error> {
        let (done_tx, done_rx) = flume::bounded(1);
        self.remove_async(component_id, Some(Box::new(move || drop(done_tx.send(())))))?;

        if self.event_loop.is_current_thread_event_loop() {
            error!(component_id = %component_id, "remove() called synchronously from the event loop thread; degrading to the async path");
            return Ok(());
        }
        let _ = done_rx.recv();
        Ok(())
    }

    /// Disables and destroys the component identified by `component_id`,
    /// returning immediately. `on_done` fires exactly once, after the
    /// component has been removed from the arena.
    pub fn remove_async(&self, component_id: ComponentId, on_done: Option<Box<dyn FnOnce() + Send>>) -> Result<(), Error> {
        let component = {
            let components = self.components.lock().expect("dependency manager lock poisoned");
            components.get(&component_id).cloned().ok_or(Error::UnknownComponent(component_id))?
        };
        let bundle_id = component.bundle_id();
        component.disable();

        let check = DestroyCheckTask { component, components: self.components.clone(), event_loop: self.event_loop.clone(), on_done: Mutex::new(on_done) };
        if self.event_loop.fire_generic(bundle_id, "manager-destroy-check", Box::new(check)).is_err() {
            warn!(component_id = %component_id, "event loop closed before component destruction could be confirmed");
        }
        Ok(())
    }

    fn ids_for_bundle(&self, bundle_id: Option<i64>) -> Vec<ComponentId> {
        self.components
            .lock()
            .expect("dependency manager lock poisoned")
            .values()
            .filter(|c| bundle_id.map_or(true, |b| c.bundle_id() == b))
            .map(|c| c.id())
            .collect()
    }

    /// Removes every managed component, optionally scoped to one bundle,
    /// blocking until all of them have been destroyed.
    pub fn remove_all(&self, bundle_id: Option<i64>) -> Result<(), Error> {
        for id in self.ids_for_bundle(bundle_id) {
            self.remove(id)?;
        }
        Ok(())
    }

    /// Removes every managed component, optionally scoped to one bundle,
    /// returning immediately. `on_done` fires exactly once, after every
    /// targeted component has been destroyed.
    pub fn remove_all_async(&self, bundle_id: Option<i64>, on_done: Option<Box<dyn FnOnce() + Send>>) -> Result<(), Error> {
        let ids = self.ids_for_bundle(bundle_id);
        if ids.is_empty() {
            if let Some(on_done) = on_done {
                on_done();
            }
            return Ok(());
        }

        let remaining = Arc::new(AtomicUsize::new(ids.len()));
        let on_done = on_done.map(|callback| Arc::new(Mutex::new(Some(callback))));
        for id in ids {
            let remaining = remaining.clone();
            let on_done = on_done.clone();
            self.remove_async(
                id,
                Some(Box::new(move || {
                    if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                        if let Some(on_done) = on_done {
                            if let Some(callback) = on_done.lock().expect("on_done lock poisoned").take() {
                                callback();
                            }
                        }
                    }
                })),
            )?;
        }
        Ok(())
    }

    /// `true` iff every managed component (optionally scoped to one bundle)
    /// is currently `TRACKING_OPTIONAL`.
    pub fn all_components_active(&self, bundle_id: Option<i64>) -> bool {
        self.components
            .lock()
            .expect("dependency manager lock poisoned")
            .values()
            .filter(|c| bundle_id.map_or(true, |b| c.bundle_id() == b))
            .all(|c| c.is_active())
    }

    /// A deep introspection snapshot of every component owned by `bundle_id`.
    pub fn create_info(&self, bundle_id: i64) -> Vec<ComponentInfo> {
        self.components.lock().expect("dependency manager lock poisoned").values().filter(|c| c.bundle_id() == bundle_id).map(|c| c.create_info()).collect()
    }

    /// A deep introspection snapshot of every managed component, across all
    /// bundles.
    pub fn create_infos(&self) -> Vec<ComponentInfo> {
        self.components.lock().expect("dependency manager lock poisoned").values().map(|c| c.create_info()).collect()
    }

    /// The number of managed components, optionally scoped to one bundle.
    pub fn nr_of_components(&self, bundle_id: Option<i64>) -> usize {
        self.components
            .lock()
            .expect("dependency manager lock poisoned")
            .values()
            .filter(|c| bundle_id.map_or(true, |b| c.bundle_id() == b))
            .count()
    }

    /// `true` iff a component with this id is currently managed.
    pub fn has_component(&self, component_id: ComponentId) -> bool {
        self.components.lock().expect("dependency manager lock poisoned").contains_key(&component_id)
    }
}
