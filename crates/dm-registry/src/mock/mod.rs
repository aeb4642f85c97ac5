//! An in-memory, in-process [`ServiceRegistry`] used only by this workspace's
//! own tests. It supports exact-name matching plus a single `key=value`
//! filter clause — enough to drive the scenarios in the engine's test suite,
//! not a production registry.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use dm_properties::{keys, Properties, Value};
use tracing::trace;

use crate::{BoundService, Error, ServiceId, ServiceRegistration, ServiceRegistry, TrackerEvent, TrackerHandle};

struct StoredService {
    bundle_id: i64,
    service_name: String,
    instance: Arc<dyn std::any::Any + Send + Sync>,
    properties: Properties,
}

impl StoredService {
    fn bound(&self) -> BoundService {
        BoundService {
            instance: self.instance.clone(),
            properties: self.properties.clone(),
        }
    }

    fn ranking(&self) -> i64 {
        self.properties.get_value::<i64>(keys::SERVICE_RANKING, 0)
    }
}

struct Tracker {
    service_name: String,
    filter: Option<String>,
    sender: flume::Sender<TrackerEvent>,
    last_set: Option<ServiceId>,
}

#[derive(Default)]
struct Inner {
    next_service_id: ServiceId,
    next_tracker_handle: u64,
    services: HashMap<ServiceId, StoredService>,
    trackers: HashMap<TrackerHandle, Tracker>,
}

/// A reference `ServiceRegistry` implementation backed by a `Mutex`-guarded
/// in-process map. Deterministic and synchronous under the hood; the async
/// trait methods never actually yield.
#[derive(Default)]
pub struct InMemoryRegistry {
    inner: Mutex<Inner>,
}

impl InMemoryRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn matches(service_name: &str, filter: Option<&str>, candidate_name: &str, properties: &Properties) -> bool {
        if service_name != candidate_name {
            return false;
        }
        match filter {
            None => true,
            Some(expr) => match parse_filter(expr) {
                Some((key, value)) => match properties.get(&key) {
                    Some(Value::String(v)) => v == &value,
                    Some(other) => String::try_from(other.clone()).map(|v| v == value).unwrap_or(false),
                    None => false,
                },
                None => false,
            },
        }
    }

    fn highest_ranked(inner: &Inner, service_name: &str, filter: Option<&str>) -> Option<ServiceId> {
        inner
            .services
            .iter()
            .filter(|(_, svc)| Self::matches(service_name, filter, &svc.service_name, &svc.properties))
            .max_by_key(|(id, svc)| (svc.ranking(), i64::MAX - **id as i64))
            .map(|(id, _)| *id)
    }

    fn notify_set_if_changed(inner: &mut Inner, handle: TrackerHandle) {
        let Some(tracker) = inner.trackers.get_mut(&handle) else {
            return;
        };
        let new_set = Self::highest_ranked(inner, &tracker.service_name, tracker.filter.as_deref());
        if new_set == tracker.last_set {
            return;
        }
        tracker.last_set = new_set;
        let event = TrackerEvent::Set(new_set.and_then(|id| inner.services.get(&id)).map(StoredService::bound));
        let _ = tracker.sender.send(event);
    }
}

fn parse_filter(expr: &str) -> Option<(String, String)> {
    let trimmed = expr.trim().trim_start_matches('(').trim_end_matches(')');
    let (key, value) = trimmed.split_once('=')?;
    Some((key.trim().to_string(), value.trim().to_string()))
}

#[async_trait]
impl ServiceRegistry for InMemoryRegistry {
    async fn register_service_async(&self, bundle_id: i64, registration: ServiceRegistration) -> Result<ServiceId, Error> {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        let id = inner.next_service_id;
        inner.next_service_id += 1;

        let mut properties = registration.properties;
        let _ = properties.set(keys::SERVICE_ID, id);
        let _ = properties.set(keys::OBJECT_CLASS, registration.service_name.as_str());

        let service = StoredService {
            bundle_id,
            service_name: registration.service_name.clone(),
            instance: registration.instance,
            properties,
        };
        let bound = service.bound();
        trace!(bundle_id, service = %registration.service_name, service_id = id, "service registered");
        let _ = inner.services.insert(id, service);

        let affected: Vec<TrackerHandle> = inner
            .trackers
            .iter()
            .filter(|(_, t)| Self::matches(&registration.service_name, None, &t.service_name, &bound.properties) && Self::matches(&t.service_name, t.filter.as_deref(), &registration.service_name, &bound.properties))
            .map(|(handle, _)| *handle)
            .collect();

        for handle in affected {
            if let Some(tracker) = inner.trackers.get(&handle) {
                let _ = tracker.sender.send(TrackerEvent::Add(bound.clone()));
            }
            Self::notify_set_if_changed(&mut inner, handle);
        }

        Ok(id)
    }

    async fn unregister_service(&self, service_id: ServiceId) -> Result<(), Error> {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        let Some(removed) = inner.services.remove(&service_id) else {
            return Err(Error::UnknownServiceId(service_id));
        };
        let bound = removed.bound();

        let affected: Vec<TrackerHandle> = inner
            .trackers
            .iter()
            .filter(|(_, t)| Self::matches(&removed.service_name, t.filter.as_deref(), &t.service_name, &bound.properties))
            .map(|(handle, _)| *handle)
            .collect();

        for handle in affected {
            if let Some(tracker) = inner.trackers.get(&handle) {
                let _ = tracker.sender.send(TrackerEvent::Remove(bound.clone()));
            }
            Self::notify_set_if_changed(&mut inner, handle);
        }

        Ok(())
    }

    fn open_tracker(
        &self,
        _bundle_id: i64,
        service_name: &str,
        filter: Option<&str>,
    ) -> Result<(TrackerHandle, flume::Receiver<TrackerEvent>), Error> {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        let handle = TrackerHandle(inner.next_tracker_handle);
        inner.next_tracker_handle += 1;

        let (sender, receiver) = flume::unbounded();
        let _ = inner.trackers.insert(
            handle,
            Tracker {
                service_name: service_name.to_string(),
                filter: filter.map(str::to_string),
                sender: sender.clone(),
                last_set: None,
            },
        );

        let matching: Vec<BoundService> = inner
            .services
            .values()
            .filter(|svc| Self::matches(service_name, filter, &svc.service_name, &svc.properties))
            .map(StoredService::bound)
            .collect();
        for bound in matching {
            let _ = sender.send(TrackerEvent::Add(bound));
        }
        Self::notify_set_if_changed(&mut inner, handle);

        Ok((handle, receiver))
    }

    fn close_tracker(&self, handle: TrackerHandle) {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        let _ = inner.trackers.remove(&handle);
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;

    fn dummy_service() -> Arc<dyn std::any::Any + Send + Sync> {
        Arc::new(42u32)
    }

    #[tokio::test]
    async fn tracker_receives_add_for_pre_existing_service() {
        let registry = InMemoryRegistry::new();
        let id = registry
            .register_service_async(
                1,
                ServiceRegistration {
                    service_name: "Foo".into(),
                    instance: dummy_service(),
                    properties: Properties::new(),
                },
            )
            .await
            .unwrap();

        let (_handle, receiver) = registry.open_tracker(1, "Foo", None).unwrap();
        let event = receiver.recv_timeout(Duration::from_secs(1)).unwrap();
        match event {
            TrackerEvent::Add(bound) => assert_eq!(bound.properties.get_value::<u64>(keys::SERVICE_ID, 0), id),
            other => panic!("expected Add, got {other:?}"),
        }
        match receiver.recv_timeout(Duration::from_secs(1)).unwrap() {
            TrackerEvent::Set(Some(_)) => {}
            other => panic!("expected Set(Some), got {other:?}"),
        }
    }

    #[tokio::test]
    async fn higher_ranking_service_wins_the_set_event() {
        let registry = InMemoryRegistry::new();
        let (_handle, receiver) = registry.open_tracker(1, "Foo", None).unwrap();

        let mut low_props = Properties::new();
        let _ = low_props.set(keys::SERVICE_RANKING, 0i64);
        let low_id = registry
            .register_service_async(1, ServiceRegistration { service_name: "Foo".into(), instance: dummy_service(), properties: low_props })
            .await
            .unwrap();
        assert!(matches!(receiver.recv_timeout(Duration::from_secs(1)).unwrap(), TrackerEvent::Add(_)));
        match receiver.recv_timeout(Duration::from_secs(1)).unwrap() {
            TrackerEvent::Set(Some(bound)) => assert_eq!(bound.properties.get_value::<u64>(keys::SERVICE_ID, 0), low_id),
            other => panic!("expected Set(Some(low)), got {other:?}"),
        }

        let mut high_props = Properties::new();
        let _ = high_props.set(keys::SERVICE_RANKING, 10i64);
        let high_id = registry
            .register_service_async(1, ServiceRegistration { service_name: "Foo".into(), instance: dummy_service(), properties: high_props })
            .await
            .unwrap();
        assert!(matches!(receiver.recv_timeout(Duration::from_secs(1)).unwrap(), TrackerEvent::Add(_)));
        match receiver.recv_timeout(Duration::from_secs(1)).unwrap() {
            TrackerEvent::Set(Some(bound)) => assert_eq!(bound.properties.get_value::<u64>(keys::SERVICE_ID, 0), high_id),
            other => panic!("expected Set(Some(high)), got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unregister_emits_remove_and_set_none_when_last_match_gone() {
        let registry = InMemoryRegistry::new();
        let id = registry
            .register_service_async(1, ServiceRegistration { service_name: "Foo".into(), instance: dummy_service(), properties: Properties::new() })
            .await
            .unwrap();
        let (_handle, receiver) = registry.open_tracker(1, "Foo", None).unwrap();
        let _ = receiver.recv_timeout(Duration::from_secs(1)).unwrap(); // Add
        let _ = receiver.recv_timeout(Duration::from_secs(1)).unwrap(); // Set(Some)

        registry.unregister_service(id).await.unwrap();
        assert!(matches!(receiver.recv_timeout(Duration::from_secs(1)).unwrap(), TrackerEvent::Remove(_)));
        assert!(matches!(receiver.recv_timeout(Duration::from_secs(1)).unwrap(), TrackerEvent::Set(None)));
    }

    #[tokio::test]
    async fn close_tracker_ends_the_channel() {
        let registry = InMemoryRegistry::new();
        let (handle, receiver) = registry.open_tracker(1, "Foo", None).unwrap();
        registry.close_tracker(handle);
        assert!(receiver.recv_timeout(Duration::from_secs(1)).is_err());
    }

    #[tokio::test]
    async fn filter_excludes_non_matching_properties() {
        let registry = InMemoryRegistry::new();
        let mut props = Properties::new();
        let _ = props.set("color", "red");
        let _ = registry
            .register_service_async(1, ServiceRegistration { service_name: "Foo".into(), instance: dummy_service(), properties: props })
            .await
            .unwrap();

        let (_handle, receiver) = registry.open_tracker(1, "Foo", Some("(color=blue)")).unwrap();
        assert!(receiver.recv_timeout(Duration::from_millis(200)).is_err());
    }
}
