use crate::ResourceId;
use ferry_controller_core::Trigger;
use ferry_controller_k8s_api::{Labels, ResourceExt};
use parking_lot::RwLock;
use std::{collections::BTreeMap, sync::Arc};

/// Observes changes to a [`Cache`].
///
/// Handlers run while the cache is locked for writing and must not read the
/// cache they observe.
pub trait EventHandler<T>: Send + Sync {
    fn on_add(&self, _obj: &T) {}
    fn on_update(&self, _old: &T, _new: &T) {}
    fn on_delete(&self, _obj: &T) {}
}

/// A watch-fed, namespaced index of Kubernetes objects.
pub struct Cache<T> {
    objects: BTreeMap<ResourceId, T>,
    handlers: Vec<Arc<dyn EventHandler<T>>>,
}

pub type SharedCache<T> = Arc<RwLock<Cache<T>>>;

// === impl Cache ===

impl<T> Default for Cache<T> {
    fn default() -> Self {
        Self {
            objects: BTreeMap::new(),
            handlers: Vec::new(),
        }
    }
}

impl<T> std::fmt::Debug for Cache<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("objects", &self.objects.len())
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

impl<T: Clone> Cache<T> {
    pub fn shared(self) -> SharedCache<T> {
        Arc::new(RwLock::new(self))
    }

    pub fn with_handler(mut self, handler: impl EventHandler<T> + 'static) -> Self {
        self.handlers.push(Arc::new(handler));
        self
    }

    pub fn get(&self, namespace: &str, name: &str) -> Option<T> {
        self.objects
            .get(&ResourceId::new(namespace, name))
            .cloned()
    }

    /// Lists every object, ordered by namespace and name.
    pub fn list(&self) -> Vec<T> {
        self.objects.values().cloned().collect()
    }

    pub fn list_namespaced(&self, namespace: &str) -> Vec<T> {
        self.objects
            .iter()
            .filter(|(id, _)| id.namespace == namespace)
            .map(|(_, obj)| obj.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

impl<T> kubert::index::IndexNamespacedResource<T> for Cache<T>
where
    T: ResourceExt + Clone + PartialEq,
{
    fn apply(&mut self, obj: T) {
        let namespace = obj.namespace().unwrap_or_default();
        let id = ResourceId::new(namespace, obj.name_unchecked());
        match self.objects.insert(id, obj.clone()) {
            None => {
                for handler in &self.handlers {
                    handler.on_add(&obj);
                }
            }
            Some(old) if old != obj => {
                for handler in &self.handlers {
                    handler.on_update(&old, &obj);
                }
            }
            Some(_) => {}
        }
    }

    fn delete(&mut self, namespace: String, name: String) {
        if let Some(old) = self.objects.remove(&ResourceId::new(namespace, name)) {
            for handler in &self.handlers {
                handler.on_delete(&old);
            }
        }
    }
}

// === impl Trigger ===

impl<T> EventHandler<T> for Trigger {
    fn on_add(&self, _: &T) {
        self.request();
    }

    fn on_update(&self, _: &T, _: &T) {
        self.request();
    }

    fn on_delete(&self, _: &T) {
        self.request();
    }
}

/// Only forwards events for objects labelled as managed by ferry.
#[derive(Clone, Debug)]
pub struct ManagedOnly<H>(pub H);

impl<T: ResourceExt, H: EventHandler<T>> EventHandler<T> for ManagedOnly<H> {
    fn on_add(&self, obj: &T) {
        if is_managed(obj) {
            self.0.on_add(obj);
        }
    }

    fn on_update(&self, old: &T, new: &T) {
        if is_managed(old) || is_managed(new) {
            self.0.on_update(old, new);
        }
    }

    fn on_delete(&self, obj: &T) {
        if is_managed(obj) {
            self.0.on_delete(obj);
        }
    }
}

fn is_managed<T: ResourceExt>(obj: &T) -> bool {
    Labels::from(obj.labels().clone()).is_managed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_controller_k8s_api::{labels, ObjectMeta, Service};
    use kubert::index::IndexNamespacedResource;
    use maplit::btreemap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counts {
        add: AtomicUsize,
        update: AtomicUsize,
        delete: AtomicUsize,
    }

    impl EventHandler<Service> for Arc<Counts> {
        fn on_add(&self, _: &Service) {
            self.add.fetch_add(1, Ordering::SeqCst);
        }
        fn on_update(&self, _: &Service, _: &Service) {
            self.update.fetch_add(1, Ordering::SeqCst);
        }
        fn on_delete(&self, _: &Service) {
            self.delete.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn svc(ns: &str, name: &str, labels: labels::Map) -> Service {
        Service {
            metadata: ObjectMeta {
                namespace: Some(ns.to_string()),
                name: Some(name.to_string()),
                labels: Some(labels),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn notifies_on_changes_only() {
        let counts = Arc::new(Counts::default());
        let mut cache = Cache::default().with_handler(counts.clone());

        cache.apply(svc("default", "app-1", Default::default()));
        cache.apply(svc("default", "app-1", Default::default()));
        cache.apply(svc(
            "default",
            "app-1",
            btreemap! { "app".to_string() => "app-1".to_string() },
        ));
        cache.delete("default".to_string(), "app-1".to_string());
        cache.delete("default".to_string(), "app-1".to_string());

        assert_eq!(counts.add.load(Ordering::SeqCst), 1);
        assert_eq!(counts.update.load(Ordering::SeqCst), 1);
        assert_eq!(counts.delete.load(Ordering::SeqCst), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn lists_in_order() {
        let mut cache = Cache::<Service>::default();
        cache.apply(svc("test", "app-1", Default::default()));
        cache.apply(svc("default", "app-2", Default::default()));
        cache.apply(svc("default", "app-1", Default::default()));

        let names = cache
            .list()
            .iter()
            .map(|s| format!("{}/{}", s.namespace().unwrap(), s.name_unchecked()))
            .collect::<Vec<_>>();
        assert_eq!(names, ["default/app-1", "default/app-2", "test/app-1"]);
        assert_eq!(cache.list_namespaced("test").len(), 1);
        assert!(cache.get("default", "app-2").is_some());
        assert!(cache.get("default", "app-3").is_none());
    }

    #[test]
    fn managed_only_filters() {
        let counts = Arc::new(Counts::default());
        let mut cache = Cache::default().with_handler(ManagedOnly(counts.clone()));

        cache.apply(svc("default", "app-1", Default::default()));
        cache.apply(svc(
            "default",
            "app-2",
            btreemap! { labels::MANAGED_BY.to_string() => labels::MANAGED_BY_FERRY.to_string() },
        ));

        assert_eq!(counts.add.load(Ordering::SeqCst), 1);
    }
}
