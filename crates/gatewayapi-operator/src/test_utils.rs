//! In-memory resource store and object builders for unit tests

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::config::{annotations, gateway, OperatorConfig};
use crate::controllers::retry::ConflictRetry;
use crate::listener::https_listener;
use crate::resources::{
    Gateway, GatewayInfrastructure, GatewaySpec, HTTPRoute, HTTPRouteSpec, Listener,
    ParentReference,
};
use crate::store::{ResourceStore, StoreError};

const DELETION_TIMESTAMP: &str = "2024-01-01T00:00:00Z";

/// Config with no pause between conflict retries
pub fn test_config() -> OperatorConfig {
    OperatorConfig {
        conflict_retry: ConflictRetry::new(5, Duration::ZERO),
        ..OperatorConfig::default()
    }
}

/// A mutating call recorded by [`MemoryStore`]
#[derive(Clone, Debug, PartialEq)]
pub enum Write {
    Create {
        key: String,
    },
    Merge {
        key: String,
        patch: Value,
    },
    Apply {
        key: String,
        patch: Value,
        field_manager: String,
    },
    Delete {
        key: String,
        resource_version: Option<String>,
    },
}

struct Inner<K> {
    objects: BTreeMap<(String, String), K>,
    next_version: u64,
    writes: Vec<Write>,
    pending_conflicts: u32,
    fail_create: bool,
    vanish_on_merge: bool,
}

/// Resource store emulating API server semantics: resource versions,
/// conditional merge patches, finalizer-blocked deletion and non-pruning
/// apply
pub struct MemoryStore<K> {
    inner: Mutex<Inner<K>>,
}

impl<K> Default for MemoryStore<K> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner {
                objects: BTreeMap::new(),
                next_version: 1,
                writes: Vec::new(),
                pending_conflicts: 0,
                fail_create: false,
                vanish_on_merge: false,
            }),
        }
    }
}

fn key_of(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

/// RFC 7386 JSON merge patch
fn merge_json(target: &mut Value, patch: &Value) {
    let Value::Object(patch) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(target) = target {
        for (k, v) in patch {
            if v.is_null() {
                target.remove(k);
            } else {
                merge_json(target.entry(k.clone()).or_insert(Value::Null), v);
            }
        }
    }
}

/// Server-side apply as seen by an applier that does not own the existing
/// list items: maps merge, list-map items keyed by `name` are upserted and
/// items missing from the body are kept.
fn apply_json(target: &mut Value, applied: &Value) {
    match (target, applied) {
        (Value::Object(target), Value::Object(applied)) => {
            for (k, v) in applied {
                match target.get_mut(k) {
                    Some(existing) => apply_json(existing, v),
                    None => {
                        target.insert(k.clone(), v.clone());
                    }
                }
            }
        }
        (Value::Array(target), Value::Array(applied)) => {
            for item in applied {
                let slot = match item.get("name") {
                    Some(name) => target.iter().position(|t| t.get("name") == Some(name)),
                    None => target.iter().position(|t| t == item),
                };
                match slot {
                    Some(i) => target[i] = item.clone(),
                    None => target.push(item.clone()),
                }
            }
        }
        (target, applied) => *target = applied.clone(),
    }
}

impl<K> MemoryStore<K>
where
    K: Resource<DynamicType = ()> + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    fn kind() -> String {
        K::kind(&()).into_owned()
    }

    fn stamp(inner: &mut Inner<K>, obj: &mut K) {
        obj.meta_mut().resource_version = Some(inner.next_version.to_string());
        inner.next_version += 1;
    }

    /// Seed an object without recording a write
    pub fn insert(&self, mut obj: K) -> K {
        let mut inner = self.inner.lock().unwrap();
        Self::stamp(&mut inner, &mut obj);
        let id = (obj.namespace().unwrap_or_default(), obj.name_any());
        inner.objects.insert(id, obj.clone());
        obj
    }

    pub fn object(&self, namespace: &str, name: &str) -> Option<K> {
        let inner = self.inner.lock().unwrap();
        inner
            .objects
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn writes(&self) -> Vec<Write> {
        self.inner.lock().unwrap().writes.clone()
    }

    pub fn clear_writes(&self) {
        self.inner.lock().unwrap().writes.clear();
    }

    /// Make the next `n` merge patches fail with a conflict
    pub fn queue_conflicts(&self, n: u32) {
        self.inner.lock().unwrap().pending_conflicts = n;
    }

    /// Make the next create fail as if another writer won the race
    pub fn fail_next_create(&self) {
        self.inner.lock().unwrap().fail_create = true;
    }

    /// Remove the object just before the next merge patch lands
    pub fn vanish_before_next_merge(&self) {
        self.inner.lock().unwrap().vanish_on_merge = true;
    }

    /// Persist `value` as the new state of `id` with a fresh version.
    /// Objects that are deleting with no finalizers left are removed.
    fn write_value(
        inner: &mut Inner<K>,
        id: (String, String),
        value: Value,
    ) -> Result<K, StoreError> {
        let mut updated: K = serde_json::from_value(value)?;
        Self::stamp(inner, &mut updated);

        let released = updated.meta().deletion_timestamp.is_some()
            && updated.finalizers().is_empty();
        if released {
            inner.objects.remove(&id);
        } else {
            inner.objects.insert(id, updated.clone());
        }
        Ok(updated)
    }
}

#[async_trait]
impl<K> ResourceStore<K> for MemoryStore<K>
where
    K: Resource<DynamicType = ()> + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>, StoreError> {
        Ok(self.object(namespace, name))
    }

    async fn list(&self) -> Result<Vec<K>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.objects.values().cloned().collect())
    }

    async fn create(&self, obj: &K) -> Result<K, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let namespace = obj.namespace().unwrap_or_default();
        let name = obj.name_any();
        let key = key_of(&namespace, &name);
        let id = (namespace, name);

        if std::mem::take(&mut inner.fail_create) || inner.objects.contains_key(&id) {
            return Err(StoreError::AlreadyExists {
                kind: Self::kind(),
                key,
            });
        }

        let mut created = obj.clone();
        Self::stamp(&mut inner, &mut created);
        inner.objects.insert(id, created.clone());
        inner.writes.push(Write::Create { key });
        Ok(created)
    }

    async fn merge(&self, namespace: &str, name: &str, patch: &Value) -> Result<K, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let key = key_of(namespace, name);
        let id = (namespace.to_string(), name.to_string());

        if inner.pending_conflicts > 0 {
            inner.pending_conflicts -= 1;
            return Err(StoreError::Conflict {
                kind: Self::kind(),
                key,
            });
        }

        if std::mem::take(&mut inner.vanish_on_merge) {
            inner.objects.remove(&id);
        }

        let current = inner.objects.get(&id).cloned().ok_or(StoreError::NotFound {
            kind: Self::kind(),
            key: key.clone(),
        })?;

        if let Some(expected) = patch["metadata"]["resourceVersion"].as_str() {
            if current.meta().resource_version.as_deref() != Some(expected) {
                return Err(StoreError::Conflict {
                    kind: Self::kind(),
                    key,
                });
            }
        }

        let mut value = serde_json::to_value(&current)?;
        merge_json(&mut value, patch);
        let updated = Self::write_value(&mut inner, id, value)?;
        inner.writes.push(Write::Merge {
            key,
            patch: patch.clone(),
        });
        Ok(updated)
    }

    async fn apply(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
        field_manager: &str,
    ) -> Result<K, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let key = key_of(namespace, name);
        let id = (namespace.to_string(), name.to_string());

        let updated = match inner.objects.get(&id).cloned() {
            Some(current) => {
                let mut value = serde_json::to_value(&current)?;
                apply_json(&mut value, patch);
                Self::write_value(&mut inner, id, value)?
            }
            None => {
                let mut created: K = serde_json::from_value(patch.clone())?;
                Self::stamp(&mut inner, &mut created);
                inner.objects.insert(id, created.clone());
                created
            }
        };

        inner.writes.push(Write::Apply {
            key,
            patch: patch.clone(),
            field_manager: field_manager.to_string(),
        });
        Ok(updated)
    }

    async fn delete(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let key = key_of(namespace, name);
        let id = (namespace.to_string(), name.to_string());

        let current = inner.objects.get(&id).cloned().ok_or(StoreError::NotFound {
            kind: Self::kind(),
            key: key.clone(),
        })?;

        if let Some(expected) = resource_version {
            if current.meta().resource_version.as_deref() != Some(expected) {
                return Err(StoreError::Conflict {
                    kind: Self::kind(),
                    key,
                });
            }
        }

        if current.finalizers().is_empty() {
            inner.objects.remove(&id);
        } else if current.meta().deletion_timestamp.is_none() {
            let mut value = serde_json::to_value(&current)?;
            value["metadata"]["deletionTimestamp"] = json!(DELETION_TIMESTAMP);
            Self::write_value(&mut inner, id, value)?;
        }

        inner.writes.push(Write::Delete {
            key,
            resource_version: resource_version.map(String::from),
        });
        Ok(())
    }
}

/// Builder for HTTPRoute fixtures
pub struct RouteBuilder {
    namespace: String,
    name: String,
    annotations: BTreeMap<String, String>,
    parents: Vec<ParentReference>,
    hostnames: Vec<String>,
    finalizers: Vec<String>,
    deleting: bool,
}

impl RouteBuilder {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
            annotations: BTreeMap::new(),
            parents: Vec::new(),
            hostnames: Vec::new(),
            finalizers: Vec::new(),
            deleting: false,
        }
    }

    pub fn annotation(mut self, key: &str, value: &str) -> Self {
        self.annotations.insert(key.to_string(), value.to_string());
        self
    }

    pub fn enabled(self) -> Self {
        self.annotation(annotations::ENABLED, "true")
    }

    pub fn previous_gateway(self, reference: &str) -> Self {
        self.annotation(annotations::PREVIOUS_GATEWAY, reference)
    }

    pub fn parent(mut self, namespace: Option<&str>, name: &str) -> Self {
        self.parents.push(ParentReference {
            namespace: namespace.map(String::from),
            name: name.to_string(),
            ..Default::default()
        });
        self
    }

    pub fn hostnames(mut self, hostnames: &[&str]) -> Self {
        self.hostnames = hostnames.iter().map(|h| h.to_string()).collect();
        self
    }

    pub fn finalizer(mut self, finalizer: &str) -> Self {
        self.finalizers.push(finalizer.to_string());
        self
    }

    pub fn deleting(mut self) -> Self {
        self.deleting = true;
        self
    }

    pub fn build(self) -> HTTPRoute {
        let mut route = HTTPRoute::new(
            &self.name,
            HTTPRouteSpec {
                parent_refs: self.parents,
                hostnames: self.hostnames,
            },
        );
        route.metadata.namespace = Some(self.namespace);
        if !self.annotations.is_empty() {
            route.metadata.annotations = Some(self.annotations);
        }
        if !self.finalizers.is_empty() {
            route.metadata.finalizers = Some(self.finalizers);
        }
        if self.deleting {
            let mut value = serde_json::to_value(&route).unwrap();
            value["metadata"]["deletionTimestamp"] = json!(DELETION_TIMESTAMP);
            route = serde_json::from_value(value).unwrap();
        }
        route
    }
}

/// Builder for Gateway fixtures
pub struct GatewayBuilder {
    namespace: String,
    name: String,
    class: String,
    issuer: Option<String>,
    zone: Option<String>,
    listeners: Vec<Listener>,
}

impl GatewayBuilder {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
            class: "eg".to_string(),
            issuer: None,
            zone: None,
            listeners: Vec::new(),
        }
    }

    pub fn class(mut self, class: &str) -> Self {
        self.class = class.to_string();
        self
    }

    pub fn issuer(mut self, issuer: &str) -> Self {
        self.issuer = Some(issuer.to_string());
        self
    }

    pub fn zone(mut self, zone: &str) -> Self {
        self.zone = Some(zone.to_string());
        self
    }

    pub fn listener(mut self, hostname: &str) -> Self {
        self.listeners.push(https_listener(hostname, &self.namespace));
        self
    }

    pub fn build(self) -> Gateway {
        let mut gw = Gateway::new(
            &self.name,
            GatewaySpec {
                gateway_class_name: self.class,
                listeners: self.listeners,
                infrastructure: self.zone.map(|zone| GatewayInfrastructure {
                    annotations: BTreeMap::from([(gateway::ZONE_ANNOTATION.to_string(), zone)]),
                }),
            },
        );
        gw.metadata.namespace = Some(self.namespace);
        gw.metadata.annotations = self
            .issuer
            .map(|issuer| BTreeMap::from([(gateway::ISSUER_ANNOTATION.to_string(), issuer)]));
        gw
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FINALIZER;

    #[test]
    fn test_merge_json() {
        let mut target = json!({"a": {"b": 1, "c": [1, 2]}, "d": "x"});
        merge_json(&mut target, &json!({"a": {"b": null, "c": [3]}, "e": true}));
        assert_eq!(target, json!({"a": {"c": [3]}, "d": "x", "e": true}));
    }

    #[test]
    fn test_apply_json_keeps_unlisted_items() {
        let mut target = json!({"spec": {"listeners": [
            {"name": "a", "port": 443},
            {"name": "b", "port": 443},
        ]}});
        apply_json(
            &mut target,
            &json!({"spec": {"listeners": [{"name": "b", "port": 8443}, {"name": "c"}]}}),
        );
        assert_eq!(
            target,
            json!({"spec": {"listeners": [
                {"name": "a", "port": 443},
                {"name": "b", "port": 8443},
                {"name": "c"},
            ]}})
        );
    }

    #[tokio::test]
    async fn test_vanish_before_merge() {
        let store = MemoryStore::<HTTPRoute>::new();
        store.insert(RouteBuilder::new("apps", "web").build());
        store.vanish_before_next_merge();

        let patch = json!({"metadata": {"labels": {"a": "b"}}});
        assert!(store.merge("apps", "web", &patch).await.unwrap_err().is_not_found());
        assert!(store.object("apps", "web").is_none());
        assert!(store.writes().is_empty());
    }

    #[tokio::test]
    async fn test_merge_checks_resource_version() {
        let store = MemoryStore::<HTTPRoute>::new();
        let route = store.insert(RouteBuilder::new("apps", "web").build());
        let rv = route.resource_version().unwrap();

        let stale = json!({"metadata": {"resourceVersion": "999", "labels": {"a": "b"}}});
        assert!(store.merge("apps", "web", &stale).await.unwrap_err().is_conflict());

        let fresh = json!({"metadata": {"resourceVersion": rv.clone(), "labels": {"a": "b"}}});
        let updated = store.merge("apps", "web", &fresh).await.unwrap();
        assert_ne!(updated.resource_version(), Some(rv));
        assert_eq!(updated.labels().get("a").map(String::as_str), Some("b"));
    }

    #[tokio::test]
    async fn test_delete_waits_for_finalizers() {
        let store = MemoryStore::<HTTPRoute>::new();
        store.insert(RouteBuilder::new("apps", "web").finalizer(FINALIZER).build());

        store.delete("apps", "web", None).await.unwrap();
        let route = store.object("apps", "web").unwrap();
        assert!(route.metadata.deletion_timestamp.is_some());

        store
            .merge("apps", "web", &json!({"metadata": {"finalizers": []}}))
            .await
            .unwrap();
        assert!(store.object("apps", "web").is_none());
    }

    #[tokio::test]
    async fn test_queued_conflicts() {
        let store = MemoryStore::<HTTPRoute>::new();
        store.insert(RouteBuilder::new("apps", "web").build());
        store.queue_conflicts(1);

        let patch = json!({"metadata": {"labels": {"a": "b"}}});
        assert!(store.merge("apps", "web", &patch).await.unwrap_err().is_conflict());
        assert!(store.merge("apps", "web", &patch).await.is_ok());
        assert_eq!(store.writes().len(), 1);
    }
}
