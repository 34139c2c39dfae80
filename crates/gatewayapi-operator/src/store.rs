//! Resource store abstraction over the Kubernetes API
//!
//! The reconciliation core only talks to [`ResourceStore`], so it can be
//! driven against the cluster ([`KubeStore`]) or an in-memory fake in tests.

use std::fmt::Debug;

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, Preconditions};
use kube::core::NamespaceResourceScope;
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, instrument};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} {key} not found")]
    NotFound { kind: String, key: String },
    #[error("{kind} {key} already exists")]
    AlreadyExists { kind: String, key: String },
    #[error("Conflict writing {kind} {key}")]
    Conflict { kind: String, key: String },
    #[error("Invalid object: {0}")]
    InvalidObject(String),
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Map an API error onto the store taxonomy for the given object
    pub fn from_kube(err: kube::Error, kind: &str, key: &str) -> Self {
        match &err {
            kube::Error::Api(resp) if resp.code == 404 => Self::NotFound {
                kind: kind.to_string(),
                key: key.to_string(),
            },
            kube::Error::Api(resp) if resp.code == 409 && resp.reason == "AlreadyExists" => {
                Self::AlreadyExists {
                    kind: kind.to_string(),
                    key: key.to_string(),
                }
            }
            kube::Error::Api(resp) if resp.code == 409 => Self::Conflict {
                kind: kind.to_string(),
                key: key.to_string(),
            },
            _ => Self::Kube(err),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Optimistic-concurrency failures worth re-reading and retrying
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. } | Self::AlreadyExists { .. })
    }
}

/// Namespaced resource store
///
/// This trait allows for mocking in tests while keeping the concrete
/// implementation for production use.
#[async_trait]
pub trait ResourceStore<K: Send + Sync>: Send + Sync {
    /// Fetch one object, `None` when it does not exist
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>, StoreError>;

    /// List objects across all namespaces
    async fn list(&self) -> Result<Vec<K>, StoreError>;

    /// Create a new object in its own namespace
    async fn create(&self, obj: &K) -> Result<K, StoreError>;

    /// JSON merge patch; a `metadata.resourceVersion` in the patch makes it
    /// conditional on that version
    async fn merge(&self, namespace: &str, name: &str, patch: &Value) -> Result<K, StoreError>;

    /// Server-side apply with forced ownership for `field_manager`
    async fn apply(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
        field_manager: &str,
    ) -> Result<K, StoreError>;

    /// Delete, optionally guarded by a resource-version precondition
    async fn delete(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<&str>,
    ) -> Result<(), StoreError>;
}

/// API server reachability, used by the readiness probe
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ApiHealth: Send + Sync {
    async fn check_readiness(&self) -> Result<bool, StoreError>;
}

/// [`ResourceStore`] backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn namespaced<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope>,
        K::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn kind_of<K>() -> String
where
    K: Resource<DynamicType = ()>,
{
    K::kind(&()).into_owned()
}

#[async_trait]
impl<K> ResourceStore<K> for KubeStore
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static,
{
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>, StoreError> {
        let key = format!("{namespace}/{name}");
        self.namespaced::<K>(namespace)
            .get_opt(name)
            .await
            .map_err(|e| StoreError::from_kube(e, &kind_of::<K>(), &key))
    }

    async fn list(&self) -> Result<Vec<K>, StoreError> {
        let api: Api<K> = Api::all(self.client.clone());
        let list = api.list(&ListParams::default()).await?;
        Ok(list.items)
    }

    #[instrument(skip(self, obj), fields(kind = %kind_of::<K>()))]
    async fn create(&self, obj: &K) -> Result<K, StoreError> {
        let namespace = obj
            .namespace()
            .ok_or_else(|| StoreError::InvalidObject("missing metadata.namespace".to_string()))?;
        let key = format!("{namespace}/{}", obj.name_any());
        debug!(key = %key, "Creating object");
        self.namespaced::<K>(&namespace)
            .create(&Default::default(), obj)
            .await
            .map_err(|e| StoreError::from_kube(e, &kind_of::<K>(), &key))
    }

    #[instrument(skip(self, patch), fields(kind = %kind_of::<K>()))]
    async fn merge(&self, namespace: &str, name: &str, patch: &Value) -> Result<K, StoreError> {
        let key = format!("{namespace}/{name}");
        self.namespaced::<K>(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map_err(|e| StoreError::from_kube(e, &kind_of::<K>(), &key))
    }

    #[instrument(skip(self, patch), fields(kind = %kind_of::<K>()))]
    async fn apply(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
        field_manager: &str,
    ) -> Result<K, StoreError> {
        let key = format!("{namespace}/{name}");
        let params = PatchParams::apply(field_manager).force();
        self.namespaced::<K>(namespace)
            .patch(name, &params, &Patch::Apply(patch))
            .await
            .map_err(|e| StoreError::from_kube(e, &kind_of::<K>(), &key))
    }

    #[instrument(skip(self), fields(kind = %kind_of::<K>()))]
    async fn delete(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<&str>,
    ) -> Result<(), StoreError> {
        let key = format!("{namespace}/{name}");
        let params = DeleteParams {
            preconditions: resource_version.map(|rv| Preconditions {
                resource_version: Some(rv.to_string()),
                uid: None,
            }),
            ..Default::default()
        };
        self.namespaced::<K>(namespace)
            .delete(name, &params)
            .await
            .map(|_| ())
            .map_err(|e| StoreError::from_kube(e, &kind_of::<K>(), &key))
    }
}

#[async_trait]
impl ApiHealth for KubeStore {
    async fn check_readiness(&self) -> Result<bool, StoreError> {
        let version = self.client.apiserver_version().await?;
        debug!(version = %version.git_version, "API server reachable");
        Ok(true)
    }
}
