use std::fmt::Debug;

use either::Either;
use k8s_openapi::NamespaceResourceScope;
use kube::{
    Api, Resource, ResourceExt,
    api::{DeleteParams, Patch, PatchParams, PostParams},
    client::Client as KubeClient,
};
use serde::{Serialize, de::DeserializeOwned};
use snafu::{OptionExt, ResultExt, Snafu};

use crate::ErrorKind;

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("object is missing key {key:?}"))]
    MissingObjectKey { key: &'static str },

    #[snafu(display("failed to get {kind} {name:?}"))]
    GetObject {
        source: kube::Error,
        kind: String,
        name: String,
    },

    #[snafu(display("failed to create {kind} {name:?}"))]
    CreateObject {
        source: kube::Error,
        kind: String,
        name: String,
    },

    #[snafu(display("failed to replace {kind} {name:?}"))]
    ReplaceObject {
        source: kube::Error,
        kind: String,
        name: String,
    },

    #[snafu(display("failed to patch {kind} {name:?}"))]
    PatchObject {
        source: kube::Error,
        kind: String,
        name: String,
    },

    #[snafu(display("failed to patch status of {kind} {name:?}"))]
    PatchStatus {
        source: kube::Error,
        kind: String,
        name: String,
    },

    #[snafu(display("failed to delete {kind} {name:?}"))]
    DeleteObject {
        source: kube::Error,
        kind: String,
        name: String,
    },
}

impl Error {
    fn kube_error(&self) -> Option<&kube::Error> {
        match self {
            Self::MissingObjectKey { .. } => None,
            Self::GetObject { source, .. }
            | Self::CreateObject { source, .. }
            | Self::ReplaceObject { source, .. }
            | Self::PatchObject { source, .. }
            | Self::PatchStatus { source, .. }
            | Self::DeleteObject { source, .. } => Some(source),
        }
    }

    /// Returns true if the API server rejected a create because the object already exists
    pub fn is_already_exists(&self) -> bool {
        matches!(self.kube_error(), Some(kube::Error::Api(status)) if status.reason == "AlreadyExists")
    }

    /// Returns true if the API server rejected a write because of a stale resource version
    pub fn is_conflict(&self) -> bool {
        matches!(self.kube_error(), Some(kube::Error::Api(status)) if status.code == 409)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.kube_error(), Some(kube::Error::Api(status)) if status.code == 404)
    }

    pub fn kind(&self) -> ErrorKind {
        if self.is_conflict() {
            ErrorKind::PlatformConflict
        } else {
            ErrorKind::Platform
        }
    }
}

fn kind_of<T: Resource<DynamicType = ()>>() -> String {
    T::kind(&()).into_owned()
}

/// Bound shared by every namespaced object the operator reads and writes
pub trait NamespacedObject:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Debug
    + DeserializeOwned
    + Serialize
{
}

impl<T> NamespacedObject for T where
    T: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + DeserializeOwned
        + Serialize
{
}

/// This `Client` can be used to access Kubernetes.
/// It wraps an underlying [kube::client::Client] and provides some common functionality.
#[derive(Clone)]
pub struct Client {
    client: KubeClient,
    post_params: PostParams,
    merge_patch_params: PatchParams,
    delete_params: DeleteParams,
}

impl Client {
    pub fn new(client: KubeClient, field_manager: impl Into<String>) -> Self {
        let field_manager = field_manager.into();
        Self {
            client,
            post_params: PostParams {
                field_manager: Some(field_manager.clone()),
                ..PostParams::default()
            },
            merge_patch_params: PatchParams {
                field_manager: Some(field_manager),
                ..PatchParams::default()
            },
            // Dependents of deleted Jobs (their pods) are garbage collected asynchronously
            delete_params: DeleteParams::background(),
        }
    }

    /// Returns a [kube::client::Client] that can be freely used.
    /// It does not need to be cloned before first use.
    pub fn as_kube_client(&self) -> KubeClient {
        self.client.clone()
    }

    /// Retrieves a single object, returning [`None`] if it does not exist.
    pub async fn get_opt<T>(&self, name: &str, namespace: &str) -> Result<Option<T>>
    where
        T: NamespacedObject,
    {
        self.get_namespaced_api::<T>(namespace)
            .get_opt(name)
            .await
            .with_context(|_| GetObjectSnafu {
                kind: kind_of::<T>(),
                name,
            })
    }

    /// Creates a new object in the namespace set in its metadata.
    pub async fn create<T>(&self, resource: &T) -> Result<T>
    where
        T: NamespacedObject,
    {
        let namespace = namespace_of(resource)?;
        self.get_namespaced_api::<T>(namespace)
            .create(&self.post_params, resource)
            .await
            .with_context(|_| CreateObjectSnafu {
                kind: kind_of::<T>(),
                name: resource.name_any(),
            })
    }

    /// Creates a new object, returning [`None`] if an object of the same name already exists.
    ///
    /// The existing object is left untouched.
    pub async fn create_if_missing<T>(&self, resource: &T) -> Result<Option<T>>
    where
        T: NamespacedObject,
    {
        match self.create(resource).await {
            Ok(created) => Ok(Some(created)),
            Err(err) if err.is_already_exists() => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Replaces an existing object.
    ///
    /// The resource version in the object's metadata is used as a precondition, so replacing
    /// a stale copy fails with a conflict.
    pub async fn replace<T>(&self, resource: &T) -> Result<T>
    where
        T: NamespacedObject,
    {
        let namespace = namespace_of(resource)?;
        let name = resource.name_any();
        self.get_namespaced_api::<T>(namespace)
            .replace(&name, &self.post_params, resource)
            .await
            .with_context(|_| ReplaceObjectSnafu {
                kind: kind_of::<T>(),
                name: &name,
            })
    }

    /// Patches an object using a JSON merge patch.
    /// This will fail for objects that do not exist yet.
    pub async fn merge_patch<T, P>(&self, resource: &T, patch: P) -> Result<T>
    where
        T: NamespacedObject,
        P: Debug + Serialize,
    {
        let namespace = namespace_of(resource)?;
        let name = resource.name_any();
        self.get_namespaced_api::<T>(namespace)
            .patch(&name, &self.merge_patch_params, &Patch::Merge(patch))
            .await
            .with_context(|_| PatchObjectSnafu {
                kind: kind_of::<T>(),
                name: &name,
            })
    }

    /// Merges `status` into the status subresource of an object.
    ///
    /// Fields of `status` serialized as `null` are removed from the live status.
    pub async fn merge_patch_status<T, S>(&self, resource: &T, status: &S) -> Result<T>
    where
        T: NamespacedObject,
        S: Debug + Serialize,
    {
        let namespace = namespace_of(resource)?;
        let name = resource.name_any();
        let patch = serde_json::json!({ "status": status });
        self.get_namespaced_api::<T>(namespace)
            .patch_status(&name, &self.merge_patch_params, &Patch::Merge(patch))
            .await
            .with_context(|_| PatchStatusSnafu {
                kind: kind_of::<T>(),
                name: &name,
            })
    }

    /// Deletes an object with background propagation.
    ///
    /// Returns `false` if the object was already gone.
    pub async fn delete_if_exists<T>(&self, name: &str, namespace: &str) -> Result<bool>
    where
        T: NamespacedObject,
    {
        let result = self
            .get_namespaced_api::<T>(namespace)
            .delete(name, &self.delete_params)
            .await
            .with_context(|_| DeleteObjectSnafu {
                kind: kind_of::<T>(),
                name,
            });
        match result {
            Ok(Either::Left(_) | Either::Right(_)) => Ok(true),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err),
        }
    }

    pub fn get_all_api<T>(&self) -> Api<T>
    where
        T: Resource<DynamicType = ()>,
    {
        Api::all(self.client.clone())
    }

    pub fn get_namespaced_api<T>(&self, namespace: &str) -> Api<T>
    where
        T: Resource<DynamicType = (), Scope = NamespaceResourceScope>,
    {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn namespace_of<T: Resource>(resource: &T) -> Result<&str> {
    resource
        .meta()
        .namespace
        .as_deref()
        .context(MissingObjectKeySnafu {
            key: ".metadata.namespace",
        })
}
