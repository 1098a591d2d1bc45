//! Helpers for the finalizer that guards cleanup of the objects a fan-out object owns.
use kube::{Resource, ResourceExt};
use serde_json::json;

use crate::client::{Client, Error, NamespacedObject};

/// Where an object stands in its finalizer-guarded lifecycle.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LifecyclePhase {
    /// Not deleted, our finalizer has not been added yet.
    Initializing,

    /// Not deleted, our finalizer is in place. Owned objects may be created.
    Active,

    /// Deletion was requested and our finalizer still blocks it. Owned objects must be cleaned up.
    Terminating,

    /// Deletion was requested and our finalizer is gone. Nothing is left to do.
    Released,
}

impl LifecyclePhase {
    pub fn of<T: Resource>(resource: &T, finalizer: &str) -> Self {
        match (has_deletion_stamp(resource), has_finalizer(resource, finalizer)) {
            (false, false) => Self::Initializing,
            (false, true) => Self::Active,
            (true, true) => Self::Terminating,
            (true, false) => Self::Released,
        }
    }
}

/// Checks whether our own finalizer is in the list of finalizers for the provided object.
pub fn has_finalizer<T: Resource>(resource: &T, finalizer: &str) -> bool {
    resource.finalizers().iter().any(|f| f == finalizer)
}

/// Checks whether the provided object has a deletion timestamp set.
pub fn has_deletion_stamp<T: Resource>(resource: &T) -> bool {
    resource.meta().deletion_timestamp.is_some()
}

/// Appends `finalizer` to the finalizers of the object.
///
/// The patch is conditional on the resource version of `resource`, so a stale copy
/// fails with a conflict instead of dropping finalizers added in the meantime.
pub async fn add_finalizer<T>(client: &Client, resource: &T, finalizer: &str) -> Result<T, Error>
where
    T: NamespacedObject,
{
    let mut finalizers = resource.finalizers().to_vec();
    if !finalizers.iter().any(|f| f == finalizer) {
        finalizers.push(finalizer.to_string());
    }
    patch_finalizers(client, resource, &finalizers).await
}

/// Removes `finalizer` from the finalizers of the object.
///
/// Once the last finalizer is gone the API server completes a pending deletion.
pub async fn remove_finalizer<T>(client: &Client, resource: &T, finalizer: &str) -> Result<T, Error>
where
    T: NamespacedObject,
{
    // Strategic merge patches are not supported for custom resources, so the remaining list is written back
    let finalizers: Vec<_> = resource
        .finalizers()
        .iter()
        .filter(|f| *f != finalizer)
        .cloned()
        .collect();
    patch_finalizers(client, resource, &finalizers).await
}

async fn patch_finalizers<T>(client: &Client, resource: &T, finalizers: &[String]) -> Result<T, Error>
where
    T: NamespacedObject,
{
    let patch = json!({
        "metadata": {
            "finalizers": finalizers,
            "resourceVersion": resource.resource_version(),
        }
    });
    client.merge_patch(resource, patch).await
}
