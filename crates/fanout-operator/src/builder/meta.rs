use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::{Resource, ResourceExt};
use snafu::OptionExt;

use super::{Error, OwnerWithoutUidSnafu};
use crate::labels;

/// A builder to build [`ObjectMeta`] objects.
///
/// Of special interest is the [`Self::ownerreference_from_resource()`] function.
/// Note: This builder only supports a single `OwnerReference`.
#[derive(Clone, Default)]
pub struct ObjectMetaBuilder {
    name: Option<String>,
    namespace: Option<String>,
    ownerreference: Option<OwnerReference>,
    labels: Option<BTreeMap<String, String>>,
    annotations: Option<BTreeMap<String, String>>,
}

impl ObjectMetaBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// This sets the name and namespace from a given resource
    pub fn name_and_namespace<T: Resource>(&mut self, resource: &T) -> &mut Self {
        self.name = Some(resource.name_any());
        self.namespace = resource.namespace();
        self
    }

    pub fn name(&mut self, name: impl Into<String>) -> &mut Self {
        self.name = Some(name.into());
        self
    }

    pub fn namespace_opt(&mut self, namespace: impl Into<Option<String>>) -> &mut Self {
        self.namespace = namespace.into();
        self
    }

    /// Makes `resource` the controlling owner, so the built object is garbage collected with it.
    pub fn ownerreference_from_resource<T: Resource<DynamicType = ()>>(
        &mut self,
        resource: &T,
    ) -> Result<&mut Self, Error> {
        self.ownerreference = Some(controller_reference(resource)?);
        Ok(self)
    }

    /// This adds a single annotation to the existing annotations.
    /// It'll override an annotation with the same key.
    pub fn with_annotation(
        &mut self,
        annotation_key: impl Into<String>,
        annotation_value: impl Into<String>,
    ) -> &mut Self {
        self.annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(annotation_key.into(), annotation_value.into());
        self
    }

    /// This adds multiple labels to the existing labels.
    /// Any existing label with a key that is contained in `labels` will be overwritten
    pub fn with_labels(&mut self, labels: BTreeMap<String, String>) -> &mut Self {
        self.labels.get_or_insert_with(BTreeMap::new).extend(labels);
        self
    }

    /// This sets the `app.kubernetes.io` labels identifying the owning `instance` and the `component`.
    pub fn with_recommended_labels(&mut self, instance: &str, component: &str) -> &mut Self {
        self.with_labels(labels::recommended_labels(instance, component))
    }

    pub fn build(&self) -> ObjectMeta {
        ObjectMeta {
            name: self.name.clone(),
            namespace: self.namespace.clone(),
            owner_references: self
                .ownerreference
                .as_ref()
                .map(|ownerreference| vec![ownerreference.clone()]),
            labels: self.labels.clone(),
            annotations: self.annotations.clone(),
            ..ObjectMeta::default()
        }
    }
}

/// Builds a controlling [`OwnerReference`] to `resource` that blocks its foreground deletion.
pub fn controller_reference<T: Resource<DynamicType = ()>>(
    resource: &T,
) -> Result<OwnerReference, Error> {
    resource
        .controller_owner_ref(&())
        .context(OwnerWithoutUidSnafu {
            name: resource.name_any(),
        })
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::Pod;

    use super::*;

    #[test]
    fn objectmeta_builder() {
        let mut pod = Pod::default();
        pod.metadata.name = Some("owner".to_string());
        pod.metadata.namespace = Some("batch".to_string());
        pod.metadata.uid = Some("c0ffee".to_string());

        let meta = ObjectMetaBuilder::new()
            .name_and_namespace(&pod)
            .name("owned")
            .ownerreference_from_resource(&pod)
            .expect("owner has a uid")
            .with_recommended_labels("owner", "item-list")
            .with_annotation("foo", "bar")
            .build();

        assert_eq!(meta.name.as_deref(), Some("owned"));
        assert_eq!(meta.namespace.as_deref(), Some("batch"));
        let owner = &meta.owner_references.expect("owner references")[0];
        assert_eq!(owner.uid, "c0ffee");
        assert_eq!(owner.kind, "Pod");
        assert_eq!(owner.controller, Some(true));
        assert_eq!(meta.labels.expect("labels")["app.kubernetes.io/instance"], "owner");
        assert_eq!(meta.annotations.expect("annotations")["foo"], "bar");
    }

    #[test]
    fn owner_without_uid() {
        let mut pod = Pod::default();
        pod.metadata.name = Some("owner".to_string());

        let err = controller_reference(&pod).expect_err("uid is required");
        assert_eq!(
            err,
            Error::OwnerWithoutUid {
                name: "owner".to_string()
            }
        );
    }
}
