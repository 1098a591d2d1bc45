use std::fmt;

use k8s_openapi::{
    api::core::v1::{
        ConfigMapVolumeSource, Container, EmptyDirVolumeSource, EnvVar, EnvVarSource,
        ObjectFieldSelector, PodSpec, PodTemplateSpec, ResourceRequirements, Volume, VolumeMount,
    },
    apimachinery::pkg::apis::meta::v1::ObjectMeta,
};

/// Pod fields that can be pushed down into containers as environment variables.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum FieldPathEnvVar {
    /// The completion index the Job controller assigns to pods of Indexed Jobs
    JobCompletionIndex,
}

impl fmt::Display for FieldPathEnvVar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::JobCompletionIndex => write!(
                f,
                "metadata.annotations['batch.kubernetes.io/job-completion-index']"
            ),
        }
    }
}

/// A builder to build [`Container`] objects.
#[derive(Clone, Default)]
pub struct ContainerBuilder {
    command: Option<Vec<String>>,
    env: Option<Vec<EnvVar>>,
    image: Option<String>,
    name: String,
    resources: Option<ResourceRequirements>,
    volume_mounts: Option<Vec<VolumeMount>>,
}

impl ContainerBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    pub fn image(&mut self, image: impl Into<String>) -> &mut Self {
        self.image = Some(image.into());
        self
    }

    pub fn add_env_var(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.env.get_or_insert_with(Vec::new).push(EnvVar {
            name: name.into(),
            value: Some(value.into()),
            ..EnvVar::default()
        });
        self
    }

    /// Used for pushing down attributes like the Pod's completion index into the containers.
    pub fn add_env_var_from_field_path(
        &mut self,
        name: impl Into<String>,
        field_path: &FieldPathEnvVar,
    ) -> &mut Self {
        self.env.get_or_insert_with(Vec::new).push(EnvVar {
            name: name.into(),
            value_from: Some(EnvVarSource {
                field_ref: Some(ObjectFieldSelector {
                    field_path: field_path.to_string(),
                    ..ObjectFieldSelector::default()
                }),
                ..EnvVarSource::default()
            }),
            ..EnvVar::default()
        });
        self
    }

    pub fn command(&mut self, command: Vec<String>) -> &mut Self {
        self.command = Some(command);
        self
    }

    pub fn resources_opt(&mut self, resources: Option<ResourceRequirements>) -> &mut Self {
        self.resources = resources;
        self
    }

    pub fn add_volume_mount(
        &mut self,
        name: impl Into<String>,
        path: impl Into<String>,
        read_only: bool,
    ) -> &mut Self {
        self.volume_mounts
            .get_or_insert_with(Vec::new)
            .push(VolumeMount {
                name: name.into(),
                mount_path: path.into(),
                read_only: read_only.then_some(true),
                ..VolumeMount::default()
            });
        self
    }

    pub fn build(&self) -> Container {
        Container {
            command: self.command.clone(),
            env: self.env.clone(),
            image: self.image.clone(),
            name: self.name.clone(),
            resources: self.resources.clone(),
            volume_mounts: self.volume_mounts.clone(),
            ..Container::default()
        }
    }
}

/// A builder to build the [`PodTemplateSpec`] of Jobs and CronJobs.
#[derive(Clone, Default)]
pub struct PodTemplateBuilder {
    metadata: Option<ObjectMeta>,
    init_containers: Vec<Container>,
    containers: Vec<Container>,
    volumes: Vec<Volume>,
    restart_policy: Option<String>,
}

impl PodTemplateBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn metadata(&mut self, metadata: impl Into<ObjectMeta>) -> &mut Self {
        self.metadata = Some(metadata.into());
        self
    }

    pub fn add_init_container(&mut self, container: Container) -> &mut Self {
        self.init_containers.push(container);
        self
    }

    pub fn add_container(&mut self, container: Container) -> &mut Self {
        self.containers.push(container);
        self
    }

    pub fn add_volume(&mut self, volume: Volume) -> &mut Self {
        self.volumes.push(volume);
        self
    }

    pub fn restart_policy(&mut self, restart_policy: impl Into<String>) -> &mut Self {
        self.restart_policy = Some(restart_policy.into());
        self
    }

    pub fn build(&self) -> PodTemplateSpec {
        fn non_empty<T: Clone>(list: &Vec<T>) -> Option<Vec<T>> {
            (!list.is_empty()).then(|| list.clone())
        }
        PodTemplateSpec {
            metadata: self.metadata.clone(),
            spec: Some(PodSpec {
                init_containers: non_empty(&self.init_containers),
                containers: self.containers.clone(),
                volumes: non_empty(&self.volumes),
                restart_policy: self.restart_policy.clone(),
                ..PodSpec::default()
            }),
        }
    }
}

/// A volume projecting the ConfigMap `config_map_name`.
pub fn config_map_volume(name: impl Into<String>, config_map_name: impl Into<String>) -> Volume {
    Volume {
        name: name.into(),
        config_map: Some(ConfigMapVolumeSource {
            name: config_map_name.into(),
            ..ConfigMapVolumeSource::default()
        }),
        ..Volume::default()
    }
}

/// A scratch volume that lives as long as the pod.
pub fn empty_dir_volume(name: impl Into<String>) -> Volume {
    Volume {
        name: name.into(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Volume::default()
    }
}
