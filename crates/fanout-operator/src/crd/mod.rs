//! Custom resources served by the operator.
//!
//! All of them live in the [`GROUP`] API group at version `v1alpha1`.

use k8s_openapi::api::core::v1::ResourceRequirements;
use kube::CustomResourceExt;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

pub mod fanout_job;
pub mod fanout_schedule;
pub mod list_source;

pub const GROUP: &str = "batchops.io";

pub const DEFAULT_ENV_NAME: &str = "ITEM";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to serialize CRD {name:?}"))]
    SerializeCrd {
        source: serde_yaml::Error,
        name: &'static str,
    },
}

/// Fields shared by [`fanout_job::FanOutJob`] and [`fanout_schedule::FanOutSchedule`].
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FanOutSpec {
    /// Name of a ListSource in the same namespace whose published items are fanned out.
    /// Ignored when `staticList` is not empty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub list_source_ref: Option<String>,

    /// Items to fan out. Takes precedence over `listSourceRef`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub static_list: Vec<String>,

    /// How many item pods may run at the same time.
    #[serde(default = "FanOutSpec::default_parallelism")]
    pub parallelism: i32,

    /// The container every item pod runs.
    pub template: JobTemplate,

    /// Passed through to the Job: seconds after which a finished Job is cleaned up.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_seconds_after_finished: Option<i32>,
}

impl FanOutSpec {
    const fn default_parallelism() -> i32 {
        1
    }

    /// Where the items of this fan-out come from.
    ///
    /// Returns [`None`] if neither a non-empty inline list nor a list source is configured.
    pub fn item_origin(&self) -> Option<ItemOrigin<'_>> {
        if !self.static_list.is_empty() {
            Some(ItemOrigin::Inline(&self.static_list))
        } else {
            self.list_source_ref
                .as_deref()
                .filter(|name| !name.is_empty())
                .map(ItemOrigin::Ledger)
        }
    }
}

/// Origin of the items of a fan-out object.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ItemOrigin<'a> {
    /// Items given inline on the object.
    Inline(&'a [String]),

    /// Items published by the ListSource of this name.
    Ledger(&'a str),
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobTemplate {
    /// Image of the main container.
    pub image: String,

    /// Command of the main container. It runs in a shell after the item has been exported.
    #[serde(default)]
    pub command: Vec<String>,

    /// Name of the environment variable the item is exported as.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env_name: Option<String>,

    /// Resource requirements of the main container.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
}

impl JobTemplate {
    pub fn env_name(&self) -> &str {
        self.env_name
            .as_deref()
            .filter(|name| !name.is_empty())
            .unwrap_or(DEFAULT_ENV_NAME)
    }
}

/// Renders all CRDs as a multi document YAML stream.
pub fn crds_yaml() -> Result<String, Error> {
    let crds = [
        ("ListSource", list_source::ListSource::crd()),
        ("FanOutJob", fanout_job::FanOutJob::crd()),
        ("FanOutSchedule", fanout_schedule::FanOutSchedule::crd()),
    ];
    let mut yaml = String::new();
    for (name, crd) in crds {
        yaml.push_str("---\n");
        yaml.push_str(&serde_yaml::to_string(&crd).context(SerializeCrdSnafu { name })?);
    }
    Ok(yaml)
}
