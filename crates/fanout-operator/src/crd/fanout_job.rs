use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::FanOutSpec;
use crate::time::Duration;

/// Runs one pod per item, exactly once, as an Indexed Job of the same name.
#[derive(Clone, CustomResource, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[kube(
    group = "batchops.io",
    version = "v1alpha1",
    kind = "FanOutJob",
    namespaced,
    status = "FanOutJobStatus",
    shortname = "foj",
    printcolumn = r#"{"name":"Job","type":"string","jsonPath":".status.jobName"}"#,
    printcolumn = r#"{"name":"Items","type":"integer","jsonPath":".status.itemCount"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct FanOutJobSpec {
    #[serde(flatten)]
    pub fan_out: FanOutSpec,

    /// Deletes the FanOutJob, and with it everything it created, once it is older than this,
    /// e.g. `2h` or `1d 12h`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delete_after: Option<Duration>,
}

// Every field is written on each status patch, `None` clears the field.
#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FanOutJobStatus {
    /// Name of the Job running the items.
    pub job_name: Option<String>,

    /// Number of items the Job was created with.
    #[serde(default)]
    pub item_count: i64,

    pub last_error: Option<String>,
}
