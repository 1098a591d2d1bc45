use k8s_openapi::{
    api::core::v1::ObjectReference, apimachinery::pkg::apis::meta::v1::Time,
};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use strum::Display;

use super::FanOutSpec;

/// Runs one pod per item on a cron schedule, as a CronJob of the same name.
///
/// When the items come from a ListSource, every run uses the items last published by it.
#[derive(Clone, CustomResource, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[kube(
    group = "batchops.io",
    version = "v1alpha1",
    kind = "FanOutSchedule",
    namespaced,
    status = "FanOutScheduleStatus",
    shortname = "fos",
    printcolumn = r#"{"name":"Schedule","type":"string","jsonPath":".spec.schedule"}"#,
    printcolumn = r#"{"name":"Items","type":"integer","jsonPath":".status.itemCount"}"#,
    printcolumn = r#"{"name":"Last Schedule","type":"date","jsonPath":".status.lastScheduleTime"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct FanOutScheduleSpec {
    #[serde(flatten)]
    pub fan_out: FanOutSpec,

    /// Cron expression, e.g. `*/5 * * * *` or `@hourly`.
    pub schedule: String,

    /// How to treat a run that is due while the previous one is still active.
    #[serde(default)]
    pub concurrency_policy: ConcurrencyPolicy,

    /// Seconds a missed run may still be started after its scheduled time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub starting_deadline_seconds: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub successful_jobs_history_limit: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_jobs_history_limit: Option<i32>,

    /// Stops future runs without touching active ones.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suspend: Option<bool>,
}

#[derive(
    Clone, Copy, Debug, Default, Deserialize, Display, Eq, JsonSchema, PartialEq, Serialize,
)]
pub enum ConcurrencyPolicy {
    /// Runs may overlap.
    #[default]
    Allow,
    /// A due run is skipped while the previous one is active.
    Forbid,
    /// A due run replaces the active one.
    Replace,
}

// Every field is written on each status patch, `None` clears the field.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FanOutScheduleStatus {
    /// Name of the CronJob running the items.
    pub cron_job_name: Option<String>,

    /// Number of items the CronJob was last rendered with.
    #[serde(default)]
    pub item_count: i64,

    /// Jobs of the CronJob that are currently running.
    #[serde(default)]
    pub active: Vec<ObjectReference>,

    /// When the CronJob last started a run.
    pub last_schedule_time: Option<Time>,

    pub last_error: Option<String>,
}
