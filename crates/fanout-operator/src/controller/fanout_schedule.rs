//! Keeps a CronJob per FanOutSchedule whose runs fan out the current items.
//!
//! Unlike the one-shot case, both the rendered item list and the CronJob are updated in place.
//! Item ledgers are watched as well: a ListSource publishing new items re-enqueues every
//! FanOutSchedule referencing it, so future runs pick the new items up without a spec change.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use futures::{StreamExt, future};
use k8s_openapi::{
    api::{
        batch::v1::{CronJob, CronJobSpec, JobTemplateSpec},
        core::v1::ConfigMap,
    },
    apimachinery::pkg::apis::meta::v1::ObjectMeta,
};
use kube::{
    ResourceExt,
    runtime::{
        Controller,
        controller::Action,
        reflector::{ObjectRef, Store},
        watcher,
    },
};
use serde_json::json;
use sha2::{Digest, Sha256};
use snafu::{OptionExt, ResultExt, Snafu};
use strum::{EnumDiscriminants, IntoStaticStr};

use super::{Ctx, error_chain, retry_action};
use crate::{
    ErrorKind, builder, client,
    crd::fanout_schedule::{FanOutSchedule, FanOutScheduleStatus},
    fanout,
    finalizer::{self, LifecyclePhase},
    labels::{
        ITEM_LEDGER_SELECTOR, ITEM_LIST_SELECTOR, ITEMS_VERSION_ANNOTATION, SPEC_HASH_ANNOTATION,
        WORKLOAD_COMPONENT, WORKLOAD_SELECTOR, recommended_labels,
    },
    logging::controller::{ReconcilerError, report_controller_reconciled},
    namespace::WatchNamespace,
};

pub const CONTROLLER_NAME: &str = "fanoutschedule";
pub const FINALIZER: &str = "fanoutschedule.batchops.io/finalizer";

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, EnumDiscriminants, Snafu)]
#[strum_discriminants(derive(IntoStaticStr))]
pub enum Error {
    #[snafu(display("FanOutSchedule has no namespace"))]
    ObjectHasNoNamespace,

    #[snafu(display("failed to add finalizer"))]
    AddFinalizer { source: client::Error },

    #[snafu(display("failed to remove finalizer"))]
    RemoveFinalizer { source: client::Error },

    #[snafu(display("failed to resolve items"))]
    ResolveItems { source: fanout::Error },

    #[snafu(display("failed to build item list"))]
    BuildItemList { source: fanout::Error },

    #[snafu(display("failed to apply item list"))]
    ApplyItemList { source: client::Error },

    #[snafu(display("failed to build CronJob"))]
    BuildCronJob { source: builder::Error },

    #[snafu(display("failed to hash CronJob spec"))]
    HashSpec { source: serde_json::Error },

    #[snafu(display("failed to apply CronJob"))]
    ApplyCronJob { source: client::Error },

    #[snafu(display("failed to update status"))]
    UpdateStatus { source: client::Error },
}

impl ReconcilerError for Error {
    fn category(&self) -> &'static str {
        ErrorDiscriminants::from(self).into()
    }

    fn kind(&self) -> ErrorKind {
        match self {
            Self::ObjectHasNoNamespace | Self::BuildCronJob { .. } | Self::HashSpec { .. } => {
                ErrorKind::ConfigInvalid
            }
            Self::ResolveItems { source } | Self::BuildItemList { source } => source.kind(),
            Self::AddFinalizer { source }
            | Self::RemoveFinalizer { source }
            | Self::ApplyItemList { source }
            | Self::ApplyCronJob { source }
            | Self::UpdateStatus { source } => source.kind(),
        }
    }
}

/// Maps item ledgers to the FanOutSchedules reading them.
#[derive(Debug, Default)]
pub struct LedgerIndex {
    dependents: BTreeMap<(String, String), Vec<ObjectRef<FanOutSchedule>>>,
}

impl LedgerIndex {
    pub fn build<'a>(schedules: impl IntoIterator<Item = &'a FanOutSchedule>) -> Self {
        let mut dependents: BTreeMap<_, Vec<_>> = BTreeMap::new();
        for schedule in schedules {
            let (Some(namespace), Some(ledger)) = (
                schedule.namespace(),
                schedule.spec.fan_out.list_source_ref.as_ref(),
            ) else {
                continue;
            };
            dependents
                .entry((namespace, ledger.clone()))
                .or_default()
                .push(ObjectRef::from_obj(schedule));
        }
        Self { dependents }
    }

    /// The FanOutSchedules reading the ledger `name` in `namespace`.
    pub fn dependents(&self, namespace: &str, name: &str) -> &[ObjectRef<FanOutSchedule>] {
        self.dependents
            .get(&(namespace.to_string(), name.to_string()))
            .map_or(&[], Vec::as_slice)
    }
}

/// Finds the FanOutSchedules that must re-render after `ledger` changed.
///
/// The index is rebuilt from the controller's cache on every ledger event.
pub fn schedules_for_ledger(
    store: &Store<FanOutSchedule>,
    ledger: &ConfigMap,
) -> Vec<ObjectRef<FanOutSchedule>> {
    let Some(namespace) = ledger.namespace() else {
        return Vec::new();
    };
    let schedules = store.state();
    LedgerIndex::build(schedules.iter().map(|schedule| schedule.as_ref()))
        .dependents(&namespace, &ledger.name_any())
        .to_vec()
}

/// The parts of a CronJob spec the operator sets, with the API server defaults filled in.
///
/// Compared against the live CronJob to notice edits made behind the operator's back, which
/// leave the spec hash annotation untouched.
#[derive(Debug, PartialEq)]
struct OwnedFields<'a> {
    schedule: &'a str,
    concurrency_policy: &'a str,
    suspend: bool,
    starting_deadline_seconds: Option<i64>,
    successful_jobs_history_limit: i32,
    failed_jobs_history_limit: i32,
    completions: Option<i32>,
    parallelism: Option<i32>,
    completion_mode: Option<&'a str>,
    ttl_seconds_after_finished: Option<i32>,
    pod_annotations: Option<&'a BTreeMap<String, String>>,
    containers: Vec<(&'a str, Option<&'a str>, Option<&'a [String]>)>,
}

impl<'a> OwnedFields<'a> {
    fn of(spec: &'a CronJobSpec) -> Self {
        let job = spec.job_template.spec.as_ref();
        let containers = job
            .and_then(|job| job.template.spec.as_ref())
            .into_iter()
            .flat_map(|pod| pod.init_containers.iter().flatten().chain(&pod.containers))
            .map(|container| {
                (
                    container.name.as_str(),
                    container.image.as_deref(),
                    container.command.as_deref(),
                )
            })
            .collect();
        Self {
            schedule: &spec.schedule,
            concurrency_policy: spec.concurrency_policy.as_deref().unwrap_or("Allow"),
            suspend: spec.suspend.unwrap_or(false),
            starting_deadline_seconds: spec.starting_deadline_seconds,
            successful_jobs_history_limit: spec.successful_jobs_history_limit.unwrap_or(3),
            failed_jobs_history_limit: spec.failed_jobs_history_limit.unwrap_or(1),
            completions: job.and_then(|job| job.completions),
            parallelism: job.and_then(|job| job.parallelism),
            completion_mode: job.and_then(|job| job.completion_mode.as_deref()),
            ttl_seconds_after_finished: job.and_then(|job| job.ttl_seconds_after_finished),
            pod_annotations: job
                .and_then(|job| job.template.metadata.as_ref())
                .and_then(|metadata| metadata.annotations.as_ref()),
            containers,
        }
    }
}

/// Returns true if `live` was built from the same spec as `desired` and was not edited since.
fn is_current(live: &CronJob, desired: &CronJob) -> bool {
    live.annotations().get(SPEC_HASH_ANNOTATION) == desired.annotations().get(SPEC_HASH_ANNOTATION)
        && live.spec.as_ref().map(OwnedFields::of) == desired.spec.as_ref().map(OwnedFields::of)
}

fn spec_hash(spec: &CronJobSpec) -> Result<String> {
    let serialized = serde_json::to_vec(spec).context(HashSpecSnafu)?;
    Ok(format!("{:x}", Sha256::digest(serialized)))
}

/// Builds the CronJob of `schedule` running `item_count` pods per run.
///
/// `items_version` identifies the rendered item list the pod template was built for.
pub fn build_cron_job(
    schedule: &FanOutSchedule,
    item_count: usize,
    items_version: &str,
    shim_image: &str,
) -> Result<CronJob> {
    let spec = &schedule.spec;
    let name = schedule.name_any();
    let job_template = JobTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: Some(recommended_labels(&name, WORKLOAD_COMPONENT)),
            ..ObjectMeta::default()
        }),
        spec: Some(fanout::job_spec(
            &spec.fan_out,
            &name,
            item_count,
            shim_image,
            BTreeMap::from([(
                ITEMS_VERSION_ANNOTATION.to_string(),
                items_version.to_string(),
            )]),
        )),
    };
    let cron_job_spec = CronJobSpec {
        schedule: spec.schedule.trim().to_string(),
        concurrency_policy: Some(spec.concurrency_policy.to_string()),
        starting_deadline_seconds: spec.starting_deadline_seconds,
        successful_jobs_history_limit: spec.successful_jobs_history_limit,
        failed_jobs_history_limit: spec.failed_jobs_history_limit,
        suspend: spec.suspend,
        job_template,
        ..CronJobSpec::default()
    };

    let mut metadata = fanout::workload_metadata(schedule).context(BuildCronJobSnafu)?;
    metadata
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(SPEC_HASH_ANNOTATION.to_string(), spec_hash(&cron_job_spec)?);
    Ok(CronJob {
        metadata,
        spec: Some(cron_job_spec),
        status: None,
    })
}

#[tracing::instrument(skip(schedule, ctx), fields(fanout_schedule = %ObjectRef::from_obj(&*schedule)))]
pub async fn reconcile(schedule: Arc<FanOutSchedule>, ctx: Arc<Ctx>) -> Result<Action> {
    let namespace = schedule.namespace().context(ObjectHasNoNamespaceSnafu)?;
    let name = schedule.name_any();

    match LifecyclePhase::of(&*schedule, FINALIZER) {
        LifecyclePhase::Initializing => {
            finalizer::add_finalizer(&ctx.client, &*schedule, FINALIZER)
                .await
                .context(AddFinalizerSnafu)?;
            return Ok(Action::requeue(Duration::ZERO));
        }
        LifecyclePhase::Terminating => {
            cleanup(&ctx, &name, &namespace).await;
            finalizer::remove_finalizer(&ctx.client, &*schedule, FINALIZER)
                .await
                .context(RemoveFinalizerSnafu)?;
            tracing::info!("cleaned up, released finalizer");
            return Ok(Action::await_change());
        }
        LifecyclePhase::Released => return Ok(Action::await_change()),
        LifecyclePhase::Active => {}
    }

    let validated = fanout::validate(&schedule.spec.fan_out).and_then(|origin| {
        fanout::validate_schedule(&schedule.spec.schedule)?;
        Ok(origin)
    });
    let origin = match validated {
        Ok(origin) => origin,
        Err(error) => {
            tracing::warn!(
                error = &error as &dyn std::error::Error,
                "invalid FanOutSchedule, waiting for the spec to change"
            );
            record_error(&ctx, &schedule, &error).await?;
            return Ok(Action::await_change());
        }
    };

    let items = match fanout::resolve_items(origin, &namespace, &ctx.ledger).await {
        Ok(items) => items,
        Err(error) => {
            record_error(&ctx, &schedule, &error).await?;
            return Err(error).context(ResolveItemsSnafu);
        }
    };

    let item_list = apply_item_list(
        &ctx,
        fanout::build_item_list(&*schedule, &items).context(BuildItemListSnafu)?,
    )
    .await?;
    let items_version = item_list.resource_version().unwrap_or_default();

    let desired = build_cron_job(&schedule, items.len(), &items_version, &ctx.shim_image)?;
    let cron_job = apply_cron_job(&ctx, desired).await?;

    let cron_job_status = cron_job.status.unwrap_or_default();
    let status = FanOutScheduleStatus {
        cron_job_name: Some(name),
        item_count: items.len() as i64,
        active: cron_job_status.active.unwrap_or_default(),
        last_schedule_time: cron_job_status.last_schedule_time,
        last_error: None,
    };
    ctx.client
        .merge_patch_status(&*schedule, &status)
        .await
        .context(UpdateStatusSnafu)?;

    Ok(Action::await_change())
}

/// Creates the rendered item list or brings the live one up to date.
async fn apply_item_list(ctx: &Ctx, desired: ConfigMap) -> Result<ConfigMap> {
    let name = desired.name_any();
    let namespace = desired.namespace().unwrap_or_default();
    let live = ctx
        .client
        .get_opt::<ConfigMap>(&name, &namespace)
        .await
        .context(ApplyItemListSnafu)?;
    match live {
        None => ctx.client.create(&desired).await.context(ApplyItemListSnafu),
        Some(live) if live.data == desired.data => Ok(live),
        Some(mut live) => {
            live.data = desired.data;
            let updated = ctx.client.replace(&live).await.context(ApplyItemListSnafu)?;
            tracing::info!(config_map = %name, "updated item list");
            Ok(updated)
        }
    }
}

/// Creates the CronJob or replaces the live one if it is outdated or was edited.
async fn apply_cron_job(ctx: &Ctx, mut desired: CronJob) -> Result<CronJob> {
    let name = desired.name_any();
    let namespace = desired.namespace().unwrap_or_default();
    let live = ctx
        .client
        .get_opt::<CronJob>(&name, &namespace)
        .await
        .context(ApplyCronJobSnafu)?;
    match live {
        None => {
            let created = ctx.client.create(&desired).await.context(ApplyCronJobSnafu)?;
            tracing::info!(cron_job = %name, "created CronJob");
            Ok(created)
        }
        Some(live) if is_current(&live, &desired) => {
            tracing::debug!(cron_job = %name, "CronJob is up to date");
            Ok(live)
        }
        Some(live) => {
            desired.metadata.resource_version = live.metadata.resource_version;
            let replaced = ctx.client.replace(&desired).await.context(ApplyCronJobSnafu)?;
            tracing::info!(cron_job = %name, "replaced outdated or modified CronJob");
            Ok(replaced)
        }
    }
}

/// Records `error` as `status.lastError`.
async fn record_error(
    ctx: &Ctx,
    schedule: &FanOutSchedule,
    error: &(dyn std::error::Error + Send + Sync),
) -> Result<()> {
    ctx.client
        .merge_patch_status(schedule, &json!({ "lastError": error_chain(error) }))
        .await
        .context(UpdateStatusSnafu)?;
    Ok(())
}

/// Deletes the CronJob and the item list of a FanOutSchedule, logging failures.
async fn cleanup(ctx: &Ctx, name: &str, namespace: &str) {
    if let Err(error) = ctx.client.delete_if_exists::<CronJob>(name, namespace).await {
        tracing::warn!(
            error = &error as &dyn std::error::Error,
            "failed to delete CronJob, leaving it to garbage collection"
        );
    }
    let list_name = fanout::item_list_name(name);
    if let Err(error) = ctx
        .client
        .delete_if_exists::<ConfigMap>(&list_name, namespace)
        .await
    {
        tracing::warn!(
            error = &error as &dyn std::error::Error,
            "failed to delete item list, leaving it to garbage collection"
        );
    }
}

pub fn error_policy(_schedule: Arc<FanOutSchedule>, error: &Error, ctx: Arc<Ctx>) -> Action {
    retry_action(error.kind(), ctx.error_requeue)
}

/// Runs the FanOutSchedule controller until the process is asked to shut down.
pub async fn run(ctx: Arc<Ctx>, watch_namespace: &WatchNamespace) {
    let client = ctx.client.clone();
    let controller = Controller::new(
        watch_namespace.get_api::<FanOutSchedule>(&client),
        watcher::Config::default(),
    );
    let store = controller.store();
    controller
        .owns(
            watch_namespace.get_api::<CronJob>(&client),
            watcher::Config::default().labels(WORKLOAD_SELECTOR),
        )
        .owns(
            watch_namespace.get_api::<ConfigMap>(&client),
            watcher::Config::default().labels(ITEM_LIST_SELECTOR),
        )
        .watches(
            watch_namespace.get_api::<ConfigMap>(&client),
            watcher::Config::default().labels(ITEM_LEDGER_SELECTOR),
            move |ledger| schedules_for_ledger(&store, &ledger),
        )
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| {
            report_controller_reconciled(&client, CONTROLLER_NAME, &result);
            future::ready(())
        })
        .await;
}
