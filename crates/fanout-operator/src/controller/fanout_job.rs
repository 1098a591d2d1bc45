//! Materializes every FanOutJob as an Indexed Job processing each item exactly once.
//!
//! The FanOutJob carries a finalizer from its first reconciliation on. The Job is created once,
//! `status.jobName` records that it was. On deletion the Job and the rendered item list are
//! removed before the finalizer is released.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use futures::{StreamExt, future};
use k8s_openapi::{
    api::{batch::v1::Job, core::v1::ConfigMap},
    apimachinery::pkg::apis::meta::v1::Time,
};
use kube::{
    ResourceExt,
    runtime::{Controller, controller::Action, reflector::ObjectRef, watcher},
};
use serde_json::json;
use snafu::{OptionExt, ResultExt, Snafu};
use strum::{EnumDiscriminants, IntoStaticStr};

use super::{Ctx, error_chain, retry_action};
use crate::{
    ErrorKind, builder, client,
    crd::fanout_job::{FanOutJob, FanOutJobStatus},
    fanout,
    finalizer::{self, LifecyclePhase},
    labels::{ITEM_LIST_SELECTOR, WORKLOAD_SELECTOR},
    logging::controller::{ReconcilerError, report_controller_reconciled},
    namespace::WatchNamespace,
};

pub const CONTROLLER_NAME: &str = "fanoutjob";
pub const FINALIZER: &str = "fanoutjob.batchops.io/finalizer";

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, EnumDiscriminants, Snafu)]
#[strum_discriminants(derive(IntoStaticStr))]
pub enum Error {
    #[snafu(display("FanOutJob has no namespace"))]
    ObjectHasNoNamespace,

    #[snafu(display("failed to add finalizer"))]
    AddFinalizer { source: client::Error },

    #[snafu(display("failed to remove finalizer"))]
    RemoveFinalizer { source: client::Error },

    #[snafu(display("failed to delete expired FanOutJob"))]
    DeleteExpired { source: client::Error },

    #[snafu(display("failed to resolve items"))]
    ResolveItems { source: fanout::Error },

    #[snafu(display("failed to build item list"))]
    BuildItemList { source: fanout::Error },

    #[snafu(display("failed to create item list"))]
    CreateItemList { source: client::Error },

    #[snafu(display("failed to build Job"))]
    BuildJob { source: builder::Error },

    #[snafu(display("failed to create Job"))]
    CreateJob { source: client::Error },

    #[snafu(display("failed to update status"))]
    UpdateStatus { source: client::Error },
}

impl ReconcilerError for Error {
    fn category(&self) -> &'static str {
        ErrorDiscriminants::from(self).into()
    }

    fn kind(&self) -> ErrorKind {
        match self {
            Self::ObjectHasNoNamespace | Self::BuildJob { .. } => ErrorKind::ConfigInvalid,
            Self::ResolveItems { source } | Self::BuildItemList { source } => source.kind(),
            Self::AddFinalizer { source }
            | Self::RemoveFinalizer { source }
            | Self::DeleteExpired { source }
            | Self::CreateItemList { source }
            | Self::CreateJob { source }
            | Self::UpdateStatus { source } => source.kind(),
        }
    }
}

/// Returns the time left until a FanOutJob created at `created` expires, [`None`] once it has.
pub fn expiry_remaining(
    created: jiff::Timestamp,
    delete_after: Duration,
    now: jiff::Timestamp,
) -> Option<Duration> {
    let age_ms = now.as_millisecond() - created.as_millisecond();
    let lifetime_ms = delete_after.as_millis() as i64;
    (age_ms < lifetime_ms).then(|| Duration::from_millis((lifetime_ms - age_ms.max(0)) as u64))
}

/// Builds the Indexed Job of `fanout_job` running `item_count` pods.
pub fn build_job(
    fanout_job: &FanOutJob,
    item_count: usize,
    shim_image: &str,
) -> Result<Job, builder::Error> {
    Ok(Job {
        metadata: fanout::workload_metadata(fanout_job)?,
        spec: Some(fanout::job_spec(
            &fanout_job.spec.fan_out,
            &fanout_job.name_any(),
            item_count,
            shim_image,
            BTreeMap::new(),
        )),
        status: None,
    })
}

#[tracing::instrument(skip(fanout_job, ctx), fields(fanout_job = %ObjectRef::from_obj(&*fanout_job)))]
pub async fn reconcile(fanout_job: Arc<FanOutJob>, ctx: Arc<Ctx>) -> Result<Action> {
    let namespace = fanout_job.namespace().context(ObjectHasNoNamespaceSnafu)?;
    let name = fanout_job.name_any();

    match LifecyclePhase::of(&*fanout_job, FINALIZER) {
        LifecyclePhase::Initializing => {
            finalizer::add_finalizer(&ctx.client, &*fanout_job, FINALIZER)
                .await
                .context(AddFinalizerSnafu)?;
            return Ok(Action::requeue(Duration::ZERO));
        }
        LifecyclePhase::Terminating => {
            cleanup(&ctx, &name, &namespace).await;
            finalizer::remove_finalizer(&ctx.client, &*fanout_job, FINALIZER)
                .await
                .context(RemoveFinalizerSnafu)?;
            tracing::info!("cleaned up, released finalizer");
            return Ok(Action::await_change());
        }
        LifecyclePhase::Released => return Ok(Action::await_change()),
        LifecyclePhase::Active => {}
    }

    let mut expires_in = None;
    if let (Some(delete_after), Some(Time(created))) = (
        fanout_job.spec.delete_after,
        fanout_job.metadata.creation_timestamp.as_ref(),
    ) {
        match expiry_remaining(*created, delete_after.into(), jiff::Timestamp::now()) {
            Some(remaining) => expires_in = Some(remaining),
            None => {
                tracing::info!(%delete_after, "FanOutJob expired, deleting it");
                ctx.client
                    .delete_if_exists::<FanOutJob>(&name, &namespace)
                    .await
                    .context(DeleteExpiredSnafu)?;
                return Ok(Action::await_change());
            }
        }
    }

    let requeue = expires_in.map_or_else(Action::await_change, Action::requeue);
    // Finished Jobs may be removed by their TTL, the items must not run a second time
    if let Some(job_name) = fanout_job
        .status
        .as_ref()
        .and_then(|status| status.job_name.as_deref())
    {
        tracing::debug!(job = %job_name, "Job was already created, not creating it again");
        return Ok(requeue);
    }

    let origin = match fanout::validate(&fanout_job.spec.fan_out) {
        Ok(origin) => origin,
        Err(error) => {
            tracing::warn!(
                error = &error as &dyn std::error::Error,
                "invalid FanOutJob, waiting for the spec to change"
            );
            record_error(&ctx, &fanout_job, &error).await?;
            return Ok(Action::await_change());
        }
    };

    let items = match fanout::resolve_items(origin, &namespace, &ctx.ledger).await {
        Ok(items) => items,
        Err(error) => {
            record_error(&ctx, &fanout_job, &error).await?;
            return Err(error).context(ResolveItemsSnafu);
        }
    };

    let item_list = fanout::build_item_list(&*fanout_job, &items).context(BuildItemListSnafu)?;
    if ctx
        .client
        .create_if_missing(&item_list)
        .await
        .context(CreateItemListSnafu)?
        .is_none()
    {
        tracing::debug!(config_map = %item_list.name_any(), "item list already exists");
    }

    let job = build_job(&fanout_job, items.len(), &ctx.shim_image).context(BuildJobSnafu)?;
    match ctx
        .client
        .create_if_missing(&job)
        .await
        .context(CreateJobSnafu)?
    {
        Some(_) => tracing::info!(job = %name, item.count = items.len(), "created Job"),
        None => tracing::debug!(job = %name, "Job already exists"),
    }

    let status = FanOutJobStatus {
        job_name: Some(name),
        item_count: items.len() as i64,
        last_error: None,
    };
    ctx.client
        .merge_patch_status(&*fanout_job, &status)
        .await
        .context(UpdateStatusSnafu)?;

    Ok(requeue)
}

/// Records `error` as `status.lastError`.
async fn record_error(
    ctx: &Ctx,
    fanout_job: &FanOutJob,
    error: &(dyn std::error::Error + Send + Sync),
) -> Result<()> {
    ctx.client
        .merge_patch_status(fanout_job, &json!({ "lastError": error_chain(error) }))
        .await
        .context(UpdateStatusSnafu)?;
    Ok(())
}

/// Deletes the Job and the item list of a FanOutJob.
///
/// Failures are only logged, the owner references still get both collected eventually.
async fn cleanup(ctx: &Ctx, name: &str, namespace: &str) {
    if let Err(error) = ctx.client.delete_if_exists::<Job>(name, namespace).await {
        tracing::warn!(
            error = &error as &dyn std::error::Error,
            "failed to delete Job, leaving it to garbage collection"
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

pub fn error_policy(_fanout_job: Arc<FanOutJob>, error: &Error, ctx: Arc<Ctx>) -> Action {
    retry_action(error.kind(), ctx.error_requeue)
}

/// Runs the FanOutJob controller until the process is asked to shut down.
pub async fn run(ctx: Arc<Ctx>, watch_namespace: &WatchNamespace) {
    let client = ctx.client.clone();
    Controller::new(
        watch_namespace.get_api::<FanOutJob>(&client),
        watcher::Config::default(),
    )
    .owns(
        watch_namespace.get_api::<Job>(&client),
        watcher::Config::default().labels(WORKLOAD_SELECTOR),
    )
    .owns(
        watch_namespace.get_api::<ConfigMap>(&client),
        watcher::Config::default().labels(ITEM_LIST_SELECTOR),
    )
    .shutdown_on_signal()
    .run(reconcile, error_policy, ctx)
    .for_each(|result| {
        report_controller_reconciled(&client, CONTROLLER_NAME, &result);
        future::ready(())
    })
    .await;
}
