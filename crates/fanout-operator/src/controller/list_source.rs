//! Periodically resolves the items of every ListSource and publishes them to its ledger.
//!
//! A failed resolution only records `status.lastError`, the previously published items
//! stay available to fan-out objects. The next resolution is due after
//! `spec.intervalSeconds`, unless the failure was caused by the spec itself.

use std::{sync::Arc, time::Duration};

use futures::{StreamExt, future};
use k8s_openapi::{api::core::v1::ConfigMap, apimachinery::pkg::apis::meta::v1::Time};
use kube::{
    ResourceExt,
    runtime::{Controller, controller::Action, reflector::ObjectRef, watcher},
};
use serde_json::json;
use snafu::{OptionExt, ResultExt, Snafu};
use strum::{EnumDiscriminants, IntoStaticStr};

use super::{Ctx, error_chain, retry_action};
use crate::{
    ErrorKind, client,
    crd::list_source::{ListSource, ListSourceStatus},
    labels::ITEM_LEDGER_SELECTOR,
    ledger,
    logging::controller::{ReconcilerError, report_controller_reconciled},
    namespace::WatchNamespace,
    source::SourceConfig,
};

pub const CONTROLLER_NAME: &str = "listsource";

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, EnumDiscriminants, Snafu)]
#[strum_discriminants(derive(IntoStaticStr))]
pub enum Error {
    #[snafu(display("ListSource has no namespace"))]
    ObjectHasNoNamespace,

    #[snafu(display("failed to publish resolved items"))]
    PublishItems { source: ledger::Error },

    #[snafu(display("failed to update status"))]
    UpdateStatus { source: client::Error },
}

impl ReconcilerError for Error {
    fn category(&self) -> &'static str {
        ErrorDiscriminants::from(self).into()
    }

    fn kind(&self) -> ErrorKind {
        match self {
            Self::ObjectHasNoNamespace => ErrorKind::ConfigInvalid,
            Self::PublishItems { source } => source.kind(),
            Self::UpdateStatus { source } => source.kind(),
        }
    }
}

/// Returns how long to wait before the next resolution is due, [`None`] if it is due now.
///
/// A resolution is due when the spec changed since the last one, the last one failed or
/// `interval` has passed since it succeeded.
pub fn poll_delay(
    status: Option<&ListSourceStatus>,
    generation: Option<i64>,
    interval: Duration,
    now: jiff::Timestamp,
) -> Option<Duration> {
    let status = status?;
    if status.last_error.is_some() || status.observed_generation != generation {
        return None;
    }
    let Time(last_resolution) = status.last_resolution_time.as_ref()?;
    let elapsed_ms = now.as_millisecond() - last_resolution.as_millisecond();
    let interval_ms = interval.as_millis() as i64;
    (elapsed_ms >= 0 && elapsed_ms < interval_ms)
        .then(|| Duration::from_millis((interval_ms - elapsed_ms) as u64))
}

#[tracing::instrument(skip(list_source, ctx), fields(list_source = %ObjectRef::from_obj(&*list_source)))]
pub async fn reconcile(list_source: Arc<ListSource>, ctx: Arc<Ctx>) -> Result<Action> {
    let namespace = list_source.namespace().context(ObjectHasNoNamespaceSnafu)?;

    let config = match SourceConfig::from_spec(&list_source.spec) {
        Ok(config) => config,
        Err(error) => {
            tracing::warn!(
                error = &error as &dyn std::error::Error,
                "invalid list source, waiting for the spec to change"
            );
            let status = json!({
                "lastError": error_chain(&error),
                "observedGeneration": list_source.metadata.generation,
            });
            ctx.client
                .merge_patch_status(&*list_source, &status)
                .await
                .context(UpdateStatusSnafu)?;
            return Ok(Action::await_change());
        }
    };

    let interval = Duration::from_secs(list_source.spec.interval_seconds as u64);
    if let Some(delay) = poll_delay(
        list_source.status.as_ref(),
        list_source.metadata.generation,
        interval,
        jiff::Timestamp::now(),
    ) {
        tracing::debug!(?delay, "items are fresh, skipping resolution");
        return Ok(Action::requeue(delay));
    }

    match ctx
        .resolver
        .resolve(config, &namespace, ctx.secrets.as_ref())
        .await
    {
        Ok(items) => {
            ctx.ledger
                .publish(&list_source, &items)
                .await
                .context(PublishItemsSnafu)?;
            let status = ListSourceStatus {
                resolved_item_count: items.len() as i64,
                last_resolution_time: Some(Time(jiff::Timestamp::now())),
                last_error: None,
                observed_generation: list_source.metadata.generation,
            };
            ctx.client
                .merge_patch_status(&*list_source, &status)
                .await
                .context(UpdateStatusSnafu)?;
            tracing::info!(item.count = items.len(), "published items");
        }
        Err(error) => {
            tracing::warn!(
                error.kind = %error.kind(),
                error = &error as &dyn std::error::Error,
                "failed to resolve items, keeping previously published items"
            );
            let status = json!({
                "lastError": error_chain(&error),
                "observedGeneration": list_source.metadata.generation,
            });
            ctx.client
                .merge_patch_status(&*list_source, &status)
                .await
                .context(UpdateStatusSnafu)?;
            if error.kind() == ErrorKind::ConfigInvalid {
                return Ok(Action::await_change());
            }
        }
    }
    Ok(Action::requeue(interval))
}

pub fn error_policy(_list_source: Arc<ListSource>, error: &Error, ctx: Arc<Ctx>) -> Action {
    retry_action(error.kind(), ctx.error_requeue)
}

/// Runs the ListSource controller until the process is asked to shut down.
pub async fn run(ctx: Arc<Ctx>, watch_namespace: &WatchNamespace) {
    let client = ctx.client.clone();
    Controller::new(
        watch_namespace.get_api::<ListSource>(&client),
        watcher::Config::default(),
    )
    .owns(
        watch_namespace.get_api::<ConfigMap>(&client),
        watcher::Config::default().labels(ITEM_LEDGER_SELECTOR),
    )
    .shutdown_on_signal()
    .run(reconcile, error_policy, ctx)
    .for_each(|result| {
        report_controller_reconciled(&client, CONTROLLER_NAME, &result);
        future::ready(())
    })
    .await;
}

#[cfg(test)]
mod tests {
    use axum::{Json, Router, routing::get};
    use rstest::rstest;
    use serde_json::json;

    use super::*;
    use crate::{
        controller::tests::{NAMESPACE, ctx, is_requeue, metadata},
        crd::list_source::{ApiSourceSpec, ListSourceSpec, SourceType},
        ledger::{ITEMS_KEY, ledger_items},
        test_utils::{FakeApiServer, StaticSecrets, serve_http},
    };

    fn list_source(spec: ListSourceSpec) -> ListSource {
        ListSource {
            metadata: metadata("users"),
            spec,
            status: None,
        }
    }

    fn static_spec(items: &[&str]) -> ListSourceSpec {
        ListSourceSpec {
            source_type: SourceType::Static,
            static_list: Some(items.iter().map(ToString::to_string).collect()),
            interval_seconds: 60,
            ..ListSourceSpec::default()
        }
    }

    fn api_spec(url: String) -> ListSourceSpec {
        ListSourceSpec {
            source_type: SourceType::Api,
            api: Some(ApiSourceSpec {
                url,
                json_path: Some("$[*]".to_string()),
                ..ApiSourceSpec::default()
            }),
            interval_seconds: 60,
            ..ListSourceSpec::default()
        }
    }

    fn status(server: &FakeApiServer) -> ListSourceStatus {
        server
            .get::<ListSource>(NAMESPACE, "users")
            .and_then(|source| source.status)
            .expect("status is written")
    }

    #[tokio::test]
    async fn api_items_are_published() {
        let url = serve_http(Router::new().route("/users", get(|| async { Json(json!(["x", "y"])) })))
            .await;
        let server = FakeApiServer::new();
        let source = server.insert(&list_source(api_spec(format!("{url}/users"))));

        let action = reconcile(Arc::new(source), ctx(&server, StaticSecrets::default()))
            .await
            .expect("reconcile succeeds");
        assert_eq!(action, Action::requeue(Duration::from_secs(60)));

        let ledger = server
            .get::<ConfigMap>(NAMESPACE, "users")
            .expect("ledger is published");
        assert_eq!(ledger.data.as_ref().expect("data")[ITEMS_KEY], "x,y");
        let status = status(&server);
        assert_eq!(status.resolved_item_count, 2);
        assert_eq!(status.last_error, None);
        assert!(status.last_resolution_time.is_some());
    }

    #[tokio::test]
    async fn failed_resolution_keeps_published_items() {
        let server = FakeApiServer::new();
        let source = server.insert(&list_source(static_spec(&["a", "b"])));
        let ctx = ctx(&server, StaticSecrets::default());
        reconcile(Arc::new(source.clone()), ctx.clone())
            .await
            .expect("reconcile succeeds");

        let failing = ListSource {
            spec: api_spec("http://127.0.0.1:1/users".to_string()),
            status: None,
            ..source
        };
        let action = reconcile(Arc::new(failing), ctx)
            .await
            .expect("resolution failures are recorded, not returned");
        assert_eq!(action, Action::requeue(Duration::from_secs(60)));

        let ledger = server
            .get::<ConfigMap>(NAMESPACE, "users")
            .expect("ledger survives");
        assert_eq!(ledger_items(&ledger), Some(vec!["a".to_string(), "b".to_string()]));
        let status = status(&server);
        assert_eq!(status.resolved_item_count, 2);
        assert!(
            status
                .last_error
                .as_deref()
                .is_some_and(|error| error.starts_with("failed to request")),
            "{status:?}"
        );
    }

    #[tokio::test]
    async fn invalid_spec_waits_for_change() {
        let server = FakeApiServer::new();
        let spec = ListSourceSpec {
            source_type: SourceType::Api,
            ..static_spec(&["a"])
        };
        let source = server.insert(&list_source(spec));

        let action = reconcile(Arc::new(source), ctx(&server, StaticSecrets::default()))
            .await
            .expect("invalid specs are recorded, not returned");
        assert!(!is_requeue(&action));
        assert!(server.get::<ConfigMap>(NAMESPACE, "users").is_none());
        assert!(
            status(&server)
                .last_error
                .is_some_and(|error| error.contains("staticList must not be set")),
        );
    }

    #[tokio::test]
    async fn misconfigured_adaptor_waits_for_change() {
        let server = FakeApiServer::new();
        let mut spec = api_spec("http://127.0.0.1:1/users".to_string());
        if let Some(api) = spec.api.as_mut() {
            api.json_path = Some("$[".to_string());
        }
        let source = server.insert(&list_source(spec));

        let action = reconcile(Arc::new(source), ctx(&server, StaticSecrets::default()))
            .await
            .expect("resolution failures are recorded, not returned");
        assert!(!is_requeue(&action));
        assert!(server.get::<ConfigMap>(NAMESPACE, "users").is_none());
        assert!(status(&server).last_error.is_some());
    }

    #[tokio::test]
    async fn fresh_items_are_not_resolved_again() {
        let server = FakeApiServer::new();
        let source = server.insert(&list_source(static_spec(&["a"])));
        let ctx = ctx(&server, StaticSecrets::default());
        reconcile(Arc::new(source), ctx.clone())
            .await
            .expect("reconcile succeeds");
        let published = server
            .get::<ConfigMap>(NAMESPACE, "users")
            .expect("ledger is published");

        // Same generation, different items: only a spec change may trigger a resolution
        let mut current = server
            .get::<ListSource>(NAMESPACE, "users")
            .expect("source exists");
        current.spec = static_spec(&["b"]);
        let action = reconcile(Arc::new(current), ctx)
            .await
            .expect("reconcile succeeds");
        assert!(is_requeue(&action));
        assert_eq!(
            server.get::<ConfigMap>(NAMESPACE, "users"),
            Some(published)
        );
    }

    fn resolved(at: jiff::Timestamp, generation: i64, error: Option<&str>) -> ListSourceStatus {
        ListSourceStatus {
            resolved_item_count: 1,
            last_resolution_time: Some(Time(at)),
            last_error: error.map(ToString::to_string),
            observed_generation: Some(generation),
        }
    }

    #[rstest]
    #[case::never_resolved(None, 1, 0, None)]
    #[case::fresh(Some(resolved(jiff::Timestamp::UNIX_EPOCH, 1, None)), 1, 20, Some(Duration::from_secs(40)))]
    #[case::due(Some(resolved(jiff::Timestamp::UNIX_EPOCH, 1, None)), 1, 60, None)]
    #[case::spec_changed(Some(resolved(jiff::Timestamp::UNIX_EPOCH, 1, None)), 2, 20, None)]
    #[case::last_failed(Some(resolved(jiff::Timestamp::UNIX_EPOCH, 1, Some("boom"))), 1, 20, None)]
    fn poll_delays(
        #[case] status: Option<ListSourceStatus>,
        #[case] generation: i64,
        #[case] elapsed_secs: i64,
        #[case] expected: Option<Duration>,
    ) {
        let now = jiff::Timestamp::from_second(elapsed_secs).expect("valid timestamp");
        assert_eq!(
            poll_delay(status.as_ref(), Some(generation), Duration::from_secs(60), now),
            expected
        );
    }
}
