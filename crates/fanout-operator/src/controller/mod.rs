//! The reconcilers of ListSource, FanOutJob and FanOutSchedule.
//!
//! Each module exposes a `reconcile` function, an `error_policy` and a `run` function
//! driving a [`kube::runtime::Controller`]. All of them share one [`Ctx`].

use std::{sync::Arc, time::Duration};

use kube::runtime::controller::Action;

use crate::{
    client::Client,
    error::{ErrorKind, RetryPolicy},
    ledger::ItemLedger,
    secret::SecretResolver,
    source::SourceResolver,
};

pub mod fanout_job;
pub mod fanout_schedule;
pub mod list_source;

/// State shared by all reconciliations.
pub struct Ctx {
    pub client: Client,
    pub ledger: ItemLedger,
    pub resolver: SourceResolver,
    pub secrets: Arc<dyn SecretResolver>,
    /// Image of the init container resolving the item of a pod
    pub shim_image: String,
    /// Delay before retrying failures that have no more specific retry delay
    pub error_requeue: Duration,
}

impl Ctx {
    pub fn new(
        client: Client,
        resolver: SourceResolver,
        secrets: Arc<dyn SecretResolver>,
        shim_image: impl Into<String>,
        error_requeue: Duration,
    ) -> Self {
        Self {
            ledger: ItemLedger::new(client.clone()),
            client,
            resolver,
            secrets,
            shim_image: shim_image.into(),
            error_requeue,
        }
    }
}

/// Translates the kind of a failed reconciliation into the controller's next step.
pub(crate) fn retry_action(kind: ErrorKind, default_delay: Duration) -> Action {
    match kind.retry_policy(default_delay) {
        RetryPolicy::AwaitChange => Action::await_change(),
        RetryPolicy::RequeueAfter(delay) => Action::requeue(delay),
    }
}

/// Message recorded in `status.lastError`: the error and all of its sources.
pub(crate) fn error_chain(error: &dyn std::error::Error) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(error) = source {
        message.push_str(": ");
        message.push_str(&error.to_string());
        source = error.source();
    }
    message
}
