//! Reporting of controller outcomes, see [`report_controller_reconciled`].

use kube::{
    Resource,
    runtime::{
        controller::{self, Action},
        reflector::ObjectRef,
    },
};

use crate::{ErrorKind, client::Client, logging::k8s_events::publish_controller_error_as_k8s_event};

/// Reconcile errors of the operator's controllers.
pub trait ReconcilerError: std::error::Error {
    /// `PascalCase` name of the failure, used as Event reason.
    ///
    /// Implemented by delegating to [`strum::EnumDiscriminants`] and [`strum::IntoStaticStr`].
    fn category(&self) -> &'static str;

    fn kind(&self) -> ErrorKind;
}

/// Logs the result of one reconciliation and publishes failures the object's owner can act on
/// as Kubernetes Events.
pub fn report_controller_reconciled<K, ReconcileErr, QueueErr>(
    client: &Client,
    controller_name: &str,
    result: &Result<(ObjectRef<K>, Action), controller::Error<ReconcileErr, QueueErr>>,
) where
    K: Resource,
    ReconcileErr: ReconcilerError,
    QueueErr: std::error::Error,
{
    match result {
        Ok((obj, action)) => tracing::info!(
            controller.name = controller_name,
            object = %obj,
            ?action,
            "Reconciled object"
        ),
        Err(controller::Error::ReconcilerFailed(error, obj)) => {
            tracing::error!(
                controller.name = controller_name,
                object = %obj,
                error.kind = %error.kind(),
                error = error as &dyn std::error::Error,
                "Failed to reconcile object"
            );
            publish_controller_error_as_k8s_event(client, controller_name, error, obj);
        }
        // Queue and watch failures concern the operator itself, not a particular object
        Err(error) => tracing::error!(
            controller.name = controller_name,
            error = error as &dyn std::error::Error,
            "Controller failed"
        ),
    }
}
