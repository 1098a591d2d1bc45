//! Publishes reconcile failures as Kubernetes Events on the failing object.

use k8s_openapi::api::core::v1::ObjectReference;
use kube::{
    core::DynamicObject,
    runtime::{
        events::{Event, EventType, Recorder, Reporter},
        reflector::ObjectRef,
    },
};
use tracing::Instrument;

use super::controller::ReconcilerError;
use crate::{ErrorKind, client::Client, controller::error_chain};

/// Upper bound of an Event note, longer messages are rejected by the API server
const MAX_NOTE_LEN: usize = 1024;

/// Conflicts are retried within a second and mean nothing to the object's owner.
fn is_user_facing(kind: ErrorKind) -> bool {
    kind != ErrorKind::PlatformConflict
}

/// Builds a Warning Event carrying the full error chain.
fn error_to_event<E: ReconcilerError>(error: &E) -> Event {
    let mut note = error_chain(error);
    message::truncate_with_ellipsis(&mut note, MAX_NOTE_LEN);
    Event {
        type_: EventType::Warning,
        reason: error.category().to_string(),
        note: Some(note),
        action: "Reconcile".to_string(),
        secondary: None,
    }
}

/// Publishes `error` as an Event on `obj` in the background.
#[tracing::instrument(skip(client, error))]
pub fn publish_controller_error_as_k8s_event<E: ReconcilerError>(
    client: &Client,
    controller: &str,
    error: &E,
    obj: &ObjectRef<DynamicObject>,
) {
    if !is_user_facing(error.kind()) {
        return;
    }
    let recorder = Recorder::new(
        client.as_kube_client(),
        Reporter {
            controller: controller.to_string(),
            instance: None,
        },
    );
    let reference: ObjectReference = obj.clone().into();
    let event = error_to_event(error);
    tokio::spawn(
        async move {
            if let Err(error) = recorder.publish(&event, &reference).await {
                tracing::error!(
                    error = &error as &dyn std::error::Error,
                    "Failed to report error as K8s event"
                );
            }
        }
        .in_current_span(),
    );
}

mod message {
    /// Ensures that `msg` is at most `max_len` _bytes_ long
    ///
    /// If `msg` is longer than `max_len` then the extra text is replaced with an ellipsis.
    pub fn truncate_with_ellipsis(msg: &mut String, max_len: usize) {
        const ELLIPSIS: char = '…';
        const ELLIPSIS_LEN: usize = ELLIPSIS.len_utf8();
        if msg.len() > max_len {
            let start_of_trunc_char = find_start_of_char(msg, max_len.saturating_sub(ELLIPSIS_LEN));
            msg.truncate(start_of_trunc_char);
            if ELLIPSIS_LEN <= max_len {
                msg.push(ELLIPSIS);
            }
        }
        debug_assert!(msg.len() <= max_len);
    }

    fn find_start_of_char(s: &str, mut pos: usize) -> usize {
        while !s.is_char_boundary(pos) {
            pos -= 1;
        }
        pos
    }

}
