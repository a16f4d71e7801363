use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder};
use kube::{Resource, ResourceExt};
use tracing::*;

/// Fire-and-forget sink for operational events
#[async_trait]
pub trait EventRecorder: Send + Sync {
    async fn record(&self, reference: ObjectReference, reason: &str, action: &str, note: Option<String>);
}

#[async_trait]
impl EventRecorder for Recorder {
    async fn record(&self, reference: ObjectReference, reason: &str, action: &str, note: Option<String>) {
        let res = self
            .publish(
                &Event {
                    type_: EventType::Normal,
                    reason: reason.into(),
                    note,
                    action: action.into(),
                    secondary: None,
                },
                &reference,
            )
            .await;
        if let Err(e) = res {
            warn!("failed to record {} event: {}", reason, e);
        }
    }
}

/// Drops every event, for callers that have no recorder
pub struct NoopRecorder;

#[async_trait]
impl EventRecorder for NoopRecorder {
    async fn record(&self, _: ObjectReference, _: &str, _: &str, _: Option<String>) {}
}

/// Publish a simple Normal event with given reason and note, ignoring errors.
pub async fn emit_info<R: Resource<DynamicType = ()> + ResourceExt>(
    recorder: &dyn EventRecorder,
    obj: &R,
    reason: &str,
    action: &str,
    note: impl Into<Option<String>>,
) {
    debug!("{} {}/{}: {}", reason, obj.namespace().unwrap_or_default(), obj.name_any(), action);
    recorder
        .record(obj.object_ref(&()), reason, action, note.into())
        .await;
}
