//! Kubernetes Event recording for corral controllers.
//!
//! Wraps `kube::runtime::events::Recorder` behind a trait so reconcilers
//! can be tested without an API server. Publishing is fire-and-forget: a
//! failed event is logged and never fails reconciliation.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Trait for publishing Kubernetes Events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish an Event about `resource_ref`.
    ///
    /// * `type_` - Normal or Warning
    /// * `reason` - Machine-readable reason (e.g. "PrerequisitesFailed")
    /// * `action` - What the controller was doing
    /// * `note` - Optional human-readable message
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Production implementation wrapping `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a publisher reporting as `controller_name`.
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: None,
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = kube::runtime::events::Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(reason, action, error = %e, "Failed to publish Kubernetes event");
        }
    }
}

/// Publisher that drops every event.
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Well-known event reason strings.
pub mod reasons {
    /// Component name has no registered handler
    pub const UNSUPPORTED_TYPE: &str = "UnsupportedType";
    /// CorralCluster object is missing
    pub const CLUSTER_NOT_FOUND: &str = "ClusterNotFound";
    /// CorralCluster spec is not filled in yet
    pub const CONFIG_NOT_COMPLETED: &str = "ConfigNotCompleted";
    /// Offline package is missing or still loading
    pub const PACKAGE_NOT_READY: &str = "PackageNotReady";
    /// A dependency is still provisioning
    pub const PREREQUISITES_NOT_READY: &str = "PrerequisitesNotReady";
    /// A prerequisite check failed
    pub const PREREQUISITES_FAILED: &str = "PrerequisitesFailed";
    /// Writing generated resources failed
    pub const CREATE_RESOURCES_FAILED: &str = "ErrCreateResources";
    /// Listing component pods failed
    pub const LIST_PODS_FAILED: &str = "ErrListPods";
    /// All pods are ready
    pub const READY: &str = "Ready";
    /// Fewer pods are ready than desired
    pub const NOT_READY: &str = "NotReady";
    /// Volume descriptor names a storage class
    pub const STORAGE_CLASS_READY: &str = "StorageClassReady";
    /// Volume descriptor has neither a class name nor a provisioner
    pub const STORAGE_CLASS_PENDING: &str = "StorageClassPending";
}

/// Well-known event action strings.
pub mod actions {
    /// Standard reconciliation loop
    pub const RECONCILE: &str = "Reconcile";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_publisher_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<NoopEventPublisher>();
    }

    #[tokio::test]
    async fn noop_publisher_does_not_panic() {
        NoopEventPublisher
            .publish(
                &ObjectReference::default(),
                EventType::Warning,
                reasons::PREREQUISITES_FAILED,
                actions::RECONCILE,
                Some("database secret missing".to_string()),
            )
            .await;
    }
}
