//! CorralComponent controller implementation
//!
//! A pass walks a component through its gates (known component type,
//! cluster present and configured, install package loaded) and then
//! drives the component handler phases. Every outcome is recorded as a
//! status condition; status is written back only when the ledger reports
//! a change, and readiness flips are published as Kubernetes Events.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use corral_common::crd::{
    component_conditions, Condition, ConditionStatus, CorralCluster, CorralComponent,
    CorralComponentStatus, CorralPackage, HasConditions, InstallMode,
};
use corral_common::events::{actions, reasons};
use corral_common::kube_utils::is_pod_ready;
use corral_common::{
    Error, EventPublisher, KubeEventPublisher, OperatorConfig, CLUSTER_NAME, FIELD_MANAGER,
    PACKAGE_NAME,
};
use corral_component::components::supported_components;
use corral_component::storage::set_storage_class_name;
use corral_component::{
    new_handler, ClusterApi, ComponentContext, ComponentHandler, KubeClusterApi, ManagedResource,
};

/// Requeue delay after a retryable failure
const RETRY_INTERVAL: Duration = Duration::from_secs(30);
/// Requeue delay while pods are still coming up
const NOT_READY_REQUEUE: Duration = Duration::from_secs(5);
/// Periodic resync of a ready component
const RESYNC_INTERVAL: Duration = Duration::from_secs(300);
/// Reporter name on published events
const CONTROLLER_NAME: &str = "corral-component-controller";
/// Condition type on CorralPackage marking every image as loaded
const PACKAGE_LOADED: &str = "Ready";

/// Kubernetes operations the component controller performs itself
///
/// Handler-side cluster access goes through [`ClusterApi`]; this trait
/// covers only the objects the controller reads and writes directly.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ComponentKubeClient: Send + Sync {
    /// Replace the status of a CorralComponent
    async fn patch_component_status(
        &self,
        namespace: &str,
        name: &str,
        status: &CorralComponentStatus,
    ) -> Result<(), Error>;

    /// Get the CorralCluster of a namespace, `None` when absent
    async fn get_cluster(&self, namespace: &str) -> Result<Option<CorralCluster>, Error>;

    /// Get the CorralPackage of a namespace, `None` when absent
    async fn get_package(&self, namespace: &str) -> Result<Option<CorralPackage>, Error>;
}

/// [`ComponentKubeClient`] backed by a kube client
pub struct ComponentKubeClientImpl {
    client: Client,
}

impl ComponentKubeClientImpl {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ComponentKubeClient for ComponentKubeClientImpl {
    async fn patch_component_status(
        &self,
        namespace: &str,
        name: &str,
        status: &CorralComponentStatus,
    ) -> Result<(), Error> {
        let api: Api<CorralComponent> = Api::namespaced(self.client.clone(), namespace);
        let status_patch = serde_json::json!({ "status": status });
        api.patch_status(
            name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&status_patch),
        )
        .await?;
        Ok(())
    }

    async fn get_cluster(&self, namespace: &str) -> Result<Option<CorralCluster>, Error> {
        let api: Api<CorralCluster> = Api::namespaced(self.client.clone(), namespace);
        match api.get(CLUSTER_NAME).await {
            Ok(cluster) => Ok(Some(cluster)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_package(&self, namespace: &str) -> Result<Option<CorralPackage>, Error> {
        let api: Api<CorralPackage> = Api::namespaced(self.client.clone(), namespace);
        match api.get(PACKAGE_NAME).await {
            Ok(pkg) => Ok(Some(pkg)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Shared context for the CorralComponent controller
pub struct Context {
    /// Controller-side Kubernetes operations
    pub kube: Arc<dyn ComponentKubeClient>,
    /// Cluster API handed to component handlers
    pub cluster_api: Arc<dyn ClusterApi>,
    /// Event sink for readiness transitions
    pub events: Arc<dyn EventPublisher>,
    /// Operator configuration
    pub config: Arc<OperatorConfig>,
    /// Cancelled on shutdown; every pass runs under a child token
    pub shutdown: CancellationToken,
}

impl Context {
    /// Create a context talking to the cluster behind `client`
    pub fn new(client: Client, config: Arc<OperatorConfig>, shutdown: CancellationToken) -> Self {
        Self {
            kube: Arc::new(ComponentKubeClientImpl::new(client.clone())),
            cluster_api: Arc::new(KubeClusterApi::new(client.clone())),
            events: Arc::new(KubeEventPublisher::new(client, CONTROLLER_NAME)),
            config,
            shutdown,
        }
    }

    /// Create a context for testing with mock clients
    #[cfg(test)]
    pub fn for_testing(
        kube: Arc<dyn ComponentKubeClient>,
        cluster_api: Arc<dyn ClusterApi>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            kube,
            cluster_api,
            events,
            config: Arc::new(OperatorConfig::default()),
            shutdown: CancellationToken::new(),
        }
    }

    fn component_context(&self) -> ComponentContext {
        ComponentContext::new(
            self.cluster_api.clone(),
            self.config.clone(),
            self.shutdown.child_token(),
        )
    }
}

/// Component status being assembled during one pass
struct PassStatus {
    status: CorralComponentStatus,
    now: DateTime<Utc>,
    changed: bool,
}

impl PassStatus {
    fn new(status: CorralComponentStatus, now: DateTime<Utc>) -> Self {
        Self {
            status,
            now,
            changed: false,
        }
    }

    fn record(
        &mut self,
        type_: &str,
        status: ConditionStatus,
        reason: &str,
        message: impl Into<String>,
    ) {
        let mut condition = Condition::new(type_, status, reason, message);
        condition.last_heartbeat_time = Some(self.now);
        self.changed |= self.status.update_condition_at(condition, self.now);
    }

    fn not_ready(&mut self, reason: &str, message: impl Into<String>) {
        self.record(
            component_conditions::READY,
            ConditionStatus::False,
            reason,
            message,
        );
    }

    /// Fold observed pods into the status; returns whether the component is ready
    fn observe_pods(&mut self, replicas: i32, pods: &[Pod]) -> bool {
        let ready_replicas =
            i32::try_from(pods.iter().filter(|p| is_pod_ready(p)).count()).unwrap_or(i32::MAX);
        let mut names: Vec<String> = pods.iter().map(|p| p.name_any()).collect();
        names.sort();

        if self.status.replicas != replicas
            || self.status.ready_replicas != ready_replicas
            || self.status.pods != names
        {
            self.status.replicas = replicas;
            self.status.ready_replicas = ready_replicas;
            self.status.pods = names;
            self.changed = true;
        }

        let ready = ready_replicas >= replicas;
        if ready {
            self.record(
                component_conditions::READY,
                ConditionStatus::True,
                reasons::READY,
                "",
            );
        } else {
            self.not_ready(
                reasons::NOT_READY,
                format!("{}/{} pods ready", ready_replicas, replicas),
            );
        }
        ready
    }
}

/// Reconcile a CorralComponent
///
/// Status is persisted only when a condition or the replica report
/// changed. A cancelled pass leaves the stored status untouched.
#[instrument(skip(component, ctx), fields(component = %component.name_any()))]
pub async fn reconcile(component: Arc<CorralComponent>, ctx: Arc<Context>) -> Result<Action, Error> {
    let name = component.name_any();
    let namespace = component.namespace().ok_or_else(|| {
        Error::validation_for_field(&name, "metadata.namespace", "CorralComponent must be namespaced")
    })?;
    debug!("reconciling component");

    let original = component.status.clone().unwrap_or_default();
    let prior_ready = ready_status(&original);
    let mut pass = PassStatus::new(original, Utc::now());

    let result = converge(&component, &namespace, &ctx, &mut pass).await;
    if matches!(result, Err(Error::Cancelled)) {
        debug!("pass cancelled, discarding status");
        return result;
    }

    if pass.changed {
        if let Err(e) = ctx
            .kube
            .patch_component_status(&namespace, &name, &pass.status)
            .await
        {
            warn!(error = %e, "failed to update component status");
            return result.and(Err(e));
        }
        publish_readiness(&component, &ctx, prior_ready, &pass.status).await;
    }

    result
}

/// Error policy for CorralComponent reconciliation
///
/// Dependencies that are still provisioning requeue on the short
/// interval, transient failures after [`RETRY_INTERVAL`], and errors
/// that need a spec change wait for one.
pub fn error_policy(component: Arc<CorralComponent>, error: &Error, ctx: Arc<Context>) -> Action {
    if error.is_ignorable() {
        debug!(%error, component = %component.name_any(), "waiting on dependencies");
        return Action::requeue(ctx.config.requeue_interval());
    }
    if error.is_retryable() {
        warn!(?error, component = %component.name_any(), "reconciliation failed");
        Action::requeue(RETRY_INTERVAL)
    } else {
        error!(?error, component = %component.name_any(), "reconciliation failed permanently");
        Action::await_change()
    }
}

async fn converge(
    component: &Arc<CorralComponent>,
    namespace: &str,
    ctx: &Context,
    pass: &mut PassStatus,
) -> Result<Action, Error> {
    let name = component.name_any();
    if !supported_components().contains(&name.as_str()) {
        pass.not_ready(
            reasons::UNSUPPORTED_TYPE,
            format!(
                "only supports the following components: {}",
                supported_components().join(", ")
            ),
        );
        return Ok(Action::await_change());
    }

    let requeue = Action::requeue(ctx.config.requeue_interval());
    let cctx = ctx.component_context();

    let Some(cluster) = cctx.guard(ctx.kube.get_cluster(namespace)).await? else {
        pass.record(
            component_conditions::CLUSTER_CONFIG_COMPLETED,
            ConditionStatus::False,
            reasons::CLUSTER_NOT_FOUND,
            "CorralCluster not found",
        );
        return Ok(requeue);
    };

    if !cluster.spec.config_completed {
        debug!("cluster configuration is not complete");
        pass.record(
            component_conditions::CLUSTER_CONFIG_COMPLETED,
            ConditionStatus::False,
            reasons::CONFIG_NOT_COMPLETED,
            "CorralCluster configuration is not complete",
        );
        return Ok(requeue);
    }
    pass.record(
        component_conditions::CLUSTER_CONFIG_COMPLETED,
        ConditionStatus::True,
        component_conditions::CLUSTER_CONFIG_COMPLETED,
        "",
    );

    if needs_package(&cluster, component) {
        let package = cctx.guard(ctx.kube.get_package(namespace)).await?;
        let loaded = package
            .as_ref()
            .and_then(|p| p.status.as_ref())
            .is_some_and(|s| s.is_condition_true(PACKAGE_LOADED));
        if !loaded {
            let message = match package {
                None => "CorralPackage not found",
                Some(_) => "CorralPackage is still loading",
            };
            pass.record(
                component_conditions::PACKAGE_READY,
                ConditionStatus::False,
                reasons::PACKAGE_NOT_READY,
                message,
            );
            return Ok(requeue);
        }
        pass.record(
            component_conditions::PACKAGE_READY,
            ConditionStatus::True,
            component_conditions::PACKAGE_READY,
            "",
        );
    }

    let mut handler = new_handler(component.clone(), Arc::new(cluster), &ctx.config)
        .ok_or_else(|| {
            Error::internal_with_context("reconciler", format!("no handler for {}", name))
        })?;

    if let Err(e) = prepare(handler.as_mut(), &cctx).await {
        return prerequisites_failed(pass, e, requeue);
    }

    if let Err(e) = write_resources(handler.as_ref(), component, &cctx).await {
        if !matches!(e, Error::Cancelled) {
            warn!(error = %e, "failed to write component resources");
            pass.not_ready(reasons::CREATE_RESOURCES_FAILED, e.to_string());
        }
        return Err(e);
    }

    if let Err(e) = handler.after(&cctx).await {
        if matches!(e, Error::Cancelled) {
            return Err(e);
        }
        warn!(error = %e, "after phase failed");
    }

    let pods = match handler.list_pods(&cctx).await {
        Ok(pods) => pods,
        Err(Error::Cancelled) => return Err(Error::Cancelled),
        Err(e) => {
            warn!(error = %e, "failed to list component pods");
            pass.not_ready(reasons::LIST_PODS_FAILED, e.to_string());
            return Err(e);
        }
    };

    let replicas = handler
        .as_replica_override()
        .and_then(|r| r.replicas())
        .or(component.spec.replicas)
        .unwrap_or(1);
    if pass.observe_pods(replicas, &pods) {
        Ok(Action::requeue(RESYNC_INTERVAL))
    } else {
        Ok(Action::requeue(NOT_READY_REQUEUE))
    }
}

/// Package-based installs wait for the package, except for priority components
fn needs_package(cluster: &CorralCluster, component: &CorralComponent) -> bool {
    cluster.spec.install_mode != InstallMode::FullOnline && !component.spec.priority_component
}

/// Installability gate, storage dispatch, then the handler's `before` phase
async fn prepare(handler: &mut dyn ComponentHandler, ctx: &ComponentContext) -> Result<(), Error> {
    handler.check_installable()?;
    set_storage_class_name(handler, ctx).await?;
    handler.before(ctx).await
}

fn prerequisites_failed(
    pass: &mut PassStatus,
    error: Error,
    requeue: Action,
) -> Result<Action, Error> {
    match error {
        Error::Cancelled => Err(Error::Cancelled),
        e if e.is_ignorable() => {
            debug!(error = %e, "prerequisites not ready");
            pass.not_ready(reasons::PREREQUISITES_NOT_READY, e.to_string());
            Ok(requeue)
        }
        e => {
            warn!(error = %e, "prerequisites check failed");
            pass.not_ready(reasons::PREREQUISITES_FAILED, e.to_string());
            Err(e)
        }
    }
}

/// Delete, create-if-absent, cluster-scoped create, then apply
async fn write_resources(
    handler: &dyn ComponentHandler,
    component: &CorralComponent,
    ctx: &ComponentContext,
) -> Result<(), Error> {
    let owner = component.controller_owner_ref(&());

    if let Some(deleter) = handler.as_delete_on_reconcile() {
        for res in deleter.resources_need_delete()? {
            if ctx.get(&res).await?.is_some() {
                info!(kind = res.kind(), name = %res.name(), "removing superseded resource");
                ctx.delete(&res).await?;
            }
        }
    }

    if let Some(creator) = handler.as_create_if_not_exists() {
        for res in creator.resources_create_if_not_exists()? {
            let res = owned(res, owner.as_ref());
            if ctx.create_if_absent(&res).await? {
                info!(kind = res.kind(), name = %res.name(), "created resource");
            }
        }
    }

    if let Some(creator) = handler.as_cluster_scoped() {
        for res in creator.create_cluster_scoped()? {
            ctx.create_if_absent(&res).await?;
        }
    }

    for res in handler.resources()? {
        ctx.apply(&owned(res, owner.as_ref())).await?;
    }
    Ok(())
}

/// Attach the component as controller of a namespaced object
fn owned(mut resource: ManagedResource, owner: Option<&OwnerReference>) -> ManagedResource {
    if let (Some(owner), Some(_)) = (owner, resource.namespace()) {
        resource
            .object
            .metadata
            .owner_references
            .get_or_insert_with(Vec::new)
            .push(owner.clone());
    }
    resource
}

fn ready_status(status: &CorralComponentStatus) -> Option<ConditionStatus> {
    status
        .get_condition(component_conditions::READY)
        .1
        .map(|c| c.status.clone())
}

async fn publish_readiness(
    component: &CorralComponent,
    ctx: &Context,
    prior: Option<ConditionStatus>,
    status: &CorralComponentStatus,
) {
    let Some(current) = status.get_condition(component_conditions::READY).1 else {
        return;
    };
    if prior.as_ref() == Some(&current.status) {
        return;
    }

    let type_ = if prior == Some(ConditionStatus::True) && current.status == ConditionStatus::False
    {
        EventType::Warning
    } else {
        EventType::Normal
    };
    let note = (!current.message.is_empty()).then(|| current.message.clone());
    ctx.events
        .publish(
            &component.object_ref(&()),
            type_,
            &current.reason,
            actions::RECONCILE,
            note,
        )
        .await;
}
