//! Controller runner - builds the controller futures
//!
//! Construction is kept separate from `main` so the binary only decides
//! configuration and startup order.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};
use tokio_util::sync::CancellationToken;

use corral_common::crd::{CorralComponent, CorralVolume};
use corral_common::OperatorConfig;

use crate::controller::{error_policy, reconcile, Context};
use crate::volume_controller::{self, VolumeContext};

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
///
/// Forces the API server to close idle watches before the client times out.
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Build the CorralComponent and CorralVolume controllers for the configured namespace
///
/// Cancelling `shutdown` stops the watches and aborts in-flight component
/// passes at their next cluster call.
pub fn build_controllers(
    client: Client,
    config: Arc<OperatorConfig>,
    shutdown: CancellationToken,
) -> Vec<Pin<Box<dyn Future<Output = ()> + Send>>> {
    let components: Api<CorralComponent> = Api::namespaced(client.clone(), &config.namespace);
    let volumes: Api<CorralVolume> = Api::namespaced(client.clone(), &config.namespace);
    tracing::info!(namespace = %config.namespace, "- CorralComponent controller");
    tracing::info!(namespace = %config.namespace, "- CorralVolume controller");

    let volume_ctx = Arc::new(VolumeContext::new(client.clone()));
    let ctx = Arc::new(Context::new(client, config, shutdown.clone()));

    let volume_shutdown = shutdown.clone();
    let volume_ctrl = Controller::new(volumes, WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS))
        .graceful_shutdown_on(async move { volume_shutdown.cancelled().await })
        .shutdown_on_signal()
        .run(
            volume_controller::reconcile,
            volume_controller::error_policy,
            volume_ctx,
        )
        .for_each(log_reconcile_result("Volume"));

    let component_ctrl = Controller::new(
        components,
        WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS),
    )
    .graceful_shutdown_on(async move { shutdown.cancelled().await })
    .shutdown_on_signal()
    .run(reconcile, error_policy, ctx)
    .for_each(log_reconcile_result("Component"));

    vec![Box::pin(component_ctrl), Box::pin(volume_ctrl)]
}

/// Creates a closure for logging reconciliation results.
fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
