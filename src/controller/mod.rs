//! Profile state controller
//!
//! Wires the pieces together:
//!
//! - one [`Informer`] per watched kind keeps a reflector store current and
//!   turns changes into keys via [`translate`]
//! - keys go through a shared [`WorkQueue`]
//! - a [`WorkerPool`] drains the queue into the [`LabelReconciler`], which
//!   reads from the stores and writes labels back
//!
//! Informers never call the reconciler directly; the queue decouples the
//! rate of watch events from the amount of reconciliation work.

pub mod keys;
pub mod reconciler;
pub mod worker;

use std::sync::Arc;

use k8s_openapi::api::core::v1::{Namespace, PersistentVolumeClaim, Pod};
use k8s_openapi::api::rbac::v1::RoleBinding;
use kube::runtime::reflector::{self, store::Writer};
use kube::{Api, Client};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::cache::{Informer, KubeResourceCache};
use crate::config::{ExceptionList, PolicyConfig};
use crate::crd::Profile;
use crate::queue::WorkQueue;
use crate::{Error, Result, DEFAULT_WORKERS};

pub use keys::{translate, ObjectHandle, ReconciliationKey, ResourceEvent, ResourceKind, Watched};
pub use reconciler::{
    KubeLabelWriter, LabelPatch, LabelReconciler, LabelWriter, Reconcile, ReconcileOutcome,
};
pub use worker::{process_next_item, WorkerPool};

/// Field manager recorded on label writes
pub const FIELD_MANAGER: &str = "profile-state-controller";

/// Name of the shared work queue
const QUEUE_NAME: &str = "profiles";

/// Runtime settings for the controller
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// Number of concurrent workers
    pub workers: usize,
    /// Comparison lists for the policy rules
    pub policy: PolicyConfig,
    /// Per-policy excepted subjects
    pub exceptions: ExceptionList,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            policy: PolicyConfig::default(),
            exceptions: ExceptionList::empty(),
        }
    }
}

impl ControllerConfig {
    /// Reject settings the controller cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::config("workers must be at least 1, got 0"));
        }
        Ok(())
    }
}

/// Runs the informers and worker pool against a cluster
pub struct ControllerRunner {
    client: Client,
    config: ControllerConfig,
}

impl ControllerRunner {
    /// Create a runner for the given client and settings
    pub fn new(client: Client, config: ControllerConfig) -> Self {
        Self { client, config }
    }

    /// Run until `shutdown` is cancelled
    ///
    /// Workers start only once every store has finished its initial list.
    /// On cancellation the queue stops handing out keys, in-flight
    /// reconciliations finish and the informers are stopped.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        self.config.validate()?;
        let ControllerConfig {
            workers,
            policy,
            exceptions,
        } = self.config;

        let queue = WorkQueue::new(QUEUE_NAME);
        let informer_shutdown = shutdown.child_token();

        let (profiles, profile_writer) = reflector::store::<Profile>();
        let (namespaces, namespace_writer) = reflector::store::<Namespace>();
        let (pods, pod_writer) = reflector::store::<Pod>();
        let (role_bindings, role_binding_writer) = reflector::store::<RoleBinding>();
        let (claims, claim_writer) = reflector::store::<PersistentVolumeClaim>();

        info!("starting informers");
        let informers = vec![
            spawn_informer(&self.client, profile_writer, &queue, &informer_shutdown),
            spawn_informer(&self.client, namespace_writer, &queue, &informer_shutdown),
            spawn_informer(&self.client, pod_writer, &queue, &informer_shutdown),
            spawn_informer(&self.client, role_binding_writer, &queue, &informer_shutdown),
            spawn_informer(&self.client, claim_writer, &queue, &informer_shutdown),
        ];

        let cache = KubeResourceCache::new(profiles, namespaces, pods, role_bindings, claims);

        info!("waiting for caches to sync");
        let synced = tokio::select! {
            _ = shutdown.cancelled() => None,
            result = cache.wait_until_synced() => Some(result),
        };
        match synced {
            None => {
                info!("shutdown requested before caches synced");
                stop(queue, informer_shutdown, informers).await;
                return Ok(());
            }
            Some(Err(e)) => {
                error!(error = %e, "cache sync failed");
                stop(queue, informer_shutdown, informers).await;
                return Err(e);
            }
            Some(Ok(())) => {}
        }

        info!(workers, queued = queue.len(), "caches synced, starting workers");
        let reconciler = Arc::new(LabelReconciler::new(
            Arc::new(cache),
            Arc::new(KubeLabelWriter::new(self.client.clone())),
            Arc::new(policy),
            Arc::new(exceptions),
        ));
        let pool = tokio::spawn(WorkerPool::new(queue.clone(), reconciler, workers).run());

        shutdown.cancelled().await;
        info!("shutdown requested, draining workers");

        queue.shut_down();
        if let Err(e) = pool.await {
            error!(error = %e, "worker pool task failed");
        }
        stop(queue, informer_shutdown, informers).await;

        info!("controller stopped");
        Ok(())
    }
}

fn spawn_informer<K: Watched>(
    client: &Client,
    writer: Writer<K>,
    queue: &WorkQueue<ReconciliationKey>,
    shutdown: &CancellationToken,
) -> JoinHandle<()> {
    let api: Api<K> = Api::all(client.clone());
    tokio::spawn(Informer::new(writer).run(api, queue.clone(), shutdown.clone()))
}

async fn stop(
    queue: WorkQueue<ReconciliationKey>,
    informer_shutdown: CancellationToken,
    informers: Vec<JoinHandle<()>>,
) {
    queue.shut_down();
    informer_shutdown.cancel();
    queue.wait_for_idle().await;
    for result in futures::future::join_all(informers).await {
        if let Err(e) = result {
            error!(error = %e, "informer task failed");
        }
    }
}
