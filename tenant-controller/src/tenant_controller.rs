use crate::{
    backoff::ExponentialBackoff,
    client_config::{ClientConfig, ClientConfigLoader},
    clients::{NamespaceClient, RoleBindingClient, TenantClient},
    errors::{ControllerError, ExtKubeApiError},
    metrics::ControllerMetrics,
    namespace_manager::NamespaceManager,
    role_binding::reconcile_tenant_role_binding,
    tenant_fetcher::TenantFetcher,
    tenant_modifications::TenantModifications,
};

use futures::StreamExt;
use kube::{Api, ResourceExt};
use kube_runtime::{
    controller::{self, Action, Controller},
    watcher,
};
use std::{
    collections::HashSet,
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};
use tenant_controller_apis::{
    Condition, FINALIZER, READY, Tenant, TenantProgress, TenantResult,
};
use tokio::{sync::mpsc, time::sleep};

pub(crate) const SUCCESS: &'static str = "Success";
pub(crate) const FAILED: &'static str = "Failed";
pub(crate) const DEPENDENT_RESOURCE_STATE: &'static str = "DependentResourceState";

const MSG_NAMESPACE_CREATION_FAILED: &'static str = "Failed to create a new tenant namespace.";
const MSG_ROLE_BINDING_CREATION_FAILED: &'static str =
    "Failed to initialize a new tenant namespace because the RoleBinding could not be created.";

fn msg_namespace_missing(namespace: &str) -> String {
    format!(
        "The tenant namespace {:?} does not exist anymore. This issue must be analyzed and fixed by an operator.",
        namespace
    )
}

fn msg_role_binding_outdated(namespace: &str) -> String {
    format!(
        "The RoleBinding in tenant namespace {:?} is outdated but could not be updated.",
        namespace
    )
}

fn msg_ready(namespace: &str) -> String {
    format!("The tenant namespace {:?} is ready.", namespace)
}

/// The collaborators of the [`TenantController`].
pub(crate) struct Dependencies {
    pub tenants: Arc<dyn TenantClient>,
    pub fetcher: Arc<dyn TenantFetcher>,
    pub config_loader: Arc<dyn ClientConfigLoader>,
    pub namespaces: Arc<dyn NamespaceClient>,
    pub role_bindings: Arc<dyn RoleBindingClient>,
    pub metrics: Arc<dyn ControllerMetrics>,
}

/// Provisions one namespace per [`Tenant`], keeps the tenant RoleBinding in
/// that namespace in sync and tears both down when the Tenant is deleted.
pub(crate) struct TenantController {
    deps: Dependencies,
    /// Client namespaces to handle, `None` means all.
    watch_namespaces: Option<HashSet<String>>,
    resync_interval: Duration,
    backoff: ExponentialBackoff,
    sync_count: AtomicU64,
}

fn mark_ready(tenant: &mut Tenant, namespace: &str) {
    let message = msg_ready(namespace);
    let status = tenant.status_mut();
    status.progress = Some(TenantProgress::Ready);
    status.result = Some(TenantResult::Success);
    status.message = message.clone();
    status.update_condition(Condition::new(READY, Some(true), SUCCESS, message));
}

fn mark_not_ready(tenant: &mut Tenant, reason: &str, message: String, result: TenantResult) {
    let status = tenant.status_mut();
    if status.tenant_namespace_name.is_empty() {
        status.progress = Some(TenantProgress::Initializing);
    }
    status.result = Some(result);
    status.message = message.clone();
    status.update_condition(Condition::new(READY, Some(false), reason, message));
}

impl TenantController {
    pub fn new(
        deps: Dependencies,
        watch_namespaces: Option<HashSet<String>>,
        resync_interval: Duration,
    ) -> Self {
        Self {
            deps,
            watch_namespaces,
            resync_interval,
            backoff: ExponentialBackoff::default(),
            sync_count: AtomicU64::new(0),
        }
    }

    /// Number of successfully completed syncs.
    pub fn sync_count(&self) -> u64 {
        self.sync_count.load(Ordering::SeqCst)
    }

    fn is_watched(&self, namespace: &str) -> bool {
        self.watch_namespaces
            .as_ref()
            .map_or(true, |v| v.contains(namespace))
    }

    fn namespace_manager(&self, config: &ClientConfig) -> NamespaceManager {
        NamespaceManager::new(
            self.deps.namespaces.clone(),
            config.tenant_namespace_prefix(),
            config.tenant_namespace_suffix_length(),
        )
    }

    async fn refresh_tenant_count(&self) {
        match self.deps.fetcher.count().await {
            Ok(count) => self.deps.metrics.set_tenant_count(count as u64),
            Err(e) => warn!("failed to count Tenant objects: {}", e),
        }
    }

    /// Forget the retry state of a Tenant that is gone and update the tenant count.
    async fn tenant_deleted(&self, tenant: &Tenant) {
        let key = tenant.id();
        debug!("Tenant {} deleted", key);
        self.backoff.reset(key.as_str());
        self.refresh_tenant_count().await;
    }

    /// Sync the Tenant identified by the work queue key `namespace/name`.
    pub async fn sync_handler(&self, key: &str) -> Result<(), ControllerError> {
        let start = Instant::now();
        let tenant = match self.deps.fetcher.by_key(key).await? {
            Some(tenant) => tenant,
            None => {
                debug!("Tenant {} does no longer exist", key);
                return Ok(());
            }
        };
        let mut tenant = TenantModifications::new(tenant);
        let client_namespace = tenant.namespace().unwrap_or_default();
        let config = match self.deps.config_loader.load(client_namespace.as_str()) {
            Ok(config) => config,
            Err(e) if e.is_configuration() => {
                warn!("invalid configuration for Tenant {}: {}", key, e);
                mark_not_ready(
                    &mut tenant,
                    FAILED,
                    format!("Failed to load the tenant configuration: {}", e),
                    TenantResult::ErrorContent,
                );
                tenant.replace_status(self.deps.tenants.as_ref()).await?;
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        if tenant.is_deleted() {
            if !tenant.has_finalizer(FINALIZER) {
                debug!("Tenant {} is being deleted and already cleaned up", key);
                return Ok(());
            }
            self.delete_tenant_namespaces(&tenant, &config).await?;
            tenant.remove_finalizer(FINALIZER);
            tenant
                .replace_spec_if_exists(self.deps.tenants.as_ref())
                .await?;
            info!("removed finalizer from deleted Tenant {}", key);
        } else {
            // The finalizer must be persisted before anything gets provisioned.
            if tenant.add_finalizer(FINALIZER) {
                tenant.replace_spec(self.deps.tenants.as_ref()).await?;
                debug!("added finalizer to Tenant {}", key);
            }
            let result = self.reconcile(&mut tenant, &config).await;
            if let Err(e) = tenant.replace_status(self.deps.tenants.as_ref()).await {
                if let Err(reconcile_error) = &result {
                    debug!(
                        "reconcile error of Tenant {} superseded by status update error: {}",
                        key, reconcile_error
                    );
                }
                return Err(e);
            }
            result?;
        }

        self.sync_count.fetch_add(1, Ordering::SeqCst);
        self.deps
            .metrics
            .sync_succeeded(client_namespace.as_str(), start.elapsed());
        self.refresh_tenant_count().await;
        Ok(())
    }

    async fn delete_tenant_namespaces(
        &self,
        tenant: &Tenant,
        config: &ClientConfig,
    ) -> Result<(), ControllerError> {
        let manager = self.namespace_manager(config);
        for namespace in manager.list(tenant.name_any().as_str()).await? {
            manager.delete(namespace.as_str()).await?;
            info!(
                "deleted tenant namespace {} of Tenant {}",
                namespace,
                tenant.id()
            );
        }
        Ok(())
    }

    async fn reconcile(
        &self,
        tenant: &mut TenantModifications,
        config: &ClientConfig,
    ) -> Result<(), ControllerError> {
        if tenant.tenant_namespace_name().is_empty() {
            self.reconcile_uninitialized(tenant, config).await
        } else {
            self.reconcile_initialized(tenant, config).await
        }
    }

    /// Reuse a namespace created by an interrupted earlier sync or create a new one.
    async fn find_or_create_namespace(
        &self,
        manager: &NamespaceManager,
        tenant_name: &str,
    ) -> Result<String, ControllerError> {
        let mut existing = manager.list(tenant_name).await?;
        existing.sort();
        if existing.len() > 1 {
            warn!(
                "found {} namespaces for tenant {}, using {}",
                existing.len(),
                tenant_name,
                existing[0]
            );
        }
        match existing.into_iter().next() {
            Some(namespace) => {
                info!("reusing namespace {} for tenant {}", namespace, tenant_name);
                Ok(namespace)
            }
            None => manager.create(tenant_name, Default::default()).await,
        }
    }

    async fn reconcile_uninitialized(
        &self,
        tenant: &mut TenantModifications,
        config: &ClientConfig,
    ) -> Result<(), ControllerError> {
        let manager = self.namespace_manager(config);
        let namespace = match self
            .find_or_create_namespace(&manager, tenant.name_any().as_str())
            .await
        {
            Ok(namespace) => namespace,
            Err(e) => {
                match &e {
                    ControllerError::KubeApi(k) if k.is_already_exists() => warn!(
                        "namespace name for Tenant {} is already taken by a namespace not labeled for it: {}",
                        tenant.id(),
                        e
                    ),
                    _ => error!("failed to create namespace for Tenant {}: {}", tenant.id(), e),
                }
                mark_not_ready(
                    tenant,
                    FAILED,
                    MSG_NAMESPACE_CREATION_FAILED.to_string(),
                    TenantResult::ErrorInfra,
                );
                return Err(e);
            }
        };
        let (_, result) = reconcile_tenant_role_binding(
            self.deps.role_bindings.as_ref(),
            &tenant.modified,
            namespace.as_str(),
            config,
        )
        .await;
        if let Err(e) = result {
            error!(
                "failed to create RoleBinding in namespace {} for Tenant {}: {}",
                namespace,
                tenant.id(),
                e
            );
            mark_not_ready(
                tenant,
                FAILED,
                MSG_ROLE_BINDING_CREATION_FAILED.to_string(),
                TenantResult::ErrorInfra,
            );
            return Err(e);
        }
        tenant.status_mut().tenant_namespace_name = namespace.clone();
        mark_ready(tenant, namespace.as_str());
        info!(
            "initialized Tenant {} with namespace {}",
            tenant.id(),
            namespace
        );
        Ok(())
    }

    async fn reconcile_initialized(
        &self,
        tenant: &mut TenantModifications,
        config: &ClientConfig,
    ) -> Result<(), ControllerError> {
        let namespace = tenant.tenant_namespace_name().to_string();
        let exists = match self.deps.namespaces.get(namespace.as_str()).await {
            Ok(ns) => ns.metadata.deletion_timestamp.is_none(),
            Err(e) if e.is_not_found() => false,
            Err(e) => Err(e)?,
        };
        if !exists {
            mark_not_ready(
                tenant,
                DEPENDENT_RESOURCE_STATE,
                msg_namespace_missing(namespace.as_str()),
                TenantResult::ErrorInfra,
            );
            return Err(ControllerError::DependentResourceState(format!(
                "tenant namespace {:?} of Tenant {} does not exist anymore",
                namespace,
                tenant.id()
            )));
        }
        let (needs_update, result) = reconcile_tenant_role_binding(
            self.deps.role_bindings.as_ref(),
            &tenant.modified,
            namespace.as_str(),
            config,
        )
        .await;
        if let Err(e) = result {
            if needs_update {
                mark_not_ready(
                    tenant,
                    DEPENDENT_RESOURCE_STATE,
                    msg_role_binding_outdated(namespace.as_str()),
                    TenantResult::ErrorInfra,
                );
            }
            return Err(e);
        }
        mark_ready(tenant, namespace.as_str());
        Ok(())
    }

    /// Controller triggers this whenever a Tenant changed or its resync is due.
    async fn reconcile_tenant(
        tenant: Arc<Tenant>,
        ctx: Arc<Self>,
    ) -> Result<Action, ControllerError> {
        let key = tenant.id();
        if !ctx.is_watched(tenant.namespace().unwrap_or_default().as_str()) {
            debug!(
                "Ignore {} as its namespace is not in the set of namespaces to watch for Tenant objects",
                key
            );
            return Ok(Action::await_change());
        }
        ctx.sync_handler(key.as_str()).await?;
        ctx.backoff.reset(key.as_str());
        Ok(Action::requeue(ctx.resync_interval))
    }

    /// The controller triggers this on reconcile errors
    fn error_policy(tenant: Arc<Tenant>, error: &ControllerError, ctx: Arc<Self>) -> Action {
        let key = tenant.id();
        let delay = ctx.backoff.next_backoff(key.as_str());
        if error.is_conflict() {
            debug!("sync of Tenant {} conflicted, retrying in {:?}: {}", key, delay, error);
        } else {
            warn!("sync of Tenant {} failed, retrying in {:?}: {}", key, delay, error);
        }
        ctx.deps.metrics.sync_failed();
        Action::requeue(delay)
    }

    /// Run `parallelism` workers until `stop` resolves. Deleted Tenants are
    /// not reconciled, they are reported through `deletions` instead.
    pub async fn run(
        self,
        api: Api<Tenant>,
        parallelism: u16,
        mut deletions: mpsc::UnboundedReceiver<Tenant>,
        stop: impl Future<Output = ()> + Send + Sync + 'static,
    ) -> Result<(), ControllerError> {
        if parallelism == 0 {
            return Err(ControllerError::Configuration(
                "number of workers must be positive".to_string(),
            ));
        }
        let ctx = Arc::new(self);
        let deletion_ctx = ctx.clone();
        let deletions = async move {
            while let Some(tenant) = deletions.recv().await {
                deletion_ctx.tenant_deleted(&tenant).await;
            }
            warn!("Tenant deletion notifications ended");
            futures::future::pending::<()>().await
        };
        info!("starting Tenant controller with {} workers", parallelism);
        let controller = Controller::new(api, watcher::Config::default())
            .with_config(controller::Config::default().concurrency(parallelism))
            .graceful_shutdown_on(stop)
            .run(Self::reconcile_tenant, Self::error_policy, ctx.clone())
            .for_each(|res| async move {
                match res {
                    Ok(o) => {
                        debug!("reconciled {:?}", o);
                    }
                    Err(e) => match e {
                        a @ controller::Error::QueueError { .. } => {
                            warn!("reconcile failed: {:?}", a);
                            // Slow down on errors caused by missing CRDs or permissions.
                            sleep(Duration::from_secs(30)).await;
                        }
                        a @ controller::Error::ObjectNotFound { .. } => {
                            debug!("reconcile failed: {:?}", a);
                        }
                        a @ controller::Error::ReconcilerFailed { .. } => {
                            debug!("reconcile failed: {:?}", a);
                        }
                        e => {
                            warn!("reconcile failed: {:?}", e);
                        }
                    },
                }
            });
        tokio::select! {
            _ = controller => (),
            _ = deletions => (),
        };
        info!("Tenant controller stopped after {} syncs", ctx.sync_count());
        Ok(())
    }
}
