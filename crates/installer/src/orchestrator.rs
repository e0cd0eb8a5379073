//! The four install verbs. The cluster is the only state: every verb
//! recomputes the manifest from the request and reads the rest live.

use std::{future::Future, sync::Arc, time::Instant};

use metrics::{counter, histogram};
use olm_core::{build_manifest, subscriptions, ApprovalMode, Gvk, InstallRequest, Object, RecordStatus};
use olm_kubehub::ClusterGateway;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    config::WaitConfig,
    error::InstallError,
    status::{StatusAggregator, StatusView},
    waiter::ResolutionWaiter,
};

pub struct Installer {
    gateway: Arc<dyn ClusterGateway>,
    waiter: ResolutionWaiter,
    aggregator: StatusAggregator,
}

impl Installer {
    pub fn new(gateway: Arc<dyn ClusterGateway>, config: WaitConfig) -> Self {
        Self {
            waiter: ResolutionWaiter::new(gateway.clone(), config),
            aggregator: StatusAggregator::new(gateway.clone()),
            gateway,
        }
    }

    pub fn waiter(&self) -> &ResolutionWaiter {
        &self.waiter
    }

    /// Objects a request implies. No cluster access.
    pub fn build_manifest(request: &InstallRequest) -> Vec<Object> {
        build_manifest(request)
    }

    /// Create the subscription, wait for its record to succeed, and return the verified status.
    pub async fn install(&self, request: &InstallRequest, cancel: &CancellationToken) -> Result<StatusView, InstallError> {
        let t0 = Instant::now();
        counter!("install_attempts", 1u64);
        let res = self.install_inner(request, cancel).await;
        match &res {
            Ok(_) => {
                histogram!("install_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
                counter!("install_ok", 1u64);
            }
            Err(e) => {
                counter!("install_err", 1u64);
                warn!(operator = %request.name, namespace = %request.namespace, error = %e, "install failed");
            }
        }
        res
    }

    async fn install_inner(&self, request: &InstallRequest, cancel: &CancellationToken) -> Result<StatusView, InstallError> {
        request.validate()?;
        if request.approval_mode == ApprovalMode::Manual {
            warn!(operator = %request.name, "manual approval: the install plan must be approved before the subscription resolves");
        }
        let subs = subscriptions(&build_manifest(request));

        info!(operator = %request.name, namespace = %request.namespace, channel = %request.channel, "creating subscription resources");
        guard(cancel, self.gateway.create(&subs)).await?.map_err(InstallError::CreateFailed)?;

        for sub in &subs {
            info!(subscription = %sub.key(), "waiting for subscription to install its version");
            self.waiter.resolve_and_await(sub.key(), cancel).await?;
        }

        let view = guard(cancel, self.aggregator.aggregate(&subs)).await?;
        self.verify(request, &view)?;
        info!(operator = %request.name, namespace = %request.namespace, "operator installed");
        Ok(view)
    }

    /// Confirm an existing install: the subscription still resolves and its record still
    /// succeeds. A missing subscription or record is `NotInstalled`, not a failure.
    pub async fn read_status(&self, request: &InstallRequest, cancel: &CancellationToken) -> Result<StatusView, InstallError> {
        let subs = subscriptions(&build_manifest(request));
        let not_installed = || InstallError::NotInstalled { name: request.name.clone(), namespace: request.namespace.clone() };

        for sub in &subs {
            match self.waiter.resolve_and_check(sub.key(), cancel).await {
                Ok(record) => info!(subscription = %sub.key(), record = %record.name, "resolved version present"),
                Err(InstallError::NotFound { gvk, key }) => {
                    info!(gvk = %gvk, key = %key, "install no longer present");
                    return Err(not_installed());
                }
                Err(e @ InstallError::ResolutionTimeout { .. }) => {
                    info!(subscription = %sub.key(), error = %e, "subscription has no resolved version");
                    return Err(not_installed());
                }
                Err(e) => return Err(e),
            }
        }

        let view = guard(cancel, self.aggregator.aggregate(&subs)).await?;
        if !view.has_installed_resources()? {
            return Err(not_installed());
        }
        Ok(view)
    }

    /// Delete the subscriptions and the records they resolved to. Refuses when nothing is
    /// installed, when a subscription never resolved, or when its record has not succeeded.
    pub async fn uninstall(&self, request: &InstallRequest, cancel: &CancellationToken) -> Result<(), InstallError> {
        let res = self.uninstall_inner(request, cancel).await;
        match &res {
            Ok(()) => counter!("uninstall_ok", 1u64),
            Err(e) => {
                counter!("uninstall_err", 1u64);
                warn!(operator = %request.name, namespace = %request.namespace, error = %e, "uninstall failed");
            }
        }
        res
    }

    async fn uninstall_inner(&self, request: &InstallRequest, cancel: &CancellationToken) -> Result<(), InstallError> {
        let subs = subscriptions(&build_manifest(request));
        let not_installed = || InstallError::NotInstalled { name: request.name.clone(), namespace: request.namespace.clone() };

        let view = guard(cancel, self.aggregator.aggregate(&subs)).await?;
        if !view.has_installed_resources()? {
            return Err(not_installed());
        }

        // Only a succeeded install may be removed. Every check runs before the first delete.
        let record_gvk = Gvk::cluster_service_version();
        let success = &self.waiter.config().success_phase;
        let mut doomed = subs.clone();
        for sub in &subs {
            let record_key = match guard(cancel, self.waiter.lookup(sub.key())).await? {
                Ok(Some(key)) => key,
                Ok(None) => {
                    info!(subscription = %sub.key(), "subscription has no resolved version; refusing to uninstall");
                    return Err(not_installed());
                }
                Err(InstallError::NotFound { gvk, key }) => {
                    info!(gvk = %gvk, key = %key, "install disappeared during uninstall pre-check");
                    return Err(not_installed());
                }
                Err(e) => return Err(e),
            };
            match guard(cancel, self.gateway.get(&record_key, &record_gvk)).await? {
                Ok(record) => {
                    let status: RecordStatus = record.status().map_err(|e| InstallError::malformed(&record, e))?;
                    if status.phase() != Some(success.as_str()) {
                        return Err(InstallError::NotSucceeded {
                            subscription: sub.key().clone(),
                            record: record_key,
                            phase: status.phase,
                        });
                    }
                    doomed.push(record);
                }
                Err(e) if e.is_not_found() => {
                    warn!(record = %record_key, "resolved version already gone; skipping");
                }
                Err(e) => return Err(InstallError::from_gateway(e)),
            }
        }

        info!(operator = %request.name, count = doomed.len(), "deleting operator resources");
        guard(cancel, self.gateway.delete(&doomed)).await?.map_err(InstallError::DeleteFailed)?;
        Ok(())
    }

    /// Move from `previous` to `desired`. Unchanged requests only re-verify; any change
    /// is a new install: the previous one is removed first.
    pub async fn update(
        &self,
        previous: &InstallRequest,
        desired: &InstallRequest,
        cancel: &CancellationToken,
    ) -> Result<StatusView, InstallError> {
        desired.validate()?;
        if previous == desired {
            let view = self.read_status(desired, cancel).await?;
            self.verify(desired, &view)?;
            return Ok(view);
        }
        info!(operator = %desired.name, from = %previous.channel, to = %desired.channel, "replacing install");
        match self.uninstall(previous, cancel).await {
            Ok(()) => {}
            Err(e) if e.is_not_installed() => info!(operator = %previous.name, "previous install already absent"),
            Err(e) => return Err(e),
        }
        self.install(desired, cancel).await
    }

    /// Subscriptions in `namespace` (all namespaces when empty), sorted by key.
    pub async fn list(&self, namespace: &str, cancel: &CancellationToken) -> Result<Vec<Object>, InstallError> {
        let mut subs = guard(cancel, self.gateway.list(namespace, &Gvk::subscription()))
            .await?
            .map_err(InstallError::from_gateway)?;
        subs.sort_by(|a, b| a.key().cmp(b.key()));
        Ok(subs)
    }

    /// Turn "reachable but not installed" into `VerificationFailed`; hard errors pass through.
    pub fn verify(&self, request: &InstallRequest, view: &StatusView) -> Result<(), InstallError> {
        if view.has_installed_resources()? {
            Ok(())
        } else {
            Err(InstallError::VerificationFailed { name: request.name.clone() })
        }
    }
}

/// Race `fut` against cancellation.
async fn guard<T>(cancel: &CancellationToken, fut: impl Future<Output = T>) -> Result<T, InstallError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(InstallError::Cancelled),
        out = fut => Ok(out),
    }
}
