//! Resolution waiter.
//!
//! A subscription is a pointer: its controller fills in `status.installedCSV`
//! some time after creation, and only the record it points at carries the
//! phase that matters. Both hops are asynchronous, so they are awaited as two
//! separate bounded polls:
//!
//! 1. resolution: poll the subscription until it names a record;
//! 2. convergence: poll that record until its phase is the success phase,
//!    stopping early on a failure phase.
//!
//! Every poll honours the cancellation token at each iteration and never
//! sleeps past its deadline.

use std::{future::Future, sync::Arc, time::Duration};

use metrics::counter;
use olm_core::{Gvk, ObjectKey, RecordStatus, SubscriptionStatus};
use olm_kubehub::ClusterGateway;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{config::WaitConfig, error::InstallError};

/// How convergence treats a record that does not exist (yet).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordAbsence {
    /// Keep polling: the record is created asynchronously after resolution.
    Wait,
    /// Fail with `NotFound` right away.
    Fail,
}

/// One poll attempt's result.
enum Step<T> {
    Ready(T),
    /// Not there yet; carries the state observed this round, if any.
    Pending(Option<String>),
}

/// Why a poll loop stopped without a value.
enum Stop {
    TimedOut { last: Option<String> },
    Failed(InstallError),
}

impl From<InstallError> for Stop {
    fn from(e: InstallError) -> Self {
        Stop::Failed(e)
    }
}

pub struct ResolutionWaiter {
    gateway: Arc<dyn ClusterGateway>,
    config: WaitConfig,
}

impl ResolutionWaiter {
    pub fn new(gateway: Arc<dyn ClusterGateway>, config: WaitConfig) -> Self {
        Self { gateway, config }
    }

    pub fn config(&self) -> &WaitConfig {
        &self.config
    }

    /// Resolve the subscription's record and wait for it to succeed (install semantics).
    pub async fn resolve_and_await(&self, subscription: &ObjectKey, cancel: &CancellationToken) -> Result<ObjectKey, InstallError> {
        let record = self.resolve(subscription, cancel).await?;
        self.await_convergence(subscription, &record, RecordAbsence::Wait, cancel).await?;
        Ok(record)
    }

    /// Same two legs, but a vanished record fails at once. Used to re-check an existing install.
    pub async fn resolve_and_check(&self, subscription: &ObjectKey, cancel: &CancellationToken) -> Result<ObjectKey, InstallError> {
        let record = self.resolve(subscription, cancel).await?;
        self.await_convergence(subscription, &record, RecordAbsence::Fail, cancel).await?;
        Ok(record)
    }

    /// Single read of the subscription's record reference; `None` while unresolved.
    pub async fn lookup(&self, subscription: &ObjectKey) -> Result<Option<ObjectKey>, InstallError> {
        let sub = self.gateway.get(subscription, &Gvk::subscription()).await.map_err(InstallError::from_gateway)?;
        let status: SubscriptionStatus = sub.status().map_err(|e| InstallError::malformed(&sub, e))?;
        Ok(status.resolved().map(|name| ObjectKey::new(subscription.namespace.clone(), name)))
    }

    /// Leg 1: poll until the subscription names its resolved-version record.
    pub async fn resolve(&self, subscription: &ObjectKey, cancel: &CancellationToken) -> Result<ObjectKey, InstallError> {
        let gvk = &Gvk::subscription();
        let timeout = self.config.resolution_timeout;
        let res = self
            .poll("resolution", subscription, timeout, cancel, move || async move {
                let sub = self.gateway.get(subscription, gvk).await.map_err(InstallError::from_gateway)?;
                let status: SubscriptionStatus = sub.status().map_err(|e| InstallError::malformed(&sub, e))?;
                Ok(match status.resolved() {
                    Some(name) => Step::Ready(ObjectKey::new(subscription.namespace.clone(), name)),
                    None => Step::Pending(status.state.clone()),
                })
            })
            .await;
        match res {
            Ok(record) => {
                info!(subscription = %subscription, record = %record.name, "subscription resolved");
                Ok(record)
            }
            Err(Stop::TimedOut { last }) => {
                Err(InstallError::ResolutionTimeout { subscription: subscription.clone(), waited: timeout, last_state: last })
            }
            Err(Stop::Failed(e)) => Err(e),
        }
    }

    /// Leg 2: poll the record's phase until it is the success phase.
    pub async fn await_convergence(
        &self,
        subscription: &ObjectKey,
        record: &ObjectKey,
        absence: RecordAbsence,
        cancel: &CancellationToken,
    ) -> Result<(), InstallError> {
        let gvk = &Gvk::cluster_service_version();
        let timeout = self.config.convergence_timeout;
        let res = self
            .poll("convergence", record, timeout, cancel, move || async move {
                let live = match self.gateway.get(record, gvk).await {
                    Ok(o) => o,
                    Err(e) if e.is_not_found() && absence == RecordAbsence::Wait => return Ok(Step::Pending(None)),
                    Err(e) => return Err(InstallError::from_gateway(e)),
                };
                let status: RecordStatus = live.status().map_err(|e| InstallError::malformed(&live, e))?;
                match status.phase() {
                    Some(p) if p == self.config.success_phase => Ok(Step::Ready(())),
                    Some(p) if self.config.is_failure(p) => Err(InstallError::InstallFailed {
                        subscription: subscription.clone(),
                        record: record.clone(),
                        phase: p.to_string(),
                        reason: status.reason.clone(),
                        message: status.message.clone(),
                    }),
                    other => Ok(Step::Pending(other.map(str::to_string))),
                }
            })
            .await;
        match res {
            Ok(()) => {
                info!(record = %record.name, phase = %self.config.success_phase, "record converged");
                Ok(())
            }
            Err(Stop::TimedOut { last }) => Err(InstallError::ConvergenceTimeout {
                subscription: subscription.clone(),
                record: record.clone(),
                waited: timeout,
                last_phase: last,
            }),
            Err(Stop::Failed(e)) => Err(e),
        }
    }

    /// Fixed-interval poll bounded by `timeout`. Each attempt and each sleep race
    /// the cancellation token and the deadline, so a stalled read cannot overrun it.
    async fn poll<T, F, Fut>(
        &self,
        leg: &'static str,
        target: &ObjectKey,
        timeout: Duration,
        cancel: &CancellationToken,
        mut attempt: F,
    ) -> Result<T, Stop>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Step<T>, InstallError>>,
    {
        let deadline = Instant::now() + timeout;
        let mut last: Option<String> = None;
        loop {
            counter!("wait_polls", 1u64);
            let step = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Stop::Failed(InstallError::Cancelled)),
                step = attempt() => step?,
                _ = tokio::time::sleep_until(deadline) => {
                    warn!(leg, target = %target, "attempt still in flight at deadline");
                    return Err(Stop::TimedOut { last });
                }
            };
            match step {
                Step::Ready(v) => return Ok(v),
                Step::Pending(Some(state)) if last.as_deref() != Some(state.as_str()) => {
                    info!(leg, target = %target, state = %state, "waiting");
                    last = Some(state);
                }
                Step::Pending(_) => {}
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Stop::TimedOut { last });
            }
            let nap = self.config.poll_interval.min(deadline - now);
            debug!(leg, target = %target, nap_ms = nap.as_millis() as u64, "not ready; sleeping");
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Stop::Failed(InstallError::Cancelled)),
                _ = tokio::time::sleep(nap) => {}
            }
        }
    }
}
