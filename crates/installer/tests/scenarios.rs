#![forbid(unsafe_code)]

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use olm_core::{Gvk, InstallRequest, Object, ObjectKey};
use olm_installer::{CancellationToken, InstallError, Installer, Verdict, WaitConfig};
use olm_kubehub::{ClusterGateway, GatewayError, MemoryGateway, Reactor};
use serde_json::json;
use tokio::time::Instant;

const NS: &str = "operators";

fn cfg() -> WaitConfig {
    WaitConfig {
        poll_interval: Duration::from_secs(1),
        resolution_timeout: Duration::from_secs(10),
        convergence_timeout: Duration::from_secs(30),
        ..WaitConfig::default()
    }
}

fn request(channel: &str) -> InstallRequest {
    InstallRequest::new("etcd", channel).namespace(NS)
}

fn sub_key() -> ObjectKey {
    ObjectKey::new(NS, "etcd")
}

fn csv(name: &str, status: serde_json::Value) -> Object {
    Object::from_raw(json!({
        "apiVersion": "operators.coreos.com/v1alpha1",
        "kind": "ClusterServiceVersion",
        "metadata": {"name": name, "namespace": NS}
    }))
    .unwrap()
    .with_status(status)
}

/// Controller stand-in: a new subscription resolves to `<name>.<channel>` whose record has `status`.
fn olm(status: serde_json::Value) -> Reactor {
    Arc::new(move |o: &Object| {
        if !o.is_kind(&Gvk::subscription()) {
            return Vec::new();
        }
        let channel = o.raw()["spec"]["channel"].as_str().unwrap_or_default();
        let record = format!("{}.{}", o.key().name, channel);
        vec![
            o.clone().with_status(json!({"installedCSV": record, "state": "AtLatestKnown"})),
            csv(&record, status.clone()),
        ]
    })
}

fn setup(gw: MemoryGateway) -> (Arc<MemoryGateway>, Installer) {
    let gw = Arc::new(gw);
    let installer = Installer::new(gw.clone(), cfg());
    (gw, installer)
}

#[tokio::test(start_paused = true)]
async fn install_reaches_success_and_reports_installed() {
    let (gw, inst) = setup(MemoryGateway::with_reactor(olm(json!({"phase": "Succeeded"}))));
    let cancel = CancellationToken::new();

    let view = inst.install(&request("stable"), &cancel).await.unwrap();
    assert_eq!(view.verdict(), Verdict::Installed);
    assert_eq!(view.objects.len(), 1);
    assert!(gw.contains(&Gvk::cluster_service_version(), &ObjectKey::new(NS, "etcd.stable")));

    let again = inst.read_status(&request("stable"), &cancel).await.unwrap();
    assert_eq!(again.verdict(), Verdict::Installed);
    assert_eq!(again.summary().objects[0].detail.as_deref(), Some("installed etcd.stable"));
}

#[tokio::test(start_paused = true)]
async fn failed_phase_ends_wait_at_once_with_diagnostics() {
    let status = json!({"phase": "Failed", "reason": "InstallComponentFailed", "message": "install strategy failed"});
    let (_gw, inst) = setup(MemoryGateway::with_reactor(olm(status)));
    let t0 = Instant::now();

    let err = inst.install(&request("stable"), &CancellationToken::new()).await.unwrap_err();
    assert!(t0.elapsed() < Duration::from_secs(1));
    match &err {
        InstallError::InstallFailed { subscription, record, phase, reason, message } => {
            assert_eq!(subscription, &sub_key());
            assert_eq!(record.name, "etcd.stable");
            assert_eq!(phase, "Failed");
            assert_eq!(reason.as_deref(), Some("InstallComponentFailed"));
            assert_eq!(message.as_deref(), Some("install strategy failed"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(err.to_string().contains("install strategy failed"));
}

#[tokio::test(start_paused = true)]
async fn subscription_deleted_out_of_band_reads_not_installed() {
    let (gw, inst) = setup(MemoryGateway::with_reactor(olm(json!({"phase": "Succeeded"}))));
    let cancel = CancellationToken::new();
    inst.install(&request("stable"), &cancel).await.unwrap();

    gw.remove(&Gvk::subscription(), &sub_key());
    let err = inst.read_status(&request("stable"), &cancel).await.unwrap_err();
    assert!(err.is_not_installed(), "{err}");
}

#[tokio::test(start_paused = true)]
async fn record_deleted_out_of_band_reads_not_installed() {
    let (gw, inst) = setup(MemoryGateway::with_reactor(olm(json!({"phase": "Succeeded"}))));
    let cancel = CancellationToken::new();
    inst.install(&request("stable"), &cancel).await.unwrap();

    gw.remove(&Gvk::cluster_service_version(), &ObjectKey::new(NS, "etcd.stable"));
    let t0 = Instant::now();
    let err = inst.read_status(&request("stable"), &cancel).await.unwrap_err();
    assert!(err.is_not_installed(), "{err}");
    assert!(t0.elapsed() < Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn uninstall_removes_subscription_and_record() {
    let (gw, inst) = setup(MemoryGateway::with_reactor(olm(json!({"phase": "Succeeded"}))));
    let cancel = CancellationToken::new();
    inst.install(&request("stable"), &cancel).await.unwrap();

    inst.uninstall(&request("stable"), &cancel).await.unwrap();
    let deleted: Vec<_> = gw.deleted().into_iter().map(|(g, k)| (g.kind, k.name)).collect();
    assert_eq!(
        deleted,
        vec![
            ("Subscription".to_string(), "etcd".to_string()),
            ("ClusterServiceVersion".to_string(), "etcd.stable".to_string()),
        ]
    );
    assert!(gw.is_empty());

    let err = inst.read_status(&request("stable"), &cancel).await.unwrap_err();
    assert!(err.is_not_installed());
}

#[tokio::test(start_paused = true)]
async fn uninstall_of_absent_operator_deletes_nothing() {
    let (gw, inst) = setup(MemoryGateway::new());
    let err = inst.uninstall(&request("stable"), &CancellationToken::new()).await.unwrap_err();
    assert!(err.is_not_installed());
    assert_eq!(gw.delete_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn uninstall_with_record_already_gone_still_deletes_subscription() {
    let (gw, inst) = setup(MemoryGateway::with_reactor(olm(json!({"phase": "Succeeded"}))));
    let cancel = CancellationToken::new();
    inst.install(&request("stable"), &cancel).await.unwrap();
    gw.remove(&Gvk::cluster_service_version(), &ObjectKey::new(NS, "etcd.stable"));

    inst.uninstall(&request("stable"), &cancel).await.unwrap();
    assert_eq!(gw.deleted(), vec![(Gvk::subscription(), sub_key())]);
    assert!(gw.is_empty());
}

#[tokio::test(start_paused = true)]
async fn convergence_timeout_is_bounded_and_reports_last_phase() {
    let (_gw, inst) = setup(MemoryGateway::with_reactor(olm(json!({"phase": "Installing"}))));
    let t0 = Instant::now();

    let err = inst.install(&request("stable"), &CancellationToken::new()).await.unwrap_err();
    let waited = t0.elapsed();
    assert!(waited >= Duration::from_secs(30), "{waited:?}");
    assert!(waited <= Duration::from_secs(31), "{waited:?}");
    assert!(err.is_timeout());
    match err {
        InstallError::ConvergenceTimeout { last_phase, record, .. } => {
            assert_eq!(last_phase.as_deref(), Some("Installing"));
            assert_eq!(record.name, "etcd.stable");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test(start_paused = true)]
async fn unresolved_subscription_times_out_with_last_state() {
    let pending: Reactor =
        Arc::new(|o: &Object| vec![o.clone().with_status(json!({"state": "UpgradePending"}))]);
    let (_gw, inst) = setup(MemoryGateway::with_reactor(pending));
    let t0 = Instant::now();

    let err = inst.install(&request("stable"), &CancellationToken::new()).await.unwrap_err();
    assert!(t0.elapsed() <= Duration::from_secs(11));
    match err {
        InstallError::ResolutionTimeout { subscription, last_state, .. } => {
            assert_eq!(subscription, sub_key());
            assert_eq!(last_state.as_deref(), Some("UpgradePending"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test(start_paused = true)]
async fn unresolved_subscription_reads_not_installed() {
    let (gw, inst) = setup(MemoryGateway::new());
    gw.upsert(build_subscription());
    let err = inst.read_status(&request("stable"), &CancellationToken::new()).await.unwrap_err();
    assert!(err.is_not_installed());
}

fn build_subscription() -> Object {
    Installer::build_manifest(&request("stable")).remove(0)
}

#[tokio::test(start_paused = true)]
async fn delayed_controller_is_awaited() {
    let (gw, inst) = setup(MemoryGateway::new());
    let bg = gw.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(3)).await;
        bg.set_status(&Gvk::subscription(), &sub_key(), json!({"installedCSV": "etcd.v1"}));
        tokio::time::sleep(Duration::from_secs(2)).await;
        bg.upsert(csv("etcd.v1", json!({"phase": "Pending"})));
        tokio::time::sleep(Duration::from_secs(4)).await;
        bg.set_status(&Gvk::cluster_service_version(), &ObjectKey::new(NS, "etcd.v1"), json!({"phase": "Succeeded"}));
    });
    let t0 = Instant::now();

    let view = inst.install(&request("stable"), &CancellationToken::new()).await.unwrap();
    assert_eq!(view.verdict(), Verdict::Installed);
    assert!(t0.elapsed() >= Duration::from_secs(9));
    assert!(t0.elapsed() <= Duration::from_secs(10));
}

#[tokio::test(start_paused = true)]
async fn cancellation_stops_waiting() {
    let (_gw, inst) = setup(MemoryGateway::new());
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(2500)).await;
        trigger.cancel();
    });
    let t0 = Instant::now();

    let err = inst.install(&request("stable"), &cancel).await.unwrap_err();
    assert!(matches!(err, InstallError::Cancelled));
    assert!(t0.elapsed() < Duration::from_secs(3));
}

#[tokio::test(start_paused = true)]
async fn create_failure_is_reported_without_waiting() {
    let (gw, inst) = setup(MemoryGateway::new());
    gw.fail_creates("forbidden");
    let err = inst.install(&request("stable"), &CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, InstallError::CreateFailed(_)));
    assert_eq!(gw.get_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn invalid_request_never_reaches_cluster() {
    let (gw, inst) = setup(MemoryGateway::new());
    let err = inst.install(&InstallRequest::new("Bad_Name", "stable"), &CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, InstallError::InvalidRequest(_)));
    assert_eq!(gw.create_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn transport_error_during_read_is_not_masked() {
    let (gw, inst) = setup(MemoryGateway::with_reactor(olm(json!({"phase": "Succeeded"}))));
    let cancel = CancellationToken::new();
    inst.install(&request("stable"), &cancel).await.unwrap();

    gw.fail_get(&Gvk::subscription(), &sub_key(), "connection refused");
    let err = inst.read_status(&request("stable"), &cancel).await.unwrap_err();
    assert!(matches!(err, InstallError::Transport(_)), "{err}");

    let err = inst.uninstall(&request("stable"), &cancel).await.unwrap_err();
    assert!(matches!(err, InstallError::Transport(_)), "{err}");
    assert_eq!(gw.delete_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn update_replaces_install_when_channel_changes() {
    let (gw, inst) = setup(MemoryGateway::with_reactor(olm(json!({"phase": "Succeeded"}))));
    let cancel = CancellationToken::new();
    inst.install(&request("stable"), &cancel).await.unwrap();

    let view = inst.update(&request("stable"), &request("stable"), &cancel).await.unwrap();
    assert_eq!(view.verdict(), Verdict::Installed);
    assert_eq!(gw.delete_calls(), 0);

    inst.update(&request("stable"), &request("alpha"), &cancel).await.unwrap();
    let csvs = Gvk::cluster_service_version();
    assert!(!gw.contains(&csvs, &ObjectKey::new(NS, "etcd.stable")));
    assert!(gw.contains(&csvs, &ObjectKey::new(NS, "etcd.alpha")));
    let live = gw.object(&Gvk::subscription(), &sub_key()).unwrap();
    assert_eq!(live.raw()["spec"]["channel"], "alpha");
}

#[tokio::test(start_paused = true)]
async fn list_returns_subscriptions_sorted() {
    let (gw, inst) = setup(MemoryGateway::new());
    for name in ["zeta", "alpha"] {
        gw.upsert(Installer::build_manifest(&InstallRequest::new(name, "stable").namespace(NS)).remove(0));
    }
    gw.upsert(csv("alpha.v1", json!({"phase": "Succeeded"})));
    let names: Vec<_> =
        inst.list(NS, &CancellationToken::new()).await.unwrap().into_iter().map(|o| o.key().name.clone()).collect();
    assert_eq!(names, vec!["alpha", "zeta"]);
}

/// Reads of `stalled` kind hang for `delay` before answering.
struct SlowReads {
    inner: Arc<MemoryGateway>,
    stalled: Gvk,
    delay: Duration,
}

#[async_trait]
impl ClusterGateway for SlowReads {
    async fn create(&self, objects: &[Object]) -> Result<(), GatewayError> {
        self.inner.create(objects).await
    }
    async fn delete(&self, objects: &[Object]) -> Result<(), GatewayError> {
        self.inner.delete(objects).await
    }
    async fn get(&self, key: &ObjectKey, gvk: &Gvk) -> Result<Object, GatewayError> {
        if gvk == &self.stalled {
            tokio::time::sleep(self.delay).await;
        }
        self.inner.get(key, gvk).await
    }
    async fn list(&self, namespace: &str, gvk: &Gvk) -> Result<Vec<Object>, GatewayError> {
        self.inner.list(namespace, gvk).await
    }
}

/// The subscription is removed out of band right before read number `after` (1-based).
struct VanishingSubscription {
    inner: Arc<MemoryGateway>,
    reads: AtomicUsize,
    after: usize,
}

#[async_trait]
impl ClusterGateway for VanishingSubscription {
    async fn create(&self, objects: &[Object]) -> Result<(), GatewayError> {
        self.inner.create(objects).await
    }
    async fn delete(&self, objects: &[Object]) -> Result<(), GatewayError> {
        self.inner.delete(objects).await
    }
    async fn get(&self, key: &ObjectKey, gvk: &Gvk) -> Result<Object, GatewayError> {
        if self.reads.fetch_add(1, Ordering::SeqCst) + 1 == self.after {
            self.inner.remove(&Gvk::subscription(), &sub_key());
        }
        self.inner.get(key, gvk).await
    }
    async fn list(&self, namespace: &str, gvk: &Gvk) -> Result<Vec<Object>, GatewayError> {
        self.inner.list(namespace, gvk).await
    }
}

#[tokio::test(start_paused = true)]
async fn stalled_record_read_still_times_out_at_deadline() {
    let gw = Arc::new(MemoryGateway::with_reactor(olm(json!({"phase": "Installing"}))));
    let slow = SlowReads { inner: gw, stalled: Gvk::cluster_service_version(), delay: Duration::from_secs(600) };
    let inst = Installer::new(Arc::new(slow), cfg());
    let t0 = Instant::now();

    let err = inst.install(&request("stable"), &CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, InstallError::ConvergenceTimeout { .. }), "{err}");
    assert_eq!(t0.elapsed(), Duration::from_secs(30));
}

#[tokio::test(start_paused = true)]
async fn stalled_subscription_read_still_times_out_at_deadline() {
    let gw = Arc::new(MemoryGateway::new());
    let slow = SlowReads { inner: gw, stalled: Gvk::subscription(), delay: Duration::from_secs(600) };
    let inst = Installer::new(Arc::new(slow), cfg());
    let t0 = Instant::now();

    let err = inst.install(&request("stable"), &CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, InstallError::ResolutionTimeout { last_state: None, .. }), "{err}");
    assert_eq!(t0.elapsed(), Duration::from_secs(10));
}

#[tokio::test(start_paused = true)]
async fn uninstall_of_unresolved_subscription_is_rejected() {
    let (gw, inst) = setup(MemoryGateway::new());
    gw.upsert(build_subscription().with_status(json!({"state": "UpgradePending"})));

    let err = inst.uninstall(&request("stable"), &CancellationToken::new()).await.unwrap_err();
    assert!(err.is_not_installed(), "{err}");
    assert_eq!(gw.delete_calls(), 0);
    assert!(gw.contains(&Gvk::subscription(), &sub_key()));
}

#[tokio::test(start_paused = true)]
async fn uninstall_of_failed_install_is_rejected() {
    let (gw, inst) = setup(MemoryGateway::new());
    gw.upsert(build_subscription().with_status(json!({"installedCSV": "etcd.v1"})));
    gw.upsert(csv("etcd.v1", json!({"phase": "Failed", "reason": "InstallCheckFailed"})));

    let err = inst.uninstall(&request("stable"), &CancellationToken::new()).await.unwrap_err();
    match &err {
        InstallError::NotSucceeded { subscription, record, phase } => {
            assert_eq!(subscription, &sub_key());
            assert_eq!(record.name, "etcd.v1");
            assert_eq!(phase.as_deref(), Some("Failed"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(gw.delete_calls(), 0);
    assert_eq!(gw.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn subscription_vanishing_mid_uninstall_is_not_installed() {
    let gw = Arc::new(MemoryGateway::new());
    gw.upsert(build_subscription().with_status(json!({"installedCSV": "etcd.v1"})));
    gw.upsert(csv("etcd.v1", json!({"phase": "Succeeded"})));
    // Read 1 is the presence check, read 2 the record lookup.
    let flaky = VanishingSubscription { inner: gw.clone(), reads: AtomicUsize::new(0), after: 2 };
    let inst = Installer::new(Arc::new(flaky), cfg());

    let err = inst.uninstall(&request("stable"), &CancellationToken::new()).await.unwrap_err();
    assert!(err.is_not_installed(), "{err}");
    assert_eq!(gw.delete_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn malformed_record_status_is_a_hard_error() {
    let (_gw, inst) = setup(MemoryGateway::with_reactor(olm(json!({"phase": 42}))));
    let t0 = Instant::now();

    let err = inst.install(&request("stable"), &CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, InstallError::Transport(_)), "{err}");
    assert!(err.to_string().contains("malformed status"));
    assert!(t0.elapsed() < Duration::from_secs(1));
}
