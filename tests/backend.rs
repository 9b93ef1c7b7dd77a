//! End-to-end behaviour of a backend against the simulated appliance

use assert_matches::assert_matches;
use ontap_driver_core::pools::capability::attrs;
use ontap_driver_core::{
    ApiError, ApiErrorCode, Backend, BackoffPolicy, CloneRequest, DriverConfig, Error, NodeInfo,
    Request, Requests, SimulatedAppliance, TimingConfig, VolumeRequest,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

const GIB: u64 = 1 << 30;

fn fast_timing() -> TimingConfig {
    TimingConfig {
        probe: BackoffPolicy {
            initial_interval: Duration::from_millis(1),
            multiplier: 2.0,
            randomization_factor: 0.0,
            max_interval: Duration::from_millis(5),
            max_elapsed: Duration::from_millis(100),
        },
        async_clone_timeout: Duration::from_millis(200),
        job_poll_interval: Duration::from_millis(5),
    }
}

fn nas_config() -> DriverConfig {
    DriverConfig {
        storage_driver_name: "ontap-nas".into(),
        backend_uuid: "abcd".into(),
        svm: "svm0".into(),
        data_lif: "10.0.0.10".into(),
        auto_export_policy: true,
        auto_export_cidrs: vec!["10.0.0.0/8".into()],
        limit_aggregate_usage: "80%".into(),
        timing: fast_timing(),
        ..Default::default()
    }
}

/// One aggregate, 100 GiB, 75 GiB used
fn appliance() -> Arc<SimulatedAppliance> {
    let appliance = Arc::new(SimulatedAppliance::new());
    appliance.add_aggregate("aggr1", "ssd", 100 * GIB, 75 * GIB);
    appliance
}

fn rules(appliance: &SimulatedAppliance) -> BTreeSet<String> {
    appliance.export_rules("trident-abcd").unwrap_or_default()
}

#[tokio::test]
async fn test_export_rules_follow_node_churn() {
    let appliance = appliance();
    let backend = Backend::initialize(nas_config(), appliance.clone()).await.unwrap();

    let mut nodes = vec![
        NodeInfo::new("n1").with_ips(["10.0.0.1", "172.16.0.1"]),
        NodeInfo::new("n2").with_ips(["10.0.0.2"]),
        NodeInfo::new("n3").with_ips(["192.168.1.3"]),
    ];
    backend.reconcile_node_access(&nodes).await.unwrap();
    assert_eq!(
        rules(&appliance),
        BTreeSet::from(["10.0.0.1".to_string(), "10.0.0.2".to_string()])
    );

    nodes.remove(1);
    nodes.push(NodeInfo::new("n4").with_ips(["10.1.2.3", "10.1.2.4"]));
    let report = backend.reconcile_node_access(&nodes).await.unwrap();
    assert_eq!((report.added, report.removed), (1, 1));
    assert_eq!(
        rules(&appliance),
        BTreeSet::from(["10.0.0.1".to_string(), "10.1.2.3,10.1.2.4".to_string()])
    );

    backend.reconcile_node_access(&[]).await.unwrap();
    assert!(rules(&appliance).is_empty());
}

#[tokio::test]
async fn test_converged_access_touches_no_rules() {
    let appliance = appliance();
    let backend = Backend::initialize(nas_config(), appliance.clone()).await.unwrap();
    let nodes = vec![
        NodeInfo::new("n1").with_ips(["10.0.0.1"]),
        NodeInfo::new("n2").with_ips(["10.0.0.2"]),
    ];
    backend.reconcile_node_access(&nodes).await.unwrap();

    appliance.clear_calls();
    let report = backend.reconcile_node_access(&nodes).await.unwrap();
    assert!(report.is_noop());
    // the policy create answered "already exists"; no rule was touched
    assert_eq!(appliance.mutating_calls(), 1);
    assert_eq!(
        appliance.call_names(),
        vec!["export_policy_create", "export_rule_list"]
    );
}

#[tokio::test]
async fn test_out_of_band_rules_are_repaired() {
    let appliance = appliance();
    appliance.add_export_policy("trident-abcd", &["10.9.9.9", "10.0.0.1", "10.0.0.1"]);
    let backend = Backend::initialize(nas_config(), appliance.clone()).await.unwrap();

    let nodes = vec![NodeInfo::new("n1").with_ips(["10.0.0.1"])];
    let report = backend.reconcile_node_access(&nodes).await.unwrap();
    // the stranger and the duplicate go, the live rule stays
    assert_eq!((report.added, report.removed), (0, 2));
    assert_eq!(rules(&appliance), BTreeSet::from(["10.0.0.1".to_string()]));
}

#[tokio::test]
async fn test_igroup_membership_converges() {
    let appliance = appliance();
    let config = DriverConfig {
        storage_driver_name: "ontap-san".into(),
        backend_uuid: "abcd".into(),
        svm: "svm0".into(),
        ..Default::default()
    };
    let backend = Backend::initialize(config, appliance.clone()).await.unwrap();

    let nodes = vec![
        NodeInfo::new("n1").with_iqn("iqn.1993-08.org.debian:n1"),
        NodeInfo::new("n2").with_iqn("iqn.1993-08.org.debian:n2"),
        NodeInfo::new("n3"),
    ];
    backend.reconcile_node_access(&nodes).await.unwrap();
    assert_eq!(
        appliance.igroup_members("trident-abcd").unwrap().len(),
        2
    );

    let report = backend.reconcile_node_access(&nodes[..1]).await.unwrap();
    assert_eq!((report.added, report.removed), (0, 1));

    appliance.clear_calls();
    backend.reconcile_node_access(&nodes[..1]).await.unwrap();
    assert_eq!(appliance.mutating_calls(), 1);
    assert_eq!(appliance.call_names(), vec!["igroup_create", "igroup_get"]);
}

#[tokio::test]
async fn test_chap_not_enabled_over_existing_luns() {
    let appliance = appliance();
    appliance.add_lun("/vol/legacy/lun0", Some("ext4"));
    let config = DriverConfig {
        storage_driver_name: "ontap-san".into(),
        backend_uuid: "abcd".into(),
        svm: "svm0".into(),
        use_chap: true,
        chap_username: "initiator".into(),
        chap_initiator_secret: "initiatorsecret1".into(),
        chap_target_username: "target".into(),
        chap_target_initiator_secret: "targetsecret0001".into(),
        ..Default::default()
    };

    let result = Backend::initialize(config, appliance.clone()).await;
    assert_matches!(result, Err(Error::Chap(msg)) if msg.contains("would lose access"));
    assert_eq!(appliance.default_auth().auth_type.as_deref(), Some("none"));
}

#[tokio::test]
async fn test_thick_volumes_count_against_aggregate_limit() {
    let appliance = appliance();
    let backend = Backend::initialize(nas_config(), appliance.clone()).await.unwrap();
    let hint = backend.published_pools()[0].name.clone();

    let thick = VolumeRequest {
        internal_name: "trident_thick".into(),
        size_bytes: 10 * GIB,
        space_reserve: "volume".into(),
        ..Default::default()
    };
    assert_matches!(
        backend.admit_volume(&hint, &Requests::new(), &thick).await,
        Err(Error::AggregateLimitExceeded { verb: "would exceed", .. })
    );

    let thin = VolumeRequest {
        internal_name: "trident_thin".into(),
        size_bytes: 10 * GIB,
        space_reserve: "none".into(),
        ..Default::default()
    };
    let placement = backend.admit_volume(&hint, &Requests::new(), &thin).await.unwrap();
    assert_eq!(placement.aggregate, "aggr1");
    assert_eq!(placement.options.get("spaceReserve").map(String::as_str), Some("none"));
}

#[tokio::test]
async fn test_volumes_below_floor_are_refused() {
    let appliance = appliance();
    let backend = Backend::initialize(nas_config(), appliance.clone()).await.unwrap();
    let hint = backend.published_pools()[0].name.clone();

    let tiny = VolumeRequest {
        internal_name: "trident_tiny".into(),
        size_bytes: 10 * 1024 * 1024,
        ..Default::default()
    };
    assert_matches!(
        backend.admit_volume(&hint, &Requests::new(), &tiny).await,
        Err(Error::VolumeTooSmall { minimum, .. }) if minimum == 20 * 1024 * 1024
    );
}

#[tokio::test]
async fn test_media_request_selects_matching_aggregate() {
    let appliance = appliance();
    appliance.add_aggregate("aggr2", "hdd", 100 * GIB, 0);
    let config = DriverConfig {
        limit_aggregate_usage: String::new(),
        storage: vec![Default::default()],
        ..nas_config()
    };
    let backend = Backend::initialize(config, appliance.clone()).await.unwrap();
    let hint = backend.published_pools()[0].name.clone();

    let requests = Requests::from([(attrs::MEDIA.to_string(), Request::string("ssd"))]);
    let candidates = backend.candidate_pools(&hint, &requests, "trident_v").unwrap();
    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0].aggregate.as_deref(), Some("aggr1"));

    let requests = Requests::from([(attrs::MEDIA.to_string(), Request::string("nvme"))]);
    assert!(backend
        .candidate_pools(&hint, &requests, "trident_v")
        .unwrap_err()
        .is_ineligible());

    assert_matches!(
        backend.candidate_pools("no_such_pool", &requests, "trident_v"),
        Err(Error::PoolNotFound { .. })
    );
}

#[tokio::test]
async fn test_clone_confirmed_after_lost_job() {
    let appliance = appliance();
    appliance.add_volume("trident_src", "aggr1", GIB, "none");
    appliance.inject_fault_after_apply(
        "volume_clone_create",
        ApiError::new(ApiErrorCode::JobTrackingFailure, "failed to load job"),
    );
    let backend = Backend::initialize(nas_config(), appliance.clone()).await.unwrap();

    let request = CloneRequest::new("trident_clone", "trident_src");
    let outcome = backend.create_clone(&request, None, None).await.unwrap();

    assert!(outcome.snapshot_created);
    assert_eq!(outcome.junction.as_deref(), Some("/trident_clone"));
    assert!(backend.metrics().probe_attempts.get() >= 1);
    assert!(appliance.volume("trident_clone").is_some());
}

#[tokio::test]
async fn test_existing_clone_target_is_untouched() {
    let appliance = appliance();
    appliance.add_volume("trident_src", "aggr1", GIB, "none");
    appliance.add_volume("trident_clone", "aggr1", GIB, "none");
    let backend = Backend::initialize(nas_config(), appliance.clone()).await.unwrap();

    appliance.clear_calls();
    let request = CloneRequest::new("trident_clone", "trident_src");
    assert_matches!(
        backend.create_clone(&request, None, None).await,
        Err(Error::ResourceExists { .. })
    );
    assert_eq!(appliance.mutating_calls(), 0);
}

#[tokio::test]
async fn test_busy_snapshot_frees_after_split() {
    let appliance = appliance();
    appliance.add_volume("trident_src", "aggr1", GIB, "none");
    appliance.add_snapshot("trident_src", "snap1", 1_600_000_000);
    let backend = Backend::initialize(nas_config(), appliance.clone()).await.unwrap();

    for name in ["trident_c2", "trident_c1"] {
        let request = CloneRequest::new(name, "trident_src").from_snapshot("snap1");
        backend.create_clone(&request, Some("false"), None).await.unwrap();
    }

    assert!(backend.delete_snapshot("trident_src", "snap1").await.unwrap_err().is_busy());
    assert!(appliance.volume("trident_c1").unwrap().split_started);
    assert!(!appliance.volume("trident_c2").unwrap().split_started);

    assert!(backend.delete_snapshot("trident_src", "snap1").await.unwrap_err().is_busy());
    backend.delete_snapshot("trident_src", "snap1").await.unwrap();
    assert_eq!(backend.metrics().busy_snapshot_splits.get(), 2);
}
