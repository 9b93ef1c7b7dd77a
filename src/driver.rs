//! Backend Context
//!
//! One [`Backend`] owns everything a configured storage backend needs: its
//! resolved configuration, the shared management client, the driver variant,
//! its storage pools, per-object reconciliation locks and metrics. All
//! orchestrator-facing operations go through it.

use crate::access::chap::initialize_san_auth;
use crate::access::export::{
    ensure_export_policy_exists, export_policy_name, reconcile_nas_node_access,
};
use crate::access::igroup::reconcile_initiator_group;
use crate::access::publish::{iscsi_target_info, publish_lun, publish_nas_share, LunPublishInfo, PublishRequest};
use crate::access::{KeyedLocks, NodeInfo, ReconcileReport};
use crate::config::{clean_backend_name, validate_storage_prefix, DriverConfig, DriverKind, TimingConfig};
use crate::domain::ports::ManagementClientRef;
use crate::error::{Error, Result};
use crate::lifecycle::{self, CloneOutcome, CloneRequest, Snapshot};
use crate::metrics::DriverMetrics;
use crate::pools::admission::{
    self, check_aggregate_limits_for_volume, check_aggregate_usage_limit, check_volume_size_limit,
    get_volume_size, VolumeRequest,
};
use crate::pools::capability::{internal, Requests, StoragePool};
use crate::pools::discovery::initialize_storage_pools;
use crate::pools::validation::validate_pools;
use crate::pools::{PoolSet, PoolSource};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

// =============================================================================
// Results
// =============================================================================

/// Where and how a new volume should be created
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Placement {
    pub pool: String,
    pub aggregate: String,
    pub size_bytes: u64,
    pub options: BTreeMap<String, String>,
}

/// What a host needs to attach a published volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "camelCase")]
pub enum PublishInfo {
    Nfs {
        server_ip: String,
        path: String,
        mount_options: String,
    },
    Iscsi(LunPublishInfo),
}

// =============================================================================
// Backend
// =============================================================================

pub struct Backend {
    name: String,
    config: DriverConfig,
    client: ManagementClientRef,
    kind: DriverKind,
    pools: PoolSet,
    locks: KeyedLocks,
    metrics: DriverMetrics,
}

impl Backend {
    /// Resolve the configuration, discover and validate pools, and prepare
    /// access control on the appliance
    pub async fn initialize(mut config: DriverConfig, client: ManagementClientRef) -> Result<Self> {
        config.populate_defaults()?;
        validate_storage_prefix(config.storage_prefix())?;
        let mut kind = config.driver_kind()?;

        let name = if config.backend_name.is_empty() {
            let endpoint = if config.data_lif.is_empty() {
                &config.svm
            } else {
                &config.data_lif
            };
            clean_backend_name(&format!("{}_{}", kind.name().replace('-', ""), endpoint))
        } else {
            config.backend_name.clone()
        };
        info!(backend = %name, driver = %kind, svm = %config.svm, "Initializing backend");

        let pools = initialize_storage_pools(client.as_ref(), &config, &kind, &name).await?;
        validate_pools(&pools, &kind)?;

        match &mut kind {
            DriverKind::San(san) | DriverKind::SanEconomy(san) => {
                initialize_san_auth(client.as_ref(), san, &config.svm).await?;
            }
            DriverKind::Nas(nas) | DriverKind::NasFlexGroup(nas) => {
                if nas.auto_export_policy {
                    let policy = export_policy_name(&config.backend_uuid);
                    ensure_export_policy_exists(client.as_ref(), &policy).await?;
                }
            }
        }

        let metrics = DriverMetrics::new(&name)?;
        info!(backend = %name, pools = pools.published().len(), "Backend initialized");

        Ok(Self {
            name,
            config,
            client,
            kind,
            pools,
            locks: KeyedLocks::new(),
            metrics,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &DriverKind {
        &self.kind
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Configuration with credentials removed, for display
    pub fn external_config(&self) -> DriverConfig {
        self.config.redacted()
    }

    pub fn pools(&self) -> &PoolSet {
        &self.pools
    }

    /// Pools offered to the orchestrator
    pub fn published_pools(&self) -> Vec<&StoragePool> {
        self.pools.published()
    }

    pub fn metrics(&self) -> &DriverMetrics {
        &self.metrics
    }

    pub fn client(&self) -> &ManagementClientRef {
        &self.client
    }

    fn timing(&self) -> &TimingConfig {
        &self.config.timing
    }

    pub fn export_policy(&self) -> String {
        export_policy_name(&self.config.backend_uuid)
    }

    /// Internal appliance name for an orchestrator volume name
    pub fn internal_volume_name(&self, name: &str) -> String {
        admission::internal_volume_name(self.config.storage_prefix(), name)
    }

    // =========================================================================
    // Access
    // =========================================================================

    /// Converge host access with `nodes`: export rules for NAS backends,
    /// igroup membership for SAN backends
    pub async fn reconcile_node_access(&self, nodes: &[NodeInfo]) -> Result<ReconcileReport> {
        match &self.kind {
            DriverKind::Nas(nas) | DriverKind::NasFlexGroup(nas) => {
                let policy = self.export_policy();
                let _guard = self.locks.lock(&policy).await;
                let report =
                    reconcile_nas_node_access(self.client.as_ref(), nas, &policy, nodes).await?;
                self.metrics.record_export_rules(report.added, report.removed);
                Ok(report)
            }
            DriverKind::San(san) | DriverKind::SanEconomy(san) => {
                let iqns: Vec<String> = nodes.iter().filter_map(|n| n.iqn.clone()).collect();
                let _guard = self.locks.lock(&san.igroup_name).await;
                let report =
                    reconcile_initiator_group(self.client.as_ref(), &san.igroup_name, &iqns).await?;
                self.metrics.record_initiators(report.added, report.removed);
                Ok(report)
            }
        }
    }

    /// Grant the requesting host access to a volume
    pub async fn publish(&self, volume: &str, request: &PublishRequest) -> Result<PublishInfo> {
        match &self.kind {
            DriverKind::Nas(nas) | DriverKind::NasFlexGroup(nas) => {
                let policy = self.export_policy();
                {
                    let _guard = self.locks.lock(&policy).await;
                    publish_nas_share(self.client.as_ref(), nas, &policy, volume, request).await?;
                }
                Ok(PublishInfo::Nfs {
                    server_ip: self.config.data_lif.clone(),
                    path: format!("/{}", volume),
                    mount_options: nas.nfs_mount_options.clone(),
                })
            }
            DriverKind::San(san) | DriverKind::SanEconomy(san) => {
                let target = iscsi_target_info(self.client.as_ref(), &self.config.svm).await?;
                let mut ips: Vec<String> = target
                    .interfaces
                    .iter()
                    .map(|iface| {
                        iface
                            .rsplit_once(':')
                            .map(|(ip, _)| ip.to_string())
                            .unwrap_or_else(|| iface.clone())
                    })
                    .collect();
                if let Some(data_lif) = &san.data_lif {
                    ips.retain(|ip| ip != data_lif);
                    ips.insert(0, data_lif.clone());
                }

                let lun_path = lun_path(volume);
                let _guard = self.locks.lock(&san.igroup_name).await;
                let info = publish_lun(
                    self.client.as_ref(),
                    san,
                    &ips,
                    request,
                    &lun_path,
                    &target.node_name,
                )
                .await?;
                Ok(PublishInfo::Iscsi(info))
            }
        }
    }

    // =========================================================================
    // Admission
    // =========================================================================

    /// Physical pools that may host a new volume
    pub fn candidate_pools(
        &self,
        hint: &str,
        requests: &Requests,
        volume: &str,
    ) -> Result<Vec<&StoragePool>> {
        admission::select_candidate_pools(&self.pools, hint, requests, volume).map_err(|e| {
            match &e {
                Error::PoolNotFound { .. } => self.metrics.record_rejection("pool_not_found"),
                Error::BackendIneligible { .. } => self.metrics.record_rejection("no_matching_pool"),
                _ => {}
            }
            e
        })
    }

    /// Choose a pool for a new volume and resolve its size and options.
    ///
    /// Candidates are tried in order; the first whose aggregate is under the
    /// usage limit wins, otherwise the last limit error is returned.
    pub async fn admit_volume(
        &self,
        hint: &str,
        requests: &Requests,
        volume: &VolumeRequest,
    ) -> Result<Placement> {
        let candidates = self.candidate_pools(hint, requests, &volume.internal_name)?;
        let options = admission::volume_opts(volume, requests);

        let mut last_error = None;
        for pool in candidates {
            let size_bytes = match get_volume_size(volume.size_bytes, pool.internal(internal::SIZE)) {
                Ok(size) => size,
                Err(e) => {
                    self.metrics.record_rejection("too_small");
                    return Err(e);
                }
            };
            if let Err(e) = check_volume_size_limit(size_bytes, &self.config.limit_volume_size) {
                self.metrics.record_rejection("volume_size_limit");
                return Err(e);
            }

            let aggregate = pool.aggregate.clone().unwrap_or_default();
            let space_reserve = options
                .get("spaceReserve")
                .map(String::as_str)
                .unwrap_or_else(|| pool.internal(internal::SPACE_RESERVE));

            match check_aggregate_usage_limit(
                self.client.as_ref(),
                &self.config.limit_aggregate_usage,
                &aggregate,
                space_reserve,
                size_bytes,
            )
            .await
            {
                Ok(()) => {
                    debug!(volume = %volume.internal_name, pool = %pool.name, "Admitted volume");
                    return Ok(Placement {
                        pool: pool.name.clone(),
                        aggregate,
                        size_bytes,
                        options,
                    });
                }
                Err(e) => {
                    warn!(pool = %pool.name, error = %e, "Pool rejected by aggregate limits");
                    self.metrics.record_rejection("aggregate_limit");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| Error::BackendIneligible {
            volume: volume.internal_name.clone(),
            reason: "no candidate pools".into(),
        }))
    }

    /// Checks before growing a volume; returns the current size
    pub async fn check_resize(&self, volume: &str, size_bytes: u64) -> Result<u64> {
        let current = admission::resize_validation(self.client.as_ref(), volume, size_bytes).await?;
        check_volume_size_limit(size_bytes, &self.config.limit_volume_size)?;
        check_aggregate_limits_for_volume(
            self.client.as_ref(),
            &self.config.limit_aggregate_usage,
            volume,
            size_bytes,
        )
        .await?;
        Ok(current)
    }

    // =========================================================================
    // Volume Lifecycle
    // =========================================================================

    pub async fn get_volume(&self, volume: &str) -> Result<()> {
        lifecycle::get_volume(self.client.as_ref(), volume).await
    }

    /// Unmount and offline ahead of a destroy; `false` when already gone
    pub async fn prepare_volume_delete(&self, volume: &str) -> Result<bool> {
        lifecycle::unmount_and_offline_volume(self.client.as_ref(), volume).await
    }

    /// Clone a volume.
    ///
    /// `split_on_clone` is the request's own setting; `source_pool` names the
    /// pool the source volume was provisioned from.
    pub async fn create_clone(
        &self,
        request: &CloneRequest,
        split_on_clone: Option<&str>,
        source_pool: Option<&str>,
    ) -> Result<CloneOutcome> {
        let split = if self.kind.supports_split_on_clone() {
            let pool = source_pool.and_then(|name| self.pools.pool(name));
            lifecycle::effective_split_on_clone(split_on_clone, pool, &self.config.split_on_clone)?
        } else {
            false
        };

        let outcome =
            lifecycle::create_clone(self.client.as_ref(), &self.kind, self.timing(), request, split)
                .await?;
        self.metrics.clones_created.inc();
        self.metrics.probe_attempts.inc_by(u64::from(outcome.probe_attempts));
        Ok(outcome)
    }

    pub async fn get_snapshot(&self, volume: &str, snapshot: &str) -> Result<Option<Snapshot>> {
        lifecycle::get_snapshot(self.client.as_ref(), volume, snapshot).await
    }

    pub async fn list_snapshots(&self, volume: &str) -> Result<Vec<Snapshot>> {
        lifecycle::list_snapshots(self.client.as_ref(), volume).await
    }

    pub async fn create_snapshot(&self, volume: &str, snapshot: &str) -> Result<Snapshot> {
        lifecycle::create_snapshot(self.client.as_ref(), volume, snapshot).await
    }

    pub async fn restore_snapshot(&self, volume: &str, snapshot: &str) -> Result<()> {
        lifecycle::restore_snapshot(self.client.as_ref(), volume, snapshot).await
    }

    pub async fn delete_snapshot(&self, volume: &str, snapshot: &str) -> Result<()> {
        let result = lifecycle::delete_snapshot(self.client.as_ref(), volume, snapshot).await;
        if matches!(&result, Err(e) if e.is_busy()) {
            self.metrics.busy_snapshot_splits.inc();
        }
        result
    }
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("name", &self.name)
            .field("kind", &self.kind.name())
            .field("pools", &self.pools.published().len())
            .finish()
    }
}

/// LUN backing a SAN volume
pub fn lun_path(volume: &str) -> String {
    format!("/vol/{}/lun0", volume)
}
