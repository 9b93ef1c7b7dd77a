//! Domain Ports - Core trait definitions for the driver core
//!
//! These traits define the boundary between the control-plane logic and the
//! remote storage appliance. The wire protocol lives behind
//! [`ManagementClient`]; everything in this crate talks to the appliance only
//! through it.

use crate::error::ApiError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Result of a single management API call
pub type ApiResult<T> = std::result::Result<T, ApiError>;

// =============================================================================
// Export Policy Types
// =============================================================================

/// A single client-match rule inside an export policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportRule {
    /// Comma-joined CIDR/IP list the rule applies to
    pub client_match: String,
    /// Appliance-assigned rule index
    pub rule_index: u32,
}

// =============================================================================
// Snapshot / Volume Types
// =============================================================================

/// Snapshot record as listed by the appliance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub name: String,
    /// Unix seconds
    pub access_time: i64,
}

/// Volume attributes relevant to admission control
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeAttributes {
    pub name: String,
    /// Containing aggregate
    pub aggregate: Option<String>,
    /// Space guarantee ("none" or "volume")
    pub space_reserve: Option<String>,
    pub size_bytes: u64,
}

/// State of an asynchronous appliance job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    Queued,
    Running,
    Success,
    Failure(String),
}

/// Handle of an asynchronous appliance job
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobId(pub String);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Aggregate Types
// =============================================================================

/// Space report for one aggregate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateSpace {
    pub aggregate: String,
    pub size_bytes: u64,
    pub used_including_snapshot_reserve: u64,
}

/// Extended attributes for one aggregate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateAttributes {
    pub aggregate: String,
    /// Appliance-reported type ("hdd", "hybrid", "ssd", ...)
    pub aggregate_type: String,
}

// =============================================================================
// iSCSI / CHAP Types
// =============================================================================

/// Default-initiator authentication record
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefaultAuth {
    pub auth_type: Option<String>,
    pub user_name: Option<String>,
    pub outbound_user_name: Option<String>,
}

/// Bidirectional CHAP settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChapCredentials {
    pub chap_username: String,
    pub chap_initiator_secret: String,
    pub chap_target_username: String,
    pub chap_target_initiator_secret: String,
}

/// iSCSI data interface
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IscsiInterface {
    pub ip_address: String,
    pub port: u16,
    pub enabled: bool,
}

/// LUN map entry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LunMapInfo {
    pub reporting_nodes: Vec<String>,
}

/// Optional appliance features the core checks before using them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApplianceFeature {
    FlexGroupClone,
}

// =============================================================================
// Management Client Port
// =============================================================================

/// Port for object-level operations on the storage appliance.
///
/// Every failure carries a stable [`crate::error::ApiErrorCode`].
#[async_trait]
pub trait ManagementClient: Send + Sync {
    // --- export policy ---
    async fn export_policy_create(&self, policy: &str) -> ApiResult<()>;
    async fn export_policy_destroy(&self, policy: &str) -> ApiResult<()>;
    /// Fails with `NotFound` when the policy is absent
    async fn export_policy_get(&self, policy: &str) -> ApiResult<()>;
    async fn export_rule_list(&self, policy: &str) -> ApiResult<Vec<ExportRule>>;
    async fn export_rule_create(
        &self,
        policy: &str,
        client_match: &str,
        protocols: &[&str],
        ro_rules: &[&str],
        rw_rules: &[&str],
        superuser_rules: &[&str],
    ) -> ApiResult<()>;
    async fn export_rule_destroy(&self, policy: &str, rule_index: u32) -> ApiResult<()>;

    // --- initiator group ---
    async fn igroup_create(&self, igroup: &str, protocol: &str, os_type: &str) -> ApiResult<()>;
    /// Current initiator IQNs
    async fn igroup_get(&self, igroup: &str) -> ApiResult<Vec<String>>;
    async fn igroup_add(&self, igroup: &str, iqn: &str) -> ApiResult<()>;
    async fn igroup_remove(&self, igroup: &str, iqn: &str, force: bool) -> ApiResult<()>;

    // --- CHAP ---
    async fn iscsi_initiator_get_default_auth(&self) -> ApiResult<DefaultAuth>;
    async fn iscsi_initiator_set_default_auth(
        &self,
        auth_type: &str,
        credentials: &ChapCredentials,
    ) -> ApiResult<()>;

    // --- snapshot ---
    async fn snapshot_create(&self, snapshot: &str, volume: &str) -> ApiResult<()>;
    async fn snapshot_list(&self, volume: &str) -> ApiResult<Vec<SnapshotInfo>>;
    async fn snapshot_delete(&self, snapshot: &str, volume: &str) -> ApiResult<()>;
    async fn snapshot_restore_volume(&self, snapshot: &str, volume: &str) -> ApiResult<()>;

    // --- clone ---
    async fn volume_clone_create(&self, name: &str, source: &str, snapshot: &str) -> ApiResult<()>;
    async fn volume_clone_create_async(
        &self,
        name: &str,
        source: &str,
        snapshot: &str,
    ) -> ApiResult<JobId>;
    async fn job_status(&self, job: &JobId) -> ApiResult<JobState>;
    async fn volume_clone_split_start(&self, name: &str) -> ApiResult<()>;

    // --- volume ---
    async fn volume_exists(&self, name: &str) -> ApiResult<bool>;
    async fn volume_get(&self, name: &str) -> ApiResult<VolumeAttributes>;
    async fn volume_mount(&self, name: &str, junction: &str) -> ApiResult<()>;
    async fn volume_unmount(&self, name: &str, force: bool) -> ApiResult<()>;
    async fn volume_offline(&self, name: &str) -> ApiResult<()>;
    async fn volume_list_backed_by_snapshot(
        &self,
        volume: &str,
        snapshot: &str,
    ) -> ApiResult<Vec<String>>;
    async fn volume_modify_export_policy(&self, volume: &str, policy: &str) -> ApiResult<()>;

    // --- aggregate ---
    async fn vserver_aggregate_names(&self) -> ApiResult<Vec<String>>;
    async fn aggregate_attributes(&self) -> ApiResult<Vec<AggregateAttributes>>;
    async fn aggregate_space(&self, aggregate: &str) -> ApiResult<Vec<AggregateSpace>>;

    // --- iSCSI / LUN ---
    async fn iscsi_node_name(&self) -> ApiResult<String>;
    async fn iscsi_interfaces(&self) -> ApiResult<Vec<IscsiInterface>>;
    async fn lun_map_get(&self, igroup: &str, lun_path: &str) -> ApiResult<Vec<LunMapInfo>>;
    /// Maps the LUN unless it is already mapped; returns the LUN id
    async fn lun_map_if_not_mapped(
        &self,
        igroup: &str,
        lun_path: &str,
        import_not_managed: bool,
    ) -> ApiResult<u32>;
    async fn lun_get_attribute(&self, lun_path: &str, attribute: &str) -> ApiResult<String>;
    async fn lun_list_for_vserver(&self) -> ApiResult<Vec<String>>;
    /// Node owning the data LIF with this address
    async fn data_lif_node(&self, ip: &str) -> ApiResult<String>;

    fn supports_feature(&self, feature: ApplianceFeature) -> bool;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type ManagementClientRef = Arc<dyn ManagementClient>;
