//! Simulated Appliance
//!
//! In-memory implementation of the management API with the same error codes
//! a real appliance reports. Every call is recorded so callers can assert on
//! what was (or was not) sent, and faults can be injected per operation.

use crate::domain::ports::*;
use crate::error::{ApiError, ApiErrorCode};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use tracing::debug;

// =============================================================================
// Recorded State
// =============================================================================

/// A volume (or clone) held by the simulated appliance
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VolumeRecord {
    pub aggregate: String,
    pub space_reserve: String,
    pub size_bytes: u64,
    pub snapshots: Vec<SnapshotInfo>,
    /// `(source volume, snapshot)` while the clone is still backed by it
    pub clone_parent: Option<(String, String)>,
    pub split_started: bool,
    pub junction: Option<String>,
    pub online: bool,
    pub export_policy: String,
}

#[derive(Debug, Default)]
struct LunRecord {
    attributes: BTreeMap<String, String>,
    /// igroup -> LUN id
    maps: BTreeMap<String, u32>,
}

#[derive(Debug)]
struct CloneJob {
    name: String,
    source: String,
    snapshot: String,
    polls_remaining: u32,
}

/// One recorded API call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub operation: &'static str,
    pub mutating: bool,
}

#[derive(Debug, Clone)]
struct Fault {
    error: ApiError,
    /// Perform the operation before failing
    apply: bool,
}

#[derive(Debug, Default)]
struct ApplianceState {
    policies: BTreeMap<String, Vec<ExportRule>>,
    next_rule_index: u32,
    igroups: BTreeMap<String, BTreeSet<String>>,
    default_auth: DefaultAuth,

    volumes: BTreeMap<String, VolumeRecord>,
    jobs: HashMap<String, CloneJob>,
    next_job: u64,
    job_polls: u32,

    svm_aggregates: Vec<String>,
    aggregate_attributes: Vec<AggregateAttributes>,
    aggregate_space: BTreeMap<String, AggregateSpace>,

    iscsi_node_name: String,
    iscsi_interfaces: Vec<IscsiInterface>,
    luns: BTreeMap<String, LunRecord>,
    next_lun_id: u32,
    data_lifs: BTreeMap<String, String>,
    reporting_nodes: Vec<String>,

    features: HashSet<ApplianceFeature>,
    faults: HashMap<&'static str, VecDeque<Fault>>,
    calls: Vec<RecordedCall>,
}

// =============================================================================
// Simulated Appliance
// =============================================================================

/// In-memory stand-in for a storage virtual machine
#[derive(Debug, Default)]
pub struct SimulatedAppliance {
    state: Mutex<ApplianceState>,
}

impl SimulatedAppliance {
    pub fn new() -> Self {
        let appliance = Self::default();
        {
            let mut state = appliance.state.lock();
            state.next_rule_index = 1;
            state.iscsi_node_name = "iqn.1992-08.com.netapp:sn.simulated:vs.1".to_string();
            state.default_auth.auth_type = Some("none".to_string());
        }
        appliance
    }

    // --- setup ---

    pub fn add_aggregate(&self, name: &str, aggregate_type: &str, size_bytes: u64, used_bytes: u64) {
        let mut state = self.state.lock();
        state.svm_aggregates.push(name.to_string());
        state.aggregate_attributes.push(AggregateAttributes {
            aggregate: name.to_string(),
            aggregate_type: aggregate_type.to_string(),
        });
        state.aggregate_space.insert(
            name.to_string(),
            AggregateSpace {
                aggregate: name.to_string(),
                size_bytes,
                used_including_snapshot_reserve: used_bytes,
            },
        );
    }

    pub fn add_volume(&self, name: &str, aggregate: &str, size_bytes: u64, space_reserve: &str) {
        self.state.lock().volumes.insert(
            name.to_string(),
            VolumeRecord {
                aggregate: aggregate.to_string(),
                space_reserve: space_reserve.to_string(),
                size_bytes,
                online: true,
                ..Default::default()
            },
        );
    }

    pub fn add_snapshot(&self, volume: &str, snapshot: &str, access_time: i64) {
        if let Some(record) = self.state.lock().volumes.get_mut(volume) {
            record.snapshots.push(SnapshotInfo {
                name: snapshot.to_string(),
                access_time,
            });
        }
    }

    pub fn add_export_policy(&self, policy: &str, client_matches: &[&str]) {
        let mut state = self.state.lock();
        let mut rules = Vec::new();
        for client_match in client_matches {
            rules.push(ExportRule {
                client_match: client_match.to_string(),
                rule_index: state.next_rule_index,
            });
            state.next_rule_index += 1;
        }
        state.policies.insert(policy.to_string(), rules);
    }

    pub fn add_igroup(&self, igroup: &str, members: &[&str]) {
        self.state.lock().igroups.insert(
            igroup.to_string(),
            members.iter().map(|m| m.to_string()).collect(),
        );
    }

    pub fn add_lun(&self, lun_path: &str, fstype: Option<&str>) {
        let mut record = LunRecord::default();
        if let Some(fstype) = fstype {
            record
                .attributes
                .insert("com.netapp.ndvp.fstype".to_string(), fstype.to_string());
        }
        self.state.lock().luns.insert(lun_path.to_string(), record);
    }

    pub fn add_iscsi_interface(&self, ip: &str, port: u16, enabled: bool) {
        self.state.lock().iscsi_interfaces.push(IscsiInterface {
            ip_address: ip.to_string(),
            port,
            enabled,
        });
    }

    pub fn add_data_lif(&self, ip: &str, node: &str) {
        self.state
            .lock()
            .data_lifs
            .insert(ip.to_string(), node.to_string());
    }

    pub fn set_reporting_nodes(&self, nodes: &[&str]) {
        self.state.lock().reporting_nodes = nodes.iter().map(|n| n.to_string()).collect();
    }

    pub fn set_default_auth(&self, auth: DefaultAuth) {
        self.state.lock().default_auth = auth;
    }

    pub fn enable_feature(&self, feature: ApplianceFeature) {
        self.state.lock().features.insert(feature);
    }

    /// Number of status polls before an async clone job completes
    pub fn set_job_polls(&self, polls: u32) {
        self.state.lock().job_polls = polls;
    }

    /// Fail the next call of `operation` without performing it
    pub fn inject_fault(&self, operation: &'static str, error: ApiError) {
        self.push_fault(operation, error, false);
    }

    /// Perform the next call of `operation`, then report `error`
    pub fn inject_fault_after_apply(&self, operation: &'static str, error: ApiError) {
        self.push_fault(operation, error, true);
    }

    fn push_fault(&self, operation: &'static str, error: ApiError, apply: bool) {
        self.state
            .lock()
            .faults
            .entry(operation)
            .or_default()
            .push_back(Fault { error, apply });
    }

    // --- inspection ---

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.state.lock().calls.clone()
    }

    pub fn call_names(&self) -> Vec<&'static str> {
        self.state.lock().calls.iter().map(|c| c.operation).collect()
    }

    pub fn mutating_calls(&self) -> usize {
        self.state.lock().calls.iter().filter(|c| c.mutating).count()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    pub fn export_rules(&self, policy: &str) -> Option<BTreeSet<String>> {
        self.state
            .lock()
            .policies
            .get(policy)
            .map(|rules| rules.iter().map(|r| r.client_match.clone()).collect())
    }

    pub fn igroup_members(&self, igroup: &str) -> Option<BTreeSet<String>> {
        self.state.lock().igroups.get(igroup).cloned()
    }

    pub fn volume(&self, name: &str) -> Option<VolumeRecord> {
        self.state.lock().volumes.get(name).cloned()
    }

    pub fn default_auth(&self) -> DefaultAuth {
        self.state.lock().default_auth.clone()
    }

    pub fn lun_id(&self, lun_path: &str, igroup: &str) -> Option<u32> {
        self.state
            .lock()
            .luns
            .get(lun_path)
            .and_then(|lun| lun.maps.get(igroup).copied())
    }

    // --- call bookkeeping ---

    /// Record the call and consult injected faults.
    ///
    /// `Ok(None)` proceeds normally, `Ok(Some(e))` performs the operation and
    /// then fails with `e`, `Err(e)` fails without touching state.
    fn begin(
        state: &mut ApplianceState,
        operation: &'static str,
        mutating: bool,
    ) -> ApiResult<Option<ApiError>> {
        state.calls.push(RecordedCall {
            operation,
            mutating,
        });
        debug!(operation, "Simulated appliance call");

        match state.faults.get_mut(operation).and_then(|q| q.pop_front()) {
            Some(Fault { error, apply: false }) => Err(error),
            Some(Fault { error, apply: true }) => Ok(Some(error)),
            None => Ok(None),
        }
    }

    fn finish<T>(result: ApiResult<T>, late: Option<ApiError>) -> ApiResult<T> {
        match (result, late) {
            (Ok(_), Some(error)) => Err(error),
            (result, _) => result,
        }
    }
}

fn not_found(kind: &str, name: &str) -> ApiError {
    ApiError::not_found(format!("{} {} not found", kind, name))
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

// =============================================================================
// Management Client Implementation
// =============================================================================

#[async_trait]
impl ManagementClient for SimulatedAppliance {
    async fn export_policy_create(&self, policy: &str) -> ApiResult<()> {
        let mut state = self.state.lock();
        let late = Self::begin(&mut state, "export_policy_create", true)?;
        let result = if state.policies.contains_key(policy) {
            Err(ApiError::new(
                ApiErrorCode::AlreadyExists,
                format!("export policy {} already exists", policy),
            ))
        } else {
            state.policies.insert(policy.to_string(), Vec::new());
            Ok(())
        };
        Self::finish(result, late)
    }

    async fn export_policy_destroy(&self, policy: &str) -> ApiResult<()> {
        let mut state = self.state.lock();
        let late = Self::begin(&mut state, "export_policy_destroy", true)?;
        let result = match state.policies.remove(policy) {
            Some(_) => Ok(()),
            None => Err(not_found("export policy", policy)),
        };
        Self::finish(result, late)
    }

    async fn export_policy_get(&self, policy: &str) -> ApiResult<()> {
        let mut state = self.state.lock();
        let late = Self::begin(&mut state, "export_policy_get", false)?;
        let result = if state.policies.contains_key(policy) {
            Ok(())
        } else {
            Err(not_found("export policy", policy))
        };
        Self::finish(result, late)
    }

    async fn export_rule_list(&self, policy: &str) -> ApiResult<Vec<ExportRule>> {
        let mut state = self.state.lock();
        let late = Self::begin(&mut state, "export_rule_list", false)?;
        let result = state
            .policies
            .get(policy)
            .cloned()
            .ok_or_else(|| not_found("export policy", policy));
        Self::finish(result, late)
    }

    async fn export_rule_create(
        &self,
        policy: &str,
        client_match: &str,
        _protocols: &[&str],
        _ro_rules: &[&str],
        _rw_rules: &[&str],
        _superuser_rules: &[&str],
    ) -> ApiResult<()> {
        let mut state = self.state.lock();
        let late = Self::begin(&mut state, "export_rule_create", true)?;
        let index = state.next_rule_index;
        let result = match state.policies.get_mut(policy) {
            Some(rules) => {
                rules.push(ExportRule {
                    client_match: client_match.to_string(),
                    rule_index: index,
                });
                Ok(())
            }
            None => Err(not_found("export policy", policy)),
        };
        if result.is_ok() {
            state.next_rule_index += 1;
        }
        Self::finish(result, late)
    }

    async fn export_rule_destroy(&self, policy: &str, rule_index: u32) -> ApiResult<()> {
        let mut state = self.state.lock();
        let late = Self::begin(&mut state, "export_rule_destroy", true)?;
        let result = match state.policies.get_mut(policy) {
            Some(rules) => match rules.iter().position(|r| r.rule_index == rule_index) {
                Some(pos) => {
                    rules.remove(pos);
                    Ok(())
                }
                None => Err(not_found("export rule", &rule_index.to_string())),
            },
            None => Err(not_found("export policy", policy)),
        };
        Self::finish(result, late)
    }

    async fn igroup_create(&self, igroup: &str, _protocol: &str, _os_type: &str) -> ApiResult<()> {
        let mut state = self.state.lock();
        let late = Self::begin(&mut state, "igroup_create", true)?;
        let result = if state.igroups.contains_key(igroup) {
            Err(ApiError::new(
                ApiErrorCode::AlreadyExists,
                format!("igroup {} already exists", igroup),
            ))
        } else {
            state.igroups.insert(igroup.to_string(), BTreeSet::new());
            Ok(())
        };
        Self::finish(result, late)
    }

    async fn igroup_get(&self, igroup: &str) -> ApiResult<Vec<String>> {
        let mut state = self.state.lock();
        let late = Self::begin(&mut state, "igroup_get", false)?;
        let result = state
            .igroups
            .get(igroup)
            .map(|members| members.iter().cloned().collect())
            .ok_or_else(|| not_found("igroup", igroup));
        Self::finish(result, late)
    }

    async fn igroup_add(&self, igroup: &str, iqn: &str) -> ApiResult<()> {
        let mut state = self.state.lock();
        let late = Self::begin(&mut state, "igroup_add", true)?;
        let result = match state.igroups.get_mut(igroup) {
            Some(members) if members.contains(iqn) => Err(ApiError::new(
                ApiErrorCode::AlreadyPresent,
                format!("initiator {} already in igroup {}", iqn, igroup),
            )),
            Some(members) => {
                members.insert(iqn.to_string());
                Ok(())
            }
            None => Err(not_found("igroup", igroup)),
        };
        Self::finish(result, late)
    }

    async fn igroup_remove(&self, igroup: &str, iqn: &str, _force: bool) -> ApiResult<()> {
        let mut state = self.state.lock();
        let late = Self::begin(&mut state, "igroup_remove", true)?;
        let result = match state.igroups.get_mut(igroup) {
            Some(members) => {
                if members.remove(iqn) {
                    Ok(())
                } else {
                    Err(ApiError::new(
                        ApiErrorCode::NotPresent,
                        format!("initiator {} not in igroup {}", iqn, igroup),
                    ))
                }
            }
            None => Err(not_found("igroup", igroup)),
        };
        Self::finish(result, late)
    }

    async fn iscsi_initiator_get_default_auth(&self) -> ApiResult<DefaultAuth> {
        let mut state = self.state.lock();
        let late = Self::begin(&mut state, "iscsi_initiator_get_default_auth", false)?;
        let result = Ok(state.default_auth.clone());
        Self::finish(result, late)
    }

    async fn iscsi_initiator_set_default_auth(
        &self,
        auth_type: &str,
        credentials: &ChapCredentials,
    ) -> ApiResult<()> {
        let mut state = self.state.lock();
        let late = Self::begin(&mut state, "iscsi_initiator_set_default_auth", true)?;
        let chap = auth_type.eq_ignore_ascii_case("chap");
        state.default_auth = DefaultAuth {
            auth_type: Some(auth_type.to_string()),
            user_name: chap.then(|| credentials.chap_username.clone()),
            outbound_user_name: chap.then(|| credentials.chap_target_username.clone()),
        };
        Self::finish(Ok(()), late)
    }

    async fn snapshot_create(&self, snapshot: &str, volume: &str) -> ApiResult<()> {
        let mut state = self.state.lock();
        let late = Self::begin(&mut state, "snapshot_create", true)?;
        let result = match state.volumes.get_mut(volume) {
            Some(record) if record.snapshots.iter().any(|s| s.name == snapshot) => {
                Err(ApiError::new(
                    ApiErrorCode::AlreadyExists,
                    format!("snapshot {} already exists", snapshot),
                ))
            }
            Some(record) => {
                record.snapshots.push(SnapshotInfo {
                    name: snapshot.to_string(),
                    access_time: now(),
                });
                Ok(())
            }
            None => Err(not_found("volume", volume)),
        };
        Self::finish(result, late)
    }

    async fn snapshot_list(&self, volume: &str) -> ApiResult<Vec<SnapshotInfo>> {
        let mut state = self.state.lock();
        let late = Self::begin(&mut state, "snapshot_list", false)?;
        let result = state
            .volumes
            .get(volume)
            .map(|record| record.snapshots.clone())
            .ok_or_else(|| not_found("volume", volume));
        Self::finish(result, late)
    }

    async fn snapshot_delete(&self, snapshot: &str, volume: &str) -> ApiResult<()> {
        let mut state = self.state.lock();
        let late = Self::begin(&mut state, "snapshot_delete", true)?;
        let busy = state.volumes.values().any(|v| {
            v.clone_parent
                .as_ref()
                .map(|(src, snap)| src == volume && snap == snapshot)
                .unwrap_or(false)
        });
        let result = match state.volumes.get_mut(volume) {
            Some(_) if busy => Err(ApiError::new(
                ApiErrorCode::Busy,
                format!("snapshot {} has dependent clones", snapshot),
            )),
            Some(record) => match record.snapshots.iter().position(|s| s.name == snapshot) {
                Some(pos) => {
                    record.snapshots.remove(pos);
                    Ok(())
                }
                None => Err(not_found("snapshot", snapshot)),
            },
            None => Err(not_found("volume", volume)),
        };
        Self::finish(result, late)
    }

    async fn snapshot_restore_volume(&self, snapshot: &str, volume: &str) -> ApiResult<()> {
        let mut state = self.state.lock();
        let late = Self::begin(&mut state, "snapshot_restore_volume", true)?;
        let result = match state.volumes.get(volume) {
            Some(record) if record.snapshots.iter().any(|s| s.name == snapshot) => Ok(()),
            Some(_) => Err(not_found("snapshot", snapshot)),
            None => Err(not_found("volume", volume)),
        };
        Self::finish(result, late)
    }

    async fn volume_clone_create(&self, name: &str, source: &str, snapshot: &str) -> ApiResult<()> {
        let mut state = self.state.lock();
        let late = Self::begin(&mut state, "volume_clone_create", true)?;
        let result = create_clone(&mut state, name, source, snapshot);
        Self::finish(result, late)
    }

    async fn volume_clone_create_async(
        &self,
        name: &str,
        source: &str,
        snapshot: &str,
    ) -> ApiResult<JobId> {
        let mut state = self.state.lock();
        let late = Self::begin(&mut state, "volume_clone_create_async", true)?;
        state.next_job += 1;
        let id = format!("job-{}", state.next_job);
        let polls_remaining = state.job_polls;
        state.jobs.insert(
            id.clone(),
            CloneJob {
                name: name.to_string(),
                source: source.to_string(),
                snapshot: snapshot.to_string(),
                polls_remaining,
            },
        );
        Self::finish(Ok(JobId(id)), late)
    }

    async fn job_status(&self, job: &JobId) -> ApiResult<JobState> {
        let mut state = self.state.lock();
        let late = Self::begin(&mut state, "job_status", false)?;
        let pending = state.jobs.get(&job.0).map(|j| j.polls_remaining);
        let result = match pending {
            Some(polls) if polls > 0 => {
                if let Some(j) = state.jobs.get_mut(&job.0) {
                    j.polls_remaining -= 1;
                }
                Ok(JobState::Running)
            }
            Some(_) => match state.jobs.remove(&job.0) {
                Some(j) => match create_clone(&mut state, &j.name, &j.source, &j.snapshot) {
                    Ok(()) => Ok(JobState::Success),
                    Err(e) => Ok(JobState::Failure(e.message)),
                },
                None => Err(not_found("job", &job.0)),
            },
            None => Err(not_found("job", &job.0)),
        };
        Self::finish(result, late)
    }

    async fn volume_clone_split_start(&self, name: &str) -> ApiResult<()> {
        let mut state = self.state.lock();
        let late = Self::begin(&mut state, "volume_clone_split_start", true)?;
        let result = match state.volumes.get_mut(name) {
            Some(record) => {
                record.split_started = true;
                record.clone_parent = None;
                Ok(())
            }
            None => Err(not_found("volume", name)),
        };
        Self::finish(result, late)
    }

    async fn volume_exists(&self, name: &str) -> ApiResult<bool> {
        let mut state = self.state.lock();
        let late = Self::begin(&mut state, "volume_exists", false)?;
        let result = Ok(state.volumes.contains_key(name));
        Self::finish(result, late)
    }

    async fn volume_get(&self, name: &str) -> ApiResult<VolumeAttributes> {
        let mut state = self.state.lock();
        let late = Self::begin(&mut state, "volume_get", false)?;
        let result = state
            .volumes
            .get(name)
            .map(|record| VolumeAttributes {
                name: name.to_string(),
                aggregate: (!record.aggregate.is_empty()).then(|| record.aggregate.clone()),
                space_reserve: (!record.space_reserve.is_empty())
                    .then(|| record.space_reserve.clone()),
                size_bytes: record.size_bytes,
            })
            .ok_or_else(|| not_found("volume", name));
        Self::finish(result, late)
    }

    async fn volume_mount(&self, name: &str, junction: &str) -> ApiResult<()> {
        let mut state = self.state.lock();
        let late = Self::begin(&mut state, "volume_mount", true)?;
        let result = match state.volumes.get_mut(name) {
            Some(record) => {
                record.junction = Some(junction.to_string());
                Ok(())
            }
            None => Err(not_found("volume", name)),
        };
        Self::finish(result, late)
    }

    async fn volume_unmount(&self, name: &str, _force: bool) -> ApiResult<()> {
        let mut state = self.state.lock();
        let late = Self::begin(&mut state, "volume_unmount", true)?;
        let result = match state.volumes.get_mut(name) {
            Some(record) => {
                record.junction = None;
                Ok(())
            }
            None => Err(not_found("volume", name)),
        };
        Self::finish(result, late)
    }

    async fn volume_offline(&self, name: &str) -> ApiResult<()> {
        let mut state = self.state.lock();
        let late = Self::begin(&mut state, "volume_offline", true)?;
        let result = match state.volumes.get_mut(name) {
            Some(record) if !record.online => Err(ApiError::new(
                ApiErrorCode::VolumeOffline,
                format!("volume {} is already offline", name),
            )),
            Some(record) => {
                record.online = false;
                Ok(())
            }
            None => Err(not_found("volume", name)),
        };
        Self::finish(result, late)
    }

    async fn volume_list_backed_by_snapshot(
        &self,
        volume: &str,
        snapshot: &str,
    ) -> ApiResult<Vec<String>> {
        let mut state = self.state.lock();
        let late = Self::begin(&mut state, "volume_list_backed_by_snapshot", false)?;
        let result = Ok(state
            .volumes
            .iter()
            .filter(|(_, v)| {
                v.clone_parent
                    .as_ref()
                    .map(|(src, snap)| src == volume && snap == snapshot)
                    .unwrap_or(false)
            })
            .map(|(name, _)| name.clone())
            .collect());
        Self::finish(result, late)
    }

    async fn volume_modify_export_policy(&self, volume: &str, policy: &str) -> ApiResult<()> {
        let mut state = self.state.lock();
        let late = Self::begin(&mut state, "volume_modify_export_policy", true)?;
        let result = if !state.policies.contains_key(policy) {
            Err(not_found("export policy", policy))
        } else {
            match state.volumes.get_mut(volume) {
                Some(record) => {
                    record.export_policy = policy.to_string();
                    Ok(())
                }
                None => Err(not_found("volume", volume)),
            }
        };
        Self::finish(result, late)
    }

    async fn vserver_aggregate_names(&self) -> ApiResult<Vec<String>> {
        let mut state = self.state.lock();
        let late = Self::begin(&mut state, "vserver_aggregate_names", false)?;
        let result = Ok(state.svm_aggregates.clone());
        Self::finish(result, late)
    }

    async fn aggregate_attributes(&self) -> ApiResult<Vec<AggregateAttributes>> {
        let mut state = self.state.lock();
        let late = Self::begin(&mut state, "aggregate_attributes", false)?;
        let result = Ok(state.aggregate_attributes.clone());
        Self::finish(result, late)
    }

    async fn aggregate_space(&self, aggregate: &str) -> ApiResult<Vec<AggregateSpace>> {
        let mut state = self.state.lock();
        let late = Self::begin(&mut state, "aggregate_space", false)?;
        let result = Ok(state
            .aggregate_space
            .get(aggregate)
            .cloned()
            .into_iter()
            .collect());
        Self::finish(result, late)
    }

    async fn iscsi_node_name(&self) -> ApiResult<String> {
        let mut state = self.state.lock();
        let late = Self::begin(&mut state, "iscsi_node_name", false)?;
        let result = Ok(state.iscsi_node_name.clone());
        Self::finish(result, late)
    }

    async fn iscsi_interfaces(&self) -> ApiResult<Vec<IscsiInterface>> {
        let mut state = self.state.lock();
        let late = Self::begin(&mut state, "iscsi_interfaces", false)?;
        let result = Ok(state.iscsi_interfaces.clone());
        Self::finish(result, late)
    }

    async fn lun_map_get(&self, igroup: &str, lun_path: &str) -> ApiResult<Vec<LunMapInfo>> {
        let mut state = self.state.lock();
        let late = Self::begin(&mut state, "lun_map_get", false)?;
        let result = match state.luns.get(lun_path) {
            Some(lun) if lun.maps.contains_key(igroup) => Ok(vec![LunMapInfo {
                reporting_nodes: state.reporting_nodes.clone(),
            }]),
            Some(_) => Ok(Vec::new()),
            None => Err(not_found("LUN", lun_path)),
        };
        Self::finish(result, late)
    }

    async fn lun_map_if_not_mapped(
        &self,
        igroup: &str,
        lun_path: &str,
        _import_not_managed: bool,
    ) -> ApiResult<u32> {
        let mut state = self.state.lock();
        let late = Self::begin(&mut state, "lun_map_if_not_mapped", true)?;
        let next_id = state.next_lun_id;
        let result = match state.luns.get_mut(lun_path) {
            Some(lun) => match lun.maps.get(igroup) {
                Some(id) => Ok((*id, false)),
                None => {
                    lun.maps.insert(igroup.to_string(), next_id);
                    Ok((next_id, true))
                }
            },
            None => Err(not_found("LUN", lun_path)),
        };
        let result = result.map(|(id, assigned)| {
            if assigned {
                state.next_lun_id += 1;
            }
            id
        });
        Self::finish(result, late)
    }

    async fn lun_get_attribute(&self, lun_path: &str, attribute: &str) -> ApiResult<String> {
        let mut state = self.state.lock();
        let late = Self::begin(&mut state, "lun_get_attribute", false)?;
        let result = match state.luns.get(lun_path) {
            Some(lun) => lun
                .attributes
                .get(attribute)
                .cloned()
                .ok_or_else(|| not_found("LUN attribute", attribute)),
            None => Err(not_found("LUN", lun_path)),
        };
        Self::finish(result, late)
    }

    async fn lun_list_for_vserver(&self) -> ApiResult<Vec<String>> {
        let mut state = self.state.lock();
        let late = Self::begin(&mut state, "lun_list_for_vserver", false)?;
        let result = Ok(state.luns.keys().cloned().collect());
        Self::finish(result, late)
    }

    async fn data_lif_node(&self, ip: &str) -> ApiResult<String> {
        let mut state = self.state.lock();
        let late = Self::begin(&mut state, "data_lif_node", false)?;
        let result = state
            .data_lifs
            .get(ip)
            .cloned()
            .ok_or_else(|| not_found("data LIF", ip));
        Self::finish(result, late)
    }

    fn supports_feature(&self, feature: ApplianceFeature) -> bool {
        self.state.lock().features.contains(&feature)
    }
}

fn create_clone(
    state: &mut ApplianceState,
    name: &str,
    source: &str,
    snapshot: &str,
) -> ApiResult<()> {
    if state.volumes.contains_key(name) {
        return Err(ApiError::new(
            ApiErrorCode::AlreadyExists,
            format!("volume {} already exists", name),
        ));
    }
    let parent = state
        .volumes
        .get(source)
        .ok_or_else(|| not_found("volume", source))?;
    if !parent.snapshots.iter().any(|s| s.name == snapshot) {
        return Err(not_found("snapshot", snapshot));
    }

    let record = VolumeRecord {
        aggregate: parent.aggregate.clone(),
        space_reserve: parent.space_reserve.clone(),
        size_bytes: parent.size_bytes,
        clone_parent: Some((source.to_string(), snapshot.to_string())),
        online: true,
        ..Default::default()
    };
    state.volumes.insert(name.to_string(), record);
    Ok(())
}
