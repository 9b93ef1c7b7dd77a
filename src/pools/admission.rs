//! Admission control
//!
//! Decides whether this backend can host a new volume: which physical pools
//! are candidates, whether the backing aggregate has room under the
//! configured usage limit, and what the effective volume options are.

use super::capability::{attrs, Requests, StoragePool};
use super::{PoolSource, MINIMUM_VOLUME_SIZE_BYTES};
use crate::domain::ports::ManagementClient;
use crate::error::{Error, Result};
use crate::units::parse_size;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

// =============================================================================
// Volume Request
// =============================================================================

/// Per-volume settings supplied by the orchestrator. Empty strings mean
/// "use the pool value".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VolumeRequest {
    pub name: String,
    pub internal_name: String,
    pub size_bytes: u64,
    pub snapshot_policy: String,
    pub snapshot_reserve: String,
    pub unix_permissions: String,
    pub snapshot_dir: String,
    pub export_policy: String,
    pub space_reserve: String,
    pub security_style: String,
    pub split_on_clone: String,
    pub file_system: String,
    pub encryption: String,
}

// =============================================================================
// Pool Selection
// =============================================================================

/// Physical pools that may host the volume.
///
/// A physical pool hint is returned as is. A virtual pool hint is resolved to
/// every physical pool matching the request attributes, in random order so
/// that load spreads across aggregates.
pub fn select_candidate_pools<'a, S: PoolSource>(
    pools: &'a S,
    hint: &str,
    requests: &Requests,
    volume: &str,
) -> Result<Vec<&'a StoragePool>> {
    if let Some(pool) = pools.physical_pools().get(hint) {
        return Ok(vec![pool]);
    }

    if !pools.virtual_pools().contains_key(hint) {
        return Err(Error::PoolNotFound {
            pool: hint.to_string(),
        });
    }

    // Label selectors were already matched against the virtual pool
    let mut matchable = requests.clone();
    matchable.remove(attrs::SELECTOR);

    let mut candidates: Vec<&StoragePool> = pools
        .physical_pools()
        .values()
        .filter(|pool| pool.matches(&matchable))
        .collect();

    if candidates.is_empty() {
        return Err(Error::BackendIneligible {
            volume: volume.to_string(),
            reason: "backend has no physical pools that can satisfy request".into(),
        });
    }

    candidates.shuffle(&mut rand::thread_rng());
    debug!(
        volume = %volume,
        pool = %hint,
        candidates = candidates.len(),
        "Resolved virtual pool to physical pools"
    );
    Ok(candidates)
}

// =============================================================================
// Aggregate Limits
// =============================================================================

/// Reject the volume when its aggregate is at or above `limit` percent used.
///
/// Thick volumes (`spaceReserve=volume`) count the requested size against the
/// aggregate; thin volumes do not.
pub async fn check_aggregate_usage_limit(
    client: &dyn ManagementClient,
    limit: &str,
    aggregate: &str,
    space_reserve: &str,
    requested_bytes: u64,
) -> Result<()> {
    let limit = limit.replace('%', "");
    debug!(
        aggregate = %aggregate,
        requested_size = requested_bytes,
        limit_aggregate_usage = %limit,
        "Checking aggregate limits"
    );

    if limit.is_empty() {
        debug!("No limits specified");
        return Ok(());
    }
    if aggregate.is_empty() {
        return Err(Error::Validation(
            "aggregate not provided, cannot check aggregate provisioning limits".into(),
        ));
    }

    let percent_limit: f64 = limit.trim().parse().map_err(|_| {
        Error::Configuration(format!("invalid limitAggregateUsage value {:?}", limit))
    })?;

    let report = client
        .aggregate_space(aggregate)
        .await
        .map_err(|e| Error::api("get aggregate space", aggregate, e))?;

    let space = report
        .iter()
        .find(|s| s.aggregate == aggregate)
        .ok_or_else(|| Error::ResourceNotFound {
            kind: "aggregate".into(),
            name: aggregate.to_string(),
        })?;

    info!(
        aggregate = %space.aggregate,
        size = space.size_bytes,
        used_including_snapshot_reserve = space.used_including_snapshot_reserve,
        "Aggregate space"
    );

    if space.size_bytes == 0 {
        return Err(Error::Internal(format!(
            "aggregate {} reports a size of zero bytes",
            space.aggregate
        )));
    }

    let used = space.used_including_snapshot_reserve as f64;
    let size = space.size_bytes as f64;
    let (percent_used, verb) = if space_reserve == "volume" {
        (((used + requested_bytes as f64) / size) * 100.0, "would exceed")
    } else {
        ((used / size) * 100.0, "exceeds")
    };

    debug!(
        percent_used,
        percent_limit,
        space_reserve = %space_reserve,
        "Checking usage percentage limits"
    );

    if percent_used >= percent_limit {
        return Err(Error::AggregateLimitExceeded {
            aggregate: aggregate.to_string(),
            percent_used,
            limit: percent_limit,
            verb,
        });
    }

    debug!("Request within specified limits");
    Ok(())
}

/// Admission check for growing an existing volume: the aggregate and space
/// guarantee come from the volume itself
pub async fn check_aggregate_limits_for_volume(
    client: &dyn ManagementClient,
    limit: &str,
    volume: &str,
    requested_bytes: u64,
) -> Result<()> {
    let info = client
        .volume_get(volume)
        .await
        .map_err(|e| Error::api("get volume", volume, e))?;

    let aggregate = info.aggregate.ok_or_else(|| {
        Error::Internal(format!("aggregate info not available from volume {}", volume))
    })?;
    let space_reserve = info.space_reserve.ok_or_else(|| {
        Error::Internal(format!("spaceReserve info not available from volume {}", volume))
    })?;

    check_aggregate_usage_limit(client, limit, &aggregate, &space_reserve, requested_bytes).await
}

/// Reject volumes larger than `limitVolumeSize`, when set
pub fn check_volume_size_limit(requested_bytes: u64, limit: &str) -> Result<()> {
    if limit.is_empty() {
        return Ok(());
    }
    let limit_bytes = parse_size(limit)
        .map_err(|e| Error::Configuration(format!("invalid limitVolumeSize {:?}: {}", limit, e)))?;
    if requested_bytes > limit_bytes {
        return Err(Error::Validation(format!(
            "requested size {} bytes exceeds the volume size limit of {} bytes",
            requested_bytes, limit_bytes
        )));
    }
    Ok(())
}

// =============================================================================
// Volume Sizing & Options
// =============================================================================

/// Effective size of a new volume; zero means the pool default
pub fn get_volume_size(requested_bytes: u64, pool_default: &str) -> Result<u64> {
    let size = if requested_bytes == 0 {
        parse_size(pool_default).unwrap_or(0)
    } else {
        requested_bytes
    };

    if size < MINIMUM_VOLUME_SIZE_BYTES {
        return Err(Error::VolumeTooSmall {
            requested: size,
            minimum: MINIMUM_VOLUME_SIZE_BYTES,
        });
    }
    Ok(size)
}

/// Snapshot reserve percentage to request; `None` leaves the appliance default
pub fn get_snapshot_reserve(snapshot_policy: &str, snapshot_reserve: &str) -> Result<Option<u32>> {
    if !snapshot_reserve.is_empty() {
        return snapshot_reserve.trim().parse::<u32>().map(Some).map_err(|_| {
            Error::Validation(format!("invalid snapshotReserve {:?}", snapshot_reserve))
        });
    }
    if snapshot_policy == "none" {
        Ok(Some(0))
    } else {
        Ok(None)
    }
}

/// Volume options derived from request attributes, then overridden by
/// explicit per-volume settings
pub fn volume_opts(volume: &VolumeRequest, requests: &Requests) -> BTreeMap<String, String> {
    let mut opts = BTreeMap::new();

    if let Some(request) = requests.get(attrs::PROVISIONING_TYPE) {
        match request.as_str() {
            Some("thin") => {
                opts.insert("spaceReserve".to_string(), "none".to_string());
            }
            Some("thick") => {
                opts.insert("spaceReserve".to_string(), "volume".to_string());
            }
            _ => warn!(
                provisioning_type = ?request,
                "Expected 'thick' or 'thin' for provisioningType; ignoring"
            ),
        }
    }

    if let Some(request) = requests.get(attrs::ENCRYPTION) {
        match request.as_bool() {
            Some(true) => {
                opts.insert("encryption".to_string(), "true".to_string());
            }
            Some(false) => {}
            None => warn!(encryption = ?request, "Expected bool for encryption; ignoring"),
        }
    }

    for (key, value) in [
        ("snapshotPolicy", &volume.snapshot_policy),
        ("snapshotReserve", &volume.snapshot_reserve),
        ("unixPermissions", &volume.unix_permissions),
        ("snapshotDir", &volume.snapshot_dir),
        ("exportPolicy", &volume.export_policy),
        ("spaceReserve", &volume.space_reserve),
        ("securityStyle", &volume.security_style),
        ("splitOnClone", &volume.split_on_clone),
        ("fileSystemType", &volume.file_system),
        ("encryption", &volume.encryption),
    ] {
        if !value.is_empty() {
            opts.insert(key.to_string(), value.clone());
        }
    }

    opts
}

/// Checks before a resize; returns the current size
pub async fn resize_validation(
    client: &dyn ManagementClient,
    volume: &str,
    requested_bytes: u64,
) -> Result<u64> {
    let exists = client
        .volume_exists(volume)
        .await
        .map_err(|e| Error::api("check for existing volume", volume, e))?;
    if !exists {
        return Err(Error::ResourceNotFound {
            kind: "volume".into(),
            name: volume.to_string(),
        });
    }

    let current = client
        .volume_get(volume)
        .await
        .map_err(|e| Error::api("get volume size", volume, e))?
        .size_bytes;

    if requested_bytes < current {
        return Err(Error::Validation(format!(
            "requested size {} is less than existing volume size {}",
            requested_bytes, current
        )));
    }
    Ok(current)
}

/// Appliance-safe volume name: hyphens and periods become underscores and
/// doubled underscores collapse
pub fn internal_volume_name(prefix: &str, name: &str) -> String {
    format!("{}{}", prefix, name)
        .replace(['-', '.'], "_")
        .replace("__", "_")
}
