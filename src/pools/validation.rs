//! Pool validation, run once after discovery; the first violation aborts
//! backend initialization.

use super::capability::{attrs, internal, StoragePool};
use super::{PoolSet, MINIMUM_VOLUME_SIZE_BYTES};
use crate::config::{parse_bool, DriverKind, SUPPORTED_FILE_SYSTEMS};
use crate::error::{Error, Result};
use crate::units::parse_size;
use tracing::error;

const TIERING_POLICIES: [&str; 6] = ["snapshot-only", "auto", "none", "backup", "all", ""];

pub fn validate_pools(pools: &PoolSet, kind: &DriverKind) -> Result<()> {
    pools.iter().try_for_each(|pool| validate_pool(pool, kind))
}

pub fn validate_pool(pool: &StoragePool, kind: &DriverKind) -> Result<()> {
    let name = pool.name.as_str();
    let invalid = |msg: String| Err(Error::Validation(msg));

    match pool.internal(internal::SPACE_RESERVE) {
        "none" | "volume" => {}
        other => return invalid(format!("invalid spaceReserve {} in pool {}", other, name)),
    }

    if pool.internal(internal::SNAPSHOT_POLICY).is_empty() {
        return invalid(format!("snapshot policy cannot be empty in pool {}", name));
    }

    require_bool(pool, internal::ENCRYPTION, "encryption")?;
    require_bool(pool, internal::SNAPSHOT_DIR, "snapshotDir")?;

    match pool.internal(internal::SECURITY_STYLE) {
        "unix" | "mixed" => {}
        other => return invalid(format!("invalid securityStyle {} in pool {}", other, name)),
    }

    if pool.internal(internal::EXPORT_POLICY).is_empty() {
        return invalid(format!("export policy cannot be empty in pool {}", name));
    }
    if pool.internal(internal::UNIX_PERMISSIONS).is_empty() {
        return invalid(format!("UNIX permissions cannot be empty in pool {}", name));
    }

    let tiering = pool.internal(internal::TIERING_POLICY);
    if !TIERING_POLICIES.contains(&tiering) {
        return invalid(format!("invalid tieringPolicy {} in pool {}", tiering, name));
    }

    // Unknown media only makes the pool unmatchable, so it is not fatal
    let media = pool.internal(internal::MEDIA);
    if !media.is_empty() {
        for media_type in media.split(',') {
            if ![attrs::MEDIA_HDD, attrs::MEDIA_SSD, attrs::MEDIA_HYBRID].contains(&media_type) {
                error!(pool = %name, media_type = %media_type, "Invalid media type in pool");
            }
        }
    }

    let size = parse_size(pool.internal(internal::SIZE)).map_err(|e| {
        Error::Validation(format!(
            "invalid value for default volume size in pool {}: {}",
            name, e
        ))
    })?;
    if size < MINIMUM_VOLUME_SIZE_BYTES {
        return invalid(format!(
            "invalid value for size in pool {}. Requested volume size ({} bytes) is too small; \
             the minimum volume size is {} bytes",
            name, size, MINIMUM_VOLUME_SIZE_BYTES
        ));
    }

    if kind.supports_split_on_clone() {
        require_bool(pool, internal::SPLIT_ON_CLONE, "splitOnClone")?;
    }

    if kind.is_san() {
        require_bool(pool, internal::SPACE_ALLOCATION, "spaceAllocation")?;

        let fs = pool.internal(internal::FILE_SYSTEM_TYPE);
        if fs.is_empty() {
            return invalid(format!("fileSystemType cannot be empty in pool {}", name));
        }
        if !SUPPORTED_FILE_SYSTEMS.contains(&fs.to_ascii_lowercase().as_str()) {
            return invalid(format!(
                "invalid value for fileSystemType in pool {}: unsupported fileSystemType option: {}",
                name, fs
            ));
        }
    }

    Ok(())
}

fn require_bool(pool: &StoragePool, key: &str, label: &str) -> Result<()> {
    let value = pool.internal(key);
    if value.is_empty() {
        return Err(Error::Validation(format!(
            "{} cannot be empty in pool {}",
            label, pool.name
        )));
    }
    parse_bool(value).map(|_| ()).map_err(|_| {
        Error::Validation(format!(
            "invalid value for {} in pool {}: {:?}",
            label, pool.name, value
        ))
    })
}
