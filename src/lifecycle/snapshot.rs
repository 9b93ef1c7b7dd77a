//! Snapshot operations on a single volume

use super::SNAPSHOT_TIMESTAMP_FORMAT;
use crate::domain::ports::{ManagementClient, SnapshotInfo};
use crate::error::{ApiErrorCode, Error, Result};
use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

/// A snapshot as reported to the orchestrator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub name: String,
    pub volume: String,
    /// UTC, `YYYY-MM-DDTHH:MM:SSZ`
    pub created: String,
    /// Size of the parent volume when the snapshot was read
    pub size_bytes: u64,
}

impl Snapshot {
    fn from_info(info: &SnapshotInfo, volume: &str, size_bytes: u64) -> Result<Self> {
        let created = Utc
            .timestamp_opt(info.access_time, 0)
            .single()
            .ok_or_else(|| {
                Error::Internal(format!(
                    "snapshot {} has invalid access time {}",
                    info.name, info.access_time
                ))
            })?
            .format(SNAPSHOT_TIMESTAMP_FORMAT)
            .to_string();

        Ok(Self {
            name: info.name.clone(),
            volume: volume.to_string(),
            created,
            size_bytes,
        })
    }
}

async fn volume_size(client: &dyn ManagementClient, volume: &str) -> Result<u64> {
    client
        .volume_get(volume)
        .await
        .map(|attrs| attrs.size_bytes)
        .map_err(|e| Error::api("read volume size", volume, e))
}

async fn snapshot_infos(client: &dyn ManagementClient, volume: &str) -> Result<Vec<SnapshotInfo>> {
    client
        .snapshot_list(volume)
        .await
        .map_err(|e| Error::api("enumerate snapshots", volume, e))
}

/// Look up one snapshot.
///
/// `Ok(None)` means the snapshot does not exist; an unreachable appliance is
/// an error, never `None`.
pub async fn get_snapshot(
    client: &dyn ManagementClient,
    volume: &str,
    snapshot: &str,
) -> Result<Option<Snapshot>> {
    let size = volume_size(client, volume).await?;

    match snapshot_infos(client, volume)
        .await?
        .iter()
        .find(|s| s.name == snapshot)
    {
        Some(info) => {
            debug!(
                snapshot = %snapshot,
                volume = %volume,
                created = info.access_time,
                "Found snapshot"
            );
            Snapshot::from_info(info, volume, size).map(Some)
        }
        None => {
            warn!(snapshot = %snapshot, volume = %volume, "Snapshot not found");
            Ok(None)
        }
    }
}

pub async fn list_snapshots(client: &dyn ManagementClient, volume: &str) -> Result<Vec<Snapshot>> {
    let size = volume_size(client, volume).await?;
    let infos = snapshot_infos(client, volume).await?;
    debug!(volume = %volume, count = infos.len(), "Listed snapshots");

    infos
        .iter()
        .map(|info| Snapshot::from_info(info, volume, size))
        .collect()
}

/// Create a snapshot and read it back for its creation time
pub async fn create_snapshot(
    client: &dyn ManagementClient,
    volume: &str,
    snapshot: &str,
) -> Result<Snapshot> {
    super::get_volume(client, volume).await?;
    let size = volume_size(client, volume).await?;

    client
        .snapshot_create(snapshot, volume)
        .await
        .map_err(|e| Error::api("create snapshot", format!("{}/{}", volume, snapshot), e))?;

    let infos = snapshot_infos(client, volume).await?;
    let info = infos
        .iter()
        .find(|s| s.name == snapshot)
        .ok_or_else(|| Error::SnapshotNotFound {
            snapshot: snapshot.to_string(),
            volume: volume.to_string(),
        })?;

    info!(snapshot = %snapshot, volume = %volume, "Created snapshot");
    Snapshot::from_info(info, volume, size)
}

/// Restore a volume in place from one of its snapshots
pub async fn restore_snapshot(
    client: &dyn ManagementClient,
    volume: &str,
    snapshot: &str,
) -> Result<()> {
    client
        .snapshot_restore_volume(snapshot, volume)
        .await
        .map_err(|e| Error::api("restore snapshot", format!("{}/{}", volume, snapshot), e))?;

    debug!(snapshot = %snapshot, volume = %volume, "Restored snapshot");
    Ok(())
}

/// Delete a snapshot.
///
/// A snapshot still backing clones is busy: one clone split is started so a
/// later attempt can succeed, and the busy error is still returned.
pub async fn delete_snapshot(
    client: &dyn ManagementClient,
    volume: &str,
    snapshot: &str,
) -> Result<()> {
    match client.snapshot_delete(snapshot, volume).await {
        Ok(()) => {
            debug!(snapshot = %snapshot, volume = %volume, "Deleted snapshot");
            Ok(())
        }
        Err(e) => {
            if e.is(ApiErrorCode::Busy) {
                // best effort; the busy error is what the caller needs to see
                if let Err(split_error) =
                    cascade_split_from_busy_snapshot(client, volume, snapshot).await
                {
                    debug!(
                        snapshot = %snapshot,
                        volume = %volume,
                        error = %split_error,
                        "Clone split for busy snapshot not started"
                    );
                }
            }
            Err(Error::api("delete snapshot", format!("{}/{}", volume, snapshot), e))
        }
    }
}

/// Start splitting the first clone (by name) backed by the snapshot.
///
/// Only one split is started per call so that at most one split runs at a
/// time. Returns the clone being split, if any.
pub async fn cascade_split_from_busy_snapshot(
    client: &dyn ManagementClient,
    volume: &str,
    snapshot: &str,
) -> Result<Option<String>> {
    let mut children = client
        .volume_list_backed_by_snapshot(volume, snapshot)
        .await
        .map_err(|e| {
            error!(
                snapshot = %snapshot,
                parent_volume = %volume,
                error = %e,
                "Could not list volumes backed by snapshot"
            );
            Error::api("list volumes backed by snapshot", format!("{}/{}", volume, snapshot), e)
        })?;

    children.sort();
    let Some(child) = children.into_iter().next() else {
        return Ok(None);
    };

    if let Err(e) = client.volume_clone_split_start(&child).await {
        error!(
            snapshot = %snapshot,
            parent_volume = %volume,
            clone_volume = %child,
            error = %e,
            "Could not begin splitting clone from snapshot"
        );
        return Err(Error::api("split clone", child, e));
    }

    info!(
        snapshot = %snapshot,
        parent_volume = %volume,
        clone_volume = %child,
        "Began splitting clone from snapshot"
    );
    Ok(Some(child))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::appliance::SimulatedAppliance;
    use crate::error::ApiError;
    use assert_matches::assert_matches;

    fn appliance_with_snapshot() -> SimulatedAppliance {
        let appliance = SimulatedAppliance::new();
        appliance.add_volume("trident_src", "aggr1", 2 << 30, "none");
        // 2021-03-04T05:06:07Z
        appliance.add_snapshot("trident_src", "snap1", 1614834367);
        appliance
    }

    #[tokio::test]
    async fn test_get_snapshot() {
        let appliance = appliance_with_snapshot();

        let snap = get_snapshot(&appliance, "trident_src", "snap1").await.unwrap().unwrap();
        assert_eq!(snap.created, "2021-03-04T05:06:07Z");
        assert_eq!(snap.size_bytes, 2 << 30);

        assert!(get_snapshot(&appliance, "trident_src", "snap2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_get_snapshot_api_error_is_not_absence() {
        let appliance = appliance_with_snapshot();
        appliance.inject_fault("snapshot_list", ApiError::other("connection reset"));
        assert_matches!(
            get_snapshot(&appliance, "trident_src", "snap1").await,
            Err(Error::Api { .. })
        );
    }

    #[tokio::test]
    async fn test_create_and_list() {
        let appliance = appliance_with_snapshot();

        let snap = create_snapshot(&appliance, "trident_src", "snap2").await.unwrap();
        assert_eq!(snap.name, "snap2");
        assert_eq!(snap.volume, "trident_src");

        let names: Vec<_> = list_snapshots(&appliance, "trident_src")
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(names, vec!["snap1", "snap2"]);

        assert_matches!(
            create_snapshot(&appliance, "trident_missing", "snap1").await,
            Err(Error::ResourceNotFound { .. })
        );
    }

    #[tokio::test]
    async fn test_restore_snapshot() {
        let appliance = appliance_with_snapshot();
        restore_snapshot(&appliance, "trident_src", "snap1").await.unwrap();
        assert!(restore_snapshot(&appliance, "trident_src", "snapX").await.is_err());
    }

    #[tokio::test]
    async fn test_busy_snapshot_splits_first_clone() {
        let appliance = appliance_with_snapshot();
        for clone in ["clone-b", "clone-a", "clone-c"] {
            appliance.volume_clone_create(clone, "trident_src", "snap1").await.unwrap();
        }
        appliance.clear_calls();

        let err = delete_snapshot(&appliance, "trident_src", "snap1").await.unwrap_err();
        assert!(err.is_busy());

        assert!(appliance.volume("clone-a").unwrap().split_started);
        assert!(!appliance.volume("clone-b").unwrap().split_started);
        assert!(!appliance.volume("clone-c").unwrap().split_started);
        assert_eq!(
            appliance.call_names(),
            vec!["snapshot_delete", "volume_list_backed_by_snapshot", "volume_clone_split_start"]
        );
    }

    #[tokio::test]
    async fn test_failed_split_still_reports_busy() {
        let appliance = appliance_with_snapshot();
        appliance.volume_clone_create("clone-a", "trident_src", "snap1").await.unwrap();
        appliance.inject_fault("volume_clone_split_start", ApiError::other("connection reset"));

        let err = delete_snapshot(&appliance, "trident_src", "snap1").await.unwrap_err();
        assert!(err.is_busy());
        assert!(!appliance.volume("clone-a").unwrap().split_started);
    }

    #[tokio::test]
    async fn test_cascade_without_children_is_noop() {
        let appliance = appliance_with_snapshot();
        assert_eq!(
            cascade_split_from_busy_snapshot(&appliance, "trident_src", "snap1").await.unwrap(),
            None
        );
        assert_eq!(appliance.mutating_calls(), 0);
    }

    #[tokio::test]
    async fn test_delete_snapshot() {
        let appliance = appliance_with_snapshot();
        delete_snapshot(&appliance, "trident_src", "snap1").await.unwrap();
        assert!(get_snapshot(&appliance, "trident_src", "snap1").await.unwrap().is_none());
    }
}
