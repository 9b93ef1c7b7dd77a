//! Initiator group reconciliation.

use super::ReconcileReport;
use crate::domain::ports::ManagementClient;
use crate::error::{ApiErrorCode, Error, Result};
use std::collections::{BTreeSet, HashSet};
use tracing::{debug, info};

/// Create the igroup (iSCSI, linux) unless it already exists
pub async fn ensure_igroup_exists(client: &dyn ManagementClient, igroup: &str) -> Result<()> {
    match client.igroup_create(igroup, "iscsi", "linux").await {
        Ok(()) => {
            info!(igroup = %igroup, "Created igroup");
            Ok(())
        }
        Err(e) if e.is(ApiErrorCode::AlreadyExists) => {
            debug!(igroup = %igroup, "Igroup already exists");
            Ok(())
        }
        Err(e) => Err(Error::api("create igroup", igroup, e)),
    }
}

/// Add one initiator; an initiator already in the group counts as success
pub async fn add_initiator(client: &dyn ManagementClient, igroup: &str, iqn: &str) -> Result<bool> {
    match client.igroup_add(igroup, iqn).await {
        Ok(()) => Ok(true),
        Err(e) if e.is(ApiErrorCode::AlreadyPresent) => {
            debug!(igroup = %igroup, iqn = %iqn, "Host IQN already in igroup");
            Ok(false)
        }
        Err(e) => Err(Error::api("add initiator", format!("{}/{}", igroup, iqn), e)),
    }
}

/// Force-remove one initiator; an initiator not in the group counts as success
pub async fn remove_initiator(
    client: &dyn ManagementClient,
    igroup: &str,
    iqn: &str,
) -> Result<bool> {
    match client.igroup_remove(igroup, iqn, true).await {
        Ok(()) => Ok(true),
        Err(e) if e.is(ApiErrorCode::NotPresent) => {
            debug!(igroup = %igroup, iqn = %iqn, "Host IQN not in igroup");
            Ok(false)
        }
        Err(e) => Err(Error::api("remove initiator", format!("{}/{}", igroup, iqn), e)),
    }
}

/// Converge igroup membership onto `desired_iqns`, adding before removing
pub async fn reconcile_initiator_group(
    client: &dyn ManagementClient,
    igroup: &str,
    desired_iqns: &[String],
) -> Result<ReconcileReport> {
    ensure_igroup_exists(client, igroup).await?;

    let mut mapped: BTreeSet<String> = client
        .igroup_get(igroup)
        .await
        .map_err(|e| Error::api("read igroup", igroup, e))?
        .into_iter()
        .collect();

    let mut report = ReconcileReport::default();
    let mut seen = HashSet::new();
    for iqn in desired_iqns {
        if !seen.insert(iqn.as_str()) {
            continue;
        }
        if mapped.remove(iqn) {
            continue;
        }
        if add_initiator(client, igroup, iqn).await? {
            report.added += 1;
        }
    }

    // Anything still in `mapped` belongs to no desired node
    for iqn in &mapped {
        if remove_initiator(client, igroup, iqn).await? {
            report.removed += 1;
        }
    }

    if !report.is_noop() {
        info!(
            igroup = %igroup,
            added = report.added,
            removed = report.removed,
            "Reconciled igroup membership"
        );
    }
    Ok(report)
}
