//! NFS export policy reconciliation.

use super::{NodeInfo, ReconcileReport};
use crate::config::NasSettings;
use crate::domain::ports::ManagementClient;
use crate::error::{ApiErrorCode, Error, Result};
use ipnetwork::IpNetwork;
use std::collections::{BTreeMap, HashSet};
use std::net::IpAddr;
use std::str::FromStr;
use tracing::{debug, error, info};

/// Name of the export policy managed for a backend
pub fn export_policy_name(backend_uuid: &str) -> String {
    format!("trident-{}", backend_uuid)
}

/// Create the policy unless it already exists
pub async fn ensure_export_policy_exists(client: &dyn ManagementClient, policy: &str) -> Result<()> {
    match client.export_policy_create(policy).await {
        Ok(()) => {
            info!(export_policy = %policy, "Created export policy");
            Ok(())
        }
        Err(e) if e.is(ApiErrorCode::AlreadyExists) => {
            debug!(export_policy = %policy, "Export policy already exists");
            Ok(())
        }
        Err(e) => Err(Error::api("create export policy", policy, e)),
    }
}

/// Whether the policy exists; any failure other than `NotFound` propagates
pub async fn export_policy_exists(client: &dyn ManagementClient, policy: &str) -> Result<bool> {
    match client.export_policy_get(policy).await {
        Ok(()) => Ok(true),
        Err(e) if e.is(ApiErrorCode::NotFound) => {
            debug!(export_policy = %policy, "Export policy not found");
            Ok(false)
        }
        Err(e) => Err(Error::api("get export policy", policy, e)),
    }
}

pub async fn delete_export_policy(client: &dyn ManagementClient, policy: &str) -> Result<()> {
    client
        .export_policy_destroy(policy)
        .await
        .map_err(|e| Error::api("delete export policy", policy, e))
}

/// Converge the policy's client-match rules onto `desired`.
///
/// Missing rules are created before stale ones are deleted so that a host
/// present in both the old and new set never loses access. The first
/// failure aborts the pass; rules already changed stay changed.
pub async fn reconcile_export_rules(
    client: &dyn ManagementClient,
    policy: &str,
    desired: &[String],
) -> Result<ReconcileReport> {
    ensure_export_policy_exists(client, policy).await?;

    let current = client
        .export_rule_list(policy)
        .await
        .map_err(|e| Error::api("list export rules", policy, e))?;

    // client match -> rule index; duplicates beyond the first are stale
    let mut existing: BTreeMap<String, u32> = BTreeMap::new();
    let mut to_remove: Vec<u32> = Vec::new();
    for rule in current {
        if existing.contains_key(&rule.client_match) {
            to_remove.push(rule.rule_index);
        } else {
            existing.insert(rule.client_match, rule.rule_index);
        }
    }

    let mut report = ReconcileReport::default();
    let mut seen = HashSet::new();
    for client_match in desired {
        if !seen.insert(client_match.as_str()) {
            continue;
        }
        if existing.remove(client_match).is_some() {
            continue;
        }
        client
            .export_rule_create(policy, client_match, &["nfs"], &["any"], &["any"], &["any"])
            .await
            .map_err(|e| {
                error!(export_policy = %policy, client_match = %client_match, "Could not create export rule");
                Error::api("create export rule", format!("{}/{}", policy, client_match), e)
            })?;
        report.added += 1;
    }

    to_remove.extend(existing.into_values());
    for rule_index in to_remove {
        client
            .export_rule_destroy(policy, rule_index)
            .await
            .map_err(|e| {
                error!(export_policy = %policy, rule_index, "Could not delete export rule");
                Error::api("delete export rule", format!("{}/{}", policy, rule_index), e)
            })?;
        report.removed += 1;
    }

    if !report.is_noop() {
        info!(
            export_policy = %policy,
            added = report.added,
            removed = report.removed,
            "Reconciled export policy rules"
        );
    }
    Ok(report)
}

/// Bring the backend's export policy in line with `nodes`.
///
/// Does nothing unless automatic export policies are enabled.
pub async fn reconcile_nas_node_access(
    client: &dyn ManagementClient,
    nas: &NasSettings,
    policy: &str,
    nodes: &[NodeInfo],
) -> Result<ReconcileReport> {
    if !nas.auto_export_policy {
        return Ok(ReconcileReport::default());
    }
    let desired = desired_export_rules(nodes, &nas.auto_export_cidrs)?;
    reconcile_export_rules(client, policy, &desired).await
}

/// Reconcile only when the export policy is missing.
///
/// Rules edited out-of-band on an existing policy are not detected here; a
/// full [`reconcile_nas_node_access`] pass repairs them.
pub async fn ensure_node_access(
    client: &dyn ManagementClient,
    nas: &NasSettings,
    policy: &str,
    nodes: &[NodeInfo],
) -> Result<Option<ReconcileReport>> {
    if export_policy_exists(client, policy).await? {
        debug!(export_policy = %policy, "Export policy exists");
        return Ok(None);
    }
    debug!(export_policy = %policy, "Export policy missing, will create it");
    reconcile_nas_node_access(client, nas, policy, nodes)
        .await
        .map(Some)
}

/// One client-match entry per node: its addresses inside `cidrs`, comma
/// joined. Nodes with no matching address get no rule.
pub fn desired_export_rules(nodes: &[NodeInfo], cidrs: &[String]) -> Result<Vec<String>> {
    let networks = cidrs
        .iter()
        .map(|cidr| {
            IpNetwork::from_str(cidr)
                .map_err(|e| Error::Validation(format!("invalid CIDR {:?}: {}", cidr, e)))
        })
        .collect::<Result<Vec<_>>>()?;

    let mut rules = Vec::new();
    for node in nodes {
        let filtered = filter_ips(&node.ips, &networks);
        if !filtered.is_empty() {
            rules.push(filtered.join(","));
        }
    }
    Ok(rules)
}

fn filter_ips<'a>(ips: &'a [String], networks: &[IpNetwork]) -> Vec<&'a str> {
    ips.iter()
        .filter_map(|ip| match IpAddr::from_str(ip) {
            Ok(addr) => networks
                .iter()
                .any(|net| net.contains(addr))
                .then_some(ip.as_str()),
            Err(_) => {
                debug!(ip = %ip, "Skipping unparseable node address");
                None
            }
        })
        .collect()
}
