//! Volume publication
//!
//! Grants one host access to one volume: export policy assignment for NFS
//! shares, igroup membership and LUN mapping for iSCSI LUNs. Runs on the
//! control plane only and never touches the host itself.

use super::export::ensure_node_access;
use super::igroup::add_initiator;
use super::NodeInfo;
use crate::config::{NasSettings, SanSettings, DEFAULT_FILE_SYSTEM_TYPE};
use crate::domain::ports::{ChapCredentials, ManagementClient};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{debug, warn};

/// LUN attribute holding the filesystem the LUN was formatted with
pub const LUN_ATTRIBUTE_FSTYPE: &str = "com.netapp.ndvp.fstype";

// =============================================================================
// Publish Request / Result
// =============================================================================

/// Who is asking for access
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishRequest {
    /// Initiator names of the host; the first one is used
    pub host_iqn: Vec<String>,
    /// Volume was imported without being managed; access objects are left alone
    pub unmanaged: bool,
    /// All nodes known to the orchestrator, for export policy rebuilds
    pub nodes: Vec<NodeInfo>,
}

/// What the host needs to attach an iSCSI LUN
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LunPublishInfo {
    pub lun_id: u32,
    pub target_portal: String,
    pub portals: Vec<String>,
    pub target_iqn: String,
    pub igroup: String,
    pub filesystem_type: String,
    pub use_chap: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chap: Option<ChapCredentials>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iscsi_interface: Option<String>,
    pub shared_target: bool,
}

/// SVM iSCSI target identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IscsiTargetInfo {
    pub node_name: String,
    /// Enabled interfaces as `ip:port`
    pub interfaces: Vec<String>,
}

// =============================================================================
// NAS
// =============================================================================

/// Point the volume at the backend's export policy, rebuilding the policy
/// first if it has gone missing.
pub async fn publish_nas_share(
    client: &dyn ManagementClient,
    nas: &NasSettings,
    policy: &str,
    volume: &str,
    request: &PublishRequest,
) -> Result<()> {
    if !nas.auto_export_policy || request.unmanaged {
        return Ok(());
    }

    ensure_node_access(client, nas, policy, &request.nodes).await?;

    client
        .volume_modify_export_policy(volume, policy)
        .await
        .map_err(|e| Error::api("update export policy", volume, e))
}

// =============================================================================
// SAN
// =============================================================================

/// SVM node name and enabled iSCSI interfaces
pub async fn iscsi_target_info(client: &dyn ManagementClient, svm: &str) -> Result<IscsiTargetInfo> {
    let node_name = client
        .iscsi_node_name()
        .await
        .map_err(|e| Error::api("get iSCSI node name", svm, e))?;

    let interfaces: Vec<String> = client
        .iscsi_interfaces()
        .await
        .map_err(|e| Error::api("list iSCSI interfaces", svm, e))?
        .into_iter()
        .filter(|iface| iface.enabled)
        .map(|iface| format!("{}:{}", iface.ip_address, iface.port))
        .collect();

    if interfaces.is_empty() {
        return Err(Error::Configuration(format!(
            "SVM {} has no active iSCSI interfaces",
            svm
        )));
    }

    Ok(IscsiTargetInfo {
        node_name,
        interfaces,
    })
}

/// Data LIFs whose home node reports paths to the LUN
pub async fn data_lifs_for_reporting_nodes(
    client: &dyn ManagementClient,
    ips: &[String],
    lun_path: &str,
    igroup: &str,
) -> Result<Vec<String>> {
    let maps = client
        .lun_map_get(igroup, lun_path)
        .await
        .map_err(|e| Error::api("get iSCSI reporting nodes", lun_path, e))?;

    let reporting: HashSet<String> = maps
        .into_iter()
        .flat_map(|m| m.reporting_nodes)
        .collect();
    debug!(?reporting, "Reporting nodes found");

    let mut lifs = Vec::new();
    for ip in ips {
        let node = client
            .data_lif_node(ip)
            .await
            .map_err(|e| Error::api("get data LIF node", ip.as_str(), e))?;
        if reporting.contains(&node) {
            lifs.push(ip.clone());
        }
    }

    debug!(?lifs, "Data LIFs with reporting nodes");
    Ok(lifs)
}

/// Give the requesting host access to a LUN and describe how to attach it
pub async fn publish_lun(
    client: &dyn ManagementClient,
    san: &SanSettings,
    data_lif_ips: &[String],
    request: &PublishRequest,
    lun_path: &str,
    iscsi_node_name: &str,
) -> Result<LunPublishInfo> {
    let igroup = san.igroup_name.as_str();
    let iqn = request
        .host_iqn
        .first()
        .ok_or_else(|| Error::Validation("host initiator IQN not specified".into()))?;

    let filesystem_type = match client.lun_get_attribute(lun_path, LUN_ATTRIBUTE_FSTYPE).await {
        Ok(fstype) => {
            debug!(lun = %lun_path, fstype = %fstype, "Found LUN attribute fstype");
            fstype
        }
        Err(_) => {
            warn!(
                lun = %lun_path,
                fstype = DEFAULT_FILE_SYSTEM_TYPE,
                "LUN attribute fstype not found, using default"
            );
            DEFAULT_FILE_SYSTEM_TYPE.to_string()
        }
    };

    if !request.unmanaged {
        add_initiator(client, igroup, iqn).await?;
    }

    let lun_id = client
        .lun_map_if_not_mapped(igroup, lun_path, request.unmanaged)
        .await
        .map_err(|e| Error::api("map LUN", lun_path, e))?;

    let mut portals = data_lifs_for_reporting_nodes(client, data_lif_ips, lun_path, igroup).await?;
    if portals.is_empty() {
        warn!("Unable to find reporting nodes for discovered data LIFs");
        portals = data_lif_ips.to_vec();
    }
    if portals.is_empty() {
        return Err(Error::Configuration(
            "no iSCSI data LIFs available for publication".into(),
        ));
    }
    let target_portal = portals.remove(0);

    Ok(LunPublishInfo {
        lun_id,
        target_portal,
        portals,
        target_iqn: iscsi_node_name.to_string(),
        igroup: igroup.to_string(),
        filesystem_type,
        use_chap: san.use_chap,
        chap: san.use_chap.then(|| san.chap.clone()),
        iscsi_interface: san.use_chap.then(|| "default".to_string()),
        shared_target: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::appliance::SimulatedAppliance;
    use assert_matches::assert_matches;

    fn san(use_chap: bool) -> SanSettings {
        SanSettings {
            igroup_name: "ig".into(),
            use_chap,
            chap: ChapCredentials {
                chap_username: "u".into(),
                chap_initiator_secret: "s".into(),
                chap_target_username: "tu".into(),
                chap_target_initiator_secret: "ts".into(),
            },
            data_lif: None,
        }
    }

    fn host(iqn: &str) -> PublishRequest {
        PublishRequest {
            host_iqn: vec![iqn.to_string()],
            ..Default::default()
        }
    }

    fn san_appliance() -> SimulatedAppliance {
        let appliance = SimulatedAppliance::new();
        appliance.add_igroup("ig", &[]);
        appliance.add_lun("/vol/v1/lun0", Some("xfs"));
        appliance.add_data_lif("10.0.0.1", "node-1");
        appliance.add_data_lif("10.0.0.2", "node-2");
        appliance.set_reporting_nodes(&["node-2"]);
        appliance
    }

    #[tokio::test]
    async fn test_publish_lun() {
        let appliance = san_appliance();
        let ips = vec!["10.0.0.1".to_string(), "10.0.0.2".to_string()];

        let info = publish_lun(&appliance, &san(true), &ips, &host("iqn.host"), "/vol/v1/lun0", "iqn.target")
            .await
            .unwrap();

        assert_eq!(info.target_portal, "10.0.0.2");
        assert!(info.portals.is_empty());
        assert_eq!(info.filesystem_type, "xfs");
        assert_eq!(info.igroup, "ig");
        assert_eq!(info.chap.unwrap().chap_username, "u");
        assert_eq!(info.iscsi_interface.as_deref(), Some("default"));
        assert!(appliance.igroup_members("ig").unwrap().contains("iqn.host"));
        assert_eq!(appliance.lun_id("/vol/v1/lun0", "ig"), Some(info.lun_id));
    }

    #[tokio::test]
    async fn test_publish_lun_defaults_and_fallbacks() {
        let appliance = SimulatedAppliance::new();
        appliance.add_igroup("ig", &["iqn.host"]);
        appliance.add_lun("/vol/v1/lun0", None);
        appliance.add_data_lif("10.0.0.1", "node-1");
        appliance.add_data_lif("10.0.0.2", "node-2");
        let ips = vec!["10.0.0.1".to_string(), "10.0.0.2".to_string()];

        let info = publish_lun(&appliance, &san(false), &ips, &host("iqn.host"), "/vol/v1/lun0", "iqn.target")
            .await
            .unwrap();

        assert_eq!(info.filesystem_type, "ext4");
        assert_eq!(info.target_portal, "10.0.0.1");
        assert_eq!(info.portals, vec!["10.0.0.2"]);
        assert!(info.chap.is_none());
    }

    #[tokio::test]
    async fn test_publish_lun_requires_iqn() {
        let appliance = san_appliance();
        let result = publish_lun(
            &appliance,
            &san(false),
            &[],
            &PublishRequest::default(),
            "/vol/v1/lun0",
            "iqn.target",
        )
        .await;
        assert_matches!(result, Err(Error::Validation(_)));
        assert!(appliance.calls().is_empty());
    }

    #[tokio::test]
    async fn test_unmanaged_lun_leaves_igroup_alone() {
        let appliance = san_appliance();
        let request = PublishRequest {
            unmanaged: true,
            ..host("iqn.host")
        };
        publish_lun(&appliance, &san(false), &["10.0.0.2".to_string()], &request, "/vol/v1/lun0", "iqn.target")
            .await
            .unwrap();
        assert!(appliance.igroup_members("ig").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_iscsi_target_info() {
        let appliance = SimulatedAppliance::new();
        assert_matches!(
            iscsi_target_info(&appliance, "svm0").await,
            Err(Error::Configuration(_))
        );

        appliance.add_iscsi_interface("10.0.0.1", 3260, true);
        appliance.add_iscsi_interface("10.0.0.2", 3260, false);
        let info = iscsi_target_info(&appliance, "svm0").await.unwrap();
        assert_eq!(info.interfaces, vec!["10.0.0.1:3260"]);
        assert!(info.node_name.starts_with("iqn."));
    }

    #[tokio::test]
    async fn test_publish_nas_share_sets_policy() {
        let appliance = SimulatedAppliance::new();
        appliance.add_volume("trident_v1", "aggr1", 1 << 30, "none");
        let nas = NasSettings {
            auto_export_policy: true,
            auto_export_cidrs: vec!["10.0.0.0/8".into()],
            nfs_mount_options: String::new(),
        };
        let request = PublishRequest {
            nodes: vec![NodeInfo::new("n1").with_ips(["10.0.0.7"])],
            ..Default::default()
        };

        publish_nas_share(&appliance, &nas, "trident-uuid", "trident_v1", &request)
            .await
            .unwrap();

        assert_eq!(appliance.volume("trident_v1").unwrap().export_policy, "trident-uuid");
        assert!(appliance.export_rules("trident-uuid").unwrap().contains("10.0.0.7"));
    }
}
