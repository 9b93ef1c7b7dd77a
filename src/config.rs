//! Backend Configuration
//!
//! The driver configuration as read from a backend definition file, default
//! population, and the tagged [`DriverKind`] variant that carries only the
//! settings each driver type needs.

use crate::domain::ports::ChapCredentials;
use crate::error::{Error, Result};
use crate::retry::BackoffPolicy;
use crate::units::parse_size;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

// =============================================================================
// Driver Names & Defaults
// =============================================================================

pub const ONTAP_NAS_DRIVER: &str = "ontap-nas";
pub const ONTAP_NAS_FLEXGROUP_DRIVER: &str = "ontap-nas-flexgroup";
pub const ONTAP_SAN_DRIVER: &str = "ontap-san";
pub const ONTAP_SAN_ECONOMY_DRIVER: &str = "ontap-san-economy";

pub const DEFAULT_VOLUME_SIZE: &str = "1G";
pub const DEFAULT_STORAGE_PREFIX: &str = "trident";
pub const DEFAULT_SPACE_ALLOCATION: &str = "true";
pub const DEFAULT_SPACE_RESERVE: &str = "none";
pub const DEFAULT_SNAPSHOT_POLICY: &str = "none";
pub const DEFAULT_SNAPSHOT_RESERVE: &str = "";
pub const DEFAULT_UNIX_PERMISSIONS: &str = "---rwxrwxrwx";
pub const DEFAULT_SNAPSHOT_DIR: &str = "false";
pub const DEFAULT_EXPORT_POLICY: &str = "default";
pub const AUTOMATIC_EXPORT_POLICY: &str = "<automatic>";
pub const DEFAULT_SECURITY_STYLE: &str = "unix";
pub const DEFAULT_SPLIT_ON_CLONE: &str = "false";
pub const DEFAULT_FILE_SYSTEM_TYPE: &str = "ext4";
pub const DEFAULT_ENCRYPTION: &str = "false";
pub const DEFAULT_TIERING_POLICY: &str = "";
pub const DEFAULT_AUTO_EXPORT_CIDRS: [&str; 2] = ["0.0.0.0/0", "::/0"];

/// Filesystems a SAN pool may format LUNs with
pub const SUPPORTED_FILE_SYSTEMS: [&str; 4] = ["ext3", "ext4", "xfs", "raw"];

// =============================================================================
// Virtual Pool Configuration
// =============================================================================

/// Per-virtual-pool overrides; empty strings fall back to the backend value
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VirtualPoolConfig {
    pub labels: BTreeMap<String, String>,
    pub region: String,
    pub zone: String,
    pub size: String,
    pub space_allocation: String,
    pub space_reserve: String,
    pub snapshot_policy: String,
    pub snapshot_reserve: String,
    pub split_on_clone: String,
    pub unix_permissions: String,
    pub snapshot_dir: String,
    pub export_policy: String,
    pub security_style: String,
    pub file_system_type: String,
    pub encryption: String,
    pub tiering_policy: String,
}

// =============================================================================
// Timing Configuration
// =============================================================================

/// Bounded waits used by the clone orchestrator
#[derive(Debug, Clone, PartialEq)]
pub struct TimingConfig {
    /// Existence probe after a job-tracking failure
    pub probe: BackoffPolicy,
    /// Upper bound on waiting for an async clone job
    pub async_clone_timeout: Duration,
    /// Interval between async job status polls
    pub job_poll_interval: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            probe: BackoffPolicy::volume_probe(),
            async_clone_timeout: Duration::from_secs(120),
            job_poll_interval: Duration::from_secs(1),
        }
    }
}

// =============================================================================
// Driver Configuration
// =============================================================================

/// Backend configuration as declared by the operator
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DriverConfig {
    pub storage_driver_name: String,
    pub backend_name: String,
    pub backend_uuid: String,
    pub svm: String,
    pub management_lif: String,
    pub data_lif: String,
    pub username: String,
    pub password: String,
    pub aggregate: String,
    pub storage_prefix: Option<String>,
    pub region: String,
    pub zone: String,
    pub labels: BTreeMap<String, String>,

    pub size: String,
    pub space_allocation: String,
    pub space_reserve: String,
    pub snapshot_policy: String,
    pub snapshot_reserve: String,
    pub unix_permissions: String,
    pub snapshot_dir: String,
    pub export_policy: String,
    pub security_style: String,
    pub nfs_mount_options: String,
    pub split_on_clone: String,
    pub file_system_type: String,
    pub encryption: String,
    pub limit_aggregate_usage: String,
    pub limit_volume_size: String,
    pub tiering_policy: String,

    pub auto_export_policy: bool,
    #[serde(rename = "autoExportCIDRs")]
    pub auto_export_cidrs: Vec<String>,

    pub igroup_name: String,
    #[serde(rename = "useCHAP")]
    pub use_chap: bool,
    #[serde(rename = "chapUsername")]
    pub chap_username: String,
    #[serde(rename = "chapInitiatorSecret")]
    pub chap_initiator_secret: String,
    #[serde(rename = "chapTargetUsername")]
    pub chap_target_username: String,
    #[serde(rename = "chapTargetInitiatorSecret")]
    pub chap_target_initiator_secret: String,

    /// Virtual pool definitions
    pub storage: Vec<VirtualPoolConfig>,

    #[serde(skip)]
    pub timing: TimingConfig,
}

impl DriverConfig {
    /// Load a backend definition from a YAML or JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let is_json = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        if is_json {
            Ok(serde_json::from_str(&raw)?)
        } else {
            Ok(serde_yaml::from_str(&raw)?)
        }
    }

    /// Fill in default values for settings not supplied in the backend file
    pub fn populate_defaults(&mut self) -> Result<()> {
        if self.size.is_empty() {
            self.size = DEFAULT_VOLUME_SIZE.to_string();
        } else {
            parse_size(&self.size).map_err(|e| {
                Error::Configuration(format!("invalid config value for default volume size: {}", e))
            })?;
        }

        if self.storage_prefix.is_none() {
            self.storage_prefix = Some(DEFAULT_STORAGE_PREFIX.to_string());
        }

        fill(&mut self.space_allocation, DEFAULT_SPACE_ALLOCATION);
        fill(&mut self.space_reserve, DEFAULT_SPACE_RESERVE);
        fill(&mut self.snapshot_policy, DEFAULT_SNAPSHOT_POLICY);
        fill(&mut self.snapshot_reserve, DEFAULT_SNAPSHOT_RESERVE);
        fill(&mut self.unix_permissions, DEFAULT_UNIX_PERMISSIONS);
        fill(&mut self.snapshot_dir, DEFAULT_SNAPSHOT_DIR);

        if self.auto_export_policy {
            self.export_policy = AUTOMATIC_EXPORT_POLICY.to_string();
        } else {
            fill(&mut self.export_policy, DEFAULT_EXPORT_POLICY);
        }

        fill(&mut self.security_style, DEFAULT_SECURITY_STYLE);

        if self.split_on_clone.is_empty() {
            self.split_on_clone = DEFAULT_SPLIT_ON_CLONE.to_string();
        } else {
            parse_bool(&self.split_on_clone).map_err(|_| {
                Error::Configuration(format!(
                    "invalid boolean value for splitOnClone: {}",
                    self.split_on_clone
                ))
            })?;
        }

        fill(&mut self.file_system_type, DEFAULT_FILE_SYSTEM_TYPE);
        fill(&mut self.encryption, DEFAULT_ENCRYPTION);
        fill(&mut self.tiering_policy, DEFAULT_TIERING_POLICY);

        if self.auto_export_cidrs.is_empty() {
            self.auto_export_cidrs = DEFAULT_AUTO_EXPORT_CIDRS
                .iter()
                .map(|s| s.to_string())
                .collect();
        }

        if self.igroup_name.is_empty() {
            self.igroup_name = if self.backend_uuid.is_empty() {
                DEFAULT_STORAGE_PREFIX.to_string()
            } else {
                format!("{}-{}", DEFAULT_STORAGE_PREFIX, self.backend_uuid)
            };
        }

        debug!(
            storage_prefix = ?self.storage_prefix,
            space_allocation = %self.space_allocation,
            space_reserve = %self.space_reserve,
            snapshot_policy = %self.snapshot_policy,
            snapshot_reserve = %self.snapshot_reserve,
            unix_permissions = %self.unix_permissions,
            snapshot_dir = %self.snapshot_dir,
            export_policy = %self.export_policy,
            security_style = %self.security_style,
            split_on_clone = %self.split_on_clone,
            file_system_type = %self.file_system_type,
            encryption = %self.encryption,
            limit_aggregate_usage = %self.limit_aggregate_usage,
            size = %self.size,
            tiering_policy = %self.tiering_policy,
            auto_export_policy = self.auto_export_policy,
            auto_export_cidrs = ?self.auto_export_cidrs,
            "Configuration defaults"
        );

        Ok(())
    }

    /// Storage prefix after defaults have been applied
    pub fn storage_prefix(&self) -> &str {
        self.storage_prefix.as_deref().unwrap_or(DEFAULT_STORAGE_PREFIX)
    }

    /// Build the driver variant selected by `storageDriverName`
    pub fn driver_kind(&self) -> Result<DriverKind> {
        let nas = || NasSettings {
            auto_export_policy: self.auto_export_policy,
            auto_export_cidrs: self.auto_export_cidrs.clone(),
            nfs_mount_options: self.nfs_mount_options.clone(),
        };
        let san = || SanSettings {
            igroup_name: self.igroup_name.clone(),
            use_chap: self.use_chap,
            chap: ChapCredentials {
                chap_username: self.chap_username.clone(),
                chap_initiator_secret: self.chap_initiator_secret.clone(),
                chap_target_username: self.chap_target_username.clone(),
                chap_target_initiator_secret: self.chap_target_initiator_secret.clone(),
            },
            data_lif: (!self.data_lif.is_empty()).then(|| self.data_lif.clone()),
        };

        match self.storage_driver_name.as_str() {
            ONTAP_NAS_DRIVER => Ok(DriverKind::Nas(nas())),
            ONTAP_NAS_FLEXGROUP_DRIVER => Ok(DriverKind::NasFlexGroup(nas())),
            ONTAP_SAN_DRIVER => Ok(DriverKind::San(san())),
            ONTAP_SAN_ECONOMY_DRIVER => Ok(DriverKind::SanEconomy(san())),
            other => Err(Error::Configuration(format!(
                "unknown storage driver: {:?}",
                other
            ))),
        }
    }

    /// Copy of the configuration safe to display
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        copy.username.clear();
        copy.password.clear();
        copy.chap_initiator_secret.clear();
        copy.chap_target_initiator_secret.clear();
        copy
    }
}

fn fill(field: &mut String, default: &str) {
    if field.is_empty() {
        *field = default.to_string();
    }
}

/// Parse a boolean the way backend files spell them
pub fn parse_bool(value: &str) -> Result<bool> {
    match value {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Ok(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Ok(false),
        _ => Err(Error::Validation(format!("invalid boolean value {:?}", value))),
    }
}

/// Ensure the storage prefix is usable in appliance object names
pub fn validate_storage_prefix(prefix: &str) -> Result<()> {
    let mut chars = prefix.chars();
    let valid = match chars.next() {
        Some(first) => {
            (first.is_ascii_alphabetic() || first == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    };

    if valid {
        Ok(())
    } else {
        Err(Error::Configuration(
            "storage prefix may only contain letters/digits/underscore and must begin with letter/underscore"
                .into(),
        ))
    }
}

/// Remove brackets and replace colons with periods
pub fn clean_backend_name(name: &str) -> String {
    name.replace(['[', ']'], "").replace(':', ".")
}

// =============================================================================
// Driver Kind
// =============================================================================

/// Settings used only by NAS drivers
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NasSettings {
    pub auto_export_policy: bool,
    pub auto_export_cidrs: Vec<String>,
    pub nfs_mount_options: String,
}

/// Settings used only by SAN drivers
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SanSettings {
    pub igroup_name: String,
    pub use_chap: bool,
    pub chap: ChapCredentials,
    pub data_lif: Option<String>,
}

/// The driver variants sharing this core
#[derive(Debug, Clone, PartialEq)]
pub enum DriverKind {
    Nas(NasSettings),
    NasFlexGroup(NasSettings),
    San(SanSettings),
    SanEconomy(SanSettings),
}

impl DriverKind {
    pub fn name(&self) -> &'static str {
        match self {
            DriverKind::Nas(_) => ONTAP_NAS_DRIVER,
            DriverKind::NasFlexGroup(_) => ONTAP_NAS_FLEXGROUP_DRIVER,
            DriverKind::San(_) => ONTAP_SAN_DRIVER,
            DriverKind::SanEconomy(_) => ONTAP_SAN_ECONOMY_DRIVER,
        }
    }

    pub fn nas(&self) -> Option<&NasSettings> {
        match self {
            DriverKind::Nas(s) | DriverKind::NasFlexGroup(s) => Some(s),
            _ => None,
        }
    }

    pub fn san(&self) -> Option<&SanSettings> {
        match self {
            DriverKind::San(s) | DriverKind::SanEconomy(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_nas(&self) -> bool {
        self.nas().is_some()
    }

    pub fn is_san(&self) -> bool {
        self.san().is_some()
    }

    /// FlexGroups are cloned through the asynchronous job path
    pub fn uses_async_clone(&self) -> bool {
        matches!(self, DriverKind::NasFlexGroup(_))
    }

    /// Whether splitOnClone is meaningful for this driver
    pub fn supports_split_on_clone(&self) -> bool {
        !matches!(self, DriverKind::NasFlexGroup(_))
    }
}

impl std::fmt::Display for DriverKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::io::Write;

    #[test]
    fn test_populate_defaults() {
        let mut config = DriverConfig {
            storage_driver_name: ONTAP_NAS_DRIVER.into(),
            backend_uuid: "abc".into(),
            ..Default::default()
        };
        config.populate_defaults().unwrap();

        assert_eq!(config.size, "1G");
        assert_eq!(config.storage_prefix(), "trident");
        assert_eq!(config.space_reserve, "none");
        assert_eq!(config.snapshot_policy, "none");
        assert_eq!(config.unix_permissions, "---rwxrwxrwx");
        assert_eq!(config.export_policy, "default");
        assert_eq!(config.security_style, "unix");
        assert_eq!(config.split_on_clone, "false");
        assert_eq!(config.file_system_type, "ext4");
        assert_eq!(config.auto_export_cidrs, vec!["0.0.0.0/0", "::/0"]);
        assert_eq!(config.igroup_name, "trident-abc");
    }

    #[test]
    fn test_populate_defaults_automatic_export_policy() {
        let mut config = DriverConfig {
            auto_export_policy: true,
            export_policy: "custom".into(),
            ..Default::default()
        };
        config.populate_defaults().unwrap();
        assert_eq!(config.export_policy, AUTOMATIC_EXPORT_POLICY);
    }

    #[test]
    fn test_populate_defaults_rejects_bad_values() {
        let mut config = DriverConfig {
            split_on_clone: "maybe".into(),
            ..Default::default()
        };
        assert_matches!(config.populate_defaults(), Err(Error::Configuration(_)));

        let mut config = DriverConfig {
            size: "lots".into(),
            ..Default::default()
        };
        assert_matches!(config.populate_defaults(), Err(Error::Configuration(_)));
    }

    #[test]
    fn test_driver_kind_variants() {
        let mut config = DriverConfig {
            storage_driver_name: ONTAP_SAN_DRIVER.into(),
            use_chap: true,
            chap_username: "user".into(),
            ..Default::default()
        };
        config.populate_defaults().unwrap();

        let kind = config.driver_kind().unwrap();
        assert!(kind.is_san());
        assert_eq!(kind.san().unwrap().chap.chap_username, "user");
        assert_eq!(kind.san().unwrap().data_lif, None);

        config.storage_driver_name = ONTAP_NAS_FLEXGROUP_DRIVER.into();
        let kind = config.driver_kind().unwrap();
        assert!(kind.is_nas());
        assert!(kind.uses_async_clone());
        assert!(!kind.supports_split_on_clone());

        config.storage_driver_name = "solidfire-san".into();
        assert_matches!(config.driver_kind(), Err(Error::Configuration(_)));
    }

    #[test]
    fn test_storage_prefix_validation() {
        assert!(validate_storage_prefix("trident").is_ok());
        assert!(validate_storage_prefix("_x9").is_ok());
        assert!(validate_storage_prefix("9abc").is_err());
        assert!(validate_storage_prefix("tri-dent").is_err());
        assert!(validate_storage_prefix("").is_err());
    }

    #[test]
    fn test_clean_backend_name() {
        assert_eq!(clean_backend_name("ontap[fe80::1]"), "ontapfe80..1");
    }

    #[test]
    fn test_from_yaml_and_json_file() {
        let mut yaml = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            yaml,
            "storageDriverName: ontap-nas\nsvm: svm0\nlimitAggregateUsage: \"80%\"\nautoExportCIDRs: [\"10.0.0.0/8\"]\nstorage:\n  - zone: z1\n    spaceReserve: volume\n"
        )
        .unwrap();
        let config = DriverConfig::from_file(yaml.path()).unwrap();
        assert_eq!(config.svm, "svm0");
        assert_eq!(config.limit_aggregate_usage, "80%");
        assert_eq!(config.auto_export_cidrs, vec!["10.0.0.0/8"]);
        assert_eq!(config.storage.len(), 1);
        assert_eq!(config.storage[0].space_reserve, "volume");

        let mut json = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(json, r#"{{"storageDriverName":"ontap-san","useCHAP":true}}"#).unwrap();
        let config = DriverConfig::from_file(json.path()).unwrap();
        assert!(config.use_chap);
    }

    #[test]
    fn test_redacted() {
        let config = DriverConfig {
            username: "admin".into(),
            password: "secret".into(),
            chap_initiator_secret: "s1".into(),
            chap_username: "chap".into(),
            ..Default::default()
        };
        let redacted = config.redacted();
        assert!(redacted.username.is_empty());
        assert!(redacted.password.is_empty());
        assert!(redacted.chap_initiator_secret.is_empty());
        assert_eq!(redacted.chap_username, "chap");
    }
}
