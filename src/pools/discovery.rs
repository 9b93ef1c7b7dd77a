//! Pool Discovery
//!
//! Builds a backend's physical pools (one per aggregate assigned to the SVM)
//! and its virtual pools (one per `storage` entry in the backend config).

use super::capability::{attrs, internal, Offer, StoragePool};
use super::PoolSet;
use crate::config::{parse_bool, DriverConfig, DriverKind};
use crate::domain::ports::ManagementClient;
use crate::error::{ApiErrorCode, Error, Result};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, error, info, warn};

/// Name reported for a pool of this backend
pub fn pool_name(name: &str, backend: &str) -> String {
    format!("{}_{}", backend, name.replace('-', ""))
}

/// Capabilities every pool of a driver type supports
pub fn default_pool_offers(kind: &DriverKind) -> BTreeMap<String, Offer> {
    BTreeMap::from([
        (attrs::BACKEND_TYPE.to_string(), Offer::string(kind.name())),
        (attrs::SNAPSHOTS.to_string(), Offer::Bool(true)),
        (attrs::CLONES.to_string(), Offer::Bool(true)),
        (attrs::ENCRYPTION.to_string(), Offer::Bool(true)),
        (
            attrs::PROVISIONING_TYPE.to_string(),
            Offer::strings(["thick", "thin"]),
        ),
    ])
}

/// Media type implied by an appliance aggregate type
pub fn media_for_aggregate_type(aggregate_type: &str) -> Option<&'static str> {
    match aggregate_type {
        "hdd" => Some(attrs::MEDIA_HDD),
        "hybrid" => Some(attrs::MEDIA_HYBRID),
        "ssd" => Some(attrs::MEDIA_SSD),
        _ => None,
    }
}

/// Aggregates this backend may provision from
pub async fn discover_backend_aggregates(
    client: &dyn ManagementClient,
    svm: &str,
    configured_aggregate: &str,
) -> Result<Vec<String>> {
    let assigned = client
        .vserver_aggregate_names()
        .await
        .map_err(|e| Error::api("list SVM aggregates", svm, e))?;

    if assigned.is_empty() {
        return Err(Error::Configuration(format!(
            "SVM {} has no assigned aggregates",
            svm
        )));
    }
    debug!(svm = %svm, pools = ?assigned, "Read storage pools assigned to SVM");

    if configured_aggregate.is_empty() {
        return Ok(assigned);
    }

    if assigned.iter().any(|a| a == configured_aggregate) {
        debug!(
            aggregate = %configured_aggregate,
            "Provisioning will be restricted to the aggregate set in the backend config"
        );
        Ok(vec![configured_aggregate.to_string()])
    } else {
        Err(Error::Configuration(format!(
            "the assigned aggregates for SVM {} do not include the configured aggregate {}",
            svm, configured_aggregate
        )))
    }
}

/// Media offers for the given aggregates, from appliance-reported types.
///
/// Aggregates of unknown type and aggregates outside `aggregates` are skipped.
pub async fn aggregate_media(
    client: &dyn ManagementClient,
    aggregates: &[String],
) -> Result<BTreeMap<String, Offer>> {
    let wanted: BTreeSet<&str> = aggregates.iter().map(String::as_str).collect();
    let reported = client
        .aggregate_attributes()
        .await
        .map_err(|e| Error::api("read aggregate attributes", "SVM", e))?;

    let mut media = BTreeMap::new();
    for aggr in reported {
        if !wanted.contains(aggr.aggregate.as_str()) {
            continue;
        }
        match media_for_aggregate_type(&aggr.aggregate_type) {
            Some(m) => {
                debug!(aggregate = %aggr.aggregate, media_type = %aggr.aggregate_type, "Read aggregate attributes");
                media.insert(aggr.aggregate, Offer::string(m));
            }
            None => {
                debug!(
                    aggregate = %aggr.aggregate,
                    media_type = %aggr.aggregate_type,
                    "Aggregate has unknown performance characteristics"
                );
            }
        }
    }
    Ok(media)
}

/// Best-effort media enrichment; failures leave pools without a media offer
pub async fn enrich_with_aggregate_attributes(
    client: &dyn ManagementClient,
    aggregates: &[String],
    username: &str,
) -> BTreeMap<String, Offer> {
    match aggregate_media(client, aggregates).await {
        Ok(media) => media,
        Err(e) if e.api_code() == Some(ApiErrorCode::InsufficientPrivilege) => {
            warn!(
                username = %username,
                "User has insufficient privileges to obtain aggregate info. \
                 Storage classes with physical attributes such as 'media' will not match pools on this backend."
            );
            BTreeMap::new()
        }
        Err(e) => {
            error!(
                error = %e,
                "Could not obtain aggregate info; storage classes with physical attributes such as 'media' \
                 will not match pools on this backend"
            );
            BTreeMap::new()
        }
    }
}

/// Discover, enrich and build all pools of a backend
pub async fn initialize_storage_pools(
    client: &dyn ManagementClient,
    config: &DriverConfig,
    kind: &DriverKind,
    backend: &str,
) -> Result<PoolSet> {
    let aggregates = discover_backend_aggregates(client, &config.svm, &config.aggregate)
        .await
        .map_err(|e| match e {
            Error::Configuration(msg) => {
                Error::Configuration(format!("could not get storage pools from array: {}", msg))
            }
            other => other,
        })?;

    let media = enrich_with_aggregate_attributes(client, &aggregates, &config.username).await;
    let defaults = default_pool_offers(kind);

    let physical = build_physical_pools(config, kind, backend, &aggregates, &media, &defaults);
    let virtual_pools = build_virtual_pools(config, kind, backend, &media, &defaults)?;

    info!(
        backend = %backend,
        physical = physical.len(),
        virtual_pools = virtual_pools.len(),
        "Initialized storage pools"
    );

    Ok(PoolSet::new(physical, virtual_pools))
}

/// One pool per aggregate, carrying the backend-wide defaults
pub fn build_physical_pools(
    config: &DriverConfig,
    kind: &DriverKind,
    backend: &str,
    aggregates: &[String],
    media: &BTreeMap<String, Offer>,
    defaults: &BTreeMap<String, Offer>,
) -> BTreeMap<String, StoragePool> {
    let mut pools = BTreeMap::new();

    for aggregate in aggregates {
        let mut pool = StoragePool::new(pool_name(aggregate, backend), backend);
        pool.aggregate = Some(aggregate.clone());
        pool.attributes.extend(defaults.clone());

        if let Some(offer) = media.get(aggregate) {
            pool.attributes.insert(attrs::MEDIA.to_string(), offer.clone());
            pool.internal_attributes
                .insert(internal::MEDIA.to_string(), offer.to_string());
        }
        if !config.region.is_empty() {
            pool.attributes
                .insert(attrs::REGION.to_string(), Offer::string(&config.region));
        }
        if !config.zone.is_empty() {
            pool.attributes
                .insert(attrs::ZONE.to_string(), Offer::string(&config.zone));
        }

        let values = ResolvedValues::from_config(config);
        values.apply(&mut pool, kind);
        pool.internal_attributes
            .insert(internal::ENCRYPTION.to_string(), config.encryption.clone());

        pools.insert(pool.name.clone(), pool);
    }

    pools
}

/// One pool per virtual pool definition, values resolved pool-first
pub fn build_virtual_pools(
    config: &DriverConfig,
    kind: &DriverKind,
    backend: &str,
    media: &BTreeMap<String, Offer>,
    defaults: &BTreeMap<String, Offer>,
) -> Result<BTreeMap<String, StoragePool>> {
    let mut pools = BTreeMap::new();

    for (index, vpool) in config.storage.iter().enumerate() {
        let mut pool = StoragePool::new(pool_name(&format!("pool_{}", index), backend), backend);
        pool.attributes.extend(defaults.clone());

        let pick = |own: &String, fallback: &String| {
            if own.is_empty() {
                fallback.clone()
            } else {
                own.clone()
            }
        };

        let values = ResolvedValues {
            size: pick(&vpool.size, &config.size),
            region: pick(&vpool.region, &config.region),
            zone: pick(&vpool.zone, &config.zone),
            space_allocation: pick(&vpool.space_allocation, &config.space_allocation),
            space_reserve: pick(&vpool.space_reserve, &config.space_reserve),
            snapshot_policy: pick(&vpool.snapshot_policy, &config.snapshot_policy),
            snapshot_reserve: pick(&vpool.snapshot_reserve, &config.snapshot_reserve),
            split_on_clone: pick(&vpool.split_on_clone, &config.split_on_clone),
            unix_permissions: pick(&vpool.unix_permissions, &config.unix_permissions),
            snapshot_dir: pick(&vpool.snapshot_dir, &config.snapshot_dir),
            export_policy: pick(&vpool.export_policy, &config.export_policy),
            security_style: pick(&vpool.security_style, &config.security_style),
            file_system_type: pick(&vpool.file_system_type, &config.file_system_type),
            tiering_policy: pick(&vpool.tiering_policy, &config.tiering_policy),
        };
        let encryption = pick(&vpool.encryption, &config.encryption);

        pool.attributes.insert(
            attrs::LABELS.to_string(),
            Offer::labels(&config.labels, &vpool.labels),
        );
        if !values.region.is_empty() {
            pool.attributes
                .insert(attrs::REGION.to_string(), Offer::string(&values.region));
        }
        if !values.zone.is_empty() {
            pool.attributes
                .insert(attrs::ZONE.to_string(), Offer::string(&values.zone));
        }
        if !media.is_empty() {
            let offer = Offer::union_of(media.values());
            pool.internal_attributes
                .insert(internal::MEDIA.to_string(), offer.to_string());
            pool.attributes.insert(attrs::MEDIA.to_string(), offer);
        }
        if !encryption.is_empty() {
            let enabled = parse_bool(&encryption).map_err(|_| {
                Error::Validation(format!(
                    "invalid boolean value for encryption: {:?} in virtual pool: {}",
                    encryption, pool.name
                ))
            })?;
            pool.attributes
                .insert(attrs::ENCRYPTION.to_string(), Offer::Bool(enabled));
            pool.internal_attributes
                .insert(internal::ENCRYPTION.to_string(), encryption);
        }

        values.apply(&mut pool, kind);
        pools.insert(pool.name.clone(), pool);
    }

    Ok(pools)
}

/// Internal attribute values of one pool after precedence resolution
struct ResolvedValues {
    size: String,
    region: String,
    zone: String,
    space_allocation: String,
    space_reserve: String,
    snapshot_policy: String,
    snapshot_reserve: String,
    split_on_clone: String,
    unix_permissions: String,
    snapshot_dir: String,
    export_policy: String,
    security_style: String,
    file_system_type: String,
    tiering_policy: String,
}

impl ResolvedValues {
    fn from_config(config: &DriverConfig) -> Self {
        Self {
            size: config.size.clone(),
            region: config.region.clone(),
            zone: config.zone.clone(),
            space_allocation: config.space_allocation.clone(),
            space_reserve: config.space_reserve.clone(),
            snapshot_policy: config.snapshot_policy.clone(),
            snapshot_reserve: config.snapshot_reserve.clone(),
            split_on_clone: config.split_on_clone.clone(),
            unix_permissions: config.unix_permissions.clone(),
            snapshot_dir: config.snapshot_dir.clone(),
            export_policy: config.export_policy.clone(),
            security_style: config.security_style.clone(),
            file_system_type: config.file_system_type.clone(),
            tiering_policy: config.tiering_policy.clone(),
        }
    }

    fn apply(self, pool: &mut StoragePool, kind: &DriverKind) {
        let values = &mut pool.internal_attributes;
        values.insert(internal::SIZE.to_string(), self.size);
        values.insert(internal::REGION.to_string(), self.region);
        values.insert(internal::ZONE.to_string(), self.zone);
        values.insert(internal::SPACE_RESERVE.to_string(), self.space_reserve);
        values.insert(internal::SNAPSHOT_POLICY.to_string(), self.snapshot_policy);
        values.insert(internal::SNAPSHOT_RESERVE.to_string(), self.snapshot_reserve);
        values.insert(internal::SPLIT_ON_CLONE.to_string(), self.split_on_clone);
        values.insert(internal::UNIX_PERMISSIONS.to_string(), self.unix_permissions);
        values.insert(internal::SNAPSHOT_DIR.to_string(), self.snapshot_dir);
        values.insert(internal::EXPORT_POLICY.to_string(), self.export_policy);
        values.insert(internal::SECURITY_STYLE.to_string(), self.security_style);
        values.insert(internal::TIERING_POLICY.to_string(), self.tiering_policy);

        if kind.is_san() {
            values.insert(internal::SPACE_ALLOCATION.to_string(), self.space_allocation);
            values.insert(internal::FILE_SYSTEM_TYPE.to_string(), self.file_system_type);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::appliance::SimulatedAppliance;
    use crate::config::{VirtualPoolConfig, ONTAP_NAS_DRIVER, ONTAP_SAN_DRIVER};
    use crate::error::ApiError;
    use assert_matches::assert_matches;

    fn config(driver: &str) -> DriverConfig {
        let mut config = DriverConfig {
            storage_driver_name: driver.into(),
            svm: "svm0".into(),
            region: "us-east".into(),
            ..Default::default()
        };
        config.populate_defaults().unwrap();
        config
    }

    fn appliance() -> SimulatedAppliance {
        let appliance = SimulatedAppliance::new();
        appliance.add_aggregate("aggr-ssd", "ssd", 1000, 0);
        appliance.add_aggregate("aggr_hdd", "hdd", 1000, 0);
        appliance.add_aggregate("aggr_mystery", "vmdisk", 1000, 0);
        appliance
    }

    #[test]
    fn test_pool_name() {
        assert_eq!(pool_name("aggr-1", "ontapnas"), "ontapnas_aggr1");
        assert_eq!(pool_name("pool_0", "ontapnas"), "ontapnas_pool_0");
    }

    #[tokio::test]
    async fn test_discover_restricts_to_configured_aggregate() {
        let appliance = appliance();
        let all = discover_backend_aggregates(&appliance, "svm0", "").await.unwrap();
        assert_eq!(all.len(), 3);

        let one = discover_backend_aggregates(&appliance, "svm0", "aggr_hdd").await.unwrap();
        assert_eq!(one, vec!["aggr_hdd"]);

        assert_matches!(
            discover_backend_aggregates(&appliance, "svm0", "aggr_missing").await,
            Err(Error::Configuration(_))
        );
    }

    #[tokio::test]
    async fn test_zero_aggregates_is_fatal() {
        let appliance = SimulatedAppliance::new();
        assert_matches!(
            discover_backend_aggregates(&appliance, "svm0", "").await,
            Err(Error::Configuration(msg)) if msg.contains("no assigned aggregates")
        );
    }

    #[tokio::test]
    async fn test_physical_pools_carry_media_and_defaults() {
        let appliance = appliance();
        let kind = config(ONTAP_SAN_DRIVER).driver_kind().unwrap();
        let pools = initialize_storage_pools(&appliance, &config(ONTAP_SAN_DRIVER), &kind, "san")
            .await
            .unwrap();

        let ssd = &pools.physical["san_aggrssd"];
        assert_eq!(ssd.aggregate.as_deref(), Some("aggr-ssd"));
        assert_eq!(ssd.attributes[attrs::MEDIA], Offer::string("ssd"));
        assert_eq!(ssd.attributes[attrs::REGION], Offer::string("us-east"));
        assert_eq!(ssd.internal(internal::MEDIA), "ssd");
        assert_eq!(ssd.internal(internal::FILE_SYSTEM_TYPE), "ext4");
        assert_eq!(ssd.internal(internal::SPACE_ALLOCATION), "true");

        let mystery = &pools.physical["san_aggr_mystery"];
        assert!(!mystery.attributes.contains_key(attrs::MEDIA));
        assert!(pools.virtual_pools.is_empty());
    }

    #[tokio::test]
    async fn test_insufficient_privilege_degrades() {
        let appliance = appliance();
        appliance.inject_fault(
            "aggregate_attributes",
            ApiError::new(ApiErrorCode::InsufficientPrivilege, "scope"),
        );
        let cfg = config(ONTAP_NAS_DRIVER);
        let kind = cfg.driver_kind().unwrap();

        let pools = initialize_storage_pools(&appliance, &cfg, &kind, "nas").await.unwrap();
        assert_eq!(pools.physical.len(), 3);
        assert!(pools
            .physical
            .values()
            .all(|p| !p.attributes.contains_key(attrs::MEDIA)));
        assert!(pools
            .physical
            .values()
            .all(|p| !p.internal_attributes.contains_key(internal::FILE_SYSTEM_TYPE)));
    }

    #[tokio::test]
    async fn test_virtual_pools_resolve_precedence() {
        let appliance = appliance();
        let mut cfg = config(ONTAP_NAS_DRIVER);
        cfg.labels.insert("tier".into(), "gold".into());
        cfg.storage = vec![
            VirtualPoolConfig {
                zone: "z1".into(),
                space_reserve: "volume".into(),
                encryption: "true".into(),
                labels: BTreeMap::from([("app".to_string(), "db".to_string())]),
                ..Default::default()
            },
            VirtualPoolConfig::default(),
        ];
        let kind = cfg.driver_kind().unwrap();

        let pools = initialize_storage_pools(&appliance, &cfg, &kind, "nas").await.unwrap();
        assert_eq!(pools.virtual_pools.len(), 2);

        let first = &pools.virtual_pools["nas_pool_0"];
        assert_eq!(first.internal(internal::SPACE_RESERVE), "volume");
        assert_eq!(first.internal(internal::ZONE), "z1");
        assert_eq!(first.internal(internal::REGION), "us-east");
        assert_eq!(first.attributes[attrs::ENCRYPTION], Offer::Bool(true));
        assert_eq!(first.attributes[attrs::MEDIA], Offer::strings(["hdd", "ssd"]));
        assert_eq!(first.internal(internal::MEDIA), "hdd,ssd");
        assert_eq!(
            first.attributes[attrs::LABELS],
            Offer::Labels(BTreeMap::from([
                ("app".to_string(), "db".to_string()),
                ("tier".to_string(), "gold".to_string()),
            ]))
        );

        let second = &pools.virtual_pools["nas_pool_1"];
        assert_eq!(second.internal(internal::SPACE_RESERVE), "none");
        assert_eq!(second.attributes[attrs::ENCRYPTION], Offer::Bool(false));
    }

    #[tokio::test]
    async fn test_virtual_pool_bad_encryption() {
        let appliance = appliance();
        let mut cfg = config(ONTAP_NAS_DRIVER);
        cfg.storage = vec![VirtualPoolConfig {
            encryption: "sometimes".into(),
            ..Default::default()
        }];
        let kind = cfg.driver_kind().unwrap();

        assert_matches!(
            initialize_storage_pools(&appliance, &cfg, &kind, "nas").await,
            Err(Error::Validation(_))
        );
    }
}
