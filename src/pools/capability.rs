//! Pool Capability Model
//!
//! A storage pool advertises capabilities as [`Offer`]s keyed by attribute
//! name; a volume request states requirements as [`Request`]s. A pool matches
//! a request when every requested attribute is offered and satisfied.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

// =============================================================================
// Attribute Names
// =============================================================================

/// Capability attribute names
pub mod attrs {
    pub const BACKEND_TYPE: &str = "backendType";
    pub const MEDIA: &str = "media";
    pub const REGION: &str = "region";
    pub const ZONE: &str = "zone";
    pub const LABELS: &str = "labels";
    pub const SELECTOR: &str = "selector";
    pub const ENCRYPTION: &str = "encryption";
    pub const PROVISIONING_TYPE: &str = "provisioningType";
    pub const SNAPSHOTS: &str = "snapshots";
    pub const CLONES: &str = "clones";

    pub const MEDIA_HDD: &str = "hdd";
    pub const MEDIA_HYBRID: &str = "hybrid";
    pub const MEDIA_SSD: &str = "ssd";
}

/// Internal (driver-private) attribute keys of a pool
pub mod internal {
    pub const SIZE: &str = "size";
    pub const REGION: &str = "region";
    pub const ZONE: &str = "zone";
    pub const MEDIA: &str = "media";
    pub const SPACE_ALLOCATION: &str = "spaceAllocation";
    pub const SNAPSHOT_DIR: &str = "snapshotDir";
    pub const SPACE_RESERVE: &str = "spaceReserve";
    pub const SNAPSHOT_POLICY: &str = "snapshotPolicy";
    pub const SNAPSHOT_RESERVE: &str = "snapshotReserve";
    pub const UNIX_PERMISSIONS: &str = "unixPermissions";
    pub const EXPORT_POLICY: &str = "exportPolicy";
    pub const SECURITY_STYLE: &str = "securityStyle";
    pub const ENCRYPTION: &str = "encryption";
    pub const FILE_SYSTEM_TYPE: &str = "fileSystemType";
    pub const SPLIT_ON_CLONE: &str = "splitOnClone";
    pub const TIERING_POLICY: &str = "tieringPolicy";
}

// =============================================================================
// Offers & Requests
// =============================================================================

/// A capability value advertised by a pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type", content = "value")]
pub enum Offer {
    Strings(BTreeSet<String>),
    Bool(bool),
    Labels(BTreeMap<String, String>),
}

impl Offer {
    pub fn string(value: impl Into<String>) -> Self {
        Offer::Strings(BTreeSet::from([value.into()]))
    }

    pub fn strings<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Offer::Strings(values.into_iter().map(Into::into).collect())
    }

    /// Union of the string values of several offers
    pub fn union_of<'a>(offers: impl IntoIterator<Item = &'a Offer>) -> Self {
        let mut merged = BTreeSet::new();
        for offer in offers {
            if let Offer::Strings(values) = offer {
                merged.extend(values.iter().cloned());
            }
        }
        Offer::Strings(merged)
    }

    /// Backend labels overlaid with pool labels
    pub fn labels(backend: &BTreeMap<String, String>, pool: &BTreeMap<String, String>) -> Self {
        let mut merged = backend.clone();
        merged.extend(pool.iter().map(|(k, v)| (k.clone(), v.clone())));
        Offer::Labels(merged)
    }

    pub fn matches(&self, request: &Request) -> bool {
        match (self, request) {
            (Offer::Strings(values), Request::String(wanted)) => {
                values.iter().any(|v| v.eq_ignore_ascii_case(wanted))
            }
            (Offer::Bool(offered), Request::Bool(wanted)) => *offered || !*wanted,
            (Offer::Labels(labels), Request::Labels(selector)) => selector
                .iter()
                .all(|(k, v)| labels.get(k).map(|have| have == v).unwrap_or(false)),
            _ => false,
        }
    }
}

impl std::fmt::Display for Offer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Offer::Strings(values) => {
                let joined: Vec<&str> = values.iter().map(String::as_str).collect();
                write!(f, "{}", joined.join(","))
            }
            Offer::Bool(value) => write!(f, "{}", value),
            Offer::Labels(labels) => {
                let pairs: Vec<String> = labels.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
                write!(f, "{}", pairs.join(","))
            }
        }
    }
}

/// A capability requirement of a volume request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type", content = "value")]
pub enum Request {
    String(String),
    Bool(bool),
    /// `k=v[,k=v]` selector, parsed
    Labels(BTreeMap<String, String>),
}

impl Request {
    pub fn string(value: impl Into<String>) -> Self {
        Request::String(value.into())
    }

    /// Parse a `k=v[,k=v]` label selector
    pub fn selector(selector: &str) -> Result<Self> {
        let mut pairs = BTreeMap::new();
        for term in selector.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            let (k, v) = term.split_once('=').ok_or_else(|| {
                Error::Validation(format!("invalid label selector term {:?}", term))
            })?;
            pairs.insert(k.trim().to_string(), v.trim().to_string());
        }
        Ok(Request::Labels(pairs))
    }

    /// Interpret a raw attribute value according to the attribute's type
    pub fn parse(attribute: &str, value: &str) -> Result<Self> {
        match attribute {
            attrs::ENCRYPTION | attrs::SNAPSHOTS | attrs::CLONES => value
                .parse::<bool>()
                .map(Request::Bool)
                .map_err(|_| {
                    Error::Validation(format!("attribute {} expects a boolean, got {:?}", attribute, value))
                }),
            attrs::SELECTOR => Request::selector(value),
            _ => Ok(Request::String(value.to_string())),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Request::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Request::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

/// Requested attributes of one volume, keyed by attribute name
pub type Requests = BTreeMap<String, Request>;

// =============================================================================
// Storage Pool
// =============================================================================

/// A named, immutable set of capabilities one backend can provision from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoragePool {
    pub name: String,
    /// Owning backend name
    pub backend: String,
    /// Aggregate backing a physical pool; `None` for virtual pools
    pub aggregate: Option<String>,
    pub attributes: BTreeMap<String, Offer>,
    pub internal_attributes: BTreeMap<String, String>,
}

impl StoragePool {
    pub fn new(name: impl Into<String>, backend: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            backend: backend.into(),
            aggregate: None,
            attributes: BTreeMap::new(),
            internal_attributes: BTreeMap::new(),
        }
    }

    pub fn is_physical(&self) -> bool {
        self.aggregate.is_some()
    }

    /// Internal attribute value, empty when unset
    pub fn internal(&self, key: &str) -> &str {
        self.internal_attributes
            .get(key)
            .map(String::as_str)
            .unwrap_or("")
    }

    /// True when every request is satisfied by an offer of the same name
    pub fn matches(&self, requests: &Requests) -> bool {
        requests.iter().all(|(name, request)| {
            self.attributes
                .get(name)
                .map(|offer| offer.matches(request))
                .unwrap_or(false)
        })
    }
}
