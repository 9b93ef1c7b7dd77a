//! Access Control
//!
//! Keeps host access state on the appliance converged with the set of nodes
//! that should reach the backend's volumes: NFS export rules for NAS drivers,
//! initiator-group membership and CHAP for SAN drivers.

pub mod chap;
pub mod export;
pub mod igroup;
pub mod locks;
pub mod publish;

use serde::{Deserialize, Serialize};

pub use locks::KeyedLocks;

/// A host that needs access to the backend
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    pub name: String,
    /// iSCSI initiator name, for SAN access
    pub iqn: Option<String>,
    /// Host addresses, for NAS access
    pub ips: Vec<String>,
}

impl NodeInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_iqn(mut self, iqn: impl Into<String>) -> Self {
        self.iqn = Some(iqn.into());
        self
    }

    pub fn with_ips<I, S>(mut self, ips: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ips = ips.into_iter().map(Into::into).collect();
        self
    }
}

/// Mutations issued by one reconciliation pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub added: usize,
    pub removed: usize,
}

impl ReconcileReport {
    pub fn is_noop(&self) -> bool {
        self.added == 0 && self.removed == 0
    }
}
