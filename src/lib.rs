//! ONTAP Driver Core - Storage Backend Control Plane
//!
//! Shared control-plane logic for ONTAP-style NAS and SAN storage drivers.
//! The crate never touches hosts or the data path; it drives a storage
//! appliance through its management API to keep host access, volume clones
//! and snapshots, and pool admission consistent.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          Backend (driver.rs)                            │
//! │     config · DriverKind · PoolSet · KeyedLocks · DriverMetrics          │
//! ├──────────────────┬──────────────────────┬───────────────────────────────┤
//! │  Access          │  Lifecycle           │  Pools                        │
//! │  export rules    │  clone orchestration │  capability model             │
//! │  igroups · CHAP  │  snapshots           │  discovery · validation       │
//! │  publication     │  unmount / offline   │  admission control            │
//! ├──────────────────┴──────────────────────┴───────────────────────────────┤
//! │                 ManagementClient (domain/ports.rs)                      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`driver`]: Per-backend context object
//! - [`access`]: Export policy, igroup and CHAP reconciliation, publication
//! - [`lifecycle`]: Clone and snapshot orchestration
//! - [`pools`]: Storage pools, discovery and admission control
//! - [`domain`]: Management API port
//! - [`appliance`]: In-memory appliance implementing the port
//! - [`config`]: Backend configuration and driver variants
//! - [`error`]: Error types and handling

pub mod access;
pub mod appliance;
pub mod config;
pub mod domain;
pub mod driver;
pub mod error;
pub mod lifecycle;
pub mod metrics;
pub mod pools;
pub mod retry;
pub mod units;

// Re-export commonly used types
pub use access::publish::{LunPublishInfo, PublishRequest};
pub use access::{KeyedLocks, NodeInfo, ReconcileReport};

pub use appliance::SimulatedAppliance;

pub use config::{DriverConfig, DriverKind, NasSettings, SanSettings, TimingConfig};

pub use domain::ports::{ApiResult, ManagementClient, ManagementClientRef};

pub use driver::{Backend, Placement, PublishInfo};

pub use error::{ApiError, ApiErrorCode, Error, ErrorAction, ErrorKind, Result};

pub use lifecycle::{CloneOutcome, CloneRequest, Snapshot};

pub use metrics::DriverMetrics;

pub use pools::admission::VolumeRequest;
pub use pools::{Offer, PoolSet, PoolSource, Request, Requests, StoragePool};

pub use retry::BackoffPolicy;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
