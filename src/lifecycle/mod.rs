//! Volume Lifecycle
//!
//! Clone orchestration, snapshot management and the volume-level helpers
//! they share.

pub mod clone;
pub mod snapshot;
pub mod volume;

pub use clone::{create_clone, effective_split_on_clone, CloneOutcome, CloneRequest};
pub use snapshot::{
    cascade_split_from_busy_snapshot, create_snapshot, delete_snapshot, get_snapshot,
    list_snapshots, restore_snapshot, Snapshot,
};
pub use volume::{get_volume, unmount_and_offline_volume};

/// Name format of snapshots created on the fly for a clone
pub const SNAPSHOT_NAME_FORMAT: &str = "%Y%m%dT%H%M%SZ";

/// Creation timestamp format reported for snapshots
pub const SNAPSHOT_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";
