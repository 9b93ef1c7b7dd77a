//! Clone orchestration
//!
//! `target absent -> snapshot -> clone (sync | async job) -> [probe] ->
//! mount (NAS) -> split (optional)`. Each step runs only after the previous
//! one succeeded; nothing is rolled back on failure.

use super::SNAPSHOT_NAME_FORMAT;
use crate::config::{parse_bool, DriverKind, TimingConfig};
use crate::domain::ports::{ApplianceFeature, JobId, JobState, ManagementClient};
use crate::error::{ApiError, ApiErrorCode, Error, Result};
use crate::pools::capability::{internal, StoragePool};
use crate::retry::retry_with_backoff;
use chrono::Utc;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, info, warn};

/// What to clone
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CloneRequest {
    /// Internal name of the new volume
    pub name: String,
    /// Internal name of the source volume
    pub source: String,
    /// Existing snapshot to clone from; one is created when absent
    pub snapshot: Option<String>,
}

impl CloneRequest {
    pub fn new(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
            snapshot: None,
        }
    }

    pub fn from_snapshot(mut self, snapshot: impl Into<String>) -> Self {
        self.snapshot = Some(snapshot.into());
        self
    }
}

/// What the clone flow did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloneOutcome {
    /// Snapshot the clone is backed by
    pub snapshot: String,
    pub snapshot_created: bool,
    /// Existence probes issued after a job-tracking failure
    pub probe_attempts: u32,
    pub junction: Option<String>,
    pub split_started: bool,
}

/// Resolve split-on-clone: request option, then the source pool's value,
/// then the backend default
pub fn effective_split_on_clone(
    requested: Option<&str>,
    source_pool: Option<&StoragePool>,
    backend_default: &str,
) -> Result<bool> {
    let value = requested
        .filter(|v| !v.is_empty())
        .or_else(|| {
            source_pool
                .map(|pool| pool.internal(internal::SPLIT_ON_CLONE))
                .filter(|v| !v.is_empty())
        })
        .unwrap_or(backend_default);

    parse_bool(value).map_err(|_| {
        Error::Validation(format!("invalid boolean value for splitOnClone: {:?}", value))
    })
}

/// Create a clone of `request.source`.
///
/// Fails with `ResourceExists` before touching anything if the target name
/// is taken.
pub async fn create_clone(
    client: &dyn ManagementClient,
    kind: &DriverKind,
    timing: &TimingConfig,
    request: &CloneRequest,
    split: bool,
) -> Result<CloneOutcome> {
    let name = request.name.as_str();
    let source = request.source.as_str();
    let use_async = kind.uses_async_clone();

    if use_async && !client.supports_feature(ApplianceFeature::FlexGroupClone) {
        return Err(Error::Validation(
            "the appliance does not support FlexGroup cloning".into(),
        ));
    }

    let exists = client
        .volume_exists(name)
        .await
        .map_err(|e| Error::api("check for existing volume", name, e))?;
    if exists {
        return Err(Error::ResourceExists {
            kind: "volume".into(),
            name: name.to_string(),
        });
    }

    let (snapshot, snapshot_created) = match request.snapshot.as_deref() {
        Some(snapshot) if !snapshot.is_empty() => (snapshot.to_string(), false),
        _ => {
            let snapshot = Utc::now().format(SNAPSHOT_NAME_FORMAT).to_string();
            client
                .snapshot_create(&snapshot, source)
                .await
                .map_err(|e| Error::api("create snapshot", format!("{}/{}", source, snapshot), e))?;
            debug!(snapshot = %snapshot, source = %source, "Created snapshot for clone");
            (snapshot, true)
        }
    };

    debug!(
        name = %name,
        source = %source,
        snapshot = %snapshot,
        split,
        use_async,
        "Creating volume clone"
    );

    let probe_attempts = if use_async {
        clone_async(client, timing, name, source, &snapshot).await?;
        0
    } else {
        match client.volume_clone_create(name, source, &snapshot).await {
            Ok(()) => 0,
            Err(e) => handle_clone_error(client, timing, e, name, source, &snapshot).await?,
        }
    };

    let junction = if kind.is_nas() {
        let junction = format!("/{}", name);
        client
            .volume_mount(name, &junction)
            .await
            .map_err(|e| Error::api("mount volume to junction", name, e))?;
        Some(junction)
    } else {
        None
    };

    if split {
        client
            .volume_clone_split_start(name)
            .await
            .map_err(|e| Error::api("split clone", name, e))?;
    }

    info!(name = %name, source = %source, snapshot = %snapshot, "Created clone");
    Ok(CloneOutcome {
        snapshot,
        snapshot_created,
        probe_attempts,
        junction,
        split_started: split,
    })
}

/// Submit an async clone job and wait for it within the configured bound
async fn clone_async(
    client: &dyn ManagementClient,
    timing: &TimingConfig,
    name: &str,
    source: &str,
    snapshot: &str,
) -> Result<()> {
    let job = client
        .volume_clone_create_async(name, source, snapshot)
        .await
        .map_err(|e| Error::api("create clone", name, e))?;
    debug!(job = %job, name = %name, "Submitted async clone job");

    tokio::time::timeout(
        timing.async_clone_timeout,
        wait_for_job(client, timing, &job, name),
    )
    .await
    .map_err(|_| Error::Timeout {
        operation: "async clone".into(),
        resource: name.to_string(),
        duration: timing.async_clone_timeout,
    })?
}

async fn wait_for_job(
    client: &dyn ManagementClient,
    timing: &TimingConfig,
    job: &JobId,
    name: &str,
) -> Result<()> {
    loop {
        let state = client
            .job_status(job)
            .await
            .map_err(|e| Error::api("get job status", job.to_string(), e))?;
        match state {
            JobState::Success => return Ok(()),
            JobState::Failure(message) => {
                return Err(Error::api("create clone", name, ApiError::other(message)))
            }
            JobState::Queued | JobState::Running => {
                tokio::time::sleep(timing.job_poll_interval).await
            }
        }
    }
}

/// Classify a failed sync clone; a lost job is confirmed by probing for the
/// volume. Returns the number of probes issued.
async fn handle_clone_error(
    client: &dyn ManagementClient,
    timing: &TimingConfig,
    err: ApiError,
    name: &str,
    source: &str,
    snapshot: &str,
) -> Result<u32> {
    match err.code {
        ApiErrorCode::NotFound => Err(Error::SnapshotNotFound {
            snapshot: snapshot.to_string(),
            volume: source.to_string(),
        }),
        ApiErrorCode::JobTrackingFailure => {
            warn!(
                error = %err,
                name = %name,
                "Problem encountered during the clone create operation, verifying the clone was created"
            );
            probe_for_volume(client, timing, name).await
        }
        _ => Err(Error::api("create clone", name, err)),
    }
}

async fn probe_for_volume(
    client: &dyn ManagementClient,
    timing: &TimingConfig,
    name: &str,
) -> Result<u32> {
    let attempts = AtomicU32::new(0);

    let found = retry_with_backoff(
        &timing.probe,
        "probe for volume",
        || async {
            attempts.fetch_add(1, Ordering::Relaxed);
            let exists = client
                .volume_exists(name)
                .await
                .map_err(|e| Error::api("check for existing volume", name, e))?;
            if exists {
                Ok(())
            } else {
                Err(Error::ResourceNotFound {
                    kind: "volume".into(),
                    name: name.to_string(),
                })
            }
        },
        |_| true,
    )
    .await;

    let attempts = attempts.load(Ordering::Relaxed);
    match found {
        Ok(()) => {
            debug!(volume = %name, attempts, "Volume found");
            Ok(attempts)
        }
        Err(_) => {
            warn!(
                volume = %name,
                seconds = timing.probe.max_elapsed.as_secs_f64(),
                "Could not find volume after probing"
            );
            Err(Error::ResourceNotFound {
                kind: "volume".into(),
                name: name.to_string(),
            })
        }
    }
}
