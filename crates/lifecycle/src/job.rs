//! The persisted job record: one row per video asset lifecycle.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use assetflow_core::{DomainError, DomainResult, JobId, OwnerId};

/// Migration is terminally failed once this many attempts have failed.
pub const MAX_MIGRATION_ATTEMPTS: u32 = 3;

/// Thumbnail derivation is terminally failed once this many attempts have failed.
pub const MAX_THUMBNAIL_ATTEMPTS: u32 = 3;

/// Derived-asset reference written when derivation failed. Consumers render it as
/// "processing"; it also marks the thumbnail as eligible for regeneration.
pub const PLACEHOLDER_THUMBNAIL_URL: &str = "placeholder:thumbnail";

macro_rules! string_enum {
    ($t:ident, $kind:literal, { $($variant:ident => $s:literal),+ $(,)? }) => {
        impl $t {
            pub const ALL: &'static [$t] = &[$($t::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($t::$variant => $s),+
                }
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl core::str::FromStr for $t {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($s => Ok($t::$variant),)+
                    other => Err(DomainError::unknown_variant($kind, other)),
                }
            }
        }
    };
}

/// Service tier of the job's owner; selects the per-owner concurrency ceiling.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OwnerTier {
    Free,
    Basic,
    Pro,
    Premium,
}

string_enum!(OwnerTier, "owner tier", {
    Free => "free",
    Basic => "basic",
    Pro => "pro",
    Premium => "premium",
});

/// Overarching generation status, owned by the external producer.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

string_enum!(LifecycleStatus, "lifecycle status", {
    Pending => "pending",
    Processing => "processing",
    Completed => "completed",
    Failed => "failed",
});

impl LifecycleStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, LifecycleStatus::Completed | LifecycleStatus::Failed)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationState {
    None,
    Pending,
    Downloading,
    Uploading,
    Completed,
    Failed,
}

string_enum!(MigrationState, "migration state", {
    None => "none",
    Pending => "pending",
    Downloading => "downloading",
    Uploading => "uploading",
    Completed => "completed",
    Failed => "failed",
});

impl MigrationState {
    /// Pending, downloading or uploading: someone is expected to make progress.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            MigrationState::Pending | MigrationState::Downloading | MigrationState::Uploading
        )
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThumbnailState {
    None,
    Pending,
    Processing,
    Completed,
    Failed,
}

string_enum!(ThumbnailState, "thumbnail state", {
    None => "none",
    Pending => "pending",
    Processing => "processing",
    Completed => "completed",
    Failed => "failed",
});

impl ThumbnailState {
    pub fn is_active(&self) -> bool {
        matches!(self, ThumbnailState::Pending | ThumbnailState::Processing)
    }
}

/// Compare-and-swap guard for one sub-lifecycle.
///
/// A conditional write only applies when the row still holds the expected state,
/// attempt count and claim sequence. Every claim bumps `claim_seq` (attempts stop
/// at the cap, claims do not), so a worker that was reclaimed and then re-armed
/// cannot resurrect its stale claim, even after an operator override.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageGuard<S> {
    pub state: S,
    pub attempts: u32,
    pub claim_seq: u32,
}

/// Asset-migration sub-lifecycle columns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationRecord {
    pub state: MigrationState,
    pub attempts: u32,
    /// Number of worker claims so far.
    #[serde(default)]
    pub claim_seq: u32,
    /// Stamped on every transition; drives backoff and stuck detection.
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Non-null iff `state == Completed`.
    pub durable_asset_url: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl MigrationRecord {
    pub fn guard(&self) -> StageGuard<MigrationState> {
        StageGuard {
            state: self.state,
            attempts: self.attempts,
            claim_seq: self.claim_seq,
        }
    }
}

impl Default for MigrationRecord {
    fn default() -> Self {
        Self {
            state: MigrationState::None,
            attempts: 0,
            claim_seq: 0,
            last_attempt_at: None,
            durable_asset_url: None,
            completed_at: None,
            error: None,
        }
    }
}

/// Thumbnail-derivation sub-lifecycle columns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThumbnailRecord {
    pub state: ThumbnailState,
    pub attempts: u32,
    #[serde(default)]
    pub claim_seq: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Derived-asset reference; [`PLACEHOLDER_THUMBNAIL_URL`] after a failure.
    pub url: Option<String>,
    pub generated_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl ThumbnailRecord {
    pub fn guard(&self) -> StageGuard<ThumbnailState> {
        StageGuard {
            state: self.state,
            attempts: self.attempts,
            claim_seq: self.claim_seq,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.url.as_deref() == Some(PLACEHOLDER_THUMBNAIL_URL)
    }
}

impl Default for ThumbnailRecord {
    fn default() -> Self {
        Self {
            state: ThumbnailState::None,
            attempts: 0,
            claim_seq: 0,
            last_attempt_at: None,
            url: None,
            generated_at: None,
            error: None,
        }
    }
}

/// Admission-queue columns.
///
/// `entered_at` and `started_at` bracket the wait: timeouts that concern processing
/// must measure from `started_at`, never from `entered_at`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueRecord {
    pub position: Option<i64>,
    pub entered_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
}

impl QueueRecord {
    /// How long the job waited before admission (None while still waiting).
    pub fn wait_time(&self) -> Option<Duration> {
        match (self.entered_at, self.started_at) {
            (Some(entered), Some(started)) => Some(started - entered),
            _ => None,
        }
    }
}

/// Producer input for a new job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewJob {
    pub id: JobId,
    pub owner_id: OwnerId,
    pub owner_tier: OwnerTier,
    pub transient_asset_url: Option<String>,
}

/// One video asset tracked through admission, migration and thumbnail derivation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub owner_id: OwnerId,
    pub owner_tier: OwnerTier,
    pub lifecycle_status: LifecycleStatus,
    /// Set once, immutable thereafter.
    pub transient_asset_url: Option<String>,
    pub migration: MigrationRecord,
    pub thumbnail: ThumbnailRecord,
    pub queue: QueueRecord,
    /// Last outbound-dispatch diagnostic (configuration or transport problem).
    pub dispatch_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(new: NewJob, now: DateTime<Utc>) -> Self {
        Self {
            id: new.id,
            owner_id: new.owner_id,
            owner_tier: new.owner_tier,
            lifecycle_status: LifecycleStatus::Pending,
            transient_asset_url: new.transient_asset_url,
            migration: MigrationRecord::default(),
            thumbnail: ThumbnailRecord::default(),
            queue: QueueRecord {
                position: None,
                entered_at: Some(now),
                started_at: None,
            },
            dispatch_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn durable_asset_url(&self) -> Option<&str> {
        self.migration.durable_asset_url.as_deref()
    }

    /// Canonical asset URL for downstream consumers: durable once migrated,
    /// transient before that.
    pub fn current_asset_url(&self) -> Option<&str> {
        self.durable_asset_url()
            .or(self.transient_asset_url.as_deref())
    }

    /// When the current asset became available at its location (for the
    /// thumbnail worker's settle delay).
    pub fn asset_available_at(&self) -> DateTime<Utc> {
        self.migration.completed_at.unwrap_or(self.updated_at)
    }

    /// Set the transient URL. Writing the same value again is a no-op; writing a
    /// different value once set is rejected.
    pub fn set_transient_asset_url(&mut self, url: &str) -> DomainResult<bool> {
        match self.transient_asset_url.as_deref() {
            Some(existing) if existing == url => Ok(false),
            Some(existing) => Err(DomainError::invariant(format!(
                "transient asset url is immutable (have {existing}, got {url})"
            ))),
            None => {
                self.transient_asset_url = Some(url.to_string());
                Ok(true)
            }
        }
    }

    /// Apply a producer-driven lifecycle transition.
    ///
    /// Returns `Ok(false)` when the job is already in `next` (idempotent replay).
    /// `Pending -> Processing` is reserved for admission and is rejected here.
    pub fn apply_lifecycle_status(
        &mut self,
        next: LifecycleStatus,
        now: DateTime<Utc>,
    ) -> DomainResult<bool> {
        use LifecycleStatus::*;

        if self.lifecycle_status == next {
            return Ok(false);
        }

        match (self.lifecycle_status, next) {
            (Pending, Failed) => {
                self.queue.position = None;
            }
            (Processing, Completed) | (Processing, Failed) => {}
            (from, to) => {
                return Err(DomainError::illegal_transition(format!(
                    "lifecycle {from} -> {to}"
                )));
            }
        }

        self.lifecycle_status = next;
        self.updated_at = now;
        Ok(true)
    }

    /// Validate the cross-field invariants of the record.
    pub fn check_invariants(&self) -> DomainResult<()> {
        let migrated = self.migration.state == MigrationState::Completed;
        if migrated != self.migration.durable_asset_url.is_some() {
            return Err(DomainError::invariant(format!(
                "durable asset url must be set iff migration completed (state {})",
                self.migration.state
            )));
        }
        if self.migration.attempts > MAX_MIGRATION_ATTEMPTS {
            return Err(DomainError::invariant("migration attempts above cap"));
        }
        if self.thumbnail.attempts > MAX_THUMBNAIL_ATTEMPTS {
            return Err(DomainError::invariant("thumbnail attempts above cap"));
        }
        if self.queue.position.is_some() && self.lifecycle_status != LifecycleStatus::Pending {
            return Err(DomainError::invariant(
                "queue position is only held while pending",
            ));
        }
        Ok(())
    }
}
