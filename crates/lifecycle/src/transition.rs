//! Transition events published after a job state change has been written.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use assetflow_core::JobId;
use assetflow_events::Event;

use crate::job::{LifecycleStatus, MigrationState, ThumbnailState};

/// Which sub-lifecycle changed, and how.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum StageTransition {
    Lifecycle {
        from: LifecycleStatus,
        to: LifecycleStatus,
    },
    Migration {
        from: MigrationState,
        to: MigrationState,
    },
    Thumbnail {
        from: ThumbnailState,
        to: ThumbnailState,
    },
}

/// External worker a transition must be handed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerKind {
    Migration,
    Thumbnail,
}

impl WorkerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerKind::Migration => "migration",
            WorkerKind::Thumbnail => "thumbnail",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionEvent {
    pub job_id: JobId,
    pub transition: StageTransition,
    /// Best asset URL at the time of the write.
    pub asset_url: Option<String>,
    /// When that asset became available at its location (thumbnail settle delay).
    pub asset_available_at: Option<DateTime<Utc>>,
    /// Operator asked to redo a completed migration.
    pub force_remigrate: bool,
    pub occurred_at: DateTime<Utc>,
}

impl TransitionEvent {
    pub fn new(job_id: JobId, transition: StageTransition, occurred_at: DateTime<Utc>) -> Self {
        Self {
            job_id,
            transition,
            asset_url: None,
            asset_available_at: None,
            force_remigrate: false,
            occurred_at,
        }
    }

    pub fn with_asset(mut self, url: Option<&str>, available_at: Option<DateTime<Utc>>) -> Self {
        self.asset_url = url.map(str::to_string);
        self.asset_available_at = available_at;
        self
    }

    pub fn with_force_remigrate(mut self, force: bool) -> Self {
        self.force_remigrate = force;
        self
    }

    /// Entering `pending` (first time or retried) hands the job to a worker.
    pub fn dispatch_target(&self) -> Option<WorkerKind> {
        match self.transition {
            StageTransition::Migration {
                to: MigrationState::Pending,
                ..
            } => Some(WorkerKind::Migration),
            StageTransition::Thumbnail {
                to: ThumbnailState::Pending,
                ..
            } => Some(WorkerKind::Thumbnail),
            _ => None,
        }
    }
}

impl Event for TransitionEvent {
    fn event_type(&self) -> &'static str {
        match self.transition {
            StageTransition::Lifecycle { .. } => "job.lifecycle.changed",
            StageTransition::Migration { .. } => "job.migration.changed",
            StageTransition::Thumbnail { .. } => "job.thumbnail.changed",
        }
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_pending_entries_are_dispatched() {
        let id = JobId::new();
        let now = Utc::now();

        let retry = TransitionEvent::new(
            id,
            StageTransition::Migration {
                from: MigrationState::Failed,
                to: MigrationState::Pending,
            },
            now,
        );
        assert_eq!(retry.dispatch_target(), Some(WorkerKind::Migration));

        let claimed = TransitionEvent::new(
            id,
            StageTransition::Thumbnail {
                from: ThumbnailState::Pending,
                to: ThumbnailState::Processing,
            },
            now,
        );
        assert_eq!(claimed.dispatch_target(), None);
    }

    #[test]
    fn transition_serializes_with_stage_tag() {
        let ev = TransitionEvent::new(
            JobId::new(),
            StageTransition::Thumbnail {
                from: ThumbnailState::None,
                to: ThumbnailState::Pending,
            },
            Utc::now(),
        );
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["transition"]["stage"], "thumbnail");
        assert_eq!(json["transition"]["to"], "pending");
        assert_eq!(ev.event_type(), "job.thumbnail.changed");
    }
}
