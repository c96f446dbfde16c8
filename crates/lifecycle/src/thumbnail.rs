//! Thumbnail derivation: `none -> pending -> processing -> completed`, with
//! `failed` reachable from `pending`/`processing`.
//!
//! Entry is OR-combined: the job's lifecycle reaching `completed` (transient asset)
//! and the migration reaching `completed` (durable asset) each try to arm it, and
//! [`ThumbnailStateMachine::is_eligible`] makes the second trigger a no-op. Nothing
//! here depends on the migration outcome.

use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};

use assetflow_core::{DomainError, DomainResult};

use crate::job::{MAX_THUMBNAIL_ATTEMPTS, PLACEHOLDER_THUMBNAIL_URL, ThumbnailRecord, ThumbnailState};

/// Offsets from the first try at which a single worker invocation attempts the
/// transform. `[0s, 30s, 120s]` means: now, 30s after the first try, and 120s
/// after the first try.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrySchedule {
    offsets: Vec<StdDuration>,
}

impl RetrySchedule {
    /// Offsets are sorted; an empty schedule still makes one immediate try.
    pub fn new(mut offsets: Vec<StdDuration>) -> Self {
        if offsets.is_empty() {
            offsets.push(StdDuration::ZERO);
        }
        offsets.sort();
        Self { offsets }
    }

    pub fn offsets(&self) -> &[StdDuration] {
        &self.offsets
    }

    pub fn tries(&self) -> usize {
        self.offsets.len()
    }

    /// How long to sleep before try `index`, given how long the invocation has
    /// already spent since its first try.
    pub fn wait_before(&self, index: usize, elapsed: StdDuration) -> StdDuration {
        self.offsets
            .get(index)
            .map(|offset| offset.saturating_sub(elapsed))
            .unwrap_or(StdDuration::ZERO)
    }
}

impl Default for RetrySchedule {
    fn default() -> Self {
        Self::new(vec![
            StdDuration::ZERO,
            StdDuration::from_secs(30),
            StdDuration::from_secs(120),
        ])
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThumbnailRetryPolicy {
    pub max_attempts: u32,
    /// Minimum wait between a failed attempt and the sweep re-arming it.
    pub cooldown: Duration,
    /// Invocations arriving within this window of the asset becoming available
    /// first wait `settle_delay`.
    pub grace_window: StdDuration,
    pub settle_delay: StdDuration,
    pub schedule: RetrySchedule,
}

impl Default for ThumbnailRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_THUMBNAIL_ATTEMPTS,
            cooldown: Duration::minutes(2),
            grace_window: StdDuration::from_secs(10),
            settle_delay: StdDuration::from_secs(5),
            schedule: RetrySchedule::default(),
        }
    }
}

impl ThumbnailRetryPolicy {
    /// Delay before the first transform try: the settle delay when the asset
    /// only just became available, zero otherwise (or when unknown).
    pub fn settle_delay_for(
        &self,
        asset_available_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> StdDuration {
        let Some(available_at) = asset_available_at else {
            return StdDuration::ZERO;
        };
        match (now - available_at).to_std() {
            Ok(since) if since < self.grace_window => self.settle_delay,
            // A timestamp in the future counts as "just became available".
            Err(_) => self.settle_delay,
            Ok(_) => StdDuration::ZERO,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThumbnailStateMachine {
    policy: ThumbnailRetryPolicy,
}

impl ThumbnailStateMachine {
    pub fn new(policy: ThumbnailRetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &ThumbnailRetryPolicy {
        &self.policy
    }

    /// Never generated, or the reference is the placeholder left by a failure,
    /// and attempts remain.
    pub fn is_eligible(&self, record: &ThumbnailRecord) -> bool {
        let fresh = record.state == ThumbnailState::None;
        let regenerable = record.is_placeholder() && !record.state.is_active();
        (fresh || regenerable) && record.attempts < self.policy.max_attempts
    }

    /// Try to arm derivation (`-> pending`). `None` when not eligible, which is
    /// how the second of the two entry triggers becomes a no-op.
    pub fn arm(&self, record: &ThumbnailRecord, now: DateTime<Utc>) -> Option<ThumbnailRecord> {
        if !self.is_eligible(record) {
            return None;
        }
        Some(ThumbnailRecord {
            state: ThumbnailState::Pending,
            last_attempt_at: Some(now),
            error: None,
            ..record.clone()
        })
    }

    /// Whether the periodic sweep should re-arm a failed record now.
    pub fn retry_due(&self, record: &ThumbnailRecord, now: DateTime<Utc>) -> bool {
        record.state == ThumbnailState::Failed
            && self.is_eligible(record)
            && record
                .last_attempt_at
                .is_none_or(|at| now >= at + self.policy.cooldown)
    }

    pub fn claim(&self, record: &ThumbnailRecord, now: DateTime<Utc>) -> DomainResult<ThumbnailRecord> {
        if record.state != ThumbnailState::Pending {
            return Err(DomainError::illegal_transition(format!(
                "thumbnail {} -> processing",
                record.state
            )));
        }
        Ok(ThumbnailRecord {
            state: ThumbnailState::Processing,
            claim_seq: record.claim_seq.wrapping_add(1),
            last_attempt_at: Some(now),
            ..record.clone()
        })
    }

    /// The derived asset is durably stored (`processing -> completed`).
    pub fn complete(
        &self,
        record: &ThumbnailRecord,
        url: impl Into<String>,
        now: DateTime<Utc>,
    ) -> DomainResult<ThumbnailRecord> {
        if record.state != ThumbnailState::Processing {
            return Err(DomainError::illegal_transition(format!(
                "thumbnail {} -> completed",
                record.state
            )));
        }
        Ok(ThumbnailRecord {
            state: ThumbnailState::Completed,
            attempts: record.attempts,
            claim_seq: record.claim_seq,
            last_attempt_at: Some(now),
            url: Some(url.into()),
            generated_at: Some(now),
            error: None,
        })
    }

    /// Transform error, unreachable source or timeout. Charges one attempt and
    /// leaves the placeholder so consumers show "processing".
    pub fn fail(
        &self,
        record: &ThumbnailRecord,
        error: impl Into<String>,
        now: DateTime<Utc>,
    ) -> DomainResult<ThumbnailRecord> {
        if !record.state.is_active() {
            return Err(DomainError::illegal_transition(format!(
                "thumbnail {} -> failed",
                record.state
            )));
        }
        Ok(ThumbnailRecord {
            state: ThumbnailState::Failed,
            attempts: (record.attempts + 1).min(self.policy.max_attempts).max(record.attempts),
            claim_seq: record.claim_seq,
            last_attempt_at: Some(now),
            url: Some(PLACEHOLDER_THUMBNAIL_URL.to_string()),
            generated_at: record.generated_at,
            error: Some(error.into()),
        })
    }

    /// Operator override: re-arm from any settled state, ignoring the cap.
    pub fn force_retry(&self, record: &ThumbnailRecord, now: DateTime<Utc>) -> DomainResult<ThumbnailRecord> {
        if record.state.is_active() {
            return Err(DomainError::illegal_transition(format!(
                "thumbnail {} cannot be force-retried",
                record.state
            )));
        }
        Ok(ThumbnailRecord {
            state: ThumbnailState::Pending,
            last_attempt_at: Some(now),
            error: None,
            ..record.clone()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed(attempts: u32, at: DateTime<Utc>) -> ThumbnailRecord {
        ThumbnailRecord {
            state: ThumbnailState::Failed,
            attempts,
            last_attempt_at: Some(at),
            url: Some(PLACEHOLDER_THUMBNAIL_URL.into()),
            ..ThumbnailRecord::default()
        }
    }

    #[test]
    fn fresh_record_arms_once() {
        let sm = ThumbnailStateMachine::default();
        let armed = sm.arm(&ThumbnailRecord::default(), Utc::now()).unwrap();
        assert_eq!(armed.state, ThumbnailState::Pending);
        assert!(sm.arm(&armed, Utc::now()).is_none());
    }

    #[test]
    fn completed_thumbnail_is_not_regenerated() {
        let sm = ThumbnailStateMachine::default();
        let done = ThumbnailRecord {
            state: ThumbnailState::Completed,
            url: Some("https://store.example/thumbs/x.jpg".into()),
            ..ThumbnailRecord::default()
        };
        assert!(!sm.is_eligible(&done));
    }

    #[test]
    fn placeholder_is_regenerable_until_attempts_run_out() {
        let sm = ThumbnailStateMachine::default();
        assert!(sm.is_eligible(&failed(2, Utc::now())));
        assert!(!sm.is_eligible(&failed(MAX_THUMBNAIL_ATTEMPTS, Utc::now())));
    }

    #[test]
    fn failure_writes_placeholder_and_charges_attempt() {
        let sm = ThumbnailStateMachine::default();
        let now = Utc::now();
        let rec = sm.claim(&sm.arm(&ThumbnailRecord::default(), now).unwrap(), now).unwrap();

        let rec = sm.fail(&rec, "transform 502", now).unwrap();
        assert_eq!(rec.state, ThumbnailState::Failed);
        assert_eq!(rec.attempts, 1);
        assert!(rec.is_placeholder());
    }

    #[test]
    fn forced_rerun_past_the_cap_gets_a_new_claim() {
        let sm = ThumbnailStateMachine::default();
        let now = Utc::now();
        let exhausted = failed(MAX_THUMBNAIL_ATTEMPTS, now);

        let first = sm.claim(&sm.force_retry(&exhausted, now).unwrap(), now).unwrap();
        let reclaimed = sm.fail(&first, "timeout", now).unwrap();
        let second = sm.claim(&sm.force_retry(&reclaimed, now).unwrap(), now).unwrap();

        assert_eq!(second.attempts, MAX_THUMBNAIL_ATTEMPTS);
        assert_ne!(first.guard(), second.guard());
    }

    #[test]
    fn completion_stamps_generation_time() {
        let sm = ThumbnailStateMachine::default();
        let now = Utc::now();
        let rec = sm.claim(&sm.arm(&ThumbnailRecord::default(), now).unwrap(), now).unwrap();
        let rec = sm.complete(&rec, "https://store.example/thumbs/x.jpg", now).unwrap();

        assert_eq!(rec.generated_at, Some(now));
        assert!(!rec.is_placeholder());
    }

    #[test]
    fn sweep_waits_for_cooldown() {
        let sm = ThumbnailStateMachine::default();
        let at = Utc::now();
        let rec = failed(1, at);
        assert!(!sm.retry_due(&rec, at + Duration::seconds(30)));
        assert!(sm.retry_due(&rec, at + Duration::minutes(2)));
    }

    #[test]
    fn settle_delay_applies_only_inside_grace_window() {
        let policy = ThumbnailRetryPolicy::default();
        let now = Utc::now();

        assert_eq!(
            policy.settle_delay_for(Some(now - Duration::seconds(3)), now),
            policy.settle_delay
        );
        assert_eq!(
            policy.settle_delay_for(Some(now - Duration::seconds(60)), now),
            StdDuration::ZERO
        );
        assert_eq!(policy.settle_delay_for(None, now), StdDuration::ZERO);
    }

    #[test]
    fn schedule_offsets_are_measured_from_first_try() {
        let schedule = RetrySchedule::default();
        assert_eq!(schedule.tries(), 3);
        assert_eq!(schedule.wait_before(0, StdDuration::ZERO), StdDuration::ZERO);
        assert_eq!(
            schedule.wait_before(1, StdDuration::from_secs(4)),
            StdDuration::from_secs(26)
        );
        assert_eq!(
            schedule.wait_before(2, StdDuration::from_secs(200)),
            StdDuration::ZERO
        );
    }

    #[test]
    fn empty_schedule_still_tries_once() {
        assert_eq!(RetrySchedule::new(Vec::new()).tries(), 1);
    }
}
