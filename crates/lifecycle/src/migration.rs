//! Asset migration: `none -> pending -> downloading -> uploading -> completed`.
//!
//! `failed` is reachable from every active state; `failed -> pending` is the only
//! retry path and is gated by [`MigrationRetryPolicy`]. Every function here is a
//! pure transition on a [`MigrationRecord`]; the store applies the result with a
//! conditional write guarded by the record it started from.

use chrono::{DateTime, Duration, Utc};

use assetflow_core::{DomainError, DomainResult};

use crate::job::{Job, MAX_MIGRATION_ATTEMPTS, MigrationRecord, MigrationState};

/// Bounded retries with a stepped backoff table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationRetryPolicy {
    pub max_attempts: u32,
    /// `backoff[n - 1]` is the wait after the n-th failure; the last entry repeats.
    pub backoff: Vec<Duration>,
    /// Exhaust the attempt budget on errors that retrying cannot fix (e.g. the
    /// origin answered 404). Off by default: every failure costs one attempt.
    pub short_circuit_permanent: bool,
}

impl Default for MigrationRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_MIGRATION_ATTEMPTS,
            backoff: vec![Duration::minutes(2), Duration::minutes(5), Duration::minutes(10)],
            short_circuit_permanent: false,
        }
    }
}

impl MigrationRetryPolicy {
    /// Wait required after `attempts` failures before the next try.
    pub fn backoff_after(&self, attempts: u32) -> Duration {
        if attempts == 0 || self.backoff.is_empty() {
            return Duration::zero();
        }
        let idx = (attempts as usize - 1).min(self.backoff.len() - 1);
        self.backoff[idx]
    }

    /// When a failed record becomes eligible for automatic retry, if ever.
    pub fn retry_due_at(&self, record: &MigrationRecord) -> Option<DateTime<Utc>> {
        if record.state != MigrationState::Failed || record.attempts >= self.max_attempts {
            return None;
        }
        let since = record.last_attempt_at?;
        Some(since + self.backoff_after(record.attempts))
    }

    pub fn can_retry(&self, record: &MigrationRecord, now: DateTime<Utc>) -> bool {
        self.retry_due_at(record).is_some_and(|due| now >= due)
    }

    pub fn is_exhausted(&self, record: &MigrationRecord) -> bool {
        record.state == MigrationState::Failed && record.attempts >= self.max_attempts
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationStateMachine {
    policy: MigrationRetryPolicy,
}

impl MigrationStateMachine {
    pub fn new(policy: MigrationRetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &MigrationRetryPolicy {
        &self.policy
    }

    /// Entry condition (`none -> pending`), evaluated when the job's asset becomes
    /// eligible. Returns `None` when there is nothing to migrate: already armed or
    /// migrated, no asset yet, or the asset already lives under `durable_base_url`.
    pub fn arm(
        &self,
        job: &Job,
        durable_base_url: &str,
        now: DateTime<Utc>,
    ) -> Option<MigrationRecord> {
        if job.migration.state != MigrationState::None {
            return None;
        }
        let url = job.transient_asset_url.as_deref()?;
        if is_under(url, durable_base_url) {
            return None;
        }
        Some(MigrationRecord {
            state: MigrationState::Pending,
            last_attempt_at: Some(now),
            error: None,
            ..job.migration.clone()
        })
    }

    /// A worker claims the job and starts downloading (`pending -> downloading`).
    /// Each claim takes a fresh `claim_seq`.
    pub fn claim(&self, record: &MigrationRecord, now: DateTime<Utc>) -> DomainResult<MigrationRecord> {
        expect_state(record, MigrationState::Pending, MigrationState::Downloading)?;
        Ok(MigrationRecord {
            state: MigrationState::Downloading,
            claim_seq: record.claim_seq.wrapping_add(1),
            last_attempt_at: Some(now),
            ..record.clone()
        })
    }

    /// The full byte stream was retrieved (`downloading -> uploading`).
    pub fn downloaded(
        &self,
        record: &MigrationRecord,
        now: DateTime<Utc>,
    ) -> DomainResult<MigrationRecord> {
        expect_state(record, MigrationState::Downloading, MigrationState::Uploading)?;
        Ok(MigrationRecord {
            state: MigrationState::Uploading,
            last_attempt_at: Some(now),
            ..record.clone()
        })
    }

    /// The durable store accepted and serves the bytes (`uploading -> completed`).
    pub fn complete(
        &self,
        record: &MigrationRecord,
        durable_url: impl Into<String>,
        now: DateTime<Utc>,
    ) -> DomainResult<MigrationRecord> {
        expect_state(record, MigrationState::Uploading, MigrationState::Completed)?;
        Ok(MigrationRecord {
            state: MigrationState::Completed,
            last_attempt_at: Some(now),
            durable_asset_url: Some(durable_url.into()),
            completed_at: Some(now),
            error: None,
            attempts: record.attempts,
            claim_seq: record.claim_seq,
        })
    }

    /// Any active state fails (worker error or reclaimed timeout). Charges exactly
    /// one attempt, never past the cap.
    pub fn fail(
        &self,
        record: &MigrationRecord,
        error: impl Into<String>,
        permanent: bool,
        now: DateTime<Utc>,
    ) -> DomainResult<MigrationRecord> {
        if !record.state.is_active() {
            return Err(DomainError::illegal_transition(format!(
                "migration {} -> failed",
                record.state
            )));
        }
        let attempts = if permanent && self.policy.short_circuit_permanent {
            self.policy.max_attempts
        } else {
            (record.attempts + 1).min(self.policy.max_attempts)
        };
        Ok(MigrationRecord {
            state: MigrationState::Failed,
            attempts: attempts.max(record.attempts),
            claim_seq: record.claim_seq,
            last_attempt_at: Some(now),
            durable_asset_url: None,
            completed_at: None,
            error: Some(error.into()),
        })
    }

    /// Automatic retry (`failed -> pending`), allowed only below the cap and after
    /// the backoff for the current attempt count has elapsed.
    pub fn retry(&self, record: &MigrationRecord, now: DateTime<Utc>) -> DomainResult<MigrationRecord> {
        if record.state != MigrationState::Failed {
            return Err(DomainError::illegal_transition(format!(
                "migration {} -> pending (retry)",
                record.state
            )));
        }
        if !self.policy.can_retry(record, now) {
            return Err(DomainError::validation(format!(
                "migration retry not allowed yet (attempts {}, due {:?})",
                record.attempts,
                self.policy.retry_due_at(record)
            )));
        }
        Ok(MigrationRecord {
            state: MigrationState::Pending,
            last_attempt_at: Some(now),
            ..record.clone()
        })
    }

    /// Operator override: re-arm regardless of cap and backoff. A completed
    /// migration is only re-armed when `force_remigrate` is set.
    pub fn force_retry(
        &self,
        record: &MigrationRecord,
        force_remigrate: bool,
        now: DateTime<Utc>,
    ) -> DomainResult<MigrationRecord> {
        match record.state {
            MigrationState::None | MigrationState::Failed => {}
            MigrationState::Completed if force_remigrate => {}
            state => {
                return Err(DomainError::illegal_transition(format!(
                    "migration {state} cannot be force-retried"
                )));
            }
        }
        Ok(MigrationRecord {
            state: MigrationState::Pending,
            attempts: record.attempts,
            claim_seq: record.claim_seq,
            last_attempt_at: Some(now),
            durable_asset_url: None,
            completed_at: None,
            error: None,
        })
    }
}

/// `url` lives under `base` on a path boundary: `https://cdn/bucket` covers
/// `https://cdn/bucket/x.mp4` but not `https://cdn/bucket-tmp/x.mp4`.
fn is_under(url: &str, base: &str) -> bool {
    let base = base.trim_end_matches('/');
    if base.is_empty() {
        return false;
    }
    url.strip_prefix(base)
        .is_some_and(|rest| rest.starts_with('/'))
}

fn expect_state(
    record: &MigrationRecord,
    expected: MigrationState,
    to: MigrationState,
) -> DomainResult<()> {
    if record.state == expected {
        Ok(())
    } else {
        Err(DomainError::illegal_transition(format!(
            "migration {} -> {to}",
            record.state
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{NewJob, OwnerTier};
    use assetflow_core::{JobId, OwnerId};
    use proptest::prelude::*;

    const DURABLE: &str = "https://store.example/assets/";

    fn completed_job(url: &str) -> Job {
        let mut job = Job::new(
            NewJob {
                id: JobId::new(),
                owner_id: OwnerId::new(),
                owner_tier: OwnerTier::Pro,
                transient_asset_url: Some(url.to_string()),
            },
            Utc::now(),
        );
        job.lifecycle_status = crate::job::LifecycleStatus::Completed;
        job
    }

    fn failed_with(attempts: u32, at: DateTime<Utc>) -> MigrationRecord {
        MigrationRecord {
            state: MigrationState::Failed,
            attempts,
            last_attempt_at: Some(at),
            error: Some("boom".into()),
            ..MigrationRecord::default()
        }
    }

    #[test]
    fn happy_path_reaches_completed_with_durable_url() {
        let sm = MigrationStateMachine::default();
        let job = completed_job("https://origin.example/v.mp4");
        let now = Utc::now();

        let rec = sm.arm(&job, DURABLE, now).unwrap();
        let rec = sm.claim(&rec, now).unwrap();
        let rec = sm.downloaded(&rec, now).unwrap();
        let rec = sm.complete(&rec, "https://store.example/assets/x.mp4", now).unwrap();

        assert_eq!(rec.state, MigrationState::Completed);
        assert_eq!(rec.attempts, 0);
        assert_eq!(rec.durable_asset_url.as_deref(), Some("https://store.example/assets/x.mp4"));
    }

    #[test]
    fn asset_already_durable_is_not_armed() {
        let sm = MigrationStateMachine::default();
        let job = completed_job("https://store.example/assets/already.mp4");
        assert!(sm.arm(&job, DURABLE, Utc::now()).is_none());
    }

    #[test]
    fn durable_prefix_must_end_on_a_path_boundary() {
        let sm = MigrationStateMachine::default();
        let sibling = completed_job("https://cdn.example/bucket-tmp/x.mp4");
        assert!(sm.arm(&sibling, "https://cdn.example/bucket", Utc::now()).is_some());

        let inside = completed_job("https://cdn.example/bucket/x.mp4");
        assert!(sm.arm(&inside, "https://cdn.example/bucket", Utc::now()).is_none());
        assert!(sm.arm(&inside, "https://cdn.example/bucket/", Utc::now()).is_none());
    }

    #[test]
    fn every_claim_takes_a_fresh_guard_even_past_the_cap() {
        let sm = MigrationStateMachine::default();
        let now = Utc::now();
        let exhausted = failed_with(MAX_MIGRATION_ATTEMPTS, now);

        let first = sm.claim(&sm.force_retry(&exhausted, false, now).unwrap(), now).unwrap();
        let reclaimed = sm.fail(&first, "no progress", false, now).unwrap();
        assert_eq!(reclaimed.attempts, MAX_MIGRATION_ATTEMPTS);

        let second = sm.claim(&sm.force_retry(&reclaimed, false, now).unwrap(), now).unwrap();
        assert_eq!(first.state, second.state);
        assert_eq!(first.attempts, second.attempts);
        assert_ne!(first.guard(), second.guard());
    }

    #[test]
    fn arming_twice_is_a_no_op() {
        let sm = MigrationStateMachine::default();
        let mut job = completed_job("https://origin.example/v.mp4");
        job.migration = sm.arm(&job, DURABLE, Utc::now()).unwrap();
        assert!(sm.arm(&job, DURABLE, Utc::now()).is_none());
    }

    #[test]
    fn partial_progress_cannot_skip_states() {
        let sm = MigrationStateMachine::default();
        let job = completed_job("https://origin.example/v.mp4");
        let rec = sm.arm(&job, DURABLE, Utc::now()).unwrap();

        assert!(sm.downloaded(&rec, Utc::now()).is_err());
        assert!(sm.complete(&rec, "x", Utc::now()).is_err());
    }

    #[test]
    fn failure_charges_one_attempt_and_clears_durable_url() {
        let sm = MigrationStateMachine::default();
        let rec = MigrationRecord {
            state: MigrationState::Uploading,
            attempts: 1,
            ..MigrationRecord::default()
        };
        let failed = sm.fail(&rec, "503 from destination", false, Utc::now()).unwrap();
        assert_eq!(failed.state, MigrationState::Failed);
        assert_eq!(failed.attempts, 2);
        assert_eq!(failed.durable_asset_url, None);
    }

    #[test]
    fn failing_a_finished_record_is_rejected() {
        let sm = MigrationStateMachine::default();
        let rec = failed_with(1, Utc::now());
        assert!(sm.fail(&rec, "again", false, Utc::now()).is_err());
    }

    #[test]
    fn backoff_schedule_is_two_five_ten_minutes() {
        let policy = MigrationRetryPolicy::default();
        assert_eq!(policy.backoff_after(1), Duration::minutes(2));
        assert_eq!(policy.backoff_after(2), Duration::minutes(5));
        assert_eq!(policy.backoff_after(3), Duration::minutes(10));
        assert_eq!(policy.backoff_after(7), Duration::minutes(10));
    }

    #[test]
    fn retry_waits_for_backoff() {
        let sm = MigrationStateMachine::default();
        let failed_at = Utc::now();
        let rec = failed_with(1, failed_at);

        assert!(sm.retry(&rec, failed_at + Duration::seconds(119)).is_err());
        let retried = sm.retry(&rec, failed_at + Duration::minutes(2)).unwrap();
        assert_eq!(retried.state, MigrationState::Pending);
        assert_eq!(retried.attempts, 1);
    }

    #[test]
    fn exhausted_record_never_retries_automatically() {
        let sm = MigrationStateMachine::default();
        let failed_at = Utc::now();
        let rec = failed_with(MAX_MIGRATION_ATTEMPTS, failed_at);

        assert!(sm.policy().is_exhausted(&rec));
        assert_eq!(sm.policy().retry_due_at(&rec), None);
        assert!(sm.retry(&rec, failed_at + Duration::days(30)).is_err());
    }

    #[test]
    fn force_retry_ignores_cap_and_backoff() {
        let sm = MigrationStateMachine::default();
        let now = Utc::now();
        let rec = failed_with(MAX_MIGRATION_ATTEMPTS, now);

        let armed = sm.force_retry(&rec, false, now).unwrap();
        assert_eq!(armed.state, MigrationState::Pending);
        assert_eq!(armed.attempts, MAX_MIGRATION_ATTEMPTS);
    }

    #[test]
    fn force_remigrate_resets_completed_migration() {
        let sm = MigrationStateMachine::default();
        let rec = MigrationRecord {
            state: MigrationState::Completed,
            durable_asset_url: Some("https://store.example/assets/x.mp4".into()),
            completed_at: Some(Utc::now()),
            ..MigrationRecord::default()
        };
        assert!(sm.force_retry(&rec, false, Utc::now()).is_err());

        let armed = sm.force_retry(&rec, true, Utc::now()).unwrap();
        assert_eq!(armed.state, MigrationState::Pending);
        assert_eq!(armed.durable_asset_url, None);
    }

    #[test]
    fn permanent_errors_short_circuit_only_when_enabled() {
        let rec = MigrationRecord {
            state: MigrationState::Downloading,
            ..MigrationRecord::default()
        };

        let default = MigrationStateMachine::default();
        assert_eq!(default.fail(&rec, "404", true, Utc::now()).unwrap().attempts, 1);

        let strict = MigrationStateMachine::new(MigrationRetryPolicy {
            short_circuit_permanent: true,
            ..MigrationRetryPolicy::default()
        });
        let failed = strict.fail(&rec, "404", true, Utc::now()).unwrap();
        assert!(strict.policy().is_exhausted(&failed));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Claim,
        Downloaded,
        Complete,
        Fail,
        Retry,
        Force,
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            Just(Op::Claim),
            Just(Op::Downloaded),
            Just(Op::Complete),
            Just(Op::Fail),
            Just(Op::Retry),
            Just(Op::Force),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: whatever sequence of transitions is attempted, the attempt
        /// counter never decreases and never exceeds the cap, and the durable URL is
        /// present exactly when the migration is completed.
        #[test]
        fn attempts_are_monotonic_and_capped(ops in prop::collection::vec(op_strategy(), 1..60)) {
            let sm = MigrationStateMachine::default();
            let mut now = Utc::now();
            let mut rec = MigrationRecord {
                state: MigrationState::Pending,
                last_attempt_at: Some(now),
                ..MigrationRecord::default()
            };

            for op in ops {
                now += Duration::minutes(11);
                let next = match op {
                    Op::Claim => sm.claim(&rec, now),
                    Op::Downloaded => sm.downloaded(&rec, now),
                    Op::Complete => sm.complete(&rec, "https://store.example/assets/x", now),
                    Op::Fail => sm.fail(&rec, "err", false, now),
                    Op::Retry => sm.retry(&rec, now),
                    Op::Force => sm.force_retry(&rec, false, now),
                };
                if let Ok(next) = next {
                    prop_assert!(next.attempts >= rec.attempts);
                    prop_assert!(next.claim_seq >= rec.claim_seq);
                    prop_assert!(next.attempts <= MAX_MIGRATION_ATTEMPTS);
                    prop_assert_eq!(
                        next.state == MigrationState::Completed,
                        next.durable_asset_url.is_some()
                    );
                    rec = next;
                }
            }
        }
    }
}
