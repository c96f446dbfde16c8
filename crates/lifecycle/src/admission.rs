//! Admission control: may a pending job start active processing now?
//!
//! Counts are supplied by the caller, aggregated from the job store at decision
//! time. No counter is maintained separately, so there is nothing to drift.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::{Job, LifecycleStatus, OwnerTier};

/// Per-tier ceilings on jobs simultaneously in `processing` for one owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierCeilings {
    pub free: u32,
    pub basic: u32,
    pub pro: u32,
    pub premium: u32,
}

impl Default for TierCeilings {
    fn default() -> Self {
        Self {
            free: 1,
            basic: 3,
            pro: 5,
            premium: 10,
        }
    }
}

impl TierCeilings {
    pub fn ceiling_for(&self, tier: OwnerTier) -> u32 {
        match tier {
            OwnerTier::Free => self.free,
            OwnerTier::Basic => self.basic,
            OwnerTier::Pro => self.pro,
            OwnerTier::Premium => self.premium,
        }
    }
}

/// Jobs currently in `processing`, for the job's owner and system-wide.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ActiveCounts {
    pub owner: u32,
    pub system: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionDecision {
    Admit,
    Queue,
}

/// What the store should write for a job that was run through the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionPlan {
    /// Not pending (already active or finished): nothing to do.
    NoOp,
    /// Move to `processing`, clear the queue position, stamp `started_at`.
    Admit,
    /// Leave pending and take the next queue position.
    Enqueue,
    /// Leave pending; the job already holds a queue position.
    StayQueued,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcurrencyGate {
    pub tiers: TierCeilings,
    pub system_ceiling: u32,
}

impl Default for ConcurrencyGate {
    fn default() -> Self {
        Self {
            tiers: TierCeilings::default(),
            system_ceiling: 20,
        }
    }
}

impl ConcurrencyGate {
    pub fn new(tiers: TierCeilings, system_ceiling: u32) -> Self {
        Self {
            tiers,
            system_ceiling,
        }
    }

    pub fn decide(&self, tier: OwnerTier, counts: ActiveCounts) -> AdmissionDecision {
        if counts.owner < self.tiers.ceiling_for(tier) && counts.system < self.system_ceiling {
            AdmissionDecision::Admit
        } else {
            AdmissionDecision::Queue
        }
    }

    /// Plan the write for `job`. Safe to call repeatedly: an already-active job is
    /// a no-op and an already-queued job keeps its position.
    pub fn plan(&self, job: &Job, counts: ActiveCounts) -> AdmissionPlan {
        if job.lifecycle_status != LifecycleStatus::Pending {
            return AdmissionPlan::NoOp;
        }
        match self.decide(job.owner_tier, counts) {
            AdmissionDecision::Admit => AdmissionPlan::Admit,
            AdmissionDecision::Queue if job.queue.position.is_some() => AdmissionPlan::StayQueued,
            AdmissionDecision::Queue => AdmissionPlan::Enqueue,
        }
    }
}

impl Job {
    /// Apply [`AdmissionPlan::Admit`].
    pub fn admit(&mut self, now: DateTime<Utc>) {
        self.lifecycle_status = LifecycleStatus::Processing;
        self.queue.position = None;
        self.queue.started_at = Some(now);
        self.updated_at = now;
    }

    /// Apply [`AdmissionPlan::Enqueue`] with a freshly allocated position.
    pub fn enqueue(&mut self, position: i64, now: DateTime<Utc>) {
        self.queue.position = Some(position);
        if self.queue.entered_at.is_none() {
            self.queue.entered_at = Some(now);
        }
        self.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::NewJob;
    use assetflow_core::{JobId, OwnerId};
    use proptest::prelude::*;

    fn pending_job(tier: OwnerTier) -> Job {
        Job::new(
            NewJob {
                id: JobId::new(),
                owner_id: OwnerId::new(),
                owner_tier: tier,
                transient_asset_url: None,
            },
            Utc::now(),
        )
    }

    #[test]
    fn admits_below_both_ceilings() {
        let gate = ConcurrencyGate::default();
        let counts = ActiveCounts { owner: 0, system: 0 };
        assert_eq!(gate.decide(OwnerTier::Free, counts), AdmissionDecision::Admit);
    }

    #[test]
    fn owner_ceiling_queues() {
        let gate = ConcurrencyGate::default();
        let counts = ActiveCounts { owner: 1, system: 1 };
        assert_eq!(gate.decide(OwnerTier::Free, counts), AdmissionDecision::Queue);
        assert_eq!(gate.decide(OwnerTier::Basic, counts), AdmissionDecision::Admit);
    }

    #[test]
    fn system_ceiling_queues_every_tier() {
        let gate = ConcurrencyGate::default();
        let counts = ActiveCounts { owner: 0, system: 20 };
        assert_eq!(gate.decide(OwnerTier::Premium, counts), AdmissionDecision::Queue);
    }

    #[test]
    fn replanning_an_active_job_is_a_no_op() {
        let gate = ConcurrencyGate::default();
        let mut job = pending_job(OwnerTier::Pro);
        job.admit(Utc::now());

        assert_eq!(gate.plan(&job, ActiveCounts::default()), AdmissionPlan::NoOp);
    }

    #[test]
    fn queued_job_keeps_its_position() {
        let gate = ConcurrencyGate::default();
        let mut job = pending_job(OwnerTier::Free);
        job.enqueue(1, Utc::now());

        let full = ActiveCounts { owner: 1, system: 1 };
        assert_eq!(gate.plan(&job, full), AdmissionPlan::StayQueued);
    }

    #[test]
    fn admitting_clears_position_and_stamps_start() {
        let mut job = pending_job(OwnerTier::Free);
        let entered = job.queue.entered_at;
        job.enqueue(3, Utc::now());

        let now = Utc::now();
        job.admit(now);

        assert_eq!(job.lifecycle_status, LifecycleStatus::Processing);
        assert_eq!(job.queue.position, None);
        assert_eq!(job.queue.started_at, Some(now));
        assert_eq!(job.queue.entered_at, entered);
        job.check_invariants().unwrap();
    }

    fn tier_strategy() -> impl Strategy<Value = OwnerTier> {
        prop_oneof![
            Just(OwnerTier::Free),
            Just(OwnerTier::Basic),
            Just(OwnerTier::Pro),
            Just(OwnerTier::Premium),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: admitting a stream of jobs one at a time through the gate never
        /// puts any owner above its tier ceiling nor the system above its ceiling.
        #[test]
        fn admission_never_exceeds_ceilings(
            arrivals in prop::collection::vec((0usize..4, tier_strategy()), 1..80)
        ) {
            let gate = ConcurrencyGate::default();
            let mut owners = vec![0u32; 4];
            let mut tiers = [OwnerTier::Free; 4];
            let mut system = 0u32;

            for (owner, tier) in arrivals {
                // An owner's tier is fixed by its first job.
                if owners[owner] == 0 {
                    tiers[owner] = tier;
                }
                let counts = ActiveCounts { owner: owners[owner], system };
                if gate.decide(tiers[owner], counts) == AdmissionDecision::Admit {
                    owners[owner] += 1;
                    system += 1;
                }
                prop_assert!(owners[owner] <= gate.tiers.ceiling_for(tiers[owner]));
                prop_assert!(system <= gate.system_ceiling);
            }
        }
    }
}
