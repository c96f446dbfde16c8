//! Turns `-> pending` transitions into fire-and-forget worker calls.
//!
//! The dispatcher runs on its own thread, fed by a bus subscription, and hands
//! every call to the async runtime without waiting for it. Whatever happens to
//! the call, the write that produced the transition stands. A call that could
//! not be delivered leaves a `dispatch_error` diagnostic on the job; the
//! reclaimer re-publishes those transitions on its next sweep without charging
//! an attempt.

mod invoker;

pub use invoker::{DispatchError, HttpWorkerInvoker, WorkerCall, WorkerInvoker};

use std::sync::Arc;
use std::sync::mpsc::{RecvTimeoutError, TryRecvError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use assetflow_events::{EventBus, Subscription};
use assetflow_lifecycle::{Job, MigrationState, ThumbnailState, TransitionEvent, WorkerKind};

use crate::background::WorkerHandle;
use crate::store::JobStore;
use crate::workers::{MigrationRequest, ThumbnailRequest};

pub struct Dispatcher<S: ?Sized> {
    store: Arc<S>,
    invoker: Arc<dyn WorkerInvoker>,
}

impl<S> Dispatcher<S>
where
    S: JobStore + ?Sized + 'static,
{
    pub fn new(store: Arc<S>, invoker: Arc<dyn WorkerInvoker>) -> Self {
        Self { store, invoker }
    }

    /// Build the call for `event` from the current row. `None` when the event
    /// targets no worker, or the stage is no longer pending (stale event).
    pub async fn prepare(
        &self,
        event: &TransitionEvent,
        now: DateTime<Utc>,
    ) -> Result<Option<WorkerCall>, DispatchError> {
        let Some(kind) = event.dispatch_target() else {
            return Ok(None);
        };
        let Some(job) = self.store.get(event.job_id).await? else {
            warn!(job_id = %event.job_id, "transition for unknown job");
            return Ok(None);
        };
        Ok(match kind {
            WorkerKind::Migration => migration_call(&job, event),
            WorkerKind::Thumbnail => thumbnail_call(&job, now),
        })
    }

    /// Deliver the call for one event. Delivery failures are recorded on the job.
    pub async fn dispatch(&self, event: TransitionEvent) -> Result<Option<WorkerKind>, DispatchError> {
        let now = Utc::now();
        let Some(call) = self.prepare(&event, now).await? else {
            debug!(job_id = %event.job_id, "nothing to dispatch");
            return Ok(None);
        };
        let kind = call.kind();

        match self.invoker.invoke(&call).await {
            Ok(()) => {
                info!(job_id = %call.job_id(), worker = kind.as_str(), "worker invoked");
                Ok(Some(kind))
            }
            Err(err) => {
                warn!(job_id = %call.job_id(), worker = kind.as_str(), error = %err, "worker dispatch failed");
                let diagnostic = format!("{} dispatch failed: {err}", kind.as_str());
                if let Err(store_err) = self
                    .store
                    .set_dispatch_error(call.job_id(), Some(diagnostic), now)
                    .await
                {
                    warn!(job_id = %call.job_id(), error = %store_err, "could not record dispatch diagnostic");
                }
                Err(err)
            }
        }
    }

    /// Subscribe to `bus` and dispatch on a background thread, spawning each
    /// call onto `runtime`.
    pub fn spawn<B>(self: Arc<Self>, bus: &B, runtime: Handle) -> std::io::Result<WorkerHandle>
    where
        B: EventBus<TransitionEvent>,
    {
        let subscription = bus.subscribe();
        WorkerHandle::spawn("assetflow-dispatcher", move |shutdown_rx| {
            let tick = Duration::from_millis(250);
            loop {
                match shutdown_rx.try_recv() {
                    Ok(()) | Err(TryRecvError::Disconnected) => break,
                    Err(TryRecvError::Empty) => {}
                }
                match subscription.recv_timeout(tick) {
                    Ok(event) => self.spawn_call(event, &runtime),
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        })
    }

    fn spawn_call(self: &Arc<Self>, event: TransitionEvent, runtime: &Handle) {
        if event.dispatch_target().is_none() {
            return;
        }
        let dispatcher = Arc::clone(self);
        runtime.spawn(async move {
            // Failures are already logged and recorded on the job.
            let _ = dispatcher.dispatch(event).await;
        });
    }

    /// Dispatch everything buffered on `subscription` and wait for the calls.
    /// Used where a thread per dispatcher is unwanted (tests, one-shot tools).
    pub async fn drain(&self, subscription: &Subscription<TransitionEvent>) -> usize {
        let mut delivered = 0;
        for event in subscription.drain() {
            if let Ok(Some(_)) = self.dispatch(event).await {
                delivered += 1;
            }
        }
        delivered
    }
}

/// Only `pending` migrations are dispatched, so any operator reset has already
/// been written. The call never asks for a forced re-run: one arriving after the
/// reset migration completed would otherwise redo it.
fn migration_call(job: &Job, event: &TransitionEvent) -> Option<WorkerCall> {
    if job.migration.state != MigrationState::Pending {
        return None;
    }
    let asset_url = job
        .transient_asset_url
        .clone()
        .or_else(|| event.asset_url.clone())?;
    Some(WorkerCall::Migration(MigrationRequest {
        job_id: job.id,
        asset_url,
        force_remigrate: false,
    }))
}

fn thumbnail_call(job: &Job, now: DateTime<Utc>) -> Option<WorkerCall> {
    if job.thumbnail.state != ThumbnailState::Pending {
        return None;
    }
    let asset_url = job.current_asset_url()?.to_string();
    let migration_completed_at = job.migration.completed_at;
    Some(WorkerCall::Thumbnail(ThumbnailRequest {
        job_id: job.id,
        asset_url,
        migration_completed_at,
        time_since_migration_seconds: migration_completed_at.map(|at| (now - at).num_seconds()),
        asset_available_at: Some(job.asset_available_at()),
    }))
}
