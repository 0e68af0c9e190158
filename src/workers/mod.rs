//! Worker fleet: consumes the queue lanes and drives activities through
//! claim -> work -> terminal transition -> barrier.

pub mod blend;
pub mod merge;
pub mod publish;

use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};

use crate::barrier::BarrierCoordinator;
use crate::config::DeadlineConfig;
use crate::error::CubeError;
use crate::ledger::{ActivityLedger, RetryDecision};
use crate::metadata_store::MetadataStore;
use crate::models::activity::{Activity, ActivityAction};
use crate::object_store::ObjectStore;
use crate::queue::{WorkItem, WorkReceivers};

/// Shared dependencies of every worker; cheap to clone behind `Arc`s.
pub struct WorkerContext {
    pub meta: Arc<MetadataStore>,
    pub ledger: Arc<ActivityLedger>,
    pub objects: Arc<dyn ObjectStore>,
    pub barrier: Arc<BarrierCoordinator>,
    pub deadlines: DeadlineConfig,
    pub max_retries: u32,
}

impl WorkerContext {
    fn deadline(&self, action: ActivityAction) -> Duration {
        let secs = match action {
            ActivityAction::Merge => self.deadlines.merge_secs,
            ActivityAction::Blend => self.deadlines.blend_secs,
            ActivityAction::Publish => self.deadlines.publish_secs,
        };
        Duration::from_secs(secs.max(1))
    }
}

/// Spawn `merge_workers` consumers on the batch lane and `stream_workers`
/// on the stream lane.
pub fn spawn_workers(
    ctx: Arc<WorkerContext>,
    receivers: WorkReceivers,
    merge_workers: usize,
    stream_workers: usize,
) {
    let batch_rx = Arc::new(Mutex::new(receivers.batch));
    for n in 0..merge_workers.max(1) {
        spawn_consumer(ctx.clone(), batch_rx.clone(), format!("merge-{n}"));
    }
    let stream_rx = Arc::new(Mutex::new(receivers.stream));
    for n in 0..stream_workers.max(1) {
        spawn_consumer(ctx.clone(), stream_rx.clone(), format!("stream-{n}"));
    }
}

fn spawn_consumer(
    ctx: Arc<WorkerContext>,
    rx: Arc<Mutex<mpsc::Receiver<WorkItem>>>,
    name: String,
) {
    tokio::spawn(async move {
        tracing::info!("worker {name} started");
        loop {
            let item = { rx.lock().await.recv().await };
            let Some(item) = item else {
                tracing::info!("worker {name} lane closed, stopping");
                break;
            };
            process_item(&ctx, &item.activity_id).await;
        }
    });
}

/// Claim and execute one activity end to end, including retry accounting
/// and the barrier notification on terminal transitions.
pub async fn process_item(ctx: &Arc<WorkerContext>, activity_id: &str) {
    let activity = match ctx.ledger.get(activity_id) {
        Ok(Some(a)) => a,
        Ok(None) => {
            tracing::warn!("activity {activity_id} vanished from the ledger");
            return;
        }
        Err(e) => {
            tracing::error!("ledger read for {activity_id} failed: {e}");
            return;
        }
    };

    match ctx.ledger.claim(activity_id) {
        Ok(true) => {}
        Ok(false) => {
            // Raced another worker, or the build was cancelled/forced.
            tracing::debug!("activity {activity_id} not claimable, skipping");
            return;
        }
        Err(e) => {
            tracing::error!("claim of {activity_id} failed: {e}");
            return;
        }
    }

    let deadline = ctx.deadline(activity.action);
    let job_ctx = ctx.clone();
    let job_activity = activity.clone();
    let job = tokio::task::spawn_blocking(move || match job_activity.action {
        ActivityAction::Merge => merge::run(&job_ctx, &job_activity),
        ActivityAction::Blend => blend::run(&job_ctx, &job_activity),
        ActivityAction::Publish => publish::run(&job_ctx, &job_activity),
    });

    let outcome = match tokio::time::timeout(deadline, job).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) => Err(CubeError::Fatal(format!("worker panicked: {join_err}"))),
        Err(_) => Err(CubeError::Transient(format!(
            "deadline of {deadline:?} exceeded"
        ))),
    };

    match outcome {
        Ok(()) => {
            match ctx.ledger.complete(activity_id) {
                Ok(true) => {
                    if let Ok(Some(done)) = ctx.ledger.get(activity_id) {
                        ctx.barrier.on_terminal(&done).await;
                    }
                }
                Ok(false) => {
                    // Cancelled while in flight; the artifact write was
                    // skipped by the worker's own status check.
                    tracing::info!("activity {activity_id} finished after cancellation");
                }
                Err(e) => tracing::error!("complete of {activity_id} failed: {e}"),
            }
        }
        Err(err) if err.is_retryable() => {
            backoff_sleep(activity.retries).await;
            match ctx.ledger.retry(activity_id, ctx.max_retries, &err.to_string()) {
                Ok(RetryDecision::Requeued) => {
                    tracing::warn!(
                        "activity {activity_id} retry {} scheduled: {err}",
                        activity.retries + 1
                    );
                }
                Ok(RetryDecision::Exhausted) => {
                    tracing::error!("activity {activity_id} failed terminally: {err}");
                    if let Ok(Some(failed)) = ctx.ledger.get(activity_id) {
                        ctx.barrier.on_terminal(&failed).await;
                    }
                }
                Err(e) => tracing::error!("retry bookkeeping for {activity_id} failed: {e}"),
            }
        }
        Err(err) => {
            tracing::error!("activity {activity_id} errored: {err}");
            match ctx.ledger.fail(activity_id, &err.to_string()) {
                Ok(true) => {
                    if let Ok(Some(failed)) = ctx.ledger.get(activity_id) {
                        ctx.barrier.on_terminal(&failed).await;
                    }
                }
                Ok(false) => {
                    tracing::debug!("activity {activity_id} already terminal");
                }
                Err(e) => tracing::error!("fail of {activity_id} failed: {e}"),
            }
        }
    }
}

/// Stream-lane callback carrying its own payload batch (`solo`): register
/// whatever is new, then execute inline.
pub async fn run_solo_batch(ctx: &Arc<WorkerContext>, activities: Vec<Activity>) {
    for activity in activities {
        if let Err(e) = ctx.ledger.register(&activity) {
            tracing::error!("solo register {} failed: {e}", activity.activity_id);
            continue;
        }
        let _ = ctx.ledger.mark_dispatched(&activity.activity_id);
        process_item(ctx, &activity.activity_id).await;
    }
}

/// Exponential backoff with jitter before a retry is re-queued.
async fn backoff_sleep(prior_retries: u32) {
    let base_ms = 500u64 * (1 << prior_retries.min(5));
    let jitter = rand::rng().random_range(0..base_ms / 2 + 1);
    tokio::time::sleep(Duration::from_millis(base_ms + jitter)).await;
}
