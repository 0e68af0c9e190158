//! Fan-out dispatch of activities to the worker fleet.
//!
//! Two bounded lanes: the batch lane carries MERGE work, the stream lane
//! carries BLEND/PUBLISH work enqueued by the barrier. Lanes carry only
//! activity ids; payloads stay in the ledger, so a full lane simply delays
//! dispatch of work that is already durable as NOTDONE. The `dispatched`
//! flag in the ledger makes every push idempotent, and a periodic rescan
//! re-feeds work dropped by a restart.

use std::sync::Arc;
use tokio::sync::mpsc;

use crate::ledger::ActivityLedger;
use crate::models::activity::ActivityAction;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lane {
    Batch,
    Stream,
}

#[derive(Debug, Clone)]
pub struct WorkItem {
    pub activity_id: String,
}

#[derive(Clone)]
pub struct WorkQueue {
    batch_tx: mpsc::Sender<WorkItem>,
    stream_tx: mpsc::Sender<WorkItem>,
}

pub struct WorkReceivers {
    pub batch: mpsc::Receiver<WorkItem>,
    pub stream: mpsc::Receiver<WorkItem>,
}

impl WorkQueue {
    pub fn new(batch_capacity: usize, stream_capacity: usize) -> (Self, WorkReceivers) {
        let (batch_tx, batch_rx) = mpsc::channel(batch_capacity.max(1));
        let (stream_tx, stream_rx) = mpsc::channel(stream_capacity.max(1));
        (
            Self { batch_tx, stream_tx },
            WorkReceivers {
                batch: batch_rx,
                stream: stream_rx,
            },
        )
    }

    /// Hand an activity to a lane, waiting for capacity. Returns false when
    /// the lane is shut down.
    pub async fn push(&self, lane: Lane, activity_id: &str) -> bool {
        let tx = match lane {
            Lane::Batch => &self.batch_tx,
            Lane::Stream => &self.stream_tx,
        };
        tx.send(WorkItem {
            activity_id: activity_id.to_string(),
        })
        .await
        .is_ok()
    }

    /// Mark-then-push: only the caller that wins the `dispatched` flag
    /// enqueues, so duplicate submissions collapse to one delivery.
    pub async fn dispatch(&self, ledger: &ActivityLedger, lane: Lane, activity_id: &str) -> bool {
        match ledger.mark_dispatched(activity_id) {
            Ok(true) => self.push(lane, activity_id).await,
            Ok(false) => false,
            Err(e) => {
                tracing::error!("dispatch {activity_id}: ledger error: {e}");
                false
            }
        }
    }
}

/// Spawn the dispatcher: re-scans the ledger for NOTDONE work that has not
/// reached a lane yet (fresh registrations, retries, restarts).
pub fn spawn_dispatcher(ledger: Arc<ActivityLedger>, queue: WorkQueue, scan_interval_secs: u64) {
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(scan_interval_secs.max(1)));
        loop {
            interval.tick().await;
            for (action, lane) in [
                (ActivityAction::Merge, Lane::Batch),
                (ActivityAction::Blend, Lane::Stream),
                (ActivityAction::Publish, Lane::Stream),
            ] {
                let pending = match ledger.undispatched(action, 256) {
                    Ok(ids) => ids,
                    Err(e) => {
                        tracing::error!("dispatcher scan failed: {e}");
                        continue;
                    }
                };
                for activity_id in pending {
                    if queue.dispatch(&ledger, lane, &activity_id).await {
                        tracing::debug!("dispatched {} {activity_id}", action.as_str());
                    }
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::activity::{Activity, ActivityStatus};

    fn merge_activity(id: &str) -> Activity {
        Activity {
            activity_id: id.into(),
            action: ActivityAction::Merge,
            datacube_id: "mc_10".into(),
            tile_id: "003003".into(),
            band: Some("B04".into()),
            period: Some("2019-01-01_2019-01-31".into()),
            mystatus: ActivityStatus::NotDone,
            mylaunch: None,
            myend: None,
            retries: 0,
            error_msg: None,
            activity: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn dispatch_delivers_each_activity_once() {
        let ledger = ActivityLedger::open_in_memory().unwrap();
        ledger.register(&merge_activity("a1")).unwrap();

        let (queue, mut receivers) = WorkQueue::new(4, 4);
        assert!(queue.dispatch(&ledger, Lane::Batch, "a1").await);
        // Second dispatch loses the flag race and pushes nothing.
        assert!(!queue.dispatch(&ledger, Lane::Batch, "a1").await);

        let item = receivers.batch.recv().await.unwrap();
        assert_eq!(item.activity_id, "a1");
        assert!(
            tokio::time::timeout(std::time::Duration::from_millis(50), receivers.batch.recv())
                .await
                .is_err()
        );
    }
}
