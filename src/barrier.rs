//! Stage-completion detection: MERGE -> BLEND -> PUBLISH.
//!
//! Reacts to terminal ledger transitions only; no clocks, no retries. The
//! per-(cube, tile, period, stage) gate in the ledger makes advancement
//! idempotent when the last two siblings finish concurrently.

use std::sync::Arc;

use crate::ledger::ActivityLedger;
use crate::metadata_store::MetadataStore;
use crate::models::activity::{Activity, ActivityAction, PublishPayload};
use crate::models::cube::BandKind;
use crate::queue::{Lane, WorkQueue};
use crate::workers::publish::index_inputs;

pub struct BarrierCoordinator {
    meta: Arc<MetadataStore>,
    ledger: Arc<ActivityLedger>,
    queue: WorkQueue,
}

impl BarrierCoordinator {
    pub fn new(meta: Arc<MetadataStore>, ledger: Arc<ActivityLedger>, queue: WorkQueue) -> Self {
        Self { meta, ledger, queue }
    }

    /// Entry point: called after every transition to DONE or ERROR.
    pub async fn on_terminal(&self, activity: &Activity) {
        let result = match activity.action {
            ActivityAction::Merge => self.after_merge(activity).await,
            ActivityAction::Blend => self.after_blend(activity).await,
            ActivityAction::Publish => Ok(()),
        };
        if let Err(e) = result {
            tracing::error!(
                "barrier after {} {}: {e}",
                activity.action.as_str(),
                activity.activity_id
            );
        }
    }

    async fn after_merge(&self, activity: &Activity) -> anyhow::Result<()> {
        let (Some(period), Some(target_cube)) = (
            activity.period.as_deref(),
            activity.activity.get("target_cube").and_then(|v| v.as_str()),
        ) else {
            return Ok(());
        };
        let tile = activity.tile_id.as_str();

        let counts =
            self.ledger
                .stage_counts(&activity.datacube_id, tile, period, ActivityAction::Merge)?;
        if !counts.all_terminal() {
            return Ok(());
        }

        if !self.ledger.try_advance_gate(target_cube, tile, period, "blend")? {
            return Ok(());
        }

        let blends = self
            .ledger
            .activities_for(target_cube, tile, period, ActivityAction::Blend)?;

        if counts.done == 0 {
            // Every merge failed: downstream inherits the failure.
            tracing::warn!("all merges errored for {target_cube} {tile} {period}");
            for blend in &blends {
                self.ledger.fail(&blend.activity_id, "no merges")?;
            }
            for publish in
                self.ledger
                    .activities_for(target_cube, tile, period, ActivityAction::Publish)?
            {
                self.ledger.fail(&publish.activity_id, "no merges")?;
            }
            // Close the blend gate's successor too: nothing will ever fire it.
            self.ledger.try_advance_gate(target_cube, tile, period, "publish")?;
            return Ok(());
        }

        tracing::info!(
            "merge barrier passed for {target_cube} {tile} {period} ({} done, {} error)",
            counts.done,
            counts.error
        );
        for blend in &blends {
            self.queue.dispatch(&self.ledger, Lane::Stream, &blend.activity_id).await;
        }
        Ok(())
    }

    async fn after_blend(&self, activity: &Activity) -> anyhow::Result<()> {
        let Some(period) = activity.period.as_deref() else {
            return Ok(());
        };
        let cube = activity.datacube_id.as_str();
        let tile = activity.tile_id.as_str();

        let counts = self.ledger.stage_counts(cube, tile, period, ActivityAction::Blend)?;
        if !counts.all_terminal() {
            return Ok(());
        }

        if !self.ledger.try_advance_gate(cube, tile, period, "publish")? {
            return Ok(());
        }

        let Some(publish) = self
            .ledger
            .activities_for(cube, tile, period, ActivityAction::Publish)?
            .into_iter()
            .next()
        else {
            return Ok(());
        };

        if counts.done == 0 {
            self.ledger.fail(&publish.activity_id, "no blends succeeded")?;
            return Ok(());
        }

        let missing = self.missing_bands(cube, tile, period, &publish)?;
        if !missing.is_empty() {
            let reason = format!("missing bands: {}", missing.join(", "));
            tracing::warn!("publish blocked for {cube} {tile} {period}: {reason}");
            self.ledger.fail(&publish.activity_id, &reason)?;
            return Ok(());
        }

        tracing::info!("blend barrier passed for {cube} {tile} {period}");
        self.queue.dispatch(&self.ledger, Lane::Stream, &publish.activity_id).await;
        Ok(())
    }

    /// Bands the publish stage requires but whose blend did not succeed:
    /// the quicklook triplet plus the inputs of every declared index.
    fn missing_bands(
        &self,
        cube: &str,
        tile: &str,
        period: &str,
        publish: &Activity,
    ) -> anyhow::Result<Vec<String>> {
        let payload: PublishPayload = serde_json::from_value(publish.activity.clone())?;

        let done: std::collections::HashSet<String> = self
            .ledger
            .activities_for(cube, tile, period, ActivityAction::Blend)?
            .into_iter()
            .filter(|a| a.mystatus == crate::models::activity::ActivityStatus::Done)
            .filter_map(|a| a.band)
            .collect();

        let bands = self.meta.bands_of(cube)?;
        let name_by_common: std::collections::HashMap<String, String> = bands
            .iter()
            .filter(|b| b.kind == BandKind::Reflectance)
            .map(|b| (b.common_name.clone(), b.name.clone()))
            .collect();

        let mut missing = Vec::new();
        for band in &payload.bands_quicklook {
            if !done.contains(band) {
                missing.push(band.clone());
            }
        }
        for index in &payload.indices {
            let Some(inputs) = index_inputs(index) else {
                continue;
            };
            for common in inputs {
                match name_by_common.get(*common) {
                    Some(name) if done.contains(name) => {}
                    Some(name) => missing.push(name.clone()),
                    None => missing.push(format!("{index}<-{common}")),
                }
            }
        }
        missing.sort();
        missing.dedup();
        Ok(missing)
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::activity::{ActivityStatus, activity_id};

    fn make(
        id: &str,
        action: ActivityAction,
        cube: &str,
        band: Option<&str>,
        payload: serde_json::Value,
    ) -> Activity {
        Activity {
            activity_id: id.into(),
            action,
            datacube_id: cube.into(),
            tile_id: "003003".into(),
            band: band.map(Into::into),
            period: Some("2019-01-01_2019-01-31".into()),
            mystatus: ActivityStatus::NotDone,
            mylaunch: None,
            myend: None,
            retries: 0,
            error_msg: None,
            activity: payload,
        }
    }

    fn harness() -> (BarrierCoordinator, Arc<ActivityLedger>, crate::queue::WorkReceivers) {
        let meta = Arc::new(MetadataStore::open_in_memory().unwrap());
        let ledger = Arc::new(ActivityLedger::open_in_memory().unwrap());
        let (queue, receivers) = WorkQueue::new(16, 16);
        (
            BarrierCoordinator::new(meta, ledger.clone(), queue),
            ledger,
            receivers,
        )
    }

    fn merge_payload() -> serde_json::Value {
        serde_json::json!({"target_cube": "mc_10_1M_STK"})
    }

    fn publish_payload() -> serde_json::Value {
        serde_json::json!({
            "function": "STK",
            "bands_quicklook": [],
            "bands": ["B04"],
            "indices": [],
            "period_start": "2019-01-01",
            "period_end": "2019-01-31",
        })
    }

    #[tokio::test]
    async fn duplicate_done_events_enqueue_blend_once() {
        let (barrier, ledger, mut receivers) = harness();

        let merge = make("m1", ActivityAction::Merge, "mc_10", Some("B04"), merge_payload());
        ledger.register(&merge).unwrap();
        let blend = make(
            "b1",
            ActivityAction::Blend,
            "mc_10_1M_STK",
            Some("B04"),
            serde_json::json!({}),
        );
        ledger.register(&blend).unwrap();

        ledger.claim("m1").unwrap();
        ledger.complete("m1").unwrap();
        let done = ledger.get("m1").unwrap().unwrap();

        // The same terminal event delivered twice.
        barrier.on_terminal(&done).await;
        barrier.on_terminal(&done).await;

        let first = receivers.stream.recv().await.unwrap();
        assert_eq!(first.activity_id, "b1");
        assert!(
            tokio::time::timeout(std::time::Duration::from_millis(50), receivers.stream.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn barrier_waits_for_all_siblings() {
        let (barrier, ledger, mut receivers) = harness();

        for id in ["m1", "m2"] {
            ledger
                .register(&make(id, ActivityAction::Merge, "mc_10", Some("B04"), merge_payload()))
                .unwrap();
        }
        ledger
            .register(&make(
                "b1",
                ActivityAction::Blend,
                "mc_10_1M_STK",
                Some("B04"),
                serde_json::json!({}),
            ))
            .unwrap();

        ledger.claim("m1").unwrap();
        ledger.complete("m1").unwrap();
        barrier.on_terminal(&ledger.get("m1").unwrap().unwrap()).await;
        // m2 still NOTDONE: nothing on the stream lane yet.
        assert!(
            tokio::time::timeout(std::time::Duration::from_millis(50), receivers.stream.recv())
                .await
                .is_err()
        );

        ledger.claim("m2").unwrap();
        ledger.fail("m2", "boom").unwrap();
        barrier.on_terminal(&ledger.get("m2").unwrap().unwrap()).await;
        // done=1, error=1, total=2: blend proceeds with the survivor.
        assert_eq!(receivers.stream.recv().await.unwrap().activity_id, "b1");
    }

    #[tokio::test]
    async fn all_merges_errored_fails_downstream() {
        let (barrier, ledger, mut receivers) = harness();

        ledger
            .register(&make("m1", ActivityAction::Merge, "mc_10", Some("B04"), merge_payload()))
            .unwrap();
        ledger
            .register(&make(
                "b1",
                ActivityAction::Blend,
                "mc_10_1M_STK",
                Some("B04"),
                serde_json::json!({}),
            ))
            .unwrap();
        let pid = activity_id(
            "mc_10_1M_STK",
            ActivityAction::Publish,
            "003003",
            None,
            Some("2019-01-01_2019-01-31"),
            None,
        );
        ledger
            .register(&make(&pid, ActivityAction::Publish, "mc_10_1M_STK", None, publish_payload()))
            .unwrap();

        ledger.claim("m1").unwrap();
        ledger.fail("m1", "bad raster").unwrap();
        barrier.on_terminal(&ledger.get("m1").unwrap().unwrap()).await;

        let blend = ledger.get("b1").unwrap().unwrap();
        assert_eq!(blend.mystatus, ActivityStatus::Error);
        assert_eq!(blend.error_msg.as_deref(), Some("no merges"));
        let publish = ledger.get(&pid).unwrap().unwrap();
        assert_eq!(publish.mystatus, ActivityStatus::Error);
        assert_eq!(publish.error_msg.as_deref(), Some("no merges"));
        assert!(
            tokio::time::timeout(std::time::Duration::from_millis(50), receivers.stream.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn blend_completion_enqueues_publish() {
        let (barrier, ledger, mut receivers) = harness();

        let blend = make(
            "b1",
            ActivityAction::Blend,
            "mc_10_1M_STK",
            Some("B04"),
            serde_json::json!({}),
        );
        ledger.register(&blend).unwrap();
        ledger
            .register(&make("p1", ActivityAction::Publish, "mc_10_1M_STK", None, publish_payload()))
            .unwrap();

        ledger.claim("b1").unwrap();
        ledger.complete("b1").unwrap();
        barrier.on_terminal(&ledger.get("b1").unwrap().unwrap()).await;

        assert_eq!(receivers.stream.recv().await.unwrap().activity_id, "p1");
    }

    #[tokio::test]
    async fn publish_blocked_when_quicklook_band_failed() {
        let (barrier, ledger, _receivers) = harness();

        let mut payload = publish_payload();
        payload["bands_quicklook"] = serde_json::json!(["B04", "B03"]);

        for (id, band) in [("b1", "B04"), ("b2", "B03")] {
            ledger
                .register(&make(
                    id,
                    ActivityAction::Blend,
                    "mc_10_1M_STK",
                    Some(band),
                    serde_json::json!({}),
                ))
                .unwrap();
        }
        ledger
            .register(&make("p1", ActivityAction::Publish, "mc_10_1M_STK", None, payload))
            .unwrap();

        ledger.claim("b1").unwrap();
        ledger.complete("b1").unwrap();
        ledger.claim("b2").unwrap();
        ledger.fail("b2", "boom").unwrap();
        barrier.on_terminal(&ledger.get("b2").unwrap().unwrap()).await;

        let publish = ledger.get("p1").unwrap().unwrap();
        assert_eq!(publish.mystatus, ActivityStatus::Error);
        assert!(publish.error_msg.unwrap().contains("B03"));
    }
}
