//! Build-request expansion: periods x tiles x bands x scenes -> MERGE
//! activities, plus the BLEND/PUBLISH skeletons the barrier advances.

use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::cube_id::CubeId;
use crate::error::{CubeError, Result};
use crate::grid;
use crate::ledger::ActivityLedger;
use crate::metadata_store::MetadataStore;
use crate::models::activity::{
    Activity, ActivityAction, ActivityStatus, BlendPayload, MergePayload, PublishPayload,
    activity_id,
};
use crate::models::cube::{
    Band, BandKind, CLEAR_OBSERVATION_NAME, Collection, PROVENANCE_NAME, TOTAL_OBSERVATION_NAME,
    Tile,
};
use crate::models::request::BuildRequest;
use crate::object_store::{ObjectStore, composite_key, merge_key};
use crate::queue::{Lane, WorkQueue};
use crate::stac::{SceneRef, StacSource};
use crate::timeline::{Period, TemporalSchema, decode_periods, parse_date};

/// Everything the planner derives from a build request before it starts
/// registering activities. Threaded explicitly through the planning steps.
pub struct BuildContext {
    pub cube: Collection,
    pub cube_id: CubeId,
    pub irregular_cube: String,
    pub periods: Vec<Period>,
    pub tiles: Vec<Tile>,
    /// Acquirable bands of the irregular cube (reflectance + quality).
    pub bands: Vec<Band>,
    pub collections: Vec<String>,
    pub satellite: String,
    pub force: bool,
    pub raster_size: (u32, u32),
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct BuildSummary {
    pub build_id: String,
    pub datacube: String,
    pub periods: usize,
    pub tiles: usize,
    pub merges: usize,
    pub blends: usize,
    pub publishes: usize,
}

pub struct Orchestrator {
    meta: Arc<MetadataStore>,
    ledger: Arc<ActivityLedger>,
    objects: Arc<dyn ObjectStore>,
    stac: Arc<dyn StacSource>,
    queue: WorkQueue,
    stac_url: String,
    bucket: String,
}

impl Orchestrator {
    pub fn new(
        meta: Arc<MetadataStore>,
        ledger: Arc<ActivityLedger>,
        objects: Arc<dyn ObjectStore>,
        stac: Arc<dyn StacSource>,
        queue: WorkQueue,
        stac_url: String,
        bucket: String,
    ) -> Self {
        Self {
            meta,
            ledger,
            objects,
            stac,
            queue,
            stac_url,
            bucket,
        }
    }

    /// Expand a build request into ledger activities and dispatch the
    /// batch lane. Returns once every activity is registered.
    pub async fn start_build(&self, req: BuildRequest) -> Result<BuildSummary> {
        let ctx = self.plan(&req).await?;

        if ctx.force {
            self.invalidate_previous(&ctx)?;
        }

        let mut merges = 0usize;
        let mut blends = 0usize;
        let mut publishes = 0usize;
        let mut merge_ids = Vec::new();

        for period in &ctx.periods {
            let label = period.label();
            for tile in &ctx.tiles {
                let scenes = self.scenes_for(&ctx, tile, period).await?;
                if scenes.is_empty() {
                    tracing::warn!(
                        "no scenes in window for tile {} period {label}",
                        tile.id
                    );
                    continue;
                }

                let registered =
                    self.register_merges(&ctx, tile, &label, &scenes, &mut merge_ids)?;
                if registered == 0 {
                    tracing::warn!(
                        "scenes found but no matching band assets for tile {} period {label}",
                        tile.id
                    );
                    continue;
                }
                merges += registered;
                blends += self.register_blend_skeletons(&ctx, tile, &label)?;
                publishes += self.register_publish_skeleton(&ctx, tile, period)?;
            }
        }

        if merges == 0 {
            return Err(CubeError::Validation(format!(
                "no scenes in window {} for any requested tile",
                ctx.periods
                    .first()
                    .map(|p| p.label())
                    .unwrap_or_default()
            )));
        }

        for activity_id in &merge_ids {
            self.queue.dispatch(&self.ledger, Lane::Batch, activity_id).await;
        }

        let summary = BuildSummary {
            build_id: uuid::Uuid::new_v4().to_string(),
            datacube: ctx.cube.id.clone(),
            periods: ctx.periods.len(),
            tiles: ctx.tiles.len(),
            merges,
            blends,
            publishes,
        };
        tracing::info!(
            "build {} accepted: {} merges, {} blends, {} publishes",
            summary.build_id,
            merges,
            blends,
            publishes
        );
        Ok(summary)
    }

    /// Validate the request and resolve every schema it references.
    async fn plan(&self, req: &BuildRequest) -> Result<BuildContext> {
        let cube = self
            .meta
            .get_collection(&req.datacube)?
            .filter(|c| c.is_cube)
            .ok_or_else(|| CubeError::NotFound(format!("cube '{}'", req.datacube)))?;

        if cube.composite_function_id == "IDENTITY" {
            return Err(CubeError::Validation(format!(
                "cube '{}' is an irregular (IDENTITY) cube; build a composite cube instead",
                req.datacube
            )));
        }

        let cube_id = CubeId::parse(&cube.id)?;
        let temporal_label = cube_id
            .temporal
            .clone()
            .ok_or_else(|| CubeError::Validation(format!("cube '{}' has no temporal step", cube.id)))?;
        let schema = TemporalSchema::parse(&temporal_label)?;

        let start = parse_date(&req.start_date)?;
        let end = match &req.end_date {
            Some(d) => parse_date(d)?,
            None => Utc::now().date_naive(),
        };
        let periods = decode_periods(schema, start, end)?;
        if periods.is_empty() {
            return Err(CubeError::Validation("date range yields no periods".into()));
        }

        let irregular_cube = cube_id.irregular();
        let bands: Vec<Band> = self
            .meta
            .bands_of(&irregular_cube)?
            .into_iter()
            .filter(|b| !b.kind.is_derived())
            .collect();
        if bands.is_empty() {
            return Err(CubeError::NotFound(format!(
                "irregular cube '{irregular_cube}' has no acquirable bands"
            )));
        }

        let raster = self
            .meta
            .get_raster_size(&cube.raster_size_schema_id)?
            .ok_or_else(|| {
                CubeError::NotFound(format!("raster size schema '{}'", cube.raster_size_schema_id))
            })?;

        let mut tiles = Vec::with_capacity(req.tiles.len());
        for tile_id in &req.tiles {
            let tile = self
                .meta
                .get_tile(&cube.grs_schema_id, tile_id)?
                .ok_or_else(|| {
                    CubeError::Validation(format!(
                        "tile '{tile_id}' is not part of grid '{}'",
                        cube.grs_schema_id
                    ))
                })?;
            tiles.push(tile);
        }

        let collections: Vec<String> = req
            .collections
            .split(',')
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect();
        if collections.is_empty() {
            return Err(CubeError::Validation("no source collections given".into()));
        }

        Ok(BuildContext {
            cube,
            cube_id,
            irregular_cube,
            periods,
            tiles,
            bands,
            collections,
            satellite: req.satellite.clone(),
            force: req.force,
            raster_size: (raster.raster_size_x, raster.raster_size_y),
        })
    }

    /// Force semantics: reset ledger rows and wipe composite artifacts and
    /// items for the affected window. Merge artifacts are overwritten in
    /// place by the re-run.
    fn invalidate_previous(&self, ctx: &BuildContext) -> Result<()> {
        let cubes = vec![ctx.irregular_cube.clone(), ctx.cube.id.clone()];
        let labels: Vec<String> = ctx.periods.iter().map(|p| p.label()).collect();
        let reset = self.ledger.force_reset(&cubes, &labels)?;
        tracing::info!("force: reset {reset} activities for {}", ctx.cube.id);

        for tile in &ctx.tiles {
            for label in &labels {
                self.objects
                    .delete_prefix(&format!("cubes/{}/{}/{}", ctx.cube.id, tile.id, label))?;
                self.objects
                    .delete_prefix(&format!("items/{}/{}/{}", ctx.cube.id, tile.id, label))?;
                let start = label.split('_').next().unwrap_or(label);
                self.meta.delete_item(&ctx.cube.id, &tile.id, start)?;
            }
        }
        Ok(())
    }

    /// Scenes whose acquisition date falls inside the period, across all
    /// source collections, deduplicated by scene id.
    async fn scenes_for(
        &self,
        ctx: &BuildContext,
        tile: &Tile,
        period: &Period,
    ) -> Result<Vec<SceneRef>> {
        let bbox = grid::tile_bbox_wgs84(tile)?;
        let mut by_id: BTreeMap<String, SceneRef> = BTreeMap::new();
        for collection in &ctx.collections {
            let scenes = self
                .stac
                .resolve(collection, bbox, period.start, period.end)
                .await?;
            for scene in scenes {
                if period.contains(scene.acquired) {
                    by_id.entry(scene.scene_id.clone()).or_insert(scene);
                }
            }
        }
        let mut scenes: Vec<SceneRef> = by_id.into_values().collect();
        scenes.sort_by(|a, b| a.acquired.cmp(&b.acquired).then_with(|| a.scene_id.cmp(&b.scene_id)));
        Ok(scenes)
    }

    fn register_merges(
        &self,
        ctx: &BuildContext,
        tile: &Tile,
        label: &str,
        scenes: &[SceneRef],
        merge_ids: &mut Vec<String>,
    ) -> Result<usize> {
        let (min_x, _, _, max_y) = grid::tile_extent(tile)?;
        let (width, height) = ctx.raster_size;
        let quality_band = ctx.bands.iter().find(|b| b.kind == BandKind::Quality);

        let mut registered = 0;
        for scene in scenes {
            let quality_href = quality_band
                .and_then(|b| asset_for_band(scene, b))
                .map(str::to_string);

            for band in &ctx.bands {
                let Some(href) = asset_for_band(scene, band) else {
                    continue;
                };
                let resampling = match band.kind {
                    BandKind::Quality => "nearest",
                    _ => "bilinear",
                };
                let dest_key =
                    merge_key(&ctx.irregular_cube, &tile.id, label, &scene.scene_id, &band.name);
                let payload = MergePayload {
                    scene_id: scene.scene_id.clone(),
                    acquired: scene.acquired.format("%Y-%m-%d").to_string(),
                    asset_href: href.to_string(),
                    quality_href: if band.kind == BandKind::Quality {
                        None
                    } else {
                        quality_href.clone()
                    },
                    band: band.name.clone(),
                    kind: band.kind,
                    data_type: band.data_type.clone(),
                    fill: band.fill,
                    resampling: resampling.to_string(),
                    dest_key,
                    crs: String::new(),
                    origin_x: min_x,
                    origin_y: max_y,
                    res_x: band.resolution_x,
                    res_y: band.resolution_y,
                    width,
                    height,
                    efficacy: None,
                    cloud_ratio: None,
                    target_cube: ctx.cube.id.clone(),
                    url_stac: self.stac_url.clone(),
                    datasets: ctx.collections.clone(),
                    satellite: ctx.satellite.clone(),
                    bucket_name: self.bucket.clone(),
                };

                let id = activity_id(
                    &ctx.irregular_cube,
                    ActivityAction::Merge,
                    &tile.id,
                    Some(&band.name),
                    Some(label),
                    Some(&scene.scene_id),
                );
                let act = Activity {
                    activity_id: id.clone(),
                    action: ActivityAction::Merge,
                    datacube_id: ctx.irregular_cube.clone(),
                    tile_id: tile.id.clone(),
                    band: Some(band.name.clone()),
                    period: Some(label.to_string()),
                    mystatus: ActivityStatus::NotDone,
                    mylaunch: None,
                    myend: None,
                    retries: 0,
                    error_msg: None,
                    activity: serde_json::to_value(&payload)
                        .map_err(|e| CubeError::Fatal(e.to_string()))?,
                };
                self.ledger.register(&act)?;
                merge_ids.push(id);
                registered += 1;
            }
        }
        Ok(registered)
    }

    /// One BLEND skeleton per reflectance band plus the observation bands.
    fn register_blend_skeletons(&self, ctx: &BuildContext, tile: &Tile, label: &str) -> Result<usize> {
        let function = ctx.cube.composite_function_id.clone();
        let reference_band = ctx
            .bands
            .iter()
            .filter(|b| b.kind == BandKind::Reflectance)
            .map(|b| b.name.clone())
            .min()
            .unwrap_or_default();

        let mut targets: Vec<(String, BandKind, String, i32)> = ctx
            .bands
            .iter()
            .filter(|b| b.kind == BandKind::Reflectance)
            .map(|b| (b.name.clone(), b.kind, b.data_type.clone(), b.fill))
            .collect();
        targets.push((CLEAR_OBSERVATION_NAME.into(), BandKind::Observation, "uint8".into(), 0));
        targets.push((TOTAL_OBSERVATION_NAME.into(), BandKind::Observation, "uint8".into(), 0));
        targets.push((PROVENANCE_NAME.into(), BandKind::Observation, "int16".into(), -1));

        let mut registered = 0;
        for (band, kind, data_type, fill) in targets {
            let payload = BlendPayload {
                band: band.clone(),
                kind,
                data_type,
                fill,
                function: function.clone(),
                irregular_cube: ctx.irregular_cube.clone(),
                dest_key: composite_key(&ctx.cube.id, &tile.id, label, &band),
            };
            let id = activity_id(
                &ctx.cube.id,
                ActivityAction::Blend,
                &tile.id,
                Some(&band),
                Some(label),
                None,
            );
            let mut value =
                serde_json::to_value(&payload).map_err(|e| CubeError::Fatal(e.to_string()))?;
            if band == PROVENANCE_NAME {
                value["reference_band"] = serde_json::Value::String(reference_band.clone());
            }
            let act = Activity {
                activity_id: id,
                action: ActivityAction::Blend,
                datacube_id: ctx.cube.id.clone(),
                tile_id: tile.id.clone(),
                band: Some(band),
                period: Some(label.to_string()),
                mystatus: ActivityStatus::NotDone,
                mylaunch: None,
                myend: None,
                retries: 0,
                error_msg: None,
                activity: value,
            };
            if self.ledger.register(&act)? {
                registered += 1;
            }
        }
        Ok(registered)
    }

    fn register_publish_skeleton(&self, ctx: &BuildContext, tile: &Tile, period: &Period) -> Result<usize> {
        let label = period.label();
        let bands: Vec<String> = ctx
            .bands
            .iter()
            .filter(|b| b.kind == BandKind::Reflectance)
            .map(|b| b.name.clone())
            .collect();
        let indices: Vec<String> = self
            .meta
            .bands_of(&ctx.cube.id)?
            .into_iter()
            .filter(|b| b.kind == BandKind::Index)
            .map(|b| b.name)
            .collect();

        let payload = PublishPayload {
            function: ctx.cube.composite_function_id.clone(),
            bands_quicklook: ctx.cube.bands_quicklook.clone(),
            bands,
            indices,
            period_start: period.start.format("%Y-%m-%d").to_string(),
            period_end: period.end.format("%Y-%m-%d").to_string(),
        };
        let id = activity_id(&ctx.cube.id, ActivityAction::Publish, &tile.id, None, Some(&label), None);
        let act = Activity {
            activity_id: id,
            action: ActivityAction::Publish,
            datacube_id: ctx.cube.id.clone(),
            tile_id: tile.id.clone(),
            band: None,
            period: Some(label),
            mystatus: ActivityStatus::NotDone,
            mylaunch: None,
            myend: None,
            retries: 0,
            error_msg: None,
            activity: serde_json::to_value(&payload).map_err(|e| CubeError::Fatal(e.to_string()))?,
        };
        Ok(usize::from(self.ledger.register(&act)?))
    }
}

fn asset_for_band<'a>(scene: &'a SceneRef, band: &Band) -> Option<&'a str> {
    scene
        .assets
        .get(&band.name)
        .or_else(|| scene.assets.get(&band.common_name))
        .map(String::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::barrier::BarrierCoordinator;
    use crate::config::DeadlineConfig;
    use crate::models::cube::{GrsSchema, RasterSizeSchema};
    use crate::object_store::FsObjectStore;
    use crate::raster::{DataType, GeoTransform, Raster};
    use crate::workers::merge::QUALITY_NODATA;
    use crate::workers::{WorkerContext, spawn_workers};
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use std::collections::BTreeMap;
    use std::path::Path;

    const TILE_ID: &str = "003003";
    const GRID: &str = "testgrid";
    const IRREGULAR: &str = "mc_100";
    const COMPOSITE: &str = "mc_100_1M_STK";
    const PERIOD: &str = "2019-01-01_2019-01-31";
    const SIZE: u32 = 8;
    const RES: f64 = 100.0;

    struct FakeStac {
        scenes: Vec<SceneRef>,
    }

    #[async_trait]
    impl StacSource for FakeStac {
        async fn resolve(
            &self,
            _collection: &str,
            _bbox: (f64, f64, f64, f64),
            start: chrono::NaiveDate,
            end: chrono::NaiveDate,
        ) -> crate::error::Result<Vec<SceneRef>> {
            Ok(self
                .scenes
                .iter()
                .filter(|s| s.acquired >= start && s.acquired <= end)
                .cloned()
                .collect())
        }
    }

    fn tile_grid() -> GeoTransform {
        GeoTransform {
            origin_x: 0.0,
            origin_y: 0.0,
            res_x: RES,
            res_y: RES,
        }
    }

    fn write_scene(
        dir: &Path,
        scene_id: &str,
        value: i32,
        quality_code: i32,
    ) -> (String, String) {
        let mut band = Raster::filled(SIZE, SIZE, tile_grid(), DataType::Int16, -9999);
        band.pixels.fill(value);
        let band_path = dir.join(format!("{scene_id}_B04.tif"));
        std::fs::write(&band_path, band.to_geotiff(false).unwrap()).unwrap();

        let mut quality = Raster::filled(SIZE, SIZE, tile_grid(), DataType::UInt8, QUALITY_NODATA);
        quality.pixels.fill(quality_code);
        let quality_path = dir.join(format!("{scene_id}_quality.tif"));
        std::fs::write(&quality_path, quality.to_geotiff(false).unwrap()).unwrap();

        (
            band_path.to_string_lossy().into_owned(),
            quality_path.to_string_lossy().into_owned(),
        )
    }

    fn scene(scene_id: &str, date: &str, band_href: &str, quality_href: &str) -> SceneRef {
        let mut assets = BTreeMap::new();
        assets.insert("B04".to_string(), band_href.to_string());
        assets.insert("quality".to_string(), quality_href.to_string());
        SceneRef {
            scene_id: scene_id.to_string(),
            acquired: NaiveDate::parse_from_str(date, "%Y-%m-%d").unwrap(),
            assets,
            cloud_cover: None,
        }
    }

    struct Harness {
        meta: Arc<MetadataStore>,
        ledger: Arc<ActivityLedger>,
        objects: Arc<dyn ObjectStore>,
        orchestrator: Orchestrator,
        _dir: tempfile::TempDir,
    }

    fn seed_catalog(meta: &MetadataStore) {
        meta.create_grs(
            &GrsSchema {
                id: GRID.into(),
                description: String::new(),
                crs: "+proj=aea".into(),
            },
            &[Tile {
                id: TILE_ID.into(),
                grs_schema_id: GRID.into(),
                geom_wgs84: "POLYGON((0 -0.01,0.01 -0.01,0.01 0,0 0))".into(),
                geom: "POLYGON((0 -800,800 -800,800 0,0 0))".into(),
                min_x: 0.0,
                max_y: 0.0,
            }],
        )
        .unwrap();
        meta.upsert_raster_size(&RasterSizeSchema {
            id: format!("{GRID}-100"),
            raster_size_x: SIZE,
            raster_size_y: SIZE,
            chunk_size_x: SIZE,
            chunk_size_y: SIZE,
        })
        .unwrap();
        meta.create_temporal_schema(&crate::models::cube::TemporalCompositionSchema {
            id: "M1month".into(),
            temporal_schema: "M".into(),
            temporal_composite_t: "1".into(),
            temporal_composite_unit: "month".into(),
        })
        .unwrap();

        for (id, function, temporal) in [
            (IRREGULAR, "IDENTITY", "Anull"),
            (COMPOSITE, "STK", "M1month"),
        ] {
            meta.create_collection(&Collection {
                id: id.into(),
                is_cube: true,
                grs_schema_id: GRID.into(),
                raster_size_schema_id: format!("{GRID}-100"),
                temporal_composition_schema_id: temporal.into(),
                composite_function_id: function.into(),
                bands_quicklook: vec!["B04".into(), "B04".into(), "B04".into()],
                license: String::new(),
                description: String::new(),
            })
            .unwrap();
        }
        let mut b04 = Band::with_defaults("B04", IRREGULAR, BandKind::Reflectance, RES);
        b04.common_name = "red".into();
        let quality = Band::with_defaults("quality", IRREGULAR, BandKind::Quality, RES);
        meta.insert_bands(&[b04, quality]).unwrap();

        let mut b04c = Band::with_defaults("B04", COMPOSITE, BandKind::Reflectance, RES);
        b04c.common_name = "red".into();
        meta.insert_bands(&[b04c]).unwrap();
    }

    fn harness(scenes: Vec<SceneRef>) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let meta = Arc::new(MetadataStore::open_in_memory().unwrap());
        let ledger = Arc::new(ActivityLedger::open_in_memory().unwrap());
        let objects: Arc<dyn ObjectStore> =
            Arc::new(FsObjectStore::new(dir.path().to_path_buf(), "bdc-test"));
        seed_catalog(&meta);

        let (queue, receivers) = WorkQueue::new(64, 64);
        let barrier = Arc::new(BarrierCoordinator::new(
            meta.clone(),
            ledger.clone(),
            queue.clone(),
        ));
        let workers = Arc::new(WorkerContext {
            meta: meta.clone(),
            ledger: ledger.clone(),
            objects: objects.clone(),
            barrier,
            deadlines: DeadlineConfig::default(),
            max_retries: 1,
        });
        spawn_workers(workers, receivers, 2, 2);

        let orchestrator = Orchestrator::new(
            meta.clone(),
            ledger.clone(),
            objects.clone(),
            Arc::new(FakeStac { scenes }),
            queue,
            "http://stac.test".into(),
            "bdc-test".into(),
        );

        Harness {
            meta,
            ledger,
            objects,
            orchestrator,
            _dir: dir,
        }
    }

    fn build_request(force: bool) -> BuildRequest {
        BuildRequest {
            datacube: COMPOSITE.into(),
            tiles: vec![TILE_ID.into()],
            collections: "S2_MSI_L2A".into(),
            satellite: "S2".into(),
            start_date: "2019-01-01".into(),
            end_date: Some("2019-01-31".into()),
            force,
        }
    }

    async fn wait_terminal(ledger: &ActivityLedger) {
        for _ in 0..300 {
            let pending = [IRREGULAR, COMPOSITE]
                .iter()
                .flat_map(|c| ledger.activities_by_datacube(c).unwrap())
                .filter(|a| !a.mystatus.is_terminal())
                .count();
            if pending == 0 {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
        panic!("pipeline did not reach terminal state");
    }

    fn composite_pixels(h: &Harness, band: &str) -> Vec<i32> {
        let key = composite_key(COMPOSITE, TILE_ID, PERIOD, band);
        Raster::from_geotiff(&h.objects.get(&key).unwrap(), -9999)
            .unwrap()
            .pixels
    }

    // Three clear scenes on days 5, 15, 25: STK picks day 25 everywhere.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn stk_build_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let mut scenes = Vec::new();
        for (id, date, value) in [
            ("S2A_D05", "2019-01-05", 100),
            ("S2A_D15", "2019-01-15", 200),
            ("S2A_D25", "2019-01-25", 300),
        ] {
            let (band, quality) = write_scene(dir.path(), id, value, 0);
            scenes.push(scene(id, date, &band, &quality));
        }
        let h = harness(scenes);

        let summary = h.orchestrator.start_build(build_request(false)).await.unwrap();
        assert_eq!(summary.merges, 6);
        assert_eq!(summary.blends, 4);
        assert_eq!(summary.publishes, 1);

        wait_terminal(&h.ledger).await;

        assert!(composite_pixels(&h, "B04").iter().all(|&v| v == 300));
        assert!(composite_pixels(&h, "PROVENANCE").iter().all(|&v| v == 25));
        assert!(composite_pixels(&h, "CLEAROB").iter().all(|&v| v == 3));
        assert!(composite_pixels(&h, "TOTALOB").iter().all(|&v| v == 3));

        // Item registered with a decodable quicklook.
        assert_eq!(h.meta.count_items(COMPOSITE).unwrap(), 1);
        let quicklook = h
            .objects
            .get(&crate::object_store::quicklook_key(COMPOSITE, TILE_ID, PERIOD))
            .unwrap();
        assert!(image::load_from_memory(&quicklook).is_ok());
    }

    // Re-running without force is a no-op; force reproduces identical bytes.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn force_rebuild_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let (band, quality) = write_scene(dir.path(), "S2A_D05", 1234, 0);
        let h = harness(vec![scene("S2A_D05", "2019-01-05", &band, &quality)]);

        h.orchestrator.start_build(build_request(false)).await.unwrap();
        wait_terminal(&h.ledger).await;
        let first = h
            .objects
            .get(&composite_key(COMPOSITE, TILE_ID, PERIOD, "B04"))
            .unwrap();
        let ends_before: Vec<_> = h
            .ledger
            .activities_by_datacube(IRREGULAR)
            .unwrap()
            .into_iter()
            .map(|a| a.myend)
            .collect();

        // force=false over a finished range: no ledger mutations.
        h.orchestrator.start_build(build_request(false)).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        let ends_after: Vec<_> = h
            .ledger
            .activities_by_datacube(IRREGULAR)
            .unwrap()
            .into_iter()
            .map(|a| a.myend)
            .collect();
        assert_eq!(ends_before, ends_after);

        // force=true: rebuilt, byte-identical output, fresh timestamps.
        h.orchestrator.start_build(build_request(true)).await.unwrap();
        wait_terminal(&h.ledger).await;
        let second = h
            .objects
            .get(&composite_key(COMPOSITE, TILE_ID, PERIOD, "B04"))
            .unwrap();
        assert_eq!(first, second);
        // Single-scene period: STK equals the scene's merge values.
        assert!(composite_pixels(&h, "B04").iter().all(|&v| v == 1234));
    }

    // One merge fails terminally: blend proceeds with the survivors.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn partial_merge_failure_still_publishes() {
        let dir = tempfile::tempdir().unwrap();
        let (band1, quality1) = write_scene(dir.path(), "S2A_D05", 100, 0);
        let (_, quality2) = write_scene(dir.path(), "S2A_D15", 200, 0);
        let h = harness(vec![
            scene("S2A_D05", "2019-01-05", &band1, &quality1),
            // Band asset path does not exist: that merge errors terminally.
            scene("S2A_D15", "2019-01-15", "/nonexistent/B04.tif", &quality2),
        ]);

        h.orchestrator.start_build(build_request(false)).await.unwrap();
        wait_terminal(&h.ledger).await;

        let errors = h
            .ledger
            .activities_by_datacube(IRREGULAR)
            .unwrap()
            .into_iter()
            .filter(|a| a.mystatus == ActivityStatus::Error)
            .count();
        assert_eq!(errors, 1);

        // Day-5 values survive; the publish still went through.
        assert!(composite_pixels(&h, "B04").iter().all(|&v| v == 100));
        assert_eq!(h.meta.count_items(COMPOSITE).unwrap(), 1);
        let publish = h
            .ledger
            .activities_for(COMPOSITE, TILE_ID, PERIOD, ActivityAction::Publish)
            .unwrap()
            .remove(0);
        assert_eq!(publish.mystatus, ActivityStatus::Done);
    }

    // Every merge fails: downstream inherits ERROR("no merges").
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn total_merge_failure_fails_downstream() {
        let h = harness(vec![
            scene("S2A_D05", "2019-01-05", "/nope/B04.tif", "/nope/quality.tif"),
        ]);

        h.orchestrator.start_build(build_request(false)).await.unwrap();
        wait_terminal(&h.ledger).await;

        for blend in h
            .ledger
            .activities_for(COMPOSITE, TILE_ID, PERIOD, ActivityAction::Blend)
            .unwrap()
        {
            assert_eq!(blend.mystatus, ActivityStatus::Error);
            assert_eq!(blend.error_msg.as_deref(), Some("no merges"));
        }
        let publish = h
            .ledger
            .activities_for(COMPOSITE, TILE_ID, PERIOD, ActivityAction::Publish)
            .unwrap()
            .remove(0);
        assert_eq!(publish.mystatus, ActivityStatus::Error);
        assert_eq!(h.meta.count_items(COMPOSITE).unwrap(), 0);
        assert!(
            !h.objects
                .exists(&composite_key(COMPOSITE, TILE_ID, PERIOD, "B04"))
                .unwrap()
        );
    }

    // Planner failures surface as typed errors before anything is enqueued.
    #[tokio::test]
    async fn plan_validation_errors() {
        let h = harness(Vec::new());

        let mut req = build_request(false);
        req.datacube = "missing_10_1M_STK".into();
        assert!(matches!(
            h.orchestrator.start_build(req).await,
            Err(CubeError::NotFound(_))
        ));

        let mut req = build_request(false);
        req.datacube = IRREGULAR.into();
        assert!(matches!(
            h.orchestrator.start_build(req).await,
            Err(CubeError::Validation(_))
        ));

        let mut req = build_request(false);
        req.tiles = vec!["999999".into()];
        assert!(matches!(
            h.orchestrator.start_build(req).await,
            Err(CubeError::Validation(_))
        ));

        let mut req = build_request(false);
        req.start_date = "2019-02-01".into();
        req.end_date = Some("2019-01-01".into());
        assert!(matches!(
            h.orchestrator.start_build(req).await,
            Err(CubeError::Validation(_))
        ));

        // No scenes anywhere in the window.
        let req = build_request(false);
        assert!(matches!(
            h.orchestrator.start_build(req).await,
            Err(CubeError::Validation(_))
        ));
    }
}
