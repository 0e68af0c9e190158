use rusqlite::{Connection, OptionalExtension, params};
use std::sync::Mutex;

use crate::models::cube::{
    Band, BandKind, Collection, CollectionItem, CompositeFunction, GrsSchema, RasterSizeSchema,
    TemporalCompositionSchema, Tile,
};

/// Catalog of cubes, bands, grids and published items.
pub struct MetadataStore {
    conn: Mutex<Connection>,
}

impl MetadataStore {
    pub fn open(path: &str) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        let store = Self { conn: Mutex::new(conn) };
        store.run_migrations()?;
        Ok(store)
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn: Mutex::new(conn) };
        store.run_migrations()?;
        Ok(store)
    }

    fn run_migrations(&self) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS grs_schemas (
                id          TEXT PRIMARY KEY,
                description TEXT NOT NULL DEFAULT '',
                crs         TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS tiles (
                id            TEXT NOT NULL,
                grs_schema_id TEXT NOT NULL REFERENCES grs_schemas(id),
                geom_wgs84    TEXT NOT NULL,
                geom          TEXT NOT NULL,
                min_x         REAL NOT NULL,
                max_y         REAL NOT NULL,
                PRIMARY KEY (id, grs_schema_id)
            );

            CREATE TABLE IF NOT EXISTS raster_size_schemas (
                id            TEXT PRIMARY KEY,
                raster_size_x INTEGER NOT NULL,
                raster_size_y INTEGER NOT NULL,
                chunk_size_x  INTEGER NOT NULL,
                chunk_size_y  INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS temporal_composition_schemas (
                id                      TEXT PRIMARY KEY,
                temporal_schema         TEXT NOT NULL,
                temporal_composite_t    TEXT NOT NULL DEFAULT '',
                temporal_composite_unit TEXT NOT NULL DEFAULT ''
            );

            CREATE TABLE IF NOT EXISTS composite_functions (
                id          TEXT PRIMARY KEY,
                description TEXT NOT NULL DEFAULT ''
            );

            CREATE TABLE IF NOT EXISTS collections (
                id                              TEXT PRIMARY KEY,
                is_cube                         INTEGER NOT NULL DEFAULT 0,
                grs_schema_id                   TEXT NOT NULL,
                raster_size_schema_id           TEXT NOT NULL,
                temporal_composition_schema_id  TEXT NOT NULL,
                composite_function_id           TEXT NOT NULL,
                bands_quicklook                 TEXT NOT NULL DEFAULT '[]',
                license                         TEXT NOT NULL DEFAULT '',
                description                     TEXT NOT NULL DEFAULT ''
            );

            CREATE TABLE IF NOT EXISTS bands (
                name          TEXT NOT NULL,
                collection_id TEXT NOT NULL REFERENCES collections(id),
                kind          TEXT NOT NULL CHECK(kind IN ('reflectance','quality','index','observation')),
                data_type     TEXT NOT NULL,
                min           INTEGER NOT NULL,
                max           INTEGER NOT NULL,
                fill          INTEGER NOT NULL,
                scale         REAL NOT NULL,
                resolution_x  REAL NOT NULL,
                resolution_y  REAL NOT NULL,
                common_name   TEXT NOT NULL,
                PRIMARY KEY (name, collection_id)
            );

            CREATE TABLE IF NOT EXISTS collection_items (
                id              TEXT PRIMARY KEY,
                collection_id   TEXT NOT NULL,
                tile_id         TEXT NOT NULL,
                item_date       TEXT NOT NULL,
                composite_start TEXT NOT NULL,
                composite_end   TEXT NOT NULL,
                quicklook       TEXT NOT NULL,
                assets          TEXT NOT NULL DEFAULT '{}'
            );
            CREATE INDEX IF NOT EXISTS idx_items_collection
                ON collection_items(collection_id, item_date DESC);

            CREATE TABLE IF NOT EXISTS buckets (
                name       TEXT PRIMARY KEY,
                created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now'))
            );

            INSERT OR IGNORE INTO composite_functions (id, description) VALUES
                ('IDENTITY', 'No temporal reduction (per-scene cube)'),
                ('MED', 'Median of valid observations'),
                ('STK', 'Best pixel stack (latest valid observation)');

            INSERT OR IGNORE INTO temporal_composition_schemas
                (id, temporal_schema, temporal_composite_t, temporal_composite_unit)
                VALUES ('Anull', 'A', 'null', '');
            ",
        )?;
        Ok(())
    }

    // ── Grid schemas ──

    pub fn grs_exists(&self, id: &str) -> anyhow::Result<bool> {
        let conn = self.conn.lock().unwrap();
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM grs_schemas WHERE id = ?1", params![id], |r| {
                r.get(0)
            })?;
        Ok(count > 0)
    }

    pub fn create_grs(&self, grs: &GrsSchema, tiles: &[Tile]) -> anyhow::Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO grs_schemas (id, description, crs) VALUES (?1, ?2, ?3)",
            params![grs.id, grs.description, grs.crs],
        )?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO tiles (id, grs_schema_id, geom_wgs84, geom, min_x, max_y)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for tile in tiles {
                stmt.execute(params![
                    tile.id,
                    tile.grs_schema_id,
                    tile.geom_wgs84,
                    tile.geom,
                    tile.min_x,
                    tile.max_y
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn get_grs(&self, id: &str) -> anyhow::Result<Option<GrsSchema>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT id, description, crs FROM grs_schemas WHERE id = ?1",
                params![id],
                |r| {
                    Ok(GrsSchema {
                        id: r.get(0)?,
                        description: r.get(1)?,
                        crs: r.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn list_grs(&self) -> anyhow::Result<Vec<GrsSchema>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT id, description, crs FROM grs_schemas ORDER BY id")?;
        let rows = stmt
            .query_map([], |r| {
                Ok(GrsSchema {
                    id: r.get(0)?,
                    description: r.get(1)?,
                    crs: r.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn list_tiles(&self, grs_id: &str) -> anyhow::Result<Vec<Tile>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, grs_schema_id, geom_wgs84, geom, min_x, max_y
             FROM tiles WHERE grs_schema_id = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![grs_id], map_tile)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn get_tile(&self, grs_id: &str, tile_id: &str) -> anyhow::Result<Option<Tile>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT id, grs_schema_id, geom_wgs84, geom, min_x, max_y
                 FROM tiles WHERE grs_schema_id = ?1 AND id = ?2",
                params![grs_id, tile_id],
                map_tile,
            )
            .optional()?;
        Ok(row)
    }

    // ── Raster size schemas ──

    pub fn upsert_raster_size(&self, schema: &RasterSizeSchema) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO raster_size_schemas (id, raster_size_x, raster_size_y, chunk_size_x, chunk_size_y)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                raster_size_x = excluded.raster_size_x,
                raster_size_y = excluded.raster_size_y,
                chunk_size_x = excluded.chunk_size_x,
                chunk_size_y = excluded.chunk_size_y",
            params![
                schema.id,
                schema.raster_size_x,
                schema.raster_size_y,
                schema.chunk_size_x,
                schema.chunk_size_y
            ],
        )?;
        Ok(())
    }

    pub fn get_raster_size(&self, id: &str) -> anyhow::Result<Option<RasterSizeSchema>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT id, raster_size_x, raster_size_y, chunk_size_x, chunk_size_y
                 FROM raster_size_schemas WHERE id = ?1",
                params![id],
                map_raster_size,
            )
            .optional()?;
        Ok(row)
    }

    pub fn list_raster_size(&self) -> anyhow::Result<Vec<RasterSizeSchema>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, raster_size_x, raster_size_y, chunk_size_x, chunk_size_y
             FROM raster_size_schemas ORDER BY id",
        )?;
        let rows = stmt
            .query_map([], map_raster_size)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ── Temporal composition schemas ──

    pub fn create_temporal_schema(&self, schema: &TemporalCompositionSchema) -> anyhow::Result<bool> {
        let conn = self.conn.lock().unwrap();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO temporal_composition_schemas
                (id, temporal_schema, temporal_composite_t, temporal_composite_unit)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                schema.id,
                schema.temporal_schema,
                schema.temporal_composite_t,
                schema.temporal_composite_unit
            ],
        )?;
        Ok(inserted > 0)
    }

    pub fn get_temporal_schema(&self, id: &str) -> anyhow::Result<Option<TemporalCompositionSchema>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT id, temporal_schema, temporal_composite_t, temporal_composite_unit
                 FROM temporal_composition_schemas WHERE id = ?1",
                params![id],
                |r| {
                    Ok(TemporalCompositionSchema {
                        id: r.get(0)?,
                        temporal_schema: r.get(1)?,
                        temporal_composite_t: r.get(2)?,
                        temporal_composite_unit: r.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn list_temporal_schemas(&self) -> anyhow::Result<Vec<TemporalCompositionSchema>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, temporal_schema, temporal_composite_t, temporal_composite_unit
             FROM temporal_composition_schemas ORDER BY id",
        )?;
        let rows = stmt
            .query_map([], |r| {
                Ok(TemporalCompositionSchema {
                    id: r.get(0)?,
                    temporal_schema: r.get(1)?,
                    temporal_composite_t: r.get(2)?,
                    temporal_composite_unit: r.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn list_composite_functions(&self) -> anyhow::Result<Vec<CompositeFunction>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT id, description FROM composite_functions ORDER BY id")?;
        let rows = stmt
            .query_map([], |r| {
                Ok(CompositeFunction {
                    id: r.get(0)?,
                    description: r.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ── Collections and bands ──

    /// Insert a collection unless it already exists. Returns false if present.
    pub fn create_collection(&self, c: &Collection) -> anyhow::Result<bool> {
        let conn = self.conn.lock().unwrap();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO collections
                (id, is_cube, grs_schema_id, raster_size_schema_id,
                 temporal_composition_schema_id, composite_function_id,
                 bands_quicklook, license, description)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                c.id,
                c.is_cube,
                c.grs_schema_id,
                c.raster_size_schema_id,
                c.temporal_composition_schema_id,
                c.composite_function_id,
                serde_json::to_string(&c.bands_quicklook)?,
                c.license,
                c.description
            ],
        )?;
        Ok(inserted > 0)
    }

    pub fn get_collection(&self, id: &str) -> anyhow::Result<Option<Collection>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT id, is_cube, grs_schema_id, raster_size_schema_id,
                        temporal_composition_schema_id, composite_function_id,
                        bands_quicklook, license, description
                 FROM collections WHERE id = ?1",
                params![id],
                map_collection,
            )
            .optional()?;
        Ok(row)
    }

    pub fn list_cubes(&self) -> anyhow::Result<Vec<Collection>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, is_cube, grs_schema_id, raster_size_schema_id,
                    temporal_composition_schema_id, composite_function_id,
                    bands_quicklook, license, description
             FROM collections WHERE is_cube = 1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map([], map_collection)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn insert_bands(&self, bands: &[Band]) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "INSERT OR IGNORE INTO bands
                (name, collection_id, kind, data_type, min, max, fill, scale,
                 resolution_x, resolution_y, common_name)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        )?;
        for band in bands {
            stmt.execute(params![
                band.name,
                band.collection_id,
                kind_str(band.kind),
                band.data_type,
                band.min,
                band.max,
                band.fill,
                band.scale,
                band.resolution_x,
                band.resolution_y,
                band.common_name
            ])?;
        }
        Ok(())
    }

    pub fn bands_of(&self, collection_id: &str) -> anyhow::Result<Vec<Band>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT name, collection_id, kind, data_type, min, max, fill, scale,
                    resolution_x, resolution_y, common_name
             FROM bands WHERE collection_id = ?1 ORDER BY name",
        )?;
        let rows = stmt
            .query_map(params![collection_id], map_band)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ── Collection items ──

    pub fn upsert_item(&self, item: &CollectionItem) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO collection_items
                (id, collection_id, tile_id, item_date, composite_start, composite_end, quicklook, assets)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(id) DO UPDATE SET
                quicklook = excluded.quicklook,
                assets = excluded.assets",
            params![
                item.id,
                item.collection_id,
                item.tile_id,
                item.item_date,
                item.composite_start,
                item.composite_end,
                item.quicklook,
                item.assets.to_string()
            ],
        )?;
        Ok(())
    }

    pub fn delete_item(&self, collection_id: &str, tile_id: &str, composite_start: &str) -> anyhow::Result<usize> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "DELETE FROM collection_items
             WHERE collection_id = ?1 AND tile_id = ?2 AND composite_start = ?3",
            params![collection_id, tile_id, composite_start],
        )?;
        Ok(n)
    }

    pub fn count_items(&self, collection_id: &str) -> anyhow::Result<usize> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM collection_items WHERE collection_id = ?1",
            params![collection_id],
            |r| r.get(0),
        )?;
        Ok(count as usize)
    }

    /// `(min composite_start, max composite_end)` over published items.
    pub fn item_extent(&self, collection_id: &str) -> anyhow::Result<Option<(String, String)>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT MIN(composite_start), MAX(composite_end)
                 FROM collection_items WHERE collection_id = ?1",
                params![collection_id],
                |r| {
                    let min: Option<String> = r.get(0)?;
                    let max: Option<String> = r.get(1)?;
                    Ok(min.zip(max))
                },
            )
            .optional()?;
        Ok(row.flatten())
    }

    pub fn list_item_tiles(&self, collection_id: &str) -> anyhow::Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT tile_id FROM collection_items
             WHERE collection_id = ?1 GROUP BY tile_id ORDER BY tile_id",
        )?;
        let rows = stmt
            .query_map(params![collection_id], |r| r.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn list_items(
        &self,
        collection_id: &str,
        tiles: Option<&[String]>,
        start: Option<&str>,
        end: Option<&str>,
        page: u32,
        per_page: u32,
    ) -> anyhow::Result<(Vec<CollectionItem>, usize)> {
        // An explicit tile filter that names no tiles matches nothing.
        if tiles.is_some_and(|t| t.is_empty()) {
            return Ok((Vec::new(), 0));
        }

        let conn = self.conn.lock().unwrap();

        let mut where_sql = "collection_id = ?1".to_string();
        let mut param_values: Vec<Box<dyn rusqlite::types::ToSql>> =
            vec![Box::new(collection_id.to_string())];

        if let Some(start) = start {
            where_sql.push_str(&format!(" AND composite_start >= ?{}", param_values.len() + 1));
            param_values.push(Box::new(start.to_string()));
        }
        if let Some(end) = end {
            where_sql.push_str(&format!(" AND composite_end <= ?{}", param_values.len() + 1));
            param_values.push(Box::new(end.to_string()));
        }
        if let Some(tiles) = tiles {
            let placeholders: Vec<String> = tiles
                .iter()
                .map(|tile| {
                    param_values.push(Box::new(tile.clone()));
                    format!("?{}", param_values.len())
                })
                .collect();
            where_sql.push_str(&format!(" AND tile_id IN ({})", placeholders.join(",")));
        }

        let params_ref: Vec<&dyn rusqlite::types::ToSql> =
            param_values.iter().map(|p| p.as_ref()).collect();

        let total: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM collection_items WHERE {where_sql}"),
            params_ref.as_slice(),
            |r| r.get(0),
        )?;

        let per_page = per_page.max(1);
        let offset = (page.max(1) - 1) * per_page;
        let mut stmt = conn.prepare(&format!(
            "SELECT id, collection_id, tile_id, item_date, composite_start, composite_end, quicklook, assets
             FROM collection_items WHERE {where_sql}
             ORDER BY item_date DESC LIMIT {per_page} OFFSET {offset}"
        ))?;
        let rows = stmt
            .query_map(params_ref.as_slice(), map_item)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok((rows, total as usize))
    }

    // ── Buckets ──

    /// Returns false if the bucket name is already registered.
    pub fn create_bucket(&self, name: &str) -> anyhow::Result<bool> {
        let conn = self.conn.lock().unwrap();
        let inserted =
            conn.execute("INSERT OR IGNORE INTO buckets (name) VALUES (?1)", params![name])?;
        Ok(inserted > 0)
    }

    pub fn list_buckets(&self) -> anyhow::Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT name FROM buckets ORDER BY name")?;
        let rows = stmt
            .query_map([], |r| r.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

fn kind_str(kind: BandKind) -> &'static str {
    match kind {
        BandKind::Reflectance => "reflectance",
        BandKind::Quality => "quality",
        BandKind::Index => "index",
        BandKind::Observation => "observation",
    }
}

fn parse_kind(s: &str) -> BandKind {
    match s {
        "quality" => BandKind::Quality,
        "index" => BandKind::Index,
        "observation" => BandKind::Observation,
        _ => BandKind::Reflectance,
    }
}

fn map_tile(r: &rusqlite::Row<'_>) -> rusqlite::Result<Tile> {
    Ok(Tile {
        id: r.get(0)?,
        grs_schema_id: r.get(1)?,
        geom_wgs84: r.get(2)?,
        geom: r.get(3)?,
        min_x: r.get(4)?,
        max_y: r.get(5)?,
    })
}

fn map_raster_size(r: &rusqlite::Row<'_>) -> rusqlite::Result<RasterSizeSchema> {
    Ok(RasterSizeSchema {
        id: r.get(0)?,
        raster_size_x: r.get(1)?,
        raster_size_y: r.get(2)?,
        chunk_size_x: r.get(3)?,
        chunk_size_y: r.get(4)?,
    })
}

fn map_collection(r: &rusqlite::Row<'_>) -> rusqlite::Result<Collection> {
    let quicklook: String = r.get(6)?;
    Ok(Collection {
        id: r.get(0)?,
        is_cube: r.get(1)?,
        grs_schema_id: r.get(2)?,
        raster_size_schema_id: r.get(3)?,
        temporal_composition_schema_id: r.get(4)?,
        composite_function_id: r.get(5)?,
        bands_quicklook: serde_json::from_str(&quicklook).unwrap_or_default(),
        license: r.get(7)?,
        description: r.get(8)?,
    })
}

fn map_band(r: &rusqlite::Row<'_>) -> rusqlite::Result<Band> {
    let kind: String = r.get(2)?;
    Ok(Band {
        name: r.get(0)?,
        collection_id: r.get(1)?,
        kind: parse_kind(&kind),
        data_type: r.get(3)?,
        min: r.get(4)?,
        max: r.get(5)?,
        fill: r.get(6)?,
        scale: r.get(7)?,
        resolution_x: r.get(8)?,
        resolution_y: r.get(9)?,
        common_name: r.get(10)?,
    })
}

fn map_item(r: &rusqlite::Row<'_>) -> rusqlite::Result<CollectionItem> {
    let assets: String = r.get(7)?;
    Ok(CollectionItem {
        id: r.get(0)?,
        collection_id: r.get(1)?,
        tile_id: r.get(2)?,
        item_date: r.get(3)?,
        composite_start: r.get(4)?,
        composite_end: r.get(5)?,
        quicklook: r.get(6)?,
        assets: serde_json::from_str(&assets).unwrap_or(serde_json::Value::Null),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::cube::BandKind;

    #[test]
    fn create_collection_is_idempotent() {
        let store = MetadataStore::open_in_memory().unwrap();
        let c = Collection {
            id: "mc_10_1M_STK".into(),
            is_cube: true,
            grs_schema_id: "aea250".into(),
            raster_size_schema_id: "aea250-10".into(),
            temporal_composition_schema_id: "M1month".into(),
            composite_function_id: "STK".into(),
            bands_quicklook: vec!["B04".into(), "B03".into(), "B02".into()],
            license: "MIT".into(),
            description: String::new(),
        };
        assert!(store.create_collection(&c).unwrap());
        assert!(!store.create_collection(&c).unwrap());
        let got = store.get_collection("mc_10_1M_STK").unwrap().unwrap();
        assert_eq!(got.bands_quicklook, c.bands_quicklook);
    }

    #[test]
    fn bands_round_trip_kind() {
        let store = MetadataStore::open_in_memory().unwrap();
        let bands = vec![
            Band::with_defaults("B04", "c_10", BandKind::Reflectance, 10.0),
            Band::with_defaults("quality", "c_10", BandKind::Quality, 10.0),
            Band::with_defaults("PROVENANCE", "c_10", BandKind::Observation, 10.0),
        ];
        store.insert_bands(&bands).unwrap();
        let got = store.bands_of("c_10").unwrap();
        assert_eq!(got.len(), 3);
        let prov = got.iter().find(|b| b.name == "PROVENANCE").unwrap();
        assert_eq!(prov.kind, BandKind::Observation);
        assert_eq!(prov.fill, -1);
        let quality = got.iter().find(|b| b.name == "quality").unwrap();
        assert_eq!(quality.fill, 255);
    }

    #[test]
    fn item_listing_filters_and_pages() {
        let store = MetadataStore::open_in_memory().unwrap();
        for (i, tile) in ["003003", "003004", "003003"].iter().enumerate() {
            store
                .upsert_item(&CollectionItem {
                    id: format!("item-{i}"),
                    collection_id: "mc_10_1M_STK".into(),
                    tile_id: (*tile).into(),
                    item_date: format!("2019-0{}-01", i + 1),
                    composite_start: format!("2019-0{}-01", i + 1),
                    composite_end: format!("2019-0{}-28", i + 1),
                    quicklook: "items/q.png".into(),
                    assets: serde_json::json!({}),
                })
                .unwrap();
        }
        let tiles = vec!["003003".to_string()];
        let (items, total) = store
            .list_items("mc_10_1M_STK", Some(&tiles), None, None, 1, 10)
            .unwrap();
        assert_eq!(total, 2);
        assert!(items.iter().all(|i| i.tile_id == "003003"));

        let (page, total) = store
            .list_items("mc_10_1M_STK", None, None, None, 2, 2)
            .unwrap();
        assert_eq!(total, 3);
        assert_eq!(page.len(), 1);

        let (items, total) = store
            .list_items("mc_10_1M_STK", None, Some("2019-02-01"), Some("2019-02-28"), 1, 10)
            .unwrap();
        assert_eq!(total, 1);
        assert_eq!(items[0].item_date, "2019-02-01");

        // An explicit filter naming no tiles matches nothing instead of
        // producing a malformed IN () clause.
        let (items, total) = store
            .list_items("mc_10_1M_STK", Some(&[]), None, None, 1, 10)
            .unwrap();
        assert!(items.is_empty());
        assert_eq!(total, 0);

        // Filter values are bound, not spliced into the SQL text.
        let hostile = vec!["x' OR '1'='1".to_string()];
        let (items, total) = store
            .list_items("mc_10_1M_STK", Some(&hostile), None, None, 1, 10)
            .unwrap();
        assert!(items.is_empty());
        assert_eq!(total, 0);
    }
}
