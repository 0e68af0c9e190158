//! Grid-reference-system generation and the build cost model.
//!
//! Pure geometry: spherical sinusoidal and Albers equal-area transforms
//! stand in for a full projection library, which is all the tiling math
//! needs. Tiles are `HHHVVV`-indexed cells of a world grid anchored so
//! that cell (hBase, vBase) sits at the projection of (0°, 0°).

use crate::error::{CubeError, Result};
use crate::models::cube::{GrsSchema, RasterSizeSchema, Tile};
use crate::timeline::{TemporalSchema, decode_periods, parse_date};

const SPHERE_RADIUS: f64 = 6_371_007.181;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Projection {
    LongLat,
    /// Albers equal-area, standard parallels 10 / -40 (spherical form).
    Albers { meridian: f64 },
    Sinusoidal,
}

impl Projection {
    pub fn parse(name: &str, meridian: f64) -> Result<Self> {
        match name {
            "longlat" => Ok(Projection::LongLat),
            "aea" => Ok(Projection::Albers { meridian }),
            "sinu" => Ok(Projection::Sinusoidal),
            other => Err(CubeError::Validation(format!("unknown projection '{other}'"))),
        }
    }

    pub fn crs(&self) -> String {
        match self {
            Projection::LongLat => {
                "+proj=longlat +ellps=WGS84 +datum=WGS84 +no_defs".to_string()
            }
            Projection::Albers { meridian } => format!(
                "+proj=aea +lat_1=10 +lat_2=-40 +lat_0=0 +lon_0={meridian} +x_0=0 +y_0=0 \
                 +ellps=WGS84 +datum=WGS84 +units=m +no_defs"
            ),
            Projection::Sinusoidal => format!(
                "+proj=sinu +lon_0={} +x_0=0 +y_0=0 +a={SPHERE_RADIUS} +b={SPHERE_RADIUS} \
                 +units=m +no_defs",
                0.0
            ),
        }
    }

    /// Forward transform, degrees -> projected units.
    pub fn forward(&self, lon: f64, lat: f64) -> (f64, f64) {
        match *self {
            Projection::LongLat => (lon, lat),
            Projection::Sinusoidal => {
                let (lam, phi) = (lon.to_radians(), lat.to_radians());
                (SPHERE_RADIUS * lam * phi.cos(), SPHERE_RADIUS * phi)
            }
            Projection::Albers { meridian } => {
                let (phi1, phi2) = (10f64.to_radians(), (-40f64).to_radians());
                let n = (phi1.sin() + phi2.sin()) / 2.0;
                let c = phi1.cos().powi(2) + 2.0 * n * phi1.sin();
                let rho0 = SPHERE_RADIUS * (c - 2.0 * n * 0.0).sqrt() / n;
                let phi = lat.to_radians();
                let theta = n * (lon - meridian).to_radians();
                let rho = SPHERE_RADIUS * (c - 2.0 * n * phi.sin()).sqrt() / n;
                (rho * theta.sin(), rho0 - rho * theta.cos())
            }
        }
    }

    /// Inverse transform, projected units -> degrees.
    pub fn inverse(&self, x: f64, y: f64) -> (f64, f64) {
        match *self {
            Projection::LongLat => (x, y),
            Projection::Sinusoidal => {
                let phi = y / SPHERE_RADIUS;
                let lam = if phi.cos().abs() < 1e-12 {
                    0.0
                } else {
                    x / (SPHERE_RADIUS * phi.cos())
                };
                (lam.to_degrees(), phi.to_degrees())
            }
            Projection::Albers { meridian } => {
                let (phi1, phi2) = (10f64.to_radians(), (-40f64).to_radians());
                let n = (phi1.sin() + phi2.sin()) / 2.0;
                let c = phi1.cos().powi(2) + 2.0 * n * phi1.sin();
                let rho0 = SPHERE_RADIUS * c.sqrt() / n;
                let rho = (x * x + (rho0 - y) * (rho0 - y)).sqrt();
                let theta = x.atan2(rho0 - y);
                let phi = ((c - (rho * n / SPHERE_RADIUS).powi(2)) / (2.0 * n)).asin();
                (meridian + (theta / n).to_degrees(), phi.to_degrees())
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BoundingBox {
    pub w: f64,
    pub n: f64,
    pub e: f64,
    pub s: f64,
}

impl BoundingBox {
    /// Parse `w,n,e,s` degrees.
    pub fn parse(s: &str) -> Result<Self> {
        let parts: Vec<f64> = s
            .split(',')
            .map(|p| p.trim().parse::<f64>())
            .collect::<std::result::Result<_, _>>()
            .map_err(|_| CubeError::Validation(format!("bad bbox '{s}'")))?;
        if parts.len() != 4 {
            return Err(CubeError::Validation(format!("bad bbox '{s}', expected w,n,e,s")));
        }
        Ok(BoundingBox {
            w: parts[0],
            n: parts[1],
            e: parts[2],
            s: parts[3],
        })
    }
}

fn wkt_polygon(points: &[(f64, f64)]) -> String {
    let coords: Vec<String> = points
        .iter()
        .chain(std::iter::once(&points[0]))
        .map(|(x, y)| format!("{x} {y}"))
        .collect();
    format!("POLYGON(({}))", coords.join(","))
}

/// Generate a grid schema and its tiles over a bounding box.
pub fn create_grs(
    name: &str,
    description: &str,
    projection: Projection,
    meridian: f64,
    degreesx: f64,
    degreesy: f64,
    bbox: BoundingBox,
) -> Result<(GrsSchema, Vec<Tile>)> {
    if degreesx <= 0.0 || degreesy <= 0.0 {
        return Err(CubeError::Validation("tile size must be positive".into()));
    }

    let numtilesx = (360.0 / degreesx) as i64;
    let numtilesy = (180.0 / degreesy) as i64;
    let h_base = numtilesx / 2;
    let v_base = numtilesy / 2;

    // Tile size in projected units at the system center (meridian, 0).
    let (x1, _) = projection.forward(meridian - degreesx / 2.0, 0.0);
    let (x2, _) = projection.forward(meridian + degreesx / 2.0, 0.0);
    let (_, y1) = projection.forward(meridian, -degreesy / 2.0);
    let (_, y2) = projection.forward(meridian, degreesy / 2.0);
    let dx = x2 - x1;
    let dy = y2 - y1;

    // Grid anchor: top-left corner of tile (h_base, v_base) at lon/lat 0.
    let (x_center, y_center) = projection.forward(0.0, 0.0);
    let x_min = x_center - dx * h_base as f64;
    let y_max = y_center + dy * v_base as f64;

    // Tile index range covering the bbox.
    let (xl, _) = projection.forward(bbox.w, 0.0);
    let (xr, _) = projection.forward(bbox.e, 0.0);
    let (_, yu) = projection.forward(meridian, bbox.n);
    let (_, yb) = projection.forward(meridian, bbox.s);
    let h_min = ((xl - x_min) / dx).floor() as i64;
    let h_max = ((xr - x_min) / dx).floor() as i64;
    let v_min = ((y_max - yu) / dy).floor() as i64;
    let v_max = ((y_max - yb) / dy).floor() as i64;

    tracing::info!(
        "grs {name}: h {h_min}..{h_max} v {v_min}..{v_max} dx {dx:.1} dy {dy:.1}"
    );

    let grs = GrsSchema {
        id: name.to_string(),
        description: description.to_string(),
        crs: projection.crs(),
    };

    let mut tiles = Vec::new();
    for ih in h_min..=h_max {
        let tx1 = x_min + ih as f64 * dx;
        let tx2 = tx1 + dx;
        for iv in v_min..=v_max {
            let ty1 = y_max - iv as f64 * dy;
            let ty2 = ty1 - dy;

            let corners_proj = [(tx1, ty1), (tx2, ty1), (tx2, ty2), (tx1, ty2)];
            let corners_wgs: Vec<(f64, f64)> = corners_proj
                .iter()
                .map(|&(x, y)| projection.inverse(x, y))
                .collect();

            tiles.push(Tile {
                id: format!("{ih:03}{iv:03}"),
                grs_schema_id: name.to_string(),
                geom_wgs84: wkt_polygon(&corners_wgs),
                geom: wkt_polygon(&[(tx1, ty2), (tx2, ty2), (tx2, ty1), (tx1, ty1)]),
                min_x: tx1,
                max_y: ty1,
            });
        }
    }

    Ok((grs, tiles))
}

/// Projected extent of a tile, `(min_x, max_x, min_y, max_y)`, recovered
/// from its stored WKT polygon.
pub fn tile_extent(tile: &Tile) -> Result<(f64, f64, f64, f64)> {
    let inner = tile
        .geom
        .trim()
        .strip_prefix("POLYGON((")
        .and_then(|s| s.strip_suffix("))"))
        .ok_or_else(|| CubeError::DataError(format!("bad tile geometry '{}'", tile.geom)))?;
    let mut min_x = f64::MAX;
    let mut max_x = f64::MIN;
    let mut min_y = f64::MAX;
    let mut max_y = f64::MIN;
    for pair in inner.split(',') {
        let mut it = pair.split_whitespace();
        let x: f64 = it
            .next()
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| CubeError::DataError("bad tile vertex".into()))?;
        let y: f64 = it
            .next()
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| CubeError::DataError("bad tile vertex".into()))?;
        min_x = min_x.min(x);
        max_x = max_x.max(x);
        min_y = min_y.min(y);
        max_y = max_y.max(y);
    }
    Ok((min_x, max_x, min_y, max_y))
}

/// WGS-84 bounding box of a tile, `(w, s, e, n)`, for STAC intersection.
pub fn tile_bbox_wgs84(tile: &Tile) -> Result<(f64, f64, f64, f64)> {
    let shadow = Tile {
        geom: tile.geom_wgs84.clone(),
        ..tile.clone()
    };
    let (min_x, max_x, min_y, max_y) = tile_extent(&shadow)?;
    Ok((min_x, min_y, max_x, max_y))
}

/// Derive the pixel dimensions of a tile at a resolution.
pub fn derive_raster_size(
    grs_schema: &str,
    tile: &Tile,
    resolution: u32,
    chunk_size_x: u32,
    chunk_size_y: u32,
) -> Result<RasterSizeSchema> {
    if resolution == 0 {
        return Err(CubeError::Validation("resolution must be positive".into()));
    }
    let (min_x, max_x, min_y, max_y) = tile_extent(tile)?;
    Ok(RasterSizeSchema {
        id: format!("{grs_schema}-{resolution}"),
        raster_size_x: ((max_x - min_x) / f64::from(resolution)).round() as u32,
        raster_size_y: ((max_y - min_y) / f64::from(resolution)).round() as u32,
        chunk_size_x,
        chunk_size_y,
    })
}

/// Mean revisit interval in days.
pub fn revisit_by_satellite(satellite: &str) -> Result<f64> {
    match satellite {
        "LC8" | "Landsat-8" => Ok(16.0),
        "S2" | "Sentinel-2" => Ok(5.0),
        "CB4" | "CBERS-4" => Ok(26.0),
        "CB4_AWFI" => Ok(5.0),
        other => Err(CubeError::Validation(format!("unknown satellite '{other}'"))),
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct CostEstimate {
    pub storage: StorageEstimate,
    pub build: BuildEstimate,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct StorageEstimate {
    pub size_cubes: u64,
    pub price_cubes: u64,
    pub size_irregular_cube: u64,
    pub price_irregular_cube: u64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct BuildEstimate {
    pub quantity_merges: u64,
    pub quantity_blends: u64,
    pub quantity_publish: u64,
    pub collection_items_irregular: u64,
    pub collection_items: u64,
    pub price_merges: u64,
    pub price_blends: u64,
    pub price_publish: u64,
}

/// Storage and processing cost model. Composite artifacts are assumed COG
/// with deflate at a 50% size overhead; storage priced at 0.024 $/GB.
#[allow(clippy::too_many_arguments)]
pub fn estimate_cost(
    satellite: &str,
    resolution: u32,
    tile: &Tile,
    start_date: &str,
    last_date: &str,
    quantity_bands: u32,
    quantity_tiles: u32,
    t_schema: &str,
    t_step: u32,
) -> Result<CostEstimate> {
    let raster = derive_raster_size("est", tile, resolution, 256, 256)?;
    // int16 samples, MiB per band per tile.
    let size_tile_mb =
        (f64::from(raster.raster_size_x) * f64::from(raster.raster_size_y) * 2.0) / 1024.0 / 1024.0;

    let schema = match t_schema {
        "M" => TemporalSchema::Monthly,
        _ => TemporalSchema::Cyclic { step_days: t_step },
    };
    let start = parse_date(start_date)?;
    let last = parse_date(last_date)?;
    let len_periods = decode_periods(schema, start, last)?.len() as f64;

    let cube_size_mb =
        size_tile_mb * f64::from(quantity_bands) * f64::from(quantity_tiles) * len_periods;
    let cube_size_gb = (cube_size_mb * 1.5) / 1024.0;
    let cubes_size_gb = cube_size_gb * 2.0;
    let price_cubes_storage = cubes_size_gb * 0.024;

    let revisit = revisit_by_satellite(satellite)?;
    let scenes = (last - start).num_days() as f64 / revisit;
    let irregular_gb =
        (size_tile_mb * f64::from(quantity_bands) * f64::from(quantity_tiles) * scenes) / 1024.0;
    let price_irregular = irregular_gb * 0.024;

    let quantity_merges = f64::from(quantity_bands) * f64::from(quantity_tiles) * scenes;
    let quantity_blends = f64::from(quantity_bands) * f64::from(quantity_tiles) * len_periods;
    let quantity_publish = len_periods;

    Ok(CostEstimate {
        storage: StorageEstimate {
            size_cubes: cubes_size_gb as u64,
            price_cubes: price_cubes_storage as u64,
            size_irregular_cube: irregular_gb as u64,
            price_irregular_cube: price_irregular as u64,
        },
        build: BuildEstimate {
            quantity_merges: quantity_merges as u64,
            quantity_blends: quantity_blends as u64,
            quantity_publish: quantity_publish as u64,
            collection_items_irregular: (f64::from(quantity_tiles) * scenes) as u64,
            collection_items: (f64::from(quantity_tiles) * len_periods * 2.0) as u64,
            price_merges: (quantity_merges / 100.0 * 0.23) as u64,
            price_blends: (quantity_blends / 100.0 * 1.20) as u64,
            price_publish: (quantity_publish / 100.0 * 0.03) as u64,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sinusoidal_round_trips() {
        let proj = Projection::Sinusoidal;
        for &(lon, lat) in &[(-54.0, -12.5), (0.0, 0.0), (30.0, 45.0)] {
            let (x, y) = proj.forward(lon, lat);
            let (lon2, lat2) = proj.inverse(x, y);
            assert!((lon - lon2).abs() < 1e-6, "{lon} vs {lon2}");
            assert!((lat - lat2).abs() < 1e-6);
        }
    }

    #[test]
    fn albers_round_trips() {
        let proj = Projection::Albers { meridian: -54.0 };
        for &(lon, lat) in &[(-54.0, 0.0), (-40.0, -20.0), (-70.0, 5.0)] {
            let (x, y) = proj.forward(lon, lat);
            let (lon2, lat2) = proj.inverse(x, y);
            assert!((lon - lon2).abs() < 1e-6);
            assert!((lat - lat2).abs() < 1e-6);
        }
    }

    #[test]
    fn grid_covers_bbox() {
        let bbox = BoundingBox::parse("-64.0,-10.0,-60.0,-14.0").unwrap();
        let (grs, tiles) = create_grs(
            "aea1deg",
            "test grid",
            Projection::Albers { meridian: -54.0 },
            -54.0,
            1.0,
            1.0,
            bbox,
        )
        .unwrap();
        assert_eq!(grs.id, "aea1deg");
        assert!(grs.crs.contains("+proj=aea"));
        assert!(!tiles.is_empty());
        // HHHVVV ids, all within the same grid.
        for tile in &tiles {
            assert_eq!(tile.id.len(), 6);
            assert_eq!(tile.grs_schema_id, "aea1deg");
            assert!(tile.geom.starts_with("POLYGON(("));
        }
        // Tiles are distinct.
        let mut ids: Vec<_> = tiles.iter().map(|t| t.id.clone()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), tiles.len());
    }

    #[test]
    fn raster_size_matches_tile_extent() {
        let bbox = BoundingBox::parse("-54.5,0.5,-53.5,-0.5").unwrap();
        let (_, tiles) = create_grs(
            "sinu1",
            "",
            Projection::Sinusoidal,
            0.0,
            1.0,
            1.0,
            bbox,
        )
        .unwrap();
        let schema = derive_raster_size("sinu1", &tiles[0], 64, 512, 512).unwrap();
        assert_eq!(schema.id, "sinu1-64");
        // A 1-degree sinusoidal tile at the equator is ~111 km across.
        let expect = (SPHERE_RADIUS * 1f64.to_radians() / 64.0).round() as u32;
        assert!((i64::from(schema.raster_size_x) - i64::from(expect)).abs() <= 1);
    }

    #[test]
    fn cost_estimate_counts_stages() {
        let bbox = BoundingBox::parse("-54.5,0.5,-53.5,-0.5").unwrap();
        let (_, tiles) =
            create_grs("sinu1", "", Projection::Sinusoidal, 0.0, 1.0, 1.0, bbox).unwrap();
        let est = estimate_cost(
            "S2",
            64,
            &tiles[0],
            "2019-01-01",
            "2019-12-31",
            4,
            2,
            "M",
            0,
        )
        .unwrap();
        // 12 monthly periods, 4 bands, 2 tiles.
        assert_eq!(est.build.quantity_blends, 96);
        assert_eq!(est.build.quantity_publish, 12);
        assert!(est.build.quantity_merges > 0);
    }

    #[test]
    fn unknown_satellite_is_validation_error() {
        assert!(revisit_by_satellite("VOYAGER").is_err());
    }
}
