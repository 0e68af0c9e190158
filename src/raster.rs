//! Single-band rasters: in-memory grid, inverse-warp resampling and
//! GeoTIFF encoding/decoding.
//!
//! Samples are held as `i32` regardless of the on-disk dtype so the
//! compositing kernels work over one representation; the `DataType` tag
//! picks the encoded sample format. Outputs are tiled into the object
//! store as deflate-compressed GeoTIFFs with ModelPixelScale/ModelTiepoint
//! georeferencing and, for composites, a half-resolution overview IFD.

use std::io::Cursor;

use tiff::decoder::{Decoder, DecodingResult};
use tiff::encoder::colortype;
use tiff::encoder::compression::Deflate;
use tiff::tags::Tag;

use crate::error::{CubeError, Result};

const TAG_MODEL_PIXEL_SCALE: u16 = 33550;
const TAG_MODEL_TIEPOINT: u16 = 33922;
const TAG_GDAL_NODATA: u16 = 42113;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    UInt8,
    Int16,
}

impl DataType {
    pub fn parse(s: &str) -> DataType {
        match s {
            "uint8" | "Uint8" => DataType::UInt8,
            _ => DataType::Int16,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resampling {
    /// Quality and categorical bands.
    Nearest,
    /// Reflectance bands.
    Bilinear,
}

/// North-up affine transform: `res_y` is the positive pixel height, rows
/// grow southward from `origin_y` (the top-left corner).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoTransform {
    pub origin_x: f64,
    pub origin_y: f64,
    pub res_x: f64,
    pub res_y: f64,
}

impl GeoTransform {
    /// Geographic coordinates of a pixel center.
    pub fn pixel_center(&self, col: f64, row: f64) -> (f64, f64) {
        (
            self.origin_x + (col + 0.5) * self.res_x,
            self.origin_y - (row + 0.5) * self.res_y,
        )
    }

    /// Fractional pixel position of a geographic point.
    pub fn to_pixel(&self, x: f64, y: f64) -> (f64, f64) {
        (
            (x - self.origin_x) / self.res_x - 0.5,
            (self.origin_y - y) / self.res_y - 0.5,
        )
    }
}

#[derive(Debug, Clone)]
pub struct Raster {
    pub width: u32,
    pub height: u32,
    pub transform: GeoTransform,
    pub dtype: DataType,
    pub fill: i32,
    pub pixels: Vec<i32>,
}

impl Raster {
    pub fn filled(width: u32, height: u32, transform: GeoTransform, dtype: DataType, fill: i32) -> Self {
        Raster {
            width,
            height,
            transform,
            dtype,
            fill,
            pixels: vec![fill; (width as usize) * (height as usize)],
        }
    }

    #[inline]
    pub fn get(&self, col: u32, row: u32) -> i32 {
        self.pixels[(row as usize) * (self.width as usize) + col as usize]
    }

    #[inline]
    pub fn set(&mut self, col: u32, row: u32, value: i32) {
        self.pixels[(row as usize) * (self.width as usize) + col as usize] = value;
    }

    pub fn len(&self) -> usize {
        self.pixels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pixels.is_empty()
    }

    /// Fraction of non-fill pixels.
    pub fn efficacy(&self) -> f64 {
        if self.pixels.is_empty() {
            return 0.0;
        }
        let valid = self.pixels.iter().filter(|&&v| v != self.fill).count();
        valid as f64 / self.pixels.len() as f64
    }

    /// Inverse warp: for every target pixel, sample the source raster at
    /// the corresponding geographic position. Both rasters must share a
    /// CRS; pixels falling outside the source footprint keep `fill`.
    pub fn warp_from(&mut self, src: &Raster, resampling: Resampling) {
        for row in 0..self.height {
            for col in 0..self.width {
                let (x, y) = self.transform.pixel_center(f64::from(col), f64::from(row));
                let (sc, sr) = src.transform.to_pixel(x, y);
                let value = match resampling {
                    Resampling::Nearest => src.sample_nearest(sc, sr),
                    Resampling::Bilinear => src.sample_bilinear(sc, sr),
                };
                if let Some(v) = value {
                    self.set(col, row, v);
                }
            }
        }
    }

    fn sample_nearest(&self, col: f64, row: f64) -> Option<i32> {
        let c = col.round();
        let r = row.round();
        if c < 0.0 || r < 0.0 || c >= f64::from(self.width) || r >= f64::from(self.height) {
            return None;
        }
        Some(self.get(c as u32, r as u32))
    }

    fn sample_bilinear(&self, col: f64, row: f64) -> Option<i32> {
        if col < -0.5 || row < -0.5 || col > f64::from(self.width) - 0.5 || row > f64::from(self.height) - 0.5 {
            return None;
        }
        let c0 = col.floor().clamp(0.0, f64::from(self.width - 1)) as u32;
        let r0 = row.floor().clamp(0.0, f64::from(self.height - 1)) as u32;
        let c1 = (c0 + 1).min(self.width - 1);
        let r1 = (r0 + 1).min(self.height - 1);
        let fc = (col - f64::from(c0)).clamp(0.0, 1.0);
        let fr = (row - f64::from(r0)).clamp(0.0, 1.0);

        let corners = [
            self.get(c0, r0),
            self.get(c1, r0),
            self.get(c0, r1),
            self.get(c1, r1),
        ];
        // Interpolating across nodata bleeds the fill value; fall back to
        // the nearest sample when any corner is fill.
        if corners.iter().any(|&v| v == self.fill) {
            return self.sample_nearest(col, row);
        }
        let top = f64::from(corners[0]) * (1.0 - fc) + f64::from(corners[1]) * fc;
        let bottom = f64::from(corners[2]) * (1.0 - fc) + f64::from(corners[3]) * fc;
        Some((top * (1.0 - fr) + bottom * fr).round() as i32)
    }

    // ── GeoTIFF encoding ──

    pub fn to_geotiff(&self, with_overview: bool) -> Result<Vec<u8>> {
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut encoder = tiff::encoder::TiffEncoder::new(&mut cursor)
                .map_err(|e| CubeError::DataError(format!("tiff encoder: {e}")))?;
            self.write_ifd(&mut encoder, self.width, self.height, &self.pixels)?;
            if with_overview && self.width >= 2 && self.height >= 2 {
                let (ow, oh, pixels) = self.downsample2();
                self.write_ifd(&mut encoder, ow, oh, &pixels)?;
            }
        }
        Ok(cursor.into_inner())
    }

    fn write_ifd<W: std::io::Write + std::io::Seek>(
        &self,
        encoder: &mut tiff::encoder::TiffEncoder<W>,
        width: u32,
        height: u32,
        pixels: &[i32],
    ) -> Result<()> {
        let scale = [self.transform.res_x, self.transform.res_y, 0.0];
        let tiepoint = [0.0, 0.0, 0.0, self.transform.origin_x, self.transform.origin_y, 0.0];
        let nodata = self.fill.to_string();

        match self.dtype {
            DataType::UInt8 => {
                let data: Vec<u8> = pixels.iter().map(|&v| v.clamp(0, 255) as u8).collect();
                let mut image = encoder
                    .new_image_with_compression::<colortype::Gray8, _>(width, height, Deflate::default())
                    .map_err(|e| CubeError::DataError(format!("tiff image: {e}")))?;
                write_geo_tags(&mut image, &scale, &tiepoint, &nodata)?;
                image
                    .write_data(&data)
                    .map_err(|e| CubeError::DataError(format!("tiff write: {e}")))?;
            }
            DataType::Int16 => {
                let data: Vec<i16> = pixels
                    .iter()
                    .map(|&v| v.clamp(i32::from(i16::MIN), i32::from(i16::MAX)) as i16)
                    .collect();
                let mut image = encoder
                    .new_image_with_compression::<colortype::GrayI16, _>(width, height, Deflate::default())
                    .map_err(|e| CubeError::DataError(format!("tiff image: {e}")))?;
                write_geo_tags(&mut image, &scale, &tiepoint, &nodata)?;
                image
                    .write_data(&data)
                    .map_err(|e| CubeError::DataError(format!("tiff write: {e}")))?;
            }
        }
        Ok(())
    }

    fn downsample2(&self) -> (u32, u32, Vec<i32>) {
        let ow = (self.width / 2).max(1);
        let oh = (self.height / 2).max(1);
        let mut pixels = Vec::with_capacity((ow as usize) * (oh as usize));
        for row in 0..oh {
            for col in 0..ow {
                pixels.push(self.get(col * 2, row * 2));
            }
        }
        (ow, oh, pixels)
    }

    // ── GeoTIFF decoding ──

    pub fn from_geotiff(bytes: &[u8], fallback_fill: i32) -> Result<Raster> {
        let mut decoder = Decoder::new(Cursor::new(bytes))
            .map_err(|e| CubeError::DataError(format!("tiff decoder: {e}")))?;
        let (width, height) = decoder
            .dimensions()
            .map_err(|e| CubeError::DataError(format!("tiff dimensions: {e}")))?;

        let transform = read_geo_transform(&mut decoder);
        let fill = read_nodata(&mut decoder).unwrap_or(fallback_fill);

        let (dtype, pixels): (DataType, Vec<i32>) = match decoder
            .read_image()
            .map_err(|e| CubeError::DataError(format!("tiff read: {e}")))?
        {
            DecodingResult::U8(v) => (DataType::UInt8, v.into_iter().map(i32::from).collect()),
            DecodingResult::I16(v) => (DataType::Int16, v.into_iter().map(i32::from).collect()),
            DecodingResult::U16(v) => (DataType::Int16, v.into_iter().map(i32::from).collect()),
            DecodingResult::I32(v) => (DataType::Int16, v),
            _ => {
                return Err(CubeError::DataError("unsupported sample format".into()));
            }
        };

        if pixels.len() != (width as usize) * (height as usize) {
            return Err(CubeError::DataError(format!(
                "raster size mismatch: {}x{} vs {} samples",
                width,
                height,
                pixels.len()
            )));
        }

        Ok(Raster {
            width,
            height,
            transform,
            dtype,
            fill,
            pixels,
        })
    }
}

fn write_geo_tags<W, C, D>(
    image: &mut tiff::encoder::ImageEncoder<'_, W, C, tiff::encoder::TiffKindStandard, D>,
    scale: &[f64; 3],
    tiepoint: &[f64; 6],
    nodata: &str,
) -> Result<()>
where
    W: std::io::Write + std::io::Seek,
    C: colortype::ColorType,
    D: tiff::encoder::compression::Compression,
{
    let enc = image.encoder();
    enc.write_tag(Tag::Unknown(TAG_MODEL_PIXEL_SCALE), &scale[..])
        .map_err(|e| CubeError::DataError(format!("tiff tag: {e}")))?;
    enc.write_tag(Tag::Unknown(TAG_MODEL_TIEPOINT), &tiepoint[..])
        .map_err(|e| CubeError::DataError(format!("tiff tag: {e}")))?;
    enc.write_tag(Tag::Unknown(TAG_GDAL_NODATA), nodata)
        .map_err(|e| CubeError::DataError(format!("tiff tag: {e}")))?;
    Ok(())
}

fn read_geo_transform(decoder: &mut Decoder<Cursor<&[u8]>>) -> GeoTransform {
    let scale = decoder
        .get_tag_f64_vec(Tag::Unknown(TAG_MODEL_PIXEL_SCALE))
        .unwrap_or_else(|_| vec![1.0, 1.0, 0.0]);
    let tiepoint = decoder
        .get_tag_f64_vec(Tag::Unknown(TAG_MODEL_TIEPOINT))
        .unwrap_or_else(|_| vec![0.0; 6]);
    GeoTransform {
        origin_x: tiepoint.get(3).copied().unwrap_or(0.0),
        origin_y: tiepoint.get(4).copied().unwrap_or(0.0),
        res_x: scale.first().copied().unwrap_or(1.0),
        res_y: scale.get(1).copied().unwrap_or(1.0),
    }
}

fn read_nodata(decoder: &mut Decoder<Cursor<&[u8]>>) -> Option<i32> {
    decoder
        .get_tag_ascii_string(Tag::Unknown(TAG_GDAL_NODATA))
        .ok()
        .and_then(|s| s.trim().trim_end_matches('\0').parse().ok())
}
