//! Multi-band raster held as one single-channel `f32` image per band.
//!
//! The `image` crate has no N-channel pixel type, so each band is an
//! `ImageBuffer<Luma<f32>>` and spatial operations are applied band by band.

use image::imageops::{self, FilterType};
use image::{ImageBuffer, Luma};

use crate::utils::error::{Result, SoftconError};

/// One band of a patch
pub type BandRaster = ImageBuffer<Luma<f32>, Vec<f32>>;

/// A (C, H, W) raster where every band shares the same spatial size
#[derive(Debug, Clone, PartialEq)]
pub struct MultiBandImage {
    bands: Vec<BandRaster>,
}

impl MultiBandImage {
    /// Stack bands, which must all share one size
    pub fn from_bands(bands: Vec<BandRaster>) -> Result<Self> {
        if let Some(first) = bands.first() {
            let dims = first.dimensions();
            if let Some(other) = bands.iter().find(|band| band.dimensions() != dims) {
                return Err(SoftconError::Dataset(format!(
                    "band size mismatch: {:?} vs {:?}",
                    dims,
                    other.dimensions()
                )));
            }
        }
        Ok(Self { bands })
    }

    /// Build from a flat CHW buffer
    pub fn from_chw(data: Vec<f32>, channels: usize, height: usize, width: usize) -> Result<Self> {
        if data.len() != channels * height * width {
            return Err(SoftconError::Dataset(format!(
                "expected {} values for ({}, {}, {}), got {}",
                channels * height * width,
                channels,
                height,
                width,
                data.len()
            )));
        }
        let plane = height * width;
        let bands = (0..channels)
            .map(|c| {
                let values = data[c * plane..(c + 1) * plane].to_vec();
                BandRaster::from_raw(width as u32, height as u32, values).ok_or_else(|| {
                    SoftconError::Dataset(format!("cannot build {}x{} band", width, height))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { bands })
    }

    /// An all-zero raster
    pub fn zeros(channels: usize, height: usize, width: usize) -> Self {
        Self {
            bands: (0..channels)
                .map(|_| BandRaster::new(width as u32, height as u32))
                .collect(),
        }
    }

    pub fn channels(&self) -> usize {
        self.bands.len()
    }

    pub fn height(&self) -> usize {
        self.bands.first().map(|b| b.height() as usize).unwrap_or(0)
    }

    pub fn width(&self) -> usize {
        self.bands.first().map(|b| b.width() as usize).unwrap_or(0)
    }

    /// (C, H, W)
    pub fn shape(&self) -> [usize; 3] {
        [self.channels(), self.height(), self.width()]
    }

    pub fn bands(&self) -> &[BandRaster] {
        &self.bands
    }

    pub fn into_bands(self) -> Vec<BandRaster> {
        self.bands
    }

    /// Raw values of one band, row-major
    pub fn band_values(&self, channel: usize) -> Option<&[f32]> {
        self.bands.get(channel).map(|b| b.as_raw().as_slice())
    }

    /// Apply the same spatial operation to every band
    pub fn map_bands<F>(self, f: F) -> Self
    where
        F: Fn(&BandRaster) -> BandRaster,
    {
        Self {
            bands: self.bands.iter().map(f).collect(),
        }
    }

    /// Resize every band with bilinear (triangle) filtering
    pub fn resize(self, height: usize, width: usize) -> Self {
        if self.height() == height && self.width() == width {
            return self;
        }
        self.map_bands(|band| resize_band(band, width as u32, height as u32))
    }

    /// Flatten to a CHW buffer
    pub fn into_chw(self) -> Vec<f32> {
        let mut data = Vec::with_capacity(self.channels() * self.height() * self.width());
        for band in self.bands {
            data.extend(band.into_raw());
        }
        data
    }
}

/// Bilinear resize of a single band.
///
/// `imageops` clamps float samples to [0, 1], so the band is mapped into that
/// range, resampled, and mapped back. Triangle weights are convex, which keeps
/// the round trip exact up to rounding.
pub fn resize_band(band: &BandRaster, width: u32, height: u32) -> BandRaster {
    let (lo, hi) = band
        .as_raw()
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));

    if !(hi > lo) {
        let fill = if lo.is_finite() { lo } else { 0.0 };
        return BandRaster::from_pixel(width, height, Luma([fill]));
    }

    let span = hi - lo;
    let unit: BandRaster = BandRaster::from_raw(
        band.width(),
        band.height(),
        band.as_raw().iter().map(|v| (v - lo) / span).collect(),
    )
    .unwrap_or_else(|| BandRaster::new(band.width(), band.height()));

    let mut resized = imageops::resize(&unit, width, height, FilterType::Triangle);
    for pixel in resized.pixels_mut() {
        pixel[0] = pixel[0] * span + lo;
    }
    resized
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chw_round_trip_preserves_layout() {
        let data: Vec<f32> = (0..24).map(|v| v as f32).collect();
        let image = MultiBandImage::from_chw(data.clone(), 2, 3, 4).unwrap();
        assert_eq!(image.shape(), [2, 3, 4]);
        assert_eq!(image.band_values(1).unwrap()[0], 12.0);
        assert_eq!(image.bands()[0].get_pixel(3, 2)[0], 11.0);
        assert_eq!(image.into_chw(), data);
    }

    #[test]
    fn test_from_chw_rejects_wrong_length() {
        assert!(MultiBandImage::from_chw(vec![0.0; 10], 2, 3, 4).is_err());
    }

    #[test]
    fn test_from_bands_rejects_mixed_sizes() {
        let bands = vec![BandRaster::new(4, 4), BandRaster::new(2, 2)];
        assert!(MultiBandImage::from_bands(bands).is_err());
    }

    #[test]
    fn test_resize_constant_band_stays_constant() {
        let band = BandRaster::from_pixel(20, 20, Luma([7.5]));
        let image = MultiBandImage::from_bands(vec![band]).unwrap().resize(56, 56);
        assert_eq!(image.shape(), [1, 56, 56]);
        assert!(image.band_values(0).unwrap().iter().all(|v| (v - 7.5).abs() < 1e-4));
    }

    #[test]
    fn test_resize_keeps_reflectance_range() {
        let band = BandRaster::from_fn(12, 12, |x, _| Luma([if x < 6 { 300.0 } else { 4200.0 }]));
        let resized = resize_band(&band, 24, 24);
        let values = resized.as_raw();
        let max = values.iter().cloned().fold(f32::MIN, f32::max);
        let min = values.iter().cloned().fold(f32::MAX, f32::min);
        assert!((max - 4200.0).abs() < 1.0);
        assert!((min - 300.0).abs() < 1.0);
    }
}
