//! Band transform pipeline.
//!
//! A patch goes through an ordered list of [`BandTransform`] steps:
//!
//! 1. resize to the model input size
//! 2. drop the two SAR channels
//! 3. insert the zero-filled B10 channel
//! 4. training only: horizontal flip, vertical flip, right-angle rotation,
//!    random resized crop
//! 5. per-band normalization
//!
//! Every step is a pure function of the image and the generator it is handed,
//! so a pipeline run is reproducible from the generator's seed alone.

use std::fmt::Debug;

use image::imageops;
use rand::Rng;
use rand_chacha::ChaCha8Rng;

use crate::dataset::bands::{
    BandStatistics, B10_INSERT_INDEX, NUM_OPTICAL_BANDS, NUM_SAR_BANDS,
};
use crate::dataset::image::{BandRaster, MultiBandImage};
use crate::utils::error::{Result, SoftconError};

/// One step of the pipeline
pub trait BandTransform: Debug + Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// Transform an image. Deterministic steps ignore `rng`.
    fn apply(&self, image: MultiBandImage, rng: &mut ChaCha8Rng) -> Result<MultiBandImage>;
}

/// Resize every band to `size`×`size`
#[derive(Debug, Clone)]
pub struct Resize {
    pub size: usize,
}

impl BandTransform for Resize {
    fn name(&self) -> &'static str {
        "resize"
    }

    fn apply(&self, image: MultiBandImage, _rng: &mut ChaCha8Rng) -> Result<MultiBandImage> {
        Ok(image.resize(self.size, self.size))
    }
}

/// Remove the leading SAR channels and keep the optical bands after them
#[derive(Debug, Clone)]
pub struct DropSarChannels {
    pub sar_channels: usize,
    pub optical_channels: usize,
}

impl Default for DropSarChannels {
    fn default() -> Self {
        Self {
            sar_channels: NUM_SAR_BANDS,
            optical_channels: NUM_OPTICAL_BANDS,
        }
    }
}

impl BandTransform for DropSarChannels {
    fn name(&self) -> &'static str {
        "drop_sar"
    }

    fn apply(&self, image: MultiBandImage, _rng: &mut ChaCha8Rng) -> Result<MultiBandImage> {
        let needed = self.sar_channels + self.optical_channels;
        if image.channels() < needed {
            return Err(SoftconError::Dataset(format!(
                "expected at least {} channels ({} SAR + {} optical), got {}",
                needed,
                self.sar_channels,
                self.optical_channels,
                image.channels()
            )));
        }
        let bands = image
            .into_bands()
            .into_iter()
            .skip(self.sar_channels)
            .take(self.optical_channels)
            .collect();
        MultiBandImage::from_bands(bands)
    }
}

/// Insert a zero-filled channel at `index`
#[derive(Debug, Clone)]
pub struct InsertZeroBand {
    pub index: usize,
}

impl Default for InsertZeroBand {
    fn default() -> Self {
        Self {
            index: B10_INSERT_INDEX,
        }
    }
}

impl BandTransform for InsertZeroBand {
    fn name(&self) -> &'static str {
        "insert_b10"
    }

    fn apply(&self, image: MultiBandImage, _rng: &mut ChaCha8Rng) -> Result<MultiBandImage> {
        if self.index > image.channels() {
            return Err(SoftconError::Dataset(format!(
                "cannot insert a band at {} into {} channels",
                self.index,
                image.channels()
            )));
        }
        let (height, width) = (image.height() as u32, image.width() as u32);
        let mut bands = image.into_bands();
        bands.insert(self.index, BandRaster::new(width, height));
        MultiBandImage::from_bands(bands)
    }
}

/// Mirror left-right with probability `p`
#[derive(Debug, Clone)]
pub struct RandomHorizontalFlip {
    pub p: f64,
}

impl BandTransform for RandomHorizontalFlip {
    fn name(&self) -> &'static str {
        "hflip"
    }

    fn apply(&self, image: MultiBandImage, rng: &mut ChaCha8Rng) -> Result<MultiBandImage> {
        if rng.gen_bool(self.p) {
            Ok(image.map_bands(imageops::flip_horizontal))
        } else {
            Ok(image)
        }
    }
}

/// Mirror top-bottom with probability `p`
#[derive(Debug, Clone)]
pub struct RandomVerticalFlip {
    pub p: f64,
}

impl BandTransform for RandomVerticalFlip {
    fn name(&self) -> &'static str {
        "vflip"
    }

    fn apply(&self, image: MultiBandImage, rng: &mut ChaCha8Rng) -> Result<MultiBandImage> {
        if rng.gen_bool(self.p) {
            Ok(image.map_bands(imageops::flip_vertical))
        } else {
            Ok(image)
        }
    }
}

/// Rotate by 0°, 90°, 180° or 270°, chosen uniformly
#[derive(Debug, Clone, Default)]
pub struct RandomRightAngleRotation;

impl RandomRightAngleRotation {
    /// Rotate clockwise by `quarter_turns` × 90°
    pub fn rotate(image: MultiBandImage, quarter_turns: u8) -> MultiBandImage {
        match quarter_turns % 4 {
            1 => image.map_bands(imageops::rotate90),
            2 => image.map_bands(imageops::rotate180),
            3 => image.map_bands(imageops::rotate270),
            _ => image,
        }
    }
}

impl BandTransform for RandomRightAngleRotation {
    fn name(&self) -> &'static str {
        "rot90"
    }

    fn apply(&self, image: MultiBandImage, rng: &mut ChaCha8Rng) -> Result<MultiBandImage> {
        let quarter_turns = rng.gen_range(0..4u8);
        Ok(Self::rotate(image, quarter_turns))
    }
}

/// Crop a random region and resize it back to `size`×`size`.
///
/// Region sampling: up to ten draws of an area fraction from `scale` and a
/// log-uniform aspect ratio from `ratio`; the first region that fits wins.
/// Otherwise the largest centred region whose ratio is clamped into `ratio`.
#[derive(Debug, Clone)]
pub struct RandomResizedCrop {
    pub size: usize,
    pub scale: (f64, f64),
    pub ratio: (f64, f64),
}

impl RandomResizedCrop {
    const ATTEMPTS: usize = 10;

    pub fn new(size: usize) -> Self {
        Self {
            size,
            scale: (0.8, 1.0),
            ratio: (3.0 / 4.0, 4.0 / 3.0),
        }
    }

    /// Pick a crop window as (top, left, height, width)
    pub fn sample_region(
        &self,
        height: usize,
        width: usize,
        rng: &mut ChaCha8Rng,
    ) -> (usize, usize, usize, usize) {
        let area = (height * width) as f64;
        let (log_lo, log_hi) = (self.ratio.0.ln(), self.ratio.1.ln());

        for _ in 0..Self::ATTEMPTS {
            let target_area = area * rng.gen_range(self.scale.0..=self.scale.1);
            let aspect = rng.gen_range(log_lo..=log_hi).exp();

            let w = (target_area * aspect).sqrt().round() as usize;
            let h = (target_area / aspect).sqrt().round() as usize;

            if w > 0 && h > 0 && w <= width && h <= height {
                let top = rng.gen_range(0..=height - h);
                let left = rng.gen_range(0..=width - w);
                return (top, left, h, w);
            }
        }

        let in_ratio = width as f64 / height as f64;
        let (h, w) = if in_ratio < self.ratio.0 {
            let w = width;
            (((w as f64) / self.ratio.0).round() as usize, w)
        } else if in_ratio > self.ratio.1 {
            let h = height;
            (h, ((h as f64) * self.ratio.1).round() as usize)
        } else {
            (height, width)
        };
        ((height - h) / 2, (width - w) / 2, h, w)
    }
}

impl BandTransform for RandomResizedCrop {
    fn name(&self) -> &'static str {
        "random_resized_crop"
    }

    fn apply(&self, image: MultiBandImage, rng: &mut ChaCha8Rng) -> Result<MultiBandImage> {
        let (top, left, h, w) = self.sample_region(image.height(), image.width(), rng);
        let size = self.size as u32;
        Ok(image.map_bands(|band| {
            let crop = imageops::crop_imm(band, left as u32, top as u32, w as u32, h as u32).to_image();
            crate::dataset::image::resize_band(&crop, size, size)
        }))
    }
}

/// Per-band `(x - mean) / std`
#[derive(Debug, Clone)]
pub struct Normalize {
    pub stats: BandStatistics,
}

impl BandTransform for Normalize {
    fn name(&self) -> &'static str {
        "normalize"
    }

    fn apply(&self, image: MultiBandImage, _rng: &mut ChaCha8Rng) -> Result<MultiBandImage> {
        if image.channels() != self.stats.len() {
            return Err(SoftconError::Dataset(format!(
                "normalization covers {} bands, image has {}",
                self.stats.len(),
                image.channels()
            )));
        }
        let bands = image
            .into_bands()
            .into_iter()
            .zip(self.stats.mean.iter().zip(self.stats.std.iter()))
            .map(|(mut band, (&mean, &std))| {
                for pixel in band.pixels_mut() {
                    pixel[0] = (pixel[0] - mean) / std;
                }
                band
            })
            .collect();
        MultiBandImage::from_bands(bands)
    }
}

/// Ordered list of transforms
#[derive(Debug)]
pub struct TransformPipeline {
    steps: Vec<Box<dyn BandTransform>>,
}

impl TransformPipeline {
    pub fn new(steps: Vec<Box<dyn BandTransform>>) -> Self {
        Self { steps }
    }

    /// Training pipeline: preprocessing, augmentation, normalization
    pub fn train(size: usize, stats: BandStatistics) -> Self {
        Self::new(vec![
            Box::new(Resize { size }),
            Box::new(DropSarChannels::default()),
            Box::new(InsertZeroBand::default()),
            Box::new(RandomHorizontalFlip { p: 0.5 }),
            Box::new(RandomVerticalFlip { p: 0.5 }),
            Box::new(RandomRightAngleRotation),
            Box::new(RandomResizedCrop::new(size)),
            Box::new(Normalize { stats }),
        ])
    }

    /// Validation pipeline: preprocessing and normalization only
    pub fn validation(size: usize, stats: BandStatistics) -> Self {
        Self::new(vec![
            Box::new(Resize { size }),
            Box::new(DropSarChannels::default()),
            Box::new(InsertZeroBand::default()),
            Box::new(Normalize { stats }),
        ])
    }

    /// Run every step in order
    pub fn apply(&self, image: MultiBandImage, rng: &mut ChaCha8Rng) -> Result<MultiBandImage> {
        self.steps
            .iter()
            .try_fold(image, |image, step| step.apply(image, rng))
    }

    pub fn step_names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}
