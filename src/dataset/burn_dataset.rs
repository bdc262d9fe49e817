//! Burn Dataset Integration for BigEarthNet v2
//!
//! Implements Burn's `Dataset` over a restricted id set and the `Batcher` that
//! stacks transformed patches into image and multi-hot target tensors.
//!
//! ## Augmentation
//!
//! Training datasets carry an augmentation seed. The generator for sample `i`
//! on its `k`-th read is derived from `(seed, i, k)`, so every epoch sees new
//! augmentations while a run stays reproducible whatever the worker schedule.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use burn::data::dataloader::batcher::Batcher;
use burn::data::dataset::Dataset;
use burn::prelude::*;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::config::FinetuneConfig;
use crate::dataset::bands::{encode_labels, BandStatistics, MODEL_BAND_ORDER, NUM_LABELS};
use crate::dataset::metadata::{MetadataTable, SnowCloudFlags};
use crate::dataset::split::{split_country, SplitAssignment, SplitConfig};
use crate::dataset::store::{load_patch, open_patch_store, verify_keys, PatchKey, PatchStore};
use crate::dataset::transforms::TransformPipeline;
use crate::utils::error::{Result, ResultExt, SoftconError};

/// A single patch ready for Burn
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PatchItem {
    /// Image data as flattened CHW float array [13 * H * W]
    pub image: Vec<f32>,
    /// Multi-hot label vector
    pub targets: [i64; NUM_LABELS],
    /// Patch id (for debugging/logging)
    pub patch_id: String,
}

/// One patch of the dataset: where to read it and what it is labelled
#[derive(Clone, Debug)]
pub struct PatchEntry {
    pub key: PatchKey,
    pub targets: [i64; NUM_LABELS],
}

/// BigEarthNet v2 patches restricted to an id set, with their transform pipeline
pub struct BigEarthNetDataset {
    entries: Vec<PatchEntry>,
    store: Arc<dyn PatchStore>,
    pipeline: Arc<TransformPipeline>,
    augmentation_seed: Option<u64>,
    visits: Vec<AtomicU32>,
}

impl std::fmt::Debug for BigEarthNetDataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BigEarthNetDataset")
            .field("len", &self.entries.len())
            .field("store", &self.store.describe())
            .field("steps", &self.pipeline.step_names())
            .finish()
    }
}

impl BigEarthNetDataset {
    /// Create a deterministic dataset (validation)
    pub fn new(
        entries: Vec<PatchEntry>,
        store: Arc<dyn PatchStore>,
        pipeline: TransformPipeline,
    ) -> Self {
        let visits = entries.iter().map(|_| AtomicU32::new(0)).collect();
        Self {
            entries,
            store,
            pipeline: Arc::new(pipeline),
            augmentation_seed: None,
            visits,
        }
    }

    /// Seed the per-sample augmentation generators (training)
    pub fn with_augmentation_seed(mut self, seed: u64) -> Self {
        self.augmentation_seed = Some(seed);
        self
    }

    /// Build entries for `ids` from the metadata table
    pub fn entries_for(metadata: &MetadataTable, ids: &[String]) -> Result<Vec<PatchEntry>> {
        ids.iter()
            .map(|id| {
                let patch = metadata
                    .get(id)
                    .with_context(|| format!("patch '{}' not in metadata", id))?;
                let targets = encode_labels(&patch.labels)
                    .map_err(|e| SoftconError::Dataset(format!("patch '{}': {}", id, e)))?;
                Ok(PatchEntry {
                    key: PatchKey::new(id.clone(), patch.s1_name.clone()),
                    targets,
                })
            })
            .collect()
    }

    pub fn patch_ids(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.key.s2.as_str()).collect()
    }

    /// Load and transform one sample
    pub fn load(&self, index: usize) -> Result<PatchItem> {
        let entry = self
            .entries
            .get(index)
            .ok_or_else(|| SoftconError::Dataset(format!("index {} out of range", index)))?;

        let mut rng = match self.augmentation_seed {
            Some(seed) => {
                let visit = self.visits[index].fetch_add(1, Ordering::Relaxed);
                sample_rng(seed, index, visit)
            }
            None => ChaCha8Rng::seed_from_u64(0),
        };

        let raw = load_patch(self.store.as_ref(), &entry.key)?;
        let image = self.pipeline.apply(raw, &mut rng)?;

        Ok(PatchItem {
            image: image.into_chw(),
            targets: entry.targets,
            patch_id: entry.key.s2.clone(),
        })
    }

    /// Per-label positive counts
    pub fn label_distribution(&self) -> [usize; NUM_LABELS] {
        let mut counts = [0usize; NUM_LABELS];
        for entry in &self.entries {
            for (count, &t) in counts.iter_mut().zip(entry.targets.iter()) {
                *count += t as usize;
            }
        }
        counts
    }
}

/// Generator for one read of one sample
pub fn sample_rng(seed: u64, index: usize, visit: u32) -> ChaCha8Rng {
    let stream = splitmix64(splitmix64(seed ^ index as u64) ^ visit as u64);
    ChaCha8Rng::seed_from_u64(stream)
}

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    let mut z = x;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

impl Dataset<PatchItem> for BigEarthNetDataset {
    fn get(&self, index: usize) -> Option<PatchItem> {
        if index >= self.entries.len() {
            return None;
        }

        // A patch that cannot be read aborts the run rather than shortening the epoch.
        match self.load(index) {
            Ok(item) => Some(item),
            Err(e) => {
                error!("Failed to load patch {}: {}", self.entries[index].key.s2, e);
                panic!("failed to load patch {}: {}", self.entries[index].key.s2, e);
            }
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// A batch of patches
#[derive(Clone, Debug)]
pub struct PatchBatch<B: Backend> {
    /// Images with shape [batch_size, 13, height, width]
    pub images: Tensor<B, 4>,
    /// Multi-hot targets with shape [batch_size, 19]
    pub targets: Tensor<B, 2, Int>,
}

/// Batcher stacking [`PatchItem`]s
#[derive(Clone, Debug)]
pub struct PatchBatcher {
    channels: usize,
    image_size: usize,
}

impl PatchBatcher {
    pub fn new(image_size: usize) -> Self {
        Self {
            channels: MODEL_BAND_ORDER.len(),
            image_size,
        }
    }
}

impl Default for PatchBatcher {
    fn default() -> Self {
        Self::new(crate::IMAGE_SIZE)
    }
}

impl<B: Backend> Batcher<B, PatchItem, PatchBatch<B>> for PatchBatcher {
    fn batch(&self, items: Vec<PatchItem>, device: &B::Device) -> PatchBatch<B> {
        let batch_size = items.len();
        let (channels, height, width) = (self.channels, self.image_size, self.image_size);

        let images_data: Vec<f32> = items.iter().flat_map(|item| item.image.iter().copied()).collect();
        let images = Tensor::<B, 4>::from_floats(
            TensorData::new(images_data, [batch_size, channels, height, width]),
            device,
        );

        let targets_data: Vec<i64> = items.iter().flat_map(|item| item.targets).collect();
        let targets = Tensor::<B, 2, Int>::from_data(
            TensorData::new(targets_data, [batch_size, NUM_LABELS]),
            device,
        );

        PatchBatch { images, targets }
    }
}

/// Training and validation datasets for the configured country
pub struct CountrySplit {
    pub train: BigEarthNetDataset,
    pub valid: BigEarthNetDataset,
    pub assignment: SplitAssignment,
}

/// Sample the configured country and build its datasets.
///
/// Snow/cloud exclusion shrinks the datasets, never the id sets. Every kept
/// patch is checked against the store before returning.
pub fn load_country_train_val(config: &FinetuneConfig) -> Result<CountrySplit> {
    let data = &config.data;

    let metadata = MetadataTable::from_parquet(&data.metadata_parquet)?;
    let split_config = SplitConfig::new(data.country.clone(), data.n_samples, data.seed, data.train_fraction);
    let assignment = split_country(&metadata, &split_config)?;

    let flags = match &data.snow_cloud_parquet {
        Some(path) if path.exists() => SnowCloudFlags::from_parquet(path)?,
        Some(path) => {
            warn!("Snow/cloud table {} not found, keeping all patches", path.display());
            SnowCloudFlags::default()
        }
        None => SnowCloudFlags::default(),
    };

    let store = open_patch_store(&data.images)?;
    let stats = BandStatistics::s2a();

    let train_ids = filter_flagged(&assignment.train_ids, &flags, data.include_snowy, data.include_cloudy);
    let val_ids = filter_flagged(&assignment.val_ids, &flags, data.include_snowy, data.include_cloudy);

    let train_entries = BigEarthNetDataset::entries_for(&metadata, &train_ids)?;
    let val_entries = BigEarthNetDataset::entries_for(&metadata, &val_ids)?;

    let keys: Vec<PatchKey> = train_entries
        .iter()
        .chain(val_entries.iter())
        .map(|e| e.key.clone())
        .collect();
    verify_keys(store.as_ref(), &keys)?;

    let train = BigEarthNetDataset::new(
        train_entries,
        store.clone(),
        TransformPipeline::train(data.image_size, stats.clone()),
    )
    .with_augmentation_seed(config.training.seed);
    let valid = BigEarthNetDataset::new(
        val_entries,
        store,
        TransformPipeline::validation(data.image_size, stats),
    );

    info!(
        "Datasets ready: {} train / {} validation patches",
        train.len(),
        valid.len()
    );

    Ok(CountrySplit {
        train,
        valid,
        assignment,
    })
}

fn filter_flagged(
    ids: &[String],
    flags: &SnowCloudFlags,
    include_snowy: bool,
    include_cloudy: bool,
) -> Vec<String> {
    let kept: Vec<String> = ids
        .iter()
        .filter(|id| !flags.excludes(id, include_snowy, include_cloudy))
        .cloned()
        .collect();
    if kept.len() < ids.len() {
        info!("Excluded {} snowy/cloudy patches", ids.len() - kept.len());
    }
    kept
}

/// Positive count per label name
pub fn label_counts(dataset: &BigEarthNetDataset) -> HashMap<&'static str, usize> {
    crate::dataset::bands::LABELS
        .iter()
        .copied()
        .zip(dataset.label_distribution())
        .collect()
}
