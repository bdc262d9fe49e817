//! Dataset module for BigEarthNet v2 data handling
//!
//! This module provides functionality for:
//! - Reading patch metadata and snow/cloud flags from parquet
//! - Reading per-band rasters from the LMDB archive (or a safetensors directory)
//! - The band transform pipeline (resize, SAR drop, B10 insertion, augmentation, normalization)
//! - Country-specific train/validation sampling
//! - Burn `Dataset`/`Batcher` integration
//!
//! ## Band Layout
//!
//! Stored patches carry 14 bands: `VV, VH` (Sentinel-1) followed by the 12
//! Sentinel-2 bands without B10. The model consumes the 13 Sentinel-2 bands in
//! `B01..B12` order, so the pipeline drops the SAR pair and inserts a zero B10.

pub mod bands;
pub mod burn_dataset;
pub mod image;
pub mod metadata;
pub mod split;
pub mod store;
pub mod transforms;

// Re-export main types for convenience
pub use bands::{encode_labels, label_index, BandStatistics, LABELS, MODEL_BAND_ORDER, NUM_LABELS};
pub use burn_dataset::{
    load_country_train_val, BigEarthNetDataset, CountrySplit, PatchBatch, PatchBatcher, PatchEntry,
    PatchItem,
};
pub use self::image::{BandRaster, MultiBandImage};
pub use metadata::{MetadataTable, PatchMetadata, SnowCloudFlags, Split};
pub use split::{split_country, SplitAssignment, SplitConfig, SplitStats};
pub use store::{
    encode_patch, open_patch_store, DirectoryPatchStore, LmdbPatchStore, PatchKey, PatchStore,
};
pub use transforms::{BandTransform, TransformPipeline};

/// Get the label name for a given target index
pub fn label_name(index: usize) -> Option<&'static str> {
    LABELS.get(index).copied()
}

/// Label names of the positive entries of a target vector
pub fn decode_targets(targets: &[i64]) -> Vec<&'static str> {
    targets
        .iter()
        .enumerate()
        .filter(|(_, t)| **t > 0)
        .filter_map(|(i, _)| label_name(i))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_name() {
        assert_eq!(label_name(0), Some("Agro-forestry areas"));
        assert_eq!(label_name(18), Some("Urban fabric"));
        assert_eq!(label_name(19), None);
    }

    #[test]
    fn test_decode_targets() {
        let targets = encode_labels(&["Pastures", "Marine waters"]).unwrap();
        assert_eq!(decode_targets(&targets), vec!["Marine waters", "Pastures"]);
    }
}
