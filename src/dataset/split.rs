//! Country-specific train/validation sampling.
//!
//! The official BigEarthNet v2 train split of one country is sampled without
//! replacement and cut into a training and a validation part:
//!
//! 1. keep patches with `country == country` and `split == train`
//! 2. draw `n_samples` of them with a generator seeded from `seed`
//! 3. the first `floor(n_samples * train_fraction)` drawn ids train, the rest validate
//!
//! The draw depends only on the metadata order and the seed.

use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::dataset::metadata::{MetadataTable, Split};
use crate::utils::error::{Result, SoftconError};
use crate::utils::format_number;

/// Parameters of the country split
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SplitConfig {
    /// Country to sample from
    pub country: String,
    /// Total number of sampled patches
    pub n_samples: usize,
    /// Random seed for reproducibility
    pub seed: u64,
    /// Fraction of the sample assigned to training
    pub train_fraction: f64,
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            country: "Ireland".to_string(),
            n_samples: 1000,
            seed: 123,
            train_fraction: 0.8,
        }
    }
}

impl SplitConfig {
    pub fn new(country: impl Into<String>, n_samples: usize, seed: u64, train_fraction: f64) -> Self {
        Self {
            country: country.into(),
            n_samples,
            seed,
            train_fraction,
        }
    }

    /// Number of training ids the split produces
    pub fn train_count(&self) -> usize {
        (self.n_samples as f64 * self.train_fraction).floor() as usize
    }
}

/// Disjoint training and validation id sets
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitAssignment {
    pub train_ids: Vec<String>,
    pub val_ids: Vec<String>,
}

impl SplitAssignment {
    pub fn stats(&self) -> SplitStats {
        SplitStats {
            train: self.train_ids.len(),
            validation: self.val_ids.len(),
        }
    }
}

/// Sizes of a split
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitStats {
    pub train: usize,
    pub validation: usize,
}

impl SplitStats {
    pub fn total(&self) -> usize {
        self.train + self.validation
    }

    pub fn print(&self) {
        println!("  Training patches:   {}", format_number(self.train));
        println!("  Validation patches: {}", format_number(self.validation));
        println!("  Total sampled:      {}", format_number(self.total()));
    }
}

/// Sample one country's train patches into a training and a validation id set
pub fn split_country(metadata: &MetadataTable, config: &SplitConfig) -> Result<SplitAssignment> {
    if !(0.0..=1.0).contains(&config.train_fraction) {
        return Err(SoftconError::Config(format!(
            "train_fraction must be between 0.0 and 1.0, got {}",
            config.train_fraction
        )));
    }

    let mut candidates = metadata.ids_for(&config.country, Split::Train);
    if candidates.is_empty() {
        return Err(SoftconError::Config(format!(
            "no train patches for country '{}' (available: {})",
            config.country,
            metadata.countries().join(", ")
        )));
    }
    if config.n_samples > candidates.len() {
        return Err(SoftconError::Config(format!(
            "requested {} samples but '{}' has only {} train patches",
            config.n_samples,
            config.country,
            candidates.len()
        )));
    }

    let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
    let (sampled, _) = candidates.partial_shuffle(&mut rng, config.n_samples);
    let mut sampled = sampled.to_vec();

    let val_ids = sampled.split_off(config.train_count());
    let assignment = SplitAssignment {
        train_ids: sampled,
        val_ids,
    };

    info!(
        "{}: {} train / {} validation patches (seed {})",
        config.country,
        assignment.train_ids.len(),
        assignment.val_ids.len(),
        config.seed
    );
    Ok(assignment)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::metadata::PatchMetadata;
    use proptest::prelude::*;
    use std::collections::HashSet;

    fn table(countries: &[(&str, usize)]) -> MetadataTable {
        let mut patches = Vec::new();
        for (country, count) in countries {
            for i in 0..*count {
                for split in [Split::Train, Split::Validation, Split::Test] {
                    patches.push(PatchMetadata {
                        patch_id: format!("{}_{:?}_{}", country, split, i),
                        country: country.to_string(),
                        split,
                        labels: vec!["Pastures".to_string()],
                        s1_name: None,
                    });
                }
            }
        }
        MetadataTable::from_records(patches)
    }

    #[test]
    fn test_ireland_reference_split() {
        let metadata = table(&[("Ireland", 1500), ("Portugal", 400)]);
        let split = split_country(&metadata, &SplitConfig::default()).unwrap();

        assert_eq!(split.train_ids.len(), 800);
        assert_eq!(split.val_ids.len(), 200);
        for id in split.train_ids.iter().chain(split.val_ids.iter()) {
            let patch = metadata.get(id).unwrap();
            assert_eq!(patch.country, "Ireland");
            assert_eq!(patch.split, Split::Train);
        }
    }

    #[test]
    fn test_same_seed_same_split() {
        let metadata = table(&[("Ireland", 300)]);
        let config = SplitConfig::new("Ireland", 100, 123, 0.8);
        assert_eq!(
            split_country(&metadata, &config).unwrap(),
            split_country(&metadata, &config).unwrap()
        );
    }

    #[test]
    fn test_different_seed_different_split() {
        let metadata = table(&[("Ireland", 300)]);
        let a = split_country(&metadata, &SplitConfig::new("Ireland", 100, 1, 0.8)).unwrap();
        let b = split_country(&metadata, &SplitConfig::new("Ireland", 100, 2, 0.8)).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_unknown_country_is_config_error() {
        let metadata = table(&[("Ireland", 10)]);
        let err = split_country(&metadata, &SplitConfig::new("Atlantis", 5, 0, 0.8)).unwrap_err();
        assert!(matches!(err, SoftconError::Config(_)));
        assert!(err.to_string().contains("available: Ireland"));
    }

    #[test]
    fn test_too_many_samples_is_config_error() {
        let metadata = table(&[("Ireland", 10)]);
        let err = split_country(&metadata, &SplitConfig::new("Ireland", 11, 0, 0.8)).unwrap_err();
        assert!(matches!(err, SoftconError::Config(_)));
    }

    #[test]
    fn test_all_available_samples() {
        let metadata = table(&[("Ireland", 10)]);
        let split = split_country(&metadata, &SplitConfig::new("Ireland", 10, 0, 0.8)).unwrap();
        let all: HashSet<_> = split.train_ids.iter().chain(&split.val_ids).collect();
        assert_eq!(all.len(), 10);
    }

    #[test]
    fn test_bad_fraction_is_config_error() {
        let metadata = table(&[("Ireland", 10)]);
        let err = split_country(&metadata, &SplitConfig::new("Ireland", 5, 0, -0.1)).unwrap_err();
        assert!(matches!(err, SoftconError::Config(_)));
    }

    #[test]
    fn test_stats() {
        let stats = SplitAssignment {
            train_ids: vec!["a".into(), "b".into()],
            val_ids: vec!["c".into()],
        }
        .stats();
        assert_eq!(stats.total(), 3);
    }

    proptest! {
        #[test]
        fn prop_split_invariants(
            available in 1usize..200,
            pick in 0.0f64..=1.0,
            fraction in 0.0f64..=1.0,
            seed in any::<u64>(),
        ) {
            let n_samples = ((available as f64 * pick).floor() as usize).max(1);
            let metadata = table(&[("Ireland", available), ("Austria", 5)]);
            let config = SplitConfig::new("Ireland", n_samples, seed, fraction);
            let split = split_country(&metadata, &config).unwrap();

            prop_assert_eq!(split.train_ids.len(), (n_samples as f64 * fraction).floor() as usize);
            prop_assert_eq!(split.train_ids.len() + split.val_ids.len(), n_samples);

            let train: HashSet<_> = split.train_ids.iter().collect();
            let val: HashSet<_> = split.val_ids.iter().collect();
            prop_assert!(train.is_disjoint(&val));
            prop_assert_eq!(train.len() + val.len(), n_samples);

            let eligible: HashSet<String> = metadata.ids_for("Ireland", Split::Train).into_iter().collect();
            prop_assert!(train.iter().chain(val.iter()).all(|id| eligible.contains(*id)));
        }

        #[test]
        fn prop_oversampling_fails(available in 1usize..50, extra in 1usize..10) {
            let metadata = table(&[("Ireland", available)]);
            let config = SplitConfig::new("Ireland", available + extra, 0, 0.8);
            prop_assert!(matches!(split_country(&metadata, &config), Err(SoftconError::Config(_))));
        }
    }
}
