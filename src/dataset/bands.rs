//! Band layout and per-band statistics for Sentinel-1/2 patches.
//!
//! BigEarthNet v2 patches are stored with the two Sentinel-1 polarisations first,
//! followed by the twelve Sentinel-2 L2A bands (B10 is not distributed). The
//! backbone expects the thirteen canonical Sentinel-2 bands, with B10 present.

/// Bands in the order the patch store stacks them
pub const STORE_BAND_ORDER: [&str; 14] = [
    "VV", "VH", "B01", "B02", "B03", "B04", "B05", "B06", "B07", "B08", "B8A", "B09", "B11", "B12",
];

/// Number of leading SAR channels in a stored patch
pub const NUM_SAR_BANDS: usize = 2;

/// Number of optical channels following the SAR pair
pub const NUM_OPTICAL_BANDS: usize = 12;

/// Canonical Sentinel-2 band order the backbone was pretrained on
pub const MODEL_BAND_ORDER: [&str; 13] = [
    "B01", "B02", "B03", "B04", "B05", "B06", "B07", "B08", "B8A", "B09", "B10", "B11", "B12",
];

/// Position of B10 in [`MODEL_BAND_ORDER`], where the zero channel is inserted.
///
/// Aligns the zero channel with the identity slot of [`S2A_MEAN`]/[`S2A_STD`].
pub const B10_INSERT_INDEX: usize = 10;

/// Per-band normalization statistics
#[derive(Debug, Clone, PartialEq)]
pub struct BandStatistics {
    pub mean: Vec<f32>,
    pub std: Vec<f32>,
}

impl BandStatistics {
    /// Build statistics from parallel mean/std arrays
    pub fn new(mean: Vec<f32>, std: Vec<f32>) -> Self {
        Self { mean, std }
    }

    /// Number of bands covered
    pub fn len(&self) -> usize {
        self.mean.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mean.is_empty()
    }

    /// Sentinel-2A statistics for the thirteen canonical bands.
    ///
    /// B10 carries mean 0 and std 1 so the zero channel passes through unchanged.
    pub fn s2a() -> Self {
        Self::new(S2A_MEAN.to_vec(), S2A_STD.to_vec())
    }
}

/// Sentinel-2A per-band means, canonical order
pub const S2A_MEAN: [f32; 13] = [
    752.400_87,
    884.296_75,
    1144.162,
    1297.472_9,
    1624.909_9,
    2194.642_3,
    2422.212_4,
    2517.760_5,
    2581.646_8,
    2645.518_8,
    0.0,
    2368.512_7,
    1805.060_4,
];

/// Sentinel-2A per-band standard deviations, canonical order
pub const S2A_STD: [f32; 13] = [
    1108.028_9,
    1155.151_7,
    1183.629_3,
    1368.113_5,
    1370.265,
    1355.553_9,
    1416.514_9,
    1474.789,
    1439.308_6,
    1582.280_1,
    1.0,
    1455.520_8,
    1343.483_8,
];

/// Number of BigEarthNet v2 labels
pub const NUM_LABELS: usize = 19;

/// BigEarthNet v2 (CORINE level-3 regrouped) labels, alphabetical.
///
/// A label's position here is its index in the target vector.
pub const LABELS: [&str; NUM_LABELS] = [
    "Agro-forestry areas",
    "Arable land",
    "Beaches, dunes, sands",
    "Broad-leaved forest",
    "Coastal wetlands",
    "Complex cultivation patterns",
    "Coniferous forest",
    "Industrial or commercial units",
    "Inland waters",
    "Inland wetlands",
    "Land principally occupied by agriculture, with significant areas of natural vegetation",
    "Marine waters",
    "Mixed forest",
    "Moors, heathland and sclerophyllous vegetation",
    "Natural grassland and sparsely vegetated areas",
    "Pastures",
    "Permanent crops",
    "Transitional woodland, shrub",
    "Urban fabric",
];

/// Index of a label name in [`LABELS`]
pub fn label_index(name: &str) -> Option<usize> {
    LABELS.iter().position(|label| *label == name)
}

/// Encode label names as a multi-hot target vector
pub fn encode_labels<S: AsRef<str>>(names: &[S]) -> Result<[i64; NUM_LABELS], String> {
    let mut targets = [0i64; NUM_LABELS];
    for name in names {
        let name = name.as_ref();
        let index = label_index(name).ok_or_else(|| format!("unknown label '{}'", name))?;
        targets[index] = 1;
    }
    Ok(targets)
}
