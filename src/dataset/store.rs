//! Patch stores.
//!
//! A stored patch is a safetensors blob holding one 2-D tensor per band, named
//! after the band (`B02`, `VV`, ...). BigEarthNet v2 ships them in an LMDB
//! archive keyed by patch name, with Sentinel-1 and Sentinel-2 patches under
//! separate keys. A directory of `<key>.safetensors` files is accepted too.
//!
//! Bands come at 10 m, 20 m and 60 m resolution; [`load_patch`] upsamples all
//! of them to the largest band size and stacks them in [`STORE_BAND_ORDER`].

use std::collections::HashMap;
use std::fmt::Debug;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use heed::types::{Bytes, Str};
use heed::{Database, Env, EnvFlags, EnvOpenOptions};
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use safetensors::tensor::{Dtype, TensorView};
use safetensors::SafeTensors;
use tracing::{debug, info};

use crate::dataset::bands::STORE_BAND_ORDER;
use crate::dataset::image::{resize_band, BandRaster, MultiBandImage};
use crate::utils::error::{Result, SoftconError};

/// Keys of one patch in a store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchKey {
    /// Sentinel-2 patch name
    pub s2: String,
    /// Sentinel-1 patch name, if the SAR bands live under their own key
    pub s1: Option<String>,
}

impl PatchKey {
    pub fn new(s2: impl Into<String>, s1: Option<String>) -> Self {
        Self { s2: s2.into(), s1 }
    }

    fn keys(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.s2.as_str()).chain(self.s1.as_deref())
    }
}

/// Key-value access to encoded patches
pub trait PatchStore: Debug + Send + Sync {
    /// Encoded blob for a key, `None` when absent
    fn read_blob(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Whether a key is present
    fn contains(&self, key: &str) -> Result<bool> {
        Ok(self.read_blob(key)?.is_some())
    }

    /// Human-readable location for logs
    fn describe(&self) -> String;
}

/// BigEarthNet v2 LMDB archive
pub struct LmdbPatchStore {
    path: PathBuf,
    env: Env,
    db: Database<Str, Bytes>,
}

impl Debug for LmdbPatchStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LmdbPatchStore").field("path", &self.path).finish()
    }
}

impl LmdbPatchStore {
    /// Address space reserved for the memory map; LMDB grows it to the file size
    const MAP_SIZE: usize = 1 << 30;

    /// Open an existing archive read-only and without a lock file.
    ///
    /// Nothing is written to the archive directory, so it may sit on a
    /// read-only mount or be shared between concurrent runs.
    pub fn open(path: &Path) -> Result<Self> {
        let mut options = EnvOpenOptions::new();
        options.map_size(Self::MAP_SIZE);
        // SAFETY: the archive is never written while a run reads it, which is
        // what READ_ONLY | NO_LOCK requires.
        unsafe {
            options.flags(EnvFlags::READ_ONLY | EnvFlags::NO_LOCK);
        }
        Self::open_with(path, &options)
    }

    /// Open or create a writable archive
    #[cfg(test)]
    pub(crate) fn create(path: &Path) -> Result<Self> {
        let mut options = EnvOpenOptions::new();
        options.map_size(Self::MAP_SIZE);
        Self::open_with(path, &options)
    }

    fn open_with(path: &Path, options: &EnvOpenOptions) -> Result<Self> {
        let store_err = |e: heed::Error| SoftconError::Store(path.display().to_string(), e.to_string());

        // SAFETY: the environment is opened once per store and never
        // truncated or reopened with different flags while in use.
        let env = unsafe { options.open(path) }.map_err(store_err)?;

        let rtxn = env.read_txn().map_err(store_err)?;
        let db: Database<Str, Bytes> = env
            .open_database(&rtxn, None)
            .map_err(store_err)?
            .ok_or_else(|| SoftconError::Store(path.display().to_string(), "no main database".to_string()))?;
        drop(rtxn);

        info!("Opened LMDB patch store at {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            env,
            db,
        })
    }

    /// Write one blob
    #[cfg(test)]
    pub(crate) fn insert(&self, key: &str, blob: &[u8]) -> Result<()> {
        let store_err = |e: heed::Error| SoftconError::Store(key.to_string(), e.to_string());
        let mut wtxn = self.env.write_txn().map_err(store_err)?;
        self.db.put(&mut wtxn, key, blob).map_err(store_err)?;
        wtxn.commit().map_err(store_err)
    }
}

impl PatchStore for LmdbPatchStore {
    fn read_blob(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let store_err = |e: heed::Error| SoftconError::Store(key.to_string(), e.to_string());
        let rtxn = self.env.read_txn().map_err(store_err)?;
        let blob = self.db.get(&rtxn, key).map_err(store_err)?.map(|b| b.to_vec());
        Ok(blob)
    }

    fn contains(&self, key: &str) -> Result<bool> {
        let store_err = |e: heed::Error| SoftconError::Store(key.to_string(), e.to_string());
        let rtxn = self.env.read_txn().map_err(store_err)?;
        Ok(self.db.get(&rtxn, key).map_err(store_err)?.is_some())
    }

    fn describe(&self) -> String {
        format!("lmdb:{}", self.path.display())
    }
}

/// Directory of `<key>.safetensors` files
#[derive(Debug, Clone)]
pub struct DirectoryPatchStore {
    root: PathBuf,
}

impl DirectoryPatchStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(format!("{key}.safetensors"))
    }

    /// Write one blob
    pub fn insert(&self, key: &str, blob: &[u8]) -> Result<()> {
        fs::create_dir_all(&self.root)?;
        fs::write(self.path_for(key), blob)?;
        Ok(())
    }
}

impl PatchStore for DirectoryPatchStore {
    fn read_blob(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(self.path_for(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn contains(&self, key: &str) -> Result<bool> {
        Ok(self.path_for(key).is_file())
    }

    fn describe(&self) -> String {
        format!("dir:{}", self.root.display())
    }
}

/// Open the store at `path`: LMDB when it holds a `data.mdb`, else a safetensors directory
pub fn open_patch_store(path: &Path) -> Result<Arc<dyn PatchStore>> {
    if path.join("data.mdb").is_file() {
        Ok(Arc::new(LmdbPatchStore::open(path)?))
    } else if path.is_dir() {
        info!("Using safetensors directory store at {}", path.display());
        Ok(Arc::new(DirectoryPatchStore::new(path)))
    } else {
        Err(SoftconError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("patch store not found: {}", path.display()),
        )))
    }
}

/// Encode bands as an `F32` safetensors blob
pub fn encode_patch(bands: &[(&str, &BandRaster)]) -> Result<Vec<u8>> {
    let buffers: Vec<(String, Vec<usize>, Vec<u8>)> = bands
        .iter()
        .map(|(name, band)| {
            let shape = vec![band.height() as usize, band.width() as usize];
            let bytes = band.as_raw().iter().flat_map(|v| v.to_le_bytes()).collect();
            (name.to_string(), shape, bytes)
        })
        .collect();

    let views = buffers
        .iter()
        .map(|(name, shape, bytes)| {
            TensorView::new(Dtype::F32, shape.clone(), bytes)
                .map(|view| (name.clone(), view))
                .map_err(|e| SoftconError::Serialization(e.to_string()))
        })
        .collect::<Result<Vec<_>>>()?;

    safetensors::serialize(views, &None).map_err(|e| SoftconError::Serialization(e.to_string()))
}

/// Decode every band tensor of a blob
pub fn decode_bands(key: &str, blob: &[u8]) -> Result<HashMap<String, BandRaster>> {
    let decode_err = |msg: String| SoftconError::Store(key.to_string(), msg);
    let tensors = SafeTensors::deserialize(blob).map_err(|e| decode_err(e.to_string()))?;

    let mut bands = HashMap::new();
    for (name, view) in tensors.tensors() {
        let (height, width) = match view.shape() {
            [h, w] => (*h, *w),
            [1, h, w] => (*h, *w),
            other => return Err(decode_err(format!("band {} has shape {:?}", name, other))),
        };
        let values = to_f32(view.dtype(), view.data()).map_err(|msg| decode_err(format!("band {}: {}", name, msg)))?;
        let band = BandRaster::from_raw(width as u32, height as u32, values)
            .ok_or_else(|| decode_err(format!("band {} has inconsistent size", name)))?;
        bands.insert(name, band);
    }
    Ok(bands)
}

fn to_f32(dtype: Dtype, data: &[u8]) -> std::result::Result<Vec<f32>, String> {
    let values = match dtype {
        Dtype::U8 => data.iter().map(|&v| v as f32).collect(),
        Dtype::U16 => data
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]) as f32)
            .collect(),
        Dtype::I16 => data
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]) as f32)
            .collect(),
        Dtype::U32 => data
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]) as f32)
            .collect(),
        Dtype::I32 => data
            .chunks_exact(4)
            .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]) as f32)
            .collect(),
        Dtype::F32 => data
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
        Dtype::F64 => data
            .chunks_exact(8)
            .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]) as f32)
            .collect(),
        other => return Err(format!("unsupported dtype {:?}", other)),
    };
    Ok(values)
}

/// Read a patch and stack its bands in [`STORE_BAND_ORDER`] at the finest resolution
pub fn load_patch(store: &dyn PatchStore, key: &PatchKey) -> Result<MultiBandImage> {
    let mut bands = HashMap::new();
    for k in key.keys() {
        let blob = store
            .read_blob(k)?
            .ok_or_else(|| SoftconError::Store(k.to_string(), format!("not found in {}", store.describe())))?;
        bands.extend(decode_bands(k, &blob)?);
    }

    let height = bands.values().map(|b| b.height()).max().unwrap_or(0);
    let width = bands.values().map(|b| b.width()).max().unwrap_or(0);

    let stacked = STORE_BAND_ORDER
        .iter()
        .map(|name| {
            let band = bands
                .get(*name)
                .ok_or_else(|| SoftconError::Store(key.s2.clone(), format!("missing band {}", name)))?;
            if band.dimensions() == (width, height) {
                Ok(band.clone())
            } else {
                Ok(resize_band(band, width, height))
            }
        })
        .collect::<Result<Vec<_>>>()?;

    MultiBandImage::from_bands(stacked)
}

/// Check that every key is present, failing with the missing ones listed
pub fn verify_keys(store: &dyn PatchStore, keys: &[PatchKey]) -> Result<()> {
    let progress = ProgressBar::new(keys.len() as u64);
    progress.set_style(
        ProgressStyle::default_bar()
            .template("  Checking patches [{bar:40.cyan/blue}] {pos}/{len}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=>-"),
    );

    let missing: Vec<String> = keys
        .par_iter()
        .flat_map_iter(|key| {
            let absent: Vec<String> = key
                .keys()
                .filter(|k| !matches!(store.contains(k), Ok(true)))
                .map(str::to_string)
                .collect();
            progress.inc(1);
            absent
        })
        .collect();
    progress.finish_and_clear();

    if missing.is_empty() {
        debug!("All {} patches present in {}", keys.len(), store.describe());
        Ok(())
    } else {
        let preview: Vec<&str> = missing.iter().take(5).map(String::as_str).collect();
        Err(SoftconError::Dataset(format!(
            "{} patch keys missing from {} (first: {})",
            missing.len(),
            store.describe(),
            preview.join(", ")
        )))
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;
    use tempfile::tempdir;

    #[test]
    fn test_directory_store_load_stacks_store_order() {
        let dir = tempdir().unwrap();
        let store = DirectoryPatchStore::new(dir.path());
        store.insert("patch_a", &fixtures::synthetic_blob(100.0)).unwrap();

        let image = load_patch(&store, &PatchKey::new("patch_a", None)).unwrap();
        assert_eq!(image.shape(), [14, 120, 120]);
        for c in 0..14 {
            let expected = 100.0 + c as f32;
            assert!(image.band_values(c).unwrap().iter().all(|v| (v - expected).abs() < 1e-3));
        }
    }

    #[test]
    fn test_split_s1_and_s2_keys() {
        let dir = tempdir().unwrap();
        let store = DirectoryPatchStore::new(dir.path());
        let bands = fixtures::synthetic_bands(0.0);
        let (sar, optical): (Vec<_>, Vec<_>) = bands.iter().partition(|(n, _)| n.starts_with('V'));
        let sar: Vec<(&str, &BandRaster)> = sar.iter().map(|(n, b)| (*n, b)).collect();
        let optical: Vec<(&str, &BandRaster)> = optical.iter().map(|(n, b)| (*n, b)).collect();
        store.insert("S1A_x", &encode_patch(&sar).unwrap()).unwrap();
        store.insert("S2A_x", &encode_patch(&optical).unwrap()).unwrap();

        let key = PatchKey::new("S2A_x", Some("S1A_x".to_string()));
        let image = load_patch(&store, &key).unwrap();
        assert_eq!(image.shape(), [14, 120, 120]);
        assert_eq!(image.band_values(1).unwrap()[0], 1.0);

        assert!(load_patch(&store, &PatchKey::new("S2A_x", None)).is_err());
    }

    #[test]
    fn test_missing_patch_is_store_error() {
        let dir = tempdir().unwrap();
        let store = DirectoryPatchStore::new(dir.path());
        let err = load_patch(&store, &PatchKey::new("absent", None)).unwrap_err();
        assert!(matches!(err, SoftconError::Store(_, _)));
    }

    #[test]
    fn test_decode_u16_bands() {
        let values: Vec<u8> = [1u16, 2, 3, 65535].iter().flat_map(|v| v.to_le_bytes()).collect();
        let view = TensorView::new(Dtype::U16, vec![2, 2], &values).unwrap();
        let blob = safetensors::serialize(vec![("B02", view)], &None).unwrap();

        let bands = decode_bands("k", &blob).unwrap();
        assert_eq!(bands["B02"].as_raw(), &vec![1.0, 2.0, 3.0, 65535.0]);
    }

    #[test]
    fn test_decode_rejects_3d_bands() {
        let values = vec![0u8; 8];
        let view = TensorView::new(Dtype::U8, vec![2, 2, 2], &values).unwrap();
        let blob = safetensors::serialize(vec![("B02", view)], &None).unwrap();
        assert!(decode_bands("k", &blob).is_err());
    }

    #[test]
    fn test_lmdb_store_round_trip() {
        let dir = tempdir().unwrap();
        let store = LmdbPatchStore::create(dir.path()).unwrap();
        store.insert("S2B_MSIL2A_1", &fixtures::synthetic_blob(5.0)).unwrap();

        assert!(store.contains("S2B_MSIL2A_1").unwrap());
        assert!(!store.contains("S2B_MSIL2A_2").unwrap());
        let image = load_patch(&store, &PatchKey::new("S2B_MSIL2A_1", None)).unwrap();
        assert_eq!(image.shape(), [14, 120, 120]);
        assert!(store.describe().starts_with("lmdb:"));
    }

    #[test]
    fn test_archive_opens_read_only_without_lock_file() {
        let written = tempdir().unwrap();
        {
            let store = LmdbPatchStore::create(written.path()).unwrap();
            store.insert("S2A_MSIL2A_7", &fixtures::synthetic_blob(2.0)).unwrap();
        }
        let archive = tempdir().unwrap();
        fs::copy(written.path().join("data.mdb"), archive.path().join("data.mdb")).unwrap();

        let store = open_patch_store(archive.path()).unwrap();
        assert!(store.describe().starts_with("lmdb:"));
        assert!(store.contains("S2A_MSIL2A_7").unwrap());
        assert!(!archive.path().join("lock.mdb").exists());
        drop(store);

        let store = LmdbPatchStore::open(archive.path()).unwrap();
        assert!(store.insert("S2A_MSIL2A_8", b"blob").is_err());
    }

    #[test]
    fn test_open_patch_store_detects_kind() {
        let dir = tempdir().unwrap();
        assert!(open_patch_store(dir.path()).unwrap().describe().starts_with("dir:"));
        assert!(matches!(
            open_patch_store(&dir.path().join("nope")),
            Err(SoftconError::Io(_))
        ));
    }

    #[test]
    fn test_verify_keys_reports_missing() {
        let dir = tempdir().unwrap();
        let store = DirectoryPatchStore::new(dir.path());
        store.insert("a", &fixtures::synthetic_blob(0.0)).unwrap();

        assert!(verify_keys(&store, &[PatchKey::new("a", None)]).is_ok());
        let err = verify_keys(&store, &[PatchKey::new("a", None), PatchKey::new("b", None)]).unwrap_err();
        assert!(format!("{}", err).contains("1 patch keys missing"));
    }

    #[test]
    fn test_upsampled_band_keeps_value() {
        let band = BandRaster::from_pixel(20, 20, Luma([812.0]));
        let resized = resize_band(&band, 120, 120);
        assert!(resized.as_raw().iter().all(|v| *v == 812.0));
    }
}
