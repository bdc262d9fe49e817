//! BigEarthNet v2 patch metadata.
//!
//! Reads `metadata.parquet` (one row per patch: `patch_id`, `labels`, `split`,
//! `country`) and the companion table of patches with seasonal snow or
//! cloud/shadow.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::path::Path;

use parquet::file::reader::{FileReader, SerializedFileReader};
use parquet::record::{Field, Row};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::utils::error::{Result, SoftconError};

/// Official BigEarthNet v2 split a patch belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Split {
    Train,
    Validation,
    Test,
}

impl Split {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "train" => Some(Split::Train),
            "validation" | "val" => Some(Split::Validation),
            "test" => Some(Split::Test),
            _ => None,
        }
    }
}

/// One metadata row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchMetadata {
    pub patch_id: String,
    pub country: String,
    pub split: Split,
    pub labels: Vec<String>,
    /// Key of the matching Sentinel-1 patch, when stored separately
    #[serde(default)]
    pub s1_name: Option<String>,
}

/// All patches, in file order, with an id index
#[derive(Debug, Clone, Default)]
pub struct MetadataTable {
    patches: Vec<PatchMetadata>,
    index: HashMap<String, usize>,
}

impl MetadataTable {
    pub fn from_records(patches: Vec<PatchMetadata>) -> Self {
        let index = patches
            .iter()
            .enumerate()
            .map(|(i, p)| (p.patch_id.clone(), i))
            .collect();
        Self { patches, index }
    }

    /// Read the metadata parquet
    pub fn from_parquet(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let reader = SerializedFileReader::new(file)?;
        let rows = reader.metadata().file_metadata().num_rows();
        debug!("Reading {} metadata rows from {}", rows, path.display());

        let mut patches = Vec::with_capacity(rows.max(0) as usize);
        for row in reader.get_row_iter(None)? {
            patches.push(parse_patch_row(&row?)?);
        }

        info!("Loaded metadata for {} patches", patches.len());
        Ok(Self::from_records(patches))
    }

    pub fn len(&self) -> usize {
        self.patches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
    }

    pub fn get(&self, patch_id: &str) -> Option<&PatchMetadata> {
        self.index.get(patch_id).map(|&i| &self.patches[i])
    }

    pub fn patches(&self) -> &[PatchMetadata] {
        &self.patches
    }

    /// Ids of one country's patches in one split, in file order
    pub fn ids_for(&self, country: &str, split: Split) -> Vec<String> {
        self.patches
            .iter()
            .filter(|p| p.country == country && p.split == split)
            .map(|p| p.patch_id.clone())
            .collect()
    }

    /// Sorted list of countries present
    pub fn countries(&self) -> Vec<String> {
        let mut countries: Vec<String> = self
            .patches
            .iter()
            .map(|p| p.country.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        countries.sort();
        countries
    }
}

/// Patches flagged for seasonal snow or cloud/shadow
#[derive(Debug, Clone, Default)]
pub struct SnowCloudFlags {
    pub snowy: HashSet<String>,
    pub cloudy: HashSet<String>,
}

impl SnowCloudFlags {
    /// Read the snow/cloud parquet. Rows without a flag column count as unflagged.
    pub fn from_parquet(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let reader = SerializedFileReader::new(file)?;

        let mut flags = Self::default();
        for row in reader.get_row_iter(None)? {
            let row = row?;
            let mut patch_id = None;
            let mut snowy = false;
            let mut cloudy = false;
            for (name, field) in row.get_column_iter() {
                match name.as_str() {
                    "patch_id" => patch_id = Some(field_string(field, "patch_id")?),
                    "contains_seasonal_snow" => snowy = field_bool(field),
                    "contains_cloud_or_shadow" => cloudy = field_bool(field),
                    _ => {}
                }
            }
            let patch_id = patch_id
                .ok_or_else(|| SoftconError::Metadata("snow/cloud row without patch_id".to_string()))?;
            if snowy {
                flags.snowy.insert(patch_id.clone());
            }
            if cloudy {
                flags.cloudy.insert(patch_id);
            }
        }

        info!(
            "Loaded snow/cloud flags: {} snowy, {} cloudy",
            flags.snowy.len(),
            flags.cloudy.len()
        );
        Ok(flags)
    }

    /// Whether a patch is dropped under the given inclusion settings
    pub fn excludes(&self, patch_id: &str, include_snowy: bool, include_cloudy: bool) -> bool {
        (!include_snowy && self.snowy.contains(patch_id))
            || (!include_cloudy && self.cloudy.contains(patch_id))
    }
}

fn parse_patch_row(row: &Row) -> Result<PatchMetadata> {
    let mut patch_id = None;
    let mut country = None;
    let mut split = None;
    let mut labels = None;
    let mut s1_name = None;

    for (name, field) in row.get_column_iter() {
        match name.as_str() {
            "patch_id" => patch_id = Some(field_string(field, "patch_id")?),
            "country" => country = Some(field_string(field, "country")?),
            "split" => {
                let value = field_string(field, "split")?;
                split = Some(
                    Split::parse(&value)
                        .ok_or_else(|| SoftconError::Metadata(format!("unknown split '{}'", value)))?,
                );
            }
            "labels" => labels = Some(field_string_list(field)?),
            "s1_name" => {
                if let Field::Str(value) = field {
                    s1_name = Some(value.clone());
                }
            }
            _ => {}
        }
    }

    let missing = |column: &str| SoftconError::Metadata(format!("metadata row without '{}'", column));
    Ok(PatchMetadata {
        patch_id: patch_id.ok_or_else(|| missing("patch_id"))?,
        country: country.ok_or_else(|| missing("country"))?,
        split: split.ok_or_else(|| missing("split"))?,
        labels: labels.ok_or_else(|| missing("labels"))?,
        s1_name,
    })
}

fn field_string(field: &Field, column: &str) -> Result<String> {
    match field {
        Field::Str(value) => Ok(value.clone()),
        other => Err(SoftconError::Metadata(format!(
            "column '{}' is not a string: {:?}",
            column, other
        ))),
    }
}

fn field_string_list(field: &Field) -> Result<Vec<String>> {
    match field {
        Field::ListInternal(list) => list
            .elements()
            .iter()
            .map(|element| field_string(element, "labels"))
            .collect(),
        Field::Null => Ok(Vec::new()),
        other => Err(SoftconError::Metadata(format!(
            "column 'labels' is not a list: {:?}",
            other
        ))),
    }
}

fn field_bool(field: &Field) -> bool {
    matches!(field, Field::Bool(true))
}

#[cfg(test)]
pub(crate) mod fixtures {
    //! Writers for small metadata parquet files.

    use std::fs::File;
    use std::path::Path;
    use std::sync::Arc;

    use parquet::data_type::{BoolType, ByteArray, ByteArrayType};
    use parquet::file::properties::WriterProperties;
    use parquet::file::writer::SerializedFileWriter;
    use parquet::schema::parser::parse_message_type;

    use super::{PatchMetadata, Split};

    fn split_name(split: Split) -> &'static str {
        match split {
            Split::Train => "train",
            Split::Validation => "validation",
            Split::Test => "test",
        }
    }

    pub fn write_metadata(path: &Path, patches: &[PatchMetadata]) {
        let schema = Arc::new(
            parse_message_type(
                "message schema {
                    REQUIRED BYTE_ARRAY patch_id (UTF8);
                    REQUIRED group labels (LIST) {
                        REPEATED group list {
                            REQUIRED BYTE_ARRAY element (UTF8);
                        }
                    }
                    REQUIRED BYTE_ARRAY split (UTF8);
                    REQUIRED BYTE_ARRAY country (UTF8);
                }",
            )
            .unwrap(),
        );
        let file = File::create(path).unwrap();
        let mut writer =
            SerializedFileWriter::new(file, schema, Arc::new(WriterProperties::builder().build())).unwrap();
        let mut row_group = writer.next_row_group().unwrap();

        let ids: Vec<ByteArray> = patches.iter().map(|p| ByteArray::from(p.patch_id.as_str())).collect();
        let splits: Vec<ByteArray> = patches.iter().map(|p| ByteArray::from(split_name(p.split))).collect();
        let countries: Vec<ByteArray> = patches.iter().map(|p| ByteArray::from(p.country.as_str())).collect();

        let mut label_values = Vec::new();
        let mut def_levels = Vec::new();
        let mut rep_levels = Vec::new();
        for patch in patches {
            if patch.labels.is_empty() {
                def_levels.push(0);
                rep_levels.push(0);
            }
            for (i, label) in patch.labels.iter().enumerate() {
                label_values.push(ByteArray::from(label.as_str()));
                def_levels.push(1);
                rep_levels.push(if i == 0 { 0 } else { 1 });
            }
        }

        let mut column = 0;
        while let Some(mut column_writer) = row_group.next_column().unwrap() {
            let typed = column_writer.typed::<ByteArrayType>();
            match column {
                0 => typed.write_batch(&ids, None, None).unwrap(),
                1 => typed
                    .write_batch(&label_values, Some(&def_levels[..]), Some(&rep_levels[..]))
                    .unwrap(),
                2 => typed.write_batch(&splits, None, None).unwrap(),
                _ => typed.write_batch(&countries, None, None).unwrap(),
            };
            column_writer.close().unwrap();
            column += 1;
        }
        row_group.close().unwrap();
        writer.close().unwrap();
    }

    pub fn write_snow_cloud(path: &Path, rows: &[(&str, bool, bool)]) {
        let schema = Arc::new(
            parse_message_type(
                "message schema {
                    REQUIRED BYTE_ARRAY patch_id (UTF8);
                    REQUIRED BOOLEAN contains_seasonal_snow;
                    REQUIRED BOOLEAN contains_cloud_or_shadow;
                }",
            )
            .unwrap(),
        );
        let file = File::create(path).unwrap();
        let mut writer =
            SerializedFileWriter::new(file, schema, Arc::new(WriterProperties::builder().build())).unwrap();
        let mut row_group = writer.next_row_group().unwrap();

        let ids: Vec<ByteArray> = rows.iter().map(|r| ByteArray::from(r.0)).collect();
        let snow: Vec<bool> = rows.iter().map(|r| r.1).collect();
        let cloud: Vec<bool> = rows.iter().map(|r| r.2).collect();

        let mut column = 0;
        while let Some(mut column_writer) = row_group.next_column().unwrap() {
            match column {
                0 => column_writer.typed::<ByteArrayType>().write_batch(&ids, None, None).unwrap(),
                1 => column_writer.typed::<BoolType>().write_batch(&snow, None, None).unwrap(),
                _ => column_writer.typed::<BoolType>().write_batch(&cloud, None, None).unwrap(),
            };
            column_writer.close().unwrap();
            column += 1;
        }
        row_group.close().unwrap();
        writer.close().unwrap();
    }
}
