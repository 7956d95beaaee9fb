//! Multiscale and OME-style metadata documents.
//!
//! Each image group carries a `multiscales` attribute enumerating its level
//! arrays and their scale transforms relative to level 0, plus an OME-style
//! sidecar JSON file (`METADATA.ome.json`) describing the composed image for
//! downstream viewers. This module only decides the *values*; encoding is
//! plain `serde_json`.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use zarrs::storage::StorageError;

use crate::pixel::PixelType;
use crate::storage::{DynGroup, CHANNEL_DIM, TIME_DIM, X_DIM, Y_DIM, Z_DIM};

/// Group attribute key holding the multiscale document.
pub const MULTISCALES_KEY: &str = "multiscales";

/// Version string recorded in the multiscale document.
pub const MULTISCALES_VERSION: &str = "0.4";

/// File name of the OME-style sidecar document.
pub const OME_SIDECAR_FILE: &str = "METADATA.ome.json";

/// Dimension order recorded in the OME-style sidecar.
pub const OME_DIMENSION_ORDER: &str = "XYZCT";

/// One axis annotation of the multiscale document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AxisMetadata {
    /// Axis name (`"t"`, `"c"`, `"z"`, `"y"`, `"x"`).
    pub name: String,
    /// Axis type (`"time"`, `"channel"`, `"space"`).
    #[serde(rename = "type")]
    pub kind: String,
    /// Physical unit, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

impl AxisMetadata {
    fn new(name: &str, kind: &str, unit: Option<&str>) -> Self {
        Self {
            name: name.to_string(),
            kind: kind.to_string(),
            unit: unit.map(str::to_string),
        }
    }
}

/// Default `t, c, z, y, x` axis annotations.
#[must_use]
pub fn default_axes() -> Vec<AxisMetadata> {
    vec![
        AxisMetadata::new("t", "time", None),
        AxisMetadata::new("c", "channel", None),
        AxisMetadata::new("z", "space", Some("micrometer")),
        AxisMetadata::new("y", "space", Some("micrometer")),
        AxisMetadata::new("x", "space", Some("micrometer")),
    ]
}

/// A coordinate transformation attached to one dataset entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CoordinateTransformation {
    /// Per-axis multiplicative scale relative to level 0.
    Scale {
        /// One factor per axis, `t, c, z, y, x` order.
        scale: Vec<f64>,
    },
}

/// One level entry of the multiscale document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiscaleDataset {
    /// Node path of the level array, relative to the image group.
    pub path: String,
    /// Transformations mapping the level onto level-0 coordinates.
    #[serde(rename = "coordinateTransformations")]
    pub coordinate_transformations: Vec<CoordinateTransformation>,
}

/// Free-form method note recorded alongside the datasets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReductionNote {
    /// Name of the reduction statistic used to derive the levels.
    pub method: String,
}

/// The multiscale document of one image group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiscaleImage {
    /// Axis annotations.
    pub axes: Vec<AxisMetadata>,
    /// Level entries, finest first.
    pub datasets: Vec<MultiscaleDataset>,
    /// Document version.
    pub version: String,
    /// Image name.
    pub name: String,
    /// Reduction method note.
    pub metadata: ReductionNote,
}

/// Shape and scale of one produced pyramid level.
#[derive(Debug, Clone, PartialEq)]
pub struct LevelDescriptor {
    /// Level index; level 0 is full resolution.
    pub level: u64,
    /// Array shape, `t, c, z, y, x` order.
    pub shape: Vec<u64>,
    /// Per-axis scale relative to level 0.
    pub scale: Vec<f64>,
}

impl LevelDescriptor {
    /// Descriptor for a base level (identity scale).
    #[must_use]
    pub fn base(shape: Vec<u64>) -> Self {
        let dimensionality = shape.len();
        Self {
            level: 0,
            shape,
            scale: vec![1.0; dimensionality],
        }
    }
}

impl MultiscaleImage {
    /// Assemble the document for `levels`, reusing the given axis
    /// annotations.
    #[must_use]
    pub fn new(
        name: &str,
        axes: Vec<AxisMetadata>,
        levels: &[LevelDescriptor],
        method: &str,
    ) -> Self {
        let datasets = levels
            .iter()
            .map(|descriptor| MultiscaleDataset {
                path: descriptor.level.to_string(),
                coordinate_transformations: vec![CoordinateTransformation::Scale {
                    scale: descriptor.scale.clone(),
                }],
            })
            .collect();
        Self {
            axes,
            datasets,
            version: MULTISCALES_VERSION.to_string(),
            name: name.to_string(),
            metadata: ReductionNote {
                method: method.to_string(),
            },
        }
    }

    /// Level indices parsed from the dataset paths, ascending.
    ///
    /// # Errors
    /// Returns [`MetadataError::NonNumericPath`] if a path is not a level
    /// index.
    pub fn level_indices(&self) -> Result<Vec<u64>, MetadataError> {
        let mut levels = self
            .datasets
            .iter()
            .map(|dataset| {
                dataset
                    .path
                    .parse::<u64>()
                    .map_err(|_| MetadataError::NonNumericPath(dataset.path.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        levels.sort_unstable();
        Ok(levels)
    }
}

/// A metadata document error.
#[derive(Debug, Error)]
pub enum MetadataError {
    /// The group has no multiscale attribute.
    #[error("group has no {MULTISCALES_KEY} attribute")]
    MissingMultiscales,
    /// The multiscale attribute exists but does not parse.
    #[error("malformed {MULTISCALES_KEY} attribute: {0}")]
    Malformed(#[from] serde_json::Error),
    /// A dataset path is not a level index.
    #[error("dataset path {0:?} is not a numeric level index")]
    NonNumericPath(String),
    /// Underlying storage failure.
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// Sidecar file I/O failure.
    #[error("writing sidecar document: {0}")]
    Io(#[from] std::io::Error),
}

/// Read the multiscale document from a group's attributes.
///
/// # Errors
/// Returns [`MetadataError`] if the attribute is absent or malformed.
pub fn load_multiscales(group: &DynGroup) -> Result<MultiscaleImage, MetadataError> {
    let value = group
        .attributes()
        .get(MULTISCALES_KEY)
        .ok_or(MetadataError::MissingMultiscales)?;
    let documents: Vec<MultiscaleImage> = serde_json::from_value(value.clone())?;
    documents
        .into_iter()
        .next()
        .ok_or(MetadataError::MissingMultiscales)
}

/// Write `image` into the group's attributes and persist the group metadata.
///
/// # Errors
/// Returns [`MetadataError`] on serialization or storage failure.
pub fn store_multiscales(
    group: &mut DynGroup,
    image: &MultiscaleImage,
) -> Result<(), MetadataError> {
    let value = serde_json::to_value(std::slice::from_ref(image))?;
    group.attributes_mut().insert(MULTISCALES_KEY.to_string(), value);
    group.store_metadata()?;
    Ok(())
}

/// Axis annotations for a group: whatever is already recorded wins over the
/// defaults, so existing annotations are never overwritten.
#[must_use]
pub fn preserved_axes(group: &DynGroup) -> Vec<AxisMetadata> {
    match load_multiscales(group) {
        Ok(image) if !image.axes.is_empty() => image.axes,
        _ => default_axes(),
    }
}

/// One channel entry of the OME-style sidecar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OmeChannel {
    /// Channel identifier, `Channel:0:<index>`.
    pub id: String,
    /// Samples per pixel; always 1 for these images.
    pub samples_per_pixel: u32,
}

/// The OME-style sidecar document of one image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OmeImageDocument {
    /// Image name.
    pub name: String,
    /// Dimension order, `XYZCT`.
    pub dimension_order: String,
    /// Time extent.
    pub size_t: u64,
    /// Channel extent.
    pub size_c: u64,
    /// Z extent.
    pub size_z: u64,
    /// Y extent.
    pub size_y: u64,
    /// X extent.
    pub size_x: u64,
    /// Pixel type in OME nomenclature.
    pub pixel_type: String,
    /// One entry per channel.
    pub channels: Vec<OmeChannel>,
}

impl OmeImageDocument {
    /// Build the document for a full-resolution shape.
    #[must_use]
    pub fn from_shape(name: &str, shape: &[u64], pixel_type: PixelType) -> Self {
        let channels = (0..shape[CHANNEL_DIM])
            .map(|index| OmeChannel {
                id: format!("Channel:0:{index}"),
                samples_per_pixel: 1,
            })
            .collect();
        Self {
            name: name.to_string(),
            dimension_order: OME_DIMENSION_ORDER.to_string(),
            size_t: shape[TIME_DIM],
            size_c: shape[CHANNEL_DIM],
            size_z: shape[Z_DIM],
            size_y: shape[Y_DIM],
            size_x: shape[X_DIM],
            pixel_type: pixel_type.ome_name().to_string(),
            channels,
        }
    }
}

/// Write the sidecar document next to the image group.
///
/// # Errors
/// Returns [`MetadataError::Io`] if the file cannot be written.
pub fn write_ome_sidecar(root: &Path, document: &OmeImageDocument) -> Result<(), MetadataError> {
    let text = serde_json::to_string_pretty(document)?;
    std::fs::write(root.join(OME_SIDECAR_FILE), text)?;
    Ok(())
}

/// Read the sidecar document back, if present.
///
/// # Errors
/// Returns [`MetadataError`] on I/O or parse failure.
pub fn read_ome_sidecar(root: &Path) -> Result<OmeImageDocument, MetadataError> {
    let text = std::fs::read_to_string(root.join(OME_SIDECAR_FILE))?;
    Ok(serde_json::from_str(&text)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_level_image() -> MultiscaleImage {
        let levels = vec![
            LevelDescriptor::base(vec![1, 2, 1, 64, 64]),
            LevelDescriptor {
                level: 1,
                shape: vec![1, 2, 1, 32, 32],
                scale: vec![1.0, 1.0, 1.0, 2.0, 2.0],
            },
        ];
        MultiscaleImage::new("plate", default_axes(), &levels, "mean")
    }

    #[test]
    fn document_serializes_in_the_expected_layout() {
        let value = serde_json::to_value(vec![two_level_image()]).unwrap();
        let document = &value[0];
        assert_eq!(document["version"], MULTISCALES_VERSION);
        assert_eq!(document["name"], "plate");
        assert_eq!(document["metadata"]["method"], "mean");
        assert_eq!(document["datasets"][0]["path"], "0");
        assert_eq!(
            document["datasets"][1]["coordinateTransformations"][0]["type"],
            "scale"
        );
        assert_eq!(
            document["datasets"][1]["coordinateTransformations"][0]["scale"]
                .as_array()
                .unwrap()
                .len(),
            5
        );
        assert_eq!(document["axes"][1]["type"], "channel");
        // The t and c axes carry no unit.
        assert!(document["axes"][0].get("unit").is_none());
    }

    #[test]
    fn level_indices_parse_and_sort() {
        let image = two_level_image();
        assert_eq!(image.level_indices().unwrap(), vec![0, 1]);

        let mut bad = image;
        bad.datasets[0].path = "base".to_string();
        assert!(matches!(
            bad.level_indices(),
            Err(MetadataError::NonNumericPath(_))
        ));
    }

    #[test]
    fn ome_document_matches_shape() {
        let document =
            OmeImageDocument::from_shape("plate", &[1, 3, 1, 2048, 3072], PixelType::UInt16);
        assert_eq!(document.size_c, 3);
        assert_eq!(document.size_y, 2048);
        assert_eq!(document.size_x, 3072);
        assert_eq!(document.channels.len(), 3);
        assert_eq!(document.pixel_type, "uint16");
        assert_eq!(document.dimension_order, "XYZCT");
    }
}
