//! Multiresolution pyramid generation.
//!
//! Each level is derived from the previous one through a [`ReducedView`]
//! with factor 2 on the spatial axes, copying chunk-aligned regions into a
//! freshly created array with ceil-halved extents. Levels are produced
//! strictly in order; the chunk copies within one level run in parallel.

use std::path::Path;

use itertools::iproduct;
use log::info;
use rayon::prelude::*;
use thiserror::Error;
use zarrs::array::{ArrayCreateError, ArrayError};
use zarrs::array_subset::ArraySubset;
use zarrs::filesystem::FilesystemStoreCreateError;
use zarrs::group::GroupCreateError;
use zarrs::storage::StorageError;

use crate::downsample::{halving_factors, ReducedView, ReducedViewError};
use crate::metadata::{
    default_axes, load_multiscales, store_multiscales, LevelDescriptor, MetadataError,
    MultiscaleImage,
};
use crate::pixel::{PixelType, UnsupportedPixelTypeError};
use crate::reduction::ChannelReductions;
use crate::storage::{
    create_level_array, open_level_array, open_or_create_root_group, open_store, ArraySetupError,
    Compression, DynArray, CHANNEL_DIM, TIME_DIM, X_DIM, Y_DIM, Z_DIM,
};
use crate::with_pixel_type;

/// Default minimum spatial extent of the coarsest level.
pub const DEFAULT_MIN_DIMENSION: u64 = 512;

/// When to stop producing coarser levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopRule {
    /// Produce exactly this many levels in total, including the base.
    Levels(u64),
    /// Stop before any reduced spatial extent would fall below this floor.
    MinDimension(u64),
}

impl Default for StopRule {
    fn default() -> Self {
        Self::MinDimension(DEFAULT_MIN_DIMENSION)
    }
}

/// Configuration for pyramid generation.
#[derive(Debug, Clone)]
pub struct PyramidConfig {
    /// Chunk edge of the level arrays in Y and X; must match the base level.
    pub chunk_edge: u64,
    /// Compression applied to the new level arrays.
    pub compression: Compression,
    /// Stop rule.
    pub stop: StopRule,
}

impl Default for PyramidConfig {
    fn default() -> Self {
        Self {
            chunk_edge: 1024,
            compression: Compression::default(),
            stop: StopRule::default(),
        }
    }
}

/// A pyramid-generation error.
#[derive(Debug, Error)]
pub enum PyramidError {
    /// The base level array is absent or malformed.
    #[error("opening base level: {0}")]
    BaseLevel(ArrayCreateError),
    /// The base level holds an unsupported data type.
    #[error(transparent)]
    Pixel(#[from] UnsupportedPixelTypeError),
    /// The store could not be opened.
    #[error(transparent)]
    Store(#[from] FilesystemStoreCreateError),
    /// The image group could not be opened or created.
    #[error(transparent)]
    Group(#[from] GroupCreateError),
    /// A level array could not be created.
    #[error(transparent)]
    Setup(#[from] ArraySetupError),
    /// An array operation failed.
    #[error(transparent)]
    Array(#[from] ArrayError),
    /// Reading through the reduction view failed.
    #[error(transparent)]
    Reduce(#[from] ReducedViewError),
    /// Underlying storage failure.
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// Metadata could not be read or written.
    #[error(transparent)]
    Metadata(#[from] MetadataError),
}

/// Derive pyramid levels above the base level of the image at `root`.
///
/// Stops according to the configured [`StopRule`], or earlier once a further
/// halving would no longer shrink the image. Rewrites the image's multiscale
/// document to list every level with its scale transform; the image name and
/// axis annotations already recorded on the group are preserved.
///
/// Returns the descriptors of all levels, base first.
///
/// # Errors
/// Returns [`PyramidError`] if the base level cannot be opened or a level
/// fails to build. Levels written before the failure remain on disk.
pub fn build_pyramid(
    root: &Path,
    reductions: &ChannelReductions,
    config: &PyramidConfig,
) -> Result<Vec<LevelDescriptor>, PyramidError> {
    let store = open_store(root)?;
    let mut group = open_or_create_root_group(&store)?;
    let base = open_level_array(&store, 0).map_err(PyramidError::BaseLevel)?;
    let pixel_type = PixelType::from_data_type(base.data_type())?;

    let existing = load_multiscales(&group).ok();
    let name = existing
        .as_ref()
        .map(|document| document.name.clone())
        .unwrap_or_else(|| {
            root.file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_else(|| "image".to_string())
        });
    let axes = match existing {
        Some(document) if !document.axes.is_empty() => document.axes,
        _ => default_axes(),
    };

    let mut levels = vec![LevelDescriptor::base(base.shape().to_vec())];
    let mut source = base;
    loop {
        let current = levels.last().expect("at least the base level");
        let factors = halving_factors(&current.shape);
        let next_shape: Vec<u64> = current
            .shape
            .iter()
            .zip(&factors)
            .map(|(extent, factor)| extent.div_ceil(*factor))
            .collect();
        if next_shape == current.shape {
            break;
        }
        match config.stop {
            StopRule::Levels(count) => {
                if levels.len() as u64 >= count {
                    break;
                }
            }
            StopRule::MinDimension(floor) => {
                let min_reduced = next_shape
                    .iter()
                    .zip(&factors)
                    .filter(|(_, factor)| **factor > 1)
                    .map(|(extent, _)| *extent)
                    .min()
                    .unwrap_or(0);
                if min_reduced < floor {
                    break;
                }
            }
        }

        let level = levels.len() as u64;
        let scale: Vec<f64> = current
            .scale
            .iter()
            .zip(&factors)
            .map(|(scale, factor)| scale * *factor as f64)
            .collect();
        info!(
            "building level {level} of {}: shape {:?}",
            root.display(),
            next_shape
        );

        let dest = create_level_array(
            &store,
            level,
            &next_shape,
            config.chunk_edge,
            pixel_type,
            config.compression,
        )?;
        with_pixel_type!(pixel_type, T => copy_level::<T>(
            &source,
            &dest,
            &factors,
            reductions,
            config.chunk_edge,
        ))?;

        levels.push(LevelDescriptor {
            level,
            shape: next_shape,
            scale,
        });
        source = dest;
    }

    let document = MultiscaleImage::new(&name, axes, &levels, reductions.fallback().name());
    store_multiscales(&mut group, &document)?;
    Ok(levels)
}

/// Copy one level through the reduction view, chunk region by chunk region.
fn copy_level<T: crate::pixel::Pixel>(
    source: &DynArray,
    dest: &DynArray,
    factors: &[u64],
    reductions: &ChannelReductions,
    chunk_edge: u64,
) -> Result<(), PyramidError> {
    let view = ReducedView::new(source, factors.to_vec())?;
    let shape = dest.shape().to_vec();
    let tile_rows = shape[Y_DIM].div_ceil(chunk_edge);
    let tile_cols = shape[X_DIM].div_ceil(chunk_edge);
    let regions: Vec<_> = iproduct!(
        0..shape[TIME_DIM],
        0..shape[CHANNEL_DIM],
        0..shape[Z_DIM],
        0..tile_rows,
        0..tile_cols
    )
    .collect();

    regions.into_par_iter().try_for_each(|(t, c, z, ty, tx)| {
        let y0 = ty * chunk_edge;
        let y1 = (y0 + chunk_edge).min(shape[Y_DIM]);
        let x0 = tx * chunk_edge;
        let x1 = (x0 + chunk_edge).min(shape[X_DIM]);
        let subset =
            ArraySubset::new_with_ranges(&[t..t + 1, c..c + 1, z..z + 1, y0..y1, x0..x1]);
        let values = view.read::<T>(&subset, reductions.method_for(c))?;
        dest.store_array_subset_elements::<T>(&subset, &values)?;
        Ok::<(), PyramidError>(())
    })
}
