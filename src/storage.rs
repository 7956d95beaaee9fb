//! Store and array plumbing.
//!
//! All arrays are Zarr V3 arrays managed by [`zarrs`], five-dimensional with
//! axis order `t, c, z, y, x` and chunk shape `[1, 1, 1, cs, cs]`. One image
//! pyramid is a group whose level arrays live at the paths `"0"`, `"1"`, ….
//! Stores are held behind [`ReadableWritableListableStorage`], so any
//! conforming store can be substituted for the default filesystem store.

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use zarrs::array::chunk_grid::ChunkGrid;
use zarrs::array::codec::bytes_to_bytes::blosc::{
    BloscCompressionLevel, BloscCompressor, BloscShuffleMode,
};
use zarrs::array::codec::{BloscCodec, BytesToBytesCodecTraits, GzipCodec};
use zarrs::array::{Array, ArrayBuilder, ArrayCreateError};
use zarrs::filesystem::{FilesystemStore, FilesystemStoreCreateError};
use zarrs::group::{Group, GroupBuilder, GroupCreateError};
use zarrs::plugin::PluginCreateError;
use zarrs::storage::{
    ReadableWritableListableStorage, ReadableWritableListableStorageTraits, StorageError,
};

use crate::pixel::PixelType;

/// Number of array dimensions (`t, c, z, y, x`).
pub const DIMENSIONS: usize = 5;

/// Index of the time axis.
pub const TIME_DIM: usize = 0;
/// Index of the channel axis.
pub const CHANNEL_DIM: usize = 1;
/// Index of the Z axis.
pub const Z_DIM: usize = 2;
/// Index of the Y axis.
pub const Y_DIM: usize = 3;
/// Index of the X axis.
pub const X_DIM: usize = 4;

/// An array over any conforming store.
pub type DynArray = Array<dyn ReadableWritableListableStorageTraits>;

/// A group over any conforming store.
pub type DynGroup = Group<dyn ReadableWritableListableStorageTraits>;

/// Compression applied to freshly created level arrays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Compression {
    /// Store chunks uncompressed.
    None,
    /// Blosc with the zstd backend and byte shuffling.
    Blosc {
        /// Compression level, 0-9.
        clevel: u8,
    },
    /// Gzip.
    Gzip {
        /// Compression level, 0-9.
        level: u32,
    },
}

impl Default for Compression {
    fn default() -> Self {
        Self::Blosc { clevel: 1 }
    }
}

/// An error creating a destination array.
#[derive(Debug, Error)]
pub enum ArraySetupError {
    /// The configured chunk edge is zero.
    #[error("chunk edge must be non-zero")]
    ZeroChunkEdge,
    /// Invalid blosc compression level.
    #[error("blosc compression level {0} is out of range 0-9")]
    BloscLevel(u8),
    /// Invalid gzip compression level.
    #[error("gzip compression level {0} is out of range 0-9")]
    GzipLevel(u32),
    /// Codec creation failed.
    #[error(transparent)]
    Codec(#[from] PluginCreateError),
    /// Array creation failed.
    #[error(transparent)]
    Create(#[from] ArrayCreateError),
    /// Underlying storage failure.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl Compression {
    fn codec_chain(
        &self,
        typesize: usize,
    ) -> Result<Vec<Arc<dyn BytesToBytesCodecTraits>>, ArraySetupError> {
        match *self {
            Self::None => Ok(vec![]),
            Self::Blosc { clevel } => {
                let clevel = BloscCompressionLevel::try_from(clevel)
                    .map_err(|_| ArraySetupError::BloscLevel(clevel))?;
                let codec = BloscCodec::new(
                    BloscCompressor::Zstd,
                    clevel,
                    None,
                    BloscShuffleMode::Shuffle,
                    Some(typesize),
                )?;
                Ok(vec![Arc::new(codec)])
            }
            Self::Gzip { level } => {
                let codec =
                    GzipCodec::new(level).map_err(|_| ArraySetupError::GzipLevel(level))?;
                Ok(vec![Arc::new(codec)])
            }
        }
    }
}

/// Open (or lazily create) a filesystem store rooted at `path`.
///
/// # Errors
/// Returns [`FilesystemStoreCreateError`] if the root is not usable.
pub fn open_store(
    path: &Path,
) -> Result<ReadableWritableListableStorage, FilesystemStoreCreateError> {
    Ok(Arc::new(FilesystemStore::new(path)?))
}

/// Node path of a level array within an image group.
#[must_use]
pub fn level_path(level: u64) -> String {
    format!("/{level}")
}

fn chunk_grid_tczyx(chunk_edge: u64) -> Result<ChunkGrid, ArraySetupError> {
    vec![1, 1, 1, chunk_edge, chunk_edge]
        .try_into()
        .map_err(|_| ArraySetupError::ZeroChunkEdge)
}

/// Create the level array at `level` and persist its metadata.
///
/// # Errors
/// Returns [`ArraySetupError`] on invalid configuration or storage failure.
pub fn create_level_array(
    store: &ReadableWritableListableStorage,
    level: u64,
    shape: &[u64],
    chunk_edge: u64,
    pixel_type: PixelType,
    compression: Compression,
) -> Result<DynArray, ArraySetupError> {
    let array = ArrayBuilder::new(
        shape.to_vec(),
        pixel_type.data_type(),
        chunk_grid_tczyx(chunk_edge)?,
        pixel_type.fill_value(),
    )
    .bytes_to_bytes_codecs(compression.codec_chain(pixel_type.size_bytes())?)
    .dimension_names(["t", "c", "z", "y", "x"].into())
    .build(store.clone(), &level_path(level))?;
    array.store_metadata()?;
    Ok(array)
}

/// Open the existing level array at `level`.
///
/// # Errors
/// Returns [`ArrayCreateError`] if the array is absent or malformed.
pub fn open_level_array(
    store: &ReadableWritableListableStorage,
    level: u64,
) -> Result<DynArray, ArrayCreateError> {
    Array::open(store.clone(), &level_path(level))
}

/// Open the image root group, creating it if absent.
///
/// Opening first preserves any attributes an earlier run (or another tool)
/// left on the group.
///
/// # Errors
/// Returns [`GroupCreateError`] if the group cannot be opened or built.
pub fn open_or_create_root_group(
    store: &ReadableWritableListableStorage,
) -> Result<DynGroup, GroupCreateError> {
    match Group::open(store.clone(), "/") {
        Ok(group) => Ok(group),
        Err(_) => GroupBuilder::new().build(store.clone(), "/"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_paths_are_absolute() {
        assert_eq!(level_path(0), "/0");
        assert_eq!(level_path(12), "/12");
    }

    #[test]
    fn zero_chunk_edge_is_rejected() {
        assert!(matches!(
            chunk_grid_tczyx(0),
            Err(ArraySetupError::ZeroChunkEdge)
        ));
    }

    #[test]
    fn create_open_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = open_store(dir.path()).unwrap();
        let created = create_level_array(
            &store,
            0,
            &[1, 2, 1, 32, 32],
            16,
            PixelType::UInt16,
            Compression::default(),
        )
        .unwrap();
        assert_eq!(created.shape(), &[1, 2, 1, 32, 32]);

        let opened = open_level_array(&store, 0).unwrap();
        assert_eq!(opened.shape(), created.shape());
        assert_eq!(
            PixelType::from_data_type(opened.data_type()).unwrap(),
            PixelType::UInt16
        );
    }
}
