//! Plate-level tile composition.
//!
//! A [`TileCompositor`] assembles one plate-sized image pyramid out of many
//! independently stored well pyramids. Wells are registered through a
//! [`WellMap`]; tiles of the composed image are then produced on demand by
//! [`TileCompositor::compose_tile`], which locates the wells intersecting the
//! requested chunk, crops and stitches their pixels, writes the chunk once,
//! and memoizes the tile identity so repeated requests are no-ops.
//!
//! Each well pyramid contributes a single channel, stored at channel slot 0
//! of its own arrays; the `(column, row, channel)` key of the well map places
//! it on the plate.

mod regions;

pub use regions::{well_regions, PixelRect, WellRegion, WellRegions};

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info};
use parking_lot::Mutex;
use thiserror::Error;
use zarrs::array::{ArrayCreateError, ArrayError};
use zarrs::array_subset::ArraySubset;
use zarrs::filesystem::FilesystemStoreCreateError;
use zarrs::group::{Group, GroupCreateError};
use zarrs::storage::{
    ReadableWritableListableStorage, StorageError, StorePrefix, WritableStorageTraits,
};

use crate::metadata::{
    default_axes, load_multiscales, store_multiscales, write_ome_sidecar, LevelDescriptor,
    MetadataError, MultiscaleImage, OmeImageDocument, OME_SIDECAR_FILE,
};
use crate::pixel::{Pixel, PixelType, UnsupportedPixelTypeError};
use crate::storage::{
    create_level_array, open_level_array, open_or_create_root_group, open_store, ArraySetupError,
    Compression, DynArray, DIMENSIONS, X_DIM, Y_DIM,
};
use crate::with_pixel_type;

/// Well map key: `(column, row, channel)`.
pub type WellKey = (u64, u64, u64);

/// Mapping from plate position to the well pyramid's root directory.
pub type WellMap = BTreeMap<WellKey, PathBuf>;

/// Identifies one destination chunk of the composed plate image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileId {
    /// Pyramid level.
    pub level: u64,
    /// Channel index.
    pub channel: u64,
    /// Tile row index.
    pub row: u64,
    /// Tile column index.
    pub col: u64,
}

/// Whether a tile request performed work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileOutcome {
    /// The tile was computed and written.
    Computed,
    /// The tile was already complete; nothing was read or written.
    AlreadyComplete,
}

/// Geometry derived from a validated well map.
#[derive(Debug, Clone)]
pub struct PlateGeometry {
    /// Number of well rows.
    pub rows: u64,
    /// Number of well columns.
    pub cols: u64,
    /// Number of channels.
    pub channels: u64,
    /// Pyramid levels exposed by every well, ascending.
    pub levels: Vec<u64>,
    /// Per-level well extents `(height, width)`.
    pub well_extents: BTreeMap<u64, (u64, u64)>,
    /// Element type shared by every well.
    pub pixel_type: PixelType,
}

impl PlateGeometry {
    /// Plate pixel extent `(height, width)` at `level`.
    #[must_use]
    pub fn plate_extent(&self, level: u64) -> Option<(u64, u64)> {
        let (well_height, well_width) = self.well_extents.get(&level)?;
        Some((self.rows * well_height, self.cols * well_width))
    }

    /// Tile grid extent `(rows, cols)` at `level` for the given chunk edge.
    #[must_use]
    pub fn tile_counts(&self, level: u64, chunk_edge: u64) -> Option<(u64, u64)> {
        let (plate_height, plate_width) = self.plate_extent(level)?;
        Some((
            plate_height.div_ceil(chunk_edge).max(1),
            plate_width.div_ceil(chunk_edge).max(1),
        ))
    }
}

/// Configuration for plate composition.
#[derive(Debug, Clone)]
pub struct CompositorConfig {
    /// Chunk edge of the destination arrays in Y and X.
    pub chunk_edge: u64,
    /// Compression applied to the destination arrays.
    pub compression: Compression,
}

impl Default for CompositorConfig {
    fn default() -> Self {
        Self {
            chunk_edge: 1024,
            compression: Compression::default(),
        }
    }
}

/// A plate-composition error.
#[derive(Debug, Error)]
pub enum CompositionError {
    /// The supplied well map holds no wells.
    #[error("well map is empty")]
    EmptyWellMap,
    /// A well pyramid could not be inspected.
    #[error("well at {}: {reason}", path.display())]
    InvalidWell {
        /// Well pyramid root.
        path: PathBuf,
        /// Failure description.
        reason: String,
    },
    /// The wells do not expose identical pyramids.
    #[error("wells expose inconsistent pyramids: {0}")]
    InconsistentWells(String),
    /// No well map has been set.
    #[error("no well map set; call set_well_map first")]
    NoWellMap,
    /// The requested level does not exist.
    #[error("requested level {0} does not exist")]
    UnknownLevel(u64),
    /// The requested channel does not exist.
    #[error("requested channel {channel} is out of range for {channels} channels")]
    ChannelOutOfRange {
        /// Requested channel.
        channel: u64,
        /// Number of channels.
        channels: u64,
    },
    /// The requested tile row does not exist.
    #[error("requested tile row {row} is out of range for {rows} tile rows")]
    TileRowOutOfRange {
        /// Requested tile row.
        row: u64,
        /// Number of tile rows.
        rows: u64,
    },
    /// The requested tile column does not exist.
    #[error("requested tile column {col} is out of range for {cols} tile columns")]
    TileColOutOfRange {
        /// Requested tile column.
        col: u64,
        /// Number of tile columns.
        cols: u64,
    },
    /// A well needed by a tile is missing from the map.
    #[error("no well registered for column {col}, row {row}, channel {channel}")]
    MissingWell {
        /// Well grid column.
        col: u64,
        /// Well grid row.
        row: u64,
        /// Channel index.
        channel: u64,
    },
    /// The wells hold an unsupported data type.
    #[error(transparent)]
    Pixel(#[from] UnsupportedPixelTypeError),
    /// A store could not be opened.
    #[error(transparent)]
    Store(#[from] FilesystemStoreCreateError),
    /// A destination array could not be created.
    #[error(transparent)]
    Setup(#[from] ArraySetupError),
    /// A group could not be opened or created.
    #[error(transparent)]
    Group(#[from] GroupCreateError),
    /// An array could not be opened.
    #[error(transparent)]
    ArrayCreate(#[from] ArrayCreateError),
    /// An array operation failed.
    #[error(transparent)]
    Array(#[from] ArrayError),
    /// Underlying storage failure.
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// Metadata could not be read or written.
    #[error(transparent)]
    Metadata(#[from] MetadataError),
}

struct CompositionState {
    wells: WellMap,
    geometry: PlateGeometry,
    store: ReadableWritableListableStorage,
    levels: BTreeMap<u64, DynArray>,
    completed: Mutex<HashSet<TileId>>,
    in_flight: Mutex<HashMap<TileId, Arc<Mutex<()>>>>,
}

/// Composes a plate-level pyramid out of per-well pyramids.
pub struct TileCompositor {
    root: PathBuf,
    name: String,
    config: CompositorConfig,
    state: Option<CompositionState>,
}

impl TileCompositor {
    /// Create a compositor writing the composed image `<name>.zarr` under
    /// `output_dir`.
    #[must_use]
    pub fn new(output_dir: &Path, name: &str, config: CompositorConfig) -> Self {
        Self {
            root: output_dir.join(format!("{name}.zarr")),
            name: name.to_string(),
            config,
            state: None,
        }
    }

    /// Root directory of the composed image.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Geometry of the current composition, if a well map is set.
    #[must_use]
    pub fn geometry(&self) -> Option<&PlateGeometry> {
        self.state.as_ref().map(|state| &state.geometry)
    }

    /// Number of tiles materialized so far in this composition session.
    #[must_use]
    pub fn completed_tiles(&self) -> usize {
        self.state
            .as_ref()
            .map_or(0, |state| state.completed.lock().len())
    }

    /// Register the wells to compose and set up the destination pyramid.
    ///
    /// Every well is opened and validated: all wells must expose the same
    /// levels, the same per-level extents, and the same element type. One
    /// destination array per level is created, sized for the full plate, and
    /// the completed-tile set is cleared; the plate multiscale document and
    /// OME-style sidecar are written.
    ///
    /// # Errors
    /// Returns [`CompositionError`] if the map is empty, a well is unusable,
    /// or the destination cannot be set up.
    pub fn set_well_map(&mut self, wells: WellMap) -> Result<(), CompositionError> {
        if wells.is_empty() {
            return Err(CompositionError::EmptyWellMap);
        }
        if self.state.is_some() {
            self.reset_composition()?;
        }

        let mut first: Option<(WellKey, WellInfo)> = None;
        for (key, path) in &wells {
            let info = inspect_well(path)?;
            match &first {
                None => first = Some((*key, info)),
                Some((first_key, expected)) => {
                    if !info.matches(expected) {
                        return Err(CompositionError::InconsistentWells(format!(
                            "well {key:?} at {} disagrees with well {first_key:?}: \
                             {info} vs {expected}",
                            path.display()
                        )));
                    }
                }
            }
        }
        let (_, info) = first.expect("well map is non-empty");

        let (mut rows, mut cols, mut channels) = (0, 0, 0);
        for (col, row, channel) in wells.keys() {
            cols = cols.max(col + 1);
            rows = rows.max(row + 1);
            channels = channels.max(channel + 1);
        }
        let geometry = PlateGeometry {
            rows,
            cols,
            channels,
            levels: info.levels.clone(),
            well_extents: info.extents.clone(),
            pixel_type: info.pixel_type,
        };
        info!(
            "composing {} wells into {}: {rows}x{cols} wells, {channels} channels, {} levels",
            wells.len(),
            self.root.display(),
            geometry.levels.len()
        );

        let store = open_store(&self.root)?;
        let mut group = open_or_create_root_group(&store)?;

        let mut level_arrays = BTreeMap::new();
        let mut descriptors = Vec::with_capacity(geometry.levels.len());
        let (base_height, base_width) = geometry.well_extents[&geometry.levels[0]];
        for &level in &geometry.levels {
            let (well_height, well_width) = geometry.well_extents[&level];
            let shape = vec![
                1,
                channels,
                1,
                rows * well_height,
                cols * well_width,
            ];
            let array = create_level_array(
                &store,
                level,
                &shape,
                self.config.chunk_edge,
                geometry.pixel_type,
                self.config.compression,
            )?;
            level_arrays.insert(level, array);
            descriptors.push(LevelDescriptor {
                level,
                shape,
                scale: vec![
                    1.0,
                    1.0,
                    1.0,
                    base_height as f64 / well_height as f64,
                    base_width as f64 / well_width as f64,
                ],
            });
        }

        let document = MultiscaleImage::new(&self.name, default_axes(), &descriptors, &info.method);
        store_multiscales(&mut group, &document)?;
        write_ome_sidecar(
            &self.root,
            &OmeImageDocument::from_shape(&self.name, &descriptors[0].shape, geometry.pixel_type),
        )?;

        self.state = Some(CompositionState {
            wells,
            geometry,
            store,
            levels: level_arrays,
            completed: Mutex::new(HashSet::new()),
            in_flight: Mutex::new(HashMap::new()),
        });
        Ok(())
    }

    /// Materialize one tile of the composed image.
    ///
    /// Idempotent: a tile already produced in this session returns
    /// [`TileOutcome::AlreadyComplete`] without touching storage. Concurrent
    /// requests for the same tile are serialized per identity; requests for
    /// different tiles run fully in parallel.
    ///
    /// # Errors
    /// Returns a distinct [`CompositionError`] variant for each invalid
    /// coordinate. A failed tile is never marked complete and can be
    /// retried.
    pub fn compose_tile(
        &self,
        level: u64,
        channel: u64,
        row: u64,
        col: u64,
    ) -> Result<TileOutcome, CompositionError> {
        let state = self.state.as_ref().ok_or(CompositionError::NoWellMap)?;
        let geometry = &state.geometry;
        if !state.levels.contains_key(&level) {
            return Err(CompositionError::UnknownLevel(level));
        }
        if channel >= geometry.channels {
            return Err(CompositionError::ChannelOutOfRange {
                channel,
                channels: geometry.channels,
            });
        }
        let (tile_rows, tile_cols) = geometry
            .tile_counts(level, self.config.chunk_edge)
            .expect("level validated above");
        if row >= tile_rows {
            return Err(CompositionError::TileRowOutOfRange {
                row,
                rows: tile_rows,
            });
        }
        if col >= tile_cols {
            return Err(CompositionError::TileColOutOfRange {
                col,
                cols: tile_cols,
            });
        }

        let id = TileId {
            level,
            channel,
            row,
            col,
        };
        if state.completed.lock().contains(&id) {
            return Ok(TileOutcome::AlreadyComplete);
        }

        // Serialize duplicate requests on a per-identity lock, then re-check:
        // the first holder computes, later holders observe completion.
        let tile_lock = state
            .in_flight
            .lock()
            .entry(id)
            .or_default()
            .clone();
        let _guard = tile_lock.lock();
        if state.completed.lock().contains(&id) {
            return Ok(TileOutcome::AlreadyComplete);
        }

        debug!("composing tile {id:?}");
        let result = with_pixel_type!(geometry.pixel_type, T => {
            self.write_tile::<T>(state, &id)
        });
        if result.is_ok() {
            state.completed.lock().insert(id);
        }
        state.in_flight.lock().remove(&id);
        result.map(|()| TileOutcome::Computed)
    }

    fn write_tile<T: Pixel>(
        &self,
        state: &CompositionState,
        id: &TileId,
    ) -> Result<(), CompositionError> {
        let geometry = &state.geometry;
        let (plate_height, plate_width) = geometry
            .plate_extent(id.level)
            .expect("level validated by compose_tile");
        let (well_height, well_width) = geometry.well_extents[&id.level];
        let chunk_edge = self.config.chunk_edge;
        let target = PixelRect {
            y0: id.row * chunk_edge,
            y1: ((id.row + 1) * chunk_edge).min(plate_height),
            x0: id.col * chunk_edge,
            x1: ((id.col + 1) * chunk_edge).min(plate_width),
        };
        let width = target.width() as usize;
        let mut buffer = vec![T::zero(); target.height() as usize * width];

        for region in well_regions(target, well_height, well_width) {
            let key = (region.well_col, region.well_row, id.channel);
            let path = state
                .wells
                .get(&key)
                .ok_or(CompositionError::MissingWell {
                    col: region.well_col,
                    row: region.well_row,
                    channel: id.channel,
                })?;
            let well_store = open_store(path)?;
            let well_array = open_level_array(&well_store, id.level)?;
            let subset = ArraySubset::new_with_ranges(&[
                0..1,
                0..1,
                0..1,
                region.source.y0..region.source.y1,
                region.source.x0..region.source.x1,
            ]);
            let values: Vec<T> = well_array.retrieve_array_subset_elements(&subset)?;

            let region_width = region.source.width() as usize;
            for (row_index, source_row) in values.chunks_exact(region_width).enumerate() {
                let offset =
                    (region.dest.y0 as usize + row_index) * width + region.dest.x0 as usize;
                buffer[offset..offset + region_width].copy_from_slice(source_row);
            }
        }

        let dest = &state.levels[&id.level];
        let dest_subset = ArraySubset::new_with_ranges(&[
            0..1,
            id.channel..id.channel + 1,
            0..1,
            target.y0..target.y1,
            target.x0..target.x1,
        ]);
        dest.store_array_subset_elements::<T>(&dest_subset, &buffer)?;
        Ok(())
    }

    /// Discard the composed image and all derived state.
    ///
    /// Unconditionally destructive: every destination array is erased and
    /// the completed-tile set is dropped. [`set_well_map`] must be called
    /// again before further tiles can be requested.
    ///
    /// [`set_well_map`]: TileCompositor::set_well_map
    ///
    /// # Errors
    /// Returns [`CompositionError::Storage`] if the store cannot be erased.
    pub fn reset_composition(&mut self) -> Result<(), CompositionError> {
        if let Some(state) = self.state.take() {
            state.store.erase_prefix(&StorePrefix::root())?;
            let _ = std::fs::remove_file(self.root.join(OME_SIDECAR_FILE));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct WellInfo {
    levels: Vec<u64>,
    extents: BTreeMap<u64, (u64, u64)>,
    pixel_type: PixelType,
    method: String,
}

impl WellInfo {
    /// Structural agreement; the recorded reduction method may differ.
    fn matches(&self, other: &WellInfo) -> bool {
        self.levels == other.levels
            && self.extents == other.extents
            && self.pixel_type == other.pixel_type
    }
}

impl std::fmt::Display for WellInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "levels {:?}, extents {:?}, {}",
            self.levels, self.extents, self.pixel_type
        )
    }
}

fn inspect_well(path: &Path) -> Result<WellInfo, CompositionError> {
    let invalid = |reason: String| CompositionError::InvalidWell {
        path: path.to_path_buf(),
        reason,
    };

    let store = open_store(path)?;
    let group =
        Group::open(store.clone(), "/").map_err(|e| invalid(format!("opening group: {e}")))?;
    let document =
        load_multiscales(&group).map_err(|e| invalid(format!("reading multiscales: {e}")))?;
    let levels = document
        .level_indices()
        .map_err(|e| invalid(e.to_string()))?;
    if levels.first() != Some(&0) {
        return Err(invalid("pyramid has no level 0".to_string()));
    }

    let mut extents = BTreeMap::new();
    let mut pixel_type = None;
    for &level in &levels {
        let array = open_level_array(&store, level)
            .map_err(|e| invalid(format!("opening level {level}: {e}")))?;
        let shape = array.shape();
        if shape.len() != DIMENSIONS {
            return Err(invalid(format!(
                "level {level} is {}-dimensional, expected {DIMENSIONS}",
                shape.len()
            )));
        }
        extents.insert(level, (shape[Y_DIM], shape[X_DIM]));
        if level == 0 {
            pixel_type = Some(
                PixelType::from_data_type(array.data_type())
                    .map_err(|e| invalid(e.to_string()))?,
            );
        }
    }

    Ok(WellInfo {
        levels,
        extents,
        pixel_type: pixel_type.expect("level 0 is present"),
        method: document.metadata.method,
    })
}
