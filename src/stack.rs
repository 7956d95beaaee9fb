//! Dimension-stack assembly.
//!
//! The assembler writes a set of same-shaped 2-D planes into the base level
//! of a fresh image pyramid, one plane per slot along a grouping axis
//! (channel, time, or Z). Plane decoding is a collaborator concern behind
//! [`PlaneSource`]; the assembler only sees extents and row-major buffers.
//!
//! Assembly is best-effort: a plane that fails to decode or write is logged
//! and recorded in the returned [`StackReport`], and its slot keeps the
//! zero fill value. Callers that need all-or-nothing semantics can check
//! [`StackReport::is_complete`].

use std::collections::BTreeSet;
use std::path::Path;

use log::{info, warn};
use rayon::prelude::*;
use thiserror::Error;
use zarrs::array::ArrayError;
use zarrs::array_subset::ArraySubset;
use zarrs::filesystem::FilesystemStoreCreateError;
use zarrs::group::GroupCreateError;
use zarrs::storage::StorageError;

use crate::metadata::{
    preserved_axes, store_multiscales, write_ome_sidecar, LevelDescriptor, MultiscaleImage,
    OmeImageDocument,
};
use crate::pixel::Pixel;
use crate::reduction::ReductionMethod;
use crate::storage::{
    create_level_array, open_or_create_root_group, open_store, ArraySetupError, Compression,
    CHANNEL_DIM, DIMENSIONS, TIME_DIM, X_DIM, Y_DIM, Z_DIM,
};

/// Axis along which supplied planes are stacked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackAxis {
    /// Stack along the time axis.
    Time,
    /// Stack along the channel axis.
    Channel,
    /// Stack along the Z axis.
    Z,
}

impl StackAxis {
    fn dimension(self) -> usize {
        match self {
            Self::Time => TIME_DIM,
            Self::Channel => CHANNEL_DIM,
            Self::Z => Z_DIM,
        }
    }
}

/// Errors surfaced by plane sources.
pub type PlaneReadError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A decoded 2-D plane: row-major pixels with their extents.
#[derive(Debug, Clone)]
pub struct Plane<T> {
    /// Y extent.
    pub height: u64,
    /// X extent.
    pub width: u64,
    /// Row-major pixel buffer of `height * width` elements.
    pub data: Vec<T>,
}

/// Decode collaborator: yields one 2-D plane on demand.
pub trait PlaneSource<T: Pixel>: Send + Sync {
    /// Pixel extents `(height, width)` of the plane.
    ///
    /// # Errors
    /// Returns an error if the source cannot be probed.
    fn extents(&self) -> Result<(u64, u64), PlaneReadError>;

    /// Decode the plane.
    ///
    /// # Errors
    /// Returns an error if the source cannot be decoded.
    fn read(&self) -> Result<Plane<T>, PlaneReadError>;
}

impl<T: Pixel, P: PlaneSource<T> + ?Sized> PlaneSource<T> for Box<P> {
    fn extents(&self) -> Result<(u64, u64), PlaneReadError> {
        (**self).extents()
    }

    fn read(&self) -> Result<Plane<T>, PlaneReadError> {
        (**self).read()
    }
}

/// Configuration for stack assembly.
#[derive(Debug, Clone)]
pub struct StackConfig {
    /// Chunk edge of the base array in Y and X.
    pub chunk_edge: u64,
    /// Compression applied to the base array.
    pub compression: Compression,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            chunk_edge: 1024,
            compression: Compression::default(),
        }
    }
}

/// One failed plane of a best-effort assembly.
#[derive(Debug)]
pub struct StackFailure {
    /// Grouping index of the failed plane.
    pub index: u64,
    /// Failure description.
    pub reason: String,
}

/// Outcome of a best-effort stack assembly.
#[derive(Debug)]
pub struct StackReport {
    /// Shape of the created base array.
    pub shape: Vec<u64>,
    /// Number of planes written.
    pub written: usize,
    /// Planes whose slots keep the zero fill value.
    pub failed: Vec<StackFailure>,
}

impl StackReport {
    /// Whether every supplied plane was written.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// A stack-assembly error.
#[derive(Debug, Error)]
pub enum StackError {
    /// No planes were supplied.
    #[error("no planes supplied for stacking")]
    Empty,
    /// The first plane could not be probed for extents.
    #[error("probing plane extents: {0}")]
    Probe(String),
    /// The output store could not be opened.
    #[error(transparent)]
    Store(#[from] FilesystemStoreCreateError),
    /// The image group could not be opened or created.
    #[error(transparent)]
    Group(#[from] GroupCreateError),
    /// The base array could not be created.
    #[error(transparent)]
    Setup(#[from] ArraySetupError),
    /// An array operation failed.
    #[error(transparent)]
    Array(#[from] ArrayError),
    /// Underlying storage failure.
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// Metadata could not be written.
    #[error(transparent)]
    Metadata(#[from] crate::metadata::MetadataError),
}

/// Assemble `planes` into the base level of an image pyramid at `output`.
///
/// Distinct grouping indices are ranked ascending and mapped to dense slots
/// `0..n` along `axis`; the other non-spatial axes have extent 1. The Y/X
/// extents and pixel type come from the first plane. Planes are written in
/// parallel; per-plane failures degrade the result instead of aborting it.
///
/// Base-level multiscale metadata (a single identity-scale dataset) and the
/// OME-style sidecar are written as a side effect. Axis annotations already
/// present on the group are preserved.
///
/// # Errors
/// Returns [`StackError`] if no plane can be probed or the destination
/// cannot be set up. Per-plane failures are reported, not raised.
pub fn assemble_stack<T, P>(
    planes: &[(u64, P)],
    axis: StackAxis,
    output: &Path,
    name: &str,
    config: &StackConfig,
) -> Result<StackReport, StackError>
where
    T: Pixel,
    P: PlaneSource<T>,
{
    if planes.is_empty() {
        return Err(StackError::Empty);
    }

    // Dense slots in ascending grouping-index order.
    let indices: BTreeSet<u64> = planes.iter().map(|(index, _)| *index).collect();
    let slot_of = |index: u64| indices.range(..index).count() as u64;

    let (height, width) = planes[0]
        .1
        .extents()
        .map_err(|e| StackError::Probe(e.to_string()))?;

    let mut shape = vec![1u64; DIMENSIONS];
    shape[axis.dimension()] = indices.len() as u64;
    shape[Y_DIM] = height;
    shape[X_DIM] = width;

    info!(
        "stacking {} planes into {}: shape {:?}",
        planes.len(),
        output.display(),
        shape
    );

    let store = open_store(output)?;
    let mut group = open_or_create_root_group(&store)?;
    let array = create_level_array(
        &store,
        0,
        &shape,
        config.chunk_edge,
        T::PIXEL_TYPE,
        config.compression,
    )?;

    let failed: Vec<StackFailure> = planes
        .par_iter()
        .filter_map(|(index, source)| {
            let reason = match write_plane::<T, P>(&array, axis, slot_of(*index), height, width, source)
            {
                Ok(()) => return None,
                Err(reason) => reason,
            };
            warn!("plane {index}: {reason}; leaving slot zero-filled");
            Some(StackFailure {
                index: *index,
                reason,
            })
        })
        .collect();

    let axes = preserved_axes(&group);
    let document = MultiscaleImage::new(
        name,
        axes,
        &[LevelDescriptor::base(shape.clone())],
        ReductionMethod::Mean.name(),
    );
    store_multiscales(&mut group, &document)?;
    write_ome_sidecar(output, &OmeImageDocument::from_shape(name, &shape, T::PIXEL_TYPE))?;

    Ok(StackReport {
        shape,
        written: planes.len() - failed.len(),
        failed,
    })
}

fn write_plane<T, P>(
    array: &crate::storage::DynArray,
    axis: StackAxis,
    slot: u64,
    height: u64,
    width: u64,
    source: &P,
) -> Result<(), String>
where
    T: Pixel,
    P: PlaneSource<T>,
{
    let plane = source.read().map_err(|e| e.to_string())?;
    if plane.height != height || plane.width != width {
        return Err(format!(
            "plane extents {}x{} do not match the stack extents {height}x{width}",
            plane.height, plane.width
        ));
    }
    if plane.data.len() as u64 != height * width {
        return Err(format!(
            "plane buffer holds {} elements, expected {}",
            plane.data.len(),
            height * width
        ));
    }

    let mut ranges = vec![0..1u64; DIMENSIONS];
    ranges[axis.dimension()] = slot..slot + 1;
    ranges[Y_DIM] = 0..height;
    ranges[X_DIM] = 0..width;
    let subset = ArraySubset::new_with_ranges(&ranges);
    array
        .store_array_subset_elements::<T>(&subset, &plane.data)
        .map_err(|e| e.to_string())
}
