//! Multiresolution pyramid assembly and plate composition for chunked
//! (Zarr) microscopy images.
//!
//! The crate builds [Zarr V3](https://zarr.dev) image pyramids with the
//! [`zarrs`] storage engine and composes many independently stored well
//! pyramids into one globally addressed plate-level pyramid:
//!
//!  - [`stack`] assembles collections of 2-D planes into the base level of a
//!    pyramid, one plane per channel, time point, or Z slice.
//!  - [`pyramid`] derives each coarser level from the previous one by
//!    power-of-two block reduction (mean, mode-max, or mode-min), writing
//!    chunk-aligned level arrays and multiscale metadata.
//!  - [`compositor`] serves chunks of a composed plate image on demand,
//!    stitching the intersecting well regions together and computing each
//!    tile at most once per composition session.
//!
//! All arrays are five-dimensional (`t, c, z, y, x`). Image file decoding is
//! a collaborator concern behind [`stack::PlaneSource`]; storage is any
//! store conforming to `zarrs`'s storage traits, with the filesystem store
//! as the default.
//!
//! ## Example
//! ```rust,ignore
//! use plate_pyramid::compositor::{CompositorConfig, TileCompositor, WellMap};
//!
//! let mut wells = WellMap::new();
//! wells.insert((0, 0, 0), "wells/a1.zarr".into());
//! wells.insert((1, 0, 0), "wells/a2.zarr".into());
//!
//! let mut compositor =
//!     TileCompositor::new("out".as_ref(), "plate", CompositorConfig::default());
//! compositor.set_well_map(wells)?;
//! compositor.compose_tile(0, 0, 0, 0)?;
//! # Ok::<(), plate_pyramid::compositor::CompositionError>(())
//! ```

pub mod compositor;
pub mod downsample;
pub mod metadata;
pub mod pixel;
pub mod pyramid;
pub mod reduction;
pub mod stack;
pub mod storage;

pub use compositor::{
    CompositionError, CompositorConfig, PlateGeometry, TileCompositor, TileId, TileOutcome,
    WellKey, WellMap,
};
pub use pixel::{Pixel, PixelType};
pub use pyramid::{build_pyramid, PyramidConfig, PyramidError, StopRule};
pub use reduction::{ChannelReductions, ReductionMethod};
pub use stack::{
    assemble_stack, Plane, PlaneSource, StackAxis, StackConfig, StackError, StackReport,
};
pub use storage::Compression;
