//! Read-only block-reduced views over stored arrays.
//!
//! A [`ReducedView`] presents a stored array at a coarser resolution: each
//! read maps the requested region back onto the base array, fetches the
//! covering region, and collapses every `factor`-sized neighborhood with a
//! [`ReductionMethod`]. Edge neighborhoods clamped by the array bounds reduce
//! over the pixels that exist. The time and channel axes are never reduced.

use thiserror::Error;
use zarrs::array::ArrayError;
use zarrs::array_subset::ArraySubset;

use crate::pixel::Pixel;
use crate::reduction::{reduce_block, ReductionMethod};
use crate::storage::{DynArray, CHANNEL_DIM, DIMENSIONS, TIME_DIM, X_DIM, Y_DIM, Z_DIM};

/// Per-axis reduction factors for one halving step of a `t, c, z, y, x`
/// array: 2 on Y and X, 2 on Z only when the array is a volume.
#[must_use]
pub fn halving_factors(shape: &[u64]) -> Vec<u64> {
    let mut factors = vec![1; shape.len()];
    factors[Y_DIM] = 2;
    factors[X_DIM] = 2;
    if shape[Z_DIM] > 1 {
        factors[Z_DIM] = 2;
    }
    factors
}

/// A reduced-view error.
#[derive(Debug, Error)]
pub enum ReducedViewError {
    /// Factor count does not match the array dimensionality.
    #[error("expected {DIMENSIONS} reduction factors, got {0}")]
    Dimensionality(usize),
    /// A factor of zero was supplied.
    #[error("reduction factors must be non-zero")]
    ZeroFactor,
    /// A non-unit factor was supplied for the time or channel axis.
    #[error("the time and channel axes cannot be reduced")]
    NonSpatialFactor,
    /// The requested subset exceeds the reduced shape.
    #[error("subset {0} is out of bounds of the reduced shape {1:?}")]
    OutOfBounds(ArraySubset, Vec<u64>),
    /// Reading the base array failed.
    #[error(transparent)]
    Array(#[from] ArrayError),
}

/// A read-only block-reduced view of a stored array.
pub struct ReducedView<'a> {
    base: &'a DynArray,
    factors: Vec<u64>,
}

impl<'a> ReducedView<'a> {
    /// Create a view over `base` with the given per-axis factors.
    ///
    /// # Errors
    /// Returns [`ReducedViewError`] if the factors do not fit the array.
    pub fn new(base: &'a DynArray, factors: Vec<u64>) -> Result<Self, ReducedViewError> {
        if factors.len() != base.shape().len() {
            return Err(ReducedViewError::Dimensionality(factors.len()));
        }
        if factors.contains(&0) {
            return Err(ReducedViewError::ZeroFactor);
        }
        if factors[TIME_DIM] != 1 || factors[CHANNEL_DIM] != 1 {
            return Err(ReducedViewError::NonSpatialFactor);
        }
        Ok(Self { base, factors })
    }

    /// Shape of the view: the base shape divided by the factors, rounded up.
    #[must_use]
    pub fn shape(&self) -> Vec<u64> {
        self.base
            .shape()
            .iter()
            .zip(&self.factors)
            .map(|(extent, factor)| extent.div_ceil(*factor))
            .collect()
    }

    /// Read `subset` of the view, reducing on the fly.
    ///
    /// The result is a row-major buffer with the subset's shape.
    ///
    /// # Errors
    /// Returns [`ReducedViewError`] on out-of-bounds subsets or read failure.
    pub fn read<T: Pixel>(
        &self,
        subset: &ArraySubset,
        method: ReductionMethod,
    ) -> Result<Vec<T>, ReducedViewError> {
        let reduced_shape = self.shape();
        let start = subset.start();
        let shape = subset.shape();
        let in_bounds = start.len() == DIMENSIONS
            && start
                .iter()
                .zip(shape)
                .zip(&reduced_shape)
                .all(|((s, n), extent)| s + n <= *extent);
        if !in_bounds {
            return Err(ReducedViewError::OutOfBounds(subset.clone(), reduced_shape));
        }

        let base_shape = self.base.shape();
        let ranges: Vec<std::ops::Range<u64>> = (0..DIMENSIONS)
            .map(|dim| {
                let begin = start[dim] * self.factors[dim];
                let end = ((start[dim] + shape[dim]) * self.factors[dim]).min(base_shape[dim]);
                begin..end
            })
            .collect();
        let source_subset = ArraySubset::new_with_ranges(&ranges);
        let source: Vec<T> = self.base.retrieve_array_subset_elements(&source_subset)?;

        let src: Vec<usize> = source_subset
            .shape()
            .iter()
            .map(|&extent| extent as usize)
            .collect();
        let (fz, fy, fx) = (
            self.factors[Z_DIM] as usize,
            self.factors[Y_DIM] as usize,
            self.factors[X_DIM] as usize,
        );

        let capacity = shape.iter().product::<u64>() as usize;
        let mut out = Vec::with_capacity(capacity);
        let mut block = Vec::with_capacity(fz * fy * fx);
        for t in 0..shape[TIME_DIM] as usize {
            for c in 0..shape[CHANNEL_DIM] as usize {
                for z in 0..shape[Z_DIM] as usize {
                    for y in 0..shape[Y_DIM] as usize {
                        for x in 0..shape[X_DIM] as usize {
                            block.clear();
                            for sz in z * fz..((z + 1) * fz).min(src[Z_DIM]) {
                                for sy in y * fy..((y + 1) * fy).min(src[Y_DIM]) {
                                    for sx in x * fx..((x + 1) * fx).min(src[X_DIM]) {
                                        let index = ((((t * src[CHANNEL_DIM] + c)
                                            * src[Z_DIM]
                                            + sz)
                                            * src[Y_DIM]
                                            + sy)
                                            * src[X_DIM])
                                            + sx;
                                        block.push(source[index]);
                                    }
                                }
                            }
                            out.push(reduce_block(&block, method));
                        }
                    }
                }
            }
        }
        Ok(out)
    }
}
