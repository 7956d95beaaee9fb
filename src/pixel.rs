//! Pixel element types.
//!
//! Every stored array in this crate holds one of a fixed set of numeric
//! element types. [`PixelType`] enumerates them and maps them onto
//! [`zarrs::array::DataType`]; the [`Pixel`] trait ties the enumeration back
//! to the Rust primitives so kernels can be written generically and
//! monomorphized with [`with_pixel_type!`](crate::with_pixel_type).

use num::cast::AsPrimitive;
use num::Zero;
use thiserror::Error;
use zarrs::array::{DataType, Element, ElementOwned, FillValue};

/// Element type of a stored image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelType {
    /// `uint8`
    UInt8,
    /// `uint16`
    UInt16,
    /// `uint32`
    UInt32,
    /// `uint64`
    UInt64,
    /// `int8`
    Int8,
    /// `int16`
    Int16,
    /// `int32`
    Int32,
    /// `int64`
    Int64,
    /// `float32`
    Float32,
    /// `float64`
    Float64,
}

/// The stored data type is not a supported pixel type.
#[derive(Debug, Error)]
#[error("unsupported data type {0} for image pixels")]
pub struct UnsupportedPixelTypeError(pub String);

impl PixelType {
    /// Map a stored [`DataType`] onto a pixel type.
    ///
    /// # Errors
    /// Returns [`UnsupportedPixelTypeError`] for non-numeric data types.
    pub fn from_data_type(data_type: &DataType) -> Result<Self, UnsupportedPixelTypeError> {
        match data_type {
            DataType::UInt8 => Ok(Self::UInt8),
            DataType::UInt16 => Ok(Self::UInt16),
            DataType::UInt32 => Ok(Self::UInt32),
            DataType::UInt64 => Ok(Self::UInt64),
            DataType::Int8 => Ok(Self::Int8),
            DataType::Int16 => Ok(Self::Int16),
            DataType::Int32 => Ok(Self::Int32),
            DataType::Int64 => Ok(Self::Int64),
            DataType::Float32 => Ok(Self::Float32),
            DataType::Float64 => Ok(Self::Float64),
            other => Err(UnsupportedPixelTypeError(other.to_string())),
        }
    }

    /// The corresponding stored [`DataType`].
    #[must_use]
    pub fn data_type(&self) -> DataType {
        match self {
            Self::UInt8 => DataType::UInt8,
            Self::UInt16 => DataType::UInt16,
            Self::UInt32 => DataType::UInt32,
            Self::UInt64 => DataType::UInt64,
            Self::Int8 => DataType::Int8,
            Self::Int16 => DataType::Int16,
            Self::Int32 => DataType::Int32,
            Self::Int64 => DataType::Int64,
            Self::Float32 => DataType::Float32,
            Self::Float64 => DataType::Float64,
        }
    }

    /// Zero fill value for freshly created arrays.
    #[must_use]
    pub fn fill_value(&self) -> FillValue {
        match self {
            Self::UInt8 => FillValue::from(0u8),
            Self::UInt16 => FillValue::from(0u16),
            Self::UInt32 => FillValue::from(0u32),
            Self::UInt64 => FillValue::from(0u64),
            Self::Int8 => FillValue::from(0i8),
            Self::Int16 => FillValue::from(0i16),
            Self::Int32 => FillValue::from(0i32),
            Self::Int64 => FillValue::from(0i64),
            Self::Float32 => FillValue::from(0f32),
            Self::Float64 => FillValue::from(0f64),
        }
    }

    /// Element size in bytes.
    #[must_use]
    pub fn size_bytes(&self) -> usize {
        match self {
            Self::UInt8 | Self::Int8 => 1,
            Self::UInt16 | Self::Int16 => 2,
            Self::UInt32 | Self::Int32 | Self::Float32 => 4,
            Self::UInt64 | Self::Int64 | Self::Float64 => 8,
        }
    }

    /// Canonical lowercase name (`"uint16"`, `"float32"`, ...).
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::UInt8 => "uint8",
            Self::UInt16 => "uint16",
            Self::UInt32 => "uint32",
            Self::UInt64 => "uint64",
            Self::Int8 => "int8",
            Self::Int16 => "int16",
            Self::Int32 => "int32",
            Self::Int64 => "int64",
            Self::Float32 => "float32",
            Self::Float64 => "float64",
        }
    }

    /// Pixel type name in OME nomenclature (`"float"`/`"double"` for the
    /// floating point types).
    #[must_use]
    pub fn ome_name(&self) -> &'static str {
        match self {
            Self::Float32 => "float",
            Self::Float64 => "double",
            other => other.name(),
        }
    }
}

impl std::fmt::Display for PixelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A Rust primitive usable as an image element.
pub trait Pixel:
    Element + ElementOwned + Copy + Default + PartialOrd + Send + Sync + Zero + AsPrimitive<f64> + 'static
{
    /// The corresponding [`PixelType`].
    const PIXEL_TYPE: PixelType;

    /// Convert an exact mean back into the pixel type.
    ///
    /// Integer types round half away from zero (round-half-up for the
    /// unsigned types); floating point types keep the exact value.
    fn from_mean(mean: f64) -> Self;
}

macro_rules! impl_pixel_int {
    ($($t:ty => $variant:ident),* $(,)?) => {
        $(
            impl Pixel for $t {
                const PIXEL_TYPE: PixelType = PixelType::$variant;

                fn from_mean(mean: f64) -> Self {
                    mean.round() as $t
                }
            }
        )*
    };
}

macro_rules! impl_pixel_float {
    ($($t:ty => $variant:ident),* $(,)?) => {
        $(
            impl Pixel for $t {
                const PIXEL_TYPE: PixelType = PixelType::$variant;

                fn from_mean(mean: f64) -> Self {
                    mean as $t
                }
            }
        )*
    };
}

impl_pixel_int!(
    u8 => UInt8,
    u16 => UInt16,
    u32 => UInt32,
    u64 => UInt64,
    i8 => Int8,
    i16 => Int16,
    i32 => Int32,
    i64 => Int64,
);

impl_pixel_float!(f32 => Float32, f64 => Float64);

/// Monomorphize an expression over the primitive behind a [`PixelType`].
///
/// ```ignore
/// let total = with_pixel_type!(pixel_type, T => sum_region::<T>(&array, &subset)?);
/// ```
#[macro_export]
macro_rules! with_pixel_type {
    ($pixel_type:expr, $T:ident => $body:expr) => {
        match $pixel_type {
            $crate::pixel::PixelType::UInt8 => {
                type $T = u8;
                $body
            }
            $crate::pixel::PixelType::UInt16 => {
                type $T = u16;
                $body
            }
            $crate::pixel::PixelType::UInt32 => {
                type $T = u32;
                $body
            }
            $crate::pixel::PixelType::UInt64 => {
                type $T = u64;
                $body
            }
            $crate::pixel::PixelType::Int8 => {
                type $T = i8;
                $body
            }
            $crate::pixel::PixelType::Int16 => {
                type $T = i16;
                $body
            }
            $crate::pixel::PixelType::Int32 => {
                type $T = i32;
                $body
            }
            $crate::pixel::PixelType::Int64 => {
                type $T = i64;
                $body
            }
            $crate::pixel::PixelType::Float32 => {
                type $T = f32;
                $body
            }
            $crate::pixel::PixelType::Float64 => {
                type $T = f64;
                $body
            }
        }
    };
}
