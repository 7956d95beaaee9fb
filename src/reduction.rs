//! Block-reduction statistics.
//!
//! A pyramid level is derived from the previous one by collapsing each
//! 2×2 (or 2×2×2 for volumes) neighborhood into a single output pixel with a
//! [`ReductionMethod`]. The method can be selected per channel through
//! [`ChannelReductions`]; unknown method names are rejected when the
//! configuration is built, not at first use.

use std::collections::BTreeMap;
use std::str::FromStr;

use num::cast::AsPrimitive;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pixel::Pixel;

/// Statistic used to collapse one neighborhood into one output pixel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReductionMethod {
    /// Arithmetic mean, accumulated in `f64` and rounded back to the source
    /// type (half away from zero).
    #[default]
    Mean,
    /// Most frequent value; frequency ties prefer the larger value.
    ModeMax,
    /// Most frequent value; frequency ties prefer the smaller value.
    ModeMin,
}

impl ReductionMethod {
    /// Canonical configuration name (`"mean"`, `"mode_max"`, `"mode_min"`).
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Mean => "mean",
            Self::ModeMax => "mode_max",
            Self::ModeMin => "mode_min",
        }
    }
}

impl std::fmt::Display for ReductionMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// An unrecognised reduction method name.
#[derive(Debug, Error)]
#[error("unknown reduction method {0:?}, expected one of mean, mode_max, mode_min")]
pub struct UnknownReductionMethodError(String);

impl FromStr for ReductionMethod {
    type Err = UnknownReductionMethodError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mean" => Ok(Self::Mean),
            "mode_max" => Ok(Self::ModeMax),
            "mode_min" => Ok(Self::ModeMin),
            other => Err(UnknownReductionMethodError(other.to_string())),
        }
    }
}

/// Per-channel reduction selection with a fallback for unlisted channels.
#[derive(Debug, Clone, Default)]
pub struct ChannelReductions {
    methods: BTreeMap<u64, ReductionMethod>,
    fallback: ReductionMethod,
}

impl ChannelReductions {
    /// Use `method` for every channel.
    #[must_use]
    pub fn uniform(method: ReductionMethod) -> Self {
        Self {
            methods: BTreeMap::new(),
            fallback: method,
        }
    }

    /// Build from `(channel, method name)` pairs, validating every name.
    ///
    /// # Errors
    /// Returns [`UnknownReductionMethodError`] on the first unrecognised name.
    pub fn from_names<I, S>(pairs: I) -> Result<Self, UnknownReductionMethodError>
    where
        I: IntoIterator<Item = (u64, S)>,
        S: AsRef<str>,
    {
        let mut reductions = Self::default();
        for (channel, name) in pairs {
            reductions.set(channel, name.as_ref().parse()?);
        }
        Ok(reductions)
    }

    /// Select `method` for `channel`.
    pub fn set(&mut self, channel: u64, method: ReductionMethod) {
        self.methods.insert(channel, method);
    }

    /// The method used for `channel`.
    #[must_use]
    pub fn method_for(&self, channel: u64) -> ReductionMethod {
        self.methods.get(&channel).copied().unwrap_or(self.fallback)
    }

    /// The fallback method used for channels without an explicit entry.
    #[must_use]
    pub fn fallback(&self) -> ReductionMethod {
        self.fallback
    }
}

/// Collapse one neighborhood of up to eight pixels.
///
/// # Panics
/// Panics if `values` is empty; callers always supply at least one pixel per
/// neighborhood.
pub(crate) fn reduce_block<T: Pixel>(values: &[T], method: ReductionMethod) -> T {
    assert!(!values.is_empty());
    match method {
        ReductionMethod::Mean => mean(values),
        ReductionMethod::ModeMax => mode(values, true),
        ReductionMethod::ModeMin => mode(values, false),
    }
}

fn mean<T: Pixel>(values: &[T]) -> T {
    let sum: f64 = values.iter().map(|v| AsPrimitive::<f64>::as_(*v)).sum();
    T::from_mean(sum / values.len() as f64)
}

fn mode<T: Pixel>(values: &[T], prefer_larger: bool) -> T {
    let mut best = values[0];
    let mut best_count = 0usize;
    for &candidate in values {
        let count = values.iter().filter(|&&v| v == candidate).count();
        let wins = count > best_count
            || (count == best_count
                && if prefer_larger {
                    candidate > best
                } else {
                    candidate < best
                });
        if wins {
            best = candidate;
            best_count = count;
        }
    }
    best
}
