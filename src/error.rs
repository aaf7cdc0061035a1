//! Error types for precomputation boundaries.
//!
//! Per-image kernels never error on data content: non-finite or sentinel
//! values are treated as masked, empty selections yield empty outputs, and a
//! full peak list truncates instead of failing. Errors are only surfaced when
//! building precomputed structures from an invalid configuration.

use thiserror::Error;

/// Errors produced while building detector-level precomputed structures.
#[derive(Error, Debug)]
pub enum BraggError {
    /// The position map has non-finite entries or a panel basis collapsed.
    #[error("bad geometry for panel ({asic_x}, {asic_y}): {reason}")]
    BadGeometry {
        /// Panel column in the panel grid.
        asic_x: usize,
        /// Panel row in the panel grid.
        asic_y: usize,
        /// What exactly was degenerate.
        reason: String,
    },

    /// An options or accuracy-constants struct failed validation.
    #[error("invalid options: {0}")]
    InvalidOptions(String),

    /// No radial bin satisfied the minimum-count and minimum-width
    /// constraints after exhausting the available pixels.
    #[error(
        "no radial bin satisfies min_values_per_bin={min_values_per_bin} \
         and min_bin_width={min_bin_width}"
    )]
    InsufficientBins {
        /// Configured minimum contributor count per bin.
        min_values_per_bin: u32,
        /// Configured minimum bin width in radius units.
        min_bin_width: f32,
    },
}
