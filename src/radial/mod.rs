//! Radial binning and radius-dependent background estimation.
//!
//! Diffraction background is, to first order, a function of the distance to
//! the beam center. The [`bins`] module partitions the valid pixels of
//! selected panels into adaptive radius bins once per detector/mask
//! configuration; [`background`] uses those bins to subtract a rank-filtered
//! background surface in place, and [`thresholds`] derives per-bin mean/σ
//! detection thresholds for the radial peak finder.

pub mod background;
pub mod bins;
pub mod thresholds;

pub use background::subtract_radial_background;
pub use bins::{build_radial_bins, RadialBinConfig, RadialBins};
pub use thresholds::{compute_radial_thresholds, RadialThresholds};
