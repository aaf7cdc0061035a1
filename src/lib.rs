//! Core image-processing kernels for on-the-fly analysis of 2-D X-ray
//! diffraction images from segmented pixel-array detectors.
//!
//! An image is a rectangular slab of per-pixel intensities, logically tiled by
//! a grid of equally-sized rectangular panels (ASICs) that are separated in
//! physical space. Alongside the image travel a bad-pixel mask and a per-pixel
//! radius map (distance to the beam center in physical units). On top of that
//! scaffolding this crate provides the hot path of a serial-crystallography
//! hit finder:
//!
//! - **Radial-statistics peak finder** ([`peaks::radial`]): Bragg-peak search
//!   against radially-binned background thresholds, with flood-fill peak
//!   collection and local-ring background correction.
//! - **Local-window peak finder** ([`peaks::window`]): an alternative search
//!   that estimates background from the square window border around each
//!   candidate pixel.
//! - **Streak finder** ([`streak`]): detection and masking of radial streaks
//!   (jet scattering, shadows) using a precomputed radial median filter and a
//!   greedy follow-the-streak elongation walk.
//!
//! Precomputed structures ([`geometry::Geometry`], [`radial::RadialBins`],
//! [`streak::StreakTables`]) are built once per detector/mask configuration
//! and shared read-only across per-image calls; per-image buffers are owned by
//! the caller.
//!
//! # Masking convention
//!
//! A dense mask stores 0 for good pixels and non-zero for bad ones. Inside a
//! data array, masked pixels carry the sentinel value [`SENTINEL`]
//! (`f32::MIN`); non-finite values are treated as masked as well. The
//! [`mask`] module converts between the two representations.

pub mod error;
pub mod geometry;
pub mod mask;
pub mod peaks;
pub mod radial;
pub mod raw_format;
pub mod streak;

pub use error::BraggError;
pub use geometry::{Geometry, PanelPosition};
pub use mask::{
    build_sparse_mask, expand_sparse_mask, merge, merge_into_copy, merge_inverted,
    merge_inverted_into_copy, merge_sparse, read_mask_from_data, SENTINEL,
};
pub use peaks::{
    radial::find_peaks_radial, window::find_peaks_local, Peak, PeakList, RadialPeakOptions,
    WindowPeakOptions,
};
pub use radial::{
    background::subtract_radial_background,
    bins::{build_radial_bins, RadialBinConfig, RadialBins},
    thresholds::{compute_radial_thresholds, RadialThresholds, THRESHOLD_ITERATIONS},
};
pub use raw_format::RawFormat;
pub use streak::{build_streak_tables, mask_streaks, PixelRect, StreakFinderConfig, StreakTables};
