//! Detection and masking of radial streaks.
//!
//! Streaks from jet scattering or shadows run along the radial direction
//! away from the beam center. The finder rates each pixel with a *radial
//! median filter* (the lower-half mean of samples taken outward along the
//! pixel's radial direction), derives a global threshold from filter
//! statistics over configured background regions, walks every configured
//! seed pixel outward as long as the filter stays above the threshold, and
//! finally masks a precomputed pixel set whose size depends on the observed
//! streak length.
//!
//! The geometry-dependent work — filter contributor lists and per-seed mask
//! pixel sets — happens once per detector/mask configuration in
//! [`build_streak_tables`]; the per-image kernel [`mask_streaks`] only reads
//! those tables.

mod finder;
mod precompute;

pub use finder::mask_streaks;
pub use precompute::build_streak_tables;

use crate::geometry::PanelPosition;
use crate::raw_format::RawFormat;
use nalgebra::Vector2;
use serde::{Deserialize, Serialize};

/// Axis-aligned pixel rectangle in raw coordinates, bounds inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelRect {
    /// Smallest fast-scan coordinate inside the rectangle.
    pub min_x: u16,
    /// Smallest slow-scan coordinate inside the rectangle.
    pub min_y: u16,
    /// Largest fast-scan coordinate inside the rectangle.
    pub max_x: u16,
    /// Largest slow-scan coordinate inside the rectangle.
    pub max_y: u16,
}

impl PixelRect {
    /// Rectangle spanning the two corners, bounds inclusive.
    pub fn new(min_x: u16, min_y: u16, max_x: u16, max_y: u16) -> Self {
        Self {
            min_x,
            min_y,
            max_x,
            max_y,
        }
    }
}

/// Accuracy constants for the streak finder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreakFinderConfig {
    /// Number of samples taken along the radial direction per filter
    /// evaluation.
    pub filter_length: u32,
    /// Minimum number of valid samples for a pixel to have a filter value.
    pub min_filter_length: u32,
    /// Step between consecutive filter samples, in pixels.
    pub filter_step: f32,
    /// σ multiples above the background mean for the streak threshold.
    pub sigma_factor: f32,
    /// Lower bound on the number of below-threshold steps tolerated while
    /// elongating a streak.
    pub streak_elongation_min_steps_count: u32,
    /// Radius-proportional part of the tolerated below-threshold steps.
    pub streak_elongation_radius_factor: f32,
    /// Half-width of the square of pixels masked around each streak point.
    pub streak_pixel_mask_radius: u32,
    /// Seed pixels to check for streaks, in raw coordinates.
    pub pixels_to_check: Vec<(u16, u16)>,
    /// Rectangles over which the background filter statistics are taken.
    pub background_estimation_regions: Vec<PixelRect>,
}

impl Default for StreakFinderConfig {
    fn default() -> Self {
        Self {
            filter_length: 30,
            min_filter_length: 20,
            filter_step: 1.0,
            sigma_factor: 6.0,
            streak_elongation_min_steps_count: 50,
            streak_elongation_radius_factor: 0.01,
            streak_pixel_mask_radius: 2,
            pixels_to_check: Vec::new(),
            background_estimation_regions: Vec::new(),
        }
    }
}

/// Precomputed mask pixels of one seed.
#[derive(Debug, Clone)]
pub(crate) struct SeedTable {
    /// Seed position in raw coordinates.
    pub(crate) x: u16,
    pub(crate) y: u16,
    /// Panel the seed sits on.
    pub(crate) panel: PanelPosition,
    /// Normalized outward radial direction at the seed.
    pub(crate) direction: Vector2<f32>,
    /// Linear indices to mask, ordered so that a prefix corresponds to a
    /// streak length.
    pub(crate) pixels_to_mask: Vec<u32>,
    /// Prefix size of `pixels_to_mask` per streak length.
    pub(crate) mask_count_for_length: Vec<u32>,
}

/// Precomputed streak-finder tables for one detector/mask configuration.
///
/// Contributor lists are stored contiguously with a `-1` terminator per
/// pixel so the per-image filter evaluation walks a single flat buffer.
#[derive(Debug, Clone)]
pub struct StreakTables {
    pub(crate) raw: RawFormat,
    /// Row stride of `contributors` (`filter_length + 1`).
    pub(crate) stride: usize,
    /// `pix_nn * stride` contributor indices, `-1` filled/terminated.
    pub(crate) contributors: Vec<i32>,
    pub(crate) seeds: Vec<SeedTable>,
    pub(crate) config: StreakFinderConfig,
}

impl StreakTables {
    /// The configuration the tables were built with.
    pub fn config(&self) -> &StreakFinderConfig {
        &self.config
    }

    /// Number of seeds with precomputed streak tables.
    pub fn seed_count(&self) -> usize {
        self.seeds.len()
    }

    /// Filter contributor indices of the pixel at `(x, y)`; empty when the
    /// pixel has no usable filter.
    pub fn contributors_of(&self, x: usize, y: usize) -> &[i32] {
        let start = self.raw.linear_index(x, y) * self.stride;
        let row = &self.contributors[start..start + self.stride];
        let end = row.iter().position(|&c| c < 0).unwrap_or(row.len());
        &row[..end]
    }
}
