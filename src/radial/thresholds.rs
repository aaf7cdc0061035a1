//! Radial threshold statistics for the radial-statistics peak finder.
//!
//! Per bin, the mean and standard deviation of the contributing intensities
//! are estimated iteratively: each iteration only accumulates values inside
//! the previous iteration's `(lower, upper)` band, which peels peak pixels
//! out of the estimate until the thresholds converge to background-only
//! statistics.

use crate::mask::SENTINEL;
use crate::radial::bins::RadialBins;
use log::debug;
use ndarray::ArrayView2;

/// Number of band-refinement iterations used by the reference configuration.
pub const THRESHOLD_ITERATIONS: usize = 5;

/// Converged per-bin background statistics and detection thresholds.
#[derive(Debug, Clone)]
pub struct RadialThresholds {
    bin_radii: Vec<f32>,
    offset: Vec<f32>,
    sigma: Vec<f32>,
    upper: Vec<f32>,
    lower: Vec<f32>,
}

impl RadialThresholds {
    /// Bin index for a radius: the bin whose representative radius brackets
    /// `radius` from below, clamped to the non-sentinel range so that the
    /// always-empty extrapolation bins never decide a pixel.
    pub fn bin_for_radius(&self, radius: f32) -> usize {
        let bracket = self.bin_radii.partition_point(|&r| r <= radius);
        bracket.saturating_sub(1).clamp(1, self.bin_radii.len() - 2)
    }

    /// Background mean of a bin.
    pub fn offset(&self, bin: usize) -> f32 {
        self.offset[bin]
    }

    /// Background standard deviation of a bin.
    pub fn sigma(&self, bin: usize) -> f32 {
        self.sigma[bin]
    }

    /// Detection threshold of a bin (`max(offset + min_snr·σ, adc_thresh)`).
    pub fn upper(&self, bin: usize) -> f32 {
        self.upper[bin]
    }

    /// Lower edge of the accumulation band of a bin.
    pub fn lower(&self, bin: usize) -> f32 {
        self.lower[bin]
    }

    /// Number of bins, sentinels included.
    pub fn bin_count(&self) -> usize {
        self.bin_radii.len()
    }
}

/// Iteratively estimate per-bin background statistics and detection
/// thresholds from one image.
///
/// Iteration 0 accumulates inside the band `(−∞, +∞)`; every following
/// iteration only keeps values `v` with `lower ≤ v < upper` from the previous
/// pass. Bins without surviving contributors report `(offset, σ) = (0, 0)`,
/// `upper = +∞` and `lower = −∞`. Sentinel and non-finite values are skipped.
pub fn compute_radial_thresholds(
    data: &ArrayView2<f32>,
    bins: &RadialBins,
    adc_thresh: f32,
    min_snr: f32,
    iterations: usize,
) -> RadialThresholds {
    let width = data.ncols();
    let bin_count = bins.bin_count();

    let mut thresholds = RadialThresholds {
        bin_radii: bins.bin_radii.clone(),
        offset: vec![0.0; bin_count],
        sigma: vec![0.0; bin_count],
        upper: vec![f32::INFINITY; bin_count],
        lower: vec![f32::NEG_INFINITY; bin_count],
    };

    let mut sum = vec![0.0f64; bin_count];
    let mut sum_of_squares = vec![0.0f64; bin_count];
    let mut count = vec![0u32; bin_count];

    for _ in 0..iterations {
        sum.fill(0.0);
        sum_of_squares.fill(0.0);
        count.fill(0);

        for (&index, &bin) in bins.sparse_data_indices.iter().zip(&bins.sparse_bin_indices) {
            let index = index as usize;
            let value = data[[index / width, index % width]];
            if value == SENTINEL || !value.is_finite() {
                continue;
            }
            let bin = bin as usize;
            if value >= thresholds.lower[bin] && value < thresholds.upper[bin] {
                sum[bin] += value as f64;
                sum_of_squares[bin] += (value as f64) * (value as f64);
                count[bin] += 1;
            }
        }

        for bin in 0..bin_count {
            if count[bin] == 0 {
                thresholds.offset[bin] = 0.0;
                thresholds.sigma[bin] = 0.0;
                thresholds.upper[bin] = f32::INFINITY;
                thresholds.lower[bin] = f32::NEG_INFINITY;
            } else {
                let n = count[bin] as f64;
                let offset = sum[bin] / n;
                let variance = (sum_of_squares[bin] / n - offset * offset).max(0.0);
                let sigma = variance.sqrt() as f32;
                let offset = offset as f32;
                thresholds.offset[bin] = offset;
                thresholds.sigma[bin] = sigma;
                thresholds.upper[bin] = (offset + min_snr * sigma).max(adc_thresh);
                thresholds.lower[bin] = offset - min_snr * sigma;
            }
        }
    }

    debug!(
        "radial thresholds: {} bins, {} empty after {iterations} iterations",
        bin_count,
        thresholds.upper.iter().filter(|u| !u.is_finite()).count(),
    );
    thresholds
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Geometry;
    use crate::radial::bins::{build_radial_bins, RadialBinConfig};
    use crate::raw_format::RawFormat;
    use approx::assert_relative_eq;
    use nalgebra::Vector2;
    use ndarray::Array2;

    fn setup(n: usize) -> (Geometry, RadialBins, Array2<f32>) {
        let fmt = RawFormat::new(n, n, 1, 1).unwrap();
        let c = (n as f32 - 1.0) / 2.0;
        let positions = Array2::from_shape_fn(fmt.image_shape(), |(y, x)| {
            Vector2::new(x as f32 - c, y as f32 - c)
        });
        let geometry = Geometry::from_position_map(&fmt, &positions.view()).unwrap();
        let mask = Array2::<u8>::zeros(fmt.image_shape());
        let radii = Array2::from_shape_fn(fmt.image_shape(), |(y, x)| {
            geometry.position(x, y).norm()
        });
        let config = RadialBinConfig {
            min_values_per_bin: 50,
            min_bin_width: 1.0,
            detectors_to_consider: vec![(0, 0)],
            detectors_to_correct: vec![(0, 0)],
            ..RadialBinConfig::default()
        };
        let bins = build_radial_bins(&geometry, &mask.view(), &radii.view(), &config).unwrap();
        (geometry, bins, radii)
    }

    #[test]
    fn test_flat_image_statistics() {
        let (geometry, bins, _) = setup(64);
        let data = Array2::from_elem(geometry.raw_format().image_shape(), 20.0f32);

        let thresholds =
            compute_radial_thresholds(&data.view(), &bins, 5.0, 3.0, THRESHOLD_ITERATIONS);

        for bin in 1..thresholds.bin_count() - 1 {
            assert_relative_eq!(thresholds.offset(bin), 20.0, epsilon = 1e-3);
            assert_relative_eq!(thresholds.sigma(bin), 0.0, epsilon = 1e-2);
            assert_relative_eq!(thresholds.upper(bin), 20.0, epsilon = 1e-2);
        }
    }

    #[test]
    fn test_adc_floor_applies() {
        let (geometry, bins, _) = setup(64);
        let data = Array2::zeros(geometry.raw_format().image_shape());

        let thresholds =
            compute_radial_thresholds(&data.view(), &bins, 10.0, 3.0, THRESHOLD_ITERATIONS);

        for bin in 1..thresholds.bin_count() - 1 {
            assert_relative_eq!(thresholds.offset(bin), 0.0);
            assert_relative_eq!(thresholds.upper(bin), 10.0);
        }
    }

    #[test]
    fn test_bright_outliers_peeled_off() {
        let (geometry, bins, _) = setup(64);
        let mut data = Array2::from_elem(geometry.raw_format().image_shape(), 1.0f32);
        // a hot spot that would wreck the naive mean
        data[[31, 31]] = 5000.0;
        data[[31, 32]] = 4000.0;

        let thresholds =
            compute_radial_thresholds(&data.view(), &bins, 2.0, 3.0, THRESHOLD_ITERATIONS);

        let bin = thresholds.bin_for_radius(0.8);
        assert!(
            thresholds.upper(bin) < 100.0,
            "outliers not excluded, upper = {}",
            thresholds.upper(bin)
        );
        assert_relative_eq!(thresholds.offset(bin), 1.0, epsilon = 0.1);
    }

    #[test]
    fn test_empty_bins_are_inert() {
        let (geometry, bins, _) = setup(64);
        let data = Array2::zeros(geometry.raw_format().image_shape());
        let thresholds = compute_radial_thresholds(&data.view(), &bins, 1.0, 3.0, 5);

        // sentinel bins never accumulate anything
        assert_eq!(thresholds.upper(0), f32::INFINITY);
        assert_eq!(thresholds.lower(0), f32::NEG_INFINITY);
        let last = thresholds.bin_count() - 1;
        assert_eq!(thresholds.upper(last), f32::INFINITY);
    }

    #[test]
    fn test_bin_for_radius_clamps_to_real_bins() {
        let (_, bins, _) = setup(64);
        let data_shape = (64, 64);
        let data = Array2::zeros(data_shape);
        let thresholds = compute_radial_thresholds(&data.view(), &bins, 1.0, 3.0, 5);

        let last_real = thresholds.bin_count() - 2;
        assert_eq!(thresholds.bin_for_radius(-1.0), 1);
        assert_eq!(thresholds.bin_for_radius(0.0), 1);
        assert_eq!(thresholds.bin_for_radius(1e9), last_real);
        // a mid-range radius lands strictly inside
        let mid = thresholds.bin_for_radius(15.0);
        assert!(mid >= 1 && mid <= last_real);
    }

    #[test]
    fn test_sentinel_values_skipped() {
        let (geometry, bins, _) = setup(64);
        let mut data = Array2::from_elem(geometry.raw_format().image_shape(), 3.0f32);
        data[[20, 20]] = SENTINEL;
        data[[21, 20]] = f32::NAN;

        let thresholds = compute_radial_thresholds(&data.view(), &bins, 1.0, 3.0, 5);
        for bin in 1..thresholds.bin_count() - 1 {
            assert_relative_eq!(thresholds.offset(bin), 3.0, epsilon = 1e-4);
        }
    }
}
