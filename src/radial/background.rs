//! Rank-filtered radial background subtraction.
//!
//! Per image, each bin's contributing intensities are gathered through the
//! precomputed sparse membership and reduced to the value at the configured
//! rank by partial selection. The two sentinel bins are filled by linear
//! extrapolation from the adjacent bin pair, and every assigned pixel gets
//! the radially interpolated background value subtracted in place.

use crate::mask::SENTINEL;
use crate::radial::bins::RadialBins;
use ndarray::ArrayViewMut2;

/// Subtract the rank-filtered radial background from `data` in place.
///
/// `rank` selects the per-bin background value (0.5 = median); values outside
/// `[0, 1]` are clamped. Pixels without a bin assignment and pixels carrying
/// the sentinel value are left untouched.
pub fn subtract_radial_background(data: &mut ArrayViewMut2<f32>, bins: &RadialBins, rank: f32) {
    let width = data.ncols();
    let bin_values = compute_bin_values(data, bins, rank.clamp(0.0, 1.0));

    for (index, &bin) in bins.intra_bin_index.iter().enumerate() {
        if bin == crate::radial::bins::UNASSIGNED_BIN {
            continue;
        }
        let pixel = &mut data[[index / width, index % width]];
        if *pixel == SENTINEL {
            continue;
        }
        let bin = bin as usize;
        let t = bins.intra_bin_interp[index];
        *pixel -= bin_values[bin] + t * (bin_values[bin + 1] - bin_values[bin]);
    }
}

/// Per-bin background values at the requested rank, with linearly
/// extrapolated sentinel bins.
fn compute_bin_values(data: &ArrayViewMut2<f32>, bins: &RadialBins, rank: f32) -> Vec<f32> {
    let width = data.ncols();
    let bin_count = bins.bin_count();

    let mut bins_with_data: Vec<Vec<f32>> = vec![Vec::new(); bin_count];
    for (bin, count) in bins.data_count_per_bin.iter().enumerate() {
        bins_with_data[bin].reserve(*count as usize);
    }
    for (&index, &bin) in bins.sparse_data_indices.iter().zip(&bins.sparse_bin_indices) {
        let index = index as usize;
        bins_with_data[bin as usize].push(data[[index / width, index % width]]);
    }

    let mut bin_values = vec![0.0f32; bin_count];
    for bin in 1..bin_count - 1 {
        let values = &mut bins_with_data[bin];
        debug_assert!(!values.is_empty(), "non-sentinel bin without contributors");
        let int_rank = ((rank * values.len() as f32) as usize).max(1) - 1;
        let (_, value, _) = values.select_nth_unstable_by(int_rank, |a, b| a.total_cmp(b));
        bin_values[bin] = *value;
    }

    // linear extrapolation for the sentinel bins at both ends
    let radii = &bins.bin_radii;
    let last = bin_count - 1;
    if bin_count >= 4 {
        bin_values[0] = bin_values[1]
            + (bin_values[1] - bin_values[2]) / (radii[2] - radii[1]) * (radii[1] - radii[0]);
        bin_values[last] = bin_values[last - 1]
            + (bin_values[last - 1] - bin_values[last - 2]) / (radii[last - 1] - radii[last - 2])
                * (radii[last] - radii[last - 1]);
    } else {
        // a single real bin extrapolates flat
        bin_values[0] = bin_values[1];
        bin_values[last] = bin_values[1];
    }
    bin_values
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

    fn setup(n: usize) -> (Geometry, Array2<u8>, Array2<f32>) {
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
        (geometry, mask, radii)
    }

    fn config() -> RadialBinConfig {
        RadialBinConfig {
            min_values_per_bin: 50,
            min_bin_width: 1.0,
            detectors_to_consider: vec![(0, 0)],
            detectors_to_correct: vec![(0, 0)],
            ..RadialBinConfig::default()
        }
    }

    #[test]
    fn test_constant_background_subtracts_to_zero() {
        let (geometry, mask, radii) = setup(64);
        let bins = build_radial_bins(&geometry, &mask.view(), &radii.view(), &config()).unwrap();

        let mut data = Array2::from_elem(geometry.raw_format().image_shape(), 42.0f32);
        subtract_radial_background(&mut data.view_mut(), &bins, 0.5);

        for y in 1..63 {
            for x in 1..63 {
                assert_relative_eq!(data[[y, x]], 0.0, epsilon = 1e-4);
            }
        }
        // border pixels have no assignment and stay untouched
        assert_relative_eq!(data[[0, 10]], 42.0);
    }

    #[test]
    fn test_sentinel_pixels_untouched() {
        let (geometry, mask, radii) = setup(64);
        let bins = build_radial_bins(&geometry, &mask.view(), &radii.view(), &config()).unwrap();

        let mut data = Array2::from_elem(geometry.raw_format().image_shape(), 5.0f32);
        data[[30, 30]] = SENTINEL;
        subtract_radial_background(&mut data.view_mut(), &bins, 0.5);

        assert_eq!(data[[30, 30]], SENTINEL);
    }

    #[test]
    fn test_radial_ramp_mostly_removed() {
        let (geometry, mask, radii) = setup(64);
        let bins = build_radial_bins(&geometry, &mask.view(), &radii.view(), &config()).unwrap();

        // background that grows linearly with radius
        let mut data = radii.mapv(|r| 10.0 + 2.0 * r);
        subtract_radial_background(&mut data.view_mut(), &bins, 0.5);

        for y in 2..62 {
            for x in 2..62 {
                assert!(
                    data[[y, x]].abs() < 4.0,
                    "residual {} too large at ({x}, {y})",
                    data[[y, x]]
                );
            }
        }
    }

    #[test]
    fn test_rank_zero_selects_minimum() {
        let (geometry, mask, radii) = setup(64);
        let bins = build_radial_bins(&geometry, &mask.view(), &radii.view(), &config()).unwrap();

        // one bright outlier must not shift a rank-0 background
        let mut data = Array2::from_elem(geometry.raw_format().image_shape(), 7.0f32);
        data[[31, 31]] = 10_000.0;
        subtract_radial_background(&mut data.view_mut(), &bins, 0.0);

        assert_relative_eq!(data[[10, 10]], 0.0, epsilon = 1e-4);
        assert_relative_eq!(data[[31, 31]], 9993.0, epsilon = 1e-2);
    }
}
