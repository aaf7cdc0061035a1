//! Common utilities for braggscan integration tests

use braggscan::{
    build_radial_bins, compute_radial_thresholds, Geometry, RadialBinConfig, RadialBins,
    RadialThresholds, RawFormat, THRESHOLD_ITERATIONS,
};
use nalgebra::Vector2;
use ndarray::Array2;

/// A 128x128 single-panel detector with the beam center at raw coordinate
/// (63.5, 63.5), plus the matching radius map.
pub struct TestDetector {
    pub raw: RawFormat,
    pub geometry: Geometry,
    pub radius_map: Array2<f32>,
}

pub fn single_panel_128() -> TestDetector {
    let raw = RawFormat::new(128, 128, 1, 1).unwrap();
    let positions = Array2::from_shape_fn(raw.image_shape(), |(y, x)| {
        Vector2::new(x as f32 - 63.5, y as f32 - 63.5)
    });
    let geometry = Geometry::from_position_map(&raw, &positions.view()).unwrap();
    let radius_map = Array2::from_shape_fn(raw.image_shape(), |(y, x)| {
        geometry.position(x, y).norm()
    });
    TestDetector {
        raw,
        geometry,
        radius_map,
    }
}

/// Gaussian-like test peak: 100 at the center, 30 on the 4-neighbours, 10 on
/// the diagonal neighbours.
pub fn place_cross(data: &mut Array2<f32>, cx: usize, cy: usize) {
    data[[cy, cx]] += 100.0;
    for (dx, dy) in [(1i64, 0i64), (-1, 0), (0, 1), (0, -1)] {
        data[[(cy as i64 + dy) as usize, (cx as i64 + dx) as usize]] += 30.0;
    }
    for (dx, dy) in [(1i64, 1i64), (-1, 1), (1, -1), (-1, -1)] {
        data[[(cy as i64 + dy) as usize, (cx as i64 + dx) as usize]] += 10.0;
    }
}

/// Radial bins over the whole single panel with settings suitable for the
/// 128x128 test detector.
pub fn test_bins(detector: &TestDetector, mask: &Array2<u8>) -> RadialBins {
    let config = RadialBinConfig {
        min_values_per_bin: 100,
        min_bin_width: 2.0,
        detectors_to_consider: vec![(0, 0)],
        detectors_to_correct: vec![(0, 0)],
        ..RadialBinConfig::default()
    };
    build_radial_bins(
        &detector.geometry,
        &mask.view(),
        &detector.radius_map.view(),
        &config,
    )
    .unwrap()
}

/// Converged radial thresholds for one image.
pub fn test_thresholds(
    data: &Array2<f32>,
    bins: &RadialBins,
    adc_thresh: f32,
    min_snr: f32,
) -> RadialThresholds {
    compute_radial_thresholds(&data.view(), bins, adc_thresh, min_snr, THRESHOLD_ITERATIONS)
}
