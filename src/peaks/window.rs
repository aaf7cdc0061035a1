//! Local-window Bragg-peak finder.
//!
//! Works on data that already has the mask fused as sentinel values. Each
//! pixel with a full window margin inside its panel is first put through a
//! cheap candidacy test against twelve samples on the window boundary and
//! its eight immediate neighbours; only candidates pay for the background
//! statistics, which come from the samples on the outer border of the
//! window. Accepted seeds are expanded ring by ring until a ring contributes
//! no pixel.

use crate::error::BraggError;
use crate::mask::SENTINEL;
use crate::peaks::{Peak, PeakList, WindowPeakOptions};
use crate::raw_format::RawFormat;
use log::debug;
use ndarray::ArrayView2;

/// Find Bragg peaks with per-candidate window-border background estimation.
///
/// `data` must have the mask fused as sentinels (see [`crate::mask::merge`]).
/// Panels are scanned in raster order of the panel grid, so the output order
/// is deterministic.
///
/// # Errors
///
/// Returns [`BraggError::InvalidOptions`] if `window_radius < 2`.
pub fn find_peaks_local(
    data: &ArrayView2<f32>,
    raw: &RawFormat,
    options: &WindowPeakOptions,
) -> Result<PeakList, BraggError> {
    options.validate()?;
    assert_eq!(data.dim(), raw.image_shape(), "data shape must match format");

    let mut peaks = PeakList::with_capacity(options.max_num_peaks);
    let mut accepted = 0u32;
    for asic_y in 0..raw.nasics_y() {
        for asic_x in 0..raw.nasics_x() {
            accepted += find_peaks_local_panel(data, raw, asic_x, asic_y, options, &mut peaks);
        }
    }
    debug!(
        "local-window peak finder: {accepted} peaks accepted, {} stored",
        peaks.len()
    );
    Ok(peaks)
}

/// Scan a single panel; peaks are appended to `peaks`. Returns the number of
/// accepted peaks, counting any dropped beyond the list capacity.
pub fn find_peaks_local_panel(
    data: &ArrayView2<f32>,
    raw: &RawFormat,
    asic_x: usize,
    asic_y: usize,
    options: &WindowPeakOptions,
    peaks: &mut PeakList,
) -> u32 {
    let x_start = asic_x * raw.asic_nx();
    let y_start = asic_y * raw.asic_ny();
    let window_radius = options.window_radius as usize;
    let margin = window_radius + usize::from(options.double_background_window);
    if 2 * margin >= raw.asic_nx() || 2 * margin >= raw.asic_ny() {
        return 0;
    }
    let panel_number = (asic_y * raw.nasics_x() + asic_x) as u16;

    let mut accepted = 0u32;
    for y in y_start + margin..y_start + raw.asic_ny() - margin {
        for x in x_start + margin..x_start + raw.asic_nx() - margin {
            if !is_candidate(data, options, x, y) {
                continue;
            }
            let (mean, sigma) = border_statistics(data, options, x, y);

            let threshold_single_pixel = mean + options.sigma_factor_biggest_pixel * sigma;
            if data[[y, x]] <= threshold_single_pixel {
                continue;
            }

            let threshold_member_pixel = mean + options.sigma_factor_peak_pixel * sigma;
            let stats = collect_peak(data, options, x, y, threshold_member_pixel);

            let threshold_whole_peak = mean + options.sigma_factor_whole_peak * sigma;
            if stats.total_mass <= threshold_whole_peak {
                continue;
            }

            let com_x = stats.weighted_x / stats.total_mass;
            let com_y = stats.weighted_y / stats.total_mass;
            let peak_mass = stats.total_mass - stats.pixel_count as f32 * mean;
            peaks.push(Peak {
                max_intensity: stats.biggest_pixel,
                total_intensity: peak_mass,
                sigma_background: sigma,
                snr: peak_mass / sigma,
                pixel_count: stats.pixel_count,
                com_raw_x: com_x,
                com_raw_y: com_y,
                com_index: com_y.round() as i64 * raw.pix_nx() as i64 + com_x.round() as i64,
                panel_number,
            });
            accepted += 1;
        }
    }
    accepted
}

/// Cheap candidacy test: the pixel must not be masked, must dominate twelve
/// samples on the window boundary by the configured margin, and must
/// strictly exceed all eight immediate neighbours.
///
/// The boundary samples are the four window-radius offsets along each axis
/// plus their ±1 neighbours along the orthogonal axis.
fn is_candidate(
    data: &ArrayView2<f32>,
    options: &WindowPeakOptions,
    x: usize,
    y: usize,
) -> bool {
    let value = data[[y, x]];
    if value == SENTINEL {
        return false;
    }
    let r = options.window_radius as usize;
    let adjusted = value - options.min_peak_oversize_over_neighbours;

    adjusted > data[[y, x - r]]
        && adjusted > data[[y, x + r]]
        && adjusted > data[[y - 1, x - r]]
        && adjusted > data[[y - 1, x + r]]
        && adjusted > data[[y - r, x - 1]]
        && adjusted > data[[y - r, x]]
        && adjusted > data[[y - r, x + 1]]
        && adjusted > data[[y + 1, x - r]]
        && adjusted > data[[y + 1, x + r]]
        && adjusted > data[[y + r, x - 1]]
        && adjusted > data[[y + r, x]]
        && adjusted > data[[y + r, x + 1]]
        && value > data[[y - 1, x - 1]]
        && value > data[[y - 1, x]]
        && value > data[[y - 1, x + 1]]
        && value > data[[y, x - 1]]
        && value > data[[y, x + 1]]
        && value > data[[y + 1, x - 1]]
        && value > data[[y + 1, x]]
        && value > data[[y + 1, x + 1]]
}

/// Background mean and σ from the window-border samples.
///
/// Twenty samples per border ring: rows of five centered on `x` at
/// `y ± window_radius`, columns of five centered on `y` at
/// `x ± window_radius`. With the double window enabled the ring one pixel
/// further out contributes twenty more. Sentinel samples are excluded; with
/// fewer than four usable samples both estimates become infinite, which
/// rejects the candidate downstream.
fn border_statistics(
    data: &ArrayView2<f32>,
    options: &WindowPeakOptions,
    x: usize,
    y: usize,
) -> (f32, f32) {
    let mut background = [0.0f32; 40];
    let mut n = 0usize;

    let sample_ring = |radius: usize, background: &mut [f32; 40], n: &mut usize| {
        for i in 0..5usize {
            let dx = x + i - 2;
            let top = data[[y - radius, dx]];
            if top != SENTINEL {
                background[*n] = top;
                *n += 1;
            }
            let bottom = data[[y + radius, dx]];
            if bottom != SENTINEL {
                background[*n] = bottom;
                *n += 1;
            }
            let dy = y + i - 2;
            let left = data[[dy, x - radius]];
            if left != SENTINEL {
                background[*n] = left;
                *n += 1;
            }
            let right = data[[dy, x + radius]];
            if right != SENTINEL {
                background[*n] = right;
                *n += 1;
            }
        }
    };

    let window_radius = options.window_radius as usize;
    sample_ring(window_radius, &mut background, &mut n);
    if options.double_background_window {
        sample_ring(window_radius + 1, &mut background, &mut n);
    }

    if n < 4 {
        return (f32::INFINITY, f32::INFINITY);
    }

    let mut sum = 0.0f64;
    let mut sum_of_squares = 0.0f64;
    for &sample in &background[..n] {
        sum += sample as f64;
        sum_of_squares += (sample as f64) * (sample as f64);
    }
    let mean = (sum / n as f64) as f32;
    let variance =
        ((sum_of_squares - (mean as f64) * (mean as f64) * n as f64) / (n as f64 - 1.0)).max(0.0);
    let sigma = (variance.sqrt() as f32).max(options.min_sigma);
    (mean, sigma)
}

/// Running statistics of a peak under ring expansion.
struct PeakStats {
    total_mass: f32,
    weighted_x: f32,
    weighted_y: f32,
    biggest_pixel: f32,
    pixel_count: u32,
}

impl PeakStats {
    fn add(&mut self, x: usize, y: usize, value: f32) {
        self.total_mass += value;
        self.weighted_x += value * x as f32;
        self.weighted_y += value * y as f32;
        self.pixel_count += 1;
    }
}

/// Expand a seed ring by ring (radii `1..window_radius`), collecting pixels
/// strictly above the member threshold. Stops at the first ring that
/// contributes nothing.
fn collect_peak(
    data: &ArrayView2<f32>,
    options: &WindowPeakOptions,
    x: usize,
    y: usize,
    threshold: f32,
) -> PeakStats {
    let seed = data[[y, x]];
    let mut stats = PeakStats {
        total_mass: seed,
        weighted_x: seed * x as f32,
        weighted_y: seed * y as f32,
        biggest_pixel: seed,
        pixel_count: 1,
    };

    for radius in 1..options.window_radius as usize {
        let count_before = stats.pixel_count;

        let top = y - radius;
        let bottom = y + radius;
        for dx in 0..=2 * radius {
            let cx = x + dx - radius;
            let value = data[[top, cx]];
            if value > threshold {
                stats.add(cx, top, value);
            }
            let value = data[[bottom, cx]];
            if value > threshold {
                stats.add(cx, bottom, value);
            }
        }
        for dy in 1..2 * radius {
            let cy = y + dy - radius;
            let value = data[[cy, x - radius]];
            if value > threshold {
                stats.add(x - radius, cy, value);
            }
            let value = data[[cy, x + radius]];
            if value > threshold {
                stats.add(x + radius, cy, value);
            }
        }

        if stats.pixel_count == count_before {
            break;
        }
    }
    stats
}
