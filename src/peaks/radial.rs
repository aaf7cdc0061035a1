//! Radial-statistics Bragg-peak finder.
//!
//! Scans every panel for pixels above the radial detection threshold, grows
//! each seed into a connected peak with a 3×3-stencil flood fill, corrects
//! the integrated intensity against a local-ring background estimate, and
//! emits peaks that survive the SNR, ring-contrast and placement checks.
//!
//! A global pixel-in-peak map prevents double counting across panels:
//! pixels of candidates under inspection are marked 1 and never re-seed,
//! pixels of finalized peaks are marked 2.

use crate::error::BraggError;
use crate::peaks::{Peak, PeakList, RadialPeakOptions};
use crate::radial::thresholds::RadialThresholds;
use crate::raw_format::RawFormat;
use log::{debug, warn};
use ndarray::{Array2, ArrayView2};

/// 3×3 stencil walked around every accepted pixel, center included.
const SEARCH_FS: [i64; 9] = [0, -1, 0, 1, -1, 1, -1, 0, 1];
const SEARCH_SS: [i64; 9] = [0, -1, -1, -1, 0, 0, 1, 1, 1];

/// Everything a panel scan reads, shared read-only across panels.
struct SearchContext<'a, 'b> {
    copy: &'b Array2<f32>,
    mask: ArrayView2<'a, u8>,
    radius_map: ArrayView2<'a, f32>,
    thresholds: &'a RadialThresholds,
    raw: RawFormat,
    options: &'a RadialPeakOptions,
}

/// Find Bragg peaks against radially-binned background thresholds.
///
/// Panels are scanned in raster order of the panel grid, pixels in raster
/// order within each panel, so the output is deterministic for identical
/// inputs. The search stops early once `options.max_num_peaks` peaks have
/// been accepted.
///
/// # Errors
///
/// Returns [`BraggError::InvalidOptions`] for inconsistent options; the
/// image content itself never produces an error.
pub fn find_peaks_radial<'a>(
    data: &ArrayView2<f32>,
    mask: &ArrayView2<'a, u8>,
    radius_map: &ArrayView2<'a, f32>,
    thresholds: &'a RadialThresholds,
    raw: &RawFormat,
    options: &'a RadialPeakOptions,
) -> Result<PeakList, BraggError> {
    options.validate()?;
    assert_eq!(data.dim(), raw.image_shape(), "data shape must match format");
    assert_eq!(mask.dim(), raw.image_shape(), "mask shape must match format");
    assert_eq!(
        radius_map.dim(),
        raw.image_shape(),
        "radius map shape must match format"
    );

    // Scratch copy with bad pixels zeroed; the original data stays untouched.
    let mut copy = data.to_owned();
    for (pixel, &flag) in copy.iter_mut().zip(mask.iter()) {
        if flag != 0 {
            *pixel = 0.0;
        }
    }

    let context = SearchContext {
        copy: &copy,
        mask: *mask,
        radius_map: *radius_map,
        thresholds,
        raw: *raw,
        options,
    };

    let mut pix_in_peak_map = vec![0u8; raw.pix_nn()];
    let mut peaks = PeakList::with_capacity(options.max_num_peaks);

    'panels: for aiss in 0..raw.nasics_y() {
        for aifs in 0..raw.nasics_x() {
            let full = process_panel(&context, aifs, aiss, &mut pix_in_peak_map, &mut peaks);
            if full {
                break 'panels;
            }
        }
    }

    debug!(
        "radial peak finder: {} peaks ({} enumerated) over {}x{} panels",
        peaks.len(),
        peaks.peaks_found(),
        raw.nasics_x(),
        raw.nasics_y()
    );
    Ok(peaks)
}

/// Scan one panel. Returns `true` once the peak list is full and the search
/// should stop.
fn process_panel(
    context: &SearchContext,
    aifs: usize,
    aiss: usize,
    pix_in_peak_map: &mut [u8],
    peaks: &mut PeakList,
) -> bool {
    let raw = &context.raw;
    let options = context.options;
    let asic_nx = raw.asic_nx() as i64;
    let asic_ny = raw.asic_ny() as i64;
    let x_start = aifs * raw.asic_nx();
    let y_start = aiss * raw.asic_ny();

    for pxss in 1..raw.asic_ny() - 1 {
        for pxfs in 1..raw.asic_nx() - 1 {
            let x = x_start + pxfs;
            let y = y_start + pxss;
            let pidx = raw.linear_index(x, y);

            if context.mask[[y, x]] != 0 || pix_in_peak_map[pidx] != 0 {
                continue;
            }
            let bin = context.thresholds.bin_for_radius(context.radius_map[[y, x]]);
            if context.copy[[y, x]] <= context.thresholds.upper(bin) {
                continue;
            }

            let candidate = grow_peak(context, aifs, aiss, pxfs as i64, pxss as i64, pix_in_peak_map);

            let npix = candidate.positions.len() as u32;
            if npix < options.min_pix_count || npix > options.max_pix_count {
                continue;
            }
            if candidate.sum_intensity.abs() < 1e-10 {
                continue;
            }
            let com_fs = candidate.sum_com_fs / candidate.sum_intensity.abs();
            let com_ss = candidate.sum_com_ss / candidate.sum_intensity.abs();

            let (local_offset, local_sigma, background_max) = ring_background(
                context,
                aifs,
                aiss,
                com_fs.round() as i64 - x_start as i64,
                com_ss.round() as i64 - y_start as i64,
                com_fs.round() as i64,
                com_ss.round() as i64,
                pix_in_peak_map,
            );

            // Reintegrate against the local background estimate.
            let mut total = 0.0f32;
            let mut max_adjusted = 0.0f32;
            let mut sum_com_fs = 0.0f32;
            let mut sum_com_ss = 0.0f32;
            for &pi in &candidate.pixels {
                let (cx, cy) = raw.coordinates(pi);
                let adjusted = context.copy[[cy, cx]] - local_offset;
                total += adjusted;
                sum_com_fs += adjusted * cx as f32;
                sum_com_ss += adjusted * cy as f32;
                if adjusted > max_adjusted {
                    max_adjusted = adjusted;
                }
            }
            if total.abs() < 1e-10 {
                continue;
            }
            let com_fs = sum_com_fs / total.abs();
            let com_ss = sum_com_ss / total.abs();
            let snr = total / local_sigma;

            if snr < options.min_snr {
                continue;
            }
            if max_adjusted < background_max - local_offset {
                continue;
            }
            // the rounded center of mass must sit strictly inside the panel
            // and on a good pixel
            let com_x = com_fs.round() as i64;
            let com_y = com_ss.round() as i64;
            let interior_fs = (x_start as i64) < com_x && com_x < x_start as i64 + asic_nx - 1;
            let interior_ss = (y_start as i64) < com_y && com_y < y_start as i64 + asic_ny - 1;
            if !(interior_fs && interior_ss) {
                continue;
            }
            if context.mask[[com_y as usize, com_x as usize]] != 0 {
                continue;
            }

            for &pi in &candidate.pixels {
                pix_in_peak_map[pi] = 2;
            }
            peaks.push(Peak {
                max_intensity: max_adjusted,
                total_intensity: total,
                sigma_background: local_sigma,
                snr,
                pixel_count: npix,
                com_raw_x: com_fs,
                com_raw_y: com_ss,
                com_index: com_y * raw.pix_nx() as i64 + com_x,
                panel_number: (aiss * raw.nasics_x() + aifs) as u16,
            });
            if peaks.len() >= options.max_num_peaks {
                return true;
            }
        }
    }
    false
}

/// Pixels and first-pass sums of one flood-filled candidate.
struct Candidate {
    /// Panel-local coordinates of every member pixel.
    positions: Vec<(i64, i64)>,
    /// Linear indices of the member pixels (all of them, since oversized
    /// candidates are rejected before reintegration).
    pixels: Vec<usize>,
    sum_intensity: f32,
    sum_com_fs: f32,
    sum_com_ss: f32,
}

/// Flood fill a seed with the 3×3 stencil until a full pass adds no pixel.
/// Member pixels are marked 1 in the peak map as they are accepted.
fn grow_peak(
    context: &SearchContext,
    aifs: usize,
    aiss: usize,
    seed_fs: i64,
    seed_ss: i64,
    pix_in_peak_map: &mut [u8],
) -> Candidate {
    let raw = &context.raw;
    let asic_nx = raw.asic_nx() as i64;
    let asic_ny = raw.asic_ny() as i64;
    let x_start = (aifs * raw.asic_nx()) as i64;
    let y_start = (aiss * raw.asic_ny()) as i64;

    let seed_x = (seed_fs + x_start) as usize;
    let seed_y = (seed_ss + y_start) as usize;
    let seed_index = raw.linear_index(seed_x, seed_y);
    let seed_bin = context.thresholds.bin_for_radius(context.radius_map[[seed_y, seed_x]]);
    let seed_intensity = context.copy[[seed_y, seed_x]] - context.thresholds.offset(seed_bin);

    let mut candidate = Candidate {
        positions: vec![(seed_fs, seed_ss)],
        pixels: vec![seed_index],
        sum_intensity: seed_intensity,
        sum_com_fs: seed_intensity * seed_x as f32,
        sum_com_ss: seed_intensity * seed_y as f32,
    };
    pix_in_peak_map[seed_index] = 1;

    let mut p = 0;
    while p < candidate.positions.len() {
        let (pfs, pss) = candidate.positions[p];
        for k in 0..SEARCH_FS.len() {
            let nfs = pfs + SEARCH_FS[k];
            let nss = pss + SEARCH_SS[k];
            if nfs < 0 || nfs >= asic_nx || nss < 0 || nss >= asic_ny {
                continue;
            }
            let cx = (nfs + x_start) as usize;
            let cy = (nss + y_start) as usize;
            let pi = raw.linear_index(cx, cy);
            if pix_in_peak_map[pi] != 0 || context.mask[[cy, cx]] != 0 {
                continue;
            }
            let bin = context.thresholds.bin_for_radius(context.radius_map[[cy, cx]]);
            if context.copy[[cy, cx]] <= context.thresholds.upper(bin) {
                continue;
            }

            let intensity = context.copy[[cy, cx]] - context.thresholds.offset(bin);
            candidate.sum_intensity += intensity;
            candidate.sum_com_fs += intensity * cx as f32;
            candidate.sum_com_ss += intensity * cy as f32;
            pix_in_peak_map[pi] = 1;
            candidate.positions.push((nfs, nss));
            candidate.pixels.push(pi);
        }
        p += 1;
    }
    candidate
}

/// Background mean, σ and maximum over the ring around a peak center.
///
/// Samples the square of half-width `2·local_bg_radius` around the rounded
/// center, keeping pixels within that radius that are mask-good, not part of
/// any peak, and below their radial threshold. An empty sample falls back to
/// the radial background estimate at the center pixel with σ = 0.01.
#[allow(clippy::too_many_arguments)]
fn ring_background(
    context: &SearchContext,
    aifs: usize,
    aiss: usize,
    center_fs: i64,
    center_ss: i64,
    com_x: i64,
    com_y: i64,
    pix_in_peak_map: &[u8],
) -> (f32, f32, f32) {
    let raw = &context.raw;
    let asic_nx = raw.asic_nx() as i64;
    let asic_ny = raw.asic_ny() as i64;
    let x_start = (aifs * raw.asic_nx()) as i64;
    let y_start = (aiss * raw.asic_ny()) as i64;
    let ring_width = 2 * context.options.local_bg_radius as i64;

    let mut count = 0u32;
    let mut sum = 0.0f32;
    let mut sum_of_squares = 0.0f32;
    let mut background_max = 0.0f32;

    for ssj in -ring_width..ring_width {
        for fsi in -ring_width..ring_width {
            let lfs = center_fs + fsi;
            let lss = center_ss + ssj;
            if lfs < 0 || lfs >= asic_nx || lss < 0 || lss >= asic_ny {
                continue;
            }
            let pix_radius = (((fsi * fsi) + (ssj * ssj)) as f32).sqrt();
            if pix_radius > ring_width as f32 {
                continue;
            }
            let cx = (lfs + x_start) as usize;
            let cy = (lss + y_start) as usize;
            let pi = raw.linear_index(cx, cy);

            let bin = context.thresholds.bin_for_radius(context.radius_map[[cy, cx]]);
            let value = context.copy[[cy, cx]];
            if value < context.thresholds.upper(bin)
                && pix_in_peak_map[pi] == 0
                && context.mask[[cy, cx]] == 0
            {
                count += 1;
                sum += value;
                sum_of_squares += value * value;
                if value > background_max {
                    background_max = value;
                }
            }
        }
    }

    if count > 0 {
        let offset = sum / count as f32;
        let variance = sum_of_squares / count as f32 - offset * offset;
        let sigma = if variance >= 0.0 {
            variance.sqrt()
        } else {
            warn!("negative ring variance {variance} clamped at ({com_x}, {com_y})");
            0.01
        };
        (offset, sigma, background_max)
    } else {
        // no usable ring sample; fall back to the radial estimate at the
        // center pixel
        let cx = com_x.clamp(0, raw.pix_nx() as i64 - 1) as usize;
        let cy = com_y.clamp(0, raw.pix_ny() as i64 - 1) as usize;
        let bin = context.thresholds.bin_for_radius(context.radius_map[[cy, cx]]);
        (context.thresholds.offset(bin), 0.01, background_max)
    }
}
