//! Per-image streak detection and masking.
//!
//! The kernel has three phases: a global threshold from the filter
//! statistics over the configured background regions, a growth walk per seed
//! recording the observed streak length, and a final masking pass that
//! applies the precomputed pixel-set prefix for each grown streak. Masking
//! only after all seeds are grown keeps the filter inputs stable during
//! growth.

use crate::mask::SENTINEL;
use crate::streak::{SeedTable, StreakTables};
use log::debug;
use ndarray::ArrayViewMut2;

/// Detect streaks and write the sentinel into the masked pixels in place.
///
/// Seeds whose filter contributor lists are insufficient, images without
/// usable background statistics, and seeds whose filter value stays below
/// the threshold are all silent no-ops.
pub fn mask_streaks(data: &mut ArrayViewMut2<f32>, tables: &StreakTables) {
    let threshold = match streak_threshold(data, tables) {
        Some(threshold) => threshold,
        None => {
            debug!("streak finder: no usable background region, skipping image");
            return;
        }
    };

    let mut grown: Vec<(usize, usize)> = Vec::with_capacity(tables.seeds.len());
    for (seed_number, seed) in tables.seeds.iter().enumerate() {
        let filter_value = radial_filter(data, tables, seed.x as usize, seed.y as usize);
        if filter_value > threshold {
            let length = grow_streak(data, tables, seed, threshold);
            grown.push((seed_number, length));
        }
    }

    let width = tables.raw.pix_nx();
    for &(seed_number, length) in &grown {
        let seed = &tables.seeds[seed_number];
        let length = length.min(seed.mask_count_for_length.len() - 1);
        let count = seed.mask_count_for_length[length] as usize;
        for &index in &seed.pixels_to_mask[..count] {
            let index = index as usize;
            data[[index / width, index % width]] = SENTINEL;
        }
    }

    debug!(
        "streak finder: {} of {} seeds grew a streak (threshold {threshold})",
        grown.len(),
        tables.seeds.len()
    );
}

/// Walk outward from a seed while the radial filter keeps supporting the
/// streak; returns the integer streak length.
///
/// Each supporting step resets the give-up counter and re-derives the
/// tolerated gap from the current radius, so streaks may cross short gaps
/// that scale with their distance to the beam center.
fn grow_streak(
    data: &ArrayViewMut2<f32>,
    tables: &StreakTables,
    seed: &SeedTable,
    threshold: f32,
) -> usize {
    let config = &tables.config;
    let mut length = 0usize;
    let mut point = nalgebra::Vector2::new(seed.x as f32, seed.y as f32) + seed.direction;
    let mut steps_without_streak_pixel = 0u32;
    let radius = (seed.panel.virtual_zero_raw - point).norm();
    let mut tolerated_steps = (config.streak_elongation_min_steps_count as f32)
        .max(config.streak_elongation_radius_factor * radius);

    while (steps_without_streak_pixel as f32) < tolerated_steps
        && seed.panel.contains(point.x, point.y)
    {
        length += 1;

        let x = point.x.round() as usize;
        let y = point.y.round() as usize;
        if radial_filter(data, tables, x, y) > threshold {
            steps_without_streak_pixel = 0;
            let radius = (seed.panel.virtual_zero_raw - point).norm();
            tolerated_steps = (config.streak_elongation_min_steps_count as f32)
                .max(config.streak_elongation_radius_factor * radius);
        } else {
            steps_without_streak_pixel += 1;
        }

        point += seed.direction;
    }
    length
}

/// Global streak threshold from the background regions.
///
/// Per region, mean and sample σ are taken over the non-sentinel filter
/// values. The region with the second-smallest σ decides; with fewer than
/// two usable regions the smallest is used, and with none the image yields
/// no threshold at all.
fn streak_threshold(data: &ArrayViewMut2<f32>, tables: &StreakTables) -> Option<f32> {
    let mut statistics: Vec<(f32, f32)> = Vec::new();

    for region in &tables.config.background_estimation_regions {
        let mut count = 0u32;
        let mut sum = 0.0f64;
        let mut sum_of_squares = 0.0f64;
        for y in region.min_y as usize..=region.max_y as usize {
            for x in region.min_x as usize..=region.max_x as usize {
                let filter_value = radial_filter(data, tables, x, y);
                if filter_value != SENTINEL {
                    count += 1;
                    sum += filter_value as f64;
                    sum_of_squares += (filter_value as f64) * (filter_value as f64);
                }
            }
        }
        if count >= 2 {
            let mean = sum / count as f64;
            let variance =
                ((sum_of_squares - mean * mean * count as f64) / (count as f64 - 1.0)).max(0.0);
            statistics.push((mean as f32, variance.sqrt() as f32));
        }
    }

    if statistics.is_empty() {
        return None;
    }
    statistics.sort_unstable_by(|a, b| a.1.total_cmp(&b.1));
    let (mean, sigma) = statistics[1.min(statistics.len() - 1)];
    Some(mean + tables.config.sigma_factor * sigma)
}

/// Radial median filter at `(x, y)`: gather the precomputed contributor
/// values, select the median, and average the values at or below it.
/// Pixels without a contributor list rate as the sentinel.
fn radial_filter(data: &ArrayViewMut2<f32>, tables: &StreakTables, x: usize, y: usize) -> f32 {
    let width = tables.raw.pix_nx();
    let start = tables.raw.linear_index(x, y) * tables.stride;
    let row = &tables.contributors[start..start + tables.stride];
    if row[0] < 0 {
        return SENTINEL;
    }

    // filter_length is capped at 256 at table-build time
    let mut values = [0.0f32; 256];
    let mut n = 0usize;
    for &contributor in row {
        if contributor < 0 {
            break;
        }
        let contributor = contributor as usize;
        values[n] = data[[contributor / width, contributor % width]];
        n += 1;
    }

    let mid = n / 2;
    let (below, median, _) = values[..n].select_nth_unstable_by(mid, |a, b| a.total_cmp(b));
    let sum: f32 = below.iter().sum::<f32>() + *median;
    sum / (mid + 1) as f32
}
