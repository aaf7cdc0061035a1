//! Streak-finder precomputation.
//!
//! Two tables are derived once per detector/mask configuration: the radial
//! filter contributor list of every pixel on a panel touched by a seed, and
//! for each seed the set of pixels to mask, ordered so that the first `k`
//! entries correspond to the first `k` steps of streak growth. The online
//! kernel then applies a prefix of the pre-sorted indices in O(k).

use crate::error::BraggError;
use crate::geometry::{Geometry, PanelPosition};
use crate::streak::{SeedTable, StreakFinderConfig, StreakTables};
use log::debug;
use nalgebra::Vector2;
use ndarray::ArrayView2;
use std::collections::BTreeSet;

/// Build the streak-finder tables.
///
/// # Errors
///
/// Returns [`BraggError::InvalidOptions`] for inconsistent filter constants,
/// out-of-range seeds or regions, or a seed that coincides with its panel's
/// virtual zero (no radial direction exists there).
pub fn build_streak_tables(
    geometry: &Geometry,
    mask: &ArrayView2<u8>,
    config: &StreakFinderConfig,
) -> Result<StreakTables, BraggError> {
    let raw = *geometry.raw_format();
    assert_eq!(mask.dim(), raw.image_shape(), "mask shape must match format");
    validate(config, &raw)?;

    let mut seeds = Vec::with_capacity(config.pixels_to_check.len());
    for &(x, y) in &config.pixels_to_check {
        let panel = geometry.panel_of_pixel(x as usize, y as usize).clone();
        let offset = Vector2::new(x as f32, y as f32) - panel.virtual_zero_raw;
        if offset.norm() == 0.0 {
            return Err(BraggError::InvalidOptions(format!(
                "seed ({x}, {y}) coincides with the panel's virtual zero"
            )));
        }
        let direction = offset.normalize();
        let (pixels_to_mask, mask_count_for_length) =
            streak_mask_pixels(&panel, mask, &raw, direction, x, y, config);
        seeds.push(SeedTable {
            x,
            y,
            panel,
            direction,
            pixels_to_mask,
            mask_count_for_length,
        });
    }

    let contributors = filter_contributors(geometry, mask, config, &seeds);

    debug!(
        "streak tables: {} seeds, {} pixels with a usable filter",
        seeds.len(),
        contributors
            .chunks(config.filter_length as usize + 1)
            .filter(|row| row[0] >= 0)
            .count()
    );

    Ok(StreakTables {
        raw,
        stride: config.filter_length as usize + 1,
        contributors,
        seeds,
        config: config.clone(),
    })
}

fn validate(config: &StreakFinderConfig, raw: &crate::raw_format::RawFormat) -> Result<(), BraggError> {
    if config.min_filter_length == 0 || config.filter_length < config.min_filter_length {
        return Err(BraggError::InvalidOptions(format!(
            "filter lengths must satisfy 1 <= min_filter_length <= filter_length, \
             got min {} and {}",
            config.min_filter_length, config.filter_length
        )));
    }
    if config.filter_length > 256 {
        return Err(BraggError::InvalidOptions(format!(
            "filter_length must not exceed 256, got {}",
            config.filter_length
        )));
    }
    if !(config.filter_step > 0.0 && config.filter_step.is_finite()) {
        return Err(BraggError::InvalidOptions(format!(
            "filter_step must be positive and finite, got {}",
            config.filter_step
        )));
    }
    for &(x, y) in &config.pixels_to_check {
        if !raw.contains(x as usize, y as usize) {
            return Err(BraggError::InvalidOptions(format!(
                "seed ({x}, {y}) outside the {raw} image"
            )));
        }
    }
    for rect in &config.background_estimation_regions {
        if rect.min_x > rect.max_x
            || rect.min_y > rect.max_y
            || !raw.contains(rect.max_x as usize, rect.max_y as usize)
        {
            return Err(BraggError::InvalidOptions(format!(
                "background region {rect:?} is degenerate or outside the {raw} image"
            )));
        }
    }
    Ok(())
}

/// Contributor lists for every pixel of every panel touched by a seed.
///
/// Each list holds the linear indices of up to `filter_length` mask-good
/// pixels sampled outward along the pixel's radial direction, `-1`
/// terminated; pixels with fewer than `min_filter_length` usable samples
/// stay empty (leading `-1`).
fn filter_contributors(
    geometry: &Geometry,
    mask: &ArrayView2<u8>,
    config: &StreakFinderConfig,
    seeds: &[SeedTable],
) -> Vec<i32> {
    let raw = geometry.raw_format();
    let stride = config.filter_length as usize + 1;
    let mut contributors = vec![-1i32; raw.pix_nn() * stride];

    let mut panels: Vec<(usize, usize)> = seeds
        .iter()
        .map(|seed| raw.panel_subscript(seed.x as usize, seed.y as usize))
        .collect();
    panels.sort_unstable();
    panels.dedup();

    let mut current = Vec::with_capacity(config.filter_length as usize);
    for &(asic_x, asic_y) in &panels {
        let panel = geometry.panel(asic_x, asic_y);
        for y in panel.min_ss..=panel.max_ss {
            for x in panel.min_fs..=panel.max_fs {
                let offset = Vector2::new(x as f32, y as f32) - panel.virtual_zero_raw;
                if offset.norm() == 0.0 {
                    continue;
                }
                let step = config.filter_step * offset.normalize();

                current.clear();
                for i in 0..config.filter_length {
                    let sample = Vector2::new(x as f32, y as f32) + i as f32 * step;
                    let sx = sample.x.round() as i64;
                    let sy = sample.y.round() as i64;
                    // strictly inside: the panel border never contributes
                    if sx > panel.min_fs as i64
                        && sx < panel.max_fs as i64
                        && sy > panel.min_ss as i64
                        && sy < panel.max_ss as i64
                        && mask[[sy as usize, sx as usize]] == 0
                    {
                        current.push(raw.linear_index(sx as usize, sy as usize) as i32);
                    }
                }

                if current.len() >= config.min_filter_length as usize {
                    let start = raw.linear_index(x, y) * stride;
                    contributors[start..start + current.len()].copy_from_slice(&current);
                }
            }
        }
    }
    contributors
}

/// The mask pixel set of one seed, together with the cumulative count per
/// streak length.
///
/// The backtrack part (from the seed towards the virtual zero) is masked for
/// any streak, so its sorted union forms the prefix recorded for length 0.
/// Each forward step then appends the not-yet-seen pixels around the next
/// streak point, recording the grown prefix size.
fn streak_mask_pixels(
    panel: &PanelPosition,
    mask: &ArrayView2<u8>,
    raw: &crate::raw_format::RawFormat,
    direction: Vector2<f32>,
    seed_x: u16,
    seed_y: u16,
    config: &StreakFinderConfig,
) -> (Vec<u32>, Vec<u32>) {
    let radius = config.streak_pixel_mask_radius as i64;

    // walk backwards while still on the positive side of the virtual zero
    let mut seen: BTreeSet<u32> = BTreeSet::new();
    let mut position = Vector2::new(seed_x as f32, seed_y as f32);
    while panel.contains(position.x, position.y)
        && direction.dot(&(position - panel.virtual_zero_raw)) > 0.0
    {
        for index in valid_pixels_in_square(panel, mask, raw, &position, radius) {
            seen.insert(index);
        }
        position -= direction;
    }

    let mut pixels_to_mask: Vec<u32> = seen.iter().copied().collect();
    let mut mask_count_for_length = vec![pixels_to_mask.len() as u32];

    // walk forwards for as long as a streak could run inside the panel
    let mut position = Vector2::new(seed_x as f32, seed_y as f32) + direction;
    while panel.contains(position.x, position.y) {
        let mut fresh: Vec<u32> = valid_pixels_in_square(panel, mask, raw, &position, radius)
            .into_iter()
            .filter(|index| !seen.contains(index))
            .collect();
        fresh.sort_unstable();
        for &index in &fresh {
            seen.insert(index);
        }
        pixels_to_mask.extend_from_slice(&fresh);
        mask_count_for_length.push(pixels_to_mask.len() as u32);
        position += direction;
    }

    (pixels_to_mask, mask_count_for_length)
}

/// Linear indices of the mask-good pixels in the square of the given radius
/// around a streak point, clipped to the panel.
fn valid_pixels_in_square(
    panel: &PanelPosition,
    mask: &ArrayView2<u8>,
    raw: &crate::raw_format::RawFormat,
    center: &Vector2<f32>,
    radius: i64,
) -> Vec<u32> {
    let cx = center.x.round() as i64;
    let cy = center.y.round() as i64;
    let mut pixels = Vec::with_capacity(((2 * radius + 1) * (2 * radius + 1)) as usize);
    for x in cx - radius..=cx + radius {
        for y in cy - radius..=cy + radius {
            if x >= panel.min_fs as i64
                && x <= panel.max_fs as i64
                && y >= panel.min_ss as i64
                && y <= panel.max_ss as i64
                && mask[[y as usize, x as usize]] == 0
            {
                pixels.push(raw.linear_index(x as usize, y as usize) as u32);
            }
        }
    }
    pixels
}
