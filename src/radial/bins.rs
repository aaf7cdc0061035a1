//! Adaptive radial-bin precomputation.
//!
//! Valid pixels of the panels selected for background estimation are sorted
//! by radius and swept into bins that satisfy both a minimum contributor
//! count and a minimum radial width. Two zero-contributor sentinel bins are
//! prepended/appended so that per-pixel background values can be linearly
//! extrapolated at both ends of the radius range.
//!
//! The expensive part of the per-image pass is avoided here: a packed,
//! index-sorted `(linear_index, bin_index)` list assigns each contributing
//! pixel to its bin in O(1), and every pixel of the panels selected for
//! correction gets its bracketing bin pair and interpolation weight
//! precomputed.

use crate::error::BraggError;
use crate::geometry::Geometry;
use log::debug;
use ndarray::ArrayView2;
use serde::{Deserialize, Serialize};

/// Marker for pixels without a bin assignment (masked, on a panel border, or
/// not on a detector-to-correct).
pub(crate) const UNASSIGNED_BIN: u16 = u16::MAX;

/// Accuracy constants for the radial-bin precomputation and the rank filter
/// built on top of it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RadialBinConfig {
    /// Minimum number of contributing pixels per bin.
    pub min_values_per_bin: u32,
    /// Minimum bin width in radius units.
    pub min_bin_width: f32,
    /// Upper bound on contributors kept per bin for the representative
    /// radius, selected evenly over polar angle. 0 keeps all contributors.
    pub max_considered_values_per_bin: u32,
    /// Rank of the per-bin background value, in `[0, 1]` (0.5 = median).
    pub rank: f32,
    /// Panel subscripts `(asic_x, asic_y)` whose pixels populate the bins.
    pub detectors_to_consider: Vec<(u8, u8)>,
    /// Panel subscripts that will be background-corrected. Must be a subset
    /// of `detectors_to_consider`.
    pub detectors_to_correct: Vec<(u8, u8)>,
}

impl RadialBinConfig {
    /// Configuration that considers and corrects every panel of a detector.
    pub fn for_all_panels(geometry: &Geometry) -> Self {
        let raw = geometry.raw_format();
        let mut panels = Vec::with_capacity(raw.nasics_x() * raw.nasics_y());
        for asic_y in 0..raw.nasics_y() {
            for asic_x in 0..raw.nasics_x() {
                panels.push((asic_x as u8, asic_y as u8));
            }
        }
        Self {
            detectors_to_consider: panels.clone(),
            detectors_to_correct: panels,
            ..Self::default()
        }
    }

    fn validate(&self, geometry: &Geometry) -> Result<(), BraggError> {
        if !(0.0..=1.0).contains(&self.rank) {
            return Err(BraggError::InvalidOptions(format!(
                "rank must lie in [0, 1], got {}",
                self.rank
            )));
        }
        if self.min_values_per_bin == 0 {
            return Err(BraggError::InvalidOptions(
                "min_values_per_bin must be at least 1".to_string(),
            ));
        }
        if !(self.min_bin_width >= 0.0 && self.min_bin_width.is_finite()) {
            return Err(BraggError::InvalidOptions(format!(
                "min_bin_width must be finite and non-negative, got {}",
                self.min_bin_width
            )));
        }
        if self.detectors_to_consider.is_empty() {
            return Err(BraggError::InvalidOptions(
                "detectors_to_consider must not be empty".to_string(),
            ));
        }
        let raw = geometry.raw_format();
        for &(asic_x, asic_y) in self
            .detectors_to_consider
            .iter()
            .chain(&self.detectors_to_correct)
        {
            if asic_x as usize >= raw.nasics_x() || asic_y as usize >= raw.nasics_y() {
                return Err(BraggError::InvalidOptions(format!(
                    "panel subscript ({asic_x}, {asic_y}) outside the {}x{} panel grid",
                    raw.nasics_x(),
                    raw.nasics_y()
                )));
            }
        }
        for subscript in &self.detectors_to_correct {
            if !self.detectors_to_consider.contains(subscript) {
                return Err(BraggError::InvalidOptions(format!(
                    "detectors_to_correct entry {subscript:?} is not in detectors_to_consider"
                )));
            }
        }
        Ok(())
    }
}

impl Default for RadialBinConfig {
    fn default() -> Self {
        Self {
            min_values_per_bin: 100,
            min_bin_width: 2.0,
            max_considered_values_per_bin: 0,
            rank: 0.5,
            detectors_to_consider: Vec::new(),
            detectors_to_correct: Vec::new(),
        }
    }
}

/// Precomputed radial bins for one detector/mask configuration.
///
/// Invariants: every non-sentinel bin has at least
/// `min_values_per_bin` contributors and spans at least `min_bin_width` in
/// radius; `bin_radii` is monotone non-decreasing; for every assigned pixel
/// the interpolation weight lies in `[0, 1]`.
#[derive(Debug, Clone)]
pub struct RadialBins {
    /// Representative radius per bin, sentinels included.
    pub(crate) bin_radii: Vec<f32>,
    /// Full contributor count per bin (sentinels hold 0).
    pub(crate) data_count_per_bin: Vec<u32>,
    /// Linear indices of contributing pixels, sorted ascending.
    pub(crate) sparse_data_indices: Vec<u32>,
    /// Bin index parallel to `sparse_data_indices`.
    pub(crate) sparse_bin_indices: Vec<u16>,
    /// Lower bracketing bin per pixel, `UNASSIGNED_BIN` where undefined.
    pub(crate) intra_bin_index: Vec<u16>,
    /// Linear interpolation weight per pixel towards the next bin.
    pub(crate) intra_bin_interp: Vec<f32>,
    config: RadialBinConfig,
}

impl RadialBins {
    /// Number of bins including the two extrapolation sentinels.
    pub fn bin_count(&self) -> usize {
        self.bin_radii.len()
    }

    /// Representative radius per bin (bin contributor mean; the sentinels
    /// carry the global minimum and maximum contributor radius).
    pub fn bin_radii(&self) -> &[f32] {
        &self.bin_radii
    }

    /// Full contributor count per bin.
    pub fn data_count_per_bin(&self) -> &[u32] {
        &self.data_count_per_bin
    }

    /// The configuration the bins were built with.
    pub fn config(&self) -> &RadialBinConfig {
        &self.config
    }

    /// Bracketing bin pair and interpolation weight for a pixel, if the
    /// pixel has an assignment.
    pub fn intra_bin(&self, linear_index: usize) -> Option<(usize, f32)> {
        match self.intra_bin_index[linear_index] {
            UNASSIGNED_BIN => None,
            bin => Some((bin as usize, self.intra_bin_interp[linear_index])),
        }
    }
}

/// Partition the valid pixels of the considered panels into adaptive radius
/// bins and precompute the per-pixel assignments consumed by the rank filter
/// and the radial threshold statistics.
///
/// # Errors
///
/// [`BraggError::InvalidOptions`] for an invalid configuration,
/// [`BraggError::InsufficientBins`] when not even one bin can satisfy the
/// minimum-count and minimum-width constraints.
pub fn build_radial_bins(
    geometry: &Geometry,
    mask: &ArrayView2<u8>,
    radius_map: &ArrayView2<f32>,
    config: &RadialBinConfig,
) -> Result<RadialBins, BraggError> {
    let raw = *geometry.raw_format();
    assert_eq!(mask.dim(), raw.image_shape(), "mask shape must match format");
    assert_eq!(
        radius_map.dim(),
        raw.image_shape(),
        "radius map shape must match format"
    );
    config.validate(geometry)?;

    // (radius, linear index) of every unmasked interior pixel of the
    // considered panels, sorted by radius.
    let mut contributors: Vec<(f32, u32)> = Vec::new();
    for &(asic_x, asic_y) in &config.detectors_to_consider {
        let panel = geometry.panel(asic_x as usize, asic_y as usize);
        for y in panel.min_ss + 1..panel.max_ss {
            for x in panel.min_fs + 1..panel.max_fs {
                let radius = radius_map[[y, x]];
                if mask[[y, x]] == 0 && radius.is_finite() {
                    contributors.push((radius, raw.linear_index(x, y) as u32));
                }
            }
        }
    }
    contributors.sort_unstable_by(|a, b| a.0.total_cmp(&b.0));

    let bin_starts = sweep_bins(&contributors, config)?;
    let num_bins = bin_starts.len();
    debug!(
        "radial bins: {} bins over {} contributors, radius range [{}, {}]",
        num_bins,
        contributors.len(),
        contributors.first().map_or(0.0, |c| c.0),
        contributors.last().map_or(0.0, |c| c.0),
    );

    // Representative radii over the (possibly angle-thinned) contributor
    // subset; the sentinel radii bracket the full membership so that every
    // assigned pixel interpolates rather than extrapolates.
    let mut bin_radii = vec![0.0f32; num_bins + 2];
    bin_radii[0] = contributors[0].0;
    bin_radii[num_bins + 1] = contributors[contributors.len() - 1].0;
    for (bin, range) in bin_ranges(&bin_starts, contributors.len()).enumerate() {
        let members = &contributors[range];
        let thinned = thin_by_angle(members, geometry, &raw, config.max_considered_values_per_bin);
        let sum: f64 = thinned.iter().map(|&i| members[i].0 as f64).sum();
        bin_radii[bin + 1] = (sum / thinned.len() as f64) as f32;
    }

    let mut data_count_per_bin = vec![0u32; num_bins + 2];
    for (bin, range) in bin_ranges(&bin_starts, contributors.len()).enumerate() {
        data_count_per_bin[bin + 1] = range.len() as u32;
    }

    // Packed per-pixel membership, sorted by linear index for the gather
    // pass. Bin indices are shifted by one for the leading sentinel.
    let mut sparse: Vec<(u32, u16)> = Vec::with_capacity(contributors.len());
    for (bin, range) in bin_ranges(&bin_starts, contributors.len()).enumerate() {
        for &(_, index) in &contributors[range] {
            sparse.push((index, (bin + 1) as u16));
        }
    }
    sparse.sort_unstable_by_key(|&(index, _)| index);
    let (sparse_data_indices, sparse_bin_indices): (Vec<u32>, Vec<u16>) =
        sparse.into_iter().unzip();

    // Per-pixel membership map, then bracketing pair + interpolation weight
    // for the interior pixels of the panels to correct.
    let mut member_bin = vec![0u16; raw.pix_nn()];
    for (&index, &bin) in sparse_data_indices.iter().zip(&sparse_bin_indices) {
        member_bin[index as usize] = bin;
    }

    let mut intra_bin_index = vec![UNASSIGNED_BIN; raw.pix_nn()];
    let mut intra_bin_interp = vec![0.0f32; raw.pix_nn()];
    for &(asic_x, asic_y) in &config.detectors_to_correct {
        let panel = geometry.panel(asic_x as usize, asic_y as usize);
        for y in panel.min_ss + 1..panel.max_ss {
            for x in panel.min_fs + 1..panel.max_fs {
                let index = raw.linear_index(x, y);
                let bin = member_bin[index];
                if mask[[y, x]] != 0 || bin == 0 {
                    continue;
                }
                let radius = radius_map[[y, x]];
                let lower = if radius < bin_radii[bin as usize] {
                    bin - 1
                } else {
                    bin
                };
                let span = bin_radii[lower as usize + 1] - bin_radii[lower as usize];
                intra_bin_index[index] = lower;
                intra_bin_interp[index] = if span > 0.0 {
                    (radius - bin_radii[lower as usize]) / span
                } else {
                    0.0
                };
            }
        }
    }

    Ok(RadialBins {
        bin_radii,
        data_count_per_bin,
        sparse_data_indices,
        sparse_bin_indices,
        intra_bin_index,
        intra_bin_interp,
        config: config.clone(),
    })
}

/// Sweep the radius-sorted contributors into bins. Returns the start offset
/// of each bin; a trailing bin that cannot satisfy the minima is merged into
/// its predecessor.
fn sweep_bins(
    contributors: &[(f32, u32)],
    config: &RadialBinConfig,
) -> Result<Vec<usize>, BraggError> {
    let insufficient = || BraggError::InsufficientBins {
        min_values_per_bin: config.min_values_per_bin,
        min_bin_width: config.min_bin_width,
    };
    if contributors.is_empty() {
        return Err(insufficient());
    }

    let min_count = config.min_values_per_bin as usize;
    let mut starts = vec![0usize];
    for i in 1..contributors.len() {
        let start = *starts.last().expect("at least one bin start");
        if i - start >= min_count && contributors[i - 1].0 - contributors[start].0 >= config.min_bin_width
        {
            starts.push(i);
        }
    }

    // The sweep can leave a deficient trailing bin; fold it into the
    // previous one so the bin invariants hold for every non-sentinel bin.
    let last = *starts.last().expect("at least one bin start");
    let count = contributors.len() - last;
    let width = contributors[contributors.len() - 1].0 - contributors[last].0;
    if count < min_count || width < config.min_bin_width {
        if starts.len() == 1 {
            return Err(insufficient());
        }
        starts.pop();
    }
    Ok(starts)
}

fn bin_ranges(
    starts: &[usize],
    total: usize,
) -> impl Iterator<Item = std::ops::Range<usize>> + '_ {
    starts.iter().enumerate().map(move |(i, &start)| {
        let end = starts.get(i + 1).copied().unwrap_or(total);
        start..end
    })
}

/// Evenly subsample a bin's members over polar angle. Decouples the
/// representative radius from localized high-intensity arcs. Returns indices
/// into `members`.
fn thin_by_angle(
    members: &[(f32, u32)],
    geometry: &Geometry,
    raw: &crate::raw_format::RawFormat,
    max_considered: u32,
) -> Vec<usize> {
    let n = members.len();
    if max_considered == 0 || n <= max_considered as usize {
        return (0..n).collect();
    }

    let angles: Vec<f32> = members
        .iter()
        .map(|&(_, index)| {
            let (x, y) = raw.coordinates(index as usize);
            let position = geometry.position(x, y);
            position.y.atan2(position.x)
        })
        .collect();
    let mut by_angle: Vec<usize> = (0..n).collect();
    by_angle.sort_unstable_by(|&a, &b| angles[a].total_cmp(&angles[b]));

    let k = max_considered as usize;
    (0..k)
        .map(|j| by_angle[(j as f64 * n as f64 / k as f64).floor() as usize])
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raw_format::RawFormat;
    use nalgebra::Vector2;
    use ndarray::Array2;

    fn test_geometry(n: usize, cx: f32, cy: f32) -> Geometry {
        let fmt = RawFormat::new(n, n, 1, 1).unwrap();
        let positions = Array2::from_shape_fn(fmt.image_shape(), |(y, x)| {
            Vector2::new(x as f32 - cx, y as f32 - cy)
        });
        Geometry::from_position_map(&fmt, &positions.view()).unwrap()
    }

    fn radius_map(geometry: &Geometry) -> Array2<f32> {
        let shape = geometry.raw_format().image_shape();
        Array2::from_shape_fn(shape, |(y, x)| geometry.position(x, y).norm())
    }

    fn test_config() -> RadialBinConfig {
        RadialBinConfig {
            min_values_per_bin: 50,
            min_bin_width: 1.0,
            max_considered_values_per_bin: 0,
            rank: 0.5,
            detectors_to_consider: vec![(0, 0)],
            detectors_to_correct: vec![(0, 0)],
        }
    }

    #[test]
    fn test_bin_invariants() {
        let geometry = test_geometry(64, 31.5, 31.5);
        let mask = Array2::<u8>::zeros(geometry.raw_format().image_shape());
        let radii = radius_map(&geometry);
        let config = test_config();

        let bins = build_radial_bins(&geometry, &mask.view(), &radii.view(), &config).unwrap();

        assert!(bins.bin_count() >= 3);
        // non-sentinel bins satisfy the minima
        for bin in 1..bins.bin_count() - 1 {
            assert!(bins.data_count_per_bin()[bin] >= config.min_values_per_bin);
        }
        assert_eq!(bins.data_count_per_bin()[0], 0);
        assert_eq!(*bins.data_count_per_bin().last().unwrap(), 0);
        // monotone representative radii
        for pair in bins.bin_radii().windows(2) {
            assert!(pair[0] <= pair[1], "bin radii not monotone: {pair:?}");
        }
    }

    #[test]
    fn test_intra_bin_assignment_brackets_radius() {
        let geometry = test_geometry(64, 31.5, 31.5);
        let raw = *geometry.raw_format();
        let mask = Array2::<u8>::zeros(raw.image_shape());
        let radii = radius_map(&geometry);

        let bins =
            build_radial_bins(&geometry, &mask.view(), &radii.view(), &test_config()).unwrap();

        let mut assigned = 0usize;
        for y in 1..raw.pix_ny() - 1 {
            for x in 1..raw.pix_nx() - 1 {
                let index = raw.linear_index(x, y);
                let (bin, t) = bins.intra_bin(index).expect("interior pixel assigned");
                let radius = radii[[y, x]];
                assert!((0.0..=1.0).contains(&t), "weight {t} out of range");
                assert!(bins.bin_radii()[bin] <= radius);
                assert!(radius <= bins.bin_radii()[bin + 1]);
                assigned += 1;
            }
        }
        assert_eq!(assigned, (raw.pix_nx() - 2) * (raw.pix_ny() - 2));
        // the border never gets an assignment
        assert!(bins.intra_bin(raw.linear_index(0, 5)).is_none());
    }

    #[test]
    fn test_masked_pixels_excluded() {
        let geometry = test_geometry(64, 31.5, 31.5);
        let raw = *geometry.raw_format();
        let mut mask = Array2::<u8>::zeros(raw.image_shape());
        mask[[20, 20]] = 1;
        let radii = radius_map(&geometry);

        let bins =
            build_radial_bins(&geometry, &mask.view(), &radii.view(), &test_config()).unwrap();

        let index = raw.linear_index(20, 20) as u32;
        assert!(!bins.sparse_data_indices.contains(&index));
        assert!(bins.intra_bin(index as usize).is_none());
    }

    #[test]
    fn test_sparse_membership_sorted() {
        let geometry = test_geometry(64, 31.5, 31.5);
        let mask = Array2::<u8>::zeros(geometry.raw_format().image_shape());
        let radii = radius_map(&geometry);

        let bins =
            build_radial_bins(&geometry, &mask.view(), &radii.view(), &test_config()).unwrap();

        assert!(bins
            .sparse_data_indices
            .windows(2)
            .all(|w| w[0] < w[1]));
        assert_eq!(bins.sparse_data_indices.len(), bins.sparse_bin_indices.len());
        assert_eq!(bins.sparse_data_indices.len() as u32, 62 * 62);
        for &bin in &bins.sparse_bin_indices {
            assert!(bin >= 1 && (bin as usize) < bins.bin_count() - 1);
        }
    }

    #[test]
    fn test_angular_thinning_keeps_invariants() {
        let geometry = test_geometry(64, 31.5, 31.5);
        let mask = Array2::<u8>::zeros(geometry.raw_format().image_shape());
        let radii = radius_map(&geometry);
        let config = RadialBinConfig {
            max_considered_values_per_bin: 16,
            ..test_config()
        };

        let bins = build_radial_bins(&geometry, &mask.view(), &radii.view(), &config).unwrap();

        for pair in bins.bin_radii().windows(2) {
            assert!(pair[0] <= pair[1]);
        }
        // full counts survive thinning
        for bin in 1..bins.bin_count() - 1 {
            assert!(bins.data_count_per_bin()[bin] >= config.min_values_per_bin);
        }
        assert_eq!(bins.sparse_data_indices.len() as u32, 62 * 62);
    }

    #[test]
    fn test_insufficient_bins() {
        let geometry = test_geometry(16, 7.5, 7.5);
        let mask = Array2::<u8>::zeros(geometry.raw_format().image_shape());
        let radii = radius_map(&geometry);
        let config = RadialBinConfig {
            min_values_per_bin: 100_000,
            ..test_config()
        };

        let err = build_radial_bins(&geometry, &mask.view(), &radii.view(), &config).unwrap_err();
        assert!(matches!(err, BraggError::InsufficientBins { .. }));
    }

    #[test]
    fn test_invalid_rank_rejected() {
        let geometry = test_geometry(16, 7.5, 7.5);
        let mask = Array2::<u8>::zeros(geometry.raw_format().image_shape());
        let radii = radius_map(&geometry);
        let config = RadialBinConfig {
            rank: 1.5,
            ..test_config()
        };

        let err = build_radial_bins(&geometry, &mask.view(), &radii.view(), &config).unwrap_err();
        assert!(matches!(err, BraggError::InvalidOptions(_)));
    }

    #[test]
    fn test_correct_must_be_subset_of_consider() {
        let fmt = RawFormat::new(16, 16, 2, 1).unwrap();
        let positions = Array2::from_shape_fn(fmt.image_shape(), |(y, x)| {
            Vector2::new(x as f32 - 15.5, y as f32 - 7.5)
        });
        let geometry = Geometry::from_position_map(&fmt, &positions.view()).unwrap();
        let mask = Array2::<u8>::zeros(fmt.image_shape());
        let radii = Array2::from_shape_fn(fmt.image_shape(), |(y, x)| {
            geometry.position(x, y).norm()
        });
        let config = RadialBinConfig {
            min_values_per_bin: 10,
            detectors_to_consider: vec![(0, 0)],
            detectors_to_correct: vec![(1, 0)],
            ..test_config()
        };

        let err = build_radial_bins(&geometry, &mask.view(), &radii.view(), &config).unwrap_err();
        assert!(matches!(err, BraggError::InvalidOptions(_)));
    }
}
