//! Bragg-peak records and the two peak-search kernels.
//!
//! Both finders emit into a capacity-bounded [`PeakList`], a
//! structure-of-arrays so downstream consumers can hand whole fields to
//! indexing code without restriding. [`radial`] searches against
//! radially-binned background thresholds; [`window`] estimates background
//! from the square window border around each candidate.
//!
//! Coordinate contract: the radial finder reports centers of mass in raw
//! image coordinates along with the flat index of the rounded center and the
//! panel number; the local-window finder reports raw-image coordinates only.

pub mod radial;
pub mod window;

use serde::{Deserialize, Serialize};

/// One detected peak, as appended to a [`PeakList`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Peak {
    /// Largest (background-corrected) single-pixel intensity in the peak.
    pub max_intensity: f32,
    /// Integrated background-corrected intensity.
    pub total_intensity: f32,
    /// Standard deviation of the local background estimate.
    pub sigma_background: f32,
    /// Integrated intensity over background standard deviation.
    pub snr: f32,
    /// Number of pixels attributed to the peak.
    pub pixel_count: u32,
    /// Center of mass, fast-scan raw coordinate.
    pub com_raw_x: f32,
    /// Center of mass, slow-scan raw coordinate.
    pub com_raw_y: f32,
    /// Flat image index of the rounded center of mass.
    pub com_index: i64,
    /// Panel the peak was found on, in raster order of the panel grid.
    pub panel_number: u16,
}

/// Capacity-bounded structure-of-arrays of detected peaks.
///
/// `push` drops writes beyond capacity but keeps counting, so a truncated
/// list is observable through [`PeakList::peaks_found`] without being an
/// error.
#[derive(Debug, Clone, Default)]
pub struct PeakList {
    max_intensity: Vec<f32>,
    total_intensity: Vec<f32>,
    sigma_background: Vec<f32>,
    snr: Vec<f32>,
    pixel_count: Vec<u32>,
    com_raw_x: Vec<f32>,
    com_raw_y: Vec<f32>,
    com_index: Vec<i64>,
    panel_number: Vec<u16>,
    max_peak_count: usize,
    peaks_found: usize,
}

impl PeakList {
    /// Create an empty list that stores at most `max_peak_count` peaks.
    pub fn with_capacity(max_peak_count: usize) -> Self {
        Self {
            max_intensity: Vec::with_capacity(max_peak_count),
            total_intensity: Vec::with_capacity(max_peak_count),
            sigma_background: Vec::with_capacity(max_peak_count),
            snr: Vec::with_capacity(max_peak_count),
            pixel_count: Vec::with_capacity(max_peak_count),
            com_raw_x: Vec::with_capacity(max_peak_count),
            com_raw_y: Vec::with_capacity(max_peak_count),
            com_index: Vec::with_capacity(max_peak_count),
            panel_number: Vec::with_capacity(max_peak_count),
            max_peak_count,
            peaks_found: 0,
        }
    }

    /// Append a peak. Returns `false` (and stores nothing) once the list is
    /// at capacity; the peak is still counted in [`PeakList::peaks_found`].
    pub fn push(&mut self, peak: Peak) -> bool {
        self.peaks_found += 1;
        if self.max_intensity.len() >= self.max_peak_count {
            return false;
        }
        self.max_intensity.push(peak.max_intensity);
        self.total_intensity.push(peak.total_intensity);
        self.sigma_background.push(peak.sigma_background);
        self.snr.push(peak.snr);
        self.pixel_count.push(peak.pixel_count);
        self.com_raw_x.push(peak.com_raw_x);
        self.com_raw_y.push(peak.com_raw_y);
        self.com_index.push(peak.com_index);
        self.panel_number.push(peak.panel_number);
        true
    }

    /// Number of stored peaks (never exceeds the capacity).
    pub fn len(&self) -> usize {
        self.max_intensity.len()
    }

    /// Whether the list stores no peaks.
    pub fn is_empty(&self) -> bool {
        self.max_intensity.is_empty()
    }

    /// The capacity the list was created with.
    pub fn max_peak_count(&self) -> usize {
        self.max_peak_count
    }

    /// Total number of peaks enumerated, including any dropped beyond the
    /// capacity.
    pub fn peaks_found(&self) -> usize {
        self.peaks_found
    }

    /// Whether peaks were dropped because the list filled up.
    pub fn overflowed(&self) -> bool {
        self.peaks_found > self.max_peak_count
    }

    /// Remove all stored peaks and reset the found counter, keeping the
    /// allocation for reuse across frames.
    pub fn clear(&mut self) {
        self.max_intensity.clear();
        self.total_intensity.clear();
        self.sigma_background.clear();
        self.snr.clear();
        self.pixel_count.clear();
        self.com_raw_x.clear();
        self.com_raw_y.clear();
        self.com_index.clear();
        self.panel_number.clear();
        self.peaks_found = 0;
    }

    /// Stored peak at `index`.
    pub fn get(&self, index: usize) -> Peak {
        Peak {
            max_intensity: self.max_intensity[index],
            total_intensity: self.total_intensity[index],
            sigma_background: self.sigma_background[index],
            snr: self.snr[index],
            pixel_count: self.pixel_count[index],
            com_raw_x: self.com_raw_x[index],
            com_raw_y: self.com_raw_y[index],
            com_index: self.com_index[index],
            panel_number: self.panel_number[index],
        }
    }

    /// Iterate over the stored peaks.
    pub fn iter(&self) -> impl Iterator<Item = Peak> + '_ {
        (0..self.len()).map(|i| self.get(i))
    }

    /// Largest single-pixel intensities, one entry per stored peak.
    pub fn max_intensities(&self) -> &[f32] {
        &self.max_intensity
    }

    /// Integrated intensities, one entry per stored peak.
    pub fn total_intensities(&self) -> &[f32] {
        &self.total_intensity
    }

    /// Background standard deviations, one entry per stored peak.
    pub fn sigma_backgrounds(&self) -> &[f32] {
        &self.sigma_background
    }

    /// Signal-to-noise ratios, one entry per stored peak.
    pub fn snrs(&self) -> &[f32] {
        &self.snr
    }

    /// Pixel counts, one entry per stored peak.
    pub fn pixel_counts(&self) -> &[u32] {
        &self.pixel_count
    }

    /// Center-of-mass fast-scan coordinates, one entry per stored peak.
    pub fn com_raw_xs(&self) -> &[f32] {
        &self.com_raw_x
    }

    /// Center-of-mass slow-scan coordinates, one entry per stored peak.
    pub fn com_raw_ys(&self) -> &[f32] {
        &self.com_raw_y
    }

    /// Flat indices of the rounded centers of mass.
    pub fn com_indices(&self) -> &[i64] {
        &self.com_index
    }

    /// Panel numbers, one entry per stored peak.
    pub fn panel_numbers(&self) -> &[u16] {
        &self.panel_number
    }
}

/// Options for the radial-statistics peak finder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RadialPeakOptions {
    /// Absolute intensity floor for the detection threshold (ADC counts).
    pub adc_thresh: f32,
    /// Minimum signal-to-noise ratio for an accepted peak.
    pub min_snr: f32,
    /// Minimum number of pixels in a peak.
    pub min_pix_count: u32,
    /// Maximum number of pixels in a peak.
    pub max_pix_count: u32,
    /// Half-width of the local background ring around the peak center, in
    /// pixels; the sampled square spans twice this radius.
    pub local_bg_radius: u32,
    /// Capacity of the returned peak list; the search stops once it is
    /// reached.
    pub max_num_peaks: usize,
}

impl Default for RadialPeakOptions {
    fn default() -> Self {
        Self {
            adc_thresh: 500.0,
            min_snr: 8.0,
            min_pix_count: 2,
            max_pix_count: 200,
            local_bg_radius: 3,
            max_num_peaks: 2048,
        }
    }
}

impl RadialPeakOptions {
    pub(crate) fn validate(&self) -> Result<(), crate::error::BraggError> {
        if self.min_pix_count == 0 || self.max_pix_count < self.min_pix_count {
            return Err(crate::error::BraggError::InvalidOptions(format!(
                "peak pixel-count bounds [{}, {}] are not a valid range",
                self.min_pix_count, self.max_pix_count
            )));
        }
        if self.local_bg_radius == 0 {
            return Err(crate::error::BraggError::InvalidOptions(
                "local_bg_radius must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Options for the local-window peak finder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowPeakOptions {
    /// Half-width of the square analysis window, at least 2.
    pub window_radius: u32,
    /// σ multiples the brightest pixel must exceed the border mean by.
    pub sigma_factor_biggest_pixel: f32,
    /// σ multiples a collected peak pixel must exceed the border mean by.
    pub sigma_factor_peak_pixel: f32,
    /// σ multiples the integrated peak must exceed the border mean by.
    pub sigma_factor_whole_peak: f32,
    /// Floor for the background standard deviation.
    pub min_sigma: f32,
    /// Margin by which a candidate must dominate the window-boundary
    /// samples.
    pub min_peak_oversize_over_neighbours: f32,
    /// Sample two concentric window borders instead of one; enlarges the
    /// required panel margin by one pixel.
    pub double_background_window: bool,
    /// Capacity of the returned peak list.
    pub max_num_peaks: usize,
}

impl Default for WindowPeakOptions {
    fn default() -> Self {
        Self {
            window_radius: 4,
            sigma_factor_biggest_pixel: 7.0,
            sigma_factor_peak_pixel: 6.0,
            sigma_factor_whole_peak: 9.0,
            min_sigma: 11.0,
            min_peak_oversize_over_neighbours: 0.0,
            double_background_window: false,
            max_num_peaks: 2048,
        }
    }
}

impl WindowPeakOptions {
    pub(crate) fn validate(&self) -> Result<(), crate::error::BraggError> {
        if self.window_radius < 2 {
            return Err(crate::error::BraggError::InvalidOptions(format!(
                "window radius must be at least 2, got {}",
                self.window_radius
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_peak(snr: f32) -> Peak {
        Peak {
            max_intensity: 100.0,
            total_intensity: 250.0,
            sigma_background: 1.5,
            snr,
            pixel_count: 5,
            com_raw_x: 10.0,
            com_raw_y: 12.0,
            com_index: 12 * 64 + 10,
            panel_number: 0,
        }
    }

    #[test]
    fn test_push_within_capacity() {
        let mut list = PeakList::with_capacity(4);
        assert!(list.push(sample_peak(10.0)));
        assert!(list.push(sample_peak(20.0)));
        assert_eq!(list.len(), 2);
        assert_eq!(list.peaks_found(), 2);
        assert!(!list.overflowed());
        assert_eq!(list.snrs(), &[10.0, 20.0]);
    }

    #[test]
    fn test_push_beyond_capacity_drops_but_counts() {
        let mut list = PeakList::with_capacity(2);
        assert!(list.push(sample_peak(1.0)));
        assert!(list.push(sample_peak(2.0)));
        assert!(!list.push(sample_peak(3.0)));
        assert_eq!(list.len(), 2);
        assert_eq!(list.peaks_found(), 3);
        assert!(list.overflowed());
        // the stored fields were never written past capacity
        assert_eq!(list.snrs(), &[1.0, 2.0]);
    }

    #[test]
    fn test_clear_resets_for_reuse() {
        let mut list = PeakList::with_capacity(1);
        list.push(sample_peak(1.0));
        list.push(sample_peak(2.0));
        list.clear();
        assert!(list.is_empty());
        assert_eq!(list.peaks_found(), 0);
        assert!(list.push(sample_peak(3.0)));
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn test_get_roundtrip() {
        let mut list = PeakList::with_capacity(2);
        let peak = sample_peak(42.0);
        list.push(peak);
        assert_eq!(list.get(0), peak);
        assert_eq!(list.iter().count(), 1);
    }

    #[test]
    fn test_window_options_validation() {
        let options = WindowPeakOptions {
            window_radius: 1,
            ..WindowPeakOptions::default()
        };
        assert!(options.validate().is_err());
        assert!(WindowPeakOptions::default().validate().is_ok());
    }

    #[test]
    fn test_radial_options_validation() {
        let options = RadialPeakOptions {
            min_pix_count: 10,
            max_pix_count: 5,
            ..RadialPeakOptions::default()
        };
        assert!(options.validate().is_err());
        assert!(RadialPeakOptions::default().validate().is_ok());
    }

    #[test]
    fn test_options_serde_roundtrip() {
        let options = RadialPeakOptions::default();
        let json = serde_json::to_string(&options).unwrap();
        let back: RadialPeakOptions = serde_json::from_str(&json).unwrap();
        assert_eq!(options.max_num_peaks, back.max_num_peaks);

        let options = WindowPeakOptions::default();
        let json = serde_json::to_string(&options).unwrap();
        let back: WindowPeakOptions = serde_json::from_str(&json).unwrap();
        assert_eq!(options.window_radius, back.window_radius);
    }
}
