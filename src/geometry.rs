//! Detector-panel geometry derived from a per-pixel position map.
//!
//! Each panel gets its fast-scan and slow-scan basis vectors, its corner
//! position in physical units, its rectangle in raw coordinates, and a
//! *virtual zero*: the raw-image coordinate of the projection of the physical
//! origin (beam center) onto the panel plane. The virtual zero anchors the
//! radial direction used by the streak finder.
//!
//! Geometry is deterministic and idempotent: rebuilding from the same
//! position map yields identical panel bases and virtual-zero vectors.

use crate::error::BraggError;
use crate::raw_format::RawFormat;
use nalgebra::Vector2;
use ndarray::ArrayView2;

/// Placement of a single panel (ASIC) in raw and physical coordinates.
#[derive(Debug, Clone)]
pub struct PanelPosition {
    /// First fast-scan coordinate covered by the panel.
    pub min_fs: usize,
    /// First slow-scan coordinate covered by the panel.
    pub min_ss: usize,
    /// Last fast-scan coordinate covered by the panel (inclusive).
    pub max_fs: usize,
    /// Last slow-scan coordinate covered by the panel (inclusive).
    pub max_ss: usize,
    /// Fast-scan basis vector (physical displacement per fast-scan pixel).
    pub fs: Vector2<f32>,
    /// Slow-scan basis vector (physical displacement per slow-scan pixel).
    pub ss: Vector2<f32>,
    /// Physical position of the panel's top-left corner.
    pub corner: Vector2<f32>,
    /// Projection of the beam center onto this panel, in raw coordinates.
    pub virtual_zero_raw: Vector2<f32>,
}

impl PanelPosition {
    /// Whether a floating-point raw coordinate lies inside the panel
    /// rectangle (borders included).
    pub fn contains(&self, x: f32, y: f32) -> bool {
        x >= self.min_fs as f32
            && x <= self.max_fs as f32
            && y >= self.min_ss as f32
            && y <= self.max_ss as f32
    }

    /// Whether an integer raw coordinate lies strictly inside the panel,
    /// excluding the one-pixel border.
    pub fn contains_interior(&self, x: usize, y: usize) -> bool {
        x > self.min_fs && x < self.max_fs && y > self.min_ss && y < self.max_ss
    }
}

/// Panel placements for a whole detector, plus the position map they were
/// derived from.
///
/// Built once per detector configuration and shared read-only by the
/// per-image kernels and the other precomputation passes.
#[derive(Debug, Clone)]
pub struct Geometry {
    raw: RawFormat,
    panels: Vec<PanelPosition>,
    positions: ndarray::Array2<Vector2<f32>>,
}

impl Geometry {
    /// Derive panel placements from a dense per-pixel position map.
    ///
    /// For each panel the basis vectors are taken from the positions of the
    /// panel's first pixels:
    /// `fs = position[min_ss][min_fs + 1] - position[min_ss][min_fs]`,
    /// `ss = position[min_ss + 1][min_fs] - position[min_ss][min_fs]`, and
    /// `corner = position[min_ss][min_fs] - fs/2 - ss/2`.
    ///
    /// # Errors
    ///
    /// Returns [`BraggError::BadGeometry`] when the position map contains
    /// non-finite entries or a panel's basis collapses to zero.
    pub fn from_position_map(
        raw: &RawFormat,
        positions: &ArrayView2<Vector2<f32>>,
    ) -> Result<Self, BraggError> {
        assert_eq!(
            positions.dim(),
            raw.image_shape(),
            "position map shape must match the raw format"
        );

        for ((y, x), p) in positions.indexed_iter() {
            if !(p.x.is_finite() && p.y.is_finite()) {
                let (asic_x, asic_y) = raw.panel_subscript(x, y);
                return Err(BraggError::BadGeometry {
                    asic_x,
                    asic_y,
                    reason: format!("non-finite position at raw coordinate ({x}, {y})"),
                });
            }
        }

        let mut panels = Vec::with_capacity(raw.nasics_x() * raw.nasics_y());
        for asic_y in 0..raw.nasics_y() {
            for asic_x in 0..raw.nasics_x() {
                let min_fs = asic_x * raw.asic_nx();
                let min_ss = asic_y * raw.asic_ny();
                let max_fs = (asic_x + 1) * raw.asic_nx() - 1;
                let max_ss = (asic_y + 1) * raw.asic_ny() - 1;

                let origin = positions[[min_ss, min_fs]];
                let fs = positions[[min_ss, min_fs + 1]] - origin;
                let ss = positions[[min_ss + 1, min_fs]] - origin;
                if fs.norm() == 0.0 || ss.norm() == 0.0 {
                    return Err(BraggError::BadGeometry {
                        asic_x,
                        asic_y,
                        reason: "panel basis collapsed to zero".to_string(),
                    });
                }
                let corner = origin - 0.5 * fs - 0.5 * ss;

                let mut panel = PanelPosition {
                    min_fs,
                    min_ss,
                    max_fs,
                    max_ss,
                    fs,
                    ss,
                    corner,
                    virtual_zero_raw: Vector2::zeros(),
                };
                panel.virtual_zero_raw = virtual_zero_position(&panel);
                panels.push(panel);
            }
        }

        Ok(Self {
            raw: *raw,
            panels,
            positions: positions.to_owned(),
        })
    }

    /// The raw format this geometry was built for.
    pub fn raw_format(&self) -> &RawFormat {
        &self.raw
    }

    /// Panel at grid subscript `(asic_x, asic_y)`.
    pub fn panel(&self, asic_x: usize, asic_y: usize) -> &PanelPosition {
        &self.panels[asic_y * self.raw.nasics_x() + asic_x]
    }

    /// Panel containing raw coordinate `(x, y)`.
    pub fn panel_of_pixel(&self, x: usize, y: usize) -> &PanelPosition {
        let (asic_x, asic_y) = self.raw.panel_subscript(x, y);
        self.panel(asic_x, asic_y)
    }

    /// All panels in raster order of their grid subscripts.
    pub fn panels(&self) -> &[PanelPosition] {
        &self.panels
    }

    /// Physical position of the pixel at raw coordinate `(x, y)`.
    pub fn position(&self, x: usize, y: usize) -> Vector2<f32> {
        self.positions[[y, x]]
    }
}

/// Raw-image coordinate of the beam-center projection onto a panel.
///
/// The rotation angle between the fast-scan axis and the direction towards
/// the origin fixes where, along the panel plane, the origin projects:
/// `upper_left_raw + ‖corner‖ · (cos θ, sin θ)` with
/// `θ = ∠(fs, -corner)`.
fn virtual_zero_position(panel: &PanelPosition) -> Vector2<f32> {
    let upper_left = Vector2::new(panel.min_fs as f32, panel.min_ss as f32);
    let corner_norm = panel.corner.norm();
    let denominator = panel.fs.norm() * corner_norm;
    if denominator == 0.0 {
        // Beam center sits exactly on the panel corner.
        return upper_left;
    }
    let numerator = panel.fs.dot(&(-panel.corner));
    let angle = (numerator / denominator).clamp(-1.0, 1.0).acos();
    upper_left + Vector2::new(angle.cos(), angle.sin()) * corner_norm
}
