//! Raw detector layout descriptor.
//!
//! A detector image is a grid of `nasics_x` × `nasics_y` equally-sized panels
//! of `asic_nx` × `asic_ny` pixels each, stored row-major with the fast-scan
//! axis innermost. [`RawFormat`] carries the panel sizes and the derived full
//! image dimensions, and converts between raw `(x, y)` coordinates and linear
//! indices.

use crate::error::BraggError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Immutable descriptor of the raw image layout.
///
/// Invariant: panels tile the image exactly and all sizes fit the 16-bit
/// coordinate range, so every raw coordinate and linear index computed from a
/// `RawFormat` is in range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawFormat {
    asic_nx: usize,
    asic_ny: usize,
    nasics_x: usize,
    nasics_y: usize,
    pix_nx: usize,
    pix_ny: usize,
    pix_nn: usize,
}

impl RawFormat {
    /// Build a format from panel dimensions and the panel grid shape.
    ///
    /// # Errors
    ///
    /// Returns [`BraggError::InvalidOptions`] if any size is zero or the full
    /// image dimensions overflow the 16-bit coordinate range.
    pub fn new(
        asic_nx: usize,
        asic_ny: usize,
        nasics_x: usize,
        nasics_y: usize,
    ) -> Result<Self, BraggError> {
        if asic_nx == 0 || asic_ny == 0 || nasics_x == 0 || nasics_y == 0 {
            return Err(BraggError::InvalidOptions(format!(
                "raw format sizes must be positive, got {asic_nx}x{asic_ny} panels \
                 in a {nasics_x}x{nasics_y} grid"
            )));
        }
        let pix_nx = asic_nx * nasics_x;
        let pix_ny = asic_ny * nasics_y;
        if pix_nx > u16::MAX as usize || pix_ny > u16::MAX as usize {
            return Err(BraggError::InvalidOptions(format!(
                "image dimensions {pix_nx}x{pix_ny} exceed the 16-bit coordinate range"
            )));
        }
        Ok(Self {
            asic_nx,
            asic_ny,
            nasics_x,
            nasics_y,
            pix_nx,
            pix_ny,
            pix_nn: pix_nx * pix_ny,
        })
    }

    /// Panel width (fast-scan) in pixels.
    pub fn asic_nx(&self) -> usize {
        self.asic_nx
    }

    /// Panel height (slow-scan) in pixels.
    pub fn asic_ny(&self) -> usize {
        self.asic_ny
    }

    /// Number of panel columns.
    pub fn nasics_x(&self) -> usize {
        self.nasics_x
    }

    /// Number of panel rows.
    pub fn nasics_y(&self) -> usize {
        self.nasics_y
    }

    /// Full image width in pixels.
    pub fn pix_nx(&self) -> usize {
        self.pix_nx
    }

    /// Full image height in pixels.
    pub fn pix_ny(&self) -> usize {
        self.pix_ny
    }

    /// Total pixel count of the image.
    pub fn pix_nn(&self) -> usize {
        self.pix_nn
    }

    /// Image shape as `(rows, columns)` for `ndarray` allocation.
    pub fn image_shape(&self) -> (usize, usize) {
        (self.pix_ny, self.pix_nx)
    }

    /// Linear index of raw coordinate `(x, y)`.
    pub fn linear_index(&self, x: usize, y: usize) -> usize {
        debug_assert!(x < self.pix_nx && y < self.pix_ny);
        y * self.pix_nx + x
    }

    /// Raw coordinate `(x, y)` of a linear index.
    pub fn coordinates(&self, index: usize) -> (usize, usize) {
        debug_assert!(index < self.pix_nn);
        (index % self.pix_nx, index / self.pix_nx)
    }

    /// Whether raw coordinate `(x, y)` lies inside the image.
    pub fn contains(&self, x: usize, y: usize) -> bool {
        x < self.pix_nx && y < self.pix_ny
    }

    /// Panel grid subscript `(asic_x, asic_y)` of the panel containing raw
    /// coordinate `(x, y)`.
    pub fn panel_subscript(&self, x: usize, y: usize) -> (usize, usize) {
        debug_assert!(self.contains(x, y));
        (x / self.asic_nx, y / self.asic_ny)
    }
}

impl fmt::Display for RawFormat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}x{} pixels ({}x{} panels of {}x{})",
            self.pix_nx, self.pix_ny, self.nasics_x, self.nasics_y, self.asic_nx, self.asic_ny
        )
    }
}
