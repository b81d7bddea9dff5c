// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Elevation grid built from a single rotation.
//!
//! The grid is a square of `ceil(2·extent / cell)` cells per side centred on
//! the sensor, row index along y and column index along x. Each cell keeps
//! min/max z and a Welford running mean and variance of the points that fell
//! into it. Unobserved cells keep a zero count and are never interpolated.

use crate::{config::Config, frame::Frame, lidar::Error};
use ndarray::Array2;
use tracing::instrument;

/// Upper bound on grid cells per side.
pub const MAX_CELLS_PER_SIDE: usize = 4096;

/// Grid cells per side for a square of half-width `extent` and cells of
/// `cell_size`, rounding up.
pub fn cells_per_side(extent: f32, cell_size: f32) -> usize {
    let ratio = 2.0 * extent as f64 / cell_size as f64;
    // Relative slack absorbs f32 noise such as 2·20 / 0.2 = 200.0000119.
    (ratio * (1.0 - 1e-6)).ceil().max(1.0) as usize
}

/// Aggregated elevation statistics of one cell.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct GridCell {
    pub min_z: f32,
    pub max_z: f32,
    pub mean_z: f32,
    /// Number of points, 0 for an unobserved cell
    pub count: u32,
    /// Population variance of z
    pub variance_z: f32,
}

impl GridCell {
    #[inline]
    pub fn is_observed(&self) -> bool {
        self.count > 0
    }
}

/// Elevation grid of one frame.
#[derive(Clone, Debug, PartialEq)]
pub struct ElevationGrid {
    cells: Array2<GridCell>,
    cell_size: f32,
    extent: f32,
    frame_id: u32,
    timestamp_ns: u64,
}

impl ElevationGrid {
    /// Wrap row-major cells into a grid with the given geometry.
    pub fn from_cells(
        cells: Vec<GridCell>,
        cell_size: f32,
        extent: f32,
        frame_id: u32,
        timestamp_ns: u64,
    ) -> Result<Self, Error> {
        let n = cells_per_side(extent, cell_size);
        let cells = Array2::from_shape_vec((n, n), cells)?;
        Ok(Self {
            cells,
            cell_size,
            extent,
            frame_id,
            timestamp_ns,
        })
    }

    pub fn cells(&self) -> &Array2<GridCell> {
        &self.cells
    }

    #[inline]
    pub fn get(&self, row: usize, col: usize) -> Option<&GridCell> {
        self.cells.get((row, col))
    }

    pub fn rows(&self) -> usize {
        self.cells.nrows()
    }

    pub fn cols(&self) -> usize {
        self.cells.ncols()
    }

    pub fn cell_size(&self) -> f32 {
        self.cell_size
    }

    pub fn extent(&self) -> f32 {
        self.extent
    }

    pub fn frame_id(&self) -> u32 {
        self.frame_id
    }

    /// End timestamp of the source frame in nanoseconds.
    pub fn timestamp_ns(&self) -> u64 {
        self.timestamp_ns
    }

    pub fn observed_cells(&self) -> usize {
        self.cells.iter().filter(|c| c.is_observed()).count()
    }

    /// Centre of a cell in metres as `(x, y)`.
    #[inline]
    pub fn cell_center(&self, row: usize, col: usize) -> (f32, f32) {
        (
            -self.extent + (col as f32 + 0.5) * self.cell_size,
            -self.extent + (row as f32 + 0.5) * self.cell_size,
        )
    }

    /// Cell containing `(x, y)`, or `None` outside `[-extent, extent)`.
    #[inline]
    pub fn locate(&self, x: f32, y: f32) -> Option<(usize, usize)> {
        locate(x, y, self.extent, self.cell_size, self.rows())
    }
}

#[inline]
fn locate(x: f32, y: f32, extent: f32, cell_size: f32, n: usize) -> Option<(usize, usize)> {
    // Written to also reject NaN.
    if !(x >= -extent && x < extent && y >= -extent && y < extent) {
        return None;
    }
    // Rounding just below +extent can land on n.
    let col = (((x + extent) / cell_size) as usize).min(n - 1);
    let row = (((y + extent) / cell_size) as usize).min(n - 1);
    Some((row, col))
}

/// Running per-cell statistics.
#[derive(Clone, Copy, Debug, Default)]
struct Accumulator {
    count: u32,
    mean: f64,
    m2: f64,
    min: f32,
    max: f32,
}

impl Accumulator {
    #[inline]
    fn push(&mut self, z: f32) {
        if self.count == 0 {
            self.min = z;
            self.max = z;
        } else {
            self.min = self.min.min(z);
            self.max = self.max.max(z);
        }
        self.count += 1;
        let z = z as f64;
        let delta = z - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (z - self.mean);
    }

    fn finish(&self) -> GridCell {
        if self.count == 0 {
            return GridCell::default();
        }
        GridCell {
            min_z: self.min,
            max_z: self.max,
            mean_z: self.mean as f32,
            count: self.count,
            variance_z: (self.m2 / self.count as f64) as f32,
        }
    }
}

/// Builds an [`ElevationGrid`] per frame, reusing its accumulator buffer.
pub struct GridBuilder {
    cell_size: f32,
    extent: f32,
    n: usize,
    scratch: Vec<Accumulator>,
}

impl GridBuilder {
    /// Builder for a grid of half-width `extent` with square cells of
    /// `cell_size`, both in metres.
    pub fn new(cell_size: f32, extent: f32) -> Result<Self, Error> {
        if !(cell_size.is_finite() && cell_size > 0.0) {
            return Err(Error::Config(format!(
                "cell size must be positive, got {}",
                cell_size
            )));
        }
        if !(extent.is_finite() && extent > 0.0) {
            return Err(Error::Config(format!(
                "grid extent must be positive, got {}",
                extent
            )));
        }
        let n = cells_per_side(extent, cell_size);
        if n > MAX_CELLS_PER_SIDE {
            return Err(Error::Config(format!(
                "grid of {}x{} cells exceeds {} per side",
                n, n, MAX_CELLS_PER_SIDE
            )));
        }

        Ok(Self {
            cell_size,
            extent,
            n,
            scratch: vec![Accumulator::default(); n * n],
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, Error> {
        Self::new(config.cell_size_m, config.grid_extent_m)
    }

    pub fn cells_per_side(&self) -> usize {
        self.n
    }

    /// Aggregate a frame in a single pass over its points.
    #[instrument(skip_all, fields(frame_id = frame.frame_id, points = frame.len()))]
    pub fn build(&mut self, frame: &Frame) -> ElevationGrid {
        let n = self.n;
        self.scratch.fill(Accumulator::default());

        for p in &frame.points {
            if let Some((row, col)) = locate(p.x, p.y, self.extent, self.cell_size, n) {
                self.scratch[row * n + col].push(p.z);
            }
        }

        let scratch = &self.scratch;
        ElevationGrid {
            cells: Array2::from_shape_fn((n, n), |(row, col)| scratch[row * n + col].finish()),
            cell_size: self.cell_size,
            extent: self.extent,
            frame_id: frame.frame_id,
            timestamp_ns: frame.end_ns,
        }
    }
}
