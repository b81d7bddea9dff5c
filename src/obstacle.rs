// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Boulder and crater detection on an elevation grid.
//!
//! 1. **Local ground**: for every observed cell, the median `min_z` of the
//!    observed cells in a square window around it. The median keeps a
//!    boulder from lifting its own ground estimate.
//!
//! 2. **Deviation**: `mean_z − ground`. A cell is deviant when the deviation
//!    exceeds `max(deviation_threshold, noise_sigmas · σ_z)` in magnitude.
//!
//! 3. **Clustering**: 4- or 8-connected flood fill over deviant cells of the
//!    same sign. Components smaller than `min_supporting_cells` are dropped.

use crate::{
    config::Config,
    grid::ElevationGrid,
    lidar::Error,
};
use std::fmt;
use tracing::{instrument, trace};

/// Mean `|deviation| / threshold` at which the magnitude term of the
/// confidence saturates.
const CONFIDENCE_SATURATION_RATIO: f32 = 2.0;

const UNVISITED: u32 = 0;
const VISITED: u32 = u32::MAX;

const NEIGHBORS_4: [(isize, isize); 4] = [(-1, 0), (0, -1), (0, 1), (1, 0)];
const NEIGHBORS_8: [(isize, isize); 8] = [
    (-1, -1),
    (-1, 0),
    (-1, 1),
    (0, -1),
    (0, 1),
    (1, -1),
    (1, 0),
    (1, 1),
];

/// Flood fill neighbourhood.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Connectivity {
    Four,
    Eight,
}

impl Connectivity {
    fn offsets(&self) -> &'static [(isize, isize)] {
        match self {
            Connectivity::Four => &NEIGHBORS_4,
            Connectivity::Eight => &NEIGHBORS_8,
        }
    }
}

impl TryFrom<u8> for Connectivity {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            4 => Ok(Connectivity::Four),
            8 => Ok(Connectivity::Eight),
            _ => Err(Error::Config(format!(
                "connectivity must be 4 or 8, got {}",
                value
            ))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ObstacleKind {
    Boulder,
    Crater,
}

impl fmt::Display for ObstacleKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ObstacleKind::Boulder => write!(f, "boulder"),
            ObstacleKind::Crater => write!(f, "crater"),
        }
    }
}

/// Geometry shared by every obstacle kind.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ObstacleBody {
    /// Mean of member cell centres `(x, y)` in metres
    pub centroid: (f32, f32),
    /// Half the diagonal of the bounding box
    pub bounding_radius: f32,
    /// Mean member deviation from local ground, never zero
    pub height_deviation: f32,
    pub supporting_cells: usize,
    /// Detection confidence in `[0, 1]`
    pub confidence: f32,
    /// Bounding box corner with the lowest x and y
    pub min: (f32, f32),
    /// Bounding box corner with the highest x and y
    pub max: (f32, f32),
}

/// A detected terrain obstacle.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Obstacle {
    /// Raised above local ground
    Boulder(ObstacleBody),
    /// Depressed below local ground
    Crater(ObstacleBody),
}

impl Obstacle {
    /// Classify by the sign of the body's height deviation.
    ///
    /// Returns `None` for a zero deviation.
    pub fn from_body(body: ObstacleBody) -> Option<Self> {
        if body.height_deviation > 0.0 {
            Some(Obstacle::Boulder(body))
        } else if body.height_deviation < 0.0 {
            Some(Obstacle::Crater(body))
        } else {
            None
        }
    }

    pub fn kind(&self) -> ObstacleKind {
        match self {
            Obstacle::Boulder(_) => ObstacleKind::Boulder,
            Obstacle::Crater(_) => ObstacleKind::Crater,
        }
    }

    pub fn body(&self) -> &ObstacleBody {
        match self {
            Obstacle::Boulder(body) | Obstacle::Crater(body) => body,
        }
    }

    pub fn centroid(&self) -> (f32, f32) {
        self.body().centroid
    }

    pub fn bounding_radius(&self) -> f32 {
        self.body().bounding_radius
    }

    pub fn height_deviation(&self) -> f32 {
        self.body().height_deviation
    }

    pub fn supporting_cells(&self) -> usize {
        self.body().supporting_cells
    }

    pub fn confidence(&self) -> f32 {
        self.body().confidence
    }

    /// Horizontal distance of the centroid from the sensor.
    pub fn range(&self) -> f32 {
        let (x, y) = self.centroid();
        x.hypot(y)
    }

    /// Bounding box area in square metres.
    pub fn area(&self) -> f32 {
        let body = self.body();
        (body.max.0 - body.min.0) * (body.max.1 - body.min.1)
    }

    /// True when `(x, y)` lies inside the bounding box.
    pub fn contains(&self, x: f32, y: f32) -> bool {
        let body = self.body();
        x >= body.min.0 && x <= body.max.0 && y >= body.min.1 && y <= body.max.1
    }
}

impl fmt::Display for Obstacle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let body = self.body();
        write!(
            f,
            "{} at ({:.2}, {:.2}) deviation {:+.3}m radius {:.2}m cells {} confidence {:.2}",
            self.kind(),
            body.centroid.0,
            body.centroid.1,
            body.height_deviation,
            body.bounding_radius,
            body.supporting_cells,
            body.confidence
        )
    }
}

/// Detects obstacles on an elevation grid.
pub trait TerrainAnalyzer {
    fn find(&self, grid: &ElevationGrid) -> Vec<Obstacle>;
}

/// Median-ground deviation analyzer.
#[derive(Clone, Debug, PartialEq)]
pub struct ObstacleFinder {
    pub deviation_threshold: f32,
    pub min_supporting_cells: usize,
    pub connectivity: Connectivity,
    pub ground_window_radius: usize,
    pub noise_sigmas: f32,
}

impl ObstacleFinder {
    pub fn from_config(config: &Config) -> Result<Self, Error> {
        Ok(Self {
            deviation_threshold: config.deviation_threshold_m,
            min_supporting_cells: config.min_supporting_cells.max(1),
            connectivity: Connectivity::try_from(config.connectivity)?,
            ground_window_radius: config.ground_window_radius,
            noise_sigmas: config.noise_sigmas,
        })
    }

    /// Median `min_z` of observed cells within the ground window.
    fn local_ground(&self, grid: &ElevationGrid, row: usize, col: usize, buf: &mut Vec<f32>) -> f32 {
        let r = self.ground_window_radius;
        let row_end = (row + r + 1).min(grid.rows());
        let col_end = (col + r + 1).min(grid.cols());
        let window = grid
            .cells()
            .slice(ndarray::s![row.saturating_sub(r)..row_end, col.saturating_sub(r)..col_end]);

        buf.clear();
        buf.extend(window.iter().filter(|c| c.is_observed()).map(|c| c.min_z));

        // The cell itself is observed, so the window is never empty.
        let mid = buf.len() / 2;
        buf.select_nth_unstable_by(mid, |a, b| a.total_cmp(b));
        buf[mid]
    }

    /// Signed deviation and `|deviation| / threshold` for each deviant cell.
    fn score(&self, grid: &ElevationGrid) -> Vec<Option<(f32, f32)>> {
        let mut buf = Vec::new();
        let mut scores = Vec::with_capacity(grid.rows() * grid.cols());

        for ((row, col), cell) in grid.cells().indexed_iter() {
            if !cell.is_observed() {
                scores.push(None);
                continue;
            }
            let ground = self.local_ground(grid, row, col, &mut buf);
            let deviation = cell.mean_z - ground;
            let threshold = self
                .deviation_threshold
                .max(self.noise_sigmas * cell.variance_z.max(0.0).sqrt());

            if deviation > threshold || deviation < -threshold {
                scores.push(Some((deviation, deviation.abs() / threshold)));
            } else {
                scores.push(None);
            }
        }

        scores
    }

    fn confidence(&self, cells: usize, mean_ratio: f32) -> f32 {
        let support = 1.0 - (-(cells as f32) / self.min_supporting_cells as f32).exp();
        let magnitude = (mean_ratio / CONFIDENCE_SATURATION_RATIO).min(1.0);
        (support * magnitude).clamp(0.0, 1.0)
    }

    fn summarize(
        &self,
        grid: &ElevationGrid,
        members: &[usize],
        scores: &[Option<(f32, f32)>],
    ) -> Option<Obstacle> {
        let cols = grid.cols();
        let n = members.len() as f32;
        let cell_size = grid.cell_size();
        let extent = grid.extent();

        let mut deviation_sum = 0.0f32;
        let mut ratio_sum = 0.0f32;
        let mut cx = 0.0f32;
        let mut cy = 0.0f32;
        let (mut row_min, mut row_max) = (usize::MAX, 0);
        let (mut col_min, mut col_max) = (usize::MAX, 0);

        for &idx in members {
            let (row, col) = (idx / cols, idx % cols);
            if let Some((deviation, ratio)) = scores[idx] {
                deviation_sum += deviation;
                ratio_sum += ratio;
            }
            let (x, y) = grid.cell_center(row, col);
            cx += x;
            cy += y;
            row_min = row_min.min(row);
            row_max = row_max.max(row);
            col_min = col_min.min(col);
            col_max = col_max.max(col);
        }

        let min = (
            -extent + col_min as f32 * cell_size,
            -extent + row_min as f32 * cell_size,
        );
        let max = (
            -extent + (col_max + 1) as f32 * cell_size,
            -extent + (row_max + 1) as f32 * cell_size,
        );

        Obstacle::from_body(ObstacleBody {
            centroid: (cx / n, cy / n),
            bounding_radius: 0.5 * (max.0 - min.0).hypot(max.1 - min.1),
            height_deviation: deviation_sum / n,
            supporting_cells: members.len(),
            confidence: self.confidence(members.len(), ratio_sum / n),
            min,
            max,
        })
    }
}

impl TerrainAnalyzer for ObstacleFinder {
    #[instrument(skip_all, fields(frame_id = grid.frame_id()))]
    fn find(&self, grid: &ElevationGrid) -> Vec<Obstacle> {
        let rows = grid.rows() as isize;
        let cols = grid.cols() as isize;
        let scores = self.score(grid);
        let offsets = self.connectivity.offsets();

        let mut labels = vec![UNVISITED; scores.len()];
        let mut queue: Vec<usize> = Vec::new();
        let mut obstacles = Vec::new();

        for seed in 0..scores.len() {
            let sign = match scores[seed] {
                Some((deviation, _)) if labels[seed] == UNVISITED => deviation > 0.0,
                _ => continue,
            };

            // Breadth-first over same-sign deviant cells.
            queue.clear();
            queue.push(seed);
            labels[seed] = VISITED;
            let mut qi = 0;
            while qi < queue.len() {
                let idx = queue[qi];
                qi += 1;
                let row = (idx / cols as usize) as isize;
                let col = (idx % cols as usize) as isize;
                for &(dr, dc) in offsets {
                    let (nr, nc) = (row + dr, col + dc);
                    if nr < 0 || nc < 0 || nr >= rows || nc >= cols {
                        continue;
                    }
                    let ni = (nr * cols + nc) as usize;
                    if labels[ni] != UNVISITED {
                        continue;
                    }
                    if let Some((deviation, _)) = scores[ni] {
                        if (deviation > 0.0) == sign {
                            labels[ni] = VISITED;
                            queue.push(ni);
                        }
                    }
                }
            }

            if queue.len() < self.min_supporting_cells {
                trace!(
                    cells = queue.len(),
                    required = self.min_supporting_cells,
                    "component too small"
                );
                continue;
            }

            if let Some(obstacle) = self.summarize(grid, &queue, &scores) {
                obstacles.push(obstacle);
            }
        }

        obstacles.sort_by(|a, b| {
            let (ax, ay) = a.centroid();
            let (bx, by) = b.centroid();
            ay.total_cmp(&by).then(ax.total_cmp(&bx))
        });
        obstacles
    }
}
