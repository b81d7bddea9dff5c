// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Runtime configuration for decoding, frame assembly and terrain analysis.

use crate::{grid::MAX_CELLS_PER_SIDE, lidar::Error};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Terrain analyzer configuration.
///
/// Every field is optional in JSON documents and falls back to the value of
/// [`Config::default`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Edge length of a grid cell (meters).
    /// Default: 0.2m
    pub cell_size_m: f32,

    /// Half-width of the square grid centred on the sensor (meters).
    /// Default: 20.0m
    pub grid_extent_m: f32,

    /// Minimum height deviation from local ground for a deviant cell (meters).
    /// Default: 0.15m
    pub deviation_threshold_m: f32,

    /// Components with fewer cells are not reported.
    /// Default: 4
    pub min_supporting_cells: usize,

    /// Flood fill neighbourhood, 4 or 8.
    /// Default: 8
    pub connectivity: u8,

    /// Azimuth decrease required to detect a new rotation (degrees).
    /// Default: 180°
    pub wraparound_hysteresis_deg: f32,

    /// Rotations with fewer points are discarded.
    /// Default: 1000
    pub min_frame_points: usize,

    /// Capacity of the raw packet queue.
    /// Default: 256
    pub queue_depth: usize,

    /// Chebyshev radius of the local ground window (cells).
    /// Default: 5
    pub ground_window_radius: usize,

    /// Deviation threshold floor in multiples of a cell's z standard deviation.
    /// Default: 3.0
    pub noise_sigmas: f32,

    /// Maximum centroid distance for frame-to-frame association (meters),
    /// 0 disables association.
    /// Default: 1.0m
    pub association_distance_m: f32,

    /// Sensor height above ground, added to every z (meters).
    /// Default: 0.0m
    pub mount_height_m: f32,

    /// Sensor yaw relative to the vehicle, added to every azimuth (degrees).
    /// Default: 0.0°
    pub mount_yaw_deg: f32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cell_size_m: 0.2,
            grid_extent_m: 20.0,
            deviation_threshold_m: 0.15,
            min_supporting_cells: 4,
            connectivity: 8,
            wraparound_hysteresis_deg: 180.0,
            min_frame_points: 1000,
            queue_depth: 256,
            ground_window_radius: 5,
            noise_sigmas: 3.0,
            association_distance_m: 1.0,
            mount_height_m: 0.0,
            mount_yaw_deg: 0.0,
        }
    }
}

impl Config {
    /// Load a JSON configuration document and validate it.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let config: Config = serde_json::from_str(&json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the analyzer cannot work with.
    pub fn validate(&self) -> Result<(), Error> {
        let positive = [
            ("cell_size_m", self.cell_size_m),
            ("grid_extent_m", self.grid_extent_m),
            ("deviation_threshold_m", self.deviation_threshold_m),
            ("wraparound_hysteresis_deg", self.wraparound_hysteresis_deg),
        ];
        for (name, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                return Err(Error::Config(format!("{} must be positive, got {}", name, value)));
            }
        }

        if self.wraparound_hysteresis_deg >= 360.0 {
            return Err(Error::Config(format!(
                "wraparound_hysteresis_deg must be below 360, got {}",
                self.wraparound_hysteresis_deg
            )));
        }

        if self.connectivity != 4 && self.connectivity != 8 {
            return Err(Error::Config(format!(
                "connectivity must be 4 or 8, got {}",
                self.connectivity
            )));
        }

        if self.min_supporting_cells == 0 {
            return Err(Error::Config("min_supporting_cells must be at least 1".into()));
        }

        if self.queue_depth == 0 {
            return Err(Error::Config("queue_depth must be at least 1".into()));
        }

        if self.ground_window_radius == 0 {
            return Err(Error::Config("ground_window_radius must be at least 1".into()));
        }

        if !(self.noise_sigmas.is_finite() && self.noise_sigmas >= 0.0) {
            return Err(Error::Config(format!(
                "noise_sigmas must be non-negative, got {}",
                self.noise_sigmas
            )));
        }

        for (name, value) in [
            ("association_distance_m", self.association_distance_m),
            ("mount_height_m", self.mount_height_m),
            ("mount_yaw_deg", self.mount_yaw_deg),
        ] {
            if !value.is_finite() {
                return Err(Error::Config(format!("{} must be finite", name)));
            }
        }

        let cells = self.cells_per_side();
        if cells > MAX_CELLS_PER_SIDE {
            return Err(Error::Config(format!(
                "grid of {}x{} cells exceeds {} per side",
                cells, cells, MAX_CELLS_PER_SIDE
            )));
        }

        Ok(())
    }

    /// Grid cells per side: `ceil(2 · extent / cell)`.
    pub fn cells_per_side(&self) -> usize {
        crate::grid::cells_per_side(self.grid_extent_m, self.cell_size_m)
    }
}
