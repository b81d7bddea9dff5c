// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use clap::Parser;
use std::path::PathBuf;
use tracing::level_filters::LevelFilter;

use crate::{
    calibration::CalibrationTable,
    config::Config,
    lidar::{Error, SensorModel},
    packet_source::DEFAULT_DATA_PORT,
};

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// JSON configuration file.  Command line options override its values.
    #[arg(long, env)]
    pub config: Option<PathBuf>,

    /// JSON calibration file.  The factory table of --model is used when
    /// not provided.
    #[arg(long, env)]
    pub calibration: Option<PathBuf>,

    /// Raw capture of back-to-back data packets recorded on level ground.
    /// Heights are then reported relative to that ground.
    #[arg(long, env)]
    pub ground_capture: Option<PathBuf>,

    /// Sensor model used for the factory calibration table
    #[arg(long, env, default_value = "vlp16")]
    pub model: SensorModel,

    /// Local address to receive data packets on
    #[arg(long, env, default_value = "0.0.0.0")]
    pub bind: String,

    /// Data packet UDP port
    #[arg(long, env, default_value_t = DEFAULT_DATA_PORT)]
    pub port: u16,

    /// Grid cell edge length in meters
    #[arg(long, env)]
    pub cell_size: Option<f32>,

    /// Grid half-width in meters
    #[arg(long, env)]
    pub grid_extent: Option<f32>,

    /// Minimum deviation from local ground in meters
    #[arg(long, env)]
    pub deviation_threshold: Option<f32>,

    /// Minimum cells for a reported obstacle
    #[arg(long, env)]
    pub min_supporting_cells: Option<usize>,

    /// Flood fill connectivity, 4 or 8
    #[arg(long, env)]
    pub connectivity: Option<u8>,

    /// Azimuth drop in degrees that starts a new rotation
    #[arg(long, env)]
    pub wraparound_hysteresis: Option<f32>,

    /// Minimum points for a complete rotation
    #[arg(long, env)]
    pub min_frame_points: Option<usize>,

    /// Raw packet queue capacity
    #[arg(long, env)]
    pub queue_depth: Option<usize>,

    /// Local ground window radius in cells
    #[arg(long, env)]
    pub ground_window_radius: Option<usize>,

    /// Noise floor of the deviation threshold in standard deviations
    #[arg(long, env)]
    pub noise_sigmas: Option<f32>,

    /// Frame-to-frame association distance in meters, 0 disables
    #[arg(long, env)]
    pub association_distance: Option<f32>,

    /// Sensor height above ground in meters
    #[arg(long, env)]
    pub mount_height: Option<f32>,

    /// Sensor yaw relative to the vehicle in degrees
    #[arg(long, env)]
    pub mount_yaw: Option<f32>,

    /// Application log level
    #[arg(long, env, default_value = "info")]
    pub rust_log: LevelFilter,
}

impl Args {
    /// Socket address for the data port.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    /// Configuration file overlaid with command line values, validated.
    pub fn config(&self) -> Result<Config, Error> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)?,
            None => Config::default(),
        };

        if let Some(v) = self.cell_size {
            config.cell_size_m = v;
        }
        if let Some(v) = self.grid_extent {
            config.grid_extent_m = v;
        }
        if let Some(v) = self.deviation_threshold {
            config.deviation_threshold_m = v;
        }
        if let Some(v) = self.min_supporting_cells {
            config.min_supporting_cells = v;
        }
        if let Some(v) = self.connectivity {
            config.connectivity = v;
        }
        if let Some(v) = self.wraparound_hysteresis {
            config.wraparound_hysteresis_deg = v;
        }
        if let Some(v) = self.min_frame_points {
            config.min_frame_points = v;
        }
        if let Some(v) = self.queue_depth {
            config.queue_depth = v;
        }
        if let Some(v) = self.ground_window_radius {
            config.ground_window_radius = v;
        }
        if let Some(v) = self.noise_sigmas {
            config.noise_sigmas = v;
        }
        if let Some(v) = self.association_distance {
            config.association_distance_m = v;
        }
        if let Some(v) = self.mount_height {
            config.mount_height_m = v;
        }
        if let Some(v) = self.mount_yaw {
            config.mount_yaw_deg = v;
        }

        config.validate()?;
        Ok(config)
    }

    /// Calibration file if given, otherwise the factory table of `model`.
    pub fn calibration(&self) -> Result<CalibrationTable, Error> {
        match &self.calibration {
            Some(path) => CalibrationTable::load(path),
            None => Ok(CalibrationTable::factory(self.model)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overrides() {
        let args = Args::try_parse_from([
            "edgefirst-terrain",
            "--cell-size",
            "0.25",
            "--connectivity",
            "4",
            "--mount-height",
            "0.383",
            "--model",
            "hdl32e",
        ])
        .unwrap();
        let config = args.config().unwrap();
        assert_eq!(config.cell_size_m, 0.25);
        assert_eq!(config.connectivity, 4);
        assert_eq!(config.mount_height_m, 0.383);
        assert_eq!(config.grid_extent_m, Config::default().grid_extent_m);
        assert_eq!(args.calibration().unwrap().len(), 32);
    }

    #[test]
    fn test_invalid_override() {
        let args =
            Args::try_parse_from(["edgefirst-terrain", "--connectivity", "6"]).unwrap();
        assert!(matches!(args.config(), Err(Error::Config(_))));
    }

    #[test]
    fn test_bind_addr() {
        let args = Args::try_parse_from([
            "edgefirst-terrain",
            "--bind",
            "127.0.0.1",
            "--port",
            "2369",
        ])
        .unwrap();
        assert_eq!(args.bind_addr(), "127.0.0.1:2369");
    }

    #[test]
    fn test_ground_capture() {
        let args = Args::try_parse_from([
            "edgefirst-terrain",
            "--ground-capture",
            "/data/level.bin",
        ])
        .unwrap();
        assert_eq!(args.ground_capture, Some(PathBuf::from("/data/level.bin")));
    }
}
