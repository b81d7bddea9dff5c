// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! EdgeFirst Terrain Library
//!
//! Decodes Velodyne VLP-16 / HDL-32E data packets into calibrated point
//! clouds and finds boulders and craters in every sensor rotation.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐    ┌───────────────┐    ┌───────────────┐
//! │ PacketSource │ ─► │ PacketDecoder │ ─► │ FrameAssembler│
//! │ (UDP/replay) │    │ (+calibration)│    │ (wraparound)  │
//! └──────────────┘    └───────────────┘    └───────────────┘
//!                                                  │ Frame
//!                                                  ▼
//!          ┌──────────────┐    ┌───────────────┐    ┌─────────────┐
//!          │ TerrainReport│ ◄─ │ ObstacleFinder│ ◄─ │ GridBuilder │
//!          │ (tracked ids)│    │ (median)      │    │ (Welford)   │
//!          └──────────────┘    └───────────────┘    └─────────────┘
//! ```
//!
//! The [`pipeline`] module runs decoding and analysis on separate threads
//! connected by bounded drop-oldest queues.
//!
//! # Modules
//!
//! - [`lidar`]: Common types and error handling
//! - [`calibration`]: Per-channel calibration tables
//! - [`velodyne`]: Data packet layout and decoder
//! - [`frame`]: Rotation frame assembly
//! - [`grid`]: Elevation grid builder
//! - [`obstacle`]: Boulder and crater detection
//! - [`terrain`]: Frame analysis and obstacle association
//! - [`pipeline`]: Threaded decode and analysis
//! - [`packet_source`]: Packet transport abstraction
//! - [`reference`]: Flat-ground reference calibration
//! - [`config`], [`args`]: Configuration surface
//!
//! # Example
//!
//! ```ignore
//! use edgefirst_terrain::{
//!     CalibrationTable, Config, FrameAssembler, PacketDecoder, SensorModel, Terrain,
//! };
//! use std::sync::Arc;
//!
//! let config = Config::default();
//! let table = Arc::new(CalibrationTable::factory(SensorModel::Vlp16));
//! let decoder = PacketDecoder::new(table);
//! let mut assembler =
//!     FrameAssembler::new(config.wraparound_hysteresis_deg, config.min_frame_points);
//! let mut terrain = Terrain::new(&config)?;
//!
//! loop {
//!     let packet = next_packet()?;
//!     let decoded = decoder.decode(&packet)?;
//!     if let Ok(Some(frame)) = assembler.ingest(decoded.points) {
//!         for obstacle in terrain.analyze(&frame).obstacles {
//!             println!("{}", obstacle.obstacle);
//!         }
//!     }
//! }
//! ```

pub mod args;
pub mod calibration;
pub mod config;
pub mod frame;
pub mod grid;
pub mod lidar;
pub mod obstacle;
pub mod packet_source;
pub mod pipeline;
pub mod reference;
pub mod terrain;
pub mod velodyne;

// Re-exports for convenience
pub use calibration::{CalibrationEntry, CalibrationTable};
pub use config::Config;
pub use frame::{Frame, FrameAssembler};
pub use grid::{ElevationGrid, GridBuilder, GridCell};
pub use lidar::{Error, Point3D, RawPacket, SensorModel};
pub use obstacle::{Obstacle, ObstacleFinder, ObstacleKind, TerrainAnalyzer};
pub use packet_source::{PacketSource, ReplaySource};
pub use reference::GroundReference;
pub use terrain::{Terrain, TerrainReport, TrackedObstacle};
pub use velodyne::{DataPacket, PacketDecoder};
