// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Common LiDAR types shared by the decoder and the terrain analyzer.
//!
//! This module holds the sensor model selector, the decoded point type, the
//! raw packet envelope handed over by the transport and the crate-wide error
//! taxonomy.

use clap::ValueEnum;
use serde::Deserialize;
use std::fmt;

/// Crate-wide error type.
///
/// Per-packet and per-return variants ([`Error::MalformedPacket`],
/// [`Error::UnknownChannel`], [`Error::IncompleteFrame`]) are recoverable and
/// only degrade data completeness. [`Error::Calibration`] and
/// [`Error::Config`] are startup failures.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error (socket, file operations)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Packet has the wrong size or an invalid block structure
    #[error("malformed packet: {0}")]
    MalformedPacket(String),
    /// A laser return referenced a channel missing from the calibration table
    #[error("unknown channel {channel}: calibration covers {available} channels")]
    UnknownChannel { channel: u8, available: usize },
    /// A sealed frame did not reach the minimum point count
    #[error("incomplete frame {frame_id}: {points} points, at least {required} required")]
    IncompleteFrame {
        frame_id: u32,
        points: usize,
        required: usize,
    },
    /// Calibration table could not be loaded or is inconsistent
    #[error("calibration error: {0}")]
    Calibration(String),
    /// Invalid configuration value
    #[error("configuration error: {0}")]
    Config(String),
    /// JSON parsing error
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    /// Shape error from ndarray operations
    #[error("shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),
    /// System time error
    #[error("system time error: {0}")]
    SystemTime(#[from] std::time::SystemTimeError),
    /// The pipeline has been shut down
    #[error("pipeline closed")]
    Closed,
}

/// Supported Velodyne sensor models.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorModel {
    /// VLP-16 "Puck": 16 channels, two firing sequences per data block
    #[default]
    Vlp16,
    /// HDL-32E: 32 channels, one firing sequence per data block
    Hdl32e,
}

impl SensorModel {
    /// Number of physical laser channels.
    pub fn channels(&self) -> usize {
        match self {
            SensorModel::Vlp16 => 16,
            SensorModel::Hdl32e => 32,
        }
    }

    /// Duration of one data block in microseconds.
    ///
    /// A VLP-16 block holds two firing sequences of 55.296 µs each, an
    /// HDL-32E block holds a single 46.08 µs sequence.
    pub fn block_duration_us(&self) -> f64 {
        match self {
            SensorModel::Vlp16 => 110.592,
            SensorModel::Hdl32e => 46.08,
        }
    }

    /// Product identifier found in the last byte of every data packet.
    pub fn product_id(&self) -> u8 {
        match self {
            SensorModel::Vlp16 => 0x22,
            SensorModel::Hdl32e => 0x21,
        }
    }

    /// Look up a model from a data packet's product identifier.
    pub fn from_product_id(id: u8) -> Option<Self> {
        match id {
            0x22 => Some(SensorModel::Vlp16),
            0x21 => Some(SensorModel::Hdl32e),
            _ => None,
        }
    }
}

impl fmt::Display for SensorModel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SensorModel::Vlp16 => write!(f, "vlp16"),
            SensorModel::Hdl32e => write!(f, "hdl32e"),
        }
    }
}

/// A single calibrated LiDAR return in the sensor frame.
///
/// Coordinates are metres with x to the right, y forward and z up. The
/// azimuth is the corrected azimuth used for projection, in `[0, 360)`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Point3D {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub intensity: u8,
    pub channel: u8,
    pub azimuth_deg: f32,
    /// Capture time in nanoseconds
    pub timestamp_ns: u64,
}

/// A raw packet as delivered by the transport, with its arrival time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawPacket {
    pub data: Vec<u8>,
    /// Arrival timestamp in nanoseconds
    pub timestamp_ns: u64,
}

impl RawPacket {
    pub fn new(data: Vec<u8>, timestamp_ns: u64) -> Self {
        Self { data, timestamp_ns }
    }
}

/// Get current timestamp in nanoseconds.
///
/// On Linux, uses `CLOCK_MONOTONIC_RAW` for best accuracy.
/// On other platforms, falls back to `SystemTime`.
#[cfg(target_os = "linux")]
pub fn timestamp() -> Result<u64, Error> {
    let mut tp = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    let err = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC_RAW, &mut tp) };
    if err != 0 {
        return Err(std::io::Error::last_os_error().into());
    }

    Ok(tp.tv_sec as u64 * 1_000_000_000 + tp.tv_nsec as u64)
}

#[cfg(not(target_os = "linux"))]
pub fn timestamp() -> Result<u64, Error> {
    let now = std::time::SystemTime::now();
    let duration = now.duration_since(std::time::UNIX_EPOCH)?;
    Ok(duration.as_nanos() as u64)
}
