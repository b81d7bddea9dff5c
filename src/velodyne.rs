// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Velodyne VLP-16 / HDL-32E data packet decoder.
//!
//! # Packet Structure
//!
//! Data packets are 1206 bytes (UDP payload, port 2368), little-endian:
//! - Data: 12 blocks × 100 bytes = 1200 bytes
//!   - Flag: 2 bytes, `FF EE`
//!   - Azimuth: 2 bytes, hundredths of a degree (0..35999)
//!   - 32 returns × 3 bytes: distance (2 mm units), intensity
//! - Timestamp: 4 bytes, µs past the top of the hour
//! - Return mode: 1 byte
//! - Product id: 1 byte
//!
//! The VLP-16 packs two 16-laser firing sequences into each block, the
//! HDL-32E fires all 32 lasers once per block.

use crate::{
    calibration::CalibrationTable,
    config::Config,
    lidar::{Error, Point3D, RawPacket, SensorModel},
    reference::GroundReference,
};
use std::sync::Arc;
use tracing::trace;

/// Data packet total size in bytes
pub const PACKET_SIZE: usize = 1206;

/// Number of data blocks per packet
pub const BLOCKS_PER_PACKET: usize = 12;

/// Number of laser returns per data block
pub const RETURNS_PER_BLOCK: usize = 32;

/// Size of each data block in bytes
const BLOCK_SIZE: usize = 100;

/// Size of each laser return in bytes
const RETURN_SIZE: usize = 3;

/// Data block flag as it appears on the wire
const BLOCK_FLAG: [u8; 2] = [0xff, 0xee];

const TIMESTAMP_OFFSET: usize = 1200;
const RETURN_MODE_OFFSET: usize = 1204;
const PRODUCT_ID_OFFSET: usize = 1205;

/// Distance resolution in meters (2mm)
const DISTANCE_RESOLUTION: f64 = 0.002;

/// Raw distance reported for a saturated return
const DISTANCE_SATURATED: u16 = 0xffff;

/// Azimuth units per revolution (hundredths of a degree)
const AZIMUTH_UNITS: u32 = 36_000;

/// Firing sequences per block on the VLP-16
const VLP16_SEQUENCES: usize = 2;

pub const RETURN_MODE_STRONGEST: u8 = 0x37;
pub const RETURN_MODE_LAST: u8 = 0x38;
pub const RETURN_MODE_DUAL: u8 = 0x39;

/// A single laser return as stored in a data block.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LaserReturn {
    /// Laser channel, derived from the return's position in the block
    pub channel_id: u8,
    /// Distance in 2 mm units, 0 when there was no reflection
    pub distance_raw: u16,
    pub intensity: u8,
}

/// One data block: a start azimuth and 32 returns.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FiringData {
    pub azimuth_raw: u16,
    pub returns: [LaserReturn; RETURNS_PER_BLOCK],
}

impl Default for FiringData {
    fn default() -> Self {
        Self {
            azimuth_raw: 0,
            returns: [LaserReturn::default(); RETURNS_PER_BLOCK],
        }
    }
}

/// Structured view of a validated data packet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataPacket {
    pub firings: [FiringData; BLOCKS_PER_PACKET],
    /// Microseconds past the top of the hour
    pub timestamp_us: u32,
    pub return_mode: u8,
    pub product_id: u8,
    /// Sensor layout used to assign channel ids
    pub model: SensorModel,
}

/// Channel id and in-block timing fraction of the return at `index`.
///
/// VLP-16 returns are spread over two sequences of 16, so the fraction is
/// `(s·16 + c) / 32`, which for the VLP-16 reduces to `index / 32` as it
/// does for the HDL-32E.
#[inline]
fn return_layout(model: SensorModel, index: usize) -> (u8, f64) {
    let fraction = index as f64 / RETURNS_PER_BLOCK as f64;
    let channel = match model {
        SensorModel::Vlp16 => index % (RETURNS_PER_BLOCK / VLP16_SEQUENCES),
        SensorModel::Hdl32e => index,
    };
    (channel as u8, fraction)
}

impl DataPacket {
    /// An empty packet for `model`: every block flagged with no returns.
    pub fn new(model: SensorModel, timestamp_us: u32) -> Self {
        let mut firings = [FiringData::default(); BLOCKS_PER_PACKET];
        for firing in firings.iter_mut() {
            for (index, ret) in firing.returns.iter_mut().enumerate() {
                ret.channel_id = return_layout(model, index).0;
            }
        }
        Self {
            firings,
            timestamp_us,
            return_mode: RETURN_MODE_STRONGEST,
            product_id: model.product_id(),
            model,
        }
    }

    /// Parse and validate a raw packet.
    ///
    /// Only single-return packets (strongest or last) are accepted. The
    /// channel layout follows the packet's product id; packets carrying
    /// an unrecognized id are decoded with the `fallback` layout.
    pub fn parse(data: &[u8], fallback: SensorModel) -> Result<Self, Error> {
        if data.len() != PACKET_SIZE {
            return Err(Error::MalformedPacket(format!(
                "expected {} bytes, got {}",
                PACKET_SIZE,
                data.len()
            )));
        }

        let return_mode = data[RETURN_MODE_OFFSET];
        if return_mode == RETURN_MODE_DUAL {
            // Dual packets pair blocks by azimuth; single-return timing does not apply.
            return Err(Error::MalformedPacket("dual return mode is not supported".into()));
        }

        let product_id = data[PRODUCT_ID_OFFSET];
        let model = SensorModel::from_product_id(product_id).unwrap_or(fallback);

        let mut firings = [FiringData::default(); BLOCKS_PER_PACKET];
        for (b, firing) in firings.iter_mut().enumerate() {
            let block = &data[b * BLOCK_SIZE..(b + 1) * BLOCK_SIZE];
            if block[0..2] != BLOCK_FLAG {
                return Err(Error::MalformedPacket(format!(
                    "block {} flag {:02x}{:02x}",
                    b, block[0], block[1]
                )));
            }

            let azimuth_raw = u16::from_le_bytes([block[2], block[3]]);
            if azimuth_raw as u32 >= AZIMUTH_UNITS {
                return Err(Error::MalformedPacket(format!(
                    "block {} azimuth {} out of range",
                    b, azimuth_raw
                )));
            }
            firing.azimuth_raw = azimuth_raw;

            for (index, ret) in firing.returns.iter_mut().enumerate() {
                let o = 4 + index * RETURN_SIZE;
                *ret = LaserReturn {
                    channel_id: return_layout(model, index).0,
                    distance_raw: u16::from_le_bytes([block[o], block[o + 1]]),
                    intensity: block[o + 2],
                };
            }
        }

        Ok(DataPacket {
            firings,
            timestamp_us: u32::from_le_bytes([
                data[TIMESTAMP_OFFSET],
                data[TIMESTAMP_OFFSET + 1],
                data[TIMESTAMP_OFFSET + 2],
                data[TIMESTAMP_OFFSET + 3],
            ]),
            return_mode,
            product_id,
            model,
        })
    }

    /// Serialize to the 1206-byte wire layout.
    pub fn encode(&self) -> [u8; PACKET_SIZE] {
        let mut data = [0u8; PACKET_SIZE];
        for (b, firing) in self.firings.iter().enumerate() {
            let block = &mut data[b * BLOCK_SIZE..(b + 1) * BLOCK_SIZE];
            block[0..2].copy_from_slice(&BLOCK_FLAG);
            block[2..4].copy_from_slice(&firing.azimuth_raw.to_le_bytes());
            for (index, ret) in firing.returns.iter().enumerate() {
                let o = 4 + index * RETURN_SIZE;
                block[o..o + 2].copy_from_slice(&ret.distance_raw.to_le_bytes());
                block[o + 2] = ret.intensity;
            }
        }
        data[TIMESTAMP_OFFSET..TIMESTAMP_OFFSET + 4].copy_from_slice(&self.timestamp_us.to_le_bytes());
        data[RETURN_MODE_OFFSET] = self.return_mode;
        data[PRODUCT_ID_OFFSET] = self.product_id;
        data
    }

    /// Azimuth gap to the following block in hundredths of a degree,
    /// taken modulo one revolution. The last block reuses the previous gap.
    fn azimuth_gaps(&self) -> [u32; BLOCKS_PER_PACKET] {
        let mut gaps = [0u32; BLOCKS_PER_PACKET];
        for b in 0..BLOCKS_PER_PACKET - 1 {
            let this = self.firings[b].azimuth_raw as u32;
            let next = self.firings[b + 1].azimuth_raw as u32;
            gaps[b] = (next + AZIMUTH_UNITS - this) % AZIMUTH_UNITS;
        }
        gaps[BLOCKS_PER_PACKET - 1] = gaps[BLOCKS_PER_PACKET - 2];
        gaps
    }
}

/// Sensor mounting on the vehicle.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Mounting {
    /// Height of the optical centre above the ground, added to z
    pub height_m: f64,
    /// Yaw added to every azimuth before projection
    pub yaw_deg: f64,
}

/// Result of decoding one packet.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Decoded {
    pub points: Vec<Point3D>,
    /// Returns dropped because their channel has no calibration entry
    pub unknown_channels: u32,
    /// Returns without a reflection (zero or saturated distance)
    pub empty_returns: u32,
    pub timestamp_us: u32,
    pub return_mode: u8,
}

/// Stateless packet decoder bound to a calibration table.
///
/// Elevation sines and cosines are precomputed per channel when the decoder
/// is created; decoding itself only reads shared state.
#[derive(Clone, Debug)]
pub struct PacketDecoder {
    table: Arc<CalibrationTable>,
    elevation: Vec<(f64, f64)>,
    mounting: Mounting,
    reference: Option<Arc<GroundReference>>,
}

impl PacketDecoder {
    pub fn new(table: Arc<CalibrationTable>) -> Self {
        let elevation = table
            .entries()
            .iter()
            .map(|entry| entry.vertical_angle_deg.to_radians().sin_cos())
            .collect();
        Self {
            table,
            elevation,
            mounting: Mounting::default(),
            reference: None,
        }
    }

    /// Decoder with the mounting given by `config`.
    pub fn from_config(table: Arc<CalibrationTable>, config: &Config) -> Self {
        Self::new(table).with_mounting(Mounting {
            height_m: config.mount_height_m as f64,
            yaw_deg: config.mount_yaw_deg as f64,
        })
    }

    #[must_use]
    pub fn with_mounting(mut self, mounting: Mounting) -> Self {
        self.mounting = mounting;
        self
    }

    /// Report heights relative to a recorded flat-ground reference instead
    /// of the mounting height alone.
    #[must_use]
    pub fn with_reference(mut self, reference: Arc<GroundReference>) -> Self {
        self.reference = Some(reference);
        self
    }

    pub fn reference(&self) -> Option<&Arc<GroundReference>> {
        self.reference.as_ref()
    }

    pub fn table(&self) -> &Arc<CalibrationTable> {
        &self.table
    }

    /// Decode a raw packet into calibrated points.
    ///
    /// Fails only with [`Error::MalformedPacket`]; returns on channels the
    /// table does not cover are dropped and counted in
    /// [`Decoded::unknown_channels`].
    pub fn decode(&self, raw: &RawPacket) -> Result<Decoded, Error> {
        let packet = DataPacket::parse(&raw.data, self.table.model())?;
        let block_ns = packet.model.block_duration_us() * 1000.0;
        let gaps = packet.azimuth_gaps();

        let mut decoded = Decoded {
            points: Vec::with_capacity(BLOCKS_PER_PACKET * RETURNS_PER_BLOCK),
            timestamp_us: packet.timestamp_us,
            return_mode: packet.return_mode,
            ..Default::default()
        };

        for (b, firing) in packet.firings.iter().enumerate() {
            for (index, ret) in firing.returns.iter().enumerate() {
                let fraction = return_layout(packet.model, index).1;
                let azimuth = firing.azimuth_raw as f64 + gaps[b] as f64 * fraction;
                let offset_ns = (block_ns * (b as f64 + fraction)).round() as u64;

                match self.project(ret, azimuth, raw.timestamp_ns + offset_ns) {
                    Ok(Some(point)) => decoded.points.push(point),
                    Ok(None) => decoded.empty_returns += 1,
                    Err(Error::UnknownChannel { channel, available }) => {
                        trace!(channel, available, "dropping return on unknown channel");
                        decoded.unknown_channels += 1;
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        Ok(decoded)
    }

    /// Project a single return. `azimuth` is in hundredths of a degree.
    #[inline]
    fn project(
        &self,
        ret: &LaserReturn,
        azimuth: f64,
        timestamp_ns: u64,
    ) -> Result<Option<Point3D>, Error> {
        if ret.distance_raw == 0 || ret.distance_raw == DISTANCE_SATURATED {
            return Ok(None);
        }
        let entry = self.table.get(ret.channel_id)?;
        let distance =
            ret.distance_raw as f64 * DISTANCE_RESOLUTION + entry.distance_correction_mm / 1000.0;
        if distance <= 0.0 {
            return Ok(None);
        }

        let azimuth_deg =
            (azimuth / 100.0 + entry.rotational_offset_deg + self.mounting.yaw_deg).rem_euclid(360.0);
        let (sin_az, cos_az) = azimuth_deg.to_radians().sin_cos();
        let (sin_el, cos_el) = self.elevation[ret.channel_id as usize];
        let horizontal = distance * cos_el;

        let mut z = distance * sin_el + self.mounting.height_m;
        if let Some(ground) = self
            .reference
            .as_deref()
            .and_then(|r| r.expected_z(ret.channel_id, azimuth_deg as f32))
        {
            z -= ground as f64;
        }

        Ok(Some(Point3D {
            x: (horizontal * sin_az) as f32,
            y: (horizontal * cos_az) as f32,
            z: z as f32,
            intensity: entry.clamp_intensity(ret.intensity),
            channel: ret.channel_id,
            azimuth_deg: azimuth_deg as f32,
            timestamp_ns,
        }))
    }
}

/// Decode a raw packet against `table` with no mounting correction.
pub fn decode(raw: &RawPacket, table: &CalibrationTable) -> Result<Decoded, Error> {
    PacketDecoder::new(Arc::new(table.clone())).decode(raw)
}
