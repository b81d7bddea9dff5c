// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Flat-ground reference calibration.
//!
//! A capture recorded with the vehicle standing on level ground gives, for
//! every laser channel and azimuth, the height at which that laser hits the
//! ground. Subtracting this height from live returns cancels the mounting
//! tilt and per-channel elevation errors, so the reference ground reads as
//! `z = 0` and only real relief remains.
//!
//! Heights are kept per channel in [`AZIMUTH_BUCKETS`] buckets of 0.2°.
//! Buckets the capture never hit take the value of the nearest observed
//! bucket of the same channel.

use crate::{
    frame::Frame,
    lidar::{Error, RawPacket},
    packet_source::ReplaySource,
    velodyne::PacketDecoder,
};
use ndarray::Array2;
use std::path::Path;
use tracing::{debug, info};

/// Azimuth buckets per revolution
pub const AZIMUTH_BUCKETS: usize = 1800;

const BUCKET_DEG: f32 = 360.0 / AZIMUTH_BUCKETS as f32;

/// Expected ground height per (channel, azimuth bucket).
#[derive(Clone, Debug)]
pub struct GroundReference {
    /// Mean ground z, NaN for channels with no samples at all
    expected_z: Array2<f32>,
    /// Samples per bucket before gap filling
    samples: Array2<u32>,
}

#[inline]
fn bucket(azimuth_deg: f32) -> usize {
    ((azimuth_deg.rem_euclid(360.0) / BUCKET_DEG) as usize).min(AZIMUTH_BUCKETS - 1)
}

impl GroundReference {
    /// Average the points of flat-ground frames per channel and bucket.
    ///
    /// Points on channels at or above `channels` are ignored. Fails with
    /// [`Error::Calibration`] when no point could be used.
    pub fn from_frames<'a>(
        channels: usize,
        frames: impl IntoIterator<Item = &'a Frame>,
    ) -> Result<Self, Error> {
        let mut sum = Array2::<f64>::zeros((channels, AZIMUTH_BUCKETS));
        let mut samples = Array2::<u32>::zeros((channels, AZIMUTH_BUCKETS));
        let mut ignored = 0usize;

        for point in frames.into_iter().flat_map(|frame| frame.points.iter()) {
            let channel = point.channel as usize;
            if channel >= channels {
                ignored += 1;
                continue;
            }
            let b = bucket(point.azimuth_deg);
            sum[[channel, b]] += point.z as f64;
            samples[[channel, b]] += 1;
        }

        let used: u64 = samples.iter().map(|&n| n as u64).sum();
        if used == 0 {
            return Err(Error::Calibration(
                "ground capture holds no usable returns".into(),
            ));
        }
        if ignored > 0 {
            debug!(ignored, "ground capture points outside calibrated channels");
        }

        let mut expected_z = Array2::<f32>::from_elem((channels, AZIMUTH_BUCKETS), f32::NAN);
        for ((idx, z), &n) in expected_z.indexed_iter_mut().zip(samples.iter()) {
            if n > 0 {
                *z = (sum[idx] / n as f64) as f32;
            }
        }

        for mut row in expected_z.rows_mut() {
            let observed: Vec<usize> = (0..AZIMUTH_BUCKETS).filter(|&b| !row[b].is_nan()).collect();
            if observed.is_empty() {
                continue;
            }
            let known: Vec<f32> = observed.iter().map(|&b| row[b]).collect();
            for b in 0..AZIMUTH_BUCKETS {
                if row[b].is_nan() {
                    row[b] = known[nearest(&observed, b)];
                }
            }
        }

        let reference = Self {
            expected_z,
            samples,
        };
        info!(
            channels,
            samples = used,
            coverage = reference.coverage(),
            "ground reference built"
        );
        Ok(reference)
    }

    /// Decode a flat-ground capture and build the reference from it.
    ///
    /// `decoder` must not carry a reference itself. Malformed packets are
    /// skipped.
    pub fn from_packets(
        decoder: &PacketDecoder,
        packets: impl IntoIterator<Item = RawPacket>,
    ) -> Result<Self, Error> {
        let mut points = Vec::new();
        let mut malformed = 0usize;
        for raw in packets {
            match decoder.decode(&raw) {
                Ok(decoded) => points.extend(decoded.points),
                Err(e) => {
                    debug!("skipping capture packet: {}", e);
                    malformed += 1;
                }
            }
        }
        if malformed > 0 {
            debug!(malformed, "malformed packets in ground capture");
        }

        let frame = Frame::new(0, points);
        Self::from_frames(decoder.table().len(), [&frame])
    }

    /// Read a capture file of back-to-back data packets and build the
    /// reference from it.
    pub fn load(path: impl AsRef<Path>, decoder: &PacketDecoder) -> Result<Self, Error> {
        Self::from_packets(decoder, ReplaySource::load(path)?)
    }

    /// Ground height for a return of `channel` at `azimuth_deg`, `None`
    /// when the capture never saw that channel.
    pub fn expected_z(&self, channel: u8, azimuth_deg: f32) -> Option<f32> {
        let z = *self.expected_z.get([channel as usize, bucket(azimuth_deg)])?;
        (!z.is_nan()).then_some(z)
    }

    /// Fraction of (channel, bucket) pairs with at least one sample.
    pub fn coverage(&self) -> f32 {
        let hit = self.samples.iter().filter(|&&n| n > 0).count();
        hit as f32 / self.samples.len().max(1) as f32
    }

    pub fn channels(&self) -> usize {
        self.expected_z.nrows()
    }
}

/// Index into `observed` (sorted, non-empty) of the bucket circularly
/// closest to `b`.
fn nearest(observed: &[usize], b: usize) -> usize {
    let after = observed.partition_point(|&o| o < b);
    let before = if after == 0 { observed.len() - 1 } else { after - 1 };
    let after = after % observed.len();

    let distance = |o: usize| {
        let d = o.abs_diff(b);
        d.min(AZIMUTH_BUCKETS - d)
    };
    if distance(observed[before]) <= distance(observed[after]) {
        before
    } else {
        after
    }
}
