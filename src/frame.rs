// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Rotation frame assembly.
//!
//! Points arrive in firing order. A frame ends when the azimuth drops back
//! past 0°, detected as a decrease larger than the configured hysteresis so
//! that jitter around the seam does not split a rotation.

use crate::lidar::{Error, Point3D};
use tracing::{debug, trace};

/// Expected points per rotation (VLP-16 at 10 Hz is ~29k)
const POINTS_PER_FRAME: usize = 30_000;

/// One full sensor rotation.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Frame {
    pub points: Vec<Point3D>,
    /// Sequence number, incremented for every sealed rotation
    pub frame_id: u32,
    /// Timestamp of the first point in nanoseconds
    pub start_ns: u64,
    /// Timestamp of the last point in nanoseconds
    pub end_ns: u64,
}

impl Frame {
    /// Build a frame from points, taking the time span from the first and
    /// last point.
    pub fn new(frame_id: u32, points: Vec<Point3D>) -> Self {
        let start_ns = points.first().map_or(0, |p| p.timestamp_ns);
        let end_ns = points.last().map_or(0, |p| p.timestamp_ns);
        Self {
            points,
            frame_id,
            start_ns,
            end_ns,
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// Accumulates decoded points into rotation frames.
pub struct FrameAssembler {
    hysteresis_deg: f32,
    min_frame_points: usize,
    points: Vec<Point3D>,
    last_azimuth: Option<f32>,
    next_frame_id: u32,
    superseded: u64,
    incomplete: u64,
}

impl FrameAssembler {
    pub fn new(hysteresis_deg: f32, min_frame_points: usize) -> Self {
        Self {
            hysteresis_deg,
            min_frame_points,
            points: Vec::with_capacity(POINTS_PER_FRAME),
            last_azimuth: None,
            next_frame_id: 0,
            superseded: 0,
            incomplete: 0,
        }
    }

    /// Append a batch of points, sealing a frame on wraparound.
    ///
    /// Returns `Ok(Some(frame))` when a rotation completed within this batch
    /// and `Ok(None)` while the rotation is still in progress. A rotation
    /// sealed with fewer than `min_frame_points` points is discarded and
    /// counted in [`Self::incomplete_frames`]; it is reported as
    /// [`Error::IncompleteFrame`] only when no complete rotation sealed in
    /// the same batch. The assembler stays usable either way.
    ///
    /// If the batch completes more than one rotation only the latest is
    /// returned, earlier ones are counted in [`Self::superseded_frames`].
    pub fn ingest(&mut self, points: Vec<Point3D>) -> Result<Option<Frame>, Error> {
        let mut latest: Option<Frame> = None;
        let mut incomplete: Option<Error> = None;

        for point in points {
            if let Some(last) = self.last_azimuth {
                if point.azimuth_deg < last - self.hysteresis_deg {
                    trace!(last, azimuth = point.azimuth_deg, "wraparound");
                    match self.seal() {
                        Ok(frame) => {
                            if let Some(old) = latest.replace(frame) {
                                debug!(frame_id = old.frame_id, "frame superseded in batch");
                                self.superseded += 1;
                            }
                        }
                        Err(e) => {
                            debug!(error = %e, "discarding incomplete frame");
                            self.incomplete += 1;
                            incomplete = Some(e);
                        }
                    }
                }
            }
            self.last_azimuth = Some(point.azimuth_deg);
            self.points.push(point);
        }

        match (latest, incomplete) {
            (Some(frame), _) => Ok(Some(frame)),
            (None, Some(e)) => Err(e),
            (None, None) => Ok(None),
        }
    }

    /// Discard the partially assembled rotation.
    pub fn flush(&mut self) {
        if !self.points.is_empty() {
            debug!(points = self.points.len(), "discarding partial frame");
        }
        self.points.clear();
        self.last_azimuth = None;
    }

    /// Points buffered for the rotation in progress.
    pub fn pending(&self) -> usize {
        self.points.len()
    }

    /// Complete rotations replaced by a later one within the same batch.
    pub fn superseded_frames(&self) -> u64 {
        self.superseded
    }

    /// Rotations discarded for having too few points.
    pub fn incomplete_frames(&self) -> u64 {
        self.incomplete
    }

    fn seal(&mut self) -> Result<Frame, Error> {
        let frame_id = self.next_frame_id;
        self.next_frame_id = self.next_frame_id.wrapping_add(1);

        let points = std::mem::replace(&mut self.points, Vec::with_capacity(POINTS_PER_FRAME));
        if points.len() < self.min_frame_points {
            return Err(Error::IncompleteFrame {
                frame_id,
                points: points.len(),
                required: self.min_frame_points,
            });
        }

        Ok(Frame::new(frame_id, points))
    }
}
