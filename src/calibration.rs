// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Per-channel laser calibration.
//!
//! A [`CalibrationTable`] holds exactly one [`CalibrationEntry`] per physical
//! laser of the configured [`SensorModel`], indexed by channel id. Tables are
//! loaded once at startup, either from the built-in factory values or from a
//! JSON document:
//!
//! ```json
//! {
//!   "model": "vlp16",
//!   "lasers": [
//!     { "channel": 0, "vertical_angle_deg": -15.0, "rotational_offset_deg": 0.0,
//!       "distance_correction_mm": 0.0, "min_intensity": 0, "max_intensity": 255 }
//!   ]
//! }
//! ```
//!
//! Only `channel` and `vertical_angle_deg` are required for each laser.

use crate::lidar::{Error, SensorModel};
use serde::Deserialize;
use std::path::Path;
use tracing::debug;

/// VLP-16 factory vertical angles in degrees, by channel id.
const VLP16_VERTICAL_DEG: [f64; 16] = [
    -15.0, 1.0, -13.0, 3.0, -11.0, 5.0, -9.0, 7.0, -7.0, 9.0, -5.0, 11.0, -3.0, 13.0, -1.0, 15.0,
];

/// HDL-32E factory vertical angles in degrees, by channel id.
const HDL32E_VERTICAL_DEG: [f64; 32] = [
    -30.67, -9.33, -29.33, -8.00, -28.00, -6.67, -26.67, -5.33, -25.33, -4.00, -24.00, -2.67,
    -22.67, -1.33, -21.33, 0.00, -20.00, 1.33, -18.67, 2.67, -17.33, 4.00, -16.00, 5.33, -14.67,
    6.67, -13.33, 8.00, -12.00, 9.33, -10.67, 10.67,
];

/// Calibration of a single laser channel.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct CalibrationEntry {
    #[serde(rename = "channel")]
    pub channel_id: u8,
    pub vertical_angle_deg: f64,
    /// Angular correction added to the interpolated azimuth.
    #[serde(default)]
    pub rotational_offset_deg: f64,
    #[serde(default)]
    pub distance_correction_mm: f64,
    #[serde(default)]
    pub min_intensity: u8,
    #[serde(default = "default_max_intensity")]
    pub max_intensity: u8,
}

fn default_max_intensity() -> u8 {
    u8::MAX
}

impl CalibrationEntry {
    /// Entry with only a vertical angle, no corrections and the full
    /// intensity range.
    pub fn new(channel_id: u8, vertical_angle_deg: f64) -> Self {
        Self {
            channel_id,
            vertical_angle_deg,
            rotational_offset_deg: 0.0,
            distance_correction_mm: 0.0,
            min_intensity: 0,
            max_intensity: u8::MAX,
        }
    }

    /// Clamp a raw intensity into this channel's valid range.
    #[inline]
    pub fn clamp_intensity(&self, intensity: u8) -> u8 {
        intensity.clamp(self.min_intensity, self.max_intensity)
    }
}

#[derive(Deserialize)]
struct CalibrationFile {
    model: SensorModel,
    lasers: Vec<CalibrationEntry>,
}

/// Immutable calibration table, shared across threads behind an `Arc`.
#[derive(Clone, Debug, PartialEq)]
pub struct CalibrationTable {
    model: SensorModel,
    entries: Vec<CalibrationEntry>,
}

impl CalibrationTable {
    /// Build a table from an unordered list of entries.
    ///
    /// Every channel of `model` must appear exactly once and each entry must
    /// be physically plausible, otherwise [`Error::Calibration`] is returned.
    pub fn new(model: SensorModel, lasers: Vec<CalibrationEntry>) -> Result<Self, Error> {
        let channels = model.channels();
        if lasers.len() != channels {
            return Err(Error::Calibration(format!(
                "{} requires {} lasers, found {}",
                model,
                channels,
                lasers.len()
            )));
        }

        let mut slots: Vec<Option<CalibrationEntry>> = vec![None; channels];
        for entry in lasers {
            let id = entry.channel_id as usize;
            if id >= channels {
                return Err(Error::Calibration(format!(
                    "channel {} out of range for {}",
                    id, model
                )));
            }
            if !entry.vertical_angle_deg.is_finite() || entry.vertical_angle_deg.abs() > 90.0 {
                return Err(Error::Calibration(format!(
                    "channel {}: vertical angle {} outside [-90, 90]",
                    id, entry.vertical_angle_deg
                )));
            }
            if !entry.rotational_offset_deg.is_finite() || !entry.distance_correction_mm.is_finite()
            {
                return Err(Error::Calibration(format!(
                    "channel {}: non-finite correction",
                    id
                )));
            }
            if entry.min_intensity > entry.max_intensity {
                return Err(Error::Calibration(format!(
                    "channel {}: min_intensity {} exceeds max_intensity {}",
                    id, entry.min_intensity, entry.max_intensity
                )));
            }
            if slots[id].is_some() {
                return Err(Error::Calibration(format!("duplicate channel {}", id)));
            }
            slots[id] = Some(entry);
        }

        // Length check plus duplicate check leaves every slot filled.
        let entries: Vec<CalibrationEntry> = slots.into_iter().flatten().collect();
        Ok(Self { model, entries })
    }

    /// Nominal factory calibration: published vertical angles, no
    /// corrections.
    pub fn factory(model: SensorModel) -> Self {
        let angles: &[f64] = match model {
            SensorModel::Vlp16 => &VLP16_VERTICAL_DEG,
            SensorModel::Hdl32e => &HDL32E_VERTICAL_DEG,
        };
        let entries = angles
            .iter()
            .enumerate()
            .map(|(channel, angle)| CalibrationEntry::new(channel as u8, *angle))
            .collect();
        Self { model, entries }
    }

    /// Parse a JSON calibration document.
    pub fn from_json(json: &str) -> Result<Self, Error> {
        let file: CalibrationFile = serde_json::from_str(json)
            .map_err(|e| Error::Calibration(format!("invalid calibration json: {}", e)))?;
        Self::new(file.model, file.lasers)
    }

    /// Load a JSON calibration document from disk.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            Error::Calibration(format!("cannot read {}: {}", path.display(), e))
        })?;
        let table = Self::from_json(&json)?;
        debug!(path = %path.display(), model = %table.model, "loaded calibration");
        Ok(table)
    }

    pub fn model(&self) -> SensorModel {
        self.model
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[CalibrationEntry] {
        &self.entries
    }

    /// Look up the entry for a channel id.
    #[inline]
    pub fn get(&self, channel: u8) -> Result<&CalibrationEntry, Error> {
        self.entries
            .get(channel as usize)
            .ok_or(Error::UnknownChannel {
                channel,
                available: self.entries.len(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vlp16_json(lasers: &str) -> String {
        format!(r#"{{ "model": "vlp16", "lasers": [{}] }}"#, lasers)
    }

    fn vlp16_lasers(skip: Option<u8>) -> Vec<String> {
        (0..16u8)
            .filter(|c| Some(*c) != skip)
            .map(|c| {
                format!(
                    r#"{{ "channel": {}, "vertical_angle_deg": {:.1} }}"#,
                    c, VLP16_VERTICAL_DEG[c as usize]
                )
            })
            .collect()
    }

    #[test]
    fn test_factory_tables() {
        let vlp = CalibrationTable::factory(SensorModel::Vlp16);
        assert_eq!(vlp.len(), 16);
        assert_eq!(vlp.get(0).unwrap().vertical_angle_deg, -15.0);
        assert_eq!(vlp.get(15).unwrap().vertical_angle_deg, 15.0);

        let hdl = CalibrationTable::factory(SensorModel::Hdl32e);
        assert_eq!(hdl.len(), 32);
        assert_eq!(hdl.get(0).unwrap().vertical_angle_deg, -30.67);
        assert_eq!(hdl.get(31).unwrap().vertical_angle_deg, 10.67);
    }

    #[test]
    fn test_unknown_channel() {
        let vlp = CalibrationTable::factory(SensorModel::Vlp16);
        match vlp.get(16) {
            Err(Error::UnknownChannel { channel, available }) => {
                assert_eq!(channel, 16);
                assert_eq!(available, 16);
            }
            other => panic!("expected UnknownChannel, got {:?}", other),
        }
    }

    #[test]
    fn test_from_json_defaults() {
        let json = vlp16_json(&vlp16_lasers(None).join(","));
        let table = CalibrationTable::from_json(&json).unwrap();
        assert_eq!(table, CalibrationTable::factory(SensorModel::Vlp16));
    }

    #[test]
    fn test_from_json_unordered_with_corrections() {
        let mut lasers = vlp16_lasers(Some(3));
        lasers.insert(
            0,
            r#"{ "channel": 3, "vertical_angle_deg": 3.0, "rotational_offset_deg": -1.5,
                 "distance_correction_mm": 12.0, "min_intensity": 5, "max_intensity": 200 }"#
                .to_string(),
        );
        let table = CalibrationTable::from_json(&vlp16_json(&lasers.join(","))).unwrap();
        let entry = table.get(3).unwrap();
        assert_eq!(entry.rotational_offset_deg, -1.5);
        assert_eq!(entry.distance_correction_mm, 12.0);
        assert_eq!(entry.clamp_intensity(0), 5);
        assert_eq!(entry.clamp_intensity(255), 200);
        assert_eq!(entry.clamp_intensity(100), 100);
    }

    #[test]
    fn test_missing_channel() {
        let json = vlp16_json(&vlp16_lasers(Some(7)).join(","));
        assert!(matches!(
            CalibrationTable::from_json(&json),
            Err(Error::Calibration(_))
        ));
    }

    #[test]
    fn test_duplicate_channel() {
        let mut lasers = vlp16_lasers(Some(7));
        lasers.push(r#"{ "channel": 6, "vertical_angle_deg": 7.0 }"#.to_string());
        let json = vlp16_json(&lasers.join(","));
        match CalibrationTable::from_json(&json) {
            Err(Error::Calibration(msg)) => assert!(msg.contains("duplicate")),
            other => panic!("expected duplicate error, got {:?}", other),
        }
    }

    #[test]
    fn test_out_of_range_channel() {
        let mut lasers = vlp16_lasers(Some(0));
        lasers.push(r#"{ "channel": 16, "vertical_angle_deg": 0.0 }"#.to_string());
        let json = vlp16_json(&lasers.join(","));
        assert!(matches!(
            CalibrationTable::from_json(&json),
            Err(Error::Calibration(_))
        ));
    }

    #[test]
    fn test_invalid_angle_and_intensity() {
        let mut lasers = vlp16_lasers(Some(0));
        lasers.push(r#"{ "channel": 0, "vertical_angle_deg": 95.0 }"#.to_string());
        assert!(CalibrationTable::from_json(&vlp16_json(&lasers.join(","))).is_err());

        let mut lasers = vlp16_lasers(Some(0));
        lasers.push(
            r#"{ "channel": 0, "vertical_angle_deg": -15.0, "min_intensity": 9, "max_intensity": 3 }"#
                .to_string(),
        );
        assert!(CalibrationTable::from_json(&vlp16_json(&lasers.join(","))).is_err());
    }

    #[test]
    fn test_parse_failure() {
        assert!(matches!(
            CalibrationTable::from_json("{ not json"),
            Err(Error::Calibration(_))
        ));
        assert!(matches!(
            CalibrationTable::from_json(r#"{ "model": "hdl64", "lasers": [] }"#),
            Err(Error::Calibration(_))
        ));
    }

    #[test]
    fn test_load_missing_file() {
        assert!(matches!(
            CalibrationTable::load("/nonexistent/calibration.json"),
            Err(Error::Calibration(_))
        ));
    }
}
