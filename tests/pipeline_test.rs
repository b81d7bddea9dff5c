// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Pipeline tests driven by synthesized VLP-16 packets of flat and tilted
//! ground.

use edgefirst_terrain::{
    CalibrationTable, Config, DataPacket, FrameAssembler, GroundReference, PacketDecoder,
    RawPacket, ReplaySource, SensorModel, Terrain, pipeline,
    velodyne::{BLOCKS_PER_PACKET, RETURNS_PER_BLOCK},
};
use std::sync::Arc;

/// Sensor height above flat ground in meters.
const HEIGHT: f64 = 1.0;

/// Rise of the tilted ground per meter forward.
const SLOPE: f64 = 0.05;

/// Channel whose laser points 1.5° above its calibrated -11°.
const BIASED_CHANNEL: u8 = 4;

/// Azimuth step between blocks in hundredths of a degree.
const BLOCK_STEP: u32 = 40;

/// Packets in one full rotation.
const PACKETS_PER_ROTATION: usize = 36_000 / (BLOCK_STEP as usize * BLOCKS_PER_PACKET);

/// Packet `index` of a sensor looking at flat ground `HEIGHT` below it.
/// Upward-looking lasers see nothing.
fn ground_packet(table: &CalibrationTable, index: usize) -> DataPacket {
    let mut packet = DataPacket::new(SensorModel::Vlp16, (index * 1_327) as u32);
    for (b, firing) in packet.firings.iter_mut().enumerate() {
        let step = (index * BLOCKS_PER_PACKET + b) as u32 * BLOCK_STEP;
        firing.azimuth_raw = (step % 36_000) as u16;
        for ret in firing.returns.iter_mut() {
            let entry = table.get(ret.channel_id).unwrap();
            if entry.vertical_angle_deg < 0.0 {
                let distance = HEIGHT / entry.vertical_angle_deg.to_radians().sin().abs();
                ret.distance_raw = (distance / 0.002).round() as u16;
                ret.intensity = 50;
            }
        }
    }
    packet
}

fn ground_packets(table: &CalibrationTable, count: usize) -> Vec<DataPacket> {
    (0..count).map(|i| ground_packet(table, i)).collect()
}

/// Packet `index` of a sensor over ground rising `SLOPE` per meter
/// forward, with one laser off its calibrated elevation.
fn tilted_packet(table: &CalibrationTable, index: usize) -> DataPacket {
    let mut packet = DataPacket::new(SensorModel::Vlp16, (index * 1_327) as u32);
    for (b, firing) in packet.firings.iter_mut().enumerate() {
        let step = (index * BLOCKS_PER_PACKET + b) as u32 * BLOCK_STEP;
        firing.azimuth_raw = (step % 36_000) as u16;
        for (i, ret) in firing.returns.iter_mut().enumerate() {
            let mut elevation = table.get(ret.channel_id).unwrap().vertical_angle_deg;
            if ret.channel_id == BIASED_CHANNEL {
                elevation += 1.5;
            }
            let azimuth = (step as f64 + BLOCK_STEP as f64 * i as f64 / 32.0) / 100.0;
            let (sin_el, cos_el) = elevation.to_radians().sin_cos();

            // Ray meets z = -HEIGHT + SLOPE * y.
            let denom = sin_el - SLOPE * cos_el * azimuth.to_radians().cos();
            if denom > -1e-3 {
                continue;
            }
            let distance = -HEIGHT / denom;
            if distance > 100.0 {
                continue;
            }
            ret.distance_raw = (distance / 0.002).round() as u16;
            ret.intensity = 50;
        }
    }
    packet
}

fn tilted_capture(table: &CalibrationTable, count: usize) -> Vec<u8> {
    (0..count).flat_map(|i| tilted_packet(table, i).encode()).collect()
}

#[test]
fn test_rotation_layout() {
    assert_eq!(PACKETS_PER_ROTATION, 75);
    assert_eq!(RETURNS_PER_BLOCK, 32);
}

#[test]
fn test_decode_assemble_analyze() {
    let table = Arc::new(CalibrationTable::factory(SensorModel::Vlp16));
    let config = Config::default();
    let decoder = PacketDecoder::new(table.clone());
    let mut assembler =
        FrameAssembler::new(config.wraparound_hysteresis_deg, config.min_frame_points);
    let mut terrain = Terrain::new(&config).unwrap();

    let mut frames = Vec::new();
    for packet in ground_packets(&table, 2 * PACKETS_PER_ROTATION + 1) {
        let raw = RawPacket::new(packet.encode().to_vec(), 0);
        let decoded = decoder.decode(&raw).unwrap();
        assert_eq!(decoded.unknown_channels, 0);
        // 8 downward lasers, two sequences per block.
        assert_eq!(decoded.points.len(), BLOCKS_PER_PACKET * 16);
        for p in &decoded.points {
            assert!((p.z as f64 + HEIGHT).abs() < 1e-3, "z = {}", p.z);
        }
        if let Some(frame) = assembler.ingest(decoded.points).unwrap() {
            frames.push(frame);
        }
    }

    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0].frame_id, 0);
    assert_eq!(frames[0].len(), PACKETS_PER_ROTATION * BLOCKS_PER_PACKET * 16);
    assert!(frames[0].end_ns >= frames[0].start_ns);

    for frame in &frames {
        let report = terrain.analyze(frame);
        assert!(report.obstacles.is_empty());
    }
}

#[tokio::test]
async fn test_pipeline_flat_ground() {
    let table = Arc::new(CalibrationTable::factory(SensorModel::Vlp16));
    let config = Config {
        queue_depth: 1024,
        ..Default::default()
    };
    let mut handle = pipeline::spawn(table.clone(), &config).unwrap();

    let mut packets: Vec<Vec<u8>> = ground_packets(&table, 3 * PACKETS_PER_ROTATION + 10)
        .iter()
        .map(|p| p.encode().to_vec())
        .collect();
    packets.insert(40, vec![0u8; 512]);
    let total = packets.len() as u64;

    let mut source = ReplaySource::new(packets);
    let pumped = handle.pump(&mut source).await.unwrap();
    assert_eq!(pumped, total);

    let stats = handle.finish();
    let mut reports = Vec::new();
    while let Some(report) = handle.recv() {
        reports.push(report);
    }

    assert_eq!(stats.packets_received, total);
    assert_eq!(stats.packets_dropped, 0);
    assert_eq!(stats.malformed_packets, 1);
    assert_eq!(stats.unknown_channels, 0);
    assert_eq!(stats.frames_sealed, 3);
    assert_eq!(stats.incomplete_frames, 0);
    assert_eq!(stats.frames_analyzed, reports.len() as u64 + stats.reports_dropped);
    assert_eq!(
        reports.len() as u64 + stats.frames_dropped + stats.reports_dropped,
        stats.frames_sealed
    );

    assert!(!reports.is_empty());
    assert_eq!(reports.last().map(|r| r.frame_id), Some(2));
    assert!(reports.windows(2).all(|w| w[0].frame_id < w[1].frame_id));
    assert!(reports.iter().all(|r| r.obstacles.is_empty()));
    // Replay stamps advance at the packet rate.
    assert!(reports.windows(2).all(|w| w[1].timestamp_ns > w[0].timestamp_ns));
}

#[tokio::test]
async fn test_pipeline_drops_oldest_packets() {
    let table = Arc::new(CalibrationTable::factory(SensorModel::Vlp16));
    let config = Config {
        queue_depth: 1,
        ..Default::default()
    };
    let mut handle = pipeline::spawn(table.clone(), &config).unwrap();

    let packets = ground_packets(&table, 2 * PACKETS_PER_ROTATION);
    let mut source = ReplaySource::from_data_packets(&packets);
    handle.pump(&mut source).await.unwrap();

    let stats = handle.finish();
    assert_eq!(stats.packets_received, packets.len() as u64);
    assert!(stats.packets_dropped < stats.packets_received);
    assert_eq!(stats.malformed_packets, 0);
}

#[test]
fn test_pipeline_drop_shuts_down() {
    let table = Arc::new(CalibrationTable::factory(SensorModel::Vlp16));
    let handle = pipeline::spawn(table.clone(), &Config::default()).unwrap();
    let reports = handle.reports();
    for packet in ground_packets(&table, 10) {
        handle
            .push(RawPacket::new(packet.encode().to_vec(), 0))
            .unwrap();
    }
    drop(handle);
    assert!(reports.recv().is_err());
}

#[test]
fn test_ground_reference_levels_tilted_ground() {
    let table = Arc::new(CalibrationTable::factory(SensorModel::Vlp16));
    let config = Config {
        mount_height_m: HEIGHT as f32,
        ..Default::default()
    };
    let decoder = PacketDecoder::from_config(table.clone(), &config);

    let capture = ReplaySource::from_capture(&tilted_capture(&table, PACKETS_PER_ROTATION)).unwrap();
    let reference = GroundReference::from_packets(&decoder, capture).unwrap();
    assert_eq!(reference.channels(), 16);
    assert!(reference.coverage() > 0.25);
    let leveled = decoder.clone().with_reference(Arc::new(reference));

    let mut assembler =
        FrameAssembler::new(config.wraparound_hysteresis_deg, config.min_frame_points);
    let mut terrain = Terrain::new(&config).unwrap();
    let mut frames = Vec::new();
    let mut worst_unleveled = 0.0f32;

    for packet in ReplaySource::from_capture(&tilted_capture(&table, 2 * PACKETS_PER_ROTATION + 1))
        .unwrap()
    {
        for p in decoder.decode(&packet).unwrap().points {
            if p.x.hypot(p.y) < config.grid_extent_m {
                worst_unleveled = worst_unleveled.max(p.z.abs());
            }
        }

        let decoded = leveled.decode(&packet).unwrap();
        for p in &decoded.points {
            if p.x.hypot(p.y) < config.grid_extent_m {
                assert!(p.z.abs() < 0.01, "channel {} z = {}", p.channel, p.z);
            }
        }
        if let Some(frame) = assembler.ingest(decoded.points).unwrap() {
            frames.push(frame);
        }
    }

    assert!(worst_unleveled > 0.1, "tilt and bias not visible: {}", worst_unleveled);
    assert_eq!(frames.len(), 2);
    for frame in &frames {
        assert!(terrain.analyze(frame).obstacles.is_empty());
    }
}

#[tokio::test]
async fn test_pipeline_with_ground_reference() {
    let table = Arc::new(CalibrationTable::factory(SensorModel::Vlp16));
    let config = Config {
        queue_depth: 1024,
        mount_height_m: HEIGHT as f32,
        ..Default::default()
    };
    let capture = tilted_capture(&table, PACKETS_PER_ROTATION);
    let reference = GroundReference::from_packets(
        &PacketDecoder::from_config(table.clone(), &config),
        ReplaySource::from_capture(&capture).unwrap(),
    )
    .unwrap();

    let mut handle =
        pipeline::spawn_with_reference(table.clone(), &config, Some(Arc::new(reference))).unwrap();
    let mut source = ReplaySource::from_capture(&tilted_capture(&table, 3 * PACKETS_PER_ROTATION + 1))
        .unwrap()
        .with_timing(1_000_000, 1_327_104);
    handle.pump(&mut source).await.unwrap();

    let stats = handle.finish();
    let mut reports = Vec::new();
    while let Some(report) = handle.recv() {
        reports.push(report);
    }

    assert_eq!(stats.malformed_packets, 0);
    assert_eq!(stats.frames_sealed, 3);
    assert!(!reports.is_empty());
    assert!(reports.iter().all(|r| r.obstacles.is_empty()));
    assert!(reports.iter().all(|r| r.timestamp_ns > 1_000_000));
}

#[test]
fn test_ground_capture_file() {
    let table = Arc::new(CalibrationTable::factory(SensorModel::Vlp16));
    let decoder = PacketDecoder::new(table.clone());
    let path = std::env::temp_dir().join(format!("terrain-ground-{}.bin", std::process::id()));
    std::fs::write(&path, tilted_capture(&table, 10)).unwrap();

    let reference = GroundReference::load(&path, &decoder);
    std::fs::remove_file(&path).unwrap();
    let reference = reference.unwrap();
    assert!(reference.coverage() > 0.0);

    let truncated = std::env::temp_dir().join(format!("terrain-ground-cut-{}.bin", std::process::id()));
    std::fs::write(&truncated, &tilted_capture(&table, 2)[..1500]).unwrap();
    let result = GroundReference::load(&truncated, &decoder);
    std::fs::remove_file(&truncated).unwrap();
    assert!(matches!(result, Err(edgefirst_terrain::Error::MalformedPacket(_))));
}

#[test]
fn test_pipeline_counts_incomplete_frames() {
    let table = Arc::new(CalibrationTable::factory(SensorModel::Vlp16));
    let config = Config {
        queue_depth: 1024,
        min_frame_points: 1_000_000,
        ..Default::default()
    };
    let mut handle = pipeline::spawn(table.clone(), &config).unwrap();
    for raw in ReplaySource::from_data_packets(&ground_packets(&table, 3 * PACKETS_PER_ROTATION + 1)) {
        handle.push(raw).unwrap();
    }

    let stats = handle.finish();
    assert_eq!(stats.incomplete_frames, 3);
    assert_eq!(stats.frames_sealed, 0);
    assert!(handle.recv().is_none());
}
