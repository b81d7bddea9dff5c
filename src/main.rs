// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use clap::Parser as _;
use edgefirst_terrain::{
    args::Args,
    packet_source::UdpSource,
    pipeline::{self, PipelineHandle},
    reference::GroundReference,
    terrain::TerrainReport,
    velodyne::PacketDecoder,
};
use kanal::Receiver;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Log every report handed to navigation.
fn navigation_thread(rx: Receiver<TerrainReport>) {
    while let Ok(report) = rx.recv() {
        match report.closest() {
            Some(closest) => info!(
                frame_id = report.frame_id,
                obstacles = report.obstacles.len(),
                "closest #{} {}",
                closest.id,
                closest.obstacle
            ),
            None => info!(frame_id = report.frame_id, "terrain clear"),
        }
    }
}

async fn run(handle: &PipelineHandle, bind_addr: &str) -> Result<(), Box<dyn std::error::Error>> {
    let mut source = UdpSource::bind(bind_addr).await?;
    info!("receiving data packets on {}", source.local_addr()?);

    tokio::select! {
        res = handle.pump(&mut source) => {
            res?;
        }
        res = tokio::signal::ctrl_c() => {
            res?;
            info!("interrupted, shutting down");
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(args.rust_log)
        .init();

    let config = args.config()?;
    let table = Arc::new(args.calibration()?);
    if args.calibration.is_some() && table.model() != args.model {
        warn!(
            "calibration is for {}, ignoring --model {}",
            table.model(),
            args.model
        );
    }
    info!(model = %table.model(), "calibration loaded");

    let reference = match &args.ground_capture {
        Some(path) => {
            let decoder = PacketDecoder::from_config(table.clone(), &config);
            let reference = GroundReference::load(path, &decoder)?;
            info!(
                path = %path.display(),
                coverage = reference.coverage(),
                "ground reference loaded"
            );
            Some(Arc::new(reference))
        }
        None => None,
    };

    let mut handle = pipeline::spawn_with_reference(table, &config, reference)?;

    let reports = handle.reports();
    let navigation = std::thread::Builder::new()
        .name("navigation".to_string())
        .spawn(move || navigation_thread(reports))?;

    let result = run(&handle, &args.bind_addr()).await;
    if let Err(e) = &result {
        error!("packet transport failed: {}", e);
    }

    handle.shutdown();
    handle.join();
    let _ = navigation.join();

    let stats = handle.stats();
    info!(
        packets = stats.packets_received,
        dropped = stats.packets_dropped,
        malformed = stats.malformed_packets,
        unknown_channels = stats.unknown_channels,
        frames = stats.frames_sealed,
        incomplete = stats.incomplete_frames,
        frames_dropped = stats.frames_dropped,
        analyzed = stats.frames_analyzed,
        "pipeline stopped"
    );

    result
}
