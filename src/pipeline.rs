// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Threaded decode and analysis pipeline.
//!
//! ```text
//! ┌────────────┐  packets   ┌──────────────────┐  frame   ┌──────────────┐  reports
//! │ transport  │ ─────────► │ decode + assemble│ ───────► │   analysis   │ ────────► navigation
//! │ (pump/push)│ drop-oldest│     thread       │ latest   │    thread    │ drop-oldest
//! └────────────┘            └──────────────────┘          └──────────────┘
//! ```
//!
//! Every queue is a bounded `kanal` channel. When a queue is full the oldest
//! entry is evicted so that a slow consumer never stalls the transport; the
//! evictions are counted in [`PipelineStats`]. The frame queue holds a single
//! frame, so analysis always runs on the newest complete rotation while the
//! next one is being assembled.

use crate::{
    calibration::CalibrationTable,
    config::Config,
    frame::{Frame, FrameAssembler},
    lidar::{Error, RawPacket},
    packet_source::PacketSource,
    reference::GroundReference,
    terrain::{Terrain, TerrainReport},
    velodyne::PacketDecoder,
};
use kanal::{Receiver, Sender};
use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    thread::JoinHandle,
};
use tracing::{debug, info, info_span, trace, warn};

/// Capacity of the report queue towards navigation
const REPORT_QUEUE_DEPTH: usize = 16;

/// Live pipeline counters, updated by the workers.
#[derive(Debug, Default)]
pub struct PipelineStats {
    pub packets_received: AtomicU64,
    pub packets_dropped: AtomicU64,
    pub malformed_packets: AtomicU64,
    pub unknown_channels: AtomicU64,
    pub frames_sealed: AtomicU64,
    pub incomplete_frames: AtomicU64,
    pub frames_dropped: AtomicU64,
    pub frames_analyzed: AtomicU64,
    pub reports_dropped: AtomicU64,
}

impl PipelineStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            packets_received: self.packets_received.load(Ordering::Relaxed),
            packets_dropped: self.packets_dropped.load(Ordering::Relaxed),
            malformed_packets: self.malformed_packets.load(Ordering::Relaxed),
            unknown_channels: self.unknown_channels.load(Ordering::Relaxed),
            frames_sealed: self.frames_sealed.load(Ordering::Relaxed),
            incomplete_frames: self.incomplete_frames.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            frames_analyzed: self.frames_analyzed.load(Ordering::Relaxed),
            reports_dropped: self.reports_dropped.load(Ordering::Relaxed),
        }
    }

    #[inline]
    fn add(counter: &AtomicU64, n: u64) {
        if n > 0 {
            counter.fetch_add(n, Ordering::Relaxed);
        }
    }
}

/// Point-in-time copy of [`PipelineStats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub packets_received: u64,
    pub packets_dropped: u64,
    pub malformed_packets: u64,
    pub unknown_channels: u64,
    pub frames_sealed: u64,
    pub incomplete_frames: u64,
    pub frames_dropped: u64,
    pub frames_analyzed: u64,
    pub reports_dropped: u64,
}

/// Bounded queue that evicts its oldest entry instead of blocking.
///
/// Holds a receiver clone so the producer can make room itself.
struct DropOldest<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
}

impl<T> DropOldest<T> {
    fn new(capacity: usize) -> (Self, Receiver<T>) {
        let (tx, rx) = kanal::bounded(capacity);
        (
            Self {
                tx,
                rx: rx.clone(),
            },
            rx,
        )
    }

    /// Enqueue `item`, returning how many queued entries were evicted.
    fn push(&self, item: T) -> Result<u64, Error> {
        let mut item = Some(item);
        let mut evicted = 0;
        loop {
            match self.tx.try_send_option(&mut item) {
                Ok(true) => return Ok(evicted),
                Ok(false) => {
                    if let Ok(Some(_)) = self.rx.try_recv() {
                        evicted += 1;
                    }
                }
                Err(_) => return Err(Error::Closed),
            }
        }
    }

    fn close(&self) {
        let _ = self.tx.close();
    }
}

/// Handle to a running pipeline.
///
/// Dropping the handle shuts the pipeline down and waits for the workers.
pub struct PipelineHandle {
    packets: Option<DropOldest<RawPacket>>,
    frames: Receiver<Frame>,
    reports: Receiver<TerrainReport>,
    stats: Arc<PipelineStats>,
    workers: Vec<JoinHandle<()>>,
}

/// Start the decode and analysis workers.
pub fn spawn(table: Arc<CalibrationTable>, config: &Config) -> Result<PipelineHandle, Error> {
    spawn_with_reference(table, config, None)
}

/// Start the workers, leveling every return against `reference` when given.
pub fn spawn_with_reference(
    table: Arc<CalibrationTable>,
    config: &Config,
    reference: Option<Arc<GroundReference>>,
) -> Result<PipelineHandle, Error> {
    config.validate()?;
    let terrain = Terrain::new(config)?;
    let mut decoder = PacketDecoder::from_config(table, config);
    if let Some(reference) = reference {
        if reference.channels() < decoder.table().len() {
            warn!(
                reference = reference.channels(),
                calibration = decoder.table().len(),
                "ground reference covers fewer channels than the calibration"
            );
        }
        decoder = decoder.with_reference(reference);
    }
    let assembler =
        FrameAssembler::new(config.wraparound_hysteresis_deg, config.min_frame_points);

    let leveled = decoder.reference().is_some();

    let stats = Arc::new(PipelineStats::default());
    let (packets, packets_rx) = DropOldest::new(config.queue_depth);
    let (frames, frames_rx) = DropOldest::new(1);
    let (reports, reports_rx) = DropOldest::new(REPORT_QUEUE_DEPTH);
    let frames_close = frames_rx.clone();

    let decode_stats = stats.clone();
    let decode = std::thread::Builder::new()
        .name("decode".to_string())
        .spawn(move || decode_thread(packets_rx, frames, decoder, assembler, decode_stats))?;

    let analysis_stats = stats.clone();
    let analysis = std::thread::Builder::new()
        .name("analysis".to_string())
        .spawn(move || analysis_thread(frames_rx, reports, terrain, analysis_stats))?;

    info!(
        queue_depth = config.queue_depth,
        ground_reference = leveled,
        cell_size_m = config.cell_size_m,
        grid_extent_m = config.grid_extent_m,
        "pipeline started"
    );

    Ok(PipelineHandle {
        packets: Some(packets),
        frames: frames_close,
        reports: reports_rx,
        stats,
        workers: vec![decode, analysis],
    })
}

fn decode_thread(
    rx: Receiver<RawPacket>,
    frames: DropOldest<Frame>,
    decoder: PacketDecoder,
    mut assembler: FrameAssembler,
    stats: Arc<PipelineStats>,
) {
    let mut superseded = 0;
    let mut incomplete = 0;

    while let Ok(packet) = rx.recv() {
        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(e) => {
                debug!("dropping packet: {}", e);
                PipelineStats::add(&stats.malformed_packets, 1);
                continue;
            }
        };
        PipelineStats::add(&stats.unknown_channels, decoded.unknown_channels as u64);

        let sealed = assembler.ingest(decoded.points);

        // Rotations replaced within one batch were sealed but never queued.
        let replaced = assembler.superseded_frames() - superseded;
        superseded = assembler.superseded_frames();
        PipelineStats::add(&stats.frames_sealed, replaced);
        PipelineStats::add(&stats.frames_dropped, replaced);
        PipelineStats::add(&stats.incomplete_frames, assembler.incomplete_frames() - incomplete);
        incomplete = assembler.incomplete_frames();

        match sealed {
            Ok(Some(frame)) => {
                trace!(frame_id = frame.frame_id, points = frame.len(), "frame sealed");
                PipelineStats::add(&stats.frames_sealed, 1);
                match frames.push(frame) {
                    Ok(evicted) => PipelineStats::add(&stats.frames_dropped, evicted),
                    Err(_) => break,
                }
            }
            Ok(None) | Err(Error::IncompleteFrame { .. }) => {}
            Err(e) => warn!("frame assembly error: {}", e),
        }
    }

    assembler.flush();
    debug!("decode thread exiting");
}

fn analysis_thread(
    rx: Receiver<Frame>,
    reports: DropOldest<TerrainReport>,
    mut terrain: Terrain,
    stats: Arc<PipelineStats>,
) {
    while let Ok(frame) = rx.recv() {
        let report = info_span!("analysis", frame_id = frame.frame_id)
            .in_scope(|| terrain.analyze(&frame));
        PipelineStats::add(&stats.frames_analyzed, 1);

        if let Some(closest) = report.closest() {
            trace!(frame_id = report.frame_id, closest = %closest.obstacle, "closest obstacle");
        }

        match reports.push(report) {
            Ok(evicted) => PipelineStats::add(&stats.reports_dropped, evicted),
            Err(_) => break,
        }
    }

    debug!("analysis thread exiting");
}

impl PipelineHandle {
    /// Queue a raw packet for decoding, evicting the oldest queued packet
    /// when the queue is full.
    pub fn push(&self, packet: RawPacket) -> Result<(), Error> {
        let packets = self.packets.as_ref().ok_or(Error::Closed)?;
        let evicted = packets.push(packet)?;
        PipelineStats::add(&self.stats.packets_received, 1);
        PipelineStats::add(&self.stats.packets_dropped, evicted);
        Ok(())
    }

    /// Feed packets from `source` until it is exhausted or the pipeline is
    /// closed. Returns the number of packets queued.
    pub async fn pump<S: PacketSource>(&self, source: &mut S) -> Result<u64, Error> {
        let mut count = 0;

        while source.has_more() {
            let packet = source.recv().await?;
            match self.push(packet) {
                Ok(()) => count += 1,
                Err(Error::Closed) => break,
                Err(e) => return Err(e),
            }
        }

        Ok(count)
    }

    /// Block until the next report, `None` once the pipeline has stopped
    /// and every queued report was received.
    pub fn recv(&self) -> Option<TerrainReport> {
        self.reports.recv().ok()
    }

    /// Next report if one is queued.
    pub fn try_recv(&self) -> Option<TerrainReport> {
        self.reports.try_recv().ok().flatten()
    }

    /// Receiver for handing reports to a navigation thread.
    pub fn reports(&self) -> Receiver<TerrainReport> {
        self.reports.clone()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Stop accepting packets and let the workers drain every queued packet
    /// and frame. Reports stay available through [`Self::recv`].
    pub fn finish(&mut self) -> StatsSnapshot {
        self.packets = None;
        self.join();
        self.stats()
    }

    /// Close every queue. Queued packets, frames and reports are discarded
    /// and the in-progress frame is dropped.
    pub fn shutdown(&self) {
        if let Some(packets) = &self.packets {
            packets.close();
        }
        let _ = self.frames.close();
        let _ = self.reports.close();
    }

    /// Wait for the workers to exit.
    pub fn join(&mut self) {
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                warn!("pipeline worker panicked");
            }
        }
    }
}

impl Drop for PipelineHandle {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            self.shutdown();
            self.join();
        }
    }
}
