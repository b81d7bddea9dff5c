// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Terrain analysis of complete frames.
//!
//! [`Terrain`] builds the elevation grid of each frame, runs the obstacle
//! analyzer and associates the result with the previous frame so that an
//! obstacle seen in consecutive frames keeps its id.

use crate::{
    config::Config,
    frame::Frame,
    grid::{ElevationGrid, GridBuilder},
    lidar::Error,
    obstacle::{Obstacle, ObstacleFinder, ObstacleKind, TerrainAnalyzer},
};
use tracing::{debug, instrument};

/// An obstacle with an id that is stable across associated frames.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TrackedObstacle {
    pub id: u64,
    pub obstacle: Obstacle,
}

impl TrackedObstacle {
    pub fn kind(&self) -> ObstacleKind {
        self.obstacle.kind()
    }

    pub fn centroid(&self) -> (f32, f32) {
        self.obstacle.centroid()
    }

    pub fn bounding_radius(&self) -> f32 {
        self.obstacle.bounding_radius()
    }

    pub fn confidence(&self) -> f32 {
        self.obstacle.confidence()
    }
}

/// Obstacles found in one frame, handed to navigation.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TerrainReport {
    pub frame_id: u32,
    /// End timestamp of the analyzed frame in nanoseconds
    pub timestamp_ns: u64,
    pub obstacles: Vec<TrackedObstacle>,
}

impl TerrainReport {
    /// Obstacle whose centroid is closest to the sensor.
    pub fn closest(&self) -> Option<&TrackedObstacle> {
        self.obstacles
            .iter()
            .min_by(|a, b| a.obstacle.range().total_cmp(&b.obstacle.range()))
    }
}

/// Grid builder, analyzer and frame-to-frame association.
pub struct Terrain<A = ObstacleFinder> {
    builder: GridBuilder,
    analyzer: A,
    association_distance: f32,
    previous: Vec<TrackedObstacle>,
    next_id: u64,
}

impl Terrain<ObstacleFinder> {
    /// Validate `config` and build the default analyzer from it.
    pub fn new(config: &Config) -> Result<Self, Error> {
        config.validate()?;
        Self::with_analyzer(config, ObstacleFinder::from_config(config)?)
    }
}

impl<A: TerrainAnalyzer> Terrain<A> {
    pub fn with_analyzer(config: &Config, analyzer: A) -> Result<Self, Error> {
        Ok(Self {
            builder: GridBuilder::from_config(config)?,
            analyzer,
            association_distance: config.association_distance_m,
            previous: Vec::new(),
            next_id: 0,
        })
    }

    /// Elevation grid of a frame without running the analyzer.
    pub fn grid(&mut self, frame: &Frame) -> ElevationGrid {
        self.builder.build(frame)
    }

    /// Analyze one frame.
    #[instrument(skip_all, fields(frame_id = frame.frame_id))]
    pub fn analyze(&mut self, frame: &Frame) -> TerrainReport {
        let grid = self.builder.build(frame);
        let obstacles = self.analyzer.find(&grid);
        let obstacles = self.associate(obstacles);
        debug!(
            observed_cells = grid.observed_cells(),
            obstacles = obstacles.len(),
            "terrain analyzed"
        );

        TerrainReport {
            frame_id: frame.frame_id,
            timestamp_ns: frame.end_ns,
            obstacles,
        }
    }

    /// Forget the previous frame's obstacles.
    pub fn reset(&mut self) {
        self.previous.clear();
    }

    /// Greedy nearest-centroid matching against the previous frame.
    ///
    /// Candidate pairs share a kind and lie within the association distance,
    /// or the new centroid falls inside the old footprint. Pairs are taken in
    /// ascending distance and each side is matched at most once.
    fn associate(&mut self, obstacles: Vec<Obstacle>) -> Vec<TrackedObstacle> {
        let mut ids: Vec<Option<u64>> = vec![None; obstacles.len()];

        if self.association_distance > 0.0 {
            let mut pairs = Vec::new();
            for (i, current) in obstacles.iter().enumerate() {
                let (cx, cy) = current.centroid();
                for (j, prev) in self.previous.iter().enumerate() {
                    if prev.kind() != current.kind() {
                        continue;
                    }
                    let (px, py) = prev.centroid();
                    let distance = (cx - px).hypot(cy - py);
                    if distance <= self.association_distance || prev.obstacle.contains(cx, cy) {
                        pairs.push((distance, i, j));
                    }
                }
            }
            pairs.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)));

            let mut taken = vec![false; self.previous.len()];
            for (_, i, j) in pairs {
                if ids[i].is_none() && !taken[j] {
                    ids[i] = Some(self.previous[j].id);
                    taken[j] = true;
                }
            }
        }

        let tracked: Vec<TrackedObstacle> = obstacles
            .into_iter()
            .zip(ids)
            .map(|(obstacle, id)| {
                let id = id.unwrap_or_else(|| {
                    let id = self.next_id;
                    self.next_id += 1;
                    id
                });
                TrackedObstacle { id, obstacle }
            })
            .collect();

        self.previous.clone_from(&tracked);
        tracked
    }
}
