//! Spatial pair generation from prior image positions (e.g. GPS tags).

use std::sync::Arc;

use anyhow::{ensure, Result};
use kiddo::{KdTree, SquaredEuclidean};
use nalgebra::Vector3;
use rayon::prelude::*;
use tracing::{debug, info};

use crate::control::{StopToken, Timer};
use crate::database::{DatabaseTransaction, SharedDatabase};
use crate::geo::ecef_from_geodetic;
use crate::matching::{GpuKernelFactory, MatchDispatcher, MatcherCache, MatchingOptions};

#[derive(Debug, Clone)]
pub struct SpatialOptions {
    /// Number of nearest neighbors each image is paired with.
    pub max_num_neighbors: usize,

    /// Neighbors farther than this (in meters for GPS priors) are ignored.
    pub max_distance: f64,

    /// Interpret priors as (latitude, longitude, altitude) and convert to
    /// Cartesian coordinates before indexing.
    pub is_gps: bool,

    /// Ignore the third prior component (altitude is often missing or
    /// unreliable).
    pub ignore_z: bool,
}

impl Default for SpatialOptions {
    fn default() -> Self {
        Self {
            max_num_neighbors: 50,
            max_distance: 100.0,
            is_gps: true,
            ignore_z: true,
        }
    }
}

impl SpatialOptions {
    pub fn check(&self) -> Result<()> {
        ensure!(self.max_num_neighbors > 0, "max_num_neighbors must be positive");
        ensure!(self.max_distance > 0.0, "max_distance must be positive");
        Ok(())
    }
}

pub struct SpatialMatcher {
    options: SpatialOptions,
    database: SharedDatabase,
    cache: Arc<MatcherCache>,
    dispatcher: MatchDispatcher,
    num_search_threads: usize,
    stop: StopToken,
}

impl SpatialMatcher {
    pub fn new(
        options: SpatialOptions,
        match_options: MatchingOptions,
        database: SharedDatabase,
    ) -> Result<Self> {
        Self::with_gpu_backend(options, match_options, database, None)
    }

    pub fn with_gpu_backend(
        options: SpatialOptions,
        match_options: MatchingOptions,
        database: SharedDatabase,
        gpu_factory: Option<Arc<dyn GpuKernelFactory>>,
    ) -> Result<Self> {
        options.check()?;
        match_options.check()?;

        let num_search_threads = match_options.effective_num_threads();
        let cache = Arc::new(MatcherCache::new(
            5 * options.max_num_neighbors,
            Arc::clone(&database),
        ));
        let dispatcher = MatchDispatcher::new(
            match_options,
            Arc::clone(&database),
            Arc::clone(&cache),
            gpu_factory,
        )?;

        Ok(Self {
            options,
            database,
            cache,
            dispatcher,
            num_search_threads,
            stop: StopToken::new(),
        })
    }

    pub fn stop_token(&self) -> StopToken {
        self.stop.clone()
    }

    pub fn run(&mut self) -> Result<()> {
        info!("Spatial feature matching");
        let total = Timer::start();

        if !self.dispatcher.setup()? {
            return Ok(());
        }
        self.cache.setup()?;

        let image_ids = self.cache.get_image_ids();

        let timer = Timer::start();
        info!("Indexing images");

        // Collect the prior positions, remembering which image each kept
        // location belongs to.
        let mut location_idxs = Vec::with_capacity(image_ids.len());
        let mut locations: Vec<[f32; 3]> = Vec::with_capacity(image_ids.len());
        for (idx, &image_id) in image_ids.iter().enumerate() {
            let image = self.cache.get_image(image_id);
            if !image.has_location_prior(self.options.ignore_z) {
                continue;
            }

            let prior = image.tvec_prior;
            let position = if self.options.is_gps {
                let altitude = if self.options.ignore_z { 0.0 } else { prior[2] };
                ecef_from_geodetic(prior[0], prior[1], altitude)
            } else {
                let z = if self.options.ignore_z { 0.0 } else { prior[2] };
                Vector3::new(prior[0], prior[1], z)
            };

            location_idxs.push(idx);
            locations.push([position[0] as f32, position[1] as f32, position[2] as f32]);
        }

        if locations.is_empty() {
            info!("No images with location data");
            total.log_total("Spatial feature matching");
            return Ok(());
        }

        let mut index: KdTree<f32, 3> = KdTree::with_capacity(locations.len());
        for (i, location) in locations.iter().enumerate() {
            index.add(location, i as u64);
        }
        debug!("Built search index in {:.3}s", timer.elapsed_seconds());

        let timer = Timer::start();
        info!("Searching for nearest neighbors");

        let knn = self.options.max_num_neighbors.min(locations.len());
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.num_search_threads)
            .build()?;
        let neighbors: Vec<_> = pool.install(|| {
            locations
                .par_iter()
                .map(|location| index.nearest_n::<SquaredEuclidean>(location, knn))
                .collect()
        });
        debug!("Neighbor search took {:.3}s", timer.elapsed_seconds());

        let max_distance_sq = (self.options.max_distance * self.options.max_distance) as f32;

        let mut image_pairs = Vec::with_capacity(knn);
        for (i, nns) in neighbors.iter().enumerate() {
            if self.stop.is_stopped() {
                total.log_total("Spatial feature matching");
                return Ok(());
            }

            let timer = Timer::start();
            info!("Matching image [{}/{}]", i + 1, neighbors.len());

            image_pairs.clear();
            for nn in nns {
                // The query point itself shows up among its neighbors.
                if nn.item as usize == i {
                    continue;
                }
                // Neighbors are sorted by distance, everything after the
                // first miss is farther still.
                if nn.distance > max_distance_sq {
                    break;
                }

                let image_id = image_ids[location_idxs[i]];
                let nn_image_id = image_ids[location_idxs[nn.item as usize]];
                image_pairs.push((image_id, nn_image_id));
            }

            let transaction = DatabaseTransaction::begin(&self.database)?;
            self.dispatcher.match_pairs(&image_pairs)?;
            transaction.commit()?;

            debug!("Image matched in {:.3}s", timer.elapsed_seconds());
        }

        total.log_total("Spatial feature matching");
        Ok(())
    }
}
