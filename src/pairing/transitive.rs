//! Transitive pair generation: expand the existing match graph by two-hop
//! paths, so images sharing a mutual neighbor get matched directly.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{ensure, Result};
use tracing::{debug, info};

use crate::control::{StopToken, Timer};
use crate::database::{
    image_pair_from_pair_id, pair_id_from_image_pair, Database, DatabaseTransaction, ImageId,
    PairId, SharedDatabase,
};
use crate::matching::{GpuKernelFactory, MatchDispatcher, MatcherCache, MatchingOptions};

#[derive(Debug, Clone)]
pub struct TransitiveOptions {
    /// Candidate pairs are flushed to the dispatcher in batches of this
    /// size, bounding memory and transaction size.
    pub batch_size: usize,

    /// Number of closure rounds; each round sees the pairs added by the
    /// previous one.
    pub num_iterations: usize,
}

impl Default for TransitiveOptions {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            num_iterations: 3,
        }
    }
}

impl TransitiveOptions {
    pub fn check(&self) -> Result<()> {
        ensure!(self.batch_size > 0, "batch_size must be positive");
        ensure!(self.num_iterations > 0, "num_iterations must be positive");
        Ok(())
    }
}

pub struct TransitiveMatcher {
    options: TransitiveOptions,
    database: SharedDatabase,
    cache: Arc<MatcherCache>,
    dispatcher: MatchDispatcher,
    stop: StopToken,
}

impl TransitiveMatcher {
    pub fn new(
        options: TransitiveOptions,
        match_options: MatchingOptions,
        database: SharedDatabase,
    ) -> Result<Self> {
        Self::with_gpu_backend(options, match_options, database, None)
    }

    pub fn with_gpu_backend(
        options: TransitiveOptions,
        match_options: MatchingOptions,
        database: SharedDatabase,
        gpu_factory: Option<Arc<dyn GpuKernelFactory>>,
    ) -> Result<Self> {
        options.check()?;
        match_options.check()?;

        let cache = Arc::new(MatcherCache::new(options.batch_size, Arc::clone(&database)));
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
            stop: StopToken::new(),
        })
    }

    pub fn stop_token(&self) -> StopToken {
        self.stop.clone()
    }

    fn match_batch(&mut self, image_pairs: &[(ImageId, ImageId)]) -> Result<()> {
        let transaction = DatabaseTransaction::begin(&self.database)?;
        self.dispatcher.match_pairs(image_pairs)?;
        transaction.commit()?;
        Ok(())
    }

    pub fn run(&mut self) -> Result<()> {
        info!("Transitive feature matching");
        let total = Timer::start();

        if !self.dispatcher.setup()? {
            return Ok(());
        }
        self.cache.setup()?;

        let batch_size = self.options.batch_size;

        for iteration in 0..self.options.num_iterations {
            if self.stop.is_stopped() {
                total.log_total("Transitive feature matching");
                return Ok(());
            }

            let timer = Timer::start();
            info!(
                "Iteration [{}/{}]",
                iteration + 1,
                self.options.num_iterations
            );

            // Adjacency of the current match graph.
            let matched: Vec<(PairId, usize)> = self.database.lock().read_num_matches()?;
            let mut adjacency: HashMap<ImageId, Vec<ImageId>> = HashMap::new();
            for (pair_id, _) in matched {
                let (image_id1, image_id2) = image_pair_from_pair_id(pair_id);
                adjacency.entry(image_id1).or_default().push(image_id2);
                adjacency.entry(image_id2).or_default().push(image_id1);
            }

            let mut num_batches = 0usize;
            let mut image_pairs = Vec::with_capacity(batch_size);
            let mut pair_ids: HashSet<PairId> = HashSet::new();
            for (&image_id1, neighbors) in &adjacency {
                for image_id2 in neighbors {
                    let Some(second_hops) = adjacency.get(image_id2) else {
                        continue;
                    };
                    for &image_id3 in second_hops {
                        // Two-hop candidates include self pairs; those are
                        // filtered by the dispatcher.
                        if !pair_ids.insert(pair_id_from_image_pair(image_id1, image_id3)) {
                            continue;
                        }
                        image_pairs.push((image_id1, image_id3));
                        if image_pairs.len() >= batch_size {
                            num_batches += 1;
                            debug!("Batch {num_batches}");
                            self.match_batch(&image_pairs)?;
                            image_pairs.clear();

                            if self.stop.is_stopped() {
                                total.log_total("Transitive feature matching");
                                return Ok(());
                            }
                        }
                    }
                }
            }

            num_batches += 1;
            debug!("Batch {num_batches}");
            self.match_batch(&image_pairs)?;

            debug!("Iteration finished in {:.3}s", timer.elapsed_seconds());
        }

        total.log_total("Transitive feature matching");
        Ok(())
    }
}
