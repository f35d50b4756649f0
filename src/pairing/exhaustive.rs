//! Exhaustive pair generation: every image against every other, enumerated
//! in cache-friendly blocks.

use std::sync::Arc;

use anyhow::{ensure, Result};
use tracing::{debug, info};

use crate::control::{StopToken, Timer};
use crate::database::{DatabaseTransaction, SharedDatabase};
use crate::matching::{GpuKernelFactory, MatchDispatcher, MatcherCache, MatchingOptions};

#[derive(Debug, Clone)]
pub struct ExhaustiveOptions {
    /// Images per block. Pairs are produced block against block so the
    /// descriptor cache keeps both blocks resident.
    pub block_size: usize,
}

impl Default for ExhaustiveOptions {
    fn default() -> Self {
        Self { block_size: 50 }
    }
}

impl ExhaustiveOptions {
    pub fn check(&self) -> Result<()> {
        ensure!(self.block_size > 1, "block_size must be greater than 1");
        Ok(())
    }
}

pub struct ExhaustiveMatcher {
    options: ExhaustiveOptions,
    database: SharedDatabase,
    cache: Arc<MatcherCache>,
    dispatcher: MatchDispatcher,
    stop: StopToken,
}

impl ExhaustiveMatcher {
    pub fn new(
        options: ExhaustiveOptions,
        match_options: MatchingOptions,
        database: SharedDatabase,
    ) -> Result<Self> {
        Self::with_gpu_backend(options, match_options, database, None)
    }

    pub fn with_gpu_backend(
        options: ExhaustiveOptions,
        match_options: MatchingOptions,
        database: SharedDatabase,
        gpu_factory: Option<Arc<dyn GpuKernelFactory>>,
    ) -> Result<Self> {
        options.check()?;
        match_options.check()?;

        let cache = Arc::new(MatcherCache::new(
            5 * options.block_size,
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
            stop: StopToken::new(),
        })
    }

    pub fn stop_token(&self) -> StopToken {
        self.stop.clone()
    }

    pub fn run(&mut self) -> Result<()> {
        info!("Exhaustive feature matching");
        let total = Timer::start();

        if !self.dispatcher.setup()? {
            return Ok(());
        }
        self.cache.setup()?;

        let image_ids = self.cache.get_image_ids();
        let block_size = self.options.block_size;
        let num_blocks = image_ids.len().div_ceil(block_size);

        let mut image_pairs = Vec::with_capacity(block_size * block_size);
        for start_idx1 in (0..image_ids.len()).step_by(block_size) {
            let end_idx1 = (start_idx1 + block_size).min(image_ids.len());
            for start_idx2 in (0..image_ids.len()).step_by(block_size) {
                let end_idx2 = (start_idx2 + block_size).min(image_ids.len());

                if self.stop.is_stopped() {
                    total.log_total("Exhaustive feature matching");
                    return Ok(());
                }

                let timer = Timer::start();
                info!(
                    "Matching block [{}/{}, {}/{}]",
                    start_idx1 / block_size + 1,
                    num_blocks,
                    start_idx2 / block_size + 1,
                    num_blocks
                );

                image_pairs.clear();
                for idx1 in start_idx1..end_idx1 {
                    for idx2 in start_idx2..end_idx2 {
                        // Within the union of the two blocks, emit each
                        // unordered pair exactly once while keeping the
                        // block-aligned access pattern.
                        let block_id1 = idx1 % block_size;
                        let block_id2 = idx2 % block_size;
                        if (idx1 > idx2 && block_id1 <= block_id2)
                            || (idx1 < idx2 && block_id1 < block_id2)
                        {
                            image_pairs.push((image_ids[idx1], image_ids[idx2]));
                        }
                    }
                }

                let transaction = DatabaseTransaction::begin(&self.database)?;
                self.dispatcher.match_pairs(&image_pairs)?;
                transaction.commit()?;

                debug!("Block matched in {:.3}s", timer.elapsed_seconds());
            }
        }

        total.log_total("Exhaustive feature matching");
        Ok(())
    }
}
