//! Sequential pair generation for ordered captures (video frames, walks).

use std::sync::Arc;

use anyhow::{ensure, Result};
use tracing::{debug, info};

use crate::control::{StopToken, Timer};
use crate::database::{DatabaseTransaction, ImageId, SharedDatabase};
use crate::matching::{GpuKernelFactory, MatchDispatcher, MatcherCache, MatchingOptions};

#[derive(Debug, Clone)]
pub struct SequentialOptions {
    /// Number of following images each image is paired with.
    pub overlap: usize,

    /// Additionally pair with images at exponentially growing strides
    /// `2^0, 2^1, ...`, which helps loop closure over longer sequences.
    pub quadratic_overlap: bool,
}

impl Default for SequentialOptions {
    fn default() -> Self {
        Self {
            overlap: 10,
            quadratic_overlap: true,
        }
    }
}

impl SequentialOptions {
    pub fn check(&self) -> Result<()> {
        ensure!(self.overlap > 0, "overlap must be positive");
        Ok(())
    }
}

pub struct SequentialMatcher {
    options: SequentialOptions,
    database: SharedDatabase,
    cache: Arc<MatcherCache>,
    dispatcher: MatchDispatcher,
    stop: StopToken,
}

impl SequentialMatcher {
    pub fn new(
        options: SequentialOptions,
        match_options: MatchingOptions,
        database: SharedDatabase,
    ) -> Result<Self> {
        Self::with_gpu_backend(options, match_options, database, None)
    }

    pub fn with_gpu_backend(
        options: SequentialOptions,
        match_options: MatchingOptions,
        database: SharedDatabase,
        gpu_factory: Option<Arc<dyn GpuKernelFactory>>,
    ) -> Result<Self> {
        options.check()?;
        match_options.check()?;

        let cache = Arc::new(MatcherCache::new(5 * options.overlap, Arc::clone(&database)));
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

    /// Image ids in capture order, approximated by the lexicographic order
    /// of image names.
    fn ordered_image_ids(&self) -> Vec<ImageId> {
        let image_ids = self.cache.get_image_ids();
        let mut ordered: Vec<(&str, ImageId)> = image_ids
            .iter()
            .map(|&image_id| (self.cache.get_image(image_id).name.as_str(), image_id))
            .collect();
        ordered.sort();
        ordered.into_iter().map(|(_, image_id)| image_id).collect()
    }

    pub fn run(&mut self) -> Result<()> {
        info!("Sequential feature matching");
        let total = Timer::start();

        if !self.dispatcher.setup()? {
            return Ok(());
        }
        self.cache.setup()?;

        let ordered_ids = self.ordered_image_ids();
        let overlap = self.options.overlap;

        let mut image_pairs = Vec::with_capacity(2 * overlap);
        for idx1 in 0..ordered_ids.len() {
            if self.stop.is_stopped() {
                total.log_total("Sequential feature matching");
                return Ok(());
            }

            let timer = Timer::start();
            info!("Matching image [{}/{}]", idx1 + 1, ordered_ids.len());

            image_pairs.clear();
            for step in 1..=overlap {
                let idx2 = idx1 + step;
                if idx2 >= ordered_ids.len() {
                    break;
                }
                image_pairs.push((ordered_ids[idx1], ordered_ids[idx2]));
            }
            if self.options.quadratic_overlap {
                for exponent in 0..overlap {
                    let Some(step) = 1usize.checked_shl(exponent as u32) else {
                        break;
                    };
                    let Some(idx2) = idx1.checked_add(step) else {
                        break;
                    };
                    if idx2 >= ordered_ids.len() {
                        break;
                    }
                    image_pairs.push((ordered_ids[idx1], ordered_ids[idx2]));
                }
            }

            let transaction = DatabaseTransaction::begin(&self.database)?;
            self.dispatcher.match_pairs(&image_pairs)?;
            transaction.commit()?;

            debug!("Image matched in {:.3}s", timer.elapsed_seconds());
        }

        total.log_total("Sequential feature matching");
        Ok(())
    }
}
