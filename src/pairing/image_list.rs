//! Matching of externally specified image pairs, read from a text file of
//! `name1 name2` lines. Blank lines and lines starting with `#` are
//! comments; unknown names are reported and dropped.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{ensure, Context, Result};
use tracing::{debug, error, info};

use crate::control::{StopToken, Timer};
use crate::database::{DatabaseTransaction, ImageId, SharedDatabase};
use crate::matching::{GpuKernelFactory, MatchDispatcher, MatcherCache, MatchingOptions};

#[derive(Debug, Clone)]
pub struct ImagePairsOptions {
    /// Pairs dispatched per transaction.
    pub block_size: usize,

    /// Path to the pair list.
    pub match_list_path: PathBuf,
}

impl Default for ImagePairsOptions {
    fn default() -> Self {
        Self {
            block_size: 1225,
            match_list_path: PathBuf::new(),
        }
    }
}

impl ImagePairsOptions {
    pub fn check(&self) -> Result<()> {
        ensure!(self.block_size > 0, "block_size must be positive");
        Ok(())
    }
}

pub struct ImagePairsMatcher {
    options: ImagePairsOptions,
    database: SharedDatabase,
    cache: Arc<MatcherCache>,
    dispatcher: MatchDispatcher,
    stop: StopToken,
}

impl ImagePairsMatcher {
    pub fn new(
        options: ImagePairsOptions,
        match_options: MatchingOptions,
        database: SharedDatabase,
    ) -> Result<Self> {
        Self::with_gpu_backend(options, match_options, database, None)
    }

    pub fn with_gpu_backend(
        options: ImagePairsOptions,
        match_options: MatchingOptions,
        database: SharedDatabase,
        gpu_factory: Option<Arc<dyn GpuKernelFactory>>,
    ) -> Result<Self> {
        options.check()?;
        match_options.check()?;

        let cache = Arc::new(MatcherCache::new(options.block_size, Arc::clone(&database)));
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

    fn read_image_pairs(&self) -> Result<Vec<(ImageId, ImageId)>> {
        let image_ids = self.cache.get_image_ids();
        let name_to_id: HashMap<&str, ImageId> = image_ids
            .iter()
            .map(|&image_id| (self.cache.get_image(image_id).name.as_str(), image_id))
            .collect();

        let path = &self.options.match_list_path;
        let file = File::open(path)
            .with_context(|| format!("failed to open match list {}", path.display()))?;

        let mut image_pairs = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let mut parts = line.split_whitespace();
            let (Some(name1), Some(name2)) = (parts.next(), parts.next()) else {
                error!("Malformed image pair line '{line}'");
                continue;
            };

            let Some(&image_id1) = name_to_id.get(name1) else {
                error!("Image {name1} does not exist");
                continue;
            };
            let Some(&image_id2) = name_to_id.get(name2) else {
                error!("Image {name2} does not exist");
                continue;
            };

            image_pairs.push((image_id1, image_id2));
        }
        Ok(image_pairs)
    }

    pub fn run(&mut self) -> Result<()> {
        info!("Custom feature matching");
        let total = Timer::start();

        if !self.dispatcher.setup()? {
            return Ok(());
        }
        self.cache.setup()?;

        let image_pairs = self.read_image_pairs()?;
        let num_blocks = image_pairs.len().div_ceil(self.options.block_size);

        for (block_idx, block) in image_pairs.chunks(self.options.block_size).enumerate() {
            if self.stop.is_stopped() {
                total.log_total("Custom feature matching");
                return Ok(());
            }

            let timer = Timer::start();
            info!("Matching block [{}/{}]", block_idx + 1, num_blocks);

            let transaction = DatabaseTransaction::begin(&self.database)?;
            self.dispatcher.match_pairs(block)?;
            transaction.commit()?;

            debug!("Block matched in {:.3}s", timer.elapsed_seconds());
        }

        total.log_total("Custom feature matching");
        Ok(())
    }
}
