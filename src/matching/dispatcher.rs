//! Dispatcher: owns the worker pool and both job queues.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use crossbeam_channel::{bounded, select, Receiver, Sender};
use tracing::error;

use super::worker::{CpuMatcherWorker, GpuMatcherWorker, MatchJob, MatchResult, MatcherWorker};
use super::{GpuKernelFactory, MatcherCache, MatchingOptions, USE_ALL};
use crate::database::{pair_id_from_image_pair, Database, ImageId, SharedDatabase};

/// Fans image pairs out over a pool of matcher workers and writes the
/// results back through the cache.
///
/// The input and output queues are bounded, so a slow worker pool
/// backpressures a fast pair generator. Within one [`match_pairs`] call the
/// dispatcher pushes N jobs and pops exactly N results; the output queue is
/// empty again when the call returns.
///
/// [`match_pairs`]: MatchDispatcher::match_pairs
pub struct MatchDispatcher {
    options: MatchingOptions,
    database: SharedDatabase,
    cache: Arc<MatcherCache>,
    workers: Vec<Box<dyn MatcherWorker>>,
    job_tx: Option<Sender<MatchJob>>,
    result_rx: Receiver<MatchResult>,
    gpu_unavailable: Option<String>,
    is_setup: bool,
}

impl MatchDispatcher {
    /// Build the worker pool without starting it. With `use_gpu` one worker
    /// is created per requested GPU device (`gpu_index == "-1"` means every
    /// device the factory enumerates); otherwise `num_threads` CPU workers.
    pub fn new(
        options: MatchingOptions,
        database: SharedDatabase,
        cache: Arc<MatcherCache>,
        gpu_factory: Option<Arc<dyn GpuKernelFactory>>,
    ) -> Result<Self> {
        options.check()?;

        enum Plan {
            Cpu(usize),
            Gpu(Arc<dyn GpuKernelFactory>, Vec<usize>),
            Unavailable(String),
        }

        let plan = if options.use_gpu {
            match gpu_factory {
                None => Plan::Unavailable("no GPU matching backend registered".to_string()),
                Some(factory) => {
                    let mut indices = options.gpu_indices()?;
                    if indices == [USE_ALL] {
                        indices = (0..factory.num_devices() as i32).collect();
                    }
                    if indices.is_empty() {
                        Plan::Unavailable("no GPU devices found".to_string())
                    } else if let Some(bad) = indices.iter().find(|&&i| i < 0) {
                        bail!("invalid GPU device index {bad}");
                    } else {
                        Plan::Gpu(factory, indices.into_iter().map(|i| i as usize).collect())
                    }
                }
            }
        } else {
            Plan::Cpu(options.effective_num_threads())
        };

        let num_workers = match &plan {
            Plan::Cpu(n) => *n,
            Plan::Gpu(_, indices) => indices.len(),
            Plan::Unavailable(_) => 0,
        };
        let queue_capacity = (2 * num_workers).max(1);
        let (job_tx, job_rx) = bounded::<MatchJob>(queue_capacity);
        let (result_tx, result_rx) = bounded::<MatchResult>(queue_capacity);

        let mut workers: Vec<Box<dyn MatcherWorker>> = Vec::with_capacity(num_workers);
        let mut gpu_unavailable = None;
        match plan {
            Plan::Cpu(n) => {
                for _ in 0..n {
                    workers.push(Box::new(CpuMatcherWorker::new(
                        options.clone(),
                        Arc::clone(&cache),
                        job_rx.clone(),
                        result_tx.clone(),
                    )));
                }
            }
            Plan::Gpu(factory, indices) => {
                for device_index in indices {
                    workers.push(Box::new(GpuMatcherWorker::new(
                        options.clone(),
                        Arc::clone(&cache),
                        job_rx.clone(),
                        result_tx.clone(),
                        Arc::clone(&factory),
                        device_index,
                    )));
                }
            }
            Plan::Unavailable(reason) => gpu_unavailable = Some(reason),
        }

        Ok(Self {
            options,
            database,
            cache,
            workers,
            job_tx: Some(job_tx),
            result_rx,
            gpu_unavailable,
            is_setup: false,
        })
    }

    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    pub fn is_setup(&self) -> bool {
        self.is_setup
    }

    /// Clamp `max_num_matches` to the largest descriptor count in the
    /// database, start all workers, and wait for their setup signals.
    /// Returns `Ok(false)` if any worker failed to come up.
    pub fn setup(&mut self) -> Result<bool> {
        if let Some(reason) = &self.gpu_unavailable {
            error!("GPU matching unavailable: {reason}");
            return Ok(false);
        }

        let max_num_descriptors = self.database.lock().max_num_descriptors()?;
        if max_num_descriptors > 0 {
            self.options.max_num_matches = self.options.max_num_matches.min(max_num_descriptors);
        }

        for worker in &mut self.workers {
            worker.set_max_num_matches(self.options.max_num_matches);
            worker.start();
        }
        for worker in &mut self.workers {
            if !worker.check_valid_setup() {
                return Ok(false);
            }
        }

        self.is_setup = true;
        Ok(true)
    }

    /// Match a batch of image pairs and persist the results.
    ///
    /// Self pairs are dropped, duplicates (in either order) are submitted
    /// once, and pairs whose matches already exist in the database are
    /// skipped without touching descriptors.
    pub fn match_pairs(&mut self, pairs: &[(ImageId, ImageId)]) -> Result<()> {
        assert!(self.is_setup, "dispatcher used before setup");

        if pairs.is_empty() {
            return Ok(());
        }

        let mut pair_ids = HashSet::with_capacity(pairs.len());
        let mut pending: VecDeque<MatchJob> = VecDeque::new();
        for &(image_id1, image_id2) in pairs {
            if image_id1 == image_id2 {
                continue;
            }
            if !pair_ids.insert(pair_id_from_image_pair(image_id1, image_id2)) {
                continue;
            }
            if self.cache.exists_matches(image_id1, image_id2)? {
                continue;
            }
            pending.push_back(MatchJob::new(image_id1, image_id2));
        }

        let expected = pending.len();
        let mut received = 0usize;
        let mut first_error: Option<anyhow::Error> = None;

        let job_tx = self
            .job_tx
            .as_ref()
            .ok_or_else(|| anyhow!("dispatcher already shut down"))?;

        // Submitting and draining are interleaved: with both queues bounded,
        // pushing all jobs before popping any result would deadlock once
        // the output queue fills up.
        while received < expected {
            if let Some(job) = pending.front().cloned() {
                select! {
                    send(job_tx, job) -> res => {
                        if res.is_err() {
                            bail!("matcher workers shut down unexpectedly");
                        }
                        pending.pop_front();
                    }
                    recv(self.result_rx) -> msg => {
                        let result = msg
                            .map_err(|_| anyhow!("matcher workers shut down unexpectedly"))?;
                        received += 1;
                        record_result(&self.options, &self.cache, result, &mut first_error);
                    }
                }
            } else {
                let result = self
                    .result_rx
                    .recv()
                    .map_err(|_| anyhow!("matcher workers shut down unexpectedly"))?;
                received += 1;
                record_result(&self.options, &self.cache, result, &mut first_error);
            }
        }
        debug_assert!(self.result_rx.is_empty());

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Apply the match-count floor once more and write the result through the
/// cache. Errors are kept for after the drain so no output stays queued.
fn record_result(
    options: &MatchingOptions,
    cache: &MatcherCache,
    result: MatchResult,
    first_error: &mut Option<anyhow::Error>,
) {
    let outcome = result.and_then(|mut job| {
        if job.matches.len() < options.min_num_matches {
            job.matches.clear();
        }
        cache.write_matches(job.image_id1, job.image_id2, &job.matches)
    });
    if let Err(e) = outcome {
        if first_error.is_none() {
            *first_error = Some(e);
        } else {
            error!("Dropping additional matching error: {e:#}");
        }
    }
}

impl Drop for MatchDispatcher {
    fn drop(&mut self) {
        for worker in &self.workers {
            worker.stop();
        }
        // Disconnect the input queue so blocked workers wake up.
        self.job_tx.take();
        for worker in &mut self.workers {
            worker.wait();
        }
    }
}

#[cfg(test)]
mod tests {
    use nalgebra::{DMatrix, Vector3};
    use parking_lot::Mutex;

    use super::*;
    use crate::database::{shared, Camera, Database, FeatureMatch, Image, MemoryDatabase};
    use crate::matching::worker::tests::{FailingGpuFactory, RecordingGpuFactory};

    fn test_setup(num_images: u32) -> (SharedDatabase, Arc<MatcherCache>) {
        let mut db = MemoryDatabase::new();
        db.add_camera(Camera {
            camera_id: 1,
            model: "PINHOLE".to_string(),
            width: 100,
            height: 100,
            params: vec![100.0, 50.0, 50.0],
        });
        for image_id in 1..=num_images {
            db.add_image(Image {
                image_id,
                camera_id: 1,
                name: format!("image{image_id:03}.jpg"),
                tvec_prior: Vector3::zeros(),
            });
            db.add_descriptors(
                image_id,
                DMatrix::from_row_slice(2, 4, &[0, 0, 0, 0, 250, 250, 250, 250]),
            );
        }
        let database = shared(db);
        let cache = Arc::new(MatcherCache::new(8, Arc::clone(&database)));
        cache.setup().unwrap();
        (database, cache)
    }

    fn cpu_options() -> MatchingOptions {
        MatchingOptions {
            num_threads: 2,
            min_num_matches: 0,
            ..MatchingOptions::default()
        }
    }

    fn matched_pairs(database: &SharedDatabase) -> Vec<(ImageId, ImageId)> {
        let mut pairs: Vec<(ImageId, ImageId)> = database
            .lock()
            .read_num_matches()
            .unwrap()
            .into_iter()
            .map(|(pair_id, _)| crate::database::image_pair_from_pair_id(pair_id))
            .collect();
        pairs.sort_unstable();
        pairs
    }

    #[test]
    fn test_self_pairs_and_duplicates_filtered() {
        let (database, cache) = test_setup(3);
        let mut dispatcher =
            MatchDispatcher::new(cpu_options(), Arc::clone(&database), cache, None).unwrap();
        assert!(dispatcher.setup().unwrap());

        dispatcher
            .match_pairs(&[(1, 2), (2, 1), (1, 1), (1, 3), (1, 2)])
            .unwrap();

        assert_eq!(matched_pairs(&database), vec![(1, 2), (1, 3)]);
    }

    #[test]
    fn test_existing_pairs_skipped() {
        let (database, cache) = test_setup(3);
        let prior = vec![FeatureMatch { idx1: 7, idx2: 9 }];
        database.lock().write_matches(1, 2, &prior).unwrap();

        let mut dispatcher =
            MatchDispatcher::new(cpu_options(), Arc::clone(&database), cache, None).unwrap();
        assert!(dispatcher.setup().unwrap());

        dispatcher.match_pairs(&[(1, 2), (1, 3)]).unwrap();

        // The pre-existing matches are untouched, only the new pair ran.
        assert_eq!(database.lock().read_matches(1, 2).unwrap(), prior);
        assert_eq!(matched_pairs(&database), vec![(1, 2), (1, 3)]);
        assert_eq!(database.lock().read_matches(1, 3).unwrap().len(), 2);
    }

    #[test]
    fn test_below_floor_persisted_as_empty() {
        let (database, cache) = test_setup(2);
        let mut options = cpu_options();
        options.min_num_matches = 10;

        let mut dispatcher =
            MatchDispatcher::new(options, Arc::clone(&database), cache, None).unwrap();
        assert!(dispatcher.setup().unwrap());

        dispatcher.match_pairs(&[(1, 2)]).unwrap();

        assert!(database.lock().exists_matches(1, 2).unwrap());
        assert!(database.lock().read_matches(1, 2).unwrap().is_empty());
    }

    #[test]
    fn test_max_num_matches_clamped_at_setup() {
        let (database, cache) = test_setup(2);
        let mut dispatcher =
            MatchDispatcher::new(cpu_options(), Arc::clone(&database), cache, None).unwrap();
        assert!(dispatcher.setup().unwrap());

        // Two descriptors per image in the fixture.
        assert_eq!(dispatcher.options.max_num_matches, 2);
    }

    #[test]
    fn test_large_batch_drains_completely() {
        let (database, cache) = test_setup(40);
        let mut dispatcher =
            MatchDispatcher::new(cpu_options(), Arc::clone(&database), cache, None).unwrap();
        assert!(dispatcher.setup().unwrap());

        let mut pairs = Vec::new();
        for image_id1 in 1..=40u32 {
            for image_id2 in (image_id1 + 1)..=40u32 {
                pairs.push((image_id1, image_id2));
            }
        }
        dispatcher.match_pairs(&pairs).unwrap();

        assert_eq!(matched_pairs(&database).len(), 40 * 39 / 2);
    }

    #[test]
    fn test_gpu_pool_per_device() {
        let (database, cache) = test_setup(3);
        let calls = Arc::new(Mutex::new(Vec::new()));
        let factory = Arc::new(RecordingGpuFactory {
            calls,
            devices: 2,
        });

        let mut options = cpu_options();
        options.use_gpu = true;

        let mut dispatcher =
            MatchDispatcher::new(options, Arc::clone(&database), cache, Some(factory)).unwrap();
        assert_eq!(dispatcher.num_workers(), 2);
        assert!(dispatcher.setup().unwrap());

        dispatcher.match_pairs(&[(1, 2), (1, 3), (2, 3)]).unwrap();
        assert_eq!(matched_pairs(&database).len(), 3);
    }

    #[test]
    fn test_gpu_setup_failure_reported() {
        let (database, cache) = test_setup(2);
        let mut options = cpu_options();
        options.use_gpu = true;

        let mut dispatcher = MatchDispatcher::new(
            options,
            database,
            cache,
            Some(Arc::new(FailingGpuFactory)),
        )
        .unwrap();
        assert!(!dispatcher.setup().unwrap());
    }

    #[test]
    fn test_gpu_without_backend_fails_setup() {
        let (database, cache) = test_setup(2);
        let mut options = cpu_options();
        options.use_gpu = true;

        let mut dispatcher = MatchDispatcher::new(options, database, cache, None).unwrap();
        assert!(!dispatcher.setup().unwrap());
    }
}
