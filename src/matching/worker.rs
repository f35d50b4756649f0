//! Long-lived matcher workers.
//!
//! A worker consumes `(image_id1, image_id2)` jobs from the input queue,
//! fetches descriptors through the cache, runs the match kernel, enforces
//! the minimum match count, and pushes the result to the output queue. It
//! never writes to the database itself.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::Result;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use tracing::error;

use super::kernel::{match_features_cpu, GpuKernelFactory, GpuMatchKernel};
use super::{MatcherCache, MatchingOptions};
use crate::database::{FeatureDescriptors, FeatureMatches, ImageId, INVALID_IMAGE_ID};

/// How long a blocked worker waits before re-checking its stop flag.
const RECV_TIMEOUT: Duration = Duration::from_millis(100);

/// One unit of matching work: a pair of image ids on the way in, the same
/// pair plus its putative matches on the way out.
#[derive(Debug, Clone)]
pub struct MatchJob {
    pub image_id1: ImageId,
    pub image_id2: ImageId,
    pub matches: FeatureMatches,
}

impl MatchJob {
    pub fn new(image_id1: ImageId, image_id2: ImageId) -> Self {
        Self {
            image_id1,
            image_id2,
            matches: FeatureMatches::new(),
        }
    }
}

/// Worker output: the completed job, or the error that stopped it (e.g. a
/// failed descriptor read). Errors travel to the dispatcher rather than
/// dying inside the worker thread.
pub type MatchResult = Result<MatchJob>;

/// Common lifecycle of matcher workers.
///
/// `start` spawns the thread, `check_valid_setup` blocks until the worker
/// has signalled whether its backend came up, `stop` requests a cooperative
/// exit between jobs, `wait` joins.
pub trait MatcherWorker: Send {
    fn set_max_num_matches(&mut self, max_num_matches: usize);

    fn start(&mut self);

    fn stop(&self);

    fn check_valid_setup(&mut self) -> bool;

    fn wait(&mut self);
}

/// State shared by both worker variants.
struct WorkerState {
    options: MatchingOptions,
    cache: Arc<MatcherCache>,
    jobs: Receiver<MatchJob>,
    results: Sender<MatchResult>,
    stop: Arc<AtomicBool>,
    setup_tx: Option<Sender<bool>>,
    setup_rx: Receiver<bool>,
    valid_setup: Option<bool>,
    handle: Option<JoinHandle<()>>,
}

impl WorkerState {
    fn new(
        options: MatchingOptions,
        cache: Arc<MatcherCache>,
        jobs: Receiver<MatchJob>,
        results: Sender<MatchResult>,
    ) -> Self {
        let (setup_tx, setup_rx) = bounded(1);
        Self {
            options,
            cache,
            jobs,
            results,
            stop: Arc::new(AtomicBool::new(false)),
            setup_tx: Some(setup_tx),
            setup_rx,
            valid_setup: None,
            handle: None,
        }
    }

    fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    fn check_valid_setup(&mut self) -> bool {
        if let Some(valid) = self.valid_setup {
            return valid;
        }
        // A worker that died before signalling counts as a failed setup.
        let valid = self.setup_rx.recv().unwrap_or(false);
        self.valid_setup = Some(valid);
        valid
    }

    fn wait(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn enforce_min_num_matches(options: &MatchingOptions, matches: &mut FeatureMatches) {
    if matches.len() < options.min_num_matches {
        matches.clear();
    }
}

/// CPU matcher worker: stateless between jobs, always fetches both
/// descriptor blocks from the cache.
pub struct CpuMatcherWorker {
    state: WorkerState,
}

impl CpuMatcherWorker {
    pub fn new(
        options: MatchingOptions,
        cache: Arc<MatcherCache>,
        jobs: Receiver<MatchJob>,
        results: Sender<MatchResult>,
    ) -> Self {
        Self {
            state: WorkerState::new(options, cache, jobs, results),
        }
    }
}

impl MatcherWorker for CpuMatcherWorker {
    fn set_max_num_matches(&mut self, max_num_matches: usize) {
        self.state.options.max_num_matches = max_num_matches;
    }

    fn start(&mut self) {
        if self.state.handle.is_some() {
            return;
        }
        let options = self.state.options.clone();
        let cache = Arc::clone(&self.state.cache);
        let jobs = self.state.jobs.clone();
        let results = self.state.results.clone();
        let stop = Arc::clone(&self.state.stop);
        let setup_tx = self.state.setup_tx.take().expect("worker started twice");

        self.state.handle = Some(thread::spawn(move || {
            let _ = setup_tx.send(true);

            while !stop.load(Ordering::SeqCst) {
                let job = match jobs.recv_timeout(RECV_TIMEOUT) {
                    Ok(job) => job,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                };
                let result = process_cpu_job(&options, &cache, job);
                if results.send(result).is_err() {
                    break;
                }
            }
        }));
    }

    fn stop(&self) {
        self.state.stop();
    }

    fn check_valid_setup(&mut self) -> bool {
        self.state.check_valid_setup()
    }

    fn wait(&mut self) {
        self.state.wait();
    }
}

fn process_cpu_job(
    options: &MatchingOptions,
    cache: &MatcherCache,
    mut job: MatchJob,
) -> MatchResult {
    let descriptors1 = cache.get_descriptors(job.image_id1)?;
    let descriptors2 = cache.get_descriptors(job.image_id2)?;
    job.matches = match_features_cpu(options, &descriptors1, &descriptors2);
    enforce_min_num_matches(options, &mut job.matches);
    Ok(job)
}

/// GPU matcher worker.
///
/// Keeps track of the image most recently uploaded to each of the two
/// device descriptor slots. When a job side repeats the slot's image, the
/// kernel is handed `None` for that side and reuses the uploaded block,
/// skipping the host-to-device transfer.
pub struct GpuMatcherWorker {
    state: WorkerState,
    factory: Arc<dyn GpuKernelFactory>,
    device_index: usize,
}

impl GpuMatcherWorker {
    pub fn new(
        options: MatchingOptions,
        cache: Arc<MatcherCache>,
        jobs: Receiver<MatchJob>,
        results: Sender<MatchResult>,
        factory: Arc<dyn GpuKernelFactory>,
        device_index: usize,
    ) -> Self {
        Self {
            state: WorkerState::new(options, cache, jobs, results),
            factory,
            device_index,
        }
    }
}

impl MatcherWorker for GpuMatcherWorker {
    fn set_max_num_matches(&mut self, max_num_matches: usize) {
        self.state.options.max_num_matches = max_num_matches;
    }

    fn start(&mut self) {
        if self.state.handle.is_some() {
            return;
        }
        let options = self.state.options.clone();
        let cache = Arc::clone(&self.state.cache);
        let jobs = self.state.jobs.clone();
        let results = self.state.results.clone();
        let stop = Arc::clone(&self.state.stop);
        let setup_tx = self.state.setup_tx.take().expect("worker started twice");
        let factory = Arc::clone(&self.factory);
        let device_index = self.device_index;

        self.state.handle = Some(thread::spawn(move || {
            let mut kernel = match factory.create(device_index, &options) {
                Ok(kernel) => kernel,
                Err(e) => {
                    error!("GPU matcher setup failed on device {device_index}: {e:#}");
                    let _ = setup_tx.send(false);
                    return;
                }
            };
            let _ = setup_tx.send(true);

            let mut uploaded_ids: [ImageId; 2] = [INVALID_IMAGE_ID; 2];

            while !stop.load(Ordering::SeqCst) {
                let job = match jobs.recv_timeout(RECV_TIMEOUT) {
                    Ok(job) => job,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                };
                let result =
                    process_gpu_job(&options, &cache, kernel.as_mut(), &mut uploaded_ids, job);
                if results.send(result).is_err() {
                    break;
                }
            }
        }));
    }

    fn stop(&self) {
        self.state.stop();
    }

    fn check_valid_setup(&mut self) -> bool {
        self.state.check_valid_setup()
    }

    fn wait(&mut self) {
        self.state.wait();
    }
}

fn process_gpu_job(
    options: &MatchingOptions,
    cache: &MatcherCache,
    kernel: &mut dyn GpuMatchKernel,
    uploaded_ids: &mut [ImageId; 2],
    mut job: MatchJob,
) -> MatchResult {
    let descriptors1 = slot_descriptors(cache, uploaded_ids, 0, job.image_id1)?;
    let descriptors2 = slot_descriptors(cache, uploaded_ids, 1, job.image_id2)?;

    job.matches = kernel.match_features(descriptors1.as_deref(), descriptors2.as_deref())?;
    enforce_min_num_matches(options, &mut job.matches);
    Ok(job)
}

/// `None` when the slot already holds this image's descriptors.
fn slot_descriptors(
    cache: &MatcherCache,
    uploaded_ids: &mut [ImageId; 2],
    slot: usize,
    image_id: ImageId,
) -> Result<Option<Arc<FeatureDescriptors>>> {
    if uploaded_ids[slot] == image_id {
        return Ok(None);
    }
    let descriptors = cache.get_descriptors(image_id)?;
    uploaded_ids[slot] = image_id;
    Ok(Some(descriptors))
}
