//! Feature matching engine: descriptor cache, matcher workers, and the
//! dispatcher that drives them.
//!
//! Pair generators (see [`crate::pairing`]) hand batches of image pairs to
//! the [`MatchDispatcher`], which fans them out over a pool of CPU or GPU
//! workers fed from a [`MatcherCache`] and writes the resulting putative
//! matches back to the database.

pub mod cache;
pub mod dispatcher;
pub mod kernel;
pub mod worker;

use anyhow::{ensure, Context, Result};

pub use cache::MatcherCache;
pub use dispatcher::MatchDispatcher;
pub use kernel::{match_features_cpu, GpuKernelFactory, GpuMatchKernel};
pub use worker::{CpuMatcherWorker, GpuMatcherWorker, MatchJob, MatcherWorker};

/// Sentinel for "use all hardware threads" / "use all GPU devices".
pub const USE_ALL: i32 = -1;

/// Options shared by all matcher workers.
#[derive(Debug, Clone)]
pub struct MatchingOptions {
    /// Number of CPU matcher workers; `USE_ALL` means hardware concurrency.
    pub num_threads: i32,

    /// Match on the GPU instead of the CPU.
    pub use_gpu: bool,

    /// Comma-separated GPU device indices; `"-1"` means all devices.
    pub gpu_index: String,

    /// Nearest to second-nearest distance ratio above which a match is
    /// rejected as ambiguous.
    pub max_ratio: f32,

    /// Maximum descriptor distance for an accepted match.
    pub max_distance: f32,

    /// Only keep matches that are mutual nearest neighbors.
    pub cross_check: bool,

    /// Upper bound on matches per pair; clamped at setup to the largest
    /// descriptor count in the database.
    pub max_num_matches: usize,

    /// Match sets smaller than this are zeroed out (but still persisted so
    /// the pair is not retried).
    pub min_num_matches: usize,
}

impl Default for MatchingOptions {
    fn default() -> Self {
        Self {
            num_threads: USE_ALL,
            use_gpu: false,
            gpu_index: "-1".to_string(),
            max_ratio: 0.8,
            max_distance: 512.0,
            cross_check: true,
            max_num_matches: 32_768,
            min_num_matches: 15,
        }
    }
}

impl MatchingOptions {
    pub fn check(&self) -> Result<()> {
        ensure!(
            self.num_threads == USE_ALL || self.num_threads > 0,
            "num_threads must be positive or {USE_ALL}"
        );
        ensure!(self.max_ratio > 0.0, "max_ratio must be positive");
        ensure!(self.max_distance > 0.0, "max_distance must be positive");
        ensure!(self.max_num_matches > 0, "max_num_matches must be positive");
        self.gpu_indices()?;
        Ok(())
    }

    /// Worker count after resolving the hardware-concurrency sentinel.
    pub fn effective_num_threads(&self) -> usize {
        if self.num_threads > 0 {
            self.num_threads as usize
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        }
    }

    /// Parsed GPU device indices; `[-1]` means all devices.
    pub fn gpu_indices(&self) -> Result<Vec<i32>> {
        let indices = self
            .gpu_index
            .split(',')
            .map(|s| {
                s.trim()
                    .parse::<i32>()
                    .with_context(|| format!("invalid gpu_index entry '{}'", s.trim()))
            })
            .collect::<Result<Vec<_>>>()?;
        ensure!(!indices.is_empty(), "gpu_index must not be empty");
        Ok(indices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options_pass_check() {
        MatchingOptions::default().check().unwrap();
    }

    #[test]
    fn test_invalid_options_rejected() {
        let mut options = MatchingOptions::default();
        options.num_threads = 0;
        assert!(options.check().is_err());

        let mut options = MatchingOptions::default();
        options.max_num_matches = 0;
        assert!(options.check().is_err());

        let mut options = MatchingOptions::default();
        options.gpu_index = "0,x".to_string();
        assert!(options.check().is_err());
    }

    #[test]
    fn test_gpu_indices_parsing() {
        let mut options = MatchingOptions::default();
        assert_eq!(options.gpu_indices().unwrap(), vec![-1]);

        options.gpu_index = "0, 2,3".to_string();
        assert_eq!(options.gpu_indices().unwrap(), vec![0, 2, 3]);
    }
}
