//! Descriptor matching kernels.
//!
//! The CPU kernel is a brute-force nearest neighbor search over descriptor
//! rows with a ratio test and optional cross check. The GPU kernel is an
//! external backend behind [`GpuMatchKernel`]; workers only rely on its
//! slot-reuse contract.

use anyhow::Result;

use super::MatchingOptions;
use crate::database::{FeatureDescriptors, FeatureMatch, FeatureMatches};

/// Squared L2 distance between two descriptor rows.
fn distance_sq(d1: &FeatureDescriptors, row1: usize, d2: &FeatureDescriptors, row2: usize) -> u32 {
    let mut sum = 0u32;
    for col in 0..d1.ncols() {
        let diff = d1[(row1, col)] as i32 - d2[(row2, col)] as i32;
        sum += (diff * diff) as u32;
    }
    sum
}

/// Nearest row of `train` to `query` row `row`, with the second-nearest
/// distance for the ratio test.
fn nearest_neighbor(
    query: &FeatureDescriptors,
    row: usize,
    train: &FeatureDescriptors,
) -> Option<(usize, u32, Option<u32>)> {
    let mut best: Option<(usize, u32)> = None;
    let mut second_best: Option<u32> = None;

    for train_row in 0..train.nrows() {
        let dist = distance_sq(query, row, train, train_row);
        match best {
            None => best = Some((train_row, dist)),
            Some((_, best_dist)) if dist < best_dist => {
                second_best = Some(best_dist);
                best = Some((train_row, dist));
            }
            Some(_) => {
                if second_best.map_or(true, |s| dist < s) {
                    second_best = Some(dist);
                }
            }
        }
    }

    best.map(|(idx, dist)| (idx, dist, second_best))
}

/// Match two descriptor blocks on the CPU.
///
/// Candidates failing the ratio test, the distance cap, or (if enabled) the
/// cross check are dropped; the survivors are sorted by distance and
/// truncated to `max_num_matches`.
pub fn match_features_cpu(
    options: &MatchingOptions,
    descriptors1: &FeatureDescriptors,
    descriptors2: &FeatureDescriptors,
) -> FeatureMatches {
    if descriptors1.nrows() == 0 || descriptors2.nrows() == 0 {
        return FeatureMatches::new();
    }
    debug_assert_eq!(descriptors1.ncols(), descriptors2.ncols());

    // Forward nearest neighbors of every descriptor in image 2, computed
    // once when the cross check needs them.
    let reverse_best: Option<Vec<usize>> = options.cross_check.then(|| {
        (0..descriptors2.nrows())
            .map(|row| {
                nearest_neighbor(descriptors2, row, descriptors1)
                    .map(|(idx, _, _)| idx)
                    .unwrap_or(usize::MAX)
            })
            .collect()
    });

    let max_distance_sq = options.max_distance * options.max_distance;

    let mut candidates: Vec<(u32, FeatureMatch)> = Vec::new();
    for row in 0..descriptors1.nrows() {
        let Some((best_idx, best_dist, second_best)) =
            nearest_neighbor(descriptors1, row, descriptors2)
        else {
            continue;
        };

        if (best_dist as f32) > max_distance_sq {
            continue;
        }

        if let Some(second) = second_best {
            let ratio_sq = options.max_ratio * options.max_ratio;
            if best_dist as f32 > ratio_sq * second as f32 {
                continue;
            }
        }

        if let Some(ref reverse) = reverse_best {
            if reverse[best_idx] != row {
                continue;
            }
        }

        candidates.push((
            best_dist,
            FeatureMatch {
                idx1: row as u32,
                idx2: best_idx as u32,
            },
        ));
    }

    candidates.sort_by_key(|(dist, _)| *dist);
    candidates.truncate(options.max_num_matches);
    candidates.into_iter().map(|(_, m)| m).collect()
}

/// GPU matching backend for one worker.
///
/// The worker keeps one upload slot per pair side. A `None` descriptor
/// block means "match against what this slot already holds"; the kernel
/// must then skip the host-to-device transfer for that side.
pub trait GpuMatchKernel: Send {
    fn match_features(
        &mut self,
        descriptors1: Option<&FeatureDescriptors>,
        descriptors2: Option<&FeatureDescriptors>,
    ) -> Result<FeatureMatches>;
}

/// Enumerates GPU devices and creates per-worker kernels.
///
/// Creation may fail (missing runtime, over-requested device index); the
/// owning worker then reports an invalid setup.
pub trait GpuKernelFactory: Send + Sync {
    fn num_devices(&self) -> usize;

    fn create(
        &self,
        device_index: usize,
        options: &MatchingOptions,
    ) -> Result<Box<dyn GpuMatchKernel>>;
}

#[cfg(test)]
mod tests {
    use nalgebra::DMatrix;

    use super::*;

    fn options() -> MatchingOptions {
        MatchingOptions {
            min_num_matches: 0,
            ..MatchingOptions::default()
        }
    }

    fn descriptors(rows: &[[u8; 4]]) -> FeatureDescriptors {
        DMatrix::from_fn(rows.len(), 4, |r, c| rows[r][c])
    }

    #[test]
    fn test_identical_descriptors_match() {
        let d = descriptors(&[[0, 0, 0, 0], [200, 200, 200, 200]]);
        let matches = match_features_cpu(&options(), &d, &d);
        assert_eq!(
            matches,
            vec![
                FeatureMatch { idx1: 0, idx2: 0 },
                FeatureMatch { idx1: 1, idx2: 1 }
            ]
        );
    }

    #[test]
    fn test_ratio_test_rejects_ambiguous() {
        // Both rows of the second block are almost equally far from the
        // query, so the nearest match is ambiguous.
        let query = descriptors(&[[100, 100, 100, 100]]);
        let train = descriptors(&[[120, 100, 100, 100], [100, 121, 100, 100]]);

        let mut opts = options();
        opts.cross_check = false;
        opts.max_ratio = 0.8;
        assert!(match_features_cpu(&opts, &query, &train).is_empty());

        opts.max_ratio = 1.0;
        assert_eq!(match_features_cpu(&opts, &query, &train).len(), 1);
    }

    #[test]
    fn test_cross_check_requires_mutual_nearest() {
        // Rows 0 and 1 of the first block both map to row 0 of the second;
        // only the mutual nearest pair survives.
        let d1 = descriptors(&[[0, 0, 0, 0], [10, 0, 0, 0]]);
        let d2 = descriptors(&[[0, 0, 0, 0], [255, 255, 255, 255]]);

        let mut opts = options();
        opts.cross_check = true;
        opts.max_ratio = 1.0;
        let matches = match_features_cpu(&opts, &d1, &d2);
        assert_eq!(matches, vec![FeatureMatch { idx1: 0, idx2: 0 }]);
    }

    #[test]
    fn test_max_num_matches_truncates() {
        let rows: Vec<[u8; 4]> = (0..6).map(|i| [i as u8 * 40; 4]).collect();
        let d = descriptors(&rows);

        let mut opts = options();
        opts.max_num_matches = 4;
        assert_eq!(match_features_cpu(&opts, &d, &d).len(), 4);
    }

    #[test]
    fn test_empty_input() {
        let empty = DMatrix::<u8>::zeros(0, 4);
        let d = descriptors(&[[1, 2, 3, 4]]);
        assert!(match_features_cpu(&options(), &empty, &d).is_empty());
        assert!(match_features_cpu(&options(), &d, &empty).is_empty());
    }
}
