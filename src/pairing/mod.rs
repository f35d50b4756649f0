//! Pair generation strategies.
//!
//! Each generator decides which image pairs are worth matching, hands them
//! to the [`MatchDispatcher`](crate::matching::MatchDispatcher) in batches
//! wrapped in database transactions, and reports progress. All generators
//! poll their [`StopToken`](crate::control::StopToken) at every outer-loop
//! boundary, so cancellation returns cleanly between batches.

pub mod exhaustive;
pub mod image_list;
pub mod import;
pub mod sequential;
pub mod spatial;
pub mod transitive;

pub use exhaustive::{ExhaustiveMatcher, ExhaustiveOptions};
pub use image_list::{ImagePairsMatcher, ImagePairsOptions};
pub use import::{FeaturePairsImporter, FeaturePairsOptions};
pub use sequential::{SequentialMatcher, SequentialOptions};
pub use spatial::{SpatialMatcher, SpatialOptions};
pub use transitive::{TransitiveMatcher, TransitiveOptions};

#[cfg(test)]
pub(crate) mod testing {
    use nalgebra::{DMatrix, Vector3};

    use crate::database::{
        image_pair_from_pair_id, shared, Camera, Database, Image, ImageId, MemoryDatabase,
        SharedDatabase,
    };
    use crate::matching::MatchingOptions;

    /// Database with one image per name (ids assigned 1, 2, ... in input
    /// order) and two well-separated descriptors per image.
    pub(crate) fn populated_database(names: &[&str]) -> SharedDatabase {
        populated_database_with_priors(
            &names
                .iter()
                .map(|&name| (name, Vector3::zeros()))
                .collect::<Vec<_>>(),
        )
    }

    pub(crate) fn populated_database_with_priors(
        entries: &[(&str, Vector3<f64>)],
    ) -> SharedDatabase {
        let mut db = MemoryDatabase::new();
        db.add_camera(Camera {
            camera_id: 1,
            model: "PINHOLE".to_string(),
            width: 100,
            height: 100,
            params: vec![100.0, 50.0, 50.0],
        });
        for (idx, (name, tvec_prior)) in entries.iter().enumerate() {
            let image_id = idx as ImageId + 1;
            db.add_image(Image {
                image_id,
                camera_id: 1,
                name: name.to_string(),
                tvec_prior: *tvec_prior,
            });
            db.add_descriptors(
                image_id,
                DMatrix::from_row_slice(2, 4, &[0, 0, 0, 0, 250, 250, 250, 250]),
            );
        }
        shared(db)
    }

    /// Sorted unordered pairs currently in the matches table.
    pub(crate) fn matched_pairs(database: &SharedDatabase) -> Vec<(ImageId, ImageId)> {
        let mut pairs: Vec<(ImageId, ImageId)> = database
            .lock()
            .read_num_matches()
            .unwrap()
            .into_iter()
            .map(|(pair_id, _)| image_pair_from_pair_id(pair_id))
            .collect();
        pairs.sort_unstable();
        pairs
    }

    pub(crate) fn match_options() -> MatchingOptions {
        MatchingOptions {
            num_threads: 2,
            min_num_matches: 0,
            ..MatchingOptions::default()
        }
    }
}
