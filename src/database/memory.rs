//! In-memory database, the backing store for tests and for the file-backed
//! database.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::types::{
    pair_id_from_image_pair, Camera, CameraId, FeatureDescriptors, FeatureMatches, Image, ImageId,
    PairId,
};
use super::{Database, DatabaseError};

/// The full database contents. Serializable so [`super::FileDatabase`] can
/// snapshot it to disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct DatabaseData {
    pub(crate) cameras: BTreeMap<CameraId, Camera>,
    pub(crate) images: BTreeMap<ImageId, Image>,
    pub(crate) descriptors: BTreeMap<ImageId, FeatureDescriptors>,
    pub(crate) matches: BTreeMap<PairId, FeatureMatches>,
}

/// Map-backed database. Transactions snapshot the matches table; rollback
/// restores the snapshot.
#[derive(Debug, Default)]
pub struct MemoryDatabase {
    pub(crate) data: DatabaseData,
    snapshot: Option<BTreeMap<PairId, FeatureMatches>>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn from_data(data: DatabaseData) -> Self {
        Self {
            data,
            snapshot: None,
        }
    }

    pub fn add_camera(&mut self, camera: Camera) {
        self.data.cameras.insert(camera.camera_id, camera);
    }

    pub fn add_image(&mut self, image: Image) {
        self.data.images.insert(image.image_id, image);
    }

    pub fn add_descriptors(&mut self, image_id: ImageId, descriptors: FeatureDescriptors) {
        self.data.descriptors.insert(image_id, descriptors);
    }

    pub fn num_matched_pairs(&self) -> usize {
        self.data.matches.len()
    }

    pub(crate) fn in_transaction(&self) -> bool {
        self.snapshot.is_some()
    }
}

impl Database for MemoryDatabase {
    fn read_all_cameras(&self) -> Result<Vec<Camera>, DatabaseError> {
        Ok(self.data.cameras.values().cloned().collect())
    }

    fn read_all_images(&self) -> Result<Vec<Image>, DatabaseError> {
        Ok(self.data.images.values().cloned().collect())
    }

    fn read_descriptors(&self, image_id: ImageId) -> Result<FeatureDescriptors, DatabaseError> {
        self.data
            .descriptors
            .get(&image_id)
            .cloned()
            .ok_or(DatabaseError::NotFound {
                what: "descriptors for image",
                id: image_id as u64,
            })
    }

    fn read_matches(
        &self,
        image_id1: ImageId,
        image_id2: ImageId,
    ) -> Result<FeatureMatches, DatabaseError> {
        let pair_id = pair_id_from_image_pair(image_id1, image_id2);
        self.data
            .matches
            .get(&pair_id)
            .cloned()
            .ok_or(DatabaseError::NotFound {
                what: "matches for pair",
                id: pair_id,
            })
    }

    fn exists_matches(
        &self,
        image_id1: ImageId,
        image_id2: ImageId,
    ) -> Result<bool, DatabaseError> {
        Ok(self
            .data
            .matches
            .contains_key(&pair_id_from_image_pair(image_id1, image_id2)))
    }

    fn write_matches(
        &mut self,
        image_id1: ImageId,
        image_id2: ImageId,
        matches: &FeatureMatches,
    ) -> Result<(), DatabaseError> {
        if image_id1 == image_id2 {
            return Err(DatabaseError::Corrupt(format!(
                "refusing to store self-pair matches for image {image_id1}"
            )));
        }
        self.data
            .matches
            .insert(pair_id_from_image_pair(image_id1, image_id2), matches.clone());
        Ok(())
    }

    fn delete_matches(
        &mut self,
        image_id1: ImageId,
        image_id2: ImageId,
    ) -> Result<(), DatabaseError> {
        self.data
            .matches
            .remove(&pair_id_from_image_pair(image_id1, image_id2));
        Ok(())
    }

    fn read_num_matches(&self) -> Result<Vec<(PairId, usize)>, DatabaseError> {
        Ok(self
            .data
            .matches
            .iter()
            .map(|(pair_id, matches)| (*pair_id, matches.len()))
            .collect())
    }

    fn max_num_descriptors(&self) -> Result<usize, DatabaseError> {
        Ok(self
            .data
            .descriptors
            .values()
            .map(|d| d.nrows())
            .max()
            .unwrap_or(0))
    }

    fn begin_transaction(&mut self) -> Result<(), DatabaseError> {
        if self.snapshot.is_some() {
            return Err(DatabaseError::Corrupt(
                "nested transactions are not supported".to_string(),
            ));
        }
        self.snapshot = Some(self.data.matches.clone());
        Ok(())
    }

    fn commit_transaction(&mut self) -> Result<(), DatabaseError> {
        if self.snapshot.take().is_none() {
            return Err(DatabaseError::Corrupt("commit without transaction".to_string()));
        }
        Ok(())
    }

    fn rollback_transaction(&mut self) -> Result<(), DatabaseError> {
        match self.snapshot.take() {
            Some(matches) => {
                self.data.matches = matches;
                Ok(())
            }
            None => Err(DatabaseError::Corrupt(
                "rollback without transaction".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use nalgebra::DMatrix;

    use super::*;
    use crate::database::types::FeatureMatch;

    fn sample_matches() -> FeatureMatches {
        vec![FeatureMatch { idx1: 3, idx2: 5 }]
    }

    #[test]
    fn test_matches_roundtrip() {
        let mut db = MemoryDatabase::new();
        db.write_matches(1, 2, &sample_matches()).unwrap();

        assert!(db.exists_matches(1, 2).unwrap());
        assert!(db.exists_matches(2, 1).unwrap());
        assert_eq!(db.read_matches(2, 1).unwrap(), sample_matches());

        db.delete_matches(1, 2).unwrap();
        assert!(!db.exists_matches(1, 2).unwrap());
    }

    #[test]
    fn test_self_pair_rejected() {
        let mut db = MemoryDatabase::new();
        assert!(db.write_matches(4, 4, &sample_matches()).is_err());
    }

    #[test]
    fn test_max_num_descriptors() {
        let mut db = MemoryDatabase::new();
        assert_eq!(db.max_num_descriptors().unwrap(), 0);

        db.add_descriptors(1, DMatrix::zeros(10, 128));
        db.add_descriptors(2, DMatrix::zeros(25, 128));
        assert_eq!(db.max_num_descriptors().unwrap(), 25);
    }

    #[test]
    fn test_rollback_restores_matches() {
        let mut db = MemoryDatabase::new();
        db.write_matches(1, 2, &sample_matches()).unwrap();

        db.begin_transaction().unwrap();
        db.write_matches(1, 3, &sample_matches()).unwrap();
        db.delete_matches(1, 2).unwrap();
        db.rollback_transaction().unwrap();

        assert!(db.exists_matches(1, 2).unwrap());
        assert!(!db.exists_matches(1, 3).unwrap());
    }

    #[test]
    fn test_nested_transaction_rejected() {
        let mut db = MemoryDatabase::new();
        db.begin_transaction().unwrap();
        assert!(db.begin_transaction().is_err());
    }
}
