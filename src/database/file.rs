//! File-backed database: a JSON snapshot loaded at open and rewritten
//! atomically on commit.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use tracing::debug;

use super::memory::{DatabaseData, MemoryDatabase};
use super::types::{
    Camera, FeatureDescriptors, FeatureMatches, Image, ImageId, PairId,
};
use super::{Database, DatabaseError};

/// Database persisted as a single JSON file.
///
/// All operations run against an in-memory copy. Commit rewrites the file
/// through a temporary sibling and an atomic rename, so a crash inside a
/// transaction leaves the previous snapshot intact and loses only the
/// uncommitted batch. Writes issued outside a transaction are flushed
/// immediately.
pub struct FileDatabase {
    path: PathBuf,
    inner: MemoryDatabase,
}

impl FileDatabase {
    /// Open the database at `path`, creating an empty one if the file does
    /// not exist yet.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, DatabaseError> {
        let path = path.as_ref().to_path_buf();
        let inner = if path.exists() {
            let file = File::open(&path)?;
            let data: DatabaseData = serde_json::from_reader(BufReader::new(file))
                .map_err(|e| DatabaseError::Corrupt(format!("{}: {e}", path.display())))?;
            debug!(
                "Opened database {} ({} images, {} matched pairs)",
                path.display(),
                data.images.len(),
                data.matches.len()
            );
            MemoryDatabase::from_data(data)
        } else {
            MemoryDatabase::new()
        };
        Ok(Self { path, inner })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn add_camera(&mut self, camera: Camera) {
        self.inner.add_camera(camera);
    }

    pub fn add_image(&mut self, image: Image) {
        self.inner.add_image(image);
    }

    pub fn add_descriptors(&mut self, image_id: ImageId, descriptors: FeatureDescriptors) {
        self.inner.add_descriptors(image_id, descriptors);
    }

    /// Persist the current contents to disk.
    pub fn flush(&self) -> Result<(), DatabaseError> {
        let tmp_path = self.path.with_extension("tmp");
        let file = File::create(&tmp_path)?;
        serde_json::to_writer(BufWriter::new(file), &self.inner.data)
            .map_err(|e| DatabaseError::Corrupt(format!("{}: {e}", tmp_path.display())))?;
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

impl Database for FileDatabase {
    fn read_all_cameras(&self) -> Result<Vec<Camera>, DatabaseError> {
        self.inner.read_all_cameras()
    }

    fn read_all_images(&self) -> Result<Vec<Image>, DatabaseError> {
        self.inner.read_all_images()
    }

    fn read_descriptors(&self, image_id: ImageId) -> Result<FeatureDescriptors, DatabaseError> {
        self.inner.read_descriptors(image_id)
    }

    fn read_matches(
        &self,
        image_id1: ImageId,
        image_id2: ImageId,
    ) -> Result<FeatureMatches, DatabaseError> {
        self.inner.read_matches(image_id1, image_id2)
    }

    fn exists_matches(
        &self,
        image_id1: ImageId,
        image_id2: ImageId,
    ) -> Result<bool, DatabaseError> {
        self.inner.exists_matches(image_id1, image_id2)
    }

    fn write_matches(
        &mut self,
        image_id1: ImageId,
        image_id2: ImageId,
        matches: &FeatureMatches,
    ) -> Result<(), DatabaseError> {
        self.inner.write_matches(image_id1, image_id2, matches)?;
        if !self.inner.in_transaction() {
            self.flush()?;
        }
        Ok(())
    }

    fn delete_matches(
        &mut self,
        image_id1: ImageId,
        image_id2: ImageId,
    ) -> Result<(), DatabaseError> {
        self.inner.delete_matches(image_id1, image_id2)?;
        if !self.inner.in_transaction() {
            self.flush()?;
        }
        Ok(())
    }

    fn read_num_matches(&self) -> Result<Vec<(PairId, usize)>, DatabaseError> {
        self.inner.read_num_matches()
    }

    fn max_num_descriptors(&self) -> Result<usize, DatabaseError> {
        self.inner.max_num_descriptors()
    }

    fn begin_transaction(&mut self) -> Result<(), DatabaseError> {
        self.inner.begin_transaction()
    }

    fn commit_transaction(&mut self) -> Result<(), DatabaseError> {
        self.inner.commit_transaction()?;
        self.flush()
    }

    fn rollback_transaction(&mut self) -> Result<(), DatabaseError> {
        self.inner.rollback_transaction()
    }
}

#[cfg(test)]
mod tests {
    use nalgebra::Vector3;

    use super::*;
    use crate::database::types::FeatureMatch;

    fn sample_image(image_id: ImageId, name: &str) -> Image {
        Image {
            image_id,
            camera_id: 1,
            name: name.to_string(),
            tvec_prior: Vector3::zeros(),
        }
    }

    #[test]
    fn test_open_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let db = FileDatabase::open(dir.path().join("db.json")).unwrap();
        assert_eq!(db.read_all_images().unwrap().len(), 0);
    }

    #[test]
    fn test_committed_writes_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.json");

        let mut db = FileDatabase::open(&path).unwrap();
        db.add_image(sample_image(1, "a.jpg"));
        db.add_image(sample_image(2, "b.jpg"));
        db.begin_transaction().unwrap();
        db.write_matches(1, 2, &vec![FeatureMatch { idx1: 0, idx2: 0 }])
            .unwrap();
        db.commit_transaction().unwrap();
        drop(db);

        let reopened = FileDatabase::open(&path).unwrap();
        assert_eq!(reopened.read_all_images().unwrap().len(), 2);
        assert!(reopened.exists_matches(1, 2).unwrap());
    }

    #[test]
    fn test_uncommitted_writes_do_not_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.json");

        let mut db = FileDatabase::open(&path).unwrap();
        db.add_image(sample_image(1, "a.jpg"));
        db.add_image(sample_image(2, "b.jpg"));
        db.flush().unwrap();
        db.begin_transaction().unwrap();
        db.write_matches(1, 2, &vec![FeatureMatch { idx1: 0, idx2: 0 }])
            .unwrap();
        // No commit: simulates a crash inside the transaction.
        drop(db);

        let reopened = FileDatabase::open(&path).unwrap();
        assert!(!reopened.exists_matches(1, 2).unwrap());
    }

    #[test]
    fn test_write_outside_transaction_flushes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.json");

        let mut db = FileDatabase::open(&path).unwrap();
        db.write_matches(1, 2, &vec![FeatureMatch { idx1: 0, idx2: 0 }])
            .unwrap();
        drop(db);

        let reopened = FileDatabase::open(&path).unwrap();
        assert!(reopened.exists_matches(1, 2).unwrap());
    }
}
