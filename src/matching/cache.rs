//! Read-through cache between the matcher workers and the database.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, OnceLock};

use anyhow::Result;
use lru::LruCache;
use parking_lot::Mutex;

use crate::database::{
    Camera, CameraId, Database, FeatureDescriptors, FeatureMatches, Image, ImageId,
    SharedDatabase,
};

struct CacheTables {
    cameras: HashMap<CameraId, Camera>,
    images: HashMap<ImageId, Image>,
}

/// Concurrency-safe cache over the database.
///
/// Cameras and images are loaded eagerly at [`setup`](MatcherCache::setup)
/// and are immutable afterwards, so lookups take no lock. Descriptor blocks
/// are loaded lazily into an LRU bounded by the configured capacity. All
/// database traffic goes through the shared database mutex.
pub struct MatcherCache {
    database: SharedDatabase,
    tables: OnceLock<CacheTables>,
    descriptors: Mutex<LruCache<ImageId, Arc<FeatureDescriptors>>>,
}

impl MatcherCache {
    pub fn new(cache_size: usize, database: SharedDatabase) -> Self {
        let capacity = NonZeroUsize::new(cache_size.max(1)).expect("positive cache capacity");
        Self {
            database,
            tables: OnceLock::new(),
            descriptors: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Load the camera and image tables. Must be called before any lookup.
    pub fn setup(&self) -> Result<()> {
        let (cameras, images) = {
            let database = self.database.lock();
            (database.read_all_cameras()?, database.read_all_images()?)
        };

        let tables = CacheTables {
            cameras: cameras.into_iter().map(|c| (c.camera_id, c)).collect(),
            images: images.into_iter().map(|i| (i.image_id, i)).collect(),
        };
        // A second setup keeps the tables from the first.
        let _ = self.tables.set(tables);
        Ok(())
    }

    fn tables(&self) -> &CacheTables {
        self.tables.get().expect("cache used before setup")
    }

    /// Panics if the id is unknown; callers only pass ids obtained from
    /// [`get_image_ids`](MatcherCache::get_image_ids).
    pub fn get_camera(&self, camera_id: CameraId) -> &Camera {
        &self.tables().cameras[&camera_id]
    }

    /// Same contract as [`get_camera`](MatcherCache::get_camera).
    pub fn get_image(&self, image_id: ImageId) -> &Image {
        &self.tables().images[&image_id]
    }

    /// Sorted snapshot of all known image ids.
    pub fn get_image_ids(&self) -> Vec<ImageId> {
        let mut ids: Vec<ImageId> = self.tables().images.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn num_images(&self) -> usize {
        self.tables().images.len()
    }

    /// Shared read-only view of an image's descriptor block, loading it
    /// from the database on a cache miss (possibly evicting the least
    /// recently used block).
    pub fn get_descriptors(&self, image_id: ImageId) -> Result<Arc<FeatureDescriptors>> {
        let mut descriptors = self.descriptors.lock();
        if let Some(block) = descriptors.get(&image_id) {
            return Ok(Arc::clone(block));
        }

        let block = Arc::new(self.database.lock().read_descriptors(image_id)?);
        descriptors.put(image_id, Arc::clone(&block));
        Ok(block)
    }

    pub fn get_matches(&self, image_id1: ImageId, image_id2: ImageId) -> Result<FeatureMatches> {
        Ok(self.database.lock().read_matches(image_id1, image_id2)?)
    }

    pub fn exists_matches(&self, image_id1: ImageId, image_id2: ImageId) -> Result<bool> {
        Ok(self.database.lock().exists_matches(image_id1, image_id2)?)
    }

    pub fn write_matches(
        &self,
        image_id1: ImageId,
        image_id2: ImageId,
        matches: &FeatureMatches,
    ) -> Result<()> {
        Ok(self
            .database
            .lock()
            .write_matches(image_id1, image_id2, matches)?)
    }

    pub fn delete_matches(&self, image_id1: ImageId, image_id2: ImageId) -> Result<()> {
        Ok(self.database.lock().delete_matches(image_id1, image_id2)?)
    }

    #[cfg(test)]
    fn num_resident_descriptors(&self) -> usize {
        self.descriptors.lock().len()
    }
}
