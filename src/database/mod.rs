//! Database contract and implementations.
//!
//! The matching pipeline treats the database as an external collaborator
//! behind the [`Database`] trait: the feature extraction stage populates it,
//! the matching stage reads descriptors and writes putative matches. All
//! access is serialized through a single [`SharedDatabase`] mutex, held by
//! whoever currently talks to the store.

mod file;
mod memory;
pub mod types;

use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::error;

pub use file::FileDatabase;
pub use memory::MemoryDatabase;
pub use types::{
    image_pair_from_pair_id, pair_id_from_image_pair, Camera, CameraId, FeatureDescriptors,
    FeatureMatch, FeatureMatches, Image, ImageId, PairId, INVALID_IMAGE_ID,
};

/// Errors surfaced by database implementations.
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("{what} {id} not found")]
    NotFound { what: &'static str, id: u64 },

    #[error("database corrupt: {0}")]
    Corrupt(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// The storage contract consumed by the matching pipeline.
///
/// Implementations do not need to be internally synchronized; callers share
/// them as a [`SharedDatabase`] and lock around every operation.
pub trait Database: Send {
    fn read_all_cameras(&self) -> Result<Vec<Camera>, DatabaseError>;

    fn read_all_images(&self) -> Result<Vec<Image>, DatabaseError>;

    fn read_descriptors(&self, image_id: ImageId) -> Result<FeatureDescriptors, DatabaseError>;

    fn read_matches(
        &self,
        image_id1: ImageId,
        image_id2: ImageId,
    ) -> Result<FeatureMatches, DatabaseError>;

    fn exists_matches(&self, image_id1: ImageId, image_id2: ImageId)
        -> Result<bool, DatabaseError>;

    /// Persist the match set of an unordered image pair. The pair must not
    /// be a self pair; exactly one entry exists per unordered pair.
    fn write_matches(
        &mut self,
        image_id1: ImageId,
        image_id2: ImageId,
        matches: &FeatureMatches,
    ) -> Result<(), DatabaseError>;

    fn delete_matches(&mut self, image_id1: ImageId, image_id2: ImageId)
        -> Result<(), DatabaseError>;

    /// All matched pairs together with their match counts.
    fn read_num_matches(&self) -> Result<Vec<(PairId, usize)>, DatabaseError>;

    /// The largest descriptor count over all images, or zero if no
    /// descriptors are stored.
    fn max_num_descriptors(&self) -> Result<usize, DatabaseError>;

    fn begin_transaction(&mut self) -> Result<(), DatabaseError>;

    fn commit_transaction(&mut self) -> Result<(), DatabaseError>;

    fn rollback_transaction(&mut self) -> Result<(), DatabaseError>;
}

/// Shared handle to a database. The mutex is the single serialization point
/// for all database traffic in the pipeline.
pub type SharedDatabase = Arc<Mutex<dyn Database>>;

/// Wrap a concrete database into a [`SharedDatabase`].
pub fn shared<D: Database + 'static>(database: D) -> SharedDatabase {
    Arc::new(Mutex::new(database))
}

/// Scoped transaction guard.
///
/// Writes performed between [`DatabaseTransaction::begin`] and
/// [`DatabaseTransaction::commit`] become durable together. Dropping the
/// guard without committing rolls the transaction back.
pub struct DatabaseTransaction {
    database: SharedDatabase,
    committed: bool,
}

impl DatabaseTransaction {
    pub fn begin(database: &SharedDatabase) -> Result<Self, DatabaseError> {
        database.lock().begin_transaction()?;
        Ok(Self {
            database: Arc::clone(database),
            committed: false,
        })
    }

    pub fn commit(mut self) -> Result<(), DatabaseError> {
        self.database.lock().commit_transaction()?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for DatabaseTransaction {
    fn drop(&mut self) {
        if !self.committed {
            if let Err(e) = self.database.lock().rollback_transaction() {
                error!("Failed to roll back transaction: {e}");
            }
        }
    }
}
