//! Core identifiers and entities stored in the database.

use nalgebra::{DMatrix, Vector3};
use serde::{Deserialize, Serialize};

/// Unique identifier of an image.
pub type ImageId = u32;

/// Unique identifier of a camera.
pub type CameraId = u32;

/// Order-independent identifier of an unordered image pair.
pub type PairId = u64;

/// Sentinel for "no image".
pub const INVALID_IMAGE_ID: ImageId = u32::MAX;

/// Upper bound on image ids, chosen so that a pair id fits into 64 bits.
pub const MAX_NUM_IMAGES: u64 = i32::MAX as u64;

/// Encode an unordered image pair as a single id.
///
/// The encoding is symmetric: `pair_id_from_image_pair(a, b) ==
/// pair_id_from_image_pair(b, a)`, and distinct unordered pairs map to
/// distinct ids as long as both ids are below `MAX_NUM_IMAGES`.
pub fn pair_id_from_image_pair(image_id1: ImageId, image_id2: ImageId) -> PairId {
    let (lo, hi) = if image_id1 <= image_id2 {
        (image_id1, image_id2)
    } else {
        (image_id2, image_id1)
    };
    lo as u64 * MAX_NUM_IMAGES + hi as u64
}

/// Invert [`pair_id_from_image_pair`]. Returns `(smaller, larger)`.
pub fn image_pair_from_pair_id(pair_id: PairId) -> (ImageId, ImageId) {
    ((pair_id / MAX_NUM_IMAGES) as ImageId, (pair_id % MAX_NUM_IMAGES) as ImageId)
}

/// Camera intrinsics. Read-only for the matching pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Camera {
    pub camera_id: CameraId,
    /// Camera model name, e.g. "PINHOLE".
    pub model: String,
    pub width: u32,
    pub height: u32,
    /// Model-specific intrinsic parameters.
    pub params: Vec<f64>,
}

/// Image record. Read-only for the matching pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Image {
    pub image_id: ImageId,
    pub camera_id: CameraId,
    pub name: String,
    /// Prior position of the image, either Cartesian or geodetic
    /// (latitude, longitude, altitude). All-zero means "unset".
    pub tvec_prior: Vector3<f64>,
}

impl Image {
    /// Whether this image carries a usable prior position.
    ///
    /// With `ignore_z` only the first two components are checked, so an
    /// image at `(0, 0, z)` still counts as unset.
    pub fn has_location_prior(&self, ignore_z: bool) -> bool {
        if self.tvec_prior[0] != 0.0 || self.tvec_prior[1] != 0.0 {
            return true;
        }
        !ignore_z && self.tvec_prior[2] != 0.0
    }
}

/// Per-image descriptor block, one row per feature.
pub type FeatureDescriptors = DMatrix<u8>;

/// A correspondence between feature `idx1` in the first image and feature
/// `idx2` in the second image of a pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureMatch {
    pub idx1: u32,
    pub idx2: u32,
}

/// All putative matches of one image pair.
pub type FeatureMatches = Vec<FeatureMatch>;
