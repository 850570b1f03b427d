//! Error types for editing, augmentation, configuration and loading.
//!
//! Data-integrity problems (dangling class references, corrupt records on
//! load) are reported as [`crate::model::IntegrityIssue`] values, not here.

use std::path::PathBuf;

use thiserror::Error;

use crate::model::{AnnotationId, ClassId, ImageId};

/// Errors produced when an edit is refused by the annotation store or a tool.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EditError {
    /// Geometry too small or malformed to be stored
    #[error("Degenerate {shape}: {reason}")]
    Degenerate {
        /// The shape kind that was rejected
        shape: &'static str,
        /// Why it was rejected
        reason: String,
    },

    /// A mask commit with no painted pixels
    #[error("Mask has no painted pixels")]
    EmptyMask,

    /// No annotation with this id in the store
    #[error("Annotation not found: {0}")]
    NotFound(AnnotationId),

    /// Keypoint tool used with a class that has no skeleton
    #[error("Class {0} has no skeleton definition")]
    NoSkeleton(ClassId),

    /// Class definition with a malformed skeleton
    #[error("Class {class_id} has an invalid skeleton: {reason}")]
    InvalidSkeleton {
        /// The refused class
        class_id: ClassId,
        /// What is wrong with the skeleton
        reason: String,
    },

    /// Keypoint count does not match the class skeleton
    #[error("Keypoint count {found} does not match skeleton joint count {expected}")]
    SkeletonMismatch {
        /// Joints in the skeleton
        expected: usize,
        /// Keypoints supplied
        found: usize,
    },
}

impl EditError {
    /// Create a degenerate-geometry error.
    pub fn degenerate(shape: &'static str, reason: impl Into<String>) -> Self {
        Self::Degenerate {
            shape,
            reason: reason.into(),
        }
    }
}

/// Errors produced by the augmentation engine and the batch runner.
#[derive(Error, Debug)]
pub enum AugmentError {
    /// Source image bytes could not be decoded
    #[error("Failed to decode source image: {0}")]
    Decode(#[source] image::ImageError),

    /// Output image could not be encoded
    #[error("Failed to encode augmented image: {0}")]
    Encode(#[source] image::ImageError),

    /// Configuration values outside their accepted range
    #[error("Invalid augmentation config: {0}")]
    InvalidConfig(String),

    /// A job for this image is already in flight
    #[error("Augmentation already running for image {image_id}")]
    Busy {
        /// The image that is already being processed
        image_id: ImageId,
    },

    /// The background worker could not be started or has gone away
    #[error("Augmentation worker unavailable: {0}")]
    WorkerUnavailable(String),
}

/// Errors that can occur while loading or saving configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The file was written by a newer version of the engine
    #[error("Config version {file_version} is newer than supported version {supported_version}")]
    VersionTooNew {
        /// Version found in the file
        file_version: u32,
        /// Highest version this build understands
        supported_version: u32,
    },

    /// A value is outside its accepted range
    #[error("Invalid config value: {0}")]
    Invalid(String),
}

/// Errors that make an annotation document unreadable as a whole.
#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Expected a JSON array of annotation records")]
    NotAnArray,

    /// Document written by a newer schema version
    #[error("Unsupported schema version {found} (supported up to {supported})")]
    UnsupportedVersion {
        /// Version in the document
        found: u32,
        /// Highest supported version
        supported: u32,
    },
}

/// Errors reported by persistence sinks driven from the session.
#[derive(Error, Debug)]
pub enum PersistError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors from mask raster import/export.
#[derive(Error, Debug)]
pub enum MaskIoError {
    #[error("NumPy read error: {0}")]
    Read(#[from] ndarray_npy::ReadNpyError),

    #[error("NumPy write error: {0}")]
    Write(#[from] ndarray_npy::WriteNpyError),

    /// Region does not fit inside the declared image
    #[error("Invalid mask region: {0}")]
    Region(String),
}

/// Errors surfaced by the command-line interface.
#[derive(Error, Debug)]
pub enum CliError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Annotation document {path} is unreadable: {source}")]
    Schema {
        path: PathBuf,
        #[source]
        source: SchemaError,
    },

    #[error(transparent)]
    Augment(#[from] AugmentError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
