//! Data model: annotations, classes, images and projects.

mod annotation;
mod class;
mod handles;
mod image;
mod project;

pub use annotation::{
    Annotation, AnnotationId, AnnotationShape, ClassId, Keypoint, Visibility, oriented_corners,
    oriented_frame, polygon_area, polygon_contains,
};
pub use class::{
    ClassDef, ClassList, ResolvedClass, Skeleton, UNKNOWN_CLASS_COLOR, UNKNOWN_CLASS_NAME,
    default_class_color,
};
pub use handles::{Corner, Edge, Handle};
pub use image::{
    ImageId, ImageRecord, IntegrityIssue, LoadedAnnotations, SCHEMA_VERSION, load_annotations,
    now_millis,
};
pub use project::{ClassDeletion, Project};
