//! annocanvas - annotation canvas and augmentation engine
//!
//! The editing core of an image labelling tool: annotation geometry and
//! classes, a view transform between canvas and image space, an annotation
//! store with bounded undo, a tool state machine for drawing and editing,
//! mask rasters, and an augmentation engine that transforms images together
//! with their annotations.

pub mod augment;
pub mod autosave;
pub mod batch;
pub mod cli;
pub mod config;
pub mod constants;
pub mod error;
pub mod geometry;
pub mod history;
pub mod mask;
pub mod model;
pub mod render;
pub mod session;
pub mod store;
pub mod tools;
pub mod view;

pub use augment::{AugmentConfig, AugmentOutput, GeometricPlan};
pub use config::{EngineConfig, LogLevel};
pub use error::{AugmentError, CliError, ConfigError, EditError, PersistError, SchemaError};
pub use geometry::{Point, Rect};
pub use model::{Annotation, AnnotationId, AnnotationShape, ClassDef, ClassList, ImageRecord, Project};
pub use session::{ProjectSink, Session};
pub use store::AnnotationStore;
pub use tools::{ToolKind, ToolStateMachine};
pub use view::ViewTransform;
