//! Image records and lenient loading of their annotation documents.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use web_time::{SystemTime, UNIX_EPOCH};

use crate::error::SchemaError;

use super::annotation::{Annotation, AnnotationId, ClassId};
use super::class::ClassList;

/// Identifier of an image within a project.
pub type ImageId = u64;

/// Current version of the annotation document format.
pub const SCHEMA_VERSION: u32 = 1;

/// A recoverable data-integrity problem found while loading or checking
/// annotations.
#[derive(Debug, Clone, PartialEq)]
pub enum IntegrityIssue {
    /// Annotation references a class that does not exist; it is kept and
    /// rendered as the unknown class
    DanglingClass {
        annotation_id: AnnotationId,
        class_id: ClassId,
    },
    /// A record could not be read and was skipped
    CorruptRecord { index: usize, message: String },
    /// A record reused an id already seen in the same document; skipped
    DuplicateId { annotation_id: AnnotationId },
}

impl std::fmt::Display for IntegrityIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IntegrityIssue::DanglingClass {
                annotation_id,
                class_id,
            } => write!(
                f,
                "annotation {} references missing class {}",
                annotation_id, class_id
            ),
            IntegrityIssue::CorruptRecord { index, message } => {
                write!(f, "record {} skipped: {}", index, message)
            }
            IntegrityIssue::DuplicateId { annotation_id } => {
                write!(f, "duplicate annotation id {} skipped", annotation_id)
            }
        }
    }
}

/// Annotations recovered from a document, plus what went wrong on the way.
#[derive(Debug, Clone, Default)]
pub struct LoadedAnnotations {
    pub annotations: Vec<Annotation>,
    pub issues: Vec<IntegrityIssue>,
}

/// Versioned on-disk wrapper around an annotation list.
#[derive(Debug, Serialize)]
struct AnnotationDocument<'a> {
    version: u32,
    annotations: &'a [Annotation],
}

/// One image of a project with its annotations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageRecord {
    pub id: ImageId,
    /// Original encoded pixels. Stored separately by the persistence layer.
    #[serde(skip)]
    pub blob: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Display-only view rotation in degrees; never applied to pixels
    #[serde(default)]
    pub rotation: f32,
    #[serde(default)]
    pub annotations: Vec<Annotation>,
    /// Milliseconds since the Unix epoch of the last modification
    #[serde(default)]
    pub timestamp: u64,
}

/// Current time in milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl ImageRecord {
    pub fn new(id: ImageId, blob: Vec<u8>, width: u32, height: u32) -> Self {
        Self {
            id,
            blob,
            width,
            height,
            rotation: 0.0,
            annotations: Vec::new(),
            timestamp: now_millis(),
        }
    }

    pub fn touch(&mut self) {
        self.timestamp = now_millis();
    }

    /// Number of annotations assigned to `class_id`.
    pub fn count_class(&self, class_id: ClassId) -> usize {
        self.annotations
            .iter()
            .filter(|a| a.class_id == class_id)
            .count()
    }

    /// Drop every annotation of `class_id`. Returns how many were removed.
    pub fn remove_class(&mut self, class_id: ClassId) -> usize {
        let before = self.annotations.len();
        self.annotations.retain(|a| a.class_id != class_id);
        let removed = before - self.annotations.len();
        if removed > 0 {
            self.touch();
        }
        removed
    }

    /// Report dangling class references. Nothing is modified.
    pub fn integrity_issues(&self, classes: &ClassList) -> Vec<IntegrityIssue> {
        self.annotations
            .iter()
            .filter(|a| !classes.contains(a.class_id))
            .map(|a| IntegrityIssue::DanglingClass {
                annotation_id: a.id,
                class_id: a.class_id,
            })
            .collect()
    }

    /// Serialize the annotations as a versioned document.
    pub fn annotations_to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&AnnotationDocument {
            version: SCHEMA_VERSION,
            annotations: &self.annotations,
        })
    }

    /// Replace the annotations from a document, recovering every readable
    /// record. See [`load_annotations`].
    pub fn annotations_from_json(
        &mut self,
        json: &str,
        classes: &ClassList,
    ) -> Result<Vec<IntegrityIssue>, SchemaError> {
        let loaded = load_annotations(json, classes)?;
        self.annotations = loaded.annotations;
        Ok(loaded.issues)
    }
}

/// Parse an annotation document leniently.
///
/// Accepts either a bare array of records or `{"version", "annotations"}`.
/// Records with a corrupt shape or a duplicate id are skipped; records with a
/// dangling class are kept. Only an unreadable document as a whole is an
/// error.
pub fn load_annotations(json: &str, classes: &ClassList) -> Result<LoadedAnnotations, SchemaError> {
    let document: serde_json::Value = serde_json::from_str(json)?;
    let records = match document {
        serde_json::Value::Array(records) => records,
        serde_json::Value::Object(mut map) => {
            if let Some(version) = map.get("version").and_then(serde_json::Value::as_u64) {
                if version > u64::from(SCHEMA_VERSION) {
                    return Err(SchemaError::UnsupportedVersion {
                        found: version as u32,
                        supported: SCHEMA_VERSION,
                    });
                }
            }
            match map.remove("annotations") {
                Some(serde_json::Value::Array(records)) => records,
                _ => return Err(SchemaError::NotAnArray),
            }
        }
        _ => return Err(SchemaError::NotAnArray),
    };

    let mut loaded = LoadedAnnotations::default();
    let mut seen: HashSet<AnnotationId> = HashSet::new();
    for (index, record) in records.into_iter().enumerate() {
        let annotation = match serde_json::from_value::<Annotation>(record) {
            Ok(annotation) => annotation,
            Err(e) => {
                log::warn!("Skipping corrupt annotation record {}: {}", index, e);
                loaded.issues.push(IntegrityIssue::CorruptRecord {
                    index,
                    message: e.to_string(),
                });
                continue;
            }
        };
        if !seen.insert(annotation.id) {
            log::warn!("Skipping duplicate annotation id {}", annotation.id);
            loaded.issues.push(IntegrityIssue::DuplicateId {
                annotation_id: annotation.id,
            });
            continue;
        }
        if !classes.contains(annotation.class_id) {
            log::warn!(
                "Annotation {} references missing class {}; keeping as unknown",
                annotation.id,
                annotation.class_id
            );
            loaded.issues.push(IntegrityIssue::DanglingClass {
                annotation_id: annotation.id,
                class_id: annotation.class_id,
            });
        }
        loaded.annotations.push(annotation.normalized_shape());
    }
    Ok(loaded)
}

impl Annotation {
    fn normalized_shape(mut self) -> Self {
        self.shape = self.shape.normalized();
        self
    }
}
