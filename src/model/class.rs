//! Annotation classes and keypoint skeletons.

use serde::{Deserialize, Serialize};

use super::annotation::ClassId;
use crate::error::EditError;

/// Colour used to draw annotations whose class no longer exists.
pub const UNKNOWN_CLASS_COLOR: [u8; 3] = [128, 128, 128];

/// Display name for annotations whose class no longer exists.
pub const UNKNOWN_CLASS_NAME: &str = "unknown";

/// Joint topology shared by every keypoint instance of a class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Skeleton {
    /// Joint names, in keypoint order
    pub joints: Vec<String>,
    /// Connections between joints, as index pairs
    #[serde(default)]
    pub edges: Vec<(usize, usize)>,
}

impl Skeleton {
    pub fn new(joints: impl IntoIterator<Item = impl Into<String>>, edges: Vec<(usize, usize)>) -> Self {
        Self {
            joints: joints.into_iter().map(Into::into).collect(),
            edges,
        }
    }

    pub fn joint_count(&self) -> usize {
        self.joints.len()
    }

    /// Check that every edge references two distinct, existing joints.
    pub fn validate(&self) -> Result<(), String> {
        if self.joints.is_empty() {
            return Err("skeleton has no joints".to_string());
        }
        for &(a, b) in &self.edges {
            if a >= self.joints.len() || b >= self.joints.len() {
                return Err(format!(
                    "edge ({}, {}) references a joint outside 0..{}",
                    a,
                    b,
                    self.joints.len()
                ));
            }
            if a == b {
                return Err(format!("edge ({}, {}) connects a joint to itself", a, b));
            }
        }
        Ok(())
    }
}

/// An annotation class with a name, colour and optional skeleton.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassDef {
    pub id: ClassId,
    pub name: String,
    /// RGB colour for the class
    pub color: [u8; 3],
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skeleton: Option<Skeleton>,
}

impl ClassDef {
    /// Create a class with a colour derived from its id.
    pub fn new(id: ClassId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            color: default_class_color(id),
            skeleton: None,
        }
    }

    pub fn with_color(mut self, color: [u8; 3]) -> Self {
        self.color = color;
        self
    }

    pub fn with_skeleton(mut self, skeleton: Skeleton) -> Self {
        self.skeleton = Some(skeleton);
        self
    }

    pub fn validate(&self) -> Result<(), EditError> {
        match &self.skeleton {
            Some(skeleton) => skeleton.validate().map_err(|reason| EditError::InvalidSkeleton {
                class_id: self.id,
                reason,
            }),
            None => Ok(()),
        }
    }
}

/// Distinct colour per class id: golden-angle hue steps at fixed
/// saturation and value.
pub fn default_class_color(id: ClassId) -> [u8; 3] {
    let hue = (id as f32 * 137.508) % 360.0;
    let (s, v) = (0.65f32, 0.95f32);
    let chroma = v * s;
    let sector = hue / 60.0;
    let secondary = chroma * (1.0 - (sector % 2.0 - 1.0).abs());
    let (r, g, b) = match sector as u32 {
        0 => (chroma, secondary, 0.0),
        1 => (secondary, chroma, 0.0),
        2 => (0.0, chroma, secondary),
        3 => (0.0, secondary, chroma),
        4 => (secondary, 0.0, chroma),
        _ => (chroma, 0.0, secondary),
    };
    let m = v - chroma;
    let to_byte = |c: f32| ((c + m) * 255.0).round().clamp(0.0, 255.0) as u8;
    [to_byte(r), to_byte(g), to_byte(b)]
}

/// A class reference resolved against the current class list.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ResolvedClass<'a> {
    Known(&'a ClassDef),
    /// The id is dangling; render as the unknown class
    Unknown(ClassId),
}

impl ResolvedClass<'_> {
    pub fn name(&self) -> &str {
        match self {
            ResolvedClass::Known(class) => &class.name,
            ResolvedClass::Unknown(_) => UNKNOWN_CLASS_NAME,
        }
    }

    pub fn color(&self) -> [u8; 3] {
        match self {
            ResolvedClass::Known(class) => class.color,
            ResolvedClass::Unknown(_) => UNKNOWN_CLASS_COLOR,
        }
    }

    pub fn is_known(&self) -> bool {
        matches!(self, ResolvedClass::Known(_))
    }
}

/// The project's class list, shared by every image.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClassList {
    classes: Vec<ClassDef>,
}

impl ClassList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a list, skipping classes that fail validation.
    pub fn from_classes(classes: Vec<ClassDef>) -> Self {
        let mut list = Self::new();
        for class in classes {
            if let Err(e) = list.upsert(class) {
                log::warn!("Skipping class: {}", e);
            }
        }
        list
    }

    /// Insert a class, replacing any class with the same id. A class with
    /// a malformed skeleton is refused and the list is left unchanged.
    pub fn upsert(&mut self, class: ClassDef) -> Result<(), EditError> {
        class.validate()?;
        if let Some(existing) = self.classes.iter_mut().find(|c| c.id == class.id) {
            *existing = class;
        } else {
            self.classes.push(class);
        }
        Ok(())
    }

    pub fn remove(&mut self, id: ClassId) -> Option<ClassDef> {
        let index = self.classes.iter().position(|c| c.id == id)?;
        Some(self.classes.remove(index))
    }

    pub fn get(&self, id: ClassId) -> Option<&ClassDef> {
        self.classes.iter().find(|c| c.id == id)
    }

    pub fn contains(&self, id: ClassId) -> bool {
        self.get(id).is_some()
    }

    /// Resolve an id, degrading to [`ResolvedClass::Unknown`] when dangling.
    pub fn resolve(&self, id: ClassId) -> ResolvedClass<'_> {
        match self.get(id) {
            Some(class) => ResolvedClass::Known(class),
            None => ResolvedClass::Unknown(id),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &ClassDef> {
        self.classes.iter()
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// Smallest id greater than every existing id.
    pub fn next_id(&self) -> ClassId {
        self.classes.iter().map(|c| c.id + 1).max().unwrap_or(0)
    }
}
