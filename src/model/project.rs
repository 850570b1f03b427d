//! Project-wide data: the shared class list and every image record.

use serde::{Deserialize, Serialize};

use super::annotation::ClassId;
use super::class::{ClassDef, ClassList};
use super::image::{ImageId, ImageRecord, IntegrityIssue};

/// Outcome of asking to delete a class.
#[derive(Debug, Clone, PartialEq)]
pub enum ClassDeletion {
    /// No annotation referenced the class; it is gone.
    Deleted(ClassDef),
    /// Annotations still reference the class. Nothing was changed; call
    /// [`Project::confirm_class_deletion`] to cascade.
    NeedsConfirmation {
        class_id: ClassId,
        annotation_count: usize,
        image_count: usize,
    },
    NotFound,
}

/// A project: classes shared by all of its images.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub classes: ClassList,
    #[serde(default)]
    pub images: Vec<ImageRecord>,
}

impl Project {
    pub fn new(classes: ClassList) -> Self {
        Self {
            classes,
            images: Vec::new(),
        }
    }

    pub fn image(&self, id: ImageId) -> Option<&ImageRecord> {
        self.images.iter().find(|image| image.id == id)
    }

    pub fn image_mut(&mut self, id: ImageId) -> Option<&mut ImageRecord> {
        self.images.iter_mut().find(|image| image.id == id)
    }

    /// Insert or replace an image record by id.
    pub fn upsert_image(&mut self, record: ImageRecord) {
        match self.image_mut(record.id) {
            Some(existing) => *existing = record,
            None => self.images.push(record),
        }
    }

    /// `(annotation_count, image_count)` referencing a class across the
    /// whole project.
    pub fn class_usage(&self, class_id: ClassId) -> (usize, usize) {
        self.images
            .iter()
            .map(|image| image.count_class(class_id))
            .filter(|&count| count > 0)
            .fold((0, 0), |(annotations, images), count| {
                (annotations + count, images + 1)
            })
    }

    /// Delete a class if nothing references it; otherwise report what a
    /// cascade would remove and leave the project untouched.
    pub fn request_class_deletion(&mut self, class_id: ClassId) -> ClassDeletion {
        if !self.classes.contains(class_id) {
            return ClassDeletion::NotFound;
        }
        let (annotation_count, image_count) = self.class_usage(class_id);
        if annotation_count > 0 {
            log::info!(
                "Class {} still used by {} annotation(s) in {} image(s); confirmation required",
                class_id,
                annotation_count,
                image_count
            );
            return ClassDeletion::NeedsConfirmation {
                class_id,
                annotation_count,
                image_count,
            };
        }
        match self.classes.remove(class_id) {
            Some(class) => {
                log::info!("Deleted unused class {} ({})", class.id, class.name);
                ClassDeletion::Deleted(class)
            }
            None => ClassDeletion::NotFound,
        }
    }

    /// Delete a class and every annotation referencing it in every image.
    /// Returns the number of annotations removed.
    pub fn confirm_class_deletion(&mut self, class_id: ClassId) -> usize {
        let removed: usize = self
            .images
            .iter_mut()
            .map(|image| image.remove_class(class_id))
            .sum();
        if self.classes.remove(class_id).is_some() {
            log::info!(
                "Deleted class {} and {} referencing annotation(s)",
                class_id,
                removed
            );
        }
        removed
    }

    /// Integrity problems across all images, keyed by image id.
    pub fn integrity_report(&self) -> Vec<(ImageId, IntegrityIssue)> {
        self.images
            .iter()
            .flat_map(|image| {
                image
                    .integrity_issues(&self.classes)
                    .into_iter()
                    .map(move |issue| (image.id, issue))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Annotation, AnnotationShape};

    fn boxed(id: u64, class_id: ClassId) -> Annotation {
        Annotation::new(
            id,
            class_id,
            AnnotationShape::BoundingBox {
                x: 0.0,
                y: 0.0,
                width: 5.0,
                height: 5.0,
            },
        )
    }

    fn project() -> Project {
        let mut project = Project::new(ClassList::from_classes(vec![
            ClassDef::new(1, "car"),
            ClassDef::new(2, "person"),
            ClassDef::new(3, "bike"),
        ]));
        let mut first = ImageRecord::new(10, Vec::new(), 100, 100);
        first.annotations = vec![boxed(1, 1), boxed(2, 2)];
        let mut second = ImageRecord::new(11, Vec::new(), 100, 100);
        second.annotations = vec![boxed(1, 1), boxed(2, 1), boxed(3, 2)];
        project.images = vec![first, second];
        project
    }

    #[test]
    fn test_unused_class_deletes_without_confirmation() {
        let mut project = project();
        let outcome = project.request_class_deletion(3);
        assert!(matches!(outcome, ClassDeletion::Deleted(ref c) if c.id == 3));
        assert!(!project.classes.contains(3));
    }

    #[test]
    fn test_used_class_requires_confirmation() {
        let mut project = project();
        assert_eq!(
            project.request_class_deletion(1),
            ClassDeletion::NeedsConfirmation {
                class_id: 1,
                annotation_count: 3,
                image_count: 2
            }
        );
        assert!(project.classes.contains(1));
        assert_eq!(project.class_usage(1), (3, 2));
    }

    #[test]
    fn test_confirmed_cascade_hits_every_image() {
        let mut project = project();
        assert_eq!(project.confirm_class_deletion(1), 3);
        assert!(!project.classes.contains(1));
        for image in &project.images {
            assert!(image.annotations.iter().all(|a| a.class_id != 1));
        }
        assert_eq!(project.image(10).unwrap().annotations.len(), 1);
        assert_eq!(project.image(11).unwrap().annotations.len(), 1);
    }

    #[test]
    fn test_missing_class() {
        let mut project = project();
        assert_eq!(project.request_class_deletion(42), ClassDeletion::NotFound);
    }

    #[test]
    fn test_integrity_report_flags_dangling() {
        let mut project = project();
        project.classes.remove(2);
        let report = project.integrity_report();
        assert_eq!(report.len(), 2);
        assert!(report.iter().all(|(_, issue)| matches!(
            issue,
            IntegrityIssue::DanglingClass { class_id: 2, .. }
        )));
    }
}
