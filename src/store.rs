//! In-memory annotation store for the currently open image.
//!
//! Annotations live in a map ordered by id. Ids are handed out in
//! increasing order and never reused, so id order is creation order and
//! also z-order: later annotations draw on top and win hit tests.

use std::collections::BTreeMap;
use std::sync::mpsc::{Receiver, Sender, channel};

use crate::constants::{DEFAULT_MIN_BOX_SIZE, DEFAULT_UNDO_HISTORY};
use crate::error::EditError;
use crate::geometry::Point;
use crate::history::{Command, UndoStack};
use crate::model::{Annotation, AnnotationId, AnnotationShape, ClassId};

/// Notification emitted after every observable change to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeEvent {
    Added(AnnotationId),
    Updated(AnnotationId),
    Removed(AnnotationId),
    /// Many annotations changed at once; re-read everything
    Reset,
    SelectionChanged(Option<AnnotationId>),
    HistoryChanged { can_undo: bool, can_redo: bool },
}

/// Partial update for [`AnnotationStore::update`]. `None` fields are left
/// unchanged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnnotationPatch {
    pub class_id: Option<ClassId>,
    pub shape: Option<AnnotationShape>,
}

impl AnnotationPatch {
    pub fn class(class_id: ClassId) -> Self {
        Self {
            class_id: Some(class_id),
            shape: None,
        }
    }

    pub fn shape(shape: AnnotationShape) -> Self {
        Self {
            class_id: None,
            shape: Some(shape),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.class_id.is_none() && self.shape.is_none()
    }
}

/// Annotations of one image, with selection and bounded undo history.
#[derive(Debug)]
pub struct AnnotationStore {
    annotations: BTreeMap<AnnotationId, Annotation>,
    next_id: AnnotationId,
    selected_id: Option<AnnotationId>,
    history: UndoStack,
    min_box_size: f32,
    subscribers: Vec<Sender<ChangeEvent>>,
    /// Set on every change; cleared by the persistence layer after saving
    dirty: bool,
    /// Incremented on every change to geometry or classes
    revision: u64,
}

impl Default for AnnotationStore {
    fn default() -> Self {
        Self::new(DEFAULT_UNDO_HISTORY)
    }
}

impl AnnotationStore {
    pub fn new(max_history: usize) -> Self {
        Self {
            annotations: BTreeMap::new(),
            next_id: 1,
            selected_id: None,
            history: UndoStack::new(max_history),
            min_box_size: DEFAULT_MIN_BOX_SIZE,
            subscribers: Vec::new(),
            dirty: false,
            revision: 0,
        }
    }

    /// Build a store from loaded annotations. The id counter continues
    /// after the highest existing id.
    pub fn from_annotations(annotations: Vec<Annotation>, max_history: usize) -> Self {
        let mut store = Self::new(max_history);
        for mut annotation in annotations {
            store.next_id = store.next_id.max(annotation.id + 1);
            annotation.shape = annotation.shape.normalized();
            store.annotations.insert(annotation.id, annotation);
        }
        store
    }

    pub fn set_min_box_size(&mut self, min_box_size: f32) {
        self.min_box_size = min_box_size;
    }

    pub fn min_box_size(&self) -> f32 {
        self.min_box_size
    }

    pub fn set_max_history(&mut self, max_history: usize) {
        self.history.set_max_history(max_history);
        self.emit_history();
    }

    /// Register for change notifications. Dropped receivers are pruned on
    /// the next emitted event.
    pub fn subscribe(&mut self) -> Receiver<ChangeEvent> {
        let (tx, rx) = channel();
        self.subscribers.push(tx);
        rx
    }

    fn emit(&mut self, event: ChangeEvent) {
        self.subscribers.retain(|tx| tx.send(event).is_ok());
    }

    fn emit_history(&mut self) {
        let event = ChangeEvent::HistoryChanged {
            can_undo: self.history.can_undo(),
            can_redo: self.history.can_redo(),
        };
        self.emit(event);
    }

    fn touch(&mut self) {
        self.dirty = true;
        self.revision = self.revision.wrapping_add(1);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    fn record(&mut self, command: Command) {
        self.history.push(command);
        self.emit_history();
    }

    /// Validate and insert a new annotation. Degenerate geometry is refused
    /// and never stored.
    pub fn add(&mut self, class_id: ClassId, shape: AnnotationShape) -> Result<AnnotationId, EditError> {
        let shape = shape.normalized();
        shape.validate(self.min_box_size)?;
        let id = self.next_id;
        self.next_id += 1;
        let annotation = Annotation::new(id, class_id, shape);
        log::debug!("Added {} {} (class {})", annotation.shape.kind_name(), id, class_id);
        self.put(annotation.clone());
        self.record(Command::Add { annotation });
        Ok(id)
    }

    /// Apply a patch. Geometry is validated; a refused patch leaves the
    /// annotation untouched.
    pub fn update(&mut self, id: AnnotationId, patch: AnnotationPatch) -> Result<(), EditError> {
        let before = self.annotations.get(&id).cloned().ok_or(EditError::NotFound(id))?;
        let mut after = before.clone();
        if let Some(class_id) = patch.class_id {
            after.class_id = class_id;
        }
        if let Some(shape) = patch.shape {
            let shape = shape.normalized();
            shape.validate(self.min_box_size)?;
            after.shape = shape;
        }
        if after == before {
            return Ok(());
        }
        self.put(after.clone());
        self.record(Command::Modify { before, after });
        Ok(())
    }

    /// Delete an annotation. A mask's raster is dropped with it.
    pub fn remove(&mut self, id: AnnotationId) -> Result<Annotation, EditError> {
        let annotation = self.take(id).ok_or(EditError::NotFound(id))?;
        if annotation.shape.is_mask() {
            log::debug!("Released mask raster of annotation {}", id);
        }
        self.record(Command::Remove {
            annotation: annotation.clone(),
        });
        Ok(annotation)
    }

    /// Replace an annotation's shape without validation or history. Used
    /// for live drag feedback; finish with [`Self::commit_modification`].
    pub fn preview_shape(&mut self, id: AnnotationId, shape: AnnotationShape) -> Result<(), EditError> {
        let annotation = self.annotations.get_mut(&id).ok_or(EditError::NotFound(id))?;
        if annotation.shape == shape {
            return Ok(());
        }
        annotation.shape = shape;
        self.touch();
        self.emit(ChangeEvent::Updated(id));
        Ok(())
    }

    /// Finish a live edit that started from `before`. Records one undo
    /// step if anything changed. Invalid final geometry restores `before`
    /// and is reported as an error. Returns whether a change was recorded.
    pub fn commit_modification(&mut self, before: Annotation) -> Result<bool, EditError> {
        let id = before.id;
        let current = self.annotations.get(&id).cloned().ok_or(EditError::NotFound(id))?;
        if current == before {
            return Ok(false);
        }
        let mut after = current;
        after.shape = after.shape.normalized();
        if let Err(e) = after.shape.validate(self.min_box_size) {
            log::debug!("Edit of {} refused ({}); restoring", id, e);
            self.put(before);
            return Err(e);
        }
        self.put(after.clone());
        self.record(Command::Modify { before, after });
        Ok(true)
    }

    /// Abandon a live edit, restoring the annotation as it was.
    pub fn cancel_modification(&mut self, before: Annotation) {
        if self.annotations.get(&before.id) != Some(&before) {
            self.put(before);
        }
    }

    /// Remove every annotation of a class. Undo history is cleared because
    /// its commands may reference the deleted class.
    pub fn remove_class(&mut self, class_id: ClassId) -> usize {
        let before = self.annotations.len();
        self.annotations.retain(|_, a| a.class_id != class_id);
        let removed = before - self.annotations.len();
        if removed > 0 {
            if self
                .selected_id
                .is_some_and(|id| !self.annotations.contains_key(&id))
            {
                self.selected_id = None;
                self.emit(ChangeEvent::SelectionChanged(None));
            }
            self.history.clear();
            self.touch();
            self.emit(ChangeEvent::Reset);
            self.emit_history();
        }
        removed
    }

    fn put(&mut self, annotation: Annotation) {
        let id = annotation.id;
        debug_assert!(id < self.next_id, "annotation id {} was never issued", id);
        let existed = self.annotations.insert(id, annotation).is_some();
        self.touch();
        self.emit(if existed {
            ChangeEvent::Updated(id)
        } else {
            ChangeEvent::Added(id)
        });
    }

    fn take(&mut self, id: AnnotationId) -> Option<Annotation> {
        let annotation = self.annotations.remove(&id)?;
        if self.selected_id == Some(id) {
            self.selected_id = None;
            self.emit(ChangeEvent::SelectionChanged(None));
        }
        self.touch();
        self.emit(ChangeEvent::Removed(id));
        Some(annotation)
    }

    fn revert(&mut self, command: &Command) {
        match command {
            Command::Add { annotation } => {
                self.take(annotation.id);
            }
            Command::Remove { annotation } => self.put(annotation.clone()),
            Command::Modify { before, .. } => self.put(before.clone()),
        }
    }

    fn replay(&mut self, command: &Command) {
        match command {
            Command::Add { annotation } => self.put(annotation.clone()),
            Command::Remove { annotation } => {
                self.take(annotation.id);
            }
            Command::Modify { after, .. } => self.put(after.clone()),
        }
    }

    /// Undo the newest retained command. Returns false if there is none.
    pub fn undo(&mut self) -> bool {
        let Some(command) = self.history.pop_undo() else {
            return false;
        };
        self.revert(&command);
        self.emit_history();
        true
    }

    /// Redo the newest undone command. Returns false if there is none.
    pub fn redo(&mut self) -> bool {
        let Some(command) = self.history.pop_redo() else {
            return false;
        };
        self.replay(&command);
        self.emit_history();
        true
    }

    pub fn can_undo(&self) -> bool {
        self.history.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.history.can_redo()
    }

    pub fn history(&self) -> &UndoStack {
        &self.history
    }

    pub fn get(&self, id: AnnotationId) -> Option<&Annotation> {
        self.annotations.get(&id)
    }

    /// Annotations in z-order, bottom first.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Annotation> {
        self.annotations.values()
    }

    pub fn len(&self) -> usize {
        self.annotations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.annotations.is_empty()
    }

    /// Snapshot for persistence.
    pub fn to_vec(&self) -> Vec<Annotation> {
        self.annotations.values().cloned().collect()
    }

    /// Id the next added annotation will get.
    pub fn peek_next_id(&self) -> AnnotationId {
        self.next_id
    }

    pub fn select(&mut self, id: Option<AnnotationId>) {
        let id = id.filter(|id| self.annotations.contains_key(id));
        if self.selected_id != id {
            self.selected_id = id;
            self.emit(ChangeEvent::SelectionChanged(id));
        }
    }

    pub fn selected(&self) -> Option<AnnotationId> {
        self.selected_id
    }

    pub fn selected_annotation(&self) -> Option<&Annotation> {
        self.selected_id.and_then(|id| self.annotations.get(&id))
    }

    /// Topmost annotation under `point`. `point_radius` is the pick radius
    /// for keypoints, in image pixels.
    pub fn find_at(&self, point: Point, point_radius: f32) -> Option<AnnotationId> {
        self.hits(point, point_radius).next()
    }

    /// Every annotation under `point`, topmost first.
    pub fn hits_at(&self, point: Point, point_radius: f32) -> Vec<AnnotationId> {
        self.hits(point, point_radius).collect()
    }

    fn hits(&self, point: Point, point_radius: f32) -> impl Iterator<Item = AnnotationId> + '_ {
        self.annotations
            .values()
            .rev()
            .filter(move |a| {
                a.shape
                    .bounding_rect()
                    .is_some_and(|r| r.expanded(point_radius).contains(point))
            })
            .filter(move |a| a.shape.contains_point(point, point_radius))
            .map(|a| a.id)
    }
}
