//! Editing session: the explicit context tying the project, the open
//! image's store, the active tool, the view and autosave together.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::mpsc::Receiver;

use web_time::Instant;

use crate::autosave::{AutoSaveManager, SaveReason};
use crate::config::{EditorSettings, EngineConfig};
use crate::error::{EditError, PersistError};
use crate::model::{ClassDef, ClassDeletion, ClassId, ClassList, ImageId, ImageRecord, Project};
use crate::render::{Overlay, build_overlay};
use crate::store::{AnnotationStore, ChangeEvent};
use crate::tools::{EditorContext, KeyCommand, PointerEvent, ToolKind, ToolOutcome, ToolStateMachine};
use crate::view::ViewTransform;

/// Where the session persists changes. Implemented by the storage layer.
pub trait ProjectSink {
    fn save_image(&mut self, record: &ImageRecord) -> Result<(), PersistError>;
    fn save_classes(&mut self, classes: &ClassList) -> Result<(), PersistError>;
}

/// Writes `classes.json` and one `<image id>.json` annotation document per
/// image into a directory.
#[derive(Debug, Clone)]
pub struct DirectorySink {
    root: PathBuf,
}

impl DirectorySink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn image_path(&self, id: ImageId) -> PathBuf {
        self.root.join(format!("{}.json", id))
    }

    pub fn classes_path(&self) -> PathBuf {
        self.root.join("classes.json")
    }
}

impl ProjectSink for DirectorySink {
    fn save_image(&mut self, record: &ImageRecord) -> Result<(), PersistError> {
        std::fs::create_dir_all(&self.root)?;
        std::fs::write(self.image_path(record.id), record.annotations_to_json()?)?;
        Ok(())
    }

    fn save_classes(&mut self, classes: &ClassList) -> Result<(), PersistError> {
        std::fs::create_dir_all(&self.root)?;
        std::fs::write(self.classes_path(), serde_json::to_string_pretty(classes)?)?;
        Ok(())
    }
}

/// The image currently being edited.
#[derive(Debug)]
struct OpenImage {
    id: ImageId,
    store: AnnotationStore,
    events: Receiver<ChangeEvent>,
}

pub struct Session {
    project: Project,
    open: Option<OpenImage>,
    tools: ToolStateMachine,
    view: ViewTransform,
    current_class: ClassId,
    settings: EditorSettings,
    autosave: AutoSaveManager,
    /// Images with changes not yet handed to a sink
    unsaved_images: BTreeSet<ImageId>,
    classes_unsaved: bool,
}

impl Session {
    pub fn new(project: Project, config: &EngineConfig) -> Self {
        let current_class = project.classes.iter().next().map(|c| c.id).unwrap_or(0);
        Self {
            project,
            open: None,
            tools: ToolStateMachine::new(config.editor.brush_size),
            view: ViewTransform::new(1, 1, 1.0, 1.0),
            current_class,
            settings: config.editor.clone(),
            autosave: AutoSaveManager::from_settings(&config.autosave),
            unsaved_images: BTreeSet::new(),
            classes_unsaved: false,
        }
    }

    pub fn project(&self) -> &Project {
        &self.project
    }

    pub fn settings(&self) -> &EditorSettings {
        &self.settings
    }

    pub fn view(&self) -> &ViewTransform {
        &self.view
    }

    pub fn tools(&self) -> &ToolStateMachine {
        &self.tools
    }

    pub fn autosave(&self) -> &AutoSaveManager {
        &self.autosave
    }

    pub fn open_image_id(&self) -> Option<ImageId> {
        self.open.as_ref().map(|open| open.id)
    }

    pub fn store(&self) -> Option<&AnnotationStore> {
        self.open.as_ref().map(|open| &open.store)
    }

    pub fn current_class(&self) -> ClassId {
        self.current_class
    }

    pub fn set_current_class(&mut self, class_id: ClassId) {
        if !self.project.classes.contains(class_id) {
            log::warn!("Selected class {} is not in the class list", class_id);
        }
        self.current_class = class_id;
    }

    /// Open an image for editing, writing the previously open one back to
    /// its record first. Returns false if the project has no such image.
    pub fn open_image(&mut self, id: ImageId, viewport_width: f32, viewport_height: f32) -> bool {
        if self.project.image(id).is_none() {
            log::warn!("Cannot open image {}: not in project", id);
            return false;
        }
        // the record must be read after the write-back, which may target it
        self.close_image();

        let Some(record) = self.project.image(id) else {
            return false;
        };
        let annotations = record.annotations.clone();
        let (width, height, rotation) = (record.width, record.height, record.rotation);
        for issue in record.integrity_issues(&self.project.classes) {
            log::warn!("Image {}: {}", id, issue);
        }

        let mut store = AnnotationStore::from_annotations(annotations, self.settings.undo_history);
        store.set_min_box_size(self.settings.min_box_size);
        let events = store.subscribe();
        self.open = Some(OpenImage { id, store, events });
        self.view = ViewTransform::new(width, height, viewport_width, viewport_height)
            .with_zoom_limits(self.settings.min_zoom, self.settings.max_zoom)
            .with_rotation(rotation)
            .fit_to_viewport();
        // working state such as a mask instance belongs to the old image
        self.dispatch(|tools, ctx| {
            let tool = tools.tool();
            tools.set_tool(tool, ctx)
        });
        log::info!("Opened image {} ({}x{})", id, width, height);
        true
    }

    /// Write the open image back to its record and close it.
    pub fn close_image(&mut self) {
        if self.open.is_none() {
            return;
        }
        self.dispatch(|tools, ctx| tools.cancel(ctx));
        self.write_back();
        if let Some(open) = self.open.take() {
            log::debug!("Closed image {}", open.id);
        }
    }

    /// Copy the open store's annotations and view rotation into the
    /// project record.
    fn write_back(&mut self) {
        self.pump_events();
        let Some(open) = self.open.as_mut() else {
            return;
        };
        let Some(record) = self.project.image_mut(open.id) else {
            log::error!("Open image {} vanished from the project", open.id);
            return;
        };
        if open.store.is_dirty() || record.rotation != self.view.rotation_degrees {
            record.annotations = open.store.to_vec();
            record.rotation = self.view.rotation_degrees;
            record.touch();
            open.store.clear_dirty();
            self.unsaved_images.insert(open.id);
        }
    }

    /// Drain store notifications into the autosave state.
    fn pump_events(&mut self) {
        let Some(open) = self.open.as_ref() else {
            return;
        };
        let changed = open.events.try_iter().fold(false, |changed, event| {
            changed
                || matches!(
                    event,
                    ChangeEvent::Added(_) | ChangeEvent::Updated(_) | ChangeEvent::Removed(_) | ChangeEvent::Reset
                )
        });
        if changed {
            self.unsaved_images.insert(open.id);
            self.autosave.mark_dirty();
        }
    }

    fn dispatch(
        &mut self,
        action: impl FnOnce(&mut ToolStateMachine, &mut EditorContext<'_>) -> ToolOutcome,
    ) -> ToolOutcome {
        let Some(open) = self.open.as_mut() else {
            return ToolOutcome::Ignored;
        };
        let mut ctx = EditorContext {
            view: &mut self.view,
            store: &mut open.store,
            classes: &self.project.classes,
            current_class: self.current_class,
            settings: &self.settings,
        };
        let outcome = action(&mut self.tools, &mut ctx);
        self.pump_events();
        outcome
    }

    pub fn handle_pointer(&mut self, event: PointerEvent) -> ToolOutcome {
        self.dispatch(|tools, ctx| tools.handle_pointer(event, ctx))
    }

    pub fn handle_key(&mut self, command: KeyCommand) -> ToolOutcome {
        self.dispatch(|tools, ctx| tools.handle_key(command, ctx))
    }

    pub fn set_tool(&mut self, tool: ToolKind) -> ToolOutcome {
        if self.open.is_none() {
            // no context to cancel against; just remember the choice
            let mut store = AnnotationStore::new(1);
            let mut view = self.view;
            let mut ctx = EditorContext {
                view: &mut view,
                store: &mut store,
                classes: &self.project.classes,
                current_class: self.current_class,
                settings: &self.settings,
            };
            return self.tools.set_tool(tool, &mut ctx);
        }
        self.dispatch(|tools, ctx| tools.set_tool(tool, ctx))
    }

    /// Rotate the display. The rotation is stored with the image record on
    /// the next write-back; pixels and annotations are untouched.
    pub fn rotate_view(&mut self, delta_degrees: f32) {
        self.view = self.view.rotate_by(delta_degrees);
        if let Some(id) = self.open_image_id() {
            self.unsaved_images.insert(id);
            self.autosave.mark_dirty();
        }
    }

    pub fn resize_viewport(&mut self, width: f32, height: f32) {
        self.view = self.view.with_viewport(width, height);
    }

    pub fn overlay(&self) -> Option<Overlay> {
        let open = self.open.as_ref()?;
        Some(build_overlay(
            &open.store,
            &self.project.classes,
            &self.view,
            &self.tools,
            self.current_class,
        ))
    }

    /// Add or replace a class definition. Malformed skeletons are refused.
    pub fn upsert_class(&mut self, class: ClassDef) -> Result<(), EditError> {
        log::debug!("Upserting class {} ({})", class.id, class.name);
        if let Err(e) = self.project.classes.upsert(class) {
            log::warn!("Refused class: {}", e);
            return Err(e);
        }
        self.classes_unsaved = true;
        self.autosave.mark_dirty();
        Ok(())
    }

    /// First step of class deletion. Unused classes are deleted at once;
    /// otherwise the counts are reported and nothing changes.
    pub fn request_class_deletion(&mut self, class_id: ClassId) -> ClassDeletion {
        self.write_back();
        let outcome = self.project.request_class_deletion(class_id);
        if matches!(outcome, ClassDeletion::Deleted(_)) {
            self.classes_unsaved = true;
            self.autosave.mark_dirty();
        }
        outcome
    }

    /// Delete a class and every annotation using it, in every image
    /// including the open one. The open image's undo history is cleared.
    /// Returns the number of annotations removed.
    pub fn confirm_class_deletion(&mut self, class_id: ClassId) -> usize {
        self.dispatch(|tools, ctx| tools.cancel(ctx));
        self.write_back();
        let affected: Vec<ImageId> = self
            .project
            .images
            .iter()
            .filter(|image| image.count_class(class_id) > 0)
            .map(|image| image.id)
            .collect();
        let removed = self.project.confirm_class_deletion(class_id);
        if let Some(open) = self.open.as_mut() {
            open.store.remove_class(class_id);
        }
        self.unsaved_images.extend(affected);
        self.classes_unsaved = true;
        self.pump_events();
        self.autosave.mark_dirty();
        if self.current_class == class_id {
            self.current_class = self.project.classes.iter().next().map(|c| c.id).unwrap_or(0);
        }
        removed
    }

    /// Persist if an autosave trigger is due at `now`.
    pub fn tick_at(
        &mut self,
        sink: &mut dyn ProjectSink,
        now: Instant,
    ) -> Result<Option<SaveReason>, PersistError> {
        self.pump_events();
        let Some(reason) = self.autosave.due_at(now) else {
            return Ok(None);
        };
        log::debug!("Autosave due ({:?})", reason);
        self.save_at(sink, now)?;
        Ok(Some(reason))
    }

    pub fn tick(&mut self, sink: &mut dyn ProjectSink) -> Result<Option<SaveReason>, PersistError> {
        self.tick_at(sink, Instant::now())
    }

    /// Write every unsaved change to `sink` now.
    pub fn save_at(&mut self, sink: &mut dyn ProjectSink, now: Instant) -> Result<(), PersistError> {
        self.write_back();
        if let Err(e) = self.flush(sink) {
            log::warn!("Save failed: {}", e);
            self.autosave.mark_save_failed_at(now);
            return Err(e);
        }
        self.autosave.mark_saved_at(now);
        Ok(())
    }

    fn flush(&mut self, sink: &mut dyn ProjectSink) -> Result<(), PersistError> {
        if self.classes_unsaved {
            sink.save_classes(&self.project.classes)?;
            self.classes_unsaved = false;
        }
        while let Some(id) = self.unsaved_images.first().copied() {
            if let Some(record) = self.project.image(id) {
                sink.save_image(record)?;
                log::debug!("Saved image {} ({} annotation(s))", id, record.annotations.len());
            }
            self.unsaved_images.remove(&id);
        }
        Ok(())
    }

    pub fn has_unsaved_changes(&self) -> bool {
        self.classes_unsaved
            || !self.unsaved_images.is_empty()
            || self.open.as_ref().is_some_and(|open| open.store.is_dirty())
    }

    /// Write the open image back and hand the project over.
    pub fn into_project(mut self) -> Project {
        self.close_image();
        self.project
    }
}
