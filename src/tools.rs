//! Tool state machine: turns pointer and keyboard input into annotation
//! edits.
//!
//! One tool is active at a time. Pointer positions arrive in canvas space
//! and are mapped to image space through the view before anything is
//! stored. The machine never touches presentation; it exposes a
//! declarative [`ToolPresentation`] instead.

use serde::{Deserialize, Serialize};

use crate::config::EditorSettings;
use crate::constants::ROTATION_HANDLE_OFFSET;
use crate::error::EditError;
use crate::geometry::{Affine2, Point, normalize_degrees};
use crate::mask::{BrushMode, MaskRaster};
use crate::model::{
    Annotation, AnnotationId, AnnotationShape, ClassId, ClassList, Handle, Keypoint, Visibility,
};
use crate::store::{AnnotationPatch, AnnotationStore};
use crate::view::ViewTransform;

/// Available tools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ToolKind {
    #[default]
    Select,
    Box,
    OrientedBox,
    Polygon,
    Keypoints,
    Mask,
    Pan,
}

impl ToolKind {
    pub fn name(&self) -> &'static str {
        match self {
            ToolKind::Select => "select",
            ToolKind::Box => "box",
            ToolKind::OrientedBox => "oriented box",
            ToolKind::Polygon => "polygon",
            ToolKind::Keypoints => "keypoints",
            ToolKind::Mask => "mask",
            ToolKind::Pan => "pan",
        }
    }
}

/// Pointer input in canvas coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PointerEvent {
    Down(Point),
    Move(Point),
    Up(Point),
    /// Wheel steps at a cursor position; positive zooms in
    Wheel { position: Point, steps: f32 },
}

/// Keyboard-level commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyCommand {
    Delete,
    Escape,
    Undo,
    Redo,
    /// Commit a polygon or keypoint set in progress
    Finish,
    /// Record the next joint as absent
    SkipJoint,
    /// Flip the last placed joint between visible and occluded
    ToggleOccluded,
    /// Start a fresh mask raster for the next stroke
    NewInstance,
}

/// Result of feeding one input to the machine.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutcome {
    /// Nothing happened
    Ignored,
    /// Zoom, pan or rotation changed
    ViewChanged,
    /// In-progress geometry changed; nothing committed yet
    InProgress,
    Created(AnnotationId),
    Modified(AnnotationId),
    Deleted(AnnotationId),
    SelectionChanged(Option<AnnotationId>),
    /// An in-progress operation was discarded
    Cancelled,
    Undone,
    Redone,
    /// The operation was refused; nothing was stored
    Rejected(EditError),
}

/// In-progress creation, image-space throughout.
#[derive(Debug, Clone, PartialEq)]
pub enum DrawingState {
    Box {
        start: Point,
        current: Point,
    },
    OrientedBox {
        start: Point,
        current: Point,
        /// Angle that keeps the box aligned with the screen
        angle_degrees: f32,
    },
    Polygon {
        points: Vec<Point>,
        cursor: Point,
    },
    Keypoints {
        class_id: ClassId,
        keypoints: Vec<Keypoint>,
        next_joint: usize,
    },
}

/// A select-tool gesture on an existing annotation.
#[derive(Debug, Clone, PartialEq)]
pub struct EditState {
    pub handle: Handle,
    /// Annotation as it was when the gesture began
    pub before: Annotation,
    pub start_image: Point,
    pub start_canvas: Point,
    /// True until the pointer has moved past the drag threshold
    pub pending: bool,
    /// Annotations under the press, topmost first, for click cycling
    pub cycle: Vec<AnnotationId>,
}

/// States of the machine.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum ToolState {
    #[default]
    Idle,
    Drawing(DrawingState),
    Editing(EditState),
    Panning { last: Point },
    Masking { brush_active: bool },
}

impl ToolState {
    pub fn is_idle(&self) -> bool {
        matches!(self, ToolState::Idle | ToolState::Masking { brush_active: false })
    }
}

/// The mask being painted. Created on the first stroke after a tool
/// switch or a "new instance" command.
#[derive(Debug, Clone)]
struct MaskInstance {
    annotation_id: Option<AnnotationId>,
    raster: MaskRaster,
    last_point: Option<Point>,
}

/// What a presentation layer needs to draw tool chrome.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolPresentation {
    pub active_tool: ToolKind,
    pub mask_controls_visible: bool,
    pub brush_size: f32,
    pub brush_mode: BrushMode,
    pub busy: bool,
    /// Whether `Finish` would commit something
    pub can_finish: bool,
    /// Joint to be placed next by the keypoint tool
    pub next_joint: Option<usize>,
}

/// Everything the machine reads or writes besides its own state.
pub struct EditorContext<'a> {
    pub view: &'a mut ViewTransform,
    pub store: &'a mut AnnotationStore,
    pub classes: &'a ClassList,
    pub current_class: ClassId,
    pub settings: &'a EditorSettings,
}

impl EditorContext<'_> {
    fn to_image(&self, canvas: Point) -> Point {
        self.view.to_image_space(canvas)
    }

    fn image_length(&self, canvas_length: f32) -> f32 {
        self.view.canvas_to_image_length(canvas_length)
    }

    fn image_size(&self) -> (u32, u32) {
        (
            self.view.image_width.round().max(0.0) as u32,
            self.view.image_height.round().max(0.0) as u32,
        )
    }
}

/// Per-tool interaction state machine.
#[derive(Debug, Clone)]
pub struct ToolStateMachine {
    tool: ToolKind,
    state: ToolState,
    brush_size: f32,
    brush_mode: BrushMode,
    mask: Option<MaskInstance>,
}

impl Default for ToolStateMachine {
    fn default() -> Self {
        Self::new(crate::constants::DEFAULT_BRUSH_SIZE)
    }
}

impl ToolStateMachine {
    pub fn new(brush_size: f32) -> Self {
        Self {
            tool: ToolKind::Select,
            state: ToolState::Idle,
            brush_size,
            brush_mode: BrushMode::Paint,
            mask: None,
        }
    }

    pub fn tool(&self) -> ToolKind {
        self.tool
    }

    pub fn state(&self) -> &ToolState {
        &self.state
    }

    pub fn brush_size(&self) -> f32 {
        self.brush_size
    }

    /// Brush radius in image pixels.
    pub fn set_brush_size(&mut self, brush_size: f32) {
        self.brush_size = brush_size.max(0.5);
    }

    pub fn brush_mode(&self) -> BrushMode {
        self.brush_mode
    }

    pub fn set_brush_mode(&mut self, mode: BrushMode) {
        self.brush_mode = mode;
    }

    pub fn presentation(&self) -> ToolPresentation {
        let (can_finish, next_joint) = match &self.state {
            ToolState::Drawing(DrawingState::Polygon { points, .. }) => {
                (points.len() >= crate::constants::MIN_POLYGON_VERTICES, None)
            }
            ToolState::Drawing(DrawingState::Keypoints {
                keypoints,
                next_joint,
                ..
            }) => (keypoints.iter().any(Keypoint::is_labelled), Some(*next_joint)),
            _ => (false, None),
        };
        ToolPresentation {
            active_tool: self.tool,
            mask_controls_visible: self.tool == ToolKind::Mask,
            brush_size: self.brush_size,
            brush_mode: self.brush_mode,
            busy: !self.state.is_idle(),
            can_finish,
            next_joint,
        }
    }

    /// Geometry being drawn but not yet stored, for preview rendering.
    pub fn in_progress_shape(&self) -> Option<AnnotationShape> {
        match &self.state {
            ToolState::Drawing(drawing) => drawing_shape(drawing),
            ToolState::Masking { brush_active: true } => self.mask.as_ref().and_then(|m| {
                (!m.raster.is_empty()).then(|| AnnotationShape::Mask {
                    raster: m.raster.clone(),
                })
            }),
            _ => None,
        }
    }

    fn idle_state_for(tool: ToolKind) -> ToolState {
        match tool {
            ToolKind::Mask => ToolState::Masking { brush_active: false },
            _ => ToolState::Idle,
        }
    }

    /// Switch tools. Anything in progress is discarded, never committed.
    pub fn set_tool(&mut self, tool: ToolKind, ctx: &mut EditorContext<'_>) -> ToolOutcome {
        let outcome = self.cancel(ctx);
        if tool != self.tool {
            log::debug!("Tool: {} -> {}", self.tool.name(), tool.name());
        }
        self.tool = tool;
        self.mask = None;
        self.state = Self::idle_state_for(tool);
        outcome
    }

    /// Discard the in-progress operation, restoring any live edit.
    pub fn cancel(&mut self, ctx: &mut EditorContext<'_>) -> ToolOutcome {
        let state = std::mem::replace(&mut self.state, Self::idle_state_for(self.tool));
        match state {
            ToolState::Idle | ToolState::Masking { brush_active: false } => ToolOutcome::Ignored,
            ToolState::Drawing(_) | ToolState::Panning { .. } => {
                log::debug!("Cancelled {} operation", self.tool.name());
                ToolOutcome::Cancelled
            }
            ToolState::Editing(edit) => {
                ctx.store.cancel_modification(edit.before);
                ToolOutcome::Cancelled
            }
            ToolState::Masking { brush_active: true } => {
                self.resync_mask(ctx.store);
                ToolOutcome::Cancelled
            }
        }
    }

    pub fn handle_pointer(&mut self, event: PointerEvent, ctx: &mut EditorContext<'_>) -> ToolOutcome {
        if let PointerEvent::Wheel { position, steps } = event {
            let factor = ctx.settings.zoom_step.powf(steps);
            *ctx.view = ctx.view.zoom_to_cursor(ctx.view.zoom * factor, position);
            return ToolOutcome::ViewChanged;
        }
        match self.tool {
            ToolKind::Select => self.select_pointer(event, ctx),
            ToolKind::Box | ToolKind::OrientedBox => self.box_pointer(event, ctx),
            ToolKind::Polygon => self.polygon_pointer(event, ctx),
            ToolKind::Keypoints => self.keypoint_pointer(event, ctx),
            ToolKind::Mask => self.mask_pointer(event, ctx),
            ToolKind::Pan => self.pan_pointer(event, ctx),
        }
    }

    pub fn handle_key(&mut self, command: KeyCommand, ctx: &mut EditorContext<'_>) -> ToolOutcome {
        match command {
            KeyCommand::Escape => {
                if self.state.is_idle() {
                    if ctx.store.selected().is_some() {
                        ctx.store.select(None);
                        return ToolOutcome::SelectionChanged(None);
                    }
                    return ToolOutcome::Ignored;
                }
                self.cancel(ctx)
            }
            KeyCommand::Delete => {
                self.cancel(ctx);
                let Some(id) = ctx.store.selected() else {
                    return ToolOutcome::Ignored;
                };
                match ctx.store.remove(id) {
                    Ok(_) => {
                        if self.mask.as_ref().and_then(|m| m.annotation_id) == Some(id) {
                            self.mask = None;
                        }
                        ToolOutcome::Deleted(id)
                    }
                    Err(e) => ToolOutcome::Rejected(e),
                }
            }
            KeyCommand::Undo | KeyCommand::Redo => {
                self.cancel(ctx);
                let applied = if command == KeyCommand::Undo {
                    ctx.store.undo()
                } else {
                    ctx.store.redo()
                };
                self.resync_mask(ctx.store);
                match (applied, command) {
                    (false, _) => ToolOutcome::Ignored,
                    (true, KeyCommand::Undo) => ToolOutcome::Undone,
                    (true, _) => ToolOutcome::Redone,
                }
            }
            KeyCommand::Finish => match &self.state {
                ToolState::Drawing(DrawingState::Polygon { .. }) => self.commit_polygon(ctx),
                ToolState::Drawing(DrawingState::Keypoints { .. }) => self.commit_keypoints(ctx),
                _ => ToolOutcome::Ignored,
            },
            KeyCommand::SkipJoint => {
                let ToolState::Drawing(DrawingState::Keypoints {
                    keypoints,
                    next_joint,
                    ..
                }) = &mut self.state
                else {
                    return ToolOutcome::Ignored;
                };
                if let Some(slot) = keypoints.get_mut(*next_joint) {
                    *slot = Keypoint::absent();
                }
                *next_joint += 1;
                if *next_joint >= keypoints.len() {
                    return self.commit_keypoints(ctx);
                }
                ToolOutcome::InProgress
            }
            KeyCommand::ToggleOccluded => {
                let ToolState::Drawing(DrawingState::Keypoints {
                    keypoints,
                    next_joint,
                    ..
                }) = &mut self.state
                else {
                    return ToolOutcome::Ignored;
                };
                let last_placed = keypoints[..*next_joint]
                    .iter_mut()
                    .rev()
                    .find(|k| k.is_labelled());
                match last_placed {
                    Some(keypoint) => {
                        keypoint.visibility = match keypoint.visibility {
                            Visibility::Visible => Visibility::Occluded,
                            _ => Visibility::Visible,
                        };
                        ToolOutcome::InProgress
                    }
                    None => ToolOutcome::Ignored,
                }
            }
            KeyCommand::NewInstance => {
                if self.tool != ToolKind::Mask {
                    return ToolOutcome::Ignored;
                }
                self.cancel(ctx);
                self.mask = None;
                ctx.store.select(None);
                log::debug!("New mask instance");
                ToolOutcome::SelectionChanged(None)
            }
        }
    }

    // ----- select -----

    fn select_pointer(&mut self, event: PointerEvent, ctx: &mut EditorContext<'_>) -> ToolOutcome {
        match event {
            PointerEvent::Down(canvas) => {
                self.assert_idle_on_press(ctx);
                let point = ctx.to_image(canvas);
                let handle_radius = ctx.image_length(ctx.settings.handle_hit_radius);
                let knob_offset = ctx.image_length(ROTATION_HANDLE_OFFSET);

                if let Some(selected) = ctx.store.selected_annotation() {
                    if let Some(handle) =
                        selected.shape.hit_test_handle(point, handle_radius, knob_offset)
                    {
                        log::trace!("Pressed {:?} of annotation {}", handle, selected.id);
                        self.state = ToolState::Editing(EditState {
                            handle,
                            before: selected.clone(),
                            start_image: point,
                            start_canvas: canvas,
                            pending: true,
                            cycle: Vec::new(),
                        });
                        return ToolOutcome::Ignored;
                    }
                }

                let hits = ctx
                    .store
                    .hits_at(point, ctx.image_length(ctx.settings.keypoint_hit_radius));
                let Some(&top) = hits.first() else {
                    if ctx.store.selected().is_some() {
                        ctx.store.select(None);
                        return ToolOutcome::SelectionChanged(None);
                    }
                    return ToolOutcome::Ignored;
                };

                let previous = ctx.store.selected();
                let (target, cycle) = match previous {
                    Some(id) if hits.contains(&id) => (id, hits),
                    _ => (top, Vec::new()),
                };
                ctx.store.select(Some(target));
                let Some(before) = ctx.store.get(target).cloned() else {
                    return ToolOutcome::Ignored;
                };
                self.state = ToolState::Editing(EditState {
                    handle: Handle::Body,
                    before,
                    start_image: point,
                    start_canvas: canvas,
                    pending: true,
                    cycle,
                });
                if previous != Some(target) {
                    ToolOutcome::SelectionChanged(Some(target))
                } else {
                    ToolOutcome::Ignored
                }
            }
            PointerEvent::Move(canvas) => {
                let ToolState::Editing(edit) = &mut self.state else {
                    return ToolOutcome::Ignored;
                };
                if edit.pending {
                    if edit.start_canvas.distance_to(canvas) < ctx.settings.min_drag_distance {
                        return ToolOutcome::Ignored;
                    }
                    edit.pending = false;
                }
                let point = ctx.view.to_image_space(canvas);
                let Some(shape) = edit
                    .before
                    .shape
                    .apply_handle_drag(edit.handle, edit.start_image, point)
                else {
                    return ToolOutcome::Ignored;
                };
                match ctx.store.preview_shape(edit.before.id, shape) {
                    Ok(()) => ToolOutcome::InProgress,
                    Err(e) => ToolOutcome::Rejected(e),
                }
            }
            PointerEvent::Up(_) => {
                let ToolState::Editing(edit) = std::mem::take(&mut self.state) else {
                    return ToolOutcome::Ignored;
                };
                if edit.pending {
                    return Self::cycle_selection(&edit, ctx);
                }
                let id = edit.before.id;
                match ctx.store.commit_modification(edit.before) {
                    Ok(true) => {
                        log::debug!("Committed {:?} edit of annotation {}", edit.handle, id);
                        ToolOutcome::Modified(id)
                    }
                    Ok(false) => ToolOutcome::Ignored,
                    Err(e) => {
                        log::info!("Edit of annotation {} rejected: {}", id, e);
                        ToolOutcome::Rejected(e)
                    }
                }
            }
            PointerEvent::Wheel { .. } => ToolOutcome::Ignored,
        }
    }

    /// A click without drag on a stack of annotations moves the selection
    /// to the next one below, wrapping to the top.
    fn cycle_selection(edit: &EditState, ctx: &mut EditorContext<'_>) -> ToolOutcome {
        if edit.cycle.len() < 2 {
            return ToolOutcome::Ignored;
        }
        let current = edit.before.id;
        let index = edit.cycle.iter().position(|&id| id == current).unwrap_or(0);
        let next = edit.cycle[(index + 1) % edit.cycle.len()];
        ctx.store.select(Some(next));
        log::trace!("Cycled selection {} -> {}", current, next);
        ToolOutcome::SelectionChanged(Some(next))
    }

    // ----- box / oriented box -----

    fn box_pointer(&mut self, event: PointerEvent, ctx: &mut EditorContext<'_>) -> ToolOutcome {
        match event {
            PointerEvent::Down(canvas) => {
                self.assert_idle_on_press(ctx);
                let start = ctx.to_image(canvas);
                self.state = ToolState::Drawing(if self.tool == ToolKind::OrientedBox {
                    DrawingState::OrientedBox {
                        start,
                        current: start,
                        angle_degrees: normalize_degrees(-ctx.view.rotation_degrees),
                    }
                } else {
                    DrawingState::Box {
                        start,
                        current: start,
                    }
                });
                ToolOutcome::InProgress
            }
            PointerEvent::Move(canvas) => {
                let point = ctx.to_image(canvas);
                match &mut self.state {
                    ToolState::Drawing(
                        DrawingState::Box { current, .. } | DrawingState::OrientedBox { current, .. },
                    ) => {
                        *current = point;
                        ToolOutcome::InProgress
                    }
                    _ => ToolOutcome::Ignored,
                }
            }
            PointerEvent::Up(canvas) => {
                let point = ctx.to_image(canvas);
                let ToolState::Drawing(mut drawing) = std::mem::take(&mut self.state) else {
                    return ToolOutcome::Ignored;
                };
                if let DrawingState::Box { current, .. } | DrawingState::OrientedBox { current, .. } =
                    &mut drawing
                {
                    *current = point;
                }
                let Some(shape) = drawing_shape(&drawing) else {
                    return ToolOutcome::Ignored;
                };
                self.commit_new(shape, ctx.current_class, ctx)
            }
            PointerEvent::Wheel { .. } => ToolOutcome::Ignored,
        }
    }

    // ----- polygon -----

    fn polygon_pointer(&mut self, event: PointerEvent, ctx: &mut EditorContext<'_>) -> ToolOutcome {
        match event {
            PointerEvent::Down(canvas) => {
                let point = ctx.to_image(canvas);
                match &mut self.state {
                    ToolState::Drawing(DrawingState::Polygon { points, cursor }) => {
                        let closes = points.len() >= crate::constants::MIN_POLYGON_VERTICES
                            && points.first().is_some_and(|first| {
                                ctx.view.to_canvas_space(*first).distance_to(canvas)
                                    <= ctx.settings.polygon_close_distance
                            });
                        if closes {
                            return self.commit_polygon(ctx);
                        }
                        points.push(point);
                        *cursor = point;
                        ToolOutcome::InProgress
                    }
                    _ => {
                        self.state = ToolState::Drawing(DrawingState::Polygon {
                            points: vec![point],
                            cursor: point,
                        });
                        ToolOutcome::InProgress
                    }
                }
            }
            PointerEvent::Move(canvas) => {
                let point = ctx.to_image(canvas);
                if let ToolState::Drawing(DrawingState::Polygon { cursor, .. }) = &mut self.state {
                    *cursor = point;
                    return ToolOutcome::InProgress;
                }
                ToolOutcome::Ignored
            }
            PointerEvent::Up(_) | PointerEvent::Wheel { .. } => ToolOutcome::Ignored,
        }
    }

    fn commit_polygon(&mut self, ctx: &mut EditorContext<'_>) -> ToolOutcome {
        let ToolState::Drawing(DrawingState::Polygon { points, .. }) = std::mem::take(&mut self.state)
        else {
            return ToolOutcome::Ignored;
        };
        self.commit_new(AnnotationShape::Polygon { points }, ctx.current_class, ctx)
    }

    // ----- keypoints -----

    fn keypoint_pointer(&mut self, event: PointerEvent, ctx: &mut EditorContext<'_>) -> ToolOutcome {
        let PointerEvent::Down(canvas) = event else {
            return ToolOutcome::Ignored;
        };
        let point = ctx.to_image(canvas);
        if !matches!(self.state, ToolState::Drawing(DrawingState::Keypoints { .. })) {
            let class_id = ctx.current_class;
            let Some(skeleton) = ctx.classes.get(class_id).and_then(|c| c.skeleton.as_ref()) else {
                log::info!("Keypoint tool needs a skeleton; class {} has none", class_id);
                return ToolOutcome::Rejected(EditError::NoSkeleton(class_id));
            };
            self.state = ToolState::Drawing(DrawingState::Keypoints {
                class_id,
                keypoints: vec![Keypoint::absent(); skeleton.joint_count()],
                next_joint: 0,
            });
        }
        let ToolState::Drawing(DrawingState::Keypoints {
            keypoints,
            next_joint,
            ..
        }) = &mut self.state
        else {
            return ToolOutcome::Ignored;
        };
        if let Some(slot) = keypoints.get_mut(*next_joint) {
            *slot = Keypoint::new(point.x, point.y, Visibility::Visible);
        }
        *next_joint += 1;
        if *next_joint >= keypoints.len() {
            return self.commit_keypoints(ctx);
        }
        ToolOutcome::InProgress
    }

    fn commit_keypoints(&mut self, ctx: &mut EditorContext<'_>) -> ToolOutcome {
        let ToolState::Drawing(DrawingState::Keypoints {
            class_id,
            keypoints,
            ..
        }) = std::mem::take(&mut self.state)
        else {
            return ToolOutcome::Ignored;
        };
        let Some(skeleton) = ctx.classes.get(class_id).and_then(|c| c.skeleton.as_ref()) else {
            return ToolOutcome::Rejected(EditError::NoSkeleton(class_id));
        };
        if skeleton.joint_count() != keypoints.len() {
            return ToolOutcome::Rejected(EditError::SkeletonMismatch {
                expected: skeleton.joint_count(),
                found: keypoints.len(),
            });
        }
        self.commit_new(AnnotationShape::Keypoints { keypoints }, class_id, ctx)
    }

    // ----- mask -----

    /// Drop the working raster if its annotation was deleted or changed
    /// underneath it, reloading from the store when it still exists.
    fn resync_mask(&mut self, store: &AnnotationStore) {
        let Some(instance) = &mut self.mask else {
            return;
        };
        let Some(id) = instance.annotation_id else {
            self.mask = None;
            return;
        };
        match store.get(id).map(|a| &a.shape) {
            Some(AnnotationShape::Mask { raster }) => {
                instance.raster = raster.clone();
                instance.last_point = None;
            }
            _ => self.mask = None,
        }
    }

    fn mask_pointer(&mut self, event: PointerEvent, ctx: &mut EditorContext<'_>) -> ToolOutcome {
        match event {
            PointerEvent::Down(canvas) => {
                self.assert_idle_on_press(ctx);
                let point = ctx.to_image(canvas);
                self.resync_mask(ctx.store);
                let instance = self.mask.get_or_insert_with(|| {
                    let (width, height) = ctx.image_size();
                    // continue a selected mask, otherwise start empty
                    match ctx.store.selected_annotation() {
                        Some(Annotation {
                            id,
                            shape: AnnotationShape::Mask { raster },
                            ..
                        }) => MaskInstance {
                            annotation_id: Some(*id),
                            raster: raster.clone(),
                            last_point: None,
                        },
                        _ => MaskInstance {
                            annotation_id: None,
                            raster: MaskRaster::new(width, height),
                            last_point: None,
                        },
                    }
                });
                instance.raster.dab(point, self.brush_size, self.brush_mode);
                instance.last_point = Some(point);
                self.state = ToolState::Masking { brush_active: true };
                ToolOutcome::InProgress
            }
            PointerEvent::Move(canvas) => {
                if self.state != (ToolState::Masking { brush_active: true }) {
                    return ToolOutcome::Ignored;
                }
                let point = ctx.to_image(canvas);
                let Some(instance) = &mut self.mask else {
                    return ToolOutcome::Ignored;
                };
                let from = instance.last_point.unwrap_or(point);
                let changed = instance
                    .raster
                    .stroke(from, point, self.brush_size, self.brush_mode);
                instance.last_point = Some(point);
                log::trace!("Brush {:?} at ({:.1}, {:.1})", self.brush_mode, point.x, point.y);
                if changed {
                    ToolOutcome::InProgress
                } else {
                    ToolOutcome::Ignored
                }
            }
            PointerEvent::Up(_) => {
                if self.state != (ToolState::Masking { brush_active: true }) {
                    return ToolOutcome::Ignored;
                }
                self.state = ToolState::Masking { brush_active: false };
                self.commit_mask_stroke(ctx)
            }
            PointerEvent::Wheel { .. } => ToolOutcome::Ignored,
        }
    }

    fn commit_mask_stroke(&mut self, ctx: &mut EditorContext<'_>) -> ToolOutcome {
        let Some(instance) = &mut self.mask else {
            return ToolOutcome::Ignored;
        };
        instance.last_point = None;
        let mut stored = instance.raster.clone();
        stored.compact();

        match instance.annotation_id {
            None if stored.is_empty() => ToolOutcome::Ignored,
            None => match ctx.store.add(ctx.current_class, AnnotationShape::Mask { raster: stored }) {
                Ok(id) => {
                    instance.annotation_id = Some(id);
                    ctx.store.select(Some(id));
                    log::info!("Created mask annotation {}", id);
                    ToolOutcome::Created(id)
                }
                Err(e) => ToolOutcome::Rejected(e),
            },
            Some(id) if stored.is_empty() => {
                self.mask = None;
                match ctx.store.remove(id) {
                    Ok(_) => {
                        log::debug!("Mask {} erased completely; removed", id);
                        ToolOutcome::Deleted(id)
                    }
                    Err(e) => ToolOutcome::Rejected(e),
                }
            }
            Some(id) => match ctx
                .store
                .update(id, AnnotationPatch::shape(AnnotationShape::Mask { raster: stored }))
            {
                Ok(()) => ToolOutcome::Modified(id),
                Err(e) => ToolOutcome::Rejected(e),
            },
        }
    }

    // ----- pan -----

    fn pan_pointer(&mut self, event: PointerEvent, ctx: &mut EditorContext<'_>) -> ToolOutcome {
        match event {
            PointerEvent::Down(canvas) => {
                self.assert_idle_on_press(ctx);
                self.state = ToolState::Panning { last: canvas };
                ToolOutcome::Ignored
            }
            PointerEvent::Move(canvas) => {
                let ToolState::Panning { last } = &mut self.state else {
                    return ToolOutcome::Ignored;
                };
                *ctx.view = ctx.view.pan_by(canvas.x - last.x, canvas.y - last.y);
                *last = canvas;
                ToolOutcome::ViewChanged
            }
            PointerEvent::Up(_) => {
                self.state = ToolState::Idle;
                ToolOutcome::Ignored
            }
            PointerEvent::Wheel { .. } => ToolOutcome::Ignored,
        }
    }

    // ----- shared -----

    /// A press while another gesture is in flight means a release was
    /// lost. That cannot happen on a single event loop, so it is a bug;
    /// release builds drop the stale gesture.
    fn assert_idle_on_press(&mut self, ctx: &mut EditorContext<'_>) {
        if self.state.is_idle() {
            return;
        }
        debug_assert!(false, "pointer down while {:?} is in flight", self.state);
        log::error!("Pointer down while an operation is in flight; discarding it");
        self.cancel(ctx);
    }

    fn commit_new(&mut self, shape: AnnotationShape, class_id: ClassId, ctx: &mut EditorContext<'_>) -> ToolOutcome {
        let kind = shape.kind_name();
        match ctx.store.add(class_id, shape) {
            Ok(id) => {
                ctx.store.select(Some(id));
                log::info!("Created {} {} (class {})", kind, id, class_id);
                ToolOutcome::Created(id)
            }
            Err(e) => {
                log::info!("Discarded {}: {}", kind, e);
                ToolOutcome::Rejected(e)
            }
        }
    }
}

/// Shape a drawing would commit as, if any.
fn drawing_shape(drawing: &DrawingState) -> Option<AnnotationShape> {
    match drawing {
        DrawingState::Box { start, current } => {
            Some(AnnotationShape::bounding_box_from_corners(*start, *current))
        }
        DrawingState::OrientedBox {
            start,
            current,
            angle_degrees,
        } => {
            let to_local = Affine2::rotate_degrees(-f64::from(*angle_degrees));
            let diagonal = to_local.apply(Point::new(current.x - start.x, current.y - start.y));
            Some(AnnotationShape::OrientedBox {
                cx: (start.x + current.x) / 2.0,
                cy: (start.y + current.y) / 2.0,
                width: diagonal.x.abs(),
                height: diagonal.y.abs(),
                angle_degrees: *angle_degrees,
            })
        }
        DrawingState::Polygon { points, .. } => Some(AnnotationShape::Polygon {
            points: points.clone(),
        }),
        DrawingState::Keypoints { keypoints, .. } => Some(AnnotationShape::Keypoints {
            keypoints: keypoints.clone(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Rect;
    use crate::model::{ClassDef, Skeleton};

    const EPSILON: f32 = 1e-3;

    fn approx_eq(a: f32, b: f32) -> bool {
        (a - b).abs() < EPSILON
    }

    struct Fixture {
        view: ViewTransform,
        store: AnnotationStore,
        classes: ClassList,
        settings: EditorSettings,
        class_id: ClassId,
    }

    impl Fixture {
        /// 200x100 image in a 200x100 viewport at zoom 1, so canvas and
        /// image coordinates coincide.
        fn new() -> Self {
            Self {
                view: ViewTransform::new(200, 100, 200.0, 100.0),
                store: AnnotationStore::default(),
                classes: ClassList::from_classes(vec![
                    ClassDef::new(1, "car"),
                    ClassDef::new(2, "person").with_skeleton(Skeleton::new(
                        ["head", "hip", "foot"],
                        vec![(0, 1), (1, 2)],
                    )),
                ]),
                settings: EditorSettings::default(),
                class_id: 1,
            }
        }

        fn ctx(&mut self) -> EditorContext<'_> {
            EditorContext {
                view: &mut self.view,
                store: &mut self.store,
                classes: &self.classes,
                current_class: self.class_id,
                settings: &self.settings,
            }
        }
    }

    fn drag(tools: &mut ToolStateMachine, fx: &mut Fixture, from: Point, to: Point) -> ToolOutcome {
        tools.handle_pointer(PointerEvent::Down(from), &mut fx.ctx());
        tools.handle_pointer(PointerEvent::Move(to), &mut fx.ctx());
        tools.handle_pointer(PointerEvent::Up(to), &mut fx.ctx())
    }

    fn with_tool(tool: ToolKind, fx: &mut Fixture) -> ToolStateMachine {
        let mut tools = ToolStateMachine::default();
        tools.set_tool(tool, &mut fx.ctx());
        tools
    }

    #[test]
    fn test_box_tool_commits_box() {
        let mut fx = Fixture::new();
        let mut tools = with_tool(ToolKind::Box, &mut fx);
        let outcome = drag(&mut tools, &mut fx, Point::new(60.0, 40.0), Point::new(10.0, 10.0));
        let ToolOutcome::Created(id) = outcome else {
            panic!("Expected created, got {:?}", outcome);
        };
        assert_eq!(
            fx.store.get(id).unwrap().shape.bounding_rect(),
            Some(Rect::new(10.0, 10.0, 50.0, 30.0))
        );
        assert_eq!(fx.store.selected(), Some(id));
        assert!(tools.state().is_idle());
    }

    #[test]
    fn test_box_below_threshold_is_never_added() {
        let mut fx = Fixture::new();
        let mut tools = with_tool(ToolKind::Box, &mut fx);
        let outcome = drag(&mut tools, &mut fx, Point::new(10.0, 10.0), Point::new(60.0, 10.5));
        assert!(matches!(outcome, ToolOutcome::Rejected(EditError::Degenerate { .. })));
        assert!(fx.store.is_empty());
    }

    #[test]
    fn test_box_respects_zoom() {
        let mut fx = Fixture::new();
        fx.view = fx.view.zoom_in(2.0);
        let mut tools = with_tool(ToolKind::Box, &mut fx);
        // viewport centre maps to image centre (100, 50)
        let outcome = drag(&mut tools, &mut fx, Point::new(100.0, 50.0), Point::new(140.0, 70.0));
        let ToolOutcome::Created(id) = outcome else {
            panic!("Expected created, got {:?}", outcome);
        };
        let rect = fx.store.get(id).unwrap().shape.bounding_rect().unwrap();
        assert!(approx_eq(rect.x, 100.0));
        assert!(approx_eq(rect.width, 20.0));
        assert!(approx_eq(rect.height, 10.0));
    }

    #[test]
    fn test_switching_tool_discards_half_drawn_box() {
        let mut fx = Fixture::new();
        let mut tools = with_tool(ToolKind::Box, &mut fx);
        tools.handle_pointer(PointerEvent::Down(Point::new(10.0, 10.0)), &mut fx.ctx());
        tools.handle_pointer(PointerEvent::Move(Point::new(80.0, 80.0)), &mut fx.ctx());
        assert!(tools.in_progress_shape().is_some());
        assert_eq!(tools.set_tool(ToolKind::Select, &mut fx.ctx()), ToolOutcome::Cancelled);
        tools.handle_pointer(PointerEvent::Up(Point::new(80.0, 80.0)), &mut fx.ctx());
        assert!(fx.store.is_empty());
    }

    #[test]
    fn test_oriented_box_aligns_with_rotated_view() {
        let mut fx = Fixture::new();
        fx.view = fx.view.with_rotation(90.0);
        let mut tools = with_tool(ToolKind::OrientedBox, &mut fx);
        let outcome = drag(&mut tools, &mut fx, Point::new(80.0, 40.0), Point::new(120.0, 50.0));
        let ToolOutcome::Created(id) = outcome else {
            panic!("Expected created, got {:?}", outcome);
        };
        let AnnotationShape::OrientedBox {
            width,
            height,
            angle_degrees,
            ..
        } = fx.store.get(id).unwrap().shape
        else {
            panic!("Expected oriented box");
        };
        assert!(approx_eq(angle_degrees, 270.0));
        assert!(approx_eq(width, 40.0));
        assert!(approx_eq(height, 10.0));
    }

    #[test]
    fn test_select_drag_moves_with_one_undo_step() {
        let mut fx = Fixture::new();
        let id = fx
            .store
            .add(1, AnnotationShape::BoundingBox {
                x: 20.0,
                y: 20.0,
                width: 40.0,
                height: 30.0,
            })
            .unwrap();
        let mut tools = with_tool(ToolKind::Select, &mut fx);
        tools.handle_pointer(PointerEvent::Down(Point::new(40.0, 35.0)), &mut fx.ctx());
        for step in 1..=5 {
            let outcome = tools.handle_pointer(
                PointerEvent::Move(Point::new(40.0 + step as f32 * 2.0, 35.0)),
                &mut fx.ctx(),
            );
            assert_eq!(outcome, ToolOutcome::InProgress);
        }
        let outcome = tools.handle_pointer(PointerEvent::Up(Point::new(50.0, 35.0)), &mut fx.ctx());
        assert_eq!(outcome, ToolOutcome::Modified(id));
        assert_eq!(
            fx.store.get(id).unwrap().shape.bounding_rect(),
            Some(Rect::new(30.0, 20.0, 40.0, 30.0))
        );
        assert_eq!(tools.handle_key(KeyCommand::Undo, &mut fx.ctx()), ToolOutcome::Undone);
        assert_eq!(
            fx.store.get(id).unwrap().shape.bounding_rect(),
            Some(Rect::new(20.0, 20.0, 40.0, 30.0))
        );
    }

    #[test]
    fn test_select_resize_handle() {
        let mut fx = Fixture::new();
        let id = fx
            .store
            .add(1, AnnotationShape::BoundingBox {
                x: 20.0,
                y: 20.0,
                width: 40.0,
                height: 30.0,
            })
            .unwrap();
        fx.store.select(Some(id));
        let mut tools = with_tool(ToolKind::Select, &mut fx);
        let outcome = drag(&mut tools, &mut fx, Point::new(60.0, 50.0), Point::new(90.0, 70.0));
        assert_eq!(outcome, ToolOutcome::Modified(id));
        assert_eq!(
            fx.store.get(id).unwrap().shape.bounding_rect(),
            Some(Rect::new(20.0, 20.0, 70.0, 50.0))
        );
    }

    #[test]
    fn test_click_cycles_through_overlaps() {
        let mut fx = Fixture::new();
        let below = fx
            .store
            .add(1, AnnotationShape::BoundingBox {
                x: 0.0,
                y: 0.0,
                width: 80.0,
                height: 80.0,
            })
            .unwrap();
        let above = fx
            .store
            .add(1, AnnotationShape::BoundingBox {
                x: 20.0,
                y: 20.0,
                width: 40.0,
                height: 40.0,
            })
            .unwrap();
        let mut tools = with_tool(ToolKind::Select, &mut fx);
        let click = |tools: &mut ToolStateMachine, fx: &mut Fixture| {
            tools.handle_pointer(PointerEvent::Down(Point::new(40.0, 40.0)), &mut fx.ctx());
            tools.handle_pointer(PointerEvent::Up(Point::new(40.0, 40.0)), &mut fx.ctx());
        };
        click(&mut tools, &mut fx);
        assert_eq!(fx.store.selected(), Some(above));
        click(&mut tools, &mut fx);
        assert_eq!(fx.store.selected(), Some(below));
        click(&mut tools, &mut fx);
        assert_eq!(fx.store.selected(), Some(above));
    }

    #[test]
    fn test_delete_and_escape() {
        let mut fx = Fixture::new();
        let id = fx
            .store
            .add(1, AnnotationShape::BoundingBox {
                x: 0.0,
                y: 0.0,
                width: 10.0,
                height: 10.0,
            })
            .unwrap();
        let mut tools = with_tool(ToolKind::Select, &mut fx);
        fx.store.select(Some(id));
        assert_eq!(
            tools.handle_key(KeyCommand::Escape, &mut fx.ctx()),
            ToolOutcome::SelectionChanged(None)
        );
        assert_eq!(tools.handle_key(KeyCommand::Delete, &mut fx.ctx()), ToolOutcome::Ignored);
        fx.store.select(Some(id));
        assert_eq!(tools.handle_key(KeyCommand::Delete, &mut fx.ctx()), ToolOutcome::Deleted(id));
        assert!(fx.store.is_empty());
    }

    #[test]
    fn test_polygon_closes_near_first_vertex() {
        let mut fx = Fixture::new();
        let mut tools = with_tool(ToolKind::Polygon, &mut fx);
        for p in [(10.0, 10.0), (60.0, 10.0), (60.0, 60.0)] {
            let outcome = tools.handle_pointer(PointerEvent::Down(Point::new(p.0, p.1)), &mut fx.ctx());
            assert_eq!(outcome, ToolOutcome::InProgress);
        }
        assert!(tools.presentation().can_finish);
        let outcome = tools.handle_pointer(PointerEvent::Down(Point::new(12.0, 13.0)), &mut fx.ctx());
        let ToolOutcome::Created(id) = outcome else {
            panic!("Expected created, got {:?}", outcome);
        };
        let AnnotationShape::Polygon { points } = &fx.store.get(id).unwrap().shape else {
            panic!("Expected polygon");
        };
        assert_eq!(points.len(), 3);
    }

    #[test]
    fn test_polygon_finish_rejects_too_few_vertices() {
        let mut fx = Fixture::new();
        let mut tools = with_tool(ToolKind::Polygon, &mut fx);
        tools.handle_pointer(PointerEvent::Down(Point::new(10.0, 10.0)), &mut fx.ctx());
        tools.handle_pointer(PointerEvent::Down(Point::new(50.0, 10.0)), &mut fx.ctx());
        let outcome = tools.handle_key(KeyCommand::Finish, &mut fx.ctx());
        assert!(matches!(outcome, ToolOutcome::Rejected(EditError::Degenerate { .. })));
        assert!(fx.store.is_empty());
    }

    #[test]
    fn test_keypoints_follow_skeleton() {
        let mut fx = Fixture::new();
        fx.class_id = 2;
        let mut tools = with_tool(ToolKind::Keypoints, &mut fx);
        tools.handle_pointer(PointerEvent::Down(Point::new(50.0, 10.0)), &mut fx.ctx());
        tools.handle_key(KeyCommand::ToggleOccluded, &mut fx.ctx());
        assert_eq!(tools.presentation().next_joint, Some(1));
        tools.handle_key(KeyCommand::SkipJoint, &mut fx.ctx());
        let outcome = tools.handle_pointer(PointerEvent::Down(Point::new(50.0, 90.0)), &mut fx.ctx());
        let ToolOutcome::Created(id) = outcome else {
            panic!("Expected created, got {:?}", outcome);
        };
        let annotation = fx.store.get(id).unwrap();
        assert_eq!(annotation.class_id, 2);
        let AnnotationShape::Keypoints { keypoints } = &annotation.shape else {
            panic!("Expected keypoints");
        };
        assert_eq!(keypoints[0].visibility, Visibility::Occluded);
        assert_eq!(keypoints[1].visibility, Visibility::Absent);
        assert_eq!(keypoints[2].position(), Point::new(50.0, 90.0));
    }

    #[test]
    fn test_keypoints_need_skeleton() {
        let mut fx = Fixture::new();
        let mut tools = with_tool(ToolKind::Keypoints, &mut fx);
        let outcome = tools.handle_pointer(PointerEvent::Down(Point::new(5.0, 5.0)), &mut fx.ctx());
        assert_eq!(outcome, ToolOutcome::Rejected(EditError::NoSkeleton(1)));
    }

    #[test]
    fn test_mask_strokes_extend_one_instance() {
        let mut fx = Fixture::new();
        let mut tools = with_tool(ToolKind::Mask, &mut fx);
        assert!(tools.presentation().mask_controls_visible);
        tools.set_brush_size(3.0);
        let first = drag(&mut tools, &mut fx, Point::new(20.0, 20.0), Point::new(40.0, 20.0));
        let ToolOutcome::Created(id) = first else {
            panic!("Expected created, got {:?}", first);
        };
        let second = drag(&mut tools, &mut fx, Point::new(20.0, 60.0), Point::new(40.0, 60.0));
        assert_eq!(second, ToolOutcome::Modified(id));
        assert_eq!(fx.store.len(), 1);

        tools.handle_key(KeyCommand::NewInstance, &mut fx.ctx());
        let third = drag(&mut tools, &mut fx, Point::new(120.0, 60.0), Point::new(140.0, 60.0));
        assert!(matches!(third, ToolOutcome::Created(other) if other != id));
        assert_eq!(fx.store.len(), 2);
    }

    #[test]
    fn test_mask_stroke_size_ignores_zoom() {
        let mut fx = Fixture::new();
        let mut tools = with_tool(ToolKind::Mask, &mut fx);
        tools.set_brush_size(4.0);
        let outcome = drag(&mut tools, &mut fx, Point::new(100.0, 50.0), Point::new(100.0, 50.0));
        let ToolOutcome::Created(at_one) = outcome else {
            panic!("Expected created, got {:?}", outcome);
        };
        let area_one = fx.store.get(at_one).unwrap().shape.bounding_rect().unwrap().area();

        fx.view = fx.view.zoom_in(4.0);
        tools.handle_key(KeyCommand::NewInstance, &mut fx.ctx());
        let outcome = drag(&mut tools, &mut fx, Point::new(100.0, 50.0), Point::new(100.0, 50.0));
        let ToolOutcome::Created(at_four) = outcome else {
            panic!("Expected created, got {:?}", outcome);
        };
        let area_four = fx.store.get(at_four).unwrap().shape.bounding_rect().unwrap().area();
        assert!(approx_eq(area_one, area_four));
    }

    #[test]
    fn test_mask_erase_to_empty_removes_annotation() {
        let mut fx = Fixture::new();
        let mut tools = with_tool(ToolKind::Mask, &mut fx);
        tools.set_brush_size(3.0);
        let ToolOutcome::Created(id) =
            drag(&mut tools, &mut fx, Point::new(50.0, 50.0), Point::new(50.0, 50.0))
        else {
            panic!("Expected created");
        };
        tools.set_brush_mode(BrushMode::Erase);
        tools.set_brush_size(10.0);
        let outcome = drag(&mut tools, &mut fx, Point::new(50.0, 50.0), Point::new(50.0, 50.0));
        assert_eq!(outcome, ToolOutcome::Deleted(id));
        assert!(fx.store.is_empty());
    }

    #[test]
    fn test_mask_erase_with_same_brush_removes_annotation() {
        let mut fx = Fixture::new();
        let mut tools = with_tool(ToolKind::Mask, &mut fx);
        tools.set_brush_size(6.0);
        let ToolOutcome::Created(id) =
            drag(&mut tools, &mut fx, Point::new(50.0, 50.0), Point::new(50.0, 50.0))
        else {
            panic!("Expected created");
        };
        tools.set_brush_mode(BrushMode::Erase);
        let outcome = drag(&mut tools, &mut fx, Point::new(50.0, 50.0), Point::new(50.0, 50.0));
        assert_eq!(outcome, ToolOutcome::Deleted(id));
        assert!(fx.store.is_empty());
    }

    #[test]
    fn test_mask_faint_dab_is_not_committed() {
        let mut fx = Fixture::new();
        let mut tools = with_tool(ToolKind::Mask, &mut fx);
        tools.set_brush_size(0.5);
        // on a pixel corner every neighbour gets partial coverage only
        let outcome = drag(&mut tools, &mut fx, Point::new(50.0, 50.0), Point::new(50.0, 50.0));
        assert_eq!(outcome, ToolOutcome::Ignored);
        assert!(fx.store.is_empty());
    }

    #[test]
    fn test_pan_tool_never_touches_store() {
        let mut fx = Fixture::new();
        let mut tools = with_tool(ToolKind::Pan, &mut fx);
        let rx = fx.store.subscribe();
        tools.handle_pointer(PointerEvent::Down(Point::new(10.0, 10.0)), &mut fx.ctx());
        let outcome = tools.handle_pointer(PointerEvent::Move(Point::new(30.0, 5.0)), &mut fx.ctx());
        assert_eq!(outcome, ToolOutcome::ViewChanged);
        tools.handle_pointer(PointerEvent::Up(Point::new(30.0, 5.0)), &mut fx.ctx());
        assert!(approx_eq(fx.view.pan_x, 20.0));
        assert!(approx_eq(fx.view.pan_y, -5.0));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_wheel_zooms_at_cursor() {
        let mut fx = Fixture::new();
        let mut tools = ToolStateMachine::default();
        let cursor = Point::new(30.0, 20.0);
        let before = fx.view.to_image_space(cursor);
        let outcome = tools.handle_pointer(PointerEvent::Wheel { position: cursor, steps: 1.0 }, &mut fx.ctx());
        assert_eq!(outcome, ToolOutcome::ViewChanged);
        assert!(approx_eq(fx.view.zoom, 1.2));
        let after = fx.view.to_image_space(cursor);
        assert!(approx_eq(before.x, after.x) && approx_eq(before.y, after.y));
    }
}
