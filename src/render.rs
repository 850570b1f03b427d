//! Render side table and canvas-space overlay.
//!
//! Nothing render-specific is stored on annotations. Per-annotation render
//! data (tessellations, mask textures) lives in a [`RenderCache`] keyed by
//! id and kept in sync from store change events. [`build_overlay`] turns
//! the model into canvas-space primitives for whatever draws them.

use std::collections::HashMap;
use std::sync::mpsc::Receiver;

use crate::constants::{ROTATION_HANDLE_OFFSET, overlay as style};
use crate::geometry::Point;
use crate::model::{AnnotationId, AnnotationShape, ClassId, ClassList, Keypoint, Visibility, oriented_corners};
use crate::store::{AnnotationStore, ChangeEvent};
use crate::tools::ToolStateMachine;
use crate::view::ViewTransform;

/// Derived render data for annotations, keyed by annotation id.
#[derive(Debug)]
pub struct RenderCache<T> {
    entries: HashMap<AnnotationId, T>,
    hits: u64,
    misses: u64,
}

impl<T> Default for RenderCache<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> RenderCache<T> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            hits: 0,
            misses: 0,
        }
    }

    /// Cached entry for `id`, building it with `build` on a miss.
    pub fn get_or_insert_with(&mut self, id: AnnotationId, build: impl FnOnce() -> T) -> &T {
        if self.entries.contains_key(&id) {
            self.hits += 1;
        } else {
            self.misses += 1;
        }
        self.entries.entry(id).or_insert_with(build)
    }

    pub fn get(&self, id: AnnotationId) -> Option<&T> {
        self.entries.get(&id)
    }

    pub fn contains(&self, id: AnnotationId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn invalidate(&mut self, id: AnnotationId) {
        if self.entries.remove(&id).is_some() {
            log::trace!("Render cache: invalidated {}", id);
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Drop whatever a change event makes stale.
    pub fn apply_event(&mut self, event: &ChangeEvent) {
        match event {
            ChangeEvent::Updated(id) | ChangeEvent::Removed(id) => self.invalidate(*id),
            ChangeEvent::Reset => {
                log::debug!("Render cache: reset ({} entries dropped)", self.entries.len());
                self.clear();
            }
            ChangeEvent::Added(_)
            | ChangeEvent::SelectionChanged(_)
            | ChangeEvent::HistoryChanged { .. } => {}
        }
    }

    /// Apply every pending event from a store subscription. Returns how
    /// many were processed.
    pub fn sync(&mut self, events: &Receiver<ChangeEvent>) -> usize {
        let mut count = 0;
        for event in events.try_iter() {
            self.apply_event(&event);
            count += 1;
        }
        count
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// (hits, misses) since creation.
    pub fn stats(&self) -> (u64, u64) {
        (self.hits, self.misses)
    }
}

/// A drawable primitive in canvas coordinates.
#[derive(Debug, Clone, PartialEq)]
pub enum OverlayShape {
    Point { at: Point, radius: f32, filled: bool },
    Polygon { vertices: Vec<Point>, closed: bool },
    Line { from: Point, to: Point },
    /// Canvas quad onto which the annotation's cached mask texture maps
    MaskQuad { corners: [Point; 4] },
    Handle { at: Point, size: f32 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct OverlayItem {
    /// `None` for previews and handles
    pub annotation: Option<AnnotationId>,
    pub shape: OverlayShape,
    pub color: [u8; 4],
    pub selected: bool,
}

impl OverlayItem {
    fn new(annotation: Option<AnnotationId>, shape: OverlayShape, color: [u8; 4]) -> Self {
        Self {
            annotation,
            shape,
            color,
            selected: false,
        }
    }
}

/// Everything to draw over the image, bottom to top.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Overlay {
    pub items: Vec<OverlayItem>,
    pub preview: Vec<OverlayItem>,
    pub handles: Vec<OverlayItem>,
}

impl Overlay {
    pub fn len(&self) -> usize {
        self.items.len() + self.preview.len() + self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn with_alpha(color: [u8; 3], alpha: u8) -> [u8; 4] {
    [color[0], color[1], color[2], alpha]
}

/// Canvas primitives for one shape.
fn shape_primitives(
    shape: &AnnotationShape,
    class_id: ClassId,
    classes: &ClassList,
    view: &ViewTransform,
) -> Vec<OverlayShape> {
    let canvas = |p: Point| view.to_canvas_space(p);
    match shape {
        AnnotationShape::BoundingBox { .. } | AnnotationShape::Polygon { .. } => {
            let vertices = match shape {
                AnnotationShape::Polygon { points } => points.iter().map(|p| canvas(*p)).collect(),
                _ => shape
                    .bounding_rect()
                    .map(|r| r.corners().iter().map(|p| canvas(*p)).collect())
                    .unwrap_or_default(),
            };
            vec![OverlayShape::Polygon {
                vertices,
                closed: true,
            }]
        }
        AnnotationShape::OrientedBox {
            cx,
            cy,
            width,
            height,
            angle_degrees,
        } => vec![OverlayShape::Polygon {
            vertices: oriented_corners(*cx, *cy, *width, *height, *angle_degrees)
                .iter()
                .map(|p| canvas(*p))
                .collect(),
            closed: true,
        }],
        AnnotationShape::Mask { raster } => raster
            .bounding_rect()
            .map(|r| {
                vec![OverlayShape::MaskQuad {
                    corners: r.corners().map(canvas),
                }]
            })
            .unwrap_or_default(),
        AnnotationShape::Keypoints { keypoints } => keypoint_primitives(keypoints, class_id, classes, view),
    }
}

fn keypoint_primitives(
    keypoints: &[Keypoint],
    class_id: ClassId,
    classes: &ClassList,
    view: &ViewTransform,
) -> Vec<OverlayShape> {
    let mut primitives = Vec::new();
    // skeleton edges first so joints draw on top
    if let Some(skeleton) = classes.get(class_id).and_then(|c| c.skeleton.as_ref()) {
        for &(a, b) in &skeleton.edges {
            if let (Some(ka), Some(kb)) = (keypoints.get(a), keypoints.get(b)) {
                if ka.is_labelled() && kb.is_labelled() {
                    primitives.push(OverlayShape::Line {
                        from: view.to_canvas_space(ka.position()),
                        to: view.to_canvas_space(kb.position()),
                    });
                }
            }
        }
    }
    for keypoint in keypoints.iter().filter(|k| k.is_labelled()) {
        primitives.push(OverlayShape::Point {
            at: view.to_canvas_space(keypoint.position()),
            radius: style::POINT_RADIUS,
            filled: keypoint.visibility == Visibility::Visible,
        });
    }
    primitives
}

/// Build the canvas-space overlay for the open image.
///
/// Annotations are emitted in z-order. A class id missing from `classes`
/// renders with the unknown-class colour.
pub fn build_overlay(
    store: &AnnotationStore,
    classes: &ClassList,
    view: &ViewTransform,
    tools: &ToolStateMachine,
    current_class: ClassId,
) -> Overlay {
    let mut overlay = Overlay::default();
    let selected = store.selected();

    for annotation in store.iter() {
        let color = with_alpha(classes.resolve(annotation.class_id).color(), style::STROKE_ALPHA);
        for shape in shape_primitives(&annotation.shape, annotation.class_id, classes, view) {
            let mut item = OverlayItem::new(Some(annotation.id), shape, color);
            item.selected = selected == Some(annotation.id);
            overlay.items.push(item);
        }
    }

    if let Some(shape) = tools.in_progress_shape() {
        let color = with_alpha(classes.resolve(current_class).color(), style::PREVIEW_ALPHA);
        overlay.preview = shape_primitives(&shape, current_class, classes, view)
            .into_iter()
            .map(|s| OverlayItem::new(None, s, color))
            .collect();
    }

    if let Some(annotation) = store.selected_annotation() {
        let color = with_alpha(classes.resolve(annotation.class_id).color(), style::STROKE_ALPHA);
        let knob_offset = view.canvas_to_image_length(ROTATION_HANDLE_OFFSET);
        overlay.handles = annotation
            .shape
            .handle_positions(knob_offset)
            .into_iter()
            .map(|(_, at)| {
                OverlayItem::new(
                    None,
                    OverlayShape::Handle {
                        at: view.to_canvas_space(at),
                        size: style::HANDLE_SIZE,
                    },
                    color,
                )
            })
            .collect();
    }

    overlay
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ClassDef, Skeleton, UNKNOWN_CLASS_COLOR};

    fn view() -> ViewTransform {
        ViewTransform::new(200, 100, 200.0, 100.0)
    }

    fn box_shape() -> AnnotationShape {
        AnnotationShape::BoundingBox {
            x: 10.0,
            y: 10.0,
            width: 50.0,
            height: 30.0,
        }
    }

    #[test]
    fn test_cache_invalidated_by_events() {
        let mut store = AnnotationStore::new(10);
        let events = store.subscribe();
        let mut cache: RenderCache<usize> = RenderCache::new();

        let id = store.add(1, box_shape()).unwrap();
        cache.get_or_insert_with(id, || 1);
        cache.get_or_insert_with(id, || 2);
        assert_eq!(cache.get(id), Some(&1));
        assert_eq!(cache.stats(), (1, 1));

        store.remove(id).unwrap();
        assert!(cache.sync(&events) > 0);
        assert!(!cache.contains(id));
    }

    #[test]
    fn test_cache_reset_clears_everything() {
        let mut cache: RenderCache<&str> = RenderCache::new();
        cache.get_or_insert_with(1, || "a");
        cache.get_or_insert_with(2, || "b");
        cache.apply_event(&ChangeEvent::SelectionChanged(Some(1)));
        assert_eq!(cache.len(), 2);
        cache.apply_event(&ChangeEvent::Reset);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_overlay_maps_to_canvas_and_uses_class_color() {
        let classes = ClassList::from_classes(vec![ClassDef::new(1, "car").with_color([255, 0, 0])]);
        let mut store = AnnotationStore::new(10);
        let id = store.add(1, box_shape()).unwrap();
        store.select(Some(id));
        // zoomed 2x about the centre
        let view = view().zoom_in(2.0);
        let overlay = build_overlay(&store, &classes, &view, &ToolStateMachine::new(10.0), 1);

        assert_eq!(overlay.items.len(), 1);
        let item = &overlay.items[0];
        assert_eq!(item.color, [255, 0, 0, style::STROKE_ALPHA]);
        assert!(item.selected);
        let OverlayShape::Polygon { vertices, closed } = &item.shape else {
            panic!("Expected polygon");
        };
        assert!(*closed);
        // (10, 10) -> centre (100, 50) + 2 * ((10, 10) - (100, 50))
        assert!((vertices[0].x + 80.0).abs() < 1e-3);
        assert!((vertices[0].y + 30.0).abs() < 1e-3);
        assert!(!overlay.handles.is_empty());
    }

    #[test]
    fn test_dangling_class_renders_unknown() {
        let mut store = AnnotationStore::new(10);
        store.add(42, box_shape()).unwrap();
        let overlay = build_overlay(&store, &ClassList::new(), &view(), &ToolStateMachine::new(10.0), 1);
        let [r, g, b, _] = overlay.items[0].color;
        assert_eq!([r, g, b], UNKNOWN_CLASS_COLOR);
    }

    #[test]
    fn test_keypoints_draw_skeleton_between_labelled_joints() {
        let skeleton = Skeleton::new(["head", "neck", "hip"], vec![(0, 1), (1, 2)]);
        let classes = ClassList::from_classes(vec![ClassDef::new(1, "person").with_skeleton(skeleton)]);
        let mut store = AnnotationStore::new(10);
        store
            .add(
                1,
                AnnotationShape::Keypoints {
                    keypoints: vec![
                        Keypoint::new(10.0, 10.0, Visibility::Visible),
                        Keypoint::new(10.0, 20.0, Visibility::Occluded),
                        Keypoint::absent(),
                    ],
                },
            )
            .unwrap();
        let overlay = build_overlay(&store, &classes, &view(), &ToolStateMachine::new(10.0), 1);
        let lines = overlay
            .items
            .iter()
            .filter(|i| matches!(i.shape, OverlayShape::Line { .. }))
            .count();
        let points: Vec<bool> = overlay
            .items
            .iter()
            .filter_map(|i| match i.shape {
                OverlayShape::Point { filled, .. } => Some(filled),
                _ => None,
            })
            .collect();
        assert_eq!(lines, 1);
        assert_eq!(points, vec![true, false]);
    }
}
