//! End-to-end checks of the editing and augmentation scenarios.

mod common;

use annocanvas::augment::{self, AugmentConfig};
use annocanvas::config::EditorSettings;
use annocanvas::geometry::{Point, Rect};
use annocanvas::mask::{BrushMode, MaskRaster};
use annocanvas::model::{Annotation, AnnotationShape, ClassDef, ClassDeletion, ClassList, ImageRecord, Project};
use annocanvas::store::{AnnotationPatch, AnnotationStore};
use annocanvas::tools::{EditorContext, PointerEvent, ToolKind, ToolOutcome, ToolStateMachine};
use annocanvas::view::ViewTransform;
use annocanvas::EditError;

use common::{approx_rect, boxed, pattern, png};

#[test]
fn view_round_trip_holds_for_assorted_states() {
    let base = ViewTransform::new(640, 480, 800.0, 600.0);
    let views = [
        base,
        base.zoom_in(3.0).pan_by(-120.0, 45.0),
        base.with_rotation(90.0).zoom_out(2.0),
        base.with_rotation(33.0).pan_by(10.0, -10.0).zoom_in(1.7),
        base.with_rotation(270.0).fit_to_viewport(),
    ];
    let points = [
        Point::new(0.0, 0.0),
        Point::new(640.0, 480.0),
        Point::new(123.4, 56.7),
    ];
    for view in views {
        for p in points {
            let back = view.to_image_space(view.to_canvas_space(p));
            assert!((back.x - p.x).abs() < 1e-2, "{:?} -> {:?}", p, back);
            assert!((back.y - p.y).abs() < 1e-2, "{:?} -> {:?}", p, back);
        }
    }
}

#[test]
fn flip_horizontal_mirrors_box_about_centreline() {
    let blob = png(&pattern(200, 100));
    let config = AugmentConfig {
        flip_horizontal: true,
        ..AugmentConfig::default()
    };
    let output = augment::apply(&blob, &config, &[Annotation::new(1, 1, boxed(10.0, 10.0, 50.0, 30.0))])
        .unwrap();
    assert_eq!((output.width, output.height), (200, 100));
    assert!(approx_rect(
        output.annotations[0].shape.bounding_rect(),
        Rect::new(140.0, 10.0, 50.0, 30.0),
        1e-3
    ));
}

#[test]
fn rotate_90_swaps_canvas_and_refits_box() {
    let blob = png(&pattern(200, 100));
    let config = AugmentConfig {
        rotation_degrees: 90.0,
        ..AugmentConfig::default()
    };
    let output = augment::apply(&blob, &config, &[Annotation::new(1, 1, boxed(10.0, 10.0, 50.0, 30.0))])
        .unwrap();
    assert_eq!((output.width, output.height), (100, 200));
    assert!(matches!(output.annotations[0].shape, AnnotationShape::BoundingBox { .. }));
    assert!(approx_rect(
        output.annotations[0].shape.bounding_rect(),
        Rect::new(60.0, 10.0, 30.0, 50.0),
        1e-3
    ));
}

#[test]
fn off_canvas_mask_is_absent_not_empty() {
    let blob = png(&pattern(200, 100));
    let mut raster = MaskRaster::new(400, 400);
    raster.stroke(
        Point::new(320.0, 320.0),
        Point::new(380.0, 380.0),
        6.0,
        BrushMode::Paint,
    );
    let annotations = vec![
        Annotation::new(1, 1, AnnotationShape::Mask { raster }),
        Annotation::new(2, 1, boxed(10.0, 10.0, 50.0, 30.0)),
    ];
    let config = AugmentConfig {
        rotation_degrees: 90.0,
        ..AugmentConfig::default()
    };
    let output = augment::apply(&blob, &config, &annotations).unwrap();
    assert_eq!(output.dropped, vec![1]);
    assert!(output.annotations.iter().all(|a| a.id != 1));
    assert_eq!(output.annotations.len(), 1);
}

#[test]
fn flip_both_and_rotate_180_is_self_inverse_on_pixels_and_geometry() {
    let source = pattern(37, 23);
    let config = AugmentConfig {
        flip_horizontal: true,
        flip_vertical: true,
        rotation_degrees: 180.0,
        ..AugmentConfig::default()
    };
    let original = vec![
        Annotation::new(1, 1, boxed(3.0, 4.0, 10.0, 6.0)),
        Annotation::new(
            2,
            1,
            AnnotationShape::OrientedBox {
                cx: 18.0,
                cy: 11.0,
                width: 8.0,
                height: 4.0,
                angle_degrees: 25.0,
            },
        ),
        Annotation::new(
            3,
            1,
            AnnotationShape::Polygon {
                points: vec![Point::new(1.0, 1.0), Point::new(20.0, 2.0), Point::new(9.0, 19.0)],
            },
        ),
    ];

    let once = augment::apply(&png(&source), &config, &original).unwrap();
    let twice = augment::apply(&once.blob, &config, &once.annotations).unwrap();
    assert_eq!((twice.width, twice.height), (37, 23));
    let decoded = image::load_from_memory(&twice.blob).unwrap().to_rgba8();
    assert_eq!(decoded, source);

    assert_eq!(twice.annotations.len(), original.len());
    for (before, after) in original.iter().zip(&twice.annotations) {
        assert_eq!(before.id, after.id);
        assert!(approx_rect(
            after.shape.bounding_rect(),
            before.shape.bounding_rect().unwrap(),
            1e-3
        ));
    }
    let AnnotationShape::OrientedBox { angle_degrees, .. } = twice.annotations[1].shape else {
        panic!("Expected oriented box");
    };
    assert!((angle_degrees - 25.0).abs() < 1e-3);
}

#[test]
fn box_below_minimum_is_never_added() {
    let mut store = AnnotationStore::new(10);
    store.set_min_box_size(2.0);
    for (w, h) in [(2.0, 50.0), (50.0, 2.0), (0.5, 0.5), (0.0, 0.0)] {
        let result = store.add(1, boxed(10.0, 10.0, w, h));
        assert!(matches!(result, Err(EditError::Degenerate { .. })), "{} x {}", w, h);
    }
    assert!(store.is_empty());

    // through the tool as well
    let mut view = ViewTransform::new(200, 100, 200.0, 100.0);
    let classes = ClassList::from_classes(vec![ClassDef::new(1, "car")]);
    let settings = EditorSettings::default();
    let mut ctx = EditorContext {
        view: &mut view,
        store: &mut store,
        classes: &classes,
        current_class: 1,
        settings: &settings,
    };
    let mut tools = ToolStateMachine::new(settings.brush_size);
    tools.set_tool(ToolKind::Box, &mut ctx);
    tools.handle_pointer(PointerEvent::Down(Point::new(10.0, 10.0)), &mut ctx);
    tools.handle_pointer(PointerEvent::Move(Point::new(11.0, 80.0)), &mut ctx);
    let outcome = tools.handle_pointer(PointerEvent::Up(Point::new(11.0, 80.0)), &mut ctx);
    assert!(matches!(outcome, ToolOutcome::Rejected(EditError::Degenerate { .. })));
    assert!(ctx.store.is_empty());
}

#[test]
fn class_deletion_cascades_across_every_image() {
    let classes = ClassList::from_classes(vec![
        ClassDef::new(1, "car"),
        ClassDef::new(2, "tree"),
        ClassDef::new(3, "unused"),
    ]);
    let mut project = Project::new(classes);
    for image_id in 1..=3u64 {
        let mut record = ImageRecord::new(image_id, Vec::new(), 100, 100);
        record.annotations = vec![
            Annotation::new(1, 1, boxed(0.0, 0.0, 10.0, 10.0)),
            Annotation::new(2, 2, boxed(20.0, 20.0, 10.0, 10.0)),
        ];
        project.upsert_image(record);
    }

    assert!(matches!(project.request_class_deletion(3), ClassDeletion::Deleted(_)));
    assert_eq!(
        project.request_class_deletion(2),
        ClassDeletion::NeedsConfirmation {
            class_id: 2,
            annotation_count: 3,
            image_count: 3
        }
    );
    // nothing changes until confirmed
    assert_eq!(project.class_usage(2), (3, 3));

    assert_eq!(project.confirm_class_deletion(2), 3);
    for image in &project.images {
        assert_eq!(image.annotations.len(), 1);
        assert_eq!(image.annotations[0].class_id, 1);
    }
    assert!(project.integrity_report().is_empty());
}

#[test]
fn undo_past_bound_stops_at_oldest_retained_state() {
    let mut store = AnnotationStore::new(3);
    let id = store.add(1, boxed(0.0, 0.0, 10.0, 10.0)).unwrap();
    for step in 1..=5 {
        store
            .update(id, AnnotationPatch::shape(boxed(step as f32, 0.0, 10.0, 10.0)))
            .unwrap();
    }
    assert_eq!(store.history().undo_len(), 3);

    let mut undone = 0;
    while store.undo() {
        undone += 1;
    }
    assert_eq!(undone, 3);
    // edits 3, 4 and 5 were undone; the add and edits 1-2 fell off the bound
    let shape = &store.get(id).unwrap().shape;
    assert!(approx_rect(shape.bounding_rect(), Rect::new(2.0, 0.0, 10.0, 10.0), 1e-6));
}
