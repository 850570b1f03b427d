//! Command-line runs against files in a temporary directory.

mod common;

use std::path::Path;

use annocanvas::CliError;
use annocanvas::cli::{self, Cli};
use annocanvas::geometry::Rect;
use annocanvas::model::{AnnotationShape, ClassList, load_annotations};
use clap::Parser;

use common::{approx_rect, pattern, png};

fn path(p: &Path) -> &str {
    p.to_str().unwrap()
}

const ANNOTATIONS: &str = r#"{
    "version": 1,
    "annotations": [
        {"id": 1, "classId": 1, "type": "box", "x": 10, "y": 10, "width": 50, "height": 30},
        {"id": 2, "classId": 1, "type": "box", "x": 180, "y": 80, "width": 10, "height": 10}
    ]
}"#;

#[test]
fn augment_writes_image_and_document() {
    let dir = tempfile::tempdir().unwrap();
    let image = dir.path().join("in.png");
    let annotations = dir.path().join("in.json");
    let out_image = dir.path().join("out.png");
    let out_annotations = dir.path().join("out.json");
    std::fs::write(&image, png(&pattern(200, 100))).unwrap();
    std::fs::write(&annotations, ANNOTATIONS).unwrap();

    let cli = Cli::try_parse_from([
        "annocanvas",
        "augment",
        "--image",
        path(&image),
        "--annotations",
        path(&annotations),
        "--rotate",
        "90",
        "--brightness",
        "-10",
        "--out-image",
        path(&out_image),
        "--out-annotations",
        path(&out_annotations),
    ])
    .unwrap();
    let report = cli::execute(&cli).unwrap();
    assert!(report.starts_with("Augmented to 100x200: 2 annotation(s) kept, 0 dropped"));

    let decoded = image::open(&out_image).unwrap();
    assert_eq!((decoded.width(), decoded.height()), (100, 200));

    let json = std::fs::read_to_string(&out_annotations).unwrap();
    let loaded = load_annotations(&json, &ClassList::new()).unwrap();
    assert_eq!(loaded.annotations.len(), 2);
    assert!(matches!(loaded.annotations[0].shape, AnnotationShape::BoundingBox { .. }));
    assert!(approx_rect(
        loaded.annotations[0].shape.bounding_rect(),
        Rect::new(60.0, 10.0, 30.0, 50.0),
        1e-3
    ));
}

#[test]
fn inspect_summarises_document() {
    let dir = tempfile::tempdir().unwrap();
    let annotations = dir.path().join("in.json");
    let classes = dir.path().join("classes.json");
    std::fs::write(&annotations, ANNOTATIONS).unwrap();
    std::fs::write(&classes, r#"[{"id": 1, "name": "car", "color": [255, 0, 0]}]"#).unwrap();

    let cli = Cli::try_parse_from([
        "annocanvas",
        "inspect",
        "--annotations",
        path(&annotations),
        "--classes",
        path(&classes),
    ])
    .unwrap();
    let report = cli::execute(&cli).unwrap();
    assert!(report.starts_with("2 annotation(s)"));
    assert!(report.contains("car"));
    assert!(report.contains("No integrity issues"));
}

#[test]
fn undecodable_image_fails_without_output() {
    let dir = tempfile::tempdir().unwrap();
    let image = dir.path().join("broken.png");
    let out_image = dir.path().join("out.png");
    std::fs::write(&image, b"definitely not an image").unwrap();

    let cli = Cli::try_parse_from([
        "annocanvas",
        "augment",
        "--image",
        path(&image),
        "--flip-vertical",
        "--out-image",
        path(&out_image),
    ])
    .unwrap();
    assert!(matches!(cli::execute(&cli), Err(CliError::Augment(_))));
    assert!(!out_image.exists());
}
