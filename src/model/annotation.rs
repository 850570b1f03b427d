//! Annotation records and their geometry, always in unrotated image space.

use serde::{Deserialize, Serialize};

use crate::constants::MIN_POLYGON_VERTICES;
use crate::error::EditError;
use crate::geometry::{Affine2, Point, Rect, normalize_degrees};
use crate::mask::MaskRaster;

/// Unique identifier for an annotation within an image. Never reused.
pub type AnnotationId = u64;

/// Identifier of a class in the project's class list.
pub type ClassId = u32;

/// Visibility state of a single keypoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    /// Not labelled; position is meaningless
    Absent,
    /// Labelled but hidden behind something
    Occluded,
    #[default]
    Visible,
}

/// One joint position of a keypoint set.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Keypoint {
    pub x: f32,
    pub y: f32,
    #[serde(default)]
    pub visibility: Visibility,
}

impl Keypoint {
    pub fn new(x: f32, y: f32, visibility: Visibility) -> Self {
        Self { x, y, visibility }
    }

    pub fn absent() -> Self {
        Self::new(0.0, 0.0, Visibility::Absent)
    }

    pub fn position(&self) -> Point {
        Point::new(self.x, self.y)
    }

    pub fn is_labelled(&self) -> bool {
        self.visibility != Visibility::Absent
    }
}

/// Shape data for an annotation (in image coordinates).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum AnnotationShape {
    /// Axis-aligned box defined by top-left corner and size.
    #[serde(rename = "box")]
    BoundingBox {
        x: f32,
        y: f32,
        width: f32,
        height: f32,
    },
    /// Rectangle rotated about its centre.
    OrientedBox {
        cx: f32,
        cy: f32,
        width: f32,
        height: f32,
        angle_degrees: f32,
    },
    /// Closed polygon; the last vertex connects back to the first.
    Polygon { points: Vec<Point> },
    /// Freehand coverage raster.
    Mask { raster: MaskRaster },
    /// Joint positions ordered like the class skeleton.
    #[serde(rename = "keypointSet")]
    Keypoints { keypoints: Vec<Keypoint> },
}

/// Corners of an oriented box: top-left, top-right, bottom-right,
/// bottom-left in the box's own frame.
pub fn oriented_corners(cx: f32, cy: f32, width: f32, height: f32, angle_degrees: f32) -> [Point; 4] {
    let frame = oriented_frame(cx, cy, angle_degrees);
    let (hw, hh) = (width / 2.0, height / 2.0);
    [
        frame.apply(Point::new(-hw, -hh)),
        frame.apply(Point::new(hw, -hh)),
        frame.apply(Point::new(hw, hh)),
        frame.apply(Point::new(-hw, hh)),
    ]
}

/// Transform from an oriented box's local frame (origin at its centre) to
/// image space.
pub fn oriented_frame(cx: f32, cy: f32, angle_degrees: f32) -> Affine2 {
    Affine2::rotate_degrees(f64::from(angle_degrees))
        .then(&Affine2::translate(f64::from(cx), f64::from(cy)))
}

/// Signed area of a closed polygon (shoelace formula).
pub fn polygon_area(points: &[Point]) -> f32 {
    if points.len() < MIN_POLYGON_VERTICES {
        return 0.0;
    }
    let mut sum = 0.0f64;
    for (i, p) in points.iter().enumerate() {
        let q = points[(i + 1) % points.len()];
        sum += f64::from(p.x) * f64::from(q.y) - f64::from(q.x) * f64::from(p.y);
    }
    (sum / 2.0) as f32
}

/// Point-in-polygon test using ray casting.
pub fn polygon_contains(points: &[Point], point: Point) -> bool {
    if points.len() < MIN_POLYGON_VERTICES {
        return false;
    }
    let mut inside = false;
    let mut j = points.len() - 1;
    for i in 0..points.len() {
        let (pi, pj) = (points[i], points[j]);
        if (pi.y > point.y) != (pj.y > point.y)
            && point.x < (pj.x - pi.x) * (point.y - pi.y) / (pj.y - pi.y) + pi.x
        {
            inside = !inside;
        }
        j = i;
    }
    inside
}

impl AnnotationShape {
    /// Create a normalized bounding box from two corner points.
    pub fn bounding_box_from_corners(p1: Point, p2: Point) -> Self {
        let rect = Rect::from_corners(p1, p2);
        AnnotationShape::BoundingBox {
            x: rect.x,
            y: rect.y,
            width: rect.width,
            height: rect.height,
        }
    }

    /// Short name used in logs and errors.
    pub fn kind_name(&self) -> &'static str {
        match self {
            AnnotationShape::BoundingBox { .. } => "box",
            AnnotationShape::OrientedBox { .. } => "oriented box",
            AnnotationShape::Polygon { .. } => "polygon",
            AnnotationShape::Mask { .. } => "mask",
            AnnotationShape::Keypoints { .. } => "keypoint set",
        }
    }

    pub fn is_mask(&self) -> bool {
        matches!(self, AnnotationShape::Mask { .. })
    }

    /// Axis-aligned bounding rectangle, used as a hit-test prefilter.
    pub fn bounding_rect(&self) -> Option<Rect> {
        match self {
            AnnotationShape::BoundingBox {
                x,
                y,
                width,
                height,
            } => Some(Rect::new(*x, *y, *width, *height)),
            AnnotationShape::OrientedBox {
                cx,
                cy,
                width,
                height,
                angle_degrees,
            } => Rect::enclosing(oriented_corners(*cx, *cy, *width, *height, *angle_degrees)),
            AnnotationShape::Polygon { points } => Rect::enclosing(points.iter().copied()),
            AnnotationShape::Mask { raster } => raster.bounding_rect(),
            AnnotationShape::Keypoints { keypoints } => Rect::enclosing(
                keypoints
                    .iter()
                    .filter(|k| k.is_labelled())
                    .map(Keypoint::position),
            ),
        }
    }

    /// Exact hit test. `point_radius` is the pick radius for keypoints in
    /// image pixels.
    pub fn contains_point(&self, point: Point, point_radius: f32) -> bool {
        match self {
            AnnotationShape::BoundingBox { .. } => self
                .bounding_rect()
                .is_some_and(|rect| rect.contains(point)),
            AnnotationShape::OrientedBox {
                cx,
                cy,
                width,
                height,
                angle_degrees,
            } => {
                let Some(to_local) = oriented_frame(*cx, *cy, *angle_degrees).inverse() else {
                    return false;
                };
                let local = to_local.apply(point);
                local.x.abs() <= width / 2.0 && local.y.abs() <= height / 2.0
            }
            AnnotationShape::Polygon { points } => polygon_contains(points, point),
            AnnotationShape::Mask { raster } => raster.contains(point),
            AnnotationShape::Keypoints { keypoints } => keypoints
                .iter()
                .filter(|k| k.is_labelled())
                .any(|k| k.position().distance_to(point) <= point_radius),
        }
    }

    /// Check the geometry is storable. Boxes must exceed `min_box_size` in
    /// both dimensions.
    pub fn validate(&self, min_box_size: f32) -> Result<(), EditError> {
        let kind = self.kind_name();
        match self {
            AnnotationShape::BoundingBox {
                x,
                y,
                width,
                height,
            } => {
                if ![*x, *y, *width, *height].iter().all(|v| v.is_finite()) {
                    return Err(EditError::degenerate(kind, "non-finite coordinates"));
                }
                check_box_size(kind, *width, *height, min_box_size)
            }
            AnnotationShape::OrientedBox {
                cx,
                cy,
                width,
                height,
                angle_degrees,
            } => {
                if ![*cx, *cy, *width, *height, *angle_degrees]
                    .iter()
                    .all(|v| v.is_finite())
                {
                    return Err(EditError::degenerate(kind, "non-finite coordinates"));
                }
                check_box_size(kind, *width, *height, min_box_size)
            }
            AnnotationShape::Polygon { points } => {
                if points.len() < MIN_POLYGON_VERTICES {
                    return Err(EditError::degenerate(
                        kind,
                        format!("{} vertices, need {}", points.len(), MIN_POLYGON_VERTICES),
                    ));
                }
                if !points.iter().all(|p| p.x.is_finite() && p.y.is_finite()) {
                    return Err(EditError::degenerate(kind, "non-finite coordinates"));
                }
                if polygon_area(points).abs() <= f32::EPSILON {
                    return Err(EditError::degenerate(kind, "zero area"));
                }
                Ok(())
            }
            AnnotationShape::Mask { raster } => {
                if raster.is_empty() {
                    Err(EditError::EmptyMask)
                } else {
                    Ok(())
                }
            }
            AnnotationShape::Keypoints { keypoints } => {
                if keypoints.iter().any(Keypoint::is_labelled) {
                    Ok(())
                } else {
                    Err(EditError::degenerate(kind, "no labelled keypoints"))
                }
            }
        }
    }

    /// The same shape moved by `(dx, dy)`. Returns `None` if a mask is
    /// moved entirely off the image.
    pub fn translated(&self, dx: f32, dy: f32) -> Option<AnnotationShape> {
        Some(match self {
            AnnotationShape::BoundingBox {
                x,
                y,
                width,
                height,
            } => AnnotationShape::BoundingBox {
                x: x + dx,
                y: y + dy,
                width: *width,
                height: *height,
            },
            AnnotationShape::OrientedBox {
                cx,
                cy,
                width,
                height,
                angle_degrees,
            } => AnnotationShape::OrientedBox {
                cx: cx + dx,
                cy: cy + dy,
                width: *width,
                height: *height,
                angle_degrees: *angle_degrees,
            },
            AnnotationShape::Polygon { points } => AnnotationShape::Polygon {
                points: points.iter().map(|p| p.offset(dx, dy)).collect(),
            },
            AnnotationShape::Mask { raster } => AnnotationShape::Mask {
                raster: raster.translated(dx, dy)?,
            },
            AnnotationShape::Keypoints { keypoints } => AnnotationShape::Keypoints {
                keypoints: keypoints
                    .iter()
                    .map(|k| {
                        if k.is_labelled() {
                            Keypoint::new(k.x + dx, k.y + dy, k.visibility)
                        } else {
                            *k
                        }
                    })
                    .collect(),
            },
        })
    }

    /// Canonical form: oriented box angle in `[0, 360)`.
    pub fn normalized(mut self) -> Self {
        if let AnnotationShape::OrientedBox { angle_degrees, .. } = &mut self {
            *angle_degrees = normalize_degrees(*angle_degrees);
        }
        self
    }
}

fn check_box_size(kind: &'static str, width: f32, height: f32, min: f32) -> Result<(), EditError> {
    if width > min && height > min {
        Ok(())
    } else {
        Err(EditError::degenerate(
            kind,
            format!("{:.2}x{:.2} does not exceed minimum {:.2}", width, height, min),
        ))
    }
}

/// A stored annotation: identity, class assignment and geometry.
///
/// Render-only data never lives here; see [`crate::render::RenderCache`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Annotation {
    pub id: AnnotationId,
    pub class_id: ClassId,
    #[serde(flatten)]
    pub shape: AnnotationShape,
}

impl Annotation {
    pub fn new(id: AnnotationId, class_id: ClassId, shape: AnnotationShape) -> Self {
        Self {
            id,
            class_id,
            shape,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mask::BrushMode;

    #[test]
    fn test_box_from_corners_is_normalized() {
        let shape =
            AnnotationShape::bounding_box_from_corners(Point::new(50.0, 80.0), Point::new(10.0, 20.0));
        assert_eq!(shape.bounding_rect(), Some(Rect::new(10.0, 20.0, 40.0, 60.0)));
    }

    #[test]
    fn test_box_below_threshold_is_degenerate() {
        let thin = AnnotationShape::BoundingBox {
            x: 0.0,
            y: 0.0,
            width: 30.0,
            height: 1.0,
        };
        assert!(matches!(
            thin.validate(1.0),
            Err(EditError::Degenerate { shape: "box", .. })
        ));
        let ok = AnnotationShape::BoundingBox {
            x: 0.0,
            y: 0.0,
            width: 30.0,
            height: 1.5,
        };
        assert!(ok.validate(1.0).is_ok());
    }

    #[test]
    fn test_oriented_box_contains_respects_angle() {
        let shape = AnnotationShape::OrientedBox {
            cx: 50.0,
            cy: 50.0,
            width: 40.0,
            height: 4.0,
            angle_degrees: 90.0,
        };
        assert!(shape.contains_point(Point::new(50.0, 65.0), 0.0));
        assert!(!shape.contains_point(Point::new(65.0, 50.0), 0.0));
        let rect = shape.bounding_rect().unwrap();
        assert!((rect.height - 40.0).abs() < 1e-3);
    }

    #[test]
    fn test_polygon_validation_and_hit() {
        let square = vec![
            Point::new(0.0, 0.0),
            Point::new(10.0, 0.0),
            Point::new(10.0, 10.0),
            Point::new(0.0, 10.0),
        ];
        let shape = AnnotationShape::Polygon {
            points: square.clone(),
        };
        assert!(shape.validate(1.0).is_ok());
        assert!(shape.contains_point(Point::new(5.0, 5.0), 0.0));
        assert!(!shape.contains_point(Point::new(15.0, 5.0), 0.0));

        let collinear = AnnotationShape::Polygon {
            points: vec![Point::new(0.0, 0.0), Point::new(5.0, 5.0), Point::new(10.0, 10.0)],
        };
        assert!(collinear.validate(1.0).is_err());
    }

    #[test]
    fn test_keypoints_need_a_labelled_joint() {
        let none = AnnotationShape::Keypoints {
            keypoints: vec![Keypoint::absent(), Keypoint::absent()],
        };
        assert!(none.validate(1.0).is_err());
        let one = AnnotationShape::Keypoints {
            keypoints: vec![Keypoint::absent(), Keypoint::new(3.0, 4.0, Visibility::Occluded)],
        };
        assert!(one.validate(1.0).is_ok());
        assert_eq!(one.bounding_rect(), Some(Rect::new(3.0, 4.0, 0.0, 0.0)));
    }

    #[test]
    fn test_empty_mask_is_rejected() {
        let shape = AnnotationShape::Mask {
            raster: MaskRaster::new(10, 10),
        };
        assert_eq!(shape.validate(1.0), Err(EditError::EmptyMask));
    }

    #[test]
    fn test_translate_keeps_absent_keypoints() {
        let shape = AnnotationShape::Keypoints {
            keypoints: vec![Keypoint::absent(), Keypoint::new(1.0, 1.0, Visibility::Visible)],
        };
        let moved = shape.translated(5.0, 5.0).unwrap();
        let AnnotationShape::Keypoints { keypoints } = moved else {
            panic!("Expected keypoints");
        };
        assert_eq!(keypoints[0], Keypoint::absent());
        assert_eq!(keypoints[1].position(), Point::new(6.0, 6.0));
    }

    #[test]
    fn test_normalized_wraps_angle() {
        let shape = AnnotationShape::OrientedBox {
            cx: 0.0,
            cy: 0.0,
            width: 2.0,
            height: 2.0,
            angle_degrees: -30.0,
        }
        .normalized();
        let AnnotationShape::OrientedBox { angle_degrees, .. } = shape else {
            panic!("Expected oriented box");
        };
        assert!((angle_degrees - 330.0).abs() < 1e-4);
    }

    #[test]
    fn test_json_shape_is_tagged() {
        let ann = Annotation::new(
            7,
            2,
            AnnotationShape::OrientedBox {
                cx: 1.0,
                cy: 2.0,
                width: 3.0,
                height: 4.0,
                angle_degrees: 45.0,
            },
        );
        let json = serde_json::to_value(&ann).unwrap();
        assert_eq!(json["type"], "orientedBox");
        assert_eq!(json["classId"], 2);
        assert_eq!(json["angleDegrees"], 45.0);
        let back: Annotation = serde_json::from_value(json).unwrap();
        assert_eq!(back, ann);

        let mut raster = MaskRaster::new(20, 20);
        raster.dab(Point::new(10.0, 10.0), 3.0, BrushMode::Paint);
        let mask = Annotation::new(8, 1, AnnotationShape::Mask { raster });
        let json = serde_json::to_value(&mask).unwrap();
        assert_eq!(json["type"], "mask");
        assert!(json["raster"]["runs"].is_array());
    }
}
