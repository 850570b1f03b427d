//! Edit handles: hit testing and drag application for the select tool.

use crate::geometry::{Point, Rect, normalize_degrees};

use super::annotation::{AnnotationShape, oriented_corners, oriented_frame};

/// A corner of a (possibly oriented) box, named in the box's own frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Corner {
    TopLeft,
    TopRight,
    BottomRight,
    BottomLeft,
}

impl Corner {
    const ALL: [Corner; 4] = [
        Corner::TopLeft,
        Corner::TopRight,
        Corner::BottomRight,
        Corner::BottomLeft,
    ];

    /// Sign of the corner along the local x and y axes.
    fn signs(self) -> (f32, f32) {
        match self {
            Corner::TopLeft => (-1.0, -1.0),
            Corner::TopRight => (1.0, -1.0),
            Corner::BottomRight => (1.0, 1.0),
            Corner::BottomLeft => (-1.0, 1.0),
        }
    }
}

/// Midpoint of a box side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edge {
    Top,
    Right,
    Bottom,
    Left,
}

/// What part of an annotation a drag acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handle {
    /// Whole-shape move
    Body,
    Corner(Corner),
    Edge(Edge),
    /// Polygon vertex by index
    Vertex(usize),
    /// Keypoint by joint index
    Keypoint(usize),
    /// Oriented-box rotation knob
    Rotation,
}

impl Handle {
    pub fn is_resize(&self) -> bool {
        !matches!(self, Handle::Body)
    }
}

impl AnnotationShape {
    /// Handle positions in image space. `rotation_offset` is the distance of
    /// the rotation knob above an oriented box's top edge, in image pixels.
    pub fn handle_positions(&self, rotation_offset: f32) -> Vec<(Handle, Point)> {
        match self {
            AnnotationShape::BoundingBox {
                x,
                y,
                width,
                height,
            } => {
                let rect = Rect::new(*x, *y, *width, *height);
                let corners = rect.corners();
                let c = rect.center();
                let mut handles: Vec<(Handle, Point)> = Corner::ALL
                    .iter()
                    .zip(corners)
                    .map(|(corner, p)| (Handle::Corner(*corner), p))
                    .collect();
                handles.extend([
                    (Handle::Edge(Edge::Top), Point::new(c.x, rect.y)),
                    (Handle::Edge(Edge::Right), Point::new(rect.right(), c.y)),
                    (Handle::Edge(Edge::Bottom), Point::new(c.x, rect.bottom())),
                    (Handle::Edge(Edge::Left), Point::new(rect.x, c.y)),
                ]);
                handles
            }
            AnnotationShape::OrientedBox {
                cx,
                cy,
                width,
                height,
                angle_degrees,
            } => {
                let corners = oriented_corners(*cx, *cy, *width, *height, *angle_degrees);
                let mut handles: Vec<(Handle, Point)> = Corner::ALL
                    .iter()
                    .zip(corners)
                    .map(|(corner, p)| (Handle::Corner(*corner), p))
                    .collect();
                let knob = oriented_frame(*cx, *cy, *angle_degrees)
                    .apply(Point::new(0.0, -height / 2.0 - rotation_offset));
                handles.push((Handle::Rotation, knob));
                handles
            }
            AnnotationShape::Polygon { points } => points
                .iter()
                .enumerate()
                .map(|(i, p)| (Handle::Vertex(i), *p))
                .collect(),
            AnnotationShape::Keypoints { keypoints } => keypoints
                .iter()
                .enumerate()
                .filter(|(_, k)| k.is_labelled())
                .map(|(i, k)| (Handle::Keypoint(i), k.position()))
                .collect(),
            AnnotationShape::Mask { .. } => Vec::new(),
        }
    }

    /// Closest handle within `radius` of `point`, if any.
    pub fn hit_test_handle(&self, point: Point, radius: f32, rotation_offset: f32) -> Option<Handle> {
        self.handle_positions(rotation_offset)
            .into_iter()
            .map(|(handle, p)| (handle, p.distance_to(point)))
            .filter(|(_, d)| *d <= radius)
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(handle, _)| handle)
    }

    /// Geometry after dragging `handle` from `start` to `current`, both in
    /// image space. `self` is the shape as it was when the drag began.
    /// Returns `None` if the handle does not belong to this shape kind.
    pub fn apply_handle_drag(&self, handle: Handle, start: Point, current: Point) -> Option<AnnotationShape> {
        if handle == Handle::Body {
            return self.translated(current.x - start.x, current.y - start.y);
        }

        match (self, handle) {
            (
                AnnotationShape::BoundingBox {
                    x,
                    y,
                    width,
                    height,
                },
                Handle::Corner(corner),
            ) => {
                let rect = Rect::new(*x, *y, *width, *height);
                let opposite = match corner {
                    Corner::TopLeft => Point::new(rect.right(), rect.bottom()),
                    Corner::TopRight => Point::new(rect.x, rect.bottom()),
                    Corner::BottomRight => Point::new(rect.x, rect.y),
                    Corner::BottomLeft => Point::new(rect.right(), rect.y),
                };
                Some(AnnotationShape::bounding_box_from_corners(opposite, current))
            }
            (
                AnnotationShape::BoundingBox {
                    x,
                    y,
                    width,
                    height,
                },
                Handle::Edge(edge),
            ) => {
                let rect = Rect::new(*x, *y, *width, *height);
                let (p1, p2) = match edge {
                    Edge::Top => (
                        Point::new(rect.x, current.y),
                        Point::new(rect.right(), rect.bottom()),
                    ),
                    Edge::Bottom => (
                        Point::new(rect.x, rect.y),
                        Point::new(rect.right(), current.y),
                    ),
                    Edge::Left => (
                        Point::new(current.x, rect.y),
                        Point::new(rect.right(), rect.bottom()),
                    ),
                    Edge::Right => (
                        Point::new(rect.x, rect.y),
                        Point::new(current.x, rect.bottom()),
                    ),
                };
                Some(AnnotationShape::bounding_box_from_corners(p1, p2))
            }
            (
                AnnotationShape::OrientedBox {
                    cx,
                    cy,
                    width,
                    height,
                    angle_degrees,
                },
                Handle::Corner(corner),
            ) => {
                let frame = oriented_frame(*cx, *cy, *angle_degrees);
                let local = frame.inverse()?.apply(current);
                let (sx, sy) = corner.signs();
                let fixed = Point::new(-sx * width / 2.0, -sy * height / 2.0);
                let center = frame.apply(Point::new((local.x + fixed.x) / 2.0, (local.y + fixed.y) / 2.0));
                Some(AnnotationShape::OrientedBox {
                    cx: center.x,
                    cy: center.y,
                    width: (local.x - fixed.x).abs(),
                    height: (local.y - fixed.y).abs(),
                    angle_degrees: *angle_degrees,
                })
            }
            (
                AnnotationShape::OrientedBox {
                    cx,
                    cy,
                    width,
                    height,
                    ..
                },
                Handle::Rotation,
            ) => {
                let dx = current.x - cx;
                let dy = current.y - cy;
                if dx == 0.0 && dy == 0.0 {
                    return Some(self.clone());
                }
                Some(AnnotationShape::OrientedBox {
                    cx: *cx,
                    cy: *cy,
                    width: *width,
                    height: *height,
                    angle_degrees: normalize_degrees(dy.atan2(dx).to_degrees() + 90.0),
                })
            }
            (AnnotationShape::Polygon { points }, Handle::Vertex(index)) if index < points.len() => {
                let mut points = points.clone();
                points[index] = current;
                Some(AnnotationShape::Polygon { points })
            }
            (AnnotationShape::Keypoints { keypoints }, Handle::Keypoint(index))
                if index < keypoints.len() =>
            {
                let mut keypoints = keypoints.clone();
                keypoints[index].x = current.x;
                keypoints[index].y = current.y;
                Some(AnnotationShape::Keypoints { keypoints })
            }
            _ => None,
        }
    }
}
