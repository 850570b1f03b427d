//! View transform between image-pixel space and canvas space.
//!
//! A canvas point is computed as
//! `viewport_center + pan + zoom * R(rotation) * (image_point - image_center)`.
//! Rotation belongs to the view only; stored geometry is always in
//! unrotated image space.

use crate::constants::zoom;
use crate::geometry::{Affine2, Point, snapped_cos_sin};

/// Zoom, pan and display rotation for one image in one viewport.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewTransform {
    pub zoom: f32,
    pub pan_x: f32,
    pub pan_y: f32,
    /// Display rotation in degrees, clockwise, in `[0, 360)`
    pub rotation_degrees: f32,
    pub image_width: f32,
    pub image_height: f32,
    pub viewport_width: f32,
    pub viewport_height: f32,
    pub min_zoom: f32,
    pub max_zoom: f32,
}

impl ViewTransform {
    /// Unrotated view at zoom 1, image centred in the viewport.
    pub fn new(image_width: u32, image_height: u32, viewport_width: f32, viewport_height: f32) -> Self {
        Self {
            zoom: 1.0,
            pan_x: 0.0,
            pan_y: 0.0,
            rotation_degrees: 0.0,
            image_width: image_width as f32,
            image_height: image_height as f32,
            viewport_width,
            viewport_height,
            min_zoom: zoom::MIN,
            max_zoom: zoom::MAX,
        }
    }

    pub fn with_zoom_limits(mut self, min_zoom: f32, max_zoom: f32) -> Self {
        self.min_zoom = min_zoom;
        self.max_zoom = max_zoom.max(min_zoom);
        self.zoom = self.clamp_zoom(self.zoom);
        self
    }

    pub fn clamp_zoom(&self, zoom: f32) -> f32 {
        zoom.clamp(self.min_zoom, self.max_zoom)
    }

    pub fn viewport_center(&self) -> Point {
        Point::new(self.viewport_width / 2.0, self.viewport_height / 2.0)
    }

    pub fn image_center(&self) -> Point {
        Point::new(self.image_width / 2.0, self.image_height / 2.0)
    }

    /// Affine map from image space to canvas space.
    pub fn image_to_canvas(&self) -> Affine2 {
        let ic = self.image_center();
        let vc = self.viewport_center();
        Affine2::translate(-f64::from(ic.x), -f64::from(ic.y))
            .then(&Affine2::rotate_degrees(f64::from(self.rotation_degrees)))
            .then(&Affine2::scale(f64::from(self.zoom), f64::from(self.zoom)))
            .then(&Affine2::translate(
                f64::from(vc.x + self.pan_x),
                f64::from(vc.y + self.pan_y),
            ))
    }

    /// Affine map from canvas space to image space.
    pub fn canvas_to_image(&self) -> Affine2 {
        let ic = self.image_center();
        let vc = self.viewport_center();
        let inv_zoom = 1.0 / f64::from(self.zoom);
        Affine2::translate(
            -f64::from(vc.x + self.pan_x),
            -f64::from(vc.y + self.pan_y),
        )
        .then(&Affine2::scale(inv_zoom, inv_zoom))
        .then(&Affine2::rotate_degrees(-f64::from(self.rotation_degrees)))
        .then(&Affine2::translate(f64::from(ic.x), f64::from(ic.y)))
    }

    pub fn to_image_space(&self, canvas_point: Point) -> Point {
        self.canvas_to_image().apply(canvas_point)
    }

    pub fn to_canvas_space(&self, image_point: Point) -> Point {
        self.image_to_canvas().apply(image_point)
    }

    /// Convert a canvas-space length (e.g. a hit radius in screen pixels)
    /// to image pixels.
    pub fn canvas_to_image_length(&self, length: f32) -> f32 {
        length / self.zoom
    }

    pub fn image_to_canvas_length(&self, length: f32) -> f32 {
        length * self.zoom
    }

    /// Pan needed so that `image_point` lands on `canvas_point` at the
    /// current zoom and rotation.
    fn pan_pinning(&self, image_point: Point, canvas_point: Point) -> (f32, f32) {
        let ic = self.image_center();
        let vc = self.viewport_center();
        let (cos, sin) = snapped_cos_sin(f64::from(self.rotation_degrees));
        let dx = f64::from(image_point.x - ic.x);
        let dy = f64::from(image_point.y - ic.y);
        let z = f64::from(self.zoom);
        let rx = z * (cos * dx - sin * dy);
        let ry = z * (sin * dx + cos * dy);
        (
            (f64::from(canvas_point.x - vc.x) - rx) as f32,
            (f64::from(canvas_point.y - vc.y) - ry) as f32,
        )
    }

    /// Zoom keeping the image point under `cursor` fixed on screen. The
    /// new zoom is clamped to the view's limits.
    #[must_use]
    pub fn zoom_to_cursor(&self, new_zoom: f32, cursor: Point) -> ViewTransform {
        let anchor = self.to_image_space(cursor);
        let mut next = *self;
        next.zoom = self.clamp_zoom(new_zoom);
        let (pan_x, pan_y) = next.pan_pinning(anchor, cursor);
        next.pan_x = pan_x;
        next.pan_y = pan_y;
        next
    }

    /// Zoom in by `factor` about the viewport centre.
    #[must_use]
    pub fn zoom_in(&self, factor: f32) -> ViewTransform {
        self.zoom_to_cursor(self.zoom * factor, self.viewport_center())
    }

    /// Zoom out by `factor` about the viewport centre.
    #[must_use]
    pub fn zoom_out(&self, factor: f32) -> ViewTransform {
        self.zoom_to_cursor(self.zoom / factor, self.viewport_center())
    }

    #[must_use]
    pub fn pan_by(&self, dx: f32, dy: f32) -> ViewTransform {
        ViewTransform {
            pan_x: self.pan_x + dx,
            pan_y: self.pan_y + dy,
            ..*self
        }
    }

    /// Set the display rotation, keeping the image point at the viewport
    /// centre where it is.
    #[must_use]
    pub fn with_rotation(&self, degrees: f32) -> ViewTransform {
        let center = self.viewport_center();
        let anchor = self.to_image_space(center);
        let mut next = *self;
        next.rotation_degrees = crate::geometry::normalize_degrees(degrees);
        let (pan_x, pan_y) = next.pan_pinning(anchor, center);
        next.pan_x = pan_x;
        next.pan_y = pan_y;
        next
    }

    #[must_use]
    pub fn rotate_by(&self, delta_degrees: f32) -> ViewTransform {
        self.with_rotation(self.rotation_degrees + delta_degrees)
    }

    /// Zoom and centre so the whole (rotated) image fits the viewport.
    #[must_use]
    pub fn fit_to_viewport(&self) -> ViewTransform {
        let (cos, sin) = snapped_cos_sin(f64::from(self.rotation_degrees));
        let w = f64::from(self.image_width);
        let h = f64::from(self.image_height);
        let rotated_w = (w * cos).abs() + (h * sin).abs();
        let rotated_h = (w * sin).abs() + (h * cos).abs();
        let zoom = if rotated_w > 0.0 && rotated_h > 0.0 {
            (f64::from(self.viewport_width) / rotated_w).min(f64::from(self.viewport_height) / rotated_h)
                as f32
        } else {
            1.0
        };
        ViewTransform {
            zoom: self.clamp_zoom(zoom),
            pan_x: 0.0,
            pan_y: 0.0,
            ..*self
        }
    }

    /// Resize the viewport without moving the image relative to its centre.
    #[must_use]
    pub fn with_viewport(&self, viewport_width: f32, viewport_height: f32) -> ViewTransform {
        ViewTransform {
            viewport_width,
            viewport_height,
            ..*self
        }
    }
}
