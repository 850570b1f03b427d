//! Augmentation engine: geometric and photometric transforms that keep
//! annotations consistent with the transformed pixels.
//!
//! Geometry is applied in a fixed order: horizontal flip, vertical flip,
//! then rotation about the image centre. The output canvas grows to the
//! rotated bounding box, so rotated content is never cropped. Every
//! annotation is re-derived through the same affine map.

use std::io::Cursor;

use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
use serde::{Deserialize, Serialize};

use crate::constants::PHOTOMETRIC_LIMIT;
use crate::error::AugmentError;
use crate::geometry::{Affine2, GEOMETRY_EPSILON, Point, Rect, normalize_degrees, snapped_cos_sin};
use crate::model::{Annotation, AnnotationId, AnnotationShape, ImageId, ImageRecord, Keypoint};

/// One augmentation recipe.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AugmentConfig {
    pub flip_horizontal: bool,
    pub flip_vertical: bool,
    /// Clockwise rotation about the image centre
    pub rotation_degrees: f32,
    /// -100..=100, 0 leaves pixels unchanged
    pub brightness: f32,
    /// -100..=100, 0 leaves pixels unchanged
    pub contrast: f32,
    /// -100..=100, 0 leaves pixels unchanged; -100 is greyscale
    pub saturation: f32,
}

impl AugmentConfig {
    pub fn validate(&self) -> Result<(), AugmentError> {
        if !self.rotation_degrees.is_finite() {
            return Err(AugmentError::InvalidConfig(format!(
                "rotation {} is not finite",
                self.rotation_degrees
            )));
        }
        for (name, value) in [
            ("brightness", self.brightness),
            ("contrast", self.contrast),
            ("saturation", self.saturation),
        ] {
            if !value.is_finite() || value.abs() > PHOTOMETRIC_LIMIT {
                return Err(AugmentError::InvalidConfig(format!(
                    "{} {} outside -{}..={}",
                    name, value, PHOTOMETRIC_LIMIT, PHOTOMETRIC_LIMIT
                )));
            }
        }
        Ok(())
    }

    pub fn has_photometric(&self) -> bool {
        self.brightness != 0.0 || self.contrast != 0.0 || self.saturation != 0.0
    }
}

/// The affine map from source image space to the output canvas, with the
/// output canvas size.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeometricPlan {
    pub transform: Affine2,
    pub source_width: u32,
    pub source_height: u32,
    /// Clockwise rotation, added to oriented-box angles
    pub rotation_degrees: f32,
    pub out_width: u32,
    pub out_height: u32,
}

impl GeometricPlan {
    pub fn new(width: u32, height: u32, config: &AugmentConfig) -> Self {
        let w = f64::from(width);
        let h = f64::from(height);
        let mut transform = Affine2::identity();
        if config.flip_horizontal {
            transform = transform.then(&Affine2 {
                a: -1.0,
                tx: w,
                ..Affine2::identity()
            });
        }
        if config.flip_vertical {
            transform = transform.then(&Affine2 {
                d: -1.0,
                ty: h,
                ..Affine2::identity()
            });
        }

        let degrees = f64::from(config.rotation_degrees);
        let (cos, sin) = snapped_cos_sin(degrees);
        let out_w = ((w * cos).abs() + (h * sin).abs() - 1e-6).ceil().max(1.0);
        let out_h = ((w * sin).abs() + (h * cos).abs() - 1e-6).ceil().max(1.0);
        transform = transform
            .then(&Affine2::translate(-w / 2.0, -h / 2.0))
            .then(&Affine2::rotate_degrees(degrees))
            .then(&Affine2::translate(out_w / 2.0, out_h / 2.0));

        Self {
            transform,
            source_width: width,
            source_height: height,
            rotation_degrees: config.rotation_degrees,
            out_width: out_w as u32,
            out_height: out_h as u32,
        }
    }

    pub fn canvas(&self) -> Rect {
        Rect::new(0.0, 0.0, self.out_width as f32, self.out_height as f32)
    }
}

/// Result of augmenting one image.
#[derive(Debug, Clone)]
pub struct AugmentOutput {
    /// PNG-encoded output pixels
    pub blob: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub annotations: Vec<Annotation>,
    /// Annotations that fell entirely outside the output canvas
    pub dropped: Vec<AnnotationId>,
}

/// Decode, transform and re-encode an image with its annotations.
///
/// Fails as a whole if the blob cannot be decoded or the output cannot be
/// encoded; no partial result is ever returned.
pub fn apply(
    blob: &[u8],
    config: &AugmentConfig,
    annotations: &[Annotation],
) -> Result<AugmentOutput, AugmentError> {
    config.validate()?;
    let decoded = image::load_from_memory(blob).map_err(AugmentError::Decode)?;
    let source = decoded.to_rgba8();
    let (pixels, annotations, dropped) = apply_decoded(&source, config, annotations);

    let (width, height) = pixels.dimensions();
    let mut encoded = Vec::new();
    DynamicImage::ImageRgba8(pixels)
        .write_to(&mut Cursor::new(&mut encoded), ImageFormat::Png)
        .map_err(AugmentError::Encode)?;

    log::debug!(
        "Augmented {}x{} -> {}x{}, {} annotation(s) kept, {} dropped",
        source.width(),
        source.height(),
        width,
        height,
        annotations.len(),
        dropped.len()
    );
    Ok(AugmentOutput {
        blob: encoded,
        width,
        height,
        annotations,
        dropped,
    })
}

/// Augment an already decoded image. Infallible.
pub fn apply_decoded(
    source: &RgbaImage,
    config: &AugmentConfig,
    annotations: &[Annotation],
) -> (RgbaImage, Vec<Annotation>, Vec<AnnotationId>) {
    let plan = GeometricPlan::new(source.width(), source.height(), config);
    let mut pixels = warp_pixels(source, &plan);
    if config.has_photometric() {
        adjust_photometric(&mut pixels, config.brightness, config.contrast, config.saturation);
    }
    let (kept, dropped) = transform_annotations(annotations, &plan);
    (pixels, kept, dropped)
}

/// Build a new image record from an augmented source record.
pub fn augment_record(
    record: &ImageRecord,
    config: &AugmentConfig,
    new_id: ImageId,
) -> Result<ImageRecord, AugmentError> {
    let output = apply(&record.blob, config, &record.annotations)?;
    let mut augmented = ImageRecord::new(new_id, output.blob, output.width, output.height);
    augmented.annotations = output.annotations;
    Ok(augmented)
}

/// Re-derive every annotation under `plan`. Returns the kept annotations
/// (ids unchanged) and the ids of dropped ones.
pub fn transform_annotations(
    annotations: &[Annotation],
    plan: &GeometricPlan,
) -> (Vec<Annotation>, Vec<AnnotationId>) {
    let mut kept = Vec::with_capacity(annotations.len());
    let mut dropped = Vec::new();
    for annotation in annotations {
        match transform_shape(&annotation.shape, plan) {
            Some(shape) => kept.push(Annotation::new(annotation.id, annotation.class_id, shape)),
            None => {
                log::debug!(
                    "Dropped {} {}: outside the augmented canvas",
                    annotation.shape.kind_name(),
                    annotation.id
                );
                dropped.push(annotation.id);
            }
        }
    }
    (kept, dropped)
}

/// Map one shape through `plan`, or `None` if nothing of it lands on the
/// output canvas.
pub fn transform_shape(shape: &AnnotationShape, plan: &GeometricPlan) -> Option<AnnotationShape> {
    let m = &plan.transform;
    let canvas = plan.canvas();
    match shape {
        AnnotationShape::BoundingBox {
            x,
            y,
            width,
            height,
        } => {
            // enclosing re-fit of the mapped corners, then clip
            let corners = Rect::new(*x, *y, *width, *height).corners();
            let fitted = Rect::enclosing(corners.iter().map(|c| m.apply(*c)))?;
            let clipped = fitted.intersection(&canvas)?;
            (clipped.width > 0.0 && clipped.height > 0.0).then(|| AnnotationShape::BoundingBox {
                x: clipped.x,
                y: clipped.y,
                width: clipped.width,
                height: clipped.height,
            })
        }
        AnnotationShape::OrientedBox {
            cx,
            cy,
            width,
            height,
            angle_degrees,
        } => {
            let bounds = shape.bounding_rect()?;
            let mapped = Rect::enclosing(bounds.corners().iter().map(|c| m.apply(*c)))?;
            overlaps(&mapped, &canvas).then_some(())?;
            let center = m.apply(Point::new(*cx, *cy));
            let base = if m.is_mirroring() {
                -angle_degrees
            } else {
                *angle_degrees
            };
            Some(AnnotationShape::OrientedBox {
                cx: center.x,
                cy: center.y,
                width: *width,
                height: *height,
                angle_degrees: normalize_degrees(base + plan.rotation_degrees),
            })
        }
        AnnotationShape::Polygon { points } => {
            let mapped: Vec<Point> = points.iter().map(|p| m.apply(*p)).collect();
            let bounds = Rect::enclosing(mapped.iter().copied())?;
            overlaps(&bounds, &canvas).then_some(())?;
            let clipped = AnnotationShape::Polygon {
                points: clip_polygon(&mapped, &canvas),
            };
            match clipped.validate(0.0) {
                Ok(()) => Some(clipped),
                Err(e) => {
                    log::debug!("Polygon clipped away: {}", e);
                    None
                }
            }
        }
        AnnotationShape::Keypoints { keypoints } => {
            let mapped: Vec<Keypoint> = keypoints
                .iter()
                .map(|k| {
                    if !k.is_labelled() {
                        return Keypoint::absent();
                    }
                    let p = m.apply(k.position());
                    if canvas.contains(p) {
                        Keypoint::new(p.x, p.y, k.visibility)
                    } else {
                        Keypoint::absent()
                    }
                })
                .collect();
            mapped
                .iter()
                .any(Keypoint::is_labelled)
                .then_some(AnnotationShape::Keypoints { keypoints: mapped })
        }
        AnnotationShape::Mask { raster } => raster
            .transformed(m, plan.out_width, plan.out_height)
            .map(|raster| AnnotationShape::Mask { raster }),
    }
}

/// Positive-area overlap test.
fn overlaps(a: &Rect, b: &Rect) -> bool {
    a.x < b.right() && a.right() > b.x && a.y < b.bottom() && a.bottom() > b.y
}

/// Sutherland-Hodgman clip of a polygon against an axis-aligned rectangle.
/// Returns the part of the polygon inside `rect`, possibly empty.
fn clip_polygon(points: &[Point], rect: &Rect) -> Vec<Point> {
    // signed distance to each edge, non-negative on the inside
    let edges: [fn(Point, &Rect) -> f32; 4] = [
        |p: Point, r: &Rect| p.x - r.x,
        |p: Point, r: &Rect| r.right() - p.x,
        |p: Point, r: &Rect| p.y - r.y,
        |p: Point, r: &Rect| r.bottom() - p.y,
    ];
    let mut output = points.to_vec();
    for distance in edges {
        let input = std::mem::take(&mut output);
        let Some(&last) = input.last() else {
            break;
        };
        let mut previous = last;
        for current in input {
            let d_prev = distance(previous, rect);
            let d_cur = distance(current, rect);
            if (d_cur >= 0.0) != (d_prev >= 0.0) {
                let t = d_prev / (d_prev - d_cur);
                output.push(Point::new(
                    previous.x + (current.x - previous.x) * t,
                    previous.y + (current.y - previous.y) * t,
                ));
            }
            if d_cur >= 0.0 {
                output.push(current);
            }
            previous = current;
        }
    }
    output
}

/// Resample `source` into the plan's output canvas. Uncovered pixels are
/// transparent. Samples at pixel centres; flips and quarter turns copy
/// pixels exactly.
pub fn warp_pixels(source: &RgbaImage, plan: &GeometricPlan) -> RgbaImage {
    let mut out = RgbaImage::new(plan.out_width, plan.out_height);
    let Some(inverse) = plan.transform.inverse() else {
        log::error!("Singular augmentation transform; output left blank");
        return out;
    };
    let (sw, sh) = (f64::from(source.width()), f64::from(source.height()));
    for (ox, oy, pixel) in out.enumerate_pixels_mut() {
        let (sx, sy) = inverse.apply_f64(f64::from(ox) + 0.5, f64::from(oy) + 0.5);
        let slack = GEOMETRY_EPSILON;
        if sx < -slack || sy < -slack || sx > sw + slack || sy > sh + slack {
            continue;
        }
        *pixel = sample_bilinear(source, sx - 0.5, sy - 0.5);
    }
    out
}

/// Bilinear sample at continuous pixel coordinates, clamping to the edge.
fn sample_bilinear(source: &RgbaImage, x: f64, y: f64) -> Rgba<u8> {
    let max_x = f64::from(source.width().saturating_sub(1));
    let max_y = f64::from(source.height().saturating_sub(1));
    let x = x.clamp(0.0, max_x);
    let y = y.clamp(0.0, max_y);
    let x0 = x.floor();
    let y0 = y.floor();
    let fx = x - x0;
    let fy = y - y0;
    let x1 = (x0 + 1.0).min(max_x);
    let y1 = (y0 + 1.0).min(max_y);

    let p00 = source.get_pixel(x0 as u32, y0 as u32).0;
    let p10 = source.get_pixel(x1 as u32, y0 as u32).0;
    let p01 = source.get_pixel(x0 as u32, y1 as u32).0;
    let p11 = source.get_pixel(x1 as u32, y1 as u32).0;

    let mut result = [0u8; 4];
    for c in 0..4 {
        let top = f64::from(p00[c]) * (1.0 - fx) + f64::from(p10[c]) * fx;
        let bottom = f64::from(p01[c]) * (1.0 - fx) + f64::from(p11[c]) * fx;
        result[c] = (top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8;
    }
    Rgba(result)
}

/// Multiplier for a contrast value in -100..=100.
fn contrast_factor(contrast: f32) -> f32 {
    let c = contrast * 2.55;
    (259.0 * (c + 255.0)) / (255.0 * (259.0 - c))
}

/// Brightness, then contrast, then saturation, per pixel. Channels clamp;
/// alpha is untouched.
pub fn adjust_photometric(image: &mut RgbaImage, brightness: f32, contrast: f32, saturation: f32) {
    let offset = brightness.clamp(-PHOTOMETRIC_LIMIT, PHOTOMETRIC_LIMIT) / 100.0 * 255.0;
    let factor = contrast_factor(contrast.clamp(-PHOTOMETRIC_LIMIT, PHOTOMETRIC_LIMIT));
    let sat = 1.0 + saturation.clamp(-PHOTOMETRIC_LIMIT, PHOTOMETRIC_LIMIT) / 100.0;

    for pixel in image.pixels_mut() {
        let mut rgb = [0f32; 3];
        for (c, value) in rgb.iter_mut().enumerate() {
            let v = (f32::from(pixel.0[c]) + offset).clamp(0.0, 255.0);
            *value = (factor * (v - 128.0) + 128.0).clamp(0.0, 255.0);
        }
        let luma = 0.299 * rgb[0] + 0.587 * rgb[1] + 0.114 * rgb[2];
        for (c, value) in rgb.iter().enumerate() {
            pixel.0[c] = (luma + (value - luma) * sat).round().clamp(0.0, 255.0) as u8;
        }
    }
}
