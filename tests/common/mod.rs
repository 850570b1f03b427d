//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::io::Cursor;

use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};

use annocanvas::{AnnotationShape, Rect};

/// Deterministic test pattern so pixel comparisons catch misplaced rows.
pub fn pattern(width: u32, height: u32) -> RgbaImage {
    RgbaImage::from_fn(width, height, |x, y| {
        Rgba([(x * 7 % 256) as u8, (y * 13 % 256) as u8, ((x ^ y) % 256) as u8, 255])
    })
}

pub fn png(image: &RgbaImage) -> Vec<u8> {
    let mut blob = Vec::new();
    DynamicImage::ImageRgba8(image.clone())
        .write_to(&mut Cursor::new(&mut blob), ImageFormat::Png)
        .expect("encode test png");
    blob
}

pub fn boxed(x: f32, y: f32, width: f32, height: f32) -> AnnotationShape {
    AnnotationShape::BoundingBox {
        x,
        y,
        width,
        height,
    }
}

pub fn approx_rect(actual: Option<Rect>, expected: Rect, epsilon: f32) -> bool {
    actual.is_some_and(|r| {
        (r.x - expected.x).abs() < epsilon
            && (r.y - expected.y).abs() < epsilon
            && (r.width - expected.width).abs() < epsilon
            && (r.height - expected.height).abs() < epsilon
    })
}
