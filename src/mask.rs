//! Per-annotation single-channel coverage buffer for freehand masks.
//!
//! The buffer only covers the region that has been painted (clamped to the
//! image), not the whole image. Painting grows the region; erasing never
//! does. Brush dabs are anti-aliased discs with a one-pixel linear falloff,
//! computed from pixel centres, so the same input sequence always produces
//! the same coverage values.

use std::io::{Read, Write};

use ndarray::{Array2, s};
use ndarray_npy::{ReadNpyExt, WriteNpyExt};
use serde::{Deserialize, Serialize};

use crate::constants::MASK_INSIDE_THRESHOLD;
use crate::error::MaskIoError;
use crate::geometry::{Affine2, Point, Rect};

/// Whether a brush dab adds or removes coverage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrushMode {
    #[default]
    Paint,
    Erase,
}

/// Half-open pixel rectangle `[x0, x1) x [y0, y1)` in image pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PixelRect {
    x0: u32,
    y0: u32,
    x1: u32,
    y1: u32,
}

impl PixelRect {
    fn is_empty(&self) -> bool {
        self.x0 >= self.x1 || self.y0 >= self.y1
    }

    fn width(&self) -> u32 {
        self.x1.saturating_sub(self.x0)
    }

    fn height(&self) -> u32 {
        self.y1.saturating_sub(self.y0)
    }

    fn union(&self, other: &PixelRect) -> PixelRect {
        PixelRect {
            x0: self.x0.min(other.x0),
            y0: self.y0.min(other.y0),
            x1: self.x1.max(other.x1),
            y1: self.y1.max(other.y1),
        }
    }

    fn intersect(&self, other: &PixelRect) -> PixelRect {
        PixelRect {
            x0: self.x0.max(other.x0),
            y0: self.y0.max(other.y0),
            x1: self.x1.min(other.x1),
            y1: self.y1.min(other.y1),
        }
    }

    /// Pixels touched by a float rectangle, clamped to `[0, w) x [0, h)`.
    fn covering(rect: Rect, w: u32, h: u32) -> PixelRect {
        let clamp = |v: f32, max: u32| -> u32 { v.max(0.0).min(max as f32) as u32 };
        PixelRect {
            x0: clamp(rect.x.floor(), w),
            y0: clamp(rect.y.floor(), h),
            x1: clamp(rect.right().ceil(), w),
            y1: clamp(rect.bottom().ceil(), h),
        }
    }

    fn to_rect(self) -> Rect {
        Rect::new(
            self.x0 as f32,
            self.y0 as f32,
            self.width() as f32,
            self.height() as f32,
        )
    }
}

/// Coverage buffer owned by a single mask annotation.
#[derive(Debug, Clone, PartialEq)]
pub struct MaskRaster {
    image_width: u32,
    image_height: u32,
    /// Top-left of the allocated region, in image pixels
    origin_x: u32,
    origin_y: u32,
    /// Coverage values, indexed `[row, column]` relative to the origin
    data: Array2<u8>,
    /// Tight bounds of pixels at or above [`MASK_INSIDE_THRESHOLD`], in
    /// image pixels. Fainter edge coverage may lie outside it.
    bounds: Option<PixelRect>,
}

impl MaskRaster {
    /// Create an empty raster for an image of the given size. No pixel
    /// memory is allocated until the first paint dab.
    pub fn new(image_width: u32, image_height: u32) -> Self {
        Self {
            image_width,
            image_height,
            origin_x: 0,
            origin_y: 0,
            data: Array2::zeros((0, 0)),
            bounds: None,
        }
    }

    pub fn image_size(&self) -> (u32, u32) {
        (self.image_width, self.image_height)
    }

    /// The allocated region in image pixels.
    pub fn region(&self) -> Rect {
        self.region_pixels().to_rect()
    }

    fn region_pixels(&self) -> PixelRect {
        let (rows, cols) = self.data.dim();
        PixelRect {
            x0: self.origin_x,
            y0: self.origin_y,
            x1: self.origin_x + cols as u32,
            y1: self.origin_y + rows as u32,
        }
    }

    /// Cached bounding rectangle of the pixels counted as inside.
    pub fn bounding_rect(&self) -> Option<Rect> {
        self.bounds.map(PixelRect::to_rect)
    }

    /// True when no pixel counts as inside. Faint anti-aliased residue
    /// alone does not make a mask.
    pub fn is_empty(&self) -> bool {
        self.bounds.is_none()
    }

    /// Coverage at an image pixel. Pixels outside the region read as zero.
    pub fn value_at(&self, x: u32, y: u32) -> u8 {
        let region = self.region_pixels();
        if x < region.x0 || x >= region.x1 || y < region.y0 || y >= region.y1 {
            return 0;
        }
        self.data[[(y - region.y0) as usize, (x - region.x0) as usize]]
    }

    /// Exact hit test against the coverage buffer.
    pub fn contains(&self, point: Point) -> bool {
        if point.x < 0.0 || point.y < 0.0 {
            return false;
        }
        self.value_at(point.x.floor() as u32, point.y.floor() as u32) >= MASK_INSIDE_THRESHOLD
    }

    /// Number of pixels counted as inside the mask.
    pub fn area(&self) -> usize {
        self.data
            .iter()
            .filter(|&&v| v >= MASK_INSIDE_THRESHOLD)
            .count()
    }

    /// Apply a single disc-shaped dab. Returns whether any pixel of the
    /// image was within reach of the brush.
    pub fn dab(&mut self, center: Point, radius: f32, mode: BrushMode) -> bool {
        let touched = self.dab_inner(center, radius, mode);
        if touched && mode == BrushMode::Erase {
            self.recompute_bounds();
        }
        touched
    }

    /// Paint or erase along a segment with evenly spaced dabs.
    pub fn stroke(&mut self, from: Point, to: Point, radius: f32, mode: BrushMode) -> bool {
        let radius = radius.max(0.5);
        let spacing = (radius * 0.25).max(0.5);
        let steps = (from.distance_to(to) / spacing).ceil().max(1.0) as u32;
        let mut touched = false;
        for i in 0..=steps {
            let t = i as f32 / steps as f32;
            let p = Point::new(from.x + (to.x - from.x) * t, from.y + (to.y - from.y) * t);
            touched |= self.dab_inner(p, radius, mode);
        }
        if touched && mode == BrushMode::Erase {
            self.recompute_bounds();
        }
        touched
    }

    fn dab_inner(&mut self, center: Point, radius: f32, mode: BrushMode) -> bool {
        let radius = radius.max(0.5);
        let reach = Rect::new(
            center.x - radius - 1.0,
            center.y - radius - 1.0,
            2.0 * radius + 2.0,
            2.0 * radius + 2.0,
        );
        let mut target = PixelRect::covering(reach, self.image_width, self.image_height);
        if target.is_empty() {
            return false;
        }

        match mode {
            BrushMode::Paint => self.ensure_region(target),
            BrushMode::Erase => {
                target = target.intersect(&self.region_pixels());
                if target.is_empty() {
                    return true;
                }
            }
        }

        let region = self.region_pixels();
        for py in target.y0..target.y1 {
            for px in target.x0..target.x1 {
                let dx = px as f32 + 0.5 - center.x;
                let dy = py as f32 + 0.5 - center.y;
                let coverage = (radius + 0.5 - (dx * dx + dy * dy).sqrt()).clamp(0.0, 1.0);
                let value = (coverage * 255.0).round() as u8;
                if value == 0 {
                    continue;
                }
                let cell = &mut self.data[[(py - region.y0) as usize, (px - region.x0) as usize]];
                *cell = match mode {
                    BrushMode::Paint => (*cell).max(value),
                    BrushMode::Erase => (*cell).min(255 - value),
                };
            }
        }
        if mode == BrushMode::Paint {
            self.extend_bounds(target);
        }
        true
    }

    /// Grow the cached bounds by the inside pixels of `target`. Paint only
    /// adds coverage, so the rest of the region needs no rescan.
    fn extend_bounds(&mut self, target: PixelRect) {
        let region = self.region_pixels();
        let window = self.data.slice(s![
            (target.y0 - region.y0) as usize..(target.y1 - region.y0) as usize,
            (target.x0 - region.x0) as usize..(target.x1 - region.x0) as usize
        ]);
        if let Some(found) = inside_bounds(window.indexed_iter(), target.x0, target.y0) {
            self.bounds = Some(match self.bounds {
                Some(b) => b.union(&found),
                None => found,
            });
        }
    }

    /// Grow the allocated region so it contains `target`.
    fn ensure_region(&mut self, target: PixelRect) {
        let current = self.region_pixels();
        let wanted = if current.is_empty() {
            target
        } else {
            current.union(&target)
        };
        if wanted == current {
            return;
        }
        self.reallocate(wanted);
    }

    fn reallocate(&mut self, wanted: PixelRect) {
        let current = self.region_pixels();
        let mut data = Array2::zeros((wanted.height() as usize, wanted.width() as usize));
        let overlap = current.intersect(&wanted);
        if !overlap.is_empty() {
            let src = self.data.slice(s![
                (overlap.y0 - current.y0) as usize..(overlap.y1 - current.y0) as usize,
                (overlap.x0 - current.x0) as usize..(overlap.x1 - current.x0) as usize
            ]);
            data.slice_mut(s![
                (overlap.y0 - wanted.y0) as usize..(overlap.y1 - wanted.y0) as usize,
                (overlap.x0 - wanted.x0) as usize..(overlap.x1 - wanted.x0) as usize
            ])
            .assign(&src);
        }
        log::trace!(
            "Mask region {}x{} -> {}x{}",
            current.width(),
            current.height(),
            wanted.width(),
            wanted.height()
        );
        self.origin_x = wanted.x0;
        self.origin_y = wanted.y0;
        self.data = data;
    }

    fn recompute_bounds(&mut self) {
        let region = self.region_pixels();
        self.bounds = inside_bounds(self.data.indexed_iter(), region.x0, region.y0);
    }

    /// Shrink the allocated region to the inside pixels, dropping faint
    /// residue beyond them.
    pub fn compact(&mut self) {
        match self.bounds {
            Some(bounds) if bounds != self.region_pixels() => self.reallocate(bounds),
            Some(_) => {}
            None => {
                self.origin_x = 0;
                self.origin_y = 0;
                self.data = Array2::zeros((0, 0));
            }
        }
    }

    /// Resample the mask into a canvas of `out_width` x `out_height` under
    /// `transform` (image space of `self` to the new canvas). Nearest
    /// neighbour sampling at pixel centres, so flips and quarter turns are
    /// exact. Returns `None` when nothing of the mask lands on the canvas.
    pub fn transformed(
        &self,
        transform: &Affine2,
        out_width: u32,
        out_height: u32,
    ) -> Option<MaskRaster> {
        if self.is_empty() {
            return None;
        }
        // the whole region, so faint edges outside the bounds travel too
        let source = self.region();
        let inverse = transform.inverse()?;
        let mapped = Rect::enclosing(source.corners().iter().map(|c| transform.apply(*c)))?;
        // a hair of slack so float noise never drops an edge column
        let target = PixelRect::covering(mapped.expanded(1e-3), out_width, out_height);
        if target.is_empty() {
            return None;
        }

        let mut out = MaskRaster::new(out_width, out_height);
        out.reallocate(target);
        for oy in target.y0..target.y1 {
            for ox in target.x0..target.x1 {
                let (sx, sy) = inverse.apply_f64(f64::from(ox) + 0.5, f64::from(oy) + 0.5);
                if sx < 0.0 || sy < 0.0 {
                    continue;
                }
                let value = self.value_at(sx.floor() as u32, sy.floor() as u32);
                if value != 0 {
                    out.data[[(oy - target.y0) as usize, (ox - target.x0) as usize]] = value;
                }
            }
        }
        out.recompute_bounds();
        out.compact();
        if out.is_empty() { None } else { Some(out) }
    }

    /// Shift the mask by a translation in image pixels, cropping at the
    /// image edges.
    pub fn translated(&self, dx: f32, dy: f32) -> Option<MaskRaster> {
        self.transformed(
            &Affine2::translate(f64::from(dx), f64::from(dy)),
            self.image_width,
            self.image_height,
        )
    }

    /// Export the allocated region as a 2D `u8` NumPy array.
    pub fn write_npy<W: Write>(&self, writer: W) -> Result<(), MaskIoError> {
        self.data.write_npy(writer)?;
        Ok(())
    }

    /// Import a coverage region written by [`MaskRaster::write_npy`].
    pub fn read_npy<R: Read>(
        reader: R,
        origin: (u32, u32),
        image_size: (u32, u32),
    ) -> Result<Self, MaskIoError> {
        let data = Array2::<u8>::read_npy(reader)?;
        let (rows, cols) = data.dim();
        let (origin_x, origin_y) = origin;
        if origin_x as usize + cols > image_size.0 as usize
            || origin_y as usize + rows > image_size.1 as usize
        {
            return Err(MaskIoError::Region(format!(
                "{}x{} region at ({}, {}) exceeds {}x{} image",
                cols, rows, origin_x, origin_y, image_size.0, image_size.1
            )));
        }
        let mut mask = Self {
            image_width: image_size.0,
            image_height: image_size.1,
            origin_x,
            origin_y,
            data,
            bounds: None,
        };
        mask.recompute_bounds();
        Ok(mask)
    }
}

/// Bounds of the pixels at or above [`MASK_INSIDE_THRESHOLD`] among
/// `(row, col)`-indexed values whose `[0, 0]` sits at `(x0, y0)`.
fn inside_bounds<'a>(
    values: impl Iterator<Item = ((usize, usize), &'a u8)>,
    x0: u32,
    y0: u32,
) -> Option<PixelRect> {
    values
        .filter(|&(_, &v)| v >= MASK_INSIDE_THRESHOLD)
        .map(|((row, col), _)| PixelRect {
            x0: x0 + col as u32,
            y0: y0 + row as u32,
            x1: x0 + col as u32 + 1,
            y1: y0 + row as u32 + 1,
        })
        .reduce(|a, b| a.union(&b))
}

/// Persisted run-length form of a [`MaskRaster`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaskRecord {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub image_width: u32,
    pub image_height: u32,
    /// Row-major `(value, count)` runs
    pub runs: Vec<(u8, u32)>,
}

impl From<MaskRaster> for MaskRecord {
    fn from(mask: MaskRaster) -> Self {
        let region = mask.region_pixels();
        let mut runs: Vec<(u8, u32)> = Vec::new();
        for &v in mask.data.iter() {
            match runs.last_mut() {
                Some((value, count)) if *value == v => *count += 1,
                _ => runs.push((v, 1)),
            }
        }
        Self {
            x: region.x0,
            y: region.y0,
            width: region.width(),
            height: region.height(),
            image_width: mask.image_width,
            image_height: mask.image_height,
            runs,
        }
    }
}

impl TryFrom<MaskRecord> for MaskRaster {
    type Error = String;

    fn try_from(record: MaskRecord) -> Result<Self, Self::Error> {
        if u64::from(record.x) + u64::from(record.width) > u64::from(record.image_width)
            || u64::from(record.y) + u64::from(record.height) > u64::from(record.image_height)
        {
            return Err(format!(
                "mask region {}x{} at ({}, {}) exceeds {}x{} image",
                record.width, record.height, record.x, record.y, record.image_width, record.image_height
            ));
        }
        let expected = record.width as usize * record.height as usize;
        let total: usize = record.runs.iter().map(|(_, n)| *n as usize).sum();
        if total != expected {
            return Err(format!(
                "mask runs cover {} pixels, region has {}",
                total, expected
            ));
        }
        let mut values = Vec::with_capacity(expected);
        for (value, count) in record.runs {
            values.extend(std::iter::repeat_n(value, count as usize));
        }
        let data = Array2::from_shape_vec((record.height as usize, record.width as usize), values)
            .map_err(|e| e.to_string())?;
        let mut mask = MaskRaster {
            image_width: record.image_width,
            image_height: record.image_height,
            origin_x: record.x,
            origin_y: record.y,
            data,
            bounds: None,
        };
        mask.recompute_bounds();
        Ok(mask)
    }
}

impl Serialize for MaskRaster {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        MaskRecord::from(self.clone()).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for MaskRaster {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let record = MaskRecord::deserialize(deserializer)?;
        MaskRaster::try_from(record).map_err(serde::de::Error::custom)
    }
}
