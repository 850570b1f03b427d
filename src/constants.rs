//! Default values for the editing engine

/// Minimum size (width and height, image pixels) a new box must exceed.
pub const DEFAULT_MIN_BOX_SIZE: f32 = 1.0;

/// Hit radius for resize/rotation handles, in canvas pixels.
pub const DEFAULT_HANDLE_HIT_RADIUS: f32 = 8.0;

/// Hit radius for keypoint selection, in canvas pixels.
pub const DEFAULT_KEYPOINT_HIT_RADIUS: f32 = 6.0;

/// Pointer travel (canvas pixels) before a press turns into a drag.
pub const DEFAULT_MIN_DRAG_DISTANCE: f32 = 2.0;

/// Distance (canvas pixels) to the first vertex that closes a polygon.
pub const DEFAULT_POLYGON_CLOSE_DISTANCE: f32 = 10.0;

/// Number of undoable operations retained per image.
pub const DEFAULT_UNDO_HISTORY: usize = 100;

/// Default mask brush radius, in image pixels.
pub const DEFAULT_BRUSH_SIZE: f32 = 10.0;

/// Minimum number of vertices required for a valid polygon.
pub const MIN_POLYGON_VERTICES: usize = 3;

/// Zoom limits and step factor.
pub mod zoom {
    pub const MIN: f32 = 0.05;
    pub const MAX: f32 = 40.0;
    pub const STEP: f32 = 1.2;
}

/// Distance (canvas pixels) of the oriented-box rotation handle above the
/// top edge.
pub const ROTATION_HANDLE_OFFSET: f32 = 24.0;

/// Coverage value at or above which a mask pixel counts as inside.
pub const MASK_INSIDE_THRESHOLD: u8 = 128;

/// Photometric parameter range (signed offset, 0 = no change).
pub const PHOTOMETRIC_LIMIT: f32 = 100.0;

/// Overlay styling, in canvas pixels.
pub mod overlay {
    pub const POINT_RADIUS: f32 = 4.0;
    pub const HANDLE_SIZE: f32 = 8.0;
    /// Alpha of committed annotation outlines
    pub const STROKE_ALPHA: u8 = 255;
    /// Alpha of in-progress previews
    pub const PREVIEW_ALPHA: u8 = 160;
}
