//! geometry — letterbox transform and coordinate mapping
//!
//! Everything here is plain rectangle arithmetic in three coordinate spaces:
//! model space (the fixed square tensor fed to the network), source space
//! (the original image's pixels), and a consumer space (either a display
//! surface under aspect-fill, or image fractions in [0,1]).

/// Epsilon floor for IoU denominators — guards the degenerate case where
/// both boxes have zero area.
const IOU_EPS: f32 = 1e-6;

// ── Primitives ───────────────────────────────────────────────────────────────

/// Width × height pair, in whatever unit the caller is working in.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Size {
    pub width: f32,
    pub height: f32,
}

impl Size {
    pub fn new(width: f32, height: f32) -> Self {
        Self { width, height }
    }
}

/// Axis-aligned rectangle stored as top-left corner + extent.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rect {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

impl Rect {
    pub fn new(x: f32, y: f32, w: f32, h: f32) -> Self {
        Self { x, y, w, h }
    }

    pub fn right(&self) -> f32 {
        self.x + self.w
    }

    pub fn bottom(&self) -> f32 {
        self.y + self.h
    }

    pub fn area(&self) -> f32 {
        self.w * self.h
    }

    /// IoU (intersection over union) with another rect.
    ///
    /// Disjoint or empty pairs yield 0; the denominator is floored so two
    /// degenerate boxes never divide by zero.
    pub fn iou(&self, other: &Rect) -> f32 {
        let ix1 = self.x.max(other.x);
        let iy1 = self.y.max(other.y);
        let ix2 = self.right().min(other.right());
        let iy2 = self.bottom().min(other.bottom());
        let inter = (ix2 - ix1).max(0.0) * (iy2 - iy1).max(0.0);
        if inter == 0.0 {
            return 0.0;
        }
        inter / (self.area() + other.area() - inter).max(IOU_EPS)
    }
}

// ── Letterbox ────────────────────────────────────────────────────────────────

/// Uniform-scale-plus-centered-pad mapping from a source image into the
/// square model input.
///
/// Derived deterministically from `(input_size, source)`; `draw_rect` is the
/// region of the canvas the scaled image occupies and is always fully
/// contained in the `input_size × input_size` square.
#[derive(Debug, Clone, Copy)]
pub struct Letterbox {
    pub scale: f32,
    pub pad_x: f32,
    pub pad_y: f32,
    pub draw_rect: Rect,
    source: Size,
}

impl Letterbox {
    pub fn new(input_size: f32, source: Size) -> Self {
        let scale = (input_size / source.width).min(input_size / source.height);
        let scaled_w = source.width * scale;
        let scaled_h = source.height * scale;
        let pad_x = (input_size - scaled_w) / 2.0;
        let pad_y = (input_size - scaled_h) / 2.0;
        Self {
            scale,
            pad_x,
            pad_y,
            draw_rect: Rect::new(pad_x, pad_y, scaled_w, scaled_h),
            source,
        }
    }

    /// Map a source-space rect into model space.
    pub fn forward(&self, rect: Rect) -> Rect {
        Rect::new(
            rect.x * self.scale + self.pad_x,
            rect.y * self.scale + self.pad_y,
            rect.w * self.scale,
            rect.h * self.scale,
        )
    }

    /// Map a model-space rect back into source space, clamping every edge to
    /// the source bounds. Width/height never come out negative.
    ///
    /// Exact right-inverse of [`forward`](Self::forward) for rects inside the
    /// drawn region; only edge clamping breaks the equality.
    pub fn inverse(&self, model_rect: Rect) -> Rect {
        let x1 = (model_rect.x - self.pad_x) / self.scale;
        let y1 = (model_rect.y - self.pad_y) / self.scale;
        let x2 = (model_rect.right() - self.pad_x) / self.scale;
        let y2 = (model_rect.bottom() - self.pad_y) / self.scale;

        let cx1 = x1.clamp(0.0, self.source.width);
        let cy1 = y1.clamp(0.0, self.source.height);
        let cx2 = x2.clamp(0.0, self.source.width);
        let cy2 = y2.clamp(0.0, self.source.height);
        Rect::new(cx1, cy1, (cx2 - cx1).max(0.0), (cy2 - cy1).max(0.0))
    }
}

// ── Consumer-space mapping ───────────────────────────────────────────────────

/// Map a source-space rect into a view's pixel space under the aspect-fill
/// display convention (content scaled to cover the viewport, overflow cropped
/// equally on both sides).
pub fn map_to_aspect_fill(rect: Rect, source: Size, view: Size) -> Rect {
    let sx = view.width / source.width;
    let sy = view.height / source.height;
    let scale = sx.max(sy);

    let displayed_w = source.width * scale;
    let displayed_h = source.height * scale;
    let offset_x = (view.width - displayed_w) / 2.0;
    let offset_y = (view.height - displayed_h) / 2.0;

    Rect::new(
        rect.x * scale + offset_x,
        rect.y * scale + offset_y,
        rect.w * scale,
        rect.h * scale,
    )
}

/// Map a source-space rect to image fractions, every component clamped
/// to [0,1].
pub fn normalize_to_source(rect: Rect, source: Size) -> Rect {
    Rect::new(
        (rect.x / source.width).clamp(0.0, 1.0),
        (rect.y / source.height).clamp(0.0, 1.0),
        (rect.w / source.width).clamp(0.0, 1.0),
        (rect.h / source.height).clamp(0.0, 1.0),
    )
}
