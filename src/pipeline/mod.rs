//! pipeline — serialized detection orchestrator
//!
//! A `Detector` owns the model session, label list, and tuning config behind
//! one mutex: at most one inference or reconfiguration runs at a time, and a
//! caller never observes a half-updated configuration. Detection is advisory
//! to the surrounding application — every per-call failure degrades to an
//! empty list, and only `configure` surfaces a distinguishable error.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use image::RgbImage;
use tracing::{info, warn};

use crate::backend::{load_labels, ConfigureError, InferenceBackend, OrtBackend};
use crate::decode::{decode, nms};
use crate::geometry::{map_to_aspect_fill, normalize_to_source, Rect, Size};
use crate::preprocess::Preprocessor;
use crate::preprocess::RgbFrame;

/// Default minimum interval between streaming inferences (~10 calls/sec).
pub const DEFAULT_MIN_INTERVAL: Duration = Duration::from_millis(100);

// ── Public types ─────────────────────────────────────────────────────────────

/// One detected object. `bbox` semantics depend on the call that produced it:
/// view pixels under aspect-fill for [`Detector::detect_frame`], image
/// fractions in [0,1] for [`Detector::detect_image`].
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub label: String,
    pub confidence: f32,
    pub bbox: Rect,
}

/// Model tuning parameters, fixed at configuration time.
///
/// Defaults mirror the canonical upstream export: 640-square input, a
/// permissive 0.02 confidence floor, 0.45 IoU, at most 50 boxes per call.
#[derive(Debug, Clone, Copy)]
pub struct ModelConfig {
    /// Side of the square model input.
    pub input_size: u32,
    pub conf_threshold: f32,
    pub iou_threshold: f32,
    pub max_detections: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            input_size: 640,
            conf_threshold: 0.02,
            iou_threshold: 0.45,
            max_detections: 50,
        }
    }
}

/// Point-in-time view of the pipeline's internals, for diagnostics overlays
/// and threshold tuning. Reading it never perturbs detection state.
#[derive(Debug, Clone, Default)]
pub struct DebugSnapshot {
    pub configured: bool,
    pub label_count: usize,
    /// Shape of the most recent raw output tensor.
    pub output_shape: Vec<usize>,
    /// Highest combined score seen in the most recent decode.
    pub max_score: f32,
    pub max_label: String,
    /// Candidates surviving the confidence threshold in the last call.
    pub candidates: usize,
    /// Boxes surviving NMS in the last call.
    pub selected: usize,
    pub failed_calls: u64,
    pub dropped_frames: u64,
}

// ── Throttle ─────────────────────────────────────────────────────────────────

/// Minimum-interval gate for streaming input. Frames arriving faster than
/// the interval are dropped, never queued — detection must not build a
/// backlog against a live camera.
pub struct FrameGate {
    min_interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl FrameGate {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last: Mutex::new(None),
        }
    }

    /// True if enough time has passed since the last accepted frame; accepts
    /// and stamps the current instant when it is.
    pub fn try_pass(&self) -> bool {
        let mut last = lock_or_recover(&self.last);
        let now = Instant::now();
        match *last {
            Some(t) if now.duration_since(t) < self.min_interval => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}

// ── Result delivery ──────────────────────────────────────────────────────────

type Sink = Arc<dyn Fn(&[Detection]) + Send + Sync>;

/// Latest-wins delivery of streaming results: one current-subscriber slot
/// plus the most recent result set. No buffering; publications carry a
/// sequence number and an older publication never replaces a newer one.
#[derive(Default)]
pub struct DetectionBus {
    slot: Mutex<BusSlot>,
}

#[derive(Default)]
struct BusSlot {
    sink: Option<Sink>,
    latest: Option<Vec<Detection>>,
    latest_seq: Option<u64>,
}

impl DetectionBus {
    /// Install a subscriber, replacing any previous one.
    pub fn subscribe(&self, sink: impl Fn(&[Detection]) + Send + Sync + 'static) {
        lock_or_recover(&self.slot).sink = Some(Arc::new(sink));
    }

    pub fn unsubscribe(&self) {
        lock_or_recover(&self.slot).sink = None;
    }

    /// Store `detections` as the latest result and notify the subscriber.
    ///
    /// `seq` orders publications by detection completion: a publication older
    /// than the one already stored is dropped whole, so a slow caller never
    /// overwrites a newer result and its stale list never reaches the sink.
    /// The sink runs outside the slot lock and may re-enter the bus —
    /// `latest`, `subscribe`, even a nested `publish` — without deadlocking.
    pub fn publish(&self, seq: u64, detections: Vec<Detection>) {
        let sink = {
            let mut slot = lock_or_recover(&self.slot);
            if slot.latest_seq.is_some_and(|last| seq < last) {
                return;
            }
            slot.latest_seq = Some(seq);
            slot.latest = Some(detections.clone());
            slot.sink.clone()
        };
        if let Some(sink) = sink {
            sink(&detections);
        }
    }

    /// The most recent published result, if any.
    pub fn latest(&self) -> Option<Vec<Detection>> {
        lock_or_recover(&self.slot).latest.clone()
    }
}

// ── Detector ─────────────────────────────────────────────────────────────────

struct Configured {
    backend: Box<dyn InferenceBackend>,
    labels: Vec<String>,
    config: ModelConfig,
    preprocessor: Preprocessor,
}

#[derive(Default)]
struct DecodeStats {
    output_shape: Vec<usize>,
    max_score: f32,
    max_label: String,
    candidates: usize,
    selected: usize,
}

#[derive(Default)]
struct Inner {
    state: Option<Configured>,
    stats: DecodeStats,
}

#[derive(Clone, Copy)]
enum OutputSpace {
    View(Size),
    Normalized,
}

/// The detection pipeline: preprocess → inference → decode → NMS → mapping,
/// serialized through one lock.
pub struct Detector {
    inner: Mutex<Inner>,
    gate: FrameGate,
    bus: DetectionBus,
    publish_seq: AtomicU64,
    failed_calls: AtomicU64,
    dropped_frames: AtomicU64,
}

impl Detector {
    /// An unconfigured detector: `detect_*` returns empty lists until
    /// [`configure`](Self::configure) succeeds.
    pub fn new() -> Self {
        Self::with_min_interval(DEFAULT_MIN_INTERVAL)
    }

    /// Like [`new`](Self::new) with a custom streaming throttle interval.
    pub fn with_min_interval(min_interval: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            gate: FrameGate::new(min_interval),
            bus: DetectionBus::default(),
            publish_seq: AtomicU64::new(0),
            failed_calls: AtomicU64::new(0),
            dropped_frames: AtomicU64::new(0),
        }
    }

    /// Load a model and label file, replacing any previous configuration.
    ///
    /// All-or-nothing: files are validated, labels parsed, and the session
    /// built before the in-use state is swapped, so a failure leaves the
    /// prior configuration (or unconfigured state) fully intact.
    pub fn configure(
        &self,
        model_path: &Path,
        labels_path: &Path,
        config: ModelConfig,
    ) -> Result<(), ConfigureError> {
        if !model_path.is_file() {
            return Err(ConfigureError::ModelNotFound(model_path.to_path_buf()));
        }
        let labels = load_labels(labels_path)?;
        let backend = OrtBackend::load(model_path)?;
        self.configure_with(Box::new(backend), labels, config);
        Ok(())
    }

    /// Install an already-built backend. This is the seam `configure` goes
    /// through, and what tests use to inject fakes.
    pub fn configure_with(
        &self,
        backend: Box<dyn InferenceBackend>,
        labels: Vec<String>,
        config: ModelConfig,
    ) {
        let mut inner = lock_or_recover(&self.inner);
        info!(
            labels = labels.len(),
            input_size = config.input_size,
            conf_threshold = config.conf_threshold,
            "detector configured"
        );
        inner.state = Some(Configured {
            backend,
            labels,
            config,
            preprocessor: Preprocessor::new(),
        });
        inner.stats = DecodeStats::default();
    }

    pub fn is_configured(&self) -> bool {
        lock_or_recover(&self.inner).state.is_some()
    }

    /// Detect in a static image; bboxes come back normalized to [0,1]
    /// relative to the image's own dimensions.
    pub fn detect_image(&self, image: &RgbImage) -> Vec<Detection> {
        self.detect_inner(
            image.width(),
            image.height(),
            image.as_raw(),
            OutputSpace::Normalized,
        )
        .0
    }

    /// Detect in a raw frame; bboxes come back in `view`'s pixel coordinates
    /// under the aspect-fill display convention.
    pub fn detect_frame(&self, frame: &RgbFrame, view: Size) -> Vec<Detection> {
        if view.width <= 0.0 || view.height <= 0.0 {
            return Vec::new();
        }
        self.detect_inner(frame.width, frame.height, &frame.data, OutputSpace::View(view))
            .0
    }

    /// Streaming entry point: applies the minimum-interval throttle, runs
    /// detection, and publishes the result to the bus. Returns `None` when
    /// the frame was dropped by the throttle.
    ///
    /// Results are published under the sequence assigned at detection time,
    /// so two callers racing past the gate cannot leave an older result as
    /// `latest` on the bus.
    pub fn ingest_frame(&self, frame: &RgbFrame, view: Size) -> Option<Vec<Detection>> {
        if !self.gate.try_pass() {
            self.dropped_frames.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        if view.width <= 0.0 || view.height <= 0.0 {
            return Some(Vec::new());
        }
        let (detections, seq) =
            self.detect_inner(frame.width, frame.height, &frame.data, OutputSpace::View(view));
        self.bus.publish(seq, detections.clone());
        Some(detections)
    }

    /// Register the single streaming subscriber (replaces any previous one).
    pub fn subscribe(&self, sink: impl Fn(&[Detection]) + Send + Sync + 'static) {
        self.bus.subscribe(sink);
    }

    pub fn unsubscribe(&self) {
        self.bus.unsubscribe();
    }

    /// Most recent streaming result, if any frame has been processed.
    pub fn latest(&self) -> Option<Vec<Detection>> {
        self.bus.latest()
    }

    pub fn debug_snapshot(&self) -> DebugSnapshot {
        let inner = lock_or_recover(&self.inner);
        DebugSnapshot {
            configured: inner.state.is_some(),
            label_count: inner.state.as_ref().map_or(0, |s| s.labels.len()),
            output_shape: inner.stats.output_shape.clone(),
            max_score: inner.stats.max_score,
            max_label: inner.stats.max_label.clone(),
            candidates: inner.stats.candidates,
            selected: inner.stats.selected,
            failed_calls: self.failed_calls.load(Ordering::Relaxed),
            dropped_frames: self.dropped_frames.load(Ordering::Relaxed),
        }
    }

    /// Sequence number for bus publications, taken while the inner lock is
    /// held so the order matches detection completion order.
    fn next_seq(&self) -> u64 {
        self.publish_seq.fetch_add(1, Ordering::Relaxed)
    }

    fn detect_inner(
        &self,
        width: u32,
        height: u32,
        data: &[u8],
        space: OutputSpace,
    ) -> (Vec<Detection>, u64) {
        let mut guard = lock_or_recover(&self.inner);
        let inner = &mut *guard;
        let Some(state) = inner.state.as_mut() else {
            // Unconfigured is not an error: the surrounding application must
            // keep running without a model.
            return (Vec::new(), self.next_seq());
        };

        let (tensor, letterbox) =
            match state
                .preprocessor
                .run(width, height, data, state.config.input_size)
            {
                Ok(v) => v,
                Err(e) => {
                    warn!("preprocess failed: {e:#}");
                    self.failed_calls.fetch_add(1, Ordering::Relaxed);
                    return (Vec::new(), self.next_seq());
                }
            };

        let output = match state.backend.run(&tensor, state.config.input_size) {
            Ok(o) => o,
            Err(e) => {
                warn!("inference failed: {e:#}");
                self.failed_calls.fetch_add(1, Ordering::Relaxed);
                return (Vec::new(), self.next_seq());
            }
        };

        if !output.shape.is_empty() && output.shape != inner.stats.output_shape {
            info!(shape = ?output.shape, "model output shape");
        }

        let decoded = decode(&output, &state.labels, state.config.conf_threshold);
        let selected = nms(
            decoded.candidates,
            state.config.iou_threshold,
            state.config.max_detections,
        );

        inner.stats = DecodeStats {
            output_shape: output.shape,
            max_score: decoded.max_score,
            max_label: decoded.max_label,
            candidates: decoded.candidate_count,
            selected: selected.len(),
        };

        let source = Size::new(width as f32, height as f32);
        let detections = selected
            .into_iter()
            .map(|c| {
                let in_source = letterbox.inverse(c.rect);
                let bbox: Rect = match space {
                    OutputSpace::View(view) => map_to_aspect_fill(in_source, source, view),
                    OutputSpace::Normalized => normalize_to_source(in_source, source),
                };
                Detection {
                    label: state
                        .labels
                        .get(c.class_index)
                        .cloned()
                        .unwrap_or_default(),
                    confidence: c.score,
                    bbox,
                }
            })
            .collect();
        (detections, self.next_seq())
    }
}

impl Default for Detector {
    fn default() -> Self {
        Self::new()
    }
}

/// Lock a mutex, recovering the guard if a previous holder panicked. The
/// protected state is a plain value snapshot, safe to keep using.
fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
