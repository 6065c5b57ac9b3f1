//! decode — layout-agnostic YOLO-style output decoding + NMS
//!
//! Model exports disagree on two axes: whether the raw tensor is laid out
//! channel-major (`[1, C, N]`) or prediction-major (`[1, N, C]`), and whether
//! an objectness channel is present (`C = 5 + classes` vs `C = 4 + classes`).
//! Some exports also pre-apply the logistic activation, others emit raw
//! logits. This module resolves all of that from the tensor itself, so no
//! layout needs to be declared up front.

use tracing::debug;

use crate::backend::OutputTensor;
use crate::geometry::Rect;

/// A scored, labeled box in model space, before NMS.
#[derive(Debug, Clone)]
pub struct DecodedCandidate {
    pub rect: Rect,
    pub score: f32,
    pub class_index: usize,
}

/// Decode output plus the tuning-feedback summary the caller may surface.
#[derive(Debug, Clone, Default)]
pub struct DecodeResult {
    pub candidates: Vec<DecodedCandidate>,
    /// Highest combined score seen across all predictions (pre-threshold).
    pub max_score: f32,
    /// Label of the highest-scored prediction, empty if none scored.
    pub max_label: String,
    /// Number of candidates that survived the confidence threshold.
    pub candidate_count: usize,
}

/// Resolved interpretation of the flat output buffer.
struct Layout {
    channels: usize,
    num_pred: usize,
    channel_major: bool,
    has_objectness: bool,
}

/// Pick a layout from shape metadata, falling back to length divisibility.
///
/// On the divisibility fallback both candidate widths may divide evenly; the
/// no-objectness interpretation wins that tie.
fn resolve_layout(output: &OutputTensor, num_classes: usize) -> Option<Layout> {
    let c_box = 4 + num_classes;
    let c_obj = 5 + num_classes;

    if output.shape.len() == 3 {
        let d1 = output.shape[1];
        let d2 = output.shape[2];
        if d1 == c_box || d1 == c_obj {
            return Some(Layout {
                channels: d1,
                num_pred: d2,
                channel_major: true,
                has_objectness: d1 == c_obj,
            });
        }
        if d2 == c_box || d2 == c_obj {
            return Some(Layout {
                channels: d2,
                num_pred: d1,
                channel_major: false,
                has_objectness: d2 == c_obj,
            });
        }
    }

    // Shape absent or unhelpful: infer the prediction count from the length.
    if output.values.len() % c_box == 0 {
        return Some(Layout {
            channels: c_box,
            num_pred: output.values.len() / c_box,
            channel_major: true,
            has_objectness: false,
        });
    }
    if output.values.len() % c_obj == 0 {
        return Some(Layout {
            channels: c_obj,
            num_pred: output.values.len() / c_obj,
            channel_major: true,
            has_objectness: true,
        });
    }
    None
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Treat a raw channel value as a probability: exports that pre-apply the
/// activation emit values already in [0,1]; anything outside that range is a
/// logit and gets the logistic applied.
fn prob(raw: f32) -> f32 {
    if (0.0..=1.0).contains(&raw) {
        raw
    } else {
        sigmoid(raw)
    }
}

/// Decode the raw output tensor into scored model-space candidates.
///
/// Tolerates zero candidates and malformed tensors (inconsistent shape or
/// truncated buffer) by returning an empty result — it never reads out of
/// bounds.
pub fn decode(output: &OutputTensor, labels: &[String], conf_threshold: f32) -> DecodeResult {
    let num_classes = labels.len().max(1);

    let Some(layout) = resolve_layout(output, num_classes) else {
        debug!(
            len = output.values.len(),
            shape = ?output.shape,
            "output tensor matches no known layout"
        );
        return DecodeResult::default();
    };

    // Length must cover the resolved layout before any indexing.
    if layout
        .channels
        .checked_mul(layout.num_pred)
        .is_none_or(|need| output.values.len() < need)
    {
        debug!(
            len = output.values.len(),
            channels = layout.channels,
            num_pred = layout.num_pred,
            "output tensor shorter than its declared shape"
        );
        return DecodeResult::default();
    }

    let values = &output.values;
    let at = |i: usize, c: usize| -> f32 {
        if layout.channel_major {
            values[i + c * layout.num_pred]
        } else {
            values[c + i * layout.channels]
        }
    };

    let cls_offset = if layout.has_objectness { 5 } else { 4 };
    let mut candidates = Vec::new();
    let mut max_score = 0.0f32;
    let mut max_class = None;

    for i in 0..layout.num_pred {
        let x = at(i, 0);
        let y = at(i, 1);
        let w = at(i, 2);
        let h = at(i, 3);
        if w <= 0.0 || h <= 0.0 {
            continue;
        }

        let obj = if layout.has_objectness {
            prob(at(i, 4))
        } else {
            1.0
        };

        let mut best_score = 0.0f32;
        let mut best_class = None;
        for c in 0..labels.len() {
            let s = prob(at(i, cls_offset + c)) * obj;
            if s > best_score {
                best_score = s;
                best_class = Some(c);
            }
        }

        if best_score > max_score {
            max_score = best_score;
            max_class = best_class;
        }

        let Some(class_index) = best_class else {
            continue;
        };
        if best_score < conf_threshold {
            continue;
        }

        candidates.push(DecodedCandidate {
            rect: Rect::new(x - w / 2.0, y - h / 2.0, w, h),
            score: best_score,
            class_index,
        });
    }

    let max_label = max_class
        .and_then(|c| labels.get(c))
        .cloned()
        .unwrap_or_default();

    if max_score > 0.0 {
        debug!(
            max_score,
            max_label,
            candidates = candidates.len(),
            "decode summary"
        );
    } else {
        debug!(conf_threshold, "decode produced no candidates");
    }

    let candidate_count = candidates.len();
    DecodeResult {
        candidates,
        max_score,
        max_label,
        candidate_count,
    }
}

/// Greedy class-agnostic NMS: walk candidates by descending score, accept one
/// only if its IoU with every already-accepted box is strictly below
/// `iou_threshold`, stop once `max_detections` are accepted.
pub fn nms(
    mut candidates: Vec<DecodedCandidate>,
    iou_threshold: f32,
    max_detections: usize,
) -> Vec<DecodedCandidate> {
    candidates.sort_unstable_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut selected: Vec<DecodedCandidate> =
        Vec::with_capacity(max_detections.min(candidates.len()));
    for cand in candidates {
        if selected.len() >= max_detections {
            break;
        }
        if selected
            .iter()
            .all(|s| cand.rect.iou(&s.rect) < iou_threshold)
        {
            selected.push(cand);
        }
    }
    selected
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("class{i}")).collect()
    }

    /// Build a channel-major `[1, C, N]` tensor from per-prediction rows.
    fn channel_major(rows: &[Vec<f32>]) -> OutputTensor {
        let n = rows.len();
        let c = rows[0].len();
        let mut values = vec![0.0; c * n];
        for (i, row) in rows.iter().enumerate() {
            for (ch, &v) in row.iter().enumerate() {
                values[i + ch * n] = v;
            }
        }
        OutputTensor {
            values,
            shape: vec![1, c, n],
        }
    }

    /// Build a prediction-major `[1, N, C]` tensor from the same rows.
    fn prediction_major(rows: &[Vec<f32>]) -> OutputTensor {
        let n = rows.len();
        let c = rows[0].len();
        OutputTensor {
            values: rows.iter().flatten().copied().collect(),
            shape: vec![1, n, c],
        }
    }

    #[test]
    fn single_box_above_threshold_decodes() {
        // Two classes, no objectness: [x, y, w, h, cls0, cls1]
        let rows = vec![vec![200.0, 175.0, 200.0, 150.0, 0.1, 0.9]];
        let out = decode(&channel_major(&rows), &labels(2), 0.25);
        assert_eq!(out.candidates.len(), 1);
        let c = &out.candidates[0];
        assert_eq!(c.class_index, 1);
        assert!((c.score - 0.9).abs() < 1e-6);
        assert!((c.rect.x - 100.0).abs() < 1e-4);
        assert!((c.rect.y - 100.0).abs() < 1e-4);
        assert!((c.rect.w - 200.0).abs() < 1e-4);
        assert!((c.rect.h - 150.0).abs() < 1e-4);
        assert!((out.max_score - 0.9).abs() < 1e-6);
        assert_eq!(out.max_label, "class1");
    }

    #[test]
    fn below_threshold_yields_nothing_but_reports_max() {
        let rows = vec![vec![50.0, 50.0, 20.0, 20.0, 0.2, 0.05]];
        let out = decode(&channel_major(&rows), &labels(2), 0.25);
        assert!(out.candidates.is_empty());
        assert!((out.max_score - 0.2).abs() < 1e-6);
    }

    #[test]
    fn transposed_layouts_decode_identically() {
        let rows = vec![
            vec![100.0, 100.0, 50.0, 40.0, 0.8, 0.1],
            vec![300.0, 200.0, 60.0, 60.0, 0.05, 0.7],
            vec![102.0, 101.0, 50.0, 40.0, 0.75, 0.1], // near-duplicate of row 0
        ];
        let lab = labels(2);
        let a = nms(decode(&channel_major(&rows), &lab, 0.25).candidates, 0.45, 50);
        let b = nms(decode(&prediction_major(&rows), &lab, 0.25).candidates, 0.45, 50);
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(&b) {
            assert_eq!(x.class_index, y.class_index);
            assert!((x.score - y.score).abs() < 1e-6);
            assert!((x.rect.x - y.rect.x).abs() < 1e-4);
        }
    }

    #[test]
    fn objectness_multiplies_class_score() {
        // One class with objectness: [x, y, w, h, obj, cls0]
        let rows = vec![vec![10.0, 10.0, 4.0, 4.0, 0.5, 0.8]];
        let out = decode(&channel_major(&rows), &labels(1), 0.25);
        assert_eq!(out.candidates.len(), 1);
        assert!((out.candidates[0].score - 0.4).abs() < 1e-6);
    }

    #[test]
    fn logits_get_the_logistic_applied() {
        // Class value 4.0 is outside [0,1] → sigmoid(4.0) ≈ 0.982
        let rows = vec![vec![10.0, 10.0, 4.0, 4.0, 4.0]];
        let out = decode(&channel_major(&rows), &labels(1), 0.25);
        assert_eq!(out.candidates.len(), 1);
        assert!((out.candidates[0].score - 0.982).abs() < 1e-3);
    }

    #[test]
    fn missing_shape_prefers_no_objectness_interpretation() {
        // One class: c_box = 5, c_obj = 6. 30 values divide by both; the
        // no-objectness reading must win the tie.
        let tensor = OutputTensor {
            values: vec![0.0; 30],
            shape: vec![],
        };
        let out = decode(&tensor, &labels(1), 0.25);
        // All-zero boxes are discarded (w <= 0), but the tie-break is
        // observable through candidate layout not panicking with 6 preds of
        // width 5 each.
        assert!(out.candidates.is_empty());

        // A real box encoded under the 5-wide reading decodes.
        let rows = vec![
            vec![10.0, 10.0, 4.0, 4.0, 0.9],
            vec![0.0, 0.0, 0.0, 0.0, 0.0],
        ];
        let mut flat = channel_major(&rows);
        flat.shape = vec![];
        let out = decode(&flat, &labels(1), 0.25);
        assert_eq!(out.candidates.len(), 1);
        assert!((out.candidates[0].score - 0.9).abs() < 1e-6);
    }

    #[test]
    fn non_positive_extents_are_discarded() {
        let rows = vec![
            vec![10.0, 10.0, 0.0, 4.0, 0.9, 0.9],
            vec![10.0, 10.0, 4.0, -1.0, 0.9, 0.9],
        ];
        let out = decode(&channel_major(&rows), &labels(2), 0.25);
        assert!(out.candidates.is_empty());
    }

    #[test]
    fn truncated_tensor_fails_closed() {
        // Shape claims [1, 6, 100] but only 10 values are present.
        let tensor = OutputTensor {
            values: vec![1.0; 10],
            shape: vec![1, 6, 100],
        };
        let out = decode(&tensor, &labels(2), 0.25);
        assert!(out.candidates.is_empty());
    }

    #[test]
    fn indivisible_length_fails_closed() {
        let tensor = OutputTensor {
            values: vec![1.0; 7],
            shape: vec![],
        };
        let out = decode(&tensor, &labels(2), 0.25);
        assert!(out.candidates.is_empty());
    }

    #[test]
    fn nms_suppresses_overlaps_and_caps_count() {
        let mk = |x: f32, score: f32| DecodedCandidate {
            rect: Rect::new(x, 0.0, 10.0, 10.0),
            score,
            class_index: 0,
        };
        // Two heavy overlaps + one clean box.
        let kept = nms(vec![mk(0.0, 0.5), mk(1.0, 0.9), mk(100.0, 0.3)], 0.45, 50);
        assert_eq!(kept.len(), 2);
        assert!((kept[0].score - 0.9).abs() < 1e-6);
        assert!((kept[1].score - 0.3).abs() < 1e-6);

        // Every surviving pair respects the IoU bound.
        for (i, a) in kept.iter().enumerate() {
            for b in &kept[i + 1..] {
                assert!(a.rect.iou(&b.rect) < 0.45);
            }
        }

        // max_detections caps acceptance.
        let many: Vec<_> = (0..10).map(|i| mk(i as f32 * 100.0, 0.5)).collect();
        assert_eq!(nms(many, 0.45, 3).len(), 3);
    }
}
