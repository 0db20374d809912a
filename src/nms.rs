use std::collections::BTreeMap;

use crate::detection_result::DetectionData;

/// DIoU (IoU から中心間距離のペナルティを引いたもの)
fn diou(a: &DetectionData, b: &DetectionData) -> f32 {
    let (ax1, ay1, ax2, ay2) = a.corners();
    let (bx1, by1, bx2, by2) = b.corners();

    let inter_w = (ax2.min(bx2) - ax1.max(bx1)).max(0.0);
    let inter_h = (ay2.min(by2) - ay1.max(by1)).max(0.0);
    let inter = inter_w * inter_h;
    let union = a.w * a.h + b.w * b.h - inter;
    let iou = if union > 0.0 { inter / union } else { 0.0 };

    let enclose_w = ax2.max(bx2) - ax1.min(bx1);
    let enclose_h = ay2.max(by2) - ay1.min(by1);
    let c2 = enclose_w * enclose_w + enclose_h * enclose_h;
    if c2 <= 0.0 {
        return iou;
    }
    let d2 = (a.x - b.x).powi(2) + (a.y - b.y).powi(2);
    iou - d2 / c2
}

fn nms(bb: &[DetectionData], nms_threshold: f32) -> Vec<DetectionData> {
    let mut sorted_bb = bb.to_vec();
    sorted_bb.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept: Vec<DetectionData> = vec![];
    for d in sorted_bb {
        if kept.iter().all(|k| diou(k, &d) < nms_threshold) {
            kept.push(d);
        }
    }
    kept
}

/// クラスごとに DIoU-NMS を適用します。
///
/// # Args
/// * `bb` - 検出結果
/// * `nms_threshold` - これ以上の DIoU を持つ、スコアの低いほうのボックスを除きます
///
/// # Return
/// * クラスIDの昇順、同じクラスの中ではスコアの降順に並んだ検出結果
pub fn nms_process(bb: &[DetectionData], nms_threshold: f32) -> Vec<DetectionData> {
    // クラス別に分割
    let mut cls: BTreeMap<usize, Vec<DetectionData>> = BTreeMap::new();
    for &detection in bb {
        cls.entry(detection.class).or_default().push(detection);
    }

    cls.values().flat_map(|d| nms(d, nms_threshold)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(class: usize, x: f32, y: f32, confidence: f32) -> DetectionData {
        DetectionData {
            class,
            x,
            y,
            w: 0.2,
            h: 0.2,
            confidence,
        }
    }

    #[test]
    fn keeps_best_of_overlapping_boxes() {
        let boxes = [
            det(0, 0.50, 0.50, 0.6),
            det(0, 0.51, 0.50, 0.9),
            det(0, 0.80, 0.80, 0.4),
        ];
        let kept = nms_process(&boxes, 0.3);
        assert_eq!(kept, vec![boxes[1], boxes[2]]);
    }

    #[test]
    fn classes_are_suppressed_independently() {
        let boxes = [det(2, 0.5, 0.5, 0.7), det(1, 0.5, 0.5, 0.8)];
        let kept = nms_process(&boxes, 0.3);
        assert_eq!(kept, vec![boxes[1], boxes[0]]);
    }

    #[test]
    fn diou_penalizes_center_distance() {
        let a = det(0, 0.5, 0.5, 1.0);
        assert!((diou(&a, &a) - 1.0).abs() < 1e-6);
        let b = det(0, 0.6, 0.5, 1.0);
        let inter = 0.1 * 0.2;
        let iou = inter / (0.04 + 0.04 - inter);
        let penalty = 0.01 / (0.3f32 * 0.3 + 0.2 * 0.2);
        assert!((diou(&a, &b) - (iou - penalty)).abs() < 1e-5);
    }
}
