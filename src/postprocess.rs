//! 検出ヘッドの出力を後処理するためのモジュール
//!
//! 複数スケールの出力の結合、コンパイル済みモデルの出力の整形、
//! スコアによる候補の絞り込みと NMS を行います。

use log::debug;
use ndarray::{concatenate, Array3, ArrayView2, ArrayViewD, Axis, Ix3};

use crate::detection_result::DetectionData;
use crate::error::{LayerRef, Result, YoloError};
use crate::nms::nms_process;
use crate::yolo::ANCHOR_BOX_NUM;

/// 候補1つの最小の長さ (x, y, w, h, objectness と1クラス)
pub const MIN_CANDIDATE_LEN: usize = 6;

/// 各検出ヘッドの出力を、宣言順のままボックス方向に結合します。
///
/// # Args
/// * `outputs` - ヘッドごとの (batch, boxes, 5 + classes)
///
/// # Return
/// * (batch, 全ボックス数, 5 + classes)
pub fn concat_heads(outputs: &[Array3<f32>]) -> Result<Array3<f32>> {
    let at = LayerRef::named("aggregate");
    if outputs.is_empty() {
        return Err(YoloError::shape(at, "no detection head outputs"));
    }
    let views: Vec<_> = outputs.iter().map(|o| o.view()).collect();
    concatenate(Axis(1), &views).map_err(|e| {
        let shapes: Vec<_> = outputs.iter().map(|o| o.shape().to_vec()).collect();
        YoloError::shape(at, format!("cannot concatenate {shapes:?}: {e}"))
    })
}

/// コンパイル済みモデルの1出力を (1, grid_height * grid_width * 3, channels) に整形します。
///
/// 既に3次元の場合はそのまま返します。4次元以上の場合は行優先で並べ直します。
///
/// # Args
/// * `output` - (1, grid_height, grid_width, ...) の出力
pub fn reshape_raw_output(output: ArrayViewD<f32>) -> Result<Array3<f32>> {
    let at = LayerRef::named("output");
    let shape = output.shape().to_vec();
    if shape.len() < 3 || shape[0] != 1 {
        return Err(YoloError::shape(at, format!("unexpected output shape {shape:?}")));
    }
    if shape.len() == 3 {
        if shape[2] < MIN_CANDIDATE_LEN {
            return Err(YoloError::shape(
                at,
                format!("{shape:?} has fewer than {MIN_CANDIDATE_LEN} values per box"),
            ));
        }
        return output
            .into_dimensionality::<Ix3>()
            .map(|o| o.to_owned())
            .map_err(|e| YoloError::shape(at, e.to_string()));
    }

    let boxes = shape[1] * shape[2] * ANCHOR_BOX_NUM;
    let total = output.len();
    if boxes == 0 || total % boxes != 0 {
        return Err(YoloError::shape(
            at,
            format!("{shape:?} does not hold {ANCHOR_BOX_NUM} boxes per cell"),
        ));
    }
    let channels = total / boxes;
    if channels < MIN_CANDIDATE_LEN {
        return Err(YoloError::shape(
            at,
            format!("{shape:?} gives {channels} values per box, need at least {MIN_CANDIDATE_LEN}"),
        ));
    }
    let data: Vec<f32> = output.iter().copied().collect();
    Array3::from_shape_vec((1, boxes, channels), data)
        .map_err(|e| YoloError::shape(at, e.to_string()))
}

/// `post_process`関数は、デコード済みの候補から物体を検出します
///
/// # Args
/// * `candidates` - (boxes, 5 + classes) の候補
/// * `input_size` - ネットワーク入力の一辺の長さ
/// * `score_threshold` - これ以下のコンフィデンスの候補を除きます
/// * `nms_threshold` - 非最大抑制（DIoU-NMS）の閾値
///
/// # Return
/// * 検出された物体を表すDetectionDataのベクトル
///
/// 画像からはみ出す候補と、2ピクセル以下の小さな候補も除かれます。
/// 候補の長さは [`MIN_CANDIDATE_LEN`] 以上である必要があります。
pub fn post_process(
    candidates: ArrayView2<f32>,
    input_size: u32,
    score_threshold: f32,
    nms_threshold: f32,
) -> Vec<DetectionData> {
    let min_size = 2.0 / input_size as f32;
    let objs: Vec<DetectionData> = candidates
        .rows()
        .into_iter()
        .map(DetectionData::new_from_candidate)
        .filter(|d| d.confidence > score_threshold)
        .filter(|d| {
            let (x1, y1, x2, y2) = d.corners();
            x1 >= 0.0 && y1 >= 0.0 && x2 <= 1.0 && y2 <= 1.0
        })
        .filter(|d| d.w > min_size && d.h > min_size)
        .collect();
    debug!("{} of {} candidates above threshold", objs.len(), candidates.nrows());

    // NMS を適用
    nms_process(&objs, nms_threshold)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr2, s, Array, IxDyn};

    #[test]
    fn aggregates_standard_yolov4_scales_in_order() {
        let heads: Vec<Array3<f32>> = [507, 2028, 8112]
            .iter()
            .enumerate()
            .map(|(i, &n)| Array3::from_elem((1, n, 85), i as f32))
            .collect();
        let all = concat_heads(&heads).unwrap();
        assert_eq!(all.dim(), (1, 10647, 85));
        assert!(all.slice(s![0, ..507, ..]).iter().all(|&v| v == 0.0));
        assert!(all.slice(s![0, 507..2535, ..]).iter().all(|&v| v == 1.0));
        assert!(all.slice(s![0, 2535.., ..]).iter().all(|&v| v == 2.0));
    }

    #[test]
    fn mismatched_heads_are_rejected() {
        assert!(concat_heads(&[]).is_err());
        let heads = [Array3::zeros((1, 3, 85)), Array3::zeros((1, 3, 6))];
        assert!(matches!(concat_heads(&heads), Err(YoloError::Shape { .. })));
    }

    #[test]
    fn reshapes_grid_outputs_row_major() {
        let raw = Array::from_shape_fn(IxDyn(&[1, 2, 2, 3, 6]), |i| {
            (i[1] * 36 + i[2] * 18 + i[3] * 6 + i[4]) as f32
        });
        let out = reshape_raw_output(raw.view()).unwrap();
        assert_eq!(out.dim(), (1, 12, 6));
        assert_eq!(out[[0, 5, 0]], 30.0);
        assert_eq!(out[[0, 11, 5]], 71.0);

        let flat = Array::zeros(IxDyn(&[1, 13, 13, 255]));
        assert_eq!(reshape_raw_output(flat.view()).unwrap().dim(), (1, 507, 85));

        let decoded = Array::zeros(IxDyn(&[1, 2535, 85]));
        assert_eq!(reshape_raw_output(decoded.view()).unwrap().dim(), (1, 2535, 85));

        let bad = Array::zeros(IxDyn(&[1, 2, 2, 5]));
        assert!(reshape_raw_output(bad.view()).is_err());
    }

    #[test]
    fn boxes_without_class_scores_are_rejected() {
        // 3 ボックス x 5 値ではクラス確率が無い
        let narrow = Array::zeros(IxDyn(&[1, 2, 2, 15]));
        assert!(matches!(reshape_raw_output(narrow.view()), Err(YoloError::Shape { .. })));
        let narrow = Array::zeros(IxDyn(&[1, 2, 2, 3, 4]));
        assert!(matches!(reshape_raw_output(narrow.view()), Err(YoloError::Shape { .. })));
        let decoded = Array::zeros(IxDyn(&[1, 12, 5]));
        assert!(matches!(reshape_raw_output(decoded.view()), Err(YoloError::Shape { .. })));

        let one_class = Array::zeros(IxDyn(&[1, 2, 2, 18]));
        assert_eq!(reshape_raw_output(one_class.view()).unwrap().dim(), (1, 12, 6));
    }

    #[test]
    fn filters_candidates() {
        let c = arr2(&[
            // 採用
            [0.5, 0.5, 0.2, 0.2, 0.9, 0.1, 0.9],
            // スコアが低い
            [0.5, 0.5, 0.2, 0.2, 0.2, 0.1, 0.9],
            // 画像からはみ出す
            [0.05, 0.5, 0.2, 0.2, 0.9, 0.9, 0.1],
            // 小さすぎる
            [0.3, 0.3, 0.001, 0.2, 0.9, 0.9, 0.1],
            // 1つ目と重なる
            [0.51, 0.5, 0.2, 0.2, 0.8, 0.1, 0.9],
        ]);
        let objs = post_process(c.view(), 416, 0.25, 0.3);
        assert_eq!(objs.len(), 1);
        assert_eq!(objs[0].class, 1);
        assert!((objs[0].confidence - 0.81).abs() < 1e-6);
    }
}
