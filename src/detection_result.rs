//! 物体検出の結果を処理するモジュール

use ndarray::ArrayView1;

/// 検出結果を保持するための構造体
///
/// 座標はネットワーク入力全体を 1 とした正規化座標です。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectionData {
    /// クラス
    pub class: usize,
    /// バウンディングボックス中心のx
    pub x: f32,
    /// バウンディングボックス中心のy
    pub y: f32,
    /// バウンディングボックスの幅
    pub w: f32,
    /// バウンディングボックスの高さ
    pub h: f32,
    /// コンフィデンス (objectness × クラス確率)
    pub confidence: f32,
}

/// `get_cls_id`関数は、クラス確率が最大のクラスIDを取得します
///
/// # Args
/// * `cls` - クラス確率の配列
///
/// # Return
/// * 最大の値を持つ要素のインデックス。同値の場合は小さいほう
fn get_cls_id(cls: ArrayView1<f32>) -> usize {
    cls.iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |(best, max), (i, &v)| {
            if v > max {
                (i, v)
            } else {
                (best, max)
            }
        })
        .0
}

impl DetectionData {
    /// デコード済みの候補1つから新しいDetectionDataを作成します。
    ///
    /// # Args
    /// * `candidate` - (x, y, w, h, objectness, class...)
    ///
    /// # Return
    /// * 新たなDetectionDataインスタンス
    pub fn new_from_candidate(candidate: ArrayView1<f32>) -> Self {
        let cls = candidate.slice(ndarray::s![5..]);
        let class = get_cls_id(cls);
        Self {
            class,
            x: candidate[0],
            y: candidate[1],
            w: candidate[2],
            h: candidate[3],
            confidence: candidate[4] * cls[class],
        }
    }

    /// 左上と右下の座標 (x1, y1, x2, y2)
    pub fn corners(&self) -> (f32, f32, f32, f32) {
        let (hw, hh) = (self.w / 2., self.h / 2.);
        (self.x - hw, self.y - hh, self.x + hw, self.y + hh)
    }

    /// 正方形の入力に合わせてパディングした検出結果を、元の画像の縦横比に戻します。
    ///
    /// # Args
    /// * `width` - 元の画像の幅
    /// * `height` - 元の画像の高さ
    ///
    /// # Return
    /// * 元の画像全体を 1 とした正規化座標の検出結果
    pub fn fit_to_original(&self, width: u32, height: u32) -> Self {
        let mut new_d = *self;
        if width > height {
            let w_h = width as f32 / height as f32;
            new_d.y = w_h * (self.y - 0.5) + 0.5;
            new_d.h = w_h * self.h;
        } else if width < height {
            let h_w = height as f32 / width as f32;
            new_d.x = h_w * (self.x - 0.5) + 0.5;
            new_d.w = h_w * self.w;
        }
        new_d
    }

    /// ピクセル単位の左上と右下の座標を返します。
    pub fn pixel_corners(&self, width: u32, height: u32) -> (f32, f32, f32, f32) {
        let (x1, y1, x2, y2) = self.corners();
        let (w, h) = (width as f32, height as f32);
        (x1 * w, y1 * h, x2 * w, y2 * h)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::arr1;

    #[test]
    fn confidence_is_objectness_times_class_probability() {
        let c = arr1(&[0.5, 0.5, 0.2, 0.1, 0.8, 0.1, 0.7, 0.7, 0.2]);
        let d = DetectionData::new_from_candidate(c.view());
        assert_eq!(d.class, 1);
        assert_relative_eq!(d.confidence, 0.8 * 0.7);
        assert_relative_eq!(d.corners().0, 0.4);
        assert_relative_eq!(d.corners().3, 0.55);
    }

    #[test]
    fn fit_to_landscape_image() {
        let d = DetectionData {
            class: 0,
            x: 0.5,
            y: 0.4,
            w: 0.2,
            h: 0.1,
            confidence: 0.9,
        };
        // 640x320 は縦に 1/4 ずつパディングされている
        let f = d.fit_to_original(640, 320);
        assert_relative_eq!(f.x, 0.5);
        assert_relative_eq!(f.w, 0.2);
        assert_relative_eq!(f.y, 0.3);
        assert_relative_eq!(f.h, 0.2);
        assert_eq!(d.fit_to_original(100, 100), d);

        let (x1, y1, x2, y2) = f.pixel_corners(640, 320);
        assert_relative_eq!(x1, 256.0, max_relative = 1e-6);
        assert_relative_eq!(y1, 64.0, max_relative = 1e-6);
        assert_relative_eq!(x2, 384.0, max_relative = 1e-6);
        assert_relative_eq!(y2, 128.0, max_relative = 1e-6);
    }
}
