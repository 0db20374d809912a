//! YOLO層 (検出ヘッド) の出力をデコードするモジュール
//!
//! 生の出力 `(batch, H, W, 3 * (5 + classes))` を、入力画像全体で正規化した
//! `(batch, H * W * 3, 5 + classes)` の候補 `(x, y, w, h, objectness, class...)` に変換します。

use log::debug;
use ndarray::{s, Array3, ArrayView4, Axis};

use crate::error::{LayerRef, Result, YoloError};
use crate::grid::GridGeometry;
use crate::layer::YoloParams;

/// 1ヘッドあたりのアンカー数
pub const ANCHOR_BOX_NUM: usize = 3;

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// 検出ヘッド
///
/// [`YoloHead::configure`] で入力形状を決めてから [`YoloHead::decode`] を呼びます。
/// 設定後は `&self` だけで使えるので、複数スレッドから読み出せます。
#[derive(Clone, Debug)]
pub struct YoloHead {
    layer: LayerRef,
    anchors: [(f32, f32); ANCHOR_BOX_NUM],
    classes: usize,
    scale_x_y: f32,
    inv_image_wh: (f32, f32),
    geometry: Option<GridGeometry>,
}

impl YoloHead {
    /// 新しい `YoloHead` を作成します。
    ///
    /// # Args
    /// * `layer` - エラー表示に使うレイヤ情報
    /// * `params` - 設定ファイルから読んだパラメータ
    /// * `image_width`, `image_height` - ネットワーク入力のサイズ
    ///
    /// # Return
    /// * アンカー数が3でない場合などは `Configuration` エラー
    pub fn new(layer: LayerRef, params: &YoloParams, image_width: u32, image_height: u32) -> Result<Self> {
        let anchors: [(f32, f32); ANCHOR_BOX_NUM] =
            params.anchors.as_slice().try_into().map_err(|_| {
                YoloError::config(
                    layer.clone(),
                    format!("expected {ANCHOR_BOX_NUM} anchors, got {}", params.anchors.len()),
                )
            })?;
        if params.classes == 0 {
            return Err(YoloError::config(layer, "`classes` must be positive"));
        }
        if !(params.scale_x_y.is_finite() && params.scale_x_y > 0.0) {
            return Err(YoloError::config(
                layer,
                format!("invalid scale_x_y {}", params.scale_x_y),
            ));
        }
        if image_width == 0 || image_height == 0 {
            return Err(YoloError::config(layer, "network input size must be positive"));
        }
        Ok(Self {
            layer,
            anchors,
            classes: params.classes,
            scale_x_y: params.scale_x_y,
            inv_image_wh: (
                (1.0 / f64::from(image_width)) as f32,
                (1.0 / f64::from(image_height)) as f32,
            ),
            geometry: None,
        })
    }

    pub fn layer(&self) -> &LayerRef {
        &self.layer
    }

    pub fn anchors(&self) -> &[(f32, f32); ANCHOR_BOX_NUM] {
        &self.anchors
    }

    pub fn classes(&self) -> usize {
        self.classes
    }

    /// 1候補あたりの要素数 (`5 + classes`)
    pub fn box_size(&self) -> usize {
        5 + self.classes
    }

    pub fn geometry(&self) -> Option<&GridGeometry> {
        self.geometry.as_ref()
    }

    /// 入力形状を設定し、グリッド座標を作成します。
    /// 形状が前回と同じ場合は何もしません。
    ///
    /// # Args
    /// * `input_shape` - (batch, grid_height, grid_width, channels)
    ///
    /// # Return
    /// * 出力の形状 (batch, grid_height * grid_width * 3, 5 + classes)
    pub fn configure(&mut self, input_shape: [usize; 4]) -> Result<[usize; 3]> {
        let output_shape = self.output_shape(input_shape)?;
        let [_, grid_height, grid_width, _] = input_shape;
        let unchanged = self
            .geometry
            .as_ref()
            .is_some_and(|g| g.grid_height() == grid_height && g.grid_width() == grid_width);
        if !unchanged {
            debug!("{}: grid {}x{}", self.layer, grid_height, grid_width);
            self.geometry = Some(GridGeometry::new(grid_height, grid_width));
        }
        Ok(output_shape)
    }

    /// 入力形状を検査し、出力の形状を返します。ヘッドの状態は変わりません。
    pub fn output_shape(&self, input_shape: [usize; 4]) -> Result<[usize; 3]> {
        let [batch, grid_height, grid_width, channels] = input_shape;
        if channels != ANCHOR_BOX_NUM * self.box_size() {
            return Err(YoloError::shape(
                self.layer.clone(),
                format!(
                    "expected {} channels ({ANCHOR_BOX_NUM} x (5 + {})), got {channels}",
                    ANCHOR_BOX_NUM * self.box_size(),
                    self.classes
                ),
            ));
        }
        if grid_height == 0 || grid_width == 0 {
            return Err(YoloError::shape(
                self.layer.clone(),
                format!("empty grid {grid_height}x{grid_width}"),
            ));
        }
        Ok([batch, grid_height * grid_width * ANCHOR_BOX_NUM, self.box_size()])
    }

    /// 生の出力をデコードします。
    ///
    /// シグモイドはテンソル全体に適用してから分割します。
    /// x, y と objectness, クラス確率はシグモイド後の値、w, h は活性化前の値に `exp` を
    /// 適用したものを使います。出力はアンカー0の全セル、アンカー1の全セル、... の順です。
    ///
    /// # Args
    /// * `x` - 生の出力 (batch, grid_height, grid_width, 3 * (5 + classes))
    ///
    /// # Return
    /// * (batch, grid_height * grid_width * 3, 5 + classes)
    pub fn decode(&self, x: ArrayView4<f32>) -> Result<Array3<f32>> {
        let geometry = self
            .geometry
            .as_ref()
            .ok_or_else(|| YoloError::shape(self.layer.clone(), "head is not configured"))?;
        let (batch, grid_height, grid_width, channels) = x.dim();
        if grid_height != geometry.grid_height()
            || grid_width != geometry.grid_width()
            || channels != ANCHOR_BOX_NUM * self.box_size()
        {
            return Err(YoloError::shape(
                self.layer.clone(),
                format!(
                    "configured for {}x{}x{}, got {grid_height}x{grid_width}x{channels}",
                    geometry.grid_height(),
                    geometry.grid_width(),
                    ANCHOR_BOX_NUM * self.box_size()
                ),
            ));
        }

        let box_size = self.box_size();
        let cells = geometry.cells();
        let (inv_grid_w, inv_grid_h) = geometry.inv_grid_wh();
        let (inv_image_w, inv_image_h) = self.inv_image_wh;
        let sig = x.mapv(sigmoid);

        let mut output = Array3::<f32>::zeros((batch, cells * ANCHOR_BOX_NUM, box_size));
        for (i, &(anchor_w, anchor_h)) in self.anchors.iter().enumerate() {
            let block = i * box_size..(i + 1) * box_size;
            let raw_split = x.slice(s![.., .., .., block.clone()]);
            let sig_split = sig.slice(s![.., .., .., block]);

            for b in 0..batch {
                for cy in 0..grid_height {
                    for cx in 0..grid_width {
                        let mut bx = sig_split[[b, cy, cx, 0]];
                        let mut by = sig_split[[b, cy, cx, 1]];
                        if self.scale_x_y != 1.0 {
                            bx = (bx - 0.5) * self.scale_x_y + 0.5;
                            by = (by - 0.5) * self.scale_x_y + 0.5;
                        }
                        let (gx, gy) = geometry.coord(cy, cx);

                        let row = i * cells + cy * grid_width + cx;
                        let mut out = output.slice_mut(s![b, row, ..]);
                        out[0] = bx * inv_grid_w + gx;
                        out[1] = by * inv_grid_h + gy;
                        out[2] = raw_split[[b, cy, cx, 2]].exp() * anchor_w * inv_image_w;
                        out[3] = raw_split[[b, cy, cx, 3]].exp() * anchor_h * inv_image_h;
                        out.slice_mut(s![4..])
                            .assign(&sig_split.slice(s![b, cy, cx, 4..]));
                    }
                }
            }
        }
        debug_assert_eq!(output.len_of(Axis(1)), cells * ANCHOR_BOX_NUM);
        Ok(output)
    }
}
