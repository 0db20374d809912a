//! YOLOのレイヤに関するモジュール
//!
//! 設定ファイルの各セクションは [`Layer`] のいずれかのバリアントとして表現されます。
//! 各バリアントはそのレイヤに必要なパラメータだけを持ちます。

use std::str::FromStr;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// 活性化関数の種類を表す列挙型
pub enum Activation {
    Linear,
    Leaky,
    Mish,
    Relu,
    Logistic,
}

impl FromStr for Activation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "linear" => Ok(Self::Linear),
            "leaky" => Ok(Self::Leaky),
            "mish" => Ok(Self::Mish),
            "relu" => Ok(Self::Relu),
            "logistic" => Ok(Self::Logistic),
            other => Err(format!("unknown activation `{other}`")),
        }
    }
}

/// 畳み込み層のパラメータ
#[derive(Clone, Debug, PartialEq)]
pub struct Convolutional {
    /// 出力のチャネル数
    pub filters: usize,
    /// カーネルサイズ
    pub size: usize,
    pub stride: usize,
    /// 上下左右それぞれのパディング幅
    pub padding: usize,
    pub batch_normalize: bool,
    pub activation: Activation,
    /// L2正則化の係数。`[net]` より後に宣言された畳み込み層にのみ設定されます
    pub regularization: Option<f32>,
}

impl Convolutional {
    /// 入力の高さ・幅から出力の高さ・幅を計算します。
    ///
    /// # Args
    /// * `height` - 入力の高さ
    /// * `width` - 入力の幅
    ///
    /// # Return
    /// * 出力の (高さ, 幅)。カーネルが入力に収まらない場合は `None`
    pub fn output_hw(&self, height: usize, width: usize) -> Option<(usize, usize)> {
        let out = |n: usize| {
            (n + 2 * self.padding)
                .checked_sub(self.size)
                .map(|v| v / self.stride + 1)
        };
        Some((out(height)?, out(width)?))
    }
}

/// ルート層の動作
#[derive(Clone, Debug, PartialEq)]
pub enum Route<R> {
    /// 入力をチャネル方向に `groups` 等分し、`group_id` 番目を取り出す
    Split { source: R, groups: usize, group_id: usize },
    /// 入力をそのまま出力する
    Identity { source: R },
    /// 列挙した順にチャネル方向へ結合する
    Concat { sources: Vec<R> },
}

/// YOLO層 (検出ヘッド) のパラメータ
#[derive(Clone, Debug, PartialEq)]
pub struct YoloParams {
    /// マスクで選択されたアンカー (幅, 高さ)。入力画像のピクセル単位
    pub anchors: Vec<(f32, f32)>,
    pub classes: usize,
    /// grid sensitivity の補正係数
    pub scale_x_y: f32,
}

/// 設定ファイルの1セクションに対応するレイヤ
///
/// `R` は他レイヤの参照方法です。設定ファイルの段階では絶対インデックス (`usize`) です。
#[derive(Clone, Debug, PartialEq)]
pub enum Layer<R = usize> {
    Convolutional(Convolutional),
    Route(Route<R>),
    /// `sources[0]` は直前のレイヤ
    Shortcut { sources: Vec<R> },
    MaxPool { size: usize, stride: usize },
    Upsample { stride: usize },
    Yolo(YoloParams),
}

impl<R> Layer<R> {
    /// darknet の設定ファイルでのセクション名
    pub fn kind(&self) -> &'static str {
        match self {
            Layer::Convolutional(_) => "convolutional",
            Layer::Route(_) => "route",
            Layer::Shortcut { .. } => "shortcut",
            Layer::MaxPool { .. } => "maxpool",
            Layer::Upsample { .. } => "upsample",
            Layer::Yolo(_) => "yolo",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conv(size: usize, stride: usize, padding: usize) -> Convolutional {
        Convolutional {
            filters: 8,
            size,
            stride,
            padding,
            batch_normalize: true,
            activation: Activation::Leaky,
            regularization: None,
        }
    }

    #[test]
    fn conv_output_size_follows_darknet_padding() {
        assert_eq!(conv(3, 2, 1).output_hw(416, 416), Some((208, 208)));
        assert_eq!(conv(3, 1, 1).output_hw(13, 26), Some((13, 26)));
        assert_eq!(conv(1, 1, 0).output_hw(52, 52), Some((52, 52)));
        assert_eq!(conv(5, 1, 0).output_hw(3, 3), None);
    }

    #[test]
    fn activation_names() {
        assert_eq!("mish".parse::<Activation>(), Ok(Activation::Mish));
        assert!("swish".parse::<Activation>().is_err());
    }
}
