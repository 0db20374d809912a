//! darknet 形式の設定ファイル (`.cfg`) を読み込むモジュール
//!
//! `[net]` セクションはモデル全体の設定として扱い、レイヤにはなりません。
//! それ以外のセクションは宣言順にレイヤのインデックスが振られます。

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;

use log::{debug, warn};

use crate::error::{LayerRef, Result, YoloError};
use crate::layer::{Activation, Convolutional, Layer, Route, YoloParams};

const YOLOV4_TINY_CFG: &str = include_str!("../cfg/yolov4-tiny.cfg");

/// `[net]` セクションの設定
#[derive(Clone, Debug, PartialEq)]
pub struct NetConfig {
    /// ネットワーク入力の幅
    pub width: u32,
    /// ネットワーク入力の高さ
    pub height: u32,
    pub channels: u32,
    /// L2正則化の係数
    pub decay: f32,
}

/// グラフ構築中に後続のレイヤへ引き継がれる設定
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BuildConfig {
    pub regularization: Option<f32>,
}

impl BuildConfig {
    fn apply_net(&mut self, net: &NetConfig) {
        self.regularization = Some(net.decay);
    }
}

/// 1レイヤ分の設定
#[derive(Clone, Debug, PartialEq)]
pub struct LayerConfig {
    pub index: usize,
    pub layer: Layer,
}

impl LayerConfig {
    pub fn layer_ref(&self) -> LayerRef {
        LayerRef::new(self.index, self.layer.kind())
    }
}

/// モデル全体の設定
#[derive(Clone, Debug, PartialEq)]
pub struct ModelConfig {
    pub net: NetConfig,
    pub layers: Vec<LayerConfig>,
}

/// 設定ファイルの1セクション
struct Section {
    kind: String,
    line: usize,
    options: HashMap<String, String>,
}

impl Section {
    fn get<T: FromStr>(&self, at: &LayerRef, key: &str) -> Result<Option<T>> {
        match self.options.get(key) {
            Some(v) => v.parse().map(Some).map_err(|_| {
                YoloError::config(at.clone(), format!("invalid value `{v}` for `{key}` (line {})", self.line))
            }),
            None => Ok(None),
        }
    }

    fn get_or<T: FromStr>(&self, at: &LayerRef, key: &str, default: T) -> Result<T> {
        Ok(self.get(at, key)?.unwrap_or(default))
    }

    fn require<T: FromStr>(&self, at: &LayerRef, key: &str) -> Result<T> {
        self.get(at, key)?.ok_or_else(|| {
            YoloError::config(at.clone(), format!("missing `{key}` (line {})", self.line))
        })
    }

    fn list<T: FromStr>(&self, at: &LayerRef, key: &str) -> Result<Option<Vec<T>>> {
        let Some(v) = self.options.get(key) else {
            return Ok(None);
        };
        v.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.parse().map_err(|_| {
                    YoloError::config(at.clone(), format!("invalid entry `{s}` in `{key}` (line {})", self.line))
                })
            })
            .collect::<Result<Vec<T>>>()
            .map(Some)
    }
}

/// テキストをセクションの列に分解します。
fn split_sections(text: &str) -> Result<Vec<Section>> {
    let mut sections: Vec<Section> = vec![];
    for (no, raw) in text.lines().enumerate() {
        let line = raw.split(['#', ';']).next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        if let Some(kind) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            sections.push(Section {
                kind: kind.trim().to_string(),
                line: no + 1,
                options: HashMap::new(),
            });
            continue;
        }
        let (Some(section), Some((key, value))) = (sections.last_mut(), line.split_once('=')) else {
            return Err(YoloError::config(
                LayerRef::named("cfg"),
                format!("unexpected line {}: `{line}`", no + 1),
            ));
        };
        section
            .options
            .insert(key.trim().to_string(), value.trim().to_string());
    }
    Ok(sections)
}

/// 相対インデックス (負の値) を絶対インデックスに変換します。
/// まだ出力されていないレイヤへの参照はエラーです。
fn resolve_index(at: &LayerRef, index: usize, value: isize) -> Result<usize> {
    let resolved = if value < 0 {
        index as isize + value
    } else {
        value
    };
    if resolved < 0 || resolved as usize >= index {
        return Err(YoloError::config(
            at.clone(),
            format!("reference {value} resolves to layer {resolved}, which is not produced before layer {index}"),
        ));
    }
    Ok(resolved as usize)
}

fn parse_net(section: &Section) -> Result<NetConfig> {
    let at = LayerRef::named("net");
    let net = NetConfig {
        width: section.require(&at, "width")?,
        height: section.require(&at, "height")?,
        channels: section.get_or(&at, "channels", 3)?,
        decay: section.get_or(&at, "decay", 0.0001)?,
    };
    if net.width == 0 || net.height == 0 {
        return Err(YoloError::config(at, "network input size must be positive"));
    }
    Ok(net)
}

fn parse_convolutional(section: &Section, at: &LayerRef, build: &BuildConfig) -> Result<Layer> {
    let size: usize = section.get_or(at, "size", 1)?;
    let stride: usize = section.get_or(at, "stride", 1)?;
    if size == 0 || stride == 0 {
        return Err(YoloError::config(at.clone(), "`size` and `stride` must be positive"));
    }
    let pad: u8 = section.get_or(at, "pad", 0)?;
    let padding = if pad != 0 {
        size / 2
    } else {
        section.get_or(at, "padding", 0)?
    };
    let activation = match section.options.get("activation") {
        Some(a) => a.parse().map_err(|e: String| YoloError::config(at.clone(), e))?,
        None => Activation::Logistic,
    };
    Ok(Layer::Convolutional(Convolutional {
        filters: section.require(at, "filters")?,
        size,
        stride,
        padding,
        batch_normalize: section.get_or::<u8>(at, "batch_normalize", 0)? != 0,
        activation,
        regularization: build.regularization,
    }))
}

fn parse_route(section: &Section, at: &LayerRef, index: usize) -> Result<Layer> {
    let sources = section
        .list::<isize>(at, "layers")?
        .ok_or_else(|| YoloError::config(at.clone(), "missing `layers`"))?
        .into_iter()
        .map(|v| resolve_index(at, index, v))
        .collect::<Result<Vec<_>>>()?;

    let route = match (sources.as_slice(), section.get::<usize>(at, "groups")?) {
        ([], _) => return Err(YoloError::config(at.clone(), "`layers` is empty")),
        (&[source], Some(groups)) => {
            let group_id = section.get_or(at, "group_id", 0)?;
            if groups == 0 || group_id >= groups {
                return Err(YoloError::config(
                    at.clone(),
                    format!("group_id {group_id} is out of range for {groups} groups"),
                ));
            }
            Route::Split {
                source,
                groups,
                group_id,
            }
        }
        (_, Some(_)) => {
            return Err(YoloError::config(at.clone(), "`groups` requires a single source layer"))
        }
        (&[source], None) => Route::Identity { source },
        (_, None) => Route::Concat { sources },
    };
    Ok(Layer::Route(route))
}

fn parse_shortcut(section: &Section, at: &LayerRef, index: usize) -> Result<Layer> {
    if index == 0 {
        return Err(YoloError::config(at.clone(), "shortcut needs a preceding layer"));
    }
    let from = section
        .list::<isize>(at, "from")?
        .ok_or_else(|| YoloError::config(at.clone(), "missing `from`"))?;
    if let Some(a) = section.options.get("activation") {
        if a != "linear" {
            warn!("{at}: activation `{a}` on shortcut is ignored");
        }
    }
    let mut sources = vec![index - 1];
    for v in from {
        sources.push(resolve_index(at, index, v)?);
    }
    Ok(Layer::Shortcut { sources })
}

fn parse_yolo(section: &Section, at: &LayerRef) -> Result<Layer> {
    let flat: Vec<f32> = section
        .list(at, "anchors")?
        .ok_or_else(|| YoloError::config(at.clone(), "missing `anchors`"))?;
    if flat.len() % 2 != 0 {
        return Err(YoloError::config(at.clone(), "`anchors` must hold (width, height) pairs"));
    }
    let table: Vec<(f32, f32)> = flat.chunks(2).map(|c| (c[0], c[1])).collect();
    let mask: Vec<usize> = match section.list(at, "mask")? {
        Some(m) => m,
        None => (0..section.get_or(at, "num", table.len())?).collect(),
    };
    let anchors = mask
        .iter()
        .map(|&m| {
            table.get(m).copied().ok_or_else(|| {
                YoloError::config(
                    at.clone(),
                    format!("mask {m} is out of range for {} anchors", table.len()),
                )
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(Layer::Yolo(YoloParams {
        anchors,
        classes: section.get_or(at, "classes", 20)?,
        scale_x_y: section.get_or(at, "scale_x_y", 1.0)?,
    }))
}

impl ModelConfig {
    /// 設定ファイルのテキストを解析します。
    ///
    /// # Args
    /// * `text` - darknet 形式の設定
    ///
    /// # Return
    /// * モデルの設定。未知のセクションや欠けたパラメータがあれば `Configuration` エラー
    pub fn parse(text: &str) -> Result<Self> {
        let mut build = BuildConfig::default();
        let mut net = None;
        let mut layers = vec![];

        for section in split_sections(text)? {
            let index = layers.len();
            let at = LayerRef::new(index, section.kind.as_str());
            let layer = match section.kind.as_str() {
                "net" | "network" => {
                    if net.is_some() {
                        return Err(YoloError::config(
                            LayerRef::named("net"),
                            format!("duplicate [{}] section (line {})", section.kind, section.line),
                        ));
                    }
                    let n = parse_net(&section)?;
                    build.apply_net(&n);
                    net = Some(n);
                    continue;
                }
                "convolutional" | "conv" => parse_convolutional(&section, &at, &build)?,
                "route" => parse_route(&section, &at, index)?,
                "shortcut" => parse_shortcut(&section, &at, index)?,
                "maxpool" | "max" => {
                    let stride: usize = section.get_or(&at, "stride", 1)?;
                    let size = section.get_or(&at, "size", stride)?;
                    if size == 0 || stride == 0 {
                        return Err(YoloError::config(at, "`size` and `stride` must be positive"));
                    }
                    Layer::MaxPool { size, stride }
                }
                "upsample" => {
                    let stride: usize = section.get_or(&at, "stride", 2)?;
                    if stride == 0 {
                        return Err(YoloError::config(at, "`stride` must be positive"));
                    }
                    Layer::Upsample { stride }
                }
                "yolo" => parse_yolo(&section, &at)?,
                other => {
                    return Err(YoloError::config(
                        at,
                        format!("unknown layer type `{other}` (line {})", section.line),
                    ))
                }
            };
            layers.push(LayerConfig { index, layer });
        }

        let net = net.ok_or_else(|| YoloError::config(LayerRef::named("net"), "missing [net] section"))?;
        debug!("parsed {} layers, input {}x{}", layers.len(), net.width, net.height);
        Ok(Self { net, layers })
    }

    /// 設定ファイルを読み込みます。
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| YoloError::resource(path, e))?;
        Self::parse(&text)
    }

    /// 同梱の YOLOv4-tiny の設定
    pub fn yolov4_tiny() -> Result<Self> {
        Self::parse(YOLOV4_TINY_CFG)
    }

    /// 検出ヘッドを宣言順に返します。
    pub fn heads(&self) -> impl Iterator<Item = (usize, &YoloParams)> {
        self.layers.iter().filter_map(|l| match &l.layer {
            Layer::Yolo(p) => Some((l.index, p)),
            _ => None,
        })
    }
}

/// クラス名ファイル (1行に1クラス) を読み込みます。
///
/// # Args
/// * `path` - `.names` ファイルのパス
///
/// # Return
/// * クラス名の配列。空行は無視されます
pub fn read_names<P: AsRef<Path>>(path: P) -> Result<Vec<String>> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|e| YoloError::resource(path, e))?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SMALL: &str = "
[net]
width=64
height=64
decay=0.001

[convolutional]
filters=16
size=3
stride=1
pad=1
activation=leaky

[convolutional]
filters=16
size=1
activation=linear

[shortcut]
from=-2

[route]
layers=-1,0
";

    #[test]
    fn parses_bundled_tiny_config() {
        let cfg = ModelConfig::yolov4_tiny().unwrap();
        assert_eq!(cfg.net.width, 416);
        assert_eq!(cfg.net.height, 416);
        assert_eq!(cfg.layers.len(), 38);

        let heads: Vec<_> = cfg.heads().collect();
        assert_eq!(heads.len(), 2);
        assert_eq!(heads[0].0, 30);
        assert_eq!(heads[0].1.anchors, vec![(81., 82.), (135., 169.), (344., 319.)]);
        assert_eq!(heads[1].1.anchors, vec![(23., 27.), (37., 58.), (81., 82.)]);
        assert_eq!(heads[1].1.scale_x_y, 1.05);
        assert_eq!(heads[1].1.classes, 80);
    }

    #[test]
    fn relative_references_are_resolved() {
        let cfg = ModelConfig::yolov4_tiny().unwrap();
        assert_eq!(
            cfg.layers[3].layer,
            Layer::Route(Route::Split { source: 2, groups: 2, group_id: 1 })
        );
        assert_eq!(
            cfg.layers[8].layer,
            Layer::Route(Route::Concat { sources: vec![2, 7] })
        );
        assert_eq!(cfg.layers[31].layer, Layer::Route(Route::Identity { source: 27 }));
        assert_eq!(
            cfg.layers[34].layer,
            Layer::Route(Route::Concat { sources: vec![33, 23] })
        );
    }

    #[test]
    fn net_decay_is_threaded_into_convolutions() {
        let cfg = ModelConfig::parse(SMALL).unwrap();
        let Layer::Convolutional(c) = &cfg.layers[0].layer else {
            panic!("expected a convolution");
        };
        assert_eq!(c.regularization, Some(0.001));
        assert_eq!(c.padding, 1);
        assert_eq!(
            cfg.layers[2].layer,
            Layer::Shortcut { sources: vec![1, 0] }
        );
    }

    #[test]
    fn convolution_before_net_has_no_regularization() {
        let text = "[convolutional]\nfilters=4\n[net]\nwidth=8\nheight=8\n";
        let cfg = ModelConfig::parse(text).unwrap();
        let Layer::Convolutional(c) = &cfg.layers[0].layer else {
            panic!("expected a convolution");
        };
        assert_eq!(c.regularization, None);
        assert_eq!(c.activation, Activation::Logistic);
    }

    #[test]
    fn forward_reference_is_rejected() {
        let text = "[net]\nwidth=8\nheight=8\n[convolutional]\nfilters=4\n[route]\nlayers=1\n";
        let err = ModelConfig::parse(text).unwrap_err();
        assert!(matches!(
            err,
            YoloError::Configuration { layer: LayerRef { index: Some(1), .. }, .. }
        ));
    }

    #[test]
    fn malformed_tables_are_configuration_errors() {
        let cases = [
            "[net]\nwidth=8\nheight=8\n[softmax]\n",
            "[net]\nwidth=8\nheight=8\n[convolutional]\nsize=3\n",
            "[net]\nwidth=8\nheight=8\n[convolutional]\nfilters=four\n",
            "[net]\nwidth=8\nheight=8\n[yolo]\nmask=0,7\nanchors=1,2,3,4\n",
            "[net]\nwidth=8\nheight=8\n[convolutional]\nfilters=2\n[route]\nlayers=0\ngroups=2\ngroup_id=2\n",
            "[convolutional]\nfilters=2\n",
            "width=8\n",
        ];
        for text in cases {
            assert!(
                matches!(ModelConfig::parse(text), Err(YoloError::Configuration { .. })),
                "{text}"
            );
        }
    }

    #[test]
    fn duplicate_net_section_is_rejected() {
        let text = "[net]\nwidth=8\nheight=8\ndecay=0.001\n[convolutional]\nfilters=2\n[net]\nwidth=16\nheight=16\ndecay=0.5\n";
        match ModelConfig::parse(text) {
            Err(YoloError::Configuration { layer, .. }) => assert_eq!(layer.name, "net"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn missing_files_are_resource_errors() {
        assert!(matches!(
            ModelConfig::from_file("does/not/exist.cfg"),
            Err(YoloError::Resource { .. })
        ));
        assert!(matches!(
            read_names("does/not/exist.names"),
            Err(YoloError::Resource { .. })
        ));
    }
}
