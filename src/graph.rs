//! レイヤ設定から計算グラフを組み立て、実行するモジュール
//!
//! 各レイヤは [`NodeId`] で参照されるノードとしてアリーナに格納されます。
//! ノードは自分より前に追加されたノードしか参照できないため、グラフは構築時点で DAG です。
//!
//! 畳み込み・プーリング・アップサンプリングは外部の [`Backend`] に任せ、
//! 分割・結合・加算だけをこのモジュールで行います。

use log::{debug, info};
use ndarray::{concatenate, s, Array3, Array4, ArrayView4, Axis};

use crate::config::ModelConfig;
use crate::error::{LayerRef, Result, YoloError};
use crate::layer::{Convolutional, Layer, Route};
use crate::postprocess;
use crate::yolo::YoloHead;

/// グラフ内のノードを指すハンドル
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// 単一入力のレイヤが受け取るテンソル
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operand {
    /// ネットワークへの入力画像
    Image,
    Node(NodeId),
}

/// ノードの演算
#[derive(Clone, Debug)]
pub enum Op {
    Convolutional { input: Operand, params: Convolutional },
    Split { source: NodeId, groups: usize, group_id: usize },
    Identity { source: NodeId },
    Concat { sources: Vec<NodeId> },
    Shortcut { sources: Vec<NodeId> },
    MaxPool { input: Operand, size: usize, stride: usize },
    Upsample { input: Operand, stride: usize },
    Yolo { input: Operand, head: YoloHead },
}

/// グラフのノード
#[derive(Clone, Debug)]
pub struct Node {
    pub id: NodeId,
    pub layer: LayerRef,
    pub op: Op,
}

/// 外部のテンソル演算
///
/// 入出力はすべて NHWC です。`layer` は重みの検索などに使えます。
pub trait Backend {
    fn convolutional(
        &self,
        layer: &LayerRef,
        params: &Convolutional,
        input: ArrayView4<f32>,
    ) -> anyhow::Result<Array4<f32>>;

    /// `same` パディングの最大値プーリング
    fn maxpool(
        &self,
        layer: &LayerRef,
        size: usize,
        stride: usize,
        input: ArrayView4<f32>,
    ) -> anyhow::Result<Array4<f32>>;

    /// 縦横を `stride` 倍にするバイリニア補間
    fn upsample(
        &self,
        layer: &LayerRef,
        stride: usize,
        input: ArrayView4<f32>,
    ) -> anyhow::Result<Array4<f32>>;
}

/// ノードの出力形状
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Shape {
    /// (batch, height, width, channels)
    Feature([usize; 4]),
    /// 検出ヘッドの出力 (batch, boxes, 5 + classes)
    Boxes([usize; 3]),
}

/// YOLOv4 の計算グラフ
#[derive(Clone, Debug)]
pub struct Graph {
    name: String,
    nodes: Vec<Node>,
    heads: Vec<NodeId>,
    input_shape: Option<[usize; 4]>,
    shapes: Vec<Shape>,
}

fn same_pad_len(n: usize, stride: usize) -> usize {
    n.div_ceil(stride)
}

impl Graph {
    /// 設定からグラフを構築します。
    ///
    /// # Args
    /// * `config` - モデルの設定
    ///
    /// # Return
    /// * 新たな `Graph`。まだ出力されていないレイヤへの参照や、検出ヘッドの出力を
    ///   別のレイヤに渡す構成は `Configuration` エラー
    pub fn build(config: &ModelConfig) -> Result<Self> {
        let mut graph = Self {
            name: String::new(),
            nodes: Vec::with_capacity(config.layers.len()),
            heads: vec![],
            input_shape: None,
            shapes: vec![],
        };

        for l in &config.layers {
            let layer = l.layer_ref();
            if l.index != graph.nodes.len() {
                return Err(YoloError::config(layer, "layer indices must be contiguous"));
            }
            let op = match &l.layer {
                Layer::Convolutional(params) => Op::Convolutional {
                    input: graph.previous(&layer)?,
                    params: params.clone(),
                },
                Layer::Route(Route::Split {
                    source,
                    groups,
                    group_id,
                }) => Op::Split {
                    source: graph.node_ref(&layer, *source)?,
                    groups: *groups,
                    group_id: *group_id,
                },
                Layer::Route(Route::Identity { source }) => Op::Identity {
                    source: graph.node_ref(&layer, *source)?,
                },
                Layer::Route(Route::Concat { sources }) => Op::Concat {
                    sources: graph.node_refs(&layer, sources)?,
                },
                Layer::Shortcut { sources } => Op::Shortcut {
                    sources: graph.node_refs(&layer, sources)?,
                },
                Layer::MaxPool { size, stride } => Op::MaxPool {
                    input: graph.previous(&layer)?,
                    size: *size,
                    stride: *stride,
                },
                Layer::Upsample { stride } => Op::Upsample {
                    input: graph.previous(&layer)?,
                    stride: *stride,
                },
                Layer::Yolo(params) => {
                    let head = YoloHead::new(layer.clone(), params, config.net.width, config.net.height)?;
                    Op::Yolo {
                        input: graph.previous(&layer)?,
                        head,
                    }
                }
            };
            let id = NodeId(graph.nodes.len());
            if matches!(op, Op::Yolo { .. }) {
                graph.heads.push(id);
            }
            graph.nodes.push(Node { id, layer, op });
        }

        graph.name = if graph.heads.len() < 3 {
            "YOLOv4Tiny".to_string()
        } else {
            "YOLOv4".to_string()
        };
        info!("{}: {} layers, {} heads", graph.name, graph.nodes.len(), graph.heads.len());
        Ok(graph)
    }

    /// 単一入力のレイヤは直前のレイヤ (先頭なら入力画像) を受け取る
    fn previous(&self, layer: &LayerRef) -> Result<Operand> {
        match self.nodes.last() {
            None => Ok(Operand::Image),
            Some(n) => self.feature(layer, n.id).map(Operand::Node),
        }
    }

    fn node_ref(&self, layer: &LayerRef, index: usize) -> Result<NodeId> {
        if index >= self.nodes.len() {
            return Err(YoloError::config(
                layer.clone(),
                format!("layer {index} is not produced yet"),
            ));
        }
        self.feature(layer, NodeId(index))
    }

    fn node_refs(&self, layer: &LayerRef, indices: &[usize]) -> Result<Vec<NodeId>> {
        if indices.is_empty() {
            return Err(YoloError::config(layer.clone(), "no source layers"));
        }
        indices.iter().map(|&i| self.node_ref(layer, i)).collect()
    }

    fn feature(&self, layer: &LayerRef, id: NodeId) -> Result<NodeId> {
        if matches!(self.nodes[id.0].op, Op::Yolo { .. }) {
            return Err(YoloError::config(
                layer.clone(),
                format!("output of detection head {} cannot feed another layer", self.nodes[id.0].layer),
            ));
        }
        Ok(id)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// 検出ヘッドのノードを宣言順に返します。
    pub fn heads(&self) -> &[NodeId] {
        &self.heads
    }

    pub fn head(&self, id: NodeId) -> Option<&YoloHead> {
        match &self.nodes.get(id.0)?.op {
            Op::Yolo { head, .. } => Some(head),
            _ => None,
        }
    }

    pub fn input_shape(&self) -> Option<[usize; 4]> {
        self.input_shape
    }

    /// [`Graph::configure`] で推論したノードの出力形状
    pub fn shape(&self, id: NodeId) -> Option<Shape> {
        self.shapes.get(id.0).copied()
    }

    /// 入力形状を決め、全ノードの出力形状を推論します。検出ヘッドもここで設定されます。
    ///
    /// # Args
    /// * `input_shape` - (batch, height, width, channels)
    ///
    /// # Return
    /// * 形状が合わないノードがあれば `Shape` エラー。その場合グラフは未設定の状態になり、
    ///   検出ヘッドは変更されません
    pub fn configure(&mut self, input_shape: [usize; 4]) -> Result<()> {
        self.input_shape = None;
        self.shapes.clear();

        let mut shapes: Vec<Shape> = Vec::with_capacity(self.nodes.len());
        let mut head_inputs = vec![];
        for node in &self.nodes {
            let layer = &node.layer;
            let operand = |o: &Operand, shapes: &[Shape]| -> [usize; 4] {
                match o {
                    Operand::Image => input_shape,
                    Operand::Node(id) => feature_shape(shapes, *id),
                }
            };
            let shape = match &node.op {
                Op::Convolutional { input, params } => {
                    let [n, h, w, _] = operand(input, &shapes);
                    let (oh, ow) = params.output_hw(h, w).ok_or_else(|| {
                        YoloError::shape(
                            layer.clone(),
                            format!("kernel {} does not fit {h}x{w}", params.size),
                        )
                    })?;
                    Shape::Feature([n, oh, ow, params.filters])
                }
                Op::Split {
                    source,
                    groups,
                    group_id: _,
                } => {
                    let [n, h, w, c] = feature_shape(&shapes, *source);
                    if c % *groups != 0 {
                        return Err(YoloError::shape(
                            layer.clone(),
                            format!("{c} channels cannot be split into {groups} groups"),
                        ));
                    }
                    Shape::Feature([n, h, w, c / *groups])
                }
                Op::Identity { source } => Shape::Feature(feature_shape(&shapes, *source)),
                Op::Concat { sources } => {
                    let [n, h, w, _] = feature_shape(&shapes, sources[0]);
                    let mut channels = 0;
                    for id in sources.iter() {
                        let [sn, sh, sw, sc] = feature_shape(&shapes, *id);
                        if [sn, sh, sw] != [n, h, w] {
                            return Err(YoloError::shape(
                                layer.clone(),
                                format!("cannot concatenate {sn}x{sh}x{sw} with {n}x{h}x{w}"),
                            ));
                        }
                        channels += sc;
                    }
                    Shape::Feature([n, h, w, channels])
                }
                Op::Shortcut { sources } => {
                    let first = feature_shape(&shapes, sources[0]);
                    if let Some(other) = sources
                        .iter()
                        .map(|id| feature_shape(&shapes, *id))
                        .find(|s| *s != first)
                    {
                        return Err(YoloError::shape(
                            layer.clone(),
                            format!("cannot add {other:?} to {first:?}"),
                        ));
                    }
                    Shape::Feature(first)
                }
                Op::MaxPool { input, stride, .. } => {
                    let [n, h, w, c] = operand(input, &shapes);
                    Shape::Feature([n, same_pad_len(h, *stride), same_pad_len(w, *stride), c])
                }
                Op::Upsample { input, stride } => {
                    let [n, h, w, c] = operand(input, &shapes);
                    Shape::Feature([n, h * *stride, w * *stride, c])
                }
                Op::Yolo { input, head } => {
                    let s = operand(input, &shapes);
                    head_inputs.push((node.id, s));
                    Shape::Boxes(head.output_shape(s)?)
                }
            };
            debug!("{}: {:?}", node.layer, shape);
            shapes.push(shape);
        }

        // 全ノードの検査が通ってからヘッドを設定する
        for (id, s) in head_inputs {
            if let Op::Yolo { head, .. } = &mut self.nodes[id.0].op {
                head.configure(s)?;
            }
        }

        self.shapes = shapes;
        self.input_shape = Some(input_shape);
        Ok(())
    }

    /// グラフを実行し、検出ヘッドの出力を宣言順に返します。
    ///
    /// # Args
    /// * `backend` - 畳み込みなどを実行する外部演算
    /// * `input` - [`Graph::configure`] で指定した形状の入力
    ///
    /// # Return
    /// * 検出ヘッドごとの (batch, boxes, 5 + classes)
    pub fn forward<B: Backend>(&self, backend: &B, image: ArrayView4<f32>) -> Result<Vec<Array3<f32>>> {
        let graph = LayerRef::named(self.name.as_str());
        let expected = self
            .input_shape
            .ok_or_else(|| YoloError::shape(graph.clone(), "graph is not configured"))?;
        let (n, h, w, c) = image.dim();
        if [n, h, w, c] != expected {
            return Err(YoloError::shape(
                graph,
                format!("configured for {expected:?}, got {:?}", [n, h, w, c]),
            ));
        }

        let mut outputs: Vec<Option<Array4<f32>>> = Vec::with_capacity(self.nodes.len());
        let mut heads = Vec::with_capacity(self.heads.len());
        for node in &self.nodes {
            let layer = &node.layer;
            let backend_err = |source: anyhow::Error| YoloError::Backend {
                layer: layer.clone(),
                source,
            };

            let out = match &node.op {
                Op::Convolutional { input, params } => {
                    let x = operand_view(&image, &outputs, *input);
                    Some(backend.convolutional(layer, params, x).map_err(backend_err)?)
                }
                Op::Split {
                    source,
                    groups,
                    group_id,
                } => Some(split_and_get(node_output(&outputs, *source), *groups, *group_id)),
                Op::Identity { source } => Some(node_output(&outputs, *source).to_owned()),
                Op::Concat { sources } => {
                    let views: Vec<_> = sources.iter().map(|id| node_output(&outputs, *id)).collect();
                    let joined = concatenate(Axis(3), &views)
                        .map_err(|e| YoloError::shape(layer.clone(), e.to_string()))?;
                    Some(joined)
                }
                Op::Shortcut { sources } => {
                    let mut sum = node_output(&outputs, sources[0]).to_owned();
                    for id in &sources[1..] {
                        sum += &node_output(&outputs, *id);
                    }
                    Some(sum)
                }
                Op::MaxPool { input, size, stride } => {
                    let x = operand_view(&image, &outputs, *input);
                    Some(backend.maxpool(layer, *size, *stride, x).map_err(backend_err)?)
                }
                Op::Upsample { input, stride } => {
                    let x = operand_view(&image, &outputs, *input);
                    Some(backend.upsample(layer, *stride, x).map_err(backend_err)?)
                }
                Op::Yolo { input, head } => {
                    heads.push(head.decode(operand_view(&image, &outputs, *input))?);
                    None
                }
            };

            if let (Some(out), Some(Shape::Feature(shape))) = (&out, self.shapes.get(node.id.0)) {
                if out.shape() != shape.as_slice() {
                    return Err(YoloError::shape(
                        layer.clone(),
                        format!("backend returned {:?}, expected {shape:?}", out.shape()),
                    ));
                }
            }
            outputs.push(out);
        }
        Ok(heads)
    }

    /// グラフを実行し、全検出ヘッドの出力を1つの候補テンソルに結合します。
    pub fn forward_aggregated<B: Backend>(&self, backend: &B, input: ArrayView4<f32>) -> Result<Array3<f32>> {
        postprocess::concat_heads(&self.forward(backend, input)?)
    }
}

fn feature_shape(shapes: &[Shape], id: NodeId) -> [usize; 4] {
    match shapes[id.0] {
        Shape::Feature(s) => s,
        // ヘッドの出力は構築時に参照を禁止している
        Shape::Boxes(_) => unreachable!("detection head output used as a feature map"),
    }
}

fn operand_view<'a>(
    image: &'a ArrayView4<'_, f32>,
    outputs: &'a [Option<Array4<f32>>],
    operand: Operand,
) -> ArrayView4<'a, f32> {
    match operand {
        Operand::Image => image.view(),
        Operand::Node(id) => node_output(outputs, id),
    }
}

fn node_output(outputs: &[Option<Array4<f32>>], id: NodeId) -> ArrayView4<'_, f32> {
    outputs[id.0]
        .as_ref()
        .map(|a| a.view())
        .unwrap_or_else(|| unreachable!("detection head output used as a feature map"))
}

/// チャネル方向に `groups` 等分し、`group_id` 番目を返します。
pub fn split_and_get(x: ArrayView4<f32>, groups: usize, group_id: usize) -> Array4<f32> {
    let width = x.len_of(Axis(3)) / groups;
    x.slice(s![.., .., .., group_id * width..(group_id + 1) * width])
        .to_owned()
}
