//! YOLOv4 / YOLOv4-tiny のモデルをコントロールするモジュール

use std::path::Path;

use anyhow::{ensure, Context, Result};
use image::DynamicImage;
use log::{debug, info};
use ndarray::{Array3, ArrayView4, Axis};

use crate::config::{read_names, ModelConfig};
use crate::detection_result::DetectionData;
use crate::graph::{Backend, Graph};
use crate::img_proc;
use crate::interpreter::{Delegate, Interpreter, InterpreterLoader, TfliteEngine};
use crate::postprocess;

/// 正方形の画像を受け取り、全検出ヘッドの候補を返す推論エンジン
pub trait Engine {
    /// ネットワーク入力の一辺の長さ
    fn input_size(&self) -> u32;

    /// # Args
    /// * `input` - (1, size, size, channels)、値は [0, 1]
    ///
    /// # Return
    /// * (1, 全ボックス数, 5 + classes)
    fn run(&mut self, input: ArrayView4<f32>) -> Result<Array3<f32>>;
}

/// レイヤグラフを外部のテンソル演算で直接実行するエンジン
pub struct GraphEngine<B> {
    graph: Graph,
    backend: B,
    input_size: u32,
}

impl<B: Backend> GraphEngine<B> {
    /// 設定からグラフを構築し、`[net]` の入力サイズで形状を確定させます。
    pub fn new(config: &ModelConfig, backend: B) -> Result<Self> {
        let net = &config.net;
        ensure!(
            net.width == net.height,
            "network input must be square, got {}x{}",
            net.width,
            net.height
        );
        let mut graph = Graph::build(config)?;
        graph.configure([1, net.height as usize, net.width as usize, net.channels as usize])?;
        Ok(Self {
            graph,
            backend,
            input_size: net.width,
        })
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }
}

impl<B: Backend> Engine for GraphEngine<B> {
    fn input_size(&self) -> u32 {
        self.input_size
    }

    fn run(&mut self, input: ArrayView4<f32>) -> Result<Array3<f32>> {
        Ok(self.graph.forward_aggregated(&self.backend, input)?)
    }
}

/// YOLOv4 のモデルをコントロールする構造体
pub struct YoloV4<E> {
    engine: E,
    /// これ以下のコンフィデンスの候補を除きます
    pub score_threshold: f32,
    /// DIoU-NMS の閾値
    pub iou_threshold: f32,
    names: Vec<String>,
}

impl<E: Engine> YoloV4<E> {
    pub fn new(engine: E) -> Self {
        Self {
            engine,
            score_threshold: 0.25,
            iou_threshold: 0.3,
            names: Vec::new(),
        }
    }

    /// クラス名のファイル (1行に1クラス) を読み込みます。
    pub fn load_names<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        self.names = read_names(path)?;
        Ok(())
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// クラスIDに対応するクラス名
    pub fn class_name(&self, class: usize) -> Option<&str> {
        self.names.get(class).map(String::as_str)
    }

    pub fn input_size(&self) -> u32 {
        self.engine.input_size()
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// 画像1枚から物体を検出します。
    ///
    /// # Args
    /// * `img` - 入力画像
    ///
    /// # Return
    /// * 元の画像全体を 1 とした正規化座標の検出結果
    pub fn predict(&mut self, img: &DynamicImage) -> Result<Vec<DetectionData>> {
        ensure!(img.width() > 0 && img.height() > 0, "empty image");
        let size = self.engine.input_size();
        let letterboxed = img_proc::letterbox_img(img, size);
        let input = img_proc::to_input_tensor(&letterboxed);

        let candidates = self.engine.run(input.view()).context("inference failed")?;
        ensure!(
            candidates.len_of(Axis(2)) >= postprocess::MIN_CANDIDATE_LEN,
            "candidates have {} values per box, need at least {}",
            candidates.len_of(Axis(2)),
            postprocess::MIN_CANDIDATE_LEN
        );
        debug!("{} candidates", candidates.len_of(Axis(1)));

        let objs: Vec<DetectionData> = postprocess::post_process(
            candidates.index_axis(Axis(0), 0),
            size,
            self.score_threshold,
            self.iou_threshold,
        )
        .iter()
        .map(|d| d.fit_to_original(img.width(), img.height()))
        .collect();
        info!("{} objects detected", objs.len());
        Ok(objs)
    }
}

impl<B: Backend> YoloV4<GraphEngine<B>> {
    /// darknet の設定からモデルを作成します。
    pub fn from_config(config: &ModelConfig, backend: B) -> Result<Self> {
        Ok(Self::new(GraphEngine::new(config, backend)?))
    }
}

impl<I: Interpreter> YoloV4<TfliteEngine<I>> {
    /// tfliteファイルからモデルを作成します。
    ///
    /// # Args
    /// * `loader` - インタプリタを作成するランタイム
    /// * `tflite_path` - tfliteファイルのパス
    /// * `tpu` - Edge TPU 向けにコンパイルされたモデルか
    pub fn load_tflite<L, P>(loader: &L, tflite_path: P, tpu: bool) -> Result<Self>
    where
        L: InterpreterLoader<Interpreter = I>,
        P: AsRef<Path>,
    {
        let delegate = if tpu { Delegate::EdgeTpu } else { Delegate::Cpu };
        Ok(Self::new(TfliteEngine::load(loader, tflite_path, delegate)?))
    }
}
