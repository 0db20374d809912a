//! # YOLOv4 / YOLOv4-tiny 推論ライブラリ
//!
//! このクレートは、darknet形式の設定からYOLOv4のレイヤグラフを組み立て、
//! 検出ヘッドの出力をバウンディングボックスにデコードするためのRustライブラリです。
//!
//! ## 主な機能
//!
//! 1. **レイヤグラフの構築**: `.cfg` ファイルを読み込み、ルートやショートカットを解決したグラフを作ります。
//! 2. **検出ヘッドのデコード**: グリッド・アンカーを使って、生の出力を正規化座標のボックスに変換します。
//! 3. **tfliteモデルの推論**: コンパイル済みモデルをインタプリタ (CPU / Edge TPU) で実行します。
//! 4. **後処理**: スコアによる絞り込みと DIoU-NMS を行い、元の画像の座標に戻します。
//!
//! 畳み込みなどのテンソル演算とtfliteランタイムは外部から [`graph::Backend`] と
//! [`interpreter::InterpreterLoader`] として与えます。
//!
//! ## Example
//! ```ignore
//! let mut yolo = YoloV4::load_tflite(&runtime, "yolov4-tiny-edgetpu.tflite", true)?;
//! yolo.load_names("coco.names")?;
//! let result = yolo.predict(&image::open("dog.jpg")?)?;
//! ```

pub mod config;
pub mod detection_result;
pub mod error;
pub mod graph;
pub mod grid;
pub mod img_proc;
pub mod interpreter;
pub mod layer;
pub mod postprocess;
pub mod yolo;
pub mod yolov4;

mod nms;

pub use error::{Result, YoloError};
pub use yolov4::YoloV4;
