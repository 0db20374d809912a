//! コンパイル済みモデル (tflite) を実行するインタプリタとのインターフェース
//!
//! モデルファイルの読み込みとデリゲートの呼び出しは外部のランタイムが行います。
//! このモジュールはランタイムに求める操作を [`Interpreter`] と [`InterpreterLoader`] として定義し、
//! それを使って推論を行う [`TfliteEngine`] を提供します。

use std::path::Path;

use anyhow::{ensure, Context, Result};
use log::info;
use ndarray::{concatenate, Array3, ArrayD, ArrayView4, Axis};

use crate::error::YoloError;
use crate::postprocess::reshape_raw_output;
use crate::yolov4::Engine;

/// 推論に使うデリゲート
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Delegate {
    #[default]
    Cpu,
    EdgeTpu,
}

impl Delegate {
    /// 読み込むデリゲートの共有ライブラリ名
    pub fn library(&self) -> Option<&'static str> {
        match self {
            Delegate::Cpu => None,
            Delegate::EdgeTpu => Some("libedgetpu.so.1"),
        }
    }
}

/// 入出力テンソルの情報
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TensorDetails {
    pub index: usize,
    pub shape: Vec<usize>,
}

/// テンソルの確保まで済んだインタプリタ
pub trait Interpreter {
    fn input_details(&self) -> Vec<TensorDetails>;

    fn output_details(&self) -> Vec<TensorDetails>;

    /// `index` の入力テンソルに書き込みます
    fn set_input(&mut self, index: usize, data: ArrayView4<f32>) -> Result<()>;

    fn invoke(&mut self) -> Result<()>;

    /// `index` の出力テンソルを読み出します。量子化されたモデルの場合は逆量子化した値です
    fn output(&self, index: usize) -> Result<ArrayD<f32>>;
}

/// モデルファイルからインタプリタを作成するランタイム
pub trait InterpreterLoader {
    type Interpreter: Interpreter;

    fn load(&self, model_path: &Path, delegate: Delegate) -> Result<Self::Interpreter>;
}

/// インタプリタで推論を行うエンジン
pub struct TfliteEngine<I> {
    interpreter: I,
    input_index: usize,
    input_size: u32,
    output_indices: Vec<usize>,
}

impl<I: Interpreter> TfliteEngine<I> {
    /// モデルを読み込み、入出力テンソルの情報を取得します。
    ///
    /// # Args
    /// * `loader` - インタプリタを作成するランタイム
    /// * `model_path` - tfliteファイルのパス
    /// * `delegate` - 使用するデリゲート
    ///
    /// # Return
    /// * 新たな `TfliteEngine` インスタンス
    pub fn load<L, P>(loader: &L, model_path: P, delegate: Delegate) -> Result<Self>
    where
        L: InterpreterLoader<Interpreter = I>,
        P: AsRef<Path>,
    {
        let model_path = model_path.as_ref();
        // ランタイムに渡す前にファイルの有無を確認する
        std::fs::metadata(model_path).map_err(|e| YoloError::resource(model_path, e))?;

        let interpreter = loader
            .load(model_path, delegate)
            .with_context(|| format!("failed to load `{}`", model_path.display()))?;

        let input = interpreter
            .input_details()
            .into_iter()
            .next()
            .context("model has no input tensor")?;
        ensure!(
            input.shape.len() == 4 && input.shape[1] == input.shape[2],
            "expected a square (1, size, size, channels) input, got {:?}",
            input.shape
        );
        let output_indices: Vec<usize> = interpreter
            .output_details()
            .iter()
            .map(|d| d.index)
            .collect();
        ensure!(!output_indices.is_empty(), "model has no output tensor");

        info!(
            "loaded {} ({:?}): input {:?}, {} outputs",
            model_path.display(),
            delegate,
            input.shape,
            output_indices.len()
        );
        Ok(Self {
            interpreter,
            input_index: input.index,
            input_size: input.shape[1] as u32,
            output_indices,
        })
    }

    pub fn interpreter(&self) -> &I {
        &self.interpreter
    }
}

impl<I: Interpreter> Engine for TfliteEngine<I> {
    fn input_size(&self) -> u32 {
        self.input_size
    }

    fn run(&mut self, input: ArrayView4<f32>) -> Result<Array3<f32>> {
        self.interpreter.set_input(self.input_index, input)?;
        self.interpreter.invoke()?;

        let mut outputs = Vec::with_capacity(self.output_indices.len());
        for &index in &self.output_indices {
            let raw = self.interpreter.output(index)?;
            outputs.push(reshape_raw_output(raw.view()).with_context(|| format!("output {index}"))?);
        }
        let views: Vec<_> = outputs.iter().map(|o| o.view()).collect();
        Ok(concatenate(Axis(1), &views).context("outputs have different box sizes")?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array, IxDyn};

    #[test]
    fn edge_tpu_delegate_library() {
        assert_eq!(Delegate::EdgeTpu.library(), Some("libedgetpu.so.1"));
        assert_eq!(Delegate::default().library(), None);
    }

    struct Fixed;

    impl Interpreter for Fixed {
        fn input_details(&self) -> Vec<TensorDetails> {
            vec![TensorDetails {
                index: 0,
                shape: vec![1, 64, 64, 3],
            }]
        }

        fn output_details(&self) -> Vec<TensorDetails> {
            vec![
                TensorDetails {
                    index: 7,
                    shape: vec![1, 2, 2, 3, 6],
                },
                TensorDetails {
                    index: 5,
                    shape: vec![1, 4, 4, 18],
                },
            ]
        }

        fn set_input(&mut self, _: usize, _: ArrayView4<f32>) -> Result<()> {
            Ok(())
        }

        fn invoke(&mut self) -> Result<()> {
            Ok(())
        }

        fn output(&self, index: usize) -> Result<ArrayD<f32>> {
            let shape = match index {
                7 => vec![1, 2, 2, 3, 6],
                _ => vec![1, 4, 4, 18],
            };
            Ok(Array::from_elem(IxDyn(&shape), index as f32))
        }
    }

    struct Loader;

    impl InterpreterLoader for Loader {
        type Interpreter = Fixed;

        fn load(&self, _: &Path, _: Delegate) -> Result<Fixed> {
            Ok(Fixed)
        }
    }

    #[test]
    fn missing_model_is_a_resource_error() {
        let err = TfliteEngine::load(&Loader, "/nonexistent/yolov4.tflite", Delegate::Cpu)
            .err()
            .unwrap();
        assert!(matches!(
            err.downcast_ref::<YoloError>(),
            Some(YoloError::Resource { .. })
        ));
    }

    #[test]
    fn outputs_are_concatenated_in_output_order() {
        let model = std::env::temp_dir().join("yolov4_rs_interpreter_test.tflite");
        std::fs::write(&model, b"").unwrap();
        let mut engine = TfliteEngine::load(&Loader, &model, Delegate::EdgeTpu).unwrap();
        assert_eq!(engine.input_size(), 64);

        let out = engine.run(Array::zeros((1, 64, 64, 3)).view()).unwrap();
        assert_eq!(out.dim(), (1, 12 + 48, 6));
        assert_eq!(out[[0, 11, 5]], 7.0);
        assert_eq!(out[[0, 12, 0]], 5.0);
    }
}
