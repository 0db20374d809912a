//! モデルの構築・推論で発生するエラーを定義するモジュール

use std::path::PathBuf;

use thiserror::Error;

/// レイヤを識別するための情報 (インデックスとセクション名)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerRef {
    pub index: Option<usize>,
    pub name: String,
}

impl LayerRef {
    pub fn new(index: usize, name: impl Into<String>) -> Self {
        Self {
            index: Some(index),
            name: name.into(),
        }
    }

    /// 特定のレイヤに属さない (`[net]` セクションなど) 場合
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            index: None,
            name: name.into(),
        }
    }
}

impl std::fmt::Display for LayerRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.index {
            Some(i) => write!(f, "{}_{}", self.name, i),
            None => write!(f, "{}", self.name),
        }
    }
}

/// このクレートのエラー型
#[derive(Debug, Error)]
pub enum YoloError {
    /// レイヤ構成の誤り。グラフ構築時に検出される
    #[error("configuration error at `{layer}`: {message}")]
    Configuration { layer: LayerRef, message: String },

    /// テンソル形状の不一致。その形状が最初に現れた時点で検出される
    #[error("shape error at `{layer}`: {message}")]
    Shape { layer: LayerRef, message: String },

    /// モデル・設定ファイルなどの外部リソースが読めない
    #[error("failed to read `{}`", path.display())]
    Resource {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// 外部のテンソル演算が失敗した
    #[error("backend failed at `{layer}`")]
    Backend {
        layer: LayerRef,
        #[source]
        source: anyhow::Error,
    },
}

impl YoloError {
    pub fn config(layer: LayerRef, message: impl Into<String>) -> Self {
        Self::Configuration {
            layer,
            message: message.into(),
        }
    }

    pub fn shape(layer: LayerRef, message: impl Into<String>) -> Self {
        Self::Shape {
            layer,
            message: message.into(),
        }
    }

    pub fn resource(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Resource {
            path: path.into(),
            source,
        }
    }
}

/// [`Result<T, YoloError>`] の別名
pub type Result<T> = std::result::Result<T, YoloError>;
