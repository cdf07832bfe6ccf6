use ndarray::prelude::*;

use crate::channels::ChannelPair;
use crate::errors::Result;
use crate::family::{DenoiseKey, ModelKey};

/// 1回のセグメンテーション呼び出しに渡す全パラメータ
///
/// 実行ごとに一度だけ構築し、以後変更しない。`diameter` が `None` の場合は
/// モデル側の自動サイズ検出を要求する。自動検出はサイズ対応モデルかつ
/// 非3Dモードのみで許可され、それ以外は直径リゾルバが事前に拒否する。
#[derive(Debug, Clone)]
pub struct SegmentationRequest {
    pub tensor: ArrayD<f32>,
    pub channels: ChannelPair,
    pub diameter: Option<f64>,
    pub do_3d: bool,
    pub anisotropy: f64,
    pub flow_threshold: f64,
    pub cellprob_threshold: f64,
    pub stitch_threshold: f64,
    pub min_size: i64,
    pub invert: bool,
}

/// モデルの生出力：ラベルマップ（0 = 背景、正の整数 = オブジェクトID）と
/// モデル内部解像度の確率マップ
#[derive(Debug, Clone)]
pub struct SegmentationOutput {
    pub labels: ArrayD<u32>,
    pub probabilities: ArrayD<f32>,
}

/// セグメンテーションモデルの抽象化
///
/// 依存関係逆転原則（DIP）に従い、具象バックエンドではなく抽象に依存する
pub trait SegmentationModel: Send + Sync {
    /// セグメンテーション推論を実行
    fn eval(&self, request: &SegmentationRequest) -> Result<SegmentationOutput>;
}

/// セグメンテーション前の画像復元モデルの抽象化
///
/// 返り値は復元済みテンソル。アップサンプリング系では解像度が変わる
pub trait DenoiseModel: Send + Sync {
    /// 復元推論を実行
    fn eval(
        &self,
        tensor: &ArrayD<f32>,
        diameter: Option<f64>,
        channels: ChannelPair,
    ) -> Result<ArrayD<f32>>;
}

/// モデルキャッシュ用のローダー抽象化
///
/// ロードは外部リソースを獲得し、ハンドルのドロップで解放される
pub trait ModelLoader: Send + Sync {
    type Segmenter: SegmentationModel;
    type Denoiser: DenoiseModel;

    /// セグメンテーションモデルをロード
    fn load_segmenter(&self, key: &ModelKey) -> Result<Self::Segmenter>;

    /// 復元モデルをロード
    fn load_denoiser(&self, key: &DenoiseKey) -> Result<Self::Denoiser>;
}

/// 共有アクセラレータメモリへのスコープ付きアクセス
///
/// `reserve` は推論前、`release` は全ての終了経路で呼ばれる。
/// `release` の失敗はログに記録され、呼び出し失敗には昇格しない
pub trait Accelerator: Send + Sync {
    /// プロセスに割り当てるメモリ割合を予約
    fn reserve(&self, memory_fraction: f64) -> Result<()>;

    /// キャッシュ済みメモリをベストエフォートで解放
    fn release(&self) -> Result<()>;
}

/// CPU実行用のアクセラレータスタブ
#[derive(Debug, Default, Clone, Copy)]
pub struct NullAccelerator;

impl Accelerator for NullAccelerator {
    fn reserve(&self, _memory_fraction: f64) -> Result<()> {
        Ok(())
    }

    fn release(&self) -> Result<()> {
        Ok(())
    }
}
