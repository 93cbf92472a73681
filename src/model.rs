use std::path::{Path, PathBuf};

use crate::{
    errors::{RmbgError, Result, Stage},
    imageops_ai::{cutout, refine_mask},
    traits::{ImageSegmentationModel, SegmentOptions},
};
use image::{
    imageops, imageops::FilterType, DynamicImage, GenericImageView, GrayImage, RgbImage,
};
use ndarray::prelude::*;
use nshare::AsNdarray3;
use ort::value::TensorRef;
use ort::{
    execution_providers::{CUDAExecutionProvider, TensorRTExecutionProvider},
    session::{builder::GraphOptimizationLevel, Session},
};
use parking_lot::Mutex;
use tracing::{debug, info};

/// U²-Net の入力サイズ（モデルが動的形状を返した場合の既定値）
pub const DEFAULT_IMAGE_SIZE: u32 = 320;

const MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const STD: [f32; 3] = [0.229, 0.224, 0.225];

struct LoadedSession {
    session: Session,
    input_name: String,
    output_name: String,
    image_size: u32,
}

/// ONNX Runtime で動作する U²-Net 背景除去モデル
///
/// セッションは初回推論時（または [`Model::warm_up`]）に作成する。
/// モデルファイルの存在は呼び出し側（`ArtifactCache`）が保証する。
pub struct Model {
    model_path: PathBuf,
    device_id: i32,
    intra_threads: usize,
    session: Mutex<Option<LoadedSession>>,
}

impl Model {
    pub fn new(model_path: &Path, device_id: i32, intra_threads: usize) -> Self {
        Self {
            model_path: model_path.to_path_buf(),
            device_id,
            intra_threads,
            session: Mutex::new(None),
        }
    }

    pub fn model_path(&self) -> &Path {
        &self.model_path
    }

    pub fn is_loaded(&self) -> bool {
        self.session.lock().is_some()
    }

    /// セッションを作成し、ゼロテンソルで一度推論して初期化する
    pub fn warm_up(&self) -> Result<()> {
        let mut guard = self.session.lock();
        let loaded = self.loaded(&mut guard)?;
        let size = loaded.image_size as usize;
        let data = Array4::<f32>::zeros((1, 3, size, size));
        run(loaded, &data)?;
        info!(path = %self.model_path.display(), image_size = size, "Model warmed up");
        Ok(())
    }

    pub fn predict(&self, tensor: ArrayView4<f32>) -> Result<Array4<f32>> {
        let mut guard = self.session.lock();
        let loaded = self.loaded(&mut guard)?;
        run(loaded, &tensor.as_standard_layout().to_owned())
    }

    fn image_size(&self) -> Result<u32> {
        let mut guard = self.session.lock();
        Ok(self.loaded(&mut guard)?.image_size)
    }

    fn loaded<'a>(&self, slot: &'a mut Option<LoadedSession>) -> Result<&'a mut LoadedSession> {
        if slot.is_none() {
            *slot = Some(self.load_session()?);
        }
        slot.as_mut().ok_or_else(|| {
            RmbgError::inference(Stage::Segment, "セッション取得", "session slot is empty")
        })
    }

    fn load_session(&self) -> Result<LoadedSession> {
        let mut builder = Session::builder()
            .map_err(|e| model_error("セッションビルダー初期化", e))?
            .with_execution_providers([
                TensorRTExecutionProvider::default()
                    .with_device_id(self.device_id)
                    .build(),
                CUDAExecutionProvider::default()
                    .with_device_id(self.device_id)
                    .build(),
            ])
            .map_err(|e| model_error("実行プロバイダー設定", e))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| model_error("最適化レベル設定", e))?
            .with_memory_pattern(true)
            .map_err(|e| model_error("メモリパターン設定", e))?;

        if self.intra_threads > 0 {
            builder = builder
                .with_intra_threads(self.intra_threads)
                .map_err(|e| model_error("スレッド数設定", e))?;
        }

        let session = builder.commit_from_file(&self.model_path).map_err(|e| {
            model_error(
                format!("モデルファイル読み込み: {}", self.model_path.display()),
                e,
            )
        })?;

        let input = session.inputs.first().ok_or_else(|| {
            RmbgError::inference(Stage::Segment, "モデル入力取得", "model has no inputs")
        })?;
        let output = session.outputs.first().ok_or_else(|| {
            RmbgError::inference(Stage::Segment, "モデル出力取得", "model has no outputs")
        })?;

        let image_size = input
            .input_type
            .tensor_shape()
            .and_then(|shape| shape.get(2).copied())
            .filter(|&dim| dim > 0)
            .map_or(DEFAULT_IMAGE_SIZE, |dim| dim as u32);

        debug!(
            input = %input.name,
            output = %output.name,
            image_size,
            "ONNX session created"
        );

        Ok(LoadedSession {
            input_name: input.name.clone(),
            output_name: output.name.clone(),
            image_size,
            session,
        })
    }
}

impl ImageSegmentationModel for Model {
    fn segment_image(&self, img: &DynamicImage, options: &SegmentOptions) -> Result<DynamicImage> {
        let (width, height) = img.dimensions();
        let tensor = preprocess(&img.to_rgb8(), self.image_size()?);
        let prediction = self.predict(tensor.view())?;

        let mask = postprocess_mask(prediction.view(), width, height)?;
        let mask = if options.post_process_mask {
            refine_mask(&mask)
        } else {
            mask
        };

        // マスクを適用して前景を抽出
        let result = cutout(&img.to_rgba8(), &mask)
            .map_err(|e| RmbgError::inference(Stage::Composite, "マスク適用", e))?;
        Ok(DynamicImage::ImageRgba8(result))
    }
}

fn run(loaded: &mut LoadedSession, tensor: &Array4<f32>) -> Result<Array4<f32>> {
    let LoadedSession {
        session,
        input_name,
        output_name,
        ..
    } = loaded;
    let outputs =
        session.run(ort::inputs![input_name.as_str() => TensorRef::from_array_view(tensor)?])?;
    Ok(outputs[output_name.as_str()]
        .try_extract_array::<f32>()?
        .into_dimensionality::<Ix4>()?
        .to_owned())
}

fn model_error(operation: impl Into<String>, source: ort::Error) -> RmbgError {
    RmbgError::inference(Stage::Segment, operation, source)
}

/// 入力画像をモデル用の NCHW テンソルに変換する
///
/// 画像全体の最大値で割ってから ImageNet の平均・標準偏差で正規化する
pub fn preprocess(image: &RgbImage, image_size: u32) -> Array4<f32> {
    let image = imageops::resize(image, image_size, image_size, FilterType::Lanczos3);
    let pixels = image.as_ndarray3();
    let max = f32::from(pixels.iter().copied().max().unwrap_or(0).max(1));

    let mut tensor = pixels.mapv(|v| f32::from(v) / max).insert_axis(Axis(0));
    for (channel, (mean, std)) in MEAN.iter().zip(STD.iter()).enumerate() {
        tensor
            .slice_mut(s![0, channel, .., ..])
            .mapv_inplace(|v| (v - mean) / std);
    }
    tensor
}

/// 推論結果の1チャンネル目を 0..255 に正規化し、元画像サイズのマスクに戻す
pub fn postprocess_mask(prediction: ArrayView4<f32>, width: u32, height: u32) -> Result<GrayImage> {
    let (_, channels, mask_height, mask_width) = prediction.dim();
    if channels == 0 || mask_height == 0 || mask_width == 0 {
        return Err(RmbgError::inference(
            Stage::Segment,
            "マスク形状確認",
            format!("unexpected output shape {:?}", prediction.shape()),
        ));
    }

    let plane = prediction.slice(s![0, 0, .., ..]);
    let (min, max) = plane
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });
    let range = (max - min).max(f32::EPSILON);

    let raw = plane
        .iter()
        .map(|&v| (((v - min) / range) * 255.0) as u8)
        .collect::<Vec<u8>>();
    let mask = GrayImage::from_raw(mask_width as u32, mask_height as u32, raw).ok_or_else(|| {
        RmbgError::inference(Stage::Segment, "マスク生成", "mask buffer size mismatch")
    })?;

    Ok(imageops::resize(&mask, width, height, FilterType::Lanczos3))
}
