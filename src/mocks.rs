use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::artifact::{ArtifactFetcher, FetchError};
use crate::errors::{Result, RmbgError, Stage};
use crate::imageops_ai::cutout;
use crate::traits::{ImageSegmentationModel, SegmentOptions};
use async_trait::async_trait;
use image::{DynamicImage, GrayImage, Luma};
use parking_lot::Mutex;

/// モックフェッチャーが書き込む内容
pub const MOCK_PAYLOAD: &[u8] = b"onnx-weights-for-tests";

/// テスト用のモックセグメンテーションモデル
///
/// 明るい画素を前景とみなすだけの決定的な実装。呼び出し回数と最後のオプションを記録する
#[derive(Debug, Default)]
pub struct MockSegmentationModel {
    calls: AtomicUsize,
    last_options: Mutex<Option<SegmentOptions>>,
}

impl MockSegmentationModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_options(&self) -> Option<SegmentOptions> {
        *self.last_options.lock()
    }
}

impl ImageSegmentationModel for MockSegmentationModel {
    fn segment_image(&self, img: &DynamicImage, options: &SegmentOptions) -> Result<DynamicImage> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_options.lock() = Some(*options);

        let luma = img.to_luma8();
        let mask = GrayImage::from_fn(luma.width(), luma.height(), |x, y| {
            let Luma([v]) = *luma.get_pixel(x, y);
            if options.post_process_mask {
                Luma([if v >= 128 { 255 } else { 0 }])
            } else {
                Luma([v])
            }
        });
        let result = cutout(&img.to_rgba8(), &mask)
            .map_err(|e| RmbgError::inference(Stage::Composite, "マスク適用", e))?;
        Ok(DynamicImage::ImageRgba8(result))
    }
}

/// 常に推論に失敗するモデル
#[derive(Debug, Clone, Copy)]
pub struct FailingSegmentationModel;

impl ImageSegmentationModel for FailingSegmentationModel {
    fn segment_image(&self, _img: &DynamicImage, _options: &SegmentOptions) -> Result<DynamicImage> {
        Err(RmbgError::inference(
            Stage::Segment,
            "モデル実行",
            "simulated runtime failure",
        ))
    }
}

/// 入力と異なるサイズの画像を返す不正なモデル
#[derive(Debug, Clone, Copy)]
pub struct FaultyOutputModel;

impl ImageSegmentationModel for FaultyOutputModel {
    fn segment_image(&self, img: &DynamicImage, _options: &SegmentOptions) -> Result<DynamicImage> {
        Ok(DynamicImage::new_rgba8(img.width() + 1, img.height()))
    }
}

/// ネットワークを使わないテスト用フェッチャー
///
/// 呼び出し回数を数え、指定時間待ってから成功または失敗する。
/// 失敗時も途中まで書き込むので、部分ファイルが公開されないことを確認できる
#[derive(Debug)]
pub struct MockFetcher {
    calls: AtomicUsize,
    failing: AtomicBool,
    delay: Duration,
}

impl MockFetcher {
    pub fn new(delay_ms: u64) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
            delay: Duration::from_millis(delay_ms),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl ArtifactFetcher for MockFetcher {
    async fn fetch(&self, url: &str, dest: &Path) -> std::result::Result<u64, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::fs::write(dest, &MOCK_PAYLOAD[..4])
            .await
            .map_err(|e| FetchError::io(dest, "write", e))?;
        tokio::time::sleep(self.delay).await;

        if self.failing.load(Ordering::SeqCst) {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: 503,
            });
        }
        tokio::fs::write(dest, MOCK_PAYLOAD)
            .await
            .map_err(|e| FetchError::io(dest, "write", e))?;
        Ok(MOCK_PAYLOAD.len() as u64)
    }
}

/// テスト用のファクトリー関数
pub fn create_mock_model() -> MockSegmentationModel {
    MockSegmentationModel::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GenericImageView, Rgb, RgbImage};

    #[test]
    fn test_mock_model_segment_image() -> Result<()> {
        let mock = create_mock_model();
        let test_image = DynamicImage::ImageRgb8(RgbImage::from_fn(10, 10, |x, _| {
            if x < 5 {
                Rgb([255, 255, 255])
            } else {
                Rgb([0, 0, 0])
            }
        }));

        let result = mock.segment_image(&test_image, &SegmentOptions::default())?;
        assert_eq!(result.dimensions(), test_image.dimensions());
        assert_eq!(result.get_pixel(0, 0).0[3], 255);
        assert_eq!(result.get_pixel(9, 0).0[3], 0);
        assert_eq!(mock.calls(), 1);
        Ok(())
    }

    #[test]
    fn test_failing_model() {
        let result = FailingSegmentationModel.segment_image(
            &DynamicImage::new_rgb8(1, 1),
            &SegmentOptions::default(),
        );
        assert!(result.is_err());
    }
}
