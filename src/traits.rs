use crate::errors::Result;
use image::DynamicImage;

/// セグメンテーション時のオプション
///
/// 呼び出し側が後処理の有無を明示的に指定する
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentOptions {
    /// マスクの後処理（オープニング・ぼかし・二値化）を適用するか
    pub post_process_mask: bool,
}

impl Default for SegmentOptions {
    fn default() -> Self {
        Self {
            post_process_mask: true,
        }
    }
}

/// 画像セグメンテーションモデルの抽象化
///
/// 依存関係逆転原則（DIP）に従い、具象クラスではなく抽象に依存する
pub trait ImageSegmentationModel: Send + Sync {
    /// 画像のセグメンテーション処理を実行
    ///
    /// 入力と同じサイズ・同じ画素順で、前景の確信度をアルファチャンネルに持つ画像を返す
    fn segment_image(&self, img: &DynamicImage, options: &SegmentOptions)
        -> Result<DynamicImage>;
}

impl<T: ImageSegmentationModel + ?Sized> ImageSegmentationModel for std::sync::Arc<T> {
    fn segment_image(&self, img: &DynamicImage, options: &SegmentOptions) -> Result<DynamicImage> {
        (**self).segment_image(img, options)
    }
}
