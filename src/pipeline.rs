use std::io::Cursor;

use image::{DynamicImage, GenericImageView, ImageDecoder, ImageFormat, ImageReader};

use crate::errors::{Result, RmbgError, Stage};
use crate::traits::{ImageSegmentationModel, SegmentOptions};

/// Turns uploaded bytes into a PNG with the background removed.
///
/// The pipeline owns no durable state: it decodes, hands the image to the
/// segmentation model exactly once, checks what comes back and encodes it.
pub struct InferencePipeline<M: ImageSegmentationModel> {
    model: M,
    options: SegmentOptions,
}

impl<M: ImageSegmentationModel> InferencePipeline<M> {
    pub const fn new(model: M, options: SegmentOptions) -> Self {
        Self { model, options }
    }

    pub const fn model(&self) -> &M {
        &self.model
    }

    pub const fn options(&self) -> &SegmentOptions {
        &self.options
    }

    pub fn process(&self, raw: &[u8]) -> Result<Vec<u8>> {
        let image = decode(raw)?;
        let segmented = self.segment(&image)?;
        let composited = composite(&image, segmented)?;
        encode(&composited)
    }

    fn segment(&self, image: &DynamicImage) -> Result<DynamicImage> {
        self.model
            .segment_image(image, &self.options)
            .map_err(|err| match err {
                err @ RmbgError::Inference { .. } => err,
                other => RmbgError::inference(Stage::Segment, "image segmentation", other),
            })
    }
}

/// Decodes a still image, honouring its EXIF orientation.
pub fn decode(raw: &[u8]) -> Result<DynamicImage> {
    let decode_error = |operation: &str, source: Box<dyn std::error::Error + Send + Sync>| {
        RmbgError::Decode {
            operation: operation.to_string(),
            source,
        }
    };

    let reader = ImageReader::new(Cursor::new(raw))
        .with_guessed_format()
        .map_err(|e| decode_error("format detection", Box::new(e)))?;
    let mut decoder = reader
        .into_decoder()
        .map_err(|e| decode_error("decoder creation", Box::new(e)))?;
    let orientation = decoder
        .orientation()
        .map_err(|e| decode_error("orientation lookup", Box::new(e)))?;
    let mut image = DynamicImage::from_decoder(decoder)
        .map_err(|e| decode_error("image decoding", Box::new(e)))?;
    image.apply_orientation(orientation);

    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return Err(decode_error(
            "dimension check",
            format!("image has no pixels ({width}x{height})").into(),
        ));
    }
    Ok(image)
}

/// Accepts the model output as the final RGBA raster.
///
/// The model already applied the matte; this only rejects output that does not
/// line up with the input.
fn composite(input: &DynamicImage, segmented: DynamicImage) -> Result<DynamicImage> {
    if segmented.dimensions() != input.dimensions() {
        return Err(RmbgError::inference(
            Stage::Composite,
            "output shape check",
            format!(
                "model returned {:?} for a {:?} input",
                segmented.dimensions(),
                input.dimensions()
            ),
        ));
    }
    if !segmented.color().has_alpha() {
        return Err(RmbgError::inference(
            Stage::Composite,
            "alpha channel check",
            format!("model returned {:?} without alpha", segmented.color()),
        ));
    }
    Ok(DynamicImage::ImageRgba8(segmented.into_rgba8()))
}

pub fn encode(image: &DynamicImage) -> Result<Vec<u8>> {
    let mut buffer = Cursor::new(Vec::new());
    image
        .write_to(&mut buffer, ImageFormat::Png)
        .map_err(|e| RmbgError::Encode {
            operation: "png encoding".to_string(),
            source: Box::new(e),
        })?;
    Ok(buffer.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use crate::mocks::{create_mock_model, FailingSegmentationModel, FaultyOutputModel};
    use image::{ColorType, Rgb, RgbImage};

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let image = DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, _| {
            if x < width / 2 {
                Rgb([250, 250, 250])
            } else {
                Rgb([10, 20, 30])
            }
        }));
        encode(&image).unwrap()
    }

    #[test]
    fn test_process_round_trip_shape() -> Result<()> {
        let model = create_mock_model();
        let pipeline = InferencePipeline::new(model, SegmentOptions::default());

        let output = pipeline.process(&png_bytes(37, 21))?;
        let decoded = image::load_from_memory_with_format(&output, ImageFormat::Png).unwrap();

        assert_eq!(decoded.dimensions(), (37, 21));
        assert_eq!(decoded.color(), ColorType::Rgba8);
        assert_eq!(pipeline.model().calls(), 1);
        Ok(())
    }

    #[test]
    fn test_corrupt_input_never_reaches_model() {
        let model = create_mock_model();
        let pipeline = InferencePipeline::new(model, SegmentOptions::default());

        let err = pipeline.process(b"definitely not an image").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Decode);
        assert_eq!(pipeline.model().calls(), 0);

        let mut truncated = png_bytes(8, 8);
        truncated.truncate(truncated.len() / 2);
        let err = pipeline.process(&truncated).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Decode);
        assert_eq!(pipeline.model().calls(), 0);
    }

    #[test]
    fn test_model_failure_is_inference_error() {
        let pipeline = InferencePipeline::new(FailingSegmentationModel, SegmentOptions::default());
        let err = pipeline.process(&png_bytes(4, 4)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Inference);
        assert_eq!(err.failure_record().stage, Stage::Segment);
    }

    #[test]
    fn test_malformed_model_output_is_inference_error() {
        let pipeline = InferencePipeline::new(FaultyOutputModel, SegmentOptions::default());
        let err = pipeline.process(&png_bytes(4, 4)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Inference);
        assert_eq!(err.failure_record().stage, Stage::Composite);
    }

    #[test]
    fn test_options_are_forwarded() -> Result<()> {
        let model = create_mock_model();
        let options = SegmentOptions {
            post_process_mask: false,
        };
        let pipeline = InferencePipeline::new(model, options);
        pipeline.process(&png_bytes(2, 2))?;
        assert_eq!(pipeline.model().last_options(), Some(options));
        Ok(())
    }

    /// JPEG with an APP1 segment carrying Orientation = 6 (rotate 90° clockwise).
    fn rotated_jpeg(width: u32, height: u32) -> Vec<u8> {
        let mut plain = Vec::new();
        DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb([200, 200, 200])))
            .write_to(&mut Cursor::new(&mut plain), ImageFormat::Jpeg)
            .unwrap();

        #[rustfmt::skip]
        let app1: [u8; 36] = [
            0xFF, 0xE1, 0x00, 0x22,
            b'E', b'x', b'i', b'f', 0x00, 0x00,
            // TIFF header, big endian, IFD0 at offset 8
            b'M', b'M', 0x00, 0x2A, 0x00, 0x00, 0x00, 0x08,
            0x00, 0x01,
            // tag 0x0112 Orientation, SHORT, count 1, value 6
            0x01, 0x12, 0x00, 0x03, 0x00, 0x00, 0x00, 0x01, 0x00, 0x06, 0x00, 0x00,
            0x00, 0x00, 0x00, 0x00,
        ];

        let mut jpeg = plain[..2].to_vec();
        jpeg.extend_from_slice(&app1);
        jpeg.extend_from_slice(&plain[2..]);
        jpeg
    }

    #[test]
    fn test_decode_applies_exif_orientation() -> Result<()> {
        let jpeg = rotated_jpeg(8, 4);
        assert_eq!(decode(&jpeg)?.dimensions(), (4, 8));

        let pipeline = InferencePipeline::new(create_mock_model(), SegmentOptions::default());
        let output = pipeline.process(&jpeg)?;
        let decoded = image::load_from_memory_with_format(&output, ImageFormat::Png).unwrap();
        assert_eq!(decoded.dimensions(), (4, 8));
        Ok(())
    }

    #[test]
    fn test_process_is_deterministic() -> Result<()> {
        let pipeline = InferencePipeline::new(create_mock_model(), SegmentOptions::default());
        let input = png_bytes(16, 9);
        assert_eq!(pipeline.process(&input)?, pipeline.process(&input)?);
        Ok(())
    }
}
