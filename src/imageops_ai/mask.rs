use anyhow::{anyhow, ensure, Result};
use image::{GenericImageView, GrayImage, ImageBuffer, Luma, Rgba, RgbaImage};

/// Composites `image` over a fully transparent canvas using `mask` as coverage.
///
/// Every channel, source alpha included, is scaled by `mask / 255`, so a zero mask
/// pixel becomes `[0, 0, 0, 0]` and a full mask pixel keeps the source pixel.
pub fn cutout<I>(image: &I, mask: &GrayImage) -> Result<RgbaImage>
where
    I: GenericImageView<Pixel = Rgba<u8>>,
{
    ensure!(
        image.dimensions() == mask.dimensions(),
        "Image and mask dimensions do not match: image {:?}, mask {:?}",
        image.dimensions(),
        mask.dimensions()
    );

    let processed_pixels = image
        .pixels()
        .zip(mask.pixels())
        .flat_map(|((_, _, Rgba(channels)), &Luma([coverage]))| {
            channels.map(|c| scale(c, coverage))
        })
        .collect::<Vec<u8>>();

    ImageBuffer::from_raw(image.width(), image.height(), processed_pixels)
        .ok_or_else(|| anyhow!("Failed to create ImageBuffer from processed pixels"))
}

fn scale(value: u8, coverage: u8) -> u8 {
    ((u16::from(value) * u16::from(coverage) + 127) / 255) as u8
}
