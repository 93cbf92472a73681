use image::{GrayImage, Luma};
use imageproc::distance_transform::Norm;
use imageproc::filter::gaussian_blur_f32;
use imageproc::map::map_colors;
use imageproc::morphology::open;

const BLUR_SIGMA: f32 = 2.0;
const THRESHOLD: u8 = 127;

/// Cleans up a raw foreground mask.
///
/// Opening with a 3x3 cross removes isolated speckles, the blur smooths the
/// contour, and the final threshold turns the result back into a hard matte.
pub fn refine_mask(mask: &GrayImage) -> GrayImage {
    let opened = open(mask, Norm::L1, 1);
    let blurred = gaussian_blur_f32(&opened, BLUR_SIGMA);
    map_colors(&blurred, |Luma([v])| {
        Luma([if v < THRESHOLD { 0 } else { u8::MAX }])
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refine_is_binary() {
        let mask = GrayImage::from_fn(32, 32, |x, y| Luma([((x * 8 + y) % 256) as u8]));
        let refined = refine_mask(&mask);

        assert_eq!(refined.dimensions(), mask.dimensions());
        assert!(refined.pixels().all(|Luma([v])| *v == 0 || *v == 255));
    }

    #[test]
    fn test_refine_removes_single_pixel_speckle() {
        let mut mask = GrayImage::new(16, 16);
        mask.put_pixel(8, 8, Luma([255]));

        let refined = refine_mask(&mask);
        assert!(refined.pixels().all(|Luma([v])| *v == 0));
    }

    #[test]
    fn test_refine_keeps_solid_region() {
        let mask = GrayImage::from_fn(40, 40, |x, y| {
            if (10..30).contains(&x) && (10..30).contains(&y) {
                Luma([255])
            } else {
                Luma([0])
            }
        });

        let refined = refine_mask(&mask);
        assert_eq!(refined.get_pixel(20, 20), &Luma([255]));
        assert_eq!(refined.get_pixel(2, 2), &Luma([0]));
    }
}
