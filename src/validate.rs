use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, Rgb, RgbImage};

use crate::error::RejectionReason;

const JPEG_QUALITY: u8 = 85;

/// A candidate that passed validation and was normalized to canonical form.
#[derive(Debug, Clone)]
pub struct ValidatedImage {
    pub width: u32,
    pub height: u32,
    pub bytes: Vec<u8>,
    pub content_type: &'static str,
}

/// Validates raw candidate bytes and normalizes survivors.
///
/// Checks run in order: decode first (corrupt input is rejected here, not
/// retried), then the minimum-dimension gate. Normalization fits the image
/// within a `target_size` square without upscaling, flattens transparency
/// onto white, and re-encodes as JPEG. Identical input always produces
/// identical output, which keeps re-runs idempotent.
#[derive(Debug, Clone)]
pub struct Normalizer {
    min_size: u32,
    target_size: u32,
}

impl Normalizer {
    pub fn new(min_size: u32, target_size: u32) -> Self {
        Self {
            min_size,
            target_size,
        }
    }

    pub fn process(&self, raw: &[u8]) -> Result<ValidatedImage, RejectionReason> {
        let decoded = image::load_from_memory(raw)
            .map_err(|e| RejectionReason::Undecodable(e.to_string()))?;
        let (width, height) = decoded.dimensions();

        if width < self.min_size || height < self.min_size {
            return Err(RejectionReason::TooSmall {
                width,
                height,
                min: self.min_size,
            });
        }

        let resized = if width > self.target_size || height > self.target_size {
            decoded.resize(self.target_size, self.target_size, FilterType::Lanczos3)
        } else {
            decoded
        };

        let flattened = flatten_onto_white(&resized);
        let (out_w, out_h) = flattened.dimensions();

        let mut bytes = Vec::new();
        let encoder = JpegEncoder::new_with_quality(&mut bytes, JPEG_QUALITY);
        DynamicImage::ImageRgb8(flattened)
            .write_with_encoder(encoder)
            .map_err(|e| RejectionReason::EncodeFailed(e.to_string()))?;

        Ok(ValidatedImage {
            width: out_w,
            height: out_h,
            bytes,
            content_type: "image/jpeg",
        })
    }
}

/// Composite any alpha onto a white background. Opaque input passes through
/// with only the RGB conversion.
fn flatten_onto_white(img: &DynamicImage) -> RgbImage {
    let rgba = img.to_rgba8();
    let mut canvas = RgbImage::from_pixel(rgba.width(), rgba.height(), Rgb([255, 255, 255]));
    for (x, y, px) in rgba.enumerate_pixels() {
        let a = px.0[3] as u32;
        if a == 0 {
            continue;
        }
        let blend = |c: u8| ((c as u32 * a + 255 * (255 - a)) / 255) as u8;
        canvas.put_pixel(x, y, Rgb([blend(px.0[0]), blend(px.0[1]), blend(px.0[2])]));
    }
    canvas
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgba, RgbaImage};
    use std::io::Cursor;

    fn png_bytes(width: u32, height: u32, pixel: Rgba<u8>) -> Vec<u8> {
        let img = RgbaImage::from_pixel(width, height, pixel);
        let mut buf = Vec::new();
        DynamicImage::ImageRgba8(img)
            .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
            .unwrap();
        buf
    }

    fn normalizer() -> Normalizer {
        Normalizer::new(400, 1000)
    }

    #[test]
    fn garbage_bytes_are_rejected() {
        let err = normalizer().process(b"not an image at all").unwrap_err();
        assert!(matches!(err, RejectionReason::Undecodable(_)));
    }

    #[test]
    fn truncated_image_is_rejected() {
        let mut bytes = png_bytes(500, 500, Rgba([10, 20, 30, 255]));
        bytes.truncate(40);
        let err = normalizer().process(&bytes).unwrap_err();
        assert!(matches!(err, RejectionReason::Undecodable(_)));
    }

    #[test]
    fn below_minimum_is_rejected_on_either_axis() {
        let bytes = png_bytes(200, 200, Rgba([10, 20, 30, 255]));
        let err = normalizer().process(&bytes).unwrap_err();
        assert_eq!(
            err,
            RejectionReason::TooSmall {
                width: 200,
                height: 200,
                min: 400
            }
        );

        let bytes = png_bytes(900, 300, Rgba([10, 20, 30, 255]));
        assert!(matches!(
            normalizer().process(&bytes).unwrap_err(),
            RejectionReason::TooSmall { height: 300, .. }
        ));
    }

    #[test]
    fn small_enough_image_is_never_upscaled() {
        let bytes = png_bytes(600, 450, Rgba([10, 20, 30, 255]));
        let out = normalizer().process(&bytes).unwrap();
        assert_eq!((out.width, out.height), (600, 450));
    }

    #[test]
    fn large_image_fits_target_square_preserving_aspect() {
        let bytes = png_bytes(2000, 1000, Rgba([10, 20, 30, 255]));
        let out = normalizer().process(&bytes).unwrap();
        assert!(out.width <= 1000 && out.height <= 1000);
        let in_ratio = 2000.0 / 1000.0;
        let out_ratio = out.width as f64 / out.height as f64;
        assert!((in_ratio - out_ratio).abs() < 0.01);
    }

    #[test]
    fn nine_hundred_square_stays_at_original_resolution() {
        let bytes = png_bytes(900, 900, Rgba([10, 20, 30, 255]));
        let out = normalizer().process(&bytes).unwrap();
        assert_eq!((out.width, out.height), (900, 900));
        assert_eq!(out.content_type, "image/jpeg");
    }

    #[test]
    fn output_is_deterministic_for_identical_input() {
        let bytes = png_bytes(1200, 800, Rgba([40, 80, 120, 255]));
        let a = normalizer().process(&bytes).unwrap();
        let b = normalizer().process(&bytes).unwrap();
        assert_eq!(a.bytes, b.bytes);
    }

    #[test]
    fn transparency_is_flattened_onto_white() {
        let bytes = png_bytes(500, 500, Rgba([0, 0, 0, 0]));
        let out = normalizer().process(&bytes).unwrap();
        let decoded = image::load_from_memory(&out.bytes).unwrap().to_rgb8();
        let px = decoded.get_pixel(250, 250);
        assert!(px.0.iter().all(|&c| c >= 250), "expected white matte, got {:?}", px);
    }
}
