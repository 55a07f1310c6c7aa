use async_trait::async_trait;
use image::imageops::{self, FilterType};

use crate::{
    error::{Error, Result},
    face::FaceCropper,
    reader::{DecodedImage, encode_png},
    types::{BBox, FaceCrop, FaceDetection},
};

/// Default margin added around a detection before cropping.
pub const DEFAULT_ENLARGE_FACTOR: f32 = 1.5;
/// Default longest side of a stored crop, in pixels.
pub const DEFAULT_MAX_CROP_SIZE: u32 = 256;

/// Crops faces straight out of the decoded image with the `image` crate.
#[derive(Debug, Clone, Copy)]
pub struct ImageFaceCropper {
    pub enlarge_factor: f32,
    pub max_size: u32,
}

impl Default for ImageFaceCropper {
    fn default() -> Self {
        Self {
            enlarge_factor: DEFAULT_ENLARGE_FACTOR,
            max_size: DEFAULT_MAX_CROP_SIZE,
        }
    }
}

impl ImageFaceCropper {
    /// Square box around the detection, grown by `enlarge_factor` and
    /// clamped to the image. Returns `None` when nothing of it is visible.
    pub fn crop_box(
        &self,
        detection: &FaceDetection,
        width: u32,
        height: u32,
    ) -> Option<BBox> {
        let b = &detection.bbox;
        let side = b.width.max(b.height) * self.enlarge_factor;
        let cx = b.x + b.width / 2.0;
        let cy = b.y + b.height / 2.0;

        let x0 = (cx - side / 2.0).clamp(0.0, width as f32).floor();
        let y0 = (cy - side / 2.0).clamp(0.0, height as f32).floor();
        let x1 = (cx + side / 2.0).clamp(0.0, width as f32).ceil();
        let y1 = (cy + side / 2.0).clamp(0.0, height as f32).ceil();
        if x1 - x0 < 1.0 || y1 - y0 < 1.0 {
            return None;
        }
        Some(BBox {
            x: x0,
            y: y0,
            width: x1 - x0,
            height: y1 - y0,
        })
    }
}

#[async_trait]
impl FaceCropper for ImageFaceCropper {
    async fn crop(
        &self,
        image: &DecodedImage,
        detection: &FaceDetection,
    ) -> Result<FaceCrop> {
        let rgba = image.as_rgba();
        let image_box = self
            .crop_box(detection, rgba.width(), rgba.height())
            .ok_or_else(|| {
                Error::Inference("face box lies outside the image".into())
            })?;

        let mut crop = imageops::crop_imm(
            rgba,
            image_box.x as u32,
            image_box.y as u32,
            image_box.width as u32,
            image_box.height as u32,
        )
        .to_image();

        let longest = crop.width().max(crop.height());
        if longest > self.max_size {
            let scale = self.max_size as f32 / longest as f32;
            let w = ((crop.width() as f32 * scale).round() as u32).max(1);
            let h = ((crop.height() as f32 * scale).round() as u32).max(1);
            crop = imageops::resize(&crop, w, h, FilterType::Triangle);
        }

        Ok(FaceCrop {
            image: encode_png(&crop)?,
            image_box,
        })
    }
}

#[cfg(test)]
mod tests {
    use image::{Rgba, RgbaImage};

    use super::*;
    use crate::reader::decode_image;

    fn detection(x: f32, y: f32, size: f32) -> FaceDetection {
        FaceDetection {
            bbox: BBox {
                x,
                y,
                width: size,
                height: size,
            },
            landmarks: Vec::new(),
            probability: 0.9,
        }
    }

    #[test]
    fn box_is_enlarged_around_center() {
        let cropper = ImageFaceCropper::default();
        let b = cropper
            .crop_box(&detection(40.0, 40.0, 20.0), 100, 100)
            .unwrap();
        assert_eq!(
            b,
            BBox {
                x: 35.0,
                y: 35.0,
                width: 30.0,
                height: 30.0
            }
        );
    }

    #[test]
    fn box_is_clamped_to_image() {
        let cropper = ImageFaceCropper::default();
        let b = cropper
            .crop_box(&detection(-5.0, 90.0, 20.0), 100, 100)
            .unwrap();
        assert_eq!(b.x, 0.0);
        assert_eq!(b.y_max(), 100.0);
        assert!(
            cropper
                .crop_box(&detection(500.0, 500.0, 10.0), 100, 100)
                .is_none()
        );
    }

    #[tokio::test]
    async fn crop_is_downscaled_png() {
        let image = DecodedImage::new(RgbaImage::from_pixel(
            800,
            800,
            Rgba([200, 10, 10, 255]),
        ));
        let cropper = ImageFaceCropper::default();
        let crop = cropper
            .crop(&image, &detection(100.0, 100.0, 400.0))
            .await
            .unwrap();

        let decoded = decode_image(&crop.image).unwrap();
        assert_eq!(decoded.width(), DEFAULT_MAX_CROP_SIZE);
        assert_eq!(crop.image_box.width, 600.0);
    }
}
