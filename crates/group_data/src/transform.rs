//! Image preprocessing: resize, center crop, channel normalization.

use image::imageops::FilterType;
use serde::{Deserialize, Serialize};

pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageTransform {
    /// Shorter side is resized to this before cropping.
    pub resize: u32,
    /// Square center crop side.
    pub crop: u32,
    pub mean: [f32; 3],
    pub std: [f32; 3],
}

impl Default for ImageTransform {
    fn default() -> Self {
        Self {
            resize: 256,
            crop: 224,
            mean: IMAGENET_MEAN,
            std: IMAGENET_STD,
        }
    }
}

impl ImageTransform {
    /// Crop to `size`, resizing with the same 256/224 ratio as the default pipeline.
    pub fn for_size(size: u32) -> Self {
        let size = size.max(1);
        ImageTransformBuilder::new()
            .resize((size as f32 * 256.0 / 224.0).round() as u32)
            .crop(size)
            .build()
    }

    pub fn output_shape(&self) -> [usize; 3] {
        [3, self.crop as usize, self.crop as usize]
    }

    pub fn describe(&self) -> String {
        format!(
            "resize={} crop={} mean={:?} std={:?}",
            self.resize, self.crop, self.mean, self.std
        )
    }

    pub fn apply(&self, img: &image::RgbImage) -> Vec<f32> {
        let resized = resize_shorter_side(img, self.resize.max(self.crop));
        let cropped = center_crop(&resized, self.crop);
        let (w, h) = cropped.dimensions();
        let plane = (w * h) as usize;
        let mut chw = vec![0.0f32; plane * 3];
        for (x, y, pixel) in cropped.enumerate_pixels() {
            let base = (y * w + x) as usize;
            for c in 0..3 {
                let v = pixel[c] as f32 / 255.0;
                chw[c * plane + base] = (v - self.mean[c]) / self.std[c].max(1e-6);
            }
        }
        chw
    }
}

#[derive(Debug, Clone, Default)]
pub struct ImageTransformBuilder {
    inner: ImageTransform,
}

impl ImageTransformBuilder {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn resize(mut self, resize: u32) -> Self {
        self.inner.resize = resize;
        self
    }
    pub fn crop(mut self, crop: u32) -> Self {
        self.inner.crop = crop.max(1);
        self
    }
    pub fn normalize(mut self, mean: [f32; 3], std: [f32; 3]) -> Self {
        self.inner.mean = mean;
        self.inner.std = std;
        self
    }
    pub fn build(self) -> ImageTransform {
        self.inner
    }
}

fn resize_shorter_side(img: &image::RgbImage, target: u32) -> image::RgbImage {
    let (w, h) = img.dimensions();
    if w.min(h) == target {
        return img.clone();
    }
    let scale = target as f32 / w.min(h).max(1) as f32;
    let new_w = ((w as f32 * scale).round() as u32).max(target);
    let new_h = ((h as f32 * scale).round() as u32).max(target);
    image::imageops::resize(img, new_w, new_h, FilterType::Triangle)
}

fn center_crop(img: &image::RgbImage, side: u32) -> image::RgbImage {
    let (w, h) = img.dimensions();
    let x0 = w.saturating_sub(side) / 2;
    let y0 = h.saturating_sub(side) / 2;
    image::imageops::crop_imm(img, x0, y0, side.min(w), side.min(h)).to_image()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_matches_declared_shape() {
        let img = image::RgbImage::from_fn(40, 30, |x, _| image::Rgb([x as u8, 0, 255]));
        let t = ImageTransformBuilder::new().resize(20).crop(16).build();
        let out = t.apply(&img);
        assert_eq!(out.len(), t.output_shape().iter().product::<usize>());
    }

    #[test]
    fn normalization_uses_channel_stats() {
        let img = image::RgbImage::from_fn(4, 4, |_, _| image::Rgb([255, 0, 0]));
        let t = ImageTransformBuilder::new()
            .resize(4)
            .crop(4)
            .normalize([0.5, 0.5, 0.5], [0.5, 0.5, 0.5])
            .build();
        let out = t.apply(&img);
        assert!((out[0] - 1.0).abs() < 1e-6);
        assert!((out[16] + 1.0).abs() < 1e-6);
    }
}
