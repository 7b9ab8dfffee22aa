use anyhow::{Error, Result};
use image::imageops::{self, FilterType};
use image::RgbaImage;
use ndarray::{Array, Array4};
use ort::session::SessionOutputs;

use crate::shapes::Rect;

#[derive(Debug, Clone, Copy)]
pub enum OutputRange {
    ZeroToOne,
    NegOneToOne,
}

impl OutputRange {
    fn map(&self, v: u8) -> f32 {
        match self {
            OutputRange::ZeroToOne => v as f32 / 255.,
            OutputRange::NegOneToOne => v as f32 / 127.5 - 1.,
        }
    }
}

/// Resize `img` to `width`x`height` and lay it out as a 1xHxWx3 f32 tensor.
pub fn image_to_array(img: &RgbaImage, width: u32, height: u32, range: OutputRange) -> Array4<f32> {
    let resized = imageops::resize(img, width, height, FilterType::Triangle);

    Array::from_shape_fn(
        (1, height as usize, width as usize, 3),
        |(_, y, x, c)| range.map(resized.get_pixel(x as u32, y as u32)[c]),
    )
}

/// Crop `bounds` out of `img` (clamped to the image) and tensorise it.
pub fn crop_to_array(
    img: &RgbaImage,
    bounds: &Rect,
    width: u32,
    height: u32,
    range: OutputRange,
) -> Result<(Array4<f32>, Rect)> {
    let clamped = bounds.clamp(img.width(), img.height());
    let (x, y) = (clamped.x.floor() as u32, clamped.y.floor() as u32);
    let w = (clamped.w.round() as u32).min(img.width() - x.min(img.width()));
    let h = (clamped.h.round() as u32).min(img.height() - y.min(img.height()));
    if w == 0 || h == 0 {
        return Err(Error::msg(format!("empty crop for {bounds:?}")));
    }

    let crop = imageops::crop_imm(img, x, y, w, h).to_image();
    let used = Rect::new(x as f32, y as f32, w as f32, h as f32);

    Ok((image_to_array(&crop, width, height, range), used))
}

/// Flatten a named output tensor.
pub fn extract(outputs: &SessionOutputs, name: &str) -> Result<Vec<f32>> {
    let tensor = outputs[name].try_extract_tensor::<f32>()?;
    Ok(tensor.iter().copied().collect())
}

pub fn softmax(values: &[f32]) -> Vec<f32> {
    let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = values.iter().map(|v| (v - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.iter().map(|e| e / sum).collect()
}

pub fn sigmoid_stable(x: f32) -> f32 {
    if x >= 0. {
        1. / (1. + (-x).exp())
    } else {
        x.exp() / (1. + x.exp())
    }
}
