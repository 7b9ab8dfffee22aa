use super::model::Model;
use super::tensor::{crop_to_array, extract, OutputRange};
use crate::shapes::{Point, Rect};
use anyhow::{Error, Result};
use image::RgbaImage;
use ort::value::Tensor;
use tracing::{span, Level};

pub const WIDTH: u32 = 112;
pub const HEIGHT: u32 = 112;
pub const NUM_POINTS: usize = 68;

// pad 10% on each side so the jaw line stays inside the crop
pub const CROP_PADDING: f32 = 1.2;

/// 68 point landmark regression.
///
/// Input is the padded face crop as 1x112x112x3 in [0, 1]. Output is 136
/// values, (x, y) pairs normalised to the crop.
pub struct FaceLandmarker;

impl FaceLandmarker {
    pub fn run(&self, model: &Model, img: &RgbaImage, face: &Rect) -> Result<Vec<Point>> {
        let span = span!(Level::DEBUG, "face_landmarker");
        let _guard = span.enter();

        let (arr, crop) = crop_to_array(
            img,
            &face.pad(CROP_PADDING),
            WIDTH,
            HEIGHT,
            OutputRange::ZeroToOne,
        )?;
        let input = Tensor::from_array(arr)?;
        let outputs = model
            .session
            .run(ort::inputs![model.input.as_str() => input]?)?;

        extract_points(&extract(&outputs, model.output(0)?)?, &crop)
    }
}

fn extract_points(raw: &[f32], crop: &Rect) -> Result<Vec<Point>> {
    if raw.len() < NUM_POINTS * 2 {
        return Err(Error::msg(format!(
            "expected {} landmark values, got {}",
            NUM_POINTS * 2,
            raw.len()
        )));
    }

    Ok(raw
        .chunks_exact(2)
        .take(NUM_POINTS)
        .map(|xy| Point::new(crop.x + xy[0] * crop.w, crop.y + xy[1] * crop.h))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_extract_points_maps_into_crop() {
        let mut raw = vec![0.5; NUM_POINTS * 2];
        raw[0] = 0.;
        raw[1] = 1.;
        let crop = Rect::new(100., 50., 200., 100.);

        let points = extract_points(&raw, &crop).unwrap();
        assert_eq!(points.len(), NUM_POINTS);
        assert_relative_eq!(points[0].x, 100.);
        assert_relative_eq!(points[0].y, 150.);
        assert_relative_eq!(points[1].x, 200.);
        assert_relative_eq!(points[1].y, 100.);
    }

    #[test]
    fn test_extract_points_short_output() {
        assert!(extract_points(&[0.; 10], &Rect::new(0., 0., 1., 1.)).is_err());
    }
}
