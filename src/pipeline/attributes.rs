use super::landmarks::CROP_PADDING;
use super::model::Model;
use super::tensor::{crop_to_array, extract, softmax, OutputRange};
use crate::detection::Expressions;
use crate::shapes::Rect;
use anyhow::{Error, Result};
use image::RgbaImage;
use ndarray::Array4;
use ort::value::Tensor;
use tracing::{span, Level};

const WIDTH: u32 = 112;
const HEIGHT: u32 = 112;

/// Expression classifier output order.
pub const EXPRESSIONS: [&str; 7] = [
    "neutral",
    "happy",
    "sad",
    "angry",
    "fearful",
    "disgusted",
    "surprised",
];

#[derive(Debug, Clone, PartialEq)]
pub struct AgeGender {
    pub age: f32,
    pub gender: String,
    pub gender_probability: f32,
}

/// Expression and age/gender classification share one face crop.
pub struct FaceAttributes;

impl FaceAttributes {
    pub fn crop(&self, img: &RgbaImage, face: &Rect) -> Result<Array4<f32>> {
        let (arr, _) = crop_to_array(
            img,
            &face.pad(CROP_PADDING),
            WIDTH,
            HEIGHT,
            OutputRange::ZeroToOne,
        )?;
        Ok(arr)
    }

    pub fn expressions(&self, model: &Model, crop: &Array4<f32>) -> Result<Expressions> {
        let span = span!(Level::DEBUG, "face_expression");
        let _guard = span.enter();

        let input = Tensor::from_array(crop.clone())?;
        let outputs = model
            .session
            .run(ort::inputs![model.input.as_str() => input]?)?;

        to_expressions(&extract(&outputs, model.output(0)?)?)
    }

    /// Model outputs: `age` (1 value, years) then gender logits `[male, female]`.
    pub fn age_gender(&self, model: &Model, crop: &Array4<f32>) -> Result<AgeGender> {
        let span = span!(Level::DEBUG, "age_gender");
        let _guard = span.enter();

        let input = Tensor::from_array(crop.clone())?;
        let outputs = model
            .session
            .run(ort::inputs![model.input.as_str() => input]?)?;

        let age = extract(&outputs, model.output(0)?)?;
        let gender = extract(&outputs, model.output(1)?)?;
        to_age_gender(&age, &gender)
    }
}

fn to_expressions(logits: &[f32]) -> Result<Expressions> {
    if logits.len() != EXPRESSIONS.len() {
        return Err(Error::msg(format!(
            "expected {} expression scores, got {}",
            EXPRESSIONS.len(),
            logits.len()
        )));
    }

    Ok(EXPRESSIONS
        .iter()
        .copied()
        .zip(softmax(logits))
        .collect())
}

fn to_age_gender(age: &[f32], gender_logits: &[f32]) -> Result<AgeGender> {
    let age = *age
        .first()
        .ok_or_else(|| Error::msg("age output is empty"))?;
    if gender_logits.len() != 2 {
        return Err(Error::msg(format!(
            "expected 2 gender scores, got {}",
            gender_logits.len()
        )));
    }

    let probs = softmax(gender_logits);
    let (gender, gender_probability) = if probs[0] >= probs[1] {
        ("male", probs[0])
    } else {
        ("female", probs[1])
    };

    Ok(AgeGender {
        age: age.max(0.),
        gender: gender.to_string(),
        gender_probability,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_to_expressions_order_and_softmax() {
        let e = to_expressions(&[0., 3., 0., 0., 0., 0., 0.]).unwrap();
        let names: Vec<&str> = e.iter().map(|(n, _)| n).collect();
        assert_eq!(names, EXPRESSIONS.to_vec());
        assert_eq!(e.dominant().map(|(n, _)| n), Some("happy"));

        let total: f32 = e.iter().map(|(_, p)| p).sum();
        assert_relative_eq!(total, 1., epsilon = 1e-5);
    }

    #[test]
    fn test_to_expressions_wrong_len() {
        assert!(to_expressions(&[1., 2.]).is_err());
    }

    #[test]
    fn test_to_age_gender() {
        let ag = to_age_gender(&[31.4], &[0.2, 1.5]).unwrap();
        assert_relative_eq!(ag.age, 31.4);
        assert_eq!(ag.gender, "female");
        assert!(ag.gender_probability > 0.5);

        let ag = to_age_gender(&[-2.], &[1., 1.]).unwrap();
        assert_eq!(ag.age, 0.);
        assert_eq!(ag.gender, "male");
    }

    #[test]
    fn test_to_age_gender_bad_outputs() {
        assert!(to_age_gender(&[], &[0., 1.]).is_err());
        assert!(to_age_gender(&[20.], &[0.]).is_err());
    }
}
