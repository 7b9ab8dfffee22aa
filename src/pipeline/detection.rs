use super::model::Model;
use super::tensor::{extract, image_to_array, sigmoid_stable, OutputRange};
use crate::shapes::{Point, Rect};
use anchors::{gen_anchors, NUM_ANCHORS};
use anyhow::{Error, Result};
use image::RgbaImage;
use ort::value::Tensor;
use tracing::{span, trace, Level};

mod anchors;

const WIDTH: u32 = 128;
const HEIGHT: u32 = 128;
const REGRESSOR_LEN: usize = 16;

/// Detector variant configuration. Lower thresholds trade precision for recall.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectorOptions {
    pub score_threshold: f32,
    pub iou_threshold: f32,
}

impl Default for DetectorOptions {
    fn default() -> Self {
        DetectorOptions {
            score_threshold: 0.5,
            iou_threshold: 0.3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FaceBound {
    pub bounds: Rect,
    pub confidence: f32,
}

pub struct FaceDetector {
    anchors: Vec<Point>,
}

impl FaceDetector {
    /*
    BlazeFace short range, exported to ONNX.

    Model Input: 1x128x128x3 f32 image in [-1, 1]
    Model Output:
    - regressors: 1x896x16. The first 4 values are center offsets and
      width/height in input pixels relative to the anchor at that index,
      the remaining 12 are 6 keypoints (unused here).
    - classificators: 1x896x1 raw scores, sigmoid gives confidence.
     */
    pub fn new() -> FaceDetector {
        FaceDetector {
            anchors: gen_anchors(WIDTH),
        }
    }

    pub fn run(
        &self,
        model: &Model,
        img: &RgbaImage,
        options: &DetectorOptions,
    ) -> Result<Vec<FaceBound>> {
        let span = span!(Level::DEBUG, "face_detector");
        let _guard = span.enter();

        let input = Tensor::from_array(image_to_array(img, WIDTH, HEIGHT, OutputRange::NegOneToOne))?;
        let outputs = model
            .session
            .run(ort::inputs![model.input.as_str() => input]?)?;

        let regressors = extract(&outputs, model.output(0)?)?;
        let scores = extract(&outputs, model.output(1)?)?;

        self.extract_results(&regressors, &scores, img.width(), img.height(), options)
    }

    fn extract_results(
        &self,
        regressors: &[f32],
        scores: &[f32],
        input_width: u32,
        input_height: u32,
        options: &DetectorOptions,
    ) -> Result<Vec<FaceBound>> {
        if scores.len() < NUM_ANCHORS || regressors.len() < NUM_ANCHORS * REGRESSOR_LEN {
            return Err(Error::msg(format!(
                "unexpected detector output sizes: {} scores, {} regressors",
                scores.len(),
                regressors.len()
            )));
        }

        let mut candidates: Vec<FaceBound> = Vec::new();
        for (idx, anchor) in self.anchors.iter().enumerate() {
            let score = sigmoid_stable(scores[idx]);
            if score < options.score_threshold {
                continue;
            }

            let res = &regressors[idx * REGRESSOR_LEN..];
            let xc = anchor.x + res[0] / WIDTH as f32;
            let yc = anchor.y + res[1] / HEIGHT as f32;
            let w = res[2] / WIDTH as f32;
            let h = res[3] / HEIGHT as f32;

            let bounds = Rect::from_center(xc, yc, w, h)
                .scale(input_width as f32, input_height as f32)
                .clamp(input_width, input_height);
            if bounds.area() <= 0. {
                continue;
            }

            candidates.push(FaceBound {
                bounds,
                confidence: score,
            });
        }

        let results = suppress(candidates, options.iou_threshold);
        trace!("Detected {} faces", results.len());

        Ok(results)
    }
}

impl Default for FaceDetector {
    fn default() -> Self {
        FaceDetector::new()
    }
}

/// Greedy non-max suppression, highest confidence first.
fn suppress(mut candidates: Vec<FaceBound>, iou_threshold: f32) -> Vec<FaceBound> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept: Vec<FaceBound> = Vec::new();
    for c in candidates {
        let overlaps = kept
            .iter()
            .any(|k| k.bounds.overlap_pct(&c.bounds) > iou_threshold * 100.);
        if !overlaps {
            kept.push(c);
        }
    }

    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn bound(x: f32, y: f32, size: f32, confidence: f32) -> FaceBound {
        FaceBound {
            bounds: Rect::new(x, y, size, size),
            confidence,
        }
    }

    #[test]
    fn test_suppress_overlapping() {
        let kept = suppress(
            vec![
                bound(5., 5., 100., 0.7),
                bound(0., 0., 100., 0.9),
                bound(300., 300., 50., 0.6),
            ],
            0.3,
        );
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].confidence, 0.9);
        assert_eq!(kept[1].confidence, 0.6);
    }

    #[test]
    fn test_extract_results_decodes_single_anchor() {
        let detector = FaceDetector::new();
        let mut scores = vec![-20.; NUM_ANCHORS];
        let mut regressors = vec![0.; NUM_ANCHORS * REGRESSOR_LEN];

        // first coarse anchor sits at (0.0625, 0.0625)
        let idx = 16 * 16 * 2;
        scores[idx] = 5.;
        regressors[idx * REGRESSOR_LEN] = 8.; // +1/16 of the input
        regressors[idx * REGRESSOR_LEN + 1] = 8.;
        regressors[idx * REGRESSOR_LEN + 2] = 32.;
        regressors[idx * REGRESSOR_LEN + 3] = 32.;

        let faces = detector
            .extract_results(&regressors, &scores, 640, 480, &DetectorOptions::default())
            .unwrap();

        assert_eq!(faces.len(), 1);
        let b = faces[0].bounds;
        // center (0.125, 0.125), size 0.25 of the frame
        assert_relative_eq!(b.x, 0., epsilon = 1e-3);
        assert_relative_eq!(b.y, 0., epsilon = 1e-3);
        assert_relative_eq!(b.w, 160., epsilon = 1e-3);
        assert_relative_eq!(b.h, 120., epsilon = 1e-3);
        assert!(faces[0].confidence > 0.99);
    }

    #[test]
    fn test_extract_results_respects_threshold() {
        let detector = FaceDetector::new();
        let scores = vec![0.; NUM_ANCHORS]; // sigmoid(0) = 0.5
        let regressors = vec![10.; NUM_ANCHORS * REGRESSOR_LEN];

        let strict = DetectorOptions {
            score_threshold: 0.6,
            ..Default::default()
        };
        let faces = detector
            .extract_results(&regressors, &scores, 128, 128, &strict)
            .unwrap();
        assert!(faces.is_empty());
    }

    #[test]
    fn test_extract_results_rejects_short_output() {
        let detector = FaceDetector::new();
        let res = detector.extract_results(&[0.; 4], &[0.; 4], 10, 10, &Default::default());
        assert!(res.is_err());
    }
}
