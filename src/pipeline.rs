use anyhow::{Context, Result};
use image::RgbaImage;
use std::future::Future;
use std::sync::Arc;
use tracing::{span, trace, Level};

use crate::detection::DetectionRecord;
use attributes::FaceAttributes;
use detection::FaceDetector;
use landmarks::FaceLandmarker;

pub use detection::DetectorOptions;
pub use model::ModelSet;

mod attributes;
mod detection;
mod landmarks;
pub mod model;
mod tensor;

/// Anything that turns a video frame into face detections.
///
/// Calls may take longer than a polling period and several may be in flight
/// at once, so implementations must not assume exclusive access.
pub trait InferenceProvider {
    fn detect(
        &self,
        frame: Arc<RgbaImage>,
        options: DetectorOptions,
    ) -> impl Future<Output = Result<Vec<DetectionRecord>>>;
}

pub struct Pipeline {
    models: Arc<ModelSet>,
    face_detector: FaceDetector,
    face_landmarker: FaceLandmarker,
    face_attributes: FaceAttributes,
}

impl Pipeline {
    pub fn new(models: Arc<ModelSet>) -> Pipeline {
        Pipeline {
            models,
            face_detector: FaceDetector::new(),
            face_landmarker: FaceLandmarker,
            face_attributes: FaceAttributes,
        }
    }

    /// Detect faces then landmarks, expressions and age/gender for each one.
    pub fn run(&self, img: &RgbaImage, options: &DetectorOptions) -> Result<Vec<DetectionRecord>> {
        let span = span!(Level::DEBUG, "detect");
        let _guard = span.enter();

        let faces = self.face_detector.run(&self.models.detector, img, options)?;
        let mut records = Vec::with_capacity(faces.len());
        for face in faces {
            trace!("Face bound: {face:?}");

            let landmarks = self
                .face_landmarker
                .run(&self.models.landmarks, img, &face.bounds)?;
            let crop = self.face_attributes.crop(img, &face.bounds)?;
            let expressions = self
                .face_attributes
                .expressions(&self.models.expression, &crop)?;
            let age_gender = self
                .face_attributes
                .age_gender(&self.models.age_gender, &crop)?;

            records.push(DetectionRecord {
                bounding_box: face.bounds,
                score: face.confidence,
                landmarks,
                expressions,
                age: age_gender.age,
                gender: age_gender.gender,
                gender_probability: age_gender.gender_probability,
            });
        }

        Ok(records)
    }
}

/// [`InferenceProvider`] backed by the ONNX models, run on tokio's blocking pool.
#[derive(Clone)]
pub struct OnnxProvider {
    pipeline: Arc<Pipeline>,
}

impl OnnxProvider {
    pub fn new(models: Arc<ModelSet>) -> OnnxProvider {
        OnnxProvider {
            pipeline: Arc::new(Pipeline::new(models)),
        }
    }
}

impl InferenceProvider for OnnxProvider {
    async fn detect(
        &self,
        frame: Arc<RgbaImage>,
        options: DetectorOptions,
    ) -> Result<Vec<DetectionRecord>> {
        let pipeline = Arc::clone(&self.pipeline);
        tokio::task::spawn_blocking(move || pipeline.run(&frame, &options))
            .await
            .context("inference task panicked")?
    }
}
