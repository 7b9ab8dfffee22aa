use anyhow::{Context, Error, Result};
use futures::future::try_join_all;
use ort::execution_providers;
use ort::session::builder::GraphOptimizationLevel;
pub use ort::session::Session;
use std::path::Path;
use std::sync::{Arc, OnceLock};
use tracing::{debug, info, info_span, Instrument};

pub const FACE_DETECTOR: &str = "face_detector.onnx";
pub const FACE_LANDMARK_68: &str = "face_landmark_68.onnx";
pub const FACE_RECOGNITION: &str = "face_recognition.onnx";
pub const FACE_EXPRESSION: &str = "face_expression.onnx";
pub const AGE_GENDER: &str = "age_gender.onnx";

/// A loaded ONNX model plus the tensor names it was exported with.
pub struct Model {
    pub session: Session,
    pub input: String,
    pub outputs: Vec<String>,
}

impl Model {
    pub fn output(&self, idx: usize) -> Result<&str> {
        self.outputs
            .get(idx)
            .map(|s| s.as_str())
            .ok_or_else(|| Error::msg(format!("model has no output #{idx}")))
    }
}

/// Every weight set the inference pipeline needs. Only ever exists fully loaded.
pub struct ModelSet {
    pub detector: Model,
    pub landmarks: Model,
    /// Loaded alongside the others but not used when drawing.
    pub recognition: Model,
    pub expression: Model,
    pub age_gender: Model,
}

impl ModelSet {
    /// Load all weight sets from `dir` concurrently. Any failure fails the whole set.
    pub async fn load(dir: &Path, threads: usize) -> Result<ModelSet> {
        Self::load_inner(dir, threads)
            .instrument(info_span!("load_models"))
            .await
    }

    async fn load_inner(dir: &Path, threads: usize) -> Result<ModelSet> {
        if !dir.is_dir() {
            return Err(Error::msg(format!(
                "model directory {} does not exist",
                dir.display()
            )));
        }

        init_runtime()?;

        let names = [
            FACE_DETECTOR,
            FACE_LANDMARK_68,
            FACE_RECOGNITION,
            FACE_EXPRESSION,
            AGE_GENDER,
        ];
        let loads = names.iter().map(|name| {
            let path = dir.join(name);
            async move {
                tokio::task::spawn_blocking(move || initialize_model(&path, threads))
                    .await
                    .context("model loading task panicked")?
            }
        });

        let mut models = try_join_all(loads).await?.into_iter();
        let mut next = || models.next().ok_or_else(|| Error::msg("missing model"));

        let set = ModelSet {
            detector: next()?,
            landmarks: next()?,
            recognition: next()?,
            expression: next()?,
            age_gender: next()?,
        };
        info!("Loaded {} models from {}", names.len(), dir.display());

        Ok(set)
    }

    pub fn shared(self) -> Arc<ModelSet> {
        Arc::new(self)
    }
}

fn init_runtime() -> Result<()> {
    static INIT: OnceLock<Result<(), String>> = OnceLock::new();
    init_once(&INIT, || {
        ort::init()
            .with_name("facemood")
            .with_execution_providers([execution_providers::XNNPACKExecutionProvider::default()
                .build()])
            .commit()
            .map(|_| ())
            .map_err(Error::from)
    })
}

/// Runs `init` the first time only. Later calls see the same outcome, failures included.
fn init_once(cell: &OnceLock<Result<(), String>>, init: impl FnOnce() -> Result<()>) -> Result<()> {
    cell.get_or_init(|| init().map_err(|e| format!("{e:#}")))
        .clone()
        .map_err(|e| Error::msg(format!("onnx runtime failed to initialize: {e}")))
}

pub fn initialize_model(path: &Path, threads: usize) -> Result<Model> {
    if !path.is_file() {
        return Err(Error::msg(format!(
            "weight set {} not found",
            path.display()
        )));
    }

    let session = Session::builder()?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .with_intra_threads(threads.max(1))?
        .commit_from_file(path)
        .with_context(|| format!("failed to load weight set {}", path.display()))?;

    let input = session
        .inputs
        .first()
        .map(|i| i.name.clone())
        .ok_or_else(|| Error::msg(format!("{} declares no inputs", path.display())))?;
    let outputs: Vec<String> = session.outputs.iter().map(|o| o.name.clone()).collect();
    debug!("{}: input {input:?}, outputs {outputs:?}", path.display());

    Ok(Model {
        session,
        input,
        outputs,
    })
}
