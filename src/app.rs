use anyhow::{Context, Error, Result};
use image::{ImageReader, RgbaImage};
use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio::task;
use tracing::{debug, info, warn};

use crate::config::CmdArgs;
use crate::detection::{resize_results, DisplaySize, Resolution};
use crate::overlay::{OverlaySurface, SurfaceHost, SurfaceId};
use crate::pipeline::{DetectorOptions, InferenceProvider, ModelSet, OnnxProvider};
use crate::present::{self, Presenter};
use crate::render::{RenderStyle, Renderer};
use crate::session::{Frame, Session};
use crate::video::{CameraSource, PlaybackEvent};

fn renderer(font: &Path) -> Renderer {
    let font = match Renderer::load_font(font) {
        Ok(font) => Some(font),
        Err(e) => {
            warn!("Labels disabled: {e:#}");
            None
        }
    };
    Renderer::new(RenderStyle::default(), font)
}

/// Entry point once arguments are parsed. Must run inside a `LocalSet`.
pub async fn run(args: CmdArgs) -> Result<()> {
    args.validate()?;

    let models = ModelSet::load(&args.model_dir, args.threads())
        .await
        .context("Error loading models")?
        .shared();
    let provider = OnnxProvider::new(models);
    let renderer = renderer(&args.font);

    match (&args.input, &args.out.output) {
        (Some(input), Some(output)) => {
            process_image(&provider, &renderer, input, output, args.detector()).await
        }
        _ => run_live(args, provider, renderer).await,
    }
}

async fn run_live(args: CmdArgs, provider: OnnxProvider, renderer: Renderer) -> Result<()> {
    let display = args.display();
    let (frames_tx, frames_rx) = watch::channel::<Option<Frame>>(None);
    let (events_tx, events_rx) = flume::unbounded();
    let host = Rc::new(RefCell::new(SurfaceHost::new()));

    let presenter = Presenter::spawn(display, args.out.device.clone())?;
    let camera = CameraSource::spawn(args.camera, args.fps, frames_tx, events_tx)?;

    let mut session = Session::new(
        provider,
        frames_rx.clone(),
        Rc::clone(&host),
        renderer,
        args.loop_settings(),
    );
    let presenting = task::spawn_local(present::run(frames_rx, host, presenter, display));

    let result = tokio::select! {
        result = follow_playback(&events_rx, &mut session) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, shutting down");
            Ok(())
        }
    };

    session.teardown();
    presenting.abort();
    let _ = presenting.await;
    camera.stop();

    result
}

/// Drive `session` from camera events until the stream ends or fails.
pub async fn follow_playback<P: InferenceProvider + 'static>(
    events: &flume::Receiver<PlaybackEvent>,
    session: &mut Session<P>,
) -> Result<()> {
    loop {
        match events.recv_async().await {
            Ok(PlaybackEvent::Started(native)) => {
                session.on_playback_started(native);
            }
            Ok(PlaybackEvent::Ended) => {
                info!("Camera stream ended");
                return Ok(());
            }
            Ok(PlaybackEvent::Failed(msg)) => {
                return Err(Error::msg(format!("Error accessing webcam: {msg}")));
            }
            Err(_) => return Err(Error::msg("Error accessing webcam: camera thread exited")),
        }
    }
}

/// Detect faces in one image and draw them at its native size.
pub async fn annotate<P: InferenceProvider>(
    provider: &P,
    renderer: &Renderer,
    img: RgbaImage,
    detector: DetectorOptions,
) -> Result<RgbaImage> {
    let native = Resolution::of(&img);
    let frame = Arc::new(img);

    let start = Instant::now();
    let records = provider.detect(Arc::clone(&frame), detector).await?;
    debug!("Detected {} faces in {:?}", records.len(), start.elapsed());

    let display = DisplaySize::from(native);
    let mut surface = OverlaySurface::from_media(SurfaceId(0), native);
    surface.match_dimensions(display);
    renderer.draw(&mut surface, &resize_results(&records, native, display));

    Ok(surface.composite(&frame))
}

async fn process_image<P: InferenceProvider>(
    provider: &P,
    renderer: &Renderer,
    input: &Path,
    output: &Path,
    detector: DetectorOptions,
) -> Result<()> {
    let img = ImageReader::open(input)
        .with_context(|| format!("failed to open {}", input.display()))?
        .decode()?
        .into_rgba8();

    let result = annotate(provider, renderer, img, detector).await?;
    result
        .save(output)
        .with_context(|| format!("failed to write {}", output.display()))?;
    info!("Result at {}", output.display());

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::tests::record;
    use crate::detection::DetectionRecord;
    use crate::session::{LoopSettings, LoopState};
    use crate::shapes::Rect;
    use image::Rgba;
    use tokio::task::LocalSet;

    struct Fixed(Vec<DetectionRecord>);

    impl InferenceProvider for Fixed {
        async fn detect(
            &self,
            _frame: Arc<RgbaImage>,
            _options: DetectorOptions,
        ) -> Result<Vec<DetectionRecord>> {
            Ok(self.0.clone())
        }
    }

    struct Broken;

    impl InferenceProvider for Broken {
        async fn detect(
            &self,
            _frame: Arc<RgbaImage>,
            _options: DetectorOptions,
        ) -> Result<Vec<DetectionRecord>> {
            Err(Error::msg("no backend"))
        }
    }

    fn idle_session() -> Session<Fixed> {
        let (_tx, rx) = watch::channel(Some(Arc::new(RgbaImage::new(64, 48))));
        Session::new(
            Fixed(Vec::new()),
            rx,
            Rc::new(RefCell::new(SurfaceHost::new())),
            Renderer::new(RenderStyle::default(), None),
            LoopSettings::default(),
        )
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_started_event_runs_session() {
        LocalSet::new()
            .run_until(async {
                let mut session = idle_session();
                let (tx, rx) = flume::unbounded();
                tx.send(PlaybackEvent::Started(Resolution::new(64, 48))).unwrap();
                tx.send(PlaybackEvent::Ended).unwrap();

                follow_playback(&rx, &mut session).await.unwrap();
                assert_eq!(session.state(), LoopState::Running { generation: 1 });
                session.teardown();
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_failed_event_is_an_error() {
        LocalSet::new()
            .run_until(async {
                let mut session = idle_session();
                let (tx, rx) = flume::unbounded();
                tx.send(PlaybackEvent::Failed("permission denied".into()))
                    .unwrap();

                let err = follow_playback(&rx, &mut session).await.unwrap_err();
                assert!(
                    err.to_string().contains("Error accessing webcam"),
                    "{err}"
                );
                assert_eq!(session.state(), LoopState::Idle);
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_camera_thread_gone_is_an_error() {
        LocalSet::new()
            .run_until(async {
                let mut session = idle_session();
                let (tx, rx) = flume::unbounded::<PlaybackEvent>();
                drop(tx);

                let err = follow_playback(&rx, &mut session).await.unwrap_err();
                assert!(err.to_string().contains("camera thread exited"), "{err}");
            })
            .await;
    }

    #[tokio::test]
    async fn test_annotate_draws_at_native_size() {
        let provider = Fixed(vec![record(Rect::new(20., 20., 40., 40.), &[("happy", 0.9)])]);
        let renderer = Renderer::new(RenderStyle::default(), None);
        let img = RgbaImage::from_pixel(100, 80, Rgba([10, 10, 10, 255]));

        let out = annotate(&provider, &renderer, img, DetectorOptions::default())
            .await
            .unwrap();

        assert_eq!(out.dimensions(), (100, 80));
        assert_eq!(*out.get_pixel(20, 40), RenderStyle::default().label_color);
        assert_eq!(*out.get_pixel(40, 40), Rgba([10, 10, 10, 255]));
    }

    #[tokio::test]
    async fn test_annotate_propagates_failure() {
        let renderer = Renderer::new(RenderStyle::default(), None);
        let img = RgbaImage::new(10, 10);
        assert!(annotate(&Broken, &renderer, img, DetectorOptions::default())
            .await
            .is_err());
    }
}
