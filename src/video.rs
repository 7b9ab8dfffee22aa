use anyhow::{Context, Error, Result};
use image::{EncodableLayout, RgbaImage};
use std::io::Write;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tokio::sync::watch;
use tracing::{debug, error, info, info_span, warn};

use nokhwa::{
    nokhwa_initialize,
    pixel_format::RgbAFormat,
    query,
    utils::{ApiBackend, CameraIndex, RequestedFormat, RequestedFormatType},
    Camera,
};

use crate::detection::{DisplaySize, Resolution};
use crate::session::Frame;

#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackEvent {
    /// First frame decoded at this native resolution.
    Started(Resolution),
    /// The stream stopped producing frames.
    Ended,
    /// The camera could not be opened.
    Failed(String),
}

pub fn create_input_stream(index: Option<u32>, fps: u32) -> Result<Camera> {
    nokhwa_initialize(|granted| {
        debug!("User said {}", granted);
    });

    let cameras = query(ApiBackend::Auto).context("failed to enumerate cameras")?;
    cameras
        .iter()
        .for_each(|cam| debug!("Found camera: {:?}", cam));

    let index = match index {
        Some(i) => CameraIndex::Index(i),
        None => cameras
            .last()
            .map(|c| c.index().clone())
            .ok_or_else(|| Error::msg("no camera found"))?,
    };

    // video only, audio is never requested
    let mut camera = Camera::new(
        index.clone(),
        RequestedFormat::new::<RgbAFormat>(RequestedFormatType::AbsoluteHighestFrameRate),
    )
    .with_context(|| format!("failed to open camera {index}"))?;

    if let Err(e) = camera.set_frame_rate(fps) {
        warn!("Could not set camera frame rate to {fps}: {e}");
    }
    camera
        .open_stream()
        .with_context(|| format!("failed to start stream on camera {index}"))?;

    Ok(camera)
}

/// Captures on a dedicated thread and publishes the latest frame.
pub struct CameraSource {
    stop: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl CameraSource {
    pub fn spawn(
        index: Option<u32>,
        fps: u32,
        frames: watch::Sender<Option<Frame>>,
        events: flume::Sender<PlaybackEvent>,
    ) -> Result<CameraSource> {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let thread = thread::Builder::new()
            .name("camera".into())
            .spawn(move || capture(index, fps, frames, events, thread_stop))
            .context("failed to spawn camera thread")?;

        Ok(CameraSource {
            stop,
            thread: Some(thread),
        })
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Camera thread panicked");
            }
        }
    }
}

impl Drop for CameraSource {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn capture(
    index: Option<u32>,
    fps: u32,
    frames: watch::Sender<Option<Frame>>,
    events: flume::Sender<PlaybackEvent>,
    stop: Arc<AtomicBool>,
) {
    let span = info_span!("camera");
    let _guard = span.enter();

    let mut camera = match create_input_stream(index, fps) {
        Ok(camera) => camera,
        Err(e) => {
            let _ = events.send(PlaybackEvent::Failed(format!("{e:#}")));
            return;
        }
    };
    info!("Streaming from {}", camera.info().human_name());

    let mut started = false;
    let mut last_event = None;
    while !stop.load(Ordering::Relaxed) && !frames.is_closed() {
        let frame = match camera.frame() {
            Ok(frame) => frame,
            Err(e) => {
                error!("Failed to pull frame from webcam: {e:?}");
                last_event = Some(frame_error_event(started, &e));
                break;
            }
        };

        let img: RgbaImage = match frame.decode_image::<RgbAFormat>() {
            Ok(img) => img,
            Err(e) => {
                warn!("Failed to decode frame: {e:?}");
                continue;
            }
        };

        let resolution = Resolution::of(&img);
        frames.send_replace(Some(Arc::new(img)));
        if !started {
            started = true;
            let _ = events.send(PlaybackEvent::Started(resolution));
        }
    }

    match last_event {
        Some(event) => {
            let _ = events.send(event);
        }
        None if started => {
            let _ = events.send(PlaybackEvent::Ended);
        }
        None => {}
    }
    if let Err(e) = camera.stop_stream() {
        warn!("Failed to stop camera stream: {e:?}");
    }
}

/// A frame error before the first frame means the camera never worked.
fn frame_error_event(started: bool, err: &impl std::fmt::Display) -> PlaybackEvent {
    if started {
        PlaybackEvent::Ended
    } else {
        PlaybackEvent::Failed(format!("no frames from camera: {err}"))
    }
}

pub struct OutputVideoStream {
    output_proc: std::process::Child,
}

impl Drop for OutputVideoStream {
    fn drop(&mut self) {
        if let Err(e) = self.output_proc.kill() {
            error!("Failed to stop output process {e:?}");
        }
    }
}

impl OutputVideoStream {
    pub fn new(size: DisplaySize, device: Option<String>) -> Result<Self> {
        let (width, height) = (size.width, size.height);
        let mut command = match device {
            Some(d) => {
                let mut command = Command::new("ffmpeg");
                command.args([
                    "-f",
                    "rawvideo",
                    "-pix_fmt",
                    "rgba",
                    "-s",
                    &format!("{}x{}", width, height),
                    "-i",
                    "-",
                    "-map",
                    "0:v",
                    "-preset",
                    "fast",
                    "-vf",
                    "format=yuv420p",
                    "-f",
                    "v4l2",
                    &format!("/dev/{d}"),
                ]);
                command
            }
            None => {
                let mut command = Command::new("ffplay");
                command.args([
                    "-f",
                    "rawvideo",
                    "-pixel_format",
                    "rgba",
                    "-video_size",
                    &format!("{}x{}", width, height),
                    "-window_title",
                    "facemood",
                    "-fflags",
                    "nobuffer",
                    "-flags",
                    "low_delay",
                    "-",
                ]);
                command
            }
        };
        let output_proc = command
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .spawn()
            .context("failed to start output process")?;

        Ok(Self { output_proc })
    }

    pub fn write_frame(&mut self, img: &RgbaImage) -> Result<()> {
        if let Some(stdin) = self.output_proc.stdin.as_mut() {
            stdin.write_all(img.as_bytes())?;
        }

        Ok(())
    }
}
