use anyhow::{Context, Error, Result};
use image::imageops::{self, FilterType};
use image::RgbaImage;
use std::cell::RefCell;
use std::rc::Rc;
use std::thread;
use tracing::{error, span, trace, Level};

use crate::detection::DisplaySize;
use crate::overlay::SurfaceHost;
use crate::session::FrameReceiver;
use crate::video::OutputVideoStream;

/// The frame as the user sees it: stretched to `display` with the mounted overlay on top.
pub fn compose(frame: &RgbaImage, host: &SurfaceHost, display: DisplaySize) -> RgbaImage {
    match host.current() {
        Some(surface) => surface.composite(frame),
        None if frame.dimensions() == (display.width, display.height) => frame.clone(),
        None => imageops::resize(frame, display.width, display.height, FilterType::Triangle),
    }
}

/// Hands composed frames to a writer thread that owns the output process.
pub struct Presenter {
    tx: Option<flume::Sender<RgbaImage>>,
    writer: Option<thread::JoinHandle<()>>,
}

impl Presenter {
    pub fn spawn(display: DisplaySize, device: Option<String>) -> Result<Presenter> {
        let mut output = OutputVideoStream::new(display, device)?;
        let (tx, rx) = flume::bounded::<RgbaImage>(1);

        let writer = thread::Builder::new()
            .name("present".into())
            .spawn(move || {
                for img in rx.iter() {
                    if let Err(e) = output.write_frame(&img) {
                        error!("Failed to render frame: {e:?}");
                        break;
                    }
                }
            })
            .context("failed to spawn output thread")?;

        Ok(Presenter {
            tx: Some(tx),
            writer: Some(writer),
        })
    }

    /// Queue `img` for display. A busy writer means the frame is dropped.
    pub fn submit(&self, img: RgbaImage) -> Result<()> {
        let Some(tx) = &self.tx else {
            return Err(Error::msg("output closed"));
        };
        match tx.try_send(img) {
            Ok(()) => Ok(()),
            Err(flume::TrySendError::Full(_)) => {
                trace!("Output busy, dropping frame");
                Ok(())
            }
            Err(flume::TrySendError::Disconnected(_)) => Err(Error::msg("output closed")),
        }
    }
}

impl Drop for Presenter {
    fn drop(&mut self) {
        // closing the channel ends the writer loop
        drop(self.tx.take());
        if let Some(writer) = self.writer.take() {
            let _ = writer.join();
        }
    }
}

/// Present every new camera frame until the camera or the output goes away.
pub async fn run(
    mut frames: FrameReceiver,
    host: Rc<RefCell<SurfaceHost>>,
    presenter: Presenter,
    display: DisplaySize,
) {
    while frames.changed().await.is_ok() {
        let Some(frame) = frames.borrow_and_update().clone() else {
            continue;
        };

        let composed = {
            let span = span!(Level::TRACE, "present");
            let _guard = span.enter();
            compose(&frame, &host.borrow(), display)
        };

        if let Err(e) = presenter.submit(composed) {
            error!("Stopping presentation: {e:?}");
            break;
        }
    }
}
