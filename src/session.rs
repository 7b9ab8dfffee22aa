//! The detection loop.
//!
//! A [`Session`] sits idle until playback starts. Each playback start bumps
//! the session generation, mounts a fresh overlay surface and starts a polling
//! task that dispatches one detection per tick. Detection tasks carry the
//! generation they were dispatched under and only draw if it is still current.
//!
//! Everything here runs on one thread inside a [`tokio::task::LocalSet`].

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use image::RgbaImage;
use tokio::sync::watch;
use tokio::task::{self, JoinHandle};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, debug_span, info, info_span, trace, warn, Instrument};

use crate::detection::{resize_results, DisplaySize, Resolution};
use crate::overlay::{OverlaySurface, SurfaceHost, SurfaceId};
use crate::pipeline::{DetectorOptions, InferenceProvider};
use crate::render::Renderer;

pub type Frame = Arc<RgbaImage>;

/// Latest frame published by the camera, `None` until the first one arrives.
pub type FrameReceiver = watch::Receiver<Option<Frame>>;

/// What to do with a tick that fires while a detection is still running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TickPolicy {
    /// Don't dispatch. At most one detection is in flight per playback cycle.
    #[default]
    SkipWhileBusy,
    /// Dispatch anyway. Results that finish after a newer one are dropped.
    Overlap,
}

#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub period: Duration,
    pub display: DisplaySize,
    pub policy: TickPolicy,
    pub detector: DetectorOptions,
}

impl Default for LoopSettings {
    fn default() -> Self {
        LoopSettings {
            period: Duration::from_millis(100),
            display: DisplaySize::new(720, 560),
            policy: TickPolicy::default(),
            detector: DetectorOptions::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Running { generation: u64 },
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LoopStats {
    pub dispatched: u64,
    pub drawn: u64,
    pub failed: u64,
    pub dropped_stale: u64,
    pub skipped_busy: u64,
}

/// The repeating timer of one playback cycle. Dropping it stops the timer.
pub struct PollingHandle {
    generation: u64,
    task: JoinHandle<()>,
}

impl PollingHandle {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn cancel(self) {
        debug!("Invalidating polling for generation {}", self.generation);
    }
}

impl Drop for PollingHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct Shared<P> {
    provider: P,
    frames: FrameReceiver,
    host: Rc<RefCell<SurfaceHost>>,
    renderer: Renderer,
    settings: LoopSettings,
    generation: Cell<u64>,
    stats: Cell<LoopStats>,
}

impl<P> Shared<P> {
    fn count(&self, f: impl FnOnce(&mut LoopStats)) {
        let mut stats = self.stats.get();
        f(&mut stats);
        self.stats.set(stats);
    }
}

/// Per playback cycle bookkeeping.
struct Cycle {
    generation: u64,
    surface: SurfaceId,
    in_flight: Cell<usize>,
    last_drawn: Cell<u64>,
}

struct InFlight(Rc<Cycle>);

impl InFlight {
    fn start(cycle: &Rc<Cycle>) -> InFlight {
        cycle.in_flight.set(cycle.in_flight.get() + 1);
        InFlight(Rc::clone(cycle))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.in_flight.set(self.0.in_flight.get().saturating_sub(1));
    }
}

pub struct Session<P> {
    shared: Rc<Shared<P>>,
    polling: Option<PollingHandle>,
    state: LoopState,
}

impl<P: InferenceProvider + 'static> Session<P> {
    pub fn new(
        provider: P,
        frames: FrameReceiver,
        host: Rc<RefCell<SurfaceHost>>,
        renderer: Renderer,
        settings: LoopSettings,
    ) -> Session<P> {
        Session {
            shared: Rc::new(Shared {
                provider,
                frames,
                host,
                renderer,
                settings,
                generation: Cell::new(0),
                stats: Cell::new(LoopStats::default()),
            }),
            polling: None,
            state: LoopState::Idle,
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.shared.generation.get()
    }

    pub fn stats(&self) -> LoopStats {
        self.shared.stats.get()
    }

    pub fn polling_generation(&self) -> Option<u64> {
        self.polling.as_ref().map(|p| p.generation())
    }

    pub fn host(&self) -> Rc<RefCell<SurfaceHost>> {
        Rc::clone(&self.shared.host)
    }

    /// React to playback (re)starting at `native` resolution.
    ///
    /// Returns the mounted surface, or `None` once the session has been torn down.
    /// Must be called from within a `LocalSet`.
    pub fn on_playback_started(&mut self, native: Resolution) -> Option<SurfaceId> {
        if self.state == LoopState::Stopped {
            warn!("Playback started after teardown, ignoring");
            return None;
        }

        // the old timer goes before anything new exists
        if let Some(prev) = self.polling.take() {
            prev.cancel();
        }

        let generation = self.shared.generation.get() + 1;
        self.shared.generation.set(generation);

        let mut surface = OverlaySurface::from_media(SurfaceId(generation), native);
        surface.match_dimensions(self.shared.settings.display);
        let id = self.shared.host.borrow_mut().mount(surface);

        let cycle = Rc::new(Cycle {
            generation,
            surface: id,
            in_flight: Cell::new(0),
            last_drawn: Cell::new(0),
        });
        let task = task::spawn_local(
            poll(Rc::clone(&self.shared), cycle).instrument(info_span!("playback", generation)),
        );
        self.polling = Some(PollingHandle { generation, task });
        self.state = LoopState::Running { generation };

        info!(
            "Playback started at {}x{}, drawing at {}x{} every {:?}",
            native.width,
            native.height,
            self.shared.settings.display.width,
            self.shared.settings.display.height,
            self.shared.settings.period
        );

        Some(id)
    }

    /// Stop polling and unmount the surface. Detections still in flight finish
    /// but their results are discarded.
    pub fn teardown(&mut self) {
        if self.state == LoopState::Stopped {
            return;
        }

        if let Some(polling) = self.polling.take() {
            polling.cancel();
        }
        self.shared.generation.set(self.shared.generation.get() + 1);
        self.shared.host.borrow_mut().unmount();
        self.state = LoopState::Stopped;

        info!("Detection loop stopped: {:?}", self.stats());
    }
}

async fn poll<P: InferenceProvider + 'static>(shared: Rc<Shared<P>>, cycle: Rc<Cycle>) {
    let mut interval = time::interval(shared.settings.period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut seq = 0;
    loop {
        interval.tick().await;

        if shared.generation.get() != cycle.generation {
            break;
        }

        if shared.settings.policy == TickPolicy::SkipWhileBusy && cycle.in_flight.get() > 0 {
            trace!("Detection still in flight, skipping tick");
            shared.count(|s| s.skipped_busy += 1);
            continue;
        }

        let Some(frame) = shared.frames.borrow().clone() else {
            trace!("No frame yet, skipping tick");
            continue;
        };

        seq += 1;
        shared.count(|s| s.dispatched += 1);
        let in_flight = InFlight::start(&cycle);
        task::spawn_local(
            detect_and_draw(Rc::clone(&shared), in_flight, frame, seq)
                .instrument(debug_span!("tick", seq)),
        );
    }
}

async fn detect_and_draw<P: InferenceProvider>(
    shared: Rc<Shared<P>>,
    in_flight: InFlight,
    frame: Frame,
    seq: u64,
) {
    let result = shared
        .provider
        .detect(Arc::clone(&frame), shared.settings.detector)
        .await;
    let cycle = Rc::clone(&in_flight.0);
    drop(in_flight);

    let records = match result {
        Ok(records) => records,
        Err(e) => {
            warn!("Detection failed: {e:?}");
            shared.count(|s| s.failed += 1);
            return;
        }
    };

    let current = shared.generation.get();
    if current != cycle.generation {
        debug!(
            "Dropping result dispatched under generation {} (now {current})",
            cycle.generation
        );
        shared.count(|s| s.dropped_stale += 1);
        return;
    }

    if seq <= cycle.last_drawn.get() {
        debug!(
            "Dropping tick {seq}, tick {} already drawn",
            cycle.last_drawn.get()
        );
        shared.count(|s| s.dropped_stale += 1);
        return;
    }

    let mut host = shared.host.borrow_mut();
    let Some(surface) = host.active_mut(cycle.surface) else {
        debug!("Surface {:?} no longer mounted", cycle.surface);
        shared.count(|s| s.dropped_stale += 1);
        return;
    };

    let resized = resize_results(&records, Resolution::of(&frame), shared.settings.display);
    surface.clear();
    shared.renderer.draw(surface, &resized);

    cycle.last_drawn.set(seq);
    shared.count(|s| s.drawn += 1);
    trace!("Drew {} faces", resized.len());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::DetectionRecord;
    use crate::render::RenderStyle;
    use anyhow::Result;
    use tokio::task::LocalSet;

    struct Slow {
        delay: Duration,
        calls: Rc<Cell<usize>>,
    }

    impl InferenceProvider for Slow {
        async fn detect(
            &self,
            _frame: Arc<RgbaImage>,
            _options: DetectorOptions,
        ) -> Result<Vec<DetectionRecord>> {
            self.calls.set(self.calls.get() + 1);
            time::sleep(self.delay).await;
            Ok(Vec::new())
        }
    }

    fn session(delay: Duration, policy: TickPolicy) -> (Session<Slow>, Rc<Cell<usize>>) {
        let calls = Rc::new(Cell::new(0));
        let (_tx, rx) = watch::channel(Some(Arc::new(RgbaImage::new(64, 48))));
        let settings = LoopSettings {
            policy,
            ..Default::default()
        };
        let session = Session::new(
            Slow {
                delay,
                calls: Rc::clone(&calls),
            },
            rx,
            Rc::new(RefCell::new(SurfaceHost::new())),
            Renderer::new(RenderStyle::default(), None),
            settings,
        );
        (session, calls)
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_skip_while_busy() {
        LocalSet::new()
            .run_until(async {
                let (mut s, calls) = session(Duration::from_millis(250), TickPolicy::SkipWhileBusy);
                s.on_playback_started(Resolution::new(64, 48));
                time::sleep(Duration::from_millis(1000)).await;

                // dispatches at 0, 300, 600, 900
                assert!(calls.get() <= 4, "{} calls", calls.get());
                assert!(s.stats().skipped_busy >= 4);
                s.teardown();
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_overlap_dispatches_every_tick() {
        LocalSet::new()
            .run_until(async {
                let (mut s, calls) = session(Duration::from_millis(250), TickPolicy::Overlap);
                s.on_playback_started(Resolution::new(64, 48));
                time::sleep(Duration::from_millis(1000)).await;

                assert!(calls.get() >= 9, "{} calls", calls.get());
                assert_eq!(s.stats().skipped_busy, 0);
                s.teardown();
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_teardown_is_terminal() {
        LocalSet::new()
            .run_until(async {
                let (mut s, _) = session(Duration::from_millis(10), TickPolicy::default());
                assert_eq!(s.state(), LoopState::Idle);

                s.on_playback_started(Resolution::new(64, 48));
                assert_eq!(s.state(), LoopState::Running { generation: 1 });

                s.teardown();
                assert_eq!(s.state(), LoopState::Stopped);
                assert_eq!(s.polling_generation(), None);
                assert!(s.on_playback_started(Resolution::new(64, 48)).is_none());
                assert!(s.host().borrow().current().is_none());
            })
            .await;
    }
}
