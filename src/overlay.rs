//! The overlay drawing surface and the host it is mounted in.
//!
//! A surface belongs to exactly one playback cycle. When playback (re)starts, a
//! new surface replaces the old one. Anyone holding the old [`SurfaceId`] then
//! finds nothing to draw on.

use image::imageops::{self, FilterType};
use image::{Rgba, RgbaImage};
use tracing::debug;

use crate::detection::{DisplaySize, Resolution};

/// Identifies one mounted surface: the playback generation that created it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SurfaceId(pub u64);

pub const TRANSPARENT: Rgba<u8> = Rgba([0, 0, 0, 0]);

pub struct OverlaySurface {
    id: SurfaceId,
    native: Resolution,
    pixels: RgbaImage,
}

impl OverlaySurface {
    /// A transparent surface at the media's native resolution.
    pub fn from_media(id: SurfaceId, native: Resolution) -> OverlaySurface {
        OverlaySurface {
            id,
            native,
            pixels: RgbaImage::from_pixel(native.width, native.height, TRANSPARENT),
        }
    }

    /// Resize the backing buffer to `display`. Drawn content does not survive.
    pub fn match_dimensions(&mut self, display: DisplaySize) {
        if self.pixels.dimensions() != (display.width, display.height) {
            self.pixels = RgbaImage::from_pixel(display.width, display.height, TRANSPARENT);
        }
    }

    pub fn clear(&mut self) {
        for p in self.pixels.pixels_mut() {
            *p = TRANSPARENT;
        }
    }

    pub fn id(&self) -> SurfaceId {
        self.id
    }

    pub fn native(&self) -> Resolution {
        self.native
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    pub fn pixels(&self) -> &RgbaImage {
        &self.pixels
    }

    pub fn pixels_mut(&mut self) -> &mut RgbaImage {
        &mut self.pixels
    }

    /// Draw this surface over `frame` stretched to the surface size.
    pub fn composite(&self, frame: &RgbaImage) -> RgbaImage {
        let mut out = if frame.dimensions() == self.pixels.dimensions() {
            frame.clone()
        } else {
            imageops::resize(frame, self.width(), self.height(), FilterType::Triangle)
        };
        imageops::overlay(&mut out, &self.pixels, 0, 0);
        out
    }
}

/// Holds at most one mounted surface.
#[derive(Default)]
pub struct SurfaceHost {
    mounted: Option<OverlaySurface>,
}

impl SurfaceHost {
    pub fn new() -> SurfaceHost {
        SurfaceHost::default()
    }

    /// Mount `surface`, discarding whatever was mounted before.
    pub fn mount(&mut self, surface: OverlaySurface) -> SurfaceId {
        let id = surface.id();
        if let Some(prev) = self.mounted.replace(surface) {
            debug!("Replaced overlay surface {:?} with {:?}", prev.id(), id);
        }
        id
    }

    pub fn unmount(&mut self) -> Option<OverlaySurface> {
        self.mounted.take()
    }

    pub fn mounted_id(&self) -> Option<SurfaceId> {
        self.mounted.as_ref().map(|s| s.id())
    }

    pub fn current(&self) -> Option<&OverlaySurface> {
        self.mounted.as_ref()
    }

    /// The mounted surface, only if it is still the one identified by `id`.
    pub fn active(&self, id: SurfaceId) -> Option<&OverlaySurface> {
        self.mounted.as_ref().filter(|s| s.id() == id)
    }

    pub fn active_mut(&mut self, id: SurfaceId) -> Option<&mut OverlaySurface> {
        self.mounted.as_mut().filter(|s| s.id() == id)
    }
}
