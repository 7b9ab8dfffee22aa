//! Detection records as produced by an [`InferenceProvider`](crate::pipeline::InferenceProvider)
//! and the geometry needed to map them onto the display.

use crate::shapes::{Point, Rect};

/// Face bounding box, top-left anchored.
pub type FaceBox = Rect;

/// Native pixel resolution of a video frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Resolution {
        Resolution { width, height }
    }

    pub fn of(img: &image::RgbaImage) -> Resolution {
        Resolution::new(img.width(), img.height())
    }
}

/// Fixed rendering resolution that all detection geometry is mapped into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplaySize {
    pub width: u32,
    pub height: u32,
}

impl DisplaySize {
    pub fn new(width: u32, height: u32) -> DisplaySize {
        DisplaySize { width, height }
    }

    /// (x, y) factors taking `from` coordinates into display coordinates.
    pub fn scale_from(&self, from: Resolution) -> (f32, f32) {
        (
            self.width as f32 / from.width.max(1) as f32,
            self.height as f32 / from.height.max(1) as f32,
        )
    }
}

impl From<Resolution> for DisplaySize {
    fn from(r: Resolution) -> DisplaySize {
        DisplaySize::new(r.width, r.height)
    }
}

/// Expression name to probability, kept in the order the provider reported them.
///
/// The order matters: it decides which expression wins a tie in [`Expressions::dominant`].
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Expressions {
    entries: Vec<(String, f32)>,
}

impl Expressions {
    pub fn new() -> Expressions {
        Expressions::default()
    }

    pub fn push(&mut self, name: impl Into<String>, probability: f32) {
        self.entries.push((name.into(), probability));
    }

    pub fn get(&self, name: &str) -> Option<f32> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, p)| *p)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f32)> {
        self.entries.iter().map(|(n, p)| (n.as_str(), *p))
    }

    /// Expression with the highest probability. The first one encountered wins ties.
    pub fn dominant(&self) -> Option<(&str, f32)> {
        let mut best: Option<(&str, f32)> = None;
        for (name, p) in self.iter() {
            match best {
                Some((_, best_p)) if p <= best_p => {}
                _ => best = Some((name, p)),
            }
        }
        best
    }

    /// Entries sorted by descending probability; equal probabilities keep insertion order.
    pub fn as_sorted(&self) -> Vec<(&str, f32)> {
        let mut sorted: Vec<(&str, f32)> = self.iter().collect();
        sorted.sort_by(|a, b| b.1.total_cmp(&a.1));
        sorted
    }
}

impl<S: Into<String>> FromIterator<(S, f32)> for Expressions {
    fn from_iter<I: IntoIterator<Item = (S, f32)>>(iter: I) -> Self {
        Expressions {
            entries: iter.into_iter().map(|(n, p)| (n.into(), p)).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectionRecord {
    pub bounding_box: FaceBox,
    pub score: f32,
    pub landmarks: Vec<Point>,
    pub expressions: Expressions,
    pub age: f32,
    pub gender: String,
    pub gender_probability: f32,
}

impl DetectionRecord {
    pub fn rescale(&self, scale_x: f32, scale_y: f32) -> DetectionRecord {
        DetectionRecord {
            bounding_box: self.bounding_box.scale(scale_x, scale_y),
            landmarks: self
                .landmarks
                .iter()
                .map(|p| p.scale(scale_x, scale_y))
                .collect(),
            ..self.clone()
        }
    }
}

/// Map records detected at `from` onto `to`. Non-geometric attributes are untouched.
pub fn resize_results(
    records: &[DetectionRecord],
    from: Resolution,
    to: DisplaySize,
) -> Vec<DetectionRecord> {
    let (sx, sy) = to.scale_from(from);
    records.iter().map(|r| r.rescale(sx, sy)).collect()
}
