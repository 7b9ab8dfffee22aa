use ab_glyph::{FontArc, PxScale};
use anyhow::{Context, Result};
use image::{Rgba, RgbaImage};
use imageproc::drawing;
use std::path::Path;
use tracing::{span, Level};

use crate::detection::DetectionRecord;
use crate::overlay::OverlaySurface;
use crate::shapes::{Point, Rect};

// 68 point layout: (first, last, closed)
const CONTOURS_68: [(usize, usize, bool); 9] = [
    (0, 16, false),  // jaw
    (17, 21, false), // left brow
    (22, 26, false), // right brow
    (27, 30, false), // nose bridge
    (30, 35, false), // nostrils
    (36, 41, true),  // left eye
    (42, 47, true),  // right eye
    (48, 59, true),  // outer lips
    (60, 67, true),  // inner lips
];

#[derive(Debug, Clone)]
pub struct RenderStyle {
    pub detection_color: Rgba<u8>,
    pub detection_line_width: u32,
    pub label_color: Rgba<u8>,
    pub label_line_width: u32,
    pub text_color: Rgba<u8>,
    pub font_size: f32,
    pub label_padding: u32,
    pub landmark_line_color: Rgba<u8>,
    pub landmark_point_color: Rgba<u8>,
    pub expression_color: Rgba<u8>,
    pub expression_min_confidence: f32,
    pub expression_bar_height: u32,
}

impl Default for RenderStyle {
    fn default() -> Self {
        RenderStyle {
            detection_color: Rgba([0, 0, 255, 255]),
            detection_line_width: 2,
            label_color: Rgba([0, 0, 255, 255]),
            label_line_width: 3,
            text_color: Rgba([255, 255, 255, 255]),
            font_size: 14.,
            label_padding: 4,
            landmark_line_color: Rgba([1, 255, 212, 255]),
            landmark_point_color: Rgba([255, 0, 255, 255]),
            expression_color: Rgba([255, 165, 0, 255]),
            expression_min_confidence: 0.1,
            expression_bar_height: 4,
        }
    }
}

/// `"<age> year old <gender> - <pct>% <expression>"`, or `None` without expressions.
pub fn compose_label(record: &DetectionRecord) -> Option<String> {
    let (expression, probability) = record.expressions.dominant()?;
    // adding zero turns -0 into 0
    let age = record.age.max(0.).round() + 0.;
    Some(format!(
        "{} year old {} - {}% {}",
        age,
        record.gender,
        (probability * 100.).round(),
        expression
    ))
}

pub struct Renderer {
    style: RenderStyle,
    font: Option<FontArc>,
}

impl Renderer {
    pub fn new(style: RenderStyle, font: Option<FontArc>) -> Renderer {
        Renderer { style, font }
    }

    pub fn load_font(path: &Path) -> Result<FontArc> {
        let data =
            std::fs::read(path).with_context(|| format!("failed to read font {}", path.display()))?;
        FontArc::try_from_vec(data)
            .with_context(|| format!("{} is not a usable font", path.display()))
    }

    pub fn has_font(&self) -> bool {
        self.font.is_some()
    }

    /// Draw every record onto `surface`. Records must already be in surface coordinates.
    pub fn draw(&self, surface: &mut OverlaySurface, records: &[DetectionRecord]) {
        let span = span!(Level::DEBUG, "render");
        let _guard = span.enter();

        let img = surface.pixels_mut();
        for record in records {
            self.draw_detection(img, record);
            self.draw_landmarks(img, &record.landmarks);
            self.draw_expressions(img, record);
            self.draw_label(img, record);
        }
    }

    fn draw_detection(&self, img: &mut RgbaImage, record: &DetectionRecord) {
        let b = &record.bounding_box;
        draw_thick_rect(
            img,
            b,
            self.style.detection_line_width,
            self.style.detection_color,
        );

        let score = format!("{:.2}", record.score);
        self.draw_text_field(img, &score, b.top_left(), self.style.detection_color, false);
    }

    fn draw_landmarks(&self, img: &mut RgbaImage, points: &[Point]) {
        let color = self.style.landmark_line_color;
        if points.len() == 68 {
            for (first, last, closed) in CONTOURS_68 {
                let contour = &points[first..=last];
                for pair in contour.windows(2) {
                    drawing::draw_line_segment_mut(img, (pair[0].x, pair[0].y), (pair[1].x, pair[1].y), color);
                }
                if closed {
                    let (a, b) = (contour[contour.len() - 1], contour[0]);
                    drawing::draw_line_segment_mut(img, (a.x, a.y), (b.x, b.y), color);
                }
            }
        }

        let (w, h) = img.dimensions();
        for p in points {
            drawing::draw_filled_circle_mut(img, p.to_pixel(w, h), 1, self.style.landmark_point_color);
        }
    }

    fn draw_expressions(&self, img: &mut RgbaImage, record: &DetectionRecord) {
        let b = &record.bounding_box;
        let shown = record
            .expressions
            .as_sorted()
            .into_iter()
            .filter(|(_, p)| *p >= self.style.expression_min_confidence);

        let (w, h) = img.dimensions();
        let mut y = b.bottom() + self.style.detection_line_width as f32 + 2.;
        for (name, p) in shown {
            if y >= h as f32 {
                break;
            }
            if let Some(font) = &self.font {
                let (px, py) = Point::new(b.x, y).to_pixel(w, h);
                let text = format!("{name} ({p:.2})");
                drawing::draw_text_mut(img, self.style.expression_color, px, py, self.scale(), font, &text);
                y += self.style.font_size.ceil();
            }

            let bar_w = (b.w * p.clamp(0., 1.)).max(1.);
            let bar = Rect::new(b.x, y, bar_w, self.style.expression_bar_height as f32);
            drawing::draw_filled_rect_mut(img, bar.to_pixel_rect(w, h), self.style.expression_color);
            y += (self.style.expression_bar_height + 2) as f32;
        }
    }

    fn draw_label(&self, img: &mut RgbaImage, record: &DetectionRecord) {
        let b = &record.bounding_box;
        draw_thick_rect(img, b, self.style.label_line_width, self.style.label_color);

        if let Some(label) = compose_label(record) {
            let half_line = self.style.label_line_width as f32 / 2.;
            let anchor = Point::new(b.x - half_line, b.y);
            self.draw_text_field(img, &label, anchor, self.style.label_color, true);
        }
    }

    /// Text on a filled background. With `above`, `anchor` is the field's
    /// bottom-left corner, otherwise its top-left.
    fn draw_text_field(
        &self,
        img: &mut RgbaImage,
        text: &str,
        anchor: Point,
        background: Rgba<u8>,
        above: bool,
    ) {
        let Some(font) = &self.font else {
            return;
        };

        let pad = self.style.label_padding;
        let (text_w, text_h) = drawing::text_size(self.scale(), font, text);
        let field_w = text_w + pad * 2;
        let field_h = text_h.max(self.style.font_size.ceil() as u32) + pad * 2;

        let (w, h) = img.dimensions();
        let mut top = if above {
            anchor.y - field_h as f32
        } else {
            anchor.y
        };
        // keep the field on screen
        top = top.clamp(0., (h as f32 - field_h as f32).max(0.));
        let left = anchor.x.clamp(0., (w as f32 - field_w as f32).max(0.));

        let field = Rect::new(left, top, field_w as f32, field_h as f32);
        drawing::draw_filled_rect_mut(img, field.to_pixel_rect(w, h), background);
        drawing::draw_text_mut(
            img,
            self.style.text_color,
            (left as u32 + pad) as i32,
            (top as u32 + pad) as i32,
            self.scale(),
            font,
            text,
        );
    }

    fn scale(&self) -> PxScale {
        PxScale::from(self.style.font_size)
    }
}

fn draw_thick_rect(img: &mut RgbaImage, rect: &Rect, thickness: u32, color: Rgba<u8>) {
    let (w, h) = img.dimensions();
    let inset = (thickness.max(1) - 1) as f32 / 2.;
    for i in 0..thickness.max(1) {
        let off = i as f32 - inset;
        let r = Rect::new(rect.x - off, rect.y - off, rect.w + 2. * off, rect.h + 2. * off);
        if r.w <= 0. || r.h <= 0. {
            continue;
        }
        drawing::draw_hollow_rect_mut(img, r.to_pixel_rect(w, h), color);
    }
}
