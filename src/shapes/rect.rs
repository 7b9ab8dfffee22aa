use super::point::Point;

/// Axis aligned box in pixel space, anchored at its top-left corner.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Rect {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

impl Rect {
    pub fn new(x: f32, y: f32, w: f32, h: f32) -> Rect {
        Rect { x, y, w, h }
    }

    pub fn from_center(xc: f32, yc: f32, w: f32, h: f32) -> Rect {
        Rect {
            x: xc - w / 2.,
            y: yc - h / 2.,
            w,
            h,
        }
    }

    pub fn from_corners(x1: f32, y1: f32, x2: f32, y2: f32) -> Rect {
        Rect {
            x: x1,
            y: y1,
            w: x2 - x1,
            h: y2 - y1,
        }
    }

    pub fn left(&self) -> f32 {
        self.x
    }
    pub fn right(&self) -> f32 {
        self.x + self.w
    }
    pub fn top(&self) -> f32 {
        self.y
    }
    pub fn bottom(&self) -> f32 {
        self.y + self.h
    }
    pub fn area(&self) -> f32 {
        self.w.max(0.) * self.h.max(0.)
    }

    pub fn center(&self) -> Point {
        Point::new(self.x + self.w / 2., self.y + self.h / 2.)
    }

    pub fn top_left(&self) -> Point {
        Point::new(self.x, self.y)
    }

    pub fn scale(&self, scale_x: f32, scale_y: f32) -> Rect {
        Rect {
            x: self.x * scale_x,
            y: self.y * scale_y,
            w: self.w * scale_x,
            h: self.h * scale_y,
        }
    }

    /// Grow the box around its center by `factor` (1.2 pads 10% per side).
    pub fn pad(&self, factor: f32) -> Rect {
        let c = self.center();
        Rect::from_center(c.x, c.y, self.w * factor, self.h * factor)
    }

    pub fn clamp(&self, width: u32, height: u32) -> Rect {
        let x1 = self.left().clamp(0., width as f32);
        let y1 = self.top().clamp(0., height as f32);
        let x2 = self.right().clamp(0., width as f32);
        let y2 = self.bottom().clamp(0., height as f32);
        Rect::from_corners(x1, y1, x2, y2)
    }

    /// Intersection over union as a percentage, 0 when the boxes are disjoint.
    pub fn overlap_pct(&self, other: &Rect) -> f32 {
        let x_min = self.left().max(other.left());
        let x_max = self.right().min(other.right());
        let y_min = self.top().max(other.top());
        let y_max = self.bottom().min(other.bottom());

        let overlap_area = if x_min < x_max && y_min < y_max {
            (x_max - x_min) * (y_max - y_min)
        } else {
            0.
        };

        let area_delta = self.area() + other.area() - overlap_area;

        if area_delta > 0. {
            overlap_area / area_delta * 100.
        } else {
            0.
        }
    }

    /// Integer pixel rect clamped into a `width`x`height` buffer, at least 1x1.
    pub fn to_pixel_rect(&self, width: u32, height: u32) -> imageproc::rect::Rect {
        let max_x = width.saturating_sub(1) as f32;
        let max_y = height.saturating_sub(1) as f32;

        let x1 = self.left().clamp(0., max_x);
        let y1 = self.top().clamp(0., max_y);
        let x2 = self.right().clamp(0., max_x);
        let y2 = self.bottom().clamp(0., max_y);

        let w = (x2 - x1).max(1.).round() as u32;
        let h = (y2 - y1).max(1.).round() as u32;

        imageproc::rect::Rect::at(x1.round() as i32, y1.round() as i32).of_size(w, h)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_overlap_pct() {
        let a = Rect::new(0., 0., 10., 10.);
        let b = Rect::new(5., 0., 10., 10.);
        // 50 overlap / 150 union
        assert_relative_eq!(a.overlap_pct(&b), 100. / 3., epsilon = 1e-4);

        let far = Rect::new(100., 100., 10., 10.);
        assert_eq!(a.overlap_pct(&far), 0.);
        assert_relative_eq!(a.overlap_pct(&a), 100.);
    }

    #[test]
    fn test_pad_keeps_center() {
        let r = Rect::new(10., 20., 100., 50.);
        let padded = r.pad(1.2);
        assert_relative_eq!(padded.center().x, r.center().x);
        assert_relative_eq!(padded.center().y, r.center().y);
        assert_relative_eq!(padded.w, 120.);
        assert_relative_eq!(padded.h, 60.);
    }

    #[test]
    fn test_clamp() {
        let r = Rect::new(-10., 5., 50., 200.).clamp(30, 100);
        assert_eq!(r, Rect::new(0., 5., 30., 95.));
    }

    #[test]
    fn test_to_pixel_rect() {
        let r = Rect::new(2.4, 3.6, 10.2, 0.1).to_pixel_rect(100, 100);
        assert_eq!(r.left(), 2);
        assert_eq!(r.top(), 4);
        assert_eq!(r.width(), 10);
        assert_eq!(r.height(), 1);
    }
}
