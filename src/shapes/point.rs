#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Point {
        Point { x, y }
    }

    pub fn scale(&self, scale_x: f32, scale_y: f32) -> Point {
        Point {
            x: self.x * scale_x,
            y: self.y * scale_y,
        }
    }

    /// Pixel coordinate for drawing, clamped into a `width`x`height` buffer.
    pub fn to_pixel(&self, width: u32, height: u32) -> (i32, i32) {
        let max_x = width.saturating_sub(1) as f32;
        let max_y = height.saturating_sub(1) as f32;
        (
            self.x.clamp(0., max_x).round() as i32,
            self.y.clamp(0., max_y).round() as i32,
        )
    }
}

impl From<(f32, f32)> for Point {
    fn from((x, y): (f32, f32)) -> Point {
        Point { x, y }
    }
}
