use crate::shapes::Point;

// BlazeFace short range SSD layout: one 16x16 layer and three 8x8 layers
// sharing a stride, two anchors per layer per cell.
const STRIDES: [u32; 4] = [8, 16, 16, 16];
const ANCHORS_PER_LAYER: usize = 2;
const ANCHOR_OFFSET: f32 = 0.5;

pub const NUM_ANCHORS: usize = 896;

/// Anchor centers normalised to the model input, in model output order.
pub fn gen_anchors(input_size: u32) -> Vec<Point> {
    let mut anchors = Vec::with_capacity(NUM_ANCHORS);

    let mut layer_id = 0;
    while layer_id < STRIDES.len() {
        // layers with the same stride are merged into one grid
        let mut per_cell = 0;
        let mut last_same_stride = layer_id;
        while last_same_stride < STRIDES.len() && STRIDES[last_same_stride] == STRIDES[layer_id] {
            per_cell += ANCHORS_PER_LAYER;
            last_same_stride += 1;
        }

        let fm = input_size.div_ceil(STRIDES[layer_id]);
        for y in 0..fm {
            for x in 0..fm {
                let xc = (x as f32 + ANCHOR_OFFSET) / fm as f32;
                let yc = (y as f32 + ANCHOR_OFFSET) / fm as f32;
                for _ in 0..per_cell {
                    anchors.push(Point::new(xc, yc));
                }
            }
        }

        layer_id = last_same_stride;
    }

    anchors
}
