//! Generated document scans for tests and benchmarks.
//!
//! Pages are a light background covered with dark "text" blocks, rules and
//! boxes, which gives the feature detector plenty of corners. A scan is a
//! page pasted into a larger canvas at a known shift, so alignment results
//! can be compared against the exact answer.

use image::{GrayImage, Luma};
use imageproc::{
    drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_line_segment_mut},
    rect::Rect,
};
use rand::{Rng, SeedableRng, rngs::StdRng};

const PAPER: u8 = 235;
const INK: u8 = 25;

/// Render a textured page of `width` x `height` pixels.
pub fn textured_page(width: u32, height: u32, seed: u64) -> GrayImage {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut page = GrayImage::from_pixel(width, height, Luma([PAPER]));
    if width < 8 || height < 8 {
        return page;
    }

    // Word-like blocks laid out on text lines.
    let line_gap = 14u32;
    let mut y = 6u32;
    while y + 8 < height {
        let mut x = 4 + rng.gen_range(0..6);
        while x + 6 < width {
            let word = rng.gen_range(4..18).min(width - x - 2);
            let tall = rng.gen_range(5..9).min(height - y - 1);
            let shade = rng.gen_range(INK..INK + 60);
            draw_filled_rect_mut(
                &mut page,
                Rect::at(x as i32, y as i32).of_size(word, tall),
                Luma([shade]),
            );
            x += word + rng.gen_range(3..8);
        }
        y += line_gap + rng.gen_range(0..4);
    }

    // Form boxes and rules.
    for _ in 0..(width * height / 20_000).max(3) {
        let bw = rng.gen_range(10..(width / 3).max(11));
        let bh = rng.gen_range(10..(height / 4).max(11));
        let bx = rng.gen_range(0..width.saturating_sub(bw).max(1));
        let by = rng.gen_range(0..height.saturating_sub(bh).max(1));
        draw_hollow_rect_mut(
            &mut page,
            Rect::at(bx as i32, by as i32).of_size(bw, bh),
            Luma([INK]),
        );
    }
    for _ in 0..4 {
        let x0 = rng.gen_range(0..width) as f32;
        let y0 = rng.gen_range(0..height) as f32;
        let x1 = rng.gen_range(0..width) as f32;
        let y1 = rng.gen_range(0..height) as f32;
        draw_line_segment_mut(&mut page, (x0, y0), (x1, y1), Luma([INK + 10]));
    }
    page
}

/// Paste `page` into a `canvas_width` x `canvas_height` scan with its
/// top-left corner at `(origin_x + dx, origin_y + dy)`.
///
/// Parts of the page that fall outside the canvas are dropped; uncovered
/// canvas is filled with paper.
pub fn place_page(
    page: &GrayImage,
    canvas_width: u32,
    canvas_height: u32,
    origin_x: i32,
    origin_y: i32,
    dx: i32,
    dy: i32,
) -> GrayImage {
    let mut canvas = GrayImage::from_pixel(canvas_width, canvas_height, Luma([PAPER]));
    let left = origin_x + dx;
    let top = origin_y + dy;
    for (x, y, pixel) in page.enumerate_pixels() {
        let cx = left + x as i32;
        let cy = top + y as i32;
        if cx >= 0 && cy >= 0 && (cx as u32) < canvas_width && (cy as u32) < canvas_height {
            canvas.put_pixel(cx as u32, cy as u32, *pixel);
        }
    }
    canvas
}

/// Draw a horizontal gauge bar filled to `fraction` (clamped to `[0, 1]`)
/// inside `rect`. Gives generated crops a visible, learnable label.
pub fn draw_gauge(image: &mut GrayImage, rect: Rect, fraction: f32) {
    let fraction = fraction.clamp(0.0, 1.0);
    draw_filled_rect_mut(image, rect, Luma([PAPER]));
    draw_hollow_rect_mut(image, rect, Luma([INK]));
    let filled = ((rect.width() as f32 - 2.0) * fraction).round() as u32;
    if filled > 0 && rect.height() > 2 {
        draw_filled_rect_mut(
            image,
            Rect::at(rect.left() + 1, rect.top() + 1).of_size(filled, rect.height() - 2),
            Luma([INK]),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pages_are_deterministic_per_seed() {
        assert_eq!(textured_page(120, 90, 7), textured_page(120, 90, 7));
        assert_ne!(textured_page(120, 90, 7), textured_page(120, 90, 8));
    }

    #[test]
    fn page_has_ink_and_paper() {
        let page = textured_page(100, 100, 1);
        let dark = page.pixels().filter(|p| p[0] < 128).count();
        assert!(dark > 200, "expected text blocks, got {dark} dark pixels");
        assert!(dark < 100 * 100 / 2);
    }

    #[test]
    fn placed_page_lands_at_shift() {
        let page = textured_page(40, 30, 3);
        let scan = place_page(&page, 80, 60, 10, 10, 5, -4);
        assert_eq!(scan.dimensions(), (80, 60));
        assert_eq!(scan.get_pixel(15 + 7, 6 + 9), page.get_pixel(7, 9));
    }

    #[test]
    fn gauge_fill_tracks_fraction() {
        let mut image = GrayImage::from_pixel(50, 10, Luma([PAPER]));
        draw_gauge(&mut image, Rect::at(0, 0).of_size(50, 10), 0.5);
        let inked = (1..49).filter(|x| image.get_pixel(*x, 5)[0] == INK).count();
        assert_eq!(inked, 24);
    }
}
