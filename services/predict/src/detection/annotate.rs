use super::Detection;
use image::{DynamicImage, Rgb, RgbImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;

const BOX_THICKNESS: i32 = 2;

const PALETTE: [[u8; 3]; 12] = [
    [255, 56, 56],
    [255, 157, 151],
    [255, 112, 31],
    [255, 178, 29],
    [207, 210, 49],
    [72, 249, 10],
    [26, 147, 52],
    [0, 212, 187],
    [0, 194, 255],
    [52, 69, 147],
    [132, 56, 255],
    [255, 55, 199],
];

/// Box colour for a class id
pub fn class_color(class: u32) -> Rgb<u8> {
    Rgb(PALETTE[class as usize % PALETTE.len()])
}

/// Draw detection boxes onto an RGB copy of `source`
pub fn annotate(source: &DynamicImage, detections: &[Detection]) -> RgbImage {
    let mut canvas = source.to_rgb8();
    let (width, height) = (canvas.width() as i32, canvas.height() as i32);
    if width == 0 || height == 0 {
        return canvas;
    }

    for det in detections {
        let x_min = (det.xmin.floor() as i32).clamp(0, width - 1);
        let y_min = (det.ymin.floor() as i32).clamp(0, height - 1);
        let x_max = (det.xmax.ceil() as i32).clamp(0, width - 1);
        let y_max = (det.ymax.ceil() as i32).clamp(0, height - 1);

        let color = class_color(det.class);
        for t in 0..BOX_THICKNESS {
            let w = x_max - x_min - 2 * t + 1;
            let h = y_max - y_min - 2 * t + 1;
            if w <= 0 || h <= 0 {
                break;
            }
            let rect = Rect::at(x_min + t, y_min + t).of_size(w as u32, h as u32);
            draw_hollow_rect_mut(&mut canvas, rect, color);
        }
    }

    canvas
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boxed(xmin: f32, ymin: f32, xmax: f32, ymax: f32, class: u32) -> Detection {
        Detection {
            xmin,
            ymin,
            xmax,
            ymax,
            confidence: 0.9,
            class,
            name: "obj".to_string(),
        }
    }

    #[test]
    fn test_draws_edges_in_class_color() {
        let source = DynamicImage::ImageRgb8(RgbImage::new(20, 20));
        let out = annotate(&source, &[boxed(2.0, 2.0, 12.0, 12.0, 3)]);

        let color = class_color(3);
        assert_eq!(out.get_pixel(2, 2), &color);
        assert_eq!(out.get_pixel(12, 7), &color);
        assert_eq!(out.get_pixel(3, 3), &color);
        assert_eq!(out.get_pixel(7, 7), &Rgb([0, 0, 0]));
    }

    #[test]
    fn test_boxes_outside_image_are_clamped() {
        let source = DynamicImage::ImageRgb8(RgbImage::new(10, 10));
        let out = annotate(&source, &[boxed(-5.0, -5.0, 50.0, 50.0, 0)]);
        assert_eq!(out.get_pixel(0, 0), &class_color(0));
        assert_eq!(out.get_pixel(9, 9), &class_color(0));
    }

    #[test]
    fn test_degenerate_box_is_skipped() {
        let source = DynamicImage::ImageRgb8(RgbImage::new(10, 10));
        let out = annotate(&source, &[boxed(5.0, 5.0, 4.0, 4.0, 0)]);
        assert!(out.pixels().all(|p| p == &Rgb([0, 0, 0])));
    }

    #[test]
    fn test_palette_wraps() {
        assert_eq!(class_color(0), class_color(PALETTE.len() as u32));
    }
}
