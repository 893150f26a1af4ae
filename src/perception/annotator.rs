//! Draw detection boxes onto a screenshot for debug output.
//!
//! Each element gets a rectangle coloured by its type and a bar above it
//! whose length is proportional to the match confidence.

use image::{Rgba, RgbaImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut};
use imageproc::rect::Rect as DrawRect;

use crate::errors::BotResult;
use crate::perception::types::{Element, ElementType, Screenshot};

fn element_colour(et: ElementType) -> Rgba<u8> {
    match et {
        ElementType::Button => Rgba([255, 68, 68, 255]),
        ElementType::Text => Rgba([170, 170, 170, 255]),
        ElementType::Icon => Rgba([255, 170, 0, 255]),
        ElementType::Image => Rgba([255, 200, 100, 255]),
        ElementType::Input => Rgba([68, 255, 68, 255]),
        ElementType::Menu => Rgba([0, 220, 255, 255]),
        ElementType::Dialog => Rgba([255, 68, 255, 255]),
        ElementType::Unknown => Rgba([255, 255, 255, 255]),
    }
}

pub fn annotate(shot: &Screenshot, elements: &[Element]) -> RgbaImage {
    let mut canvas = shot.image.to_rgba8();
    let thickness: i32 = if canvas.width() > 1600 { 3 } else { 2 };

    for el in elements {
        if el.rect.width == 0 || el.rect.height == 0 {
            continue;
        }
        let col = element_colour(el.element_type);
        for t in 0..thickness {
            let w = el.rect.width as i32 - 2 * t;
            let h = el.rect.height as i32 - 2 * t;
            if w <= 0 || h <= 0 {
                break;
            }
            draw_hollow_rect_mut(
                &mut canvas,
                DrawRect::at(el.rect.x + t, el.rect.y + t).of_size(w as u32, h as u32),
                col,
            );
        }

        let bar_w = ((el.rect.width as f32) * el.confidence.clamp(0.0, 1.0)).round() as u32;
        let bar_h = (thickness * 2) as u32;
        if bar_w > 0 {
            draw_filled_rect_mut(
                &mut canvas,
                DrawRect::at(el.rect.x, (el.rect.y - bar_h as i32 - 1).max(0)).of_size(bar_w, bar_h),
                col,
            );
        }
    }
    canvas
}

/// PNG bytes of the annotated screenshot.
pub fn annotate_png(shot: &Screenshot, elements: &[Element]) -> BotResult<Vec<u8>> {
    let canvas = annotate(shot, elements);
    let mut out = Vec::new();
    image::DynamicImage::ImageRgba8(canvas)
        .write_to(&mut std::io::Cursor::new(&mut out), image::ImageFormat::Png)?;
    Ok(out)
}

/// One line per element, for logs and prompts.
pub fn element_summary(elements: &[Element]) -> String {
    if elements.is_empty() {
        return "No elements detected.".to_string();
    }
    let mut lines = vec!["Detected elements:".to_string()];
    for e in elements {
        let c = e.center();
        lines.push(format!(
            "  - {} {:?} at ({}, {}) {}x{} ({:.0}%)",
            e.name,
            e.element_type,
            c.x,
            c.y,
            e.rect.width,
            e.rect.height,
            e.confidence * 100.0
        ));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::perception::types::Rect;

    fn blank(w: u32, h: u32) -> Screenshot {
        Screenshot::new(image::DynamicImage::ImageRgba8(RgbaImage::from_pixel(
            w,
            h,
            Rgba([0, 0, 0, 255]),
        )))
    }

    #[test]
    fn draws_box_edges_in_type_colour() {
        let shot = blank(100, 100);
        let el = Element::new("confirm_button", Rect::new(20, 30, 40, 20), 1.0, ElementType::Button);
        let canvas = annotate(&shot, &[el]);
        assert_eq!(*canvas.get_pixel(20, 30), Rgba([255, 68, 68, 255]));
        assert_eq!(*canvas.get_pixel(59, 49), Rgba([255, 68, 68, 255]));
        // interior untouched
        assert_eq!(*canvas.get_pixel(40, 40), Rgba([0, 0, 0, 255]));
        // confidence bar above the box
        assert_eq!(*canvas.get_pixel(25, 26), Rgba([255, 68, 68, 255]));
    }

    #[test]
    fn png_output_decodes() {
        let shot = blank(32, 32);
        let el = Element::new("x", Rect::new(-5, -5, 20, 20), 0.5, ElementType::Unknown);
        let bytes = annotate_png(&shot, &[el]).unwrap();
        let decoded = image::load_from_memory(&bytes).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (32, 32));
    }

    #[test]
    fn summary_lists_each_element() {
        let els = vec![
            Element::new("army_idle", Rect::new(0, 0, 10, 10), 0.91, ElementType::Icon),
            Element::new("back_button", Rect::new(10, 10, 10, 10), 0.85, ElementType::Button),
        ];
        let text = element_summary(&els);
        assert!(text.contains("army_idle Icon at (5, 5) 10x10 (91%)"));
        assert_eq!(text.lines().count(), 3);
        assert_eq!(element_summary(&[]), "No elements detected.");
    }
}
