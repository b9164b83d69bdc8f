// Screenshot overlays for computer-use action traces
//
// The annotated variant is what gets stored; the model always sees the
// clean screenshot. Markers: red crosshair for click/double_click, blue for
// hover/move, green start+end plus a connecting line for drag, and a top
// banner for type.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use image::{DynamicImage, Rgba, RgbaImage};
use serde_json::Value;
use tracing::warn;

use super::optimize::encode_jpeg;

const RED: Rgba<u8> = Rgba([255, 0, 0, 255]);
const BLUE: Rgba<u8> = Rgba([0, 0, 255, 255]);
const GREEN: Rgba<u8> = Rgba([0, 255, 0, 255]);

/// Annotate a base64 screenshot according to the executed action. Returns
/// the original payload unchanged when decoding or annotation fails.
pub fn overlay_screenshot(screenshot_b64: &str, action: &Value) -> String {
    match try_overlay(screenshot_b64, action) {
        Some(annotated) => annotated,
        None => screenshot_b64.to_string(),
    }
}

fn try_overlay(screenshot_b64: &str, action: &Value) -> Option<String> {
    if screenshot_b64.is_empty() {
        return None;
    }
    let bytes = BASE64.decode(screenshot_b64.trim()).ok()?;
    let img = image::load_from_memory(&bytes)
        .map_err(|e| warn!(error = %e, "Failed to decode screenshot for overlay"))
        .ok()?;
    let mut canvas = img.to_rgba8();

    let action_type = action.get("type").and_then(Value::as_str).unwrap_or_default();
    match action_type {
        "click" | "double_click" => {
            let (x, y) = point(action, "x", "y")?;
            draw_marker(&mut canvas, x, y, RED);
        }
        "move" | "hover" => {
            let (x, y) = point(action, "x", "y")?;
            draw_marker(&mut canvas, x, y, BLUE);
        }
        "drag" | "drag_and_drop" => {
            let (sx, sy, tx, ty) = drag_endpoints(action)?;
            draw_marker(&mut canvas, sx, sy, GREEN);
            draw_marker(&mut canvas, tx, ty, GREEN);
            draw_line(&mut canvas, sx, sy, tx, ty, GREEN);
        }
        "type" => {
            draw_banner(&mut canvas);
        }
        _ => return None,
    }

    let mut out = Vec::new();
    encode_jpeg(&DynamicImage::ImageRgba8(canvas), 80, &mut out).ok()?;
    Some(BASE64.encode(&out))
}

fn coord(value: Option<&Value>) -> Option<i64> {
    let value = value?;
    value
        .as_i64()
        .or_else(|| value.as_f64().map(|f| f as i64))
}

fn point(action: &Value, x_key: &str, y_key: &str) -> Option<(i64, i64)> {
    Some((coord(action.get(x_key))?, coord(action.get(y_key))?))
}

fn drag_endpoints(action: &Value) -> Option<(i64, i64, i64, i64)> {
    // Preferred shape: path = [{x, y}, ..., {x, y}]
    if let Some(path) = action.get("path").and_then(Value::as_array) {
        if path.len() >= 2 {
            let start = &path[0];
            let end = &path[path.len() - 1];
            return Some((
                coord(start.get("x"))?,
                coord(start.get("y"))?,
                coord(end.get("x"))?,
                coord(end.get("y"))?,
            ));
        }
    }
    let sx = coord(action.get("source_x"))
        .or_else(|| coord(action.get("start_x")))
        .or_else(|| coord(action.get("x")))?;
    let sy = coord(action.get("source_y"))
        .or_else(|| coord(action.get("start_y")))
        .or_else(|| coord(action.get("y")))?;
    let tx = coord(action.get("target_x"))
        .or_else(|| coord(action.get("end_x")))
        .or_else(|| coord(action.get("to_x")))
        .or_else(|| coord(action.get("x2")))?;
    let ty = coord(action.get("target_y"))
        .or_else(|| coord(action.get("end_y")))
        .or_else(|| coord(action.get("to_y")))
        .or_else(|| coord(action.get("y2")))?;
    Some((sx, sy, tx, ty))
}

fn put_pixel(canvas: &mut RgbaImage, x: i64, y: i64, color: Rgba<u8>) {
    if x >= 0 && y >= 0 && (x as u32) < canvas.width() && (y as u32) < canvas.height() {
        canvas.put_pixel(x as u32, y as u32, color);
    }
}

/// Circle outline plus crosshair, matching the stored-trace marker style
fn draw_marker(canvas: &mut RgbaImage, cx: i64, cy: i64, color: Rgba<u8>) {
    const RADIUS: i64 = 10;
    // Circle outline, 3px thick
    for dx in -(RADIUS + 2)..=(RADIUS + 2) {
        for dy in -(RADIUS + 2)..=(RADIUS + 2) {
            let dist_sq = dx * dx + dy * dy;
            let outer = (RADIUS + 1) * (RADIUS + 1);
            let inner = (RADIUS - 2) * (RADIUS - 2);
            if dist_sq <= outer && dist_sq >= inner {
                put_pixel(canvas, cx + dx, cy + dy, color);
            }
        }
    }
    // Crosshair arms, 2px thick
    for offset in -15..=15 {
        for thickness in 0..2 {
            put_pixel(canvas, cx + offset, cy + thickness, color);
            put_pixel(canvas, cx + thickness, cy + offset, color);
        }
    }
}

fn draw_line(canvas: &mut RgbaImage, x0: i64, y0: i64, x1: i64, y1: i64, color: Rgba<u8>) {
    let (mut x, mut y) = (x0, y0);
    let dx = (x1 - x0).abs();
    let dy = -(y1 - y0).abs();
    let sx = if x0 < x1 { 1 } else { -1 };
    let sy = if y0 < y1 { 1 } else { -1 };
    let mut err = dx + dy;
    loop {
        put_pixel(canvas, x, y, color);
        put_pixel(canvas, x, y + 1, color);
        if x == x1 && y == y1 {
            break;
        }
        let e2 = 2 * err;
        if e2 >= dy {
            err += dy;
            x += sx;
        }
        if e2 <= dx {
            err += dx;
            y += sy;
        }
    }
}

/// Semi-transparent banner across the top, signalling a type action
fn draw_banner(canvas: &mut RgbaImage) {
    let width = canvas.width();
    let height = canvas.height().min(30);
    for y in 0..height {
        for x in 0..width {
            let pixel = canvas.get_pixel(x, y);
            let blended = Rgba([pixel[0] / 2, pixel[1] / 2, pixel[2] / 2, 255]);
            canvas.put_pixel(x, y, blended);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, RgbImage};
    use serde_json::json;

    fn screenshot_b64() -> String {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(64, 64, image::Rgb([200, 200, 200])));
        let mut out = Vec::new();
        img.write_to(&mut std::io::Cursor::new(&mut out), ImageFormat::Png).unwrap();
        BASE64.encode(&out)
    }

    #[test]
    fn click_overlay_changes_the_image() {
        let clean = screenshot_b64();
        let annotated = overlay_screenshot(&clean, &json!({"type": "click", "x": 32, "y": 32}));
        assert_ne!(annotated, clean);
        // The annotated copy must itself be a decodable image
        let bytes = BASE64.decode(&annotated).unwrap();
        assert!(image::load_from_memory(&bytes).is_ok());
    }

    #[test]
    fn drag_overlay_accepts_path_form() {
        let clean = screenshot_b64();
        let annotated = overlay_screenshot(
            &clean,
            &json!({"type": "drag", "path": [{"x": 5, "y": 5}, {"x": 50, "y": 50}]}),
        );
        assert_ne!(annotated, clean);
    }

    #[test]
    fn unknown_action_returns_clean_screenshot() {
        let clean = screenshot_b64();
        assert_eq!(overlay_screenshot(&clean, &json!({"type": "scroll"})), clean);
    }

    #[test]
    fn invalid_payload_is_passed_through() {
        assert_eq!(overlay_screenshot("not-base64!!!", &json!({"type": "click"})), "not-base64!!!");
    }
}
