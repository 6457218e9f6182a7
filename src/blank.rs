//! Blank placeholder frame generator. Cached JPEG with the
//! text `< NO SIGNAL >` rendered, regenerated only when geometry changes.
//! The font is read once from a configured filesystem path rather than
//! bundled into the binary; if the path is unset or unreadable, the
//! placeholder is rendered without the label.

use crate::frame::{CodecFormat, Frame};
use image::{Rgb, RgbImage};
use imageproc::drawing::draw_text_mut;
use parking_lot::Mutex;
use rusttype::{Font, Scale};
use std::io::Cursor;

const LABEL: &str = "< NO SIGNAL >";

struct Cached {
    width: u32,
    height: u32,
    jpeg: Vec<u8>,
}

pub struct BlankGenerator {
    cache: Mutex<Option<Cached>>,
    font: Option<Font<'static>>,
}

impl BlankGenerator {
    /// `font_path` is read once at construction; a missing file or parse
    /// failure degrades to a plain placeholder with no rendered text rather
    /// than a fatal error, since the blank frame must always be producible.
    pub fn new(font_path: Option<&str>) -> Self {
        let font = font_path.and_then(|path| {
            std::fs::read(path)
                .ok()
                .and_then(|bytes| Font::try_from_vec(bytes))
        });
        Self {
            cache: Mutex::new(None),
            font,
        }
    }

    /// Returns a blank JPEG frame at `width`x`height`, regenerating the
    /// cached bitmap only if the geometry differs from the last call.
    pub fn frame(&self, width: u32, height: u32) -> Frame {
        let mut cache = self.cache.lock();
        let needs_render = match &*cache {
            Some(c) => c.width != width || c.height != height,
            None => true,
        };
        if needs_render {
            let jpeg = self.render(width, height);
            *cache = Some(Cached { width, height, jpeg });
        }
        let jpeg = cache.as_ref().unwrap().jpeg.clone();
        let mut frame = Frame::compressed(width, height, CodecFormat::Jpeg, jpeg, true, 0);
        frame.online = false;
        frame.grab_ts = crate::frame::monotonic_now();
        frame
    }

    fn render(&self, width: u32, height: u32) -> Vec<u8> {
        let mut img = RgbImage::from_pixel(width.max(1), height.max(1), Rgb([16, 16, 16]));

        if let Some(font) = &self.font {
            let scale = Scale::uniform((height.max(1) as f32 / 10.0).clamp(10.0, 48.0));
            let text_width = approximate_text_width(font, scale, LABEL);
            let x = ((width as f32 - text_width) / 2.0).max(0.0) as i32;
            let y = ((height as f32 - scale.y) / 2.0).max(0.0) as i32;
            draw_text_mut(&mut img, Rgb([200, 200, 200]), x, y, scale, font, LABEL);
        }

        let mut out = Vec::new();
        let mut cursor = Cursor::new(&mut out);
        let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut cursor, 85);
        encoder
            .encode_image(&image::DynamicImage::ImageRgb8(img))
            .expect("encoding a freshly-rendered blank frame cannot fail");
        out
    }
}

fn approximate_text_width(font: &Font<'static>, scale: Scale, text: &str) -> f32 {
    font.layout(text, scale, rusttype::point(0.0, 0.0))
        .last()
        .map(|g| g.position().x + g.unpositioned().h_metrics().advance_width)
        .unwrap_or(0.0)
}

impl Default for BlankGenerator {
    fn default() -> Self {
        Self::new(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caches_and_regenerates_only_on_geometry_change() {
        let gen = BlankGenerator::default();
        let a = gen.frame(64, 48);
        let b = gen.frame(64, 48);
        assert_eq!(a.data, b.data);

        let c = gen.frame(32, 24);
        assert_eq!(c.width, 32);
        assert_eq!(c.height, 24);
    }

    #[test]
    fn blank_frame_is_marked_offline() {
        let gen = BlankGenerator::default();
        let f = gen.frame(16, 16);
        assert!(!f.online);
        assert_eq!(f.format, CodecFormat::Jpeg);
    }

    #[test]
    fn missing_font_path_degrades_to_untextured_blank() {
        let gen = BlankGenerator::new(Some("/nonexistent/font.ttf"));
        let f = gen.frame(8, 8);
        assert_eq!(f.width, 8);
    }
}
