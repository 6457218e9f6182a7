//! Encoder facade and backend trait.
//!
//! `EncoderBackend` is the pluggable seam standing in for real M2M/vendor
//! hardware encode paths, which are out of scope here — the *selection
//! policy* around them is the actual subject, so two concrete backends
//! (`CpuJpegBackend`, `PassthroughBackend`) exercise that policy end to
//! end. `CpuJpegBackend` uses the `image` crate for real encode work.

use crate::frame::{CodecFormat, Frame};
use parking_lot::Mutex;
use std::io::Cursor;
use std::sync::Arc;
use tracing::debug;

#[derive(thiserror::Error, Debug)]
pub enum BackendError {
    #[error("encode failed: {0}")]
    Failed(String),
}

/// An encode backend: compress `src` into `dst`, optionally forcing a
/// keyframe. Implementations own whatever encoder state they need (e.g. a
/// lazily-created M2M device handle).
pub trait EncoderBackend: Send {
    fn encode(&mut self, src: &Frame, dst: &mut Frame, force_key: bool) -> Result<(), BackendError>;
}

/// Canonical encoder type, five variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderType {
    Cpu,
    Hardware,
    M2mVideo,
    M2mImage,
    Vendor,
}

impl EncoderType {
    /// Case-insensitive name/alias parsing; unknown names are an error
    ///.
    pub fn parse_type(s: &str) -> Result<Self, BackendError> {
        match s.to_ascii_lowercase().as_str() {
            "cpu" => Ok(EncoderType::Cpu),
            "hardware" | "hw" | "passthrough" => Ok(EncoderType::Hardware),
            "m2m-video" | "m2m_video" | "m2mvideo" => Ok(EncoderType::M2mVideo),
            "m2m-image" | "m2m_image" | "m2mimage" => Ok(EncoderType::M2mImage),
            "vendor" | "rv1126" => Ok(EncoderType::Vendor),
            other => Err(BackendError::Failed(format!("unknown encoder type: {other}"))),
        }
    }

    /// `n_workers` is forced to 1 for vendor pipelines that bind capture and
    /// encode internally.
    pub fn forces_single_worker(&self) -> bool {
        matches!(self, EncoderType::Vendor)
    }
}

/// Applies rules 1-2 at `open` time: JPEG input forces
/// Hardware (just copy); non-JPEG input on a Hardware type falls back to
/// CPU.
pub fn resolve_effective_type(requested: EncoderType, input_format: CodecFormat) -> EncoderType {
    if input_format == CodecFormat::Jpeg && requested != EncoderType::Hardware {
        return EncoderType::Hardware;
    }
    if input_format != CodecFormat::Jpeg && requested == EncoderType::Hardware {
        return EncoderType::Cpu;
    }
    requested
}

/// Copies `src` into `dst` unchanged — the "Hardware" pass-through path for
/// inputs that are already JPEG.
#[derive(Default)]
pub struct PassthroughBackend;

impl EncoderBackend for PassthroughBackend {
    fn encode(&mut self, src: &Frame, dst: &mut Frame, _force_key: bool) -> Result<(), BackendError> {
        *dst = src.clone();
        Ok(())
    }
}

/// Re-encodes raw frames to JPEG via the `image` crate.
pub struct CpuJpegBackend {
    quality: u8,
}

impl CpuJpegBackend {
    pub fn new(quality: u8) -> Self {
        Self {
            quality: quality.clamp(1, 100),
        }
    }
}

impl EncoderBackend for CpuJpegBackend {
    fn encode(&mut self, src: &Frame, dst: &mut Frame, force_key: bool) -> Result<(), BackendError> {
        if src.format == CodecFormat::Jpeg {
            *dst = src.clone();
            dst.key = true;
            return Ok(());
        }
        if src.format != CodecFormat::RawYuyv {
            return Err(BackendError::Failed(format!(
                "cpu encoder cannot handle source format {:?}",
                src.format
            )));
        }

        let rgb = yuyv_to_rgb(&src.data, src.width, src.height)
            .ok_or_else(|| BackendError::Failed("truncated raw frame".into()))?;
        let image_buf =
            image::RgbImage::from_raw(src.width, src.height, rgb).ok_or_else(|| {
                BackendError::Failed("raw buffer does not match declared geometry".into())
            })?;

        let mut out = Vec::new();
        let mut cursor = Cursor::new(&mut out);
        let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut cursor, self.quality);
        encoder
            .encode_image(&image::DynamicImage::ImageRgb8(image_buf))
            .map_err(|e| BackendError::Failed(e.to_string()))?;

        *dst = Frame::compressed(src.width, src.height, CodecFormat::Jpeg, out, true, 0);
        let _ = force_key; // JPEG has no inter-frame dependency; every frame is a keyframe.
        dst.grab_ts = src.grab_ts;
        Ok(())
    }
}

/// Minimal YUYV (4:2:2) to packed RGB8 conversion, ITU-R BT.601.
fn yuyv_to_rgb(data: &[u8], width: u32, height: u32) -> Option<Vec<u8>> {
    let expected = (width as usize) * (height as usize) * 2;
    if data.len() < expected {
        return None;
    }
    let mut out = Vec::with_capacity((width as usize) * (height as usize) * 3);
    for chunk in data[..expected].chunks_exact(4) {
        let (y0, u, y1, v) = (chunk[0] as i32, chunk[1] as i32, chunk[2] as i32, chunk[3] as i32);
        for y in [y0, y1] {
            let c = y - 16;
            let d = u - 128;
            let e = v - 128;
            let r = (298 * c + 409 * e + 128) >> 8;
            let g = (298 * c - 100 * d - 208 * e + 128) >> 8;
            let b = (298 * c + 516 * d + 128) >> 8;
            out.push(r.clamp(0, 255) as u8);
            out.push(g.clamp(0, 255) as u8);
            out.push(b.clamp(0, 255) as u8);
        }
    }
    Some(out)
}

/// Mutex-guarded `(type, quality)` pair so `get_runtime_params()` is safe to
/// call concurrently with encode operations.
#[derive(Clone)]
pub struct EncoderRuntimeParams {
    inner: Arc<Mutex<(EncoderType, u8)>>,
}

impl EncoderRuntimeParams {
    pub fn new(encoder_type: EncoderType, quality: u8) -> Self {
        Self {
            inner: Arc::new(Mutex::new((encoder_type, quality))),
        }
    }

    pub fn get(&self) -> (EncoderType, u8) {
        *self.inner.lock()
    }

    pub fn set_quality(&self, quality: u8) {
        self.inner.lock().1 = quality.clamp(1, 100);
        debug!(quality, "updated encoder quality");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_type_accepts_aliases_case_insensitively() {
        assert_eq!(EncoderType::parse_type("CPU").unwrap(), EncoderType::Cpu);
        assert_eq!(EncoderType::parse_type("hw").unwrap(), EncoderType::Hardware);
        assert!(EncoderType::parse_type("nonsense").is_err());
    }

    #[test]
    fn jpeg_input_forces_hardware_passthrough() {
        let resolved = resolve_effective_type(EncoderType::Cpu, CodecFormat::Jpeg);
        assert_eq!(resolved, EncoderType::Hardware);
    }

    #[test]
    fn non_jpeg_on_hardware_falls_back_to_cpu() {
        let resolved = resolve_effective_type(EncoderType::Hardware, CodecFormat::RawYuyv);
        assert_eq!(resolved, EncoderType::Cpu);
    }

    #[test]
    fn vendor_pipelines_force_single_worker() {
        assert!(EncoderType::Vendor.forces_single_worker());
        assert!(!EncoderType::Cpu.forces_single_worker());
    }

    #[test]
    fn passthrough_copies_frame_unchanged() {
        let src = Frame::compressed(4, 4, CodecFormat::Jpeg, vec![1, 2, 3], true, 0);
        let mut dst = src.clone();
        PassthroughBackend.encode(&src, &mut dst, false).unwrap();
        assert_eq!(dst.data, src.data);
    }

    #[test]
    fn cpu_backend_encodes_solid_color_frame() {
        let width = 4;
        let height = 2;
        let mut raw = Vec::new();
        for _ in 0..(width * height / 2) {
            raw.extend_from_slice(&[128, 64, 128, 192]);
        }
        let src = Frame::raw(width, height, CodecFormat::RawYuyv, raw, 0.0);
        let mut dst = src.clone();
        let mut backend = CpuJpegBackend::new(80);
        backend.encode(&src, &mut dst, false).unwrap();
        assert_eq!(dst.format, CodecFormat::Jpeg);
        assert!(!dst.data.is_empty());
    }

    #[test]
    fn runtime_params_round_trip() {
        let params = EncoderRuntimeParams::new(EncoderType::Cpu, 80);
        params.set_quality(50);
        assert_eq!(params.get(), (EncoderType::Cpu, 50));
    }
}
