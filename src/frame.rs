use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use std::time::Instant;

/// Seconds since this process started. The single shared monotonic clock
/// basis behind `grab_ts`/`encode_*_ts`/`expose_*_ts` so `latency = now -
/// grab_ts` arithmetic is meaningful across capture, encode and expose.
pub fn monotonic_now() -> f64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now).elapsed().as_secs_f64()
}

/// Wire/in-memory codec tag for a [`Frame`]'s payload.
///
/// `H265` gets its own discriminant rather than overloading an unrelated
/// V4L2 fourcc — there is no standard tag for it, so this crate defines
/// one instead of preserving that overload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CodecFormat {
    RawYuyv,
    Jpeg,
    H264,
    H265,
}

impl CodecFormat {
    /// Bytes per pixel for raw formats; compressed formats have no fixed ratio.
    pub fn bytes_per_pixel(&self) -> Option<usize> {
        match self {
            CodecFormat::RawYuyv => Some(2),
            CodecFormat::Jpeg | CodecFormat::H264 | CodecFormat::H265 => None,
        }
    }

    pub fn is_compressed(&self) -> bool {
        !matches!(self, CodecFormat::RawYuyv)
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            CodecFormat::Jpeg => "image/jpeg",
            CodecFormat::H264 => "video/h264",
            CodecFormat::H265 => "video/hevc",
            CodecFormat::RawYuyv => "application/octet-stream",
        }
    }
}

/// A single captured or encoded picture plus the metadata that must stay
/// coherent across the ring, the memory sink and the HTTP layer.
///
/// Invariants: `stride == 0` for compressed formats;
/// `stride >= width * bytes_per_pixel(format)` for raw ones. `data.len()`
/// doubles as the "bytes actually used" length — owning the buffer makes a
/// separate "allocated capacity" field unnecessary.
#[derive(Debug, Clone)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub format: CodecFormat,
    pub key: bool,
    pub gop: u32,
    pub online: bool,
    pub grab_ts: f64,
    pub encode_begin_ts: f64,
    pub encode_end_ts: f64,
}

impl Frame {
    /// Build a raw frame, computing a minimal tightly-packed stride.
    pub fn raw(width: u32, height: u32, format: CodecFormat, data: Vec<u8>, grab_ts: f64) -> Self {
        debug_assert!(!format.is_compressed());
        let stride = width * format.bytes_per_pixel().unwrap_or(0) as u32;
        Self {
            data,
            width,
            height,
            stride,
            format,
            key: true,
            gop: 0,
            online: true,
            grab_ts,
            encode_begin_ts: grab_ts,
            encode_end_ts: grab_ts,
        }
    }

    /// Build a compressed frame (`stride` is always zero for these formats).
    pub fn compressed(
        width: u32,
        height: u32,
        format: CodecFormat,
        data: Vec<u8>,
        key: bool,
        gop: u32,
    ) -> Self {
        debug_assert!(format.is_compressed());
        Self {
            data,
            width,
            height,
            stride: 0,
            format,
            key,
            gop,
            online: true,
            grab_ts: 0.0,
            encode_begin_ts: 0.0,
            encode_end_ts: 0.0,
        }
    }

    /// A zero-byte "online flag only" update per Expose.
    pub fn online_flag_only(online: bool, format: CodecFormat) -> Self {
        Self {
            data: Vec::new(),
            width: 0,
            height: 0,
            stride: 0,
            format,
            key: false,
            gop: 0,
            online,
            grab_ts: 0.0,
            encode_begin_ts: 0.0,
            encode_end_ts: 0.0,
        }
    }

    pub fn used(&self) -> usize {
        self.data.len()
    }

    pub fn same_geometry_as(&self, other: &Frame) -> bool {
        self.width == other.width && self.height == other.height && self.format == other.format
    }

    /// Byte-equal comparison over `used` bytes plus matching geometry, used
    /// by the HTTP refresher's drop-same-frames policy.
    pub fn byte_equal(&self, other: &Frame) -> bool {
        self.same_geometry_as(other) && self.data == other.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_frame_stride_matches_bytes_per_pixel() {
        let f = Frame::raw(640, 480, CodecFormat::RawYuyv, vec![0u8; 640 * 480 * 2], 1.0);
        assert_eq!(f.stride, 640 * 2);
        assert_eq!(f.used(), 640 * 480 * 2);
    }

    #[test]
    fn compressed_frame_has_zero_stride() {
        let f = Frame::compressed(640, 480, CodecFormat::Jpeg, vec![1, 2, 3], true, 30);
        assert_eq!(f.stride, 0);
        assert!(f.key);
    }

    #[test]
    fn byte_equal_requires_matching_geometry() {
        let a = Frame::compressed(640, 480, CodecFormat::Jpeg, vec![1, 2, 3], true, 30);
        let b = Frame::compressed(320, 240, CodecFormat::Jpeg, vec![1, 2, 3], true, 30);
        assert!(!a.byte_equal(&b));
        let c = Frame::compressed(640, 480, CodecFormat::Jpeg, vec![1, 2, 3], false, 30);
        assert!(a.byte_equal(&c));
    }
}
