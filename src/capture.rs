//! Capture source seam. `SyntheticCaptureSource` is the one concrete
//! implementation this crate ships — a solid-color raw-frame generator at
//! configured geometry/fps, standing in for the real V4L2/platform driver so
//! the orchestrator's control flow runs end to end without vendor hardware.

use crate::frame::{CodecFormat, Frame};
use async_trait::async_trait;
use std::time::{Duration, Instant};

#[async_trait]
pub trait CaptureSource: Send + Sync {
    /// Returns the next frame, or `Ok(None)` when capture is offline this
    /// tick.
    async fn next_frame(&mut self) -> crate::error::Result<Option<Frame>>;

    fn width(&self) -> u32;
    fn height(&self) -> u32;
}

/// Emits a solid-color YUYV frame on a fixed cadence. `online` can be
/// toggled to exercise the orchestrator's blank-frame substitution path
/// without real hardware.
pub struct SyntheticCaptureSource {
    width: u32,
    height: u32,
    frame_interval: Duration,
    last_emit: Option<Instant>,
    online: bool,
    pattern: u8,
}

impl SyntheticCaptureSource {
    pub fn new(width: u32, height: u32, fps: u32) -> Self {
        let fps = fps.max(1);
        Self {
            width,
            height,
            frame_interval: Duration::from_secs_f64(1.0 / fps as f64),
            last_emit: None,
            online: true,
            pattern: 0,
        }
    }

    pub fn set_online(&mut self, online: bool) {
        self.online = online;
    }

    fn solid_yuyv(&self) -> Vec<u8> {
        let pixel_pairs = (self.width as usize * self.height as usize) / 2;
        let mut data = Vec::with_capacity(pixel_pairs * 4);
        for _ in 0..pixel_pairs {
            data.extend_from_slice(&[self.pattern, 128, self.pattern, 128]);
        }
        data
    }
}

#[async_trait]
impl CaptureSource for SyntheticCaptureSource {
    async fn next_frame(&mut self) -> crate::error::Result<Option<Frame>> {
        if !self.online {
            return Ok(None);
        }

        if let Some(last) = self.last_emit {
            let elapsed = last.elapsed();
            if elapsed < self.frame_interval {
                tokio::time::sleep(self.frame_interval - elapsed).await;
            }
        }
        self.last_emit = Some(Instant::now());
        self.pattern = self.pattern.wrapping_add(1);

        let grab_ts = crate::frame::monotonic_now();
        let data = self.solid_yuyv();
        Ok(Some(Frame::raw(self.width, self.height, CodecFormat::RawYuyv, data, grab_ts)))
    }

    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn online_source_yields_correctly_sized_frames() {
        let mut source = SyntheticCaptureSource::new(8, 4, 1000);
        let frame = source.next_frame().await.unwrap().unwrap();
        assert_eq!(frame.width, 8);
        assert_eq!(frame.height, 4);
        assert_eq!(frame.data.len(), 8 * 4 * 2);
    }

    #[tokio::test]
    async fn offline_source_yields_none() {
        let mut source = SyntheticCaptureSource::new(8, 4, 1000);
        source.set_online(false);
        assert!(source.next_frame().await.unwrap().is_none());
    }
}
