//! Rolling frame-rate accounting. Fail mode: none — always
//! returns a value, zero when there are no samples yet.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

const WINDOW: Duration = Duration::from_secs(1);

struct Inner {
    events: VecDeque<Instant>,
    online: bool,
    width: u32,
    height: u32,
}

/// `{online, width, height}` plus a frames-per-second counter over the
/// trailing 1-second window.
pub struct FpsInstrument {
    inner: Mutex<Inner>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FpsSnapshot {
    pub fps: f64,
    pub online: bool,
    pub width: u32,
    pub height: u32,
}

impl FpsInstrument {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                events: VecDeque::new(),
                online: false,
                width: 0,
                height: 0,
            }),
        }
    }

    /// Records one frame event and updates the status snapshot fields.
    pub fn record(&self, online: bool, width: u32, height: u32) {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        inner.events.push_back(now);
        Self::trim(&mut inner.events, now);
        inner.online = online;
        inner.width = width;
        inner.height = height;
    }

    pub fn snapshot(&self) -> FpsSnapshot {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        Self::trim(&mut inner.events, now);
        FpsSnapshot {
            fps: inner.events.len() as f64,
            online: inner.online,
            width: inner.width,
            height: inner.height,
        }
    }

    fn trim(events: &mut VecDeque<Instant>, now: Instant) {
        while let Some(front) = events.front() {
            if now.duration_since(*front) > WINDOW {
                events.pop_front();
            } else {
                break;
            }
        }
    }
}

impl Default for FpsInstrument {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_samples_returns_zero() {
        let fps = FpsInstrument::new();
        let snap = fps.snapshot();
        assert_eq!(snap.fps, 0.0);
        assert!(!snap.online);
    }

    #[test]
    fn counts_events_within_window() {
        let fps = FpsInstrument::new();
        for _ in 0..5 {
            fps.record(true, 640, 480);
        }
        let snap = fps.snapshot();
        assert_eq!(snap.fps, 5.0);
        assert_eq!(snap.width, 640);
        assert!(snap.online);
    }

    #[test]
    fn old_events_age_out_of_the_window() {
        let fps = FpsInstrument::new();
        {
            let mut inner = fps.inner.lock();
            inner.events.push_back(Instant::now() - Duration::from_secs(2));
        }
        fps.record(true, 1, 1);
        let snap = fps.snapshot();
        assert_eq!(snap.fps, 1.0);
    }
}
