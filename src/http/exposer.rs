//! Expose policy: decides whether a ring frame replaces the currently
//! exposed frame, tracking the drop-same-frames counter and the
//! geometry/online changes the refresher needs to notice. Kept free of
//! axum/tokio types so the policy is unit-testable in isolation, separate
//! from the handler/server wiring.

use crate::frame::{monotonic_now, Frame};
use std::time::{Duration, Instant};

pub struct Exposer {
    drop_same_frames: u32,
    exposed: Option<Frame>,
    dropped: u32,
    last_expose: Option<Instant>,
    expose_begin_ts: f64,
    expose_cmp_ts: f64,
    expose_end_ts: f64,
}

/// Outcome of one `Expose` call: whether the exposed frame
/// actually changed, plus whether anything was exposed at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExposeResult {
    pub frame_updated: bool,
    pub geometry_changed: bool,
}

/// The currently-exposed frame plus the ancillary counters a streaming
/// client's `extra_headers` block reports — single-owner, written only by
/// the HTTP refresher.
#[derive(Clone)]
pub struct ExposedSnapshot {
    pub frame: Frame,
    pub dropped: u32,
    pub expose_begin_ts: f64,
    pub expose_cmp_ts: f64,
    pub expose_end_ts: f64,
}

impl Exposer {
    pub fn new(drop_same_frames: u32) -> Self {
        Self {
            drop_same_frames,
            exposed: None,
            dropped: 0,
            last_expose: None,
            expose_begin_ts: 0.0,
            expose_cmp_ts: 0.0,
            expose_end_ts: 0.0,
        }
    }

    pub fn exposed(&self) -> Option<&Frame> {
        self.exposed.as_ref()
    }

    pub fn dropped(&self) -> u32 {
        self.dropped
    }

    /// A snapshot of the currently-exposed frame plus its ancillary
    /// counters, for broadcast to streaming clients. `None` until the
    /// first frame is exposed.
    pub fn snapshot(&self) -> Option<ExposedSnapshot> {
        self.exposed.as_ref().map(|frame| ExposedSnapshot {
            frame: frame.clone(),
            dropped: self.dropped,
            expose_begin_ts: self.expose_begin_ts,
            expose_cmp_ts: self.expose_cmp_ts,
            expose_end_ts: self.expose_end_ts,
        })
    }

    /// A zero-length incoming frame means "only update the online flag".
    pub fn expose(&mut self, incoming: Frame) -> ExposeResult {
        let expose_begin_ts = monotonic_now();

        if incoming.used() == 0 {
            let geometry_changed = self
                .exposed
                .as_ref()
                .map(|e| e.online != incoming.online)
                .unwrap_or(true);
            if let Some(exposed) = self.exposed.as_mut() {
                exposed.online = incoming.online;
            }
            self.expose_begin_ts = expose_begin_ts;
            self.expose_cmp_ts = expose_begin_ts;
            self.expose_end_ts = monotonic_now();
            return ExposeResult {
                frame_updated: false,
                geometry_changed,
            };
        }

        let is_duplicate = self.drop_same_frames > 0
            && incoming.online
            && self
                .exposed
                .as_ref()
                .map(|e| e.byte_equal(&incoming))
                .unwrap_or(false);
        let expose_cmp_ts = monotonic_now();

        if is_duplicate && self.dropped < self.drop_same_frames {
            self.dropped += 1;
            self.expose_begin_ts = expose_begin_ts;
            self.expose_cmp_ts = expose_cmp_ts;
            self.expose_end_ts = monotonic_now();
            return ExposeResult {
                frame_updated: false,
                geometry_changed: false,
            };
        }

        let geometry_changed = self
            .exposed
            .as_ref()
            .map(|e| !e.same_geometry_as(&incoming) || e.online != incoming.online)
            .unwrap_or(true);

        self.dropped = 0;
        self.last_expose = Some(Instant::now());
        self.exposed = Some(incoming);
        self.expose_begin_ts = expose_begin_ts;
        self.expose_cmp_ts = expose_cmp_ts;
        self.expose_end_ts = monotonic_now();
        ExposeResult {
            frame_updated: true,
            geometry_changed,
        }
    }

    /// Re-exposes the current frame unchanged if the last expose is older
    /// than `max_age`, keeping idle clients alive without a fresh frame.
    pub fn should_keepalive(&self, max_age: Duration) -> bool {
        match self.last_expose {
            Some(t) => t.elapsed() >= max_age,
            None => false,
        }
    }

    pub fn mark_kept_alive(&mut self) {
        self.last_expose = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::CodecFormat;

    fn jpeg(n: u8) -> Frame {
        Frame::compressed(4, 4, CodecFormat::Jpeg, vec![n; 4], true, 1)
    }

    #[test]
    fn first_expose_always_updates() {
        let mut exposer = Exposer::new(10);
        let result = exposer.expose(jpeg(1));
        assert!(result.frame_updated);
        assert!(result.geometry_changed);
    }

    #[test]
    fn duplicate_frames_are_dropped_up_to_threshold() {
        let mut exposer = Exposer::new(2);
        exposer.expose(jpeg(1));
        let r1 = exposer.expose(jpeg(1));
        let r2 = exposer.expose(jpeg(1));
        let r3 = exposer.expose(jpeg(1));
        assert!(!r1.frame_updated);
        assert!(!r2.frame_updated);
        // dropped reached the threshold; the third duplicate passes through.
        assert!(r3.frame_updated);
        assert_eq!(exposer.dropped(), 0);
    }

    #[test]
    fn zero_length_frame_only_updates_online_flag() {
        let mut exposer = Exposer::new(10);
        exposer.expose(jpeg(1));
        let offline = Frame::online_flag_only(false, CodecFormat::Jpeg);
        let result = exposer.expose(offline);
        assert!(!result.frame_updated);
        assert!(result.geometry_changed);
        assert!(!exposer.exposed().unwrap().online);
    }

    #[test]
    fn snapshot_carries_dropped_count_and_timestamps() {
        let mut exposer = Exposer::new(10);
        assert!(exposer.snapshot().is_none());
        exposer.expose(jpeg(1));
        exposer.expose(jpeg(1));
        let snap = exposer.snapshot().unwrap();
        assert_eq!(snap.dropped, 1);
        assert!(snap.expose_end_ts >= snap.expose_begin_ts);
        assert!(snap.expose_cmp_ts >= snap.expose_begin_ts);
    }

    #[test]
    fn geometry_change_is_reported() {
        let mut exposer = Exposer::new(10);
        exposer.expose(jpeg(1));
        let bigger = Frame::compressed(8, 8, CodecFormat::Jpeg, vec![2; 4], true, 1);
        let result = exposer.expose(bigger);
        assert!(result.frame_updated);
        assert!(result.geometry_changed);
    }
}
