//! The HTTP refresher: the single dedicated consumer of the ring. It is
//! the only task allowed to call `Ring::try_consume` — running the
//! drop-same-frames `Exposer` over whatever the orchestrator publishes and
//! broadcasting the result to every `/stream` task over a `watch` channel,
//! so a memory sink consumer and N concurrent HTTP clients never compete
//! for the ring's one consumer slot.

use crate::http::exposer::{ExposedSnapshot, Exposer};
use crate::ring::Ring;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::trace;

/// One refresher tick's outcome: the currently-exposed frame and ancillary
/// counters, plus whether this tick is a genuine update (vs. a deduped
/// repeat or a keepalive re-expose of the same frame).
#[derive(Clone)]
pub struct RefresherTick {
    pub snapshot: ExposedSnapshot,
    pub frame_updated: bool,
}

/// Spawns the refresher task and returns the `watch::Receiver` every
/// `/stream` client subscribes to. Holds `None` until the first frame is
/// exposed. The task exits once `stop` is set.
pub fn spawn_refresher(
    ring: Arc<Ring>,
    drop_same_frames: u32,
    desired_fps: u32,
    stop: Arc<AtomicBool>,
) -> watch::Receiver<Option<RefresherTick>> {
    let tick_period = Duration::from_micros(1_000_000 / (2 * desired_fps.max(1)) as u64);
    let (tx, rx) = watch::channel(None);

    tokio::spawn(async move {
        let mut exposer = Exposer::new(drop_same_frames);
        let mut ticker = interval(tick_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !stop.load(Ordering::Acquire) {
            ticker.tick().await;

            if let Some(frame) = ring.try_consume() {
                let result = exposer.expose(frame);
                let Some(snapshot) = exposer.snapshot() else {
                    continue;
                };
                if tx
                    .send(Some(RefresherTick {
                        snapshot,
                        frame_updated: result.frame_updated,
                    }))
                    .is_err()
                {
                    break;
                }
            } else if exposer.should_keepalive(Duration::from_secs(1)) {
                exposer.mark_kept_alive();
                if let Some(snapshot) = exposer.snapshot() {
                    if tx
                        .send(Some(RefresherTick {
                            snapshot,
                            frame_updated: true,
                        }))
                        .is_err()
                    {
                        break;
                    }
                }
            }
        }
        trace!("refresher task stopped");
    });

    rx
}
