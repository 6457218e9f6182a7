//! Stream Orchestrator: the hot loop driving capture → encode →
//! ring/sink publish, with blank-frame substitution and a slowdown policy
//! for when no client is attached. Publishes every frame it produces
//! unconditionally — the drop-same-frames policy lives downstream, in the
//! HTTP refresher, since a memory sink consumer is entitled to every frame
//! regardless of what any HTTP client happens to see.

use crate::blank::BlankGenerator;
use crate::capture::CaptureSource;
use crate::error::{EncoderError, UstreamerError};
use crate::fps::FpsInstrument;
use crate::frame::Frame;
use crate::http::registry::ClientRegistry;
use crate::ring::Ring;
use crate::sink::MemorySink;
use crate::worker_pool::WorkerPool;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

type Sink = Arc<Option<Mutex<MemorySink>>>;

pub struct Orchestrator {
    capture: Box<dyn CaptureSource>,
    pool: Arc<WorkerPool>,
    ring: Arc<Ring>,
    blank: Arc<BlankGenerator>,
    fps: Arc<FpsInstrument>,
    jpeg_sink: Sink,
    h264_sink: Sink,
    stop: Arc<AtomicBool>,
    slowdown: bool,
    error_delay: Duration,
    width: u32,
    height: u32,
    /// Shared with the HTTP server so the slowdown policy can see whether
    /// any stream client is attached.
    registry: Arc<ClientRegistry>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        capture: Box<dyn CaptureSource>,
        pool: Arc<WorkerPool>,
        ring: Arc<Ring>,
        blank: Arc<BlankGenerator>,
        fps: Arc<FpsInstrument>,
        jpeg_sink: Option<MemorySink>,
        h264_sink: Option<MemorySink>,
        stop: Arc<AtomicBool>,
        slowdown: bool,
        error_delay: Duration,
        width: u32,
        height: u32,
        registry: Arc<ClientRegistry>,
    ) -> Self {
        Self {
            capture,
            pool,
            ring,
            blank,
            fps,
            jpeg_sink: Arc::new(jpeg_sink.map(Mutex::new)),
            h264_sink: Arc::new(h264_sink.map(Mutex::new)),
            stop,
            slowdown,
            error_delay,
            width,
            height,
            registry,
        }
    }

    pub async fn run(&mut self) {
        while !self.stop.load(Ordering::Acquire) {
            self.tick().await;
        }
        debug!("orchestrator stopped");
    }

    /// One hot-loop iteration. The encode submission for a freshly-captured
    /// frame is dispatched onto its own task rather than awaited here, so a
    /// busy worker encoding one frame never stalls capture of the next —
    /// `n_workers` workers can have that many encodes genuinely in flight.
    async fn tick(&mut self) {
        match self.capture.next_frame().await {
            Ok(Some(raw)) => {
                self.fps.record(true, raw.width, raw.height);
                let force_key = self.poll_key_requested().await;
                let pool = Arc::clone(&self.pool);
                let ring = Arc::clone(&self.ring);
                let jpeg_sink = Arc::clone(&self.jpeg_sink);
                let h264_sink = Arc::clone(&self.h264_sink);
                tokio::spawn(async move {
                    match pool.submit(raw, force_key).await {
                        Ok(encoded) => publish_frame(&ring, &jpeg_sink, &h264_sink, encoded).await,
                        Err(UstreamerError::Encoder(EncoderError::NotAvailable(reason))) => {
                            trace!(reason, "encode dropped this tick");
                        }
                        Err(e) => warn!(error = %e, "encode job failed"),
                    }
                });
            }
            Ok(None) => {
                self.fps.record(false, self.width, self.height);
                let blank = self.blank.frame(self.width, self.height);
                publish_frame(&self.ring, &self.jpeg_sink, &self.h264_sink, blank).await;
            }
            Err(e) => {
                warn!(error = %e, "capture error; substituting blank frame");
                let blank = self.blank.frame(self.width, self.height);
                publish_frame(&self.ring, &self.jpeg_sink, &self.h264_sink, blank).await;
                tokio::time::sleep(self.error_delay).await;
            }
        }

        if self.slowdown && !self.has_any_clients().await {
            tokio::time::sleep(self.error_delay * 10).await;
        }
    }

    async fn poll_key_requested(&self) -> bool {
        let mut requested = false;
        if let Some(sink) = self.h264_sink.as_ref() {
            requested |= sink.lock().await.key_requested();
        }
        if let Some(sink) = self.jpeg_sink.as_ref() {
            requested |= sink.lock().await.key_requested();
        }
        requested
    }

    async fn has_any_clients(&self) -> bool {
        if self.registry.count() > 0 {
            return true;
        }
        if let Some(sink) = self.jpeg_sink.as_ref() {
            if sink.lock().await.has_clients() {
                return true;
            }
        }
        if let Some(sink) = self.h264_sink.as_ref() {
            if sink.lock().await.has_clients() {
                return true;
            }
        }
        false
    }
}

/// Publishes one frame to the ring and, if configured, to the JPEG and
/// H.264/H.265 memory sinks. Free function (rather than an `&mut self`
/// method) so it can run inside a task spawned off `tick()`, independent
/// of the orchestrator's own lifetime.
async fn publish_frame(ring: &Ring, jpeg_sink: &Sink, h264_sink: &Sink, frame: Frame) {
    ring.publish(frame.clone());

    if let Some(sink) = jpeg_sink.as_ref() {
        let mut sink = sink.lock().await;
        if sink.server_check(Some(&frame)) {
            if let Err(e) = sink.server_put(&frame) {
                warn!(error = %e, "jpeg sink publish failed");
            }
        }
    }
    if let Some(sink) = h264_sink.as_ref() {
        let mut sink = sink.lock().await;
        if sink.server_check(Some(&frame)) {
            if let Err(e) = sink.server_put(&frame) {
                warn!(error = %e, "h264 sink publish failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::SyntheticCaptureSource;
    use crate::encoder::CpuJpegBackend;

    /// Encode submission now happens on a spawned task, so a freshly
    /// published frame may land in the ring a beat after `tick()` returns;
    /// poll briefly instead of asserting it is there synchronously.
    async fn wait_for_frame(ring: &Ring) -> Frame {
        for _ in 0..200 {
            if let Some(frame) = ring.try_consume() {
                return frame;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("no frame published within timeout");
    }

    #[tokio::test]
    async fn one_tick_online_publishes_a_real_frame() {
        let ring = Arc::new(Ring::new(4));
        let pool = Arc::new(WorkerPool::new(1, Duration::ZERO, |_| Box::new(CpuJpegBackend::new(80))));
        let mut orchestrator = Orchestrator::new(
            Box::new(SyntheticCaptureSource::new(8, 4, 1000)),
            pool,
            Arc::clone(&ring),
            Arc::new(BlankGenerator::default()),
            Arc::new(FpsInstrument::new()),
            None,
            None,
            Arc::new(AtomicBool::new(false)),
            false,
            Duration::from_millis(1),
            8,
            4,
            Arc::new(ClientRegistry::new()),
        );
        orchestrator.tick().await;
        let frame = wait_for_frame(&ring).await;
        assert!(!frame.data.is_empty());
    }

    #[tokio::test]
    async fn offline_capture_publishes_blank_frame() {
        let ring = Arc::new(Ring::new(4));
        let pool = Arc::new(WorkerPool::new(1, Duration::ZERO, |_| Box::new(CpuJpegBackend::new(80))));
        let mut source = SyntheticCaptureSource::new(8, 4, 1000);
        source.set_online(false);
        let mut orchestrator = Orchestrator::new(
            Box::new(source),
            pool,
            Arc::clone(&ring),
            Arc::new(BlankGenerator::default()),
            Arc::new(FpsInstrument::new()),
            None,
            None,
            Arc::new(AtomicBool::new(false)),
            false,
            Duration::from_millis(1),
            8,
            4,
            Arc::new(ClientRegistry::new()),
        );
        orchestrator.tick().await;
        let frame = wait_for_frame(&ring).await;
        assert!(!frame.online);
    }

    #[tokio::test]
    async fn tick_does_not_block_on_encode_completion() {
        let ring = Arc::new(Ring::new(16));
        let pool = Arc::new(WorkerPool::new(4, Duration::ZERO, |_| {
            Box::new(crate::encoder::PassthroughBackend::default())
        }));
        let mut orchestrator = Orchestrator::new(
            Box::new(SyntheticCaptureSource::new(8, 4, 1000)),
            pool,
            Arc::clone(&ring),
            Arc::new(BlankGenerator::default()),
            Arc::new(FpsInstrument::new()),
            None,
            None,
            Arc::new(AtomicBool::new(false)),
            false,
            Duration::from_millis(1),
            8,
            4,
            Arc::new(ClientRegistry::new()),
        );

        let start = std::time::Instant::now();
        for _ in 0..8 {
            orchestrator.tick().await;
        }
        // tick() only awaits capture plus spawning the encode task, never
        // the encode itself completing, so 8 ticks at a 1ms capture
        // interval finish quickly regardless of worker latency.
        assert!(start.elapsed() < Duration::from_millis(500));

        let frame = wait_for_frame(&ring).await;
        assert!(!frame.data.is_empty());
    }
}
