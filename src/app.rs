//! Top-level application wiring: config → ring/sinks/encoder pool →
//! orchestrator + HTTP server, plus SIGTERM/SIGINT shutdown handling via
//! an oneshot channel.

use crate::blank::BlankGenerator;
use crate::capture::SyntheticCaptureSource;
use crate::config::ServerConfig;
use crate::encoder::{CpuJpegBackend, EncoderType, PassthroughBackend};
use crate::error::Result;
use crate::fps::FpsInstrument;
use crate::http::registry::ClientRegistry;
use crate::http::{self, refresher, AppState};
use crate::orchestrator::Orchestrator;
use crate::ring::Ring;
use crate::sink::MemorySink;
use crate::worker_pool::WorkerPool;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::oneshot;
use tracing::info;

pub struct Application {
    config: ServerConfig,
}

impl Application {
    pub fn new(config: ServerConfig) -> Self {
        Self { config }
    }

    pub async fn run(self) -> Result<i32> {
        let config = self.config;
        config.validate()?;

        let ring = Arc::new(Ring::new(config.system.ring_capacity));
        let fps = Arc::new(FpsInstrument::new());
        let blank = Arc::new(BlankGenerator::new(config.system.blank_font_path.as_deref()));
        let registry = Arc::new(ClientRegistry::new());
        let stop = Arc::new(AtomicBool::new(false));

        let exposed_rx = refresher::spawn_refresher(
            Arc::clone(&ring),
            config.stream.drop_same_frames,
            config.capture.desired_fps,
            Arc::clone(&stop),
        );

        let encoder_type = EncoderType::parse_type(&config.encoder.r#type).map_err(|e| {
            crate::error::UstreamerError::Encoder(crate::error::EncoderError::UnknownType(e.to_string()))
        })?;
        let n_workers = if encoder_type.forces_single_worker() {
            1
        } else {
            config.encoder.n_workers
        };
        let quality = config.encoder.quality;
        let pool = Arc::new(WorkerPool::new(
            n_workers,
            Duration::from_secs_f64(config.encoder.desired_interval_secs),
            move |_worker_id| -> Box<dyn crate::encoder::EncoderBackend> {
                match encoder_type {
                    EncoderType::Hardware => Box::new(PassthroughBackend),
                    _ => Box::new(CpuJpegBackend::new(quality)),
                }
            },
        ));

        let jpeg_sink = match &config.sinks.jpeg {
            Some(sc) => Some(MemorySink::open(
                "jpeg",
                &sc.path,
                &sc.object_suffix,
                true,
                sc.mode,
                sc.rm,
                sc.client_ttl_secs,
                sc.lock_timeout_secs,
            )?),
            None => None,
        };
        let h264_sink = match &config.sinks.h264 {
            Some(sc) => Some(MemorySink::open(
                "h264",
                &sc.path,
                &sc.object_suffix,
                true,
                sc.mode,
                sc.rm,
                sc.client_ttl_secs,
                sc.lock_timeout_secs,
            )?),
            None => None,
        };

        let capture = Box::new(SyntheticCaptureSource::new(
            config.capture.width,
            config.capture.height,
            config.capture.fps,
        ));

        let mut orchestrator = Orchestrator::new(
            capture,
            Arc::clone(&pool),
            Arc::clone(&ring),
            Arc::clone(&blank),
            Arc::clone(&fps),
            jpeg_sink,
            h264_sink,
            Arc::clone(&stop),
            config.system.slowdown,
            Duration::from_secs_f64(config.system.error_delay_secs),
            config.capture.width,
            config.capture.height,
            Arc::clone(&registry),
        );

        let http_state = Arc::new(AppState::new(
            config.clone(),
            fps,
            blank,
            registry,
            exposed_rx,
        ));
        let host = config.stream.host.clone();
        let port = config.stream.port;

        let orchestrator_handle = tokio::spawn(async move {
            orchestrator.run().await;
        });
        let server_handle = tokio::spawn(async move { http::serve(http_state, &host, port).await });

        let shutdown_reason = wait_for_shutdown_signal().await;
        info!(reason = %shutdown_reason, "shutting down");
        stop.store(true, std::sync::atomic::Ordering::Release);

        let _ = orchestrator_handle.await;
        server_handle.abort();

        Ok(0)
    }
}

async fn wait_for_shutdown_signal() -> &'static str {
    let (tx, rx) = oneshot::channel::<&'static str>();
    let tx = Arc::new(tokio::sync::Mutex::new(Some(tx)));

    #[cfg(unix)]
    {
        let tx_term = Arc::clone(&tx);
        tokio::spawn(async move {
            if let Ok(mut sig) = signal::unix::signal(signal::unix::SignalKind::terminate()) {
                sig.recv().await;
                if let Some(sender) = tx_term.lock().await.take() {
                    let _ = sender.send("SIGTERM");
                }
            }
        });
    }

    let tx_int = Arc::clone(&tx);
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            if let Some(sender) = tx_int.lock().await.take() {
                let _ = sender.send("SIGINT");
            }
        }
    });

    rx.await.unwrap_or("unknown")
}
