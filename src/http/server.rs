//! HTTP server core: axum router for the fixed-path routing table, the
//! MJPG-Streamer `?action=` compatibility shim, Basic auth, CORS
//! pre-flight handling, and per-client extra-headers/advance-headers/
//! dual-final-frames/zero-data stream options. The ring itself is never
//! touched here — every `/snapshot` and `/stream` request reads the
//! latest exposed frame off the HTTP refresher's `watch` channel, since
//! the refresher is the ring's one and only consumer.

use crate::blank::BlankGenerator;
use crate::config::ServerConfig;
use crate::fps::FpsInstrument;
use crate::frame::{monotonic_now, CodecFormat, Frame};
use crate::http::query::StreamQuery;
use crate::http::refresher::RefresherTick;
use crate::http::registry::{ClientEntry, ClientRegistry, RegistrationGuard};
use axum::{
    body::Body,
    extract::{ConnectInfo, Query, State},
    http::{header, HeaderMap, Method, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, on, MethodFilter},
    Router,
};
use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use tracing::{debug, info};

const BOUNDARY: &str = "boundarydonotcross";

pub struct AppState {
    pub config: ServerConfig,
    pub fps: Arc<FpsInstrument>,
    pub blank: Arc<BlankGenerator>,
    pub registry: Arc<ClientRegistry>,
    pub exposed_rx: watch::Receiver<Option<RefresherTick>>,
    pub instance_id: String,
    pub last_request_ts: Mutex<std::time::Instant>,
}

impl AppState {
    pub fn new(
        config: ServerConfig,
        fps: Arc<FpsInstrument>,
        blank: Arc<BlankGenerator>,
        registry: Arc<ClientRegistry>,
        exposed_rx: watch::Receiver<Option<RefresherTick>>,
    ) -> Self {
        Self {
            config,
            fps,
            blank,
            registry,
            exposed_rx,
            instance_id: format!("{:x}", std::process::id()),
            last_request_ts: Mutex::new(std::time::Instant::now()),
        }
    }

    fn touch(&self) {
        *self.last_request_ts.lock() = std::time::Instant::now();
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    let cors = if state.config.stream.cors {
        CorsLayer::new()
            .allow_origin(AllowOrigin::mirror_request())
            .allow_methods(AllowMethods::mirror_request())
            .allow_headers(AllowHeaders::mirror_request())
            .allow_credentials(true)
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/", get(index_handler).options(options_handler))
        .route("/favicon.ico", get(favicon_handler).options(options_handler))
        .route("/state", get(state_handler).options(options_handler))
        .route("/snapshot", get(snapshot_handler).options(options_handler))
        .route("/stream", get(stream_handler).options(options_handler))
        .fallback(on(MethodFilter::GET.or(MethodFilter::OPTIONS), action_fallback_handler))
        .layer(cors)
        .with_state(state)
}

pub async fn serve(state: Arc<AppState>, host: &str, port: u16) -> crate::error::Result<()> {
    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .map_err(|e: std::net::AddrParseError| {
            crate::error::UstreamerError::Stream(crate::error::StreamError::BindFailed {
                addr: format!("{host}:{port}"),
                details: e.to_string(),
            })
        })?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| {
            crate::error::UstreamerError::Stream(crate::error::StreamError::BindFailed {
                addr: addr.to_string(),
                details: e.to_string(),
            })
        })?;

    info!(%addr, "http server listening");
    let app = router(state);
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .await
        .map_err(|e| crate::error::UstreamerError::Stream(crate::error::StreamError::ClientTransport(e.to_string())))?;
    Ok(())
}

/// Pre-flight/compatibility OPTIONS responder: always 200, before auth is
/// even checked, regardless of whether CORS is configured. The `CorsLayer`
/// (when enabled) decorates this response with the echoed headers.
async fn options_handler() -> impl IntoResponse {
    StatusCode::OK
}

fn check_auth(state: &AppState, headers: &HeaderMap) -> bool {
    let Some(auth) = &state.config.stream.auth else {
        return true;
    };
    let expected = format!(
        "Basic {}",
        base64_encode(format!("{}:{}", auth.user, auth.pass).as_bytes())
    );
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|got| got == expected)
        .unwrap_or(false)
}

fn unauthorized() -> Response {
    Response::builder()
        .status(StatusCode::UNAUTHORIZED)
        .header(header::WWW_AUTHENTICATE, "Basic realm=\"Restricted area\"")
        .body(Body::empty())
        .unwrap()
}

async fn index_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    state.touch();
    if !check_auth(&state, &headers) {
        return unauthorized();
    }
    Html(INDEX_HTML).into_response()
}

async fn favicon_handler() -> impl IntoResponse {
    (StatusCode::NO_CONTENT, ())
}

async fn state_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    state.touch();
    if !check_auth(&state, &headers) {
        return unauthorized();
    }
    let fps_snapshot = state.fps.snapshot();
    let exposed = state.exposed_rx.borrow().clone();
    let h264 = exposed.as_ref().filter(|t| t.snapshot.frame.format == CodecFormat::H264).map(|t| {
        let bitrate = (t.snapshot.frame.used() as f64 * fps_snapshot.fps.max(1.0) * 8.0) as u64;
        json!({
            "bitrate": bitrate,
            "gop": t.snapshot.frame.gop,
            "online": t.snapshot.frame.online,
            "fps": fps_snapshot.fps,
        })
    });

    let body = json!({
        "ok": true,
        "result": {
            "instance_id": state.instance_id,
            "encoder": {
                "type": state.config.encoder.r#type,
                "quality": state.config.encoder.quality,
            },
            "source": {
                "resolution": [fps_snapshot.width, fps_snapshot.height],
                "online": fps_snapshot.online,
                "desired_fps": state.config.capture.desired_fps,
                "captured_fps": fps_snapshot.fps,
            },
            "stream": {
                "queued_fps": fps_snapshot.fps,
                "clients": state.registry.count(),
                "clients_stat": state.registry.stats_json(),
            },
            "sinks": {
                "jpeg": state.config.sinks.jpeg.as_ref().map(|s| &s.path),
                "h264": state.config.sinks.h264.as_ref().map(|s| &s.path),
            },
            "h264": h264,
        }
    });
    axum::Json(body).into_response()
}

/// Waits for the refresher's next exposed frame (or returns the current
/// one if already fresh), falling back to a blank frame once `deadline`
/// elapses with nothing exposed yet.
async fn wait_for_exposed(state: &AppState, deadline: Duration) -> Frame {
    let mut rx = state.exposed_rx.clone();
    if let Some(tick) = rx.borrow().clone() {
        return tick.snapshot.frame;
    }
    let frame = match tokio::time::timeout(deadline, rx.changed()).await {
        Ok(Ok(())) => rx.borrow().clone().map(|t| t.snapshot.frame),
        _ => None,
    };
    frame.unwrap_or_else(|| state.blank.frame(state.config.capture.width, state.config.capture.height))
}

async fn snapshot_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    state.touch();
    if !check_auth(&state, &headers) {
        return unauthorized();
    }
    let deadline = Duration::from_secs_f64((state.config.system.error_delay_secs * 3.0).max(1.0));
    let frame = wait_for_exposed(&state, deadline).await;

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, frame.format.content_type())
        .body(Body::from(frame.data))
        .unwrap()
}

/// Implements the MJPG-Streamer `?action=snapshot|stream` compatibility
/// shim for any path not otherwise routed, and answers a bare OPTIONS the
/// same way the named routes do.
async fn action_fallback_handler(
    State(state): State<Arc<AppState>>,
    method: Method,
    headers: HeaderMap,
    Query(query): Query<StreamQuery>,
    connect_info: ConnectInfo<SocketAddr>,
) -> Response {
    if method == Method::OPTIONS {
        return options_handler().await.into_response();
    }
    match query.action.as_deref() {
        Some("snapshot") => snapshot_handler(State(state), headers).await,
        Some("stream") => stream_handler(State(state), headers, Query(query), connect_info).await,
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn stream_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<StreamQuery>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Response {
    state.touch();
    if !check_auth(&state, &headers) {
        return unauthorized();
    }

    let client_id = state.registry.next_id();
    let client_fps = Arc::new(FpsInstrument::new());
    state.registry.register(ClientEntry {
        id: client_id,
        key: query.key.clone(),
        hostport: addr.to_string(),
        extra_headers: query.extra_headers,
        advance_headers: query.advance_headers,
        dual_final_frames: query.dual_final_frames,
        zero_data: query.zero_data,
        fps: Arc::clone(&client_fps),
    });
    debug!(client_id, hostport = %addr, key = ?query.key, "stream client connected");

    let extra_headers = query.extra_headers;
    let advance_headers = query.advance_headers;
    let dual_final_frames = query.dual_final_frames;
    let zero_data = query.zero_data;
    let blank = Arc::clone(&state.blank);
    let geometry = (state.config.capture.width, state.config.capture.height);
    let mut exposed_rx = state.exposed_rx.clone();
    let registry = Arc::clone(&state.registry);

    let body_stream = async_stream::stream! {
        let _guard = RegistrationGuard::new(registry, client_id);
        let mut updated_prev = false;

        // Nothing exposed yet: serve a blank frame immediately rather than
        // block the client until the first capture tick lands.
        if exposed_rx.borrow().is_none() {
            let frame = blank.frame(geometry.0, geometry.1);
            client_fps.record(frame.online, frame.width, frame.height);
            for chunk in mjpeg_chunks(&frame, 0, &client_fps, None, extra_headers, advance_headers, zero_data) {
                yield chunk;
            }
        }

        loop {
            if exposed_rx.changed().await.is_err() {
                break;
            }
            let tick = exposed_rx.borrow_and_update().clone();
            let Some(tick) = tick else { continue };

            // dual_final_frames applies to deduped refresher ticks, not raw
            // keepalives: on a genuine exposer update, emit once and remember
            // it; on the next deduped tick, emit one more copy of that same
            // frame, then stop repeating until another genuine update arrives.
            let should_emit = if tick.frame_updated {
                updated_prev = true;
                true
            } else if dual_final_frames && updated_prev {
                updated_prev = false;
                true
            } else {
                updated_prev = false;
                false
            };
            if !should_emit {
                continue;
            }

            let frame = tick.snapshot.frame.clone();
            client_fps.record(frame.online, frame.width, frame.height);

            match frame.format {
                CodecFormat::H264 | CodecFormat::H265 => {
                    yield Ok::<_, std::io::Error>(Bytes::from(frame.data.clone()));
                }
                _ => {
                    for chunk in mjpeg_chunks(&frame, tick.snapshot.dropped, &client_fps, Some(&tick.snapshot), extra_headers, advance_headers, zero_data) {
                        yield chunk;
                    }
                }
            }
        }
    };

    let content_type = format!("multipart/x-mixed-replace;boundary={BOUNDARY}");
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CACHE_CONTROL, "no-cache, private")
        .header(
            header::SET_COOKIE,
            format!(
                "stream_client={}/{}; max-age=30",
                query.key.unwrap_or_else(|| "0".to_string()),
                client_id
            ),
        )
        .body(Body::from_stream(body_stream))
        .unwrap()
}

/// Builds the MJPEG multipart chunk(s) for one frame: the header block
/// (optionally split from the payload per `advance_headers`) plus payload
/// and trailing CRLF.
fn mjpeg_chunks(
    frame: &Frame,
    dropped: u32,
    client_fps: &FpsInstrument,
    exposed: Option<&crate::http::exposer::ExposedSnapshot>,
    extra_headers: bool,
    advance_headers: bool,
    zero_data: bool,
) -> Vec<Result<Bytes, std::io::Error>> {
    let payload: &[u8] = if zero_data { &[] } else { &frame.data };
    let mut head = format!(
        "--{boundary}\r\nContent-Type: image/jpeg\r\nContent-Length: {len}\r\nX-Timestamp: {ts}\r\n",
        boundary = BOUNDARY,
        len = payload.len(),
        ts = frame.grab_ts,
    );
    if extra_headers {
        let now = monotonic_now();
        let (expose_begin_ts, expose_cmp_ts, expose_end_ts) = exposed
            .map(|e| (e.expose_begin_ts, e.expose_cmp_ts, e.expose_end_ts))
            .unwrap_or((0.0, 0.0, 0.0));
        head.push_str(&format!(
            "X-UStreamer-Online: {online}\r\nX-UStreamer-Width: {width}\r\nX-UStreamer-Height: {height}\r\nX-UStreamer-Dropped: {dropped}\r\nX-UStreamer-Client-Fps: {client_fps}\r\nX-UStreamer-Grab-Ts: {grab_ts}\r\nX-UStreamer-Encode-Begin-Ts: {encode_begin_ts}\r\nX-UStreamer-Encode-End-Ts: {encode_end_ts}\r\nX-UStreamer-Expose-Begin-Ts: {expose_begin_ts}\r\nX-UStreamer-Expose-Cmp-Ts: {expose_cmp_ts}\r\nX-UStreamer-Expose-End-Ts: {expose_end_ts}\r\nX-UStreamer-Now: {now}\r\nX-UStreamer-Latency: {latency}\r\n",
            online = frame.online,
            width = frame.width,
            height = frame.height,
            dropped = dropped,
            client_fps = client_fps.snapshot().fps,
            grab_ts = frame.grab_ts,
            encode_begin_ts = frame.encode_begin_ts,
            encode_end_ts = frame.encode_end_ts,
            expose_begin_ts = expose_begin_ts,
            expose_cmp_ts = expose_cmp_ts,
            expose_end_ts = expose_end_ts,
            now = now,
            latency = now - frame.grab_ts,
        ));
    }
    head.push_str("\r\n");

    let mut chunks = Vec::with_capacity(3);
    if advance_headers {
        chunks.push(Ok(Bytes::from(head)));
        chunks.push(Ok(Bytes::from(payload.to_vec())));
    } else {
        let mut combined = head.into_bytes();
        combined.extend_from_slice(payload);
        chunks.push(Ok(Bytes::from(combined)));
    }
    chunks.push(Ok(Bytes::from("\r\n")));
    chunks
}

fn base64_encode(input: &[u8]) -> String {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";
    let mut out = String::new();
    for chunk in input.chunks(3) {
        let b0 = chunk[0];
        let b1 = *chunk.get(1).unwrap_or(&0);
        let b2 = *chunk.get(2).unwrap_or(&0);
        out.push(ALPHABET[(b0 >> 2) as usize] as char);
        out.push(ALPHABET[(((b0 & 0x03) << 4) | (b1 >> 4)) as usize] as char);
        out.push(if chunk.len() > 1 {
            ALPHABET[(((b1 & 0x0f) << 2) | (b2 >> 6)) as usize] as char
        } else {
            '='
        });
        out.push(if chunk.len() > 2 {
            ALPHABET[(b2 & 0x3f) as usize] as char
        } else {
            '='
        });
    }
    out
}

const INDEX_HTML: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <title>ustreamerd</title>
</head>
<body style="margin:0;background:#000;display:flex;align-items:center;justify-content:center;min-height:100vh">
  <img src="/stream" alt="live stream" style="max-width:100vw;max-height:100vh">
</body>
</html>
"#;

#[cfg(test)]
mod tests {
    use super::*;

    fn test_state(config: ServerConfig) -> AppState {
        let (_tx, rx) = watch::channel(None);
        AppState::new(
            config,
            Arc::new(FpsInstrument::new()),
            Arc::new(BlankGenerator::default()),
            Arc::new(ClientRegistry::new()),
            rx,
        )
    }

    #[test]
    fn base64_matches_known_vector() {
        assert_eq!(base64_encode(b"admin:secret"), "YWRtaW46c2VjcmV0");
    }

    #[test]
    fn check_auth_passes_when_unconfigured() {
        let mut config = ServerConfig::default();
        config.stream.auth = None;
        let state = test_state(config);
        assert!(check_auth(&state, &HeaderMap::new()));
    }

    #[test]
    fn check_auth_rejects_wrong_credentials() {
        let mut config = ServerConfig::default();
        config.stream.auth = Some(crate::config::AuthConfig {
            user: "admin".into(),
            pass: "secret".into(),
        });
        let state = test_state(config);
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Basic d3Jvbmc=".parse().unwrap());
        assert!(!check_auth(&state, &headers));
    }

    #[test]
    fn unauthorized_response_names_the_realm() {
        let response = unauthorized();
        let value = response
            .headers()
            .get(header::WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .unwrap();
        assert_eq!(value, "Basic realm=\"Restricted area\"");
    }
}
