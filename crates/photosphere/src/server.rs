//! Actix Web preview server exposing the live view, the panorama, status and controls.
//!
//! The server runs on a dedicated thread to keep the capture loops free from Actix
//! runtime concerns. It only reads shared state; control endpoints forward a
//! [`ControlRequest`] to the consumer that owns the pipeline and wait for its reply.

use std::{
    net::SocketAddr,
    path::PathBuf,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use actix_web::{
    App, HttpResponse, HttpServer,
    http::header,
    web::{self, Bytes},
};
use anyhow::{Context, Result, anyhow};
use async_stream::stream;
use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{error, info};
use video_ingest::Frame;

use crate::{
    events::{SharedBoard, StatusBoard},
    panorama::PanoramaSlot,
    preview::{JPEG_QUALITY, LivePreview, encode_jpeg, render_overlay},
    session::SessionState,
    telemetry,
};

const CONTROL_REPLY_TIMEOUT: Duration = Duration::from_secs(10);
const STREAM_INTERVAL: Duration = Duration::from_millis(33);

const INDEX_HTML: &str = r#"<!doctype html>
<html>
<head><meta charset="utf-8"><title>Photosphere</title>
<style>body{background:#111;color:#eee;font-family:sans-serif}img{max-width:100%}</style></head>
<body>
<h1>Photosphere</h1>
<img src="/stream.mjpg" alt="live view">
<pre id="status"></pre>
<img id="pano" src="/panorama.jpg" alt="panorama">
<p>
<button onclick="fetch('/start',{method:'POST'})">Start</button>
<button onclick="fetch('/clear',{method:'POST'})">Clear</button>
<button onclick="fetch('/end',{method:'POST'})">End &amp; save</button>
<button onclick="fetch('/save',{method:'POST'})">Save</button>
</p>
<script>
let generation = -1;
setInterval(async () => {
  const status = await (await fetch('/status')).json();
  document.getElementById('status').textContent = JSON.stringify(status, null, 2);
  if (status.generation !== generation) {
    generation = status.generation;
    document.getElementById('pano').src = '/panorama.jpg?g=' + generation;
  }
}, 1000);
</script>
</body>
</html>"#;

/// Operator commands accepted over HTTP.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControlCommand {
    /// Start a new session from Idle or Ended.
    Start,
    Clear,
    /// End the session and save to `path`, or to the configured output.
    End { path: Option<PathBuf> },
    Save { path: Option<PathBuf> },
}

/// A command plus the channel its outcome is reported on.
#[derive(Debug)]
pub struct ControlRequest {
    pub command: ControlCommand,
    pub reply: oneshot::Sender<Result<String, String>>,
}

/// Shared state backing HTTP handlers.
#[derive(Clone)]
pub struct ServerState {
    pub live: Arc<LivePreview>,
    pub panorama: Arc<PanoramaSlot>,
    pub board: SharedBoard,
    pub commands: Sender<ControlRequest>,
    pano_cache: Arc<Mutex<Option<(u64, Bytes)>>>,
}

impl ServerState {
    pub fn new(
        live: Arc<LivePreview>,
        panorama: Arc<PanoramaSlot>,
        board: SharedBoard,
        commands: Sender<ControlRequest>,
    ) -> Self {
        Self {
            live,
            panorama,
            board,
            commands,
            pano_cache: Arc::new(Mutex::new(None)),
        }
    }

    fn board(&self) -> StatusBoard {
        self.board
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// JPEG of the current panorama, re-encoded only when the generation changes.
    fn panorama_jpeg(&self) -> Option<Bytes> {
        let snapshot = self.panorama.snapshot();
        let image = snapshot.image?;
        let mut cache = self.pano_cache.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some((generation, bytes)) = cache.as_ref() {
            if *generation == snapshot.generation {
                return Some(bytes.clone());
            }
        }
        match encode_jpeg(&image, JPEG_QUALITY) {
            Ok(jpeg) => {
                let bytes = Bytes::from(jpeg);
                *cache = Some((snapshot.generation, bytes.clone()));
                Some(bytes)
            }
            Err(err) => {
                error!("Panorama encode failed: {err}");
                None
            }
        }
    }
}

/// Handle for the preview server thread.
pub struct PreviewServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl PreviewServer {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signal the server to stop and block until the thread exits.
    pub fn stop(mut self) {
        self.shutdown_and_join();
    }

    fn shutdown_and_join(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for PreviewServer {
    fn drop(&mut self) {
        self.shutdown_and_join();
    }
}

#[derive(Deserialize)]
struct PathQuery {
    path: Option<PathBuf>,
}

#[derive(Serialize)]
struct StatusResponse {
    #[serde(flatten)]
    board: StatusBoard,
    stitch_attempts: u64,
    has_panorama: bool,
}

/// Spawn the preview server thread, returning once the listener is bound.
pub fn spawn_preview_server(addr: SocketAddr, state: ServerState) -> Result<PreviewServer> {
    let (ready_tx, ready_rx) = crossbeam_channel::bounded::<std::io::Result<SocketAddr>>(1);
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let data = web::Data::new(state);

    let handle = telemetry::spawn_thread("photosphere-preview-server", move || {
        let result = actix_web::rt::System::new().block_on(async move {
            let bound = HttpServer::new(move || {
                App::new()
                    .app_data(data.clone())
                    .route("/", web::get().to(index_route))
                    .route("/frame.jpg", web::get().to(frame_handler))
                    .route("/stream.mjpg", web::get().to(stream_handler))
                    .route("/panorama.jpg", web::get().to(panorama_handler))
                    .route("/status", web::get().to(status_handler))
                    .route("/metrics", web::get().to(metrics_handler))
                    .route("/start", web::post().to(start_handler))
                    .route("/clear", web::post().to(clear_handler))
                    .route("/end", web::post().to(end_handler))
                    .route("/save", web::post().to(save_handler))
            })
            .workers(2)
            .bind(addr);

            let server = match bound {
                Ok(server) => {
                    let local = server.addrs().first().copied().unwrap_or(addr);
                    let _ = ready_tx.send(Ok(local));
                    server.run()
                }
                Err(err) => {
                    let _ = ready_tx.send(Err(err));
                    return Ok(());
                }
            };

            let srv_handle = server.handle();
            actix_web::rt::spawn(async move {
                let _ = shutdown_rx.await;
                srv_handle.stop(true).await;
            });

            server.await
        });
        if let Err(err) = result {
            error!("HTTP server error: {err}");
        }
    })
    .context("Failed to spawn preview server thread")?;

    let mut server = PreviewServer {
        addr,
        shutdown: Some(shutdown_tx),
        handle: Some(handle),
    };
    match ready_rx.recv_timeout(Duration::from_secs(5)) {
        Ok(Ok(local)) => {
            info!("Preview server listening on http://{local}");
            server.addr = local;
            Ok(server)
        }
        Ok(Err(err)) => Err(err).with_context(|| format!("failed to bind preview server on {addr}")),
        Err(_) => Err(anyhow!("preview server on {addr} did not start")),
    }
}

fn overlay_jpeg(frame: &Frame, board: &StatusBoard) -> Option<Vec<u8>> {
    let recording = board.state == SessionState::Capturing;
    let image = render_overlay(frame, board.total_frames, recording);
    match encode_jpeg(&image, JPEG_QUALITY) {
        Ok(jpeg) => Some(jpeg),
        Err(err) => {
            error!("Live frame encode failed: {err}");
            None
        }
    }
}

/// Serve the control page.
async fn index_route() -> HttpResponse {
    HttpResponse::Ok()
        .content_type("text/html; charset=utf-8")
        .body(INDEX_HTML)
}

/// Return the latest live frame with the capture overlay.
async fn frame_handler(state: web::Data<ServerState>) -> HttpResponse {
    let Some(frame) = state.live.latest() else {
        return HttpResponse::NoContent().finish();
    };
    let board = state.board();
    match web::block(move || overlay_jpeg(&frame, &board)).await {
        Ok(Some(jpeg)) => HttpResponse::Ok()
            .insert_header((header::CACHE_CONTROL, "no-cache"))
            .content_type("image/jpeg")
            .body(jpeg),
        _ => HttpResponse::InternalServerError().finish(),
    }
}

/// Stream the live view over a multipart response at roughly 30 Hz.
async fn stream_handler(state: web::Data<ServerState>) -> HttpResponse {
    let state = state.clone();
    let stream = stream! {
        let mut interval = actix_web::rt::time::interval(STREAM_INTERVAL);
        let mut last: Option<Frame> = None;
        loop {
            interval.tick().await;
            let Some(frame) = state.live.latest() else {
                continue;
            };
            if last.as_ref().is_some_and(|prev| prev.shares_pixels(&frame)) {
                continue;
            }
            last = Some(frame.clone());
            let board = state.board();
            let sequence = frame.sequence();
            let Ok(Some(jpeg)) = web::block(move || overlay_jpeg(&frame, &board)).await else {
                continue;
            };
            let mut payload = Vec::with_capacity(jpeg.len() + 64);
            payload.extend_from_slice(b"--frame\r\n");
            payload.extend_from_slice(format!("X-Sequence: {sequence}\r\n").as_bytes());
            payload.extend_from_slice(b"Content-Type: image/jpeg\r\n\r\n");
            payload.extend_from_slice(&jpeg);
            payload.extend_from_slice(b"\r\n");
            yield Ok::<Bytes, actix_web::Error>(Bytes::from(payload));
        }
    };

    HttpResponse::Ok()
        .insert_header((header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"))
        .append_header(("Cache-Control", "no-cache"))
        .append_header(("Content-Type", "multipart/x-mixed-replace; boundary=frame"))
        .streaming(stream)
}

async fn panorama_handler(state: web::Data<ServerState>) -> HttpResponse {
    let state = state.clone();
    match web::block(move || state.panorama_jpeg()).await {
        Ok(Some(jpeg)) => HttpResponse::Ok()
            .insert_header((header::CACHE_CONTROL, "no-cache"))
            .content_type("image/jpeg")
            .body(jpeg),
        Ok(None) => HttpResponse::NoContent().finish(),
        Err(_) => HttpResponse::InternalServerError().finish(),
    }
}

async fn status_handler(state: web::Data<ServerState>) -> HttpResponse {
    let snapshot = state.panorama.snapshot();
    HttpResponse::Ok().json(StatusResponse {
        board: state.board(),
        stitch_attempts: snapshot.attempts,
        has_panorama: !snapshot.is_empty(),
    })
}

async fn metrics_handler() -> HttpResponse {
    match telemetry::prometheus_handle() {
        Some(handle) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(handle.render()),
        None => HttpResponse::ServiceUnavailable().body("metrics recorder not installed"),
    }
}

async fn start_handler(state: web::Data<ServerState>) -> HttpResponse {
    forward(&state, ControlCommand::Start).await
}

async fn clear_handler(state: web::Data<ServerState>) -> HttpResponse {
    forward(&state, ControlCommand::Clear).await
}

async fn end_handler(state: web::Data<ServerState>, query: web::Query<PathQuery>) -> HttpResponse {
    let path = query.into_inner().path;
    forward(&state, ControlCommand::End { path }).await
}

async fn save_handler(state: web::Data<ServerState>, query: web::Query<PathQuery>) -> HttpResponse {
    let path = query.into_inner().path;
    forward(&state, ControlCommand::Save { path }).await
}

/// Hands `command` to the pipeline owner and maps its reply onto a response.
async fn forward(state: &ServerState, command: ControlCommand) -> HttpResponse {
    let (reply_tx, reply_rx) = oneshot::channel();
    let request = ControlRequest {
        command,
        reply: reply_tx,
    };
    if state.commands.send(request).is_err() {
        return HttpResponse::ServiceUnavailable().body("capture controller is not running");
    }
    match actix_web::rt::time::timeout(CONTROL_REPLY_TIMEOUT, reply_rx).await {
        Ok(Ok(Ok(message))) => HttpResponse::Ok().body(message),
        Ok(Ok(Err(message))) => HttpResponse::Conflict().body(message),
        Ok(Err(_)) => HttpResponse::ServiceUnavailable().body("capture controller went away"),
        Err(_) => HttpResponse::GatewayTimeout().body("capture controller did not answer"),
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::{Read, Write},
        net::TcpStream,
        thread,
    };

    use image::{Rgb, RgbImage};

    use super::*;

    fn get(addr: SocketAddr, method: &str, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).unwrap();
        write!(
            stream,
            "{method} {path} HTTP/1.1\r\nHost: localhost\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
        )
        .unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).unwrap();
        String::from_utf8_lossy(&response).into_owned()
    }

    fn server() -> (PreviewServer, ServerState, crossbeam_channel::Receiver<ControlRequest>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let state = ServerState::new(
            Arc::new(LivePreview::default()),
            Arc::new(PanoramaSlot::new()),
            Arc::new(Mutex::new(StatusBoard::default())),
            tx,
        );
        let server =
            spawn_preview_server(SocketAddr::from(([127, 0, 0, 1], 0)), state.clone()).unwrap();
        (server, state, rx)
    }

    #[test]
    fn status_and_empty_panorama() {
        let (server, state, _rx) = server();
        let status = get(server.addr(), "GET", "/status");
        assert!(status.starts_with("HTTP/1.1 200"));
        assert!(status.contains("\"state\":\"idle\""));
        assert!(get(server.addr(), "GET", "/panorama.jpg").starts_with("HTTP/1.1 204"));

        state.panorama.publish_success(RgbImage::from_pixel(16, 8, Rgb([1, 2, 3])));
        let pano = get(server.addr(), "GET", "/panorama.jpg");
        assert!(pano.starts_with("HTTP/1.1 200"));
        assert!(pano.contains("image/jpeg"));
        server.stop();
    }

    #[test]
    fn control_requests_reach_the_owner() {
        let (server, _state, rx) = server();
        let owner = thread::spawn(move || {
            let request = rx.recv().unwrap();
            let echoed = request.command.clone();
            request.reply.send(Err("no panorama to save".into())).unwrap();
            echoed
        });
        let response = get(server.addr(), "POST", "/end?path=out.png");
        assert!(response.starts_with("HTTP/1.1 409"));
        assert!(response.contains("no panorama to save"));
        assert_eq!(
            owner.join().unwrap(),
            ControlCommand::End {
                path: Some(PathBuf::from("out.png"))
            }
        );
        server.stop();
    }
}
