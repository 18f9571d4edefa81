//! Actix Web server exposing the live event feed, snapshots, and metrics.
//!
//! The server runs on a dedicated thread so the producer loop never shares a
//! scheduler with HTTP handling. Each `/events` connection becomes a viewer
//! session in the registry for as long as the response stream lives.

use std::{net::SocketAddr, thread, time::Duration};

use actix_web::{
    App, HttpResponse, HttpServer,
    http::header,
    web::{self, Bytes},
};
use anyhow::{Context, Result, anyhow};
use async_stream::stream;
use posture::{CameraState, ClientSessionRegistry, telemetry};
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{error, info, warn};

use crate::sse::{KEEP_ALIVE, RETRY_PREAMBLE, SessionGuard, SseSink};

/// Comment line sent on idle streams so dead clients are noticed.
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Shared state backing HTTP handlers.
pub(crate) struct ServerState {
    pub(crate) registry: ClientSessionRegistry,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    camera_state: CameraState,
    sessions: usize,
    last_sequence: Option<u64>,
    last_captured_at_ms: Option<i64>,
}

/// Handle for the HTTP server thread.
pub(crate) struct StatusServer {
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
    local_addr: SocketAddr,
}

impl StatusServer {
    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Signal the server to stop and block until the thread exits.
    pub(crate) fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("HTTP server thread panicked");
            }
        }
    }
}

pub(crate) fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/events", web::get().to(events_handler))
        .route("/frame.jpg", web::get().to(frame_handler))
        .route("/status", web::get().to(status_handler))
        .route("/metrics", web::get().to(metrics_handler));
}

/// Bind `addr` and serve on a dedicated thread. Returns once the listener is
/// bound, or with the bind error.
pub(crate) fn spawn_server(
    addr: SocketAddr,
    registry: ClientSessionRegistry,
    shutdown_timeout: Duration,
) -> Result<StatusServer> {
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let (bound_tx, bound_rx) = crossbeam_channel::bounded::<std::io::Result<SocketAddr>>(1);
    let handle = telemetry::spawn_thread("posture-http", move || {
        let outcome = actix_web::rt::System::new().block_on(async move {
            let server = HttpServer::new(move || {
                App::new()
                    .app_data(web::Data::new(ServerState {
                        registry: registry.clone(),
                    }))
                    .configure(configure)
            })
            .workers(2)
            .shutdown_timeout(shutdown_timeout.as_secs().max(1))
            .bind(addr);
            let server = match server {
                Ok(server) => server,
                Err(err) => {
                    let _ = bound_tx.send(Err(err));
                    return Ok(());
                }
            };
            let local_addr = server.addrs().first().copied().unwrap_or(addr);
            let _ = bound_tx.send(Ok(local_addr));
            let server = server.run();

            let srv_handle = server.handle();
            actix_web::rt::spawn(async move {
                let _ = shutdown_rx.await;
                srv_handle.stop(true).await;
            });

            server.await
        });
        if let Err(err) = outcome {
            error!("HTTP server error: {err}");
        }
    })
    .context("Failed to spawn HTTP server thread")?;

    let local_addr = bound_rx
        .recv()
        .map_err(|_| anyhow!("HTTP server thread exited before binding"))?
        .with_context(|| format!("Failed to bind HTTP server to {addr}"))?;
    info!(%local_addr, "HTTP server listening");
    Ok(StatusServer {
        shutdown: Some(shutdown_tx),
        handle: Some(handle),
        local_addr,
    })
}

/// Open a viewer session and stream its events.
async fn events_handler(state: web::Data<ServerState>) -> HttpResponse {
    let (sink, mut rx) = SseSink::channel();
    let id = match state.registry.connect(Box::new(sink)) {
        Ok(id) => id,
        Err(err) => {
            error!("failed to start stream worker: {err}");
            return HttpResponse::ServiceUnavailable().body("viewer capacity exhausted");
        }
    };
    let guard = SessionGuard::new(state.registry.clone(), id);

    let stream = stream! {
        let _guard = guard;
        yield Ok::<Bytes, actix_web::Error>(Bytes::from_static(RETRY_PREAMBLE));
        loop {
            match actix_web::rt::time::timeout(KEEP_ALIVE_INTERVAL, rx.recv()).await {
                Ok(Some(chunk)) => yield Ok::<Bytes, actix_web::Error>(chunk),
                Ok(None) => break,
                Err(_) => yield Ok::<Bytes, actix_web::Error>(Bytes::from_static(KEEP_ALIVE)),
            }
        }
    };

    HttpResponse::Ok()
        .insert_header((header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"))
        .insert_header((header::ACCESS_CONTROL_ALLOW_METHODS, "GET"))
        .append_header(("Cache-Control", "no-cache"))
        .append_header(("Content-Type", "text/event-stream"))
        .append_header(("Connection", "keep-alive"))
        .streaming(stream)
}

/// Latest encoded frame, or 204 when none is available.
async fn frame_handler(state: web::Data<ServerState>) -> HttpResponse {
    match state
        .registry
        .frames()
        .latest()
        .and_then(|result| result.encoded_image.clone())
    {
        Some(jpeg) => HttpResponse::Ok()
            .append_header(("Cache-Control", "no-cache"))
            .content_type("image/jpeg")
            .body(jpeg),
        None => HttpResponse::NoContent().finish(),
    }
}

async fn status_handler(state: web::Data<ServerState>) -> HttpResponse {
    let latest = state.registry.frames().latest();
    HttpResponse::Ok().json(StatusResponse {
        camera_state: state.registry.camera_state().get(),
        sessions: state.registry.len(),
        last_sequence: latest.as_ref().map(|result| result.sequence),
        last_captured_at_ms: latest
            .as_ref()
            .map(|result| result.captured_at.timestamp_millis()),
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
