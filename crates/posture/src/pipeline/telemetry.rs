//! Telemetry helpers for tracing spans, Prometheus metrics, and Chrome traces.

use std::{
    io,
    path::{Path, PathBuf},
    sync::OnceLock,
    thread,
    time::Duration,
};

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::{
    filter::{EnvFilter, filter_fn},
    fmt,
    prelude::*,
};

use crate::pipeline::config::TelemetryOptions;

static PROM_HANDLE: OnceLock<Option<PrometheusHandle>> = OnceLock::new();
static PROM_UPKEEP_THREAD: OnceLock<thread::JoinHandle<()>> = OnceLock::new();

/// Keeps the Chrome trace writer alive; dropping it flushes the trace file.
pub struct TelemetryGuard {
    chrome_guard: Option<tracing_chrome::FlushGuard>,
    chrome_trace_path: Option<PathBuf>,
}

/// Ensure the global metrics recorder is installed and return the Prometheus
/// handle. Returns `None` when another recorder already owns the facade.
pub fn init_metrics_recorder() -> Option<&'static PrometheusHandle> {
    PROM_HANDLE
        .get_or_init(|| {
            let recorder = PrometheusBuilder::new().build_recorder();
            let handle = recorder.handle();

            if let Err(err) = metrics::set_global_recorder(recorder) {
                tracing::warn!("metrics recorder not installed: {err}");
                return None;
            }
            describe_metrics();

            let upkeep_handle = handle.clone();
            let upkeep = spawn_thread("prometheus-upkeep", move || {
                loop {
                    thread::sleep(Duration::from_secs(5));
                    upkeep_handle.run_upkeep();
                }
            });
            match upkeep {
                Ok(join) => {
                    let _ = PROM_UPKEEP_THREAD.set(join);
                }
                Err(err) => tracing::warn!("failed to spawn prometheus upkeep thread: {err}"),
            }

            Some(handle)
        })
        .as_ref()
}

/// Access the Prometheus handle when already initialised.
pub fn prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROM_HANDLE.get().and_then(Option::as_ref)
}

fn describe_metrics() {
    metrics::describe_counter!("posture_frames_total", "Posture results published");
    metrics::describe_counter!(
        "posture_acquisition_faults_total",
        "Failed camera reads or reopen attempts"
    );
    metrics::describe_counter!(
        "posture_processing_faults_total",
        "Assessor errors and panics"
    );
    metrics::describe_counter!(
        "posture_delivery_faults_total",
        "Events that could not be delivered to a viewer"
    );
    metrics::describe_counter!("posture_heartbeats_total", "Heartbeats offered to the supervisor");
    metrics::describe_counter!(
        "posture_heartbeat_failures_total",
        "Heartbeats the supervisor socket rejected"
    );
    metrics::describe_counter!(
        "posture_camera_reopen_attempts_total",
        "Camera reopen attempts by recovery tier"
    );
    metrics::describe_gauge!(
        "posture_camera_state",
        "Camera state: 0 disconnected, 1 degraded, 2 connected"
    );
    metrics::describe_gauge!("posture_viewer_sessions", "Registered viewer sessions");
    metrics::describe_histogram!(
        "posture_iteration_seconds",
        metrics::Unit::Seconds,
        "Duration of producer iterations that published a result"
    );
}

/// Install the process-wide tracing subscriber.
///
/// `RUST_LOG` overrides the default `info` filter. When a Chrome trace path
/// is configured, spans are also written there until the guard drops.
pub fn init(opts: &TelemetryOptions) -> TelemetryGuard {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (chrome_layer, chrome_guard) = match opts.chrome_trace_path.as_deref() {
        Some(path) => match build_chrome_layer(path) {
            Ok((layer, guard)) => (Some(layer), Some(guard)),
            Err(err) => {
                eprintln!(
                    "failed to initialise chrome trace writer at {}: {err}",
                    path.display()
                );
                (None, None)
            }
        },
        None => (None, None),
    };

    let span_only_filter = filter_fn(|metadata| metadata.is_span());
    let installed = tracing_subscriber::registry()
        .with(chrome_layer.map(|layer| layer.with_filter(span_only_filter)))
        .with(
            fmt::layer()
                .with_target(false)
                .with_timer(fmt::time::uptime())
                .with_filter(env_filter),
        )
        .try_init();
    if let Err(err) = installed {
        tracing::debug!("tracing subscriber already installed: {err}");
    }

    TelemetryGuard {
        chrome_guard,
        chrome_trace_path: opts.chrome_trace_path.clone(),
    }
}

/// Spawn a thread that inherits the current tracing dispatcher.
pub fn spawn_thread<F, T>(name: impl Into<String>, f: F) -> io::Result<thread::JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let dispatch = tracing::dispatcher::get_default(|current| current.clone());
    thread::Builder::new()
        .name(name.into())
        .spawn(move || tracing::dispatcher::with_default(&dispatch, f))
}

fn build_chrome_layer<S>(
    path: &Path,
) -> io::Result<(tracing_chrome::ChromeLayer<S>, tracing_chrome::FlushGuard)>
where
    S: tracing::Subscriber + for<'span> tracing_subscriber::registry::LookupSpan<'span> + Send + Sync,
{
    let file = std::fs::File::create(path)?;
    let (layer, guard) = tracing_chrome::ChromeLayerBuilder::new()
        .writer(file)
        .include_args(true)
        .trace_style(tracing_chrome::TraceStyle::Threaded)
        .build();
    Ok((layer, guard))
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(guard) = self.chrome_guard.take() {
            guard.flush();
            drop(guard);
            if let Some(path) = self.chrome_trace_path.as_ref() {
                tracing::info!("chrome trace written to {}", path.display());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    };

    use super::*;

    #[test]
    fn spawned_thread_carries_name() {
        let handle = spawn_thread("posture-test-worker", || {
            thread::current().name().map(str::to_string)
        })
        .expect("spawn");
        assert_eq!(
            handle.join().expect("join").as_deref(),
            Some("posture-test-worker")
        );
    }

    #[test]
    fn spawned_thread_inherits_scoped_dispatcher() {
        let seen = Arc::new(AtomicBool::new(false));
        let subscriber = tracing_subscriber::registry().with(
            fmt::layer()
                .with_writer(io::sink)
                .with_filter(filter_fn({
                    let seen = Arc::clone(&seen);
                    move |_| {
                        seen.store(true, Ordering::SeqCst);
                        true
                    }
                })),
        );
        tracing::subscriber::with_default(subscriber, || {
            spawn_thread("posture-test-dispatch", || tracing::info!("from worker"))
                .expect("spawn")
                .join()
                .expect("join");
        });
        assert!(seen.load(Ordering::SeqCst));
    }
}
