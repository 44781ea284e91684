//! Telemetry helpers for tracing spans and Prometheus metrics.

use std::{io, path::Path, sync::OnceLock, thread, time::Duration};

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::{
    filter::{EnvFilter, filter_fn},
    fmt,
    layer::SubscriberExt,
    prelude::*,
};

use crate::config::TelemetryOptions;

static PROM_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static PROM_UPKEEP_THREAD: OnceLock<thread::JoinHandle<()>> = OnceLock::new();

/// Guard returned when a telemetry subscriber has been installed for the current thread.
pub struct TelemetryGuard {
    _default_guard: tracing::subscriber::DefaultGuard,
    _chrome_guard: Option<tracing_chrome::FlushGuard>,
}

/// Ensure the global metrics recorder is installed and return the Prometheus handle.
pub fn init_metrics_recorder() -> &'static PrometheusHandle {
    PROM_HANDLE.get_or_init(|| {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();

        if let Err(err) = metrics::set_global_recorder(recorder) {
            tracing::warn!("metrics recorder already installed; /metrics will be empty: {err}");
        }
        describe_metrics();

        let upkeep_handle = handle.clone();
        match spawn_thread("prometheus-upkeep", move || {
            loop {
                thread::sleep(Duration::from_secs(5));
                upkeep_handle.run_upkeep();
            }
        }) {
            Ok(thread) => {
                let _ = PROM_UPKEEP_THREAD.set(thread);
            }
            Err(err) => tracing::warn!("failed to spawn prometheus upkeep thread: {err}"),
        }

        handle
    })
}

fn describe_metrics() {
    use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};

    describe_counter!(
        "photosphere_frames_captured_total",
        "Frames read from the video source"
    );
    describe_counter!(
        "photosphere_frames_dropped_total",
        "Frames evicted from the live queue before acceptance saw them"
    );
    describe_counter!(
        "photosphere_source_read_errors_total",
        "Transient video source read failures"
    );
    describe_counter!(
        "photosphere_frames_accepted_total",
        "Frames added to the frame store"
    );
    describe_counter!(
        "photosphere_frames_rejected_total",
        "Frames rejected by the acceptance gate, by reason"
    );
    describe_gauge!("photosphere_frame_store_len", "Frames held by the current session");
    describe_counter!(
        "photosphere_stitch_runs_total",
        "Fusion attempts, by outcome"
    );
    describe_histogram!(
        "photosphere_stitch_seconds",
        Unit::Seconds,
        "Wall time of one fusion attempt"
    );
    describe_counter!(
        "photosphere_stage_stalls_total",
        "Pipeline stages reported stalled by the watchdog"
    );
}

/// Access the Prometheus handle when already initialised.
pub fn prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROM_HANDLE.get()
}

/// Install the tracing subscriber for the current thread based on telemetry options.
pub fn enter_runtime(opts: &TelemetryOptions) -> TelemetryGuard {
    let default_level = if opts.verbose { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let (chrome_layer, chrome_guard) = match opts.chrome_trace_path.as_ref() {
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
    let fmt_layer = fmt::layer()
        .with_target(false)
        .with_timer(fmt::time::uptime())
        .with_filter(env_filter);

    // `Option<Layer>` is itself a layer, so a missing chrome writer is simply skipped.
    let default_guard = tracing::subscriber::set_default(
        tracing_subscriber::registry()
            .with(chrome_layer.map(|chrome| chrome.with_filter(span_only_filter)))
            .with(fmt_layer)
            .with(tracing_error::ErrorLayer::default()),
    );

    TelemetryGuard {
        _default_guard: default_guard,
        _chrome_guard: chrome_guard,
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

fn build_chrome_layer(
    path: &Path,
) -> Result<
    (
        tracing_chrome::ChromeLayer<tracing_subscriber::Registry>,
        tracing_chrome::FlushGuard,
    ),
    io::Error,
> {
    let file = std::fs::File::create(path)?;
    let (layer, guard) = tracing_chrome::ChromeLayerBuilder::new()
        .writer(file)
        .include_args(true)
        .trace_style(tracing_chrome::TraceStyle::Threaded)
        .build();
    Ok((layer, guard))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawned_threads_inherit_the_dispatcher() {
        let _guard = enter_runtime(&TelemetryOptions::default());
        let handle = spawn_thread("telemetry-test", || {
            tracing::dispatcher::get_default(|d| !d.is::<tracing::subscriber::NoSubscriber>())
        })
        .unwrap();
        assert!(handle.join().unwrap());
    }

    #[test]
    fn chrome_trace_file_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.json");
        {
            let _guard = enter_runtime(&TelemetryOptions {
                chrome_trace_path: Some(path.clone()),
                verbose: true,
            });
            tracing::info_span!("telemetry.test").in_scope(|| tracing::debug!("inside"));
        }
        assert!(path.exists());
    }
}
