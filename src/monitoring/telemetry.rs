use std::fs;
use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Daily-rotated files under the log directory, one per component.
const LOG_FILES: [(&str, &str); 3] = [
    ("spread-recorder.log", "spread_recorder=debug,info"),
    (
        "database.log",
        "spread_recorder::execution::persistence=debug,spread_recorder::execution::writer=debug",
    ),
    (
        "source.log",
        "spread_recorder::data=debug,spread_recorder::execution::scheduler=warn",
    ),
];

/// Must be held for the life of the process; dropping it loses buffered file logs.
pub struct TelemetryGuards {
    _file_guards: Vec<WorkerGuard>,
}

/// Install the global tracing subscriber. `RUST_LOG` overrides the default `info`
/// on the console. With a log directory, component files are written alongside.
pub fn init_tracing(json: bool, log_dir: Option<&Path>) -> TelemetryGuards {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let base = fmt::layer().with_target(true).with_line_number(true);
    let console: BoxedLayer = if json {
        base.json().with_filter(env_filter).boxed()
    } else {
        base.with_filter(env_filter).boxed()
    };

    let (mut layers, guards) = match log_dir {
        Some(dir) => file_layers(dir),
        None => (Vec::new(), Vec::new()),
    };
    layers.push(console);

    tracing_subscriber::registry().with(layers).init();

    TelemetryGuards {
        _file_guards: guards,
    }
}

fn file_layers(dir: &Path) -> (Vec<BoxedLayer>, Vec<WorkerGuard>) {
    // Best effort: console logging still works without the directory
    let _ = fs::create_dir_all(dir);

    let mut layers = Vec::new();
    let mut guards = Vec::new();
    for (file, directives) in LOG_FILES {
        let appender = tracing_appender::rolling::daily(dir, file);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        guards.push(guard);

        layers.push(
            fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true)
                .with_thread_ids(true)
                .with_filter(EnvFilter::new(directives))
                .boxed(),
        );
    }
    (layers, guards)
}
