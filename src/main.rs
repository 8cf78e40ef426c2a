mod clock;
mod config;
mod data;
mod execution;
mod monitoring;
mod stability;

use anyhow::Result;
use chrono::Local;
use config::{Config, EnvConfig, SamplingSettings};
use execution::persistence::{SnapshotDatabase, SnapshotSink};
use execution::scheduler::SamplingScheduler;
use execution::writer::SnapshotWriter;
use monitoring::logger::CsvLogger;
use std::future::Future;
use std::path::Path;
use tokio::sync::watch;

#[tokio::main]
async fn main() -> Result<()> {
    let env_config = EnvConfig::load();
    let _telemetry = monitoring::telemetry::init_tracing(
        env_config.log_json,
        env_config.log_dir.as_deref().map(Path::new),
    );

    tracing::info!("📈 Spread recorder starting...");

    // Load configuration
    tracing::info!("Loading configuration from {}", env_config.config_path);
    let config = Config::load(&env_config.config_path)?;
    let settings = SamplingSettings::from_config(&config)?;

    tracing::info!("Source: {}", config.source.path);
    tracing::info!(
        "Trading hours: {} - {}",
        settings.trading_start,
        settings.trading_end
    );
    tracing::info!(
        "Poll every {:?}, stable after {:?}, min change {}",
        settings.poll_interval,
        settings.stability_duration,
        settings.min_price_change
    );

    // Initialize database
    let database_path = env_config
        .database_path
        .clone()
        .unwrap_or_else(|| config.system.database_path.clone());
    tracing::info!("Initializing database: {}", database_path);
    let db = SnapshotDatabase::new(&database_path)?;

    let baseline = if config.persistence.restore_baseline {
        execution::persistence::recover_committed_values(&db)?
    } else {
        Default::default()
    };

    let mut sinks: Vec<Box<dyn SnapshotSink>> = vec![Box::new(db)];
    if config.monitoring.csv_logging {
        tracing::info!("CSV logging to {}", config.monitoring.csv_log_path);
        sinks.push(Box::new(CsvLogger::new(
            config.monitoring.csv_log_path.clone(),
        )?));
    }
    let writer = SnapshotWriter::spawn(sinks, settings.queue_capacity);

    let source = data::source::JsonFileSource::new(&config.source.path);
    let mut scheduler = SamplingScheduler::new(settings, source, clock::SystemClock, writer);
    scheduler.restore_baseline(baseline);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown = shutdown_signal()?;
    tokio::spawn(async move {
        match shutdown.await {
            Ok(signal) => {
                tracing::info!("{} received, shutting down...", signal);
                let _ = shutdown_tx.send(true);
            }
            Err(e) => {
                // Dropping the sender would stop the scheduler
                tracing::error!("Failed to install signal handlers: {}", e);
                std::future::pending::<()>().await;
            }
        }
    });

    tracing::info!("✅ Recorder initialized successfully");
    let session_start = Local::now();
    let summary = scheduler.run(shutdown_rx).await;

    tracing::info!(
        "Recorded {} snapshots over {} cycles ({} written, {} write failures)",
        summary.submitted,
        summary.cycles,
        summary.writer.written,
        summary.writer.failed
    );

    // Writer is drained; reopen for the session report
    match SnapshotDatabase::new(&database_path)
        .and_then(|db| execution::persistence::session_report(&db, session_start))
    {
        Ok(report) => log_session_report(&report),
        Err(e) => tracing::warn!("Failed to build session report: {:#}", e),
    }

    Ok(())
}

/// Resolves on Ctrl-C or SIGTERM. The SIGTERM handler is installed on call.
#[cfg(unix)]
fn shutdown_signal() -> std::io::Result<impl Future<Output = std::io::Result<&'static str>>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    Ok(async move {
        tokio::select! {
            result = tokio::signal::ctrl_c() => result.map(|_| "Ctrl-C"),
            _ = sigterm.recv() => Ok("SIGTERM"),
        }
    })
}

#[cfg(not(unix))]
fn shutdown_signal() -> std::io::Result<impl Future<Output = std::io::Result<&'static str>>> {
    Ok(async { tokio::signal::ctrl_c().await.map(|_| "Ctrl-C") })
}

fn log_session_report(report: &execution::persistence::SessionReport) {
    tracing::info!(
        "Database: {} snapshots across {} instruments ({:?} to {:?})",
        report.stats.total_snapshots,
        report.stats.unique_instruments,
        report.stats.oldest_record,
        report.stats.newest_record
    );
    tracing::info!("This session recorded {} snapshots", report.recorded.len());

    for summary in &report.summaries {
        tracing::info!(
            "  {}: {} updates, avg change {}, range {} - {}",
            summary.instrument,
            summary.updates,
            summary
                .avg_change
                .map(|c| c.to_string())
                .unwrap_or_else(|| "n/a".to_string()),
            summary.min_value,
            summary.max_value
        );
    }

    for record in &report.largest_moves {
        tracing::info!(
            "  Largest move: {} {:?} -> {} at {}",
            record.instrument,
            record.previous_value,
            record.value,
            record.recorded_at
        );
    }
}
