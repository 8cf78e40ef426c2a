//! Sampling scheduler
//!
//! Wakes on a fixed cadence and drives one poll cycle:
//! Gate → Source → Tracker → Filter → Writer.
//!
//! The scheduler is the only owner of tracker state; nothing else mutates it.

use chrono::{DateTime, Local};
use rust_decimal::Decimal;
use std::collections::HashMap;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::SamplingSettings;
use crate::data::source::{ReadError, SnapshotSource};
use crate::data::types::{Instrument, Snapshot, SnapshotRecord};
use crate::execution::writer::{SnapshotWriter, WriterSummary};
use crate::stability::filter::ChangeFilter;
use crate::stability::gate::TradingHoursGate;
use crate::stability::tracker::StabilityTracker;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Starting,
    Running,
    Stopping,
    Stopped,
}

#[derive(Debug)]
pub enum CycleOutcome {
    /// Gate closed at poll or commit time; nothing read or mutated.
    MarketClosed,
    /// Read failed or timed out; state untouched, next cycle retries.
    ReadFailed(ReadError),
    Observed {
        observed: usize,
        invalid: usize,
        transitions: usize,
        recorded: usize,
    },
    /// Stop requested before the read returned, or already stopped.
    Stopped,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub cycles: u64,
    pub closed_cycles: u64,
    pub read_failures: u64,
    pub submitted: u64,
    pub writer: WriterSummary,
}

enum Sample {
    Closed,
    Failed(ReadError),
    Read {
        snapshot: Snapshot,
        observed_at: DateTime<Local>,
    },
}

pub struct SamplingScheduler<S, C> {
    settings: SamplingSettings,
    source: S,
    clock: C,
    tracker: StabilityTracker,
    filter: ChangeFilter,
    gate: TradingHoursGate,
    writer: Option<SnapshotWriter>,
    state: SchedulerState,
    summary: RunSummary,
    /// Set by a failed read; the next good read restarts every dwell clock.
    source_outage: bool,
}

impl<S: SnapshotSource, C: Clock> SamplingScheduler<S, C> {
    pub fn new(settings: SamplingSettings, source: S, clock: C, writer: SnapshotWriter) -> Self {
        Self {
            tracker: StabilityTracker::new(
                settings.stability_duration,
                settings.distinctness_epsilon,
            ),
            filter: ChangeFilter::new(settings.min_price_change),
            gate: TradingHoursGate::new(settings.trading_start, settings.trading_end),
            settings,
            source,
            clock,
            writer: Some(writer),
            state: SchedulerState::Starting,
            summary: RunSummary::default(),
            source_outage: false,
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> SchedulerState {
        self.state
    }

    #[cfg(test)]
    pub fn tracker(&self) -> &StabilityTracker {
        &self.tracker
    }

    /// Restore last persisted values as committed values.
    pub fn restore_baseline(&mut self, baseline: HashMap<Instrument, Decimal>) {
        for (instrument, value) in baseline {
            self.tracker.restore_committed(instrument, value);
        }
    }

    /// Run until the stop signal fires, then drain the writer.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> RunSummary {
        info!(
            poll_ms = self.settings.poll_interval.as_millis() as u64,
            dwell_ms = self.settings.stability_duration.as_millis() as u64,
            start = %self.settings.trading_start,
            end = %self.settings.trading_end,
            "sampling scheduler starting"
        );

        let delay = self.settings.startup_delay;
        if !delay.is_zero() {
            info!("Starting in {} seconds...", delay.as_secs());
            let stopped = tokio::select! {
                biased;
                _ = stop_signalled(&mut shutdown) => true,
                _ = tokio::time::sleep(delay) => false,
            };
            if stopped {
                return self.stop().await;
            }
        }

        let stopped = tokio::select! {
            biased;
            _ = stop_signalled(&mut shutdown) => true,
            _ = self.prime() => false,
        };
        if stopped {
            return self.stop().await;
        }

        self.state = SchedulerState::Running;
        let period = self.settings.poll_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!("sampling scheduler running");

        loop {
            let stopped = tokio::select! {
                biased;
                _ = stop_signalled(&mut shutdown) => true,
                _ = ticker.tick() => false,
            };
            if stopped {
                break;
            }

            match self.poll_once(&mut shutdown).await {
                CycleOutcome::Stopped => break,
                CycleOutcome::Observed {
                    observed,
                    invalid,
                    transitions,
                    recorded,
                } => debug!(observed, invalid, transitions, recorded, "cycle complete"),
                CycleOutcome::ReadFailed(e) => debug!(error = %e, "cycle skipped"),
                CycleOutcome::MarketClosed => {}
            }
        }

        self.stop().await
    }

    /// Seed candidate state from one read. Emits nothing.
    pub async fn prime(&mut self) -> bool {
        match self.sample().await {
            Sample::Closed => {
                info!("market closed at startup, priming skipped");
                false
            }
            Sample::Failed(e) => {
                warn!(error = %e, "priming read failed");
                false
            }
            Sample::Read {
                snapshot,
                observed_at,
            } => {
                let mut seeded = 0usize;
                for (instrument, reading) in &snapshot {
                    match self.tracker.observe(instrument, *reading, observed_at) {
                        Ok(_) => seeded += 1,
                        Err(e) => warn!(error = %e, "invalid observation while priming"),
                    }
                }
                info!(seeded, total = snapshot.len(), "candidate state primed");
                true
            }
        }
    }

    /// One full cycle: gate, read, observe, filter, submit.
    ///
    /// A stop signal abandons the read; once the read has returned, the cycle
    /// completes.
    pub async fn poll_once(&mut self, shutdown: &mut watch::Receiver<bool>) -> CycleOutcome {
        if self.state == SchedulerState::Stopped {
            return CycleOutcome::Stopped;
        }

        let sample = tokio::select! {
            biased;
            _ = stop_signalled(shutdown) => None,
            sample = self.sample() => Some(sample),
        };
        match sample {
            Some(sample) => self.commit(sample).await,
            None => {
                debug!("stop requested during read, poll abandoned");
                CycleOutcome::Stopped
            }
        }
    }

    /// Close the writer and wait for queued records. Terminal.
    pub async fn stop(&mut self) -> RunSummary {
        if self.state == SchedulerState::Stopped {
            return self.summary;
        }

        self.state = SchedulerState::Stopping;
        info!("sampling scheduler stopping");

        if let Some(writer) = self.writer.take() {
            self.summary.writer = writer.close().await;
        }

        self.state = SchedulerState::Stopped;
        info!(
            cycles = self.summary.cycles,
            closed = self.summary.closed_cycles,
            read_failures = self.summary.read_failures,
            submitted = self.summary.submitted,
            written = self.summary.writer.written,
            write_failures = self.summary.writer.failed,
            "sampling scheduler stopped"
        );
        self.summary
    }

    async fn sample(&mut self) -> Sample {
        let now = self.clock.now();
        if !self.gate.is_open(now) {
            debug!(now = %now, "outside trading hours, skipping cycle");
            return Sample::Closed;
        }

        let timeout = self.settings.read_timeout;
        let snapshot = match tokio::time::timeout(timeout, self.source.read()).await {
            Ok(Ok(snapshot)) => snapshot,
            Ok(Err(e)) => return Sample::Failed(e),
            Err(_) => return Sample::Failed(ReadError::Timeout(timeout)),
        };

        // Commit-time gate: a read that finishes after the close is discarded
        let observed_at = self.clock.now();
        if !self.gate.is_open(observed_at) {
            debug!(observed_at = %observed_at, "market closed during read, snapshot discarded");
            return Sample::Closed;
        }

        Sample::Read {
            snapshot,
            observed_at,
        }
    }

    async fn commit(&mut self, sample: Sample) -> CycleOutcome {
        self.summary.cycles += 1;

        let (snapshot, observed_at) = match sample {
            Sample::Closed => {
                self.summary.closed_cycles += 1;
                return CycleOutcome::MarketClosed;
            }
            Sample::Failed(e) => {
                self.summary.read_failures += 1;
                self.source_outage = true;
                warn!(error = %e, "source read failed, cycle skipped");
                return CycleOutcome::ReadFailed(e);
            }
            Sample::Read {
                snapshot,
                observed_at,
            } => (snapshot, observed_at),
        };

        // Time spent without readings never counts toward a dwell
        if self.source_outage {
            self.source_outage = false;
            self.tracker.restart_dwell(observed_at);
            info!(at = %observed_at, "source recovered, dwell restarted");
        }

        let mut observed = 0;
        let mut invalid = 0;
        let mut transitions = 0;
        let mut recorded = 0;

        for (instrument, reading) in snapshot {
            let transition = match self.tracker.observe(&instrument, reading, observed_at) {
                Ok(transition) => {
                    observed += 1;
                    transition
                }
                Err(e) => {
                    invalid += 1;
                    warn!(error = %e, "invalid observation skipped");
                    continue;
                }
            };
            let Some(transition) = transition else {
                continue;
            };
            transitions += 1;

            if !self.filter.is_significant(transition.old, transition.new) {
                debug!(
                    instrument = %transition.instrument,
                    old = ?transition.old,
                    new = %transition.new,
                    "stable move below minimum change, not recorded"
                );
                continue;
            }

            let record = SnapshotRecord::new(
                transition.instrument,
                transition.new,
                transition.old,
                transition.at,
            );
            info!(
                instrument = %record.instrument,
                value = %record.value,
                previous = ?record.previous_value,
                delta = ?record.delta,
                "stable value recorded"
            );

            let Some(writer) = &self.writer else {
                continue;
            };
            match writer.submit(record).await {
                Ok(()) => {
                    recorded += 1;
                    self.summary.submitted += 1;
                }
                Err(e) => error!(error = %e, "failed to queue snapshot"),
            }
        }

        CycleOutcome::Observed {
            observed,
            invalid,
            transitions,
            recorded,
        }
    }
}

/// Resolves once the stop flag is set or its sender is gone.
async fn stop_signalled(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
