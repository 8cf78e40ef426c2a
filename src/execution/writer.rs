use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::data::types::SnapshotRecord;
use crate::execution::persistence::{SnapshotSink, WriteError};

/// Sink write totals, returned when the writer is closed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WriterSummary {
    pub written: u64,
    pub failed: u64,
}

/// Bounded background worker that applies records to the sinks off the poll path.
///
/// Sink writes are synchronous SQLite and file calls, so each record is written
/// on the blocking pool. A single worker drains the queue in submission order,
/// so writes for an instrument land in timestamp order and a slow write is never
/// overtaken. A full queue blocks `submit`, pushing back on the scheduler.
pub struct SnapshotWriter {
    tx: mpsc::Sender<SnapshotRecord>,
    handle: JoinHandle<WriterSummary>,
}

impl SnapshotWriter {
    pub fn spawn(sinks: Vec<Box<dyn SnapshotSink>>, capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<SnapshotRecord>(capacity);

        let handle = tokio::spawn(async move {
            let mut sinks = sinks;
            let mut summary = WriterSummary::default();

            while let Some(record) = rx.recv().await {
                let written = tokio::task::spawn_blocking(move || {
                    let result = write_all(&mut sinks, &record);
                    (sinks, result)
                })
                .await;

                match written {
                    Ok((returned, result)) => {
                        sinks = returned;
                        summary.written += result.written;
                        summary.failed += result.failed;
                    }
                    Err(e) => {
                        // Sinks went down with the panicking task
                        error!(error = %e, "snapshot sink panicked, writer stopped");
                        summary.failed += 1;
                        return summary;
                    }
                }
            }

            summary
        });

        Self { tx, handle }
    }

    pub async fn submit(&self, record: SnapshotRecord) -> Result<(), WriteError> {
        self.tx.send(record).await.map_err(|_| WriteError::Closed)
    }

    /// Stop accepting records, drain what is queued and release the sinks.
    pub async fn close(self) -> WriterSummary {
        drop(self.tx);
        match self.handle.await {
            Ok(summary) => summary,
            Err(e) => {
                error!(error = %e, "snapshot writer panicked");
                WriterSummary::default()
            }
        }
    }
}

fn write_all(sinks: &mut [Box<dyn SnapshotSink>], record: &SnapshotRecord) -> WriterSummary {
    let mut summary = WriterSummary::default();
    for sink in sinks.iter_mut() {
        match sink.write(record) {
            Ok(()) => {
                summary.written += 1;
                debug!(sink = sink.name(), instrument = %record.instrument, "record written");
            }
            Err(e) => {
                // Not retried: the value genuinely stabilized
                summary.failed += 1;
                error!(
                    sink = sink.name(),
                    instrument = %record.instrument,
                    value = %record.value,
                    error = %e,
                    "snapshot write failed"
                );
            }
        }
    }
    summary
}
