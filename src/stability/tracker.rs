use chrono::{DateTime, Local};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

use crate::data::types::{Instrument, Reading};
use crate::stability::types::{CandidateState, InvalidObservation, StableTransition};

const PRICE_SCALE: u32 = 10;

/// Largest accepted magnitude. Keeps every difference of two readings inside `Decimal`.
const MAX_ABS_READING: f64 = 1e18;

/// Per-instrument state machine deciding when a reading becomes the committed value.
///
/// A value must stay within `distinctness_epsilon` of its candidate for at
/// least `stability_duration` before it is committed. Any larger move restarts
/// the dwell clock, even if it lands back on the committed value.
#[derive(Debug)]
pub struct StabilityTracker {
    stability_duration: Duration,
    distinctness_epsilon: Decimal,
    states: HashMap<Instrument, CandidateState>,
    /// Committed values recovered from storage, applied on first observation.
    baseline: HashMap<Instrument, Decimal>,
}

impl StabilityTracker {
    pub fn new(stability_duration: Duration, distinctness_epsilon: Decimal) -> Self {
        Self {
            stability_duration,
            distinctness_epsilon,
            states: HashMap::new(),
            baseline: HashMap::new(),
        }
    }

    /// Seed the committed value for an instrument not yet observed.
    pub fn restore_committed(&mut self, instrument: Instrument, value: Decimal) {
        if !self.states.contains_key(&instrument) {
            self.baseline.insert(instrument, value);
        }
    }

    /// Restart every dwell clock at `now`. Candidates and committed values are kept.
    pub fn restart_dwell(&mut self, now: DateTime<Local>) {
        for state in self.states.values_mut() {
            state.candidate_since = now;
        }
        debug!(instruments = self.states.len(), "dwell clocks restarted");
    }

    #[cfg(test)]
    pub fn state(&self, instrument: &str) -> Option<&CandidateState> {
        self.states.get(instrument)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn observe(
        &mut self,
        instrument: &str,
        reading: Reading,
        now: DateTime<Local>,
    ) -> Result<Option<StableTransition>, InvalidObservation> {
        let value = to_decimal(instrument, reading)?;

        let state = match self.states.entry(instrument.to_string()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                entry.insert(CandidateState {
                    candidate_value: value,
                    candidate_since: now,
                    committed_value: self.baseline.remove(instrument),
                });
                debug!(instrument, value = %value, "first candidate");
                return Ok(None);
            }
        };

        if exceeds(value, state.candidate_value, self.distinctness_epsilon) {
            debug!(
                instrument,
                from = %state.candidate_value,
                to = %value,
                "candidate changed, dwell restarted"
            );
            state.candidate_value = value;
            state.candidate_since = now;
            return Ok(None);
        }

        let dwelt = (now - state.candidate_since)
            .to_std()
            .map(|age| age >= self.stability_duration)
            .unwrap_or(false);
        if !dwelt {
            return Ok(None);
        }

        let changed = match state.committed_value {
            None => true,
            Some(committed) => exceeds(value, committed, self.distinctness_epsilon),
        };
        if !changed {
            return Ok(None);
        }

        let old = state.committed_value.replace(value);
        Ok(Some(StableTransition {
            instrument: instrument.to_string(),
            old,
            new: value,
            at: now,
        }))
    }
}

/// An overflowing difference counts as a distinct value.
fn exceeds(a: Decimal, b: Decimal, epsilon: Decimal) -> bool {
    a.checked_sub(b).map_or(true, |d| d.abs() > epsilon)
}

fn to_decimal(instrument: &str, reading: Reading) -> Result<Decimal, InvalidObservation> {
    let value = reading.ok_or_else(|| InvalidObservation::Missing(instrument.to_string()))?;
    if !value.is_finite() {
        return Err(InvalidObservation::NonFinite {
            instrument: instrument.to_string(),
            value,
        });
    }
    if value.abs() > MAX_ABS_READING {
        return Err(InvalidObservation::OutOfRange {
            instrument: instrument.to_string(),
            value,
        });
    }
    // Sheet prices carry far fewer digits; drop binary noise
    Decimal::from_f64(value)
        .map(|d| d.round_dp(PRICE_SCALE).normalize())
        .ok_or_else(|| InvalidObservation::OutOfRange {
            instrument: instrument.to_string(),
            value,
        })
}
