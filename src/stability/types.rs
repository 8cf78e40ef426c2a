use chrono::{DateTime, Local};
use rust_decimal::Decimal;

use crate::data::types::Instrument;

/// Per-instrument dwell state, owned by the tracker.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateState {
    pub candidate_value: Decimal,
    pub candidate_since: DateTime<Local>,
    pub committed_value: Option<Decimal>,
}

/// A value that has dwelt long enough to replace the committed value.
#[derive(Debug, Clone, PartialEq)]
pub struct StableTransition {
    pub instrument: Instrument,
    pub old: Option<Decimal>,
    pub new: Decimal,
    pub at: DateTime<Local>,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum InvalidObservation {
    #[error("{0}: missing reading")]
    Missing(Instrument),

    #[error("{instrument}: non-finite reading {value}")]
    NonFinite { instrument: Instrument, value: f64 },

    #[error("{instrument}: reading {value} out of decimal range")]
    OutOfRange { instrument: Instrument, value: f64 },
}
