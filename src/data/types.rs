use chrono::{DateTime, Local};
use rust_decimal::Decimal;
use std::collections::BTreeMap;

/// Key of a tracked quote, e.g. `"AHD JUL24-AUG24 MID"`.
pub type Instrument = String;

/// Raw cell value as read from the live sheet. `None` for blank or error cells.
pub type Reading = Option<f64>;

/// Current values for all tracked instruments at the time of one read.
pub type Snapshot = BTreeMap<Instrument, Reading>;

/// One confirmed, significant, in-hours stable transition.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotRecord {
    pub instrument: Instrument,
    pub value: Decimal,
    pub recorded_at: DateTime<Local>,
    pub previous_value: Option<Decimal>,
    pub delta: Option<Decimal>,
}

impl SnapshotRecord {
    pub fn new(
        instrument: Instrument,
        value: Decimal,
        previous_value: Option<Decimal>,
        recorded_at: DateTime<Local>,
    ) -> Self {
        Self {
            delta: previous_value.and_then(|prev| value.checked_sub(prev)),
            instrument,
            value,
            recorded_at,
            previous_value,
        }
    }
}
