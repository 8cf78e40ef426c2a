use chrono::{DateTime, Local, NaiveTime};

/// Time-of-day window in which sampling and commits are allowed.
///
/// Half-open: open at `start`, closed at `end`. Day of week and holidays are
/// not considered.
#[derive(Debug, Clone, Copy)]
pub struct TradingHoursGate {
    start: NaiveTime,
    end: NaiveTime,
}

impl TradingHoursGate {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self { start, end }
    }

    pub fn is_open(&self, now: DateTime<Local>) -> bool {
        let t = now.time();
        self.start <= t && t < self.end
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::local;
    use chrono::Duration;

    fn gate() -> TradingHoursGate {
        TradingHoursGate::new(
            NaiveTime::from_hms_opt(7, 0, 0).unwrap(),
            NaiveTime::from_hms_opt(16, 0, 0).unwrap(),
        )
    }

    #[test]
    fn test_open_during_trading() {
        assert!(gate().is_open(local(2024, 3, 20, 8, 30, 0)));
    }

    #[test]
    fn test_closed_before_trading() {
        assert!(!gate().is_open(local(2024, 3, 20, 6, 59, 59)));
    }

    #[test]
    fn test_boundaries() {
        let open = local(2024, 3, 20, 7, 0, 0);
        let close = local(2024, 3, 20, 16, 0, 0);

        assert!(gate().is_open(open));
        assert!(!gate().is_open(close));
        assert!(gate().is_open(close - Duration::milliseconds(1)));
        assert!(!gate().is_open(local(2024, 3, 20, 16, 0, 1)));
    }
}
