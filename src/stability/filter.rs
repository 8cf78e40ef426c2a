use rust_decimal::Decimal;

/// Decides whether a move between two committed values is worth persisting.
#[derive(Debug, Clone, Copy)]
pub struct ChangeFilter {
    min_price_change: Decimal,
}

impl ChangeFilter {
    pub fn new(min_price_change: Decimal) -> Self {
        Self { min_price_change }
    }

    /// The first stabilization is always significant; it sets the baseline.
    pub fn is_significant(&self, old: Option<Decimal>, new: Decimal) -> bool {
        match old {
            None => true,
            Some(old) => new
                .checked_sub(old)
                .map_or(true, |d| d.abs() >= self.min_price_change),
        }
    }
}
