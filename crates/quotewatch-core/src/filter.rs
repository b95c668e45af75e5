use rust_decimal::Decimal;

use crate::quotes::QuotedItem;

/// Keep only quotes priced strictly above `threshold`, preserving order.
///
/// Comparison is done on `Decimal`, so there is no float rounding at the
/// cutoff.
#[must_use]
pub fn filter_above_threshold(items: Vec<QuotedItem>, threshold: Decimal) -> Vec<QuotedItem> {
    items
        .into_iter()
        .filter(|item| item.price > threshold)
        .collect()
}
