// 💵 Money helpers
// Amounts are exact decimals; comparisons use a one-cent tolerance.

use rust_decimal::{Decimal, RoundingStrategy};
use std::str::FromStr;

/// Default comparison tolerance: one cent
pub const CENT: Decimal = Decimal::from_parts(1, 0, 0, false, 2);

/// Round to cents, halves away from zero
pub fn round_cents(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// True when `amount` has no fraction of a cent
pub fn is_whole_cents(amount: Decimal) -> bool {
    amount == round_cents(amount)
}

/// True when `a` and `b` differ by at most `tolerance`
pub fn within_tolerance(a: Decimal, b: Decimal, tolerance: Decimal) -> bool {
    (a - b).abs() <= tolerance
}

/// Parse an amount as it appears in imported spreadsheets
///
/// Accepts "1234.50", "$1,234.50", " -12 ", "(45.00)" (accounting negative).
pub fn parse_amount(raw: &str) -> Option<Decimal> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    let (negative, body) = if trimmed.starts_with('(') && trimmed.ends_with(')') {
        (true, &trimmed[1..trimmed.len() - 1])
    } else {
        (false, trimmed)
    };

    let cleaned: String = body
        .chars()
        .filter(|c| !matches!(c, '$' | ',' | ' '))
        .collect();

    let value = Decimal::from_str(&cleaned).ok()?;
    Some(if negative { -value } else { value })
}

/// Canonical TEXT form used in SQLite
pub fn to_db(amount: Decimal) -> String {
    amount.normalize().to_string()
}

pub fn from_db(text: &str) -> rusqlite::Result<Decimal> {
    Decimal::from_str(text).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[test]
    fn test_cent_constant() {
        assert_eq!(CENT, d("0.01"));
    }

    #[test]
    fn test_parse_amount_formats() {
        assert_eq!(parse_amount("1234.50"), Some(d("1234.50")));
        assert_eq!(parse_amount("$1,234.50"), Some(d("1234.50")));
        assert_eq!(parse_amount("  -12 "), Some(d("-12")));
        assert_eq!(parse_amount("(45.00)"), Some(d("-45.00")));
        assert_eq!(parse_amount(""), None);
        assert_eq!(parse_amount("abc"), None);
    }

    #[test]
    fn test_tolerance() {
        assert!(within_tolerance(d("100.00"), d("100.01"), CENT));
        assert!(!within_tolerance(d("100.00"), d("100.02"), CENT));
    }

    #[test]
    fn test_round_cents() {
        assert_eq!(round_cents(d("10.005")), d("10.01"));
        assert_eq!(round_cents(d("-10.005")), d("-10.01"));
        assert_eq!(round_cents(d("3.333333")), d("3.33"));
    }

    #[test]
    fn test_whole_cents() {
        assert!(is_whole_cents(d("100.10")));
        assert!(is_whole_cents(d("100.100")));
        assert!(!is_whole_cents(d("100.005")));
    }

    #[test]
    fn test_db_text_roundtrip_is_canonical() {
        assert_eq!(to_db(d("2500.00")), "2500");
        assert_eq!(from_db("2500").unwrap(), d("2500.00"));
    }
}
