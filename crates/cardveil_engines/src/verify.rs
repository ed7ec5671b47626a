#![forbid(unsafe_code)]

use cardveil_kernel_contracts::card::{CardExpiry, DigitFragment};
use subtle::{Choice, ConstantTimeEq};

/// Exact match of a presented fragment + expiry against one profile's stored values.
///
/// All three fields are always compared so timing does not reveal which one failed,
/// and the result is a single boolean for the same reason.
pub fn profile_secret_matches(
    presented_digits: &str,
    presented_month: u8,
    presented_year: u16,
    expected_digits: &DigitFragment,
    expected_expiry: CardExpiry,
) -> bool {
    let digits_ok: Choice = presented_digits
        .as_bytes()
        .ct_eq(expected_digits.as_str().as_bytes());
    let month_ok = presented_month.ct_eq(&expected_expiry.month);
    let year_ok = presented_year.ct_eq(&expected_expiry.year);
    bool::from(digits_ok & month_ok & year_ok)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stored() -> (DigitFragment, CardExpiry) {
        (
            DigitFragment::new("482").unwrap(),
            CardExpiry::v1(9, 2027).unwrap(),
        )
    }

    #[test]
    fn at_verify_01_exact_match_passes() {
        let (d, e) = stored();
        assert!(profile_secret_matches("482", 9, 2027, &d, e));
    }

    #[test]
    fn at_verify_02_off_by_one_digits_fail() {
        let (d, e) = stored();
        for near in ["481", "483", "472", "492", "382", "582", "48", "4820", "", "48 2"] {
            assert!(!profile_secret_matches(near, 9, 2027, &d, e), "{near}");
        }
    }

    #[test]
    fn at_verify_03_expiry_near_misses_fail() {
        let (d, e) = stored();
        assert!(!profile_secret_matches("482", 8, 2027, &d, e));
        assert!(!profile_secret_matches("482", 10, 2027, &d, e));
        assert!(!profile_secret_matches("482", 9, 2026, &d, e));
        assert!(!profile_secret_matches("482", 9, 2028, &d, e));
    }
}
