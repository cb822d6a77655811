//! Bandwidth pricing
//!
//! Pure, deterministic price computation shared by both sides: the
//! provider quotes with it and the requester validates quotes against it.

/// Bytes per pricing unit (1 GiB)
pub const BYTES_PER_GB: u64 = 1 << 30;

/// Price in smallest currency unit for transferring `size_bytes` at
/// `rate_per_gb`: `max(1, ceil(size_bytes / 2^30 * rate_per_gb))`.
pub fn price(size_bytes: u64, rate_per_gb: u64) -> u64 {
    let scaled = size_bytes as u128 * rate_per_gb as u128;
    let amount = scaled.div_ceil(BYTES_PER_GB as u128);
    (amount.max(1)).min(u64::MAX as u128) as u64
}

/// Whether a quoted amount is within the configured inflation tolerance:
/// the quote must not exceed `max_multiple` times the locally expected
/// price for the same payload.
pub fn quote_acceptable(quoted: u64, size_bytes: u64, expected_rate: u64, max_multiple: u64) -> bool {
    quoted <= price(size_bytes, expected_rate).saturating_mul(max_multiple)
}

/// Whether a quoted amount fits a caller-supplied budget (None = unlimited)
pub fn within_budget(quoted: u64, budget: Option<u64>) -> bool {
    match budget {
        Some(limit) => quoted <= limit,
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_price_minimum_is_one() {
        assert_eq!(price(0, 0), 1);
        assert_eq!(price(1, 1), 1);
        assert_eq!(price(1024, 100), 1);
    }

    #[test]
    fn test_price_small_payload_hits_floor() {
        // 50,000 bytes at 100 sats/GiB rounds up to the 1 sat floor
        assert_eq!(price(50_000, 100), 1);
    }

    #[test]
    fn test_price_exact_gigabyte() {
        assert_eq!(price(BYTES_PER_GB, 100), 100);
        assert_eq!(price(BYTES_PER_GB + 1, 100), 101);
        assert_eq!(price(2 * BYTES_PER_GB, 50), 100);
    }

    #[test]
    fn test_price_monotonic_in_size() {
        let rate = 250;
        let mut last = 0;
        for size in [0u64, 1, 1000, 50_000, 1 << 20, 1 << 30, 1 << 34, 1 << 40] {
            let p = price(size, rate);
            assert!(p >= 1);
            assert!(p >= last, "price must be non-decreasing in size");
            last = p;
        }
    }

    #[test]
    fn test_price_no_overflow_on_large_inputs() {
        // A petabyte at an absurd rate still computes without panicking
        let p = price(1 << 50, u64::MAX / (1 << 21));
        assert!(p >= 1);
    }

    #[test]
    fn test_quote_acceptable() {
        // Expected price for 1 GiB at 100/GiB is 100; tolerate up to 3x
        assert!(quote_acceptable(100, BYTES_PER_GB, 100, 3));
        assert!(quote_acceptable(300, BYTES_PER_GB, 100, 3));
        assert!(!quote_acceptable(301, BYTES_PER_GB, 100, 3));
    }

    #[test]
    fn test_within_budget() {
        assert!(within_budget(10, None));
        assert!(within_budget(10, Some(10)));
        assert!(!within_budget(11, Some(10)));
    }
}
