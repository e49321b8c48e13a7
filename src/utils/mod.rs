//! Utility modules

pub mod error;

pub use error::{
    ConfigError, LoaderError, PacingError, PoolError, Result, TimerError, TransportError,
};

/// Format large numbers with thousands separators
/// Examples: 1,234,567 or 987,654
pub fn format_count(value: u64) -> String {
    let s = value.to_string();
    let mut result = String::new();
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.insert(0, ',');
        }
        result.insert(0, c);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_count() {
        assert_eq!(format_count(0), "0");
        assert_eq!(format_count(123), "123");
        assert_eq!(format_count(1234), "1,234");
        assert_eq!(format_count(1234567), "1,234,567");
        assert_eq!(format_count(1000000), "1,000,000");
    }
}
