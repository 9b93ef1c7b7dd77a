//! Size string parsing
//!
//! Accepts the quantities used in backend configuration and volume requests:
//! a bare byte count, decimal units (`K`, `KB`, `M`, `MB`, ...) and binary
//! units (`Ki`, `KiB`, `Mi`, `MiB`, ...).

use crate::error::{Error, Result};

/// Parse a size string (e.g., "100Gi", "1G", "20MiB") to bytes
pub fn parse_size(s: &str) -> Result<u64> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::CapacityParse("empty size string".into()));
    }

    // Find where the number ends and unit begins
    let num_end = s
        .char_indices()
        .find(|(_, c)| !c.is_ascii_digit() && *c != '.')
        .map(|(i, _)| i)
        .unwrap_or(s.len());

    let num_str = &s[..num_end];
    let unit_str = s[num_end..].trim();

    if num_str.is_empty() {
        return Err(Error::CapacityParse(format!("invalid size: {}", s)));
    }

    let multiplier: u64 = match unit_str.to_uppercase().as_str() {
        "" | "B" => 1,
        "K" | "KB" => 1000,
        "M" | "MB" => 1000u64.pow(2),
        "G" | "GB" => 1000u64.pow(3),
        "T" | "TB" => 1000u64.pow(4),
        "P" | "PB" => 1000u64.pow(5),
        "E" | "EB" => 1000u64.pow(6),
        "KI" | "KIB" => 1 << 10,
        "MI" | "MIB" => 1 << 20,
        "GI" | "GIB" => 1 << 30,
        "TI" | "TIB" => 1 << 40,
        "PI" | "PIB" => 1 << 50,
        "EI" | "EIB" => 1 << 60,
        _ => {
            return Err(Error::CapacityParse(format!("unknown unit: {}", unit_str)));
        }
    };

    // Whole numbers stay exact; fractions go through f64
    if let Ok(whole) = num_str.parse::<u64>() {
        return whole
            .checked_mul(multiplier)
            .ok_or_else(|| Error::CapacityParse(format!("size overflows: {}", s)));
    }

    let num: f64 = num_str
        .parse()
        .map_err(|_| Error::CapacityParse(format!("invalid number: {}", num_str)))?;

    let bytes = num * multiplier as f64;
    if !bytes.is_finite() || bytes > u64::MAX as f64 {
        return Err(Error::CapacityParse(format!("size overflows: {}", s)));
    }
    Ok(bytes as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("100").unwrap(), 100);
        assert_eq!(parse_size("100B").unwrap(), 100);
        assert_eq!(parse_size("1K").unwrap(), 1000);
        assert_eq!(parse_size("1Ki").unwrap(), 1024);
        assert_eq!(parse_size("1G").unwrap(), 1_000_000_000);
        assert_eq!(parse_size("1Gi").unwrap(), 1_073_741_824);
        assert_eq!(parse_size("20MiB").unwrap(), 20_971_520);
        assert_eq!(parse_size("1.5Gi").unwrap(), 1_610_612_736);
        assert_eq!(parse_size(" 10mi ").unwrap(), 10 * 1024 * 1024);

        assert!(parse_size("").is_err());
        assert!(parse_size("abc").is_err());
        assert!(parse_size("100X").is_err());
        assert!(parse_size("99999999999Ei").is_err());
    }
}
