//! Parses Kubernetes storage quantities (`5Gi`, `100M`, `1e9`) into byte counts
//! so that requested and provisioned sizes can be compared by value rather
//! than by spelling.

use k8s_openapi::apimachinery::pkg::api::resource::Quantity as KubeQuantity;
use thiserror::Error;

const KILOBYTE: f64 = 1000.0;
const MEGABYTE: f64 = 1_000_000.0; // 1000 ^ 2
const GIGABYTE: f64 = 1_000_000_000.0; // 1000 ^ 3
const TERABYTE: f64 = 1_000_000_000_000.0; // 1000 ^ 4
const PETABYTE: f64 = 1_000_000_000_000_000.0; // 1000 ^ 5
const EXABYTE: f64 = 1_000_000_000_000_000_000.0; // 1000 ^ 6
const KIBIBYTE: f64 = 1024.0;
const MEBIBYTE: f64 = 1_048_576.0; // 1024 ^ 2
const GIBIBYTE: f64 = 1_073_741_824.0; // 1024 ^ 3
const TEBIBYTE: f64 = 1_099_511_627_776.0; // 1024 ^ 4
const PEBIBYTE: f64 = 1_125_899_906_842_624.0; // 1024 ^ 5
const EXBIBYTE: f64 = 1_152_921_504_606_846_976.0; // 1024 ^ 6

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Suffix {
    Kilobyte,
    Megabyte,
    Gigabyte,
    Terabyte,
    Petabyte,
    Exabyte,
    Kibibyte,
    Mebibyte,
    Gibibyte,
    Tebibyte,
    Pebibyte,
    Exbibyte,
    None,
}

impl Suffix {
    /// The multiplier from a number with this suffix to bytes.
    pub(crate) const fn multiplier(&self) -> f64 {
        match self {
            Self::Kilobyte => KILOBYTE,
            Self::Megabyte => MEGABYTE,
            Self::Gigabyte => GIGABYTE,
            Self::Terabyte => TERABYTE,
            Self::Petabyte => PETABYTE,
            Self::Exabyte => EXABYTE,
            Self::Kibibyte => KIBIBYTE,
            Self::Mebibyte => MEBIBYTE,
            Self::Gibibyte => GIBIBYTE,
            Self::Tebibyte => TEBIBYTE,
            Self::Pebibyte => PEBIBYTE,
            Self::Exbibyte => EXBIBYTE,
            Self::None => 1.0,
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        let suffix = match raw {
            "" => Suffix::None,
            "k" | "K" => Suffix::Kilobyte,
            "M" => Suffix::Megabyte,
            "G" => Suffix::Gigabyte,
            "T" => Suffix::Terabyte,
            "P" => Suffix::Petabyte,
            "E" => Suffix::Exabyte,
            "Ki" => Suffix::Kibibyte,
            "Mi" => Suffix::Mebibyte,
            "Gi" => Suffix::Gibibyte,
            "Ti" => Suffix::Tebibyte,
            "Pi" => Suffix::Pebibyte,
            "Ei" => Suffix::Exbibyte,
            _ => return None,
        };
        Some(suffix)
    }
}

#[derive(Error, Debug, PartialEq)]
pub enum QuantityError {
    #[error("{0:?} is not a storage quantity: unknown suffix")]
    Suffix(String),
    #[error("{0:?} is not a storage quantity: malformed number")]
    Number(String),
}

/// Converts a quantity string to bytes. Fractions of a byte are rounded up,
/// as the API server does for storage requests.
pub fn parse_bytes(raw: &str) -> Result<u128, QuantityError> {
    let trimmed = raw.trim();
    // Exponent notation ("123e8") has an alphabetic character in the middle of
    // the number, so the suffix is whatever follows the last digit.
    let split = trimmed
        .rfind(|c: char| c.is_ascii_digit() || c == '.')
        .map(|i| i + 1)
        .unwrap_or(0);
    let (number, suffix) = trimmed.split_at(split);
    let suffix = Suffix::parse(suffix).ok_or_else(|| QuantityError::Suffix(raw.to_owned()))?;
    let parsed: f64 = number
        .parse()
        .map_err(|_| QuantityError::Number(raw.to_owned()))?;
    if parsed < 0.0 || !parsed.is_finite() {
        return Err(QuantityError::Number(raw.to_owned()));
    }
    Ok((parsed * suffix.multiplier()).ceil() as u128)
}

/// [`parse_bytes`] for the k8s-openapi wrapper type.
pub fn quantity_bytes(q: &KubeQuantity) -> Result<u128, QuantityError> {
    parse_bytes(&q.0)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_valid_storage_quantities() {
        let quantities = vec![
            ("123456", 123456),
            ("123e8", 12300000000),
            ("500K", 500000),
            ("500k", 500000),
            ("500M", 500000000),
            ("500G", 500000000000),
            ("500T", 500000000000000),
            ("500Ki", 512000),
            ("500Mi", 524288000),
            ("5Gi", 5368709120),
            ("500Ti", 549755813888000),
            ("1.5Gi", 1610612736),
            (" 1Mi ", 1048576),
        ];

        for (q, expected) in quantities {
            assert_eq!(
                parse_bytes(q),
                Ok(expected),
                "Expected converted quantity {:?} to be equal",
                q
            );
        }
    }

    #[test]
    fn test_equal_values_with_different_spelling() {
        let a = quantity_bytes(&KubeQuantity("1024Mi".into())).unwrap();
        let b = quantity_bytes(&KubeQuantity("1Gi".into())).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_invalid_quantities() {
        assert!(matches!(parse_bytes("500m"), Err(QuantityError::Suffix(_))));
        assert!(matches!(parse_bytes("1.2gigawatts"), Err(QuantityError::Suffix(_))));
        assert!(matches!(parse_bytes("TK421"), Err(QuantityError::Number(_))));
        assert!(matches!(parse_bytes("Gi"), Err(QuantityError::Number(_))));
        assert!(matches!(parse_bytes(""), Err(QuantityError::Number(_))));
        assert!(matches!(parse_bytes("-1Gi"), Err(QuantityError::Number(_))));
    }
}
