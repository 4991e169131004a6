//! Integer encodings for geospatial values.
//!
//! Latitude/longitude and derived quantities are persisted as scaled signed
//! 64-bit integers rather than floats, so that equality and ordering on the
//! stored columns are exact:
//!
//! - `*_u6` fields: degrees × 1,000,000 (`to_u6` / `from_u6`).
//! - `*_u4` fields: value × 10,000 (`to_u4` / `from_u4`), used for route
//!   fraction and distance in kilometres.
//!
//! Conversion only happens at the ingress boundary (parsing a fresh upstream
//! reading) and the egress boundary (serialising an API response). Both
//! directions guard against non-finite input the same way the weather
//! service guarded `Decimal` conversions.

pub(crate) fn to_u6(v: f64) -> i64 {
    if !v.is_finite() {
        tracing::warn!("to_u6 received non-finite value {}, defaulting to 0", v);
        return 0;
    }
    (v * 1_000_000.0).round() as i64
}

pub(crate) fn from_u6(v: i64) -> f64 {
    v as f64 / 1_000_000.0
}

pub(crate) fn opt_to_u6(v: Option<f64>) -> Option<i64> {
    v.map(to_u6)
}

pub(crate) fn opt_from_u6(v: Option<i64>) -> Option<f64> {
    v.map(from_u6)
}

pub(crate) fn to_u4(v: f64) -> i64 {
    if !v.is_finite() {
        tracing::warn!("to_u4 received non-finite value {}, defaulting to 0", v);
        return 0;
    }
    (v * 10_000.0).round() as i64
}

pub(crate) fn from_u4(v: i64) -> f64 {
    v as f64 / 10_000.0
}

pub(crate) fn opt_to_u4(v: Option<f64>) -> Option<i64> {
    v.map(to_u4)
}

pub(crate) fn opt_from_u4(v: Option<i64>) -> Option<f64> {
    v.map(from_u4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_u6_normal() {
        assert_eq!(to_u6(19.1), 19_100_000);
    }

    #[test]
    fn test_to_u6_roundtrip() {
        let v = 72.900123;
        let encoded = to_u6(v);
        assert!((from_u6(encoded) - v).abs() < 1e-6);
    }

    #[test]
    fn test_to_u6_nan() {
        assert_eq!(to_u6(f64::NAN), 0);
    }

    #[test]
    fn test_to_u6_infinity() {
        assert_eq!(to_u6(f64::INFINITY), 0);
        assert_eq!(to_u6(f64::NEG_INFINITY), 0);
    }

    #[test]
    fn test_to_u4_normal() {
        // 12.3456 km -> 123456
        assert_eq!(to_u4(12.3456), 123_456);
    }

    #[test]
    fn test_to_u4_rounds() {
        assert_eq!(to_u4(0.00005), 1);
    }

    #[test]
    fn test_to_u4_nan() {
        assert_eq!(to_u4(f64::NAN), 0);
    }

    #[test]
    fn test_opt_to_u6_none() {
        assert_eq!(opt_to_u6(None), None);
    }

    #[test]
    fn test_opt_from_u4_some() {
        assert_eq!(opt_from_u4(Some(123_456)), Some(12.3456));
    }

    #[test]
    fn test_from_u6_zero() {
        assert_eq!(from_u6(0), 0.0);
    }
}
