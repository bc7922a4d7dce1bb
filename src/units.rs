//! # Measure Units
//!
//! Unit table for `Measure` values: maps every accepted unit to its base
//! unit and SI conversion factor. Two measures unify when their units share
//! a base dimension; values are normalized to the base unit before they
//! cross the runtime boundary.

/// (unit, base unit, multiplier to base)
///
/// Temperature is the one non-linear family and is special-cased in
/// [`normalize`].
const UNITS: &[(&str, &str, f64)] = &[
    // time, base ms
    ("ms", "ms", 1.0),
    ("s", "ms", 1000.0),
    ("min", "ms", 60.0 * 1000.0),
    ("h", "ms", 3600.0 * 1000.0),
    ("day", "ms", 86400.0 * 1000.0),
    ("week", "ms", 7.0 * 86400.0 * 1000.0),
    ("mon", "ms", 30.0 * 86400.0 * 1000.0),
    ("year", "ms", 365.0 * 86400.0 * 1000.0),
    // length, base m
    ("m", "m", 1.0),
    ("km", "m", 1000.0),
    ("mm", "m", 0.001),
    ("cm", "m", 0.01),
    ("mi", "m", 1609.344),
    ("in", "m", 0.0254),
    ("ft", "m", 0.3048),
    // speed, base mps
    ("mps", "mps", 1.0),
    ("kmph", "mps", 0.27777778),
    ("mph", "mps", 0.44704),
    // weight, base kg
    ("kg", "kg", 1.0),
    ("g", "kg", 0.001),
    ("lb", "kg", 0.45359237),
    ("oz", "kg", 0.028349523),
    // pressure, base Pa
    ("Pa", "Pa", 1.0),
    ("bar", "Pa", 100000.0),
    ("psi", "Pa", 6894.7573),
    ("mmHg", "Pa", 133.32239),
    ("inHg", "Pa", 3386.3886),
    ("atm", "Pa", 101325.0),
    // temperature, base C (F and K converted in normalize)
    ("C", "C", 1.0),
    ("F", "C", 1.0),
    ("K", "C", 1.0),
    // energy, base kcal
    ("kcal", "kcal", 1.0),
    ("kJ", "kcal", 0.239006),
    // file and memory sizes, base byte
    ("byte", "byte", 1.0),
    ("KB", "byte", 1000.0),
    ("KiB", "byte", 1024.0),
    ("MB", "byte", 1000.0 * 1000.0),
    ("MiB", "byte", 1024.0 * 1024.0),
    ("GB", "byte", 1000.0 * 1000.0 * 1000.0),
    ("GiB", "byte", 1024.0 * 1024.0 * 1024.0),
    ("TB", "byte", 1000.0 * 1000.0 * 1000.0 * 1000.0),
    ("TiB", "byte", 1024.0 * 1024.0 * 1024.0 * 1024.0),
];

/// Get the base unit for a unit, or `None` if the unit is unknown.
pub fn base_unit(unit: &str) -> Option<&'static str> {
    UNITS
        .iter()
        .find(|(u, _, _)| *u == unit)
        .map(|(_, base, _)| *base)
}

/// Check whether two units measure the same dimension.
pub fn same_dimension(a: &str, b: &str) -> bool {
    match (base_unit(a), base_unit(b)) {
        (Some(ba), Some(bb)) => ba == bb,
        _ => false,
    }
}

/// Normalize a value expressed in `unit` to the dimension's base unit.
pub fn normalize(value: f64, unit: &str) -> Option<f64> {
    // Temperature scales have offsets, not just factors
    match unit {
        "F" => return Some((value - 32.0) / 1.8),
        "K" => return Some(value - 273.15),
        _ => {}
    }
    UNITS
        .iter()
        .find(|(u, _, _)| *u == unit)
        .map(|(_, _, factor)| value * factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_unit() {
        assert_eq!(base_unit("km"), Some("m"));
        assert_eq!(base_unit("ms"), Some("ms"));
        assert_eq!(base_unit("smoot"), None);
    }

    #[test]
    fn test_same_dimension() {
        assert!(same_dimension("km", "mi"));
        assert!(same_dimension("C", "F"));
        assert!(!same_dimension("km", "kg"));
        assert!(!same_dimension("km", "smoot"));
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize(2.0, "km"), Some(2000.0));
        assert_eq!(normalize(32.0, "F"), Some(0.0));
        assert_eq!(normalize(273.15, "K"), Some(0.0));
        assert_eq!(normalize(1.0, "nope"), None);
    }
}
