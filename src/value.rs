//! # Value Types
//!
//! Runtime-facing constant values as they appear in programs: literals,
//! measures, dates with symbolic references, entities, and the `$event`
//! family. Every variant answers [`Value::get_type`]; concrete variants
//! additionally answer [`Value::to_json`] with a normalized host datum
//! (measures in base units, dates as RFC 3339, times as `HH:MM:SS`).

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::types::Type;
use crate::units;

/// Tag for relative (user-profile) locations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RelativeTag {
    CurrentLocation,
    Home,
    Work,
}

impl RelativeTag {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "current_location" => Some(RelativeTag::CurrentLocation),
            "home" => Some(RelativeTag::Home),
            "work" => Some(RelativeTag::Work),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RelativeTag::CurrentLocation => "current_location",
            RelativeTag::Home => "home",
            RelativeTag::Work => "work",
        }
    }
}

/// A location value: either absolute coordinates or a relative tag that
/// slot-filling resolves from the user profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Location {
    Absolute {
        lat: f64,
        lon: f64,
        display: Option<String>,
    },
    Relative {
        tag: RelativeTag,
    },
}

/// Which end of a calendar unit a [`DateRef::Edge`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DateEdgeKind {
    StartOf,
    EndOf,
}

/// The base of a date value, before any offset is applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DateRef {
    /// A fully resolved point in time
    Absolute(DateTime<Utc>),
    /// The start or end of a calendar unit relative to now, e.g.
    /// `start_of(day)`
    Edge { edge: DateEdgeKind, unit: String },
    /// The next occurrence of a weekday, optionally at a time of day.
    /// The weekday is kept as its lowercase English name.
    WeekDay {
        weekday: String,
        time: Option<(u8, u8, u8)>,
    },
    /// A partially specified date, e.g. "the 15th of this month"
    Piece {
        year: Option<i32>,
        month: Option<u32>,
        day: Option<u32>,
        time: Option<(u8, u8, u8)>,
    },
}

/// Sign of a date offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DateOp {
    Plus,
    Minus,
}

/// A date value: an optional base (`None` means "now") combined with an
/// optional duration offset. The offset must be duration-like: a
/// `Measure` in the `ms` dimension, a `CompoundMeasure`, or a `VarRef`
/// to a `__const_*` placeholder; the typechecker enforces this.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DateValue {
    pub value: Option<DateRef>,
    pub operator: DateOp,
    pub offset: Option<Box<Value>>,
}

/// A constant value in a program.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Array(Vec<Value>),
    /// Reference to a name in the lexical scope of the statement
    VarRef { name: String },
    /// A slot to be filled; `local` distinguishes `$?` from `$undefined`
    Undefined { local: bool },
    Boolean(bool),
    String(String),
    Number(f64),
    Currency { value: f64, code: String },
    Measure { value: f64, unit: String },
    /// A sum of measures in the same dimension, e.g. `1h + 30min`
    CompoundMeasure(Vec<Value>),
    Location(Location),
    Date(DateValue),
    Time { hour: u8, minute: u8, second: u8 },
    Entity {
        value: String,
        entity_type: String,
        display: Option<String>,
    },
    Enum { value: String },
    /// The `$event` family; `name` is `None` for the formatted event,
    /// `"type"` for the tuple type tag, `"program_id"` for the program
    /// identifier, or another out-parameter name
    Event { name: Option<String> },
}

impl Value {
    /// The static type of this value.
    pub fn get_type(&self) -> Type {
        match self {
            Value::Array(elems) => {
                let elem = elems.first().map(Value::get_type).unwrap_or(Type::Any);
                Type::Array(Box::new(elem))
            }
            Value::VarRef { .. } | Value::Undefined { .. } => Type::Any,
            Value::Boolean(_) => Type::Boolean,
            Value::String(_) => Type::String,
            Value::Number(_) => Type::Number,
            Value::Currency { .. } => Type::Currency,
            Value::Measure { unit, .. } => {
                Type::Measure(units::base_unit(unit).unwrap_or(unit.as_str()).to_string())
            }
            Value::CompoundMeasure(parts) => parts
                .first()
                .map(Value::get_type)
                .unwrap_or(Type::Measure("ms".to_string())),
            Value::Location(_) => Type::Location,
            Value::Date(_) => Type::Date,
            Value::Time { .. } => Type::Time,
            Value::Entity { entity_type, .. } => Type::Entity(entity_type.clone()),
            Value::Enum { value } => Type::Enum(Some(vec![value.clone()])),
            Value::Event { name } => match name.as_deref() {
                Some("type") => Type::Entity("tt:function".to_string()),
                Some("program_id") => Type::Entity("tt:program_id".to_string()),
                _ => Type::String,
            },
        }
    }

    /// Whether this value is fully specified for slot-filling purposes.
    ///
    /// `Undefined`, `VarRef`, `$event`, relative locations, entities
    /// without a display name and enum placeholders are not concrete.
    pub fn is_concrete(&self) -> bool {
        match self {
            Value::Undefined { .. } | Value::VarRef { .. } | Value::Event { .. } => false,
            Value::Location(Location::Relative { .. }) => false,
            Value::Entity { display, .. } => display.is_some(),
            Value::Array(elems) => elems.iter().all(Value::is_concrete),
            Value::CompoundMeasure(parts) => parts.iter().all(Value::is_concrete),
            Value::Date(date) => {
                let base_ok = match &date.value {
                    None | Some(DateRef::Absolute(_)) => true,
                    // Edges, weekdays and pieces resolve against "now",
                    // which is fine for execution
                    Some(_) => true,
                };
                let offset_ok = date
                    .offset
                    .as_ref()
                    .map(|o| o.is_concrete())
                    .unwrap_or(true);
                base_ok && offset_ok
            }
            _ => true,
        }
    }

    /// Whether this value can serve as a date offset.
    pub fn is_duration_like(&self) -> bool {
        match self {
            Value::Measure { unit, .. } => units::base_unit(unit) == Some("ms"),
            Value::CompoundMeasure(parts) => parts.iter().all(Value::is_duration_like),
            Value::VarRef { name } => name.starts_with("__const_"),
            _ => false,
        }
    }

    /// Produce the normalized host datum for a concrete value, or `None`
    /// when the value still needs resolution (var refs, undefined slots,
    /// `$event`, relative locations).
    pub fn to_json(&self) -> Option<serde_json::Value> {
        match self {
            Value::Array(elems) => {
                let mut out = Vec::with_capacity(elems.len());
                for e in elems {
                    out.push(e.to_json()?);
                }
                Some(serde_json::Value::Array(out))
            }
            Value::VarRef { .. } | Value::Undefined { .. } | Value::Event { .. } => None,
            Value::Boolean(b) => Some(json!(b)),
            Value::String(s) => Some(json!(s)),
            Value::Number(n) => Some(json!(n)),
            Value::Currency { value, code } => Some(json!({
                "value": value,
                "code": code.to_lowercase(),
            })),
            Value::Measure { value, unit } => units::normalize(*value, unit).map(|v| json!(v)),
            Value::CompoundMeasure(parts) => {
                let mut total = 0.0;
                for p in parts {
                    if let Value::Measure { value, unit } = p {
                        total += units::normalize(*value, unit)?;
                    } else {
                        return None;
                    }
                }
                Some(json!(total))
            }
            Value::Location(Location::Absolute { lat, lon, display }) => Some(json!({
                "latitude": lat,
                "longitude": lon,
                "display": display,
            })),
            Value::Location(Location::Relative { .. }) => None,
            Value::Date(date) => date.resolve().map(|dt| {
                json!(dt.to_rfc3339_opts(SecondsFormat::Millis, true))
            }),
            Value::Time { hour, minute, second } => {
                Some(json!(format!("{hour:02}:{minute:02}:{second:02}")))
            }
            Value::Entity { value, display, .. } => Some(json!({
                "value": value,
                "display": display,
            })),
            Value::Enum { value } => Some(json!(value)),
        }
    }
}

impl DateValue {
    /// An absolute date with no offset.
    pub fn absolute(dt: DateTime<Utc>) -> Self {
        DateValue {
            value: Some(DateRef::Absolute(dt)),
            operator: DateOp::Plus,
            offset: None,
        }
    }

    /// Resolve to a concrete instant, when the base is absolute and the
    /// offset (if any) is a concrete duration. Symbolic bases (edges,
    /// weekdays, pieces, "now") resolve at execution time, not here.
    pub fn resolve(&self) -> Option<DateTime<Utc>> {
        let base = match &self.value {
            Some(DateRef::Absolute(dt)) => *dt,
            _ => return None,
        };
        let offset_ms = match &self.offset {
            None => 0.0,
            Some(offset) => match offset.to_json()? {
                serde_json::Value::Number(n) => n.as_f64()?,
                _ => return None,
            },
        };
        let signed = match self.operator {
            DateOp::Plus => offset_ms,
            DateOp::Minus => -offset_ms,
        };
        Some(base + chrono::Duration::milliseconds(signed as i64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_measure_normalizes_to_base() {
        let v = Value::Measure { value: 2.0, unit: "km".to_string() };
        assert_eq!(v.get_type(), Type::Measure("m".to_string()));
        assert_eq!(v.to_json(), Some(json!(2000.0)));
    }

    #[test]
    fn test_compound_measure() {
        let v = Value::CompoundMeasure(vec![
            Value::Measure { value: 1.0, unit: "h".to_string() },
            Value::Measure { value: 30.0, unit: "min".to_string() },
        ]);
        assert_eq!(v.get_type(), Type::Measure("ms".to_string()));
        assert_eq!(v.to_json(), Some(json!(5_400_000.0)));
        assert!(v.is_duration_like());
    }

    #[test]
    fn test_entity_concreteness() {
        let with_display = Value::Entity {
            value: "gordon@example.com".to_string(),
            entity_type: "tt:email_address".to_string(),
            display: Some("Gordon".to_string()),
        };
        let without = Value::Entity {
            value: "gordon@example.com".to_string(),
            entity_type: "tt:email_address".to_string(),
            display: None,
        };
        assert!(with_display.is_concrete());
        assert!(!without.is_concrete());
    }

    #[test]
    fn test_relative_location_not_concrete() {
        let v = Value::Location(Location::Relative { tag: RelativeTag::Home });
        assert!(!v.is_concrete());
        assert_eq!(v.to_json(), None);
    }

    #[test]
    fn test_date_offset_resolution() {
        let base = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        let date = DateValue {
            value: Some(DateRef::Absolute(base)),
            operator: DateOp::Plus,
            offset: Some(Box::new(Value::Measure { value: 1.0, unit: "h".to_string() })),
        };
        let resolved = date.resolve().unwrap();
        assert_eq!(resolved, base + chrono::Duration::hours(1));
    }

    #[test]
    fn test_event_types() {
        assert_eq!(Value::Event { name: None }.get_type(), Type::String);
        assert_eq!(
            Value::Event { name: Some("type".to_string()) }.get_type(),
            Type::Entity("tt:function".to_string())
        );
    }
}
