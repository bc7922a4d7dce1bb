//! # Type System
//!
//! The closed set of value types the language knows about. Equality is
//! structural; assignability adds three extra rules on top of equality:
//! `Any` unifies with everything, `Measure` unifies per base dimension, and
//! `Entity` unifies along the subtype graph maintained by the schema
//! retriever.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

use crate::units;

/// A value type.
///
/// `Compound` uses a `BTreeMap` so two compounds with the same fields in
/// any insertion order compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Type {
    /// Top type; unifies with everything
    Any,
    Boolean,
    String,
    Number,
    Currency,
    Location,
    Date,
    Time,
    /// A typed identifier into some namespace, e.g. `Entity(tt:email_address)`
    Entity(String),
    /// An enumeration; `None` means the choices are not yet known
    /// (a placeholder the typechecker resolves against the argument)
    Enum(Option<Vec<String>>),
    /// A physical quantity; the parameter is the base unit
    Measure(String),
    Array(Box<Type>),
    Compound {
        name: Option<String>,
        fields: BTreeMap<String, Type>,
    },
    Feed,
}

/// Entity subtype graph: entity kind -> declared parent kinds.
///
/// Built by the schema retriever from the catalog's entity records and
/// passed into [`Type::is_assignable`] so the type system itself stays
/// synchronous.
pub type EntitySubtypeMap = HashMap<String, Vec<String>>;

/// Walk the subtype graph checking whether `child` is (transitively) a
/// declared subtype of `parent`.
pub fn is_entity_subtype(subtypes: &EntitySubtypeMap, child: &str, parent: &str) -> bool {
    if child == parent {
        return true;
    }
    let mut stack = vec![child];
    let mut seen = vec![];
    while let Some(current) = stack.pop() {
        if seen.contains(&current) {
            continue;
        }
        seen.push(current);
        if let Some(parents) = subtypes.get(current) {
            for p in parents {
                if p == parent {
                    return true;
                }
                stack.push(p);
            }
        }
    }
    false
}

impl Type {
    /// Check whether a value of type `self` can flow into a slot of type
    /// `other`.
    pub fn is_assignable(&self, other: &Type, subtypes: &EntitySubtypeMap) -> bool {
        match (self, other) {
            (Type::Any, _) | (_, Type::Any) => true,
            (Type::Measure(a), Type::Measure(b)) => {
                a == b || units::same_dimension(a, b)
            }
            (Type::Entity(a), Type::Entity(b)) => is_entity_subtype(subtypes, a, b),
            // An enum with unknown choices unifies with any enum
            (Type::Enum(None), Type::Enum(_)) | (Type::Enum(_), Type::Enum(None)) => true,
            (Type::Array(a), Type::Array(b)) => a.is_assignable(b, subtypes),
            (
                Type::Compound { fields: fa, .. },
                Type::Compound { fields: fb, .. },
            ) => {
                fb.iter().all(|(name, tb)| {
                    fa.get(name)
                        .map(|ta| ta.is_assignable(tb, subtypes))
                        .unwrap_or(false)
                })
            }
            _ => self == other,
        }
    }

    /// Whether values of this type can appear on either side of an
    /// ordering comparison (`<`, `<=`, `>`, `>=`).
    pub fn is_comparable(&self) -> bool {
        matches!(
            self,
            Type::Number
                | Type::Currency
                | Type::Date
                | Type::Time
                | Type::String
                | Type::Measure(_)
        )
    }

    /// Whether this type is numeric-like for arithmetic purposes.
    pub fn is_numeric(&self) -> bool {
        matches!(self, Type::Number | Type::Currency | Type::Measure(_))
    }

    pub fn is_entity(&self) -> bool {
        matches!(self, Type::Entity(_))
    }

    /// Element type if this is an array.
    pub fn elem(&self) -> Option<&Type> {
        if let Type::Array(elem) = self {
            Some(elem)
        } else {
            None
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Any => write!(f, "Any"),
            Type::Boolean => write!(f, "Boolean"),
            Type::String => write!(f, "String"),
            Type::Number => write!(f, "Number"),
            Type::Currency => write!(f, "Currency"),
            Type::Location => write!(f, "Location"),
            Type::Date => write!(f, "Date"),
            Type::Time => write!(f, "Time"),
            Type::Entity(kind) => write!(f, "Entity({kind})"),
            Type::Enum(Some(choices)) => write!(f, "Enum({})", choices.join(",")),
            Type::Enum(None) => write!(f, "Enum(?)"),
            Type::Measure(unit) => write!(f, "Measure({unit})"),
            Type::Array(elem) => write!(f, "Array({elem})"),
            Type::Compound { name, fields } => {
                if let Some(name) = name {
                    write!(f, "Compound({name})")
                } else {
                    write!(f, "Compound({} fields)", fields.len())
                }
            }
            Type::Feed => write!(f, "Feed"),
        }
    }
}
