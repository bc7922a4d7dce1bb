//! # Builtin Functions
//!
//! Signatures for the builtin stream primitives and the `notify` action.
//! These belong to no device class; the typechecker reaches for them when
//! an invocation targets the builtin namespace.

use crate::types::Type;

use super::functions::{ArgumentDef, Direction, FunctionDef, FunctionType};

/// The pseudo-kind builtin functions are registered under.
pub const BUILTIN_KIND: &str = "org.thingpedia.builtin.thingengine.builtin";

/// `timer(base=..., interval=...)`: fires every `interval` starting at
/// `base`, optionally `frequency` times per interval.
pub fn timer() -> FunctionDef {
    let mut f = FunctionDef::new(
        BUILTIN_KIND,
        FunctionType::Query,
        "timer",
        vec![
            ArgumentDef::new(Direction::InReq, "base", Type::Date),
            ArgumentDef::new(Direction::InReq, "interval", Type::Measure("ms".to_string())),
            ArgumentDef::new(Direction::InOpt, "frequency", Type::Number),
            ArgumentDef::new(Direction::Out, "__timestamp", Type::Date),
        ],
    );
    f.is_list = true;
    f.is_monitorable = true;
    f
}

/// `attimer(time=[...])`: fires at the given times of day.
pub fn attimer() -> FunctionDef {
    let mut f = FunctionDef::new(
        BUILTIN_KIND,
        FunctionType::Query,
        "attimer",
        vec![
            ArgumentDef::new(
                Direction::InReq,
                "time",
                Type::Array(Box::new(Type::Time)),
            ),
            ArgumentDef::new(Direction::InOpt, "expiration_date", Type::Date),
            ArgumentDef::new(Direction::Out, "__timestamp", Type::Date),
        ],
    );
    f.is_list = true;
    f.is_monitorable = true;
    f
}

/// `ontimer(date=[...])`: fires once at each given date.
pub fn ontimer() -> FunctionDef {
    let mut f = FunctionDef::new(
        BUILTIN_KIND,
        FunctionType::Query,
        "ontimer",
        vec![
            ArgumentDef::new(
                Direction::InReq,
                "date",
                Type::Array(Box::new(Type::Date)),
            ),
            ArgumentDef::new(Direction::Out, "__timestamp", Type::Date),
        ],
    );
    f.is_list = true;
    f.is_monitorable = true;
    f
}

/// `notify`: hand the current tuple to the output channel.
pub fn notify() -> FunctionDef {
    FunctionDef::new(BUILTIN_KIND, FunctionType::Action, "notify", vec![])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_validate() {
        for f in [timer(), attimer(), ontimer(), notify()] {
            assert!(f.validate().is_ok(), "{} failed validation", f.name);
        }
    }

    #[test]
    fn test_timer_shape() {
        let t = timer();
        assert!(t.is_monitorable);
        assert_eq!(t.out_params().count(), 1);
    }
}
