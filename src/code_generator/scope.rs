//! # Compilation Scope
//!
//! The symbol table the operator compiler threads through a rule: name ->
//! register bindings for the current tuple, plus the reserved `$output`
//! and `$outputType` keys holding the tuple value and its type tag.
//!
//! Scopes are saved and restored wholesale (by clone) around nested
//! blocks, which gives the same lexical behavior as a chained table.

use std::collections::BTreeMap;

use crate::code_generator::instr::Register;
use crate::types::Type;

/// What a scope name is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    /// A tuple field or lambda argument
    Scalar,
    /// A stream/table declaration (an async generator function)
    Declaration,
    /// An action declaration (a procedure)
    Procedure,
    /// A program-level assignment
    Assignment,
}

/// One binding.
#[derive(Debug, Clone)]
pub struct ScopeEntry {
    pub kind: ScopeKind,
    pub tt_type: Option<Type>,
    pub register: Register,
    /// Whether the name participates in edge-new tuple comparison
    /// (out parameters only, never inputs)
    pub is_in_var_scope_names: bool,
}

impl ScopeEntry {
    pub fn scalar(register: Register, tt_type: Option<Type>) -> Self {
        ScopeEntry { kind: ScopeKind::Scalar, tt_type, register, is_in_var_scope_names: false }
    }
}

const OUTPUT: &str = "$output";
const OUTPUT_TYPE: &str = "$outputType";

/// The scope proper.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    bindings: BTreeMap<String, ScopeEntry>,
}

impl Scope {
    pub fn new() -> Self {
        Scope::default()
    }

    pub fn get(&self, name: &str) -> Option<&ScopeEntry> {
        self.bindings.get(name)
    }

    pub fn has(&self, name: &str) -> bool {
        self.bindings.contains_key(name)
    }

    pub fn set(&mut self, name: impl Into<String>, entry: ScopeEntry) {
        self.bindings.insert(name.into(), entry);
    }

    /// Tuple-field bindings, skipping the reserved `$`-prefixed keys.
    pub fn tuple_entries(&self) -> impl Iterator<Item = (&str, &ScopeEntry)> {
        self.bindings
            .iter()
            .filter(|(name, _)| !name.starts_with('$'))
            .map(|(name, entry)| (name.as_str(), entry))
    }

    /// Drop every tuple-field binding, keeping the reserved keys.
    pub fn clear_tuple(&mut self) {
        self.bindings.retain(|name, _| name.starts_with('$'));
    }

    pub fn set_output(&mut self, register: Register) {
        self.bindings
            .insert(OUTPUT.to_string(), ScopeEntry::scalar(register, None));
    }

    pub fn output(&self) -> Option<Register> {
        self.bindings.get(OUTPUT).map(|e| e.register)
    }

    pub fn set_output_type(&mut self, register: Register) {
        self.bindings
            .insert(OUTPUT_TYPE.to_string(), ScopeEntry::scalar(register, None));
    }

    pub fn output_type(&self) -> Option<Register> {
        self.bindings.get(OUTPUT_TYPE).map(|e| e.register)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserved_keys_not_tuple_entries() {
        let mut scope = Scope::new();
        scope.set_output(1);
        scope.set_output_type(2);
        scope.set("text", ScopeEntry::scalar(3, Some(Type::String)));

        assert_eq!(scope.output(), Some(1));
        assert_eq!(scope.output_type(), Some(2));
        let names: Vec<&str> = scope.tuple_entries().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["text"]);
    }

    #[test]
    fn test_clear_tuple_keeps_reserved() {
        let mut scope = Scope::new();
        scope.set_output(1);
        scope.set("text", ScopeEntry::scalar(3, None));
        scope.clear_tuple();
        assert_eq!(scope.output(), Some(1));
        assert!(!scope.has("text"));
    }
}
