//! # Class and Function Metadata
//!
//! The schema side of the AST: device classes, their query/action function
//! signatures, datasets of examples, and entity type records. These are the
//! artifacts the schema retriever caches and the typechecker attaches to
//! expression nodes.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::types::Type;
use crate::value::Value;

/// Whether a function is a query (produces tuples) or an action (consumes
/// one).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum FunctionType {
    Query,
    Action,
}

impl FunctionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FunctionType::Query => "query",
            FunctionType::Action => "action",
        }
    }
}

/// Direction of a function argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Required input
    InReq,
    /// Optional input
    InOpt,
    /// Output column
    Out,
}

impl Direction {
    pub fn is_input(&self) -> bool {
        matches!(self, Direction::InReq | Direction::InOpt)
    }

    pub fn is_output(&self) -> bool {
        matches!(self, Direction::Out)
    }
}

/// One argument of a function signature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArgumentDef {
    pub direction: Direction,
    pub name: String,
    #[serde(rename = "type")]
    pub arg_type: Type,
    /// Natural-language metadata (canonical forms, prompts)
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    /// Implementation annotations
    #[serde(default)]
    pub annotations: HashMap<String, Value>,
}

impl ArgumentDef {
    pub fn new(direction: Direction, name: impl Into<String>, arg_type: Type) -> Self {
        ArgumentDef {
            direction,
            name: name.into(),
            arg_type,
            metadata: HashMap::new(),
            annotations: HashMap::new(),
        }
    }

    /// Whether this argument names a field inside a compound argument
    /// (flattened form, e.g. `address.street`).
    pub fn is_compound_field(&self) -> bool {
        self.name.contains('.')
    }
}

/// The signature and metadata of one device function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDef {
    /// Device class this function belongs to
    pub kind: String,
    pub function_type: FunctionType,
    pub name: String,
    /// Arguments in declaration order
    pub args: Vec<ArgumentDef>,
    /// Whether a query returns multiple tuples
    #[serde(default)]
    pub is_list: bool,
    /// Whether a query can be monitored for changes
    #[serde(default)]
    pub is_monitorable: bool,
    /// Output parameters a projection can never drop
    #[serde(default)]
    pub minimal_projection: BTreeSet<String>,
    /// Output parameters shown when the user asks for "everything"
    #[serde(default)]
    pub default_projection: BTreeSet<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub annotations: HashMap<String, Value>,
}

impl FunctionDef {
    pub fn new(
        kind: impl Into<String>,
        function_type: FunctionType,
        name: impl Into<String>,
        args: Vec<ArgumentDef>,
    ) -> Self {
        FunctionDef {
            kind: kind.into(),
            function_type,
            name: name.into(),
            args,
            is_list: false,
            is_monitorable: false,
            minimal_projection: BTreeSet::new(),
            default_projection: BTreeSet::new(),
            metadata: HashMap::new(),
            annotations: HashMap::new(),
        }
    }

    pub fn arg(&self, name: &str) -> Option<&ArgumentDef> {
        self.args.iter().find(|a| a.name == name)
    }

    pub fn has_argument(&self, name: &str) -> bool {
        self.arg(name).is_some()
    }

    pub fn arg_names(&self) -> impl Iterator<Item = &str> {
        self.args.iter().map(|a| a.name.as_str())
    }

    pub fn in_params(&self) -> impl Iterator<Item = &ArgumentDef> {
        self.args.iter().filter(|a| a.direction.is_input())
    }

    pub fn out_params(&self) -> impl Iterator<Item = &ArgumentDef> {
        self.args.iter().filter(|a| a.direction.is_output())
    }

    /// Whether the `#[handle_thingtalk]` annotation is set, meaning the
    /// device can evaluate whole query subtrees by itself.
    pub fn handles_own_queries(&self) -> bool {
        matches!(
            self.annotations.get("handle_thingtalk"),
            Some(Value::Boolean(true))
        )
    }

    /// Check the structural invariants of a function signature: unique
    /// argument names and `minimal_projection ⊆ args`.
    pub fn validate(&self) -> Result<(), String> {
        let mut seen = BTreeSet::new();
        for arg in &self.args {
            if !seen.insert(arg.name.as_str()) {
                return Err(format!(
                    "duplicate argument {} in {}.{}",
                    arg.name, self.kind, self.name
                ));
            }
        }
        for name in &self.minimal_projection {
            if !self.has_argument(name) {
                return Err(format!(
                    "minimal projection names unknown argument {} in {}.{}",
                    name, self.kind, self.name
                ));
            }
        }
        Ok(())
    }

    /// Derive a new signature keeping only the arguments `keep` accepts.
    /// Input parameters always survive; the minimal projection is clamped
    /// to the surviving outputs.
    pub fn filter_arguments(&self, keep: impl Fn(&ArgumentDef) -> bool) -> FunctionDef {
        let mut out = self.clone();
        out.args.retain(|a| a.direction.is_input() || keep(a));
        let names: BTreeSet<String> = out.args.iter().map(|a| a.name.clone()).collect();
        out.minimal_projection = out
            .minimal_projection
            .intersection(&names)
            .cloned()
            .collect();
        out.default_projection = out
            .default_projection
            .intersection(&names)
            .cloned()
            .collect();
        out
    }

    /// Derive a signature with one extra output column appended.
    pub fn with_output(&self, name: impl Into<String>, arg_type: Type) -> FunctionDef {
        let mut out = self.clone();
        out.args
            .push(ArgumentDef::new(Direction::Out, name, arg_type));
        out
    }

    /// Merge the outputs of two signatures, as a join does. On a name
    /// clash the right side wins, matching the runtime's tuple merge.
    pub fn join(&self, other: &FunctionDef) -> FunctionDef {
        let mut out = self.clone();
        out.is_list = self.is_list || other.is_list;
        out.is_monitorable = self.is_monitorable && other.is_monitorable;
        for arg in other.out_params() {
            out.args.retain(|a| a.name != arg.name || a.direction.is_input());
            out.args.push(arg.clone());
        }
        out.minimal_projection = self
            .minimal_projection
            .union(&other.minimal_projection)
            .cloned()
            .collect();
        out.default_projection = self
            .default_projection
            .union(&other.default_projection)
            .cloned()
            .collect();
        out
    }
}

/// An entity type declared by a class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityDecl {
    pub name: String,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// A device class: a namespaced bundle of query and action functions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassDef {
    pub kind: String,
    #[serde(default)]
    pub extends: Vec<String>,
    #[serde(default)]
    pub queries: BTreeMap<String, FunctionDef>,
    #[serde(default)]
    pub actions: BTreeMap<String, FunctionDef>,
    #[serde(default)]
    pub entities: Vec<EntityDecl>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub annotations: HashMap<String, Value>,
}

impl ClassDef {
    pub fn new(kind: impl Into<String>) -> Self {
        ClassDef {
            kind: kind.into(),
            extends: Vec::new(),
            queries: BTreeMap::new(),
            actions: BTreeMap::new(),
            entities: Vec::new(),
            metadata: HashMap::new(),
            annotations: HashMap::new(),
        }
    }

    pub fn with_query(mut self, function: FunctionDef) -> Self {
        self.queries.insert(function.name.clone(), function);
        self
    }

    pub fn with_action(mut self, function: FunctionDef) -> Self {
        self.actions.insert(function.name.clone(), function);
        self
    }

    pub fn get_query(&self, name: &str) -> Option<&FunctionDef> {
        self.queries.get(name)
    }

    pub fn get_action(&self, name: &str) -> Option<&FunctionDef> {
        self.actions.get(name)
    }

    /// Check every function in the class, and that functions agree with
    /// the class on the `kind` they claim.
    pub fn validate(&self) -> Result<(), String> {
        for f in self.queries.values().chain(self.actions.values()) {
            if f.kind != self.kind {
                return Err(format!(
                    "function {}.{} declared inside class {}",
                    f.kind, f.name, self.kind
                ));
            }
            f.validate()?;
        }
        Ok(())
    }
}

/// A natural-language example attached to a dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Example {
    pub id: i64,
    /// The example program, in surface syntax
    pub program: String,
    #[serde(default)]
    pub utterances: Vec<String>,
    #[serde(default)]
    pub preprocessed: Vec<String>,
}

/// A named collection of examples for one or more classes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub name: String,
    #[serde(default)]
    pub examples: Vec<Example>,
}

/// Catalog record describing one entity type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityTypeRecord {
    #[serde(rename = "type")]
    pub entity_type: String,
    #[serde(default)]
    pub is_well_known: bool,
    #[serde(default)]
    pub has_ner_support: bool,
    #[serde(default)]
    pub subtype_of: Option<Vec<String>>,
}

/// A mixin declaration from the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MixinDecl {
    pub kind: String,
    #[serde(default)]
    pub module_type: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
}

/// The document form a catalog reply deserializes into: zero or more
/// classes plus their datasets.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Library {
    #[serde(default)]
    pub classes: Vec<ClassDef>,
    #[serde(default)]
    pub datasets: Vec<Dataset>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query_fn() -> FunctionDef {
        let mut f = FunctionDef::new(
            "com.example",
            FunctionType::Query,
            "posts",
            vec![
                ArgumentDef::new(Direction::InOpt, "count", Type::Number),
                ArgumentDef::new(Direction::Out, "text", Type::String),
                ArgumentDef::new(Direction::Out, "author", Type::Entity("tt:username".into())),
            ],
        );
        f.is_list = true;
        f.is_monitorable = true;
        f.minimal_projection.insert("text".to_string());
        f
    }

    #[test]
    fn test_validate_duplicate_args() {
        let mut f = query_fn();
        f.args.push(ArgumentDef::new(Direction::Out, "text", Type::String));
        assert!(f.validate().is_err());
    }

    #[test]
    fn test_validate_minimal_projection_subset() {
        let mut f = query_fn();
        f.minimal_projection.insert("missing".to_string());
        assert!(f.validate().is_err());
        assert!(query_fn().validate().is_ok());
    }

    #[test]
    fn test_filter_arguments_keeps_inputs() {
        let f = query_fn();
        let projected = f.filter_arguments(|a| a.name == "author");
        assert!(projected.has_argument("count"));
        assert!(projected.has_argument("author"));
        assert!(!projected.has_argument("text"));
        assert!(projected.minimal_projection.is_empty());
    }

    #[test]
    fn test_join_merges_outputs() {
        let f = query_fn();
        let g = FunctionDef::new(
            "com.other",
            FunctionType::Query,
            "profile",
            vec![ArgumentDef::new(Direction::Out, "bio", Type::String)],
        );
        let joined = f.join(&g);
        assert!(joined.has_argument("text"));
        assert!(joined.has_argument("bio"));
        assert!(!joined.is_monitorable);
    }

    #[test]
    fn test_library_round_trips_through_json() {
        let class = ClassDef::new("com.example").with_query(query_fn());
        let lib = Library { classes: vec![class], datasets: vec![] };
        let text = serde_json::to_string(&lib).unwrap();
        let back: Library = serde_json::from_str(&text).unwrap();
        assert_eq!(lib, back);
    }
}
