//! # Permission Rules
//!
//! The access-control vocabulary: a permission rule matches a principal
//! against what they may query and which actions they may trigger.
//! Checking rules against programs is an external collaborator's job; the
//! core only models and typechecks them.

use std::sync::Arc;

use super::expressions::BooleanExpression;
use super::functions::FunctionDef;

/// What a permission rule allows on one side (query or action).
#[derive(Debug, Clone, PartialEq)]
pub enum PermissionFunction {
    /// Only builtin functions (`notify`)
    Builtin,
    /// Any function of any class
    Star,
    /// Any function of one class
    ClassStar(String),
    /// One specific function, further restricted by a filter over its
    /// arguments
    Specified {
        kind: String,
        channel: String,
        filter: BooleanExpression,
        schema: Option<Arc<FunctionDef>>,
    },
}

/// One permission rule: `principal : query => action`.
#[derive(Debug, Clone, PartialEq)]
pub struct PermissionRule {
    /// Filter over `source`, the requesting principal
    pub principal: BooleanExpression,
    pub query: PermissionFunction,
    pub action: PermissionFunction,
}

impl PermissionRule {
    /// A rule allowing everything, the starting point for builders.
    pub fn allow_all() -> Self {
        PermissionRule {
            principal: BooleanExpression::True,
            query: PermissionFunction::Star,
            action: PermissionFunction::Star,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allow_all() {
        let rule = PermissionRule::allow_all();
        assert!(rule.principal.is_true());
        assert_eq!(rule.query, PermissionFunction::Star);
    }
}
