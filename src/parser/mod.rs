//! # Shift-Reduce Parser Runtime
//!
//! Table-driven LALR engine. The grammar lives outside the crate: a parser
//! generator produces six tables offline and the runtime here just drives
//! them over a token stream. Two modes are supported: semantic mode runs
//! the semantic actions and returns the grammar's root value, while
//! reduce-sequence mode returns only the list of rule ids applied (used
//! for grammar analysis).
//!
//! ```text
//! Tokens + ParseTables -> [Parser] -> AST root (or Vec<rule id>)
//! ```

use std::collections::HashMap;
use std::fmt;

use thiserror::Error;

/// Canonical end-of-input terminal name emitted by the current generator.
pub const EOF_TERMINAL: &str = " 1EOF";
/// End-of-input terminal name emitted by older generators; accepted as an
/// alias at table-load time.
pub const LEGACY_EOF_TERMINAL: &str = "<<EOF>>";

// ============================================================================
// Source locations
// ============================================================================

/// A point in the source text. `token` is the incremental token index the
/// parser assigns, alongside the lexer-provided line/column/offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Location {
    pub line: u32,
    pub column: u32,
    pub offset: u32,
    pub token: u32,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}, column {}", self.line, self.column)
    }
}

/// A half-open range of source text covered by a token or a reduction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SourceRange {
    pub start: Location,
    pub end: Location,
}

impl SourceRange {
    pub fn union(a: SourceRange, b: SourceRange) -> SourceRange {
        SourceRange {
            start: if a.start.offset <= b.start.offset { a.start } else { b.start },
            end: if a.end.offset >= b.end.offset { a.end } else { b.end },
        }
    }
}

impl fmt::Display for SourceRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.start)
    }
}

/// One token from the external lexer. The value is whatever the semantic
/// actions expect on the result stack for that terminal.
#[derive(Debug, Clone)]
pub struct Token<V> {
    pub kind: String,
    pub value: V,
    pub range: SourceRange,
}

impl<V> Token<V> {
    pub fn new(kind: impl Into<String>, value: V, range: SourceRange) -> Self {
        Token { kind: kind.into(), value, range }
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Parse failure. `UnexpectedToken` enumerates the terminals that would
/// have had a valid action in the state where parsing stopped.
#[derive(Debug, Clone, Error)]
pub enum SyntaxError {
    #[error("unexpected token {token} at {location} (expected {})", expected.join(", "))]
    UnexpectedToken {
        token: String,
        location: SourceRange,
        expected: Vec<String>,
    },
    /// Raised by a semantic action through [`RuleContext::error`]
    #[error("{message} at {location}")]
    Semantic {
        message: String,
        location: SourceRange,
    },
    #[error("malformed parse tables: {0}")]
    BadTables(String),
}

// ============================================================================
// Parse tables
// ============================================================================

/// One entry of the `PARSER_ACTION` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserAction {
    Accept,
    Shift(usize),
    Reduce(usize),
}

/// The interface object semantic actions receive: the caller's options
/// plus the source range of the reduction.
pub struct RuleContext<'a, O> {
    pub options: &'a O,
    pub location: SourceRange,
}

impl<'a, O> RuleContext<'a, O> {
    /// Build a [`SyntaxError`] anchored at this reduction.
    pub fn error(&self, message: impl Into<String>) -> SyntaxError {
        SyntaxError::Semantic {
            message: message.into(),
            location: self.location,
        }
    }
}

/// A semantic action: receives the popped values for the rule's right-hand
/// side, produces the value for its left-hand side.
pub type SemanticAction<V, O> =
    Box<dyn Fn(&RuleContext<'_, O>, Vec<V>) -> Result<V, SyntaxError> + Send + Sync>;

/// The six tables produced offline by the parser generator.
pub struct ParseTables<V, O> {
    /// terminal name -> terminal id
    pub terminal_ids: HashMap<String, usize>,
    /// rule id -> left-hand-side non-terminal id
    pub rule_non_terminals: Vec<usize>,
    /// rule id -> number of symbols on the right-hand side
    pub arity: Vec<usize>,
    /// state -> non-terminal id -> next state
    pub goto: Vec<HashMap<usize, usize>>,
    /// state -> terminal id -> action
    pub action: Vec<HashMap<usize, ParserAction>>,
    /// rule id -> semantic action
    pub semantic_actions: Vec<SemanticAction<V, O>>,
}

impl<V, O> ParseTables<V, O> {
    /// The end-of-input terminal id, accepting both the current and the
    /// legacy spelling.
    fn eof_id(&self) -> Result<usize, SyntaxError> {
        self.terminal_ids
            .get(EOF_TERMINAL)
            .or_else(|| self.terminal_ids.get(LEGACY_EOF_TERMINAL))
            .copied()
            .ok_or_else(|| SyntaxError::BadTables("no end-of-input terminal".to_string()))
    }

    fn terminal_id(&self, kind: &str) -> Result<usize, SyntaxError> {
        self.terminal_ids
            .get(kind)
            .copied()
            .ok_or_else(|| SyntaxError::BadTables(format!("unknown terminal {kind}")))
    }

    /// Terminal names with a valid action in `state`, for error messages.
    fn expected_in(&self, state: usize) -> Vec<String> {
        let mut expected: Vec<String> = self
            .terminal_ids
            .iter()
            .filter(|(_, id)| {
                self.action
                    .get(state)
                    .map(|row| row.contains_key(*id))
                    .unwrap_or(false)
            })
            .map(|(name, _)| name.clone())
            .collect();
        expected.sort();
        expected
    }
}

// ============================================================================
// Parser
// ============================================================================

/// The shift-reduce engine. One instance per parse; the tables are shared.
pub struct Parser<'t, V, O> {
    tables: &'t ParseTables<V, O>,
    options: O,
}

impl<'t, V, O> Parser<'t, V, O> {
    pub fn new(tables: &'t ParseTables<V, O>, options: O) -> Self {
        Parser { tables, options }
    }

    /// Semantic mode: run the actions, return the grammar's root value.
    pub fn parse<I>(&self, tokens: I) -> Result<V, SyntaxError>
    where
        I: IntoIterator<Item = Token<V>>,
    {
        let eof = self.tables.eof_id()?;
        let mut states: Vec<usize> = vec![0];
        let mut results: Vec<(V, SourceRange)> = Vec::new();
        let mut token_index: u32 = 0;
        let mut last_range = SourceRange::default();

        for token in tokens {
            let Token { kind, value, mut range } = token;
            range.start.token = token_index;
            range.end.token = token_index;
            token_index += 1;
            last_range = range;
            let term = self.tables.terminal_id(&kind)?;
            if let Some(root) =
                self.step(&mut states, &mut results, term, &kind, range, Some(value))?
            {
                return Ok(root);
            }
        }

        // Feed the synthetic end-of-input token; Accept fires here.
        let eof_range = SourceRange { start: last_range.end, end: last_range.end };
        match self.step(&mut states, &mut results, eof, EOF_TERMINAL, eof_range, None)? {
            Some(value) => Ok(value),
            None => Err(SyntaxError::BadTables(
                "parser did not accept at end of input".to_string(),
            )),
        }
    }

    /// Reduce-sequence mode: run no actions, return the rule ids applied.
    pub fn parse_reduce_sequence<I, T>(&self, tokens: I) -> Result<Vec<usize>, SyntaxError>
    where
        I: IntoIterator<Item = Token<T>>,
    {
        let eof = self.tables.eof_id()?;
        let mut states: Vec<usize> = vec![0];
        let mut sequence = Vec::new();
        let mut last_range = SourceRange::default();

        let feed = |states: &mut Vec<usize>,
                        term: usize,
                        kind: &str,
                        range: SourceRange,
                        sequence: &mut Vec<usize>|
         -> Result<bool, SyntaxError> {
            loop {
                let state = *states.last().ok_or_else(|| {
                    SyntaxError::BadTables("empty state stack".to_string())
                })?;
                let action = self
                    .tables
                    .action
                    .get(state)
                    .and_then(|row| row.get(&term))
                    .copied();
                match action {
                    None => {
                        return Err(SyntaxError::UnexpectedToken {
                            token: kind.to_string(),
                            location: range,
                            expected: self.tables.expected_in(state),
                        })
                    }
                    Some(ParserAction::Accept) => return Ok(true),
                    Some(ParserAction::Shift(next)) => {
                        states.push(next);
                        return Ok(false);
                    }
                    Some(ParserAction::Reduce(rule)) => {
                        let arity = self.rule_arity(rule)?;
                        let new_len = states.len().saturating_sub(arity);
                        states.truncate(new_len);
                        let goto_state = self.goto_state(&*states, rule)?;
                        states.push(goto_state);
                        sequence.push(rule);
                    }
                }
            }
        };

        for token in tokens {
            last_range = token.range;
            let term = self.tables.terminal_id(&token.kind)?;
            if feed(&mut states, term, &token.kind, token.range, &mut sequence)? {
                return Ok(sequence);
            }
        }
        let eof_range = SourceRange { start: last_range.end, end: last_range.end };
        if feed(&mut states, eof, EOF_TERMINAL, eof_range, &mut sequence)? {
            Ok(sequence)
        } else {
            Err(SyntaxError::BadTables(
                "parser did not accept at end of input".to_string(),
            ))
        }
    }

    /// Drive the machine over one lookahead token. Returns the root value
    /// on Accept. `value` is `None` only for the synthetic EOF token.
    fn step(
        &self,
        states: &mut Vec<usize>,
        results: &mut Vec<(V, SourceRange)>,
        term: usize,
        kind: &str,
        range: SourceRange,
        value: Option<V>,
    ) -> Result<Option<V>, SyntaxError> {
        let mut value = value;
        loop {
            let state = *states
                .last()
                .ok_or_else(|| SyntaxError::BadTables("empty state stack".to_string()))?;
            let action = self
                .tables
                .action
                .get(state)
                .and_then(|row| row.get(&term))
                .copied();
            match action {
                None => {
                    return Err(SyntaxError::UnexpectedToken {
                        token: kind.to_string(),
                        location: range,
                        expected: self.tables.expected_in(state),
                    })
                }
                Some(ParserAction::Accept) => {
                    let (root, _) = results.pop().ok_or_else(|| {
                        SyntaxError::BadTables("accept with empty result stack".to_string())
                    })?;
                    return Ok(Some(root));
                }
                Some(ParserAction::Shift(next)) => {
                    states.push(next);
                    match value.take() {
                        Some(v) => results.push((v, range)),
                        None => {
                            return Err(SyntaxError::BadTables(
                                "shift action on end-of-input".to_string(),
                            ))
                        }
                    }
                    return Ok(None);
                }
                Some(ParserAction::Reduce(rule)) => {
                    self.reduce(states, results, rule)?;
                }
            }
        }
    }

    fn reduce(
        &self,
        states: &mut Vec<usize>,
        results: &mut Vec<(V, SourceRange)>,
        rule: usize,
    ) -> Result<(), SyntaxError> {
        let arity = self.rule_arity(rule)?;
        if results.len() < arity || states.len() <= arity {
            return Err(SyntaxError::BadTables(format!(
                "stack underflow reducing rule {rule}"
            )));
        }

        let popped: Vec<(V, SourceRange)> = results.split_off(results.len() - arity);
        states.truncate(states.len() - arity);

        let location = popped
            .iter()
            .map(|(_, r)| *r)
            .reduce(SourceRange::union)
            .unwrap_or_default();
        let values: Vec<V> = popped.into_iter().map(|(v, _)| v).collect();

        let semantic = self.tables.semantic_actions.get(rule).ok_or_else(|| {
            SyntaxError::BadTables(format!("no semantic action for rule {rule}"))
        })?;
        let context = RuleContext { options: &self.options, location };
        let value = semantic(&context, values)?;

        let goto_state = self.goto_state(&*states, rule)?;
        states.push(goto_state);
        results.push((value, location));
        Ok(())
    }

    fn rule_arity(&self, rule: usize) -> Result<usize, SyntaxError> {
        self.tables
            .arity
            .get(rule)
            .copied()
            .ok_or_else(|| SyntaxError::BadTables(format!("unknown rule {rule}")))
    }

    fn goto_state(&self, states: &[usize], rule: usize) -> Result<usize, SyntaxError> {
        let state = *states
            .last()
            .ok_or_else(|| SyntaxError::BadTables("empty state stack".to_string()))?;
        let nt = self
            .tables
            .rule_non_terminals
            .get(rule)
            .copied()
            .ok_or_else(|| SyntaxError::BadTables(format!("unknown rule {rule}")))?;
        self.tables
            .goto
            .get(state)
            .and_then(|row| row.get(&nt))
            .copied()
            .ok_or_else(|| {
                SyntaxError::BadTables(format!("no goto for state {state}, non-terminal {nt}"))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Toy grammar over terminals `n` and `+`:
    //   rule 0: $start := E        (accept wrapper, arity 1)
    //   rule 1: E := E + n         (arity 3)
    //   rule 2: E := n             (arity 1)
    // Values are i64; `+` sums.
    fn sum_tables() -> ParseTables<i64, ()> {
        let mut terminal_ids = HashMap::new();
        terminal_ids.insert("n".to_string(), 0);
        terminal_ids.insert("+".to_string(), 1);
        terminal_ids.insert(EOF_TERMINAL.to_string(), 2);

        // States: 0 start, 1 after n (reduce E:=n), 2 after E, 3 after E +,
        // 4 after E + n (reduce E:=E+n)
        let mut action: Vec<HashMap<usize, ParserAction>> = vec![HashMap::new(); 5];
        action[0].insert(0, ParserAction::Shift(1));
        action[1].insert(1, ParserAction::Reduce(2));
        action[1].insert(2, ParserAction::Reduce(2));
        action[2].insert(1, ParserAction::Shift(3));
        action[2].insert(2, ParserAction::Accept);
        action[3].insert(0, ParserAction::Shift(4));
        action[4].insert(1, ParserAction::Reduce(1));
        action[4].insert(2, ParserAction::Reduce(1));

        let mut goto: Vec<HashMap<usize, usize>> = vec![HashMap::new(); 5];
        goto[0].insert(0, 2); // E in state 0 -> 2

        let semantic_actions: Vec<SemanticAction<i64, ()>> = vec![
            Box::new(|_, mut v| Ok(v.remove(0))),
            Box::new(|_, v| Ok(v[0] + v[2])),
            Box::new(|_, mut v| Ok(v.remove(0))),
        ];

        ParseTables {
            terminal_ids,
            rule_non_terminals: vec![1, 0, 0],
            arity: vec![1, 3, 1],
            goto,
            action,
            semantic_actions,
        }
    }

    fn tok(kind: &str, value: i64, offset: u32) -> Token<i64> {
        let loc = Location { line: 1, column: offset, offset, token: 0 };
        Token::new(kind, value, SourceRange { start: loc, end: loc })
    }

    #[test]
    fn test_parse_sum() {
        let tables = sum_tables();
        let parser = Parser::new(&tables, ());
        let result = parser
            .parse(vec![tok("n", 1, 0), tok("+", 0, 1), tok("n", 2, 2), tok("+", 0, 3), tok("n", 4, 4)])
            .unwrap();
        assert_eq!(result, 7);
    }

    #[test]
    fn test_parse_single() {
        let tables = sum_tables();
        let parser = Parser::new(&tables, ());
        assert_eq!(parser.parse(vec![tok("n", 42, 0)]).unwrap(), 42);
    }

    #[test]
    fn test_syntax_error_lists_expected() {
        let tables = sum_tables();
        let parser = Parser::new(&tables, ());
        let err = parser
            .parse(vec![tok("n", 1, 0), tok("n", 2, 1)])
            .unwrap_err();
        match err {
            SyntaxError::UnexpectedToken { token, expected, .. } => {
                assert_eq!(token, "n");
                assert!(expected.contains(&"+".to_string()));
                assert!(expected.contains(&EOF_TERMINAL.to_string()));
            }
            other => panic!("expected UnexpectedToken, got {other}"),
        }
    }

    #[test]
    fn test_reduce_sequence_mode() {
        let tables = sum_tables();
        let parser = Parser::new(&tables, ());
        let seq = parser
            .parse_reduce_sequence(vec![tok("n", 1, 0), tok("+", 0, 1), tok("n", 2, 2)])
            .unwrap();
        // E:=n first, then E:=E+n when the lookahead is EOF
        assert_eq!(seq, vec![2, 1]);
    }

    #[test]
    fn test_legacy_eof_alias() {
        let mut tables = sum_tables();
        let id = tables.terminal_ids.remove(EOF_TERMINAL).unwrap();
        tables.terminal_ids.insert(LEGACY_EOF_TERMINAL.to_string(), id);
        let parser = Parser::new(&tables, ());
        assert_eq!(parser.parse(vec![tok("n", 5, 0)]).unwrap(), 5);
    }
}
