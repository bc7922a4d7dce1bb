//! Parser Runtime Tests
//!
//! Drives the shift-reduce engine through a small arithmetic grammar in
//! both modes, and checks the structured error surface.

use std::collections::HashMap;

use thingtalk::parser::{
    Location, ParseTables, Parser, ParserAction, RuleContext, SemanticAction, SourceRange,
    SyntaxError, Token, EOF_TERMINAL, LEGACY_EOF_TERMINAL,
};

/// Grammar:
/// ```text
/// rule 0: $start := E            (arity 1)
/// rule 1: E := E + T             (arity 3)
/// rule 2: E := T                 (arity 1)
/// rule 3: T := n                 (arity 1)
/// rule 4: T := ( E )             (arity 3)
/// ```
/// Terminals: n(0) +(1) ((2) )(3) EOF(4); non-terminals: E(0) T(1).
fn arith_tables() -> ParseTables<i64, ()> {
    let mut terminal_ids = HashMap::new();
    for (name, id) in [("n", 0), ("+", 1), ("(", 2), (")", 3), (EOF_TERMINAL, 4)] {
        terminal_ids.insert(name.to_string(), id);
    }

    // states:
    // 0 start | 1 after n | 2 after E (accept state) | 3 after T
    // 4 after E + | 5 after E + T | 6 after ( | 7 after ( E | 8 after ( E )
    let mut action: Vec<HashMap<usize, ParserAction>> = vec![HashMap::new(); 9];
    let mut goto: Vec<HashMap<usize, usize>> = vec![HashMap::new(); 9];

    for state in [0usize, 4, 6] {
        action[state].insert(0, ParserAction::Shift(1));
        action[state].insert(2, ParserAction::Shift(6));
    }
    for follow in [1usize, 3, 4] {
        action[1].insert(follow, ParserAction::Reduce(3));
        action[3].insert(follow, ParserAction::Reduce(2));
        action[5].insert(follow, ParserAction::Reduce(1));
        action[8].insert(follow, ParserAction::Reduce(4));
    }
    action[2].insert(1, ParserAction::Shift(4));
    action[2].insert(4, ParserAction::Accept);
    action[7].insert(1, ParserAction::Shift(4));
    action[7].insert(3, ParserAction::Shift(8));

    goto[0].insert(0, 2);
    goto[0].insert(1, 3);
    goto[4].insert(1, 5);
    goto[6].insert(0, 7);
    goto[6].insert(1, 3);

    let semantic_actions: Vec<SemanticAction<i64, ()>> = vec![
        Box::new(|_, mut v| Ok(v.remove(0))),
        Box::new(|_, v| Ok(v[0] + v[2])),
        Box::new(|_, mut v| Ok(v.remove(0))),
        Box::new(|ctx: &RuleContext<'_, ()>, v: Vec<i64>| {
            if v[0] < 0 {
                Err(ctx.error("negative literals are not allowed"))
            } else {
                Ok(v[0])
            }
        }),
        Box::new(|_, v| Ok(v[1])),
    ];

    ParseTables {
        terminal_ids,
        rule_non_terminals: vec![2, 0, 0, 1, 1],
        arity: vec![1, 3, 1, 1, 3],
        goto,
        action,
        semantic_actions,
    }
}

fn tokens(input: &[(&str, i64)]) -> Vec<Token<i64>> {
    input
        .iter()
        .enumerate()
        .map(|(i, (kind, value))| {
            let loc = Location { line: 1, column: i as u32 + 1, offset: i as u32, token: 0 };
            Token::new(*kind, *value, SourceRange { start: loc, end: loc })
        })
        .collect()
}

#[test]
fn parses_nested_expression() {
    let tables = arith_tables();
    let parser = Parser::new(&tables, ());
    // (1 + 2) + 3
    let result = parser
        .parse(tokens(&[
            ("(", 0),
            ("n", 1),
            ("+", 0),
            ("n", 2),
            (")", 0),
            ("+", 0),
            ("n", 3),
        ]))
        .unwrap();
    assert_eq!(result, 6);
}

#[test]
fn error_enumerates_expected_terminals() {
    let tables = arith_tables();
    let parser = Parser::new(&tables, ());
    // "+ 1" starts with an operator: only n and ( are valid openers
    let err = parser.parse(tokens(&[("+", 0), ("n", 1)])).unwrap_err();
    match err {
        SyntaxError::UnexpectedToken { token, expected, location } => {
            assert_eq!(token, "+");
            assert_eq!(expected, vec!["(".to_string(), "n".to_string()]);
            assert_eq!(location.start.line, 1);
        }
        other => panic!("expected UnexpectedToken, got {other}"),
    }
}

#[test]
fn error_message_is_readable() {
    let tables = arith_tables();
    let parser = Parser::new(&tables, ());
    let err = parser.parse(tokens(&[(")", 0)])).unwrap_err();
    let message = err.to_string();
    assert!(message.contains("unexpected token )"));
    assert!(message.contains("expected"));
}

#[test]
fn semantic_actions_can_reject() {
    let tables = arith_tables();
    let parser = Parser::new(&tables, ());
    let err = parser.parse(tokens(&[("n", -1)])).unwrap_err();
    assert!(matches!(err, SyntaxError::Semantic { .. }));
    assert!(err.to_string().contains("negative literals"));
}

#[test]
fn reduce_sequence_mode_runs_no_actions() {
    let tables = arith_tables();
    let parser = Parser::new(&tables, ());
    // a negative literal would fail in semantic mode; reduce-sequence
    // mode never runs the actions
    let sequence = parser
        .parse_reduce_sequence(tokens(&[("n", -1), ("+", 0), ("n", 2)]))
        .unwrap();
    // T:=n, E:=T, then T:=n and E:=E+T at end of input
    assert_eq!(sequence, vec![3, 2, 3, 1]);
}

#[test]
fn token_indices_are_assigned_incrementally() {
    let tables = arith_tables();
    let parser = Parser::new(&tables, ());
    let err = parser
        .parse(tokens(&[("n", 1), ("+", 0), ("+", 0)]))
        .unwrap_err();
    match err {
        SyntaxError::UnexpectedToken { location, .. } => {
            assert_eq!(location.start.token, 2);
        }
        other => panic!("expected UnexpectedToken, got {other}"),
    }
}

#[test]
fn accepts_legacy_eof_terminal() {
    let mut tables = arith_tables();
    let id = tables.terminal_ids.remove(EOF_TERMINAL).unwrap();
    tables.terminal_ids.insert(LEGACY_EOF_TERMINAL.to_string(), id);
    let parser = Parser::new(&tables, ());
    assert_eq!(parser.parse(tokens(&[("n", 9)])).unwrap(), 9);
}
