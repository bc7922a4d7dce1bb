//! End-to-End Compiler Tests
//!
//! Full-pipeline scenarios: build an AST, typecheck it against an
//! in-memory catalog, lower, optimize, and check both the operator trees
//! and the emitted IR.

use std::sync::Arc;

use thingtalk::ast::{
    Action, ArgumentDef, BooleanExpression, ClassDef, DeviceSelector, Direction, FunctionDef,
    FunctionType, Invocation, Program, SortDirection, SortKey, Statement, Stream, Table,
};
use thingtalk::code_generator::compile_program;
use thingtalk::ir::{PointWiseOp, QueryInvocationHints, ReduceOp, RuleOp, StreamOp, TableOp};
use thingtalk::schema::{MemoryCatalog, SchemaRetriever};
use thingtalk::typecheck::typecheck_program;
use thingtalk::types::Type;
use thingtalk::value::Value;
use thingtalk::{Lowerer, Optimizer};

// ----------------------------------------------------------------------
// Fixtures
// ----------------------------------------------------------------------

fn twitter_class() -> ClassDef {
    let mut search = FunctionDef::new(
        "com.twitter",
        FunctionType::Query,
        "search",
        vec![
            ArgumentDef::new(Direction::InOpt, "count", Type::Number),
            ArgumentDef::new(Direction::InOpt, "query", Type::String),
            ArgumentDef::new(Direction::Out, "text", Type::String),
            ArgumentDef::new(Direction::Out, "author", Type::Entity("tt:username".to_string())),
        ],
    );
    search.is_list = true;
    search.is_monitorable = true;
    search.minimal_projection.insert("id".to_string());
    search
        .args
        .push(ArgumentDef::new(Direction::Out, "id", Type::Entity("com.twitter:tweet".to_string())));
    ClassDef::new("com.twitter").with_query(search)
}

fn thermostat_class() -> ClassDef {
    let mut temperature = FunctionDef::new(
        "org.thermostat",
        FunctionType::Query,
        "temperature",
        vec![
            ArgumentDef::new(Direction::InOpt, "unit", Type::Enum(Some(vec!["celsius".into(), "fahrenheit".into()]))),
            ArgumentDef::new(Direction::Out, "value", Type::Measure("C".to_string())),
        ],
    );
    temperature.is_monitorable = true;
    ClassDef::new("org.thermostat").with_query(temperature)
}

fn phone_class() -> ClassDef {
    ClassDef::new("org.phone").with_action(FunctionDef::new(
        "org.phone",
        FunctionType::Action,
        "send_sms",
        vec![ArgumentDef::new(Direction::InReq, "body", Type::String)],
    ))
}

fn weather_class() -> ClassDef {
    let mut current = FunctionDef::new(
        "org.weather",
        FunctionType::Query,
        "current",
        vec![
            ArgumentDef::new(Direction::Out, "temperature", Type::Measure("C".to_string())),
            ArgumentDef::new(Direction::Out, "condition", Type::String),
        ],
    );
    current.is_list = true;
    current.is_monitorable = true;
    ClassDef::new("org.weather").with_query(current)
}

fn lightbulb_class() -> ClassDef {
    ClassDef::new("com.lightbulb").with_action(FunctionDef::new(
        "com.lightbulb",
        FunctionType::Action,
        "set_power",
        vec![ArgumentDef::new(
            Direction::InReq,
            "power",
            Type::Enum(Some(vec!["on".to_string(), "off".to_string()])),
        )],
    ))
}

/// A device that evaluates whole query subtrees by itself
/// (`#[handle_thingtalk]` on every query).
fn database_class() -> ClassDef {
    let mut orders = FunctionDef::new(
        "org.database",
        FunctionType::Query,
        "orders",
        vec![
            ArgumentDef::new(Direction::Out, "customer", Type::String),
            ArgumentDef::new(Direction::Out, "amount", Type::Number),
        ],
    );
    orders.is_list = true;
    orders.annotations.insert("handle_thingtalk".to_string(), Value::Boolean(true));
    let mut customers = FunctionDef::new(
        "org.database",
        FunctionType::Query,
        "customers",
        vec![ArgumentDef::new(Direction::Out, "name", Type::String)],
    );
    customers.is_list = true;
    customers
        .annotations
        .insert("handle_thingtalk".to_string(), Value::Boolean(true));
    ClassDef::new("org.database")
        .with_query(orders)
        .with_query(customers)
}

fn retriever() -> SchemaRetriever {
    SchemaRetriever::new(Arc::new(
        MemoryCatalog::new()
            .with_class(twitter_class())
            .with_class(thermostat_class())
            .with_class(phone_class())
            .with_class(weather_class())
            .with_class(lightbulb_class())
            .with_class(database_class()),
    ))
}

fn invoke(kind: &str, channel: &str) -> Table {
    Table::Invocation {
        invocation: Invocation::new(DeviceSelector::new(kind), channel),
        schema: None,
    }
}

fn atom(name: &str, operator: &str, value: Value) -> BooleanExpression {
    BooleanExpression::Atom {
        name: name.to_string(),
        operator: operator.to_string(),
        value,
        overload: None,
    }
}

async fn lowered(mut program: Program) -> Vec<RuleOp> {
    let schemas = retriever();
    typecheck_program(&mut program, &schemas).await.expect("typecheck failed");
    let lowerer = Lowerer::new();
    let optimizer = Optimizer::new();
    lowerer
        .lower_program(&program)
        .expect("lowering failed")
        .into_iter()
        .map(|r| optimizer.optimize_rule(r))
        .collect()
}

async fn compiled(mut program: Program) -> thingtalk::CompiledProgram {
    let schemas = retriever();
    typecheck_program(&mut program, &schemas).await.expect("typecheck failed");
    compile_program(&program).expect("compilation failed")
}

/// Check that every occurrence of `needle` in `code` is preceded by an
/// unclosed `try {` (crude but effective for generated shapes).
fn inside_try(code: &str, needle: &str) {
    let mut search_from = 0;
    let mut found = false;
    while let Some(pos) = code[search_from..].find(needle) {
        found = true;
        let abs = search_from + pos;
        let before = &code[..abs];
        let opens = before.matches("try {").count();
        let closes = before.matches("} catch(").count();
        assert!(opens > closes, "{needle} at byte {abs} is not inside a try/catch");
        search_from = abs + needle.len();
    }
    assert!(found, "{needle} not found in generated code");
}

// ----------------------------------------------------------------------
// S1: now => @com.twitter.search(), text =~ "rust" => notify;
// ----------------------------------------------------------------------

fn s1_program() -> Program {
    let mut program = Program::new();
    program.rules.push(Statement::Command {
        table: Some(Table::Filter {
            table: Box::new(invoke("com.twitter", "search")),
            filter: atom("text", "=~", Value::String("rust".to_string())),
            schema: None,
        }),
        actions: vec![Action::Notify { schema: None }],
    });
    program
}

#[tokio::test]
async fn s1_operator_tree() {
    let rules = lowered(s1_program()).await;
    assert_eq!(rules.len(), 1);

    let StreamOp::InvokeTable { table, .. } = rules[0].stream.as_ref().unwrap() else {
        panic!("expected InvokeTable at the root of a command");
    };
    let TableOp::Filter { table: inner, filter, .. } = table.as_ref() else {
        panic!("expected a Filter over the invocation, got {table:?}");
    };
    assert!(matches!(
        filter,
        thingtalk::ir::BooleanExpressionOp::Atom { name, operator, .. }
            if name == "text" && operator == "=~"
    ));

    let TableOp::InvokeGet { invocation, hints, .. } = inner.as_ref() else {
        panic!("expected InvokeGet at the leaf, got {inner:?}");
    };
    assert_eq!(invocation.selector.kind, "com.twitter");
    assert_eq!(invocation.channel, "search");

    // projection: the filtered field plus the minimal projection
    let projection = hints.projection.as_ref().expect("leaf should carry a projection hint");
    assert!(projection.contains("text"));
    assert!(projection.contains("id"));
    assert!(!projection.contains("author"));
    // the filter was pushed down as a hint
    assert!(!hints.filter.is_true());
}

#[tokio::test]
async fn s1_generated_ir() {
    let compiled = compiled(s1_program()).await;
    let code = compiled.command.expect("commands compile into the command function");

    assert_eq!(code.matches("Failed to invoke query").count(), 1);
    assert_eq!(code.matches("await __env.invokeQuery(\"com.twitter\"").count(), 1);
    assert_eq!(code.matches("while (!").count(), 1);
    assert!(code.contains("__builtin.like("));
    assert!(code.contains("if ("));
    assert!(code.contains("await __env.output("));
    inside_try(&code, "await __env.invokeQuery");
}

// ----------------------------------------------------------------------
// S2: monitor(@org.thermostat.temperature()) on (value >= 30C)
//       => @org.phone.send_sms(body="hot");
// ----------------------------------------------------------------------

fn s2_program() -> Program {
    let mut program = Program::new();
    program.rules.push(Statement::Rule {
        stream: Stream::EdgeFilter {
            stream: Box::new(Stream::Monitor {
                table: Box::new(Table::Invocation {
                    invocation: Invocation::new(DeviceSelector::new("org.thermostat"), "temperature")
                        .with_param("unit", Value::Enum { value: "celsius".to_string() }),
                    schema: None,
                }),
                args: None,
                schema: None,
            }),
            filter: atom("value", ">=", Value::Measure { value: 30.0, unit: "C".to_string() }),
            schema: None,
        },
        actions: vec![Action::Invocation {
            invocation: Invocation::new(DeviceSelector::new("org.phone"), "send_sms")
                .with_param("body", Value::String("hot".to_string())),
            schema: None,
        }],
    });
    program
}

#[tokio::test]
async fn s2_operator_tree() {
    let rules = lowered(s2_program()).await;
    let StreamOp::EdgeFilter { stream, .. } = rules[0].stream.as_ref().unwrap() else {
        panic!("expected EdgeFilter at the root");
    };
    let StreamOp::EdgeNew { stream } = stream.as_ref() else {
        panic!("expected the monitor to dedup with EdgeNew");
    };
    assert!(matches!(stream.as_ref(), StreamOp::InvokeSubscribe { .. }));
    assert!(!rules[0].has_output);
}

#[tokio::test]
async fn s2_generated_ir() {
    let compiled = compiled(s2_program()).await;
    assert_eq!(compiled.rules.len(), 1);
    // one slot for the edge-new tuple set, one for the edge-filter flag
    assert_eq!(compiled.states, 2);

    let code = &compiled.rules[0];
    assert!(code.contains("await __env.invokeMonitor(\"org.thermostat\""));
    assert!(code.contains("await __env.readState("));
    assert!(code.contains("await __env.writeState("));
    inside_try(code, "await __env.invokeMonitor");
    inside_try(code, "await __env.invokeAction(\"org.phone\"");

    // property 7: watched keys are the out params, never the inputs
    let keys_line = code
        .lines()
        .find(|l| l.contains("__builtin.isNewTuple("))
        .expect("edge-new emits a tuple check");
    assert!(keys_line.contains("[\"value\"]"));
    assert!(!keys_line.contains("unit"));

    // write-if-changed, fire on rising edge
    assert!(code.contains(" !== "));
    assert!(code.contains(" && "));
}

// ----------------------------------------------------------------------
// S3: attimer(time=[08:00]) => @com.lightbulb.set_power(power=enum(on));
// ----------------------------------------------------------------------

#[tokio::test]
async fn s3_attimer_action() {
    let mut program = Program::new();
    program.rules.push(Statement::Rule {
        stream: Stream::AtTimer {
            times: vec![Value::Time { hour: 8, minute: 0, second: 0 }],
            expiration: None,
            schema: None,
        },
        actions: vec![Action::Invocation {
            invocation: Invocation::new(DeviceSelector::new("com.lightbulb"), "set_power")
                .with_param("power", Value::Enum { value: "on".to_string() }),
            schema: None,
        }],
    });

    let compiled = compiled(program).await;
    let code = &compiled.rules[0];
    assert!(code.contains("new Array(1)"));
    assert!(code.contains("new __builtin.Time(8, 0, 0)"));
    assert!(code.contains("await __env.invokeAtTimer("));
    assert!(code.contains("while (!"));
    assert!(code.contains("await __env.invokeAction(\"com.lightbulb\""));
    assert!(code.contains("\"on\""));
}

// ----------------------------------------------------------------------
// S4: now => sort temperature asc of @org.weather.current() => notify;
// ----------------------------------------------------------------------

fn count_projections(op: &TableOp) -> usize {
    match op {
        TableOp::Map { table, op: inner_op, .. } => {
            let own = usize::from(matches!(inner_op, PointWiseOp::Projection(_)));
            own + count_projections(table)
        }
        TableOp::Filter { table, .. } | TableOp::Reduce { table, .. } => count_projections(table),
        TableOp::CrossJoin { lhs, rhs, .. }
        | TableOp::NestedLoopJoin { lhs, rhs, .. }
        | TableOp::Join { lhs, rhs, .. } => count_projections(lhs) + count_projections(rhs),
        _ => 0,
    }
}

#[tokio::test]
async fn s4_no_projection_when_default_is_empty() {
    let mut program = Program::new();
    program.rules.push(Statement::Command {
        table: Some(Table::Sort {
            table: Box::new(invoke("org.weather", "current")),
            key: SortKey::Field("temperature".to_string()),
            direction: SortDirection::Asc,
            schema: None,
        }),
        actions: vec![Action::Notify { schema: None }],
    });

    let rules = lowered(program).await;
    let StreamOp::InvokeTable { table, .. } = rules[0].stream.as_ref().unwrap() else {
        panic!("expected InvokeTable at the root of a command");
    };
    assert_eq!(count_projections(table), 0, "no observable projection may survive");
    assert!(matches!(
        table.as_ref(),
        TableOp::Reduce { op: ReduceOp::SimpleSort { .. }, .. }
    ));
}

// ----------------------------------------------------------------------
// Property 9: Index[1] of Sort(f, asc) fuses to argmin
// ----------------------------------------------------------------------

#[tokio::test]
async fn index_of_sort_fuses_to_argmin() {
    let mut program = Program::new();
    program.rules.push(Statement::Command {
        table: Some(Table::Index {
            table: Box::new(Table::Sort {
                table: Box::new(invoke("org.weather", "current")),
                key: SortKey::Field("temperature".to_string()),
                direction: SortDirection::Asc,
                schema: None,
            }),
            indices: vec![Value::Number(1.0)],
            schema: None,
        }),
        actions: vec![Action::Notify { schema: None }],
    });

    let rules = lowered(program).await;
    let StreamOp::InvokeTable { table, .. } = rules[0].stream.as_ref().unwrap() else {
        panic!("expected InvokeTable at the root of a command");
    };
    let TableOp::Reduce { table: inner, op, .. } = table.as_ref() else {
        panic!("expected a Reduce, got {table:?}");
    };
    assert_eq!(
        op,
        &ReduceOp::SimpleArgMinMax {
            operator: "argmin".to_string(),
            field: "temperature".to_string()
        }
    );
    let TableOp::InvokeGet { hints, .. } = inner.as_ref() else {
        panic!("expected the fused reduce directly over the invocation");
    };
    assert_eq!(hints.limit, Some(Value::Number(1.0)));
    assert_eq!(hints.sort, Some(("temperature".to_string(), SortDirection::Asc)));
}

// ----------------------------------------------------------------------
// Property 2: lowering is deterministic
// ----------------------------------------------------------------------

#[tokio::test]
async fn lowering_is_deterministic() {
    let mut program = s1_program();
    let schemas = retriever();
    typecheck_program(&mut program, &schemas).await.unwrap();

    let lowerer = Lowerer::new();
    let first = lowerer.lower_program(&program).unwrap();
    let second = lowerer.lower_program(&program).unwrap();
    assert_eq!(first, second);
}

// ----------------------------------------------------------------------
// Property 5: hints crossing a join arm stay within that arm's schema
// ----------------------------------------------------------------------

#[tokio::test]
async fn join_hints_respect_arm_schemas() {
    let mut program = Program::new();
    program.rules.push(Statement::Command {
        table: Some(Table::Filter {
            table: Box::new(Table::Join {
                lhs: Box::new(invoke("org.weather", "current")),
                rhs: Box::new(invoke("com.twitter", "search")),
                in_params: vec![],
                schema: None,
            }),
            filter: BooleanExpression::and(vec![
                atom("temperature", ">=", Value::Measure { value: 10.0, unit: "C".to_string() }),
                atom("text", "=~", Value::String("weather".to_string())),
            ]),
            schema: None,
        }),
        actions: vec![Action::Notify { schema: None }],
    });

    let rules = lowered(program).await;
    let StreamOp::InvokeTable { table, .. } = rules[0].stream.as_ref().unwrap() else {
        panic!("expected InvokeTable at the root of a command");
    };

    fn check(op: &TableOp) {
        match op {
            TableOp::InvokeGet { invocation, hints, schema, .. } => {
                let schema = schema.as_ref().expect("typechecked leaf");
                if let Some(projection) = &hints.projection {
                    for name in projection {
                        assert!(
                            schema.has_argument(name),
                            "hint {name} leaked into {}",
                            invocation.selector.kind
                        );
                    }
                }
            }
            TableOp::Filter { table, .. }
            | TableOp::Map { table, .. }
            | TableOp::Reduce { table, .. } => check(table),
            TableOp::CrossJoin { lhs, rhs, .. }
            | TableOp::NestedLoopJoin { lhs, rhs, .. }
            | TableOp::Join { lhs, rhs, .. } => {
                check(lhs);
                check(rhs);
            }
            _ => {}
        }
    }
    check(table);
}

// ----------------------------------------------------------------------
// Monitoring an aggregate re-subscribes and recomputes
// ----------------------------------------------------------------------

#[tokio::test]
async fn monitor_of_aggregation_recomputes() {
    let mut program = Program::new();
    program.rules.push(Statement::Rule {
        stream: Stream::Monitor {
            table: Box::new(Table::Aggregation {
                table: Box::new(invoke("org.weather", "current")),
                operator: "avg".to_string(),
                field: "temperature".to_string(),
                alias: None,
                schema: None,
            }),
            args: None,
            schema: None,
        },
        actions: vec![Action::Notify { schema: None }],
    });

    let rules = lowered(program).await;
    let StreamOp::EdgeNew { stream } = rules[0].stream.as_ref().unwrap() else {
        panic!("expected EdgeNew over the recomputed aggregate");
    };
    let StreamOp::InvokeTable { stream: monitor, table, .. } = stream.as_ref() else {
        panic!("expected InvokeTable re-evaluating the aggregate");
    };
    assert!(matches!(monitor.as_ref(), StreamOp::EdgeNew { .. }));
    assert!(matches!(
        table.as_ref(),
        TableOp::Reduce { op: ReduceOp::Average { .. }, .. }
    ));
}

// ----------------------------------------------------------------------
// Unsupported table forms surface NotImplemented
// ----------------------------------------------------------------------

#[tokio::test]
async fn history_is_not_implemented() {
    let mut program = Program::new();
    program.rules.push(Statement::Command {
        table: Some(Table::History {
            base: Value::Number(0.0),
            delta: Value::Number(10.0),
            table: Box::new(invoke("org.weather", "current")),
            schema: None,
        }),
        actions: vec![Action::Notify { schema: None }],
    });

    let schemas = retriever();
    typecheck_program(&mut program, &schemas).await.unwrap();
    let err = Lowerer::new().lower_program(&program).unwrap_err();
    assert!(matches!(err, thingtalk::CompileError::NotImplemented(_)));
}

// ----------------------------------------------------------------------
// Joins, generated IR
// ----------------------------------------------------------------------

#[tokio::test]
async fn cross_join_generated_ir() {
    let mut program = Program::new();
    program.rules.push(Statement::Command {
        table: Some(Table::Join {
            lhs: Box::new(invoke("org.weather", "current")),
            rhs: Box::new(invoke("com.twitter", "search")),
            in_params: vec![],
            schema: None,
        }),
        actions: vec![Action::Notify { schema: None }],
    });

    let compiled = compiled(program).await;
    let code = compiled.command.expect("commands compile into the command function");

    // independent sides: two emitting generators merged by the runtime
    assert_eq!(code.matches("async function(__emit)").count(), 2);
    assert!(code.contains("await __emit("));
    assert!(code.contains("__builtin.tableCrossJoin("));
    assert!(code.contains("await __env.invokeQuery(\"org.weather\""));
    assert!(code.contains("await __env.invokeQuery(\"com.twitter\""));
    assert!(!code.contains("combineOutputTypes"));
    inside_try(&code, "await __env.invokeQuery(\"org.weather\"");
    inside_try(&code, "await __env.invokeQuery(\"com.twitter\"");
}

#[tokio::test]
async fn nested_loop_join_generated_ir() {
    // the join binds a left output into a right input, so the right side
    // re-evaluates per left tuple
    let mut program = Program::new();
    program.rules.push(Statement::Command {
        table: Some(Table::Join {
            lhs: Box::new(invoke("org.weather", "current")),
            rhs: Box::new(invoke("com.twitter", "search")),
            in_params: vec![thingtalk::ast::InputParam::new(
                "query",
                Value::VarRef { name: "condition".to_string() },
            )],
            schema: None,
        }),
        actions: vec![Action::Notify { schema: None }],
    });

    let compiled = compiled(program).await;
    let code = compiled.command.expect("commands compile into the command function");

    assert!(!code.contains("tableCrossJoin"));
    assert!(code.contains("await __env.invokeQuery(\"org.weather\""));
    assert!(code.contains("await __env.invokeQuery(\"com.twitter\""));
    // the bound parameter flows into the inner invocation's args
    assert!(code.contains("[\"query\"]"));
    // both rows merge into one tuple with a combined type tag
    assert!(code.contains("__builtin.combineOutputTypes("));
    inside_try(&code, "await __env.invokeQuery(\"com.twitter\"");
}

#[tokio::test]
async fn device_pushdown_join_generated_ir() {
    let mut program = Program::new();
    program.rules.push(Statement::Command {
        table: Some(Table::Join {
            lhs: Box::new(invoke("org.database", "orders")),
            rhs: Box::new(invoke("org.database", "customers")),
            in_params: vec![],
            schema: None,
        }),
        actions: vec![Action::Notify { schema: None }],
    });

    let compiled = compiled(program).await;
    let code = compiled.command.expect("commands compile into the command function");

    // both sides live on one device that handles its own queries, so the
    // whole join ships as one AST payload
    assert!(code.contains("await __env.invokeDBQuery(\"org.database\""));
    assert!(code.contains("__ast[0]"));
    assert!(!code.contains("invokeQuery"));
    assert!(!code.contains("tableCrossJoin"));
    assert_eq!(compiled.ast_objects.len(), 1);
    assert_eq!(compiled.ast_objects[0]["op"], "join");
    inside_try(&code, "await __env.invokeDBQuery");
}

// ----------------------------------------------------------------------
// Predicates over other devices, generated IR
// ----------------------------------------------------------------------

#[tokio::test]
async fn external_predicate_generated_ir() {
    let mut program = Program::new();
    program.rules.push(Statement::Command {
        table: Some(Table::Filter {
            table: Box::new(invoke("com.twitter", "search")),
            filter: BooleanExpression::External {
                selector: DeviceSelector::new("org.weather"),
                channel: "current".to_string(),
                in_params: vec![],
                filter: Box::new(atom(
                    "temperature",
                    ">=",
                    Value::Measure { value: 30.0, unit: "C".to_string() },
                )),
                schema: None,
            },
            schema: None,
        }),
        actions: vec![Action::Notify { schema: None }],
    });

    let compiled = compiled(program).await;
    let code = compiled.command.expect("commands compile into the command function");

    assert!(code.contains("reportError(\"Failed to invoke get-predicate query\""));
    assert!(code.contains("await __env.invokeQuery(\"org.weather\""));
    assert!(code.contains(" >= "));
    // the predicate stops at the first matching row
    assert!(code.contains("break;"));
    inside_try(&code, "await __env.invokeQuery(\"org.weather\"");
}

#[tokio::test]
async fn comparison_subquery_generated_ir() {
    let mut program = Program::new();
    program.rules.push(Statement::Command {
        table: Some(Table::Filter {
            table: Box::new(invoke("com.twitter", "search")),
            filter: BooleanExpression::ComparisonSubquery {
                lhs: Value::Measure { value: 10.0, unit: "C".to_string() },
                operator: "<=".to_string(),
                rhs: Box::new(Table::Projection {
                    table: Box::new(invoke("org.weather", "current")),
                    args: vec!["temperature".to_string()],
                    computations: vec![],
                    aliases: vec![],
                    schema: None,
                }),
                overload: None,
            },
            schema: None,
        }),
        actions: vec![Action::Notify { schema: None }],
    });

    let compiled = compiled(program).await;
    let code = compiled.command.expect("commands compile into the command function");

    assert!(code.contains("await __env.invokeQuery(\"org.weather\""));
    assert!(code.contains(" <= "));
    assert!(code.contains("break;"));
    inside_try(&code, "await __env.invokeQuery(\"org.weather\"");
}

// ----------------------------------------------------------------------
// Monitoring a join, generated IR (stream union)
// ----------------------------------------------------------------------

#[tokio::test]
async fn monitor_of_join_generated_ir() {
    let mut program = Program::new();
    program.rules.push(Statement::Rule {
        stream: Stream::Monitor {
            table: Box::new(Table::Join {
                lhs: Box::new(invoke("org.weather", "current")),
                rhs: Box::new(invoke("org.thermostat", "temperature")),
                in_params: vec![],
                schema: None,
            }),
            args: None,
            schema: None,
        },
        actions: vec![Action::Notify { schema: None }],
    });

    let compiled = compiled(program).await;
    assert_eq!(compiled.rules.len(), 1);
    let code = &compiled.rules[0];

    // either side changing wakes the union, which re-evaluates the join
    assert!(code.contains("__builtin.streamUnion("));
    assert!(code.contains("await __env.invokeMonitor(\"org.weather\""));
    assert!(code.contains("await __env.invokeMonitor(\"org.thermostat\""));
    assert!(code.contains("__builtin.tableCrossJoin("));
    assert!(code.contains("__builtin.isNewTuple("));
    // one dedup slot per subscription plus one for the recomputed join
    assert_eq!(compiled.states, 3);
    inside_try(code, "await __env.invokeMonitor(\"org.weather\"");
}

// ----------------------------------------------------------------------
// Hints restricted in lowering never lose their type
// ----------------------------------------------------------------------

#[test]
fn default_hints_are_neutral() {
    let hints = QueryInvocationHints::new();
    assert!(hints.projection.is_none());
    assert!(hints.filter.is_true());
    assert!(hints.sort.is_none());
    assert!(hints.limit.is_none());
}
