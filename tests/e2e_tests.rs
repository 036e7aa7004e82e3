// End-to-end tests driving the crate's public surface (`compile`/`run`/`eval`/
// `builtins`) rather than the VM's internal dispatch loop, covering the
// scenarios in spec §8's table that the inline unit tests don't already
// reach: pipes, compile-once/run-many-envs, and the host bridge's
// `MissingGlobals` contract.

use std::collections::HashMap;

use ruff_core::host::HostValue;
use ruff_core::vm::{RunOptions, RuntimeErrorKind};
use ruff_core::{compile, eval, run, CompileOptions};

fn env_of(pairs: &[(&str, HostValue)]) -> HashMap<String, HostValue> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

#[test]
fn scenario_a_arithmetic_precedence() {
    let result = eval("1 + 2 * 3", RunOptions::new()).expect("eval");
    assert!(matches!(result, HostValue::Int(7)));
}

#[test]
fn scenario_h_pipe_calls_builtin_with_one_arg() {
    let mut env = HashMap::new();
    let len_builtin = ruff_core::builtins().remove("len").expect("len is a default builtin");
    env.insert("len".to_string(), len_builtin);

    let result = eval("[1, 2, 3] | len", RunOptions::new().with_env(env)).expect("eval");
    assert!(matches!(result, HostValue::Int(3)));
}

#[test]
fn scenario_i_and_j_compile_once_run_many_envs() {
    let code = compile(
        "a + b",
        CompileOptions::new().with_global_names(vec!["a".to_string(), "b".to_string()]),
    )
    .expect("compile");

    let full_env = env_of(&[("a", HostValue::Int(10)), ("b", HostValue::Int(20))]);
    let result = run(&code, RunOptions::new().with_env(full_env)).expect("run with full env");
    assert!(matches!(result, HostValue::Int(30)));

    let partial_env = env_of(&[("a", HostValue::Int(10))]);
    let err = run(&code, RunOptions::new().with_env(partial_env)).unwrap_err();
    match err.kind {
        RuntimeErrorKind::MissingGlobals { names } => assert_eq!(names, vec!["b".to_string()]),
        other => panic!("expected MissingGlobals, got {:?}", other),
    }
}

#[test]
fn compile_is_independent_of_the_env_used_at_compile_time() {
    // Testable property #7: the env supplied to `compile` (via global_names)
    // only fixes the *key set*; the values bound at `run` drive the result.
    let code = compile(
        "a * 2",
        CompileOptions::new().with_global_names(vec!["a".to_string()]),
    )
    .expect("compile");

    let env1 = env_of(&[("a", HostValue::Int(5))]);
    let env2 = env_of(&[("a", HostValue::Int(100))]);
    assert!(matches!(run(&code, RunOptions::new().with_env(env1)).unwrap(), HostValue::Int(10)));
    assert!(matches!(run(&code, RunOptions::new().with_env(env2)).unwrap(), HostValue::Int(200)));
}

#[test]
fn non_expression_statement_at_top_level_evaluates_to_nil() {
    // Testable property #6, the "otherwise nil" half.
    let result = eval("let x = 1;", RunOptions::new()).expect("eval");
    assert!(matches!(result, HostValue::Nil));
}

#[test]
fn builtins_includes_always_on_intrinsics() {
    let table = ruff_core::builtins();
    assert!(table.contains_key("len"));
    assert!(table.contains_key("type"));
    assert!(table.contains_key("range"));
    assert!(table.contains_key("map"));
    assert!(table.contains_key("filter"));
}

#[test]
fn undefined_name_reports_did_you_mean() {
    let err = compile("lenn", CompileOptions::new().with_global_names(vec!["len".to_string()]))
        .unwrap_err();
    let rendered = format!("{}", err);
    assert!(rendered.contains("did you mean"), "diagnostic was: {}", rendered);
}

#[test]
fn raw_result_mode_preserves_internal_closure_value() {
    let result = eval("function f() { 1 }", RunOptions::new().with_raw_result()).expect("eval");
    assert!(matches!(result, HostValue::Raw(ruff_core::value::Value::Closure(_))));
}
