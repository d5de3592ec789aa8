//! End-to-end graph construction and teardown, exercised through the
//! public `dsl`/`core::runtime` API rather than any single stage's unit
//! tests (spec §8's concrete scenarios and shutdown invariants).

use std::collections::HashMap;
use std::time::Duration;

use speechflow::core::registry::Registry;
use speechflow::core::runtime::GraphRuntime;
use speechflow::core::shutdown::{ShutdownHandle, ShutdownReason};
use speechflow::dsl;
use speechflow::stages;

fn registry_with_builtins() -> Registry {
    let registry = Registry::new();
    stages::register_builtin_stages(&registry);
    registry
}

/// Scenario 1 (two-stage pass-through), built through the same
/// expression DSL and five-pass runtime a CLI invocation uses. The
/// `-` stdin/stdout convention itself is covered by `stages::io`'s own
/// unit tests; this exercises the surrounding graph machinery with
/// real files standing in for stdio.
#[tokio::test]
async fn two_stage_pass_through_reproduces_input_verbatim() {
    let dir = std::env::temp_dir().join(format!("speechflow-it-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    let input_path = dir.join("in.txt");
    let output_path = dir.join("out.txt");
    std::fs::write(&input_path, "hello\n").unwrap();

    let expr = format!(
        "text_source(\"{}\") | text_sink(\"{}\")",
        input_path.display(),
        output_path.display()
    );
    let registry = registry_with_builtins();
    let spec = dsl::parse_pipeline(&expr, &[], &HashMap::new()).unwrap();

    let shutdown = ShutdownHandle::new();
    let runtime = GraphRuntime::build(spec, &registry, shutdown).await.unwrap();
    let reason = runtime.run().await.unwrap();

    assert_eq!(reason, ShutdownReason::Finished);
    assert_eq!(reason.exit_code(), 0);
    let output = std::fs::read_to_string(&output_path).unwrap();
    assert_eq!(output, "hello\n");

    std::fs::remove_dir_all(&dir).ok();
}

/// An unknown stage type is rejected before anything is opened, and the
/// build call itself returns the error rather than panicking or hanging.
#[tokio::test]
async fn build_rejects_a_graph_with_an_unknown_stage_type() {
    let registry = registry_with_builtins();
    let expr = "nonexistent_stage_type()";
    let spec = dsl::parse_pipeline(expr, &[], &HashMap::new()).unwrap();

    let shutdown = ShutdownHandle::new();
    let err = GraphRuntime::build(spec, &registry, shutdown).await.unwrap_err();
    assert!(err.to_string().contains("unknown stage type"));
}

/// Shutdown is single-shot (spec §8): triggering it twice in a row has
/// no additional effect, and a runtime that observes it mid-run tears
/// down exactly once.
#[tokio::test]
async fn shutdown_handle_trigger_is_idempotent_across_concurrent_callers() {
    let shutdown = ShutdownHandle::new();
    shutdown.trigger(ShutdownReason::Interrupt);
    shutdown.trigger(ShutdownReason::Terminate);

    assert!(shutdown.is_triggered());
    assert_eq!(shutdown.reason(), Some(ShutdownReason::Interrupt));

    tokio::time::timeout(Duration::from_millis(100), shutdown.triggered())
        .await
        .expect("already-triggered handle resolves immediately");
}
