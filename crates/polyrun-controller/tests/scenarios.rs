//! End-to-end scenarios through the public controller surface.
//!
//! The wasm and filter back-ends run for real; the isolate and
//! interpreter back-ends are scripted contract doubles, since those
//! engines live outside this repository.

use polyrun_backends::testing::ScriptedBackend;
use polyrun_backends::{Backend, EbpfBackend, WasmBackend};
use polyrun_controller::Controller;
use polyrun_core::{
    Capability, ControllerConfig, ExecutionConfig, ExecutionResult, Language, LatencyClass,
    RuntimeKind, Task, TrustLevel,
};
use std::sync::Arc;

const FIB_JS: &str = "function main() { function fib(n) { return n <= 1 ? n : fib(n - 1) + fib(n - 2); } return fib(10); }";

fn full_controller() -> (Controller, Arc<ScriptedBackend>) {
    let v8 = Arc::new(
        ScriptedBackend::builder(RuntimeKind::V8Isolate)
            .language(Language::JavaScript)
            .language(Language::TypeScript)
            .output(serde_json::json!(55))
            .build(),
    );
    let backends: Vec<Arc<dyn Backend>> = vec![
        Arc::new(EbpfBackend::new()),
        Arc::new(WasmBackend::new().unwrap()),
        Arc::clone(&v8) as Arc<dyn Backend>,
    ];
    let controller = Controller::with_backends(ControllerConfig::default(), backends).unwrap();
    (controller, v8)
}

#[tokio::test]
async fn scenario_javascript_fibonacci_lands_on_the_isolate() {
    let (controller, _v8) = full_controller();

    let task = Task::builder(FIB_JS, Language::JavaScript)
        .complexity(polyrun_core::Complexity::Simple)
        .latency_class(LatencyClass::Normal)
        .build();
    let config = ExecutionConfig::builder()
        .timeout_ms(5000)
        .memory_limit_bytes(64 * 1024 * 1024)
        .trust_level(TrustLevel::Medium)
        .capability(Capability::CpuIntensive)
        .build();

    let (result, runtime) = controller
        .execute_with_scheduler(&task, &config)
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.output, Some(serde_json::json!(55)));
    assert_eq!(runtime, RuntimeKind::V8Isolate);

    controller.shutdown().await.unwrap();
}

#[tokio::test]
async fn scenario_ultra_low_latency_c_filter_lands_in_the_kernel_vm() {
    let (controller, _v8) = full_controller();

    let task = Task::builder("int f(void*d,int n){return n>20?1:0;}", Language::C)
        .latency_class(LatencyClass::UltraLow)
        .complexity(polyrun_core::Complexity::Simple)
        .build();
    let config = ExecutionConfig::builder()
        .timeout_ms(100)
        .memory_limit_bytes(1024 * 1024)
        .trust_level(TrustLevel::Low)
        .capability(Capability::NetworkAccess)
        .build();

    let (result, runtime) = controller
        .execute_with_scheduler(&task, &config)
        .await
        .unwrap();

    assert_eq!(runtime, RuntimeKind::Ebpf);
    assert!(result.success);
    assert!(result.execution_time_ms < 10);

    controller.shutdown().await.unwrap();
}

#[tokio::test]
async fn scenario_rust_workload_lands_on_wasm() {
    let (controller, _v8) = full_controller();

    // The rust toolchain output arrives as a wasm artifact.
    let task = Task::builder(
        r#"(module (func (export "main") (result i32) (i32.const 9)))"#,
        Language::Rust,
    )
    .complexity(polyrun_core::Complexity::Moderate)
    .latency_class(LatencyClass::Low)
    .build();
    let config = ExecutionConfig::builder()
        .timeout_ms(5000)
        .memory_limit_bytes(64 * 1024 * 1024)
        .trust_level(TrustLevel::Low)
        .build();

    let (result, runtime) = controller
        .execute_with_scheduler(&task, &config)
        .await
        .unwrap();

    assert_eq!(runtime, RuntimeKind::Wasm);
    assert!(result.success);

    controller.shutdown().await.unwrap();
}

#[tokio::test]
async fn scenario_busy_loop_times_out_within_tolerance() {
    let (controller, _v8) = full_controller();

    let task = Task::builder(
        r#"(module (func (export "main") (result i32) (loop $spin (br $spin)) (i32.const 0)))"#,
        Language::Wasm,
    )
    .build();
    let config = ExecutionConfig::builder()
        .timeout_ms(100)
        .memory_limit_bytes(16 * 1024 * 1024)
        .trust_level(TrustLevel::Low)
        .build();

    let (result, runtime) = controller
        .execute_with_scheduler(&task, &config)
        .await
        .unwrap();

    assert_eq!(runtime, RuntimeKind::Wasm);
    assert!(!result.success);
    assert!(result.error.as_deref().unwrap_or("").contains("timed out"));
    assert!(result.execution_time_ms <= 150);

    controller.shutdown().await.unwrap();
}

#[tokio::test]
async fn scenario_filesystem_read_without_capability_is_denied_and_audited() {
    let (controller, _v8) = full_controller();

    let task = Task::builder(
        r#"(module (func (export "main") (result i32) (i32.const 0)))"#,
        Language::Wasm,
    )
    .build();
    let config = ExecutionConfig::builder()
        .timeout_ms(1000)
        .memory_limit_bytes(16 * 1024 * 1024)
        .trust_level(TrustLevel::Low)
        .build();

    controller
        .execute_with_scheduler(&task, &config)
        .await
        .unwrap();

    // The guest asks for a file; the back-end edge consults the checker.
    let checker = controller.security().checker();
    let ctx = polyrun_security::CapabilityContext::new(&config.permissions)
        .with_path("/etc/passwd");
    assert!(!checker.check(Capability::FileSystemRead, &ctx));

    let denied: Vec<_> = checker
        .audit_snapshot()
        .into_iter()
        .filter(|entry| entry.capability == Capability::FileSystemRead && !entry.granted)
        .collect();
    assert!(!denied.is_empty());

    controller.shutdown().await.unwrap();
}

#[tokio::test]
async fn scenario_only_isolate_enabled_takes_foreign_languages() {
    // The isolate declares support for everything, as engines with
    // transpilation front ends do; execution then fails at its
    // discretion.
    let v8 = Arc::new(
        ScriptedBackend::builder(RuntimeKind::V8Isolate)
            .all_languages()
            .result(ExecutionResult::failure(
                "SyntaxError: unexpected token 'int'",
                1,
                0,
                RuntimeKind::V8Isolate,
            ))
            .build(),
    );
    let controller = Controller::with_backends(
        ControllerConfig::default(),
        vec![Arc::clone(&v8) as Arc<dyn Backend>],
    )
    .unwrap();

    let task = Task::builder("int f(void*d,int n){return n>20?1:0;}", Language::C)
        .latency_class(LatencyClass::UltraLow)
        .build();
    let config = ExecutionConfig::builder()
        .timeout_ms(100)
        .memory_limit_bytes(1024 * 1024)
        .trust_level(TrustLevel::Low)
        .build();

    let (result, runtime) = controller
        .execute_with_scheduler(&task, &config)
        .await
        .unwrap();

    assert_eq!(runtime, RuntimeKind::V8Isolate);
    assert!(!result.success);

    controller.shutdown().await.unwrap();
}
