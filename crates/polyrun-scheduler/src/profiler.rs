//! Workload profiler: lexical classification of tasks.
//!
//! Classifies a task into one of the workload profiles using caller hints
//! and a table of `(pattern, effect)` rules matched against the lowercased
//! source. The profiler never executes or parses the code; it is advisory
//! to the runtime selector, which holds its own veto on incompatible
//! selections.
//!
//! # Examples
//!
//! ```
//! use polyrun_core::{Language, LatencyClass, Task, WorkloadProfile};
//! use polyrun_scheduler::profile_task;
//!
//! let task = Task::builder(
//!     "int f(void* packet, int port) { return port > 1024 ? 1 : 0; }",
//!     Language::C,
//! )
//! .latency_class(LatencyClass::UltraLow)
//! .build();
//! assert_eq!(profile_task(&task), WorkloadProfile::SimpleFilter);
//! ```

use polyrun_core::{Complexity, CpuClass, LatencyClass, Task, WorkloadProfile};
use regex::Regex;
use std::sync::LazyLock;

/// Memory hint above which a task counts as memory-intensive: 256 MiB.
const MEMORY_HINT_THRESHOLD: u64 = 256 * 1024 * 1024;

/// Append-call count above which code counts as allocation-heavy.
const APPEND_THRESHOLD: usize = 10;

/// What a matched pattern tells us about the code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PatternEffect {
    /// Code talks to the outside world
    Io,
    /// Code allocates or touches large data
    Memory,
    /// Code loops heavily or recurses
    ComplexLoop,
    /// Code mentions packet-filter vocabulary
    FilterToken,
    /// Code returns a small guarded constant
    FilterShape,
}

/// The pattern table. Extending the profiler is adding a row, not code.
static PATTERNS: LazyLock<Vec<(Regex, PatternEffect)>> = LazyLock::new(|| {
    let table: [(&str, PatternEffect); 13] = [
        // I/O vocabulary and awaited verb calls
        (
            r"\b(fetch|http|request|readfile|writefile|database|query|sql|socket|websocket|stream|pipe)\b|fs\.",
            PatternEffect::Io,
        ),
        (
            r"await\s+[\w.]*\.?(get|post|put|delete|find|save|update)\s*\(",
            PatternEffect::Io,
        ),
        // Large literal allocations and big constants
        (r"\b(with_capacity|new\s+array|vec!\[.*;)\s*\(?\s*\d{5,}", PatternEffect::Memory),
        (r"\b\d{7,}\b", PatternEffect::Memory),
        (r"\b(buffer|blob|arraybuffer)\b", PatternEffect::Memory),
        (r"\b(image|video|audio)\b", PatternEffect::Memory),
        (r"\b(matrix|tensor)\b", PatternEffect::Memory),
        // Nested loops and matrix vocabulary
        (
            r"(?s)\b(for|while)\b[^{};]*\{[^{}]*\b(for|while)\b",
            PatternEffect::ComplexLoop,
        ),
        (r"\b(matrix|multiply)\b|dot\s+product", PatternEffect::ComplexLoop),
        // Filter vocabulary and guarded constant returns
        (
            r"\b(packet|data|buffer|port|protocol)\b|void\s*\*",
            PatternEffect::FilterToken,
        ),
        (
            r"return\s+[^;{}]*?(==|!=|>=|<=|>|<)[^;{}]*?\?\s*(0|1|true|false)\s*:\s*(0|1|true|false)",
            PatternEffect::FilterShape,
        ),
        (
            r"(?s)if\s*\([^)]*(==|!=|>=|<=|>|<)[^)]*\)\s*\{?\s*return\s+(0|1|true|false)\b",
            PatternEffect::FilterShape,
        ),
        (r"\breturn\s+(0|1|true|false)\s*;?\s*\}", PatternEffect::FilterShape),
    ];
    table
        .into_iter()
        .map(|(pattern, effect)| {
            (
                Regex::new(pattern).expect("profiler pattern is valid"),
                effect,
            )
        })
        .collect()
});

/// Lexical traits extracted from one source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CodeTraits {
    /// Looks like a tiny guarded-constant filter
    pub matches_filter: bool,
    /// Talks to the outside world
    pub io: bool,
    /// Allocates or touches large data
    pub memory_heavy: bool,
    /// Nested loops, recursion, or matrix work
    pub complex_loops: bool,
}

/// Extracts lexical traits from source code. Purely textual.
#[must_use]
pub fn analyze_code(code: &str) -> CodeTraits {
    let lowered = code.to_lowercase();

    let mut io = false;
    let mut memory_heavy = false;
    let mut complex_loops = false;
    let mut filter_token = false;
    let mut filter_shape = false;

    for (pattern, effect) in PATTERNS.iter() {
        if pattern.is_match(&lowered) {
            match effect {
                PatternEffect::Io => io = true,
                PatternEffect::Memory => memory_heavy = true,
                PatternEffect::ComplexLoop => complex_loops = true,
                PatternEffect::FilterToken => filter_token = true,
                PatternEffect::FilterShape => filter_shape = true,
            }
        }
    }

    // Repeated appends read as allocation pressure.
    let appends = lowered.matches(".push(").count() + lowered.matches(".append(").count();
    if appends > APPEND_THRESHOLD {
        memory_heavy = true;
    }

    if detects_recursion(&lowered) {
        complex_loops = true;
    }

    CodeTraits {
        // A filter needs both the vocabulary and the guarded-constant
        // shape, and must be free of loops and allocation pressure.
        matches_filter: filter_token && filter_shape && !complex_loops && !memory_heavy,
        io,
        memory_heavy,
        complex_loops,
    }
}

static FUNCTION_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:function|fn|def|func)\s+([a-z_][a-z0-9_]*)")
        .expect("function name pattern is valid")
});

/// Basic recursion heuristic: a defined function's name reappears after
/// its definition.
fn detects_recursion(lowered: &str) -> bool {
    for captures in FUNCTION_NAME.captures_iter(lowered) {
        let Some(name) = captures.get(1) else {
            continue;
        };
        let rest = &lowered[name.end()..];
        if rest.contains(&format!("{}(", name.as_str())) {
            return true;
        }
    }
    false
}

/// Classifies a task; first matching rule wins.
#[must_use]
pub fn profile_task(task: &Task) -> WorkloadProfile {
    let traits = analyze_code(&task.code);

    // Ultra-low-latency requests split on whether the code is a filter.
    if task.latency_class == Some(LatencyClass::UltraLow) {
        if traits.matches_filter {
            return WorkloadProfile::SimpleFilter;
        }
        return WorkloadProfile::ShortCompute;
    }

    if traits.io || task.io_hint == Some(true) {
        return WorkloadProfile::IoIntensive;
    }

    if traits.memory_heavy || task.memory_hint.is_some_and(|hint| hint > MEMORY_HINT_THRESHOLD)
    {
        return WorkloadProfile::MemoryIntensive;
    }

    if task.complexity == Some(Complexity::Complex)
        || traits.complex_loops
        || task.cpu_class == Some(CpuClass::High)
    {
        return WorkloadProfile::HeavyCompute;
    }

    if task.expected_duration_ms.is_some_and(|ms| ms < 1) {
        return WorkloadProfile::ShortCompute;
    }

    if task.language.is_javascript_family() {
        return WorkloadProfile::JavaScript;
    }

    // Conservative default.
    WorkloadProfile::HeavyCompute
}

#[cfg(test)]
mod tests {
    use super::*;
    use polyrun_core::Language;

    #[test]
    fn test_ultra_low_filter_code() {
        let task = Task::builder(
            "int f(void* packet, int n) { return n > 20 ? 1 : 0; }",
            Language::C,
        )
        .latency_class(LatencyClass::UltraLow)
        .build();
        assert_eq!(profile_task(&task), WorkloadProfile::SimpleFilter);
    }

    #[test]
    fn test_ultra_low_non_filter_is_short_compute() {
        let task = Task::builder("int f(int n) { return n * n + 3; }", Language::C)
            .latency_class(LatencyClass::UltraLow)
            .build();
        assert_eq!(profile_task(&task), WorkloadProfile::ShortCompute);
    }

    #[test]
    fn test_io_patterns() {
        let task = Task::builder(
            "async function main() { const r = await fetch('https://api'); return r; }",
            Language::JavaScript,
        )
        .build();
        assert_eq!(profile_task(&task), WorkloadProfile::IoIntensive);

        let hinted = Task::builder("function main() { return 1; }", Language::JavaScript)
            .io_hint(true)
            .build();
        assert_eq!(profile_task(&hinted), WorkloadProfile::IoIntensive);
    }

    #[test]
    fn test_memory_patterns() {
        let task = Task::builder(
            "function main() { const big = new Array(5000000); return big.length; }",
            Language::JavaScript,
        )
        .build();
        assert_eq!(profile_task(&task), WorkloadProfile::MemoryIntensive);

        let hinted = Task::builder("function main() { return 1; }", Language::JavaScript)
            .memory_hint(512 * 1024 * 1024)
            .build();
        assert_eq!(profile_task(&hinted), WorkloadProfile::MemoryIntensive);
    }

    #[test]
    fn test_nested_loops_are_heavy_compute() {
        let task = Task::builder(
            "fn main() { for i in 0..9 { for j in 0..9 { let _ = i * j; } } }",
            Language::Rust,
        )
        .build();
        assert_eq!(profile_task(&task), WorkloadProfile::HeavyCompute);
    }

    #[test]
    fn test_recursion_is_heavy_compute() {
        let task = Task::builder(
            "function fib(n) { return n <= 1 ? n : fib(n - 1) + fib(n - 2); }",
            Language::JavaScript,
        )
        .build();
        let traits = analyze_code(&task.code);
        assert!(traits.complex_loops);
        assert_eq!(profile_task(&task), WorkloadProfile::HeavyCompute);
    }

    #[test]
    fn test_sub_millisecond_hint_is_short_compute() {
        let task = Task::builder("fn main() { 2 + 2; }", Language::Rust)
            .expected_duration_ms(0)
            .build();
        assert_eq!(profile_task(&task), WorkloadProfile::ShortCompute);
    }

    #[test]
    fn test_plain_javascript_profiles_as_javascript() {
        let task = Task::builder("function main() { return 40 + 2; }", Language::JavaScript)
            .build();
        assert_eq!(profile_task(&task), WorkloadProfile::JavaScript);
    }

    #[test]
    fn test_default_is_heavy_compute() {
        let task = Task::builder("fn main() { 40 + 2; }", Language::Rust).build();
        assert_eq!(profile_task(&task), WorkloadProfile::HeavyCompute);
    }

    #[test]
    fn test_repeated_appends_count_as_memory_pressure() {
        let pushes = "xs.push(1); ".repeat(12);
        let code = format!("fn main() {{ let mut xs = vec![]; {pushes} }}");
        let traits = analyze_code(&code);
        assert!(traits.memory_heavy);
    }

    #[test]
    fn test_hint_precedence_io_beats_memory() {
        // Both I/O and memory signals present: I/O wins by precedence.
        let task = Task::builder(
            "async function main() { const r = await fetch(url); const big = new Array(9999999); }",
            Language::JavaScript,
        )
        .build();
        assert_eq!(profile_task(&task), WorkloadProfile::IoIntensive);
    }
}
