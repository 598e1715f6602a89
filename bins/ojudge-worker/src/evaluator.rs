/// Test Evaluator - pure verdict logic
///
/// **Core Responsibility:**
/// Turn raw sandbox outcomes into per-case results and fold them into one verdict.
///
/// **Critical Properties:**
/// - Knows nothing about Docker, Redis or the store
/// - Pure functions: (sandbox outcomes, expected outputs) → verdict
///
/// **Comparison Rules (code mode):**
/// - Every `\n` is removed from the actual output before comparing
/// - The expected output is compared as stored
/// - No other trimming, case folding or numeric tolerance
///
/// **Aggregation Order:**
/// 1. Any runtime failure → RE, message of the first failing case in test order
/// 2. Any timeout → TLE
/// 3. Any mismatch → WA with every case result
/// 4. Otherwise AC with per-metric means rounded to one decimal

use crate::engine::{SandboxError, SandboxOutput};
use lazy_regex::{lazy_regex, Lazy, Regex};
use ojudge_common::types::{Metrics, TestCase, TestCaseResult, Verdict, VerdictKind};
use serde_json::Value;
use tracing::warn;

static RE_TRACEBACK_FILE: Lazy<Regex> =
    lazy_regex!(r#"(Traceback \(most recent call last\):)?\s*File "[^"]+", "#);
static RE_TRACEBACK_HEADER: Lazy<Regex> = lazy_regex!(r"Traceback \(most recent call last\):\s*");
static RE_TIME_STATUS: Lazy<Regex> =
    lazy_regex!(r"(?m)^Command (exited with non-zero status|terminated by signal) \d+\s*$");
static RE_RESOURCE_LINE: Lazy<Regex> = lazy_regex!(r"(?m)^\d+\.\d+ \d+\s*\z");
// Patterns below are anchored on the sandbox mount point, `engine::MOUNT_POINT`
static RE_NODE_HEADER: Lazy<Regex> = lazy_regex!(r"(?m)^/app/[^\s:]+:\d+[ \t]*\n?");
static RE_STACK_FRAME: Lazy<Regex> = lazy_regex!(r"(?m)^[ \t]+at .*:\d+\)?[ \t]*$\n?");
static RE_MOUNT_PATH: Lazy<Regex> = lazy_regex!(r#"/app/[^\s"'()]+"#);

/// CPU time and peak memory reported by `/usr/bin/time -f "%U %M"`
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ResourceUsage {
    /// Milliseconds
    pub time_ms: Option<f64>,
    /// Megabytes
    pub memory_mb: Option<f64>,
}

/// Parse the resource line out of sandbox stderr.
///
/// Numeric tokens are taken in order: the first is CPU seconds, the second
/// peak KB. Anything else on stderr (program output, warnings) is skipped.
pub fn parse_resource_usage(stderr: &str) -> ResourceUsage {
    let mut numbers = stderr
        .split_whitespace()
        .filter_map(|token| token.parse::<f64>().ok())
        .filter(|n| n.is_finite());

    ResourceUsage {
        time_ms: numbers.next().map(|secs| secs * 1000.0),
        memory_mb: numbers.next().map(|kb| kb / 1024.0),
    }
}

fn normalize_output(output: &str) -> String {
    output.replace('\n', "")
}

/// `expected == actual` once every newline is stripped from `actual`
pub fn compare_output(expected: &str, actual: &str) -> bool {
    normalize_output(actual) == expected
}

/// Strip interpreter framing and the resource line from a crash report.
///
/// Python tracebacks lose their `File "..."` framing, Node errors lose the
/// `<path>:<line>` header and `at ...` frames, and any path left under the
/// mount point is dropped. Only the final resource line is removed, so user
/// output with the same shape survives.
pub fn sanitize_error_message(stderr: &str) -> String {
    let cleaned = RE_TIME_STATUS.replace_all(stderr, "");
    let cleaned = RE_RESOURCE_LINE.replace(&cleaned, "");
    let cleaned = RE_TRACEBACK_FILE.replace_all(&cleaned, "");
    let cleaned = RE_TRACEBACK_HEADER.replace_all(&cleaned, "");
    let cleaned = RE_NODE_HEADER.replace_all(&cleaned, "");
    let cleaned = RE_STACK_FRAME.replace_all(&cleaned, "");
    let cleaned = RE_MOUNT_PATH.replace_all(&cleaned, "");
    cleaned.trim().to_string()
}

/// What one test case amounted to, before aggregation
#[derive(Debug, Clone, PartialEq)]
pub enum CaseOutcome {
    /// Ran to completion; the result says AC or WA
    Completed(TestCaseResult),
    /// Non-zero exit, carrying the raw error text
    RuntimeFailure(String),
    TimedOut,
}

/// Which metric a verdict averages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JudgeMode {
    Code,
    Sql,
}

/// Classify one sandbox run against its test case.
/// Infrastructure faults are passed through as errors.
pub fn classify_code_case(
    case: &TestCase,
    outcome: Result<SandboxOutput, SandboxError>,
) -> anyhow::Result<CaseOutcome> {
    match outcome {
        Ok(output) => {
            let accepted = compare_output(&case.expected_output, &output.stdout);
            let mut result = TestCaseResult {
                status: if accepted {
                    VerdictKind::Accepted
                } else {
                    VerdictKind::WrongAnswer
                },
                test_input: Value::String(case.input.clone()),
                expected_output: case.expected_output.clone(),
                real_output: normalize_output(&output.stdout),
                time: None,
                memory: None,
                runtime: None,
            };
            if accepted {
                let usage = parse_resource_usage(&output.stderr);
                result.time = usage.time_ms;
                result.memory = usage.memory_mb;
            }
            Ok(CaseOutcome::Completed(result))
        }
        Err(SandboxError::TimedOut) => Ok(CaseOutcome::TimedOut),
        Err(SandboxError::RuntimeFailure { stderr, .. }) => Ok(CaseOutcome::RuntimeFailure(stderr)),
        Err(SandboxError::Infrastructure(e)) => Err(e),
    }
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// Mean of the present values; `None` when no case reported the metric
fn mean_of<I>(values: I) -> Option<f64>
where
    I: IntoIterator<Item = Option<f64>>,
{
    let (sum, count) = values
        .into_iter()
        .flatten()
        .fold((0.0, 0usize), |(sum, count), v| (sum + v, count + 1));
    if count == 0 {
        None
    } else {
        Some(round1(sum / count as f64))
    }
}

/// Fold per-case outcomes (in test order) into the submission verdict
pub fn aggregate(outcomes: Vec<CaseOutcome>, mode: JudgeMode) -> Verdict {
    if outcomes.is_empty() {
        warn!("No test cases to judge, accepting with empty metrics");
    }

    let mut timed_out = false;
    let mut results = Vec::with_capacity(outcomes.len());

    for outcome in outcomes {
        match outcome {
            CaseOutcome::RuntimeFailure(stderr) => {
                return Verdict::RuntimeError {
                    message: sanitize_error_message(&stderr),
                };
            }
            CaseOutcome::TimedOut => timed_out = true,
            CaseOutcome::Completed(result) => results.push(result),
        }
    }

    if timed_out {
        return Verdict::TimeLimitExceeded;
    }

    if results.iter().any(|r| !r.is_accepted()) {
        return Verdict::WrongAnswer { results };
    }

    let metrics = match mode {
        JudgeMode::Code => Metrics::Code {
            avg_time: mean_of(results.iter().map(|r| r.time)),
            avg_memory: mean_of(results.iter().map(|r| r.memory)),
        },
        JudgeMode::Sql => Metrics::Sql {
            avg_runtime: mean_of(results.iter().map(|r| r.runtime)),
        },
    };

    Verdict::Accepted { metrics, results }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MOUNT_POINT;

    fn make_case(input: &str, expected: &str) -> TestCase {
        TestCase {
            id: 1,
            input: input.to_string(),
            expected_output: expected.to_string(),
        }
    }

    fn ok(stdout: &str, stderr: &str) -> Result<SandboxOutput, SandboxError> {
        Ok(SandboxOutput {
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
        })
    }

    fn completed(case: &TestCase, stdout: &str, stderr: &str) -> CaseOutcome {
        classify_code_case(case, ok(stdout, stderr)).unwrap()
    }

    #[test]
    fn test_parse_resource_usage() {
        let usage = parse_resource_usage("0.02 10240\n");
        assert_eq!(usage.time_ms, Some(20.0));
        assert_eq!(usage.memory_mb, Some(10.0));
    }

    #[test]
    fn test_parse_resource_usage_missing_tokens() {
        assert_eq!(parse_resource_usage(""), ResourceUsage::default());

        let only_time = parse_resource_usage("0.5");
        assert_eq!(only_time.time_ms, Some(500.0));
        assert_eq!(only_time.memory_mb, None);
    }

    #[test]
    fn test_parse_resource_usage_skips_words() {
        let usage = parse_resource_usage("warning: deprecated\n0.10 2048\n");
        assert_eq!(usage.time_ms, Some(100.0));
        assert_eq!(usage.memory_mb, Some(2.0));
    }

    #[test]
    fn test_compare_strips_newlines_from_actual_only() {
        assert!(compare_output("4", "4\n"));
        assert!(compare_output("12", "1\n2\n"));
        assert!(!compare_output("4", "4 \n"));
        assert!(!compare_output("4\n", "4\n"));
    }

    #[test]
    fn test_compare_is_exact_otherwise() {
        assert!(!compare_output("Yes", "yes\n"));
        assert!(!compare_output("1.0", "1\n"));
        assert!(compare_output("", ""));
    }

    #[test]
    fn test_sanitize_python_traceback() {
        let stderr = "Traceback (most recent call last):\n  File \"/app/8c1e.py\", line 1, in <module>\n    print(1/0)\nZeroDivisionError: division by zero\nCommand exited with non-zero status 1\n0.01 9216\n";
        let message = sanitize_error_message(stderr);
        assert!(!message.contains("/app/"));
        assert!(!message.contains("Traceback"));
        assert!(!message.contains("0.01 9216"));
        assert!(!message.contains("Command exited"));
        assert!(message.starts_with("line 1, in <module>"));
        assert!(message.ends_with("ZeroDivisionError: division by zero"));
    }

    #[test]
    fn test_sanitize_node_stack() {
        let stderr = "/app/5f1c.js:1\nthrow new Error('x')\n^\n\nError: x\n    at Object.<anonymous> (/app/5f1c.js:1:7)\n    at Module._compile (node:internal/modules/cjs/loader:1256:14)\nCommand exited with non-zero status 1\n0.03 40000\n";
        let message = sanitize_error_message(stderr);
        assert!(!message.contains("/app/"));
        assert!(!message.contains("node:internal"));
        assert!(!message.contains("0.03 40000"));
        assert_eq!(message, "throw new Error('x')\n^\n\nError: x");
    }

    #[test]
    fn test_sanitize_drops_mount_paths_anywhere() {
        let pattern_matches_mount = RE_MOUNT_PATH.is_match(&format!("{}/x.js", MOUNT_POINT));
        assert!(pattern_matches_mount);
        assert_eq!(
            sanitize_error_message("Error: cannot open /app/data.txt here"),
            "Error: cannot open  here"
        );
    }

    #[test]
    fn test_sanitize_only_strips_trailing_resource_line() {
        let stderr = "ValueError: got 1.5 3\n1.5 3\nCommand exited with non-zero status 1\n0.01 9216\n";
        assert_eq!(sanitize_error_message(stderr), "ValueError: got 1.5 3\n1.5 3");
    }

    #[test]
    fn test_sanitize_keeps_plain_messages() {
        assert_eq!(
            sanitize_error_message("ReferenceError: x is not defined\n"),
            "ReferenceError: x is not defined"
        );
    }

    #[test]
    fn test_accepted_case_carries_metrics() {
        let case = make_case("2 2", "4");
        match completed(&case, "4\n", "0.02 10240") {
            CaseOutcome::Completed(result) => {
                assert_eq!(result.status, VerdictKind::Accepted);
                assert_eq!(result.real_output, "4");
                assert_eq!(result.time, Some(20.0));
                assert_eq!(result.memory, Some(10.0));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_wrong_case_keeps_both_outputs() {
        let case = make_case("5 5", "10");
        match completed(&case, "11\n", "0.01 100") {
            CaseOutcome::Completed(result) => {
                assert_eq!(result.status, VerdictKind::WrongAnswer);
                assert_eq!(result.expected_output, "10");
                assert_eq!(result.real_output, "11");
                assert_eq!(result.test_input, Value::String("5 5".into()));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_sandbox_errors_map_to_outcomes() {
        let case = make_case("", "");
        assert_eq!(
            classify_code_case(&case, Err(SandboxError::TimedOut)).unwrap(),
            CaseOutcome::TimedOut
        );
        assert_eq!(
            classify_code_case(
                &case,
                Err(SandboxError::RuntimeFailure {
                    exit_code: 1,
                    stderr: "boom".into()
                })
            )
            .unwrap(),
            CaseOutcome::RuntimeFailure("boom".into())
        );
        assert!(classify_code_case(
            &case,
            Err(SandboxError::Infrastructure(anyhow::anyhow!("docker down")))
        )
        .is_err());
    }

    #[test]
    fn test_all_pass_averages_rounded() {
        let a = make_case("2 2", "4");
        let b = make_case("3 3", "9");
        let outcomes = vec![
            completed(&a, "4\n", "0.01 1024"),
            completed(&b, "9\n", "0.02 2560"),
        ];

        match aggregate(outcomes, JudgeMode::Code) {
            Verdict::Accepted { metrics, results } => {
                assert_eq!(results.len(), 2);
                assert_eq!(
                    metrics,
                    Metrics::Code {
                        avg_time: Some(15.0),
                        avg_memory: Some(1.8)
                    }
                );
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_missing_metric_is_excluded_from_average() {
        let a = make_case("", "1");
        let outcomes = vec![completed(&a, "1\n", "0.03 2048"), completed(&a, "1\n", "")];

        match aggregate(outcomes, JudgeMode::Code) {
            Verdict::Accepted { metrics, .. } => assert_eq!(
                metrics,
                Metrics::Code {
                    avg_time: Some(30.0),
                    avg_memory: Some(2.0)
                }
            ),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_partial_mismatch_is_wrong_answer_with_all_results() {
        let a = make_case("2 2", "4");
        let b = make_case("5 5", "10");
        let outcomes = vec![completed(&a, "4\n", "0.01 100"), completed(&b, "11\n", "0.01 100")];

        match aggregate(outcomes, JudgeMode::Code) {
            Verdict::WrongAnswer { results } => {
                assert_eq!(results.len(), 2);
                assert_eq!(results[0].status, VerdictKind::Accepted);
                assert_eq!(results[1].status, VerdictKind::WrongAnswer);
                assert_eq!(results[1].expected_output, "10");
                assert_eq!(results[1].real_output, "11");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_timeout_wins_over_wrong_answer() {
        let a = make_case("", "1");
        let outcomes = vec![completed(&a, "2\n", ""), CaseOutcome::TimedOut];
        assert_eq!(aggregate(outcomes, JudgeMode::Code), Verdict::TimeLimitExceeded);
    }

    #[test]
    fn test_runtime_error_wins_over_timeout() {
        let outcomes = vec![
            CaseOutcome::TimedOut,
            CaseOutcome::RuntimeFailure("first\n0.00 100".into()),
            CaseOutcome::RuntimeFailure("second".into()),
        ];
        assert_eq!(
            aggregate(outcomes, JudgeMode::Code),
            Verdict::RuntimeError {
                message: "first".into()
            }
        );
    }

    #[test]
    fn test_sql_mode_averages_runtime() {
        let result = |runtime: f64| TestCaseResult {
            status: VerdictKind::Accepted,
            test_input: Value::Null,
            expected_output: String::new(),
            real_output: String::new(),
            time: None,
            memory: None,
            runtime: Some(runtime),
        };
        let outcomes = vec![
            CaseOutcome::Completed(result(3.0)),
            CaseOutcome::Completed(result(4.25)),
        ];
        match aggregate(outcomes, JudgeMode::Sql) {
            Verdict::Accepted { metrics, .. } => assert_eq!(
                metrics,
                Metrics::Sql {
                    avg_runtime: Some(3.6)
                }
            ),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_empty_case_list_is_accepted_without_metrics() {
        assert_eq!(
            aggregate(Vec::new(), JudgeMode::Code),
            Verdict::Accepted {
                metrics: Metrics::Code {
                    avg_time: None,
                    avg_memory: None
                },
                results: Vec::new(),
            }
        );
    }
}
