use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

pub type SubmissionId = i64;
pub type ProblemId = i64;

/// Language tag that routes a submission to the SQL judge instead of a sandbox image
pub const SQL_LANGUAGE: &str = "mysql";

/// Queue job payload shared by producers and workers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submitted_id: Option<SubmissionId>,
    pub problem_id: ProblemId,
    pub language: String,
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enqueued_at: Option<DateTime<Utc>>,
}

/// Where the verdict of a job goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobMode {
    /// Official submission: the verdict is written to the store
    Persisted(SubmissionId),
    /// Test run: the verdict is pushed back to the client session
    Interactive(String),
}

impl JobRequest {
    /// A submission id wins over a session token; a job with neither is malformed.
    pub fn mode(&self) -> Option<JobMode> {
        match (&self.submitted_id, &self.session_token) {
            (Some(id), _) => Some(JobMode::Persisted(*id)),
            (None, Some(token)) => Some(JobMode::Interactive(token.clone())),
            (None, None) => None,
        }
    }

    pub fn is_sql(&self) -> bool {
        self.language.eq_ignore_ascii_case(SQL_LANGUAGE)
    }

    /// Short label used in log lines
    pub fn label(&self) -> String {
        match self.mode() {
            Some(JobMode::Persisted(id)) => format!("submitted ID: {}", id),
            Some(JobMode::Interactive(token)) => format!("session: {}", token),
            None => format!("problem: {}", self.problem_id),
        }
    }
}

/// Test case category as stored alongside each problem
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestCaseCategory {
    /// Hidden cases used for official judging
    Test,
    /// Sample cases shown to users and used for test runs
    Example,
}

impl TestCaseCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            TestCaseCategory::Test => "test",
            TestCaseCategory::Example => "example",
        }
    }
}

impl fmt::Display for TestCaseCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestCase {
    pub id: i64,
    /// Plain stdin text, or a JSON object of table name to rows for SQL problems
    pub input: String,
    /// Plain text, or a JSON array of row objects for SQL problems
    pub expected_output: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Problem {
    pub id: ProblemId,
    pub time_limit_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VerdictKind {
    #[serde(rename = "AC")]
    Accepted,
    #[serde(rename = "WA")]
    WrongAnswer,
    #[serde(rename = "RE")]
    RuntimeError,
    #[serde(rename = "TLE")]
    TimeLimitExceeded,
}

impl VerdictKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerdictKind::Accepted => "AC",
            VerdictKind::WrongAnswer => "WA",
            VerdictKind::RuntimeError => "RE",
            VerdictKind::TimeLimitExceeded => "TLE",
        }
    }
}

impl fmt::Display for VerdictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one test case that ran to completion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestCaseResult {
    /// Either `AC` or `WA`; crashes and timeouts never produce a per-case result
    pub status: VerdictKind,
    pub test_input: Value,
    pub expected_output: String,
    pub real_output: String,
    /// CPU time in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<f64>,
    /// Peak resident memory in megabytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<f64>,
    /// Query wall time in milliseconds (SQL problems)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime: Option<f64>,
}

impl TestCaseResult {
    pub fn is_accepted(&self) -> bool {
        self.status == VerdictKind::Accepted
    }
}

/// Averaged performance of an accepted submission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Metrics {
    #[serde(rename_all = "camelCase")]
    Code {
        avg_time: Option<f64>,
        avg_memory: Option<f64>,
    },
    #[serde(rename_all = "camelCase")]
    Sql { avg_runtime: Option<f64> },
}

impl Metrics {
    /// `(runtime, memory)` columns of an accepted-result row
    pub fn runtime_and_memory(&self) -> (Option<f64>, Option<f64>) {
        match self {
            Metrics::Code {
                avg_time,
                avg_memory,
            } => (*avg_time, *avg_memory),
            Metrics::Sql { avg_runtime } => (*avg_runtime, Some(0.0)),
        }
    }
}

/// Final judgement of one submission
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Accepted {
        metrics: Metrics,
        results: Vec<TestCaseResult>,
    },
    WrongAnswer {
        results: Vec<TestCaseResult>,
    },
    RuntimeError {
        message: String,
    },
    TimeLimitExceeded,
}

impl Verdict {
    pub fn kind(&self) -> VerdictKind {
        match self {
            Verdict::Accepted { .. } => VerdictKind::Accepted,
            Verdict::WrongAnswer { .. } => VerdictKind::WrongAnswer,
            Verdict::RuntimeError { .. } => VerdictKind::RuntimeError,
            Verdict::TimeLimitExceeded => VerdictKind::TimeLimitExceeded,
        }
    }

    /// Diagnostic stored with a rejected submission.
    /// WA keeps every case, RE keeps the message, TLE keeps nothing.
    pub fn diagnostic(&self) -> Option<Value> {
        match self {
            Verdict::Accepted { .. } | Verdict::TimeLimitExceeded => None,
            Verdict::WrongAnswer { results } => serde_json::to_value(results).ok(),
            Verdict::RuntimeError { message } => Some(Value::String(message.clone())),
        }
    }

    /// Message sent back to an interactive session
    pub fn to_payload(&self) -> VerdictPayload {
        let results = match self {
            Verdict::Accepted { results, .. } | Verdict::WrongAnswer { results } => results
                .iter()
                .filter_map(|r| serde_json::to_value(r).ok())
                .collect(),
            Verdict::RuntimeError { message } => vec![Value::String(message.clone())],
            Verdict::TimeLimitExceeded => Vec::new(),
        };
        VerdictPayload {
            status: self.kind(),
            results,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerdictPayload {
    pub status: VerdictKind,
    pub results: Vec<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn job() -> JobRequest {
        JobRequest {
            submitted_id: None,
            problem_id: 7,
            language: "py".to_string(),
            code: "print(1)".to_string(),
            session_token: None,
            enqueued_at: None,
        }
    }

    fn case(status: VerdictKind, real: &str) -> TestCaseResult {
        TestCaseResult {
            status,
            test_input: json!("1 2"),
            expected_output: "3".to_string(),
            real_output: real.to_string(),
            time: None,
            memory: None,
            runtime: None,
        }
    }

    #[test]
    fn test_job_request_uses_camel_case() {
        let raw = r#"{"submittedId":42,"problemId":7,"language":"py","code":"x"}"#;
        let parsed: JobRequest = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.submitted_id, Some(42));
        assert_eq!(parsed.problem_id, 7);
        assert!(parsed.session_token.is_none());

        let encoded = serde_json::to_value(&parsed).unwrap();
        assert_eq!(encoded["submittedId"], 42);
        assert!(encoded.get("sessionToken").is_none());
    }

    #[test]
    fn test_job_mode() {
        let mut j = job();
        assert_eq!(j.mode(), None);

        j.session_token = Some("abc".to_string());
        assert_eq!(j.mode(), Some(JobMode::Interactive("abc".to_string())));

        j.submitted_id = Some(9);
        assert_eq!(j.mode(), Some(JobMode::Persisted(9)));
    }

    #[test]
    fn test_sql_language_detection() {
        let mut j = job();
        assert!(!j.is_sql());
        j.language = "MySQL".to_string();
        assert!(j.is_sql());
    }

    #[test]
    fn test_verdict_kind_wire_names() {
        assert_eq!(serde_json::to_value(VerdictKind::Accepted).unwrap(), "AC");
        assert_eq!(serde_json::to_value(VerdictKind::TimeLimitExceeded).unwrap(), "TLE");
        assert_eq!(VerdictKind::RuntimeError.to_string(), "RE");
    }

    #[test]
    fn test_result_skips_absent_metrics() {
        let value = serde_json::to_value(case(VerdictKind::WrongAnswer, "4")).unwrap();
        assert_eq!(value["status"], "WA");
        assert_eq!(value["expectedOutput"], "3");
        assert_eq!(value["realOutput"], "4");
        assert!(value.get("time").is_none());
        assert!(value.get("runtime").is_none());
    }

    #[test]
    fn test_diagnostic_per_kind() {
        let wa = Verdict::WrongAnswer {
            results: vec![case(VerdictKind::Accepted, "3"), case(VerdictKind::WrongAnswer, "4")],
        };
        let diag = wa.diagnostic().unwrap();
        assert_eq!(diag.as_array().unwrap().len(), 2);

        let re = Verdict::RuntimeError {
            message: "ZeroDivisionError".to_string(),
        };
        assert_eq!(re.diagnostic(), Some(json!("ZeroDivisionError")));

        assert_eq!(Verdict::TimeLimitExceeded.diagnostic(), None);
    }

    #[test]
    fn test_payload_shapes() {
        let tle = Verdict::TimeLimitExceeded.to_payload();
        assert_eq!(tle.status, VerdictKind::TimeLimitExceeded);
        assert!(tle.results.is_empty());

        let re = Verdict::RuntimeError {
            message: "boom".to_string(),
        }
        .to_payload();
        assert_eq!(re.results, vec![json!("boom")]);

        let ac = Verdict::Accepted {
            metrics: Metrics::Code {
                avg_time: Some(12.5),
                avg_memory: Some(3.2),
            },
            results: vec![case(VerdictKind::Accepted, "3")],
        }
        .to_payload();
        assert_eq!(ac.status, VerdictKind::Accepted);
        assert_eq!(ac.results[0]["realOutput"], "3");
    }

    #[test]
    fn test_sql_metrics_store_zero_memory() {
        let metrics = Metrics::Sql {
            avg_runtime: Some(4.0),
        };
        assert_eq!(metrics.runtime_and_memory(), (Some(4.0), Some(0.0)));
    }
}
