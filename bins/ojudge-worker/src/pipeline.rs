/// Judge Pipeline - one job from test cases to verdict
///
/// **Flow:**
/// 1. Fetch the problem and its cases (official → `test`, interactive → `example`)
/// 2. Run every case concurrently, waiting for all of them
/// 3. Aggregate the outcomes into a single verdict
///
/// Code submissions are staged to disk before anything else and unstaged
/// exactly once afterwards, whatever happened in between.
///
/// Only infrastructure faults come back as `Err`; everything the submission
/// itself caused is part of the verdict.

use crate::config::LanguageConfigManager;
use crate::engine::{SandboxExecutor, SandboxRequest};
use crate::evaluator::{aggregate, classify_code_case, CaseOutcome, JudgeMode};
use crate::sql::{classify_sql_case, SqlEngine};
use crate::staging::{FileStager, StagedSource};
use crate::store::Store;
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::future::join_all;
use ojudge_common::types::{JobMode, JobRequest, Problem, TestCase, TestCaseCategory, Verdict};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, instrument};

#[async_trait]
pub trait Judge: Send + Sync {
    async fn judge(&self, job: &JobRequest) -> Result<Verdict>;
}

pub struct JudgePipeline {
    store: Arc<dyn Store>,
    sandbox: Arc<dyn SandboxExecutor>,
    stager: Arc<dyn FileStager>,
    sql: Arc<dyn SqlEngine>,
    languages: Arc<LanguageConfigManager>,
}

impl JudgePipeline {
    pub fn new(
        store: Arc<dyn Store>,
        sandbox: Arc<dyn SandboxExecutor>,
        stager: Arc<dyn FileStager>,
        sql: Arc<dyn SqlEngine>,
        languages: Arc<LanguageConfigManager>,
    ) -> Self {
        Self {
            store,
            sandbox,
            stager,
            sql,
            languages,
        }
    }

    async fn load_problem(&self, job: &JobRequest) -> Result<(Problem, Vec<TestCase>)> {
        let (problem, category) = match job.mode() {
            Some(JobMode::Persisted(submission_id)) => (
                self.store.fetch_problem_by_submission(submission_id).await?,
                TestCaseCategory::Test,
            ),
            Some(JobMode::Interactive(_)) => (
                self.store.fetch_problem(job.problem_id).await?,
                TestCaseCategory::Example,
            ),
            None => anyhow::bail!("Job has neither a submission id nor a session token"),
        };

        let cases = self.store.fetch_test_cases(problem.id, category).await?;
        debug!(
            problem_id = problem.id,
            category = %category,
            test_cases = cases.len(),
            time_limit_ms = problem.time_limit_ms,
            "Loaded test cases"
        );
        Ok((problem, cases))
    }

    async fn judge_code(&self, job: &JobRequest) -> Result<Verdict> {
        let path = self
            .stager
            .stage(&job.language, &job.code)
            .await
            .context("Failed to stage source file")?;
        let staged = StagedSource::new(self.stager.clone(), path);

        let verdict = self.run_code_cases(job, staged.path()).await;
        staged.release().await;
        verdict
    }

    async fn run_code_cases(&self, job: &JobRequest, source_path: &Path) -> Result<Verdict> {
        let runtime = self.languages.get_runtime(&job.language)?;
        let (problem, cases) = self.load_problem(job).await?;
        let time_limit_ms = problem.time_limit_ms;

        let runs = cases.iter().enumerate().map(|(index, case)| {
            let sandbox = self.sandbox.clone();
            async move {
                let outcome = sandbox
                    .run(SandboxRequest {
                        runtime,
                        source_path,
                        test_index: index,
                        input: &case.input,
                        time_limit_ms,
                    })
                    .await;
                debug!(test_index = index, ok = outcome.is_ok(), "Test case finished");
                classify_code_case(case, outcome)
            }
        });

        // Every case runs to completion before any fault is reported
        let outcomes = join_all(runs)
            .await
            .into_iter()
            .collect::<Result<Vec<CaseOutcome>>>()?;
        Ok(aggregate(outcomes, JudgeMode::Code))
    }

    async fn judge_sql(&self, job: &JobRequest) -> Result<Verdict> {
        let (problem, cases) = self.load_problem(job).await?;
        let time_limit_ms = problem.time_limit_ms;

        let runs = cases.iter().enumerate().map(|(index, case)| {
            let sql = self.sql.clone();
            async move {
                let outcome = sql.run_query(&job.code, time_limit_ms).await;
                debug!(test_index = index, ok = outcome.is_ok(), "Query finished");
                classify_sql_case(case, outcome)
            }
        });

        let outcomes = join_all(runs)
            .await
            .into_iter()
            .collect::<Result<Vec<CaseOutcome>>>()?;
        Ok(aggregate(outcomes, JudgeMode::Sql))
    }
}

#[async_trait]
impl Judge for JudgePipeline {
    #[instrument(skip_all, fields(problem_id = job.problem_id, language = %job.language))]
    async fn judge(&self, job: &JobRequest) -> Result<Verdict> {
        if job.is_sql() {
            self.judge_sql(job).await
        } else {
            self.judge_code(job).await
        }
    }
}
