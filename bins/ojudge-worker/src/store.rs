// Persistence collaborator: problems and test cases in, verdicts out
use anyhow::{Context, Result};
use async_trait::async_trait;
use ojudge_common::types::{
    Problem, ProblemId, SubmissionId, TestCase, TestCaseCategory, VerdictKind,
};
use serde_json::Value;
use sqlx::postgres::PgPool;
use sqlx::types::Json;
use tracing::info;

#[async_trait]
pub trait Store: Send + Sync {
    async fn fetch_problem(&self, problem_id: ProblemId) -> Result<Problem>;

    /// Problem linked to an official submission
    async fn fetch_problem_by_submission(&self, submission_id: SubmissionId) -> Result<Problem>;

    /// Cases of one category, in stable id order
    async fn fetch_test_cases(
        &self,
        problem_id: ProblemId,
        category: TestCaseCategory,
    ) -> Result<Vec<TestCase>>;

    async fn record_accepted(
        &self,
        submission_id: SubmissionId,
        kind: VerdictKind,
        language: &str,
        avg_time: Option<f64>,
        avg_memory: Option<f64>,
    ) -> Result<()>;

    async fn record_rejected(
        &self,
        submission_id: SubmissionId,
        kind: VerdictKind,
        diagnostic: Option<Value>,
    ) -> Result<()>;
}

#[derive(Debug, sqlx::FromRow)]
struct ProblemRow {
    id: i64,
    time_limit: i64,
}

impl From<ProblemRow> for Problem {
    fn from(row: ProblemRow) -> Self {
        Problem {
            id: row.id,
            time_limit_ms: row.time_limit.max(0) as u64,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct TestCaseRow {
    id: i64,
    test_input: Option<String>,
    expected_output: Option<String>,
}

impl From<TestCaseRow> for TestCase {
    fn from(row: TestCaseRow) -> Self {
        TestCase {
            id: row.id,
            input: row.test_input.unwrap_or_default(),
            expected_output: row.expected_output.unwrap_or_default(),
        }
    }
}

/// PostgreSQL store. Each record operation is a single transaction and
/// replaces any result rows left by an earlier delivery of the same job.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Store for PgStore {
    async fn fetch_problem(&self, problem_id: ProblemId) -> Result<Problem> {
        let row: Option<ProblemRow> = sqlx::query_as(
            "SELECT id::bigint AS id, time_limit::bigint AS time_limit FROM problems WHERE id = $1",
        )
        .bind(problem_id)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("Failed to load problem {}", problem_id))?;

        row.map(Problem::from)
            .with_context(|| format!("Problem {} not found", problem_id))
    }

    async fn fetch_problem_by_submission(&self, submission_id: SubmissionId) -> Result<Problem> {
        let row: Option<ProblemRow> = sqlx::query_as(
            "SELECT p.id::bigint AS id, p.time_limit::bigint AS time_limit \
             FROM problems p JOIN submissions s ON s.problem_id = p.id \
             WHERE s.id = $1",
        )
        .bind(submission_id)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("Failed to load problem for submission {}", submission_id))?;

        row.map(Problem::from)
            .with_context(|| format!("No problem linked to submission {}", submission_id))
    }

    async fn fetch_test_cases(
        &self,
        problem_id: ProblemId,
        category: TestCaseCategory,
    ) -> Result<Vec<TestCase>> {
        let rows: Vec<TestCaseRow> = sqlx::query_as(
            "SELECT id::bigint AS id, test_input::text AS test_input, expected_output::text AS expected_output \
             FROM problem_test_cases \
             WHERE problem_id = $1 AND field_name = $2 \
             ORDER BY id",
        )
        .bind(problem_id)
        .bind(category.as_str())
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("Failed to load {} cases of problem {}", category, problem_id))?;

        Ok(rows.into_iter().map(TestCase::from).collect())
    }

    async fn record_accepted(
        &self,
        submission_id: SubmissionId,
        kind: VerdictKind,
        language: &str,
        avg_time: Option<f64>,
        avg_memory: Option<f64>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await.context("Failed to open transaction")?;

        sqlx::query("UPDATE submissions SET status = $1 WHERE id = $2")
            .bind(kind.as_str())
            .bind(submission_id)
            .execute(&mut *tx)
            .await
            .context("Failed to update submission status")?;

        clear_results(&mut tx, submission_id).await?;

        sqlx::query(
            "INSERT INTO ac_results(submission_id, language, runtime, memory) VALUES ($1, $2, $3, $4)",
        )
        .bind(submission_id)
        .bind(language)
        .bind(avg_time)
        .bind(avg_memory)
        .execute(&mut *tx)
        .await
        .context("Failed to insert accepted result")?;

        tx.commit().await.context("Failed to commit accepted result")?;
        info!(
            submitted_id = submission_id,
            "Successfully updated status and inserted the accepted result"
        );
        Ok(())
    }

    async fn record_rejected(
        &self,
        submission_id: SubmissionId,
        kind: VerdictKind,
        diagnostic: Option<Value>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await.context("Failed to open transaction")?;

        sqlx::query("UPDATE submissions SET status = $1 WHERE id = $2")
            .bind(kind.as_str())
            .bind(submission_id)
            .execute(&mut *tx)
            .await
            .context("Failed to update submission status")?;

        clear_results(&mut tx, submission_id).await?;

        sqlx::query("INSERT INTO wa_re_results(submission_id, error) VALUES ($1, $2)")
            .bind(submission_id)
            .bind(diagnostic.map(Json))
            .execute(&mut *tx)
            .await
            .context("Failed to insert rejected result")?;

        tx.commit().await.context("Failed to commit rejected result")?;
        info!(
            submitted_id = submission_id,
            status = %kind,
            "Successfully updated status and inserted the WA/RE result"
        );
        Ok(())
    }
}

/// Drop result rows from a previous delivery so a redelivered job overwrites
async fn clear_results(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    submission_id: SubmissionId,
) -> Result<()> {
    sqlx::query("DELETE FROM ac_results WHERE submission_id = $1")
        .bind(submission_id)
        .execute(&mut **tx)
        .await
        .context("Failed to clear accepted results")?;
    sqlx::query("DELETE FROM wa_re_results WHERE submission_id = $1")
        .bind(submission_id)
        .execute(&mut **tx)
        .await
        .context("Failed to clear rejected results")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_problem_row_conversion() {
        let problem = Problem::from(ProblemRow {
            id: 4,
            time_limit: 1500,
        });
        assert_eq!(problem.id, 4);
        assert_eq!(problem.time_limit_ms, 1500);

        let negative = Problem::from(ProblemRow {
            id: 4,
            time_limit: -1,
        });
        assert_eq!(negative.time_limit_ms, 0);
    }

    #[test]
    fn test_case_row_conversion_defaults_nulls() {
        let case = TestCase::from(TestCaseRow {
            id: 9,
            test_input: None,
            expected_output: Some("3".to_string()),
        });
        assert_eq!(case.input, "");
        assert_eq!(case.expected_output, "3");
    }

    /// Needs a PostgreSQL database with the judge schema at DATABASE_URL
    #[tokio::test]
    #[ignore]
    async fn test_pg_store_round_trip() {
        let url = std::env::var("DATABASE_URL").unwrap();
        let pool = PgPool::connect(&url).await.unwrap();
        let store = PgStore::new(pool);

        let cases = store
            .fetch_test_cases(1, TestCaseCategory::Example)
            .await
            .unwrap();
        let ids: Vec<i64> = cases.iter().map(|c| c.id).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
    }
}
