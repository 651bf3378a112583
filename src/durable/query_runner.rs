use serde::{Deserialize, Serialize};
use sqlx::any::AnyRow;
use sqlx::{AnyPool, FromRow};
use std::fmt;

use crate::durable::Recreate;
use crate::error::PersistError;
use crate::persistence::entity::arguments;
use crate::persistence::{lookup_unit, Dialect, SqlValue};

/// Runs plain SQL on the pool, one pooled connection per statement.
#[derive(Debug, Clone)]
pub struct QueryRunner {
    pool: AnyPool,
    dialect: Dialect,
}

impl QueryRunner {
    pub fn new(pool: AnyPool, dialect: Dialect) -> Self {
        Self { pool, dialect }
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub async fn query<T>(&self, sql: &str, params: Vec<SqlValue>) -> Result<Vec<T>, PersistError>
    where
        T: for<'r> FromRow<'r, AnyRow> + Send + Unpin,
    {
        let rows = sqlx::query_as_with::<_, T, _>(sql, untyped(params))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    pub async fn query_one<T>(&self, sql: &str, params: Vec<SqlValue>) -> Result<Option<T>, PersistError>
    where
        T: for<'r> FromRow<'r, AnyRow> + Send + Unpin,
    {
        let row = sqlx::query_as_with::<_, T, _>(sql, untyped(params))
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn query_scalar(&self, sql: &str, params: Vec<SqlValue>) -> Result<i64, PersistError> {
        let value = sqlx::query_scalar_with::<_, i64, _>(sql, untyped(params))
            .fetch_one(&self.pool)
            .await?;
        Ok(value)
    }

    /// Returns the number of affected rows.
    pub async fn update(&self, sql: &str, params: Vec<SqlValue>) -> Result<u64, PersistError> {
        let result = sqlx::query_with(sql, untyped(params))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

fn untyped<'q>(params: Vec<SqlValue>) -> sqlx::any::AnyArguments<'q> {
    arguments(params.into_iter().map(|p| (p, None)).collect())
}

/// Recipe for a query runner on a named persistence unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueryRunnerSource {
    unit: String,
}

impl QueryRunnerSource {
    pub fn new(unit: impl Into<String>) -> Self {
        Self { unit: unit.into() }
    }
}

impl Recreate for QueryRunnerSource {
    type Handle = QueryRunner;

    fn recreate(&self) -> Result<QueryRunner, PersistError> {
        Ok(lookup_unit(&self.unit)?.query_runner())
    }
}

impl fmt::Display for QueryRunnerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "query-runner({})", self.unit)
    }
}

#[cfg(test)]
mod tests {
    use crate::durable::DurableQueryRunner;
    use crate::persistence::service::tests::started_service;
    use crate::persistence::SqlValue;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_query_runner_statements() {
        let dir = TempDir::new().unwrap();
        let service = started_service(&dir, "runner-statements").await;
        let runner = service.query_runner().unwrap();

        let inserted = runner
            .update(
                "INSERT INTO notes (body) VALUES (?1), (?2)",
                vec!["a".into(), "b".into()],
            )
            .await
            .unwrap();
        assert_eq!(inserted, 2);

        let count = runner
            .query_scalar(
                "SELECT COUNT(*) FROM notes WHERE body = ?1",
                vec![SqlValue::from("a")],
            )
            .await
            .unwrap();
        assert_eq!(count, 1);

        let bodies: Vec<(String,)> = runner
            .query("SELECT body FROM notes ORDER BY body", vec![])
            .await
            .unwrap();
        assert_eq!(bodies, vec![("a".to_string(),), ("b".to_string(),)]);

        service.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_durable_runner_survives_a_snapshot() {
        let dir = TempDir::new().unwrap();
        let service = started_service(&dir, "runner-durable").await;

        let json = serde_json::to_string(&service.durable_query_runner()).unwrap();
        let restored: DurableQueryRunner = serde_json::from_str(&json).unwrap();
        assert!(!restored.is_live());

        let count = restored
            .get()
            .await
            .unwrap()
            .query_scalar("SELECT COUNT(*) FROM notes", vec![])
            .await
            .unwrap();
        assert_eq!(count, 0);

        service.stop().await.unwrap();
    }
}
