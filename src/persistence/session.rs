use itertools::Itertools;
use log::{debug, error, trace};
use sqlx::pool::PoolConnection;
use sqlx::{Any, AnyConnection, Row, Transaction};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::PersistError;
use crate::persistence::dialect::Dialect;
use crate::persistence::entity::{arguments, ColumnType, Entity, Filter, Sort, SqlValue};
use crate::persistence::service::SessionFactory;

/// A unit of database conversation: one connection, at most one open transaction.
pub struct Session {
    id: Uuid,
    factory: Arc<SessionFactory>,
    conn: Option<PoolConnection<Any>>,
    tx: Option<Transaction<'static, Any>>,
    open: bool,
}

impl Session {
    pub(crate) fn new(factory: Arc<SessionFactory>) -> Self {
        let id = Uuid::new_v4();
        trace!("Opened session {} on unit '{}'", id, factory.unit());
        Self {
            id,
            factory,
            conn: None,
            tx: None,
            open: true,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn unit(&self) -> &str {
        self.factory.unit()
    }

    pub fn dialect(&self) -> Dialect {
        self.factory.dialect()
    }

    pub fn is_open(&self) -> bool {
        self.open && self.factory.is_open()
    }

    pub fn is_transaction_active(&self) -> bool {
        self.tx.is_some()
    }

    fn ensure_open(&self) -> Result<(), PersistError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(PersistError::SessionClosed)
        }
    }

    pub async fn begin_transaction(&mut self) -> Result<(), PersistError> {
        self.ensure_open()?;
        if self.tx.is_some() {
            return Err(PersistError::TransactionActive);
        }
        // the transaction brings its own pooled connection
        self.conn = None;
        self.tx = Some(self.factory.pool().begin().await?);
        Ok(())
    }

    pub async fn commit(&mut self) -> Result<(), PersistError> {
        let tx = self.tx.take().ok_or(PersistError::NoTransaction)?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn rollback(&mut self) -> Result<(), PersistError> {
        let tx = self.tx.take().ok_or(PersistError::NoTransaction)?;
        tx.rollback().await?;
        Ok(())
    }

    /// Commits when `result` is Ok, rolls back otherwise. A failed rollback is logged and
    /// the original error returned.
    pub async fn finish<T>(&mut self, result: Result<T, PersistError>) -> Result<T, PersistError> {
        match result {
            Ok(value) => {
                self.commit().await?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = self.rollback().await {
                    error!("Session {} failed to roll back after '{}': {}", self.id, e, rollback);
                }
                Err(e)
            }
        }
    }

    /// The connection statements run on: the transaction's if one is open.
    pub async fn connection(&mut self) -> Result<&mut AnyConnection, PersistError> {
        self.ensure_open()?;
        if let Some(tx) = self.tx.as_mut() {
            return Ok(&mut **tx);
        }
        if self.conn.is_none() {
            self.conn = Some(self.factory.pool().acquire().await?);
        }
        match self.conn.as_mut() {
            Some(conn) => Ok(&mut **conn),
            None => Err(PersistError::SessionClosed),
        }
    }

    /// Releases the connection. An open transaction is rolled back.
    pub fn close(&mut self) {
        if !self.open {
            return;
        }
        if self.tx.take().is_some() {
            debug!("Session {} closed with an open transaction, rolling back", self.id);
        }
        self.conn = None;
        self.open = false;
        trace!("Closed session {}", self.id);
    }

    pub async fn find<T: Entity>(&mut self, id: i64) -> Result<Option<T>, PersistError> {
        let sql = format!(
            "SELECT * FROM {} WHERE {} = {}",
            T::TABLE,
            T::ID_COLUMN,
            self.dialect().placeholder(1)
        );
        let conn = self.connection().await?;
        let row = sqlx::query_as::<_, T>(&sql)
            .bind(id)
            .fetch_optional(conn)
            .await?;
        Ok(row)
    }

    /// Lists `count` rows starting at `first`.
    pub async fn list<T: Entity>(
        &mut self,
        filter: Option<&Filter>,
        sort: Option<&Sort>,
        first: u64,
        count: u64,
    ) -> Result<Vec<T>, PersistError> {
        let dialect = self.dialect();
        let mut sql = format!("SELECT * FROM {}", T::TABLE);
        let mut values = Vec::new();

        if let Some(filter) = filter {
            let ty = column_type::<T>(&filter.column)?;
            sql.push_str(&format!(" WHERE {} = {}", filter.column, dialect.placeholder(1)));
            values.push((filter.value.clone(), Some(ty)));
        }

        match sort {
            Some(sort) => {
                column_type::<T>(&sort.column)?;
                sql.push_str(&format!(
                    " ORDER BY {} {}",
                    sort.column,
                    if sort.ascending { "ASC" } else { "DESC" }
                ));
            }
            None => sql.push_str(&format!(" ORDER BY {}", T::ID_COLUMN)),
        }
        sql.push_str(&format!(" LIMIT {} OFFSET {}", count, first));

        let conn = self.connection().await?;
        let rows = sqlx::query_as_with::<_, T, _>(&sql, arguments(values))
            .fetch_all(conn)
            .await?;
        Ok(rows)
    }

    pub async fn count<T: Entity>(&mut self, filter: Option<&Filter>) -> Result<i64, PersistError> {
        let dialect = self.dialect();
        let mut sql = format!("SELECT COUNT(*) FROM {}", T::TABLE);
        let mut values = Vec::new();

        if let Some(filter) = filter {
            let ty = column_type::<T>(&filter.column)?;
            sql.push_str(&format!(" WHERE {} = {}", filter.column, dialect.placeholder(1)));
            values.push((filter.value.clone(), Some(ty)));
        }

        let conn = self.connection().await?;
        let count = sqlx::query_scalar_with::<_, i64, _>(&sql, arguments(values))
            .fetch_one(conn)
            .await?;
        Ok(count)
    }

    pub async fn count_where<T: Entity>(
        &mut self,
        column: &str,
        value: impl Into<SqlValue>,
    ) -> Result<i64, PersistError> {
        self.count::<T>(Some(&Filter::eq(column, value))).await
    }

    /// Inserts a new row and stores the generated id on the entity.
    pub async fn persist<T: Entity>(&mut self, entity: &mut T) -> Result<i64, PersistError> {
        let dialect = self.dialect();
        let columns = T::columns();
        let names = columns.iter().map(|c| c.name).join(", ");
        let placeholders = (1..=columns.len())
            .map(|i| dialect.placeholder(i))
            .join(", ");
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({}) RETURNING {}",
            T::TABLE,
            names,
            placeholders,
            T::ID_COLUMN
        );
        let values = typed_values(entity);

        let conn = self.connection().await?;
        let row = sqlx::query_with(&sql, arguments(values))
            .fetch_one(conn)
            .await?;
        let id: i64 = row.try_get(0)?;
        entity.set_id(id);
        debug!("Persisted {} #{}", T::TABLE, id);
        Ok(id)
    }

    /// Writes every column of an already persisted entity.
    pub async fn merge<T: Entity>(&mut self, entity: &T) -> Result<(), PersistError> {
        let id = entity.id().ok_or(PersistError::NotPersisted)?;
        let dialect = self.dialect();
        let columns = T::columns();
        let assignments = columns
            .iter()
            .enumerate()
            .map(|(i, c)| format!("{} = {}", c.name, dialect.placeholder(i + 1)))
            .join(", ");
        let sql = format!(
            "UPDATE {} SET {} WHERE {} = {}",
            T::TABLE,
            assignments,
            T::ID_COLUMN,
            dialect.placeholder(columns.len() + 1)
        );
        let mut values = typed_values(entity);
        values.push((id.into(), Some(ColumnType::Integer)));

        let conn = self.connection().await?;
        let result = sqlx::query_with(&sql, arguments(values))
            .execute(conn)
            .await?;
        if result.rows_affected() == 0 {
            return Err(PersistError::NotPersisted);
        }
        debug!("Merged {} #{}", T::TABLE, id);
        Ok(())
    }

    pub async fn remove<T: Entity>(&mut self, entity: &T) -> Result<bool, PersistError> {
        let id = entity.id().ok_or(PersistError::NotPersisted)?;
        let sql = format!(
            "DELETE FROM {} WHERE {} = {}",
            T::TABLE,
            T::ID_COLUMN,
            self.dialect().placeholder(1)
        );
        let conn = self.connection().await?;
        let result = sqlx::query(&sql).bind(id).execute(conn).await?;
        Ok(result.rows_affected() > 0)
    }
}

fn column_type<T: Entity>(name: &str) -> Result<ColumnType, PersistError> {
    if name == T::ID_COLUMN {
        return Ok(ColumnType::Integer);
    }
    T::column(name)
        .map(|c| c.ty)
        .ok_or_else(|| PersistError::UnknownColumn {
            table: T::TABLE.to_string(),
            column: name.to_string(),
        })
}

fn typed_values<T: Entity>(entity: &T) -> Vec<(SqlValue, Option<ColumnType>)> {
    entity
        .values()
        .into_iter()
        .zip(T::columns().iter().map(|c| Some(c.ty)))
        .collect()
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("unit", &self.factory.unit())
            .field("open", &self.open)
            .field("transaction", &self.tx.is_some())
            .finish()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::service::tests::{started_service, Note};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_finish_keeps_the_original_error() {
        let dir = TempDir::new().unwrap();
        let service = started_service(&dir, "session-finish").await;
        let mut session = service.factory().unwrap().open_session().unwrap();

        // no transaction, so the rollback fails as well
        let result: Result<(), _> = session.finish(Err(PersistError::NotPersisted)).await;
        assert!(matches!(result, Err(PersistError::NotPersisted)));

        session.begin_transaction().await.unwrap();
        let mut note = Note {
            id: 0,
            body: "kept".to_string(),
        };
        let persisted = session.persist(&mut note).await;
        assert!(session.finish(persisted).await.is_ok());
        assert!(!session.is_transaction_active());
        assert_eq!(session.count::<Note>(None).await.unwrap(), 1);

        session.close();
        service.stop().await.unwrap();
    }
}
