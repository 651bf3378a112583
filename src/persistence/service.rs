use log::{debug, info, warn};
use parking_lot::RwLock;
use sqlx::{AnyPool, Executor};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use crate::datasource::DataSourceFactory;
use crate::durable::{DurableQueryRunner, DurableSession, QueryRunner, QueryRunnerSource, SessionSource};
use crate::error::PersistError;
use crate::persistence::dialect::Dialect;
use crate::persistence::entity::EntityDef;
use crate::persistence::session::Session;
use crate::persistence::unit_of_work::UnitOfWork;
use crate::settings::DatabaseSettings;

const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Pool plus entity metadata for one persistence unit. Hands out sessions.
pub struct SessionFactory {
    unit: String,
    pool: AnyPool,
    dialect: Dialect,
    entities: Vec<EntityDef>,
    open: AtomicBool,
}

impl SessionFactory {
    pub fn new(unit: impl Into<String>, pool: AnyPool, dialect: Dialect, entities: Vec<EntityDef>) -> Self {
        Self {
            unit: unit.into(),
            pool,
            dialect,
            entities,
            open: AtomicBool::new(true),
        }
    }

    pub fn unit(&self) -> &str {
        &self.unit
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn entities(&self) -> &[EntityDef] {
        &self.entities
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub fn open_session(self: &Arc<Self>) -> Result<Session, PersistError> {
        if !self.is_open() {
            return Err(PersistError::NotRunning);
        }
        Ok(Session::new(self.clone()))
    }

    pub fn query_runner(&self) -> QueryRunner {
        QueryRunner::new(self.pool.clone(), self.dialect)
    }

    /// Creates a table for every registered entity that does not have one.
    pub async fn create_schema(&self) -> Result<(), PersistError> {
        for entity in &self.entities {
            let sql = entity.create_table_sql(self.dialect);
            debug!("{}", sql);
            self.pool.execute(sql.as_str()).await?;
        }
        Ok(())
    }

    async fn close(&self) {
        self.open.store(false, Ordering::Release);
        // checked out connections are closed as they come back
        if tokio::time::timeout(CLOSE_TIMEOUT, self.pool.close()).await.is_err() {
            warn!(
                "Connections for unit '{}' were still in use after {:?}",
                self.unit, CLOSE_TIMEOUT
            );
        }
    }
}

impl std::fmt::Debug for SessionFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionFactory")
            .field("unit", &self.unit)
            .field("dialect", &self.dialect)
            .field("open", &self.is_open())
            .finish()
    }
}

fn units() -> &'static RwLock<HashMap<String, Arc<SessionFactory>>> {
    static UNITS: OnceLock<RwLock<HashMap<String, Arc<SessionFactory>>>> = OnceLock::new();
    UNITS.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Finds the running session factory for a persistence unit.
pub fn lookup_unit(unit: &str) -> Result<Arc<SessionFactory>, PersistError> {
    units()
        .read()
        .get(unit)
        .filter(|factory| factory.is_open())
        .cloned()
        .ok_or_else(|| PersistError::UnknownUnit(unit.to_string()))
}

pub(crate) fn register_unit(factory: Arc<SessionFactory>) {
    if let Some(previous) = units().write().insert(factory.unit.clone(), factory) {
        if previous.is_open() {
            warn!("Replaced a running session factory for unit '{}'", previous.unit);
        }
    }
}

fn deregister_unit(factory: &Arc<SessionFactory>) {
    let mut units = units().write();
    if units
        .get(&factory.unit)
        .is_some_and(|registered| Arc::ptr_eq(registered, factory))
    {
        units.remove(&factory.unit);
    }
}

/// Owns the session factory for the configured unit. Starts at most once.
pub struct PersistService {
    unit: String,
    settings: DatabaseSettings,
    factory: RwLock<Option<Arc<SessionFactory>>>,
}

impl PersistService {
    pub fn new(unit: impl Into<String>, settings: DatabaseSettings) -> Self {
        Self {
            unit: unit.into(),
            settings,
            factory: RwLock::new(None),
        }
    }

    pub fn unit(&self) -> &str {
        &self.unit
    }

    pub fn is_running(&self) -> bool {
        self.factory.read().as_ref().is_some_and(|f| f.is_open())
    }

    pub async fn start(&self) -> Result<(), PersistError> {
        if self.factory.read().is_some() {
            return Err(PersistError::AlreadyStarted);
        }

        let source = DataSourceFactory::new(&self.settings, &self.unit)?;
        let pool = source.connect().await?;
        let factory = Arc::new(SessionFactory::new(
            self.unit.clone(),
            pool,
            source.dialect(),
            self.settings.entities.clone(),
        ));

        if self.settings.create_schema {
            factory.create_schema().await?;
        }

        {
            let mut slot = self.factory.write();
            if slot.is_some() {
                return Err(PersistError::AlreadyStarted);
            }
            *slot = Some(factory.clone());
        }
        register_unit(factory);

        info!("Persistence unit '{}' started", self.unit);
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), PersistError> {
        let factory = self
            .factory
            .read()
            .clone()
            .filter(|f| f.is_open())
            .ok_or(PersistError::NotRunning)?;

        deregister_unit(&factory);
        factory.close().await;

        info!("Persistence unit '{}' stopped", self.unit);
        Ok(())
    }

    pub fn factory(&self) -> Result<Arc<SessionFactory>, PersistError> {
        self.factory
            .read()
            .clone()
            .filter(|f| f.is_open())
            .ok_or(PersistError::NotRunning)
    }

    /// A fresh unit of work bound to the running factory.
    pub fn unit_of_work(&self) -> Result<UnitOfWork, PersistError> {
        Ok(UnitOfWork::new(self.factory()?))
    }

    pub fn query_runner(&self) -> Result<QueryRunner, PersistError> {
        Ok(self.factory()?.query_runner())
    }

    /// A session surrogate that can live inside serialized page state.
    pub fn durable_session(&self) -> DurableSession {
        DurableSession::new(SessionSource::new(self.unit.clone()))
    }

    pub fn durable_query_runner(&self) -> DurableQueryRunner {
        DurableQueryRunner::new(QueryRunnerSource::new(self.unit.clone()))
    }
}

impl std::fmt::Debug for PersistService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistService")
            .field("unit", &self.unit)
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::persistence::entity::{Column, ColumnType, Entity, SqlValue};
    use sqlx::FromRow;
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, FromRow)]
    pub(crate) struct Note {
        pub id: i64,
        pub body: String,
    }

    impl Entity for Note {
        const TABLE: &'static str = "notes";

        fn columns() -> &'static [Column] {
            const COLUMNS: &[Column] = &[Column::required("body", ColumnType::Text)];
            COLUMNS
        }

        fn id(&self) -> Option<i64> {
            (self.id > 0).then_some(self.id)
        }

        fn set_id(&mut self, id: i64) {
            self.id = id;
        }

        fn values(&self) -> Vec<SqlValue> {
            vec![self.body.clone().into()]
        }
    }

    /// SQLite file settings; each pooled connection to `:memory:` would see its own database.
    pub(crate) fn sqlite_settings(dir: &TempDir) -> DatabaseSettings {
        DatabaseSettings {
            url: Some(format!(
                "sqlite://{}?mode=rwc",
                dir.path().join("test.db").display()
            )),
            max_active: 4,
            min_idle: 0,
            initial_size: 1,
            create_schema: true,
            entities: vec![EntityDef::of::<Note>()],
            ..Default::default()
        }
    }

    pub(crate) async fn started_service(dir: &TempDir, unit: &str) -> PersistService {
        let service = PersistService::new(unit, sqlite_settings(dir));
        service.start().await.unwrap();
        service
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let dir = TempDir::new().unwrap();
        let service = started_service(&dir, "service-start-twice").await;

        assert!(service.is_running());
        assert!(matches!(
            service.start().await,
            Err(PersistError::AlreadyStarted)
        ));

        service.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_requires_running_service() {
        let dir = TempDir::new().unwrap();
        let service = PersistService::new("service-stop", sqlite_settings(&dir));
        assert!(matches!(service.stop().await, Err(PersistError::NotRunning)));

        service.start().await.unwrap();
        service.stop().await.unwrap();
        assert!(!service.is_running());
        assert!(matches!(service.stop().await, Err(PersistError::NotRunning)));
        // a stopped service is not restarted
        assert!(matches!(
            service.start().await,
            Err(PersistError::AlreadyStarted)
        ));
    }

    #[tokio::test]
    async fn test_registry_follows_lifecycle() {
        let dir = TempDir::new().unwrap();
        let service = started_service(&dir, "service-registry").await;

        let factory = lookup_unit("service-registry").unwrap();
        assert_eq!(factory.dialect(), Dialect::Sqlite);

        service.stop().await.unwrap();
        assert!(matches!(
            lookup_unit("service-registry"),
            Err(PersistError::UnknownUnit(_))
        ));
    }

    #[tokio::test]
    async fn test_session_crud() {
        let dir = TempDir::new().unwrap();
        let service = started_service(&dir, "service-crud").await;
        let factory = service.factory().unwrap();
        let mut session = factory.open_session().unwrap();

        session.begin_transaction().await.unwrap();
        let mut note = Note {
            id: 0,
            body: "first".to_string(),
        };
        let id = session.persist(&mut note).await.unwrap();
        assert_eq!(note.id, id);
        session.commit().await.unwrap();

        note.body = "edited".to_string();
        session.merge(&note).await.unwrap();
        let found: Note = session.find(id).await.unwrap().unwrap();
        assert_eq!(found.body, "edited");
        assert_eq!(session.count::<Note>(None).await.unwrap(), 1);

        assert!(session.remove(&note).await.unwrap());
        assert_eq!(session.find::<Note>(id).await.unwrap(), None);

        session.close();
        assert!(matches!(
            session.connection().await,
            Err(PersistError::SessionClosed)
        ));
        service.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_list_rejects_unknown_columns() {
        let dir = TempDir::new().unwrap();
        let service = started_service(&dir, "service-columns").await;
        let mut session = service.factory().unwrap().open_session().unwrap();

        let sort = crate::persistence::Sort::asc("body; DROP TABLE notes");
        let result = session.list::<Note>(None, Some(&sort), 0, 10).await;
        assert!(matches!(result, Err(PersistError::UnknownColumn { .. })));

        drop(session);
        service.stop().await.unwrap();
    }
}
