use log::debug;
use serde::{Deserialize, Serialize};
use sqlx::any::AnyRow;
use sqlx::{FromRow, Row, ValueRef};
use std::fmt;
use std::marker::PhantomData;

use crate::durable::DurableSession;
use crate::error::PersistError;
use crate::persistence::{Column, ColumnType, Entity, Filter, Sort, SqlValue};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Company {
    pub id: i64,
    pub name: String,
    pub street: String,
    pub city: String,
    pub state: String,
    pub zip: String,
}

impl Entity for Company {
    const TABLE: &'static str = "companies";

    fn columns() -> &'static [Column] {
        const COLUMNS: &[Column] = &[
            Column::required("name", ColumnType::Text),
            Column::required("street", ColumnType::Text),
            Column::required("city", ColumnType::Text),
            Column::required("state", ColumnType::Text),
            Column::required("zip", ColumnType::Text),
        ];
        COLUMNS
    }

    fn id(&self) -> Option<i64> {
        (self.id > 0).then_some(self.id)
    }

    fn set_id(&mut self, id: i64) {
        self.id = id;
    }

    fn values(&self) -> Vec<SqlValue> {
        vec![
            self.name.clone().into(),
            self.street.clone().into(),
            self.city.clone().into(),
            self.state.clone().into(),
            self.zip.clone().into(),
        ]
    }
}

impl fmt::Display for Company {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Person {
    pub id: i64,
    pub name: String,
    pub email: String,
    pub phone: String,
    pub company_id: Option<i64>,
}

// The Any driver reports a NULL column with its own type, which Option<i64> refuses.
impl<'r> FromRow<'r, AnyRow> for Person {
    fn from_row(row: &'r AnyRow) -> Result<Self, sqlx::Error> {
        let company_id = if row.try_get_raw("company_id")?.is_null() {
            None
        } else {
            Some(row.try_get("company_id")?)
        };
        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            email: row.try_get("email")?,
            phone: row.try_get("phone")?,
            company_id,
        })
    }
}

impl Entity for Person {
    const TABLE: &'static str = "people";

    fn columns() -> &'static [Column] {
        const COLUMNS: &[Column] = &[
            Column::required("name", ColumnType::Text),
            Column::required("email", ColumnType::Text),
            Column::required("phone", ColumnType::Text),
            Column::optional("company_id", ColumnType::Integer),
        ];
        COLUMNS
    }

    fn id(&self) -> Option<i64> {
        (self.id > 0).then_some(self.id)
    }

    fn set_id(&mut self, id: i64) {
        self.id = id;
    }

    fn values(&self) -> Vec<SqlValue> {
        vec![
            self.name.clone().into(),
            self.email.clone().into(),
            self.phone.clone().into(),
            self.company_id.into(),
        ]
    }
}

impl fmt::Display for Person {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <{}>", self.name, self.email)
    }
}

/// Pages through one entity table ordered by name. Lives in page state, so it holds
/// its session through a [`DurableSession`].
#[derive(Serialize, Deserialize)]
#[serde(bound = "")]
pub struct DataProvider<T: Entity> {
    session: DurableSession,
    filter: Option<Filter>,
    ascending: bool,
    #[serde(skip)]
    entity: PhantomData<fn() -> T>,
}

impl<T: Entity> DataProvider<T> {
    pub fn new(session: DurableSession) -> Self {
        Self {
            session,
            filter: None,
            ascending: true,
            entity: PhantomData,
        }
    }

    pub fn filtered(session: DurableSession, filter: Filter) -> Self {
        Self {
            filter: Some(filter),
            ..Self::new(session)
        }
    }

    pub fn filter(&self) -> Option<&Filter> {
        self.filter.as_ref()
    }

    pub fn is_ascending(&self) -> bool {
        self.ascending
    }

    pub fn set_ascending(&mut self, ascending: bool) {
        self.ascending = ascending;
    }

    /// `count` rows starting at `first`, read inside their own transaction.
    pub async fn iterator(&self, first: u64, count: u64) -> Result<Vec<T>, PersistError> {
        let sort = if self.ascending {
            Sort::asc("name")
        } else {
            Sort::desc("name")
        };
        debug!(
            "Listing {} ordered by name {}",
            T::TABLE,
            if self.ascending { "ascending" } else { "descending" }
        );

        let mut session = self.session.get().await?;
        session.begin_transaction().await?;
        let rows = session
            .list::<T>(self.filter.as_ref(), Some(&sort), first, count)
            .await;
        session.finish(rows).await
    }

    pub async fn size(&self) -> Result<u64, PersistError> {
        let mut session = self.session.get().await?;
        let count = session.count::<T>(self.filter.as_ref()).await?;
        Ok(count.max(0) as u64)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::persistence::{EntityDef, PersistService};
    use crate::settings::DatabaseSettings;
    use tempfile::TempDir;

    pub(crate) fn crm_db(dir: &TempDir) -> DatabaseSettings {
        DatabaseSettings {
            url: Some(format!(
                "sqlite://{}?mode=rwc",
                dir.path().join("crm.db").display()
            )),
            max_active: 4,
            min_idle: 0,
            initial_size: 1,
            create_schema: true,
            entities: vec![EntityDef::of::<Company>(), EntityDef::of::<Person>()],
            ..Default::default()
        }
    }

    fn company(name: &str) -> Company {
        Company {
            name: name.to_string(),
            street: "1 Main St".to_string(),
            city: "Springfield".to_string(),
            state: "IL".to_string(),
            zip: "62701".to_string(),
            ..Default::default()
        }
    }

    fn person(name: &str, company_id: Option<i64>) -> Person {
        Person {
            name: name.to_string(),
            email: format!("{}@example.com", name.to_lowercase()),
            phone: "555-0100".to_string(),
            company_id,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_providers_sort_and_filter_by_company() {
        let dir = TempDir::new().unwrap();
        let service = PersistService::new("crm-data", crm_db(&dir));
        service.start().await.unwrap();

        let uow = service.unit_of_work().unwrap();
        let (acme, globex) = {
            let mut session = uow.get().await.unwrap();
            let acme = session.persist(&mut company("Acme")).await.unwrap();
            let globex = session.persist(&mut company("Globex")).await.unwrap();
            for (name, at) in [("Zed", acme), ("Amy", acme), ("Bob", globex)] {
                session.persist(&mut person(name, Some(at))).await.unwrap();
            }
            session.persist(&mut person("Solo", None)).await.unwrap();
            (acme, globex)
        };
        uow.end().await.unwrap();

        let mut companies = DataProvider::<Company>::new(service.durable_session());
        assert_eq!(companies.size().await.unwrap(), 2);
        companies.set_ascending(false);
        let names: Vec<_> = companies
            .iterator(0, 20)
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names, vec!["Globex", "Acme"]);

        let people = DataProvider::<Person>::filtered(
            service.durable_session(),
            Filter::eq("company_id", acme),
        );
        assert_eq!(people.size().await.unwrap(), 2);
        let names: Vec<_> = people
            .iterator(0, 1)
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.name)
            .collect();
        assert_eq!(names, vec!["Amy"]);

        let everyone = DataProvider::<Person>::new(service.durable_session());
        let listed = everyone.iterator(0, 20).await.unwrap();
        assert_eq!(listed.len(), 4);
        let solo = listed.iter().find(|p| p.name == "Solo").unwrap();
        assert_eq!(solo.company_id, None);
        assert_eq!(listed[0].company_id, Some(acme));

        // the provider survives a trip through serialized page state
        let json = serde_json::to_string(&people).unwrap();
        let restored: DataProvider<Person> = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.filter(), Some(&Filter::eq("company_id", acme)));
        assert_eq!(restored.size().await.unwrap(), 2);
        assert_ne!(globex, acme);

        drop((companies, people, restored, everyone));
        service.stop().await.unwrap();
    }
}
