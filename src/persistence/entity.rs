use serde::{Deserialize, Serialize};
use sqlx::any::AnyArguments;
use sqlx::any::AnyRow;
use sqlx::{Arguments, FromRow};

use crate::persistence::dialect::Dialect;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnType {
    Integer,
    Text,
    Boolean,
    Real,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Column {
    pub name: &'static str,
    pub ty: ColumnType,
    pub nullable: bool,
}

impl Column {
    pub const fn required(name: &'static str, ty: ColumnType) -> Self {
        Self {
            name,
            ty,
            nullable: false,
        }
    }

    pub const fn optional(name: &'static str, ty: ColumnType) -> Self {
        Self {
            name,
            ty,
            nullable: true,
        }
    }
}

/// A bindable value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Boolean(bool),
    Real(f64),
    Text(String),
}

impl SqlValue {
    /// Appends the value to `args`. `hint` types a NULL, which Postgres needs.
    pub(crate) fn add_to(self, args: &mut AnyArguments<'_>, hint: Option<ColumnType>) {
        // Encoding these primitives into AnyArguments cannot fail.
        let _ = match self {
            SqlValue::Integer(v) => args.add(v),
            SqlValue::Boolean(v) => args.add(v),
            SqlValue::Real(v) => args.add(v),
            SqlValue::Text(v) => args.add(v),
            SqlValue::Null => match hint {
                Some(ColumnType::Integer) => args.add(None::<i64>),
                Some(ColumnType::Boolean) => args.add(None::<bool>),
                Some(ColumnType::Real) => args.add(None::<f64>),
                Some(ColumnType::Text) | None => args.add(None::<String>),
            },
        };
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        SqlValue::Integer(value)
    }
}

impl From<bool> for SqlValue {
    fn from(value: bool) -> Self {
        SqlValue::Boolean(value)
    }
}

impl From<f64> for SqlValue {
    fn from(value: f64) -> Self {
        SqlValue::Real(value)
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        SqlValue::Text(value)
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        SqlValue::Text(value.to_string())
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(SqlValue::Null)
    }
}

/// Builds an argument list from plain values.
pub(crate) fn arguments<'q>(values: Vec<(SqlValue, Option<ColumnType>)>) -> AnyArguments<'q> {
    let mut args = AnyArguments::default();
    for (value, hint) in values {
        value.add_to(&mut args, hint);
    }
    args
}

/// A row type stored in its own table with a surrogate integer key.
pub trait Entity: for<'r> FromRow<'r, AnyRow> + Send + Unpin + 'static {
    const TABLE: &'static str;
    const ID_COLUMN: &'static str = "id";

    /// Every column except the id, in the order `values` returns them.
    fn columns() -> &'static [Column];

    fn id(&self) -> Option<i64>;

    fn set_id(&mut self, id: i64);

    fn values(&self) -> Vec<SqlValue>;

    fn column(name: &str) -> Option<&'static Column> {
        Self::columns().iter().find(|c| c.name == name)
    }
}

/// Table metadata captured from an [`Entity`] at registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityDef {
    pub table: &'static str,
    pub id_column: &'static str,
    pub columns: &'static [Column],
}

impl EntityDef {
    pub fn of<T: Entity>() -> Self {
        Self {
            table: T::TABLE,
            id_column: T::ID_COLUMN,
            columns: T::columns(),
        }
    }

    pub fn create_table_sql(&self, dialect: Dialect) -> String {
        let mut columns = vec![format!("{} {}", self.id_column, dialect.identity_column())];
        columns.extend(self.columns.iter().map(|c| {
            format!(
                "{} {}{}",
                c.name,
                dialect.column_type(c.ty),
                if c.nullable { "" } else { " NOT NULL" }
            )
        }));
        format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            self.table,
            columns.join(", ")
        )
    }
}

/// Ordering of a listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sort {
    pub column: String,
    pub ascending: bool,
}

impl Sort {
    pub fn asc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            ascending: true,
        }
    }

    pub fn desc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            ascending: false,
        }
    }
}

/// Equality restriction on one column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub column: String,
    pub value: SqlValue,
}

impl Filter {
    pub fn eq(column: impl Into<String>, value: impl Into<SqlValue>) -> Self {
        Self {
            column: column.into(),
            value: value.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const COLUMNS: &[Column] = &[
        Column::required("name", ColumnType::Text),
        Column::optional("age", ColumnType::Integer),
    ];

    fn def() -> EntityDef {
        EntityDef {
            table: "visitors",
            id_column: "id",
            columns: COLUMNS,
        }
    }

    #[test]
    fn test_create_table_sql_per_dialect() {
        assert_eq!(
            def().create_table_sql(Dialect::Sqlite),
            "CREATE TABLE IF NOT EXISTS visitors (id INTEGER PRIMARY KEY AUTOINCREMENT, name TEXT NOT NULL, age INTEGER)"
        );
        assert_eq!(
            def().create_table_sql(Dialect::Postgres),
            "CREATE TABLE IF NOT EXISTS visitors (id BIGSERIAL PRIMARY KEY, name TEXT NOT NULL, age BIGINT)"
        );
    }

    #[test]
    fn test_sql_value_conversions() {
        assert_eq!(SqlValue::from(3_i64), SqlValue::Integer(3));
        assert_eq!(SqlValue::from("x"), SqlValue::Text("x".to_string()));
        assert_eq!(SqlValue::from(None::<i64>), SqlValue::Null);
        assert_eq!(SqlValue::from(Some(true)), SqlValue::Boolean(true));
    }
}
