//! Database access: the persistence service, sessions and per-request units of work.
//!
//! A [`PersistService`] owns one [`SessionFactory`] for the configured persistence unit.
//! Requests run inside a [`UnitOfWork`] installed by [`persist_filter`], which opens a
//! [`Session`] on first use and closes it when the response is produced.

pub mod dialect;
pub mod entity;
pub mod service;
pub mod session;
pub mod unit_of_work;

pub use dialect::Dialect;
pub use entity::{Column, ColumnType, Entity, EntityDef, Filter, Sort, SqlValue};
pub use service::{lookup_unit, PersistService, SessionFactory};
pub use session::Session;
pub use unit_of_work::{persist_filter, EndOutcome, UnitOfWork};
