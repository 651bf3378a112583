use async_trait::async_trait;
use axum::extract::{FromRequestParts, Request, State};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use log::{error, trace, warn};
use std::sync::Arc;
use tokio::sync::{MappedMutexGuard, Mutex, MutexGuard};

use crate::error::PersistError;
use crate::persistence::service::{PersistService, SessionFactory};
use crate::persistence::session::Session;

/// How a unit of work ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndOutcome {
    /// Nothing was begun.
    Idle,
    Closed,
    /// A transaction was left open and got committed.
    CommittedOpenTransaction,
}

/// Scopes one session to one request. Cloning shares the same scope.
#[derive(Clone)]
pub struct UnitOfWork {
    inner: Arc<Inner>,
}

struct Inner {
    factory: Arc<SessionFactory>,
    slot: Mutex<Option<Session>>,
}

impl UnitOfWork {
    pub fn new(factory: Arc<SessionFactory>) -> Self {
        Self {
            inner: Arc::new(Inner {
                factory,
                slot: Mutex::new(None),
            }),
        }
    }

    pub async fn begin(&self) -> Result<(), PersistError> {
        let mut slot = self.inner.slot.lock().await;
        if slot.is_some() {
            return Err(PersistError::AlreadyBegun);
        }
        *slot = Some(self.inner.factory.open_session()?);
        Ok(())
    }

    pub async fn is_active(&self) -> bool {
        self.inner.slot.lock().await.is_some()
    }

    /// The scope's session, begun on first use.
    pub async fn get(&self) -> Result<MappedMutexGuard<'_, Session>, PersistError> {
        let mut slot = self.inner.slot.lock().await;
        if slot.is_none() {
            *slot = Some(self.inner.factory.open_session()?);
        }
        MutexGuard::try_map(slot, Option::as_mut).map_err(|_| PersistError::OutsideUnitOfWork)
    }

    /// Closes the session. Calling it with nothing begun does nothing.
    pub async fn end(&self) -> Result<EndOutcome, PersistError> {
        let Some(mut session) = self.inner.slot.lock().await.take() else {
            return Ok(EndOutcome::Idle);
        };

        let outcome = if session.is_transaction_active() {
            warn!(
                "Session {} ended its unit of work with an open transaction, committing it",
                session.id()
            );
            session.commit().await?;
            EndOutcome::CommittedOpenTransaction
        } else {
            EndOutcome::Closed
        };

        session.close();
        trace!("Unit of work ended: {:?}", outcome);
        Ok(outcome)
    }
}

impl std::fmt::Debug for UnitOfWork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("unit", &self.inner.factory.unit())
            .finish()
    }
}

/// Middleware wrapping every request in its own unit of work.
pub async fn persist_filter(
    State(persist): State<Arc<PersistService>>,
    mut request: Request,
    next: Next,
) -> Response {
    let uow = match persist.unit_of_work() {
        Ok(uow) => uow,
        Err(e) => {
            error!("Unable to open a unit of work: {}", e);
            return (StatusCode::SERVICE_UNAVAILABLE, "Database unavailable").into_response();
        }
    };

    request.extensions_mut().insert(uow.clone());
    let response = next.run(request).await;

    if let Err(e) = uow.end().await {
        error!("Failed to end unit of work: {}", e);
    }
    response
}

#[async_trait]
impl<S> FromRequestParts<S> for UnitOfWork
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, &'static str);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<UnitOfWork>()
            .cloned()
            .ok_or((StatusCode::INTERNAL_SERVER_ERROR, "No unit of work for this request"))
    }
}
