use async_trait::async_trait;
use axum::http::StatusCode;
use log::{trace, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::error::PersistError;
use crate::inject::{AppContext, InjectError};
use crate::persistence::UnitOfWork;
use crate::ui::state::{Snapshot, StateError, VisitorStore};

const FLASH_KEY: &str = "croquet.flash";

#[derive(Debug, Error)]
pub enum PageError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Method not allowed")]
    MethodNotAllowed,

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Persist(#[from] PersistError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Inject(#[from] InjectError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PageError {
    pub fn status(&self) -> StatusCode {
        match self {
            PageError::NotFound(_) => StatusCode::NOT_FOUND,
            PageError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            PageError::BadRequest(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// What a form submission produces.
#[derive(Debug, Clone, PartialEq)]
pub enum PageResponse {
    Html(String),
    /// Sent as 303 See Other.
    Redirect(String),
}

/// A mounted page. `render` answers GET, `submit` answers POST.
#[async_trait]
pub trait Page: Send + Sync + 'static {
    fn title(&self) -> String {
        "Croquet".to_string()
    }

    /// The page body; the surrounding document is added by the server.
    async fn render(&self, ctx: &mut PageContext) -> Result<String, PageError>;

    async fn submit(&self, _ctx: &mut PageContext) -> Result<PageResponse, PageError> {
        Err(PageError::MethodNotAllowed)
    }
}

#[derive(Default, Clone)]
pub struct PageRegistry {
    pages: BTreeMap<String, Arc<dyn Page>>,
}

impl PageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, id: impl Into<String>, page: impl Page) {
        self.pages.insert(id.into(), Arc::new(page));
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Page>> {
        self.pages.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.pages.contains_key(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.pages.keys().map(String::as_str)
    }
}

/// Mount path to page id, plus the reverse lookup used for links.
#[derive(Debug, Clone, Default)]
pub struct Mounts {
    paths: BTreeMap<String, String>,
}

impl Mounts {
    pub fn new(paths: BTreeMap<String, String>) -> Self {
        Self { paths }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.paths.iter().map(|(p, id)| (p.as_str(), id.as_str()))
    }

    /// The first path mounting `page`, `/` winning over others.
    pub fn path_for(&self, page: &str) -> Option<&str> {
        if self.paths.get("/").is_some_and(|id| id == page) {
            return Some("/");
        }
        self.paths
            .iter()
            .find(|(_, id)| id.as_str() == page)
            .map(|(path, _)| path.as_str())
    }
}

/// Everything a page sees while handling one request.
pub struct PageContext {
    app: AppContext,
    page_id: String,
    visitor: Uuid,
    query: HashMap<String, String>,
    form: HashMap<String, String>,
    uow: Option<UnitOfWork>,
    states: VisitorStore,
    mounts: Arc<Mounts>,
    error: Option<String>,
    stateful: bool,
}

impl PageContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        app: AppContext,
        page_id: String,
        visitor: Uuid,
        query: HashMap<String, String>,
        form: HashMap<String, String>,
        uow: Option<UnitOfWork>,
        states: VisitorStore,
        mounts: Arc<Mounts>,
    ) -> Self {
        Self {
            app,
            page_id,
            visitor,
            query,
            form,
            uow,
            states,
            mounts,
            error: None,
            stateful: false,
        }
    }

    pub fn app(&self) -> &AppContext {
        &self.app
    }

    pub fn page_id(&self) -> &str {
        &self.page_id
    }

    pub fn visitor(&self) -> Uuid {
        self.visitor
    }

    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(String::as_str)
    }

    pub fn form_value(&self, name: &str) -> Option<&str> {
        self.form.get(name).map(String::as_str)
    }

    /// A trimmed, non-empty form value.
    pub fn required(&self, name: &str) -> Result<String, PageError> {
        self.form_value(name)
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .ok_or_else(|| PageError::BadRequest(format!("'{}' is required", name)))
    }

    /// The request's unit of work; absent when no database is configured.
    pub fn unit_of_work(&self) -> Result<&UnitOfWork, PageError> {
        self.uow.as_ref().ok_or(PageError::Inject(InjectError::NoDatabase))
    }

    pub fn url_for(&self, page: &str) -> Option<String> {
        self.mounts.path_for(page).map(str::to_string)
    }

    /// The failure an exception page is rendering.
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub(crate) fn with_error(mut self, page_id: String, message: String) -> Self {
        self.page_id = page_id;
        self.error = Some(message);
        self
    }

    pub(crate) fn is_stateful(&self) -> bool {
        self.stateful
    }

    /// This visitor's saved state for the current page. A snapshot that fails its
    /// fingerprint check is discarded.
    pub async fn load_state<T: DeserializeOwned>(&self) -> Option<T> {
        let snapshot = self.states.get(self.visitor, &self.page_id).await?;
        match snapshot.restore() {
            Ok(state) => Some(state),
            Err(e) => {
                warn!("Discarding state of page '{}': {}", self.page_id, e);
                self.states.remove(self.visitor, &self.page_id).await;
                None
            }
        }
    }

    pub async fn save_state<T: Serialize>(&mut self, state: &T) -> Result<(), PageError> {
        let snapshot = Snapshot::capture(state)?;
        trace!(
            "Saved {} bytes of state for page '{}'",
            snapshot.size(),
            self.page_id
        );
        self.states.put(self.visitor, &self.page_id, snapshot).await;
        self.stateful = true;
        Ok(())
    }

    /// Queues a message shown on the visitor's next rendered page.
    pub async fn flash(&self, message: impl Into<String>) -> Result<(), PageError> {
        let mut messages: Vec<String> = match self.states.get(self.visitor, FLASH_KEY).await {
            Some(snapshot) => snapshot.restore().unwrap_or_default(),
            None => Vec::new(),
        };
        messages.push(message.into());
        self.states
            .put(self.visitor, FLASH_KEY, Snapshot::capture(&messages)?)
            .await;
        Ok(())
    }

    pub(crate) async fn take_messages(&self) -> Vec<String> {
        self.states
            .remove(self.visitor, FLASH_KEY)
            .await
            .and_then(|snapshot| snapshot.restore().ok())
            .unwrap_or_default()
    }
}
