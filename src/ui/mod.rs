//! Server-side pages, shared resources and the per-visitor state they keep.

pub mod html;
pub mod page;
pub mod resource;
pub mod state;

use axum::Router;

use crate::inject::AppContext;

pub use page::{Mounts, Page, PageContext, PageError, PageRegistry, PageResponse};
pub use resource::{HealthCheck, Resource, ResourceRegistry, HEALTH_CHECK_ID};
pub use state::{Snapshot, StateError, VisitorStore};

/// What the builder collects for the HTTP server.
#[derive(Default)]
pub struct WebParts {
    pub pages: PageRegistry,
    pub resources: ResourceRegistry,
    pub routers: Vec<Router<AppContext>>,
}
